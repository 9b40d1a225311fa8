//! Subscribe Loop
//!
//! Polls a [`Subscription`], reassembles fragments per session, decodes
//! each complete message and hands the record to a [`RecordHandler`].
//! Empty polls feed the idle strategy; a configured message limit cancels
//! the shared token so the rest of the process winds down with the loop.

use std::fmt;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::assembler::FragmentAssembler;
use super::idle::IdleStrategy;
use super::throughput::Throughput;
use crate::application::ports::{PollError, RateSink, RecordHandler, Subscription};
use crate::domain::market_data::codec::decode;
use crate::domain::market_data::{AVERAGE_FRAME_LEN, RecordKind};
use crate::infrastructure::metrics;

/// Fragments requested per poll unless configured otherwise.
pub const DEFAULT_FRAGMENT_LIMIT: usize = 10;

// =============================================================================
// Configuration
// =============================================================================

/// Subscribe loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeConfig {
    /// Messages after which the loop cancels; zero runs until cancelled.
    pub limit: u64,
    /// Upper bound on fragments per poll.
    pub fragment_limit: usize,
    /// Idle behaviour between polls.
    pub idle: IdleStrategy,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            limit: 0,
            fragment_limit: DEFAULT_FRAGMENT_LIMIT,
            idle: IdleStrategy::backoff(),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Fatal subscribe loop outcomes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    /// The subscription was closed underneath the loop.
    #[error("subscription closed after {received} messages")]
    TransportClosed {
        /// Messages received before the close.
        received: u64,
    },

    /// The transport failed.
    #[error("transport error after {received} messages: {reason}")]
    Transport {
        /// Messages received before the failure.
        received: u64,
        /// Transport diagnostic.
        reason: String,
    },
}

impl SubscribeError {
    fn from_poll(received: u64, err: PollError) -> Self {
        match err {
            PollError::Closed => Self::TransportClosed { received },
            PollError::Failed(reason) => Self::Transport { received, reason },
        }
    }
}

// =============================================================================
// Report
// =============================================================================

/// Outcome of a subscribe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscribeReport {
    /// Messages decoded and dispatched.
    pub received: u64,
    /// Quotes dispatched.
    pub quotes: u64,
    /// Trades dispatched.
    pub trades: u64,
    /// Messages dropped as undecodable.
    pub malformed: u64,
    /// Partial messages discarded because a new one began.
    pub stale_partials: u64,
    /// Time since the first poll that returned fragments.
    pub elapsed: Duration,
}

impl SubscribeReport {
    /// Throughput using the average framed length of the two kinds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn throughput(&self) -> Throughput {
        Throughput::new(
            self.received,
            self.received as f64 * AVERAGE_FRAME_LEN,
            self.elapsed,
        )
    }
}

impl fmt::Display for SubscribeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Total: {}ms, {}", self.elapsed.as_millis(), self.throughput())
    }
}

// =============================================================================
// Loop
// =============================================================================

/// Polls, reassembles, decodes and dispatches.
#[derive(Debug)]
pub struct SubscribeLoop<S> {
    subscription: S,
    assembler: FragmentAssembler,
    config: SubscribeConfig,
}

impl<S: Subscription> SubscribeLoop<S> {
    /// Create a loop over `subscription`.
    #[must_use]
    pub fn new(subscription: S, config: SubscribeConfig) -> Self {
        Self {
            subscription,
            assembler: FragmentAssembler::new(),
            config,
        }
    }

    /// The subscription being polled.
    #[must_use]
    pub const fn subscription(&self) -> &S {
        &self.subscription
    }

    /// Unwrap the subscription.
    #[must_use]
    pub fn into_subscription(self) -> S {
        self.subscription
    }

    /// Run until `cancel` fires or the message limit is reached.
    ///
    /// Every message of the poll that crosses the limit is still delivered.
    ///
    /// # Errors
    ///
    /// Returns a [`SubscribeError`] when the subscription is closed or
    /// fails. Malformed messages are counted and skipped.
    pub fn run<H, R>(
        &mut self,
        handler: &mut H,
        sink: &mut R,
        cancel: &CancellationToken,
    ) -> Result<SubscribeReport, SubscribeError>
    where
        H: RecordHandler + ?Sized,
        R: RateSink + ?Sized,
    {
        let Self {
            subscription,
            assembler,
            config,
        } = self;
        let limit = config.limit;
        let fragment_limit = config.fragment_limit;
        let mut idle = config.idle;
        let mut report = SubscribeReport::default();
        let mut start: Option<Instant> = None;

        tracing::info!(limit, fragment_limit, idle = %idle, "Subscribe loop started");

        while !cancel.is_cancelled() {
            let polled = subscription.poll(
                |header, fragment| {
                    let mut malformed_session = None;
                    assembler.on_fragment(header, fragment, |header, message| {
                        match decode(message) {
                            Ok(record) => {
                                match record.kind() {
                                    RecordKind::Quote => report.quotes += 1,
                                    RecordKind::Trade => report.trades += 1,
                                }
                                report.received += 1;
                                handler.on_record(header, &record);
                                sink.on_message(message.len());
                            }
                            Err(err) => {
                                report.malformed += 1;
                                metrics::record_malformed();
                                tracing::warn!(
                                    session_id = header.session_id,
                                    stream_id = header.stream_id,
                                    len = message.len(),
                                    error = %err,
                                    "Dropping malformed message"
                                );
                                malformed_session = Some(header.session_id);
                            }
                        }
                    });
                    if let Some(session_id) = malformed_session {
                        assembler.reset(session_id);
                    }
                },
                fragment_limit,
            );

            let fragments = match polled {
                Ok(fragments) => fragments,
                Err(err) => {
                    let err = SubscribeError::from_poll(report.received, err);
                    tracing::error!(received = report.received, error = %err, "Subscribe loop aborted");
                    return Err(err);
                }
            };

            if fragments > 0 && start.is_none() {
                start = Some(Instant::now());
            }

            if limit > 0 && report.received >= limit {
                tracing::info!(received = report.received, limit, "Message limit reached");
                cancel.cancel();
                break;
            }

            idle.idle_for(fragments);
        }

        report.elapsed = start.map_or(Duration::ZERO, |start| start.elapsed());
        report.stale_partials = assembler.stale_partials();
        tracing::info!(
            received = report.received,
            malformed = report.malformed,
            elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "Subscribe loop finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;
    use crate::application::ports::{
        FragmentHeader, FrameFlags, MockRateSink, MockRecordHandler, NoopRateSink,
        NoopRecordHandler,
    };
    use crate::application::services::testing::{PollStep, ScriptedSubscription};
    use crate::domain::market_data::codec::encode_frame;
    use crate::domain::market_data::{
        MAX_FRAME_LEN, QUOTE_FRAME_LEN, Record, RecordTemplates, TRADE_FRAME_LEN,
    };

    fn frame(index: u64) -> Vec<u8> {
        let record = RecordTemplates::default().record_for(index, index + 1);
        let mut buf = [0u8; MAX_FRAME_LEN];
        let len = encode_frame(&mut buf, &record).unwrap();
        buf[..len].to_vec()
    }

    fn whole(bytes: Vec<u8>) -> (FragmentHeader, Vec<u8>) {
        (
            FragmentHeader {
                session_id: 1,
                stream_id: 1001,
                flags: FrameFlags::UNFRAGMENTED,
            },
            bytes,
        )
    }

    fn part(flags: FrameFlags, bytes: &[u8]) -> (FragmentHeader, Vec<u8>) {
        (
            FragmentHeader {
                session_id: 1,
                stream_id: 1001,
                flags,
            },
            bytes.to_vec(),
        )
    }

    fn config(limit: u64) -> SubscribeConfig {
        SubscribeConfig {
            limit,
            idle: IdleStrategy::Noop,
            ..SubscribeConfig::default()
        }
    }

    #[test]
    fn dispatches_decoded_records() {
        let cancel = CancellationToken::new();
        let subscription =
            ScriptedSubscription::new([PollStep::Fragments(vec![whole(frame(0)), whole(frame(1))])])
                .cancel_when_drained(cancel.clone());

        let mut handler = MockRecordHandler::new();
        handler
            .expect_on_record()
            .withf(|_, record| matches!(record, Record::Trade(_)))
            .times(1)
            .return_const(());
        handler
            .expect_on_record()
            .withf(|_, record| matches!(record, Record::Quote(_)))
            .times(1)
            .return_const(());

        let mut sink = MockRateSink::new();
        sink.expect_on_message().with(eq(TRADE_FRAME_LEN)).times(1).return_const(());
        sink.expect_on_message().with(eq(QUOTE_FRAME_LEN)).times(1).return_const(());

        let mut subscribe = SubscribeLoop::new(subscription, config(0));
        let report = subscribe.run(&mut handler, &mut sink, &cancel).unwrap();

        assert_eq!(report.received, 2);
        assert_eq!((report.trades, report.quotes), (1, 1));
        assert_eq!(report.malformed, 0);
    }

    #[test]
    fn limit_cancels_and_counts_whole_batch() {
        let cancel = CancellationToken::new();
        let subscription = ScriptedSubscription::new([PollStep::Fragments(vec![
            whole(frame(0)),
            whole(frame(1)),
            whole(frame(2)),
        ])]);

        let mut subscribe = SubscribeLoop::new(subscription, config(2));
        let report = subscribe
            .run(&mut NoopRecordHandler, &mut NoopRateSink, &cancel)
            .unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(report.received, 3);
        assert_eq!(subscribe.subscription().polls, 1);
    }

    #[test]
    fn malformed_message_is_skipped() {
        let cancel = CancellationToken::new();
        let subscription = ScriptedSubscription::new([PollStep::Fragments(vec![
            whole(b"x-not-a-record".to_vec()),
            whole(frame(0)[..12].to_vec()),
            whole(frame(1)),
        ])])
        .cancel_when_drained(cancel.clone());

        let mut handler = MockRecordHandler::new();
        handler.expect_on_record().times(1).return_const(());

        let mut subscribe = SubscribeLoop::new(subscription, config(0));
        let report = subscribe
            .run(&mut handler, &mut NoopRateSink, &cancel)
            .unwrap();

        assert_eq!(report.malformed, 2);
        assert_eq!(report.received, 1);
    }

    #[test]
    fn malformed_reassembled_message_resets_session() {
        let cancel = CancellationToken::new();
        let trade = frame(0);
        let subscription = ScriptedSubscription::new([
            PollStep::Fragments(vec![
                part(FrameFlags::BEGIN, b"x-not-"),
                part(FrameFlags::END, b"a-record"),
            ]),
            PollStep::Fragments(vec![
                part(FrameFlags::BEGIN, &trade[..10]),
                part(FrameFlags::END, &trade[10..]),
            ]),
        ])
        .cancel_when_drained(cancel.clone());

        let mut handler = MockRecordHandler::new();
        handler
            .expect_on_record()
            .withf(|_, record| matches!(record, Record::Trade(_)))
            .times(1)
            .return_const(());

        let mut subscribe = SubscribeLoop::new(subscription, config(0));
        let report = subscribe
            .run(&mut handler, &mut NoopRateSink, &cancel)
            .unwrap();

        assert_eq!(report.malformed, 1);
        assert_eq!(report.received, 1);
        assert_eq!(report.stale_partials, 0);
        assert_eq!(subscribe.assembler.partial_len(1), 0);
        assert_eq!(subscribe.assembler.tracked_sessions(), 0);
    }

    #[test]
    fn reassembles_across_polls() {
        let cancel = CancellationToken::new();
        let quote = frame(1);
        let subscription = ScriptedSubscription::new([
            PollStep::Fragments(vec![part(FrameFlags::BEGIN, &quote[..16])]),
            PollStep::Fragments(vec![
                part(FrameFlags::MIDDLE, &quote[16..32]),
                part(FrameFlags::END, &quote[32..]),
            ]),
        ])
        .cancel_when_drained(cancel.clone());

        let mut handler = MockRecordHandler::new();
        handler
            .expect_on_record()
            .withf(|header, record| {
                header.flags == FrameFlags::UNFRAGMENTED && matches!(record, Record::Quote(_))
            })
            .times(1)
            .return_const(());

        let mut subscribe = SubscribeLoop::new(subscription, config(0));
        let report = subscribe
            .run(&mut handler, &mut NoopRateSink, &cancel)
            .unwrap();
        assert_eq!(report.received, 1);
    }

    #[test]
    fn poll_failure_is_fatal() {
        let subscription = ScriptedSubscription::new([
            PollStep::Fragments(vec![whole(frame(0))]),
            PollStep::Fail(PollError::Failed("recv failed".to_string())),
        ]);

        let mut subscribe = SubscribeLoop::new(subscription, config(0));
        let err = subscribe
            .run(&mut NoopRecordHandler, &mut NoopRateSink, &CancellationToken::new())
            .unwrap_err();

        assert_eq!(
            err,
            SubscribeError::Transport {
                received: 1,
                reason: "recv failed".to_string()
            }
        );
    }

    #[test]
    fn closed_subscription_is_reported() {
        let subscription = ScriptedSubscription::new([PollStep::Fail(PollError::Closed)]);
        let mut subscribe = SubscribeLoop::new(subscription, config(0));
        let err = subscribe
            .run(&mut NoopRecordHandler, &mut NoopRateSink, &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err, SubscribeError::TransportClosed { received: 0 });
    }

    #[test]
    fn cancelled_before_start_never_polls() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut subscribe = SubscribeLoop::new(ScriptedSubscription::default(), config(0));
        let report = subscribe
            .run(&mut NoopRecordHandler, &mut NoopRateSink, &cancel)
            .unwrap();

        assert_eq!(subscribe.subscription().polls, 0);
        assert_eq!(report.elapsed, Duration::ZERO);
    }
}
