//! Publish Loop
//!
//! Drives one [`PublishStrategy`] across message indices `0, 1, 2, ...`:
//! even indices publish a trade, odd indices a quote. A transient
//! rejection is counted as back-pressure and the same index is retried
//! after one idle step; an index only advances once its message is in the
//! transport. Cancellation is checked before every new attempt and never
//! interrupts a claim that is already being written.

use std::fmt;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::clock::nano_time;
use super::idle::IdleStrategy;
use super::strategy::{AttemptError, PublishStrategy};
use super::throughput::Throughput;
use crate::application::ports::{OfferRejection, RateSink};
use crate::domain::market_data::codec::CodecError;
use crate::domain::market_data::{AVERAGE_FRAME_LEN, RecordKind, RecordTemplates};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Publish loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishConfig {
    /// Messages to publish; zero publishes until cancelled.
    pub messages: u64,
    /// Idle step taken after each transient rejection.
    pub idle: IdleStrategy,
}

// =============================================================================
// Errors
// =============================================================================

/// Fatal publish loop outcomes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The publication was closed underneath the loop.
    #[error("publication closed at message {index} after {sent} sent")]
    TransportClosed {
        /// Index that could not be published.
        index: u64,
        /// Messages published before the close.
        sent: u64,
    },

    /// The transport failed.
    #[error("transport error at message {index}: {reason}")]
    Transport {
        /// Index that could not be published.
        index: u64,
        /// Transport diagnostic.
        reason: String,
    },

    /// A record could not be encoded into the claimed region.
    #[error("encode failed at message {index}: {source}")]
    Codec {
        /// Index that could not be published.
        index: u64,
        /// Codec failure.
        #[source]
        source: CodecError,
    },
}

impl PublishError {
    fn from_attempt(index: u64, sent: u64, err: AttemptError) -> Self {
        match err {
            AttemptError::Rejected(OfferRejection::Closed) => Self::TransportClosed { index, sent },
            AttemptError::Rejected(rejection) => Self::Transport {
                index,
                reason: rejection.to_string(),
            },
            AttemptError::Codec(source) => Self::Codec { index, source },
        }
    }
}

// =============================================================================
// Report
// =============================================================================

/// Outcome of a completed or cancelled publish loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishReport {
    /// Messages accepted by the transport.
    pub sent_count: u64,
    /// Transient rejections, retries included.
    pub back_pressure_count: u64,
    /// Trades published.
    pub trades: u64,
    /// Quotes published.
    pub quotes: u64,
    /// Index the next message would have used.
    pub next_index: u64,
    /// Wall time spent in the loop.
    pub elapsed: Duration,
    /// Whether the loop stopped on cancellation rather than the count.
    pub cancelled: bool,
}

impl PublishReport {
    /// Throughput using the average framed length of the two kinds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn throughput(&self) -> Throughput {
        Throughput::new(
            self.sent_count,
            self.sent_count as f64 * AVERAGE_FRAME_LEN,
            self.elapsed,
        )
    }

    /// Messages per second.
    #[must_use]
    pub fn msgs_per_sec(&self) -> f64 {
        self.throughput().msgs_per_sec()
    }

    /// Bytes per second.
    #[must_use]
    pub fn bytes_per_sec(&self) -> f64 {
        self.throughput().bytes_per_sec()
    }

    /// Payload volume in MiB.
    #[must_use]
    pub fn payload_mb(&self) -> f64 {
        self.throughput().payload_mb()
    }

    /// Back-pressure events per message sent; zero when nothing was sent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn back_pressure_ratio(&self) -> f64 {
        if self.sent_count == 0 {
            return 0.0;
        }
        self.back_pressure_count as f64 / self.sent_count as f64
    }
}

impl fmt::Display for PublishReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Total: {}ms, {}", self.elapsed.as_millis(), self.throughput())
    }
}

// =============================================================================
// Loop
// =============================================================================

/// Publishes the alternating trade/quote stream through a strategy.
#[derive(Debug)]
pub struct PublishLoop<S> {
    strategy: S,
    config: PublishConfig,
    templates: RecordTemplates,
    clock: fn() -> u64,
}

impl<S: PublishStrategy> PublishLoop<S> {
    /// Create a loop with the default templates and the process clock.
    #[must_use]
    pub fn new(strategy: S, config: PublishConfig) -> Self {
        Self {
            strategy,
            config,
            templates: RecordTemplates::default(),
            clock: nano_time,
        }
    }

    /// Replace the record templates.
    #[must_use]
    pub const fn with_templates(mut self, templates: RecordTemplates) -> Self {
        self.templates = templates;
        self
    }

    /// Replace the timestamp source.
    #[must_use]
    pub const fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// The strategy in use.
    #[must_use]
    pub const fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Unwrap the strategy.
    #[must_use]
    pub fn into_strategy(self) -> S {
        self.strategy
    }

    /// Run until the configured count is published or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns a [`PublishError`] when the publication is closed or fails;
    /// transient rejections are retried and never surface here.
    pub fn run<R>(
        &mut self,
        sink: &mut R,
        cancel: &CancellationToken,
    ) -> Result<PublishReport, PublishError>
    where
        R: RateSink + ?Sized,
    {
        let messages = self.config.messages;
        let mut idle = self.config.idle;
        let mut report = PublishReport::default();
        let start = Instant::now();

        tracing::info!(
            strategy = self.strategy.name(),
            messages,
            idle = %idle,
            "Publish loop started"
        );

        'messages: while messages == 0 || report.next_index < messages {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let index = report.next_index;
            loop {
                let record = self.templates.record_for(index, (self.clock)());
                match self.strategy.try_publish(&record) {
                    Ok(_position) => {
                        match record.kind() {
                            RecordKind::Trade => report.trades += 1,
                            RecordKind::Quote => report.quotes += 1,
                        }
                        report.sent_count += 1;
                        sink.on_message(record.frame_len());
                        idle.reset();
                        break;
                    }
                    Err(err) if err.is_transient() => {
                        report.back_pressure_count += 1;
                        metrics::record_back_pressure();
                        idle.idle();
                        if cancel.is_cancelled() {
                            report.cancelled = true;
                            break 'messages;
                        }
                    }
                    Err(err) => {
                        let err = PublishError::from_attempt(index, report.sent_count, err);
                        tracing::error!(
                            index,
                            sent = report.sent_count,
                            error = %err,
                            "Publish loop aborted"
                        );
                        return Err(err);
                    }
                }
            }
            report.next_index += 1;
        }

        report.elapsed = start.elapsed();
        tracing::info!(
            sent = report.sent_count,
            back_pressure = report.back_pressure_count,
            cancelled = report.cancelled,
            elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "Publish loop finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use mockall::Sequence;
    use mockall::predicate::eq;

    use super::*;
    use crate::application::ports::{MockRateSink, NoopRateSink};
    use crate::application::services::strategy::{ExclusiveClaim, SharedOffer};
    use crate::application::services::testing::ScriptedPublication;
    use crate::domain::market_data::codec::decode;
    use crate::domain::market_data::{
        QUOTE_FRAME_LEN, Quote, Record, Symbol, TRADE_FRAME_LEN, Trade,
    };

    fn fixed_clock() -> u64 {
        99
    }

    fn config(messages: u64) -> PublishConfig {
        PublishConfig {
            messages,
            idle: IdleStrategy::Noop,
        }
    }

    fn kinds(sent: &[Vec<u8>]) -> Vec<RecordKind> {
        sent.iter().map(|bytes| decode(bytes).unwrap().kind()).collect()
    }

    #[test]
    fn four_messages_alternate_trade_quote() {
        let mut sink = MockRateSink::new();
        let mut seq = Sequence::new();
        for len in [TRADE_FRAME_LEN, QUOTE_FRAME_LEN, TRADE_FRAME_LEN, QUOTE_FRAME_LEN] {
            sink.expect_on_message()
                .with(eq(len))
                .times(1)
                .in_sequence(&mut seq)
                .return_const(());
        }

        let strategy = ExclusiveClaim::new(ScriptedPublication::default());
        let mut publish = PublishLoop::new(strategy, config(4));
        let report = publish.run(&mut sink, &CancellationToken::new()).unwrap();

        assert_eq!(report.sent_count, 4);
        assert_eq!(report.back_pressure_count, 0);
        assert_eq!((report.trades, report.quotes), (2, 2));
        assert_eq!(report.next_index, 4);
        assert!(!report.cancelled);
        assert_eq!(
            kinds(&publish.strategy().publication().sent()),
            [
                RecordKind::Trade,
                RecordKind::Quote,
                RecordKind::Trade,
                RecordKind::Quote
            ]
        );
    }

    #[test]
    fn back_pressure_retries_same_index() {
        let publication = ScriptedPublication::with_script([
            Some(OfferRejection::BackPressured),
            Some(OfferRejection::NotConnected),
            Some(OfferRejection::AdminAction),
        ]);
        let mut publish = PublishLoop::new(SharedOffer::new(publication), config(2));
        let report = publish
            .run(&mut NoopRateSink, &CancellationToken::new())
            .unwrap();

        assert_eq!(report.sent_count, 2);
        assert_eq!(report.back_pressure_count, 3);
        let publication = publish.strategy().publication();
        assert_eq!(publication.attempts(), 5);

        let sent = publication.sent();
        assert_eq!(sent.len(), 2);
        let Record::Trade(trade) = decode(&sent[0]).unwrap() else {
            panic!("index 0 must be a trade");
        };
        assert_eq!(trade.condition, b'a');
        let Record::Quote(quote) = decode(&sent[1]).unwrap() else {
            panic!("index 1 must be a quote");
        };
        assert_eq!(quote.condition, b'b');
    }

    #[test]
    fn timestamps_come_from_clock() {
        let strategy = ExclusiveClaim::new(ScriptedPublication::default());
        let mut publish = PublishLoop::new(strategy, config(2)).with_clock(fixed_clock);
        publish
            .run(&mut NoopRateSink, &CancellationToken::new())
            .unwrap();

        for bytes in publish.strategy().publication().sent() {
            assert_eq!(decode(&bytes).unwrap().timestamp(), 99);
        }
    }

    #[test]
    fn records_derive_from_custom_templates() {
        let templates = RecordTemplates {
            trade: Trade {
                symbol: Symbol::from_ticker("SPY"),
                strike_price: 450_000,
                ..Trade::TEMPLATE
            },
            quote: Quote {
                symbol: Symbol::from_ticker("QQQ"),
                ..Quote::TEMPLATE
            },
        };
        let strategy = SharedOffer::new(ScriptedPublication::default());
        let mut publish = PublishLoop::new(strategy, config(2)).with_templates(templates);
        publish
            .run(&mut NoopRateSink, &CancellationToken::new())
            .unwrap();

        let sent = publish.strategy().publication().sent();
        match decode(&sent[0]).unwrap() {
            Record::Trade(trade) => {
                assert_eq!(trade.symbol.ticker(), "SPY");
                assert_eq!(trade.strike_price, 450_000);
            }
            other => panic!("expected a trade, got {other:?}"),
        }
        match decode(&sent[1]).unwrap() {
            Record::Quote(quote) => assert_eq!(quote.symbol.ticker(), "QQQ"),
            other => panic!("expected a quote, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_during_back_pressure_stops_before_next_attempt() {
        let cancel = CancellationToken::new();
        let publication =
            ScriptedPublication::with_script(vec![Some(OfferRejection::BackPressured); 100])
                .cancel_after(3, cancel.clone());
        let mut publish = PublishLoop::new(ExclusiveClaim::new(publication), config(0));
        let report = publish.run(&mut NoopRateSink, &cancel).unwrap();

        assert!(report.cancelled);
        assert_eq!(report.sent_count, 0);
        assert_eq!(report.next_index, 0);
        assert_eq!(report.back_pressure_count, 3);
        assert_eq!(publish.strategy().publication().attempts(), 3);
    }

    #[test]
    fn cancelled_before_start_makes_no_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut publish =
            PublishLoop::new(ExclusiveClaim::new(ScriptedPublication::default()), config(0));
        let report = publish.run(&mut NoopRateSink, &cancel).unwrap();

        assert!(report.cancelled);
        assert_eq!(publish.strategy().publication().attempts(), 0);
    }

    #[test]
    fn unbounded_loop_runs_until_cancelled() {
        let cancel = CancellationToken::new();
        let publication = ScriptedPublication::default().cancel_after(10, cancel.clone());
        let mut publish = PublishLoop::new(SharedOffer::new(publication), config(0));
        let report = publish.run(&mut NoopRateSink, &cancel).unwrap();

        assert!(report.cancelled);
        assert_eq!(report.sent_count, 10);
    }

    #[test]
    fn closed_publication_aborts() {
        let publication = ScriptedPublication::with_script([None, Some(OfferRejection::Closed)]);
        let mut publish = PublishLoop::new(ExclusiveClaim::new(publication), config(4));
        let err = publish
            .run(&mut NoopRateSink, &CancellationToken::new())
            .unwrap_err();

        assert_eq!(err, PublishError::TransportClosed { index: 1, sent: 1 });
        assert_eq!(publish.strategy().publication().sent().len(), 1);
    }

    #[test]
    fn transport_failure_aborts_with_reason() {
        let publication = ScriptedPublication::with_script([Some(OfferRejection::Failed(
            "socket gone".to_string(),
        ))]);
        let mut publish = PublishLoop::new(SharedOffer::new(publication), config(4));
        let err = publish
            .run(&mut NoopRateSink, &CancellationToken::new())
            .unwrap_err();

        assert!(matches!(err, PublishError::Transport { index: 0, .. }));
        assert!(err.to_string().contains("socket gone"));
    }

    #[test]
    fn back_pressure_ratio_uses_sent_count() {
        let report = PublishReport {
            sent_count: 4,
            back_pressure_count: 2,
            ..PublishReport::default()
        };
        assert!((report.back_pressure_ratio() - 0.5).abs() < f64::EPSILON);
        assert!(PublishReport::default().back_pressure_ratio().abs() < f64::EPSILON);
    }

    #[test]
    fn report_display_line() {
        let report = PublishReport {
            sent_count: 2,
            elapsed: Duration::from_secs(1),
            ..PublishReport::default()
        };
        assert_eq!(
            report.to_string(),
            "Total: 1000ms, 2 msgs/sec, 71 bytes/sec, totals 2 messages 0.0001 MB payloads"
        );
    }
}
