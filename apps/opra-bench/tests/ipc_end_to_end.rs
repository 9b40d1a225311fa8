//! In-Process End-to-End Tests
//!
//! Runs the publish and subscribe loops on separate threads over the
//! in-process log and checks what arrives.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::thread;

use opra_bench::{
    ChannelUri, ExclusiveClaim, FragmentHeader, FrameFlags, IdleStrategy, IpcChannel,
    NoopRateSink, PublishConfig, PublishLoop, PublishReport, PublishStrategy, Record,
    RecordHandler, RecordKind, RecordTemplates, SharedOffer, SubscribeConfig, SubscribeLoop,
    SubscribeReport,
};
use tokio_util::sync::CancellationToken;

const STREAM_ID: i32 = 1001;

#[derive(Default)]
struct Collect {
    headers: Vec<FragmentHeader>,
    records: Vec<Record>,
}

impl RecordHandler for Collect {
    fn on_record(&mut self, header: &FragmentHeader, record: &Record) {
        self.headers.push(*header);
        self.records.push(*record);
    }
}

fn subscribe_config(limit: u64) -> SubscribeConfig {
    SubscribeConfig {
        limit,
        fragment_limit: 10,
        idle: IdleStrategy::backoff(),
    }
}

fn publish_config(messages: u64) -> PublishConfig {
    PublishConfig {
        messages,
        idle: IdleStrategy::BusySpin,
    }
}

/// Publish `messages` with `strategy` and subscribe until all arrive.
fn run_pair<S>(
    channel: &Arc<IpcChannel>,
    strategy: S,
    messages: u64,
) -> (PublishReport, SubscribeReport, Collect, CancellationToken)
where
    S: PublishStrategy + Send + 'static,
{
    let cancel = CancellationToken::new();
    let subscription = channel.subscription().unwrap();

    let sub_cancel = cancel.clone();
    let subscriber = thread::spawn(move || {
        let mut handler = Collect::default();
        let report = SubscribeLoop::new(subscription, subscribe_config(messages))
            .run(&mut handler, &mut NoopRateSink, &sub_cancel)
            .unwrap();
        (report, handler)
    });

    let pub_cancel = cancel.clone();
    let publisher = thread::spawn(move || {
        PublishLoop::new(strategy, publish_config(messages))
            .run(&mut NoopRateSink, &pub_cancel)
            .unwrap()
    });

    let published = publisher.join().unwrap();
    let (subscribed, handler) = subscriber.join().unwrap();
    (published, subscribed, handler, cancel)
}

fn assert_stream_matches(records: &[Record]) {
    let templates = RecordTemplates::default();
    for (index, record) in records.iter().enumerate() {
        let index = index as u64;
        let expected = templates.record_for(index, record.timestamp());
        assert_eq!(*record, expected, "record {index}");
    }
}

#[test]
fn shared_offer_reassembles_fragmented_messages() {
    // 20-byte payloads: every frame spans two fragments.
    let uri: ChannelUri = "aeron:ipc?mtu=32|term-length=64k".parse().unwrap();
    let channel = IpcChannel::from_uri(&uri, STREAM_ID).unwrap();
    let publication = channel.publication();

    let (published, subscribed, handler, cancel) =
        run_pair(&channel, SharedOffer::new(publication), 2_000);

    assert_eq!(published.sent_count, 2_000);
    assert_eq!(published.trades, 1_000);
    assert_eq!(published.quotes, 1_000);
    assert_eq!(subscribed.received, 2_000);
    assert_eq!(subscribed.malformed, 0);
    assert_eq!(subscribed.stale_partials, 0);
    assert!(cancel.is_cancelled(), "limit should cancel the shared token");

    assert_eq!(handler.records.len(), 2_000);
    assert_stream_matches(&handler.records);
    assert!(
        handler
            .headers
            .iter()
            .all(|h| h.flags == FrameFlags::UNFRAGMENTED && h.stream_id == STREAM_ID)
    );
}

#[test]
fn exclusive_claim_delivers_in_order() {
    let channel = IpcChannel::from_uri(&ChannelUri::ipc(), STREAM_ID).unwrap();
    let publication = channel.exclusive_publication();

    let (published, subscribed, handler, _cancel) =
        run_pair(&channel, ExclusiveClaim::new(publication), 10_000);

    assert_eq!(published.sent_count, 10_000);
    assert_eq!(published.next_index, 10_000);
    assert_eq!(subscribed.received, 10_000);
    assert_eq!(subscribed.quotes, 5_000);
    assert_eq!(subscribed.trades, 5_000);
    assert_eq!(handler.records[0].kind(), RecordKind::Trade);
    assert_eq!(handler.records[1].kind(), RecordKind::Quote);
    assert_stream_matches(&handler.records);
}

#[test]
fn small_window_back_pressures_without_losing_messages() {
    let uri: ChannelUri = "aeron:ipc?mtu=64|term-length=256".parse().unwrap();
    let channel = IpcChannel::from_uri(&uri, STREAM_ID).unwrap();
    let publication = channel.exclusive_publication();

    let (published, subscribed, handler, _cancel) =
        run_pair(&channel, ExclusiveClaim::new(publication), 5_000);

    assert_eq!(published.sent_count, 5_000);
    assert_eq!(subscribed.received, 5_000);
    assert_stream_matches(&handler.records);
}

#[test]
fn external_cancel_stops_unbounded_loops() {
    let channel = IpcChannel::from_uri(&ChannelUri::ipc(), STREAM_ID).unwrap();
    let subscription = channel.subscription().unwrap();
    let publication = channel.publication();
    let cancel = CancellationToken::new();

    let sub_cancel = cancel.clone();
    let subscriber = thread::spawn(move || {
        SubscribeLoop::new(subscription, subscribe_config(0))
            .run(&mut Collect::default(), &mut NoopRateSink, &sub_cancel)
            .unwrap()
    });
    let pub_cancel = cancel.clone();
    let publisher = thread::spawn(move || {
        PublishLoop::new(SharedOffer::new(publication), publish_config(0))
            .run(&mut NoopRateSink, &pub_cancel)
            .unwrap()
    });

    thread::sleep(std::time::Duration::from_millis(50));
    cancel.cancel();

    let published = publisher.join().unwrap();
    let subscribed = subscriber.join().unwrap();
    assert!(published.cancelled);
    assert_eq!(published.sent_count, published.next_index);
    assert!(subscribed.received <= published.sent_count);
}
