//! OPRA Bench Binary
//!
//! Runs a publisher and a subscriber in one process. Over `aeron:ipc` both
//! sides share an in-process log; over UDP they talk through loopback. The
//! subscriber stops itself once it has seen the publisher's message count,
//! or when the drain timeout runs out after publishing ends (UDP may lose
//! datagrams).
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin opra-bench -- -m 50m -x
//! cargo run --release --bin opra-bench -- -c 'aeron:ipc?mtu=32'
//! ```
//!
//! # Environment Variables
//!
//! - `OPRA_CHANNEL`: Channel URI (default: `aeron:ipc`)
//! - `OPRA_STREAM_ID`: Stream id (default: 1001)
//! - `OPRA_MESSAGES`: Messages to send and receive (default: 10m)
//! - `OPRA_EXCLUSIVE`: Use in-place claims instead of offers
//! - `OPRA_DRAIN_TIMEOUT`: Subscriber catch-up time after publishing (default: 1s)
//! - `OPRA_PROGRESS`: Log throughput every second
//! - `OPRA_METRICS_PORT`: Prometheus metrics port (default: 0, disabled)
//! - `RUST_LOG`: Log level (default: info)

use anyhow::Context;
use clap::Parser;
use opra_bench::infrastructure::config::load_dotenv;
use opra_bench::infrastructure::metrics::Direction;
use opra_bench::infrastructure::rate::{RateCounter, RateReporter, RateReporterConfig};
use opra_bench::infrastructure::shutdown::{await_shutdown, drain_or_cancel};
use opra_bench::{
    BenchArgs, ExclusiveClaim, IpcChannel, Media, NoopRecordHandler, PublishConfig, PublishError,
    PublishLoop, PublishReport, PublishStrategy, SharedOffer, SubscribeConfig, SubscribeError,
    SubscribeLoop, SubscribeReport, Subscription, UdpPublication, UdpSubscription, init_metrics,
    init_telemetry,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let args = BenchArgs::parse();

    let _telemetry_guard = init_telemetry("opra-bench")?;

    if args.common.metrics_port != 0 {
        let addr = init_metrics(args.common.metrics_port)?;
        tracing::info!(%addr, "Metrics exporter listening");
    }

    let stream_id = args.common.stream_id;
    println!(
        "Benchmarking {} messages over {} on stream id {} ({})",
        args.messages,
        args.channel,
        stream_id,
        if args.exclusive { "claim" } else { "offer" }
    );

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(await_shutdown(cancel.clone()));

    let sent = RateReporter::start(RateReporterConfig {
        log_progress: args.common.progress,
        ..RateReporterConfig::new(Direction::Sent)
    });
    let received = RateReporter::start(RateReporterConfig {
        log_progress: args.common.progress,
        ..RateReporterConfig::new(Direction::Received)
    });

    let publish_config = args.publish_config();
    let subscribe_config = args.subscribe_config();

    let (publisher, subscriber, channel) = match args.channel.media {
        Media::Ipc => {
            let channel = IpcChannel::from_uri(&args.channel, stream_id)?;
            let subscriber = spawn_subscriber(
                channel.subscription()?,
                subscribe_config,
                received.counter(),
                cancel.clone(),
            );
            let publisher = if args.exclusive {
                spawn_publisher(
                    ExclusiveClaim::new(channel.exclusive_publication()),
                    publish_config,
                    sent.counter(),
                    cancel.clone(),
                )
            } else {
                spawn_publisher(
                    SharedOffer::new(channel.publication()),
                    publish_config,
                    sent.counter(),
                    cancel.clone(),
                )
            };
            (publisher, subscriber, Some(channel))
        }
        Media::Udp => {
            let subscription = UdpSubscription::bind(&args.channel, stream_id)
                .with_context(|| format!("opening subscription on {}", args.channel))?;
            let publication = UdpPublication::connect(&args.channel, stream_id)
                .with_context(|| format!("opening publication on {}", args.channel))?;
            let subscriber =
                spawn_subscriber(subscription, subscribe_config, received.counter(), cancel.clone());
            let publisher = if args.exclusive {
                spawn_publisher(
                    ExclusiveClaim::new(publication),
                    publish_config,
                    sent.counter(),
                    cancel.clone(),
                )
            } else {
                spawn_publisher(
                    SharedOffer::new(publication),
                    publish_config,
                    sent.counter(),
                    cancel.clone(),
                )
            };
            (publisher, subscriber, None)
        }
    };

    let published = publisher.await.context("publish loop panicked")?;
    let subscribed = drain_or_cancel(subscriber, args.drain_timeout, &cancel)
        .await
        .context("subscribe loop panicked")?;

    sent.halt().await;
    received.halt().await;
    if let Some(channel) = channel {
        channel.close();
    }
    cancel.cancel();
    let _ = signals.await;

    let published = published.context("publishing failed")?;
    let subscribed = subscribed.context("subscribing failed")?;

    println!(
        "Publisher back pressure ratio {}",
        published.back_pressure_ratio()
    );
    println!("Publisher  {published}");
    println!("Subscriber {subscribed}");
    if subscribed.received < published.sent_count {
        println!(
            "Subscriber received {} of {} messages ({} lost)",
            subscribed.received,
            published.sent_count,
            published.sent_count - subscribed.received
        );
    }
    if subscribed.malformed > 0 {
        println!("Subscriber dropped {} malformed messages", subscribed.malformed);
    }

    Ok(())
}

/// Run the publish loop on a blocking thread; a failure stops the
/// subscriber too.
fn spawn_publisher<S>(
    strategy: S,
    config: PublishConfig,
    mut counter: RateCounter,
    cancel: CancellationToken,
) -> JoinHandle<Result<PublishReport, PublishError>>
where
    S: PublishStrategy + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = PublishLoop::new(strategy, config).run(&mut counter, &cancel);
        if result.is_err() {
            cancel.cancel();
        }
        result
    })
}

/// Run the subscribe loop on a blocking thread; a failure stops the
/// publisher too.
fn spawn_subscriber<S>(
    subscription: S,
    config: SubscribeConfig,
    mut counter: RateCounter,
    cancel: CancellationToken,
) -> JoinHandle<Result<SubscribeReport, SubscribeError>>
where
    S: Subscription + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = SubscribeLoop::new(subscription, config).run(
            &mut NoopRecordHandler,
            &mut counter,
            &cancel,
        );
        if result.is_err() {
            cancel.cancel();
        }
        result
    })
}
