//! OPRA Subscriber Binary
//!
//! Receives and decodes trade/quote records from a channel.
//!
//! Built with the `aeron` feature it subscribes through a running Aeron
//! media driver on `aeron:udp` or `aeron:ipc`. Otherwise it binds the
//! built-in UDP transport and rejects `aeron:ipc`.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin opra-sub -- -c 'aeron:udp?endpoint=localhost:20121' -m 10m --print
//! cargo run --features aeron --bin opra-sub -- -c 'aeron:ipc' -m 10m
//! ```
//!
//! # Environment Variables
//!
//! - `OPRA_CHANNEL`: Channel URI (default: `aeron:udp?endpoint=localhost:20121`)
//! - `OPRA_STREAM_ID`: Stream id (default: 1001)
//! - `OPRA_MESSAGES`: Stop after this many messages (default: 0, never)
//! - `OPRA_IDLE`: `busy-spin` | `backoff` | `noop` (default: backoff)
//! - `OPRA_PRINT`: Print every record as a JSON line
//! - `OPRA_PROGRESS`: Log throughput every second
//! - `OPRA_METRICS_PORT`: Prometheus metrics port (default: 0, disabled)
//! - `AERON_DIR`: Media driver directory (`aeron` feature)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log level (default: info)

use anyhow::Context;
use clap::Parser;
use opra_bench::infrastructure::config::load_dotenv;
use opra_bench::infrastructure::metrics::Direction;
use opra_bench::infrastructure::printer::JsonPrinter;
use opra_bench::infrastructure::rate::{RateCounter, RateReporter, RateReporterConfig};
use opra_bench::infrastructure::shutdown::await_shutdown;
use opra_bench::{
    NoopRecordHandler, SubscribeError, SubscribeLoop, SubscribeReport, SubscriberArgs,
    Subscription, init_metrics, init_telemetry,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let args = SubscriberArgs::parse();

    let _telemetry_guard = init_telemetry("opra-sub")?;

    if args.common.metrics_port != 0 {
        let addr = init_metrics(args.common.metrics_port)?;
        tracing::info!(%addr, "Metrics exporter listening");
    }

    #[cfg(not(feature = "aeron"))]
    if args.channel.media == opra_bench::Media::Ipc {
        anyhow::bail!(
            "{} needs the aeron feature outside opra-bench",
            args.channel
        );
    }

    println!(
        "Subscribing for {} messages to {} on stream id {}",
        args.messages, args.channel, args.common.stream_id
    );

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(await_shutdown(cancel.clone()));

    let reporter = RateReporter::start(RateReporterConfig {
        log_progress: args.common.progress,
        ..RateReporterConfig::new(Direction::Received)
    });
    let mut counter = reporter.counter();

    let loop_cancel = cancel.clone();
    let result = tokio::task::spawn_blocking(move || subscribe(&args, &mut counter, &loop_cancel))
        .await
        .context("subscribe loop panicked")?;

    reporter.halt().await;
    cancel.cancel();
    let _ = signals.await;

    let report = result?;
    if report.malformed > 0 {
        println!("Dropped {} malformed messages", report.malformed);
    }
    println!("{report}");

    tracing::info!(received = report.received, "Subscriber stopped");
    Ok(())
}

/// Drive the subscribe loop, printing records as JSON when asked.
fn run_loop<S: Subscription>(
    subscribe: &mut SubscribeLoop<S>,
    print: bool,
    counter: &mut RateCounter,
    cancel: &CancellationToken,
) -> Result<SubscribeReport, SubscribeError> {
    if print {
        let mut printer = JsonPrinter::new(std::io::stdout().lock());
        let result = subscribe.run(&mut printer, counter, cancel);
        if let Err(e) = printer.flush() {
            tracing::warn!(error = %e, "Failed to flush record output");
        }
        result
    } else {
        subscribe.run(&mut NoopRecordHandler, counter, cancel)
    }
}

/// Subscribe through the media driver.
#[cfg(feature = "aeron")]
fn subscribe(
    args: &SubscriberArgs,
    counter: &mut RateCounter,
    cancel: &CancellationToken,
) -> anyhow::Result<SubscribeReport> {
    use opra_bench::AeronClient;

    let client = AeronClient::connect(args.common.aeron_dir.as_deref())
        .context("connecting to the Aeron media driver")?;
    let subscription = client
        .subscription(&args.channel, args.common.stream_id)
        .with_context(|| format!("opening subscription on {}", args.channel))?;

    let mut subscribe = SubscribeLoop::new(subscription, args.subscribe_config());
    let result = run_loop(&mut subscribe, args.print, counter, cancel);
    subscribe.into_subscription().close();
    result.context("subscribing failed")
}

/// Subscribe on the built-in UDP transport.
#[cfg(not(feature = "aeron"))]
fn subscribe(
    args: &SubscriberArgs,
    counter: &mut RateCounter,
    cancel: &CancellationToken,
) -> anyhow::Result<SubscribeReport> {
    use opra_bench::UdpSubscription;

    let subscription = UdpSubscription::bind(&args.channel, args.common.stream_id)
        .with_context(|| format!("opening subscription on {}", args.channel))?;

    let mut subscribe = SubscribeLoop::new(subscription, args.subscribe_config());
    let result = run_loop(&mut subscribe, args.print, counter, cancel);
    subscribe.into_subscription().close();
    result.context("subscribing failed")
}
