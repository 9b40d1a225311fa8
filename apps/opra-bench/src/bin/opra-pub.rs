//! OPRA Publisher Binary
//!
//! Streams alternating trade/quote records to a channel and reports
//! throughput and back-pressure.
//!
//! Built with the `aeron` feature it publishes through a running Aeron
//! media driver on `aeron:udp` or `aeron:ipc`. Otherwise it uses the
//! built-in UDP transport and rejects `aeron:ipc`.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin opra-pub -- -c 'aeron:udp?endpoint=localhost:20121' -m 10m -x
//! cargo run --features aeron --bin opra-pub -- -c 'aeron:ipc' -m 10m -x
//! ```
//!
//! # Environment Variables
//!
//! - `OPRA_CHANNEL`: Channel URI (default: `aeron:udp?endpoint=localhost:20121`)
//! - `OPRA_STREAM_ID`: Stream id (default: 1001)
//! - `OPRA_MESSAGES`: Messages to send, `k`/`m`/`g` suffixes allowed (default: 0, unbounded)
//! - `OPRA_LINGER`: Linger after publishing (default: 0)
//! - `OPRA_EXCLUSIVE`: Use in-place claims instead of offers
//! - `OPRA_IDLE`: `busy-spin` | `backoff` | `noop` (default: busy-spin)
//! - `OPRA_PROGRESS`: Log throughput every second
//! - `OPRA_METRICS_PORT`: Prometheus metrics port (default: 0, disabled)
//! - `AERON_DIR`: Media driver directory (`aeron` feature)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use opra_bench::infrastructure::config::load_dotenv;
use opra_bench::infrastructure::metrics::Direction;
use opra_bench::infrastructure::rate::{RateCounter, RateReporter, RateReporterConfig};
use opra_bench::infrastructure::shutdown::await_shutdown;
use opra_bench::{
    ExclusiveClaim, PublishLoop, PublishReport, PublisherArgs, SharedOffer, init_metrics,
    init_telemetry,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let args = PublisherArgs::parse();

    let _telemetry_guard = init_telemetry("opra-pub")?;

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
        "Streaming {} messages to {} on stream id {}",
        args.messages, args.channel, args.common.stream_id
    );

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(await_shutdown(cancel.clone()));

    let reporter = RateReporter::start(RateReporterConfig {
        log_progress: args.common.progress,
        ..RateReporterConfig::new(Direction::Sent)
    });
    let mut counter = reporter.counter();

    let loop_cancel = cancel.clone();
    let result = tokio::task::spawn_blocking(move || publish(&args, &mut counter, &loop_cancel))
        .await
        .context("publish loop panicked")?;

    reporter.halt().await;
    cancel.cancel();
    let _ = signals.await;

    let report = result?;
    tracing::info!(sent = report.sent_count, "Publisher stopped");
    Ok(())
}

/// Print the summary, then linger so the transport can drain.
fn finish(report: &PublishReport, linger: Duration) {
    println!("Done sending.");
    println!(
        "Publisher back pressure ratio {}",
        report.back_pressure_ratio()
    );
    println!("{report}");

    if !linger.is_zero() {
        println!("Lingering for {} nanoseconds", linger.as_nanos());
        std::thread::sleep(linger);
    }
}

/// Publish through the media driver; the publication outlives the linger.
#[cfg(feature = "aeron")]
fn publish(
    args: &PublisherArgs,
    counter: &mut RateCounter,
    cancel: &CancellationToken,
) -> anyhow::Result<PublishReport> {
    use opra_bench::AeronClient;

    let client = AeronClient::connect(args.common.aeron_dir.as_deref())
        .context("connecting to the Aeron media driver")?;
    let stream_id = args.common.stream_id;
    let config = args.publish_config();

    let report = if args.exclusive {
        let publication = client
            .exclusive_publication(&args.channel, stream_id)
            .with_context(|| format!("opening publication on {}", args.channel))?;
        let mut publish = PublishLoop::new(ExclusiveClaim::new(publication), config);
        let report = publish.run(counter, cancel).context("publishing failed")?;
        finish(&report, args.linger);
        report
    } else {
        let publication = client
            .publication(&args.channel, stream_id)
            .with_context(|| format!("opening publication on {}", args.channel))?;
        let mut publish = PublishLoop::new(SharedOffer::new(publication), config);
        let report = publish.run(counter, cancel).context("publishing failed")?;
        finish(&report, args.linger);
        report
    };
    Ok(report)
}

/// Publish over the built-in UDP transport.
#[cfg(not(feature = "aeron"))]
fn publish(
    args: &PublisherArgs,
    counter: &mut RateCounter,
    cancel: &CancellationToken,
) -> anyhow::Result<PublishReport> {
    use opra_bench::UdpPublication;

    /// Bound on retrying the last committed datagram once publishing stops.
    const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

    let publication = UdpPublication::connect(&args.channel, args.common.stream_id)
        .with_context(|| format!("opening publication on {}", args.channel))?;
    let config = args.publish_config();

    let (result, mut publication) = if args.exclusive {
        let mut publish = PublishLoop::new(ExclusiveClaim::new(publication), config);
        let result = publish.run(counter, cancel);
        (result, publish.into_strategy().into_inner())
    } else {
        let mut publish = PublishLoop::new(SharedOffer::new(publication), config);
        let result = publish.run(counter, cancel);
        (result, publish.into_strategy().into_inner())
    };
    let report = result.context("publishing failed")?;

    if let Err(rejection) = publication.flush(FLUSH_TIMEOUT) {
        tracing::warn!(%rejection, "Last committed message still unsent");
    }
    finish(&report, args.linger);
    publication.close();
    Ok(report)
}
