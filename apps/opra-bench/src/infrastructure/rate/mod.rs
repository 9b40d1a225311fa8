//! Rate Reporter
//!
//! The hot loops count into a [`RateCounter`] (two relaxed atomic adds per
//! message); a tokio task samples the counters every interval, logs a
//! throughput snapshot when progress is enabled and feeds the metrics.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::application::ports::RateSink;
use crate::application::services::Throughput;
use crate::infrastructure::metrics::{self, Direction};

/// Default sampling interval.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Counters {
    messages: AtomicU64,
    bytes: AtomicU64,
}

/// Cloneable sink the loops count into.
#[derive(Debug, Clone, Default)]
pub struct RateCounter {
    counters: Arc<Counters>,
}

impl RateCounter {
    /// Totals counted so far.
    #[must_use]
    pub fn totals(&self) -> RateTotals {
        RateTotals {
            messages: self.counters.messages.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
        }
    }
}

impl RateSink for RateCounter {
    fn on_message(&mut self, bytes: usize) {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes
            .fetch_add(u64::try_from(bytes).unwrap_or(u64::MAX), Ordering::Relaxed);
    }
}

/// Cumulative message and byte counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateTotals {
    /// Messages counted.
    pub messages: u64,
    /// Bytes counted.
    pub bytes: u64,
}

/// Reporter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateReporterConfig {
    /// Which side is being measured.
    pub direction: Direction,
    /// Sampling interval.
    pub interval: Duration,
    /// Whether each sample is logged.
    pub log_progress: bool,
}

impl RateReporterConfig {
    /// Defaults for `direction`: one-second samples, logging on.
    #[must_use]
    pub const fn new(direction: Direction) -> Self {
        Self {
            direction,
            interval: DEFAULT_REPORT_INTERVAL,
            log_progress: true,
        }
    }
}

/// Background sampler over a [`RateCounter`].
#[derive(Debug)]
pub struct RateReporter {
    counter: RateCounter,
    halt: CancellationToken,
    task: JoinHandle<()>,
}

impl RateReporter {
    /// Start sampling. Must be called within a tokio runtime.
    #[must_use]
    pub fn start(config: RateReporterConfig) -> Self {
        let counter = RateCounter::default();
        let halt = CancellationToken::new();
        let task = tokio::spawn(run(config, counter.clone(), halt.clone()));
        Self {
            counter,
            halt,
            task,
        }
    }

    /// A sink for the measured loop.
    #[must_use]
    pub fn counter(&self) -> RateCounter {
        self.counter.clone()
    }

    /// Stop sampling and return the final totals.
    pub async fn halt(self) -> RateTotals {
        self.halt.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Rate reporter task failed");
        }
        self.counter.totals()
    }
}

struct Sampler {
    config: RateReporterConfig,
    counter: RateCounter,
    last: RateTotals,
    last_at: Instant,
}

impl Sampler {
    #[allow(clippy::cast_precision_loss)]
    fn sample(&mut self) {
        let now = Instant::now();
        let totals = self.counter.totals();
        let messages = totals.messages - self.last.messages;
        let bytes = totals.bytes - self.last.bytes;
        let interval = Throughput::new(messages, bytes as f64, now - self.last_at);
        let cumulative = Throughput::new(totals.messages, totals.bytes as f64, Duration::ZERO);

        let direction = self.config.direction;
        metrics::record_messages(direction, messages, bytes);
        metrics::set_throughput(direction, interval.msgs_per_sec(), interval.bytes_per_sec());

        if self.config.log_progress {
            tracing::info!(
                direction = direction.as_str(),
                "{:.0} msgs/sec, {:.0} bytes/sec, totals {} messages {:.4} MB payloads",
                interval.msgs_per_sec(),
                interval.bytes_per_sec(),
                totals.messages,
                cumulative.payload_mb()
            );
        }

        self.last = totals;
        self.last_at = now;
    }
}

async fn run(config: RateReporterConfig, counter: RateCounter, halt: CancellationToken) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut sampler = Sampler {
        config,
        last: counter.totals(),
        counter,
        last_at: Instant::now(),
    };

    loop {
        tokio::select! {
            () = halt.cancelled() => break,
            _ = ticker.tick() => sampler.sample(),
        }
    }

    // Flush what arrived since the last tick into the counters.
    let totals = sampler.counter.totals();
    metrics::record_messages(
        config.direction,
        totals.messages - sampler.last.messages,
        totals.bytes - sampler.last.bytes,
    );
}
