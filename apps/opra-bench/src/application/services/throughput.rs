//! Throughput arithmetic shared by the loop reports and the rate reporter.

use std::fmt;
use std::time::Duration;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Messages and bytes moved over an interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    /// Messages in the interval.
    pub messages: u64,
    /// Payload bytes in the interval.
    pub bytes: f64,
    /// Interval length.
    pub elapsed: Duration,
}

impl Throughput {
    /// Build a snapshot.
    #[must_use]
    pub const fn new(messages: u64, bytes: f64, elapsed: Duration) -> Self {
        Self {
            messages,
            bytes,
            elapsed,
        }
    }

    /// Messages per second; zero for an empty interval.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn msgs_per_sec(&self) -> f64 {
        self.per_sec(self.messages as f64)
    }

    /// Bytes per second; zero for an empty interval.
    #[must_use]
    pub fn bytes_per_sec(&self) -> f64 {
        self.per_sec(self.bytes)
    }

    /// Payload volume in MiB.
    #[must_use]
    pub fn payload_mb(&self) -> f64 {
        self.bytes / BYTES_PER_MB
    }

    #[allow(clippy::cast_precision_loss)]
    fn per_sec(&self, amount: f64) -> f64 {
        let nanos = self.elapsed.as_nanos();
        if nanos == 0 {
            return 0.0;
        }
        amount * NANOS_PER_SEC / nanos as f64
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.0} msgs/sec, {:.0} bytes/sec, totals {} messages {:.4} MB payloads",
            self.msgs_per_sec(),
            self.bytes_per_sec(),
            self.messages,
            self.payload_mb()
        )
    }
}
