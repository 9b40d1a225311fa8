//! Binary Settings
//!
//! Every flag can also come from an `OPRA_*` environment variable, and a
//! `.env` file in the working directory or any ancestor is loaded first.
//!
//! Counts accept `k`, `m` and `g` suffixes (powers of 1024); durations
//! accept `ns`, `us`, `ms` and `s`, with bare numbers meaning nanoseconds.

use std::time::Duration;

use clap::{Args, Parser};

use crate::application::services::{IdleStrategy, PublishConfig, SubscribeConfig};
use crate::infrastructure::transport::ChannelUri;

/// Default channel for the standalone publisher and subscriber.
const DEFAULT_CHANNEL: &str = "aeron:udp?endpoint=localhost:20121";

/// Default stream id.
const DEFAULT_STREAM_ID: &str = "1001";

// =============================================================================
// Value Parsing
// =============================================================================

/// A count or duration that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseValueError {
    /// Empty input.
    #[error("empty value")]
    Empty,

    /// Numeric part is not an unsigned integer.
    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    /// Suffix not recognised.
    #[error("unknown suffix '{suffix}' in '{value}'")]
    UnknownSuffix {
        /// Offending suffix.
        suffix: String,
        /// Whole input.
        value: String,
    },

    /// Value does not fit in 64 bits.
    #[error("value '{0}' overflows")]
    Overflow(String),
}

fn split_number(value: &str) -> Result<(u64, &str), ParseValueError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ParseValueError::Empty);
    }
    let digits_end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(digits_end);
    let number = digits
        .parse::<u64>()
        .map_err(|_| ParseValueError::InvalidNumber(value.to_string()))?;
    Ok((number, suffix))
}

/// Parse a count with an optional `k`/`m`/`g` suffix (powers of 1024).
///
/// # Errors
///
/// Returns a [`ParseValueError`] for malformed or overflowing input.
pub fn parse_size(value: &str) -> Result<u64, ParseValueError> {
    let (number, suffix) = split_number(value)?;
    let multiplier: u64 = match suffix.to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        _ => {
            return Err(ParseValueError::UnknownSuffix {
                suffix: suffix.to_string(),
                value: value.to_string(),
            });
        }
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| ParseValueError::Overflow(value.to_string()))
}

/// Parse a duration with an optional `ns`/`us`/`ms`/`s` suffix.
///
/// # Errors
///
/// Returns a [`ParseValueError`] for malformed or overflowing input.
pub fn parse_duration(value: &str) -> Result<Duration, ParseValueError> {
    let (number, suffix) = split_number(value)?;
    let nanos_per_unit: u64 = match suffix.to_ascii_lowercase().as_str() {
        "" | "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        _ => {
            return Err(ParseValueError::UnknownSuffix {
                suffix: suffix.to_string(),
                value: value.to_string(),
            });
        }
    };
    number
        .checked_mul(nanos_per_unit)
        .map(Duration::from_nanos)
        .ok_or_else(|| ParseValueError::Overflow(value.to_string()))
}

fn parse_fragment_limit(value: &str) -> Result<usize, String> {
    let limit = parse_size(value).map_err(|e| e.to_string())?;
    match usize::try_from(limit) {
        Ok(0) => Err("fragment limit must be at least 1".to_string()),
        Ok(limit) => Ok(limit),
        Err(e) => Err(e.to_string()),
    }
}

// =============================================================================
// Arguments
// =============================================================================

/// Flags shared by every binary.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct CommonArgs {
    /// Stream id to publish or subscribe on
    #[arg(short = 's', long, env = "OPRA_STREAM_ID", default_value = DEFAULT_STREAM_ID)]
    pub stream_id: i32,

    /// Log throughput once per second
    #[arg(short = 'P', long, env = "OPRA_PROGRESS")]
    pub progress: bool,

    /// Serve Prometheus metrics on this port (0 disables)
    #[arg(long, env = "OPRA_METRICS_PORT", default_value_t = 0)]
    pub metrics_port: u16,

    /// Aeron media driver directory (builds with the `aeron` feature)
    #[arg(long, env = "AERON_DIR")]
    pub aeron_dir: Option<String>,
}

/// Publishes the alternating trade/quote stream.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "opra-pub", version, about, long_about = None)]
pub struct PublisherArgs {
    /// Channel URI
    #[arg(short = 'c', long, env = "OPRA_CHANNEL", default_value = DEFAULT_CHANNEL)]
    pub channel: ChannelUri,

    /// Number of messages to send (0: never stops)
    #[arg(short = 'm', long, env = "OPRA_MESSAGES", default_value = "0", value_parser = parse_size)]
    pub messages: u64,

    /// Linger at end of publishing (e.g. 500ms, 2s)
    #[arg(short = 'l', long, env = "OPRA_LINGER", default_value = "0", value_parser = parse_duration)]
    pub linger: Duration,

    /// Claim transport buffers and encode in place instead of offering copies
    #[arg(short = 'x', long, env = "OPRA_EXCLUSIVE")]
    pub exclusive: bool,

    /// Idle strategy between back-pressured attempts
    #[arg(long, env = "OPRA_IDLE", default_value = "busy-spin")]
    pub idle: IdleStrategy,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl PublisherArgs {
    /// Publish loop settings.
    #[must_use]
    pub const fn publish_config(&self) -> PublishConfig {
        PublishConfig {
            messages: self.messages,
            idle: self.idle,
        }
    }
}

/// Subscribes and decodes the trade/quote stream.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "opra-sub", version, about, long_about = None)]
pub struct SubscriberArgs {
    /// Channel URI
    #[arg(short = 'c', long, env = "OPRA_CHANNEL", default_value = DEFAULT_CHANNEL)]
    pub channel: ChannelUri,

    /// Number of messages after which to stop (0: never stops)
    #[arg(short = 'm', long, env = "OPRA_MESSAGES", default_value = "0", value_parser = parse_size)]
    pub messages: u64,

    /// Maximum fragments per poll
    #[arg(long, default_value = "10", value_parser = parse_fragment_limit)]
    pub fragment_limit: usize,

    /// Idle strategy between empty polls
    #[arg(long, env = "OPRA_IDLE", default_value = "backoff")]
    pub idle: IdleStrategy,

    /// Print every record as a JSON line on stdout
    #[arg(long, env = "OPRA_PRINT")]
    pub print: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl SubscriberArgs {
    /// Subscribe loop settings.
    #[must_use]
    pub const fn subscribe_config(&self) -> SubscribeConfig {
        SubscribeConfig {
            limit: self.messages,
            fragment_limit: self.fragment_limit,
            idle: self.idle,
        }
    }
}

/// Runs a publisher and a subscriber in one process.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "opra-bench", version, about, long_about = None)]
pub struct BenchArgs {
    /// Channel URI
    #[arg(short = 'c', long, env = "OPRA_CHANNEL", default_value = "aeron:ipc")]
    pub channel: ChannelUri,

    /// Number of messages to send and receive
    #[arg(short = 'm', long, env = "OPRA_MESSAGES", default_value = "10m", value_parser = parse_size)]
    pub messages: u64,

    /// Claim transport buffers and encode in place instead of offering copies
    #[arg(short = 'x', long, env = "OPRA_EXCLUSIVE")]
    pub exclusive: bool,

    /// Maximum fragments per poll
    #[arg(long, default_value = "10", value_parser = parse_fragment_limit)]
    pub fragment_limit: usize,

    /// Time the subscriber gets to catch up once publishing ends, after
    /// which it is stopped short of the count (datagrams can be lost)
    #[arg(long, env = "OPRA_DRAIN_TIMEOUT", default_value = "1s", value_parser = parse_duration)]
    pub drain_timeout: Duration,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl BenchArgs {
    /// Publisher side settings.
    #[must_use]
    pub const fn publish_config(&self) -> PublishConfig {
        PublishConfig {
            messages: self.messages,
            idle: IdleStrategy::BusySpin,
        }
    }

    /// Subscriber side settings; stops at the publisher's count.
    #[must_use]
    pub fn subscribe_config(&self) -> SubscribeConfig {
        SubscribeConfig {
            limit: self.messages,
            fragment_limit: self.fragment_limit,
            idle: IdleStrategy::backoff(),
        }
    }
}

// =============================================================================
// Environment
// =============================================================================

/// Load `.env` from the working directory or the nearest ancestor.
pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::infrastructure::transport::Media;

    #[test_case("0", 0 ; "zero")]
    #[test_case("250", 250 ; "plain")]
    #[test_case("4k", 4096 ; "kilo")]
    #[test_case("10M", 10 * 1024 * 1024 ; "mega upper case")]
    #[test_case("1g", 1 << 30 ; "giga")]
    fn sizes(input: &str, expected: u64) {
        assert_eq!(parse_size(input), Ok(expected));
    }

    #[test_case("500", Duration::from_nanos(500) ; "bare nanos")]
    #[test_case("20us", Duration::from_micros(20) ; "micros")]
    #[test_case("250ms", Duration::from_millis(250) ; "millis")]
    #[test_case("3s", Duration::from_secs(3) ; "seconds")]
    fn durations(input: &str, expected: Duration) {
        assert_eq!(parse_duration(input), Ok(expected));
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(parse_size(""), Err(ParseValueError::Empty));
        assert!(matches!(parse_size("k"), Err(ParseValueError::InvalidNumber(_))));
        assert!(matches!(parse_size("5t"), Err(ParseValueError::UnknownSuffix { .. })));
        assert!(matches!(parse_duration("5h"), Err(ParseValueError::UnknownSuffix { .. })));
        assert!(matches!(
            parse_size("99999999999g"),
            Err(ParseValueError::Overflow(_))
        ));
    }

    #[test]
    fn publisher_flags() {
        let args = PublisherArgs::try_parse_from([
            "opra-pub", "-c", "aeron:ipc", "-s", "7", "-m", "1k", "-l", "2s", "-x", "-P",
        ])
        .unwrap();

        assert_eq!(args.channel.media, Media::Ipc);
        assert_eq!(args.common.stream_id, 7);
        assert_eq!(args.messages, 1024);
        assert_eq!(args.linger, Duration::from_secs(2));
        assert!(args.exclusive);
        assert!(args.common.progress);
        assert_eq!(args.publish_config().messages, 1024);
    }

    #[test]
    fn subscriber_flags() {
        let args = SubscriberArgs::try_parse_from([
            "opra-sub",
            "-m",
            "100",
            "--fragment-limit",
            "32",
            "--idle",
            "noop",
            "--print",
        ])
        .unwrap();

        let config = args.subscribe_config();
        assert_eq!(config.limit, 100);
        assert_eq!(config.fragment_limit, 32);
        assert_eq!(config.idle, IdleStrategy::Noop);
        assert!(args.print);
    }

    #[test]
    fn zero_fragment_limit_is_rejected() {
        assert!(SubscriberArgs::try_parse_from(["opra-sub", "--fragment-limit", "0"]).is_err());
    }

    #[test]
    fn bench_stops_subscriber_at_message_count() {
        let args = BenchArgs::try_parse_from(["opra-bench", "-m", "64"]).unwrap();
        assert_eq!(args.subscribe_config().limit, 64);
        assert_eq!(args.publish_config().messages, 64);
        assert_eq!(args.drain_timeout, Duration::from_secs(1));
    }

    #[test]
    fn bench_drain_timeout_and_aeron_dir() {
        let args = BenchArgs::try_parse_from([
            "opra-bench",
            "--drain-timeout",
            "250ms",
            "--aeron-dir",
            "/dev/shm/aeron-bench",
        ])
        .unwrap();
        assert_eq!(args.drain_timeout, Duration::from_millis(250));
        assert_eq!(args.common.aeron_dir.as_deref(), Some("/dev/shm/aeron-bench"));
    }
}
