//! Transports
//!
//! Concrete implementations of the publication and subscription ports,
//! selected by an `aeron:` channel URI.
//!
//! Built in, for runs without a media driver:
//!
//! - `aeron:ipc[?mtu=N|term-length=N]`: in-process log ([`ipc`])
//! - `aeron:udp?endpoint=host:port[|mtu=N]`: UDP datagrams ([`udp`])
//!
//! Neither built-in transport retransmits or reorders. With the `aeron`
//! feature, [`aeron`] reaches a real media driver on the same URIs and
//! interoperates with any other Aeron client.

#[cfg(feature = "aeron")]
pub mod aeron;
pub mod ipc;
pub mod udp;

use std::fmt;
use std::str::FromStr;

use crate::infrastructure::config::parse_size;

/// Default maximum transmission unit, header included.
pub const DEFAULT_MTU: usize = 1408;

/// Bytes of every fragment taken by the data header.
pub const DATA_HEADER_LEN: usize = 12;

/// Largest MTU a UDP fragment can use (payload length is a `u16`).
pub const MAX_MTU: usize = 65_504;

// =============================================================================
// Errors
// =============================================================================

/// Channel URI parse failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelUriError {
    /// URI does not start with `aeron:`.
    #[error("channel must start with 'aeron:': {0}")]
    MissingScheme(String),

    /// Media other than `ipc` or `udp`.
    #[error("unsupported media '{0}' (expected ipc or udp)")]
    UnsupportedMedia(String),

    /// UDP channel without `endpoint=`.
    #[error("udp channel requires an endpoint: {0}")]
    MissingEndpoint(String),

    /// Parameter not of the form `key=value`.
    #[error("malformed channel parameter '{0}'")]
    MalformedParam(String),

    /// Parameter value failed to parse or is out of range.
    #[error("invalid value for '{key}': {value}")]
    InvalidValue {
        /// Parameter name.
        key: String,
        /// Offending value.
        value: String,
    },
}

/// Transport construction and I/O failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Channel URI is invalid.
    #[error(transparent)]
    Uri(#[from] ChannelUriError),

    /// Socket setup failed.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Endpoint did not resolve to any address.
    #[error("endpoint '{0}' did not resolve")]
    Unresolved(String),

    /// The channel already has its one subscription.
    #[error("stream {0} already has a subscription")]
    AlreadySubscribed(i32),

    /// The channel cannot be used this way.
    #[error("unsupported channel: {0}")]
    Unsupported(String),

    /// The Aeron media driver refused or failed a request.
    #[error("aeron driver: {0}")]
    Driver(String),
}

impl TransportError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

// =============================================================================
// Channel URI
// =============================================================================

/// Transport medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    /// In-process log.
    Ipc,
    /// UDP datagrams.
    Udp,
}

impl Media {
    /// URI spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ipc => "ipc",
            Self::Udp => "udp",
        }
    }
}

/// Parsed `aeron:` channel URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUri {
    /// Medium selected by the URI.
    pub media: Media,
    /// `host:port` for UDP.
    pub endpoint: Option<String>,
    /// Maximum fragment size including the data header.
    pub mtu: usize,
    /// Term length override for IPC.
    pub term_length: Option<usize>,
    /// Parameters only a media driver interprets, in URI order.
    pub extra_params: Vec<(String, String)>,
}

impl ChannelUri {
    /// The `aeron:ipc` channel with defaults.
    #[must_use]
    pub const fn ipc() -> Self {
        Self {
            media: Media::Ipc,
            endpoint: None,
            mtu: DEFAULT_MTU,
            term_length: None,
            extra_params: Vec::new(),
        }
    }

    /// A UDP channel on `endpoint` with defaults.
    #[must_use]
    pub fn udp(endpoint: impl Into<String>) -> Self {
        Self {
            media: Media::Udp,
            endpoint: Some(endpoint.into()),
            mtu: DEFAULT_MTU,
            term_length: None,
            extra_params: Vec::new(),
        }
    }

    /// Largest payload a single fragment carries.
    #[must_use]
    pub const fn max_payload_length(&self) -> usize {
        self.mtu - DATA_HEADER_LEN
    }

    /// UDP endpoint, or an error for channels without one.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelUriError::MissingEndpoint`] when none is set.
    pub fn require_endpoint(&self) -> Result<&str, ChannelUriError> {
        self.endpoint
            .as_deref()
            .ok_or_else(|| ChannelUriError::MissingEndpoint(self.to_string()))
    }
}

fn invalid(key: &str, value: &str) -> ChannelUriError {
    ChannelUriError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_len(value: &str) -> Option<usize> {
    parse_size(value)
        .ok()
        .and_then(|len| usize::try_from(len).ok())
}

impl FromStr for ChannelUri {
    type Err = ChannelUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .trim()
            .strip_prefix("aeron:")
            .ok_or_else(|| ChannelUriError::MissingScheme(s.to_string()))?;
        let (media, params) = rest.split_once('?').unwrap_or((rest, ""));

        let mut uri = match media {
            "ipc" => Self::ipc(),
            "udp" => Self {
                media: Media::Udp,
                ..Self::ipc()
            },
            other => return Err(ChannelUriError::UnsupportedMedia(other.to_string())),
        };

        for param in params.split('|').filter(|p| !p.is_empty()) {
            let (key, value) = param
                .split_once('=')
                .ok_or_else(|| ChannelUriError::MalformedParam(param.to_string()))?;
            match key {
                "endpoint" if !value.is_empty() => uri.endpoint = Some(value.to_string()),
                "endpoint" => return Err(invalid(key, value)),
                "mtu" => {
                    let mtu = parse_len(value).ok_or_else(|| invalid(key, value))?;
                    if mtu <= DATA_HEADER_LEN || mtu > MAX_MTU {
                        return Err(invalid(key, value));
                    }
                    uri.mtu = mtu;
                }
                "term-length" => {
                    let len = parse_len(value).ok_or_else(|| invalid(key, value))?;
                    if len == 0 {
                        return Err(invalid(key, value));
                    }
                    uri.term_length = Some(len);
                }
                // Kept for the media driver; the built-in transports ignore them.
                _ => {
                    tracing::debug!(key, value, "Passing through channel parameter");
                    uri.extra_params.push((key.to_string(), value.to_string()));
                }
            }
        }

        if let Some(term_length) = uri.term_length
            && term_length < uri.mtu
        {
            return Err(invalid("term-length", &term_length.to_string()));
        }

        if uri.media == Media::Udp && uri.endpoint.is_none() {
            return Err(ChannelUriError::MissingEndpoint(s.to_string()));
        }
        Ok(uri)
    }
}

impl fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aeron:{}", self.media.as_str())?;
        let mut sep = '?';
        if let Some(endpoint) = &self.endpoint {
            write!(f, "{sep}endpoint={endpoint}")?;
            sep = '|';
        }
        if self.mtu != DEFAULT_MTU {
            write!(f, "{sep}mtu={}", self.mtu)?;
            sep = '|';
        }
        if let Some(term_length) = self.term_length {
            write!(f, "{sep}term-length={term_length}")?;
            sep = '|';
        }
        for (key, value) in &self.extra_params {
            write!(f, "{sep}{key}={value}")?;
            sep = '|';
        }
        Ok(())
    }
}
