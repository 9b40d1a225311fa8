//! OPRA Market Data Records
//!
//! Fixed-layout option quote and trade records and the templates the
//! publisher derives each outgoing message from.
//!
//! # Wire Layout
//!
//! ```text
//! Quote (39 bytes)                       Trade (30 bytes)
//! ┌────────┬──────────────┐              ┌────────┬───────────────┐
//! │  0- 4  │ symbol       │              │  0- 4  │ symbol        │
//! │  5- 7  │ expiration   │              │  5- 7  │ expiration    │
//! │  8-15  │ timestamp    │              │  8-15  │ timestamp     │
//! │ 16-19  │ strike_price │              │ 16-19  │ strike_price  │
//! │ 20-23  │ bid_price    │              │ 20-23  │ premium_price │
//! │ 24-27  │ ask_price    │              │ 24-27  │ volume        │
//! │ 28-31  │ bid_size     │              │    28  │ exchange      │
//! │ 32-35  │ ask_size     │              │    29  │ condition     │
//! │    36  │ bid_exchange │              └────────┴───────────────┘
//! │    37  │ ask_exchange │
//! │    38  │ condition    │
//! └────────┴──────────────┘
//! ```
//!
//! A framed message is a one byte tag (`q` or `t`) followed by the record.

pub mod codec;

use serde::{Serialize, Serializer};

// =============================================================================
// Layout Constants
// =============================================================================

/// Width of the symbol field.
pub const SYMBOL_LEN: usize = 5;

/// Width of the expiration code field.
pub const EXPIRATION_LEN: usize = 3;

/// Encoded length of a quote record (without tag).
pub const QUOTE_LEN: usize = 39;

/// Encoded length of a trade record (without tag).
pub const TRADE_LEN: usize = 30;

/// Length of the framing tag.
pub const TAG_LEN: usize = 1;

/// Framed quote length (tag + record).
pub const QUOTE_FRAME_LEN: usize = TAG_LEN + QUOTE_LEN;

/// Framed trade length (tag + record).
pub const TRADE_FRAME_LEN: usize = TAG_LEN + TRADE_LEN;

/// Largest framed message.
pub const MAX_FRAME_LEN: usize = QUOTE_FRAME_LEN;

/// Average framed length of the alternating trade/quote stream.
#[allow(clippy::cast_precision_loss)]
pub const AVERAGE_FRAME_LEN: f64 = (TRADE_FRAME_LEN + QUOTE_FRAME_LEN) as f64 / 2.0;

/// Framing tag for quotes.
pub const QUOTE_TAG: u8 = b'q';

/// Framing tag for trades.
pub const TRADE_TAG: u8 = b't';

/// Number of distinct per-message variations.
const VARIATION_CYCLE: u64 = 26;

// =============================================================================
// Field Types
// =============================================================================

/// Five byte, NUL padded root symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Symbol([u8; SYMBOL_LEN]);

impl Symbol {
    /// Wrap raw symbol bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; SYMBOL_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a symbol from a ticker, truncating to the field width and
    /// padding with NUL.
    #[must_use]
    pub fn from_ticker(ticker: &str) -> Self {
        let mut bytes = [0u8; SYMBOL_LEN];
        for (dst, src) in bytes.iter_mut().zip(ticker.bytes()) {
            *dst = src;
        }
        Self(bytes)
    }

    /// Raw field bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; SYMBOL_LEN] {
        &self.0
    }

    /// Ticker text without NUL padding.
    #[must_use]
    pub fn ticker(&self) -> String {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(SYMBOL_LEN);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl Serialize for Symbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.ticker())
    }
}

/// Three byte expiration code: month code, two digit year, day.
///
/// Month codes `A`-`L` are calls January-December, `M`-`X` are puts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Expiration([u8; EXPIRATION_LEN]);

impl Expiration {
    /// Wrap raw expiration bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; EXPIRATION_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw field bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; EXPIRATION_LEN] {
        &self.0
    }
}

fn serialize_code<S: Serializer>(code: &u8, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_char(char::from(*code))
}

// =============================================================================
// Records
// =============================================================================

/// Option quote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Quote {
    /// Root symbol.
    pub symbol: Symbol,
    /// Expiration code.
    pub expiration: Expiration,
    /// Monotonic nanosecond timestamp assigned at encode time.
    pub timestamp: u64,
    /// Strike price.
    pub strike_price: u32,
    /// Bid price.
    pub bid_price: u32,
    /// Ask price.
    pub ask_price: u32,
    /// Bid size.
    pub bid_size: u32,
    /// Ask size.
    pub ask_size: u32,
    /// Bid exchange code.
    #[serde(serialize_with = "serialize_code")]
    pub bid_exchange: u8,
    /// Ask exchange code.
    #[serde(serialize_with = "serialize_code")]
    pub ask_exchange: u8,
    /// Quote condition code.
    #[serde(serialize_with = "serialize_code")]
    pub condition: u8,
}

/// Option trade record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Trade {
    /// Root symbol.
    pub symbol: Symbol,
    /// Expiration code.
    pub expiration: Expiration,
    /// Monotonic nanosecond timestamp assigned at encode time.
    pub timestamp: u64,
    /// Strike price.
    pub strike_price: u32,
    /// Premium (trade) price.
    pub premium_price: u32,
    /// Traded volume.
    pub volume: u32,
    /// Exchange code.
    #[serde(serialize_with = "serialize_code")]
    pub exchange: u8,
    /// Trade condition code.
    #[serde(serialize_with = "serialize_code")]
    pub condition: u8,
}

/// Position of a message within the 26-step variation cycle.
#[allow(clippy::cast_possible_truncation)]
const fn variation(index: u64) -> u8 {
    (index % VARIATION_CYCLE) as u8
}

impl Quote {
    /// Template every published quote is derived from.
    pub const TEMPLATE: Self = Self {
        symbol: Symbol::from_bytes(*b"AAPL\0"),
        // 2023-12-18 call
        expiration: Expiration::from_bytes([b'L', 23, 18]),
        timestamp: 0,
        strike_price: 0,
        bid_price: 123_456,
        ask_price: 987_654,
        bid_size: 111,
        ask_size: 999,
        bid_exchange: b'A',
        ask_exchange: b'Z',
        condition: b'a',
    };

    /// Derive the quote for message `index`, stamped with `timestamp`.
    #[must_use]
    pub const fn for_message(self, index: u64, timestamp: u64) -> Self {
        let shift = variation(index);
        Self {
            timestamp,
            condition: b'a' + shift,
            ask_exchange: b'A' + shift,
            bid_exchange: b'Z' - shift,
            ask_size: 201 + shift as u32,
            bid_size: 199 - shift as u32,
            ..self
        }
    }
}

impl Trade {
    /// Template every published trade is derived from.
    pub const TEMPLATE: Self = Self {
        symbol: Symbol::from_bytes(*b"AAPL\0"),
        // 2023-08-18 put
        expiration: Expiration::from_bytes([b'T', 23, 18]),
        timestamp: 0,
        strike_price: 123_456,
        premium_price: 987_654,
        volume: 111,
        exchange: b'A',
        condition: b'a',
    };

    /// Derive the trade for message `index`, stamped with `timestamp`.
    #[must_use]
    pub const fn for_message(self, index: u64, timestamp: u64) -> Self {
        let shift = variation(index);
        Self {
            timestamp,
            condition: b'a' + shift,
            exchange: b'A' + shift,
            volume: 100 + shift as u32,
            ..self
        }
    }
}

// =============================================================================
// Record Kind
// =============================================================================

/// Discriminates the two record shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Option quote.
    Quote,
    /// Option trade.
    Trade,
}

impl RecordKind {
    /// Kind published at message `index`: even indices are trades.
    #[must_use]
    pub const fn for_index(index: u64) -> Self {
        if index % 2 == 0 { Self::Trade } else { Self::Quote }
    }

    /// Resolve a framing tag.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            QUOTE_TAG => Some(Self::Quote),
            TRADE_TAG => Some(Self::Trade),
            _ => None,
        }
    }

    /// Framing tag byte.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Quote => QUOTE_TAG,
            Self::Trade => TRADE_TAG,
        }
    }

    /// Encoded record length without tag.
    #[must_use]
    pub const fn record_len(self) -> usize {
        match self {
            Self::Quote => QUOTE_LEN,
            Self::Trade => TRADE_LEN,
        }
    }

    /// Framed message length.
    #[must_use]
    pub const fn frame_len(self) -> usize {
        TAG_LEN + self.record_len()
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::Trade => "trade",
        }
    }
}

// =============================================================================
// Record
// =============================================================================

/// A decoded or outgoing market data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "T")]
pub enum Record {
    /// Option quote (`q`).
    #[serde(rename = "q")]
    Quote(Quote),
    /// Option trade (`t`).
    #[serde(rename = "t")]
    Trade(Trade),
}

impl Record {
    /// Record shape.
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::Quote(_) => RecordKind::Quote,
            Self::Trade(_) => RecordKind::Trade,
        }
    }

    /// Framed message length.
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        self.kind().frame_len()
    }

    /// Timestamp carried by the record.
    #[must_use]
    pub const fn timestamp(&self) -> u64 {
        match self {
            Self::Quote(quote) => quote.timestamp,
            Self::Trade(trade) => trade.timestamp,
        }
    }
}

// =============================================================================
// Templates
// =============================================================================

/// Immutable templates for the alternating trade/quote stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTemplates {
    /// Trade template.
    pub trade: Trade,
    /// Quote template.
    pub quote: Quote,
}

impl Default for RecordTemplates {
    fn default() -> Self {
        Self {
            trade: Trade::TEMPLATE,
            quote: Quote::TEMPLATE,
        }
    }
}

impl RecordTemplates {
    /// Build the owned record for message `index`.
    #[must_use]
    pub const fn record_for(&self, index: u64, timestamp: u64) -> Record {
        match RecordKind::for_index(index) {
            RecordKind::Trade => Record::Trade(self.trade.for_message(index, timestamp)),
            RecordKind::Quote => Record::Quote(self.quote.for_message(index, timestamp)),
        }
    }
}
