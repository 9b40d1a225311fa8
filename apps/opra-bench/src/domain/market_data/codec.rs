//! Record Codec
//!
//! Explicit field-by-field encode/decode of the packed quote and trade
//! layouts. Multi-byte integers use the native byte order of the build
//! target; nothing is negotiated on the wire.
//!
//! Encoding never allocates: the destination is caller-provided and is
//! usually a region claimed from the transport.

use super::{
    EXPIRATION_LEN, Expiration, QUOTE_LEN, Quote, Record, RecordKind, SYMBOL_LEN, Symbol,
    TAG_LEN, TRADE_LEN, Trade,
};

// Field offsets shared by both layouts.
const SYMBOL_AT: usize = 0;
const EXPIRATION_AT: usize = 5;
const TIMESTAMP_AT: usize = 8;
const STRIKE_AT: usize = 16;

// Quote-only offsets.
const BID_PRICE_AT: usize = 20;
const ASK_PRICE_AT: usize = 24;
const BID_SIZE_AT: usize = 28;
const ASK_SIZE_AT: usize = 32;
const BID_EXCHANGE_AT: usize = 36;
const ASK_EXCHANGE_AT: usize = 37;
const QUOTE_CONDITION_AT: usize = 38;

// Trade-only offsets.
const PREMIUM_AT: usize = 20;
const VOLUME_AT: usize = 24;
const EXCHANGE_AT: usize = 28;
const TRADE_CONDITION_AT: usize = 29;

/// Reasons a framed message cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedMessage {
    /// Zero-length message.
    #[error("empty message")]
    Empty,

    /// Tag byte is neither `q` nor `t`.
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),

    /// Buffer shorter than the length the tag requires.
    #[error("truncated '{tag}' message: need {need} bytes, got {got}")]
    Truncated {
        /// Tag of the message.
        tag: char,
        /// Framed length the tag requires.
        need: usize,
        /// Bytes available.
        got: usize,
    },
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Destination cannot hold the encoded layout.
    #[error("buffer too small: need {need} bytes, got {got}")]
    BufferTooSmall {
        /// Bytes required.
        need: usize,
        /// Bytes available.
        got: usize,
    },

    /// Message could not be decoded.
    #[error(transparent)]
    Malformed(#[from] MalformedMessage),
}

const fn ensure_capacity(dst: &[u8], need: usize) -> Result<(), CodecError> {
    if dst.len() < need {
        return Err(CodecError::BufferTooSmall {
            need,
            got: dst.len(),
        });
    }
    Ok(())
}

fn put_u32(dst: &mut [u8], at: usize, value: u32) {
    dst[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

fn put_u64(dst: &mut [u8], at: usize, value: u64) {
    dst[at..at + 8].copy_from_slice(&value.to_ne_bytes());
}

fn get_u32(src: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&src[at..at + 4]);
    u32::from_ne_bytes(bytes)
}

fn get_u64(src: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&src[at..at + 8]);
    u64::from_ne_bytes(bytes)
}

fn put_head(dst: &mut [u8], symbol: Symbol, expiration: Expiration, timestamp: u64, strike: u32) {
    dst[SYMBOL_AT..SYMBOL_AT + SYMBOL_LEN].copy_from_slice(symbol.as_bytes());
    dst[EXPIRATION_AT..EXPIRATION_AT + EXPIRATION_LEN].copy_from_slice(expiration.as_bytes());
    put_u64(dst, TIMESTAMP_AT, timestamp);
    put_u32(dst, STRIKE_AT, strike);
}

fn get_symbol(src: &[u8]) -> Symbol {
    let mut bytes = [0u8; SYMBOL_LEN];
    bytes.copy_from_slice(&src[SYMBOL_AT..SYMBOL_AT + SYMBOL_LEN]);
    Symbol::from_bytes(bytes)
}

fn get_expiration(src: &[u8]) -> Expiration {
    let mut bytes = [0u8; EXPIRATION_LEN];
    bytes.copy_from_slice(&src[EXPIRATION_AT..EXPIRATION_AT + EXPIRATION_LEN]);
    Expiration::from_bytes(bytes)
}

/// Encode a quote into the 39-byte layout.
///
/// # Errors
///
/// Returns [`CodecError::BufferTooSmall`] if `dst` is shorter than 39 bytes.
pub fn encode_quote(dst: &mut [u8], quote: &Quote) -> Result<usize, CodecError> {
    ensure_capacity(dst, QUOTE_LEN)?;
    put_head(
        dst,
        quote.symbol,
        quote.expiration,
        quote.timestamp,
        quote.strike_price,
    );
    put_u32(dst, BID_PRICE_AT, quote.bid_price);
    put_u32(dst, ASK_PRICE_AT, quote.ask_price);
    put_u32(dst, BID_SIZE_AT, quote.bid_size);
    put_u32(dst, ASK_SIZE_AT, quote.ask_size);
    dst[BID_EXCHANGE_AT] = quote.bid_exchange;
    dst[ASK_EXCHANGE_AT] = quote.ask_exchange;
    dst[QUOTE_CONDITION_AT] = quote.condition;
    Ok(QUOTE_LEN)
}

/// Encode a trade into the 30-byte layout.
///
/// # Errors
///
/// Returns [`CodecError::BufferTooSmall`] if `dst` is shorter than 30 bytes.
pub fn encode_trade(dst: &mut [u8], trade: &Trade) -> Result<usize, CodecError> {
    ensure_capacity(dst, TRADE_LEN)?;
    put_head(
        dst,
        trade.symbol,
        trade.expiration,
        trade.timestamp,
        trade.strike_price,
    );
    put_u32(dst, PREMIUM_AT, trade.premium_price);
    put_u32(dst, VOLUME_AT, trade.volume);
    dst[EXCHANGE_AT] = trade.exchange;
    dst[TRADE_CONDITION_AT] = trade.condition;
    Ok(TRADE_LEN)
}

/// Encode a tagged message: tag byte then record layout.
///
/// Returns the framed length written.
///
/// # Errors
///
/// Returns [`CodecError::BufferTooSmall`] if `dst` cannot hold the frame.
pub fn encode_frame(dst: &mut [u8], record: &Record) -> Result<usize, CodecError> {
    let need = record.frame_len();
    ensure_capacity(dst, need)?;
    dst[0] = record.kind().tag();
    let body = &mut dst[TAG_LEN..];
    let written = match record {
        Record::Quote(quote) => encode_quote(body, quote)?,
        Record::Trade(trade) => encode_trade(body, trade)?,
    };
    Ok(TAG_LEN + written)
}

fn decode_quote(src: &[u8]) -> Quote {
    Quote {
        symbol: get_symbol(src),
        expiration: get_expiration(src),
        timestamp: get_u64(src, TIMESTAMP_AT),
        strike_price: get_u32(src, STRIKE_AT),
        bid_price: get_u32(src, BID_PRICE_AT),
        ask_price: get_u32(src, ASK_PRICE_AT),
        bid_size: get_u32(src, BID_SIZE_AT),
        ask_size: get_u32(src, ASK_SIZE_AT),
        bid_exchange: src[BID_EXCHANGE_AT],
        ask_exchange: src[ASK_EXCHANGE_AT],
        condition: src[QUOTE_CONDITION_AT],
    }
}

fn decode_trade(src: &[u8]) -> Trade {
    Trade {
        symbol: get_symbol(src),
        expiration: get_expiration(src),
        timestamp: get_u64(src, TIMESTAMP_AT),
        strike_price: get_u32(src, STRIKE_AT),
        premium_price: get_u32(src, PREMIUM_AT),
        volume: get_u32(src, VOLUME_AT),
        exchange: src[EXCHANGE_AT],
        condition: src[TRADE_CONDITION_AT],
    }
}

/// Decode a framed message, dispatching on the tag byte.
///
/// Bytes past the tag's declared length are ignored.
///
/// # Errors
///
/// Returns [`MalformedMessage`] for an empty buffer, an unknown tag, or a
/// buffer shorter than the tag requires. No field is read in that case.
pub fn decode(buf: &[u8]) -> Result<Record, MalformedMessage> {
    let (&tag, body) = buf.split_first().ok_or(MalformedMessage::Empty)?;
    let kind = RecordKind::from_tag(tag).ok_or(MalformedMessage::UnknownTag(tag))?;

    if body.len() < kind.record_len() {
        return Err(MalformedMessage::Truncated {
            tag: char::from(tag),
            need: kind.frame_len(),
            got: buf.len(),
        });
    }

    Ok(match kind {
        RecordKind::Quote => Record::Quote(decode_quote(&body[..QUOTE_LEN])),
        RecordKind::Trade => Record::Trade(decode_trade(&body[..TRADE_LEN])),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market_data::{MAX_FRAME_LEN, QUOTE_FRAME_LEN, RecordTemplates, TRADE_FRAME_LEN};
    use proptest::prelude::*;
    use test_case::test_case;

    fn sample_quote() -> Quote {
        Quote::TEMPLATE.for_message(5, 0x0102_0304_0506_0708)
    }

    fn sample_trade() -> Trade {
        Trade::TEMPLATE.for_message(4, 77)
    }

    #[test]
    fn quote_layout_offsets() {
        let quote = sample_quote();
        let mut buf = [0u8; QUOTE_LEN];
        assert_eq!(encode_quote(&mut buf, &quote).unwrap(), QUOTE_LEN);

        assert_eq!(&buf[0..5], b"AAPL\0");
        assert_eq!(&buf[5..8], &[b'L', 23, 18]);
        assert_eq!(&buf[8..16], &quote.timestamp.to_ne_bytes());
        assert_eq!(&buf[16..20], &0u32.to_ne_bytes());
        assert_eq!(&buf[20..24], &123_456u32.to_ne_bytes());
        assert_eq!(&buf[24..28], &987_654u32.to_ne_bytes());
        assert_eq!(&buf[28..32], &194u32.to_ne_bytes());
        assert_eq!(&buf[32..36], &206u32.to_ne_bytes());
        assert_eq!(buf[36], b'U');
        assert_eq!(buf[37], b'F');
        assert_eq!(buf[38], b'f');
    }

    #[test]
    fn trade_layout_offsets() {
        let trade = sample_trade();
        let mut buf = [0u8; TRADE_LEN];
        assert_eq!(encode_trade(&mut buf, &trade).unwrap(), TRADE_LEN);

        assert_eq!(&buf[0..5], b"AAPL\0");
        assert_eq!(&buf[5..8], &[b'T', 23, 18]);
        assert_eq!(&buf[8..16], &77u64.to_ne_bytes());
        assert_eq!(&buf[16..20], &123_456u32.to_ne_bytes());
        assert_eq!(&buf[20..24], &987_654u32.to_ne_bytes());
        assert_eq!(&buf[24..28], &104u32.to_ne_bytes());
        assert_eq!(buf[28], b'E');
        assert_eq!(buf[29], b'e');
    }

    #[test]
    fn encode_frame_writes_tag_first() {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let written = encode_frame(&mut buf, &Record::Trade(sample_trade())).unwrap();
        assert_eq!(written, TRADE_FRAME_LEN);
        assert_eq!(buf[0], b't');

        let written = encode_frame(&mut buf, &Record::Quote(sample_quote())).unwrap();
        assert_eq!(written, QUOTE_FRAME_LEN);
        assert_eq!(buf[0], b'q');
    }

    #[test]
    fn encode_rejects_short_destination() {
        let mut buf = [0u8; QUOTE_LEN - 1];
        assert_eq!(
            encode_quote(&mut buf, &sample_quote()),
            Err(CodecError::BufferTooSmall {
                need: QUOTE_LEN,
                got: QUOTE_LEN - 1
            })
        );

        let mut frame = [0u8; TRADE_LEN];
        assert!(encode_frame(&mut frame, &Record::Trade(sample_trade())).is_err());
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut buf = [0xAAu8; 64];
        let record = Record::Trade(sample_trade());
        encode_frame(&mut buf, &record).unwrap();
        assert_eq!(decode(&buf).unwrap(), record);
    }

    #[test]
    fn decode_empty() {
        assert_eq!(decode(&[]), Err(MalformedMessage::Empty));
    }

    #[test_case(b'x' ; "lowercase x")]
    #[test_case(b'Q' ; "uppercase q")]
    #[test_case(0 ; "nul")]
    fn decode_unknown_tag(tag: u8) {
        let mut buf = [0u8; MAX_FRAME_LEN];
        buf[0] = tag;
        assert_eq!(decode(&buf), Err(MalformedMessage::UnknownTag(tag)));
    }

    #[test_case(b'q', QUOTE_FRAME_LEN - 1 ; "quote one short")]
    #[test_case(b'q', 1 ; "quote tag only")]
    #[test_case(b't', TRADE_FRAME_LEN - 1 ; "trade one short")]
    #[test_case(b't', 2 ; "trade two bytes")]
    fn decode_truncated(tag: u8, len: usize) {
        let mut buf = vec![0u8; len];
        buf[0] = tag;
        assert_eq!(
            decode(&buf),
            Err(MalformedMessage::Truncated {
                tag: char::from(tag),
                need: RecordKind::from_tag(tag).unwrap().frame_len(),
                got: len,
            })
        );
    }

    #[test_case(b'q', QUOTE_FRAME_LEN, RecordKind::Quote ; "exact quote")]
    #[test_case(b't', TRADE_FRAME_LEN, RecordKind::Trade ; "exact trade")]
    #[test_case(b't', QUOTE_FRAME_LEN, RecordKind::Trade ; "trade with trailing bytes")]
    fn decode_dispatches_on_tag(tag: u8, len: usize, expected: RecordKind) {
        let mut buf = vec![0u8; len];
        buf[0] = tag;
        assert_eq!(decode(&buf).unwrap().kind(), expected);
    }

    #[test]
    fn malformed_message_display() {
        let err = MalformedMessage::Truncated {
            tag: 'q',
            need: 40,
            got: 12,
        };
        assert_eq!(err.to_string(), "truncated 'q' message: need 40 bytes, got 12");
        assert_eq!(
            MalformedMessage::UnknownTag(b'x').to_string(),
            "unknown message tag 0x78"
        );
    }

    #[test]
    fn published_stream_decodes() {
        let templates = RecordTemplates::default();
        let mut buf = [0u8; MAX_FRAME_LEN];
        for index in 0..52 {
            let record = templates.record_for(index, index * 10);
            let len = encode_frame(&mut buf, &record).unwrap();
            assert_eq!(decode(&buf[..len]).unwrap(), record);
        }
    }

    fn any_quote() -> impl Strategy<Value = Quote> {
        (
            any::<[u8; SYMBOL_LEN]>(),
            any::<[u8; EXPIRATION_LEN]>(),
            any::<u64>(),
            any::<[u32; 5]>(),
            any::<[u8; 3]>(),
        )
            .prop_map(|(symbol, expiration, timestamp, ints, codes)| Quote {
                symbol: Symbol::from_bytes(symbol),
                expiration: Expiration::from_bytes(expiration),
                timestamp,
                strike_price: ints[0],
                bid_price: ints[1],
                ask_price: ints[2],
                bid_size: ints[3],
                ask_size: ints[4],
                bid_exchange: codes[0],
                ask_exchange: codes[1],
                condition: codes[2],
            })
    }

    fn any_trade() -> impl Strategy<Value = Trade> {
        (
            any::<[u8; SYMBOL_LEN]>(),
            any::<[u8; EXPIRATION_LEN]>(),
            any::<u64>(),
            any::<[u32; 3]>(),
            any::<[u8; 2]>(),
        )
            .prop_map(|(symbol, expiration, timestamp, ints, codes)| Trade {
                symbol: Symbol::from_bytes(symbol),
                expiration: Expiration::from_bytes(expiration),
                timestamp,
                strike_price: ints[0],
                premium_price: ints[1],
                volume: ints[2],
                exchange: codes[0],
                condition: codes[1],
            })
    }

    proptest! {
        #[test]
        fn quote_survives_encode_decode(quote in any_quote()) {
            let mut buf = [0u8; MAX_FRAME_LEN];
            let len = encode_frame(&mut buf, &Record::Quote(quote)).unwrap();
            prop_assert_eq!(len, QUOTE_FRAME_LEN);
            prop_assert_eq!(decode(&buf[..len]).unwrap(), Record::Quote(quote));
        }

        #[test]
        fn trade_survives_encode_decode(trade in any_trade()) {
            let mut buf = [0u8; MAX_FRAME_LEN];
            let len = encode_frame(&mut buf, &Record::Trade(trade)).unwrap();
            prop_assert_eq!(len, TRADE_FRAME_LEN);
            prop_assert_eq!(decode(&buf[..len]).unwrap(), Record::Trade(trade));
        }

        #[test]
        fn short_buffers_never_decode(tag in prop::sample::select(vec![b'q', b't']), len in 1usize..31) {
            let mut buf = vec![0u8; len];
            buf[0] = tag;
            let need = RecordKind::from_tag(tag).unwrap().frame_len();
            if len < need {
                let is_truncated = matches!(decode(&buf), Err(MalformedMessage::Truncated { .. }));
                prop_assert!(is_truncated);
            }
        }
    }
}
