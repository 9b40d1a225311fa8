//! Domain Layer - Market data records and their wire codec.
//!
//! Pure value types and byte-level encode/decode with no I/O.

/// OPRA quote/trade records, templates and the record codec.
pub mod market_data;
