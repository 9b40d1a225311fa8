#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! OPRA Bench - Back-pressure Aware Market Data Pub/Sub
//!
//! Publishes fixed-layout OPRA option quote and trade records through a
//! claim/offer/poll transport and subscribes to them again, reporting
//! throughput and how often the publisher was back-pressured.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Records and their byte-exact codec
//!   - `market_data`: Quote/Trade layouts, templates, framing tags
//!
//! - **Application**: Loops and port definitions
//!   - `ports`: Publication, subscription and sink interfaces
//!   - `services`: Publication strategies, publish loop, fragment
//!     assembler, subscribe loop, idle strategies
//!
//! - **Infrastructure**: Adapters and ambient concerns
//!   - `transport`: In-process log and UDP transports, and the Aeron
//!     media driver behind the `aeron` feature
//!   - `config`: CLI/env settings
//!   - `rate`: Periodic throughput sampling
//!   - `metrics`, `telemetry`, `printer`, `shutdown`
//!
//! # Data Flow
//!
//! ```text
//! PublishLoop ─► PublishStrategy ─► encode ─► transport
//!                (claim | offer)                  │
//!                                                 ▼
//! RecordHandler ◄─ decode ◄─ FragmentAssembler ◄─ SubscribeLoop (poll)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Records and codec with no I/O.
pub mod domain;

/// Application layer - Loops and port definitions.
pub mod application;

/// Infrastructure layer - Transports and ambient concerns.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market_data::codec::{CodecError, MalformedMessage, decode, encode_frame};
pub use domain::market_data::{Quote, Record, RecordKind, RecordTemplates, Trade};

// Ports
pub use application::ports::{
    BufferClaim, ExclusivePublication, FragmentHeader, FrameFlags, NoopRateSink,
    NoopRecordHandler, OfferRejection, PollError, RateSink, RecordHandler, SharedPublication,
    Subscription,
};

// Services
pub use application::services::{
    ExclusiveClaim, FragmentAssembler, IdleStrategy, PublishConfig, PublishError, PublishLoop,
    PublishReport, PublishStrategy, SharedOffer, SubscribeConfig, SubscribeError, SubscribeLoop,
    SubscribeReport,
};

// Transports
pub use infrastructure::transport::ipc::{IpcChannel, IpcConfig};
pub use infrastructure::transport::udp::{UdpPublication, UdpSubscription};
#[cfg(feature = "aeron")]
pub use infrastructure::transport::aeron::{
    AeronClient, AeronExclusive, AeronShared, AeronSubscriber,
};
pub use infrastructure::transport::{ChannelUri, ChannelUriError, Media, TransportError};

// Config
pub use infrastructure::config::{BenchArgs, PublisherArgs, SubscriberArgs};

// Ambient
pub use infrastructure::metrics::{Direction, init_metrics};
pub use infrastructure::printer::JsonPrinter;
pub use infrastructure::rate::{RateCounter, RateReporter, RateReporterConfig, RateTotals};
pub use infrastructure::shutdown::{await_shutdown, drain_or_cancel};
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
