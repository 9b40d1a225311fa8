//! Port Interfaces
//!
//! The narrow transport contract the publish and subscribe loops consume,
//! plus the sinks they report into. Infrastructure adapters (the IPC log
//! and the UDP transport) implement these.
//!
//! ## Driven Ports (Outbound)
//!
//! - `ExclusivePublication`: claim a region, write in place, commit
//! - `SharedPublication`: offer a fully built message by copy
//! - `Subscription`: poll delivered fragments
//!
//! ## Sinks
//!
//! - `RateSink`: per-message byte counts for throughput reporting
//! - `RecordHandler`: decoded records for the application

use std::sync::Arc;

use crate::domain::market_data::Record;

// =============================================================================
// Fragment Header
// =============================================================================

/// Begin/end markers of a fragment within its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameFlags {
    /// First fragment of a message.
    pub begin: bool,
    /// Last fragment of a message.
    pub end: bool,
}

impl FrameFlags {
    /// A message carried by a single fragment.
    pub const UNFRAGMENTED: Self = Self {
        begin: true,
        end: true,
    };

    /// First of several fragments.
    pub const BEGIN: Self = Self {
        begin: true,
        end: false,
    };

    /// Neither first nor last.
    pub const MIDDLE: Self = Self {
        begin: false,
        end: false,
    };

    /// Last of several fragments.
    pub const END: Self = Self {
        begin: false,
        end: true,
    };

    const BEGIN_BIT: u8 = 0x80;
    const END_BIT: u8 = 0x40;

    /// Flags for fragment `index` of `count`.
    #[must_use]
    pub const fn for_fragment(index: usize, count: usize) -> Self {
        Self {
            begin: index == 0,
            end: index + 1 == count,
        }
    }

    /// Pack into a wire byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.begin {
            byte |= Self::BEGIN_BIT;
        }
        if self.end {
            byte |= Self::END_BIT;
        }
        byte
    }

    /// Unpack from a wire byte; unknown bits are ignored.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self {
            begin: byte & Self::BEGIN_BIT != 0,
            end: byte & Self::END_BIT != 0,
        }
    }
}

/// Metadata delivered with every fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentHeader {
    /// Originating publication session.
    pub session_id: i32,
    /// Stream the fragment was published on.
    pub stream_id: i32,
    /// Position within the message.
    pub flags: FrameFlags,
}

// =============================================================================
// Results
// =============================================================================

/// Reasons a claim or offer did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OfferRejection {
    /// Outgoing buffer is full.
    #[error("back pressured")]
    BackPressured,

    /// No subscriber is attached yet.
    #[error("not connected")]
    NotConnected,

    /// Transient administrative event such as a term rotation.
    #[error("administrative action")]
    AdminAction,

    /// Publication is closed.
    #[error("publication closed")]
    Closed,

    /// Unrecoverable transport failure.
    #[error("publication error: {0}")]
    Failed(String),
}

impl OfferRejection {
    /// Whether the same message should be retried after an idle step.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackPressured | Self::NotConnected | Self::AdminAction
        )
    }
}

/// Reasons a poll failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// Subscription is closed.
    #[error("subscription closed")]
    Closed,

    /// Unrecoverable transport failure.
    #[error("subscription error: {0}")]
    Failed(String),
}

// =============================================================================
// Publication Ports
// =============================================================================

/// A reserved region of transport memory.
///
/// Dropping a claim without calling [`BufferClaim::commit`] aborts it:
/// nothing becomes visible to subscribers.
pub trait BufferClaim {
    /// The claimed bytes, exactly as long as requested.
    fn buffer(&mut self) -> &mut [u8];

    /// Publish the claimed bytes atomically, returning the new stream
    /// position.
    fn commit(self) -> i64;
}

/// Publication with a single owner that can hand out in-place claims.
pub trait ExclusivePublication {
    /// Claim type borrowing the publication until committed or dropped.
    type Claim<'a>: BufferClaim
    where
        Self: 'a;

    /// Reserve `length` bytes for in-place writing.
    ///
    /// # Errors
    ///
    /// Returns an [`OfferRejection`]; transient ones should be retried.
    fn try_claim(&mut self, length: usize) -> Result<Self::Claim<'_>, OfferRejection>;

    /// Largest length a single claim may request.
    fn max_payload_length(&self) -> usize;

    /// Session id subscribers see for this publication.
    fn session_id(&self) -> i32;
}

/// Publication that may be shared and accepts fully built messages.
pub trait SharedPublication {
    /// Copy `message` into the transport.
    ///
    /// Success confirms transport acceptance, not subscriber receipt.
    ///
    /// # Errors
    ///
    /// Returns an [`OfferRejection`]; transient ones should be retried.
    fn offer(&self, message: &[u8]) -> Result<i64, OfferRejection>;

    /// Session id subscribers see for this publication.
    fn session_id(&self) -> i32;
}

impl<T: SharedPublication + ?Sized> SharedPublication for Arc<T> {
    fn offer(&self, message: &[u8]) -> Result<i64, OfferRejection> {
        (**self).offer(message)
    }

    fn session_id(&self) -> i32 {
        (**self).session_id()
    }
}

impl<T: SharedPublication + ?Sized> SharedPublication for &T {
    fn offer(&self, message: &[u8]) -> Result<i64, OfferRejection> {
        (**self).offer(message)
    }

    fn session_id(&self) -> i32 {
        (**self).session_id()
    }
}

// =============================================================================
// Subscription Port
// =============================================================================

/// Source of delivered fragments.
pub trait Subscription {
    /// Deliver up to `fragment_limit` fragments to `handler`, in order.
    ///
    /// Returns the number of fragments delivered; zero means nothing was
    /// available.
    ///
    /// # Errors
    ///
    /// Returns a [`PollError`] when the subscription is closed or failed.
    fn poll<F>(&mut self, handler: F, fragment_limit: usize) -> Result<usize, PollError>
    where
        F: FnMut(&FragmentHeader, &[u8]);
}

// =============================================================================
// Sinks
// =============================================================================

/// Receives one call per message sent or received.
#[cfg_attr(test, mockall::automock)]
pub trait RateSink {
    /// Account for one message of `bytes` length.
    fn on_message(&mut self, bytes: usize);
}

/// Rate sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRateSink;

impl RateSink for NoopRateSink {
    fn on_message(&mut self, _bytes: usize) {}
}

/// Application callback for decoded records.
#[cfg_attr(test, mockall::automock)]
pub trait RecordHandler {
    /// Handle one decoded record.
    fn on_record(&mut self, header: &FragmentHeader, record: &Record);
}

/// Record handler that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecordHandler;

impl RecordHandler for NoopRecordHandler {
    fn on_record(&mut self, _header: &FragmentHeader, _record: &Record) {}
}
