//! Publication Strategies
//!
//! Two ways of getting one framed record into the transport, behind one
//! trait so the publish loop does not care which is in use:
//!
//! - [`ExclusiveClaim`]: reserve exactly the framed length, encode in
//!   place, commit. A failed encode drops the claim, which aborts it.
//! - [`SharedOffer`]: encode into a private scratch buffer, then offer a
//!   copy.
//!
//! A strategy makes one attempt per call. Retrying is the caller's job.

use crate::application::ports::{
    BufferClaim, ExclusivePublication, OfferRejection, SharedPublication,
};
use crate::domain::market_data::codec::{CodecError, encode_frame};
use crate::domain::market_data::{MAX_FRAME_LEN, Record};

/// Why a single publish attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptError {
    /// The transport turned the attempt down.
    #[error(transparent)]
    Rejected(#[from] OfferRejection),

    /// The record could not be encoded into the provided region.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl AttemptError {
    /// Whether the same record should be attempted again.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Rejected(rejection) => rejection.is_transient(),
            Self::Codec(_) => false,
        }
    }
}

/// One attempt at publishing one record.
pub trait PublishStrategy {
    /// Try to publish `record` once, returning the new stream position.
    ///
    /// # Errors
    ///
    /// Returns an [`AttemptError`]; transient rejections leave nothing
    /// published and may be retried with the same logical message.
    fn try_publish(&mut self, record: &Record) -> Result<i64, AttemptError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

// =============================================================================
// Exclusive Claim
// =============================================================================

/// Zero-copy strategy over an [`ExclusivePublication`].
#[derive(Debug)]
pub struct ExclusiveClaim<P> {
    publication: P,
}

impl<P: ExclusivePublication> ExclusiveClaim<P> {
    /// Wrap a publication.
    #[must_use]
    pub const fn new(publication: P) -> Self {
        Self { publication }
    }

    /// The wrapped publication.
    #[must_use]
    pub const fn publication(&self) -> &P {
        &self.publication
    }

    /// Unwrap the publication.
    #[must_use]
    pub fn into_inner(self) -> P {
        self.publication
    }
}

impl<P: ExclusivePublication> PublishStrategy for ExclusiveClaim<P> {
    fn try_publish(&mut self, record: &Record) -> Result<i64, AttemptError> {
        let mut claim = self.publication.try_claim(record.frame_len())?;
        encode_frame(claim.buffer(), record)?;
        Ok(claim.commit())
    }

    fn name(&self) -> &'static str {
        "exclusive-claim"
    }
}

// =============================================================================
// Shared Offer
// =============================================================================

/// Copying strategy over a [`SharedPublication`].
#[derive(Debug)]
pub struct SharedOffer<P> {
    publication: P,
    scratch: [u8; MAX_FRAME_LEN],
}

impl<P: SharedPublication> SharedOffer<P> {
    /// Wrap a publication.
    #[must_use]
    pub const fn new(publication: P) -> Self {
        Self {
            publication,
            scratch: [0; MAX_FRAME_LEN],
        }
    }

    /// The wrapped publication.
    #[must_use]
    pub const fn publication(&self) -> &P {
        &self.publication
    }

    /// Unwrap the publication.
    #[must_use]
    pub fn into_inner(self) -> P {
        self.publication
    }
}

impl<P: SharedPublication> PublishStrategy for SharedOffer<P> {
    fn try_publish(&mut self, record: &Record) -> Result<i64, AttemptError> {
        let len = encode_frame(&mut self.scratch, record)?;
        Ok(self.publication.offer(&self.scratch[..len])?)
    }

    fn name(&self) -> &'static str {
        "shared-offer"
    }
}
