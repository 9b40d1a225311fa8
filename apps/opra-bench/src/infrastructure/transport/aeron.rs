//! Aeron Media Driver Transport
//!
//! Publication and subscription ports over `rusteron_client`, for talking
//! to a running Aeron media driver on `aeron:udp` and `aeron:ipc` channels.
//! The driver owns fragmentation, flow control and the log buffers; these
//! adapters only translate its position codes and fragment headers.
//!
//! The media driver is not started here. Run one alongside, sharing the
//! directory given by `AERON_DIR` (or the driver's default).

use std::cell::RefCell;
use std::ffi::CString;
use std::marker::PhantomData;
use std::ops::Range;
use std::rc::Rc;
use std::time::Duration;

#[allow(clippy::wildcard_imports)]
use rusteron_client::*;

use super::{ChannelUri, TransportError};
use crate::application::ports::{
    BufferClaim, ExclusivePublication, FragmentHeader, FrameFlags, OfferRejection, PollError,
    SharedPublication, Subscription,
};

/// How long to wait for the driver to register a publication or
/// subscription.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes of the driver's data frame header.
pub const AERON_DATA_HEADER_LEN: usize = 32;

// Position codes returned by offer and try_claim.
const NOT_CONNECTED: i64 = -1;
const BACK_PRESSURED: i64 = -2;
const ADMIN_ACTION: i64 = -3;
const PUBLICATION_CLOSED: i64 = -4;
const MAX_POSITION_EXCEEDED: i64 = -5;

/// Map an offer or claim result onto a position or a rejection.
fn position_or_rejection(code: i64) -> Result<i64, OfferRejection> {
    match code {
        position if position >= 0 => Ok(position),
        NOT_CONNECTED => Err(OfferRejection::NotConnected),
        BACK_PRESSURED => Err(OfferRejection::BackPressured),
        ADMIN_ACTION => Err(OfferRejection::AdminAction),
        PUBLICATION_CLOSED => Err(OfferRejection::Closed),
        MAX_POSITION_EXCEEDED => Err(OfferRejection::Failed(
            "publication reached its max position".to_string(),
        )),
        other => Err(OfferRejection::Failed(format!(
            "publication error code {other}"
        ))),
    }
}

fn driver_error(context: &str, err: impl std::fmt::Debug) -> TransportError {
    TransportError::Driver(format!("{context}: {err:?}"))
}

fn channel_cstring(uri: &ChannelUri) -> Result<CString, TransportError> {
    CString::new(uri.to_string())
        .map_err(|_| TransportError::Unsupported(format!("{uri} contains a NUL byte")))
}

// =============================================================================
// Client
// =============================================================================

/// Connection to the media driver.
///
/// Publications and subscriptions added through it must not outlive it.
pub struct AeronClient {
    aeron: Aeron,
    _context: AeronContext,
}

impl std::fmt::Debug for AeronClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeronClient").finish_non_exhaustive()
    }
}

impl AeronClient {
    /// Connect to the driver in `dir`, or the driver's default directory.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Driver`] if the client cannot start.
    pub fn connect(dir: Option<&str>) -> Result<Self, TransportError> {
        let context = AeronContext::new().map_err(|e| driver_error("creating context", e))?;
        if let Some(dir) = dir {
            let dir_cstr = CString::new(dir)
                .map_err(|_| TransportError::Unsupported(format!("aeron dir {dir:?}")))?;
            context
                .set_dir(&dir_cstr)
                .map_err(|e| driver_error("setting aeron dir", e))?;
        }

        let aeron = Aeron::new(&context).map_err(|e| driver_error("creating client", e))?;
        aeron
            .start()
            .map_err(|e| driver_error("starting client", e))?;

        tracing::info!(dir = dir.unwrap_or("default"), "Aeron client connected");
        Ok(Self {
            aeron,
            _context: context,
        })
    }

    /// Add a publication handing out in-place claims.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Driver`] if the driver does not register it.
    pub fn exclusive_publication(
        &self,
        uri: &ChannelUri,
        stream_id: i32,
    ) -> Result<AeronExclusive, TransportError> {
        let channel = channel_cstring(uri)?;
        let publication = self
            .aeron
            .add_exclusive_publication(&channel, stream_id, REGISTRATION_TIMEOUT)
            .map_err(|e| driver_error("adding exclusive publication", e))?;

        let session_id = publication
            .get_constants()
            .map(|constants| constants.session_id())
            .unwrap_or_default();
        tracing::info!(%uri, stream_id, session_id, "Aeron exclusive publication added");

        Ok(AeronExclusive {
            publication,
            session_id,
            max_payload_length: uri.mtu.saturating_sub(AERON_DATA_HEADER_LEN),
        })
    }

    /// Add a publication accepting offers; the driver fragments them.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Driver`] if the driver does not register it.
    pub fn publication(
        &self,
        uri: &ChannelUri,
        stream_id: i32,
    ) -> Result<AeronShared, TransportError> {
        let channel = channel_cstring(uri)?;
        let publication = self
            .aeron
            .add_publication(&channel, stream_id, REGISTRATION_TIMEOUT)
            .map_err(|e| driver_error("adding publication", e))?;

        let session_id = publication
            .get_constants()
            .map(|constants| constants.session_id())
            .unwrap_or_default();
        tracing::info!(%uri, stream_id, session_id, "Aeron publication added");

        Ok(AeronShared {
            publication,
            session_id,
        })
    }

    /// Add a subscription delivering raw fragments.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Driver`] if the driver does not register it.
    pub fn subscription(
        &self,
        uri: &ChannelUri,
        stream_id: i32,
    ) -> Result<AeronSubscriber, TransportError> {
        let channel = channel_cstring(uri)?;
        let handler_avail: Option<&Handler<AeronAvailableImageLogger>> = None;
        let handler_unavail: Option<&Handler<AeronUnavailableImageLogger>> = None;
        let subscription = self
            .aeron
            .add_subscription(
                &channel,
                stream_id,
                handler_avail,
                handler_unavail,
                REGISTRATION_TIMEOUT,
            )
            .map_err(|e| driver_error("adding subscription", e))?;
        tracing::info!(%uri, stream_id, "Aeron subscription added");

        let batch = Rc::new(RefCell::new(FragmentBatch::default()));
        let collector = Handler::leak(FragmentCollector {
            batch: Rc::clone(&batch),
            stream_id,
        });

        Ok(AeronSubscriber {
            subscription,
            collector,
            batch,
            closed: false,
        })
    }
}

// =============================================================================
// Publications
// =============================================================================

/// Exclusive publication; claims write straight into the driver's log.
pub struct AeronExclusive {
    publication: AeronExclusivePublication,
    session_id: i32,
    max_payload_length: usize,
}

impl std::fmt::Debug for AeronExclusive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeronExclusive")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// A region of the driver's term buffer; aborted unless committed.
pub struct AeronClaim<'a> {
    claim: AeronBufferClaim,
    position: i64,
    committed: bool,
    _publication: PhantomData<&'a mut AeronExclusive>,
}

impl BufferClaim for AeronClaim<'_> {
    fn buffer(&mut self) -> &mut [u8] {
        self.claim.data_mut()
    }

    fn commit(mut self) -> i64 {
        self.committed = true;
        if let Err(e) = self.claim.commit() {
            tracing::warn!(error = ?e, "Committing claim failed");
        }
        self.position
    }
}

impl Drop for AeronClaim<'_> {
    fn drop(&mut self) {
        if !self.committed
            && let Err(e) = self.claim.abort()
        {
            tracing::debug!(error = ?e, "Aborting claim failed");
        }
    }
}

impl ExclusivePublication for AeronExclusive {
    type Claim<'a> = AeronClaim<'a>;

    fn try_claim(&mut self, length: usize) -> Result<Self::Claim<'_>, OfferRejection> {
        if length > self.max_payload_length {
            return Err(OfferRejection::Failed(format!(
                "claim of {length} bytes exceeds max payload length {}",
                self.max_payload_length
            )));
        }
        let claim = AeronBufferClaim::default();
        let position = position_or_rejection(self.publication.try_claim(length, &claim))?;
        Ok(AeronClaim {
            claim,
            position,
            committed: false,
            _publication: PhantomData,
        })
    }

    fn max_payload_length(&self) -> usize {
        self.max_payload_length
    }

    fn session_id(&self) -> i32 {
        self.session_id
    }
}

/// Concurrent publication accepting offers by copy.
pub struct AeronShared {
    publication: AeronPublication,
    session_id: i32,
}

impl std::fmt::Debug for AeronShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeronShared")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl SharedPublication for AeronShared {
    fn offer(&self, message: &[u8]) -> Result<i64, OfferRejection> {
        let handler: Option<&Handler<AeronReservedValueSupplierLogger>> = None;
        position_or_rejection(self.publication.offer(message, handler))
    }

    fn session_id(&self) -> i32 {
        self.session_id
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Fragments copied out during one driver poll.
#[derive(Debug, Default)]
struct FragmentBatch {
    frames: Vec<(FragmentHeader, Range<usize>)>,
    bytes: Vec<u8>,
}

impl FragmentBatch {
    fn push(&mut self, header: FragmentHeader, payload: &[u8]) {
        let start = self.bytes.len();
        self.bytes.extend_from_slice(payload);
        self.frames.push((header, start..self.bytes.len()));
    }

    fn deliver<F>(&mut self, mut handler: F) -> usize
    where
        F: FnMut(&FragmentHeader, &[u8]),
    {
        let delivered = self.frames.len();
        for (header, range) in self.frames.drain(..) {
            handler(&header, &self.bytes[range]);
        }
        self.bytes.clear();
        delivered
    }
}

/// Driver callback; only collects so the caller's handler runs afterwards.
struct FragmentCollector {
    batch: Rc<RefCell<FragmentBatch>>,
    stream_id: i32,
}

impl AeronFragmentHandlerCallback for FragmentCollector {
    fn handle_aeron_fragment_handler(&mut self, buffer: &[u8], header: AeronHeader) {
        let fragment = match header.values() {
            Ok(values) => {
                let frame = values.frame();
                FragmentHeader {
                    session_id: frame.session_id(),
                    stream_id: frame.stream_id(),
                    flags: FrameFlags::from_byte(frame.flags()),
                }
            }
            Err(e) => {
                tracing::debug!(error = ?e, "Fragment header unreadable; treating as whole");
                FragmentHeader {
                    session_id: 0,
                    stream_id: self.stream_id,
                    flags: FrameFlags::UNFRAGMENTED,
                }
            }
        };
        self.batch.borrow_mut().push(fragment, buffer);
    }
}

/// Subscription delivering the driver's raw fragments with their flags,
/// so reassembly stays with the subscribe loop.
pub struct AeronSubscriber {
    subscription: AeronSubscription,
    collector: Handler<FragmentCollector>,
    batch: Rc<RefCell<FragmentBatch>>,
    closed: bool,
}

impl std::fmt::Debug for AeronSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeronSubscriber")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl AeronSubscriber {
    /// Stop polling; later polls fail with `Closed`.
    pub const fn close(&mut self) {
        self.closed = true;
    }
}

impl Subscription for AeronSubscriber {
    fn poll<F>(&mut self, handler: F, fragment_limit: usize) -> Result<usize, PollError>
    where
        F: FnMut(&FragmentHeader, &[u8]),
    {
        if self.closed {
            return Err(PollError::Closed);
        }
        self.subscription
            .poll(Some(&self.collector), fragment_limit)
            .map_err(|e| PollError::Failed(format!("{e:?}")))?;
        Ok(self.batch.borrow_mut().deliver(handler))
    }
}
