//! In-Process Log Transport
//!
//! A bounded log shared by any number of publications and one subscription
//! of a stream. Fragments are pooled byte buffers: a claim lends one out
//! for in-place writing and `commit` moves it into the log, an offer copies
//! into one. Every append happens under a single lock, so a fragmented
//! message becomes visible all at once.
//!
//! Rejections mirror a shared-memory log:
//!
//! - `NotConnected` until a subscription is attached
//! - `BackPressured` while the unread bytes would exceed the window
//! - `AdminAction` once when an append would cross into a new term
//! - `Closed` after the publication or the channel is closed

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use parking_lot::Mutex;

use super::{ChannelUri, DATA_HEADER_LEN, DEFAULT_MTU, Media, TransportError};
use crate::application::ports::{
    BufferClaim, ExclusivePublication, FragmentHeader, FrameFlags, OfferRejection, PollError,
    SharedPublication, Subscription,
};

/// Default term length.
pub const DEFAULT_TERM_LENGTH: usize = 16 * 1024 * 1024;

/// Buffers kept for reuse beyond this count are freed.
const MAX_POOLED_BUFFERS: usize = 4096;

// =============================================================================
// Configuration
// =============================================================================

/// Log sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcConfig {
    /// Maximum fragment size including the data header.
    pub mtu: usize,
    /// Bytes appended before the log rotates to a new term.
    pub term_length: usize,
    /// Unread bytes allowed before publishers are back-pressured.
    pub window_length: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            term_length: DEFAULT_TERM_LENGTH,
            window_length: DEFAULT_TERM_LENGTH / 2,
        }
    }
}

impl IpcConfig {
    /// Sizing taken from an `aeron:ipc` URI; the window is half a term.
    #[must_use]
    pub fn from_uri(uri: &ChannelUri) -> Self {
        let term_length = uri.term_length.unwrap_or(DEFAULT_TERM_LENGTH);
        Self {
            mtu: uri.mtu,
            term_length,
            window_length: (term_length / 2).max(uri.mtu),
        }
    }

    /// Largest payload of one fragment, and so of one claim.
    #[must_use]
    pub const fn max_payload_length(&self) -> usize {
        self.mtu - DATA_HEADER_LEN
    }

    /// Largest message an offer accepts.
    #[must_use]
    pub fn max_message_length(&self) -> usize {
        let budget = self.window_length.min(self.term_length);
        let per_fragment = self.max_payload_length();
        // Leave room for one header per fragment.
        budget / self.mtu * per_fragment
    }
}

// =============================================================================
// Log State
// =============================================================================

#[derive(Debug)]
struct Frame {
    header: FragmentHeader,
    data: Vec<u8>,
}

impl Frame {
    fn log_len(&self) -> usize {
        self.data.len() + DATA_HEADER_LEN
    }
}

#[derive(Debug, Default)]
struct LogState {
    frames: VecDeque<Frame>,
    pool: Vec<Vec<u8>>,
    unread: usize,
    position: i64,
    term_offset: usize,
    term_id: i32,
    subscribed: bool,
    closed: bool,
}

impl LogState {
    fn admit(&mut self, bytes: usize, config: &IpcConfig) -> Result<(), OfferRejection> {
        if self.closed {
            return Err(OfferRejection::Closed);
        }
        // Rotating cannot make room for an append larger than a whole term.
        if bytes > config.term_length {
            return Err(OfferRejection::Failed(format!(
                "append of {bytes} bytes exceeds term length {}",
                config.term_length
            )));
        }
        if !self.subscribed {
            return Err(OfferRejection::NotConnected);
        }
        if self.unread + bytes > config.window_length {
            return Err(OfferRejection::BackPressured);
        }
        if self.term_offset + bytes > config.term_length {
            self.term_offset = 0;
            self.term_id += 1;
            tracing::debug!(term_id = self.term_id, "Log rotated to new term");
            return Err(OfferRejection::AdminAction);
        }
        Ok(())
    }

    fn take_buffer(&mut self, capacity: usize) -> Vec<u8> {
        let mut buffer = self
            .pool
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(capacity));
        buffer.clear();
        buffer
    }

    fn recycle(&mut self, buffer: Vec<u8>) {
        if self.pool.len() < MAX_POOLED_BUFFERS {
            self.pool.push(buffer);
        }
    }

    fn append(&mut self, header: FragmentHeader, data: Vec<u8>) -> i64 {
        let frame = Frame { header, data };
        let len = frame.log_len();
        self.unread += len;
        self.term_offset += len;
        self.position += i64::try_from(len).unwrap_or(i64::MAX);
        self.frames.push_back(frame);
        self.position
    }
}

// =============================================================================
// Channel
// =============================================================================

/// One stream's in-process log.
#[derive(Debug)]
pub struct IpcChannel {
    stream_id: i32,
    config: IpcConfig,
    state: Mutex<LogState>,
    next_session_id: AtomicI32,
}

impl IpcChannel {
    /// Create an empty log for `stream_id`.
    #[must_use]
    pub fn new(stream_id: i32, config: IpcConfig) -> Arc<Self> {
        Arc::new(Self {
            stream_id,
            config,
            state: Mutex::new(LogState::default()),
            next_session_id: AtomicI32::new(1),
        })
    }

    /// Create a log from an `aeron:ipc` URI.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unsupported`] for any other medium.
    pub fn from_uri(uri: &ChannelUri, stream_id: i32) -> Result<Arc<Self>, TransportError> {
        if uri.media != Media::Ipc {
            return Err(TransportError::Unsupported(format!(
                "{uri} is not an ipc channel"
            )));
        }
        Ok(Self::new(stream_id, IpcConfig::from_uri(uri)))
    }

    /// Stream carried by this log.
    #[must_use]
    pub const fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Log sizing.
    #[must_use]
    pub const fn config(&self) -> &IpcConfig {
        &self.config
    }

    /// Current term id; advances on every rotation.
    #[must_use]
    pub fn term_id(&self) -> i32 {
        self.state.lock().term_id
    }

    /// Add a publication that hands out in-place claims.
    #[must_use]
    pub fn exclusive_publication(self: &Arc<Self>) -> IpcExclusivePublication {
        IpcExclusivePublication {
            core: self.publication_core(),
        }
    }

    /// Add a publication that accepts offers, possibly fragmented.
    #[must_use]
    pub fn publication(self: &Arc<Self>) -> IpcPublication {
        IpcPublication {
            core: self.publication_core(),
        }
    }

    /// Attach the stream's subscription.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AlreadySubscribed`] if one is attached.
    pub fn subscription(self: &Arc<Self>) -> Result<IpcSubscription, TransportError> {
        let mut state = self.state.lock();
        if state.subscribed {
            return Err(TransportError::AlreadySubscribed(self.stream_id));
        }
        state.subscribed = true;
        Ok(IpcSubscription {
            channel: Arc::clone(self),
            batch: Vec::new(),
        })
    }

    /// Close the log: publications see `Closed`, the subscription drains
    /// what remains and then sees `Closed`.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    fn publication_core(self: &Arc<Self>) -> PublicationCore {
        PublicationCore {
            channel: Arc::clone(self),
            session_id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        }
    }

    const fn header(&self, session_id: i32, flags: FrameFlags) -> FragmentHeader {
        FragmentHeader {
            session_id,
            stream_id: self.stream_id,
            flags,
        }
    }
}

// =============================================================================
// Publications
// =============================================================================

#[derive(Debug)]
struct PublicationCore {
    channel: Arc<IpcChannel>,
    session_id: i32,
    closed: AtomicBool,
}

impl PublicationCore {
    fn ensure_open(&self) -> Result<(), OfferRejection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OfferRejection::Closed);
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Publication with in-place claims; one message per claim.
#[derive(Debug)]
pub struct IpcExclusivePublication {
    core: PublicationCore,
}

impl IpcExclusivePublication {
    /// Close this publication; the log stays open for others.
    pub fn close(&self) {
        self.core.close();
    }
}

/// A pooled buffer lent out by [`IpcExclusivePublication::try_claim`].
#[derive(Debug)]
pub struct IpcClaim<'a> {
    channel: &'a IpcChannel,
    session_id: i32,
    buffer: Option<Vec<u8>>,
}

impl BufferClaim for IpcClaim<'_> {
    fn buffer(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or_default()
    }

    fn commit(mut self) -> i64 {
        let Some(data) = self.buffer.take() else {
            return self.channel.state.lock().position;
        };
        let header = self.channel.header(self.session_id, FrameFlags::UNFRAGMENTED);
        self.channel.state.lock().append(header, data)
    }
}

impl Drop for IpcClaim<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.channel.state.lock().recycle(buffer);
        }
    }
}

impl ExclusivePublication for IpcExclusivePublication {
    type Claim<'a> = IpcClaim<'a>;

    fn try_claim(&mut self, length: usize) -> Result<Self::Claim<'_>, OfferRejection> {
        self.core.ensure_open()?;
        let channel = &*self.core.channel;
        let max = channel.config.max_payload_length();
        if length > max {
            return Err(OfferRejection::Failed(format!(
                "claim of {length} bytes exceeds max payload length {max}"
            )));
        }

        let mut buffer = {
            let mut state = channel.state.lock();
            state.admit(length + DATA_HEADER_LEN, &channel.config)?;
            state.take_buffer(channel.config.mtu)
        };
        buffer.resize(length, 0);

        Ok(IpcClaim {
            channel,
            session_id: self.core.session_id,
            buffer: Some(buffer),
        })
    }

    fn max_payload_length(&self) -> usize {
        self.core.channel.config.max_payload_length()
    }

    fn session_id(&self) -> i32 {
        self.core.session_id
    }
}

/// Publication accepting offers, fragmenting anything above one MTU.
#[derive(Debug)]
pub struct IpcPublication {
    core: PublicationCore,
}

impl IpcPublication {
    /// Close this publication; the log stays open for others.
    pub fn close(&self) {
        self.core.close();
    }
}

impl SharedPublication for IpcPublication {
    fn offer(&self, message: &[u8]) -> Result<i64, OfferRejection> {
        self.core.ensure_open()?;
        let channel = &*self.core.channel;
        let config = &channel.config;
        let max_message = config.max_message_length();
        if message.len() > max_message {
            return Err(OfferRejection::Failed(format!(
                "message of {} bytes exceeds max message length {max_message}",
                message.len()
            )));
        }

        let max_payload = config.max_payload_length();
        let fragments = message.len().div_ceil(max_payload).max(1);
        let log_len = message.len() + fragments * DATA_HEADER_LEN;

        let mut state = channel.state.lock();
        state.admit(log_len, config)?;

        let mut position = state.position;
        for index in 0..fragments {
            let start = index * max_payload;
            let end = (start + max_payload).min(message.len());
            let mut data = state.take_buffer(config.mtu);
            data.extend_from_slice(&message[start..end]);
            let header = channel.header(
                self.core.session_id,
                FrameFlags::for_fragment(index, fragments),
            );
            position = state.append(header, data);
        }
        Ok(position)
    }

    fn session_id(&self) -> i32 {
        self.core.session_id
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// The stream's single reader; detaches on drop.
#[derive(Debug)]
pub struct IpcSubscription {
    channel: Arc<IpcChannel>,
    batch: Vec<Frame>,
}

impl Subscription for IpcSubscription {
    fn poll<F>(&mut self, mut handler: F, fragment_limit: usize) -> Result<usize, PollError>
    where
        F: FnMut(&FragmentHeader, &[u8]),
    {
        {
            let mut state = self.channel.state.lock();
            if state.frames.is_empty() && state.closed {
                return Err(PollError::Closed);
            }
            let count = fragment_limit.min(state.frames.len());
            let mut drained = 0;
            for frame in state.frames.drain(..count) {
                drained += frame.log_len();
                self.batch.push(frame);
            }
            state.unread -= drained;
        }

        for frame in &self.batch {
            handler(&frame.header, &frame.data);
        }

        let delivered = self.batch.len();
        if delivered > 0 {
            let mut state = self.channel.state.lock();
            for frame in self.batch.drain(..) {
                state.recycle(frame.data);
            }
        }
        Ok(delivered)
    }
}

impl Drop for IpcSubscription {
    fn drop(&mut self) {
        let mut state = self.channel.state.lock();
        state.subscribed = false;
        state.frames.clear();
        state.unread = 0;
    }
}
