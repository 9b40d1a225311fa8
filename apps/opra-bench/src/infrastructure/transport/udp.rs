//! UDP Datagram Transport
//!
//! One fragment per datagram behind a 12-byte little-endian data header:
//!
//! ```text
//! 0        4        8     9        10        12
//! +--------+--------+-----+--------+---------+---------
//! | session| stream |flags|reserved|payload  | payload
//! |  i32   |  i32   | u8  |   u8   |len u16  |
//! +--------+--------+-----+--------+---------+---------
//! ```
//!
//! Sockets are non-blocking. A full send buffer surfaces as back-pressure
//! and an ICMP port-unreachable as `NotConnected`; nothing is retransmitted.

use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{ChannelUri, DATA_HEADER_LEN, TransportError};
use crate::application::ports::{
    BufferClaim, ExclusivePublication, FragmentHeader, FrameFlags, OfferRejection, PollError,
    SharedPublication, Subscription,
};

/// Receive buffer size; large enough for any datagram.
const RECV_BUFFER_LEN: usize = 64 * 1024;

/// How long `close` keeps retrying a datagram left by the last commit.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

// =============================================================================
// Data Header
// =============================================================================

/// Write the data header for a fragment of `payload_len` bytes.
///
/// `dst` must be at least [`DATA_HEADER_LEN`] long and `payload_len` must
/// fit in a `u16`; both hold for every MTU a [`ChannelUri`] accepts.
fn write_header(dst: &mut [u8], header: &FragmentHeader, payload_len: usize) {
    let len = u16::try_from(payload_len).unwrap_or(u16::MAX);
    dst[0..4].copy_from_slice(&header.session_id.to_le_bytes());
    dst[4..8].copy_from_slice(&header.stream_id.to_le_bytes());
    dst[8] = header.flags.to_byte();
    dst[9] = 0;
    dst[10..12].copy_from_slice(&len.to_le_bytes());
}

/// Parse a datagram into its header and payload.
///
/// Returns `None` when the datagram is shorter than the header or the
/// declared payload length disagrees with the datagram size.
fn read_header(datagram: &[u8]) -> Option<(FragmentHeader, &[u8])> {
    let header = datagram.get(..DATA_HEADER_LEN)?;
    let session_id = i32::from_le_bytes(header[0..4].try_into().ok()?);
    let stream_id = i32::from_le_bytes(header[4..8].try_into().ok()?);
    let flags = FrameFlags::from_byte(header[8]);
    let payload_len = usize::from(u16::from_le_bytes(header[10..12].try_into().ok()?));
    let payload = &datagram[DATA_HEADER_LEN..];
    if payload.len() != payload_len {
        return None;
    }
    Some((
        FragmentHeader {
            session_id,
            stream_id,
            flags,
        },
        payload,
    ))
}

fn rejection(err: &std::io::Error) -> OfferRejection {
    match err.kind() {
        ErrorKind::WouldBlock => OfferRejection::BackPressured,
        ErrorKind::ConnectionRefused => OfferRejection::NotConnected,
        _ => OfferRejection::Failed(err.to_string()),
    }
}

fn resolve(endpoint: &str) -> Result<SocketAddr, TransportError> {
    endpoint
        .to_socket_addrs()
        .map_err(|e| TransportError::io(format!("resolving {endpoint}"), e))?
        .next()
        .ok_or_else(|| TransportError::Unresolved(endpoint.to_string()))
}

// =============================================================================
// Publication
// =============================================================================

/// Outcome of the last commit that could not be sent straight away.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Deferred {
    /// Datagram of this length is still waiting in the claim buffer.
    Pending(usize),
    /// The socket failed.
    Failed(String),
}

/// What a failed send of a `len`-byte committed datagram leaves behind.
///
/// Transient failures keep the datagram for another attempt.
fn deferral(err: &std::io::Error, len: usize) -> Deferred {
    if rejection(err).is_transient() {
        Deferred::Pending(len)
    } else {
        Deferred::Failed(err.to_string())
    }
}

/// Publication sending to one UDP endpoint.
///
/// Claims expose the payload area of a reusable datagram buffer and
/// `commit` sends it. A commit that hits a full socket buffer or a refusing
/// peer keeps the datagram; the next claim retries it first and `close` (or
/// drop) flushes it, so an accepted commit is never dropped locally while
/// the failure stays transient.
#[derive(Debug)]
pub struct UdpPublication {
    socket: UdpSocket,
    session_id: i32,
    stream_id: i32,
    mtu: usize,
    datagram: Vec<u8>,
    deferred: Option<Deferred>,
    offer_buffer: Mutex<Vec<u8>>,
    closed: bool,
}

impl UdpPublication {
    /// Connect a publication to the channel's endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is missing or unresolvable, or the
    /// socket cannot be set up.
    pub fn connect(uri: &ChannelUri, stream_id: i32) -> Result<Self, TransportError> {
        let endpoint = uri.require_endpoint()?;
        let remote = resolve(endpoint)?;
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket =
            UdpSocket::bind(local).map_err(|e| TransportError::io("binding publication", e))?;
        socket
            .connect(remote)
            .map_err(|e| TransportError::io(format!("connecting to {remote}"), e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::io("setting non-blocking", e))?;

        let session_id = rand::random::<i32>();
        tracing::info!(%remote, stream_id, session_id, mtu = uri.mtu, "UDP publication connected");

        Ok(Self {
            socket,
            session_id,
            stream_id,
            mtu: uri.mtu,
            datagram: vec![0; uri.mtu],
            deferred: None,
            offer_buffer: Mutex::new(vec![0; uri.mtu]),
            closed: false,
        })
    }

    /// Retry the datagram left by the last commit until it is sent, the
    /// failure stops being transient, or `timeout` passes.
    ///
    /// # Errors
    ///
    /// Returns the last rejection if the datagram is still unsent.
    pub fn flush(&mut self, timeout: Duration) -> Result<(), OfferRejection> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.settle() {
                Err(rejection) if rejection.is_transient() && Instant::now() < deadline => {
                    std::thread::yield_now();
                }
                result => return result,
            }
        }
    }

    /// Flush any pending datagram and close the publication; later
    /// attempts are rejected as `Closed`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Err(rejection) = self.flush(CLOSE_FLUSH_TIMEOUT) {
            tracing::warn!(
                session_id = self.session_id,
                %rejection,
                "Closing with last committed datagram unsent"
            );
        }
        self.closed = true;
    }

    const fn header(&self, flags: FrameFlags) -> FragmentHeader {
        FragmentHeader {
            session_id: self.session_id,
            stream_id: self.stream_id,
            flags,
        }
    }

    fn ensure_open(&self) -> Result<(), OfferRejection> {
        if self.closed {
            return Err(OfferRejection::Closed);
        }
        Ok(())
    }

    /// Resolve whatever the previous commit left behind.
    fn settle(&mut self) -> Result<(), OfferRejection> {
        match self.deferred.take() {
            None => Ok(()),
            Some(Deferred::Pending(len)) => match self.socket.send(&self.datagram[..len]) {
                Ok(_) => Ok(()),
                Err(err) => {
                    if let Deferred::Pending(len) = deferral(&err, len) {
                        self.deferred = Some(Deferred::Pending(len));
                    }
                    Err(rejection(&err))
                }
            },
            Some(Deferred::Failed(reason)) => Err(OfferRejection::Failed(reason)),
        }
    }

    fn send_committed(&mut self, len: usize) {
        if let Err(err) = self.socket.send(&self.datagram[..len]) {
            self.deferred = Some(deferral(&err, len));
        }
    }

    fn send_fragment(
        &self,
        buffer: &mut [u8],
        header: &FragmentHeader,
        payload: &[u8],
    ) -> std::io::Result<usize> {
        let len = DATA_HEADER_LEN + payload.len();
        write_header(buffer, header, payload.len());
        buffer[DATA_HEADER_LEN..len].copy_from_slice(payload);
        self.socket.send(&buffer[..len])
    }
}

impl Drop for UdpPublication {
    fn drop(&mut self) {
        self.close();
    }
}

/// Payload area of the publication's datagram buffer.
#[derive(Debug)]
pub struct UdpClaim<'a> {
    publication: &'a mut UdpPublication,
    length: usize,
}

impl BufferClaim for UdpClaim<'_> {
    fn buffer(&mut self) -> &mut [u8] {
        &mut self.publication.datagram[DATA_HEADER_LEN..DATA_HEADER_LEN + self.length]
    }

    fn commit(self) -> i64 {
        let header = self.publication.header(FrameFlags::UNFRAGMENTED);
        let len = DATA_HEADER_LEN + self.length;
        write_header(&mut self.publication.datagram, &header, self.length);
        self.publication.send_committed(len);
        i64::try_from(len).unwrap_or(i64::MAX)
    }
}

impl ExclusivePublication for UdpPublication {
    type Claim<'a> = UdpClaim<'a>;

    fn try_claim(&mut self, length: usize) -> Result<Self::Claim<'_>, OfferRejection> {
        self.ensure_open()?;
        let max = self.max_payload_length();
        if length > max {
            return Err(OfferRejection::Failed(format!(
                "claim of {length} bytes exceeds max payload length {max}"
            )));
        }
        self.settle()?;
        Ok(UdpClaim {
            publication: self,
            length,
        })
    }

    fn max_payload_length(&self) -> usize {
        self.mtu - DATA_HEADER_LEN
    }

    fn session_id(&self) -> i32 {
        self.session_id
    }
}

impl SharedPublication for UdpPublication {
    fn offer(&self, message: &[u8]) -> Result<i64, OfferRejection> {
        self.ensure_open()?;
        let max_payload = self.mtu - DATA_HEADER_LEN;
        let fragments = message.len().div_ceil(max_payload).max(1);
        let mut buffer = self.offer_buffer.lock();

        let mut sent = 0;
        for index in 0..fragments {
            let start = index * max_payload;
            let end = (start + max_payload).min(message.len());
            let header = self.header(FrameFlags::for_fragment(index, fragments));
            loop {
                match self.send_fragment(&mut buffer, &header, &message[start..end]) {
                    Ok(n) => {
                        sent += n;
                        break;
                    }
                    // Nothing sent yet: report and let the caller retry.
                    Err(err) if index == 0 => return Err(rejection(&err)),
                    // Mid-message: finish it rather than leave a torn message.
                    Err(err) if err.kind() == ErrorKind::WouldBlock => std::thread::yield_now(),
                    Err(err) => return Err(rejection(&err)),
                }
            }
        }
        Ok(i64::try_from(sent).unwrap_or(i64::MAX))
    }

    fn session_id(&self) -> i32 {
        self.session_id
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Subscription bound to the channel's endpoint.
#[derive(Debug)]
pub struct UdpSubscription {
    socket: UdpSocket,
    stream_id: i32,
    buffer: Vec<u8>,
    closed: bool,
}

impl UdpSubscription {
    /// Bind the channel's endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is missing or unresolvable, or the
    /// socket cannot be bound.
    pub fn bind(uri: &ChannelUri, stream_id: i32) -> Result<Self, TransportError> {
        let endpoint = uri.require_endpoint()?;
        let addr = resolve(endpoint)?;
        let socket =
            UdpSocket::bind(addr).map_err(|e| TransportError::io(format!("binding {addr}"), e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::io("setting non-blocking", e))?;

        tracing::info!(%addr, stream_id, "UDP subscription bound");
        Ok(Self {
            socket,
            stream_id,
            buffer: vec![0; RECV_BUFFER_LEN],
            closed: false,
        })
    }

    /// Address actually bound, useful when the endpoint used port 0.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Close the subscription; later polls fail with `Closed`.
    pub const fn close(&mut self) {
        self.closed = true;
    }
}

impl Subscription for UdpSubscription {
    fn poll<F>(&mut self, mut handler: F, fragment_limit: usize) -> Result<usize, PollError>
    where
        F: FnMut(&FragmentHeader, &[u8]),
    {
        if self.closed {
            return Err(PollError::Closed);
        }

        let mut delivered = 0;
        for _ in 0..fragment_limit {
            let len = match self.socket.recv(&mut self.buffer) {
                Ok(len) => len,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::ConnectionRefused => continue,
                Err(err) => return Err(PollError::Failed(err.to_string())),
            };

            let Some((header, payload)) = read_header(&self.buffer[..len]) else {
                tracing::debug!(len, "Skipping datagram with invalid header");
                continue;
            };
            if header.stream_id != self.stream_id {
                continue;
            }
            handler(&header, payload);
            delivered += 1;
        }
        Ok(delivered)
    }
}
