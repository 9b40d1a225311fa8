//! Fragment Assembler
//!
//! Rebuilds whole messages from transport fragments, one buffer per
//! publication session. Fragments of a session arrive in order; the
//! assembler only concatenates, it never reorders.
//!
//! An unfragmented message (end flag set, nothing buffered for its session)
//! is handed straight to the callback without touching any buffer. A session
//! is only tracked while it has a partial message; completed buffers are
//! recycled for the next session that starts one.

use std::collections::HashMap;

use crate::application::ports::{FragmentHeader, FrameFlags};

/// Initial capacity reserved for a session's reassembly buffer.
const INITIAL_BUFFER_CAPACITY: usize = 4096;

/// Per-session reassembly of fragmented messages.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    sessions: HashMap<i32, Vec<u8>>,
    spare: Vec<u8>,
    stale_partials: u64,
}

impl FragmentAssembler {
    /// Create an assembler with no session state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; `deliver` runs once per completed message.
    ///
    /// The header passed to `deliver` for a reassembled message is the last
    /// fragment's header with [`FrameFlags::UNFRAGMENTED`]. Returns whether a
    /// message was delivered.
    pub fn on_fragment<F>(&mut self, header: &FragmentHeader, fragment: &[u8], mut deliver: F) -> bool
    where
        F: FnMut(&FragmentHeader, &[u8]),
    {
        let flags = header.flags;
        let buffered = self
            .sessions
            .get(&header.session_id)
            .is_some_and(|buffer| !buffer.is_empty());

        if !buffered && flags.end {
            deliver(header, fragment);
            return true;
        }

        let spare = &mut self.spare;
        let buffer = self
            .sessions
            .entry(header.session_id)
            .or_insert_with(|| std::mem::take(spare));

        if flags.begin && !buffer.is_empty() {
            tracing::warn!(
                session_id = header.session_id,
                stream_id = header.stream_id,
                discarded = buffer.len(),
                "Discarding incomplete message"
            );
            buffer.clear();
            self.stale_partials += 1;
        }

        if buffer.capacity() == 0 {
            buffer.reserve(INITIAL_BUFFER_CAPACITY.max(fragment.len()));
        }
        buffer.extend_from_slice(fragment);

        if !flags.end {
            return false;
        }

        let whole = FragmentHeader {
            flags: FrameFlags::UNFRAGMENTED,
            ..*header
        };
        deliver(&whole, buffer);
        self.release(header.session_id);
        true
    }

    /// Drop any partial message held for `session_id`.
    pub fn reset(&mut self, session_id: i32) {
        self.release(session_id);
    }

    /// Stop tracking `session_id`, keeping its buffer for reuse.
    fn release(&mut self, session_id: i32) {
        if let Some(mut buffer) = self.sessions.remove(&session_id) {
            buffer.clear();
            if buffer.capacity() > self.spare.capacity() {
                self.spare = buffer;
            }
        }
    }

    /// Sessions currently holding a partial message.
    #[must_use]
    pub fn tracked_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Bytes buffered for `session_id` awaiting the end fragment.
    #[must_use]
    pub fn partial_len(&self, session_id: i32) -> usize {
        self.sessions.get(&session_id).map_or(0, Vec::len)
    }

    /// Partial messages discarded because a new message began.
    #[must_use]
    pub const fn stale_partials(&self) -> u64 {
        self.stale_partials
    }
}
