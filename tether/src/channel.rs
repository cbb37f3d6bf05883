//! Virtual stream endpoints and the per-transport channel table.
//!
//! A channel is one end of a multiplexed bidirectional stream. The
//! table maps local ids to entries; ids are monotonically increasing
//! and never reused within a transport's lifetime, so a stale peer id
//! simply fails lookup instead of dangling after close.

use std::collections::HashMap;
use std::sync::mpsc::{Sender, SyncSender};

use crate::services::StreamCloser;

/// One allocated channel: wire ids, credit state, and its endpoint.
#[derive(Debug)]
pub(crate) struct ChannelEntry {
    /// Our id for this stream, carried as the peer's `remote_id`.
    pub local_id: u32,
    /// The peer's id for this stream; `0` until learned from OPEN/OKAY.
    pub remote_id: u32,
    /// Whether the peer may currently send us one WRTE.
    pub inbound_credit: bool,
    /// The endpoint consuming and producing this stream's bytes.
    pub kind: ChannelKind,
}

/// The closed set of endpoint variants behind the
/// enqueue/ready/close capability surface.
#[derive(Debug)]
pub(crate) enum ChannelKind {
    /// Discards up to a fixed byte budget, then closes itself.
    Sink {
        /// Bytes still accepted before the channel closes.
        bytes_left: u64,
    },
    /// Pushes zero-filled blocks until its budget is spent, then closes.
    Source {
        /// Bytes still to be produced.
        bytes_left: u64,
    },
    /// Bridges the stream to a service's raw byte stream via two
    /// worker threads.
    Stream(StreamEndpoint),
}

impl ChannelKind {
    /// Releases endpoint resources: sever the service stream so
    /// blocked workers wake, then drop the queues. Sinks and sources
    /// hold nothing.
    pub fn shutdown(&mut self) {
        if let Self::Stream(endpoint) = self {
            if let Some(closer) = endpoint.closer.take() {
                closer();
            }
            endpoint.to_service = None;
            endpoint.credits = None;
        }
    }
}

/// Loop-side handles into a stream channel's worker pair.
pub(crate) struct StreamEndpoint {
    /// Queues one inbound payload for the service writer worker.
    /// Depth 1: the credit scheme admits one outstanding WRTE.
    pub to_service: Option<SyncSender<Vec<u8>>>,
    /// Grants the service reader worker permission for one more chunk.
    pub credits: Option<Sender<()>>,
    /// Severs the underlying stream on early close.
    pub closer: Option<StreamCloser>,
}

impl std::fmt::Debug for StreamEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEndpoint")
            .field("live", &self.to_service.is_some())
            .finish()
    }
}

/// Per-transport channel id allocator and lookup table.
#[derive(Debug)]
pub(crate) struct ChannelTable {
    next_id: u32,
    entries: HashMap<u32, ChannelEntry>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    /// Allocates a fresh local id for an endpoint.
    pub fn allocate(&mut self, kind: ChannelKind, remote_id: u32) -> u32 {
        let local_id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            local_id,
            ChannelEntry {
                local_id,
                remote_id,
                inbound_credit: true,
                kind,
            },
        );
        local_id
    }

    pub fn get_mut(&mut self, local_id: u32) -> Option<&mut ChannelEntry> {
        self.entries.get_mut(&local_id)
    }

    pub fn remove(&mut self, local_id: u32) -> Option<ChannelEntry> {
        self.entries.remove(&local_id)
    }

    /// True if some channel is already paired with this peer id.
    /// A second OPEN carrying the same id is a protocol violation.
    pub fn contains_remote(&self, remote_id: u32) -> bool {
        remote_id != 0 && self.entries.values().any(|e| e.remote_id == remote_id)
    }

    /// Removes and returns every entry (transport teardown).
    pub fn drain(&mut self) -> Vec<ChannelEntry> {
        self.entries.drain().map(|(_, e)| e).collect()
    }
}
