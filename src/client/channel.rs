//! Chunk stream registry
//!
//! Inbound messages on a chunk stream other than 2 and 3 are routed to the
//! [`ChunkStream`] registered under that (server assigned) id. NetStreams
//! register a data/video/audio triplet once their stream is negotiated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{MisuseError, Result};
use crate::protocol::message::RtmpMessage;

/// Consumer of the messages routed to one chunk stream
///
/// Runs on the reader task; must not block.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, csid: u32, message: RtmpMessage);

    /// The session ended or the stream was unregistered
    fn close(&self) {}
}

/// A multiplexed logical channel
pub struct ChunkStream {
    local_id: u32,
    server_id: AtomicU32,
    sink: Arc<dyn MessageSink>,
}

impl ChunkStream {
    pub fn new(local_id: u32, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            local_id,
            server_id: AtomicU32::new(0),
            sink,
        }
    }

    /// Chunk stream id used when writing
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Id the server delivers on; 0 until negotiated
    pub fn server_id(&self) -> u32 {
        self.server_id.load(Ordering::Acquire)
    }

    pub fn set_server_id(&self, id: u32) {
        self.server_id.store(id, Ordering::Release);
    }

    pub fn deliver(&self, message: RtmpMessage) {
        self.sink.deliver(self.server_id(), message);
    }
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("local_id", &self.local_id)
            .field("server_id", &self.server_id())
            .finish()
    }
}

/// Server chunk stream id to ChunkStream
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    streams: Mutex<HashMap<u32, Arc<ChunkStream>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, server_id: u32, stream: Arc<ChunkStream>) -> Result<()> {
        self.register_all(&[(server_id, stream)])
    }

    /// Register several streams atomically
    ///
    /// Nothing is inserted if any id is taken; the existing entries stay.
    pub fn register_all(&self, entries: &[(u32, Arc<ChunkStream>)]) -> Result<()> {
        let mut streams = self.lock();
        for (i, (id, _)) in entries.iter().enumerate() {
            let duplicate = entries[..i].iter().any(|(other, _)| other == id);
            if duplicate || streams.contains_key(id) {
                return Err(MisuseError::ChunkStreamCollision(*id).into());
            }
        }
        for (id, stream) in entries {
            stream.set_server_id(*id);
            streams.insert(*id, stream.clone());
            tracing::trace!(csid = id, local = stream.local_id(), "Chunk stream registered");
        }
        Ok(())
    }

    /// Remove `server_id` if it still maps to `stream`
    pub fn unregister(&self, server_id: u32, stream: &Arc<ChunkStream>) -> bool {
        let mut streams = self.lock();
        match streams.get(&server_id) {
            Some(existing) if Arc::ptr_eq(existing, stream) => {
                streams.remove(&server_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, server_id: u32) -> Option<Arc<ChunkStream>> {
        self.lock().get(&server_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and close the sinks
    pub fn clear(&self) {
        let drained: Vec<_> = self.lock().drain().map(|(_, s)| s).collect();
        for stream in drained {
            stream.sink.close();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Arc<ChunkStream>>> {
        // A poisoned map is still structurally valid
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }
}
