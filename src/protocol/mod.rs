//! RTMP wire protocol implementation
//!
//! This module handles the low-level protocol details:
//! - Handshake (C0C1/S0S1S2/C2 exchange)
//! - Chunk stream multiplexing and demultiplexing
//! - Message framing and parsing
//! - Shared object message format

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;
pub mod shared_object;

pub use chunk::{ChunkDecoder, ChunkEncoder, ChunkHeader, RawChunk, RtmpChunk};
pub use handshake::{ClientHandshake, Handshaker, SimpleHandshake};
pub use message::{Command, DataMessage, RtmpMessage, UserControlEvent};
pub use shared_object::{SharedObjectEvent, SharedObjectMessage};
