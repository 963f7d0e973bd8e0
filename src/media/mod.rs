//! Media sinks for NetStream audio and video
//!
//! RTMP audio/video message bodies are FLV tag bodies; [`FlvMuxer`] adds the
//! file and tag framing to record a stream.

pub mod flv;

pub use flv::{FlvMuxer, FlvTag, FlvTagType};
