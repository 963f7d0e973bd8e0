//! AMF (Action Message Format) implementation
//!
//! AMF is the binary serialization format used for RTMP command arguments,
//! shared-object payloads and data messages. Both AMF0 and AMF3 decode into
//! the same [`AmfValue`] tree. AMF3 reaches the wire either behind the AMF0
//! avmplus-object marker (0x11) or as the body of a type 17 command.

pub mod amf0;
pub mod amf3;
pub mod value;

pub use amf0::{Amf0Decoder, Amf0Encoder};
pub use amf3::{Amf3Decoder, Amf3Encoder};
pub use value::AmfValue;

/// Encoding used for outbound invocations and shared-object messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectEncoding {
    /// Plain AMF0 (message types 20, 19, 18)
    Amf0,
    /// AMF3 arguments (message types 17, 16, 15)
    #[default]
    Amf3,
}

impl ObjectEncoding {
    /// Value advertised as `objectEncoding` in the connect command
    pub fn as_number(self) -> f64 {
        match self {
            ObjectEncoding::Amf0 => 0.0,
            ObjectEncoding::Amf3 => 3.0,
        }
    }
}
