//! RTMP message types and parsing
//!
//! RTMP messages are classified into:
//! - Protocol Control Messages (types 1-6): Chunk/flow control
//! - Invocations (types 17, 20): AMF-encoded remote calls and their replies
//! - Notifications (types 15, 18): AMF-encoded calls without a reply
//! - Shared Object Messages (types 16, 19)
//! - Audio/Video Messages (types 8, 9): Media data
//!
//! Type 17/15 bodies start with a 0x00 byte and then read as AMF0, switching
//! to AMF3 per value through the AVM+ marker.
//!
//! Reference: RTMP Specification Section 5.4

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{Amf0Decoder, Amf0Encoder, AmfValue, ObjectEncoding};
use crate::error::{ProtocolError, Result};
use crate::protocol::chunk::RtmpChunk;
use crate::protocol::constants::*;
use crate::protocol::shared_object::SharedObjectMessage;

/// Parsed RTMP message
#[derive(Debug, Clone)]
pub enum RtmpMessage {
    /// Set Chunk Size (type 1)
    SetChunkSize(u32),

    /// Abort Message (type 2)
    Abort { csid: u32 },

    /// Acknowledgement (type 3)
    Acknowledgement { sequence: u32 },

    /// User Control Message (type 4)
    UserControl(UserControlEvent),

    /// Window Acknowledgement Size (type 5)
    WindowAckSize(u32),

    /// Set Peer Bandwidth (type 6)
    SetPeerBandwidth { size: u32, limit_type: u8 },

    /// Audio data (type 8)
    Audio { timestamp: u32, data: Bytes },

    /// Video data (type 9)
    Video { timestamp: u32, data: Bytes },

    /// Remote call or reply (type 20 or 17)
    Invoke(Command),

    /// Call without reply (type 18 or 15)
    Notify(DataMessage),

    /// Shared object event batch (type 19 or 16)
    SharedObject(SharedObjectMessage),

    /// Aggregate message (type 22)
    Aggregate { data: Bytes },

    /// Unknown message type
    Unknown { type_id: u8, data: Bytes },
}

/// User Control Event
#[derive(Debug, Clone, PartialEq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    Unknown { event_type: u16, data: Bytes },
}

/// RTMP command (connect, _result, play, etc.)
#[derive(Debug, Clone)]
pub struct Command {
    /// Command name
    pub name: String,
    /// Transaction ID
    pub transaction_id: f64,
    /// Command object (often null)
    pub command_object: AmfValue,
    /// Additional arguments
    pub arguments: Vec<AmfValue>,
    /// Message stream ID (from chunk)
    pub stream_id: u32,
    /// Encoding of the arguments
    pub encoding: ObjectEncoding,
}

/// Notification (@setDataFrame, onMetaData, etc.)
#[derive(Debug, Clone)]
pub struct DataMessage {
    /// Handler name
    pub name: String,
    /// Data values
    pub values: Vec<AmfValue>,
    /// Message stream ID
    pub stream_id: u32,
    pub encoding: ObjectEncoding,
}

impl RtmpMessage {
    /// Parse a message from a chunk
    pub fn from_chunk(chunk: &RtmpChunk) -> Result<Self> {
        let mut payload = chunk.payload.clone();

        match chunk.message_type {
            MSG_SET_CHUNK_SIZE => {
                let size = read_u32(&mut payload)? & 0x7FFF_FFFF;
                Ok(RtmpMessage::SetChunkSize(size))
            }
            MSG_ABORT => Ok(RtmpMessage::Abort {
                csid: read_u32(&mut payload)?,
            }),
            MSG_ACKNOWLEDGEMENT => Ok(RtmpMessage::Acknowledgement {
                sequence: read_u32(&mut payload)?,
            }),
            MSG_USER_CONTROL => Self::parse_user_control(&mut payload),
            MSG_WINDOW_ACK_SIZE => Ok(RtmpMessage::WindowAckSize(read_u32(&mut payload)?)),
            MSG_SET_PEER_BANDWIDTH => {
                let size = read_u32(&mut payload)?;
                // Limit type is sometimes omitted
                let limit_type = if payload.has_remaining() {
                    payload.get_u8()
                } else {
                    2
                };
                Ok(RtmpMessage::SetPeerBandwidth { size, limit_type })
            }
            MSG_AUDIO => Ok(RtmpMessage::Audio {
                timestamp: chunk.timestamp,
                data: payload,
            }),
            MSG_VIDEO => Ok(RtmpMessage::Video {
                timestamp: chunk.timestamp,
                data: payload,
            }),
            MSG_COMMAND_AMF0 | MSG_COMMAND_AMF3 => {
                let encoding = strip_amf3_prefix(chunk.message_type == MSG_COMMAND_AMF3, &mut payload);
                let cmd = Self::parse_command(&mut payload, chunk.stream_id, encoding)?;
                Ok(RtmpMessage::Invoke(cmd))
            }
            MSG_DATA_AMF0 | MSG_DATA_AMF3 => {
                let encoding = strip_amf3_prefix(chunk.message_type == MSG_DATA_AMF3, &mut payload);
                let data = Self::parse_data(&mut payload, chunk.stream_id, encoding)?;
                Ok(RtmpMessage::Notify(data))
            }
            MSG_SHARED_OBJECT_AMF0 | MSG_SHARED_OBJECT_AMF3 => {
                let encoding = if chunk.message_type == MSG_SHARED_OBJECT_AMF3 {
                    ObjectEncoding::Amf3
                } else {
                    ObjectEncoding::Amf0
                };
                Ok(RtmpMessage::SharedObject(SharedObjectMessage::decode(payload, encoding)?))
            }
            MSG_AGGREGATE => Ok(RtmpMessage::Aggregate { data: payload }),
            _ => Ok(RtmpMessage::Unknown {
                type_id: chunk.message_type,
                data: payload,
            }),
        }
    }

    /// Parse User Control message
    fn parse_user_control(payload: &mut Bytes) -> Result<Self> {
        if payload.len() < 2 {
            return Err(ProtocolError::InvalidChunkHeader.into());
        }

        // Only known events have a fixed body; anything else is kept raw
        let event_type = payload.get_u16();
        let event = match event_type {
            UC_STREAM_BEGIN => UserControlEvent::StreamBegin(read_u32(payload)?),
            UC_STREAM_EOF => UserControlEvent::StreamEof(read_u32(payload)?),
            UC_STREAM_DRY => UserControlEvent::StreamDry(read_u32(payload)?),
            UC_SET_BUFFER_LENGTH => {
                let stream_id = read_u32(payload)?;
                let buffer_ms = read_u32(payload)?;
                UserControlEvent::SetBufferLength { stream_id, buffer_ms }
            }
            UC_STREAM_IS_RECORDED => UserControlEvent::StreamIsRecorded(read_u32(payload)?),
            UC_PING_REQUEST => UserControlEvent::PingRequest(read_u32(payload)?),
            UC_PING_RESPONSE => UserControlEvent::PingResponse(read_u32(payload)?),
            _ => UserControlEvent::Unknown {
                event_type,
                data: payload.clone(),
            },
        };

        Ok(RtmpMessage::UserControl(event))
    }

    fn parse_command(payload: &mut Bytes, stream_id: u32, encoding: ObjectEncoding) -> Result<Command> {
        let mut decoder = Amf0Decoder::new();

        let name = match decoder.decode(payload)? {
            AmfValue::String(s) => s,
            // Flex messages travel with a null method name
            AmfValue::Null => String::new(),
            _ => return Err(ProtocolError::InvalidCommand("expected command name".into()).into()),
        };

        let transaction_id = if payload.has_remaining() {
            decoder.decode(payload)?.as_number().unwrap_or(0.0)
        } else {
            0.0
        };

        let command_object = if payload.has_remaining() {
            decoder.decode(payload)?
        } else {
            AmfValue::Null
        };

        let arguments = decoder.decode_all(payload)?;

        Ok(Command {
            name,
            transaction_id,
            command_object,
            arguments,
            stream_id,
            encoding,
        })
    }

    fn parse_data(payload: &mut Bytes, stream_id: u32, encoding: ObjectEncoding) -> Result<DataMessage> {
        let mut decoder = Amf0Decoder::new();
        let mut values = decoder.decode_all(payload)?;

        let name = match values.first() {
            Some(AmfValue::String(_)) => match values.remove(0) {
                AmfValue::String(s) => s,
                _ => String::new(),
            },
            _ => String::new(),
        };

        Ok(DataMessage {
            name,
            values,
            stream_id,
            encoding,
        })
    }

    /// Encode message to chunk payload
    pub fn encode(&self) -> (u8, Bytes) {
        match self {
            RtmpMessage::SetChunkSize(size) => (MSG_SET_CHUNK_SIZE, u32_payload(*size)),
            RtmpMessage::Abort { csid } => (MSG_ABORT, u32_payload(*csid)),
            RtmpMessage::Acknowledgement { sequence } => (MSG_ACKNOWLEDGEMENT, u32_payload(*sequence)),
            RtmpMessage::WindowAckSize(size) => (MSG_WINDOW_ACK_SIZE, u32_payload(*size)),
            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u32(*size);
                buf.put_u8(*limit_type);
                (MSG_SET_PEER_BANDWIDTH, buf.freeze())
            }
            RtmpMessage::UserControl(event) => (MSG_USER_CONTROL, encode_user_control(event)),
            RtmpMessage::Audio { data, .. } => (MSG_AUDIO, data.clone()),
            RtmpMessage::Video { data, .. } => (MSG_VIDEO, data.clone()),
            RtmpMessage::Invoke(cmd) => {
                let type_id = match cmd.encoding {
                    ObjectEncoding::Amf0 => MSG_COMMAND_AMF0,
                    ObjectEncoding::Amf3 => MSG_COMMAND_AMF3,
                };
                (type_id, encode_command(cmd))
            }
            RtmpMessage::Notify(data) => {
                let type_id = match data.encoding {
                    ObjectEncoding::Amf0 => MSG_DATA_AMF0,
                    ObjectEncoding::Amf3 => MSG_DATA_AMF3,
                };
                (type_id, encode_data(data))
            }
            RtmpMessage::SharedObject(so) => (so.message_type(), so.encode()),
            RtmpMessage::Aggregate { data } => (MSG_AGGREGATE, data.clone()),
            RtmpMessage::Unknown { type_id, data } => (*type_id, data.clone()),
        }
    }

    /// Encode into a chunk-stream-ready message
    pub fn to_chunk(&self, csid: u32, stream_id: u32) -> RtmpChunk {
        let (message_type, payload) = self.encode();
        let timestamp = match self {
            RtmpMessage::Audio { timestamp, .. } | RtmpMessage::Video { timestamp, .. } => *timestamp,
            _ => 0,
        };
        RtmpChunk {
            csid,
            timestamp,
            message_type,
            stream_id,
            payload,
        }
    }
}

fn read_u32(payload: &mut Bytes) -> Result<u32> {
    if payload.len() < 4 {
        return Err(ProtocolError::InvalidChunkHeader.into());
    }
    Ok(payload.get_u32())
}

fn u32_payload(value: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(value);
    buf.freeze()
}

fn strip_amf3_prefix(amf3: bool, payload: &mut Bytes) -> ObjectEncoding {
    if !amf3 {
        return ObjectEncoding::Amf0;
    }
    if payload.first() == Some(&0x00) {
        payload.advance(1);
    }
    ObjectEncoding::Amf3
}

fn encode_user_control(event: &UserControlEvent) -> Bytes {
    let mut buf = BytesMut::with_capacity(10);
    match event {
        UserControlEvent::StreamBegin(id) => {
            buf.put_u16(UC_STREAM_BEGIN);
            buf.put_u32(*id);
        }
        UserControlEvent::StreamEof(id) => {
            buf.put_u16(UC_STREAM_EOF);
            buf.put_u32(*id);
        }
        UserControlEvent::StreamDry(id) => {
            buf.put_u16(UC_STREAM_DRY);
            buf.put_u32(*id);
        }
        UserControlEvent::SetBufferLength { stream_id, buffer_ms } => {
            buf.put_u16(UC_SET_BUFFER_LENGTH);
            buf.put_u32(*stream_id);
            buf.put_u32(*buffer_ms);
        }
        UserControlEvent::StreamIsRecorded(id) => {
            buf.put_u16(UC_STREAM_IS_RECORDED);
            buf.put_u32(*id);
        }
        UserControlEvent::PingRequest(ts) => {
            buf.put_u16(UC_PING_REQUEST);
            buf.put_u32(*ts);
        }
        UserControlEvent::PingResponse(ts) => {
            buf.put_u16(UC_PING_RESPONSE);
            buf.put_u32(*ts);
        }
        UserControlEvent::Unknown { event_type, data } => {
            buf.put_u16(*event_type);
            buf.put_slice(data);
        }
    }
    buf.freeze()
}

/// Name and transaction id stay AMF0; arguments switch to AMF3 when asked
fn encode_command(cmd: &Command) -> Bytes {
    let mut head = Amf0Encoder::new();
    if cmd.name.is_empty() {
        head.encode(&AmfValue::Null);
    } else {
        head.encode(&AmfValue::String(cmd.name.clone()));
    }
    head.encode(&AmfValue::Number(cmd.transaction_id));
    head.encode(&cmd.command_object);

    let mut buf = BytesMut::new();
    if cmd.encoding == ObjectEncoding::Amf3 {
        buf.put_u8(0x00);
    }
    buf.put_slice(&head.finish());
    buf.put_slice(&encode_values(&cmd.arguments, cmd.encoding));
    buf.freeze()
}

fn encode_data(data: &DataMessage) -> Bytes {
    let mut head = Amf0Encoder::new();
    head.encode(&AmfValue::String(data.name.clone()));

    let mut buf = BytesMut::new();
    if data.encoding == ObjectEncoding::Amf3 {
        buf.put_u8(0x00);
    }
    buf.put_slice(&head.finish());
    buf.put_slice(&encode_values(&data.values, data.encoding));
    buf.freeze()
}

fn encode_values(values: &[AmfValue], encoding: ObjectEncoding) -> Bytes {
    let mut encoder = match encoding {
        ObjectEncoding::Amf0 => Amf0Encoder::new(),
        ObjectEncoding::Amf3 => Amf0Encoder::avmplus(),
    };
    encoder.encode_all(values);
    encoder.finish()
}

impl Command {
    /// Build an outbound invocation
    pub fn invoke(
        name: impl Into<String>,
        transaction_id: f64,
        arguments: Vec<AmfValue>,
        encoding: ObjectEncoding,
    ) -> Self {
        Command {
            name: name.into(),
            transaction_id,
            command_object: AmfValue::Null,
            arguments,
            stream_id: 0,
            encoding,
        }
    }

    /// Create a _result response
    pub fn result(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Command {
            name: CMD_RESULT.to_string(),
            transaction_id,
            command_object: properties,
            arguments: vec![info],
            stream_id: 0,
            encoding: ObjectEncoding::Amf0,
        }
    }

    /// Create an _error response
    pub fn error(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Command {
            name: CMD_ERROR.to_string(),
            transaction_id,
            command_object: properties,
            arguments: vec![info],
            stream_id: 0,
            encoding: ObjectEncoding::Amf0,
        }
    }

    /// Create an onStatus notification
    pub fn on_status(stream_id: u32, level: &str, code: &str, description: &str) -> Self {
        Command {
            name: CMD_ON_STATUS.to_string(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: vec![AmfValue::object([
                ("level", level),
                ("code", code),
                ("description", description),
            ])],
            stream_id,
            encoding: ObjectEncoding::Amf0,
        }
    }

    /// First argument, which carries the payload of replies
    pub fn first_argument(&self) -> AmfValue {
        self.arguments.first().cloned().unwrap_or(AmfValue::Null)
    }
}
