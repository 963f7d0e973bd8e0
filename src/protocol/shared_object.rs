//! Shared object message wire format (types 16 and 19)
//!
//! ```text
//! +------------+---------+-------+----------+----------------------+
//! | name (u16  | version | flags | reserved | events ...           |
//! | + UTF-8)   | (u32)   | (u32) | (u32)    |                      |
//! +------------+---------+-------+----------+----------------------+
//!
//! event: type (u8) + body length (u32) + body
//! ```
//!
//! The AMF3 flavour (type 16) prefixes the whole body with a single 0x00.
//! Values inside event bodies are AMF0, with AVM+ switches when the object
//! encoding is AMF3.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{Amf0Decoder, Amf0Encoder, AmfValue, ObjectEncoding};
use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;

/// One shared object message: a batch of events for a single object
#[derive(Debug, Clone, PartialEq)]
pub struct SharedObjectMessage {
    pub name: String,
    pub version: u32,
    pub persistent: bool,
    pub events: Vec<SharedObjectEvent>,
    pub encoding: ObjectEncoding,
}

/// Shared object event
///
/// Client to server: Connect, Disconnect, SetAttribute, DeleteAttribute,
/// SendMessage. Server to client: everything else, plus SendMessage.
#[derive(Debug, Clone, PartialEq)]
pub enum SharedObjectEvent {
    Connect,
    Disconnect,
    /// Request to set a slot
    SetAttribute { name: String, value: AmfValue },
    /// Authoritative slot value from the server
    UpdateData { name: String, value: AmfValue },
    /// Acknowledgement of one of our own attribute changes
    UpdateAttribute { name: String },
    SendMessage { method: String, args: Vec<AmfValue> },
    Status { code: String, level: String },
    ClearData,
    DeleteData { name: String },
    /// Request to remove a slot
    DeleteAttribute { name: String },
    /// Server accepted the connect
    ConnectSuccess,
    Unknown { event_type: u8, data: Bytes },
}

impl SharedObjectEvent {
    pub fn event_type(&self) -> u8 {
        match self {
            SharedObjectEvent::Connect => SO_CONNECT,
            SharedObjectEvent::Disconnect => SO_DISCONNECT,
            SharedObjectEvent::SetAttribute { .. } => SO_SET_ATTRIBUTE,
            SharedObjectEvent::UpdateData { .. } => SO_UPDATE_DATA,
            SharedObjectEvent::UpdateAttribute { .. } => SO_UPDATE_ATTRIBUTE,
            SharedObjectEvent::SendMessage { .. } => SO_SEND_MESSAGE,
            SharedObjectEvent::Status { .. } => SO_STATUS,
            SharedObjectEvent::ClearData => SO_CLEAR_DATA,
            SharedObjectEvent::DeleteData { .. } => SO_DELETE_DATA,
            SharedObjectEvent::DeleteAttribute { .. } => SO_DELETE_ATTRIBUTE,
            SharedObjectEvent::ConnectSuccess => SO_INITIAL_DATA,
            SharedObjectEvent::Unknown { event_type, .. } => *event_type,
        }
    }
}

impl SharedObjectMessage {
    pub fn new(name: impl Into<String>, version: u32, persistent: bool, encoding: ObjectEncoding) -> Self {
        Self {
            name: name.into(),
            version,
            persistent,
            events: Vec::new(),
            encoding,
        }
    }

    /// Message type id for this message's encoding
    pub fn message_type(&self) -> u8 {
        match self.encoding {
            ObjectEncoding::Amf0 => MSG_SHARED_OBJECT_AMF0,
            ObjectEncoding::Amf3 => MSG_SHARED_OBJECT_AMF3,
        }
    }

    /// Parse a message body
    pub fn decode(mut payload: Bytes, encoding: ObjectEncoding) -> Result<Self> {
        if encoding == ObjectEncoding::Amf3 && payload.first() == Some(&0x00) {
            payload.advance(1);
        }

        let name = read_string(&mut payload)?;
        if payload.remaining() < 12 {
            return Err(invalid("truncated header"));
        }
        let version = payload.get_u32();
        let flags = payload.get_u32();
        let _reserved = payload.get_u32();

        let mut events = Vec::new();
        while payload.has_remaining() {
            if payload.remaining() < 5 {
                return Err(invalid("truncated event header"));
            }
            let event_type = payload.get_u8();
            let len = payload.get_u32() as usize;
            if payload.remaining() < len {
                return Err(invalid("truncated event body"));
            }
            let body = payload.split_to(len);
            decode_event(event_type, body, &mut events)?;
        }

        Ok(Self {
            name,
            version,
            persistent: flags & SO_FLAG_PERSISTENT != 0,
            events,
            encoding,
        })
    }

    /// Serialize the message body
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        if self.encoding == ObjectEncoding::Amf3 {
            buf.put_u8(0x00);
        }
        write_string(&mut buf, &self.name);
        buf.put_u32(self.version);
        buf.put_u32(if self.persistent { SO_FLAG_PERSISTENT } else { 0 });
        buf.put_u32(0);

        for event in &self.events {
            let body = encode_event(event, self.encoding);
            buf.put_u8(event.event_type());
            buf.put_u32(body.len() as u32);
            buf.put_slice(&body);
        }
        buf.freeze()
    }
}

fn invalid(what: &str) -> crate::error::Error {
    ProtocolError::InvalidSharedObject(what.to_string()).into()
}

fn decode_event(event_type: u8, mut body: Bytes, out: &mut Vec<SharedObjectEvent>) -> Result<()> {
    let mut decoder = Amf0Decoder::new();
    match event_type {
        SO_CONNECT => out.push(SharedObjectEvent::Connect),
        SO_DISCONNECT => out.push(SharedObjectEvent::Disconnect),
        SO_CLEAR_DATA => out.push(SharedObjectEvent::ClearData),
        SO_INITIAL_DATA => out.push(SharedObjectEvent::ConnectSuccess),
        SO_SET_ATTRIBUTE | SO_UPDATE_DATA => {
            // A body may carry several name/value pairs
            while body.has_remaining() {
                let name = read_string(&mut body)?;
                let value = decoder.decode(&mut body)?;
                out.push(if event_type == SO_SET_ATTRIBUTE {
                    SharedObjectEvent::SetAttribute { name, value }
                } else {
                    SharedObjectEvent::UpdateData { name, value }
                });
            }
        }
        SO_UPDATE_ATTRIBUTE | SO_DELETE_DATA | SO_DELETE_ATTRIBUTE => {
            let name = read_string(&mut body)?;
            out.push(match event_type {
                SO_UPDATE_ATTRIBUTE => SharedObjectEvent::UpdateAttribute { name },
                SO_DELETE_DATA => SharedObjectEvent::DeleteData { name },
                _ => SharedObjectEvent::DeleteAttribute { name },
            });
        }
        SO_SEND_MESSAGE => {
            let method = match decoder.decode(&mut body)? {
                AmfValue::String(s) => s,
                _ => return Err(invalid("send message without method name")),
            };
            let args = decoder.decode_all(&mut body)?;
            out.push(SharedObjectEvent::SendMessage { method, args });
        }
        SO_STATUS => {
            let code = read_string(&mut body)?;
            let level = read_string(&mut body)?;
            out.push(SharedObjectEvent::Status { code, level });
        }
        _ => out.push(SharedObjectEvent::Unknown {
            event_type,
            data: body,
        }),
    }
    Ok(())
}

fn encode_event(event: &SharedObjectEvent, encoding: ObjectEncoding) -> Bytes {
    let mut buf = BytesMut::new();
    let mut values = match encoding {
        ObjectEncoding::Amf0 => Amf0Encoder::new(),
        ObjectEncoding::Amf3 => Amf0Encoder::avmplus(),
    };

    match event {
        SharedObjectEvent::Connect
        | SharedObjectEvent::Disconnect
        | SharedObjectEvent::ClearData
        | SharedObjectEvent::ConnectSuccess => {}
        SharedObjectEvent::SetAttribute { name, value }
        | SharedObjectEvent::UpdateData { name, value } => {
            write_string(&mut buf, name);
            values.encode(value);
            buf.put_slice(&values.finish());
        }
        SharedObjectEvent::UpdateAttribute { name }
        | SharedObjectEvent::DeleteData { name }
        | SharedObjectEvent::DeleteAttribute { name } => write_string(&mut buf, name),
        SharedObjectEvent::SendMessage { method, args } => {
            // The method name stays plain AMF0 so any server can route it
            let mut head = Amf0Encoder::new();
            head.encode(&AmfValue::String(method.clone()));
            buf.put_slice(&head.finish());
            values.encode_all(args);
            buf.put_slice(&values.finish());
        }
        SharedObjectEvent::Status { code, level } => {
            write_string(&mut buf, code);
            write_string(&mut buf, level);
        }
        SharedObjectEvent::Unknown { data, .. } => buf.put_slice(data),
    }
    buf.freeze()
}

fn read_string(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(invalid("truncated string"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(invalid("truncated string"));
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| invalid("invalid UTF-8 in name"))
}

fn write_string(buf: &mut BytesMut, s: &str) {
    let len = s.len().min(0xFFFF);
    buf.put_u16(len as u16);
    buf.put_slice(&s.as_bytes()[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_message_layout() {
        let mut msg = SharedObjectMessage::new("room", 1, true, ObjectEncoding::Amf0);
        msg.events.push(SharedObjectEvent::Connect);
        let bytes = msg.encode();

        let expected: &[u8] = &[
            0, 4, b'r', b'o', b'o', b'm', // name
            0, 0, 0, 1, // version
            0, 0, 0, 2, // persistent flag
            0, 0, 0, 0, // reserved
            SO_CONNECT, 0, 0, 0, 0, // empty connect event
        ];
        assert_eq!(&bytes[..], expected);
        assert_eq!(msg.message_type(), MSG_SHARED_OBJECT_AMF0);
    }

    #[test]
    fn test_amf3_prefix() {
        let msg = SharedObjectMessage::new("a", 2, false, ObjectEncoding::Amf3);
        let bytes = msg.encode();
        assert_eq!(bytes[0], 0x00);
        let decoded = SharedObjectMessage::decode(bytes, ObjectEncoding::Amf3).unwrap();
        assert_eq!(decoded.name, "a");
        assert_eq!(decoded.version, 2);
        assert!(!decoded.persistent);
    }

    #[test]
    fn test_server_events() {
        let mut msg = SharedObjectMessage::new("so", 7, false, ObjectEncoding::Amf3);
        msg.events = vec![
            SharedObjectEvent::ConnectSuccess,
            SharedObjectEvent::ClearData,
            SharedObjectEvent::UpdateData {
                name: "score".into(),
                value: AmfValue::Integer(3),
            },
            SharedObjectEvent::DeleteData { name: "old".into() },
            SharedObjectEvent::SendMessage {
                method: "chat".into(),
                args: vec!["hi".into()],
            },
            SharedObjectEvent::Status {
                code: "SharedObject.BadPersistence".into(),
                level: "error".into(),
            },
            SharedObjectEvent::Unknown {
                event_type: 42,
                data: Bytes::from_static(&[1, 2]),
            },
        ];

        let decoded = SharedObjectMessage::decode(msg.encode(), ObjectEncoding::Amf3).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_multi_pair_update_data() {
        let mut body = BytesMut::new();
        write_string(&mut body, "a");
        body.put_slice(&crate::amf::amf0::encode(&AmfValue::Number(1.0)));
        write_string(&mut body, "b");
        body.put_slice(&crate::amf::amf0::encode(&AmfValue::Boolean(true)));

        let mut events = Vec::new();
        decode_event(SO_UPDATE_DATA, body.freeze(), &mut events).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            SharedObjectEvent::UpdateData {
                name: "b".into(),
                value: AmfValue::Boolean(true)
            }
        );
    }

    #[test]
    fn test_truncated_event_is_rejected() {
        let mut msg = SharedObjectMessage::new("x", 1, false, ObjectEncoding::Amf0);
        msg.events.push(SharedObjectEvent::DeleteData { name: "key".into() });
        let bytes = msg.encode();
        let cut = bytes.slice(..bytes.len() - 2);
        assert!(SharedObjectMessage::decode(cut, ObjectEncoding::Amf0).is_err());
    }
}
