//! AMF3 encoder and decoder
//!
//! AMF3 is the ActionScript 3.0 serialization format. Inside RTMP it shows up
//! either embedded in an AMF0 stream behind the AVM+ marker (0x11), or as the
//! argument encoding of type 17 commands.
//!
//! Type Markers:
//! ```text
//! 0x00 - Undefined        0x09 - Array
//! 0x01 - Null             0x0A - Object
//! 0x02 - False            0x0B - XML
//! 0x03 - True             0x0C - ByteArray
//! 0x04 - Integer (U29)    0x0D - Vector<int>
//! 0x05 - Double           0x0E - Vector<uint>
//! 0x06 - String           0x0F - Vector<Number>
//! 0x07 - XMLDocument      0x10 - Vector<Object>
//! 0x08 - Date             0x11 - Dictionary
//! ```
//!
//! Strings, complex objects and class traits each have their own reference
//! table. Tables live for the lifetime of one decoder/encoder, which the
//! message layer scopes to a single message.
//!
//! Reference: AMF3 Specification (amf3_spec_121207.pdf)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::value::AmfValue;
use crate::error::AmfError;

const MARKER_UNDEFINED: u8 = 0x00;
const MARKER_NULL: u8 = 0x01;
const MARKER_FALSE: u8 = 0x02;
const MARKER_TRUE: u8 = 0x03;
const MARKER_INTEGER: u8 = 0x04;
const MARKER_DOUBLE: u8 = 0x05;
const MARKER_STRING: u8 = 0x06;
const MARKER_XML_DOC: u8 = 0x07;
const MARKER_DATE: u8 = 0x08;
const MARKER_ARRAY: u8 = 0x09;
const MARKER_OBJECT: u8 = 0x0A;
const MARKER_XML: u8 = 0x0B;
const MARKER_BYTE_ARRAY: u8 = 0x0C;
const MARKER_VECTOR_INT: u8 = 0x0D;
const MARKER_VECTOR_UINT: u8 = 0x0E;
const MARKER_VECTOR_DOUBLE: u8 = 0x0F;
const MARKER_VECTOR_OBJECT: u8 = 0x10;
const MARKER_DICTIONARY: u8 = 0x11;

/// Largest value representable by an AMF3 integer
const INTEGER_MAX: i32 = 0x0FFF_FFFF;
/// Smallest value representable by an AMF3 integer
const INTEGER_MIN: i32 = -0x1000_0000;

const MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug, Clone)]
struct Traits {
    class_name: String,
    dynamic: bool,
    sealed: Vec<String>,
}

/// AMF3 decoder
#[derive(Default)]
pub struct Amf3Decoder {
    strings: Vec<String>,
    objects: Vec<AmfValue>,
    traits: Vec<Traits>,
    depth: usize,
}

impl Amf3Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all reference tables
    pub fn reset(&mut self) {
        self.strings.clear();
        self.objects.clear();
        self.traits.clear();
        self.depth = 0;
    }

    /// Decode a single AMF3 value
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.is_empty() {
            return Err(AmfError::UnexpectedEof);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(AmfError::NestingTooDeep);
        }

        let marker = buf.get_u8();
        let result = self.decode_value(marker, buf);
        self.depth -= 1;
        result
    }

    fn decode_value(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_UNDEFINED => Ok(AmfValue::Undefined),
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_FALSE => Ok(AmfValue::Boolean(false)),
            MARKER_TRUE => Ok(AmfValue::Boolean(true)),
            MARKER_INTEGER => {
                let raw = read_u29(buf)?;
                // Sign-extend the 29-bit value
                let value = if raw & 0x1000_0000 != 0 {
                    (raw as i32) - 0x2000_0000
                } else {
                    raw as i32
                };
                Ok(AmfValue::Integer(value))
            }
            MARKER_DOUBLE => {
                if buf.remaining() < 8 {
                    return Err(AmfError::UnexpectedEof);
                }
                Ok(AmfValue::Number(buf.get_f64()))
            }
            MARKER_STRING => Ok(AmfValue::String(self.read_string(buf)?)),
            MARKER_XML_DOC | MARKER_XML => self.decode_xml(buf),
            MARKER_DATE => self.decode_date(buf),
            MARKER_ARRAY => self.decode_array(buf),
            MARKER_OBJECT => self.decode_object(buf),
            MARKER_BYTE_ARRAY => self.decode_byte_array(buf),
            MARKER_VECTOR_INT | MARKER_VECTOR_UINT | MARKER_VECTOR_DOUBLE
            | MARKER_VECTOR_OBJECT => self.decode_vector(marker, buf),
            MARKER_DICTIONARY => self.decode_dictionary(buf),
            _ => Err(AmfError::UnknownMarker(marker)),
        }
    }

    fn object_ref(&self, index: u32) -> Result<AmfValue, AmfError> {
        self.objects
            .get(index as usize)
            .cloned()
            .ok_or(AmfError::InvalidReference(index))
    }

    fn read_string(&mut self, buf: &mut Bytes) -> Result<String, AmfError> {
        let header = read_u29(buf)?;
        if header & 1 == 0 {
            let index = header >> 1;
            return self
                .strings
                .get(index as usize)
                .cloned()
                .ok_or(AmfError::InvalidReference(index));
        }

        let len = (header >> 1) as usize;
        if buf.remaining() < len {
            return Err(AmfError::UnexpectedEof);
        }
        let bytes = buf.copy_to_bytes(len);
        let s = String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)?;
        if !s.is_empty() {
            self.strings.push(s.clone());
        }
        Ok(s)
    }

    fn decode_xml(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        let header = read_u29(buf)?;
        if header & 1 == 0 {
            return self.object_ref(header >> 1);
        }
        let len = (header >> 1) as usize;
        if buf.remaining() < len {
            return Err(AmfError::UnexpectedEof);
        }
        let bytes = buf.copy_to_bytes(len);
        let s = String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)?;
        let value = AmfValue::Xml(s);
        self.objects.push(value.clone());
        Ok(value)
    }

    fn decode_date(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        let header = read_u29(buf)?;
        if header & 1 == 0 {
            return self.object_ref(header >> 1);
        }
        if buf.remaining() < 8 {
            return Err(AmfError::UnexpectedEof);
        }
        let value = AmfValue::Date(buf.get_f64());
        self.objects.push(value.clone());
        Ok(value)
    }

    fn decode_byte_array(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        let header = read_u29(buf)?;
        if header & 1 == 0 {
            return self.object_ref(header >> 1);
        }
        let len = (header >> 1) as usize;
        if buf.remaining() < len {
            return Err(AmfError::UnexpectedEof);
        }
        let value = AmfValue::ByteArray(buf.copy_to_bytes(len).to_vec());
        self.objects.push(value.clone());
        Ok(value)
    }

    fn decode_array(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        let header = read_u29(buf)?;
        if header & 1 == 0 {
            return self.object_ref(header >> 1);
        }
        let dense_len = (header >> 1) as usize;

        let index = self.objects.len();
        self.objects.push(AmfValue::Null);

        let mut assoc = HashMap::new();
        loop {
            let key = self.read_string(buf)?;
            if key.is_empty() {
                break;
            }
            let value = self.decode(buf)?;
            assoc.insert(key, value);
        }

        let mut dense = Vec::with_capacity(dense_len.min(1024));
        for _ in 0..dense_len {
            dense.push(self.decode(buf)?);
        }

        let value = if assoc.is_empty() {
            AmfValue::Array(dense)
        } else {
            for (i, v) in dense.into_iter().enumerate() {
                assoc.insert(i.to_string(), v);
            }
            AmfValue::EcmaArray(assoc)
        };
        self.objects[index] = value.clone();
        Ok(value)
    }

    fn decode_object(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        let header = read_u29(buf)?;
        if header & 1 == 0 {
            return self.object_ref(header >> 1);
        }

        let traits = if header & 2 == 0 {
            let index = header >> 2;
            self.traits
                .get(index as usize)
                .cloned()
                .ok_or(AmfError::InvalidReference(index))?
        } else if header & 4 != 0 {
            let class_name = self.read_string(buf)?;
            return Err(AmfError::Unsupported(format!(
                "externalizable class {}",
                class_name
            )));
        } else {
            let dynamic = header & 8 != 0;
            let sealed_count = (header >> 4) as usize;
            let class_name = self.read_string(buf)?;
            let mut sealed = Vec::with_capacity(sealed_count.min(256));
            for _ in 0..sealed_count {
                sealed.push(self.read_string(buf)?);
            }
            let traits = Traits {
                class_name,
                dynamic,
                sealed,
            };
            self.traits.push(traits.clone());
            traits
        };

        let index = self.objects.len();
        self.objects.push(AmfValue::Null);

        let mut properties = HashMap::new();
        for name in &traits.sealed {
            let value = self.decode(buf)?;
            properties.insert(name.clone(), value);
        }
        if traits.dynamic {
            loop {
                let key = self.read_string(buf)?;
                if key.is_empty() {
                    break;
                }
                let value = self.decode(buf)?;
                properties.insert(key, value);
            }
        }

        let value = if traits.class_name.is_empty() {
            AmfValue::Object(properties)
        } else {
            AmfValue::TypedObject {
                class_name: traits.class_name,
                properties,
            }
        };
        self.objects[index] = value.clone();
        Ok(value)
    }

    fn decode_vector(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        let header = read_u29(buf)?;
        if header & 1 == 0 {
            return self.object_ref(header >> 1);
        }
        let len = (header >> 1) as usize;
        if buf.is_empty() {
            return Err(AmfError::UnexpectedEof);
        }
        let _fixed = buf.get_u8();

        let index = self.objects.len();
        self.objects.push(AmfValue::Null);

        let mut items = Vec::with_capacity(len.min(1024));
        match marker {
            MARKER_VECTOR_INT | MARKER_VECTOR_UINT | MARKER_VECTOR_DOUBLE => {
                let width = if marker == MARKER_VECTOR_DOUBLE { 8 } else { 4 };
                if buf.remaining() < len * width {
                    return Err(AmfError::UnexpectedEof);
                }
                for _ in 0..len {
                    let item = match marker {
                        MARKER_VECTOR_INT => AmfValue::Integer(buf.get_i32()),
                        MARKER_VECTOR_UINT => AmfValue::Number(buf.get_u32() as f64),
                        _ => AmfValue::Number(buf.get_f64()),
                    };
                    items.push(item);
                }
            }
            _ => {
                let _type_name = self.read_string(buf)?;
                for _ in 0..len {
                    items.push(self.decode(buf)?);
                }
            }
        }

        let value = AmfValue::Array(items);
        self.objects[index] = value.clone();
        Ok(value)
    }

    fn decode_dictionary(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        let header = read_u29(buf)?;
        if header & 1 == 0 {
            return self.object_ref(header >> 1);
        }
        let len = (header >> 1) as usize;
        if buf.is_empty() {
            return Err(AmfError::UnexpectedEof);
        }
        let _weak_keys = buf.get_u8();

        let index = self.objects.len();
        self.objects.push(AmfValue::Null);

        let mut entries = HashMap::new();
        for _ in 0..len {
            let key = match self.decode(buf)? {
                AmfValue::String(s) => s,
                AmfValue::Integer(i) => i.to_string(),
                AmfValue::Number(n) => n.to_string(),
                AmfValue::Boolean(b) => b.to_string(),
                other => {
                    return Err(AmfError::Unsupported(format!("dictionary key {:?}", other)))
                }
            };
            let value = self.decode(buf)?;
            entries.insert(key, value);
        }

        let value = AmfValue::EcmaArray(entries);
        self.objects[index] = value.clone();
        Ok(value)
    }
}

/// AMF3 encoder
///
/// Emits string references for repeated strings; complex values are always
/// written inline.
#[derive(Default)]
pub struct Amf3Encoder {
    buf: BytesMut,
    strings: HashMap<String, u32>,
}

impl Amf3Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the encoded bytes and reset the encoder
    pub fn finish(&mut self) -> Bytes {
        self.strings.clear();
        self.buf.split().freeze()
    }

    /// Encode a single AMF3 value
    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Undefined => self.buf.put_u8(MARKER_UNDEFINED),
            AmfValue::Null => self.buf.put_u8(MARKER_NULL),
            AmfValue::Boolean(false) => self.buf.put_u8(MARKER_FALSE),
            AmfValue::Boolean(true) => self.buf.put_u8(MARKER_TRUE),
            AmfValue::Integer(i) if (INTEGER_MIN..=INTEGER_MAX).contains(i) => {
                self.buf.put_u8(MARKER_INTEGER);
                write_u29(&mut self.buf, (*i as u32) & 0x1FFF_FFFF);
            }
            AmfValue::Integer(i) => {
                self.buf.put_u8(MARKER_DOUBLE);
                self.buf.put_f64(*i as f64);
            }
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_DOUBLE);
                self.buf.put_f64(*n);
            }
            AmfValue::String(s) => {
                self.buf.put_u8(MARKER_STRING);
                self.write_string(s);
            }
            AmfValue::Xml(s) => {
                self.buf.put_u8(MARKER_XML);
                write_u29(&mut self.buf, ((s.len() as u32) << 1) | 1);
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::Date(ms) => {
                self.buf.put_u8(MARKER_DATE);
                write_u29(&mut self.buf, 1);
                self.buf.put_f64(*ms);
            }
            AmfValue::ByteArray(bytes) => {
                self.buf.put_u8(MARKER_BYTE_ARRAY);
                write_u29(&mut self.buf, ((bytes.len() as u32) << 1) | 1);
                self.buf.put_slice(bytes);
            }
            AmfValue::Array(items) => {
                self.buf.put_u8(MARKER_ARRAY);
                write_u29(&mut self.buf, ((items.len() as u32) << 1) | 1);
                self.write_string("");
                for item in items {
                    self.encode(item);
                }
            }
            AmfValue::EcmaArray(props) => {
                self.buf.put_u8(MARKER_ARRAY);
                write_u29(&mut self.buf, 1);
                for (key, val) in props {
                    self.write_string(key);
                    self.encode(val);
                }
                self.write_string("");
            }
            AmfValue::Object(props) => {
                // inline object, inline traits, dynamic, no sealed members
                self.buf.put_u8(MARKER_OBJECT);
                write_u29(&mut self.buf, 0x0B);
                self.write_string("");
                for (key, val) in props {
                    self.write_string(key);
                    self.encode(val);
                }
                self.write_string("");
            }
            AmfValue::TypedObject {
                class_name,
                properties,
            } => {
                let mut names: Vec<&String> = properties.keys().collect();
                names.sort();

                self.buf.put_u8(MARKER_OBJECT);
                write_u29(&mut self.buf, ((names.len() as u32) << 4) | 0x03);
                self.write_string(class_name);
                for name in &names {
                    self.write_string(name);
                }
                for name in &names {
                    self.encode(&properties[*name]);
                }
            }
        }
    }

    fn write_string(&mut self, s: &str) {
        if s.is_empty() {
            write_u29(&mut self.buf, 1);
            return;
        }
        if let Some(index) = self.strings.get(s) {
            write_u29(&mut self.buf, index << 1);
            return;
        }
        let index = self.strings.len() as u32;
        self.strings.insert(s.to_string(), index);
        write_u29(&mut self.buf, ((s.len() as u32) << 1) | 1);
        self.buf.put_slice(s.as_bytes());
    }
}

/// Read a variable-length 29-bit unsigned integer
fn read_u29(buf: &mut Bytes) -> Result<u32, AmfError> {
    let mut result: u32 = 0;
    for i in 0..4 {
        if buf.is_empty() {
            return Err(AmfError::UnexpectedEof);
        }
        let byte = buf.get_u8() as u32;
        if i == 3 {
            result = (result << 8) | byte;
            break;
        }
        result = (result << 7) | (byte & 0x7F);
        if byte & 0x80 == 0 {
            break;
        }
    }
    Ok(result)
}

/// Write a variable-length 29-bit unsigned integer
fn write_u29(buf: &mut BytesMut, value: u32) {
    let value = value & 0x1FFF_FFFF;
    if value < 0x80 {
        buf.put_u8(value as u8);
    } else if value < 0x4000 {
        buf.put_u8(((value >> 7) | 0x80) as u8);
        buf.put_u8((value & 0x7F) as u8);
    } else if value < 0x20_0000 {
        buf.put_u8(((value >> 14) | 0x80) as u8);
        buf.put_u8((((value >> 7) & 0x7F) | 0x80) as u8);
        buf.put_u8((value & 0x7F) as u8);
    } else {
        buf.put_u8(((value >> 22) | 0x80) as u8);
        buf.put_u8((((value >> 15) & 0x7F) | 0x80) as u8);
        buf.put_u8((((value >> 8) & 0x7F) | 0x80) as u8);
        buf.put_u8((value & 0xFF) as u8);
    }
}

/// Convenience function to encode a single value
pub fn encode(value: &AmfValue) -> Bytes {
    let mut encoder = Amf3Encoder::new();
    encoder.encode(value);
    encoder.finish()
}

/// Convenience function to decode a single value
pub fn decode(data: &[u8]) -> Result<AmfValue, AmfError> {
    let mut decoder = Amf3Decoder::new();
    let mut buf = Bytes::copy_from_slice(data);
    decoder.decode(&mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u29_boundaries() {
        for value in [0u32, 0x7F, 0x80, 0x3FFF, 0x4000, 0x1F_FFFF, 0x20_0000, 0x1FFF_FFFF] {
            let mut buf = BytesMut::new();
            write_u29(&mut buf, value);
            let mut bytes = buf.freeze();
            assert_eq!(read_u29(&mut bytes).unwrap(), value);
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn test_negative_integer() {
        let decoded = decode(&encode(&AmfValue::Integer(-5))).unwrap();
        assert_eq!(decoded, AmfValue::Integer(-5));

        // Out of 29-bit range falls back to a double
        let big = encode(&AmfValue::Integer(i32::MAX));
        assert_eq!(big[0], MARKER_DOUBLE);
    }

    #[test]
    fn test_string_references() {
        let value = AmfValue::Array(vec!["dup".into(), "dup".into(), "other".into()]);
        let encoded = encode(&value);
        // header(3) + "dup"(5) + ref(2) + "other"(7)
        assert_eq!(encoded.len(), 17);
        assert_eq!(&encoded[8..10], &[MARKER_STRING, 0x00]);
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn test_typed_object_sealed_members() {
        let value = AmfValue::typed_object(
            "flex.messaging.messages.RemotingMessage",
            [("operation", AmfValue::from("getUser")), ("body", AmfValue::Array(vec![1.0.into()]))],
        );
        let decoded = decode(&encode(&value)).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_anonymous_object_with_nested_array() {
        let value = AmfValue::object([
            ("name", AmfValue::from("so")),
            ("list", AmfValue::Array(vec![AmfValue::Integer(1), AmfValue::Null])),
        ]);
        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }

    #[test]
    fn test_object_reference() {
        // [obj, ref(obj)] where the array itself is object #0 and obj is #1
        let data = [
            MARKER_ARRAY, 0x05, 0x01, // dense array of 2, no assoc part
            MARKER_OBJECT, 0x0B, 0x01, // dynamic anonymous object
            0x03, b'a', MARKER_TRUE, 0x01, // a = true, end
            MARKER_OBJECT, 0x02, // reference to object #1
        ];
        let decoded = decode(&data).unwrap();
        let items = decoded.as_array().unwrap();
        assert_eq!(items[0], items[1]);
        assert_eq!(items[0].get("a"), Some(&AmfValue::Boolean(true)));
    }

    #[test]
    fn test_externalizable_is_rejected() {
        let data = [MARKER_OBJECT, 0x07, 0x07, b'D', b'S', b'K'];
        assert!(matches!(decode(&data), Err(AmfError::Unsupported(_))));
    }

    #[test]
    fn test_vector_int() {
        let data = [MARKER_VECTOR_INT, 0x05, 0x00, 0, 0, 0, 1, 0xFF, 0xFF, 0xFF, 0xFF];
        let decoded = decode(&data).unwrap();
        assert_eq!(
            decoded,
            AmfValue::Array(vec![AmfValue::Integer(1), AmfValue::Integer(-1)])
        );
    }
}
