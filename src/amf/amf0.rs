//! AMF0 encoder and decoder
//!
//! AMF0 carries every connect handshake and every type 20/18/19 message.
//! Reference: AMF0 File Format Specification (amf0-file-format-specification.pdf)
//!
//! Type Markers:
//! ```text
//! 0x00 - Number (IEEE 754 double)
//! 0x01 - Boolean
//! 0x02 - String (UTF-8, 16-bit length prefix)
//! 0x03 - Object (key-value pairs until 0x000009)
//! 0x05 - Null
//! 0x06 - Undefined
//! 0x07 - Reference (16-bit index)
//! 0x08 - ECMA Array (associative array)
//! 0x09 - Object End (0x000009 sequence)
//! 0x0A - Strict Array (dense array)
//! 0x0B - Date (double + timezone)
//! 0x0C - Long String (UTF-8, 32-bit length prefix)
//! 0x0D - Unsupported
//! 0x0F - XML Document
//! 0x10 - Typed Object (class name + properties)
//! 0x11 - AVM+ (next value is AMF3)
//! ```
//!
//! A value behind the AVM+ marker is decoded by an [`Amf3Decoder`] owned by
//! this decoder, so AMF3 reference tables span all AVM+ values of one message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::amf3::{Amf3Decoder, Amf3Encoder};
use super::value::AmfValue;
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_REFERENCE: u8 = 0x07;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;
const MARKER_UNSUPPORTED: u8 = 0x0D;
const MARKER_XML_DOCUMENT: u8 = 0x0F;
const MARKER_TYPED_OBJECT: u8 = 0x10;
pub(crate) const MARKER_AVMPLUS: u8 = 0x11;

/// Maximum nesting depth for objects/arrays
const MAX_NESTING_DEPTH: usize = 64;

/// AMF0 decoder
#[derive(Default)]
pub struct Amf0Decoder {
    /// Complex values seen so far, addressed by 0x07 references
    references: Vec<AmfValue>,
    /// Decoder for values behind the AVM+ marker
    amf3: Amf3Decoder,
    depth: usize,
}

impl Amf0Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset decoder state (call between messages)
    pub fn reset(&mut self) {
        self.references.clear();
        self.amf3.reset();
        self.depth = 0;
    }

    /// Decode a single AMF0 value from the buffer
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

    /// Decode all values from buffer until exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => {
                if buf.remaining() < 8 {
                    return Err(AmfError::UnexpectedEof);
                }
                Ok(AmfValue::Number(buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                if buf.is_empty() {
                    return Err(AmfError::UnexpectedEof);
                }
                Ok(AmfValue::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => Ok(AmfValue::String(read_utf8(buf)?)),
            MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(buf)?)),
            MARKER_XML_DOCUMENT => Ok(AmfValue::Xml(read_utf8_long(buf)?)),
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED | MARKER_UNSUPPORTED => Ok(AmfValue::Undefined),
            MARKER_REFERENCE => {
                if buf.remaining() < 2 {
                    return Err(AmfError::UnexpectedEof);
                }
                let index = buf.get_u16() as u32;
                self.references
                    .get(index as usize)
                    .cloned()
                    .ok_or(AmfError::InvalidReference(index))
            }
            MARKER_OBJECT => {
                let slot = self.reserve();
                let properties = self.read_properties(buf)?;
                Ok(self.fill(slot, AmfValue::Object(properties)))
            }
            MARKER_TYPED_OBJECT => {
                let class_name = read_utf8(buf)?;
                let slot = self.reserve();
                let properties = self.read_properties(buf)?;
                Ok(self.fill(
                    slot,
                    AmfValue::TypedObject {
                        class_name,
                        properties,
                    },
                ))
            }
            MARKER_ECMA_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(AmfError::UnexpectedEof);
                }
                // Count hint, not reliable
                let _count = buf.get_u32();
                let slot = self.reserve();
                let properties = self.read_properties(buf)?;
                Ok(self.fill(slot, AmfValue::EcmaArray(properties)))
            }
            MARKER_STRICT_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(AmfError::UnexpectedEof);
                }
                let count = buf.get_u32() as usize;
                let slot = self.reserve();
                let mut elements = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    elements.push(self.decode(buf)?);
                }
                Ok(self.fill(slot, AmfValue::Array(elements)))
            }
            MARKER_DATE => {
                if buf.remaining() < 10 {
                    return Err(AmfError::UnexpectedEof);
                }
                let timestamp = buf.get_f64();
                let _timezone = buf.get_i16();
                Ok(AmfValue::Date(timestamp))
            }
            MARKER_AVMPLUS => self.amf3.decode(buf),
            _ => Err(AmfError::UnknownMarker(marker)),
        }
    }

    fn reserve(&mut self) -> usize {
        self.references.push(AmfValue::Null);
        self.references.len() - 1
    }

    fn fill(&mut self, slot: usize, value: AmfValue) -> AmfValue {
        self.references[slot] = value.clone();
        value
    }

    /// Read `key value` pairs up to the empty-key + 0x09 terminator
    fn read_properties(
        &mut self,
        buf: &mut Bytes,
    ) -> Result<HashMap<String, AmfValue>, AmfError> {
        let mut properties = HashMap::new();
        loop {
            let key = read_utf8(buf)?;
            if key.is_empty() {
                if buf.is_empty() {
                    return Err(AmfError::UnexpectedEof);
                }
                if buf.get_u8() != MARKER_OBJECT_END {
                    return Err(AmfError::InvalidObjectEnd);
                }
                return Ok(properties);
            }
            let value = self.decode(buf)?;
            properties.insert(key, value);
        }
    }
}

/// Read UTF-8 string with 16-bit length prefix
fn read_utf8(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 2 {
        return Err(AmfError::UnexpectedEof);
    }
    let len = buf.get_u16() as usize;
    read_bytes_utf8(buf, len)
}

/// Read UTF-8 string with 32-bit length prefix
fn read_utf8_long(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 4 {
        return Err(AmfError::UnexpectedEof);
    }
    let len = buf.get_u32() as usize;
    read_bytes_utf8(buf, len)
}

fn read_bytes_utf8(buf: &mut Bytes, len: usize) -> Result<String, AmfError> {
    if buf.remaining() < len {
        return Err(AmfError::UnexpectedEof);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// AMF0 encoder
pub struct Amf0Encoder {
    buf: BytesMut,
    /// Wraps every value in AVM+ so the receiver decodes it as AMF3
    avmplus: bool,
}

impl Amf0Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            avmplus: false,
        }
    }

    /// Encoder that writes each top-level value as AVM+ (0x11) followed by AMF3
    ///
    /// Used for the arguments of AMF3-encoded invocations.
    pub fn avmplus() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            avmplus: true,
        }
    }

    /// Get the encoded bytes and reset encoder
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Encode a single top-level value
    pub fn encode(&mut self, value: &AmfValue) {
        if self.avmplus {
            self.encode_avmplus(value);
        } else {
            self.encode_value(value);
        }
    }

    /// Encode multiple values
    pub fn encode_all(&mut self, values: &[AmfValue]) {
        for value in values {
            self.encode(value);
        }
    }

    /// Write AVM+ marker followed by the AMF3 form of `value`
    pub fn encode_avmplus(&mut self, value: &AmfValue) {
        let mut amf3 = Amf3Encoder::new();
        amf3.encode(value);
        self.buf.put_u8(MARKER_AVMPLUS);
        self.buf.put_slice(&amf3.finish());
    }

    fn encode_value(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Null => self.buf.put_u8(MARKER_NULL),
            AmfValue::Undefined => self.buf.put_u8(MARKER_UNDEFINED),
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(u8::from(*b));
            }
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::Integer(i) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*i as f64);
            }
            AmfValue::String(s) => {
                if s.len() > 0xFFFF {
                    self.buf.put_u8(MARKER_LONG_STRING);
                    self.buf.put_u32(s.len() as u32);
                } else {
                    self.buf.put_u8(MARKER_STRING);
                    self.buf.put_u16(s.len() as u16);
                }
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::Object(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.write_properties(props);
            }
            AmfValue::EcmaArray(props) => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(props.len() as u32);
                self.write_properties(props);
            }
            AmfValue::TypedObject {
                class_name,
                properties,
            } => {
                self.buf.put_u8(MARKER_TYPED_OBJECT);
                self.write_utf8(class_name);
                self.write_properties(properties);
            }
            AmfValue::Array(elements) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(elements.len() as u32);
                for elem in elements {
                    self.encode_value(elem);
                }
            }
            AmfValue::Date(timestamp) => {
                self.buf.put_u8(MARKER_DATE);
                self.buf.put_f64(*timestamp);
                self.buf.put_i16(0);
            }
            AmfValue::Xml(s) => {
                self.buf.put_u8(MARKER_XML_DOCUMENT);
                self.buf.put_u32(s.len() as u32);
                self.buf.put_slice(s.as_bytes());
            }
            // No AMF0 form exists
            AmfValue::ByteArray(_) => self.encode_avmplus(value),
        }
    }

    fn write_properties(&mut self, props: &HashMap<String, AmfValue>) {
        for (key, val) in props {
            self.write_utf8(key);
            self.encode_value(val);
        }
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }

    /// Write UTF-8 string with 16-bit length prefix (no type marker)
    fn write_utf8(&mut self, s: &str) {
        let len = s.len().min(0xFFFF);
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&s.as_bytes()[..len]);
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience function to encode a single value
pub fn encode(value: &AmfValue) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode(value);
    encoder.finish()
}

/// Convenience function to encode multiple values
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values);
    encoder.finish()
}

/// Convenience function to decode a single value
pub fn decode(data: &[u8]) -> Result<AmfValue, AmfError> {
    let mut decoder = Amf0Decoder::new();
    let mut buf = Bytes::copy_from_slice(data);
    decoder.decode(&mut buf)
}

/// Convenience function to decode all values
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut decoder = Amf0Decoder::new();
    let mut buf = Bytes::copy_from_slice(data);
    decoder.decode_all(&mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_values() {
        let values = vec![
            AmfValue::String("_result".into()),
            AmfValue::Number(1.0),
            AmfValue::Null,
            AmfValue::object([("code", "NetConnection.Connect.Success")]),
        ];
        let decoded = decode_all(&encode_all(&values)).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_typed_object() {
        let value = AmfValue::typed_object("DSK", [("clientId", "abc")]);
        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }

    #[test]
    fn test_long_string() {
        let long_str = "x".repeat(70000);
        let encoded = encode(&AmfValue::String(long_str.clone()));
        assert_eq!(encoded[0], MARKER_LONG_STRING);
        assert_eq!(decode(&encoded).unwrap(), AmfValue::String(long_str));
    }

    #[test]
    fn test_reference() {
        // [obj, ref 1]: array is reference 0, obj is reference 1
        let mut data = vec![MARKER_STRICT_ARRAY, 0, 0, 0, 2, MARKER_OBJECT];
        data.extend_from_slice(&[0, 1, b'k', MARKER_BOOLEAN, 1, 0, 0, MARKER_OBJECT_END]);
        data.extend_from_slice(&[MARKER_REFERENCE, 0, 1]);
        let decoded = decode(&data).unwrap();
        let items = decoded.as_array().unwrap();
        assert_eq!(items[0], items[1]);

        let bad = [MARKER_REFERENCE, 0, 9];
        assert_eq!(decode(&bad), Err(AmfError::InvalidReference(9)));
    }

    #[test]
    fn test_missing_object_end_is_an_error() {
        let data = [MARKER_OBJECT, 0, 0, 0x42];
        assert_eq!(decode(&data), Err(AmfError::InvalidObjectEnd));
    }

    #[test]
    fn test_avmplus_switch() {
        let value = AmfValue::typed_object(
            "flex.messaging.messages.AcknowledgeMessage",
            [("body", AmfValue::Integer(7))],
        );
        let mut encoder = Amf0Encoder::avmplus();
        encoder.encode(&AmfValue::String("ok".into()));
        encoder.encode(&value);
        let bytes = encoder.finish();
        assert_eq!(bytes[0], MARKER_AVMPLUS);

        let decoded = decode_all(&bytes).unwrap();
        assert_eq!(decoded, vec![AmfValue::String("ok".into()), value]);
    }

    #[test]
    fn test_byte_array_goes_through_avmplus() {
        let value = AmfValue::ByteArray(vec![1, 2, 3]);
        let encoded = encode(&value);
        assert_eq!(encoded[0], MARKER_AVMPLUS);
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn test_unknown_marker() {
        assert_eq!(decode(&[0x42]), Err(AmfError::UnknownMarker(0x42)));
    }
}
