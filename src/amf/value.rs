//! AMF value types
//!
//! AMF0 and AMF3 decode into the same value tree. The session engine only
//! looks inside a handful of well-known shapes (status objects, Flex
//! acknowledgement wrappers); everything else is passed through untouched.

use std::collections::HashMap;

/// Unified AMF value representation
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AmfValue {
    /// Null value (AMF0: 0x05, AMF3: 0x01)
    #[default]
    Null,

    /// Undefined value (AMF0: 0x06, AMF3: 0x00)
    Undefined,

    /// Boolean value (AMF0: 0x01, AMF3: 0x02/0x03)
    Boolean(bool),

    /// IEEE 754 double-precision floating point (AMF0: 0x00, AMF3: 0x05)
    Number(f64),

    /// UTF-8 string (AMF0: 0x02/0x0C, AMF3: 0x06)
    String(String),

    /// Dense array (AMF0 strict array, AMF3 array without associative part,
    /// AMF3 vectors)
    Array(Vec<AmfValue>),

    /// Anonymous key-value object (AMF0: 0x03, AMF3: 0x0A with empty class)
    Object(HashMap<String, AmfValue>),

    /// Object with a registered class name
    TypedObject {
        class_name: String,
        properties: HashMap<String, AmfValue>,
    },

    /// Date value as milliseconds since Unix epoch
    Date(f64),

    /// XML document
    Xml(String),

    /// Raw byte array (AMF3 only: 0x0C)
    ByteArray(Vec<u8>),

    /// Integer (AMF3 only: 0x04, 29-bit signed)
    Integer(i32),

    /// Associative array (AMF0 ECMA array, AMF3 array with associative part)
    EcmaArray(HashMap<String, AmfValue>),
}

impl AmfValue {
    /// Build an anonymous object from key/value pairs
    pub fn object<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<AmfValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        AmfValue::Object(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build a typed object from key/value pairs
    pub fn typed_object<K, V, I>(class_name: impl Into<String>, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<AmfValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        AmfValue::TypedObject {
            class_name: class_name.into(),
            properties: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Try to get this value as a string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            AmfValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get this value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get this value as an object reference
    pub fn as_object(&self) -> Option<&HashMap<String, AmfValue>> {
        match self {
            AmfValue::Object(m) => Some(m),
            AmfValue::EcmaArray(m) => Some(m),
            AmfValue::TypedObject { properties, .. } => Some(properties),
            _ => None,
        }
    }

    /// Try to get this value as an array reference
    pub fn as_array(&self) -> Option<&Vec<AmfValue>> {
        match self {
            AmfValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Class name of a typed object
    pub fn class_name(&self) -> Option<&str> {
        match self {
            AmfValue::TypedObject { class_name, .. } => Some(class_name),
            _ => None,
        }
    }

    /// Check if this value is null or undefined
    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, AmfValue::Null | AmfValue::Undefined)
    }

    /// Get a property from an object value
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_object()?.get(key)
    }

    /// Get a string property from an object value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Get a number property from an object value
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<f64> for AmfValue {
    fn from(v: f64) -> Self {
        AmfValue::Number(v)
    }
}

impl From<i32> for AmfValue {
    fn from(v: i32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<u32> for AmfValue {
    fn from(v: u32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

impl<V: Into<AmfValue>> From<Option<V>> for AmfValue {
    fn from(v: Option<V>) -> Self {
        v.map(Into::into).unwrap_or(AmfValue::Null)
    }
}

impl<V: Into<AmfValue>> From<Vec<V>> for AmfValue {
    fn from(v: Vec<V>) -> Self {
        AmfValue::Array(v.into_iter().map(|x| x.into()).collect())
    }
}

impl<V: Into<AmfValue>> From<HashMap<String, V>> for AmfValue {
    fn from(v: HashMap<String, V>) -> Self {
        AmfValue::Object(v.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_accessors() {
        let s = AmfValue::String("test".into());
        assert_eq!(s.as_str(), Some("test"));
        assert_eq!(s.as_number(), None);

        let n = AmfValue::Integer(42);
        assert_eq!(n.as_number(), Some(42.0));

        let o = AmfValue::object([("key", "value")]);
        assert_eq!(o.get_string("key"), Some("value"));
        assert_eq!(o.class_name(), None);
    }

    #[test]
    fn test_typed_object_behaves_like_object() {
        let t = AmfValue::typed_object("flex.messaging.messages.AcknowledgeMessage", [("body", 5.0)]);
        assert_eq!(t.class_name(), Some("flex.messaging.messages.AcknowledgeMessage"));
        assert_eq!(t.get_number("body"), Some(5.0));
    }

    #[test]
    fn test_option_conversion() {
        let none: Option<&str> = None;
        assert_eq!(AmfValue::from(none), AmfValue::Null);
        assert_eq!(AmfValue::from(Some("x")), AmfValue::String("x".into()));
    }
}
