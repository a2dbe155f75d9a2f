//! # Dynamic Value and Codecs
//!
//! Purpose: Offer a language-neutral dynamic value plus the pluggable
//! [`ValueCodec`] registry that translates it to and from wire bytes.
//! Values move as raw bytes on the wire; codecs translate between that and
//! an application-level shape at the edges. Buffer-reuse in the
//! identity/text paths and a small closed set of built-ins, rather than an
//! open-ended plugin system, keep that edge cheap and predictable.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A language-neutral structured value, used as the in-memory shape that
/// [`ValueCodec`] implementations encode to and decode from bytes.
///
/// `Map` is serialized as an ordered sequence of `(key, value)` pairs rather
/// than a native map, so that JSON (string-keyed objects only) and MsgPack
/// (native maps) share one encoding and round-trip identically regardless of
/// key type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Convenience constructor for a string-keyed map, the common case for
    /// `play_script` parameters and `misc` results.
    pub fn from_str_map(entries: HashMap<String, Value>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Str(k), v))
                .collect(),
        )
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut seq = serializer.serialize_seq(Some(entries.len()))?;
                for (k, v) in entries {
                    seq.serialize_element(&(k, v))?;
                }
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a KT/TT-compatible scalar, string, byte string, or sequence")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        Ok(Value::Int(v as i64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::Str(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::Str(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<Value, E> {
        Ok(Value::Bytes(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element::<Value>()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Value, A::Error> {
        let mut entries = Vec::new();
        while let Some((k, v)) = map.next_entry::<Value, Value>()? {
            entries.push((k, v));
        }
        Ok(Value::Map(entries))
    }
}

/// Encode/decode pair used by engine operations to translate between
/// application-level [`Value`]s and wire bytes.
///
/// Object-safe by design so an engine can hold `Box<dyn ValueCodec>` without
/// becoming generic.
pub trait ValueCodec: Send + Sync {
    /// Serializes `value` to bytes suitable for a KT/TT value field.
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
    /// Deserializes bytes read from a KT/TT value field back into a [`Value`].
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Pass-through codec: `encode`/`decode` only accept `Value::Bytes`/produce it.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl ValueCodec for IdentityCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Str(s) => Ok(s.clone().into_bytes()),
            other => Err(Error::BadArgument(format!(
                "identity codec cannot encode {other:?}"
            ))),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        Ok(Value::Bytes(bytes.to_vec()))
    }
}

/// UTF-8 text codec: strings encode as their UTF-8 bytes; byte values pass
/// through unencoded; decoding always UTF-8-decodes to `Value::Str`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl ValueCodec for TextCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        match value {
            Value::Str(s) => Ok(s.clone().into_bytes()),
            Value::Bytes(b) => Ok(b.clone()),
            other => Err(Error::BadArgument(format!(
                "text codec cannot encode {other:?}"
            ))),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        String::from_utf8(bytes.to_vec())
            .map(Value::Str)
            .map_err(|e| Error::Protocol(format!("invalid utf-8 value: {e}")))
    }
}

/// Canonical-JSON codec backed by `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::BadArgument(format!("json encode: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| Error::Protocol(format!("invalid json value: {e}")))
    }
}

/// MsgPack codec backed by `rmp-serde`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackCodec;

impl ValueCodec for MsgPackCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        rmp_serde::to_vec(value).map_err(|e| Error::BadArgument(format!("msgpack encode: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Protocol(format!("invalid msgpack value: {e}")))
    }
}

/// Opaque structured-object codec. Uses the same MsgPack wire shape as
/// [`MsgPackCodec`] — MsgPack already gives a round-trip-guaranteed,
/// language-neutral object blob, without inventing a second binary format.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpaqueCodec;

impl ValueCodec for OpaqueCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        MsgPackCodec.encode(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        MsgPackCodec.decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_value() -> Value {
        Value::Map(vec![(
            Value::Str("a".into()),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        )])
    }

    #[test]
    fn identity_roundtrip() {
        let codec = IdentityCodec;
        let value = Value::Bytes(vec![1, 2, 3, 0, 255]);
        let encoded = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), value);
    }

    #[test]
    fn text_roundtrip() {
        let codec = TextCodec;
        let value = Value::Str("hello world".into());
        let encoded = codec.encode(&value).unwrap();
        assert_eq!(encoded, b"hello world");
        assert_eq!(codec.decode(&encoded).unwrap(), value);
    }

    #[test]
    fn text_rejects_invalid_utf8() {
        let codec = TextCodec;
        assert!(codec.decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn json_roundtrip_structured_value() {
        let codec = JsonCodec;
        let value = sample_value();
        let encoded = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), value);
    }

    #[test]
    fn msgpack_roundtrip_structured_value() {
        let codec = MsgPackCodec;
        let value = sample_value();
        let encoded = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), value);
    }

    #[test]
    fn opaque_roundtrip_matches_msgpack_wire_shape() {
        let value = sample_value();
        let opaque_bytes = OpaqueCodec.encode(&value).unwrap();
        assert_eq!(MsgPackCodec.decode(&opaque_bytes).unwrap(), value);
    }

    #[test]
    fn all_codecs_roundtrip_scalars() {
        let scalars = [
            Value::Null,
            Value::Bool(true),
            Value::Int(-42),
            Value::Float(3.5),
            Value::Str("s".into()),
        ];
        for value in scalars {
            let json = JsonCodec.encode(&value).unwrap();
            assert_eq!(JsonCodec.decode(&json).unwrap(), value);
            let msgpack = MsgPackCodec.encode(&value).unwrap();
            assert_eq!(MsgPackCodec.decode(&msgpack).unwrap(), value);
        }
    }

    #[test]
    fn from_str_map_builds_map_value() {
        let mut entries = HashMap::new();
        entries.insert("k".to_string(), Value::Int(1));
        let value = Value::from_str_map(entries);
        match value {
            Value::Map(pairs) => {
                assert_eq!(pairs, vec![(Value::Str("k".into()), Value::Int(1))]);
            }
            other => panic!("expected Map, got {other:?}"),
        }
    }
}
