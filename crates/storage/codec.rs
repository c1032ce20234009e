//! Key encodings and the value codec boundary (spec §9 "Dynamic typing of
//! values"). Encodings describe how a primary or secondary key is turned
//! into the ordered byte strings the B+ tree and the persistent backend
//! compare; the [`Codec`] trait describes how a user's structured [`Value`]
//! is turned into the opaque bytes a store actually persists. The codec
//! itself is an external collaborator per spec §1 -- this module only
//! defines the seam and a JSON-backed default.

use crate::error::{Error, Result};
use crate::value::Value;

/// `keyEncoding` option from spec §6.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Binary,
    String,
    Number,
    Boolean,
}

impl Encoding {
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        match (self, value) {
            (Encoding::Binary, Value::Bytes(b)) => Ok(b.clone()),
            (Encoding::String, Value::Str(s)) => Ok(s.clone().into_bytes()),
            (Encoding::Number, Value::Number(n)) => Ok(n.to_be_bytes().to_vec()),
            (Encoding::Boolean, Value::Bool(b)) => Ok(vec![if *b { 1 } else { 0 }]),
            _ => Err(Error::Custom(format!(
                "value does not match declared encoding {self:?}"
            ))),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        match self {
            Encoding::Binary => Ok(Value::Bytes(bytes.to_vec())),
            Encoding::String => String::from_utf8(bytes.to_vec())
                .map(Value::Str)
                .map_err(|e| Error::Custom(e.to_string())),
            Encoding::Number => {
                let arr: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| Error::Custom("number encoding requires 8 bytes".into()))?;
                Ok(Value::Number(f64::from_be_bytes(arr)))
            }
            Encoding::Boolean => Ok(Value::Bool(bytes.first().copied().unwrap_or(0) != 0)),
        }
    }
}

/// Converts between a structured [`Value`] and the opaque bytes a store
/// persists. `createObjectStore`'s `codec?` option selects one of these.
pub trait Codec: Send + Sync + std::fmt::Debug {
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Default codec: values round-trip through JSON. Reasonable for a store
/// whose callers don't supply their own binary format.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(&JsonValue::from(value)).map_err(|e| Error::Custom(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let jv: JsonValue = serde_json::from_slice(bytes).map_err(|e| Error::Custom(e.to_string()))?;
        Ok(jv.into())
    }
}

// A thin serde-friendly mirror of `Value`, since `Value` itself carries raw
// byte buffers that don't map onto JSON's type system directly.
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
enum JsonValue {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Bytes { bytes: Vec<u8> },
    Array(Vec<JsonValue>),
    Object(std::collections::BTreeMap<String, JsonValue>),
}

impl From<&Value> for JsonValue {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => JsonValue::Number(*n),
            Value::Str(s) => JsonValue::Str(s.clone()),
            Value::Bytes(b) => JsonValue::Bytes { bytes: b.clone() },
            Value::Array(items) => JsonValue::Array(items.iter().map(JsonValue::from).collect()),
            Value::Object(map) => {
                JsonValue::Object(map.iter().map(|(k, v)| (k.clone(), JsonValue::from(v))).collect())
            }
        }
    }
}

impl From<JsonValue> for Value {
    fn from(v: JsonValue) -> Self {
        match v {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => Value::Number(n),
            JsonValue::Str(s) => Value::Str(s),
            JsonValue::Bytes { bytes } => Value::Bytes(bytes),
            JsonValue::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_round_trips_nested_values() {
        let codec = JsonCodec;
        let value = Value::Object(
            [(
                "tags".to_string(),
                Value::Array(vec![Value::Str("a".into()), Value::Number(2.0)]),
            )]
            .into_iter()
            .collect(),
        );
        let bytes = codec.encode(&value).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn number_encoding_round_trips() {
        let enc = Encoding::Number;
        let bytes = enc.encode(&Value::Number(42.5)).unwrap();
        assert_eq!(enc.decode(&bytes).unwrap(), Value::Number(42.5));
    }
}
