//! # Serializer contract (§4.1)
//!
//! Typed value <-> bytes, tagged with a content-type string. The default
//! implementation uses `serde_json`; other codecs can implement [`Serializer`]
//! without touching the rest of the crate — the contract is the round-trip
//! guarantee (`serialize ∘ deserialize = id`), not the wire mechanism.
//!
//! The trait itself is kept object-safe (its required methods operate on
//! `serde_json::Value`, not a generic `T`) so a `Arc<dyn Serializer>` can be
//! shared across the registry, client, and executor. [`serialize_typed`] and
//! [`deserialize_typed`] are the generic façade callers actually reach for.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::SerializationError;

/// Object-safe value <-> bytes conversion with a content-type tag.
pub trait Serializer: Send + Sync + std::fmt::Debug {
    /// The content-type string this serializer tags its output with
    /// (e.g. `"application/json"`).
    fn content_type(&self) -> &'static str;

    fn serialize_value(&self, value: serde_json::Value) -> Result<Vec<u8>, SerializationError>;

    fn deserialize_value(&self, bytes: &[u8]) -> Result<serde_json::Value, SerializationError>;
}

/// Serializes `value` through `ser`, going by way of `serde_json::Value` so
/// the call works against `&dyn Serializer` as well as any concrete type.
pub fn serialize_typed<T: Serialize>(ser: &dyn Serializer, value: &T) -> Result<Vec<u8>, SerializationError> {
    let value = serde_json::to_value(value).map_err(|e| SerializationError::Encode(e.to_string()))?;
    ser.serialize_value(value)
}

/// Deserializes `T` through `ser`, going by way of `serde_json::Value`.
pub fn deserialize_typed<T: DeserializeOwned>(ser: &dyn Serializer, bytes: &[u8]) -> Result<T, SerializationError> {
    let value = ser.deserialize_value(bytes)?;
    serde_json::from_value(value).map_err(|e| SerializationError::Decode {
        expected: std::any::type_name::<T>(),
        content_type: ser.content_type().to_string(),
        reason: e.to_string(),
    })
}

/// The default JSON serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize_value(&self, value: serde_json::Value) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(&value).map_err(|e| SerializationError::Encode(e.to_string()))
    }

    fn deserialize_value(&self, bytes: &[u8]) -> Result<serde_json::Value, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode {
            expected: "serde_json::Value",
            content_type: self.content_type().to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: i32,
        b: String,
    }

    #[test]
    fn round_trips_a_struct() {
        let ser = JsonSerializer;
        let value = Sample {
            a: 7,
            b: "hi".to_string(),
        };
        let bytes = serialize_typed(&ser, &value).unwrap();
        let back: Sample = deserialize_typed(&ser, &bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn round_trips_through_a_trait_object() {
        let ser: &dyn Serializer = &JsonSerializer;
        let value = Sample {
            a: 1,
            b: "dyn".to_string(),
        };
        let bytes = serialize_typed(ser, &value).unwrap();
        let back: Sample = deserialize_typed(ser, &bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn round_trips_polymorphic_json_value() {
        // "polymorphic payloads (runtime type may differ from declared)" — serde_json::Value
        // round-trips any JSON shape regardless of the statically declared type elsewhere.
        let ser = JsonSerializer;
        let value = serde_json::json!({"kind": "variant_a", "payload": [1, 2, 3]});
        let bytes = serialize_typed(&ser, &value).unwrap();
        let back: serde_json::Value = deserialize_typed(&ser, &bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn decode_failure_reports_expected_type_and_content_type() {
        let ser = JsonSerializer;
        let err = deserialize_typed::<Sample>(&ser, b"not json").unwrap_err();
        match err {
            SerializationError::Decode { content_type, .. } => {
                assert_eq!(content_type, "application/json");
            }
            other => panic!("expected Decode error, got {other:?}"),
        }
    }
}
