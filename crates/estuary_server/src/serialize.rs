//! Payload serializer plug point.
//!
//! The core treats payloads opaquely: a typed value crosses the seam as a
//! `serde_json::Value`, and the serializer decides the byte representation.
//! The shipped implementation renders JSON; an alternative format (msgpack,
//! CBOR) implements the same two hooks. Handlers that declare a raw-bytes
//! argument bypass this seam entirely.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ServerError;

/// Converts between payload bytes and the interchange value.
pub trait Serializer: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn marshal(&self, value: &serde_json::Value) -> Result<Vec<u8>, ServerError>;

    fn unmarshal(&self, data: &[u8]) -> Result<serde_json::Value, ServerError>;
}

/// The default serializer: payloads are UTF-8 JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn marshal(&self, value: &serde_json::Value) -> Result<Vec<u8>, ServerError> {
        serde_json::to_vec(value).map_err(|e| ServerError::Serialize(e.to_string()))
    }

    fn unmarshal(&self, data: &[u8]) -> Result<serde_json::Value, ServerError> {
        serde_json::from_slice(data).map_err(|e| ServerError::Deserialize(e.to_string()))
    }
}

/// Marshal a typed value through the node serializer.
pub fn marshal<T: Serialize>(serializer: &dyn Serializer, value: &T) -> Result<Vec<u8>, ServerError> {
    let value = serde_json::to_value(value).map_err(|e| ServerError::Serialize(e.to_string()))?;
    serializer.marshal(&value)
}

/// Unmarshal payload bytes into a typed value through the node serializer.
pub fn unmarshal<T: DeserializeOwned>(serializer: &dyn Serializer, data: &[u8]) -> Result<T, ServerError> {
    let value = serializer.unmarshal(data)?;
    serde_json::from_value(value).map_err(|e| ServerError::Deserialize(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        content: String,
    }

    #[test]
    fn typed_round_trip() {
        let s = JsonSerializer;
        let bytes = marshal(&s, &Ping { content: "hi".into() }).unwrap();
        let back: Ping = unmarshal(&s, &bytes).unwrap();
        assert_eq!(back.content, "hi");
    }

    #[test]
    fn unmarshal_garbage_fails() {
        let s = JsonSerializer;
        let err = unmarshal::<Ping>(&s, b"\xff\xfe").unwrap_err();
        assert!(matches!(err, ServerError::Deserialize(_)));
    }

    #[test]
    fn type_mismatch_fails() {
        let s = JsonSerializer;
        let bytes = marshal(&s, &serde_json::json!({"other": 1})).unwrap();
        assert!(unmarshal::<Ping>(&s, &bytes).is_err());
    }
}
