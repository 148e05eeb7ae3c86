//! Value serializers used by collections.
//!
//! A [`Serializer`] turns a value into bytes and back. Collections store
//! their whole item list through one, so the serializer sees `Vec<T>`.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts values of `T` to and from bytes.
///
/// # Example
///
/// ```rust
/// use vellum_core::{JsonSerializer, Serializer};
///
/// let serializer = JsonSerializer::new();
/// let bytes = serializer.serialize(&vec!["a".to_string()]).unwrap();
/// let back: Vec<String> = serializer.deserialize(&bytes).unwrap();
/// assert_eq!(back, vec!["a".to_string()]);
/// ```
pub trait Serializer<T>: Send + Sync {
    /// Encodes `value`.
    fn serialize(&self, value: &T) -> CoreResult<Vec<u8>>;

    /// Decodes a value from `bytes`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `bytes` is not a valid encoding.
    fn deserialize(&self, bytes: &[u8]) -> CoreResult<T>;
}

/// JSON encoding via `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl JsonSerializer {
    /// Creates a JSON serializer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl<T> Serializer<T> for JsonSerializer
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CoreError::serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> CoreResult<T> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::serialization(e.to_string()))
    }
}

/// Compact binary encoding via CBOR.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborSerializer;

impl CborSerializer {
    /// Creates a CBOR serializer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl<T> Serializer<T> for CborSerializer
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| CoreError::serialization(e.to_string()))?;
        Ok(buf)
    }

    fn deserialize(&self, bytes: &[u8]) -> CoreResult<T> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::serialization(e.to_string()))
    }
}
