//! Type-directed codec for wire payloads.
//!
//! Values travel as a self-describing JSON tree (strings, numbers, booleans,
//! null, arrays, maps). The payload never embeds type information: the
//! recipient's declared type drives reconstruction, so a handler's parameter
//! type decides how the bytes come back to life. Polymorphic decoding is
//! deliberately absent; callers that need it put an explicit "kind" field in
//! their records.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{BusError, Result};

/// Encode a value into its wire form.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| BusError::Encode(e.to_string()))
}

/// Reconstruct a value of the declared type `T` from its wire form.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| BusError::Decode {
        target: std::any::type_name::<T>(),
        detail: e.to_string(),
    })
}

/// Encode a value into an in-memory tree, for envelopes that nest
/// caller-typed data (RPC argument tuples and results).
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| BusError::Encode(e.to_string()))
}

/// Reconstruct a value of the declared type `T` from an in-memory tree.
pub fn decode_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| BusError::Decode {
        target: std::any::type_name::<T>(),
        detail: e.to_string(),
    })
}
