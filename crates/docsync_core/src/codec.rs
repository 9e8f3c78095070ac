//! Property-tree encoding.
//!
//! Bodies are stored and sent over the wire as CBOR. An empty body decodes to
//! an empty property tree, which is what deletion tombstones carry.

use crate::document::Properties;
use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a property tree into its body bytes.
pub fn encode_properties(properties: &Properties) -> CoreResult<Vec<u8>> {
    to_cbor(properties)
}

/// Decodes body bytes into a property tree.
pub fn decode_properties(body: &[u8]) -> CoreResult<Properties> {
    if body.is_empty() {
        return Ok(Properties::new());
    }
    from_cbor(body)
}

/// Serializes any value as CBOR.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(CoreError::codec)?;
    Ok(out)
}

/// Deserializes a CBOR value.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::de::from_reader(bytes).map_err(CoreError::codec)
}
