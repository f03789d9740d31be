use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::TransportError;
use crate::transport::{Envelope, HEADER_KIND};

/// Serializes `value` as the JSON body of a new envelope tagged with `kind`.
pub fn encode<T: Serialize>(kind: &str, value: &T) -> Result<Envelope, TransportError> {
    let body = serde_json::to_vec(value).map_err(|e| TransportError::Encode(e.to_string()))?;
    Ok(Envelope::new(body).with_header(HEADER_KIND, kind))
}

pub fn decode<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, TransportError> {
    serde_json::from_slice(&envelope.body).map_err(|e| TransportError::Decode(e.to_string()))
}
