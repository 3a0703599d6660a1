//! Record serializers
//!
//! A serializer turns a decoded payload plus its attributes into the bytes
//! the sink stores. Any error marks the message as poison: it is logged and
//! acknowledged, never retried.

use bytes::Bytes;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::SerializerFormat;
use crate::stream::Record;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("{0}")]
    Rejected(String),
}

pub trait Serializer: Send + Sync + 'static {
    fn serialize(
        &self,
        raw: &[u8],
        attributes: &HashMap<String, String>,
    ) -> Result<Record, SerializeError>;
}

impl<F> Serializer for F
where
    F: Fn(&[u8], &HashMap<String, String>) -> Result<Record, SerializeError>
        + Send
        + Sync
        + 'static,
{
    fn serialize(
        &self,
        raw: &[u8],
        attributes: &HashMap<String, String>,
    ) -> Result<Record, SerializeError> {
        self(raw, attributes)
    }
}

pub type SharedSerializer = Arc<dyn Serializer>;

/// Build the serializer selected in configuration
pub fn from_format(format: SerializerFormat) -> SharedSerializer {
    match format {
        SerializerFormat::Raw => Arc::new(raw),
        SerializerFormat::Json => Arc::new(json_with_attributes),
    }
}

/// Store the payload unchanged.
pub fn raw(raw: &[u8], _attributes: &HashMap<String, String>) -> Result<Record, SerializeError> {
    Ok(Bytes::copy_from_slice(raw))
}

/// Parse the payload as a JSON object and merge the message attributes in
/// under `"attributes"`. An `attributes` key already present in the payload
/// is overwritten.
pub fn json_with_attributes(
    raw: &[u8],
    attributes: &HashMap<String, String>,
) -> Result<Record, SerializeError> {
    let mut object = match serde_json::from_slice::<Value>(raw)? {
        Value::Object(object) => object,
        other => return Err(SerializeError::NotAnObject(json_type(&other))),
    };

    if !attributes.is_empty() {
        let attrs: Map<String, Value> = attributes
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        object.insert("attributes".to_string(), Value::Object(attrs));
    }

    Ok(Bytes::from(serde_json::to_vec(&Value::Object(object))?))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
