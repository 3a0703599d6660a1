//! Push endpoint
//!
//! Accepts one wrapped message per request and hands its serialized payload
//! to the stream writer. Status codes tell the producer what to do next:
//! 200 means never redeliver (accepted, or poison and dropped), 400 means
//! the request itself is malformed, 503 means try again later.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::{prelude::BASE64_STANDARD, Engine};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::AppState;
use crate::gate::GateError;

/// Bytes of an undecodable payload kept in the poison-message log line
const POISON_PREVIEW_BYTES: usize = 64;

#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Base64-encoded payload
    #[serde(default)]
    pub data: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub publish_time: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("busy")]
    Busy(#[from] GateError),
    #[error("invalid request body: {0}")]
    BadRequest(String),
    #[error("enqueue failed; {0}")]
    Unavailable(String),
}

impl IntoResponse for PushError {
    fn into_response(self) -> Response {
        let status = match self {
            PushError::Busy(_) | PushError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PushError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// Handler for `POST /` and `POST /push`.
///
/// The admission slot is held until the handler returns, whichever way it
/// returns. Nothing is read from the body before a slot is granted.
pub async fn push_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<StatusCode, PushError> {
    let _slot = state
        .gate
        .acquire(state.config.acquire_timeout())
        .await
        .map_err(|err| {
            debug!("Rejecting push: {}", err);
            PushError::from(err)
        })?;

    let body = axum::body::to_bytes(request.into_body(), state.config.max_body_bytes)
        .await
        .map_err(|err| PushError::BadRequest(err.to_string()))?;
    let PushEnvelope {
        message,
        subscription,
    } = serde_json::from_slice(&body).map_err(|err| PushError::BadRequest(err.to_string()))?;

    // Poison messages are acknowledged: redelivery can never fix them
    let raw = match BASE64_STANDARD.decode(message.data.as_bytes()) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(
                message_id = %message.message_id,
                subscription = %subscription,
                publish_time = %message.publish_time,
                payload = %preview(message.data.as_bytes()),
                "Poison message (invalid base64): {}",
                err
            );
            return Ok(StatusCode::OK);
        }
    };

    let record = match state.serializer.serialize(&raw, &message.attributes) {
        Ok(record) => record,
        Err(err) => {
            warn!(
                message_id = %message.message_id,
                subscription = %subscription,
                publish_time = %message.publish_time,
                payload = %preview(&raw),
                "Poison message (serialization failed): {}",
                err
            );
            return Ok(StatusCode::OK);
        }
    };

    let enqueue_timeout = state.config.enqueue_timeout();
    match tokio::time::timeout(enqueue_timeout, state.stream.append(record)).await {
        Ok(Ok(())) => Ok(StatusCode::OK),
        Ok(Err(err)) => {
            debug!("Enqueue of message {} failed: {}", message.message_id, err);
            Err(PushError::Unavailable(err.to_string()))
        }
        Err(_) => {
            debug!(
                "Enqueue of message {} timed out after {:?}",
                message.message_id, enqueue_timeout
            );
            Err(PushError::Unavailable(format!(
                "timed out after {:?}",
                enqueue_timeout
            )))
        }
    }
}

fn preview(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(POISON_PREVIEW_BYTES)])
}
