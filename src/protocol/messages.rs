//! JSON-RPC 2.0 envelopes: requests, notifications, responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClientError;

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Client → Server request expecting a correlated response.
#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    /// Protocol version (always `"2.0"`).
    pub jsonrpc: &'static str,
    /// Correlation id, unique per correlator.
    pub id: &'a str,
    /// Method name.
    pub method: &'a str,
    /// Optional parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> Request<'a> {
    /// Builds a request envelope.
    #[must_use]
    pub const fn new(id: &'a str, method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION,
            id,
            method,
            params,
        }
    }
}

/// Client → Server fire-and-forget notification (no id).
#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a> {
    /// Protocol version (always `"2.0"`).
    pub jsonrpc: &'static str,
    /// Method name.
    pub method: &'a str,
    /// Optional parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> Notification<'a> {
    /// Builds a notification envelope.
    #[must_use]
    pub const fn new(method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION,
            method,
            params,
        }
    }
}

/// Error object carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcErrorObject> for ClientError {
    fn from(err: RpcErrorObject) -> Self {
        Self::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Any Server → Client message.
///
/// Responses carry `id` plus `result` or `error`; notifications carry
/// `method` and `params`. All fields are optional so that every
/// well-formed JSON object parses and classification happens afterwards.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inbound {
    /// Correlation id, if this is a response.
    #[serde(default, deserialize_with = "deserialize_id")]
    pub id: Option<String>,
    /// Method name, if this is a notification.
    #[serde(default)]
    pub method: Option<String>,
    /// Notification parameters.
    #[serde(default)]
    pub params: Option<Value>,
    /// Success payload.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error payload.
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

impl Inbound {
    /// Parses a raw text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] if the frame is not a JSON object
    /// matching the envelope shape.
    pub fn parse(text: &str) -> Result<Self, ClientError> {
        serde_json::from_str(text).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    /// Turns a response into the outcome delivered to the pending caller.
    ///
    /// A response with neither `result` nor `error` counts as a success
    /// carrying `null`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Rpc`] when the response carries an `error`.
    pub fn into_outcome(self) -> Result<Value, ClientError> {
        match self.error {
            Some(err) => Err(err.into()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Accepts ids sent either as strings or as numbers.
fn deserialize_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
