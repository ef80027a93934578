//! Channel payloads: subscription parameters and typed notification bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Channel;
use crate::error::ClientError;

/// Field of a channel notification that names the resource it concerns.
pub const RESOURCE_ID_FIELD: &str = "resourceId";

/// Parameters of a `subscribe` / `unsubscribe` notification.
///
/// Serialized as `{"method": "<channel>", "scope": {"resourceId": "<id>"}}`;
/// the scope is omitted for channel-wide operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionParams {
    /// Wire name of the channel being (de)activated.
    pub method: &'static str,
    /// Resource the subscription is limited to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
}

/// Resource scope of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    /// Resource identifier.
    pub resource_id: String,
}

impl SubscriptionParams {
    /// Parameters scoped to a single resource.
    #[must_use]
    pub fn scoped(channel: Channel, resource_id: &str) -> Self {
        Self {
            method: channel.as_str(),
            scope: Some(Scope {
                resource_id: resource_id.to_string(),
            }),
        }
    }

    /// Parameters covering the whole channel.
    #[must_use]
    pub const fn channel_only(channel: Channel) -> Self {
        Self {
            method: channel.as_str(),
            scope: None,
        }
    }

    /// Converts to the JSON value sent on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Serialization`] if serialization fails.
    pub fn to_value(&self) -> Result<Value, ClientError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Extracts the resource id from notification params.
#[must_use]
pub fn resource_id_of(params: &Value) -> Option<&str> {
    params.get(RESOURCE_ID_FIELD).and_then(Value::as_str)
}

/// Body of a status-channel notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    /// Resource whose status changed.
    pub resource_id: String,
    /// New status.
    pub status: String,
    /// Previous status, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_status: Option<String>,
    /// Failure description for error transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of a log-channel notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogOutput {
    /// Resource that produced the output.
    pub resource_id: String,
    /// Output text.
    pub text: String,
    /// Originating stream or machine name, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl StatusChange {
    /// Parses status-channel params.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] if required fields are missing.
    pub fn from_params(params: &Value) -> Result<Self, ClientError> {
        Self::deserialize(params).map_err(|e| ClientError::Protocol(e.to_string()))
    }
}

impl LogOutput {
    /// Parses log-channel params.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] if required fields are missing.
    pub fn from_params(params: &Value) -> Result<Self, ClientError> {
        Self::deserialize(params).map_err(|e| ClientError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scoped_params_shape() {
        let Ok(value) = SubscriptionParams::scoped(Channel::Status, "abc").to_value() else {
            panic!("serialization failed");
        };
        assert_eq!(
            value,
            json!({"method": "resource/statusChanged", "scope": {"resourceId": "abc"}})
        );
    }

    #[test]
    fn channel_only_params_omit_scope() {
        let Ok(value) = SubscriptionParams::channel_only(Channel::Log).to_value() else {
            panic!("serialization failed");
        };
        assert_eq!(value, json!({"method": "resource/output"}));
    }

    #[test]
    fn status_change_parses_optional_fields() {
        let params = json!({"resourceId": "r1", "status": "RUNNING", "prevStatus": "STARTING"});
        let Ok(change) = StatusChange::from_params(&params) else {
            panic!("parse failed");
        };
        assert_eq!(change.resource_id, "r1");
        assert_eq!(change.prev_status.as_deref(), Some("STARTING"));
        assert!(change.error.is_none());
        assert_eq!(resource_id_of(&params), Some("r1"));
    }

    #[test]
    fn log_output_requires_text() {
        let params = json!({"resourceId": "r1"});
        assert!(matches!(
            LogOutput::from_params(&params),
            Err(ClientError::Protocol(_))
        ));
    }
}
