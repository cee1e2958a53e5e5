//! Wire definitions for the pilot control socket.
//!
//! Every frame is a JSON text message. Outbound frames carry the full
//! `{eventType, userId, sessionId, timestamp, data}` envelope; inbound frames
//! only need `{eventType, data}`. The `data` member is decoded exactly once,
//! here, into a payload type chosen by the event type.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod keys;

pub use keys::{normalize_username, ScreenshotKey, SCREENSHOT_DIR};

/// Upper bound on the number of local keys a single sync request may carry.
pub const MAX_SYNC_KEYS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "COMMAND_SELECT")]
    CommandSelect,
    #[serde(rename = "COMMAND_DELETE")]
    CommandDelete,
    #[serde(rename = "COMMAND_MOVE")]
    CommandMove,
    #[serde(rename = "COMMAND_ROTATE")]
    CommandRotate,
    #[serde(rename = "COMMAND_SET")]
    CommandSet,
    #[serde(rename = "S3_UPLOAD_REQUEST")]
    UploadRequest,
    #[serde(rename = "S3_DELETE_REQUEST")]
    DeleteRequest,
    #[serde(rename = "S3_SYNC_REQUEST")]
    SyncRequest,
    #[serde(rename = "S3_UPLOAD_RESPONSE")]
    UploadResponse,
    #[serde(rename = "S3_DELETE_RESPONSE")]
    DeleteResponse,
    #[serde(rename = "S3_SYNC_RESPONSE")]
    SyncResponse,
    #[serde(rename = "S3_ERROR")]
    TransferError,
    #[serde(rename = "ping")]
    Ping,
}

impl EventType {
    pub const ALL: [EventType; 13] = [
        EventType::CommandSelect,
        EventType::CommandDelete,
        EventType::CommandMove,
        EventType::CommandRotate,
        EventType::CommandSet,
        EventType::UploadRequest,
        EventType::DeleteRequest,
        EventType::SyncRequest,
        EventType::UploadResponse,
        EventType::DeleteResponse,
        EventType::SyncResponse,
        EventType::TransferError,
        EventType::Ping,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::CommandSelect => "COMMAND_SELECT",
            EventType::CommandDelete => "COMMAND_DELETE",
            EventType::CommandMove => "COMMAND_MOVE",
            EventType::CommandRotate => "COMMAND_ROTATE",
            EventType::CommandSet => "COMMAND_SET",
            EventType::UploadRequest => "S3_UPLOAD_REQUEST",
            EventType::DeleteRequest => "S3_DELETE_REQUEST",
            EventType::SyncRequest => "S3_SYNC_REQUEST",
            EventType::UploadResponse => "S3_UPLOAD_RESPONSE",
            EventType::DeleteResponse => "S3_DELETE_RESPONSE",
            EventType::SyncResponse => "S3_SYNC_RESPONSE",
            EventType::TransferError => "S3_ERROR",
            EventType::Ping => "ping",
        }
    }

    /// Exact, case-sensitive lookup of a wire name.
    pub fn from_wire(name: &str) -> Option<EventType> {
        EventType::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == name)
    }

    /// True for event types the control server sends to us.
    pub fn is_inbound(self) -> bool {
        !matches!(
            self,
            EventType::UploadRequest
                | EventType::DeleteRequest
                | EventType::SyncRequest
                | EventType::Ping
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope {
    pub event_type: EventType,
    pub user_id: String,
    pub session_id: String,
    pub timestamp: i64,
    pub data: Value,
}

impl OutboundEnvelope {
    /// Upload requests carry no data; the server derives the object key from
    /// `userId` and `timestamp`, so `captured_at` must be the capture stamp.
    pub fn upload_request(user_id: &str, session_id: &str, captured_at: i64) -> Self {
        Self {
            event_type: EventType::UploadRequest,
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            timestamp: captured_at,
            data: Value::Null,
        }
    }

    pub fn delete_request(user_id: &str, session_id: &str, timestamp: i64, key: &ScreenshotKey) -> Self {
        Self {
            event_type: EventType::DeleteRequest,
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            timestamp,
            data: Value::String(key.object_key()),
        }
    }

    /// Builds a sync request. Keys beyond [`MAX_SYNC_KEYS`] are dropped.
    pub fn sync_request(
        user_id: &str,
        session_id: &str,
        timestamp: i64,
        keys: &[ScreenshotKey],
    ) -> Self {
        let listed = keys
            .iter()
            .take(MAX_SYNC_KEYS)
            .map(|key| Value::String(key.object_key()))
            .collect();
        Self {
            event_type: EventType::SyncRequest,
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            timestamp,
            data: Value::Array(listed),
        }
    }

    pub fn ping(user_id: &str, session_id: &str, timestamp: i64) -> Self {
        Self {
            event_type: EventType::Ping,
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            timestamp,
            data: Value::Null,
        }
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|err| EnvelopeError::Encode(err.to_string()))
    }
}

/// Target of a select or delete command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTarget {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingCommand {
    pub command: String,
    pub result: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingAction {
    SensitivityUp,
    SensitivityDown,
    ToggleDetection,
}

impl SettingCommand {
    pub fn action(&self) -> Option<SettingAction> {
        match self.result.as_str() {
            "UP" => Some(SettingAction::SensitivityUp),
            "DOWN" => Some(SettingAction::SensitivityDown),
            "ODM" => Some(SettingAction::ToggleDetection),
            _ => None,
        }
    }
}

/// Server-issued list of presigned transfers produced by a sync request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncManifest {
    #[serde(rename = "GET", default)]
    pub get: Vec<String>,
    #[serde(rename = "PUT", default)]
    pub put: Vec<String>,
    /// Local names matching `put`, index for index.
    #[serde(rename = "PUTNames", default)]
    pub put_names: Vec<String>,
}

impl SyncManifest {
    pub fn is_empty(&self) -> bool {
        self.get.is_empty() && self.put.is_empty()
    }

    pub fn uploads(&self) -> impl Iterator<Item = (&str, &str)> {
        self.put
            .iter()
            .zip(self.put_names.iter())
            .map(|(url, name)| (url.as_str(), name.as_str()))
    }
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Select(EntityTarget),
    Delete(EntityTarget),
    Move([f32; 3]),
    Rotate([f32; 3]),
    Set(SettingCommand),
    UploadGrant(String),
    DeleteGrant(String),
    SyncManifest(SyncManifest),
    TransferError(Option<String>),
}

impl InboundEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            InboundEvent::Select(_) => EventType::CommandSelect,
            InboundEvent::Delete(_) => EventType::CommandDelete,
            InboundEvent::Move(_) => EventType::CommandMove,
            InboundEvent::Rotate(_) => EventType::CommandRotate,
            InboundEvent::Set(_) => EventType::CommandSet,
            InboundEvent::UploadGrant(_) => EventType::UploadResponse,
            InboundEvent::DeleteGrant(_) => EventType::DeleteResponse,
            InboundEvent::SyncManifest(_) => EventType::SyncResponse,
            InboundEvent::TransferError(_) => EventType::TransferError,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown event type {0:?}")]
    UnknownEventType(String),
    #[error("{0} is not accepted from the server")]
    NotInbound(EventType),
    #[error("invalid {event_type} payload: {reason}")]
    InvalidPayload {
        event_type: EventType,
        reason: String,
    },
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

#[derive(Debug, Deserialize)]
struct RawInbound {
    #[serde(rename = "eventType")]
    event_type: String,
    #[serde(default)]
    data: Value,
}

/// Parses one inbound text frame into a typed event.
pub fn decode_inbound(text: &str) -> Result<InboundEvent, EnvelopeError> {
    let raw: RawInbound =
        serde_json::from_str(text).map_err(|err| EnvelopeError::Malformed(err.to_string()))?;
    let event_type = EventType::from_wire(&raw.event_type)
        .ok_or_else(|| EnvelopeError::UnknownEventType(raw.event_type.clone()))?;
    decode_payload(event_type, raw.data)
}

fn decode_payload(event_type: EventType, data: Value) -> Result<InboundEvent, EnvelopeError> {
    let invalid = |reason: String| EnvelopeError::InvalidPayload { event_type, reason };
    match event_type {
        EventType::CommandSelect => typed(data).map(InboundEvent::Select).map_err(invalid),
        EventType::CommandDelete => typed(data).map(InboundEvent::Delete).map_err(invalid),
        EventType::CommandMove => typed(data).map(InboundEvent::Move).map_err(invalid),
        EventType::CommandRotate => typed(data).map(InboundEvent::Rotate).map_err(invalid),
        EventType::CommandSet => typed(data).map(InboundEvent::Set).map_err(invalid),
        EventType::UploadResponse => presigned_url(data)
            .map(InboundEvent::UploadGrant)
            .map_err(invalid),
        EventType::DeleteResponse => presigned_url(data)
            .map(InboundEvent::DeleteGrant)
            .map_err(invalid),
        EventType::SyncResponse => manifest(data)
            .map(InboundEvent::SyncManifest)
            .map_err(invalid),
        EventType::TransferError => match data {
            Value::Null => Ok(InboundEvent::TransferError(None)),
            Value::String(message) => Ok(InboundEvent::TransferError(Some(message))),
            other => Ok(InboundEvent::TransferError(Some(other.to_string()))),
        },
        EventType::UploadRequest
        | EventType::DeleteRequest
        | EventType::SyncRequest
        | EventType::Ping => Err(EnvelopeError::NotInbound(event_type)),
    }
}

fn typed<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, String> {
    serde_json::from_value(data).map_err(|err| err.to_string())
}

fn presigned_url(data: Value) -> Result<String, String> {
    match data {
        Value::String(url) if !url.trim().is_empty() => Ok(url),
        Value::String(_) => Err("presigned url is empty".into()),
        other => Err(format!("expected presigned url string, got {other}")),
    }
}

// Some server builds send the manifest as a JSON document encoded in a string.
fn manifest(data: Value) -> Result<SyncManifest, String> {
    let manifest: SyncManifest = match data {
        Value::String(encoded) => serde_json::from_str(&encoded).map_err(|err| err.to_string())?,
        Value::Object(_) => typed(data)?,
        other => return Err(format!("expected manifest object, got {other}")),
    };
    if manifest.put.len() != manifest.put_names.len() {
        return Err(format!(
            "PUT has {} urls but PUTNames has {} entries",
            manifest.put.len(),
            manifest.put_names.len()
        ));
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_names_round_trip_through_lookup() {
        for event in EventType::ALL {
            assert_eq!(EventType::from_wire(event.as_str()), Some(event));
            let encoded = serde_json::to_value(event).unwrap();
            assert_eq!(encoded, json!(event.as_str()));
        }
        assert_eq!(EventType::from_wire("command_select"), None);
        assert_eq!(EventType::from_wire("PING"), None);
    }

    #[test]
    fn upload_request_carries_capture_timestamp_and_null_data() {
        let envelope = OutboundEnvelope::upload_request("alice", "alice-1", 1_700_000_000_000);
        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "eventType": "S3_UPLOAD_REQUEST",
                "userId": "alice",
                "sessionId": "alice-1",
                "timestamp": 1_700_000_000_000i64,
                "data": null
            })
        );
    }

    #[test]
    fn sync_request_is_capped() {
        let keys: Vec<ScreenshotKey> = (0..150)
            .map(|ts| ScreenshotKey::new("bob", ts))
            .collect();
        let envelope = OutboundEnvelope::sync_request("bob", "s", 5, &keys);
        let listed = envelope.data.as_array().unwrap();
        assert_eq!(listed.len(), MAX_SYNC_KEYS);
        assert_eq!(listed[0], json!("bob/0.jpg"));
    }

    #[test]
    fn decodes_entity_commands() {
        let select = decode_inbound(r#"{"eventType":"COMMAND_SELECT","data":{"name":"chair"}}"#);
        assert_eq!(
            select.unwrap(),
            InboundEvent::Select(EntityTarget {
                name: "chair".into()
            })
        );

        let moved = decode_inbound(r#"{"eventType":"COMMAND_MOVE","data":[0.5,-1,0]}"#).unwrap();
        assert_eq!(moved, InboundEvent::Move([0.5, -1.0, 0.0]));

        let set = decode_inbound(
            r#"{"eventType":"COMMAND_SET","data":{"command":"sensitivity","result":"UP"}}"#,
        )
        .unwrap();
        match set {
            InboundEvent::Set(cmd) => assert_eq!(cmd.action(), Some(SettingAction::SensitivityUp)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn rejects_short_motion_arrays() {
        let err = decode_inbound(r#"{"eventType":"COMMAND_ROTATE","data":[1,2]}"#).unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::InvalidPayload {
                event_type: EventType::CommandRotate,
                ..
            }
        ));
    }

    #[test]
    fn unknown_and_outbound_types_are_rejected() {
        let err = decode_inbound(r#"{"eventType":"COMMAND_DANCE","data":null}"#).unwrap_err();
        assert_eq!(err, EnvelopeError::UnknownEventType("COMMAND_DANCE".into()));

        let err = decode_inbound(r#"{"eventType":"ping","data":null}"#).unwrap_err();
        assert_eq!(err, EnvelopeError::NotInbound(EventType::Ping));

        let err = decode_inbound("not json").unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn grants_require_a_url_string() {
        let grant =
            decode_inbound(r#"{"eventType":"S3_UPLOAD_RESPONSE","data":"https://s3/x"}"#).unwrap();
        assert_eq!(grant, InboundEvent::UploadGrant("https://s3/x".into()));

        let err = decode_inbound(r#"{"eventType":"S3_DELETE_RESPONSE","data":null}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidPayload { .. }));
    }

    #[test]
    fn transfer_error_tolerates_missing_data() {
        let event = decode_inbound(r#"{"eventType":"S3_ERROR"}"#).unwrap();
        assert_eq!(event, InboundEvent::TransferError(None));
    }

    #[test]
    fn manifest_accepts_object_or_encoded_string() {
        let object = json!({
            "eventType": "S3_SYNC_RESPONSE",
            "data": {"GET": ["https://s3/get/a"], "PUT": ["https://s3/put/b"], "PUTNames": ["b.jpg"]}
        });
        let decoded = decode_inbound(&object.to_string()).unwrap();
        let InboundEvent::SyncManifest(manifest) = decoded else {
            panic!("expected manifest");
        };
        assert_eq!(manifest.get, vec!["https://s3/get/a".to_string()]);
        assert_eq!(
            manifest.uploads().collect::<Vec<_>>(),
            vec![("https://s3/put/b", "b.jpg")]
        );

        let encoded = json!({
            "eventType": "S3_SYNC_RESPONSE",
            "data": "{\"GET\":[],\"PUT\":[],\"PUTNames\":[]}"
        });
        let decoded = decode_inbound(&encoded.to_string()).unwrap();
        assert_eq!(decoded, InboundEvent::SyncManifest(SyncManifest::default()));
    }

    #[test]
    fn manifest_with_mismatched_put_names_is_invalid() {
        let frame = json!({
            "eventType": "S3_SYNC_RESPONSE",
            "data": {"PUT": ["https://s3/put/b"], "PUTNames": []}
        });
        assert!(matches!(
            decode_inbound(&frame.to_string()),
            Err(EnvelopeError::InvalidPayload { .. })
        ));
    }
}
