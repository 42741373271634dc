use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::IngestError;

/// A telemetry event as submitted by a client. Everything is optional at the
/// parsing stage so that the validator can report every missing or invalid
/// field in one pass instead of failing on the first serde error.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RawEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    /// Open-ended payload sections (content, behavior, commerce, ...).
    #[serde(flatten)]
    pub payload: HashMap<String, Value>,
}

impl RawEvent {
    pub fn from_bytes(bytes: Bytes) -> Result<RawEvent, IngestError> {
        Ok(serde_json::from_slice::<RawEvent>(&bytes)?)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_build: Option<String>,
}

/// The envelope posted to the batch endpoint. Single-event submissions are
/// wrapped into a synthetic one-element envelope so both entry points run
/// the same validation rules.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

impl BatchEnvelope {
    pub fn from_bytes(bytes: Bytes) -> Result<BatchEnvelope, IngestError> {
        Ok(serde_json::from_slice::<BatchEnvelope>(&bytes)?)
    }

    /// Wrap a single event submission into a synthetic batch: the event id
    /// doubles as batch id, the event time as sent-at, and the client info
    /// is derived from what the event itself carries.
    pub fn wrap_single(event: RawEvent) -> BatchEnvelope {
        BatchEnvelope {
            batch_id: event.event_id.clone(),
            sent_at: event.event_time.clone(),
            client_info: Some(ClientInfo {
                sdk_version: Some(event.app_version.clone().unwrap_or_else(unknown)),
                device_id: Some(event.device_type.clone().unwrap_or_else(unknown)),
                app_build: Some(event.app_version.clone().unwrap_or_else(unknown)),
            }),
            events: vec![event],
        }
    }
}

fn unknown() -> String {
    String::from("unknown")
}

/// Per-request enrichment shared by every event of a submission. None of it
/// ever touches the event identity field.
#[derive(Clone, Debug)]
pub struct ProcessingContext {
    pub ingested_at: String,
    pub batch_id: Option<String>,
    pub batch_sent_at: Option<String>,
    pub client_info: Option<ClientInfo>,
}

/// An event after validation and enrichment, ready for the broker. `data`
/// is the final wire payload; `event_id` is kept alongside to key the
/// broker message so replays of one id land on one partition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub data: String,
}

impl ProcessedEvent {
    pub fn key(&self) -> &str {
        &self.event_id
    }
}

/// Serialize an event with the pipeline metadata merged in. Only metadata
/// keys are added; client-supplied fields, in particular `event_id`, are
/// forwarded untouched.
pub fn process_event(
    event: &RawEvent,
    context: &ProcessingContext,
) -> Result<ProcessedEvent, IngestError> {
    // Validated upstream, an absent id here is a programming error.
    let event_id = event.event_id.clone().ok_or(IngestError::Internal)?;

    let mut value = serde_json::to_value(event)?;
    let Some(fields) = value.as_object_mut() else {
        return Err(IngestError::Internal);
    };
    fields.insert(
        "ingestedAt".to_string(),
        Value::String(context.ingested_at.clone()),
    );
    if let Some(batch_id) = &context.batch_id {
        fields.insert("batchId".to_string(), Value::String(batch_id.clone()));
    }
    if let Some(sent_at) = &context.batch_sent_at {
        fields.insert("batchSentAt".to_string(), Value::String(sent_at.clone()));
    }
    if let Some(client_info) = &context.client_info {
        fields.insert("clientInfo".to_string(), serde_json::to_value(client_info)?);
    }

    Ok(ProcessedEvent {
        event_id,
        data: serde_json::to_string(&value)?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{process_event, BatchEnvelope, ProcessingContext, RawEvent};

    fn event() -> RawEvent {
        serde_json::from_value(json!({
            "event_id": "evt-1",
            "event_type": "interaction",
            "event_name": "button_click",
            "event_time": "2024-03-01T12:00:00Z",
            "user_id": "u1",
            "session_id": "s1",
            "page_name": "home",
            "app_version": "3.2.1",
            "device_type": "mobile",
            "content": {"title": "hello"}
        }))
        .unwrap()
    }

    #[test]
    fn enrichment_preserves_identity_and_payload() {
        let context = ProcessingContext {
            ingested_at: "2024-03-01T12:00:01Z".to_string(),
            batch_id: Some("batch-9".to_string()),
            batch_sent_at: Some("2024-03-01T12:00:00.500Z".to_string()),
            client_info: None,
        };

        let processed = process_event(&event(), &context).unwrap();
        assert_eq!(processed.event_id, "evt-1");
        assert_eq!(processed.key(), "evt-1");

        let data: Value = serde_json::from_str(&processed.data).unwrap();
        assert_eq!(data["event_id"], "evt-1");
        assert_eq!(data["ingestedAt"], "2024-03-01T12:00:01Z");
        assert_eq!(data["batchId"], "batch-9");
        assert_eq!(data["content"]["title"], "hello");
    }

    #[test]
    fn single_event_wrap_reuses_event_fields() {
        let envelope = BatchEnvelope::wrap_single(event());
        assert_eq!(envelope.batch_id.as_deref(), Some("evt-1"));
        assert_eq!(envelope.sent_at.as_deref(), Some("2024-03-01T12:00:00Z"));
        assert_eq!(envelope.events.len(), 1);

        let info = envelope.client_info.unwrap();
        assert_eq!(info.sdk_version.as_deref(), Some("3.2.1"));
        assert_eq!(info.device_id.as_deref(), Some("mobile"));
    }

    #[test]
    fn wrap_without_optional_fields_falls_back_to_unknown() {
        let envelope = BatchEnvelope::wrap_single(RawEvent {
            event_id: Some("evt-2".to_string()),
            ..Default::default()
        });
        let info = envelope.client_info.unwrap();
        assert_eq!(info.sdk_version.as_deref(), Some("unknown"));
        assert_eq!(info.device_id.as_deref(), Some("unknown"));
    }
}
