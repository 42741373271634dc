use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::event::{BatchEnvelope, RawEvent};

/// Hard cap on events per batch envelope.
pub const MAX_BATCH_SIZE: usize = 50;

const DEVICE_TYPES: &[&str] = &["mobile", "desktop", "tablet"];
const PLATFORMS: &[&str] = &["ios", "android", "web"];
const NETWORK_TYPES: &[&str] = &["wifi", "cellular", "unknown"];

const EVENT_REQUIRED_FIELDS: &[(&str, fn(&RawEvent) -> bool)] = &[
    ("event_id", |e| e.event_id.is_some()),
    ("event_type", |e| e.event_type.is_some()),
    ("event_name", |e| e.event_name.is_some()),
    ("event_time", |e| e.event_time.is_some()),
    ("user_id", |e| e.user_id.is_some()),
    ("session_id", |e| e.session_id.is_some()),
    ("page_name", |e| e.page_name.is_some()),
];

/// One validation failure, reported with the JSON path of the offending
/// field so a client can fix a whole batch in a single round trip.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
    pub code: String,
}

impl Violation {
    pub fn required(field: &str) -> Violation {
        Violation {
            field: field.to_string(),
            message: "is required".to_string(),
            code: "validation.required".to_string(),
        }
    }

    fn format(field: String, expected: &str) -> Violation {
        Violation {
            field,
            message: format!("must match format {expected}"),
            code: "validation.format".to_string(),
        }
    }

    fn one_of(field: String, allowed: &[&str]) -> Violation {
        Violation {
            field,
            message: format!("must be one of: {}", allowed.join(", ")),
            code: "validation.enum".to_string(),
        }
    }
}

/// Check a batch envelope against the full rule set, collecting every
/// violation instead of stopping at the first.
pub fn validate_batch(batch: &BatchEnvelope) -> Result<(), Vec<Violation>> {
    let mut violations = Vec::new();

    if batch.batch_id.is_none() {
        violations.push(Violation::required("/batchId"));
    }
    match &batch.sent_at {
        None => violations.push(Violation::required("/sentAt")),
        Some(sent_at) if !is_valid_datetime(sent_at) => {
            violations.push(Violation::format("/sentAt".to_string(), "date-time"));
        }
        Some(_) => {}
    }
    match &batch.client_info {
        None => violations.push(Violation::required("/clientInfo")),
        Some(info) => {
            if info.sdk_version.is_none() {
                violations.push(Violation::required("/clientInfo/sdkVersion"));
            }
            if info.device_id.is_none() {
                violations.push(Violation::required("/clientInfo/deviceId"));
            }
            if info.app_build.is_none() {
                violations.push(Violation::required("/clientInfo/appBuild"));
            }
        }
    }

    if batch.events.is_empty() {
        violations.push(Violation {
            field: "/events".to_string(),
            message: "must contain at least 1 event".to_string(),
            code: "validation.minItems".to_string(),
        });
    }
    if batch.events.len() > MAX_BATCH_SIZE {
        violations.push(Violation {
            field: "/events".to_string(),
            message: format!("must contain at most {MAX_BATCH_SIZE} events"),
            code: "validation.maxItems".to_string(),
        });
    }

    for (index, event) in batch.events.iter().enumerate() {
        validate_event(index, event, &mut violations);
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn validate_event(index: usize, event: &RawEvent, violations: &mut Vec<Violation>) {
    let path = |field: &str| format!("/events/{index}/{field}");

    for (field, is_present) in EVENT_REQUIRED_FIELDS {
        if !is_present(event) {
            violations.push(Violation::required(&path(field)));
        }
    }

    if let Some(event_time) = &event.event_time {
        if !is_valid_datetime(event_time) {
            violations.push(Violation::format(path("event_time"), "date-time"));
        }
    }

    let enums = [
        ("device_type", &event.device_type, DEVICE_TYPES),
        ("platform", &event.platform, PLATFORMS),
        ("network_type", &event.network_type, NETWORK_TYPES),
    ];
    for (field, value, allowed) in enums {
        if let Some(value) = value {
            if !allowed.contains(&value.as_str()) {
                violations.push(Violation::one_of(path(field), allowed));
            }
        }
    }
}

fn is_valid_datetime(value: &str) -> bool {
    OffsetDateTime::parse(value, &Rfc3339).is_ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{validate_batch, MAX_BATCH_SIZE};
    use crate::event::{BatchEnvelope, RawEvent};

    fn valid_event(id: &str) -> RawEvent {
        serde_json::from_value(json!({
            "event_id": id,
            "event_type": "interaction",
            "event_name": "button_click",
            "event_time": "2024-03-01T12:00:00Z",
            "user_id": "u1",
            "session_id": "s1",
            "page_name": "home",
            "device_type": "mobile",
            "platform": "ios",
        }))
        .unwrap()
    }

    fn valid_batch(n: usize) -> BatchEnvelope {
        serde_json::from_value::<BatchEnvelope>(json!({
            "batchId": "batch-1",
            "sentAt": "2024-03-01T12:00:01Z",
            "clientInfo": {
                "sdkVersion": "3.2.1",
                "deviceId": "d-42",
                "appBuild": "420"
            },
            "events": (0..n).map(|i| serde_json::to_value(valid_event(&format!("evt-{i}"))).unwrap()).collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    #[test]
    fn accepts_a_valid_batch() {
        assert!(validate_batch(&valid_batch(3)).is_ok());
    }

    #[test]
    fn batch_of_exactly_max_size_is_accepted() {
        assert!(validate_batch(&valid_batch(MAX_BATCH_SIZE)).is_ok());
    }

    #[test]
    fn batch_over_max_size_is_rejected() {
        let violations = validate_batch(&valid_batch(MAX_BATCH_SIZE + 1)).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].code, "validation.maxItems");
        assert_eq!(violations[0].field, "/events");
    }

    #[test]
    fn empty_batch_is_rejected() {
        let mut batch = valid_batch(1);
        batch.events.clear();
        let violations = validate_batch(&batch).unwrap_err();
        assert!(violations.iter().any(|v| v.code == "validation.minItems"));
    }

    #[test]
    fn all_violations_are_reported_not_just_the_first() {
        let mut batch = valid_batch(1);
        // Three independent problems in one event.
        batch.events[0].event_id = None;
        batch.events[0].device_type = Some("smartwatch".to_string());
        batch.events[0].event_time = Some("yesterday".to_string());

        let violations = validate_batch(&batch).unwrap_err();
        assert_eq!(violations.len(), 3, "{violations:?}");

        let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
        assert!(fields.contains(&"/events/0/event_id"));
        assert!(fields.contains(&"/events/0/device_type"));
        assert!(fields.contains(&"/events/0/event_time"));
    }

    #[test]
    fn envelope_fields_are_required() {
        let batch = BatchEnvelope {
            events: vec![valid_event("evt-1")],
            ..Default::default()
        };
        let violations = validate_batch(&batch).unwrap_err();
        let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
        assert!(fields.contains(&"/batchId"));
        assert!(fields.contains(&"/sentAt"));
        assert!(fields.contains(&"/clientInfo"));
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        let mut batch = valid_batch(2);
        batch.events[1].platform = Some("blackberry".to_string());
        batch.events[1].network_type = Some("carrier-pigeon".to_string());

        let violations = validate_batch(&batch).unwrap_err();
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().all(|v| v.code == "validation.enum"));
    }

    #[test]
    fn single_event_wrapped_batch_validates_like_a_batch() {
        let envelope = BatchEnvelope::wrap_single(valid_event("evt-1"));
        assert!(validate_batch(&envelope).is_ok());

        let envelope = BatchEnvelope::wrap_single(RawEvent::default());
        let violations = validate_batch(&envelope).unwrap_err();
        // batchId and sentAt derive from the missing event fields.
        assert!(violations.iter().any(|v| v.field == "/batchId"));
        assert!(violations.iter().any(|v| v.field == "/events/0/event_id"));
    }
}
