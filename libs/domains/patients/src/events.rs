//! Event vocabulary: entity kinds, actions, routing keys and payload construction.

use serde_json::{Map, Value, json};
use strum::{Display, EnumString};

use broker::iso_now;

/// Sync reason attached to republished state after drift detection.
pub const DRIFT_SYNC_REASON: &str = "drift_detected";

/// Entities that publish domain events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Patient,
    PatientMedication,
    Allocation,
    Prescription,
}

impl EntityKind {
    /// Durable topic exchange the entity's events go to.
    pub fn exchange(self) -> &'static str {
        match self {
            EntityKind::Patient | EntityKind::PatientMedication => "patient.updates",
            EntityKind::Allocation => "allocation.updates",
            EntityKind::Prescription => "prescription.updates",
        }
    }

    /// First segments of the routing key, e.g. `patient.medication`.
    pub fn routing_prefix(self) -> &'static str {
        match self {
            EntityKind::Patient => "patient",
            EntityKind::PatientMedication => "patient.medication",
            EntityKind::Allocation => "allocation",
            EntityKind::Prescription => "prescription",
        }
    }

    /// Payload field carrying the entity's own id.
    pub fn id_field(self) -> &'static str {
        match self {
            EntityKind::Patient => "patient_id",
            EntityKind::PatientMedication => "medication_id",
            EntityKind::Allocation => "allocation_id",
            EntityKind::Prescription => "prescription_id",
        }
    }

    /// `PATIENT_MEDICATION_UPDATED` and friends.
    pub fn event_type(self, action: EventAction) -> String {
        format!("{}_{}", self, action).to_uppercase()
    }

    /// `<entity>.<action>.<id>`, e.g. `patient.created.123`.
    pub fn routing_key(self, action: EventAction, id: i64) -> String {
        format!("{}.{}.{}", self.routing_prefix(), action, id)
    }

    /// `<entity>.updated.sync`, e.g. `patient.medication.updated.sync`.
    pub fn sync_routing_key(self) -> String {
        format!("{}.{}.sync", self.routing_prefix(), EventAction::Updated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
}

impl EventAction {
    /// Payload field naming who performed the action.
    pub fn actor_field(self) -> &'static str {
        match self {
            EventAction::Created => "created_by",
            EventAction::Updated => "modified_by",
            EventAction::Deleted => "deleted_by",
        }
    }
}

/// What an event carries besides its identifiers.
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    /// Full state after create, or last known state before delete
    Snapshot(Value),
    /// Before/after pair; `changes` is computed when not supplied
    Change {
        old_data: Value,
        new_data: Value,
        changes: Option<Value>,
    },
    /// Canonical state republished to resynchronise downstream copies
    Sync { data: Value, reason: String },
}

/// One outgoing domain event, before it is turned into a wire message.
#[derive(Debug, Clone)]
pub struct EntityEvent {
    pub kind: EntityKind,
    pub action: EventAction,
    pub id: i64,
    /// Extra identifier fields, e.g. the owning `patient_id` of a medication
    pub related: Vec<(&'static str, i64)>,
    pub body: EventBody,
    pub actor: Option<String>,
    pub correlation_id: Option<String>,
}

impl EntityEvent {
    pub fn new(kind: EntityKind, action: EventAction, id: i64, body: EventBody) -> Self {
        Self {
            kind,
            action,
            id,
            related: Vec::new(),
            body,
            actor: None,
            correlation_id: None,
        }
    }

    pub fn with_related(mut self, field: &'static str, id: i64) -> Self {
        self.related.push((field, id));
        self
    }

    pub fn with_actor(mut self, actor: Option<&str>) -> Self {
        self.actor = actor.map(str::to_string);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn is_sync(&self) -> bool {
        matches!(self.body, EventBody::Sync { .. })
    }

    pub fn routing_key(&self) -> String {
        if self.is_sync() {
            self.kind.sync_routing_key()
        } else {
            self.kind.routing_key(self.action, self.id)
        }
    }

    /// The `data` part of the envelope.
    pub fn to_message(&self) -> Value {
        let mut message = Map::new();
        message.insert("event_type".into(), json!(self.kind.event_type(self.action)));
        message.insert(self.kind.id_field().into(), json!(self.id));
        for (field, id) in &self.related {
            message.insert((*field).into(), json!(id));
        }

        match &self.body {
            EventBody::Snapshot(data) => {
                message.insert("data".into(), data.clone());
            }
            EventBody::Change {
                old_data,
                new_data,
                changes,
            } => {
                let changes = changes
                    .clone()
                    .unwrap_or_else(|| compute_changes(old_data, new_data));
                message.insert("old_data".into(), old_data.clone());
                message.insert("new_data".into(), new_data.clone());
                message.insert("changes".into(), changes);
            }
            EventBody::Sync { data, reason } => {
                message.insert("old_data".into(), json!({}));
                message.insert("new_data".into(), data.clone());
                message.insert("changes".into(), json!({}));
                message.insert("is_sync_event".into(), json!(true));
                message.insert("sync_reason".into(), json!(reason));
            }
        }

        message.insert(self.action.actor_field().into(), json!(self.actor));
        message.insert("timestamp".into(), json!(iso_now()));
        if let Some(correlation_id) = &self.correlation_id {
            message.insert("correlation_id".into(), json!(correlation_id));
        }
        Value::Object(message)
    }
}

/// Per-field `{old, new}` difference between two JSON objects.
///
/// Fields missing on one side compare as `null`. Non-object inputs have no fields and
/// yield an empty object.
pub fn compute_changes(old: &Value, new: &Value) -> Value {
    let (Some(old), Some(new)) = (old.as_object(), new.as_object()) else {
        return json!({});
    };

    let mut changes = Map::new();
    for key in old.keys().chain(new.keys()) {
        if changes.contains_key(key) {
            continue;
        }
        let before = old.get(key).unwrap_or(&Value::Null);
        let after = new.get(key).unwrap_or(&Value::Null);
        if before != after {
            changes.insert(key.clone(), json!({ "old": before, "new": after }));
        }
    }
    Value::Object(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types_and_routing_keys() {
        assert_eq!(EntityKind::Patient.event_type(EventAction::Created), "PATIENT_CREATED");
        assert_eq!(
            EntityKind::PatientMedication.event_type(EventAction::Updated),
            "PATIENT_MEDICATION_UPDATED"
        );
        assert_eq!(EntityKind::Patient.routing_key(EventAction::Created, 123), "patient.created.123");
        assert_eq!(
            EntityKind::PatientMedication.routing_key(EventAction::Deleted, 5),
            "patient.medication.deleted.5"
        );
        assert_eq!(
            EntityKind::PatientMedication.sync_routing_key(),
            "patient.medication.updated.sync"
        );
        assert_eq!(EntityKind::Allocation.exchange(), "allocation.updates");
    }

    #[test]
    fn test_update_message_computes_changes() {
        let event = EntityEvent::new(
            EntityKind::Patient,
            EventAction::Updated,
            4,
            EventBody::Change {
                old_data: json!({"name": "Jon", "phone": null, "age": 40}),
                new_data: json!({"name": "John", "phone": "555", "age": 40}),
                changes: None,
            },
        )
        .with_actor(Some("nurse-1"));

        let message = event.to_message();
        assert_eq!(message["event_type"], "PATIENT_UPDATED");
        assert_eq!(message["modified_by"], "nurse-1");
        assert_eq!(
            message["changes"],
            json!({
                "name": {"old": "Jon", "new": "John"},
                "phone": {"old": null, "new": "555"},
            })
        );
    }

    #[test]
    fn test_explicit_changes_are_kept() {
        let event = EntityEvent::new(
            EntityKind::Prescription,
            EventAction::Updated,
            9,
            EventBody::Change {
                old_data: json!({}),
                new_data: json!({"status": "filled"}),
                changes: Some(json!({"status": "filled"})),
            },
        );
        assert_eq!(event.to_message()["changes"], json!({"status": "filled"}));
    }

    #[test]
    fn test_sync_message_shape() {
        let event = EntityEvent::new(
            EntityKind::PatientMedication,
            EventAction::Updated,
            11,
            EventBody::Sync {
                data: json!({"id": 11}),
                reason: DRIFT_SYNC_REASON.to_string(),
            },
        )
        .with_related("patient_id", 3);

        let message = event.to_message();
        assert_eq!(event.routing_key(), "patient.medication.updated.sync");
        assert_eq!(message["medication_id"], 11);
        assert_eq!(message["patient_id"], 3);
        assert_eq!(message["is_sync_event"], true);
        assert_eq!(message["sync_reason"], "drift_detected");
        assert_eq!(message["old_data"], json!({}));
        assert_eq!(message["changes"], json!({}));
        assert_eq!(message["new_data"], json!({"id": 11}));
        // Actor is carried even when unknown.
        assert!(message.get("modified_by").unwrap().is_null());
    }

    #[test]
    fn test_changes_of_non_objects_are_empty() {
        assert_eq!(compute_changes(&json!(null), &json!({"a": 1})), json!({}));
    }
}
