//! Entity publishers
//!
//! Stateless translators from "something happened to entity X" into a message on the
//! entity's exchange. Every method returns the producer's enqueue result; a false return
//! never undoes the storage change that triggered it.
//!
//! `with_correlation_id` yields a publisher whose events carry the caller's request id,
//! which the producer also copies into the message properties.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use broker::{ExchangeKind, MessageProducer};

use crate::events::{EntityEvent, EntityKind, EventAction, EventBody};

/// Publishes events for one entity kind.
#[derive(Clone)]
pub struct EntityPublisher {
    producer: Arc<dyn MessageProducer>,
    kind: EntityKind,
    correlation_id: Option<String>,
}

impl EntityPublisher {
    /// Declare the entity's exchange. A failed declaration is logged; the producer
    /// declares on demand at first publish anyway.
    pub async fn new(producer: Arc<dyn MessageProducer>, kind: EntityKind) -> Self {
        if let Err(e) = producer.declare_exchange(kind.exchange(), ExchangeKind::Topic).await {
            warn!(
                entity = %kind,
                exchange = kind.exchange(),
                error = %e,
                "Could not declare exchange"
            );
        }
        Self {
            producer,
            kind,
            correlation_id: None,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Same producer and entity; every event published through the copy carries
    /// `correlation_id`.
    pub fn with_correlation_id(&self, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..self.clone()
        }
    }

    pub fn publish(&self, event: &EntityEvent) -> bool {
        let routing_key = event.routing_key();
        let accepted = self
            .producer
            .publish(self.kind.exchange(), &routing_key, event.to_message());

        if accepted {
            debug!(routing_key = %routing_key, "Event enqueued");
        } else {
            warn!(
                entity = %self.kind,
                id = event.id,
                routing_key = %routing_key,
                "Event not accepted by producer"
            );
        }
        accepted
    }

    pub fn publish_created(&self, id: i64, related: &[(&'static str, i64)], data: Value, actor: Option<&str>) -> bool {
        self.publish(&self.event(EventAction::Created, id, related, EventBody::Snapshot(data), actor))
    }

    pub fn publish_updated(
        &self,
        id: i64,
        related: &[(&'static str, i64)],
        old_data: Value,
        new_data: Value,
        changes: Option<Value>,
        actor: Option<&str>,
    ) -> bool {
        let body = EventBody::Change {
            old_data,
            new_data,
            changes,
        };
        self.publish(&self.event(EventAction::Updated, id, related, body, actor))
    }

    pub fn publish_deleted(&self, id: i64, related: &[(&'static str, i64)], data: Value, actor: Option<&str>) -> bool {
        self.publish(&self.event(EventAction::Deleted, id, related, EventBody::Snapshot(data), actor))
    }

    /// Republish full state as a synthetic update.
    pub fn publish_sync(&self, id: i64, related: &[(&'static str, i64)], data: Value, reason: &str) -> bool {
        let body = EventBody::Sync {
            data,
            reason: reason.to_string(),
        };
        self.publish(&self.event(EventAction::Updated, id, related, body, None))
    }

    fn event(
        &self,
        action: EventAction,
        id: i64,
        related: &[(&'static str, i64)],
        body: EventBody,
        actor: Option<&str>,
    ) -> EntityEvent {
        let event = related
            .iter()
            .fold(EntityEvent::new(self.kind, action, id, body), |event, (field, related_id)| {
                event.with_related(field, *related_id)
            })
            .with_actor(actor);

        match &self.correlation_id {
            Some(correlation_id) => event.with_correlation_id(correlation_id.as_str()),
            None => event,
        }
    }
}

#[derive(Clone)]
pub struct PatientPublisher {
    inner: EntityPublisher,
}

impl PatientPublisher {
    pub async fn new(producer: Arc<dyn MessageProducer>) -> Self {
        Self {
            inner: EntityPublisher::new(producer, EntityKind::Patient).await,
        }
    }

    pub fn with_correlation_id(&self, correlation_id: impl Into<String>) -> Self {
        Self {
            inner: self.inner.with_correlation_id(correlation_id),
        }
    }

    pub fn publish_patient_created(&self, patient_id: i64, patient_data: Value, created_by: Option<&str>) -> bool {
        self.inner.publish_created(patient_id, &[], patient_data, created_by)
    }

    pub fn publish_patient_updated(
        &self,
        patient_id: i64,
        old_data: Value,
        new_data: Value,
        changes: Option<Value>,
        modified_by: Option<&str>,
    ) -> bool {
        self.inner
            .publish_updated(patient_id, &[], old_data, new_data, changes, modified_by)
    }

    pub fn publish_patient_deleted(&self, patient_id: i64, patient_data: Value, deleted_by: Option<&str>) -> bool {
        self.inner.publish_deleted(patient_id, &[], patient_data, deleted_by)
    }

    pub fn publish_patient_sync(&self, patient_id: i64, patient_data: Value, sync_reason: &str) -> bool {
        self.inner.publish_sync(patient_id, &[], patient_data, sync_reason)
    }
}

#[derive(Clone)]
pub struct MedicationPublisher {
    inner: EntityPublisher,
}

impl MedicationPublisher {
    pub async fn new(producer: Arc<dyn MessageProducer>) -> Self {
        Self {
            inner: EntityPublisher::new(producer, EntityKind::PatientMedication).await,
        }
    }

    pub fn with_correlation_id(&self, correlation_id: impl Into<String>) -> Self {
        Self {
            inner: self.inner.with_correlation_id(correlation_id),
        }
    }

    pub fn publish_medication_created(
        &self,
        medication_id: i64,
        patient_id: i64,
        medication_data: Value,
        created_by: Option<&str>,
    ) -> bool {
        self.inner
            .publish_created(medication_id, &[("patient_id", patient_id)], medication_data, created_by)
    }

    pub fn publish_medication_updated(
        &self,
        medication_id: i64,
        patient_id: i64,
        old_data: Value,
        new_data: Value,
        changes: Option<Value>,
        modified_by: Option<&str>,
    ) -> bool {
        self.inner.publish_updated(
            medication_id,
            &[("patient_id", patient_id)],
            old_data,
            new_data,
            changes,
            modified_by,
        )
    }

    pub fn publish_medication_deleted(
        &self,
        medication_id: i64,
        patient_id: i64,
        medication_data: Value,
        deleted_by: Option<&str>,
    ) -> bool {
        self.inner
            .publish_deleted(medication_id, &[("patient_id", patient_id)], medication_data, deleted_by)
    }

    pub fn publish_medication_sync(
        &self,
        medication_id: i64,
        patient_id: i64,
        medication_data: Value,
        sync_reason: &str,
    ) -> bool {
        self.inner
            .publish_sync(medication_id, &[("patient_id", patient_id)], medication_data, sync_reason)
    }
}

#[derive(Clone)]
pub struct AllocationPublisher {
    inner: EntityPublisher,
}

impl AllocationPublisher {
    pub async fn new(producer: Arc<dyn MessageProducer>) -> Self {
        Self {
            inner: EntityPublisher::new(producer, EntityKind::Allocation).await,
        }
    }

    pub fn with_correlation_id(&self, correlation_id: impl Into<String>) -> Self {
        Self {
            inner: self.inner.with_correlation_id(correlation_id),
        }
    }

    pub fn publish_allocation_created(
        &self,
        allocation_id: i64,
        patient_id: i64,
        allocation_data: Value,
        created_by: Option<&str>,
    ) -> bool {
        self.inner
            .publish_created(allocation_id, &[("patient_id", patient_id)], allocation_data, created_by)
    }

    pub fn publish_allocation_updated(
        &self,
        allocation_id: i64,
        patient_id: i64,
        old_data: Value,
        new_data: Value,
        changes: Option<Value>,
        modified_by: Option<&str>,
    ) -> bool {
        self.inner.publish_updated(
            allocation_id,
            &[("patient_id", patient_id)],
            old_data,
            new_data,
            changes,
            modified_by,
        )
    }

    pub fn publish_allocation_deleted(
        &self,
        allocation_id: i64,
        patient_id: i64,
        allocation_data: Value,
        deleted_by: Option<&str>,
    ) -> bool {
        self.inner
            .publish_deleted(allocation_id, &[("patient_id", patient_id)], allocation_data, deleted_by)
    }
}

#[derive(Clone)]
pub struct PrescriptionPublisher {
    inner: EntityPublisher,
}

impl PrescriptionPublisher {
    pub async fn new(producer: Arc<dyn MessageProducer>) -> Self {
        Self {
            inner: EntityPublisher::new(producer, EntityKind::Prescription).await,
        }
    }

    pub fn with_correlation_id(&self, correlation_id: impl Into<String>) -> Self {
        Self {
            inner: self.inner.with_correlation_id(correlation_id),
        }
    }

    pub fn publish_prescription_created(
        &self,
        prescription_id: i64,
        patient_id: i64,
        prescription_data: Value,
        created_by: Option<&str>,
    ) -> bool {
        self.inner
            .publish_created(prescription_id, &[("patient_id", patient_id)], prescription_data, created_by)
    }

    pub fn publish_prescription_updated(
        &self,
        prescription_id: i64,
        patient_id: i64,
        old_data: Value,
        new_data: Value,
        changes: Option<Value>,
        modified_by: Option<&str>,
    ) -> bool {
        self.inner.publish_updated(
            prescription_id,
            &[("patient_id", patient_id)],
            old_data,
            new_data,
            changes,
            modified_by,
        )
    }

    pub fn publish_prescription_deleted(
        &self,
        prescription_id: i64,
        patient_id: i64,
        prescription_data: Value,
        deleted_by: Option<&str>,
    ) -> bool {
        self.inner
            .publish_deleted(prescription_id, &[("patient_id", patient_id)], prescription_data, deleted_by)
    }
}
