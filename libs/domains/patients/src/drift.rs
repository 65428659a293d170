//! Drift reconciliation
//!
//! The reconciliation service announces records whose downstream copies may be stale.
//! For each notice the current state is loaded and republished as a sync event on the
//! entity's own exchange, so subscribers converge on the stored truth.
//!
//! | Outcome                              | Settlement           |
//! |--------------------------------------|----------------------|
//! | Record republished                   | ack                  |
//! | Record no longer exists              | ack                  |
//! | Missing/invalid fields, unknown type | reject, no requeue   |
//! | Storage failure, publish refused     | requeue              |
//! | Shutdown in progress                 | requeue, stop        |

use async_trait::async_trait;
use serde_json::Value;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use strum::{Display, EnumString};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use broker::{
    BrokerClient, BrokerConfig, BrokerError, ClientStatus, Consumer, ConsumerHealth, Disposition, ExchangeKind,
    MessageHandler, ShutdownSignal, StopHandle, Transport,
};

use crate::events::DRIFT_SYNC_REASON;
use crate::error::PatientsResult;
use crate::publishers::{MedicationPublisher, PatientPublisher};
use crate::repository::RecordStore;

pub const DEFAULT_DRIFT_QUEUE: &str = "reconciliation.drift.detected";
pub const DEFAULT_DRIFT_EXCHANGE: &str = "reconciliation.events";
pub const DEFAULT_DRIFT_ROUTING_KEY: &str = "reconciliation.drift.detected";

/// Record types the reconciliation service may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum RecordType {
    Patient,
    PatientMedication,
}

impl RecordType {
    /// Accepts `patient_medication`, `Patient-Medication` and similar spellings.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::from_str(&raw.trim().replace('-', "_")).ok()
    }
}

/// The fields of a drift notification this service acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftNotice {
    pub record_type: String,
    pub record_id: i64,
}

impl DriftNotice {
    /// Read `record_type` and `record_id` from the message, or from its `data` object
    /// when the sender wrapped them. `None` when either is missing or unusable.
    pub fn from_message(message: &Value) -> Option<Self> {
        let record_type = field(message, "record_type")?.as_str()?.to_string();
        let record_id = match field(message, "record_id")? {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        Some(Self {
            record_type,
            record_id,
        })
    }
}

fn field<'a>(message: &'a Value, name: &str) -> Option<&'a Value> {
    message
        .get(name)
        .or_else(|| message.get("data").and_then(|data| data.get(name)))
        .filter(|value| !value.is_null())
}

/// Loads the named record and republishes it.
pub struct DriftHandler {
    store: Arc<dyn RecordStore>,
    patients: PatientPublisher,
    medications: MedicationPublisher,
}

impl DriftHandler {
    pub fn new(store: Arc<dyn RecordStore>, patients: PatientPublisher, medications: MedicationPublisher) -> Self {
        Self {
            store,
            patients,
            medications,
        }
    }

    /// Decide the settlement for one drift notification. `Err` means requeue.
    #[instrument(skip_all)]
    pub async fn process(&self, message: Value) -> PatientsResult<Disposition> {
        let Some(notice) = DriftNotice::from_message(&message) else {
            warn!(message = %message, "Drift notification without usable record_type/record_id");
            return Ok(Disposition::Reject);
        };

        let Some(record_type) = RecordType::parse(&notice.record_type) else {
            warn!(
                record_type = %notice.record_type,
                record_id = notice.record_id,
                "Unknown record type in drift notification"
            );
            return Ok(Disposition::Reject);
        };

        let id = notice.record_id;
        let published = match record_type {
            RecordType::Patient => match self.store.find_patient(id).await? {
                Some(patient) => {
                    let data = serde_json::to_value(&patient)?;
                    Some(self.patients.publish_patient_sync(id, data, DRIFT_SYNC_REASON))
                }
                None => None,
            },
            RecordType::PatientMedication => match self.store.find_patient_medication(id).await? {
                Some(medication) => {
                    let data = serde_json::to_value(&medication)?;
                    Some(
                        self.medications
                            .publish_medication_sync(id, medication.patient_id, data, DRIFT_SYNC_REASON),
                    )
                }
                None => None,
            },
        };

        match published {
            Some(true) => {
                info!(%record_type, record_id = id, "Republished record after drift");
                Ok(Disposition::Ack)
            }
            Some(false) => {
                warn!(%record_type, record_id = id, "Producer refused sync event, requeueing");
                Ok(Disposition::Requeue)
            }
            None => {
                info!(%record_type, record_id = id, "Drifted record no longer exists, nothing to sync");
                Ok(Disposition::Ack)
            }
        }
    }
}

/// Where drift notifications are consumed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftSettings {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self {
            queue: DEFAULT_DRIFT_QUEUE.to_string(),
            exchange: DEFAULT_DRIFT_EXCHANGE.to_string(),
            routing_key: DEFAULT_DRIFT_ROUTING_KEY.to_string(),
        }
    }
}

impl DriftSettings {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }
}

/// Puts messages back while the process is shutting down, otherwise defers to
/// [`DriftHandler`].
struct ShutdownAwareHandler {
    inner: Arc<DriftHandler>,
    shutdown: Arc<OnceLock<ShutdownSignal>>,
    stop: StopHandle,
}

#[async_trait]
impl MessageHandler for ShutdownAwareHandler {
    async fn handle(&self, message: Value) -> Result<Disposition, BrokerError> {
        if self.shutdown.get().is_some_and(ShutdownSignal::is_triggered) {
            debug!("Shutdown in progress, returning drift notification to the queue");
            self.stop.stop();
            return Ok(Disposition::Requeue);
        }

        self.inner
            .process(message)
            .await
            .map_err(|e| BrokerError::Handler(e.to_string()))
    }
}

/// Consumes the drift queue with its own broker connection.
pub struct DriftConsumer<T: Transport> {
    client: Mutex<BrokerClient<T>>,
    status: Arc<ClientStatus>,
    stop: StopHandle,
    shutdown: Arc<OnceLock<ShutdownSignal>>,
    settings: DriftSettings,
}

impl<T: Transport> DriftConsumer<T> {
    pub const NAME: &'static str = "drift";

    /// Connect, declare the exchange and the bound queue, and register the handler.
    pub async fn build(
        transport: T,
        config: BrokerConfig,
        settings: DriftSettings,
        handler: Arc<DriftHandler>,
    ) -> Result<Self, BrokerError> {
        let mut client = BrokerClient::new(transport, config);

        let retries = client.config().connect_retries;
        if !client.connect(retries).await {
            return Err(BrokerError::Connection(format!(
                "drift consumer could not connect to {}",
                client.config().redacted_url()
            )));
        }

        client
            .declare_exchange(&settings.exchange, ExchangeKind::Topic)
            .await?;
        client
            .declare_queue(&settings.queue, &settings.exchange, &settings.routing_key)
            .await?;

        let shutdown = Arc::new(OnceLock::new());
        let stop = client.stop_handle();
        client.consume(
            settings.queue.clone(),
            Arc::new(ShutdownAwareHandler {
                inner: handler,
                shutdown: shutdown.clone(),
                stop: stop.clone(),
            }),
            false,
        );

        info!(queue = %settings.queue, exchange = %settings.exchange, "Drift consumer ready");
        Ok(Self {
            status: client.status(),
            client: Mutex::new(client),
            stop,
            shutdown,
            settings,
        })
    }

    pub fn settings(&self) -> &DriftSettings {
        &self.settings
    }

    pub fn health_status(&self) -> ConsumerHealth {
        ConsumerHealth {
            consuming: self.status.is_consuming(),
            connected: self.status.is_connected(),
        }
    }
}

#[async_trait]
impl<T: Transport> Consumer for DriftConsumer<T> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn attach_shutdown(&self, shutdown: ShutdownSignal) {
        if self.shutdown.set(shutdown).is_err() {
            debug!("Shutdown signal already attached");
        }
    }

    async fn start_consuming(&self) -> Result<(), BrokerError> {
        self.client.lock().await.start_consuming().await
    }

    fn stop(&self) {
        self.stop.stop();
    }

    async fn close(&self) {
        self.client.lock().await.close().await;
    }

    fn health(&self) -> ConsumerHealth {
        self.health_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{patient, patient_medication};
    use crate::error::PatientsError;
    use crate::repository::MockRecordStore;
    use broker::testing::{MemoryBroker, RecordingProducer};
    use chrono::{NaiveDate, TimeZone, Utc};
    use mockall::predicate::eq;
    use sea_orm::DbErr;
    use serde_json::json;

    fn patient(id: i64) -> patient::Model {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap().fixed_offset();
        patient::Model {
            id,
            first_name: "Jane".to_string(),
            last_name: "Roe".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1980, 5, 17),
            gender: None,
            phone: None,
            email: Some("jane@example.com".to_string()),
            address: None,
            is_active: true,
            created_at: at,
            updated_at: at,
        }
    }

    fn medication(id: i64, patient_id: i64) -> patient_medication::Model {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap().fixed_offset();
        patient_medication::Model {
            id,
            patient_id,
            medication_name: "Amoxicillin".to_string(),
            dosage: Some("500mg".to_string()),
            frequency: Some("3x daily".to_string()),
            route: None,
            start_date: NaiveDate::from_ymd_opt(2025, 3, 1),
            end_date: None,
            prescribed_by: None,
            notes: None,
            is_active: true,
            created_at: at,
            updated_at: at,
        }
    }

    async fn handler(store: MockRecordStore) -> (DriftHandler, Arc<RecordingProducer>) {
        let producer = Arc::new(RecordingProducer::new());
        let handler = DriftHandler::new(
            Arc::new(store),
            PatientPublisher::new(producer.clone()).await,
            MedicationPublisher::new(producer.clone()).await,
        );
        (handler, producer)
    }

    #[test]
    fn test_record_type_parsing() {
        assert_eq!(RecordType::parse("patient"), Some(RecordType::Patient));
        assert_eq!(RecordType::parse("PATIENT"), Some(RecordType::Patient));
        assert_eq!(RecordType::parse("patient-medication"), Some(RecordType::PatientMedication));
        assert_eq!(RecordType::parse(" patient_medication "), Some(RecordType::PatientMedication));
        assert_eq!(RecordType::parse("invoice"), None);
    }

    #[test]
    fn test_notice_fields() {
        assert_eq!(
            DriftNotice::from_message(&json!({"record_type": "patient", "record_id": 7})),
            Some(DriftNotice {
                record_type: "patient".to_string(),
                record_id: 7
            })
        );
        assert_eq!(
            DriftNotice::from_message(&json!({"data": {"record_type": "patient", "record_id": "12"}}))
                .map(|n| n.record_id),
            Some(12)
        );
        assert_eq!(DriftNotice::from_message(&json!({"record_type": "patient"})), None);
        assert_eq!(
            DriftNotice::from_message(&json!({"record_type": "patient", "record_id": "abc"})),
            None
        );
        assert_eq!(
            DriftNotice::from_message(&json!({"record_type": "patient", "record_id": 1.5})),
            None
        );
    }

    #[tokio::test]
    async fn test_missing_record_id_rejected_without_lookup() {
        let mut store = MockRecordStore::new();
        store.expect_find_patient().never();
        let (handler, producer) = handler(store).await;

        let disposition = handler.process(json!({"record_type": "patient"})).await.unwrap();

        assert_eq!(disposition, Disposition::Reject);
        assert!(producer.published().is_empty());
    }

    #[tokio::test]
    async fn test_found_patient_is_republished_once() {
        let mut store = MockRecordStore::new();
        store
            .expect_find_patient()
            .with(eq(7))
            .times(1)
            .returning(|id| Ok(Some(patient(id))));
        let (handler, producer) = handler(store).await;

        let disposition = handler
            .process(json!({"record_type": "patient", "record_id": 7}))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        let published = producer.published();
        assert_eq!(published.len(), 1);

        let event = &published[0];
        assert_eq!(event.exchange, "patient.updates");
        assert_eq!(event.routing_key, "patient.updated.sync");
        assert_eq!(event.message["event_type"], "PATIENT_UPDATED");
        assert_eq!(event.message["patient_id"], 7);
        assert_eq!(event.message["is_sync_event"], true);
        assert_eq!(event.message["sync_reason"], "drift_detected");
        assert_eq!(event.message["old_data"], json!({}));
        assert_eq!(event.message["changes"], json!({}));
        assert_eq!(event.message["new_data"], serde_json::to_value(patient(7)).unwrap());
        assert_eq!(event.message["new_data"]["date_of_birth"], "1980-05-17");
        assert!(event.message["new_data"]["phone"].is_null());
    }

    #[tokio::test]
    async fn test_missing_patient_is_acked_without_publish() {
        let mut store = MockRecordStore::new();
        store.expect_find_patient().returning(|_| Ok(None));
        let (handler, producer) = handler(store).await;

        let disposition = handler
            .process(json!({"record_type": "patient", "record_id": 404}))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert!(producer.published().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_record_type_rejected() {
        let store = MockRecordStore::new();
        let (handler, producer) = handler(store).await;

        let disposition = handler
            .process(json!({"record_type": "invoice", "record_id": 1}))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Reject);
        assert!(producer.published().is_empty());
    }

    #[tokio::test]
    async fn test_medication_republished_with_owner() {
        let mut store = MockRecordStore::new();
        store
            .expect_find_patient_medication()
            .with(eq(31))
            .returning(|id| Ok(Some(medication(id, 7))));
        let (handler, producer) = handler(store).await;

        let disposition = handler
            .process(json!({"record_type": "patient_medication", "record_id": "31"}))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        let event = &producer.published()[0];
        assert_eq!(event.routing_key, "patient.medication.updated.sync");
        assert_eq!(event.message["event_type"], "PATIENT_MEDICATION_UPDATED");
        assert_eq!(event.message["medication_id"], 31);
        assert_eq!(event.message["patient_id"], 7);
    }

    #[tokio::test]
    async fn test_storage_failure_is_an_error() {
        let mut store = MockRecordStore::new();
        store
            .expect_find_patient()
            .returning(|_| Err(PatientsError::Database(DbErr::Custom("connection reset".to_string()))));
        let (handler, _producer) = handler(store).await;

        let result = handler
            .process(json!({"record_type": "patient", "record_id": 7}))
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_refused_sync_publish_requeues() {
        let mut store = MockRecordStore::new();
        store.expect_find_patient().returning(|id| Ok(Some(patient(id))));
        let (handler, producer) = handler(store).await;
        producer.refuse_publishes(true);

        let disposition = handler
            .process(json!({"record_type": "patient", "record_id": 7}))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Requeue);
    }

    fn broker_config() -> BrokerConfig {
        BrokerConfig::new("amqp://memory", "patient-records").with_connect_retries(1)
    }

    #[tokio::test]
    async fn test_consumer_settles_deliveries() {
        let mut store = MockRecordStore::new();
        store.expect_find_patient().returning(|id| Ok(Some(patient(id))));
        store
            .expect_find_patient_medication()
            .returning(|_| Err(PatientsError::Database(DbErr::Custom("timeout".to_string()))));
        let (handler, producer) = handler(store).await;

        let broker = MemoryBroker::new();
        broker.push_delivery(br#"{"record_type": "patient", "record_id": 7}"#.to_vec());
        broker.push_delivery(b"not json".to_vec());
        broker.push_delivery(br#"{"record_type": "invoice", "record_id": 1}"#.to_vec());
        broker.push_delivery(br#"{"record_type": "patient_medication", "record_id": 2}"#.to_vec());
        broker.close_deliveries();

        let consumer = DriftConsumer::build(
            broker.transport(),
            broker_config(),
            DriftSettings::default(),
            Arc::new(handler),
        )
        .await
        .unwrap();

        assert_eq!(
            broker.declared_exchanges(),
            vec![("reconciliation.events".to_string(), ExchangeKind::Topic)]
        );
        assert_eq!(
            broker.bindings(),
            vec![(
                "reconciliation.drift.detected".to_string(),
                "reconciliation.events".to_string(),
                "reconciliation.drift.detected".to_string()
            )]
        );

        // The memory stream ends after the queued deliveries.
        assert!(consumer.start_consuming().await.is_err());

        assert_eq!(
            broker.settlements(),
            vec![
                Disposition::Ack,
                Disposition::Reject,
                Disposition::Reject,
                Disposition::Requeue
            ]
        );
        assert_eq!(producer.published().len(), 1);

        consumer.close().await;
        assert!(!consumer.health_status().connected);
    }

    #[tokio::test]
    async fn test_shutdown_requeues_and_stops() {
        let (handler, producer) = handler(MockRecordStore::new()).await;

        let broker = MemoryBroker::new();
        broker.push_delivery(br#"{"record_type": "patient", "record_id": 7}"#.to_vec());

        let consumer = DriftConsumer::build(
            broker.transport(),
            broker_config(),
            DriftSettings::default(),
            Arc::new(handler),
        )
        .await
        .unwrap();

        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        consumer.attach_shutdown(shutdown);

        assert!(consumer.start_consuming().await.is_ok());
        assert_eq!(broker.settlements(), vec![Disposition::Requeue]);
        assert!(producer.published().is_empty());
        assert!(!consumer.health_status().consuming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_fails_when_broker_unreachable() {
        let broker = MemoryBroker::new();
        broker.fail_next_opens(5);
        let (handler, _producer) = handler(MockRecordStore::new()).await;

        let result = DriftConsumer::build(
            broker.transport(),
            broker_config().with_connect_retries(2),
            DriftSettings::default(),
            Arc::new(handler),
        )
        .await;

        assert!(matches!(result, Err(BrokerError::Connection(_))));
        assert_eq!(broker.open_attempts(), 2);
    }

    #[test]
    fn test_settings_builders() {
        let settings = DriftSettings::default()
            .with_queue("q")
            .with_exchange("x")
            .with_routing_key("k");
        assert_eq!(settings.queue, "q");
        assert_eq!(settings.exchange, "x");
        assert_eq!(settings.routing_key, "k");
    }
}
