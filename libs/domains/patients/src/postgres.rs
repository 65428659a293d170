use async_trait::async_trait;
use broker::retry::{RetryPolicy, retry_with_backoff};
use sea_orm::{Database, DatabaseConnection, EntityTrait, PrimaryKeyTrait, TransactionTrait};
use tracing::{info, warn};

use crate::entity::{patient, patient_medication};
use crate::error::PatientsResult;
use crate::repository::RecordStore;

/// Connect to Postgres, retrying per `policy` while the database comes up.
pub async fn connect(url: &str, policy: &RetryPolicy) -> PatientsResult<DatabaseConnection> {
    let db = retry_with_backoff(policy, |attempt| async move {
        Database::connect(url).await.inspect_err(|e| {
            warn!(attempt, error = %e, "Database connection attempt failed");
        })
    })
    .await?;

    info!("Connected to database");
    Ok(db)
}

/// Postgres-backed record lookups, each in its own transaction.
pub struct PgRecordStore {
    db: DatabaseConnection,
}

impl PgRecordStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Look up by primary key inside a transaction that is committed on success and
    /// rolled back on error.
    async fn find_by_id<E>(&self, id: i64) -> PatientsResult<Option<E::Model>>
    where
        E: EntityTrait,
        <E::PrimaryKey as PrimaryKeyTrait>::ValueType: From<i64>,
    {
        let txn = self.db.begin().await?;

        match E::find_by_id(id).one(&txn).await {
            Ok(model) => {
                txn.commit().await?;
                Ok(model)
            }
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    warn!(error = %rollback, "Rollback failed after lookup error");
                }
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_patient(&self, id: i64) -> PatientsResult<Option<patient::Model>> {
        self.find_by_id::<patient::Entity>(id).await
    }

    async fn find_patient_medication(&self, id: i64) -> PatientsResult<Option<patient_medication::Model>> {
        self.find_by_id::<patient_medication::Entity>(id).await
    }
}
