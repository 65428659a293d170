use async_trait::async_trait;

use crate::entity::{patient, patient_medication};
use crate::error::PatientsResult;

/// Read access to the records that can be republished on drift.
///
/// `Ok(None)` means the record does not exist; `Err` is a storage failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_patient(&self, id: i64) -> PatientsResult<Option<patient::Model>>;

    async fn find_patient_medication(&self, id: i64) -> PatientsResult<Option<patient_medication::Model>>;
}
