use broker::BrokerError;
use sea_orm::DbErr;

pub type PatientsResult<T> = Result<T, PatientsError>;

#[derive(Debug, thiserror::Error)]
pub enum PatientsError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}
