//! Broker error types and error categorization
//!
//! Errors are categorized to decide between retrying and giving up:
//! - **Transient**: connection/channel trouble, worth a reconnect and another attempt
//! - **Permanent**: bad input or bad configuration, retrying cannot help

use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Permanent,
}

/// Broker errors
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Could not establish (or re-establish) the connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Channel-level failure on an open connection
    #[error("Channel error: {0}")]
    Channel(String),

    /// Exchange/queue declaration or binding failed
    #[error("Topology error: {0}")]
    Topology(String),

    /// Broker refused or failed to confirm a publish
    #[error("Publish error: {0}")]
    Publish(String),

    /// Payload could not be encoded/decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A message handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// Producer is not running
    #[error("Producer is not running")]
    NotRunning,

    #[error("Consumer '{0}' is not registered")]
    ConsumerNotRegistered(String),

    #[error("Consumer '{0}' is already running")]
    ConsumerAlreadyRunning(String),

    #[error("Configuration error: {0}")]
    Config(#[from] core_config::ConfigError),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl BrokerError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            BrokerError::Connection(_)
            | BrokerError::Channel(_)
            | BrokerError::Topology(_)
            | BrokerError::Publish(_)
            | BrokerError::Handler(_) => ErrorCategory::Transient,
            BrokerError::Serialization(_)
            | BrokerError::NotRunning
            | BrokerError::ConsumerNotRegistered(_)
            | BrokerError::ConsumerAlreadyRunning(_)
            | BrokerError::Config(_)
            | BrokerError::Shutdown => ErrorCategory::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) | lapin::Error::ChannelsLimitReached => {
                BrokerError::Channel(err.to_string())
            }
            _ => BrokerError::Connection(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_trouble_is_transient() {
        assert!(BrokerError::Connection("refused".into()).is_transient());
        assert!(BrokerError::Publish("nack".into()).is_transient());
        assert!(BrokerError::Topology("404".into()).is_transient());
    }

    #[test]
    fn test_bad_input_is_permanent() {
        let err: BrokerError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert_eq!(BrokerError::NotRunning.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_config_error_converts() {
        let err: BrokerError = core_config::ConfigError::MissingEnvVar("AMQP_URL".into()).into();
        assert!(err.to_string().contains("AMQP_URL"));
        assert!(!err.is_transient());
    }
}
