//! Worker configuration. Broker settings live in [`broker::BrokerConfig`].

use std::time::Duration;

use core_config::{ConfigError, FromEnv, env_duration_secs, env_or_default, env_parse, env_required};
use domain_patients::DriftSettings;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub health_port: u16,
    pub drift: DriftSettings,
    /// Bound on each shutdown phase (consumers, then producer)
    pub shutdown_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            health_port: 8082,
            drift: DriftSettings::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_health_port(mut self, port: u16) -> Self {
        self.health_port = port;
        self
    }

    pub fn with_drift(mut self, drift: DriftSettings) -> Self {
        self.drift = drift;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl FromEnv for WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new(String::new());
        let drift = &defaults.drift;

        Ok(Self {
            database_url: env_required("DATABASE_URL")?,
            health_port: env_parse("HEALTH_PORT", defaults.health_port)?,
            drift: DriftSettings::default()
                .with_queue(env_or_default("DRIFT_QUEUE", &drift.queue))
                .with_exchange(env_or_default("DRIFT_EXCHANGE", &drift.exchange))
                .with_routing_key(env_or_default("DRIFT_ROUTING_KEY", &drift.routing_key)),
            shutdown_timeout: env_duration_secs("SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 6] = [
        "DATABASE_URL",
        "HEALTH_PORT",
        "DRIFT_QUEUE",
        "DRIFT_EXCHANGE",
        "DRIFT_ROUTING_KEY",
        "SHUTDOWN_TIMEOUT_SECS",
    ];

    fn unset_all() -> Vec<(&'static str, Option<&'static str>)> {
        VARS.iter().map(|key| (*key, None)).collect()
    }

    #[test]
    fn test_database_url_required() {
        temp_env::with_vars(unset_all(), || {
            let result = WorkerConfig::from_env();
            assert!(matches!(result, Err(ConfigError::MissingEnvVar(key)) if key == "DATABASE_URL"));
        });
    }

    #[test]
    fn test_defaults() {
        let mut vars = unset_all();
        vars[0] = ("DATABASE_URL", Some("postgres://localhost/records"));

        temp_env::with_vars(vars, || {
            let config = WorkerConfig::from_env().unwrap();
            assert_eq!(config.database_url, "postgres://localhost/records");
            assert_eq!(config.health_port, 8082);
            assert_eq!(config.drift, DriftSettings::default());
            assert_eq!(config.drift.queue, "reconciliation.drift.detected");
            assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        });
    }

    #[test]
    fn test_overrides() {
        temp_env::with_vars(
            [
                ("DATABASE_URL", Some("postgres://db/records")),
                ("HEALTH_PORT", Some("9000")),
                ("DRIFT_QUEUE", Some("drift.q")),
                ("DRIFT_EXCHANGE", Some("recon")),
                ("DRIFT_ROUTING_KEY", Some("recon.drift")),
                ("SHUTDOWN_TIMEOUT_SECS", Some("5")),
            ],
            || {
                let config = WorkerConfig::from_env().unwrap();
                assert_eq!(config.health_port, 9000);
                assert_eq!(config.drift.queue, "drift.q");
                assert_eq!(config.drift.exchange, "recon");
                assert_eq!(config.drift.routing_key, "recon.drift");
                assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
            },
        );
    }

    #[test]
    fn test_bad_port_is_an_error() {
        let mut vars = unset_all();
        vars[0] = ("DATABASE_URL", Some("postgres://db/records"));
        vars[1] = ("HEALTH_PORT", Some("not-a-port"));

        temp_env::with_vars(vars, || {
            assert!(matches!(
                WorkerConfig::from_env(),
                Err(ConfigError::ParseError { .. })
            ));
        });
    }

    #[test]
    fn test_builders() {
        let config = WorkerConfig::new("postgres://x")
            .with_health_port(1)
            .with_shutdown_timeout(Duration::from_secs(2))
            .with_drift(DriftSettings::default().with_queue("q"));
        assert_eq!(config.health_port, 1);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(config.drift.queue, "q");
    }
}
