//! Operator configuration
//!
//! Every setting is a command-line flag with an environment fallback.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::backoff::Backoff;
use crate::error::{Error, Result};

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Command-line + environment configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Barman Cloud ObjectStore operator")]
pub struct OperatorConfig {
    /// Port serving /metrics, /healthz and /readyz
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    /// Number of ObjectStores reconciled in parallel
    #[arg(long, env = "CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// Deadline of a single API call, in seconds
    #[arg(long, env = "STORE_TIMEOUT_SECS", default_value_t = 10)]
    pub store_timeout_secs: u64,

    /// First retry delay, in milliseconds
    #[arg(long, env = "BACKOFF_INITIAL_MS", default_value_t = 500)]
    pub backoff_initial_ms: u64,

    /// Retry delay cap, in seconds
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Random fraction added to each retry delay (0.0 - 1.0)
    #[arg(long, env = "BACKOFF_JITTER", default_value_t = 0.1)]
    pub jitter: f64,

    /// Periodic re-reconcile of converged ObjectStores, in seconds
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 600)]
    pub resync_interval_secs: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::config("concurrency must be at least 1"));
        }
        if self.store_timeout_secs == 0 {
            return Err(Error::config("store timeout must be positive"));
        }
        if self.backoff_initial_ms == 0 {
            return Err(Error::config("initial backoff must be positive"));
        }
        if self.backoff_initial() > self.backoff_max() {
            return Err(Error::config(format!(
                "initial backoff {:?} exceeds maximum {:?}",
                self.backoff_initial(),
                self.backoff_max()
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::config(format!(
                "jitter must be between 0.0 and 1.0, got {}",
                self.jitter
            )));
        }
        if self.resync_interval_secs == 0 {
            return Err(Error::config("resync interval must be positive"));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: self.backoff_initial(),
            max: self.backoff_max(),
            jitter: self.jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OperatorConfig::try_parse_from(["barman-cloud-operator"]).unwrap();
        assert_eq!(config.metrics_port, 8080);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.store_timeout(), Duration::from_secs(10));
        assert_eq!(config.backoff().initial, Duration::from_millis(500));
        assert_eq!(config.resync_interval(), Duration::from_secs(600));
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn flags_override_defaults() {
        let config = OperatorConfig::try_parse_from([
            "barman-cloud-operator",
            "--concurrency",
            "8",
            "--log-format",
            "text",
        ])
        .unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config =
            OperatorConfig::try_parse_from(["barman-cloud-operator", "--concurrency", "0"]).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config =
            OperatorConfig::try_parse_from(["barman-cloud-operator", "--jitter", "1.5"]).unwrap();
        assert!(config.validate().is_err());

        let config = OperatorConfig::try_parse_from([
            "barman-cloud-operator",
            "--backoff-initial-ms",
            "600000",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }
}
