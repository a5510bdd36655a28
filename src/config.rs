use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::model::MINUTE_MS;
use crate::notify::NotificationConfig;
use crate::refund::TieredRefundPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{0}")]
    Inconsistent(&'static str),
}

/// Server settings, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub user: String,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub notifications: NotificationConfig,
    pub refunds: TieredRefundPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            user: "slotbook".into(),
            password: "slotbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            notifications: NotificationConfig::default(),
            refunds: TieredRefundPolicy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let reminder_lead_minutes: Option<i64> = parsed(&lookup, "SLOTBOOK_REMINDER_LEAD_MINUTES")?;

        let config = Config {
            port: parsed(&lookup, "SLOTBOOK_PORT")?.unwrap_or(defaults.port),
            bind: lookup("SLOTBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("SLOTBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            user: lookup("SLOTBOOK_USER").unwrap_or(defaults.user),
            password: lookup("SLOTBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "SLOTBOOK_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD")?.unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "SLOTBOOK_METRICS_PORT")?,
            tls_cert: lookup("SLOTBOOK_TLS_CERT"),
            tls_key: lookup("SLOTBOOK_TLS_KEY"),
            notifications: NotificationConfig {
                reminder_lead_ms: reminder_lead_minutes
                    .map_or(defaults.notifications.reminder_lead_ms, |m| m * MINUTE_MS),
                subject_prefix: lookup("SLOTBOOK_SUBJECT_PREFIX"),
            },
            refunds: TieredRefundPolicy {
                full_refund_hours: parsed(&lookup, "SLOTBOOK_REFUND_FULL_HOURS")?
                    .unwrap_or(defaults.refunds.full_refund_hours),
                partial_refund_hours: parsed(&lookup, "SLOTBOOK_REFUND_PARTIAL_HOURS")?
                    .unwrap_or(defaults.refunds.partial_refund_hours),
                partial_percentage: parsed(&lookup, "SLOTBOOK_REFUND_PARTIAL_PERCENT")?
                    .unwrap_or(defaults.refunds.partial_percentage),
            },
        };
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::Inconsistent(
                "both SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set, or neither",
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Inconsistent("SLOTBOOK_MAX_CONNECTIONS must be positive"));
        }
        if self.notifications.reminder_lead_ms <= 0 {
            return Err(ConfigError::Inconsistent("SLOTBOOK_REMINDER_LEAD_MINUTES must be positive"));
        }
        if self.refunds.partial_percentage > 100 {
            return Err(ConfigError::Inconsistent("SLOTBOOK_REFUND_PARTIAL_PERCENT must be at most 100"));
        }
        if self.refunds.partial_refund_hours > self.refunds.full_refund_hours {
            return Err(ConfigError::Inconsistent(
                "SLOTBOOK_REFUND_PARTIAL_HOURS must not exceed SLOTBOOK_REFUND_FULL_HOURS",
            ));
        }
        Ok(())
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.port, 5433);
        assert_eq!(config.user, "slotbook");
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.notifications.reminder_lead_ms, 24 * 60 * MINUTE_MS);
        assert_eq!(config.refunds.full_refund_hours, 48);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = from_pairs(&[
            ("SLOTBOOK_PORT", "6543"),
            ("SLOTBOOK_DATA_DIR", "/var/lib/slotbook"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
            ("SLOTBOOK_REMINDER_LEAD_MINUTES", "90"),
            ("SLOTBOOK_REFUND_PARTIAL_PERCENT", "25"),
        ])
        .unwrap();
        assert_eq!(config.port, 6543);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/slotbook"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.notifications.reminder_lead_ms, 90 * MINUTE_MS);
        assert_eq!(config.refunds.partial_percentage, 25);
    }

    #[test]
    fn garbage_is_an_error() {
        let err = from_pairs(&[("SLOTBOOK_PORT", "lots")]).unwrap_err();
        assert!(err.to_string().contains("SLOTBOOK_PORT"));
    }

    #[test]
    fn tls_needs_both_files() {
        assert!(from_pairs(&[("SLOTBOOK_TLS_CERT", "cert.pem")]).is_err());
        assert!(from_pairs(&[("SLOTBOOK_TLS_CERT", "cert.pem"), ("SLOTBOOK_TLS_KEY", "key.pem")]).is_ok());
    }

    #[test]
    fn refund_tiers_must_nest() {
        assert!(from_pairs(&[("SLOTBOOK_REFUND_PARTIAL_HOURS", "72")]).is_err());
        assert!(from_pairs(&[("SLOTBOOK_REFUND_PARTIAL_PERCENT", "150")]).is_err());
    }
}
