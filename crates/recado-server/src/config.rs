use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use recado_gateway::HttpGatewayConfig;
use recado_worker::{ReconnectPolicy, ServiceConfig};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

/// Process configuration, read from `RECADO_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    /// `None` puts the database in the platform data directory.
    pub db_path: Option<PathBuf>,
    pub gateway: HttpGatewayConfig,
    pub service: ServiceConfig,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = ServiceConfig::default();

        let gateway_timeout = secs(&get, "RECADO_GATEWAY_TIMEOUT_SECS", 10)?;
        let qr_ttl = secs(&get, "RECADO_QR_TTL_SECS", 20)?;

        let gateway = HttpGatewayConfig {
            base_url: get("RECADO_GATEWAY_URL").ok_or(ConfigError::Missing("RECADO_GATEWAY_URL"))?,
            timeout: gateway_timeout,
            qr_ttl,
        };

        let service = ServiceConfig {
            poll_interval: secs(&get, "RECADO_POLL_INTERVAL_SECS", 3)?,
            max_qr_attempts: parse(&get, "RECADO_MAX_QR_ATTEMPTS", defaults.max_qr_attempts)?,
            qr_ttl,
            gateway_timeout,
            reconnect_policy: parse(&get, "RECADO_RECONNECT_POLICY", ReconnectPolicy::default())?,
            public_url: get("RECADO_PUBLIC_URL"),
            webhook_secret: get("RECADO_WEBHOOK_SECRET"),
            cache_ttl: secs(&get, "RECADO_CACHE_TTL_SECS", 30)?,
            cache_capacity: parse(&get, "RECADO_CACHE_CAPACITY", defaults.cache_capacity)?,
            thread_page_size: defaults.thread_page_size,
        };
        if service.max_qr_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RECADO_MAX_QR_ATTEMPTS",
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            bind: parse(&get, "RECADO_BIND", SocketAddr::from(([127, 0, 0, 1], 8080)))?,
            db_path: get("RECADO_DB_PATH").map(PathBuf::from),
            gateway,
            service,
            log_json: parse(&get, "RECADO_LOG_JSON", false)?,
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            message: e.to_string(),
        }),
    }
}

fn secs(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let value = parse(get, key, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(value))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup(&[("RECADO_GATEWAY_URL", "http://gw:3000")])).unwrap();

        assert_eq!(config.bind, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(config.gateway.base_url, "http://gw:3000");
        assert_eq!(config.service.poll_interval, Duration::from_secs(3));
        assert_eq!(config.service.max_qr_attempts, 5);
        assert_eq!(config.service.reconnect_policy, ReconnectPolicy::RetryConnect);
        assert!(config.db_path.is_none());
        assert!(!config.log_json);
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("RECADO_GATEWAY_URL", "http://gw:3000"),
            ("RECADO_BIND", "0.0.0.0:9000"),
            ("RECADO_RECONNECT_POLICY", "fresh-credentials"),
            ("RECADO_WEBHOOK_SECRET", "s3cret"),
            ("RECADO_QR_TTL_SECS", "45"),
            ("RECADO_LOG_JSON", "true"),
        ]))
        .unwrap();

        assert_eq!(config.bind.port(), 9000);
        assert_eq!(
            config.service.reconnect_policy,
            ReconnectPolicy::RequireFreshCredentials
        );
        assert_eq!(config.service.webhook_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.gateway.qr_ttl, Duration::from_secs(45));
        assert_eq!(config.service.qr_ttl, Duration::from_secs(45));
        assert!(config.log_json);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            Config::from_lookup(lookup(&[])).unwrap_err(),
            ConfigError::Missing("RECADO_GATEWAY_URL")
        );

        let err = Config::from_lookup(lookup(&[
            ("RECADO_GATEWAY_URL", "http://gw:3000"),
            ("RECADO_POLL_INTERVAL_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "RECADO_POLL_INTERVAL_SECS",
                ..
            }
        ));

        let err = Config::from_lookup(lookup(&[
            ("RECADO_GATEWAY_URL", "http://gw:3000"),
            ("RECADO_MAX_QR_ATTEMPTS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
