use std::time::Duration;

/// What happens when a connect is requested for an instance sitting in `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// Issue a new session with the stored credentials.
    #[default]
    RetryConnect,
    /// Refuse until the credentials are updated, which resets the instance
    /// to `disconnected`.
    RequireFreshCredentials,
}

impl std::str::FromStr for ReconnectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" | "retry-connect" => Ok(Self::RetryConnect),
            "fresh-credentials" | "require-fresh-credentials" => {
                Ok(Self::RequireFreshCredentials)
            }
            other => Err(format!("unknown reconnect policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Delay between status polls while an instance is pairing.
    pub poll_interval: Duration,
    /// Total QR codes issued for one connect request before giving up.
    pub max_qr_attempts: u32,
    /// Used when the gateway pushes a QR without an expiry.
    pub qr_ttl: Duration,
    /// Upper bound for any single gateway call.
    pub gateway_timeout: Duration,
    pub reconnect_policy: ReconnectPolicy,
    /// Base URL this service is reachable at; default webhook URLs hang off it.
    pub public_url: Option<String>,
    /// Webhook secret for instances that do not configure their own.
    pub webhook_secret: Option<String>,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub thread_page_size: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_qr_attempts: 5,
            qr_ttl: Duration::from_secs(20),
            gateway_timeout: Duration::from_secs(10),
            reconnect_policy: ReconnectPolicy::default(),
            public_url: None,
            webhook_secret: None,
            cache_ttl: Duration::from_secs(30),
            cache_capacity: 512,
            thread_page_size: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reconnect_policy() {
        assert_eq!("retry".parse(), Ok(ReconnectPolicy::RetryConnect));
        assert_eq!(
            " Fresh-Credentials ".parse(),
            Ok(ReconnectPolicy::RequireFreshCredentials)
        );
        assert!("sometimes".parse::<ReconnectPolicy>().is_err());
    }
}
