#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use bon::Builder;
use secrecy::SecretString;

const DEFAULT_CONNECTION_WATCHDOG_DURATION: Duration = Duration::from_secs(15 * 60);
const DEFAULT_PING_WATCHDOG_DURATION: Duration = Duration::from_secs(32);
const DEFAULT_CONNECT_WAIT_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_BASE_DELAY_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_MAX_DELAY_DURATION: Duration = Duration::from_secs(300);
const DEFAULT_RATE_LIMIT_FLOOR_DURATION: Duration = Duration::from_secs(60);
/// HTTP 429 Too Many Requests
const DEFAULT_RATE_LIMIT_STATUS: u16 = 429;

/// Configuration for the push channel connection.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Silence after which the connection is considered dead and re-established
    pub connection_watchdog: Duration,
    /// Silence after which a keepalive PING is sent
    pub ping_watchdog: Duration,
    /// How long [`crate::ws::ConnectionManager::send_command`] waits for a connection
    pub connect_wait: Duration,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
    /// Handshake headers identifying the client
    pub headers: Headers,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_watchdog: DEFAULT_CONNECTION_WATCHDOG_DURATION,
            ping_watchdog: DEFAULT_PING_WATCHDOG_DURATION,
            connect_wait: DEFAULT_CONNECT_WAIT_DURATION,
            reconnect: ReconnectConfig::default(),
            headers: Headers::default(),
        }
    }
}

/// Configuration for automatic reconnection behavior.
///
/// The delay before attempt `n` is `min(base_delay * n², max_delay)`, raised to at least
/// `rate_limit_floor` while the service is rate limiting the account.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Minimum delay while rate limited, regardless of attempt count
    pub rate_limit_floor: Duration,
    /// Handshake HTTP statuses that mark the account as rate limited
    pub rate_limit_statuses: Vec<u16>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None, // Infinite reconnection by default
            base_delay: DEFAULT_BASE_DELAY_DURATION,
            max_delay: DEFAULT_MAX_DELAY_DURATION,
            rate_limit_floor: DEFAULT_RATE_LIMIT_FLOOR_DURATION,
            rate_limit_statuses: vec![DEFAULT_RATE_LIMIT_STATUS],
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub fn is_rate_limit_status(&self, status: u16) -> bool {
        self.rate_limit_statuses.contains(&status)
    }
}

/// Client identification sent with every handshake.
///
/// # Example
///
/// ```
/// use vehicle_cloud_link::ws::config::Headers;
///
/// let headers = Headers::builder()
///     .locale("de-DE")
///     .application_version("1.61.0")
///     .build();
/// assert_eq!(headers.locale, "de-DE");
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Headers {
    #[builder(default = "en-GB".to_owned(), into)]
    pub locale: String,
    #[builder(default = "mycar".to_owned(), into)]
    pub application_name: String,
    #[builder(default = "1.61.0".to_owned(), into)]
    pub application_version: String,
    #[builder(default = "android".to_owned(), into)]
    pub os_name: String,
    #[builder(default = "14".to_owned(), into)]
    pub os_version: String,
    #[builder(default = "2.132.2".to_owned(), into)]
    pub sdk_version: String,
    #[builder(default = concat!("vehicle-cloud-link/", env!("CARGO_PKG_VERSION")).to_owned(), into)]
    pub user_agent: String,
    /// API gateway key, sent as `Ocp-Apim-Subscription-Key` when present
    pub subscription_key: Option<SecretString>,
    /// Additional headers appended verbatim
    #[builder(default)]
    pub extra: Vec<(String, String)>,
}

impl Default for Headers {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_watchdogs() {
        let config = Config::default();

        assert_eq!(config.ping_watchdog, Duration::from_secs(32));
        assert!(
            config.connection_watchdog > config.ping_watchdog,
            "connection watchdog must outlast the ping watchdog"
        );
    }

    #[test]
    fn default_rate_limit_is_429_with_one_minute_floor() {
        let config = ReconnectConfig::default();

        assert!(config.is_rate_limit_status(429), "429 should rate limit");
        assert!(!config.is_rate_limit_status(503), "503 should not rate limit");
        assert_eq!(config.rate_limit_floor, Duration::from_secs(60));
    }

    #[test]
    fn headers_builder_overrides_defaults() {
        let headers = Headers::builder()
            .locale("de-DE")
            .extra(vec![("X-Debug".to_owned(), "1".to_owned())])
            .build();

        assert_eq!(headers.locale, "de-DE");
        assert_eq!(headers.os_name, "android");
        assert_eq!(headers.extra.len(), 1);
        assert!(headers.subscription_key.is_none(), "no key by default");
    }
}
