use crate::constants::DEFAULT_COLLECTIONS;
use crate::errors::ConfigError;
use std::time::Duration;

type Result<T> = std::result::Result<T, ConfigError>;

/// HTTP client timeout configuration.
///
/// Upper bound for any single request made by the shared HTTP client.
#[derive(Clone, Debug)]
pub struct HttpClientTimeout(Duration);

/// Timeout applied around every external call made during evaluation.
///
/// A call that exceeds this is treated as the component being unavailable.
#[derive(Clone, Debug)]
pub struct ExternalCallTimeout(Duration);

/// Maximum number of entries held by an in-memory cache.
#[derive(Clone, Debug)]
pub struct CacheSize(usize);

impl TryFrom<String> for CacheSize {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        let size = value
            .parse::<usize>()
            .map_err(|_| ConfigError::InvalidValue {
                name: "cache size".to_string(),
                value: value.clone(),
            })?;

        if size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "cache size".to_string(),
                value,
            });
        }

        Ok(Self(size))
    }
}

impl AsRef<usize> for CacheSize {
    fn as_ref(&self) -> &usize {
        &self.0
    }
}

/// Cache entry time-to-live in minutes.
#[derive(Clone, Debug)]
pub struct CacheTtlMinutes(u32);

impl TryFrom<String> for CacheTtlMinutes {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        let minutes = value
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidValue {
                name: "cache ttl minutes".to_string(),
                value: value.clone(),
            })?;

        if minutes == 0 {
            return Err(ConfigError::InvalidValue {
                name: "cache ttl minutes".to_string(),
                value,
            });
        }

        Ok(Self(minutes))
    }
}

impl CacheTtlMinutes {
    pub fn to_duration(&self) -> Duration {
        Duration::from_secs(self.0 as u64 * 60)
    }

    pub fn to_seconds(&self) -> i64 {
        (self.0 as i64) * 60
    }
}

impl AsRef<u32> for CacheTtlMinutes {
    fn as_ref(&self) -> &u32 {
        &self.0
    }
}

/// DID used as `createdBy` on moderation events this service emits.
#[derive(Clone, Debug)]
pub struct ModeratorDid(String);

impl TryFrom<String> for ModeratorDid {
    type Error = ConfigError;
    fn try_from(value: String) -> Result<Self> {
        if value.is_empty() {
            return Err(ConfigError::InvalidDid {
                did: "(empty)".to_string(),
            });
        }
        if !value.starts_with("did:") {
            return Err(ConfigError::InvalidDid { did: value });
        }
        Ok(Self(value))
    }
}

impl ModeratorDid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Jetstream consumer configuration
#[derive(Clone, Debug)]
pub struct JetstreamConfig {
    /// Jetstream hostname
    pub hostname: String,
    /// Collections to subscribe to (empty means all)
    pub collections: Vec<String>,
    /// Cursor storage path (file-based)
    pub cursor_path: Option<String>,
    /// Number of per-subject shards evaluating events concurrently
    pub worker_threads: usize,
    /// How often the processed cursor is persisted
    pub cursor_write_interval: Duration,
}

impl JetstreamConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidValue {
                name: "JETSTREAM_WORKER_THREADS".to_string(),
                value: "0".to_string(),
            });
        }

        if self.hostname.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "JETSTREAM_HOSTNAME".to_string(),
                value: "(empty)".to_string(),
            });
        }

        if self.collections.is_empty() {
            tracing::warn!("No collections configured for Jetstream - will receive all events");
        }

        tracing::info!(
            hostname = %self.hostname,
            worker_threads = self.worker_threads,
            cursor_write_interval_secs = self.cursor_write_interval.as_secs(),
            "Jetstream configured"
        );

        Ok(())
    }

    pub fn from_env() -> Result<Self> {
        let hostname = default_env("JETSTREAM_HOSTNAME", "jetstream2.us-east.bsky.network");

        let collections: Vec<String> = {
            let value = optional_env("JETSTREAM_COLLECTIONS");
            if value.is_empty() {
                DEFAULT_COLLECTIONS.iter().map(|s| s.to_string()).collect()
            } else {
                split_list(&value, ',')
            }
        };

        let cursor_path = std::env::var("JETSTREAM_CURSOR_PATH").ok();

        let worker_threads = parse_env("JETSTREAM_WORKER_THREADS", "4")?;

        let cursor_write_interval =
            Duration::from_secs(parse_env("CURSOR_WRITE_INTERVAL_SECONDS", "5")?);

        let config = Self {
            hostname,
            collections,
            cursor_path,
            worker_threads,
            cursor_write_interval,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Moderation service (Ozone) configuration.
///
/// When `host` is unset the engine runs without private account facts and
/// moderation writes are logged instead of applied.
#[derive(Clone, Debug)]
pub struct OzoneConfig {
    pub host: Option<String>,
    pub admin_token: Option<String>,
    pub moderator_did: Option<ModeratorDid>,
    pub poll_interval: Duration,
}

impl OzoneConfig {
    pub fn validate(&self) -> Result<()> {
        match (&self.host, &self.admin_token) {
            (Some(host), None) => {
                return Err(ConfigError::EnvVarRequired {
                    var_name: format!("OZONE_ADMIN_TOKEN (required with OZONE_HOST {host})"),
                });
            }
            (Some(host), Some(_)) => {
                if !host.starts_with("http://") && !host.starts_with("https://") {
                    return Err(ConfigError::InvalidUrl {
                        name: "OZONE_HOST".to_string(),
                        value: host.clone(),
                    });
                }
                tracing::info!(
                    host = %host,
                    poll_interval_secs = self.poll_interval.as_secs(),
                    "Ozone moderation service configured"
                );
            }
            (None, _) => {
                tracing::warn!(
                    "OZONE_HOST not set - private account facts and moderation writes are disabled"
                );
            }
        }
        Ok(())
    }

    pub fn from_env() -> Result<Self> {
        let host = non_empty(optional_env("OZONE_HOST")).map(|h| h.trim_end_matches('/').to_string());
        let admin_token = non_empty(optional_env("OZONE_ADMIN_TOKEN"));
        let moderator_did = match non_empty(optional_env("OZONE_MODERATOR_DID")) {
            Some(value) => Some(value.try_into()?),
            None => None,
        };
        let poll_interval = Duration::from_secs(parse_env("OZONE_POLL_SECONDS", "10")?);

        let config = Self {
            host,
            admin_token,
            moderator_did,
            poll_interval,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Retry policy for effect application.
///
/// Delays double per attempt starting at `retry_delay_ms` and never exceed
/// `max_retry_delay_ms`.
#[derive(Clone, Debug)]
pub struct ApplyConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

/// Upper bound for `APPLY_MAX_RETRIES`; retries run inside a shard worker.
pub const MAX_APPLY_RETRIES: u32 = 10;

/// Upper bound for `APPLY_MAX_RETRY_DELAY_MS`.
pub const MAX_APPLY_RETRY_DELAY_MS: u64 = 30_000;

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 250,
            max_retry_delay_ms: 5_000,
        }
    }
}

impl ApplyConfig {
    /// Wait before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.retry_delay_ms
                .saturating_mul(factor)
                .min(self.max_retry_delay_ms),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries > MAX_APPLY_RETRIES {
            return Err(ConfigError::InvalidValue {
                name: "APPLY_MAX_RETRIES".to_string(),
                value: self.max_retries.to_string(),
            });
        }
        if self.max_retry_delay_ms > MAX_APPLY_RETRY_DELAY_MS
            || self.retry_delay_ms > self.max_retry_delay_ms
        {
            return Err(ConfigError::InvalidValue {
                name: "APPLY_MAX_RETRY_DELAY_MS".to_string(),
                value: self.max_retry_delay_ms.to_string(),
            });
        }
        tracing::info!(
            max_retries = self.max_retries,
            retry_delay_ms = self.retry_delay_ms,
            max_retry_delay_ms = self.max_retry_delay_ms,
            "Effect retry policy configured"
        );
        Ok(())
    }

    pub fn from_env() -> Result<Self> {
        let config = Self {
            max_retries: parse_env("APPLY_MAX_RETRIES", "3")?,
            retry_delay_ms: parse_env("APPLY_RETRY_DELAY_MS", "250")?,
            max_retry_delay_ms: parse_env("APPLY_MAX_RETRY_DELAY_MS", "5000")?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Where rules and named sets come from.
#[derive(Clone, Debug)]
pub struct PolicyConfig {
    /// Built-in rule set name, used when no rules file is configured
    pub ruleset: String,
    pub rules_config_path: Option<String>,
    pub sets_json_path: Option<String>,
    pub reload_interval: Duration,
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rules_config_path.is_none() && self.ruleset.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "RULESET".to_string(),
                value: "(empty)".to_string(),
            });
        }
        if self.sets_json_path.is_none() {
            tracing::warn!("SETS_JSON_PATH not set - all named sets are empty");
        }
        tracing::info!(
            ruleset = %self.ruleset,
            rules_config_path = ?self.rules_config_path,
            sets_json_path = ?self.sets_json_path,
            "Policy sources configured"
        );
        Ok(())
    }

    pub fn from_env() -> Result<Self> {
        let config = Self {
            ruleset: default_env("RULESET", "default"),
            rules_config_path: non_empty(optional_env("RULES_CONFIG_PATH")),
            sets_json_path: non_empty(optional_env("SETS_JSON_PATH")),
            reload_interval: Duration::from_secs(parse_env("CONFIG_RELOAD_SECONDS", "60")?),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Statsd metrics configuration
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    pub adapter: String,
    pub statsd_host: Option<String>,
    pub statsd_bind: String,
    pub prefix: String,
    pub tags: Option<String>,
}

impl MetricsConfig {
    pub fn from_env() -> Self {
        Self {
            adapter: default_env("METRICS_ADAPTER", "noop"),
            statsd_host: non_empty(optional_env("METRICS_STATSD_HOST")),
            statsd_bind: default_env("METRICS_STATSD_BIND", "[::]:0"),
            prefix: default_env("METRICS_PREFIX", "skywarden"),
            tags: non_empty(optional_env("METRICS_TAGS")),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub version: String,
    pub user_agent: String,
    pub plc_hostname: String,
    pub appview_host: String,
    pub http_client_timeout: HttpClientTimeout,
    pub external_call_timeout: ExternalCallTimeout,
    pub redis_url: Option<String>,
    pub redis_cursor_key: String,
    pub redis_cursor_ttl_seconds: u64,
    pub account_cache_size: CacheSize,
    pub account_cache_ttl_minutes: CacheTtlMinutes,
    pub identity_cache_size: CacheSize,
    pub identity_cache_ttl_minutes: CacheTtlMinutes,
    pub slack_webhook_url: Option<String>,
    pub jetstream: JetstreamConfig,
    pub ozone: OzoneConfig,
    pub apply: ApplyConfig,
    pub policy: PolicyConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Creates a new configuration instance by loading values from environment variables.
    ///
    /// No variable is strictly required; defaults point at the public Bluesky
    /// network. Moderation writes need `OZONE_HOST` and `OZONE_ADMIN_TOKEN`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a value is present but invalid (wrong
    /// format, out of range, malformed URL or DID).
    pub fn new() -> Result<Self> {
        let version = version()?;
        let default_user_agent = format!("skywarden/{}", version);
        let user_agent = default_env("USER_AGENT", &default_user_agent);
        let plc_hostname = default_env("PLC_HOSTNAME", "plc.directory");

        let appview_host = default_env("APPVIEW_HOST", "https://api.bsky.app")
            .trim_end_matches('/')
            .to_string();
        if !appview_host.starts_with("http://") && !appview_host.starts_with("https://") {
            return Err(ConfigError::InvalidUrl {
                name: "APPVIEW_HOST".to_string(),
                value: appview_host,
            });
        }

        let http_client_timeout: HttpClientTimeout =
            default_env("HTTP_CLIENT_TIMEOUT", "8").try_into()?;
        let external_call_timeout: ExternalCallTimeout =
            default_env("EXTERNAL_CALL_TIMEOUT_MS", "5000").try_into()?;

        let redis_url = non_empty(optional_env("REDIS_URL"));
        let redis_cursor_key = default_env("REDIS_CURSOR_KEY", "skywarden:jetstream:cursor");
        let redis_cursor_ttl_seconds = parse_env("REDIS_CURSOR_TTL_SECONDS", "86400")?;

        let account_cache_size: CacheSize = default_env("ACCOUNT_CACHE_SIZE", "50000").try_into()?;
        let account_cache_ttl_minutes: CacheTtlMinutes =
            default_env("ACCOUNT_CACHE_TTL_MINUTES", "30").try_into()?;
        let identity_cache_size: CacheSize =
            default_env("IDENTITY_CACHE_SIZE", "10000").try_into()?;
        let identity_cache_ttl_minutes: CacheTtlMinutes =
            default_env("IDENTITY_CACHE_TTL_MINUTES", "1440").try_into()?;

        let slack_webhook_url = non_empty(optional_env("SLACK_WEBHOOK_URL"));

        Ok(Self {
            version,
            user_agent,
            plc_hostname,
            appview_host,
            http_client_timeout,
            external_call_timeout,
            redis_url,
            redis_cursor_key,
            redis_cursor_ttl_seconds,
            account_cache_size,
            account_cache_ttl_minutes,
            identity_cache_size,
            identity_cache_ttl_minutes,
            slack_webhook_url,
            jetstream: JetstreamConfig::from_env()?,
            ozone: OzoneConfig::from_env()?,
            apply: ApplyConfig::from_env()?,
            policy: PolicyConfig::from_env()?,
            metrics: MetricsConfig::from_env(),
        })
    }
}

/// Retrieves an optional environment variable, returning an empty string if not set.
fn optional_env(name: &str) -> String {
    std::env::var(name).unwrap_or("".to_string())
}

/// Retrieves an environment variable with a default value if not set.
fn default_env(name: &str, default_value: &str) -> String {
    std::env::var(name).unwrap_or(default_value.to_string())
}

fn parse_env<T: std::str::FromStr>(name: &str, default_value: &str) -> Result<T> {
    let value = default_env(name, default_value);
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value,
        })
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Retrieves the service version from compile-time environment variables.
///
/// This function attempts to get the version from either `GIT_HASH` or
/// `CARGO_PKG_VERSION` compile-time environment variables.
pub fn version() -> Result<String> {
    option_env!("GIT_HASH")
        .or(option_env!("CARGO_PKG_VERSION"))
        .map(|val| val.to_string())
        .ok_or(ConfigError::VersionNotAvailable)
}

impl AsRef<Duration> for HttpClientTimeout {
    fn as_ref(&self) -> &Duration {
        &self.0
    }
}

impl TryFrom<String> for HttpClientTimeout {
    type Error = ConfigError;
    fn try_from(value: String) -> Result<Self> {
        if value.is_empty() {
            return Ok(Self(Duration::from_secs(8)));
        }

        match value.parse::<u64>() {
            Ok(seconds) => Ok(Self(Duration::from_secs(seconds))),
            Err(_) => Err(ConfigError::InvalidTimeout {
                value: value.clone(),
            }),
        }
    }
}

impl AsRef<Duration> for ExternalCallTimeout {
    fn as_ref(&self) -> &Duration {
        &self.0
    }
}

impl TryFrom<String> for ExternalCallTimeout {
    type Error = ConfigError;
    fn try_from(value: String) -> Result<Self> {
        match value.parse::<u64>() {
            Ok(0) | Err(_) => Err(ConfigError::InvalidTimeout { value }),
            Ok(millis) => Ok(Self(Duration::from_millis(millis))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ENV_MUTEX;

    #[test]
    fn test_cache_size_validation() {
        assert_eq!(*CacheSize::try_from("10".to_string()).unwrap().as_ref(), 10);
        assert!(CacheSize::try_from("0".to_string()).is_err());
        assert!(CacheSize::try_from("many".to_string()).is_err());
    }

    #[test]
    fn test_cache_ttl_conversion() {
        let ttl = CacheTtlMinutes::try_from("30".to_string()).unwrap();
        assert_eq!(ttl.to_seconds(), 1800);
        assert_eq!(ttl.to_duration(), Duration::from_secs(1800));
        assert!(CacheTtlMinutes::try_from("0".to_string()).is_err());
    }

    #[test]
    fn test_timeouts() {
        let timeout = HttpClientTimeout::try_from("".to_string()).unwrap();
        assert_eq!(*timeout.as_ref(), Duration::from_secs(8));

        let timeout = ExternalCallTimeout::try_from("1500".to_string()).unwrap();
        assert_eq!(*timeout.as_ref(), Duration::from_millis(1500));
        assert!(ExternalCallTimeout::try_from("0".to_string()).is_err());
        assert!(ExternalCallTimeout::try_from("soon".to_string()).is_err());
    }

    #[test]
    fn test_apply_retry_delay_is_capped() {
        let config = ApplyConfig {
            max_retries: MAX_APPLY_RETRIES,
            retry_delay_ms: 250,
            max_retry_delay_ms: 2_000,
        };
        assert_eq!(config.retry_delay(1), Duration::from_millis(250));
        assert_eq!(config.retry_delay(2), Duration::from_millis(500));
        assert_eq!(config.retry_delay(4), Duration::from_millis(2_000));
        assert_eq!(config.retry_delay(70), Duration::from_millis(2_000));
        assert_eq!(config.retry_delay(u32::MAX), Duration::from_millis(2_000));
    }

    #[test]
    fn test_apply_validate_bounds_retries() {
        assert!(ApplyConfig::default().validate().is_ok());

        let too_many = ApplyConfig {
            max_retries: 70,
            ..ApplyConfig::default()
        };
        assert!(matches!(
            too_many.validate(),
            Err(ConfigError::InvalidValue { ref name, .. }) if name == "APPLY_MAX_RETRIES"
        ));

        let slow = ApplyConfig {
            max_retry_delay_ms: MAX_APPLY_RETRY_DELAY_MS + 1,
            ..ApplyConfig::default()
        };
        assert!(slow.validate().is_err());

        let inverted = ApplyConfig {
            retry_delay_ms: 10_000,
            max_retry_delay_ms: 1_000,
            ..ApplyConfig::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_moderator_did() {
        assert!(ModeratorDid::try_from("did:plc:mod".to_string()).is_ok());
        assert!(ModeratorDid::try_from("mod.example.com".to_string()).is_err());
        assert!(ModeratorDid::try_from("".to_string()).is_err());
    }

    #[test]
    fn test_jetstream_validate_rejects_zero_workers() {
        let config = JetstreamConfig {
            hostname: "jetstream.example.com".to_string(),
            collections: vec![],
            cursor_path: None,
            worker_threads: 0,
            cursor_write_interval: Duration::from_secs(5),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ozone_host_requires_token() {
        let config = OzoneConfig {
            host: Some("https://ozone.example.com".to_string()),
            admin_token: None,
            moderator_did: None,
            poll_interval: Duration::from_secs(10),
        };
        assert!(config.validate().is_err());

        let config = OzoneConfig {
            host: Some("ozone.example.com".to_string()),
            admin_token: Some("secret".to_string()),
            moderator_did: None,
            poll_interval: Duration::from_secs(10),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_defaults() {
        let _guard = ENV_MUTEX.lock();
        unsafe {
            for name in [
                "JETSTREAM_COLLECTIONS",
                "JETSTREAM_WORKER_THREADS",
                "OZONE_HOST",
                "OZONE_ADMIN_TOKEN",
                "OZONE_MODERATOR_DID",
                "REDIS_URL",
                "RULESET",
                "RULES_CONFIG_PATH",
                "APPVIEW_HOST",
                "EXTERNAL_CALL_TIMEOUT_MS",
            ] {
                std::env::remove_var(name);
            }
        }

        let config = Config::new().unwrap();
        assert_eq!(config.appview_host, "https://api.bsky.app");
        assert_eq!(config.jetstream.worker_threads, 4);
        assert_eq!(
            config.jetstream.collections,
            vec!["app.bsky.feed.post", "app.bsky.actor.profile"]
        );
        assert!(config.redis_url.is_none());
        assert!(config.ozone.host.is_none());
        assert_eq!(config.policy.ruleset, "default");
        assert_eq!(*config.external_call_timeout.as_ref(), Duration::from_secs(5));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list(" a, b ,,c ", ','),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }
}
