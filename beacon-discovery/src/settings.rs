//! Connection and watcher settings resolved from configuration

use backoff::backoff::Backoff;
use beacon_config::{ConfigError, ConfigManager, ConfigValidator, Validate};
use std::fmt;
use std::time::Duration;

use crate::session::DiscoveryError;

/// Root under which every live server owns one ephemeral record.
pub const ROOT_PATH: &str = "/beacon/servers";

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_MAX_RETRY: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 500;
pub const DEFAULT_PROTOCOL: &str = "http://";
pub const DEFAULT_ROUTE_SUFFIX: &str = "remoting";

/// Settings keys as `(primary, legacy alias)` pairs.
pub mod keys {
    pub const CONNECTION: (&str, &str) = ("beacon.connection", "cluster.ping.connection");
    pub const PASSWORD: (&str, &str) = ("beacon.password", "cluster.ping.password");
    pub const CONNECTION_TIMEOUT: (&str, &str) = (
        "beacon.connection_timeout",
        "cluster.ping.connection_timeout",
    );
    pub const SESSION_TIMEOUT: (&str, &str) =
        ("beacon.session_timeout", "cluster.ping.session_timeout");
    pub const MAX_RETRY: (&str, &str) = ("beacon.max_retry", "cluster.ping.max_retry");
    pub const RETRY_INTERVAL: (&str, &str) =
        ("beacon.retry_interval", "cluster.ping.retry_interval");
    pub const RECORD_MODE: (&str, &str) = ("beacon.record_mode", "cluster.ping.mode");
    pub const URL_LIST: (&str, &str) = (
        "beacon.connection_url_list",
        "cluster.connection_url_list",
    );
    pub const PROTOCOL: &str = "beacon.protocol";
    pub const ROUTE_SUFFIX: &str = "beacon.route_suffix";
    pub const UPDATE_POLICY: &str = "beacon.update_policy";
}

fn invalid(e: beacon_config::ConfigError) -> DiscoveryError {
    DiscoveryError::InvalidConfiguration(e.to_string())
}

/// A single-key string setting; missing or blank is `None`, anything present
/// that is not a string is an error.
fn optional_string(config: &ConfigManager, key: &str) -> Result<Option<String>, DiscoveryError> {
    match config.get::<String>(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::KeyNotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Credential
// ============================================================================

/// Shared-secret credential in `user:password` form.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    user: String,
    secret: String,
}

impl Credential {
    pub fn new(user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
        }
    }

    /// Parse a configured secret. Blank input means no credential.
    pub fn parse(raw: &str) -> Result<Option<Self>, DiscoveryError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        match raw.split_once(':') {
            Some((user, secret)) if !user.is_empty() => Ok(Some(Self::new(user, secret))),
            _ => Err(DiscoveryError::InvalidConfiguration(
                "credential must have the form user:password".to_string(),
            )),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Finite retry policy with a constant delay between attempts.
///
/// `max_retries` counts retries after the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
        }
    }

    /// Fresh backoff schedule for one operation
    pub fn backoff(&self) -> FixedBackoff {
        FixedBackoff {
            policy: *self,
            remaining: self.max_retries,
        }
    }

    /// Upper bound on the number of attempts
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RETRY,
            Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
        )
    }
}

/// Backoff schedule yielding the same interval a fixed number of times.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    policy: RetryPolicy,
    remaining: u32,
}

impl Backoff for FixedBackoff {
    fn reset(&mut self) {
        self.remaining = self.policy.max_retries;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.policy.interval)
    }
}

// ============================================================================
// Connection settings
// ============================================================================

/// Everything needed to open a coordination session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Ensemble addresses
    pub ensemble: Vec<String>,

    /// Applied only when present
    pub credential: Option<Credential>,

    /// Bound on establishing a connection
    pub connect_timeout: Duration,

    /// Silence after which the service expires the session
    pub session_timeout: Duration,

    pub retry: RetryPolicy,
}

impl ConnectionSettings {
    /// Settings with defaults for the given ensemble
    pub fn new<I, S>(ensemble: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ensemble: ensemble.into_iter().map(Into::into).collect(),
            credential: None,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            session_timeout: Duration::from_millis(DEFAULT_SESSION_TIMEOUT_MS),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolve from configuration.
    ///
    /// Returns `Ok(None)` when no ensemble is configured, which callers treat
    /// as "coordination disabled" rather than an error.
    pub fn resolve(config: &ConfigManager) -> Result<Option<Self>, DiscoveryError> {
        let (primary, alias) = keys::CONNECTION;
        let Some(connection) = config.get_aliased::<String>(primary, alias)? else {
            return Ok(None);
        };

        let ensemble = parse_ensemble(&connection);
        if ensemble.is_empty() {
            return Ok(None);
        }

        let (primary, alias) = keys::PASSWORD;
        let credential = match config.get_aliased::<String>(primary, alias)? {
            Some(raw) => Credential::parse(&raw)?,
            None => None,
        };

        let millis = |(primary, alias): (&str, &str), default: u64| {
            config
                .get_aliased::<u64>(primary, alias)
                .map(|v| Duration::from_millis(v.unwrap_or(default)))
        };

        let (primary, alias) = keys::MAX_RETRY;
        let max_retries = config
            .get_aliased::<u32>(primary, alias)?
            .unwrap_or(DEFAULT_MAX_RETRY);

        let settings = Self {
            ensemble,
            credential,
            connect_timeout: millis(keys::CONNECTION_TIMEOUT, DEFAULT_CONNECT_TIMEOUT_MS)?,
            session_timeout: millis(keys::SESSION_TIMEOUT, DEFAULT_SESSION_TIMEOUT_MS)?,
            retry: RetryPolicy::new(
                max_retries,
                millis(keys::RETRY_INTERVAL, DEFAULT_RETRY_INTERVAL_MS)?,
            ),
        };

        settings.validate().map_err(invalid)?;
        Ok(Some(settings))
    }

    /// Ensemble as a single comma-separated string
    pub fn ensemble_string(&self) -> String {
        self.ensemble.join(",")
    }
}

impl Validate for ConnectionSettings {
    fn validate(&self) -> beacon_config::Result<()> {
        ConfigValidator::not_empty(&self.ensemble_string(), "connection")?;
        ConfigValidator::positive(self.connect_timeout.as_millis() as u64, "connection timeout")?;
        ConfigValidator::positive(self.session_timeout.as_millis() as u64, "session timeout")?;
        ConfigValidator::positive(self.retry.interval.as_millis() as u64, "retry interval")?;
        Ok(())
    }
}

fn parse_ensemble(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Advertiser settings
// ============================================================================

/// Lifetime of the advertised record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordMode {
    /// Removed when the owning session ends
    #[default]
    Ephemeral,
    /// Kept until deleted explicitly
    Persistent,
}

impl RecordMode {
    /// Parse a mode name or its numeric create-mode flag (`0` persistent,
    /// `2` ephemeral). Sequential flags are rejected: record paths are
    /// already unique.
    pub fn parse(raw: &str) -> Result<Self, DiscoveryError> {
        match raw.trim().to_lowercase().as_str() {
            "ephemeral" | "2" => Ok(RecordMode::Ephemeral),
            "persistent" | "0" => Ok(RecordMode::Persistent),
            other => Err(DiscoveryError::InvalidConfiguration(format!(
                "unsupported record mode '{}', expected ephemeral or persistent",
                other
            ))),
        }
    }

    pub fn resolve(config: &ConfigManager) -> Result<Self, DiscoveryError> {
        let (primary, alias) = keys::RECORD_MODE;
        match config.get_aliased::<String>(primary, alias)? {
            Some(raw) => Self::parse(&raw),
            None => Ok(Self::default()),
        }
    }
}

// ============================================================================
// Watcher settings
// ============================================================================

/// What the watcher does with a payload change on an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePolicy {
    /// Log the change and leave the URL list untouched
    #[default]
    Ignore,
    /// Replace the URL owned by the changed record path
    Reconcile,
}

impl UpdatePolicy {
    pub fn parse(raw: &str) -> Result<Self, DiscoveryError> {
        let raw = raw.trim().to_lowercase();
        ConfigValidator::one_of(&raw, &["ignore", "reconcile"], keys::UPDATE_POLICY)
            .map_err(invalid)?;
        Ok(if raw == "reconcile" {
            UpdatePolicy::Reconcile
        } else {
            UpdatePolicy::Ignore
        })
    }
}

/// How the watcher turns server identities into URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherSettings {
    /// Prefix of every URL, e.g. `http://`
    pub protocol: String,

    /// Path segment appended to every URL
    pub route_suffix: String,

    /// Delimiter-separated URL list used when coordination is disabled
    pub static_urls: Option<String>,

    pub update_policy: UpdatePolicy,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL.to_string(),
            route_suffix: DEFAULT_ROUTE_SUFFIX.to_string(),
            static_urls: None,
            update_policy: UpdatePolicy::Ignore,
        }
    }
}

impl WatcherSettings {
    pub fn resolve(config: &ConfigManager) -> Result<Self, DiscoveryError> {
        let (primary, alias) = keys::URL_LIST;
        let update_policy = match optional_string(config, keys::UPDATE_POLICY)? {
            Some(raw) => UpdatePolicy::parse(&raw)?,
            None => UpdatePolicy::default(),
        };

        Ok(Self {
            protocol: optional_string(config, keys::PROTOCOL)?
                .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            route_suffix: optional_string(config, keys::ROUTE_SUFFIX)?
                .unwrap_or_else(|| DEFAULT_ROUTE_SUFFIX.to_string()),
            static_urls: config.get_aliased(primary, alias)?,
            update_policy,
        })
    }

    /// URL of a server: `protocol + identity + "/" + route_suffix`
    pub fn url_for(&self, identity: &str) -> String {
        format!("{}{}/{}", self.protocol, identity, self.route_suffix)
    }

    /// Static URLs, split on `,` or `;`, each suffixed with the route.
    ///
    /// `None` when no list is configured at all.
    pub fn static_url_list(&self) -> Option<Vec<String>> {
        let raw = self.static_urls.as_ref()?;
        let mut urls: Vec<String> = Vec::new();
        for entry in raw.split([',', ';']).map(str::trim).filter(|s| !s.is_empty()) {
            let url = format!("{}/{}", entry, self.route_suffix);
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        Some(urls)
    }
}
