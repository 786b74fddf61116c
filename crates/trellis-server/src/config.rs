//! Application configuration.
//!
//! [`AppConfig`] can be built in code with [`AppConfig::builder()`] or
//! loaded from TOML or JSON. Durations accept human-readable strings such
//! as `"500ms"`, `"30s"` or `"2m"`.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use trellis_server::AppConfig;
//!
//! let config = AppConfig::builder()
//!     .app_name("billing")
//!     .strict_routing(true)
//!     .read_timeout(Duration::from_secs(5))
//!     .build();
//!
//! assert_eq!(config.app_name(), "billing");
//! assert!(config.strict_routing());
//!
//! let loaded = AppConfig::from_toml_str(r#"
//!     app_name = "billing"
//!     shutdown_timeout = "2m"
//! "#).unwrap();
//! assert_eq!(loaded.shutdown_timeout(), Duration::from_secs(120));
//! ```

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trellis_core::multipart::MultipartConfig;
use trellis_core::{Settings, DEFAULT_MAX_POOLED};

use crate::error::ConfigError;

/// Default application name.
pub const DEFAULT_APP_NAME: &str = "trellis";

/// Default maximum request body size (4 MiB).
pub const DEFAULT_BODY_LIMIT: usize = 4 * 1024 * 1024;

/// Default keep-alive idle timeout in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Default request body read timeout in seconds.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Default graceful shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    app_name: String,
    case_sensitive: bool,
    strict_routing: bool,
    unescape_path: bool,
    radix_index: bool,
    body_limit: usize,
    #[serde(with = "duration_str")]
    idle_timeout: Duration,
    #[serde(with = "duration_str")]
    read_timeout: Duration,
    #[serde(with = "duration_str")]
    shutdown_timeout: Duration,
    proxy_header: Option<String>,
    enable_trusted_proxy_check: bool,
    trusted_proxies: Vec<IpAddr>,
    max_pooled_contexts: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl AppConfig {
    /// Starts a builder with default values.
    #[must_use]
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::new()
    }

    /// Parses a TOML document and validates it.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON document and validates it.
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path));
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::read_error(path, e))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigError::invalid_value("app_name", "must not be empty"));
        }
        if self.body_limit == 0 {
            return Err(ConfigError::invalid_value(
                "body_limit",
                "must be greater than zero",
            ));
        }
        if let Some(header) = &self.proxy_header {
            if http::HeaderName::from_bytes(header.as_bytes()).is_err() {
                return Err(ConfigError::invalid_value(
                    "proxy_header",
                    format!("'{header}' is not a valid header name"),
                ));
            }
        }
        Ok(())
    }

    /// Request settings derived from this configuration.
    #[must_use]
    pub fn settings(&self) -> Settings {
        Settings {
            app_name: self.app_name.clone(),
            case_sensitive: self.case_sensitive,
            strict_routing: self.strict_routing,
            unescape_path: self.unescape_path,
            proxy_header: self.proxy_header.clone(),
            enable_trusted_proxy_check: self.enable_trusted_proxy_check,
            trusted_proxies: self.trusted_proxies.clone(),
            multipart: MultipartConfig::default(),
        }
    }

    /// Application name.
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Whether routing is case-sensitive.
    #[must_use]
    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Whether `/a` and `/a/` are distinct.
    #[must_use]
    pub fn strict_routing(&self) -> bool {
        self.strict_routing
    }

    /// Whether paths are percent-decoded before matching.
    #[must_use]
    pub fn unescape_path(&self) -> bool {
        self.unescape_path
    }

    /// Whether method stacks get a prefix index.
    #[must_use]
    pub fn radix_index(&self) -> bool {
        self.radix_index
    }

    /// Maximum request body size in bytes.
    #[must_use]
    pub fn body_limit(&self) -> usize {
        self.body_limit
    }

    /// How long an idle keep-alive connection may wait for its next
    /// request head.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// How long reading a request body may take.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Timeout applied by [`App::shutdown`](crate::App::shutdown).
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Header carrying the client address behind a proxy.
    #[must_use]
    pub fn proxy_header(&self) -> Option<&str> {
        self.proxy_header.as_deref()
    }

    /// Whether proxy headers are only honoured from trusted peers.
    #[must_use]
    pub fn enable_trusted_proxy_check(&self) -> bool {
        self.enable_trusted_proxy_check
    }

    /// Trusted proxy addresses.
    #[must_use]
    pub fn trusted_proxies(&self) -> &[IpAddr] {
        &self.trusted_proxies
    }

    /// Upper bound on idle pooled contexts.
    #[must_use]
    pub fn max_pooled_contexts(&self) -> usize {
        self.max_pooled_contexts
    }
}

/// Builder for [`AppConfig`].
#[derive(Debug, Clone)]
pub struct AppConfigBuilder {
    config: AppConfig,
}

impl Default for AppConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppConfigBuilder {
    /// Creates a builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: AppConfig {
                app_name: DEFAULT_APP_NAME.to_string(),
                case_sensitive: false,
                strict_routing: false,
                unescape_path: false,
                radix_index: true,
                body_limit: DEFAULT_BODY_LIMIT,
                idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
                read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
                shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
                proxy_header: None,
                enable_trusted_proxy_check: false,
                trusted_proxies: Vec::new(),
                max_pooled_contexts: DEFAULT_MAX_POOLED,
            },
        }
    }

    /// Sets the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = name.into();
        self
    }

    /// Enables case-sensitive routing.
    #[must_use]
    pub fn case_sensitive(mut self, enabled: bool) -> Self {
        self.config.case_sensitive = enabled;
        self
    }

    /// Enables strict routing.
    #[must_use]
    pub fn strict_routing(mut self, enabled: bool) -> Self {
        self.config.strict_routing = enabled;
        self
    }

    /// Enables percent-decoding of paths before matching.
    #[must_use]
    pub fn unescape_path(mut self, enabled: bool) -> Self {
        self.config.unescape_path = enabled;
        self
    }

    /// Enables or disables the prefix index.
    #[must_use]
    pub fn radix_index(mut self, enabled: bool) -> Self {
        self.config.radix_index = enabled;
        self
    }

    /// Sets the maximum request body size.
    #[must_use]
    pub fn body_limit(mut self, bytes: usize) -> Self {
        self.config.body_limit = bytes;
        self
    }

    /// Sets the keep-alive idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Sets the body read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Sets the default shutdown timeout.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Sets the proxy header, e.g. `X-Forwarded-For`.
    #[must_use]
    pub fn proxy_header(mut self, header: impl Into<String>) -> Self {
        self.config.proxy_header = Some(header.into());
        self
    }

    /// Only trust proxy headers from [`trusted_proxies`](Self::trusted_proxies).
    #[must_use]
    pub fn enable_trusted_proxy_check(mut self, enabled: bool) -> Self {
        self.config.enable_trusted_proxy_check = enabled;
        self
    }

    /// Sets the trusted proxy addresses.
    #[must_use]
    pub fn trusted_proxies(mut self, proxies: impl IntoIterator<Item = IpAddr>) -> Self {
        self.config.trusted_proxies = proxies.into_iter().collect();
        self
    }

    /// Sets the upper bound on idle pooled contexts.
    #[must_use]
    pub fn max_pooled_contexts(mut self, max: usize) -> Self {
        self.config.max_pooled_contexts = max;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> AppConfig {
        self.config
    }
}

/// Serde adapter for human-readable durations.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Writes whole seconds as `"30s"` and anything else as milliseconds.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = if duration.subsec_nanos() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        };
        serializer.serialize_str(&s)
    }

    /// Accepts `ms`, `s`, `m` and `h` suffixes; a bare number is seconds.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }

    /// Parses a duration string.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (digits, unit): (&str, fn(u64) -> Duration) = if let Some(n) = s.strip_suffix("ms") {
            (n, Duration::from_millis)
        } else if let Some(n) = s.strip_suffix('s') {
            (n, Duration::from_secs)
        } else if let Some(n) = s.strip_suffix('m') {
            (n, |m| Duration::from_secs(m * 60))
        } else if let Some(n) = s.strip_suffix('h') {
            (n, |h| Duration::from_secs(h * 3600))
        } else {
            (s, Duration::from_secs)
        };
        digits
            .trim()
            .parse::<u64>()
            .map(unit)
            .map_err(|_| format!("invalid duration '{s}'"))
    }
}
