use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Provider identifiers accepted in `weather.provider`, `weather.fallback` and
/// `weather.retry.providers`.
pub const KNOWN_PROVIDERS: &[&str] = &["nws", "openmeteo", "visualcrossing"];

/// Data kind identifiers accepted as keys of `weather.fallback` and
/// `weather.cache.kind_ttl_secs`.
pub const KNOWN_KINDS: &[&str] = &[
    "current",
    "forecast",
    "hourly",
    "alerts",
    "discussion",
    "air_quality",
];

/// Automatic provider selection.
pub const AUTO_PROVIDER: &str = "auto";

/// Worst-case orchestrator latency above which validation warns.
pub const LATENCY_WARNING_MS: u64 = 45_000;

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add an error
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return String::new();
        }
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application configuration directory
    pub config_dir: PathBuf,

    /// Weather settings
    #[serde(default)]
    pub weather: WeatherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    /// `auto` for the per-kind fallback chain, or a single provider id
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Location fetched by the binary on startup
    #[serde(default)]
    pub default_location: Option<LocationConfig>,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Ordered provider chain per data kind, used when `provider = "auto"`
    #[serde(default = "default_fallback")]
    pub fallback: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub pool: PoolSettings,

    /// API keys stored in the config file. Environment variables and the
    /// system keyring take precedence.
    #[serde(default)]
    pub api_keys: BTreeMap<String, String>,
}

fn default_provider() -> String {
    AUTO_PROVIDER.to_string()
}

fn default_fallback() -> BTreeMap<String, Vec<String>> {
    let full_chain = || {
        vec![
            "nws".to_string(),
            "openmeteo".to_string(),
            "visualcrossing".to_string(),
        ]
    };
    let mut fallback = BTreeMap::new();
    fallback.insert("current".to_string(), full_chain());
    fallback.insert("forecast".to_string(), full_chain());
    fallback.insert("hourly".to_string(), full_chain());
    fallback.insert(
        "alerts".to_string(),
        vec!["nws".to_string(), "visualcrossing".to_string()],
    );
    fallback.insert("discussion".to_string(), vec!["nws".to_string()]);
    fallback.insert("air_quality".to_string(), vec!["openmeteo".to_string()]);
    fallback
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            default_location: None,
            cache: CacheSettings::default(),
            retry: RetrySettings::default(),
            fallback: default_fallback(),
            pool: PoolSettings::default(),
            api_keys: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationConfig {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Default time-to-live for cached payloads, in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Per-kind TTL overrides, in seconds
    #[serde(default)]
    pub kind_ttl_secs: BTreeMap<String, u64>,

    /// Persist the cache to `weather_cache.json` between runs
    #[serde(default = "default_persist")]
    pub persist: bool,
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_persist() -> bool {
    true
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            kind_ttl_secs: BTreeMap::new(),
            persist: default_persist(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrySettings {
    #[serde(default)]
    pub default: RetryPolicySettings,

    /// Per-provider overrides of the default policy
    #[serde(default)]
    pub providers: BTreeMap<String, RetryPolicySettings>,
}

impl RetrySettings {
    /// Policy in effect for a provider id.
    pub fn for_provider(&self, provider: &str) -> &RetryPolicySettings {
        self.providers.get(provider).unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_per_attempt_timeout_ms")]
    pub per_attempt_timeout_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_per_attempt_timeout_ms() -> u64 {
    3_000
}

fn default_max_delay_ms() -> u64 {
    2_000
}

impl Default for RetryPolicySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            per_attempt_timeout_ms: default_per_attempt_timeout_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicySettings {
    /// Delay slept after failed attempt `attempt` (1-based), in milliseconds.
    pub fn delay_after_attempt_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        (delay.max(0.0) as u64).min(self.max_delay_ms)
    }

    /// Upper bound on the time one provider can hold a request:
    /// every attempt timing out plus every backoff sleep.
    pub fn worst_case_ms(&self) -> u64 {
        let attempts = self.max_attempts.max(1);
        let timeouts = u64::from(attempts).saturating_mul(self.per_attempt_timeout_ms);
        let backoff: u64 = (1..attempts).map(|n| self.delay_after_attempt_ms(n)).sum();
        timeouts.saturating_add(backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Overall request timeout, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// TCP connect timeout, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Maximum concurrent outbound requests across all providers
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle connections kept alive for reuse, per host
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    3
}

fn default_max_connections() -> usize {
    30
}

fn default_max_idle_per_host() -> usize {
    15
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_connections: default_max_connections(),
            max_idle_per_host: default_max_idle_per_host(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("wxhub");

        Self {
            config_dir,
            weather: WeatherConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, creating default if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path, writing defaults there if
    /// the file doesn't exist yet
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            let mut config = Self::default();
            if let Some(parent) = config_path.parent() {
                config.config_dir = parent.to_path_buf();
            }
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents =
            std::fs::read_to_string(config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Returns the config along with any validation warnings.
    /// Returns an error if validation fails with critical errors.
    pub fn load_validated() -> Result<(Self, ValidationResult)> {
        let config = Self::load()?;
        let validation = config.validate();

        if !validation.is_valid() {
            anyhow::bail!(
                "Configuration validation failed: {}",
                validation.error_summary()
            );
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    /// Validate the configuration
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        let weather = &self.weather;

        if weather.provider != AUTO_PROVIDER && !KNOWN_PROVIDERS.contains(&weather.provider.as_str())
        {
            result.add_error(
                "weather.provider",
                format!("Unknown provider: {}", weather.provider),
            );
        }

        if let Some(location) = &weather.default_location {
            if !(-90.0..=90.0).contains(&location.latitude) {
                result.add_error(
                    "weather.default_location.latitude",
                    "Latitude must be between -90 and 90",
                );
            }
            if !(-180.0..=180.0).contains(&location.longitude) {
                result.add_error(
                    "weather.default_location.longitude",
                    "Longitude must be between -180 and 180",
                );
            }
        }

        if weather.cache.ttl_secs == 0 {
            result.add_warning("weather.cache.ttl_secs", "Caching disabled (0 seconds)");
        }
        for kind in weather.cache.kind_ttl_secs.keys() {
            if !KNOWN_KINDS.contains(&kind.as_str()) {
                result.add_error(
                    format!("weather.cache.kind_ttl_secs.{kind}"),
                    format!("Unknown data kind: {kind}"),
                );
            }
        }

        for (kind, chain) in &weather.fallback {
            let field = format!("weather.fallback.{kind}");
            if !KNOWN_KINDS.contains(&kind.as_str()) {
                result.add_error(&field, format!("Unknown data kind: {kind}"));
            }
            if chain.is_empty() {
                result.add_warning(&field, "Empty fallback chain; this kind can never be fetched");
            }
            for provider in chain {
                if !KNOWN_PROVIDERS.contains(&provider.as_str()) {
                    result.add_error(&field, format!("Unknown provider: {provider}"));
                }
            }
        }

        self.validate_retry(&mut result);

        if weather.pool.max_connections == 0 {
            result.add_error(
                "weather.pool.max_connections",
                "Connection limit must be greater than 0",
            );
        }
        if weather.pool.max_idle_per_host > weather.pool.max_connections {
            result.add_warning(
                "weather.pool.max_idle_per_host",
                "More idle connections than the connection limit allows",
            );
        }

        result
    }

    fn validate_retry(&self, result: &mut ValidationResult) {
        let retry = &self.weather.retry;
        let mut policies = vec![("weather.retry.default".to_string(), &retry.default)];
        for (provider, policy) in &retry.providers {
            let field = format!("weather.retry.providers.{provider}");
            if !KNOWN_PROVIDERS.contains(&provider.as_str()) {
                result.add_error(&field, format!("Unknown provider: {provider}"));
            }
            policies.push((field, policy));
        }

        for (field, policy) in policies {
            if policy.max_attempts == 0 {
                result.add_error(
                    format!("{field}.max_attempts"),
                    "At least one attempt is required",
                );
            }
            if policy.backoff_multiplier < 1.0 {
                result.add_error(
                    format!("{field}.backoff_multiplier"),
                    "Backoff multiplier must be at least 1.0",
                );
            }
            if policy.per_attempt_timeout_ms == 0 {
                result.add_error(
                    format!("{field}.per_attempt_timeout_ms"),
                    "Per-attempt timeout must be greater than 0",
                );
            }
        }

        let worst_case = self.worst_case_latency_ms();
        if worst_case > LATENCY_WARNING_MS {
            result.add_warning(
                "weather.retry",
                format!(
                    "Worst-case fetch latency is {}s; reduce attempts or timeouts",
                    worst_case / 1000
                ),
            );
        }
    }

    /// Longest time a single data kind can take across its whole fallback
    /// chain, with every attempt on every provider timing out.
    pub fn worst_case_latency_ms(&self) -> u64 {
        let weather = &self.weather;
        let chains: Vec<Vec<&str>> = if weather.provider == AUTO_PROVIDER {
            weather
                .fallback
                .values()
                .map(|chain| chain.iter().map(String::as_str).collect())
                .collect()
        } else {
            vec![vec![weather.provider.as_str()]]
        };

        chains
            .iter()
            .map(|chain| {
                chain
                    .iter()
                    .map(|provider| weather.retry.for_provider(provider).worst_case_ms())
                    .sum::<u64>()
            })
            .max()
            .unwrap_or(0)
    }

    /// Path of the persisted weather cache
    pub fn cache_path(&self) -> PathBuf {
        self.config_dir.join("weather_cache.json")
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        self.save_to(&config_path)
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Ensure config directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get the path to the configuration file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("wxhub");

        Ok(config_dir.join("config.toml"))
    }
}
