//! Configuration types
//!
//! Values come from, in order: built-in defaults, an optional TOML file
//! (`--config <path>` or `PARLEY_CONFIG`), then `PARLEY_*` environment
//! overrides. The result is validated before use.

use crate::{ChainId, ConfigError, ParleyError, ParleyResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the persisted slot holding the lease record.
pub const DEFAULT_LEASE_SLOT: &str = "parley.exclusive-lease";
/// Heartbeat refresh period.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2_000;
/// Age after which a lease record is abandoned.
pub const DEFAULT_LEASE_TIMEOUT_MS: u64 = 5_000;
/// Re-poll period for pending lookups.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
/// Items older than this are assumed confirmed without a lookup.
pub const DEFAULT_CONFIRMATION_THRESHOLD_MS: u64 = 5_000;

// ============================================================================
// SECTIONS
// ============================================================================

/// Exclusive lease settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaseConfig {
    pub slot: String,
    pub heartbeat_interval_ms: u64,
    pub timeout_ms: u64,
    /// Directory of the LMDB environment shared by all client processes.
    pub store_path: PathBuf,
    pub store_max_size_mb: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            slot: DEFAULT_LEASE_SLOT.to_string(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            timeout_ms: DEFAULT_LEASE_TIMEOUT_MS,
            store_path: PathBuf::from(".parley/lease"),
            store_max_size_mb: 1,
        }
    }
}

impl LeaseConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Capacities of the in-memory stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheLimits {
    pub max_conversations: usize,
    pub max_messages_per_conversation: usize,
    pub max_usernames: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_conversations: 50,
            max_messages_per_conversation: 500,
            max_usernames: 1_000,
        }
    }
}

/// Polling and confirmation policy for coalesced lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollingConfig {
    pub poll_interval_ms: u64,
    /// `None` disables age-based auto-confirmation.
    pub confirmation_threshold_ms: Option<u64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            confirmation_threshold_ms: Some(DEFAULT_CONFIRMATION_THRESHOLD_MS),
        }
    }
}

impl PollingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirmation_threshold(&self) -> Option<Duration> {
        self.confirmation_threshold_ms.map(Duration::from_millis)
    }
}

/// Remote endpoints used by the lookup backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    pub profile_base_url: Option<String>,
    /// JSON-RPC URL per chain id (TOML keys are strings).
    pub rpc: BTreeMap<String, String>,
    pub request_timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            profile_base_url: None,
            rpc: BTreeMap::new(),
            request_timeout_ms: 10_000,
        }
    }
}

impl EndpointConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Parse the chain-id keyed RPC map.
    pub fn rpc_endpoints(&self) -> ParleyResult<HashMap<ChainId, String>> {
        self.rpc
            .iter()
            .map(|(chain, url)| {
                let chain_id = chain.parse::<ChainId>().map_err(|e| {
                    ParleyError::Config(ConfigError::InvalidValue {
                        field: "endpoints.rpc".to_string(),
                        value: chain.clone(),
                        reason: format!("chain id must be an integer: {}", e),
                    })
                })?;
                Ok((chain_id, url.clone()))
            })
            .collect()
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParleyConfig {
    pub lease: LeaseConfig,
    pub cache: CacheLimits,
    pub polling: PollingConfig,
    pub endpoints: EndpointConfig,
}

impl ParleyConfig {
    /// Resolve the config file from `--config` or `PARLEY_CONFIG` (defaults if
    /// neither is given), apply environment overrides and validate.
    pub fn load() -> ParleyResult<Self> {
        let mut config = match config_path_from_args().or_else(config_path_from_env) {
            Some(path) => Self::from_path(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. Missing sections and fields take their defaults.
    pub fn from_path(path: &Path) -> ParleyResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> ParleyResult<Self> {
        toml::from_str(contents).map_err(|e| {
            ConfigError::Parse {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Apply `PARLEY_*` overrides read through `var`.
    ///
    /// Environment variables:
    /// - `PARLEY_LEASE_SLOT`, `PARLEY_LEASE_STORE_PATH`
    /// - `PARLEY_HEARTBEAT_INTERVAL_MS`, `PARLEY_LEASE_TIMEOUT_MS`
    /// - `PARLEY_POLL_INTERVAL_MS`
    /// - `PARLEY_CONFIRMATION_THRESHOLD_MS` (`off` disables auto-confirmation)
    /// - `PARLEY_MAX_CONVERSATIONS`, `PARLEY_MAX_USERNAMES`
    /// - `PARLEY_PROFILE_BASE_URL`
    pub fn apply_overrides<F>(&mut self, var: F) -> ParleyResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(slot) = var("PARLEY_LEASE_SLOT") {
            self.lease.slot = slot;
        }
        if let Some(path) = var("PARLEY_LEASE_STORE_PATH") {
            self.lease.store_path = PathBuf::from(path);
        }
        if let Some(ms) = parse_var(&var, "PARLEY_HEARTBEAT_INTERVAL_MS")? {
            self.lease.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = parse_var(&var, "PARLEY_LEASE_TIMEOUT_MS")? {
            self.lease.timeout_ms = ms;
        }
        if let Some(ms) = parse_var(&var, "PARLEY_POLL_INTERVAL_MS")? {
            self.polling.poll_interval_ms = ms;
        }
        if let Some(raw) = var("PARLEY_CONFIRMATION_THRESHOLD_MS") {
            self.polling.confirmation_threshold_ms = if raw.trim().eq_ignore_ascii_case("off") {
                None
            } else {
                Some(parse_value("PARLEY_CONFIRMATION_THRESHOLD_MS", &raw)?)
            };
        }
        if let Some(n) = parse_var(&var, "PARLEY_MAX_CONVERSATIONS")? {
            self.cache.max_conversations = n;
        }
        if let Some(n) = parse_var(&var, "PARLEY_MAX_USERNAMES")? {
            self.cache.max_usernames = n;
        }
        if let Some(url) = var("PARLEY_PROFILE_BASE_URL") {
            self.endpoints.profile_base_url = Some(url);
        }
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - lease slot and store path are non-empty
    /// - every duration and capacity is positive
    /// - the heartbeat interval is strictly shorter than the lease timeout
    /// - RPC map keys are chain ids
    pub fn validate(&self) -> ParleyResult<()> {
        if self.lease.slot.trim().is_empty() {
            return Err(invalid("lease.slot", &self.lease.slot, "must not be empty"));
        }
        if self.lease.store_path.as_os_str().is_empty() {
            return Err(invalid("lease.store_path", "", "must not be empty"));
        }
        require_positive("lease.heartbeat_interval_ms", self.lease.heartbeat_interval_ms)?;
        require_positive("lease.timeout_ms", self.lease.timeout_ms)?;
        if self.lease.heartbeat_interval_ms >= self.lease.timeout_ms {
            return Err(ConfigError::IncompatibleOptions {
                option_a: format!("lease.heartbeat_interval_ms={}", self.lease.heartbeat_interval_ms),
                option_b: format!("lease.timeout_ms={}", self.lease.timeout_ms),
            }
            .into());
        }
        require_positive("lease.store_max_size_mb", self.lease.store_max_size_mb as u64)?;

        require_positive("cache.max_conversations", self.cache.max_conversations as u64)?;
        require_positive(
            "cache.max_messages_per_conversation",
            self.cache.max_messages_per_conversation as u64,
        )?;
        require_positive("cache.max_usernames", self.cache.max_usernames as u64)?;

        require_positive("polling.poll_interval_ms", self.polling.poll_interval_ms)?;
        if let Some(threshold) = self.polling.confirmation_threshold_ms {
            require_positive("polling.confirmation_threshold_ms", threshold)?;
        }

        require_positive("endpoints.request_timeout_ms", self.endpoints.request_timeout_ms)?;
        self.endpoints.rpc_endpoints()?;
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ParleyError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn require_positive(field: &str, value: u64) -> ParleyResult<()> {
    if value == 0 {
        return Err(invalid(field, "0", "must be positive"));
    }
    Ok(())
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> ParleyResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, raw, &e.to_string()))
}

fn parse_var<F, T>(var: &F, key: &str) -> ParleyResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var(key).map(|raw| parse_value(key, &raw)).transpose()
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("PARLEY_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_reference_values() {
        let config = ParleyConfig::default();
        assert_eq!(config.lease.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(config.lease.timeout(), Duration::from_secs(5));
        assert_eq!(config.polling.poll_interval(), Duration::from_secs(5));
        assert_eq!(
            config.polling.confirmation_threshold(),
            Some(Duration::from_secs(5))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_timeout() {
        let mut config = ParleyConfig::default();
        config.lease.heartbeat_interval_ms = 5_000;
        assert!(matches!(
            config.validate(),
            Err(ParleyError::Config(ConfigError::IncompatibleOptions { .. }))
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = ParleyConfig::default();
        config.cache.max_usernames = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ParleyConfig::from_toml_str(
            r#"
            [lease]
            timeout_ms = 9000

            [endpoints.rpc]
            "1" = "https://rpc.example.org"
            "#,
        )
        .unwrap();
        assert_eq!(config.lease.timeout_ms, 9_000);
        assert_eq!(config.lease.heartbeat_interval_ms, DEFAULT_HEARTBEAT_INTERVAL_MS);
        let rpc = config.endpoints.rpc_endpoints().unwrap();
        assert_eq!(rpc.get(&ChainId(1)).map(String::as_str), Some("https://rpc.example.org"));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result = ParleyConfig::from_toml_str("[lease]\nttl = 3\n");
        assert!(matches!(
            result,
            Err(ParleyError::Config(ConfigError::Parse { .. }))
        ));
    }

    #[test]
    fn test_non_numeric_chain_id_rejected() {
        let mut config = ParleyConfig::default();
        config
            .endpoints
            .rpc
            .insert("mainnet".to_string(), "https://rpc".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ParleyConfig::default();
        config
            .apply_overrides(vars(&[
                ("PARLEY_LEASE_TIMEOUT_MS", "8000"),
                ("PARLEY_CONFIRMATION_THRESHOLD_MS", "off"),
                ("PARLEY_MAX_CONVERSATIONS", "12"),
            ]))
            .unwrap();
        assert_eq!(config.lease.timeout_ms, 8_000);
        assert_eq!(config.polling.confirmation_threshold_ms, None);
        assert_eq!(config.cache.max_conversations, 12);
    }

    #[test]
    fn test_bad_env_override_is_config_error() {
        let mut config = ParleyConfig::default();
        let err = config
            .apply_overrides(vars(&[("PARLEY_POLL_INTERVAL_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ParleyError::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_from_path_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[polling]\npoll_interval_ms = 1500").unwrap();
        let config = ParleyConfig::from_path(file.path()).unwrap();
        assert_eq!(config.polling.poll_interval(), Duration::from_millis(1500));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = ParleyConfig::from_path(Path::new("/nonexistent/parley.toml")).unwrap_err();
        assert!(matches!(err, ParleyError::Config(ConfigError::Read { .. })));
    }
}
