//! Configuration module for the delegation router
//!
//! This module handles configuration loading from TOML files and
//! environment variables, and provides structured configuration types.

use crate::confirmation::ConfirmationSettings;
use crate::delegation::DEFAULT_DELEGATION_PROGRAM_ID;
use crate::types::{Commitment, VenueId};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Base ledger endpoints
    pub base: EndpointConfig,

    /// Known execution venues
    #[serde(default)]
    pub venues: Vec<VenueConfig>,

    /// Delegation program and record tracking
    #[serde(default)]
    pub delegation: DelegationConfig,

    /// Confirmation deadlines
    #[serde(default)]
    pub confirmation: ConfirmationConfig,

    /// Logging
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// JSON-RPC URL
    pub rpc_url: String,

    /// Websocket URL; derived from `rpc_url` when omitted
    #[serde(default)]
    pub ws_url: Option<String>,
}

impl EndpointConfig {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            ws_url: None,
        }
    }

    /// Websocket URL, explicit or derived
    pub fn websocket_url(&self) -> String {
        self.ws_url
            .clone()
            .unwrap_or_else(|| derive_ws_url(&self.rpc_url))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    /// Validator identity (base58)
    pub identity: String,

    #[serde(flatten)]
    pub endpoint: EndpointConfig,
}

impl VenueConfig {
    pub fn venue_id(&self) -> Result<VenueId, ConfigError> {
        VenueId::from_str(&self.identity).map_err(|e| {
            ConfigError::ValidationError(format!("Invalid venue identity {}: {}", self.identity, e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationConfig {
    /// Delegation program id (base58)
    #[serde(default = "default_program_id")]
    pub program_id: String,

    /// Commitment for record reads
    #[serde(default)]
    pub commitment: Commitment,

    /// How long a refresh subscription waits for its first push
    #[serde(default = "default_subscription_ttl")]
    pub subscription_ttl_secs: u64,

    /// How long a miss keeps waiting on the subscription once the fetch failed
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
}

impl DelegationConfig {
    pub fn program_pubkey(&self) -> Result<Pubkey, ConfigError> {
        Pubkey::from_str(&self.program_id).map_err(|e| {
            ConfigError::ValidationError(format!("Invalid delegation program id {}: {}", self.program_id, e))
        })
    }

    pub fn subscription_ttl(&self) -> Duration {
        Duration::from_secs(self.subscription_ttl_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            program_id: default_program_id(),
            commitment: Commitment::default(),
            subscription_ttl_secs: default_subscription_ttl(),
            refresh_timeout_secs: default_refresh_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    #[serde(default = "default_processed_timeout")]
    pub processed_timeout_secs: u64,

    #[serde(default = "default_confirmed_timeout")]
    pub confirmed_timeout_secs: u64,

    #[serde(default = "default_finalized_timeout")]
    pub finalized_timeout_secs: u64,

    /// Status polling interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            processed_timeout_secs: default_processed_timeout(),
            confirmed_timeout_secs: default_confirmed_timeout(),
            finalized_timeout_secs: default_finalized_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl From<&ConfirmationConfig> for ConfirmationSettings {
    fn from(config: &ConfirmationConfig) -> Self {
        Self {
            processed_timeout: Duration::from_secs(config.processed_timeout_secs),
            confirmed_timeout: Duration::from_secs(config.confirmed_timeout_secs),
            finalized_timeout: Duration::from_secs(config.finalized_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Emit logs as JSON
    #[serde(default)]
    pub json_logs: bool,

    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    #[serde(default)]
    pub log_filter: Option<String>,
}

// Default value functions
fn default_program_id() -> String { DEFAULT_DELEGATION_PROGRAM_ID.to_string() }
fn default_subscription_ttl() -> u64 { 60 }
fn default_refresh_timeout() -> u64 { 5 }
fn default_processed_timeout() -> u64 { 15 }
fn default_confirmed_timeout() -> u64 { 30 }
fn default_finalized_timeout() -> u64 { 60 }
fn default_poll_interval_ms() -> u64 { 400 }

/// `http(s)://` to `ws(s)://`; other schemes are returned unchanged
pub fn derive_ws_url(rpc_url: &str) -> String {
    if let Some(rest) = rpc_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = rpc_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        rpc_url.to_string()
    }
}

impl RouterConfig {
    /// Config with defaults everywhere except the base endpoint
    pub fn with_base(rpc_url: impl Into<String>) -> Self {
        Self {
            base: EndpointConfig::new(rpc_url),
            venues: Vec::new(),
            delegation: DelegationConfig::default(),
            confirmation: ConfirmationConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }

    /// Load and validate configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
        let config: RouterConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `.env` (if present) and then the TOML file
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_file(path)
    }

    /// Build configuration from environment variables
    ///
    /// - `ROUTER_BASE_RPC_URL` (required), `ROUTER_BASE_WS_URL`
    /// - `ROUTER_VENUES`: comma-separated `identity=rpc_url` pairs
    /// - `ROUTER_DELEGATION_PROGRAM_ID`
    pub fn from_env() -> Result<Self, ConfigError> {
        let rpc_url = std::env::var("ROUTER_BASE_RPC_URL")
            .map_err(|_| ConfigError::MissingEnvVar("ROUTER_BASE_RPC_URL".to_string()))?;

        let mut config = Self::with_base(rpc_url);
        config.base.ws_url = std::env::var("ROUTER_BASE_WS_URL").ok();

        if let Ok(venues) = std::env::var("ROUTER_VENUES") {
            config.venues = parse_venue_list(&venues)?;
        }
        if let Ok(program_id) = std::env::var("ROUTER_DELEGATION_PROGRAM_ID") {
            config.delegation.program_id = program_id;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint("base", &self.base)?;

        let mut seen = HashSet::new();
        for venue in &self.venues {
            let id = venue.venue_id()?;
            if !seen.insert(id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate venue identity: {}",
                    venue.identity
                )));
            }
            validate_endpoint(&venue.identity, &venue.endpoint)?;
        }

        self.delegation.program_pubkey()?;
        if self.delegation.subscription_ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "subscription_ttl_secs must be > 0".to_string(),
            ));
        }
        if self.delegation.refresh_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "refresh_timeout_secs must be > 0".to_string(),
            ));
        }

        let c = &self.confirmation;
        if c.processed_timeout_secs == 0 || c.confirmed_timeout_secs == 0 || c.finalized_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Confirmation timeouts must be > 0".to_string(),
            ));
        }
        if c.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn confirmation_settings(&self) -> ConfirmationSettings {
        ConfirmationSettings::from(&self.confirmation)
    }
}

fn validate_endpoint(name: &str, endpoint: &EndpointConfig) -> Result<(), ConfigError> {
    if !endpoint.rpc_url.starts_with("http://") && !endpoint.rpc_url.starts_with("https://") {
        return Err(ConfigError::ValidationError(format!(
            "Invalid RPC URL for {} (must start with http:// or https://): {}",
            name, endpoint.rpc_url
        )));
    }
    let ws_url = endpoint.websocket_url();
    if !ws_url.starts_with("ws://") && !ws_url.starts_with("wss://") {
        return Err(ConfigError::ValidationError(format!(
            "Invalid websocket URL for {} (must start with ws:// or wss://): {}",
            name, ws_url
        )));
    }
    Ok(())
}

fn parse_venue_list(raw: &str) -> Result<Vec<VenueConfig>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (identity, rpc_url) = entry.split_once('=').ok_or_else(|| {
                ConfigError::ParseError(format!("Expected identity=rpc_url, got {}", entry))
            })?;
            Ok(VenueConfig {
                identity: identity.trim().to_string(),
                endpoint: EndpointConfig::new(rpc_url.trim()),
            })
        })
        .collect()
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    ValidationError(String),
    MissingEnvVar(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(msg) => write!(f, "IO error: {}", msg),
            ConfigError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            ConfigError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            ConfigError::MissingEnvVar(var) => write!(f, "Missing environment variable: {}", var),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[base]
rpc_url = "https://api.devnet.solana.com"

[[venues]]
identity = "Vote111111111111111111111111111111111111111"
rpc_url = "https://devnet-eu.magicblock.app"

[[venues]]
identity = "Stake11111111111111111111111111111111111111"
rpc_url = "https://devnet-us.magicblock.app"
ws_url = "wss://devnet-us.magicblock.app/ws"

[confirmation]
finalized_timeout_secs = 90

[monitoring]
json_logs = true
"#;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file_with_defaults() {
        let file = write_config(SAMPLE);
        let config = RouterConfig::from_file(file.path()).unwrap();

        assert_eq!(config.venues.len(), 2);
        assert_eq!(config.base.websocket_url(), "wss://api.devnet.solana.com");
        assert_eq!(config.venues[1].endpoint.websocket_url(), "wss://devnet-us.magicblock.app/ws");
        assert_eq!(config.delegation.program_id, DEFAULT_DELEGATION_PROGRAM_ID);
        assert_eq!(config.delegation.commitment, Commitment::Confirmed);
        assert_eq!(config.delegation.subscription_ttl(), Duration::from_secs(60));
        assert_eq!(config.delegation.refresh_timeout(), Duration::from_secs(5));
        assert!(config.monitoring.json_logs);

        let settings = config.confirmation_settings();
        assert_eq!(settings.finalized_timeout, Duration::from_secs(90));
        assert_eq!(settings.confirmed_timeout, Duration::from_secs(30));
        assert_eq!(settings.poll_interval, Duration::from_millis(400));
    }

    #[test]
    fn test_duplicate_venue_rejected() {
        let venue = VenueConfig {
            identity: Pubkey::new_unique().to_string(),
            endpoint: EndpointConfig::new("https://venue.example"),
        };
        let mut config = RouterConfig::with_base("https://base.example");
        config.venues = vec![venue.clone(), venue];

        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(msg)) if msg.contains("Duplicate")));
    }

    #[test]
    fn test_invalid_identity_and_urls_rejected() {
        let mut config = RouterConfig::with_base("https://base.example");
        config.venues.push(VenueConfig {
            identity: "not-a-pubkey".to_string(),
            endpoint: EndpointConfig::new("https://venue.example"),
        });
        assert!(config.validate().is_err());

        let config = RouterConfig::with_base("ftp://base.example");
        assert!(config.validate().is_err());

        let mut config = RouterConfig::with_base("https://base.example");
        config.base.ws_url = Some("https://not-a-websocket".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = RouterConfig::with_base("https://base.example");
        config.confirmation.confirmed_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = RouterConfig::with_base("https://base.example");
        config.delegation.subscription_ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = RouterConfig::with_base("https://base.example");
        config.delegation.refresh_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = RouterConfig::from_file("/nonexistent/router.toml");
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let file = write_config("[base\nrpc_url = 1");
        assert!(matches!(RouterConfig::from_file(file.path()), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_parse_venue_list() {
        let id = Pubkey::new_unique();
        let venues = parse_venue_list(&format!(" {}=http://localhost:7799 ,", id)).unwrap();
        assert_eq!(venues.len(), 1);
        assert_eq!(venues[0].venue_id().unwrap(), VenueId(id));
        assert_eq!(venues[0].endpoint.websocket_url(), "ws://localhost:7799");

        assert!(parse_venue_list("missing-separator").is_err());
    }

    #[test]
    fn test_derive_ws_url() {
        assert_eq!(derive_ws_url("https://a.b/c"), "wss://a.b/c");
        assert_eq!(derive_ws_url("http://127.0.0.1:8899"), "ws://127.0.0.1:8899");
        assert_eq!(derive_ws_url("ws://x"), "ws://x");
    }
}
