use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use serde::Deserialize;

use crate::domain::lock::ChainId;
use crate::ports::ChainCapability;

/// Top-level oracle configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    pub chains: Vec<ChainConfig>,
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub relay: RelayConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Per-chain configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub id: ChainId,
    pub rpc_url: String,
    /// Hex private key of the account that signs unlocks on this chain.
    pub operator_key: String,
    pub bridge_address: Address,
    /// `lock`, `unlock` or `both` (default).
    #[serde(default)]
    pub capability: ChainCapability,
    /// Block at which the bridge was deployed; scanning never starts earlier.
    #[serde(default)]
    pub deployment_block: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
}

/// A directed chain pair: locks observed on `source` are unlocked on `target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct RouteConfig {
    pub source: ChainId,
    pub target: ChainId,
}

impl RouteConfig {
    /// Key under which the route's scan cursor is persisted.
    pub fn name(&self) -> String {
        format!("{}->{}", self.source, self.target)
    }
}

/// Relay pipeline tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub finality_confirmations: u64,
    pub max_retry_attempts: u32,
    pub worker_pool_size: usize,
    /// Interval between chain polls (e.g. "4s").
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub finality_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    /// Deadline for one chain RPC call.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    /// How often non-terminal relays nobody is driving are picked up again.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Verify the stored credential automatically instead of waiting for the
    /// holder to present it.
    pub auto_present: bool,
    pub store_path: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            finality_confirmations: 12,
            max_retry_attempts: 5,
            worker_pool_size: 8,
            poll_interval: Duration::from_secs(4),
            finality_timeout: Duration::from_secs(600),
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            rpc_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            auto_present: true,
            store_path: PathBuf::from("data/relay-oracle"),
        }
    }
}

/// Identity agent connection.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Admin API base URL
    pub url: String,
    pub connection_id: String,
    #[serde(default = "default_did_method")]
    pub did_method: String,
    #[serde(with = "humantime_serde", default = "default_credential_ttl")]
    pub credential_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_agent_poll")]
    pub poll_interval: Duration,
}

/// Operator HTTP API.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

fn default_gas_limit() -> u64 {
    200_000
}

fn default_did_method() -> String {
    "did:ethr".to_string()
}

fn default_credential_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_agent_poll() -> Duration {
    Duration::from_secs(1)
}

/// Errors from config loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

impl OracleConfig {
    /// Load and validate a config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn chain(&self, id: &ChainId) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| &c.id == id)
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chains.is_empty() {
            return Err(ConfigError::Validation("at least one chain is required".into()));
        }

        let mut ids = HashSet::new();
        for chain in &self.chains {
            if !ids.insert(&chain.id) {
                return Err(ConfigError::Validation(format!(
                    "duplicate chain id {}",
                    chain.id
                )));
            }
            Self::validate_chain(chain)?;
        }

        if self.routes.is_empty() {
            return Err(ConfigError::Validation("at least one route is required".into()));
        }
        let mut routes = HashSet::new();
        for route in &self.routes {
            if !routes.insert(route) {
                return Err(ConfigError::Validation(format!(
                    "duplicate route {}",
                    route.name()
                )));
            }
            self.validate_route(route)?;
        }

        let relay = &self.relay;
        if relay.finality_confirmations < 1 {
            return Err(ConfigError::Validation(
                "relay.finality_confirmations must be at least 1".into(),
            ));
        }
        if relay.max_retry_attempts < 1 {
            return Err(ConfigError::Validation(
                "relay.max_retry_attempts must be at least 1".into(),
            ));
        }
        if relay.worker_pool_size < 1 {
            return Err(ConfigError::Validation(
                "relay.worker_pool_size must be at least 1".into(),
            ));
        }
        if relay.poll_interval.is_zero() {
            return Err(ConfigError::Validation("relay.poll_interval must be non-zero".into()));
        }
        if relay.rpc_timeout.is_zero() || relay.sweep_interval.is_zero() {
            return Err(ConfigError::Validation(
                "relay.rpc_timeout and relay.sweep_interval must be non-zero".into(),
            ));
        }
        if relay.backoff_base > relay.backoff_max {
            return Err(ConfigError::Validation(
                "relay.backoff_base must not exceed relay.backoff_max".into(),
            ));
        }

        if self.agent.url.parse::<reqwest::Url>().is_err() {
            return Err(ConfigError::Validation(format!(
                "agent.url is not a valid URL: {}",
                self.agent.url
            )));
        }
        if self.agent.connection_id.trim().is_empty() {
            return Err(ConfigError::Validation("agent.connection_id is empty".into()));
        }
        if self.agent.credential_ttl < Duration::from_secs(1) {
            return Err(ConfigError::Validation(
                "agent.credential_ttl must be at least 1s".into(),
            ));
        }

        Ok(())
    }

    fn validate_chain(chain: &ChainConfig) -> Result<(), ConfigError> {
        let id = &chain.id;
        if id.as_str().trim().is_empty() {
            return Err(ConfigError::Validation("chain id is empty".into()));
        }
        if chain.rpc_url.parse::<reqwest::Url>().is_err() {
            return Err(ConfigError::Validation(format!(
                "{id}: rpc_url is not a valid URL"
            )));
        }
        if chain.operator_key.parse::<PrivateKeySigner>().is_err() {
            return Err(ConfigError::Validation(format!(
                "{id}: operator_key is not a valid private key"
            )));
        }
        if chain.bridge_address == Address::ZERO {
            return Err(ConfigError::Validation(format!(
                "{id}: bridge_address must be non-zero"
            )));
        }
        if chain.gas_limit == 0 {
            return Err(ConfigError::Validation(format!("{id}: gas_limit must be non-zero")));
        }
        Ok(())
    }

    fn validate_route(&self, route: &RouteConfig) -> Result<(), ConfigError> {
        if route.source == route.target {
            return Err(ConfigError::Validation(format!(
                "route {} has identical source and target",
                route.name()
            )));
        }
        let source = self.chain(&route.source).ok_or_else(|| {
            ConfigError::Validation(format!("route {}: unknown source chain", route.name()))
        })?;
        let target = self.chain(&route.target).ok_or_else(|| {
            ConfigError::Validation(format!("route {}: unknown target chain", route.name()))
        })?;
        if !source.capability.can_lock() {
            return Err(ConfigError::Validation(format!(
                "route {}: source chain cannot lock",
                route.name()
            )));
        }
        if !target.capability.can_unlock() {
            return Err(ConfigError::Validation(format!(
                "route {}: target chain cannot unlock",
                route.name()
            )));
        }
        Ok(())
    }
}
