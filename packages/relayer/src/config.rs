use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ::config::{Environment, File, FileFormat};
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;

use crate::connector::{ChainConnector, GatewayConnector};
use crate::coordinator::CoordinatorConfig;
use crate::pipeline::PipelineConfig;
use crate::types::{
    ChainDescriptor, ChainId, ChainRole, HandlerKind, HandlerRef, RelayerIdentity, ResourceId,
    ResourceRegistry, StartMode,
};
use crate::watchers::WatcherConfig;
use crate::writers::RetryConfig;

/// Config file used when `RELAYER_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "relayer.toml";

/// Main configuration for the relayer
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Required unless `relayer.memory_checkpoints` is set
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    pub chains: Vec<ChainConfig>,
}

/// Process-wide tuning
#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    /// Identity used on every destination chain without its own
    #[serde(default)]
    pub identity: Option<RelayerIdentity>,
    /// Gateway head polling period
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Proposal state refresh and pipeline tick period
    #[serde(default = "default_state_refresh")]
    pub state_refresh_ms: u64,
    #[serde(default = "default_tx_timeout")]
    pub tx_timeout_ms: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_deposit_buffer")]
    pub deposit_buffer: usize,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    /// Keep checkpoints and pending deposits in memory; lost on restart
    #[serde(default)]
    pub memory_checkpoints: bool,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            identity: None,
            poll_interval_ms: default_poll_interval(),
            state_refresh_ms: default_state_refresh(),
            tx_timeout_ms: default_tx_timeout(),
            max_block_range: default_max_block_range(),
            retry: RetrySettings::default(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            deposit_buffer: default_deposit_buffer(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            memory_checkpoints: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Health/status/metrics listener
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// One bridged chain
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: ChainId,
    pub name: String,
    /// Gateway JSON-RPC endpoint
    pub endpoint: String,
    /// Bridge contract address (hex)
    pub bridge_address: String,
    pub confirmation_depth: u64,
    #[serde(default)]
    pub role: ChainRole,
    #[serde(default)]
    pub start_mode: StartMode,
    #[serde(default)]
    pub start_block: u64,
    /// Overrides `relayer.identity` on this chain
    #[serde(default)]
    pub identity: Option<RelayerIdentity>,
    #[serde(default)]
    pub vote_threshold: Option<u32>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    pub resource_id: ResourceId,
    /// Handler contract address (hex)
    pub handler: String,
    pub kind: HandlerKind,
}

/// Default functions
fn default_poll_interval() -> u64 {
    1000
}

fn default_state_refresh() -> u64 {
    5000
}

fn default_tx_timeout() -> u64 {
    300_000
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_circuit_breaker_threshold() -> u32 {
    10
}

fn default_deposit_buffer() -> usize {
    1024
}

fn default_shutdown_timeout() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    2000
}

fn default_max_backoff() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    9090
}

fn decode_address(what: &str, value: &str) -> Result<Vec<u8>> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    let bytes = hex::decode(stripped).wrap_err_with(|| format!("{} is not valid hex", what))?;
    if bytes.is_empty() || bytes.len() > 32 {
        return Err(eyre!("{} must be 1..=32 bytes, got {}", what, bytes.len()));
    }
    Ok(bytes)
}

impl Config {
    /// Load configuration from `RELAYER_CONFIG` (or `relayer.toml`) plus the environment
    pub fn load() -> Result<Self> {
        // Try to load .env file, ignore if not found
        let _ = dotenvy::dotenv();

        let path = env::var("RELAYER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Load from a TOML file, overlaid by `RELAYER__SECTION__KEY` variables
    /// and `DATABASE_URL`
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config: Config = ::config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix("RELAYER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .wrap_err_with(|| format!("Failed to read configuration from {}", path.display()))?
            .try_deserialize()
            .wrap_err("Invalid configuration")?;

        if let Ok(url) = env::var("DATABASE_URL") {
            if !url.is_empty() {
                config.database = Some(DatabaseConfig { url });
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = ::config::Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
            .wrap_err("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            return Err(eyre!("at least one chain must be configured"));
        }
        if self.relayer.max_block_range == 0 {
            return Err(eyre!("relayer.max_block_range must be greater than 0"));
        }
        if self.relayer.state_refresh_ms == 0 || self.relayer.poll_interval_ms == 0 {
            return Err(eyre!("relayer intervals must be greater than 0"));
        }
        if self.relayer.retry.max_retries == 0 {
            return Err(eyre!("relayer.retry.max_retries must be at least 1"));
        }
        if self.relayer.retry.backoff_multiplier < 1.0 {
            return Err(eyre!("relayer.retry.backoff_multiplier must be >= 1.0"));
        }
        if self.relayer.deposit_buffer == 0 {
            return Err(eyre!("relayer.deposit_buffer must be greater than 0"));
        }
        if let Some(database) = &self.database {
            if database.url.is_empty() {
                return Err(eyre!("database.url cannot be empty"));
            }
        }

        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(eyre!("chain id {} is configured more than once", chain.chain_id));
            }
            if chain.endpoint.is_empty() {
                return Err(eyre!(
                    "chain {} ({}): endpoint cannot be empty",
                    chain.chain_id,
                    chain.name
                ));
            }
            decode_address(
                &format!("chain {} bridge_address", chain.chain_id),
                &chain.bridge_address,
            )?;
            if chain.vote_threshold == Some(0) {
                return Err(eyre!("chain {}: vote_threshold must be at least 1", chain.chain_id));
            }
            if chain.role.is_destination() && chain.identity.or(self.relayer.identity).is_none() {
                return Err(eyre!(
                    "chain {}: destination chains need an identity \
                     (chains[].identity or relayer.identity)",
                    chain.chain_id
                ));
            }

            let mut resources = HashSet::new();
            for resource in &chain.resources {
                if !resources.insert(resource.resource_id) {
                    return Err(eyre!(
                        "chain {}: resource {} is registered more than once",
                        chain.chain_id,
                        resource.resource_id
                    ));
                }
                decode_address(
                    &format!("chain {} handler for {}", chain.chain_id, resource.resource_id),
                    &resource.handler,
                )?;
            }
        }

        if self.database.is_none() && !self.relayer.memory_checkpoints {
            return Err(eyre!(
                "no checkpoint database: set database.url or DATABASE_URL \
                 (or relayer.memory_checkpoints = true for a non-durable run)"
            ));
        }

        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        let retry = &self.relayer.retry;
        RetryConfig {
            max_retries: retry.max_retries,
            initial_backoff: Duration::from_millis(retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(retry.max_backoff_ms),
            backoff_multiplier: retry.backoff_multiplier,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.relayer.poll_interval_ms)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let retry = self.retry_config();
        let breaker = self.relayer.circuit_breaker_threshold;

        CoordinatorConfig {
            watcher: WatcherConfig {
                max_block_range: self.relayer.max_block_range,
                retry: retry.clone(),
                circuit_breaker_threshold: breaker,
                ..WatcherConfig::default()
            },
            pipeline: PipelineConfig {
                refresh_interval: Duration::from_millis(self.relayer.state_refresh_ms),
                retry,
                tx_timeout: Duration::from_millis(self.relayer.tx_timeout_ms),
                circuit_breaker_threshold: breaker,
            },
            deposit_buffer: self.relayer.deposit_buffer,
            shutdown_timeout: Duration::from_millis(self.relayer.shutdown_timeout_ms),
        }
    }

    /// Build chain descriptors, asking `connect` for each chain's connector
    pub fn chain_descriptors<F>(&self, mut connect: F) -> Result<Vec<ChainDescriptor>>
    where
        F: FnMut(&ChainConfig) -> Result<Arc<dyn ChainConnector>>,
    {
        self.chains
            .iter()
            .map(|chain| {
                let resources = chain
                    .resources
                    .iter()
                    .map(|resource| {
                        let address = decode_address("handler", &resource.handler)?;
                        Ok((
                            resource.resource_id,
                            HandlerRef {
                                kind: resource.kind,
                                address,
                            },
                        ))
                    })
                    .collect::<Result<BTreeMap<_, _>>>()?;

                Ok(ChainDescriptor {
                    chain_id: chain.chain_id,
                    name: chain.name.clone(),
                    connector: connect(chain)?,
                    bridge_address: decode_address("bridge_address", &chain.bridge_address)?,
                    confirmation_depth: chain.confirmation_depth,
                    resources: ResourceRegistry::new(resources),
                    // Source-only chains never sign anything
                    identity: chain.identity.or(self.relayer.identity).unwrap_or_default(),
                    vote_threshold: chain.vote_threshold,
                    role: chain.role,
                    start_mode: chain.start_mode,
                    start_block: chain.start_block,
                })
            })
            .collect()
    }

    /// Descriptors backed by gateway JSON-RPC connectors
    pub fn gateway_descriptors(&self) -> Result<Vec<ChainDescriptor>> {
        let poll_interval = self.poll_interval();
        self.chain_descriptors(|chain| {
            let connector =
                GatewayConnector::new(chain.chain_id, chain.endpoint.clone(), poll_interval)
                    .wrap_err_with(|| {
                        format!("Failed to create connector for chain {}", chain.chain_id)
                    })?;
            Ok(Arc::new(connector) as Arc<dyn ChainConnector>)
        })
    }
}
