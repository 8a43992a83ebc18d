//! Process configuration (spec.md §6 config keys).
//!
//! Follows a layered precedence — CLI flags, falling back to environment
//! variables, falling back to hardcoded defaults — but resolves it through
//! `clap`'s `env` feature directly rather than a JSON-file +
//! `serde` default-function scheme, since this process has no per-chain
//! nested configuration to justify a config file.

use std::net::IpAddr;
use std::path::PathBuf;

use alloy_primitives::Address;
use clap::Parser;
use url::Url;

#[derive(Parser, Debug, Clone)]
#[command(name = "dex-proxy")]
#[command(about = "Request lifecycle proxy fronting a DEX execution venue")]
pub struct Config {
    /// Address to bind the HTTP/WS server to.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to bind the HTTP/WS server to.
    #[arg(long, env = "PORT", default_value_t = config_defaults::default_port())]
    pub port: u16,

    /// JSON-RPC HTTP endpoint for the reference EVM chain client.
    #[arg(long, env = "RPC_URL")]
    pub rpc_url: Url,

    /// Private key (hex, 0x-prefixed) the signer worker pool signs with.
    #[arg(long, env = "EVM_PRIVATE_KEY")]
    pub evm_private_key: String,

    /// Reference venue router contract address.
    #[arg(long, env = "REFERENCE_ROUTER_ADDRESS")]
    pub reference_router_address: Address,

    /// Optional comma-separated `SYMBOL=ADDRESS` token map for the reference adaptor.
    #[arg(long, env = "REFERENCE_TOKEN_ADDRESSES", value_delimiter = ',')]
    pub reference_token_addresses: Vec<String>,

    /// Receipt/target-block poll cadence, in seconds (spec.md §4.2).
    #[arg(long, env = "POLL_INTERVAL_S", default_value_t = 2)]
    pub poll_interval_s: u64,

    /// How long after finalisation a request is cleaned from the in-memory
    /// index and its durable entry deleted (spec.md §4.4).
    #[arg(long, env = "FINALISED_REQUESTS_CLEANUP_AFTER_S", default_value_t = 86_400)]
    pub finalised_requests_cleanup_after_s: u64,

    /// Whether to persist the Request Cache to Redis (spec.md §4.4).
    #[arg(long, env = "STORE_IN_REDIS", default_value_t = false)]
    pub store_in_redis: bool,

    /// Redis connection URL, required when `store_in_redis` is set.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Ceiling on the gas price (gwei) this process will ever submit at
    /// (spec.md §4.1 "gas price cap").
    #[arg(long, env = "MAX_ALLOWED_GAS_PRICE_GWEI", default_value_t = 500)]
    pub max_allowed_gas_price_gwei: u64,

    /// Size of the CPU-bound signature-generation worker pool (`signer.rs`).
    #[arg(long, env = "MAX_SIGNATURE_GENERATORS", default_value_t = 4)]
    pub max_signature_generators: usize,

    /// Logical process name, used as the Redis hash-key prefix and in logs.
    #[arg(long, env = "PROCESS_NAME", default_value = "dex-proxy")]
    pub process_name: String,

    /// Optional path to a base withdrawal-address whitelist file (`whitelist.rs`).
    #[arg(long, env = "WHITELIST_PATH")]
    pub whitelist_path: Option<PathBuf>,

    /// `tracing_subscriber::EnvFilter` directive, e.g. `dex_proxy=debug,info`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

mod config_defaults {
    pub fn default_port() -> u16 {
        8080
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("store_in_redis is set but redis_url is missing")]
    MissingRedisUrl,
    #[error("reference_token_addresses entry is not SYMBOL=ADDRESS: {0}")]
    BadTokenEntry(String),
}

impl Config {
    /// Loads `.env` (if present) then parses CLI args/environment (spec.md §6).
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.store_in_redis && self.redis_url.is_none() {
            return Err(ConfigError::MissingRedisUrl);
        }
        Ok(())
    }

    /// Parses `reference_token_addresses` into a symbol → address map.
    pub fn token_addresses(&self) -> Result<std::collections::HashMap<String, Address>, ConfigError> {
        let mut map = std::collections::HashMap::new();
        for entry in &self.reference_token_addresses {
            let (symbol, address) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::BadTokenEntry(entry.clone()))?;
            let address: Address = address
                .parse()
                .map_err(|_| ConfigError::BadTokenEntry(entry.clone()))?;
            map.insert(symbol.to_string(), address);
        }
        Ok(map)
    }
}
