//! Typed configuration, loaded with the `config` crate layering a TOML
//! file under environment-variable overrides (`WFGW_*`), one struct
//! per concern (`rpc`, `listener`, `confirmation`).

use std::path::Path;

use bitcoin::Network;
use serde::Deserialize;

use crate::confirmation::ConfirmationConfig;
use crate::listener::ListenerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_rpc_path")]
    pub path: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_rpc_path() -> String {
    "/".to_string()
}

fn default_timeout_ms() -> u64 {
    crate::rpc::client::DEFAULT_TIMEOUT_MS
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub network: Network,
    #[serde(default)]
    pub enabled: bool,
    pub rpc: RpcConfig,
    #[serde(default)]
    pub listener: ListenerConfigToml,
    #[serde(default)]
    pub transaction_fee: Option<u64>,
    /// Auto-provisions one account for this chain at startup if none
    /// exist yet, mirroring the protocol's `createAccount` operation.
    #[serde(default)]
    pub create_account: bool,
    /// Logs the raw transaction hex at `debug` level whenever the
    /// builder broadcasts, for node-side troubleshooting.
    #[serde(default)]
    pub trace_raw_transaction: bool,
}

/// `ListenerConfig`'s serde-friendly mirror: the runtime type carries a
/// `Duration`-shaped clamp method that doesn't round-trip through TOML
/// cleanly, so configuration is deserialized into this shape first and
/// converted explicitly.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListenerConfigToml {
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub end_block: Option<u64>,
    #[serde(default = "default_restart_window")]
    pub restart_window: u64,
    #[serde(default = "default_retrieval_interval")]
    pub retrieval_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_batch_size")]
    pub transaction_batch_size: usize,
    #[serde(default = "default_reorg_window")]
    pub reorg_window: usize,
}

fn default_restart_window() -> u64 {
    1000
}
fn default_retrieval_interval() -> u64 {
    crate::listener::DEFAULT_RETRIEVAL_INTERVAL_MS
}
fn default_max_retries() -> u32 {
    5
}
fn default_batch_size() -> usize {
    128
}
fn default_reorg_window() -> usize {
    6
}

impl From<ListenerConfigToml> for ListenerConfig {
    fn from(value: ListenerConfigToml) -> Self {
        ListenerConfig {
            configured_start: value.start_block,
            configured_end: value.end_block,
            restart_window: value.restart_window,
            retrieval_interval_ms: value.retrieval_interval_ms,
            max_retries: value.max_retries,
            transaction_batch_size: value.transaction_batch_size,
            reorg_window: value.reorg_window,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationConfigToml {
    #[serde(default = "default_confirmation_depth")]
    pub depth: u64,
    #[serde(default = "default_confirmation_interval")]
    pub interval_ms: u64,
    #[serde(default)]
    pub update_each_block: bool,
}

fn default_confirmation_depth() -> u64 {
    crate::confirmation::DEFAULT_CONFIRMATION_DEPTH
}
fn default_confirmation_interval() -> u64 {
    crate::confirmation::DEFAULT_POLL_INTERVAL_MS
}

impl Default for ConfirmationConfigToml {
    fn default() -> Self {
        Self {
            depth: default_confirmation_depth(),
            interval_ms: default_confirmation_interval(),
            update_each_block: false,
        }
    }
}

impl From<ConfirmationConfigToml> for ConfirmationConfig {
    fn from(value: ConfirmationConfigToml) -> Self {
        ConfirmationConfig {
            depth: value.depth,
            poll_interval_ms: value.interval_ms,
            update_each_block: value.update_each_block,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub log_level: Option<String>,
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub confirmation: ConfirmationConfigToml,
}

impl GatewayConfig {
    /// Loads configuration from `path`, layering `WFGW_`-prefixed
    /// environment variables on top (double-underscore separated, e.g.
    /// `WFGW_CHAINS__0__ENABLED=false`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("WFGW").separator("__"))
            .build()?;
        settings.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_single_chain_config() {
        let toml = r#"
            [[chains]]
            name = "bitcoin"
            network = "regtest"
            enabled = true

            [chains.rpc]
            protocol = "http"
            host = "127.0.0.1"
            port = 18443
        "#;
        let parsed: GatewayConfig = toml::from_str(toml).unwrap();
        assert_eq!(parsed.chains.len(), 1);
        assert_eq!(parsed.chains[0].rpc.path, "/");
        assert_eq!(parsed.chains[0].rpc.timeout_ms, crate::rpc::client::DEFAULT_TIMEOUT_MS);
        assert_eq!(parsed.confirmation.depth, crate::confirmation::DEFAULT_CONFIRMATION_DEPTH);
    }
}
