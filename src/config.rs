use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::params::revalidate_offset;

pub const DEFAULT_CONFIG_PATH: &str = "config/local.json";

/// Top-level JSON config. One file describes every coin; `--coin` picks the section in use.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub coins: Vec<CoinConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub attempts: u32,
    /// Seconds between attempts (the initial delay for backoff)
    pub sleep: u64,
}

impl RetryConfig {
    pub fn sleep(&self) -> Duration { Duration::from_secs(self.sleep) }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig { attempts: 3, sleep: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DbConfig {
    /// Root directory; each coin gets its own database below it
    pub path: PathBuf,
    /// Concurrent store operations allowed at once, across every stage
    pub max_conns: usize,
    /// Transaction writer / deleter workers
    pub threads: usize,
    /// Per-operation deadline in seconds
    pub timeout: u64,
    pub retry: RetryConfig,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            path: PathBuf::from("indexer_data"),
            max_conns: num_cpus::get() * 2,
            threads: num_cpus::get(),
            timeout: 30,
            retry: RetryConfig::default(),
        }
    }
}

impl DbConfig {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout) }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcConfig {
    /// Block / transaction fetch workers
    pub threads: usize,
    /// Per-request deadline in seconds
    pub timeout: u64,
    pub retry: RetryConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            threads: num_cpus::get(),
            timeout: 30,
            retry: RetryConfig { attempts: 5, sleep: 1 },
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout) }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinConfig {
    pub name: String,
    pub rpc: NodeRpcConfig,
    #[serde(default)]
    pub zmq: Option<ZmqConfig>,
    #[serde(default)]
    pub monitor_url: Option<String>,
    #[serde(default)]
    pub revalidate_offset: Option<u64>,
    /// Overrides `<db.path>/<name>`
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl CoinConfig {
    pub fn revalidate_offset(&self) -> u64 {
        self.revalidate_offset.unwrap_or_else(|| revalidate_offset(&self.name))
    }

    pub fn db_path(&self, db: &DbConfig) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| db.path.join(&self.name))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRpcConfig {
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZmqConfig {
    pub sub_url: String,
    /// Receive deadline in seconds; a quiet socket past this is treated as dead
    #[serde(default = "default_zmq_timeout")]
    pub timeout: u64,
    #[serde(default = "default_subs")]
    pub subs: Vec<String>,
}

impl ZmqConfig {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout) }
}

fn default_zmq_timeout() -> u64 { 30 * 60 }

fn default_subs() -> Vec<String> {
    vec!["hashblock".to_string(), "hashtx".to_string()]
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read { path: path.to_path_buf(), source: e })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw)?;
        if config.db.threads == 0 || config.rpc.threads == 0 || config.db.max_conns == 0 {
            return Err(ConfigError::Invalid("thread and connection counts must be positive".into()));
        }
        Ok(config)
    }

    pub fn coin(&self, name: &str) -> Result<&CoinConfig, ConfigError> {
        self.coins.iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ConfigError::UnknownCoin(name.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("coin {0} not found in config")]
    UnknownCoin(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}
