//! Node RPC: the JSON-RPC wire types, the [`ChainSource`] seam the pipelines
//! fetch through, and the HTTP client that implements it.

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::types::*;

pub use client::RpcClient;

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub id: u64,
}

impl RpcRequest {
    pub fn new(id: u64, method: &str, params: serde_json::Value) -> Self {
        RpcRequest { jsonrpc: "2.0".to_string(), method: method.to_string(), params, id }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
    #[serde(default)]
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i32,
    pub message: String,
}

/// Which blocks to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockQuery {
    Heights(Vec<u64>),
    Hashes(Vec<String>),
}

/// Everything the indexer reads from (or sends to) the node
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Blocks with full transactions, in request order
    async fn get_blocks(&self, query: BlockQuery) -> Result<Vec<Block>, RpcError>;
    async fn get_chain_info(&self) -> Result<ChainInfo, RpcError>;
    /// Txids currently in the node's mempool
    async fn get_mempool(&self) -> Result<Vec<String>, RpcError>;
    async fn get_raw_transactions(&self, txids: &[String]) -> Result<Vec<Tx>, RpcError>;
    async fn send_raw_transaction(&self, hex: &str) -> Result<String, RpcError>;
}

/// Node is still loading its block index
const RPC_IN_WARMUP: i32 = -28;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("{method}: request failed: {source}")]
    Http { method: String, source: reqwest::Error },
    #[error("{method}: HTTP {status}: {body}")]
    Status { method: String, status: u16, body: String },
    #[error("{method}({arg}): node error {code}: {message}")]
    Node { method: String, arg: String, code: i32, message: String },
    #[error("{method}: cannot decode response: {message}")]
    Decode { method: String, message: String },
    #[error("{method}: expected {expected} results, got {got}")]
    Mismatch { method: String, expected: usize, got: usize },
    #[error("{method}({arg}): empty result")]
    MissingResult { method: String, arg: String },
}

impl RpcError {
    /// Connection trouble or a node that is still warming up; worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Http { .. } => true,
            RpcError::Status { status, .. } => *status >= 500 || *status == 429,
            RpcError::Node { code, .. } => *code == RPC_IN_WARMUP,
            _ => false,
        }
    }
}
