use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::*;
use crate::config::{NodeRpcConfig, RetryConfig, RpcConfig};
use crate::retry;

/// Coins whose `getblock` cannot inline transactions
const NO_VERBOSE_BLOCKS: &[&str] = &["doge"];

/// JSON-RPC 2.0 client for a bitcoind-style node
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    retry: RetryConfig,
    verbose_blocks: bool,
}

/// `getblock` at verbosity 1: header plus txids only
#[derive(Debug, Deserialize)]
struct RawBlock {
    #[serde(flatten)]
    header: BlockHeader,
    #[serde(default)]
    tx: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BlockchainInfo {
    #[serde(default)]
    chain: String,
    blocks: u64,
    #[serde(default)]
    headers: u64,
    #[serde(rename = "bestblockhash", default)]
    best_block_hash: String,
    #[serde(default)]
    difficulty: f64,
    #[serde(default)]
    size_on_disk: u64,
    #[serde(default)]
    warnings: Value,
}

#[derive(Debug, Deserialize)]
struct NetworkInfo {
    #[serde(default)]
    version: i64,
    #[serde(default)]
    subversion: String,
    #[serde(rename = "protocolversion", default)]
    protocol_version: i64,
    #[serde(rename = "timeoffset", default)]
    time_offset: i64,
}

impl RpcClient {
    pub fn new(node: &NodeRpcConfig, rpc: &RpcConfig, coin: &str) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(rpc.timeout())
            .build()
            .map_err(|e| RpcError::Http { method: "connect".into(), source: e })?;
        Ok(RpcClient {
            http,
            url: node.url.clone(),
            user: node.user.clone(),
            password: node.password.clone(),
            retry: rpc.retry,
            verbose_blocks: !NO_VERBOSE_BLOCKS.contains(&coin),
        })
    }

    /// Single call
    pub async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R, RpcError> {
        let arg = params.to_string();
        let body = serde_json::to_value(RpcRequest::new(0, method, params))
            .map_err(|e| decode_err(method, e))?;
        let raw = self.post(method, &body).await?;
        let response: RpcResponse = serde_json::from_value(raw).map_err(|e| decode_err(method, e))?;
        unpack(method, &arg, response)
    }

    /// One request per params entry in a single round trip. Results come back in
    /// request order whatever order the node answers in; any element error fails the batch.
    pub async fn batch<R: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<Vec<R>, RpcError> {
        if params.is_empty() {
            return Ok(Vec::new());
        }
        let args: Vec<String> = params.iter().map(|p| p.to_string()).collect();
        let requests: Vec<RpcRequest> = params.into_iter()
            .enumerate()
            .map(|(i, p)| RpcRequest::new(i as u64, method, p))
            .collect();
        let body = serde_json::to_value(&requests).map_err(|e| decode_err(method, e))?;

        let raw = self.post(method, &body).await?;
        let mut responses: Vec<RpcResponse> = serde_json::from_value(raw).map_err(|e| decode_err(method, e))?;
        if responses.len() != args.len() {
            return Err(RpcError::Mismatch { method: method.into(), expected: args.len(), got: responses.len() });
        }
        responses.sort_by_key(|r| r.id);

        responses.into_iter()
            .enumerate()
            .map(|(i, response)| {
                if response.id != i as u64 {
                    return Err(RpcError::Decode {
                        method: method.into(),
                        message: format!("response id {} where {} was expected", response.id, i),
                    });
                }
                unpack(method, &args[i], response)
            })
            .collect()
    }

    async fn post(&self, method: &str, body: &Value) -> Result<Value, RpcError> {
        retry::backoff(self.retry, RpcError::is_transient, || self.post_once(method, body)).await
    }

    async fn post_once(&self, method: &str, body: &Value) -> Result<Value, RpcError> {
        let mut request = self.http.post(&self.url).json(body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }
        let response = request.send().await
            .map_err(|e| RpcError::Http { method: method.into(), source: e })?;
        let status = response.status();
        let bytes = response.bytes().await
            .map_err(|e| RpcError::Http { method: method.into(), source: e })?;

        // bitcoind answers RPC errors on single calls with HTTP 500 and a JSON body
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) if value.is_object() || value.is_array() => {
                if status.is_success() || value.get("error").is_some_and(|e| !e.is_null()) {
                    return Ok(value);
                }
                Err(RpcError::Status { method: method.into(), status: status.as_u16(), body: value.to_string() })
            }
            _ => Err(RpcError::Status {
                method: method.into(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).chars().take(200).collect(),
            }),
        }
    }

    async fn blocks_by_hash(&self, hashes: Vec<String>) -> Result<Vec<Block>, RpcError> {
        if self.verbose_blocks {
            let params = hashes.iter().map(|h| json!([h, 2])).collect();
            return self.batch::<Block>("getblock", params).await;
        }

        let params = hashes.iter().map(|h| json!([h, true])).collect();
        let raw = self.batch::<RawBlock>("getblock", params).await?;
        let mut blocks = Vec::with_capacity(raw.len());
        for block in raw {
            // the genesis coinbase is not retrievable through getrawtransaction
            let txs = if block.header.height == 0 {
                Vec::new()
            } else {
                self.get_raw_transactions(&block.tx).await?
            };
            blocks.push(Block { header: block.header, txs });
        }
        Ok(blocks)
    }
}

#[async_trait]
impl ChainSource for RpcClient {
    async fn get_blocks(&self, query: BlockQuery) -> Result<Vec<Block>, RpcError> {
        let hashes = match query {
            BlockQuery::Hashes(hashes) => hashes,
            BlockQuery::Heights(heights) => {
                let params = heights.iter().map(|h| json!([h])).collect();
                self.batch::<String>("getblockhash", params).await?
            }
        };
        self.blocks_by_hash(hashes).await
    }

    async fn get_chain_info(&self) -> Result<ChainInfo, RpcError> {
        let chain: BlockchainInfo = self.call("getblockchaininfo", json!([])).await?;
        let network: NetworkInfo = self.call("getnetworkinfo", json!([])).await?;
        let warnings = match chain.warnings {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        Ok(ChainInfo {
            chain: chain.chain,
            blocks: chain.blocks,
            headers: chain.headers,
            best_block_hash: chain.best_block_hash,
            difficulty: chain.difficulty,
            size_on_disk: chain.size_on_disk,
            version: network.version,
            subversion: network.subversion,
            protocol_version: network.protocol_version,
            time_offset: network.time_offset,
            warnings,
        })
    }

    async fn get_mempool(&self) -> Result<Vec<String>, RpcError> {
        self.call("getrawmempool", json!([])).await
    }

    async fn get_raw_transactions(&self, txids: &[String]) -> Result<Vec<Tx>, RpcError> {
        let params = txids.iter().map(|t| json!([t, true])).collect();
        self.batch("getrawtransaction", params).await
    }

    async fn send_raw_transaction(&self, hex: &str) -> Result<String, RpcError> {
        self.call("sendrawtransaction", json!([hex])).await
    }
}

fn unpack<R: DeserializeOwned>(method: &str, arg: &str, response: RpcResponse) -> Result<R, RpcError> {
    if let Some(err) = response.error {
        return Err(RpcError::Node { method: method.into(), arg: arg.into(), code: err.code, message: err.message });
    }
    match response.result {
        None | Some(Value::Null) => Err(RpcError::MissingResult { method: method.into(), arg: arg.into() }),
        Some(value) => serde_json::from_value(value).map_err(|e| decode_err(method, e)),
    }
}

fn decode_err(method: &str, e: serde_json::Error) -> RpcError {
    RpcError::Decode { method: method.into(), message: e.to_string() }
}
