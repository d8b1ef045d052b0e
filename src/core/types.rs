use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Block Types ─────────────────────────────────────────────────────

/// Block header as reported by the node's `getblock`.
///
/// `next_hash` arrives from the node but once stored it is owned by the store:
/// it always names the canonical successor, or nothing at the tip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: String,
    pub height: u64,
    #[serde(default)]
    pub time: i64,
    #[serde(rename = "mediantime", default)]
    pub median_time: i64,
    #[serde(default)]
    pub nonce: u64,
    #[serde(rename = "previousblockhash", default)]
    pub prev_hash: Option<String>,
    #[serde(rename = "nextblockhash", default)]
    pub next_hash: Option<String>,
    #[serde(default)]
    pub bits: String,
    #[serde(default)]
    pub difficulty: f64,
    #[serde(default)]
    pub chainwork: String,
    #[serde(default)]
    pub version: i64,
    #[serde(rename = "versionHex", default)]
    pub version_hex: String,
    #[serde(rename = "merkleroot", default)]
    pub merkle_root: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "strippedsize", default)]
    pub stripped_size: u64,
    #[serde(default)]
    pub weight: u64,
    #[serde(rename = "nTx", default)]
    pub tx_count: u64,
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block #{} [{}] txs={}", self.height, short_hash(&self.hash), self.tx_count)
    }
}

/// A block with its transactions in block order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(flatten)]
    pub header: BlockHeader,
    #[serde(rename = "tx", default)]
    pub txs: Vec<Tx>,
}

impl Block {
    pub fn height(&self) -> u64 { self.header.height }
    pub fn hash(&self) -> &str { &self.header.hash }
}

/// A block row as persisted: header plus store-assigned id and canonical flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBlock {
    pub id: u64,
    pub header: BlockHeader,
    pub is_orphan: bool,
}

impl StoredBlock {
    pub fn height(&self) -> u64 { self.header.height }
    pub fn hash(&self) -> &str { &self.header.hash }
    pub fn prev_hash(&self) -> Option<&str> { self.header.prev_hash.as_deref() }
}

/// Lookup key for a stored block.
/// By height resolves to the canonical block; by hash returns the row whether orphaned or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRef {
    ByHeight(u64),
    ByHash(String),
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRef::ByHeight(h) => write!(f, "height {}", h),
            BlockRef::ByHash(hash) => write!(f, "hash {}", short_hash(hash)),
        }
    }
}

/// Outcome of a block insert: the row id transactions attach to and whether it ended up canonical
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertedBlock {
    pub id: u64,
    pub is_orphan: bool,
}

// ─── Transaction Types ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptSig {
    #[serde(default)]
    pub asm: String,
    #[serde(default)]
    pub hex: String,
}

/// Transaction input as reported by the node. Coinbase inputs carry `coinbase` and no outpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vin {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(rename = "scriptSig", default)]
    pub script_sig: Option<ScriptSig>,
    #[serde(rename = "txinwitness", default)]
    pub witness: Vec<String>,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub coinbase: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub asm: String,
    #[serde(default)]
    pub hex: String,
    #[serde(rename = "reqSigs", default)]
    pub req_sigs: Option<u32>,
    #[serde(rename = "type", default)]
    pub script_type: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vout {
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey", default)]
    pub script_pub_key: ScriptPubKey,
}

/// Transaction as reported by `getblock` (verbosity 2) or `getrawtransaction`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tx {
    pub txid: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub vsize: u64,
    #[serde(default)]
    pub weight: u64,
    #[serde(default)]
    pub locktime: u64,
    #[serde(default)]
    pub vin: Vec<Vin>,
    #[serde(default)]
    pub vout: Vec<Vout>,
    #[serde(default)]
    pub hex: String,
}

/// A spent outpoint, or the coinbase marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    pub spent_txid: Option<String>,
    pub spent_vout: Option<u32>,
    pub coinbase: Option<String>,
    pub script_sig_asm: String,
    pub script_sig_hex: String,
    pub witness: Vec<String>,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub vout: u32,
    pub value: i64,
    pub script_asm: String,
    pub script_hex: String,
    pub script_type: String,
    pub req_sigs: Option<u32>,
    /// Set only when the script resolves to exactly one address
    pub address: Option<String>,
    pub addresses: Vec<String>,
}

/// A transaction row as persisted. `block_id == None` means pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTx {
    pub id: u64,
    pub txid: String,
    pub hash: String,
    pub version: i64,
    pub size: u64,
    pub vsize: u64,
    pub weight: u64,
    pub locktime: u64,
    pub hex: String,
    pub block_id: Option<u64>,
    pub index: Option<u32>,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
}

impl StoredTx {
    /// Normalise a node transaction into a row. An empty `hash` (pre-segwit nodes) defaults to the txid.
    pub fn from_tx(id: u64, tx: &Tx, index: Option<u32>, block_id: Option<u64>) -> Self {
        let hash = if tx.hash.is_empty() { tx.txid.clone() } else { tx.hash.clone() };

        let inputs = tx.vin.iter().map(|vin| {
            let sig = vin.script_sig.clone().unwrap_or_default();
            Input {
                spent_txid: vin.txid.clone(),
                spent_vout: vin.vout,
                coinbase: vin.coinbase.clone(),
                script_sig_asm: sig.asm,
                script_sig_hex: sig.hex,
                witness: vin.witness.clone(),
                sequence: vin.sequence,
            }
        }).collect();

        let outputs = tx.vout.iter().map(|vout| {
            let spk = &vout.script_pub_key;
            let mut addresses = spk.addresses.clone();
            if addresses.is_empty() {
                addresses.extend(spk.address.iter().cloned());
            }
            Output {
                vout: vout.n,
                value: super::params::to_base_units(vout.value),
                script_asm: spk.asm.clone(),
                script_hex: spk.hex.clone(),
                script_type: spk.script_type.clone(),
                req_sigs: spk.req_sigs,
                address: if addresses.len() == 1 { Some(addresses[0].clone()) } else { None },
                addresses,
            }
        }).collect();

        StoredTx {
            id,
            txid: tx.txid.clone(),
            hash,
            version: tx.version,
            size: tx.size,
            vsize: tx.vsize,
            weight: tx.weight,
            locktime: tx.locktime,
            hex: tx.hex.clone(),
            block_id,
            index,
            inputs,
            outputs,
        }
    }

    pub fn is_pending(&self) -> bool { self.block_id.is_none() }
}

/// Pending transaction handle returned to the transaction validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    pub id: u64,
    pub txid: String,
}

/// Live-mode mempool work item; never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolTx {
    pub hash: String,
    pub fails: u32,
}

impl MempoolTx {
    pub fn new(hash: impl Into<String>) -> Self {
        MempoolTx { hash: hash.into(), fails: 0 }
    }
}

// ─── Node Info ───────────────────────────────────────────────────────

/// Merged `getblockchaininfo` + `getnetworkinfo`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub chain: String,
    pub blocks: u64,
    pub headers: u64,
    pub best_block_hash: String,
    pub difficulty: f64,
    pub size_on_disk: u64,
    pub version: i64,
    pub subversion: String,
    pub protocol_version: i64,
    pub time_offset: i64,
    pub warnings: String,
}

/// First 16 hex chars, for log lines
pub fn short_hash(hash: &str) -> &str {
    hash.get(..16).unwrap_or(hash)
}
