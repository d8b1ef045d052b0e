//! Ingestion and reconciliation engine for UTXO chains.
//!
//! Blocks and transactions flow from a node ([`rpc`]) through the ingestion
//! pipelines ([`sync`]) into the [`store`], which decides which blocks are
//! canonical. The [`validate`] tools audit the store against the node afterwards.

pub mod config;
pub mod core;
pub mod error;
pub mod jobs;
pub mod monitor;
pub mod notify;
pub mod retry;
pub mod rpc;
pub mod store;
pub mod sync;
pub mod validate;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};
