//! Operational side-channel: new-block pings to an external monitor service, a
//! node/store height comparison and orphan cleanup.

use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::params::MONITOR_INTERVAL;
use crate::error::Result;
use crate::rpc::ChainSource;
use crate::store::{BlockStore, CURSOR_ORPHAN_COUNT};

/// Fire-and-forget `POST {url}/monitor/{coin}/notify/newBlock`
#[derive(Clone)]
pub struct MonitorNotifier {
    http: reqwest::Client,
    endpoint: String,
}

impl MonitorNotifier {
    pub fn new(base_url: &str, coin: &str) -> Self {
        MonitorNotifier {
            http: reqwest::Client::new(),
            endpoint: format!("{}/monitor/{}/notify/newBlock", base_url.trim_end_matches('/'), coin),
        }
    }

    pub fn endpoint(&self) -> &str { &self.endpoint }

    /// Never blocks the caller and never fails it
    pub fn new_block(&self, height: u64) {
        let request = self.http.post(&self.endpoint).json(&json!({ "height": height }));
        tokio::spawn(async move {
            match request.send().await {
                Ok(resp) if !resp.status().is_success() => {
                    tracing::debug!("Monitor answered {} for block #{}", resp.status(), height);
                }
                Err(e) => tracing::debug!("Monitor unreachable for block #{}: {}", height, e),
                Ok(_) => {}
            }
        });
    }
}

/// Store tip versus node height; a mismatch is logged, not acted on
pub async fn compare_heights(store: &dyn BlockStore, source: &dyn ChainSource) -> Result<bool> {
    let node = source.get_chain_info().await?.blocks;
    let ours = store.last_block().await?.map(|b| b.height());
    if ours == Some(node) {
        tracing::debug!("Store in step with node at #{}", node);
        return Ok(true);
    }
    match ours {
        Some(h) => tracing::error!("❌ Store tip #{} differs from node height #{}", h, node),
        None => tracing::error!("❌ Store is empty, node is at #{}", node),
    }
    Ok(false)
}

/// If orphans appeared since the last look, delete them. Returns how many rows were removed.
pub async fn prune_orphans(store: &dyn BlockStore) -> Result<u64> {
    let seen: u64 = store.get(CURSOR_ORPHAN_COUNT).await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let current = store.orphan_count().await?;
    if current <= seen {
        if current < seen {
            store.set(CURSOR_ORPHAN_COUNT, &current.to_string()).await?;
        }
        return Ok(0);
    }

    tracing::warn!("🔄 Reorg detected: {} orphaned block(s), {} new", current, current - seen);
    let deleted = store.delete_orphans().await?;
    let remaining = store.orphan_count().await?;
    store.set(CURSOR_ORPHAN_COUNT, &remaining.to_string()).await?;
    tracing::info!("🧹 Deleted {} orphaned block(s)", deleted);
    Ok(deleted)
}

/// Both checks every `MONITOR_INTERVAL` until cancelled. Failures are logged and retried next tick.
pub async fn run(store: Arc<dyn BlockStore>, source: Arc<dyn ChainSource>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
    tracing::info!("👀 Monitor checking every {}s", MONITOR_INTERVAL.as_secs());
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = compare_heights(store.as_ref(), source.as_ref()).await {
            tracing::warn!("⚠️ Height check failed: {}", e);
        }
        if let Err(e) = prune_orphans(store.as_ref()).await {
            tracing::warn!("⚠️ Orphan cleanup failed: {}", e);
        }
    }
    tracing::info!("Monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::{block, chain, FakeChain};

    #[tokio::test]
    async fn test_compare_heights() {
        let store = MemoryStore::new();
        let blocks = chain(0, 4, "a");
        let fake = FakeChain::with_blocks(&blocks);
        assert!(!compare_heights(&store, &fake).await.unwrap());

        for b in &blocks {
            store.insert_block(b, false).await.unwrap();
        }
        assert!(compare_heights(&store, &fake).await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_orphans_tracks_cursor() {
        let store = MemoryStore::new();
        for b in chain(0, 3, "a") {
            store.insert_block(&b, false).await.unwrap();
        }
        assert_eq!(prune_orphans(&store).await.unwrap(), 0);
        assert_eq!(store.get(CURSOR_ORPHAN_COUNT).await.unwrap(), None);

        store.insert_block(&block(2, "b2", "a1", 0), false).await.unwrap();
        assert_eq!(store.orphan_count().await.unwrap(), 1);
        assert_eq!(prune_orphans(&store).await.unwrap(), 1);
        assert_eq!(store.orphan_count().await.unwrap(), 0);
        assert_eq!(store.get(CURSOR_ORPHAN_COUNT).await.unwrap().as_deref(), Some("0"));
        assert_eq!(store.last_block().await.unwrap().unwrap().hash(), "b2");
    }

    #[test]
    fn test_notifier_endpoint() {
        let notifier = MonitorNotifier::new("http://monitor:8000/", "btc");
        assert_eq!(notifier.endpoint(), "http://monitor:8000/monitor/btc/notify/newBlock");
    }
}
