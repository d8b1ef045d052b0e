//! Maintenance that runs inside the indexing process, on the store it already holds open.
//!
//! The sled database takes an exclusive file lock, so while `index --sync` is running the
//! validators and the monitor cannot open the store from another process. They are hosted
//! here instead and share the indexer's store and cancellation token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::monitor;
use crate::rpc::ChainSource;
use crate::store::BlockStore;
use crate::validate::{BlockValidator, TxValidator, ValidateOptions};

/// Which maintenance jobs to host, and how often
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub validate_blocks: Option<Duration>,
    pub validate_txs: Option<Duration>,
    /// Height check and orphan cleanup every `MONITOR_INTERVAL`
    pub monitor: bool,
}

impl Schedule {
    pub fn is_empty(&self) -> bool {
        self.validate_blocks.is_none() && self.validate_txs.is_none() && !self.monitor
    }
}

/// Spawn every scheduled job onto `tasks`. Each stops when `cancel` fires.
pub fn spawn(
    tasks: &mut JoinSet<()>,
    store: Arc<dyn BlockStore>,
    source: Arc<dyn ChainSource>,
    options: ValidateOptions,
    schedule: &Schedule,
    cancel: &CancellationToken,
) {
    if let Some(period) = schedule.validate_blocks {
        let validator = Arc::new(BlockValidator::new(store.clone(), source.clone(), options.clone()));
        let cancel = cancel.clone();
        tasks.spawn(every("block validation", period, cancel.clone(), move || {
            let (validator, cancel) = (validator.clone(), cancel.clone());
            async move { validator.run(&cancel).await }
        }));
    }
    if let Some(period) = schedule.validate_txs {
        let validator = Arc::new(TxValidator::new(store.clone(), source.clone(), options));
        let cancel = cancel.clone();
        tasks.spawn(every("transaction validation", period, cancel.clone(), move || {
            let (validator, cancel) = (validator.clone(), cancel.clone());
            async move { validator.run(&cancel).await }
        }));
    }
    if schedule.monitor {
        tasks.spawn(monitor::run(store, source, cancel.clone()));
    }
}

/// Run `job` once per `period`, first after one full period. A failed run is logged
/// and the job tries again on the next round.
pub async fn every<F, Fut, T>(name: &'static str, period: Duration, cancel: CancellationToken, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!("⏱️ Scheduled {} every {}s", name, period.as_secs());
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match job().await {
            Ok(_) => tracing::debug!("{} round done", name),
            Err(e) => tracing::warn!("⚠️ {} failed, retrying next round: {}", name, e),
        }
    }
    tracing::info!("Stopped {}", name);
}
