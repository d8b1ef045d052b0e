//! Plumbing shared by every pipeline: cancellable sends, shared work queues and the fatal-error path.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Send unless the pipeline is cancelled first. Returns false when the item was not delivered
/// (cancelled or the receiver is gone), which tells the caller to stop producing.
pub async fn send_or_cancel<T>(tx: &mpsc::Sender<T>, item: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// Receive unless cancelled first; `None` means stop
pub async fn recv_or_cancel<T>(rx: &mut mpsc::Receiver<T>, cancel: &CancellationToken) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        item = rx.recv() => item,
    }
}

/// A receiver several workers pull from
pub struct WorkQueue<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        WorkQueue { rx: self.rx.clone() }
    }
}

impl<T> WorkQueue<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        WorkQueue { rx: Arc::new(Mutex::new(rx)) }
    }

    pub async fn next(&self, cancel: &CancellationToken) -> Option<T> {
        let mut rx = self.rx.lock().await;
        recv_or_cancel(&mut rx, cancel).await
    }
}

/// First fatal error wins: it is kept and the pipeline is cancelled
#[derive(Clone)]
pub struct Fatal {
    tx: mpsc::Sender<Error>,
    cancel: CancellationToken,
}

pub struct FatalReceiver {
    rx: mpsc::Receiver<Error>,
}

impl Fatal {
    pub fn new(cancel: CancellationToken) -> (Self, FatalReceiver) {
        let (tx, rx) = mpsc::channel(1);
        (Fatal { tx, cancel }, FatalReceiver { rx })
    }

    pub fn report(&self, err: Error) {
        tracing::error!("❌ {}", err);
        // later errors are usually fallout from the first one
        let _ = self.tx.try_send(err);
        self.cancel.cancel();
    }

    pub fn cancel(&self) -> &CancellationToken { &self.cancel }
}

impl FatalReceiver {
    /// The reported error, if any. Call after every stage has stopped.
    pub fn take(mut self) -> Option<Error> {
        self.rx.try_recv().ok()
    }
}
