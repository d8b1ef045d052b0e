//! Push notifications from the node: new block hashes and new mempool transaction hashes.
//!
//! The listener turns them into signals for the live pipelines. A dropped socket is
//! reconnected, and because anything published during the outage was missed, every
//! reconnect triggers a mempool rescan and a tip check.

pub mod zmq;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::params::RECONNECT_DELAY;
use crate::core::types::{short_hash, MempoolTx};
use crate::sync::pipeline::send_or_cancel;

pub use self::zmq::ZmqSubscriber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    HashBlock,
    HashTx,
}

impl Topic {
    pub fn parse(raw: &[u8]) -> Option<Topic> {
        match raw {
            b"hashblock" => Some(Topic::HashBlock),
            b"hashtx" => Some(Topic::HashTx),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::HashBlock => "hashblock",
            Topic::HashTx => "hashtx",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub topic: Topic,
    pub hash: String,
    pub sequence: Option<u32>,
}

/// Decode a `[topic, body, sequence]` multipart message. The body is the raw hash, hex-encoded here.
pub fn decode_frames(frames: &[Vec<u8>]) -> Result<Notification, NotifyError> {
    let (topic, body) = match frames {
        [topic, body, ..] => (topic, body),
        _ => return Err(NotifyError::Malformed(format!("expected 3 frames, got {}", frames.len()))),
    };
    let topic = Topic::parse(topic)
        .ok_or_else(|| NotifyError::Malformed(format!("unknown topic {}", String::from_utf8_lossy(topic))))?;
    if body.is_empty() {
        return Err(NotifyError::Malformed(format!("{} with empty body", topic)));
    }
    let sequence = frames.get(2)
        .and_then(|seq| <[u8; 4]>::try_from(seq.as_slice()).ok())
        .map(u32::from_le_bytes);
    Ok(Notification { topic, hash: hex::encode(body), sequence })
}

#[async_trait]
pub trait Subscriber: Send {
    /// (Re)open the socket and subscribe to every topic
    async fn connect(&mut self) -> Result<(), NotifyError>;
    /// Next notification; errors on timeout or a broken socket
    async fn recv(&mut self) -> Result<Notification, NotifyError>;
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("cannot connect to {url}: {message}")]
    Connect { url: String, message: String },
    #[error("receive failed: {0}")]
    Recv(String),
    #[error("no notification within {0:?}")]
    Timeout(Duration),
    #[error("malformed notification: {0}")]
    Malformed(String),
}

/// Where the listener delivers its signals
#[derive(Clone)]
pub struct NotificationSinks {
    /// "Check the tip"; capacity 1, so bursts coalesce
    pub tip: mpsc::Sender<()>,
    pub mempool: mpsc::Sender<MempoolTx>,
    pub rescan: mpsc::Sender<()>,
}

pub struct NotificationListener<S: Subscriber> {
    subscriber: S,
    sinks: NotificationSinks,
    reconnect_delay: Duration,
}

impl<S: Subscriber> NotificationListener<S> {
    pub fn new(subscriber: S, sinks: NotificationSinks) -> Self {
        NotificationListener { subscriber, sinks, reconnect_delay: RECONNECT_DELAY }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Listen until cancelled. Only the first connect may fail the call; later
    /// failures are retried forever.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), NotifyError> {
        self.subscriber.connect().await?;
        tracing::info!("🔔 Listening for block and mempool notifications");

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                received = self.subscriber.recv() => received,
            };
            match received {
                Ok(notification) => {
                    if !dispatch(&self.sinks, notification, &cancel).await {
                        return Ok(());
                    }
                }
                Err(NotifyError::Malformed(reason)) => {
                    tracing::warn!("⚠️ Ignoring notification: {}", reason);
                }
                Err(e) => {
                    tracing::warn!("⚠️ Notification socket lost: {}", e);
                    if !self.reconnect(&cancel).await {
                        return Ok(());
                    }
                    // anything published while we were away is gone
                    let _ = self.sinks.rescan.try_send(());
                    let _ = self.sinks.tip.try_send(());
                }
            }
        }
    }

    async fn reconnect(&mut self, cancel: &CancellationToken) -> bool {
        let mut attempt = 1u32;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
            match self.subscriber.connect().await {
                Ok(()) => {
                    tracing::info!("🔔 Notification socket reconnected after {} attempt(s)", attempt);
                    return true;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Reconnect attempt {} failed: {}", attempt, e);
                    attempt += 1;
                }
            }
        }
    }
}

async fn dispatch(sinks: &NotificationSinks, notification: Notification, cancel: &CancellationToken) -> bool {
    match notification.topic {
        Topic::HashBlock => {
            tracing::debug!("New block {}", short_hash(&notification.hash));
            // a pending signal already covers this block
            let _ = sinks.tip.try_send(());
            true
        }
        Topic::HashTx => send_or_cancel(&sinks.mempool, MempoolTx::new(notification.hash), cancel).await,
    }
}
