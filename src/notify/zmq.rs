use async_trait::async_trait;
use std::time::Duration;
use zeromq::{Socket, SocketRecv, SubSocket};

use super::{decode_frames, Notification, NotifyError, Subscriber};
use crate::config::ZmqConfig;

/// SUB socket on the node's `zmqpub*` endpoint
pub struct ZmqSubscriber {
    url: String,
    topics: Vec<String>,
    timeout: Duration,
    socket: Option<SubSocket>,
}

impl ZmqSubscriber {
    pub fn new(config: &ZmqConfig) -> Self {
        ZmqSubscriber {
            url: config.sub_url.clone(),
            topics: config.subs.clone(),
            timeout: config.timeout(),
            socket: None,
        }
    }
}

#[async_trait]
impl Subscriber for ZmqSubscriber {
    async fn connect(&mut self) -> Result<(), NotifyError> {
        if let Some(old) = self.socket.take() {
            let _ = old.close().await;
        }
        let connect_err = |e: zeromq::ZmqError| NotifyError::Connect { url: self.url.clone(), message: e.to_string() };

        let mut socket = SubSocket::new();
        socket.connect(&self.url).await.map_err(connect_err)?;
        for topic in &self.topics {
            socket.subscribe(topic).await.map_err(connect_err)?;
        }
        tracing::debug!("Subscribed to {:?} on {}", self.topics, self.url);
        self.socket = Some(socket);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Notification, NotifyError> {
        let socket = self.socket.as_mut()
            .ok_or_else(|| NotifyError::Recv("socket not connected".into()))?;
        let message = tokio::time::timeout(self.timeout, socket.recv())
            .await
            .map_err(|_| NotifyError::Timeout(self.timeout))?
            .map_err(|e| NotifyError::Recv(e.to_string()))?;

        let frames: Vec<Vec<u8>> = message.into_vec().into_iter().map(|frame| frame.to_vec()).collect();
        decode_frames(&frames)
    }
}
