//! In-process push connector. Each successful connect hands the server side of
//! the channel out as a [`MemoryPeer`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::transport_model::PushFrame;
use super::transport_traits::{PushConnection, PushConnector, PUSH_CHANNEL_CAPACITY};
use crate::config::ChannelIdentity;
use crate::errors::{Error, Result};

pub struct MemoryPeer {
    pub identity: ChannelIdentity,
    to_client: mpsc::Sender<PushFrame>,
    from_client: mpsc::Receiver<PushFrame>,
}

impl MemoryPeer {
    pub async fn push(&self, event: &str, payload: Value) -> Result<()> {
        self.to_client
            .send(PushFrame::new(event, payload))
            .await
            .map_err(|_| Error::transport("client side of the channel is gone"))
    }

    /// Next frame the client sent, `None` once the client dropped its sender.
    pub async fn recv(&mut self) -> Option<PushFrame> {
        self.from_client.recv().await
    }
}

#[derive(Default)]
pub struct MemoryConnector {
    peers: Mutex<VecDeque<MemoryPeer>>,
    failure: Mutex<Option<String>>,
    attempts: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following connect fail with `message` until cleared with `None`.
    pub fn fail_with(&self, message: Option<&str>) {
        *lock(&self.failure) = message.map(str::to_string);
    }

    pub fn take_peer(&self) -> Option<MemoryPeer> {
        lock(&self.peers).pop_front()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushConnector for MemoryConnector {
    async fn connect(&self, identity: &ChannelIdentity) -> Result<PushConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = lock(&self.failure).clone() {
            return Err(Error::transport(message));
        }
        let (to_client, incoming) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let (outgoing, from_client) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        lock(&self.peers).push_back(MemoryPeer {
            identity: identity.clone(),
            to_client,
            from_client,
        });
        Ok(PushConnection { outgoing, incoming })
    }
}
