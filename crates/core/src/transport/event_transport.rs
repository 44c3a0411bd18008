//! Push channel client: connection lifecycle, event routing, message streaming and
//! session tracking. Reconnection is always explicit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::streaming::MessageAccumulator;
use super::transport_model::{
    ConnectionState, MessageSnapshot, PushEvent, PushFrame, TransportStatus, EVENT_SEND_MESSAGE,
};
use super::transport_traits::{PushConnector, PushEventHandler};
use crate::config::ChannelIdentity;
use crate::errors::{Error, Result};
use crate::events::SubscriptionId;

pub type MessageListener = Arc<dyn Fn(&MessageSnapshot) + Send + Sync>;
pub type SessionListener = Arc<dyn Fn(&str) + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    resource: Vec<(SubscriptionId, String, Arc<dyn PushEventHandler>)>,
    kind: Vec<(SubscriptionId, String, Arc<dyn PushEventHandler>)>,
    message: Vec<(SubscriptionId, MessageListener)>,
    session: Vec<(SubscriptionId, SessionListener)>,
    error: Vec<(SubscriptionId, ErrorListener)>,
}

struct TransportInner {
    connector: Arc<dyn PushConnector>,
    identity: ChannelIdentity,
    status: Mutex<TransportStatus>,
    outgoing: Mutex<Option<mpsc::Sender<PushFrame>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    subscribers: Mutex<Subscribers>,
    accumulator: Mutex<MessageAccumulator>,
    // bumped on every connect/disconnect so a stale reader task cannot report loss
    generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct EventTransport {
    inner: Arc<TransportInner>,
}

impl EventTransport {
    pub fn new(connector: Arc<dyn PushConnector>, identity: ChannelIdentity) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                connector,
                identity,
                status: Mutex::new(TransportStatus::default()),
                outgoing: Mutex::new(None),
                task: tokio::sync::Mutex::new(None),
                subscribers: Mutex::new(Subscribers::default()),
                accumulator: Mutex::new(MessageAccumulator::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn identity(&self) -> &ChannelIdentity {
        &self.inner.identity
    }

    pub fn status(&self) -> TransportStatus {
        lock(&self.inner.status).clone()
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner.status).session_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.status).state == ConnectionState::Connected
    }

    /// Opens the channel. A failure leaves the transport in `Failed` and is not retried.
    pub async fn connect(&self) -> Result<()> {
        let mut task = self.inner.task.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting, None);

        let connection = match self.inner.connector.connect(&self.inner.identity).await {
            Ok(connection) => connection,
            Err(err) => {
                let message = format!("connect failed: {}", err);
                warn!("[Transport] {}", message);
                self.set_state(ConnectionState::Failed, Some(message.clone()));
                self.inner.emit_error(&message);
                return Err(Error::transport(message));
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.inner.outgoing) = Some(connection.outgoing);
        self.set_state(ConnectionState::Connected, None);
        info!(
            "[Transport] Connected business={} location={} user={}",
            self.inner.identity.business_id,
            self.inner.identity.location_id,
            self.inner.identity.user_id
        );

        let inner = Arc::clone(&self.inner);
        let mut incoming = connection.incoming;
        *task = Some(tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                inner.dispatch(frame).await;
            }
            inner.on_channel_closed(generation);
        }));
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut task = self.inner.task.lock().await;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = task.take() {
            handle.abort();
        }
        lock(&self.inner.outgoing).take();
        lock(&self.inner.accumulator).clear();
        let was_connected = self.is_connected();
        self.set_state(ConnectionState::Disconnected, None);
        if was_connected {
            info!("[Transport] Disconnected");
        }
    }

    /// Manual reconnect: tear down and open a fresh channel.
    pub async fn reconnect(&self) -> Result<()> {
        self.disconnect().await;
        self.connect().await
    }

    pub async fn send(&self, event: &str, payload: Value) -> Result<()> {
        let sender = lock(&self.inner.outgoing)
            .clone()
            .ok_or_else(|| Error::transport("push channel is not connected"))?;
        sender
            .send(PushFrame::new(event, payload))
            .await
            .map_err(|_| Error::transport("push channel closed while sending"))
    }

    /// Sends a chat message, tagged with the current session once one is known.
    pub async fn send_message(&self, content: &str, extra: Option<Map<String, Value>>) -> Result<()> {
        let mut payload = extra.unwrap_or_default();
        payload.insert("content".to_string(), json!(content));
        if let Some(session_id) = self.session_id() {
            payload.insert("sessionId".to_string(), json!(session_id));
        }
        self.send(EVENT_SEND_MESSAGE, Value::Object(payload)).await
    }

    /// Routes a frame as if it had arrived on the channel.
    pub async fn ingest(&self, frame: PushFrame) {
        self.inner.dispatch(frame).await;
    }

    pub fn subscribe_resource(
        &self,
        resource_type: &str,
        handler: Arc<dyn PushEventHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId::next();
        lock(&self.inner.subscribers)
            .resource
            .push((id, resource_type.to_string(), handler));
        id
    }

    pub fn subscribe_kind(&self, kind: &str, handler: Arc<dyn PushEventHandler>) -> SubscriptionId {
        let id = SubscriptionId::next();
        lock(&self.inner.subscribers)
            .kind
            .push((id, kind.to_string(), handler));
        id
    }

    pub fn on_message<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&MessageSnapshot) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        lock(&self.inner.subscribers)
            .message
            .push((id, Arc::new(listener)));
        id
    }

    pub fn on_session_update<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        lock(&self.inner.subscribers)
            .session
            .push((id, Arc::new(listener)));
        id
    }

    pub fn on_error<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        lock(&self.inner.subscribers).error.push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = lock(&self.inner.subscribers);
        let before = subs.resource.len()
            + subs.kind.len()
            + subs.message.len()
            + subs.session.len()
            + subs.error.len();
        subs.resource.retain(|(sid, _, _)| *sid != id);
        subs.kind.retain(|(sid, _, _)| *sid != id);
        subs.message.retain(|(sid, _)| *sid != id);
        subs.session.retain(|(sid, _)| *sid != id);
        subs.error.retain(|(sid, _)| *sid != id);
        let after = subs.resource.len()
            + subs.kind.len()
            + subs.message.len()
            + subs.session.len()
            + subs.error.len();
        after != before
    }

    fn set_state(&self, state: ConnectionState, error: Option<String>) {
        let mut status = lock(&self.inner.status);
        status.state = state;
        status.last_error = error;
    }
}

impl TransportInner {
    async fn dispatch(&self, frame: PushFrame) {
        let event = match PushEvent::parse(&frame) {
            Ok(event) => event,
            Err(err) => {
                debug!("[Transport] Ignoring malformed '{}' frame: {}", frame.event, err);
                return;
            }
        };

        if let Some(session_id) = event.session_id() {
            if matches!(event, PushEvent::Message(_) | PushEvent::SessionUpdate { .. }) {
                self.adopt_session(session_id);
            }
        }

        if let PushEvent::Message(chunk) = &event {
            let current = lock(&self.status).session_id.clone();
            let snapshot = lock(&self.accumulator).push(chunk, current.as_deref());
            let listeners: Vec<MessageListener> = lock(&self.subscribers)
                .message
                .iter()
                .map(|(_, l)| l.clone())
                .collect();
            for listener in listeners {
                listener(&snapshot);
            }
        }

        let handlers: Vec<Arc<dyn PushEventHandler>> = {
            let subs = lock(&self.subscribers);
            let by_kind = subs
                .kind
                .iter()
                .filter(|(_, kind, _)| kind == event.kind())
                .map(|(_, _, h)| h.clone());
            let by_type: Vec<Arc<dyn PushEventHandler>> = match &event {
                PushEvent::Resource(resource_event) => subs
                    .resource
                    .iter()
                    .filter(|(_, t, _)| *t == resource_event.resource_type)
                    .map(|(_, _, h)| h.clone())
                    .collect(),
                _ => Vec::new(),
            };
            by_type.into_iter().chain(by_kind).collect()
        };
        if handlers.is_empty() {
            debug!("[Transport] No subscriber for '{}'", event.kind());
        }
        for handler in handlers {
            handler.handle_event(&event).await;
        }
    }

    fn adopt_session(&self, session_id: &str) {
        let changed = {
            let mut status = lock(&self.status);
            if status.session_id.as_deref() == Some(session_id) {
                false
            } else {
                status.session_id = Some(session_id.to_string());
                true
            }
        };
        if !changed {
            return;
        }
        info!("[Transport] Session is now {}", session_id);
        let listeners: Vec<SessionListener> = lock(&self.subscribers)
            .session
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(session_id);
        }
    }

    fn on_channel_closed(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let message = "push channel closed by remote".to_string();
        warn!("[Transport] {}", message);
        lock(&self.outgoing).take();
        {
            let mut status = lock(&self.status);
            status.state = ConnectionState::Failed;
            status.last_error = Some(message.clone());
        }
        self.emit_error(&message);
    }

    fn emit_error(&self, message: &str) {
        let listeners: Vec<ErrorListener> = lock(&self.subscribers)
            .error
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(message);
        }
    }
}
