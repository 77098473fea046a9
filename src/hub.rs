//! Client-to-session registry and the surface a transport talks to.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::errors::{Error, Result, StoreError, ValidationError};
use crate::message::{new_id, Message};
use crate::metrics::HubMetrics;
use crate::realtime::Topic;
use crate::session::{
    ClientId, CloseState, Registration, Registry, Session, SessionContext, SessionHandle,
    SessionOutput,
};
use crate::store::{MemoryStore, Store};
use crate::validate;

/// Parameters of one long-poll request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenRequest {
    /// Absent on first contact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    pub channels: Vec<String>,
    /// Raw inbound messages, validated by the hub
    pub messages: Vec<Value>,
    /// Transport peer, available to the client id generator
    #[serde(skip)]
    pub peer: Option<SocketAddr>,
}

/// Parameters of [`Hub::send`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SendOptions {
    pub data: Option<Value>,
    #[serde(alias = "recipient")]
    pub channel: Option<String>,
    /// Defaults to `"server"`
    pub sender: Option<String>,
}

impl SendOptions {
    pub fn new(channel: impl Into<String>, data: Value) -> Self {
        Self {
            data: Some(data),
            channel: Some(channel.into()),
            sender: None,
        }
    }
}

struct HubInner {
    ctx: SessionContext,
    sessions: Arc<Registry>,
    destroyed: AtomicBool,
    next_session: AtomicU64,
}

/// Long-polling hub. Cheap to clone; all clones share one registry and store.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Hub backed by a [`MemoryStore`]
    pub fn new(config: HubConfig) -> Self {
        let store = MemoryStore::new(config.store.clone());
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: HubConfig, store: Arc<dyn Store>) -> Self {
        let (inbound, _) = broadcast::channel(config.inbound_capacity.max(1));
        Self {
            inner: Arc::new(HubInner {
                ctx: SessionContext {
                    store,
                    config: Arc::new(config),
                    metrics: Arc::new(HubMetrics::new()),
                    inbound,
                },
                sessions: Arc::new(DashMap::new()),
                destroyed: AtomicBool::new(false),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Start a session for `request`.
    ///
    /// Never fails synchronously: invalid requests resolve to an `ERROR`
    /// close carrying the validation error. A live session for the same
    /// client is closed with `RECONNECT` first.
    pub fn open(&self, request: OpenRequest) -> SessionOutput {
        let messages = match validate::open_request(&request, self.is_destroyed()) {
            Ok(messages) => messages,
            Err(err) => {
                self.inner.ctx.metrics.session_rejected();
                warn!(client = ?request.client, error = %err, "rejected open request");
                return SessionOutput::rejected(err);
            }
        };

        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let (handle, control) = SessionHandle::new(id);

        let known = request.client.clone().filter(|client| !client.is_empty());
        let (client, registration) = match known {
            None => {
                let assigned = self.inner.ctx.config.client_id.assign(&request);
                (ClientId::Assigned(assigned), None)
            }
            Some(client) => {
                if let Some(previous) = self.inner.sessions.insert(client.clone(), handle) {
                    debug!(client = %client, session = previous.id(), "replacing live session");
                    previous.close(CloseState::Reconnect);
                }
                // Lost a race with destroy
                if self.is_destroyed() {
                    self.close_session(&client, id, CloseState::ServerDestroyed);
                }
                let registration = Registration::new(self.inner.sessions.clone(), client.clone(), id);
                (ClientId::Known(client), Some(registration))
            }
        };

        Session::new(
            id,
            client,
            request.channels,
            self.inner.ctx.clone(),
            registration,
        )
        .open(messages, control)
    }

    /// Close the live session of `client`. Returns false if there was none.
    pub fn close(&self, client: &str, state: CloseState) -> bool {
        match self.inner.sessions.remove(client) {
            Some((_, handle)) => {
                debug!(client = %client, session = handle.id(), state = %state, "closing session");
                handle.close(state);
                true
            }
            None => false,
        }
    }

    /// Close the live session of `client` with `CLIENT_ABORT`
    pub fn abort(&self, client: &str) -> bool {
        self.close(client, CloseState::ClientAbort)
    }

    /// Close a session only if it is still the one registered for `client`
    pub fn close_session(&self, client: &str, session_id: u64, state: CloseState) -> bool {
        match self
            .inner
            .sessions
            .remove_if(client, |_, handle| handle.id() == session_id)
        {
            Some((_, handle)) => {
                handle.close(state);
                true
            }
            None => false,
        }
    }

    /// Close every session with `SERVER_DESTROYED` and destroy the store.
    /// Later opens fail validation. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let clients: Vec<String> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        info!(sessions = clients.len(), "destroying hub");
        for client in clients {
            if let Some((_, handle)) = self.inner.sessions.remove(&client) {
                handle.close(CloseState::ServerDestroyed);
            }
        }
        self.inner.ctx.store.destroy();
    }

    /// Push a data message and wait until some client acknowledges it.
    ///
    /// Resolves to the generated message id.
    pub async fn send(&self, options: SendOptions) -> Result<String> {
        validate::send_options(&options)?;
        let SendOptions {
            data,
            channel,
            sender,
        } = options;
        let (Some(data), Some(channel)) = (data, channel) else {
            return Err(ValidationError::MissingData.into());
        };
        if self.is_destroyed() {
            return Err(ValidationError::Destroyed.into());
        }

        let ctx = &self.inner.ctx;
        let id = new_id();
        let message = Message::data(id.clone(), channel, data)
            .with_sender(sender.unwrap_or_else(|| "server".to_string()));

        let mut acks = ctx.store.subscribe(Topic::ack(id.clone()));
        ctx.metrics.send_started();
        ctx.store.dispatch(vec![message]).await?;

        let timeout = ctx.config.ack_timeout;
        match tokio::time::timeout(timeout, acks.recv()).await {
            // A lagged receiver still saw at least one ack
            Ok(Some(_)) => {
                ctx.metrics.send_acked();
                debug!(id = %id, "push acknowledged");
                Ok(id)
            }
            Ok(None) => Err(StoreError::Destroyed.into()),
            Err(_) => {
                ctx.metrics.send_timed_out();
                warn!(id = %id, ?timeout, "push was not acknowledged");
                Err(Error::DeliveryTimeout { id, timeout })
            }
        }
    }

    /// Messages accepted from clients, after they were stored
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<Arc<Message>> {
        self.inner.ctx.inbound.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn has_session(&self, client: &str) -> bool {
        self.inner.sessions.contains_key(client)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &HubMetrics {
        &self.inner.ctx.metrics
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.ctx.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.ctx.store
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}
