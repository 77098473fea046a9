//! One long-poll lifecycle for one client.
//!
//! A session is a spawned task that owns its batcher, its channel
//! subscriptions and its response timer. It runs the open sequence,
//! waits for the first terminal condition and resolves its
//! [`SessionOutput`] exactly once. Everything it owns is dropped before
//! the close event is delivered.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures_util::stream::{select_all, StreamExt};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::errors::{Error, ValidationError};
use crate::message::{Message, MessageKind};
use crate::metrics::HubMetrics;
use crate::realtime::{Batcher, Lagged, Topic};
use crate::store::Store;

/// Why a session ended; every state is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CloseState {
    /// Client should just reconnect
    Reconnect = 0,
    /// There are messages for the client
    NewMessages = 1,
    /// Something went wrong
    Error = 2,
    /// The hub has been destroyed, e.g. for a graceful shutdown
    ServerDestroyed = 3,
    /// The client aborted the request. The client won't see it, server-side listeners will
    ClientAbort = 4,
}

impl CloseState {
    pub const COUNT: usize = 5;

    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Reconnect),
            1 => Some(Self::NewMessages),
            2 => Some(Self::Error),
            3 => Some(Self::ServerDestroyed),
            4 => Some(Self::ClientAbort),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reconnect => "RECONNECT",
            Self::NewMessages => "NEW_MESSAGES",
            Self::Error => "ERROR",
            Self::ServerDestroyed => "SERVER_DESTROYED",
            Self::ClientAbort => "CLIENT_ABORT",
        }
    }
}

impl fmt::Display for CloseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CloseState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for CloseState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        CloseState::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown close state {}", code)))
    }
}

/// Out-of-band data attached to a close event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAssignment {
    pub client: String,
}

/// The terminal event of a session, as sent back to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseEvent {
    pub state: CloseState,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<ClientAssignment>,
}

impl CloseEvent {
    pub fn new(state: CloseState, messages: Vec<Message>) -> Self {
        Self {
            state,
            messages,
            set: None,
        }
    }
}

/// What a session output resolves to: an optional error raised before
/// the close, and the close itself
#[derive(Debug)]
pub struct Outcome {
    pub error: Option<Error>,
    pub close: CloseEvent,
}

impl Outcome {
    pub(crate) fn failed(error: Error) -> Self {
        Self {
            error: Some(error),
            close: CloseEvent::new(CloseState::Error, Vec::new()),
        }
    }

    #[inline]
    pub fn state(&self) -> CloseState {
        self.close.state
    }
}

/// Awaitable terminal result of [`crate::Hub::open`]
#[must_use = "the output resolves to the response for the client"]
pub struct SessionOutput {
    session_id: u64,
    client: Option<String>,
    rx: oneshot::Receiver<Outcome>,
}

impl SessionOutput {
    /// Output of a request that never became a session
    pub(crate) fn rejected(error: ValidationError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Outcome::failed(error.into()));
        Self {
            session_id: 0,
            client: None,
            rx,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// The client id the session is registered under, if any
    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }
}

impl Future for SessionOutput {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| Outcome::failed(Error::SessionLost)))
    }
}

impl fmt::Debug for SessionOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOutput")
            .field("session_id", &self.session_id)
            .field("client", &self.client)
            .finish()
    }
}

/// Registry entry for a live session
pub(crate) struct SessionHandle {
    id: u64,
    control: oneshot::Sender<CloseState>,
}

impl SessionHandle {
    pub(crate) fn new(id: u64) -> (Self, oneshot::Receiver<CloseState>) {
        let (control, rx) = oneshot::channel();
        (Self { id, control }, rx)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Ask the session to close; a no-op if it already did
    pub(crate) fn close(self, state: CloseState) {
        let _ = self.control.send(state);
    }
}

pub(crate) type Registry = DashMap<String, SessionHandle>;

/// Removes the session's registry entry on exit, unless it was replaced
pub(crate) struct Registration {
    sessions: Arc<Registry>,
    client: String,
    id: u64,
}

impl Registration {
    pub(crate) fn new(sessions: Arc<Registry>, client: String, id: u64) -> Self {
        Self {
            sessions,
            client,
            id,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.sessions
            .remove_if(&self.client, |_, handle| handle.id() == self.id);
    }
}

pub(crate) enum ClientId {
    /// Client presented its id
    Known(String),
    /// First contact, the hub assigned this id
    Assigned(String),
}

/// Shared collaborators of every session
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) config: Arc<HubConfig>,
    pub(crate) metrics: Arc<HubMetrics>,
    pub(crate) inbound: broadcast::Sender<Arc<Message>>,
}

pub(crate) struct Session {
    id: u64,
    client: ClientId,
    channels: Vec<String>,
    ctx: SessionContext,
    registration: Option<Registration>,
}

/// Inbound batch after normalization
struct Inbound {
    /// Everything handed to the store, including synthesized acks
    batch: Vec<Message>,
    /// Client messages as received, for hub listeners
    accepted: Vec<Message>,
    /// Ids of non-ack messages the client just sent us
    own: HashSet<String>,
    /// Server receipts buffered once the batch is stored
    receipts: Vec<Message>,
}

/// Batcher plus per-session delivery filtering
struct Outbox {
    batcher: Batcher<Message>,
    own: HashSet<String>,
    seen: HashSet<String>,
}

impl Outbox {
    /// Buffer a message unless the client sent it itself or it is
    /// already buffered
    fn push(&mut self, message: Message) {
        if message.kind == MessageKind::Data
            && (self.own.contains(&message.id) || !self.seen.insert(message.id.clone()))
        {
            return;
        }
        self.batcher.add(message);
    }
}

impl Session {
    pub(crate) fn new(
        id: u64,
        client: ClientId,
        channels: Vec<String>,
        ctx: SessionContext,
        registration: Option<Registration>,
    ) -> Self {
        Self {
            id,
            client,
            channels,
            ctx,
            registration,
        }
    }

    /// Start the session task
    pub(crate) fn open(
        self,
        inbound: Vec<Message>,
        control: oneshot::Receiver<CloseState>,
    ) -> SessionOutput {
        let (tx, rx) = oneshot::channel();
        let output = SessionOutput {
            session_id: self.id,
            client: self.registration.as_ref().map(|r| r.client.clone()),
            rx,
        };
        tokio::spawn(async move {
            let outcome = self.run(inbound, control).await;
            let _ = tx.send(outcome);
        });
        output
    }

    async fn run(self, inbound: Vec<Message>, mut control: oneshot::Receiver<CloseState>) -> Outcome {
        self.ctx.metrics.session_opened();

        let client = match &self.client {
            ClientId::Assigned(client) => {
                info!(session = self.id, client = %client, "assigned client id on first contact");
                let mut outcome = self.finish(CloseState::Reconnect, Vec::new(), None);
                outcome.close.set = Some(ClientAssignment {
                    client: client.clone(),
                });
                return outcome;
            }
            ClientId::Known(client) => client.clone(),
        };

        debug!(
            session = self.id,
            client = %client,
            channels = ?self.channels,
            inbound = inbound.len(),
            "session opened"
        );

        let mut notifications = select_all(
            self.channels
                .iter()
                .map(|channel| self.ctx.store.subscribe(Topic::message(channel.clone()))),
        );

        let Inbound {
            batch,
            accepted,
            own,
            mut receipts,
        } = self.normalize(inbound, &client);
        self.ctx.metrics.record_received(accepted.len());

        let mut outbox = Outbox {
            batcher: Batcher::new(&self.ctx.config.batch),
            own,
            seen: HashSet::new(),
        };

        let startup = {
            let store = self.ctx.store.clone();
            let listeners = self.ctx.inbound.clone();
            let channels = self.channels.clone();
            let client = client.clone();
            async move {
                if !batch.is_empty() {
                    store.dispatch(batch).await?;
                    for message in accepted {
                        let _ = listeners.send(Arc::new(message));
                    }
                }
                store.get(&channels, &client).await
            }
        };
        let mut startup = std::pin::pin!(startup);
        let mut started = false;

        let timeout = tokio::time::sleep(self.ctx.config.response_timeout);
        tokio::pin!(timeout);

        let (state, messages, error) = loop {
            tokio::select! {
                biased;

                state = &mut control => {
                    break (state.unwrap_or(CloseState::ServerDestroyed), Vec::new(), None);
                }
                result = &mut startup, if !started => {
                    started = true;
                    match result {
                        Ok(pending) => {
                            outbox.batcher.extend(receipts.drain(..));
                            for message in pending {
                                outbox.push(message);
                            }
                        }
                        Err(err) => break (CloseState::Error, Vec::new(), Some(Error::Store(err))),
                    }
                }
                drained = outbox.batcher.drained() => {
                    break (CloseState::NewMessages, drained, None);
                }
                Some(notification) = notifications.next() => match notification {
                    Ok(message) => outbox.push(Message::clone(&message)),
                    Err(Lagged(skipped)) => {
                        warn!(session = self.id, skipped, "session lagged behind channel notifications");
                    }
                },
                () = &mut timeout => {
                    break (CloseState::Reconnect, Vec::new(), None);
                }
            }
        };

        drop(notifications);
        drop(outbox);
        self.finish(state, messages, error)
    }

    fn normalize(&self, inbound: Vec<Message>, client: &str) -> Inbound {
        let mut batch = Vec::with_capacity(inbound.len() * 2);
        let mut consumed = Vec::new();
        let mut receipts = Vec::new();
        let mut own = HashSet::new();

        for mut message in inbound {
            if message.is_ack() {
                message.client = Some(client.to_string());
            } else {
                if message.client.is_none() {
                    message.client = Some(client.to_string());
                }
                own.insert(message.id.clone());
                consumed.push(Message::ack(message.id.clone(), client));
                receipts.push(
                    Message::ack(message.id.clone(), self.ctx.config.server_id.clone())
                        .with_sender("server"),
                );
            }
            batch.push(message);
        }

        let accepted = batch.clone();
        // Acks go last so their targets exist when they are applied
        batch.extend(consumed);
        Inbound {
            batch,
            accepted,
            own,
            receipts,
        }
    }

    fn finish(&self, state: CloseState, messages: Vec<Message>, error: Option<Error>) -> Outcome {
        if let Some(err) = &error {
            warn!(session = self.id, error = %err, "session failed");
        }
        debug!(
            session = self.id,
            state = %state,
            messages = messages.len(),
            "session closed"
        );
        self.ctx.metrics.session_closed(state, messages.len());
        Outcome {
            error,
            close: CloseEvent::new(state, messages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn close_state_codes_are_stable() {
        assert_eq!(CloseState::Reconnect.code(), 0);
        assert_eq!(CloseState::ClientAbort.code(), 4);
        assert_eq!(CloseState::from_code(3), Some(CloseState::ServerDestroyed));
        assert_eq!(CloseState::from_code(9), None);
    }

    #[test]
    fn close_event_wire_shape() {
        let mut event = CloseEvent::new(CloseState::Reconnect, Vec::new());
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"state": 0, "messages": []})
        );

        event.set = Some(ClientAssignment {
            client: "abc".into(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["set"], json!({"client": "abc"}));
        let back: CloseEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn unknown_close_state_fails_to_decode() {
        assert!(serde_json::from_value::<CloseEvent>(json!({"state": 7, "messages": []})).is_err());
    }

    fn outbox(own: &[&str]) -> Outbox {
        Outbox {
            batcher: Batcher::new(&crate::config::BatchConfig::default()),
            own: own.iter().map(|id| id.to_string()).collect(),
            seen: HashSet::new(),
        }
    }

    #[tokio::test]
    async fn outbox_buffers_each_data_id_once() {
        let mut outbox = outbox(&[]);
        // Same message through the initial get and a live notification
        outbox.push(Message::data("m1", "c", json!(1)));
        outbox.push(Message::data("m1", "c", json!(1)));
        outbox.push(Message::ack("m1", "server"));

        let buffered: Vec<(&str, MessageKind)> = outbox
            .batcher
            .buffered()
            .iter()
            .map(|m| (m.id.as_str(), m.kind))
            .collect();
        assert_eq!(buffered, [("m1", MessageKind::Data), ("m1", MessageKind::Ack)]);
    }

    #[tokio::test]
    async fn outbox_skips_messages_the_client_sent() {
        let mut outbox = outbox(&["mine"]);
        outbox.push(Message::data("mine", "c", json!(1)));
        outbox.push(Message::data("mine", "c", json!(1)));
        outbox.push(Message::data("theirs", "c", json!(2)));

        let ids: Vec<&str> = outbox.batcher.buffered().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["theirs"]);
    }

    #[tokio::test]
    async fn rejected_output_resolves_to_error_close() {
        let outcome = SessionOutput::rejected(ValidationError::MissingChannels).await;
        assert_eq!(outcome.state(), CloseState::Error);
        assert!(outcome.close.messages.is_empty());
        assert_eq!(
            outcome.error,
            Some(Error::Validation(ValidationError::MissingChannels))
        );
    }

    #[tokio::test]
    async fn dropped_session_task_resolves_to_session_lost() {
        let (tx, rx) = oneshot::channel::<Outcome>();
        drop(tx);
        let output = SessionOutput {
            session_id: 1,
            client: None,
            rx,
        };
        let outcome = output.await;
        assert_eq!(outcome.error, Some(Error::SessionLost));
        assert_eq!(outcome.state(), CloseState::Error);
    }
}
