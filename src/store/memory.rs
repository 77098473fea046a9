use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use super::Store;
use crate::config::StoreConfig;
use crate::errors::StoreError;
use crate::message::{Message, MessageKind};
use crate::realtime::{Subscription, Topic, TopicRegistry};

/// One recorded acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckEntry {
    pub client: String,
    /// Unix millis
    pub timestamp: i64,
}

struct Record {
    message: Arc<Message>,
    /// Dispatch order, keeps `get` results stable
    seq: u64,
    stored_at: Instant,
    acks: SmallVec<[AckEntry; 4]>,
}

impl Record {
    fn acked_by(&self, client: &str) -> bool {
        self.acks.iter().any(|ack| ack.client == client)
    }
}

struct Inner {
    config: StoreConfig,
    records: DashMap<String, Record>,
    topics: TopicRegistry,
    seq: AtomicU64,
    destroyed: AtomicBool,
}

impl Inner {
    fn ensure_alive(&self) -> Result<(), StoreError> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(StoreError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn apply(&self, mut message: Message) -> Result<(), StoreError> {
        match message.kind {
            MessageKind::Data => {
                let Some(channel) = message.channel.clone() else {
                    return Err(StoreError::Rejected {
                        id: message.id,
                        reason: "data message without channel",
                    });
                };
                message.timestamp = Some(Utc::now().timestamp_millis());
                let message = Arc::new(message);
                let record = Record {
                    message: message.clone(),
                    seq: self.seq.fetch_add(1, Ordering::Relaxed),
                    stored_at: Instant::now(),
                    acks: SmallVec::new(),
                };
                if self.records.insert(message.id.clone(), record).is_some() {
                    debug!(id = %message.id, "overwrote stored message");
                }
                self.topics.publish(&Topic::Message(channel), message);
            }
            MessageKind::Ack => {
                let Some(client) = message.client.clone() else {
                    return Err(StoreError::Rejected {
                        id: message.id,
                        reason: "ack without client",
                    });
                };
                let recorded = match self.records.get_mut(&message.id) {
                    Some(mut record) if !record.acked_by(&client) => {
                        record.acks.push(AckEntry {
                            client,
                            timestamp: Utc::now().timestamp_millis(),
                        });
                        true
                    }
                    Some(_) => false,
                    None => {
                        debug!(id = %message.id, "ignoring ack for unknown message");
                        false
                    }
                };
                if recorded {
                    let topic = Topic::ack(message.id.clone());
                    self.topics.publish(&topic, Arc::new(message));
                }
            }
            MessageKind::Ping | MessageKind::Options => {}
        }
        Ok(())
    }

    fn pending(&self, channels: &[String], client: &str) -> Vec<Message> {
        let mut found: Vec<(u64, Arc<Message>)> = self
            .records
            .iter()
            .filter(|record| {
                record
                    .message
                    .channel()
                    .is_some_and(|c| channels.iter().any(|wanted| wanted == c))
                    && !record.acked_by(client)
            })
            .map(|record| (record.seq, record.message.clone()))
            .collect();
        found.sort_unstable_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, m)| (*m).clone()).collect()
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let max_age = self.config.max_age;
        let before = self.records.len();
        self.records
            .retain(|_, record| now.saturating_duration_since(record.stored_at) <= max_age);
        before.saturating_sub(self.records.len())
    }
}

/// In-process store.
///
/// Messages live in a concurrent map until they are older than
/// `max_age`; a background task sweeps them every `cleanup_interval`.
pub struct MemoryStore {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Create a store. The expiry sweep is spawned on the current tokio
    /// runtime; without one, expired messages are only removed by
    /// explicit [`MemoryStore::sweep`] calls.
    pub fn new(config: StoreConfig) -> Self {
        let inner = Arc::new(Inner {
            topics: TopicRegistry::new(config.notify_capacity),
            config,
            records: DashMap::new(),
            seq: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        });

        let period = inner.config.cleanup_interval;
        let sweeper = if period.is_zero() {
            None
        } else {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => Some(handle.spawn(sweep_loop(Arc::downgrade(&inner), period))),
                Err(_) => {
                    warn!("no tokio runtime, expired messages will not be swept automatically");
                    None
                }
            }
        };

        Self {
            inner,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Remove every message older than `max_age`, returns how many went
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.records.contains_key(id)
    }

    /// Acks recorded for a message, in arrival order
    pub fn acks(&self, id: &str) -> Option<Vec<AckEntry>> {
        self.inner
            .records
            .get(id)
            .map(|record| record.acks.to_vec())
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.inner.topics
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl Store for MemoryStore {
    fn dispatch(&self, messages: Vec<Message>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.inner.ensure_alive()?;

            let mut first_error = None;
            for message in messages {
                if let Err(err) = self.inner.apply(message) {
                    warn!(error = %err, "dispatch failed");
                    first_error.get_or_insert(err);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
    }

    fn get<'a>(
        &'a self,
        channels: &'a [String],
        client: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Message>, StoreError>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.inner.ensure_alive()?;
            Ok(self.inner.pending(channels, client))
        })
    }

    fn subscribe(&self, topic: Topic) -> Subscription {
        self.inner.topics.subscribe(topic)
    }

    fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.inner.topics.clear();
        self.inner.records.clear();
        info!("store destroyed");
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

async fn sweep_loop(inner: Weak<Inner>, period: Duration) {
    let mut interval = interval_at(Instant::now() + period, period);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let removed = inner.sweep();
        if removed > 0 {
            debug!(removed, remaining = inner.records.len(), "swept expired messages");
        }
    }
}
