use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::message::Message;

/// Notification key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// New data on a channel (`message:<channel>`)
    Message(String),
    /// Ack recorded for a message id (`ack:<id>`)
    Ack(String),
}

impl Topic {
    pub fn message(channel: impl Into<String>) -> Self {
        Topic::Message(channel.into())
    }

    pub fn ack(id: impl Into<String>) -> Self {
        Topic::Ack(id.into())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Message(channel) => write!(f, "message:{}", channel),
            Topic::Ack(id) => write!(f, "ack:{}", id),
        }
    }
}

pub type Notification = Arc<Message>;

/// The subscriber fell behind; holds the number of skipped notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lagged(pub u64);

/// Statistics for a single topic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicStats {
    pub topic: String,
    pub subscriber_count: usize,
    pub total_messages: u64,
}

/// Internal topic data
struct ChannelInner {
    sender: broadcast::Sender<Notification>,
    total_messages: AtomicU64,
}

impl ChannelInner {
    fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self {
            sender,
            total_messages: AtomicU64::new(0),
        }
    }
}

type Channels = DashMap<Topic, ChannelInner>;

/// Fan-out of store notifications to scoped subscribers
///
/// Topics are created on first subscription and removed again once their
/// last [`Subscription`] is dropped. Publishing to a topic nobody listens
/// to is a no-op.
#[derive(Clone)]
pub struct TopicRegistry {
    channels: Arc<Channels>,
    buffer_size: usize,
}

impl TopicRegistry {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            buffer_size,
        }
    }

    /// Subscribe to a topic; dropping the returned handle unsubscribes
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let receiver = self
            .channels
            .entry(topic.clone())
            .or_insert_with(|| ChannelInner::new(self.buffer_size))
            .sender
            .subscribe();

        Subscription {
            stream: BroadcastStream::new(receiver),
            guard: TopicGuard {
                topic,
                channels: Arc::downgrade(&self.channels),
            },
        }
    }

    /// Publish to a topic.
    /// Returns the number of subscribers that got the notification
    pub fn publish(&self, topic: &Topic, notification: Notification) -> usize {
        let Some(channel) = self.channels.get(topic) else {
            return 0;
        };
        channel.total_messages.fetch_add(1, Ordering::Relaxed);
        channel.sender.send(notification).unwrap_or(0)
    }

    pub fn has_topic(&self, topic: &Topic) -> bool {
        self.channels.contains_key(topic)
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.channels
            .get(topic)
            .map(|c| c.sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn stats(&self, topic: &Topic) -> Option<TopicStats> {
        self.channels.get(topic).map(|c| TopicStats {
            topic: topic.to_string(),
            subscriber_count: c.sender.receiver_count(),
            total_messages: c.total_messages.load(Ordering::Relaxed),
        })
    }

    pub fn topic_count(&self) -> usize {
        self.channels.len()
    }

    /// Drop every topic; live subscriptions see their stream end
    pub fn clear(&self) {
        self.channels.clear();
    }
}

impl fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TopicRegistry(topics={}, buffer_size={})",
            self.channels.len(),
            self.buffer_size
        )
    }
}

/// Removes the topic once its last receiver is gone
struct TopicGuard {
    topic: Topic,
    channels: Weak<Channels>,
}

impl Drop for TopicGuard {
    fn drop(&mut self) {
        if let Some(channels) = self.channels.upgrade() {
            channels.remove_if(&self.topic, |_, c| c.sender.receiver_count() == 0);
        }
    }
}

/// A live subscription to one topic.
///
/// Yields notifications until the registry is cleared. The receiver is
/// released before the topic guard runs, so the guard sees an accurate
/// receiver count.
pub struct Subscription {
    stream: BroadcastStream<Notification>,
    guard: TopicGuard,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.guard.topic
    }

    /// Wait for the next notification; `None` once the topic is gone
    pub async fn recv(&mut self) -> Option<Result<Notification, Lagged>> {
        self.next().await
    }
}

impl Stream for Subscription {
    type Item = Result<Notification, Lagged>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx).map(|item| {
            item.map(|res| res.map_err(|BroadcastStreamRecvError::Lagged(n)| Lagged(n)))
        })
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subscription({})", self.guard.topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note(id: &str) -> Notification {
        Arc::new(Message::data(id, "c", json!(1)))
    }

    #[test]
    fn topic_display() {
        assert_eq!(Topic::message("chat").to_string(), "message:chat");
        assert_eq!(Topic::ack("m1").to_string(), "ack:m1");
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let registry = TopicRegistry::new(16);
        let mut a = registry.subscribe(Topic::message("c"));
        let mut b = registry.subscribe(Topic::message("c"));

        assert_eq!(registry.publish(&Topic::message("c"), note("m1")), 2);
        assert_eq!(a.recv().await.unwrap().unwrap().id, "m1");
        assert_eq!(b.recv().await.unwrap().unwrap().id, "m1");

        let stats = registry.stats(&Topic::message("c")).unwrap();
        assert_eq!(stats.subscriber_count, 2);
        assert_eq!(stats.total_messages, 1);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let registry = TopicRegistry::new(16);
        assert_eq!(registry.publish(&Topic::ack("m1"), note("m1")), 0);
        assert!(!registry.has_topic(&Topic::ack("m1")));
    }

    #[test]
    fn dropping_last_subscription_removes_topic() {
        let registry = TopicRegistry::new(16);
        let topic = Topic::message("c");
        let a = registry.subscribe(topic.clone());
        let b = registry.subscribe(topic.clone());
        assert_eq!(registry.subscriber_count(&topic), 2);

        drop(a);
        assert!(registry.has_topic(&topic));
        assert_eq!(registry.subscriber_count(&topic), 1);

        drop(b);
        assert!(!registry.has_topic(&topic));
        assert_eq!(registry.topic_count(), 0);
    }

    #[tokio::test]
    async fn clear_ends_streams() {
        let registry = TopicRegistry::new(16);
        let mut sub = registry.subscribe(Topic::message("c"));
        registry.clear();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_reports_lag() {
        let registry = TopicRegistry::new(2);
        let topic = Topic::message("c");
        let mut sub = registry.subscribe(topic.clone());
        for i in 0..4 {
            registry.publish(&topic, note(&format!("m{}", i)));
        }
        assert_eq!(sub.recv().await, Some(Err(Lagged(2))));
        assert_eq!(sub.recv().await.unwrap().unwrap().id, "m2");
    }
}
