//! Message store contract.
//!
//! A store keeps data messages, records which clients acknowledged them
//! and publishes `message:<channel>` / `ack:<id>` notifications. Sessions
//! never touch store internals; they only go through this trait.

pub mod memory;

pub use memory::{AckEntry, MemoryStore};

use futures_util::future::BoxFuture;

use crate::errors::StoreError;
use crate::message::Message;
use crate::realtime::{Subscription, Topic};

/// Behavioral contract every backing store satisfies.
///
/// Completions are always asynchronous: an implementation yields to the
/// scheduler before it reports a result, even when no I/O happens.
pub trait Store: Send + Sync + 'static {
    /// Apply every message in order.
    ///
    /// `data` messages are recorded and announced on `message:<channel>`;
    /// `ack` messages are appended to their target (unknown targets are
    /// ignored) and announced on `ack:<id>`. Every element is applied
    /// even if an earlier one fails; the first failure is returned and
    /// nothing is rolled back.
    fn dispatch(&self, messages: Vec<Message>) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Messages on any of `channels` that `client` has not acknowledged,
    /// in a stable order
    fn get<'a>(
        &'a self,
        channels: &'a [String],
        client: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Message>, StoreError>>;

    /// Scoped subscription to store notifications
    fn subscribe(&self, topic: Topic) -> Subscription;

    /// Stop timers, drop subscribers and clear all state. Idempotent.
    fn destroy(&self);
}
