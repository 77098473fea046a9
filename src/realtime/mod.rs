//! Notification fan-out and outbound batching
//!
//! Provides the typed topic registry the store publishes on, and the
//! interval batcher sessions use to coalesce deliveries.

pub mod batcher;
pub mod channel;

// Re-export main types for convenience
pub use batcher::Batcher;
pub use channel::{Lagged, Notification, Subscription, Topic, TopicRegistry, TopicStats};
