pub mod collector;

pub use collector::{HubMetrics, MetricsSnapshot};
