//! Long-polling message hub.
//!
//! A [`Hub`] keeps at most one [`session`] per client. Each session pushes
//! the client's inbound messages into a [`Store`], then waits for messages
//! on its channels that the client has not acknowledged yet, coalescing
//! them with a batcher before answering. [`http::router`] exposes the hub
//! as a single `POST /lpio` endpoint.

pub mod config;
pub mod errors;
pub mod http;
pub mod hub;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod realtime;
pub mod session;
pub mod store;
mod validate;

pub use config::{BatchConfig, ClientIdGenerator, HubConfig, StoreConfig};
pub use errors::{Error, Result, StoreError, ValidationError};
pub use hub::{Hub, OpenRequest, SendOptions};
pub use message::{Message, MessageKind};
pub use metrics::MetricsSnapshot;
pub use session::{ClientAssignment, CloseEvent, CloseState, Outcome, SessionOutput};
pub use store::{MemoryStore, Store};
