//! HTTP transport for the hub.

pub mod handlers;

pub use handlers::{router, LPIO_PATH};
