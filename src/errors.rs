//! Error taxonomy for the hub, its sessions and the store.
//!
//! Validation problems are never raised synchronously from `Hub::open`;
//! they travel through the session output like any other terminal event.

use std::time::Duration;

use thiserror::Error;

/// Malformed open/send parameters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Channels undefined.")]
    MissingChannels,

    #[error("Server is destroyed.")]
    Destroyed,

    #[error("Message #{index} is not an object.")]
    NotAnObject { index: usize },

    #[error("Message #{index} has an invalid id.")]
    InvalidId { index: usize },

    #[error("Message {id:?} has an invalid type: {kind}")]
    InvalidType { id: String, kind: String },

    #[error("Message {id:?} has no channel.")]
    MissingChannel { id: String },

    #[error("Message {id:?} has no data.")]
    EmptyData { id: String },

    #[error("Message {id:?} is malformed: {reason}")]
    Malformed { id: String, reason: String },

    #[error("Data is undefined.")]
    MissingData,

    #[error("Channel is undefined.")]
    MissingRecipient,
}

/// Backing store failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store is destroyed.")]
    Destroyed,

    #[error("Message {id:?} cannot be stored: {reason}")]
    Rejected { id: String, reason: &'static str },

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the hub
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Delivery timeout: message {id:?} was not acknowledged within {timeout:?}.")]
    DeliveryTimeout { id: String, timeout: Duration },

    #[error("Session ended without a close event.")]
    SessionLost,
}

impl Error {
    /// Short machine-readable name, used in logs and HTTP error bodies
    pub fn error_name(&self) -> &'static str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::Store(_) => "StoreError",
            Error::DeliveryTimeout { .. } => "DeliveryTimeoutError",
            Error::SessionLost => "SessionLost",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
