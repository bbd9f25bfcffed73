//! Error types for the Canopy overlay

use thiserror::Error;

use crate::{KeyId, SubscriptionId};

/// Core Canopy errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CanopyError {
    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    // Topic errors
    #[error("Malformed topic: {0}")]
    MalformedTopic(String),

    // Crypto errors
    #[error("Key not found: {0}")]
    KeyNotFound(KeyId),

    #[error("Authentication failed")]
    Authentication,

    #[error("No network key provisioned")]
    NetworkKeyMissing,

    #[error("Invalid key material: expected {expected} bytes, got {actual}")]
    InvalidKey { expected: usize, actual: usize },

    // Link errors
    #[error("Link establishment timed out")]
    Timeout,

    #[error("Already linked to remote endpoint")]
    AlreadyLinked,

    #[error("Link rejected by remote")]
    LinkRejected,

    #[error("Link attempt cancelled")]
    LinkCancelled,

    #[error("Link not found")]
    LinkNotFound,

    // Subscription errors
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    // Publication errors
    #[error("Publisher has used every sequence number")]
    SequenceExhausted,

    // Lifecycle errors
    #[error("Node not started")]
    NotStarted,

    #[error("Node already started")]
    AlreadyStarted,

    #[error("Node closed")]
    Closed,

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CanopyError {
    /// Whether repeating the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CanopyError::Timeout
                | CanopyError::LinkRejected
                | CanopyError::LinkCancelled
                | CanopyError::KeyNotFound(_)
                | CanopyError::Transport(_)
                | CanopyError::NotStarted
        )
    }
}

/// Result type for Canopy operations
pub type CanopyResult<T> = Result<T, CanopyError>;
