//! Error types for the Gatehouse admission-control library.

use thiserror::Error;

/// Main error type for Gatehouse operations.
#[derive(Error, Debug)]
pub enum GatehouseError {
    /// Configuration-related errors (malformed rules, bad YAML, invalid
    /// thresholds). These fail fast at the call site that caused them.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The admission queue is at capacity; the entry was not enqueued.
    #[error("Admission queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The admission queue was cleared while this entry was pending.
    #[error("Admission queue cleared while entry was pending")]
    QueueCleared,

    /// No rule is registered under the given id.
    #[error("Unknown rule: {0}")]
    UnknownRule(String),

    /// The downstream processor failed while draining a queued entry.
    /// Routed to that entry's completion channel only; never aborts the
    /// drain loop.
    #[error("Downstream processing failed: {0}")]
    Downstream(String),

    /// I/O errors (configuration file loading).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatehouse operations.
pub type Result<T> = std::result::Result<T, GatehouseError>;
