//! At-least-once task queue over consumer-group streams.
//!
//! ```text
//! push ──▶ stream ──▶ group ──▶ delivery loop ──▶ handler ──ok──▶ ack
//!                       │                            │
//!                       │                          error: stays pending
//!                       ▼
//!               reclaim loop (ticker)
//!                 ├─ count > max_retries ──▶ <stream>:dead, ack
//!                 └─ idle >= threshold ────▶ claim, handler, ack
//! ```
//!
//! The broker is Redis Streams when Redis is configured, otherwise an
//! in-process broker with the same delivery semantics.

pub mod broker;
pub mod consumer;
pub mod task;

pub use broker::{Fields, PendingEntry, StreamBroker, StreamMessage};
pub use consumer::{Handler, HandlerError, ReclaimReport, StreamQueue};
pub use task::{PayloadError, StreamTask, UnderwritingTask};

/// Field carrying the task type tag.
pub const KIND_FIELD: &str = "kind";

/// Consumer group name for `stream`.
pub fn group_name(stream: &str) -> String {
    format!("{stream}group")
}

/// Dead-letter stream for `stream`.
pub fn dead_letter_stream(stream: &str) -> String {
    format!("{stream}:dead")
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to create group {group} on stream {stream}: {reason}")]
    CreateGroup {
        stream: String,
        group: String,
        reason: String,
    },

    #[error("failed to append to stream {stream}: {reason}")]
    Append { stream: String, reason: String },

    #[error("group {group} does not exist on stream {stream}")]
    NoGroup { stream: String, group: String },

    #[error("broker unavailable: {0}")]
    Broker(String),
}

impl From<deadpool_redis::PoolError> for QueueError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        QueueError::Broker(e.to_string())
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Broker(e.to_string())
    }
}
