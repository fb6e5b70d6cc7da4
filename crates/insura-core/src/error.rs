use thiserror::Error;

use crate::order::OrderStatus;

/// Core error types for domain operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid order status transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Unknown order status: {0}")]
    UnknownStatus(String),

    #[error("Invalid chat role: {0}")]
    InvalidRole(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a new InvalidTransition error
    pub fn invalid_transition(from: OrderStatus, to: OrderStatus) -> Self {
        Self::InvalidTransition { from, to }
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
