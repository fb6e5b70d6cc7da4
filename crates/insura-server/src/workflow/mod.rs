//! Business workflows built on the repositories and the queue.

pub mod order;

pub use order::{OrderError, OrderWorkflow, UnderwritingHandler, policy_number};
