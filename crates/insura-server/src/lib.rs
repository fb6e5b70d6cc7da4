//! # insura-server
//!
//! Data-access reliability layer of the insura backend: cache-aside
//! repositories over the relational store, a lock manager for cache
//! repopulation, in-process load coalescing, and an at-least-once stream
//! queue that drives asynchronous order underwriting.

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod observability;
pub mod queue;
pub mod repository;
pub mod workflow;

pub use bootstrap::{App, BootstrapError};
pub use cache::{BackgroundWriter, CacheBackend, CacheError, CacheLayer, Coalescer, LockError, LockManager};
pub use config::{
    AppConfig, CacheConfig, LockConfig, QueueConfig, RedisConfig, ServerConfig, StorageBackend,
    WorkflowConfig,
};
pub use observability::init_tracing;
pub use queue::{Handler, HandlerError, QueueError, StreamBroker, StreamQueue, StreamTask, UnderwritingTask};
pub use repository::{Repositories, RepositoryError};
pub use workflow::{OrderError, OrderWorkflow, UnderwritingHandler};
