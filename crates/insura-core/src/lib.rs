//! # insura-core
//!
//! Domain types shared by every layer of the insura backend: users, products,
//! orders and chat messages, plus the snowflake id generator that mints their
//! identifiers.
//!
//! Identifiers are `i64` internally and travel as decimal strings in JSON so
//! that consumers parsing payloads as generic JSON never lose precision.

pub mod chat;
pub mod error;
pub mod id;
pub mod order;
pub mod product;
pub mod user;

pub use chat::{ChatMessage, ChatRole};
pub use error::{CoreError, Result};
pub use id::{Clock, IdError, IdGenerator, MonotonicClock};
pub use order::{Order, OrderStatus};
pub use product::Product;
pub use user::User;
