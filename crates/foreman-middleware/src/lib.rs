//! `foreman-middleware` – lifecycle event distribution.
//!
//! # Modules
//!
//! - [`bus`] – Event bus with synchronous, failure-isolated listeners plus
//!   Tokio broadcast channels for async consumers.

pub mod bus;

pub use bus::{EventBus, ListenerId, Topic, TopicReceiver};
