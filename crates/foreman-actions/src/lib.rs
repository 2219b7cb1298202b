//! `foreman-actions` – the unit-of-work layer.
//!
//! # Modules
//!
//! - [`action`] – the [`Action`] trait and the per-step [`ActionContext`].
//! - [`registry`] – [`ActionRegistry`]: name-keyed factories that turn plan
//!   steps into boxed actions.
//! - [`sim`] – [`SimRegistry`][sim::SimRegistry]: simulated block-world
//!   actions with fault injection for demos and tests.

pub mod action;
pub mod registry;
pub mod sim;

pub use action::{Action, ActionContext, PathReport};
pub use registry::{ActionFactory, ActionRegistry};
pub use sim::SimRegistry;
