//! `foreman-kernel` – lifecycle rules and stall classification.
//!
//! The kernel does not plan or act; it decides what an agent is allowed to
//! do next and whether it is still making progress.
//!
//! # Modules
//!
//! - [`state_machine`] – [`AgentStateMachine`][state_machine::AgentStateMachine]:
//!   validates lifecycle transitions against a fixed edge table, publishes a
//!   `StateTransition` event for every applied move, and offers a forced
//!   path for timeouts, cancellation and recovery.
//! - [`stall_detector`] – [`StallDetector`][stall_detector::StallDetector]:
//!   samples position, progress and declared state once per tick and
//!   classifies stalls in strict priority order.

pub mod stall_detector;
pub mod state_machine;

pub use stall_detector::{StallDetector, StallRecord, StallSignals, StallThresholds};
pub use state_machine::{AgentStateMachine, TransitionRecord, allowed_successors};
