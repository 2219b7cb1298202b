//! [`AgentStateMachine`] – validated lifecycle transitions.
//!
//! The machine owns an agent's declared [`AgentState`] and is the only place
//! that state changes. Two operations exist:
//!
//! * [`AgentStateMachine::transition`] – checks the edge table below and
//!   either applies the move and publishes a `StateTransition` event, or
//!   returns [`ForemanError::InvalidTransition`] with nothing changed.
//! * [`AgentStateMachine::force_transition`] – skips the table, always
//!   applies, always publishes (with `forced = true`). Reserved for
//!   timeouts, cancellation, recovery aborts and shutdown.
//!
//! | From | Allowed successors |
//! |---|---|
//! | `IDLE` | `PLANNING` |
//! | `PLANNING` | `EXECUTING`, `IDLE` |
//! | `EXECUTING` | `PAUSED`, `COMPLETED`, `FAILED` |
//! | `PAUSED` | `EXECUTING` |
//! | `COMPLETED` | `IDLE` |
//! | `FAILED` | `IDLE` |
//!
//! # Example
//!
//! ```
//! use foreman_kernel::state_machine::AgentStateMachine;
//! use foreman_types::{AgentId, AgentState};
//!
//! let mut machine = AgentStateMachine::new(AgentId::new("steve"), None);
//! machine.transition(AgentState::Planning, "command received").unwrap();
//! assert!(machine.transition(AgentState::Completed, "skip ahead").is_err());
//! assert_eq!(machine.state(), AgentState::Planning);
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use foreman_middleware::EventBus;
use foreman_types::{AgentId, AgentState, Event, ForemanError, LifecycleEvent};
use serde::Serialize;
use tracing::{debug, warn};

/// Number of transitions retained for diagnostics.
pub const HISTORY_CAPACITY: usize = 32;

const EVENT_SOURCE: &str = "foreman-kernel::state_machine";

/// Allowed guarded successors of `from`.
pub fn allowed_successors(from: AgentState) -> &'static [AgentState] {
    match from {
        AgentState::Idle => &[AgentState::Planning],
        AgentState::Planning => &[AgentState::Executing, AgentState::Idle],
        AgentState::Executing => &[
            AgentState::Paused,
            AgentState::Completed,
            AgentState::Failed,
        ],
        AgentState::Paused => &[AgentState::Executing],
        AgentState::Completed | AgentState::Failed => &[AgentState::Idle],
    }
}

/// One entry of the transition history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub from: AgentState,
    pub to: AgentState,
    pub reason: String,
    pub forced: bool,
    pub at: DateTime<Utc>,
}

/// Lifecycle state holder for a single agent.
#[derive(Debug)]
pub struct AgentStateMachine {
    agent_id: AgentId,
    state: AgentState,
    bus: Option<EventBus>,
    history: VecDeque<TransitionRecord>,
}

impl AgentStateMachine {
    /// Create a machine in [`AgentState::Idle`].
    ///
    /// With `bus = None` transitions are still validated and recorded but no
    /// events are published.
    pub fn new(agent_id: AgentId, bus: Option<EventBus>) -> Self {
        Self {
            agent_id,
            state: AgentState::Idle,
            bus,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn can_transition_to(&self, target: AgentState) -> bool {
        allowed_successors(self.state).contains(&target)
    }

    pub fn allowed_successors(&self) -> &'static [AgentState] {
        allowed_successors(self.state)
    }

    pub fn can_accept_commands(&self) -> bool {
        self.state.can_accept_commands()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Guarded transition. On rejection the state is untouched and no event
    /// is published.
    pub fn transition(&mut self, target: AgentState, reason: &str) -> Result<(), ForemanError> {
        if !self.can_transition_to(target) {
            warn!(
                agent = %self.agent_id,
                from = ?self.state,
                to = ?target,
                reason,
                "rejected invalid state transition"
            );
            return Err(ForemanError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        debug!(agent = %self.agent_id, from = ?self.state, to = ?target, reason, "state transition");
        self.apply(target, reason, false);
        Ok(())
    }

    /// Unchecked transition. Always applies and always publishes.
    pub fn force_transition(&mut self, target: AgentState, reason: &str) {
        warn!(
            agent = %self.agent_id,
            from = ?self.state,
            to = ?target,
            reason,
            "forced state transition"
        );
        self.apply(target, reason, true);
    }

    /// Force back to `IDLE` with reason `"reset"`. No-op when already idle.
    pub fn reset(&mut self) {
        if self.state != AgentState::Idle {
            self.force_transition(AgentState::Idle, "reset");
        }
    }

    /// Most recent transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    pub fn last_transition(&self) -> Option<&TransitionRecord> {
        self.history.back()
    }

    fn apply(&mut self, target: AgentState, reason: &str, forced: bool) {
        let from = self.state;
        self.state = target;

        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            from,
            to: target,
            reason: reason.to_string(),
            forced,
            at: Utc::now(),
        });

        if let Some(bus) = &self.bus {
            bus.publish(Event::new(
                EVENT_SOURCE,
                LifecycleEvent::StateTransition {
                    agent_id: self.agent_id.clone(),
                    from,
                    to: target,
                    reason: reason.to_string(),
                    forced,
                },
            ));
        }
    }
}
