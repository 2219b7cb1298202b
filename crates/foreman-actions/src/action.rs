//! Generic `Action` trait – the tick/progress/complete contract every unit of
//! work honours.
//!
//! Actions are created by an [`ActionRegistry`][crate::registry::ActionRegistry]
//! factory and owned by the executor while current. The executor never
//! branches on which concrete action it holds; it only calls this trait.
//!
//! Lifecycle: `pending` (constructed) → `running` (after [`Action::start`]) →
//! `succeeded` / `failed` ([`Action::is_complete`] plus
//! [`Action::did_succeed`]).

use foreman_types::{ActionError, AgentId, Position};

/// Path outcome an action reported during a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathReport {
    /// The pathfinder could not reach the target.
    Blocked,
    /// A path to the target was acquired.
    Found,
}

/// Mutable view of the agent handed to an action for one step.
pub struct ActionContext<'a> {
    pub agent_id: &'a AgentId,
    /// Live agent position; movement actions write to it.
    pub position: &'a mut Position,
    /// Monotonic tick counter of the owning executor.
    pub tick: u64,
    path: Option<PathReport>,
}

impl<'a> ActionContext<'a> {
    pub fn new(agent_id: &'a AgentId, position: &'a mut Position, tick: u64) -> Self {
        Self {
            agent_id,
            position,
            tick,
            path: None,
        }
    }

    pub fn report_path_blocked(&mut self) {
        self.path = Some(PathReport::Blocked);
    }

    pub fn report_path_found(&mut self) {
        self.path = Some(PathReport::Found);
    }

    /// The last path report of this step, if any.
    pub fn take_path_report(&mut self) -> Option<PathReport> {
        self.path.take()
    }
}

/// A unit of work advanced one step per tick.
///
/// `progress()` must never decrease and never exceed `total_steps()`.
pub trait Action: Send {
    /// Registry name, e.g. `"move_to"`.
    fn name(&self) -> &str;

    /// Called once before the first step. Actions that need the agent's
    /// starting position (to size themselves) read it here.
    fn start(&mut self, _ctx: &mut ActionContext<'_>) {}

    /// Advance one step and return the progress gained.
    ///
    /// # Errors
    ///
    /// * [`ActionError::Recoverable`] – the executor ticks again (bounded).
    /// * [`ActionError::ResourceUnavailable`] – treated as a resource stall.
    /// * any other variant fails the command.
    fn tick(&mut self, ctx: &mut ActionContext<'_>) -> Result<u32, ActionError>;

    fn progress(&self) -> u32;

    fn total_steps(&self) -> u32;

    fn is_complete(&self) -> bool;

    fn did_succeed(&self) -> bool;

    /// Human-readable outcome for the `ActionCompleted` event.
    fn outcome(&self) -> String {
        if self.did_succeed() {
            format!("{} finished", self.name())
        } else {
            format!("{} failed", self.name())
        }
    }

    /// Stop early. The executor discards the action afterwards.
    fn cancel(&mut self) {}

    /// `true` when a healthy run of this action changes the agent's position.
    /// Stationary actions disarm the position stall axis.
    fn expects_movement(&self) -> bool {
        false
    }

    /// Request a fresh path after a reposition. Returns `true` when a route
    /// is now available.
    fn reissue_path(&mut self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal in-process action used only for tests.
    struct Countdown {
        left: u32,
        total: u32,
    }

    impl Action for Countdown {
        fn name(&self) -> &str {
            "countdown"
        }

        fn tick(&mut self, _ctx: &mut ActionContext<'_>) -> Result<u32, ActionError> {
            if self.left == 0 {
                return Ok(0);
            }
            self.left -= 1;
            Ok(1)
        }

        fn progress(&self) -> u32 {
            self.total - self.left
        }

        fn total_steps(&self) -> u32 {
            self.total
        }

        fn is_complete(&self) -> bool {
            self.left == 0
        }

        fn did_succeed(&self) -> bool {
            self.left == 0
        }
    }

    #[test]
    fn default_hooks() {
        let mut action = Countdown { left: 2, total: 2 };
        assert!(!action.expects_movement());
        assert!(action.reissue_path());
        let id = AgentId::new("steve");
        let mut pos = Position::default();
        let mut ctx = ActionContext::new(&id, &mut pos, 0);
        action.start(&mut ctx);
        assert_eq!(action.tick(&mut ctx).ok(), Some(1));
        assert_eq!(action.tick(&mut ctx).ok(), Some(1));
        assert!(action.is_complete());
        assert_eq!(action.outcome(), "countdown finished");
    }

    #[test]
    fn path_report_is_taken_once() {
        let id = AgentId::new("steve");
        let mut pos = Position::default();
        let mut ctx = ActionContext::new(&id, &mut pos, 7);
        ctx.report_path_blocked();
        ctx.report_path_found();
        assert_eq!(ctx.take_path_report(), Some(PathReport::Found));
        assert_eq!(ctx.take_path_report(), None);
    }
}
