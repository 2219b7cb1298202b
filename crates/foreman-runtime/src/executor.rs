//! [`ActionExecutor`] – per-agent command lifecycle driven one tick at a time.
//!
//! The executor bridges a slow, asynchronous planning call into the
//! synchronous simulation step. It owns everything about one agent: its
//! position, [`AgentStateMachine`], [`StallDetector`], [`RecoveryPolicy`],
//! the pending plan handle and the action queue.
//!
//! # Tick order
//!
//! 1. **Planning** – poll the handoff. A plan moves the agent to `EXECUTING`;
//!    an error, a closed handoff or an exhausted tick budget forces `IDLE`.
//! 2. **Cleanup** – `COMPLETED` / `FAILED` drop the queue and force `IDLE`.
//! 3. **Sample** – the stall detector sees this tick's signals.
//! 4. **Recover** – while `EXECUTING`, a detected stall is handed to the
//!    recovery policy before the action runs.
//! 5. **Step** – advance the current action once; start the next one or
//!    finish the queue as needed.
//!
//! Planning errors never escape [`ActionExecutor::tick`]; they become a
//! forced `IDLE` transition whose reason is logged and published.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use foreman_actions::SimRegistry;
//! use foreman_middleware::EventBus;
//! use foreman_runtime::executor::{ActionExecutor, ExecutorConfig};
//! use foreman_runtime::pool::ManualDispatcher;
//! use foreman_types::{ActionSpec, AgentId, AgentState, Plan, Position};
//!
//! let dispatcher = Arc::new(ManualDispatcher::new());
//! let mut agent = ActionExecutor::new(
//!     AgentId::new("steve"),
//!     Position::default(),
//!     ExecutorConfig::default(),
//!     Arc::new(SimRegistry::new().with_movement().build()),
//!     dispatcher.clone(),
//!     EventBus::default(),
//! );
//!
//! agent.submit_command("wait a moment").unwrap();
//! dispatcher.resolve_next(Ok(Plan::new(vec![ActionSpec::new("wait").with("ticks", 1)])));
//! agent.tick();
//! assert_eq!(agent.state(), AgentState::Completed);
//! agent.tick();
//! assert_eq!(agent.state(), AgentState::Idle);
//! ```

use std::sync::Arc;
use std::time::Instant;

use foreman_actions::{Action, ActionContext, ActionRegistry, PathReport};
use foreman_kernel::{AgentStateMachine, StallDetector, StallRecord, StallSignals, StallThresholds};
use foreman_middleware::EventBus;
use foreman_types::{
    ActionError, ActionSpec, AgentId, AgentState, Event, ForemanError, LifecycleEvent, Plan,
    PlanningError, Position, StallKind,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::handoff::{PlanHandle, PlanPoll};
use crate::pool::{PlanDispatcher, PlanRequest};
use crate::recovery::{RecoveryLimits, RecoveryPolicy, RecoveryStats, RecoveryTarget};

const EVENT_SOURCE: &str = "foreman-runtime::executor";

/// Base system context sent with every plan request.
pub const DEFAULT_SYSTEM_CONTEXT: &str = "\
You are the planner for a worker agent in a block-based world. \
Turn the player's instruction into a short ordered list of actions.";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`ActionExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Ticks a plan request may stay unresolved before it is abandoned.
    pub planning_budget_ticks: u64,
    /// Recoverable errors tolerated per action before the command fails.
    pub max_action_retries: u32,
    /// Sideways displacement (blocks) applied by a reposition remedy.
    pub reposition_distance: f64,
    pub stall: StallThresholds,
    pub recovery: RecoveryLimits,
    pub system_context: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            planning_budget_ticks: 60,
            max_action_retries: 3,
            reposition_distance: 1.0,
            stall: StallThresholds::default(),
            recovery: RecoveryLimits::default(),
            system_context: DEFAULT_SYSTEM_CONTEXT.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only view of an agent for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub agent_id: AgentId,
    pub state: AgentState,
    pub position: Position,
    pub command: Option<String>,
    pub planning: bool,
    pub current_action: Option<String>,
    /// `(progress, total_steps)` of the current action.
    pub action_progress: Option<(u32, u32)>,
    /// Zero-based index of the current step and the queue length.
    pub step: usize,
    pub steps: usize,
    pub stall: StallRecord,
    pub recovery: RecoveryStats,
    pub last_failure: Option<String>,
    pub tick: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

struct PendingPlan {
    handle: PlanHandle,
    dispatched_at: u64,
}

struct RunningAction {
    action: Box<dyn Action>,
    spec: ActionSpec,
    started_tick: u64,
    started_at: Instant,
    retries: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// ActionExecutor
// ─────────────────────────────────────────────────────────────────────────────

/// Owns one agent's command lifecycle. Must only be driven by a single
/// control loop.
pub struct ActionExecutor {
    agent_id: AgentId,
    position: Position,
    machine: AgentStateMachine,
    detector: StallDetector,
    policy: RecoveryPolicy,
    registry: Arc<ActionRegistry>,
    dispatcher: Arc<dyn PlanDispatcher>,
    bus: EventBus,
    config: ExecutorConfig,
    command: Option<String>,
    pending: Option<PendingPlan>,
    queue: Vec<ActionSpec>,
    index: usize,
    current: Option<RunningAction>,
    /// Progress of finished actions in the current stream.
    progress_base: u64,
    /// Repositions performed for the current command; picks the nudge side.
    nudges: u32,
    tick: u64,
    last_failure: Option<String>,
}

impl ActionExecutor {
    /// Create an idle agent at `position`.
    pub fn new(
        agent_id: AgentId,
        position: Position,
        config: ExecutorConfig,
        registry: Arc<ActionRegistry>,
        dispatcher: Arc<dyn PlanDispatcher>,
        bus: EventBus,
    ) -> Self {
        let machine = AgentStateMachine::new(agent_id.clone(), Some(bus.clone()));
        let initial = StallSignals::new(position, 0, AgentState::Idle).stationary();
        let detector = StallDetector::new(agent_id.clone(), config.stall, &initial);
        let policy = RecoveryPolicy::new(config.recovery);
        Self {
            agent_id,
            position,
            machine,
            detector,
            policy,
            registry,
            dispatcher,
            bus,
            config,
            command: None,
            pending: None,
            queue: Vec::new(),
            index: 0,
            current: None,
            progress_base: 0,
            nudges: 0,
            tick: 0,
            last_failure: None,
        }
    }

    // ── Commands ────────────────────────────────────────────────────────────

    /// Start planning `text`.
    ///
    /// Running work is preempted and a finished command is cleaned up first.
    ///
    /// # Errors
    ///
    /// * [`ForemanError::AlreadyPlanning`] while a plan request is pending.
    /// * [`ForemanError::PlannerSaturated`] when the dispatcher refuses the
    ///   request; the agent is left `IDLE`.
    pub fn submit_command(&mut self, text: &str) -> Result<(), ForemanError> {
        if self.pending.is_some() {
            warn!(agent = %self.agent_id, command = text, "command rejected: already planning");
            return Err(ForemanError::AlreadyPlanning);
        }

        match self.machine.state() {
            AgentState::Executing | AgentState::Paused => {
                self.stop_stream("preempted by new command");
                self.machine
                    .force_transition(AgentState::Idle, "preempted by new command");
            }
            AgentState::Completed | AgentState::Failed => self.cleanup(),
            AgentState::Planning => {
                self.machine
                    .force_transition(AgentState::Idle, "planning cancelled");
            }
            AgentState::Idle => {}
        }

        self.command = Some(text.to_string());
        self.last_failure = None;
        self.policy.reset_escalation();
        self.nudges = 0;
        // Rebase on the pre-planning state so the first planning sample
        // registers the state change.
        let signals = self.signals();
        self.detector.reset(&signals);
        self.machine
            .transition(AgentState::Planning, "command received")?;

        if let Err(err) = self.dispatch_plan() {
            self.command = None;
            self.last_failure = Some(err.to_string());
            self.machine
                .force_transition(AgentState::Idle, "planning failed");
            return Err(err);
        }
        info!(agent = %self.agent_id, command = text, "command accepted");
        Ok(())
    }

    /// Advance the agent by one tick.
    pub fn tick(&mut self) {
        self.tick += 1;

        match self.machine.state() {
            AgentState::Planning => self.poll_plan(),
            AgentState::Completed | AgentState::Failed => self.cleanup(),
            AgentState::Idle | AgentState::Executing | AgentState::Paused => {}
        }

        let signals = self.signals();
        self.detector.sample(&signals);

        if self.machine.state() != AgentState::Executing {
            return;
        }
        if let Some(kind) = self.detector.detect_stuck() {
            self.recover(kind);
            if self.machine.state() != AgentState::Executing {
                return;
            }
        }
        self.step_action();
    }

    /// Cancel any pending plan, drop the queue and force `IDLE`.
    pub fn shutdown(&mut self) {
        self.cancel_pending();
        self.stop_stream("shutdown");
        self.command = None;
        if self.machine.state() != AgentState::Idle {
            self.machine.force_transition(AgentState::Idle, "shutdown");
        }
        info!(agent = %self.agent_id, "executor shut down");
    }

    /// Suspend execution. Only valid while `EXECUTING`.
    pub fn pause(&mut self) -> Result<(), ForemanError> {
        self.machine
            .transition(AgentState::Paused, "paused by operator")
    }

    /// Resume a paused command. Stall counters start fresh.
    pub fn resume(&mut self) -> Result<(), ForemanError> {
        self.machine
            .transition(AgentState::Executing, "resumed by operator")?;
        let signals = self.signals();
        self.detector.reset(&signals);
        Ok(())
    }

    /// Operator cancel. Returns `false` when there was nothing to cancel.
    pub fn cancel(&mut self) -> bool {
        match self.machine.state() {
            AgentState::Planning => {
                self.abandon_planning(PlanningError::Cancelled);
                true
            }
            AgentState::Executing | AgentState::Paused => {
                self.stop_stream("command cancelled");
                self.command = None;
                self.machine
                    .force_transition(AgentState::Idle, "command cancelled");
                true
            }
            AgentState::Idle | AgentState::Completed | AgentState::Failed => false,
        }
    }

    // ── Collaborator entry points ───────────────────────────────────────────

    /// Pathfinder reported the current target unreachable.
    pub fn mark_path_stuck(&mut self) {
        self.detector.mark_path_stuck();
    }

    /// Pathfinder acquired a path.
    pub fn clear_path_stuck(&mut self) {
        self.detector.clear_path_stuck();
    }

    /// Teleport or externally move the agent.
    pub fn set_position(&mut self, position: Position) {
        self.position = position;
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn state(&self) -> AgentState {
        self.machine.state()
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn is_planning(&self) -> bool {
        self.pending.is_some()
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn state_machine(&self) -> &AgentStateMachine {
        &self.machine
    }

    pub fn stall_detector(&self) -> &StallDetector {
        &self.detector
    }

    pub fn recovery_stats(&self) -> &RecoveryStats {
        self.policy.stats()
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            agent_id: self.agent_id.clone(),
            state: self.machine.state(),
            position: self.position,
            command: self.command.clone(),
            planning: self.pending.is_some(),
            current_action: self.current.as_ref().map(|r| r.spec.action.clone()),
            action_progress: self
                .current
                .as_ref()
                .map(|r| (r.action.progress(), r.action.total_steps())),
            step: self.index,
            steps: self.queue.len(),
            stall: self.detector.record().clone(),
            recovery: *self.policy.stats(),
            last_failure: self.last_failure.clone(),
            tick: self.tick,
        }
    }

    // ── Planning ────────────────────────────────────────────────────────────

    fn dispatch_plan(&mut self) -> Result<(), ForemanError> {
        let command = self
            .command
            .clone()
            .ok_or_else(|| ForemanError::PlanningFailed("no command to plan".to_string()))?;
        let request = PlanRequest {
            agent_id: self.agent_id.clone(),
            command,
            system_context: self.config.system_context.clone(),
            budget_ticks: self.config.planning_budget_ticks,
        };
        let handle = self.dispatcher.dispatch(request)?;
        self.pending = Some(PendingPlan {
            handle,
            dispatched_at: self.tick,
        });
        Ok(())
    }

    fn poll_plan(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            self.command = None;
            self.machine
                .force_transition(AgentState::Idle, "planning cancelled");
            return;
        };

        let elapsed = self.tick.saturating_sub(pending.dispatched_at);
        let outcome = match pending.handle.poll() {
            PlanPoll::Ready(result) => Some(result),
            PlanPoll::Pending if elapsed >= pending.handle.budget_ticks() => {
                Some(Err(PlanningError::Timeout))
            }
            PlanPoll::Pending => None,
        };

        match outcome {
            None => debug!(agent = %self.agent_id, elapsed, "plan pending"),
            Some(Ok(plan)) if plan.is_empty() => {
                self.abandon_planning(PlanningError::Failed("empty plan".to_string()));
            }
            Some(Ok(plan)) => self.apply_plan(plan),
            Some(Err(err)) => self.abandon_planning(err),
        }
    }

    fn apply_plan(&mut self, plan: Plan) {
        self.pending = None;
        let Plan { goal, actions } = plan;
        let steps = actions.len();
        self.queue = actions;
        self.index = 0;
        self.progress_base = 0;
        self.current = None;

        if self
            .machine
            .transition(AgentState::Executing, "plan ready")
            .is_err()
        {
            self.clear_queue();
            return;
        }
        let signals = self.signals();
        self.detector.reset(&signals);
        info!(
            agent = %self.agent_id,
            steps,
            goal = goal.as_deref().unwrap_or("-"),
            "plan applied"
        );
    }

    fn abandon_planning(&mut self, err: PlanningError) {
        self.cancel_pending();
        self.command = None;
        self.last_failure = Some(err.to_string());
        warn!(agent = %self.agent_id, error = %err, "planning abandoned");
        self.machine
            .force_transition(AgentState::Idle, err.transition_reason());
    }

    fn cancel_pending(&mut self) {
        if let Some(mut pending) = self.pending.take() {
            pending.handle.cancel();
        }
    }

    // ── Execution ───────────────────────────────────────────────────────────

    fn step_action(&mut self) {
        if self.current.is_none() && !self.start_next_action() {
            return;
        }
        let Some(running) = self.current.as_mut() else {
            return;
        };

        let mut ctx = ActionContext::new(&self.agent_id, &mut self.position, self.tick);
        let result = running.action.tick(&mut ctx);
        let path = ctx.take_path_report();
        let complete = running.action.is_complete();
        if matches!(result, Err(ActionError::Recoverable(_))) {
            running.retries += 1;
        }
        let retries = running.retries;

        match path {
            Some(PathReport::Blocked) => self.detector.mark_path_stuck(),
            Some(PathReport::Found) => self.detector.clear_path_stuck(),
            None => {}
        }

        match result {
            Ok(gained) => {
                debug!(agent = %self.agent_id, gained, tick = self.tick, "action stepped");
            }
            Err(ActionError::Recoverable(reason)) => {
                if retries > self.config.max_action_retries {
                    self.fail_action(format!("{reason} (retries exhausted)"));
                } else {
                    warn!(agent = %self.agent_id, retries, %reason, "recoverable action error; retrying");
                }
                return;
            }
            Err(ActionError::ResourceUnavailable(item)) => {
                warn!(agent = %self.agent_id, %item, "required resource missing");
                self.detector.note_detection(StallKind::ResourceStuck);
                self.recover(StallKind::ResourceStuck);
                return;
            }
            Err(err) => {
                self.fail_action(err.to_string());
                return;
            }
        }

        if complete {
            self.finish_action();
        }
    }

    /// Instantiate the action at `index`. Returns `false` when nothing was
    /// started (queue exhausted or the action could not be built).
    fn start_next_action(&mut self) -> bool {
        let Some(spec) = self.queue.get(self.index).cloned() else {
            self.finish_queue();
            return false;
        };

        let mut action = match self.registry.create(&spec) {
            Ok(action) => action,
            Err(err) => {
                self.fail_command(err.to_string());
                return false;
            }
        };

        let mut ctx = ActionContext::new(&self.agent_id, &mut self.position, self.tick);
        action.start(&mut ctx);
        let total_steps = action.total_steps();

        info!(
            agent = %self.agent_id,
            action = %spec.action,
            step = self.index + 1,
            of = self.queue.len(),
            total_steps,
            "action started"
        );
        self.publish(LifecycleEvent::ActionStarted {
            agent_id: self.agent_id.clone(),
            action: spec.action.clone(),
            parameters: spec.parameters.clone(),
            total_steps,
        });
        self.current = Some(RunningAction {
            action,
            spec,
            started_tick: self.tick,
            started_at: Instant::now(),
            retries: 0,
        });
        true
    }

    fn finish_action(&mut self) {
        let Some(running) = self.current.take() else {
            return;
        };
        let success = running.action.did_succeed();
        let message = running.action.outcome();
        self.publish_completed(&running, success, message.clone());

        if !success {
            self.fail_command(message);
            return;
        }
        self.progress_base += u64::from(running.action.progress());
        self.index += 1;
        info!(agent = %self.agent_id, action = %running.spec.action, %message, "action finished");
        if self.index >= self.queue.len() {
            self.finish_queue();
        }
    }

    fn finish_queue(&mut self) {
        info!(agent = %self.agent_id, actions = self.queue.len(), "queue exhausted");
        if let Err(err) = self
            .machine
            .transition(AgentState::Completed, "queue exhausted")
        {
            debug!(agent = %self.agent_id, %err, "completion skipped");
        }
    }

    /// Fail the current action, then the command.
    fn fail_action(&mut self, reason: String) {
        if let Some(mut running) = self.current.take() {
            running.action.cancel();
            self.publish_completed(&running, false, reason.clone());
        }
        self.fail_command(reason);
    }

    fn fail_command(&mut self, reason: String) {
        self.clear_queue();
        error!(agent = %self.agent_id, %reason, "command failed");
        if let Err(err) = self.machine.transition(AgentState::Failed, &reason) {
            debug!(agent = %self.agent_id, %err, "failure transition skipped");
        }
        self.last_failure = Some(reason);
    }

    /// Drop the running action (reporting it as unsuccessful) and the queue.
    fn stop_stream(&mut self, reason: &str) {
        if let Some(mut running) = self.current.take() {
            running.action.cancel();
            self.publish_completed(&running, false, reason.to_string());
        }
        self.clear_queue();
    }

    fn clear_queue(&mut self) {
        self.queue.clear();
        self.index = 0;
        self.progress_base = 0;
    }

    fn cleanup(&mut self) {
        if let Some(mut running) = self.current.take() {
            running.action.cancel();
        }
        self.clear_queue();
        self.command = None;
        self.machine
            .force_transition(AgentState::Idle, "cleanup complete");
    }

    // ── Stall handling ──────────────────────────────────────────────────────

    fn recover(&mut self, kind: StallKind) {
        let mut policy = std::mem::take(&mut self.policy);
        let outcome = policy.apply(kind, self);
        self.policy = policy;
        debug!(agent = %self.agent_id, kind = %kind, ?outcome, "recovery applied");
    }

    fn signals(&self) -> StallSignals {
        let progress = self.progress_base
            + self
                .current
                .as_ref()
                .map_or(0, |r| u64::from(r.action.progress()));
        StallSignals {
            position: self.position,
            progress,
            state: self.machine.state(),
            track_position: self
                .current
                .as_ref()
                .is_some_and(|r| r.action.expects_movement()),
        }
    }

    // ── Events ──────────────────────────────────────────────────────────────

    fn publish(&self, payload: LifecycleEvent) {
        self.bus.publish(Event::new(EVENT_SOURCE, payload));
    }

    fn publish_completed(&self, running: &RunningAction, success: bool, message: String) {
        let duration_ms = u64::try_from(running.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.publish(LifecycleEvent::ActionCompleted {
            agent_id: self.agent_id.clone(),
            action: running.spec.action.clone(),
            success,
            message,
            duration_ticks: self.tick.saturating_sub(running.started_tick),
            duration_ms,
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recovery hooks
// ─────────────────────────────────────────────────────────────────────────────

impl RecoveryTarget for ActionExecutor {
    fn reposition(&mut self, kind: StallKind) -> bool {
        let Some(running) = self.current.as_mut() else {
            return false;
        };
        let path_ok = running.action.reissue_path();

        // Alternate sides so repeated nudges do not drift in one direction.
        let side = if self.nudges % 2 == 0 { 1.0 } else { -1.0 };
        self.nudges += 1;
        self.position = self
            .position
            .offset(side * self.config.reposition_distance, 0.0, 0.0);
        if path_ok {
            self.detector.clear_path_stuck();
        }
        info!(agent = %self.agent_id, kind = %kind, position = %self.position, path_ok, "repositioned");
        path_ok
    }

    fn replan(&mut self, kind: StallKind) -> bool {
        if self.command.is_none() {
            return false;
        }
        let reason = format!("replan after {kind}");
        self.stop_stream(&reason);
        self.machine.force_transition(AgentState::Planning, &reason);
        match self.dispatch_plan() {
            Ok(()) => {
                info!(agent = %self.agent_id, kind = %kind, "replanning original command");
                true
            }
            Err(err) => {
                warn!(agent = %self.agent_id, kind = %kind, %err, "replan could not be dispatched");
                false
            }
        }
    }

    fn abort(&mut self, kind: StallKind) {
        let reason = format!("{}: unrecoverable", kind.as_str());
        self.cancel_pending();
        self.stop_stream(&reason);
        error!(agent = %self.agent_id, kind = %kind, "aborting command");
        self.machine.force_transition(AgentState::Failed, &reason);
        self.last_failure = Some(reason);
    }

    fn reset_stall_record(&mut self) {
        let signals = self.signals();
        self.detector.reset(&signals);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ManualDispatcher;
    use foreman_actions::SimRegistry;
    use std::sync::Mutex;

    struct Harness {
        agent: ActionExecutor,
        planner: Arc<ManualDispatcher>,
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(ExecutorConfig::default())
        }

        fn with_config(config: ExecutorConfig) -> Self {
            Self::build(config, Arc::new(ManualDispatcher::new()))
        }

        fn build(config: ExecutorConfig, planner: Arc<ManualDispatcher>) -> Self {
            let bus = EventBus::default();
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&events);
            bus.subscribe_fn(move |event| {
                sink.lock().map_err(|e| e.to_string())?.push(event.clone());
                Ok(())
            });
            let registry = Arc::new(SimRegistry::new().with_movement().with_labor().build());
            let agent = ActionExecutor::new(
                AgentId::new("steve"),
                Position::new(0.0, 64.0, 0.0),
                config,
                registry,
                planner.clone(),
                bus,
            );
            Self {
                agent,
                planner,
                events,
            }
        }

        /// Submit, resolve with `actions`, and tick once so the plan applies.
        fn run_plan(&mut self, actions: Vec<ActionSpec>) {
            self.agent.submit_command("do the thing").unwrap();
            assert!(self.planner.resolve_next(Ok(Plan::new(actions))));
            self.agent.tick();
        }

        fn ticks(&mut self, n: usize) {
            for _ in 0..n {
                self.agent.tick();
            }
        }

        fn last_reason(&self) -> String {
            self.agent
                .state_machine()
                .last_transition()
                .map(|t| t.reason.clone())
                .unwrap_or_default()
        }

        fn transitions(&self) -> Vec<(AgentState, AgentState, String, bool)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match &e.payload {
                    LifecycleEvent::StateTransition {
                        from,
                        to,
                        reason,
                        forced,
                        ..
                    } => Some((*from, *to, reason.clone(), *forced)),
                    _ => None,
                })
                .collect()
        }

        fn completions(&self) -> Vec<(String, bool)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match &e.payload {
                    LifecycleEvent::ActionCompleted {
                        action, success, ..
                    } => Some((action.clone(), *success)),
                    _ => None,
                })
                .collect()
        }
    }

    fn wait(ticks: u64) -> ActionSpec {
        ActionSpec::new("wait").with("ticks", ticks)
    }

    // ── Submission ──────────────────────────────────────────────────────────

    #[test]
    fn submit_enters_planning_and_rejects_second_command() {
        let mut h = Harness::new();
        assert!(h.agent.submit_command("build a hut").is_ok());
        assert_eq!(h.agent.state(), AgentState::Planning);
        assert!(h.agent.is_planning());
        assert_eq!(h.planner.pending(), 1);

        assert_eq!(
            h.agent.submit_command("never mind"),
            Err(ForemanError::AlreadyPlanning)
        );
        assert_eq!(h.agent.command(), Some("build a hut"));
        assert_eq!(h.planner.pending(), 1);
    }

    #[test]
    fn saturated_pool_leaves_agent_idle() {
        let mut h = Harness::build(
            ExecutorConfig::default(),
            Arc::new(ManualDispatcher::with_capacity(0)),
        );
        assert_eq!(
            h.agent.submit_command("build a hut"),
            Err(ForemanError::PlannerSaturated)
        );
        assert_eq!(h.agent.state(), AgentState::Idle);
        assert_eq!(h.last_reason(), "planning failed");
        assert!(h.agent.command().is_none());
        assert!(!h.agent.is_planning());
    }

    // ── Planning outcomes ───────────────────────────────────────────────────

    #[test]
    fn full_lifecycle_publishes_ordered_events() {
        let mut h = Harness::new();
        h.run_plan(vec![wait(2)]);
        assert_eq!(h.agent.state(), AgentState::Executing);
        h.agent.tick();
        assert_eq!(h.agent.state(), AgentState::Completed);
        h.agent.tick();
        assert_eq!(h.agent.state(), AgentState::Idle);
        assert!(h.agent.command().is_none());

        let transitions = h.transitions();
        let summary: Vec<(AgentState, AgentState, &str, bool)> = transitions
            .iter()
            .map(|(f, t, r, forced)| (*f, *t, r.as_str(), *forced))
            .collect();
        assert_eq!(
            summary,
            vec![
                (AgentState::Idle, AgentState::Planning, "command received", false),
                (AgentState::Planning, AgentState::Executing, "plan ready", false),
                (AgentState::Executing, AgentState::Completed, "queue exhausted", false),
                (AgentState::Completed, AgentState::Idle, "cleanup complete", true),
            ]
        );
        assert_eq!(h.completions(), vec![("wait".to_string(), true)]);
    }

    #[test]
    fn unresolved_plan_times_out_after_budget() {
        let mut h = Harness::new();
        h.agent.submit_command("build a hut").unwrap();

        h.ticks(59);
        assert_eq!(h.agent.state(), AgentState::Planning);

        h.agent.tick();
        assert_eq!(h.agent.state(), AgentState::Idle);
        assert_eq!(h.last_reason(), "planning timeout");
        assert!(!h.agent.is_planning());
        assert!(h.agent.command().is_none());

        // The abandoned slot no longer accepts a late plan.
        assert!(!h.planner.resolve_next(Ok(Plan::new(vec![wait(1)]))));
        assert!(h.agent.submit_command("try again").is_ok());
    }

    #[test]
    fn planner_error_forces_idle_with_reason() {
        let mut h = Harness::new();
        h.agent.submit_command("build a hut").unwrap();
        h.planner
            .resolve_next(Err(PlanningError::Failed("model offline".to_string())));
        h.agent.tick();
        assert_eq!(h.agent.state(), AgentState::Idle);
        assert_eq!(h.last_reason(), "planning failed");
        assert_eq!(h.agent.last_failure(), Some("planning failed: model offline"));
        assert!(h.transitions().last().is_some_and(|t| t.3));
    }

    #[test]
    fn empty_plan_is_a_planning_failure() {
        let mut h = Harness::new();
        h.agent.submit_command("do nothing").unwrap();
        h.planner.resolve_next(Ok(Plan::default()));
        h.agent.tick();
        assert_eq!(h.agent.state(), AgentState::Idle);
        assert_eq!(h.last_reason(), "planning failed");
    }

    #[test]
    fn cancelled_plan_result_forces_idle() {
        let mut h = Harness::new();
        h.agent.submit_command("build a hut").unwrap();
        assert!(!h.planner.resolve_for(&AgentId::new("alex"), Ok(Plan::default())));
        assert!(h.planner.resolve_for(&AgentId::new("steve"), Err(PlanningError::Cancelled)));
        h.agent.tick();
        assert_eq!(h.agent.state(), AgentState::Idle);
        assert_eq!(h.last_reason(), "planning cancelled");
    }

    // ── Execution ───────────────────────────────────────────────────────────

    #[test]
    fn unrecoverable_action_error_fails_command() {
        let mut h = Harness::new();
        h.run_plan(vec![ActionSpec::new("build").with("steps", 5).with("fail_at", 2)]);
        h.agent.tick();
        assert_eq!(h.agent.state(), AgentState::Failed);
        assert!(h.last_reason().contains("interrupted at step 2"));
        assert_eq!(h.completions(), vec![("build".to_string(), false)]);

        h.agent.tick();
        assert_eq!(h.agent.state(), AgentState::Idle);
        assert_eq!(h.last_reason(), "cleanup complete");
        assert!(h.agent.last_failure().is_some());
    }

    #[test]
    fn recoverable_errors_are_retried_then_fail() {
        let mut h = Harness::new();
        h.run_plan(vec![ActionSpec::new("mine").with("steps", 1).with("flaky", 2)]);
        h.ticks(2);
        assert_eq!(h.agent.state(), AgentState::Completed);

        let mut h = Harness::new();
        h.run_plan(vec![ActionSpec::new("mine").with("steps", 1).with("flaky", 10)]);
        h.ticks(2);
        assert_eq!(h.agent.state(), AgentState::Executing);
        h.agent.tick();
        assert_eq!(h.agent.state(), AgentState::Failed);
        assert!(h.last_reason().contains("retries exhausted"));
    }

    #[test]
    fn unknown_action_fails_command() {
        let mut h = Harness::new();
        h.run_plan(vec![ActionSpec::new("fly").with("to", "moon")]);
        assert_eq!(h.agent.state(), AgentState::Failed);
        assert_eq!(h.last_reason(), "unknown action: fly");
    }

    #[test]
    fn multi_step_plan_runs_in_order() {
        let mut h = Harness::new();
        h.run_plan(vec![
            ActionSpec::new("move_to").with("x", 1.0).with("speed", 0.5),
            ActionSpec::new("mine").with("steps", 2),
        ]);
        h.ticks(3);
        assert_eq!(h.agent.state(), AgentState::Completed);
        assert!((h.agent.position().x - 1.0).abs() < 1e-9);
        assert_eq!(
            h.completions(),
            vec![("move_to".to_string(), true), ("mine".to_string(), true)]
        );
    }

    #[test]
    fn pause_freezes_progress_and_resume_continues() -> Result<(), Box<dyn std::error::Error>> {
        let mut h = Harness::new();
        assert!(h.agent.pause().is_err());

        h.run_plan(vec![wait(3)]);
        h.agent.pause()?;
        h.ticks(10);
        assert_eq!(h.agent.state(), AgentState::Paused);
        assert_eq!(h.agent.status().action_progress, Some((1, 3)));

        h.agent.resume()?;
        h.ticks(2);
        assert_eq!(h.agent.state(), AgentState::Completed);
        Ok(())
    }

    #[test]
    fn new_command_preempts_running_stream() {
        let mut h = Harness::new();
        h.run_plan(vec![wait(50)]);
        h.agent.submit_command("go home").unwrap();
        assert_eq!(h.agent.state(), AgentState::Planning);
        assert_eq!(h.agent.status().steps, 0);

        let transitions = h.transitions();
        let preempt = &transitions[transitions.len() - 2];
        assert_eq!(preempt.1, AgentState::Idle);
        assert_eq!(preempt.2, "preempted by new command");
        assert!(preempt.3);
        assert_eq!(h.completions(), vec![("wait".to_string(), false)]);
    }

    #[test]
    fn command_after_completion_runs_cleanup_first() {
        let mut h = Harness::new();
        h.run_plan(vec![wait(1)]);
        assert_eq!(h.agent.state(), AgentState::Completed);
        h.agent.submit_command("again").unwrap();
        assert_eq!(h.agent.state(), AgentState::Planning);
        let reasons: Vec<String> = h.transitions().into_iter().map(|t| t.2).collect();
        assert!(reasons.iter().any(|r| r == "cleanup complete"));
    }

    #[test]
    fn cancel_while_planning_and_executing() {
        let mut h = Harness::new();
        assert!(!h.agent.cancel());

        h.agent.submit_command("build a hut").unwrap();
        assert!(h.agent.cancel());
        assert_eq!(h.last_reason(), "planning cancelled");
        assert!(!h.planner.resolve_next(Ok(Plan::new(vec![wait(1)]))));

        h.run_plan(vec![wait(10)]);
        assert!(h.agent.cancel());
        assert_eq!(h.agent.state(), AgentState::Idle);
        assert_eq!(h.last_reason(), "command cancelled");
    }

    #[test]
    fn shutdown_cancels_pending_handle() {
        let mut h = Harness::new();
        h.agent.submit_command("build a hut").unwrap();
        h.agent.shutdown();
        assert_eq!(h.agent.state(), AgentState::Idle);
        assert_eq!(h.last_reason(), "shutdown");
        assert!(!h.planner.resolve_next(Ok(Plan::new(vec![wait(1)]))));
        assert!(h.agent.submit_command("build a hut").is_ok());
    }

    // ── Stall recovery ──────────────────────────────────────────────────────

    #[test]
    fn blocked_path_is_repositioned_and_record_reset() {
        let mut h = Harness::new();
        h.run_plan(vec![ActionSpec::new("move_to").with("x", 10.0).with("blocked", 1)]);
        assert!(h.agent.stall_detector().is_path_stuck());

        h.agent.tick();
        assert_eq!(h.agent.state(), AgentState::Executing);
        assert_eq!(h.agent.recovery_stats().repositions, 1);
        assert_eq!(h.agent.recovery_stats().successes, 1);
        assert_eq!(h.agent.stall_detector().record(), &StallRecord::default());
        assert!(h.agent.position().x > -1.0);
    }

    #[test]
    fn unreachable_target_replans_then_aborts() {
        let mut h = Harness::new();
        let plan = vec![ActionSpec::new("move_to").with("x", 10.0).with("blocked", true)];
        h.run_plan(plan.clone());

        // Reposition cannot clear the path, so the same tick escalates to replan.
        h.agent.tick();
        assert_eq!(h.agent.state(), AgentState::Planning);
        assert_eq!(h.last_reason(), "replan after PATH_STUCK");
        assert_eq!(h.planner.requests()[0].command, "do the thing");

        h.planner.resolve_next(Ok(Plan::new(plan)));
        h.agent.tick();
        assert_eq!(h.agent.state(), AgentState::Executing);
        h.agent.tick();
        assert_eq!(h.agent.state(), AgentState::Failed);
        assert_eq!(h.last_reason(), "PATH_STUCK: unrecoverable");
        assert_eq!(h.agent.last_failure(), Some("PATH_STUCK: unrecoverable"));
    }

    #[test]
    fn stationary_mover_is_repositioned_after_threshold() {
        let mut h = Harness::new();
        h.run_plan(vec![ActionSpec::new("move_to").with("x", 10.0).with("stuck", true)]);
        h.ticks(59);
        assert_eq!(h.agent.recovery_stats().attempts, 0);
        assert!(h.agent.stall_detector().is_position_stuck(59));

        h.agent.tick();
        assert_eq!(h.agent.recovery_stats().repositions, 1);
        assert_eq!(h.agent.state(), AgentState::Executing);
        assert_eq!(h.agent.stall_detector().detections(StallKind::PositionStuck), 0);
    }

    #[test]
    fn repeated_repositions_alternate_sides() {
        let mut h = Harness::new();
        h.run_plan(vec![ActionSpec::new("move_to").with("x", 10.0).with("stuck", true)]);

        let mut xs = vec![h.agent.position().x];
        let mut ticks = 0;
        for n in 1..=3 {
            while h.agent.recovery_stats().repositions < n {
                assert!(ticks < 1_000, "reposition {n} never fired");
                h.agent.tick();
                ticks += 1;
            }
            assert_eq!(h.agent.state(), AgentState::Executing);
            xs.push(h.agent.position().x);
        }

        assert_eq!(xs, vec![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn frozen_progress_replans_once_then_aborts() {
        let config = ExecutorConfig {
            stall: StallThresholds {
                progress_ticks: 5,
                ..StallThresholds::default()
            },
            ..ExecutorConfig::default()
        };
        let mut h = Harness::with_config(config);
        let plan = vec![ActionSpec::new("mine").with("stall", true)];
        h.run_plan(plan.clone());
        h.ticks(4);
        assert_eq!(h.agent.state(), AgentState::Planning);
        assert_eq!(h.last_reason(), "replan after PROGRESS_STUCK");

        h.planner.resolve_next(Ok(Plan::new(plan)));
        h.ticks(5);
        assert_eq!(h.agent.state(), AgentState::Failed);
        assert_eq!(h.last_reason(), "PROGRESS_STUCK: unrecoverable");
        assert_eq!(h.agent.recovery_stats().replans, 1);
        assert_eq!(h.agent.recovery_stats().aborts, 1);
    }

    #[test]
    fn state_stall_aborts_long_running_command() {
        let config = ExecutorConfig {
            stall: StallThresholds {
                state_ticks: 3,
                ..StallThresholds::default()
            },
            ..ExecutorConfig::default()
        };
        let mut h = Harness::with_config(config);
        h.run_plan(vec![wait(100)]);
        h.ticks(2);
        assert_eq!(h.agent.state(), AgentState::Failed);
        assert_eq!(h.last_reason(), "STATE_STUCK: unrecoverable");
    }

    #[test]
    fn missing_resource_aborts() {
        let mut h = Harness::new();
        h.run_plan(vec![ActionSpec::new("place").with("missing", "cobblestone")]);
        assert_eq!(h.agent.state(), AgentState::Failed);
        assert_eq!(h.last_reason(), "RESOURCE_STUCK: unrecoverable");
        assert_eq!(
            h.agent.stall_detector().detections(StallKind::ResourceStuck),
            1
        );
    }

    #[test]
    fn long_planning_is_sampled_but_not_aborted() {
        let config = ExecutorConfig {
            planning_budget_ticks: 500,
            stall: StallThresholds {
                state_ticks: 10,
                ..StallThresholds::default()
            },
            ..ExecutorConfig::default()
        };
        let mut h = Harness::with_config(config);
        h.agent.submit_command("think hard").unwrap();
        h.ticks(50);
        assert_eq!(h.agent.state(), AgentState::Planning);
        assert!(h.agent.stall_detector().is_state_stuck(AgentState::Planning, 10));
    }

    #[test]
    fn idle_agent_accumulates_state_ticks() {
        let mut h = Harness::new();
        h.ticks(200);
        assert!(h.agent.stall_detector().is_state_stuck(AgentState::Idle, 200));
        assert_eq!(h.agent.state(), AgentState::Idle);

        h.agent.submit_command("build a hut").unwrap();
        h.agent.tick();
        assert_eq!(h.agent.stall_detector().record().state_ticks, 0);
        h.agent.tick();
        assert!(h.agent.stall_detector().is_state_stuck(AgentState::Planning, 1));
    }
}
