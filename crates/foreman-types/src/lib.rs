//! `foreman-types` – shared vocabulary for the Foreman agent stack.
//!
//! Every other crate in the workspace speaks in these types: agent identity
//! and position, the lifecycle [`AgentState`], the [`Plan`] produced by the
//! reasoning service, the [`StallKind`] taxonomy, the [`LifecycleEvent`]
//! records published on the event bus, and the workspace-wide
//! [`ForemanError`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Identity & position
// ─────────────────────────────────────────────────────────────────────────────

/// Stable identifier of an agent inside the simulation (e.g. `"steve"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A point in world space, in block units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Move at most `max_step` units toward `target`, never overshooting.
    pub fn step_toward(&self, target: &Position, max_step: f64) -> Position {
        let distance = self.distance_to(target);
        if distance <= max_step || distance == 0.0 {
            return *target;
        }
        let ratio = max_step / distance;
        Position {
            x: self.x + (target.x - self.x) * ratio,
            y: self.y + (target.y - self.y) * ratio,
            z: self.z + (target.z - self.z) * ratio,
        }
    }

    pub fn offset(&self, dx: f64, dy: f64, dz: f64) -> Position {
        Position::new(self.x + dx, self.y + dy, self.z + dz)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.1}, {:.1}, {:.1})", self.x, self.y, self.z)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle state
// ─────────────────────────────────────────────────────────────────────────────

/// Declared lifecycle state of an agent.
///
/// `Idle` is the only resting state: `Completed` and `Failed` are advanced
/// back to `Idle` by the executor once cleanup finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    /// Waiting for a command.
    Idle,
    /// A plan request is in flight with the reasoning service.
    Planning,
    /// Working through the action queue.
    Executing,
    /// Execution suspended by an operator.
    Paused,
    /// The action queue was exhausted successfully.
    Completed,
    /// The command failed or was aborted by recovery.
    Failed,
}

impl AgentState {
    pub const ALL: [AgentState; 6] = [
        AgentState::Idle,
        AgentState::Planning,
        AgentState::Executing,
        AgentState::Paused,
        AgentState::Completed,
        AgentState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "IDLE",
            AgentState::Planning => "PLANNING",
            AgentState::Executing => "EXECUTING",
            AgentState::Paused => "PAUSED",
            AgentState::Completed => "COMPLETED",
            AgentState::Failed => "FAILED",
        }
    }

    /// `true` for the states from which a new command may start without
    /// preempting running work.
    pub fn can_accept_commands(&self) -> bool {
        matches!(
            self,
            AgentState::Idle | AgentState::Completed | AgentState::Failed
        )
    }

    /// `true` while a command is being planned or executed.
    pub fn is_active(&self) -> bool {
        matches!(self, AgentState::Planning | AgentState::Executing)
    }

    /// `true` for the two states that are auto-advanced to `Idle`.
    pub fn awaits_cleanup(&self) -> bool {
        matches!(self, AgentState::Completed | AgentState::Failed)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plans
// ─────────────────────────────────────────────────────────────────────────────

/// One step of a [`Plan`]: an action name plus its parameter map.
///
/// The name is resolved against the action registry; parameters are passed
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionSpec {
    /// Registry key of the action, e.g. `"move_to"` or `"mine"`.
    pub action: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl ActionSpec {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Builder-style parameter insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(serde_json::Value::as_f64)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(serde_json::Value::as_u64)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(serde_json::Value::as_str)
    }

    /// Booleans are accepted either as JSON booleans or as `"true"`/`"false"`.
    pub fn param_bool(&self, key: &str) -> Option<bool> {
        match self.parameters.get(key)? {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// An ordered, finite list of actions produced by the reasoning service.
///
/// Immutable once received; the executor copies the actions into the agent's
/// queue.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    /// Short human-readable summary of what the plan achieves.
    #[serde(default)]
    pub goal: Option<String>,
    pub actions: Vec<ActionSpec>,
}

impl Plan {
    pub fn new(actions: Vec<ActionSpec>) -> Self {
        Self { goal: None, actions }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stall taxonomy
// ─────────────────────────────────────────────────────────────────────────────

/// The axis along which an agent has stopped making progress.
///
/// These are signals consumed by the recovery policy, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StallKind {
    /// The agent has not moved the minimum distance for too long.
    PositionStuck,
    /// The current action's progress has not increased for too long.
    ProgressStuck,
    /// The declared lifecycle state has not changed for too long.
    StateStuck,
    /// The pathfinder reported the target as unreachable.
    PathStuck,
    /// A required resource or prerequisite is missing.
    ResourceStuck,
}

impl StallKind {
    /// Upper-case label used in abort reasons (`"STATE_STUCK: unrecoverable"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            StallKind::PositionStuck => "POSITION_STUCK",
            StallKind::ProgressStuck => "PROGRESS_STUCK",
            StallKind::StateStuck => "STATE_STUCK",
            StallKind::PathStuck => "PATH_STUCK",
            StallKind::ResourceStuck => "RESOURCE_STUCK",
        }
    }

    /// Key under which detections are counted in the detection history.
    pub fn history_key(&self) -> &'static str {
        match self {
            StallKind::PositionStuck => "position",
            StallKind::ProgressStuck => "progress",
            StallKind::StateStuck => "state",
            StallKind::PathStuck => "path",
            StallKind::ResourceStuck => "resource",
        }
    }
}

impl fmt::Display for StallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle events
// ─────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the lifecycle event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "foreman-kernel::state_machine"
    pub source: String,
    pub payload: LifecycleEvent,
}

impl Event {
    /// Stamp `payload` with a fresh id and the current wall-clock time.
    pub fn new(source: impl Into<String>, payload: LifecycleEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        self.payload.agent_id()
    }
}

/// Immutable record of something that changed in an agent's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StateTransition {
        agent_id: AgentId,
        from: AgentState,
        to: AgentState,
        reason: String,
        /// `true` when the edge check was bypassed.
        forced: bool,
    },
    ActionStarted {
        agent_id: AgentId,
        action: String,
        parameters: BTreeMap<String, serde_json::Value>,
        total_steps: u32,
    },
    ActionCompleted {
        agent_id: AgentId,
        action: String,
        success: bool,
        message: String,
        duration_ticks: u64,
        duration_ms: u64,
    },
}

impl LifecycleEvent {
    pub fn agent_id(&self) -> &AgentId {
        match self {
            LifecycleEvent::StateTransition { agent_id, .. }
            | LifecycleEvent::ActionStarted { agent_id, .. }
            | LifecycleEvent::ActionCompleted { agent_id, .. } => agent_id,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// How an in-flight plan request ended without producing a plan.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanningError {
    #[error("planning timeout")]
    Timeout,
    #[error("planning cancelled")]
    Cancelled,
    #[error("planning failed: {0}")]
    Failed(String),
}

impl PlanningError {
    /// Reason string attached to the forced `Idle` transition.
    pub fn transition_reason(&self) -> &'static str {
        match self {
            PlanningError::Timeout => "planning timeout",
            PlanningError::Cancelled => "planning cancelled",
            PlanningError::Failed(_) => "planning failed",
        }
    }
}

/// Error raised by a single action while it is being ticked.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionError {
    /// Transient problem; the executor ticks the action again.
    #[error("recoverable action error: {0}")]
    Recoverable(String),
    /// The action cannot finish; the command fails.
    #[error("unrecoverable action error: {0}")]
    Unrecoverable(String),
    /// A prerequisite item or block is missing.
    #[error("missing resource: {0}")]
    ResourceUnavailable(String),
    #[error("invalid parameters for '{action}': {details}")]
    InvalidParameters { action: String, details: String },
}

/// Workspace-wide error type spanning command submission, planning, state
/// transitions, and action execution.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ForemanError {
    #[error("already planning")]
    AlreadyPlanning,

    #[error("planning timeout")]
    PlanningTimeout,

    #[error("planning cancelled")]
    PlanningCancelled,

    #[error("planning failed: {0}")]
    PlanningFailed(String),

    #[error("planner pool saturated; try again later")]
    PlannerSaturated,

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: AgentState, to: AgentState },

    #[error("action '{action}' failed: {details}")]
    ActionExecution {
        action: String,
        details: String,
        recoverable: bool,
    },

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("agent already exists: {0}")]
    AgentExists(AgentId),

    #[error("control channel closed: {0}")]
    ChannelClosed(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<PlanningError> for ForemanError {
    fn from(err: PlanningError) -> Self {
        match err {
            PlanningError::Timeout => ForemanError::PlanningTimeout,
            PlanningError::Cancelled => ForemanError::PlanningCancelled,
            PlanningError::Failed(reason) => ForemanError::PlanningFailed(reason),
        }
    }
}

impl From<serde_json::Error> for ForemanError {
    fn from(err: serde_json::Error) -> Self {
        ForemanError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_become_serialization_errors() {
        let err: ForemanError = serde_json::from_str::<Plan>("{not json")
            .map_err(ForemanError::from)
            .unwrap_err();
        assert!(matches!(err, ForemanError::Serialization(_)));
        assert!(err.to_string().starts_with("serialization error: "));
    }

    #[test]
    fn plan_roundtrip_keeps_parameters() {
        let plan = Plan {
            goal: Some("dig a hole".to_string()),
            actions: vec![
                ActionSpec::new("move_to").with("x", 4.0).with("z", -2.0),
                ActionSpec::new("mine").with("steps", 20),
            ],
        };
        let json = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(plan, back);
    }

    #[test]
    fn plan_parameters_default_to_empty() {
        let plan: Plan = serde_json::from_str(r#"{"actions":[{"action":"wait"}]}"#).unwrap();
        assert_eq!(plan.actions.len(), 1);
        assert!(plan.actions[0].parameters.is_empty());
        assert!(plan.goal.is_none());
    }

    #[test]
    fn action_spec_typed_parameter_access() {
        let spec = ActionSpec::new("build")
            .with("steps", 12)
            .with("block", "oak_planks")
            .with("fail", "true")
            .with("x", 1.5);
        assert_eq!(spec.param_u64("steps"), Some(12));
        assert_eq!(spec.param_str("block"), Some("oak_planks"));
        assert_eq!(spec.param_bool("fail"), Some(true));
        assert_eq!(spec.param_f64("x"), Some(1.5));
        assert_eq!(spec.param_f64("missing"), None);
    }

    #[test]
    fn position_step_toward_never_overshoots() {
        let origin = Position::new(0.0, 0.0, 0.0);
        let target = Position::new(3.0, 0.0, 4.0);
        let step = origin.step_toward(&target, 1.0);
        assert!((origin.distance_to(&step) - 1.0).abs() < 1e-9);
        assert_eq!(origin.step_toward(&target, 10.0), target);
    }

    #[test]
    fn agent_state_predicates() {
        assert!(AgentState::Idle.can_accept_commands());
        assert!(!AgentState::Executing.can_accept_commands());
        assert!(AgentState::Planning.is_active());
        assert!(AgentState::Failed.awaits_cleanup());
        assert_eq!(AgentState::Paused.to_string(), "PAUSED");
    }

    #[test]
    fn state_serializes_screaming_case() {
        let json = serde_json::to_string(&AgentState::Executing).unwrap();
        assert_eq!(json, "\"EXECUTING\"");
    }

    #[test]
    fn lifecycle_event_roundtrip() {
        let event = Event::new(
            "foreman-kernel::state_machine",
            LifecycleEvent::StateTransition {
                agent_id: AgentId::new("steve"),
                from: AgentState::Idle,
                to: AgentState::Planning,
                reason: "command received".to_string(),
                forced: false,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, back.id);
        assert_eq!(back.agent_id().as_str(), "steve");
    }

    #[test]
    fn planning_error_maps_to_transition_reason() {
        assert_eq!(PlanningError::Timeout.transition_reason(), "planning timeout");
        assert_eq!(
            PlanningError::Failed("bad json".into()).transition_reason(),
            "planning failed"
        );
        assert_eq!(
            ForemanError::from(PlanningError::Cancelled),
            ForemanError::PlanningCancelled
        );
    }

    #[test]
    fn foreman_error_display() {
        let err = ForemanError::InvalidTransition {
            from: AgentState::Idle,
            to: AgentState::Completed,
        };
        assert_eq!(err.to_string(), "invalid transition IDLE -> COMPLETED");
        assert_eq!(ForemanError::AlreadyPlanning.to_string(), "already planning");
    }
}
