//! `foreman-runtime` – turns commands into executed action streams.
//!
//! # Modules
//!
//! - [`executor`] – [`ActionExecutor`]: one agent's command lifecycle,
//!   ticked by a control loop. Owns the state machine, stall detector and
//!   recovery policy.
//! - [`planner`] – the [`ReasoningService`] seam plus [`LlmPlanner`] (an
//!   OpenAI-compatible chat client for local models such as Ollama),
//!   [`ScriptPlanner`] (offline, parses `action key=value; …` commands) and
//!   [`StaticPlanner`] for tests.
//! - [`handoff`] – single-slot, exactly-once plan delivery between a planner
//!   task and the tick loop.
//! - [`pool`] – [`PlanDispatcher`] implementations: the bounded
//!   [`PlannerPool`] and the caller-driven [`ManualDispatcher`].
//! - [`recovery`] – [`RecoveryPolicy`]: stall kind to remedy chains with
//!   per-command escalation budgets.
//! - [`crew`] – [`Crew`]: shared wiring for spawning executors.
//! - [`control_loop`] – [`ControlLoop`] and the sharded [`CrewRuntime`].
//! - [`telemetry`] – [`init_tracing`]: subscriber setup with optional OTLP
//!   export.

pub mod control_loop;
pub mod crew;
pub mod executor;
pub mod handoff;
pub mod planner;
pub mod pool;
pub mod recovery;
pub mod telemetry;

pub use control_loop::{ControlLoop, ControlMessage, CrewRuntime};
pub use crew::Crew;
pub use executor::{ActionExecutor, AgentStatus, ExecutorConfig};
pub use handoff::{PlanHandle, PlanPoll, PlanSlot, plan_handoff};
pub use planner::{LlmError, LlmPlanner, ReasoningService, ScriptPlanner, StaticPlanner};
pub use pool::{ManualDispatcher, PlanDispatcher, PlanRequest, PlannerPool};
pub use recovery::{RecoveryLimits, RecoveryOutcome, RecoveryPolicy, RecoveryStats, Remedy};
pub use telemetry::{LogFormat, TelemetryConfig, TracerProviderGuard, init_tracing};
