//! In-process simulated actions for demos and tests.
//!
//! [`SimRegistry`] builds an [`ActionRegistry`] pre-populated with simple
//! block-world actions. Each one can be told, through plan parameters, to
//! misbehave in a specific way so that every stall and failure path of the
//! executor can be driven without a real game server.
//!
//! | Action | Parameters | Fault injection |
//! |---|---|---|
//! | `move_to` | `x`, `y`, `z`, `speed` | `blocked` (bool or path attempts), `stuck` |
//! | `wait` | `ticks` | – |
//! | `mine`, `place`, `build` | `steps`, `block` | `fail_at`, `missing`, `flaky`, `stall` |
//!
//! # Example
//!
//! ```rust
//! use foreman_actions::sim::SimRegistry;
//! use foreman_types::ActionSpec;
//!
//! let registry = SimRegistry::new()
//!     .with_movement()
//!     .with_labor()
//!     .build();
//!
//! let action = registry
//!     .create(&ActionSpec::new("mine").with("steps", 5))
//!     .expect("sim mine must build");
//! assert_eq!(action.total_steps(), 5);
//! ```

use foreman_types::{ActionError, ActionSpec, Position};
use tracing::debug;

use crate::action::{Action, ActionContext};
use crate::registry::ActionRegistry;

const DEFAULT_SPEED: f64 = 0.25;
const ARRIVAL_EPSILON: f64 = 1e-6;

// ────────────────────────────────────────────────────────────────────────────
// move_to
// ────────────────────────────────────────────────────────────────────────────

/// Walks toward a target at a fixed speed (blocks per tick).
pub struct MoveTo {
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    target: Position,
    speed: f64,
    /// Remaining path requests that will fail; `u32::MAX` never clears.
    blocked_attempts: u32,
    stuck: bool,
    steps_taken: u32,
    total: u32,
    path_announced: bool,
    done: bool,
}

impl MoveTo {
    pub fn from_spec(spec: &ActionSpec) -> Result<Box<dyn Action>, ActionError> {
        let speed = spec.param_f64("speed").unwrap_or(DEFAULT_SPEED);
        if speed <= 0.0 {
            return Err(ActionError::InvalidParameters {
                action: spec.action.clone(),
                details: format!("speed must be positive, got {speed}"),
            });
        }
        let blocked_attempts = match spec.param_bool("blocked") {
            Some(true) => u32::MAX,
            Some(false) => 0,
            None => spec
                .param_u64("blocked")
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                .unwrap_or(0),
        };
        Ok(Box::new(Self {
            x: spec.param_f64("x"),
            y: spec.param_f64("y"),
            z: spec.param_f64("z"),
            target: Position::default(),
            speed,
            blocked_attempts,
            stuck: spec.param_bool("stuck").unwrap_or(false),
            steps_taken: 0,
            total: 0,
            path_announced: false,
            done: false,
        }))
    }
}

impl Action for MoveTo {
    fn name(&self) -> &str {
        "move_to"
    }

    fn start(&mut self, ctx: &mut ActionContext<'_>) {
        let origin = *ctx.position;
        self.target = Position::new(
            self.x.unwrap_or(origin.x),
            self.y.unwrap_or(origin.y),
            self.z.unwrap_or(origin.z),
        );
        let distance = origin.distance_to(&self.target);
        self.total = (distance / self.speed).ceil() as u32;
        self.done = distance < ARRIVAL_EPSILON;
        debug!(agent = %ctx.agent_id, target = %self.target, steps = self.total, "move_to started");
    }

    fn tick(&mut self, ctx: &mut ActionContext<'_>) -> Result<u32, ActionError> {
        if self.done {
            return Ok(0);
        }
        if self.blocked_attempts > 0 {
            ctx.report_path_blocked();
            return Ok(0);
        }
        if !self.path_announced {
            ctx.report_path_found();
            self.path_announced = true;
        }
        if self.stuck {
            return Ok(0);
        }

        let next = ctx.position.step_toward(&self.target, self.speed);
        *ctx.position = next;

        if next.distance_to(&self.target) < ARRIVAL_EPSILON {
            let gained = self.total - self.steps_taken;
            self.steps_taken = self.total;
            self.done = true;
            Ok(gained)
        } else {
            let before = self.steps_taken;
            // Repositioning can lengthen the walk; progress stays capped.
            self.steps_taken = (self.steps_taken + 1).min(self.total.saturating_sub(1));
            Ok(self.steps_taken - before)
        }
    }

    fn progress(&self) -> u32 {
        self.steps_taken
    }

    fn total_steps(&self) -> u32 {
        self.total
    }

    fn is_complete(&self) -> bool {
        self.done
    }

    fn did_succeed(&self) -> bool {
        self.done
    }

    fn outcome(&self) -> String {
        if self.done {
            format!("arrived at {}", self.target)
        } else {
            format!("stopped short of {}", self.target)
        }
    }

    fn expects_movement(&self) -> bool {
        true
    }

    fn reissue_path(&mut self) -> bool {
        if self.blocked_attempts != u32::MAX && self.blocked_attempts > 0 {
            self.blocked_attempts -= 1;
        }
        self.path_announced = false;
        self.blocked_attempts == 0
    }
}

// ────────────────────────────────────────────────────────────────────────────
// wait
// ────────────────────────────────────────────────────────────────────────────

/// Idles in place for a number of ticks.
pub struct Wait {
    ticks: u32,
    elapsed: u32,
}

impl Wait {
    pub fn from_spec(spec: &ActionSpec) -> Result<Box<dyn Action>, ActionError> {
        let ticks = spec
            .param_u64("ticks")
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(20);
        Ok(Box::new(Self { ticks, elapsed: 0 }))
    }
}

impl Action for Wait {
    fn name(&self) -> &str {
        "wait"
    }

    fn tick(&mut self, _ctx: &mut ActionContext<'_>) -> Result<u32, ActionError> {
        if self.elapsed >= self.ticks {
            return Ok(0);
        }
        self.elapsed += 1;
        Ok(1)
    }

    fn progress(&self) -> u32 {
        self.elapsed
    }

    fn total_steps(&self) -> u32 {
        self.ticks
    }

    fn is_complete(&self) -> bool {
        self.elapsed >= self.ticks
    }

    fn did_succeed(&self) -> bool {
        self.is_complete()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// mine / place / build
// ────────────────────────────────────────────────────────────────────────────

/// Stationary labour: one step of work per tick.
pub struct Work {
    name: String,
    block: String,
    steps: u32,
    progress: u32,
    fail_at: Option<u32>,
    missing: Option<String>,
    flaky: u32,
    stall: bool,
    done: bool,
    succeeded: bool,
}

impl Work {
    fn from_spec(spec: &ActionSpec, default_steps: u32) -> Result<Box<dyn Action>, ActionError> {
        let steps = spec.param_u64("steps").unwrap_or(u64::from(default_steps));
        if steps == 0 {
            return Err(ActionError::InvalidParameters {
                action: spec.action.clone(),
                details: "steps must be at least 1".to_string(),
            });
        }
        let as_u32 = |n: u64| u32::try_from(n).unwrap_or(u32::MAX);
        Ok(Box::new(Self {
            name: spec.action.clone(),
            block: spec.param_str("block").unwrap_or("stone").to_string(),
            steps: as_u32(steps),
            progress: 0,
            fail_at: spec.param_u64("fail_at").map(as_u32),
            missing: spec.param_str("missing").map(str::to_string),
            flaky: spec.param_u64("flaky").map(as_u32).unwrap_or(0),
            stall: spec.param_bool("stall").unwrap_or(false),
            done: false,
            succeeded: false,
        }))
    }

    pub fn mine(spec: &ActionSpec) -> Result<Box<dyn Action>, ActionError> {
        Self::from_spec(spec, 20)
    }

    pub fn place(spec: &ActionSpec) -> Result<Box<dyn Action>, ActionError> {
        Self::from_spec(spec, 5)
    }

    pub fn build(spec: &ActionSpec) -> Result<Box<dyn Action>, ActionError> {
        Self::from_spec(spec, 40)
    }
}

impl Action for Work {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, _ctx: &mut ActionContext<'_>) -> Result<u32, ActionError> {
        if self.done {
            return Ok(0);
        }
        if let Some(item) = &self.missing {
            return Err(ActionError::ResourceUnavailable(item.clone()));
        }
        if self.flaky > 0 {
            self.flaky -= 1;
            return Err(ActionError::Recoverable(format!(
                "{} slipped on {}",
                self.name, self.block
            )));
        }
        if self.stall {
            return Ok(0);
        }

        self.progress += 1;
        if self.fail_at == Some(self.progress) {
            self.done = true;
            return Err(ActionError::Unrecoverable(format!(
                "{} interrupted at step {}",
                self.name, self.progress
            )));
        }
        if self.progress >= self.steps {
            self.done = true;
            self.succeeded = true;
        }
        Ok(1)
    }

    fn progress(&self) -> u32 {
        self.progress
    }

    fn total_steps(&self) -> u32 {
        self.steps
    }

    fn is_complete(&self) -> bool {
        self.done
    }

    fn did_succeed(&self) -> bool {
        self.succeeded
    }

    fn outcome(&self) -> String {
        if self.succeeded {
            format!("{} {} x{}", self.name, self.block, self.steps)
        } else {
            format!("{} stopped after {}/{} steps", self.name, self.progress, self.steps)
        }
    }

    fn cancel(&mut self) {
        self.done = true;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Builder
// ────────────────────────────────────────────────────────────────────────────

/// Builder for an [`ActionRegistry`] populated with simulated actions.
#[derive(Default)]
pub struct SimRegistry {
    movement: bool,
    labor: bool,
}

impl SimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `move_to` and `wait`.
    pub fn with_movement(mut self) -> Self {
        self.movement = true;
        self
    }

    /// Register `mine`, `place` and `build`.
    pub fn with_labor(mut self) -> Self {
        self.labor = true;
        self
    }

    pub fn build(self) -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        if self.movement {
            registry.register("move_to", MoveTo::from_spec);
            registry.register("wait", Wait::from_spec);
        }
        if self.labor {
            registry.register("mine", Work::mine);
            registry.register("place", Work::place);
            registry.register("build", Work::build);
        }
        registry
    }
}
