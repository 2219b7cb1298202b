//! [`RecoveryPolicy`] – maps a detected stall to remedies and applies them.
//!
//! # Remedy chains
//!
//! | Stall | Chain (tried left to right while budget remains) |
//! |---|---|
//! | `POSITION_STUCK`, `PATH_STUCK` | reposition → replan → abort |
//! | `PROGRESS_STUCK` | replan → abort |
//! | `STATE_STUCK`, `RESOURCE_STUCK` | abort |
//!
//! Reposition and replan are budgeted per command ([`RecoveryLimits`]); a
//! remedy whose budget is spent is skipped, which is how repeated failures
//! escalate. Abort has no budget and always ends the chain. Every successful
//! remedy resets the agent's stall record.
//!
//! # Example
//!
//! ```rust
//! use foreman_runtime::recovery::{RecoveryLimits, RecoveryPolicy, Remedy};
//! use foreman_types::StallKind;
//!
//! let policy = RecoveryPolicy::new(RecoveryLimits::default());
//! assert_eq!(policy.select(StallKind::PathStuck), Remedy::Reposition);
//! assert_eq!(policy.select(StallKind::StateStuck), Remedy::Abort);
//! ```

use foreman_types::StallKind;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

/// A corrective action the policy can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Remedy {
    /// Small corrective displacement plus a fresh path request.
    Reposition,
    /// Re-enter planning with the original command.
    Replan,
    /// Give up: clear the queue and fail the command.
    Abort,
}

/// Per-command escalation budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryLimits {
    pub max_repositions: u32,
    pub max_replans: u32,
}

impl Default for RecoveryLimits {
    fn default() -> Self {
        Self {
            max_repositions: 3,
            max_replans: 1,
        }
    }
}

/// What [`RecoveryPolicy::apply`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered(Remedy),
    Aborted,
}

/// Cumulative counters across every command of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub attempts: u32,
    pub successes: u32,
    pub repositions: u32,
    pub replans: u32,
    pub aborts: u32,
}

impl RecoveryStats {
    /// Fraction of attempts that recovered, `0.0` before any attempt.
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            f64::from(self.successes) / f64::from(self.attempts)
        }
    }
}

/// The agent-side operations a remedy needs.
///
/// Implemented by the executor; `reposition` and `replan` report whether the
/// remedy took effect.
pub trait RecoveryTarget {
    fn reposition(&mut self, kind: StallKind) -> bool;
    fn replan(&mut self, kind: StallKind) -> bool;
    fn abort(&mut self, kind: StallKind);
    fn reset_stall_record(&mut self);
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Stateful stall-to-remedy mapper for one agent.
#[derive(Debug, Clone, Default)]
pub struct RecoveryPolicy {
    limits: RecoveryLimits,
    repositions_used: u32,
    replans_used: u32,
    stats: RecoveryStats,
}

impl RecoveryPolicy {
    pub fn new(limits: RecoveryLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Full remedy chain for `kind`, ignoring budgets.
    pub fn remedies_for(kind: StallKind) -> &'static [Remedy] {
        match kind {
            StallKind::PositionStuck | StallKind::PathStuck => {
                &[Remedy::Reposition, Remedy::Replan, Remedy::Abort]
            }
            StallKind::ProgressStuck => &[Remedy::Replan, Remedy::Abort],
            StallKind::StateStuck | StallKind::ResourceStuck => &[Remedy::Abort],
        }
    }

    /// The first remedy in the chain that still has budget.
    pub fn select(&self, kind: StallKind) -> Remedy {
        Self::remedies_for(kind)
            .iter()
            .copied()
            .find(|remedy| self.has_budget(*remedy))
            .unwrap_or(Remedy::Abort)
    }

    /// Walk the chain for `kind` against `target` until a remedy succeeds or
    /// the chain ends in abort.
    pub fn apply(&mut self, kind: StallKind, target: &mut dyn RecoveryTarget) -> RecoveryOutcome {
        for &remedy in Self::remedies_for(kind) {
            if !self.has_budget(remedy) {
                continue;
            }
            self.stats.attempts += 1;

            let recovered = match remedy {
                Remedy::Reposition => {
                    self.repositions_used += 1;
                    self.stats.repositions += 1;
                    target.reposition(kind)
                }
                Remedy::Replan => {
                    self.replans_used += 1;
                    self.stats.replans += 1;
                    target.replan(kind)
                }
                Remedy::Abort => {
                    self.stats.aborts += 1;
                    warn!(kind = %kind, "recovery exhausted; aborting");
                    target.abort(kind);
                    return RecoveryOutcome::Aborted;
                }
            };

            if recovered {
                self.stats.successes += 1;
                target.reset_stall_record();
                info!(kind = %kind, remedy = ?remedy, "stall recovered");
                return RecoveryOutcome::Recovered(remedy);
            }
            warn!(kind = %kind, remedy = ?remedy, "remedy failed; escalating");
        }
        // Every chain ends in Abort, which returns above.
        RecoveryOutcome::Aborted
    }

    /// Restore the per-command budgets. Statistics are kept.
    pub fn reset_escalation(&mut self) {
        self.repositions_used = 0;
        self.replans_used = 0;
    }

    pub fn stats(&self) -> &RecoveryStats {
        &self.stats
    }

    pub fn limits(&self) -> &RecoveryLimits {
        &self.limits
    }

    fn has_budget(&self, remedy: Remedy) -> bool {
        match remedy {
            Remedy::Reposition => self.repositions_used < self.limits.max_repositions,
            Remedy::Replan => self.replans_used < self.limits.max_replans,
            Remedy::Abort => true,
        }
    }
}
