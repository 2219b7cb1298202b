//! [`StallDetector`] – multi-axis "is this agent still making progress?"
//! monitor.
//!
//! The executor calls [`StallDetector::sample`] once per tick with the
//! agent's current [`StallSignals`]. Three counters advance independently:
//!
//! | Axis | Counter increments when | Counter resets when |
//! |---|---|---|
//! | position | displacement since the last rebase `< min_movement` | the agent moved at least `min_movement` |
//! | progress | action progress did not strictly increase | progress increased |
//! | state | declared state equals the previous sample | declared state differs |
//!
//! A fourth, sticky signal – the path-stuck flag – is only changed through
//! [`StallDetector::mark_path_stuck`] and [`StallDetector::clear_path_stuck`].
//!
//! [`StallDetector::detect_stuck`] classifies in strict priority order
//! `PATH_STUCK → POSITION_STUCK → PROGRESS_STUCK → STATE_STUCK`; the first
//! match wins and is counted in the detection history.
//!
//! # Example
//!
//! ```
//! use foreman_kernel::stall_detector::{StallDetector, StallSignals, StallThresholds};
//! use foreman_types::{AgentId, AgentState, Position, StallKind};
//!
//! let signals = StallSignals::new(Position::default(), 0, AgentState::Executing);
//! let mut detector = StallDetector::new(AgentId::new("steve"), StallThresholds::default(), &signals);
//! for _ in 0..65 {
//!     detector.sample(&signals);
//! }
//! assert!(detector.is_position_stuck(60));
//! assert_eq!(detector.detect_stuck(), Some(StallKind::PositionStuck));
//! ```

use std::collections::BTreeMap;

use foreman_types::{AgentId, AgentState, Position, StallKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ────────────────────────────────────────────────────────────────────────────
// Configuration & inputs
// ────────────────────────────────────────────────────────────────────────────

/// Tick thresholds at which each axis is reported as stuck.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StallThresholds {
    pub position_ticks: u32,
    pub progress_ticks: u32,
    pub state_ticks: u32,
    /// Minimum displacement (blocks) that counts as movement.
    pub min_movement: f64,
}

impl Default for StallThresholds {
    fn default() -> Self {
        Self {
            position_ticks: 60,
            progress_ticks: 100,
            state_ticks: 200,
            min_movement: 0.5,
        }
    }
}

/// Per-tick observation of one agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StallSignals {
    pub position: Position,
    /// Progress of the current action, in steps.
    pub progress: u64,
    pub state: AgentState,
    /// `false` while the current action is stationary; the position axis is
    /// then held at zero.
    pub track_position: bool,
}

impl StallSignals {
    pub fn new(position: Position, progress: u64, state: AgentState) -> Self {
        Self {
            position,
            progress,
            state,
            track_position: true,
        }
    }

    pub fn stationary(mut self) -> Self {
        self.track_position = false;
        self
    }
}

/// Snapshot of the detector's counters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StallRecord {
    pub position_ticks: u32,
    pub progress_ticks: u32,
    pub state_ticks: u32,
    pub path_stuck: bool,
    /// Cumulative detections keyed by axis (`"position"`, `"path"`, …).
    pub history: BTreeMap<String, u32>,
}

// ────────────────────────────────────────────────────────────────────────────
// Detector
// ────────────────────────────────────────────────────────────────────────────

/// Stall classifier for a single agent. Driven only by the agent's owning
/// control loop.
#[derive(Debug, Clone)]
pub struct StallDetector {
    agent_id: AgentId,
    thresholds: StallThresholds,
    record: StallRecord,
    last_position: Position,
    last_progress: u64,
    last_state: AgentState,
}

impl StallDetector {
    /// Build a detector whose reference samples are `current`.
    pub fn new(agent_id: AgentId, thresholds: StallThresholds, current: &StallSignals) -> Self {
        Self {
            agent_id,
            thresholds,
            record: StallRecord::default(),
            last_position: current.position,
            last_progress: current.progress,
            last_state: current.state,
        }
    }

    pub fn thresholds(&self) -> &StallThresholds {
        &self.thresholds
    }

    /// Advance every counter by one tick's worth of observation.
    pub fn sample(&mut self, signals: &StallSignals) {
        let record = &mut self.record;

        if !signals.track_position
            || self.last_position.distance_to(&signals.position) >= self.thresholds.min_movement
        {
            record.position_ticks = 0;
            self.last_position = signals.position;
        } else {
            record.position_ticks = record.position_ticks.saturating_add(1);
        }

        if signals.progress > self.last_progress {
            record.progress_ticks = 0;
        } else {
            record.progress_ticks = record.progress_ticks.saturating_add(1);
        }
        self.last_progress = signals.progress;

        if signals.state == self.last_state {
            record.state_ticks = record.state_ticks.saturating_add(1);
        } else {
            record.state_ticks = 0;
            self.last_state = signals.state;
        }
    }

    /// Classify the current counters. The first matching axis in priority
    /// order is returned and counted in the history.
    pub fn detect_stuck(&mut self) -> Option<StallKind> {
        let kind = if self.record.path_stuck {
            StallKind::PathStuck
        } else if self.is_position_stuck(self.thresholds.position_ticks) {
            StallKind::PositionStuck
        } else if self.is_progress_stuck(self.thresholds.progress_ticks) {
            StallKind::ProgressStuck
        } else if self.record.state_ticks >= self.thresholds.state_ticks {
            StallKind::StateStuck
        } else {
            return None;
        };

        self.note_detection(kind);
        warn!(
            agent = %self.agent_id,
            kind = %kind,
            position_ticks = self.record.position_ticks,
            progress_ticks = self.record.progress_ticks,
            state_ticks = self.record.state_ticks,
            "stall detected"
        );
        Some(kind)
    }

    /// Count a stall reported from outside the sampling axes (e.g. a missing
    /// resource).
    pub fn note_detection(&mut self, kind: StallKind) {
        *self
            .record
            .history
            .entry(kind.history_key().to_string())
            .or_insert(0) += 1;
    }

    pub fn is_position_stuck(&self, ticks: u32) -> bool {
        self.record.position_ticks >= ticks
    }

    pub fn is_progress_stuck(&self, ticks: u32) -> bool {
        self.record.progress_ticks >= ticks
    }

    /// `true` when the agent has sat in `state` for at least `ticks` samples.
    pub fn is_state_stuck(&self, state: AgentState, ticks: u32) -> bool {
        self.last_state == state && self.record.state_ticks >= ticks
    }

    pub fn mark_path_stuck(&mut self) {
        if !self.record.path_stuck {
            debug!(agent = %self.agent_id, "path marked stuck");
        }
        self.record.path_stuck = true;
    }

    pub fn clear_path_stuck(&mut self) {
        self.record.path_stuck = false;
    }

    pub fn is_path_stuck(&self) -> bool {
        self.record.path_stuck
    }

    /// Zero every counter, clear the path flag and history, and rebase the
    /// reference samples onto `current`.
    pub fn reset(&mut self, current: &StallSignals) {
        self.record = StallRecord::default();
        self.last_position = current.position;
        self.last_progress = current.progress;
        self.last_state = current.state;
        debug!(agent = %self.agent_id, "stall detector reset");
    }

    pub fn record(&self) -> &StallRecord {
        &self.record
    }

    pub fn detections(&self, kind: StallKind) -> u32 {
        self.record
            .history
            .get(kind.history_key())
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executing_at(x: f64) -> StallSignals {
        StallSignals::new(Position::new(x, 64.0, 0.0), 0, AgentState::Executing)
    }

    fn detector(initial: &StallSignals) -> StallDetector {
        StallDetector::new(AgentId::new("steve"), StallThresholds::default(), initial)
    }

    #[test]
    fn stationary_agent_is_position_stuck() {
        let signals = executing_at(0.0);
        let mut det = detector(&signals);
        for _ in 0..65 {
            det.sample(&signals);
        }
        assert!(det.is_position_stuck(60));
        assert_eq!(det.detect_stuck(), Some(StallKind::PositionStuck));
        assert_eq!(det.detections(StallKind::PositionStuck), 1);
    }

    #[test]
    fn frozen_progress_while_moving_is_progress_stuck() {
        let mut det = detector(&executing_at(0.0));
        for tick in 1..=105 {
            det.sample(&executing_at(tick as f64));
        }
        assert_eq!(det.record().position_ticks, 0);
        assert!(det.is_progress_stuck(100));
        assert_eq!(det.detect_stuck(), Some(StallKind::ProgressStuck));
    }

    #[test]
    fn path_flag_outranks_position() {
        let signals = executing_at(0.0);
        let mut det = detector(&signals);
        det.mark_path_stuck();
        for _ in 0..65 {
            det.sample(&signals);
        }
        assert!(det.is_position_stuck(60));
        assert_eq!(det.detect_stuck(), Some(StallKind::PathStuck));
        assert_eq!(det.record().history.get("path"), Some(&1));
        assert_eq!(det.record().history.get("position"), None);
    }

    #[test]
    fn path_flag_is_sticky_until_cleared() {
        let mut det = detector(&executing_at(0.0));
        det.mark_path_stuck();
        for tick in 1..=10 {
            det.sample(&executing_at(tick as f64));
        }
        assert!(det.is_path_stuck());
        det.clear_path_stuck();
        assert_eq!(det.detect_stuck(), None);
    }

    #[test]
    fn idle_state_counter_resets_on_change() {
        let idle = StallSignals::new(Position::default(), 0, AgentState::Idle).stationary();
        let mut det = detector(&idle);
        for _ in 0..200 {
            det.sample(&idle);
        }
        assert!(det.is_state_stuck(AgentState::Idle, 200));
        assert!(!det.is_state_stuck(AgentState::Planning, 200));

        det.sample(&StallSignals {
            state: AgentState::Planning,
            ..idle
        });
        assert_eq!(det.record().state_ticks, 0);
        assert!(!det.is_state_stuck(AgentState::Idle, 1));
    }

    #[test]
    fn state_stuck_has_lowest_priority() {
        let thresholds = StallThresholds {
            state_ticks: 5,
            ..StallThresholds::default()
        };
        let mut det = StallDetector::new(AgentId::new("steve"), thresholds, &executing_at(0.0));
        for tick in 1..=6 {
            det.sample(&StallSignals {
                progress: tick,
                ..executing_at(tick as f64)
            });
        }
        assert_eq!(det.detect_stuck(), Some(StallKind::StateStuck));
    }

    #[test]
    fn slow_creep_accumulates_until_threshold_distance() {
        let mut det = detector(&executing_at(0.0));
        // 0.2 blocks per tick: the rebase point only moves once 0.5 is covered.
        det.sample(&executing_at(0.2));
        det.sample(&executing_at(0.4));
        assert_eq!(det.record().position_ticks, 2);
        det.sample(&executing_at(0.6));
        assert_eq!(det.record().position_ticks, 0);
    }

    #[test]
    fn stationary_actions_disarm_position_axis() {
        let signals = executing_at(0.0).stationary();
        let mut det = detector(&signals);
        for step in 1..=80 {
            det.sample(&StallSignals {
                progress: step,
                ..signals
            });
        }
        assert_eq!(det.record().position_ticks, 0);
        assert_eq!(det.detect_stuck(), None);
    }

    #[test]
    fn reset_twice_yields_identical_zeroed_record() {
        let signals = executing_at(0.0);
        let mut det = detector(&signals);
        det.mark_path_stuck();
        for _ in 0..70 {
            det.sample(&signals);
        }
        det.detect_stuck();

        det.reset(&signals);
        let first = det.record().clone();
        det.reset(&signals);
        assert_eq!(&first, det.record());
        assert_eq!(first, StallRecord::default());
        assert!(first.history.is_empty());
    }

    #[test]
    fn reset_rebases_samples() {
        let mut det = detector(&executing_at(0.0));
        det.reset(&executing_at(10.0));
        det.sample(&executing_at(10.0));
        assert_eq!(det.record().position_ticks, 1);
    }

    #[test]
    fn record_serializes_for_status_output() -> Result<(), Box<dyn std::error::Error>> {
        let mut det = detector(&executing_at(0.0));
        det.note_detection(StallKind::ResourceStuck);
        let json = serde_json::to_value(det.record())?;
        assert_eq!(json["history"]["resource"], 1);
        Ok(())
    }
}
