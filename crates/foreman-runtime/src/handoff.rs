//! Single-slot, exactly-once plan handoff between a planner task and the
//! tick loop.
//!
//! [`plan_handoff`] returns a [`PlanSlot`] (written once by whoever runs the
//! reasoning service) and a [`PlanHandle`] (polled by the executor at the
//! start of each tick). The handle never blocks.
//!
//! | Handle poll result | Meaning |
//! |---|---|
//! | `Pending` | Nothing written yet |
//! | `Ready(Ok(plan))` | The planner succeeded |
//! | `Ready(Err(e))` | The planner failed, timed out or was cancelled |
//! | `Ready(Err(Cancelled))` | The slot was dropped without a write |
//!
//! Dropping or cancelling the handle trips the shared
//! [`CancellationToken`], which the planner task observes.

use foreman_types::{Plan, PlanningError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Result of a non-blocking poll of a [`PlanHandle`].
#[derive(Debug, PartialEq)]
pub enum PlanPoll {
    Pending,
    Ready(Result<Plan, PlanningError>),
}

/// Create a linked slot/handle pair. `budget_ticks` is carried by the handle
/// for the executor's timeout check.
pub fn plan_handoff(budget_ticks: u64) -> (PlanSlot, PlanHandle) {
    let (tx, rx) = oneshot::channel();
    let cancel = CancellationToken::new();
    (
        PlanSlot {
            tx,
            cancel: cancel.clone(),
        },
        PlanHandle {
            rx,
            cancel,
            budget_ticks,
        },
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer side
// ─────────────────────────────────────────────────────────────────────────────

/// Write end of the handoff. Consumed by [`PlanSlot::resolve`].
#[derive(Debug)]
pub struct PlanSlot {
    tx: oneshot::Sender<Result<Plan, PlanningError>>,
    cancel: CancellationToken,
}

impl PlanSlot {
    /// Deliver the planner's answer. Returns `false` when the handle is gone
    /// or has been cancelled, in which case the result is discarded.
    pub fn resolve(self, result: Result<Plan, PlanningError>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(result).is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token tripped when the reader cancels or drops its handle.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader side
// ─────────────────────────────────────────────────────────────────────────────

/// Read end of the handoff, owned by the executor while planning.
#[derive(Debug)]
pub struct PlanHandle {
    rx: oneshot::Receiver<Result<Plan, PlanningError>>,
    cancel: CancellationToken,
    budget_ticks: u64,
}

impl PlanHandle {
    /// Drain the slot without blocking.
    pub fn poll(&mut self) -> PlanPoll {
        match self.rx.try_recv() {
            Ok(result) => PlanPoll::Ready(result),
            Err(oneshot::error::TryRecvError::Empty) => PlanPoll::Pending,
            Err(oneshot::error::TryRecvError::Closed) => {
                PlanPoll::Ready(Err(PlanningError::Cancelled))
            }
        }
    }

    /// Tell the planner task to stop. Later writes are discarded.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn budget_ticks(&self) -> u64 {
        self.budget_ticks
    }
}

impl Drop for PlanHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_types::ActionSpec;

    #[test]
    fn pending_until_resolved() {
        let (slot, mut handle) = plan_handoff(60);
        assert_eq!(handle.poll(), PlanPoll::Pending);

        let plan = Plan::new(vec![ActionSpec::new("wait")]);
        assert!(slot.resolve(Ok(plan.clone())));
        assert_eq!(handle.poll(), PlanPoll::Ready(Ok(plan)));
        assert_eq!(handle.budget_ticks(), 60);
    }

    #[test]
    fn dropped_slot_reads_as_cancelled() {
        let (slot, mut handle) = plan_handoff(60);
        drop(slot);
        assert_eq!(handle.poll(), PlanPoll::Ready(Err(PlanningError::Cancelled)));
    }

    #[test]
    fn cancelled_handle_discards_late_result() {
        let (slot, mut handle) = plan_handoff(60);
        handle.cancel();
        assert!(slot.is_cancelled());
        assert!(!slot.resolve(Ok(Plan::default())));
        assert!(handle.is_cancelled());
    }

    #[test]
    fn dropping_handle_trips_token() {
        let (slot, handle) = plan_handoff(60);
        let token = slot.cancellation();
        drop(handle);
        assert!(token.is_cancelled());
        assert!(!slot.resolve(Err(PlanningError::Timeout)));
    }
}
