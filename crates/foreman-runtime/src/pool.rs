//! Plan dispatch: the seam between the tick loop and the reasoning service.
//!
//! The executor hands a [`PlanRequest`] to a [`PlanDispatcher`] and gets a
//! [`PlanHandle`] back immediately. Two dispatchers ship with the crate:
//!
//! * [`PlannerPool`] – runs a [`ReasoningService`] on a Tokio runtime, gated
//!   by a semaphore. When every permit is taken the request is refused with
//!   [`ForemanError::PlannerSaturated`]; nothing queues unboundedly.
//! * [`ManualDispatcher`] – parks requests until the caller resolves them.
//!   Useful for embedding hosts that plan on their own schedule, and for
//!   tick-exact tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use foreman_types::{AgentId, ForemanError, Plan, PlanningError};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::handoff::{PlanHandle, PlanSlot, plan_handoff};
use crate::planner::ReasoningService;

/// Everything a reasoning service needs for one command.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanRequest {
    pub agent_id: AgentId,
    pub command: String,
    pub system_context: String,
    /// Tick budget the executor will enforce on the returned handle.
    pub budget_ticks: u64,
}

/// Accepts plan requests without blocking the caller.
pub trait PlanDispatcher: Send + Sync {
    /// # Errors
    ///
    /// [`ForemanError::PlannerSaturated`] when no capacity is left.
    fn dispatch(&self, request: PlanRequest) -> Result<PlanHandle, ForemanError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// PlannerPool
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded worker pool for reasoning-service calls.
pub struct PlannerPool {
    runtime: Handle,
    service: Arc<dyn ReasoningService>,
    permits: Arc<Semaphore>,
    workers: usize,
    wall_timeout: Duration,
}

impl PlannerPool {
    /// `workers` concurrent calls at most; each is abandoned after
    /// `wall_timeout` even if the tick budget has not yet run out.
    pub fn new(
        runtime: Handle,
        service: Arc<dyn ReasoningService>,
        workers: usize,
        wall_timeout: Duration,
    ) -> Self {
        let workers = workers.max(1);
        Self {
            runtime,
            service,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            wall_timeout,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Calls currently running.
    pub fn in_flight(&self) -> usize {
        self.workers - self.permits.available_permits()
    }
}

impl PlanDispatcher for PlannerPool {
    fn dispatch(&self, request: PlanRequest) -> Result<PlanHandle, ForemanError> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().map_err(|_| {
            warn!(agent = %request.agent_id, workers = self.workers, "planner pool saturated");
            ForemanError::PlannerSaturated
        })?;

        let (slot, handle) = plan_handoff(request.budget_ticks);
        let cancel = slot.cancellation();
        let service = Arc::clone(&self.service);
        let wall_timeout = self.wall_timeout;

        self.runtime.spawn(async move {
            let _permit = permit;
            let PlanRequest {
                agent_id,
                command,
                system_context,
                ..
            } = request;

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(PlanningError::Cancelled),
                outcome = tokio::time::timeout(wall_timeout, service.plan(&system_context, &command)) => {
                    outcome.unwrap_or(Err(PlanningError::Timeout))
                }
            };

            match &result {
                Ok(plan) => info!(agent = %agent_id, steps = plan.actions.len(), "plan produced"),
                Err(e) => warn!(agent = %agent_id, error = %e, "planning did not produce a plan"),
            }
            if !slot.resolve(result) {
                debug!(agent = %agent_id, "plan discarded; handle no longer waiting");
            }
        });

        Ok(handle)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ManualDispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Dispatcher whose requests stay parked until [`ManualDispatcher::resolve_next`]
/// or [`ManualDispatcher::resolve_for`] is called.
#[derive(Default)]
pub struct ManualDispatcher {
    parked: Mutex<VecDeque<(PlanRequest, PlanSlot)>>,
    capacity: Option<usize>,
}

impl ManualDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse requests once `capacity` are parked.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            parked: Mutex::default(),
            capacity: Some(capacity),
        }
    }

    fn parked(&self) -> std::sync::MutexGuard<'_, VecDeque<(PlanRequest, PlanSlot)>> {
        self.parked.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pending(&self) -> usize {
        self.parked().len()
    }

    /// Requests still waiting, oldest first.
    pub fn requests(&self) -> Vec<PlanRequest> {
        self.parked().iter().map(|(req, _)| req.clone()).collect()
    }

    /// Resolve the oldest parked request. Returns `false` when nothing was
    /// parked or the handle had already gone away.
    pub fn resolve_next(&self, result: Result<Plan, PlanningError>) -> bool {
        let next = self.parked().pop_front();
        match next {
            Some((_, slot)) => slot.resolve(result),
            None => false,
        }
    }

    /// Resolve the oldest parked request from `agent_id`.
    pub fn resolve_for(&self, agent_id: &AgentId, result: Result<Plan, PlanningError>) -> bool {
        let slot = {
            let mut parked = self.parked();
            let position = parked.iter().position(|(req, _)| &req.agent_id == agent_id);
            position.and_then(|i| parked.remove(i))
        };
        match slot {
            Some((_, slot)) => slot.resolve(result),
            None => false,
        }
    }
}

impl PlanDispatcher for ManualDispatcher {
    fn dispatch(&self, request: PlanRequest) -> Result<PlanHandle, ForemanError> {
        let mut parked = self.parked();
        // Slots whose handles were dropped no longer hold capacity.
        parked.retain(|(_, slot)| !slot.is_cancelled());
        if self.capacity.is_some_and(|cap| parked.len() >= cap) {
            return Err(ForemanError::PlannerSaturated);
        }
        let (slot, handle) = plan_handoff(request.budget_ticks);
        parked.push_back((request, slot));
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::PlanPoll;
    use crate::planner::StaticPlanner;
    use foreman_types::ActionSpec;

    fn request(agent: &str) -> PlanRequest {
        PlanRequest {
            agent_id: AgentId::new(agent),
            command: "dig".to_string(),
            system_context: String::new(),
            budget_ticks: 60,
        }
    }

    async fn wait_ready(handle: &mut PlanHandle) -> Result<Plan, PlanningError> {
        loop {
            if let PlanPoll::Ready(result) = handle.poll() {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn pool_resolves_handle() -> Result<(), Box<dyn std::error::Error>> {
        let plan = Plan::new(vec![ActionSpec::new("wait")]);
        let pool = PlannerPool::new(
            Handle::current(),
            Arc::new(StaticPlanner::new(plan.clone())),
            2,
            Duration::from_secs(5),
        );
        let mut handle = pool.dispatch(request("steve"))?;
        assert_eq!(wait_ready(&mut handle).await, Ok(plan));
        Ok(())
    }

    #[tokio::test]
    async fn pool_rejects_when_saturated() -> Result<(), Box<dyn std::error::Error>> {
        let pool = PlannerPool::new(
            Handle::current(),
            Arc::new(StaticPlanner::hanging()),
            1,
            Duration::from_secs(60),
        );
        let first = pool.dispatch(request("steve"))?;
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(
            pool.dispatch(request("alex")).err(),
            Some(ForemanError::PlannerSaturated)
        );

        // Cancelling frees the permit once the task observes it.
        drop(first);
        for _ in 0..100 {
            if pool.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.dispatch(request("alex")).is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn pool_wall_timeout_reports_timeout() -> Result<(), Box<dyn std::error::Error>> {
        let pool = PlannerPool::new(
            Handle::current(),
            Arc::new(StaticPlanner::hanging()),
            1,
            Duration::from_millis(10),
        );
        let mut handle = pool.dispatch(request("steve"))?;
        assert_eq!(wait_ready(&mut handle).await, Err(PlanningError::Timeout));
        Ok(())
    }

    #[test]
    fn manual_dispatcher_parks_until_resolved() -> Result<(), Box<dyn std::error::Error>> {
        let dispatcher = ManualDispatcher::new();
        let mut steve = dispatcher.dispatch(request("steve"))?;
        let mut alex = dispatcher.dispatch(request("alex"))?;
        assert_eq!(dispatcher.pending(), 2);

        assert!(dispatcher.resolve_for(&AgentId::new("alex"), Err(PlanningError::Timeout)));
        assert_eq!(alex.poll(), PlanPoll::Ready(Err(PlanningError::Timeout)));
        assert_eq!(steve.poll(), PlanPoll::Pending);

        assert!(dispatcher.resolve_next(Ok(Plan::default())));
        assert_eq!(steve.poll(), PlanPoll::Ready(Ok(Plan::default())));
        assert!(!dispatcher.resolve_next(Ok(Plan::default())));
        Ok(())
    }

    #[test]
    fn manual_dispatcher_capacity() -> Result<(), Box<dyn std::error::Error>> {
        let dispatcher = ManualDispatcher::with_capacity(1);
        let held = dispatcher.dispatch(request("steve"))?;
        assert_eq!(
            dispatcher.dispatch(request("alex")).err(),
            Some(ForemanError::PlannerSaturated)
        );
        drop(held);
        assert!(dispatcher.dispatch(request("alex")).is_ok());
        Ok(())
    }
}
