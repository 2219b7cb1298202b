//! [`Crew`] – shared wiring for every agent an embedding host runs.
//!
//! A crew holds the pieces all executors share: the action registry, the
//! plan dispatcher, the event bus and the executor configuration. Each call
//! to [`Crew::spawn_agent`] builds an independent [`ActionExecutor`] from
//! them.

use std::sync::Arc;

use foreman_actions::ActionRegistry;
use foreman_middleware::EventBus;
use foreman_types::{AgentId, Position};
use tracing::info;

use crate::executor::{ActionExecutor, ExecutorConfig};
use crate::pool::PlanDispatcher;

#[derive(Clone)]
pub struct Crew {
    registry: Arc<ActionRegistry>,
    dispatcher: Arc<dyn PlanDispatcher>,
    bus: EventBus,
    config: ExecutorConfig,
}

impl Crew {
    /// The registered action names are appended to the system context so the
    /// planner only proposes actions the agents can run.
    pub fn new(
        registry: ActionRegistry,
        dispatcher: Arc<dyn PlanDispatcher>,
        bus: EventBus,
        mut config: ExecutorConfig,
    ) -> Self {
        let names = registry.names();
        if !names.is_empty() {
            config.system_context = format!(
                "{}\n\nAvailable actions: {}.",
                config.system_context.trim_end(),
                names.join(", ")
            );
        }
        Self {
            registry: Arc::new(registry),
            dispatcher,
            bus,
            config,
        }
    }

    pub fn spawn_agent(&self, agent_id: AgentId, position: Position) -> ActionExecutor {
        info!(agent = %agent_id, %position, "agent spawned");
        ActionExecutor::new(
            agent_id,
            position,
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.dispatcher),
            self.bus.clone(),
        )
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }
}
