//! Fixed-rate tick loops that own the agents.
//!
//! Every executor belongs to exactly one [`ControlLoop`], which is the only
//! code that mutates it. Other threads talk to a loop through
//! [`ControlMessage`]s; each request carries a oneshot reply channel.
//!
//! [`CrewRuntime`] starts one loop per shard on its own OS thread and routes
//! requests by agent id, so a given agent is always ticked by the same
//! thread.
//!
//! ```text
//!   REPL / host ──ControlMessage──▶ shard 0 ──tick──▶ executors {steve, …}
//!                                 ▶ shard 1 ──tick──▶ executors {alex, …}
//! ```

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use foreman_types::{AgentId, ForemanError, Position};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::crew::Crew;
use crate::executor::{ActionExecutor, AgentStatus};

/// Reply channel carried by every request.
pub type Reply<T> = oneshot::Sender<Result<T, ForemanError>>;

/// Requests a [`ControlLoop`] understands.
#[derive(Debug)]
pub enum ControlMessage {
    Spawn {
        agent_id: AgentId,
        position: Position,
        reply: Reply<()>,
    },
    Command {
        agent_id: AgentId,
        text: String,
        reply: Reply<()>,
    },
    Pause {
        agent_id: AgentId,
        reply: Reply<()>,
    },
    Resume {
        agent_id: AgentId,
        reply: Reply<()>,
    },
    /// Replies `false` when the agent had nothing to cancel.
    Cancel {
        agent_id: AgentId,
        reply: Reply<bool>,
    },
    Despawn {
        agent_id: AgentId,
        reply: Reply<()>,
    },
    /// `None` reports every agent on the loop.
    Status {
        agent_id: Option<AgentId>,
        reply: Reply<Vec<AgentStatus>>,
    },
    Shutdown,
}

fn respond<T>(reply: Reply<T>, result: Result<T, ForemanError>) {
    if reply.send(result).is_err() {
        debug!("control reply dropped; caller went away");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ControlLoop
// ─────────────────────────────────────────────────────────────────────────────

pub struct ControlLoop {
    crew: Crew,
    agents: BTreeMap<AgentId, ActionExecutor>,
    inbox: mpsc::Receiver<ControlMessage>,
    ticks: u64,
}

impl ControlLoop {
    pub fn new(crew: Crew, inbox: mpsc::Receiver<ControlMessage>) -> Self {
        Self {
            crew,
            agents: BTreeMap::new(),
            inbox,
            ticks: 0,
        }
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<&ActionExecutor> {
        self.agents.get(agent_id)
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Apply one request. Returns `false` on [`ControlMessage::Shutdown`].
    pub fn handle(&mut self, message: ControlMessage) -> bool {
        match message {
            ControlMessage::Spawn {
                agent_id,
                position,
                reply,
            } => {
                let result = if self.agents.contains_key(&agent_id) {
                    Err(ForemanError::AgentExists(agent_id))
                } else {
                    let executor = self.crew.spawn_agent(agent_id.clone(), position);
                    self.agents.insert(agent_id, executor);
                    Ok(())
                };
                respond(reply, result);
            }
            ControlMessage::Command {
                agent_id,
                text,
                reply,
            } => {
                let result = self.with_agent(&agent_id, |a| a.submit_command(&text));
                respond(reply, result);
            }
            ControlMessage::Pause { agent_id, reply } => {
                respond(reply, self.with_agent(&agent_id, ActionExecutor::pause));
            }
            ControlMessage::Resume { agent_id, reply } => {
                respond(reply, self.with_agent(&agent_id, ActionExecutor::resume));
            }
            ControlMessage::Cancel { agent_id, reply } => {
                respond(reply, self.with_agent(&agent_id, |a| Ok(a.cancel())));
            }
            ControlMessage::Despawn { agent_id, reply } => {
                let result = match self.agents.remove(&agent_id) {
                    Some(mut executor) => {
                        executor.shutdown();
                        info!(agent = %agent_id, "agent despawned");
                        Ok(())
                    }
                    None => Err(ForemanError::UnknownAgent(agent_id)),
                };
                respond(reply, result);
            }
            ControlMessage::Status { agent_id, reply } => {
                let result = match agent_id {
                    Some(id) => self
                        .agents
                        .get(&id)
                        .map(|a| vec![a.status()])
                        .ok_or(ForemanError::UnknownAgent(id)),
                    None => Ok(self.agents.values().map(ActionExecutor::status).collect()),
                };
                respond(reply, result);
            }
            ControlMessage::Shutdown => return false,
        }
        true
    }

    /// Apply every queued request without blocking. Returns `false` once the
    /// loop should stop (shutdown requested or every sender dropped).
    pub fn drain_inbox(&mut self) -> bool {
        loop {
            match self.inbox.try_recv() {
                Ok(message) => {
                    if !self.handle(message) {
                        return false;
                    }
                }
                Err(mpsc::TryRecvError::Empty) => return true,
                Err(mpsc::TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Advance every agent by one tick.
    pub fn tick_all(&mut self) {
        self.ticks += 1;
        for executor in self.agents.values_mut() {
            executor.tick();
        }
    }

    /// Run until shutdown, ticking once per `period`.
    pub fn run(mut self, period: Duration) {
        info!(period_ms = period.as_millis() as u64, "control loop started");
        while self.drain_inbox() {
            let started = Instant::now();
            self.tick_all();
            let elapsed = started.elapsed();
            if elapsed < period {
                thread::sleep(period - elapsed);
            } else {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    agents = self.agents.len(),
                    "tick overran its period"
                );
            }
        }
        self.shutdown_agents();
        info!(ticks = self.ticks, "control loop stopped");
    }

    fn shutdown_agents(&mut self) {
        for executor in self.agents.values_mut() {
            executor.shutdown();
        }
        self.agents.clear();
    }

    fn with_agent<T>(
        &mut self,
        agent_id: &AgentId,
        f: impl FnOnce(&mut ActionExecutor) -> Result<T, ForemanError>,
    ) -> Result<T, ForemanError> {
        let executor = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ForemanError::UnknownAgent(agent_id.clone()))?;
        f(executor)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CrewRuntime
// ─────────────────────────────────────────────────────────────────────────────

struct Shard {
    tx: mpsc::Sender<ControlMessage>,
    thread: Option<JoinHandle<()>>,
}

/// Sharded set of control loops with a blocking request API.
///
/// The blocking calls must not be made from inside a Tokio runtime.
pub struct CrewRuntime {
    shards: Vec<Shard>,
    bus: foreman_middleware::EventBus,
}

impl CrewRuntime {
    /// Start `shards` control loops ticking at `tick_hz`.
    pub fn start(crew: Crew, shards: usize, tick_hz: u32) -> std::io::Result<Self> {
        let period = Duration::from_secs_f64(1.0 / f64::from(tick_hz.max(1)));
        let bus = crew.bus().clone();
        let mut started = Vec::with_capacity(shards.max(1));
        for index in 0..shards.max(1) {
            let (tx, rx) = mpsc::channel();
            let control = ControlLoop::new(crew.clone(), rx);
            let thread = thread::Builder::new()
                .name(format!("foreman-shard-{index}"))
                .spawn(move || control.run(period))?;
            started.push(Shard {
                tx,
                thread: Some(thread),
            });
        }
        info!(shards = started.len(), tick_hz, "crew runtime started");
        Ok(Self {
            shards: started,
            bus,
        })
    }

    pub fn bus(&self) -> &foreman_middleware::EventBus {
        &self.bus
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard that owns `agent_id`.
    pub fn shard_for(&self, agent_id: &AgentId) -> usize {
        let mut hasher = DefaultHasher::new();
        agent_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len().max(1) as u64) as usize
    }

    pub fn spawn_agent(&self, agent_id: AgentId, position: Position) -> Result<(), ForemanError> {
        let shard = self.shard_for(&agent_id);
        self.request(shard, |reply| ControlMessage::Spawn {
            agent_id,
            position,
            reply,
        })
    }

    pub fn submit(&self, agent_id: &AgentId, text: &str) -> Result<(), ForemanError> {
        self.request(self.shard_for(agent_id), |reply| ControlMessage::Command {
            agent_id: agent_id.clone(),
            text: text.to_string(),
            reply,
        })
    }

    pub fn pause(&self, agent_id: &AgentId) -> Result<(), ForemanError> {
        self.request(self.shard_for(agent_id), |reply| ControlMessage::Pause {
            agent_id: agent_id.clone(),
            reply,
        })
    }

    pub fn resume(&self, agent_id: &AgentId) -> Result<(), ForemanError> {
        self.request(self.shard_for(agent_id), |reply| ControlMessage::Resume {
            agent_id: agent_id.clone(),
            reply,
        })
    }

    pub fn cancel(&self, agent_id: &AgentId) -> Result<bool, ForemanError> {
        self.request(self.shard_for(agent_id), |reply| ControlMessage::Cancel {
            agent_id: agent_id.clone(),
            reply,
        })
    }

    pub fn despawn(&self, agent_id: &AgentId) -> Result<(), ForemanError> {
        self.request(self.shard_for(agent_id), |reply| ControlMessage::Despawn {
            agent_id: agent_id.clone(),
            reply,
        })
    }

    pub fn status(&self, agent_id: &AgentId) -> Result<AgentStatus, ForemanError> {
        let mut statuses = self.request(self.shard_for(agent_id), |reply| {
            ControlMessage::Status {
                agent_id: Some(agent_id.clone()),
                reply,
            }
        })?;
        statuses
            .pop()
            .ok_or_else(|| ForemanError::UnknownAgent(agent_id.clone()))
    }

    /// Every agent on every shard, ordered by id.
    pub fn statuses(&self) -> Result<Vec<AgentStatus>, ForemanError> {
        let mut all = Vec::new();
        for shard in 0..self.shards.len() {
            all.extend(self.request(shard, |reply| ControlMessage::Status {
                agent_id: None,
                reply,
            })?);
        }
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(all)
    }

    /// Stop every loop and join its thread. Safe to call more than once.
    pub fn shutdown(&mut self) {
        for shard in &self.shards {
            if shard.tx.send(ControlMessage::Shutdown).is_err() {
                debug!("control loop already stopped");
            }
        }
        for shard in &mut self.shards {
            if let Some(thread) = shard.thread.take()
                && thread.join().is_err()
            {
                warn!("control loop thread panicked");
            }
        }
    }

    fn request<T>(
        &self,
        shard: usize,
        make: impl FnOnce(Reply<T>) -> ControlMessage,
    ) -> Result<T, ForemanError> {
        let (reply, rx) = oneshot::channel();
        let target = self
            .shards
            .get(shard)
            .ok_or_else(|| ForemanError::ChannelClosed(format!("no shard {shard}")))?;
        target
            .tx
            .send(make(reply))
            .map_err(|_| ForemanError::ChannelClosed("control loop stopped".to_string()))?;
        rx.blocking_recv()
            .map_err(|_| ForemanError::ChannelClosed("control loop dropped the reply".to_string()))?
    }
}

impl Drop for CrewRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
