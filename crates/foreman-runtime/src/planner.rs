//! Reasoning-service clients that turn a natural-language command into a
//! [`Plan`].
//!
//! The executor never talks to these directly; requests go through a
//! [`PlanDispatcher`][crate::pool::PlanDispatcher] which runs them on the
//! bounded planner pool.
//!
//! | Client | Use |
//! |---|---|
//! | [`LlmPlanner`] | OpenAI-compatible `/v1/chat/completions` server (e.g. Ollama) |
//! | [`ScriptPlanner`] | Offline: parses `"move_to x=3; mine steps=5"` commands |
//! | [`StaticPlanner`] | Fixed answer (plan, failure, or never) for tests and demos |
//!
//! # Example
//!
//! ```rust,no_run
//! use foreman_runtime::planner::{LlmPlanner, ReasoningService};
//!
//! # async fn demo() {
//! let planner = LlmPlanner::new("http://localhost:11434", "llama3");
//! // Requires a running model server.
//! let plan = planner.plan("You control a miner.", "dig a 3x3 hole").await;
//! # let _ = plan;
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use foreman_types::{ActionSpec, ForemanError, Plan, PlanningError};
use schemars::schema_for;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Planning guidelines
// ─────────────────────────────────────────────────────────────────────────────

/// Rules appended to every system message sent to the model.
pub const PLANNING_GUIDELINES: &str = "\
## Planning Guidelines
- Reply with a single JSON object matching the provided schema.
- Use only the action names listed as available.
- Keep plans short: at most 12 actions.
- Prefer moving next to a target before mining, placing or building.
- Never emit an empty action list; use `wait` if nothing else applies.";

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Produces a plan for one command. Implementations must be safe to drop
/// mid-flight: the pool cancels by dropping the future.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn plan(&self, system_context: &str, command: &str) -> Result<Plan, PlanningError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise while talking to the model server.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response from the model server could not be parsed.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
    #[error("plan is not valid JSON: {0}")]
    InvalidPlan(#[from] serde_json::Error),
}

impl From<LlmError> for PlanningError {
    fn from(err: LlmError) -> Self {
        PlanningError::Failed(err.to_string())
    }
}

impl From<LlmError> for ForemanError {
    fn from(err: LlmError) -> Self {
        ForemanError::PlanningFailed(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

/// The role of a participant in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// `response_format` field that enforces structured JSON Schema output.
#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmPlanner
// ─────────────────────────────────────────────────────────────────────────────

/// Plans through an OpenAI-compatible chat-completions endpoint.
pub struct LlmPlanner {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl LlmPlanner {
    /// `base_url` is the server root, e.g. `"http://localhost:11434"`.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: plan_schema(),
            },
        };

        let response: ChatResponse = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))
    }
}

#[async_trait]
impl ReasoningService for LlmPlanner {
    async fn plan(&self, system_context: &str, command: &str) -> Result<Plan, PlanningError> {
        let messages = build_messages(system_context, command);
        let reply = self.complete(&messages).await?;
        debug!(model = %self.model, bytes = reply.len(), "planner reply received");
        Ok(parse_plan(&reply)?)
    }
}

/// System message (context plus guidelines) followed by the user command.
pub fn build_messages(system_context: &str, command: &str) -> Vec<ChatMessage> {
    let system = if system_context.trim().is_empty() {
        PLANNING_GUIDELINES.to_string()
    } else {
        format!("{system_context}\n\n{PLANNING_GUIDELINES}")
    };
    vec![
        ChatMessage {
            role: Role::System,
            content: system,
        },
        ChatMessage {
            role: Role::User,
            content: command.to_string(),
        },
    ]
}

/// JSON Schema of [`Plan`], sent as the structured-output contract.
pub fn plan_schema() -> serde_json::Value {
    serde_json::to_value(schema_for!(Plan)).unwrap_or(serde_json::Value::Null)
}

/// Parse a model reply, tolerating a Markdown code fence around the JSON.
pub fn parse_plan(reply: &str) -> Result<Plan, LlmError> {
    let trimmed = reply.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    Ok(serde_json::from_str(body.trim())?)
}

// ─────────────────────────────────────────────────────────────────────────────
// ScriptPlanner
// ─────────────────────────────────────────────────────────────────────────────

/// Offline planner that reads the command itself as a plan.
///
/// Steps are separated by `;` or `then`; each step is an action name followed
/// by `key=value` pairs. Numbers and booleans are typed, everything else is a
/// string. A command that is already a JSON plan is accepted verbatim.
///
/// ```
/// use foreman_runtime::planner::ScriptPlanner;
///
/// let plan = ScriptPlanner::parse("move_to x=3 z=-2; mine steps=5 block=oak_log").unwrap();
/// assert_eq!(plan.actions.len(), 2);
/// assert_eq!(plan.actions[1].param_str("block"), Some("oak_log"));
/// ```
#[derive(Debug, Default, Clone)]
pub struct ScriptPlanner;

impl ScriptPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(command: &str) -> Result<Plan, PlanningError> {
        let trimmed = command.trim();
        if trimmed.starts_with('{') {
            return parse_plan(trimmed).map_err(PlanningError::from);
        }

        let mut actions = Vec::new();
        for step in trimmed.replace(" then ", ";").split(';') {
            let mut words = step.split_whitespace();
            let Some(name) = words.next() else {
                continue;
            };
            let mut spec = ActionSpec::new(name);
            for word in words {
                let (key, raw) = word.split_once('=').ok_or_else(|| {
                    PlanningError::Failed(format!("expected key=value, got '{word}'"))
                })?;
                spec = spec.with(key, script_value(raw));
            }
            actions.push(spec);
        }
        Ok(Plan {
            goal: Some(trimmed.to_string()),
            actions,
        })
    }
}

fn script_value(raw: &str) -> serde_json::Value {
    if let Ok(n) = raw.parse::<u64>() {
        return n.into();
    }
    if let Ok(n) = raw.parse::<f64>() {
        return n.into();
    }
    match raw {
        "true" => true.into(),
        "false" => false.into(),
        other => other.into(),
    }
}

#[async_trait]
impl ReasoningService for ScriptPlanner {
    async fn plan(&self, _system_context: &str, command: &str) -> Result<Plan, PlanningError> {
        Self::parse(command)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StaticPlanner
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum StaticReply {
    Plan(Plan),
    Fail(String),
    Never,
}

/// Returns the same configured answer for every command.
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    reply: StaticReply,
    delay: Duration,
}

impl StaticPlanner {
    pub fn new(plan: Plan) -> Self {
        Self {
            reply: StaticReply::Plan(plan),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            reply: StaticReply::Fail(reason.into()),
            delay: Duration::ZERO,
        }
    }

    /// A planner whose future never resolves.
    pub fn hanging() -> Self {
        Self {
            reply: StaticReply::Never,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ReasoningService for StaticPlanner {
    async fn plan(&self, _system_context: &str, _command: &str) -> Result<Plan, PlanningError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.reply {
            StaticReply::Plan(plan) => Ok(plan.clone()),
            StaticReply::Fail(reason) => Err(PlanningError::Failed(reason.clone())),
            StaticReply::Never => std::future::pending().await,
        }
    }
}
