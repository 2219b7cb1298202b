//! Reads and writes `~/.foreman/config.toml`.
//!
//! Every section and field has a default, so a partial file (or an empty
//! one) is valid. Selected fields can be overridden from the environment,
//! see [`apply_env_overrides`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use foreman_kernel::StallThresholds;
use foreman_runtime::executor::DEFAULT_SYSTEM_CONTEXT;
use foreman_runtime::{ExecutorConfig, LogFormat, RecoveryLimits, TelemetryConfig};
use foreman_types::{AgentId, Position};
use serde::{Deserialize, Serialize};

/// Which reasoning service turns commands into plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlannerProvider {
    /// OpenAI-compatible chat endpoint, usually a local Ollama.
    #[default]
    Ollama,
    /// Offline: commands are literal `action key=value; …` scripts.
    Script,
}

impl std::fmt::Display for PlannerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlannerProvider::Ollama => write!(f, "ollama"),
            PlannerProvider::Script => write!(f, "script"),
        }
    }
}

impl std::str::FromStr for PlannerProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" | "llm" => Ok(Self::Ollama),
            "script" | "offline" => Ok(Self::Script),
            other => Err(format!("unknown planner provider '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    pub provider: PlannerProvider,
    pub base_url: String,
    pub model: String,
    /// Concurrent planning calls across all agents.
    pub workers: usize,
    /// Wall-clock cap on a single planning call.
    pub timeout_secs: u64,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            provider: PlannerProvider::default(),
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            workers: 4,
            timeout_secs: 30,
        }
    }
}

impl PlannerSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub planning_budget_ticks: u64,
    pub max_action_retries: u32,
    pub reposition_distance: f64,
    /// Extra text appended to the built-in planner context.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub extra_context: String,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            planning_budget_ticks: defaults.planning_budget_ticks,
            max_action_retries: defaults.max_action_retries,
            reposition_distance: defaults.reposition_distance,
            extra_context: String::new(),
        }
    }
}

/// An agent spawned at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub name: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default = "default_y")]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

fn default_y() -> f64 {
    64.0
}

impl AgentEntry {
    pub fn agent_id(&self) -> AgentId {
        AgentId::new(self.name.as_str())
    }

    pub fn position(&self) -> Position {
        Position::new(self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrewSection {
    pub tick_hz: u32,
    pub shards: usize,
    pub agents: Vec<AgentEntry>,
}

impl Default for CrewSection {
    fn default() -> Self {
        Self {
            tick_hz: 20,
            shards: 1,
            agents: vec![AgentEntry {
                name: "steve".to_string(),
                x: 0.0,
                y: default_y(),
                z: 0.0,
            }],
        }
    }
}

/// Persisted CLI configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub planner: PlannerSection,
    pub executor: ExecutorSection,
    pub stall: StallThresholds,
    pub recovery: RecoveryLimits,
    pub crew: CrewSection,
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Runtime executor settings derived from the file.
    pub fn executor_config(&self) -> ExecutorConfig {
        let mut system_context = DEFAULT_SYSTEM_CONTEXT.to_string();
        if !self.executor.extra_context.trim().is_empty() {
            system_context.push('\n');
            system_context.push_str(self.executor.extra_context.trim());
        }
        ExecutorConfig {
            planning_budget_ticks: self.executor.planning_budget_ticks,
            max_action_retries: self.executor.max_action_retries,
            reposition_distance: self.executor.reposition_distance,
            stall: self.stall,
            recovery: self.recovery,
            system_context,
        }
    }
}

/// `~/.foreman/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".foreman").join("config.toml")
}

/// Load the config, `None` when the file does not exist yet.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {e}", path.display()))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {e}"))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `FOREMAN_*` environment overrides.
///
/// | Variable | Field |
/// |---|---|
/// | `FOREMAN_PLANNER` | `planner.provider` |
/// | `FOREMAN_PLANNER_URL` | `planner.base_url` |
/// | `FOREMAN_MODEL` | `planner.model` |
/// | `FOREMAN_PLANNER_WORKERS` | `planner.workers` |
/// | `FOREMAN_TICK_HZ` | `crew.tick_hz` |
/// | `FOREMAN_LOG_FORMAT` | `telemetry.log_format` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("FOREMAN_PLANNER")
        && let Ok(provider) = v.parse::<PlannerProvider>()
    {
        cfg.planner.provider = provider;
    }
    if let Ok(v) = std::env::var("FOREMAN_PLANNER_URL") {
        cfg.planner.base_url = v;
    }
    if let Ok(v) = std::env::var("FOREMAN_MODEL") {
        cfg.planner.model = v;
    }
    if let Ok(v) = std::env::var("FOREMAN_PLANNER_WORKERS")
        && let Ok(workers) = v.parse::<usize>()
        && workers > 0
    {
        cfg.planner.workers = workers;
    }
    if let Ok(v) = std::env::var("FOREMAN_TICK_HZ")
        && let Ok(hz) = v.parse::<u32>()
        && hz > 0
    {
        cfg.crew.tick_hz = hz;
    }
    if let Ok(v) = std::env::var("FOREMAN_LOG_FORMAT")
        && let Ok(format) = v.parse::<LogFormat>()
    {
        cfg.telemetry.log_format = format;
    }
}

pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Write `cfg` with owner-only permissions on Unix.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {e}"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {e}"))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {e}"))?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {e}", path.display()))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {e}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_runtime_defaults() {
        let cfg = Config::default();
        let exec = cfg.executor_config();
        let runtime = ExecutorConfig::default();
        assert_eq!(exec.planning_budget_ticks, 60);
        assert_eq!(exec.stall, runtime.stall);
        assert_eq!(exec.recovery, runtime.recovery);
        assert_eq!(exec.system_context, runtime.system_context);
        assert_eq!(cfg.crew.agents[0].agent_id(), AgentId::new("steve"));
    }

    #[test]
    fn partial_file_fills_in_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let raw = r#"
            [planner]
            provider = "script"

            [stall]
            position_ticks = 10

            [[crew.agents]]
            name = "alex"
            x = 4.0
        "#;
        let cfg: Config = toml::from_str(raw)?;
        assert_eq!(cfg.planner.provider, PlannerProvider::Script);
        assert_eq!(cfg.planner.model, "llama3");
        assert_eq!(cfg.stall.position_ticks, 10);
        assert_eq!(cfg.stall.progress_ticks, 100);
        assert_eq!(cfg.crew.tick_hz, 20);
        assert_eq!(cfg.crew.agents.len(), 1);
        assert_eq!(cfg.crew.agents[0].position(), Position::new(4.0, 64.0, 0.0));
        Ok(())
    }

    #[test]
    fn extra_context_is_appended() {
        let mut cfg = Config::default();
        cfg.executor.extra_context = "  Prefer oak.  ".to_string();
        assert!(cfg.executor_config().system_context.ends_with("\nPrefer oak."));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() -> Result<(), Box<dyn std::error::Error>> {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir()?;
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path)?;

        let file_mode = fs::metadata(&path)?.permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let parent = path.parent().ok_or("config path has no parent")?;
        let dir_mode = fs::metadata(parent)?.permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        Ok(())
    }

    #[test]
    fn save_then_load_preserves_settings() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.recovery.max_replans = 2;
        cfg.crew.shards = 3;
        save_to(&cfg, &path)?;

        let loaded = load_from(&path)?.ok_or("config missing after save")?;
        assert_eq!(loaded.recovery.max_replans, 2);
        assert_eq!(loaded.crew.shards, 3);
        assert_eq!(loaded.planner.base_url, "http://localhost:11434");
        Ok(())
    }

    #[test]
    fn missing_file_loads_as_none() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path)?.is_none());
        assert!(path.to_string_lossy().contains(".foreman"));
        Ok(())
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        // SAFETY: these variables are only touched by this test.
        unsafe {
            std::env::set_var("FOREMAN_PLANNER", "script");
            std::env::set_var("FOREMAN_MODEL", "qwen2.5");
            std::env::set_var("FOREMAN_TICK_HZ", "not-a-number");
            std::env::set_var("FOREMAN_PLANNER_WORKERS", "0");
            std::env::set_var("FOREMAN_LOG_FORMAT", "json");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.planner.provider, PlannerProvider::Script);
        assert_eq!(cfg.planner.model, "qwen2.5");
        assert_eq!(cfg.crew.tick_hz, 20);
        assert_eq!(cfg.planner.workers, 4);
        assert_eq!(cfg.telemetry.log_format, LogFormat::Json);
        unsafe {
            for var in [
                "FOREMAN_PLANNER",
                "FOREMAN_MODEL",
                "FOREMAN_TICK_HZ",
                "FOREMAN_PLANNER_WORKERS",
                "FOREMAN_LOG_FORMAT",
            ] {
                std::env::remove_var(var);
            }
        }
    }
}
