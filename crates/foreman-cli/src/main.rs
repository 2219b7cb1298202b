//! `foreman` – interactive host for a crew of simulated agents.
//!
//! 1. Loads `~/.foreman/config.toml`, running a short first-run wizard when
//!    the file is absent.
//! 2. Initialises logging (and OTLP export when configured).
//! 3. Builds the planner pool, the simulated action registry and the crew,
//!    then starts the sharded control loops.
//! 4. Prints lifecycle events as they happen and hands the terminal to the
//!    REPL.
//! 5. On `/quit`, end of input or Ctrl-C, every agent is shut down before
//!    exit.

mod config;
mod ollama;
mod repl;

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use foreman_actions::SimRegistry;
use foreman_middleware::EventBus;
use foreman_runtime::{
    Crew, CrewRuntime, LlmPlanner, PlannerPool, ReasoningService, ScriptPlanner, init_tracing,
};
use foreman_types::{Event, LifecycleEvent};
use tracing::{info, warn};

use crate::config::{Config, PlannerProvider};

fn main() -> ExitCode {
    let cfg = load_or_create_config();
    let _telemetry = init_tracing(&cfg.telemetry);

    print_banner();

    // Planner calls run on Tokio; the control loops are plain threads.
    let tokio_rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.planner.workers.clamp(1, 8))
        .thread_name("foreman-planner")
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {e}", "Failed to start async runtime".red());
            return ExitCode::FAILURE;
        }
    };

    let service: Arc<dyn ReasoningService> = match cfg.planner.provider {
        PlannerProvider::Ollama => {
            probe_ollama(&cfg);
            Arc::new(LlmPlanner::new(&cfg.planner.base_url, &cfg.planner.model))
        }
        PlannerProvider::Script => {
            println!(
                "  Planner: {} – type commands as {}",
                "script".yellow(),
                "steve: move_to x=5 then mine steps=3".bold()
            );
            Arc::new(ScriptPlanner::new())
        }
    };
    let pool = PlannerPool::new(
        tokio_rt.handle().clone(),
        service,
        cfg.planner.workers,
        cfg.planner.timeout(),
    );

    let bus = EventBus::default();
    bus.subscribe_fn(|event| {
        print_event(event);
        Ok(())
    });

    let crew = Crew::new(
        SimRegistry::new().with_movement().with_labor().build(),
        Arc::new(pool),
        bus,
        cfg.executor_config(),
    );
    let mut runtime = match CrewRuntime::start(crew, cfg.crew.shards, cfg.crew.tick_hz) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}: {e}", "Failed to start control loops".red());
            return ExitCode::FAILURE;
        }
    };

    for entry in &cfg.crew.agents {
        if let Err(e) = runtime.spawn_agent(entry.agent_id(), entry.position()) {
            warn!(agent = %entry.name, error = %e, "startup spawn failed");
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!(
            "{}",
            "⚠  Ctrl-C received – stopping agents …".yellow().bold()
        );
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Ctrl-C handler not installed");
    }

    println!(
        "  {} agent(s) at {} Hz. Type {} for commands.\n",
        cfg.crew.agents.len(),
        cfg.crew.tick_hz,
        "/help".bold().cyan()
    );

    repl::run(&runtime, &cfg, shutdown);

    runtime.shutdown();
    tokio_rt.shutdown_timeout(cfg.planner.timeout());
    info!("foreman exited");
    ExitCode::SUCCESS
}

// ─────────────────────────────────────────────────────────────────────────────
// Startup
// ─────────────────────────────────────────────────────────────────────────────

fn load_or_create_config() -> Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {e}", "Config error".red());
            println!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

fn run_first_run_wizard() -> Config {
    println!();
    println!("{}", "  Foreman first run".bold().cyan());
    println!("  No configuration found.\n");

    let mut cfg = Config::default();
    println!("  How should commands be planned?");
    println!("    1) Local model via Ollama  (default)");
    println!("    2) Offline script planner  (commands are literal action lists)");
    if prompt_line("  Enter choice [1]: ", "1") == "2" {
        cfg.planner.provider = PlannerProvider::Script;
    } else {
        cfg.planner.base_url = prompt_line(
            &format!("  Ollama URL [{}]: ", cfg.planner.base_url),
            &cfg.planner.base_url,
        );
        cfg.planner.model = prompt_line(
            &format!("  Model [{}]: ", cfg.planner.model),
            &cfg.planner.model,
        );
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {e}", "Error saving config".red()),
    }
    config::apply_env_overrides(&mut cfg);
    cfg
}

fn probe_ollama(cfg: &Config) {
    print!("  Probing Ollama at {} … ", cfg.planner.base_url.dimmed());
    std::io::Write::flush(&mut std::io::stdout()).ok();
    match ollama::list_models(&cfg.planner.base_url) {
        Ok(models) if ollama::has_model(&models, &cfg.planner.model) => {
            println!("{} (model {})", "online".green(), cfg.planner.model.bold());
        }
        Ok(models) => {
            println!("{}", "online".green());
            println!(
                "  {} '{}' is not installed ({} model(s) available). Run `ollama pull {}`.",
                "Warning:".yellow(),
                cfg.planner.model,
                models.len(),
                cfg.planner.model
            );
        }
        Err(_) => {
            println!("{}", "offline".yellow());
            println!(
                "  {} Commands will fail to plan until `{}` is running.",
                "No Ollama instance detected.".dimmed(),
                "ollama serve".bold()
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_event(event: &Event) {
    match &event.payload {
        LifecycleEvent::StateTransition {
            agent_id,
            from,
            to,
            reason,
            forced,
        } => {
            let arrow = if *forced { "⇒".yellow() } else { "→".normal() };
            println!(
                "  [{}] {} {arrow} {} {}",
                agent_id.as_str().bold(),
                from.as_str().dimmed(),
                to.as_str().bold(),
                format!("({reason})").dimmed()
            );
        }
        LifecycleEvent::ActionStarted {
            agent_id,
            action,
            total_steps,
            ..
        } => {
            println!(
                "  [{}] {} {} ({total_steps} steps)",
                agent_id.as_str().bold(),
                "start".cyan(),
                action
            );
        }
        LifecycleEvent::ActionCompleted {
            agent_id,
            action,
            success,
            message,
            duration_ticks,
            ..
        } => {
            let verdict = if *success { "done".green() } else { "stopped".red() };
            println!(
                "  [{}] {verdict} {action} in {duration_ticks} ticks: {}",
                agent_id.as_str().bold(),
                message.dimmed()
            );
        }
    }
}

fn print_banner() {
    println!();
    println!("{}", "  ┌─┐┌─┐┬─┐┌─┐┌┬┐┌─┐┌┐┌".bold().cyan());
    println!("{}", "  ├┤ │ │├┬┘├┤ │││├─┤│││".bold().cyan());
    println!("{}", "  └  └─┘┴└─└─┘┴ ┴┴ ┴┘└┘".bold().cyan());
    println!(
        "  {} {}",
        "Foreman".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Command execution control for autonomous agents");
    println!();
}

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{msg}");
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) if !line.trim().is_empty() => line.trim().to_string(),
        _ => default.to_string(),
    }
}
