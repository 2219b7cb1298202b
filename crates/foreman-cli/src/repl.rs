//! Interactive shell for driving a running crew.
//!
//! ```text
//! steve: mine block=oak_log steps=5      send a command to an agent
//! /spawn alex 10 64 -3                   add an agent
//! /agents                                one line per agent
//! /status steve                          detailed status as JSON
//! /pause steve   /resume steve   /cancel steve   /despawn steve
//! /models                                list planner models
//! /help   /quit
//! ```

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use foreman_runtime::{AgentStatus, CrewRuntime};
use foreman_types::{AgentId, AgentState, ForemanError, Position};

use crate::config::{Config, PlannerProvider};
use crate::ollama;

/// One parsed line of input.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Empty,
    Help,
    Quit,
    Agents,
    Models,
    Status(Option<AgentId>),
    Spawn { agent_id: AgentId, position: Position },
    Despawn(AgentId),
    Pause(AgentId),
    Resume(AgentId),
    Cancel(AgentId),
    Say { agent_id: AgentId, text: String },
}

/// Parse a line of user input.
pub fn parse(line: &str) -> Result<ReplCommand, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ReplCommand::Empty);
    }

    if let Some(rest) = line.strip_prefix('/') {
        let mut words = rest.split_whitespace();
        let verb = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        let agent = |usage: &str| -> Result<AgentId, String> {
            match args.as_slice() {
                [name] => Ok(AgentId::new(*name)),
                _ => Err(format!("usage: /{verb} {usage}")),
            }
        };
        return match verb {
            "help" | "?" => Ok(ReplCommand::Help),
            "quit" | "exit" => Ok(ReplCommand::Quit),
            "agents" | "ls" => Ok(ReplCommand::Agents),
            "models" => Ok(ReplCommand::Models),
            "status" => match args.as_slice() {
                [] => Ok(ReplCommand::Status(None)),
                [name] => Ok(ReplCommand::Status(Some(AgentId::new(*name)))),
                _ => Err("usage: /status [agent]".to_string()),
            },
            "spawn" => parse_spawn(&args),
            "despawn" => agent("<agent>").map(ReplCommand::Despawn),
            "pause" => agent("<agent>").map(ReplCommand::Pause),
            "resume" => agent("<agent>").map(ReplCommand::Resume),
            "cancel" | "stop" => agent("<agent>").map(ReplCommand::Cancel),
            other => Err(format!("unknown command '/{other}'")),
        };
    }

    let (name, text) = line
        .split_once(':')
        .ok_or_else(|| "address an agent as '<agent>: <command>'".to_string())?;
    let (name, text) = (name.trim(), text.trim());
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(format!("'{name}' is not a valid agent name"));
    }
    if text.is_empty() {
        return Err(format!("nothing to tell {name}"));
    }
    Ok(ReplCommand::Say {
        agent_id: AgentId::new(name),
        text: text.to_string(),
    })
}

fn parse_spawn(args: &[&str]) -> Result<ReplCommand, String> {
    const USAGE: &str = "usage: /spawn <agent> [x y z]";
    let coord = |raw: &str| {
        raw.parse::<f64>()
            .map_err(|_| format!("'{raw}' is not a number; {USAGE}"))
    };
    match args {
        [name] => Ok(ReplCommand::Spawn {
            agent_id: AgentId::new(*name),
            position: Position::new(0.0, 64.0, 0.0),
        }),
        [name, x, y, z] => Ok(ReplCommand::Spawn {
            agent_id: AgentId::new(*name),
            position: Position::new(coord(x)?, coord(y)?, coord(z)?),
        }),
        _ => Err(USAGE.to_string()),
    }
}

/// Run until `/quit`, end of input, or `shutdown` is raised.
pub fn run(runtime: &CrewRuntime, cfg: &Config, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    while !shutdown.load(Ordering::SeqCst) {
        print!("{} ", "foreman>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {e}", "Read error".red());
                break;
            }
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let command = match parse(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("{} {e}", "✗".red());
                continue;
            }
        };
        if command == ReplCommand::Quit {
            println!("{}", "Goodbye.".green());
            shutdown.store(true, Ordering::SeqCst);
            break;
        }
        execute(runtime, cfg, command);
    }
}

fn execute(runtime: &CrewRuntime, cfg: &Config, command: ReplCommand) {
    let outcome = match command {
        ReplCommand::Empty | ReplCommand::Quit => Ok(()),
        ReplCommand::Help => {
            print_help();
            Ok(())
        }
        ReplCommand::Models => {
            print_models(cfg);
            Ok(())
        }
        ReplCommand::Agents => runtime.statuses().map(|all| {
            if all.is_empty() {
                println!("  no agents; try {}", "/spawn <name>".bold());
            }
            for status in &all {
                println!("  {}", summary_line(status));
            }
        }),
        ReplCommand::Status(None) => runtime
            .statuses()
            .and_then(|all| all.iter().try_for_each(print_status)),
        ReplCommand::Status(Some(id)) => runtime.status(&id).and_then(|s| print_status(&s)),
        ReplCommand::Spawn { agent_id, position } => {
            let label = agent_id.to_string();
            runtime
                .spawn_agent(agent_id, position)
                .map(|()| println!("{} {} at {position}", "✓ spawned".green(), label.bold()))
        }
        ReplCommand::Despawn(id) => runtime
            .despawn(&id)
            .map(|()| println!("{} {}", "✓ despawned".green(), id.as_str().bold())),
        ReplCommand::Pause(id) => runtime
            .pause(&id)
            .map(|()| println!("{} {}", "⏸ paused".yellow(), id.as_str().bold())),
        ReplCommand::Resume(id) => runtime
            .resume(&id)
            .map(|()| println!("{} {}", "▶ resumed".green(), id.as_str().bold())),
        ReplCommand::Cancel(id) => runtime.cancel(&id).map(|cancelled| {
            if cancelled {
                println!("{} {}", "✓ cancelled".green(), id.as_str().bold());
            } else {
                println!("  {} has nothing to cancel", id.as_str().bold());
            }
        }),
        ReplCommand::Say { agent_id, text } => runtime
            .submit(&agent_id, &text)
            .map(|()| println!("{} {} is planning …", "✓".green(), agent_id.as_str().bold())),
    };
    if let Err(e) = outcome {
        println!("{} {e}", "✗".red());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_help() {
    println!();
    println!("{}", "Foreman Commands".bold().underline());
    println!("  {}   – send a command", "<agent>: <text>".bold().cyan());
    println!("  {}  – add an agent", "/spawn <agent> [x y z]".bold().cyan());
    println!("  {}            – list agents", "/agents".bold().cyan());
    println!("  {}    – detailed status", "/status [agent]".bold().cyan());
    println!(
        "  {} – control a running command",
        "/pause /resume /cancel <agent>".bold().cyan()
    );
    println!("  {}  – remove an agent", "/despawn <agent>".bold().cyan());
    println!("  {}            – list planner models", "/models".bold().cyan());
    println!("  {}       – exit", "/quit  /exit".bold().cyan());
    println!();
}

fn print_models(cfg: &Config) {
    match cfg.planner.provider {
        PlannerProvider::Script => {
            println!("  Planner: {} (offline, no models)", "script".yellow());
        }
        PlannerProvider::Ollama => match ollama::list_models(&cfg.planner.base_url) {
            Ok(models) => {
                println!("  Active model: {}", cfg.planner.model.yellow());
                for name in &models {
                    let marker = if ollama::has_model(std::slice::from_ref(name), &cfg.planner.model) {
                        "▶"
                    } else {
                        " "
                    };
                    println!("    {} {}", marker.green(), name.bold());
                }
                if !ollama::has_model(&models, &cfg.planner.model) {
                    println!(
                        "  {} run `ollama pull {}`",
                        "Active model not installed;".yellow(),
                        cfg.planner.model
                    );
                }
            }
            Err(e) => println!("  {} {}", "offline:".red(), e.dimmed()),
        },
    }
}

fn state_label(state: AgentState) -> colored::ColoredString {
    let text = state.as_str();
    match state {
        AgentState::Idle => text.dimmed(),
        AgentState::Planning => text.cyan(),
        AgentState::Executing => text.green(),
        AgentState::Paused => text.yellow(),
        AgentState::Completed => text.green().bold(),
        AgentState::Failed => text.red().bold(),
    }
}

fn summary_line(status: &AgentStatus) -> String {
    let doing = match (&status.current_action, status.action_progress) {
        (Some(action), Some((done, total))) => format!(
            "{action} {done}/{total} (step {}/{})",
            status.step + 1,
            status.steps
        ),
        _ => status.command.clone().unwrap_or_default(),
    };
    format!(
        "{:<12} {:<10} {} {}",
        status.agent_id.as_str().bold(),
        state_label(status.state),
        status.position,
        doing.dimmed()
    )
}

fn print_status(status: &AgentStatus) -> Result<(), ForemanError> {
    let json = status_json(status)?;
    println!("{}", summary_line(status));
    if let Some(failure) = &status.last_failure {
        println!("  last failure: {}", failure.red());
    }
    println!("{}", json.dimmed());
    Ok(())
}

fn status_json(status: &AgentStatus) -> Result<String, ForemanError> {
    Ok(serde_json::to_string_pretty(status)?)
}
