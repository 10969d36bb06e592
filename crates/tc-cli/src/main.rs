use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use tc_gateway::Gateway;
use tc_types::{approval::ApprovalRequest, config::TcConfig, event::GatewayEvent, session::Session};

#[derive(Parser)]
#[command(name = "teleclaude", version, about = "Teleclaude: drive a coding agent from a chat")]
struct Cli {
    /// Config file (default: ~/.teleclaude/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Chat user id to act as (default: the first allowed user)
    #[arg(long, global = true)]
    user: Option<i64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat with the agent (default)
    Chat,
    /// List your sessions
    Sessions,
    /// Show configuration and session status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => tc_gateway::config::config_path()?,
    };
    let config = tc_gateway::config::load_config_from(&config_path)?;
    let user = resolve_user(&config, cli.user, &config_path)?;

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => {
            let gateway = Arc::new(Gateway::new(config)?);
            run_chat(gateway, user).await
        }
        Commands::Sessions => {
            let gateway = Gateway::new(config)?;
            let sessions = gateway.list_sessions(user).await?;
            if sessions.is_empty() {
                println!("No sessions yet.");
            }
            for session in &sessions {
                println!("{}", describe_session(session));
            }
            Ok(())
        }
        Commands::Status => {
            println!("Teleclaude v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Data: {}", tc_gateway::config::data_dir(&config)?.display());
            println!("Agent: {} (max turns {})", config.agent.binary, config.agent.max_turns);
            let permission_mode = match config.agent.permission_mode.as_str() {
                "" => "default",
                mode => mode,
            };
            println!("Permission mode: {permission_mode}");
            println!("Approval required for: {}", config.approval.require_for.join(", "));
            println!("Projects: {}", config.projects.len());
            for (name, path) in &config.projects {
                println!("  {name}: {}", path.display());
            }

            let gateway = Gateway::new(config)?;
            let sessions = gateway.list_sessions(user).await?;
            let total: f64 = sessions.iter().map(|s| s.total_cost_usd).sum();
            println!("Sessions for user {user}: {} (total ${total:.4})", sessions.len());
            Ok(())
        }
    }
}

fn resolve_user(
    config: &TcConfig,
    requested: Option<i64>,
    config_path: &std::path::Path,
) -> Result<i64> {
    match requested {
        Some(user) if config.is_user_allowed(user) => Ok(user),
        Some(user) => anyhow::bail!(
            "User {user} is not in allowed_users of {}",
            config_path.display()
        ),
        None => config.allowed_users.first().copied().with_context(|| {
            format!(
                "No allowed users configured. Add your id to allowed_users in {}",
                config_path.display()
            )
        }),
    }
}

fn describe_session(session: &Session) -> String {
    format!(
        "{}  {:<16} {:<8} ${:.4}  {}",
        session.short_id(),
        session.project_name,
        session.status.to_string(),
        session.total_cost_usd,
        session.last_active.format("%Y-%m-%d %H:%M"),
    )
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

// ─── Chat loop ────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Input {
    Prompt(String),
    New(Option<String>),
    Continue,
    Sessions,
    Switch(String),
    Cost,
    Cancel,
    Approve(Option<String>),
    Deny(Option<String>),
    Help,
    Quit,
    Unknown(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Prompt(line.to_string()));
    };
    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, Some(rest.trim().to_string()).filter(|a| !a.is_empty())),
        None => (command, None),
    };
    Some(match name {
        "new" => Input::New(arg),
        "continue" => Input::Continue,
        "sessions" => Input::Sessions,
        "switch" => match arg {
            Some(id) => Input::Switch(id),
            None => Input::Unknown("/switch needs a session id".to_string()),
        },
        "cost" => Input::Cost,
        "cancel" => Input::Cancel,
        "approve" => Input::Approve(arg),
        "deny" => Input::Deny(arg),
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Unknown(format!("Unknown command /{other}")),
    })
}

const HELP: &str = "\
Commands:
  /new [project]     start a session on a registered project or a directory
  /continue          resume your most recent session
  /sessions          list your sessions
  /switch <id>       switch to a session (id prefix is enough)
  /cost              spend of this session and in total
  /cancel            stop the running turn
  /approve [id]      approve a pending action
  /deny [id]         deny a pending action
  /quit              leave
Anything else is sent to the agent.";

/// Pick the request an `/approve` or `/deny` refers to.
fn pick_request(pending: &[ApprovalRequest], id: Option<&str>) -> Option<ApprovalRequest> {
    match id {
        None if pending.len() == 1 => pending.first().cloned(),
        None => None,
        Some(prefix) => {
            let mut found = pending.iter().filter(|r| r.id.starts_with(prefix));
            match (found.next(), found.next()) {
                (Some(only), None) => Some(only.clone()),
                _ => None,
            }
        }
    }
}

async fn run_chat(gateway: Arc<Gateway>, user: i64) -> Result<()> {
    let printer = tokio::spawn(print_events(gateway.subscribe_events()));

    match gateway.active_session(user).await? {
        Some(session) => println!("Active session {}", describe_session(&session)),
        None => println!(
            "No active session. /new <project> or /continue to start. /help for commands."
        ),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else { break };
        let Some(input) = parse_input(&line) else { continue };
        if input == Input::Quit {
            break;
        }
        if let Err(e) = handle_input(&gateway, user, input).await {
            eprintln!("Error: {e}");
        }
    }

    gateway.shutdown().await?;
    printer.abort();
    Ok(())
}

async fn handle_input(gateway: &Gateway, user: i64, input: Input) -> Result<()> {
    match input {
        Input::Prompt(text) => {
            gateway.send_prompt(user, &text).await?;
        }
        Input::New(project) => {
            let project = match project {
                Some(p) => p,
                None => {
                    let projects = &gateway.config().projects;
                    match projects.keys().next() {
                        Some(only) if projects.len() == 1 => only.clone(),
                        _ => {
                            println!("Usage: /new <project>. Registered projects:");
                            for (name, path) in projects {
                                println!("  {name}: {}", path.display());
                            }
                            return Ok(());
                        }
                    }
                }
            };
            let session = gateway.new_session(user, &project).await?;
            println!(
                "Session {} on {} ({})",
                session.short_id(),
                session.project_name,
                session.project_path.display()
            );
        }
        Input::Continue => {
            let session = gateway.continue_session(user).await?;
            println!("Continuing {}", describe_session(&session));
        }
        Input::Sessions => {
            let sessions = gateway.list_sessions(user).await?;
            if sessions.is_empty() {
                println!("No sessions yet.");
            }
            for session in &sessions {
                let marker = if session.is_active() { "*" } else { " " };
                println!("{marker} {}", describe_session(session));
            }
        }
        Input::Switch(id) => {
            let session = gateway.switch_session(user, &id).await?;
            println!("Switched to {}", describe_session(&session));
        }
        Input::Cost => {
            let costs = gateway.cost_summary(user).await?;
            if let Some(session) = &costs.session {
                println!("This session: ${:.4}", session.total_cost_usd);
            }
            println!("Total: ${:.4}", costs.total_usd);
        }
        Input::Cancel => {
            if gateway.cancel(user).await? {
                println!("Stopping the agent...");
            } else {
                println!("Nothing is running.");
            }
        }
        Input::Approve(id) => decide(gateway, user, id.as_deref(), true).await?,
        Input::Deny(id) => decide(gateway, user, id.as_deref(), false).await?,
        Input::Help => println!("{HELP}"),
        Input::Unknown(message) => println!("{message}. /help for commands."),
        Input::Quit => {}
    }
    Ok(())
}

async fn decide(gateway: &Gateway, user: i64, id: Option<&str>, approve: bool) -> Result<()> {
    let pending = gateway.pending_approvals(user).await?;
    let Some(request) = pick_request(&pending, id) else {
        match pending.len() {
            0 => println!("No pending approvals."),
            _ => {
                println!("Which one?");
                for r in &pending {
                    println!("  {}  {}: {}", short(&r.id), r.tool_name, r.reason);
                }
            }
        }
        return Ok(());
    };
    let delivered = if approve {
        gateway.approve(user, &request.id).await?
    } else {
        gateway.deny(user, &request.id).await?
    };
    if !delivered {
        println!("Request {} is no longer pending.", short(&request.id));
    }
    Ok(())
}

async fn print_events(mut rx: tokio::sync::broadcast::Receiver<GatewayEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("Display fell behind; skipped {n} events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            GatewayEvent::TurnStarted { .. } => println!("..."),
            GatewayEvent::TextDelta { content, .. } => println!("{content}"),
            GatewayEvent::ToolUse { summary, .. } => println!("  > {summary}"),
            GatewayEvent::ToolResult { tool_use_id, is_error: true, .. } => {
                println!("  ! tool {tool_use_id} failed")
            }
            GatewayEvent::ToolResult { .. } => {}
            GatewayEvent::ApprovalRequested { request } => {
                println!(
                    "Approval needed [{}] {}: {}",
                    short(&request.id),
                    request.tool_name,
                    request.reason
                );
                println!("  {}", request.command);
                println!("  /approve {0} or /deny {0}", short(&request.id));
            }
            GatewayEvent::ApprovalResolved { request_id, decision, .. } => {
                println!("Request {} {decision}", short(&request_id));
            }
            GatewayEvent::TurnComplete { cost_usd, usage, .. } => match usage {
                Some(u) => println!(
                    "Done (${cost_usd:.4}, {} in / {} out tokens)",
                    u.input_tokens, u.output_tokens
                ),
                None => println!("Done (${cost_usd:.4})"),
            },
            GatewayEvent::Error { message, .. } => eprintln!("Agent error: {message}"),
            GatewayEvent::TurnFinished { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn request(id: &str) -> ApprovalRequest {
        ApprovalRequest {
            id: id.to_string(),
            session_id: "s".to_string(),
            tool_name: "Bash".to_string(),
            reason: "Delete files/directories".to_string(),
            command: "rm -rf build".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn plain_lines_are_prompts() {
        assert_eq!(parse_input("  fix the tests "), Some(Input::Prompt("fix the tests".into())));
        assert_eq!(parse_input("   "), None);
    }

    #[test]
    fn slash_commands_parse() {
        assert_eq!(parse_input("/new"), Some(Input::New(None)));
        assert_eq!(parse_input("/new myapp"), Some(Input::New(Some("myapp".into()))));
        assert_eq!(parse_input("/switch ab12"), Some(Input::Switch("ab12".into())));
        assert_eq!(parse_input("/approve"), Some(Input::Approve(None)));
        assert_eq!(parse_input("/deny  c0ffee "), Some(Input::Deny(Some("c0ffee".into()))));
        assert_eq!(parse_input("/exit"), Some(Input::Quit));
        assert!(matches!(parse_input("/switch"), Some(Input::Unknown(_))));
        assert!(matches!(parse_input("/frobnicate"), Some(Input::Unknown(_))));
    }

    #[test]
    fn request_selection() {
        let one = vec![request("aaaa1111")];
        assert_eq!(pick_request(&one, None).unwrap().id, "aaaa1111");

        let two = vec![request("aaaa1111"), request("aabb2222")];
        assert!(pick_request(&two, None).is_none());
        assert!(pick_request(&two, Some("aa")).is_none());
        assert_eq!(pick_request(&two, Some("aab")).unwrap().id, "aabb2222");
        assert!(pick_request(&two, Some("zz")).is_none());
    }

    #[test]
    fn listed_user_is_accepted() {
        let config = TcConfig {
            allowed_users: vec![10, 20],
            ..Default::default()
        };
        let path = std::path::Path::new("/tmp/config.toml");
        assert_eq!(resolve_user(&config, None, path).unwrap(), 10);
        assert_eq!(resolve_user(&config, Some(20), path).unwrap(), 20);
        assert!(resolve_user(&config, Some(30), path).is_err());
        assert!(resolve_user(&TcConfig::default(), None, path).is_err());
    }
}
