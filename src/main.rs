use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use clawgate::agent::{AgentLoop, AgentLoopOptions};
use clawgate::bus::Bus;
use clawgate::config::Config;
use clawgate::cron::{CronService, Payload, Schedule};
use clawgate::error::GatewayError;
use clawgate::gateway::{self, GatewayOptions};
use clawgate::llm::create_client;
use clawgate::session::SessionStore;
use clawgate::tools::ToolRegistry;
use clawgate::{logging, paths};

#[derive(Parser)]
#[command(name = "clawgate", version, about = "Personal AI gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the long-lived gateway (channels + cron + heartbeat).
    Gateway {
        /// HTTP listen address for the Slack Events API.
        #[arg(long)]
        listen: Option<String>,
        /// Workspace directory (default: ~/.clawgate/workspace or CLAWGATE_WORKSPACE).
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Max tool-call iterations per turn.
        #[arg(long, default_value_t = 20)]
        max_iters: usize,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Run a single agent turn from the terminal.
    Agent {
        /// The prompt; remaining arguments are joined with spaces.
        prompt: Vec<String>,
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Manage scheduled jobs.
    Cron {
        #[command(subcommand)]
        action: CronCommands,
    },
}

#[derive(Subcommand)]
enum CronCommands {
    /// Add a job. Exactly one of --every-ms, --cron or --at-ms is required.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        every_ms: Option<i64>,
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        at_ms: Option<i64>,
        #[arg(long)]
        message: String,
        /// Deliver the result to --channel/--to instead of running silently.
        #[arg(long)]
        deliver: bool,
        #[arg(long, default_value = "")]
        channel: String,
        #[arg(long, default_value = "")]
        to: String,
    },
    /// List jobs.
    List {
        /// Include disabled jobs.
        #[arg(long)]
        all: bool,
    },
    /// Remove a job by id.
    Rm { id: String },
    /// Enable a job by id.
    Enable { id: String },
    /// Disable a job by id.
    Disable { id: String },
    /// Trigger a job immediately.
    Run {
        id: String,
        #[arg(long)]
        force: bool,
    },
}

fn resolve_workspace(flag: Option<PathBuf>) -> PathBuf {
    if let Some(ws) = flag {
        return ws;
    }
    if let Ok(env) = std::env::var("CLAWGATE_WORKSPACE") {
        if !env.trim().is_empty() {
            return PathBuf::from(env);
        }
    }
    paths::workspace_dir()
}

fn load_config() -> Result<Config, GatewayError> {
    Config::load(&paths::config_path()?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Gateway {
            listen,
            workspace,
            max_iters,
            verbose,
        } => {
            logging::init(verbose);
            let cfg = match load_config() {
                Ok(cfg) => cfg,
                Err(e) => return fatal(e),
            };
            let workspace = resolve_workspace(workspace);
            match gateway::run(cfg, workspace, GatewayOptions { listen, max_iters }).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => fatal(e),
            }
        }
        Commands::Agent {
            prompt,
            workspace,
            verbose,
        } => {
            logging::init(verbose);
            let prompt = prompt.join(" ");
            if prompt.trim().is_empty() {
                eprintln!("error: prompt is empty");
                return ExitCode::from(2);
            }
            let cfg = match load_config() {
                Ok(cfg) => cfg,
                Err(e) => return fatal(e),
            };
            match run_agent_once(cfg, resolve_workspace(workspace), &prompt).await {
                Ok(reply) => {
                    println!("{reply}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Cron { action } => {
            logging::init(false);
            run_cron_command(action).await
        }
    }
}

fn fatal(e: GatewayError) -> ExitCode {
    eprintln!("error: {e}");
    ExitCode::FAILURE
}

/// One-shot agent turn for the `agent` subcommand: same loop, no channels.
async fn run_agent_once(
    cfg: Config,
    workspace: PathBuf,
    prompt: &str,
) -> Result<String, String> {
    paths::ensure_state_dirs().map_err(|e| e.to_string())?;
    std::fs::create_dir_all(&workspace).map_err(|e| e.to_string())?;

    let bus = std::sync::Arc::new(Bus::new(16));
    let sessions = std::sync::Arc::new(SessionStore::new(paths::sessions_dir()));
    let llm = create_client(&cfg.llm).map_err(|e| e.to_string())?;

    let mut tools = ToolRegistry::new(workspace.clone(), cfg.agent.restrict_to_workspace);
    tools.exec_timeout = std::time::Duration::from_secs(cfg.tools.exec_timeout_sec);
    tools.brave_api_key = cfg.tools.web.brave_api_key.clone();
    tools.web_allowed_domains = cfg.tools.web.allowed_domains.clone();
    tools.web_blocked_domains = cfg.tools.web.blocked_domains.clone();

    let agent = AgentLoop::new(AgentLoopOptions {
        llm,
        tools: std::sync::Arc::new(tools),
        bus,
        sessions,
        workspace,
        max_iters: cfg.agent.max_iters,
        history_window: cfg.agent.history_window,
        memory_window: cfg.agent.memory_window,
    });
    agent.process_direct(prompt, "cli", "cli", "direct").await
}

fn toggle_job(svc: &CronService, id: &str, disable: bool) -> ExitCode {
    match svc.toggle(id, disable) {
        Ok(true) => {
            println!("{} {id}", if disable { "disabled" } else { "enabled" });
            ExitCode::SUCCESS
        }
        Ok(false) => {
            eprintln!("error: job not found: {id}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Scheduling subcommands exit 2 on usage errors, per the CLI contract.
async fn run_cron_command(action: CronCommands) -> ExitCode {
    if let Err(e) = paths::ensure_state_dirs() {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    let svc = std::sync::Arc::new(CronService::new(paths::cron_store_path(), None));
    match action {
        CronCommands::Add {
            name,
            every_ms,
            cron,
            at_ms,
            message,
            deliver,
            channel,
            to,
        } => {
            let schedule = match (every_ms, cron, at_ms) {
                (Some(every_ms), None, None) => Schedule {
                    kind: "every".into(),
                    every_ms,
                    ..Default::default()
                },
                (None, Some(expr), None) => Schedule {
                    kind: "cron".into(),
                    expr,
                    ..Default::default()
                },
                (None, None, Some(at_ms)) => Schedule {
                    kind: "at".into(),
                    at_ms,
                    ..Default::default()
                },
                _ => {
                    eprintln!("error: exactly one of --every-ms, --cron or --at-ms is required");
                    return ExitCode::from(2);
                }
            };
            let payload = Payload {
                kind: "agent_turn".into(),
                message,
                deliver,
                channel,
                to,
            };
            match svc.add(&name, schedule, payload) {
                Ok(job) => {
                    println!("added job {} ({})", job.id, job.name);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::from(2)
                }
            }
        }
        CronCommands::List { all } => {
            let jobs = svc.list(all);
            if jobs.is_empty() {
                println!("no jobs");
                return ExitCode::SUCCESS;
            }
            for job in jobs {
                println!(
                    "{}  {}  enabled={}  kind={}  next={}  runs={}  failures={}",
                    job.id,
                    job.name,
                    job.enabled,
                    job.schedule.kind,
                    job.state.next_run_at_ms,
                    job.state.run_count,
                    job.state.failure_count,
                );
            }
            ExitCode::SUCCESS
        }
        CronCommands::Rm { id } => match svc.remove(&id) {
            Ok(true) => {
                println!("removed {id}");
                ExitCode::SUCCESS
            }
            Ok(false) => {
                eprintln!("error: job not found: {id}");
                ExitCode::from(2)
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        },
        CronCommands::Enable { id } => toggle_job(&svc, &id, false),
        CronCommands::Disable { id } => toggle_job(&svc, &id, true),
        CronCommands::Run { id, force } => match svc.run_now(&id, force).await {
            // No trigger is wired in CLI mode; this only advances the
            // schedule, which is still useful for testing job setup.
            Ok(true) => {
                println!("ran {id}");
                ExitCode::SUCCESS
            }
            Ok(false) => {
                println!("job {id} is not due (use --force)");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::from(2)
            }
        },
    }
}
