//! Gateway mode: wire every component together and run until shutdown.
//!
//! Construction order matters: the cron service is created before the
//! agent loop (its trigger holds the loop through a `OnceLock` filled in
//! later), the tool registry gets the bus and cron handles, and the
//! sub-agent manager is injected into the loop last. A single root
//! cancellation token, fired by SIGINT/SIGTERM, stops everything.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{AgentLoop, AgentLoopOptions, SubagentManager};
use crate::bus::{Bus, InboundMessage};
use crate::channels::{ChannelManager, DiscordChannel, SlackChannel, TelegramChannel};
use crate::config::Config;
use crate::cron::{CronService, TriggerFn};
use crate::error::GatewayError;
use crate::llm::create_client;
use crate::paths;
use crate::session::SessionStore;
use crate::tools::{SkillReader, ToolRegistry};

const GATEWAY_BUS_BUFFER: usize = 256;

/// Cancel the returned token on SIGINT or SIGTERM.
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!(error = %e, "cannot install SIGTERM handler");
                    let _ = ctrl_c.await;
                    signal_token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received Ctrl+C, shutting down");
        }
        signal_token.cancel();
    });
    token
}

/// Skill documents live under `<workspace>/skills/<name>.md`.
fn skill_reader(workspace: &Path) -> SkillReader {
    let dir = workspace.join("skills");
    Arc::new(move |name: &str| {
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return None;
        }
        std::fs::read_to_string(dir.join(format!("{name}.md"))).ok()
    })
}

pub struct GatewayOptions {
    pub listen: Option<String>,
    pub max_iters: usize,
}

/// Run the gateway until the process is signalled.
pub async fn run(cfg: Config, workspace: PathBuf, opts: GatewayOptions) -> Result<(), GatewayError> {
    paths::ensure_state_dirs()?;
    std::fs::create_dir_all(&workspace)?;

    // Fatal misconfigurations abort before anything starts.
    if cfg.channels.slack.enabled && cfg.channels.slack.signing_secret.trim().is_empty() {
        return Err(GatewayError::Config(
            "slack enabled but signingSecret is empty".into(),
        ));
    }

    let token = install_signal_handler();
    let bus = Arc::new(Bus::new(GATEWAY_BUS_BUFFER));
    let sessions = Arc::new(SessionStore::new(paths::sessions_dir()));
    let llm = create_client(&cfg.llm)?;

    // The trigger needs the agent loop, which does not exist yet; the
    // OnceLock is filled in right after the loop is built.
    let loop_slot: Arc<OnceLock<Arc<AgentLoop>>> = Arc::new(OnceLock::new());
    let cron = if cfg.cron.enabled {
        let bus_for_trigger = Arc::clone(&bus);
        let token_for_trigger = token.clone();
        let loop_for_trigger = Arc::clone(&loop_slot);
        let trigger: TriggerFn = Arc::new(move |job| {
            let bus = Arc::clone(&bus_for_trigger);
            let token = token_for_trigger.clone();
            let loop_slot = Arc::clone(&loop_for_trigger);
            Box::pin(async move {
                if !job.payload.kind.is_empty() && job.payload.kind != "agent_turn" {
                    return Ok(String::new());
                }
                let channel = job.payload.channel.trim();
                let to = job.payload.to.trim();
                if job.payload.deliver && !channel.is_empty() && !to.is_empty() {
                    // Delivered jobs become synthetic inbound messages so
                    // the reply reaches the configured chat.
                    bus.publish_inbound(
                        &token,
                        InboundMessage {
                            channel: channel.to_string(),
                            sender_id: format!("cron:{}", job.id),
                            chat_id: to.to_string(),
                            content: job.payload.message.clone(),
                            session_key: format!("{channel}:{to}"),
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                    return Ok(String::new());
                }
                // Silent jobs run directly against a cron session.
                let Some(agent) = loop_slot.get() else {
                    return Err("agent loop not ready".to_string());
                };
                agent
                    .process_direct(&job.payload.message, "cron", "cron", &job.id)
                    .await
            })
        });
        Some(Arc::new(CronService::new(
            paths::cron_store_path(),
            Some(trigger),
        )))
    } else {
        None
    };

    let mut tools = ToolRegistry::new(workspace.clone(), cfg.agent.restrict_to_workspace)
        .with_bus(Arc::clone(&bus), token.clone())
        .with_skills(skill_reader(&workspace));
    tools.exec_timeout = std::time::Duration::from_secs(cfg.tools.exec_timeout_sec);
    tools.brave_api_key = cfg.tools.web.brave_api_key.clone();
    tools.web_allowed_domains = cfg.tools.web.allowed_domains.clone();
    tools.web_blocked_domains = cfg.tools.web.blocked_domains.clone();
    tools.web_fetch_timeout = std::time::Duration::from_secs(cfg.tools.web.fetch_timeout_sec);
    tools.web_fetch_max_response = cfg.tools.web.max_response_bytes;
    let tools = match &cron {
        Some(cron) => tools.with_cron(Arc::clone(cron)),
        None => tools,
    };
    let tools = Arc::new(tools);

    let agent = AgentLoop::new(AgentLoopOptions {
        llm,
        tools,
        bus: Arc::clone(&bus),
        sessions,
        workspace: workspace.clone(),
        max_iters: opts.max_iters,
        history_window: cfg.agent.history_window,
        memory_window: cfg.agent.memory_window,
    });
    let _ = loop_slot.set(Arc::clone(&agent));

    let subagents = SubagentManager::new(Arc::clone(&agent), Arc::clone(&bus), token.clone());
    agent.set_spawn(subagents.spawner());

    if let Some(cron) = &cron {
        cron.start(token.clone());
        info!(jobs = cron.list(true).len(), "cron service started");
    }

    let heartbeat_agent = Arc::clone(&agent);
    let heartbeat = crate::heartbeat::Heartbeat::new(
        workspace.clone(),
        cfg.heartbeat.enabled,
        cfg.heartbeat.interval_sec,
        Arc::new(move |prompt: String| {
            let agent = Arc::clone(&heartbeat_agent);
            Box::pin(async move {
                agent
                    .process_direct(&prompt, "heartbeat", "cli", "heartbeat")
                    .await
            })
        }),
    );
    heartbeat.start(token.clone());

    let mut manager = ChannelManager::new(Arc::clone(&bus));
    if cfg.channels.discord.enabled {
        manager.add(Arc::new(DiscordChannel::new(
            cfg.channels.discord.clone(),
            Arc::clone(&bus),
        )));
    }
    let slack = if cfg.channels.slack.enabled {
        let slack = Arc::new(SlackChannel::new(
            cfg.channels.slack.clone(),
            Arc::clone(&bus),
        ));
        manager.add(Arc::clone(&slack) as Arc<dyn crate::channels::Channel>);
        Some(slack)
    } else {
        None
    };
    if cfg.channels.telegram.enabled {
        manager.add(Arc::new(TelegramChannel::new(
            cfg.channels.telegram.clone(),
            Arc::clone(&bus),
        )));
    }
    manager.start_all(token.clone());

    if let Some(slack) = slack {
        let listen = opts
            .listen
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| cfg.gateway.listen.clone());
        let router = slack.router();
        let server_token = token.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&listen).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(addr = %listen, error = %e, "slack events server bind failed");
                    return;
                }
            };
            info!(addr = %listen, "slack events server listening");
            let shutdown = async move { server_token.cancelled().await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "slack events server exited");
            }
        });
    }

    let loop_token = token.clone();
    let loop_task = tokio::spawn(Arc::clone(&agent).run(loop_token));

    info!(
        workspace = %workspace.display(),
        sessions = %paths::sessions_dir().display(),
        "gateway running, stop with Ctrl+C"
    );
    token.cancelled().await;

    manager.stop_all().await;
    let _ = loop_task.await;
    info!("gateway stopped");
    Ok(())
}
