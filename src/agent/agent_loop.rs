//! The agent reasoning loop.
//!
//! One consumer task drains the inbound queue and processes messages
//! sequentially: resolve the session, short-circuit slash commands,
//! assemble the prompt (workspace context + history tail + the new
//! message), then iterate LLM calls and tool executions until the model
//! answers in plain text or the iteration cap is hit. Replies go out on
//! the bus; consolidation runs on a detached task so it never delays the
//! reply.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::commands::handle_slash_command;
use crate::agent::consolidation::{maybe_consolidate_session, summarize_with_llm};
use crate::agent::context::build_system_prompt;
use crate::bus::{Bus, Delivery, InboundMessage, OutboundMessage};
use crate::error::LlmError;
use crate::llm::{ChatMessage, LlmClient};
use crate::session::{Message, Role, Session, SessionStore};
use crate::tools::{SpawnFn, ToolCallContext, ToolRegistry};

const TOOL_OUTPUT_MAX: usize = 64 << 10;

pub struct AgentLoopOptions {
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<ToolRegistry>,
    pub bus: Arc<Bus>,
    pub sessions: Arc<SessionStore>,
    pub workspace: PathBuf,
    pub max_iters: usize,
    pub history_window: usize,
    pub memory_window: usize,
}

pub struct AgentLoop {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    bus: Arc<Bus>,
    sessions: Arc<SessionStore>,
    workspace: PathBuf,
    max_iters: usize,
    history_window: usize,
    memory_window: usize,
}

impl AgentLoop {
    pub fn new(opts: AgentLoopOptions) -> Arc<Self> {
        Arc::new(Self {
            llm: opts.llm,
            tools: opts.tools,
            bus: opts.bus,
            sessions: opts.sessions,
            workspace: opts.workspace,
            max_iters: if opts.max_iters == 0 { 20 } else { opts.max_iters },
            history_window: opts.history_window,
            memory_window: opts.memory_window,
        })
    }

    /// Inject the sub-agent spawner (wired after construction because the
    /// spawner needs the loop itself).
    pub fn set_spawn(&self, spawn: SpawnFn) {
        self.tools.set_spawn(spawn);
    }

    /// Consume inbound messages until the token fires.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!("agent loop started");
        loop {
            let msg = match self.bus.consume_inbound(&token).await {
                Ok(msg) => msg,
                Err(_) => {
                    info!("agent loop stopped");
                    return;
                }
            };
            self.process_inbound(&token, msg).await;
        }
    }

    async fn process_inbound(self: &Arc<Self>, token: &CancellationToken, msg: InboundMessage) {
        let session_key = if msg.session_key.trim().is_empty() {
            format!("{}:{}", msg.channel, msg.chat_id)
        } else {
            msg.session_key.clone()
        };
        debug!(session = %session_key, channel = %msg.channel, "processing inbound message");

        let session = match self.sessions.get_or_create(&session_key) {
            Ok(session) => session,
            Err(e) => {
                error!(session = %session_key, error = %e, "cannot load session");
                return;
            }
        };

        let reply_delivery = Delivery {
            reply_to_id: msg.delivery.message_id.clone(),
            thread_id: msg.delivery.thread_id.clone(),
            ..Default::default()
        };

        if msg.content.trim().starts_with('/') {
            if let Some(reply) = handle_slash_command(&session, &msg.content) {
                if let Err(e) = self.sessions.save(&session) {
                    warn!(error = %e, "save after slash command");
                }
                self.publish_reply(token, &msg, reply, reply_delivery).await;
                return;
            }
        }

        let ctx = ToolCallContext {
            channel: msg.channel.clone(),
            chat_id: msg.chat_id.clone(),
            session_key: session_key.clone(),
        };
        let reply = match self.run_turn(&session, &msg.content, &ctx).await {
            Ok(reply) => reply,
            Err(e) => {
                // The turn is aborted but the user message stays in the
                // session; the failure is shown in-channel.
                warn!(session = %session_key, error = %e, "llm turn failed");
                format!("error: {e}")
            }
        };

        self.spawn_consolidation(Arc::clone(&session));
        if let Err(e) = self.sessions.save(&session) {
            warn!(session = %session_key, error = %e, "session save failed");
        }
        self.publish_reply(token, &msg, reply, reply_delivery).await;
    }

    async fn publish_reply(
        &self,
        token: &CancellationToken,
        inbound: &InboundMessage,
        content: String,
        delivery: Delivery,
    ) {
        if content.trim().is_empty() {
            return;
        }
        let outbound = OutboundMessage {
            channel: inbound.channel.clone(),
            chat_id: inbound.chat_id.clone(),
            content,
            reply_to: String::new(),
            delivery,
        };
        if self.bus.publish_outbound(token, outbound).await.is_err() {
            debug!("outbound publish cancelled");
        }
    }

    /// Run one reasoning turn outside the bus: heartbeat, CLI, sub-agents.
    pub async fn process_direct(
        self: &Arc<Self>,
        prompt: &str,
        sender: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<String, String> {
        let session_key = format!("{channel}:{chat_id}");
        debug!(session = %session_key, sender, "direct turn");
        let session = self
            .sessions
            .get_or_create(&session_key)
            .map_err(|e| e.to_string())?;
        let ctx = ToolCallContext {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            session_key,
        };
        let result = self
            .run_turn(&session, prompt, &ctx)
            .await
            .map_err(|e| e.to_string());
        self.spawn_consolidation(Arc::clone(&session));
        if let Err(e) = self.sessions.save(&session) {
            warn!(error = %e, "session save failed");
        }
        result
    }

    /// The tool loop for one user message.
    async fn run_turn(
        &self,
        session: &Session,
        content: &str,
        ctx: &ToolCallContext,
    ) -> Result<String, LlmError> {
        session.add(Role::User, content);

        let mut messages = vec![ChatMessage::system(build_system_prompt(&self.workspace))];
        for msg in session.history(self.history_window) {
            messages.push(to_chat_message(&msg));
        }

        let tool_defs = self.tools.definitions();
        let mut turn_tools: Vec<String> = Vec::new();

        for _ in 0..self.max_iters {
            let result = self.llm.chat(&messages, &tool_defs).await?;

            if !result.has_tool_calls() {
                session.add_with_tools(Role::Assistant, &result.content, &turn_tools);
                return Ok(result.content);
            }

            for call in &result.tool_calls {
                turn_tools.push(call.name.clone());
            }
            session.add_assistant_with_calls(
                result.content.clone(),
                result.tool_calls.clone(),
                &turn_tools,
            );
            messages.push(ChatMessage::assistant_with_tool_calls(
                result.content.clone(),
                result.tool_calls.clone(),
            ));

            for call in result.tool_calls {
                let args = call.arguments.to_string();
                let output = match self.tools.execute(ctx, &call.name, &args).await {
                    Ok(output) => output,
                    // Tool failures feed back to the model as content.
                    Err(e) => format!("Error: {e}"),
                };
                let output = truncate(&output, TOOL_OUTPUT_MAX);
                debug!(tool = %call.name, bytes = output.len(), "tool executed");
                session.add_tool_result(&call.id, &call.name, &output);
                messages.push(ChatMessage::tool_result(&call.id, &call.name, &output));
            }
        }

        let stopped = format!("stopped after {} tool iterations", self.max_iters);
        session.add_with_tools(Role::Assistant, &stopped, &turn_tools);
        Ok(stopped)
    }

    /// Kick off consolidation on a detached task when the session is over
    /// the window; the user reply is never delayed by it.
    fn spawn_consolidation(self: &Arc<Self>, session: Arc<Session>) {
        if !session.needs_consolidation(self.memory_window) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let llm = Arc::clone(&this.llm);
            let result = maybe_consolidate_session(
                &this.workspace,
                &session,
                this.memory_window,
                move |memory, conversation| summarize_with_llm(llm, memory, conversation),
            )
            .await;
            match result {
                Ok(true) => {
                    if let Err(e) = this.sessions.save(&session) {
                        warn!(error = %e, "save after consolidation");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "consolidation failed"),
            }
        });
    }
}

fn to_chat_message(msg: &Message) -> ChatMessage {
    ChatMessage {
        role: msg.role,
        content: msg.content.clone(),
        tool_call_id: msg.tool_call_id.clone(),
        name: msg.name.clone(),
        tool_calls: msg.tool_calls.clone(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n(truncated)", &s[..end])
}
