//! Tool registry: what the model may call and how calls are executed.
//!
//! Each tool is a (name, JSON schema, dispatch) triple. `definitions()`
//! advertises only the tools whose capability is actually configured:
//! a missing Brave key hides `web_search`, no bus hides `message`, and so
//! on. `execute` parses the model's raw JSON arguments and dispatches;
//! unknown or unconfigured tools fail with a descriptive error.

mod exec;
mod fs_ops;
mod html;
mod web_fetch;
mod web_search;

pub use exec::guard_exec_command;
pub use html::{extract_html_text, looks_like_html};
pub use web_fetch::{allow_host_by_policy, domain_matches_pattern};
pub use web_search::format_brave_results;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, OutboundMessage};
use crate::cron;
use crate::error::ToolError;
use crate::llm::ToolDefinition;

/// Who a tool call is running on behalf of.
#[derive(Debug, Clone, Default)]
pub struct ToolCallContext {
    pub channel: String,
    pub chat_id: String,
    pub session_key: String,
}

/// A request handed to the sub-agent spawner.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task: String,
    pub label: String,
    pub origin_channel: String,
    pub origin_chat_id: String,
}

/// Callback that launches a sub-agent and returns its id.
pub type SpawnFn =
    Arc<dyn Fn(SpawnRequest) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// Callback that resolves a named skill document.
pub type SkillReader = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// The tool registry. Policy fields are immutable after construction;
/// capabilities are injected with the `with_*` builders (and `set_spawn`,
/// which is wired after the agent loop exists).
pub struct ToolRegistry {
    pub workspace_dir: PathBuf,
    pub restrict_to_workspace: bool,
    pub exec_timeout: Duration,
    pub brave_api_key: String,
    pub web_allowed_domains: Option<Vec<String>>,
    pub web_blocked_domains: Vec<String>,
    pub web_fetch_timeout: Duration,
    pub web_fetch_max_response: u64,

    bus: Option<Arc<Bus>>,
    token: CancellationToken,
    cron: Option<Arc<cron::CronService>>,
    spawn: RwLock<Option<SpawnFn>>,
    skills: Option<SkillReader>,
}

impl ToolRegistry {
    pub fn new(workspace_dir: PathBuf, restrict_to_workspace: bool) -> Self {
        Self {
            workspace_dir,
            restrict_to_workspace,
            exec_timeout: Duration::from_secs(60),
            brave_api_key: String::new(),
            web_allowed_domains: None,
            web_blocked_domains: Vec::new(),
            web_fetch_timeout: Duration::from_secs(30),
            web_fetch_max_response: 4 << 20,
            bus: None,
            token: CancellationToken::new(),
            cron: None,
            spawn: RwLock::new(None),
            skills: None,
        }
    }

    pub fn with_bus(mut self, bus: Arc<Bus>, token: CancellationToken) -> Self {
        self.bus = Some(bus);
        self.token = token;
        self
    }

    pub fn with_cron(mut self, cron: Arc<cron::CronService>) -> Self {
        self.cron = Some(cron);
        self
    }

    pub fn with_skills(mut self, reader: SkillReader) -> Self {
        self.skills = Some(reader);
        self
    }

    /// Inject the sub-agent spawner after construction.
    pub fn set_spawn(&self, spawn: SpawnFn) {
        if let Ok(mut slot) = self.spawn.write() {
            *slot = Some(spawn);
        }
    }

    fn spawn_fn(&self) -> Option<SpawnFn> {
        self.spawn.read().ok().and_then(|s| s.clone())
    }

    /// Tool definitions available under the current capabilities.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = vec![
            def(
                "read_file",
                "Read a UTF-8 text file. Large files are truncated.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "File path, absolute or relative to the workspace"}
                    },
                    "required": ["path"]
                }),
            ),
            def(
                "write_file",
                "Write a file, creating parent directories as needed.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["path", "content"]
                }),
            ),
            def(
                "edit_file",
                "Edit a file by line range. 1-based lines; endLine < startLine inserts before startLine, otherwise [startLine..endLine] is replaced inclusively.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "startLine": {"type": "integer"},
                        "endLine": {"type": "integer"},
                        "newText": {"type": "string"}
                    },
                    "required": ["path", "startLine", "endLine", "newText"]
                }),
            ),
            def(
                "edit_file_replace",
                "Replace one unique occurrence of oldText with newText.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "oldText": {"type": "string"},
                        "newText": {"type": "string"}
                    },
                    "required": ["path", "oldText", "newText"]
                }),
            ),
            def(
                "list_dir",
                "List a directory. Recursive listings emit paths relative to the root with a trailing separator on directories.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "recursive": {"type": "boolean"},
                        "maxEntries": {"type": "integer", "description": "Entry cap, default 200"}
                    },
                    "required": ["path"]
                }),
            ),
            def(
                "exec",
                "Run a shell command in the workspace. Output is captured and truncated; unsafe constructs are blocked.",
                json!({
                    "type": "object",
                    "properties": {
                        "command": {"type": "string"}
                    },
                    "required": ["command"]
                }),
            ),
            def(
                "web_fetch",
                "Fetch an http(s) URL and return a JSON envelope with extracted text.",
                json!({
                    "type": "object",
                    "properties": {
                        "url": {"type": "string"},
                        "extractMode": {"type": "string", "enum": ["markdown", "text"]},
                        "maxChars": {"type": "integer"}
                    },
                    "required": ["url"]
                }),
            ),
        ];

        if !self.brave_api_key.trim().is_empty() {
            defs.push(def(
                "web_search",
                "Search the web. Returns numbered results with title, url and description.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "count": {"type": "integer", "description": "1-10, default 5"}
                    },
                    "required": ["query"]
                }),
            ));
        }
        if self.bus.is_some() {
            defs.push(def(
                "message",
                "Send a message to a chat on a connected channel.",
                json!({
                    "type": "object",
                    "properties": {
                        "channel": {"type": "string"},
                        "chatID": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["channel", "chatID", "content"]
                }),
            ));
        }
        if self.spawn_fn().is_some() {
            defs.push(def(
                "spawn",
                "Delegate a task to a background sub-agent. Returns the new agent's id.",
                json!({
                    "type": "object",
                    "properties": {
                        "task": {"type": "string"},
                        "label": {"type": "string"},
                        "originChannel": {"type": "string"},
                        "originChatID": {"type": "string"}
                    },
                    "required": ["task"]
                }),
            ));
        }
        if self.cron.is_some() {
            defs.push(def(
                "cron",
                "Manage scheduled jobs: add, remove, toggle or list.",
                json!({
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["add", "remove", "toggle", "list"]},
                        "name": {"type": "string"},
                        "schedule": {
                            "type": "object",
                            "properties": {
                                "kind": {"type": "string", "enum": ["every", "cron", "at"]},
                                "everyMS": {"type": "integer"},
                                "expr": {"type": "string"},
                                "atMS": {"type": "integer"}
                            }
                        },
                        "message": {"type": "string"},
                        "deliver": {"type": "boolean"},
                        "channel": {"type": "string"},
                        "to": {"type": "string"},
                        "id": {"type": "string"},
                        "disable": {"type": "boolean"},
                        "includeDisabled": {"type": "boolean"}
                    },
                    "required": ["action"]
                }),
            ));
        }
        if self.skills.is_some() {
            defs.push(def(
                "read_skill",
                "Read a named skill document.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"}
                    },
                    "required": ["name"]
                }),
            ));
        }
        defs
    }

    /// Execute a tool call. The returned string is what the model sees.
    pub async fn execute(
        &self,
        ctx: &ToolCallContext,
        name: &str,
        raw_args: &str,
    ) -> Result<String, ToolError> {
        let args: serde_json::Value = if raw_args.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(raw_args)
                .map_err(|e| ToolError::InvalidParameters(format!("parse arguments: {e}")))?
        };

        match name {
            "read_file" => {
                let p: PathArgs = parse(args)?;
                self.read_file(&p.path)
            }
            "write_file" => {
                let p: WriteArgs = parse(args)?;
                self.write_file(&p.path, &p.content)
            }
            "edit_file" => {
                let p: EditArgs = parse(args)?;
                self.edit_file(&p.path, p.start_line, p.end_line, &p.new_text)
            }
            "edit_file_replace" => {
                let p: EditReplaceArgs = parse(args)?;
                self.edit_file_replace(&p.path, &p.old_text, &p.new_text)
            }
            "list_dir" => {
                let p: ListDirArgs = parse(args)?;
                self.list_dir(&p.path, p.recursive, p.max_entries)
            }
            "exec" => {
                let p: ExecArgs = parse(args)?;
                self.exec(&p.command).await
            }
            "web_fetch" => {
                let p: WebFetchArgs = parse(args)?;
                self.web_fetch(&p.url, &p.extract_mode, p.max_chars).await
            }
            "web_search" => {
                if self.brave_api_key.trim().is_empty() {
                    return Err(ToolError::Unknown("web_search is not configured".into()));
                }
                let p: WebSearchArgs = parse(args)?;
                self.web_search(&p.query, p.count).await
            }
            "message" => {
                let Some(bus) = &self.bus else {
                    return Err(ToolError::Unknown("message is not configured".into()));
                };
                let p: MessageArgs = parse(args)?;
                if p.channel.trim().is_empty() || p.chat_id.trim().is_empty() {
                    return Err(ToolError::InvalidParameters(
                        "channel and chatID are required".into(),
                    ));
                }
                bus.publish_outbound(
                    &self.token,
                    OutboundMessage {
                        channel: p.channel.trim().to_string(),
                        chat_id: p.chat_id.trim().to_string(),
                        content: p.content,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
                Ok("message queued".into())
            }
            "spawn" => {
                let Some(spawn) = self.spawn_fn() else {
                    return Err(ToolError::Unknown("spawn is not configured".into()));
                };
                let p: SpawnArgs = parse(args)?;
                if p.task.trim().is_empty() {
                    return Err(ToolError::InvalidParameters("task is empty".into()));
                }
                let request = SpawnRequest {
                    task: p.task.trim().to_string(),
                    label: p.label.trim().to_string(),
                    origin_channel: if p.origin_channel.trim().is_empty() {
                        ctx.channel.clone()
                    } else {
                        p.origin_channel.trim().to_string()
                    },
                    origin_chat_id: if p.origin_chat_id.trim().is_empty() {
                        ctx.chat_id.clone()
                    } else {
                        p.origin_chat_id.trim().to_string()
                    },
                };
                spawn(request).await.map_err(ToolError::ExecutionFailed)
            }
            "cron" => {
                let Some(cron) = &self.cron else {
                    return Err(ToolError::Unknown("cron is not configured".into()));
                };
                let p: CronArgs = parse(args)?;
                self.cron_action(cron, p)
            }
            "read_skill" => {
                let Some(skills) = &self.skills else {
                    return Err(ToolError::Unknown("skills not configured".into()));
                };
                let p: SkillArgs = parse(args)?;
                let name = p.name.trim();
                if name.is_empty() {
                    return Err(ToolError::InvalidParameters("name is empty".into()));
                }
                skills(name).ok_or_else(|| {
                    ToolError::ExecutionFailed(format!("skill not found: {name}"))
                })
            }
            other => Err(ToolError::Unknown(format!("unknown tool: {other}"))),
        }
    }

    fn cron_action(
        &self,
        cron: &Arc<cron::CronService>,
        p: CronArgs,
    ) -> Result<String, ToolError> {
        match p.action.as_str() {
            "add" => {
                let schedule = p.schedule.ok_or_else(|| {
                    ToolError::InvalidParameters("schedule is required for add".into())
                })?;
                let job = cron
                    .add(
                        &p.name,
                        schedule,
                        cron::Payload {
                            kind: "agent_turn".into(),
                            message: p.message,
                            deliver: p.deliver,
                            channel: p.channel,
                            to: p.to,
                        },
                    )
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
                Ok(format!("added job {} ({})", job.id, job.name))
            }
            "remove" => {
                if cron.remove(&p.id).map_err(|e| ToolError::ExecutionFailed(e.to_string()))? {
                    Ok(format!("removed job {}", p.id))
                } else {
                    Err(ToolError::ExecutionFailed(format!("job not found: {}", p.id)))
                }
            }
            "toggle" => {
                if cron
                    .toggle(&p.id, p.disable)
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
                {
                    Ok(format!(
                        "{} job {}",
                        if p.disable { "disabled" } else { "enabled" },
                        p.id
                    ))
                } else {
                    Err(ToolError::ExecutionFailed(format!("job not found: {}", p.id)))
                }
            }
            "list" => {
                let jobs = cron.list(p.include_disabled);
                serde_json::to_string_pretty(&jobs)
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))
            }
            other => Err(ToolError::InvalidParameters(format!(
                "unknown cron action: {other}"
            ))),
        }
    }
}

fn def(name: &str, description: &str, parameters: serde_json::Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    }
}

fn parse<T: for<'de> Deserialize<'de>>(args: serde_json::Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidParameters(e.to_string()))
}

#[derive(Deserialize)]
struct PathArgs {
    path: String,
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditArgs {
    path: String,
    start_line: i64,
    end_line: i64,
    #[serde(default)]
    new_text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditReplaceArgs {
    path: String,
    old_text: String,
    #[serde(default)]
    new_text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDirArgs {
    path: String,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    max_entries: usize,
}

#[derive(Deserialize)]
struct ExecArgs {
    command: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebFetchArgs {
    url: String,
    #[serde(default)]
    extract_mode: String,
    #[serde(default)]
    max_chars: usize,
}

#[derive(Deserialize)]
struct WebSearchArgs {
    query: String,
    #[serde(default)]
    count: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageArgs {
    channel: String,
    #[serde(rename = "chatID")]
    chat_id: String,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnArgs {
    task: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    origin_channel: String,
    #[serde(default, rename = "originChatID")]
    origin_chat_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CronArgs {
    action: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    schedule: Option<cron::Schedule>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    deliver: bool,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    disable: bool,
    #[serde(default)]
    include_disabled: bool,
}

#[derive(Deserialize)]
struct SkillArgs {
    name: String,
}
