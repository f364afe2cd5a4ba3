//! The reasoning core: inbound consumption, the tool loop, session
//! consolidation and sub-agent delegation.

mod agent_loop;
mod commands;
mod consolidation;
mod context;
mod subagent;

pub use agent_loop::{AgentLoop, AgentLoopOptions};
pub use commands::{handle_slash_command, normalize_slash_command};
pub use consolidation::{maybe_consolidate_session, summarize_with_llm};
pub use context::build_system_prompt;
pub use subagent::SubagentManager;
