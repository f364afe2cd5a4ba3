//! Sub-agent delegation.
//!
//! `spawn` runs a task on a detached agent turn with its own session
//! (`agent:<id>`), then announces the outcome back to the originating
//! channel. The returned id lets the model refer to the running agent.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::agent_loop::AgentLoop;
use crate::bus::{Bus, OutboundMessage};
use crate::tools::{SpawnFn, SpawnRequest};

pub struct SubagentManager {
    agent: Arc<AgentLoop>,
    bus: Arc<Bus>,
    token: CancellationToken,
}

impl SubagentManager {
    pub fn new(agent: Arc<AgentLoop>, bus: Arc<Bus>, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self { agent, bus, token })
    }

    /// A `SpawnFn` suitable for `ToolRegistry::set_spawn`.
    pub fn spawner(self: &Arc<Self>) -> SpawnFn {
        let manager = Arc::clone(self);
        Arc::new(move |request: SpawnRequest| {
            let manager = Arc::clone(&manager);
            Box::pin(async move { Ok(manager.spawn(request)) })
        })
    }

    /// Launch the sub-agent task and return its id immediately.
    pub fn spawn(self: &Arc<Self>, request: SpawnRequest) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let label = if request.label.is_empty() {
            id.clone()
        } else {
            request.label.clone()
        };
        info!(id = %id, label = %label, "spawning sub-agent");

        let manager = Arc::clone(self);
        let agent_id = id.clone();
        tokio::spawn(async move {
            let result = manager
                .agent
                .process_direct(&request.task, "subagent", "agent", &agent_id)
                .await;

            let summary = match result {
                Ok(reply) => format!("Sub-agent [{label}] finished:\n{reply}"),
                Err(e) => {
                    warn!(id = %agent_id, error = %e, "sub-agent failed");
                    format!("Sub-agent [{label}] failed: {e}")
                }
            };

            if request.origin_channel.is_empty() || request.origin_chat_id.is_empty() {
                return;
            }
            let outbound = OutboundMessage {
                channel: request.origin_channel,
                chat_id: request.origin_chat_id,
                content: summary,
                ..Default::default()
            };
            if manager
                .bus
                .publish_outbound(&manager.token, outbound)
                .await
                .is_err()
            {
                warn!(id = %agent_id, "sub-agent result dropped on shutdown");
            }
        });
        id
    }
}
