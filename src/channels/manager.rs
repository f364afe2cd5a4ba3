//! Channel manager: lifecycle plus outbound routing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::Bus;
use crate::channels::Channel;

pub struct ChannelManager {
    bus: Arc<Bus>,
    channels: HashMap<String, Arc<dyn Channel>>,
    tasks: Vec<JoinHandle<()>>,
    token: Option<CancellationToken>,
}

impl ChannelManager {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self {
            bus,
            channels: HashMap::new(),
            tasks: Vec::new(),
            token: None,
        }
    }

    pub fn add(&mut self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        info!(channel = %name, "registering channel");
        self.channels.insert(name, channel);
    }

    pub fn channel(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(name).cloned()
    }

    pub fn running_states(&self) -> Vec<(String, bool)> {
        self.channels
            .iter()
            .map(|(name, ch)| (name.clone(), ch.is_running()))
            .collect()
    }

    /// Start every registered channel on its own task and launch the
    /// outbound dispatch task. A channel failing to start is logged and
    /// marked not running; the rest keep serving.
    pub fn start_all(&mut self, token: CancellationToken) {
        let child = token.child_token();
        self.token = Some(child.clone());

        for (name, channel) in &self.channels {
            let name = name.clone();
            let channel = Arc::clone(channel);
            let token = child.clone();
            self.tasks.push(tokio::spawn(async move {
                info!(channel = %name, "starting channel");
                match channel.start(token).await {
                    Ok(()) | Err(crate::error::ChannelError::Cancelled) => {
                        info!(channel = %name, "channel stopped")
                    }
                    Err(e) => error!(channel = %name, error = %e, "channel exited"),
                }
            }));
        }

        let bus = Arc::clone(&self.bus);
        let channels = self.channels.clone();
        let token = child.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let msg = match bus.consume_outbound(&token).await {
                    Ok(msg) => msg,
                    Err(_) => return,
                };
                let Some(channel) = channels.get(&msg.channel) else {
                    warn!(channel = %msg.channel, "outbound message for unknown channel");
                    continue;
                };
                // Send failure is never fatal to the dispatch loop.
                if let Err(e) = channel.send(&msg).await {
                    error!(channel = %msg.channel, error = %e, "outbound send failed");
                }
            }
        }));
    }

    /// Cancel every channel task and wait for the channels to stop.
    pub async fn stop_all(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        for channel in self.channels.values() {
            channel.stop().await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
