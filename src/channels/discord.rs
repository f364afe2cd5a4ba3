//! Discord channel via the serenity gateway client.
//!
//! One inbound message per non-bot message from an allowed sender. Send
//! posts through the REST API, optionally as a reply, chunked to Discord's
//! message length limit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serenity::all::{
    ChannelId, Context, CreateMessage, EventHandler, GatewayIntents, Message, MessageId,
    MessageReference, Ready,
};
use serenity::http::Http;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::{Bus, Delivery, InboundMessage, OutboundMessage};
use crate::channels::{AllowList, Channel};
use crate::config::DiscordConfig;
use crate::error::ChannelError;

const MESSAGE_CHUNK: usize = 2000;

pub struct DiscordChannel {
    cfg: DiscordConfig,
    bus: Arc<Bus>,
    allow: AllowList,
    http: Arc<Http>,
    running: AtomicBool,
    stop_token: std::sync::Mutex<Option<CancellationToken>>,
}

impl DiscordChannel {
    pub fn new(cfg: DiscordConfig, bus: Arc<Bus>) -> Self {
        let http = Arc::new(Http::new(cfg.token.trim()));
        Self {
            allow: AllowList::new(cfg.allow_from.clone()),
            bus,
            http,
            running: AtomicBool::new(false),
            stop_token: std::sync::Mutex::new(None),
            cfg,
        }
    }
}

struct Handler {
    bus: Arc<Bus>,
    allow: AllowList,
    token: CancellationToken,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(user = %ready.user.name, "discord connected");
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let content = msg.content.trim();
        if content.is_empty() {
            return;
        }
        let sender_id = format!("{}|{}", msg.author.id, msg.author.name);
        if !self.allow.allowed(&sender_id) {
            debug!(sender = %sender_id, "discord sender not allowed");
            return;
        }
        let chat_id = msg.channel_id.to_string();
        let inbound = InboundMessage {
            channel: "discord".into(),
            sender_id,
            chat_id: chat_id.clone(),
            content: content.to_string(),
            attachments: Vec::new(),
            session_key: format!("discord:{chat_id}"),
            delivery: Delivery {
                message_id: msg.id.to_string(),
                reply_to_id: msg
                    .referenced_message
                    .as_ref()
                    .map(|r| r.id.to_string())
                    .unwrap_or_default(),
                thread_id: String::new(),
                is_direct: msg.guild_id.is_none(),
            },
        };
        if self.bus.publish_inbound(&self.token, inbound).await.is_err() {
            debug!("discord inbound publish cancelled");
        }
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self, token: CancellationToken) -> Result<(), ChannelError> {
        if self.cfg.token.trim().is_empty() {
            return Err(ChannelError::NotConfigured {
                name: "discord".into(),
                reason: "token is empty".into(),
            });
        }
        if let Ok(mut slot) = self.stop_token.lock() {
            *slot = Some(token.clone());
        }

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;
        let handler = Handler {
            bus: Arc::clone(&self.bus),
            allow: self.allow.clone(),
            token: token.clone(),
        };
        let mut client = serenity::Client::builder(self.cfg.token.trim(), intents)
            .event_handler(handler)
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "discord".into(),
                reason: e.to_string(),
            })?;

        self.running.store(true, Ordering::SeqCst);
        let shard_manager = client.shard_manager.clone();
        let result = tokio::select! {
            res = client.start() => res.map_err(|e| ChannelError::StartupFailed {
                name: "discord".into(),
                reason: e.to_string(),
            }),
            _ = token.cancelled() => {
                shard_manager.shutdown_all().await;
                Err(ChannelError::Cancelled)
            }
        };
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = &result {
            if !matches!(e, ChannelError::Cancelled) {
                error!(error = %e, "discord gateway exited");
            }
        }
        result
    }

    async fn stop(&self) {
        if let Ok(mut slot) = self.stop_token.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        let chat_id: u64 = msg
            .chat_id
            .trim()
            .parse()
            .map_err(|_| ChannelError::SendFailed {
                name: "discord".into(),
                reason: format!("invalid chat_id: {:?}", msg.chat_id),
            })?;
        let content = msg.content.trim();
        if content.is_empty() {
            return Ok(());
        }

        let reply_to = [msg.delivery.reply_to_id.trim(), msg.reply_to.trim()]
            .into_iter()
            .find_map(|c| c.parse::<u64>().ok().filter(|&n| n > 0));

        let channel_id = ChannelId::new(chat_id);
        let mut first = true;
        for chunk in chunk_message(content, MESSAGE_CHUNK) {
            let mut builder = CreateMessage::new().content(chunk);
            if first {
                if let Some(reply_id) = reply_to {
                    builder = builder.reference_message(MessageReference::from((
                        channel_id,
                        MessageId::new(reply_id),
                    )));
                }
                first = false;
            }
            channel_id
                .send_message(&self.http, builder)
                .await
                .map_err(|e| ChannelError::SendFailed {
                    name: "discord".into(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

/// Split on char boundaries into Discord-sized chunks.
fn chunk_message(content: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for c in content.chars() {
        if current.len() + c.len_utf8() > limit {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_respects_limit_and_boundaries() {
        let text = "ab".repeat(1500);
        let chunks = chunk_message(&text, MESSAGE_CHUNK);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() <= MESSAGE_CHUNK));
        assert_eq!(chunks.concat(), text);

        let short = chunk_message("hello", MESSAGE_CHUNK);
        assert_eq!(short, vec!["hello".to_string()]);

        // Multi-byte characters never split mid-char.
        let emoji = "🦀".repeat(600);
        let chunks = chunk_message(&emoji, MESSAGE_CHUNK);
        assert!(chunks.iter().all(|c| c.len() <= MESSAGE_CHUNK));
        assert_eq!(chunks.concat(), emoji);
    }
}
