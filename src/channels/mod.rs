//! Channel abstraction and concrete chat adapters.
//!
//! A channel produces inbound messages onto the bus and delivers outbound
//! messages on request. `start` blocks until the cancellation token fires;
//! the manager runs each channel on its own task and routes outbound
//! messages by name.

mod discord;
mod format;
mod manager;
mod slack;
mod telegram;

pub use discord::DiscordChannel;
pub use format::markdown_to_telegram_html;
pub use manager::ChannelManager;
pub use slack::SlackChannel;
pub use telegram::TelegramChannel;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bus::OutboundMessage;
use crate::error::ChannelError;

/// A chat channel adapter.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Routing name, e.g. "telegram".
    fn name(&self) -> &str;

    fn is_running(&self) -> bool;

    /// Run the channel until the token is cancelled.
    async fn start(&self, token: CancellationToken) -> Result<(), ChannelError>;

    async fn stop(&self);

    /// Deliver one outbound message.
    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError>;
}

/// Sender filter: an empty list allows everyone.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    pub allow_from: Vec<String>,
}

impl AllowList {
    pub fn new(allow_from: Vec<String>) -> Self {
        Self { allow_from }
    }

    /// Whether a sender id passes the filter. Compound ids of the form
    /// `"<id>|<alt>"` pass when either side matches.
    pub fn allowed(&self, sender_id: &str) -> bool {
        if self.allow_from.is_empty() {
            return true;
        }
        let sender_id = sender_id.trim();
        if sender_id.is_empty() {
            return false;
        }
        if self.allow_from.iter().any(|v| v == sender_id) {
            return true;
        }
        if sender_id.contains('|') {
            for part in sender_id.split('|') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                if self.allow_from.iter().any(|v| v == part) {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_allows_everyone() {
        let list = AllowList::default();
        assert!(list.allowed("anyone"));
        assert!(list.allowed(""));
    }

    #[test]
    fn exact_match_required_when_configured() {
        let list = AllowList::new(vec!["100".into(), "alice".into()]);
        assert!(list.allowed("100"));
        assert!(list.allowed("alice"));
        assert!(!list.allowed("101"));
        assert!(!list.allowed(""));
    }

    #[test]
    fn compound_ids_match_either_side() {
        let list = AllowList::new(vec!["alice".into()]);
        assert!(list.allowed("100|alice"));
        assert!(list.allowed("alice|x"));
        assert!(!list.allowed("100|bob"));
        assert!(!list.allowed("|"));
    }
}
