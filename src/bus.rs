//! In-process message bus.
//!
//! A pair of bounded queues, one per direction. Channels publish inbound
//! messages, the agent loop consumes them; the loop publishes outbound
//! messages, the channel manager dispatches them. Every operation blocks
//! until progress or until the caller's cancellation token fires. A full
//! buffer blocks publishers, which is the backpressure mechanism.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::BusError;

pub const DEFAULT_BUFFER: usize = 64;

/// Structured delivery metadata carried alongside a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct Delivery {
    pub message_id: String,
    pub reply_to_id: String,
    pub thread_id: String,
    pub is_direct: bool,
}

/// An attachment referenced by an inbound message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub kind: String,
    pub size_bytes: i64,
    pub url: String,
    pub local_path: String,
}

/// Classify an attachment by MIME type prefix.
pub fn infer_attachment_kind(mime_type: &str) -> &'static str {
    let m = mime_type.trim().to_ascii_lowercase();
    if m.starts_with("image/") {
        "image"
    } else if m.starts_with("audio/") {
        "audio"
    } else if m.starts_with("video/") {
        "video"
    } else {
        "file"
    }
}

/// A message received from a channel, headed for the agent loop.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// Usually `"<channel>:<chat_id>"`.
    pub session_key: String,
    pub delivery: Delivery,
}

/// A reply headed from the agent loop back to a channel.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub reply_to: String,
    pub delivery: Delivery,
}

/// Bounded inbound/outbound queue pair.
///
/// Multi-producer by cloning the senders internally; multi-consumer by
/// serializing receivers behind async mutexes. FIFO per direction.
pub struct Bus {
    in_tx: mpsc::Sender<InboundMessage>,
    in_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    out_tx: mpsc::Sender<OutboundMessage>,
    out_rx: Mutex<mpsc::Receiver<OutboundMessage>>,
}

impl Bus {
    pub fn new(buffer: usize) -> Self {
        let buffer = if buffer == 0 { DEFAULT_BUFFER } else { buffer };
        let (in_tx, in_rx) = mpsc::channel(buffer);
        let (out_tx, out_rx) = mpsc::channel(buffer);
        Self {
            in_tx,
            in_rx: Mutex::new(in_rx),
            out_tx,
            out_rx: Mutex::new(out_rx),
        }
    }

    pub async fn publish_inbound(
        &self,
        token: &CancellationToken,
        msg: InboundMessage,
    ) -> Result<(), BusError> {
        tokio::select! {
            res = self.in_tx.send(msg) => res.map_err(|_| BusError::Closed),
            _ = token.cancelled() => Err(BusError::Cancelled),
        }
    }

    pub async fn publish_outbound(
        &self,
        token: &CancellationToken,
        msg: OutboundMessage,
    ) -> Result<(), BusError> {
        tokio::select! {
            res = self.out_tx.send(msg) => res.map_err(|_| BusError::Closed),
            _ = token.cancelled() => Err(BusError::Cancelled),
        }
    }

    pub async fn consume_inbound(
        &self,
        token: &CancellationToken,
    ) -> Result<InboundMessage, BusError> {
        let mut rx = tokio::select! {
            guard = self.in_rx.lock() => guard,
            _ = token.cancelled() => return Err(BusError::Cancelled),
        };
        tokio::select! {
            msg = rx.recv() => msg.ok_or(BusError::Closed),
            _ = token.cancelled() => Err(BusError::Cancelled),
        }
    }

    pub async fn consume_outbound(
        &self,
        token: &CancellationToken,
    ) -> Result<OutboundMessage, BusError> {
        let mut rx = tokio::select! {
            guard = self.out_rx.lock() => guard,
            _ = token.cancelled() => return Err(BusError::Cancelled),
        };
        tokio::select! {
            msg = rx.recv() => msg.ok_or(BusError::Closed),
            _ = token.cancelled() => Err(BusError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_consume_preserves_order() {
        let bus = Bus::new(8);
        let token = CancellationToken::new();
        for i in 0..3 {
            bus.publish_inbound(
                &token,
                InboundMessage {
                    channel: "cli".into(),
                    content: format!("m{i}"),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        for i in 0..3 {
            let msg = bus.consume_inbound(&token).await.unwrap();
            assert_eq!(msg.content, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn cancelled_consume_fails() {
        let bus = Bus::new(1);
        let token = CancellationToken::new();
        token.cancel();
        let err = bus.consume_inbound(&token).await.unwrap_err();
        assert!(matches!(err, BusError::Cancelled));
    }

    #[tokio::test]
    async fn full_buffer_blocks_until_cancel() {
        let bus = Bus::new(1);
        let token = CancellationToken::new();
        bus.publish_outbound(&token, OutboundMessage::default())
            .await
            .unwrap();

        let blocked = bus.publish_outbound(&token, OutboundMessage::default());
        tokio::pin!(blocked);
        // The second publish must not complete while the buffer is full.
        tokio::select! {
            _ = &mut blocked => panic!("publish completed on a full buffer"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
        }
        token.cancel();
        assert!(matches!(blocked.await, Err(BusError::Cancelled)));
    }

    #[test]
    fn attachment_kind_from_mime() {
        assert_eq!(infer_attachment_kind("image/png"), "image");
        assert_eq!(infer_attachment_kind(" AUDIO/ogg "), "audio");
        assert_eq!(infer_attachment_kind("video/mp4"), "video");
        assert_eq!(infer_attachment_kind("application/pdf"), "file");
    }
}
