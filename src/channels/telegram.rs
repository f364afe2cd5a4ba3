//! Telegram channel: long-poll inbound, Bot API outbound.
//!
//! Inbound runs `getUpdates` with `offset = last_update_id + 1` and hands
//! updates to a small worker pool; failed polls back off exponentially from
//! 300 ms, capped at five doublings, with jitter. Outbound sends HTML
//! (converted from markdown) and retries transient failures up to three
//! attempts, honoring `retry_after` on 429.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{Bus, Delivery, InboundMessage, OutboundMessage};
use crate::channels::format::markdown_to_telegram_html;
use crate::channels::{AllowList, Channel};
use crate::config::TelegramConfig;
use crate::error::ChannelError;

const SEND_MAX_ATTEMPTS: u32 = 3;

/// Clamp the long-poll timeout to Telegram's supported range.
pub fn clamp_poll_timeout(v: u64) -> u64 {
    match v {
        0 => 25,
        v if v > 50 => 50,
        v => v,
    }
}

/// Clamp the update worker pool size.
pub fn clamp_workers(v: usize) -> usize {
    match v {
        0 => 2,
        v if v > 8 => 8,
        v => v,
    }
}

/// Exponential poll backoff: 300ms doubling per attempt, capped at 2^5.
pub fn poll_backoff(attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let shift = (attempt - 1).min(5);
    Duration::from_millis(300) * (1u32 << shift)
}

/// Why a send failed, reduced to what the retry policy needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    /// HTTP 429 with Telegram's requested pause.
    TooManyRequests { retry_after_sec: u64 },
    /// Network timeout / connect error or HTTP 5xx.
    Transient,
    /// Anything else; retrying will not help.
    Fatal,
    /// Shutdown in progress; never retried.
    Cancelled,
}

/// Pure retry matrix: the wait before the next attempt, or `None` to stop.
pub fn send_retry_wait(failure: &SendFailure, attempt: u32) -> Option<Duration> {
    if attempt >= SEND_MAX_ATTEMPTS {
        return None;
    }
    match failure {
        SendFailure::TooManyRequests { retry_after_sec } => {
            Some(Duration::from_secs((*retry_after_sec).max(1)))
        }
        SendFailure::Transient => Some(Duration::from_millis(500) * attempt),
        SendFailure::Fatal | SendFailure::Cancelled => None,
    }
}

/// Resolve the message id an outbound message replies to: structured
/// delivery first, then the legacy field, first positive integer wins.
pub fn resolve_reply_target(msg: &OutboundMessage) -> i64 {
    for candidate in [msg.delivery.reply_to_id.trim(), msg.reply_to.trim()] {
        if candidate.is_empty() {
            continue;
        }
        if let Ok(n) = candidate.parse::<i64>() {
            if n > 0 {
                return n;
            }
        }
    }
    0
}

pub struct TelegramChannel {
    cfg: TelegramConfig,
    bus: Arc<Bus>,
    allow: AllowList,
    poll_timeout: u64,
    workers: usize,
    client: reqwest::Client,
    running: AtomicBool,
    last_update_id: AtomicI64,
    stop_token: std::sync::Mutex<Option<CancellationToken>>,
}

fn handle_update_boxed<'a>(
    this: &'a TelegramChannel,
    token: CancellationToken,
    update: Update,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        this.handle_update(&token, update).await;
    })
}

impl TelegramChannel {
    pub fn new(cfg: TelegramConfig, bus: Arc<Bus>) -> Self {
        let poll_timeout = clamp_poll_timeout(cfg.poll_timeout_sec);
        let workers = clamp_workers(cfg.workers);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(poll_timeout + 15))
            .build()
            .unwrap_or_default();
        Self {
            allow: AllowList::new(cfg.allow_from.clone()),
            bus,
            poll_timeout,
            workers,
            client,
            running: AtomicBool::new(false),
            last_update_id: AtomicI64::new(0),
            stop_token: std::sync::Mutex::new(None),
            cfg,
        }
    }

    fn api_url(&self, method: &str) -> String {
        let base = if self.cfg.base_url.trim().is_empty() {
            "https://api.telegram.org"
        } else {
            self.cfg.base_url.trim().trim_end_matches('/')
        };
        format!("{}/bot{}/{}", base, self.cfg.token.trim(), method)
    }

    async fn call_api<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: &T,
    ) -> Result<R, SendFailure> {
        let response = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    SendFailure::Transient
                } else {
                    SendFailure::Fatal
                }
            })?;

        let status = response.status();
        let raw = response.bytes().await.map_err(|_| SendFailure::Transient)?;
        if status.is_server_error() {
            return Err(SendFailure::Transient);
        }

        let envelope: ApiEnvelope = serde_json::from_slice(&raw).map_err(|_| SendFailure::Fatal)?;
        if !envelope.ok {
            if envelope.error_code == Some(429) {
                let retry_after_sec = envelope
                    .parameters
                    .as_ref()
                    .and_then(|p| p.retry_after)
                    .unwrap_or(1);
                return Err(SendFailure::TooManyRequests { retry_after_sec });
            }
            warn!(
                method,
                error = envelope.description.as_deref().unwrap_or("unknown"),
                "telegram api error"
            );
            return Err(SendFailure::Fatal);
        }
        let result = envelope.result.ok_or(SendFailure::Fatal)?;
        serde_json::from_str(result.get()).map_err(|_| SendFailure::Fatal)
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, SendFailure> {
        self.call_api(
            "getUpdates",
            &GetUpdatesRequest {
                offset,
                timeout: self.poll_timeout,
                allowed_updates: &["message", "edited_message"],
            },
        )
        .await
    }

    async fn handle_update(&self, token: &CancellationToken, update: Update) {
        let Some(msg) = update.message.or(update.edited_message) else {
            return;
        };
        let Some(from) = &msg.from else { return };
        if from.is_bot {
            return;
        }
        let sender_id = sender_id(from);
        if !self.allow.allowed(&sender_id) {
            debug!(sender = %sender_id, "telegram sender not allowed");
            return;
        }
        let content = message_content(&msg);
        if content.is_empty() {
            return;
        }
        let chat_id = msg.chat.id.to_string();
        let inbound = InboundMessage {
            channel: "telegram".into(),
            sender_id,
            chat_id: chat_id.clone(),
            content,
            attachments: Vec::new(),
            session_key: format!("telegram:{chat_id}"),
            delivery: build_delivery(&msg),
        };
        if self.bus.publish_inbound(token, inbound).await.is_err() {
            debug!("inbound publish cancelled");
        }
    }

    async fn send_once(&self, msg: &OutboundMessage, html: bool) -> Result<(), SendFailure> {
        let text = if html {
            markdown_to_telegram_html(&msg.content)
        } else {
            msg.content.clone()
        };
        let reply_to = resolve_reply_target(msg);
        let request = SendMessageRequest {
            chat_id: msg.chat_id.trim(),
            text: &text,
            parse_mode: html.then_some("HTML"),
            reply_parameters: (reply_to > 0).then(|| ReplyParameters {
                message_id: reply_to,
                allow_sending_without_reply: true,
            }),
        };
        let _sent: MessageLite = self.call_api("sendMessage", &request).await?;
        Ok(())
    }

    fn run_poll_loop(
        &self,
        token: CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ChannelError>> + Send + '_>>
    {
        Box::pin(self.run_poll_loop_inner(token))
    }

    async fn run_poll_loop_inner(&self, token: CancellationToken) -> Result<(), ChannelError> {
        // The worker pool decouples polling from the bus: a slow agent loop
        // cannot stall the long-poll cycle.
        let (update_tx, mut update_rx) = mpsc::channel::<Update>(64);
        let consumer_token = token.clone();
        let limit = self.workers.max(1);
        let consumer = async move {
            let mut in_flight = futures::stream::FuturesUnordered::new();
            loop {
                if in_flight.len() >= limit {
                    in_flight.next().await;
                    continue;
                }
                tokio::select! {
                    maybe_update = update_rx.recv() => {
                        match maybe_update {
                            Some(update) => {
                                in_flight.push(handle_update_boxed(
                                    self,
                                    consumer_token.clone(),
                                    update,
                                ));
                            }
                            None => break,
                        }
                    }
                    Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
                }
            }
            while in_flight.next().await.is_some() {}
        };

        let poller = async move {
            // `update_tx` is owned here so finishing the poller closes the
            // stream and lets the consumer drain.
            let update_tx = update_tx;
            let mut attempt: u32 = 1;
            loop {
                if token.is_cancelled() {
                    break Err(ChannelError::Cancelled);
                }
                let offset = self.last_update_id.load(Ordering::SeqCst) + 1;
                let updates = tokio::select! {
                    res = self.get_updates(offset) => res,
                    _ = token.cancelled() => break Err(ChannelError::Cancelled),
                };
                match updates {
                    Ok(updates) => {
                        attempt = 1;
                        for update in updates {
                            if update.update_id > self.last_update_id.load(Ordering::SeqCst) {
                                self.last_update_id.store(update.update_id, Ordering::SeqCst);
                            }
                            if update_tx.send(update).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(failure) => {
                        let base = poll_backoff(attempt);
                        attempt += 1;
                        let jitter =
                            rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 5);
                        let wait = base + Duration::from_millis(jitter);
                        debug!(?failure, ?wait, "telegram poll failed, backing off");
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = token.cancelled() => break Err(ChannelError::Cancelled),
                        }
                    }
                }
            }
        };

        // Poller ends on cancellation, dropping its sender; the consumer
        // then drains and finishes.
        let (result, ()) = tokio::join!(poller, consumer);
        result
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self, token: CancellationToken) -> Result<(), ChannelError> {
        if self.cfg.token.trim().is_empty() {
            return Err(ChannelError::NotConfigured {
                name: "telegram".into(),
                reason: "token is empty".into(),
            });
        }
        if let Ok(mut slot) = self.stop_token.lock() {
            *slot = Some(token.clone());
        }
        self.running.store(true, Ordering::SeqCst);

        let result = self.run_poll_loop(token).await;
        self.running.store(false, Ordering::SeqCst);
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
        if msg.chat_id.trim().is_empty() {
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: "chat_id is empty".into(),
            });
        }
        if msg.content.trim().is_empty() {
            return Ok(());
        }

        let mut attempt: u32 = 1;
        loop {
            let failure = match self.send_once(msg, true).await {
                Ok(()) => return Ok(()),
                Err(SendFailure::Fatal) => {
                    // HTML can be rejected for unbalanced entities; fall
                    // back to plain text once before giving up.
                    match self.send_once(msg, false).await {
                        Ok(()) => return Ok(()),
                        Err(failure) => failure,
                    }
                }
                Err(failure) => failure,
            };
            match send_retry_wait(&failure, attempt) {
                Some(wait) => {
                    debug!(?failure, attempt, ?wait, "telegram send retry");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                None => {
                    return Err(ChannelError::SendFailed {
                        name: "telegram".into(),
                        reason: format!("{failure:?} after {attempt} attempts"),
                    });
                }
            }
        }
    }
}

fn sender_id(from: &User) -> String {
    let id = from.id.to_string();
    let username = from
        .username
        .as_deref()
        .unwrap_or("")
        .trim()
        .trim_start_matches('@');
    if username.is_empty() {
        id
    } else {
        format!("{id}|{username}")
    }
}

fn message_content(msg: &TgMessage) -> String {
    let text = msg.text.as_deref().unwrap_or("").trim();
    if !text.is_empty() {
        return text.to_string();
    }
    msg.caption.as_deref().unwrap_or("").trim().to_string()
}

fn build_delivery(msg: &TgMessage) -> Delivery {
    Delivery {
        message_id: msg.message_id.to_string(),
        reply_to_id: msg
            .reply_to_message
            .as_ref()
            .filter(|r| r.message_id > 0)
            .map(|r| r.message_id.to_string())
            .unwrap_or_default(),
        thread_id: msg
            .message_thread_id
            .filter(|&t| t > 0)
            .map(|t| t.to_string())
            .unwrap_or_default(),
        is_direct: msg
            .chat
            .chat_type
            .as_deref()
            .is_some_and(|t| t.trim().eq_ignore_ascii_case("private")),
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    ok: bool,
    result: Option<Box<RawValue>>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<ApiParameters>,
}

#[derive(Debug, Deserialize)]
struct ApiParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Serialize)]
struct GetUpdatesRequest<'a> {
    offset: i64,
    timeout: u64,
    allowed_updates: &'a [&'a str],
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_parameters: Option<ReplyParameters>,
}

#[derive(Debug, Serialize)]
struct ReplyParameters {
    message_id: i64,
    allow_sending_without_reply: bool,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TgMessage>,
    edited_message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    message_thread_id: Option<i64>,
    from: Option<User>,
    chat: Chat,
    text: Option<String>,
    caption: Option<String>,
    reply_to_message: Option<Box<TgMessage>>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(rename = "type")]
    chat_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageLite {
    #[allow(dead_code)]
    message_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_timeout_clamps() {
        assert_eq!(clamp_poll_timeout(0), 25);
        assert_eq!(clamp_poll_timeout(30), 30);
        assert_eq!(clamp_poll_timeout(51), 50);
        assert_eq!(clamp_poll_timeout(1), 1);
    }

    #[test]
    fn worker_clamps() {
        assert_eq!(clamp_workers(0), 2);
        assert_eq!(clamp_workers(3), 3);
        assert_eq!(clamp_workers(9), 8);
    }

    #[test]
    fn backoff_is_monotonic_then_capped() {
        let mut prev = Duration::ZERO;
        for attempt in 1..=5 {
            let wait = poll_backoff(attempt);
            assert!(wait >= prev, "attempt {attempt}");
            prev = wait;
        }
        assert_eq!(poll_backoff(6), poll_backoff(7));
        assert_eq!(poll_backoff(6), Duration::from_millis(300) * 32);
        assert_eq!(poll_backoff(0), Duration::from_millis(300));
    }

    #[test]
    fn reply_target_prefers_structured_delivery() {
        let msg = OutboundMessage {
            reply_to: "12".into(),
            delivery: Delivery {
                reply_to_id: "34".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(resolve_reply_target(&msg), 34);

        let msg = OutboundMessage {
            reply_to: "56".into(),
            ..Default::default()
        };
        assert_eq!(resolve_reply_target(&msg), 56);

        let msg = OutboundMessage {
            reply_to: "abc".into(),
            delivery: Delivery {
                reply_to_id: "def".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(resolve_reply_target(&msg), 0);

        let msg = OutboundMessage {
            reply_to: "77".into(),
            delivery: Delivery {
                reply_to_id: "-3".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(resolve_reply_target(&msg), 77);
    }

    #[test]
    fn retry_matrix() {
        let rate = SendFailure::TooManyRequests { retry_after_sec: 7 };
        assert_eq!(send_retry_wait(&rate, 1), Some(Duration::from_secs(7)));
        assert_eq!(send_retry_wait(&rate, 3), None);
        assert!(send_retry_wait(&SendFailure::Transient, 1).is_some());
        assert!(send_retry_wait(&SendFailure::Transient, 2).is_some());
        assert_eq!(send_retry_wait(&SendFailure::Transient, 3), None);
        assert_eq!(send_retry_wait(&SendFailure::Fatal, 1), None);
        assert_eq!(send_retry_wait(&SendFailure::Cancelled, 1), None);
    }

    #[test]
    fn sender_id_is_compound_when_username_present() {
        let user = User {
            id: 100,
            is_bot: false,
            username: Some("@alice".into()),
        };
        assert_eq!(sender_id(&user), "100|alice");
        let user = User {
            id: 100,
            is_bot: false,
            username: None,
        };
        assert_eq!(sender_id(&user), "100");
    }

    #[test]
    fn delivery_from_message() {
        let raw = serde_json::json!({
            "message_id": 9,
            "message_thread_id": 4,
            "chat": {"id": 1, "type": "private"},
            "reply_to_message": {"message_id": 7, "chat": {"id": 1}},
        });
        let msg: TgMessage = serde_json::from_value(raw).unwrap();
        let delivery = build_delivery(&msg);
        assert_eq!(delivery.message_id, "9");
        assert_eq!(delivery.reply_to_id, "7");
        assert_eq!(delivery.thread_id, "4");
        assert!(delivery.is_direct);
    }

    #[test]
    fn captions_count_as_content() {
        let raw = serde_json::json!({
            "message_id": 1,
            "chat": {"id": 1},
            "caption": " photo note "
        });
        let msg: TgMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(message_content(&msg), "photo note");
    }
}
