//! Slack channel: Events API webhook inbound, Web API outbound.
//!
//! The HTTP handler validates the `v0=` HMAC-SHA256 signature (constant
//! time, 5-minute timestamp window), answers `url_verification` with the
//! plain-text challenge, acks everything else with 200 "ok" immediately and
//! processes the event on a detached task. Bot messages, edits and other
//! subtypes are dropped; DMs and groups go through the configured policy
//! before an inbound message is published.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{Bus, Delivery, InboundMessage, OutboundMessage};
use crate::channels::{AllowList, Channel};
use crate::config::SlackConfig;
use crate::error::ChannelError;

const BODY_LIMIT: usize = 2 << 20;
const SIGNATURE_WINDOW_SECS: i64 = 300;
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

type HmacSha256 = Hmac<Sha256>;

pub struct SlackChannel {
    cfg: SlackConfig,
    bus: Arc<Bus>,
    allow: AllowList,
    client: reqwest::Client,
    running: AtomicBool,
    token: std::sync::Mutex<CancellationToken>,
}

impl SlackChannel {
    pub fn new(cfg: SlackConfig, bus: Arc<Bus>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            allow: AllowList::new(cfg.allow_from.clone()),
            bus,
            client,
            running: AtomicBool::new(false),
            token: std::sync::Mutex::new(CancellationToken::new()),
            cfg,
        }
    }

    pub fn events_path(&self) -> &str {
        if self.cfg.events_path.trim().is_empty() {
            "/slack/events"
        } else {
            self.cfg.events_path.trim()
        }
    }

    /// Router exposing the events endpoint.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(self.events_path(), post(events_handler))
            .layer(DefaultBodyLimit::max(BODY_LIMIT))
            .with_state(Arc::clone(self))
    }

    /// Validate `X-Slack-Signature` over `v0:<timestamp>:<body>`.
    fn verify_signature(&self, headers: &HeaderMap, body: &[u8], now_unix: i64) -> bool {
        let Some(signature) = header(headers, "x-slack-signature") else {
            return false;
        };
        let Some(timestamp) = header(headers, "x-slack-request-timestamp") else {
            return false;
        };
        let Ok(ts) = timestamp.parse::<i64>() else {
            return false;
        };
        if (now_unix - ts).abs() > SIGNATURE_WINDOW_SECS {
            return false;
        }

        let mut mac = match HmacSha256::new_from_slice(self.cfg.signing_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(format!("v0:{timestamp}:").as_bytes());
        mac.update(body);
        let expected = format!("v0={}", hex::encode(mac.finalize().into_bytes()));
        bool::from(expected.as_bytes().ct_eq(signature.as_bytes()))
    }

    async fn process_event(&self, payload: EventPayload) {
        let Some(event) = payload.event else { return };
        let kind = event.kind.as_deref().unwrap_or("");
        if kind != "message" && kind != "app_mention" {
            return;
        }
        // Bot echoes, edits and other subtypes never reach the agent.
        if !event.bot_id.as_deref().unwrap_or("").trim().is_empty()
            || !event.subtype.as_deref().unwrap_or("").trim().is_empty()
        {
            return;
        }
        let user = event.user.as_deref().unwrap_or("").trim().to_string();
        let channel = event.channel.as_deref().unwrap_or("").trim().to_string();
        let mut text = event.text.as_deref().unwrap_or("").trim().to_string();
        if user.is_empty() || channel.is_empty() || text.is_empty() {
            return;
        }
        let bot_id = self.cfg.bot_id.trim();
        if !bot_id.is_empty() && user == bot_id {
            return;
        }

        let is_dm = event.channel_type.as_deref() == Some("im");
        let mention_tag = format!("<@{bot_id}>");
        let mentioned = !bot_id.is_empty() && text.contains(&mention_tag);

        if is_dm {
            if !self.cfg.dm_enabled {
                return;
            }
        } else {
            match self.cfg.group_policy.as_str() {
                "open" => {}
                "mention" => {
                    if kind != "app_mention" && !mentioned {
                        return;
                    }
                }
                "allowlist" => {
                    // Channel must be allowlisted AND the sender allowed,
                    // for app_mention as well as plain messages.
                    if !self.cfg.group_allowlist.iter().any(|c| *c == channel) {
                        return;
                    }
                }
                other => {
                    warn!(policy = other, "unknown slack group policy, dropping");
                    return;
                }
            }
        }
        if !self.allow.allowed(&user) {
            debug!(user = %user, "slack sender not allowed");
            return;
        }

        if mentioned {
            if let Some(stripped) = text.trim_start().strip_prefix(&mention_tag) {
                text = stripped.trim_start().to_string();
            }
        }
        if text.is_empty() {
            return;
        }

        let token = self.current_token();
        let inbound = InboundMessage {
            channel: "slack".into(),
            sender_id: user,
            chat_id: channel.clone(),
            content: text,
            attachments: Vec::new(),
            session_key: format!("slack:{channel}"),
            delivery: Delivery {
                message_id: event.ts.unwrap_or_default(),
                thread_id: event.thread_ts.unwrap_or_default(),
                is_direct: is_dm,
                ..Default::default()
            },
        };
        if self.bus.publish_inbound(&token, inbound).await.is_err() {
            debug!("slack inbound publish cancelled");
        }
    }

    fn current_token(&self) -> CancellationToken {
        self.token
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn events_handler(
    State(channel): State<Arc<SlackChannel>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if channel.cfg.signing_secret.trim().is_empty() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "slack signingSecret not configured",
        )
            .into_response();
    }
    let now = chrono::Utc::now().timestamp();
    if !channel.verify_signature(&headers, &body, now) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let Ok(payload) = serde_json::from_slice::<EventPayload>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if payload.kind.as_deref() == Some("url_verification") {
        let challenge = payload.challenge.unwrap_or_default();
        return ([("content-type", "text/plain")], challenge).into_response();
    }

    // Ack fast; the event is processed off the request path.
    let channel = Arc::clone(&channel);
    tokio::spawn(async move {
        channel.process_event(payload).await;
    });
    (StatusCode::OK, "ok").into_response()
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Inbound arrives over HTTP; start just tracks the running state.
    async fn start(&self, token: CancellationToken) -> Result<(), ChannelError> {
        if self.cfg.signing_secret.trim().is_empty() {
            return Err(ChannelError::NotConfigured {
                name: "slack".into(),
                reason: "signingSecret is empty".into(),
            });
        }
        if let Ok(mut slot) = self.token.lock() {
            *slot = token.clone();
        }
        self.running.store(true, Ordering::SeqCst);
        token.cancelled().await;
        self.running.store(false, Ordering::SeqCst);
        Err(ChannelError::Cancelled)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        if self.cfg.bot_token.trim().is_empty() {
            return Err(ChannelError::NotConfigured {
                name: "slack".into(),
                reason: "botToken is empty".into(),
            });
        }
        let chat_id = msg.chat_id.trim();
        if chat_id.is_empty() {
            return Err(ChannelError::SendFailed {
                name: "slack".into(),
                reason: "chat_id is empty".into(),
            });
        }
        let text = msg.content.trim();
        if text.is_empty() {
            return Ok(());
        }

        let mut body = serde_json::json!({
            "channel": chat_id,
            "text": text,
        });
        let thread = msg.delivery.thread_id.trim();
        if !thread.is_empty() {
            body["thread_ts"] = serde_json::json!(thread);
        }

        let response = self
            .client
            .post("https://slack.com/api/chat.postMessage")
            .header(
                "Authorization",
                format!("Bearer {}", self.cfg.bot_token.trim()),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "slack".into(),
                reason: e.to_string(),
            })?;

        let parsed: PostMessageResponse =
            response.json().await.map_err(|e| ChannelError::SendFailed {
                name: "slack".into(),
                reason: e.to_string(),
            })?;
        if !parsed.ok {
            return Err(ChannelError::SendFailed {
                name: "slack".into(),
                reason: parsed.error.unwrap_or_else(|| "unknown api error".into()),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    #[serde(rename = "type")]
    kind: Option<String>,
    challenge: Option<String>,
    event: Option<InnerEvent>,
}

#[derive(Debug, Deserialize)]
struct InnerEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    user: Option<String>,
    channel: Option<String>,
    text: Option<String>,
    channel_type: Option<String>,
    bot_id: Option<String>,
    subtype: Option<String>,
    ts: Option<String>,
    thread_ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_with(cfg_mod: impl FnOnce(&mut SlackConfig)) -> (Arc<SlackChannel>, Arc<Bus>) {
        let mut cfg = SlackConfig {
            enabled: true,
            signing_secret: "secret".into(),
            bot_id: "UBOT".into(),
            ..Default::default()
        };
        cfg_mod(&mut cfg);
        let bus = Arc::new(Bus::new(8));
        (Arc::new(SlackChannel::new(cfg, Arc::clone(&bus))), bus)
    }

    fn sign(secret: &str, timestamp: i64, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("v0:{timestamp}:{body}").as_bytes());
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn signed_headers(secret: &str, timestamp: i64, body: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-slack-signature",
            sign(secret, timestamp, body).parse().unwrap(),
        );
        headers.insert(
            "x-slack-request-timestamp",
            timestamp.to_string().parse().unwrap(),
        );
        headers
    }

    async fn call(
        channel: &Arc<SlackChannel>,
        headers: HeaderMap,
        body: &str,
    ) -> (StatusCode, String) {
        let response = events_handler(
            State(Arc::clone(channel)),
            headers,
            Bytes::from(body.to_string()),
        )
        .await;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[test]
    fn signature_verification() {
        let (channel, _bus) = channel_with(|_| {});
        let now = chrono::Utc::now().timestamp();
        let body = r#"{"type":"url_verification"}"#;

        let headers = signed_headers("secret", now, body);
        assert!(channel.verify_signature(&headers, body.as_bytes(), now));

        let headers = signed_headers("wrong", now, body);
        assert!(!channel.verify_signature(&headers, body.as_bytes(), now));

        // Stale timestamps fail even with a valid signature.
        let old = now - 600;
        let headers = signed_headers("secret", old, body);
        assert!(!channel.verify_signature(&headers, body.as_bytes(), now));

        assert!(!channel.verify_signature(&HeaderMap::new(), body.as_bytes(), now));
    }

    #[tokio::test]
    async fn invalid_signature_is_403_and_publishes_nothing() {
        let (channel, bus) = channel_with(|_| {});
        let now = chrono::Utc::now().timestamp();
        let body = r#"{"type":"event_callback","event":{"type":"message","user":"U1","channel":"C1","text":"hi","channel_type":"im"}}"#;
        let headers = signed_headers("not-the-secret", now, body);
        let (status, _) = call(&channel, headers, body).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let token = CancellationToken::new();
        token.cancel();
        assert!(bus.consume_inbound(&token).await.is_err());
    }

    #[tokio::test]
    async fn url_verification_echoes_challenge() {
        let (channel, _bus) = channel_with(|_| {});
        let now = chrono::Utc::now().timestamp();
        let body = r#"{"type":"url_verification","challenge":"xyz"}"#;
        let headers = signed_headers("secret", now, body);
        let (status, text) = call(&channel, headers, body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "xyz");
    }

    #[tokio::test]
    async fn message_event_acks_then_publishes() {
        let (channel, bus) = channel_with(|_| {});
        let now = chrono::Utc::now().timestamp();
        let body = r#"{"type":"event_callback","event":{"type":"message","user":"U1","channel":"C42","text":"hi","channel_type":"im","ts":"1.2"}}"#;
        let headers = signed_headers("secret", now, body);
        let (status, text) = call(&channel, headers, body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "ok");

        let token = CancellationToken::new();
        let inbound = tokio::time::timeout(
            Duration::from_secs(1),
            bus.consume_inbound(&token),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(inbound.channel, "slack");
        assert_eq!(inbound.session_key, "slack:C42");
        assert_eq!(inbound.content, "hi");
        assert!(inbound.delivery.is_direct);
    }

    #[tokio::test]
    async fn bot_and_subtype_messages_are_dropped() {
        let (channel, bus) = channel_with(|_| {});
        for event in [
            r#"{"type":"message","user":"U1","channel":"C1","text":"x","channel_type":"im","bot_id":"B9"}"#,
            r#"{"type":"message","user":"U1","channel":"C1","text":"x","channel_type":"im","subtype":"message_changed"}"#,
            r#"{"type":"message","user":"UBOT","channel":"C1","text":"x","channel_type":"im"}"#,
        ] {
            let payload: EventPayload =
                serde_json::from_str(&format!(r#"{{"type":"event_callback","event":{event}}}"#))
                    .unwrap();
            channel.process_event(payload).await;
        }
        let token = CancellationToken::new();
        token.cancel();
        assert!(bus.consume_inbound(&token).await.is_err());
    }

    #[tokio::test]
    async fn mention_policy_requires_mention_in_groups() {
        let (channel, bus) = channel_with(|cfg| {
            cfg.group_policy = "mention".into();
        });

        let plain: EventPayload = serde_json::from_str(
            r#"{"type":"event_callback","event":{"type":"message","user":"U1","channel":"C1","text":"no ping","channel_type":"channel"}}"#,
        )
        .unwrap();
        channel.process_event(plain).await;

        let mentioned: EventPayload = serde_json::from_str(
            r#"{"type":"event_callback","event":{"type":"message","user":"U1","channel":"C1","text":"<@UBOT> do it","channel_type":"channel"}}"#,
        )
        .unwrap();
        channel.process_event(mentioned).await;

        let token = CancellationToken::new();
        let inbound = bus.consume_inbound(&token).await.unwrap();
        // Only the mentioned message arrived, with the mention stripped.
        assert_eq!(inbound.content, "do it");
        token.cancel();
        assert!(bus.consume_inbound(&token).await.is_err());
    }

    #[tokio::test]
    async fn allowlist_policy_requires_channel_and_user() {
        let (channel, bus) = channel_with(|cfg| {
            cfg.group_policy = "allowlist".into();
            cfg.group_allowlist = vec!["C_OK".into()];
            cfg.allow_from = vec!["U_OK".into()];
        });

        for (user, chan) in [("U_OK", "C_BAD"), ("U_BAD", "C_OK")] {
            let payload: EventPayload = serde_json::from_str(&format!(
                r#"{{"type":"event_callback","event":{{"type":"app_mention","user":"{user}","channel":"{chan}","text":"hey"}}}}"#
            ))
            .unwrap();
            channel.process_event(payload).await;
        }
        let token = CancellationToken::new();
        token.cancel();
        assert!(bus.consume_inbound(&token).await.is_err());

        let payload: EventPayload = serde_json::from_str(
            r#"{"type":"event_callback","event":{"type":"app_mention","user":"U_OK","channel":"C_OK","text":"hey"}}"#,
        )
        .unwrap();
        channel.process_event(payload).await;
        let token = CancellationToken::new();
        let inbound = bus.consume_inbound(&token).await.unwrap();
        assert_eq!(inbound.chat_id, "C_OK");
    }

    #[tokio::test]
    async fn dm_disabled_drops_dms() {
        let (channel, bus) = channel_with(|cfg| {
            cfg.dm_enabled = false;
        });
        let payload: EventPayload = serde_json::from_str(
            r#"{"type":"event_callback","event":{"type":"message","user":"U1","channel":"D1","text":"hi","channel_type":"im"}}"#,
        )
        .unwrap();
        channel.process_event(payload).await;
        let token = CancellationToken::new();
        token.cancel();
        assert!(bus.consume_inbound(&token).await.is_err());
    }
}
