//! web_fetch tool: policy-gated HTTP GET with bounded bodies.
//!
//! Hosts are checked against the domain policy before the request and again
//! on every redirect hop. The body is read up to the configured cap, then
//! classified (JSON pretty-printed, HTML reduced to title + text, otherwise
//! raw) and returned inside a JSON envelope carrying truncation flags.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::error::ToolError;
use crate::tools::html::{extract_html_text, looks_like_html};
use crate::tools::ToolRegistry;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RESPONSE: u64 = 4 << 20;
const MAX_REDIRECTS: usize = 5;

/// Decide whether `host` may be fetched under the allowed/blocked pattern
/// lists. `blocked` wins; then `allowed` must match at least one pattern
/// (an explicitly empty `allowed` denies everything, `None` means `*`).
pub fn allow_host_by_policy(
    host: &str,
    allowed: Option<&[String]>,
    blocked: &[String],
) -> Result<(), String> {
    let host = normalize_fetch_host(host);
    if host.is_empty() {
        return Err("invalid host".into());
    }

    for raw in blocked {
        let pattern = normalize_domain_pattern(raw);
        if pattern.is_empty() {
            continue;
        }
        if domain_matches_pattern(&host, &pattern) {
            return Err("host is blocked by policy".into());
        }
    }

    let Some(allowed) = allowed else {
        return Ok(());
    };
    if allowed.is_empty() {
        return Err("no allowed domains configured".into());
    }
    for raw in allowed {
        let pattern = normalize_domain_pattern(raw);
        if pattern.is_empty() {
            continue;
        }
        if pattern == "*" || domain_matches_pattern(&host, &pattern) {
            return Ok(());
        }
    }
    Err("host is not in allowed domains".into())
}

/// A host matches a pattern iff equal, or the host ends with `.<pattern>`
/// and neither side is an IP address.
pub fn domain_matches_pattern(host: &str, pattern: &str) -> bool {
    let host = normalize_fetch_host(host);
    let pattern = normalize_domain_pattern(pattern);
    if host.is_empty() || pattern.is_empty() {
        return false;
    }
    if host == pattern {
        return true;
    }
    if host.parse::<std::net::IpAddr>().is_ok() || pattern.parse::<std::net::IpAddr>().is_ok() {
        return false;
    }
    host.ends_with(&format!(".{pattern}"))
}

fn normalize_fetch_host(raw: &str) -> String {
    let mut h = raw.trim().to_string();
    if h.starts_with('[') && h.ends_with(']') {
        h = h[1..h.len() - 1].to_string();
    }
    // Strip a :port suffix, but leave bare IPv6 colons alone.
    if let Some(idx) = h.rfind(':') {
        if h[..idx].parse::<std::net::Ipv6Addr>().is_err() && !h[..idx].contains(':') {
            let (head, tail) = h.split_at(idx);
            if tail[1..].chars().all(|c| c.is_ascii_digit()) && !tail[1..].is_empty() {
                h = head.to_string();
            }
        }
    }
    h.trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_lowercase()
}

fn normalize_domain_pattern(raw: &str) -> String {
    let p = raw.trim().to_lowercase();
    if p.is_empty() || p == "*" {
        return p;
    }
    normalize_fetch_host(p.trim_start_matches('.'))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchEnvelope {
    url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    final_url: String,
    status: u16,
    extractor: &'static str,
    truncated: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    response_truncated: bool,
    length: usize,
    text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
}

impl ToolRegistry {
    pub(crate) async fn web_fetch(
        &self,
        raw_url: &str,
        extract_mode: &str,
        max_chars: usize,
    ) -> Result<String, ToolError> {
        let raw_url = raw_url.trim();
        if raw_url.is_empty() {
            return Err(ToolError::InvalidParameters("url is empty".into()));
        }
        let parsed = reqwest::Url::parse(raw_url)
            .map_err(|e| ToolError::InvalidParameters(format!("parse url: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ToolError::Blocked(format!(
                "only http/https allowed: {}",
                parsed.scheme()
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| ToolError::InvalidParameters("missing host".into()))?;
        if let Err(reason) = allow_host_by_policy(
            host,
            self.web_allowed_domains.as_deref(),
            &self.web_blocked_domains,
        ) {
            return Err(ToolError::Blocked(format!("web_fetch blocked: {reason}")));
        }

        let extract_mode = match extract_mode.trim() {
            "text" => "text",
            _ => "markdown",
        };
        let max_chars = if max_chars == 0 {
            50_000
        } else {
            max_chars.max(100)
        };
        let timeout = if self.web_fetch_timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.web_fetch_timeout
        };
        let max_body = if self.web_fetch_max_response == 0 {
            DEFAULT_MAX_RESPONSE
        } else {
            self.web_fetch_max_response
        };

        let allowed = self.web_allowed_domains.clone();
        let blocked = self.web_blocked_domains.clone();
        let redirect_policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error("stopped after 5 redirects");
            }
            let host = attempt.url().host_str().unwrap_or_default().to_string();
            match allow_host_by_policy(&host, allowed.as_deref(), &blocked) {
                Ok(()) => attempt.follow(),
                Err(reason) => attempt.error(format!("redirect blocked: {reason}")),
            }
        });
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(redirect_policy)
            .user_agent("clawgate/0.1")
            .build()
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        debug!(url = raw_url, "web_fetch");
        let response = match client.get(raw_url).send().await {
            Ok(response) => response,
            Err(e) => {
                // Network failures become an error envelope, not a hard
                // failure; the model can react to them.
                let envelope = FetchEnvelope {
                    url: raw_url.to_string(),
                    final_url: String::new(),
                    status: 0,
                    extractor: "error",
                    truncated: false,
                    response_truncated: false,
                    length: 0,
                    text: String::new(),
                    error: e.to_string(),
                };
                return serde_json::to_string(&envelope)
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()));
            }
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();

        let (body, response_truncated) = read_bounded(response, max_body).await?;

        let mut extractor = "raw";
        let mut text;
        if content_type.contains("application/json") {
            match serde_json::from_slice::<serde_json::Value>(&body) {
                Ok(v) => {
                    text = serde_json::to_string_pretty(&v).unwrap_or_default();
                    extractor = "json";
                }
                Err(_) => text = String::from_utf8_lossy(&body).into_owned(),
            }
        } else if content_type.contains("text/html") || looks_like_html(&body) {
            extractor = "html";
            let (title, plain) = extract_html_text(&String::from_utf8_lossy(&body));
            text = if extract_mode == "markdown" && !title.trim().is_empty() {
                format!("# {}\n\n{}", title.trim(), plain)
            } else {
                plain
            };
        } else {
            text = String::from_utf8_lossy(&body).trim().to_string();
        }

        let mut truncated = response_truncated;
        if text.len() > max_chars {
            truncated = true;
            let mut end = max_chars;
            while end > 0 && !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }

        let error = if !(200..300).contains(&status) {
            format!("http {status}")
        } else {
            String::new()
        };

        let envelope = FetchEnvelope {
            url: raw_url.to_string(),
            final_url: if final_url == raw_url {
                String::new()
            } else {
                final_url
            },
            status,
            extractor,
            truncated,
            response_truncated,
            length: text.len(),
            text,
            error,
        };
        serde_json::to_string(&envelope).map_err(|e| ToolError::ExecutionFailed(e.to_string()))
    }
}

async fn read_bounded(
    mut response: reqwest::Response,
    max_body: u64,
) -> Result<(Vec<u8>, bool), ToolError> {
    let mut body: Vec<u8> = Vec::new();
    let mut truncated = false;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("read body: {e}")))?
    {
        if body.len() as u64 + chunk.len() as u64 > max_body {
            let keep = (max_body as usize).saturating_sub(body.len());
            body.extend_from_slice(&chunk[..keep]);
            truncated = true;
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok((body, truncated))
}
