//! web_search tool backed by the Brave Search API.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::ToolError;
use crate::tools::ToolRegistry;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_ATTEMPTS: usize = 3; // initial try + up to 2 retries

#[derive(Debug, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: BraveWeb,
}

#[derive(Debug, Default, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: String,
}

/// Format a Brave response body as a numbered result list.
pub fn format_brave_results(query: &str, count: usize, body: &[u8]) -> String {
    let Ok(parsed) = serde_json::from_slice::<BraveResponse>(body) else {
        return "Error: failed to parse search results".into();
    };
    let mut results = parsed.web.results;
    if results.is_empty() {
        return format!("No results for: {query}");
    }
    let count = if count == 0 || count > 10 { 5 } else { count };
    results.truncate(count);

    let mut lines = vec![format!("Results for: {query}\n")];
    for (i, item) in results.iter().enumerate() {
        let title = item.title.trim();
        let title = if title.is_empty() { "(no title)" } else { title };
        lines.push(format!("{}. {}\n   {}", i + 1, title, item.url.trim()));
        let desc = item.description.trim();
        if !desc.is_empty() {
            lines.push(format!("   {desc}"));
        }
    }
    lines.join("\n")
}

impl ToolRegistry {
    pub(crate) async fn web_search(&self, query: &str, count: usize) -> Result<String, ToolError> {
        if self.brave_api_key.trim().is_empty() {
            return Err(ToolError::ExecutionFailed(
                "braveApiKey not configured (config.tools.web.braveApiKey)".into(),
            ));
        }
        let query = query.trim();
        if query.is_empty() {
            return Err(ToolError::InvalidParameters("query is empty".into()));
        }
        let count = if count == 0 || count > 10 { 5 } else { count };

        let client = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let mut last_err = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            debug!(query, attempt, "web_search");
            let res = client
                .get("https://api.search.brave.com/res/v1/web/search")
                .query(&[("q", query), ("count", &count.to_string())])
                .header("Accept", "application/json")
                .header("X-Subscription-Token", self.brave_api_key.trim())
                .send()
                .await;
            match res {
                Ok(response) => {
                    let status = response.status();
                    let body = response.bytes().await.unwrap_or_default();
                    if status.is_success() {
                        return Ok(format_brave_results(query, count, &body));
                    }
                    last_err = format!(
                        "brave http {}: {}",
                        status,
                        String::from_utf8_lossy(&body).trim()
                    );
                    // Only transient statuses are worth another attempt.
                    if !(status.as_u16() == 429 || status.is_server_error()) {
                        break;
                    }
                }
                Err(e) => {
                    last_err = e.to_string();
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
            }
        }
        Err(ToolError::ExecutionFailed(last_err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_numbered_results() {
        let body = serde_json::json!({
            "web": { "results": [
                { "title": "First", "url": "https://a.example", "description": "the first" },
                { "title": "", "url": "https://b.example", "description": "" },
            ]}
        });
        let out = format_brave_results("rust", 5, body.to_string().as_bytes());
        assert!(out.starts_with("Results for: rust"));
        assert!(out.contains("1. First"));
        assert!(out.contains("   the first"));
        assert!(out.contains("2. (no title)"));
    }

    #[test]
    fn empty_results_and_bad_json() {
        let body = serde_json::json!({"web": {"results": []}});
        assert_eq!(
            format_brave_results("q", 5, body.to_string().as_bytes()),
            "No results for: q"
        );
        assert!(format_brave_results("q", 5, b"not json").starts_with("Error:"));
    }

    #[test]
    fn count_is_clamped() {
        let results: Vec<_> = (0..10)
            .map(|i| serde_json::json!({"title": format!("t{i}"), "url": "u", "description": ""}))
            .collect();
        let body = serde_json::json!({"web": {"results": results}});
        let out = format_brave_results("q", 99, body.to_string().as_bytes());
        // Out-of-range count falls back to 5 entries.
        assert!(out.contains("5. t4"));
        assert!(!out.contains("6. t5"));
    }
}
