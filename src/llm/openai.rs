//! OpenAI-compatible chat completions client.
//!
//! Covers OpenAI itself plus OpenRouter and Ollama, which speak the same
//! `/chat/completions` wire format and differ only in base URL and auth.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::{ChatMessage, ChatResult, LlmClient, ToolDefinition};
use crate::session::{Role, ToolCall};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug)]
pub struct OpenAiCompatClient {
    provider: String,
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiCompatClient {
    pub fn new(provider: &str, config: &LlmConfig) -> Result<Self, LlmError> {
        let provider = if provider.is_empty() {
            "openai".to_string()
        } else {
            provider.to_string()
        };
        let base_url = if config.base_url.trim().is_empty() {
            match provider.as_str() {
                "openrouter" => "https://openrouter.ai/api/v1".to_string(),
                "ollama" => "http://localhost:11434/v1".to_string(),
                _ => "https://api.openai.com/v1".to_string(),
            }
        } else {
            config.base_url.trim().trim_end_matches('/').to_string()
        };
        if config.model.trim().is_empty() {
            return Err(LlmError::NotConfigured {
                provider,
                reason: "model is empty".into(),
            });
        }
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: provider.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            provider,
            client,
            base_url,
            api_key: config.api_key.trim().to_string(),
            model: config.model.trim().to_string(),
            max_tokens: if config.max_tokens == 0 {
                8192
            } else {
                config.max_tokens
            },
            temperature: config.temperature.unwrap_or(0.7),
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResult, LlmError> {
        let request = WireRequest {
            model: self.model.clone(),
            messages: messages.iter().map(wire_message).collect(),
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
            tools: if tools.is_empty() {
                None
            } else {
                Some(tools.iter().map(wire_tool).collect())
            },
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, "llm chat request");

        let mut req = self.client.post(&url).json(&request);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let response = req.send().await.map_err(|e| LlmError::RequestFailed {
            provider: self.provider.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            if status.as_u16() == 401 {
                return Err(LlmError::AuthFailed {
                    provider: self.provider.clone(),
                });
            }
            if status.as_u16() == 429 {
                return Err(LlmError::RateLimited {
                    provider: self.provider.clone(),
                    retry_after: None,
                });
            }
            return Err(LlmError::RequestFailed {
                provider: self.provider.clone(),
                reason: format!("http {}: {}", status, truncate_body(&body)),
            });
        }

        let parsed: WireResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::InvalidResponse {
                provider: self.provider.clone(),
                reason: format!("parse: {}", e),
            })?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: self.provider.clone(),
                reason: "no choices".into(),
            })?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or_else(|_| serde_json::json!({})),
            })
            .collect();

        Ok(ChatResult {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while end > 0 && !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    }
}

fn wire_message(msg: &ChatMessage) -> WireMessage {
    WireMessage {
        role: match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
        .to_string(),
        content: Some(msg.content.clone()),
        tool_call_id: msg.tool_call_id.clone(),
        name: msg.name.clone(),
        tool_calls: msg.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|tc| WireToolCall {
                    id: tc.id.clone(),
                    call_type: "function".to_string(),
                    function: WireFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.to_string(),
                    },
                })
                .collect()
        }),
    }
}

fn wire_tool(tool: &ToolDefinition) -> WireTool {
    WireTool {
        tool_type: "function".to_string(),
        function: WireFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        },
    }
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OpenAiCompatClient {
        OpenAiCompatClient::new(
            "openai",
            &LlmConfig {
                model: "gpt-test".into(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn requires_a_model() {
        let err = OpenAiCompatClient::new("openai", &LlmConfig::default()).unwrap_err();
        assert!(matches!(err, LlmError::NotConfigured { .. }));
    }

    #[test]
    fn tool_call_arguments_serialized_as_string() {
        let msg = ChatMessage::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                id: "call_1".into(),
                name: "exec".into(),
                arguments: serde_json::json!({"command": "ls"}),
            }],
        );
        let wire = wire_message(&msg);
        let calls = wire.tool_calls.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(parsed["command"], "ls");
    }

    #[test]
    fn base_url_defaults_per_provider() {
        let c = client();
        assert_eq!(c.base_url, "https://api.openai.com/v1");
        let c = OpenAiCompatClient::new(
            "ollama",
            &LlmConfig {
                model: "m".into(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(c.base_url, "http://localhost:11434/v1");
    }
}
