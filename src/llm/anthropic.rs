//! Anthropic Messages API client.
//!
//! The flat message list is reshaped into Anthropic's block format: leading
//! system messages become the `system` field, assistant tool calls become
//! `tool_use` blocks, and tool-role replies become `tool_result` blocks on a
//! user message.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::{ChatMessage, ChatResult, LlmClient, ToolDefinition};
use crate::session::{Role, ToolCall};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug)]
pub struct AnthropicClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnthropicClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        if config.api_key.trim().is_empty() {
            return Err(LlmError::NotConfigured {
                provider: "anthropic".into(),
                reason: "apiKey is empty".into(),
            });
        }
        if config.model.trim().is_empty() {
            return Err(LlmError::NotConfigured {
                provider: "anthropic".into(),
                reason: "model is empty".into(),
            });
        }
        let base_url = if config.base_url.trim().is_empty() {
            "https://api.anthropic.com".to_string()
        } else {
            config.base_url.trim().trim_end_matches('/').to_string()
        };
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: "anthropic".into(),
                reason: e.to_string(),
            })?;
        Ok(Self {
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
impl LlmClient for AnthropicClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResult, LlmError> {
        let (system, wire_messages) = convert_messages(messages);
        let request = WireRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system,
            messages: wire_messages,
            tools: if tools.is_empty() {
                None
            } else {
                Some(
                    tools
                        .iter()
                        .map(|t| WireTool {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            input_schema: t.parameters.clone(),
                        })
                        .collect(),
                )
            },
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: "anthropic".into(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            if status.as_u16() == 401 {
                return Err(LlmError::AuthFailed {
                    provider: "anthropic".into(),
                });
            }
            if status.as_u16() == 429 {
                return Err(LlmError::RateLimited {
                    provider: "anthropic".into(),
                    retry_after: None,
                });
            }
            return Err(LlmError::RequestFailed {
                provider: "anthropic".into(),
                reason: format!("http {}: {}", status, body),
            });
        }

        let parsed: WireResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::InvalidResponse {
                provider: "anthropic".into(),
                reason: format!("parse: {}", e),
            })?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                WireResponseBlock::Text { text } => {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str(&text);
                }
                WireResponseBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: input,
                    });
                }
                WireResponseBlock::Other => {}
            }
        }
        Ok(ChatResult {
            content,
            tool_calls,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Split out the system prompt and reshape the rest into block messages.
fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<WireMessage>) {
    let mut system_parts = Vec::new();
    let mut out: Vec<WireMessage> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.clone()),
            Role::User => out.push(WireMessage {
                role: "user".into(),
                content: vec![WireBlock::Text {
                    text: msg.content.clone(),
                }],
            }),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(WireBlock::Text {
                        text: msg.content.clone(),
                    });
                }
                for call in msg.tool_calls.iter().flatten() {
                    blocks.push(WireBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.arguments.clone(),
                    });
                }
                if blocks.is_empty() {
                    blocks.push(WireBlock::Text {
                        text: String::new(),
                    });
                }
                out.push(WireMessage {
                    role: "assistant".into(),
                    content: blocks,
                });
            }
            Role::Tool => {
                let block = WireBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.content.clone(),
                };
                // Consecutive tool results share one user message.
                match out.last_mut() {
                    Some(last)
                        if last.role == "user"
                            && last
                                .content
                                .iter()
                                .all(|b| matches!(b, WireBlock::ToolResult { .. })) =>
                    {
                        last.content.push(block);
                    }
                    _ => out.push(WireMessage {
                        role: "user".into(),
                        content: vec![block],
                    }),
                }
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, out)
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: Vec<WireBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_become_system_field() {
        let msgs = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ];
        let (system, wire) = convert_messages(&msgs);
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].role, "user");
        assert_eq!(wire[1].role, "assistant");
    }

    #[test]
    fn tool_results_fold_into_one_user_message() {
        let msgs = vec![
            ChatMessage::user("go"),
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![
                    ToolCall {
                        id: "a".into(),
                        name: "read_file".into(),
                        arguments: serde_json::json!({}),
                    },
                    ToolCall {
                        id: "b".into(),
                        name: "list_dir".into(),
                        arguments: serde_json::json!({}),
                    },
                ],
            ),
            ChatMessage::tool_result("a", "read_file", "one"),
            ChatMessage::tool_result("b", "list_dir", "two"),
        ];
        let (_, wire) = convert_messages(&msgs);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[2].role, "user");
        assert_eq!(wire[2].content.len(), 2);
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let err = AnthropicClient::new(&LlmConfig {
            provider: "anthropic".into(),
            model: "claude".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, LlmError::NotConfigured { .. }));
    }
}
