//! LLM integration.
//!
//! The rest of the gateway sees one capability: `chat(messages, tools)`
//! returning text plus any requested tool calls. Provider wire formats live
//! behind [`LlmClient`]; `create_client` picks the implementation from
//! config.

mod anthropic;
mod openai;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiCompatClient;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::session::{Role, ToolCall};

/// One message in a chat request.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Set on tool-role replies.
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    /// Set on assistant turns that requested tool calls.
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Self::plain(Role::Tool, content)
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: None,
        }
    }
}

/// A tool the model may call, described as a JSON schema.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Result of one chat call.
#[derive(Debug, Clone, Default)]
pub struct ChatResult {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResult {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// The single LLM capability the gateway depends on.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResult, LlmError>;

    fn model_name(&self) -> &str;
}

/// Build an LLM client from config.
pub fn create_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    let provider = config.provider.trim().to_ascii_lowercase();
    let provider = match provider.as_str() {
        "local" => "ollama".to_string(),
        _ => provider,
    };
    match provider.as_str() {
        "" | "openai" | "openrouter" | "ollama" => {
            Ok(Arc::new(OpenAiCompatClient::new(&provider, config)?))
        }
        "anthropic" => Ok(Arc::new(AnthropicClient::new(config)?)),
        other => Err(LlmError::NotConfigured {
            provider: other.to_string(),
            reason: "unsupported provider".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_rejected() {
        let cfg = LlmConfig {
            provider: "frobnicator".into(),
            ..Default::default()
        };
        assert!(matches!(
            create_client(&cfg),
            Err(LlmError::NotConfigured { .. })
        ));
    }

    #[test]
    fn local_is_an_alias_for_ollama() {
        let cfg = LlmConfig {
            provider: "local".into(),
            model: "llama3".into(),
            ..Default::default()
        };
        let client = create_client(&cfg).unwrap();
        assert_eq!(client.model_name(), "llama3");
    }

    #[test]
    fn chat_message_constructors() {
        let msg = ChatMessage::tool_result("call_1", "exec", "exit=0");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.name.as_deref(), Some("exec"));

        let msg = ChatMessage::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                id: "call_2".into(),
                name: "read_file".into(),
                arguments: serde_json::json!({"path": "a.txt"}),
            }],
        );
        assert_eq!(msg.tool_calls.as_ref().unwrap().len(), 1);
    }
}
