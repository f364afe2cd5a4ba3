//! Error types for each subsystem.
//!
//! Every component gets its own enum so callers can match on the failures
//! they can actually handle; everything else bubbles up to the component's
//! start return value. Cancellation is modelled explicitly and treated as a
//! clean shutdown, not a failure.

use std::time::Duration;

use thiserror::Error;

/// Errors from the in-process message bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("bus is closed")]
    Closed,
}

/// Errors from the session store.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize session line: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors from message channels.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {name} is not configured: {reason}")]
    NotConfigured { name: String, reason: String },

    #[error("channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("channel {name} failed to send: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("channel stopped: cancelled")]
    Cancelled,
}

/// Errors from tool execution.
///
/// `Blocked` and `InvalidParameters` are surfaced to the model as tool
/// output so it can decide the next step; the rest are execution failures.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("{0}")]
    Blocked(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        ToolError::ExecutionFailed(err.to_string())
    }
}

/// Errors from LLM providers.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider {provider} is not configured: {reason}")]
    NotConfigured { provider: String, reason: String },

    #[error("provider {provider} auth failed")]
    AuthFailed { provider: String },

    #[error("provider {provider} rate limited")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("provider {provider} returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Errors from the cron service.
#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize cron store: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("trigger failed: {0}")]
    Trigger(String),
}

/// Top-level gateway errors (fatal startup failures).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
