// packages/relay/src/executor/request.rs
//! Execution request and response wire types

use crate::utils::errors::{RelayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Chat room a command was issued from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatRoom {
    pub id: Option<String>,
    pub name: String,
}

/// Chat user that issued a command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Requestor {
    pub id: Option<String>,
    pub handle: String,
}

/// Inbound request to run one bundle command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionRequest {
    pub room: ChatRoom,
    pub requestor: Requestor,

    /// Upstream user record, passed through untouched
    pub user: Value,

    /// `bundle:command` reference
    pub command: String,

    /// Named options
    pub options: Map<String, Value>,

    /// Positional arguments
    pub args: Vec<Value>,

    /// Per-invocation dynamic configuration
    pub command_config: Option<Map<String, Value>>,

    /// Context object written to the command's stdin
    pub cog_env: Value,

    /// Topic the response is published to
    pub reply_to: String,

    /// Explicit pipeline correlation ID; usually absent and carried by
    /// `reply_to` instead
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pipeline_id: String,
}

impl ExecutionRequest {
    /// Decode a request from bus payload bytes
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let request: ExecutionRequest = serde_json::from_slice(payload)?;
        if request.reply_to.is_empty() {
            return Err(RelayError::InvalidRequest("missing reply_to".into()));
        }
        Ok(request)
    }

    /// Pipeline correlation ID: `pipeline_id` when set, otherwise the `<id>`
    /// segment of a `/bot/pipelines/<id>/replies` reply topic
    pub fn correlation_id(&self) -> &str {
        if !self.pipeline_id.is_empty() {
            return &self.pipeline_id;
        }

        let mut segments = self.reply_to.split('/').filter(|s| !s.is_empty());
        while let Some(segment) = segments.next() {
            if segment == "pipelines" {
                return segments.next().unwrap_or("");
            }
        }
        ""
    }

    /// Split `bundle:command` on the first colon
    pub fn bundle_and_command(&self) -> Result<(&str, &str)> {
        match self.command.split_once(':') {
            Some((bundle, command)) if !bundle.is_empty() && !command.is_empty() => Ok((bundle, command)),
            _ => Err(RelayError::InvalidRequest(format!(
                "command '{}' is not of the form bundle:command",
                self.command
            ))),
        }
    }
}

/// Best-effort reply address from a payload that failed to decode
pub fn recover_reply_to(payload: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    value
        .get("reply_to")
        .and_then(Value::as_str)
        .filter(|topic| !topic.is_empty())
        .map(str::to_string)
}

/// Terminal status of an execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    #[default]
    Ok,
    Error,
    Abort,
}

impl ResponseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseStatus::Ok => "ok",
            ResponseStatus::Error => "error",
            ResponseStatus::Abort => "abort",
        }
    }
}

/// Response published to the request's reply topic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template: String,

    pub status: ResponseStatus,

    #[serde(default)]
    pub status_message: String,

    #[serde(default)]
    pub body: Option<Value>,

    /// Body came from a JSON section rather than collected lines
    #[serde(skip)]
    pub is_json: bool,
}

impl ExecutionResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            status_message: message.into(),
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
