//! Control channel message types.
//!
//! The control channel is a request/reply side channel next to the data
//! channel, used for out-of-band commands such as "save the current
//! snapshot now".
//!
//! - Consumer → Producer: [`ControlRequest`]
//! - Producer → Consumer: [`ControlReply`]
//!
//! Messages are serialized as JSON over WebSocket text frames.

use serde::{Deserialize, Serialize};

/// Request sent to a producer's control endpoint.
///
/// Requests carry no arguments. Where a save lands is decided by the
/// producer alone and reported back in [`ControlReply::path`].
///
/// # Example
/// ```json
/// { "command": "save" }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ControlRequest {
    /// Persist the latest published snapshot to the producer's configured file.
    Save,

    /// Liveness check.
    Ping,
}

impl ControlRequest {
    pub fn save() -> Self {
        ControlRequest::Save
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::Save => "save",
            ControlRequest::Ping => "ping",
        }
    }
}

/// Outcome of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplyState {
    Completed,
    Failed,
}

/// Reply to a [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    pub state: ReplyState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// File written by a save request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Producer timestamp in ISO 8601 format.
    pub timestamp: String,
}

impl ControlReply {
    pub fn completed(message: impl Into<String>) -> Self {
        Self::with_state(ReplyState::Completed, message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::with_state(ReplyState::Failed, message.into())
    }

    /// Attach the path a save request wrote to.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn is_completed(&self) -> bool {
        self.state == ReplyState::Completed
    }

    fn with_state(state: ReplyState, message: String) -> Self {
        Self {
            state,
            message: Some(message),
            path: None,
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}
