//! Request and event messages exchanged over the channel.
//!
//! Every message is a JSON object with a kebab-case `type` discriminator and
//! kind-specific payload fields. A numeric `id` field correlates events with
//! the request that caused them; `0` means uncorrelated.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{AvailabilityStatus, Turn, UsageInfo};

/// Payload of a `prompt-streaming` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptData {
    pub messages: Vec<Turn>,
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Request {
    CheckAvailability,
    DownloadModel,
    CreateSession,
    PromptStreaming { data: PromptData },
    GetUsageInfo,
    DestroySession,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::CheckAvailability => RequestKind::CheckAvailability,
            Request::DownloadModel => RequestKind::DownloadModel,
            Request::CreateSession => RequestKind::CreateSession,
            Request::PromptStreaming { .. } => RequestKind::PromptStreaming,
            Request::GetUsageInfo => RequestKind::GetUsageInfo,
            Request::DestroySession => RequestKind::DestroySession,
        }
    }
}

/// Discriminator of a [`Request`], without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    CheckAvailability,
    DownloadModel,
    CreateSession,
    PromptStreaming,
    GetUsageInfo,
    DestroySession,
}

impl RequestKind {
    /// Download and prompt hold the server's single abort controller.
    pub fn is_cancelable(self) -> bool {
        matches!(self, RequestKind::DownloadModel | RequestKind::PromptStreaming)
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestKind::CheckAvailability => "check-availability",
            RequestKind::DownloadModel => "download-model",
            RequestKind::CreateSession => "create-session",
            RequestKind::PromptStreaming => "prompt-streaming",
            RequestKind::GetUsageInfo => "get-usage-info",
            RequestKind::DestroySession => "destroy-session",
        };
        write!(f, "{}", name)
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    Availability {
        status: AvailabilityStatus,
        message: String,
    },
    DownloadProgress {
        progress: f64,
    },
    DownloadComplete,
    SessionCreated,
    Chunk {
        content: String,
    },
    Complete,
    UsageInfo {
        data: Option<UsageInfo>,
    },
    SessionDestroyed,
    Error {
        message: String,
    },
}

impl Event {
    /// Terminal events settle the request that caused them; progress and
    /// chunk events may repeat.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Event::DownloadProgress { .. } | Event::Chunk { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Availability { .. } => "availability",
            Event::DownloadProgress { .. } => "download-progress",
            Event::DownloadComplete => "download-complete",
            Event::SessionCreated => "session-created",
            Event::Chunk { .. } => "chunk",
            Event::Complete => "complete",
            Event::UsageInfo { .. } => "usage-info",
            Event::SessionDestroyed => "session-destroyed",
            Event::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Event::Error {
            message: message.into(),
        }
    }
}

/// A message body plus its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub id: u64,
    pub body: T,
}

pub type RequestEnvelope = Envelope<Request>;
pub type EventEnvelope = Envelope<Event>;

impl<T> Envelope<T> {
    pub fn new(id: u64, body: T) -> Self {
        Self { id, body }
    }
}

impl<T: Serialize> Envelope<T> {
    /// Encodes the body and stamps the correlation id next to `type`.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(&self.body)?;
        if let Value::Object(map) = &mut value {
            map.insert("id".to_string(), Value::from(self.id));
        }
        Ok(value)
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Decodes a structured message. A missing or non-numeric `id` reads as 0.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let id = value.get("id").and_then(Value::as_u64).unwrap_or(0);
        let body = serde_json::from_value(value)?;
        Ok(Self { id, body })
    }
}

/// Reads the `type` discriminator without decoding the rest.
pub fn message_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}
