//! Payload types shared by requests and events.

use serde::{Deserialize, Serialize};

use crate::provider::{ProviderAvailability, ProviderError};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One role-tagged message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Context window usage of the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageInfo {
    pub input_usage: u64,
    pub input_quota: u64,
    pub percent_used: u32,
}

impl UsageInfo {
    pub fn new(input_usage: u64, input_quota: u64) -> Self {
        Self {
            input_usage,
            input_quota,
            percent_used: percent_used(input_usage, input_quota),
        }
    }
}

/// `round(100 * usage / quota)`. A zero quota reports 0%.
pub fn percent_used(usage: u64, quota: u64) -> u32 {
    if quota == 0 {
        return 0;
    }
    (100.0 * usage as f64 / quota as f64).round() as u32
}

/// Normalized availability state reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AvailabilityStatus {
    Ready,
    NeedsDownload,
    Downloading,
    Unavailable,
    Error,
}

impl AvailabilityStatus {
    /// A model is usable now or after a download.
    pub fn is_available(self) -> bool {
        matches!(self, AvailabilityStatus::Ready | AvailabilityStatus::NeedsDownload)
    }
}

impl std::fmt::Display for AvailabilityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AvailabilityStatus::Ready => "ready",
            AvailabilityStatus::NeedsDownload => "needs-download",
            AvailabilityStatus::Downloading => "downloading",
            AvailabilityStatus::Unavailable => "unavailable",
            AvailabilityStatus::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Status plus explanation, as carried by the `availability` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityReport {
    pub status: AvailabilityStatus,
    pub message: String,
}

impl AvailabilityReport {
    /// Maps a provider availability query outcome onto exactly one status.
    pub fn from_query(result: Result<ProviderAvailability, ProviderError>) -> Self {
        match result {
            Ok(availability) => Self::from(availability),
            Err(ProviderError::Unsupported(reason)) => Self {
                status: AvailabilityStatus::Unavailable,
                message: format!("On-device model is not supported: {}", reason),
            },
            Err(err) => Self {
                status: AvailabilityStatus::Error,
                message: format!("Error checking availability: {}", err),
            },
        }
    }
}

impl From<ProviderAvailability> for AvailabilityReport {
    fn from(availability: ProviderAvailability) -> Self {
        let (status, message) = match availability {
            ProviderAvailability::Available => {
                (AvailabilityStatus::Ready, "Model is ready".to_string())
            }
            ProviderAvailability::Downloadable => (
                AvailabilityStatus::NeedsDownload,
                "Model needs to be downloaded".to_string(),
            ),
            ProviderAvailability::Downloading => (
                AvailabilityStatus::Downloading,
                "Model is currently downloading".to_string(),
            ),
            ProviderAvailability::Unavailable => (
                AvailabilityStatus::Unavailable,
                "Model is not available on this device".to_string(),
            ),
            ProviderAvailability::Other(raw) => (
                AvailabilityStatus::Unavailable,
                format!("Unknown availability status: {}", raw),
            ),
        };
        Self { status, message }
    }
}

/// Result of `ChannelClient::check_availability`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub available: bool,
    pub status: AvailabilityStatus,
    pub message: String,
}

impl Availability {
    pub fn new(status: AvailabilityStatus, message: String) -> Self {
        Self {
            available: status.is_available(),
            status,
            message,
        }
    }
}
