//! Message contract between the channel client and the channel server.

mod messages;
mod types;

pub use messages::{
    message_type, Envelope, Event, EventEnvelope, PromptData, Request, RequestEnvelope,
    RequestKind,
};
pub use types::{
    percent_used, Availability, AvailabilityReport, AvailabilityStatus, Role, Turn, UsageInfo,
};
