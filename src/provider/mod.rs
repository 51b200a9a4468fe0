//! Model provider abstraction.
//!
//! The server is the only component that talks to a provider. A provider
//! answers availability queries, provisions (downloads) the model, and creates
//! sessions; a session streams text fragments for a conversation.

mod abort;
pub mod llama;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::protocol::Turn;

pub use abort::{AbortController, AbortSignal};
pub use llama::LlamaServerProvider;

/// Lazily produced text fragments of one model turn.
pub type FragmentStream = BoxStream<'static, Result<String, ProviderError>>;

/// Download progress subscriber, called with a fraction in `[0, 1]`.
pub type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;

/// Availability as reported by the provider, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderAvailability {
    Available,
    Downloadable,
    Downloading,
    Unavailable,
    /// Any status value the provider reports that has no canonical meaning.
    Other(String),
}

/// Error type for provider operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The capability is missing entirely on this host.
    #[error("{0}")]
    Unsupported(String),
    #[error("{0}")]
    Failed(String),
    #[error("Operation aborted")]
    Aborted,
}

/// A live model session. At most one exists per server at any time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelSession: Send + Sync {
    /// Returns the session ID.
    fn id(&self) -> String;

    /// Tokens consumed by the conversation so far.
    fn input_usage(&self) -> u64;

    /// Context window size in tokens.
    fn input_quota(&self) -> u64;

    /// Streams the model's reply to `turns`. Implementations should stop
    /// producing once `signal` is aborted.
    async fn prompt_streaming(
        &self,
        turns: Vec<Turn>,
        signal: AbortSignal,
    ) -> Result<FragmentStream, ProviderError>;

    /// Releases the session. Further prompts must fail.
    async fn destroy(&self);
}

/// The on-device model capability.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn availability(&self) -> Result<ProviderAvailability, ProviderError>;

    async fn create_session(&self) -> Result<Arc<dyn ModelSession>, ProviderError>;

    /// Provisions the model, reporting progress. Must return
    /// [`ProviderError::Aborted`] promptly once `signal` fires.
    async fn download(
        &self,
        on_progress: ProgressFn,
        signal: AbortSignal,
    ) -> Result<(), ProviderError>;
}
