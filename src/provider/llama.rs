//! Provider backed by a local llama.cpp server speaking the OpenAI chat API.
//!
//! The model weights are a single file under the models directory. Download
//! streams them from the configured URL, and a running `llama-server` serves
//! prompts against whatever model it has loaded.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{
    AbortSignal, FragmentStream, ModelProvider, ModelSession, ProgressFn, ProviderAvailability,
    ProviderError,
};
use crate::config::LlamaConfig;
use crate::protocol::Turn;

/// Provider for an OpenAI-compatible llama.cpp server.
pub struct LlamaServerProvider {
    client: reqwest::Client,
    config: LlamaConfig,
    model_path: PathBuf,
    /// Downloads still running, including aborted ones that have not unwound yet.
    active_downloads: Arc<AtomicUsize>,
}

impl LlamaServerProvider {
    pub fn new(config: LlamaConfig, models_dir: &Path) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Failed(format!("Failed to build HTTP client: {}", e)))?;
        let model_path = models_dir.join(&config.model_file);

        Ok(Self {
            client,
            config,
            model_path,
            active_downloads: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Probes `/health`. llama-server answers 503 while it is still loading.
    async fn server_health(&self) -> Result<ProviderAvailability, ProviderError> {
        let response = self
            .client
            .get(self.endpoint("/health"))
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .send()
            .await
            .map_err(|e| {
                ProviderError::Unsupported(format!(
                    "llama-server not reachable at {}: {}",
                    self.config.base_url, e
                ))
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(ProviderAvailability::Available)
        } else if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            Ok(ProviderAvailability::Other("loading".to_string()))
        } else {
            Ok(ProviderAvailability::Other(format!("http {}", status.as_u16())))
        }
    }
}

struct DownloadGuard(Arc<AtomicUsize>);

impl DownloadGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn download_error(err: impl std::fmt::Display) -> ProviderError {
    ProviderError::Failed(format!("Model download failed: {}", err))
}

#[async_trait]
impl ModelProvider for LlamaServerProvider {
    async fn availability(&self) -> Result<ProviderAvailability, ProviderError> {
        if self.active_downloads.load(Ordering::SeqCst) > 0 {
            return Ok(ProviderAvailability::Downloading);
        }

        if !self.model_path.exists() {
            return Ok(if self.config.model_url.is_some() {
                ProviderAvailability::Downloadable
            } else {
                ProviderAvailability::Unavailable
            });
        }

        self.server_health().await
    }

    async fn create_session(&self) -> Result<Arc<dyn ModelSession>, ProviderError> {
        match self.server_health().await {
            Ok(ProviderAvailability::Available) => {}
            Ok(other) => {
                return Err(ProviderError::Failed(format!(
                    "llama-server is not ready ({:?})",
                    other
                )))
            }
            Err(ProviderError::Unsupported(reason)) => return Err(ProviderError::Failed(reason)),
            Err(err) => return Err(err),
        }

        let session = LlamaSession {
            id: Uuid::new_v4().to_string(),
            client: self.client.clone(),
            completions_url: self.endpoint("/v1/chat/completions"),
            quota: self.config.context_size,
            usage: Arc::new(AtomicU64::new(0)),
            destroyed: AtomicBool::new(false),
        };
        log::info!("llama session created: id={}", session.id);
        Ok(Arc::new(session))
    }

    async fn download(
        &self,
        on_progress: ProgressFn,
        signal: AbortSignal,
    ) -> Result<(), ProviderError> {
        let url = self.config.model_url.clone().ok_or_else(|| {
            ProviderError::Unsupported("No model_url configured for download".to_string())
        })?;
        let _guard = DownloadGuard::enter(&self.active_downloads);

        let dir = self
            .model_path
            .parent()
            .ok_or_else(|| download_error("model path has no parent directory"))?
            .to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(download_error)?;

        log::info!("Downloading model: url={}, dest={}", url, self.model_path.display());

        let response = tokio::select! {
            biased;
            _ = signal.aborted() => return Err(ProviderError::Aborted),
            response = self.client.get(&url).send() => response.map_err(download_error)?,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(download_error(format!("HTTP {}", status)));
        }
        let total = response.content_length().filter(|len| *len > 0);

        // Dropping the temp file on any early return deletes the partial download.
        let temp = NamedTempFile::new_in(&dir).map_err(download_error)?;
        let mut file = tokio::fs::File::from_std(temp.reopen().map_err(download_error)?);
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;
        let mut body = response.bytes_stream();

        on_progress(0.0);
        loop {
            let next = tokio::select! {
                biased;
                _ = signal.aborted() => return Err(ProviderError::Aborted),
                next = body.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(download_error)?;

            file.write_all(&chunk).await.map_err(download_error)?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;

            if let Some(total) = total {
                on_progress((downloaded as f64 / total as f64).min(1.0));
            }
        }
        file.flush().await.map_err(download_error)?;
        file.sync_all().await.map_err(download_error)?;
        drop(file);

        if let Some(expected) = &self.config.sha256 {
            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(download_error(format!(
                    "checksum mismatch (expected {}, got {})",
                    expected, actual
                )));
            }
        }

        if signal.is_aborted() {
            return Err(ProviderError::Aborted);
        }
        temp.persist(&self.model_path)
            .map_err(|e| download_error(e.error))?;
        on_progress(1.0);

        log::info!("Model download complete: {} bytes", downloaded);
        Ok(())
    }
}

/// One conversation against llama-server. The server is stateless, so the
/// full turn sequence is resent on every prompt.
pub struct LlamaSession {
    id: String,
    client: reqwest::Client,
    completions_url: String,
    quota: u64,
    usage: Arc<AtomicU64>,
    destroyed: AtomicBool,
}

/// Content and usage carried by one SSE `data:` payload.
#[derive(Debug, Default, PartialEq, Eq)]
struct SseDelta {
    content: Option<String>,
    context_tokens: Option<u64>,
}

fn parse_sse_data(data: &str) -> Result<SseDelta, ProviderError> {
    let trimmed = data.trim();
    if trimmed.is_empty() || trimmed == "[DONE]" {
        return Ok(SseDelta::default());
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| ProviderError::Failed(format!("Failed to parse SSE JSON: {}", e)))?;

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .unwrap_or("Unknown error");
        return Err(ProviderError::Failed(message.to_string()));
    }

    let content = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    // The whole conversation is resent each time, so prompt + completion is
    // the context the session occupies after this turn.
    let context_tokens = value.get("usage").map(|usage| {
        let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
        let completion = usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        prompt + completion
    });

    Ok(SseDelta {
        content,
        context_tokens,
    })
}

#[async_trait]
impl ModelSession for LlamaSession {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn input_usage(&self) -> u64 {
        self.usage.load(Ordering::SeqCst)
    }

    fn input_quota(&self) -> u64 {
        self.quota
    }

    async fn prompt_streaming(
        &self,
        turns: Vec<Turn>,
        signal: AbortSignal,
    ) -> Result<FragmentStream, ProviderError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ProviderError::Failed("Session has been destroyed".to_string()));
        }

        let body = json!({
            "messages": turns,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        let response = tokio::select! {
            biased;
            _ = signal.aborted() => return Err(ProviderError::Aborted),
            response = self.client.post(&self.completions_url).json(&body).send() => {
                response.map_err(|e| ProviderError::Failed(format!("Prompt request failed: {}", e)))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Failed(format!(
                "Prompt failed: HTTP {}: {}",
                status,
                text.trim()
            )));
        }

        let usage = self.usage.clone();
        let fragments = response
            .bytes_stream()
            .eventsource()
            .filter_map(move |item| {
                let usage = usage.clone();
                async move {
                    let event = match item {
                        Ok(event) => event,
                        Err(e) => {
                            return Some(Err(ProviderError::Failed(format!(
                                "Stream error: {}",
                                e
                            ))))
                        }
                    };
                    match parse_sse_data(&event.data) {
                        Ok(delta) => {
                            if let Some(tokens) = delta.context_tokens {
                                usage.store(tokens, Ordering::SeqCst);
                            }
                            delta.content.map(Ok)
                        }
                        Err(e) => Some(Err(e)),
                    }
                }
            })
            .take_until(async move { signal.aborted().await });

        Ok(fragments.boxed())
    }

    async fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            log::info!("llama session destroyed: id={}", self.id);
        }
    }
}
