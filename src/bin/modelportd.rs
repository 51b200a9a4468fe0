//! Privileged host process: serves one channel over its own stdin/stdout.
//!
//! Logs go to stderr so stdout carries nothing but protocol lines.

use std::process::ExitCode;
use std::sync::Arc;

use modelport::config::{load_config, models_dir};
use modelport::provider::LlamaServerProvider;
use modelport::transport::stdio_port;
use modelport::ChannelServer;

#[tokio::main]
async fn main() -> ExitCode {
    // Default to info logging if nothing is set.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }

    pretty_env_logger::init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let models_dir = match models_dir() {
        Ok(dir) => dir,
        Err(e) => {
            log::error!("Failed to resolve models directory: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let provider = match LlamaServerProvider::new(config.llama.clone(), &models_dir) {
        Ok(provider) => provider,
        Err(e) => {
            log::error!("Failed to initialize llama-server provider: {}", e);
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "Using llama-server at {} (model {})",
        config.llama.base_url,
        provider.model_path().display()
    );

    let channel = std::env::var("MODELPORT_CHANNEL").unwrap_or(config.channel_name);
    let server = ChannelServer::new(Arc::new(provider));
    server.serve_port(stdio_port(&channel)).await;
    server.shutdown().await;

    ExitCode::SUCCESS
}
