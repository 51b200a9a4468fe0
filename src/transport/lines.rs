//! JSON-lines transport: one structured message per line over a byte stream.
//!
//! Used between a client and a `modelportd` child process (its stdin/stdout),
//! and by the daemon itself on its own stdio.

use async_trait::async_trait;
use serde_json::Value;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Port, Transport};
use crate::config::DaemonConfig;
use crate::error::BridgeError;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

/// Windows constant to hide console windows when spawning the daemon.
#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Wraps a reader/writer pair as a [`Port`].
///
/// Lines that are not valid JSON are logged and skipped. The writer is closed
/// once every sender for the port's `tx` has been dropped.
pub fn port_from_io<R, W>(name: &str, reader: R, writer: W) -> Port
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Value>();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Value>();

    let label = name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break, // EOF
                Err(err) => {
                    log::warn!("[{label}] Error reading channel: {}", err);
                    break;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(&line) {
                Ok(value) => {
                    if inbound_tx.send(value).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("[{label}] Failed to parse message: {} - line: {}", e, line);
                }
            }
        }
        log::debug!("[{label}] reader finished");
    });

    let label = name.to_string();
    tokio::spawn(write_lines(label, writer, outbound_rx));

    Port {
        name: name.to_string(),
        tx: outbound_tx,
        rx: inbound_rx,
    }
}

async fn write_lines<W>(label: String, mut writer: W, mut outbound: mpsc::UnboundedReceiver<Value>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(value) = outbound.recv().await {
        let mut line = match serde_json::to_string(&value) {
            Ok(line) => line,
            Err(e) => {
                log::error!("[{label}] Failed to serialize message: {}", e);
                continue;
            }
        };
        line.push('\n');

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            log::warn!("[{label}] Failed to write message: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            log::warn!("[{label}] Failed to flush channel: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
    log::debug!("[{label}] writer finished");
}

/// The daemon's side of the channel: its own stdin and stdout.
pub fn stdio_port(name: &str) -> Port {
    port_from_io(name, tokio::io::stdin(), tokio::io::stdout())
}

/// Spawn a tokio task that drains stderr line-by-line, logging non-empty lines.
///
/// Prevents deadlock when the child process writes to stderr faster than we consume it.
pub fn spawn_stderr_drain<R>(stderr: R, label: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Some(line) = lines.next_line().await.unwrap_or(None) {
            if !line.trim().is_empty() {
                log::debug!("[{label} stderr] {}", line.trim());
            }
        }
    })
}

fn format_exit_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Opens each channel by spawning the host daemon and talking JSON lines
/// over its stdin/stdout.
#[derive(Debug, Clone)]
pub struct ProcessTransport {
    program: String,
    args: Vec<String>,
}

impl ProcessTransport {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn open(&self, name: &str) -> Result<Port, BridgeError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("MODELPORT_CHANNEL", name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // On Windows, hide the console window
        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|e| {
            BridgeError::Channel(format!("Failed to spawn {}: {}", self.program, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Channel("Failed to capture daemon stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Channel("Failed to capture daemon stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::Channel("Failed to capture daemon stderr".to_string()))?;

        spawn_stderr_drain(stderr, "modelportd");
        let port = port_from_io(name, stdout, stdin);

        // The daemon exits on stdin EOF, which follows the port being released.
        let program = self.program.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    log::info!("{} exited ({})", program, format_exit_status(&status));
                }
                Err(err) => log::warn!("Failed to wait for {}: {}", program, err),
            }
        });

        log::info!("Spawned {} for channel '{}'", self.program, name);
        Ok(port)
    }
}
