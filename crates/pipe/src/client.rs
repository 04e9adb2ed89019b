//! Connection-per-call JSON-RPC transport to the host process.
//!
//! Host RPCs are low-frequency, independent calls, so every call opens a
//! fresh pipe connection, writes one newline-terminated request, reads one
//! reply line, and tears the connection down. A stuck call can never block
//! an unrelated one.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use webcell_core::{Error, Paths, PipeConfig, Result};

pub struct PipeClient {
    path: PathBuf,
    timeout: Duration,
    next_id: AtomicU64,
}

impl PipeClient {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &PipeConfig) -> Self {
        Self::new(
            Paths::pipe_path(&config.socket_name),
            Duration::from_millis(config.call_timeout_ms),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One request/reply exchange with the default timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.call_with_timeout(method, params, self.timeout).await
    }

    /// One request/reply exchange. Exactly one of six outcomes occurs:
    /// result, remote error, malformed reply, connection error, closed
    /// without reply, or timeout; the connection is torn down on all of
    /// them.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        match tokio::time::timeout(timeout, self.exchange(id, method, params)).await {
            Ok(result) => result,
            // Dropping the exchange future destroys its connection.
            Err(_) => Err(Error::Timeout(format!(
                "pipe call '{}' timed out after {}ms",
                method,
                timeout.as_millis()
            ))),
        }
    }

    async fn exchange(&self, id: u64, method: &str, params: Value) -> Result<Value> {
        let stream = self.connect().await?;
        let (read_half, mut write_half) = tokio::io::split(stream);

        let mut line = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();
        line.push('\n');
        debug!(id, method, "pipe request");

        write_half
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Transport(format!("failed to write request '{}': {}", method, e)))?;
        write_half
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("failed to flush request '{}': {}", method, e)))?;

        // The protocol is one reply line per request; no streaming.
        let mut reader = BufReader::new(read_half);
        let mut reply = String::new();
        let n = reader
            .read_line(&mut reply)
            .await
            .map_err(|e| Error::Transport(format!("failed to read reply to '{}': {}", method, e)))?;
        if n == 0 {
            return Err(Error::ChannelClosed(format!(
                "host closed the pipe before replying to '{}'; the host process may not be running",
                method
            )));
        }

        parse_reply(&reply)
    }

    #[cfg(unix)]
    async fn connect(&self) -> Result<tokio::net::UnixStream> {
        tokio::net::UnixStream::connect(&self.path)
            .await
            .map_err(|e| {
                Error::Transport(format!(
                    "failed to connect to host pipe {}: {}",
                    self.path.display(),
                    e
                ))
            })
    }

    #[cfg(windows)]
    async fn connect(&self) -> Result<tokio::net::windows::named_pipe::NamedPipeClient> {
        tokio::net::windows::named_pipe::ClientOptions::new()
            .open(&self.path)
            .map_err(|e| {
                Error::Transport(format!(
                    "failed to connect to host pipe {}: {}",
                    self.path.display(),
                    e
                ))
            })
    }
}

/// Validate one reply line: `jsonrpc` must be present and exactly one of
/// `result`/`error` carries the outcome.
fn parse_reply(raw: &str) -> Result<Value> {
    let val: Value = serde_json::from_str(raw.trim())
        .map_err(|e| Error::Protocol(format!("malformed reply line: {}", e)))?;

    if val.get("jsonrpc").is_none() || (val.get("result").is_none() && val.get("error").is_none()) {
        return Err(Error::Protocol(
            "invalid JSON-RPC reply: expected a jsonrpc envelope with result or error".to_string(),
        ));
    }

    if let Some(err) = val.get("error") {
        return Err(Error::Remote {
            code: err.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
            message: err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown remote error")
                .to_string(),
        });
    }

    Ok(val.get("result").cloned().unwrap_or(Value::Null))
}
