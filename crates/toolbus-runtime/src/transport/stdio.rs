//! STDIO transport: MCP servers running as child processes.
//!
//! Frames are newline-delimited JSON on the child's stdin/stdout. A
//! reader task routes responses to per-request channels and forwards
//! notifications; stderr is drained onto the structured log. The whole
//! call (write request, await response) is serialized behind a gate -
//! one shared pipe means interleaved calls buy nothing and unbounded
//! pipelining can balloon the child's queue.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use toolbus_core::{McpError, ServerName, TransportKind};

use super::wire::{PendingCalls, RequestIdGen, RpcMessage, RpcNotification, RpcRequest};
use super::{route_message, NotificationRouter, Transport};

/// Child process MCP transport.
pub struct StdioTransport {
    server: ServerName,
    command: String,
    child: TokioMutex<Option<Child>>,
    stdin: TokioMutex<ChildStdin>,
    pending: Arc<PendingCalls>,
    ids: RequestIdGen,
    /// One in-flight request per pipe; see module docs.
    call_gate: TokioMutex<()>,
    reader: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Resolve the command on PATH, spawn the child, and wire up the
    /// reader tasks. No handshake happens here - the manager drives
    /// `initialize` through `request`.
    pub fn spawn(
        server: ServerName,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        router: NotificationRouter,
    ) -> Result<Self, McpError> {
        let command_path = which::which(command)
            .or_else(|_| which::which(format!("{}.exe", command)))
            .map_err(|_| {
                McpError::ConnectFailed(format!(
                    "command not found: {}. Ensure it's installed and in PATH.",
                    command
                ))
            })?;

        debug!(server = %server, path = ?command_path, "found command");

        let mut child = Command::new(&command_path)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::ConnectFailed(format!("failed to spawn process: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::ConnectFailed("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::ConnectFailed("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::ConnectFailed("child stderr unavailable".to_string()))?;

        info!(server = %server, command = %command, "stdio server spawned");

        let pending = Arc::new(PendingCalls::default());

        let reader = {
            let pending = Arc::clone(&pending);
            let router = router.clone();
            let server = server.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<RpcMessage>(&line) {
                                Ok(message) => route_message(&server, message, &pending, &router),
                                Err(e) => {
                                    warn!(server = %server, error = %e, "unparsable frame from server");
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(server = %server, error = %e, "stdout read failed");
                            break;
                        }
                    }
                }
                debug!(server = %server, "stdio stream ended");
                pending.fail_all(&McpError::ConnectFailed(
                    "server closed the pipe".to_string(),
                ));
            })
        };

        let stderr_task = {
            let server = server.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "stderr: {}", line);
                }
            })
        };

        Ok(Self {
            server,
            command: command.to_string(),
            child: TokioMutex::new(Some(child)),
            stdin: TokioMutex::new(stdin),
            pending,
            ids: RequestIdGen::default(),
            call_gate: TokioMutex::new(()),
            reader,
            stderr_task,
        })
    }

    async fn write_frame(&self, frame: String) -> Result<(), McpError> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| McpError::InvokeFailed(format!("write to server failed: {}", e)))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| McpError::InvokeFailed(format!("write to server failed: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::InvokeFailed(format!("flush to server failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let _gate = self.call_gate.lock().await;

        let id = self.ids.next();
        let request = RpcRequest::new(id, method, params);
        let frame = serde_json::to_string(&request)
            .map_err(|e| McpError::InvokeFailed(format!("request serialization failed: {}", e)))?;

        let rx = self.pending.register(id);
        if let Err(e) = self.write_frame(frame).await {
            self.pending.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::InvokeFailed(
                "connection closed while awaiting response".to_string(),
            )),
            Err(_) => {
                self.pending.forget(id);
                Err(McpError::InvokeTimeout(timeout))
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let notification = RpcNotification::new(method, params);
        let frame = serde_json::to_string(&notification).map_err(|e| {
            McpError::InvokeFailed(format!("notification serialization failed: {}", e))
        })?;
        self.write_frame(frame).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.reader.abort();
        self.stderr_task.abort();
        self.pending
            .fail_all(&McpError::ConnectFailed("transport closed".to_string()));

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                error!(server = %self.server, error = %e, "failed to kill child process");
                return Err(anyhow::anyhow!("failed to kill child process: {}", e));
            }
        }
        info!(server = %self.server, "stdio transport closed");
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn description(&self) -> String {
        format!("stdio:{}", self.command)
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // Child has kill_on_drop; the tasks must not outlive the pipes.
        self.reader.abort();
        self.stderr_task.abort();
    }
}
