// ABOUTME: Unix control socket for a running supervisor: reconcile, status and health.
// ABOUTME: Newline-delimited JSON requests, one JSON line back per request.

use crate::supervisor::{ControlCommand, ReconcileTrigger};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Request {
    Reconcile,
    Status,
    Health,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            error: None,
            data,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            data: None,
        }
    }
}

/// Serve the control socket until `cancel` fires; the socket file is removed on exit.
pub async fn run_socket_server(
    path: PathBuf,
    trigger: ReconcileTrigger,
    cmd_tx: mpsc::Sender<ControlCommand>,
    cancel: CancellationToken,
) -> Result<()> {
    // A stale socket from a crashed run would make bind fail.
    let _ = std::fs::remove_file(&path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&path)
        .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
    tracing::info!(path = %path.display(), "Control socket listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Control socket accept failed");
                        continue;
                    }
                };
                let trigger = trigger.clone();
                let cmd_tx = cmd_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, trigger, cmd_tx).await {
                        tracing::warn!(error = %e, "Control socket connection error");
                    }
                });
            }
        }
    }

    let _ = std::fs::remove_file(&path);
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    trigger: ReconcileTrigger,
    cmd_tx: mpsc::Sender<ControlCommand>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<Request>(line.trim()) {
            Ok(request) => handle_request(request, &trigger, &cmd_tx).await,
            Err(e) => Response::err(format!("invalid request: {}", e)),
        };
        let response_json = serde_json::to_string(&response)? + "\n";
        writer.write_all(response_json.as_bytes()).await?;
        line.clear();
    }

    Ok(())
}

async fn handle_request(
    request: Request,
    trigger: &ReconcileTrigger,
    cmd_tx: &mpsc::Sender<ControlCommand>,
) -> Response {
    match request {
        Request::Reconcile => {
            if trigger.fire() {
                Response::ok(None)
            } else {
                Response::err("Supervisor unavailable")
            }
        }
        Request::Status => {
            let (reply, rx) = oneshot::channel();
            ask(cmd_tx, ControlCommand::Status { reply }, rx).await
        }
        Request::Health => {
            let (reply, rx) = oneshot::channel();
            ask(cmd_tx, ControlCommand::Health { reply }, rx).await
        }
    }
}

async fn ask<T: Serialize>(
    cmd_tx: &mpsc::Sender<ControlCommand>,
    command: ControlCommand,
    rx: oneshot::Receiver<T>,
) -> Response {
    if cmd_tx.send(command).await.is_err() {
        return Response::err("Supervisor unavailable");
    }
    match rx.await {
        Ok(value) => match serde_json::to_value(&value) {
            Ok(data) => Response::ok(Some(data)),
            Err(e) => Response::err(e.to_string()),
        },
        Err(_) => Response::err("No response"),
    }
}

/// Client side, used by the CLI subcommands.
pub struct SocketClient {
    stream: BufReader<UnixStream>,
}

impl SocketClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.with_context(|| {
            format!(
                "Cannot reach supervisor at {} (is `coven-tools run` running?)",
                path.display()
            )
        })?;
        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        let line = serde_json::to_string(request)? + "\n";
        self.stream.get_mut().write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        if self.stream.read_line(&mut reply).await? == 0 {
            anyhow::bail!("Supervisor closed the connection");
        }
        Ok(serde_json::from_str(&reply)?)
    }
}
