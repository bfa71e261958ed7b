//! Local IPC server for `rtcr-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands
//! and routes them to the checkpoint orchestrator.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "list"}
//! {"command": "cycle"}
//! {"command": "snapshot", "child": "init"}
//! {"command": "kcap", "child": "init", "badge": 42}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found: child 'x'"}
//! ```

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::models::Badge;
use crate::orchestrator::checkpointer::Checkpointer;
use crate::orchestrator::supervisor::Supervisor;
use crate::{AppError, Result};

/// What the IPC commands operate on.
pub struct ControlState {
    /// Session entry point and child registry.
    pub supervisor: Arc<Supervisor>,
    /// Pause/checkpoint/resume driver.
    pub checkpointer: Arc<Checkpointer>,
}

/// Inbound IPC request from `rtcr-ctl`.
#[derive(Debug, Deserialize)]
struct IpcRequest {
    /// Command verb.
    command: String,
    /// Child name (for `snapshot`, `kcap`).
    child: Option<String>,
    /// Badge to translate (for `kcap`).
    badge: Option<u64>,
}

/// Outbound IPC response to `rtcr-ctl`.
#[derive(Debug, Serialize)]
struct IpcResponse {
    /// Whether the command succeeded.
    ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    fn from_serialized<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(data) => Self::success(data),
            Err(err) => Self::error(format!("serialization failed: {err}")),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    state: Arc<ControlState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = state.supervisor.config().ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(handle_connection(stream, state));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    state: Arc<ControlState>,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &state).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route an IPC command to the appropriate handler.
async fn dispatch_command(request: &IpcRequest, state: &ControlState) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async move {
        match request.command.as_str() {
            "list" => handle_list(state),
            "pause" => respond(state.checkpointer.pause().await, "paused"),
            "resume" => respond(state.checkpointer.resume().await, "resumed"),
            "checkpoint" => match state.checkpointer.checkpoint().await {
                Ok(report) => IpcResponse::from_serialized(&report),
                Err(err) => IpcResponse::error(err.to_string()),
            },
            "cycle" => match state.checkpointer.run_cycle().await {
                Ok(report) => IpcResponse::from_serialized(&report),
                Err(err) => IpcResponse::error(err.to_string()),
            },
            "snapshot" => handle_snapshot(request, state),
            "kcap" => handle_kcap(request, state),
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }
    .instrument(span)
    .await
}

fn respond(result: Result<()>, status: &str) -> IpcResponse {
    match result {
        Ok(()) => IpcResponse::success(serde_json::json!({ "status": status })),
        Err(err) => IpcResponse::error(err.to_string()),
    }
}

/// List children and their open sessions.
fn handle_list(state: &ControlState) -> IpcResponse {
    let children: Vec<serde_json::Value> = state
        .supervisor
        .registry()
        .children()
        .iter()
        .map(|child| {
            let sessions: Vec<String> = child
                .sessions()
                .sessions()
                .iter()
                .map(|s| s.kind().service_name().to_owned())
                .collect();
            serde_json::json!({
                "child": child.name(),
                "bootstrapping": child.context().bootstrapping(),
                "sessions": sessions,
            })
        })
        .collect();
    IpcResponse::success(serde_json::json!({
        "epoch": state.checkpointer.epoch(),
        "mode": state.checkpointer.mode(),
        "children": children,
    }))
}

/// Dump the last snapshot of one child.
fn handle_snapshot(request: &IpcRequest, state: &ControlState) -> IpcResponse {
    let Some(ref name) = request.child else {
        return IpcResponse::error("missing required 'child' field");
    };
    match state.supervisor.registry().find(name) {
        Some(child) => IpcResponse::from_serialized(&child.snapshot()),
        None => IpcResponse::error(AppError::NotFound(format!("child '{name}'")).to_string()),
    }
}

/// Translate a badge through a child's kcap table.
fn handle_kcap(request: &IpcRequest, state: &ControlState) -> IpcResponse {
    let Some(ref name) = request.child else {
        return IpcResponse::error("missing required 'child' field");
    };
    let Some(badge) = request.badge else {
        return IpcResponse::error("missing required 'badge' field");
    };
    let Some(child) = state.supervisor.registry().find(name) else {
        return IpcResponse::error(AppError::NotFound(format!("child '{name}'")).to_string());
    };
    let kcap = child.kcap_table().find_kcap_by_badge(Badge(badge));
    IpcResponse::success(serde_json::json!({
        "badge": badge,
        "kcap": kcap.0,
        "valid": kcap.is_valid(),
    }))
}
