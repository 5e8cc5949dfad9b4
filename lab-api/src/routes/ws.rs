//! WebSocket bridge into the tunnel.
//!
//! Binary and text frames from the browser are forwarded byte-exact to the VM; backend data
//! goes back as binary frames. Preconditions that fail before a session exists are reported as
//! a single text frame followed by a close.

use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use bytes::Bytes;
use futures_util::{future, SinkExt, StreamExt};
use lab_orchestrator::{OrchestratorError, VmStatus};
use lab_tunnel::Protocol;
use std::io;
use tracing::{debug, info, warn};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ws/ssh/{vm_id}", get(ssh_socket))
        .route("/ws/vnc/{vm_id}", get(vnc_socket))
}

async fn ssh_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| relay_socket(state, socket, vm_id, Protocol::Ssh))
}

async fn vnc_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| relay_socket(state, socket, vm_id, Protocol::Vnc))
}

/// Resolve the backend port for a VM, or the message to send the client instead.
async fn backend_port(state: &AppState, vm_id: &str, protocol: Protocol) -> Result<u16, String> {
    let vm = state.store.get_vm(vm_id).await.map_err(|e| match e {
        OrchestratorError::NotFound(_) => format!("Error: VM {} not found", vm_id),
        other => format!("Error: {}", other),
    })?;

    if vm.status != VmStatus::Running {
        return Err(format!("Error: VM {} is not running", vm.name));
    }

    let port = match protocol {
        Protocol::Ssh => vm.ssh_port,
        Protocol::Vnc => vm.vnc_port,
    };
    port.ok_or_else(|| format!("Error: VM {} has no {} port assigned", vm.name, protocol))
}

async fn relay_socket(state: AppState, mut socket: WebSocket, vm_id: String, protocol: Protocol) {
    let port = match backend_port(&state, &vm_id, protocol).await {
        Ok(port) => port,
        Err(message) => {
            debug!(vm_id = %vm_id, %protocol, reason = %message, "Rejecting remote access");
            let _ = socket.send(Message::Text(message.into())).await;
            let _ = socket.close().await;
            return;
        }
    };

    let (sink, stream) = socket.split();
    let client_rx = stream
        .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(Message::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes()))),
                Ok(_) => None,
                Err(e) => Some(Err(io::Error::other(e))),
            })
        });
    let client_tx = sink.with(|data: Bytes| future::ready(Ok::<_, axum::Error>(Message::Binary(data))));

    match state
        .tunnel
        .open_session(&vm_id, protocol, &state.access.host, port, client_rx, client_tx)
        .await
    {
        Ok(handle) => {
            let session_id = handle.id();
            let end = handle.finished().await;
            info!(vm_id = %vm_id, %session_id, ?end, "Remote access session closed");
        }
        Err(e) => warn!(vm_id = %vm_id, %protocol, error = %e, "Remote access session not opened"),
    }
}
