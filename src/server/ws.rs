//! Per-connection WebSocket handling.
//!
//! Each connection runs a read loop dispatching client messages and a
//! write task draining an outbound channel. Requests are submitted through
//! the session task manager, which enforces at-most-one in-flight
//! interaction per session; progress events flow back through the same
//! outbound channel as advisory messages.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::kernel::orchestrator::{Orchestrator, OrchestratorError};
use crate::kernel::ProgressSink;
use crate::session::{SessionError, SessionTaskManager};
use crate::types::{Plan, StepStatus};

use super::messages::{ClientMessage, ServerMessage};

/// Outbound channel depth per connection.
const OUTBOUND_BUFFER: usize = 64;

/// Shared state behind the WebSocket endpoint.
pub struct AppState {
    /// The orchestration core.
    pub orchestrator: Arc<Orchestrator>,
    /// Per-session task lifecycle.
    pub sessions: Arc<SessionTaskManager>,
}

/// `GET /ws` upgrade handler.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Forwards executor progress into the connection's outbound channel.
///
/// Sends are best-effort: progress messages are advisory and may be
/// dropped when the client cannot keep up.
struct ChannelProgress {
    tx: mpsc::Sender<ServerMessage>,
}

impl ProgressSink for ChannelProgress {
    fn plan_accepted(&self, interaction_id: Uuid, plan: &Plan) {
        let _ = self.tx.try_send(ServerMessage::Plan {
            interaction_id,
            plan: plan.clone(),
        });
    }

    fn step_update(&self, interaction_id: Uuid, step_id: u32, status: StepStatus) {
        let _ = self.tx.try_send(ServerMessage::StepUpdate {
            interaction_id,
            step_id,
            status,
        });
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("websocket connected");
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);

    // Writer task: drain the outbound channel onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&message) else {
                warn!("failed to serialize outbound message");
                continue;
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Read loop: dispatch client messages until the peer goes away.
    while let Some(incoming) = stream.next().await {
        let message = match incoming {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        match serde_json::from_str::<ClientMessage>(&message) {
            Ok(ClientMessage::Request { session_id, text }) => {
                dispatch_request(&state, &tx, session_id, text);
            }
            Ok(ClientMessage::Cancel { session_id }) => {
                debug!(%session_id, "cancel requested");
                state.sessions.cancel(&session_id);
            }
            Ok(ClientMessage::Clear { session_id }) => {
                debug!(%session_id, "clear requested");
                state.sessions.clear(&session_id).await;
            }
            Err(e) => {
                send_error(&tx, "input_error", &format!("unrecognized message: {e}")).await;
            }
        }
    }

    drop(tx);
    let _ = writer.await;
    info!("websocket disconnected");
}

/// Submit a request through the session task manager.
///
/// A busy session is answered immediately with an error; otherwise the
/// interaction runs as the session's task and sends exactly one `reply`
/// or `error` when it finishes.
fn dispatch_request(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<ServerMessage>,
    session_id: String,
    text: String,
) {
    let orchestrator = Arc::clone(&state.orchestrator);
    let outbound = tx.clone();
    let session_for_task = session_id.clone();

    let submitted = state.sessions.submit(&session_id, move |cancel| async move {
        let progress = ChannelProgress {
            tx: outbound.clone(),
        };
        let result = orchestrator
            .run_interaction(&session_for_task, &text, cancel, &progress)
            .await;

        let message = match result {
            Ok((interaction_id, reply)) => ServerMessage::reply(interaction_id, reply),
            Err(OrchestratorError::InputError) => ServerMessage::Error {
                kind: "input_error".to_owned(),
                message: "The request was empty.".to_owned(),
            },
            Err(OrchestratorError::Internal(_)) => ServerMessage::Error {
                kind: "internal".to_owned(),
                message: "Something went wrong handling this request.".to_owned(),
            },
        };
        let _ = outbound.send(message).await;
    });

    if let Err(SessionError::AlreadyRunning { session_id }) = submitted {
        let tx = tx.clone();
        tokio::spawn(async move {
            send_error(
                &tx,
                "already_running",
                &format!("Session '{session_id}' already has a request in flight."),
            )
            .await;
        });
    }
}

async fn send_error(tx: &mpsc::Sender<ServerMessage>, kind: &str, message: &str) {
    let _ = tx
        .send(ServerMessage::Error {
            kind: kind.to_owned(),
            message: message.to_owned(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Complexity;

    #[tokio::test]
    async fn test_channel_progress_is_best_effort() {
        let (tx, mut rx) = mpsc::channel(1);
        let progress = ChannelProgress { tx };

        let plan = Plan {
            goal: "g".to_owned(),
            complexity: Complexity::Simple,
            steps: vec![],
        };
        progress.plan_accepted(Uuid::nil(), &plan);
        // Channel is full now; further sends are dropped, not blocked.
        progress.step_update(Uuid::nil(), 1, StepStatus::Success);
        progress.step_update(Uuid::nil(), 2, StepStatus::Success);

        let first = rx.recv().await.expect("first message");
        assert!(matches!(first, ServerMessage::Plan { .. }));
        assert!(rx.try_recv().is_err(), "overflow messages are dropped");
    }
}
