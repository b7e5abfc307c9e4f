use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
};
use gridsync_common::protocol::close::CloseReason;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::admission::{admit, ConnectionPhase, RejectReason};
use super::SyncRouterState;
use crate::error::{current_request_id, with_request_id_scope};
use crate::sync::doc_manager::DocManager;
use crate::sync::session::DocumentSession;

pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub secret: Option<String>,
}

pub async fn ws_upgrade(
    Path(address): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<SyncRouterState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(state, address, params.secret, ws)
}

/// `/` carries no document address; it is upgraded and then rejected like
/// any other unknown document.
pub async fn ws_upgrade_root(
    Query(params): Query<ConnectParams>,
    State(state): State<SyncRouterState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(state, String::new(), params.secret, ws)
}

fn upgrade(
    state: SyncRouterState,
    address: String,
    secret: Option<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = current_request_id().unwrap_or_else(|| Uuid::new_v4().to_string());

    ws.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| async move {
        let span = info_span!("relay.ws.connection", request_id = %request_id, address = %address);
        with_request_id_scope(request_id.clone(), handle_socket(state, address, secret, socket))
            .instrument(span)
            .await
    })
}

/// Releases a document subscription even when the connection task unwinds.
struct SessionLease {
    docs: Arc<DocManager>,
    doc_id: String,
    released: bool,
}

impl SessionLease {
    fn new(docs: Arc<DocManager>, doc_id: String) -> Self {
        Self { docs, doc_id, released: false }
    }

    async fn release(mut self) {
        self.released = true;
        self.docs.unsubscribe(&self.doc_id).await;
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let docs = Arc::clone(&self.docs);
        let doc_id = std::mem::take(&mut self.doc_id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                docs.unsubscribe(&doc_id).await;
            });
        }
    }
}

fn transition(phase: &mut ConnectionPhase, next: ConnectionPhase) {
    match phase.clone().advance(next) {
        Ok(next) => {
            debug!(phase = ?next, terminal = next.is_terminal(), "connection phase changed");
            *phase = next;
        }
        Err(error) => warn!(error = %error, "ignored invalid connection transition"),
    }
}

async fn close_with(socket: &mut WebSocket, reason: CloseReason) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: reason.code(),
            reason: reason.message().into(),
        })))
        .await;
}

async fn handle_socket(
    state: SyncRouterState,
    address: String,
    secret: Option<String>,
    mut socket: WebSocket,
) {
    let mut phase = ConnectionPhase::Connecting;
    transition(&mut phase, ConnectionPhase::Resolving);

    let admission = match admit(&state.store, &address, secret.as_deref()).await {
        Ok(admission) => admission,
        Err(rejection) => {
            let reason = rejection.reason();
            if reason == RejectReason::Internal {
                error!(error = %rejection, "failed to admit connection");
            } else {
                info!(reason = ?reason, "connection rejected");
            }
            transition(&mut phase, ConnectionPhase::Rejected(reason));
            close_with(&mut socket, reason.close_reason()).await;
            return;
        }
    };
    transition(&mut phase, ConnectionPhase::Accepted);

    let session = state.docs.subscribe(&admission.doc_id).await;
    let lease = SessionLease::new(Arc::clone(&state.docs), admission.doc_id.clone());
    transition(&mut phase, ConnectionPhase::Attached);
    info!(doc_id = %admission.doc_id, "connection attached");

    run_sync_loop(&session, &mut socket).await;

    lease.release().await;
    transition(&mut phase, ConnectionPhase::Closed);
    info!(doc_id = %admission.doc_id, "connection closed");
}

async fn run_sync_loop(session: &DocumentSession, socket: &mut WebSocket) {
    let client_id = session.next_client_id();
    let mut updates_rx = session.subscribe_updates();

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.reset(); // skip immediate first tick
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > HEARTBEAT_TIMEOUT {
                    warn!(client_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };
                last_seen = Instant::now();

                match message {
                    Message::Binary(payload) => {
                        let responses = match session.process_incoming_binary(client_id, payload.as_ref()).await {
                            Ok(responses) => responses,
                            Err(error) => {
                                warn!(client_id, error = ?error, "failed to process y-sync frame");
                                break;
                            }
                        };
                        let mut send_failed = false;
                        for response in responses {
                            if socket.send(Message::Binary(response.into())).await.is_err() {
                                send_failed = true;
                                break;
                            }
                        }
                        if send_failed {
                            break;
                        }
                    }
                    Message::Close(frame) => {
                        let code = frame.as_ref().map(|frame| frame.code);
                        debug!(
                            client_id,
                            code,
                            reason = ?code.and_then(CloseReason::from_code),
                            "peer closed connection"
                        );
                        break;
                    }
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) | Message::Text(_) => {}
                }
            }
            outbound = updates_rx.recv() => {
                match outbound {
                    Ok((sender_id, payload)) if sender_id != client_id => {
                        if socket.send(Message::Binary(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Dropped updates cannot be replayed; make the peer reconnect and resync.
                        warn!(client_id, skipped, "peer fell behind the update stream");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
