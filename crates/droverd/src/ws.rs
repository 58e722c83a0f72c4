//! WebSocket p2p transport.
//!
//! One socket per peer. The peer presents its identity on connect; the
//! transport collaborator guarantees the binding, so everything behind
//! this module trusts the `peerId` it hands over. Each text frame is
//! one wire envelope; replies flow back on the same socket, and
//! engine-originated frames (offers) are injected through the session
//! table's per-peer writer.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use drover_core::{Envelope, PeerId};
use drover_services::{MessageRouter, WorkerRegistry};

/// peer id → writer for that peer's socket.
pub type SessionTable = Arc<DashMap<PeerId, mpsc::UnboundedSender<Envelope>>>;

pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}

#[derive(Clone)]
pub struct WsState {
    pub router: Arc<MessageRouter>,
    pub registry: Arc<WorkerRegistry>,
    pub sessions: SessionTable,
}

#[derive(Deserialize)]
pub struct WsQuery {
    /// Transport-verified peer identity.
    #[serde(rename = "peerId")]
    pub peer_id: PeerId,
}

pub async fn serve(state: WsState, addr: &str, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/ws", get(handle_upgrade))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(format!("{addr}:{port}")).await?;
    tracing::info!(addr, port, "p2p transport listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<WsState>,
) -> Response {
    let peer_id = query.peer_id;
    ws.on_upgrade(move |socket| run_session(socket, peer_id, state))
}

async fn run_session(socket: WebSocket, peer_id: PeerId, state: WsState) {
    tracing::info!(peer = %peer_id, "session established");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    // A reconnect replaces any stale session for the same peer.
    state.sessions.insert(peer_id.clone(), tx.clone());
    state.registry.connect(&peer_id);

    // Writer: everything destined for this peer funnels through one task.
    let writer_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(peer = %writer_peer, error = %e, "failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: each text frame is one envelope through the router.
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(peer = %peer_id, error = %e, "socket error");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(env) => env,
                    Err(e) => {
                        let reply = Envelope::error(
                            drover_core::error::ErrorKind::InvalidArgument,
                            format!("malformed envelope: {e}"),
                        );
                        if tx.send(reply).is_err() {
                            break;
                        }
                        continue;
                    }
                };
                let response = state.router.handle(&peer_id, envelope).await;
                if tx.send(response.reply).is_err() {
                    break;
                }
                if response.disconnect {
                    tracing::warn!(peer = %peer_id, "router requested disconnect");
                    break;
                }
            }
            Message::Close(_) => break,
            // Pings are answered by axum; binary frames are not part of
            // the protocol.
            Message::Binary(_) => {
                tracing::debug!(peer = %peer_id, "ignoring binary frame");
            }
            _ => {}
        }
    }

    // Teardown: drop the session and let the registry observe the
    // disconnect. The engine's next sweep recovers any held task.
    state.sessions.remove(&peer_id);
    state.registry.disconnect(&peer_id);
    writer.abort();
    tracing::info!(peer = %peer_id, "session closed");
}
