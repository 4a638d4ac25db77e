use crate::dispatch::{Dispatcher, Responder};
use crate::static_host::{self, StaticSite};
use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use pcs_core::{DecodeError, Envelope, ServerEvent, ServerMessage};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 256;
const CONNECTED_MESSAGE: &str = "connected to pcs-web backend";

pub struct Connection {
    pub conn_id: String,
    pub remote: SocketAddr,
    sender: mpsc::Sender<ServerMessage>,
}

impl Connection {
    /// Queues a message; returns false once the connection is gone.
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.sender.send(message).await.is_ok()
    }
}

/// The set of open connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    conn_counter: AtomicU64,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn register(
        &self,
        remote: SocketAddr,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Arc<Connection> {
        let connection = Arc::new(Connection {
            conn_id: self.next_conn_id(),
            remote,
            sender,
        });
        let mut connections = self.connections.write().await;
        connections.insert(connection.conn_id.clone(), connection.clone());
        info!(
            event = "client_connected",
            conn_id = %connection.conn_id,
            remote = %remote,
            open = connections.len()
        );
        connection
    }

    pub async fn remove(&self, connection: &Connection, reason: &str) {
        let mut connections = self.connections.write().await;
        connections.remove(&connection.conn_id);
        info!(
            event = "client_disconnected",
            conn_id = %connection.conn_id,
            reason = reason,
            open = connections.len()
        );
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub struct RelayState {
    pub registry: ConnectionRegistry,
    pub dispatcher: Arc<Dispatcher>,
    pub site: StaticSite,
    pub write_timeout: Duration,
    pub debug: bool,
}

impl RelayState {
    pub fn new(
        dispatcher: Dispatcher,
        site: StaticSite,
        write_timeout: Duration,
        debug: bool,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            dispatcher: Arc::new(dispatcher),
            site,
            write_timeout,
            debug,
        }
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);
        let write_timeout = self.write_timeout;
        let mut write_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(event = "encode_error", error = %err);
                        continue;
                    }
                };
                let send = ws_sender.send(Message::Text(text));
                match tokio::time::timeout(write_timeout, send).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        });

        let connection = self.registry.register(remote, tx).await;
        connection
            .send(ServerMessage::untagged(ServerEvent::Status {
                message: CONNECTED_MESSAGE.to_string(),
            }))
            .await;

        let mut reason = "disconnect";
        loop {
            // The writer only finishes after a failed or timed-out send.
            let next = tokio::select! {
                next = ws_receiver.next() => next,
                _ = &mut write_task => {
                    warn!(event = "write_error", conn_id = %connection.conn_id);
                    reason = "write_error";
                    break;
                }
            };
            let Some(result) = next else {
                break;
            };
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %connection.conn_id, error = %err);
                    reason = "read_error";
                    break;
                }
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %connection.conn_id);
                    reason = "close";
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if self.debug {
                debug!(
                    event = "message_received",
                    conn_id = %connection.conn_id,
                    raw = %String::from_utf8_lossy(&data)
                );
            }
            self.route(&connection, &data).await;
        }

        self.registry.remove(&connection, reason).await;
        // In-flight commands keep their queue handles; once the writer is
        // gone their remaining sends fail quietly.
        write_task.abort();
    }

    async fn route(&self, connection: &Connection, data: &[u8]) {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = "message_invalid", conn_id = %connection.conn_id, error = %err);
                connection.send(malformed_reply(&err)).await;
                return;
            }
        };
        let responder = Responder::new(envelope.request_id.clone(), connection.sender.clone());
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(envelope, responder).await;
        });
    }
}

fn malformed_reply(err: &DecodeError) -> ServerMessage {
    ServerMessage::untagged(ServerEvent::error(
        "bad_request",
        format!("malformed message: {err}"),
    ))
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .fallback(static_host::asset_handler)
        .with_state(state)
}

/// `/` is both the UI entry document and the WebSocket endpoint.
async fn root_handler(
    ws: Option<WebSocketUpgrade>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    match ws {
        Some(ws) => upgrade(ws, addr, state),
        None => static_host::serve_index(&state.site).await,
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    upgrade(ws, addr, state)
}

fn upgrade(ws: WebSocketUpgrade, addr: SocketAddr, state: Arc<RelayState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        state.handle_socket(socket, addr).await;
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    #[tokio::test]
    async fn registry_tracks_open_connections() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let first = registry.register(addr(), tx.clone()).await;
        let second = registry.register(addr(), tx).await;
        assert_ne!(first.conn_id, second.conn_id);
        assert_eq!(registry.len().await, 2);

        registry.remove(&first, "test").await;
        assert_eq!(registry.len().await, 1);
        registry.remove(&first, "test").await;
        registry.remove(&second, "test").await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn send_after_close_is_quietly_refused() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(1);
        let connection = registry.register(addr(), tx).await;
        drop(rx);
        let delivered = connection
            .send(ServerMessage::untagged(ServerEvent::Status {
                message: "late".into(),
            }))
            .await;
        assert!(!delivered);
    }

    #[test]
    fn malformed_reply_has_no_request_id() {
        let err = Envelope::decode(b"{oops").unwrap_err();
        let value = serde_json::to_value(malformed_reply(&err)).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "bad_request");
        assert!(value.get("requestId").is_none());
    }
}
