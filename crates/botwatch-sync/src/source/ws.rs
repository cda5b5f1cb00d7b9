//! # WebSocket Live Store
//!
//! Client for the live-query store. One WebSocket connection multiplexes
//! every one-time read and live query, each tagged with its own id.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Store Connection States                              │
//! │                                                                         │
//! │  ┌────────────┐  first request  ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │                    success   │   failure → error to caller     │
//! │        │                              ▼                                 │
//! │        │                      ┌────────────┐                            │
//! │        └───── close/error ─── │ Connected  │                            │
//! │                               └────────────┘                            │
//! │                                                                         │
//! │  On close every pending read and every live query receives             │
//! │  Err(Disconnected) exactly once. Live queries are NOT re-established;   │
//! │  the next request opens a fresh connection.                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use botwatch_core::{Document, QueryShape};

use super::protocol::StoreMessage;
use super::{FeedItem, LiveFeed, LiveStore};
use crate::config::DashboardConfig;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of the store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

// =============================================================================
// Store Configuration
// =============================================================================

/// Configuration for the store client.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// WebSocket URL to connect to.
    pub url: String,

    /// Credential sent right after connecting.
    pub api_key: Option<String>,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Ping interval for keepalive.
    pub ping_interval: Duration,
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        StoreConfig {
            url: url.into(),
            api_key: None,
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
        }
    }

    /// Builds the store settings, or `None` if no store URL is configured.
    pub fn from_config(config: &DashboardConfig) -> Option<Self> {
        let url = config.store_url()?;
        Some(StoreConfig {
            api_key: config.secondary.api_key.clone(),
            connect_timeout: config.request_timeout(),
            ..StoreConfig::new(url)
        })
    }
}

// =============================================================================
// Request Routing
// =============================================================================

/// Where incoming snapshots go, by request id.
#[derive(Default)]
struct Routes {
    reads: HashMap<String, oneshot::Sender<FeedItem>>,
    listeners: HashMap<String, mpsc::UnboundedSender<FeedItem>>,
}

fn lock_routes(routes: &StdMutex<Routes>) -> MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Routes {
    /// Delivers one incoming message. Returns a reply to send, if any.
    fn dispatch(&mut self, msg: StoreMessage) -> Option<StoreMessage> {
        match msg {
            StoreMessage::Snapshot { id, documents } => {
                if let Some(tx) = self.reads.remove(&id) {
                    let _ = tx.send(Ok(documents));
                } else if let Some(tx) = self.listeners.get(&id) {
                    if tx.send(Ok(documents)).is_err() {
                        self.listeners.remove(&id);
                    }
                } else {
                    debug!(%id, "Snapshot for unknown request");
                }
                None
            }
            StoreMessage::Error {
                id: Some(id),
                code,
                message,
            } => {
                let err = SyncError::StoreRejected(format!("{}: {}", code, message));
                if let Some(tx) = self.reads.remove(&id) {
                    let _ = tx.send(Err(err));
                } else if let Some(tx) = self.listeners.remove(&id) {
                    let _ = tx.send(Err(err));
                }
                None
            }
            StoreMessage::Error { id: None, code, message } => {
                warn!(%code, %message, "Live store reported a connection error");
                None
            }
            StoreMessage::Ping { timestamp } => Some(StoreMessage::pong(&timestamp)),
            StoreMessage::Pong { .. } => {
                debug!("Received pong");
                None
            }
            other => {
                warn!(msg_type = %other.type_name(), "Unexpected message from store");
                None
            }
        }
    }

    /// Fails every pending read and live query once, then forgets them.
    fn fail_all(&mut self, err: SyncError) {
        let reads = std::mem::take(&mut self.reads);
        let listeners = std::mem::take(&mut self.listeners);
        if !reads.is_empty() || !listeners.is_empty() {
            warn!(
                reads = reads.len(),
                listeners = listeners.len(),
                error = %err,
                "Failing in-flight store requests"
            );
        }
        for (_, tx) in reads {
            let _ = tx.send(Err(err.clone()));
        }
        for (_, tx) in listeners {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

#[derive(Clone)]
struct Connection {
    outgoing_tx: mpsc::UnboundedSender<StoreMessage>,
    routes: Arc<StdMutex<Routes>>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    fn send(&self, msg: StoreMessage) -> SyncResult<()> {
        self.outgoing_tx
            .send(msg)
            .map_err(|_| SyncError::Disconnected)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Removes a pending read if the caller stops waiting (timeout, drop).
struct ReadGuard<'a> {
    routes: &'a StdMutex<Routes>,
    id: String,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        lock_routes(self.routes).reads.remove(&self.id);
    }
}

// =============================================================================
// WebSocket Live Store
// =============================================================================

/// Live-query store reached over WebSocket.
///
/// ## Usage
/// ```rust,ignore
/// let store = WsLiveStore::new(StoreConfig::new("ws://localhost:9000/live"));
///
/// let docs = store.get_once(&QueryShape::collection("trades")).await?;
///
/// let mut feed = store.listen(&sync_feed_shape()).await?;
/// while let Some(Ok(snapshot)) = feed.recv().await {
///     println!("{} events", snapshot.len());
/// }
/// ```
pub struct WsLiveStore {
    config: StoreConfig,
    connection: Mutex<Option<Connection>>,
    state: Arc<RwLock<ConnectionState>>,
}

impl WsLiveStore {
    pub fn new(config: StoreConfig) -> Self {
        WsLiveStore {
            config,
            connection: Mutex::new(None),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
        }
    }

    /// Returns the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Returns the live connection, opening one if needed.
    async fn connection(&self) -> SyncResult<Connection> {
        let mut current = self.connection.lock().await;
        if let Some(conn) = current.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }

        *self.state.write().await = ConnectionState::Connecting;
        let ws_stream = match self.connect_with_timeout().await {
            Ok(stream) => stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        info!(url = %self.config.url, "Live store connected");
        *self.state.write().await = ConnectionState::Connected;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let conn = Connection {
            outgoing_tx,
            routes: Arc::new(StdMutex::new(Routes::default())),
            closed: Arc::new(AtomicBool::new(false)),
        };

        if let Some(ref api_key) = self.config.api_key {
            conn.send(StoreMessage::Auth {
                api_key: api_key.clone(),
            })?;
        }

        // The task holds no sender, so the socket closes once the store and
        // every open feed have dropped theirs.
        tokio::spawn(connection_loop(
            ws_stream,
            outgoing_rx,
            conn.routes.clone(),
            conn.closed.clone(),
            self.state.clone(),
            self.config.ping_interval,
        ));

        *current = Some(conn.clone());
        Ok(conn)
    }

    /// Connects with timeout.
    async fn connect_with_timeout(&self) -> SyncResult<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let connect_future = connect_async(self.config.url.as_str());

        match timeout(self.config.connect_timeout, connect_future).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                Ok(ws_stream)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout(self.config.connect_timeout.as_secs())),
        }
    }
}

#[async_trait]
impl LiveStore for WsLiveStore {
    async fn get_once(&self, shape: &QueryShape) -> SyncResult<Vec<Document>> {
        shape.validate()?;
        let conn = self.connection().await?;
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        lock_routes(&conn.routes).reads.insert(id.clone(), tx);
        let _guard = ReadGuard {
            routes: &conn.routes,
            id: id.clone(),
        };
        if conn.is_closed() {
            return Err(SyncError::Disconnected);
        }

        debug!(%id, collection = %shape.collection, "One-time store read");
        conn.send(StoreMessage::Query {
            id,
            query: shape.clone(),
        })?;

        rx.await.map_err(|_| SyncError::Disconnected)?
    }

    async fn listen(&self, shape: &QueryShape) -> SyncResult<LiveFeed> {
        shape.validate()?;
        let conn = self.connection().await?;
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        lock_routes(&conn.routes).listeners.insert(id.clone(), tx);
        if conn.is_closed() {
            lock_routes(&conn.routes).listeners.remove(&id);
            return Err(SyncError::Disconnected);
        }

        debug!(%id, query = %shape.key(), "Registering live query");
        conn.send(StoreMessage::Listen {
            id: id.clone(),
            query: shape.clone(),
        })?;

        let close_conn = conn.clone();
        Ok(LiveFeed::new(rx).on_close(move || {
            let registered = lock_routes(&close_conn.routes).listeners.remove(&id).is_some();
            if registered && !close_conn.is_closed() {
                let _ = close_conn.send(StoreMessage::Unlisten { id });
            }
        }))
    }
}

// =============================================================================
// Connection Loop
// =============================================================================

/// Pumps one connection until it closes, then fails whatever is in flight.
async fn connection_loop(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing_rx: mpsc::UnboundedReceiver<StoreMessage>,
    routes: Arc<StdMutex<Routes>>,
    closed: Arc<AtomicBool>,
    state: Arc<RwLock<ConnectionState>>,
    ping_every: Duration,
) {
    let result = pump(ws_stream, &mut outgoing_rx, &routes, ping_every).await;
    if let Err(ref e) = result {
        warn!(?e, "Live store connection ended");
    }

    closed.store(true, Ordering::SeqCst);
    lock_routes(&routes).fail_all(SyncError::Disconnected);
    *state.write().await = ConnectionState::Disconnected;
    info!("Live store connection closed");
}

async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outgoing_rx: &mut mpsc::UnboundedReceiver<StoreMessage>,
    routes: &StdMutex<Routes>,
    ping_every: Duration,
) -> SyncResult<()> {
    let (mut write, mut read) = ws_stream.split();

    let mut ping_interval = tokio::time::interval(ping_every);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            outgoing = outgoing_rx.recv() => {
                let Some(msg) = outgoing else {
                    debug!("Store client dropped, closing connection");
                    write.send(WsMessage::Close(None)).await?;
                    return Ok(());
                };
                debug!(msg_type = %msg.type_name(), "Sending message");
                write.send(WsMessage::Text(msg.to_json()?.into())).await?;
            }

            incoming = read.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match StoreMessage::from_json(&text) {
                            Ok(msg) => {
                                let reply = lock_routes(routes).dispatch(msg);
                                if let Some(reply) = reply {
                                    write.send(WsMessage::Text(reply.to_json()?.into())).await?;
                                }
                            }
                            Err(e) => warn!(?e, "Failed to parse store message"),
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        write.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Pong(_))) => debug!("Received pong"),
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Received close frame");
                        return Ok(());
                    }
                    Some(Ok(WsMessage::Binary(_))) => warn!("Received unexpected binary message"),
                    Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Err(e)) => return Err(SyncError::from(e)),
                    None => return Ok(()),
                }
            }

            _ = ping_interval.tick() => {
                write.send(WsMessage::Ping(vec![].into())).await?;
                debug!("Sent ping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn routes_with_read(id: &str) -> (Routes, oneshot::Receiver<FeedItem>) {
        let mut routes = Routes::default();
        let (tx, rx) = oneshot::channel();
        routes.reads.insert(id.to_string(), tx);
        (routes, rx)
    }

    #[test]
    fn test_store_config_from_dashboard_config() {
        let mut config = DashboardConfig::default();
        assert!(StoreConfig::from_config(&config).is_none());

        config.secondary.url = Some("ws://localhost:9000".into());
        config.secondary.api_key = Some("k".into());
        let store = StoreConfig::from_config(&config).unwrap();
        assert_eq!(store.url, "ws://localhost:9000");
        assert_eq!(store.api_key.as_deref(), Some("k"));
    }

    #[tokio::test]
    async fn test_snapshot_completes_pending_read() {
        let (mut routes, rx) = routes_with_read("q1");
        let reply = routes.dispatch(StoreMessage::Snapshot {
            id: "q1".into(),
            documents: vec![Document::new("t1", json!({}))],
        });
        assert!(reply.is_none());
        assert!(routes.reads.is_empty());
        assert_eq!(rx.await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_ends_listener() {
        let mut routes = Routes::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        routes.listeners.insert("l1".into(), tx);

        routes.dispatch(StoreMessage::Error {
            id: Some("l1".into()),
            code: "PERMISSION_DENIED".into(),
            message: "no".into(),
        });

        assert!(matches!(rx.recv().await, Some(Err(SyncError::StoreRejected(_)))));
        assert!(rx.recv().await.is_none(), "feed must close after error");
    }

    #[tokio::test]
    async fn test_fail_all_notifies_each_request_once() {
        let (mut routes, read_rx) = routes_with_read("q1");
        let (tx, mut listen_rx) = mpsc::unbounded_channel();
        routes.listeners.insert("l1".into(), tx);

        routes.fail_all(SyncError::Disconnected);

        assert_eq!(read_rx.await.unwrap(), Err(SyncError::Disconnected));
        assert_eq!(listen_rx.recv().await, Some(Err(SyncError::Disconnected)));
        assert!(listen_rx.recv().await.is_none());
    }

    #[test]
    fn test_ping_is_answered() {
        let mut routes = Routes::default();
        let reply = routes.dispatch(StoreMessage::Ping {
            timestamp: "t".into(),
        });
        assert!(matches!(reply, Some(StoreMessage::Pong { .. })));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let store = WsLiveStore::new(StoreConfig {
            connect_timeout: Duration::from_secs(2),
            ..StoreConfig::new("ws://127.0.0.1:1")
        });
        let err = store
            .get_once(&QueryShape::collection("trades"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.state().await, ConnectionState::Disconnected);
    }
}
