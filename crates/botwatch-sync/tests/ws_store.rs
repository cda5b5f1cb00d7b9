//! WebSocket live store against a mock live-query server.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

use botwatch_core::{Document, QueryShape};
use botwatch_sync::source::protocol::StoreMessage;
use botwatch_sync::source::ws::ConnectionState;
use botwatch_sync::{
    LiveStore, StoreConfig, SubscriptionManager, SubscriptionMode, SyncError, WsLiveStore,
};

// =============================================================================
// Mock Store
// =============================================================================

struct MockStore {
    trades: Mutex<Vec<Document>>,
    api_keys: Mutex<Vec<String>>,
    connections: AtomicUsize,
    hangups: AtomicUsize,
    listens: AtomicUsize,
    unlistens: AtomicUsize,
    /// Pushes the current result set to every live query.
    changed: broadcast::Sender<()>,
    /// Closes every open socket when set.
    kill: watch::Sender<bool>,
}

impl MockStore {
    fn new() -> Arc<Self> {
        let (changed, _) = broadcast::channel(16);
        let (kill, _) = watch::channel(false);
        Arc::new(MockStore {
            trades: Mutex::new(vec![
                Document::new("a", json!({ "symbol": "BTCUSDT", "is_open": true, "timestamp": 1 })),
                Document::new("b", json!({ "symbol": "ETHUSDT", "is_open": false, "timestamp": 2 })),
            ]),
            api_keys: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            hangups: AtomicUsize::new(0),
            listens: AtomicUsize::new(0),
            unlistens: AtomicUsize::new(0),
            changed,
            kill,
        })
    }

    fn insert(&self, doc: Document) {
        self.trades.lock().unwrap().push(doc);
        let _ = self.changed.send(());
    }

    fn result_set(&self, shape: &QueryShape) -> Vec<Document> {
        if shape.collection != "trades" {
            return Vec::new();
        }
        shape.apply(self.trades.lock().unwrap().iter())
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(store): State<Arc<MockStore>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, store))
}

async fn send(socket: &mut WebSocket, msg: &StoreMessage) -> bool {
    let json = serde_json::to_string(msg).unwrap();
    socket.send(Message::Text(json.into())).await.is_ok()
}

async fn handle_socket(mut socket: WebSocket, store: Arc<MockStore>) {
    store.connections.fetch_add(1, Ordering::SeqCst);
    let mut changed = store.changed.subscribe();
    let mut kill = store.kill.subscribe();
    let mut live: Vec<(String, QueryShape)> = Vec::new();

    loop {
        tokio::select! {
            incoming = socket.next() => {
                let Some(Ok(Message::Text(text))) = incoming else { break };
                let Ok(msg) = serde_json::from_str::<StoreMessage>(&text) else { continue };
                let reply = match msg {
                    StoreMessage::Auth { api_key } => {
                        store.api_keys.lock().unwrap().push(api_key);
                        None
                    }
                    StoreMessage::Query { id, query } if query.collection == "forbidden" => {
                        Some(StoreMessage::Error {
                            id: Some(id),
                            code: "PERMISSION_DENIED".into(),
                            message: "no access".into(),
                        })
                    }
                    StoreMessage::Query { id, query } => Some(StoreMessage::Snapshot {
                        id,
                        documents: store.result_set(&query),
                    }),
                    StoreMessage::Listen { id, query } => {
                        store.listens.fetch_add(1, Ordering::SeqCst);
                        let documents = store.result_set(&query);
                        live.push((id.clone(), query));
                        Some(StoreMessage::Snapshot { id, documents })
                    }
                    StoreMessage::Unlisten { id } => {
                        store.unlistens.fetch_add(1, Ordering::SeqCst);
                        live.retain(|(l, _)| *l != id);
                        None
                    }
                    _ => None,
                };
                if let Some(reply) = reply {
                    if !send(&mut socket, &reply).await {
                        break;
                    }
                }
            }

            Ok(()) = changed.recv() => {
                for (id, query) in live.clone() {
                    let snapshot = StoreMessage::Snapshot { id, documents: store.result_set(&query) };
                    if !send(&mut socket, &snapshot).await {
                        return;
                    }
                }
            }

            _ = kill.changed() => break,
        }
    }
    store.hangups.fetch_add(1, Ordering::SeqCst);
}

async fn spawn_store(store: Arc<MockStore>) -> String {
    let app = Router::new().route("/live", get(ws_handler)).with_state(store);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("ws://{}/live", addr)
}

async fn connect(store: Arc<MockStore>) -> WsLiveStore {
    let url = spawn_store(store).await;
    WsLiveStore::new(StoreConfig {
        api_key: Some("secret-key".into()),
        ..StoreConfig::new(url)
    })
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn open_trades() -> QueryShape {
    QueryShape::collection("trades").where_eq("is_open", true)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_get_once_authenticates_and_filters() {
    let mock = MockStore::new();
    let store = connect(mock.clone()).await;
    assert_eq!(store.state().await, ConnectionState::Disconnected);

    let docs = store.get_once(&open_trades()).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id, "a");
    assert_eq!(store.state().await, ConnectionState::Connected);
    assert_eq!(*mock.api_keys.lock().unwrap(), vec!["secret-key".to_string()]);

    // Reuses the connection.
    store.get_once(&QueryShape::collection("trades")).await.unwrap();
    assert_eq!(mock.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_query_is_a_store_error() {
    let store = connect(MockStore::new()).await;
    let err = store
        .get_once(&QueryShape::collection("forbidden"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::StoreRejected(ref m) if m.contains("PERMISSION_DENIED")));
}

#[tokio::test]
async fn test_listen_receives_pushes_until_dropped() {
    let mock = MockStore::new();
    let store = connect(mock.clone()).await;

    let mut feed = store.listen(&open_trades()).await.unwrap();
    let initial = feed.recv().await.unwrap().unwrap();
    assert_eq!(initial.len(), 1);

    mock.insert(Document::new("c", json!({ "symbol": "SOLUSDT", "is_open": true, "timestamp": 3 })));
    let next = timeout(Duration::from_secs(2), feed.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(next.len(), 2);

    drop(feed);
    eventually(|| mock.unlistens.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_disconnect_fails_every_live_query_once() {
    let mock = MockStore::new();
    let store = connect(mock.clone()).await;

    let mut open = store.listen(&open_trades()).await.unwrap();
    let mut all = store.listen(&QueryShape::collection("trades")).await.unwrap();
    open.recv().await.unwrap().unwrap();
    all.recv().await.unwrap().unwrap();

    mock.kill.send_replace(true);

    for feed in [&mut open, &mut all] {
        let item = timeout(Duration::from_secs(2), feed.recv()).await.unwrap();
        assert_eq!(item, Some(Err(SyncError::Disconnected)));
        assert!(feed.recv().await.is_none());
    }
    for _ in 0..100 {
        if store.state().await == ConnectionState::Disconnected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.state().await, ConnectionState::Disconnected);

    // The next request opens a fresh connection.
    mock.kill.send_replace(false);
    assert_eq!(store.get_once(&open_trades()).await.unwrap().len(), 1);
    assert_eq!(mock.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_manager_shares_one_upstream_listen() {
    let mock = MockStore::new();
    let store: Arc<dyn LiveStore> = Arc::new(connect(mock.clone()).await);
    let manager = SubscriptionManager::new(store);

    let counts = Arc::new((AtomicUsize::new(0), AtomicUsize::new(0)));
    let (c1, c2) = (counts.clone(), counts.clone());
    let first = manager
        .subscribe(open_trades(), SubscriptionMode::Live, move |_| {
            c1.0.fetch_add(1, Ordering::SeqCst);
        }, |_| {})
        .unwrap();
    let second = manager
        .subscribe(open_trades(), SubscriptionMode::Live, move |_| {
            c2.1.fetch_add(1, Ordering::SeqCst);
        }, |_| {})
        .unwrap();

    eventually(|| counts.0.load(Ordering::SeqCst) >= 1 && counts.1.load(Ordering::SeqCst) >= 1).await;
    assert_eq!(mock.listens.load(Ordering::SeqCst), 1);

    first.cancel();
    assert_eq!(manager.upstream_count(), 1);
    second.cancel();
    assert_eq!(manager.upstream_count(), 0);
    eventually(|| mock.unlistens.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_dropping_the_store_closes_the_socket() {
    let mock = MockStore::new();
    let store = connect(mock.clone()).await;

    let mut feed = store.listen(&open_trades()).await.unwrap();
    feed.recv().await.unwrap().unwrap();
    drop(store);

    // An open feed keeps the connection up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.hangups.load(Ordering::SeqCst), 0);

    drop(feed);
    eventually(|| mock.hangups.load(Ordering::SeqCst) == 1).await;
    assert_eq!(mock.unlistens.load(Ordering::SeqCst), 1);
}
