//! Primary source and data access layer against a mock REST backend.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use botwatch_core::{Document, EventFilter, TradeFilter};
use botwatch_sync::{
    CacheSettings, DashboardClient, DashboardConfig, DataAccess, FetchError, HttpApi, LiveStore,
    MemoryStore, Preferences, PrimarySource, RetryPolicy,
};

#[derive(Default)]
struct Backend {
    account_hits: AtomicUsize,
    trade_hits: AtomicUsize,
    event_hits: AtomicUsize,
    /// Trade requests answered 503 before the backend recovers.
    trade_failures: AtomicUsize,
    trade_params: Mutex<Vec<HashMap<String, String>>>,
}

async fn account(State(b): State<Arc<Backend>>) -> Json<Value> {
    b.account_hits.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "data": [{
            "account_id": "main",
            "total_balance": "12500.00",
            "equity": "12740.50",
            "open_positions": [{ "symbol": "BTCUSDT" }, { "symbol": "ETHUSDT" }]
        }]
    }))
}

async fn trades(
    State(b): State<Arc<Backend>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    b.trade_hits.fetch_add(1, Ordering::SeqCst);
    b.trade_params.lock().unwrap().push(params);
    let pending = b.trade_failures.load(Ordering::SeqCst);
    if pending > 0 {
        b.trade_failures.store(pending - 1, Ordering::SeqCst);
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!([
        { "id": "t1", "symbol": "BTCUSDT", "status": "open", "price": "64000.5", "qty": "0.01" }
    ])))
}

async fn events(State(b): State<Arc<Backend>>) -> StatusCode {
    b.event_hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn sync_positions() -> Json<Value> {
    Json(json!({
        "success": true,
        "sync_actions": ["closed t9", "opened t10", "resized t11"],
        "synced_at": "2024-06-01T08:30:00Z"
    }))
}

fn routes(backend: Arc<Backend>) -> Router {
    Router::new()
        .route("/api/account/summary", get(account))
        .route("/api/trades", get(trades))
        .route("/api/events", get(events))
        .route("/api/positions/sync", post(sync_positions))
        .with_state(backend)
}

async fn spawn_backend(backend: Arc<Backend>) -> String {
    serve(routes(backend)).await
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        multiplier: 2.0,
        attempt_timeout: Duration::from_secs(5),
    }
}

async fn data_access(backend: Arc<Backend>, store: Option<MemoryStore>) -> DataAccess {
    let base = spawn_backend(backend).await;
    let primary: Arc<dyn PrimarySource> = Arc::new(HttpApi::new(&base, Duration::from_secs(5)).unwrap());
    let store = store.map(|s| Arc::new(s) as Arc<dyn LiveStore>);
    DataAccess::new(primary, store, CacheSettings::default(), fast_retry())
}

#[tokio::test]
async fn test_account_envelope_is_normalized_and_cached() {
    let backend = Arc::new(Backend::default());
    let dal = data_access(backend.clone(), None).await;

    let account = dal.fetch_account().await.unwrap();
    assert_eq!(account.id, "main");
    assert_eq!(account.balance, "12500.00");
    assert_eq!(account.equity, "12740.50");
    assert_eq!(account.open_positions, 2);

    dal.fetch_account().await.unwrap();
    assert_eq!(backend.account_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_trade_filter_becomes_query_params() {
    let backend = Arc::new(Backend::default());
    let dal = data_access(backend.clone(), None).await;

    let trades = dal.fetch_trades(&TradeFilter::open()).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].entry_price, "64000.5");
    assert_eq!(trades[0].quantity, "0.01");
    assert!(trades[0].is_open());

    let params = backend.trade_params.lock().unwrap();
    assert_eq!(params[0].get("status").map(String::as_str), Some("open"));
    assert_eq!(params[0].get("limit").map(String::as_str), Some("100"));
}

#[tokio::test]
async fn test_service_unavailable_is_retried() {
    let backend = Arc::new(Backend::default());
    backend.trade_failures.store(2, Ordering::SeqCst);
    let dal = data_access(backend.clone(), None).await;

    let trades = dal.fetch_trades(&TradeFilter::default()).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(backend.trade_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_falls_back_to_live_store() {
    let backend = Arc::new(Backend::default());
    let store = MemoryStore::new();
    store.upsert(
        "bot_events",
        Document::new(
            "e1",
            json!({ "event_type": "ORDER_FILLED", "level": "info", "timestamp": "2024-06-01T08:00:00Z" }),
        ),
    );
    let dal = data_access(backend.clone(), Some(store.clone())).await;

    let events = dal.fetch_events(&EventFilter::default()).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, "e1");
    assert_eq!(events[0].event_type, "ORDER_FILLED");
    assert_eq!(backend.event_hits.load(Ordering::SeqCst), 3, "first attempt plus two retries");
    assert_eq!(store.read_count(), 1);
}

#[tokio::test]
async fn test_both_sources_failing_is_not_cached() {
    let backend = Arc::new(Backend::default());
    let store = MemoryStore::new();
    store.set_failure(Some(botwatch_sync::SyncError::Disconnected));
    let dal = data_access(backend.clone(), Some(store.clone())).await;

    let err = dal.fetch_events(&EventFilter::default()).await.unwrap_err();
    let FetchError::BothSourcesFailed { primary, .. } = &err;
    assert!(matches!(primary, botwatch_sync::SyncError::HttpStatus { status: 500, .. }));
    assert_eq!(dal.cached_entries(), 0);

    store.set_failure(None);
    assert!(dal.fetch_events(&EventFilter::default()).await.is_ok());
    assert_eq!(backend.event_hits.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_manual_reconciliation_through_client() {
    let backend = Arc::new(Backend::default());
    let base = spawn_backend(backend.clone()).await;

    let mut config = DashboardConfig::default();
    config.primary.base_url = base;
    let client = DashboardClient::builder(config)
        .with_preferences(Arc::new(Preferences::ephemeral()))
        .build()
        .unwrap();

    client.fetch_account().await.unwrap();
    let outcome = client.trigger_sync().await;
    assert!(outcome.success);
    assert_eq!(outcome.sync_actions, 3);

    let status = client.sync_status();
    assert!(status.is_in_sync);
    assert_eq!(status.sync_actions, 3);
    assert_eq!(
        status.last_synced.map(|t| t.to_rfc3339()),
        Some("2024-06-01T08:30:00+00:00".to_string())
    );

    // Reconciliation drops cached account data.
    client.fetch_account().await.unwrap();
    assert_eq!(backend.account_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_base_url_with_path_prefix() {
    let backend = Arc::new(Backend::default());
    let root = serve(Router::new().nest("/bot", routes(backend.clone()))).await;
    let primary: Arc<dyn PrimarySource> =
        Arc::new(HttpApi::new(&format!("{}/bot", root), Duration::from_secs(5)).unwrap());
    let dal = DataAccess::new(primary, None, CacheSettings::default(), fast_retry());

    let account = dal.fetch_account().await.unwrap();
    assert_eq!(account.id, "main");
    assert_eq!(backend.account_hits.load(Ordering::SeqCst), 1);
    assert!(dal.trigger_reconciliation().await.success);
}
