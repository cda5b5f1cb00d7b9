//! # Data Access Layer
//!
//! One read path for every entity kind: cache, then primary, then secondary.
//!
//! ## Fetch Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DataAccess::fetch(resource)                     │
//! │                                                                         │
//! │   cache_key() ──► TtlCache::get ──hit──────────────────────► return    │
//! │                        │                                                │
//! │                       miss                                              │
//! │                        ▼                                                │
//! │   PrimarySource  (timeout + retry/backoff) ──ok──┐                     │
//! │                        │                          │                     │
//! │                      failed                       │                     │
//! │                        ▼                          │                     │
//! │   LiveStore::get_once (timeout + retry) ──ok─────┤                     │
//! │                        │                          ▼                     │
//! │                      failed              normalize ──► cache(ttl)      │
//! │                        ▼                          │                     │
//! │   Err(FetchError::BothSourcesFailed)              └──────────► return  │
//! │   (nothing cached)                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reconciliation is the one write: [`DataAccess::trigger_reconciliation`]
//! asks the primary to re-sync positions and reports the outcome as a value,
//! never as an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use botwatch_core::normalize;
use botwatch_core::query::documents_to_records;
use botwatch_core::{
    AccountQuery, AccountSummary, BotEvent, CorrelationFilter, CorrelationPair, EntityKind,
    EntityQuery, EventFilter, PerformanceFilter, PerformancePoint, ReconcileReport, Trade,
    TradeFilter,
};

use crate::cache::TtlCache;
use crate::config::{CacheSettings, DashboardConfig};
use crate::error::{FetchError, SyncError, SyncResult};
use crate::retry::RetryPolicy;
use crate::source::{endpoint_for, endpoints, LiveStore, PrimarySource};

// =============================================================================
// Cached Values
// =============================================================================

/// Normalized result of one fetch, as stored in the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedSnapshot {
    Account(AccountSummary),
    Trades(Vec<Trade>),
    CorrelationPairs(Vec<CorrelationPair>),
    Events(Vec<BotEvent>),
    Performance(Vec<PerformancePoint>),
}

// =============================================================================
// Resource Trait
// =============================================================================

/// An entity request that both sources can answer.
///
/// The default methods cover the common case: a GET on the entity endpoint
/// with the query's params, or a one-time store read of the query's shape.
/// Implementors only say how to normalize and how to (un)wrap the cached form.
#[async_trait]
pub trait Resource: EntityQuery + Send + Sync {
    type Output: Clone + Send + Sync + 'static;

    async fn fetch_primary(&self, primary: &dyn PrimarySource) -> SyncResult<Value> {
        primary.get_json(endpoint_for(Self::KIND), &self.params()).await
    }

    async fn fetch_secondary(&self, store: &dyn LiveStore) -> SyncResult<Value> {
        let docs = store.get_once(&self.shape()).await?;
        Ok(documents_to_records(docs))
    }

    fn normalize(&self, raw: &Value) -> Self::Output;

    fn wrap(output: Self::Output) -> CachedSnapshot;

    fn unwrap(snapshot: CachedSnapshot) -> Option<Self::Output>;
}

impl Resource for AccountQuery {
    type Output = AccountSummary;

    fn normalize(&self, raw: &Value) -> AccountSummary {
        normalize::account(raw)
    }

    fn wrap(output: AccountSummary) -> CachedSnapshot {
        CachedSnapshot::Account(output)
    }

    fn unwrap(snapshot: CachedSnapshot) -> Option<AccountSummary> {
        match snapshot {
            CachedSnapshot::Account(a) => Some(a),
            _ => None,
        }
    }
}

impl Resource for TradeFilter {
    type Output = Vec<Trade>;

    fn normalize(&self, raw: &Value) -> Vec<Trade> {
        normalize::trades(raw)
    }

    fn wrap(output: Vec<Trade>) -> CachedSnapshot {
        CachedSnapshot::Trades(output)
    }

    fn unwrap(snapshot: CachedSnapshot) -> Option<Vec<Trade>> {
        match snapshot {
            CachedSnapshot::Trades(t) => Some(t),
            _ => None,
        }
    }
}

impl Resource for CorrelationFilter {
    type Output = Vec<CorrelationPair>;

    fn normalize(&self, raw: &Value) -> Vec<CorrelationPair> {
        normalize::correlation_pairs(raw)
    }

    fn wrap(output: Vec<CorrelationPair>) -> CachedSnapshot {
        CachedSnapshot::CorrelationPairs(output)
    }

    fn unwrap(snapshot: CachedSnapshot) -> Option<Vec<CorrelationPair>> {
        match snapshot {
            CachedSnapshot::CorrelationPairs(p) => Some(p),
            _ => None,
        }
    }
}

impl Resource for EventFilter {
    type Output = Vec<BotEvent>;

    fn normalize(&self, raw: &Value) -> Vec<BotEvent> {
        normalize::events(raw)
    }

    fn wrap(output: Vec<BotEvent>) -> CachedSnapshot {
        CachedSnapshot::Events(output)
    }

    fn unwrap(snapshot: CachedSnapshot) -> Option<Vec<BotEvent>> {
        match snapshot {
            CachedSnapshot::Events(e) => Some(e),
            _ => None,
        }
    }
}

impl Resource for PerformanceFilter {
    type Output = Vec<PerformancePoint>;

    fn normalize(&self, raw: &Value) -> Vec<PerformancePoint> {
        normalize::performance(raw)
    }

    fn wrap(output: Vec<PerformancePoint>) -> CachedSnapshot {
        CachedSnapshot::Performance(output)
    }

    fn unwrap(snapshot: CachedSnapshot) -> Option<Vec<PerformancePoint>> {
        match snapshot {
            CachedSnapshot::Performance(p) => Some(p),
            _ => None,
        }
    }
}

// =============================================================================
// Reconciliation Outcome
// =============================================================================

/// Result of a manual reconciliation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub success: bool,
    pub sync_actions: u32,
    pub synced_at: DateTime<Utc>,
    pub message: Option<String>,
}

const SUCCESS: &[&str] = &["success", "ok"];
const SYNC_ACTIONS: &[&str] = &["sync_actions", "syncActions", "actions", "changes"];
const SYNCED_AT: &[&str] = &["synced_at", "syncedAt", "last_synced", "timestamp"];
const MESSAGE: &[&str] = &["message", "error", "detail"];

impl ReconcileOutcome {
    /// Reads the primary's answer. A body without an explicit `success`
    /// flag counts as success, since the request itself returned 2xx.
    pub fn from_response(body: &Value) -> Self {
        let empty = serde_json::Map::new();
        let obj = normalize::first_record(body).unwrap_or(&empty);

        let sync_actions = match normalize::field(obj, SYNC_ACTIONS) {
            Some(Value::Array(items)) => items.len() as u32,
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0).min(u32::MAX as u64) as u32,
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        };

        ReconcileOutcome {
            success: normalize::flag(obj, SUCCESS).unwrap_or(true),
            sync_actions,
            synced_at: normalize::timestamp_opt(obj, SYNCED_AT).unwrap_or_else(Utc::now),
            message: normalize::field(obj, MESSAGE)
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ReconcileOutcome {
            success: false,
            sync_actions: 0,
            synced_at: Utc::now(),
            message: Some(message.into()),
        }
    }

    /// Report to feed the reconciliation machine, if the request succeeded.
    pub fn report(&self) -> Option<ReconcileReport> {
        self.success
            .then(|| ReconcileReport::new(self.synced_at, self.sync_actions))
    }

    /// Human-readable failure reason.
    pub fn failure_reason(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| "Reconciliation was not performed".to_string())
    }
}

// =============================================================================
// Data Access
// =============================================================================

/// Dual-source reader with a shared TTL cache.
pub struct DataAccess {
    primary: Arc<dyn PrimarySource>,
    secondary: Option<Arc<dyn LiveStore>>,
    cache: TtlCache<CachedSnapshot>,
    ttls: CacheSettings,
    retry: RetryPolicy,
}

impl DataAccess {
    pub fn new(
        primary: Arc<dyn PrimarySource>,
        secondary: Option<Arc<dyn LiveStore>>,
        ttls: CacheSettings,
        retry: RetryPolicy,
    ) -> Self {
        DataAccess {
            primary,
            secondary,
            cache: TtlCache::new(),
            ttls,
            retry,
        }
    }

    pub fn from_config(
        config: &DashboardConfig,
        primary: Arc<dyn PrimarySource>,
        secondary: Option<Arc<dyn LiveStore>>,
    ) -> Self {
        Self::new(
            primary,
            secondary,
            config.cache.clone(),
            RetryPolicy::from_config(config),
        )
    }

    /// Reads one resource through cache, primary and secondary.
    pub async fn fetch<R: Resource>(&self, resource: &R) -> Result<R::Output, FetchError> {
        let entity = R::KIND;
        let key = resource.cache_key();

        if let Some(hit) = self.cache.get(&key).and_then(R::unwrap) {
            debug!(%entity, %key, "cache hit");
            return Ok(hit);
        }

        let raw = match self.read_primary(resource).await {
            Ok(raw) => raw,
            Err(primary) => {
                warn!(%entity, error = %primary, "Primary source failed, falling back to live store");
                match self.read_secondary(resource).await {
                    Ok(raw) => raw,
                    Err(secondary) => {
                        warn!(%entity, error = %secondary, "Live store read failed");
                        return Err(FetchError::BothSourcesFailed {
                            entity,
                            primary,
                            secondary,
                        });
                    }
                }
            }
        };

        let value = resource.normalize(&raw);
        self.cache
            .set(key, R::wrap(value.clone()), self.ttls.ttl_for(entity));
        Ok(value)
    }

    async fn read_primary<R: Resource>(&self, resource: &R) -> SyncResult<Value> {
        let primary = self.primary.as_ref();
        self.retry
            .run(R::KIND.name(), || resource.fetch_primary(primary))
            .await
    }

    async fn read_secondary<R: Resource>(&self, resource: &R) -> SyncResult<Value> {
        let store = self
            .secondary
            .as_deref()
            .ok_or_else(|| SyncError::Unavailable("live store not configured".into()))?;
        self.retry
            .run(R::KIND.name(), || resource.fetch_secondary(store))
            .await
    }

    // =========================================================================
    // Typed Fetches
    // =========================================================================

    pub async fn fetch_account(&self) -> Result<AccountSummary, FetchError> {
        self.fetch(&AccountQuery).await
    }

    pub async fn fetch_trades(&self, filter: &TradeFilter) -> Result<Vec<Trade>, FetchError> {
        self.fetch(filter).await
    }

    pub async fn fetch_correlation_pairs(
        &self,
        filter: &CorrelationFilter,
    ) -> Result<Vec<CorrelationPair>, FetchError> {
        self.fetch(filter).await
    }

    pub async fn fetch_events(&self, filter: &EventFilter) -> Result<Vec<BotEvent>, FetchError> {
        self.fetch(filter).await
    }

    pub async fn fetch_performance(
        &self,
        filter: &PerformanceFilter,
    ) -> Result<Vec<PerformancePoint>, FetchError> {
        self.fetch(filter).await
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Asks the primary to reconcile positions with the exchange.
    ///
    /// Single attempt, bounded by the request timeout. On success every
    /// cached trades and account entry is dropped.
    pub async fn trigger_reconciliation(&self) -> ReconcileOutcome {
        let body = json!({});
        let request = self.primary.post_json(endpoints::SYNC_POSITIONS, &body);

        let outcome = match timeout(self.retry.attempt_timeout, request).await {
            Ok(Ok(response)) => ReconcileOutcome::from_response(&response),
            Ok(Err(e)) => ReconcileOutcome::failed(e.to_string()),
            Err(_) => {
                ReconcileOutcome::failed(SyncError::Timeout(self.retry.attempt_timeout.as_secs()).to_string())
            }
        };

        if outcome.success {
            let dropped = self.invalidate(EntityKind::Trades) + self.invalidate(EntityKind::Account);
            info!(sync_actions = outcome.sync_actions, dropped, "Reconciliation completed");
        } else {
            warn!(reason = %outcome.failure_reason(), "Reconciliation failed");
        }
        outcome
    }

    // =========================================================================
    // Cache Control
    // =========================================================================

    /// Drops every cached variant of one entity kind.
    pub fn invalidate(&self, kind: EntityKind) -> usize {
        self.cache.invalidate_prefix(kind.name())
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryStore;
    use botwatch_core::{Document, TradeStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted primary: answers GETs from a fixed body, or fails.
    #[derive(Default)]
    struct FakePrimary {
        body: Mutex<Option<Value>>,
        error: Mutex<Option<SyncError>>,
        post_body: Mutex<Option<SyncResult<Value>>>,
        gets: AtomicUsize,
        posts: AtomicUsize,
        last_params: Mutex<Vec<(&'static str, String)>>,
    }

    impl FakePrimary {
        fn answering(body: Value) -> Self {
            let fake = FakePrimary::default();
            *fake.body.lock().unwrap() = Some(body);
            fake
        }

        fn failing(err: SyncError) -> Self {
            let fake = FakePrimary::default();
            *fake.error.lock().unwrap() = Some(err);
            fake
        }
    }

    #[async_trait]
    impl PrimarySource for FakePrimary {
        async fn get_json(&self, _path: &str, params: &[(&'static str, String)]) -> SyncResult<Value> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            *self.last_params.lock().unwrap() = params.to_vec();
            if let Some(err) = self.error.lock().unwrap().clone() {
                return Err(err);
            }
            Ok(self.body.lock().unwrap().clone().unwrap_or(Value::Null))
        }

        async fn post_json(&self, _path: &str, _body: &Value) -> SyncResult<Value> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            self.post_body
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Ok(json!({ "success": true, "sync_actions": 2 })))
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            attempt_timeout: Duration::from_secs(1),
            ..RetryPolicy::default()
        }
    }

    fn dal(primary: Arc<FakePrimary>, store: Option<MemoryStore>) -> DataAccess {
        DataAccess::new(
            primary,
            store.map(|s| Arc::new(s) as Arc<dyn LiveStore>),
            CacheSettings::default(),
            fast_retry(),
        )
    }

    fn trades_body() -> Value {
        json!({ "data": [
            { "id": "t1", "symbol": "BTCUSDT", "entry_price": "101.5", "status": "open" },
            { "id": "t2", "symbol": "ETHUSDT", "price": "2000", "status": "closed" }
        ]})
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_success_is_cached() {
        let primary = Arc::new(FakePrimary::answering(trades_body()));
        let dal = dal(primary.clone(), None);

        let first = dal.fetch_trades(&TradeFilter::default()).await.unwrap();
        let second = dal.fetch_trades(&TradeFilter::default()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].entry_price, "101.5");
        assert_eq!(first[1].entry_price, "2000");
        assert_eq!(primary.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_entity_ttl() {
        let primary = Arc::new(FakePrimary::answering(trades_body()));
        let dal = dal(primary.clone(), None);

        dal.fetch_trades(&TradeFilter::default()).await.unwrap();
        tokio::time::advance(Duration::from_secs(15)).await;
        dal.fetch_trades(&TradeFilter::default()).await.unwrap();

        assert_eq!(primary.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters_have_separate_cache_entries() {
        let primary = Arc::new(FakePrimary::answering(trades_body()));
        let dal = dal(primary.clone(), None);

        dal.fetch_trades(&TradeFilter::default()).await.unwrap();
        dal.fetch_trades(&TradeFilter::open()).await.unwrap();

        assert_eq!(primary.gets.load(Ordering::SeqCst), 2);
        let params = primary.last_params.lock().unwrap().clone();
        assert!(params.contains(&("status", "open".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_secondary_after_retries() {
        let primary = Arc::new(FakePrimary::failing(SyncError::ConnectionFailed("down".into())));
        let store = MemoryStore::new();
        store.upsert(
            "trades",
            Document::new("t9", json!({ "symbol": "SOLUSDT", "is_open": true, "avg_entry_price": "150" })),
        );
        let dal = dal(primary.clone(), Some(store.clone()));

        let trades = dal.fetch_trades(&TradeFilter::open()).await.unwrap();

        assert_eq!(primary.gets.load(Ordering::SeqCst), 4, "initial attempt + 3 retries");
        assert_eq!(store.read_count(), 1);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].id, "t9");
        assert_eq!(trades[0].status, TradeStatus::Open);
        assert_eq!(trades[0].entry_price, "150");
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_skips_retries_but_still_falls_back() {
        let primary = Arc::new(FakePrimary::failing(SyncError::HttpStatus {
            status: 404,
            message: "missing".into(),
        }));
        let store = MemoryStore::new();
        let dal = dal(primary.clone(), Some(store));

        let events = dal.fetch_events(&EventFilter::default()).await.unwrap();
        assert!(events.is_empty());
        assert_eq!(primary.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_sources_failing_is_not_cached() {
        let primary = Arc::new(FakePrimary::failing(SyncError::ConnectionFailed("down".into())));
        let store = MemoryStore::new();
        store.set_failure(Some(SyncError::Disconnected));
        let dal = dal(primary.clone(), Some(store.clone()));

        let err = dal.fetch_account().await.unwrap_err();
        let FetchError::BothSourcesFailed {
            entity,
            primary: p,
            secondary: s,
        } = err;
        assert_eq!(entity, EntityKind::Account);
        assert!(matches!(p, SyncError::ConnectionFailed(_)));
        assert_eq!(s, SyncError::Disconnected);
        assert_eq!(dal.cached_entries(), 0);

        // Sources recover: the next call goes to the network again.
        *primary.error.lock().unwrap() = None;
        *primary.body.lock().unwrap() = Some(json!({ "balance": "1000", "equity": "1010" }));
        let account = dal.fetch_account().await.unwrap();
        assert_eq!(account.balance, "1000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_secondary_is_reported() {
        let primary = Arc::new(FakePrimary::failing(SyncError::HttpStatus {
            status: 500,
            message: "boom".into(),
        }));
        let dal = dal(primary, None);

        match dal.fetch_performance(&PerformanceFilter::default()).await {
            Err(FetchError::BothSourcesFailed { secondary, .. }) => {
                assert!(matches!(secondary, SyncError::Unavailable(_)))
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciliation_invalidates_trades_and_account() {
        let primary = Arc::new(FakePrimary::answering(trades_body()));
        let dal = dal(primary.clone(), None);

        dal.fetch_trades(&TradeFilter::default()).await.unwrap();
        dal.fetch_trades(&TradeFilter::open()).await.unwrap();
        dal.fetch_correlation_pairs(&CorrelationFilter::default()).await.unwrap();
        assert_eq!(dal.cached_entries(), 3);

        let outcome = dal.trigger_reconciliation().await;
        assert!(outcome.success);
        assert_eq!(outcome.sync_actions, 2);
        assert_eq!(dal.cached_entries(), 1, "correlation pairs stay cached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciliation_failure_is_a_value() {
        let primary = Arc::new(FakePrimary::default());
        *primary.post_body.lock().unwrap() = Some(Err(SyncError::HttpStatus {
            status: 503,
            message: "exchange unreachable".into(),
        }));
        let dal = dal(primary.clone(), None);

        let outcome = dal.trigger_reconciliation().await;
        assert!(!outcome.success);
        assert!(outcome.failure_reason().contains("exchange unreachable"));
        assert!(outcome.report().is_none());
        assert_eq!(primary.posts.load(Ordering::SeqCst), 1, "writes are not retried");
    }

    #[test]
    fn test_outcome_parsing() {
        let outcome = ReconcileOutcome::from_response(&json!({
            "success": false,
            "error": "no exchange session",
            "actions": [{}, {}, {}]
        }));
        assert!(!outcome.success);
        assert_eq!(outcome.sync_actions, 3);
        assert_eq!(outcome.message.as_deref(), Some("no exchange session"));

        let bare = ReconcileOutcome::from_response(&Value::Null);
        assert!(bare.success);
        assert_eq!(bare.sync_actions, 0);
        assert!(bare.report().is_some());
    }

    #[test]
    fn test_outcome_action_count_saturates() {
        let outcome = ReconcileOutcome::from_response(&json!({ "sync_actions": 5_000_000_000u64 }));
        assert_eq!(outcome.sync_actions, u32::MAX);

        let outcome = ReconcileOutcome::from_response(&json!({ "sync_actions": -4 }));
        assert_eq!(outcome.sync_actions, 0);
    }
}
