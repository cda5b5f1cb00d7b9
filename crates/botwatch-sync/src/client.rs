//! # Dashboard Client
//!
//! The consumer-facing API. Wires the primary source, the optional live
//! store, the data access layer, the subscription manager, the sync
//! controller and the preference context together.
//!
//! ```text
//! DashboardClient
//!   ├── fetch_*          ──► DataAccess (cache → primary → live store)
//!   ├── subscribe_*      ──► SubscriptionManager ──► LiveStore::listen
//!   ├── trigger_sync     ──► SyncController ──► DataAccess::trigger_reconciliation
//!   ├── sync_status      ◄── SyncController (watch channel)
//!   └── refresh / set_*  ──► Preferences + cache invalidation
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use botwatch_core::query::documents_to_records;
use botwatch_core::{
    AccountQuery, AccountSummary, BotEvent, CorrelationFilter, CorrelationPair,
    EventFilter, PerformanceFilter, PerformancePoint, SyncStatus, Trade, TradeFilter,
};

use crate::config::DashboardConfig;
use crate::controller::SyncController;
use crate::dal::{DataAccess, ReconcileOutcome, Resource};
use crate::error::{FetchError, SyncError, SyncResult};
use crate::preferences::{PreferenceValues, Preferences, Theme};
use crate::source::{HttpApi, LiveStore, PrimarySource, StoreConfig, WsLiveStore};
use crate::subscription::{SubscriptionHandle, SubscriptionManager, SubscriptionMode};

pub struct DashboardClient {
    dal: Arc<DataAccess>,
    subscriptions: Option<Arc<SubscriptionManager>>,
    controller: Arc<SyncController>,
    preferences: Arc<Preferences>,
    refresh_tx: watch::Sender<u64>,
}

impl DashboardClient {
    /// Builds a client from config: HTTP primary, plus a WebSocket store
    /// when a store URL is configured. Preferences load from their default
    /// location.
    pub fn from_config(config: DashboardConfig) -> SyncResult<Self> {
        DashboardClientBuilder::new(config).build()
    }

    pub fn builder(config: DashboardConfig) -> DashboardClientBuilder {
        DashboardClientBuilder::new(config)
    }

    // =========================================================================
    // One-shot Fetches
    // =========================================================================

    pub async fn fetch_account(&self) -> Result<AccountSummary, FetchError> {
        self.dal.fetch_account().await
    }

    pub async fn fetch_trades(&self, filter: &TradeFilter) -> Result<Vec<Trade>, FetchError> {
        self.dal.fetch_trades(filter).await
    }

    pub async fn fetch_correlation_pairs(
        &self,
        filter: &CorrelationFilter,
    ) -> Result<Vec<CorrelationPair>, FetchError> {
        self.dal.fetch_correlation_pairs(filter).await
    }

    pub async fn fetch_events(&self, filter: &EventFilter) -> Result<Vec<BotEvent>, FetchError> {
        self.dal.fetch_events(filter).await
    }

    pub async fn fetch_performance(
        &self,
        filter: &PerformanceFilter,
    ) -> Result<Vec<PerformancePoint>, FetchError> {
        self.dal.fetch_performance(filter).await
    }

    // =========================================================================
    // Live Subscriptions
    // =========================================================================

    /// Subscribes to one resource on the live store. Every snapshot is run
    /// through the same normalizer the fetch path uses.
    pub fn subscribe<R>(
        &self,
        resource: R,
        mode: SubscriptionMode,
        on_update: impl Fn(R::Output) + Send + Sync + 'static,
        on_error: impl Fn(SyncError) + Send + Sync + 'static,
    ) -> SyncResult<SubscriptionHandle>
    where
        R: Resource + 'static,
    {
        let manager = self.subscriptions()?;
        let shape = resource.shape();
        manager.subscribe(
            shape,
            mode,
            move |docs| on_update(resource.normalize(&documents_to_records(docs.to_vec()))),
            on_error,
        )
    }

    pub fn subscribe_trades(
        &self,
        filter: TradeFilter,
        on_update: impl Fn(Vec<Trade>) + Send + Sync + 'static,
        on_error: impl Fn(SyncError) + Send + Sync + 'static,
    ) -> SyncResult<SubscriptionHandle> {
        self.subscribe(filter, SubscriptionMode::Live, on_update, on_error)
    }

    pub fn subscribe_events(
        &self,
        filter: EventFilter,
        on_update: impl Fn(Vec<BotEvent>) + Send + Sync + 'static,
        on_error: impl Fn(SyncError) + Send + Sync + 'static,
    ) -> SyncResult<SubscriptionHandle> {
        self.subscribe(filter, SubscriptionMode::Live, on_update, on_error)
    }

    pub fn subscribe_correlation_pairs(
        &self,
        filter: CorrelationFilter,
        on_update: impl Fn(Vec<CorrelationPair>) + Send + Sync + 'static,
        on_error: impl Fn(SyncError) + Send + Sync + 'static,
    ) -> SyncResult<SubscriptionHandle> {
        self.subscribe(filter, SubscriptionMode::Live, on_update, on_error)
    }

    pub fn subscribe_account(
        &self,
        on_update: impl Fn(AccountSummary) + Send + Sync + 'static,
        on_error: impl Fn(SyncError) + Send + Sync + 'static,
    ) -> SyncResult<SubscriptionHandle> {
        self.subscribe(AccountQuery, SubscriptionMode::Live, on_update, on_error)
    }

    /// Shared subscription manager, for consumers that manage their own
    /// slots or streams.
    pub fn subscriptions(&self) -> SyncResult<&Arc<SubscriptionManager>> {
        self.subscriptions
            .as_ref()
            .ok_or_else(|| SyncError::Unavailable("live store not configured".into()))
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    pub async fn trigger_sync(&self) -> ReconcileOutcome {
        self.controller.trigger_sync().await
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.controller.status()
    }

    pub fn watch_sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.controller.watch()
    }

    /// Starts following backend-initiated reconciliations. Requires a live
    /// store.
    pub fn start_sync_feed(&self) -> SyncResult<()> {
        self.controller.start_feed(self.subscriptions()?)
    }

    // =========================================================================
    // Cache & Preferences
    // =========================================================================

    pub fn clear_cache(&self) {
        self.dal.clear_cache();
    }

    /// Explicit user refresh: drops every cached entry and bumps the
    /// refresh token so slot-held subscriptions re-establish.
    pub fn refresh(&self) -> u64 {
        self.dal.clear_cache();
        let mut token = 0;
        self.refresh_tx.send_modify(|t| {
            *t += 1;
            token = *t;
        });
        info!(token, "Dashboard refreshed");
        token
    }

    /// Current refresh token; changes on every [`refresh`](Self::refresh).
    pub fn watch_refresh(&self) -> watch::Receiver<u64> {
        self.refresh_tx.subscribe()
    }

    /// Changes the refresh cadence. A new cadence invalidates the cache.
    pub fn set_refresh_interval(&self, secs: u64) -> SyncResult<bool> {
        let changed = self.preferences.set_refresh_interval(secs)?;
        if changed {
            debug!(secs, "Refresh cadence changed, clearing cache");
            self.dal.clear_cache();
        }
        Ok(changed)
    }

    pub fn set_theme(&self, theme: Theme) -> SyncResult<bool> {
        self.preferences.set_theme(theme)
    }

    pub fn preferences(&self) -> PreferenceValues {
        self.preferences.get()
    }

    pub fn watch_preferences(&self) -> watch::Receiver<PreferenceValues> {
        self.preferences.watch()
    }

    pub fn data_access(&self) -> &DataAccess {
        &self.dal
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for a [`DashboardClient`] with custom sources.
pub struct DashboardClientBuilder {
    config: DashboardConfig,
    primary: Option<Arc<dyn PrimarySource>>,
    store: Option<Arc<dyn LiveStore>>,
    preferences: Option<Arc<Preferences>>,
    preferences_path: Option<PathBuf>,
}

impl DashboardClientBuilder {
    pub fn new(config: DashboardConfig) -> Self {
        DashboardClientBuilder {
            config,
            primary: None,
            store: None,
            preferences: None,
            preferences_path: None,
        }
    }

    /// Replaces the HTTP primary source.
    pub fn with_primary(mut self, primary: Arc<dyn PrimarySource>) -> Self {
        self.primary = Some(primary);
        self
    }

    /// Replaces the configured live store.
    pub fn with_store(mut self, store: Arc<dyn LiveStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_preferences(mut self, preferences: Arc<Preferences>) -> Self {
        self.preferences = Some(preferences);
        self
    }

    /// Loads preferences from `path` instead of the platform config dir.
    pub fn with_preferences_path(mut self, path: PathBuf) -> Self {
        self.preferences_path = Some(path);
        self
    }

    pub fn build(self) -> SyncResult<DashboardClient> {
        self.config.validate()?;

        let primary = match self.primary {
            Some(primary) => primary,
            None => Arc::new(HttpApi::from_config(&self.config)?),
        };

        let store = self.store.or_else(|| {
            StoreConfig::from_config(&self.config)
                .map(|c| Arc::new(WsLiveStore::new(c)) as Arc<dyn LiveStore>)
        });

        let preferences = self
            .preferences
            .unwrap_or_else(|| Arc::new(Preferences::load(self.preferences_path)));

        let dal = Arc::new(DataAccess::from_config(&self.config, primary, store.clone()));
        let controller = SyncController::new(dal.clone());
        let subscriptions = store.map(|s| Arc::new(SubscriptionManager::new(s)));
        let (refresh_tx, _) = watch::channel(0);

        info!(
            primary = %self.config.primary.base_url,
            live_store = subscriptions.is_some(),
            "Dashboard client ready"
        );

        Ok(DashboardClient {
            dal,
            subscriptions,
            controller,
            preferences,
            refresh_tx,
        })
    }
}
