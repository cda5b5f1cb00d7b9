//! # Data Sources
//!
//! The two backends the dashboard reads from, behind one trait each.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Source Seams                                  │
//! │                                                                         │
//! │  PrimarySource (request/response)     LiveStore (query + push)         │
//! │  ─────────────────────────────────    ─────────────────────────────     │
//! │  get_json(path, params)               get_once(shape)   one-time read  │
//! │  post_json(path, body)                listen(shape)     LiveFeed       │
//! │                                                                         │
//! │  impls:                               impls:                           │
//! │  • HttpApi (reqwest)                  • WsLiveStore (tungstenite)      │
//! │                                       • MemoryStore (in-process)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use botwatch_core::{Document, EntityKind, QueryShape};

use crate::error::SyncResult;

pub mod http;
pub mod memory;
pub mod protocol;
pub mod ws;

pub use http::HttpApi;
pub use memory::MemoryStore;
pub use ws::{StoreConfig, WsLiveStore};

// =============================================================================
// Primary Source
// =============================================================================

/// Primary source endpoint paths.
pub mod endpoints {
    pub const ACCOUNT_SUMMARY: &str = "/api/account/summary";
    pub const TRADES: &str = "/api/trades";
    pub const CORRELATION_PAIRS: &str = "/api/correlation-pairs";
    pub const EVENTS: &str = "/api/events";
    pub const PERFORMANCE: &str = "/api/performance";
    pub const SYNC_POSITIONS: &str = "/api/positions/sync";
}

/// Read path for an entity kind.
pub fn endpoint_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Account => endpoints::ACCOUNT_SUMMARY,
        EntityKind::Trades => endpoints::TRADES,
        EntityKind::CorrelationPairs => endpoints::CORRELATION_PAIRS,
        EntityKind::Events => endpoints::EVENTS,
        EntityKind::Performance => endpoints::PERFORMANCE,
    }
}

/// Request/response aggregation endpoint.
///
/// Any non-success answer is an error; retry and fallback are the caller's
/// business.
#[async_trait]
pub trait PrimarySource: Send + Sync {
    async fn get_json(&self, path: &str, params: &[(&'static str, String)]) -> SyncResult<Value>;

    async fn post_json(&self, path: &str, body: &Value) -> SyncResult<Value>;
}

// =============================================================================
// Live Store
// =============================================================================

/// Result item of a live feed: a full result set or a terminal error.
pub type FeedItem = SyncResult<Vec<Document>>;

/// Push channel for one `listen` registration.
///
/// Every item is the complete result set of the query at that moment. An
/// `Err` item ends the feed. Dropping the feed unregisters it upstream.
pub struct LiveFeed {
    rx: mpsc::UnboundedReceiver<FeedItem>,
    on_close: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl LiveFeed {
    pub fn new(rx: mpsc::UnboundedReceiver<FeedItem>) -> Self {
        LiveFeed { rx, on_close: None }
    }

    /// Runs `f` once when the feed is dropped.
    pub fn on_close(mut self, f: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    /// Waits for the next snapshot. `None` means the store closed the feed.
    pub async fn recv(&mut self) -> Option<FeedItem> {
        self.rx.recv().await
    }
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        if let Some(f) = self.on_close.take() {
            f();
        }
    }
}

impl std::fmt::Debug for LiveFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveFeed").finish_non_exhaustive()
    }
}

/// Document store with one-time reads and push subscriptions.
#[async_trait]
pub trait LiveStore: Send + Sync {
    /// Reads the current result set once, without subscribing.
    async fn get_once(&self, shape: &QueryShape) -> SyncResult<Vec<Document>>;

    /// Registers a live query. The first item is the current result set.
    async fn listen(&self, shape: &QueryShape) -> SyncResult<LiveFeed>;
}
