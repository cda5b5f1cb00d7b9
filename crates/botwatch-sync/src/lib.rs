//! # botwatch-sync: Data Layer for the Trading Bot Dashboard
//!
//! Decides where dashboard data comes from, how long it is trusted, how live
//! updates reach consumers, and whether the local view matches the bot's
//! position ledger.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DashboardClient                                 │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 DataAccess (dal.rs)                              │  │
//! │  │                                                                  │  │
//! │  │  TtlCache ──miss──► PrimarySource ──fail──► LiveStore::get_once  │  │
//! │  │  per-entity TTL     (HTTP, retried)         (retried)            │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  ┌────────────────────────────┐   ┌────────────────────────────────┐   │
//! │  │ SubscriptionManager        │   │ SyncController                 │   │
//! │  │                            │   │                                │   │
//! │  │ One upstream listen per    │   │ Manual reconciliation          │   │
//! │  │ query shape, fan-out to    │   │ + POSITION_SYNC event feed     │   │
//! │  │ every listener             │   │ → SyncStatus (watch channel)   │   │
//! │  └─────────────┬──────────────┘   └────────────────────────────────┘   │
//! │                ▼                                                        │
//! │  ┌────────────────────────────┐   ┌────────────────────────────────┐   │
//! │  │ LiveStore                  │   │ Preferences                    │   │
//! │  │ WsLiveStore | MemoryStore  │   │ refresh cadence, theme         │   │
//! │  └────────────────────────────┘   └────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`cache`] - TTL cache with lazy expiry
//! - [`client`] - `DashboardClient` facade and builder
//! - [`config`] - Endpoints, TTL bands and retry settings
//! - [`controller`] - Reconciliation state driver
//! - [`dal`] - Dual-source reads and the reconciliation trigger
//! - [`error`] - Sync error types
//! - [`preferences`] - Session preferences
//! - [`retry`] - Exponential backoff policy
//! - [`source`] - HTTP primary and live-store implementations
//! - [`subscription`] - Shared live subscriptions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use botwatch_sync::{DashboardClient, DashboardConfig};
//! use botwatch_core::TradeFilter;
//!
//! let client = DashboardClient::from_config(DashboardConfig::load_or_default(None))?;
//!
//! let account = client.fetch_account().await?;
//! println!("Equity: {}", account.equity);
//!
//! let _handle = client.subscribe_trades(
//!     TradeFilter::open(),
//!     |trades| println!("{} open trades", trades.len()),
//!     |e| eprintln!("feed lost: {}", e),
//! )?;
//!
//! let outcome = client.trigger_sync().await;
//! println!("Reconciled: {}", outcome.success);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod dal;
pub mod error;
pub mod preferences;
pub mod retry;
pub mod source;
pub mod subscription;

// =============================================================================
// Re-exports
// =============================================================================

pub use cache::TtlCache;
pub use client::{DashboardClient, DashboardClientBuilder};
pub use config::{CacheSettings, DashboardConfig, PrimarySettings, RetrySettings, SecondarySettings};
pub use controller::SyncController;
pub use dal::{CachedSnapshot, DataAccess, ReconcileOutcome, Resource};
pub use error::{FetchError, SyncError, SyncResult};
pub use preferences::{PreferenceValues, Preferences, Theme};
pub use retry::RetryPolicy;
pub use source::{HttpApi, LiveFeed, LiveStore, MemoryStore, PrimarySource, StoreConfig, WsLiveStore};
pub use subscription::{
    Snapshot, SnapshotStream, SubscriptionHandle, SubscriptionManager, SubscriptionMode,
    SubscriptionSlot, SubscriptionState,
};
