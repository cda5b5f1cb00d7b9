//! # botwatch-core: Pure Domain Logic for the Bot Dashboard
//!
//! This crate holds everything about the dashboard's data that can be
//! decided without touching a network: canonical entity shapes, the
//! normalization rules that produce them, query shapes, and the
//! reconciliation state machine.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     botwatch Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Dashboard UI / botwatch-cli                     │   │
//! │  │     charts, tables, sync badge (consumers only)                 │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ DashboardClient                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    botwatch-sync (I/O)                          │   │
//! │  │   TTL cache • DAL fallback • subscriptions • sync controller    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ botwatch-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ normalize │  │   query   │  │ reconcile │  │   │
//! │  │   │  Trade    │  │  aliases  │  │ QueryShape│  │ SyncState │  │   │
//! │  │   │  BotEvent │  │  defaults │  │  filters  │  │ SyncAction│  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO TIMERS • PURE FUNCTIONS              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Canonical entities (AccountSummary, Trade, CorrelationPair, ...)
//! - [`normalize`] - Source record → canonical entity, with defaults
//! - [`query`] - Query shapes, documents, typed entity filters
//! - [`reconcile`] - Reconciliation reducer and status snapshot
//! - [`diff`] - Snapshot diffing for incremental consumers
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use botwatch_core::normalize;
//! use botwatch_core::reconcile::{ReconcileReport, SyncAction, SyncState};
//! use serde_json::json;
//!
//! let trades = normalize::trades(&json!([{ "id": "t1", "entryPrice": "101.5" }]));
//! assert_eq!(trades[0].entry_price, "101.5");
//!
//! let state = SyncState::default().apply(&SyncAction::Start).unwrap();
//! assert!(state.status().loading);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod diff;
pub mod error;
pub mod normalize;
pub mod query;
pub mod reconcile;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use diff::SnapshotDiff;
pub use error::{CoreError, CoreResult};
pub use query::{
    AccountQuery, CorrelationFilter, Direction, Document, EntityQuery, EventFilter, QueryShape,
    PerformanceFilter, TradeFilter,
};
pub use reconcile::{ReconcileReport, SyncAction, SyncPhase, SyncState, SyncStatus};
pub use types::*;
