//! # Reconciliation State Machine
//!
//! Tracks whether the locally displayed positions match the bot's
//! authoritative ledger. This module is the pure half: a tagged action type
//! and a transition function. The driver that performs the reconciliation
//! write and listens to the event feed lives in `botwatch-sync`.
//!
//! ## Transitions
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  Reconciliation State Machine                           │
//! │                                                                         │
//! │              SYNC_START                  SYNC_SUCCESS                   │
//! │  ┌──────┐  ─────────────►  ┌─────────┐  ─────────────►  ┌────────┐    │
//! │  │ Idle │                  │ Syncing │                  │ Synced │    │
//! │  └──────┘        ┌───────► └────┬────┘ ◄─────────────── └────────┘    │
//! │                  │              │          SYNC_START        ▲         │
//! │       SYNC_START │              │ SYNC_FAILURE               │         │
//! │                  │              ▼                            │         │
//! │                  │         ┌────────┐                        │         │
//! │                  └──────── │ Failed │                        │         │
//! │                            └────────┘                        │         │
//! │                                                              │         │
//! │  EXTERNAL_UPDATE: any state ─────────────────────────────────┘         │
//! │                                                                         │
//! │  • Initial: Idle, is_in_sync = true, last_synced = none, actions = 0   │
//! │  • SYNC_FAILURE keeps is_in_sync as it was                             │
//! │  • No terminal state                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::normalize;
use crate::query::{EventFilter, QueryShape};
use crate::types::{BotEvent, EntityKind};

/// Event type the bot emits when it finishes a reconciliation pass.
pub const POSITION_SYNC_EVENT: &str = "POSITION_SYNC";

/// Payload aliases for the number of corrective actions taken.
const SYNC_ACTIONS: &[&str] = &[
    "sync_actions",
    "syncActions",
    "actions_count",
    "actionsCount",
    "actions",
];

/// Payload aliases for the completion time.
const SYNCED_AT: &[&str] = &["synced_at", "syncedAt", "last_synced", "lastSynced", "timestamp"];

// =============================================================================
// Phase
// =============================================================================

/// Coarse state of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Syncing,
    Synced,
    Failed,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "idle"),
            SyncPhase::Syncing => write!(f, "syncing"),
            SyncPhase::Synced => write!(f, "synced"),
            SyncPhase::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// Reports & Actions
// =============================================================================

/// Result of one reconciliation pass, manual or backend-initiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub last_synced: DateTime<Utc>,
    pub sync_actions: u32,
}

impl ReconcileReport {
    pub fn new(last_synced: DateTime<Utc>, sync_actions: u32) -> Self {
        ReconcileReport {
            last_synced,
            sync_actions,
        }
    }

    /// Reads a report out of a `POSITION_SYNC` event.
    ///
    /// Missing counts default to 0; a missing completion time falls back to
    /// the event's own timestamp.
    pub fn from_event(event: &BotEvent) -> Self {
        let payload = event.payload.as_object();

        let sync_actions = payload
            .and_then(|p| normalize::field(p, SYNC_ACTIONS))
            .and_then(|v| match v {
                serde_json::Value::Number(n) => n.as_u64(),
                serde_json::Value::String(s) => s.trim().parse().ok(),
                serde_json::Value::Array(items) => Some(items.len() as u64),
                _ => None,
            })
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0);

        let last_synced = payload
            .and_then(|p| normalize::timestamp_opt(p, SYNCED_AT))
            .unwrap_or(event.timestamp);

        ReconcileReport {
            last_synced,
            sync_actions,
        }
    }
}

/// Actions accepted by the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    /// A manual reconciliation was requested.
    Start,
    /// The manual reconciliation completed.
    Success(ReconcileReport),
    /// The manual reconciliation could not be performed.
    Failure(String),
    /// The backend reported a reconciliation it ran on its own.
    ExternalUpdate(ReconcileReport),
}

impl SyncAction {
    /// Stable action name, used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            SyncAction::Start => "SYNC_START",
            SyncAction::Success(_) => "SYNC_SUCCESS",
            SyncAction::Failure(_) => "SYNC_FAILURE",
            SyncAction::ExternalUpdate(_) => "EXTERNAL_UPDATE",
        }
    }
}

// =============================================================================
// Status Snapshot
// =============================================================================

/// Read-only view handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_in_sync: bool,

    #[ts(as = "Option<String>")]
    pub last_synced: Option<DateTime<Utc>>,

    pub sync_actions: u32,

    /// True while a manual reconciliation is in flight.
    pub loading: bool,

    pub error: Option<String>,
}

// =============================================================================
// State
// =============================================================================

/// Full machine state.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub phase: SyncPhase,
    pub is_in_sync: bool,
    pub last_synced: Option<DateTime<Utc>>,
    pub sync_actions: u32,
    pub error: Option<String>,
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState {
            phase: SyncPhase::Idle,
            is_in_sync: true,
            last_synced: None,
            sync_actions: 0,
            error: None,
        }
    }
}

impl SyncState {
    /// Computes the state that follows `action`.
    ///
    /// Pure: `self` is never modified. Actions that do not apply to the
    /// current phase return [`CoreError::InvalidTransition`].
    pub fn apply(&self, action: &SyncAction) -> CoreResult<SyncState> {
        match (self.phase, action) {
            (SyncPhase::Idle | SyncPhase::Failed | SyncPhase::Synced, SyncAction::Start) => {
                Ok(SyncState {
                    phase: SyncPhase::Syncing,
                    error: None,
                    ..self.clone()
                })
            }

            (SyncPhase::Syncing, SyncAction::Success(report)) => Ok(self.synced(report)),

            (SyncPhase::Syncing, SyncAction::Failure(error)) => Ok(SyncState {
                phase: SyncPhase::Failed,
                error: Some(error.clone()),
                ..self.clone()
            }),

            (_, SyncAction::ExternalUpdate(report)) => Ok(self.synced(report)),

            (phase, action) => Err(CoreError::invalid_transition(phase, action)),
        }
    }

    fn synced(&self, report: &ReconcileReport) -> SyncState {
        SyncState {
            phase: SyncPhase::Synced,
            is_in_sync: true,
            last_synced: Some(report.last_synced),
            sync_actions: report.sync_actions,
            error: None,
        }
    }

    /// Returns the consumer-facing snapshot.
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_in_sync: self.is_in_sync,
            last_synced: self.last_synced,
            sync_actions: self.sync_actions,
            loading: self.phase == SyncPhase::Syncing,
            error: self.error.clone(),
        }
    }
}

// =============================================================================
// Passive Feed
// =============================================================================

/// Event query behind the passive reconciliation feed: the newest
/// `POSITION_SYNC` event.
pub fn sync_feed_filter() -> EventFilter {
    EventFilter::of_type(POSITION_SYNC_EVENT, 1)
}

/// Live-store shape of [`sync_feed_filter`].
pub fn sync_feed_shape() -> QueryShape {
    QueryShape::collection(EntityKind::Events.collection())
        .where_eq("event_type", POSITION_SYNC_EVENT)
        .order_by_desc("timestamp")
        .limit(1)
}
