//! # Sync Controller
//!
//! Drives the reconciliation state machine from two inputs and publishes
//! every resulting status.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncController                                 │
//! │                                                                         │
//! │   trigger_sync()                    passive feed                        │
//! │   ──────────────                    ────────────                        │
//! │   Start ──► DAL POST /sync          bot_events                          │
//! │     │         │                     where event_type == POSITION_SYNC   │
//! │     │    Success | Failure          newest first, limit 1               │
//! │     ▼         ▼                          │ unseen event id              │
//! │   ┌──────────────────────────────────────▼─────┐                        │
//! │   │  SyncState::apply (pure, botwatch-core)    │                        │
//! │   └──────────────────────┬─────────────────────┘                        │
//! │                          ▼                                              │
//! │               watch::Sender<SyncStatus>  ──► consumers                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rejected transitions are logged and dropped; the state stays as it was.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use botwatch_core::normalize;
use botwatch_core::query::documents_to_records;
use botwatch_core::reconcile::sync_feed_shape;
use botwatch_core::{ReconcileReport, SyncAction, SyncPhase, SyncState, SyncStatus};

use crate::dal::{DataAccess, ReconcileOutcome};
use crate::error::SyncResult;
use crate::subscription::{SubscriptionHandle, SubscriptionManager, SubscriptionMode};

pub struct SyncController {
    dal: Arc<DataAccess>,
    state: Mutex<SyncState>,
    status_tx: watch::Sender<SyncStatus>,
    last_event_id: Mutex<Option<String>>,
    feed: Mutex<Option<SubscriptionHandle>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl SyncController {
    pub fn new(dal: Arc<DataAccess>) -> Arc<Self> {
        let state = SyncState::default();
        let (status_tx, _) = watch::channel(state.status());
        Arc::new(SyncController {
            dal,
            state: Mutex::new(state),
            status_tx,
            last_event_id: Mutex::new(None),
            feed: Mutex::new(None),
        })
    }

    /// Applies one action. Returns the new status, or `None` if the
    /// action was rejected in the current phase.
    pub fn dispatch(&self, action: SyncAction) -> Option<SyncStatus> {
        let status = {
            let mut state = lock(&self.state);
            match state.apply(&action) {
                Ok(next) => {
                    debug!(action = action.name(), from = %state.phase, to = %next.phase, "Sync transition");
                    *state = next;
                    state.status()
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring sync action");
                    return None;
                }
            }
        };
        self.status_tx.send_replace(status.clone());
        Some(status)
    }

    /// Runs a manual reconciliation and returns its outcome.
    ///
    /// If a reconciliation is already in flight nothing is sent and the
    /// outcome reports that.
    pub async fn trigger_sync(&self) -> ReconcileOutcome {
        if self.dispatch(SyncAction::Start).is_none() {
            return ReconcileOutcome::failed("A reconciliation is already running");
        }

        info!("Manual reconciliation started");
        let outcome = self.dal.trigger_reconciliation().await;
        let action = match outcome.report() {
            Some(report) => SyncAction::Success(report),
            None => SyncAction::Failure(outcome.failure_reason()),
        };
        self.dispatch(action);
        outcome
    }

    /// Records a reconciliation the bot ran on its own.
    pub fn external_update(&self, report: ReconcileReport) -> Option<SyncStatus> {
        self.dispatch(SyncAction::ExternalUpdate(report))
    }

    // =========================================================================
    // Passive Feed
    // =========================================================================

    /// Subscribes to the newest `POSITION_SYNC` event. Each event id seen for
    /// the first time becomes an external update.
    ///
    /// Replaces any feed started earlier. The feed is not restarted after a
    /// store error; call this again to resume.
    pub fn start_feed(self: &Arc<Self>, subscriptions: &SubscriptionManager) -> SyncResult<()> {
        let on_snapshot = Arc::downgrade(self);
        let handle = subscriptions.subscribe(
            sync_feed_shape(),
            SubscriptionMode::Live,
            move |docs| {
                if let Some(controller) = Weak::upgrade(&on_snapshot) {
                    let events = normalize::events(&documents_to_records(docs.to_vec()));
                    if let Some(event) = events.first() {
                        controller.observe_event(&event.id, ReconcileReport::from_event(event));
                    }
                }
            },
            |err| warn!(error = %err, "Reconciliation feed stopped"),
        )?;

        info!("Reconciliation feed started");
        if let Some(old) = lock(&self.feed).replace(handle) {
            old.cancel();
        }
        Ok(())
    }

    pub fn stop_feed(&self) {
        if let Some(handle) = lock(&self.feed).take() {
            handle.cancel();
        }
    }

    fn observe_event(&self, event_id: &str, report: ReconcileReport) {
        {
            let mut last = lock(&self.last_event_id);
            if last.as_deref() == Some(event_id) {
                return;
            }
            *last = Some(event_id.to_string());
        }
        debug!(%event_id, sync_actions = report.sync_actions, "Backend reconciliation observed");
        self.external_update(report);
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn status(&self) -> SyncStatus {
        self.status_tx.borrow().clone()
    }

    pub fn phase(&self) -> SyncPhase {
        lock(&self.state).phase
    }

    /// Receiver that always holds the latest status.
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::error::SyncError;
    use crate::retry::RetryPolicy;
    use crate::source::{LiveStore, MemoryStore, PrimarySource};
    use async_trait::async_trait;
    use botwatch_core::Document;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Primary whose reconciliation endpoint answers with a fixed result,
    /// optionally after `gate` is notified.
    struct SyncEndpoint {
        result: SyncResult<Value>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl PrimarySource for SyncEndpoint {
        async fn get_json(&self, _: &str, _: &[(&'static str, String)]) -> SyncResult<Value> {
            Ok(Value::Null)
        }

        async fn post_json(&self, _: &str, _: &Value) -> SyncResult<Value> {
            if let Some(ref gate) = self.gate {
                gate.notified().await;
            }
            self.result.clone()
        }
    }

    fn controller(result: SyncResult<Value>, gate: Option<Arc<Notify>>) -> Arc<SyncController> {
        let dal = DataAccess::new(
            Arc::new(SyncEndpoint { result, gate }),
            None,
            CacheSettings::default(),
            RetryPolicy::once(Duration::from_secs(5)),
        );
        SyncController::new(Arc::new(dal))
    }

    #[tokio::test]
    async fn test_successful_sync() {
        let ctl = controller(
            Ok(json!({ "success": true, "sync_actions": 3, "synced_at": "2024-05-01T12:00:00Z" })),
            None,
        );
        assert!(ctl.status().is_in_sync);
        assert!(ctl.status().last_synced.is_none());

        let outcome = ctl.trigger_sync().await;
        assert!(outcome.success);

        let status = ctl.status();
        assert!(status.is_in_sync);
        assert!(!status.loading);
        assert_eq!(status.sync_actions, 3);
        assert_eq!(
            status.last_synced,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(ctl.phase(), SyncPhase::Synced);
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_in_sync_flag() {
        let ctl = controller(
            Err(SyncError::HttpStatus {
                status: 502,
                message: "exchange down".into(),
            }),
            None,
        );

        let outcome = ctl.trigger_sync().await;
        assert!(!outcome.success);

        let status = ctl.status();
        assert!(status.is_in_sync);
        assert!(!status.loading);
        assert!(status.error.unwrap().contains("exchange down"));
        assert_eq!(ctl.phase(), SyncPhase::Failed);

        // A new attempt clears the error while it runs.
        assert!(ctl.dispatch(SyncAction::Start).unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_status_is_loading_while_in_flight() {
        let gate = Arc::new(Notify::new());
        let ctl = controller(Ok(json!({ "success": true })), Some(gate.clone()));
        let mut rx = ctl.watch();

        let running = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.trigger_sync().await }
        });

        rx.changed().await.unwrap();
        assert!(rx.borrow().loading);

        let second = ctl.trigger_sync().await;
        assert!(!second.success, "concurrent trigger is refused");

        gate.notify_one();
        assert!(running.await.unwrap().success);
        assert!(!ctl.status().loading);
    }

    #[tokio::test]
    async fn test_invalid_transitions_are_ignored() {
        let ctl = controller(Ok(Value::Null), None);
        let report = ReconcileReport::new(Utc::now(), 1);
        assert!(ctl.dispatch(SyncAction::Success(report)).is_none());
        assert!(ctl.dispatch(SyncAction::Failure("x".into())).is_none());
        assert_eq!(ctl.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_passive_feed_applies_each_event_once() {
        let ctl = controller(Ok(Value::Null), None);
        let store = MemoryStore::new();
        let subs = SubscriptionManager::new(Arc::new(store.clone()) as Arc<dyn LiveStore>);
        let mut rx = ctl.watch();

        ctl.start_feed(&subs).unwrap();
        store.upsert(
            "bot_events",
            Document::new(
                "e1",
                json!({
                    "event_type": "POSITION_SYNC",
                    "timestamp": "2024-05-01T10:00:00Z",
                    "payload": { "sync_actions": 4 }
                }),
            ),
        );

        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        let status = rx.borrow_and_update().clone();
        assert_eq!(status.sync_actions, 4);
        assert_eq!(ctl.phase(), SyncPhase::Synced);

        // Unrelated events re-publish the same newest sync event: no new update.
        store.upsert("bot_events", Document::new("e2", json!({ "event_type": "TRADE_OPENED" })));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!rx.has_changed().unwrap());

        ctl.stop_feed();
        assert_eq!(subs.upstream_count(), 0);
    }
}
