//! # Live Subscription Manager
//!
//! Shares one upstream live query between every consumer interested in the
//! same query shape.
//!
//! ## Fan-out Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     SubscriptionManager registry                        │
//! │                                                                         │
//! │  key = (QueryShape::key(), mode)                                        │
//! │                                                                         │
//! │  ┌─────────────────────────┐        ┌──────────────┐                    │
//! │  │ Channel                 │        │ upstream task│◄── LiveStore       │
//! │  │  state: Active          │◄───────│ listen()/    │    (one per key)   │
//! │  │  latest: snapshot #7    │        │ get_once()   │                    │
//! │  │  listeners: [A, B, C]   │        └──────────────┘                    │
//! │  └───────────┬─────────────┘                                            │
//! │              │ snapshot #8                                              │
//! │      ┌───────┼────────┐                                                 │
//! │      ▼       ▼        ▼                                                 │
//! │   on_snapshot callbacks (outside the registry lock)                     │
//! │                                                                         │
//! │  Late joiner D: registered, then handed snapshot #7 immediately.        │
//! │  Upstream error: on_error once per listener, channel removed.           │
//! │  Last handle cancelled: upstream task aborted, channel removed.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Subscription States
//! `Unsubscribed → Subscribing → Active → (Error | Unsubscribed)`
//!
//! Snapshots carry a sequence number per channel. A listener never receives
//! a snapshot older than one it has already seen, even when the late-joiner
//! replay races a fresh upstream push.

use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use botwatch_core::{Document, QueryShape};

use crate::error::{SyncError, SyncResult};
use crate::source::LiveStore;

// =============================================================================
// Public Types
// =============================================================================

/// Whether a subscription keeps listening or reads once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionMode {
    /// Push every change until cancelled.
    Live,
    /// One snapshot from a one-time read, then done.
    OneTime,
}

/// Lifecycle of one subscription, as seen by its holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Active,
    Error,
}

/// Full result set shared by every listener of a channel.
pub type Snapshot = Arc<Vec<Document>>;

type SnapshotCallback = Box<dyn Fn(Snapshot) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(SyncError) + Send + Sync>;

// =============================================================================
// Listener
// =============================================================================

struct Listener {
    id: u64,
    active: AtomicBool,
    failed: AtomicBool,
    last_seq: AtomicU64,
    state: Mutex<SubscriptionState>,
    on_snapshot: SnapshotCallback,
    on_error: ErrorCallback,
}

impl Listener {
    fn set_state(&self, state: SubscriptionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn state(&self) -> SubscriptionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn deliver(&self, seq: u64, snapshot: Snapshot) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        if self.last_seq.fetch_max(seq, Ordering::SeqCst) >= seq {
            return;
        }
        self.set_state(SubscriptionState::Active);
        (self.on_snapshot)(snapshot);
    }

    /// Reports a terminal error. Fires at most once; the listener goes
    /// inactive only after the callback returned.
    fn fail(&self, err: SyncError) {
        if !self.active.load(Ordering::SeqCst) || self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        (self.on_error)(err);
        self.active.store(false, Ordering::SeqCst);
        self.set_state(SubscriptionState::Error);
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChannelKey {
    shape: String,
    mode: SubscriptionMode,
}

struct Channel {
    generation: u64,
    state: SubscriptionState,
    seq: u64,
    latest: Option<Snapshot>,
    listeners: Vec<Arc<Listener>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<ChannelKey, Channel>,
    next_id: u64,
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|p| p.into_inner())
}

/// Stores a new snapshot and hands it to every listener.
fn publish(registry: &Mutex<Registry>, key: &ChannelKey, generation: u64, docs: Vec<Document>) {
    let (seq, snapshot, listeners) = {
        let mut reg = lock(registry);
        let Some(channel) = reg.channels.get_mut(key) else {
            return;
        };
        if channel.generation != generation {
            return;
        }
        channel.seq += 1;
        channel.state = SubscriptionState::Active;
        let snapshot = Arc::new(docs);
        channel.latest = Some(snapshot.clone());
        (channel.seq, snapshot, channel.listeners.clone())
    };

    debug!(query = %key.shape, seq, listeners = listeners.len(), "Publishing snapshot");
    for listener in listeners {
        listener.deliver(seq, snapshot.clone());
    }
}

/// Ends a channel with an error; each listener hears about it once.
fn fail(registry: &Mutex<Registry>, key: &ChannelKey, generation: u64, err: SyncError) {
    let listeners = {
        let mut reg = lock(registry);
        match reg.channels.get(key) {
            Some(channel) if channel.generation == generation => {}
            _ => return,
        }
        reg.channels
            .remove(key)
            .map(|c| c.listeners)
            .unwrap_or_default()
    };

    warn!(query = %key.shape, error = %err, listeners = listeners.len(), "Subscription failed");
    for listener in listeners {
        listener.fail(err.clone());
    }
}

/// Retires a one-time channel after its single snapshot.
fn complete(registry: &Mutex<Registry>, key: &ChannelKey, generation: u64) {
    let listeners = {
        let mut reg = lock(registry);
        match reg.channels.get(key) {
            Some(channel) if channel.generation == generation => {}
            _ => return,
        }
        reg.channels
            .remove(key)
            .map(|c| c.listeners)
            .unwrap_or_default()
    };
    for listener in listeners {
        if listener.active.swap(false, Ordering::SeqCst) {
            listener.set_state(SubscriptionState::Unsubscribed);
        }
    }
}

/// Removes one listener; aborts the upstream when it was the last one.
fn release(registry: &Mutex<Registry>, key: &ChannelKey, generation: u64, listener_id: u64) {
    let task = {
        let mut reg = lock(registry);
        let Some(channel) = reg.channels.get_mut(key) else {
            return;
        };
        if channel.generation != generation {
            return;
        }
        channel.listeners.retain(|l| l.id != listener_id);
        if !channel.listeners.is_empty() {
            return;
        }
        reg.channels.remove(key).and_then(|c| c.task)
    };

    debug!(query = %key.shape, "Last listener left, stopping upstream");
    if let Some(task) = task {
        task.abort();
    }
}

async fn run_live(
    store: Arc<dyn LiveStore>,
    shape: QueryShape,
    registry: SharedRegistry,
    key: ChannelKey,
    generation: u64,
) {
    let mut feed = match store.listen(&shape).await {
        Ok(feed) => feed,
        Err(e) => return fail(&registry, &key, generation, e),
    };

    while let Some(item) = feed.recv().await {
        match item {
            Ok(docs) => publish(&registry, &key, generation, docs),
            Err(e) => return fail(&registry, &key, generation, e),
        }
    }
    fail(&registry, &key, generation, SyncError::Disconnected);
}

async fn run_once(
    store: Arc<dyn LiveStore>,
    shape: QueryShape,
    registry: SharedRegistry,
    key: ChannelKey,
    generation: u64,
) {
    match store.get_once(&shape).await {
        Ok(docs) => {
            publish(&registry, &key, generation, docs);
            complete(&registry, &key, generation);
        }
        Err(e) => fail(&registry, &key, generation, e),
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Registration of one consumer. Dropping it cancels the subscription.
pub struct SubscriptionHandle {
    registry: SharedRegistry,
    key: ChannelKey,
    generation: u64,
    listener: Arc<Listener>,
}

impl SubscriptionHandle {
    /// Stops delivery. Idempotent; never fails.
    ///
    /// Once this returns no new callback starts for this handle. A callback
    /// already running on another thread may still finish.
    pub fn cancel(&self) {
        let was_active = self.listener.active.swap(false, Ordering::SeqCst);
        if was_active {
            self.listener.set_state(SubscriptionState::Unsubscribed);
        }
        release(&self.registry, &self.key, self.generation, self.listener.id);
    }

    pub fn state(&self) -> SubscriptionState {
        self.listener.state()
    }

    pub fn is_active(&self) -> bool {
        self.listener.active.load(Ordering::SeqCst)
    }

    /// Canonical key of the subscribed query.
    pub fn query_key(&self) -> &str {
        &self.key.shape
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("query", &self.key.shape)
            .field("mode", &self.key.mode)
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Subscription Manager
// =============================================================================

/// Deduplicating front for a [`LiveStore`].
pub struct SubscriptionManager {
    store: Arc<dyn LiveStore>,
    registry: SharedRegistry,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn LiveStore>) -> Self {
        SubscriptionManager {
            store,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Registers a listener for `shape`.
    ///
    /// Joins the existing upstream for the same shape and mode if there is
    /// one (replaying its latest snapshot), otherwise starts one.
    pub fn subscribe(
        &self,
        shape: QueryShape,
        mode: SubscriptionMode,
        on_snapshot: impl Fn(Snapshot) + Send + Sync + 'static,
        on_error: impl Fn(SyncError) + Send + Sync + 'static,
    ) -> SyncResult<SubscriptionHandle> {
        shape.validate()?;
        let key = ChannelKey {
            shape: shape.key(),
            mode,
        };

        let (handle, replay) = {
            let mut reg = lock(&self.registry);
            reg.next_id += 1;
            let id = reg.next_id;

            let listener = Arc::new(Listener {
                id,
                active: AtomicBool::new(true),
                failed: AtomicBool::new(false),
                last_seq: AtomicU64::new(0),
                state: Mutex::new(SubscriptionState::Subscribing),
                on_snapshot: Box::new(on_snapshot),
                on_error: Box::new(on_error),
            });

            let (generation, replay) = match reg.channels.get_mut(&key) {
                Some(channel) => {
                    channel.listeners.push(listener.clone());
                    debug!(query = %key.shape, listeners = channel.listeners.len(), "Joined subscription");
                    let replay = channel.latest.clone().map(|s| (channel.seq, s));
                    (channel.generation, replay)
                }
                None => {
                    let generation = id;
                    let registry = self.registry.clone();
                    let store = self.store.clone();
                    let task_key = key.clone();
                    let task = match mode {
                        SubscriptionMode::Live => tokio::spawn(run_live(
                            store, shape, registry, task_key, generation,
                        )),
                        SubscriptionMode::OneTime => tokio::spawn(run_once(
                            store, shape, registry, task_key, generation,
                        )),
                    };
                    info!(query = %key.shape, ?mode, "Starting upstream subscription");
                    reg.channels.insert(
                        key.clone(),
                        Channel {
                            generation,
                            state: SubscriptionState::Subscribing,
                            seq: 0,
                            latest: None,
                            listeners: vec![listener.clone()],
                            task: Some(task),
                        },
                    );
                    (generation, None)
                }
            };

            let handle = SubscriptionHandle {
                registry: self.registry.clone(),
                key,
                generation,
                listener,
            };
            (handle, replay)
        };

        if let Some((seq, snapshot)) = replay {
            handle.listener.deliver(seq, snapshot);
        }
        Ok(handle)
    }

    /// Scoped form of [`subscribe`](Self::subscribe): a stream of snapshots
    /// that unsubscribes when dropped. A failure arrives as one `Err` item,
    /// after which the stream ends.
    pub fn acquire(&self, shape: QueryShape, mode: SubscriptionMode) -> SyncResult<SnapshotStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let err_tx = tx.clone();
        let handle = self.subscribe(
            shape,
            mode,
            move |snapshot| {
                let _ = tx.send(Ok(snapshot));
            },
            move |err| {
                let _ = err_tx.send(Err(err));
            },
        )?;

        Ok(SnapshotStream {
            inner: UnboundedReceiverStream::new(rx),
            handle,
        })
    }

    /// Number of upstream subscriptions currently open.
    pub fn upstream_count(&self) -> usize {
        lock(&self.registry).channels.len()
    }

    /// Number of listeners sharing the upstream for `shape`.
    pub fn listener_count(&self, shape: &QueryShape, mode: SubscriptionMode) -> usize {
        let key = ChannelKey {
            shape: shape.key(),
            mode,
        };
        lock(&self.registry)
            .channels
            .get(&key)
            .map(|c| c.listeners.len())
            .unwrap_or(0)
    }

    /// Upstream state for `shape`; `Unsubscribed` when none is open.
    pub fn channel_state(&self, shape: &QueryShape, mode: SubscriptionMode) -> SubscriptionState {
        let key = ChannelKey {
            shape: shape.key(),
            mode,
        };
        lock(&self.registry)
            .channels
            .get(&key)
            .map(|c| c.state)
            .unwrap_or(SubscriptionState::Unsubscribed)
    }
}

// =============================================================================
// Snapshot Stream
// =============================================================================

/// Stream of snapshots tied to a subscription; dropping it unsubscribes.
pub struct SnapshotStream {
    inner: UnboundedReceiverStream<SyncResult<Snapshot>>,
    handle: SubscriptionHandle,
}

impl SnapshotStream {
    pub fn state(&self) -> SubscriptionState {
        self.handle.state()
    }

    /// Cancels early; the stream then ends once buffered items are drained.
    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl Stream for SnapshotStream {
    type Item = SyncResult<Snapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            // Drained and nothing more will be sent.
            Poll::Pending if !self.handle.is_active() => Poll::Ready(None),
            other => other,
        }
    }
}

// =============================================================================
// Subscription Slot
// =============================================================================

/// Holds at most one subscription for a query that changes over time.
///
/// [`update`](Self::update) re-subscribes when the shape or the refresh
/// token differs from the current one. The previous handle is cancelled
/// before the new subscription is made, so the consumer never receives
/// snapshots from both.
pub struct SubscriptionSlot {
    manager: Arc<SubscriptionManager>,
    mode: SubscriptionMode,
    on_snapshot: Arc<dyn Fn(Snapshot) + Send + Sync>,
    on_error: Arc<dyn Fn(SyncError) + Send + Sync>,
    current: Option<(QueryShape, u64, SubscriptionHandle)>,
}

impl SubscriptionSlot {
    pub fn new(
        manager: Arc<SubscriptionManager>,
        mode: SubscriptionMode,
        on_snapshot: impl Fn(Snapshot) + Send + Sync + 'static,
        on_error: impl Fn(SyncError) + Send + Sync + 'static,
    ) -> Self {
        SubscriptionSlot {
            manager,
            mode,
            on_snapshot: Arc::new(on_snapshot),
            on_error: Arc::new(on_error),
            current: None,
        }
    }

    /// Points the slot at `shape`. Returns true if a new subscription was made.
    pub fn update(&mut self, shape: QueryShape, refresh_token: u64) -> SyncResult<bool> {
        if let Some((current, token, handle)) = &self.current {
            if *current == shape && *token == refresh_token && handle.is_active() {
                return Ok(false);
            }
        }

        if let Some((_, _, old)) = self.current.take() {
            old.cancel();
        }

        let on_snapshot = self.on_snapshot.clone();
        let on_error = self.on_error.clone();
        let handle = self.manager.subscribe(
            shape.clone(),
            self.mode,
            move |snapshot| on_snapshot(snapshot),
            move |err| on_error(err),
        )?;
        self.current = Some((shape, refresh_token, handle));
        Ok(true)
    }

    /// Cancels the current subscription, if any.
    pub fn clear(&mut self) {
        if let Some((_, _, handle)) = self.current.take() {
            handle.cancel();
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.current
            .as_ref()
            .map(|(_, _, h)| h.state())
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    pub fn shape(&self) -> Option<&QueryShape> {
        self.current.as_ref().map(|(s, _, _)| s)
    }
}
