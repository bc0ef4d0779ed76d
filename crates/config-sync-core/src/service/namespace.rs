//! Per-namespace synchronisation worker.
//!
//! A `NamespaceSync` owns the authoritative snapshot of one namespace and
//! decides when to refresh it: once at construction, on a fixed schedule, on
//! notification wake-ups and on explicit [`NamespaceSync::refresh_now`] calls.
//! Refreshes are serialised by an async mutex; wake-ups arriving while one is
//! in flight collapse into a single follow-up refresh.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{FallbackPolicy, SyncConfig};
use super::telemetry::SyncTelemetry;
use super::view::SnapshotView;
use crate::fetcher::{FetchError, FetchOutcome, RemoteFetcher};
use crate::http::BackoffState;
use crate::locator::ServiceLocator;
use crate::notification::{NotificationMessages, RefreshTrigger};
use crate::snapshot::{ChangeSet, Snapshot, SourceType};
use crate::status::{NamespaceStatus, SyncHealth};
use crate::store::LocalCacheStore;

/// Collaborators shared by every namespace of one context.
pub(crate) struct SyncShared {
    pub(crate) config: SyncConfig,
    pub(crate) fetcher: RemoteFetcher,
    pub(crate) locator: Arc<ServiceLocator>,
    /// `None` when the cache directory could not be opened.
    pub(crate) store: Option<LocalCacheStore>,
    /// Bounds concurrent fetch/save work across namespaces.
    pub(crate) pool: Semaphore,
    pub(crate) telemetry: Arc<dyn SyncTelemetry>,
}

/// Result of one refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new release was committed; `changed_keys` may be zero.
    Updated { changed_keys: usize },
    /// The server confirmed the current release.
    Unchanged,
    /// The namespace does not exist server-side; the current snapshot is kept.
    NotFound,
    /// Every attempt failed; the current snapshot is kept.
    Failed,
}

/// Logs repeated failures once per window, counting the ones it swallowed.
#[derive(Debug)]
struct FailureLog {
    interval: Duration,
    window_start: Option<Instant>,
    suppressed: u64,
}

impl FailureLog {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: None,
            suppressed: 0,
        }
    }

    /// Returns `Some(suppressed)` when this failure should be logged loudly.
    fn record(&mut self, now: Instant) -> Option<u64> {
        match self.window_start {
            Some(start) if now.saturating_duration_since(start) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.window_start = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }

    fn reset(&mut self) {
        self.window_start = None;
        self.suppressed = 0;
    }
}

/// State only touched while holding the refresh lock.
#[derive(Debug)]
struct RefreshState {
    backoff: BackoffState,
    failure_log: FailureLog,
    /// Last time the server confirmed the current snapshot.
    last_confirmed: Instant,
}

pub struct NamespaceSync {
    namespace: String,
    view: Arc<SnapshotView>,
    shared: Arc<SyncShared>,
    health: SyncHealth,
    refresh: AsyncMutex<RefreshState>,
    pending_messages: Mutex<Option<NotificationMessages>>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
    /// Flips to true once the first refresh finished, whatever its outcome.
    initialized: watch::Sender<bool>,
}

impl fmt::Debug for NamespaceSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceSync")
            .field("namespace", &self.namespace)
            .field("view", &self.view)
            .finish()
    }
}

impl NamespaceSync {
    /// Builds the namespace, seeding its snapshot from the on-disk cache.
    ///
    /// No network call happens here; the first remote fetch runs once the
    /// worker is spawned.
    pub(crate) fn new(namespace: &str, shared: Arc<SyncShared>) -> Arc<Self> {
        let initial = match shared.store.as_ref().and_then(|store| store.load(namespace)) {
            Some(cached) => {
                info!(
                    namespace,
                    release_key = cached.release_key.as_deref().unwrap_or_default(),
                    "config-sync serving cached configuration until the first fetch"
                );
                shared.telemetry.on_local_fallback(namespace);
                cached
            }
            None => Snapshot::empty(namespace),
        };

        let (wake_tx, wake_rx) = mpsc::channel(1);
        Arc::new(Self {
            namespace: namespace.to_string(),
            view: Arc::new(SnapshotView::new(initial, shared.telemetry.clone())),
            health: SyncHealth::default(),
            refresh: AsyncMutex::new(RefreshState {
                backoff: BackoffState::new(shared.config.fetch_backoff),
                failure_log: FailureLog::new(shared.config.failure_log_interval),
                last_confirmed: Instant::now(),
            }),
            pending_messages: Mutex::new(None),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            initialized: watch::Sender::new(false),
            shared,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn view(&self) -> &Arc<SnapshotView> {
        &self.view
    }

    pub fn health(&self) -> &SyncHealth {
        &self.health
    }

    pub fn status(&self, notification_id: Option<i64>) -> NamespaceStatus {
        let snapshot = self.view.snapshot();
        NamespaceStatus {
            namespace: self.namespace.clone(),
            release_key: snapshot.release_key.clone(),
            source: snapshot.source,
            entries: snapshot.len(),
            listeners: self.view.listener_count(),
            notification_id,
            consecutive_failures: self.health.consecutive_failures(),
            last_error: self.health.last_error(),
            last_success_age: self.health.last_success_age(),
        }
    }

    /// Requests a background refresh; collapses with any wake-up already queued.
    pub fn request_refresh(&self) {
        // A full channel already guarantees one refresh after the current one.
        let _ = self.wake_tx.try_send(());
    }

    /// Runs one refresh now, serialised with the background worker.
    pub async fn refresh_now(&self) -> RefreshOutcome {
        self.refresh_once().await
    }

    /// Waits until the first refresh after construction has finished.
    pub async fn wait_initialized(&self) {
        let mut rx = self.initialized.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    /// Spawns the worker on `runtime`: an initial refresh, then scheduled and
    /// requested ones.
    pub(crate) fn spawn(self: &Arc<Self>, runtime: &Handle, cancel: CancellationToken) -> JoinHandle<()> {
        let sync = self.clone();
        runtime.spawn(async move { sync.run(cancel).await })
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let wake_rx = self
            .wake_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut wake_rx) = wake_rx else {
            warn!(namespace = %self.namespace, "config-sync worker already running");
            return;
        };

        let period = self.shared.config.refresh_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if !cancel.is_cancelled() {
            self.refresh_once().await;
        }
        self.initialized.send_replace(true);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(namespace = %self.namespace, "config-sync namespace worker shutting down");
                    break;
                }
                wake = wake_rx.recv() => {
                    if wake.is_none() {
                        break;
                    }
                    debug!(namespace = %self.namespace, "config-sync refresh requested");
                }
                _ = ticker.tick() => {
                    debug!(namespace = %self.namespace, "config-sync scheduled refresh");
                }
            }
            self.refresh_once().await;
        }
    }

    fn take_pending_messages(&self) -> Option<NotificationMessages> {
        self.pending_messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn requeue_messages(&self, messages: Option<NotificationMessages>) {
        let Some(messages) = messages else {
            return;
        };
        let mut pending = self
            .pending_messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending
            .get_or_insert_with(NotificationMessages::default)
            .merge(&messages);
    }

    async fn refresh_once(&self) -> RefreshOutcome {
        let mut state = self.refresh.lock().await;
        let messages = self.take_pending_messages();
        let previous = self.view.snapshot();

        // The permit covers the network call and the cache write only;
        // listeners run after it is released.
        let permit = self.shared.pool.acquire().await.ok();
        let result = self
            .shared
            .fetcher
            .fetch_with_rotation(
                &self.shared.locator,
                &self.namespace,
                previous.release_key.as_deref(),
                messages.as_ref(),
                &mut state.backoff,
            )
            .await;

        match result {
            Ok(FetchOutcome::Updated(snapshot)) => {
                self.on_server_answer(&mut state);
                let pending = self.apply(snapshot).await;
                drop(permit);
                let changed_keys = match pending {
                    Some(changes) => {
                        let changed = changes.len();
                        self.view.dispatch(&changes);
                        changed
                    }
                    None => {
                        self.shared.telemetry.on_refresh_success(&self.namespace, 0);
                        return RefreshOutcome::Unchanged;
                    }
                };
                self.shared
                    .telemetry
                    .on_refresh_success(&self.namespace, changed_keys);
                RefreshOutcome::Updated { changed_keys }
            }
            Ok(FetchOutcome::NotModified) => {
                drop(permit);
                self.on_server_answer(&mut state);
                if previous.source != SourceType::Remote && previous.release_key.is_some() {
                    debug!(
                        namespace = %self.namespace,
                        "config-sync cached configuration confirmed by server"
                    );
                    self.view.replace(previous.with_source(SourceType::Remote));
                }
                self.shared.telemetry.on_refresh_success(&self.namespace, 0);
                RefreshOutcome::Unchanged
            }
            Ok(FetchOutcome::NotFound) => {
                drop(permit);
                self.health.record_success();
                state.failure_log.reset();
                debug!(
                    namespace = %self.namespace,
                    source = %previous.source,
                    "config-sync namespace not found on server; keeping current snapshot"
                );
                self.shared.telemetry.on_namespace_not_found(&self.namespace);
                RefreshOutcome::NotFound
            }
            Err(err) => {
                drop(permit);
                self.requeue_messages(messages);
                self.on_failure(&mut state, &err);
                self.expire_fallback(&state);
                RefreshOutcome::Failed
            }
        }
    }

    fn on_server_answer(&self, state: &mut RefreshState) {
        state.last_confirmed = Instant::now();
        state.failure_log.reset();
        let ended = self.health.record_success();
        if ended > 0 {
            info!(
                namespace = %self.namespace,
                failures = ended,
                "config-sync refresh recovered"
            );
        }
    }

    fn on_failure(&self, state: &mut RefreshState, err: &FetchError) {
        let failures = self.health.record_failure(err.to_string());
        self.shared.telemetry.on_refresh_error(&self.namespace, err);
        match state.failure_log.record(Instant::now()) {
            Some(suppressed) => warn!(
                namespace = %self.namespace,
                %err,
                kind = err.kind(),
                failures,
                suppressed,
                source = %self.view.source_type(),
                "config-sync refresh failed; serving last known configuration"
            ),
            None => debug!(
                namespace = %self.namespace,
                %err,
                failures,
                "config-sync refresh failed"
            ),
        }
    }

    /// Commits a fetched snapshot. Returns the change set to deliver, or
    /// `None` when the release was already current.
    async fn apply(&self, snapshot: Snapshot) -> Option<ChangeSet> {
        let previous = self.view.snapshot();
        let same_release = previous.release_key == snapshot.release_key;
        if same_release && previous.source == SourceType::Remote {
            return None;
        }

        let changes = ChangeSet::diff(&previous, &snapshot);
        if same_release && changes.is_empty() {
            // Cached release confirmed by the server.
            self.view.replace(snapshot);
            return None;
        }
        self.view.replace(snapshot.clone());
        debug!(
            namespace = %self.namespace,
            release_key = snapshot.release_key.as_deref().unwrap_or_default(),
            changed = changes.len(),
            "config-sync committed new release"
        );
        self.persist(snapshot).await;
        Some(changes)
    }

    async fn persist(&self, snapshot: Snapshot) {
        let Some(store) = self.shared.store.clone() else {
            return;
        };
        let namespace = self.namespace.clone();
        let result =
            tokio::task::spawn_blocking(move || store.save(&namespace, &snapshot)).await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                warn!(namespace = %self.namespace, %err, "config-sync failed to write local cache")
            }
            Err(err) => {
                warn!(namespace = %self.namespace, %err, "config-sync local cache task failed")
            }
        }
    }

    /// Applies [`FallbackPolicy::ExpireAfter`] once the server has been
    /// silent for too long.
    fn expire_fallback(&self, state: &RefreshState) {
        let FallbackPolicy::ExpireAfter(ttl) = self.shared.config.fallback_policy else {
            return;
        };
        let previous = self.view.snapshot();
        if previous.source == SourceType::None || state.last_confirmed.elapsed() < ttl {
            return;
        }

        let empty = Snapshot::empty(self.namespace.as_str());
        let changes = ChangeSet::diff(&previous, &empty);
        self.view.replace(empty);
        warn!(
            namespace = %self.namespace,
            unconfirmed_for_secs = state.last_confirmed.elapsed().as_secs(),
            "config-sync fallback configuration expired; serving empty configuration"
        );
        self.shared.telemetry.on_fallback_expired(&self.namespace);
        self.view.dispatch(&changes);
    }
}

impl RefreshTrigger for NamespaceSync {
    fn trigger(&self, messages: Option<NotificationMessages>) {
        self.requeue_messages(messages);
        self.request_refresh();
    }
}
