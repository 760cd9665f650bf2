//! Cache-then-fetch loading and live event merging for the authoritative store.

mod cache;
mod reconcile;

pub use cache::{
    CacheError, CacheKey, CachedSnapshot, FileSnapshotCache, MemorySnapshotCache, SnapshotCache,
    CACHE_VERSION,
};
pub use reconcile::{
    apply_event, reconcile, EventOutcome, IgnoreReason, LiveEvent, ReconciledState,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use super::domain::WorkspaceSnapshot;
use super::repository::{GatewayError, ReviewBackend};
use super::store::{DataSource, ReviewStore};

/// What a call to [`SyncReconciler::load`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    /// Canonical data fetched and applied.
    Fetched,
    /// A previous load already completed; nothing was requested.
    AlreadyLoaded,
    /// Another load is in flight; this call was a no-op.
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub status: LoadStatus,
    pub cache_hit: bool,
    pub applications: usize,
    pub replayed_events: usize,
}

/// Outcome of handing a live event to the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub outcome: EventOutcome,
    /// Event also queued for replay on top of the in-flight fetch.
    pub buffered: bool,
}

/// Owns the authoritative store and keeps it consistent across cache, fetch, and live events.
///
/// While a fetch is in flight, live events are applied immediately and also buffered; the
/// buffer is replayed on top of the fetched snapshot so a slower fetch cannot erase them.
pub struct SyncReconciler<B, C> {
    backend: Arc<B>,
    cache: Arc<C>,
    key: CacheKey,
    ttl: Duration,
    store: Arc<Mutex<ReviewStore>>,
    pending: Mutex<Vec<LiveEvent>>,
    fetch_in_progress: AtomicBool,
    initial_load_done: AtomicBool,
}

impl<B, C> SyncReconciler<B, C>
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
{
    pub fn new(backend: Arc<B>, cache: Arc<C>, key: CacheKey, ttl: Duration) -> Self {
        Self {
            backend,
            cache,
            key,
            ttl,
            store: Arc::new(Mutex::new(ReviewStore::default())),
            pending: Mutex::new(Vec::new()),
            fetch_in_progress: AtomicBool::new(false),
            initial_load_done: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn store(&self) -> &Arc<Mutex<ReviewStore>> {
        &self.store
    }

    pub fn is_loaded(&self) -> bool {
        self.initial_load_done.load(Ordering::Acquire)
    }

    pub fn fetch_in_progress(&self) -> bool {
        self.fetch_in_progress.load(Ordering::Acquire)
    }

    /// First load: cached snapshot immediately (if fresh), then the canonical fetch.
    ///
    /// Repeated calls after a successful load, or while one is running, do nothing.
    pub async fn load(&self) -> Result<LoadReport, GatewayError> {
        if self.is_loaded() {
            return Ok(self.skipped(LoadStatus::AlreadyLoaded).await);
        }
        self.run_fetch().await
    }

    /// Explicit re-fetch regardless of earlier loads.
    pub async fn refresh(&self) -> Result<LoadReport, GatewayError> {
        self.run_fetch().await
    }

    async fn skipped(&self, status: LoadStatus) -> LoadReport {
        LoadReport {
            status,
            cache_hit: false,
            applications: self.store.lock().await.len(),
            replayed_events: 0,
        }
    }

    async fn run_fetch(&self) -> Result<LoadReport, GatewayError> {
        if self
            .fetch_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(self.skipped(LoadStatus::InFlight).await);
        }

        let cache_hit = self.apply_cached().await;
        let fetched = self.backend.fetch_snapshot(&self.key).await;

        match fetched {
            Ok(snapshot) => Ok(self.apply_fetched(snapshot, cache_hit).await),
            Err(error) => {
                tracing::warn!(
                    form_id = %self.key.form_id,
                    workspace_id = %self.key.workspace_id,
                    %error,
                    "workspace fetch failed"
                );
                self.pending.lock().await.clear();
                self.fetch_in_progress.store(false, Ordering::Release);
                Err(error)
            }
        }
    }

    /// Seeds the store from the cache unless it already holds fetched data.
    async fn apply_cached(&self) -> bool {
        let entry = match self.cache.load(&self.key).await {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!(%error, "snapshot cache unreadable; ignoring");
                None
            }
        };
        let Some(entry) = entry else {
            tracing::debug!(form_id = %self.key.form_id, "snapshot cache miss");
            return false;
        };

        if !entry.is_fresh(self.ttl, Utc::now()) {
            tracing::debug!(
                form_id = %self.key.form_id,
                version = %entry.version,
                "discarding stale snapshot cache entry"
            );
            if let Err(error) = self.cache.evict(&self.key).await {
                tracing::warn!(%error, "snapshot cache eviction failed");
            }
            return false;
        }

        let mut store = self.store.lock().await;
        if store.source() == DataSource::Fetch {
            return false;
        }
        let pending = self.pending.lock().await.clone();
        *store = reconcile(Some(entry.snapshot), None, &pending).store;
        true
    }

    async fn apply_fetched(&self, snapshot: WorkspaceSnapshot, cache_hit: bool) -> LoadReport {
        let snapshot_to_persist;
        let report;
        {
            let mut store = self.store.lock().await;
            let pending = std::mem::take(&mut *self.pending.lock().await);
            let state = reconcile(None, Some(snapshot), &pending);
            *store = state.store;
            self.fetch_in_progress.store(false, Ordering::Release);
            snapshot_to_persist = store.snapshot();
            report = LoadReport {
                status: LoadStatus::Fetched,
                cache_hit,
                applications: store.len(),
                replayed_events: state.applied,
            };
        }

        self.initial_load_done.store(true, Ordering::Release);
        self.persist(snapshot_to_persist).await;
        tracing::info!(
            form_id = %self.key.form_id,
            workspace_id = %self.key.workspace_id,
            applications = report.applications,
            replayed = report.replayed_events,
            cache_hit,
            "workspace loaded"
        );
        report
    }

    /// Writes the current store back to the cache; failures are logged only.
    pub async fn persist_current(&self) {
        let snapshot = self.store.lock().await.snapshot();
        self.persist(snapshot).await;
    }

    async fn persist(&self, snapshot: WorkspaceSnapshot) {
        let entry = CachedSnapshot::new(snapshot, Utc::now());
        if let Err(error) = self.cache.store(&self.key, &entry).await {
            tracing::warn!(%error, "snapshot cache write failed");
        }
    }

    /// Applies a live event now; while a fetch is in flight it is also kept for replay.
    pub async fn ingest(&self, event: LiveEvent) -> IngestReport {
        let mut store = self.store.lock().await;
        let buffered = self.fetch_in_progress();
        if buffered {
            self.pending.lock().await.push(event.clone());
        }
        let outcome = apply_event(&mut store, event);
        IngestReport { outcome, buffered }
    }
}
