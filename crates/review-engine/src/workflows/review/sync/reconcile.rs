use serde::{Deserialize, Serialize};

use crate::workflows::review::domain::{Application, ApplicationId, WorkspaceSnapshot};
use crate::workflows::review::store::{DataSource, ReviewStore};

/// Incremental change pushed by the backend for one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    Insert {
        record: Application,
    },
    Update {
        record: Application,
    },
    Delete {
        id: ApplicationId,
        #[serde(default)]
        revision: Option<u64>,
    },
}

impl LiveEvent {
    pub fn application_id(&self) -> &ApplicationId {
        match self {
            LiveEvent::Insert { record } | LiveEvent::Update { record } => &record.id,
            LiveEvent::Delete { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    AlreadyPresent,
    UnknownApplication,
    /// The event carries an older revision than the record already held.
    Stale,
}

/// Merges one live event into the store, keeping stage counts in step.
pub fn apply_event(store: &mut ReviewStore, event: LiveEvent) -> EventOutcome {
    match event {
        LiveEvent::Insert { record } => {
            if store.insert(record) {
                EventOutcome::Applied
            } else {
                EventOutcome::Ignored(IgnoreReason::AlreadyPresent)
            }
        }
        LiveEvent::Update { record } => match store.application(&record.id) {
            None => EventOutcome::Ignored(IgnoreReason::UnknownApplication),
            Some(current) if record.revision < current.revision => {
                EventOutcome::Ignored(IgnoreReason::Stale)
            }
            Some(_) => {
                store.replace(record);
                EventOutcome::Applied
            }
        },
        LiveEvent::Delete { id, revision } => match store.application(&id) {
            None => EventOutcome::Ignored(IgnoreReason::UnknownApplication),
            Some(current) if revision.is_some_and(|revision| revision < current.revision) => {
                EventOutcome::Ignored(IgnoreReason::Stale)
            }
            Some(_) => {
                store.remove(&id);
                EventOutcome::Applied
            }
        },
    }
}

/// Final state plus bookkeeping from one reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledState {
    pub store: ReviewStore,
    pub applied: usize,
    pub ignored: usize,
}

/// Single merge point for cached data, a canonical fetch, and pending live events.
///
/// A completed fetch replaces the cached snapshot wholesale. Pending events are then replayed
/// in arrival order, each guarded by the application's revision stamp, so an event that the
/// fetch already reflects is a no-op and a newer one is not lost.
pub fn reconcile(
    cached: Option<WorkspaceSnapshot>,
    fetched: Option<WorkspaceSnapshot>,
    pending: &[LiveEvent],
) -> ReconciledState {
    let mut store = match (fetched, cached) {
        (Some(fetched), _) => ReviewStore::from_snapshot(fetched, DataSource::Fetch),
        (None, Some(cached)) => ReviewStore::from_snapshot(cached, DataSource::Cache),
        (None, None) => ReviewStore::default(),
    };

    let mut applied = 0;
    let mut ignored = 0;
    for event in pending {
        match apply_event(&mut store, event.clone()) {
            EventOutcome::Applied => applied += 1,
            EventOutcome::Ignored(reason) => {
                tracing::debug!(
                    application_id = %event.application_id().0,
                    ?reason,
                    "live event ignored during reconciliation"
                );
                ignored += 1;
            }
        }
    }

    ReconciledState {
        store,
        applied,
        ignored,
    }
}
