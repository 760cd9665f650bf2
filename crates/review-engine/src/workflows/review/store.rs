use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::domain::{
    Application, ApplicationId, FormDefinition, ReviewerRoster, StageId, WorkspaceData,
    WorkspaceSnapshot,
};

/// Where the current in-memory state came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    #[default]
    Empty,
    Cache,
    Fetch,
}

/// Authoritative in-memory copy of one workspace.
///
/// Stage counts are maintained incrementally by every mutation that adds, removes, or moves
/// an application; [`ReviewStore::recount`] rebuilds them from scratch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewStore {
    form: FormDefinition,
    workspace: WorkspaceData,
    applications: Vec<Application>,
    stage_counts: BTreeMap<StageId, usize>,
    source: DataSource,
}

impl ReviewStore {
    pub fn from_snapshot(snapshot: WorkspaceSnapshot, source: DataSource) -> Self {
        let mut store = Self {
            form: snapshot.form,
            workspace: snapshot.workspace,
            applications: snapshot.applications,
            stage_counts: BTreeMap::new(),
            source,
        };
        store.recount();
        store
    }

    pub fn snapshot(&self) -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            form: self.form.clone(),
            applications: self.applications.clone(),
            workspace: self.workspace.clone(),
        }
    }

    pub fn source(&self) -> DataSource {
        self.source
    }

    pub fn form(&self) -> &FormDefinition {
        &self.form
    }

    pub fn workspace(&self) -> &WorkspaceData {
        &self.workspace
    }

    pub fn replace_workspace(&mut self, workspace: WorkspaceData) {
        self.workspace = workspace;
    }

    pub fn roster(&self) -> &ReviewerRoster {
        &self.form.roster
    }

    pub fn roster_mut(&mut self) -> &mut ReviewerRoster {
        &mut self.form.roster
    }

    pub fn applications(&self) -> &[Application] {
        &self.applications
    }

    pub fn application(&self, id: &ApplicationId) -> Option<&Application> {
        self.applications.iter().find(|application| &application.id == id)
    }

    pub fn application_mut(&mut self, id: &ApplicationId) -> Option<&mut Application> {
        self.applications
            .iter_mut()
            .find(|application| &application.id == id)
    }

    /// Applications and roster together, for operations that touch both.
    pub fn split_mut(&mut self) -> (&mut [Application], &mut ReviewerRoster) {
        (&mut self.applications, &mut self.form.roster)
    }

    pub fn contains(&self, id: &ApplicationId) -> bool {
        self.application(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.applications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }

    pub fn stage_count(&self, stage: &StageId) -> usize {
        self.stage_counts.get(stage).copied().unwrap_or(0)
    }

    pub fn stage_counts(&self) -> &BTreeMap<StageId, usize> {
        &self.stage_counts
    }

    pub fn recount(&mut self) {
        self.stage_counts.clear();
        for stage in self
            .applications
            .iter()
            .filter_map(|application| application.stage_id.clone())
        {
            *self.stage_counts.entry(stage).or_insert(0) += 1;
        }
    }

    /// Appends an application unless one with the same id is present.
    pub fn insert(&mut self, application: Application) -> bool {
        if self.contains(&application.id) {
            return false;
        }
        if let Some(stage) = &application.stage_id {
            self.increment(stage.clone());
        }
        self.applications.push(application);
        true
    }

    /// Replaces the application with the same id, returning the previous record.
    pub fn replace(&mut self, application: Application) -> Option<Application> {
        let index = self
            .applications
            .iter()
            .position(|existing| existing.id == application.id)?;

        let old_stage = self.applications[index].stage_id.clone();
        let new_stage = application.stage_id.clone();
        if old_stage != new_stage {
            if let Some(stage) = old_stage {
                self.decrement(&stage);
            }
            if let Some(stage) = new_stage {
                self.increment(stage);
            }
        }

        Some(std::mem::replace(&mut self.applications[index], application))
    }

    pub fn remove(&mut self, id: &ApplicationId) -> Option<Application> {
        let index = self
            .applications
            .iter()
            .position(|application| &application.id == id)?;
        let removed = self.applications.remove(index);
        if let Some(stage) = &removed.stage_id {
            self.decrement(stage);
        }
        Some(removed)
    }

    /// Moves an application to `stage`, keeping counts in step. Returns the previous stage.
    pub(crate) fn set_stage(
        &mut self,
        id: &ApplicationId,
        stage: Option<StageId>,
    ) -> Option<Option<StageId>> {
        let application = self.application_mut(id)?;
        let previous = std::mem::replace(&mut application.stage_id, stage.clone());
        if previous != stage {
            if let Some(old) = &previous {
                self.decrement(old);
            }
            if let Some(new) = stage {
                self.increment(new);
            }
        }
        Some(previous)
    }

    fn increment(&mut self, stage: StageId) {
        *self.stage_counts.entry(stage).or_insert(0) += 1;
    }

    fn decrement(&mut self, stage: &StageId) {
        if let Some(count) = self.stage_counts.get_mut(stage) {
            *count = count.saturating_sub(1);
        }
    }

    /// Filtered queue for the given view, in store order.
    pub fn queue<'a>(&'a self, view: &WorkspaceView) -> Vec<&'a Application> {
        let needle = view.search.trim().to_lowercase();
        self.applications
            .iter()
            .filter(|application| match &view.stage_filter {
                Some(stage) => application.stage_id.as_ref() == Some(stage),
                None => true,
            })
            .filter(|application| needle.is_empty() || matches_search(application, &needle))
            .collect()
    }
}

fn matches_search(application: &Application, needle: &str) -> bool {
    if application.id.0.to_lowercase().contains(needle)
        || application.name.to_lowercase().contains(needle)
        || application.status.to_lowercase().contains(needle)
    {
        return true;
    }

    application.raw_data.values().any(|value| match value {
        Value::String(text) => text.to_lowercase().contains(needle),
        _ => false,
    })
}

/// Caller-owned view state: current stage tab, search text, and selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceView {
    #[serde(default, rename = "stage")]
    pub stage_filter: Option<StageId>,
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub selected: Option<ApplicationId>,
}

impl WorkspaceView {
    pub fn for_stage(stage: StageId) -> Self {
        Self {
            stage_filter: Some(stage),
            ..Self::default()
        }
    }

    /// Drops the selection when it is no longer part of the queue.
    pub fn retain_selection(&mut self, store: &ReviewStore) {
        let still_listed = self.selected.as_ref().is_some_and(|selected| {
            store
                .queue(self)
                .iter()
                .any(|application| &application.id == selected)
        });
        if !still_listed {
            self.selected = None;
        }
    }
}
