//! Ordered-stage state machine plus stage/workflow actions and automatic stage rules.

mod rules;

pub use rules::{Comparison, Condition, ConditionParseError, Metric};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::domain::{
    ActionEffect, ActionId, ActionRecord, ApplicationId, GroupId, ReviewerTypeId, Stage,
    StageAction, StageId, StageTransition, Workflow, WorkflowId, WorkspaceData,
};
use super::scoring::aggregate_score;
use super::store::ReviewStore;

pub const REJECTED_STATUS: &str = "rejected";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("application {0} does not exist")]
    ApplicationNotFound(String),
    #[error("application {0} is not in a workflow")]
    Unassigned(String),
    #[error("workflow {0} does not exist")]
    UnknownWorkflow(String),
    #[error("workflow {0} has no stages")]
    EmptyWorkflow(String),
    #[error("stage {stage} is not part of workflow {workflow}")]
    StageNotInWorkflow { stage: String, workflow: String },
    #[error("action {0} is not available for this application")]
    UnknownAction(String),
    #[error("action `{0}` requires a comment")]
    CommentRequired(String),
    #[error("group {0} does not exist")]
    UnknownGroup(String),
}

/// Stages of one workflow in `order_index` order.
#[derive(Debug, Clone)]
pub struct StagePipeline<'a> {
    workflow: &'a Workflow,
    stages: Vec<&'a Stage>,
}

impl<'a> StagePipeline<'a> {
    pub fn new(
        workspace: &'a WorkspaceData,
        workflow_id: &WorkflowId,
    ) -> Result<Self, PipelineError> {
        let workflow = workspace
            .workflow(workflow_id)
            .ok_or_else(|| PipelineError::UnknownWorkflow(workflow_id.0.clone()))?;
        let mut stages: Vec<&Stage> = workspace
            .stages
            .iter()
            .filter(|stage| &stage.workflow_id == workflow_id)
            .collect();
        stages.sort_by_key(|stage| stage.order_index);
        Ok(Self { workflow, stages })
    }

    pub fn workflow(&self) -> &'a Workflow {
        self.workflow
    }

    pub fn stages(&self) -> &[&'a Stage] {
        &self.stages
    }

    pub fn first(&self) -> Option<&'a Stage> {
        self.stages.first().copied()
    }

    pub fn get(&self, id: &StageId) -> Option<&'a Stage> {
        self.stages.iter().copied().find(|stage| &stage.id == id)
    }

    pub fn contains(&self, id: &StageId) -> bool {
        self.get(id).is_some()
    }

    /// The stage after `current`; the first stage when there is no current stage.
    pub fn next_after(&self, current: Option<&StageId>) -> Option<&'a Stage> {
        match current {
            None => self.first(),
            Some(current) => {
                let index = self.stages.iter().position(|stage| &stage.id == current)?;
                self.stages.get(index + 1).copied()
            }
        }
    }

    /// Case-insensitive name lookup; exact names win over partial matches.
    pub fn find_by_name(&self, name: &str) -> Option<&'a Stage> {
        let needle = name.trim().to_lowercase();
        self.stages
            .iter()
            .copied()
            .find(|stage| stage.name.to_lowercase() == needle)
            .or_else(|| {
                self.stages
                    .iter()
                    .copied()
                    .find(|stage| stage.name.to_lowercase().contains(&needle))
            })
    }
}

fn pipeline_for<'a>(
    store: &'a ReviewStore,
    application_id: &ApplicationId,
) -> Result<StagePipeline<'a>, PipelineError> {
    let application = store
        .application(application_id)
        .ok_or_else(|| PipelineError::ApplicationNotFound(application_id.0.clone()))?;
    let workflow_id = application
        .workflow_id
        .as_ref()
        .ok_or_else(|| PipelineError::Unassigned(application_id.0.clone()))?;
    StagePipeline::new(store.workspace(), workflow_id)
}

/// Validates a jump to `target` and returns the application's current stage.
pub fn plan_move(
    store: &ReviewStore,
    application_id: &ApplicationId,
    target: &StageId,
) -> Result<Option<StageId>, PipelineError> {
    let pipeline = pipeline_for(store, application_id)?;
    if !pipeline.contains(target) {
        return Err(PipelineError::StageNotInWorkflow {
            stage: target.0.clone(),
            workflow: pipeline.workflow().id.0.clone(),
        });
    }
    Ok(store
        .application(application_id)
        .and_then(|application| application.stage_id.clone()))
}

/// Unconditional jump to any stage of the application's workflow.
pub fn move_to_stage(
    store: &mut ReviewStore,
    application_id: &ApplicationId,
    target: &StageId,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<StageTransition, PipelineError> {
    let from = plan_move(store, application_id, target)?;
    store.set_stage(application_id, Some(target.clone()));
    let transition = StageTransition {
        from,
        to: target.clone(),
        reason: reason.to_string(),
        at,
    };
    record_transition(store, application_id, transition.clone());
    Ok(transition)
}

fn record_transition(
    store: &mut ReviewStore,
    application_id: &ApplicationId,
    transition: StageTransition,
) {
    if let Some(application) = store.application_mut(application_id) {
        application.stage_history.push(transition);
    }
}

/// Resolves the entry stage for a workflow assignment: the given stage or the first one.
pub fn plan_workflow_assignment(
    store: &ReviewStore,
    application_ids: &[ApplicationId],
    workflow_id: &WorkflowId,
    stage: Option<&StageId>,
) -> Result<StageId, PipelineError> {
    if let Some(missing) = application_ids.iter().find(|id| !store.contains(id)) {
        return Err(PipelineError::ApplicationNotFound(missing.0.clone()));
    }
    let pipeline = StagePipeline::new(store.workspace(), workflow_id)?;
    match stage {
        Some(stage) if pipeline.contains(stage) => Ok(stage.clone()),
        Some(stage) => Err(PipelineError::StageNotInWorkflow {
            stage: stage.0.clone(),
            workflow: workflow_id.0.clone(),
        }),
        None => pipeline
            .first()
            .map(|stage| stage.id.clone())
            .ok_or_else(|| PipelineError::EmptyWorkflow(workflow_id.0.clone())),
    }
}

/// Places applications into a workflow at its entry stage.
pub fn assign_workflow(
    store: &mut ReviewStore,
    application_ids: &[ApplicationId],
    workflow_id: &WorkflowId,
    stage: Option<&StageId>,
    at: DateTime<Utc>,
) -> Result<StageId, PipelineError> {
    let entry = plan_workflow_assignment(store, application_ids, workflow_id, stage)?;
    for application_id in application_ids {
        if let Some(application) = store.application_mut(application_id) {
            application.workflow_id = Some(workflow_id.clone());
            application.group_id = None;
        }
        let from = store
            .set_stage(application_id, Some(entry.clone()))
            .flatten();
        record_transition(
            store,
            application_id,
            StageTransition {
                from,
                to: entry.clone(),
                reason: format!("assigned to workflow {}", workflow_id.0),
                at,
            },
        );
    }
    Ok(entry)
}

/// What executing an action did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Moved { from: Option<StageId>, to: StageId },
    /// Advance requested at the last stage; nothing changed.
    AtLastStage { stage: Option<StageId> },
    StatusSet { status: String },
    MovedToGroup { group_id: GroupId, status: String },
}

/// Validated action ready to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPlan {
    pub action: StageAction,
    pub outcome: ActionOutcome,
}

/// Current-stage actions first, then the workflow's own actions.
pub fn find_action<'a>(
    store: &'a ReviewStore,
    application_id: &ApplicationId,
    action_id: &ActionId,
) -> Result<&'a StageAction, PipelineError> {
    let application = store
        .application(application_id)
        .ok_or_else(|| PipelineError::ApplicationNotFound(application_id.0.clone()))?;
    let workspace = store.workspace();

    let stage_actions = application
        .stage_id
        .as_ref()
        .and_then(|stage| workspace.stage(stage))
        .into_iter()
        .flat_map(|stage| stage.actions.iter());
    let workflow_actions = application
        .workflow_id
        .iter()
        .flat_map(|workflow| workspace.workflow_actions(workflow));

    stage_actions
        .chain(workflow_actions)
        .find(|action| &action.id == action_id)
        .ok_or_else(|| PipelineError::UnknownAction(action_id.0.clone()))
}

pub fn plan_action(
    store: &ReviewStore,
    application_id: &ApplicationId,
    action_id: &ActionId,
    comment: Option<&str>,
) -> Result<ActionPlan, PipelineError> {
    let action = find_action(store, application_id, action_id)?;
    let has_comment = comment.is_some_and(|comment| !comment.trim().is_empty());
    if action.requires_comment && !has_comment {
        return Err(PipelineError::CommentRequired(action.name.clone()));
    }

    let current = store
        .application(application_id)
        .and_then(|application| application.stage_id.clone());
    let outcome = match &action.effect {
        ActionEffect::AdvanceStage => {
            let pipeline = pipeline_for(store, application_id)?;
            match pipeline.next_after(current.as_ref()) {
                Some(next) => ActionOutcome::Moved {
                    from: current,
                    to: next.id.clone(),
                },
                None => ActionOutcome::AtLastStage { stage: current },
            }
        }
        ActionEffect::SetStatus { status_value } => ActionOutcome::StatusSet {
            status: status_value
                .clone()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| action.name.to_lowercase()),
        },
        ActionEffect::MoveToGroup { group_id } => {
            let group = store
                .workspace()
                .group(group_id)
                .ok_or_else(|| PipelineError::UnknownGroup(group_id.0.clone()))?;
            ActionOutcome::MovedToGroup {
                group_id: group.id.clone(),
                status: group.name.to_lowercase(),
            }
        }
    };

    Ok(ActionPlan {
        action: action.clone(),
        outcome,
    })
}

/// Runs a named stage or workflow action against an application.
pub fn execute_action(
    store: &mut ReviewStore,
    application_id: &ApplicationId,
    action_id: &ActionId,
    comment: Option<&str>,
    at: DateTime<Utc>,
) -> Result<ActionOutcome, PipelineError> {
    let plan = plan_action(store, application_id, action_id, comment)?;

    match &plan.outcome {
        ActionOutcome::Moved { from, to } => {
            store.set_stage(application_id, Some(to.clone()));
            record_transition(
                store,
                application_id,
                StageTransition {
                    from: from.clone(),
                    to: to.clone(),
                    reason: plan.action.name.clone(),
                    at,
                },
            );
        }
        ActionOutcome::AtLastStage { .. } => {}
        ActionOutcome::StatusSet { status } => {
            if let Some(application) = store.application_mut(application_id) {
                application.status = status.clone();
            }
        }
        ActionOutcome::MovedToGroup { group_id, status } => {
            if let Some(application) = store.application_mut(application_id) {
                application.status = status.clone();
                application.group_id = Some(group_id.clone());
            }
        }
    }

    if let Some(application) = store.application_mut(application_id) {
        application.action_history.push(ActionRecord {
            action_id: plan.action.id.clone(),
            action_name: plan.action.name.clone(),
            comment: comment.map(str::trim).unwrap_or_default().to_string(),
            at,
        });
    }

    Ok(plan.outcome)
}

/// Sets a status without moving, leaving a same-stage entry in the stage history.
pub fn set_status(
    store: &mut ReviewStore,
    application_id: &ApplicationId,
    status: &str,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<(), PipelineError> {
    let application = store
        .application_mut(application_id)
        .ok_or_else(|| PipelineError::ApplicationNotFound(application_id.0.clone()))?;
    application.status = status.to_string();
    if let Some(stage) = application.stage_id.clone() {
        application.stage_history.push(StageTransition {
            from: Some(stage.clone()),
            to: stage,
            reason: reason.to_string(),
            at,
        });
    }
    Ok(())
}

/// Outcome of a stage's automatic rules after a completed review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RuleDecision {
    Advance { to: StageId, condition: String },
    Reject { condition: String },
}

/// Evaluates the current stage's auto-advance then auto-reject conditions.
///
/// Nothing fires until the stage's minimum number of completed reviews for `role` is met.
/// Unparseable conditions are logged and skipped.
pub fn evaluate_rules(
    store: &ReviewStore,
    application_id: &ApplicationId,
    role: Option<&ReviewerTypeId>,
) -> Option<RuleDecision> {
    let application = store.application(application_id)?;
    let stage = store.workspace().stage(application.stage_id.as_ref()?)?;

    let completed: Vec<_> = application.completed_reviews().collect();
    if (completed.len() as u32) < stage.min_reviews_required(role) {
        return None;
    }
    let average = aggregate_score(completed.iter().copied()).unwrap_or(0.0);
    let total: f64 = completed
        .iter()
        .filter_map(|entry| entry.total_score)
        .map(|total| total as f64)
        .sum();

    if let Some(condition) = parse_rule(stage, stage.auto_advance_condition.as_deref()) {
        if condition.holds(average, total) {
            let pipeline = pipeline_for(store, application_id).ok()?;
            let target = condition
                .target_stage
                .as_deref()
                .and_then(|name| pipeline.find_by_name(name))
                .or_else(|| pipeline.next_after(Some(&stage.id)));
            if let Some(target) = target.filter(|target| target.id != stage.id) {
                return Some(RuleDecision::Advance {
                    to: target.id.clone(),
                    condition: condition_label(stage.auto_advance_condition.as_deref()),
                });
            }
        }
    }

    if let Some(condition) = parse_rule(stage, stage.auto_reject_condition.as_deref()) {
        if condition.holds(average, total) {
            return Some(RuleDecision::Reject {
                condition: condition_label(stage.auto_reject_condition.as_deref()),
            });
        }
    }

    None
}

fn parse_rule(stage: &Stage, raw: Option<&str>) -> Option<Condition> {
    let raw = raw.filter(|raw| !raw.trim().is_empty())?;
    match Condition::parse(raw) {
        Ok(condition) => Some(condition),
        Err(error) => {
            tracing::warn!(stage_id = %stage.id.0, %error, "skipping stage rule");
            None
        }
    }
}

fn condition_label(raw: Option<&str>) -> String {
    raw.unwrap_or_default().trim().to_string()
}
