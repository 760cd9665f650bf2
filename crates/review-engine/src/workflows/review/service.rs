use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::assignment::{
    self, AssignmentError, AssignmentRequest, ManualStrategy, RemovalMode, RemovalSummary,
};
use super::domain::{
    ActionId, Application, ApplicationId, ReassignmentRecord, Reviewer, ReviewerId, ReviewerRoster,
    ReviewerStatus, ReviewerTypeId, Stage, StageId, StageRoleAssignment, StageTransition,
    WorkflowId,
};
use super::export::{export_csv, ExportError};
use super::pipeline::{self, ActionOutcome, PipelineError, RuleDecision, REJECTED_STATUS};
use super::repository::{
    ActionRequest, EmailMessage, GatewayError, Mailer, MailerError, ReassignRequest,
    ReviewBackend, ReviewDataUpdate, ValidationError,
};
use super::scoring::{analytics, AnalyticsReport};
use super::session::{self, ExternalReviewSession, SessionError};
use super::store::WorkspaceView;
use super::submission::{self, RecordedReview, ReviewError, ReviewSubmission};
use super::sync::{CacheKey, IngestReport, LiveEvent, LoadReport, SnapshotCache, SyncReconciler};
use super::visibility::{resolve_view, ApplicationView, VisibilityContext};
use crate::config::ReviewConfig;

/// Front door for every review operation.
///
/// Mutations validate against the in-memory store, call the backend, and only then commit
/// locally, so a failed call leaves the store untouched.
pub struct ReviewService<B, C, M> {
    backend: Arc<B>,
    mailer: Arc<M>,
    sync: SyncReconciler<B, C>,
    scan_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub stage_id: StageId,
    pub workflow_id: WorkflowId,
    pub name: String,
    pub order_index: i32,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewOutcome {
    #[serde(flatten)]
    pub review: RecordedReview,
    /// A stage rule fired and its move or rejection was committed.
    pub rule_applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentReport {
    pub reviewer_id: ReviewerId,
    pub assigned: usize,
    pub application_ids: Vec<ApplicationId>,
    pub roster_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub reviewer_id: ReviewerId,
    pub error: String,
}

/// Manual assignment across several reviewers; earlier batches stay applied after a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkAssignmentReport {
    pub strategy: ManualStrategy,
    pub completed: Vec<AssignmentReport>,
    pub failed: Option<BatchFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerInvitation {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub reviewer_type_id: Option<ReviewerTypeId>,
    #[serde(default)]
    pub stage_assignments: Vec<StageRoleAssignment>,
    #[serde(default)]
    pub can_view_all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmailReceipt {
    pub recipients: usize,
}

impl<B, C, M> ReviewService<B, C, M>
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    pub fn new(
        backend: Arc<B>,
        cache: Arc<C>,
        mailer: Arc<M>,
        key: CacheKey,
        ttl: Duration,
        scan_limit: usize,
    ) -> Self {
        Self {
            sync: SyncReconciler::new(Arc::clone(&backend), cache, key, ttl),
            backend,
            mailer,
            scan_limit,
        }
    }

    pub fn from_config(
        backend: Arc<B>,
        cache: Arc<C>,
        mailer: Arc<M>,
        config: &ReviewConfig,
    ) -> Self {
        Self::new(
            backend,
            cache,
            mailer,
            CacheKey::new(&config.form_id, &config.workspace_id),
            config.cache_ttl,
            config.scan_size_limit,
        )
    }

    pub fn reconciler(&self) -> &SyncReconciler<B, C> {
        &self.sync
    }

    pub async fn load(&self) -> Result<LoadReport, ReviewServiceError> {
        Ok(self.sync.load().await?)
    }

    pub async fn refresh(&self) -> Result<LoadReport, ReviewServiceError> {
        Ok(self.sync.refresh().await?)
    }

    pub async fn ingest(&self, event: LiveEvent) -> IngestReport {
        self.sync.ingest(event).await
    }

    /// Re-reads workflow configuration without touching applications.
    pub async fn reload_workspace(
        &self,
        workflow_id: Option<&WorkflowId>,
    ) -> Result<(), ReviewServiceError> {
        let workspace_id = &self.sync.key().workspace_id;
        let workspace = self
            .backend
            .workspace_data(workspace_id, workflow_id)
            .await
            .map_err(|error| failed("reload_workspace", workspace_id, error))?;
        self.sync.store().lock().await.replace_workspace(workspace);
        tracing::info!(workspace_id = %workspace_id, "workspace configuration reloaded");
        Ok(())
    }

    pub async fn application(&self, application_id: &ApplicationId) -> Option<Application> {
        self.sync
            .store()
            .lock()
            .await
            .application(application_id)
            .cloned()
    }

    pub async fn roster(&self) -> ReviewerRoster {
        self.sync.store().lock().await.roster().clone()
    }

    pub async fn stage_summaries(&self) -> Vec<StageSummary> {
        let store = self.sync.store().lock().await;
        let mut stages: Vec<&Stage> = store.workspace().stages.iter().collect();
        stages.sort_by(|left, right| {
            left.workflow_id
                .cmp(&right.workflow_id)
                .then(left.order_index.cmp(&right.order_index))
        });
        stages
            .into_iter()
            .map(|stage| StageSummary {
                stage_id: stage.id.clone(),
                workflow_id: stage.workflow_id.clone(),
                name: stage.name.clone(),
                order_index: stage.order_index,
                count: store.stage_count(&stage.id),
            })
            .collect()
    }

    /// Administrator queue: stage PII policy applies, role field policy does not.
    pub async fn queue(&self, view: &WorkspaceView) -> Vec<ApplicationView> {
        let store = self.sync.store().lock().await;
        let workspace = store.workspace();
        store
            .queue(view)
            .into_iter()
            .enumerate()
            .map(|(index, application)| {
                let context = VisibilityContext {
                    form: store.form(),
                    stage: application
                        .stage_id
                        .as_ref()
                        .and_then(|stage| workspace.stage(stage)),
                    role: None,
                    scan_limit: self.scan_limit,
                    apply_role_policy: false,
                };
                resolve_view(context, application, index + 1)
            })
            .collect()
    }

    pub async fn move_to_stage(
        &self,
        application_id: &ApplicationId,
        target: &StageId,
        reason: &str,
    ) -> Result<StageTransition, ReviewServiceError> {
        {
            let store = self.sync.store().lock().await;
            pipeline::plan_move(&store, application_id, target)
                .map_err(|error| failed("move_to_stage", &application_id.0, error))?;
        }

        self.backend
            .move_to_stage(application_id, target, reason)
            .await
            .map_err(|error| failed("move_to_stage", &application_id.0, error))?;

        let mut store = self.sync.store().lock().await;
        let transition =
            pipeline::move_to_stage(&mut store, application_id, target, reason, Utc::now())?;
        tracing::info!(
            application_id = %application_id.0,
            to = %target.0,
            reason,
            "application moved"
        );
        Ok(transition)
    }

    pub async fn execute_action(
        &self,
        application_id: &ApplicationId,
        action_id: &ActionId,
        comment: Option<&str>,
    ) -> Result<ActionOutcome, ReviewServiceError> {
        let request = {
            let store = self.sync.store().lock().await;
            let plan = pipeline::plan_action(&store, application_id, action_id, comment)
                .map_err(|error| failed("execute_action", &application_id.0, error))?;
            ActionRequest {
                action_id: action_id.clone(),
                action_type: plan.action.effect.tag().to_string(),
                submission_id: application_id.clone(),
                comment: comment
                    .map(str::trim)
                    .filter(|comment| !comment.is_empty())
                    .map(str::to_string),
            }
        };

        self.backend
            .execute_action(&request)
            .await
            .map_err(|error| failed("execute_action", &application_id.0, error))?;

        let mut store = self.sync.store().lock().await;
        let outcome =
            pipeline::execute_action(&mut store, application_id, action_id, comment, Utc::now())?;
        tracing::info!(
            application_id = %application_id.0,
            action_id = %action_id.0,
            action_type = %request.action_type,
            "stage action executed"
        );
        Ok(outcome)
    }

    pub async fn assign_workflow(
        &self,
        application_id: &ApplicationId,
        workflow_id: &WorkflowId,
        stage: Option<&StageId>,
    ) -> Result<StageId, ReviewServiceError> {
        let ids = std::slice::from_ref(application_id);
        let entry = self.plan_workflow(ids, workflow_id, stage).await?;
        self.backend
            .assign_workflow(application_id, workflow_id, &entry)
            .await
            .map_err(|error| failed("assign_workflow", &application_id.0, error))?;
        self.commit_workflow(ids, workflow_id, &entry).await
    }

    pub async fn bulk_assign_workflow(
        &self,
        application_ids: &[ApplicationId],
        workflow_id: &WorkflowId,
        stage: Option<&StageId>,
    ) -> Result<StageId, ReviewServiceError> {
        if application_ids.is_empty() {
            return Err(ReviewServiceError::InvalidRequest(
                "no applications selected".to_string(),
            ));
        }
        let entry = self.plan_workflow(application_ids, workflow_id, stage).await?;
        self.backend
            .bulk_assign_workflow(application_ids, workflow_id, &entry)
            .await
            .map_err(|error| failed("bulk_assign_workflow", &workflow_id.0, error))?;
        self.commit_workflow(application_ids, workflow_id, &entry)
            .await
    }

    async fn plan_workflow(
        &self,
        application_ids: &[ApplicationId],
        workflow_id: &WorkflowId,
        stage: Option<&StageId>,
    ) -> Result<StageId, ReviewServiceError> {
        let store = self.sync.store().lock().await;
        pipeline::plan_workflow_assignment(&store, application_ids, workflow_id, stage)
            .map_err(|error| failed("assign_workflow", &workflow_id.0, error))
    }

    async fn commit_workflow(
        &self,
        application_ids: &[ApplicationId],
        workflow_id: &WorkflowId,
        entry: &StageId,
    ) -> Result<StageId, ReviewServiceError> {
        let mut store = self.sync.store().lock().await;
        let stage = pipeline::assign_workflow(
            &mut store,
            application_ids,
            workflow_id,
            Some(entry),
            Utc::now(),
        )?;
        tracing::info!(
            workflow_id = %workflow_id.0,
            stage_id = %stage.0,
            applications = application_ids.len(),
            "applications placed in workflow"
        );
        Ok(stage)
    }

    /// Records a review, then carries out any stage rule it triggers.
    ///
    /// A rule that cannot be applied is logged; the review itself stays recorded.
    pub async fn submit_review(
        &self,
        application_id: &ApplicationId,
        reviewer_id: &ReviewerId,
        review: &ReviewSubmission,
    ) -> Result<ReviewOutcome, ReviewServiceError> {
        let plan = {
            let store = self.sync.store().lock().await;
            submission::plan_review(&store, application_id, reviewer_id, review, Utc::now())
                .map_err(|error| failed("submit_review", &application_id.0, error))?
        };

        let update = ReviewDataUpdate {
            scores: plan.entry.scores.clone(),
            comments: plan.entry.overall_comment.clone(),
            status: if plan.entry.is_draft {
                None
            } else {
                plan.status.clone()
            },
            entry: Some(plan.entry.clone()),
        };
        self.backend
            .update_review_data(application_id, &update)
            .await
            .map_err(|error| failed("submit_review", &application_id.0, error))?;

        let recorded = {
            let mut store = self.sync.store().lock().await;
            submission::record_review(&mut store, plan)?
        };
        tracing::info!(
            application_id = %application_id.0,
            reviewer_id = %reviewer_id.0,
            total_score = recorded.total_score,
            draft = recorded.is_draft,
            "review recorded"
        );

        let rule_applied = match &recorded.rule {
            Some(decision) => self.apply_rule(application_id, decision).await,
            None => false,
        };
        Ok(ReviewOutcome {
            review: recorded,
            rule_applied,
        })
    }

    async fn apply_rule(&self, application_id: &ApplicationId, decision: &RuleDecision) -> bool {
        let result = match decision {
            RuleDecision::Advance { to, condition } => self
                .move_to_stage(application_id, to, &format!("auto-advance: {condition}"))
                .await
                .map(|_| ()),
            RuleDecision::Reject { condition } => self.reject(application_id, condition).await,
        };
        match result {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    application_id = %application_id.0,
                    ?decision,
                    %error,
                    "stage rule not applied"
                );
                false
            }
        }
    }

    async fn reject(
        &self,
        application_id: &ApplicationId,
        condition: &str,
    ) -> Result<(), ReviewServiceError> {
        let update = ReviewDataUpdate {
            status: Some(REJECTED_STATUS.to_string()),
            ..ReviewDataUpdate::default()
        };
        self.backend
            .update_review_data(application_id, &update)
            .await?;
        let mut store = self.sync.store().lock().await;
        pipeline::set_status(
            &mut store,
            application_id,
            REJECTED_STATUS,
            &format!("auto-reject: {condition}"),
            Utc::now(),
        )?;
        tracing::info!(application_id = %application_id.0, condition, "application auto-rejected");
        Ok(())
    }

    /// One reviewer, one backend call; the backend picks applications for random requests.
    pub async fn assign_reviewer(
        &self,
        reviewer_id: &ReviewerId,
        request: &AssignmentRequest,
    ) -> Result<AssignmentReport, ReviewServiceError> {
        let version = {
            let store = self.sync.store().lock().await;
            let requested: &[ApplicationId] = match request {
                AssignmentRequest::Manual { submission_ids } => submission_ids.as_slice(),
                AssignmentRequest::Random { .. } => &[],
            };
            assignment::check_assignment(&store, reviewer_id, requested)
                .map_err(|error| failed("assign", &reviewer_id.0, error))?;
            store.roster().version
        };

        let receipt = self
            .backend
            .assign(reviewer_id, request, version)
            .await
            .map_err(|error| failed("assign", &reviewer_id.0, error))?;

        let mut store = self.sync.store().lock().await;
        let known: Vec<ApplicationId> = receipt
            .application_ids
            .into_iter()
            .filter(|id| store.contains(id))
            .collect();
        let added = assignment::assign(&mut store, reviewer_id, &known)?;
        store.roster_mut().version = receipt.roster_version;
        tracing::info!(
            reviewer_id = %reviewer_id.0,
            assigned = added.len(),
            roster_version = receipt.roster_version,
            "reviewer assigned"
        );

        Ok(AssignmentReport {
            reviewer_id: reviewer_id.clone(),
            assigned: added.len(),
            application_ids: added,
            roster_version: receipt.roster_version,
        })
    }

    /// Spreads applications over reviewers, one backend call per reviewer.
    ///
    /// A failure on the first call is returned as an error; a later failure stops the run and
    /// is reported next to the batches that already went through.
    pub async fn assign_manual(
        &self,
        reviewers: &[ReviewerId],
        application_ids: &[ApplicationId],
        strategy: ManualStrategy,
    ) -> Result<BulkAssignmentReport, ReviewServiceError> {
        if application_ids.is_empty() {
            return Err(ReviewServiceError::InvalidRequest(
                "no applications selected".to_string(),
            ));
        }
        let batches = assignment::plan_manual(strategy, reviewers, application_ids)?;

        let mut report = BulkAssignmentReport {
            strategy,
            completed: Vec::new(),
            failed: None,
        };
        for batch in batches {
            if batch.application_ids.is_empty() {
                continue;
            }
            let request = AssignmentRequest::Manual {
                submission_ids: batch.application_ids,
            };
            match self.assign_reviewer(&batch.reviewer_id, &request).await {
                Ok(done) => report.completed.push(done),
                Err(error) if report.completed.is_empty() => return Err(error),
                Err(error) => {
                    report.failed = Some(BatchFailure {
                        reviewer_id: batch.reviewer_id,
                        error: error.to_string(),
                    });
                    break;
                }
            }
        }
        Ok(report)
    }

    pub async fn reassign(
        &self,
        application_id: &ApplicationId,
        from: &ReviewerId,
        to: &ReviewerId,
        note: &str,
    ) -> Result<ReassignmentRecord, ReviewServiceError> {
        let version = {
            let store = self.sync.store().lock().await;
            assignment::check_reassignment(&store, application_id, from, to)
                .map_err(|error| failed("reassign", &application_id.0, error))?;
            store.roster().version
        };

        let request = ReassignRequest {
            application_id: application_id.clone(),
            from: from.clone(),
            to: to.clone(),
            note: note.trim().to_string(),
        };
        let roster_version = self
            .backend
            .reassign(&request, version)
            .await
            .map_err(|error| failed("reassign", &application_id.0, error))?;

        let mut store = self.sync.store().lock().await;
        let record =
            assignment::reassign(&mut store, application_id, from, to, &request.note, Utc::now())?;
        store.roster_mut().version = roster_version;
        tracing::info!(
            application_id = %application_id.0,
            from = %from.0,
            to = %to.0,
            "application reassigned"
        );
        Ok(record)
    }

    pub async fn remove_reviewer(
        &self,
        reviewer_id: &ReviewerId,
        mode: RemovalMode,
    ) -> Result<RemovalSummary, ReviewServiceError> {
        let at = Utc::now();
        let (roster, version) = {
            let store = self.sync.store().lock().await;
            assignment::check_removal(&store, reviewer_id)
                .map_err(|error| failed("remove_reviewer", &reviewer_id.0, error))?;
            let mut roster = store.roster().clone();
            assignment::retire(&mut roster, reviewer_id, mode, at);
            (roster, store.roster().version)
        };

        let roster_version = self
            .backend
            .save_roster(&roster, version)
            .await
            .map_err(|error| failed("remove_reviewer", &reviewer_id.0, error))?;

        let mut store = self.sync.store().lock().await;
        let summary = assignment::remove_reviewer(&mut store, reviewer_id, mode, at)?;
        store.roster_mut().version = roster_version;
        tracing::info!(
            reviewer_id = %reviewer_id.0,
            ?mode,
            unassigned_from = summary.unassigned_from,
            "reviewer removed"
        );
        Ok(summary)
    }

    pub async fn invite_reviewer(
        &self,
        invitation: &ReviewerInvitation,
    ) -> Result<Reviewer, ReviewServiceError> {
        let name = invitation.name.trim();
        let email = invitation.email.trim();
        if name.is_empty() || email.is_empty() {
            return Err(ReviewServiceError::InvalidRequest(
                "reviewer name and email are required".to_string(),
            ));
        }

        let (roster, version, reviewer) = {
            let store = self.sync.store().lock().await;
            let taken = store
                .roster()
                .active()
                .any(|existing| existing.email.eq_ignore_ascii_case(email));
            if taken {
                return Err(ReviewServiceError::InvalidRequest(format!(
                    "{email} is already on the roster"
                )));
            }

            let token = fresh_token(store.roster());
            let suffix = token
                .strip_prefix(assignment::TOKEN_PREFIX)
                .unwrap_or(&token);
            let reviewer = Reviewer {
                id: ReviewerId(format!("reviewer-{suffix}")),
                name: name.to_string(),
                email: email.to_string(),
                token: token.clone(),
                status: ReviewerStatus::Active,
                reviewer_type_id: invitation.reviewer_type_id.clone(),
                stage_assignments: invitation.stage_assignments.clone(),
                assigned_count: 0,
                completed_count: 0,
                can_view_all: invitation.can_view_all,
                invited_at: Some(Utc::now()),
                removed_at: None,
            };
            let mut roster = store.roster().clone();
            roster.reviewers.push(reviewer.clone());
            (roster, store.roster().version, reviewer)
        };

        let roster_version = self
            .backend
            .save_roster(&roster, version)
            .await
            .map_err(|error| failed("invite_reviewer", &reviewer.id.0, error))?;

        let mut store = self.sync.store().lock().await;
        store.roster_mut().reviewers.push(reviewer.clone());
        store.roster_mut().version = roster_version;
        tracing::info!(reviewer_id = %reviewer.id.0, "reviewer invited");
        Ok(reviewer)
    }

    /// Sends one message to the given reviewers; removed and unknown ids are skipped.
    pub async fn email_reviewers(
        &self,
        reviewer_ids: &[ReviewerId],
        subject: &str,
        body: &str,
    ) -> Result<EmailReceipt, ReviewServiceError> {
        let recipients: Vec<String> = {
            let store = self.sync.store().lock().await;
            reviewer_ids
                .iter()
                .filter_map(|id| store.roster().get(id))
                .filter(|reviewer| reviewer.status != ReviewerStatus::Removed)
                .map(|reviewer| reviewer.email.clone())
                .collect()
        };
        let message = EmailMessage::new(recipients, subject, body)
            .map_err(|error| failed("email_reviewers", subject, error))?;
        let receipt = EmailReceipt {
            recipients: message.recipients.len(),
        };
        self.mailer
            .send(message)
            .map_err(|error| failed("email_reviewers", subject, error))?;
        tracing::info!(recipients = receipt.recipients, "reviewer email sent");
        Ok(receipt)
    }

    pub async fn analytics(&self) -> AnalyticsReport {
        let store = self.sync.store().lock().await;
        analytics(store.applications(), store.roster(), store.stage_counts())
    }

    pub async fn export_csv(&self) -> Result<String, ReviewServiceError> {
        let store = self.sync.store().lock().await;
        Ok(export_csv(&store)?)
    }

    pub async fn open_session(
        &self,
        token: &str,
    ) -> Result<ExternalReviewSession, ReviewServiceError> {
        let store = self.sync.store().lock().await;
        Ok(session::open_session(&store, token, self.scan_limit)?)
    }

    /// Review submission keyed by access token instead of an authenticated reviewer.
    pub async fn submit_via_token(
        &self,
        token: &str,
        application_id: &ApplicationId,
        review: &ReviewSubmission,
    ) -> Result<ReviewOutcome, ReviewServiceError> {
        let reviewer_id = {
            let store = self.sync.store().lock().await;
            session::authorize_submission(&store, token, application_id)
                .map_err(|error| failed("submit_via_token", &application_id.0, error))?
        };
        self.submit_review(application_id, &reviewer_id, review)
            .await
    }
}

fn fresh_token(roster: &ReviewerRoster) -> String {
    let mut rng = rand::rng();
    loop {
        let token = assignment::generate_token(&mut rng);
        if roster.by_token(&token).is_none() {
            return token;
        }
    }
}

fn failed(
    operation: &'static str,
    subject: &str,
    error: impl Into<ReviewServiceError>,
) -> ReviewServiceError {
    let error = error.into();
    tracing::warn!(operation, subject, %error, "review operation failed");
    error
}

/// Error raised by the review service.
#[derive(Debug, thiserror::Error)]
pub enum ReviewServiceError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Assignment(#[from] AssignmentError),
    #[error(transparent)]
    Review(#[from] ReviewError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Email(#[from] ValidationError),
    #[error(transparent)]
    Mailer(#[from] MailerError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
