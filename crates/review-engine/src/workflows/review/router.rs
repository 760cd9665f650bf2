use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use super::assignment::{AssignmentError, AssignmentRequest, ManualStrategy, RemovalMode};
use super::domain::{ActionId, ApplicationId, ReviewerId, StageId, WorkflowId};
use super::pipeline::PipelineError;
use super::repository::{GatewayError, Mailer, ReviewBackend};
use super::service::{ReviewService, ReviewServiceError, ReviewerInvitation};
use super::session::SessionError;
use super::store::WorkspaceView;
use super::submission::{ReviewError, ReviewSubmission};
use super::sync::{LiveEvent, SnapshotCache};

type Shared<B, C, M> = State<Arc<ReviewService<B, C, M>>>;

/// HTTP surface for administrators and token-holding external reviewers.
pub fn review_router<B, C, M>(service: Arc<ReviewService<B, C, M>>) -> Router
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    Router::new()
        .route("/api/v1/review/stages", get(stages_handler::<B, C, M>))
        .route("/api/v1/review/queue", get(queue_handler::<B, C, M>))
        .route(
            "/api/v1/review/applications/workflow",
            post(bulk_workflow_handler::<B, C, M>),
        )
        .route(
            "/api/v1/review/applications/:application_id/stage",
            post(move_handler::<B, C, M>),
        )
        .route(
            "/api/v1/review/applications/:application_id/actions",
            post(action_handler::<B, C, M>),
        )
        .route(
            "/api/v1/review/applications/:application_id/workflow",
            post(workflow_handler::<B, C, M>),
        )
        .route(
            "/api/v1/review/applications/:application_id/reviews",
            post(review_handler::<B, C, M>),
        )
        .route(
            "/api/v1/review/applications/:application_id/reassign",
            post(reassign_handler::<B, C, M>),
        )
        .route("/api/v1/review/reviewers", post(invite_handler::<B, C, M>))
        .route(
            "/api/v1/review/reviewers/email",
            post(email_handler::<B, C, M>),
        )
        .route(
            "/api/v1/review/reviewers/:reviewer_id",
            delete(remove_handler::<B, C, M>),
        )
        .route(
            "/api/v1/review/reviewers/:reviewer_id/assign",
            post(assign_handler::<B, C, M>),
        )
        .route(
            "/api/v1/review/assignments",
            post(manual_assignment_handler::<B, C, M>),
        )
        .route("/api/v1/review/events", post(event_handler::<B, C, M>))
        .route("/api/v1/review/refresh", post(refresh_handler::<B, C, M>))
        .route("/api/v1/review/analytics", get(analytics_handler::<B, C, M>))
        .route("/api/v1/review/export.csv", get(export_handler::<B, C, M>))
        .route(
            "/api/v1/external-review/:token",
            get(session_handler::<B, C, M>),
        )
        .route(
            "/api/v1/external-review/:token/submit/:application_id",
            post(token_submit_handler::<B, C, M>),
        )
        .with_state(service)
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct QueueQuery {
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    search: Option<String>,
}

impl QueueQuery {
    fn into_view(self) -> WorkspaceView {
        WorkspaceView {
            stage_filter: self
                .stage
                .filter(|stage| !stage.trim().is_empty())
                .map(StageId),
            search: self.search.unwrap_or_default(),
            selected: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct MoveBody {
    stage_id: StageId,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ActionBody {
    pub(crate) action_id: ActionId,
    #[serde(default)]
    pub(crate) comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WorkflowBody {
    workflow_id: WorkflowId,
    #[serde(default)]
    stage_id: Option<StageId>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BulkWorkflowBody {
    application_ids: Vec<ApplicationId>,
    workflow_id: WorkflowId,
    #[serde(default)]
    stage_id: Option<StageId>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReviewBody {
    reviewer_id: ReviewerId,
    #[serde(flatten)]
    submission: ReviewSubmission,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReassignBody {
    from: ReviewerId,
    to: ReviewerId,
    #[serde(default)]
    note: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ManualAssignmentBody {
    reviewer_ids: Vec<ReviewerId>,
    application_ids: Vec<ApplicationId>,
    strategy: ManualStrategy,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RemovalQuery {
    #[serde(default)]
    mode: Option<RemovalMode>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmailBody {
    reviewer_ids: Vec<ReviewerId>,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
}

pub(crate) async fn stages_handler<B, C, M>(State(service): Shared<B, C, M>) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    (StatusCode::OK, Json(service.stage_summaries().await)).into_response()
}

pub(crate) async fn queue_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Query(query): Query<QueueQuery>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    let view = query.into_view();
    (StatusCode::OK, Json(service.queue(&view).await)).into_response()
}

pub(crate) async fn move_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Path(application_id): Path<String>,
    Json(body): Json<MoveBody>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    let id = ApplicationId(application_id);
    match service.move_to_stage(&id, &body.stage_id, &body.reason).await {
        Ok(transition) => (StatusCode::OK, Json(transition)).into_response(),
        Err(error) => failure(error),
    }
}

pub(crate) async fn action_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Path(application_id): Path<String>,
    Json(body): Json<ActionBody>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    let id = ApplicationId(application_id);
    match service
        .execute_action(&id, &body.action_id, body.comment.as_deref())
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(error) => failure(error),
    }
}

pub(crate) async fn workflow_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Path(application_id): Path<String>,
    Json(body): Json<WorkflowBody>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    let id = ApplicationId(application_id);
    match service
        .assign_workflow(&id, &body.workflow_id, body.stage_id.as_ref())
        .await
    {
        Ok(stage) => {
            let payload = json!({
                "application_id": id,
                "workflow_id": body.workflow_id,
                "stage_id": stage,
            });
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(error) => failure(error),
    }
}

pub(crate) async fn bulk_workflow_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Json(body): Json<BulkWorkflowBody>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    match service
        .bulk_assign_workflow(
            &body.application_ids,
            &body.workflow_id,
            body.stage_id.as_ref(),
        )
        .await
    {
        Ok(stage) => {
            let payload = json!({
                "assigned": body.application_ids.len(),
                "workflow_id": body.workflow_id,
                "stage_id": stage,
            });
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(error) => failure(error),
    }
}

pub(crate) async fn review_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Path(application_id): Path<String>,
    Json(body): Json<ReviewBody>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    let id = ApplicationId(application_id);
    match service
        .submit_review(&id, &body.reviewer_id, &body.submission)
        .await
    {
        Ok(outcome) => (StatusCode::ACCEPTED, Json(outcome)).into_response(),
        Err(error) => failure(error),
    }
}

pub(crate) async fn reassign_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Path(application_id): Path<String>,
    Json(body): Json<ReassignBody>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    let id = ApplicationId(application_id);
    match service.reassign(&id, &body.from, &body.to, &body.note).await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(error) => failure(error),
    }
}

pub(crate) async fn invite_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Json(invitation): Json<ReviewerInvitation>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    match service.invite_reviewer(&invitation).await {
        Ok(reviewer) => (StatusCode::CREATED, Json(reviewer)).into_response(),
        Err(error) => failure(error),
    }
}

pub(crate) async fn email_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Json(body): Json<EmailBody>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    match service
        .email_reviewers(&body.reviewer_ids, &body.subject, &body.body)
        .await
    {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(error) => failure(error),
    }
}

pub(crate) async fn remove_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Path(reviewer_id): Path<String>,
    Query(query): Query<RemovalQuery>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    let id = ReviewerId(reviewer_id);
    let mode = query.mode.unwrap_or(RemovalMode::Archive);
    match service.remove_reviewer(&id, mode).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(error) => failure(error),
    }
}

pub(crate) async fn assign_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Path(reviewer_id): Path<String>,
    Json(request): Json<AssignmentRequest>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    let id = ReviewerId(reviewer_id);
    match service.assign_reviewer(&id, &request).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(error) => failure(error),
    }
}

pub(crate) async fn manual_assignment_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Json(body): Json<ManualAssignmentBody>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    match service
        .assign_manual(&body.reviewer_ids, &body.application_ids, body.strategy)
        .await
    {
        Ok(report) if report.failed.is_some() => {
            (StatusCode::MULTI_STATUS, Json(report)).into_response()
        }
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(error) => failure(error),
    }
}

pub(crate) async fn event_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Json(event): Json<LiveEvent>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    let report = service.ingest(event).await;
    (StatusCode::ACCEPTED, Json(report)).into_response()
}

pub(crate) async fn refresh_handler<B, C, M>(State(service): Shared<B, C, M>) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    match service.refresh().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(error) => failure(error),
    }
}

pub(crate) async fn analytics_handler<B, C, M>(State(service): Shared<B, C, M>) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    (StatusCode::OK, Json(service.analytics().await)).into_response()
}

pub(crate) async fn export_handler<B, C, M>(State(service): Shared<B, C, M>) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    match service.export_csv().await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => failure(error),
    }
}

pub(crate) async fn session_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Path(token): Path<String>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    match service.open_session(&token).await {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(error) => failure(error),
    }
}

pub(crate) async fn token_submit_handler<B, C, M>(
    State(service): Shared<B, C, M>,
    Path((token, application_id)): Path<(String, String)>,
    Json(submission): Json<ReviewSubmission>,
) -> Response
where
    B: ReviewBackend + 'static,
    C: SnapshotCache + 'static,
    M: Mailer + 'static,
{
    let id = ApplicationId(application_id);
    match service.submit_via_token(&token, &id, &submission).await {
        Ok(outcome) => (StatusCode::ACCEPTED, Json(outcome)).into_response(),
        Err(error) => failure(error),
    }
}

fn failure(error: ReviewServiceError) -> Response {
    let payload = json!({
        "error": error.to_string(),
    });
    (status_for(&error), Json(payload)).into_response()
}

pub(crate) fn status_for(error: &ReviewServiceError) -> StatusCode {
    match error {
        ReviewServiceError::Gateway(GatewayError::Conflict { .. }) => StatusCode::CONFLICT,
        ReviewServiceError::Gateway(GatewayError::NotFound(_)) => StatusCode::NOT_FOUND,
        ReviewServiceError::Gateway(_) | ReviewServiceError::Mailer(_) => StatusCode::BAD_GATEWAY,
        ReviewServiceError::Pipeline(
            PipelineError::ApplicationNotFound(_)
            | PipelineError::UnknownWorkflow(_)
            | PipelineError::UnknownAction(_)
            | PipelineError::UnknownGroup(_),
        )
        | ReviewServiceError::Assignment(
            AssignmentError::UnknownReviewer(_) | AssignmentError::UnknownApplication(_),
        )
        | ReviewServiceError::Review(
            ReviewError::ApplicationNotFound(_) | ReviewError::UnknownReviewer(_),
        )
        | ReviewServiceError::Session(SessionError::UnknownToken) => StatusCode::NOT_FOUND,
        ReviewServiceError::Session(_) => StatusCode::FORBIDDEN,
        ReviewServiceError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ReviewServiceError::Pipeline(_)
        | ReviewServiceError::Assignment(_)
        | ReviewServiceError::Review(_)
        | ReviewServiceError::Email(_)
        | ReviewServiceError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
    }
}
