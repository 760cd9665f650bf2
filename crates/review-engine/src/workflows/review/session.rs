use serde::Serialize;

use super::domain::{
    Application, ApplicationId, ReviewEntry, Reviewer, ReviewerId, ReviewerStatus,
    ReviewerTypeId, Rubric, Stage,
};
use super::store::ReviewStore;
use super::visibility::{resolve_view, ApplicationView, VisibilityContext};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("review link is not valid")]
    UnknownToken,
    #[error("review access has been {0}")]
    ReviewerInactive(&'static str),
    #[error("application {0} is not part of this review session")]
    NotAssigned(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReviewer {
    pub id: ReviewerId,
    pub name: String,
    pub email: String,
    pub status: ReviewerStatus,
    pub assigned_count: u32,
    pub completed_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionForm {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionApplication {
    #[serde(flatten)]
    pub view: ApplicationView,
    /// The caller's own entry, draft or final, for pre-filling the scoring form.
    pub own_review: Option<ReviewEntry>,
}

/// Everything a token holder may see, resolved fresh on every request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExternalReviewSession {
    pub reviewer: SessionReviewer,
    pub form: SessionForm,
    pub stage: Option<Stage>,
    pub role: Option<ReviewerTypeId>,
    pub rubric: Option<Rubric>,
    pub applications: Vec<SessionApplication>,
    pub no_assignments: bool,
}

fn authenticate<'a>(store: &'a ReviewStore, token: &str) -> Result<&'a Reviewer, SessionError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(SessionError::UnknownToken);
    }
    let reviewer = store
        .roster()
        .by_token(token)
        .ok_or(SessionError::UnknownToken)?;
    if !reviewer.status.admits_session() {
        return Err(SessionError::ReviewerInactive(reviewer.status.label()));
    }
    Ok(reviewer)
}

/// First explicit stage assignment, else the earliest stage serving the primary role.
fn session_stage<'a>(store: &'a ReviewStore, reviewer: &Reviewer) -> Option<&'a Stage> {
    let workspace = store.workspace();
    if let Some(stage) = reviewer
        .stage_assignments
        .first()
        .and_then(|assignment| workspace.stage(&assignment.stage_id))
    {
        return Some(stage);
    }

    let role = reviewer.reviewer_type_id.as_ref()?;
    let mut serving: Vec<&Stage> = workspace
        .stages
        .iter()
        .filter(|stage| stage.serves_role(role))
        .collect();
    serving.sort_by_key(|stage| stage.order_index);
    serving.first().copied()
}

fn visible_to<'a>(
    store: &'a ReviewStore,
    reviewer: &'a Reviewer,
) -> impl Iterator<Item = &'a Application> + 'a {
    store.applications().iter().filter(move |application| {
        reviewer.can_view_all || application.assigned_reviewers.contains(&reviewer.id)
    })
}

pub fn open_session(
    store: &ReviewStore,
    token: &str,
    scan_limit: usize,
) -> Result<ExternalReviewSession, SessionError> {
    let reviewer = authenticate(store, token)?;
    let workspace = store.workspace();
    let stage = session_stage(store, reviewer);
    let role = match stage {
        Some(stage) => reviewer.role_for(&stage.id),
        None => reviewer.reviewer_type_id.as_ref(),
    };
    let rubric = stage.and_then(|stage| workspace.rubric_for(stage, role));

    let applications: Vec<SessionApplication> = visible_to(store, reviewer)
        .enumerate()
        .map(|(index, application)| {
            let app_stage = application
                .stage_id
                .as_ref()
                .and_then(|id| workspace.stage(id))
                .or(stage);
            let app_role = match app_stage {
                Some(app_stage) => reviewer.role_for(&app_stage.id),
                None => role,
            };
            let context = VisibilityContext {
                form: store.form(),
                stage: app_stage,
                role: app_role,
                scan_limit,
                apply_role_policy: true,
            };
            SessionApplication {
                view: resolve_view(context, application, index + 1),
                own_review: application.review_by(&reviewer.id).cloned(),
            }
        })
        .collect();

    tracing::debug!(
        reviewer_id = %reviewer.id.0,
        applications = applications.len(),
        "external review session resolved"
    );

    Ok(ExternalReviewSession {
        reviewer: SessionReviewer {
            id: reviewer.id.clone(),
            name: reviewer.name.clone(),
            email: reviewer.email.clone(),
            status: reviewer.status,
            assigned_count: reviewer.assigned_count,
            completed_count: reviewer.completed_count,
        },
        form: SessionForm {
            id: store.form().id.clone(),
            name: store.form().name.clone(),
        },
        stage: stage.cloned(),
        role: role.cloned(),
        rubric: rubric.cloned(),
        no_assignments: applications.is_empty(),
        applications,
    })
}

/// Resolves the token holder allowed to review `application_id`.
pub fn authorize_submission(
    store: &ReviewStore,
    token: &str,
    application_id: &ApplicationId,
) -> Result<ReviewerId, SessionError> {
    let reviewer = authenticate(store, token)?;
    if visible_to(store, reviewer).any(|application| &application.id == application_id) {
        Ok(reviewer.id.clone())
    } else {
        Err(SessionError::NotAssigned(application_id.0.clone()))
    }
}
