use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::assignment::AssignmentRequest;
use super::domain::{
    ActionId, ApplicationId, ReviewEntry, ReviewerId, ReviewerRoster, StageId, WorkflowId,
    WorkspaceData, WorkspaceSnapshot,
};
use super::sync::CacheKey;

/// Backend contract for every read and mutation the engine issues.
///
/// Roster-changing calls carry the roster version the caller last saw and fail with
/// [`GatewayError::Conflict`] when another editor got there first.
#[async_trait]
pub trait ReviewBackend: Send + Sync {
    async fn fetch_snapshot(&self, key: &CacheKey) -> Result<WorkspaceSnapshot, GatewayError>;

    async fn workspace_data(
        &self,
        workspace_id: &str,
        workflow_id: Option<&WorkflowId>,
    ) -> Result<WorkspaceData, GatewayError>;

    async fn move_to_stage(
        &self,
        application_id: &ApplicationId,
        stage_id: &StageId,
        reason: &str,
    ) -> Result<(), GatewayError>;

    async fn assign_workflow(
        &self,
        application_id: &ApplicationId,
        workflow_id: &WorkflowId,
        stage_id: &StageId,
    ) -> Result<(), GatewayError>;

    async fn bulk_assign_workflow(
        &self,
        application_ids: &[ApplicationId],
        workflow_id: &WorkflowId,
        stage_id: &StageId,
    ) -> Result<(), GatewayError>;

    async fn update_review_data(
        &self,
        application_id: &ApplicationId,
        update: &ReviewDataUpdate,
    ) -> Result<(), GatewayError>;

    async fn execute_action(&self, request: &ActionRequest) -> Result<(), GatewayError>;

    async fn assign(
        &self,
        reviewer_id: &ReviewerId,
        request: &AssignmentRequest,
        expected_version: u64,
    ) -> Result<AssignmentReceipt, GatewayError>;

    async fn reassign(
        &self,
        request: &ReassignRequest,
        expected_version: u64,
    ) -> Result<u64, GatewayError>;

    /// Writes the whole roster; returns the new version.
    async fn save_roster(
        &self,
        roster: &ReviewerRoster,
        expected_version: u64,
    ) -> Result<u64, GatewayError>;
}

/// Failure reported by the backend or the transport in front of it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("backend unavailable: {0}")]
    Transport(String),
    #[error("roster changed concurrently (expected version {expected}, found {actual})")]
    Conflict { expected: u64, actual: u64 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Score/comment/status write for one application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewDataUpdate {
    #[serde(default)]
    pub scores: BTreeMap<String, u32>,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub entry: Option<ReviewEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action_id: ActionId,
    pub action_type: String,
    pub submission_id: ApplicationId,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassignRequest {
    pub application_id: ApplicationId,
    pub from: ReviewerId,
    pub to: ReviewerId,
    #[serde(default)]
    pub note: String,
}

/// Backend answer to an assignment: which applications were newly assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentReceipt {
    pub assigned: usize,
    pub application_ids: Vec<ApplicationId>,
    pub roster_version: u64,
}

/// Outbound email hook for notifying reviewers.
pub trait Mailer: Send + Sync {
    fn send(&self, message: EmailMessage) -> Result<(), MailerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("email subject is required")]
    MissingSubject,
    #[error("email body is required")]
    MissingBody,
    #[error("at least one recipient is required")]
    NoRecipients,
}

impl EmailMessage {
    pub fn new(
        recipients: Vec<String>,
        subject: &str,
        body: &str,
    ) -> Result<Self, ValidationError> {
        let subject = subject.trim();
        let body = body.trim();
        if subject.is_empty() {
            return Err(ValidationError::MissingSubject);
        }
        if body.is_empty() {
            return Err(ValidationError::MissingBody);
        }
        let recipients: Vec<String> = recipients
            .into_iter()
            .map(|recipient| recipient.trim().to_string())
            .filter(|recipient| !recipient.is_empty())
            .collect();
        if recipients.is_empty() {
            return Err(ValidationError::NoRecipients);
        }
        Ok(Self {
            recipients,
            subject: subject.to_string(),
            body: body.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailerError {
    #[error("mail transport unavailable: {0}")]
    Transport(String),
}
