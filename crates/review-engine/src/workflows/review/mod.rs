//! Multi-stage application review: workflow stages, reviewer assignment, scoring, PII-aware
//! visibility, token-scoped external review, and cache/live-update reconciliation.
//!
//! Pure operations work on a [`ReviewStore`]; [`ReviewService`] sequences them around the
//! [`ReviewBackend`] so local state only changes after the backend accepted the change.

pub mod assignment;
pub mod domain;
pub mod export;
pub mod pipeline;
pub mod repository;
pub mod router;
pub mod scoring;
pub mod service;
pub mod session;
pub mod store;
pub mod submission;
pub mod sync;
pub mod visibility;

#[cfg(test)]
mod tests;

pub use assignment::{
    AssignmentBatch, AssignmentError, AssignmentRequest, ManualStrategy, RemovalMode,
    RemovalSummary,
};
pub use domain::{
    ActionEffect, ActionId, Application, ApplicationId, FieldVisibility, FormDefinition,
    FormField, ReviewEntry, Reviewer, ReviewerId, ReviewerRoster, ReviewerStatus, ReviewerTypeId,
    Rubric, Stage, StageId, Workflow, WorkflowId, WorkspaceData, WorkspaceSnapshot,
};
pub use export::{export_csv, ExportError};
pub use pipeline::{ActionOutcome, PipelineError, RuleDecision, StagePipeline};
pub use repository::{
    ActionRequest, AssignmentReceipt, EmailMessage, GatewayError, Mailer, MailerError,
    ReassignRequest, ReviewBackend, ReviewDataUpdate, ValidationError,
};
pub use router::review_router;
pub use scoring::{AnalyticsReport, ApplicationScore, ReviewerStats, ScoreViolation};
pub use service::{
    AssignmentReport, BulkAssignmentReport, ReviewOutcome, ReviewService, ReviewServiceError,
    ReviewerInvitation, StageSummary,
};
pub use session::{ExternalReviewSession, SessionError};
pub use store::{DataSource, ReviewStore, WorkspaceView};
pub use submission::{RecordedReview, ReviewError, ReviewSubmission};
pub use sync::{
    CacheKey, CachedSnapshot, FileSnapshotCache, LiveEvent, LoadReport, LoadStatus,
    MemorySnapshotCache, SnapshotCache, SyncReconciler,
};
pub use visibility::{ApplicationView, REDACTED_PLACEHOLDER};
