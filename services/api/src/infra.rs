use async_trait::async_trait;
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use review_engine::config::ReviewConfig;
use review_engine::workflows::review::assignment::{self, AssignmentRequest};
use review_engine::workflows::review::domain::{
    ActionEffect, ActionId, Application, ApplicationId, FieldId, FieldVisibility,
    FormDefinition, FormField, FormSection, Group, GroupId, Reviewer, ReviewerId,
    ReviewerRoster, ReviewerStatus, ReviewerType, ReviewerTypeId, Rubric, RubricCategory,
    RubricId, Stage, StageAction, StageId, StageReviewerConfig, StageRoleAssignment, Workflow,
    WorkflowAction, WorkflowId, WorkspaceData, WorkspaceSnapshot,
};
use review_engine::workflows::review::pipeline;
use review_engine::workflows::review::sync::CacheError;
use review_engine::workflows::review::{
    ActionRequest, AssignmentReceipt, CacheKey, CachedSnapshot, DataSource, EmailMessage,
    FileSnapshotCache, GatewayError, Mailer, MailerError, MemorySnapshotCache, ReassignRequest,
    ReviewBackend, ReviewDataUpdate, ReviewService, ReviewStore, SnapshotCache,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

pub(crate) type LocalReviewService =
    ReviewService<InMemoryReviewBackend, ConfiguredCache, InMemoryMailer>;

/// Stand-in for the hosted form backend: applies every write to its own store.
pub(crate) struct InMemoryReviewBackend {
    store: AsyncMutex<ReviewStore>,
}

impl InMemoryReviewBackend {
    pub(crate) fn new(snapshot: WorkspaceSnapshot) -> Self {
        Self {
            store: AsyncMutex::new(ReviewStore::from_snapshot(snapshot, DataSource::Fetch)),
        }
    }

    fn check_version(store: &ReviewStore, expected: u64) -> Result<(), GatewayError> {
        let actual = store.roster().version;
        if actual == expected {
            Ok(())
        } else {
            Err(GatewayError::Conflict { expected, actual })
        }
    }
}

fn rejected(error: impl std::fmt::Display) -> GatewayError {
    GatewayError::Rejected(error.to_string())
}

fn touch(store: &mut ReviewStore, application_id: &ApplicationId) {
    if let Some(application) = store.application_mut(application_id) {
        application.revision += 1;
    }
}

#[async_trait]
impl ReviewBackend for InMemoryReviewBackend {
    async fn fetch_snapshot(&self, _key: &CacheKey) -> Result<WorkspaceSnapshot, GatewayError> {
        Ok(self.store.lock().await.snapshot())
    }

    async fn workspace_data(
        &self,
        _workspace_id: &str,
        _workflow_id: Option<&WorkflowId>,
    ) -> Result<WorkspaceData, GatewayError> {
        Ok(self.store.lock().await.workspace().clone())
    }

    async fn move_to_stage(
        &self,
        application_id: &ApplicationId,
        stage_id: &StageId,
        reason: &str,
    ) -> Result<(), GatewayError> {
        let mut store = self.store.lock().await;
        pipeline::move_to_stage(&mut store, application_id, stage_id, reason, Utc::now())
            .map_err(rejected)?;
        touch(&mut store, application_id);
        Ok(())
    }

    async fn assign_workflow(
        &self,
        application_id: &ApplicationId,
        workflow_id: &WorkflowId,
        stage_id: &StageId,
    ) -> Result<(), GatewayError> {
        self.bulk_assign_workflow(std::slice::from_ref(application_id), workflow_id, stage_id)
            .await
    }

    async fn bulk_assign_workflow(
        &self,
        application_ids: &[ApplicationId],
        workflow_id: &WorkflowId,
        stage_id: &StageId,
    ) -> Result<(), GatewayError> {
        let mut store = self.store.lock().await;
        pipeline::assign_workflow(
            &mut store,
            application_ids,
            workflow_id,
            Some(stage_id),
            Utc::now(),
        )
        .map_err(rejected)?;
        for application_id in application_ids {
            touch(&mut store, application_id);
        }
        Ok(())
    }

    async fn update_review_data(
        &self,
        application_id: &ApplicationId,
        update: &ReviewDataUpdate,
    ) -> Result<(), GatewayError> {
        let mut store = self.store.lock().await;
        let application = store
            .application_mut(application_id)
            .ok_or_else(|| GatewayError::NotFound(application_id.0.clone()))?;
        if !update.scores.is_empty() {
            application.scores = update.scores.clone();
        }
        if let Some(status) = &update.status {
            application.status = status.clone();
        }
        if let Some(entry) = &update.entry {
            match application
                .reviews
                .iter_mut()
                .find(|existing| existing.reviewer_id == entry.reviewer_id)
            {
                Some(existing) => *existing = entry.clone(),
                None => application.reviews.push(entry.clone()),
            }
        }
        application.revision += 1;
        Ok(())
    }

    async fn execute_action(&self, request: &ActionRequest) -> Result<(), GatewayError> {
        let mut store = self.store.lock().await;
        pipeline::execute_action(
            &mut store,
            &request.submission_id,
            &request.action_id,
            request.comment.as_deref(),
            Utc::now(),
        )
        .map_err(rejected)?;
        touch(&mut store, &request.submission_id);
        Ok(())
    }

    async fn assign(
        &self,
        reviewer_id: &ReviewerId,
        request: &AssignmentRequest,
        expected_version: u64,
    ) -> Result<AssignmentReceipt, GatewayError> {
        let mut store = self.store.lock().await;
        Self::check_version(&store, expected_version)?;

        let wanted = match request {
            AssignmentRequest::Manual { submission_ids } => submission_ids.clone(),
            AssignmentRequest::Random {
                count,
                only_unassigned,
            } => assignment::select_random(
                store.applications(),
                reviewer_id,
                *count,
                *only_unassigned,
                &mut rand::rng(),
            ),
        };
        let added = assignment::assign(&mut store, reviewer_id, &wanted).map_err(rejected)?;
        store.roster_mut().version += 1;

        Ok(AssignmentReceipt {
            assigned: added.len(),
            application_ids: added,
            roster_version: store.roster().version,
        })
    }

    async fn reassign(
        &self,
        request: &ReassignRequest,
        expected_version: u64,
    ) -> Result<u64, GatewayError> {
        let mut store = self.store.lock().await;
        Self::check_version(&store, expected_version)?;
        assignment::reassign(
            &mut store,
            &request.application_id,
            &request.from,
            &request.to,
            &request.note,
            Utc::now(),
        )
        .map_err(rejected)?;
        touch(&mut store, &request.application_id);
        store.roster_mut().version += 1;
        Ok(store.roster().version)
    }

    async fn save_roster(
        &self,
        roster: &ReviewerRoster,
        expected_version: u64,
    ) -> Result<u64, GatewayError> {
        let mut store = self.store.lock().await;
        Self::check_version(&store, expected_version)?;

        let (applications, current) = store.split_mut();
        for application in applications.iter_mut() {
            application
                .assigned_reviewers
                .retain(|reviewer| roster.get(reviewer).is_some());
            application
                .reviewer_info
                .retain(|reviewer, _| roster.get(reviewer).is_some());
        }
        *current = ReviewerRoster {
            version: expected_version + 1,
            reviewers: roster.reviewers.clone(),
        };
        Ok(current.version)
    }
}

/// Snapshot cache picked from configuration.
pub(crate) enum ConfiguredCache {
    Memory(MemorySnapshotCache),
    File(FileSnapshotCache),
}

impl ConfiguredCache {
    pub(crate) fn from_config(config: &ReviewConfig) -> Self {
        match &config.cache_dir {
            Some(dir) => Self::File(FileSnapshotCache::new(dir.clone())),
            None => Self::Memory(MemorySnapshotCache::default()),
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            ConfiguredCache::Memory(_) => "memory".to_string(),
            ConfiguredCache::File(cache) => cache.dir().display().to_string(),
        }
    }
}

#[async_trait]
impl SnapshotCache for ConfiguredCache {
    async fn load(&self, key: &CacheKey) -> Result<Option<CachedSnapshot>, CacheError> {
        match self {
            ConfiguredCache::Memory(cache) => cache.load(key).await,
            ConfiguredCache::File(cache) => cache.load(key).await,
        }
    }

    async fn store(&self, key: &CacheKey, entry: &CachedSnapshot) -> Result<(), CacheError> {
        match self {
            ConfiguredCache::Memory(cache) => cache.store(key, entry).await,
            ConfiguredCache::File(cache) => cache.store(key, entry).await,
        }
    }

    async fn evict(&self, key: &CacheKey) -> Result<(), CacheError> {
        match self {
            ConfiguredCache::Memory(cache) => cache.evict(key).await,
            ConfiguredCache::File(cache) => cache.evict(key).await,
        }
    }
}

/// Keeps outbound reviewer email in an outbox instead of delivering it.
#[derive(Default, Clone)]
pub(crate) struct InMemoryMailer {
    outbox: Arc<Mutex<Vec<EmailMessage>>>,
}

impl Mailer for InMemoryMailer {
    fn send(&self, message: EmailMessage) -> Result<(), MailerError> {
        let mut outbox = self
            .outbox
            .lock()
            .map_err(|_| MailerError::Transport("outbox lock poisoned".to_string()))?;
        tracing::debug!(
            recipients = message.recipients.len(),
            subject = %message.subject,
            "email queued"
        );
        outbox.push(message);
        Ok(())
    }
}

impl InMemoryMailer {
    pub(crate) fn sent(&self) -> Vec<EmailMessage> {
        self.outbox
            .lock()
            .map(|outbox| outbox.clone())
            .unwrap_or_default()
    }
}

/// Service wired to the seeded in-memory backend and the configured cache.
pub(crate) fn local_service(config: &ReviewConfig) -> (LocalReviewService, InMemoryMailer) {
    let backend = Arc::new(InMemoryReviewBackend::new(demo_snapshot(config)));
    let cache = Arc::new(ConfiguredCache::from_config(config));
    let mailer = InMemoryMailer::default();
    let service = ReviewService::from_config(backend, cache, Arc::new(mailer.clone()), config);
    (service, mailer)
}

fn id<T>(wrap: fn(String) -> T, raw: &str) -> T {
    wrap(raw.to_string())
}

fn text_field(id_raw: &str, name: &str, label: &str, section: &str, position: u32) -> FormField {
    FormField {
        id: id(FieldId, id_raw),
        name: name.to_string(),
        label: Some(label.to_string()),
        field_type: "text".to_string(),
        section_id: Some(section.to_string()),
        position,
    }
}

fn category(key: &str, label: &str, max_points: u32) -> RubricCategory {
    RubricCategory {
        key: key.to_string(),
        label: label.to_string(),
        max_points,
    }
}

fn role_config(role: &str, min_reviews: u32) -> StageReviewerConfig {
    StageReviewerConfig {
        reviewer_type_id: id(ReviewerTypeId, role),
        min_reviews_required: min_reviews,
        rubric_id: None,
        field_visibility: BTreeMap::new(),
    }
}

fn reviewer(raw_id: &str, name: &str, token: &str, role: &str) -> Reviewer {
    Reviewer {
        id: id(ReviewerId, raw_id),
        name: name.to_string(),
        email: format!("{raw_id}@reviewers.example"),
        token: token.to_string(),
        status: ReviewerStatus::Active,
        reviewer_type_id: Some(id(ReviewerTypeId, role)),
        stage_assignments: Vec::new(),
        assigned_count: 0,
        completed_count: 0,
        can_view_all: false,
        invited_at: None,
        removed_at: None,
    }
}

fn stage(raw_id: &str, name: &str, order_index: i32) -> Stage {
    Stage {
        id: id(StageId, raw_id),
        workflow_id: id(WorkflowId, "scholarship"),
        name: name.to_string(),
        order_index,
        rubric_id: None,
        hide_pii: false,
        hidden_pii_fields: Vec::new(),
        actions: Vec::new(),
        reviewer_configs: Vec::new(),
        auto_advance_condition: None,
        auto_reject_condition: None,
    }
}

/// Scholarship cycle used by `serve`, `demo`, and `export` when no backend is attached.
pub(crate) fn demo_snapshot(config: &ReviewConfig) -> WorkspaceSnapshot {
    let mut blind_read = stage("blind-read", "Blind Read", 1);
    blind_read.hide_pii = true;
    blind_read.hidden_pii_fields = vec!["student_name".to_string(), "email".to_string()];
    blind_read.reviewer_configs = vec![role_config("reader", 2), role_config("finance", 1)];
    blind_read.reviewer_configs[1]
        .field_visibility
        .insert("essay".to_string(), FieldVisibility::Hidden);
    blind_read.reviewer_configs[1]
        .field_visibility
        .insert("household_income".to_string(), FieldVisibility::ScoreOnly);
    blind_read.auto_advance_condition =
        Some("if average_score >= 15 then advance to Interview".to_string());
    blind_read.auto_reject_condition = Some("if average_score < 6 then reject".to_string());
    blind_read.actions = vec![
        StageAction {
            id: id(ActionId, "advance"),
            name: "Advance".to_string(),
            effect: ActionEffect::AdvanceStage,
            requires_comment: false,
        },
        StageAction {
            id: id(ActionId, "waitlist"),
            name: "Waitlist".to_string(),
            effect: ActionEffect::MoveToGroup {
                group_id: id(GroupId, "waitlist"),
            },
            requires_comment: true,
        },
    ];

    let mut interview = stage("interview", "Interview", 2);
    interview.reviewer_configs = vec![role_config("reader", 1)];
    let mut award = stage("award", "Award", 3);
    award.reviewer_configs = vec![role_config("finance", 1)];

    let applicants = [
        ("app-101", "Priya Raman", "Robotics club lead; Priya wants mechatronics.", 41_000),
        ("app-102", "Diego Alvarez", "First in family to apply to university.", 28_500),
        ("app-103", "Hannah Cole", "Runs a weekend coding class at the library.", 63_000),
        ("app-104", "Kwame Mensah", "Volunteer firefighter; Kwame Mensah plans nursing.", 35_200),
        ("app-105", "Sofia Rossi", "Violinist with a community orchestra.", 52_750),
        ("app-106", "Liam O'Brien", "Built a flood-warning sensor for his street.", 30_100),
    ];
    let applications = applicants
        .into_iter()
        .map(|(raw_id, student, essay, income)| {
            let mut application = Application::new(raw_id, format!("{student} application"));
            let email = format!(
                "{}@students.example",
                student.to_lowercase().replace([' ', '\''], ".")
            );
            application.raw_data = BTreeMap::from([
                ("student_name".to_string(), json!(student)),
                ("email".to_string(), json!(email)),
                ("essay".to_string(), json!(essay)),
                ("household_income".to_string(), json!(income)),
            ]);
            application.submitted_at = Some(Utc::now());
            application
        })
        .collect();

    WorkspaceSnapshot {
        form: FormDefinition {
            id: config.form_id.clone(),
            name: "STEM Scholarship 2025".to_string(),
            fields: vec![
                text_field("fld-name", "student_name", "Student name", "about", 1),
                text_field("fld-email", "email", "Email", "about", 2),
                text_field("fld-essay", "essay", "Personal essay", "essay", 3),
                text_field("fld-income", "household_income", "Household income", "finance", 4),
            ],
            sections: vec![
                FormSection {
                    id: "about".to_string(),
                    title: "About you".to_string(),
                },
                FormSection {
                    id: "essay".to_string(),
                    title: "Essay".to_string(),
                },
                FormSection {
                    id: "finance".to_string(),
                    title: "Finances".to_string(),
                },
            ],
            title_field: Some("student_name".to_string()),
            roster: ReviewerRoster {
                version: 1,
                reviewers: vec![
                    reviewer("rev-ada", "Ada Reader", "rev_ada00001", "reader"),
                    reviewer("rev-ben", "Ben Reader", "rev_ben00002", "reader"),
                    Reviewer {
                        stage_assignments: vec![StageRoleAssignment {
                            stage_id: id(StageId, "award"),
                            reviewer_type_id: id(ReviewerTypeId, "finance"),
                        }],
                        ..reviewer("rev-cho", "Cho Finance", "rev_cho00003", "finance")
                    },
                ],
            },
        },
        applications,
        workspace: WorkspaceData {
            workflows: vec![Workflow {
                id: id(WorkflowId, "scholarship"),
                name: "Scholarship".to_string(),
                default_rubric_id: Some(id(RubricId, "merit")),
            }],
            stages: vec![blind_read, interview, award],
            rubrics: vec![Rubric {
                id: id(RubricId, "merit"),
                name: "Merit".to_string(),
                categories: vec![
                    category("academics", "Academics", 10),
                    category("impact", "Community impact", 10),
                ],
                max_score: 20,
            }],
            reviewer_types: vec![
                ReviewerType {
                    id: id(ReviewerTypeId, "reader"),
                    name: "Reader".to_string(),
                },
                ReviewerType {
                    id: id(ReviewerTypeId, "finance"),
                    name: "Finance".to_string(),
                },
            ],
            workflow_actions: vec![WorkflowAction {
                workflow_id: id(WorkflowId, "scholarship"),
                action: StageAction {
                    id: id(ActionId, "withdraw"),
                    name: "Withdrawn".to_string(),
                    effect: ActionEffect::SetStatus { status_value: None },
                    requires_comment: false,
                },
            }],
            groups: vec![Group {
                id: id(GroupId, "waitlist"),
                name: "Waitlist".to_string(),
            }],
            stage_groups: Vec::new(),
        },
    }
}
