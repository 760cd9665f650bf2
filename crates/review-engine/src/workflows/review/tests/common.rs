use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::workflows::review::assignment::{select_random, AssignmentRequest};
use crate::workflows::review::domain::{
    ActionEffect, ActionId, Application, ApplicationId, FieldId, FieldVisibility,
    FormDefinition, FormField, FormSection, Group, GroupId, Reviewer, ReviewerId,
    ReviewerRoster, ReviewerStatus, ReviewerType, ReviewerTypeId, Rubric, RubricCategory,
    RubricId, Stage, StageAction, StageId, StageReviewerConfig, StageRoleAssignment, Workflow,
    WorkflowAction, WorkflowId, WorkspaceData, WorkspaceSnapshot,
};
use crate::workflows::review::repository::{
    ActionRequest, AssignmentReceipt, EmailMessage, GatewayError, Mailer, MailerError,
    ReassignRequest, ReviewBackend, ReviewDataUpdate,
};
use crate::workflows::review::service::ReviewService;
use crate::workflows::review::store::{DataSource, ReviewStore};
use crate::workflows::review::sync::{CacheKey, MemorySnapshotCache};

pub(super) const SCAN_LIMIT: usize = 1 << 20;

pub(super) fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn cache_key() -> CacheKey {
    CacheKey::new("form-grants", "ws-1")
}

fn field(id: &str, name: &str, label: Option<&str>, section: &str, position: u32) -> FormField {
    FormField {
        id: FieldId(id.to_string()),
        name: name.to_string(),
        label: label.map(str::to_string),
        field_type: "text".to_string(),
        section_id: Some(section.to_string()),
        position,
    }
}

pub(super) fn form() -> FormDefinition {
    FormDefinition {
        id: "form-grants".to_string(),
        name: "Community Grants 2025".to_string(),
        fields: vec![
            field("f-name", "full_name", Some("Full Name"), "applicant", 1),
            field("f-email", "email", Some("Email Address"), "applicant", 2),
            field("f-essay", "essay", Some("Personal Statement"), "responses", 3),
            field("f-budget", "budget", Some("Requested Budget"), "responses", 4),
            field("f-notes", "notes_internal", None, "internal", 5),
        ],
        sections: vec![
            FormSection {
                id: "applicant".to_string(),
                title: "Applicant".to_string(),
            },
            FormSection {
                id: "responses".to_string(),
                title: "Responses".to_string(),
            },
            FormSection {
                id: "internal".to_string(),
                title: "Internal".to_string(),
            },
        ],
        title_field: Some("full_name".to_string()),
        roster: roster(),
    }
}

pub(super) fn rubric() -> Rubric {
    Rubric {
        id: RubricId("rubric-main".to_string()),
        name: "Impact rubric".to_string(),
        categories: vec![
            RubricCategory {
                key: "impact".to_string(),
                label: "Impact".to_string(),
                max_points: 5,
            },
            RubricCategory {
                key: "feasibility".to_string(),
                label: "Feasibility".to_string(),
                max_points: 5,
            },
        ],
        max_score: 10,
    }
}

fn stage(id: &str, name: &str, order_index: i32) -> Stage {
    Stage {
        id: StageId(id.to_string()),
        workflow_id: WorkflowId("wf-main".to_string()),
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

pub(super) fn action(id: &str, name: &str, effect: ActionEffect) -> StageAction {
    StageAction {
        id: ActionId(id.to_string()),
        name: name.to_string(),
        effect,
        requires_comment: false,
    }
}

pub(super) fn screening_stage() -> Stage {
    let mut field_visibility = BTreeMap::new();
    field_visibility.insert("notes_internal".to_string(), FieldVisibility::Hidden);
    field_visibility.insert("f-budget".to_string(), FieldVisibility::ScoreOnly);

    let mut hold = action(
        "hold",
        "Hold",
        ActionEffect::MoveToGroup {
            group_id: GroupId("group-hold".to_string()),
        },
    );
    hold.requires_comment = true;

    Stage {
        hide_pii: true,
        hidden_pii_fields: vec!["full_name".to_string(), "f-email".to_string()],
        actions: vec![
            action("advance", "Advance", ActionEffect::AdvanceStage),
            action(
                "shortlist",
                "Shortlist",
                ActionEffect::SetStatus {
                    status_value: Some("shortlisted".to_string()),
                },
            ),
            hold,
        ],
        reviewer_configs: vec![StageReviewerConfig {
            reviewer_type_id: ReviewerTypeId("panel".to_string()),
            min_reviews_required: 1,
            rubric_id: None,
            field_visibility,
        }],
        auto_advance_condition: Some("if average_score >= 8 then advance to Interview".to_string()),
        auto_reject_condition: Some("if average_score < 3 then reject".to_string()),
        ..stage("screening", "Screening", 1)
    }
}

pub(super) fn workspace() -> WorkspaceData {
    let mut final_stage = stage("final", "Final Decision", 3);
    final_stage
        .actions
        .push(action("advance", "Advance", ActionEffect::AdvanceStage));

    WorkspaceData {
        workflows: vec![Workflow {
            id: WorkflowId("wf-main".to_string()),
            name: "Main review".to_string(),
            default_rubric_id: Some(RubricId("rubric-main".to_string())),
        }],
        stages: vec![
            stage("interview", "Interview", 2),
            screening_stage(),
            final_stage,
        ],
        rubrics: vec![rubric()],
        reviewer_types: vec![ReviewerType {
            id: ReviewerTypeId("panel".to_string()),
            name: "Panel".to_string(),
        }],
        workflow_actions: vec![WorkflowAction {
            workflow_id: WorkflowId("wf-main".to_string()),
            action: action(
                "withdraw",
                "Withdrawn",
                ActionEffect::SetStatus { status_value: None },
            ),
        }],
        groups: vec![Group {
            id: GroupId("group-hold".to_string()),
            name: "On Hold".to_string(),
        }],
        stage_groups: Vec::new(),
    }
}

pub(super) fn reviewer(id: &str, name: &str, token: &str) -> Reviewer {
    Reviewer {
        id: ReviewerId(id.to_string()),
        name: name.to_string(),
        email: format!("{id}@example.org"),
        token: token.to_string(),
        status: ReviewerStatus::Active,
        reviewer_type_id: Some(ReviewerTypeId("panel".to_string())),
        stage_assignments: Vec::new(),
        assigned_count: 0,
        completed_count: 0,
        can_view_all: false,
        invited_at: Some(at(8)),
        removed_at: None,
    }
}

pub(super) fn roster() -> ReviewerRoster {
    let mut avery = reviewer("rev-a", "Avery Reviewer", "rev_aaaa1111");
    avery.stage_assignments = vec![StageRoleAssignment {
        stage_id: StageId("screening".to_string()),
        reviewer_type_id: ReviewerTypeId("panel".to_string()),
    }];
    avery.assigned_count = 1;

    let blake = reviewer("rev-b", "Blake Reviewer", "rev_bbbb2222");

    let mut casey = reviewer("rev-c", "Casey Former", "rev_cccc3333");
    casey.status = ReviewerStatus::Removed;
    casey.removed_at = Some(at(9));

    ReviewerRoster {
        version: 1,
        reviewers: vec![avery, blake, casey],
    }
}

pub(super) fn application(id: &str, name: &str, stage: Option<&str>) -> Application {
    let mut application = Application::new(id, name);
    if let Some(stage) = stage {
        application.workflow_id = Some(WorkflowId("wf-main".to_string()));
        application.stage_id = Some(StageId(stage.to_string()));
    }
    application.submitted_at = Some(at(7));
    application.revision = 1;
    application
}

fn answers(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

pub(super) fn applications() -> Vec<Application> {
    let mut jane = application("app-1", "Jane Doe", Some("screening"));
    jane.raw_data = answers(&[
        ("full_name", json!("Jane Doe")),
        ("email", json!("jane.doe@example.org")),
        ("essay", json!("I am Jane and I grew up near Doe Farm.")),
        ("budget", json!(1200)),
        ("notes_internal", json!("flag for finance")),
    ]);
    jane.assigned_reviewers = BTreeSet::from([ReviewerId("rev-a".to_string())]);
    jane.reviewer_info.insert(
        ReviewerId("rev-a".to_string()),
        roster().reviewers[0].contact(),
    );

    let mut omar = application("app-2", "Omar Said", Some("screening"));
    omar.raw_data = answers(&[
        ("full_name", json!("Omar Said")),
        ("email", json!("omar@example.org")),
        ("essay", json!("Community garden proposal")),
        ("budget", json!(800)),
    ]);

    let mut lena = application("app-3", "Lena Park", Some("interview"));
    lena.raw_data = answers(&[
        ("full_name", json!("Lena Park")),
        ("essay", json!("Mentoring program")),
    ]);

    let mut sam = application("app-4", "Sam Lee", None);
    sam.raw_data = answers(&[("full_name", json!("Sam Lee")), ("_source", json!("import"))]);

    vec![jane, omar, lena, sam]
}

pub(super) fn snapshot() -> WorkspaceSnapshot {
    WorkspaceSnapshot {
        form: form(),
        applications: applications(),
        workspace: workspace(),
    }
}

pub(super) fn store() -> ReviewStore {
    ReviewStore::from_snapshot(snapshot(), DataSource::Fetch)
}

pub(super) fn app_id(id: &str) -> ApplicationId {
    ApplicationId(id.to_string())
}

pub(super) fn reviewer_id(id: &str) -> ReviewerId {
    ReviewerId(id.to_string())
}

pub(super) fn stage_id(id: &str) -> StageId {
    StageId(id.to_string())
}

pub(super) type TestService = ReviewService<MemoryBackend, MemorySnapshotCache, MemoryMailer>;

pub(super) fn build_service() -> (
    TestService,
    Arc<MemoryBackend>,
    Arc<MemorySnapshotCache>,
    Arc<MemoryMailer>,
) {
    let backend = Arc::new(MemoryBackend::new(snapshot()));
    let cache = Arc::new(MemorySnapshotCache::default());
    let mailer = Arc::new(MemoryMailer::default());
    let service = ReviewService::new(
        backend.clone(),
        cache.clone(),
        mailer.clone(),
        cache_key(),
        Duration::from_secs(120),
        SCAN_LIMIT,
    );
    (service, backend, cache, mailer)
}

pub(super) async fn loaded_service() -> (TestService, Arc<MemoryBackend>, Arc<MemoryMailer>) {
    let (service, backend, _cache, mailer) = build_service();
    service.load().await.expect("initial load");
    (service, backend, mailer)
}

/// Backend double holding its own copy of the workspace.
pub(super) struct MemoryBackend {
    snapshot: Mutex<WorkspaceSnapshot>,
    roster_version: Mutex<u64>,
    calls: Mutex<Vec<String>>,
    failure: Mutex<Option<GatewayError>>,
    assign_budget: Mutex<Option<usize>>,
    fetch_gate: Mutex<Option<Arc<Notify>>>,
    pub(super) updates: Mutex<Vec<(ApplicationId, ReviewDataUpdate)>>,
    pub(super) actions: Mutex<Vec<ActionRequest>>,
}

impl MemoryBackend {
    pub(super) fn new(snapshot: WorkspaceSnapshot) -> Self {
        let version = snapshot.form.roster.version;
        Self {
            snapshot: Mutex::new(snapshot),
            roster_version: Mutex::new(version),
            calls: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            assign_budget: Mutex::new(None),
            fetch_gate: Mutex::new(None),
            updates: Mutex::new(Vec::new()),
            actions: Mutex::new(Vec::new()),
        }
    }

    /// Every later call fails with `error`.
    pub(super) fn fail_with(&self, error: GatewayError) {
        *self.failure.lock().expect("failure mutex poisoned") = Some(error);
    }

    pub(super) fn recover(&self) {
        *self.failure.lock().expect("failure mutex poisoned") = None;
    }

    /// Only the next `count` assignment calls succeed.
    pub(super) fn allow_assignments(&self, count: usize) {
        *self.assign_budget.lock().expect("budget mutex poisoned") = Some(count);
    }

    /// Fetches block until the returned handle is notified.
    pub(super) fn gate_fetches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.fetch_gate.lock().expect("gate mutex poisoned") = Some(gate.clone());
        gate
    }

    /// Simulates another editor saving the roster.
    pub(super) fn bump_roster_version(&self) {
        *self.roster_version.lock().expect("version mutex poisoned") += 1;
    }

    pub(super) fn replace_snapshot(&self, snapshot: WorkspaceSnapshot) {
        *self.snapshot.lock().expect("snapshot mutex poisoned") = snapshot;
    }

    pub(super) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    fn enter(&self, operation: &str) -> Result<(), GatewayError> {
        self.calls
            .lock()
            .expect("calls mutex poisoned")
            .push(operation.to_string());
        match self.failure.lock().expect("failure mutex poisoned").clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn bump_version(&self, expected: u64) -> Result<u64, GatewayError> {
        let mut version = self.roster_version.lock().expect("version mutex poisoned");
        if *version != expected {
            return Err(GatewayError::Conflict {
                expected,
                actual: *version,
            });
        }
        *version += 1;
        Ok(*version)
    }
}

#[async_trait]
impl ReviewBackend for MemoryBackend {
    async fn fetch_snapshot(&self, _key: &CacheKey) -> Result<WorkspaceSnapshot, GatewayError> {
        self.enter("fetch_snapshot")?;
        let gate = self.fetch_gate.lock().expect("gate mutex poisoned").clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.snapshot.lock().expect("snapshot mutex poisoned").clone())
    }

    async fn workspace_data(
        &self,
        _workspace_id: &str,
        _workflow_id: Option<&WorkflowId>,
    ) -> Result<WorkspaceData, GatewayError> {
        self.enter("workspace_data")?;
        Ok(self
            .snapshot
            .lock()
            .expect("snapshot mutex poisoned")
            .workspace
            .clone())
    }

    async fn move_to_stage(
        &self,
        _application_id: &ApplicationId,
        _stage_id: &StageId,
        _reason: &str,
    ) -> Result<(), GatewayError> {
        self.enter("move_to_stage")
    }

    async fn assign_workflow(
        &self,
        _application_id: &ApplicationId,
        _workflow_id: &WorkflowId,
        _stage_id: &StageId,
    ) -> Result<(), GatewayError> {
        self.enter("assign_workflow")
    }

    async fn bulk_assign_workflow(
        &self,
        _application_ids: &[ApplicationId],
        _workflow_id: &WorkflowId,
        _stage_id: &StageId,
    ) -> Result<(), GatewayError> {
        self.enter("bulk_assign_workflow")
    }

    async fn update_review_data(
        &self,
        application_id: &ApplicationId,
        update: &ReviewDataUpdate,
    ) -> Result<(), GatewayError> {
        self.enter("update_review_data")?;
        self.updates
            .lock()
            .expect("updates mutex poisoned")
            .push((application_id.clone(), update.clone()));
        Ok(())
    }

    async fn execute_action(&self, request: &ActionRequest) -> Result<(), GatewayError> {
        self.enter("execute_action")?;
        self.actions
            .lock()
            .expect("actions mutex poisoned")
            .push(request.clone());
        Ok(())
    }

    async fn assign(
        &self,
        reviewer_id: &ReviewerId,
        request: &AssignmentRequest,
        expected_version: u64,
    ) -> Result<AssignmentReceipt, GatewayError> {
        self.enter("assign")?;
        {
            let mut budget = self.assign_budget.lock().expect("budget mutex poisoned");
            match budget.as_mut() {
                Some(0) => return Err(GatewayError::Transport("connection reset".to_string())),
                Some(remaining) => *remaining -= 1,
                None => {}
            }
        }
        let roster_version = self.bump_version(expected_version)?;

        let mut snapshot = self.snapshot.lock().expect("snapshot mutex poisoned");
        let picked = match request {
            AssignmentRequest::Random {
                count,
                only_unassigned,
            } => {
                let mut rng = StdRng::seed_from_u64(7);
                select_random(
                    &snapshot.applications,
                    reviewer_id,
                    *count,
                    *only_unassigned,
                    &mut rng,
                )
            }
            AssignmentRequest::Manual { submission_ids } => submission_ids.clone(),
        };
        for application in snapshot
            .applications
            .iter_mut()
            .filter(|application| picked.contains(&application.id))
        {
            application.assigned_reviewers.insert(reviewer_id.clone());
        }

        Ok(AssignmentReceipt {
            assigned: picked.len(),
            application_ids: picked,
            roster_version,
        })
    }

    async fn reassign(
        &self,
        _request: &ReassignRequest,
        expected_version: u64,
    ) -> Result<u64, GatewayError> {
        self.enter("reassign")?;
        self.bump_version(expected_version)
    }

    async fn save_roster(
        &self,
        _roster: &ReviewerRoster,
        expected_version: u64,
    ) -> Result<u64, GatewayError> {
        self.enter("save_roster")?;
        self.bump_version(expected_version)
    }
}

#[derive(Default)]
pub(super) struct MemoryMailer {
    sent: Mutex<Vec<EmailMessage>>,
    offline: Mutex<bool>,
}

impl MemoryMailer {
    pub(super) fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().expect("mailer mutex poisoned").clone()
    }

    pub(super) fn go_offline(&self) {
        *self.offline.lock().expect("mailer mutex poisoned") = true;
    }
}

impl Mailer for MemoryMailer {
    fn send(&self, message: EmailMessage) -> Result<(), MailerError> {
        if *self.offline.lock().expect("mailer mutex poisoned") {
            return Err(MailerError::Transport("smtp relay down".to_string()));
        }
        self.sent
            .lock()
            .expect("mailer mutex poisoned")
            .push(message);
        Ok(())
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 64)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
