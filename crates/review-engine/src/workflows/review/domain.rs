use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier wrapper for submitted applications.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApplicationId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReviewerId(pub String);

/// Reviewer role (for example "Committee" or "Finance") configured per stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReviewerTypeId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RubricId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldId(pub String);

/// A submitted application moving through a review workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    #[serde(default)]
    pub name: String,
    /// Submitted answers keyed by field name (or label for older submissions).
    #[serde(default)]
    pub raw_data: BTreeMap<String, Value>,
    #[serde(default)]
    pub workflow_id: Option<WorkflowId>,
    #[serde(default)]
    pub stage_id: Option<StageId>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub status: String,
    /// Category inputs from the most recent score update.
    #[serde(default)]
    pub scores: BTreeMap<String, u32>,
    #[serde(default)]
    pub reviews: Vec<ReviewEntry>,
    #[serde(default)]
    pub assigned_reviewers: BTreeSet<ReviewerId>,
    #[serde(default)]
    pub reviewer_info: BTreeMap<ReviewerId, ReviewerContact>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub flagged: bool,
    #[serde(default)]
    pub reassignments: Vec<ReassignmentRecord>,
    #[serde(default)]
    pub stage_history: Vec<StageTransition>,
    #[serde(default)]
    pub action_history: Vec<ActionRecord>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    /// Monotonic stamp bumped by the backend on every write.
    #[serde(default)]
    pub revision: u64,
}

impl Application {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ApplicationId(id.into()),
            name: name.into(),
            raw_data: BTreeMap::new(),
            workflow_id: None,
            stage_id: None,
            group_id: None,
            status: "pending".to_string(),
            scores: BTreeMap::new(),
            reviews: Vec::new(),
            assigned_reviewers: BTreeSet::new(),
            reviewer_info: BTreeMap::new(),
            tags: Vec::new(),
            flagged: false,
            reassignments: Vec::new(),
            stage_history: Vec::new(),
            action_history: Vec::new(),
            submitted_at: None,
            revision: 0,
        }
    }

    pub fn review_by(&self, reviewer: &ReviewerId) -> Option<&ReviewEntry> {
        self.reviews
            .iter()
            .find(|entry| &entry.reviewer_id == reviewer)
    }

    /// Entries that count toward analytics and logic rules.
    pub fn completed_reviews(&self) -> impl Iterator<Item = &ReviewEntry> {
        self.reviews.iter().filter(|entry| !entry.is_draft)
    }

    pub fn is_unassigned(&self) -> bool {
        self.assigned_reviewers.is_empty()
    }
}

/// Contact snapshot stored alongside an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerContact {
    pub name: String,
    pub email: String,
}

/// One reviewer's submission against one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub reviewer_id: ReviewerId,
    /// Name at submission time; survives removal of the reviewer record.
    #[serde(default)]
    pub reviewer_name: String,
    #[serde(default)]
    pub scores: BTreeMap<String, u32>,
    #[serde(default)]
    pub total_score: Option<i64>,
    #[serde(default)]
    pub overall_comment: String,
    #[serde(default)]
    pub criteria_comments: BTreeMap<String, String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub is_draft: bool,
}

/// Immutable audit record of a reassignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassignmentRecord {
    pub from: ReviewerId,
    pub to: ReviewerId,
    pub note: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: Option<StageId>,
    pub to: StageId,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: ActionId,
    pub action_name: String,
    pub comment: String,
    pub at: DateTime<Utc>,
}

/// How a stage exposes one field to a reviewer role.
///
/// Configurations written before the three-way mode store a boolean; `false` means hidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "VisibilitySetting")]
pub enum FieldVisibility {
    #[default]
    Visible,
    Hidden,
    ScoreOnly,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VisibilitySetting {
    Flag(bool),
    Mode(String),
}

impl TryFrom<VisibilitySetting> for FieldVisibility {
    type Error = String;

    fn try_from(value: VisibilitySetting) -> Result<Self, Self::Error> {
        match value {
            VisibilitySetting::Flag(true) => Ok(Self::Visible),
            VisibilitySetting::Flag(false) => Ok(Self::Hidden),
            VisibilitySetting::Mode(mode) => match mode.trim().to_ascii_lowercase().as_str() {
                "visible" | "" => Ok(Self::Visible),
                "hidden" => Ok(Self::Hidden),
                "score_only" => Ok(Self::ScoreOnly),
                other => Err(format!("unknown field visibility `{other}`")),
            },
        }
    }
}

fn one() -> u32 {
    1
}

/// Per-role settings a stage applies to its reviewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReviewerConfig {
    pub reviewer_type_id: ReviewerTypeId,
    #[serde(default = "one")]
    pub min_reviews_required: u32,
    #[serde(default)]
    pub rubric_id: Option<RubricId>,
    #[serde(default)]
    pub field_visibility: BTreeMap<String, FieldVisibility>,
}

/// Declared effect of a stage or workflow action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ActionEffect {
    #[serde(alias = "move_to_stage")]
    AdvanceStage,
    SetStatus {
        #[serde(default)]
        status_value: Option<String>,
    },
    MoveToGroup {
        group_id: GroupId,
    },
}

impl ActionEffect {
    pub fn tag(&self) -> &'static str {
        match self {
            ActionEffect::AdvanceStage => "advance_stage",
            ActionEffect::SetStatus { .. } => "set_status",
            ActionEffect::MoveToGroup { .. } => "move_to_group",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAction {
    pub id: ActionId,
    pub name: String,
    #[serde(flatten)]
    pub effect: ActionEffect,
    #[serde(default)]
    pub requires_comment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowAction {
    pub workflow_id: WorkflowId,
    #[serde(flatten)]
    pub action: StageAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub workflow_id: WorkflowId,
    pub name: String,
    pub order_index: i32,
    #[serde(default)]
    pub rubric_id: Option<RubricId>,
    #[serde(default)]
    pub hide_pii: bool,
    /// Field ids, names, or labels whose values are sensitive at this stage.
    #[serde(default)]
    pub hidden_pii_fields: Vec<String>,
    #[serde(default)]
    pub actions: Vec<StageAction>,
    #[serde(default)]
    pub reviewer_configs: Vec<StageReviewerConfig>,
    #[serde(default)]
    pub auto_advance_condition: Option<String>,
    #[serde(default)]
    pub auto_reject_condition: Option<String>,
}

impl Stage {
    /// A non-empty hidden-field list turns redaction on even when the flag is off.
    pub fn redacts_pii(&self) -> bool {
        self.hide_pii || !self.hidden_pii_fields.is_empty()
    }

    /// Config for the role, falling back to the first configured role.
    pub fn reviewer_config(&self, role: Option<&ReviewerTypeId>) -> Option<&StageReviewerConfig> {
        role.and_then(|role| {
            self.reviewer_configs
                .iter()
                .find(|config| &config.reviewer_type_id == role)
        })
        .or_else(|| self.reviewer_configs.first())
    }

    pub fn min_reviews_required(&self, role: Option<&ReviewerTypeId>) -> u32 {
        self.reviewer_config(role)
            .map(|config| config.min_reviews_required.max(1))
            .unwrap_or(1)
    }

    pub fn serves_role(&self, role: &ReviewerTypeId) -> bool {
        self.reviewer_configs
            .iter()
            .any(|config| &config.reviewer_type_id == role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub default_rubric_id: Option<RubricId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RubricCategory {
    pub key: String,
    #[serde(default)]
    pub label: String,
    pub max_points: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rubric {
    pub id: RubricId,
    pub name: String,
    pub categories: Vec<RubricCategory>,
    pub max_score: u32,
}

impl Rubric {
    pub fn category(&self, key: &str) -> Option<&RubricCategory> {
        self.categories.iter().find(|category| category.key == key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerType {
    pub id: ReviewerTypeId,
    pub name: String,
}

/// Named parking bucket outside the stage order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageGroup {
    pub stage_id: StageId,
    pub group_id: GroupId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerStatus {
    Active,
    Completed,
    Expired,
    #[serde(alias = "archived")]
    Removed,
}

impl ReviewerStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ReviewerStatus::Active => "active",
            ReviewerStatus::Completed => "completed",
            ReviewerStatus::Expired => "expired",
            ReviewerStatus::Removed => "removed",
        }
    }

    /// Whether a token held by a reviewer in this state still opens a session.
    pub fn admits_session(&self) -> bool {
        matches!(self, ReviewerStatus::Active | ReviewerStatus::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRoleAssignment {
    pub stage_id: StageId,
    pub reviewer_type_id: ReviewerTypeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reviewer {
    pub id: ReviewerId,
    pub name: String,
    pub email: String,
    pub token: String,
    pub status: ReviewerStatus,
    #[serde(default)]
    pub reviewer_type_id: Option<ReviewerTypeId>,
    #[serde(default)]
    pub stage_assignments: Vec<StageRoleAssignment>,
    #[serde(default)]
    pub assigned_count: u32,
    #[serde(default)]
    pub completed_count: u32,
    #[serde(default)]
    pub can_view_all: bool,
    #[serde(default)]
    pub invited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub removed_at: Option<DateTime<Utc>>,
}

impl Reviewer {
    /// Role for a stage: the stage-specific assignment, else the primary role.
    pub fn role_for(&self, stage: &StageId) -> Option<&ReviewerTypeId> {
        self.stage_assignments
            .iter()
            .find(|assignment| &assignment.stage_id == stage)
            .map(|assignment| &assignment.reviewer_type_id)
            .or(self.reviewer_type_id.as_ref())
    }

    pub fn contact(&self) -> ReviewerContact {
        ReviewerContact {
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

/// Workspace-level reviewer document guarded by an optimistic version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerRoster {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub reviewers: Vec<Reviewer>,
}

impl ReviewerRoster {
    pub fn get(&self, id: &ReviewerId) -> Option<&Reviewer> {
        self.reviewers.iter().find(|reviewer| &reviewer.id == id)
    }

    pub fn get_mut(&mut self, id: &ReviewerId) -> Option<&mut Reviewer> {
        self.reviewers.iter_mut().find(|reviewer| &reviewer.id == id)
    }

    pub fn by_token(&self, token: &str) -> Option<&Reviewer> {
        self.reviewers.iter().find(|reviewer| reviewer.token == token)
    }

    /// Roster view that hides archived reviewers.
    pub fn active(&self) -> impl Iterator<Item = &Reviewer> {
        self.reviewers
            .iter()
            .filter(|reviewer| reviewer.status != ReviewerStatus::Removed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub id: FieldId,
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "text_field")]
    pub field_type: String,
    #[serde(default)]
    pub section_id: Option<String>,
    #[serde(default)]
    pub position: u32,
}

fn text_field() -> String {
    "text".to_string()
}

impl FormField {
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    /// True when any of the field's three identifiers appears in `keys`.
    pub fn matches_any(&self, keys: &[String]) -> bool {
        keys.iter().any(|key| {
            key == &self.id.0 || key == &self.name || self.label.as_deref() == Some(key.as_str())
        })
    }

    /// Raw submitted value, looked up by name then label then id.
    pub fn value_in<'a>(&self, raw_data: &'a BTreeMap<String, Value>) -> Option<&'a Value> {
        raw_data
            .get(&self.name)
            .or_else(|| self.label.as_ref().and_then(|label| raw_data.get(label)))
            .or_else(|| raw_data.get(&self.id.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormSection {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FormField>,
    #[serde(default)]
    pub sections: Vec<FormSection>,
    /// Field configured as the display title of each application.
    #[serde(default)]
    pub title_field: Option<String>,
    #[serde(default)]
    pub roster: ReviewerRoster,
}

/// Workflow configuration returned by the workspace data fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceData {
    #[serde(default)]
    pub workflows: Vec<Workflow>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub rubrics: Vec<Rubric>,
    #[serde(default)]
    pub reviewer_types: Vec<ReviewerType>,
    #[serde(default)]
    pub workflow_actions: Vec<WorkflowAction>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub stage_groups: Vec<StageGroup>,
}

impl WorkspaceData {
    pub fn workflow(&self, id: &WorkflowId) -> Option<&Workflow> {
        self.workflows.iter().find(|workflow| &workflow.id == id)
    }

    pub fn stage(&self, id: &StageId) -> Option<&Stage> {
        self.stages.iter().find(|stage| &stage.id == id)
    }

    pub fn rubric(&self, id: &RubricId) -> Option<&Rubric> {
        self.rubrics.iter().find(|rubric| &rubric.id == id)
    }

    pub fn group(&self, id: &GroupId) -> Option<&Group> {
        self.groups.iter().find(|group| &group.id == id)
    }

    /// Rubric for a role at a stage: role config, then stage, then workflow default.
    pub fn rubric_for(&self, stage: &Stage, role: Option<&ReviewerTypeId>) -> Option<&Rubric> {
        let role_rubric = role
            .and_then(|role| {
                stage
                    .reviewer_configs
                    .iter()
                    .find(|config| &config.reviewer_type_id == role)
            })
            .and_then(|config| config.rubric_id.as_ref());

        role_rubric
            .or(stage.rubric_id.as_ref())
            .or_else(|| {
                self.workflow(&stage.workflow_id)
                    .and_then(|workflow| workflow.default_rubric_id.as_ref())
            })
            .and_then(|id| self.rubric(id))
    }

    pub fn workflow_actions<'a>(
        &'a self,
        workflow: &'a WorkflowId,
    ) -> impl Iterator<Item = &'a StageAction> + 'a {
        self.workflow_actions
            .iter()
            .filter(move |entry| &entry.workflow_id == workflow)
            .map(|entry| &entry.action)
    }
}

/// Everything the engine needs for one `(form, workspace)` pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub form: FormDefinition,
    #[serde(rename = "submissions", default)]
    pub applications: Vec<Application>,
    #[serde(rename = "workflow", default)]
    pub workspace: WorkspaceData,
}
