//! End-to-end review scenarios driven through the public service and HTTP router.
//!
//! The backend double accepts every write and keeps only the roster version, so these
//! scenarios exercise the engine's own bookkeeping rather than a remote store.

mod common {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use review_engine::workflows::review::domain::{
        ActionEffect, ActionId, Application, ApplicationId, FieldId, FormDefinition, FormField,
        Reviewer, ReviewerId, ReviewerRoster, ReviewerStatus, ReviewerTypeId, Rubric,
        RubricCategory, RubricId, Stage, StageAction, StageId, StageReviewerConfig, Workflow,
        WorkflowId, WorkspaceData, WorkspaceSnapshot,
    };
    use review_engine::workflows::review::{
        ActionRequest, AssignmentReceipt, AssignmentRequest, CacheKey, EmailMessage,
        GatewayError, Mailer, MailerError, MemorySnapshotCache, ReassignRequest, ReviewBackend,
        ReviewDataUpdate, ReviewService,
    };

    pub(super) type Service = ReviewService<AcceptingBackend, MemorySnapshotCache, NullMailer>;

    fn stage(id: &str, name: &str, order_index: i32) -> Stage {
        Stage {
            id: StageId(id.to_string()),
            workflow_id: WorkflowId("grants".to_string()),
            name: name.to_string(),
            order_index,
            rubric_id: None,
            hide_pii: false,
            hidden_pii_fields: Vec::new(),
            actions: Vec::new(),
            reviewer_configs: vec![StageReviewerConfig {
                reviewer_type_id: ReviewerTypeId("committee".to_string()),
                min_reviews_required: 2,
                rubric_id: None,
                field_visibility: BTreeMap::new(),
            }],
            auto_advance_condition: None,
            auto_reject_condition: None,
        }
    }

    fn field(id: &str, name: &str, position: u32) -> FormField {
        FormField {
            id: FieldId(id.to_string()),
            name: name.to_string(),
            label: None,
            field_type: "text".to_string(),
            section_id: None,
            position,
        }
    }

    fn reviewer(id: &str, name: &str, token: &str) -> Reviewer {
        Reviewer {
            id: ReviewerId(id.to_string()),
            name: name.to_string(),
            email: format!("{id}@grants.example"),
            token: token.to_string(),
            status: ReviewerStatus::Active,
            reviewer_type_id: Some(ReviewerTypeId("committee".to_string())),
            stage_assignments: Vec::new(),
            assigned_count: 0,
            completed_count: 0,
            can_view_all: false,
            invited_at: None,
            removed_at: None,
        }
    }

    fn snapshot() -> WorkspaceSnapshot {
        let mut first_round = stage("first-round", "First Round", 1);
        first_round.hide_pii = true;
        first_round.hidden_pii_fields = vec!["applicant_name".to_string()];
        first_round.auto_advance_condition =
            Some("if average_score >= 12 then advance to Shortlist".to_string());
        first_round.actions.push(StageAction {
            id: ActionId("decline".to_string()),
            name: "Decline".to_string(),
            effect: ActionEffect::SetStatus {
                status_value: Some("declined".to_string()),
            },
            requires_comment: false,
        });

        let applications = [
            ("sub-1", "Harbor Youth Rowing", "Maya Chen"),
            ("sub-2", "Eastside Tool Library", "Tom Okafor"),
            ("sub-3", "Night Market Lights", "Ines Duarte"),
        ]
        .into_iter()
        .map(|(id, name, applicant)| {
            let mut application = Application::new(id, name);
            application.raw_data.insert("applicant_name".to_string(), json!(applicant));
            application.raw_data.insert(
                "summary".to_string(),
                json!(format!("{applicant} leads {name}.")),
            );
            application
        })
        .collect();

        WorkspaceSnapshot {
            form: FormDefinition {
                id: "grants-2025".to_string(),
                name: "Neighbourhood Grants".to_string(),
                fields: vec![field("fld-1", "applicant_name", 1), field("fld-2", "summary", 2)],
                sections: Vec::new(),
                title_field: Some("applicant_name".to_string()),
                roster: ReviewerRoster {
                    version: 3,
                    reviewers: vec![
                        reviewer("r-1", "Noor", "rev_noor0001"),
                        reviewer("r-2", "Felix", "rev_felix002"),
                    ],
                },
            },
            applications,
            workspace: WorkspaceData {
                workflows: vec![Workflow {
                    id: WorkflowId("grants".to_string()),
                    name: "Grants".to_string(),
                    default_rubric_id: Some(RubricId("grant-rubric".to_string())),
                }],
                stages: vec![
                    first_round,
                    stage("shortlist", "Shortlist", 2),
                    stage("award", "Award", 3),
                ],
                rubrics: vec![Rubric {
                    id: RubricId("grant-rubric".to_string()),
                    name: "Grant rubric".to_string(),
                    categories: ["need", "impact", "plan"]
                        .into_iter()
                        .map(|key| RubricCategory {
                            key: key.to_string(),
                            label: key.to_string(),
                            max_points: 5,
                        })
                        .collect(),
                    max_score: 15,
                }],
                ..WorkspaceData::default()
            },
        }
    }

    /// Accepts every write and tracks the roster version.
    pub(super) struct AcceptingBackend {
        snapshot: WorkspaceSnapshot,
        version: Mutex<u64>,
    }

    impl AcceptingBackend {
        fn bump(&self, expected: u64) -> Result<u64, GatewayError> {
            let mut version = self.version.lock().expect("version mutex poisoned");
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
    impl ReviewBackend for AcceptingBackend {
        async fn fetch_snapshot(
            &self,
            _key: &CacheKey,
        ) -> Result<WorkspaceSnapshot, GatewayError> {
            Ok(self.snapshot.clone())
        }

        async fn workspace_data(
            &self,
            _workspace_id: &str,
            _workflow_id: Option<&WorkflowId>,
        ) -> Result<WorkspaceData, GatewayError> {
            Ok(self.snapshot.workspace.clone())
        }

        async fn move_to_stage(
            &self,
            _application_id: &ApplicationId,
            _stage_id: &StageId,
            _reason: &str,
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn assign_workflow(
            &self,
            _application_id: &ApplicationId,
            _workflow_id: &WorkflowId,
            _stage_id: &StageId,
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn bulk_assign_workflow(
            &self,
            _application_ids: &[ApplicationId],
            _workflow_id: &WorkflowId,
            _stage_id: &StageId,
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn update_review_data(
            &self,
            _application_id: &ApplicationId,
            _update: &ReviewDataUpdate,
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn execute_action(&self, _request: &ActionRequest) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn assign(
            &self,
            _reviewer_id: &ReviewerId,
            request: &AssignmentRequest,
            expected_version: u64,
        ) -> Result<AssignmentReceipt, GatewayError> {
            let roster_version = self.bump(expected_version)?;
            let application_ids = match request {
                AssignmentRequest::Manual { submission_ids } => submission_ids.clone(),
                AssignmentRequest::Random { .. } => Vec::new(),
            };
            Ok(AssignmentReceipt {
                assigned: application_ids.len(),
                application_ids,
                roster_version,
            })
        }

        async fn reassign(
            &self,
            _request: &ReassignRequest,
            expected_version: u64,
        ) -> Result<u64, GatewayError> {
            self.bump(expected_version)
        }

        async fn save_roster(
            &self,
            _roster: &ReviewerRoster,
            expected_version: u64,
        ) -> Result<u64, GatewayError> {
            self.bump(expected_version)
        }
    }

    pub(super) struct NullMailer;

    impl Mailer for NullMailer {
        fn send(&self, _message: EmailMessage) -> Result<(), MailerError> {
            Ok(())
        }
    }

    pub(super) async fn loaded_service() -> Arc<Service> {
        let snapshot = snapshot();
        let backend = Arc::new(AcceptingBackend {
            version: Mutex::new(snapshot.form.roster.version),
            snapshot,
        });
        let service = ReviewService::new(
            backend,
            Arc::new(MemorySnapshotCache::default()),
            Arc::new(NullMailer),
            CacheKey::new("grants-2025", "ws-grants"),
            Duration::from_secs(60),
            1 << 20,
        );
        service.load().await.expect("initial load");
        Arc::new(service)
    }
}

use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::loaded_service;
use review_engine::workflows::review::domain::{ActionId, ApplicationId, ReviewerId, StageId};
use review_engine::workflows::review::{
    review_router, ManualStrategy, ReviewSubmission, WorkflowId,
};

fn ids(raw: &[&str]) -> Vec<ApplicationId> {
    raw.iter().map(|id| ApplicationId(id.to_string())).collect()
}

fn sheet(need: u32, impact: u32, plan: u32) -> ReviewSubmission {
    ReviewSubmission {
        scores: BTreeMap::from([
            ("need".to_string(), need),
            ("impact".to_string(), impact),
            ("plan".to_string(), plan),
        ]),
        ..ReviewSubmission::default()
    }
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn applications_move_from_intake_to_shortlist_through_committee_scores() {
    let service = loaded_service().await;
    let workflow = WorkflowId("grants".to_string());
    let all = ids(&["sub-1", "sub-2", "sub-3"]);

    let entry = service
        .bulk_assign_workflow(&all, &workflow, None)
        .await
        .expect("workflow assignment");
    assert_eq!(entry, StageId("first-round".to_string()));

    let committee = vec![ReviewerId("r-1".to_string()), ReviewerId("r-2".to_string())];
    let report = service
        .assign_manual(&committee, &all, ManualStrategy::AllToAll)
        .await
        .expect("assignment");
    assert_eq!(report.completed.len(), 2);
    assert!(report.failed.is_none());
    assert_eq!(service.roster().await.version, 5);

    // One review is not enough for the two-review minimum.
    let first = service
        .submit_via_token("rev_noor0001", &all[0], &sheet(5, 4, 4))
        .await
        .expect("first review");
    assert!(first.review.rule.is_none());

    let second = service
        .submit_via_token("rev_felix002", &all[0], &sheet(4, 4, 5))
        .await
        .expect("second review");
    assert!(second.rule_applied);

    let application = service.application(&all[0]).await.expect("present");
    assert_eq!(application.stage_id, Some(StageId("shortlist".to_string())));

    let analytics = service.analytics().await;
    assert_eq!(
        analytics.stage_counts.get(&StageId("first-round".to_string())),
        Some(&2)
    );
    assert_eq!(analytics.applications[0].aggregate_score, Some(13.0));
    assert!(analytics
        .reviewers
        .iter()
        .all(|stats| stats.completed == 1 && stats.assigned == 3));
}

#[tokio::test]
async fn external_reviewers_see_anonymised_assignments_only() {
    let service = loaded_service().await;
    let workflow = WorkflowId("grants".to_string());
    service
        .bulk_assign_workflow(&ids(&["sub-1", "sub-2"]), &workflow, None)
        .await
        .expect("workflow assignment");
    service
        .assign_manual(
            &[ReviewerId("r-1".to_string())],
            &ids(&["sub-2"]),
            ManualStrategy::EqualSplit,
        )
        .await
        .expect("assignment");

    let router = review_router(service.clone());
    let response = router
        .clone()
        .oneshot(
            Request::get("/api/v1/external-review/rev_noor0001")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let session = read_json(response).await;
    let applications = session["applications"].as_array().expect("list");
    assert_eq!(applications.len(), 1);
    assert_eq!(applications[0]["application_id"], json!("sub-2"));
    assert_eq!(applications[0]["title"], json!("Applicant #1"));
    let summary = &applications[0]["sections"][0]["fields"][1]["value"];
    assert_eq!(summary, &json!("██████████ leads Eastside Tool Library."));

    let response = router
        .oneshot(
            Request::post("/api/v1/external-review/rev_noor0001/submit/sub-1")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"scores": {"need": 3}}).to_string()))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn declining_and_exporting_round_out_a_cycle() {
    let service = loaded_service().await;
    let workflow = WorkflowId("grants".to_string());
    service
        .assign_workflow(&ApplicationId("sub-3".to_string()), &workflow, None)
        .await
        .expect("workflow assignment");

    service
        .execute_action(
            &ApplicationId("sub-3".to_string()),
            &ActionId("decline".to_string()),
            Some("outside catchment"),
        )
        .await
        .expect("decline");

    let csv = service.export_csv().await.expect("export");
    let row = csv
        .lines()
        .find(|line| line.starts_with("sub-3,"))
        .expect("declined row");
    assert!(row.starts_with("sub-3,Night Market Lights,declined,First Round,"));

    let application = service
        .application(&ApplicationId("sub-3".to_string()))
        .await
        .expect("present");
    assert_eq!(application.action_history[0].comment, "outside catchment");
}
