use std::collections::BTreeMap;

use super::common::*;
use crate::workflows::review::domain::{
    ActionEffect, ActionId, GroupId, ReviewEntry, ReviewerTypeId, WorkflowId,
};
use crate::workflows::review::pipeline::{
    assign_workflow, evaluate_rules, execute_action, move_to_stage, set_status, ActionOutcome,
    Comparison, Condition, ConditionParseError, Metric, PipelineError, RuleDecision,
    StagePipeline,
};
use crate::workflows::review::store::ReviewStore;

fn wf_main() -> WorkflowId {
    WorkflowId("wf-main".to_string())
}

fn completed(reviewer: &str, total: i64) -> ReviewEntry {
    ReviewEntry {
        reviewer_id: reviewer_id(reviewer),
        reviewer_name: reviewer.to_string(),
        scores: BTreeMap::new(),
        total_score: Some(total),
        overall_comment: String::new(),
        criteria_comments: BTreeMap::new(),
        status: None,
        tags: Vec::new(),
        submitted_at: at(10),
        is_draft: false,
    }
}

fn with_reviews(store: &mut ReviewStore, application: &str, totals: &[i64]) {
    if let Some(application) = store.application_mut(&app_id(application)) {
        application.reviews = totals
            .iter()
            .enumerate()
            .map(|(index, total)| completed(&format!("rev-{index}"), *total))
            .collect();
    }
}

#[test]
fn stages_are_ordered_by_index() {
    let workspace = workspace();
    let pipeline = StagePipeline::new(&workspace, &wf_main()).expect("pipeline");

    let order: Vec<&str> = pipeline
        .stages()
        .iter()
        .map(|stage| stage.id.0.as_str())
        .collect();
    assert_eq!(order, vec!["screening", "interview", "final"]);
    assert_eq!(
        pipeline.next_after(None).map(|stage| stage.id.clone()),
        Some(stage_id("screening"))
    );
    assert!(pipeline.next_after(Some(&stage_id("final"))).is_none());
}

#[test]
fn stage_names_match_exactly_before_partially() {
    let workspace = workspace();
    let pipeline = StagePipeline::new(&workspace, &wf_main()).expect("pipeline");

    assert_eq!(
        pipeline.find_by_name(" interview ").map(|stage| stage.id.clone()),
        Some(stage_id("interview"))
    );
    assert_eq!(
        pipeline.find_by_name("final").map(|stage| stage.id.clone()),
        Some(stage_id("final"))
    );
    assert!(pipeline.find_by_name("committee").is_none());
}

#[test]
fn unknown_workflow_is_rejected() {
    let workspace = workspace();
    match StagePipeline::new(&workspace, &WorkflowId("wf-x".to_string())) {
        Err(PipelineError::UnknownWorkflow(id)) => assert_eq!(id, "wf-x"),
        other => panic!("expected unknown workflow, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn move_jumps_and_keeps_counts_in_step() {
    let mut store = store();
    let transition = move_to_stage(
        &mut store,
        &app_id("app-1"),
        &stage_id("final"),
        "fast track",
        at(11),
    )
    .expect("move");

    assert_eq!(transition.from, Some(stage_id("screening")));
    assert_eq!(store.stage_count(&stage_id("screening")), 1);
    assert_eq!(store.stage_count(&stage_id("final")), 1);
    let application = store.application(&app_id("app-1")).expect("application");
    assert_eq!(application.stage_history, vec![transition]);
}

#[test]
fn move_outside_the_workflow_fails() {
    let mut store = store();
    assert!(matches!(
        move_to_stage(&mut store, &app_id("app-1"), &stage_id("elsewhere"), "", at(11)),
        Err(PipelineError::StageNotInWorkflow { .. })
    ));
    assert_eq!(
        move_to_stage(&mut store, &app_id("app-4"), &stage_id("final"), "", at(11)),
        Err(PipelineError::Unassigned("app-4".to_string()))
    );
}

#[test]
fn workflow_assignment_enters_at_first_stage_by_default() {
    let mut store = store();
    let entry = assign_workflow(&mut store, &[app_id("app-4")], &wf_main(), None, at(11))
        .expect("assign");

    assert_eq!(entry, stage_id("screening"));
    assert_eq!(store.stage_count(&stage_id("screening")), 3);
    let application = store.application(&app_id("app-4")).expect("application");
    assert_eq!(application.workflow_id, Some(wf_main()));
    assert_eq!(application.stage_history.len(), 1);
    assert_eq!(application.stage_history[0].from, None);
}

#[test]
fn workflow_assignment_accepts_explicit_stage() {
    let mut store = store();
    let ids = [app_id("app-2"), app_id("app-4")];
    let entry = assign_workflow(&mut store, &ids, &wf_main(), Some(&stage_id("interview")), at(11))
        .expect("assign");

    assert_eq!(entry, stage_id("interview"));
    assert_eq!(store.stage_count(&stage_id("interview")), 3);
    assert_eq!(store.stage_count(&stage_id("screening")), 1);
}

#[test]
fn workflow_assignment_validates_every_id_first() {
    let mut store = store();
    let before = store.clone();
    let ids = [app_id("app-4"), app_id("app-9")];

    assert_eq!(
        assign_workflow(&mut store, &ids, &wf_main(), None, at(11)),
        Err(PipelineError::ApplicationNotFound("app-9".to_string()))
    );
    assert_eq!(store, before);
}

#[test]
fn advance_action_moves_to_next_stage() {
    let mut store = store();
    let outcome = execute_action(
        &mut store,
        &app_id("app-1"),
        &ActionId("advance".to_string()),
        None,
        at(11),
    )
    .expect("advance");

    assert_eq!(
        outcome,
        ActionOutcome::Moved {
            from: Some(stage_id("screening")),
            to: stage_id("interview"),
        }
    );
    let application = store.application(&app_id("app-1")).expect("application");
    assert_eq!(application.action_history.len(), 1);
    assert_eq!(application.action_history[0].comment, "");
}

#[test]
fn advance_at_last_stage_changes_nothing_but_history() {
    let mut store = store();
    move_to_stage(&mut store, &app_id("app-2"), &stage_id("final"), "", at(10)).expect("move");

    let outcome = execute_action(
        &mut store,
        &app_id("app-2"),
        &ActionId("advance".to_string()),
        Some("  done  "),
        at(11),
    )
    .expect("advance");

    assert_eq!(
        outcome,
        ActionOutcome::AtLastStage {
            stage: Some(stage_id("final"))
        }
    );
    let application = store.application(&app_id("app-2")).expect("application");
    assert_eq!(application.stage_id, Some(stage_id("final")));
    assert_eq!(application.action_history[0].comment, "done");
}

#[test]
fn set_status_action_uses_value_or_lowercased_name() {
    let mut store = store();
    let outcome = execute_action(
        &mut store,
        &app_id("app-1"),
        &ActionId("shortlist".to_string()),
        None,
        at(11),
    )
    .expect("shortlist");
    assert_eq!(
        outcome,
        ActionOutcome::StatusSet {
            status: "shortlisted".to_string()
        }
    );

    let outcome = execute_action(
        &mut store,
        &app_id("app-2"),
        &ActionId("withdraw".to_string()),
        None,
        at(11),
    )
    .expect("workflow action");
    assert_eq!(
        outcome,
        ActionOutcome::StatusSet {
            status: "withdrawn".to_string()
        }
    );
    assert_eq!(
        store.application(&app_id("app-2")).map(|a| a.status.as_str()),
        Some("withdrawn")
    );
}

#[test]
fn group_action_requires_comment_and_parks_application() {
    let mut store = store();
    let hold = ActionId("hold".to_string());

    assert_eq!(
        execute_action(&mut store, &app_id("app-1"), &hold, Some("   "), at(11)),
        Err(PipelineError::CommentRequired("Hold".to_string()))
    );

    let outcome = execute_action(&mut store, &app_id("app-1"), &hold, Some("budget query"), at(11))
        .expect("hold");
    assert_eq!(
        outcome,
        ActionOutcome::MovedToGroup {
            group_id: GroupId("group-hold".to_string()),
            status: "on hold".to_string(),
        }
    );
    let application = store.application(&app_id("app-1")).expect("application");
    assert_eq!(application.group_id, Some(GroupId("group-hold".to_string())));
    assert_eq!(application.stage_id, Some(stage_id("screening")));
}

#[test]
fn actions_from_other_stages_are_unknown() {
    let mut store = store();
    assert_eq!(
        execute_action(
            &mut store,
            &app_id("app-3"),
            &ActionId("shortlist".to_string()),
            None,
            at(11)
        ),
        Err(PipelineError::UnknownAction("shortlist".to_string()))
    );
}

#[test]
fn missing_group_is_reported() {
    let mut snapshot = snapshot();
    if let Some(stage) = snapshot
        .workspace
        .stages
        .iter_mut()
        .find(|stage| stage.id == stage_id("screening"))
    {
        stage.actions.push(action(
            "archive",
            "Archive",
            ActionEffect::MoveToGroup {
                group_id: GroupId("group-gone".to_string()),
            },
        ));
    }
    let mut store = ReviewStore::from_snapshot(snapshot, Default::default());

    assert_eq!(
        execute_action(
            &mut store,
            &app_id("app-1"),
            &ActionId("archive".to_string()),
            None,
            at(11)
        ),
        Err(PipelineError::UnknownGroup("group-gone".to_string()))
    );
}

#[test]
fn set_status_records_same_stage_transition() {
    let mut store = store();
    set_status(&mut store, &app_id("app-1"), "rejected", "auto-reject", at(11)).expect("status");

    let application = store.application(&app_id("app-1")).expect("application");
    assert_eq!(application.status, "rejected");
    let transition = &application.stage_history[0];
    assert_eq!(transition.from.as_ref(), Some(&transition.to));
}

#[test]
fn conditions_parse_metric_operator_and_target() {
    let condition =
        Condition::parse("IF avg >= 7.5 THEN advance to Final Decision").expect("condition");
    assert_eq!(condition.metric, Metric::AverageScore);
    assert_eq!(condition.comparison, Comparison::AtLeast);
    assert_eq!(condition.threshold, 7.5);
    assert_eq!(condition.target_stage.as_deref(), Some("Final Decision"));
    assert!(condition.holds(7.5, 0.0));
    assert!(!condition.holds(7.4, 100.0));

    let condition = Condition::parse("if total_score != 0 then reject").expect("condition");
    assert_eq!(condition.metric, Metric::TotalScore);
    assert!(condition.target_stage.is_none());
    assert!(condition.holds(0.0, 3.0));
}

#[test]
fn malformed_conditions_are_errors() {
    assert!(matches!(
        Condition::parse("average above eight"),
        Err(ConditionParseError::Malformed(_))
    ));
    assert_eq!(
        Condition::parse("if median > 3 then reject"),
        Err(ConditionParseError::UnknownMetric("median".to_string()))
    );
}

#[test]
fn rules_wait_for_minimum_reviews() {
    let mut snapshot = snapshot();
    if let Some(stage) = snapshot
        .workspace
        .stages
        .iter_mut()
        .find(|stage| stage.id == stage_id("screening"))
    {
        stage.reviewer_configs[0].min_reviews_required = 2;
    }
    let mut store = ReviewStore::from_snapshot(snapshot, Default::default());
    let panel = ReviewerTypeId("panel".to_string());

    with_reviews(&mut store, "app-1", &[9]);
    assert_eq!(evaluate_rules(&store, &app_id("app-1"), Some(&panel)), None);

    with_reviews(&mut store, "app-1", &[9, 8]);
    assert_eq!(
        evaluate_rules(&store, &app_id("app-1"), Some(&panel)),
        Some(RuleDecision::Advance {
            to: stage_id("interview"),
            condition: "if average_score >= 8 then advance to Interview".to_string(),
        })
    );
}

#[test]
fn reject_rule_fires_when_advance_does_not() {
    let mut store = store();
    with_reviews(&mut store, "app-1", &[2]);

    assert_eq!(
        evaluate_rules(&store, &app_id("app-1"), None),
        Some(RuleDecision::Reject {
            condition: "if average_score < 3 then reject".to_string(),
        })
    );

    with_reviews(&mut store, "app-1", &[5]);
    assert_eq!(evaluate_rules(&store, &app_id("app-1"), None), None);
}

#[test]
fn unparseable_rules_are_skipped() {
    let mut snapshot = snapshot();
    if let Some(stage) = snapshot
        .workspace
        .stages
        .iter_mut()
        .find(|stage| stage.id == stage_id("screening"))
    {
        stage.auto_advance_condition = Some("whenever it feels right".to_string());
    }
    let mut store = ReviewStore::from_snapshot(snapshot, Default::default());
    with_reviews(&mut store, "app-1", &[1]);

    assert!(matches!(
        evaluate_rules(&store, &app_id("app-1"), None),
        Some(RuleDecision::Reject { .. })
    ));
}
