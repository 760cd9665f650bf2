use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{ApplicationId, ReviewEntry, ReviewerId, ReviewerStatus, ReviewerTypeId};
use super::pipeline::{evaluate_rules, RuleDecision};
use super::scoring::{validate_scores, working_score, ScoreViolation};
use super::store::ReviewStore;

/// Scored review as sent by a reviewer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSubmission {
    #[serde(default)]
    pub scores: BTreeMap<String, u32>,
    #[serde(default)]
    pub criteria_comments: BTreeMap<String, String>,
    #[serde(default)]
    pub overall_comment: String,
    /// Decision status to apply to the application once final.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_draft: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReviewError {
    #[error(transparent)]
    Score(#[from] ScoreViolation),
    #[error("application {0} does not exist")]
    ApplicationNotFound(String),
    #[error("reviewer {0} is not on the roster")]
    UnknownReviewer(String),
    #[error("reviewer {0} has been removed")]
    ReviewerRemoved(String),
}

/// Validated review entry plus the context needed to commit it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewPlan {
    pub application_id: ApplicationId,
    pub entry: ReviewEntry,
    pub role: Option<ReviewerTypeId>,
    pub status: Option<String>,
}

/// Validates scores against the rubric in force for the reviewer at the application's stage.
pub fn plan_review(
    store: &ReviewStore,
    application_id: &ApplicationId,
    reviewer_id: &ReviewerId,
    submission: &ReviewSubmission,
    at: DateTime<Utc>,
) -> Result<ReviewPlan, ReviewError> {
    let application = store
        .application(application_id)
        .ok_or_else(|| ReviewError::ApplicationNotFound(application_id.0.clone()))?;
    let reviewer = store
        .roster()
        .get(reviewer_id)
        .ok_or_else(|| ReviewError::UnknownReviewer(reviewer_id.0.clone()))?;
    if reviewer.status == ReviewerStatus::Removed {
        return Err(ReviewError::ReviewerRemoved(reviewer_id.0.clone()));
    }

    let stage = application
        .stage_id
        .as_ref()
        .and_then(|stage| store.workspace().stage(stage));
    let role = match stage {
        Some(stage) => reviewer.role_for(&stage.id).cloned(),
        None => reviewer.reviewer_type_id.clone(),
    };
    let rubric = stage.and_then(|stage| store.workspace().rubric_for(stage, role.as_ref()));
    let total = match rubric {
        Some(rubric) => validate_scores(rubric, &submission.scores)?,
        None => working_score(&submission.scores),
    };

    let status = submission
        .status
        .as_ref()
        .map(|status| status.trim().to_string())
        .filter(|status| !status.is_empty());

    Ok(ReviewPlan {
        application_id: application_id.clone(),
        entry: ReviewEntry {
            reviewer_id: reviewer_id.clone(),
            reviewer_name: reviewer.name.clone(),
            scores: submission.scores.clone(),
            total_score: Some(i64::try_from(total).unwrap_or(i64::MAX)),
            overall_comment: submission.overall_comment.trim().to_string(),
            criteria_comments: submission.criteria_comments.clone(),
            status: status.clone(),
            tags: submission.tags.clone(),
            submitted_at: at,
            is_draft: submission.is_draft,
        },
        role,
        status,
    })
}

/// Result of recording a review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedReview {
    pub application_id: ApplicationId,
    pub reviewer_id: ReviewerId,
    pub total_score: i64,
    pub is_draft: bool,
    /// First final submission by this reviewer for this application.
    pub first_completion: bool,
    /// Automatic stage decision the caller should carry out.
    pub rule: Option<RuleDecision>,
}

/// Stores the entry, replacing any earlier entry by the same reviewer.
///
/// Final submissions also apply the decision status and tags, bump the reviewer's completed
/// count once per application, and evaluate the stage rules. The rule decision is returned, not
/// applied.
pub fn record_review(
    store: &mut ReviewStore,
    plan: ReviewPlan,
) -> Result<RecordedReview, ReviewError> {
    let ReviewPlan {
        application_id,
        entry,
        role,
        status,
    } = plan;
    let reviewer_id = entry.reviewer_id.clone();
    let is_draft = entry.is_draft;
    let total_score = entry.total_score.unwrap_or(0);

    let application = store
        .application_mut(&application_id)
        .ok_or_else(|| ReviewError::ApplicationNotFound(application_id.0.clone()))?;

    let previously_final = application
        .review_by(&reviewer_id)
        .is_some_and(|existing| !existing.is_draft);
    let first_completion = !is_draft && !previously_final;

    application.scores = entry.scores.clone();
    if !is_draft {
        if let Some(status) = &status {
            application.status = status.clone();
        }
        for tag in &entry.tags {
            if !application.tags.contains(tag) {
                application.tags.push(tag.clone());
            }
        }
    }
    match application
        .reviews
        .iter()
        .position(|existing| existing.reviewer_id == reviewer_id)
    {
        Some(index) => application.reviews[index] = entry,
        None => application.reviews.push(entry),
    }

    if first_completion {
        if let Some(reviewer) = store.roster_mut().get_mut(&reviewer_id) {
            reviewer.completed_count += 1;
        }
    }

    let rule = if is_draft {
        None
    } else {
        evaluate_rules(store, &application_id, role.as_ref())
    };

    Ok(RecordedReview {
        application_id,
        reviewer_id,
        total_score,
        is_draft,
        first_completion,
        rule,
    })
}
