use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::domain::{
    Application, ApplicationId, ReassignmentRecord, ReviewerId, ReviewerRoster, ReviewerStatus,
};
use super::store::ReviewStore;

pub const TOKEN_PREFIX: &str = "rev_";
const TOKEN_LENGTH: usize = 8;
const TOKEN_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Per-reviewer assignment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AssignmentRequest {
    Random {
        count: usize,
        #[serde(default)]
        only_unassigned: bool,
    },
    Manual {
        submission_ids: Vec<ApplicationId>,
    },
}

/// How a manual batch is spread across several reviewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualStrategy {
    AllToAll,
    EqualSplit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalMode {
    Archive,
    RemoveCompletely,
}

/// One reviewer's share of a manual assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentBatch {
    pub reviewer_id: ReviewerId,
    pub application_ids: Vec<ApplicationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssignmentError {
    #[error("reviewer {0} is not on the roster")]
    UnknownReviewer(String),
    #[error("reviewer {0} has been removed")]
    ReviewerRemoved(String),
    #[error("application {0} does not exist")]
    UnknownApplication(String),
    #[error("no reviewers selected")]
    NoReviewers,
    #[error("reviewer {reviewer} is not assigned to application {application}")]
    NotAssigned {
        application: String,
        reviewer: String,
    },
    #[error("reviewer {reviewer} is already assigned to application {application}")]
    AlreadyAssigned {
        application: String,
        reviewer: String,
    },
    #[error("cannot reassign an application to the same reviewer")]
    SameReviewer,
}

/// Picks up to `count` applications for `reviewer`.
///
/// With `only_unassigned` the pool is applications nobody holds; otherwise it is every
/// application this reviewer does not already hold.
pub fn select_random<R>(
    applications: &[Application],
    reviewer: &ReviewerId,
    count: usize,
    only_unassigned: bool,
    rng: &mut R,
) -> Vec<ApplicationId>
where
    R: Rng + ?Sized,
{
    let mut pool: Vec<&ApplicationId> = applications
        .iter()
        .filter(|application| {
            if only_unassigned {
                application.is_unassigned()
            } else {
                !application.assigned_reviewers.contains(reviewer)
            }
        })
        .map(|application| &application.id)
        .collect();

    pool.shuffle(rng);
    pool.into_iter().take(count).cloned().collect()
}

/// Size of every equal-split chunk except possibly the last.
pub fn chunk_size(total: usize, reviewers: usize) -> usize {
    if reviewers == 0 {
        return 0;
    }
    total.div_ceil(reviewers)
}

/// Front-loaded contiguous partition: chunk `i` covers `[i * size, min((i + 1) * size, total))`.
pub fn equal_split(
    application_ids: &[ApplicationId],
    reviewers: &[ReviewerId],
) -> Vec<AssignmentBatch> {
    let size = chunk_size(application_ids.len(), reviewers.len());
    reviewers
        .iter()
        .enumerate()
        .map(|(index, reviewer)| {
            let start = (index * size).min(application_ids.len());
            let end = ((index + 1) * size).min(application_ids.len());
            AssignmentBatch {
                reviewer_id: reviewer.clone(),
                application_ids: application_ids[start..end].to_vec(),
            }
        })
        .collect()
}

pub fn all_to_all(
    application_ids: &[ApplicationId],
    reviewers: &[ReviewerId],
) -> Vec<AssignmentBatch> {
    reviewers
        .iter()
        .map(|reviewer| AssignmentBatch {
            reviewer_id: reviewer.clone(),
            application_ids: application_ids.to_vec(),
        })
        .collect()
}

pub fn plan_manual(
    strategy: ManualStrategy,
    reviewers: &[ReviewerId],
    application_ids: &[ApplicationId],
) -> Result<Vec<AssignmentBatch>, AssignmentError> {
    if reviewers.is_empty() {
        return Err(AssignmentError::NoReviewers);
    }
    Ok(match strategy {
        ManualStrategy::AllToAll => all_to_all(application_ids, reviewers),
        ManualStrategy::EqualSplit => equal_split(application_ids, reviewers),
    })
}

/// `rev_` followed by eight base-36 characters.
pub fn generate_token<R>(rng: &mut R) -> String
where
    R: Rng + ?Sized,
{
    let suffix: String = (0..TOKEN_LENGTH)
        .map(|_| char::from(TOKEN_ALPHABET[rng.random_range(0..TOKEN_ALPHABET.len())]))
        .collect();
    format!("{TOKEN_PREFIX}{suffix}")
}

/// Checks that a reviewer can take on new work and every application exists.
pub fn check_assignment(
    store: &ReviewStore,
    reviewer: &ReviewerId,
    application_ids: &[ApplicationId],
) -> Result<(), AssignmentError> {
    let record = store
        .roster()
        .get(reviewer)
        .ok_or_else(|| AssignmentError::UnknownReviewer(reviewer.0.clone()))?;
    if record.status == ReviewerStatus::Removed {
        return Err(AssignmentError::ReviewerRemoved(reviewer.0.clone()));
    }
    if let Some(missing) = application_ids.iter().find(|id| !store.contains(id)) {
        return Err(AssignmentError::UnknownApplication(missing.0.clone()));
    }
    Ok(())
}

/// Adds `reviewer` to each application; already-held applications are skipped.
///
/// Returns the applications newly assigned. The reviewer's `assigned_count` grows by that many.
pub fn assign(
    store: &mut ReviewStore,
    reviewer: &ReviewerId,
    application_ids: &[ApplicationId],
) -> Result<Vec<ApplicationId>, AssignmentError> {
    check_assignment(store, reviewer, application_ids)?;

    let (applications, roster) = store.split_mut();
    let Some(record) = roster.get_mut(reviewer) else {
        return Err(AssignmentError::UnknownReviewer(reviewer.0.clone()));
    };

    let wanted: BTreeSet<&ApplicationId> = application_ids.iter().collect();
    let mut added = Vec::new();
    for application in applications
        .iter_mut()
        .filter(|application| wanted.contains(&application.id))
    {
        if application.assigned_reviewers.insert(reviewer.clone()) {
            application
                .reviewer_info
                .insert(reviewer.clone(), record.contact());
            added.push(application.id.clone());
        }
    }

    record.assigned_count += added.len() as u32;
    Ok(added)
}

pub fn check_reassignment(
    store: &ReviewStore,
    application_id: &ApplicationId,
    from: &ReviewerId,
    to: &ReviewerId,
) -> Result<(), AssignmentError> {
    if from == to {
        return Err(AssignmentError::SameReviewer);
    }
    let application = store
        .application(application_id)
        .ok_or_else(|| AssignmentError::UnknownApplication(application_id.0.clone()))?;
    if store.roster().get(from).is_none() {
        return Err(AssignmentError::UnknownReviewer(from.0.clone()));
    }
    match store.roster().get(to) {
        None => return Err(AssignmentError::UnknownReviewer(to.0.clone())),
        Some(reviewer) if reviewer.status == ReviewerStatus::Removed => {
            return Err(AssignmentError::ReviewerRemoved(to.0.clone()))
        }
        Some(_) => {}
    }
    if !application.assigned_reviewers.contains(from) {
        return Err(AssignmentError::NotAssigned {
            application: application_id.0.clone(),
            reviewer: from.0.clone(),
        });
    }
    if application.assigned_reviewers.contains(to) {
        return Err(AssignmentError::AlreadyAssigned {
            application: application_id.0.clone(),
            reviewer: to.0.clone(),
        });
    }
    Ok(())
}

/// Swaps `from` for `to` on one application and appends the audit record.
///
/// Review entries are left untouched; counts move by exactly one in each direction.
pub fn reassign(
    store: &mut ReviewStore,
    application_id: &ApplicationId,
    from: &ReviewerId,
    to: &ReviewerId,
    note: &str,
    at: DateTime<Utc>,
) -> Result<ReassignmentRecord, AssignmentError> {
    check_reassignment(store, application_id, from, to)?;

    let (applications, roster) = store.split_mut();
    let contact = roster
        .get(to)
        .map(|reviewer| reviewer.contact())
        .ok_or_else(|| AssignmentError::UnknownReviewer(to.0.clone()))?;
    let application = applications
        .iter_mut()
        .find(|application| &application.id == application_id)
        .ok_or_else(|| AssignmentError::UnknownApplication(application_id.0.clone()))?;

    application.assigned_reviewers.remove(from);
    application.assigned_reviewers.insert(to.clone());
    application.reviewer_info.remove(from);
    application.reviewer_info.insert(to.clone(), contact);

    let record = ReassignmentRecord {
        from: from.clone(),
        to: to.clone(),
        note: note.to_string(),
        at,
    };
    application.reassignments.push(record.clone());

    if let Some(reviewer) = roster.get_mut(from) {
        reviewer.assigned_count = reviewer.assigned_count.saturating_sub(1);
    }
    if let Some(reviewer) = roster.get_mut(to) {
        reviewer.assigned_count += 1;
    }

    Ok(record)
}

/// What a removal touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalSummary {
    pub reviewer_id: ReviewerId,
    pub mode: RemovalMode,
    /// Applications whose assignment set lost the reviewer.
    pub unassigned_from: usize,
}

pub fn check_removal(store: &ReviewStore, reviewer: &ReviewerId) -> Result<(), AssignmentError> {
    store
        .roster()
        .get(reviewer)
        .map(|_| ())
        .ok_or_else(|| AssignmentError::UnknownReviewer(reviewer.0.clone()))
}

/// Archives or deletes a reviewer.
///
/// Archiving only flips the status. Complete removal also drops the roster record and strips
/// the reviewer from every assignment set and reviewer-info map; submitted review entries keep
/// the reviewer id and the name captured at submission.
pub fn remove_reviewer(
    store: &mut ReviewStore,
    reviewer: &ReviewerId,
    mode: RemovalMode,
    at: DateTime<Utc>,
) -> Result<RemovalSummary, AssignmentError> {
    check_removal(store, reviewer)?;

    let (applications, roster) = store.split_mut();
    retire(roster, reviewer, mode, at);
    let mut unassigned_from = 0;
    if mode == RemovalMode::RemoveCompletely {
        for application in applications.iter_mut() {
            if application.assigned_reviewers.remove(reviewer) {
                unassigned_from += 1;
            }
            application.reviewer_info.remove(reviewer);
        }
    }

    Ok(RemovalSummary {
        reviewer_id: reviewer.clone(),
        mode,
        unassigned_from,
    })
}

/// Roster-only half of a removal.
pub fn retire(
    roster: &mut ReviewerRoster,
    reviewer: &ReviewerId,
    mode: RemovalMode,
    at: DateTime<Utc>,
) {
    match mode {
        RemovalMode::Archive => {
            if let Some(record) = roster.get_mut(reviewer) {
                record.status = ReviewerStatus::Removed;
                record.removed_at = Some(at);
            }
        }
        RemovalMode::RemoveCompletely => {
            roster.reviewers.retain(|record| &record.id != reviewer);
        }
    }
}
