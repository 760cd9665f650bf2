use std::collections::BTreeMap;

use serde::Serialize;

use super::domain::{
    Application, ApplicationId, ReviewEntry, ReviewerId, ReviewerRoster, Rubric, StageId,
};

/// Running total of one reviewer's current category inputs.
///
/// This is the live sheet total shown while scoring, not an aggregate across reviewers.
/// Summed in `u64`, so unbounded sheets cannot wrap.
pub fn working_score(inputs: &BTreeMap<String, u32>) -> u64 {
    inputs.values().map(|score| u64::from(*score)).sum()
}

/// Mean of `total_score` across completed entries; missing or non-positive totals are skipped.
pub fn aggregate_score<'a>(entries: impl IntoIterator<Item = &'a ReviewEntry>) -> Option<f64> {
    mean(
        entries
            .into_iter()
            .filter(|entry| !entry.is_draft)
            .filter_map(|entry| entry.total_score)
            .filter(|total| *total > 0)
            .map(|total| total as f64),
    )
}

/// Per-category mean over the entries that actually carry that category.
pub fn category_averages<'a>(
    entries: impl IntoIterator<Item = &'a ReviewEntry>,
) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for entry in entries.into_iter().filter(|entry| !entry.is_draft) {
        for (category, score) in &entry.scores {
            let slot = sums.entry(category.clone()).or_insert((0.0, 0));
            slot.0 += f64::from(*score);
            slot.1 += 1;
        }
    }

    sums.into_iter()
        .map(|(category, (sum, count))| (category, sum / count as f64))
        .collect()
}

/// Square root of the population variance of `totals`.
pub fn spread(totals: &[f64]) -> Option<f64> {
    let mean = mean(totals.iter().copied())?;
    let variance = totals
        .iter()
        .map(|total| (total - mean).powi(2))
        .sum::<f64>()
        / totals.len() as f64;
    Some(variance.sqrt())
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Rubric bound violated by a score sheet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoreViolation {
    #[error("rubric `{rubric}` has no category `{category}`")]
    UnknownCategory { rubric: String, category: String },
    #[error("category `{category}` scored {score} but allows at most {max_points}")]
    CategoryExceeded {
        category: String,
        score: u32,
        max_points: u32,
    },
    #[error("total score {total} exceeds the rubric maximum of {max_score}")]
    TotalExceeded { total: u64, max_score: u32 },
}

/// Checks a score sheet against its rubric and returns the sheet total.
pub fn validate_scores(
    rubric: &Rubric,
    scores: &BTreeMap<String, u32>,
) -> Result<u64, ScoreViolation> {
    for (key, score) in scores {
        let category = rubric
            .category(key)
            .ok_or_else(|| ScoreViolation::UnknownCategory {
                rubric: rubric.id.0.clone(),
                category: key.clone(),
            })?;
        if *score > category.max_points {
            return Err(ScoreViolation::CategoryExceeded {
                category: key.clone(),
                score: *score,
                max_points: category.max_points,
            });
        }
    }

    let total = working_score(scores);
    if total > u64::from(rubric.max_score) {
        return Err(ScoreViolation::TotalExceeded {
            total,
            max_score: rubric.max_score,
        });
    }
    Ok(total)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationScore {
    pub application_id: ApplicationId,
    pub aggregate_score: Option<f64>,
    pub review_count: usize,
    pub category_averages: BTreeMap<String, f64>,
}

impl ApplicationScore {
    pub fn for_application(application: &Application) -> Self {
        Self {
            application_id: application.id.clone(),
            aggregate_score: aggregate_score(&application.reviews),
            review_count: application.completed_reviews().count(),
            category_averages: category_averages(&application.reviews),
        }
    }
}

/// Calibration figures for one reviewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewerStats {
    pub reviewer_id: ReviewerId,
    pub name: String,
    pub assigned: u32,
    pub completed: u32,
    pub mean_total: Option<f64>,
    /// Standard-deviation style spread of the reviewer's totals.
    pub spread: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsReport {
    pub applications: Vec<ApplicationScore>,
    pub stage_counts: BTreeMap<StageId, usize>,
    pub reviewers: Vec<ReviewerStats>,
}

pub fn reviewer_stats(applications: &[Application], roster: &ReviewerRoster) -> Vec<ReviewerStats> {
    roster
        .active()
        .map(|reviewer| {
            let totals: Vec<f64> = applications
                .iter()
                .filter_map(|application| application.review_by(&reviewer.id))
                .filter(|entry| !entry.is_draft)
                .filter_map(|entry| entry.total_score)
                .map(|total| total as f64)
                .collect();

            ReviewerStats {
                reviewer_id: reviewer.id.clone(),
                name: reviewer.name.clone(),
                assigned: reviewer.assigned_count,
                completed: reviewer.completed_count,
                mean_total: mean(totals.iter().copied()),
                spread: spread(&totals),
            }
        })
        .collect()
}

pub fn analytics(
    applications: &[Application],
    roster: &ReviewerRoster,
    stage_counts: &BTreeMap<StageId, usize>,
) -> AnalyticsReport {
    AnalyticsReport {
        applications: applications
            .iter()
            .map(ApplicationScore::for_application)
            .collect(),
        stage_counts: stage_counts.clone(),
        reviewers: reviewer_stats(applications, roster),
    }
}
