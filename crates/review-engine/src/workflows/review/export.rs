use std::collections::BTreeSet;

use serde_json::Value;

use super::domain::Application;
use super::scoring::aggregate_score;
use super::store::ReviewStore;

const FIXED_COLUMNS: [&str; 11] = [
    "ID",
    "Name",
    "Status",
    "Stage",
    "Submitted",
    "Score",
    "Max Score",
    "Reviewed Count",
    "Assigned Reviewers",
    "Tags",
    "Flagged",
];

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to write csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to flush csv buffer: {0}")]
    Flush(String),
    #[error("csv output was not valid utf-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

impl<W> From<csv::IntoInnerError<W>> for ExportError {
    fn from(err: csv::IntoInnerError<W>) -> Self {
        Self::Flush(err.error().to_string())
    }
}

/// One row per application: fixed columns, then every submitted field key in sorted order.
///
/// Keys starting with `_` are internal and skipped. Non-string values are written as JSON.
pub fn export_csv(store: &ReviewStore) -> Result<String, ExportError> {
    let raw_keys: BTreeSet<&str> = store
        .applications()
        .iter()
        .flat_map(|application| application.raw_data.keys())
        .map(String::as_str)
        .filter(|key| !key.starts_with('_'))
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(FIXED_COLUMNS.iter().copied().chain(raw_keys.iter().copied()))?;

    for application in store.applications() {
        let mut row = fixed_cells(store, application);
        row.extend(raw_keys.iter().map(|key| {
            match application.raw_data.get(*key) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
            }
        }));
        writer.write_record(&row)?;
    }

    let bytes = writer.into_inner()?;
    Ok(String::from_utf8(bytes)?)
}

fn fixed_cells(store: &ReviewStore, application: &Application) -> Vec<String> {
    let workspace = store.workspace();
    let stage = application
        .stage_id
        .as_ref()
        .and_then(|stage| workspace.stage(stage));
    let max_score = stage
        .and_then(|stage| workspace.rubric_for(stage, None))
        .map(|rubric| rubric.max_score.to_string())
        .unwrap_or_default();
    let score = aggregate_score(&application.reviews)
        .map(|score| format!("{score:.2}"))
        .unwrap_or_default();
    let reviewers: Vec<String> = application
        .assigned_reviewers
        .iter()
        .map(|id| {
            application
                .reviewer_info
                .get(id)
                .map(|contact| contact.name.clone())
                .filter(|name| !name.is_empty())
                .or_else(|| store.roster().get(id).map(|reviewer| reviewer.name.clone()))
                .unwrap_or_else(|| id.0.clone())
        })
        .collect();

    vec![
        application.id.0.clone(),
        application.name.clone(),
        application.status.clone(),
        stage.map(|stage| stage.name.clone()).unwrap_or_default(),
        application
            .submitted_at
            .map(|at| at.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        score,
        max_score,
        application.completed_reviews().count().to_string(),
        reviewers.join("; "),
        application.tags.join(", "),
        if application.flagged { "Yes" } else { "No" }.to_string(),
    ]
}
