//! Per-stage, per-role field visibility and PII redaction.
//!
//! Two policies are stacked: the role policy decides which fields exist at all for a reviewer,
//! then the stage's PII policy replaces hidden-field values and masks leaked fragments of them
//! inside the remaining free text.

mod policy;
mod redaction;

pub use policy::RolePolicy;
pub use redaction::{redaction_tokens, MaskOutcome, Redactor, MASK_GLYPH, REDACTED_PLACEHOLDER};

use serde::Serialize;
use serde_json::Value;

use super::domain::{
    Application, ApplicationId, FieldId, FieldVisibility, FormDefinition, ReviewerTypeId, Stage,
    StageId,
};
use redaction::value_text;

/// Field as rendered for one caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldView {
    pub field_id: FieldId,
    pub name: String,
    pub label: String,
    pub visibility: FieldVisibility,
    pub value: Value,
    pub redacted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionView {
    pub id: Option<String>,
    pub title: String,
    pub fields: Vec<FieldView>,
}

/// Application as a caller is allowed to see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationView {
    pub application_id: ApplicationId,
    pub title: String,
    pub status: String,
    pub stage_id: Option<StageId>,
    pub tags: Vec<String>,
    pub flagged: bool,
    pub sections: Vec<SectionView>,
    /// Set when some text could not be scanned and was withheld instead.
    pub requires_manual_review: bool,
}

impl ApplicationView {
    pub fn field(&self, name: &str) -> Option<&FieldView> {
        self.sections
            .iter()
            .flat_map(|section| section.fields.iter())
            .find(|field| field.name == name)
    }
}

/// Inputs shared by every application resolved in one listing.
#[derive(Debug, Clone, Copy)]
pub struct VisibilityContext<'a> {
    pub form: &'a FormDefinition,
    pub stage: Option<&'a Stage>,
    pub role: Option<&'a ReviewerTypeId>,
    pub scan_limit: usize,
    /// `false` for administrator views that ignore role field policy.
    pub apply_role_policy: bool,
}

/// Resolves what the caller may read of `application`; `ordinal` is its 1-based list position.
pub fn resolve_view(
    context: VisibilityContext<'_>,
    application: &Application,
    ordinal: usize,
) -> ApplicationView {
    let policy = match (context.apply_role_policy, context.stage) {
        (true, Some(stage)) => RolePolicy::for_role(stage, context.role),
        _ => RolePolicy::open(),
    };
    let redactor = Redactor::for_application(
        context.form,
        context.stage,
        application,
        context.scan_limit,
    );

    let mut requires_manual_review = false;
    let sections = policy::layout(context.form, &policy)
        .into_iter()
        .map(|section| SectionView {
            id: section.id,
            title: section.title,
            fields: section
                .fields
                .into_iter()
                .map(|(field, visibility)| {
                    let raw = field
                        .value_in(&application.raw_data)
                        .cloned()
                        .unwrap_or(Value::Null);
                    let (value, redacted, unscannable) = if redactor.hides(field) {
                        (Value::String(REDACTED_PLACEHOLDER.to_string()), true, false)
                    } else {
                        mask_value(&redactor, raw)
                    };
                    requires_manual_review |= unscannable;
                    FieldView {
                        field_id: field.id.clone(),
                        name: field.name.clone(),
                        label: field.display_label().to_string(),
                        visibility,
                        value,
                        redacted,
                    }
                })
                .collect(),
        })
        .collect();

    ApplicationView {
        application_id: application.id.clone(),
        title: display_title(context.form, &redactor, application, ordinal),
        status: application.status.clone(),
        stage_id: application.stage_id.clone(),
        tags: application.tags.clone(),
        flagged: application.flagged,
        sections,
        requires_manual_review,
    }
}

/// Returns the masked value plus `(redacted, unscannable)` markers.
fn mask_value(redactor: &Redactor, value: Value) -> (Value, bool, bool) {
    match value {
        Value::String(text) => match redactor.mask_text(&text) {
            MaskOutcome::Clean(text) => (Value::String(text), false, false),
            MaskOutcome::Masked(text) => (Value::String(text), true, false),
            MaskOutcome::Unscannable => {
                (Value::String(REDACTED_PLACEHOLDER.to_string()), true, true)
            }
        },
        Value::Array(items) => {
            let mut redacted = false;
            let mut unscannable = false;
            let items = items
                .into_iter()
                .map(|item| {
                    let (item, item_redacted, item_unscannable) = mask_value(redactor, item);
                    redacted |= item_redacted;
                    unscannable |= item_unscannable;
                    item
                })
                .collect();
            (Value::Array(items), redacted, unscannable)
        }
        other => (other, false, false),
    }
}

fn display_title(
    form: &FormDefinition,
    redactor: &Redactor,
    application: &Application,
    ordinal: usize,
) -> String {
    let anonymous = format!("Applicant #{ordinal}");
    if redactor.is_active() {
        return anonymous;
    }

    let configured = form.title_field.as_ref().and_then(|key| {
        form.fields
            .iter()
            .find(|field| field.matches_any(std::slice::from_ref(key)))
            .and_then(|field| field.value_in(&application.raw_data))
            .or_else(|| application.raw_data.get(key))
            .and_then(value_text)
    });

    configured
        .filter(|title| !title.trim().is_empty())
        .or_else(|| (!application.name.trim().is_empty()).then(|| application.name.clone()))
        .unwrap_or(anonymous)
}
