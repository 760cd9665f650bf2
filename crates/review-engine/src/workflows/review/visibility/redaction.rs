use std::collections::BTreeSet;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::workflows::review::domain::{Application, FormDefinition, FormField, Stage};

/// Fixed-width stand-in for a hidden field's value.
pub const REDACTED_PLACEHOLDER: &str = "████████";
pub const MASK_GLYPH: char = '█';

const MIN_TOKEN_CHARS: usize = 2;

/// Stage-level PII policy plus the compiled substring matcher for one application.
#[derive(Debug, Clone)]
pub struct Redactor {
    hidden_keys: Vec<String>,
    active: bool,
    matcher: Option<Regex>,
    degraded: bool,
    scan_limit: usize,
}

/// Result of scanning a free-text value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaskOutcome {
    Clean(String),
    Masked(String),
    /// The scan could not run; callers must fall back to the placeholder.
    Unscannable,
}

impl Redactor {
    /// No redaction at all.
    pub fn inactive() -> Self {
        Self {
            hidden_keys: Vec::new(),
            active: false,
            matcher: None,
            degraded: false,
            scan_limit: usize::MAX,
        }
    }

    pub fn for_application(
        form: &FormDefinition,
        stage: Option<&Stage>,
        application: &Application,
        scan_limit: usize,
    ) -> Self {
        let Some(stage) = stage.filter(|stage| stage.redacts_pii()) else {
            return Self::inactive();
        };

        let hidden_keys = stage.hidden_pii_fields.clone();
        let values = form
            .fields
            .iter()
            .filter(|field| field.matches_any(&hidden_keys))
            .filter_map(|field| field.value_in(&application.raw_data))
            .filter_map(value_text);
        let tokens = redaction_tokens(values);

        let (matcher, degraded) = match build_matcher(&tokens, scan_limit) {
            Ok(matcher) => (matcher, false),
            Err(error) => {
                tracing::warn!(
                    application_id = %application.id.0,
                    stage_id = %stage.id.0,
                    %error,
                    "redaction matcher unavailable; text fields need manual review"
                );
                (None, true)
            }
        };

        Self {
            hidden_keys,
            active: true,
            matcher,
            degraded,
            scan_limit,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn hides(&self, field: &FormField) -> bool {
        self.active && field.matches_any(&self.hidden_keys)
    }

    pub fn mask_text(&self, text: &str) -> MaskOutcome {
        if !self.active {
            return MaskOutcome::Clean(text.to_string());
        }
        if self.degraded || text.len() > self.scan_limit {
            return MaskOutcome::Unscannable;
        }
        let Some(matcher) = &self.matcher else {
            return MaskOutcome::Clean(text.to_string());
        };

        let masked = matcher.replace_all(text, |captures: &regex::Captures<'_>| {
            MASK_GLYPH
                .to_string()
                .repeat(captures[0].chars().count())
        });
        if masked == text {
            MaskOutcome::Clean(text.to_string())
        } else {
            MaskOutcome::Masked(masked.into_owned())
        }
    }
}

/// Lower-cased full values plus their whitespace/punctuation-delimited tokens.
pub fn redaction_tokens<I, S>(values: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut tokens = BTreeSet::new();
    for value in values {
        let value = value.as_ref().trim().to_lowercase();
        if value.chars().count() >= MIN_TOKEN_CHARS {
            tokens.insert(value.clone());
        }
        for token in value.split(|c: char| c.is_whitespace() || c.is_ascii_punctuation()) {
            if token.chars().count() >= MIN_TOKEN_CHARS {
                tokens.insert(token.to_string());
            }
        }
    }
    tokens
}

fn build_matcher(
    tokens: &BTreeSet<String>,
    size_limit: usize,
) -> Result<Option<Regex>, regex::Error> {
    if tokens.is_empty() {
        return Ok(None);
    }

    let mut ordered: Vec<&String> = tokens.iter().collect();
    // Longest first so a full value wins over its own tokens.
    ordered.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    let pattern = ordered
        .iter()
        .map(|token| regex::escape(token))
        .collect::<Vec<_>>()
        .join("|");

    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .size_limit(size_limit)
        .build()
        .map(Some)
}

/// Text form of a submitted value, used for token extraction.
pub(crate) fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(value_text).collect();
            (!parts.is_empty()).then(|| parts.join(" "))
        }
        Value::Object(map) => {
            let parts: Vec<String> = map.values().filter_map(value_text).collect();
            (!parts.is_empty()).then(|| parts.join(" "))
        }
    }
}
