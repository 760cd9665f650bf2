use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

const CONDITION_PATTERN: &str =
    r"(?i)^\s*if\s+(\w+)\s*(>=|<=|>|<|==|!=)\s*(\d+(?:\.\d+)?)\s+then\s+(.+?)\s*$";
const ADVANCE_TARGET_PATTERN: &str = r"(?i)advance\s+to\s+(.+)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    AverageScore,
    TotalScore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparison {
    AtLeast,
    AtMost,
    Above,
    Below,
    Equal,
    NotEqual,
}

impl Comparison {
    fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::AtLeast => value >= threshold,
            Comparison::AtMost => value <= threshold,
            Comparison::Above => value > threshold,
            Comparison::Below => value < threshold,
            Comparison::Equal => (value - threshold).abs() < f64::EPSILON,
            Comparison::NotEqual => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

/// Parsed `if <metric> <op> <number> then <action>` rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    pub metric: Metric,
    pub comparison: Comparison,
    pub threshold: f64,
    pub action: String,
    /// Stage name from an `advance to <stage>` action.
    pub target_stage: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionParseError {
    #[error("condition `{0}` is not of the form `if <metric> <op> <number> then <action>`")]
    Malformed(String),
    #[error("unknown metric `{0}`")]
    UnknownMetric(String),
    #[error("condition matcher unavailable")]
    MatcherUnavailable,
}

fn compiled(slot: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    slot.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn condition_regex() -> Option<&'static Regex> {
    static SLOT: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&SLOT, CONDITION_PATTERN)
}

fn advance_target_regex() -> Option<&'static Regex> {
    static SLOT: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&SLOT, ADVANCE_TARGET_PATTERN)
}

impl Condition {
    pub fn parse(raw: &str) -> Result<Self, ConditionParseError> {
        let pattern = condition_regex().ok_or(ConditionParseError::MatcherUnavailable)?;
        let captures = pattern
            .captures(raw)
            .ok_or_else(|| ConditionParseError::Malformed(raw.to_string()))?;

        let metric = match captures[1].to_ascii_lowercase().as_str() {
            "average_score" | "avg_score" | "avg" | "average" => Metric::AverageScore,
            "total_score" | "total" => Metric::TotalScore,
            other => return Err(ConditionParseError::UnknownMetric(other.to_string())),
        };
        let comparison = match &captures[2] {
            ">=" => Comparison::AtLeast,
            "<=" => Comparison::AtMost,
            ">" => Comparison::Above,
            "<" => Comparison::Below,
            "==" => Comparison::Equal,
            _ => Comparison::NotEqual,
        };
        let threshold = captures[3]
            .parse::<f64>()
            .map_err(|_| ConditionParseError::Malformed(raw.to_string()))?;
        let action = captures[4].trim().to_string();
        let target_stage = advance_target_regex()
            .and_then(|pattern| pattern.captures(&action))
            .map(|target| target[1].trim().to_string())
            .filter(|target| !target.is_empty());

        Ok(Self {
            metric,
            comparison,
            threshold,
            action,
            target_stage,
        })
    }

    pub fn holds(&self, average: f64, total: f64) -> bool {
        let value = match self.metric {
            Metric::AverageScore => average,
            Metric::TotalScore => total,
        };
        self.comparison.holds(value, self.threshold)
    }
}
