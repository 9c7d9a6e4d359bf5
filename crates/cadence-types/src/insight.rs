//! Standardized findings contributed by step executors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How much attention a finding deserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// A severity/confidence-scored finding.
///
/// Executors build insights without a `source_step`; the engine stamps the
/// producing step's ID when it records the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    /// Short headline.
    pub title: String,
    /// Longer explanation.
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    /// Confidence in [0.0, 1.0].
    pub confidence: f32,
    /// Free-form grouping label (e.g. "sentiment", "anomaly").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Supporting data.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Step that produced this insight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_step: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Insight {
    /// Create an insight. Confidence is clamped to [0.0, 1.0].
    pub fn new(title: impl Into<String>, severity: Severity, confidence: f32) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            severity,
            confidence: clamp_confidence(confidence),
            category: None,
            data: Value::Null,
            source_step: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

fn clamp_confidence(c: f32) -> f32 {
    if c.is_nan() { 0.0 } else { c.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(Insight::new("a", Severity::Low, 1.7).confidence, 1.0);
        assert_eq!(Insight::new("a", Severity::Low, -0.2).confidence, 0.0);
        assert_eq!(Insight::new("a", Severity::Low, f32::NAN).confidence, 0.0);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Info < Severity::Low);
    }
}
