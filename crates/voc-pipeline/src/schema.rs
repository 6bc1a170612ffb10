//! Validation of model output into [`NewInsight`] values.
//!
//! An item is either fully valid or rejected with a reason; nothing partial
//! ever reaches the store.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use voc_core::{
    CompetitorMention, CustomerContext, FeatureRequest, JourneyStage, NewInsight, PainPoint,
    SentimentLabel,
};

use crate::error::ExtractionError;

const MIN_SUMMARY_CHARS: usize = 10;
const DEFAULT_URGENCY: i16 = 3;
const MAX_THEME_HINTS: usize = 8;

#[derive(Debug, Deserialize)]
struct SentimentPayload {
    score: f64,
    label: SentimentLabel,
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct ExtractionPayload {
    sentiment: SentimentPayload,
    summary: String,
    #[serde(default)]
    pain_points: Vec<PainPoint>,
    #[serde(default)]
    feature_requests: Vec<FeatureRequest>,
    #[serde(default)]
    competitor_mentions: Vec<CompetitorMention>,
    #[serde(default)]
    customer_context: Option<CustomerContext>,
    #[serde(default)]
    journey_stage: Option<String>,
    #[serde(default)]
    urgency_level: Option<Value>,
    #[serde(default)]
    themes: Vec<String>,
}

fn invalid(reason: impl Into<String>) -> ExtractionError {
    ExtractionError::InvalidSchema(reason.into())
}

/// Split a batch response into its per-item objects, keyed by feedback id.
///
/// Accepts `{"results": [...]}` or a bare array. Items without a usable
/// `feedback_id` are dropped; the caller treats their feedback as missing.
///
/// # Errors
///
/// Returns [`ExtractionError::InvalidSchema`] when the response is not JSON
/// or has no result array.
pub fn split_results(content: &str) -> Result<HashMap<i64, Value>, ExtractionError> {
    let value: Value = serde_json::from_str(strip_code_fence(content))
        .map_err(|e| invalid(format!("response is not JSON: {e}")))?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => items,
            _ => return Err(invalid("response has no \"results\" array")),
        },
        _ => return Err(invalid("response is not an object")),
    };

    let mut by_id = HashMap::with_capacity(items.len());
    for item in items {
        let id = match item.get("feedback_id") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        match id {
            Some(id) => {
                by_id.entry(id).or_insert(item);
            }
            None => tracing::debug!("extractor: result without feedback_id ignored"),
        }
    }
    Ok(by_id)
}

/// Models in JSON mode occasionally still wrap output in a markdown fence.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map_or(trimmed, str::trim)
}

/// Validate one result object for `feedback_id`.
///
/// # Errors
///
/// Returns [`ExtractionError::InvalidSchema`] naming the first violated
/// field constraint.
pub fn validate_item(feedback_id: i64, item: &Value) -> Result<NewInsight, ExtractionError> {
    let payload: ExtractionPayload =
        serde_json::from_value(item.clone()).map_err(|e| invalid(e.to_string()))?;

    let sentiment = payload.sentiment;
    if !sentiment.score.is_finite() || !(-1.0..=1.0).contains(&sentiment.score) {
        return Err(invalid(format!(
            "sentiment.score {} outside [-1, 1]",
            sentiment.score
        )));
    }
    if !sentiment.confidence.is_finite() || !(0.0..=1.0).contains(&sentiment.confidence) {
        return Err(invalid(format!(
            "sentiment.confidence {} outside [0, 1]",
            sentiment.confidence
        )));
    }

    let summary = payload.summary.trim().to_string();
    if summary.chars().count() < MIN_SUMMARY_CHARS {
        return Err(invalid("summary shorter than 10 characters"));
    }

    if payload
        .pain_points
        .iter()
        .any(|p| p.description.trim().is_empty())
    {
        return Err(invalid("pain point without description"));
    }
    if payload
        .feature_requests
        .iter()
        .any(|f| f.description.trim().is_empty())
    {
        return Err(invalid("feature request without description"));
    }
    if payload
        .competitor_mentions
        .iter()
        .any(|c| c.competitor_name.trim().is_empty())
    {
        return Err(invalid("competitor mention without name"));
    }

    let journey_stage = match payload.journey_stage.as_deref().map(str::trim) {
        None | Some("" | "null" | "unknown") => None,
        Some(raw) => Some(
            raw.to_ascii_lowercase()
                .parse::<JourneyStage>()
                .map_err(|e| invalid(e.to_string()))?,
        ),
    };

    let urgency_level = match payload.urgency_level {
        None | Some(Value::Null) => DEFAULT_URGENCY,
        Some(Value::Number(n)) => n
            .as_i64()
            .filter(|u| (1..=5).contains(u))
            .and_then(|u| i16::try_from(u).ok())
            .ok_or_else(|| invalid(format!("urgency_level {n} outside 1..=5")))?,
        Some(other) => return Err(invalid(format!("urgency_level {other} is not an integer"))),
    };

    let mut themes: Vec<String> = Vec::new();
    for hint in payload.themes {
        let hint = hint.trim().to_lowercase();
        if !hint.is_empty() && !themes.contains(&hint) && themes.len() < MAX_THEME_HINTS {
            themes.push(hint);
        }
    }

    Ok(NewInsight {
        feedback_id,
        sentiment_score: sentiment.score,
        sentiment_label: sentiment.label,
        sentiment_confidence: sentiment.confidence,
        summary,
        pain_points: payload.pain_points,
        feature_requests: payload.feature_requests,
        competitor_mentions: payload.competitor_mentions,
        customer_context: payload.customer_context.unwrap_or_default(),
        journey_stage,
        urgency_level,
        themes,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use voc_core::{FeaturePriority, PainSeverity};

    use super::*;

    fn valid_item() -> Value {
        json!({
            "feedback_id": 42,
            "sentiment": { "score": -0.6, "label": "Negative", "confidence": 0.85 },
            "summary": "Customer was double charged and support has not replied.",
            "pain_points": [
                { "description": "double charge", "severity": "high", "category": "billing" }
            ],
            "feature_requests": [
                { "description": "self-serve refunds", "priority": "medium" }
            ],
            "competitor_mentions": [
                { "competitor_name": "Globex", "context": "considering a switch", "sentiment": "positive" }
            ],
            "customer_context": { "user_segment": "smb" },
            "journey_stage": "retention",
            "urgency_level": 4,
            "themes": ["Billing", "support", "billing"]
        })
    }

    #[test]
    fn valid_item_becomes_insight() {
        let insight = validate_item(42, &valid_item()).unwrap();

        assert_eq!(insight.feedback_id, 42);
        assert_eq!(insight.sentiment_label, SentimentLabel::Negative);
        assert_eq!(insight.pain_points[0].severity, PainSeverity::High);
        assert_eq!(insight.feature_requests[0].priority, FeaturePriority::Medium);
        assert_eq!(insight.feature_requests[0].use_case, None);
        assert_eq!(insight.customer_context.user_segment.as_deref(), Some("smb"));
        assert_eq!(insight.journey_stage, Some(JourneyStage::Retention));
        assert_eq!(insight.urgency_level, 4);
        assert_eq!(insight.themes, vec!["billing", "support"]);
    }

    #[test]
    fn missing_urgency_defaults_and_null_stage_is_none() {
        let mut item = valid_item();
        item.as_object_mut().unwrap().remove("urgency_level");
        item["journey_stage"] = Value::Null;

        let insight = validate_item(42, &item).unwrap();

        assert_eq!(insight.urgency_level, 3);
        assert_eq!(insight.journey_stage, None);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let cases = [
            ("/sentiment/score", json!(1.5)),
            ("/sentiment/confidence", json!(-0.1)),
            ("/urgency_level", json!(9)),
            ("/summary", json!("short")),
            ("/journey_stage", json!("loyalty")),
            ("/sentiment/label", json!("angry")),
        ];
        for (pointer, value) in cases {
            let mut item = valid_item();
            *item.pointer_mut(pointer).unwrap() = value;
            let err = validate_item(42, &item).unwrap_err();
            assert!(
                matches!(err, ExtractionError::InvalidSchema(_)),
                "{pointer} should be rejected"
            );
        }
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut item = valid_item();
        item.as_object_mut().unwrap().remove("sentiment");
        assert!(validate_item(42, &item).is_err());
    }

    #[test]
    fn split_results_keys_by_feedback_id() {
        let content = json!({
            "results": [
                { "feedback_id": 1, "summary": "a" },
                { "feedback_id": "2", "summary": "b" },
                { "summary": "no id" }
            ]
        })
        .to_string();

        let by_id = split_results(&content).unwrap();

        assert_eq!(by_id.len(), 2);
        assert_eq!(by_id[&2]["summary"], "b");
    }

    #[test]
    fn split_results_accepts_fenced_arrays() {
        let by_id = split_results("```json\n[{\"feedback_id\": 7}]\n```").unwrap();
        assert!(by_id.contains_key(&7));
    }

    #[test]
    fn split_results_rejects_non_json() {
        assert!(split_results("Sure! Here are the results").is_err());
        assert!(split_results("{\"items\": []}").is_err());
    }
}
