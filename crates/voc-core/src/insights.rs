use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

text_enum! {
    SentimentLabel {
        Positive => "positive",
        Negative => "negative",
        Neutral => "neutral",
        Mixed => "mixed",
    }
}

text_enum! {
    JourneyStage {
        Awareness => "awareness",
        Consideration => "consideration",
        Purchase => "purchase",
        Retention => "retention",
        Advocacy => "advocacy",
    }
}

text_enum! {
    PainSeverity {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

text_enum! {
    FeaturePriority {
        Low => "low",
        Medium => "medium",
        High => "high",
        Urgent => "urgent",
    }
}

text_enum! {
    MentionSentiment {
        Positive => "positive",
        Negative => "negative",
        Neutral => "neutral",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PainPoint {
    pub description: String,
    pub severity: PainSeverity,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRequest {
    pub description: String,
    pub priority: FeaturePriority,
    #[serde(default)]
    pub use_case: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorMention {
    pub competitor_name: String,
    pub context: String,
    pub sentiment: MentionSentiment,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerContext {
    #[serde(default)]
    pub user_segment: Option<String>,
    #[serde(default)]
    pub experience_level: Option<String>,
    #[serde(default)]
    pub use_case_domain: Option<String>,
}

/// A fully validated extraction, ready to be stored as an insight.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInsight {
    pub feedback_id: i64,
    pub sentiment_score: f64,
    pub sentiment_label: SentimentLabel,
    pub sentiment_confidence: f64,
    pub summary: String,
    pub pain_points: Vec<PainPoint>,
    pub feature_requests: Vec<FeatureRequest>,
    pub competitor_mentions: Vec<CompetitorMention>,
    pub customer_context: CustomerContext,
    pub journey_stage: Option<JourneyStage>,
    pub urgency_level: i16,
    pub themes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insight {
    pub id: i64,
    pub feedback_id: i64,
    pub sentiment_score: f64,
    pub sentiment_label: SentimentLabel,
    pub sentiment_confidence: f64,
    pub summary: String,
    pub pain_points: Vec<PainPoint>,
    pub feature_requests: Vec<FeatureRequest>,
    pub competitor_mentions: Vec<CompetitorMention>,
    pub customer_context: CustomerContext,
    pub journey_stage: Option<JourneyStage>,
    pub urgency_level: i16,
    pub themes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Insight {
    #[must_use]
    pub fn from_new(id: i64, new: NewInsight, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            feedback_id: new.feedback_id,
            sentiment_score: new.sentiment_score,
            sentiment_label: new.sentiment_label,
            sentiment_confidence: new.sentiment_confidence,
            summary: new.summary,
            pain_points: new.pain_points,
            feature_requests: new.feature_requests,
            competitor_mentions: new.competitor_mentions,
            customer_context: new.customer_context,
            journey_stage: new.journey_stage,
            urgency_level: new.urgency_level,
            themes: new.themes,
            created_at,
        }
    }

    /// Sentiment on a 1..=5 scale (`3 + 2 * score`), the unit alert
    /// thresholds are written in.
    #[must_use]
    pub fn sentiment_rating(&self) -> f64 {
        3.0 + 2.0 * self.sentiment_score
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.sentiment_label == SentimentLabel::Negative
            || (self.sentiment_label == SentimentLabel::Mixed && self.sentiment_score < -0.25)
    }

    /// Text the theme classifier matches rules against and embeds.
    #[must_use]
    pub fn classification_text(&self) -> String {
        let mut parts = vec![self.summary.clone()];
        parts.extend(self.pain_points.iter().map(|p| p.description.clone()));
        parts.extend(self.pain_points.iter().filter_map(|p| p.category.clone()));
        parts.extend(self.feature_requests.iter().map(|f| f.description.clone()));
        parts.extend(self.themes.iter().cloned());
        parts.join("\n")
    }
}

/// An insight paired with the cleaned text of its feedback, as seen by the
/// alert evaluator.
#[derive(Debug, Clone)]
pub struct WindowInsight {
    pub insight: Insight,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insight(score: f64, label: SentimentLabel) -> Insight {
        Insight {
            id: 1,
            feedback_id: 1,
            sentiment_score: score,
            sentiment_label: label,
            sentiment_confidence: 0.9,
            summary: "Export to CSV is too slow".to_string(),
            pain_points: vec![PainPoint {
                description: "exports time out".to_string(),
                severity: PainSeverity::High,
                category: Some("performance".to_string()),
            }],
            feature_requests: vec![],
            competitor_mentions: vec![],
            customer_context: CustomerContext::default(),
            journey_stage: None,
            urgency_level: 3,
            themes: vec!["exports".to_string()],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn rating_maps_score_onto_five_point_scale() {
        assert!((insight(-1.0, SentimentLabel::Negative).sentiment_rating() - 1.0).abs() < 1e-9);
        assert!((insight(0.0, SentimentLabel::Neutral).sentiment_rating() - 3.0).abs() < 1e-9);
        assert!((insight(-0.3, SentimentLabel::Negative).sentiment_rating() - 2.4).abs() < 1e-9);
    }

    #[test]
    fn mixed_counts_as_negative_only_when_clearly_negative() {
        assert!(insight(-0.5, SentimentLabel::Mixed).is_negative());
        assert!(!insight(-0.1, SentimentLabel::Mixed).is_negative());
        assert!(insight(-0.1, SentimentLabel::Negative).is_negative());
    }

    #[test]
    fn classification_text_includes_pain_points_and_hints() {
        let text = insight(0.0, SentimentLabel::Neutral).classification_text();
        assert!(text.contains("exports time out"));
        assert!(text.contains("performance"));
        assert!(text.contains("exports"));
    }
}
