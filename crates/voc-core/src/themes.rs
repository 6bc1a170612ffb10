use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Theme {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

/// Cached mean embedding of a theme's members.
#[derive(Debug, Clone, PartialEq)]
pub struct ThemeCentroid {
    pub theme_id: i64,
    pub centroid: Vec<f32>,
    pub member_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightTheme {
    pub insight_id: i64,
    pub theme_id: i64,
    pub weight: f64,
}

/// Cosine similarity of two vectors.
///
/// Returns `None` when the dimensions differ or either vector has zero norm.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let similarity = (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32;
    Some(similarity.clamp(-1.0, 1.0))
}

/// Fold one new member into a centroid that currently averages
/// `member_count` members: `c + (v - c) / (n + 1)`.
///
/// Returns `None` when the dimensions differ.
#[must_use]
pub fn moving_average(centroid: &[f32], member: &[f32], member_count: i64) -> Option<Vec<f32>> {
    if centroid.len() != member.len() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = (member_count.max(0) + 1) as f32;
    Some(
        centroid
            .iter()
            .zip(member)
            .map(|(c, v)| c + (v - c) / n)
            .collect(),
    )
}
