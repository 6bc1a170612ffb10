//! Two-stage theme assignment.
//!
//! Stage one matches taxonomy keywords against the insight's text. Only when
//! no rule matches does stage two embed the text and compare it with the
//! cached theme centroids; a match at or above the similarity threshold is
//! assigned with `weight = similarity`, otherwise a new emerging theme is
//! created around the embedding.
//!
//! Centroids are folded forward by moving average in the same store call
//! that links a member, so workers never read half-updated centroids.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;
use voc_core::{cosine_similarity, AppConfig, Insight, InsightTheme, Theme};
use voc_db::{DbError, Store};

use crate::embeddings::Embedder;
use crate::error::{ClassificationError, TaxonomyError};

const BUILTIN_TAXONOMY: &str = include_str!("taxonomy.yaml");
const RULE_WEIGHT_PER_HIT: f64 = 0.3;
const MAX_RULE_WEIGHT: f64 = 0.9;
const EMERGING_PREFIX: &str = "Emerging: ";
const EMERGING_KEYWORDS: usize = 3;
const EMERGING_NAME_TRIES: i64 = 5;

const STOPWORDS: &[&str] = &[
    "about", "after", "again", "also", "because", "been", "before", "being", "from", "have",
    "just", "like", "more", "much", "only", "other", "over", "really", "says", "said", "some",
    "than", "that", "their", "them", "then", "there", "they", "this", "very", "were", "what",
    "when", "which", "while", "with", "would", "your", "customer", "customers", "user", "users",
    "reports", "wants", "feels", "product", "still",
];

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-Z][a-zA-Z'-]{3,}").expect("valid word regex"));

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaxonomyEntry {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Taxonomy {
    pub themes: Vec<TaxonomyEntry>,
}

impl Taxonomy {
    /// # Errors
    ///
    /// Returns [`TaxonomyError::Yaml`] when the document does not match the
    /// `themes: [{name, description?, keywords[]}]` shape.
    pub fn from_yaml(raw: &str) -> Result<Self, TaxonomyError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// The taxonomy shipped with the crate.
    ///
    /// # Errors
    ///
    /// Returns [`TaxonomyError::Yaml`] if the bundled file is malformed.
    pub fn builtin() -> Result<Self, TaxonomyError> {
        Self::from_yaml(BUILTIN_TAXONOMY)
    }

    /// Read the taxonomy at `path`, or the built-in one when `path` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`TaxonomyError::Io`] if the file cannot be read and
    /// [`TaxonomyError::Yaml`] if it is malformed.
    pub fn load(path: Option<&Path>) -> Result<Self, TaxonomyError> {
        let Some(path) = path else {
            return Self::builtin();
        };
        let raw = std::fs::read_to_string(path).map_err(|source| TaxonomyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierConfig {
    pub similarity_threshold: f32,
    pub max_themes: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            max_themes: 3,
        }
    }
}

impl ClassifierConfig {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            max_themes: config.max_themes_per_insight,
        }
    }
}

/// A compiled taxonomy entry.
struct ThemeRule {
    name: String,
    description: Option<String>,
    pattern: Option<Regex>,
}

impl ThemeRule {
    fn compile(entry: &TaxonomyEntry) -> Result<Self, TaxonomyError> {
        let alternatives: Vec<String> = entry
            .keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();
        let pattern = if alternatives.is_empty() {
            None
        } else {
            let source = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
            Some(Regex::new(&source).map_err(|source| TaxonomyError::Pattern {
                theme: entry.name.clone(),
                source,
            })?)
        };
        Ok(Self {
            name: entry.name.clone(),
            description: entry.description.clone(),
            pattern,
        })
    }

    /// Number of distinct keywords found in `text`.
    fn hits(&self, text: &str) -> usize {
        let Some(pattern) = &self.pattern else {
            return 0;
        };
        pattern
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Weight of a rule match: `min(hits * 0.3, 0.9)`.
#[must_use]
pub fn rule_weight(hits: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let raw = hits as f64 * RULE_WEIGHT_PER_HIT;
    raw.min(MAX_RULE_WEIGHT)
}

/// Outcome of classifying one insight.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// Links written by this call, highest weight first.
    pub assignments: Vec<InsightTheme>,
    /// Set when no existing theme was close enough.
    pub emerging_theme: Option<Theme>,
    /// Embeddings could not be computed; only rules were applied.
    pub embedding_unavailable: bool,
}

pub struct ThemeClassifier {
    store: Arc<dyn Store>,
    embedder: Option<Arc<dyn Embedder>>,
    rules: Vec<ThemeRule>,
    config: ClassifierConfig,
}

impl ThemeClassifier {
    /// # Errors
    ///
    /// Returns [`TaxonomyError::Pattern`] if a keyword list cannot be
    /// compiled.
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Option<Arc<dyn Embedder>>,
        taxonomy: &Taxonomy,
        config: ClassifierConfig,
    ) -> Result<Self, TaxonomyError> {
        let rules = taxonomy
            .themes
            .iter()
            .map(ThemeRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            store,
            embedder,
            rules,
            config,
        })
    }

    /// Insert every taxonomy theme as a system theme. Existing themes are
    /// left as they are.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store fails.
    pub async fn seed_taxonomy(&self) -> Result<Vec<Theme>, DbError> {
        let mut themes = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            themes.push(
                self.store
                    .upsert_theme(&rule.name, rule.description.as_deref(), true)
                    .await?,
            );
        }
        tracing::info!(count = themes.len(), "classifier: taxonomy seeded");
        Ok(themes)
    }

    /// Assign themes to `insight`.
    ///
    /// Re-classifying an insight is harmless: existing links are kept and
    /// centroids only move for new links.
    ///
    /// # Errors
    ///
    /// Returns [`ClassificationError::Store`] if the store fails. An
    /// unreachable embedding service is not an error; the result is flagged
    /// instead.
    pub async fn classify(&self, insight: &Insight) -> Result<Classification, ClassificationError> {
        let text = insight.classification_text();
        let mut result = Classification::default();

        let mut matched: Vec<(&ThemeRule, f64)> = self
            .rules
            .iter()
            .filter_map(|rule| {
                let hits = rule.hits(&text);
                (hits > 0).then(|| (rule, rule_weight(hits)))
            })
            .collect();
        matched.sort_by(|a, b| b.1.total_cmp(&a.1));
        matched.truncate(self.config.max_themes.max(1));

        let embedding = match self.embed(&text).await {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!(
                    insight_id = insight.id,
                    error = %e,
                    "classifier: embedding unavailable, using rules only"
                );
                result.embedding_unavailable = true;
                None
            }
        };

        if !matched.is_empty() {
            for (rule, weight) in matched {
                let theme = self.theme_by_name(rule).await?;
                self.link(insight.id, theme.id, weight, embedding.as_deref(), &mut result)
                    .await?;
            }
            return Ok(result);
        }

        let Some(embedding) = embedding else {
            tracing::debug!(insight_id = insight.id, "classifier: no rule matched and no embedding");
            return Ok(result);
        };

        let mut similar: Vec<(i64, f32)> = self
            .store
            .list_theme_centroids()
            .await?
            .into_iter()
            .filter_map(|c| cosine_similarity(&embedding, &c.centroid).map(|s| (c.theme_id, s)))
            .filter(|(_, s)| *s >= self.config.similarity_threshold)
            .collect();
        similar.sort_by(|a, b| b.1.total_cmp(&a.1));
        similar.truncate(self.config.max_themes.max(1));

        if similar.is_empty() {
            let theme = self.create_emerging_theme(insight, &embedding).await?;
            tracing::info!(
                insight_id = insight.id,
                theme_id = theme.id,
                theme = %theme.name,
                "classifier: emerging theme created"
            );
            self.link(insight.id, theme.id, 1.0, Some(&embedding), &mut result)
                .await?;
            result.emerging_theme = Some(theme);
            return Ok(result);
        }

        for (theme_id, similarity) in similar {
            self.link(
                insight.id,
                theme_id,
                f64::from(similarity),
                Some(&embedding),
                &mut result,
            )
            .await?;
        }
        Ok(result)
    }

    /// A fresh theme around `embedding`. Taken names get the insight id
    /// appended rather than absorbing the insight into an unrelated theme.
    async fn create_emerging_theme(
        &self,
        insight: &Insight,
        embedding: &[f32],
    ) -> Result<Theme, ClassificationError> {
        let base = emerging_theme_name(insight);
        let candidates = std::iter::once(base.clone())
            .chain(std::iter::once(format!("{base} #{}", insight.id)))
            .chain((2..=EMERGING_NAME_TRIES).map(|n| format!("{base} #{}-{n}", insight.id)));
        for name in candidates {
            if let Some(theme) = self
                .store
                .create_emerging_theme(&name, &insight.summary, embedding)
                .await?
            {
                return Ok(theme);
            }
            tracing::debug!(insight_id = insight.id, theme = %name, "classifier: theme name taken");
        }
        Err(ClassificationError::ThemeNameTaken(base))
    }

    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, ClassificationError> {
        let Some(embedder) = &self.embedder else {
            return Ok(None);
        };
        let mut vectors = embedder
            .embed(&[text])
            .await
            .map_err(|e| ClassificationError::EmbeddingUnavailable(e.to_string()))?;
        match vectors.pop() {
            Some(v) if !v.is_empty() => Ok(Some(v)),
            _ => Err(ClassificationError::EmbeddingUnavailable(
                "empty embedding".to_string(),
            )),
        }
    }

    async fn theme_by_name(&self, rule: &ThemeRule) -> Result<Theme, DbError> {
        self.store
            .upsert_theme(&rule.name, rule.description.as_deref(), true)
            .await
    }

    async fn link(
        &self,
        insight_id: i64,
        theme_id: i64,
        weight: f64,
        embedding: Option<&[f32]>,
        result: &mut Classification,
    ) -> Result<(), DbError> {
        let link = InsightTheme {
            insight_id,
            theme_id,
            weight: weight.clamp(0.0, 1.0),
        };
        if self.store.assign_theme(&link, embedding).await? {
            tracing::debug!(insight_id, theme_id, weight = link.weight, "classifier: theme assigned");
            result.assignments.push(link);
        }
        Ok(())
    }
}

/// `"Emerging: "` followed by the most frequent content words of the
/// insight's summary.
#[must_use]
pub fn emerging_theme_name(insight: &Insight) -> String {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (position, word) in WORD_RE.find_iter(&insight.summary).enumerate() {
        let word = word.as_str().trim_matches(|c| c == '\'' || c == '-').to_lowercase();
        if word.len() < 4 || STOPWORDS.contains(&word.as_str()) {
            continue;
        }
        counts.entry(word).or_insert((0, position)).0 += 1;
    }
    let mut words: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    words.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    let keywords: Vec<String> = words
        .into_iter()
        .take(EMERGING_KEYWORDS)
        .map(|(w, _)| w)
        .collect();

    if keywords.is_empty() {
        format!("{EMERGING_PREFIX}insight {}", insight.id)
    } else {
        format!("{EMERGING_PREFIX}{}", keywords.join(", "))
    }
}

#[cfg(test)]
#[path = "classifier_test.rs"]
mod tests;
