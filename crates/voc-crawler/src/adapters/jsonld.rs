//! Review extraction from `<script type="application/ld+json">` blocks.
//!
//! Trustpilot and G2 both embed schema.org `Review` nodes in their listing
//! pages; both adapters read reviews from those nodes only. Quora question
//! pages carry a `QAPage` whose `Question` lists its `Answer` nodes.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde_json::{json, Value};

use crate::client::PoliteClient;
use crate::error::CrawlError;
use crate::types::RawRecord;

const MAX_PAGES: usize = 10;

static SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<script[^>]*type\s*=\s*["']application/ld\+json["'][^>]*>(.*?)</script>"#)
        .expect("valid json-ld script regex")
});

/// Walk `?page=N` listing pages until `limit` reviews are collected, a page
/// yields nothing new, or the page cap is reached.
///
/// Records gathered before an error stay in `records`.
pub(super) async fn collect_review_pages(
    client: &PoliteClient,
    min_delay: Duration,
    page_url: impl Fn(usize) -> String,
    limit: usize,
    records: &mut Vec<RawRecord>,
) -> Result<(), CrawlError> {
    let mut seen = HashSet::new();
    for page in 1..=MAX_PAGES {
        if records.len() >= limit {
            break;
        }
        let html = client.get_text(&page_url(page), min_delay).await?;
        let before = records.len();
        for review in extract_reviews(&html) {
            if records.len() >= limit {
                break;
            }
            if seen.insert(review.external_id.clone()) {
                records.push(review);
            }
        }
        if records.len() == before {
            break;
        }
    }
    Ok(())
}

fn json_ld_blocks(html: &str) -> Vec<Value> {
    let mut blocks = Vec::new();
    for cap in SCRIPT_RE.captures_iter(html) {
        let raw = cap.get(1).map_or("", |m| m.as_str()).trim();
        if raw.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => blocks.push(value),
            Err(_) => tracing::debug!("crawler: skipping unparseable json-ld block"),
        }
    }
    blocks
}

/// Every schema.org `Review` node found in `html`, in document order.
pub(super) fn extract_reviews(html: &str) -> Vec<RawRecord> {
    let mut out = Vec::new();
    for value in json_ld_blocks(html) {
        collect_reviews(&value, &mut out);
    }
    out
}

/// Every `Answer` of every `Question` node in `html`, titled with the
/// question text.
pub(super) fn extract_answers(html: &str) -> Vec<RawRecord> {
    let mut out = Vec::new();
    for value in json_ld_blocks(html) {
        collect_answers(&value, &mut out);
    }
    out
}

fn collect_answers(value: &Value, out: &mut Vec<RawRecord>) {
    match value {
        Value::Object(map) => {
            if has_type(map.get("@type"), "Question") {
                let question = str_field(value, &["name", "text"]);
                for key in ["acceptedAnswer", "suggestedAnswer"] {
                    let answers = match map.get(key) {
                        Some(Value::Array(items)) => items.iter().collect(),
                        Some(answer @ Value::Object(_)) => vec![answer],
                        _ => Vec::new(),
                    };
                    for answer in answers {
                        if let Some(record) = answer_record(answer, question) {
                            out.push(record);
                        }
                    }
                }
                return;
            }
            for child in map.values() {
                collect_answers(child, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_answers(child, out);
            }
        }
        _ => {}
    }
}

fn answer_record(node: &Value, question: Option<&str>) -> Option<RawRecord> {
    let mut record = to_record(node)?;
    record.title = question.map(str::to_string);
    let upvotes = node.get("upvoteCount").and_then(Value::as_i64);
    record.metadata = json!({ "question": question, "upvotes": upvotes });
    Some(record)
}

fn has_type(node_type: Option<&Value>, wanted: &str) -> bool {
    match node_type {
        Some(Value::String(s)) => s == wanted,
        Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).any(|s| s == wanted),
        _ => false,
    }
}

fn collect_reviews(value: &Value, out: &mut Vec<RawRecord>) {
    match value {
        Value::Object(map) => {
            if is_review_node(map.get("@type")) {
                if let Some(record) = to_record(value) {
                    out.push(record);
                }
                return;
            }
            for child in map.values() {
                collect_reviews(child, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_reviews(child, out);
            }
        }
        _ => {}
    }
}

fn is_review_node(node_type: Option<&Value>) -> bool {
    let is_review = |s: &str| matches!(s, "Review" | "UserReview" | "CriticReview");
    match node_type {
        Some(Value::String(s)) => is_review(s),
        Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).any(is_review),
        _ => false,
    }
}

fn str_field<'a>(node: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| node.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn rating_value(node: &Value) -> Option<f64> {
    let raw = node.get("reviewRating")?.get("ratingValue")?;
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_record(node: &Value) -> Option<RawRecord> {
    let body = str_field(node, &["reviewBody", "description", "text"])?;
    let headline = str_field(node, &["headline", "name"]);
    let author = match node.get("author") {
        Some(Value::String(s)) => Some(s.trim()).filter(|s| !s.is_empty()),
        Some(author) => str_field(author, &["name"]),
        None => None,
    };
    let published = str_field(node, &["datePublished", "dateCreated"]);
    let url = str_field(node, &["url"]);

    let external_id = str_field(node, &["@id"])
        .or(url)
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!(
                "{}:{}",
                author.unwrap_or("anonymous"),
                published.unwrap_or("undated")
            )
        });

    Some(RawRecord {
        external_id,
        content: body.to_string(),
        title: headline.map(str::to_string),
        author_handle: author.map(str::to_string),
        url: url.map(str::to_string),
        posted_at: published.and_then(parse_date),
        metadata: json!({ "rating": rating_value(node) }),
    })
}

/// RFC 3339 timestamps, or bare `YYYY-MM-DD` dates taken as UTC midnight.
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let date = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head>
<script type="application/ld+json">
{"@context":"https://schema.org","@graph":[
  {"@type":"Organization","name":"Acme"},
  {"@type":"Review","@id":"https://reviews.test/r/1","headline":"Billing mess",
   "reviewBody":"I was charged twice and support never answered.",
   "author":{"@type":"Person","name":"Dana"},
   "datePublished":"2024-04-02T08:30:00.000Z",
   "reviewRating":{"@type":"Rating","ratingValue":"1"}},
  {"@type":"Review","reviewBody":"Works well for our team.","author":"Lee",
   "datePublished":"2024-03-15","reviewRating":{"ratingValue":4.5}}
]}
</script>
<script type="application/ld+json">{not json}</script>
</head></html>"#;

    #[test]
    fn extracts_review_nodes_from_graph() {
        let reviews = extract_reviews(PAGE);
        assert_eq!(reviews.len(), 2);

        assert_eq!(reviews[0].external_id, "https://reviews.test/r/1");
        assert_eq!(reviews[0].title.as_deref(), Some("Billing mess"));
        assert_eq!(reviews[0].author_handle.as_deref(), Some("Dana"));
        assert_eq!(reviews[0].metadata["rating"], json!(1.0));

        assert_eq!(reviews[1].external_id, "Lee:2024-03-15");
        assert_eq!(
            reviews[1].posted_at.map(|t| t.to_rfc3339()),
            Some("2024-03-15T00:00:00+00:00".to_string())
        );
    }

    #[test]
    fn answers_carry_their_question_as_title() {
        let html = r#"<script type="application/ld+json">
{"@context":"https://schema.org","@type":"QAPage","mainEntity":{
  "@type":"Question","name":"Is Acme worth the price?",
  "acceptedAnswer":{"@type":"Answer","text":"Not since the last price hike.",
    "url":"https://quora.test/a/1","author":{"name":"Sam"},"dateCreated":"2024-05-01T10:00:00Z",
    "upvoteCount":12},
  "suggestedAnswer":[
    {"@type":"Answer","text":"Yes for small teams.","url":"https://quora.test/a/2"},
    {"@type":"Answer","name":"no body"}
  ]}}
</script>"#;

        let answers = extract_answers(html);

        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].external_id, "https://quora.test/a/1");
        assert_eq!(answers[0].title.as_deref(), Some("Is Acme worth the price?"));
        assert_eq!(answers[0].author_handle.as_deref(), Some("Sam"));
        assert_eq!(answers[0].metadata["upvotes"], json!(12));
        assert_eq!(answers[1].content, "Yes for small teams.");
        assert!(extract_reviews(html).is_empty());
    }

    #[test]
    fn reviews_without_body_are_skipped() {
        let html = r#"<script type="application/ld+json">{"@type":"Review","name":"Empty"}</script>"#;
        assert!(extract_reviews(html).is_empty());
    }
}
