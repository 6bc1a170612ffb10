//! Normalization, validation and fingerprinting of raw crawler records.
//!
//! The cleaner is pure: it turns a [`RawRecord`] into a [`NewFeedback`] or a
//! [`CleaningError`] carrying the discard reason. Inserting and counting is
//! done by [`crate::ingest`].

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use voc_core::{DiscardReason, NewFeedback};
use voc_crawler::RawRecord;

use crate::error::CleaningError;

pub const DEFAULT_MIN_CONTENT_CHARS: usize = 40;

/// Lines this short that start with one of these phrases are page chrome,
/// not customer content.
const BOILERPLATE_PREFIXES: &[&str] = &[
    "sponsored",
    "advertisement",
    "promoted",
    "reply",
    "share",
    "report",
    "save",
    "sign up",
    "log in",
    "login",
    "cookie",
    "accept cookies",
    "we use cookies",
    "read more",
    "see more",
    "continue reading",
    "was this review helpful",
];
const BOILERPLATE_MAX_CHARS: usize = 40;

static BLOCK_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(?:p|div|li|h[1-6]|tr|blockquote)>")
        .expect("valid block tag regex")
});
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>\n]{1,500}>").expect("valid tag regex"));
static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").expect("valid entity regex")
});
static MD_IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("valid markdown image regex"));
static MD_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]*\)").expect("valid markdown link regex"));
static MD_BOLD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*\*([^*\n]+)\*\*|__([^_\n]+)__|~~([^~\n]+)~~").expect("valid markdown bold regex")
});
static MD_STAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*\n]+)\*").expect("valid markdown emphasis regex"));
static MD_UNDERSCORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b_([^_\n]+)_\b").expect("valid markdown underscore regex"));
static MD_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`\n]*)`").expect("valid markdown code regex"));
static MD_LINE_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:#{1,6}[ \t]+|>[ \t]?|[-*+][ \t]+|\d{1,3}\.[ \t]+)")
        .expect("valid markdown line prefix regex")
});
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+").expect("valid url regex"));
static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[\s(])(?:/?u/|@)[A-Za-z0-9_-]{2,30}").expect("valid mention regex")
});
static HASHTAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)#[A-Za-z][A-Za-z0-9_]*").expect("valid hashtag regex"));
static INVISIBLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\u{200B}-\u{200D}\u{2060}\u{FEFF}\u{00AD}]").expect("valid invisible char regex")
});
static SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\S\n]+").expect("valid whitespace regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleaningOptions {
    /// Minimum length in characters after cleaning.
    pub min_content_chars: usize,
    /// Remove `#hashtags` entirely instead of keeping them as words.
    pub strip_hashtags: bool,
}

impl Default for CleaningOptions {
    fn default() -> Self {
        Self {
            min_content_chars: DEFAULT_MIN_CONTENT_CHARS,
            strip_hashtags: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Cleaner {
    options: CleaningOptions,
}

impl Cleaner {
    #[must_use]
    pub fn new(options: CleaningOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn options(&self) -> CleaningOptions {
        self.options
    }

    /// Validate and clean one record into insertable feedback.
    ///
    /// # Errors
    ///
    /// Returns [`CleaningError::MalformedContent`] with the discard reason
    /// when the record lacks a timestamp or source attribution, or when
    /// nothing (or too little) survives cleaning.
    pub fn prepare(
        &self,
        source_id: i64,
        crawl_run_id: Option<i64>,
        record: &RawRecord,
    ) -> Result<NewFeedback, CleaningError> {
        let reject = |reason| CleaningError::MalformedContent { reason };

        let external_id = record.external_id.trim();
        if external_id.is_empty() {
            return Err(reject(DiscardReason::MissingSource));
        }
        let posted_at = record
            .posted_at
            .ok_or(reject(DiscardReason::MissingTimestamp))?;

        let raw_content = record.full_text();
        let clean_content = self.clean_text(&raw_content);
        if clean_content.is_empty() {
            return Err(reject(DiscardReason::Empty));
        }
        if clean_content.chars().count() < self.options.min_content_chars {
            return Err(reject(DiscardReason::TooShort));
        }

        Ok(NewFeedback {
            source_id,
            crawl_run_id,
            external_id: external_id.to_string(),
            fingerprint: fingerprint(source_id, &clean_content),
            raw_content,
            clean_content,
            posted_at,
            author_handle: record.author_handle.clone(),
            url: record.url.clone(),
            metadata: record.metadata.clone(),
        })
    }

    /// Strip markup, links, mentions and page chrome, then collapse
    /// whitespace. Paragraph breaks survive as single newlines.
    #[must_use]
    pub fn clean_text(&self, raw: &str) -> String {
        let text = BLOCK_TAG_RE.replace_all(raw, "\n");
        let text = TAG_RE.replace_all(&text, " ");
        let text = decode_entities(&text);
        let text = INVISIBLE_RE.replace_all(&text, "");

        let text = MD_IMAGE_RE.replace_all(&text, " ");
        let text = MD_LINK_RE.replace_all(&text, "$1");
        let text = MD_BOLD_RE.replace_all(&text, |caps: &Captures<'_>| {
            (1..=3)
                .find_map(|i| caps.get(i))
                .map_or(String::new(), |m| m.as_str().to_string())
        });
        let text = MD_STAR_RE.replace_all(&text, "$1");
        let text = MD_UNDERSCORE_RE.replace_all(&text, "$1");
        let text = MD_CODE_RE.replace_all(&text, "$1");
        let text = MD_LINE_PREFIX_RE.replace_all(&text, "");

        let text = URL_RE.replace_all(&text, " ");
        let text = MENTION_RE.replace_all(&text, "${1}");
        let text = if self.options.strip_hashtags {
            HASHTAG_RE.replace_all(&text, "${1}").into_owned()
        } else {
            text.into_owned()
        };

        text.lines()
            .map(|line| SPACE_RE.replace_all(line.trim(), " ").into_owned())
            .filter(|line| !line.is_empty() && !is_boilerplate(line))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn is_boilerplate(line: &str) -> bool {
    if line.chars().count() > BOILERPLATE_MAX_CHARS {
        return false;
    }
    let lower = line.to_lowercase();
    BOILERPLATE_PREFIXES.iter().any(|prefix| {
        lower.strip_prefix(prefix).is_some_and(|rest| {
            rest.chars()
                .next()
                .is_none_or(|c| !c.is_alphanumeric())
        })
    })
}

fn decode_entities(text: &str) -> Cow<'_, str> {
    ENTITY_RE.replace_all(text, |caps: &Captures<'_>| {
        let body = &caps[1];
        let decoded = if let Some(num) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
            u32::from_str_radix(num, 16).ok().and_then(char::from_u32)
        } else if let Some(num) = body.strip_prefix('#') {
            num.parse::<u32>().ok().and_then(char::from_u32)
        } else {
            named_entity(body)
        };
        decoded.map_or_else(|| caps[0].to_string(), String::from)
    })
}

fn named_entity(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        "ndash" => '–',
        "mdash" => '—',
        "hellip" => '…',
        "lsquo" => '‘',
        "rsquo" => '’',
        "ldquo" => '“',
        "rdquo" => '”',
        "copy" => '©',
        "reg" => '®',
        "trade" => '™',
        "euro" => '€',
        "pound" => '£',
        _ => return None,
    })
}

/// SHA-256 hex of the source id and the case- and whitespace-folded content.
#[must_use]
pub fn fingerprint(source_id: i64, clean_content: &str) -> String {
    let folded = clean_content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(source_id.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(folded.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;

    fn record(external_id: &str, title: Option<&str>, content: &str) -> RawRecord {
        RawRecord {
            external_id: external_id.to_string(),
            content: content.to_string(),
            title: title.map(str::to_string),
            author_handle: Some("someone".to_string()),
            url: None,
            posted_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
            metadata: json!({}),
        }
    }

    // -----------------------------------------------------------------------
    // clean_text
    // -----------------------------------------------------------------------

    #[test]
    fn strips_html_and_decodes_entities() {
        let cleaner = Cleaner::default();
        let out = cleaner.clean_text("<p>Billing &amp; invoices</p><p>are&nbsp;broken &#8212; again</p>");
        assert_eq!(out, "Billing & invoices\nare broken — again");
    }

    #[test]
    fn keeps_link_text_and_drops_urls() {
        let cleaner = Cleaner::default();
        let out = cleaner.clean_text(
            "See [the changelog](https://acme.test/changes) and https://acme.test/x for **details**",
        );
        assert_eq!(out, "See the changelog and for details");
    }

    #[test]
    fn underscores_inside_words_survive() {
        let cleaner = Cleaner::default();
        assert_eq!(
            cleaner.clean_text("the export_csv flag is _really_ slow"),
            "the export_csv flag is really slow"
        );
    }

    #[test]
    fn removes_mentions_and_optionally_hashtags() {
        let keep = Cleaner::default();
        assert_eq!(
            keep.clean_text("@acme_support why is sync down #outage"),
            "why is sync down #outage"
        );

        let strip = Cleaner::new(CleaningOptions {
            strip_hashtags: true,
            ..CleaningOptions::default()
        });
        assert_eq!(strip.clean_text("why is sync down #outage"), "why is sync down");
    }

    #[test]
    fn drops_boilerplate_lines() {
        let cleaner = Cleaner::default();
        let out = cleaner.clean_text(
            "Sponsored\nThe app crashes whenever I save a large file.\nReply\nShare · Report\nRead more",
        );
        assert_eq!(out, "The app crashes whenever I save a large file.");
    }

    #[test]
    fn long_lines_starting_with_a_chrome_word_are_kept() {
        let cleaner = Cleaner::default();
        let line = "Save button does nothing on the settings page after the update";
        assert_eq!(cleaner.clean_text(line), line);
    }

    #[test]
    fn collapses_whitespace_and_strips_invisible_chars() {
        let cleaner = Cleaner::default();
        assert_eq!(
            cleaner.clean_text("  too\u{200B}   many \t spaces \n\n\n here  "),
            "too many spaces\nhere"
        );
    }

    // -----------------------------------------------------------------------
    // prepare
    // -----------------------------------------------------------------------

    #[test]
    fn prepare_rejects_missing_attribution_and_timestamp() {
        let cleaner = Cleaner::default();
        let body = "The onboarding flow asked for my card before showing any pricing.";

        let err = cleaner.prepare(1, None, &record("  ", None, body)).unwrap_err();
        assert_eq!(err.reason(), DiscardReason::MissingSource);

        let mut undated = record("a1", None, body);
        undated.posted_at = None;
        let err = cleaner.prepare(1, None, &undated).unwrap_err();
        assert_eq!(err.reason(), DiscardReason::MissingTimestamp);
    }

    #[test]
    fn prepare_rejects_empty_and_short_content() {
        let cleaner = Cleaner::default();

        let err = cleaner
            .prepare(1, None, &record("a1", None, "<div></div> https://x.test"))
            .unwrap_err();
        assert_eq!(err.reason(), DiscardReason::Empty);

        let err = cleaner
            .prepare(1, None, &record("a2", None, "meh, it works"))
            .unwrap_err();
        assert_eq!(err.reason(), DiscardReason::TooShort);
    }

    #[test]
    fn prepare_fills_feedback_fields() {
        let cleaner = Cleaner::default();
        let feedback = cleaner
            .prepare(
                7,
                Some(3),
                &record(
                    "t3_abc",
                    Some("App keeps crashing on save"),
                    "Every time I hit save on a big project the whole app closes.",
                ),
            )
            .unwrap();

        assert_eq!(feedback.source_id, 7);
        assert_eq!(feedback.crawl_run_id, Some(3));
        assert_eq!(feedback.external_id, "t3_abc");
        assert!(feedback.clean_content.starts_with("App keeps crashing on save\n"));
        assert_eq!(feedback.fingerprint, fingerprint(7, &feedback.clean_content));
        assert_eq!(feedback.fingerprint.len(), 64);
    }

    // -----------------------------------------------------------------------
    // fingerprint
    // -----------------------------------------------------------------------

    #[test]
    fn fingerprint_ignores_case_and_spacing() {
        assert_eq!(
            fingerprint(1, "App keeps crashing\non save"),
            fingerprint(1, "app  keeps CRASHING on save")
        );
    }

    #[test]
    fn fingerprint_is_scoped_to_source() {
        assert_ne!(fingerprint(1, "same text"), fingerprint(2, "same text"));
    }
}
