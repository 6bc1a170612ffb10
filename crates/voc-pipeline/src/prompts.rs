//! Prompt text for insight extraction.

use serde_json::json;
use voc_core::Feedback;

use crate::llm::CompletionRequest;

/// Per-item content cap; long posts are cut rather than blowing the context.
const MAX_ITEM_CHARS: usize = 6_000;

pub const SYSTEM_PROMPT: &str = r#"You analyze customer feedback for a product team.
For every feedback item you are given, return one result object. Respond with a single JSON object of the form {"results": [ ... ]} and nothing else.

Each result object has exactly these fields:
- "feedback_id": the integer id of the item, copied unchanged
- "sentiment": {"score": number from -1.0 (very negative) to 1.0 (very positive), "label": "positive" | "negative" | "neutral" | "mixed", "confidence": number from 0.0 to 1.0}
- "summary": one or two sentences (at least 10 characters) stating what the customer is saying
- "pain_points": array of {"description": string, "severity": "critical" | "high" | "medium" | "low", "category": string or null}
- "feature_requests": array of {"description": string, "priority": "urgent" | "high" | "medium" | "low", "use_case": string or null}
- "competitor_mentions": array of {"competitor_name": string, "context": string, "sentiment": "positive" | "negative" | "neutral"}
- "customer_context": {"user_segment": string or null, "experience_level": string or null, "use_case_domain": string or null}
- "journey_stage": "awareness" | "consideration" | "purchase" | "retention" | "advocacy" or null
- "urgency_level": integer from 1 (no action needed) to 5 (needs immediate attention)
- "themes": array of short lowercase topic labels such as "pricing", "performance", "onboarding"

Use empty arrays when nothing applies. Do not invent facts that are not in the text."#;

/// One request covering every item in the batch.
#[must_use]
pub fn batch_request(items: &[Feedback]) -> CompletionRequest {
    let mut user = format!(
        "Analyze the following {} feedback items. Each line is one JSON-encoded item.\n\n",
        items.len()
    );
    push_items(&mut user, items);
    CompletionRequest {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// Stricter follow-up for items whose first answer was missing or invalid.
///
/// `problems` pairs each feedback id with what was wrong.
#[must_use]
pub fn strict_reprompt(items: &[Feedback], problems: &[(i64, String)]) -> CompletionRequest {
    let mut user = String::from(
        "Your previous answer for these items did not match the required format.\n",
    );
    for (id, problem) in problems {
        user.push_str(&format!("- feedback_id {id}: {problem}\n"));
    }
    user.push_str(
        "\nReturn ONLY {\"results\": [...]} with one complete object per item below. \
         Every field is required; numbers must be within their stated ranges and enum \
         fields must use one of the listed values exactly.\n\n",
    );
    push_items(&mut user, items);
    CompletionRequest {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

fn push_items(out: &mut String, items: &[Feedback]) {
    for item in items {
        let content: String = item.clean_content.chars().take(MAX_ITEM_CHARS).collect();
        let line = json!({
            "feedback_id": item.id,
            "platform": item.metadata.get("platform"),
            "content": content,
        });
        out.push_str(&line.to_string());
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use voc_core::ExtractionStatus;

    use super::*;

    fn feedback(id: i64, content: &str) -> Feedback {
        Feedback {
            id,
            source_id: 1,
            crawl_run_id: None,
            external_id: format!("ext-{id}"),
            raw_content: content.to_string(),
            clean_content: content.to_string(),
            fingerprint: String::new(),
            posted_at: Utc::now(),
            author_handle: None,
            url: None,
            metadata: json!({ "platform": "g2" }),
            extraction_status: ExtractionStatus::Pending,
            extraction_attempts: 0,
            extraction_error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn batch_request_lists_every_item_as_json_line() {
        let request = batch_request(&[feedback(11, "Too \"expensive\""), feedback(12, "Love it")]);
        let lines: Vec<serde_json::Value> = request
            .user
            .lines()
            .filter(|l| l.starts_with('{'))
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["feedback_id"], 11);
        assert_eq!(lines[0]["content"], "Too \"expensive\"");
        assert_eq!(lines[1]["platform"], "g2");
        assert!(request.system.contains("\"results\""));
    }

    #[test]
    fn reprompt_names_the_problems() {
        let request = strict_reprompt(
            &[feedback(5, "Crashes on export")],
            &[(5, "missing from response".to_string())],
        );
        assert!(request.user.contains("feedback_id 5: missing from response"));
        assert!(request.user.contains("\"feedback_id\":5"));
    }
}
