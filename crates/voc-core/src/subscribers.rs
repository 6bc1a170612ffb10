//! Outbound event subscriptions.
//!
//! Subscribers are configured as a list of `events|url` entries separated by
//! `;` or whitespace, e.g.
//! `alert.triggered|https://a.example/hook; *|https://b.example/hook`.
//! `*` subscribes to every event type.

use serde::Serialize;

text_enum! {
    /// Event types delivered to subscribers.
    SubscriberEvent {
        AlertTriggered => "alert.triggered",
        InsightCreated => "insight.created",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookSubscriber {
    pub url: String,
    pub events: Vec<SubscriberEvent>,
}

impl WebhookSubscriber {
    #[must_use]
    pub fn wants(&self, event: SubscriberEvent) -> bool {
        self.events.contains(&event)
    }
}

/// Parse a subscriber list.
///
/// # Errors
///
/// Returns a message naming the first malformed entry: a missing `|`, an
/// empty or unknown event list, or a URL that is not http(s).
pub fn parse_subscribers(raw: &str) -> Result<Vec<WebhookSubscriber>, String> {
    let mut subscribers = Vec::new();
    for entry in raw
        .split(|c: char| c == ';' || c.is_whitespace())
        .filter(|e| !e.is_empty())
    {
        let Some((events, url)) = entry.split_once('|') else {
            return Err(format!("expected events|url, got {entry:?}"));
        };
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("subscriber url must be http(s): {url:?}"));
        }

        let mut parsed = Vec::new();
        for name in events.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if name == "*" {
                parsed.extend_from_slice(SubscriberEvent::ALL);
                continue;
            }
            let event = name
                .parse::<SubscriberEvent>()
                .map_err(|e| format!("{e} in {entry:?}"))?;
            parsed.push(event);
        }
        parsed.sort();
        parsed.dedup();
        if parsed.is_empty() {
            return Err(format!("no events listed for {url:?}"));
        }

        subscribers.push(WebhookSubscriber {
            url: url.to_string(),
            events: parsed,
        });
    }
    Ok(subscribers)
}
