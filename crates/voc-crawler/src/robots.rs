//! Minimal robots.txt evaluation.
//!
//! Picks the most specific `User-agent` group matching our product token
//! (falling back to `*`) and applies longest-match semantics across its
//! `Allow`/`Disallow` lines, with `Allow` winning ties. `*` and a trailing
//! `$` are honoured in patterns.

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    allow: bool,
    pattern: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotsRules {
    rules: Vec<Rule>,
}

#[derive(Debug, Default)]
struct Group {
    agents: Vec<String>,
    rules: Vec<Rule>,
}

impl RobotsRules {
    /// Rules that allow everything (missing or unreadable robots.txt).
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Parse `body` for the crawler identified by `user_agent`.
    #[must_use]
    pub fn parse(body: &str, user_agent: &str) -> Self {
        let token = product_token(user_agent);
        let mut groups: Vec<Group> = Vec::new();
        let mut current = Group::default();
        let mut last_was_agent = false;

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if !last_was_agent && !current.agents.is_empty() {
                        groups.push(std::mem::take(&mut current));
                    }
                    current.agents.push(value.to_ascii_lowercase());
                    last_was_agent = true;
                }
                "allow" | "disallow" => {
                    last_was_agent = false;
                    if current.agents.is_empty() {
                        continue;
                    }
                    // An empty Disallow means "allow everything".
                    if value.is_empty() {
                        continue;
                    }
                    current.rules.push(Rule {
                        allow: key == "allow",
                        pattern: value.to_string(),
                    });
                }
                _ => last_was_agent = false,
            }
        }
        if !current.agents.is_empty() {
            groups.push(current);
        }

        let specific = groups
            .iter()
            .filter_map(|g| {
                g.agents
                    .iter()
                    .filter(|a| a.as_str() != "*" && token.contains(a.as_str()))
                    .map(String::len)
                    .max()
                    .map(|len| (len, g))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, g)| g);

        let chosen: Vec<&Group> = match specific {
            Some(group) => vec![group],
            None => groups
                .iter()
                .filter(|g| g.agents.iter().any(|a| a == "*"))
                .collect(),
        };

        Self {
            rules: chosen
                .into_iter()
                .flat_map(|g| g.rules.iter().cloned())
                .collect(),
        }
    }

    /// Whether `path` (including any query string) may be fetched.
    #[must_use]
    pub fn is_allowed(&self, path: &str) -> bool {
        let mut best: Option<(usize, bool)> = None;
        for rule in &self.rules {
            if !pattern_matches(&rule.pattern, path) {
                continue;
            }
            let len = rule.pattern.len();
            best = match best {
                Some((best_len, best_allow))
                    if best_len > len || (best_len == len && best_allow) =>
                {
                    Some((best_len, best_allow))
                }
                _ => Some((len, rule.allow)),
            };
        }
        best.is_none_or(|(_, allow)| allow)
    }
}

/// `"VocBot/1.0 (+https://example.com)"` → `"vocbot"`.
fn product_token(user_agent: &str) -> String {
    user_agent
        .split(['/', ' '])
        .next()
        .unwrap_or(user_agent)
        .to_ascii_lowercase()
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };
    let mut pieces = pattern.split('*');
    let Some(first) = pieces.next() else {
        return true;
    };
    let Some(mut rest) = path.strip_prefix(first) else {
        return false;
    };
    let pieces: Vec<&str> = pieces.collect();
    for (i, piece) in pieces.iter().enumerate() {
        let is_last = i + 1 == pieces.len();
        if is_last && anchored {
            return rest.ends_with(piece);
        }
        match rest.find(piece) {
            Some(idx) => rest = &rest[idx + piece.len()..],
            None => return false,
        }
    }
    !anchored || rest.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "\
User-agent: *
Disallow: /search
Allow: /search/about
Disallow: /*.json$

User-agent: vocbot
User-agent: otherbot
Disallow: /private
";

    #[test]
    fn specific_group_wins_over_wildcard() {
        let rules = RobotsRules::parse(BODY, "VocBot/0.1 (+https://example.com/bot)");
        assert!(!rules.is_allowed("/private/x"));
        assert!(rules.is_allowed("/search?q=a"));
    }

    #[test]
    fn wildcard_group_applies_to_unknown_agents() {
        let rules = RobotsRules::parse(BODY, "SomeCrawler/2.0");
        assert!(!rules.is_allowed("/search?q=a"));
        assert!(rules.is_allowed("/search/about"));
        assert!(rules.is_allowed("/reviews"));
    }

    #[test]
    fn anchored_wildcard_patterns() {
        let rules = RobotsRules::parse(BODY, "SomeCrawler/2.0");
        assert!(!rules.is_allowed("/r/rust/new.json"));
        assert!(rules.is_allowed("/r/rust/new.json?limit=5"));
    }

    #[test]
    fn empty_disallow_allows_everything() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow:\n", "VocBot");
        assert!(rules.is_allowed("/anything"));
        assert!(RobotsRules::allow_all().is_allowed("/"));
    }
}
