//! Retention predicate for captured URLs.

/// URL fragments that keep a request in scope, matched case-insensitively.
///
/// Covers the conversation API (single-conversation fetches and streaming),
/// the history listing endpoint, and the fully-qualified API root for
/// traffic reported with absolute URLs.
const RETAINED_PATTERNS: [&str; 3] = [
    "/backend-api/conversation",
    "conversations?offset=",
    "chatgpt.com/backend-api",
];

/// Pure predicate deciding whether a URL is in scope for retention.
///
/// Used at two points: as the gate for creating a new record, and to decide
/// whether an existing record must be dropped when an update changes its URL.
#[derive(Debug, Clone)]
pub struct RequestFilter {
    patterns: Vec<String>,
}

impl Default for RequestFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestFilter {
    /// Filter over the built-in target-site patterns.
    pub fn new() -> Self {
        Self::with_patterns(RETAINED_PATTERNS.iter().map(|p| p.to_string()))
    }

    /// Filter over a caller-supplied pattern set. Patterns are matched as
    /// case-insensitive substrings.
    pub fn with_patterns(patterns: impl IntoIterator<Item = String>) -> Self {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Is this URL in scope for retention? Empty URLs never match.
    pub fn matches(&self, url: &str) -> bool {
        if url.is_empty() {
            return false;
        }
        let url = url.to_ascii_lowercase();
        self.patterns.iter().any(|p| url.contains(p))
    }
}
