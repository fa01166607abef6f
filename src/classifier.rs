//! Output Classifier: a pure function over a text chunk. No state beyond
//! the caller's accumulator; callers feed it per-chunk text and the
//! accumulated buffer to drive control flow.

use once_cell::sync::Lazy;
use regex::Regex;

/// Which pattern family a classification hit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationKind {
    UsageLimit,
    ContextLimit,
    CompactSuggestion,
    TokenUsage,
}

/// One detected pattern match, with a bounded context window for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: ClassificationKind,
    pub matched: String,
    pub context: String,
}

const USAGE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "usage limit",
    "quota",
    "claude max usage limit reached",
    "your limit will reset at",
    "upgrade to a higher plan",
];

const CONTEXT_LIMIT_PATTERNS: &[&str] = &[
    "prompt is too long",
    "context low",
    "run /compact to compact",
    "/compact",
    "context limit",
    "message too long",
];

static COMPACT_SUGGESTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)/compact|run compact|compact context").unwrap());

static TOKEN_USAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\d+\s*(tokens?|characters?)\s*(used|remaining)").unwrap());

const CONTEXT_WINDOW: usize = 200;

fn context_window(text: &str, match_start: usize, match_end: usize) -> String {
    let start = text[..match_start]
        .char_indices()
        .rev()
        .nth(CONTEXT_WINDOW)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let end = text[match_end..]
        .char_indices()
        .nth(CONTEXT_WINDOW)
        .map(|(i, _)| match_end + i)
        .unwrap_or(text.len());
    text[start..end].to_string()
}

fn find_literal(haystack: &str, lower_haystack: &str, needle: &str) -> Option<(usize, usize)> {
    // Patterns are ASCII, so byte offsets in the lowercased copy line up
    // with the original slice even though non-ASCII input elsewhere in the
    // chunk could in principle shift lengths during lowercasing.
    let start = lower_haystack.find(needle)?;
    let end = start + needle.len();
    if haystack.is_char_boundary(start) && haystack.is_char_boundary(end) {
        Some((start, end))
    } else {
        None
    }
}

/// Classify a single chunk of assistant output. Detection fires at most
/// once per pattern per chunk; results preserve the order patterns are
/// checked (usage-limit, context-limit, compact-suggestion, token-usage),
/// which is stable and good enough for log ordering since all matches are
/// derived from one chunk arriving at one point in time.
pub fn classify(chunk: &str) -> Vec<Classification> {
    let mut results = Vec::new();
    let lower = chunk.to_lowercase();

    for pattern in USAGE_LIMIT_PATTERNS {
        if let Some((start, end)) = find_literal(chunk, &lower, pattern) {
            results.push(Classification {
                kind: ClassificationKind::UsageLimit,
                matched: chunk[start..end].to_string(),
                context: context_window(chunk, start, end),
            });
            break;
        }
    }

    for pattern in CONTEXT_LIMIT_PATTERNS {
        if let Some((start, end)) = find_literal(chunk, &lower, pattern) {
            results.push(Classification {
                kind: ClassificationKind::ContextLimit,
                matched: chunk[start..end].to_string(),
                context: context_window(chunk, start, end),
            });
            break;
        }
    }

    if let Some(m) = COMPACT_SUGGESTION_RE.find(chunk) {
        results.push(Classification {
            kind: ClassificationKind::CompactSuggestion,
            matched: m.as_str().to_string(),
            context: context_window(chunk, m.start(), m.end()),
        });
    }

    if let Some(m) = TOKEN_USAGE_RE.find(chunk) {
        results.push(Classification {
            kind: ClassificationKind::TokenUsage,
            matched: m.as_str().to_string(),
            context: context_window(chunk, m.start(), m.end()),
        });
    }

    results
}

/// True iff `classify` would report a usage-limit hit anywhere in `text`.
pub fn has_usage_limit(text: &str) -> bool {
    classify(text)
        .iter()
        .any(|c| c.kind == ClassificationKind::UsageLimit)
}

/// True iff `classify` would report a context-limit hit anywhere in `text`.
pub fn has_context_limit(text: &str) -> bool {
    classify(text)
        .iter()
        .any(|c| c.kind == ClassificationKind::ContextLimit)
}
