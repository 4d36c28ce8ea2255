//! Categorizes raw (non-JSON) agent output lines.
//!
//! Rules are checked in order; the first match wins. Matching is
//! case-insensitive substring search.

use std::sync::LazyLock;

use serde_json::json;

use crate::stream::entry::{LogKind, NewLogEntry};

/// Markers of a failure line.
static ERROR_PATTERNS: LazyLock<Vec<&'static str>> =
    LazyLock::new(|| vec!["error", "exception", "fatal", "panic", "traceback"]);

static WARNING_PATTERNS: LazyLock<Vec<&'static str>> =
    LazyLock::new(|| vec!["warn", "deprecated"]);

/// Verbs an agent prints while it works.
static PROGRESS_PATTERNS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "fetching",
        "loading",
        "searching",
        "analyzing",
        "processing",
        "reading",
        "downloading",
        "starting",
        "running",
        "checking",
    ]
});

static BROWSER_PATTERNS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "navigating",
        "clicking",
        "opening",
        "browsing",
        "scrolling",
        "screenshot",
    ]
});

fn matches_any(lower: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| lower.contains(p))
}

/// Categorize one raw line. Blank lines yield `None`.
pub fn categorize(line: &str, cap: usize) -> Option<NewLogEntry> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();
    let content = crate::stream::entry::truncate_content(trimmed, cap);

    let entry = if matches_any(&lower, &ERROR_PATTERNS) {
        NewLogEntry::new(LogKind::Error, content)
    } else if matches_any(&lower, &WARNING_PATTERNS) {
        NewLogEntry::new(LogKind::Info, content).with_metadata(json!({ "level": "warning" }))
    } else if matches_any(&lower, &PROGRESS_PATTERNS) {
        NewLogEntry::new(LogKind::Progress, content)
    } else if matches_any(&lower, &BROWSER_PATTERNS) {
        NewLogEntry::new(LogKind::Browser, content)
    } else {
        NewLogEntry::new(LogKind::Info, content)
    };
    Some(entry)
}
