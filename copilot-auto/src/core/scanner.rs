//! Stateless matchers applied to chunks of child output.
//!
//! Matching is per chunk, not per line: a phrase split across two chunks is
//! not detected.

use std::sync::LazyLock;

use regex::Regex;

/// Phrases that mean the child is waiting for a confirmation.
pub const PROMPT_PHRASES: &[&str] = &["Do you want to", "Continue?", "Approve?"];

static SESSION_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"session-state[/\\]([A-Za-z0-9][A-Za-z0-9_-]*)").unwrap()
});

/// What a single chunk revealed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub prompt: bool,
    pub session_id: Option<String>,
}

pub fn scan(chunk: &str) -> ScanResult {
    ScanResult {
        prompt: is_confirmation_prompt(chunk),
        session_id: extract_session_id(chunk).map(str::to_string),
    }
}

pub fn is_confirmation_prompt(chunk: &str) -> bool {
    PROMPT_PHRASES.iter().any(|phrase| chunk.contains(phrase))
}

/// Extract the session id from the first session-folder path in `chunk`.
pub fn extract_session_id(chunk: &str) -> Option<&str> {
    SESSION_PATH_RE
        .captures(chunk)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}
