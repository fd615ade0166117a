//! Secret redaction chokepoint for sandbox output.
//!
//! Every line a job emits passes through here before it is persisted,
//! streamed to a follower, or logged. Seeded with the exact plaintext
//! values of the job's credential bundle, plus token-shaped patterns as
//! a second line of defense.

use regex::Regex;

/// Canonical replacement marker for redacted content.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Redacts known secret values and token-like patterns from output text.
#[derive(Debug, Clone)]
pub struct Redactor {
    exact_secrets: Vec<String>,
    patterns: Vec<Regex>,
}

impl Redactor {
    /// Create a redactor from the known plaintext values of one job's
    /// bundle.
    pub fn new(exact_secrets: Vec<String>) -> Self {
        Self {
            exact_secrets,
            patterns: default_patterns(),
        }
    }

    /// A redactor with only the pattern rules, for jobs that carry no
    /// secrets.
    pub fn patterns_only() -> Self {
        Self::new(Vec::new())
    }

    /// Redact exact known secrets and token-shaped patterns.
    pub fn redact(&self, text: &str) -> String {
        let mut sanitized = text.to_owned();
        for secret in &self.exact_secrets {
            if !secret.is_empty() {
                sanitized = sanitized.replace(secret, REDACTION_MARKER);
            }
        }
        for pattern in &self.patterns {
            sanitized = pattern
                .replace_all(&sanitized, REDACTION_MARKER)
                .to_string();
        }
        sanitized
    }
}

fn default_patterns() -> Vec<Regex> {
    let patterns = [
        // npm publish/automation tokens.
        r"npm_[A-Za-z0-9]{36}",
        r"sk-[A-Za-z0-9]{32,}",
        r"ghp_[A-Za-z0-9]{20,}",
        r"glpat-[A-Za-z0-9_\-]{16,}",
        r"xoxb-[A-Za-z0-9\-]{20,}",
    ];

    patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
}
