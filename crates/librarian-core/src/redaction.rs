/**
 * Redaction - Secret/PII Scrubbing Before Persistence
 *
 * DESIGN DECISION: Regex pattern table compiled once at construction, counters accumulated per workspace
 * WHY: Every user-visible string field (paths, names, signatures, purposes,
 *      snippets, summaries, facts) passes through here before it touches disk
 *
 * REASONING CHAIN:
 * 1. Indexed source text routinely contains credentials pasted into comments
 * 2. Pattern table owned by the struct: one compile cost at open, no lazy statics
 * 3. Each category keeps a counter; counters flush to an on-disk audit report
 * 4. Replacement preserves surrounding text so snippets stay readable
 * 5. A snippet minimizer collapses pathological leading whitespace runs
 */

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// Leading-whitespace runs longer than this collapse during snippet minimization.
const INDENT_COLLAPSE_THRESHOLD: usize = 16;

/// Categories of redacted content. Ordering here is the match order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionCategory {
    ApiToken,
    AwsKey,
    PrivateKey,
    Password,
    Email,
    IpAddress,
}

impl RedactionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedactionCategory::ApiToken => "api_token",
            RedactionCategory::AwsKey => "aws_key",
            RedactionCategory::PrivateKey => "private_key",
            RedactionCategory::Password => "password",
            RedactionCategory::Email => "email",
            RedactionCategory::IpAddress => "ip_address",
        }
    }
}

/// Counts of matches per category for one redaction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionCounts {
    pub by_category: BTreeMap<String, u64>,
}

impl RedactionCounts {
    pub fn total(&self) -> u64 {
        self.by_category.values().sum()
    }

    fn bump(&mut self, category: RedactionCategory, n: u64) {
        if n > 0 {
            *self
                .by_category
                .entry(category.as_str().to_string())
                .or_insert(0) += n;
        }
    }

    fn merge(&mut self, other: &RedactionCounts) {
        for (k, v) in &other.by_category {
            *self.by_category.entry(k.clone()).or_insert(0) += v;
        }
    }
}

/// On-disk audit report, one per workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionAuditReport {
    pub workspace_root: String,
    pub flushed_at: String,
    pub total_redactions: u64,
    pub by_category: BTreeMap<String, u64>,
}

/**
 * Secret scrubber with accumulated per-workspace counters.
 *
 * DESIGN DECISION: interior counter accumulation behind a Mutex
 * WHY: redaction happens on every write path, including inside transactions;
 *      call sites should not thread counter state around
 */
pub struct Redactor {
    patterns: Vec<(RedactionCategory, Regex)>,
    enabled: bool,
    accumulated: Mutex<RedactionCounts>,
}

impl Redactor {
    pub fn new(enabled: bool) -> Result<Self> {
        let table: &[(RedactionCategory, &str)] = &[
            (
                RedactionCategory::ApiToken,
                r"(?i)(sk-[a-z0-9]{16,}|ghp_[A-Za-z0-9]{20,}|xox[baprs]-[A-Za-z0-9-]{10,}|bearer\s+[A-Za-z0-9._\-]{16,})",
            ),
            (RedactionCategory::AwsKey, r"\bAKIA[0-9A-Z]{16}\b"),
            (
                RedactionCategory::PrivateKey,
                r"-----BEGIN [A-Z ]*PRIVATE KEY-----",
            ),
            (
                RedactionCategory::Password,
                r#"(?i)\b(password|passwd|secret|api[_-]?key)\s*[=:]\s*[^\s"']+"#,
            ),
            (
                RedactionCategory::Email,
                r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}",
            ),
            (RedactionCategory::IpAddress, r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
        ];

        let mut patterns = Vec::with_capacity(table.len());
        for (category, source) in table {
            let regex = Regex::new(source)
                .map_err(|e| Error::Validation(format!("redaction pattern failed to compile: {}", e)))?;
            patterns.push((*category, regex));
        }

        Ok(Self {
            patterns,
            enabled,
            accumulated: Mutex::new(RedactionCounts::default()),
        })
    }

    /// Scrub a string, returning the sanitized text and the per-category counts
    /// for this pass. Counts also accumulate into the workspace totals.
    pub fn redact(&self, text: &str) -> (String, RedactionCounts) {
        let mut counts = RedactionCounts::default();
        if !self.enabled || text.is_empty() {
            return (text.to_string(), counts);
        }

        let mut current = text.to_string();
        for (category, regex) in &self.patterns {
            let matches = regex.find_iter(&current).count() as u64;
            if matches > 0 {
                counts.bump(*category, matches);
                let replacement = format!("[REDACTED:{}]", category.as_str());
                current = regex.replace_all(&current, replacement.as_str()).into_owned();
            }
        }

        if counts.total() > 0 {
            if let Ok(mut acc) = self.accumulated.lock() {
                acc.merge(&counts);
            }
        }

        (current, counts)
    }

    /// Scrub and minimize a code snippet: redaction plus collapsing of leading
    /// whitespace runs longer than the threshold.
    pub fn redact_snippet(&self, text: &str) -> (String, RedactionCounts) {
        let (redacted, counts) = self.redact(text);
        (minimize_snippet(&redacted), counts)
    }

    /// Snapshot of accumulated counters since open (or last flush).
    pub fn accumulated(&self) -> RedactionCounts {
        self.accumulated
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Flush accumulated counters to the on-disk audit report and reset them.
    pub fn flush_report(&self, workspace_root: &Path, report_path: &Path) -> Result<()> {
        let counts = {
            let mut acc = self
                .accumulated
                .lock()
                .map_err(|_| Error::Io("redaction counter lock poisoned".to_string()))?;
            std::mem::take(&mut *acc)
        };

        let mut merged = counts;
        // Fold into any previous report so the audit survives reopen cycles.
        if let Ok(existing) = std::fs::read_to_string(report_path) {
            if let Ok(previous) = serde_json::from_str::<RedactionAuditReport>(&existing) {
                for (k, v) in previous.by_category {
                    *merged.by_category.entry(k).or_insert(0) += v;
                }
            }
        }

        let report = RedactionAuditReport {
            workspace_root: workspace_root.to_string_lossy().to_string(),
            flushed_at: chrono::Utc::now().to_rfc3339(),
            total_redactions: merged.total(),
            by_category: merged.by_category,
        };

        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(report_path, json)
            .map_err(|e| Error::Io(format!("failed to write redaction audit: {}", e)))?;
        Ok(())
    }
}

/// Collapse leading whitespace runs longer than the threshold, per line.
fn minimize_snippet(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let indent_len = line.len() - line.trim_start_matches([' ', '\t']).len();
        if indent_len > INDENT_COLLAPSE_THRESHOLD {
            let body = &line[indent_len..];
            lines.push(format!("{}{}", " ".repeat(INDENT_COLLAPSE_THRESHOLD), body));
        } else {
            lines.push(line.to_string());
        }
    }
    lines.join("\n")
}
