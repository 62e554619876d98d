/**
 * Evidence Verifier - Content-Hash Anchored Claims
 *
 * DESIGN DECISION: Exact-then-fuzzy re-anchoring over whitespace-normalized windows
 * WHY: Source files move under the claims written against them; a claim stays
 *      useful only while its snippet can be located in the live file
 *
 * REASONING CHAIN:
 * 1. Write path hashes each referenced file (sha256 of file text) and stores
 *    the snippet with its declared line window
 * 2. Verification (on read or summary): unchanged hash + matching window only
 *    refreshes verified_at; anything else re-anchors
 * 3. Exact pass: slide a window of the snippet's non-empty-line count over
 *    the file's non-empty lines; whitespace normalizes (CRLF to LF, space/tab
 *    runs to one space, trailing stripped, final trim); equality wins.
 *    Matching in non-empty-line space tolerates inserted blank lines
 * 4. Fuzzy pass (snippets of 3+ lines only): a 60% distinct-token overlap
 *    gate, then Levenshtein with an early-exit cutoff of ceil(len * 0.05);
 *    lowest distance wins
 * 5. Both passes failing marks the row stale and clears the hash; unreadable
 *    files degrade the same way instead of failing the read
 * 6. All updates for one verification run share a transaction, and re-running
 *    against an unchanged file performs no row-content changes
 */

use crate::canonical::sha256_hex;
use crate::error::{Error, Result};
use crate::store::KnowledgeStore;
use crate::types::{clamp_confidence, EvidenceEntry, NewEvidence};
use rusqlite::{params, Connection, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Minimum snippet line count for the fuzzy pass.
const FUZZY_MIN_LINES: usize = 3;
/// Share of the snippet's distinct tokens a window must contain.
const TOKEN_OVERLAP_GATE: f64 = 0.6;
/// Levenshtein cutoff as a share of the normalized snippet length.
const FUZZY_CUTOFF_RATIO: f64 = 0.05;

/// Outcome counts for a verification sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceVerificationSummary {
    pub total: u64,
    pub verified: u64,
    pub reanchored: u64,
    pub stale: u64,
}

const EVIDENCE_COLUMNS: &str = "claim_id, entity_id, entity_type, file_path, line_start, \
     line_end, snippet, claim, confidence, created_at, content_hash, verified_at, stale";

fn row_to_evidence(row: &Row<'_>) -> rusqlite::Result<EvidenceEntry> {
    Ok(EvidenceEntry {
        claim_id: row.get(0)?,
        entity_id: row.get(1)?,
        entity_type: row.get(2)?,
        file_path: row.get(3)?,
        line_start: row.get::<_, i64>(4)? as u32,
        line_end: row.get::<_, Option<i64>>(5)?.map(|v| v as u32),
        snippet: row.get(6)?,
        claim: row.get(7)?,
        confidence: row.get(8)?,
        created_at: row.get(9)?,
        content_hash: row.get(10)?,
        verified_at: row.get(11)?,
        stale: row.get::<_, i64>(12)? != 0,
    })
}

/// Normalize one line: tabs/space runs collapse, trailing whitespace strips.
fn normalize_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_run = false;
    for ch in line.trim_end().chars() {
        if ch == ' ' || ch == '\t' {
            if !in_run {
                out.push(' ');
            }
            in_run = true;
        } else {
            in_run = false;
            out.push(ch);
        }
    }
    out
}

/// Non-empty normalized lines of a text block (CRLF tolerated by `lines()`).
fn normalized_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(normalize_line)
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Distinct lowercase word tokens.
fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Levenshtein distance with a hard cutoff; None when the cutoff is exceeded.
/// Two-row DP with a row-minimum early exit.
fn levenshtein_within(a: &str, b: &str, cutoff: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > cutoff {
        return None;
    }
    if a.is_empty() {
        return (b.len() <= cutoff).then_some(b.len());
    }
    if b.is_empty() {
        return (a.len() <= cutoff).then_some(a.len());
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr: Vec<usize> = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        let mut row_min = curr[0];
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1)
                .min(curr[j - 1] + 1)
                .min(prev[j - 1] + cost);
            row_min = row_min.min(curr[j]);
        }
        if row_min > cutoff {
            return None;
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let distance = prev[b.len()];
    (distance <= cutoff).then_some(distance)
}

/// A located window in the live file: 1-based inclusive line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Anchor {
    line_start: u32,
    line_end: u32,
}

/// Line positions (0-based) of the file's non-empty normalized lines.
fn content_line_positions(file_lines: &[&str]) -> Vec<(usize, String)> {
    file_lines
        .iter()
        .enumerate()
        .filter_map(|(i, line)| {
            let normalized = normalize_line(line).trim().to_string();
            if normalized.is_empty() {
                None
            } else {
                Some((i, normalized))
            }
        })
        .collect()
}

/// Locate a snippet in the live file: exact pass, then fuzzy.
fn locate_snippet(file_lines: &[&str], snippet: &str) -> Option<Anchor> {
    let target_lines = normalized_lines(snippet);
    if target_lines.is_empty() {
        return None;
    }
    let n = target_lines.len();
    let positions = content_line_positions(file_lines);
    if positions.len() < n {
        return None;
    }
    let target_text = target_lines.join("\n");

    // Exact pass.
    for i in 0..=(positions.len() - n) {
        let window: Vec<&str> = positions[i..i + n].iter().map(|(_, l)| l.as_str()).collect();
        if window.join("\n") == target_text {
            return Some(Anchor {
                line_start: positions[i].0 as u32 + 1,
                line_end: positions[i + n - 1].0 as u32 + 1,
            });
        }
    }

    // Fuzzy pass, only for snippets with enough signal.
    if n < FUZZY_MIN_LINES {
        return None;
    }
    let target_tokens = tokens(&target_text);
    if target_tokens.is_empty() {
        return None;
    }
    let cutoff = ((target_text.chars().count() as f64) * FUZZY_CUTOFF_RATIO).ceil() as usize;

    let mut best: Option<(usize, Anchor)> = None;
    for i in 0..=(positions.len() - n) {
        let window: Vec<&str> = positions[i..i + n].iter().map(|(_, l)| l.as_str()).collect();
        let window_text = window.join("\n");

        let window_tokens = tokens(&window_text);
        let overlap = target_tokens.intersection(&window_tokens).count() as f64
            / target_tokens.len() as f64;
        if overlap < TOKEN_OVERLAP_GATE {
            continue;
        }

        if let Some(distance) = levenshtein_within(&target_text, &window_text, cutoff) {
            let anchor = Anchor {
                line_start: positions[i].0 as u32 + 1,
                line_end: positions[i + n - 1].0 as u32 + 1,
            };
            let better = match &best {
                None => true,
                Some((best_distance, _)) => distance < *best_distance,
            };
            if better {
                best = Some((distance, anchor));
            }
        }
    }
    best.map(|(_, anchor)| anchor)
}

/// True when the declared window still shows the stored snippet.
fn declared_window_matches(file_lines: &[&str], entry: &EvidenceEntry) -> bool {
    let target_lines = normalized_lines(&entry.snippet);
    if target_lines.is_empty() || entry.line_start == 0 {
        return false;
    }
    let start = (entry.line_start - 1) as usize;
    let end = entry
        .line_end
        .map(|e| e as usize)
        .unwrap_or(start + target_lines.len())
        .min(file_lines.len());
    if start >= file_lines.len() || end <= start {
        return false;
    }
    let window: Vec<String> = file_lines[start..end]
        .iter()
        .map(|l| normalize_line(l).trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    window == target_lines
}

fn resolve_path(workspace_root: &Path, file_path: &str) -> PathBuf {
    let candidate = Path::new(file_path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        workspace_root.join(file_path)
    }
}

/// Verify one row against the live file; returns the refreshed entry and
/// whether it (a) stayed verified, (b) re-anchored, or (c) went stale.
fn verify_row(
    conn: &Connection,
    workspace_root: &Path,
    mut entry: EvidenceEntry,
) -> Result<(EvidenceEntry, VerifyOutcome)> {
    let now = crate::store::now_iso();
    let absolute = resolve_path(workspace_root, &entry.file_path);

    let text = match std::fs::read_to_string(&absolute) {
        Ok(text) => text,
        Err(_) => {
            // Do not fail the read; degrade the row.
            conn.execute(
                "UPDATE evidence SET stale = 1, content_hash = NULL, verified_at = ?1
                 WHERE claim_id = ?2",
                params![now, entry.claim_id],
            )?;
            entry.stale = true;
            entry.content_hash = None;
            entry.verified_at = Some(now);
            return Ok((entry, VerifyOutcome::Stale));
        }
    };

    let file_hash = sha256_hex(&text);
    let file_lines: Vec<&str> = text.lines().collect();

    if entry.content_hash.as_deref() == Some(file_hash.as_str())
        && declared_window_matches(&file_lines, &entry)
    {
        conn.execute(
            "UPDATE evidence SET verified_at = ?1, stale = 0 WHERE claim_id = ?2",
            params![now, entry.claim_id],
        )?;
        entry.verified_at = Some(now);
        entry.stale = false;
        return Ok((entry, VerifyOutcome::Verified));
    }

    match locate_snippet(&file_lines, &entry.snippet) {
        Some(anchor) => {
            conn.execute(
                "UPDATE evidence SET line_start = ?1, line_end = ?2, content_hash = ?3,
                        verified_at = ?4, stale = 0
                 WHERE claim_id = ?5",
                params![
                    anchor.line_start as i64,
                    anchor.line_end as i64,
                    file_hash,
                    now,
                    entry.claim_id
                ],
            )?;
            entry.line_start = anchor.line_start;
            entry.line_end = Some(anchor.line_end);
            entry.content_hash = Some(file_hash);
            entry.verified_at = Some(now);
            entry.stale = false;
            Ok((entry, VerifyOutcome::Reanchored))
        }
        None => {
            conn.execute(
                "UPDATE evidence SET stale = 1, content_hash = NULL, verified_at = ?1
                 WHERE claim_id = ?2",
                params![now, entry.claim_id],
            )?;
            entry.stale = true;
            entry.content_hash = None;
            entry.verified_at = Some(now);
            Ok((entry, VerifyOutcome::Stale))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerifyOutcome {
    Verified,
    Reanchored,
    Stale,
}

impl KnowledgeStore {
    /// Replace the evidence set for an entity. Each referenced file is hashed
    /// at write time; unreadable files store as already-stale rows.
    pub fn set_evidence(
        &self,
        entity_id: &str,
        entity_type: &str,
        entries: &[NewEvidence],
    ) -> Result<Vec<EvidenceEntry>> {
        if entity_id.is_empty() {
            return Err(Error::Validation("evidence entity_id cannot be empty".to_string()));
        }

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM evidence WHERE entity_id = ?1 AND entity_type = ?2",
            params![entity_id, entity_type],
        )?;

        let now = crate::store::now_iso();
        let mut stored = Vec::with_capacity(entries.len());
        for entry in entries {
            let file_path = self.normalize(&entry.file_path);
            let absolute = resolve_path(&self.config.workspace_root, &file_path);
            let content_hash = std::fs::read_to_string(&absolute)
                .ok()
                .map(|text| sha256_hex(&text));
            let stale = content_hash.is_none();

            let (snippet, _) = self.redactor.redact_snippet(&entry.snippet);
            let (claim, _) = self.redactor.redact(&entry.claim);
            let claim_id = uuid::Uuid::new_v4().to_string();

            tx.execute(
                "INSERT INTO evidence (claim_id, entity_id, entity_type, file_path, line_start,
                        line_end, snippet, claim, confidence, created_at, content_hash,
                        verified_at, stale)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    claim_id,
                    entity_id,
                    entity_type,
                    file_path,
                    entry.line_start as i64,
                    entry.line_end.map(|v| v as i64),
                    snippet,
                    claim,
                    clamp_confidence(entry.confidence),
                    now,
                    content_hash,
                    if stale { None } else { Some(now.clone()) },
                    stale as i64,
                ],
            )?;

            stored.push(EvidenceEntry {
                claim_id,
                entity_id: entity_id.to_string(),
                entity_type: entity_type.to_string(),
                file_path,
                line_start: entry.line_start,
                line_end: entry.line_end,
                snippet,
                claim,
                confidence: clamp_confidence(entry.confidence),
                created_at: now.clone(),
                content_hash,
                verified_at: if stale { None } else { Some(now.clone()) },
                stale,
            });
        }
        tx.commit()?;
        Ok(stored)
    }

    /// Read evidence for an entity; every returned row was verified against
    /// the live file inside one transaction.
    pub fn evidence_for(&self, entity_id: &str, entity_type: &str) -> Result<Vec<EvidenceEntry>> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let rows: Vec<EvidenceEntry> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM evidence WHERE entity_id = ?1 AND entity_type = ?2
                 ORDER BY created_at ASC, claim_id ASC",
                EVIDENCE_COLUMNS
            ))?;
            let mapped = stmt
                .query_map(params![entity_id, entity_type], row_to_evidence)?
                .collect::<std::result::Result<_, _>>()?;
            mapped
        };

        let mut verified = Vec::with_capacity(rows.len());
        for row in rows {
            let (entry, _) = verify_row(&tx, &self.config.workspace_root, row)?;
            verified.push(entry);
        }
        tx.commit()?;
        Ok(verified)
    }

    /// Verify every evidence row in the store; scheduled-summary entry point.
    pub fn verify_all_evidence(&self) -> Result<EvidenceVerificationSummary> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let rows: Vec<EvidenceEntry> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM evidence ORDER BY file_path ASC, claim_id ASC",
                EVIDENCE_COLUMNS
            ))?;
            let mapped = stmt
                .query_map([], row_to_evidence)?
                .collect::<std::result::Result<_, _>>()?;
            mapped
        };

        let mut summary = EvidenceVerificationSummary::default();
        for row in rows {
            summary.total += 1;
            let (_, outcome) = verify_row(&tx, &self.config.workspace_root, row)?;
            match outcome {
                VerifyOutcome::Verified => summary.verified += 1,
                VerifyOutcome::Reanchored => summary.reanchored += 1,
                VerifyOutcome::Stale => summary.stale += 1,
            }
        }
        tx.commit()?;

        if summary.stale > 0 {
            tracing::warn!(stale = summary.stale, total = summary.total, "stale evidence detected");
        }
        Ok(summary)
    }

    /// Export all evidence to `EVIDENCE.md` under the workspace root.
    pub fn export_evidence_markdown(&self) -> Result<PathBuf> {
        let rows: Vec<EvidenceEntry> = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM evidence ORDER BY entity_id ASC, created_at ASC",
                EVIDENCE_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], row_to_evidence)?
                .collect::<std::result::Result<_, _>>()?;
            rows
        };

        let mut body = String::from("# Evidence\n");
        let mut current_entity = String::new();
        for row in &rows {
            if row.entity_id != current_entity {
                current_entity = row.entity_id.clone();
                body.push_str(&format!("\n## {} ({})\n\n", row.entity_id, row.entity_type));
            }
            let line_range = match row.line_end {
                Some(end) => format!("{}-{}", row.line_start, end),
                None => row.line_start.to_string(),
            };
            body.push_str(&format!(
                "- {} `{}:{}`{}\n",
                row.claim,
                row.file_path,
                line_range,
                if row.stale { " (stale)" } else { "" }
            ));
        }

        let path = self.config.workspace_root.join("EVIDENCE.md");
        std::fs::write(&path, body)
            .map_err(|e| Error::Io(format!("failed to write EVIDENCE.md: {}", e)))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> KnowledgeStore {
        KnowledgeStore::open(StoreConfig::new(dir.path())).unwrap()
    }

    fn write_source(dir: &tempfile::TempDir, name: &str, body: &str) {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
    }

    fn evidence(snippet: &str, line_start: u32, line_end: Option<u32>) -> NewEvidence {
        NewEvidence {
            file_path: "src/a.ts".to_string(),
            line_start,
            line_end,
            snippet: snippet.to_string(),
            claim: "parses the header".to_string(),
            confidence: 0.8,
        }
    }

    #[test]
    fn test_levenshtein_cutoff() {
        assert_eq!(levenshtein_within("kitten", "kitten", 0), Some(0));
        assert_eq!(levenshtein_within("kitten", "sitten", 1), Some(1));
        assert_eq!(levenshtein_within("kitten", "sitting", 3), Some(3));
        assert_eq!(levenshtein_within("kitten", "sitting", 2), None);
        // Length gap beyond the cutoff short-circuits.
        assert_eq!(levenshtein_within("abc", "abcdefgh", 2), None);
    }

    #[test]
    fn test_unchanged_file_verifies_idempotently() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        write_source(&dir, "src/a.ts", "one\nalpha\nbeta\ngamma\nlast\n");

        store
            .set_evidence("f1", "function", &[evidence("alpha\nbeta\ngamma", 2, Some(4))])
            .unwrap();

        let first = store.evidence_for("f1", "function").unwrap();
        assert_eq!(first.len(), 1);
        assert!(!first[0].stale);
        let hash = first[0].content_hash.clone();
        let lines = (first[0].line_start, first[0].line_end);

        let second = store.evidence_for("f1", "function").unwrap();
        assert_eq!(second[0].content_hash, hash);
        assert_eq!((second[0].line_start, second[0].line_end), lines);
        assert!(!second[0].stale);
    }

    #[test]
    fn test_stale_detection_scenario() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let mut lines: Vec<String> = (1..=20).map(|i| format!("line {}", i)).collect();
        lines[9] = "A".to_string();
        lines[10] = "B".to_string();
        lines[11] = "C".to_string();
        write_source(&dir, "src/a.ts", &(lines.join("\n") + "\n"));

        store
            .set_evidence("f1", "function", &[evidence("A\nB\nC", 10, Some(12))])
            .unwrap();

        // Replace the anchored window with unrelated content.
        lines[9] = "X".to_string();
        lines[10] = "Y".to_string();
        lines[11] = "Z".to_string();
        write_source(&dir, "src/a.ts", &(lines.join("\n") + "\n"));

        let rows = store.evidence_for("f1", "function").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].stale);
        assert!(rows[0].content_hash.is_none());
        assert!(rows[0].verified_at.is_some());
    }

    #[test]
    fn test_exact_reanchor_after_shift() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let body: Vec<String> = (1..=10)
            .map(|i| format!("filler {}", i))
            .chain(["A".to_string(), "B".to_string(), "C".to_string()])
            .collect();
        write_source(&dir, "src/a.ts", &(body.join("\n") + "\n"));
        store
            .set_evidence("f1", "function", &[evidence("A\nB\nC", 11, Some(13))])
            .unwrap();

        // Shift the snippet down by three lines and insert a blank inside it.
        let shifted: Vec<String> = (1..=13)
            .map(|i| format!("filler {}", i))
            .chain([
                "A".to_string(),
                "B".to_string(),
                "".to_string(),
                "C".to_string(),
            ])
            .collect();
        write_source(&dir, "src/a.ts", &(shifted.join("\n") + "\n"));

        let rows = store.evidence_for("f1", "function").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].stale, "shifted snippet must re-anchor");
        assert_eq!(rows[0].line_start, 14);
        assert_eq!(rows[0].line_end, Some(17));
        assert!(rows[0].content_hash.is_some());
    }

    #[test]
    fn test_fuzzy_reanchor_tolerates_small_edits() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let snippet = "const total = items.length;\nconst sum = items.reduce(add, 0);\nreturn sum / total;";
        let body = format!("header line\n{}\ntrailer line\n", snippet);
        write_source(&dir, "src/a.ts", &body);
        store
            .set_evidence("f1", "function", &[evidence(snippet, 2, Some(4))])
            .unwrap();

        // One-character edit within the window, plus a shift.
        let edited = "const total = items.length;\nconst sum = items.reduce(add, 1);\nreturn sum / total;";
        let body = format!("header line\nnew line one\nnew line two\n{}\ntrailer line\n", edited);
        write_source(&dir, "src/a.ts", &body);

        let rows = store.evidence_for("f1", "function").unwrap();
        assert!(!rows[0].stale, "small edit must re-anchor fuzzily");
        assert_eq!(rows[0].line_start, 4);
        assert_eq!(rows[0].line_end, Some(6));
    }

    #[test]
    fn test_short_snippets_skip_fuzzy() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        write_source(&dir, "src/a.ts", "alpha beta\nsecond line\n");
        store
            .set_evidence("f1", "function", &[evidence("alpha beta", 1, Some(1))])
            .unwrap();

        // Single-line snippet with an edit: exact fails, fuzzy is skipped.
        write_source(&dir, "src/a.ts", "alpha betq\nsecond line\n");
        let rows = store.evidence_for("f1", "function").unwrap();
        assert!(rows[0].stale);
    }

    #[test]
    fn test_missing_file_degrades_not_fails() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        write_source(&dir, "src/a.ts", "A\nB\nC\n");
        store
            .set_evidence("f1", "function", &[evidence("A\nB\nC", 1, Some(3))])
            .unwrap();

        std::fs::remove_file(dir.path().join("src/a.ts")).unwrap();
        let rows = store.evidence_for("f1", "function").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].stale);
        assert!(rows[0].content_hash.is_none());
    }

    #[test]
    fn test_set_evidence_replaces_previous_rows() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        write_source(&dir, "src/a.ts", "A\nB\nC\nD\n");

        store
            .set_evidence("f1", "function", &[evidence("A\nB\nC", 1, Some(3))])
            .unwrap();
        store
            .set_evidence("f1", "function", &[evidence("B\nC\nD", 2, Some(4))])
            .unwrap();

        let rows = store.evidence_for("f1", "function").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].snippet.contains('D'));
    }

    #[test]
    fn test_verify_all_summary_counts() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        write_source(&dir, "src/a.ts", "A\nB\nC\n");
        write_source(&dir, "src/b.ts", "X\nY\nZ\n");

        store
            .set_evidence("f1", "function", &[evidence("A\nB\nC", 1, Some(3))])
            .unwrap();
        store
            .set_evidence(
                "f2",
                "function",
                &[NewEvidence {
                    file_path: "src/b.ts".to_string(),
                    line_start: 1,
                    line_end: Some(3),
                    snippet: "X\nY\nZ".to_string(),
                    claim: "claim".to_string(),
                    confidence: 0.5,
                }],
            )
            .unwrap();

        std::fs::remove_file(dir.path().join("src/b.ts")).unwrap();
        let summary = store.verify_all_evidence().unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.verified, 1);
        assert_eq!(summary.stale, 1);
    }

    #[test]
    fn test_export_markdown() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        write_source(&dir, "src/a.ts", "A\nB\nC\n");
        store
            .set_evidence("f1", "function", &[evidence("A\nB\nC", 1, Some(3))])
            .unwrap();

        let path = store.export_evidence_markdown().unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("## f1 (function)"));
        assert!(body.contains("src/a.ts:1-3"));
    }
}
