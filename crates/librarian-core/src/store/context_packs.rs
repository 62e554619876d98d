/**
 * Context Packs - Curated Knowledge Bundles
 *
 * DESIGN DECISION: Content-addressed packs with a canonical projection hash
 * WHY: Two packs with equal canonical projections MUST hash identically, so
 *      the hash is computed over a stable stringification of a defined field
 *      subset, never over whatever serde happens to emit
 *
 * Projection: schemaVersion, packType, targetId, summary, keyFacts (in
 * order), codeSnippets with forward-slash filePath, relatedFiles sorted and
 * normalized, invalidationTriggers sorted and normalized, versionString.
 *
 * Upsert conflicts on (target_id, pack_type): content fields overwrite, the
 * hash is recomputed, success/failure counters survive, `invalidated`
 * resets to false.
 */

use crate::canonical::{hash_canonical, to_forward_slashes};
use crate::error::{Error, Result};
use crate::types::{clamp_confidence, CodeSnippet, ContextPack, ContextPackQuery};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::json;

use super::{decode_list, encode_list, now_iso, KnowledgeStore};

/// Producer-facing input for a context-pack upsert.
#[derive(Debug, Clone)]
pub struct ContextPackDraft {
    pub pack_type: String,
    pub target_id: String,
    pub summary: String,
    pub key_facts: Vec<String>,
    pub code_snippets: Vec<CodeSnippet>,
    pub related_files: Vec<String>,
    pub invalidation_triggers: Vec<String>,
    pub confidence: f64,
    pub version_string: String,
    pub schema_version: u32,
}

/// Canonical content hash over the defined projection.
pub fn pack_content_hash(
    schema_version: u32,
    pack_type: &str,
    target_id: &str,
    summary: &str,
    key_facts: &[String],
    code_snippets: &[CodeSnippet],
    related_files: &[String],
    invalidation_triggers: &[String],
    version_string: &str,
) -> String {
    let snippets: Vec<serde_json::Value> = code_snippets
        .iter()
        .map(|s| {
            json!({
                "filePath": to_forward_slashes(&s.file_path),
                "lineStart": s.line_start,
                "lineEnd": s.line_end,
                "content": s.content,
            })
        })
        .collect();

    let mut related: Vec<String> = related_files.iter().map(|p| to_forward_slashes(p)).collect();
    related.sort();
    let mut triggers: Vec<String> = invalidation_triggers
        .iter()
        .map(|p| to_forward_slashes(p))
        .collect();
    triggers.sort();

    let projection = json!({
        "schemaVersion": schema_version,
        "packType": pack_type,
        "targetId": target_id,
        "summary": summary,
        "keyFacts": key_facts,
        "codeSnippets": snippets,
        "relatedFiles": related,
        "invalidationTriggers": triggers,
        "versionString": version_string,
    });
    hash_canonical(&projection)
}

const PACK_COLUMNS: &str = "pack_id, pack_type, target_id, summary, key_facts, code_snippets, \
     related_files, invalidation_triggers, confidence, access_count, success_count, \
     failure_count, version_string, schema_version, content_hash, invalidated, \
     created_at, updated_at";

fn row_to_pack(row: &Row<'_>) -> rusqlite::Result<ContextPack> {
    let snippets_raw: String = row.get(5)?;
    Ok(ContextPack {
        pack_id: row.get(0)?,
        pack_type: row.get(1)?,
        target_id: row.get(2)?,
        summary: row.get(3)?,
        key_facts: decode_list(&row.get::<_, String>(4)?),
        code_snippets: serde_json::from_str(&snippets_raw).unwrap_or_default(),
        related_files: decode_list(&row.get::<_, String>(6)?),
        invalidation_triggers: decode_list(&row.get::<_, String>(7)?),
        confidence: row.get(8)?,
        access_count: row.get::<_, i64>(9)? as u64,
        success_count: row.get::<_, i64>(10)? as u64,
        failure_count: row.get::<_, i64>(11)? as u64,
        version_string: row.get(12)?,
        schema_version: row.get::<_, i64>(13)? as u32,
        content_hash: row.get(14)?,
        invalidated: row.get::<_, i64>(15)? != 0,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

/// Connection-level pack upsert shared by the single and batch paths.
pub(crate) fn upsert_context_pack_conn(
    conn: &rusqlite::Connection,
    redactor: &crate::redaction::Redactor,
    workspace_root: &std::path::Path,
    draft: &ContextPackDraft,
) -> Result<ContextPack> {
    if draft.target_id.is_empty() || draft.pack_type.is_empty() {
        return Err(Error::Validation(
            "context pack requires target_id and pack_type".to_string(),
        ));
    }
    if draft.schema_version < 1 {
        return Err(Error::Validation("pack schema_version must be >= 1".to_string()));
    }

    let normalize = |p: &str| crate::canonical::normalize_path(workspace_root, p);
    let (summary, _) = redactor.redact(&draft.summary);
    let key_facts: Vec<String> = draft
        .key_facts
        .iter()
        .map(|f| redactor.redact(f).0)
        .collect();
    let code_snippets: Vec<CodeSnippet> = draft
        .code_snippets
        .iter()
        .map(|s| CodeSnippet {
            file_path: normalize(&s.file_path),
            line_start: s.line_start,
            line_end: s.line_end,
            content: redactor.redact_snippet(&s.content).0,
        })
        .collect();
    let related_files: Vec<String> =
        draft.related_files.iter().map(|p| normalize(p)).collect();
    let invalidation_triggers: Vec<String> = draft
        .invalidation_triggers
        .iter()
        .map(|p| normalize(p))
        .collect();

    let content_hash = pack_content_hash(
        draft.schema_version,
        &draft.pack_type,
        &draft.target_id,
        &summary,
        &key_facts,
        &code_snippets,
        &related_files,
        &invalidation_triggers,
        &draft.version_string,
    );

    let now = now_iso();
    conn.execute(
        "INSERT INTO context_packs (
            pack_id, pack_type, target_id, summary, key_facts, code_snippets,
            related_files, invalidation_triggers, confidence, version_string,
            schema_version, content_hash, invalidated, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13, ?13)
         ON CONFLICT (target_id, pack_type) DO UPDATE SET
            summary = excluded.summary,
            key_facts = excluded.key_facts,
            code_snippets = excluded.code_snippets,
            related_files = excluded.related_files,
            invalidation_triggers = excluded.invalidation_triggers,
            confidence = excluded.confidence,
            version_string = excluded.version_string,
            schema_version = excluded.schema_version,
            content_hash = excluded.content_hash,
            invalidated = 0,
            updated_at = excluded.updated_at",
        params![
            uuid::Uuid::new_v4().to_string(),
            draft.pack_type,
            draft.target_id,
            summary,
            encode_list(&key_facts)?,
            serde_json::to_string(&code_snippets)?,
            encode_list(&related_files)?,
            encode_list(&invalidation_triggers)?,
            clamp_confidence(draft.confidence),
            draft.version_string,
            draft.schema_version as i64,
            content_hash,
            now,
        ],
    )?;

    let row = conn.query_row(
        &format!(
            "SELECT {} FROM context_packs WHERE target_id = ?1 AND pack_type = ?2",
            PACK_COLUMNS
        ),
        params![draft.target_id, draft.pack_type],
        row_to_pack,
    )?;
    Ok(row)
}

impl KnowledgeStore {
    pub fn upsert_context_pack(&self, draft: &ContextPackDraft) -> Result<ContextPack> {
        let conn = self.lock_conn()?;
        upsert_context_pack_conn(&conn, &self.redactor, &self.config.workspace_root, draft)
    }

    /// Batch upsert inside a single transaction: all or nothing.
    pub fn upsert_context_packs(&self, drafts: &[ContextPackDraft]) -> Result<Vec<ContextPack>> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut out = Vec::with_capacity(drafts.len());
        for draft in drafts {
            out.push(upsert_context_pack_conn(
                &tx,
                &self.redactor,
                &self.config.workspace_root,
                draft,
            )?);
        }
        tx.commit()?;
        Ok(out)
    }

    pub fn get_context_pack(&self, pack_id: &str) -> Result<Option<ContextPack>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM context_packs WHERE pack_id = ?1", PACK_COLUMNS),
                params![pack_id],
                row_to_pack,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_context_pack_for(
        &self,
        target_id: &str,
        pack_type: &str,
    ) -> Result<Option<ContextPack>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM context_packs WHERE target_id = ?1 AND pack_type = ?2",
                    PACK_COLUMNS
                ),
                params![target_id, pack_type],
                row_to_pack,
            )
            .optional()?;
        Ok(row)
    }

    /// Query with `include_invalidated` defaulting to false.
    pub fn query_context_packs(&self, query: &ContextPackQuery) -> Result<Vec<ContextPack>> {
        let conn = self.lock_conn()?;
        let mut sql = format!("SELECT {} FROM context_packs", PACK_COLUMNS);
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(target_id) = &query.target_id {
            clauses.push(format!("target_id = ?{}", args.len() + 1));
            args.push(Box::new(target_id.clone()));
        }
        if let Some(pack_type) = &query.pack_type {
            clauses.push(format!("pack_type = ?{}", args.len() + 1));
            args.push(Box::new(pack_type.clone()));
        }
        if !query.include_invalidated {
            clauses.push("invalidated = 0".to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY updated_at DESC");
        sql.push_str(&format!(" LIMIT {}", query.limit.unwrap_or(100)));

        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(arg_refs.as_slice(), row_to_pack)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Mark every pack whose triggers contain the path as invalidated.
    /// Returns the affected count.
    pub fn invalidate_context_packs(&self, trigger_path: &str) -> Result<u64> {
        let conn = self.lock_conn()?;
        let normalized = self.normalize(trigger_path);

        // LIKE narrows candidates; the JSON decode confirms exact membership.
        let mut stmt = conn.prepare(
            "SELECT pack_id, invalidation_triggers FROM context_packs
             WHERE invalidated = 0 AND invalidation_triggers LIKE '%' || ?1 || '%'",
        )?;
        let candidates: Vec<(String, String)> = stmt
            .query_map(params![normalized], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let mut affected = 0u64;
        let now = now_iso();
        for (pack_id, triggers_raw) in candidates {
            let triggers = decode_list(&triggers_raw);
            if triggers.iter().any(|t| t == &normalized) {
                affected += conn.execute(
                    "UPDATE context_packs SET invalidated = 1, updated_at = ?1 WHERE pack_id = ?2",
                    params![now, pack_id],
                )? as u64;
            }
        }
        Ok(affected)
    }

    /// Promote pack access telemetry on read.
    pub fn touch_context_pack_access(&self, pack_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE context_packs SET access_count = access_count + 1 WHERE pack_id = ?1",
            params![pack_id],
        )?;
        Ok(())
    }

    /// Record a success/failure outcome for a pack.
    pub fn record_pack_outcome(&self, pack_id: &str, success: bool) -> Result<()> {
        let conn = self.lock_conn()?;
        let column = if success { "success_count" } else { "failure_count" };
        conn.execute(
            &format!("UPDATE context_packs SET {c} = {c} + 1 WHERE pack_id = ?1", c = column),
            params![pack_id],
        )?;
        Ok(())
    }

    pub fn delete_context_pack(&self, pack_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        Ok(conn.execute("DELETE FROM context_packs WHERE pack_id = ?1", params![pack_id])? > 0)
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

    fn draft(target: &str) -> ContextPackDraft {
        ContextPackDraft {
            pack_type: "function_context".to_string(),
            target_id: target.to_string(),
            summary: "what this function does".to_string(),
            key_facts: vec!["pure".to_string(), "no io".to_string()],
            code_snippets: vec![CodeSnippet {
                file_path: "src\\a.ts".to_string(),
                line_start: 3,
                line_end: 9,
                content: "export function parse() {}".to_string(),
            }],
            related_files: vec!["src/b.ts".to_string(), "src/a.ts".to_string()],
            invalidation_triggers: vec!["src/a.ts".to_string()],
            confidence: 0.8,
            version_string: "v1".to_string(),
            schema_version: 1,
        }
    }

    #[test]
    fn test_hash_stable_across_field_ordering() {
        let d = draft("fn-1");
        let a = pack_content_hash(
            d.schema_version,
            &d.pack_type,
            &d.target_id,
            &d.summary,
            &d.key_facts,
            &d.code_snippets,
            &d.related_files,
            &d.invalidation_triggers,
            &d.version_string,
        );
        // Related files in a different order hash the same (sorted canonical form).
        let mut reordered = d.related_files.clone();
        reordered.reverse();
        let b = pack_content_hash(
            d.schema_version,
            &d.pack_type,
            &d.target_id,
            &d.summary,
            &d.key_facts,
            &d.code_snippets,
            &reordered,
            &d.invalidation_triggers,
            &d.version_string,
        );
        assert_eq!(a, b);

        // Key facts are order-sensitive.
        let mut facts = d.key_facts.clone();
        facts.reverse();
        let c = pack_content_hash(
            d.schema_version,
            &d.pack_type,
            &d.target_id,
            &d.summary,
            &facts,
            &d.code_snippets,
            &d.related_files,
            &d.invalidation_triggers,
            &d.version_string,
        );
        assert_ne!(a, c);
    }

    #[test]
    fn test_stored_hash_reproducible_from_stored_pack() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let pack = store.upsert_context_pack(&draft("fn-1")).unwrap();

        let recomputed = pack_content_hash(
            pack.schema_version,
            &pack.pack_type,
            &pack.target_id,
            &pack.summary,
            &pack.key_facts,
            &pack.code_snippets,
            &pack.related_files,
            &pack.invalidation_triggers,
            &pack.version_string,
        );
        assert_eq!(pack.content_hash, recomputed);
    }

    #[test]
    fn test_upsert_preserves_outcomes_and_resets_invalidation() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let pack = store.upsert_context_pack(&draft("fn-1")).unwrap();
        store.record_pack_outcome(&pack.pack_id, true).unwrap();
        store.record_pack_outcome(&pack.pack_id, false).unwrap();
        assert_eq!(store.invalidate_context_packs("src/a.ts").unwrap(), 1);

        let mut updated = draft("fn-1");
        updated.summary = "revised".to_string();
        let after = store.upsert_context_pack(&updated).unwrap();

        assert_eq!(after.pack_id, pack.pack_id);
        assert_eq!(after.success_count, 1);
        assert_eq!(after.failure_count, 1);
        assert!(!after.invalidated);
        assert_ne!(after.content_hash, pack.content_hash);
    }

    #[test]
    fn test_invalidation_scenario() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert_context_pack(&draft("fn-1")).unwrap();

        assert_eq!(store.invalidate_context_packs("src/a.ts").unwrap(), 1);
        // Second sweep finds nothing left to invalidate.
        assert_eq!(store.invalidate_context_packs("src/a.ts").unwrap(), 0);

        let visible = store
            .query_context_packs(&ContextPackQuery::default())
            .unwrap();
        assert!(visible.is_empty());

        let all = store
            .query_context_packs(&ContextPackQuery {
                include_invalidated: true,
                ..ContextPackQuery::default()
            })
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].invalidated);
    }

    #[test]
    fn test_unrelated_trigger_does_not_invalidate() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert_context_pack(&draft("fn-1")).unwrap();
        assert_eq!(store.invalidate_context_packs("src/other.ts").unwrap(), 0);
    }

    #[test]
    fn test_snippet_paths_normalized_to_forward_slashes() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let pack = store.upsert_context_pack(&draft("fn-1")).unwrap();
        assert_eq!(pack.code_snippets[0].file_path, "src/a.ts");
    }
}
