/**
 * Function Knowledge - CRUD, Confidence, Decay
 *
 * DESIGN DECISION: Conflict target (file_path, name); upserts preserve identity and telemetry
 * WHY: Re-indexing the same function must not reset its id, creation time,
 *      access telemetry, validation count, or outcome counters
 *
 * Confidence changes always clamp into [0.10, 0.95] and append a
 * ConfidenceEvent so downstream calibration can audit every delta.
 */

use crate::error::{Error, Result};
use crate::redaction::Redactor;
use crate::schema::validate_order_column;
use crate::types::{
    clamp_confidence, BehaviorFlags, ConfidenceEvent, ConfidenceTarget, FunctionKnowledge,
    FunctionQuery,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

use super::{decode_list, encode_list, now_iso, KnowledgeStore};

/// Producer-facing input for a function upsert; storage-managed fields
/// (id, timestamps, counters) are filled by the store.
#[derive(Debug, Clone)]
pub struct FunctionDraft {
    pub file_path: String,
    pub name: String,
    pub signature: String,
    pub purpose: String,
    pub start_line: u32,
    pub end_line: u32,
    pub behavior: BehaviorFlags,
    pub effect_signature: Vec<String>,
    pub confidence: f64,
}

const FUNCTION_COLUMNS: &str = "id, file_path, name, signature, purpose, start_line, end_line, \
     is_pure, has_side_effects, modifies_params, throws, return_depends_on_inputs, \
     effect_signature, confidence, successes, failures, validation_count, \
     access_count, last_accessed, created_at, updated_at, last_verified_at";

/// Allowlisted ORDER BY columns for function queries.
pub const FUNCTION_ORDER_ALLOWLIST: &[&str] = &[
    "name",
    "file_path",
    "confidence",
    "updated_at",
    "access_count",
    "last_accessed",
];

fn row_to_function(row: &Row<'_>) -> rusqlite::Result<FunctionKnowledge> {
    Ok(FunctionKnowledge {
        id: row.get(0)?,
        file_path: row.get(1)?,
        name: row.get(2)?,
        signature: row.get(3)?,
        purpose: row.get(4)?,
        start_line: row.get::<_, i64>(5)? as u32,
        end_line: row.get::<_, i64>(6)? as u32,
        behavior: BehaviorFlags {
            is_pure: row.get::<_, i64>(7)? != 0,
            has_side_effects: row.get::<_, i64>(8)? != 0,
            modifies_params: row.get::<_, i64>(9)? != 0,
            throws: row.get::<_, i64>(10)? != 0,
            return_depends_on_inputs: row.get::<_, i64>(11)? != 0,
        },
        effect_signature: decode_list(&row.get::<_, String>(12)?),
        confidence: row.get(13)?,
        successes: row.get::<_, i64>(14)? as u64,
        failures: row.get::<_, i64>(15)? as u64,
        validation_count: row.get::<_, i64>(16)? as u64,
        access_count: row.get::<_, i64>(17)? as u64,
        last_accessed: row.get(18)?,
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
        last_verified_at: row.get(21)?,
    })
}

/// Upsert against (file_path, name); preserves id, created_at, access and
/// outcome telemetry, validation_count. Redaction runs before persistence.
pub(crate) fn upsert_function_conn(
    conn: &Connection,
    redactor: &Redactor,
    workspace_root: &Path,
    draft: &FunctionDraft,
) -> Result<FunctionKnowledge> {
    if draft.name.is_empty() {
        return Err(Error::Validation("function name cannot be empty".to_string()));
    }
    let file_path = crate::canonical::normalize_path(workspace_root, &draft.file_path);
    let (name, _) = redactor.redact(&draft.name);
    let (signature, _) = redactor.redact(&draft.signature);
    let (purpose, _) = redactor.redact(&draft.purpose);
    let effect_signature = encode_list(&draft.effect_signature)?;
    let now = now_iso();
    let id = uuid::Uuid::new_v4().to_string();
    let confidence = clamp_confidence(draft.confidence);

    conn.execute(
        "INSERT INTO functions (
            id, file_path, name, signature, purpose, start_line, end_line,
            is_pure, has_side_effects, modifies_params, throws, return_depends_on_inputs,
            effect_signature, confidence, created_at, updated_at, last_verified_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15, ?15)
         ON CONFLICT (file_path, name) DO UPDATE SET
            signature = excluded.signature,
            purpose = excluded.purpose,
            start_line = excluded.start_line,
            end_line = excluded.end_line,
            is_pure = excluded.is_pure,
            has_side_effects = excluded.has_side_effects,
            modifies_params = excluded.modifies_params,
            throws = excluded.throws,
            return_depends_on_inputs = excluded.return_depends_on_inputs,
            effect_signature = excluded.effect_signature,
            confidence = excluded.confidence,
            updated_at = excluded.updated_at,
            last_verified_at = excluded.last_verified_at",
        params![
            id,
            file_path,
            name,
            signature,
            purpose,
            draft.start_line as i64,
            draft.end_line as i64,
            draft.behavior.is_pure as i64,
            draft.behavior.has_side_effects as i64,
            draft.behavior.modifies_params as i64,
            draft.behavior.throws as i64,
            draft.behavior.return_depends_on_inputs as i64,
            effect_signature,
            confidence,
            now,
        ],
    )?;

    get_function_by_location_conn(conn, &file_path, &name)?.ok_or_else(|| {
        Error::Database("function row vanished immediately after upsert".to_string())
    })
}

pub(crate) fn get_function_by_location_conn(
    conn: &Connection,
    file_path: &str,
    name: &str,
) -> Result<Option<FunctionKnowledge>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM functions WHERE file_path = ?1 AND name = ?2",
                FUNCTION_COLUMNS
            ),
            params![file_path, name],
            row_to_function,
        )
        .optional()?;
    Ok(row)
}

pub(crate) fn delete_functions_by_path_conn(conn: &Connection, file_path: &str) -> Result<u64> {
    let n = conn.execute(
        "DELETE FROM functions WHERE file_path = ?1",
        params![file_path],
    )?;
    Ok(n as u64)
}

impl KnowledgeStore {
    pub fn upsert_function(&self, draft: &FunctionDraft) -> Result<FunctionKnowledge> {
        let conn = self.lock_conn()?;
        upsert_function_conn(&conn, &self.redactor, &self.config.workspace_root, draft)
    }

    /// Batch upsert inside a single transaction: all or nothing.
    pub fn upsert_functions(&self, drafts: &[FunctionDraft]) -> Result<Vec<FunctionKnowledge>> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut out = Vec::with_capacity(drafts.len());
        for draft in drafts {
            out.push(upsert_function_conn(
                &tx,
                &self.redactor,
                &self.config.workspace_root,
                draft,
            )?);
        }
        tx.commit()?;
        Ok(out)
    }

    pub fn get_function(&self, id: &str) -> Result<Option<FunctionKnowledge>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM functions WHERE id = ?1", FUNCTION_COLUMNS),
                params![id],
                row_to_function,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_function_by_location(
        &self,
        file_path: &str,
        name: &str,
    ) -> Result<Option<FunctionKnowledge>> {
        let conn = self.lock_conn()?;
        get_function_by_location_conn(&conn, &self.normalize(file_path), name)
    }

    /// Query with validated ordering and pagination.
    pub fn query_functions(&self, query: &FunctionQuery) -> Result<Vec<FunctionKnowledge>> {
        let conn = self.lock_conn()?;

        let order_column = validate_order_column(query.order_by.as_sql(), FUNCTION_ORDER_ALLOWLIST)?;
        let mut sql = format!("SELECT {} FROM functions", FUNCTION_COLUMNS);
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(file_path) = &query.file_path {
            clauses.push(format!("file_path = ?{}", args.len() + 1));
            args.push(Box::new(self.normalize(file_path)));
        }
        if let Some(prefix) = &query.path_prefix {
            let normalized = self.normalize(prefix);
            clauses.push(format!(
                "(file_path = ?{n} OR file_path LIKE ?{n} || '/%')",
                n = args.len() + 1
            ));
            args.push(Box::new(normalized));
        }
        if let Some(name) = &query.name {
            clauses.push(format!("name = ?{}", args.len() + 1));
            args.push(Box::new(name.clone()));
        }
        if let Some(min) = query.min_confidence {
            clauses.push(format!("confidence >= ?{}", args.len() + 1));
            args.push(Box::new(min));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(
            " ORDER BY {} {}",
            order_column,
            query.direction.as_sql()
        ));
        sql.push_str(&format!(" LIMIT {}", query.limit.unwrap_or(100)));
        if let Some(offset) = query.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(arg_refs.as_slice(), row_to_function)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_function(&self, id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        Ok(conn.execute("DELETE FROM functions WHERE id = ?1", params![id])? > 0)
    }

    pub fn delete_functions_by_path(&self, file_path: &str) -> Result<u64> {
        let conn = self.lock_conn()?;
        delete_functions_by_path_conn(&conn, &self.normalize(file_path))
    }

    /// Promote access telemetry on read.
    pub fn touch_function_access(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE functions SET access_count = access_count + 1, last_accessed = ?1 WHERE id = ?2",
            params![now_iso(), id],
        )?;
        Ok(())
    }

    /// Record a success/failure outcome for a function.
    pub fn record_function_outcome(&self, id: &str, success: bool) -> Result<()> {
        let conn = self.lock_conn()?;
        let column = if success { "successes" } else { "failures" };
        conn.execute(
            &format!(
                "UPDATE functions SET {c} = {c} + 1, validation_count = validation_count + 1 WHERE id = ?1",
                c = column
            ),
            params![id],
        )?;
        Ok(())
    }

    /// Apply a confidence delta, clamped into the band, bumping
    /// last_verified_at and appending a ConfidenceEvent.
    pub fn update_confidence(
        &self,
        entity_id: &str,
        target: ConfidenceTarget,
        delta: f64,
        reason: &str,
    ) -> Result<ConfidenceEvent> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let now = now_iso();

        let (table, key) = match target {
            ConfidenceTarget::Function => ("functions", "id"),
            ConfidenceTarget::Module => ("modules", "id"),
            ConfidenceTarget::ContextPack => ("context_packs", "pack_id"),
        };

        let current: Option<f64> = tx
            .query_row(
                &format!("SELECT confidence FROM {} WHERE {} = ?1", table, key),
                params![entity_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| {
            Error::Validation(format!("{} {} not found for confidence update", table, entity_id))
        })?;
        let updated = clamp_confidence(current + delta);

        match target {
            ConfidenceTarget::Function => {
                tx.execute(
                    "UPDATE functions SET confidence = ?1, last_verified_at = ?2, updated_at = ?2 WHERE id = ?3",
                    params![updated, now, entity_id],
                )?;
            }
            ConfidenceTarget::Module => {
                tx.execute(
                    "UPDATE modules SET confidence = ?1, updated_at = ?2 WHERE id = ?3",
                    params![updated, now, entity_id],
                )?;
            }
            ConfidenceTarget::ContextPack => {
                tx.execute(
                    "UPDATE context_packs SET confidence = ?1, updated_at = ?2 WHERE pack_id = ?3",
                    params![updated, now, entity_id],
                )?;
            }
        }

        tx.execute(
            "INSERT INTO confidence_events (entity_id, entity_type, delta, updated_at, reason)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![entity_id, target.as_str(), delta, now, reason],
        )?;
        let event_id = tx.last_insert_rowid() as u64;
        tx.commit()?;

        Ok(ConfidenceEvent {
            id: event_id,
            entity_id: entity_id.to_string(),
            entity_type: target.as_str().to_string(),
            delta,
            updated_at: now,
            reason: reason.to_string(),
        })
    }

    pub fn confidence_events_for(&self, entity_id: &str) -> Result<Vec<ConfidenceEvent>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, entity_id, entity_type, delta, updated_at, reason
             FROM confidence_events WHERE entity_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![entity_id], |row| {
                Ok(ConfidenceEvent {
                    id: row.get::<_, i64>(0)? as u64,
                    entity_id: row.get(1)?,
                    entity_type: row.get(2)?,
                    delta: row.get(3)?,
                    updated_at: row.get(4)?,
                    reason: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Subtract `rate` from every confidence above the floor across functions,
    /// modules, and non-invalidated context packs. Returns rows changed.
    pub fn apply_time_decay(&self, rate: f64) -> Result<u64> {
        if rate <= 0.0 {
            return Err(Error::Validation("decay rate must be positive".to_string()));
        }
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let floor = crate::types::CONFIDENCE_FLOOR;

        let mut changed = 0usize;
        changed += tx.execute(
            "UPDATE functions SET confidence = MAX(?1, confidence - ?2) WHERE confidence > ?1",
            params![floor, rate],
        )?;
        changed += tx.execute(
            "UPDATE modules SET confidence = MAX(?1, confidence - ?2) WHERE confidence > ?1",
            params![floor, rate],
        )?;
        changed += tx.execute(
            "UPDATE context_packs SET confidence = MAX(?1, confidence - ?2)
             WHERE confidence > ?1 AND invalidated = 0",
            params![floor, rate],
        )?;
        tx.commit()?;
        Ok(changed as u64)
    }
}
