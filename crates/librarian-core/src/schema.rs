/**
 * Schema & Migrations
 *
 * DESIGN DECISION: Ordered, idempotent migration registry keyed by integer version
 * WHY: The schema evolves with the indexer; every upgrade step runs in its own
 *      transaction and a failed step leaves the store refusing to open
 *
 * REASONING CHAIN:
 * 1. `meta` holds schema_version and workspace_root; migrations read the
 *    stored version and apply every later step in order
 * 2. DDL is idempotent (CREATE IF NOT EXISTS, ensure_column via PRAGMA
 *    table_info) so interrupted upgrades can re-run safely
 * 3. Dynamic identifiers (ORDER BY column, direction, table name) pass a
 *    closed allowlist before any SQL assembly
 * 4. Workspace rebinding rewrites path-bearing columns, including the JSON
 *    path arrays inside context packs, inside one transaction with an audit
 *    row in `meta`
 */

use crate::canonical::to_forward_slashes;
use crate::error::{Error, Result};
use crate::types::OrderDirection;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Current schema version; migrations run up to this.
pub const SCHEMA_VERSION: u32 = 3;

/// Tables reachable by dynamic queries. Everything else is rejected.
pub const TABLE_ALLOWLIST: &[&str] = &[
    "functions",
    "modules",
    "file_knowledge",
    "directory_knowledge",
    "context_packs",
    "graph_edges",
    "embeddings",
    "multi_vectors",
    "evidence",
    "change_log",
    "coordination",
    "query_cache",
    "query_access_log",
    "confidence_events",
    "blame_records",
    "diff_records",
    "reflog_records",
    "clone_records",
    "debt_records",
    "knowledge_edges",
    "fault_localizations",
    "ingestion_items",
    "evolution_outcomes",
    "quality_history",
    "assessments",
    "meta",
];

/// Validate a table name against the closed allowlist.
pub fn validate_table_name(name: &str) -> Result<&str> {
    TABLE_ALLOWLIST
        .iter()
        .find(|t| **t == name)
        .copied()
        .ok_or_else(|| Error::InvalidTableName(name.to_string()))
}

/// Validate an ORDER BY column against a per-table allowlist.
pub fn validate_order_column<'a>(column: &'a str, allowed: &[&str]) -> Result<&'a str> {
    if allowed.contains(&column) {
        Ok(column)
    } else {
        Err(Error::InvalidOrderColumn(column.to_string()))
    }
}

/// Validate an ORDER BY direction string (`ASC`/`DESC`, case-insensitive).
pub fn validate_order_direction(direction: &str) -> Result<OrderDirection> {
    match direction.to_ascii_uppercase().as_str() {
        "ASC" => Ok(OrderDirection::Ascending),
        "DESC" => Ok(OrderDirection::Descending),
        _ => Err(Error::InvalidOrderDirection(direction.to_string())),
    }
}

struct Migration {
    version: u32,
    name: &'static str,
    apply: fn(&rusqlite::Transaction<'_>) -> Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "base schema",
        apply: migrate_v1_base_schema,
    },
    Migration {
        version: 2,
        name: "git-derived record families",
        apply: migrate_v2_git_history,
    },
    Migration {
        version: 3,
        name: "ensure-column backfill",
        apply: migrate_v3_ensure_columns,
    },
];

/// Run every pending migration. Each step commits on its own; a failing step
/// rolls back and surfaces `MigrationFailed`.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    bootstrap_meta(conn)?;
    let current = stored_schema_version(conn)?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        (migration.apply)(&tx).map_err(|e| Error::MigrationFailed {
            version: migration.version,
            message: format!("{}: {}", migration.name, e),
        })?;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![migration.version.to_string()],
        )?;
        tx.commit().map_err(|e| Error::MigrationFailed {
            version: migration.version,
            message: e.to_string(),
        })?;
    }

    Ok(())
}

fn bootstrap_meta(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

fn stored_schema_version(conn: &Connection) -> Result<u32> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
}

fn migrate_v1_base_schema(tx: &rusqlite::Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS functions (
            id TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            name TEXT NOT NULL,
            signature TEXT NOT NULL DEFAULT '',
            purpose TEXT NOT NULL DEFAULT '',
            start_line INTEGER NOT NULL DEFAULT 0,
            end_line INTEGER NOT NULL DEFAULT 0,
            is_pure INTEGER NOT NULL DEFAULT 0,
            has_side_effects INTEGER NOT NULL DEFAULT 0,
            modifies_params INTEGER NOT NULL DEFAULT 0,
            throws INTEGER NOT NULL DEFAULT 0,
            return_depends_on_inputs INTEGER NOT NULL DEFAULT 0,
            effect_signature TEXT NOT NULL DEFAULT '[]',
            confidence REAL NOT NULL DEFAULT 0.5,
            successes INTEGER NOT NULL DEFAULT 0,
            failures INTEGER NOT NULL DEFAULT 0,
            validation_count INTEGER NOT NULL DEFAULT 0,
            access_count INTEGER NOT NULL DEFAULT 0,
            last_accessed TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_verified_at TEXT,
            UNIQUE (file_path, name)
        );
        CREATE INDEX IF NOT EXISTS idx_functions_file_path ON functions(file_path);
        CREATE INDEX IF NOT EXISTS idx_functions_confidence ON functions(confidence);

        CREATE TABLE IF NOT EXISTS modules (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            purpose TEXT NOT NULL DEFAULT '',
            exports TEXT NOT NULL DEFAULT '[]',
            dependencies TEXT NOT NULL DEFAULT '[]',
            confidence REAL NOT NULL DEFAULT 0.5,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS file_knowledge (
            path TEXT PRIMARY KEY,
            category TEXT NOT NULL DEFAULT '',
            role TEXT NOT NULL DEFAULT '',
            purpose TEXT NOT NULL DEFAULT '',
            complexity TEXT NOT NULL DEFAULT 'low',
            function_count INTEGER NOT NULL DEFAULT 0,
            line_count INTEGER NOT NULL DEFAULT 0,
            imports TEXT NOT NULL DEFAULT '[]',
            imported_by TEXT NOT NULL DEFAULT '[]',
            checksum TEXT NOT NULL DEFAULT '',
            confidence REAL NOT NULL DEFAULT 0.5,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS directory_knowledge (
            path TEXT PRIMARY KEY,
            purpose TEXT NOT NULL DEFAULT '',
            role TEXT NOT NULL DEFAULT '',
            file_count INTEGER NOT NULL DEFAULT 0,
            subdirectory_count INTEGER NOT NULL DEFAULT 0,
            parent TEXT,
            siblings TEXT NOT NULL DEFAULT '[]',
            confidence REAL NOT NULL DEFAULT 0.5,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS context_packs (
            pack_id TEXT PRIMARY KEY,
            pack_type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            key_facts TEXT NOT NULL DEFAULT '[]',
            code_snippets TEXT NOT NULL DEFAULT '[]',
            related_files TEXT NOT NULL DEFAULT '[]',
            invalidation_triggers TEXT NOT NULL DEFAULT '[]',
            confidence REAL NOT NULL DEFAULT 0.5,
            access_count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            version_string TEXT NOT NULL DEFAULT '',
            schema_version INTEGER NOT NULL DEFAULT 1,
            content_hash TEXT NOT NULL DEFAULT '',
            invalidated INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (target_id, pack_type)
        );
        CREATE INDEX IF NOT EXISTS idx_context_packs_target ON context_packs(target_id);

        CREATE TABLE IF NOT EXISTS graph_edges (
            from_id TEXT NOT NULL,
            to_id TEXT NOT NULL,
            edge_type TEXT NOT NULL,
            source_file TEXT NOT NULL,
            from_type TEXT NOT NULL DEFAULT '',
            to_type TEXT NOT NULL DEFAULT '',
            source_line INTEGER,
            confidence REAL NOT NULL DEFAULT 0.5,
            computed_at TEXT NOT NULL,
            PRIMARY KEY (from_id, to_id, edge_type, source_file)
        );
        CREATE INDEX IF NOT EXISTS idx_graph_edges_from ON graph_edges(from_id);
        CREATE INDEX IF NOT EXISTS idx_graph_edges_source ON graph_edges(source_file);

        CREATE TABLE IF NOT EXISTS embeddings (
            entity_id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            vector BLOB NOT NULL,
            dim INTEGER NOT NULL,
            model_id TEXT NOT NULL DEFAULT '',
            generated_at TEXT NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_embeddings_dim ON embeddings(dim);

        CREATE TABLE IF NOT EXISTS multi_vectors (
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            model_id TEXT NOT NULL DEFAULT '',
            generated_at TEXT NOT NULL,
            PRIMARY KEY (entity_id, entity_type)
        );

        CREATE TABLE IF NOT EXISTS evidence (
            claim_id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            file_path TEXT NOT NULL,
            line_start INTEGER NOT NULL,
            line_end INTEGER,
            snippet TEXT NOT NULL,
            claim TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 0.5,
            created_at TEXT NOT NULL,
            content_hash TEXT,
            verified_at TEXT,
            stale INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_evidence_entity ON evidence(entity_id, entity_type);
        CREATE INDEX IF NOT EXISTS idx_evidence_file ON evidence(file_path);

        CREATE TABLE IF NOT EXISTS coordination (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO coordination (id, version) VALUES (1, 0);

        CREATE TABLE IF NOT EXISTS change_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            path TEXT NOT NULL,
            version INTEGER NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_change_log_version ON change_log(version);

        CREATE TABLE IF NOT EXISTS query_cache (
            query_hash TEXT PRIMARY KEY,
            query_params TEXT NOT NULL,
            response TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_accessed TEXT NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS query_access_log (
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            last_queried_at TEXT NOT NULL,
            query_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (entity_id, entity_type)
        );

        CREATE TABLE IF NOT EXISTS confidence_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            delta REAL NOT NULL,
            updated_at TEXT NOT NULL,
            reason TEXT NOT NULL DEFAULT ''
        );",
    )?;
    Ok(())
}

fn migrate_v2_git_history(tx: &rusqlite::Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS blame_records (
            id TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            line_start INTEGER NOT NULL,
            line_end INTEGER NOT NULL,
            author TEXT NOT NULL DEFAULT '',
            commit_hash TEXT NOT NULL,
            committed_at TEXT NOT NULL DEFAULT '',
            summary TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_blame_file ON blame_records(file_path);

        CREATE TABLE IF NOT EXISTS diff_records (
            id TEXT PRIMARY KEY,
            commit_hash TEXT NOT NULL,
            file_path TEXT NOT NULL,
            change_kind TEXT NOT NULL DEFAULT '',
            lines_added INTEGER NOT NULL DEFAULT 0,
            lines_removed INTEGER NOT NULL DEFAULT 0,
            committed_at TEXT NOT NULL DEFAULT '',
            summary TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_diff_file ON diff_records(file_path);

        CREATE TABLE IF NOT EXISTS reflog_records (
            id TEXT PRIMARY KEY,
            ref_name TEXT NOT NULL,
            action TEXT NOT NULL DEFAULT '',
            commit_hash TEXT NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT '',
            message TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS clone_records (
            id TEXT PRIMARY KEY,
            file_path_a TEXT NOT NULL,
            line_start_a INTEGER NOT NULL,
            line_end_a INTEGER NOT NULL,
            file_path_b TEXT NOT NULL,
            line_start_b INTEGER NOT NULL,
            line_end_b INTEGER NOT NULL,
            similarity REAL NOT NULL DEFAULT 0,
            detected_at TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS debt_records (
            id TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT '',
            severity TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            estimated_effort TEXT NOT NULL DEFAULT '',
            recorded_at TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS knowledge_edges (
            from_id TEXT NOT NULL,
            to_id TEXT NOT NULL,
            relation TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 0,
            computed_at TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (from_id, to_id, relation)
        );

        CREATE TABLE IF NOT EXISTS fault_localizations (
            id TEXT PRIMARY KEY,
            symptom TEXT NOT NULL,
            file_path TEXT NOT NULL,
            line_start INTEGER,
            line_end INTEGER,
            suspiciousness REAL NOT NULL DEFAULT 0,
            computed_at TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS ingestion_items (
            id TEXT PRIMARY KEY,
            source_path TEXT NOT NULL,
            item_kind TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS evolution_outcomes (
            id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            outcome TEXT NOT NULL DEFAULT '',
            detail TEXT NOT NULL DEFAULT '',
            recorded_at TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS quality_history (
            id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            metric TEXT NOT NULL,
            value REAL NOT NULL DEFAULT 0,
            recorded_at TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS assessments (
            id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            assessor TEXT NOT NULL DEFAULT '',
            verdict TEXT NOT NULL DEFAULT '',
            score REAL NOT NULL DEFAULT 0,
            notes TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT ''
        );",
    )?;
    Ok(())
}

/// Defensive ensure-column pass for databases written by older indexers.
fn migrate_v3_ensure_columns(tx: &rusqlite::Transaction<'_>) -> Result<()> {
    ensure_column(tx, "functions", "validation_count", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(tx, "functions", "effect_signature", "TEXT NOT NULL DEFAULT '[]'")?;
    ensure_column(tx, "context_packs", "schema_version", "INTEGER NOT NULL DEFAULT 1")?;
    ensure_column(tx, "context_packs", "version_string", "TEXT NOT NULL DEFAULT ''")?;
    ensure_column(tx, "embeddings", "token_count", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(tx, "evidence", "stale", "INTEGER NOT NULL DEFAULT 0")?;
    Ok(())
}

/// Add a column if the table does not already have it. Idempotent.
pub fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    let table = validate_table_name(table)?;

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<_, _>>()?;

    if !existing.iter().any(|c| c == column) {
        conn.execute(
            &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition),
            [],
        )?;
    }
    Ok(())
}

/**
 * Workspace rebinding
 *
 * On open, compare the stored workspace root with the current one. A moved
 * workspace rewrites absolute-path remnants in path-bearing columns and in
 * JSON-encoded path arrays inside context packs, transactionally, with an
 * audit row recorded in `meta`.
 */
pub fn rebind_workspace(conn: &mut Connection, workspace_root: &Path) -> Result<()> {
    let new_root = to_forward_slashes(&workspace_root.to_string_lossy());
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'workspace_root'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match stored {
        None => {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('workspace_root', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![new_root],
            )?;
            Ok(())
        }
        Some(old_root) if old_root == new_root => Ok(()),
        Some(old_root) => {
            tracing::warn!(
                old = %old_root,
                new = %new_root,
                "workspace root changed; rebinding stored paths"
            );
            let tx = conn.transaction()?;
            let mut rows_touched = 0usize;

            // Path-bearing TEXT columns across entity tables.
            const PATH_COLUMNS: &[(&str, &str)] = &[
                ("functions", "file_path"),
                ("modules", "path"),
                ("file_knowledge", "path"),
                ("directory_knowledge", "path"),
                ("graph_edges", "source_file"),
                ("evidence", "file_path"),
                ("change_log", "path"),
                ("blame_records", "file_path"),
                ("diff_records", "file_path"),
                ("debt_records", "file_path"),
                ("fault_localizations", "file_path"),
                ("ingestion_items", "source_path"),
            ];
            for (table, column) in PATH_COLUMNS {
                let table = validate_table_name(table)?;
                let sql = format!(
                    "UPDATE {t} SET {c} = ?1 || substr({c}, length(?2) + 1)
                     WHERE {c} LIKE ?2 || '%'",
                    t = table,
                    c = column
                );
                rows_touched += tx.execute(&sql, params![new_root, old_root])?;
            }

            // JSON-encoded path arrays inside context packs.
            rows_touched += rebind_pack_json(&tx, &old_root, &new_root)?;

            tx.execute(
                "INSERT INTO meta (key, value) VALUES ('workspace_root', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![new_root],
            )?;
            let audit = serde_json::json!({
                "from": old_root,
                "to": new_root,
                "rows": rows_touched,
                "at": chrono::Utc::now().to_rfc3339(),
            });
            tx.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![
                    format!("rebind:{}", chrono::Utc::now().timestamp()),
                    audit.to_string()
                ],
            )?;
            tx.commit()?;
            Ok(())
        }
    }
}

fn rebind_pack_json(
    tx: &rusqlite::Transaction<'_>,
    old_root: &str,
    new_root: &str,
) -> Result<usize> {
    let mut stmt = tx.prepare(
        "SELECT pack_id, related_files, invalidation_triggers, code_snippets
         FROM context_packs
         WHERE related_files LIKE '%' || ?1 || '%'
            OR invalidation_triggers LIKE '%' || ?1 || '%'
            OR code_snippets LIKE '%' || ?1 || '%'",
    )?;
    let rows: Vec<(String, String, String, String)> = stmt
        .query_map(params![old_root], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<std::result::Result<_, _>>()?;
    drop(stmt);

    let rebind_array = |raw: &str| -> Result<String> {
        let mut items: Vec<String> = serde_json::from_str(raw)?;
        for item in &mut items {
            if item.starts_with(old_root) {
                *item = format!("{}{}", new_root, &item[old_root.len()..]);
            }
        }
        Ok(serde_json::to_string(&items)?)
    };

    let mut touched = 0usize;
    for (pack_id, related, triggers, snippets) in rows {
        let related = rebind_array(&related)?;
        let triggers = rebind_array(&triggers)?;

        let mut snippet_values: Vec<serde_json::Value> = serde_json::from_str(&snippets)?;
        for value in &mut snippet_values {
            if let Some(path) = value.get("file_path").and_then(|p| p.as_str()) {
                if path.starts_with(old_root) {
                    let rebased = format!("{}{}", new_root, &path[old_root.len()..]);
                    value["file_path"] = serde_json::Value::String(rebased);
                }
            }
        }
        let snippets = serde_json::to_string(&snippet_values)?;

        touched += tx.execute(
            "UPDATE context_packs
             SET related_files = ?1, invalidation_triggers = ?2, code_snippets = ?3
             WHERE pack_id = ?4",
            params![related, triggers, snippets, pack_id],
        )?;
    }
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn
    }

    #[test]
    fn test_migrations_reach_current_version() {
        let conn = fresh_conn();
        assert_eq!(stored_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(stored_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_coordination_seeded_at_zero() {
        let conn = fresh_conn();
        let version: u64 = conn
            .query_row("SELECT version FROM coordination WHERE id = 1", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(version, 0);
    }

    #[test]
    fn test_ensure_column_is_idempotent() {
        let conn = fresh_conn();
        ensure_column(&conn, "functions", "validation_count", "INTEGER NOT NULL DEFAULT 0")
            .unwrap();
        ensure_column(&conn, "functions", "validation_count", "INTEGER NOT NULL DEFAULT 0")
            .unwrap();
    }

    #[test]
    fn test_identifier_allowlists() {
        assert!(validate_table_name("functions").is_ok());
        assert!(matches!(
            validate_table_name("sqlite_master"),
            Err(Error::InvalidTableName(_))
        ));
        assert!(validate_order_column("confidence", &["confidence", "name"]).is_ok());
        assert!(matches!(
            validate_order_column("confidence; --", &["confidence"]),
            Err(Error::InvalidOrderColumn(_))
        ));
        assert!(validate_order_direction("desc").is_ok());
        assert!(matches!(
            validate_order_direction("sideways"),
            Err(Error::InvalidOrderDirection(_))
        ));
    }

    #[test]
    fn test_workspace_rebind_rewrites_paths() {
        let mut conn = fresh_conn();
        rebind_workspace(&mut conn, Path::new("/old/work")).unwrap();

        conn.execute(
            "INSERT INTO functions (id, file_path, name, created_at, updated_at)
             VALUES ('f1', '/old/work/src/a.ts', 'parse', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO context_packs (pack_id, pack_type, target_id, related_files, invalidation_triggers, code_snippets, created_at, updated_at)
             VALUES ('p1', 'function_context', 'f1',
                     '[\"/old/work/src/a.ts\"]', '[\"/old/work/src/a.ts\"]',
                     '[{\"file_path\":\"/old/work/src/a.ts\",\"line_start\":1,\"line_end\":2,\"content\":\"x\"}]',
                     '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        rebind_workspace(&mut conn, Path::new("/new/home")).unwrap();

        let path: String = conn
            .query_row("SELECT file_path FROM functions WHERE id = 'f1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(path, "/new/home/src/a.ts");

        let related: String = conn
            .query_row(
                "SELECT related_files FROM context_packs WHERE pack_id = 'p1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(related.contains("/new/home/src/a.ts"));

        let snippets: String = conn
            .query_row(
                "SELECT code_snippets FROM context_packs WHERE pack_id = 'p1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(snippets.contains("/new/home/src/a.ts"));

        // Audit row recorded.
        let audits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM meta WHERE key LIKE 'rebind:%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(audits, 1);
    }
}
