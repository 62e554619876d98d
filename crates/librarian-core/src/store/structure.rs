/**
 * Structural Knowledge - Modules, Files, Directories
 *
 * Module rows are unique on `path`; file and directory summaries are keyed by
 * `path`. All string fields pass redaction; all paths normalize to
 * workspace-relative, forward-slash form before persistence.
 */

use crate::error::{Error, Result};
use crate::types::{
    clamp_confidence, ComplexityBand, DirectoryKnowledge, FileKnowledge, ModuleKnowledge,
};
use rusqlite::{params, OptionalExtension, Row};

use super::{decode_list, encode_list, now_iso, KnowledgeStore};

/// Producer-facing input for a module upsert.
#[derive(Debug, Clone)]
pub struct ModuleDraft {
    pub path: String,
    pub purpose: String,
    pub exports: Vec<String>,
    pub dependencies: Vec<String>,
    pub confidence: f64,
}

fn row_to_module(row: &Row<'_>) -> rusqlite::Result<ModuleKnowledge> {
    Ok(ModuleKnowledge {
        id: row.get(0)?,
        path: row.get(1)?,
        purpose: row.get(2)?,
        exports: decode_list(&row.get::<_, String>(3)?),
        dependencies: decode_list(&row.get::<_, String>(4)?),
        confidence: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const MODULE_COLUMNS: &str =
    "id, path, purpose, exports, dependencies, confidence, created_at, updated_at";

/// Connection-level module upsert shared by the single and batch paths.
pub(crate) fn upsert_module_conn(
    conn: &rusqlite::Connection,
    redactor: &crate::redaction::Redactor,
    workspace_root: &std::path::Path,
    draft: &ModuleDraft,
) -> Result<ModuleKnowledge> {
    if draft.path.is_empty() {
        return Err(Error::Validation("module path cannot be empty".to_string()));
    }
    let path = crate::canonical::normalize_path(workspace_root, &draft.path);
    let (purpose, _) = redactor.redact(&draft.purpose);
    let now = now_iso();

    conn.execute(
        "INSERT INTO modules (id, path, purpose, exports, dependencies, confidence, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT (path) DO UPDATE SET
            purpose = excluded.purpose,
            exports = excluded.exports,
            dependencies = excluded.dependencies,
            confidence = excluded.confidence,
            updated_at = excluded.updated_at",
        params![
            uuid::Uuid::new_v4().to_string(),
            path,
            purpose,
            encode_list(&draft.exports)?,
            encode_list(&draft.dependencies)?,
            clamp_confidence(draft.confidence),
            now,
        ],
    )?;

    let row = conn.query_row(
        &format!("SELECT {} FROM modules WHERE path = ?1", MODULE_COLUMNS),
        params![path],
        row_to_module,
    )?;
    Ok(row)
}

impl KnowledgeStore {
    pub fn upsert_module(&self, draft: &ModuleDraft) -> Result<ModuleKnowledge> {
        let conn = self.lock_conn()?;
        upsert_module_conn(&conn, &self.redactor, &self.config.workspace_root, draft)
    }

    /// Batch upsert inside a single transaction: all or nothing.
    pub fn upsert_modules(&self, drafts: &[ModuleDraft]) -> Result<Vec<ModuleKnowledge>> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut out = Vec::with_capacity(drafts.len());
        for draft in drafts {
            out.push(upsert_module_conn(
                &tx,
                &self.redactor,
                &self.config.workspace_root,
                draft,
            )?);
        }
        tx.commit()?;
        Ok(out)
    }

    pub fn get_module(&self, id: &str) -> Result<Option<ModuleKnowledge>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM modules WHERE id = ?1", MODULE_COLUMNS),
                params![id],
                row_to_module,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_module_by_path(&self, path: &str) -> Result<Option<ModuleKnowledge>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM modules WHERE path = ?1", MODULE_COLUMNS),
                params![self.normalize(path)],
                row_to_module,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_modules(&self, limit: u32) -> Result<Vec<ModuleKnowledge>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM modules ORDER BY path ASC LIMIT ?1",
            MODULE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_module)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_module_by_path(&self, path: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        Ok(conn.execute("DELETE FROM modules WHERE path = ?1", params![self.normalize(path)])? > 0)
    }

    /// Upsert a file summary keyed by path; `updated_at` is store-managed.
    pub fn upsert_file_knowledge(&self, file: &FileKnowledge) -> Result<FileKnowledge> {
        if file.path.is_empty() {
            return Err(Error::Validation("file path cannot be empty".to_string()));
        }
        let conn = self.lock_conn()?;
        let path = self.normalize(&file.path);
        let (purpose, _) = self.redactor.redact(&file.purpose);
        let imports: Vec<String> = file.imports.iter().map(|p| self.normalize(p)).collect();
        let imported_by: Vec<String> = file.imported_by.iter().map(|p| self.normalize(p)).collect();

        conn.execute(
            "INSERT INTO file_knowledge (
                path, category, role, purpose, complexity, function_count, line_count,
                imports, imported_by, checksum, confidence, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT (path) DO UPDATE SET
                category = excluded.category,
                role = excluded.role,
                purpose = excluded.purpose,
                complexity = excluded.complexity,
                function_count = excluded.function_count,
                line_count = excluded.line_count,
                imports = excluded.imports,
                imported_by = excluded.imported_by,
                checksum = excluded.checksum,
                confidence = excluded.confidence,
                updated_at = excluded.updated_at",
            params![
                path,
                file.category,
                file.role,
                purpose,
                file.complexity.as_str(),
                file.function_count as i64,
                file.line_count as i64,
                encode_list(&imports)?,
                encode_list(&imported_by)?,
                file.checksum,
                clamp_confidence(file.confidence),
                now_iso(),
            ],
        )?;

        self.file_knowledge_locked(&conn, &path)?
            .ok_or_else(|| Error::Database("file row vanished immediately after upsert".to_string()))
    }

    pub fn get_file_knowledge(&self, path: &str) -> Result<Option<FileKnowledge>> {
        let conn = self.lock_conn()?;
        self.file_knowledge_locked(&conn, &self.normalize(path))
    }

    fn file_knowledge_locked(
        &self,
        conn: &rusqlite::Connection,
        path: &str,
    ) -> Result<Option<FileKnowledge>> {
        let row = conn
            .query_row(
                "SELECT path, category, role, purpose, complexity, function_count, line_count,
                        imports, imported_by, checksum, confidence, updated_at
                 FROM file_knowledge WHERE path = ?1",
                params![path],
                |row| {
                    Ok(FileKnowledge {
                        path: row.get(0)?,
                        category: row.get(1)?,
                        role: row.get(2)?,
                        purpose: row.get(3)?,
                        complexity: ComplexityBand::parse(&row.get::<_, String>(4)?)
                            .unwrap_or(ComplexityBand::Low),
                        function_count: row.get::<_, i64>(5)? as u32,
                        line_count: row.get::<_, i64>(6)? as u32,
                        imports: decode_list(&row.get::<_, String>(7)?),
                        imported_by: decode_list(&row.get::<_, String>(8)?),
                        checksum: row.get(9)?,
                        confidence: row.get(10)?,
                        updated_at: row.get(11)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete_file_knowledge(&self, path: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        Ok(conn.execute(
            "DELETE FROM file_knowledge WHERE path = ?1",
            params![self.normalize(path)],
        )? > 0)
    }

    pub fn upsert_directory_knowledge(
        &self,
        dir: &DirectoryKnowledge,
    ) -> Result<DirectoryKnowledge> {
        if dir.path.is_empty() {
            return Err(Error::Validation("directory path cannot be empty".to_string()));
        }
        let conn = self.lock_conn()?;
        let path = self.normalize(&dir.path);
        let (purpose, _) = self.redactor.redact(&dir.purpose);
        let siblings: Vec<String> = dir.siblings.iter().map(|p| self.normalize(p)).collect();
        let parent = dir.parent.as_ref().map(|p| self.normalize(p));

        conn.execute(
            "INSERT INTO directory_knowledge (
                path, purpose, role, file_count, subdirectory_count, parent, siblings,
                confidence, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (path) DO UPDATE SET
                purpose = excluded.purpose,
                role = excluded.role,
                file_count = excluded.file_count,
                subdirectory_count = excluded.subdirectory_count,
                parent = excluded.parent,
                siblings = excluded.siblings,
                confidence = excluded.confidence,
                updated_at = excluded.updated_at",
            params![
                path,
                purpose,
                dir.role,
                dir.file_count as i64,
                dir.subdirectory_count as i64,
                parent,
                encode_list(&siblings)?,
                clamp_confidence(dir.confidence),
                now_iso(),
            ],
        )?;

        let row = conn.query_row(
            "SELECT path, purpose, role, file_count, subdirectory_count, parent, siblings,
                    confidence, updated_at
             FROM directory_knowledge WHERE path = ?1",
            params![path],
            |row| {
                Ok(DirectoryKnowledge {
                    path: row.get(0)?,
                    purpose: row.get(1)?,
                    role: row.get(2)?,
                    file_count: row.get::<_, i64>(3)? as u32,
                    subdirectory_count: row.get::<_, i64>(4)? as u32,
                    parent: row.get(5)?,
                    siblings: decode_list(&row.get::<_, String>(6)?),
                    confidence: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            },
        )?;
        Ok(row)
    }

    pub fn get_directory_knowledge(&self, path: &str) -> Result<Option<DirectoryKnowledge>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT path, purpose, role, file_count, subdirectory_count, parent, siblings,
                        confidence, updated_at
                 FROM directory_knowledge WHERE path = ?1",
                params![self.normalize(path)],
                |row| {
                    Ok(DirectoryKnowledge {
                        path: row.get(0)?,
                        purpose: row.get(1)?,
                        role: row.get(2)?,
                        file_count: row.get::<_, i64>(3)? as u32,
                        subdirectory_count: row.get::<_, i64>(4)? as u32,
                        parent: row.get(5)?,
                        siblings: decode_list(&row.get::<_, String>(6)?),
                        confidence: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
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

    #[test]
    fn test_module_upsert_unique_on_path() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let first = store
            .upsert_module(&ModuleDraft {
                path: "src/parser".to_string(),
                purpose: "parsing".to_string(),
                exports: vec!["parse".to_string()],
                dependencies: vec![],
                confidence: 0.8,
            })
            .unwrap();

        let second = store
            .upsert_module(&ModuleDraft {
                path: "src/parser".to_string(),
                purpose: "parsing v2".to_string(),
                exports: vec!["parse".to_string(), "lex".to_string()],
                dependencies: vec!["src/tokens".to_string()],
                confidence: 0.85,
            })
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.exports.len(), 2);
        assert_eq!(store.list_modules(10).unwrap().len(), 1);
    }

    #[test]
    fn test_file_knowledge_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let file = FileKnowledge {
            path: "src/a.ts".to_string(),
            category: "source".to_string(),
            role: "parser".to_string(),
            purpose: "token stream handling".to_string(),
            complexity: ComplexityBand::High,
            function_count: 12,
            line_count: 340,
            imports: vec!["src/tokens.ts".to_string()],
            imported_by: vec!["src/index.ts".to_string()],
            checksum: "abc123".to_string(),
            confidence: 0.7,
            updated_at: String::new(),
        };
        store.upsert_file_knowledge(&file).unwrap();

        let loaded = store.get_file_knowledge("src/a.ts").unwrap().unwrap();
        assert_eq!(loaded.complexity, ComplexityBand::High);
        assert_eq!(loaded.imports, vec!["src/tokens.ts".to_string()]);
        assert!(!loaded.updated_at.is_empty());
    }

    #[test]
    fn test_directory_knowledge_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let record = DirectoryKnowledge {
            path: "src/parser".to_string(),
            purpose: "parsing subsystem".to_string(),
            role: "library".to_string(),
            file_count: 4,
            subdirectory_count: 1,
            parent: Some("src".to_string()),
            siblings: vec!["src/lexer".to_string()],
            confidence: 0.6,
            updated_at: String::new(),
        };
        store.upsert_directory_knowledge(&record).unwrap();

        let loaded = store.get_directory_knowledge("src/parser").unwrap().unwrap();
        assert_eq!(loaded.parent.as_deref(), Some("src"));
        assert_eq!(loaded.siblings, vec!["src/lexer".to_string()]);
    }
}
