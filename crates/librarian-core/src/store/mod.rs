/**
 * Knowledge Store - Owned Handle Over the Persistent Layer
 *
 * DESIGN DECISION: Scoped resource acquisition instead of a process-wide singleton
 * WHY: The lifecycle (acquire lock -> init schema -> rebind -> release on
 *      drop) is enforced by ownership; there is no ambient global and no lazy
 *      initialization to race against
 *
 * REASONING CHAIN:
 * 1. `open(config)` acquires the writer lock, opens the WAL connection, runs
 *    migrations, rebinds the workspace, and loads the vector index
 * 2. A failed lock or migration means the store refuses to open; recovery is
 *    attempted once for corruption-smelling connection failures
 * 3. Writers serialize through the transaction queue; readers share the
 *    connection behind a mutex and observe the last committed state
 * 4. Dropping the handle flushes the redaction audit, persists the vector
 *    index, and releases the lock
 */

pub mod context_packs;
pub mod embeddings;
pub mod functions;
pub mod graph;
pub mod query_cache;
pub mod structure;
pub mod transactions;

use crate::error::{Error, Result};
use crate::process_lock::{self, ProcessLockHandle};
use crate::recovery;
use crate::redaction::Redactor;
use crate::resource_policy::ResourceMode;
use crate::schema;
use crate::types::{EmbeddingStat, StoreStatistics};
use crate::vector_index::{HnswMode, VectorIndex, VectorIndexConfig};
use crate::vector_index::hnsw::HnswConfig;
use rusqlite::Connection;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use self::transactions::ChangeEventBus;

/// Directory under the workspace holding every persisted artifact.
pub const LIBRARIAN_DIR: &str = ".librarian";
/// Database file name inside the librarian directory.
pub const DB_FILE_NAME: &str = "knowledge.db";
/// Serialized HNSW graph file name.
pub const HNSW_FILE_NAME: &str = "hnsw.bin";
/// Redaction audit report file name.
pub const REDACTION_AUDIT_FILE_NAME: &str = "redaction-audit.json";

/// Store configuration. Explicit construction, optional TOML overrides.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub workspace_root: PathBuf,
    pub db_file_name: String,
    pub hnsw_mode: HnswMode,
    pub hnsw_auto_threshold: usize,
    pub hnsw: HnswConfig,
    pub auto_recover_dimension_mismatch: bool,
    pub redaction_enabled: bool,
    pub resource_mode: ResourceMode,
}

impl StoreConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            db_file_name: DB_FILE_NAME.to_string(),
            hnsw_mode: HnswMode::Auto,
            hnsw_auto_threshold: 5_000,
            hnsw: HnswConfig::default(),
            auto_recover_dimension_mismatch: true,
            redaction_enabled: true,
            resource_mode: ResourceMode::Auto,
        }
    }

    /// Apply overrides from a TOML file when present.
    pub fn with_toml_overrides(mut self, path: &Path) -> Result<Self> {
        let body = match std::fs::read_to_string(path) {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(self),
            Err(err) => return Err(Error::Io(format!("failed to read config: {}", err))),
        };
        let overrides: ConfigOverrides = toml::from_str(&body)
            .map_err(|e| Error::Serialization(format!("config parse error: {}", e)))?;

        if let Some(v) = overrides.hnsw_mode {
            self.hnsw_mode = v;
        }
        if let Some(v) = overrides.hnsw_auto_threshold {
            self.hnsw_auto_threshold = v;
        }
        if let Some(v) = overrides.hnsw_m {
            self.hnsw.m = v;
        }
        if let Some(v) = overrides.hnsw_ef_construction {
            self.hnsw.ef_construction = v;
        }
        if let Some(v) = overrides.hnsw_ef_search {
            self.hnsw.ef_search = v;
        }
        if let Some(v) = overrides.auto_recover_dimension_mismatch {
            self.auto_recover_dimension_mismatch = v;
        }
        if let Some(v) = overrides.redaction_enabled {
            self.redaction_enabled = v;
        }
        if let Some(v) = overrides.resource_mode {
            self.resource_mode = v;
        }
        Ok(self)
    }

    pub fn librarian_dir(&self) -> PathBuf {
        self.workspace_root.join(LIBRARIAN_DIR)
    }

    pub fn db_path(&self) -> PathBuf {
        self.librarian_dir().join(&self.db_file_name)
    }

    pub fn hnsw_path(&self) -> PathBuf {
        self.librarian_dir().join(HNSW_FILE_NAME)
    }

    pub fn redaction_audit_path(&self) -> PathBuf {
        self.librarian_dir().join(REDACTION_AUDIT_FILE_NAME)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    hnsw_mode: Option<HnswMode>,
    hnsw_auto_threshold: Option<usize>,
    hnsw_m: Option<usize>,
    hnsw_ef_construction: Option<usize>,
    hnsw_ef_search: Option<usize>,
    auto_recover_dimension_mismatch: Option<bool>,
    redaction_enabled: Option<bool>,
    resource_mode: Option<ResourceMode>,
}

/// The knowledge store engine. One instance per workspace; the process lock
/// guarantees at most one writer across processes.
pub struct KnowledgeStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
    pub(crate) config: StoreConfig,
    pub(crate) redactor: Redactor,
    pub(crate) vector_index: Mutex<VectorIndex>,
    pub(crate) bus: ChangeEventBus,
    /// FIFO serialization of writer transactions.
    pub(crate) txn_queue: Mutex<()>,
    lock: Option<ProcessLockHandle>,
}

impl KnowledgeStore {
    /// Open the store: lock, connect, migrate, rebind, load the vector index.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let librarian_dir = config.librarian_dir();
        std::fs::create_dir_all(&librarian_dir)
            .map_err(|e| Error::Io(format!("failed to create {}: {}", librarian_dir.display(), e)))?;

        let db_path = config.db_path();
        let lock = process_lock::acquire(&db_path)?;

        let mut conn = match open_connection(&db_path) {
            Ok(conn) => conn,
            Err(err) => {
                // One recovery pass, then one retry.
                let report = recovery::recover_database(&db_path, &err.to_string());
                if report.recovered {
                    tracing::warn!(actions = ?report.actions, "database recovery performed");
                    open_connection(&db_path)?
                } else {
                    return Err(err);
                }
            }
        };

        schema::migrate(&mut conn)?;
        schema::rebind_workspace(&mut conn, &config.workspace_root)?;

        let redactor = Redactor::new(config.redaction_enabled)?;
        let index_config = VectorIndexConfig {
            mode: config.hnsw_mode,
            auto_threshold: config.hnsw_auto_threshold,
            hnsw: config.hnsw,
            auto_recover_dimension_mismatch: config.auto_recover_dimension_mismatch,
            graph_path: config.hnsw_path(),
        };
        let vector_index = VectorIndex::load(index_config, &db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
            redactor,
            vector_index: Mutex::new(vector_index),
            bus: ChangeEventBus::default(),
            txn_queue: Mutex::new(()),
            lock: Some(lock),
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.config.workspace_root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Accumulated redaction counters (since open or last flush).
    pub fn redaction_counts(&self) -> crate::redaction::RedactionCounts {
        self.redactor.accumulated()
    }

    /// Flush accumulated redaction counters to the on-disk audit report.
    pub fn flush_redaction_audit(&self) -> Result<()> {
        self.redactor
            .flush_report(&self.config.workspace_root, &self.config.redaction_audit_path())
    }

    /// Row counts and sizing across entity families.
    pub fn statistics(&self) -> Result<StoreStatistics> {
        let conn = self.lock_conn()?;
        let count = |table: &str| -> Result<u64> {
            let table = schema::validate_table_name(table)?;
            let n: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
            Ok(n as u64)
        };

        let version: i64 =
            conn.query_row("SELECT version FROM coordination WHERE id = 1", [], |r| r.get(0))?;

        let mut stmt =
            conn.prepare("SELECT entity_type, dim, COUNT(*) FROM embeddings GROUP BY entity_type, dim")?;
        let embedding_dims: Vec<EmbeddingStat> = stmt
            .query_map([], |row| {
                Ok(EmbeddingStat {
                    entity_type: row.get(0)?,
                    dim: row.get::<_, i64>(1)? as usize,
                    count: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        Ok(StoreStatistics {
            functions: count("functions")?,
            modules: count("modules")?,
            files: count("file_knowledge")?,
            directories: count("directory_knowledge")?,
            context_packs: count("context_packs")?,
            graph_edges: count("graph_edges")?,
            embeddings: count("embeddings")?,
            evidence_entries: count("evidence")?,
            change_log_entries: count("change_log")?,
            coordination_version: version as u64,
            database_size_bytes: std::fs::metadata(self.config.db_path())
                .map(|m| m.len())
                .unwrap_or(0),
            embedding_dims,
        })
    }

    /// Worker count background index rebuilds may use right now, derived from
    /// the configured resource mode and current pressure. Request-path reads
    /// are never throttled by this.
    pub fn background_worker_budget(&self) -> usize {
        let sample = crate::resource_policy::ResourceMonitor::new().sample();
        crate::resource_policy::worker_budget(&sample, self.config.resource_mode)
    }

    pub(crate) fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("connection lock poisoned".to_string()))
    }

    /// Normalize a path for storage relative to this workspace.
    pub(crate) fn normalize(&self, path: &str) -> String {
        crate::canonical::normalize_path(&self.config.workspace_root, path)
    }
}

impl Drop for KnowledgeStore {
    fn drop(&mut self) {
        let _ = self.flush_redaction_audit();
        if let (Ok(mut index), Ok(conn)) = (self.vector_index.lock(), self.conn.lock()) {
            let _ = index.persist(&conn);
        }
        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }
    }
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .map_err(|e| Error::Io(format!("failed to open knowledge database: {}", e)))?;
    // PRAGMA journal_mode returns a row, so query_row instead of execute
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON", []).ok();
    Ok(conn)
}

/// Current UTC timestamp in the storage format.
pub(crate) fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Encode a string list into its JSON column form.
pub(crate) fn encode_list(items: &[String]) -> Result<String> {
    Ok(serde_json::to_string(items)?)
}

/// Decode a JSON column back into a string list; empty on legacy NULL-ish rows.
pub(crate) fn decode_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}
