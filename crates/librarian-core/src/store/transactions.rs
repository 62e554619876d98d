/**
 * Transactions & Change Log
 *
 * DESIGN DECISION: Serial FIFO transaction queue with an optimistic coordination-version CAS
 * WHY: The store allows one active writer transaction per instance; the
 *      version CAS still guards against any out-of-band writer that slipped
 *      past the queue, and gives subscribers a strictly monotone resume point
 *
 * REASONING CHAIN:
 * 1. `transaction(fn)` serializes through a mutex, opens one SQL transaction,
 *    and hands the callback a scoped mutation context
 * 2. Each mutation records a pending change {type, path}, deduplicated by
 *    (type, path)
 * 3. Commit: read version v at txn start, apply mutations, CAS v -> v+1; a
 *    rows-changed count other than one raises TransactionConflict and rolls
 *    everything back
 * 4. Change-log rows are appended with the new version inside the same
 *    transaction
 * 5. Events reach subscribers strictly after commit, in ascending
 *    (version, timestamp) order; a subscriber can never observe pre-commit
 *    state
 */

use crate::error::{Error, Result};
use crate::redaction::Redactor;
use crate::types::{ChangeEvent, ChangeEventType, FunctionKnowledge};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::functions::{delete_functions_by_path_conn, upsert_function_conn, FunctionDraft};
use super::{now_iso, KnowledgeStore};

/// Callback registry for committed change events.
///
/// Synchronous delivery in commit order; the store is single-process and the
/// bus is invoked outside the connection lock.
#[derive(Clone, Default)]
pub struct ChangeEventBus {
    subscribers: Arc<Mutex<Vec<Box<dyn Fn(&[ChangeEvent]) + Send>>>>,
}

impl ChangeEventBus {
    pub fn subscribe(&self, callback: impl Fn(&[ChangeEvent]) + Send + 'static) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Box::new(callback));
        }
    }

    pub(crate) fn emit(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        if let Ok(subs) = self.subscribers.lock() {
            for callback in subs.iter() {
                callback(events);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingChange {
    event_type: ChangeEventType,
    path: String,
}

/// Scoped mutation context handed to transaction callbacks. Dropping it
/// without commit rolls the SQL transaction back.
pub struct StoreTransaction<'a> {
    tx: rusqlite::Transaction<'a>,
    base_version: u64,
    pending: Vec<PendingChange>,
    redactor: &'a Redactor,
    workspace_root: &'a Path,
}

impl<'a> StoreTransaction<'a> {
    /// Coordination version observed when this transaction began.
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    /// Record a pending change event; deduplicated by (type, path).
    pub fn record_change(&mut self, event_type: ChangeEventType, path: &str) {
        let normalized = crate::canonical::normalize_path(self.workspace_root, path);
        let change = PendingChange {
            event_type,
            path: normalized,
        };
        if !self.pending.contains(&change) {
            self.pending.push(change);
        }
    }

    pub fn record_file_added(&mut self, path: &str) {
        self.record_change(ChangeEventType::FileAdded, path);
    }

    pub fn record_file_removed(&mut self, path: &str) {
        self.record_change(ChangeEventType::FileRemoved, path);
    }

    /// Upsert a function and record the function_updated change.
    pub fn upsert_function(&mut self, draft: &FunctionDraft) -> Result<FunctionKnowledge> {
        let row = upsert_function_conn(&self.tx, self.redactor, self.workspace_root, draft)?;
        self.record_change(ChangeEventType::FunctionUpdated, &row.file_path);
        Ok(row)
    }

    /// Remove every function under a path and record the file_removed change.
    pub fn delete_functions_by_path(&mut self, file_path: &str) -> Result<u64> {
        let normalized = crate::canonical::normalize_path(self.workspace_root, file_path);
        let removed = delete_functions_by_path_conn(&self.tx, &normalized)?;
        self.record_change(ChangeEventType::FileRemoved, &normalized);
        Ok(removed)
    }
}

/// Read the singleton coordination version.
pub(crate) fn coordination_version_conn(conn: &Connection) -> Result<u64> {
    let version: i64 =
        conn.query_row("SELECT version FROM coordination WHERE id = 1", [], |r| r.get(0))?;
    Ok(version as u64)
}

/// Compare-and-swap the coordination version from `from` to `from + 1`.
/// Exactly one row must change; anything else is a lost race.
pub(crate) fn advance_version_conn(conn: &Connection, from: u64) -> Result<u64> {
    let next = from + 1;
    let changed = conn.execute(
        "UPDATE coordination SET version = ?1 WHERE id = 1 AND version = ?2",
        params![next as i64, from as i64],
    )?;
    if changed != 1 {
        return Err(Error::TransactionConflict { expected: from });
    }
    Ok(next)
}

impl KnowledgeStore {
    /// Run a mutation batch. Mutations are atomic; the coordination version
    /// advances exactly once when the batch produced changes; events are
    /// emitted only after a successful commit.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreTransaction<'_>) -> Result<T>,
    {
        let _serial = self
            .txn_queue
            .lock()
            .map_err(|_| Error::Database("transaction queue poisoned".to_string()))?;
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let base_version = coordination_version_conn(&tx)?;

        let mut ctx = StoreTransaction {
            tx,
            base_version,
            pending: Vec::new(),
            redactor: &self.redactor,
            workspace_root: &self.config.workspace_root,
        };

        let value = f(&mut ctx)?;

        let StoreTransaction {
            tx,
            base_version,
            pending,
            ..
        } = ctx;

        let mut emitted: Vec<ChangeEvent> = Vec::new();
        if !pending.is_empty() {
            let next = advance_version_conn(&tx, base_version)?;
            let now = now_iso();
            for change in &pending {
                tx.execute(
                    "INSERT INTO change_log (event_type, path, version, timestamp)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![change.event_type.as_str(), change.path, next as i64, now],
                )?;
                emitted.push(ChangeEvent {
                    id: tx.last_insert_rowid() as u64,
                    event_type: change.event_type,
                    path: change.path.clone(),
                    version: next,
                    timestamp: now.clone(),
                });
            }
        }

        tx.commit()?;

        // Post-commit only; subscribers never see uncommitted state.
        self.bus.emit(&emitted);
        Ok(value)
    }

    /// Subscribe to committed change events.
    pub fn subscribe_changes(&self, callback: impl Fn(&[ChangeEvent]) + Send + 'static) {
        self.bus.subscribe(callback);
    }

    pub fn coordination_version(&self) -> Result<u64> {
        let conn = self.lock_conn()?;
        coordination_version_conn(&conn)
    }

    /// Optimistic version bump from a known base. Exposed for retry flows and
    /// recovery tooling; lost races surface as TransactionConflict.
    pub fn advance_coordination_version(&self, from: u64) -> Result<u64> {
        let conn = self.lock_conn()?;
        advance_version_conn(&conn, from)
    }

    /// Change events with version > since_version, ascending, optionally
    /// filtered by glob patterns (`*`, `**`, literal segments).
    pub fn change_events_since(
        &self,
        since_version: u64,
        paths: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_type, path, version, timestamp FROM change_log
             WHERE version > ?1 ORDER BY version ASC, timestamp ASC, id ASC",
        )?;
        let rows: Vec<ChangeEvent> = stmt
            .query_map(params![since_version as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)? as u64,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|(id, event_type, path, version, timestamp)| {
                let event_type = ChangeEventType::parse(&event_type)?;
                Some(ChangeEvent {
                    id,
                    event_type,
                    path,
                    version,
                    timestamp,
                })
            })
            .collect();

        let filtered: Vec<ChangeEvent> = match paths {
            None => rows,
            Some(patterns) => rows
                .into_iter()
                .filter(|event| {
                    patterns
                        .iter()
                        .any(|pattern| crate::canonical::glob_match(pattern, &event.path))
                })
                .collect(),
        };

        Ok(filtered.into_iter().take(limit).collect())
    }
}
