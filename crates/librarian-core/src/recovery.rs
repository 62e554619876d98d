/**
 * Recovery - Stale Locks, WAL Fragments, Corrupt Databases
 *
 * DESIGN DECISION: Classify the failure smell first, then take the narrowest action
 * WHY: Removing a live writer's lock or quarantining a healthy database is
 *      worse than failing; every action is recorded and reported
 *
 * REASONING CHAIN:
 * 1. Corruption-class errors ("malformed", "not a database") justify
 *    quarantining the db file to <db>.corrupt.<epoch>
 * 2. Busy/lock-class errors ("database is locked", "sqlite_busy", "wal",
 *    "shm") justify removing stale side files only
 * 3. A lock is stale when its PID is dead, or - PID unknown - when it exceeds
 *    the age threshold for its kind (dir 2min, empty dir 20s, file 5s,
 *    generic 15min)
 * 4. The report lists actions taken and errors hit; the caller retries lock
 *    acquisition once and surfaces the original failure otherwise
 */

use crate::process_lock::{parse_lock_file, pid_alive, ObservedLock};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

/// Age thresholds for locks whose holder PID cannot be determined.
const STALE_DIR_LOCK: Duration = Duration::from_secs(120);
const STALE_EMPTY_DIR_LOCK: Duration = Duration::from_secs(20);
const STALE_FILE_LOCK: Duration = Duration::from_secs(5);
const STALE_GENERIC: Duration = Duration::from_secs(15 * 60);

/// What recovery did (or failed to do).
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub recovered: bool,
    pub removed_lock: bool,
    pub actions: Vec<String>,
    pub errors: Vec<String>,
}

impl RecoveryReport {
    fn action(&mut self, what: impl Into<String>) {
        self.actions.push(what.into());
        self.recovered = true;
    }

    fn error(&mut self, what: impl Into<String>) {
        self.errors.push(what.into());
    }
}

/// Error strings that smell like corruption or lingering journal state.
pub fn classify(error_message: &str) -> FailureClass {
    let lower = error_message.to_lowercase();
    if lower.contains("malformed") || lower.contains("not a database") {
        return FailureClass::Corruption;
    }
    if lower.contains("database is locked")
        || lower.contains("sqlite_busy")
        || lower.contains("wal")
        || lower.contains("shm")
        || lower.contains("locked")
    {
        return FailureClass::LockOrJournal;
    }
    FailureClass::Unrelated
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Corruption,
    LockOrJournal,
    Unrelated,
}

/// Remove a lock file whose holder appears dead or stale.
///
/// Called by the acquire loop; never touches a lock whose PID is alive.
pub fn recover_lock(lock_path: &Path, observed: &ObservedLock) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    let holder_dead = match observed.pid.map(|p| (p, pid_alive(p))) {
        Some((_, Some(true))) => false,
        Some((_, Some(false))) => true,
        // PID unknown or liveness unknowable: fall back to age.
        _ => is_stale_by_age(lock_path),
    };

    if !holder_dead {
        return report;
    }

    match std::fs::remove_file(lock_path) {
        Ok(()) => {
            report.removed_lock = true;
            report.action(format!("removed stale lock {}", lock_path.display()));
            tracing::warn!(
                lock = %lock_path.display(),
                pid = ?observed.pid,
                "removed stale writer lock"
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            // Lost the race to another recovering reader; that is success.
            report.removed_lock = true;
        }
        Err(err) => report.error(format!("failed to remove lock: {}", err)),
    }

    report
}

/// Full recovery pass for a failing database open.
///
/// Actions depend on the failure class; quarantine happens only for
/// corruption-class errors.
pub fn recover_database(db_path: &Path, error_message: &str) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let class = classify(error_message);
    if class == FailureClass::Unrelated {
        return report;
    }

    // Stale lock file next to the database.
    let lock_path = crate::process_lock::lock_path_for(db_path);
    if lock_path.exists() {
        let body = std::fs::read_to_string(&lock_path).unwrap_or_default();
        let observed = parse_lock_file(&body);
        let sub = recover_lock(&lock_path, &observed);
        report.removed_lock |= sub.removed_lock;
        report.actions.extend(sub.actions);
        report.errors.extend(sub.errors);
    }

    // WAL / SHM fragments.
    for suffix in ["-wal", "-shm"] {
        let mut os = db_path.as_os_str().to_owned();
        os.push(suffix);
        let fragment = PathBuf::from(os);
        if fragment.exists() {
            match std::fs::remove_file(&fragment) {
                Ok(()) => report.action(format!("removed journal fragment {}", fragment.display())),
                Err(err) => report.error(format!(
                    "failed to remove {}: {}",
                    fragment.display(),
                    err
                )),
            }
        }
    }

    // Stray lock directories left by other tooling under the same parent.
    if let Some(parent) = db_path.parent() {
        for entry in WalkDir::new(parent).max_depth(1).into_iter().flatten() {
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if path.is_dir() && name.ends_with(".lock") && is_stale_by_age(path) {
                match std::fs::remove_dir_all(path) {
                    Ok(()) => report.action(format!("removed stale lock dir {}", path.display())),
                    Err(err) => {
                        report.error(format!("failed to remove {}: {}", path.display(), err))
                    }
                }
            }
        }
    }

    // Quarantine only on corruption.
    if class == FailureClass::Corruption && db_path.exists() {
        let epoch = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut os = db_path.as_os_str().to_owned();
        os.push(format!(".corrupt.{}", epoch));
        let quarantine = PathBuf::from(os);
        match std::fs::rename(db_path, &quarantine) {
            Ok(()) => {
                report.action(format!("quarantined database to {}", quarantine.display()));
                tracing::warn!(
                    db = %db_path.display(),
                    quarantine = %quarantine.display(),
                    "quarantined corrupt database"
                );
            }
            Err(err) => report.error(format!("failed to quarantine database: {}", err)),
        }
    }

    report
}

/// Age-based staleness for locks whose holder is unknown.
fn is_stale_by_age(path: &Path) -> bool {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return false,
    };
    let age = meta
        .modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .unwrap_or(Duration::ZERO);

    let threshold = if meta.is_dir() {
        let empty = std::fs::read_dir(path)
            .map(|mut d| d.next().is_none())
            .unwrap_or(false);
        if empty {
            STALE_EMPTY_DIR_LOCK
        } else {
            STALE_DIR_LOCK
        }
    } else if path
        .extension()
        .map(|e| e == "lock")
        .unwrap_or_else(|| path.to_string_lossy().ends_with(".lock"))
    {
        STALE_FILE_LOCK
    } else {
        STALE_GENERIC
    };

    age >= threshold
}
