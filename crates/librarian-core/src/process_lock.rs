/**
 * Process Lock - Exclusive Single-Writer Lock File
 *
 * DESIGN DECISION: Atomic create-new lock file with PID + token + content hash
 * WHY: Only one process may open the store for writing; a second opener with a
 *      live-PID lock must fail fast rather than corrupt the database
 *
 * REASONING CHAIN:
 * 1. Lock file is JSON: {pid, startedAt, processStartedAt, token, contentHash}
 * 2. contentHash = sha256 of the canonical serialization of the other four
 *    fields in exactly that key order; a mismatched hash marks the state as
 *    observed but not authoritative
 * 3. Acquire: O_EXCL create; on EEXIST parse the holder, check PID liveness,
 *    invoke recovery for dead holders, poll every 200ms up to a 5s deadline
 * 4. Release: unlink only when pid, startedAt, and token all match the handle;
 *    a fresh lock from another process is never deleted
 * 5. Readers tolerate legacy plain-integer-PID files
 */

use crate::canonical::sha256_hex;
use crate::error::{Error, Result};
use crate::recovery::{self, RecoveryReport};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Poll interval while waiting on a contended lock.
const ACQUIRE_POLL: Duration = Duration::from_millis(200);
/// Total acquisition deadline.
const ACQUIRE_DEADLINE: Duration = Duration::from_secs(5);

/// On-disk lock state. Field order here matches the canonical hash order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockState {
    pub pid: u32,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "processStartedAt")]
    pub process_started_at: String,
    pub token: String,
    #[serde(rename = "contentHash")]
    pub content_hash: String,
}

impl LockState {
    fn new(pid: u32, started_at: String, process_started_at: String, token: String) -> Self {
        let content_hash = Self::hash_fields(pid, &started_at, &process_started_at, &token);
        Self {
            pid,
            started_at,
            process_started_at,
            token,
            content_hash,
        }
    }

    /// Canonical serialization of the core fields, in exactly this key order.
    fn hash_fields(pid: u32, started_at: &str, process_started_at: &str, token: &str) -> String {
        let canonical = format!(
            "{{\"pid\":{},\"startedAt\":{},\"processStartedAt\":{},\"token\":{}}}",
            pid,
            serde_json::to_string(started_at).unwrap_or_default(),
            serde_json::to_string(process_started_at).unwrap_or_default(),
            serde_json::to_string(token).unwrap_or_default(),
        );
        sha256_hex(&canonical)
    }

    /// True when the stored hash covers the stored fields.
    pub fn hash_valid(&self) -> bool {
        self.content_hash
            == Self::hash_fields(self.pid, &self.started_at, &self.process_started_at, &self.token)
    }
}

/// Parsed view of whatever is in the lock file right now.
#[derive(Debug, Clone)]
pub struct ObservedLock {
    pub pid: Option<u32>,
    pub started_at: Option<String>,
    /// False for legacy files and hash-mismatched JSON.
    pub authoritative: bool,
}

/// Parse a lock file body, tolerating legacy plain-integer-PID files.
pub fn parse_lock_file(body: &str) -> ObservedLock {
    if let Ok(state) = serde_json::from_str::<LockState>(body) {
        let authoritative = state.hash_valid();
        return ObservedLock {
            pid: Some(state.pid),
            started_at: Some(state.started_at),
            authoritative,
        };
    }
    if let Ok(pid) = body.trim().parse::<u32>() {
        return ObservedLock {
            pid: Some(pid),
            started_at: None,
            authoritative: false,
        };
    }
    ObservedLock {
        pid: None,
        started_at: None,
        authoritative: false,
    }
}

/// PID liveness check.
///
/// Linux reads /proc; where /proc is unavailable the answer is unknown and the
/// caller falls back to age-based staleness (recovery thresholds).
pub fn pid_alive(pid: u32) -> Option<bool> {
    let proc_root = Path::new("/proc");
    if proc_root.is_dir() {
        return Some(proc_root.join(pid.to_string()).exists());
    }
    None
}

/**
 * Held lock handle. Releases on drop.
 *
 * DESIGN DECISION: scoped resource acquisition, not an ambient global
 * WHY: the lifecycle (acquire -> init schema -> release) is enforced by
 *      ownership; dropping the store handle releases the lock
 */
#[derive(Debug)]
pub struct ProcessLockHandle {
    path: PathBuf,
    state: LockState,
    released: bool,
}

impl ProcessLockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token(&self) -> &str {
        &self.state.token
    }

    /// Release the lock if this handle still owns it. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let current = match std::fs::read_to_string(&self.path) {
            Ok(body) => body,
            Err(_) => return,
        };
        if let Ok(on_disk) = serde_json::from_str::<LockState>(&current) {
            let ours = on_disk.pid == self.state.pid
                && on_disk.started_at == self.state.started_at
                && on_disk.token == self.state.token;
            if !ours {
                // Another process already owns a fresh lock; leave it alone.
                return;
            }
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for ProcessLockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquire the exclusive writer lock for `db_path`.
///
/// Recovery runs when the observed holder is dead; the caller's database path
/// scopes which WAL fragments recovery may touch.
pub fn acquire(db_path: &Path) -> Result<ProcessLockHandle> {
    let lock_path = lock_path_for(db_path);
    let deadline = Instant::now() + ACQUIRE_DEADLINE;
    let process_started_at = process_start_time();

    loop {
        match try_create(&lock_path, &process_started_at) {
            Ok(handle) => return Ok(handle),
            Err(CreateOutcome::Contended) => {
                let body = std::fs::read_to_string(&lock_path).unwrap_or_default();
                let observed = parse_lock_file(&body);

                match observed.pid.and_then(pid_alive) {
                    Some(true) => {
                        let pid = observed.pid.unwrap_or(0);
                        let since = observed.started_at.unwrap_or_else(|| "unknown".to_string());
                        return Err(Error::StorageLocked {
                            reason: format!("indexing_in_progress pid={} started={}", pid, since),
                        });
                    }
                    _ => {
                        // Holder dead or unknown: let recovery decide.
                        let report: RecoveryReport = recovery::recover_lock(&lock_path, &observed);
                        if report.removed_lock {
                            continue;
                        }
                    }
                }

                if Instant::now() >= deadline {
                    return Err(Error::LockAcquisitionTimedOut {
                        waited_ms: ACQUIRE_DEADLINE.as_millis() as u64,
                    });
                }
                std::thread::sleep(ACQUIRE_POLL);
            }
            Err(CreateOutcome::Failed(message)) => {
                return Err(Error::StorageLocked {
                    reason: format!("lock_write_failed {}", message),
                });
            }
        }
    }
}

/// Lock file path: `<db>.lock`.
pub fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

enum CreateOutcome {
    Contended,
    Failed(String),
}

fn try_create(
    lock_path: &Path,
    process_started_at: &str,
) -> std::result::Result<ProcessLockHandle, CreateOutcome> {
    let state = LockState::new(
        std::process::id(),
        chrono::Utc::now().to_rfc3339(),
        process_started_at.to_string(),
        uuid::Uuid::new_v4().to_string(),
    );
    let body = serde_json::to_string(&state).map_err(|e| CreateOutcome::Failed(e.to_string()))?;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    match options.open(lock_path) {
        Ok(mut file) => {
            file.write_all(body.as_bytes())
                .and_then(|_| file.sync_all())
                .map_err(|e| CreateOutcome::Failed(e.to_string()))?;
            Ok(ProcessLockHandle {
                path: lock_path.to_path_buf(),
                state,
                released: false,
            })
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(CreateOutcome::Contended),
        Err(err) => Err(CreateOutcome::Failed(err.to_string())),
    }
}

/// Best-effort process start time; falls back to "now" when /proc is absent.
fn process_start_time() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(meta) = std::fs::metadata(format!("/proc/{}", std::process::id())) {
            if let Ok(modified) = meta.modified() {
                let dt: chrono::DateTime<chrono::Utc> = modified.into();
                return dt.to_rfc3339();
            }
        }
    }
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("knowledge.db");
        let lock_path = lock_path_for(&db);

        let mut handle = acquire(&db).unwrap();
        assert!(lock_path.exists());

        let body = std::fs::read_to_string(&lock_path).unwrap();
        let state: LockState = serde_json::from_str(&body).unwrap();
        assert_eq!(state.pid, std::process::id());
        assert!(state.hash_valid());

        handle.release();
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("knowledge.db");

        let _handle = acquire(&db).unwrap();
        let second = acquire(&db);
        match second {
            Err(Error::StorageLocked { reason }) => {
                assert!(reason.starts_with("indexing_in_progress"), "reason: {}", reason);
            }
            other => panic!("expected StorageLocked, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_dead_pid_lock_is_recovered() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("knowledge.db");
        let lock_path = lock_path_for(&db);

        // A PID far above pid_max never maps to a live process.
        let stale = LockState::new(
            u32::MAX - 1,
            chrono::Utc::now().to_rfc3339(),
            chrono::Utc::now().to_rfc3339(),
            uuid::Uuid::new_v4().to_string(),
        );
        std::fs::write(&lock_path, serde_json::to_string(&stale).unwrap()).unwrap();

        let handle = acquire(&db).unwrap();
        assert_eq!(handle.path(), lock_path.as_path());
    }

    #[test]
    fn test_legacy_integer_pid_file_parses() {
        let observed = parse_lock_file("12345\n");
        assert_eq!(observed.pid, Some(12345));
        assert!(!observed.authoritative);
    }

    #[test]
    fn test_tampered_hash_not_authoritative() {
        let mut state = LockState::new(
            42,
            chrono::Utc::now().to_rfc3339(),
            chrono::Utc::now().to_rfc3339(),
            uuid::Uuid::new_v4().to_string(),
        );
        state.content_hash = "0".repeat(64);
        let observed = parse_lock_file(&serde_json::to_string(&state).unwrap());
        assert_eq!(observed.pid, Some(42));
        assert!(!observed.authoritative);
    }

    #[test]
    fn test_release_leaves_foreign_lock_alone() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("knowledge.db");
        let lock_path = lock_path_for(&db);

        let mut handle = acquire(&db).unwrap();

        // Simulate another process replacing the lock after ours vanished.
        let foreign = LockState::new(
            std::process::id(),
            chrono::Utc::now().to_rfc3339(),
            chrono::Utc::now().to_rfc3339(),
            uuid::Uuid::new_v4().to_string(),
        );
        std::fs::write(&lock_path, serde_json::to_string(&foreign).unwrap()).unwrap();

        handle.release();
        assert!(lock_path.exists(), "foreign lock must survive release");
    }
}
