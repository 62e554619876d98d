/**
 * Error Handling Module
 *
 * DESIGN DECISION: Centralized error enum using thiserror, machine-filterable display strings
 * WHY: Library code must never panic; every boundary error renders with the
 *      `unverified_by_trace(...)` prefix so callers can filter mechanically
 *
 * REASONING CHAIN:
 * 1. The store is embedded; errors cross into host code, not across a wire
 * 2. thiserror provides ergonomic derive macros without boilerplate
 * 3. Deterministic Display strings let downstream layers pattern-match failures
 * 4. From conversions enable ? propagation from rusqlite/serde_json/io
 * 5. Recoverable kinds (lock contention, dimension mismatch) carry enough
 *    context for the caller to decide between retry, heal, and surface
 */

use thiserror::Error;

/// Primary error type for the knowledge store engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /**
     * Lock contention and corruption
     *
     * DESIGN DECISION: one variant per lock outcome, reason embedded in the display string
     * WHY: The store refuses to open unless the lock is held; callers need the reason verbatim
     */

    /// Another live process holds the write lock, or the lock file is unusable.
    #[error("unverified_by_trace(storage_locked:{reason})")]
    StorageLocked { reason: String },

    /// Lock acquisition exhausted its deadline.
    #[error("unverified_by_trace(storage_locked:lock_acquisition_timed_out after {waited_ms}ms)")]
    LockAcquisitionTimedOut { waited_ms: u64 },

    /// Database file quarantined or otherwise unusable.
    #[error("unverified_by_trace(storage_corrupt: {message})")]
    StorageCorrupt { message: String },

    /**
     * Input validation
     *
     * DESIGN DECISION: reject eagerly, never mutate state on a validation failure
     * WHY: Dynamic identifiers in constructed SQL are an injection surface;
     *      everything passes a closed allowlist first
     */

    /// ORDER BY column not in the allowlist for the target table.
    #[error("unverified_by_trace(invalid_order_column: {0})")]
    InvalidOrderColumn(String),

    /// ORDER BY direction other than ASC/DESC.
    #[error("unverified_by_trace(invalid_order_direction: {0})")]
    InvalidOrderDirection(String),

    /// Table name not in the schema allowlist.
    #[error("unverified_by_trace(invalid_table_name: {0})")]
    InvalidTableName(String),

    /// Structural validation failure (empty id, bad range, oversized field).
    #[error("validation error: {0}")]
    Validation(String),

    /**
     * Producer corruption
     */

    /// Embedding vector rejected before persistence: empty | non_finite | zero_norm.
    #[error("unverified_by_trace(provider_invalid_output: embedding {reason})")]
    ProviderInvalidOutput { reason: String },

    /// Multi-vector payload failed to parse.
    #[error("unverified_by_trace(storage_corrupt: invalid multi-vector payload ({message}))")]
    InvalidMultiVectorPayload { message: String },

    /// Stored embedding dimensions do not match the query and self-healing is disabled.
    #[error("unverified_by_trace(embedding_dimension_mismatch: expected {expected}, stored {stored})")]
    EmbeddingDimensionMismatch { expected: usize, stored: usize },

    /// Serialized HNSW graph rejected: magic mismatch | unsupported version | out_of_bounds.
    #[error("unverified_by_trace(invalid_hnsw_payload: {message})")]
    InvalidHnswPayload { message: String },

    /**
     * Transaction coordination
     */

    /// Optimistic coordination-version bump lost the race; caller may retry.
    #[error("transaction conflict: coordination version moved past {expected}")]
    TransactionConflict { expected: u64 },

    /**
     * Fatal initialization failures
     */

    /// A migration step failed; the store refuses to open.
    #[error("migration {version} failed: {message}")]
    MigrationFailed { version: u32, message: String },

    /**
     * I/O and serialization
     */

    /// Generic I/O error with operation context.
    #[error("I/O error: {0}")]
    Io(String),

    /// SQLite error with statement context.
    #[error("database error: {0}")]
    Database(String),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for knowledge store operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_errors_carry_trace_prefix() {
        let err = Error::StorageLocked {
            reason: "indexing_in_progress pid=4242".to_string(),
        };
        assert!(err.to_string().starts_with("unverified_by_trace(storage_locked:"));

        let err = Error::ProviderInvalidOutput {
            reason: "zero_norm".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unverified_by_trace(provider_invalid_output: embedding zero_norm)"
        );

        let err = Error::InvalidHnswPayload {
            message: "magic mismatch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unverified_by_trace(invalid_hnsw_payload: magic mismatch)"
        );
    }

    #[test]
    fn test_identifier_rejections() {
        let err = Error::InvalidOrderColumn("confidence; DROP TABLE".to_string());
        assert!(err.to_string().contains("invalid_order_column"));

        let err = Error::InvalidTableName("sqlite_master".to_string());
        assert!(err.to_string().contains("invalid_table_name"));
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json");
        let err: Error = json_err.unwrap_err().into();
        match err {
            Error::Serialization(_) => {}
            other => panic!("expected Serialization, got {:?}", other),
        }

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        match err {
            Error::Io(msg) => assert!(msg.contains("missing")),
            other => panic!("expected Io, got {:?}", other),
        }
    }
}
