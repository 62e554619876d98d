/**
 * Embedding Store - Byte-Exact Float Vector Persistence
 *
 * DESIGN DECISION: Little-endian packed f32 BLOBs with validation at the write boundary
 * WHY: The vector index treats this table as the source of truth; a row's
 *      stored byte length must equal dim * 4, its norm-squared must exceed
 *      1e-10, and every component must be finite
 *
 * REASONING CHAIN:
 * 1. Producer corruption (empty, non-finite, zero-norm vectors) is rejected
 *    before persistence with provider_invalid_output
 * 2. Conflicting writes resolve last-writer-wins on generated_at; an older
 *    generation never clobbers a newer row
 * 3. Every accepted write marks the vector index dirty and deletes the
 *    serialized graph, forcing a rebuild on next search
 * 4. The integrity pass scrubs rows that predate validation; the dimension
 *    purge heals collections after an embedding-model change
 */

use crate::error::{Error, Result};
use crate::types::{
    EmbeddingMetadata, EmbeddingRecord, EmbeddingStat, EntityType, MultiVectorPayload,
    MultiVectorRecord,
};
use rayon::prelude::*;
use rusqlite::{params, OptionalExtension};

use super::KnowledgeStore;

/// Norm-squared below this is indistinguishable from a zero vector.
const MIN_NORM_SQUARED: f64 = 1e-10;

/// Result of an integrity scan over the embedding table.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingIntegrityReport {
    pub total: u64,
    pub invalid: u64,
    pub sample_ids: Vec<String>,
}

/// Pack a vector into its on-disk little-endian byte layout.
pub(crate) fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Unpack an on-disk BLOB; byte length must be a multiple of four.
pub(crate) fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Reject empty, non-finite, and zero-norm vectors.
fn validate_vector(vector: &[f32]) -> Result<()> {
    if vector.is_empty() {
        return Err(Error::ProviderInvalidOutput {
            reason: "empty".to_string(),
        });
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(Error::ProviderInvalidOutput {
            reason: "non_finite".to_string(),
        });
    }
    let norm_sq: f64 = vector.iter().map(|v| (*v as f64) * (*v as f64)).sum();
    if norm_sq <= MIN_NORM_SQUARED {
        return Err(Error::ProviderInvalidOutput {
            reason: "zero_norm".to_string(),
        });
    }
    Ok(())
}

fn is_row_valid(bytes: &[u8], dim: usize) -> bool {
    if bytes.len() != dim * 4 {
        return false;
    }
    match decode_vector(bytes) {
        Some(vector) => {
            !vector.is_empty()
                && vector.iter().all(|v| v.is_finite())
                && vector.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>() > MIN_NORM_SQUARED
        }
        None => false,
    }
}

/// Newer-generation check for last-writer-wins; unparseable legacy values
/// fall back to lexicographic comparison.
fn strictly_newer(incoming: &str, existing: &str) -> bool {
    let parse = |s: &str| {
        chrono::DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&chrono::Utc))
            .ok()
    };
    match (parse(incoming), parse(existing)) {
        (Some(a), Some(b)) => a > b,
        _ => incoming > existing,
    }
}

impl KnowledgeStore {
    /// Store an embedding. Returns false when an equal-or-newer row already
    /// exists (last-writer-wins on generated_at).
    pub fn set_embedding(
        &self,
        entity_id: &str,
        vector: &[f32],
        metadata: &EmbeddingMetadata,
    ) -> Result<bool> {
        if entity_id.is_empty() {
            return Err(Error::Validation("embedding entity_id cannot be empty".to_string()));
        }
        validate_vector(vector)?;

        let written = {
            let conn = self.lock_conn()?;
            let existing: Option<String> = conn
                .query_row(
                    "SELECT generated_at FROM embeddings WHERE entity_id = ?1",
                    params![entity_id],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing) = existing {
                if !strictly_newer(&metadata.generated_at, &existing) {
                    return Ok(false);
                }
            }

            conn.execute(
                "INSERT INTO embeddings (entity_id, entity_type, vector, dim, model_id, generated_at, token_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (entity_id) DO UPDATE SET
                    entity_type = excluded.entity_type,
                    vector = excluded.vector,
                    dim = excluded.dim,
                    model_id = excluded.model_id,
                    generated_at = excluded.generated_at,
                    token_count = excluded.token_count",
                params![
                    entity_id,
                    metadata.entity_type.as_str(),
                    encode_vector(vector),
                    vector.len() as i64,
                    metadata.model_id,
                    metadata.generated_at,
                    metadata.token_count as i64,
                ],
            )? > 0
        };

        if written {
            self.mark_vector_index_dirty()?;
        }
        Ok(written)
    }

    pub fn get_embedding(&self, entity_id: &str) -> Result<Option<EmbeddingRecord>> {
        let conn = self.lock_conn()?;
        let row: Option<(String, Vec<u8>, String, String, i64)> = conn
            .query_row(
                "SELECT entity_type, vector, model_id, generated_at, token_count
                 FROM embeddings WHERE entity_id = ?1",
                params![entity_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((entity_type, bytes, model_id, generated_at, token_count)) => {
                let vector = decode_vector(&bytes).ok_or_else(|| Error::StorageCorrupt {
                    message: format!("embedding blob for {} has ragged length", entity_id),
                })?;
                Ok(Some(EmbeddingRecord {
                    entity_id: entity_id.to_string(),
                    vector,
                    metadata: EmbeddingMetadata {
                        entity_type: EntityType::parse(&entity_type)
                            .unwrap_or(EntityType::Document),
                        model_id,
                        generated_at,
                        token_count: token_count as u32,
                    },
                }))
            }
        }
    }

    pub fn delete_embedding(&self, entity_id: &str) -> Result<bool> {
        let deleted = {
            let conn = self.lock_conn()?;
            conn.execute("DELETE FROM embeddings WHERE entity_id = ?1", params![entity_id])? > 0
        };
        if deleted {
            self.mark_vector_index_dirty()?;
        }
        Ok(deleted)
    }

    /// Per-(entity_type, dim) row counts; empty when the table is empty.
    pub fn embedding_stats(&self) -> Result<Vec<EmbeddingStat>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT entity_type, dim, COUNT(*) FROM embeddings
             GROUP BY entity_type, dim ORDER BY entity_type, dim",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(EmbeddingStat {
                    entity_type: row.get(0)?,
                    dim: row.get::<_, i64>(1)? as usize,
                    count: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Store a multi-vector record, last-writer-wins on generated_at.
    pub fn set_multi_vector(&self, record: &MultiVectorRecord) -> Result<bool> {
        validate_vector(&record.payload.summary)?;
        for sub in &record.payload.subvectors {
            validate_vector(&sub.vector)?;
        }

        let conn = self.lock_conn()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT generated_at FROM multi_vectors WHERE entity_id = ?1 AND entity_type = ?2",
                params![record.entity_id, record.entity_type.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = existing {
            if !strictly_newer(&record.generated_at, &existing) {
                return Ok(false);
            }
        }

        conn.execute(
            "INSERT INTO multi_vectors (entity_id, entity_type, payload, model_id, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (entity_id, entity_type) DO UPDATE SET
                payload = excluded.payload,
                model_id = excluded.model_id,
                generated_at = excluded.generated_at",
            params![
                record.entity_id,
                record.entity_type.as_str(),
                serde_json::to_string(&record.payload)?,
                record.model_id,
                record.generated_at,
            ],
        )?;
        Ok(true)
    }

    pub fn get_multi_vector(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<MultiVectorRecord>> {
        let conn = self.lock_conn()?;
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT payload, model_id, generated_at FROM multi_vectors
                 WHERE entity_id = ?1 AND entity_type = ?2",
                params![entity_id, entity_type.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((payload_raw, model_id, generated_at)) => {
                let payload: MultiVectorPayload = serde_json::from_str(&payload_raw)
                    .map_err(|e| Error::InvalidMultiVectorPayload {
                        message: e.to_string(),
                    })?;
                Ok(Some(MultiVectorRecord {
                    entity_id: entity_id.to_string(),
                    entity_type,
                    payload,
                    model_id,
                    generated_at,
                }))
            }
        }
    }

    /// Scan every embedding row, reporting invalid ones with a bounded sample.
    pub fn inspect_embedding_integrity(&self) -> Result<EmbeddingIntegrityReport> {
        let rows: Vec<(String, Vec<u8>, i64)> = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare("SELECT entity_id, vector, dim FROM embeddings")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let total = rows.len() as u64;
        let invalid_ids: Vec<String> = rows
            .par_iter()
            .filter(|(_, bytes, dim)| !is_row_valid(bytes, *dim as usize))
            .map(|(id, _, _)| id.clone())
            .collect();

        let mut sample_ids = invalid_ids.clone();
        sample_ids.sort();
        sample_ids.truncate(10);

        Ok(EmbeddingIntegrityReport {
            total,
            invalid: invalid_ids.len() as u64,
            sample_ids,
        })
    }

    /// Delete invalid embedding rows and their multi-vectors, transactionally.
    pub fn purge_invalid_embeddings(&self) -> Result<u64> {
        let report = self.inspect_embedding_integrity()?;
        if report.invalid == 0 {
            return Ok(0);
        }

        let invalid_ids: Vec<String> = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare("SELECT entity_id, vector, dim FROM embeddings")?;
            let rows: Vec<(String, Vec<u8>, i64)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<std::result::Result<_, _>>()?;
            rows.into_iter()
                .filter(|(_, bytes, dim)| !is_row_valid(bytes, *dim as usize))
                .map(|(id, _, _)| id)
                .collect()
        };

        let purged = {
            let mut conn = self.lock_conn()?;
            let tx = conn.transaction()?;
            let mut purged = 0u64;
            for id in &invalid_ids {
                purged += tx.execute("DELETE FROM embeddings WHERE entity_id = ?1", params![id])?
                    as u64;
                tx.execute("DELETE FROM multi_vectors WHERE entity_id = ?1", params![id])?;
            }
            tx.commit()?;
            purged
        };

        if purged > 0 {
            self.mark_vector_index_dirty()?;
            tracing::warn!(purged, "purged invalid embedding rows");
        }
        Ok(purged)
    }

    /// Delete every embedding whose byte length disagrees with the expected
    /// dimension, plus multi-vectors with wrong summary dimensions.
    pub fn clear_mismatched_embeddings(&self, expected_dim: usize) -> Result<u64> {
        let deleted = {
            let mut conn = self.lock_conn()?;
            let tx = conn.transaction()?;
            let deleted = clear_mismatched_conn(&tx, expected_dim)?;
            tx.commit()?;
            deleted
        };

        if deleted > 0 {
            self.mark_vector_index_dirty()?;
        }
        Ok(deleted)
    }

    /// Delete embeddings and multi-vectors for every function and module whose
    /// path matches; marks the vector index dirty.
    pub fn invalidate_embeddings(&self, file_path: &str) -> Result<u64> {
        let normalized = self.normalize(file_path);
        let deleted = {
            let mut conn = self.lock_conn()?;
            let tx = conn.transaction()?;

            let mut ids: Vec<String> = Vec::new();
            {
                let mut stmt = tx.prepare("SELECT id FROM functions WHERE file_path = ?1")?;
                ids.extend(
                    stmt.query_map(params![normalized], |row| row.get::<_, String>(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?,
                );
                let mut stmt = tx.prepare("SELECT id FROM modules WHERE path = ?1")?;
                ids.extend(
                    stmt.query_map(params![normalized], |row| row.get::<_, String>(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?,
                );
            }

            let mut deleted = 0u64;
            for id in &ids {
                deleted += tx.execute("DELETE FROM embeddings WHERE entity_id = ?1", params![id])?
                    as u64;
                tx.execute("DELETE FROM multi_vectors WHERE entity_id = ?1", params![id])?;
            }
            tx.commit()?;
            deleted
        };

        if deleted > 0 {
            self.mark_vector_index_dirty()?;
        }
        Ok(deleted)
    }

    pub(crate) fn mark_vector_index_dirty(&self) -> Result<()> {
        let mut index = self
            .vector_index
            .lock()
            .map_err(|_| Error::Database("vector index lock poisoned".to_string()))?;
        index.mark_dirty();
        Ok(())
    }
}

/// Connection-level mismatch purge shared by the store API and the vector
/// index self-healing path. A savepoint groups the deletes whether or not the
/// caller already holds a transaction.
pub(crate) fn clear_mismatched_conn(
    conn: &rusqlite::Connection,
    expected_dim: usize,
) -> Result<u64> {
    conn.execute_batch("SAVEPOINT clear_mismatched")?;
    let result = clear_mismatched_inner(conn, expected_dim);
    match &result {
        Ok(_) => conn.execute_batch("RELEASE clear_mismatched")?,
        Err(_) => {
            let _ = conn.execute_batch("ROLLBACK TO clear_mismatched; RELEASE clear_mismatched");
        }
    }
    result
}

fn clear_mismatched_inner(conn: &rusqlite::Connection, expected_dim: usize) -> Result<u64> {
    let mut deleted = conn.execute(
        "DELETE FROM embeddings WHERE dim != ?1 OR length(vector) != ?1 * 4",
        params![expected_dim as i64],
    )? as u64;

    // Multi-vectors whose summary dimension disagrees (or fails to parse).
    let mut stmt = conn.prepare("SELECT entity_id, entity_type, payload FROM multi_vectors")?;
    let rows: Vec<(String, String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<_, _>>()?;
    drop(stmt);

    for (entity_id, entity_type, payload_raw) in rows {
        let wrong = match serde_json::from_str::<MultiVectorPayload>(&payload_raw) {
            Ok(payload) => payload.summary.len() != expected_dim,
            Err(_) => true,
        };
        if wrong {
            deleted += conn.execute(
                "DELETE FROM multi_vectors WHERE entity_id = ?1 AND entity_type = ?2",
                params![entity_id, entity_type],
            )? as u64;
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use crate::types::NamedVector;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> KnowledgeStore {
        KnowledgeStore::open(StoreConfig::new(dir.path())).unwrap()
    }

    fn meta(generated_at: &str) -> EmbeddingMetadata {
        EmbeddingMetadata {
            entity_type: EntityType::Function,
            model_id: "test-model".to_string(),
            generated_at: generated_at.to_string(),
            token_count: 12,
        }
    }

    #[test]
    fn test_round_trip_is_byte_exact() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let vector: Vec<f32> = (0..64).map(|i| (i as f32 * 0.37).sin()).collect();
        assert!(store
            .set_embedding("f1", &vector, &meta("2026-01-01T00:00:00Z"))
            .unwrap());

        let loaded = store.get_embedding("f1").unwrap().unwrap();
        assert_eq!(loaded.vector, vector);
        assert_eq!(loaded.metadata.model_id, "test-model");
    }

    #[test]
    fn test_invalid_vectors_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let err = store
            .set_embedding("f1", &[], &meta("2026-01-01T00:00:00Z"))
            .unwrap_err();
        assert!(err.to_string().contains("embedding empty"));

        let err = store
            .set_embedding("f1", &[f32::NAN, 1.0], &meta("2026-01-01T00:00:00Z"))
            .unwrap_err();
        assert!(err.to_string().contains("non_finite"));

        let err = store
            .set_embedding("f1", &[0.0, 0.0, 0.0], &meta("2026-01-01T00:00:00Z"))
            .unwrap_err();
        assert!(err.to_string().contains("zero_norm"));

        // Nothing was inserted by the rejected writes.
        assert!(store.get_embedding("f1").unwrap().is_none());
    }

    #[test]
    fn test_last_writer_wins_on_generated_at() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        assert!(store
            .set_embedding("f1", &[1.0, 0.0], &meta("2026-01-02T00:00:00Z"))
            .unwrap());
        // Older generation loses.
        assert!(!store
            .set_embedding("f1", &[0.0, 1.0], &meta("2026-01-01T00:00:00Z"))
            .unwrap());
        let loaded = store.get_embedding("f1").unwrap().unwrap();
        assert_eq!(loaded.vector, vec![1.0, 0.0]);

        // Strictly newer wins.
        assert!(store
            .set_embedding("f1", &[0.0, 1.0], &meta("2026-01-03T00:00:00Z"))
            .unwrap());
        let loaded = store.get_embedding("f1").unwrap().unwrap();
        assert_eq!(loaded.vector, vec![0.0, 1.0]);
    }

    #[test]
    fn test_clear_mismatched_embeddings() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store
            .set_embedding("a", &[1.0; 128], &meta("2026-01-01T00:00:00Z"))
            .unwrap();
        store
            .set_embedding("b", &[1.0; 128], &meta("2026-01-01T00:00:00Z"))
            .unwrap();
        store
            .set_embedding("c", &[1.0; 384], &meta("2026-01-01T00:00:00Z"))
            .unwrap();

        let cleared = store.clear_mismatched_embeddings(384).unwrap();
        assert_eq!(cleared, 2);
        let stats = store.embedding_stats().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].dim, 384);
    }

    #[test]
    fn test_integrity_pass_purges_corrupt_rows() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store
            .set_embedding("good", &[1.0, 2.0], &meta("2026-01-01T00:00:00Z"))
            .unwrap();

        // Corrupt a row behind the validator's back.
        {
            let conn = store.lock_conn().unwrap();
            conn.execute(
                "INSERT INTO embeddings (entity_id, entity_type, vector, dim, model_id, generated_at, token_count)
                 VALUES ('bad', 'function', X'0000', 2, 'm', '2026-01-01T00:00:00Z', 0)",
                [],
            )
            .unwrap();
        }

        let report = store.inspect_embedding_integrity().unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.invalid, 1);
        assert_eq!(report.sample_ids, vec!["bad".to_string()]);

        assert_eq!(store.purge_invalid_embeddings().unwrap(), 1);
        let report = store.inspect_embedding_integrity().unwrap();
        assert_eq!(report.invalid, 0);
    }

    #[test]
    fn test_multi_vector_round_trip_and_corruption() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let record = MultiVectorRecord {
            entity_id: "f1".to_string(),
            entity_type: EntityType::Function,
            payload: MultiVectorPayload {
                summary: vec![1.0, 0.5],
                subvectors: vec![NamedVector {
                    label: "signature".to_string(),
                    vector: vec![0.3, 0.7],
                }],
            },
            model_id: "test-model".to_string(),
            generated_at: "2026-01-01T00:00:00Z".to_string(),
        };
        assert!(store.set_multi_vector(&record).unwrap());

        let loaded = store
            .get_multi_vector("f1", EntityType::Function)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.payload.summary, vec![1.0, 0.5]);

        // Corrupt the payload and confirm the taxonomy error.
        {
            let conn = store.lock_conn().unwrap();
            conn.execute(
                "UPDATE multi_vectors SET payload = 'not json' WHERE entity_id = 'f1'",
                [],
            )
            .unwrap();
        }
        let err = store
            .get_multi_vector("f1", EntityType::Function)
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("unverified_by_trace(storage_corrupt: invalid multi-vector payload"));
    }
}
