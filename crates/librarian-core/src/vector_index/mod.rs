/**
 * Vector Index - HNSW Integration Over the Embedding Store
 *
 * DESIGN DECISION: The embedding table is the source of truth; the graph is a cache
 * WHY: Every degradation has a recovery path: a missing, stale, or corrupt
 *      graph rebuilds from embeddings; a dimension-mismatched collection
 *      either self-heals or rejects, and the caller always learns which
 *
 * REASONING CHAIN:
 * 1. Mode off|on|auto; auto switches on at the collection-size threshold and
 *    stays on (sticky) so behavior does not flap around the boundary
 * 2. Search counts rows per dimension first: an all-mismatched collection
 *    self-heals (purge + empty result + degraded reason) when auto-recovery
 *    is enabled, otherwise rejects with embedding_dimension_mismatch
 * 3. Path-scoped filters push down to SQL, so they take the brute-force path;
 *    entity-type filters ride the graph
 * 4. The serialized graph is ignored when older than the database and deleted
 *    on any read failure; writes mark the index dirty and delete the file
 * 5. Rebuilds are gated by the resource policy; a machine under memory
 *    pressure serves brute-force results instead of building graphs
 */

pub mod hnsw;

use crate::canonical::path_has_prefix;
use crate::error::{Error, Result};
use crate::resource_policy::{MemoryPressure, ResourceMonitor};
use crate::store::embeddings::{clear_mismatched_conn, decode_vector};
use crate::types::{DegradedReason, SimilarityHit, SimilarityOutcome, SimilarityQuery};
use self::hnsw::{cosine_similarity, HnswConfig, HnswIndex};
use rayon::prelude::*;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Index activation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HnswMode {
    Off,
    On,
    Auto,
}

/// Configuration owned by the vector index.
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    pub mode: HnswMode,
    pub auto_threshold: usize,
    pub hnsw: HnswConfig,
    pub auto_recover_dimension_mismatch: bool,
    pub graph_path: PathBuf,
}

/// HNSW-backed similarity search with brute-force fallback.
pub struct VectorIndex {
    config: VectorIndexConfig,
    hnsw: Option<HnswIndex>,
    dirty: bool,
    /// Sticky auto-mode activation.
    activated: bool,
}

impl VectorIndex {
    /// Load the index, honoring the serialized graph only when it is at least
    /// as fresh as the database.
    pub fn load(config: VectorIndexConfig, db_path: &Path) -> Self {
        let mut index = Self {
            hnsw: None,
            dirty: false,
            activated: false,
            config,
        };
        if index.config.mode == HnswMode::Off {
            return index;
        }

        let graph_path = index.config.graph_path.clone();
        let graph_meta = match std::fs::metadata(&graph_path) {
            Ok(meta) => meta,
            Err(_) => return index,
        };

        let stale = match (
            graph_meta.modified(),
            std::fs::metadata(db_path).and_then(|m| m.modified()),
        ) {
            (Ok(graph_time), Ok(db_time)) => graph_time < db_time,
            _ => true,
        };
        if stale {
            tracing::info!(
                graph = %graph_path.display(),
                "serialized vector graph older than database; scheduling rebuild"
            );
            let _ = std::fs::remove_file(&graph_path);
            return index;
        }

        match std::fs::read(&graph_path)
            .map_err(|e| Error::Io(e.to_string()))
            .and_then(|bytes| HnswIndex::deserialize(&bytes))
        {
            Ok(graph) => {
                index.activated = true;
                index.hnsw = Some(graph);
            }
            Err(err) => {
                tracing::warn!(error = %err, "rejecting serialized vector graph; will rebuild");
                let _ = std::fs::remove_file(&graph_path);
            }
        }
        index
    }

    /// Invalidate the in-memory graph and delete the on-disk copy.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        let _ = std::fs::remove_file(&self.config.graph_path);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn hnsw_enabled(&mut self, total_rows: u64) -> bool {
        match self.config.mode {
            HnswMode::Off => false,
            HnswMode::On => true,
            HnswMode::Auto => {
                if total_rows as usize >= self.config.auto_threshold {
                    self.activated = true;
                }
                self.activated
            }
        }
    }

    /// Rebuild the graph from the embedding store. Skipped under critical
    /// memory pressure; the caller serves brute-force results instead.
    fn rebuild(&mut self, conn: &Connection) -> Result<bool> {
        let pressure = ResourceMonitor::new().sample().pressure();
        if matches!(pressure, MemoryPressure::Critical | MemoryPressure::OomImminent) {
            tracing::warn!(?pressure, "deferring vector graph rebuild under memory pressure");
            return Ok(false);
        }

        let mut stmt = conn.prepare("SELECT entity_id, entity_type, vector FROM embeddings")?;
        let rows: Vec<(String, String, Vec<u8>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let mut graph = HnswIndex::new(self.config.hnsw);
        for (entity_id, entity_type, bytes) in rows {
            if let Some(vector) = decode_vector(&bytes) {
                graph.insert(&entity_id, vector, &entity_type);
            }
        }
        tracing::info!(nodes = graph.len(), "vector graph rebuilt from embeddings");
        self.hnsw = Some(graph);
        self.dirty = false;
        Ok(true)
    }

    /// Write the serialized graph next to the database, replaced atomically
    /// by rename so concurrent readers never see a torn file.
    pub fn persist(&mut self, conn: &Connection) -> Result<()> {
        if self.config.mode == HnswMode::Off {
            return Ok(());
        }
        if !(self.config.mode == HnswMode::On || self.activated) {
            return Ok(());
        }
        if self.dirty && !self.rebuild(conn)? {
            return Ok(());
        }
        if let Some(graph) = &self.hnsw {
            let tmp = self.config.graph_path.with_extension("bin.tmp");
            std::fs::write(&tmp, graph.serialize())
                .map_err(|e| Error::Io(format!("failed to write vector graph: {}", e)))?;
            std::fs::rename(&tmp, &self.config.graph_path)
                .map_err(|e| Error::Io(format!("failed to replace vector graph: {}", e)))?;
        }
        Ok(())
    }

    /// Similarity search with explicit degradation reporting.
    pub fn search(
        &mut self,
        conn: &Connection,
        workspace_root: &Path,
        query: &[f32],
        options: &SimilarityQuery,
    ) -> Result<SimilarityOutcome> {
        if query.is_empty() {
            return Err(Error::Validation("query vector cannot be empty".to_string()));
        }

        // Dimension census before anything touches the graph.
        let mut stmt = conn.prepare("SELECT dim, COUNT(*) FROM embeddings GROUP BY dim")?;
        let dim_counts: Vec<(usize, u64)> = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let total: u64 = dim_counts.iter().map(|(_, n)| n).sum();
        let matching: u64 = dim_counts
            .iter()
            .filter(|(dim, _)| *dim == query.len())
            .map(|(_, n)| n)
            .sum();

        if total == 0 {
            let reason = if self.hnsw.is_none() {
                DegradedReason::VectorIndexNull
            } else {
                DegradedReason::VectorIndexEmpty
            };
            return Ok(SimilarityOutcome::empty(reason));
        }

        if matching == 0 {
            if self.config.auto_recover_dimension_mismatch {
                let cleared = clear_mismatched_conn(conn, query.len())?;
                self.mark_dirty();
                tracing::warn!(
                    cleared,
                    expected_dim = query.len(),
                    "auto-recovered embedding dimension mismatch"
                );
                let mut outcome =
                    SimilarityOutcome::empty(DegradedReason::AutoRecoveredDimensionMismatch);
                outcome.cleared_mismatched_count = Some(cleared);
                return Ok(outcome);
            }
            let stored = dim_counts.first().map(|(dim, _)| *dim).unwrap_or(0);
            return Err(Error::EmbeddingDimensionMismatch {
                expected: query.len(),
                stored,
            });
        }

        let partial_mismatch = matching < total;
        let hnsw_wanted = self.hnsw_enabled(total) && options.path_prefix.is_none();

        let allowed_types: Option<HashSet<String>> = options.entity_types.as_ref().map(|types| {
            types
                .iter()
                .map(|t| t.as_str().to_string())
                .collect::<HashSet<String>>()
        });

        let mut used_hnsw = false;
        let mut hits: Vec<SimilarityHit> = if hnsw_wanted {
            let ready = if self.dirty || self.hnsw.is_none() {
                self.rebuild(conn)?
            } else {
                true
            };
            let graph_matches_dim = self
                .hnsw
                .as_ref()
                .map(|g| g.dimensions().contains(&query.len()))
                .unwrap_or(false);
            if ready && graph_matches_dim {
                used_hnsw = true;
                self.hnsw
                    .as_ref()
                    .map(|g| {
                        g.search(
                            query,
                            options.limit,
                            options.ef,
                            allowed_types.as_ref(),
                            options.min_similarity,
                        )
                    })
                    .unwrap_or_default()
            } else {
                brute_force_search(conn, query, options, allowed_types.as_ref())?
            }
        } else {
            brute_force_search(conn, query, options, allowed_types.as_ref())?
        };

        // Path-scoped restriction (SQL pushdown territory).
        if let Some(prefix) = &options.path_prefix {
            hits.retain(|hit| {
                match resolve_entity_path(conn, &hit.entity_id, &hit.entity_type) {
                    Ok(Some(path)) => path_has_prefix(workspace_root, &path, prefix),
                    // Entities without a path cannot match a path filter.
                    _ => false,
                }
            });
        }

        // File-size ceiling: stat failures and unknown paths retain the hit.
        if let Some(max_size) = options.max_file_size {
            hits.retain(|hit| {
                match resolve_entity_path(conn, &hit.entity_id, &hit.entity_type) {
                    Ok(Some(path)) => {
                        let absolute = workspace_root.join(&path);
                        match std::fs::metadata(absolute) {
                            Ok(meta) => meta.len() <= max_size,
                            Err(_) => true,
                        }
                    }
                    _ => true,
                }
            });
        }

        hits.truncate(options.limit);

        let degraded_reason = if partial_mismatch {
            Some(DegradedReason::DimensionMismatch)
        } else if hnsw_wanted && !used_hnsw {
            Some(DegradedReason::BruteForceFallback)
        } else {
            None
        };

        Ok(SimilarityOutcome {
            results: hits,
            degraded: degraded_reason.is_some(),
            degraded_reason,
            cleared_mismatched_count: None,
        })
    }
}

/// Exhaustive cosine scoring over dimension-matched rows; rayon-parallel.
fn brute_force_search(
    conn: &Connection,
    query: &[f32],
    options: &SimilarityQuery,
    allowed_types: Option<&HashSet<String>>,
) -> Result<Vec<SimilarityHit>> {
    let mut stmt = conn
        .prepare("SELECT entity_id, entity_type, vector FROM embeddings WHERE dim = ?1")?;
    let rows: Vec<(String, String, Vec<u8>)> = stmt
        .query_map(params![query.len() as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<std::result::Result<_, _>>()?;
    drop(stmt);

    let mut hits: Vec<SimilarityHit> = rows
        .par_iter()
        .filter_map(|(entity_id, entity_type, bytes)| {
            if let Some(allowed) = allowed_types {
                if !allowed.contains(entity_type) {
                    return None;
                }
            }
            let vector = decode_vector(bytes)?;
            let similarity = cosine_similarity(query, &vector);
            if similarity < options.min_similarity {
                return None;
            }
            Some(SimilarityHit {
                entity_id: entity_id.clone(),
                entity_type: entity_type.clone(),
                similarity,
            })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    hits.truncate(options.limit.max(1) * 4); // headroom for post-filters
    Ok(hits)
}

/// Source path for an entity, when it has one.
fn resolve_entity_path(
    conn: &Connection,
    entity_id: &str,
    entity_type: &str,
) -> Result<Option<String>> {
    let path: Option<String> = match entity_type {
        "function" => conn
            .query_row(
                "SELECT file_path FROM functions WHERE id = ?1",
                params![entity_id],
                |row| row.get(0),
            )
            .optional()?,
        "module" => conn
            .query_row(
                "SELECT path FROM modules WHERE id = ?1",
                params![entity_id],
                |row| row.get(0),
            )
            .optional()?,
        _ => None,
    };
    Ok(path)
}

impl crate::store::KnowledgeStore {
    /// Top-k similarity search over stored embeddings. Degradations are
    /// explicit in the outcome; dimension-mismatch healing obeys the
    /// auto-recovery config.
    pub fn find_similar_by_embedding(
        &self,
        query: &[f32],
        options: &SimilarityQuery,
    ) -> Result<SimilarityOutcome> {
        let mut index = self
            .vector_index
            .lock()
            .map_err(|_| Error::Database("vector index lock poisoned".to_string()))?;
        let conn = self.lock_conn()?;
        index.search(&conn, self.workspace_root(), query, options)
    }

    /// Force a synchronous vector graph rebuild (maintenance surface).
    pub fn rebuild_vector_index(&self) -> Result<bool> {
        let mut index = self
            .vector_index
            .lock()
            .map_err(|_| Error::Database("vector index lock poisoned".to_string()))?;
        let conn = self.lock_conn()?;
        index.rebuild(&conn)
    }

    /// Persist the serialized graph now instead of waiting for drop.
    pub fn persist_vector_index(&self) -> Result<()> {
        let mut index = self
            .vector_index
            .lock()
            .map_err(|_| Error::Database("vector index lock poisoned".to_string()))?;
        let conn = self.lock_conn()?;
        index.persist(&conn)
    }

    pub fn set_embedding_batch(
        &self,
        batch: &[(String, Vec<f32>, crate::types::EmbeddingMetadata)],
    ) -> Result<u64> {
        let mut written = 0u64;
        for (entity_id, vector, metadata) in batch {
            if self.set_embedding(entity_id, vector, metadata)? {
                written += 1;
            }
        }
        Ok(written)
    }
}
