/**
 * Query Cache & Access Log
 *
 * Cache rows are keyed by content hash of the query; reads promote
 * last_accessed and access_count. Pruning drops age-expired rows first, then
 * the oldest by last_accessed until the size cap holds. The access log feeds
 * exploration scoring: high-centrality entities that nobody queries are the
 * ones worth surfacing.
 */

use crate::error::{Error, Result};
use crate::types::{CachePruneOptions, CachedQuery, ExplorationSuggestion};
use rusqlite::{params, OptionalExtension};

use super::{now_iso, KnowledgeStore};

impl KnowledgeStore {
    /// Store a response under its query hash.
    pub fn cache_put(&self, query_hash: &str, query_params: &str, response: &str) -> Result<()> {
        if query_hash.is_empty() {
            return Err(Error::Validation("query_hash cannot be empty".to_string()));
        }
        let conn = self.lock_conn()?;
        let now = now_iso();
        conn.execute(
            "INSERT INTO query_cache (query_hash, query_params, response, created_at, last_accessed, access_count)
             VALUES (?1, ?2, ?3, ?4, ?4, 0)
             ON CONFLICT (query_hash) DO UPDATE SET
                query_params = excluded.query_params,
                response = excluded.response,
                last_accessed = excluded.last_accessed",
            params![query_hash, query_params, response, now],
        )?;
        Ok(())
    }

    /// Fetch and promote a cached response.
    pub fn cache_get(&self, query_hash: &str) -> Result<Option<CachedQuery>> {
        let conn = self.lock_conn()?;
        let row: Option<CachedQuery> = conn
            .query_row(
                "SELECT query_hash, query_params, response, created_at, last_accessed, access_count
                 FROM query_cache WHERE query_hash = ?1",
                params![query_hash],
                |row| {
                    Ok(CachedQuery {
                        query_hash: row.get(0)?,
                        query_params: row.get(1)?,
                        response: row.get(2)?,
                        created_at: row.get(3)?,
                        last_accessed: row.get(4)?,
                        access_count: row.get::<_, i64>(5)? as u64,
                    })
                },
            )
            .optional()?;

        if row.is_some() {
            conn.execute(
                "UPDATE query_cache SET last_accessed = ?1, access_count = access_count + 1
                 WHERE query_hash = ?2",
                params![now_iso(), query_hash],
            )?;
        }
        Ok(row)
    }

    /// Drop expired rows, then the oldest by last_accessed beyond the size
    /// cap. Returns total removed.
    pub fn prune_query_cache(&self, options: CachePruneOptions) -> Result<u64> {
        let conn = self.lock_conn()?;
        let mut removed = 0u64;

        if let Some(max_age_ms) = options.max_age_ms {
            let cutoff = chrono::Utc::now()
                - chrono::Duration::milliseconds(max_age_ms.min(i64::MAX as u64) as i64);
            removed += conn.execute(
                "DELETE FROM query_cache WHERE created_at < ?1",
                params![cutoff.to_rfc3339()],
            )? as u64;
        }

        if let Some(max_entries) = options.max_entries {
            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM query_cache", [], |r| r.get(0))?;
            let excess = (total as u64).saturating_sub(max_entries);
            if excess > 0 {
                removed += conn.execute(
                    "DELETE FROM query_cache WHERE query_hash IN (
                        SELECT query_hash FROM query_cache
                        ORDER BY last_accessed ASC LIMIT ?1
                     )",
                    params![excess as i64],
                )? as u64;
            }
        }
        Ok(removed)
    }

    /// Purge cache rows whose key or params reference the path, and invalidate
    /// matching context packs. Returns (cache rows purged, packs invalidated).
    pub fn invalidate_cache(&self, file_path: &str) -> Result<(u64, u64)> {
        let normalized = self.normalize(file_path);
        let purged = {
            let conn = self.lock_conn()?;
            conn.execute(
                "DELETE FROM query_cache WHERE query_params LIKE '%' || ?1 || '%'
                    OR query_hash LIKE '%' || ?1 || '%'",
                params![normalized],
            )? as u64
        };
        let invalidated = self.invalidate_context_packs(&normalized)?;
        Ok((purged, invalidated))
    }

    /// Record query traffic for an entity: query_count grows by max(1, n),
    /// last_queried_at takes the later timestamp.
    pub fn record_query_access(
        &self,
        entity_id: &str,
        entity_type: &str,
        requested: u64,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        let increment = requested.max(1);
        conn.execute(
            "INSERT INTO query_access_log (entity_id, entity_type, last_queried_at, query_count)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (entity_id, entity_type) DO UPDATE SET
                query_count = query_access_log.query_count + excluded.query_count,
                last_queried_at = MAX(query_access_log.last_queried_at, excluded.last_queried_at)",
            params![entity_id, entity_type, now_iso(), increment as i64],
        )?;
        Ok(())
    }

    pub fn query_access_count(&self, entity_id: &str, entity_type: &str) -> Result<u64> {
        let conn = self.lock_conn()?;
        let count: Option<i64> = conn
            .query_row(
                "SELECT query_count FROM query_access_log WHERE entity_id = ?1 AND entity_type = ?2",
                params![entity_id, entity_type],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0) as u64)
    }

    /// Rank high-centrality, under-queried entities:
    /// exploration_value = centrality / ln(1 + query_count).
    pub fn exploration_suggestions(
        &self,
        centrality: &[(String, String, f64)],
        top_k: usize,
    ) -> Result<Vec<ExplorationSuggestion>> {
        let mut suggestions: Vec<ExplorationSuggestion> = Vec::with_capacity(centrality.len());
        for (entity_id, entity_type, score) in centrality {
            let query_count = self.query_access_count(entity_id, entity_type)?;
            // ln(1 + count) with count 0 would divide by zero; treat an
            // unqueried entity as maximally unexplored.
            let exploration_value = if query_count == 0 {
                *score * 2.0
            } else {
                score / ((1.0 + query_count as f64).ln().max(f64::MIN_POSITIVE))
            };
            suggestions.push(ExplorationSuggestion {
                entity_id: entity_id.clone(),
                entity_type: entity_type.clone(),
                centrality: *score,
                query_count,
                exploration_value,
                rationale: if query_count == 0 {
                    format!("centrality {:.3}, never queried", score)
                } else {
                    format!("centrality {:.3}, only {} queries", score, query_count)
                },
            });
        }
        suggestions.sort_by(|a, b| {
            b.exploration_value
                .total_cmp(&a.exploration_value)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        suggestions.truncate(top_k);
        Ok(suggestions)
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
    fn test_cache_round_trip_promotes_access() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.cache_put("h1", "{\"q\":\"parse\"}", "[]").unwrap();
        let first = store.cache_get("h1").unwrap().unwrap();
        assert_eq!(first.access_count, 0);

        let second = store.cache_get("h1").unwrap().unwrap();
        assert_eq!(second.access_count, 1);

        assert!(store.cache_get("missing").unwrap().is_none());
    }

    #[test]
    fn test_prune_by_size_keeps_most_recent() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        for i in 0..5 {
            store.cache_put(&format!("h{}", i), "{}", "r").unwrap();
        }
        // Touch h4 so it is the most recently accessed.
        store.cache_get("h4").unwrap();

        let removed = store
            .prune_query_cache(CachePruneOptions {
                max_age_ms: None,
                max_entries: Some(1),
            })
            .unwrap();
        assert_eq!(removed, 4);
        assert!(store.cache_get("h4").unwrap().is_some());
    }

    #[test]
    fn test_prune_by_age() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.cache_put("old", "{}", "r").unwrap();

        // Backdate the row past any cutoff.
        {
            let conn = store.lock_conn().unwrap();
            conn.execute(
                "UPDATE query_cache SET created_at = '2020-01-01T00:00:00+00:00' WHERE query_hash = 'old'",
                [],
            )
            .unwrap();
        }

        let removed = store
            .prune_query_cache(CachePruneOptions {
                max_age_ms: Some(1000),
                max_entries: None,
            })
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_invalidate_cache_purges_and_invalidates() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store
            .cache_put("q1", "{\"path\":\"src/a.ts\"}", "resp")
            .unwrap();
        store.cache_put("q2", "{\"path\":\"lib/b.ts\"}", "resp").unwrap();

        store
            .upsert_context_pack(&crate::store::context_packs::ContextPackDraft {
                pack_type: "file_context".to_string(),
                target_id: "src/a.ts".to_string(),
                summary: "s".to_string(),
                key_facts: vec![],
                code_snippets: vec![],
                related_files: vec![],
                invalidation_triggers: vec!["src/a.ts".to_string()],
                confidence: 0.5,
                version_string: "v1".to_string(),
                schema_version: 1,
            })
            .unwrap();

        let (purged, invalidated) = store.invalidate_cache("src/a.ts").unwrap();
        assert_eq!(purged, 1);
        assert_eq!(invalidated, 1);
        assert!(store.cache_get("q2").unwrap().is_some());
    }

    #[test]
    fn test_access_log_upsert_semantics() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.record_query_access("f1", "function", 0).unwrap();
        assert_eq!(store.query_access_count("f1", "function").unwrap(), 1);

        store.record_query_access("f1", "function", 5).unwrap();
        assert_eq!(store.query_access_count("f1", "function").unwrap(), 6);
    }

    #[test]
    fn test_exploration_favors_unqueried_central_entities() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        // f-popular gets heavy traffic, f-hidden none.
        store.record_query_access("f-popular", "function", 50).unwrap();

        let suggestions = store
            .exploration_suggestions(
                &[
                    ("f-popular".to_string(), "function".to_string(), 0.9),
                    ("f-hidden".to_string(), "function".to_string(), 0.8),
                ],
                2,
            )
            .unwrap();

        assert_eq!(suggestions[0].entity_id, "f-hidden");
        assert!(suggestions[0].exploration_value > suggestions[1].exploration_value);
        assert!(suggestions[0].rationale.contains("never queried"));
    }
}
