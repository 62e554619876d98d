/**
 * Graph Edges & Git-Derived History
 *
 * Edges key on (from_id, to_id, edge_type, source_file). The git-derived
 * families (blame, diffs, reflog, clones, debt, knowledge edges, fault
 * localizations) plus ingestion items, evolution outcomes, quality history,
 * and assessments are explicit tables with batch upserts; every batch runs
 * inside a single transaction.
 */

use crate::error::{Error, Result};
use crate::types::{
    clamp_confidence, Assessment, BlameRecord, CloneRecord, DebtRecord, DiffRecord,
    EvolutionOutcome, FaultLocalization, GraphEdge, GraphEdgeQuery, IngestionItem, KnowledgeEdge,
    QualitySample, ReflogRecord,
};
use rusqlite::{params, OptionalExtension, Row};

use super::{now_iso, KnowledgeStore};

fn row_to_edge(row: &Row<'_>) -> rusqlite::Result<GraphEdge> {
    Ok(GraphEdge {
        from_id: row.get(0)?,
        to_id: row.get(1)?,
        edge_type: row.get(2)?,
        source_file: row.get(3)?,
        from_type: row.get(4)?,
        to_type: row.get(5)?,
        source_line: row.get::<_, Option<i64>>(6)?.map(|v| v as u32),
        confidence: row.get(7)?,
        computed_at: row.get(8)?,
    })
}

const EDGE_COLUMNS: &str =
    "from_id, to_id, edge_type, source_file, from_type, to_type, source_line, confidence, computed_at";

impl KnowledgeStore {
    /// Batch upsert of graph edges; all or nothing.
    pub fn upsert_graph_edges(&self, edges: &[GraphEdge]) -> Result<u64> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut written = 0u64;
        for edge in edges {
            if edge.from_id.is_empty() || edge.to_id.is_empty() || edge.edge_type.is_empty() {
                return Err(Error::Validation(
                    "graph edge requires from_id, to_id, edge_type".to_string(),
                ));
            }
            written += tx.execute(
                "INSERT OR REPLACE INTO graph_edges
                 (from_id, to_id, edge_type, source_file, from_type, to_type, source_line, confidence, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    edge.from_id,
                    edge.to_id,
                    edge.edge_type,
                    self.normalize(&edge.source_file),
                    edge.from_type,
                    edge.to_type,
                    edge.source_line.map(|v| v as i64),
                    clamp_confidence(edge.confidence),
                    if edge.computed_at.is_empty() { now_iso() } else { edge.computed_at.clone() },
                ],
            )? as u64;
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn query_graph_edges(&self, query: &GraphEdgeQuery) -> Result<Vec<GraphEdge>> {
        let conn = self.lock_conn()?;
        let mut sql = format!("SELECT {} FROM graph_edges", EDGE_COLUMNS);
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(from_id) = &query.from_id {
            clauses.push(format!("from_id = ?{}", args.len() + 1));
            args.push(Box::new(from_id.clone()));
        }
        if let Some(to_id) = &query.to_id {
            clauses.push(format!("to_id = ?{}", args.len() + 1));
            args.push(Box::new(to_id.clone()));
        }
        if let Some(edge_type) = &query.edge_type {
            clauses.push(format!("edge_type = ?{}", args.len() + 1));
            args.push(Box::new(edge_type.clone()));
        }
        if let Some(source_file) = &query.source_file {
            clauses.push(format!("source_file = ?{}", args.len() + 1));
            args.push(Box::new(self.normalize(source_file)));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(
            " ORDER BY from_id, to_id LIMIT {}",
            query.limit.unwrap_or(500)
        ));

        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(arg_refs.as_slice(), row_to_edge)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_graph_edges_for_file(&self, source_file: &str) -> Result<u64> {
        let conn = self.lock_conn()?;
        let n = conn.execute(
            "DELETE FROM graph_edges WHERE source_file = ?1",
            params![self.normalize(source_file)],
        )?;
        Ok(n as u64)
    }

    pub fn upsert_blame_records(&self, records: &[BlameRecord]) -> Result<u64> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut written = 0u64;
        for r in records {
            written += tx.execute(
                "INSERT OR REPLACE INTO blame_records
                 (id, file_path, line_start, line_end, author, commit_hash, committed_at, summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    nonempty_id(&r.id),
                    self.normalize(&r.file_path),
                    r.line_start as i64,
                    r.line_end as i64,
                    self.redactor.redact(&r.author).0,
                    r.commit_hash,
                    r.committed_at,
                    self.redactor.redact(&r.summary).0,
                ],
            )? as u64;
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn blame_for_file(&self, file_path: &str) -> Result<Vec<BlameRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, file_path, line_start, line_end, author, commit_hash, committed_at, summary
             FROM blame_records WHERE file_path = ?1 ORDER BY line_start ASC",
        )?;
        let rows = stmt
            .query_map(params![self.normalize(file_path)], |row| {
                Ok(BlameRecord {
                    id: row.get(0)?,
                    file_path: row.get(1)?,
                    line_start: row.get::<_, i64>(2)? as u32,
                    line_end: row.get::<_, i64>(3)? as u32,
                    author: row.get(4)?,
                    commit_hash: row.get(5)?,
                    committed_at: row.get(6)?,
                    summary: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_diff_records(&self, records: &[DiffRecord]) -> Result<u64> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut written = 0u64;
        for r in records {
            written += tx.execute(
                "INSERT OR REPLACE INTO diff_records
                 (id, commit_hash, file_path, change_kind, lines_added, lines_removed, committed_at, summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    nonempty_id(&r.id),
                    r.commit_hash,
                    self.normalize(&r.file_path),
                    r.change_kind,
                    r.lines_added as i64,
                    r.lines_removed as i64,
                    r.committed_at,
                    self.redactor.redact(&r.summary).0,
                ],
            )? as u64;
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn diffs_for_file(&self, file_path: &str) -> Result<Vec<DiffRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, commit_hash, file_path, change_kind, lines_added, lines_removed, committed_at, summary
             FROM diff_records WHERE file_path = ?1 ORDER BY committed_at DESC",
        )?;
        let rows = stmt
            .query_map(params![self.normalize(file_path)], |row| {
                Ok(DiffRecord {
                    id: row.get(0)?,
                    commit_hash: row.get(1)?,
                    file_path: row.get(2)?,
                    change_kind: row.get(3)?,
                    lines_added: row.get::<_, i64>(4)? as u32,
                    lines_removed: row.get::<_, i64>(5)? as u32,
                    committed_at: row.get(6)?,
                    summary: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_reflog_records(&self, records: &[ReflogRecord]) -> Result<u64> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut written = 0u64;
        for r in records {
            written += tx.execute(
                "INSERT OR REPLACE INTO reflog_records
                 (id, ref_name, action, commit_hash, recorded_at, message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    nonempty_id(&r.id),
                    r.ref_name,
                    r.action,
                    r.commit_hash,
                    r.recorded_at,
                    self.redactor.redact(&r.message).0,
                ],
            )? as u64;
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn recent_reflog(&self, limit: u32) -> Result<Vec<ReflogRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, ref_name, action, commit_hash, recorded_at, message
             FROM reflog_records ORDER BY recorded_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(ReflogRecord {
                    id: row.get(0)?,
                    ref_name: row.get(1)?,
                    action: row.get(2)?,
                    commit_hash: row.get(3)?,
                    recorded_at: row.get(4)?,
                    message: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_clone_records(&self, records: &[CloneRecord]) -> Result<u64> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut written = 0u64;
        for r in records {
            written += tx.execute(
                "INSERT OR REPLACE INTO clone_records
                 (id, file_path_a, line_start_a, line_end_a, file_path_b, line_start_b, line_end_b, similarity, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    nonempty_id(&r.id),
                    self.normalize(&r.file_path_a),
                    r.line_start_a as i64,
                    r.line_end_a as i64,
                    self.normalize(&r.file_path_b),
                    r.line_start_b as i64,
                    r.line_end_b as i64,
                    r.similarity,
                    r.detected_at,
                ],
            )? as u64;
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn clones_for_file(&self, file_path: &str) -> Result<Vec<CloneRecord>> {
        let conn = self.lock_conn()?;
        let normalized = self.normalize(file_path);
        let mut stmt = conn.prepare(
            "SELECT id, file_path_a, line_start_a, line_end_a, file_path_b, line_start_b, line_end_b, similarity, detected_at
             FROM clone_records WHERE file_path_a = ?1 OR file_path_b = ?1
             ORDER BY similarity DESC",
        )?;
        let rows = stmt
            .query_map(params![normalized], |row| {
                Ok(CloneRecord {
                    id: row.get(0)?,
                    file_path_a: row.get(1)?,
                    line_start_a: row.get::<_, i64>(2)? as u32,
                    line_end_a: row.get::<_, i64>(3)? as u32,
                    file_path_b: row.get(4)?,
                    line_start_b: row.get::<_, i64>(5)? as u32,
                    line_end_b: row.get::<_, i64>(6)? as u32,
                    similarity: row.get(7)?,
                    detected_at: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_debt_records(&self, records: &[DebtRecord]) -> Result<u64> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut written = 0u64;
        for r in records {
            written += tx.execute(
                "INSERT OR REPLACE INTO debt_records
                 (id, file_path, category, severity, description, estimated_effort, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    nonempty_id(&r.id),
                    self.normalize(&r.file_path),
                    r.category,
                    r.severity,
                    self.redactor.redact(&r.description).0,
                    r.estimated_effort,
                    r.recorded_at,
                ],
            )? as u64;
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn debt_for_file(&self, file_path: &str) -> Result<Vec<DebtRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, file_path, category, severity, description, estimated_effort, recorded_at
             FROM debt_records WHERE file_path = ?1 ORDER BY recorded_at DESC",
        )?;
        let rows = stmt
            .query_map(params![self.normalize(file_path)], |row| {
                Ok(DebtRecord {
                    id: row.get(0)?,
                    file_path: row.get(1)?,
                    category: row.get(2)?,
                    severity: row.get(3)?,
                    description: row.get(4)?,
                    estimated_effort: row.get(5)?,
                    recorded_at: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_knowledge_edges(&self, edges: &[KnowledgeEdge]) -> Result<u64> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut written = 0u64;
        for e in edges {
            written += tx.execute(
                "INSERT OR REPLACE INTO knowledge_edges (from_id, to_id, relation, weight, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![e.from_id, e.to_id, e.relation, e.weight, e.computed_at],
            )? as u64;
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn knowledge_edges_from(&self, from_id: &str) -> Result<Vec<KnowledgeEdge>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT from_id, to_id, relation, weight, computed_at
             FROM knowledge_edges WHERE from_id = ?1 ORDER BY weight DESC",
        )?;
        let rows = stmt
            .query_map(params![from_id], |row| {
                Ok(KnowledgeEdge {
                    from_id: row.get(0)?,
                    to_id: row.get(1)?,
                    relation: row.get(2)?,
                    weight: row.get(3)?,
                    computed_at: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_fault_localizations(&self, records: &[FaultLocalization]) -> Result<u64> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut written = 0u64;
        for r in records {
            written += tx.execute(
                "INSERT OR REPLACE INTO fault_localizations
                 (id, symptom, file_path, line_start, line_end, suspiciousness, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    nonempty_id(&r.id),
                    self.redactor.redact(&r.symptom).0,
                    self.normalize(&r.file_path),
                    r.line_start.map(|v| v as i64),
                    r.line_end.map(|v| v as i64),
                    r.suspiciousness,
                    r.computed_at,
                ],
            )? as u64;
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn faults_for_symptom(&self, symptom: &str) -> Result<Vec<FaultLocalization>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, symptom, file_path, line_start, line_end, suspiciousness, computed_at
             FROM fault_localizations WHERE symptom = ?1 ORDER BY suspiciousness DESC",
        )?;
        let rows = stmt
            .query_map(params![symptom], |row| {
                Ok(FaultLocalization {
                    id: row.get(0)?,
                    symptom: row.get(1)?,
                    file_path: row.get(2)?,
                    line_start: row.get::<_, Option<i64>>(3)?.map(|v| v as u32),
                    line_end: row.get::<_, Option<i64>>(4)?.map(|v| v as u32),
                    suspiciousness: row.get(5)?,
                    computed_at: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_ingestion_items(&self, items: &[IngestionItem]) -> Result<u64> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut written = 0u64;
        for item in items {
            written += tx.execute(
                "INSERT OR REPLACE INTO ingestion_items
                 (id, source_path, item_kind, status, attempts, last_error, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    nonempty_id(&item.id),
                    self.normalize(&item.source_path),
                    item.item_kind,
                    item.status,
                    item.attempts as i64,
                    item.last_error,
                    if item.updated_at.is_empty() { now_iso() } else { item.updated_at.clone() },
                ],
            )? as u64;
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn pending_ingestion_items(&self, limit: u32) -> Result<Vec<IngestionItem>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_path, item_kind, status, attempts, last_error, updated_at
             FROM ingestion_items WHERE status = 'pending' ORDER BY updated_at ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(IngestionItem {
                    id: row.get(0)?,
                    source_path: row.get(1)?,
                    item_kind: row.get(2)?,
                    status: row.get(3)?,
                    attempts: row.get::<_, i64>(4)? as u32,
                    last_error: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn record_evolution_outcome(&self, outcome: &EvolutionOutcome) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO evolution_outcomes
             (id, entity_id, entity_type, outcome, detail, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                nonempty_id(&outcome.id),
                outcome.entity_id,
                outcome.entity_type,
                outcome.outcome,
                self.redactor.redact(&outcome.detail).0,
                if outcome.recorded_at.is_empty() { now_iso() } else { outcome.recorded_at.clone() },
            ],
        )?;
        Ok(())
    }

    pub fn evolution_outcomes_for(&self, entity_id: &str) -> Result<Vec<EvolutionOutcome>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, entity_id, entity_type, outcome, detail, recorded_at
             FROM evolution_outcomes WHERE entity_id = ?1 ORDER BY recorded_at DESC",
        )?;
        let rows = stmt
            .query_map(params![entity_id], |row| {
                Ok(EvolutionOutcome {
                    id: row.get(0)?,
                    entity_id: row.get(1)?,
                    entity_type: row.get(2)?,
                    outcome: row.get(3)?,
                    detail: row.get(4)?,
                    recorded_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn record_quality_sample(&self, sample: &QualitySample) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO quality_history
             (id, entity_id, entity_type, metric, value, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                nonempty_id(&sample.id),
                sample.entity_id,
                sample.entity_type,
                sample.metric,
                sample.value,
                if sample.recorded_at.is_empty() { now_iso() } else { sample.recorded_at.clone() },
            ],
        )?;
        Ok(())
    }

    pub fn quality_history_for(
        &self,
        entity_id: &str,
        metric: Option<&str>,
    ) -> Result<Vec<QualitySample>> {
        let conn = self.lock_conn()?;
        let mut sql = String::from(
            "SELECT id, entity_id, entity_type, metric, value, recorded_at
             FROM quality_history WHERE entity_id = ?1",
        );
        if metric.is_some() {
            sql.push_str(" AND metric = ?2");
        }
        sql.push_str(" ORDER BY recorded_at ASC");

        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &Row<'_>| -> rusqlite::Result<QualitySample> {
            Ok(QualitySample {
                id: row.get(0)?,
                entity_id: row.get(1)?,
                entity_type: row.get(2)?,
                metric: row.get(3)?,
                value: row.get(4)?,
                recorded_at: row.get(5)?,
            })
        };
        let rows = match metric {
            Some(metric) => stmt
                .query_map(params![entity_id, metric], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![entity_id], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    pub fn upsert_assessment(&self, assessment: &Assessment) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO assessments
             (id, entity_id, entity_type, assessor, verdict, score, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                nonempty_id(&assessment.id),
                assessment.entity_id,
                assessment.entity_type,
                assessment.assessor,
                assessment.verdict,
                assessment.score,
                self.redactor.redact(&assessment.notes).0,
                if assessment.created_at.is_empty() { now_iso() } else { assessment.created_at.clone() },
            ],
        )?;
        Ok(())
    }

    pub fn assessments_for(&self, entity_id: &str) -> Result<Vec<Assessment>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, entity_id, entity_type, assessor, verdict, score, notes, created_at
             FROM assessments WHERE entity_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![entity_id], |row| {
                Ok(Assessment {
                    id: row.get(0)?,
                    entity_id: row.get(1)?,
                    entity_type: row.get(2)?,
                    assessor: row.get(3)?,
                    verdict: row.get(4)?,
                    score: row.get(5)?,
                    notes: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Look up an assessment by id (used by ingestion reconciliation).
    pub fn get_assessment(&self, id: &str) -> Result<Option<Assessment>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT id, entity_id, entity_type, assessor, verdict, score, notes, created_at
                 FROM assessments WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Assessment {
                        id: row.get(0)?,
                        entity_id: row.get(1)?,
                        entity_type: row.get(2)?,
                        assessor: row.get(3)?,
                        verdict: row.get(4)?,
                        score: row.get(5)?,
                        notes: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

/// Git-derived producers sometimes omit row ids; mint one rather than colliding
/// on the empty string.
fn nonempty_id(id: &str) -> String {
    if id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        id.to_string()
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

    fn edge(from: &str, to: &str) -> GraphEdge {
        GraphEdge {
            from_id: from.to_string(),
            to_id: to.to_string(),
            edge_type: "calls".to_string(),
            source_file: "src/a.ts".to_string(),
            from_type: "function".to_string(),
            to_type: "function".to_string(),
            source_line: Some(12),
            confidence: 0.9,
            computed_at: String::new(),
        }
    }

    #[test]
    fn test_edge_upsert_keys_on_quad() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.upsert_graph_edges(&[edge("a", "b"), edge("a", "c")]).unwrap();
        // Same key overwrites instead of duplicating.
        store.upsert_graph_edges(&[edge("a", "b")]).unwrap();

        let edges = store
            .query_graph_edges(&GraphEdgeQuery {
                from_id: Some("a".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(edges.len(), 2);
    }

    #[test]
    fn test_edge_delete_by_file() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert_graph_edges(&[edge("a", "b")]).unwrap();
        assert_eq!(store.delete_graph_edges_for_file("src/a.ts").unwrap(), 1);
        assert!(store
            .query_graph_edges(&GraphEdgeQuery::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_blame_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store
            .upsert_blame_records(&[BlameRecord {
                id: String::new(),
                file_path: "src/a.ts".to_string(),
                line_start: 1,
                line_end: 20,
                author: "dev".to_string(),
                commit_hash: "abc123".to_string(),
                committed_at: "2026-01-01T00:00:00Z".to_string(),
                summary: "initial".to_string(),
            }])
            .unwrap();

        let rows = store.blame_for_file("src/a.ts").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].id.is_empty());
        assert_eq!(rows[0].commit_hash, "abc123");
    }

    #[test]
    fn test_quality_history_filters_by_metric() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        for (metric, value) in [("coverage", 0.8), ("coverage", 0.9), ("churn", 12.0)] {
            store
                .record_quality_sample(&QualitySample {
                    id: String::new(),
                    entity_id: "f1".to_string(),
                    entity_type: "function".to_string(),
                    metric: metric.to_string(),
                    value,
                    recorded_at: String::new(),
                })
                .unwrap();
        }

        assert_eq!(store.quality_history_for("f1", None).unwrap().len(), 3);
        assert_eq!(
            store.quality_history_for("f1", Some("coverage")).unwrap().len(),
            2
        );
    }

    #[test]
    fn test_ingestion_pending_queue() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store
            .upsert_ingestion_items(&[
                IngestionItem {
                    id: "i1".to_string(),
                    source_path: "src/a.ts".to_string(),
                    item_kind: "file".to_string(),
                    status: "pending".to_string(),
                    attempts: 0,
                    last_error: None,
                    updated_at: String::new(),
                },
                IngestionItem {
                    id: "i2".to_string(),
                    source_path: "src/b.ts".to_string(),
                    item_kind: "file".to_string(),
                    status: "done".to_string(),
                    attempts: 1,
                    last_error: None,
                    updated_at: String::new(),
                },
            ])
            .unwrap();

        let pending = store.pending_ingestion_items(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "i1");
    }
}
