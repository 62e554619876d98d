/**
 * Knowledge Store Integration Tests
 *
 * DESIGN DECISION: End-to-end validation through the public handle only
 * WHY: Unit tests cover each subsystem in isolation; these scenarios verify
 *      the storage layer, vector index, change log, and evidence verifier
 *      working together against a real temp workspace
 */

use librarian_core::store::context_packs::ContextPackDraft;
use librarian_core::store::functions::FunctionDraft;
use librarian_core::types::{
    CodeSnippet, ContextPackQuery, EmbeddingMetadata, SimilarityQuery,
};
use librarian_core::{
    ChangeEventType, ConfidenceTarget, DegradedReason, EntityType, Error, KnowledgeStore,
    NewEvidence, StoreConfig,
};
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> KnowledgeStore {
    KnowledgeStore::open(StoreConfig::new(dir.path())).unwrap()
}

fn function_draft(path: &str, name: &str) -> FunctionDraft {
    FunctionDraft {
        file_path: path.to_string(),
        name: name.to_string(),
        signature: format!("function {}()", name),
        purpose: "test".to_string(),
        start_line: 1,
        end_line: 5,
        behavior: Default::default(),
        effect_signature: vec![],
        confidence: 0.7,
    }
}

fn embedding_meta() -> EmbeddingMetadata {
    EmbeddingMetadata {
        entity_type: EntityType::Function,
        model_id: "test-model".to_string(),
        generated_at: "2026-01-01T00:00:00Z".to_string(),
        token_count: 8,
    }
}

#[test]
fn test_insert_then_query_similarity() {
    // Scenario: upsert a function, embed it, retrieve it by a near-identical
    // query vector above a high similarity floor.
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let function = store.upsert_function(&function_draft("src/a.ts", "parse")).unwrap();

    let mut vector = vec![0.0f32; 64];
    vector[0] = 1.0;
    store.set_embedding(&function.id, &vector, &embedding_meta()).unwrap();

    let mut query = vec![0.0f32; 64];
    query[0] = 0.99;
    query[1] = 0.01;
    let outcome = store
        .find_similar_by_embedding(
            &query,
            &SimilarityQuery {
                limit: 5,
                min_similarity: 0.9,
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].entity_id, function.id);
    assert!(outcome.results[0].similarity >= 0.99);
}

#[test]
fn test_dimension_mismatch_auto_recovery() {
    // Scenario: three 128-dim rows, one 384-dim query, auto-recovery enabled.
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    for i in 0..3 {
        let mut vector = vec![0.0f32; 128];
        vector[i] = 1.0;
        store
            .set_embedding(&format!("e{}", i), &vector, &embedding_meta())
            .unwrap();
    }

    let query = {
        let mut v = vec![0.0f32; 384];
        v[0] = 1.0;
        v
    };
    let outcome = store
        .find_similar_by_embedding(&query, &SimilarityQuery::default())
        .unwrap();

    assert!(outcome.results.is_empty());
    assert!(outcome.degraded);
    assert_eq!(
        outcome.degraded_reason,
        Some(DegradedReason::AutoRecoveredDimensionMismatch)
    );
    assert_eq!(outcome.cleared_mismatched_count, Some(3));
    assert!(store.embedding_stats().unwrap().is_empty());
}

#[test]
fn test_context_pack_invalidation() {
    // Scenario: a pack triggered by src/a.ts goes invisible after the sweep
    // unless include_invalidated is requested.
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store
        .upsert_context_pack(&ContextPackDraft {
            pack_type: "function_context".to_string(),
            target_id: "fn-1".to_string(),
            summary: "summary".to_string(),
            key_facts: vec!["fact".to_string()],
            code_snippets: vec![CodeSnippet {
                file_path: "src/a.ts".to_string(),
                line_start: 1,
                line_end: 3,
                content: "code".to_string(),
            }],
            related_files: vec!["src/a.ts".to_string()],
            invalidation_triggers: vec!["src/a.ts".to_string()],
            confidence: 0.8,
            version_string: "v1".to_string(),
            schema_version: 1,
        })
        .unwrap();

    assert_eq!(store.invalidate_context_packs("src/a.ts").unwrap(), 1);

    let visible = store.query_context_packs(&ContextPackQuery::default()).unwrap();
    assert!(visible.is_empty());

    let all = store
        .query_context_packs(&ContextPackQuery {
            include_invalidated: true,
            ..ContextPackQuery::default()
        })
        .unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].invalidated);
}

#[test]
fn test_transaction_conflict_and_change_log() {
    // Scenario: two commits racing from the same base version; the loser gets
    // TransactionConflict and the log gains exactly one row at base + 1.
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store
        .transaction(|ctx| {
            ctx.upsert_function(&function_draft("src/a.ts", "winner"))?;
            Ok(())
        })
        .unwrap();
    let base = store.coordination_version().unwrap();

    // T1 commits from `base`.
    assert_eq!(store.advance_coordination_version(base).unwrap(), base + 1);
    // T2 also read `base`; its commit must lose.
    let err = store.advance_coordination_version(base).unwrap_err();
    assert!(matches!(err, Error::TransactionConflict { .. }));
    assert_eq!(store.coordination_version().unwrap(), base + 1);

    let events = store.change_events_since(0, None, 100).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].version, base);
    assert_eq!(events[0].event_type, ChangeEventType::FunctionUpdated);
}

#[test]
fn test_hnsw_search_survives_reopen() {
    // Scenario: top-1 result identity is preserved across serialize/reopen.
    let dir = TempDir::new().unwrap();
    let mut config = StoreConfig::new(dir.path());
    config.hnsw_mode = librarian_core::HnswMode::On;

    let top_before;
    {
        let store = KnowledgeStore::open(config.clone()).unwrap();
        for i in 0..50 {
            let mut vector = vec![0.0f32; 16];
            vector[i % 16] = 1.0;
            vector[(i + 1) % 16] = 0.1;
            store
                .set_embedding(&format!("node-{}", i), &vector, &embedding_meta())
                .unwrap();
        }
        let mut query = vec![0.0f32; 16];
        query[3] = 1.0;
        let outcome = store
            .find_similar_by_embedding(&query, &SimilarityQuery::default())
            .unwrap();
        top_before = outcome.results.first().map(|h| h.entity_id.clone());
        assert!(top_before.is_some());
        store.persist_vector_index().unwrap();
    }

    let store = KnowledgeStore::open(config).unwrap();
    let mut query = vec![0.0f32; 16];
    query[3] = 1.0;
    let outcome = store
        .find_similar_by_embedding(&query, &SimilarityQuery::default())
        .unwrap();
    assert_eq!(outcome.results.first().map(|h| h.entity_id.clone()), top_before);
}

#[test]
fn test_evidence_stale_detection() {
    // Scenario: replacing the anchored lines marks evidence stale, clears the
    // hash, and refreshes verified_at instead of failing the read.
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut lines: Vec<String> = (1..=20).map(|i| format!("line {}", i)).collect();
    lines[9] = "A".to_string();
    lines[10] = "B".to_string();
    lines[11] = "C".to_string();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/a.ts"), lines.join("\n") + "\n").unwrap();

    store
        .set_evidence(
            "fn-1",
            "function",
            &[NewEvidence {
                file_path: "src/a.ts".to_string(),
                line_start: 10,
                line_end: Some(12),
                snippet: "A\nB\nC".to_string(),
                claim: "handles the header".to_string(),
                confidence: 0.8,
            }],
        )
        .unwrap();

    lines[9] = "X".to_string();
    lines[10] = "Y".to_string();
    lines[11] = "Z".to_string();
    std::fs::write(dir.path().join("src/a.ts"), lines.join("\n") + "\n").unwrap();

    let rows = store.evidence_for("fn-1", "function").unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].stale);
    assert!(rows[0].content_hash.is_none());
    assert!(rows[0].verified_at.is_some());
}

#[test]
fn test_lock_exclusivity_against_live_holder() {
    let dir = TempDir::new().unwrap();
    let first = open_store(&dir);

    match KnowledgeStore::open(StoreConfig::new(dir.path())) {
        Err(Error::StorageLocked { reason }) => {
            assert!(reason.contains("indexing_in_progress"), "reason: {}", reason);
        }
        Err(other) => panic!("expected StorageLocked, got {}", other),
        Ok(_) => panic!("second opener must fail while the first is alive"),
    }

    drop(first);
    // Releasing the first handle frees the workspace.
    let _second = open_store(&dir);
}

#[test]
fn test_invalidate_embeddings_on_file_change() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let f = store.upsert_function(&function_draft("src/a.ts", "parse")).unwrap();
    let g = store.upsert_function(&function_draft("src/b.ts", "lex")).unwrap();
    store.set_embedding(&f.id, &[1.0, 0.0], &embedding_meta()).unwrap();
    store.set_embedding(&g.id, &[0.0, 1.0], &embedding_meta()).unwrap();

    assert_eq!(store.invalidate_embeddings("src/a.ts").unwrap(), 1);
    assert!(store.get_embedding(&f.id).unwrap().is_none());
    assert!(store.get_embedding(&g.id).unwrap().is_some());
}

#[test]
fn test_confidence_updates_and_decay_end_to_end() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let f = store.upsert_function(&function_draft("src/a.ts", "parse")).unwrap();
    store
        .update_confidence(&f.id, ConfidenceTarget::Function, 0.5, "validated by tests")
        .unwrap();
    let row = store.get_function(&f.id).unwrap().unwrap();
    assert!(row.confidence <= 0.95);

    let changed = store.apply_time_decay(0.2).unwrap();
    assert!(changed >= 1);
    let row = store.get_function(&f.id).unwrap().unwrap();
    assert!(row.confidence >= 0.1);
}

#[test]
fn test_change_events_stream_with_path_filter() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store
        .transaction(|ctx| {
            ctx.record_file_added("src/core/a.ts");
            ctx.record_file_added("docs/readme.md");
            Ok(())
        })
        .unwrap();
    store
        .transaction(|ctx| {
            ctx.record_file_removed("src/core/a.ts");
            Ok(())
        })
        .unwrap();

    let events = store
        .change_events_since(0, Some(&["src/**".to_string()]), 10)
        .unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.windows(2).all(|w| w[0].version <= w[1].version));
    assert_eq!(events[1].event_type, ChangeEventType::FileRemoved);
}

#[test]
fn test_statistics_reflect_population() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.upsert_function(&function_draft("src/a.ts", "one")).unwrap();
    store.upsert_function(&function_draft("src/a.ts", "two")).unwrap();
    store.set_embedding("e1", &[1.0, 0.0], &embedding_meta()).unwrap();

    let stats = store.statistics().unwrap();
    assert_eq!(stats.functions, 2);
    assert_eq!(stats.embeddings, 1);
    assert!(stats.database_size_bytes > 0);
    assert_eq!(stats.embedding_dims.len(), 1);
    assert_eq!(stats.embedding_dims[0].dim, 2);
}

mod properties {
    use super::*;
    use librarian_core::store::context_packs::pack_content_hash;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Confidence stays inside [0.10, 0.95] under arbitrary deltas.
        #[test]
        fn confidence_always_clamped(delta in -10.0f64..10.0f64) {
            let dir = TempDir::new().unwrap();
            let store = open_store(&dir);
            let f = store.upsert_function(&function_draft("src/p.ts", "prop")).unwrap();
            store.update_confidence(&f.id, ConfidenceTarget::Function, delta, "prop").unwrap();
            let row = store.get_function(&f.id).unwrap().unwrap();
            prop_assert!(row.confidence >= 0.10 && row.confidence <= 0.95);
        }

        /// Equal canonical projections hash identically regardless of the
        /// order unordered fields arrive in.
        #[test]
        fn pack_hash_is_projection_stable(
            facts in proptest::collection::vec("[a-z]{1,8}", 0..5),
            mut files in proptest::collection::vec("[a-z]{1,8}\\.ts", 0..5),
        ) {
            let a = pack_content_hash(
                1, "t", "target", "summary", &facts, &[], &files, &[], "v1",
            );
            files.reverse();
            let b = pack_content_hash(
                1, "t", "target", "summary", &facts, &[], &files, &[], "v1",
            );
            prop_assert_eq!(a, b);
        }
    }
}
