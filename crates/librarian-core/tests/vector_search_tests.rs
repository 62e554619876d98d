/**
 * Vector Search Integration Tests
 *
 * DESIGN DECISION: Recall and degradation checks through the public search API
 * WHY: The HNSW unit tests pin graph mechanics; these trials validate that
 *      clustered collections stay retrievable through every mode and that
 *      degraded paths report themselves
 */

use librarian_core::types::{EmbeddingMetadata, SimilarityQuery};
use librarian_core::{EntityType, HnswMode, KnowledgeStore, StoreConfig};
use tempfile::TempDir;

const DIM: usize = 24;

fn meta(ty: EntityType) -> EmbeddingMetadata {
    EmbeddingMetadata {
        entity_type: ty,
        model_id: "test-model".to_string(),
        generated_at: "2026-01-01T00:00:00Z".to_string(),
        token_count: 4,
    }
}

/// Normalized vector near one of two orthogonal centroids, jittered by index.
fn clustered_vector(cluster: usize, index: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    let axis = if cluster == 0 { 0 } else { DIM / 2 };
    v[axis] = 1.0;
    v[axis + 1 + (index % 4)] = 0.05 + 0.01 * (index % 3) as f32;
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter().map(|x| x / norm).collect()
}

fn seed_clusters(store: &KnowledgeStore, per_cluster: usize) {
    for i in 0..per_cluster {
        store
            .set_embedding(
                &format!("alpha-{}", i),
                &clustered_vector(0, i),
                &meta(EntityType::Function),
            )
            .unwrap();
        store
            .set_embedding(
                &format!("beta-{}", i),
                &clustered_vector(1, i),
                &meta(EntityType::Module),
            )
            .unwrap();
    }
}

#[test]
fn test_recall_sanity_brute_force() {
    let dir = TempDir::new().unwrap();
    let store = KnowledgeStore::open(StoreConfig::new(dir.path())).unwrap();
    seed_clusters(&store, 30);

    for trial in 0..5 {
        let query = clustered_vector(0, trial * 7);
        let outcome = store
            .find_similar_by_embedding(
                &query,
                &SimilarityQuery {
                    limit: 10,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(
            outcome.results.iter().any(|h| h.entity_id.starts_with("alpha-")),
            "trial {}: no correct-cluster hit in top-10",
            trial
        );
    }
}

#[test]
fn test_recall_sanity_hnsw() {
    let dir = TempDir::new().unwrap();
    let mut config = StoreConfig::new(dir.path());
    config.hnsw_mode = HnswMode::On;
    let store = KnowledgeStore::open(config).unwrap();
    seed_clusters(&store, 40);

    for trial in 0..5 {
        let query = clustered_vector(1, trial * 5);
        let outcome = store
            .find_similar_by_embedding(
                &query,
                &SimilarityQuery {
                    limit: 10,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(
            outcome.results.iter().any(|h| h.entity_id.starts_with("beta-")),
            "trial {}: no correct-cluster hit in top-10",
            trial
        );
    }
}

#[test]
fn test_type_restriction_holds_under_hnsw() {
    let dir = TempDir::new().unwrap();
    let mut config = StoreConfig::new(dir.path());
    config.hnsw_mode = HnswMode::On;
    let store = KnowledgeStore::open(config).unwrap();
    seed_clusters(&store, 25);

    let outcome = store
        .find_similar_by_embedding(
            &clustered_vector(0, 1),
            &SimilarityQuery {
                limit: 10,
                entity_types: Some(vec![EntityType::Module]),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(!outcome.results.is_empty());
    assert!(outcome
        .results
        .iter()
        .all(|h| h.entity_type == "module"));
}

#[test]
fn test_auto_mode_activates_at_threshold_and_sticks() {
    let dir = TempDir::new().unwrap();
    let mut config = StoreConfig::new(dir.path());
    config.hnsw_mode = HnswMode::Auto;
    config.hnsw_auto_threshold = 20;
    let store = KnowledgeStore::open(config.clone()).unwrap();

    seed_clusters(&store, 15); // 30 rows, past the threshold

    let outcome = store
        .find_similar_by_embedding(&clustered_vector(0, 0), &SimilarityQuery::default())
        .unwrap();
    assert!(!outcome.results.is_empty());

    // The activated graph persists for the next session.
    store.persist_vector_index().unwrap();
    assert!(config.hnsw_path().exists());
}

#[test]
fn test_min_similarity_floor_filters() {
    let dir = TempDir::new().unwrap();
    let store = KnowledgeStore::open(StoreConfig::new(dir.path())).unwrap();
    seed_clusters(&store, 10);

    // A cluster-0 query with a high floor excludes the orthogonal cluster.
    let outcome = store
        .find_similar_by_embedding(
            &clustered_vector(0, 0),
            &SimilarityQuery {
                limit: 50,
                min_similarity: 0.8,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(!outcome.results.is_empty());
    assert!(outcome.results.iter().all(|h| h.entity_id.starts_with("alpha-")));
    assert!(outcome.results.iter().all(|h| h.similarity >= 0.8));
}
