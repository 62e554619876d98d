/**
 * Knowledge Store Data Model
 *
 * DESIGN DECISION: Explicit structs with typed enums, no free-form property bags
 * WHY: Schema evolution must be explicit and versioned; closed option structs
 *      replace optional-boolean soup at every query entry point
 *
 * REASONING CHAIN:
 * 1. All IDs are opaque strings; all timestamps ISO-8601 UTC strings
 * 2. Paths stored workspace-relative, forward-slash form
 * 3. Confidence lives in [0.10, 0.95] everywhere; the clamp is applied on
 *    write and on delta update, never left to callers
 * 4. Query options are closed structs with enumerated order columns so the
 *    SQL layer can validate identifiers against allowlists
 */

use serde::{Deserialize, Serialize};

/// Lower bound of the confidence band.
pub const CONFIDENCE_FLOOR: f64 = 0.10;
/// Upper bound of the confidence band.
pub const CONFIDENCE_CEILING: f64 = 0.95;

/// Clamp a confidence value into the allowed band.
pub fn clamp_confidence(value: f64) -> f64 {
    value.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING)
}

/// Entity kinds that may carry embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Function,
    Module,
    Document,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Function => "function",
            EntityType::Module => "module",
            EntityType::Document => "document",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "function" => Some(EntityType::Function),
            "module" => Some(EntityType::Module),
            "document" => Some(EntityType::Document),
            _ => None,
        }
    }
}

/// Entity kinds addressable by confidence updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceTarget {
    Function,
    Module,
    ContextPack,
}

impl ConfidenceTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTarget::Function => "function",
            ConfidenceTarget::Module => "module",
            ConfidenceTarget::ContextPack => "context_pack",
        }
    }
}

/// Behavior flags extracted for a function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorFlags {
    pub is_pure: bool,
    pub has_side_effects: bool,
    pub modifies_params: bool,
    pub throws: bool,
    pub return_depends_on_inputs: bool,
}

/// Structured knowledge about a single function. Unique on `(file_path, name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionKnowledge {
    pub id: String,
    pub file_path: String,
    pub name: String,
    pub signature: String,
    pub purpose: String,
    pub start_line: u32,
    pub end_line: u32,
    pub behavior: BehaviorFlags,
    /// Ordered effect sequence (IO, mutation, network, ...).
    pub effect_signature: Vec<String>,
    pub confidence: f64,
    pub successes: u64,
    pub failures: u64,
    pub validation_count: u64,
    pub access_count: u64,
    pub last_accessed: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub last_verified_at: Option<String>,
}

/// Structured knowledge about a module. Unique on `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleKnowledge {
    pub id: String,
    pub path: String,
    pub purpose: String,
    pub exports: Vec<String>,
    pub dependencies: Vec<String>,
    pub confidence: f64,
    pub created_at: String,
    pub updated_at: String,
}

/// Complexity band for file summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityBand {
    Low,
    Medium,
    High,
}

impl ComplexityBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityBand::Low => "low",
            ComplexityBand::Medium => "medium",
            ComplexityBand::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(ComplexityBand::Low),
            "medium" => Some(ComplexityBand::Medium),
            "high" => Some(ComplexityBand::High),
            _ => None,
        }
    }
}

/// Structural summary of a source file. Keyed by `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileKnowledge {
    pub path: String,
    pub category: String,
    pub role: String,
    pub purpose: String,
    pub complexity: ComplexityBand,
    pub function_count: u32,
    pub line_count: u32,
    pub imports: Vec<String>,
    pub imported_by: Vec<String>,
    pub checksum: String,
    pub confidence: f64,
    pub updated_at: String,
}

/// Structural summary of a directory. Keyed by `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryKnowledge {
    pub path: String,
    pub purpose: String,
    pub role: String,
    pub file_count: u32,
    pub subdirectory_count: u32,
    pub parent: Option<String>,
    pub siblings: Vec<String>,
    pub confidence: f64,
    pub updated_at: String,
}

/// A code excerpt referenced by a context pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSnippet {
    pub file_path: String,
    pub line_start: u32,
    pub line_end: u32,
    pub content: String,
}

/// Curated, cacheable knowledge bundle for a target entity.
/// Unique on `(target_id, pack_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPack {
    pub pack_id: String,
    pub pack_type: String,
    pub target_id: String,
    pub summary: String,
    pub key_facts: Vec<String>,
    pub code_snippets: Vec<CodeSnippet>,
    pub related_files: Vec<String>,
    pub invalidation_triggers: Vec<String>,
    pub confidence: f64,
    pub access_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub version_string: String,
    pub schema_version: u32,
    pub content_hash: String,
    pub invalidated: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Graph edge between two entities, keyed by `(from_id, to_id, edge_type, source_file)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from_id: String,
    pub to_id: String,
    pub edge_type: String,
    pub source_file: String,
    pub from_type: String,
    pub to_type: String,
    pub source_line: Option<u32>,
    pub confidence: f64,
    pub computed_at: String,
}

/// Metadata attached to a stored embedding row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingMetadata {
    pub entity_type: EntityType,
    pub model_id: String,
    pub generated_at: String,
    pub token_count: u32,
}

/// A stored embedding row as returned to callers.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub entity_id: String,
    pub vector: Vec<f32>,
    pub metadata: EmbeddingMetadata,
}

/// Per-(entity_type, dim) count used by stats and degradation decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingStat {
    pub entity_type: String,
    pub dim: usize,
    pub count: u64,
}

/// Multi-vector record: opaque structured payload keyed by `(entity_id, entity_type)`,
/// last-writer-wins on `generated_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiVectorRecord {
    pub entity_id: String,
    pub entity_type: EntityType,
    /// Summary vector plus named subvectors.
    pub payload: MultiVectorPayload,
    pub model_id: String,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiVectorPayload {
    pub summary: Vec<f32>,
    pub subvectors: Vec<NamedVector>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedVector {
    pub label: String,
    pub vector: Vec<f32>,
}

/// Source-anchored claim about an entity, validated by content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub claim_id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub file_path: String,
    pub line_start: u32,
    pub line_end: Option<u32>,
    pub snippet: String,
    pub claim: String,
    pub confidence: f64,
    pub created_at: String,
    pub content_hash: Option<String>,
    pub verified_at: Option<String>,
    pub stale: bool,
}

/// Evidence as submitted by a producer (storage fields filled in by the store).
#[derive(Debug, Clone)]
pub struct NewEvidence {
    pub file_path: String,
    pub line_start: u32,
    pub line_end: Option<u32>,
    pub snippet: String,
    pub claim: String,
    pub confidence: f64,
}

/// Coordination event types emitted through the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventType {
    FileAdded,
    FileRemoved,
    FunctionUpdated,
}

impl ChangeEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEventType::FileAdded => "file_added",
            ChangeEventType::FileRemoved => "file_removed",
            ChangeEventType::FunctionUpdated => "function_updated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "file_added" => Some(ChangeEventType::FileAdded),
            "file_removed" => Some(ChangeEventType::FileRemoved),
            "function_updated" => Some(ChangeEventType::FunctionUpdated),
            _ => None,
        }
    }
}

/// Append-only change log row; `path` is workspace-relative, forward-slash form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: u64,
    pub event_type: ChangeEventType,
    pub path: String,
    pub version: u64,
    pub timestamp: String,
}

/// Confidence adjustment audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceEvent {
    pub id: u64,
    pub entity_id: String,
    pub entity_type: String,
    pub delta: f64,
    pub updated_at: String,
    pub reason: String,
}

/**
 * Git-derived record families
 *
 * Producers distill these from repository history; the store persists and
 * serves them. Each family is an explicit table, not a property bag.
 */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlameRecord {
    pub id: String,
    pub file_path: String,
    pub line_start: u32,
    pub line_end: u32,
    pub author: String,
    pub commit_hash: String,
    pub committed_at: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffRecord {
    pub id: String,
    pub commit_hash: String,
    pub file_path: String,
    pub change_kind: String,
    pub lines_added: u32,
    pub lines_removed: u32,
    pub committed_at: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflogRecord {
    pub id: String,
    pub ref_name: String,
    pub action: String,
    pub commit_hash: String,
    pub recorded_at: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneRecord {
    pub id: String,
    pub file_path_a: String,
    pub line_start_a: u32,
    pub line_end_a: u32,
    pub file_path_b: String,
    pub line_start_b: u32,
    pub line_end_b: u32,
    pub similarity: f64,
    pub detected_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebtRecord {
    pub id: String,
    pub file_path: String,
    pub category: String,
    pub severity: String,
    pub description: String,
    pub estimated_effort: String,
    pub recorded_at: String,
}

/// Knowledge-graph edge derived from co-change and authorship signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEdge {
    pub from_id: String,
    pub to_id: String,
    pub relation: String,
    pub weight: f64,
    pub computed_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultLocalization {
    pub id: String,
    pub symptom: String,
    pub file_path: String,
    pub line_start: Option<u32>,
    pub line_end: Option<u32>,
    pub suspiciousness: f64,
    pub computed_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionItem {
    pub id: String,
    pub source_path: String,
    pub item_kind: String,
    pub status: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionOutcome {
    pub id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub outcome: String,
    pub detail: String,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySample {
    pub id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub metric: String,
    pub value: f64,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    pub id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub assessor: String,
    pub verdict: String,
    pub score: f64,
    pub notes: String,
    pub created_at: String,
}

/**
 * Query options
 *
 * DESIGN DECISION: closed option structs with enumerated order columns
 * WHY: every dynamic identifier must pass an allowlist before reaching SQL
 */

/// Sort direction for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    #[default]
    Ascending,
    Descending,
}

impl OrderDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            OrderDirection::Ascending => "ASC",
            OrderDirection::Descending => "DESC",
        }
    }
}

/// Allowlisted order columns for function queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FunctionOrderColumn {
    #[default]
    Name,
    FilePath,
    Confidence,
    UpdatedAt,
    AccessCount,
    LastAccessed,
}

impl FunctionOrderColumn {
    pub fn as_sql(&self) -> &'static str {
        match self {
            FunctionOrderColumn::Name => "name",
            FunctionOrderColumn::FilePath => "file_path",
            FunctionOrderColumn::Confidence => "confidence",
            FunctionOrderColumn::UpdatedAt => "updated_at",
            FunctionOrderColumn::AccessCount => "access_count",
            FunctionOrderColumn::LastAccessed => "last_accessed",
        }
    }
}

/// Options for querying functions.
#[derive(Debug, Clone, Default)]
pub struct FunctionQuery {
    pub file_path: Option<String>,
    pub path_prefix: Option<String>,
    pub name: Option<String>,
    pub min_confidence: Option<f64>,
    pub order_by: FunctionOrderColumn,
    pub direction: OrderDirection,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Options for querying context packs.
#[derive(Debug, Clone)]
pub struct ContextPackQuery {
    pub target_id: Option<String>,
    pub pack_type: Option<String>,
    pub include_invalidated: bool,
    pub limit: Option<u32>,
}

impl Default for ContextPackQuery {
    fn default() -> Self {
        Self {
            target_id: None,
            pack_type: None,
            include_invalidated: false,
            limit: None,
        }
    }
}

/// Options for querying graph edges.
#[derive(Debug, Clone, Default)]
pub struct GraphEdgeQuery {
    pub from_id: Option<String>,
    pub to_id: Option<String>,
    pub edge_type: Option<String>,
    pub source_file: Option<String>,
    pub limit: Option<u32>,
}

/// Similarity search request against the vector index.
#[derive(Debug, Clone)]
pub struct SimilarityQuery {
    pub limit: usize,
    pub min_similarity: f32,
    pub entity_types: Option<Vec<EntityType>>,
    /// Path-scoped restriction; forces the brute-force path (SQL pushdown).
    pub path_prefix: Option<String>,
    /// Drop results whose source file exceeds this size; stat failures retain.
    pub max_file_size: Option<u64>,
    pub ef: Option<usize>,
}

impl Default for SimilarityQuery {
    fn default() -> Self {
        Self {
            limit: 10,
            min_similarity: 0.0,
            entity_types: None,
            path_prefix: None,
            max_file_size: None,
            ef: None,
        }
    }
}

/// A single similarity hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityHit {
    pub entity_id: String,
    pub entity_type: String,
    pub similarity: f32,
}

/// Reason a retrieval result was produced under reduced guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedReason {
    VectorIndexEmpty,
    VectorIndexNull,
    DimensionMismatch,
    AutoRecoveredDimensionMismatch,
    BruteForceFallback,
}

impl DegradedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradedReason::VectorIndexEmpty => "vector_index_empty",
            DegradedReason::VectorIndexNull => "vector_index_null",
            DegradedReason::DimensionMismatch => "dimension_mismatch",
            DegradedReason::AutoRecoveredDimensionMismatch => "auto_recovered_dimension_mismatch",
            DegradedReason::BruteForceFallback => "brute_force_fallback",
        }
    }
}

/// Outcome of a similarity search: results plus an explicit degradation signal.
#[derive(Debug, Clone)]
pub struct SimilarityOutcome {
    pub results: Vec<SimilarityHit>,
    pub degraded: bool,
    pub degraded_reason: Option<DegradedReason>,
    pub cleared_mismatched_count: Option<u64>,
}

impl SimilarityOutcome {
    pub fn empty(reason: DegradedReason) -> Self {
        Self {
            results: Vec::new(),
            degraded: true,
            degraded_reason: Some(reason),
            cleared_mismatched_count: None,
        }
    }
}

/// Cached query-response row.
#[derive(Debug, Clone)]
pub struct CachedQuery {
    pub query_hash: String,
    pub query_params: String,
    pub response: String,
    pub created_at: String,
    pub last_accessed: String,
    pub access_count: u64,
}

/// Options for pruning the query cache.
#[derive(Debug, Clone, Copy)]
pub struct CachePruneOptions {
    pub max_age_ms: Option<u64>,
    pub max_entries: Option<u64>,
}

/// Exploration suggestion derived from centrality vs. query traffic.
#[derive(Debug, Clone)]
pub struct ExplorationSuggestion {
    pub entity_id: String,
    pub entity_type: String,
    pub centrality: f64,
    pub query_count: u64,
    pub exploration_value: f64,
    pub rationale: String,
}

/// Row-count summary across entity families.
#[derive(Debug, Clone, Default)]
pub struct StoreStatistics {
    pub functions: u64,
    pub modules: u64,
    pub files: u64,
    pub directories: u64,
    pub context_packs: u64,
    pub graph_edges: u64,
    pub embeddings: u64,
    pub evidence_entries: u64,
    pub change_log_entries: u64,
    pub coordination_version: u64,
    pub database_size_bytes: u64,
    pub embedding_dims: Vec<EmbeddingStat>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_clamp_band() {
        assert_eq!(clamp_confidence(0.0), CONFIDENCE_FLOOR);
        assert_eq!(clamp_confidence(1.0), CONFIDENCE_CEILING);
        assert_eq!(clamp_confidence(0.5), 0.5);
        assert_eq!(clamp_confidence(-3.0), CONFIDENCE_FLOOR);
    }

    #[test]
    fn test_event_type_round_trip() {
        for ty in [
            ChangeEventType::FileAdded,
            ChangeEventType::FileRemoved,
            ChangeEventType::FunctionUpdated,
        ] {
            assert_eq!(ChangeEventType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(ChangeEventType::parse("file_renamed"), None);
    }

    #[test]
    fn test_entity_type_parse() {
        assert_eq!(EntityType::parse("function"), Some(EntityType::Function));
        assert_eq!(EntityType::parse("widget"), None);
    }
}
