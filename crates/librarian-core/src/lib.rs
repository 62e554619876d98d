//! Librarian Core - Embedded Knowledge Store Engine
//!
//! DESIGN DECISION: Three load-bearing subsystems behind one owned handle
//! WHY: Upstream indexers write structured knowledge, downstream assistants
//!      read it with low latency; everything in between (locking, migrations,
//!      vector search, evidence verification) lives behind KnowledgeStore
//!
//! REASONING CHAIN:
//! 1. Persistent storage layer: relational tables with evolutionary
//!    migrations, a single-writer process lock with stale-lock recovery, and
//!    a transactional mutation API with an optimistic-version change log
//! 2. HNSW vector index: on-disk, deterministically serialized graph for
//!    sub-linear top-k similarity, with brute-force fallback and
//!    dimension-mismatch self-healing
//! 3. Evidence verifier: content-hash plus fuzzy-window re-location keeping
//!    source-quoted claims anchored to live lines
//! 4. The store is embedded in the host process: no server, no replication,
//!    no query language; one writer per workspace enforced by the lock
//!
//! # Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       KnowledgeStore                          │
//! ├──────────────────┬──────────────────────┬─────────────────────┤
//! │  Entity Store    │  Vector Index        │  Evidence Verifier  │
//! │  (store/*)       │  (vector_index/*)    │  (evidence.rs)      │
//! ├──────────────────┴──────────────────────┴─────────────────────┤
//! │  Transactions + Change Log + Event Bus (store/transactions)   │
//! ├───────────────────────────────────────────────────────────────┤
//! │  Schema & Migrations │ Process Lock │ Recovery │ Redaction    │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Examples
//!
//! ```no_run
//! use librarian_core::{KnowledgeStore, StoreConfig};
//! use librarian_core::store::functions::FunctionDraft;
//!
//! let store = KnowledgeStore::open(StoreConfig::new("/path/to/workspace"))?;
//! let function = store.upsert_function(&FunctionDraft {
//!     file_path: "src/parse.ts".to_string(),
//!     name: "parse".to_string(),
//!     signature: "function parse(input: string): Ast".to_string(),
//!     purpose: "entry point of the parser".to_string(),
//!     start_line: 10,
//!     end_line: 42,
//!     behavior: Default::default(),
//!     effect_signature: vec![],
//!     confidence: 0.8,
//! })?;
//! println!("stored {}", function.id);
//! # Ok::<(), librarian_core::Error>(())
//! ```

pub mod canonical;
pub mod error;
pub mod evidence;
pub mod process_lock;
pub mod recovery;
pub mod redaction;
pub mod resource_policy;
pub mod schema;
pub mod store;
pub mod types;
pub mod vector_index;

pub use error::{Error, Result};
pub use store::{KnowledgeStore, StoreConfig};
pub use types::{
    ChangeEvent, ChangeEventType, ConfidenceTarget, ContextPack, DegradedReason, EntityType,
    EvidenceEntry, FunctionKnowledge, ModuleKnowledge, NewEvidence, SimilarityOutcome,
    SimilarityQuery,
};
pub use vector_index::{HnswMode, VectorIndex};
