//! # rmc-core
//!
//! A relational memory engine: a hybrid vector + graph store for free-text
//! memories with entity extraction, typed relations, time-decayed quality
//! scoring, conflict detection and multi-hop inference paths.
//!
//! ## Core Components
//!
//! - **Memory**: SQLite datastore for entries, entity tags, relations and conflicts
//! - **Extract**: model or rule-based entity extraction
//! - **Relations**: candidate generation, coarse filtering and the degree cap
//! - **Scoring**: composite scores, decay, tiers and the archival sweep
//! - **Conflict**: structural and semantic contradiction detection
//! - **Retrieval**: vector search, graph expansion and inference paths
//! - **Pipeline**: durable job queue and worker pool for background enrichment
//!
//! ## Example
//!
//! ```rust,ignore
//! use rmc_core::{EngineConfig, MemoryType, NewMemory, RelationalMemory, RetrieveOptions, Scope};
//!
//! let memory = RelationalMemory::in_memory(EngineConfig::default())?;
//! let id = memory
//!     .create(NewMemory::new(Scope::new("acme", "eng"), MemoryType::Semantic, "Checkout latency doubled"))
//!     .await?;
//! memory.run_until_idle().await?;
//!
//! let result = memory.retrieve("checkout latency", &RetrieveOptions::for_org("acme")).await?;
//! assert_eq!(result.direct_matches[0].entry.id, id);
//! ```

pub mod config;
pub mod conflict;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod inference;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod relations;
pub mod retrieval;
pub mod scoring;

// Re-exports for convenience
pub use config::{
    ConflictConfig, EngineConfig, ExtractionConfig, HalfLives, PipelineConfig, RelationConfig,
    RetrievalConfig, ScoringConfig,
};
pub use conflict::ConflictDetector;
pub use embedding::{cosine_similarity, CachedEmbedder, Embedder, HashEmbedder};
pub use engine::{EngineStats, RelationalMemory};
pub use error::{Error, Result};
pub use extract::{EntityExtractor, Extraction, ExtractionStrategy, RuleExtractor};
pub use inference::{
    ArbitrationProposal, ContradictionVerdict, InferenceBackend, InferenceChain, ModelInference,
    RelationVerdict, RuleInference,
};
pub use llm::{AnthropicClient, ClientConfig, ClientEmbedder, LLMClient, OpenAIClient};
pub use memory::{
    ConflictId, ConflictKind, ConflictResolution, ConflictSeverity, ConflictStatus, EntityKind,
    EntityTag, MemoryConflict, MemoryEntry, MemoryId, MemoryRelation, MemoryType, NewMemory,
    ProcessingState, Producer, QualityTier, RelationType, Scope, SqliteMemoryStore, VersionTree,
};
pub use pipeline::{Pipeline, WorkerPool};
pub use queue::{Job, JobKind, JobQueue, JobStatus};
pub use relations::{RelationBuilder, RelationStats};
pub use retrieval::{
    InferencePath, MatchSource, PathKind, RetrievalResult, RetrieveOptions, Retriever,
    ScoredMemory,
};
pub use scoring::{ScoreBreakdown, ScoringEngine, SweepReport};
