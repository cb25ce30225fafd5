//! Relational memory datastore.
//!
//! Entries, entity tags, relations and conflicts live in SQLite tables and
//! reference each other by opaque ids:
//!
//! - **memories**: scored, decaying entries with an edit lineage
//! - **entity_tags**: deduplicated on `(normalized_name, kind)`
//! - **relations**: unique on `(source, target, type)`, out-degree capped
//! - **conflicts**: pending until an explicit resolve/ignore action
//!
//! ## Example
//!
//! ```rust,ignore
//! use rmc_core::memory::{MemoryEntry, MemoryRelation, MemoryType, RelationType, Scope, SqliteMemoryStore};
//!
//! let store = SqliteMemoryStore::in_memory()?;
//! let scope = Scope::new("acme", "eng");
//!
//! let a = MemoryEntry::new(scope.clone(), MemoryType::Semantic, "Traffic doubled");
//! let b = MemoryEntry::new(scope, MemoryType::Semantic, "Latency spiked");
//! store.add_entry(&a)?;
//! store.add_entry(&b)?;
//!
//! let rel = MemoryRelation::new(a.id.clone(), b.id.clone(), RelationType::Causes, 0.9);
//! store.insert_relation(&rel, 10, 30.0, chrono::Utc::now())?;
//! ```

mod schema;
mod store;
mod types;

#[cfg(test)]
mod proptest;

pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub(crate) use store::{encode_metadata, fmt_ts, insert_entry_row, parse_ts};
pub(crate) use types::string_enum;
pub use store::{ConflictLogEntry, MemoryStats, RelationInsert, ScoreLogEntry, SqliteMemoryStore};
pub use types::{
    normalize_entity_name, ConflictId, ConflictKind, ConflictResolution, ConflictSeverity,
    ConflictStatus, ContentType, EntityId, EntityKind, EntityTag, ExtractedEntity, InferredBy,
    MemoryConflict, MemoryEntry, MemoryId, MemoryQuery, MemoryRelation, MemoryType, NewMemory,
    ProcessingState, Producer, ProducerKind, QualityTier, RelationId, RelationType, Scope,
    VersionTree,
};
