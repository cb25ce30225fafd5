//! SQLite-backed memory store implementation.
//!
//! All graph invariants live here rather than in callers: relation uniqueness
//! is a table constraint and the outgoing degree cap is enforced by evicting
//! inside the same transaction as the insert, so concurrent workers cannot
//! leave a node over its cap.

use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::memory::schema::{initialize_schema, is_initialized};
use crate::memory::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::debug;

const ENTRY_COLUMNS: &str = "id, org_id, namespace, content_type, content, embedding, claim_key,
    claim_value, memory_type, confidence, base_score, composite_score, tier, producer_kind,
    producer_id, producer_reputation, created_at, last_accessed_at, usage_count, root_id,
    parent_id, version, archived, processing, metadata";

const RELATION_COLUMNS: &str =
    "id, source_id, target_id, relation_type, strength, reason, inferred_by, created_at";

const CONFLICT_COLUMNS: &str = "id, org_id, namespace, entry_a, entry_b, kind, claim_key,
    severity, status, reason, resolution, created_at, updated_at";

/// SQLite-backed memory store.
///
/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
}

/// Outcome of inserting a relation under the degree cap.
#[derive(Debug, Clone, Default)]
pub struct RelationInsert {
    /// Whether the new (or upserted) edge survived eviction
    pub stored: bool,
    /// Whether an edge with the same key already existed
    pub merged: bool,
    /// Edges removed to keep the source under its cap
    pub evicted: Vec<MemoryRelation>,
}

impl SqliteMemoryStore {
    /// Open or create a memory store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::MemoryStorage(e.to_string()))?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::MemoryStorage(e.to_string()))?;
        }
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| Error::MemoryStorage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::MemoryStorage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::MemoryStorage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::MemoryStorage(e.to_string()))
    }

    /// Like `with_conn` but the closure may fail with a crate error.
    fn try_with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn)
    }

    // ==================== Entry Operations ====================

    /// Add an entry to the store.
    pub fn add_entry(&self, entry: &MemoryEntry) -> Result<()> {
        let metadata = encode_metadata(entry)?;
        self.with_conn(|conn| insert_entry_row(conn, entry, metadata.as_deref()))
    }

    /// Get an entry by ID.
    pub fn get_entry(&self, id: &MemoryId) -> Result<Option<MemoryEntry>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM memories WHERE id = ?1", ENTRY_COLUMNS),
                params![id.to_string()],
                row_to_entry,
            )
            .optional()
        })
    }

    /// Get an entry or fail with `NotFound`.
    pub fn require_entry(&self, id: &MemoryId) -> Result<MemoryEntry> {
        self.get_entry(id)?
            .ok_or_else(|| Error::not_found("memory", id))
    }

    /// Fetch several entries, preserving the order of `ids` and skipping unknown ones.
    pub fn get_entries(&self, ids: &[MemoryId]) -> Result<Vec<MemoryEntry>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.get_entry(id)? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Query entries.
    pub fn query_entries(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>> {
        self.with_conn(|conn| {
            let mut sql = format!("SELECT {} FROM memories WHERE 1=1", ENTRY_COLUMNS);
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(ref org) = query.org_id {
                sql.push_str(" AND org_id = ?");
                params_vec.push(Box::new(org.clone()));
            }
            if let Some(ref ns) = query.namespace {
                sql.push_str(" AND namespace = ?");
                params_vec.push(Box::new(ns.clone()));
            }
            if let Some(ref types) = query.memory_types {
                let placeholders: Vec<&str> = types.iter().map(|_| "?").collect();
                sql.push_str(&format!(" AND memory_type IN ({})", placeholders.join(",")));
                for t in types {
                    params_vec.push(Box::new(t.as_str()));
                }
            }
            if let Some(ref tiers) = query.tiers {
                let placeholders: Vec<&str> = tiers.iter().map(|_| "?").collect();
                sql.push_str(&format!(" AND tier IN ({})", placeholders.join(",")));
                for t in tiers {
                    params_vec.push(Box::new(*t as i32));
                }
            }
            if let Some(state) = query.processing {
                sql.push_str(" AND processing = ?");
                params_vec.push(Box::new(state.as_str()));
            }
            if !query.include_archived {
                sql.push_str(" AND archived = 0");
            }
            if let Some(min_conf) = query.min_confidence {
                sql.push_str(" AND confidence >= ?");
                params_vec.push(Box::new(min_conf));
            }

            if let Some(ref after) = query.after_id {
                sql.push_str(" AND id > ?");
                params_vec.push(Box::new(after.to_string()));
            }

            if query.by_id {
                sql.push_str(" ORDER BY id ASC");
            } else {
                sql.push_str(" ORDER BY last_accessed_at DESC, id ASC");
            }

            if let Some(limit) = query.limit {
                sql.push_str(&format!(" LIMIT {}", limit));
                if let Some(offset) = query.offset {
                    sql.push_str(&format!(" OFFSET {}", offset));
                }
            }

            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();

            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(params_refs.as_slice(), row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// Entries in `scope` asserting a different value for `claim_key`.
    pub fn find_claim_collisions(
        &self,
        scope: &Scope,
        claim_key: &str,
        claim_value: &str,
        exclude: &MemoryId,
    ) -> Result<Vec<MemoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM memories
                 WHERE org_id = ?1 AND namespace = ?2 AND claim_key = ?3 AND id != ?4
                   AND LOWER(TRIM(claim_value)) != LOWER(TRIM(?5)) AND archived = 0
                 ORDER BY created_at ASC, id ASC",
                ENTRY_COLUMNS
            ))?;
            let entries = stmt
                .query_map(
                    params![
                        scope.org_id,
                        scope.namespace,
                        claim_key,
                        exclude.to_string(),
                        claim_value
                    ],
                    row_to_entry,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// Entries in the same org sharing `claim_key`, regardless of value or namespace.
    pub fn find_by_claim_key(&self, org_id: &str, claim_key: &str) -> Result<Vec<MemoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM memories WHERE org_id = ?1 AND claim_key = ?2 AND archived = 0
                 ORDER BY created_at ASC, id ASC",
                ENTRY_COLUMNS
            ))?;
            let entries = stmt
                .query_map(params![org_id, claim_key], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// Entries in `scope` created within `[from, to]`, excluding `exclude`.
    pub fn entries_in_window(
        &self,
        scope: &Scope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        exclude: &MemoryId,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM memories
                 WHERE org_id = ?1 AND namespace = ?2 AND id != ?3 AND archived = 0
                   AND created_at >= ?4 AND created_at <= ?5
                 ORDER BY created_at DESC, id ASC LIMIT ?6",
                ENTRY_COLUMNS
            ))?;
            let entries = stmt
                .query_map(
                    params![
                        scope.org_id,
                        scope.namespace,
                        exclude.to_string(),
                        fmt_ts(from),
                        fmt_ts(to),
                        limit as i64
                    ],
                    row_to_entry,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// Exhaustive cosine scan over stored embeddings.
    ///
    /// Returns up to `k` `(id, similarity)` pairs with similarity ≥ `min_similarity`,
    /// ordered by similarity descending then id.
    pub fn vector_search(
        &self,
        query: &[f32],
        org_id: &str,
        namespace: Option<&str>,
        k: usize,
        min_similarity: f64,
        include_archived: bool,
    ) -> Result<Vec<(MemoryId, f64)>> {
        let rows: Vec<(String, Vec<u8>)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, embedding FROM memories
                 WHERE org_id = ?1 AND (?2 IS NULL OR namespace = ?2)
                   AND embedding IS NOT NULL AND (?3 = 1 OR archived = 0)",
            )?;
            let rows = stmt
                .query_map(params![org_id, namespace, include_archived], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut scored: Vec<(MemoryId, f64)> = Vec::new();
        for (id, blob) in rows {
            let embedding = decode_embedding(&blob);
            if embedding.len() != query.len() {
                continue;
            }
            let sim = cosine_similarity(query, &embedding);
            if sim >= min_similarity {
                let id = MemoryId::parse(&id)
                    .map_err(|e| Error::MemoryStorage(format!("bad memory id {}: {}", id, e)))?;
                scored.push((id, sim));
            }
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    /// Entries the vector scan cannot see, for keyword matching.
    pub fn entries_without_embedding(
        &self,
        org_id: &str,
        namespace: Option<&str>,
        include_archived: bool,
    ) -> Result<Vec<MemoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM memories
                 WHERE org_id = ?1 AND (?2 IS NULL OR namespace = ?2)
                   AND embedding IS NULL AND (?3 = 1 OR archived = 0)
                 ORDER BY id ASC",
                ENTRY_COLUMNS
            ))?;
            let entries = stmt
                .query_map(params![org_id, namespace, include_archived], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// Attach or replace an entry's embedding.
    pub fn set_embedding(&self, id: &MemoryId, embedding: &[f32]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memories SET embedding = ?2, version = version + 1 WHERE id = ?1",
                params![id.to_string(), encode_embedding(embedding)],
            )?;
            Ok(())
        })
    }

    /// Update the enrichment state of an entry.
    pub fn set_processing(&self, id: &MemoryId, state: ProcessingState) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memories SET processing = ?2 WHERE id = ?1",
                params![id.to_string(), state.as_str()],
            )?;
            Ok(())
        })
    }

    /// Reinforce entries surfaced by retrieval: reset the decay clock and count the use.
    pub fn record_access(&self, ids: &[MemoryId], now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut touched = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE memories SET last_accessed_at = ?2, usage_count = usage_count + 1,
                            version = version + 1
                     WHERE id = ?1",
                )?;
                for id in ids {
                    touched += stmt.execute(params![id.to_string(), fmt_ts(now)])?;
                }
            }
            tx.commit()?;
            Ok(touched)
        })
    }

    /// Compare-and-swap score update.
    ///
    /// Applies only if the stored version still equals `expected_version`;
    /// returns `false` when a concurrent access bump won the race.
    pub fn update_scores(
        &self,
        id: &MemoryId,
        expected_version: i64,
        base_score: f64,
        composite_score: f64,
        tier: QualityTier,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE memories SET base_score = ?3, composite_score = ?4, tier = ?5,
                        version = version + 1
                 WHERE id = ?1 AND version = ?2",
                params![
                    id.to_string(),
                    expected_version,
                    base_score,
                    composite_score,
                    tier as i32
                ],
            )?;
            Ok(rows == 1)
        })
    }

    /// Mark an entry archived. Archived entries are kept but hidden from default queries.
    pub fn archive(&self, id: &MemoryId, reason: &str) -> Result<bool> {
        let entry = self.require_entry(id)?;
        if entry.archived {
            return Ok(false);
        }
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memories SET archived = 1, version = version + 1 WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(())
        })?;
        self.log_score(
            id,
            "archive",
            Some(entry.tier),
            Some(entry.tier),
            entry.composite_score,
            reason,
        )?;
        Ok(true)
    }

    /// All entries of a lineage, oldest first.
    pub fn get_lineage(&self, root_id: &MemoryId) -> Result<Vec<MemoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM memories WHERE root_id = ?1 ORDER BY created_at ASC, id ASC",
                ENTRY_COLUMNS
            ))?;
            let entries = stmt
                .query_map(params![root_id.to_string()], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// Build the version tree rooted at `root_id`.
    pub fn get_version_tree(&self, root_id: &MemoryId) -> Result<VersionTree> {
        let lineage = self.get_lineage(root_id)?;
        let root = lineage
            .iter()
            .find(|e| &e.id == root_id)
            .cloned()
            .ok_or_else(|| Error::not_found("version root", root_id))?;

        let mut children: HashMap<MemoryId, Vec<MemoryEntry>> = HashMap::new();
        for entry in lineage {
            if let Some(ref parent) = entry.parent_id {
                children.entry(parent.clone()).or_default().push(entry);
            }
        }

        fn build(entry: MemoryEntry, children: &mut HashMap<MemoryId, Vec<MemoryEntry>>) -> VersionTree {
            let kids = children.remove(&entry.id).unwrap_or_default();
            VersionTree {
                entry,
                children: kids.into_iter().map(|k| build(k, children)).collect(),
            }
        }

        Ok(build(root, &mut children))
    }

    /// The chain from `entry_id` back to its root, newest first.
    pub fn get_version_history(&self, entry_id: &MemoryId) -> Result<Vec<MemoryEntry>> {
        let mut history = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(entry_id.clone());

        while let Some(id) = cursor {
            if !seen.insert(id.clone()) {
                return Err(Error::Internal(format!("version cycle at {}", id)));
            }
            let entry = self.require_entry(&id)?;
            cursor = entry.parent_id.clone();
            history.push(entry);
        }

        Ok(history)
    }

    // ==================== Entity Operations ====================

    /// Persist an extraction for `memory_id`.
    ///
    /// Tags are upserted on `(normalized_name, kind)`; `mention_count` rises only
    /// when this entry is newly linked to the tag, so re-extraction is idempotent.
    pub fn record_extraction(
        &self,
        memory_id: &MemoryId,
        entities: &[ExtractedEntity],
        concepts: &[String],
        topics: &[String],
    ) -> Result<Vec<EntityTag>> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let now = fmt_ts(Utc::now());
            let mut tags = Vec::new();

            for entity in entities {
                let normalized = entity.normalized_name();
                if normalized.is_empty() {
                    continue;
                }
                tx.execute(
                    "INSERT OR IGNORE INTO entity_tags
                        (id, name, kind, normalized_name, confidence, mention_count, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                    params![
                        EntityId::new().to_string(),
                        entity.name,
                        entity.kind.as_str(),
                        normalized,
                        entity.confidence,
                        now
                    ],
                )?;
                let entity_id: String = tx.query_row(
                    "SELECT id FROM entity_tags WHERE normalized_name = ?1 AND kind = ?2",
                    params![normalized, entity.kind.as_str()],
                    |row| row.get(0),
                )?;
                let linked = tx.execute(
                    "INSERT OR IGNORE INTO memory_entities (memory_id, entity_id, confidence)
                     VALUES (?1, ?2, ?3)",
                    params![memory_id.to_string(), entity_id, entity.confidence],
                )?;
                if linked == 1 {
                    tx.execute(
                        "UPDATE entity_tags SET mention_count = mention_count + 1,
                                confidence = MAX(confidence, ?2)
                         WHERE id = ?1",
                        params![entity_id, entity.confidence],
                    )?;
                }
                let tag = tx.query_row(
                    "SELECT id, name, kind, normalized_name, confidence, mention_count, created_at
                     FROM entity_tags WHERE id = ?1",
                    params![entity_id],
                    row_to_entity,
                )?;
                tags.push(tag);
            }

            for (labels, is_topic) in [(concepts, false), (topics, true)] {
                for label in labels {
                    let label = label.trim().to_lowercase();
                    if label.is_empty() {
                        continue;
                    }
                    tx.execute(
                        "INSERT OR IGNORE INTO memory_concepts (memory_id, label, is_topic)
                         VALUES (?1, ?2, ?3)",
                        params![memory_id.to_string(), label, is_topic],
                    )?;
                }
            }

            tx.commit()?;
            Ok(tags)
        })
    }

    /// Look up a tag by its dedup key.
    pub fn get_entity(&self, name: &str, kind: EntityKind) -> Result<Option<EntityTag>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, kind, normalized_name, confidence, mention_count, created_at
                 FROM entity_tags WHERE normalized_name = ?1 AND kind = ?2",
                params![normalize_entity_name(name), kind.as_str()],
                row_to_entity,
            )
            .optional()
        })
    }

    /// Tags linked to an entry.
    pub fn entities_for_memory(&self, memory_id: &MemoryId) -> Result<Vec<EntityTag>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id, t.name, t.kind, t.normalized_name, t.confidence, t.mention_count,
                        t.created_at
                 FROM entity_tags t JOIN memory_entities me ON me.entity_id = t.id
                 WHERE me.memory_id = ?1
                 ORDER BY t.normalized_name, t.kind",
            )?;
            let tags = stmt
                .query_map(params![memory_id.to_string()], row_to_entity)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tags)
        })
    }

    /// Concept (`topics == false`) or topic labels of an entry.
    pub fn labels_for_memory(&self, memory_id: &MemoryId, topics: bool) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT label FROM memory_concepts WHERE memory_id = ?1 AND is_topic = ?2
                 ORDER BY label",
            )?;
            let labels = stmt
                .query_map(params![memory_id.to_string(), topics], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(labels)
        })
    }

    /// Entries in the same scope sharing at least `min_overlap` entity tags with `memory_id`.
    pub fn entity_overlap_candidates(
        &self,
        memory_id: &MemoryId,
        scope: &Scope,
        min_overlap: usize,
        limit: usize,
    ) -> Result<Vec<(MemoryId, usize)>> {
        let rows: Vec<(String, i64)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT me2.memory_id, COUNT(*) AS shared
                 FROM memory_entities me1
                 JOIN memory_entities me2 ON me1.entity_id = me2.entity_id
                 JOIN memories m ON m.id = me2.memory_id
                 WHERE me1.memory_id = ?1 AND me2.memory_id != ?1
                   AND m.org_id = ?2 AND m.namespace = ?3 AND m.archived = 0
                 GROUP BY me2.memory_id
                 HAVING COUNT(*) >= ?4
                 ORDER BY shared DESC, me2.memory_id ASC
                 LIMIT ?5",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        memory_id.to_string(),
                        scope.org_id,
                        scope.namespace,
                        min_overlap as i64,
                        limit as i64
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(id, shared)| {
                MemoryId::parse(&id)
                    .map(|id| (id, shared as usize))
                    .map_err(|e| Error::MemoryStorage(format!("bad memory id {}: {}", id, e)))
            })
            .collect()
    }

    /// Number of entity tags two entries share.
    pub fn shared_entity_count(&self, a: &MemoryId, b: &MemoryId) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memory_entities me1
                 JOIN memory_entities me2 ON me1.entity_id = me2.entity_id
                 WHERE me1.memory_id = ?1 AND me2.memory_id = ?2",
                params![a.to_string(), b.to_string()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    // ==================== Relation Operations ====================

    /// Insert or strengthen a relation, then evict the source's weakest edges
    /// until it is back under `max_out_degree`.
    ///
    /// Eviction order is `strength × time_decay_weight` ascending, then oldest
    /// `created_at`, then id, so the surviving set is deterministic.
    pub fn insert_relation(
        &self,
        relation: &MemoryRelation,
        max_out_degree: usize,
        decay_half_life_days: f64,
        now: DateTime<Utc>,
    ) -> Result<RelationInsert> {
        if relation.source_id == relation.target_id {
            return Err(Error::malformed("relation endpoints must differ"));
        }

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM relations
                     WHERE source_id = ?1 AND target_id = ?2 AND relation_type = ?3",
                    params![
                        relation.source_id.to_string(),
                        relation.target_id.to_string(),
                        relation.relation_type.as_str()
                    ],
                    |row| row.get(0),
                )
                .optional()?;

            let key_id = match existing {
                Some(ref id) => {
                    tx.execute(
                        "UPDATE relations SET
                            inferred_by = CASE WHEN ?2 >= strength THEN ?3 ELSE inferred_by END,
                            reason = CASE WHEN ?2 >= strength THEN COALESCE(?4, reason) ELSE reason END,
                            strength = MAX(strength, ?2)
                         WHERE id = ?1",
                        params![
                            id,
                            relation.strength,
                            relation.inferred_by.as_str(),
                            relation.reason
                        ],
                    )?;
                    id.clone()
                }
                None => {
                    tx.execute(
                        &format!(
                            "INSERT INTO relations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                            RELATION_COLUMNS
                        ),
                        params![
                            relation.id.to_string(),
                            relation.source_id.to_string(),
                            relation.target_id.to_string(),
                            relation.relation_type.as_str(),
                            relation.strength,
                            relation.reason,
                            relation.inferred_by.as_str(),
                            fmt_ts(relation.created_at),
                        ],
                    )?;
                    relation.id.to_string()
                }
            };

            let mut outgoing = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM relations WHERE source_id = ?1",
                    RELATION_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![relation.source_id.to_string()], row_to_relation)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            let mut evicted = Vec::new();
            if outgoing.len() > max_out_degree {
                sort_for_eviction(&mut outgoing, now, decay_half_life_days);
                let excess = outgoing.len() - max_out_degree;
                for victim in outgoing.drain(..excess) {
                    tx.execute(
                        "DELETE FROM relations WHERE id = ?1",
                        params![victim.id.to_string()],
                    )?;
                    evicted.push(victim);
                }
            }

            tx.commit()?;

            let stored = !evicted.iter().any(|e| e.id.to_string() == key_id);
            if !evicted.is_empty() {
                debug!(
                    source = %relation.source_id,
                    evicted = evicted.len(),
                    cap = max_out_degree,
                    "Evicted weakest relations over degree cap"
                );
            }

            Ok(RelationInsert {
                stored,
                merged: existing.is_some(),
                evicted,
            })
        })
    }

    /// Outgoing edges of a node, optionally restricted to `types`.
    pub fn outgoing_relations(
        &self,
        id: &MemoryId,
        types: Option<&[RelationType]>,
    ) -> Result<Vec<MemoryRelation>> {
        self.relations_where("source_id", id, types)
    }

    /// Incoming edges of a node, optionally restricted to `types`.
    pub fn incoming_relations(
        &self,
        id: &MemoryId,
        types: Option<&[RelationType]>,
    ) -> Result<Vec<MemoryRelation>> {
        self.relations_where("target_id", id, types)
    }

    fn relations_where(
        &self,
        column: &'static str,
        id: &MemoryId,
        types: Option<&[RelationType]>,
    ) -> Result<Vec<MemoryRelation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM relations WHERE {} = ?1 ORDER BY strength DESC, id ASC",
                RELATION_COLUMNS, column
            ))?;
            let rels = stmt
                .query_map(params![id.to_string()], row_to_relation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(match types {
                Some(types) => rels
                    .into_iter()
                    .filter(|r| types.contains(&r.relation_type))
                    .collect(),
                None => rels,
            })
        })
    }

    /// Number of outgoing edges.
    pub fn out_degree(&self, id: &MemoryId) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM relations WHERE source_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    /// Strongest relations of one type across the store.
    pub fn strongest_relations(
        &self,
        relation_type: RelationType,
        limit: usize,
    ) -> Result<Vec<MemoryRelation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM relations WHERE relation_type = ?1
                 ORDER BY strength DESC, id ASC LIMIT ?2",
                RELATION_COLUMNS
            ))?;
            let rels = stmt
                .query_map(params![relation_type.as_str(), limit as i64], row_to_relation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rels)
        })
    }

    // ==================== Conflict Operations ====================

    /// Persist a conflict. Returns `false` if the same pair/kind is already recorded.
    pub fn insert_conflict(&self, conflict: &MemoryConflict) -> Result<bool> {
        self.try_with_conn(|conn| {
            let resolution = conflict
                .resolution
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let tx = conn.unchecked_transaction()?;
            let inserted = tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO conflicts ({}) VALUES
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    CONFLICT_COLUMNS
                ),
                params![
                    conflict.id.to_string(),
                    conflict.scope.org_id,
                    conflict.scope.namespace,
                    conflict.entry_a.to_string(),
                    conflict.entry_b.to_string(),
                    conflict.kind.as_str(),
                    conflict.claim_key,
                    conflict.severity.as_str(),
                    conflict.status.as_str(),
                    conflict.reason,
                    resolution,
                    fmt_ts(conflict.created_at),
                    fmt_ts(conflict.updated_at),
                ],
            )?;
            if inserted == 1 {
                log_conflict_action(&tx, &conflict.id, "created", "detector", conflict.reason.as_deref())?;
            }
            tx.commit()?;
            Ok(inserted == 1)
        })
    }

    /// Get a conflict by ID.
    pub fn get_conflict(&self, id: &ConflictId) -> Result<Option<MemoryConflict>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM conflicts WHERE id = ?1", CONFLICT_COLUMNS),
                params![id.to_string()],
                row_to_conflict,
            )
            .optional()
        })
    }

    /// Conflicts in an org, optionally narrowed to a namespace and status.
    pub fn list_conflicts(
        &self,
        org_id: &str,
        namespace: Option<&str>,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<MemoryConflict>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM conflicts
                 WHERE org_id = ?1 AND (?2 IS NULL OR namespace = ?2) AND (?3 IS NULL OR status = ?3)
                 ORDER BY created_at ASC, id ASC",
                CONFLICT_COLUMNS
            ))?;
            let conflicts = stmt
                .query_map(
                    params![org_id, namespace, status.map(|s| s.as_str())],
                    row_to_conflict,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(conflicts)
        })
    }

    /// Conflicts involving an entry.
    pub fn conflicts_for_memory(&self, id: &MemoryId) -> Result<Vec<MemoryConflict>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM conflicts WHERE entry_a = ?1 OR entry_b = ?1
                 ORDER BY created_at ASC, id ASC",
                CONFLICT_COLUMNS
            ))?;
            let conflicts = stmt
                .query_map(params![id.to_string()], row_to_conflict)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(conflicts)
        })
    }

    /// Move a pending conflict to `status`, recording the action in the audit log.
    pub fn transition_conflict(
        &self,
        id: &ConflictId,
        status: ConflictStatus,
        resolution: Option<&ConflictResolution>,
        actor: &str,
    ) -> Result<MemoryConflict> {
        let current = self
            .get_conflict(id)?
            .ok_or_else(|| Error::not_found("conflict", id))?;
        if current.status != ConflictStatus::Pending {
            return Err(Error::InvalidTransition(format!(
                "conflict {} is {}, only pending conflicts can become {}",
                id, current.status, status
            )));
        }
        if status == ConflictStatus::Pending {
            return Err(Error::InvalidTransition("conflict is already pending".into()));
        }
        if let Some(winner) = resolution.and_then(|r| r.winner_id.as_ref()) {
            if !current.involves(winner) {
                return Err(Error::malformed(format!(
                    "winner {} is not part of conflict {}",
                    winner, id
                )));
            }
        }

        self.try_with_conn(|conn| {
            let resolution_json = resolution.map(serde_json::to_string).transpose()?;
            let tx = conn.unchecked_transaction()?;
            let rows = tx.execute(
                "UPDATE conflicts SET status = ?2, resolution = COALESCE(?3, resolution),
                        updated_at = ?4
                 WHERE id = ?1 AND status = 'pending'",
                params![
                    id.to_string(),
                    status.as_str(),
                    resolution_json,
                    fmt_ts(Utc::now())
                ],
            )?;
            if rows == 0 {
                return Err(Error::InvalidTransition(format!(
                    "conflict {} changed concurrently",
                    id
                )));
            }
            let detail = resolution.map(|r| r.reason.as_str());
            log_conflict_action(&tx, id, status.as_str(), actor, detail)?;
            tx.commit()?;
            Ok(())
        })?;

        self.get_conflict(id)?
            .ok_or_else(|| Error::not_found("conflict", id))
    }

    /// Audit trail of a conflict, oldest first.
    pub fn conflict_log(&self, id: &ConflictId) -> Result<Vec<ConflictLogEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT action, actor, detail, created_at FROM conflict_log
                 WHERE conflict_id = ?1 ORDER BY id ASC",
            )?;
            let entries = stmt
                .query_map(params![id.to_string()], |row| {
                    Ok(ConflictLogEntry {
                        action: row.get(0)?,
                        actor: row.get(1)?,
                        detail: row.get(2)?,
                        timestamp: parse_ts(row, 3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    // ==================== Score Log ====================

    /// Record a tier change or archival.
    pub fn log_score(
        &self,
        memory_id: &MemoryId,
        operation: &str,
        from_tier: Option<QualityTier>,
        to_tier: Option<QualityTier>,
        score: f64,
        reason: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO score_log (memory_id, operation, from_tier, to_tier, score, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    memory_id.to_string(),
                    operation,
                    from_tier.map(|t| t as i32),
                    to_tier.map(|t| t as i32),
                    score,
                    reason,
                    fmt_ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    /// Score history for an entry, newest first.
    pub fn score_history(&self, memory_id: &MemoryId) -> Result<Vec<ScoreLogEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT operation, from_tier, to_tier, score, reason, created_at
                 FROM score_log WHERE memory_id = ?1 ORDER BY id DESC",
            )?;
            let entries = stmt
                .query_map(params![memory_id.to_string()], |row| {
                    Ok(ScoreLogEntry {
                        operation: row.get(0)?,
                        from_tier: row.get::<_, Option<i32>>(1)?.map(QualityTier::from_i32),
                        to_tier: row.get::<_, Option<i32>>(2)?.map(QualityTier::from_i32),
                        score: row.get(3)?,
                        reason: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        timestamp: parse_ts(row, 5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// Get statistics about the memory store.
    pub fn stats(&self) -> Result<MemoryStats> {
        self.with_conn(|conn| {
            let total_entries: i64 =
                conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
            let archived_entries: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE archived = 1",
                [],
                |row| row.get(0),
            )?;

            let entries_by_tier: HashMap<QualityTier, i64> = {
                let mut stmt =
                    conn.prepare("SELECT tier, COUNT(*) FROM memories GROUP BY tier")?;
                let rows = stmt.query_map([], |row| {
                    Ok((QualityTier::from_i32(row.get(0)?), row.get(1)?))
                })?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let entries_by_type: HashMap<MemoryType, i64> = {
                let mut stmt =
                    conn.prepare("SELECT memory_type, COUNT(*) FROM memories GROUP BY memory_type")?;
                let rows = stmt.query_map([], |row| Ok((parse_col(row, 0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let relations_by_type: HashMap<RelationType, i64> = {
                let mut stmt = conn.prepare(
                    "SELECT relation_type, COUNT(*) FROM relations GROUP BY relation_type",
                )?;
                let rows = stmt.query_map([], |row| Ok((parse_col(row, 0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let conflicts_by_status: HashMap<ConflictStatus, i64> = {
                let mut stmt =
                    conn.prepare("SELECT status, COUNT(*) FROM conflicts GROUP BY status")?;
                let rows = stmt.query_map([], |row| Ok((parse_col(row, 0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let total_entities: i64 =
                conn.query_row("SELECT COUNT(*) FROM entity_tags", [], |row| row.get(0))?;

            Ok(MemoryStats {
                total_entries: total_entries as u64,
                archived_entries: archived_entries as u64,
                entries_by_tier,
                entries_by_type,
                total_relations: relations_by_type.values().sum::<i64>() as u64,
                relations_by_type,
                total_entities: total_entities as u64,
                conflicts_by_status,
            })
        })
    }
}

fn log_conflict_action(
    conn: &Connection,
    id: &ConflictId,
    action: &str,
    actor: &str,
    detail: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO conflict_log (conflict_id, action, actor, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id.to_string(), action, actor, detail, fmt_ts(Utc::now())],
    )?;
    Ok(())
}

/// Weakest first; ties go to the oldest edge, then the smallest id.
pub(crate) fn sort_for_eviction(
    relations: &mut [MemoryRelation],
    now: DateTime<Utc>,
    half_life_days: f64,
) {
    relations.sort_by(|a, b| {
        a.effective_weight(now, half_life_days)
            .total_cmp(&b.effective_weight(now, half_life_days))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Entry in the score log.
#[derive(Debug, Clone)]
pub struct ScoreLogEntry {
    pub operation: String,
    pub from_tier: Option<QualityTier>,
    pub to_tier: Option<QualityTier>,
    pub score: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Entry in a conflict's audit trail.
#[derive(Debug, Clone)]
pub struct ConflictLogEntry {
    pub action: String,
    pub actor: String,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Statistics about the memory store.
#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub total_entries: u64,
    pub archived_entries: u64,
    pub entries_by_tier: HashMap<QualityTier, i64>,
    pub entries_by_type: HashMap<MemoryType, i64>,
    pub total_relations: u64,
    pub relations_by_type: HashMap<RelationType, i64>,
    pub total_entities: u64,
    pub conflicts_by_status: HashMap<ConflictStatus, i64>,
}

// ==================== Row Mapping ====================

/// Fixed-width UTC timestamps so lexical order in SQLite matches time order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_col<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = Error>,
{
    let s: String = row.get(idx)?;
    s.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_id<T, F>(row: &Row, idx: usize, parse: F) -> rusqlite::Result<T>
where
    F: Fn(&str) -> std::result::Result<T, uuid::Error>,
{
    let s: String = row.get(idx)?;
    parse(&s).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub(crate) fn encode_metadata(entry: &MemoryEntry) -> Result<Option<String>> {
    Ok(entry.metadata.as_ref().map(serde_json::to_string).transpose()?)
}

/// Insert one `memories` row; callers own the transaction.
pub(crate) fn insert_entry_row(
    conn: &Connection,
    entry: &MemoryEntry,
    metadata: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO memories ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
             ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
            ENTRY_COLUMNS
        ),
        params![
            entry.id.to_string(),
            entry.scope.org_id,
            entry.scope.namespace,
            entry.content_type.as_str(),
            entry.content,
            entry.embedding.as_deref().map(encode_embedding),
            entry.claim_key,
            entry.claim_value,
            entry.memory_type.as_str(),
            entry.confidence,
            entry.base_score,
            entry.composite_score,
            entry.tier as i32,
            entry.producer.kind.as_str(),
            entry.producer.id,
            entry.producer.reputation,
            fmt_ts(entry.created_at),
            fmt_ts(entry.last_accessed_at),
            entry.usage_count as i64,
            entry.root_id.to_string(),
            entry.parent_id.as_ref().map(|p| p.to_string()),
            entry.version,
            entry.archived,
            entry.processing.as_str(),
            metadata,
        ],
    )?;
    Ok(())
}

fn row_to_entry(row: &Row) -> rusqlite::Result<MemoryEntry> {
    let metadata: Option<HashMap<String, Value>> = row
        .get::<_, Option<String>>(24)?
        .and_then(|s| serde_json::from_str(&s).ok());

    Ok(MemoryEntry {
        id: parse_id(row, 0, MemoryId::parse)?,
        scope: Scope::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
        content_type: parse_col(row, 3)?,
        content: row.get(4)?,
        embedding: row
            .get::<_, Option<Vec<u8>>>(5)?
            .map(|bytes| decode_embedding(&bytes)),
        claim_key: row.get(6)?,
        claim_value: row.get(7)?,
        memory_type: parse_col(row, 8)?,
        confidence: row.get(9)?,
        base_score: row.get(10)?,
        composite_score: row.get(11)?,
        tier: QualityTier::from_i32(row.get(12)?),
        producer: Producer {
            kind: parse_col(row, 13)?,
            id: row.get(14)?,
            reputation: row.get(15)?,
        },
        created_at: parse_ts(row, 16)?,
        last_accessed_at: parse_ts(row, 17)?,
        usage_count: row.get::<_, i64>(18)? as u64,
        root_id: parse_id(row, 19, MemoryId::parse)?,
        parent_id: match row.get::<_, Option<String>>(20)? {
            Some(_) => Some(parse_id(row, 20, MemoryId::parse)?),
            None => None,
        },
        version: row.get(21)?,
        archived: row.get(22)?,
        processing: parse_col(row, 23)?,
        metadata,
    })
}

fn row_to_entity(row: &Row) -> rusqlite::Result<EntityTag> {
    Ok(EntityTag {
        id: parse_id(row, 0, EntityId::parse)?,
        name: row.get(1)?,
        kind: parse_col(row, 2)?,
        normalized_name: row.get(3)?,
        confidence: row.get(4)?,
        mention_count: row.get::<_, i64>(5)? as u64,
        created_at: parse_ts(row, 6)?,
    })
}

fn row_to_relation(row: &Row) -> rusqlite::Result<MemoryRelation> {
    Ok(MemoryRelation {
        id: parse_id(row, 0, RelationId::parse)?,
        source_id: parse_id(row, 1, MemoryId::parse)?,
        target_id: parse_id(row, 2, MemoryId::parse)?,
        relation_type: parse_col(row, 3)?,
        strength: row.get(4)?,
        reason: row.get(5)?,
        inferred_by: parse_col(row, 6)?,
        created_at: parse_ts(row, 7)?,
    })
}

fn row_to_conflict(row: &Row) -> rusqlite::Result<MemoryConflict> {
    let resolution: Option<ConflictResolution> = match row.get::<_, Option<String>>(10)? {
        Some(s) => Some(serde_json::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(MemoryConflict {
        id: parse_id(row, 0, ConflictId::parse)?,
        scope: Scope::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
        entry_a: parse_id(row, 3, MemoryId::parse)?,
        entry_b: parse_id(row, 4, MemoryId::parse)?,
        kind: parse_col(row, 5)?,
        claim_key: row.get(6)?,
        severity: parse_col(row, 7)?,
        status: parse_col(row, 8)?,
        reason: row.get(9)?,
        resolution,
        created_at: parse_ts(row, 11)?,
        updated_at: parse_ts(row, 12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn scope() -> Scope {
        Scope::new("acme", "eng")
    }

    fn entry(content: &str) -> MemoryEntry {
        MemoryEntry::new(scope(), MemoryType::Semantic, content)
    }

    #[test]
    fn test_add_and_get_entry() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let e = entry("Test fact")
            .with_claim("db", "Postgres")
            .with_embedding(vec![0.1, 0.2, 0.3])
            .with_metadata("source", "unit");

        store.add_entry(&e).unwrap();
        let got = store.get_entry(&e.id).unwrap().unwrap();

        assert_eq!(got.content, "Test fact");
        assert_eq!(got.claim_key.as_deref(), Some("db"));
        assert_eq!(got.embedding, Some(vec![0.1, 0.2, 0.3]));
        assert_eq!(got.root_id, e.id);
        assert_eq!(got.processing, ProcessingState::Pending);
        assert_eq!(fmt_ts(got.created_at), fmt_ts(e.created_at));
        assert_eq!(got.metadata, e.metadata);
        assert_eq!(encode_metadata(&e).unwrap().as_deref(), Some(r#"{"source":"unit"}"#));
    }

    #[test]
    fn test_keyset_pages_survive_access_bumps() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let now = Utc::now();
        let mut all: Vec<MemoryId> = Vec::new();
        for i in 0..6 {
            let e = entry(&format!("fact {}", i)).with_created_at(now - Duration::minutes(i));
            store.add_entry(&e).unwrap();
            all.push(e.id);
        }
        all.sort();

        let first = store.query_entries(&MemoryQuery::new().by_id().limit(3)).unwrap();
        let seen: Vec<MemoryId> = first.iter().map(|e| e.id.clone()).collect();
        let rest: Vec<MemoryId> = all.iter().filter(|id| !seen.contains(id)).cloned().collect();
        // Reads bump the unscanned rows to the front of the recency order.
        store.record_access(&rest, now + Duration::hours(1)).unwrap();

        let last = seen[seen.len() - 1].clone();
        let second = store
            .query_entries(&MemoryQuery::new().after(last).limit(3))
            .unwrap();
        let mut paged = seen;
        paged.extend(second.iter().map(|e| e.id.clone()));
        assert_eq!(paged, all);

        let tail = store
            .query_entries(&MemoryQuery::new().after(paged[5].clone()).limit(3))
            .unwrap();
        assert!(tail.is_empty());
    }

    #[test]
    fn test_query_entries_by_type_and_archive() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let a = entry("a");
        let b = MemoryEntry::new(scope(), MemoryType::Episodic, "b");
        store.add_entry(&a).unwrap();
        store.add_entry(&b).unwrap();

        let semantic = store
            .query_entries(&MemoryQuery::new().memory_types(vec![MemoryType::Semantic]))
            .unwrap();
        assert_eq!(semantic.len(), 1);

        assert!(store.archive(&a.id, "test").unwrap());
        assert!(!store.archive(&a.id, "again").unwrap());
        assert_eq!(store.query_entries(&MemoryQuery::new()).unwrap().len(), 1);
        assert_eq!(
            store
                .query_entries(&MemoryQuery::new().include_archived(true))
                .unwrap()
                .len(),
            2
        );
        assert_eq!(store.score_history(&a.id).unwrap()[0].operation, "archive");
    }

    #[test]
    fn test_mention_count_is_idempotent() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let a = entry("a");
        let b = entry("b");
        store.add_entry(&a).unwrap();
        store.add_entry(&b).unwrap();

        let pg = ExtractedEntity::new("PostgreSQL", EntityKind::Technology, 0.9);
        store.record_extraction(&a.id, &[pg.clone()], &[], &[]).unwrap();
        store.record_extraction(&a.id, &[pg.clone()], &[], &[]).unwrap();
        let tags = store
            .record_extraction(&b.id, &[ExtractedEntity::new("postgresql", EntityKind::Technology, 0.7)], &[], &[])
            .unwrap();

        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].mention_count, 2);
        assert_eq!(tags[0].name, "PostgreSQL");
        assert!((tags[0].confidence - 0.9).abs() < 1e-9);
        assert_eq!(store.stats().unwrap().total_entities, 1);
    }

    #[test]
    fn test_entity_overlap_candidates() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let a = entry("a");
        let b = entry("b");
        let c = entry("c");
        for e in [&a, &b, &c] {
            store.add_entry(e).unwrap();
        }
        let rust = ExtractedEntity::new("Rust", EntityKind::Technology, 0.9);
        let tokio = ExtractedEntity::new("Tokio", EntityKind::Technology, 0.9);
        let acme = ExtractedEntity::new("Acme Corp", EntityKind::Organization, 0.8);

        store
            .record_extraction(&a.id, &[rust.clone(), tokio.clone(), acme.clone()], &[], &[])
            .unwrap();
        store
            .record_extraction(&b.id, &[rust.clone(), tokio.clone()], &[], &[])
            .unwrap();
        store.record_extraction(&c.id, &[acme], &[], &[]).unwrap();

        let candidates = store.entity_overlap_candidates(&a.id, &scope(), 2, 10).unwrap();
        assert_eq!(candidates, vec![(b.id.clone(), 2)]);
        assert_eq!(store.shared_entity_count(&a.id, &c.id).unwrap(), 1);
    }

    #[test]
    fn test_relation_upsert_keeps_strongest() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let a = entry("a");
        let b = entry("b");
        store.add_entry(&a).unwrap();
        store.add_entry(&b).unwrap();
        let now = Utc::now();

        let r1 = MemoryRelation::new(a.id.clone(), b.id.clone(), RelationType::Supports, 0.4);
        let r2 = MemoryRelation::new(a.id.clone(), b.id.clone(), RelationType::Supports, 0.8)
            .inferred_by(InferredBy::Model)
            .with_reason("model says so");

        assert!(!store.insert_relation(&r1, 10, 30.0, now).unwrap().merged);
        assert!(store.insert_relation(&r2, 10, 30.0, now).unwrap().merged);

        let out = store.outgoing_relations(&a.id, None).unwrap();
        assert_eq!(out.len(), 1);
        assert!((out[0].strength - 0.8).abs() < 1e-9);
        assert_eq!(out[0].inferred_by, InferredBy::Model);
        assert_eq!(store.incoming_relations(&b.id, None).unwrap().len(), 1);
    }

    #[test]
    fn test_degree_cap_evicts_weakest() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let hub = entry("hub");
        store.add_entry(&hub).unwrap();
        let now = Utc::now();

        let mut weakest = None;
        for i in 0..5 {
            let t = entry(&format!("t{}", i));
            store.add_entry(&t).unwrap();
            let rel = MemoryRelation::new(
                hub.id.clone(),
                t.id.clone(),
                RelationType::SimilarTo,
                0.5 + i as f64 * 0.1,
            )
            .with_created_at(now);
            if i == 0 {
                weakest = Some(rel.id.clone());
            }
            store.insert_relation(&rel, 3, 30.0, now).unwrap();
        }

        let out = store.outgoing_relations(&hub.id, None).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|r| Some(&r.id) != weakest.as_ref()));
        assert!(out.iter().all(|r| r.strength >= 0.7 - 1e-9));
    }

    #[test]
    fn test_degree_cap_prefers_evicting_stale_edges() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let hub = entry("hub");
        let old = entry("old");
        let fresh = entry("fresh");
        let newest = entry("newest");
        for e in [&hub, &old, &fresh, &newest] {
            store.add_entry(e).unwrap();
        }
        let now = Utc::now();

        let stale = MemoryRelation::new(hub.id.clone(), old.id.clone(), RelationType::Supports, 0.9)
            .with_created_at(now - Duration::days(120));
        let recent = MemoryRelation::new(hub.id.clone(), fresh.id.clone(), RelationType::Supports, 0.6)
            .with_created_at(now);
        store.insert_relation(&stale, 2, 30.0, now).unwrap();
        store.insert_relation(&recent, 2, 30.0, now).unwrap();

        let third = MemoryRelation::new(hub.id.clone(), newest.id.clone(), RelationType::Supports, 0.5)
            .with_created_at(now);
        let result = store.insert_relation(&third, 2, 30.0, now).unwrap();

        assert!(result.stored);
        assert_eq!(result.evicted.len(), 1);
        assert_eq!(result.evicted[0].target_id, old.id);
    }

    #[test]
    fn test_self_relation_rejected() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let a = entry("a");
        store.add_entry(&a).unwrap();
        let rel = MemoryRelation::new(a.id.clone(), a.id.clone(), RelationType::Supports, 0.5);
        assert!(matches!(
            store.insert_relation(&rel, 10, 30.0, Utc::now()),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_vector_search_orders_by_similarity() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let a = entry("a").with_embedding(vec![1.0, 0.0]);
        let b = entry("b").with_embedding(vec![0.8, 0.6]);
        let c = entry("c").with_embedding(vec![0.0, 1.0]);
        let other = MemoryEntry::new(Scope::new("other", "eng"), MemoryType::Semantic, "x")
            .with_embedding(vec![1.0, 0.0]);
        for e in [&a, &b, &c, &other] {
            store.add_entry(e).unwrap();
        }

        let hits = store
            .vector_search(&[1.0, 0.0], "acme", Some("eng"), 10, 0.5, false)
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);
    }

    #[test]
    fn test_cas_score_update() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let a = entry("a");
        store.add_entry(&a).unwrap();

        assert!(store
            .update_scores(&a.id, 0, 0.8, 0.75, QualityTier::Gold)
            .unwrap());
        // Stale version loses.
        assert!(!store
            .update_scores(&a.id, 0, 0.1, 0.1, QualityTier::Bronze)
            .unwrap());

        store.record_access(&[a.id.clone()], Utc::now()).unwrap();
        let got = store.get_entry(&a.id).unwrap().unwrap();
        assert_eq!(got.version, 2);
        assert_eq!(got.usage_count, 1);
        assert_eq!(got.tier, QualityTier::Gold);
    }

    #[test]
    fn test_claim_collisions() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let a = entry("a").with_claim("database", "PostgreSQL");
        let b = entry("b").with_claim("database", "postgresql");
        let c = entry("c").with_claim("database", "MongoDB");
        for e in [&a, &b, &c] {
            store.add_entry(e).unwrap();
        }

        let hits = store
            .find_claim_collisions(&scope(), "database", "MongoDB", &c.id)
            .unwrap();
        assert_eq!(hits.len(), 2);
        let hits = store
            .find_claim_collisions(&scope(), "database", "PostgreSQL", &a.id)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, c.id);
    }

    #[test]
    fn test_conflict_lifecycle() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let a = entry("a");
        let b = entry("b");
        store.add_entry(&a).unwrap();
        store.add_entry(&b).unwrap();

        let conflict = MemoryConflict::new(
            scope(),
            a.id.clone(),
            b.id.clone(),
            ConflictKind::Structural,
            ConflictSeverity::Medium,
        )
        .with_claim_key("db");
        assert!(store.insert_conflict(&conflict).unwrap());
        let dup = MemoryConflict::new(
            scope(),
            b.id.clone(),
            a.id.clone(),
            ConflictKind::Structural,
            ConflictSeverity::Medium,
        );
        assert!(!store.insert_conflict(&dup).unwrap());

        let pending = store
            .list_conflicts("acme", None, Some(ConflictStatus::Pending))
            .unwrap();
        assert_eq!(pending.len(), 1);

        let resolution = ConflictResolution::new(Some(b.id.clone()), "newer decision", "alice");
        let resolved = store
            .transition_conflict(&conflict.id, ConflictStatus::Resolved, Some(&resolution), "alice")
            .unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);
        assert_eq!(resolved.resolution.unwrap().winner_id, Some(b.id.clone()));

        assert!(matches!(
            store.transition_conflict(&conflict.id, ConflictStatus::Ignored, None, "bob"),
            Err(Error::InvalidTransition(_))
        ));

        let log = store.conflict_log(&conflict.id).unwrap();
        let actions: Vec<_> = log.iter().map(|l| l.action.as_str()).collect();
        assert_eq!(actions, vec!["created", "resolved"]);
    }

    #[test]
    fn test_winner_must_be_party() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let a = entry("a");
        let b = entry("b");
        store.add_entry(&a).unwrap();
        store.add_entry(&b).unwrap();
        let conflict = MemoryConflict::new(
            scope(),
            a.id.clone(),
            b.id.clone(),
            ConflictKind::Semantic,
            ConflictSeverity::High,
        );
        store.insert_conflict(&conflict).unwrap();

        let bogus = ConflictResolution::new(Some(MemoryId::new()), "?", "alice");
        assert!(store
            .transition_conflict(&conflict.id, ConflictStatus::Resolved, Some(&bogus), "alice")
            .is_err());
    }

    #[test]
    fn test_version_tree_and_history() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let t0 = Utc::now() - Duration::hours(3);
        let root = entry("v1").with_created_at(t0);
        let v2 = entry("v2").with_parent(&root).with_created_at(t0 + Duration::hours(1));
        let v2b = entry("v2b").with_parent(&root).with_created_at(t0 + Duration::hours(1));
        let v3 = entry("v3").with_parent(&v2).with_created_at(t0 + Duration::hours(2));
        for e in [&root, &v2, &v2b, &v3] {
            store.add_entry(e).unwrap();
        }

        let tree = store.get_version_tree(&root.id).unwrap();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.depth(), 3);
        assert_eq!(tree.children.len(), 2);

        let history = store.get_version_history(&v3.id).unwrap();
        let contents: Vec<_> = history.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["v3", "v2", "v1"]);

        assert!(matches!(
            store.get_version_tree(&MemoryId::new()),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_entries_in_window() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let now = Utc::now();
        let a = entry("a").with_created_at(now);
        let b = entry("b").with_created_at(now - Duration::hours(2));
        let c = entry("c").with_created_at(now - Duration::days(3));
        for e in [&a, &b, &c] {
            store.add_entry(e).unwrap();
        }

        let near = store
            .entries_in_window(&scope(), now - Duration::hours(24), now + Duration::hours(24), &a.id, 10)
            .unwrap();
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].id, b.id);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let id = {
            let store = SqliteMemoryStore::open(&path).unwrap();
            let e = entry("persisted");
            store.add_entry(&e).unwrap();
            e.id
        };

        let store = SqliteMemoryStore::open(&path).unwrap();
        assert_eq!(store.get_entry(&id).unwrap().unwrap().content, "persisted");
    }

    #[test]
    fn test_stats() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let a = entry("a");
        let b = MemoryEntry::new(scope(), MemoryType::Strategic, "b");
        store.add_entry(&a).unwrap();
        store.add_entry(&b).unwrap();
        store
            .insert_relation(
                &MemoryRelation::new(a.id.clone(), b.id.clone(), RelationType::Causes, 0.9),
                10,
                30.0,
                Utc::now(),
            )
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.entries_by_type.get(&MemoryType::Strategic), Some(&1));
        assert_eq!(stats.relations_by_type.get(&RelationType::Causes), Some(&1));
        assert_eq!(stats.total_relations, 1);
    }
}
