//! Relation building.
//!
//! For a freshly enriched entry the builder gathers candidate neighbours from
//! four cheap sources (vector similarity, shared entities, temporal proximity
//! and claim collisions), then decides per pair whether a model call is
//! warranted. Only high-similarity pairs that also share entities, claim
//! collisions and strategic entries reach the model; every other pair gets a
//! rule label or nothing. Each edge goes through
//! [`SqliteMemoryStore::insert_relation`], which upserts and enforces the
//! degree cap in one transaction.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::RelationConfig;
use crate::error::Result;
use crate::inference::InferenceChain;
use crate::memory::{
    InferredBy, MemoryEntry, MemoryId, MemoryRelation, MemoryType, RelationType,
    SqliteMemoryStore,
};

/// Why a pair was considered.
#[derive(Debug, Clone, Default)]
struct Candidate {
    entry: Option<MemoryEntry>,
    similarity: Option<f64>,
    overlap: usize,
    temporal: bool,
    claim_collision: bool,
}

impl Candidate {
    /// Claim collisions first, then similarity, then overlap.
    fn priority(&self) -> (bool, i64, usize) {
        (
            self.claim_collision,
            (self.similarity.unwrap_or(0.0) * 1_000_000.0) as i64,
            self.overlap,
        )
    }
}

/// Counters for one `build_relations` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationStats {
    pub candidates: usize,
    /// Pairs sent through the model path
    pub model_calls: usize,
    /// Pairs labelled by rules, including model fallbacks
    pub rule_labels: usize,
    pub stored: usize,
    pub merged: usize,
    pub evicted: usize,
}

impl RelationStats {
    /// Share of candidates that needed a model call.
    pub fn model_fraction(&self) -> f64 {
        if self.candidates == 0 {
            0.0
        } else {
            self.model_calls as f64 / self.candidates as f64
        }
    }
}

/// Builds typed edges for new entries.
#[derive(Clone)]
pub struct RelationBuilder {
    store: SqliteMemoryStore,
    chain: InferenceChain,
    config: RelationConfig,
}

impl RelationBuilder {
    pub fn new(store: SqliteMemoryStore, chain: InferenceChain, config: RelationConfig) -> Self {
        Self {
            store,
            chain,
            config,
        }
    }

    pub fn config(&self) -> &RelationConfig {
        &self.config
    }

    /// Build and persist relations for `entry`. Returns the edges that
    /// survived the degree cap.
    pub async fn build_relations(
        &self,
        entry: &MemoryEntry,
        now: DateTime<Utc>,
    ) -> Result<(Vec<MemoryRelation>, RelationStats)> {
        let mut stats = RelationStats::default();
        let mut proposed: Vec<MemoryRelation> = Vec::new();

        if let Some(ref parent_id) = entry.parent_id {
            proposed.push(
                MemoryRelation::new(entry.id.clone(), parent_id.clone(), RelationType::DerivedFrom, 1.0)
                    .with_reason("edited version of parent")
                    .with_created_at(now),
            );
        }

        let candidates = self.candidates(entry)?;
        stats.candidates = candidates.len();

        for (candidate_id, candidate) in candidates {
            let Some(other) = candidate.entry.as_ref() else {
                continue;
            };
            if entry.parent_id.as_ref() == Some(&candidate_id) {
                continue;
            }

            let labelled = if self.needs_model(entry, &candidate) {
                self.model_label(entry, other, &candidate, now, &mut stats).await
            } else {
                let rel = self.rule_label(entry, other, &candidate, now);
                if rel.is_some() {
                    stats.rule_labels += 1;
                }
                rel
            };
            if let Some(rel) = labelled {
                proposed.push(rel);
            }
        }

        let mut stored = Vec::new();
        for rel in proposed {
            let outcome = self.store.insert_relation(
                &rel,
                self.config.max_out_degree,
                self.config.edge_half_life_days,
                now,
            )?;
            stats.evicted += outcome.evicted.len();
            if outcome.merged {
                stats.merged += 1;
            }
            if outcome.stored {
                stats.stored += 1;
                stored.push(rel);
            }
        }

        info!(
            memory_id = %entry.id,
            candidates = stats.candidates,
            model_calls = stats.model_calls,
            rule_labels = stats.rule_labels,
            stored = stats.stored,
            evicted = stats.evicted,
            "Relations built"
        );
        Ok((stored, stats))
    }

    /// Merge the four candidate sources, bounded by `max_candidates`.
    fn candidates(&self, entry: &MemoryEntry) -> Result<BTreeMap<MemoryId, Candidate>> {
        let cfg = &self.config;
        let limit = cfg.max_candidates;
        let mut found: BTreeMap<MemoryId, Candidate> = BTreeMap::new();

        if let Some(ref embedding) = entry.embedding {
            let hits = self.store.vector_search(
                embedding,
                &entry.scope.org_id,
                Some(&entry.scope.namespace),
                limit + 1,
                cfg.similarity_threshold,
                false,
            )?;
            for (id, sim) in hits {
                if id != entry.id && sim > cfg.similarity_threshold {
                    found.entry(id).or_default().similarity = Some(sim);
                }
            }
        }

        for (id, shared) in self.store.entity_overlap_candidates(
            &entry.id,
            &entry.scope,
            cfg.min_entity_overlap,
            limit,
        )? {
            found.entry(id).or_default().overlap = shared;
        }

        let window = Duration::hours(cfg.temporal_window_hours);
        for other in self.store.entries_in_window(
            &entry.scope,
            entry.created_at - window,
            entry.created_at + window,
            &entry.id,
            limit,
        )? {
            let slot = found.entry(other.id.clone()).or_default();
            slot.temporal = true;
            slot.entry = Some(other);
        }

        if let (Some(ref key), Some(ref value)) = (&entry.claim_key, &entry.claim_value) {
            for other in self
                .store
                .find_claim_collisions(&entry.scope, key, value, &entry.id)?
            {
                let slot = found.entry(other.id.clone()).or_default();
                slot.claim_collision = true;
                slot.entry = Some(other);
            }
        }

        if found.len() > limit {
            let mut ranked: Vec<(MemoryId, Candidate)> = found.into_iter().collect();
            ranked.sort_by(|a, b| b.1.priority().cmp(&a.1.priority()).then_with(|| a.0.cmp(&b.0)));
            ranked.truncate(limit);
            found = ranked.into_iter().collect();
        }

        let missing: Vec<MemoryId> = found
            .iter()
            .filter(|(_, c)| c.entry.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        for other in self.store.get_entries(&missing)? {
            if let Some(slot) = found.get_mut(&other.id) {
                slot.entry = Some(other);
            }
        }

        // Overlap only matters for the coarse filter on very similar pairs.
        for (id, candidate) in found.iter_mut() {
            if candidate.overlap == 0
                && candidate.similarity.unwrap_or(0.0) >= cfg.high_similarity_threshold
            {
                candidate.overlap = self.store.shared_entity_count(&entry.id, id)?;
            }
        }

        debug!(memory_id = %entry.id, candidates = found.len(), "Relation candidates gathered");
        Ok(found)
    }

    fn needs_model(&self, entry: &MemoryEntry, candidate: &Candidate) -> bool {
        let high_similarity = candidate.similarity.unwrap_or(0.0)
            >= self.config.high_similarity_threshold
            && candidate.overlap >= self.config.min_entity_overlap;
        candidate.claim_collision || high_similarity || entry.memory_type == MemoryType::Strategic
    }

    /// Classify `older → newer`; claim collisions are always CONTRADICTS.
    async fn model_label(
        &self,
        entry: &MemoryEntry,
        other: &MemoryEntry,
        candidate: &Candidate,
        now: DateTime<Utc>,
        stats: &mut RelationStats,
    ) -> Option<MemoryRelation> {
        let (earlier, later) = if other.created_at <= entry.created_at {
            (other, entry)
        } else {
            (entry, other)
        };
        let (verdict, by) = self.chain.classify_relation(earlier, later).await;
        match by {
            InferredBy::Model => stats.model_calls += 1,
            InferredBy::Rule => stats.rule_labels += 1,
        }

        if candidate.claim_collision {
            let (strength, reason) = match verdict {
                Some(v) if v.relation_type == RelationType::Contradicts => (
                    v.strength,
                    v.reason.unwrap_or_else(|| claim_reason(entry)),
                ),
                _ => (self.config.contradiction_strength, claim_reason(entry)),
            };
            return Some(
                MemoryRelation::new(entry.id.clone(), other.id.clone(), RelationType::Contradicts, strength)
                    .with_reason(reason)
                    .inferred_by(by)
                    .with_created_at(now),
            );
        }

        match verdict {
            Some(v) => {
                let mut rel =
                    MemoryRelation::new(earlier.id.clone(), later.id.clone(), v.relation_type, v.strength)
                        .inferred_by(by)
                        .with_created_at(now);
                if let Some(reason) = v.reason {
                    rel = rel.with_reason(reason);
                }
                Some(rel)
            }
            None => {
                let rel = self.rule_label(entry, other, candidate, now);
                if rel.is_some() && by == InferredBy::Model {
                    stats.rule_labels += 1;
                }
                rel
            }
        }
    }

    /// Cheap label from the candidate's provenance alone.
    fn rule_label(
        &self,
        entry: &MemoryEntry,
        other: &MemoryEntry,
        candidate: &Candidate,
        now: DateTime<Utc>,
    ) -> Option<MemoryRelation> {
        let cfg = &self.config;
        let (relation_type, strength, reason) = if candidate.overlap >= cfg.strong_overlap {
            (
                RelationType::Supports,
                (0.5 + 0.1 * candidate.overlap as f64).min(0.9),
                format!("{} shared entities", candidate.overlap),
            )
        } else if let Some(sim) = candidate.similarity {
            (RelationType::SimilarTo, sim, format!("cosine similarity {:.2}", sim))
        } else if candidate.temporal {
            let relation_type = if entry.created_at >= other.created_at {
                RelationType::TemporalAfter
            } else {
                RelationType::TemporalBefore
            };
            (
                relation_type,
                cfg.temporal_strength,
                format!("within {}h", cfg.temporal_window_hours),
            )
        } else {
            return None;
        };

        Some(
            MemoryRelation::new(entry.id.clone(), other.id.clone(), relation_type, strength)
                .with_reason(reason)
                .inferred_by(InferredBy::Rule)
                .with_created_at(now),
        )
    }
}

fn claim_reason(entry: &MemoryEntry) -> String {
    format!(
        "conflicting values for claim '{}'",
        entry.claim_key.as_deref().unwrap_or_default()
    )
}
