//! Conflict detection and arbitration.
//!
//! Structural conflicts (same scope, same claim key, different value) are
//! found synchronously at write time with one indexed query. Semantic
//! conflicts are looked for in the background, for strategic entries only,
//! among relation neighbours, same-key claims across the org and similar
//! entries. Nothing here resolves a Medium or worse conflict on its own:
//! [`ConflictDetector::propose_resolution`] only returns a proposal.

use futures::future::join_all;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

use crate::config::ConflictConfig;
use crate::error::{Error, Result};
use crate::inference::{ArbitrationProposal, InferenceChain};
use crate::memory::{
    ConflictId, ConflictKind, ConflictResolution, ConflictSeverity, ConflictStatus, MemoryConflict,
    MemoryEntry, MemoryId, MemoryType, SqliteMemoryStore,
};

/// Actor recorded on automatic resolutions.
pub const AUTO_ACTOR: &str = "auto";

#[derive(Clone)]
pub struct ConflictDetector {
    store: SqliteMemoryStore,
    chain: InferenceChain,
    config: ConflictConfig,
}

impl ConflictDetector {
    pub fn new(store: SqliteMemoryStore, chain: InferenceChain, config: ConflictConfig) -> Self {
        Self {
            store,
            chain,
            config,
        }
    }

    /// Severity of a structural collision on `claim_key`.
    pub fn structural_severity(&self, claim_key: &str) -> ConflictSeverity {
        if self.config.is_important(claim_key) {
            ConflictSeverity::Medium
        } else {
            ConflictSeverity::Low
        }
    }

    /// Record pending conflicts between `entry` and every same-scope entry
    /// asserting a different value for its claim key.
    ///
    /// Returns the conflicts created by this call; pairs already on record are skipped.
    pub fn check_structural(&self, entry: &MemoryEntry) -> Result<Vec<MemoryConflict>> {
        let (Some(key), Some(value)) = (&entry.claim_key, &entry.claim_value) else {
            return Ok(Vec::new());
        };

        let severity = self.structural_severity(key);
        let mut created = Vec::new();
        for other in self
            .store
            .find_claim_collisions(&entry.scope, key, value, &entry.id)?
        {
            let conflict = MemoryConflict::new(
                entry.scope.clone(),
                entry.id.clone(),
                other.id.clone(),
                ConflictKind::Structural,
                severity,
            )
            .with_claim_key(key.clone())
            .with_reason(format!(
                "'{}' is '{}' here but '{}' in {}",
                key,
                value,
                other.claim_value.as_deref().unwrap_or_default(),
                other.id
            ));

            if !self.store.insert_conflict(&conflict)? {
                continue;
            }
            info!(
                conflict_id = %conflict.id,
                memory_id = %entry.id,
                other_id = %other.id,
                claim_key = %key,
                severity = %severity,
                "Structural conflict recorded"
            );

            if severity == ConflictSeverity::Low && self.config.auto_resolve_low {
                let proposal = self.chain.rules().arbitration(entry, &other);
                let resolution = ConflictResolution::new(
                    proposal.winner_id,
                    format!("auto-resolved: {}", proposal.reason),
                    AUTO_ACTOR,
                );
                let resolved = self.store.transition_conflict(
                    &conflict.id,
                    ConflictStatus::Resolved,
                    Some(&resolution),
                    AUTO_ACTOR,
                )?;
                created.push(resolved);
            } else {
                created.push(conflict);
            }
        }
        Ok(created)
    }

    /// Look for contradictions between a strategic entry and its neighbourhood.
    ///
    /// `similar` are `(id, similarity)` hits from a vector search across the org;
    /// those under the semantic threshold are ignored. Pairs that already have
    /// a conflict of any kind are not re-examined.
    pub async fn detect_semantic(
        &self,
        entry: &MemoryEntry,
        similar: &[(MemoryId, f64)],
    ) -> Result<Vec<MemoryConflict>> {
        if entry.memory_type != MemoryType::Strategic {
            return Ok(Vec::new());
        }

        let already: HashSet<MemoryId> = self
            .store
            .conflicts_for_memory(&entry.id)?
            .iter()
            .map(|c| c.other_side(&entry.id).clone())
            .collect();

        let mut ids: BTreeSet<MemoryId> = BTreeSet::new();
        for rel in self.store.outgoing_relations(&entry.id, None)? {
            ids.insert(rel.target_id);
        }
        for rel in self.store.incoming_relations(&entry.id, None)? {
            ids.insert(rel.source_id);
        }
        if let Some(ref key) = entry.claim_key {
            for other in self.store.find_by_claim_key(&entry.scope.org_id, key)? {
                ids.insert(other.id);
            }
        }
        for (id, sim) in similar {
            if *sim >= self.config.semantic_similarity_threshold {
                ids.insert(id.clone());
            }
        }
        ids.remove(&entry.id);
        let ids: Vec<MemoryId> = ids
            .into_iter()
            .filter(|id| !already.contains(id))
            .take(self.config.max_semantic_candidates)
            .collect();

        let others: Vec<MemoryEntry> = self
            .store
            .get_entries(&ids)?
            .into_iter()
            .filter(|o| !o.archived && o.scope.org_id == entry.scope.org_id)
            .collect();
        // Verdicts come back in candidate order, so inserts stay deterministic.
        let verdicts = join_all(
            others
                .iter()
                .map(|other| self.chain.detect_contradiction(entry, other)),
        )
        .await;

        let mut created = Vec::new();
        for (other, (verdict, by)) in others.into_iter().zip(verdicts) {
            if !verdict.contradicts {
                continue;
            }
            let severity = if other.scope.namespace == entry.scope.namespace {
                ConflictSeverity::High
            } else {
                ConflictSeverity::Critical
            };
            let mut conflict = MemoryConflict::new(
                entry.scope.clone(),
                entry.id.clone(),
                other.id.clone(),
                ConflictKind::Semantic,
                severity,
            )
            .with_reason(format!("[{}] {}", by, verdict.reason));
            if let (Some(a), Some(b)) = (&entry.claim_key, &other.claim_key) {
                if a == b {
                    conflict = conflict.with_claim_key(a.clone());
                }
            }
            if self.store.insert_conflict(&conflict)? {
                warn!(
                    conflict_id = %conflict.id,
                    memory_id = %entry.id,
                    other_id = %other.id,
                    severity = %severity,
                    confidence = verdict.confidence,
                    "Semantic conflict recorded"
                );
                created.push(conflict);
            }
        }
        debug!(memory_id = %entry.id, examined = ids.len(), found = created.len(), "Semantic conflict pass done");
        Ok(created)
    }

    /// Ask the arbitration chain which side should prevail. Nothing is written.
    pub async fn propose_resolution(&self, id: &ConflictId) -> Result<ArbitrationProposal> {
        let conflict = self
            .store
            .get_conflict(id)?
            .ok_or_else(|| Error::not_found("conflict", id))?;
        let a = self.store.require_entry(&conflict.entry_a)?;
        let b = self.store.require_entry(&conflict.entry_b)?;
        Ok(self.chain.arbitrate(&a, &b).await)
    }

    /// Apply a resolution. The winner, if any, must be one side of the pair.
    pub fn resolve(
        &self,
        id: &ConflictId,
        resolution: ConflictResolution,
    ) -> Result<MemoryConflict> {
        let actor = resolution.resolved_by.clone();
        self.store
            .transition_conflict(id, ConflictStatus::Resolved, Some(&resolution), &actor)
    }

    pub fn ignore(&self, id: &ConflictId, actor: &str) -> Result<MemoryConflict> {
        self.store
            .transition_conflict(id, ConflictStatus::Ignored, None, actor)
    }
}

impl MemoryConflict {
    /// The side of the pair that is not `id`.
    pub fn other_side(&self, id: &MemoryId) -> &MemoryId {
        if &self.entry_a == id {
            &self.entry_b
        } else {
            &self.entry_a
        }
    }
}
