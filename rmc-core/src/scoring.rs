//! Composite scoring, decay and tiering.
//!
//! ```text
//! base    = similarity*w_s + usage_term*w_u + validation*w_v + reputation*w_r
//! decayed = base * exp(-λ(memory_type) * days_since_last_access)
//! ```
//!
//! Scores are recomputed by a periodic sweep rather than continuously. The
//! sweep writes through [`SqliteMemoryStore::update_scores`], a
//! compare-and-swap on the entry version, so a retrieval that reinforces an
//! entry mid-sweep is never overwritten with stale signals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ScoringConfig;
use crate::error::Result;
use crate::memory::{
    MemoryEntry, MemoryId, MemoryQuery, QualityTier, RelationType, SqliteMemoryStore,
};

/// Inputs to the composite score, each in [0, 1] except `usage_count`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreSignals {
    /// Query similarity at retrieval, the entry's own confidence in sweeps
    pub similarity: f64,
    pub usage_count: u64,
    /// Share of supporting evidence among supporting and contradicting edges
    pub validation_ratio: f64,
    pub reputation: f64,
}

impl ScoreSignals {
    /// Signals carried on the entry itself; validation defaults to neutral.
    pub fn from_entry(entry: &MemoryEntry) -> Self {
        Self {
            similarity: entry.confidence,
            usage_count: entry.usage_count,
            validation_ratio: 0.5,
            reputation: entry.producer.reputation,
        }
    }

    pub fn with_similarity(mut self, similarity: f64) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn with_validation_ratio(mut self, ratio: f64) -> Self {
        self.validation_ratio = ratio;
        self
    }
}

/// Result of scoring one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base: f64,
    pub decay_factor: f64,
    pub composite: f64,
    pub tier: QualityTier,
    pub explanation: String,
}

/// Per-sweep counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub rescored: usize,
    pub tier_changes: usize,
    pub archived: usize,
    /// CAS attempts that lost to a concurrent update
    pub cas_retries: usize,
    /// Entries left for the next sweep after exhausting retries
    pub skipped: usize,
    pub cancelled: bool,
}

/// Stateless scorer over an explicit [`ScoringConfig`].
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// `ln(1 + u) / ln(1 + saturation)`, capped at 1.
    pub fn usage_term(&self, usage_count: u64) -> f64 {
        let saturation = self.config.usage_saturation.max(1) as f64;
        ((1.0 + usage_count as f64).ln() / (1.0 + saturation).ln()).min(1.0)
    }

    /// Weighted sum of the signals, normalised by the weight total.
    pub fn base_score(&self, signals: &ScoreSignals) -> f64 {
        let c = &self.config;
        let total =
            c.similarity_weight + c.usage_weight + c.validation_weight + c.reputation_weight;
        if total <= 0.0 {
            return 0.0;
        }
        let raw = signals.similarity.clamp(0.0, 1.0) * c.similarity_weight
            + self.usage_term(signals.usage_count) * c.usage_weight
            + signals.validation_ratio.clamp(0.0, 1.0) * c.validation_weight
            + signals.reputation.clamp(0.0, 1.0) * c.reputation_weight;
        (raw / total).clamp(0.0, 1.0)
    }

    /// `exp(-λ * days_since_last_access)`.
    pub fn decay_factor(&self, entry: &MemoryEntry, now: DateTime<Utc>) -> f64 {
        let lambda = self.config.lambda(entry.memory_type);
        (-lambda * entry.days_since_access(now)).exp()
    }

    pub fn score(
        &self,
        entry: &MemoryEntry,
        now: DateTime<Utc>,
        signals: &ScoreSignals,
    ) -> ScoreBreakdown {
        let base = self.base_score(signals);
        let decay_factor = self.decay_factor(entry, now);
        let composite = base * decay_factor;
        ScoreBreakdown {
            base,
            decay_factor,
            composite,
            tier: self.config.tier_for(composite),
            explanation: explain(composite).to_string(),
        }
    }

    /// Signals for a sweep: own confidence as similarity, validation from the
    /// strengths of incoming SUPPORTS and CONTRADICTS edges.
    pub fn gather_signals(
        &self,
        store: &SqliteMemoryStore,
        entry: &MemoryEntry,
    ) -> Result<ScoreSignals> {
        let incoming = store.incoming_relations(
            &entry.id,
            Some(&[RelationType::Supports, RelationType::Contradicts]),
        )?;
        let (support, contra) = incoming.iter().fold((0.0, 0.0), |(s, c), r| {
            match r.relation_type {
                RelationType::Supports => (s + r.strength, c),
                _ => (s, c + r.strength),
            }
        });
        let ratio = if support + contra > 0.0 {
            support / (support + contra)
        } else {
            0.5
        };
        Ok(ScoreSignals::from_entry(entry).with_validation_ratio(ratio))
    }

    /// Recompute and persist one entry's score, retrying on version conflicts.
    ///
    /// Returns `None` if the entry disappeared or every attempt lost the race.
    pub fn rescore(
        &self,
        store: &SqliteMemoryStore,
        id: &MemoryId,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<Option<(MemoryEntry, ScoreBreakdown)>> {
        for attempt in 0..=self.config.max_cas_retries {
            let Some(entry) = store.get_entry(id)? else {
                return Ok(None);
            };
            let signals = self.gather_signals(store, &entry)?;
            let breakdown = self.score(&entry, now, &signals);
            if store.update_scores(
                id,
                entry.version,
                breakdown.base,
                breakdown.composite,
                breakdown.tier,
            )? {
                return Ok(Some((entry, breakdown)));
            }
            report.cas_retries += 1;
            debug!(memory_id = %id, attempt, "Score update lost a version race, retrying");
        }
        report.skipped += 1;
        Ok(None)
    }

    /// Rescore every live entry, optionally restricted to one org.
    ///
    /// `cancel` is checked between entries; an entry is never left half-written.
    pub async fn sweep(
        &self,
        store: &SqliteMemoryStore,
        org_id: Option<&str>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let batch = self.config.sweep_batch_size.max(1);
        let mut cursor: Option<MemoryId> = None;

        'outer: loop {
            // Keyset pages in id order: reads that reinforce entries mid-sweep
            // cannot move unscanned rows behind the cursor.
            let mut query = MemoryQuery::new().by_id().limit(batch);
            if let Some(last) = cursor.take() {
                query = query.after(last);
            }
            if let Some(org) = org_id {
                query = query.org(org);
            }
            let page = store.query_entries(&query)?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.id.clone());

            for entry in &page {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'outer;
                }
                report.scanned += 1;
                let Some((before, breakdown)) = self.rescore(store, &entry.id, now, &mut report)?
                else {
                    continue;
                };
                report.rescored += 1;

                if before.tier != breakdown.tier {
                    report.tier_changes += 1;
                    store.log_score(
                        &before.id,
                        "tier_change",
                        Some(before.tier),
                        Some(breakdown.tier),
                        breakdown.composite,
                        &breakdown.explanation,
                    )?;
                }

                if breakdown.tier == QualityTier::Bronze
                    && breakdown.composite < self.config.archive_threshold
                    && store.archive(
                        &before.id,
                        &format!(
                            "decayed score {:.3} below {:.3}",
                            breakdown.composite, self.config.archive_threshold
                        ),
                    )?
                {
                    report.archived += 1;
                    debug!(memory_id = %before.id, score = breakdown.composite, "Archived decayed entry");
                }
            }
            tokio::task::yield_now().await;
        }

        info!(
            scanned = report.scanned,
            rescored = report.rescored,
            tier_changes = report.tier_changes,
            archived = report.archived,
            cancelled = report.cancelled,
            "Decay sweep finished"
        );
        Ok(report)
    }
}

/// Human-readable band for a composite score.
pub fn explain(score: f64) -> &'static str {
    if score >= 0.8 {
        "Highly reliable: strong evidence and recent use"
    } else if score >= 0.6 {
        "Reliable: well supported memory"
    } else if score >= 0.4 {
        "Usable: moderate support, verify before relying on it"
    } else {
        "Weak: stale or poorly supported, seek corroboration"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRelation, MemoryType, Producer, Scope};
    use chrono::Duration;

    fn entry(memory_type: MemoryType) -> MemoryEntry {
        MemoryEntry::new(Scope::new("acme", "eng"), memory_type, "note")
    }

    #[test]
    fn test_usage_term_saturates() {
        let engine = ScoringEngine::default();
        assert_eq!(engine.usage_term(0), 0.0);
        assert!((engine.usage_term(100) - 1.0).abs() < 1e-9);
        assert_eq!(engine.usage_term(10_000), 1.0);
        assert!(engine.usage_term(10) < engine.usage_term(20));
    }

    #[test]
    fn test_base_score_default_weights() {
        let engine = ScoringEngine::default();
        let signals = ScoreSignals {
            similarity: 1.0,
            usage_count: 100,
            validation_ratio: 1.0,
            reputation: 1.0,
        };
        assert!((engine.base_score(&signals) - 1.0).abs() < 1e-9);

        let signals = ScoreSignals {
            similarity: 0.5,
            usage_count: 0,
            validation_ratio: 0.5,
            reputation: 0.5,
        };
        // 0.5*0.4 + 0 + 0.5*0.2 + 0.5*0.2
        assert!((engine.base_score(&signals) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_decay_halves_at_half_life() {
        let engine = ScoringEngine::default();
        let now = Utc::now();
        let e = entry(MemoryType::Episodic).with_created_at(now - Duration::days(14));
        assert!((engine.decay_factor(&e, now) - 0.5).abs() < 1e-6);

        let s = entry(MemoryType::Strategic).with_created_at(now - Duration::days(14));
        assert!(engine.decay_factor(&s, now) > 0.98);
    }

    #[test]
    fn test_score_tier_and_explanation() {
        let engine = ScoringEngine::default();
        let now = Utc::now();
        let e = entry(MemoryType::Semantic)
            .with_producer(Producer::human("ana").with_reputation(1.0))
            .with_created_at(now);
        let signals = ScoreSignals::from_entry(&e).with_validation_ratio(1.0);
        let b = engine.score(&e, now, &signals);
        // 0.4 + 0 + 0.2 + 0.2
        assert!((b.composite - 0.8).abs() < 1e-9);
        assert_eq!(b.tier, QualityTier::Gold);
        assert!(b.explanation.starts_with("Highly reliable"));
    }

    #[test]
    fn test_gather_signals_validation_ratio() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let target = entry(MemoryType::Semantic);
        let a = entry(MemoryType::Semantic);
        let b = entry(MemoryType::Semantic);
        for e in [&target, &a, &b] {
            store.add_entry(e).unwrap();
        }
        let now = Utc::now();
        store
            .insert_relation(
                &MemoryRelation::new(a.id.clone(), target.id.clone(), RelationType::Supports, 0.6),
                10,
                30.0,
                now,
            )
            .unwrap();
        store
            .insert_relation(
                &MemoryRelation::new(b.id.clone(), target.id.clone(), RelationType::Contradicts, 0.2),
                10,
                30.0,
                now,
            )
            .unwrap();

        let engine = ScoringEngine::default();
        let signals = engine.gather_signals(&store, &target).unwrap();
        assert!((signals.validation_ratio - 0.75).abs() < 1e-9);

        let lonely = engine.gather_signals(&store, &a).unwrap();
        assert_eq!(lonely.validation_ratio, 0.5);
    }

    #[tokio::test]
    async fn test_sweep_updates_tiers_and_archives() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let now = Utc::now();
        let fresh = entry(MemoryType::Strategic).with_created_at(now);
        let stale = entry(MemoryType::Episodic)
            .with_confidence(0.2)
            .with_created_at(now - Duration::days(120));
        store.add_entry(&fresh).unwrap();
        store.add_entry(&stale).unwrap();

        let engine = ScoringEngine::default();
        let report = engine
            .sweep(&store, None, now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.rescored, 2);
        assert_eq!(report.archived, 1);
        assert!(!report.cancelled);

        let stale_after = store.get_entry(&stale.id).unwrap().unwrap();
        assert!(stale_after.archived);
        let history = store.score_history(&stale.id).unwrap();
        assert_eq!(history[0].operation, "archive");

        let fresh_after = store.get_entry(&fresh.id).unwrap().unwrap();
        assert_eq!(fresh_after.tier, QualityTier::Silver);
        assert!(fresh_after.version > fresh.version);
    }

    #[tokio::test]
    async fn test_sweep_pages_cover_every_entry() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let now = Utc::now();
        for i in 0..5 {
            let e = if i % 2 == 0 {
                entry(MemoryType::Episodic)
                    .with_confidence(0.2)
                    .with_created_at(now - Duration::days(120))
            } else {
                entry(MemoryType::Strategic).with_created_at(now)
            };
            store.add_entry(&e).unwrap();
        }

        let engine = ScoringEngine::new(ScoringConfig {
            sweep_batch_size: 1,
            ..ScoringConfig::default()
        });
        let report = engine
            .sweep(&store, None, now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.scanned, 5);
        assert_eq!(report.archived, 3);
    }

    #[tokio::test]
    async fn test_sweep_respects_cancellation() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        store.add_entry(&entry(MemoryType::Semantic)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = ScoringEngine::default()
            .sweep(&store, None, Utc::now(), &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.scanned, 0);
    }

    #[test]
    fn test_rescore_retries_after_access_bump() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let e = entry(MemoryType::Semantic);
        store.add_entry(&e).unwrap();
        // A stale expected version must be rejected.
        store.record_access(&[e.id.clone()], Utc::now()).unwrap();
        assert!(!store
            .update_scores(&e.id, e.version, 0.5, 0.5, QualityTier::Silver)
            .unwrap());

        let mut report = SweepReport::default();
        let out = ScoringEngine::default()
            .rescore(&store, &e.id, Utc::now(), &mut report)
            .unwrap();
        assert!(out.is_some());
        assert_eq!(report.skipped, 0);
    }
}
