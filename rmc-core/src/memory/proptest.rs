//! Property-based tests for the datastore invariants using proptest.
//!
//! - The outgoing degree cap holds after any sequence of inserts
//! - Re-extracting the same entities never inflates `mention_count`
//! - Decay is monotonic in idle time and reset by an access

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    use crate::memory::{
        EntityKind, ExtractedEntity, MemoryEntry, MemoryRelation, MemoryType, RelationType, Scope,
        SqliteMemoryStore,
    };
    use crate::scoring::{ScoreSignals, ScoringEngine};

    fn memory_type() -> impl Strategy<Value = MemoryType> {
        prop_oneof![
            Just(MemoryType::Episodic),
            Just(MemoryType::Semantic),
            Just(MemoryType::Strategic),
            Just(MemoryType::Procedural),
        ]
    }

    fn relation_type() -> impl Strategy<Value = RelationType> {
        (0..RelationType::ALL.len()).prop_map(|i| RelationType::ALL[i])
    }

    // (target index, type, strength, age in days)
    fn edge() -> impl Strategy<Value = (usize, RelationType, f64, i64)> {
        (1usize..16, relation_type(), 0.0f64..=1.0, 0i64..120)
    }

    fn seeded_store(n: usize) -> (SqliteMemoryStore, Vec<MemoryEntry>) {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let scope = Scope::new("acme", "eng");
        let entries: Vec<MemoryEntry> = (0..n)
            .map(|i| MemoryEntry::new(scope.clone(), MemoryType::Semantic, format!("entry {}", i)))
            .collect();
        for e in &entries {
            store.add_entry(e).unwrap();
        }
        (store, entries)
    }

    // =========================================================================
    // Degree cap
    // =========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// No node ever exceeds its cap, whatever the insert order.
        #[test]
        fn out_degree_never_exceeds_cap(
            cap in 1usize..6,
            edges in prop::collection::vec(edge(), 1..40)
        ) {
            let (store, entries) = seeded_store(16);
            let source = &entries[0];
            let now = Utc::now();

            for (target, rel_type, strength, age) in edges {
                let rel = MemoryRelation::new(
                    source.id.clone(),
                    entries[target].id.clone(),
                    rel_type,
                    strength,
                )
                .with_created_at(now - Duration::days(age));
                store.insert_relation(&rel, cap, 30.0, now).unwrap();
                let degree = store.out_degree(&source.id).unwrap();
                prop_assert!(degree <= cap, "degree {} exceeds cap {}", degree, cap);
            }
        }

        /// The surviving edges are never weaker than an evicted one.
        #[test]
        fn eviction_keeps_strongest(
            strengths in prop::collection::vec(0.01f64..=1.0, 4..12)
        ) {
            let (store, entries) = seeded_store(16);
            let now = Utc::now();
            let cap = 3;
            let mut evicted_max: f64 = 0.0;

            for (i, s) in strengths.iter().enumerate() {
                let rel = MemoryRelation::new(
                    entries[0].id.clone(),
                    entries[i + 1].id.clone(),
                    RelationType::Supports,
                    *s,
                )
                .with_created_at(now);
                let out = store.insert_relation(&rel, cap, 30.0, now).unwrap();
                for ev in out.evicted {
                    evicted_max = evicted_max.max(ev.strength);
                }
            }

            let kept = store.outgoing_relations(&entries[0].id, None).unwrap();
            prop_assert_eq!(kept.len(), cap);
            for r in kept {
                prop_assert!(r.strength >= evicted_max);
            }
        }
    }

    // =========================================================================
    // Entity mentions
    // =========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// mention_count equals the number of distinct entries, not extraction runs.
        #[test]
        fn mention_count_is_idempotent(
            entries_with_entity in 1usize..6,
            repeats in 1usize..4
        ) {
            let (store, entries) = seeded_store(entries_with_entity);
            let entity = ExtractedEntity::new("PostgreSQL", EntityKind::Technology, 0.9);

            for _ in 0..repeats {
                for e in &entries {
                    store
                        .record_extraction(&e.id, std::slice::from_ref(&entity), &[], &[])
                        .unwrap();
                }
            }

            let tag = store
                .get_entity("postgresql", EntityKind::Technology)
                .unwrap()
                .unwrap();
            prop_assert_eq!(tag.mention_count, entries_with_entity as u64);
        }
    }

    // =========================================================================
    // Decay
    // =========================================================================

    proptest! {
        /// A longer idle period never yields a higher score.
        #[test]
        fn decay_is_monotonic(
            memory_type in memory_type(),
            idle_a in 0i64..2000,
            extra in 0i64..2000,
            confidence in 0.0f64..=1.0
        ) {
            let engine = ScoringEngine::default();
            let now = Utc::now();
            let scope = Scope::new("acme", "eng");

            let recent = MemoryEntry::new(scope.clone(), memory_type, "x")
                .with_confidence(confidence)
                .with_created_at(now - Duration::days(idle_a));
            let older = MemoryEntry::new(scope, memory_type, "x")
                .with_confidence(confidence)
                .with_created_at(now - Duration::days(idle_a + extra));

            let s_recent = engine.score(&recent, now, &ScoreSignals::from_entry(&recent));
            let s_older = engine.score(&older, now, &ScoreSignals::from_entry(&older));
            prop_assert!(s_older.composite <= s_recent.composite + 1e-12);
            prop_assert!(s_recent.decay_factor <= 1.0);
        }

        /// Access restores the decay factor to 1 and never lowers the score.
        #[test]
        fn access_resets_decay(
            memory_type in memory_type(),
            idle in 1i64..1000
        ) {
            let (store, _) = seeded_store(0);
            let engine = ScoringEngine::default();
            let now = Utc::now();
            let entry = MemoryEntry::new(Scope::new("acme", "eng"), memory_type, "x")
                .with_created_at(now - Duration::days(idle));
            store.add_entry(&entry).unwrap();

            let before = engine.score(&entry, now, &ScoreSignals::from_entry(&entry));
            store.record_access(&[entry.id.clone()], now).unwrap();
            let touched = store.get_entry(&entry.id).unwrap().unwrap();
            let after = engine.score(&touched, now, &ScoreSignals::from_entry(&touched));

            prop_assert!((after.decay_factor - 1.0).abs() < 1e-9);
            prop_assert!(after.composite >= before.composite);
            prop_assert_eq!(touched.usage_count, entry.usage_count + 1);
        }
    }
}
