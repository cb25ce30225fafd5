//! The relational memory facade.
//!
//! [`RelationalMemory`] wires the datastore, the inference chain and the
//! background pipeline together and exposes the operations callers use.
//! Writes return as soon as the raw entry is persisted and structurally
//! checked; enrichment happens on the job queue.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rmc_core::{EngineConfig, MemoryType, NewMemory, RelationalMemory, RetrieveOptions, Scope};
//!
//! let memory = RelationalMemory::in_memory(EngineConfig::default())?;
//! let workers = memory.start_workers()?;
//!
//! let scope = Scope::new("acme", "platform");
//! memory
//!     .create(NewMemory::new(scope, MemoryType::Strategic, "We standardise on Postgres").with_claim("db", "Postgres"))
//!     .await?;
//!
//! let result = memory
//!     .retrieve("which database do we use", &RetrieveOptions::for_org("acme").include_paths(true))
//!     .await?;
//! workers.shutdown().await?;
//! ```

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::conflict::ConflictDetector;
use crate::embedding::{Embedder, HashEmbedder};
use crate::error::{Error, Result};
use crate::extract::{EntityExtractor, ExtractionStrategy, RuleExtractor};
use crate::inference::{ArbitrationProposal, InferenceBackend, InferenceChain, RuleInference};
use crate::memory::{
    ConflictId, ConflictResolution, ConflictStatus, MemoryConflict, MemoryEntry, MemoryId,
    MemoryStats, NewMemory, SqliteMemoryStore, VersionTree,
};
use crate::pipeline::{Pipeline, WorkerPool};
use crate::queue::{Job, JobKind, JobQueue, JobStatus};
use crate::relations::RelationBuilder;
use crate::retrieval::{RetrievalResult, RetrieveOptions, Retriever};
use crate::scoring::{ScoringEngine, SweepReport};

/// Store statistics plus the job queue's state.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub memory: MemoryStats,
    pub jobs: HashMap<JobStatus, i64>,
}

impl EngineStats {
    pub fn jobs_with_status(&self, status: JobStatus) -> i64 {
        self.jobs.get(&status).copied().unwrap_or(0)
    }
}

pub struct RelationalMemory {
    store: SqliteMemoryStore,
    config: EngineConfig,
    embedder: Arc<dyn Embedder>,
    queue: JobQueue,
    conflicts: ConflictDetector,
    scoring: ScoringEngine,
    retriever: Retriever,
    pipeline: Pipeline,
}

impl RelationalMemory {
    /// Assemble an engine over `store`. Without a `model` (or with the rules
    /// extraction strategy) every stage uses its rule path.
    pub fn new(
        store: SqliteMemoryStore,
        config: EngineConfig,
        embedder: Arc<dyn Embedder>,
        model: Option<Arc<dyn InferenceBackend>>,
    ) -> Result<Self> {
        config.validate()?;

        let model = match config.extraction.strategy {
            ExtractionStrategy::Model | ExtractionStrategy::Hybrid => model,
            ExtractionStrategy::Rules => None,
        };
        let rules = RuleInference::new(RuleExtractor::new(config.extraction.extra_vocabulary.clone()));
        let chain = match model {
            Some(ref backend) => InferenceChain::new(
                Some(Arc::clone(backend)),
                rules,
                Duration::from_millis(config.pipeline.model_timeout_ms),
            ),
            None => InferenceChain::rules_only(rules),
        };

        let queue = JobQueue::new(store.clone());
        let scoring = ScoringEngine::new(config.scoring.clone());
        let conflicts = ConflictDetector::new(store.clone(), chain.clone(), config.conflict.clone());
        let retriever = Retriever::new(
            store.clone(),
            Arc::clone(&embedder),
            scoring.clone(),
            config.retrieval.clone(),
            config.relations.edge_half_life_days,
        );
        let pipeline = Pipeline::new(
            store.clone(),
            queue.clone(),
            Arc::clone(&embedder),
            EntityExtractor::new(&config.extraction, model.clone()),
            RelationBuilder::new(store.clone(), chain, config.relations.clone()),
            scoring.clone(),
            conflicts.clone(),
            config.pipeline.clone(),
        )
        .with_semantic_candidates(config.conflict.max_semantic_candidates);

        info!(
            embedder = embedder.name(),
            model = model.as_ref().map(|m| m.name()).unwrap_or("rules"),
            workers = config.pipeline.workers,
            "Relational memory ready"
        );

        Ok(Self {
            store,
            config,
            embedder,
            queue,
            conflicts,
            scoring,
            retriever,
            pipeline,
        })
    }

    /// In-memory store with the hashing embedder and no model.
    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        Self::new(
            SqliteMemoryStore::in_memory()?,
            config,
            Arc::new(HashEmbedder::default()),
            None,
        )
    }

    pub fn store(&self) -> &SqliteMemoryStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ==================== Writes ====================

    /// Validate, persist and queue a new entry. Returns once the raw entry and
    /// its processing job are committed; structural conflicts are normally
    /// recorded before returning too.
    pub async fn create(&self, input: NewMemory) -> Result<MemoryId> {
        input.validate(self.config.max_content_len)?;
        self.persist(input.into_entry()).await
    }

    /// Record an edited version of `parent_id`. The new entry joins the
    /// parent's lineage and is linked to it with DERIVED_FROM.
    pub async fn create_version(&self, parent_id: &MemoryId, input: NewMemory) -> Result<MemoryId> {
        input.validate(self.config.max_content_len)?;
        let parent = self.store.require_entry(parent_id)?;
        if parent.scope.org_id != input.scope.org_id {
            return Err(Error::malformed(format!(
                "version must stay in org {}, got {}",
                parent.scope.org_id, input.scope.org_id
            )));
        }
        self.persist(input.into_entry().with_parent(&parent)).await
    }

    async fn persist(&self, mut entry: MemoryEntry) -> Result<MemoryId> {
        if entry.embedding.is_none() {
            match self.embedder.embed(&entry.content).await {
                Ok(embedding) => entry.embedding = Some(embedding),
                Err(e) => {
                    warn!(memory_id = %entry.id, error = %e, "Embedding deferred to pipeline");
                }
            }
        }

        self.queue.enqueue_with_entry(
            &entry,
            JobKind::ProcessEntry,
            self.config.pipeline.max_attempts,
            Utc::now(),
        )?;
        // The entry is stored and queued; the pipeline repeats this check.
        let conflicts = match self.conflicts.check_structural(&entry) {
            Ok(conflicts) => conflicts.len(),
            Err(e) => {
                warn!(memory_id = %entry.id, error = %e, "Structural check deferred to pipeline");
                0
            }
        };

        debug!(
            memory_id = %entry.id,
            memory_type = %entry.memory_type,
            structural_conflicts = conflicts,
            "Entry created"
        );
        Ok(entry.id)
    }

    pub fn get(&self, id: &MemoryId) -> Result<Option<MemoryEntry>> {
        self.store.get_entry(id)
    }

    // ==================== Reads ====================

    pub async fn retrieve(&self, query: &str, options: &RetrieveOptions) -> Result<RetrievalResult> {
        self.retriever.retrieve(query, options).await
    }

    /// Retrieve as of a fixed instant.
    pub async fn retrieve_at(
        &self,
        query: &str,
        options: &RetrieveOptions,
        now: DateTime<Utc>,
    ) -> Result<RetrievalResult> {
        self.retriever.retrieve_at(query, options, now).await
    }

    pub fn get_version_tree(&self, root_id: &MemoryId) -> Result<VersionTree> {
        self.store.get_version_tree(root_id)
    }

    pub fn get_version_history(&self, entry_id: &MemoryId) -> Result<Vec<MemoryEntry>> {
        self.store.get_version_history(entry_id)
    }

    // ==================== Conflicts ====================

    /// Conflicts in an org, optionally one namespace, optionally one status.
    pub fn list_conflicts(
        &self,
        org_id: &str,
        namespace: Option<&str>,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<MemoryConflict>> {
        self.store.list_conflicts(org_id, namespace, status)
    }

    pub fn resolve_conflict(
        &self,
        id: &ConflictId,
        resolution: ConflictResolution,
    ) -> Result<MemoryConflict> {
        self.conflicts.resolve(id, resolution)
    }

    pub fn ignore_conflict(&self, id: &ConflictId, actor: &str) -> Result<MemoryConflict> {
        self.conflicts.ignore(id, actor)
    }

    /// Suggested outcome for a conflict. Nothing is applied.
    pub async fn propose_resolution(&self, id: &ConflictId) -> Result<ArbitrationProposal> {
        self.conflicts.propose_resolution(id).await
    }

    // ==================== Lifecycle ====================

    pub async fn run_decay_sweep(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        self.run_decay_sweep_at(Utc::now(), cancel).await
    }

    pub async fn run_decay_sweep_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<SweepReport> {
        self.scoring.sweep(&self.store, None, now, cancel).await
    }

    /// Spawn the worker pool. Requires a tokio runtime.
    pub fn start_workers(&self) -> Result<WorkerPool> {
        self.pipeline.spawn_workers(CancellationToken::new())
    }

    /// Process queued work on the calling task until nothing is outstanding.
    pub async fn run_until_idle(&self) -> Result<usize> {
        self.pipeline.run_until_idle().await
    }

    pub fn failed_jobs(&self) -> Result<Vec<Job>> {
        self.queue.failed_jobs()
    }

    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            memory: self.store.stats()?,
            jobs: self.queue.counts()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Extraction;
    use crate::inference::{ContradictionVerdict, RelationVerdict};
    use crate::memory::{InferredBy, MemoryType, ProcessingState, RelationType, Scope};
    use crate::retrieval::PathKind;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    /// Labels scripted pairs CAUSES, everything else unrelated.
    struct ScriptedBackend {
        causes: Vec<(&'static str, &'static str, f64)>,
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        async fn extract_entities(&self, _text: &str) -> Result<Extraction> {
            Ok(Extraction::default())
        }

        async fn classify_relation(
            &self,
            a: &MemoryEntry,
            b: &MemoryEntry,
        ) -> Result<Option<RelationVerdict>> {
            Ok(self
                .causes
                .iter()
                .find(|(from, to, _)| a.content.contains(from) && b.content.contains(to))
                .map(|(_, _, strength)| RelationVerdict {
                    relation_type: RelationType::Causes,
                    strength: *strength,
                    reason: Some("scripted".into()),
                }))
        }

        async fn detect_contradiction(
            &self,
            _a: &MemoryEntry,
            _b: &MemoryEntry,
        ) -> Result<ContradictionVerdict> {
            Ok(ContradictionVerdict {
                contradicts: false,
                confidence: 0.9,
                reason: "scripted".into(),
            })
        }

        async fn arbitrate(&self, a: &MemoryEntry, _b: &MemoryEntry) -> Result<ArbitrationProposal> {
            Ok(ArbitrationProposal {
                winner_id: Some(a.id.clone()),
                reason: "scripted".into(),
                confidence: 0.7,
                proposed_by: InferredBy::Model,
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn engine() -> RelationalMemory {
        RelationalMemory::in_memory(EngineConfig::for_testing()).unwrap()
    }

    fn scope() -> Scope {
        Scope::new("acme", "platform")
    }

    #[tokio::test]
    async fn test_strategic_claims_yield_one_conflict() {
        let memory = engine();
        let a = memory
            .create(NewMemory::new(scope(), MemoryType::Strategic, "Primary store is Postgres").with_claim("db", "Postgres"))
            .await
            .unwrap();
        let b = memory
            .create(NewMemory::new(scope(), MemoryType::Strategic, "Primary store is Mongo").with_claim("db", "Mongo"))
            .await
            .unwrap();

        let check = |memory: &RelationalMemory| {
            let pending = memory
                .list_conflicts("acme", None, Some(ConflictStatus::Pending))
                .unwrap();
            assert_eq!(pending.len(), 1);
            assert!(pending[0].involves(&a) && pending[0].involves(&b));
        };
        check(&memory);

        memory.run_until_idle().await.unwrap();
        check(&memory);
        assert!(memory.failed_jobs().unwrap().is_empty());

        let contradicts = memory
            .store()
            .outgoing_relations(&b, Some(&[RelationType::Contradicts]))
            .unwrap();
        assert_eq!(contradicts.len(), 1);
        assert_eq!(contradicts[0].target_id, a);
    }

    #[tokio::test]
    async fn test_structural_conflict_precedes_pipeline() {
        let memory = engine();
        let a = memory
            .create(NewMemory::new(scope(), MemoryType::Semantic, "Billing runs on PostgreSQL").with_claim("database", "PostgreSQL"))
            .await
            .unwrap();
        let b = memory
            .create(NewMemory::new(scope(), MemoryType::Semantic, "Billing runs on MongoDB").with_claim("database", "MongoDB"))
            .await
            .unwrap();

        for id in [&a, &b] {
            assert_eq!(memory.get(id).unwrap().unwrap().processing, ProcessingState::Pending);
        }
        let pending = memory
            .list_conflicts("acme", Some("platform"), Some(ConflictStatus::Pending))
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].claim_key.as_deref(), Some("database"));
        assert_eq!(memory.stats().unwrap().jobs_with_status(JobStatus::Pending), 2);
    }

    #[tokio::test]
    async fn test_entry_is_queued_when_structural_check_fails() {
        let memory = engine();
        memory
            .create(NewMemory::new(scope(), MemoryType::Semantic, "Billing runs on PostgreSQL").with_claim("database", "PostgreSQL"))
            .await
            .unwrap();
        memory
            .store()
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_conflicts BEFORE INSERT ON conflicts
                     BEGIN SELECT RAISE(ABORT, 'conflicts unavailable'); END;",
                )
            })
            .unwrap();

        let b = memory
            .create(NewMemory::new(scope(), MemoryType::Semantic, "Billing runs on MongoDB").with_claim("database", "MongoDB"))
            .await
            .unwrap();

        assert_eq!(memory.get(&b).unwrap().unwrap().processing, ProcessingState::Pending);
        assert_eq!(memory.stats().unwrap().jobs_with_status(JobStatus::Pending), 2);
        assert!(memory.list_conflicts("acme", None, None).unwrap().is_empty());

        memory
            .store()
            .with_conn(|conn| conn.execute_batch("DROP TRIGGER reject_conflicts"))
            .unwrap();
        memory.run_until_idle().await.unwrap();

        let conflicts = memory.list_conflicts("acme", None, None).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].involves(&b));
        assert_eq!(memory.get(&b).unwrap().unwrap().processing, ProcessingState::Enriched);
    }

    #[tokio::test]
    async fn test_causal_chain_through_pipeline() {
        let backend = Arc::new(ScriptedBackend {
            causes: vec![
                ("Marketing campaign", "Database CPU", 0.9),
                ("Database CPU", "Checkout outage", 0.85),
            ],
        });
        let memory = RelationalMemory::new(
            SqliteMemoryStore::in_memory().unwrap(),
            EngineConfig::for_testing(),
            Arc::new(HashEmbedder::default()),
            Some(backend),
        )
        .unwrap();

        let mut ids = Vec::new();
        for text in [
            "Marketing campaign doubled signups overnight",
            "Database CPU saturated at peak",
            "Checkout outage lasted two hours",
        ] {
            ids.push(
                memory
                    .create(NewMemory::new(scope(), MemoryType::Strategic, text))
                    .await
                    .unwrap(),
            );
            // Distinct creation instants fix the earlier → later direction.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        memory.run_until_idle().await.unwrap();

        let result = memory
            .retrieve(
                "marketing campaign doubled signups",
                &RetrieveOptions::for_org("acme").include_paths(true).reinforce(false),
            )
            .await
            .unwrap();
        assert_eq!(result.direct_matches[0].entry.id, ids[0]);

        let causal: Vec<_> = result
            .inference_paths
            .iter()
            .filter(|p| p.kind == PathKind::CausalChain)
            .collect();
        assert_eq!(causal.len(), 1);
        assert_eq!(causal[0].nodes, ids);
        assert!((causal[0].confidence - 0.9 * 0.85).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_retrieval_is_deterministic() {
        let memory = engine();
        for text in [
            "Redis cache hit rate dropped after the deploy",
            "Cache eviction policy changed to LRU",
            "Deploy pipeline now runs canary first",
        ] {
            memory
                .create(NewMemory::new(scope(), MemoryType::Semantic, text))
                .await
                .unwrap();
        }
        memory.run_until_idle().await.unwrap();

        let opts = RetrieveOptions::for_org("acme").include_paths(true).reinforce(false);
        let now = Utc::now();
        let first = memory.retrieve_at("Redis cache hit rate dropped", &opts, now).await.unwrap();
        let second = memory.retrieve_at("Redis cache hit rate dropped", &opts, now).await.unwrap();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_versions_and_lineage() {
        let memory = engine();
        let v1 = memory
            .create(NewMemory::new(scope(), MemoryType::Procedural, "Rotate keys monthly"))
            .await
            .unwrap();
        let v2 = memory
            .create_version(&v1, NewMemory::new(scope(), MemoryType::Procedural, "Rotate keys weekly"))
            .await
            .unwrap();
        memory.run_until_idle().await.unwrap();

        let tree = memory.get_version_tree(&v1).unwrap();
        assert_eq!(tree.len(), 2);
        let history: Vec<MemoryId> = memory
            .get_version_history(&v2)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(history, vec![v2.clone(), v1.clone()]);

        let derived = memory
            .store()
            .outgoing_relations(&v2, Some(&[RelationType::DerivedFrom]))
            .unwrap();
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].target_id, v1);

        let other_org = NewMemory::new(Scope::new("globex", "ops"), MemoryType::Procedural, "x");
        assert!(matches!(
            memory.create_version(&v1, other_org).await,
            Err(Error::MalformedInput(_))
        ));
    }

    #[tokio::test]
    async fn test_conflict_actions() {
        let memory = engine();
        let a = memory
            .create(NewMemory::new(scope(), MemoryType::Semantic, "Deploys happen on Tuesday").with_claim("deploy_day", "Tuesday"))
            .await
            .unwrap();
        memory
            .create(NewMemory::new(scope(), MemoryType::Semantic, "Deploys happen on Thursday").with_claim("deploy_day", "Thursday"))
            .await
            .unwrap();
        let conflict = memory
            .list_conflicts("acme", None, Some(ConflictStatus::Pending))
            .unwrap()
            .remove(0);

        let proposal = memory.propose_resolution(&conflict.id).await.unwrap();
        assert_eq!(proposal.proposed_by, InferredBy::Rule);
        let untouched = memory.store().get_conflict(&conflict.id).unwrap().unwrap();
        assert_eq!(untouched.status, ConflictStatus::Pending);

        let resolved = memory
            .resolve_conflict(&conflict.id, ConflictResolution::new(Some(a.clone()), "ops confirmed", "alice"))
            .unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);
        assert!(matches!(
            memory.ignore_conflict(&conflict.id, "bob"),
            Err(Error::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_malformed_input() {
        let memory = engine();
        let empty = NewMemory::new(scope(), MemoryType::Episodic, "   ");
        assert!(matches!(memory.create(empty).await, Err(Error::MalformedInput(_))));
        assert_eq!(memory.stats().unwrap().memory.total_entries, 0);
    }

    #[tokio::test]
    async fn test_sweep_and_stats() {
        let memory = engine();
        memory
            .create(NewMemory::new(scope(), MemoryType::Episodic, "Standup moved to 10am"))
            .await
            .unwrap();
        memory.run_until_idle().await.unwrap();

        let report = memory
            .run_decay_sweep_at(Utc::now() + chrono::Duration::days(365), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.archived, 1);

        let stats = memory.stats().unwrap();
        assert_eq!(stats.memory.archived_entries, 1);
        assert_eq!(stats.jobs_with_status(JobStatus::Done), 1);
        assert_eq!(stats.jobs_with_status(JobStatus::Failed), 0);
    }
}
