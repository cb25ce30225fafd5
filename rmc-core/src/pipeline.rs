//! Background enrichment: the stages run for each persisted entry.
//!
//! A `process_entry` job embeds the entry if it has no vector, extracts
//! entities, builds relations and scores it, strictly in that order. Strategic
//! entries then get a `detect_conflicts` job. Jobs for different entries run
//! in any order across the worker pool.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::conflict::ConflictDetector;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::extract::EntityExtractor;
use crate::memory::{InferredBy, MemoryId, MemoryType, ProcessingState, SqliteMemoryStore};
use crate::queue::{Job, JobKind, JobQueue, JobStatus};
use crate::relations::RelationBuilder;
use crate::scoring::{ScoringEngine, SweepReport};

/// What one `process_entry` run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryReport {
    pub embedded: bool,
    pub entities: usize,
    pub extracted_by: Option<InferredBy>,
    pub relations: usize,
    pub evicted: usize,
    pub composite_score: Option<f64>,
    /// Structural conflicts first recorded by this run
    pub structural_conflicts: usize,
    pub conflicts_queued: bool,
}

/// Stage runner shared by every worker.
#[derive(Clone)]
pub struct Pipeline {
    store: SqliteMemoryStore,
    queue: JobQueue,
    embedder: Arc<dyn Embedder>,
    extractor: EntityExtractor,
    relations: RelationBuilder,
    scoring: ScoringEngine,
    conflicts: ConflictDetector,
    config: PipelineConfig,
    /// Candidate count for the semantic conflict vector search
    semantic_candidates: usize,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SqliteMemoryStore,
        queue: JobQueue,
        embedder: Arc<dyn Embedder>,
        extractor: EntityExtractor,
        relations: RelationBuilder,
        scoring: ScoringEngine,
        conflicts: ConflictDetector,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            embedder,
            extractor,
            relations,
            scoring,
            conflicts,
            config,
            semantic_candidates: 20,
        }
    }

    pub fn with_semantic_candidates(mut self, k: usize) -> Self {
        self.semantic_candidates = k.max(1);
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Embed, extract, relate and score one entry.
    pub async fn process_entry(&self, id: &MemoryId, now: DateTime<Utc>) -> Result<EntryReport> {
        let mut report = EntryReport::default();
        let mut entry = self.store.require_entry(id)?;
        if entry.archived {
            debug!(memory_id = %id, "Skipping archived entry");
            return Ok(report);
        }

        if entry.embedding.is_none() {
            let embedding = self.embedder.embed(&entry.content).await?;
            self.store.set_embedding(id, &embedding)?;
            entry.embedding = Some(embedding);
            report.embedded = true;
        }

        // Usually a no-op: create already ran it unless the check failed there.
        report.structural_conflicts = self.conflicts.check_structural(&entry)?.len();

        let (extraction, by) = self.extractor.extract(&entry.content).await;
        let tags = self.store.record_extraction(
            id,
            &extraction.entities,
            &extraction.concepts,
            &extraction.topics,
        )?;
        report.entities = tags.len();
        report.extracted_by = Some(by);

        let (stored, stats) = self.relations.build_relations(&entry, now).await?;
        report.relations = stored.len();
        report.evicted = stats.evicted;

        let mut scratch = SweepReport::default();
        if let Some((_, breakdown)) = self.scoring.rescore(&self.store, id, now, &mut scratch)? {
            report.composite_score = Some(breakdown.composite);
        }

        if entry.memory_type == MemoryType::Strategic {
            self.queue
                .enqueue(JobKind::DetectConflicts, id, self.config.max_attempts, now)?;
            report.conflicts_queued = true;
        }

        self.store.set_processing(id, ProcessingState::Enriched)?;
        debug!(
            memory_id = %id,
            entities = report.entities,
            relations = report.relations,
            model_calls = stats.model_calls,
            "Entry enriched"
        );
        Ok(report)
    }

    /// Semantic contradiction pass for a strategic entry. Returns conflicts created.
    pub async fn detect_conflicts(&self, id: &MemoryId) -> Result<usize> {
        let entry = self.store.require_entry(id)?;
        if entry.archived {
            return Ok(0);
        }
        let similar = match entry.embedding {
            Some(ref embedding) => self.store.vector_search(
                embedding,
                &entry.scope.org_id,
                None,
                self.semantic_candidates + 1,
                0.0,
                false,
            )?,
            None => Vec::new(),
        };
        let created = self.conflicts.detect_semantic(&entry, &similar).await?;
        Ok(created.len())
    }

    /// Run one claimed job and record its outcome in the queue.
    pub async fn run_job(&self, job: &Job) -> Result<JobStatus> {
        let id = &job.payload.memory_id;
        let now = Utc::now();
        let outcome = match job.kind {
            JobKind::ProcessEntry => self.process_entry(id, now).await.map(|_| ()),
            JobKind::DetectConflicts => self.detect_conflicts(id).await.map(|_| ()),
        };

        match outcome {
            Ok(()) => {
                self.queue.complete(job.id, Utc::now())?;
                Ok(JobStatus::Done)
            }
            Err(e) => {
                let retry_after = e.is_retryable().then(|| {
                    ChronoDuration::milliseconds(self.config.backoff_ms(job.attempts) as i64)
                });
                let status = self
                    .queue
                    .fail(job, &e.to_string(), retry_after, Utc::now())?;
                if status == JobStatus::Failed && job.kind == JobKind::ProcessEntry {
                    // Entry may be gone; nothing else to mark then.
                    if let Err(mark) = self.store.set_processing(id, ProcessingState::Partial) {
                        debug!(memory_id = %id, error = %mark, "Could not mark entry partial");
                    }
                }
                Ok(status)
            }
        }
    }

    /// Claim and run the next due job. `false` when none was due.
    pub async fn run_once(&self) -> Result<bool> {
        match self.queue.claim_next(Utc::now())? {
            Some(job) => {
                self.run_job(&job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drain the queue on the calling task, waiting out retry backoffs.
    ///
    /// Returns the number of jobs run. Jobs claimed by concurrent workers
    /// are waited for too.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut ran = 0;
        loop {
            if self.run_once().await? {
                ran += 1;
                continue;
            }
            if !self.queue.has_outstanding()? {
                break;
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
        Ok(ran)
    }

    /// Spawn `config.workers` tasks pulling from the queue until `cancel` fires.
    pub fn spawn_workers(&self, cancel: CancellationToken) -> Result<WorkerPool> {
        let recovered = self.queue.recover(Utc::now())?;
        if recovered > 0 {
            info!(recovered, "Re-queued jobs left running by a previous process");
        }

        let handles = (0..self.config.workers)
            .map(|worker| {
                let pipeline = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { pipeline.worker_loop(worker, cancel).await })
            })
            .collect();
        info!(workers = self.config.workers, "Worker pool started");
        Ok(WorkerPool { cancel, handles })
    }

    async fn worker_loop(self, worker: usize, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => warn!(worker, error = %e, "Worker could not run job"),
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.poll_interval()) => {}
            }
        }
        debug!(worker, "Worker stopped");
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }
}

/// Handle to running workers. Dropping it cancels them.
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop after each worker's current job and wait for all of them.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        for handle in std::mem::take(&mut self.handles) {
            handle
                .await
                .map_err(|e| Error::Internal(format!("worker task panicked: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
