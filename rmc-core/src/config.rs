//! Engine configuration.
//!
//! Every tunable is carried in an explicit struct handed to the component
//! that needs it; nothing reads process-wide state.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::extract::ExtractionStrategy;
use crate::memory::{MemoryType, QualityTier};

/// Half-lives in days per memory type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HalfLives {
    pub episodic: f64,
    pub procedural: f64,
    pub semantic: f64,
    pub strategic: f64,
}

impl Default for HalfLives {
    fn default() -> Self {
        Self {
            episodic: 14.0,
            procedural: 35.0,
            semantic: 69.0,
            strategic: 693.0,
        }
    }
}

impl HalfLives {
    pub fn get(&self, memory_type: MemoryType) -> f64 {
        match memory_type {
            MemoryType::Episodic => self.episodic,
            MemoryType::Procedural => self.procedural,
            MemoryType::Semantic => self.semantic,
            MemoryType::Strategic => self.strategic,
        }
    }
}

/// Composite score weights, decay and tier thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub similarity_weight: f64,
    pub usage_weight: f64,
    pub validation_weight: f64,
    pub reputation_weight: f64,
    /// Usage count at which the log-scaled usage term reaches 1.0
    pub usage_saturation: u64,
    pub half_lives: HalfLives,
    pub platinum_threshold: f64,
    pub gold_threshold: f64,
    pub silver_threshold: f64,
    /// Decayed score under which a sweep archives a bronze entry
    pub archive_threshold: f64,
    /// Entries scored per sweep batch
    pub sweep_batch_size: usize,
    /// CAS retries before an entry is skipped for this sweep
    pub max_cas_retries: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            similarity_weight: 0.4,
            usage_weight: 0.2,
            validation_weight: 0.2,
            reputation_weight: 0.2,
            usage_saturation: 100,
            half_lives: HalfLives::default(),
            platinum_threshold: 0.9,
            gold_threshold: 0.7,
            silver_threshold: 0.5,
            archive_threshold: 0.1,
            sweep_batch_size: 200,
            max_cas_retries: 3,
        }
    }
}

impl ScoringConfig {
    /// Decay rate λ = ln 2 / half-life.
    pub fn lambda(&self, memory_type: MemoryType) -> f64 {
        let half_life = self.half_lives.get(memory_type);
        if half_life <= 0.0 {
            return 0.0;
        }
        std::f64::consts::LN_2 / half_life
    }

    /// Tier for a decayed composite score.
    pub fn tier_for(&self, score: f64) -> QualityTier {
        if score >= self.platinum_threshold {
            QualityTier::Platinum
        } else if score >= self.gold_threshold {
            QualityTier::Gold
        } else if score >= self.silver_threshold {
            QualityTier::Silver
        } else {
            QualityTier::Bronze
        }
    }

    pub fn with_weights(mut self, similarity: f64, usage: f64, validation: f64, reputation: f64) -> Self {
        self.similarity_weight = similarity;
        self.usage_weight = usage;
        self.validation_weight = validation;
        self.reputation_weight = reputation;
        self
    }

    pub fn with_half_lives(mut self, half_lives: HalfLives) -> Self {
        self.half_lives = half_lives;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let weights = [
            self.similarity_weight,
            self.usage_weight,
            self.validation_weight,
            self.reputation_weight,
        ];
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(Error::Config("score weights must be finite and non-negative".into()));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(Error::Config("score weights must not all be zero".into()));
        }
        for memory_type in MemoryType::ALL {
            if self.half_lives.get(memory_type) <= 0.0 {
                return Err(Error::Config(format!(
                    "half-life for {} must be positive",
                    memory_type
                )));
            }
        }
        if !(self.silver_threshold <= self.gold_threshold
            && self.gold_threshold <= self.platinum_threshold)
        {
            return Err(Error::Config(
                "tier thresholds must satisfy silver <= gold <= platinum".into(),
            ));
        }
        if self.usage_saturation == 0 {
            return Err(Error::Config("usage_saturation must be at least 1".into()));
        }
        if self.sweep_batch_size == 0 {
            return Err(Error::Config("sweep_batch_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Candidate generation, coarse filtering and the degree cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationConfig {
    /// Cosine similarity above which an entry becomes a candidate
    pub similarity_threshold: f64,
    /// Similarity that, together with entity overlap, warrants a model call
    pub high_similarity_threshold: f64,
    pub min_entity_overlap: usize,
    /// Overlap at which the rule path labels a pair SUPPORTS
    pub strong_overlap: usize,
    pub temporal_window_hours: i64,
    pub max_out_degree: usize,
    pub max_candidates: usize,
    /// Half-life of edge freshness used in eviction and traversal order
    pub edge_half_life_days: f64,
    /// Strength assigned to rule-labelled temporal edges
    pub temporal_strength: f64,
    /// Strength assigned to claim-collision CONTRADICTS edges without a model verdict
    pub contradiction_strength: f64,
}

impl Default for RelationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.75,
            high_similarity_threshold: 0.85,
            min_entity_overlap: 2,
            strong_overlap: 3,
            temporal_window_hours: 24,
            max_out_degree: 10,
            max_candidates: 50,
            edge_half_life_days: 30.0,
            temporal_strength: 0.3,
            contradiction_strength: 0.9,
        }
    }
}

impl RelationConfig {
    /// Fewer, higher-confidence edges.
    pub fn strict() -> Self {
        Self {
            similarity_threshold: 0.85,
            high_similarity_threshold: 0.92,
            min_entity_overlap: 3,
            strong_overlap: 4,
            temporal_window_hours: 6,
            max_out_degree: 5,
            max_candidates: 25,
            ..Self::default()
        }
    }

    /// Denser graph for small or exploratory stores.
    pub fn permissive() -> Self {
        Self {
            similarity_threshold: 0.6,
            high_similarity_threshold: 0.75,
            min_entity_overlap: 1,
            strong_overlap: 2,
            temporal_window_hours: 72,
            max_out_degree: 20,
            max_candidates: 100,
            ..Self::default()
        }
    }

    pub fn with_max_out_degree(mut self, cap: usize) -> Self {
        self.max_out_degree = cap;
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_out_degree == 0 {
            return Err(Error::Config("max_out_degree must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold)
            || !(0.0..=1.0).contains(&self.high_similarity_threshold)
        {
            return Err(Error::Config("similarity thresholds must be in [0, 1]".into()));
        }
        if self.high_similarity_threshold < self.similarity_threshold {
            return Err(Error::Config(
                "high_similarity_threshold must not be below similarity_threshold".into(),
            ));
        }
        if self.temporal_window_hours < 0 {
            return Err(Error::Config("temporal_window_hours must be non-negative".into()));
        }
        if self.edge_half_life_days <= 0.0 {
            return Err(Error::Config("edge_half_life_days must be positive".into()));
        }
        Ok(())
    }
}

/// Retrieval defaults and bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Ceiling on caller-supplied `top_k`
    pub max_top_k: usize,
    pub min_similarity: f64,
    pub default_max_depth: usize,
    /// Hard ceiling on traversal depth regardless of caller options
    pub max_depth_limit: usize,
    /// Edges followed per node during expansion
    pub edge_budget: usize,
    pub max_related: usize,
    pub max_paths: usize,
    /// Use token overlap when the query cannot be embedded
    pub keyword_fallback: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            max_top_k: 100,
            min_similarity: 0.3,
            default_max_depth: 2,
            max_depth_limit: 3,
            edge_budget: 10,
            max_related: 50,
            max_paths: 20,
            keyword_fallback: true,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(Error::Config("top_k must be at least 1".into()));
        }
        if self.top_k > self.max_top_k {
            return Err(Error::Config("top_k exceeds max_top_k".into()));
        }
        if self.max_paths == 0 {
            return Err(Error::Config("max_paths must be at least 1".into()));
        }
        if self.default_max_depth > self.max_depth_limit {
            return Err(Error::Config(
                "default_max_depth exceeds max_depth_limit".into(),
            ));
        }
        if self.edge_budget == 0 {
            return Err(Error::Config("edge_budget must be at least 1".into()));
        }
        Ok(())
    }
}

/// Conflict detection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Claim keys whose collisions are Medium rather than Low severity
    pub important_claim_keys: Vec<String>,
    /// Settle Low-severity conflicts without a human
    pub auto_resolve_low: bool,
    /// Minimum similarity for a semantic contradiction candidate
    pub semantic_similarity_threshold: f64,
    pub max_semantic_candidates: usize,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            important_claim_keys: vec![
                "database".into(),
                "db".into(),
                "architecture".into(),
                "language".into(),
                "deployment".into(),
            ],
            auto_resolve_low: false,
            semantic_similarity_threshold: 0.6,
            max_semantic_candidates: 20,
        }
    }
}

impl ConflictConfig {
    /// Wider semantic net, nothing settled automatically.
    pub fn strict() -> Self {
        Self {
            auto_resolve_low: false,
            semantic_similarity_threshold: 0.5,
            max_semantic_candidates: 50,
            ..Self::default()
        }
    }

    /// Low-severity collisions settle themselves; only close matches are
    /// examined semantically.
    pub fn permissive() -> Self {
        Self {
            auto_resolve_low: true,
            semantic_similarity_threshold: 0.75,
            max_semantic_candidates: 10,
            ..Self::default()
        }
    }

    pub fn is_important(&self, claim_key: &str) -> bool {
        let key = claim_key.trim();
        self.important_claim_keys
            .iter()
            .any(|k| k.eq_ignore_ascii_case(key))
    }

    pub fn with_important_keys(mut self, keys: Vec<String>) -> Self {
        self.important_claim_keys = keys;
        self
    }

    pub fn with_auto_resolve_low(mut self, enabled: bool) -> Self {
        self.auto_resolve_low = enabled;
        self
    }
}

/// Entity extraction strategy and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub strategy: ExtractionStrategy,
    /// Bound on the model path before falling back to rules
    pub model_timeout_ms: u64,
    pub max_entities: usize,
    pub min_confidence: f64,
    /// Extra technology names recognised by the rule extractor
    pub extra_vocabulary: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            strategy: ExtractionStrategy::Model,
            model_timeout_ms: 5_000,
            max_entities: 50,
            min_confidence: 0.3,
            extra_vocabulary: Vec::new(),
        }
    }
}

/// Worker pool and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Idle sleep between queue polls
    pub poll_interval_ms: u64,
    /// Bound on each model call made by a pipeline stage
    pub model_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            poll_interval_ms: 100,
            model_timeout_ms: 10_000,
        }
    }
}

impl PipelineConfig {
    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1) as i32;
        let delay = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exp);
        (delay as u64).min(self.max_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::Config("backoff_multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scoring: ScoringConfig,
    pub relations: RelationConfig,
    pub retrieval: RetrievalConfig,
    pub conflict: ConflictConfig,
    pub extraction: ExtractionConfig,
    pub pipeline: PipelineConfig,
    /// Byte limit on entry content
    pub max_content_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scoring: ScoringConfig::default(),
            relations: RelationConfig::default(),
            retrieval: RetrievalConfig::default(),
            conflict: ConflictConfig::default(),
            extraction: ExtractionConfig::default(),
            pipeline: PipelineConfig::default(),
            max_content_len: 100_000,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Never call a model; every stage uses its rule path.
    pub fn rules_only() -> Self {
        let mut config = Self::new();
        config.extraction.strategy = ExtractionStrategy::Rules;
        config
    }

    /// Small pool and near-zero backoff for tests.
    pub fn for_testing() -> Self {
        let mut config = Self::new();
        config.pipeline.workers = 2;
        config.pipeline.initial_backoff_ms = 1;
        config.pipeline.max_backoff_ms = 5;
        config.pipeline.poll_interval_ms = 5;
        config
    }

    pub fn with_scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn with_relations(mut self, relations: RelationConfig) -> Self {
        self.relations = relations;
        self
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn with_conflict(mut self, conflict: ConflictConfig) -> Self {
        self.conflict = conflict;
        self
    }

    pub fn with_extraction(mut self, extraction: ExtractionConfig) -> Self {
        self.extraction = extraction;
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.scoring.validate()?;
        self.relations.validate()?;
        self.retrieval.validate()?;
        self.pipeline.validate()?;
        if self.max_content_len == 0 {
            return Err(Error::Config("max_content_len must be positive".into()));
        }
        Ok(())
    }
}
