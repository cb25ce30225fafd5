//! Core types for the relational memory store.
//!
//! Records reference each other by opaque ids only. Relations are
//! `(source_id, target_id)` pairs held in the datastore, so cycles such as
//! "A causes B, B contradicts A" never become ownership cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Error;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse from string.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a memory entry.
    MemoryId
);
uuid_id!(
    /// Unique identifier for an entity tag.
    EntityId
);
uuid_id!(
    /// Unique identifier for a relation row.
    RelationId
);
uuid_id!(
    /// Unique identifier for a conflict record.
    ConflictId
);

/// Implements `Display` and `FromStr` over a fixed string table.
macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            /// Canonical storage form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err($crate::error::Error::malformed(format!(
                        "unknown {}: {}",
                        $kind, other
                    ))),
                }
            }
        }
    };
}
pub(crate) use string_enum;

/// Kind of memory; governs the decay rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Events and observations; fades quickly.
    Episodic,
    /// Facts and knowledge.
    Semantic,
    /// Long-lived decisions and direction; near-permanent.
    Strategic,
    /// How-to knowledge and patterns.
    Procedural,
}

string_enum!(MemoryType, "memory type", {
    Episodic => "episodic",
    Semantic => "semantic",
    Strategic => "strategic",
    Procedural => "procedural",
});

impl MemoryType {
    pub const ALL: [MemoryType; 4] = [
        MemoryType::Episodic,
        MemoryType::Semantic,
        MemoryType::Strategic,
        MemoryType::Procedural,
    ];
}

/// Format of the entry payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Text,
    Markdown,
    Json,
    Code,
}

string_enum!(ContentType, "content type", {
    Text => "text",
    Markdown => "markdown",
    Json => "json",
    Code => "code",
});

/// Discrete quality bucket derived from the decayed composite score.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    /// Candidate for archival
    #[default]
    Bronze = 0,
    Silver = 1,
    Gold = 2,
    /// Eligible for promotion to a wider-visibility pool
    Platinum = 3,
}

string_enum!(QualityTier, "tier", {
    Bronze => "bronze",
    Silver => "silver",
    Gold => "gold",
    Platinum => "platinum",
});

impl QualityTier {
    pub fn from_i32(i: i32) -> Self {
        match i {
            3 => Self::Platinum,
            2 => Self::Gold,
            1 => Self::Silver,
            _ => Self::Bronze,
        }
    }
}

/// Who wrote an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerKind {
    #[default]
    Human,
    Agent,
}

string_enum!(ProducerKind, "producer kind", {
    Human => "human",
    Agent => "agent",
});

/// Producer of a memory entry with its reputation in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Producer {
    pub kind: ProducerKind,
    pub id: String,
    pub reputation: f64,
}

impl Producer {
    pub fn human(id: impl Into<String>) -> Self {
        Self {
            kind: ProducerKind::Human,
            id: id.into(),
            reputation: 0.5,
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            kind: ProducerKind::Agent,
            id: id.into(),
            reputation: 0.5,
        }
    }

    pub fn with_reputation(mut self, reputation: f64) -> Self {
        self.reputation = reputation.clamp(0.0, 1.0);
        self
    }
}

impl Default for Producer {
    fn default() -> Self {
        Self::human("anonymous")
    }
}

/// Organisation + namespace visibility scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub org_id: String,
    pub namespace: String,
}

impl Scope {
    pub fn new(org_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.org_id, self.namespace)
    }
}

/// Background enrichment state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    /// Persisted, post-processing not yet complete
    #[default]
    Pending,
    /// Extraction, relations and scoring done
    Enriched,
    /// Post-processing gave up; entry usable with partial enrichment
    Partial,
}

string_enum!(ProcessingState, "processing state", {
    Pending => "pending",
    Enriched => "enriched",
    Partial => "partial",
});

/// A persisted, scored, decaying unit of recorded knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: MemoryId,
    pub scope: Scope,
    pub content_type: ContentType,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub claim_key: Option<String>,
    pub claim_value: Option<String>,
    pub memory_type: MemoryType,
    pub confidence: f64,
    /// Undecayed composite from the last scoring pass
    pub base_score: f64,
    /// Decayed composite from the last scoring pass
    pub composite_score: f64,
    pub tier: QualityTier,
    pub producer: Producer,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub usage_count: u64,
    /// First version in this entry's edit lineage (itself for originals)
    pub root_id: MemoryId,
    /// Immediate predecessor in the lineage
    pub parent_id: Option<MemoryId>,
    /// Optimistic concurrency counter, bumped on every mutation
    pub version: i64,
    pub archived: bool,
    pub processing: ProcessingState,
    pub metadata: Option<HashMap<String, Value>>,
}

impl MemoryEntry {
    /// Create a new entry; it starts its own lineage.
    pub fn new(scope: Scope, memory_type: MemoryType, content: impl Into<String>) -> Self {
        let id = MemoryId::new();
        let now = Utc::now();
        Self {
            root_id: id.clone(),
            id,
            scope,
            content_type: ContentType::Text,
            content: content.into(),
            embedding: None,
            claim_key: None,
            claim_value: None,
            memory_type,
            confidence: 1.0,
            base_score: 0.0,
            composite_score: 0.0,
            tier: QualityTier::Bronze,
            producer: Producer::default(),
            created_at: now,
            last_accessed_at: now,
            usage_count: 0,
            parent_id: None,
            version: 0,
            archived: false,
            processing: ProcessingState::Pending,
            metadata: None,
        }
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.claim_key = Some(key.into());
        self.claim_value = Some(value.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_producer(mut self, producer: Producer) -> Self {
        self.producer = producer;
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.last_accessed_at = at;
        self
    }

    /// Make this entry the next version of `parent`.
    pub fn with_parent(mut self, parent: &MemoryEntry) -> Self {
        self.root_id = parent.root_id.clone();
        self.parent_id = Some(parent.id.clone());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Whether the entry carries a structured claim.
    pub fn has_claim(&self) -> bool {
        self.claim_key.is_some() && self.claim_value.is_some()
    }

    /// Whether `other` asserts a different value for the same claim key.
    pub fn claim_collides_with(&self, other: &MemoryEntry) -> bool {
        match (
            &self.claim_key,
            &self.claim_value,
            &other.claim_key,
            &other.claim_value,
        ) {
            (Some(k1), Some(v1), Some(k2), Some(v2)) => {
                k1 == k2 && normalize_claim_value(v1) != normalize_claim_value(v2)
            }
            _ => false,
        }
    }

    /// Days since last access, never negative.
    pub fn days_since_access(&self, now: DateTime<Utc>) -> f64 {
        let secs = (now - self.last_accessed_at).num_milliseconds() as f64 / 1000.0;
        (secs / 86_400.0).max(0.0)
    }
}

fn normalize_claim_value(v: &str) -> String {
    v.trim().to_lowercase()
}

/// Input to `create()`; validated before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub scope: Scope,
    pub content: String,
    #[serde(default)]
    pub content_type: ContentType,
    pub memory_type: MemoryType,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub claim_key: Option<String>,
    #[serde(default)]
    pub claim_value: Option<String>,
    #[serde(default)]
    pub producer: Producer,
    /// Precomputed embedding; skips the embedding call when present
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
}

fn default_confidence() -> f64 {
    1.0
}

impl NewMemory {
    pub fn new(scope: Scope, memory_type: MemoryType, content: impl Into<String>) -> Self {
        Self {
            scope,
            content: content.into(),
            content_type: ContentType::Text,
            memory_type,
            confidence: 1.0,
            claim_key: None,
            claim_value: None,
            producer: Producer::default(),
            embedding: None,
            metadata: None,
        }
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.claim_key = Some(key.into());
        self.claim_value = Some(value.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_producer(mut self, producer: Producer) -> Self {
        self.producer = producer;
        self
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Reject schema violations synchronously.
    pub fn validate(&self, max_content_len: usize) -> crate::error::Result<()> {
        if self.scope.org_id.trim().is_empty() || self.scope.namespace.trim().is_empty() {
            return Err(Error::malformed("scope requires org_id and namespace"));
        }
        if self.content.trim().is_empty() {
            return Err(Error::malformed("content is empty"));
        }
        if self.content.len() > max_content_len {
            return Err(Error::malformed(format!(
                "content is {} bytes, limit is {}",
                self.content.len(),
                max_content_len
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) || self.confidence.is_nan() {
            return Err(Error::malformed(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if !(0.0..=1.0).contains(&self.producer.reputation) {
            return Err(Error::malformed("producer reputation outside [0, 1]"));
        }
        match (&self.claim_key, &self.claim_value) {
            (Some(k), Some(v)) if k.trim().is_empty() || v.trim().is_empty() => {
                return Err(Error::malformed("claim key and value must be non-empty"));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::malformed(
                    "claim_key and claim_value must be given together",
                ));
            }
            _ => {}
        }
        if let Some(ref embedding) = self.embedding {
            if embedding.is_empty() || embedding.iter().any(|x| !x.is_finite()) {
                return Err(Error::malformed("embedding must be non-empty and finite"));
            }
        }
        if self.content_type == ContentType::Json
            && serde_json::from_str::<Value>(&self.content).is_err()
        {
            return Err(Error::malformed("content_type is json but content does not parse"));
        }
        Ok(())
    }

    /// Materialise into an entry (not yet persisted).
    pub fn into_entry(self) -> MemoryEntry {
        let mut entry = MemoryEntry::new(self.scope, self.memory_type, self.content)
            .with_content_type(self.content_type)
            .with_confidence(self.confidence)
            .with_producer(self.producer);
        entry.claim_key = self.claim_key.map(|k| k.trim().to_string());
        entry.claim_value = self.claim_value.map(|v| v.trim().to_string());
        entry.embedding = self.embedding;
        entry.metadata = self.metadata;
        entry
    }
}

/// Entity kinds recognised by extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Organization,
    Technology,
    Location,
    Date,
    Quantity,
    Product,
    Concept,
}

string_enum!(EntityKind, "entity kind", {
    Person => "person",
    Organization => "organization",
    Technology => "technology",
    Location => "location",
    Date => "date",
    Quantity => "quantity",
    Product => "product",
    Concept => "concept",
});

/// Entity found in a single piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub kind: EntityKind,
    pub confidence: f64,
}

impl ExtractedEntity {
    pub fn new(name: impl Into<String>, kind: EntityKind, confidence: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Deduplication key.
    pub fn normalized_name(&self) -> String {
        normalize_entity_name(&self.name)
    }
}

/// Lowercase, strip punctuation at the edges and collapse inner whitespace.
pub fn normalize_entity_name(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '+' && c != '#'))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Persisted entity tag; unique on `(normalized_name, kind)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTag {
    pub id: EntityId,
    pub name: String,
    pub kind: EntityKind,
    pub normalized_name: String,
    pub confidence: f64,
    /// Number of distinct entries that extracted this entity
    pub mention_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Typed relation between two entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    Causes,
    Contradicts,
    Supports,
    Impacts,
    TemporalBefore,
    TemporalAfter,
    DerivedFrom,
    SimilarTo,
}

string_enum!(RelationType, "relation type", {
    Causes => "CAUSES",
    Contradicts => "CONTRADICTS",
    Supports => "SUPPORTS",
    Impacts => "IMPACTS",
    TemporalBefore => "TEMPORAL_BEFORE",
    TemporalAfter => "TEMPORAL_AFTER",
    DerivedFrom => "DERIVED_FROM",
    SimilarTo => "SIMILAR_TO",
});

impl RelationType {
    pub const ALL: [RelationType; 8] = [
        RelationType::Causes,
        RelationType::Contradicts,
        RelationType::Supports,
        RelationType::Impacts,
        RelationType::TemporalBefore,
        RelationType::TemporalAfter,
        RelationType::DerivedFrom,
        RelationType::SimilarTo,
    ];

    /// Causal edges used for causal chain discovery.
    pub fn is_causal(&self) -> bool {
        matches!(self, Self::Causes | Self::Impacts)
    }
}

/// How a relation was labelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferredBy {
    Rule,
    Model,
}

string_enum!(InferredBy, "inference source", {
    Rule => "rule",
    Model => "model",
});

/// Directed, weighted edge between two entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRelation {
    pub id: RelationId,
    pub source_id: MemoryId,
    pub target_id: MemoryId,
    pub relation_type: RelationType,
    pub strength: f64,
    pub reason: Option<String>,
    pub inferred_by: InferredBy,
    pub created_at: DateTime<Utc>,
}

impl MemoryRelation {
    pub fn new(
        source_id: MemoryId,
        target_id: MemoryId,
        relation_type: RelationType,
        strength: f64,
    ) -> Self {
        Self {
            id: RelationId::new(),
            source_id,
            target_id,
            relation_type,
            strength: strength.clamp(0.0, 1.0),
            reason: None,
            inferred_by: InferredBy::Rule,
            created_at: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn inferred_by(mut self, by: InferredBy) -> Self {
        self.inferred_by = by;
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// `exp(-ln2 * age_days / half_life)`; 1.0 for brand new edges.
    pub fn time_decay_weight(&self, now: DateTime<Utc>, half_life_days: f64) -> f64 {
        if half_life_days <= 0.0 {
            return 1.0;
        }
        let age_days =
            ((now - self.created_at).num_milliseconds() as f64 / 86_400_000.0).max(0.0);
        (-std::f64::consts::LN_2 * age_days / half_life_days).exp()
    }

    /// Eviction and traversal priority.
    pub fn effective_weight(&self, now: DateTime<Utc>, half_life_days: f64) -> f64 {
        self.strength * self.time_decay_weight(now, half_life_days)
    }

    /// The endpoint opposite `id`.
    pub fn other_end(&self, id: &MemoryId) -> &MemoryId {
        if &self.source_id == id {
            &self.target_id
        } else {
            &self.source_id
        }
    }
}

/// Conflict severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

string_enum!(ConflictSeverity, "severity", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

/// Conflict lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Ignored,
}

string_enum!(ConflictStatus, "conflict status", {
    Pending => "pending",
    Resolved => "resolved",
    Ignored => "ignored",
});

/// Which detector path produced a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Same claim key, different value
    Structural,
    /// Contradiction found in content
    Semantic,
}

string_enum!(ConflictKind, "conflict kind", {
    Structural => "structural",
    Semantic => "semantic",
});

/// Record of how a conflict was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    /// Entry that "won"; `None` when both are kept
    pub winner_id: Option<MemoryId>,
    pub reason: String,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

impl ConflictResolution {
    pub fn new(
        winner_id: Option<MemoryId>,
        reason: impl Into<String>,
        resolved_by: impl Into<String>,
    ) -> Self {
        Self {
            winner_id,
            reason: reason.into(),
            resolved_by: resolved_by.into(),
            resolved_at: Utc::now(),
        }
    }
}

/// Flagged contradiction between two entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConflict {
    pub id: ConflictId,
    pub scope: Scope,
    pub entry_a: MemoryId,
    pub entry_b: MemoryId,
    pub kind: ConflictKind,
    pub claim_key: Option<String>,
    pub severity: ConflictSeverity,
    pub status: ConflictStatus,
    pub reason: Option<String>,
    pub resolution: Option<ConflictResolution>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryConflict {
    /// New pending conflict; the pair is stored in sorted order so (a, b) and
    /// (b, a) are the same conflict.
    pub fn new(
        scope: Scope,
        a: MemoryId,
        b: MemoryId,
        kind: ConflictKind,
        severity: ConflictSeverity,
    ) -> Self {
        let (entry_a, entry_b) = if a <= b { (a, b) } else { (b, a) };
        let now = Utc::now();
        Self {
            id: ConflictId::new(),
            scope,
            entry_a,
            entry_b,
            kind,
            claim_key: None,
            severity,
            status: ConflictStatus::Pending,
            reason: None,
            resolution: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_claim_key(mut self, key: impl Into<String>) -> Self {
        self.claim_key = Some(key.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn involves(&self, id: &MemoryId) -> bool {
        &self.entry_a == id || &self.entry_b == id
    }
}

/// Query filter for entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    pub org_id: Option<String>,
    pub namespace: Option<String>,
    pub memory_types: Option<Vec<MemoryType>>,
    pub tiers: Option<Vec<QualityTier>>,
    pub processing: Option<ProcessingState>,
    pub include_archived: bool,
    pub min_confidence: Option<f64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Order by id instead of recency
    pub by_id: bool,
    /// Keyset cursor: only ids greater than this
    pub after_id: Option<MemoryId>,
}

impl MemoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(mut self, scope: &Scope) -> Self {
        self.org_id = Some(scope.org_id.clone());
        self.namespace = Some(scope.namespace.clone());
        self
    }

    pub fn org(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    pub fn memory_types(mut self, types: Vec<MemoryType>) -> Self {
        self.memory_types = Some(types);
        self
    }

    pub fn tiers(mut self, tiers: Vec<QualityTier>) -> Self {
        self.tiers = Some(tiers);
        self
    }

    pub fn processing(mut self, state: ProcessingState) -> Self {
        self.processing = Some(state);
        self
    }

    pub fn include_archived(mut self, include: bool) -> Self {
        self.include_archived = include;
        self
    }

    pub fn min_confidence(mut self, min: f64) -> Self {
        self.min_confidence = Some(min);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Stable id order. Unlike the default recency order it does not move
    /// when reads touch entries, so keyset pages never skip rows.
    pub fn by_id(mut self) -> Self {
        self.by_id = true;
        self
    }

    /// Next keyset page: ids after `id`, in id order.
    pub fn after(mut self, id: MemoryId) -> Self {
        self.by_id = true;
        self.after_id = Some(id);
        self
    }
}

/// Edit lineage rooted at the first version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionTree {
    pub entry: MemoryEntry,
    pub children: Vec<VersionTree>,
}

impl VersionTree {
    /// Total number of versions in the tree.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(|c| c.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Longest root-to-leaf chain length.
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(|c| c.depth()).max().unwrap_or(0)
    }
}
