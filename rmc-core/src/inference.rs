//! Model-backed and rule-based inference.
//!
//! [`InferenceBackend`] is the swappable capability behind entity extraction,
//! relation classification, contradiction detection and arbitration.
//! [`ModelInference`] prompts an [`LLMClient`] for JSON verdicts;
//! [`RuleInference`] answers the same questions with heuristics.
//! [`InferenceChain`] runs the model under a timeout and falls back to rules.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::embedding::keyword_relevance;
use crate::error::{Error, Result};
use crate::extract::{Extraction, RuleExtractor};
use crate::llm::{LLMClient, PromptReply, PromptRequest};
use crate::memory::{EntityKind, ExtractedEntity, InferredBy, MemoryEntry, MemoryId, RelationType};

/// Label proposed for a candidate pair, directed `a → b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationVerdict {
    pub relation_type: RelationType,
    pub strength: f64,
    pub reason: Option<String>,
}

/// Whether two entries contradict each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContradictionVerdict {
    pub contradicts: bool,
    pub confidence: f64,
    pub reason: String,
}

/// Proposed outcome for a conflict. Never applied automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationProposal {
    pub winner_id: Option<MemoryId>,
    pub reason: String,
    pub confidence: f64,
    pub proposed_by: InferredBy,
}

/// Inference capability consumed by the pipeline.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Extract entities, concepts and topics from text.
    async fn extract_entities(&self, text: &str) -> Result<Extraction>;

    /// Classify the relation from `a` to `b`; `None` when unrelated.
    async fn classify_relation(
        &self,
        a: &MemoryEntry,
        b: &MemoryEntry,
    ) -> Result<Option<RelationVerdict>>;

    /// Decide whether `a` and `b` contradict each other.
    async fn detect_contradiction(
        &self,
        a: &MemoryEntry,
        b: &MemoryEntry,
    ) -> Result<ContradictionVerdict>;

    /// Propose which of two conflicting entries should prevail.
    async fn arbitrate(&self, a: &MemoryEntry, b: &MemoryEntry) -> Result<ArbitrationProposal>;

    /// Name for logs.
    fn name(&self) -> &str;
}

// ==================== Model-backed ====================

const EXTRACT_SYSTEM: &str = "You extract named entities from text. Respond with a single JSON \
object: {\"entities\": [{\"name\": string, \"kind\": one of person|organization|technology|\
location|date|quantity|product|concept, \"confidence\": number 0-1}], \"concepts\": [string], \
\"topics\": [string]}. No prose.";

const CLASSIFY_SYSTEM: &str = "You label the relationship from memory A to memory B. Respond with \
a single JSON object: {\"relation\": one of CAUSES|CONTRADICTS|SUPPORTS|IMPACTS|TEMPORAL_BEFORE|\
TEMPORAL_AFTER|DERIVED_FROM|SIMILAR_TO|NONE, \"strength\": number 0-1, \"reason\": string}. \
No prose.";

const CONTRADICTION_SYSTEM: &str = "You decide whether two memories contradict each other. \
Respond with a single JSON object: {\"contradicts\": boolean, \"confidence\": number 0-1, \
\"reason\": string}. No prose.";

const ARBITRATE_SYSTEM: &str = "Two memories conflict. Decide which one should prevail, or NONE \
if both should be kept. Respond with a single JSON object: {\"winner\": \"A\"|\"B\"|\"NONE\", \
\"confidence\": number 0-1, \"reason\": string}. No prose.";

#[derive(Debug, Deserialize)]
struct ExtractionJson {
    #[serde(default)]
    entities: Vec<EntityJson>,
    #[serde(default)]
    concepts: Vec<String>,
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EntityJson {
    name: String,
    #[serde(default)]
    kind: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct ClassifyJson {
    relation: String,
    #[serde(default = "default_confidence")]
    strength: f64,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContradictionJson {
    contradicts: bool,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct ArbitrateJson {
    winner: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    reason: String,
}

fn default_confidence() -> f64 {
    0.5
}

fn parse_model_json<T: serde::de::DeserializeOwned>(reply: &PromptReply, what: &str) -> Result<T> {
    serde_json::from_str(reply.json_body()).map_err(|e| {
        let hint = if reply.truncated { " (truncated)" } else { "" };
        Error::unavailable("model", format!("unparseable {} reply{}: {}", what, hint, e))
    })
}

fn pair_prompt(a: &MemoryEntry, b: &MemoryEntry) -> String {
    let claim = |e: &MemoryEntry| match (&e.claim_key, &e.claim_value) {
        (Some(k), Some(v)) => format!("\nclaim: {} = {}", k, v),
        _ => String::new(),
    };
    format!(
        "Memory A ({}, created {}):\n{}{}\n\nMemory B ({}, created {}):\n{}{}",
        a.memory_type,
        a.created_at.to_rfc3339(),
        a.content,
        claim(a),
        b.memory_type,
        b.created_at.to_rfc3339(),
        b.content,
        claim(b),
    )
}

/// Inference over an [`LLMClient`].
pub struct ModelInference {
    client: Arc<dyn LLMClient>,
    model: Option<String>,
    max_tokens: u32,
}

impl ModelInference {
    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self {
            client,
            model: None,
            max_tokens: 1024,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    async fn ask(&self, instructions: &str, input: String) -> Result<PromptReply> {
        let mut request = PromptRequest::new(instructions, input).with_max_tokens(self.max_tokens);
        if let Some(ref model) = self.model {
            request = request.with_model(model.clone());
        }
        self.client.prompt(request).await
    }
}

#[async_trait]
impl InferenceBackend for ModelInference {
    async fn extract_entities(&self, text: &str) -> Result<Extraction> {
        let reply = self.ask(EXTRACT_SYSTEM, text.to_string()).await?;
        let parsed: ExtractionJson = parse_model_json(&reply, "extraction")?;

        let entities = parsed
            .entities
            .into_iter()
            .filter(|e| !e.name.trim().is_empty())
            .map(|e| {
                let kind = e
                    .kind
                    .to_lowercase()
                    .parse::<EntityKind>()
                    .unwrap_or(EntityKind::Concept);
                ExtractedEntity::new(e.name.trim(), kind, e.confidence)
            })
            .collect();

        Ok(Extraction {
            entities,
            concepts: parsed.concepts,
            topics: parsed.topics,
        })
    }

    async fn classify_relation(
        &self,
        a: &MemoryEntry,
        b: &MemoryEntry,
    ) -> Result<Option<RelationVerdict>> {
        let reply = self.ask(CLASSIFY_SYSTEM, pair_prompt(a, b)).await?;
        let parsed: ClassifyJson = parse_model_json(&reply, "relation")?;

        let label = parsed.relation.trim().to_uppercase();
        if label == "NONE" || label.is_empty() {
            return Ok(None);
        }
        let relation_type = label
            .parse::<RelationType>()
            .map_err(|_| Error::unavailable("model", format!("unknown relation label {}", label)))?;

        Ok(Some(RelationVerdict {
            relation_type,
            strength: parsed.strength.clamp(0.0, 1.0),
            reason: parsed.reason.filter(|r| !r.trim().is_empty()),
        }))
    }

    async fn detect_contradiction(
        &self,
        a: &MemoryEntry,
        b: &MemoryEntry,
    ) -> Result<ContradictionVerdict> {
        let reply = self.ask(CONTRADICTION_SYSTEM, pair_prompt(a, b)).await?;
        let parsed: ContradictionJson = parse_model_json(&reply, "contradiction")?;
        Ok(ContradictionVerdict {
            contradicts: parsed.contradicts,
            confidence: parsed.confidence.clamp(0.0, 1.0),
            reason: parsed.reason,
        })
    }

    async fn arbitrate(&self, a: &MemoryEntry, b: &MemoryEntry) -> Result<ArbitrationProposal> {
        let reply = self.ask(ARBITRATE_SYSTEM, pair_prompt(a, b)).await?;
        let parsed: ArbitrateJson = parse_model_json(&reply, "arbitration")?;
        let winner_id = match parsed.winner.trim().to_uppercase().as_str() {
            "A" => Some(a.id.clone()),
            "B" => Some(b.id.clone()),
            _ => None,
        };
        Ok(ArbitrationProposal {
            winner_id,
            reason: parsed.reason,
            confidence: parsed.confidence.clamp(0.0, 1.0),
            proposed_by: InferredBy::Model,
        })
    }

    fn name(&self) -> &str {
        "model"
    }
}

// ==================== Rule-based ====================

const NEGATIONS: &[&str] = &[
    "not", "never", "no", "none", "cannot", "can't", "don't", "doesn't", "didn't", "isn't",
    "aren't", "wasn't", "won't", "shouldn't", "without",
];

const ANTONYMS: &[(&str, &str)] = &[
    ("increase", "decrease"),
    ("increased", "decreased"),
    ("enable", "disable"),
    ("enabled", "disabled"),
    ("approve", "reject"),
    ("approved", "rejected"),
    ("accept", "reject"),
    ("add", "remove"),
    ("allow", "deny"),
    ("start", "stop"),
    ("true", "false"),
    ("success", "failure"),
    ("succeeded", "failed"),
    ("include", "exclude"),
    ("raise", "lower"),
    ("up", "down"),
    ("keep", "drop"),
    ("adopt", "abandon"),
];

const CAUSAL_CUES: &[&str] = &[
    "because",
    "due to",
    "caused by",
    "as a result",
    "resulted in",
    "results in",
    "led to",
    "leads to",
    "therefore",
    "consequently",
];

const IMPACT_CUES: &[&str] = &["impact", "impacts", "affects", "affected", "influences"];

/// Minimum keyword relevance for two texts to be about the same thing.
const TOPIC_OVERLAP: f64 = 0.15;

fn words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn has_negation(words: &HashSet<String>) -> bool {
    NEGATIONS.iter().any(|n| words.contains(*n))
}

fn antonym_hit(a: &HashSet<String>, b: &HashSet<String>) -> Option<(&'static str, &'static str)> {
    ANTONYMS.iter().copied().find(|(x, y)| {
        (a.contains(*x) && b.contains(*y) && !a.contains(*y))
            || (a.contains(*y) && b.contains(*x) && !a.contains(*x))
    })
}

fn contains_any(text: &str, cues: &[&str]) -> bool {
    let lower = text.to_lowercase();
    cues.iter().any(|c| lower.contains(c))
}

/// Heuristic inference; never fails on well-formed input.
#[derive(Debug, Clone, Default)]
pub struct RuleInference {
    extractor: RuleExtractor,
}

impl RuleInference {
    pub fn new(extractor: RuleExtractor) -> Self {
        Self { extractor }
    }

    /// Negation/antonym contradiction check used as the fallback detector.
    pub fn contradiction(&self, a: &MemoryEntry, b: &MemoryEntry) -> ContradictionVerdict {
        if a.claim_collides_with(b) {
            return ContradictionVerdict {
                contradicts: true,
                confidence: 0.9,
                reason: format!(
                    "claim '{}' has conflicting values",
                    a.claim_key.as_deref().unwrap_or_default()
                ),
            };
        }

        let overlap = keyword_relevance(&a.content, &b.content);
        if overlap < TOPIC_OVERLAP {
            return ContradictionVerdict {
                contradicts: false,
                confidence: 0.5,
                reason: "different subjects".to_string(),
            };
        }

        let wa = words(&a.content);
        let wb = words(&b.content);
        if has_negation(&wa) != has_negation(&wb) {
            return ContradictionVerdict {
                contradicts: true,
                confidence: 0.6,
                reason: "one statement negates the other".to_string(),
            };
        }
        if let Some((x, y)) = antonym_hit(&wa, &wb) {
            return ContradictionVerdict {
                contradicts: true,
                confidence: 0.55,
                reason: format!("opposing terms '{}' and '{}'", x, y),
            };
        }

        ContradictionVerdict {
            contradicts: false,
            confidence: 0.5,
            reason: "no opposing cues".to_string(),
        }
    }

    /// Higher confidence wins, then the newer entry, then higher reputation.
    pub fn arbitration(&self, a: &MemoryEntry, b: &MemoryEntry) -> ArbitrationProposal {
        let (winner, reason) = if (a.confidence - b.confidence).abs() > 1e-9 {
            let w = if a.confidence > b.confidence { a } else { b };
            (Some(w), "higher confidence")
        } else if a.created_at != b.created_at {
            let w = if a.created_at > b.created_at { a } else { b };
            (Some(w), "more recent")
        } else if (a.producer.reputation - b.producer.reputation).abs() > 1e-9 {
            let w = if a.producer.reputation > b.producer.reputation {
                a
            } else {
                b
            };
            (Some(w), "more reputable producer")
        } else {
            (None, "no distinguishing signal")
        };

        ArbitrationProposal {
            winner_id: winner.map(|w| w.id.clone()),
            reason: reason.to_string(),
            confidence: if winner.is_some() { 0.6 } else { 0.3 },
            proposed_by: InferredBy::Rule,
        }
    }

    /// Causal or impact cue linking an older entry to a newer one.
    pub fn relation(&self, a: &MemoryEntry, b: &MemoryEntry) -> Option<RelationVerdict> {
        let verdict = self.contradiction(a, b);
        if verdict.contradicts {
            return Some(RelationVerdict {
                relation_type: RelationType::Contradicts,
                strength: verdict.confidence,
                reason: Some(verdict.reason),
            });
        }

        if keyword_relevance(&a.content, &b.content) < TOPIC_OVERLAP {
            return None;
        }
        let later = if b.created_at >= a.created_at { b } else { a };
        if contains_any(&later.content, CAUSAL_CUES) {
            return Some(RelationVerdict {
                relation_type: RelationType::Causes,
                strength: 0.6,
                reason: Some("causal cue in later entry".to_string()),
            });
        }
        if contains_any(&later.content, IMPACT_CUES) {
            return Some(RelationVerdict {
                relation_type: RelationType::Impacts,
                strength: 0.5,
                reason: Some("impact cue in later entry".to_string()),
            });
        }
        None
    }
}

#[async_trait]
impl InferenceBackend for RuleInference {
    async fn extract_entities(&self, text: &str) -> Result<Extraction> {
        Ok(self.extractor.extract(text))
    }

    async fn classify_relation(
        &self,
        a: &MemoryEntry,
        b: &MemoryEntry,
    ) -> Result<Option<RelationVerdict>> {
        Ok(self.relation(a, b))
    }

    async fn detect_contradiction(
        &self,
        a: &MemoryEntry,
        b: &MemoryEntry,
    ) -> Result<ContradictionVerdict> {
        Ok(self.contradiction(a, b))
    }

    async fn arbitrate(&self, a: &MemoryEntry, b: &MemoryEntry) -> Result<ArbitrationProposal> {
        Ok(self.arbitration(a, b))
    }

    fn name(&self) -> &str {
        "rules"
    }
}

// ==================== Fallback chain ====================

/// Model first under a timeout, rules on any failure.
#[derive(Clone)]
pub struct InferenceChain {
    model: Option<Arc<dyn InferenceBackend>>,
    rules: RuleInference,
    timeout: Duration,
}

impl InferenceChain {
    pub fn new(model: Option<Arc<dyn InferenceBackend>>, rules: RuleInference, timeout: Duration) -> Self {
        Self {
            model,
            rules,
            timeout,
        }
    }

    /// Rules only.
    pub fn rules_only(rules: RuleInference) -> Self {
        Self::new(None, rules, Duration::from_secs(0))
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn rules(&self) -> &RuleInference {
        &self.rules
    }

    async fn try_model<T, F>(&self, op: &'static str, call: F) -> Option<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(op, error = %e, "Model inference failed, falling back to rules");
                None
            }
            Err(_) => {
                warn!(
                    op,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Model inference timed out, falling back to rules"
                );
                None
            }
        }
    }

    /// Label `a → b`, reporting which path produced the label.
    pub async fn classify_relation(
        &self,
        a: &MemoryEntry,
        b: &MemoryEntry,
    ) -> (Option<RelationVerdict>, InferredBy) {
        if let Some(ref model) = self.model {
            if let Some(verdict) = self
                .try_model("classify_relation", model.classify_relation(a, b))
                .await
            {
                return (verdict, InferredBy::Model);
            }
        }
        (self.rules.relation(a, b), InferredBy::Rule)
    }

    pub async fn detect_contradiction(
        &self,
        a: &MemoryEntry,
        b: &MemoryEntry,
    ) -> (ContradictionVerdict, InferredBy) {
        if let Some(ref model) = self.model {
            if let Some(verdict) = self
                .try_model("detect_contradiction", model.detect_contradiction(a, b))
                .await
            {
                return (verdict, InferredBy::Model);
            }
        }
        (self.rules.contradiction(a, b), InferredBy::Rule)
    }

    pub async fn arbitrate(&self, a: &MemoryEntry, b: &MemoryEntry) -> ArbitrationProposal {
        if let Some(ref model) = self.model {
            if let Some(proposal) = self.try_model("arbitrate", model.arbitrate(a, b)).await {
                return proposal;
            }
        }
        debug!(a = %a.id, b = %b.id, "Arbitrating by rules");
        self.rules.arbitration(a, b)
    }
}
