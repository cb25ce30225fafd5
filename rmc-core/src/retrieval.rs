//! Three-stage retrieval.
//!
//! 1. Direct matches by vector similarity within the org (and optional
//!    namespace), with token-overlap matching for entries that have no
//!    embedding yet or when the query cannot be embedded.
//! 2. Breadth-first graph expansion from the direct matches. Each node
//!    follows at most `edge_budget` edges, strongest-and-freshest first.
//! 3. Inference paths over the expanded subgraph: causal chains, support
//!    chains and contradiction pairs with their supporting evidence.
//!
//! Retrieval never waits on the pipeline. Entries whose enrichment has not
//! finished are listed in [`RetrievalResult::pending`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::{keyword_relevance, Embedder};
use crate::error::Result;
use crate::memory::{
    MemoryEntry, MemoryId, MemoryQuery, MemoryRelation, ProcessingState, RelationId,
    RelationType, SqliteMemoryStore,
};
use crate::scoring::{ScoreBreakdown, ScoringEngine};

/// Floor for token-overlap matches, which are not on the cosine scale.
const KEYWORD_MIN_RELEVANCE: f64 = 0.1;

/// Caller options; unset fields take the [`RetrievalConfig`] defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveOptions {
    pub org_id: String,
    pub namespace: Option<String>,
    pub max_depth: Option<usize>,
    /// Edge types followed during expansion; all when `None`
    pub relation_types: Option<Vec<RelationType>>,
    pub include_paths: bool,
    pub top_k: Option<usize>,
    pub min_similarity: Option<f64>,
    pub include_archived: bool,
    /// Count this retrieval as a use of the direct matches
    pub reinforce: bool,
}

impl RetrieveOptions {
    pub fn for_org(org_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            namespace: None,
            max_depth: None,
            relation_types: None,
            include_paths: false,
            top_k: None,
            min_similarity: None,
            include_archived: false,
            reinforce: true,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn relation_types(mut self, types: Vec<RelationType>) -> Self {
        self.relation_types = Some(types);
        self
    }

    pub fn include_paths(mut self, include: bool) -> Self {
        self.include_paths = include;
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    pub fn min_similarity(mut self, min: f64) -> Self {
        self.min_similarity = Some(min);
        self
    }

    pub fn include_archived(mut self, include: bool) -> Self {
        self.include_archived = include;
        self
    }

    pub fn reinforce(mut self, reinforce: bool) -> Self {
        self.reinforce = reinforce;
        self
    }
}

/// How a direct match was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Vector,
    Keyword,
    Graph,
}

/// An entry in a retrieval result with its query-time score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub entry: MemoryEntry,
    pub similarity: f64,
    pub score: ScoreBreakdown,
    pub source: MatchSource,
    /// Hops from the nearest direct match; 0 for direct matches
    pub depth: usize,
    /// Edge type that first reached this entry during expansion
    pub via: Option<RelationType>,
}

/// Kind of inference path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    CausalChain,
    Contradiction,
    SupportChain,
}

impl PathKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CausalChain => "causal_chain",
            Self::Contradiction => "contradiction",
            Self::SupportChain => "support_chain",
        }
    }
}

impl std::fmt::Display for PathKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A multi-hop chain or contradiction pair discovered in the expanded subgraph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferencePath {
    pub kind: PathKind,
    pub nodes: Vec<MemoryId>,
    pub relations: Vec<RelationId>,
    /// Product of edge strengths
    pub confidence: f64,
    /// For contradictions: entries supporting either side
    pub evidence: Vec<MemoryId>,
    pub explanation: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub direct_matches: Vec<ScoredMemory>,
    pub related_context: Vec<ScoredMemory>,
    pub inference_paths: Vec<InferencePath>,
    /// Surfaced entries whose background enrichment has not completed
    pub pending: Vec<MemoryId>,
    /// The query could not be embedded and matching fell back to tokens
    pub keyword_only: bool,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.direct_matches.is_empty() && self.related_context.is_empty()
    }

    /// Every surfaced entry id, direct matches first.
    pub fn ids(&self) -> Vec<MemoryId> {
        self.direct_matches
            .iter()
            .chain(self.related_context.iter())
            .map(|m| m.entry.id.clone())
            .collect()
    }
}

#[derive(Clone)]
pub struct Retriever {
    store: SqliteMemoryStore,
    embedder: Arc<dyn Embedder>,
    scoring: ScoringEngine,
    config: RetrievalConfig,
    edge_half_life_days: f64,
}

impl Retriever {
    pub fn new(
        store: SqliteMemoryStore,
        embedder: Arc<dyn Embedder>,
        scoring: ScoringEngine,
        config: RetrievalConfig,
        edge_half_life_days: f64,
    ) -> Self {
        Self {
            store,
            embedder,
            scoring,
            config,
            edge_half_life_days,
        }
    }

    pub async fn retrieve(&self, query: &str, options: &RetrieveOptions) -> Result<RetrievalResult> {
        self.retrieve_at(query, options, Utc::now()).await
    }

    /// Retrieve as of `now`. With `reinforce(false)` this is a pure read, so
    /// the same snapshot and options always yield the same result.
    pub async fn retrieve_at(
        &self,
        query: &str,
        options: &RetrieveOptions,
        now: DateTime<Utc>,
    ) -> Result<RetrievalResult> {
        let top_k = options
            .top_k
            .unwrap_or(self.config.top_k)
            .clamp(1, self.config.max_top_k.max(1));
        let min_similarity = options.min_similarity.unwrap_or(self.config.min_similarity);
        let max_depth = options
            .max_depth
            .unwrap_or(self.config.default_max_depth)
            .min(self.config.max_depth_limit);

        let (hits, keyword_only) = self.direct_hits(query, options, top_k, min_similarity).await?;

        let mut direct = Vec::with_capacity(hits.len());
        for (entry, similarity, source) in hits {
            let signals = self
                .scoring
                .gather_signals(&self.store, &entry)?
                .with_similarity(similarity);
            let score = self.scoring.score(&entry, now, &signals);
            direct.push(ScoredMemory {
                entry,
                similarity,
                score,
                source,
                depth: 0,
                via: None,
            });
        }
        rank(&mut direct);

        let (mut related, edges) = self.expand(&direct, options, max_depth, now)?;
        rank(&mut related);

        let inference_paths = if options.include_paths {
            let entries: HashMap<&MemoryId, &MemoryEntry> = direct
                .iter()
                .chain(related.iter())
                .map(|m| (&m.entry.id, &m.entry))
                .collect();
            self.discover_paths(&edges, &entries, max_depth)?
        } else {
            Vec::new()
        };

        let pending = direct
            .iter()
            .chain(related.iter())
            .filter(|m| m.entry.processing != ProcessingState::Enriched)
            .map(|m| m.entry.id.clone())
            .collect();

        if options.reinforce && !direct.is_empty() {
            let ids: Vec<MemoryId> = direct.iter().map(|m| m.entry.id.clone()).collect();
            self.store.record_access(&ids, now)?;
        }

        debug!(
            org_id = %options.org_id,
            direct = direct.len(),
            related = related.len(),
            paths = inference_paths.len(),
            max_depth,
            "Retrieval complete"
        );

        Ok(RetrievalResult {
            direct_matches: direct,
            related_context: related,
            inference_paths,
            pending,
            keyword_only,
        })
    }

    /// Vector hits plus keyword hits among entries without an embedding.
    async fn direct_hits(
        &self,
        query: &str,
        options: &RetrieveOptions,
        top_k: usize,
        min_similarity: f64,
    ) -> Result<(Vec<(MemoryEntry, f64, MatchSource)>, bool)> {
        let namespace = options.namespace.as_deref();
        let mut scored: Vec<(MemoryId, f64, MatchSource)> = Vec::new();

        let keyword_only = match self.embedder.embed(query).await {
            Ok(vector) => {
                for (id, sim) in self.store.vector_search(
                    &vector,
                    &options.org_id,
                    namespace,
                    top_k,
                    min_similarity,
                    options.include_archived,
                )? {
                    scored.push((id, sim, MatchSource::Vector));
                }
                false
            }
            Err(e) if self.config.keyword_fallback => {
                warn!(error = %e, "Query embedding failed, matching by keywords");
                true
            }
            Err(e) => return Err(e),
        };

        let mut entries: HashMap<MemoryId, MemoryEntry> = HashMap::new();
        if self.config.keyword_fallback {
            let pool = if keyword_only {
                let mut query_all = MemoryQuery::new()
                    .org(options.org_id.clone())
                    .include_archived(options.include_archived);
                query_all.namespace = options.namespace.clone();
                self.store.query_entries(&query_all)?
            } else {
                self.store.entries_without_embedding(
                    &options.org_id,
                    namespace,
                    options.include_archived,
                )?
            };
            for entry in pool {
                let relevance = keyword_relevance(query, &entry.content);
                if relevance >= KEYWORD_MIN_RELEVANCE {
                    scored.push((entry.id.clone(), relevance, MatchSource::Keyword));
                    entries.insert(entry.id.clone(), entry);
                }
            }
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(top_k);

        let missing: Vec<MemoryId> = scored
            .iter()
            .filter(|(id, _, _)| !entries.contains_key(id))
            .map(|(id, _, _)| id.clone())
            .collect();
        for entry in self.store.get_entries(&missing)? {
            entries.insert(entry.id.clone(), entry);
        }

        let hits = scored
            .into_iter()
            .filter_map(|(id, sim, source)| entries.remove(&id).map(|e| (e, sim, source)))
            .collect();
        Ok((hits, keyword_only))
    }

    /// Breadth-first expansion. Returns the related entries and every edge
    /// traversed between surfaced entries.
    fn expand(
        &self,
        direct: &[ScoredMemory],
        options: &RetrieveOptions,
        max_depth: usize,
        now: DateTime<Utc>,
    ) -> Result<(Vec<ScoredMemory>, Vec<MemoryRelation>)> {
        let types = options.relation_types.as_deref();
        let mut visited: HashSet<MemoryId> = direct.iter().map(|m| m.entry.id.clone()).collect();
        let mut frontier: Vec<MemoryId> = direct.iter().map(|m| m.entry.id.clone()).collect();
        let mut reached: Vec<(MemoryId, usize, RelationType)> = Vec::new();
        let mut edges: BTreeMap<RelationId, MemoryRelation> = BTreeMap::new();

        for depth in 1..=max_depth {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for node in &frontier {
                let mut adjacent = self.store.outgoing_relations(node, types)?;
                adjacent.extend(self.store.incoming_relations(node, types)?);
                adjacent.sort_by(|a, b| {
                    b.effective_weight(now, self.edge_half_life_days)
                        .total_cmp(&a.effective_weight(now, self.edge_half_life_days))
                        .then_with(|| a.id.cmp(&b.id))
                });
                adjacent.truncate(self.config.edge_budget);

                for rel in adjacent {
                    let other = rel.other_end(node).clone();
                    if !visited.contains(&other) {
                        if reached.len() >= self.config.max_related {
                            continue;
                        }
                        visited.insert(other.clone());
                        reached.push((other.clone(), depth, rel.relation_type));
                        next.push(other);
                    }
                    edges.entry(rel.id.clone()).or_insert(rel);
                }
            }
            frontier = next;
        }

        let ids: Vec<MemoryId> = reached.iter().map(|(id, _, _)| id.clone()).collect();
        let mut loaded: HashMap<MemoryId, MemoryEntry> = self
            .store
            .get_entries(&ids)?
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();

        let mut related = Vec::new();
        for (id, depth, via) in reached {
            let Some(entry) = loaded.remove(&id) else {
                continue;
            };
            if entry.archived && !options.include_archived {
                continue;
            }
            let signals = self.scoring.gather_signals(&self.store, &entry)?;
            let score = self.scoring.score(&entry, now, &signals);
            related.push(ScoredMemory {
                similarity: signals.similarity,
                entry,
                score,
                source: MatchSource::Graph,
                depth,
                via: Some(via),
            });
        }

        let surfaced: HashSet<&MemoryId> = direct
            .iter()
            .chain(related.iter())
            .map(|m| &m.entry.id)
            .collect();
        let edges = edges
            .into_values()
            .filter(|r| surfaced.contains(&r.source_id) && surfaced.contains(&r.target_id))
            .collect();
        Ok((related, edges))
    }

    fn discover_paths(
        &self,
        edges: &[MemoryRelation],
        entries: &HashMap<&MemoryId, &MemoryEntry>,
        max_depth: usize,
    ) -> Result<Vec<InferencePath>> {
        let mut paths = Vec::new();
        // Every surfaced node is within `max_depth` hops of a direct match, so
        // a chain through one match spans at most twice that.
        let bounds = ChainBounds {
            max_edges: 2 * max_depth.max(1),
            budget: self.config.max_paths.saturating_mul(4).max(1),
        };

        let causal: Vec<&MemoryRelation> =
            edges.iter().filter(|r| r.relation_type.is_causal()).collect();
        paths.extend(maximal_chains(&causal, PathKind::CausalChain, entries, bounds));

        let support: Vec<&MemoryRelation> = edges
            .iter()
            .filter(|r| r.relation_type == RelationType::Supports)
            .collect();
        paths.extend(maximal_chains(&support, PathKind::SupportChain, entries, bounds));

        for rel in edges
            .iter()
            .filter(|r| r.relation_type == RelationType::Contradicts)
        {
            paths.push(self.contradiction_path(rel, entries)?);
        }

        paths.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.nodes.len().cmp(&a.nodes.len()))
                .then_with(|| a.kind.cmp(&b.kind))
                .then_with(|| a.nodes.cmp(&b.nodes))
        });
        paths.truncate(self.config.max_paths);
        Ok(paths)
    }

    fn contradiction_path(
        &self,
        rel: &MemoryRelation,
        entries: &HashMap<&MemoryId, &MemoryEntry>,
    ) -> Result<InferencePath> {
        let mut evidence = Vec::new();
        let mut explanation = vec![step(rel, entries)];
        for side in [&rel.source_id, &rel.target_id] {
            let supporters =
                self.store
                    .incoming_relations(side, Some(&[RelationType::Supports]))?;
            explanation.push(format!(
                "{} has {} supporting {}",
                label(side, entries),
                supporters.len(),
                if supporters.len() == 1 { "entry" } else { "entries" }
            ));
            evidence.extend(supporters.into_iter().map(|r| r.source_id));
        }
        Ok(InferencePath {
            kind: PathKind::Contradiction,
            nodes: vec![rel.source_id.clone(), rel.target_id.clone()],
            relations: vec![rel.id.clone()],
            confidence: rel.strength,
            evidence,
            explanation,
        })
    }
}

/// Direct and related tiers share one order: composite desc, recency desc, id.
fn rank(items: &mut [ScoredMemory]) {
    items.sort_by(|a, b| {
        b.score
            .composite
            .total_cmp(&a.score.composite)
            .then_with(|| b.entry.last_accessed_at.cmp(&a.entry.last_accessed_at))
            .then_with(|| a.entry.id.cmp(&b.entry.id))
    });
}

/// Limits on chain discovery for one path kind.
#[derive(Debug, Clone, Copy)]
struct ChainBounds {
    max_edges: usize,
    budget: usize,
}

/// Simple directed chains that cannot be extended at either end, at most
/// `max_edges` long and at most `budget` of them.
///
/// Walks start from nodes with no incoming edge, so every recorded chain is
/// maximal as soon as it is recorded. Components that are pure cycles get
/// one walk from their lowest unvisited node.
fn maximal_chains(
    edges: &[&MemoryRelation],
    kind: PathKind,
    entries: &HashMap<&MemoryId, &MemoryEntry>,
    bounds: ChainBounds,
) -> Vec<InferencePath> {
    if edges.is_empty() {
        return Vec::new();
    }
    let mut out_edges: BTreeMap<&MemoryId, Vec<&MemoryRelation>> = BTreeMap::new();
    let mut has_incoming: HashSet<&MemoryId> = HashSet::new();
    for rel in edges.iter().copied() {
        out_edges.entry(&rel.source_id).or_default().push(rel);
        has_incoming.insert(&rel.target_id);
    }
    for list in out_edges.values_mut() {
        list.sort_by(|a, b| a.target_id.cmp(&b.target_id).then_with(|| a.id.cmp(&b.id)));
    }

    let mut walker = ChainWalker {
        out_edges: &out_edges,
        bounds,
        path: Vec::new(),
        on_path: HashSet::new(),
        visited: HashSet::new(),
        chains: Vec::new(),
    };
    let sources: Vec<&MemoryId> = out_edges
        .keys()
        .copied()
        .filter(|id| !has_incoming.contains(id))
        .collect();
    for start in sources {
        walker.walk_from(start);
    }
    let rest: Vec<&MemoryId> = out_edges.keys().copied().collect();
    for start in rest {
        if !walker.visited.contains(start) {
            walker.walk_from(start);
        }
    }

    walker
        .chains
        .into_iter()
        .map(|chain| {
            let mut nodes = vec![chain[0].source_id.clone()];
            nodes.extend(chain.iter().map(|r| r.target_id.clone()));
            InferencePath {
                kind,
                nodes,
                relations: chain.iter().map(|r| r.id.clone()).collect(),
                confidence: chain.iter().map(|r| r.strength).product(),
                evidence: Vec::new(),
                explanation: chain.iter().map(|r| step(r, entries)).collect(),
            }
        })
        .collect()
}

struct ChainWalker<'a, 'g> {
    out_edges: &'g BTreeMap<&'a MemoryId, Vec<&'a MemoryRelation>>,
    bounds: ChainBounds,
    path: Vec<&'a MemoryRelation>,
    on_path: HashSet<&'a MemoryId>,
    visited: HashSet<&'a MemoryId>,
    chains: Vec<Vec<&'a MemoryRelation>>,
}

impl<'a, 'g> ChainWalker<'a, 'g> {
    fn full(&self) -> bool {
        self.chains.len() >= self.bounds.budget
    }

    fn walk_from(&mut self, start: &'a MemoryId) {
        if self.full() {
            return;
        }
        self.on_path.insert(start);
        self.visited.insert(start);
        self.walk(start);
        self.on_path.remove(start);
    }

    fn walk(&mut self, node: &'a MemoryId) {
        if self.path.len() >= self.bounds.max_edges {
            self.chains.push(self.path.clone());
            return;
        }
        let out_edges = self.out_edges;
        let mut extended = false;
        if let Some(next) = out_edges.get(node) {
            for rel in next.iter().copied() {
                if self.full() {
                    return;
                }
                if self.on_path.contains(&rel.target_id) {
                    continue;
                }
                extended = true;
                self.path.push(rel);
                self.on_path.insert(&rel.target_id);
                self.visited.insert(&rel.target_id);
                self.walk(&rel.target_id);
                self.on_path.remove(&rel.target_id);
                self.path.pop();
            }
        }
        if !extended && !self.path.is_empty() && !self.full() {
            self.chains.push(self.path.clone());
        }
    }
}

fn label(id: &MemoryId, entries: &HashMap<&MemoryId, &MemoryEntry>) -> String {
    match entries.get(id) {
        Some(entry) => {
            let text: String = entry.content.chars().take(60).collect();
            if entry.content.chars().count() > 60 {
                format!("\"{}…\"", text)
            } else {
                format!("\"{}\"", text)
            }
        }
        None => id.to_string(),
    }
}

fn step(rel: &MemoryRelation, entries: &HashMap<&MemoryId, &MemoryEntry>) -> String {
    let verb = match rel.relation_type {
        RelationType::Causes => "causes",
        RelationType::Impacts => "impacts",
        RelationType::Supports => "supports",
        RelationType::Contradicts => "contradicts",
        RelationType::TemporalBefore => "happened before",
        RelationType::TemporalAfter => "happened after",
        RelationType::DerivedFrom => "is derived from",
        RelationType::SimilarTo => "is similar to",
    };
    let mut s = format!(
        "{} {} {} ({:.2})",
        label(&rel.source_id, entries),
        verb,
        label(&rel.target_id, entries),
        rel.strength
    );
    if let Some(ref reason) = rel.reason {
        s.push_str(": ");
        s.push_str(reason);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringConfig;
    use crate::embedding::HashEmbedder;
    use crate::error::Error;
    use crate::memory::{MemoryType, Scope};
    use async_trait::async_trait;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn retriever(store: &SqliteMemoryStore) -> Retriever {
        Retriever::new(
            store.clone(),
            Arc::new(HashEmbedder::default()),
            ScoringEngine::new(ScoringConfig::default()),
            RetrievalConfig::default(),
            30.0,
        )
    }

    fn embedded(text: &str, now: DateTime<Utc>) -> MemoryEntry {
        MemoryEntry::new(Scope::new("acme", "eng"), MemoryType::Semantic, text)
            .with_embedding(HashEmbedder::default().embed_sync(text))
            .with_created_at(now)
    }

    fn link(store: &SqliteMemoryStore, a: &MemoryEntry, b: &MemoryEntry, t: RelationType, s: f64, now: DateTime<Utc>) {
        store
            .insert_relation(
                &MemoryRelation::new(a.id.clone(), b.id.clone(), t, s).with_created_at(now),
                10,
                30.0,
                now,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_causal_chain_path() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let now = Utc::now();
        let a = embedded("Marketing campaign doubled signups overnight", now);
        let b = MemoryEntry::new(Scope::new("acme", "eng"), MemoryType::Semantic, "Database CPU saturated")
            .with_created_at(now);
        let c = MemoryEntry::new(Scope::new("acme", "eng"), MemoryType::Semantic, "Checkout outage for two hours")
            .with_created_at(now);
        for e in [&a, &b, &c] {
            store.add_entry(e).unwrap();
        }
        link(&store, &a, &b, RelationType::Causes, 0.9, now);
        link(&store, &b, &c, RelationType::Causes, 0.85, now);

        let result = retriever(&store)
            .retrieve_at(
                "marketing campaign doubled signups",
                &RetrieveOptions::for_org("acme").include_paths(true).reinforce(false),
                now,
            )
            .await
            .unwrap();

        assert_eq!(result.direct_matches[0].entry.id, a.id);
        let related: Vec<&MemoryId> = result.related_context.iter().map(|m| &m.entry.id).collect();
        assert!(related.contains(&&b.id) && related.contains(&&c.id));

        let causal: Vec<&InferencePath> = result
            .inference_paths
            .iter()
            .filter(|p| p.kind == PathKind::CausalChain)
            .collect();
        assert_eq!(causal.len(), 1);
        assert_eq!(causal[0].nodes, vec![a.id.clone(), b.id.clone(), c.id.clone()]);
        assert!((causal[0].confidence - 0.9 * 0.85).abs() < 1e-9);
        assert_eq!(causal[0].explanation.len(), 2);
    }

    #[tokio::test]
    async fn test_depth_is_clamped_and_types_filtered() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let now = Utc::now();
        let scope = Scope::new("acme", "eng");
        let root = embedded("root cause analysis for the outage", now);
        store.add_entry(&root).unwrap();
        let mut prev = root.clone();
        for i in 0..5 {
            let e = MemoryEntry::new(scope.clone(), MemoryType::Semantic, format!("hop {}", i))
                .with_created_at(now);
            store.add_entry(&e).unwrap();
            link(&store, &prev, &e, RelationType::Supports, 0.8, now);
            prev = e;
        }
        let side = MemoryEntry::new(scope, MemoryType::Semantic, "side note").with_created_at(now);
        store.add_entry(&side).unwrap();
        link(&store, &root, &side, RelationType::SimilarTo, 0.9, now);

        let r = retriever(&store);
        let opts = RetrieveOptions::for_org("acme").max_depth(10).reinforce(false);
        let result = r.retrieve_at("root cause analysis", &opts, now).await.unwrap();
        assert_eq!(result.related_context.len(), 4); // 3 hops + side node
        assert!(result.related_context.iter().all(|m| m.depth <= 3));

        let opts = opts.relation_types(vec![RelationType::Supports]).include_paths(true);
        let result = r.retrieve_at("root cause analysis", &opts, now).await.unwrap();
        assert_eq!(result.related_context.len(), 3);
        let support = &result.inference_paths[0];
        assert_eq!(support.kind, PathKind::SupportChain);
        assert_eq!(support.nodes.len(), 4);
    }

    #[tokio::test]
    async fn test_contradiction_with_evidence() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let now = Utc::now();
        let scope = Scope::new("acme", "eng");
        let a = embedded("We standardise on PostgreSQL for services", now);
        let b = MemoryEntry::new(scope.clone(), MemoryType::Semantic, "We standardise on MongoDB").with_created_at(now);
        let backer = MemoryEntry::new(scope, MemoryType::Semantic, "Benchmarks favour MongoDB").with_created_at(now);
        for e in [&a, &b, &backer] {
            store.add_entry(e).unwrap();
        }
        link(&store, &b, &a, RelationType::Contradicts, 0.9, now);
        link(&store, &backer, &b, RelationType::Supports, 0.7, now);

        let result = retriever(&store)
            .retrieve_at(
                "standardise on PostgreSQL",
                &RetrieveOptions::for_org("acme").include_paths(true).reinforce(false),
                now,
            )
            .await
            .unwrap();
        let contradiction = result
            .inference_paths
            .iter()
            .find(|p| p.kind == PathKind::Contradiction)
            .unwrap();
        assert_eq!(contradiction.nodes, vec![b.id.clone(), a.id.clone()]);
        assert_eq!(contradiction.evidence, vec![backer.id.clone()]);
        assert_eq!(contradiction.explanation.len(), 3);
    }

    #[tokio::test]
    async fn test_determinism_and_reinforcement() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let now = Utc::now();
        let texts = [
            "deploy pipeline uses blue green rollout",
            "deploy pipeline uses canary rollout",
            "deploy pipeline runs nightly",
            "deploy pipeline owner is the platform team",
        ];
        let entries: Vec<MemoryEntry> = texts.iter().map(|t| embedded(t, now)).collect();
        for e in &entries {
            store.add_entry(e).unwrap();
        }
        link(&store, &entries[0], &entries[1], RelationType::SimilarTo, 0.8, now);

        let r = retriever(&store);
        let opts = RetrieveOptions::for_org("acme").include_paths(true).reinforce(false);
        let first = r.retrieve_at("deploy pipeline rollout", &opts, now).await.unwrap();
        let second = r.retrieve_at("deploy pipeline rollout", &opts, now).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.direct_matches.is_empty());
        assert_eq!(first.pending.len(), first.ids().len());

        let top = first.direct_matches[0].entry.id.clone();
        r.retrieve_at("deploy pipeline rollout", &opts.clone().reinforce(true), now + Duration::hours(1))
            .await
            .unwrap();
        let touched = store.get_entry(&top).unwrap().unwrap();
        assert_eq!(touched.usage_count, 1);
    }

    struct DownEmbedder;

    #[async_trait]
    impl Embedder for DownEmbedder {
        async fn embed(&self, _text: &str) -> crate::error::Result<Vec<f32>> {
            Err(Error::unavailable("embedding", "connection refused"))
        }
        fn dimension(&self) -> usize {
            8
        }
        fn name(&self) -> &str {
            "down"
        }
    }

    #[tokio::test]
    async fn test_keyword_fallback() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let now = Utc::now();
        let scope = Scope::new("acme", "eng");
        let hit = MemoryEntry::new(scope.clone(), MemoryType::Semantic, "Kafka retention is seven days")
            .with_created_at(now);
        let miss = MemoryEntry::new(scope, MemoryType::Semantic, "Lunch is at noon").with_created_at(now);
        store.add_entry(&hit).unwrap();
        store.add_entry(&miss).unwrap();

        let r = Retriever::new(
            store.clone(),
            Arc::new(DownEmbedder),
            ScoringEngine::default(),
            RetrievalConfig::default(),
            30.0,
        );
        let result = r
            .retrieve_at("kafka retention", &RetrieveOptions::for_org("acme"), now)
            .await
            .unwrap();
        assert!(result.keyword_only);
        assert_eq!(result.direct_matches.len(), 1);
        assert_eq!(result.direct_matches[0].entry.id, hit.id);
        assert_eq!(result.direct_matches[0].source, MatchSource::Keyword);

        let strict = Retriever::new(
            store,
            Arc::new(DownEmbedder),
            ScoringEngine::default(),
            RetrievalConfig {
                keyword_fallback: false,
                ..RetrievalConfig::default()
            },
            30.0,
        );
        assert!(strict
            .retrieve_at("kafka", &RetrieveOptions::for_org("acme"), now)
            .await
            .is_err());
    }

    fn layered_dag(layers: usize, width: usize) -> (Vec<Vec<MemoryId>>, Vec<MemoryRelation>) {
        let ids: Vec<Vec<MemoryId>> = (0..layers)
            .map(|_| (0..width).map(|_| MemoryId::new()).collect())
            .collect();
        let mut edges = Vec::new();
        for pair in ids.windows(2) {
            for from in &pair[0] {
                for to in &pair[1] {
                    edges.push(MemoryRelation::new(from.clone(), to.clone(), RelationType::Causes, 0.9));
                }
            }
        }
        (ids, edges)
    }

    #[test]
    fn test_chain_discovery_is_bounded_on_dense_dag() {
        // 10 layers of 3 fully linked: 3^10 source-to-sink chains unbounded.
        let (ids, edges) = layered_dag(10, 3);
        let refs: Vec<&MemoryRelation> = edges.iter().collect();
        let bounds = ChainBounds {
            max_edges: 4,
            budget: 80,
        };

        let chains = maximal_chains(&refs, PathKind::CausalChain, &HashMap::new(), bounds);

        assert_eq!(chains.len(), 80);
        assert!(chains.iter().all(|c| c.nodes.len() == 5));
        assert!(chains.iter().all(|c| ids[0].contains(&c.nodes[0])));
    }

    #[test]
    fn test_chains_start_at_sources_only() {
        let (ids, edges) = layered_dag(3, 2);
        let refs: Vec<&MemoryRelation> = edges.iter().collect();
        let bounds = ChainBounds {
            max_edges: 8,
            budget: 100,
        };

        let chains = maximal_chains(&refs, PathKind::CausalChain, &HashMap::new(), bounds);

        // 2 sources x 2 middles x 2 sinks, no sub-chains.
        assert_eq!(chains.len(), 8);
        assert!(chains.iter().all(|c| c.nodes.len() == 3));
        assert!(chains.iter().all(|c| ids[0].contains(&c.nodes[0])));
        assert!(chains.iter().all(|c| ids[2].contains(&c.nodes[2])));
    }

    #[test]
    fn test_pure_cycle_yields_one_chain() {
        let (a, b, c) = (MemoryId::new(), MemoryId::new(), MemoryId::new());
        let edges = vec![
            MemoryRelation::new(a.clone(), b.clone(), RelationType::Supports, 0.8),
            MemoryRelation::new(b.clone(), c.clone(), RelationType::Supports, 0.8),
            MemoryRelation::new(c.clone(), a.clone(), RelationType::Supports, 0.8),
        ];
        let refs: Vec<&MemoryRelation> = edges.iter().collect();
        let bounds = ChainBounds {
            max_edges: 8,
            budget: 100,
        };

        let chains = maximal_chains(&refs, PathKind::SupportChain, &HashMap::new(), bounds);

        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_dense_causal_graph_retrieval_is_bounded() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let now = Utc::now();
        let layers: Vec<Vec<MemoryEntry>> = (0..10)
            .map(|_| (0..3).map(|_| embedded("checkout latency spike", now)).collect())
            .collect();
        for entry in layers.iter().flatten() {
            store.add_entry(entry).unwrap();
        }
        for pair in layers.windows(2) {
            for from in &pair[0] {
                for to in &pair[1] {
                    link(&store, from, to, RelationType::Causes, 0.9, now);
                }
            }
        }

        let r = retriever(&store);
        let opts = RetrieveOptions::for_org("acme")
            .top_k(1_000)
            .include_paths(true)
            .reinforce(false);
        let result = r.retrieve_at("checkout latency spike", &opts, now).await.unwrap();

        assert_eq!(result.direct_matches.len(), 30);
        let max_nodes = 2 * RetrievalConfig::default().default_max_depth + 1;
        assert!(!result.inference_paths.is_empty());
        assert!(result.inference_paths.len() <= RetrievalConfig::default().max_paths);
        assert!(result
            .inference_paths
            .iter()
            .all(|p| p.nodes.len() <= max_nodes));
    }
}
