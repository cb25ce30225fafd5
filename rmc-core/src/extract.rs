//! Entity, concept and topic extraction.
//!
//! Two strategies share one output shape: a model-backed extractor reached
//! through [`InferenceBackend`], and a deterministic [`RuleExtractor`]
//! working from capitalisation, numeric patterns and known vocabularies.
//! [`EntityExtractor`] bounds the model path by a timeout and falls back to
//! rules on any failure, so extraction itself never fails a job.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ExtractionConfig;
use crate::embedding::tokenize;
use crate::inference::InferenceBackend;
use crate::memory::{EntityKind, ExtractedEntity, InferredBy};

/// Which extractor to try first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// Model first, rules on failure or timeout
    #[default]
    Model,
    /// Rules only
    Rules,
    /// Model and rules together, merged; rules alone if the model fails
    Hybrid,
}

/// Output of one extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub entities: Vec<ExtractedEntity>,
    pub concepts: Vec<String>,
    pub topics: Vec<String>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.concepts.is_empty() && self.topics.is_empty()
    }

    /// Drop low-confidence entities, merge duplicates on `(normalized_name, kind)`
    /// keeping the highest confidence, and cap the count. First-seen order is kept.
    pub fn normalized(mut self, min_confidence: f64, max_entities: usize) -> Self {
        let mut best: HashMap<(String, EntityKind), usize> = HashMap::new();
        let mut merged: Vec<ExtractedEntity> = Vec::new();
        for entity in self.entities.drain(..) {
            if entity.confidence < min_confidence {
                continue;
            }
            let key = (entity.normalized_name(), entity.kind);
            if key.0.is_empty() {
                continue;
            }
            match best.get(&key) {
                Some(&idx) => {
                    if entity.confidence > merged[idx].confidence {
                        merged[idx].confidence = entity.confidence;
                    }
                }
                None => {
                    best.insert(key, merged.len());
                    merged.push(entity);
                }
            }
        }
        merged.truncate(max_entities);
        self.entities = merged;

        let mut seen = HashSet::new();
        self.concepts = dedup_labels(self.concepts, &mut seen);
        let mut seen = HashSet::new();
        self.topics = dedup_labels(self.topics, &mut seen);
        self
    }

    /// Append `other`; duplicates collapse on the next `normalized`.
    pub fn merge(mut self, other: Extraction) -> Self {
        self.entities.extend(other.entities);
        self.concepts.extend(other.concepts);
        self.topics.extend(other.topics);
        self
    }
}

fn dedup_labels(labels: Vec<String>, seen: &mut HashSet<String>) -> Vec<String> {
    labels
        .into_iter()
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty() && seen.insert(l.clone()))
        .collect()
}

const TECHNOLOGIES: &[&str] = &[
    "PostgreSQL", "Postgres", "MySQL", "MongoDB", "Mongo", "Redis", "SQLite", "Cassandra",
    "DynamoDB", "Elasticsearch", "Kafka", "RabbitMQ", "Kubernetes", "Docker", "Terraform",
    "AWS", "GCP", "Azure", "Linux", "Nginx", "GraphQL", "gRPC", "Rust", "Python",
    "Java", "JavaScript", "TypeScript", "Golang", "Kotlin", "React", "Vue", "Angular",
    "Django", "Node.js", "Tokio", "Spark", "Snowflake", "BigQuery",
    "Prometheus", "Grafana", "OAuth", "JWT",
];

const ORG_SUFFIXES: &[&str] = &[
    "Inc", "Inc.", "Corp", "Corp.", "Corporation", "Ltd", "Ltd.", "LLC", "GmbH", "Labs",
    "Technologies", "Systems", "Company", "Group", "Foundation", "University",
];

const LOCATIONS: &[&str] = &[
    "London", "Paris", "Berlin", "Tokyo", "Singapore", "Sydney", "Toronto", "New York",
    "San Francisco", "Seattle", "Boston", "Chicago", "Austin", "Dublin", "Amsterdam",
    "Lisbon", "Bangalore", "Europe", "Asia", "Africa", "America", "Canada", "Germany",
    "France", "Japan", "India", "China", "Brazil",
];

const STOPWORDS: &[&str] = &[
    "the", "this", "that", "these", "those", "a", "an", "and", "or", "but", "if", "then",
    "we", "our", "you", "your", "they", "their", "it", "its", "he", "she", "i", "in", "on",
    "at", "for", "to", "of", "by", "with", "from", "after", "before", "when", "while",
    "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday",
];

/// Topic buckets keyed by cue words.
const TOPIC_CUES: &[(&str, &[&str])] = &[
    ("databases", &["database", "postgres", "postgresql", "mysql", "mongodb", "mongo", "sql", "schema", "query", "sqlite", "redis"]),
    ("infrastructure", &["deploy", "deployment", "kubernetes", "docker", "server", "cluster", "cloud", "aws", "terraform"]),
    ("reliability", &["latency", "outage", "incident", "error", "downtime", "failure", "timeout", "slo"]),
    ("security", &["security", "auth", "authentication", "vulnerability", "encryption", "oauth", "jwt", "permission"]),
    ("finance", &["revenue", "budget", "cost", "pricing", "invoice", "spend", "profit"]),
    ("people", &["hire", "hiring", "team", "interview", "onboarding", "manager"]),
    ("product", &["feature", "launch", "roadmap", "customer", "release", "user"]),
    ("architecture", &["architecture", "service", "microservice", "api", "design", "monolith"]),
];

/// Deterministic pattern-based extractor.
#[derive(Debug, Clone)]
pub struct RuleExtractor {
    vocabulary: Vec<String>,
    money_re: Regex,
    percent_re: Regex,
    iso_date_re: Regex,
    month_date_re: Regex,
    quarter_re: Regex,
    year_re: Regex,
    product_re: Regex,
    capitalized_re: Regex,
}

impl Default for RuleExtractor {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl RuleExtractor {
    /// Create an extractor recognising `extra_vocabulary` as technologies.
    pub fn new(extra_vocabulary: Vec<String>) -> Self {
        let mut vocabulary: Vec<String> = TECHNOLOGIES.iter().map(|s| s.to_string()).collect();
        vocabulary.extend(extra_vocabulary);
        Self {
            vocabulary,
            // $1,200 / $3.5M / $40 million
            money_re: Regex::new(
                r"(?i)\$\s?\d[\d,]*(?:\.\d+)?\s?(?:k|m|b|bn|thousand|million|billion)?\b",
            )
            .expect("valid money pattern"),
            percent_re: Regex::new(r"(?i)\b\d+(?:\.\d+)?\s?(?:%|percent\b)")
                .expect("valid percent pattern"),
            iso_date_re: Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").expect("valid date pattern"),
            month_date_re: Regex::new(
                r"\b(?:Jan(?:uary)?|Feb(?:ruary)?|Mar(?:ch)?|Apr(?:il)?|May|June?|July?|Aug(?:ust)?|Sep(?:tember)?|Oct(?:ober)?|Nov(?:ember)?|Dec(?:ember)?)\.?\s+\d{1,2}(?:,\s*\d{4})?\b",
            )
            .expect("valid month pattern"),
            quarter_re: Regex::new(r"\bQ[1-4](?:\s?\d{4})?\b").expect("valid quarter pattern"),
            year_re: Regex::new(r"\b(?:19|20)\d{2}\b").expect("valid year pattern"),
            product_re: Regex::new(r"\b([A-Z][A-Za-z]+)\s+v?\d+(?:\.\d+)+\b")
                .expect("valid product pattern"),
            capitalized_re: Regex::new(r"\b[A-Z][A-Za-z0-9&.-]*(?:\s+[A-Z][A-Za-z0-9&.-]*)*")
                .expect("valid capitalised-run pattern"),
        }
    }

    /// Extract entities, concepts and topics from `text`.
    pub fn extract(&self, text: &str) -> Extraction {
        let mut entities = Vec::new();
        let mut claimed: Vec<(usize, usize)> = Vec::new();

        let push = |entities: &mut Vec<ExtractedEntity>,
                        claimed: &mut Vec<(usize, usize)>,
                        start: usize,
                        end: usize,
                        kind: EntityKind,
                        confidence: f64| {
            if claimed.iter().any(|(s, e)| start < *e && *s < end) {
                return;
            }
            claimed.push((start, end));
            entities.push(ExtractedEntity::new(text[start..end].trim(), kind, confidence));
        };

        for m in self.money_re.find_iter(text) {
            push(&mut entities, &mut claimed, m.start(), m.end(), EntityKind::Quantity, 0.9);
        }
        for m in self.percent_re.find_iter(text) {
            push(&mut entities, &mut claimed, m.start(), m.end(), EntityKind::Quantity, 0.9);
        }
        for m in self.iso_date_re.find_iter(text) {
            push(&mut entities, &mut claimed, m.start(), m.end(), EntityKind::Date, 0.95);
        }
        for m in self.month_date_re.find_iter(text) {
            push(&mut entities, &mut claimed, m.start(), m.end(), EntityKind::Date, 0.9);
        }
        for m in self.quarter_re.find_iter(text) {
            push(&mut entities, &mut claimed, m.start(), m.end(), EntityKind::Date, 0.8);
        }
        for m in self.year_re.find_iter(text) {
            push(&mut entities, &mut claimed, m.start(), m.end(), EntityKind::Date, 0.7);
        }

        for (start, end) in self.vocabulary_matches(text) {
            push(&mut entities, &mut claimed, start, end, EntityKind::Technology, 0.85);
        }
        for caps in self.product_re.captures_iter(text) {
            if let Some(m) = caps.get(0) {
                push(&mut entities, &mut claimed, m.start(), m.end(), EntityKind::Product, 0.6);
            }
        }

        for m in self.capitalized_re.find_iter(text) {
            let (start, end) = trim_run(text, m.start(), m.end());
            if start >= end {
                continue;
            }
            let run = &text[start..end];
            let words: Vec<&str> = run.split_whitespace().collect();
            let sentence_start = is_sentence_start(text, start);

            if let Some(last) = words.last() {
                if words.len() > 1 && ORG_SUFFIXES.contains(last) {
                    push(&mut entities, &mut claimed, start, end, EntityKind::Organization, 0.8);
                    continue;
                }
            }
            if LOCATIONS.iter().any(|l| l.eq_ignore_ascii_case(run)) {
                push(&mut entities, &mut claimed, start, end, EntityKind::Location, 0.75);
                continue;
            }
            if words.len() == 1 && (sentence_start || run.len() < 3) {
                continue;
            }
            let kind = if words.len() == 2 && words.iter().all(|w| is_title_word(w)) {
                EntityKind::Person
            } else {
                EntityKind::Concept
            };
            let confidence = if kind == EntityKind::Person { 0.45 } else { 0.5 };
            push(&mut entities, &mut claimed, start, end, kind, confidence);
        }

        Extraction {
            entities,
            concepts: self.concepts(text),
            topics: topics(text),
        }
    }

    fn vocabulary_matches(&self, text: &str) -> Vec<(usize, usize)> {
        let lower = text.to_ascii_lowercase();
        let mut found = Vec::new();
        for term in &self.vocabulary {
            let needle = term.to_ascii_lowercase();
            if needle.is_empty() {
                continue;
            }
            let mut from = 0;
            while let Some(pos) = lower[from..].find(&needle) {
                let start = from + pos;
                let end = start + needle.len();
                if is_word_boundary(&lower, start, end) {
                    found.push((start, end));
                }
                from = end;
            }
        }
        // Longest match first so "PostgreSQL" claims its span before "Postgres".
        found.sort_by(|a, b| (b.1 - b.0).cmp(&(a.1 - a.0)).then(a.0.cmp(&b.0)));
        found
    }

    /// Most frequent content words, longest first on ties.
    fn concepts(&self, text: &str) -> Vec<String> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for word in tokenize(text) {
            if word.len() < 5 || STOPWORDS.contains(&word.as_str()) || word.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            *counts.entry(word).or_default() += 1;
        }
        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then(b.0.len().cmp(&a.0.len()))
                .then(a.0.cmp(&b.0))
        });
        ranked.into_iter().take(5).map(|(w, _)| w).collect()
    }
}

fn topics(text: &str) -> Vec<String> {
    let words: HashSet<String> = tokenize(text).into_iter().collect();
    TOPIC_CUES
        .iter()
        .filter(|(_, cues)| cues.iter().any(|c| words.contains(*c)))
        .map(|(topic, _)| topic.to_string())
        .collect()
}

fn is_word_boundary(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    let is_word = |c: Option<char>| c.map(|c| c.is_alphanumeric()).unwrap_or(false);
    !is_word(before) && !is_word(after)
}

fn is_sentence_start(text: &str, start: usize) -> bool {
    let prefix = text[..start].trim_end();
    prefix.is_empty() || prefix.ends_with(['.', '!', '?', ':', '\n'])
}

fn is_title_word(word: &str) -> bool {
    let mut chars = word.chars();
    match chars.next() {
        Some(c) if c.is_uppercase() => chars.all(|c| c.is_lowercase()) && word.len() > 1,
        _ => false,
    }
}

/// Strip leading stopwords and trailing punctuation from a capitalised run.
fn trim_run(text: &str, mut start: usize, mut end: usize) -> (usize, usize) {
    loop {
        let run = &text[start..end];
        let first = run.split_whitespace().next().unwrap_or("");
        if !first.is_empty() && STOPWORDS.contains(&first.to_lowercase().as_str()) {
            match run.find(char::is_whitespace) {
                Some(ws) => {
                    let rest = &run[ws..];
                    start += ws + (rest.len() - rest.trim_start().len());
                }
                None => return (start, start),
            }
        } else {
            break;
        }
    }
    while end > start {
        let last = text[..end].chars().next_back();
        match last {
            Some(c) if matches!(c, '.' | ',' | '-' | '&') => end -= c.len_utf8(),
            _ => break,
        }
    }
    (start, end)
}

/// Strategy-selecting extractor with fallback.
#[derive(Clone)]
pub struct EntityExtractor {
    strategy: ExtractionStrategy,
    model: Option<Arc<dyn InferenceBackend>>,
    rules: RuleExtractor,
    timeout: Duration,
    min_confidence: f64,
    max_entities: usize,
}

impl EntityExtractor {
    pub fn new(config: &ExtractionConfig, model: Option<Arc<dyn InferenceBackend>>) -> Self {
        Self {
            strategy: config.strategy,
            model,
            rules: RuleExtractor::new(config.extra_vocabulary.clone()),
            timeout: Duration::from_millis(config.model_timeout_ms),
            min_confidence: config.min_confidence,
            max_entities: config.max_entities,
        }
    }

    pub fn rules(&self) -> &RuleExtractor {
        &self.rules
    }

    /// Extract from `text`, reporting which path produced the result.
    pub async fn extract(&self, text: &str) -> (Extraction, InferredBy) {
        let model = match (self.strategy, &self.model) {
            (ExtractionStrategy::Rules, _) | (_, None) => None,
            (_, Some(model)) => self.model_extraction(model, text).await,
        };
        let (found, by) = match (self.strategy, model) {
            (ExtractionStrategy::Hybrid, Some(found)) => {
                (found.merge(self.rules.extract(text)), InferredBy::Model)
            }
            (_, Some(found)) => (found, InferredBy::Model),
            (_, None) => (self.rules.extract(text), InferredBy::Rule),
        };
        (found.normalized(self.min_confidence, self.max_entities), by)
    }

    async fn model_extraction(
        &self,
        model: &Arc<dyn InferenceBackend>,
        text: &str,
    ) -> Option<Extraction> {
        match tokio::time::timeout(self.timeout, model.extract_entities(text)).await {
            Ok(Ok(extraction)) => {
                debug!(
                    backend = model.name(),
                    entities = extraction.entities.len(),
                    "Model extraction succeeded"
                );
                Some(extraction)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Model extraction failed, using rules");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Model extraction timed out, using rules"
                );
                None
            }
        }
    }
}
