//! Embedding capability and similarity measures.
//!
//! The engine consumes embeddings; it never trains them. [`Embedder`] is the
//! seam for a real embedding service. [`HashEmbedder`] is a deterministic
//! offline stand-in and [`CachedEmbedder`] memoises any embedder by content
//! hash.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

/// Text to fixed-width vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Output dimension.
    fn dimension(&self) -> usize;

    /// Name for logs.
    fn name(&self) -> &str;
}

/// Feature-hashing embedder over lowercase word tokens and character trigrams.
///
/// Texts sharing vocabulary land close together, which is enough for tests
/// and for running without an embedding service.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let idx = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]) as usize
            % self.dimension;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (idx, sign)
    }

    /// Synchronous form of [`Embedder::embed`].
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for word in tokenize(text) {
            let (idx, sign) = self.bucket(&word);
            v[idx] += sign;

            let chars: Vec<char> = format!("#{}#", word).chars().collect();
            for tri in chars.windows(3) {
                let tri: String = tri.iter().collect();
                let (idx, sign) = self.bucket(&tri);
                v[idx] += sign * 0.25;
            }
        }
        normalize(&mut v);
        v
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(Error::malformed("cannot embed empty text"));
        }
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hash"
    }
}

/// Cache key for an embedding: SHA-256 of the text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmbeddingKey(pub String);

impl EmbeddingKey {
    pub fn from_text(text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<EmbeddingKey, Vec<f32>>,
    order: VecDeque<EmbeddingKey>,
    hits: u64,
    misses: u64,
}

/// Embedding cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EmbeddingCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl EmbeddingCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// FIFO-bounded memo over another embedder.
pub struct CachedEmbedder<E: Embedder> {
    inner: E,
    capacity: usize,
    state: Arc<RwLock<CacheState>>,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            state: Arc::new(RwLock::new(CacheState::default())),
        }
    }

    pub async fn stats(&self) -> EmbeddingCacheStats {
        let state = self.state.read().await;
        EmbeddingCacheStats {
            hits: state.hits,
            misses: state.misses,
            entries: state.entries.len(),
        }
    }
}

#[async_trait]
impl<E: Embedder> Embedder for CachedEmbedder<E> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = EmbeddingKey::from_text(text);
        {
            let mut state = self.state.write().await;
            if let Some(v) = state.entries.get(&key).cloned() {
                state.hits += 1;
                return Ok(v);
            }
            state.misses += 1;
        }

        let v = self.inner.embed(text).await?;

        let mut state = self.state.write().await;
        if !state.entries.contains_key(&key) {
            while state.entries.len() >= self.capacity {
                match state.order.pop_front() {
                    Some(old) => {
                        state.entries.remove(&old);
                    }
                    None => break,
                }
            }
            state.order.push_back(key.clone());
            state.entries.insert(key, v.clone());
            debug!(embedder = self.inner.name(), cached = state.entries.len(), "Cached embedding");
        }
        Ok(v)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Cosine similarity in `[-1, 1]`; 0.0 for zero or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0)
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Lowercase alphanumeric runs longer than two characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

/// Keyword relevance of `text` to `query` in `[0, 1]`.
///
/// Token Jaccard scaled by 0.8, plus 0.2 when the whole query occurs in the
/// text. Used when an entry or query has no embedding.
pub fn keyword_relevance(query: &str, text: &str) -> f64 {
    let q: HashSet<String> = tokenize(query).into_iter().collect();
    let t: HashSet<String> = tokenize(text).into_iter().collect();
    if q.is_empty() || t.is_empty() {
        return 0.0;
    }
    let intersection = q.intersection(&t).count() as f64;
    let union = q.union(&t).count() as f64;
    let jaccard = intersection / union;

    let bonus = if text.to_lowercase().contains(&query.trim().to_lowercase()) {
        0.2
    } else {
        0.0
    };

    (jaccard * 0.8 + bonus).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_hash_embedder_is_deterministic_and_normalised() {
        let e = HashEmbedder::new(64);
        let a = e.embed_sync("PostgreSQL handles our billing data");
        let b = e.embed_sync("PostgreSQL handles our billing data");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_similarity_tracks_vocabulary() {
        let e = HashEmbedder::default();
        let a = e.embed_sync("database migration to PostgreSQL");
        let b = e.embed_sync("PostgreSQL database migration plan");
        let c = e.embed_sync("quarterly marketing offsite in Lisbon");
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn test_keyword_relevance() {
        assert_eq!(keyword_relevance("", "anything here"), 0.0);
        let exact = keyword_relevance("database outage", "The database outage lasted an hour");
        let partial = keyword_relevance("database outage", "A database was migrated");
        let none = keyword_relevance("database outage", "Lunch menu for Friday");
        assert!(exact > partial);
        assert!(partial > none);
        assert_eq!(none, 0.0);
        assert!(exact <= 1.0);
    }

    #[test]
    fn test_tokenize_drops_short_words() {
        assert_eq!(tokenize("We use Go and Rust, ok?"), vec!["use", "and", "rust"]);
    }

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32, 1.0])
        }

        fn dimension(&self) -> usize {
            2
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_cached_embedder_hits() {
        let cached = CachedEmbedder::new(
            CountingEmbedder {
                calls: AtomicUsize::new(0),
            },
            2,
        );
        cached.embed("alpha").await.unwrap();
        cached.embed("alpha").await.unwrap();
        cached.embed("beta").await.unwrap();
        cached.embed("gamma").await.unwrap();
        cached.embed("alpha").await.unwrap();

        let stats = cached.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 4);
        assert_eq!(stats.entries, 2);
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_hash_embedder_rejects_empty() {
        assert!(HashEmbedder::default().embed("  ").await.is_err());
    }
}
