//! Text embedding for context retrieval.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::IndexConfig;
use crate::error::{Error, Result};

/// Embedding contract used by the context index.
///
/// Implementations must return exactly one vector per input text, all of the
/// same dimension.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, Result<Vec<Vec<f32>>>>;
}

/// Pick the embedder named by the index configuration.
pub fn embedder_from_config(config: &IndexConfig) -> Result<Arc<dyn Embedder>> {
    match config.embedding_endpoint.as_deref().map(str::trim) {
        Some(endpoint) if !endpoint.is_empty() => Ok(Arc::new(HttpEmbedder::new(
            endpoint,
            config.embedding_model.clone(),
            config.embedding_api_key.clone(),
            config.timeout_secs,
        )?)),
        _ => Ok(Arc::new(HashingEmbedder::new(config.dimensions)?)),
    }
}

// =============================================================================
// Local hashing embedder
// =============================================================================

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "by", "for", "from", "in", "is", "it", "of", "on", "or",
    "the", "to", "was", "were", "what", "which", "with",
];

/// Deterministic bag-of-words embedder.
///
/// Each token (and each adjacent token pair) is hashed into a signed bucket
/// and the result is L2-normalised. Shared vocabulary drives similarity, which
/// is enough to match questions against schema and metric descriptions.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(Error::Config(
                "hashing embedder dimension must be > 0".to_string(),
            ));
        }
        Ok(Self { dim })
    }

    pub fn dimensions(&self) -> usize {
        self.dim
    }

    /// Embed one text synchronously.
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0_f32; self.dim];
        let tokens = tokenize(text);

        for token in &tokens {
            self.add(&mut v, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let joined = format!("{} {}", pair[0], pair[1]);
            self.add(&mut v, joined.as_bytes(), 0.5);
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }

    #[expect(clippy::cast_possible_truncation)]
    fn add(&self, v: &mut [f32], bytes: &[u8], weight: f32) {
        let h = fnv1a(bytes);
        let slot = (h % self.dim as u64) as usize;
        let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        v[slot] += sign * weight;
    }
}

impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
        let out = texts.iter().map(|t| self.embed_one(t)).collect();
        futures::future::ready(Ok(out)).boxed()
    }
}

/// Lowercased word tokens with light plural folding and stopwords removed.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .map(|t| {
            if t.len() > 3 && t.ends_with('s') && !t.ends_with("ss") {
                t[..t.len() - 1].to_string()
            } else {
                t
            }
        })
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Cosine similarity; zero when either vector is all zeros or sizes differ.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

// =============================================================================
// HTTP embedder
// =============================================================================

/// OpenAI-compatible `/embeddings` endpoint.
///
/// Request payload: `{ "model": "...", "input": [...] }`.
/// Response payload: `{ "data": [{ "index": 0, "embedding": [...] }, ...] }`.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    endpoint: String,
    model: Option<String>,
    bearer_token: Option<String>,
    client: Client,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        model: Option<String>,
        bearer_token: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        if timeout_secs == 0 {
            return Err(Error::Config(
                "http embedding timeout must be > 0 seconds".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            model,
            bearer_token,
            client,
        })
    }

    async fn call(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        #[derive(Serialize)]
        struct Req<'a> {
            input: &'a [String],
            #[serde(skip_serializing_if = "Option::is_none")]
            model: Option<&'a str>,
        }

        #[derive(Deserialize)]
        struct Resp {
            data: Vec<Item>,
        }

        #[derive(Deserialize)]
        struct Item {
            #[serde(default)]
            index: usize,
            embedding: Vec<f32>,
        }

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = Req {
            input: texts,
            model: self.model.as_deref(),
        };
        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(Error::Embedding(format!(
                "embedding request failed: status {}",
                resp.status()
            )));
        }

        let mut parsed: Resp = resp
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("invalid embedding response: {e}")))?;
        parsed.data.sort_by_key(|item| item.index);
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|i| i.embedding).collect();
        validate_embedding_result(texts.len(), &vectors)?;
        Ok(vectors)
    }
}

impl Embedder for HttpEmbedder {
    fn name(&self) -> &str {
        "http"
    }

    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
        self.call(texts).boxed()
    }
}

fn validate_embedding_result(input_count: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != input_count {
        return Err(Error::Embedding(format!(
            "embedding provider returned {} vectors for {} inputs",
            vectors.len(),
            input_count
        )));
    }
    let Some(first) = vectors.first() else {
        return Ok(());
    };
    let dim = first.len();
    if dim == 0 {
        return Err(Error::Embedding(
            "embedding provider returned zero-dimension vectors".to_string(),
        ));
    }
    for (i, v) in vectors.iter().enumerate() {
        if v.len() != dim {
            return Err(Error::Embedding(format!(
                "embedding dimension mismatch at index {i}: expected {dim}, got {}",
                v.len()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_embedder_is_deterministic_and_normalised() {
        let embedder = HashingEmbedder::new(64).expect("embedder");
        let a = embedder.embed_one("total sales by region");
        let b = embedder.embed_one("total sales by region");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let embedder = HashingEmbedder::new(256).expect("embedder");
        let query = embedder.embed_one("What were total sales in Q4 2025?");
        let sales = embedder.embed_one("Table sales: one row per sale with amount and sale date");
        let expenses = embedder.embed_one("Table expenses: operating costs by category");
        assert!(cosine(&query, &sales) > cosine(&query, &expenses));
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let embedder = HashingEmbedder::new(8).expect("embedder");
        let v = embedder.embed_one("   ");
        assert!(v.iter().all(|x| *x == 0.0));
        assert_eq!(cosine(&v, &v), 0.0);
    }

    #[test]
    fn zero_dimension_is_rejected() {
        assert!(HashingEmbedder::new(0).is_err());
    }

    #[test]
    fn tokenize_folds_plurals_and_drops_stopwords() {
        assert_eq!(
            tokenize("What were the Sales of Products?"),
            vec!["sale", "product"]
        );
        assert_eq!(tokenize("gross"), vec!["gross"]);
    }

    #[test]
    fn cosine_handles_mismatched_lengths() {
        assert_eq!(cosine(&[1.0, 0.0], &[1.0]), 0.0);
        assert!((cosine(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn validate_embedding_result_checks_count_and_dim() {
        let err = validate_embedding_result(2, &[vec![1.0]]).expect_err("count mismatch");
        assert!(err.to_string().contains("returned 1 vectors for 2 inputs"));

        let err =
            validate_embedding_result(2, &[vec![1.0, 2.0], vec![1.0]]).expect_err("dim mismatch");
        assert!(err.to_string().contains("dimension mismatch"));
    }

    #[test]
    fn config_without_endpoint_uses_hashing() {
        let embedder = embedder_from_config(&IndexConfig::default()).expect("embedder");
        assert_eq!(embedder.name(), "hashing");
    }

    #[tokio::test]
    async fn trait_embed_returns_one_vector_per_text() {
        let embedder = HashingEmbedder::new(16).expect("embedder");
        let texts = vec!["a b".to_string(), "c".to_string()];
        let out = embedder.embed(&texts).await.expect("embed");
        assert_eq!(out.len(), 2);
    }
}
