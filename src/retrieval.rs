//! Interchangeable retrieval strategies.
//!
//! All three return the same ranked [`RetrievalResult`] list:
//! - **Direct**: embed the query, search the session index.
//! - **QueryExpansion**: fan the query out through fixed templates, search
//!   per variation with a widened net, merge by chunk and rerank with a
//!   multi-hit bonus.
//! - **HypotheticalDocument**: ask the model for a plausible answer and
//!   search with the answer's embedding; falls back to Direct whenever the
//!   hypothesis cannot be produced or embedded.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::embedding::EmbeddingClient;
use crate::error::{Error, Result};
use crate::provider::{GenerationOptions, ModelProvider};
use crate::session::Session;
use crate::vector_store::RetrievalResult;

/// Variation searches accept scores down to `min_score * 0.8`.
const EXPANSION_SCORE_FLOOR_FACTOR: f32 = 0.8;
/// Rerank bonus per additional variation that retrieved the chunk.
const EXPANSION_HIT_BONUS: f32 = 0.05;
const HYDE_TEMPERATURE: f32 = 0.3;
const HYDE_MAX_OUTPUT_TOKENS: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetrievalStrategy {
    Direct,
    #[serde(alias = "query_expansion")]
    QueryExpansion,
    #[serde(alias = "hypothetical_document")]
    HypotheticalDocument,
}

impl Default for RetrievalStrategy {
    fn default() -> Self {
        Self::Direct
    }
}

impl fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Direct => "Direct",
            Self::QueryExpansion => "QueryExpansion",
            Self::HypotheticalDocument => "HypotheticalDocument",
        };
        f.write_str(name)
    }
}

/// The four fixed expansion templates, deduplicated case-insensitively.
pub(crate) fn expansion_variations(query: &str) -> Vec<String> {
    let q = query.trim();
    let candidates = [
        q.to_string(),
        format!("What is {}?", q),
        format!("How does {} work?", q),
        format!("Examples of {}", q),
    ];
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.to_lowercase()))
        .collect()
}

pub struct Retriever {
    embedding: Arc<EmbeddingClient>,
    provider: Arc<dyn ModelProvider>,
}

impl Retriever {
    pub fn new(embedding: Arc<EmbeddingClient>, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            embedding,
            provider,
        }
    }

    pub async fn retrieve(
        &self,
        session: &Session,
        query: &str,
        top_k: usize,
        strategy: RetrievalStrategy,
    ) -> Result<Vec<RetrievalResult>> {
        match strategy {
            RetrievalStrategy::Direct => self.direct(session, query, top_k).await,
            RetrievalStrategy::QueryExpansion => self.query_expansion(session, query, top_k).await,
            RetrievalStrategy::HypotheticalDocument => {
                self.hypothetical_document(session, query, top_k).await
            }
        }
    }

    async fn direct(
        &self,
        session: &Session,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let query_vector = self.embedding.embed(query).await?;
        session.vector_index.search(
            &query_vector,
            top_k,
            session.config.min_similarity_score,
        )
    }

    async fn query_expansion(
        &self,
        session: &Session,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let variations = expansion_variations(query);
        let embeddings = join_all(variations.iter().map(|v| self.embedding.embed(v))).await;

        let floor = session.config.min_similarity_score * EXPANSION_SCORE_FLOOR_FACTOR;
        let fetch = top_k * 2;

        struct Merged {
            result: RetrievalResult,
            max_score: f32,
            hit_count: u32,
            first_seen: usize,
        }

        let mut merged: HashMap<String, Merged> = HashMap::new();
        let mut order = 0usize;
        let mut succeeded = 0usize;
        let mut last_err: Option<Error> = None;

        for (variation, embedding) in variations.iter().zip(embeddings) {
            let query_vector = match embedding {
                Ok(v) => v,
                Err(e) => {
                    warn!(variation = %variation, error = %e,
                        "query variation embedding failed, skipping");
                    last_err = Some(e);
                    continue;
                }
            };
            succeeded += 1;

            let results = session.vector_index.search(&query_vector, fetch, floor)?;
            for result in results {
                let key = result.chunk.id.clone();
                match merged.get_mut(&key) {
                    Some(entry) => {
                        entry.hit_count += 1;
                        if result.similarity_score > entry.max_score {
                            entry.max_score = result.similarity_score;
                        }
                    }
                    None => {
                        merged.insert(
                            key,
                            Merged {
                                max_score: result.similarity_score,
                                hit_count: 1,
                                first_seen: order,
                                result,
                            },
                        );
                        order += 1;
                    }
                }
            }
        }

        if succeeded == 0 {
            return Err(last_err.unwrap_or_else(|| {
                Error::ProviderUnavailable("all query variation embeddings failed".to_string())
            }));
        }

        let mut reranked: Vec<Merged> = merged.into_values().collect();
        for entry in &mut reranked {
            entry.result.similarity_score = (entry.max_score
                + (entry.hit_count.saturating_sub(1)) as f32 * EXPANSION_HIT_BONUS)
                .min(1.0);
        }
        reranked.sort_by(|a, b| {
            b.result
                .similarity_score
                .partial_cmp(&a.result.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.first_seen.cmp(&b.first_seen))
        });
        reranked.truncate(top_k);

        debug!(query = %query, candidates = order, returned = reranked.len(),
            "query expansion retrieval merged");

        Ok(reranked
            .into_iter()
            .enumerate()
            .map(|(i, mut entry)| {
                entry.result.rank = i + 1;
                entry.result
            })
            .collect())
    }

    async fn hypothetical_document(
        &self,
        session: &Session,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let prompt = format!(
            "Write a short passage that plausibly answers the question below, \
             as if quoting a reference document. Respond with the passage only.\n\n\
             Question: {}",
            query.trim()
        );
        let options = GenerationOptions {
            max_output_tokens: HYDE_MAX_OUTPUT_TOKENS,
            temperature: HYDE_TEMPERATURE,
        };

        match self.provider.generate(&prompt, &options).await {
            Ok(hypothesis) if !hypothesis.trim().is_empty() => {
                match self.embedding.embed(&hypothesis).await {
                    Ok(query_vector) => {
                        return session.vector_index.search(
                            &query_vector,
                            top_k,
                            session.config.min_similarity_score,
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "hypothesis embedding failed, falling back to direct");
                    }
                }
            }
            Ok(_) => {
                warn!("hypothesis generation returned empty text, falling back to direct");
            }
            Err(e) => {
                warn!(error = %e, "hypothesis generation failed, falling back to direct");
            }
        }
        self.direct(session, query, top_k).await
    }
}
