//! Retrieval Planner: turns a query into a ranked, deduplicated,
//! budget-bounded set of context items.
//!
//! Pipeline:
//! 1. embed the query text
//! 2. fetch `budget * k_candidates_multiplier` candidates from the store
//! 3. drop candidates under the raw similarity floor
//! 4. score `w_sim * similarity + w_recency * decay + w_type * priority`
//! 5. order by score, then higher iteration, then lower id
//! 6. greedily drop near-duplicates of already kept items, stop at budget
//!
//! Returned items are touched afterwards; the result itself reflects the
//! snapshot the search read.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::config::RetrievalConfig;
use super::error::{StoreError, StoreResult};
use super::index::cosine_similarity;
use super::store::{Candidate, ContextStore};
use crate::models::context::{
    ContextItem, MatchReason, RetrievalFilters, RetrievalHit, RetrievalResult, ScoreBreakdown,
};

#[derive(Debug, Clone)]
struct Scored {
    item: ContextItem,
    score: f64,
    breakdown: ScoreBreakdown,
    reason: MatchReason,
}

/// Ranking policy: descending score; at equal score the higher iteration
/// (fresher context) wins; then the lower id.
fn rank_order(a: &Scored, b: &Scored) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.item.iteration.cmp(&a.item.iteration))
        .then_with(|| a.item.id.cmp(&b.item.id))
}

pub struct RetrievalPlanner {
    store: Arc<ContextStore>,
    config: RetrievalConfig,
}

impl RetrievalPlanner {
    pub fn new(store: Arc<ContextStore>, config: RetrievalConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub async fn retrieve(
        &self,
        query: &str,
        filters: &RetrievalFilters,
        budget: usize,
    ) -> StoreResult<RetrievalResult> {
        let budget = budget.min(self.config.max_budget);
        if budget == 0 || self.store.is_empty() {
            return Ok(RetrievalResult::empty());
        }

        let embed_start = Instant::now();
        let query_vector = self.store.embed(query).await?;
        let embedding_time_ms = embed_start.elapsed().as_secs_f64() * 1000.0;

        let search_start = Instant::now();
        let k = budget
            .saturating_mul(self.config.k_candidates_multiplier)
            .max(budget);
        let store = self.store.clone();
        let search_filters = filters.clone();
        let search = tokio::task::spawn_blocking(move || {
            store.search(&query_vector, k, &search_filters)
        });

        // An expired search keeps running on the blocking pool; its result is dropped.
        let candidates = match tokio::time::timeout(self.config.timeout(), search).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => return Err(StoreError::Internal(format!("search task failed: {e}"))),
            Err(_) => {
                return Err(StoreError::Timeout {
                    operation: "search",
                    elapsed: search_start.elapsed(),
                });
            },
        };
        let total_candidates = candidates.len();

        let (hits, deduplicated) = self.rank(candidates, budget, self.store.now());
        let search_time_ms = search_start.elapsed().as_secs_f64() * 1000.0;

        let ids: Vec<_> = hits.iter().map(|hit| hit.item.id).collect();
        self.store.touch(&ids);

        info!(
            budget,
            k_candidates = k,
            total_candidates,
            deduplicated,
            returned = hits.len(),
            embedding_time_ms,
            search_time_ms,
            "Retrieved context"
        );

        Ok(RetrievalResult {
            hits,
            embedding_time_ms,
            search_time_ms,
            total_candidates,
            deduplicated,
        })
    }

    /// Score, order, deduplicate and truncate candidates. Returns the hits and
    /// the number of near-duplicates dropped.
    pub fn rank(
        &self,
        candidates: Vec<Candidate>,
        budget: usize,
        now: DateTime<Utc>,
    ) -> (Vec<RetrievalHit>, usize) {
        let mut scored: Vec<Scored> = candidates
            .into_iter()
            .filter(|c| c.similarity >= self.config.min_similarity)
            .map(|c| self.score(c, now))
            .collect();
        scored.sort_by(rank_order);

        let threshold = self.config.dedup_similarity_threshold;
        let mut kept: Vec<Scored> = Vec::with_capacity(budget);
        let mut deduplicated = 0;
        for candidate in scored {
            if kept.len() >= budget {
                break;
            }
            let duplicate = kept.iter().any(|k| {
                f64::from(cosine_similarity(&k.item.embedding, &candidate.item.embedding))
                    >= threshold
            });
            if duplicate {
                debug!(item_id = %candidate.item.id, "Dropping near-duplicate candidate");
                deduplicated += 1;
                continue;
            }
            kept.push(candidate);
        }

        let hits = kept
            .into_iter()
            .map(|s| RetrievalHit {
                item: s.item.view(),
                score: s.score,
                breakdown: s.breakdown,
                reason: s.reason,
            })
            .collect();
        (hits, deduplicated)
    }

    fn score(&self, candidate: Candidate, now: DateTime<Utc>) -> Scored {
        let weights = self.config.ranking_weights;
        let age_ms = (now - candidate.item.last_touched()).num_milliseconds().max(0);
        let age_hours = age_ms as f64 / 3_600_000.0;
        let recency = (-age_hours / self.config.recency_half_life_hours).exp();
        let type_priority = candidate.item.context_type.default_priority();

        let contributions = [
            (weights.w_sim * candidate.similarity, MatchReason::Semantic),
            (weights.w_recency * recency, MatchReason::Recency),
            (weights.w_type * type_priority, MatchReason::TypePriority),
        ];
        let score = contributions.iter().map(|(value, _)| value).sum();
        let reason = contributions
            .iter()
            .fold(contributions[0], |best, current| {
                if current.0 > best.0 { *current } else { best }
            })
            .1;

        Scored {
            item: candidate.item,
            score,
            breakdown: ScoreBreakdown {
                similarity: candidate.similarity,
                recency,
                type_priority,
            },
            reason,
        }
    }
}
