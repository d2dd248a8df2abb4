//! Hybrid Retriever: ranked search over the episodic store.
//!
//! Modes:
//! - `semantic`: cosine similarity only, filters applied strictly
//! - `hybrid` (default): similarity plus small recency and keyword boosts
//! - `filter_only`: no embedding call, symbolic filters ordered by recency
//!
//! Score = similarity + recency_weight * recency + keyword_weight * overlap,
//! where similarity = clamp(1 - cosine_distance / 2, 0, 1), recency halves
//! every `recency_half_life_hours`, and overlap is the share of distinct
//! query terms found in the episode. Both boosts lie in [0, 1] and their
//! weights sum below 0.25, so a similarity lead larger than the combined
//! weights is never overturned.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use remembr_core::config::RetrievalConfig;
use remembr_core::tokens::terms;
use remembr_core::{
    Episode, EpisodeFilters, EmbeddingProvider, MemoryError, OwnerConstraint, Result, TenancyContext,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::store::EpisodicStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Semantic,
    #[default]
    Hybrid,
    FilterOnly,
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            "filter_only" => Ok(SearchMode::FilterOnly),
            other => Err(format!("unknown search mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub session_id: Option<Uuid>,
    pub role: Option<String>,
    pub tags: Option<Vec<String>>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Defaults to `retrieval.default_limit`; capped at `retrieval.max_limit`.
    pub limit: Option<i64>,
    pub mode: SearchMode,
    /// Overrides `retrieval.min_similarity` for this request.
    pub min_similarity: Option<f64>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub(crate) fn filters(&self, owner: OwnerConstraint) -> EpisodeFilters {
        EpisodeFilters {
            owner,
            session_id: self.session_id,
            role: self.role.clone(),
            tags: self.tags.clone(),
            from: self.from,
            to: self.to,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub episode: Episode,
    pub score: f64,
    /// Absent in `filter_only` mode.
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    /// Candidates visible to the caller before truncation.
    pub total: usize,
    pub query_time_ms: u64,
    pub mode: SearchMode,
}

pub struct HybridRetriever {
    store: Arc<dyn EpisodicStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<dyn EpisodicStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// Abandons in-flight embedding and store calls as soon as `cancel` fires.
    ///
    /// Only episodes `ctx` may access are candidates; the ownership rule is
    /// part of the store query, so limits count visible episodes only.
    pub async fn search(
        &self,
        ctx: &TenancyContext,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse> {
        let started = Instant::now();
        let org_id = ctx.org_id;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MemoryError::Cancelled),
            result = self.run(ctx, request) => result,
        };

        let (results, total) = match result {
            Ok(ok) => ok,
            Err(e) => {
                tracing::debug!(org_id = %org_id, error = %e, mode = ?request.mode, "Search failed");
                return Err(e);
            }
        };

        let query_time_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            org_id = %org_id,
            mode = ?request.mode,
            total,
            returned = results.len(),
            query_time_ms,
            "Search complete"
        );

        Ok(SearchResponse {
            results,
            total,
            query_time_ms,
            mode: request.mode,
        })
    }

    /// Effective result limit, after rejecting malformed requests.
    pub fn validate(&self, request: &SearchRequest) -> Result<i64> {
        let limit = request.limit.unwrap_or(self.config.default_limit as i64);
        if limit < 1 {
            return Err(MemoryError::InvalidLimit(limit));
        }
        if let (Some(from), Some(to)) = (request.from, request.to) {
            if from > to {
                return Err(MemoryError::InvalidTimeRange { from, to });
            }
        }
        Ok(limit.min(self.config.max_limit as i64))
    }

    pub fn recency_half_life_hours(&self) -> f64 {
        self.config.recency_half_life_hours
    }

    async fn run(&self, ctx: &TenancyContext, request: &SearchRequest) -> Result<(Vec<SearchHit>, usize)> {
        let limit = self.validate(request)?;
        let org_id = ctx.org_id;
        let filters = request.filters(ctx.owner_constraint());
        let now = Utc::now();

        if request.mode == SearchMode::FilterOnly {
            let episodes = self.store.list_episodes(org_id, &filters, limit).await?;
            let hits: Vec<SearchHit> = visible(ctx, episodes, |e| e)
                .into_iter()
                .map(|episode| SearchHit {
                    score: recency_score(episode.created_at, now, self.config.recency_half_life_hours),
                    episode,
                    similarity: None,
                })
                .collect();
            let total = hits.len();
            return Ok((hits, total));
        }

        let query_vector = self.embedder.embed(&request.query).await?;

        let pool = (limit * self.config.candidate_multiplier as i64)
            .max(self.config.min_candidates as i64)
            .max(limit);
        let candidates = self
            .store
            .vector_search(org_id, &query_vector, self.embedder.model(), pool, &filters)
            .await?;
        let candidates = visible(ctx, candidates, |c| &c.episode);

        let total = candidates.len();

        let query_terms: HashSet<String> = terms(&request.query).into_iter().collect();
        let min_similarity = request.min_similarity.or(self.config.min_similarity);

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .filter_map(|candidate| {
                let similarity = similarity_from_distance(candidate.distance);
                if min_similarity.is_some_and(|min| similarity < min) {
                    return None;
                }
                let score = match request.mode {
                    SearchMode::Hybrid => {
                        similarity
                            + self.config.recency_weight
                                * recency_score(
                                    candidate.episode.created_at,
                                    now,
                                    self.config.recency_half_life_hours,
                                )
                            + self.config.keyword_weight
                                * keyword_overlap(&query_terms, &candidate.episode.content)
                    }
                    _ => similarity,
                };
                Some(SearchHit {
                    episode: candidate.episode,
                    score,
                    similarity: Some(similarity),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.episode.created_at.cmp(&a.episode.created_at))
        });
        hits.truncate(limit as usize);

        Ok((hits, total))
    }
}

/// Drop anything `ctx` may not access. The store already applies org and
/// ownership to every query; a hit here means a backend bug, so it is
/// logged loudly.
fn visible<T>(ctx: &TenancyContext, items: Vec<T>, episode: impl Fn(&T) -> &Episode) -> Vec<T> {
    let before = items.len();
    let kept: Vec<T> = items
        .into_iter()
        .filter(|item| ctx.can_access(&episode(item).scope()))
        .collect();
    if kept.len() != before {
        tracing::error!(
            org_id = %ctx.org_id,
            dropped = before - kept.len(),
            "Store returned episodes the caller may not access"
        );
    }
    kept
}

/// Cosine distance in [0, 2] mapped onto [0, 1], 1 meaning identical.
pub fn similarity_from_distance(distance: f64) -> f64 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

/// 1.0 for brand-new episodes, halving every `half_life_hours`.
pub fn recency_score(created_at: DateTime<Utc>, now: DateTime<Utc>, half_life_hours: f64) -> f64 {
    if half_life_hours <= 0.0 {
        return 0.0;
    }
    let age_hours = ((now - created_at).num_milliseconds().max(0) as f64) / 3_600_000.0;
    0.5f64.powf(age_hours / half_life_hours)
}

/// Share of distinct query terms that occur in `content`.
pub fn keyword_overlap(query_terms: &HashSet<String>, content: &str) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_terms: HashSet<String> = terms(content).into_iter().collect();
    let shared = query_terms.intersection(&content_terms).count();
    shared as f64 / query_terms.len() as f64
}
