//! Memory query: one request answered from both tiers.
//!
//! The short-term side reads the named session's window and keeps entries
//! that pass the role and time filters and, outside `filter_only`, contain
//! the query text. The episodic side is an ordinary [`HybridRetriever`]
//! search. The two lists are merged on one ordering and cut to the limit:
//! newest first in `filter_only`, otherwise by score, then newest.
//!
//! [`HybridRetriever`]: super::retrieve::HybridRetriever

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use remembr_core::tokens::terms;
use remembr_core::WindowEntry;
use serde::Serialize;
use uuid::Uuid;

use super::retrieve::{keyword_overlap, SearchHit, SearchMode, SearchRequest};

/// Bonus for a window entry containing the whole query verbatim.
const EXACT_MATCH_BONUS: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct MemoryQuery {
    pub search: SearchRequest,
    pub include_short_term: bool,
    pub include_episodic: bool,
}

impl MemoryQuery {
    pub fn new(search: SearchRequest) -> Self {
        Self {
            search,
            include_short_term: true,
            include_episodic: true,
        }
    }

    pub fn short_term(mut self, include: bool) -> Self {
        self.include_short_term = include;
        self
    }

    pub fn episodic(mut self, include: bool) -> Self {
        self.include_episodic = include;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowHit {
    pub entry: WindowEntry,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryQueryResult {
    pub short_term: Vec<WindowHit>,
    pub episodes: Vec<SearchHit>,
    /// Results returned across both tiers.
    pub total: usize,
    pub query_time_ms: u64,
}

/// Window entries matching `request`, scored by query term overlap.
///
/// Window entries carry no tags, so a non-empty tag filter matches none.
pub fn window_hits(request: &SearchRequest, entries: Vec<WindowEntry>) -> Vec<WindowHit> {
    if request.tags.as_ref().is_some_and(|tags| !tags.is_empty()) {
        return Vec::new();
    }

    let needle = request.query.trim().to_lowercase();
    let text_filter = request.mode != SearchMode::FilterOnly && !needle.is_empty();
    let query_terms: HashSet<String> = terms(&request.query).into_iter().collect();

    entries
        .into_iter()
        .filter(|entry| request.role.as_ref().map_or(true, |role| &entry.role == role))
        .filter(|entry| request.from.map_or(true, |from| entry.created_at >= from))
        .filter(|entry| request.to.map_or(true, |to| entry.created_at < to))
        .filter_map(|entry| {
            let contains = !needle.is_empty() && entry.content.to_lowercase().contains(&needle);
            if text_filter && !contains {
                return None;
            }
            let bonus = if contains { EXACT_MATCH_BONUS } else { 0.0 };
            let score = keyword_overlap(&query_terms, &entry.content) + bonus;
            Some(WindowHit { entry, score })
        })
        .collect()
}

enum Merged {
    Window(WindowHit),
    Episode(SearchHit),
}

impl Merged {
    fn score(&self) -> f64 {
        match self {
            Merged::Window(hit) => hit.score,
            Merged::Episode(hit) => hit.score,
        }
    }

    fn created_at(&self) -> DateTime<Utc> {
        match self {
            Merged::Window(hit) => hit.entry.created_at,
            Merged::Episode(hit) => hit.episode.created_at,
        }
    }
}

/// Keep the best-scoring hit per episode id, preserving first-seen order.
fn dedupe_episodes(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut order: Vec<Uuid> = Vec::new();
    let mut best: HashMap<Uuid, SearchHit> = HashMap::new();
    for hit in hits {
        let id = hit.episode.id;
        match best.get(&id) {
            Some(existing) if existing.score >= hit.score => {}
            Some(_) => {
                best.insert(id, hit);
            }
            None => {
                order.push(id);
                best.insert(id, hit);
            }
        }
    }
    order.into_iter().filter_map(|id| best.remove(&id)).collect()
}

/// Merge both tiers on one ordering and cut the result to `limit`.
pub fn merge(
    request: &SearchRequest,
    short_term: Vec<WindowHit>,
    episodes: Vec<SearchHit>,
    limit: usize,
    started: Instant,
) -> MemoryQueryResult {
    let mut merged: Vec<Merged> = short_term
        .into_iter()
        .map(Merged::Window)
        .chain(dedupe_episodes(episodes).into_iter().map(Merged::Episode))
        .collect();

    if request.mode == SearchMode::FilterOnly {
        merged.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
    } else {
        merged.sort_by(|a, b| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at().cmp(&a.created_at()))
        });
    }
    merged.truncate(limit);

    let total = merged.len();
    let mut result = MemoryQueryResult {
        short_term: Vec::new(),
        episodes: Vec::new(),
        total,
        query_time_ms: 0,
    };
    for item in merged {
        match item {
            Merged::Window(hit) => result.short_term.push(hit),
            Merged::Episode(hit) => result.episodes.push(hit),
        }
    }
    result.query_time_ms = started.elapsed().as_millis() as u64;
    result
}
