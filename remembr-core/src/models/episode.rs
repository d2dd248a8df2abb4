use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tenancy::{MemoryScope, OwnerConstraint};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Episode {
    pub id: Uuid,
    pub org_id: Uuid,
    pub team_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub role: String,
    pub content: String,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub token_count: i32,
    pub created_at: DateTime<Utc>,
}

impl Episode {
    pub fn scope(&self) -> MemoryScope {
        MemoryScope {
            org_id: self.org_id,
            team_id: self.team_id,
            user_id: self.user_id,
            agent_id: self.agent_id,
        }
    }
}

/// Episode as submitted to the store; id and timestamp are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub scope: MemoryScope,
    pub session_id: Option<Uuid>,
    pub role: String,
    pub content: String,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub token_count: i32,
}

/// Symbolic filters shared by vector search and filtered listing.
///
/// `tags` matches on overlap (any shared tag). The time range is half-open:
/// `from <= created_at < to`. `owner` is applied before ranking and limits,
/// so a caller's page is never shortened by records it cannot see.
#[derive(Debug, Clone, Default)]
pub struct EpisodeFilters {
    pub owner: OwnerConstraint,
    pub session_id: Option<Uuid>,
    pub role: Option<String>,
    pub tags: Option<Vec<String>>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl EpisodeFilters {
    pub fn for_session(session_id: Uuid) -> Self {
        Self {
            session_id: Some(session_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, episode: &Episode) -> bool {
        if !self.owner.admits(&episode.scope()) {
            return false;
        }
        if let Some(session_id) = self.session_id {
            if episode.session_id != Some(session_id) {
                return false;
            }
        }
        if let Some(role) = &self.role {
            if &episode.role != role {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if !tags.is_empty() && !episode.tags.iter().any(|t| tags.contains(t)) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if episode.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if episode.created_at >= to {
                return false;
            }
        }
        true
    }
}

/// A vector-search candidate with its raw cosine distance.
#[derive(Debug, Clone)]
pub struct ScoredEpisode {
    pub episode: Episode,
    pub distance: f64,
}
