//! Episodic store: durable episodes, sessions, embeddings and checkpoints.
//!
//! Every method takes the caller's `org_id` and applies it as a mandatory
//! predicate inside the backend, so a scoping bug in a caller can never
//! surface another org's rows. Absent and out-of-org records are both
//! reported as not found.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use remembr_core::{
    Checkpoint, Episode, EpisodeFilters, MemoryError, NewEpisode, NewSession, OwnerConstraint,
    Result, ScoredEpisode, Session, WindowEntry,
};
use uuid::Uuid;

pub use memory::InMemoryEpisodicStore;
pub use postgres::PgEpisodicStore;

/// Counts removed by a session cascade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionDeletion {
    pub episodes: u64,
    pub checkpoints: u64,
}

/// Result of deleting everything a user owns inside one org.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDeletion {
    pub sessions: Vec<Uuid>,
    pub episodes: u64,
    pub checkpoints: u64,
}

/// Episode awaiting an embedding for the active model.
#[derive(Debug, Clone)]
pub struct PendingEmbedding {
    pub org_id: Uuid,
    pub episode_id: Uuid,
    pub content: String,
}

#[async_trait]
pub trait EpisodicStore: Send + Sync {
    async fn create_session(&self, org_id: Uuid, session: NewSession) -> Result<Session>;

    /// Fails with `SessionNotFound` when absent from `org_id`.
    async fn get_session(&self, org_id: Uuid, session_id: Uuid) -> Result<Session>;

    async fn update_session_metadata(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        metadata: serde_json::Value,
    ) -> Result<Session>;

    /// Newest first. `owner` is applied before pagination.
    async fn list_sessions(
        &self,
        org_id: Uuid,
        owner: &OwnerConstraint,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>>;

    async fn list_user_sessions(&self, org_id: Uuid, user_id: Uuid) -> Result<Vec<Uuid>>;

    /// Fails with `ScopeViolation` when the episode's declared org differs
    /// from `org_id`, and `SessionNotFound` when its session is not in `org_id`.
    async fn put_episode(&self, org_id: Uuid, episode: NewEpisode) -> Result<Episode>;

    async fn get_episode(&self, org_id: Uuid, episode_id: Uuid) -> Result<Episode>;

    /// Session history ordered by creation time, newest first.
    async fn get_episodes(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Episode>>;

    /// Filtered listing without similarity, newest first.
    async fn list_episodes(
        &self,
        org_id: Uuid,
        filters: &EpisodeFilters,
        limit: i64,
    ) -> Result<Vec<Episode>>;

    /// Insert or replace the embedding for (episode, model).
    async fn put_embedding(
        &self,
        org_id: Uuid,
        episode_id: Uuid,
        vector: Vec<f32>,
        model: &str,
    ) -> Result<()>;

    /// Candidates ordered by ascending cosine distance.
    async fn vector_search(
        &self,
        org_id: Uuid,
        query: &[f32],
        model: &str,
        limit: i64,
        filters: &EpisodeFilters,
    ) -> Result<Vec<ScoredEpisode>>;

    /// Maintenance: episodes across all orgs lacking an embedding for `model`,
    /// oldest first, skipping the ids in `exclude`.
    async fn episodes_missing_embedding(
        &self,
        model: &str,
        limit: i64,
        exclude: &[Uuid],
    ) -> Result<Vec<PendingEmbedding>>;

    /// Maintenance: drop embeddings of every model other than `model`.
    async fn delete_embeddings_except(&self, model: &str) -> Result<u64>;

    async fn put_checkpoint(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        entries: Vec<WindowEntry>,
    ) -> Result<Checkpoint>;

    /// Fails with `CheckpointNotFound` unless the checkpoint belongs to `session_id`.
    async fn get_checkpoint(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        checkpoint_id: Uuid,
    ) -> Result<Checkpoint>;

    /// Newest first.
    async fn list_checkpoints(&self, org_id: Uuid, session_id: Uuid) -> Result<Vec<Checkpoint>>;

    /// Deletes the episode and its embeddings.
    async fn delete_episode(&self, org_id: Uuid, episode_id: Uuid) -> Result<()>;

    /// Deletes the session's episodes, embeddings and checkpoints, then the
    /// session, in one transaction.
    async fn delete_session(&self, org_id: Uuid, session_id: Uuid) -> Result<SessionDeletion>;

    /// Deletes every session and episode the user owns in `org_id`, in one
    /// transaction.
    async fn delete_all_for_user(&self, org_id: Uuid, user_id: Uuid) -> Result<UserDeletion>;

    async fn health(&self) -> Result<String>;
}

/// Declared embedding models and their output sizes.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, usize>,
}

impl ModelRegistry {
    pub fn new(models: HashMap<String, usize>) -> Self {
        Self { models }
    }

    pub fn single(model: impl Into<String>, dimensions: usize) -> Self {
        let mut models = HashMap::new();
        models.insert(model.into(), dimensions);
        Self { models }
    }

    pub fn dimensions(&self, model: &str) -> Option<usize> {
        self.models.get(model).copied()
    }

    pub fn check(&self, model: &str, actual: usize) -> Result<usize> {
        let expected = self
            .dimensions(model)
            .ok_or_else(|| MemoryError::UnknownModel(model.to_string()))?;
        if expected != actual {
            return Err(MemoryError::DimensionMismatch {
                model: model.to_string(),
                expected,
                actual,
            });
        }
        Ok(expected)
    }
}

pub(crate) fn ensure_org(org_id: Uuid, episode: &NewEpisode) -> Result<()> {
    if episode.scope.org_id != org_id {
        return Err(MemoryError::ScopeViolation {
            expected_org: org_id,
            actual_org: episode.scope.org_id,
        });
    }
    Ok(())
}
