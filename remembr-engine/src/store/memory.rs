//! In-memory episodic store for development and testing.
//!
//! All state sits behind one lock so cascades are atomic with respect to
//! readers, mirroring the transactional guarantees of the Postgres store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use remembr_core::{
    Checkpoint, Embedding, Episode, EpisodeFilters, MemoryError, NewEpisode, NewSession,
    OwnerConstraint, Result, ScoredEpisode, Session, WindowEntry,
};
use uuid::Uuid;

use super::{
    ensure_org, EpisodicStore, ModelRegistry, PendingEmbedding, SessionDeletion, UserDeletion,
};

#[derive(Default)]
struct Inner {
    next_seq: u64,
    sessions: HashMap<Uuid, (u64, Session)>,
    episodes: HashMap<Uuid, (u64, Episode)>,
    embeddings: HashMap<(Uuid, String), Embedding>,
    checkpoints: HashMap<Uuid, (u64, Checkpoint)>,
}

impl Inner {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn session_in_org(&self, org_id: Uuid, session_id: Uuid) -> Option<&Session> {
        self.sessions
            .get(&session_id)
            .map(|(_, s)| s)
            .filter(|s| s.org_id == org_id)
    }

    fn episodes_newest_first<'a>(
        &'a self,
        org_id: Uuid,
        filters: &'a EpisodeFilters,
    ) -> Vec<&'a (u64, Episode)> {
        let mut rows: Vec<&(u64, Episode)> = self
            .episodes
            .values()
            .filter(|(_, e)| e.org_id == org_id && filters.matches(e))
            .collect();
        rows.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at).then(b.0.cmp(&a.0)));
        rows
    }

    fn remove_episode(&mut self, episode_id: Uuid) {
        self.episodes.remove(&episode_id);
        self.embeddings.retain(|(id, _), _| *id != episode_id);
    }

    fn cascade_session(&mut self, session_id: Uuid) -> SessionDeletion {
        let episode_ids: Vec<Uuid> = self
            .episodes
            .values()
            .filter(|(_, e)| e.session_id == Some(session_id))
            .map(|(_, e)| e.id)
            .collect();
        for id in &episode_ids {
            self.remove_episode(*id);
        }

        let before = self.checkpoints.len();
        self.checkpoints.retain(|_, (_, c)| c.session_id != session_id);
        let checkpoints = (before - self.checkpoints.len()) as u64;

        self.sessions.remove(&session_id);

        SessionDeletion {
            episodes: episode_ids.len() as u64,
            checkpoints,
        }
    }
}

pub struct InMemoryEpisodicStore {
    inner: RwLock<Inner>,
    models: ModelRegistry,
}

impl InMemoryEpisodicStore {
    pub fn new(models: ModelRegistry) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            models,
        }
    }

    pub fn episode_count(&self) -> usize {
        self.inner.read().episodes.len()
    }

    pub fn embedding_count(&self) -> usize {
        self.inner.read().embeddings.len()
    }
}

fn paginate<T: Clone>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    rows.skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

/// Cosine distance in [0, 2]; zero vectors are treated as orthogonal.
pub(crate) fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 2.0)
}

#[async_trait]
impl EpisodicStore for InMemoryEpisodicStore {
    async fn create_session(&self, org_id: Uuid, session: NewSession) -> Result<Session> {
        if session.scope.org_id != org_id {
            return Err(MemoryError::ScopeViolation {
                expected_org: org_id,
                actual_org: session.scope.org_id,
            });
        }

        let record = Session {
            id: Uuid::new_v4(),
            org_id,
            team_id: session.scope.team_id,
            user_id: session.scope.user_id,
            agent_id: session.scope.agent_id,
            metadata: session.metadata,
            created_at: Utc::now(),
            expires_at: session.expires_at,
        };

        let mut inner = self.inner.write();
        let seq = inner.seq();
        inner.sessions.insert(record.id, (seq, record.clone()));
        Ok(record)
    }

    async fn get_session(&self, org_id: Uuid, session_id: Uuid) -> Result<Session> {
        self.inner
            .read()
            .session_in_org(org_id, session_id)
            .cloned()
            .ok_or(MemoryError::SessionNotFound(session_id))
    }

    async fn update_session_metadata(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        metadata: serde_json::Value,
    ) -> Result<Session> {
        let mut inner = self.inner.write();
        match inner.sessions.get_mut(&session_id) {
            Some((_, session)) if session.org_id == org_id => {
                session.metadata = metadata;
                Ok(session.clone())
            }
            _ => Err(MemoryError::SessionNotFound(session_id)),
        }
    }

    async fn list_sessions(
        &self,
        org_id: Uuid,
        owner: &OwnerConstraint,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>> {
        let inner = self.inner.read();
        let mut rows: Vec<&(u64, Session)> = inner
            .sessions
            .values()
            .filter(|(_, s)| s.org_id == org_id && owner.admits(&s.scope()))
            .collect();
        rows.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at).then(b.0.cmp(&a.0)));
        Ok(paginate(rows.into_iter().map(|(_, s)| s.clone()), limit, offset))
    }

    async fn list_user_sessions(&self, org_id: Uuid, user_id: Uuid) -> Result<Vec<Uuid>> {
        let inner = self.inner.read();
        let mut rows: Vec<&(u64, Session)> = inner
            .sessions
            .values()
            .filter(|(_, s)| s.org_id == org_id && s.user_id == Some(user_id))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, s)| s.id).collect())
    }

    async fn put_episode(&self, org_id: Uuid, episode: NewEpisode) -> Result<Episode> {
        ensure_org(org_id, &episode)?;

        let mut inner = self.inner.write();
        if let Some(session_id) = episode.session_id {
            if inner.session_in_org(org_id, session_id).is_none() {
                return Err(MemoryError::SessionNotFound(session_id));
            }
        }

        let record = Episode {
            id: Uuid::new_v4(),
            org_id,
            team_id: episode.scope.team_id,
            user_id: episode.scope.user_id,
            agent_id: episode.scope.agent_id,
            session_id: episode.session_id,
            role: episode.role,
            content: episode.content,
            tags: episode.tags,
            metadata: episode.metadata,
            token_count: episode.token_count,
            created_at: Utc::now(),
        };

        let seq = inner.seq();
        inner.episodes.insert(record.id, (seq, record.clone()));
        Ok(record)
    }

    async fn get_episode(&self, org_id: Uuid, episode_id: Uuid) -> Result<Episode> {
        self.inner
            .read()
            .episodes
            .get(&episode_id)
            .map(|(_, e)| e)
            .filter(|e| e.org_id == org_id)
            .cloned()
            .ok_or_else(|| MemoryError::not_found("episode", episode_id))
    }

    async fn get_episodes(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Episode>> {
        let inner = self.inner.read();
        if inner.session_in_org(org_id, session_id).is_none() {
            return Err(MemoryError::SessionNotFound(session_id));
        }
        let filters = EpisodeFilters::for_session(session_id);
        let rows = inner.episodes_newest_first(org_id, &filters);
        Ok(paginate(rows.into_iter().map(|(_, e)| e.clone()), limit, offset))
    }

    async fn list_episodes(
        &self,
        org_id: Uuid,
        filters: &EpisodeFilters,
        limit: i64,
    ) -> Result<Vec<Episode>> {
        let inner = self.inner.read();
        let rows = inner.episodes_newest_first(org_id, filters);
        Ok(paginate(rows.into_iter().map(|(_, e)| e.clone()), limit, 0))
    }

    async fn put_embedding(
        &self,
        org_id: Uuid,
        episode_id: Uuid,
        vector: Vec<f32>,
        model: &str,
    ) -> Result<()> {
        let dimensions = self.models.check(model, vector.len())?;

        let mut inner = self.inner.write();
        let owned = inner
            .episodes
            .get(&episode_id)
            .map(|(_, e)| e.org_id == org_id)
            .unwrap_or(false);
        if !owned {
            return Err(MemoryError::not_found("episode", episode_id));
        }

        inner.embeddings.insert(
            (episode_id, model.to_string()),
            Embedding {
                episode_id,
                org_id,
                model: model.to_string(),
                dimensions,
                vector,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn vector_search(
        &self,
        org_id: Uuid,
        query: &[f32],
        model: &str,
        limit: i64,
        filters: &EpisodeFilters,
    ) -> Result<Vec<ScoredEpisode>> {
        self.models.check(model, query.len())?;

        let inner = self.inner.read();
        let mut scored: Vec<(u64, ScoredEpisode)> = inner
            .episodes
            .values()
            .filter(|(_, e)| e.org_id == org_id && filters.matches(e))
            .filter_map(|(seq, e)| {
                let emb = inner.embeddings.get(&(e.id, model.to_string()))?;
                Some((
                    *seq,
                    ScoredEpisode {
                        episode: e.clone(),
                        distance: cosine_distance(query, &emb.vector),
                    },
                ))
            })
            .collect();

        scored.sort_by(|a, b| {
            a.1.distance
                .partial_cmp(&b.1.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.0.cmp(&a.0))
        });

        Ok(paginate(scored.into_iter().map(|(_, s)| s), limit, 0))
    }

    async fn episodes_missing_embedding(
        &self,
        model: &str,
        limit: i64,
        exclude: &[Uuid],
    ) -> Result<Vec<PendingEmbedding>> {
        let inner = self.inner.read();
        let mut rows: Vec<&(u64, Episode)> = inner
            .episodes
            .values()
            .filter(|(_, e)| !exclude.contains(&e.id))
            .filter(|(_, e)| !inner.embeddings.contains_key(&(e.id, model.to_string())))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(paginate(
            rows.into_iter().map(|(_, e)| PendingEmbedding {
                org_id: e.org_id,
                episode_id: e.id,
                content: e.content.clone(),
            }),
            limit,
            0,
        ))
    }

    async fn delete_embeddings_except(&self, model: &str) -> Result<u64> {
        let mut inner = self.inner.write();
        let before = inner.embeddings.len();
        inner.embeddings.retain(|(_, m), _| m == model);
        Ok((before - inner.embeddings.len()) as u64)
    }

    async fn put_checkpoint(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        entries: Vec<WindowEntry>,
    ) -> Result<Checkpoint> {
        let mut inner = self.inner.write();
        if inner.session_in_org(org_id, session_id).is_none() {
            return Err(MemoryError::SessionNotFound(session_id));
        }

        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            org_id,
            session_id,
            created_at: Utc::now(),
            message_count: entries.len() as i32,
            entries,
        };
        let seq = inner.seq();
        inner.checkpoints.insert(checkpoint.id, (seq, checkpoint.clone()));
        Ok(checkpoint)
    }

    async fn get_checkpoint(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        checkpoint_id: Uuid,
    ) -> Result<Checkpoint> {
        self.inner
            .read()
            .checkpoints
            .get(&checkpoint_id)
            .map(|(_, c)| c)
            .filter(|c| c.org_id == org_id && c.session_id == session_id)
            .cloned()
            .ok_or(MemoryError::CheckpointNotFound {
                session_id,
                checkpoint_id,
            })
    }

    async fn list_checkpoints(&self, org_id: Uuid, session_id: Uuid) -> Result<Vec<Checkpoint>> {
        let inner = self.inner.read();
        if inner.session_in_org(org_id, session_id).is_none() {
            return Err(MemoryError::SessionNotFound(session_id));
        }
        let mut rows: Vec<&(u64, Checkpoint)> = inner
            .checkpoints
            .values()
            .filter(|(_, c)| c.org_id == org_id && c.session_id == session_id)
            .collect();
        rows.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at).then(b.0.cmp(&a.0)));
        Ok(rows.into_iter().map(|(_, c)| c.clone()).collect())
    }

    async fn delete_episode(&self, org_id: Uuid, episode_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write();
        let owned = inner
            .episodes
            .get(&episode_id)
            .map(|(_, e)| e.org_id == org_id)
            .unwrap_or(false);
        if !owned {
            return Err(MemoryError::not_found("episode", episode_id));
        }
        inner.remove_episode(episode_id);
        Ok(())
    }

    async fn delete_session(&self, org_id: Uuid, session_id: Uuid) -> Result<SessionDeletion> {
        let mut inner = self.inner.write();
        if inner.session_in_org(org_id, session_id).is_none() {
            return Err(MemoryError::SessionNotFound(session_id));
        }
        Ok(inner.cascade_session(session_id))
    }

    async fn delete_all_for_user(&self, org_id: Uuid, user_id: Uuid) -> Result<UserDeletion> {
        let mut inner = self.inner.write();

        let sessions: Vec<Uuid> = inner
            .sessions
            .values()
            .filter(|(_, s)| s.org_id == org_id && s.user_id == Some(user_id))
            .map(|(_, s)| s.id)
            .collect();

        let mut deletion = UserDeletion::default();
        for session_id in &sessions {
            let counts = inner.cascade_session(*session_id);
            deletion.episodes += counts.episodes;
            deletion.checkpoints += counts.checkpoints;
        }

        let owned: Vec<Uuid> = inner
            .episodes
            .values()
            .filter(|(_, e)| e.org_id == org_id && e.user_id == Some(user_id))
            .map(|(_, e)| e.id)
            .collect();
        for id in &owned {
            inner.remove_episode(*id);
        }
        deletion.episodes += owned.len() as u64;
        deletion.sessions = sessions;

        Ok(deletion)
    }

    async fn health(&self) -> Result<String> {
        Ok("in-memory".to_string())
    }
}
