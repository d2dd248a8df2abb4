//! Postgres + pgvector episodic store.
//!
//! Every statement carries the caller's `org_id` predicate. Cascading
//! deletes run in a single transaction and each call is wrapped in a
//! bounded retry for transient connection failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use remembr_core::db;
use remembr_core::{
    with_retry, Checkpoint, Episode, EpisodeFilters, MemoryError, NewEpisode, NewSession,
    OwnerConstraint, Result, RetryPolicy, ScoredEpisode, Session, WindowEntry,
};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    ensure_org, EpisodicStore, ModelRegistry, PendingEmbedding, SessionDeletion, UserDeletion,
};

const EPISODE_COLUMNS: &str = "e.id, e.org_id, e.team_id, e.user_id, e.agent_id, e.session_id, \
     e.role, e.content, e.tags, e.metadata, e.token_count, e.created_at";

#[derive(sqlx::FromRow)]
struct ScoredRow {
    #[sqlx(flatten)]
    episode: Episode,
    distance: f64,
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    id: Uuid,
    org_id: Uuid,
    session_id: Uuid,
    entries: Json<Vec<WindowEntry>>,
    message_count: i32,
    created_at: DateTime<Utc>,
}

impl From<CheckpointRow> for Checkpoint {
    fn from(row: CheckpointRow) -> Self {
        Checkpoint {
            id: row.id,
            org_id: row.org_id,
            session_id: row.session_id,
            created_at: row.created_at,
            entries: row.entries.0,
            message_count: row.message_count,
        }
    }
}

pub struct PgEpisodicStore {
    pool: PgPool,
    models: ModelRegistry,
    retry: RetryPolicy,
}

impl PgEpisodicStore {
    pub fn new(pool: PgPool, models: ModelRegistry, retry: RetryPolicy) -> Self {
        Self {
            pool,
            models,
            retry,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn require_session(&self, org_id: Uuid, session_id: Uuid) -> Result<()> {
        self.get_session(org_id, session_id).await.map(|_| ())
    }
}

/// Ownership predicate over the columns of `alias`, binding the team, user
/// and agent constraints at `$first`, `$first + 1` and `$first + 2`.
fn owner_predicate(alias: &str, first: usize) -> String {
    format!(
        "(${t}::uuid IS NULL OR {a}.team_id IS NULL OR {a}.team_id = ${t}) \
         AND (${u}::uuid IS NULL OR {a}.user_id IS NULL OR {a}.user_id = ${u}) \
         AND (${g}::uuid IS NULL OR {a}.agent_id IS NULL OR {a}.agent_id = ${g})",
        a = alias,
        t = first,
        u = first + 1,
        g = first + 2,
    )
}

/// Empty tag lists mean "no tag filter", matching [`EpisodeFilters::matches`].
fn tag_filter(filters: &EpisodeFilters) -> Option<Vec<String>> {
    filters.tags.clone().filter(|t| !t.is_empty())
}

#[async_trait]
impl EpisodicStore for PgEpisodicStore {
    async fn create_session(&self, org_id: Uuid, session: NewSession) -> Result<Session> {
        if session.scope.org_id != org_id {
            return Err(MemoryError::ScopeViolation {
                expected_org: org_id,
                actual_org: session.scope.org_id,
            });
        }

        let pool = &self.pool;
        let id = Uuid::new_v4();
        with_retry(&self.retry, "create_session", || {
            let session = session.clone();
            async move {
                let row = sqlx::query_as::<_, Session>(
                    r#"
                    INSERT INTO sessions (id, org_id, team_id, user_id, agent_id, metadata, expires_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id
                    RETURNING id, org_id, team_id, user_id, agent_id, metadata, created_at, expires_at
                    "#,
                )
                .bind(id)
                .bind(org_id)
                .bind(session.scope.team_id)
                .bind(session.scope.user_id)
                .bind(session.scope.agent_id)
                .bind(&session.metadata)
                .bind(session.expires_at)
                .fetch_one(pool)
                .await?;
                Ok::<_, MemoryError>(row)
            }
        })
        .await
    }

    async fn get_session(&self, org_id: Uuid, session_id: Uuid) -> Result<Session> {
        let pool = &self.pool;
        let row = with_retry(&self.retry, "get_session", || async move {
            let row = sqlx::query_as::<_, Session>(
                r#"
                SELECT id, org_id, team_id, user_id, agent_id, metadata, created_at, expires_at
                FROM sessions
                WHERE id = $1 AND org_id = $2
                "#,
            )
            .bind(session_id)
            .bind(org_id)
            .fetch_optional(pool)
            .await?;
            Ok::<_, MemoryError>(row)
        })
        .await?;

        row.ok_or(MemoryError::SessionNotFound(session_id))
    }

    async fn update_session_metadata(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        metadata: serde_json::Value,
    ) -> Result<Session> {
        let pool = &self.pool;
        let metadata = &metadata;
        let row = with_retry(&self.retry, "update_session_metadata", || async move {
            let row = sqlx::query_as::<_, Session>(
                r#"
                UPDATE sessions SET metadata = $3
                WHERE id = $1 AND org_id = $2
                RETURNING id, org_id, team_id, user_id, agent_id, metadata, created_at, expires_at
                "#,
            )
            .bind(session_id)
            .bind(org_id)
            .bind(metadata)
            .fetch_optional(pool)
            .await?;
            Ok::<_, MemoryError>(row)
        })
        .await?;

        row.ok_or(MemoryError::SessionNotFound(session_id))
    }

    async fn list_sessions(
        &self,
        org_id: Uuid,
        owner: &OwnerConstraint,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>> {
        let pool = &self.pool;
        let sql = format!(
            "SELECT s.id, s.org_id, s.team_id, s.user_id, s.agent_id, s.metadata, s.created_at, s.expires_at \
             FROM sessions s \
             WHERE s.org_id = $1 AND {} \
             ORDER BY s.created_at DESC, s.id \
             LIMIT $5 OFFSET $6",
            owner_predicate("s", 2)
        );
        let sql = sql.as_str();
        with_retry(&self.retry, "list_sessions", || async move {
            let rows = sqlx::query_as::<_, Session>(sql)
                .bind(org_id)
                .bind(owner.team_id)
                .bind(owner.user_id)
                .bind(owner.agent_id)
                .bind(limit.max(0))
                .bind(offset.max(0))
                .fetch_all(pool)
                .await?;
            Ok::<_, MemoryError>(rows)
        })
        .await
    }

    async fn list_user_sessions(&self, org_id: Uuid, user_id: Uuid) -> Result<Vec<Uuid>> {
        let pool = &self.pool;
        with_retry(&self.retry, "list_user_sessions", || async move {
            let rows: Vec<(Uuid,)> = sqlx::query_as(
                "SELECT id FROM sessions WHERE org_id = $1 AND user_id = $2 ORDER BY created_at",
            )
            .bind(org_id)
            .bind(user_id)
            .fetch_all(pool)
            .await?;
            Ok::<_, MemoryError>(rows.into_iter().map(|(id,)| id).collect())
        })
        .await
    }

    async fn put_episode(&self, org_id: Uuid, episode: NewEpisode) -> Result<Episode> {
        ensure_org(org_id, &episode)?;

        let pool = &self.pool;
        let id = Uuid::new_v4();
        let episode = &episode;
        // The session guard makes a cross-org or missing session a no-op insert.
        let row = with_retry(&self.retry, "put_episode", || async move {
            let row = sqlx::query_as::<_, Episode>(
                r#"
                INSERT INTO episodes
                    (id, org_id, team_id, user_id, agent_id, session_id, role, content, tags, metadata, token_count)
                SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11
                WHERE $6::uuid IS NULL
                   OR EXISTS (SELECT 1 FROM sessions WHERE id = $6 AND org_id = $2)
                ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id
                RETURNING id, org_id, team_id, user_id, agent_id, session_id,
                          role, content, tags, metadata, token_count, created_at
                "#,
            )
            .bind(id)
            .bind(org_id)
            .bind(episode.scope.team_id)
            .bind(episode.scope.user_id)
            .bind(episode.scope.agent_id)
            .bind(episode.session_id)
            .bind(&episode.role)
            .bind(&episode.content)
            .bind(&episode.tags)
            .bind(&episode.metadata)
            .bind(episode.token_count)
            .fetch_optional(pool)
            .await?;
            Ok::<_, MemoryError>(row)
        })
        .await?;

        match (row, episode.session_id) {
            (Some(row), _) => Ok(row),
            (None, Some(session_id)) => Err(MemoryError::SessionNotFound(session_id)),
            (None, None) => Err(MemoryError::Backend(
                "episode insert returned no row".to_string(),
            )),
        }
    }

    async fn get_episode(&self, org_id: Uuid, episode_id: Uuid) -> Result<Episode> {
        let pool = &self.pool;
        let sql = format!(
            "SELECT {} FROM episodes e WHERE e.id = $1 AND e.org_id = $2",
            EPISODE_COLUMNS
        );
        let sql = sql.as_str();
        let row = with_retry(&self.retry, "get_episode", || async move {
            let row = sqlx::query_as::<_, Episode>(sql)
                .bind(episode_id)
                .bind(org_id)
                .fetch_optional(pool)
                .await?;
            Ok::<_, MemoryError>(row)
        })
        .await?;

        row.ok_or_else(|| MemoryError::not_found("episode", episode_id))
    }

    async fn get_episodes(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Episode>> {
        self.require_session(org_id, session_id).await?;

        let pool = &self.pool;
        let sql = format!(
            "SELECT {} FROM episodes e \
             WHERE e.org_id = $1 AND e.session_id = $2 \
             ORDER BY e.created_at DESC, e.id \
             LIMIT $3 OFFSET $4",
            EPISODE_COLUMNS
        );
        let sql = sql.as_str();
        with_retry(&self.retry, "get_episodes", || async move {
            let rows = sqlx::query_as::<_, Episode>(sql)
                .bind(org_id)
                .bind(session_id)
                .bind(limit.max(0))
                .bind(offset.max(0))
                .fetch_all(pool)
                .await?;
            Ok::<_, MemoryError>(rows)
        })
        .await
    }

    async fn list_episodes(
        &self,
        org_id: Uuid,
        filters: &EpisodeFilters,
        limit: i64,
    ) -> Result<Vec<Episode>> {
        let pool = &self.pool;
        let tags = tag_filter(filters);
        let tags = &tags;
        let sql = format!(
            "SELECT {} FROM episodes e \
             WHERE e.org_id = $1 \
               AND ($2::uuid IS NULL OR e.session_id = $2) \
               AND ($3::text IS NULL OR e.role = $3) \
               AND ($4::text[] IS NULL OR e.tags && $4) \
               AND ($5::timestamptz IS NULL OR e.created_at >= $5) \
               AND ($6::timestamptz IS NULL OR e.created_at < $6) \
               AND {} \
             ORDER BY e.created_at DESC, e.id \
             LIMIT $10",
            EPISODE_COLUMNS,
            owner_predicate("e", 7)
        );
        let sql = sql.as_str();
        with_retry(&self.retry, "list_episodes", || async move {
            let rows = sqlx::query_as::<_, Episode>(sql)
                .bind(org_id)
                .bind(filters.session_id)
                .bind(filters.role.as_deref())
                .bind(tags.as_deref())
                .bind(filters.from)
                .bind(filters.to)
                .bind(filters.owner.team_id)
                .bind(filters.owner.user_id)
                .bind(filters.owner.agent_id)
                .bind(limit.max(0))
                .fetch_all(pool)
                .await?;
            Ok::<_, MemoryError>(rows)
        })
        .await
    }

    async fn put_embedding(
        &self,
        org_id: Uuid,
        episode_id: Uuid,
        vector: Vec<f32>,
        model: &str,
    ) -> Result<()> {
        let dimensions = self.models.check(model, vector.len())? as i32;

        let pool = &self.pool;
        let vector = Vector::from(vector);
        let vector = &vector;
        let affected = with_retry(&self.retry, "put_embedding", || async move {
            let result = sqlx::query(
                r#"
                INSERT INTO embeddings (episode_id, org_id, model, dimensions, vector)
                SELECT id, org_id, $3, $4, $5
                FROM episodes
                WHERE id = $1 AND org_id = $2
                ON CONFLICT (episode_id, model) DO UPDATE
                SET vector = EXCLUDED.vector,
                    dimensions = EXCLUDED.dimensions,
                    created_at = now()
                "#,
            )
            .bind(episode_id)
            .bind(org_id)
            .bind(model)
            .bind(dimensions)
            .bind(vector)
            .execute(pool)
            .await?;
            Ok::<_, MemoryError>(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            return Err(MemoryError::not_found("episode", episode_id));
        }
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
        let dimensions = self.models.check(model, query.len())?;

        let pool = &self.pool;
        let vector = Vector::from(query.to_vec());
        let vector = &vector;
        let tags = tag_filter(filters);
        let tags = &tags;
        // Order by the indexed expression alone and name the model as a
        // literal, so the model's partial HNSW index matches.
        let distance = format!(
            "{} <=> $1::vector({})",
            db::vector_expression("emb.vector", dimensions),
            dimensions
        );
        let sql = format!(
            "SELECT {columns}, ({distance}) AS distance \
             FROM embeddings emb \
             JOIN episodes e ON e.id = emb.episode_id \
             WHERE emb.org_id = $2 AND e.org_id = $2 AND emb.model = {model} \
               AND ($3::uuid IS NULL OR e.session_id = $3) \
               AND ($4::text IS NULL OR e.role = $4) \
               AND ($5::text[] IS NULL OR e.tags && $5) \
               AND ($6::timestamptz IS NULL OR e.created_at >= $6) \
               AND ($7::timestamptz IS NULL OR e.created_at < $7) \
               AND {owner} \
             ORDER BY {distance} \
             LIMIT $11",
            columns = EPISODE_COLUMNS,
            distance = distance,
            model = db::quote_literal(model),
            owner = owner_predicate("e", 8),
        );
        let sql = sql.as_str();

        let rows = with_retry(&self.retry, "vector_search", || async move {
            let rows = sqlx::query_as::<_, ScoredRow>(sql)
                .bind(vector)
                .bind(org_id)
                .bind(filters.session_id)
                .bind(filters.role.as_deref())
                .bind(tags.as_deref())
                .bind(filters.from)
                .bind(filters.to)
                .bind(filters.owner.team_id)
                .bind(filters.owner.user_id)
                .bind(filters.owner.agent_id)
                .bind(limit.max(0))
                .fetch_all(pool)
                .await?;
            Ok::<_, MemoryError>(rows)
        })
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ScoredEpisode {
                episode: row.episode,
                distance: row.distance,
            })
            .collect())
    }

    async fn episodes_missing_embedding(
        &self,
        model: &str,
        limit: i64,
        exclude: &[Uuid],
    ) -> Result<Vec<PendingEmbedding>> {
        let pool = &self.pool;
        with_retry(&self.retry, "episodes_missing_embedding", || async move {
            let rows: Vec<(Uuid, Uuid, String)> = sqlx::query_as(
                r#"
                SELECT e.org_id, e.id, e.content
                FROM episodes e
                WHERE NOT EXISTS (
                    SELECT 1 FROM embeddings emb
                    WHERE emb.episode_id = e.id AND emb.model = $1
                )
                AND NOT (e.id = ANY($3))
                ORDER BY e.created_at
                LIMIT $2
                "#,
            )
            .bind(model)
            .bind(limit.max(0))
            .bind(exclude)
            .fetch_all(pool)
            .await?;

            Ok::<_, MemoryError>(rows
                .into_iter()
                .map(|(org_id, episode_id, content)| PendingEmbedding {
                    org_id,
                    episode_id,
                    content,
                })
                .collect())
        })
        .await
    }

    async fn delete_embeddings_except(&self, model: &str) -> Result<u64> {
        let pool = &self.pool;
        with_retry(&self.retry, "delete_embeddings_except", || async move {
            let result = sqlx::query("DELETE FROM embeddings WHERE model <> $1")
                .bind(model)
                .execute(pool)
                .await?;
            Ok::<_, MemoryError>(result.rows_affected())
        })
        .await
    }

    async fn put_checkpoint(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        entries: Vec<WindowEntry>,
    ) -> Result<Checkpoint> {
        let pool = &self.pool;
        let id = Uuid::new_v4();
        let message_count = entries.len() as i32;
        let entries = Json(entries);
        let entries = &entries;
        let row = with_retry(&self.retry, "put_checkpoint", || async move {
            let row = sqlx::query_as::<_, CheckpointRow>(
                r#"
                INSERT INTO checkpoints (id, org_id, session_id, entries, message_count)
                SELECT $1, $2, $3, $4, $5
                WHERE EXISTS (SELECT 1 FROM sessions WHERE id = $3 AND org_id = $2)
                ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id
                RETURNING id, org_id, session_id, entries, message_count, created_at
                "#,
            )
            .bind(id)
            .bind(org_id)
            .bind(session_id)
            .bind(entries)
            .bind(message_count)
            .fetch_optional(pool)
            .await?;
            Ok::<_, MemoryError>(row)
        })
        .await?;

        row.map(Checkpoint::from)
            .ok_or(MemoryError::SessionNotFound(session_id))
    }

    async fn get_checkpoint(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        checkpoint_id: Uuid,
    ) -> Result<Checkpoint> {
        let pool = &self.pool;
        let row = with_retry(&self.retry, "get_checkpoint", || async move {
            let row = sqlx::query_as::<_, CheckpointRow>(
                r#"
                SELECT id, org_id, session_id, entries, message_count, created_at
                FROM checkpoints
                WHERE id = $1 AND session_id = $2 AND org_id = $3
                "#,
            )
            .bind(checkpoint_id)
            .bind(session_id)
            .bind(org_id)
            .fetch_optional(pool)
            .await?;
            Ok::<_, MemoryError>(row)
        })
        .await?;

        row.map(Checkpoint::from)
            .ok_or(MemoryError::CheckpointNotFound {
                session_id,
                checkpoint_id,
            })
    }

    async fn list_checkpoints(&self, org_id: Uuid, session_id: Uuid) -> Result<Vec<Checkpoint>> {
        self.require_session(org_id, session_id).await?;

        let pool = &self.pool;
        let rows = with_retry(&self.retry, "list_checkpoints", || async move {
            let rows = sqlx::query_as::<_, CheckpointRow>(
                r#"
                SELECT id, org_id, session_id, entries, message_count, created_at
                FROM checkpoints
                WHERE session_id = $1 AND org_id = $2
                ORDER BY created_at DESC
                "#,
            )
            .bind(session_id)
            .bind(org_id)
            .fetch_all(pool)
            .await?;
            Ok::<_, MemoryError>(rows)
        })
        .await?;

        Ok(rows.into_iter().map(Checkpoint::from).collect())
    }

    async fn delete_episode(&self, org_id: Uuid, episode_id: Uuid) -> Result<()> {
        let pool = &self.pool;
        // embeddings go with the episode via ON DELETE CASCADE
        let affected = with_retry(&self.retry, "delete_episode", || async move {
            let result = sqlx::query("DELETE FROM episodes WHERE id = $1 AND org_id = $2")
                .bind(episode_id)
                .bind(org_id)
                .execute(pool)
                .await?;
            Ok::<_, MemoryError>(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            return Err(MemoryError::not_found("episode", episode_id));
        }
        Ok(())
    }

    async fn delete_session(&self, org_id: Uuid, session_id: Uuid) -> Result<SessionDeletion> {
        let pool = &self.pool;
        let deletion = with_retry(&self.retry, "delete_session", || async move {
            let mut tx = pool.begin().await?;

            let exists: Option<(Uuid,)> = sqlx::query_as(
                "SELECT id FROM sessions WHERE id = $1 AND org_id = $2 FOR UPDATE",
            )
            .bind(session_id)
            .bind(org_id)
            .fetch_optional(&mut *tx)
            .await?;
            if exists.is_none() {
                return Ok::<_, MemoryError>(None);
            }

            let episodes = sqlx::query("DELETE FROM episodes WHERE session_id = $1 AND org_id = $2")
                .bind(session_id)
                .bind(org_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            let checkpoints =
                sqlx::query("DELETE FROM checkpoints WHERE session_id = $1 AND org_id = $2")
                    .bind(session_id)
                    .bind(org_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();

            sqlx::query("DELETE FROM sessions WHERE id = $1 AND org_id = $2")
                .bind(session_id)
                .bind(org_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<_, MemoryError>(Some(SessionDeletion {
                episodes,
                checkpoints,
            }))
        })
        .await?;

        deletion.ok_or(MemoryError::SessionNotFound(session_id))
    }

    async fn delete_all_for_user(&self, org_id: Uuid, user_id: Uuid) -> Result<UserDeletion> {
        let pool = &self.pool;
        with_retry(&self.retry, "delete_all_for_user", || async move {
            let mut tx = pool.begin().await?;

            let sessions: Vec<(Uuid,)> = sqlx::query_as(
                "SELECT id FROM sessions WHERE org_id = $1 AND user_id = $2 FOR UPDATE",
            )
            .bind(org_id)
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await?;
            let sessions: Vec<Uuid> = sessions.into_iter().map(|(id,)| id).collect();

            let episodes = sqlx::query(
                r#"
                DELETE FROM episodes
                WHERE org_id = $1 AND (user_id = $2 OR session_id = ANY($3))
                "#,
            )
            .bind(org_id)
            .bind(user_id)
            .bind(&sessions)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            let checkpoints =
                sqlx::query("DELETE FROM checkpoints WHERE org_id = $1 AND session_id = ANY($2)")
                    .bind(org_id)
                    .bind(&sessions)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();

            sqlx::query("DELETE FROM sessions WHERE org_id = $1 AND id = ANY($2)")
                .bind(org_id)
                .bind(&sessions)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<_, MemoryError>(UserDeletion {
                sessions,
                episodes,
                checkpoints,
            })
        })
        .await
    }

    async fn health(&self) -> Result<String> {
        let version = db::health_check(&self.pool).await?;
        let pgvector = db::check_pgvector(&self.pool).await?;
        Ok(format!("{} (pgvector {})", version, pgvector))
    }
}
