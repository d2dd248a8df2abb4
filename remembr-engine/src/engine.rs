//! `MemoryEngine`: the public façade.
//!
//! Every operation takes the caller's resolved [`TenancyContext`]. Org
//! scoping is enforced by the store on every call; session-level ownership
//! (see [`TenancyContext::can_access`]) is checked here, and failures are
//! reported as not found.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use remembr_core::config::{EmbedOnStore, RetrievalConfig, ShortTermConfig};
use remembr_core::tokens::count_tokens;
use remembr_core::{
    Checkpoint, EmbeddingProvider, Episode, EpisodeFilters, HttpEmbeddingClient, MemoryError,
    NewEpisode, NewSession, RemembrConfig, Result, RetryPolicy, Session, TenancyContext,
    WindowEntry,
};
use serde::Serialize;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::store::{EpisodicStore, ModelRegistry, PgEpisodicStore};
use crate::subsystems::checkpoint::{CheckpointManager, RestoreOutcome};
use crate::subsystems::forget::{ForgetSessionOutcome, ForgetUserOutcome, ForgettingCoordinator};
use crate::subsystems::query::{self, MemoryQuery, MemoryQueryResult};
use crate::subsystems::reembed::{self, BackfillReport};
use crate::subsystems::retrieve::{HybridRetriever, SearchRequest, SearchResponse};
use crate::subsystems::window::{
    InMemoryWindowBackend, ShortTermWindow, WindowBackend, WindowUsage,
};

/// Page size used when replaying a whole session.
const REPLAY_PAGE: i64 = 500;

/// Most episodes returned by [`MemoryEngine::reconstruct_state_at`].
const SNAPSHOT_LIMIT: i64 = 10_000;

/// Input to [`MemoryEngine::store`].
#[derive(Debug, Clone, Default)]
pub struct StoreRequest {
    pub session_id: Option<Uuid>,
    pub role: String,
    pub content: String,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    /// Computed with the built-in counter when absent.
    pub token_count: Option<u32>,
}

impl StoreRequest {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            metadata: serde_json::json!({}),
            ..Default::default()
        }
    }

    pub fn in_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn tokens(mut self, token_count: u32) -> Self {
        self.token_count = Some(token_count);
        self
    }
}

#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub episode: Episode,
    /// Present when the episode was also appended to a session window.
    pub window_entry: Option<WindowEntry>,
    pub evicted: usize,
    pub auto_checkpoint: Option<Uuid>,
    /// Whether the embedding was written before returning.
    pub embedded: bool,
    /// Set when the episode is durable but the window append failed. The
    /// episode is not rolled back; the window simply lacks this turn.
    pub window_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub store: String,
    pub window_backend: String,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub dimensions: usize,
}

pub struct MemoryEngine {
    store: Arc<dyn EpisodicStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    window: Arc<ShortTermWindow>,
    checkpoints: CheckpointManager,
    retriever: HybridRetriever,
    forgetting: ForgettingCoordinator,
    store_mode: EmbedOnStore,
    background: TaskTracker,
    backfill_skips: tokio::sync::Mutex<HashSet<Uuid>>,
}

#[derive(Default)]
pub struct MemoryEngineBuilder {
    store: Option<Arc<dyn EpisodicStore>>,
    window_backend: Option<Arc<dyn WindowBackend>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    short_term: ShortTermConfig,
    retrieval: RetrievalConfig,
    store_mode: Option<EmbedOnStore>,
}

impl MemoryEngineBuilder {
    pub fn store(mut self, store: Arc<dyn EpisodicStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn window_backend(mut self, backend: Arc<dyn WindowBackend>) -> Self {
        self.window_backend = Some(backend);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn short_term(mut self, config: ShortTermConfig) -> Self {
        self.short_term = config;
        self
    }

    pub fn retrieval(mut self, config: RetrievalConfig) -> Self {
        self.retrieval = config;
        self
    }

    pub fn store_mode(mut self, mode: EmbedOnStore) -> Self {
        self.store_mode = Some(mode);
        self
    }

    /// The window backend defaults to the in-process fast tier. Fails when
    /// the short-term or retrieval config does not validate.
    pub fn build(self) -> Result<MemoryEngine> {
        self.short_term.validate()?;
        self.retrieval.validate()?;

        let store = self
            .store
            .ok_or_else(|| MemoryError::Backend("MemoryEngine requires an episodic store".to_string()))?;
        let embedder = self
            .embedder
            .ok_or_else(|| MemoryError::Backend("MemoryEngine requires an embedding provider".to_string()))?;
        let backend = self
            .window_backend
            .unwrap_or_else(|| Arc::new(InMemoryWindowBackend::new()) as Arc<dyn WindowBackend>);

        let window = Arc::new(ShortTermWindow::new(backend, &self.short_term));

        Ok(MemoryEngine {
            checkpoints: CheckpointManager::new(store.clone(), window.clone()),
            retriever: HybridRetriever::new(store.clone(), embedder.clone(), self.retrieval),
            forgetting: ForgettingCoordinator::new(store.clone(), window.clone()),
            store,
            embedder,
            window,
            store_mode: self.store_mode.unwrap_or(EmbedOnStore::Background),
            background: TaskTracker::new(),
            backfill_skips: tokio::sync::Mutex::new(HashSet::new()),
        })
    }
}

impl MemoryEngine {
    pub fn builder() -> MemoryEngineBuilder {
        MemoryEngineBuilder::default()
    }

    /// Postgres store, HTTP embedding provider and in-process fast tier, all
    /// from one config.
    pub fn from_config(config: &RemembrConfig, pool: PgPool) -> Result<Self> {
        let models = ModelRegistry::new(config.embedding.declared_models());
        let store = PgEpisodicStore::new(pool, models, RetryPolicy::from(&config.store));
        let embedder = HttpEmbeddingClient::from_config(&config.embedding)?;

        Self::builder()
            .store(Arc::new(store))
            .embedder(Arc::new(embedder))
            .short_term(config.short_term.clone())
            .retrieval(config.retrieval.clone())
            .store_mode(config.embedding.store_mode)
            .build()
    }

    pub fn episodic_store(&self) -> Arc<dyn EpisodicStore> {
        self.store.clone()
    }

    pub fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        self.embedder.clone()
    }

    pub fn short_term_window(&self) -> Arc<ShortTermWindow> {
        self.window.clone()
    }

    /// Session lookup with ownership applied.
    async fn authorize_session(&self, ctx: &TenancyContext, session_id: Uuid) -> Result<Session> {
        let session = self.store.get_session(ctx.org_id, session_id).await?;
        if !ctx.can_access(&session.scope()) {
            return Err(MemoryError::SessionNotFound(session_id));
        }
        Ok(session)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn create_session(
        &self,
        ctx: &TenancyContext,
        metadata: serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Session> {
        let session = self
            .store
            .create_session(
                ctx.org_id,
                NewSession {
                    scope: ctx.scope(),
                    metadata,
                    expires_at,
                },
            )
            .await?;
        tracing::info!(session_id = %session.id, org_id = %ctx.org_id, "Session created");
        Ok(session)
    }

    pub async fn get_session(&self, ctx: &TenancyContext, session_id: Uuid) -> Result<Session> {
        self.authorize_session(ctx, session_id).await
    }

    pub async fn update_session_metadata(
        &self,
        ctx: &TenancyContext,
        session_id: Uuid,
        metadata: serde_json::Value,
    ) -> Result<Session> {
        self.authorize_session(ctx, session_id).await?;
        self.store
            .update_session_metadata(ctx.org_id, session_id, metadata)
            .await
    }

    /// Newest first. Pagination counts only sessions the caller may access.
    pub async fn list_sessions(
        &self,
        ctx: &TenancyContext,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>> {
        self.store
            .list_sessions(ctx.org_id, &ctx.owner_constraint(), limit, offset)
            .await
    }

    // ------------------------------------------------------------------
    // Store / search
    // ------------------------------------------------------------------

    /// Persist an episode and, when it names a session, append it to that
    /// session's window. Both happen under the session lease so a concurrent
    /// forget cannot interleave.
    pub async fn store(&self, ctx: &TenancyContext, request: StoreRequest) -> Result<StoreOutcome> {
        let token_count = request
            .token_count
            .unwrap_or_else(|| count_tokens(&request.content));

        let lease = match request.session_id {
            Some(session_id) => {
                let lease = self.window.lease(session_id).await;
                self.authorize_session(ctx, session_id).await?;
                Some(lease)
            }
            None => None,
        };

        let episode = self
            .store
            .put_episode(
                ctx.org_id,
                NewEpisode {
                    scope: ctx.scope(),
                    session_id: request.session_id,
                    role: request.role.clone(),
                    content: request.content.clone(),
                    tags: request.tags,
                    metadata: request.metadata,
                    token_count: i32::try_from(token_count).unwrap_or(i32::MAX),
                },
            )
            .await?;

        let mut outcome = StoreOutcome {
            episode,
            window_entry: None,
            evicted: 0,
            auto_checkpoint: None,
            embedded: false,
            window_error: None,
        };

        if let Some(lease) = lease {
            let session_id = lease.session_id();
            let appended = self
                .window
                .append_locked(&lease, &request.role, &request.content, Some(token_count))
                .await;
            drop(lease);

            match appended {
                Ok(appended) => {
                    outcome.evicted = appended.evicted.len();
                    outcome.window_entry = Some(appended.entry);
                    if let Some(snapshot) = appended.checkpoint_snapshot {
                        self.auto_checkpoint(ctx, session_id, snapshot, appended.total_tokens, &mut outcome)
                            .await;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        episode_id = %outcome.episode.id,
                        session_id = %session_id,
                        error = %e,
                        "Episode stored but window append failed"
                    );
                    outcome.window_error = Some(e.to_string());
                }
            }
        }

        match self.store_mode {
            EmbedOnStore::Sync => {
                outcome.embedded = embed_episode(
                    self.store.as_ref(),
                    self.embedder.as_ref(),
                    &outcome.episode,
                )
                .await;
            }
            EmbedOnStore::Background => {
                let store = self.store.clone();
                let embedder = self.embedder.clone();
                let episode = outcome.episode.clone();
                self.background.spawn(async move {
                    embed_episode(store.as_ref(), embedder.as_ref(), &episode).await;
                });
            }
        }

        tracing::debug!(
            episode_id = %outcome.episode.id,
            org_id = %ctx.org_id,
            session_id = ?outcome.episode.session_id,
            token_count,
            "Episode stored"
        );
        Ok(outcome)
    }

    async fn auto_checkpoint(
        &self,
        ctx: &TenancyContext,
        session_id: Uuid,
        snapshot: Vec<WindowEntry>,
        total_tokens: u64,
        outcome: &mut StoreOutcome,
    ) {
        match self
            .checkpoints
            .persist_snapshot(ctx.org_id, session_id, snapshot)
            .await
        {
            Ok(checkpoint) => {
                tracing::info!(
                    session_id = %session_id,
                    checkpoint_id = %checkpoint.id,
                    total_tokens,
                    "Auto-checkpoint created"
                );
                outcome.auto_checkpoint = Some(checkpoint.id);
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Auto-checkpoint failed");
            }
        }
    }

    /// Ranked search. Results are limited to episodes the caller may access.
    pub async fn search(
        &self,
        ctx: &TenancyContext,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse> {
        if let Some(session_id) = request.session_id {
            self.authorize_session(ctx, session_id).await?;
        }

        self.retriever.search(ctx, request, cancel).await
    }

    /// Durable session history, newest first.
    pub async fn get_session_history(
        &self,
        ctx: &TenancyContext,
        session_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Episode>> {
        self.authorize_session(ctx, session_id).await?;
        self.store
            .get_episodes(ctx.org_id, session_id, limit, offset)
            .await
    }

    /// Both tiers in one request: the session window (when a session is
    /// named) and the episodic store, merged and cut to the limit.
    pub async fn query(
        &self,
        ctx: &TenancyContext,
        request: &MemoryQuery,
        cancel: &CancellationToken,
    ) -> Result<MemoryQueryResult> {
        let started = Instant::now();
        let search = &request.search;
        let limit = self.retriever.validate(search)? as usize;
        if let Some(session_id) = search.session_id {
            self.authorize_session(ctx, session_id).await?;
        }

        let short_term = async {
            match search.session_id {
                Some(session_id) if request.include_short_term => {
                    let entries = self.window.read(session_id).await?;
                    Ok::<_, MemoryError>(query::window_hits(search, entries))
                }
                _ => Ok(Vec::new()),
            }
        };
        let episodic = async {
            if request.include_episodic {
                self.retriever
                    .search(ctx, search, cancel)
                    .await
                    .map(|response| response.results)
            } else {
                Ok(Vec::new())
            }
        };
        let (short_term, episodes) = tokio::try_join!(short_term, episodic)?;

        let result = query::merge(search, short_term, episodes, limit, started);
        tracing::debug!(
            org_id = %ctx.org_id,
            short_term = result.short_term.len(),
            episodes = result.episodes.len(),
            query_time_ms = result.query_time_ms,
            "Memory query complete"
        );
        Ok(result)
    }

    /// The whole durable history of a session, oldest first. Runs under the
    /// session lease so a concurrent store cannot shift the pages.
    pub async fn replay_session(&self, ctx: &TenancyContext, session_id: Uuid) -> Result<Vec<Episode>> {
        let _lease = self.window.lease(session_id).await;
        self.authorize_session(ctx, session_id).await?;

        let mut history = Vec::new();
        loop {
            let page = self
                .store
                .get_episodes(ctx.org_id, session_id, REPLAY_PAGE, history.len() as i64)
                .await?;
            let done = (page.len() as i64) < REPLAY_PAGE;
            history.extend(page);
            if done {
                break;
            }
        }
        history.reverse();
        Ok(history)
    }

    /// Episodes the caller may access that existed at `at` (created at or
    /// before it), oldest first. At most the newest 10 000 are returned.
    pub async fn reconstruct_state_at(
        &self,
        ctx: &TenancyContext,
        at: DateTime<Utc>,
    ) -> Result<Vec<Episode>> {
        let filters = EpisodeFilters {
            owner: ctx.owner_constraint(),
            // the upper bound is exclusive; stored timestamps have microsecond precision
            to: Some(at.checked_add_signed(chrono::Duration::microseconds(1)).unwrap_or(at)),
            ..Default::default()
        };
        let mut episodes = self
            .store
            .list_episodes(ctx.org_id, &filters, SNAPSHOT_LIMIT)
            .await?;
        episodes.reverse();
        Ok(episodes)
    }

    // ------------------------------------------------------------------
    // Short-term window
    // ------------------------------------------------------------------

    pub async fn window(&self, ctx: &TenancyContext, session_id: Uuid) -> Result<Vec<WindowEntry>> {
        self.authorize_session(ctx, session_id).await?;
        self.window.read(session_id).await
    }

    pub async fn window_usage(&self, ctx: &TenancyContext, session_id: Uuid) -> Result<WindowUsage> {
        self.authorize_session(ctx, session_id).await?;
        self.window.usage(session_id).await
    }

    pub async fn set_window_ttl(
        &self,
        ctx: &TenancyContext,
        session_id: Uuid,
        ttl: Duration,
    ) -> Result<()> {
        self.authorize_session(ctx, session_id).await?;
        self.window.set_ttl(session_id, ttl).await
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    pub async fn checkpoint(&self, ctx: &TenancyContext, session_id: Uuid) -> Result<Checkpoint> {
        self.authorize_session(ctx, session_id).await?;
        self.checkpoints.checkpoint(ctx.org_id, session_id).await
    }

    pub async fn restore(
        &self,
        ctx: &TenancyContext,
        session_id: Uuid,
        checkpoint_id: Uuid,
    ) -> Result<RestoreOutcome> {
        self.authorize_session(ctx, session_id).await?;
        self.checkpoints
            .restore(ctx.org_id, session_id, checkpoint_id)
            .await
    }

    pub async fn list_checkpoints(
        &self,
        ctx: &TenancyContext,
        session_id: Uuid,
    ) -> Result<Vec<Checkpoint>> {
        self.authorize_session(ctx, session_id).await?;
        self.checkpoints.list(ctx.org_id, session_id).await
    }

    // ------------------------------------------------------------------
    // Forgetting
    // ------------------------------------------------------------------

    pub async fn forget_episode(&self, ctx: &TenancyContext, episode_id: Uuid) -> Result<()> {
        self.forgetting.forget_episode(ctx, episode_id).await
    }

    pub async fn forget_session(
        &self,
        ctx: &TenancyContext,
        session_id: Uuid,
    ) -> Result<ForgetSessionOutcome> {
        self.forgetting.forget_session(ctx, session_id).await
    }

    pub async fn forget_user(&self, ctx: &TenancyContext, user_id: Uuid) -> Result<ForgetUserOutcome> {
        self.forgetting.forget_user(ctx, user_id).await
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// One backfill batch. Episodes the provider rejected on an earlier call
    /// are not retried.
    pub async fn backfill_embeddings(&self, batch_size: usize) -> Result<BackfillReport> {
        let mut skipped = self.backfill_skips.lock().await;
        reembed::run_backfill_tick(
            self.store.as_ref(),
            self.embedder.as_ref(),
            batch_size,
            &mut skipped,
        )
        .await
    }

    /// Drop embeddings of models other than the active one.
    pub async fn prune_stale_embeddings(&self) -> Result<u64> {
        reembed::prune_stale_embeddings(self.store.as_ref(), self.embedder.model()).await
    }

    pub async fn health(&self) -> Result<HealthReport> {
        Ok(HealthReport {
            store: self.store.health().await?,
            window_backend: self.window.backend_name().to_string(),
            embedding_provider: self.embedder.name().to_string(),
            embedding_model: self.embedder.model().to_string(),
            dimensions: self.embedder.dimensions(),
        })
    }

    /// Wait for in-flight background embeddings to finish.
    pub async fn shutdown(&self) {
        self.background.close();
        self.background.wait().await;
        tracing::info!("Memory engine shut down");
    }
}

/// Embed one episode and store the vector. Failures are logged and left for
/// the backfill worker.
async fn embed_episode(
    store: &dyn EpisodicStore,
    embedder: &dyn EmbeddingProvider,
    episode: &Episode,
) -> bool {
    let vector = match embedder.embed(&episode.content).await {
        Ok(vector) => vector,
        Err(e) => {
            tracing::warn!(episode_id = %episode.id, error = %e, "Embedding failed; left for backfill");
            return false;
        }
    };

    match store
        .put_embedding(episode.org_id, episode.id, vector, embedder.model())
        .await
    {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(episode_id = %episode.id, error = %e, "Failed to store embedding; left for backfill");
            false
        }
    }
}
