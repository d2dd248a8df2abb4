//! Forgetting Coordinator: scoped, cascading, irreversible deletion.
//!
//! Session forgets run under the session lease: the store cascade (one
//! transaction) first, then the short-term window. A window failure after
//! the store cascade committed is surfaced as `PartialDeletionFailure` and
//! remembered, so a retry of the same forget finishes the job even though
//! the session row is already gone.
//!
//! Every forget emits audit events on the `remembr::audit` target.

use std::sync::Arc;

use dashmap::DashMap;
use remembr_core::{
    AuthorityLevel, DeletionStage, MemoryError, Result, TenancyContext,
};
use serde::Serialize;
use uuid::Uuid;

use crate::store::EpisodicStore;
use crate::subsystems::window::{SessionLease, ShortTermWindow};

pub const AUDIT_TARGET: &str = "remembr::audit";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForgetSessionOutcome {
    pub session_id: Uuid,
    pub deleted_episodes: u64,
    pub deleted_checkpoints: u64,
    pub session_deleted: bool,
    pub window_cleared: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForgetUserOutcome {
    pub user_id: Uuid,
    pub deleted_sessions: usize,
    pub deleted_episodes: u64,
    pub deleted_checkpoints: u64,
}

pub struct ForgettingCoordinator {
    store: Arc<dyn EpisodicStore>,
    window: Arc<ShortTermWindow>,
    /// session -> org for windows whose clear failed after the store cascade.
    pending_window_clears: DashMap<Uuid, Uuid>,
}

fn audit_attempt(action: &str, target_type: &str, target_id: Uuid, ctx: &TenancyContext) {
    tracing::info!(
        target: AUDIT_TARGET,
        action,
        status = "attempt",
        target_type,
        target_id = %target_id,
        org_id = %ctx.org_id,
        actor_user_id = ?ctx.user_id,
        "Forget requested"
    );
}

fn audit_failed(action: &str, target_type: &str, target_id: Uuid, ctx: &TenancyContext, error: &MemoryError) {
    tracing::warn!(
        target: AUDIT_TARGET,
        action,
        status = "failed",
        target_type,
        target_id = %target_id,
        org_id = %ctx.org_id,
        actor_user_id = ?ctx.user_id,
        error = %error,
        "Forget failed"
    );
}

impl ForgettingCoordinator {
    pub fn new(store: Arc<dyn EpisodicStore>, window: Arc<ShortTermWindow>) -> Self {
        Self {
            store,
            window,
            pending_window_clears: DashMap::new(),
        }
    }

    /// Deletes one episode and its embeddings. A second call reports
    /// `NotFound`, as does an episode outside the caller's reach.
    pub async fn forget_episode(&self, ctx: &TenancyContext, episode_id: Uuid) -> Result<()> {
        audit_attempt("forget_episode", "episode", episode_id, ctx);

        let result = async {
            let episode = self.store.get_episode(ctx.org_id, episode_id).await?;
            if !ctx.can_access(&episode.scope()) {
                return Err(MemoryError::not_found("episode", episode_id));
            }
            self.store.delete_episode(ctx.org_id, episode_id).await
        }
        .await;

        match &result {
            Ok(()) => tracing::info!(
                target: AUDIT_TARGET,
                action = "forget_episode",
                status = "success",
                target_type = "episode",
                target_id = %episode_id,
                org_id = %ctx.org_id,
                actor_user_id = ?ctx.user_id,
                deleted_episodes = 1u64,
                "Episode forgotten"
            ),
            Err(e) => audit_failed("forget_episode", "episode", episode_id, ctx, e),
        }
        result
    }

    /// Deletes the session's episodes and checkpoints, the session, then its
    /// window. Forgetting an absent session reports zero deletions.
    pub async fn forget_session(
        &self,
        ctx: &TenancyContext,
        session_id: Uuid,
    ) -> Result<ForgetSessionOutcome> {
        audit_attempt("forget_session", "session", session_id, ctx);

        let result = async {
            let lease = self.window.lease(session_id).await;
            match self.store.get_session(ctx.org_id, session_id).await {
                Ok(session) if !ctx.can_access(&session.scope()) => {
                    return Err(MemoryError::SessionNotFound(session_id));
                }
                Ok(_) => {}
                Err(MemoryError::SessionNotFound(_)) => {
                    return self.retry_pending_clear(&lease, ctx.org_id).await;
                }
                Err(e) => return Err(e),
            }
            self.cascade_locked(&lease, ctx.org_id).await
        }
        .await;

        match &result {
            Ok(outcome) => tracing::info!(
                target: AUDIT_TARGET,
                action = "forget_session",
                status = "success",
                target_type = "session",
                target_id = %session_id,
                org_id = %ctx.org_id,
                actor_user_id = ?ctx.user_id,
                deleted_episodes = outcome.deleted_episodes,
                deleted_checkpoints = outcome.deleted_checkpoints,
                "Session forgotten"
            ),
            Err(e) => audit_failed("forget_session", "session", session_id, ctx, e),
        }
        result
    }

    /// Requires org authority, checked before anything is deleted. Cascades
    /// every session the user owns, then removes the user's remaining
    /// episodes and any sessions created meanwhile in one transaction.
    pub async fn forget_user(&self, ctx: &TenancyContext, user_id: Uuid) -> Result<ForgetUserOutcome> {
        audit_attempt("forget_user", "user", user_id, ctx);

        if let Err(e) = ctx.require(AuthorityLevel::Org) {
            audit_failed("forget_user", "user", user_id, ctx, &e);
            return Err(e);
        }

        let result = self.forget_user_inner(ctx.org_id, user_id).await;

        match &result {
            Ok(outcome) => tracing::info!(
                target: AUDIT_TARGET,
                action = "forget_user",
                status = "success",
                target_type = "user",
                target_id = %user_id,
                org_id = %ctx.org_id,
                actor_user_id = ?ctx.user_id,
                deleted_sessions = outcome.deleted_sessions,
                deleted_episodes = outcome.deleted_episodes,
                deleted_checkpoints = outcome.deleted_checkpoints,
                "User forgotten"
            ),
            Err(e) => audit_failed("forget_user", "user", user_id, ctx, e),
        }
        result
    }

    async fn forget_user_inner(&self, org_id: Uuid, user_id: Uuid) -> Result<ForgetUserOutcome> {
        let mut outcome = ForgetUserOutcome {
            user_id,
            ..Default::default()
        };
        let partial = |stage: DeletionStage, completed: usize, e: MemoryError| {
            MemoryError::PartialDeletionFailure {
                target: user_id,
                stage,
                completed,
                reason: e.to_string(),
            }
        };

        let sessions = self.store.list_user_sessions(org_id, user_id).await?;

        for (done, session_id) in sessions.iter().enumerate() {
            let lease = self.window.lease(*session_id).await;
            match self.cascade_locked(&lease, org_id).await {
                Ok(counts) => {
                    if counts.session_deleted {
                        outcome.deleted_sessions += 1;
                    }
                    outcome.deleted_episodes += counts.deleted_episodes;
                    outcome.deleted_checkpoints += counts.deleted_checkpoints;
                }
                Err(MemoryError::PartialDeletionFailure { stage, reason, .. }) => {
                    return Err(MemoryError::PartialDeletionFailure {
                        target: user_id,
                        stage,
                        completed: done,
                        reason,
                    });
                }
                Err(e) => return Err(partial(DeletionStage::EpisodicStore, done, e)),
            }
        }

        let remainder = self
            .store
            .delete_all_for_user(org_id, user_id)
            .await
            .map_err(|e| partial(DeletionStage::UserEpisodes, sessions.len(), e))?;

        outcome.deleted_sessions += remainder.sessions.len();
        outcome.deleted_episodes += remainder.episodes;
        outcome.deleted_checkpoints += remainder.checkpoints;

        for session_id in remainder.sessions {
            let lease = self.window.lease(session_id).await;
            if let Err(e) = self.window.delete_locked(&lease).await {
                self.pending_window_clears.insert(session_id, org_id);
                return Err(partial(DeletionStage::ShortTermWindow, sessions.len() + 1, e));
            }
        }

        Ok(outcome)
    }

    /// Store cascade then window clear, under an already-held lease.
    async fn cascade_locked(&self, lease: &SessionLease, org_id: Uuid) -> Result<ForgetSessionOutcome> {
        let session_id = lease.session_id();

        let deletion = match self.store.delete_session(org_id, session_id).await {
            Ok(deletion) => Some(deletion),
            // removed concurrently, e.g. by a user-wide cascade
            Err(MemoryError::SessionNotFound(_)) => None,
            Err(e) => {
                return Err(MemoryError::PartialDeletionFailure {
                    target: session_id,
                    stage: DeletionStage::EpisodicStore,
                    completed: 0,
                    reason: e.to_string(),
                })
            }
        };

        let mut outcome = ForgetSessionOutcome {
            session_id,
            session_deleted: deletion.is_some(),
            ..Default::default()
        };
        if let Some(deletion) = deletion {
            outcome.deleted_episodes = deletion.episodes;
            outcome.deleted_checkpoints = deletion.checkpoints;
        }

        if let Err(e) = self.window.delete_locked(lease).await {
            self.pending_window_clears.insert(session_id, org_id);
            tracing::error!(
                session_id = %session_id,
                error = %e,
                "Store cascade committed but window clear failed"
            );
            return Err(MemoryError::PartialDeletionFailure {
                target: session_id,
                stage: DeletionStage::ShortTermWindow,
                completed: 1,
                reason: e.to_string(),
            });
        }
        outcome.window_cleared = true;
        self.pending_window_clears.remove(&session_id);

        Ok(outcome)
    }

    async fn retry_pending_clear(&self, lease: &SessionLease, org_id: Uuid) -> Result<ForgetSessionOutcome> {
        let session_id = lease.session_id();
        let mut outcome = ForgetSessionOutcome {
            session_id,
            ..Default::default()
        };

        let pending = self
            .pending_window_clears
            .get(&session_id)
            .map(|org| *org == org_id)
            .unwrap_or(false);
        if !pending {
            return Ok(outcome);
        }

        self.window
            .delete_locked(lease)
            .await
            .map_err(|e| MemoryError::PartialDeletionFailure {
                target: session_id,
                stage: DeletionStage::ShortTermWindow,
                completed: 1,
                reason: e.to_string(),
            })?;
        self.pending_window_clears.remove(&session_id);
        outcome.window_cleared = true;
        tracing::info!(session_id = %session_id, "Finished pending window clear");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryEpisodicStore, ModelRegistry};
    use crate::subsystems::window::{InMemoryWindowBackend, WindowBackend, WindowState};
    use async_trait::async_trait;
    use remembr_core::config::ShortTermConfig;
    use remembr_core::{MemoryScope, NewEpisode, NewSession};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Fast tier whose deletes fail until `healthy` is set.
    struct FlakyBackend {
        inner: InMemoryWindowBackend,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl WindowBackend for FlakyBackend {
        async fn load(&self, session_id: Uuid) -> Result<Option<WindowState>> {
            self.inner.load(session_id).await
        }
        async fn save(&self, session_id: Uuid, state: WindowState) -> Result<()> {
            self.inner.save(session_id, state).await
        }
        async fn delete(&self, session_id: Uuid) -> Result<bool> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(MemoryError::Backend("fast tier offline".to_string()));
            }
            self.inner.delete(session_id).await
        }
        async fn sessions(&self) -> Result<Vec<Uuid>> {
            self.inner.sessions().await
        }
        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn short_term() -> ShortTermConfig {
        ShortTermConfig {
            max_tokens: 1000,
            auto_checkpoint_threshold: 1.0,
            ttl_seconds: 0,
            sweep_interval_seconds: 60,
        }
    }

    async fn seed_session(store: &InMemoryEpisodicStore, ctx: &TenancyContext, window: &ShortTermWindow) -> Uuid {
        let session = store
            .create_session(
                ctx.org_id,
                NewSession {
                    scope: ctx.scope(),
                    metadata: serde_json::json!({}),
                    expires_at: None,
                },
            )
            .await
            .unwrap();
        store
            .put_episode(
                ctx.org_id,
                NewEpisode {
                    scope: ctx.scope(),
                    session_id: Some(session.id),
                    role: "user".to_string(),
                    content: "hello".to_string(),
                    tags: vec![],
                    metadata: serde_json::json!({}),
                    token_count: 1,
                },
            )
            .await
            .unwrap();
        window.append(session.id, "user", "hello", Some(1)).await.unwrap();
        session.id
    }

    #[tokio::test]
    async fn test_window_failure_is_partial_and_retry_completes() {
        let store = Arc::new(InMemoryEpisodicStore::new(ModelRegistry::single("m", 3)));
        let backend = Arc::new(FlakyBackend {
            inner: InMemoryWindowBackend::new(),
            healthy: AtomicBool::new(false),
        });
        let window = Arc::new(ShortTermWindow::new(backend.clone(), &short_term()));
        let forget = ForgettingCoordinator::new(store.clone(), window.clone());

        let ctx = TenancyContext::org_admin(Uuid::new_v4());
        let s = seed_session(&store, &ctx, &window).await;

        let err = forget.forget_session(&ctx, s).await.unwrap_err();
        assert!(matches!(
            err,
            MemoryError::PartialDeletionFailure {
                stage: DeletionStage::ShortTermWindow,
                completed: 1,
                ..
            }
        ));
        assert_eq!(store.episode_count(), 0);
        assert_eq!(window.read(s).await.unwrap().len(), 1);

        backend.healthy.store(true, Ordering::SeqCst);
        let outcome = forget.forget_session(&ctx, s).await.unwrap();
        assert!(outcome.window_cleared);
        assert_eq!(outcome.deleted_episodes, 0);
        assert!(window.read(s).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_clear_is_not_replayed_for_another_org() {
        let store = Arc::new(InMemoryEpisodicStore::new(ModelRegistry::single("m", 3)));
        let backend = Arc::new(FlakyBackend {
            inner: InMemoryWindowBackend::new(),
            healthy: AtomicBool::new(false),
        });
        let window = Arc::new(ShortTermWindow::new(backend.clone(), &short_term()));
        let forget = ForgettingCoordinator::new(store.clone(), window.clone());

        let ctx = TenancyContext::org_admin(Uuid::new_v4());
        let s = seed_session(&store, &ctx, &window).await;
        assert!(forget.forget_session(&ctx, s).await.is_err());

        backend.healthy.store(true, Ordering::SeqCst);
        let stranger = TenancyContext::org_admin(Uuid::new_v4());
        let outcome = forget.forget_session(&stranger, s).await.unwrap();
        assert!(!outcome.window_cleared);
        assert_eq!(window.read(s).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_user_cannot_forget_someone_elses_session() {
        let store = Arc::new(InMemoryEpisodicStore::new(ModelRegistry::single("m", 3)));
        let window = Arc::new(ShortTermWindow::new(
            Arc::new(InMemoryWindowBackend::new()),
            &short_term(),
        ));
        let forget = ForgettingCoordinator::new(store.clone(), window.clone());

        let org = Uuid::new_v4();
        let owner = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);
        let other = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);
        let s = seed_session(&store, &owner, &window).await;

        let err = forget.forget_session(&other, s).await.unwrap_err();
        assert!(matches!(err, MemoryError::SessionNotFound(_)));
        assert_eq!(store.episode_count(), 1);
    }

    #[tokio::test]
    async fn test_forget_user_sweeps_sessionless_episodes() {
        let store = Arc::new(InMemoryEpisodicStore::new(ModelRegistry::single("m", 3)));
        let window = Arc::new(ShortTermWindow::new(
            Arc::new(InMemoryWindowBackend::new()),
            &short_term(),
        ));
        let forget = ForgettingCoordinator::new(store.clone(), window.clone());

        let org = Uuid::new_v4();
        let user = Uuid::new_v4();
        let user_ctx = TenancyContext::from_identity(org, Some(user), None);
        let s = seed_session(&store, &user_ctx, &window).await;
        store
            .put_episode(
                org,
                NewEpisode {
                    scope: MemoryScope {
                        user_id: Some(user),
                        ..MemoryScope::org(org)
                    },
                    session_id: None,
                    role: "user".to_string(),
                    content: "loose".to_string(),
                    tags: vec![],
                    metadata: serde_json::json!({}),
                    token_count: 1,
                },
            )
            .await
            .unwrap();

        let outcome = forget
            .forget_user(&TenancyContext::org_admin(org), user)
            .await
            .unwrap();
        assert_eq!(outcome.deleted_sessions, 1);
        assert_eq!(outcome.deleted_episodes, 2);
        assert_eq!(store.episode_count(), 0);
        assert!(window.read(s).await.unwrap().is_empty());
    }
}
