//! Checkpoint Manager: snapshot and restore of short-term windows.
//!
//! Snapshots are read under the session lease so an append is never split
//! across a checkpoint. Restore validates the checkpoint first, then clears
//! and repopulates the window under the lease.

use std::sync::Arc;

use remembr_core::{Checkpoint, Result, WindowEntry};
use uuid::Uuid;

use crate::store::EpisodicStore;
use crate::subsystems::window::ShortTermWindow;

/// Returned by [`CheckpointManager::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub checkpoint_id: Uuid,
    pub restored_message_count: usize,
}

pub struct CheckpointManager {
    store: Arc<dyn EpisodicStore>,
    window: Arc<ShortTermWindow>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn EpisodicStore>, window: Arc<ShortTermWindow>) -> Self {
        Self { store, window }
    }

    /// Persist the current window. The window itself is left untouched.
    pub async fn checkpoint(&self, org_id: Uuid, session_id: Uuid) -> Result<Checkpoint> {
        // Fail before touching the window if the session is absent.
        self.store.get_session(org_id, session_id).await?;

        let entries = {
            let lease = self.window.lease(session_id).await;
            self.window.read_locked(&lease).await?
        };

        let checkpoint = self.persist_snapshot(org_id, session_id, entries).await?;
        tracing::info!(
            session_id = %session_id,
            checkpoint_id = %checkpoint.id,
            message_count = checkpoint.message_count,
            "Checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Persist a snapshot taken elsewhere under the session lease, e.g. by
    /// the auto-checkpoint path of an append.
    pub async fn persist_snapshot(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        entries: Vec<WindowEntry>,
    ) -> Result<Checkpoint> {
        self.store.put_checkpoint(org_id, session_id, entries).await
    }

    pub async fn restore(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        checkpoint_id: Uuid,
    ) -> Result<RestoreOutcome> {
        let checkpoint = self
            .store
            .get_checkpoint(org_id, session_id, checkpoint_id)
            .await?;

        let lease = self.window.lease(session_id).await;
        let restored = self.window.replace_locked(&lease, checkpoint.entries).await?;
        drop(lease);

        tracing::info!(
            session_id = %session_id,
            checkpoint_id = %checkpoint_id,
            restored,
            "Window restored from checkpoint"
        );

        Ok(RestoreOutcome {
            checkpoint_id,
            restored_message_count: restored,
        })
    }

    /// Newest first.
    pub async fn list(&self, org_id: Uuid, session_id: Uuid) -> Result<Vec<Checkpoint>> {
        self.store.list_checkpoints(org_id, session_id).await
    }
}
