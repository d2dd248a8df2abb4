//! Embedding backfill worker
//!
//! Periodically finds episodes with no embedding for the active model,
//! embeds them in batches and writes the vectors back through the store.
//! Covers both episodes whose store-time embedding failed and the re-embed
//! pass after a model migration. Once backfill has caught up,
//! [`prune_stale_embeddings`] drops vectors of retired models.
//!
//! An episode the provider refuses outright is isolated and remembered in a
//! skip set, so it cannot stall the rest of the queue. The set lives in
//! memory; a restart gives skipped episodes one more attempt.

use std::collections::HashSet;
use std::sync::Arc;

use remembr_core::config::EmbeddingConfig;
use remembr_core::{EmbeddingProvider, MemoryError, Result};
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use uuid::Uuid;

use crate::store::{EpisodicStore, PendingEmbedding};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub embedded: usize,
    /// Episodes deleted between listing and write-back.
    pub vanished: usize,
    pub failed: usize,
    /// Episodes the provider rejected; excluded from later ticks.
    pub skipped: usize,
}

/// Run the backfill loop until `shutdown` fires.
///
/// Spawned by the daemon. Exits immediately if `backfill_enabled` is `false`.
pub async fn run_backfill_worker(
    store: Arc<dyn EpisodicStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: EmbeddingConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    if !config.backfill_enabled {
        tracing::info!("Embedding backfill worker disabled via config");
        return;
    }

    let tick_secs = config.backfill_interval_minutes.max(1) * 60;
    let mut ticker = interval(Duration::from_secs(tick_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        interval_min = config.backfill_interval_minutes,
        batch_size = config.backfill_batch_size,
        model = embedder.model(),
        "Embedding backfill worker started"
    );

    let mut skipped = HashSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => {
                tracing::info!("Embedding backfill worker stopping");
                return;
            }
        }

        let tick = run_backfill_tick(
            store.as_ref(),
            embedder.as_ref(),
            config.backfill_batch_size,
            &mut skipped,
        );
        match tick.await {
            Ok(report) => {
                if report != BackfillReport::default() {
                    tracing::info!(
                        embedded = report.embedded,
                        vanished = report.vanished,
                        failed = report.failed,
                        skipped = report.skipped,
                        "Backfill tick complete"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Backfill tick failed");
            }
        }
    }
}

/// One backfill batch. Public for tests and one-shot maintenance.
///
/// Episodes in `skipped` are not retried; episodes the provider rejects are
/// added to it. Provider outages fail the tick and leave the queue untouched.
pub async fn run_backfill_tick(
    store: &dyn EpisodicStore,
    embedder: &dyn EmbeddingProvider,
    batch_size: usize,
    skipped: &mut HashSet<Uuid>,
) -> Result<BackfillReport> {
    let model = embedder.model();
    let exclude: Vec<Uuid> = skipped.iter().copied().collect();
    let pending = store
        .episodes_missing_embedding(model, batch_size.max(1) as i64, &exclude)
        .await?;
    if pending.is_empty() {
        return Ok(BackfillReport::default());
    }

    tracing::debug!(pending = pending.len(), model, "Backfilling embeddings");

    let mut report = BackfillReport::default();
    let texts: Vec<String> = pending.iter().map(|p| p.content.clone()).collect();
    match embedder.embed_batch(&texts).await {
        Ok(vectors) => {
            for (item, vector) in pending.iter().zip(vectors) {
                write_back(store, model, item, vector, &mut report).await;
            }
        }
        Err(e) if e.is_input_rejected() => {
            tracing::warn!(error = %e, batch = pending.len(), "Batch rejected; embedding episodes one by one");
            isolate(store, embedder, &pending, skipped, &mut report).await;
        }
        Err(e) => return Err(e.into()),
    }

    Ok(report)
}

/// Embed each item alone so one rejected input only costs itself.
async fn isolate(
    store: &dyn EpisodicStore,
    embedder: &dyn EmbeddingProvider,
    pending: &[PendingEmbedding],
    skipped: &mut HashSet<Uuid>,
    report: &mut BackfillReport,
) {
    let model = embedder.model();
    for (i, item) in pending.iter().enumerate() {
        match embedder.embed(&item.content).await {
            Ok(vector) => write_back(store, model, item, vector, report).await,
            Err(e) if e.is_input_rejected() => {
                tracing::warn!(
                    episode_id = %item.episode_id,
                    org_id = %item.org_id,
                    error = %e,
                    "Provider rejected episode; skipping it in later backfills"
                );
                skipped.insert(item.episode_id);
                report.skipped += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Provider failed mid-batch; rest left for the next tick");
                report.failed += pending.len() - i;
                return;
            }
        }
    }
}

async fn write_back(
    store: &dyn EpisodicStore,
    model: &str,
    item: &PendingEmbedding,
    vector: Vec<f32>,
    report: &mut BackfillReport,
) {
    match store
        .put_embedding(item.org_id, item.episode_id, vector, model)
        .await
    {
        Ok(()) => report.embedded += 1,
        Err(MemoryError::NotFound { .. }) => report.vanished += 1,
        Err(e) => {
            tracing::warn!(episode_id = %item.episode_id, error = %e, "Failed to store backfilled embedding");
            report.failed += 1;
        }
    }
}

/// Remove embeddings of every model except `active_model`. Run after the
/// backfill for a new model has caught up.
pub async fn prune_stale_embeddings(store: &dyn EpisodicStore, active_model: &str) -> Result<u64> {
    let removed = store.delete_embeddings_except(active_model).await?;
    tracing::info!(active_model, removed, "Pruned embeddings of retired models");
    Ok(removed)
}
