//! Short-term window: per-session, token-bounded buffer of recent turns.
//!
//! The window lives in a fast tier behind [`WindowBackend`] and is
//! independent of the episodic store. All mutation of one session's window
//! happens under that session's lease (see [`SessionLocks`]), so appends,
//! clears and restores on the same session never interleave.
//!
//! Budget overflow never rejects a write: oldest entries are evicted until
//! the total fits. Entries older than the session TTL are dropped lazily on
//! every access and by the background sweeper.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use remembr_core::config::ShortTermConfig;
use remembr_core::tokens::count_tokens;
use remembr_core::{Result, WindowEntry};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

// ============================================================================
// Fast-tier backend
// ============================================================================

/// An entry as held by the fast tier. `inserted_at` drives TTL expiry and is
/// reset on restore; the entry's own `created_at` is preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSlot {
    pub entry: WindowEntry,
    pub inserted_at: DateTime<Utc>,
}

/// Everything the fast tier stores for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    pub slots: Vec<WindowSlot>,
    /// Sequence assigned to the next appended entry.
    pub next_sequence: u64,
    /// Per-session TTL override in seconds.
    pub ttl_seconds: Option<u64>,
}

impl WindowState {
    /// Summed in u64: individual counts are u32 and may be arbitrarily large.
    pub fn total_tokens(&self) -> u64 {
        self.slots.iter().map(|s| u64::from(s.entry.token_count)).sum()
    }

    pub fn entries(&self) -> Vec<WindowEntry> {
        self.slots.iter().map(|s| s.entry.clone()).collect()
    }
}

/// Key-addressed store for window state, e.g. an in-process map or a
/// networked cache.
#[async_trait]
pub trait WindowBackend: Send + Sync {
    async fn load(&self, session_id: Uuid) -> Result<Option<WindowState>>;

    async fn save(&self, session_id: Uuid, state: WindowState) -> Result<()>;

    /// Returns whether a window existed.
    async fn delete(&self, session_id: Uuid) -> Result<bool>;

    async fn sessions(&self) -> Result<Vec<Uuid>>;

    fn name(&self) -> &str;
}

/// Process-local fast tier.
#[derive(Default)]
pub struct InMemoryWindowBackend {
    windows: DashMap<Uuid, WindowState>,
}

impl InMemoryWindowBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl WindowBackend for InMemoryWindowBackend {
    async fn load(&self, session_id: Uuid) -> Result<Option<WindowState>> {
        Ok(self.windows.get(&session_id).map(|s| s.value().clone()))
    }

    async fn save(&self, session_id: Uuid, state: WindowState) -> Result<()> {
        self.windows.insert(session_id, state);
        Ok(())
    }

    async fn delete(&self, session_id: Uuid) -> Result<bool> {
        Ok(self.windows.remove(&session_id).is_some())
    }

    async fn sessions(&self) -> Result<Vec<Uuid>> {
        Ok(self.windows.iter().map(|r| *r.key()).collect())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

// ============================================================================
// Per-session leases
// ============================================================================

/// Exclusive right to mutate one session's window.
pub struct SessionLease {
    session_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

/// One async mutex per session id. Cross-session work never contends.
#[derive(Default)]
pub struct SessionLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub async fn acquire(&self, session_id: Uuid) -> SessionLease {
        let lock = self
            .locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        SessionLease {
            session_id,
            _guard: lock.lock_owned().await,
        }
    }

    /// Drop locks nobody holds or waits on. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

// ============================================================================
// Window
// ============================================================================

#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub entry: WindowEntry,
    pub evicted: Vec<WindowEntry>,
    pub total_tokens: u64,
    /// Entries to checkpoint when usage crossed the auto-checkpoint threshold.
    pub checkpoint_snapshot: Option<Vec<WindowEntry>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowUsage {
    pub used: u64,
    pub max: u64,
    /// Rounded to two decimals.
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub windows_removed: usize,
    pub entries_expired: usize,
    pub leases_pruned: usize,
}

pub struct ShortTermWindow {
    backend: Arc<dyn WindowBackend>,
    locks: SessionLocks,
    max_tokens: u32,
    auto_checkpoint_threshold: f64,
    default_ttl: Option<Duration>,
}

impl ShortTermWindow {
    pub fn new(backend: Arc<dyn WindowBackend>, config: &ShortTermConfig) -> Self {
        Self {
            backend,
            locks: SessionLocks::default(),
            max_tokens: config.max_tokens,
            auto_checkpoint_threshold: config.auto_checkpoint_threshold,
            default_ttl: (config.ttl_seconds > 0).then(|| Duration::from_secs(config.ttl_seconds)),
        }
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn lease(&self, session_id: Uuid) -> SessionLease {
        self.locks.acquire(session_id).await
    }

    /// Load the window, dropping entries past their TTL. Persists the pruned
    /// state when anything expired.
    async fn load_live(&self, session_id: Uuid) -> Result<(WindowState, usize)> {
        let mut state = self.backend.load(session_id).await?.unwrap_or_default();
        let expired = self.expire(&mut state, Utc::now());
        if expired > 0 {
            tracing::debug!(session_id = %session_id, expired, "Expired short-term entries");
            self.backend.save(session_id, state.clone()).await?;
        }
        Ok((state, expired))
    }

    fn expire(&self, state: &mut WindowState, now: DateTime<Utc>) -> usize {
        let ttl = match state.ttl_seconds.map(Duration::from_secs).or(self.default_ttl) {
            Some(ttl) => ttl,
            None => return 0,
        };
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));

        let before = state.slots.len();
        state.slots.retain(|slot| now - slot.inserted_at < ttl);
        before - state.slots.len()
    }

    pub async fn append(
        &self,
        session_id: Uuid,
        role: &str,
        content: &str,
        token_count: Option<u32>,
    ) -> Result<AppendOutcome> {
        let lease = self.lease(session_id).await;
        self.append_locked(&lease, role, content, token_count).await
    }

    /// Append at the next sequence position, then evict oldest-first until
    /// the total fits the budget.
    pub async fn append_locked(
        &self,
        lease: &SessionLease,
        role: &str,
        content: &str,
        token_count: Option<u32>,
    ) -> Result<AppendOutcome> {
        let session_id = lease.session_id();
        let (mut state, _) = self.load_live(session_id).await?;

        let now = Utc::now();
        let entry = WindowEntry {
            session_id,
            sequence: state.next_sequence,
            role: role.to_string(),
            content: content.to_string(),
            token_count: token_count.unwrap_or_else(|| count_tokens(content)),
            created_at: now,
        };
        state.next_sequence += 1;
        state.slots.push(WindowSlot {
            entry: entry.clone(),
            inserted_at: now,
        });

        let mut evicted = Vec::new();
        let max_tokens = u64::from(self.max_tokens);
        let mut total = state.total_tokens();
        while total > max_tokens && !state.slots.is_empty() {
            let slot = state.slots.remove(0);
            total -= u64::from(slot.entry.token_count);
            evicted.push(slot.entry);
        }

        if !evicted.is_empty() {
            tracing::debug!(
                session_id = %session_id,
                evicted = evicted.len(),
                total_tokens = total,
                max_tokens = self.max_tokens,
                "Evicted oldest short-term entries"
            );
        }

        let threshold = self.max_tokens as f64 * self.auto_checkpoint_threshold;
        let checkpoint_snapshot = (total as f64 > threshold).then(|| state.entries());

        self.backend.save(session_id, state).await?;

        Ok(AppendOutcome {
            entry,
            evicted,
            total_tokens: total,
            checkpoint_snapshot,
        })
    }

    /// Current entries in sequence order; empty when the session has no window.
    pub async fn read(&self, session_id: Uuid) -> Result<Vec<WindowEntry>> {
        let lease = self.lease(session_id).await;
        self.read_locked(&lease).await
    }

    pub async fn read_locked(&self, lease: &SessionLease) -> Result<Vec<WindowEntry>> {
        let (state, _) = self.load_live(lease.session_id()).await?;
        Ok(state.entries())
    }

    pub async fn clear(&self, session_id: Uuid) -> Result<usize> {
        let lease = self.lease(session_id).await;
        self.clear_locked(&lease).await
    }

    /// Empty the window without persisting. Keeps the sequence high-water
    /// mark and TTL override. Returns the number of entries dropped.
    pub async fn clear_locked(&self, lease: &SessionLease) -> Result<usize> {
        let session_id = lease.session_id();
        let mut state = match self.backend.load(session_id).await? {
            Some(state) => state,
            None => return Ok(0),
        };
        let cleared = state.slots.len();
        state.slots.clear();
        self.backend.save(session_id, state).await?;
        Ok(cleared)
    }

    /// Remove the session's window entirely, including its TTL override.
    pub async fn delete_locked(&self, lease: &SessionLease) -> Result<bool> {
        self.backend.delete(lease.session_id()).await
    }

    /// Clear and repopulate with `entries` in sequence order. Restored entries
    /// keep their sequence numbers and restart their TTL.
    pub async fn replace_locked(
        &self,
        lease: &SessionLease,
        mut entries: Vec<WindowEntry>,
    ) -> Result<usize> {
        let session_id = lease.session_id();
        let previous = self.backend.load(session_id).await?.unwrap_or_default();

        entries.sort_by_key(|e| e.sequence);
        let now = Utc::now();
        let next_sequence = entries
            .last()
            .map(|e| e.sequence + 1)
            .unwrap_or(0)
            .max(previous.next_sequence);

        let restored = entries.len();
        let state = WindowState {
            slots: entries
                .into_iter()
                .map(|entry| WindowSlot {
                    entry: WindowEntry { session_id, ..entry },
                    inserted_at: now,
                })
                .collect(),
            next_sequence,
            ttl_seconds: previous.ttl_seconds,
        };
        self.backend.save(session_id, state).await?;
        Ok(restored)
    }

    pub async fn usage(&self, session_id: Uuid) -> Result<WindowUsage> {
        let lease = self.lease(session_id).await;
        let (state, _) = self.load_live(lease.session_id()).await?;
        let used = state.total_tokens();
        let percentage = if self.max_tokens == 0 {
            0.0
        } else {
            (used as f64 / self.max_tokens as f64 * 10_000.0).round() / 100.0
        };
        Ok(WindowUsage {
            used,
            max: u64::from(self.max_tokens),
            percentage,
        })
    }

    /// Override the TTL for one session. Applies to entries already held.
    pub async fn set_ttl(&self, session_id: Uuid, ttl: Duration) -> Result<()> {
        let lease = self.lease(session_id).await;
        let mut state = self
            .backend
            .load(lease.session_id())
            .await?
            .unwrap_or_default();
        state.ttl_seconds = Some(ttl.as_secs());
        self.expire(&mut state, Utc::now());
        self.backend.save(session_id, state).await
    }

    /// Drop expired entries across all sessions, delete windows that are
    /// left empty, and release idle leases.
    pub async fn sweep_expired(&self) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let now = Utc::now();

        for session_id in self.backend.sessions().await? {
            let _lease = self.lease(session_id).await;
            let Some(mut state) = self.backend.load(session_id).await? else {
                continue;
            };

            let expired = self.expire(&mut state, now);
            stats.entries_expired += expired;

            if state.slots.is_empty() && state.ttl_seconds.is_none() {
                if self.backend.delete(session_id).await? {
                    stats.windows_removed += 1;
                }
            } else if expired > 0 {
                self.backend.save(session_id, state).await?;
            }
        }

        stats.leases_pruned = self.locks.prune_idle();
        Ok(stats)
    }
}
