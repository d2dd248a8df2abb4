//! End-to-end engine behaviour over the in-memory store and fast tier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use remembr_core::config::{EmbedOnStore, RetrievalConfig, ShortTermConfig};
use remembr_core::{
    EmbeddingError, EmbeddingProvider, HttpEmbeddingClient, HttpEmbeddingConfig, MemoryError,
    TenancyContext,
};
use remembr_engine::subsystems::window::WindowState;
use remembr_engine::{
    EpisodicStore, InMemoryEpisodicStore, InMemoryWindowBackend, MemoryEngine, MemoryQuery, ModelRegistry,
    SearchMode, SearchRequest, StoreRequest, WindowBackend,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MODEL: &str = "test-model";

// ------------------------------------------------------------------
// Mock providers
// ------------------------------------------------------------------

/// Maps text onto three axes by keyword: money, weather, everything else.
struct KeywordEmbedder;

fn keyword_vector(text: &str) -> Vec<f32> {
    let text = text.to_lowercase();
    let money = ["pricing", "plan", "subscription", "cost", "billing"]
        .iter()
        .filter(|w| text.contains(*w))
        .count() as f32;
    let weather = ["weather", "rain", "sunny"]
        .iter()
        .filter(|w| text.contains(*w))
        .count() as f32;
    vec![money, weather, 0.1]
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(keyword_vector(text))
    }
    fn model(&self) -> &str {
        MODEL
    }
    fn dimensions(&self) -> usize {
        3
    }
    fn name(&self) -> &str {
        "keyword"
    }
}

struct Harness {
    engine: Arc<MemoryEngine>,
    store: Arc<InMemoryEpisodicStore>,
}

fn short_term(max_tokens: u32, threshold: f64) -> ShortTermConfig {
    ShortTermConfig {
        max_tokens,
        auto_checkpoint_threshold: threshold,
        ttl_seconds: 0,
        sweep_interval_seconds: 60,
    }
}

fn harness_with(short: ShortTermConfig, mode: EmbedOnStore, embedder: Arc<dyn EmbeddingProvider>) -> Harness {
    let store = Arc::new(InMemoryEpisodicStore::new(ModelRegistry::single(
        embedder.model().to_string(),
        embedder.dimensions(),
    )));
    let engine = MemoryEngine::builder()
        .store(store.clone())
        .embedder(embedder)
        .short_term(short)
        .retrieval(RetrievalConfig::default())
        .store_mode(mode)
        .build()
        .unwrap();
    Harness {
        engine: Arc::new(engine),
        store,
    }
}

fn harness() -> Harness {
    harness_with(short_term(4000, 0.8), EmbedOnStore::Sync, Arc::new(KeywordEmbedder))
}

async fn new_session(engine: &MemoryEngine, ctx: &TenancyContext) -> Uuid {
    engine
        .create_session(ctx, serde_json::json!({}), None)
        .await
        .unwrap()
        .id
}

// ------------------------------------------------------------------
// Short-term window
// ------------------------------------------------------------------

#[tokio::test]
async fn test_eviction_scenario_40_40_40() {
    let h = harness_with(short_term(100, 0.8), EmbedOnStore::Sync, Arc::new(KeywordEmbedder));
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let s = new_session(&h.engine, &ctx).await;

    for name in ["E1", "E2", "E3"] {
        h.engine
            .store(&ctx, StoreRequest::new("user", name).in_session(s).tokens(40))
            .await
            .unwrap();
    }

    let window = h.engine.window(&ctx, s).await.unwrap();
    let contents: Vec<&str> = window.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(contents, vec!["E2", "E3"]);
    assert_eq!(window.iter().map(|e| e.token_count).sum::<u32>(), 80);

    // evicted from the window, still durable
    let history = h.engine.get_session_history(&ctx, s, 10, 0).await.unwrap();
    assert_eq!(history.len(), 3);
}

#[tokio::test]
async fn test_window_never_exceeds_budget() {
    let h = harness_with(short_term(100, 1.0), EmbedOnStore::Sync, Arc::new(KeywordEmbedder));
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let s = new_session(&h.engine, &ctx).await;

    for i in 0..40u32 {
        let tokens = (i * 37) % 61 + 1;
        h.engine
            .store(&ctx, StoreRequest::new("user", format!("m{}", i)).in_session(s).tokens(tokens))
            .await
            .unwrap();
        let usage = h.engine.window_usage(&ctx, s).await.unwrap();
        assert!(usage.used <= usage.max, "used {} > max {}", usage.used, usage.max);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_stay_ordered_and_bounded() {
    let h = harness_with(short_term(200, 1.0), EmbedOnStore::Sync, Arc::new(KeywordEmbedder));
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let s = new_session(&h.engine, &ctx).await;

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .store(&ctx, StoreRequest::new("user", format!("c{}", i)).in_session(s).tokens(15))
                    .await
                    .unwrap();
            })
        })
        .collect();
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    let window = h.engine.window(&ctx, s).await.unwrap();
    assert!(window.iter().map(|e| e.token_count).sum::<u32>() <= 200);
    assert!(window.windows(2).all(|w| w[0].sequence < w[1].sequence));
    // the newest append always survives eviction
    assert_eq!(window.last().unwrap().sequence, 31);
}

#[tokio::test]
async fn test_auto_checkpoint_above_threshold() {
    let h = harness_with(short_term(100, 0.8), EmbedOnStore::Sync, Arc::new(KeywordEmbedder));
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let s = new_session(&h.engine, &ctx).await;

    let first = h
        .engine
        .store(&ctx, StoreRequest::new("user", "a").in_session(s).tokens(50))
        .await
        .unwrap();
    assert!(first.auto_checkpoint.is_none());

    let second = h
        .engine
        .store(&ctx, StoreRequest::new("assistant", "b").in_session(s).tokens(40))
        .await
        .unwrap();
    let checkpoint_id = second.auto_checkpoint.expect("auto checkpoint at 90/100");

    let checkpoints = h.engine.list_checkpoints(&ctx, s).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].id, checkpoint_id);
    assert_eq!(checkpoints[0].message_count, 2);
}

// ------------------------------------------------------------------
// Checkpoints
// ------------------------------------------------------------------

#[tokio::test]
async fn test_checkpoint_restore_round_trip() {
    let h = harness();
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let s = new_session(&h.engine, &ctx).await;

    for i in 0..5 {
        h.engine
            .store(&ctx, StoreRequest::new("user", format!("turn {}", i)).in_session(s))
            .await
            .unwrap();
    }
    let captured = h.engine.window(&ctx, s).await.unwrap();

    let checkpoint = h.engine.checkpoint(&ctx, s).await.unwrap();
    assert_eq!(checkpoint.message_count, 5);

    h.engine.short_term_window().clear(s).await.unwrap();
    assert!(h.engine.window(&ctx, s).await.unwrap().is_empty());

    let restored = h.engine.restore(&ctx, s, checkpoint.id).await.unwrap();
    assert_eq!(restored.restored_message_count, 5);
    assert_eq!(h.engine.window(&ctx, s).await.unwrap(), captured);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_checkpoints_never_split_an_append() {
    let h = harness_with(short_term(10_000, 1.0), EmbedOnStore::Sync, Arc::new(KeywordEmbedder));
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let s = new_session(&h.engine, &ctx).await;

    let writer = {
        let engine = h.engine.clone();
        tokio::spawn(async move {
            for i in 0..50 {
                engine
                    .store(&ctx, StoreRequest::new("user", format!("w{}", i)).in_session(s).tokens(1))
                    .await
                    .unwrap();
            }
        })
    };

    let mut snapshots = Vec::new();
    for _ in 0..10 {
        snapshots.push(h.engine.checkpoint(&ctx, s).await.unwrap());
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();

    for cp in snapshots {
        // every snapshot is a gap-free prefix of the append order
        let seqs: Vec<u64> = cp.entries.iter().map(|e| e.sequence).collect();
        let expected: Vec<u64> = (0..seqs.len() as u64).collect();
        assert_eq!(seqs, expected);
        assert_eq!(cp.message_count as usize, cp.entries.len());
    }
}

// ------------------------------------------------------------------
// Retrieval
// ------------------------------------------------------------------

#[tokio::test]
async fn test_filter_only_tags_most_recent_first() {
    let h = harness();
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let s = new_session(&h.engine, &ctx).await;

    let first = h
        .engine
        .store(&ctx, StoreRequest::new("user", "likes dark mode").in_session(s).tags(["preference"]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.engine
        .store(&ctx, StoreRequest::new("user", "card declined").in_session(s).tags(["billing"]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let third = h
        .engine
        .store(
            &ctx,
            StoreRequest::new("user", "prefers phone support")
                .in_session(s)
                .tags(["preference", "vip"]),
        )
        .await
        .unwrap();

    let request = SearchRequest::new("")
        .tags(vec!["preference".to_string()])
        .mode(SearchMode::FilterOnly)
        .limit(10);
    let response = h
        .engine
        .search(&ctx, &request, &CancellationToken::new())
        .await
        .unwrap();

    let ids: Vec<Uuid> = response.results.iter().map(|r| r.episode.id).collect();
    assert_eq!(ids, vec![third.episode.id, first.episode.id]);
    assert_eq!(response.total, 2);
}

#[tokio::test]
async fn test_semantic_ranks_related_content_first() {
    let h = harness();
    let ctx = TenancyContext::org_admin(Uuid::new_v4());

    let weather = h
        .engine
        .store(&ctx, StoreRequest::new("user", "the weather is sunny"))
        .await
        .unwrap();
    let billing = h
        .engine
        .store(&ctx, StoreRequest::new("user", "monthly subscription cost"))
        .await
        .unwrap();
    assert!(weather.embedded && billing.embedded);

    let request = SearchRequest::new("pricing plans").mode(SearchMode::Semantic);
    let response = h
        .engine
        .search(&ctx, &request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].episode.id, billing.episode.id);
    assert!(response.results[0].score > response.results[1].score);
}

#[tokio::test]
async fn test_search_validates_input() {
    let h = harness();
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let cancel = CancellationToken::new();

    let err = h
        .engine
        .search(&ctx, &SearchRequest::new("x").limit(0), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::InvalidLimit(0)));

    let now = chrono::Utc::now();
    let request = SearchRequest::new("x").between(Some(now), Some(now - chrono::Duration::days(1)));
    let err = h.engine.search(&ctx, &request, &cancel).await.unwrap_err();
    assert!(matches!(err, MemoryError::InvalidTimeRange { .. }));
}

// ------------------------------------------------------------------
// Isolation
// ------------------------------------------------------------------

#[tokio::test]
async fn test_orgs_never_see_each_other() {
    let h = harness();
    let a = TenancyContext::org_admin(Uuid::new_v4());
    let b = TenancyContext::org_admin(Uuid::new_v4());
    let sa = new_session(&h.engine, &a).await;
    let sb = new_session(&h.engine, &b).await;

    for i in 0..6 {
        h.engine
            .store(&a, StoreRequest::new("user", format!("pricing plan a{}", i)).in_session(sa).tags(["shared"]))
            .await
            .unwrap();
        h.engine
            .store(&b, StoreRequest::new("user", format!("pricing plan b{}", i)).in_session(sb).tags(["shared"]))
            .await
            .unwrap();
    }

    let cancel = CancellationToken::new();
    for mode in [SearchMode::Semantic, SearchMode::Hybrid, SearchMode::FilterOnly] {
        let request = SearchRequest::new("pricing plan").mode(mode).limit(100);
        let response = h.engine.search(&a, &request, &cancel).await.unwrap();
        assert_eq!(response.results.len(), 6);
        assert!(response.results.iter().all(|r| r.episode.org_id == a.org_id));
    }

    let history = h.engine.get_session_history(&a, sa, 100, 0).await.unwrap();
    assert!(history.iter().all(|e| e.org_id == a.org_id));

    // another org's session is indistinguishable from a missing one
    let err = h.engine.get_session_history(&a, sb, 10, 0).await.unwrap_err();
    assert!(matches!(err, MemoryError::SessionNotFound(_)));
    let err = h
        .engine
        .store(&a, StoreRequest::new("user", "sneaky").in_session(sb))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::SessionNotFound(_)));
    let err = h
        .engine
        .search(&a, &SearchRequest::new("x").session(sb), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::SessionNotFound(_)));
}

#[tokio::test]
async fn test_user_cannot_read_another_users_session() {
    let h = harness();
    let org = Uuid::new_v4();
    let alice = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);
    let bob = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);
    let s = new_session(&h.engine, &alice).await;
    h.engine
        .store(&alice, StoreRequest::new("user", "private").in_session(s))
        .await
        .unwrap();

    assert!(matches!(
        h.engine.window(&bob, s).await,
        Err(MemoryError::SessionNotFound(_))
    ));
    assert!(matches!(
        h.engine.checkpoint(&bob, s).await,
        Err(MemoryError::SessionNotFound(_))
    ));

    // org admin sees everything in the org
    let admin = TenancyContext::org_admin(org);
    assert_eq!(h.engine.window(&admin, s).await.unwrap().len(), 1);
}

// ------------------------------------------------------------------
// Forgetting
// ------------------------------------------------------------------

#[tokio::test]
async fn test_forget_session_is_idempotent() {
    let h = harness();
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let s = new_session(&h.engine, &ctx).await;
    for i in 0..3 {
        h.engine
            .store(&ctx, StoreRequest::new("user", format!("m{}", i)).in_session(s))
            .await
            .unwrap();
    }
    h.engine.checkpoint(&ctx, s).await.unwrap();

    let first = h.engine.forget_session(&ctx, s).await.unwrap();
    assert_eq!(first.deleted_episodes, 3);
    assert_eq!(first.deleted_checkpoints, 1);
    assert!(first.session_deleted);
    assert!(h.engine.short_term_window().read(s).await.unwrap().is_empty());

    let second = h.engine.forget_session(&ctx, s).await.unwrap();
    assert_eq!(second.deleted_episodes, 0);
    assert_eq!(second.deleted_checkpoints, 0);
    assert!(!second.session_deleted);

    assert_eq!(h.store.episode_count(), 0);
    assert_eq!(h.store.embedding_count(), 0);
}

#[tokio::test]
async fn test_forget_episode_then_not_found() {
    let h = harness();
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let stored = h
        .engine
        .store(&ctx, StoreRequest::new("user", "forget me"))
        .await
        .unwrap();

    h.engine.forget_episode(&ctx, stored.episode.id).await.unwrap();
    assert_eq!(h.store.embedding_count(), 0);

    let err = h.engine.forget_episode(&ctx, stored.episode.id).await.unwrap_err();
    assert!(matches!(err, MemoryError::NotFound { .. }));

    let stranger = TenancyContext::org_admin(Uuid::new_v4());
    let other = h.engine.store(&ctx, StoreRequest::new("user", "keep")).await.unwrap();
    let err = h.engine.forget_episode(&stranger, other.episode.id).await.unwrap_err();
    assert!(matches!(err, MemoryError::NotFound { .. }));
    assert_eq!(h.store.episode_count(), 1);
}

#[tokio::test]
async fn test_forget_user_requires_org_authority() {
    let h = harness();
    let org = Uuid::new_v4();
    let user = Uuid::new_v4();
    let user_ctx = TenancyContext::from_identity(org, Some(user), None);
    let s = new_session(&h.engine, &user_ctx).await;
    h.engine
        .store(&user_ctx, StoreRequest::new("user", "hello").in_session(s))
        .await
        .unwrap();

    let agent_ctx = TenancyContext::from_identity(org, Some(user), Some(Uuid::new_v4()));
    let err = h.engine.forget_user(&agent_ctx, user).await.unwrap_err();
    assert!(matches!(err, MemoryError::AuthorityInsufficient { .. }));
    assert_eq!(h.store.episode_count(), 1);

    let err = h.engine.forget_user(&user_ctx, user).await.unwrap_err();
    assert!(matches!(err, MemoryError::AuthorityInsufficient { .. }));
    assert_eq!(h.store.episode_count(), 1);
}

#[tokio::test]
async fn test_forget_user_cascades_every_session() {
    let h = harness();
    let org = Uuid::new_v4();
    let user = Uuid::new_v4();
    let user_ctx = TenancyContext::from_identity(org, Some(user), None);
    let bystander = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);

    let mut sessions = Vec::new();
    for _ in 0..3 {
        let s = new_session(&h.engine, &user_ctx).await;
        for i in 0..2 {
            h.engine
                .store(&user_ctx, StoreRequest::new("user", format!("m{}", i)).in_session(s))
                .await
                .unwrap();
        }
        sessions.push(s);
    }
    let kept = new_session(&h.engine, &bystander).await;
    h.engine
        .store(&bystander, StoreRequest::new("user", "not mine").in_session(kept))
        .await
        .unwrap();

    let outcome = h
        .engine
        .forget_user(&TenancyContext::org_admin(org), user)
        .await
        .unwrap();
    assert_eq!(outcome.deleted_sessions, 3);
    assert_eq!(outcome.deleted_episodes, 6);

    for s in sessions {
        assert!(h.engine.short_term_window().read(s).await.unwrap().is_empty());
    }
    assert_eq!(h.store.episode_count(), 1);
    assert_eq!(h.engine.window(&bystander, kept).await.unwrap().len(), 1);
}

// ------------------------------------------------------------------
// Embedding paths
// ------------------------------------------------------------------

#[tokio::test]
async fn test_background_embedding_completes_before_shutdown() {
    let h = harness_with(short_term(4000, 0.8), EmbedOnStore::Background, Arc::new(KeywordEmbedder));
    let ctx = TenancyContext::org_admin(Uuid::new_v4());

    let stored = h
        .engine
        .store(&ctx, StoreRequest::new("user", "subscription billing"))
        .await
        .unwrap();
    assert!(!stored.embedded);

    h.engine.shutdown().await;
    assert_eq!(h.store.embedding_count(), 1);
}

#[tokio::test]
async fn test_http_provider_end_to_end() {
    let server = MockServer::start().await;
    for (text, vector) in [
        ("monthly subscription cost", vec![1.0, 0.0, 0.0]),
        ("the weather is sunny", vec![0.0, 1.0, 0.0]),
        ("pricing plans", vec![0.9, 0.1, 0.0]),
    ] {
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_json(serde_json::json!({ "model": MODEL, "input": [text] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "index": 0, "embedding": vector }]
            })))
            .mount(&server)
            .await;
    }

    let client = HttpEmbeddingClient::new(
        HttpEmbeddingConfig {
            api_key: "k".to_string(),
            api_key_env: "REMEMBR_TEST_KEY".to_string(),
            model: MODEL.to_string(),
            dimensions: 3,
            timeout: Duration::from_secs(5),
            max_retries: 0,
            retry_delay_ms: 1,
            batch_size: 8,
        },
        server.uri(),
    )
    .unwrap();

    let h = harness_with(short_term(4000, 0.8), EmbedOnStore::Sync, Arc::new(client));
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let billing = h
        .engine
        .store(&ctx, StoreRequest::new("user", "monthly subscription cost"))
        .await
        .unwrap();
    h.engine
        .store(&ctx, StoreRequest::new("user", "the weather is sunny"))
        .await
        .unwrap();

    let response = h
        .engine
        .search(
            &ctx,
            &SearchRequest::new("pricing plans").mode(SearchMode::Hybrid),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.results[0].episode.id, billing.episode.id);

    let health = h.engine.health().await.unwrap();
    assert_eq!(health.embedding_model, MODEL);
    assert_eq!(health.store, "in-memory");
}

#[tokio::test]
async fn test_failed_store_time_embedding_is_backfilled() {
    struct FlakyEmbedder {
        down: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if self.down.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(EmbeddingError::Api {
                    code: 503,
                    message: "down".to_string(),
                });
            }
            Ok(keyword_vector(text))
        }
        fn model(&self) -> &str {
            MODEL
        }
        fn dimensions(&self) -> usize {
            3
        }
        fn name(&self) -> &str {
            "flaky"
        }
    }

    let embedder = Arc::new(FlakyEmbedder {
        down: std::sync::atomic::AtomicBool::new(true),
    });
    let h = harness_with(short_term(4000, 0.8), EmbedOnStore::Sync, embedder.clone());
    let ctx = TenancyContext::org_admin(Uuid::new_v4());

    let stored = h
        .engine
        .store(&ctx, StoreRequest::new("user", "billing question"))
        .await
        .unwrap();
    assert!(!stored.embedded);
    assert_eq!(h.store.embedding_count(), 0);

    embedder.down.store(false, std::sync::atomic::Ordering::SeqCst);
    let report = h.engine.backfill_embeddings(10).await.unwrap();
    assert_eq!(report.embedded, 1);
    assert_eq!(h.store.embedding_count(), 1);
}

// ------------------------------------------------------------------
// Sessions
// ------------------------------------------------------------------

#[tokio::test]
async fn test_session_listing_metadata_and_ttl() {
    let h = harness();
    let org = Uuid::new_v4();
    let alice = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);
    let bob = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);

    let mine = new_session(&h.engine, &alice).await;
    new_session(&h.engine, &bob).await;

    let listed = h.engine.list_sessions(&alice, 10, 0).await.unwrap();
    assert_eq!(listed.iter().map(|s| s.id).collect::<Vec<_>>(), vec![mine]);
    assert_eq!(
        h.engine
            .list_sessions(&TenancyContext::org_admin(org), 10, 0)
            .await
            .unwrap()
            .len(),
        2
    );

    let updated = h
        .engine
        .update_session_metadata(&alice, mine, serde_json::json!({ "topic": "billing" }))
        .await
        .unwrap();
    assert_eq!(updated.metadata["topic"], "billing");
    assert!(matches!(
        h.engine
            .update_session_metadata(&bob, mine, serde_json::json!({}))
            .await,
        Err(MemoryError::SessionNotFound(_))
    ));

    h.engine
        .store(&alice, StoreRequest::new("user", "short lived").in_session(mine))
        .await
        .unwrap();
    assert_eq!(h.engine.window(&alice, mine).await.unwrap().len(), 1);

    // a zero TTL expires everything already held
    h.engine
        .set_window_ttl(&alice, mine, Duration::from_secs(0))
        .await
        .unwrap();
    assert!(h.engine.window(&alice, mine).await.unwrap().is_empty());
    // the durable copy is unaffected
    assert_eq!(
        h.engine.get_session_history(&alice, mine, 10, 0).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_session_pages_count_only_accessible_sessions() {
    let h = harness();
    let org = Uuid::new_v4();
    let alice = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);
    let bob = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);

    let mine = new_session(&h.engine, &alice).await;
    for _ in 0..3 {
        new_session(&h.engine, &bob).await;
    }

    // bob's newer sessions must not push alice's off her first page
    let page = h.engine.list_sessions(&alice, 1, 0).await.unwrap();
    assert_eq!(page.iter().map(|s| s.id).collect::<Vec<_>>(), vec![mine]);
    assert!(h.engine.list_sessions(&alice, 1, 1).await.unwrap().is_empty());
}

// ------------------------------------------------------------------
// Robustness
// ------------------------------------------------------------------

#[tokio::test]
async fn test_huge_token_count_is_stored_without_overflow() {
    let h = harness_with(short_term(100, 0.8), EmbedOnStore::Sync, Arc::new(KeywordEmbedder));
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let s = new_session(&h.engine, &ctx).await;

    h.engine
        .store(&ctx, StoreRequest::new("user", "normal").in_session(s).tokens(50))
        .await
        .unwrap();
    let stored = h
        .engine
        .store(&ctx, StoreRequest::new("user", "enormous").in_session(s).tokens(u32::MAX))
        .await
        .unwrap();

    assert_eq!(stored.episode.token_count, i32::MAX);
    assert_eq!(stored.evicted, 2);
    assert!(stored.window_error.is_none());
    assert!(h.engine.window(&ctx, s).await.unwrap().is_empty());
    let usage = h.engine.window_usage(&ctx, s).await.unwrap();
    assert_eq!(usage.used, 0);
}

#[tokio::test]
async fn test_store_reports_window_failure_after_durable_write() {
    /// Fast tier that accepts reads but refuses every write.
    struct ReadOnlyBackend {
        inner: InMemoryWindowBackend,
    }

    #[async_trait]
    impl WindowBackend for ReadOnlyBackend {
        async fn load(&self, session_id: Uuid) -> remembr_core::Result<Option<WindowState>> {
            self.inner.load(session_id).await
        }
        async fn save(&self, _session_id: Uuid, _state: WindowState) -> remembr_core::Result<()> {
            Err(MemoryError::Backend("fast tier read-only".to_string()))
        }
        async fn delete(&self, session_id: Uuid) -> remembr_core::Result<bool> {
            self.inner.delete(session_id).await
        }
        async fn sessions(&self) -> remembr_core::Result<Vec<Uuid>> {
            self.inner.sessions().await
        }
        fn name(&self) -> &str {
            "read-only"
        }
    }

    let store = Arc::new(InMemoryEpisodicStore::new(ModelRegistry::single(MODEL, 3)));
    let engine = MemoryEngine::builder()
        .store(store.clone())
        .embedder(Arc::new(KeywordEmbedder))
        .window_backend(Arc::new(ReadOnlyBackend {
            inner: InMemoryWindowBackend::new(),
        }))
        .store_mode(EmbedOnStore::Sync)
        .build()
        .unwrap();
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let s = new_session(&engine, &ctx).await;

    let stored = engine
        .store(&ctx, StoreRequest::new("user", "billing question").in_session(s))
        .await
        .expect("durable write is reported as success");

    assert!(stored.window_error.is_some());
    assert!(stored.window_entry.is_none());
    assert!(stored.embedded);
    let history = engine.get_session_history(&ctx, s, 10, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, stored.episode.id);
}

#[tokio::test]
async fn test_builder_rejects_invalid_config() {
    let build = |short: ShortTermConfig, retrieval: RetrievalConfig| {
        MemoryEngine::builder()
            .store(Arc::new(InMemoryEpisodicStore::new(ModelRegistry::single(MODEL, 3))))
            .embedder(Arc::new(KeywordEmbedder))
            .short_term(short)
            .retrieval(retrieval)
            .build()
    };

    let heavy_boosts = RetrievalConfig {
        recency_weight: 0.2,
        keyword_weight: 0.1,
        ..Default::default()
    };
    assert!(matches!(
        build(short_term(4000, 0.8), heavy_boosts),
        Err(MemoryError::Config(_))
    ));
    assert!(matches!(
        build(short_term(0, 0.8), RetrievalConfig::default()),
        Err(MemoryError::Config(_))
    ));
    assert!(matches!(
        build(short_term(4000, 1.5), RetrievalConfig::default()),
        Err(MemoryError::Config(_))
    ));
    assert!(build(short_term(4000, 0.8), RetrievalConfig::default()).is_ok());
}

#[tokio::test]
async fn test_backfill_skips_episode_the_provider_rejects() {
    /// Refuses any text mentioning "poison", singly or in a batch.
    struct PickyEmbedder;

    #[async_trait]
    impl EmbeddingProvider for PickyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text.contains("poison") {
                return Err(EmbeddingError::Api {
                    code: 400,
                    message: "input rejected".to_string(),
                });
            }
            Ok(keyword_vector(text))
        }
        fn model(&self) -> &str {
            MODEL
        }
        fn dimensions(&self) -> usize {
            3
        }
        fn name(&self) -> &str {
            "picky"
        }
    }

    let h = harness_with(short_term(4000, 0.8), EmbedOnStore::Sync, Arc::new(PickyEmbedder));
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let poison = h
        .engine
        .store(&ctx, StoreRequest::new("user", "poison pill"))
        .await
        .unwrap();
    assert!(!poison.embedded);

    // later episodes that also missed their store-time embedding
    h.store
        .put_episode(
            ctx.org_id,
            remembr_core::NewEpisode {
                scope: ctx.scope(),
                session_id: None,
                role: "user".to_string(),
                content: "billing question".to_string(),
                tags: vec![],
                metadata: serde_json::json!({}),
                token_count: 2,
            },
        )
        .await
        .unwrap();

    let first = h.engine.backfill_embeddings(10).await.unwrap();
    assert_eq!(first.embedded, 1);
    assert_eq!(first.skipped, 1);

    let second = h.engine.backfill_embeddings(10).await.unwrap();
    assert_eq!(second.embedded + second.skipped + second.failed, 0);
}

// ------------------------------------------------------------------
// Replay and unified query
// ------------------------------------------------------------------

#[tokio::test]
async fn test_replay_session_is_oldest_first_and_complete() {
    let h = harness();
    let org = Uuid::new_v4();
    let ctx = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);
    let s = new_session(&h.engine, &ctx).await;

    for i in 0..5 {
        h.engine
            .store(&ctx, StoreRequest::new("user", format!("turn {}", i)).in_session(s))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let replay = h.engine.replay_session(&ctx, s).await.unwrap();
    let contents: Vec<&str> = replay.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(contents, vec!["turn 0", "turn 1", "turn 2", "turn 3", "turn 4"]);

    let stranger = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);
    assert!(matches!(
        h.engine.replay_session(&stranger, s).await,
        Err(MemoryError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_reconstruct_state_at_point_in_time() {
    let h = harness();
    let org = Uuid::new_v4();
    let alice = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);
    let bob = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);

    let early = h
        .engine
        .store(&alice, StoreRequest::new("user", "early"))
        .await
        .unwrap();
    h.engine
        .store(&bob, StoreRequest::new("user", "someone else"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let cutoff = chrono::Utc::now();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let late = h
        .engine
        .store(&alice, StoreRequest::new("user", "late"))
        .await
        .unwrap();

    let then = h.engine.reconstruct_state_at(&alice, cutoff).await.unwrap();
    assert_eq!(then.iter().map(|e| e.id).collect::<Vec<_>>(), vec![early.episode.id]);

    // the bound is inclusive
    let now = h
        .engine
        .reconstruct_state_at(&alice, late.episode.created_at)
        .await
        .unwrap();
    assert_eq!(
        now.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![early.episode.id, late.episode.id]
    );

    let admin = h
        .engine
        .reconstruct_state_at(&TenancyContext::org_admin(org), cutoff)
        .await
        .unwrap();
    assert_eq!(admin.len(), 2);
}

#[tokio::test]
async fn test_query_merges_window_and_episodes() {
    let h = harness();
    let ctx = TenancyContext::org_admin(Uuid::new_v4());
    let s = new_session(&h.engine, &ctx).await;

    h.engine
        .store(&ctx, StoreRequest::new("user", "what does the subscription cost").in_session(s))
        .await
        .unwrap();
    h.engine
        .store(&ctx, StoreRequest::new("assistant", "it is sunny today").in_session(s))
        .await
        .unwrap();
    h.engine
        .store(&ctx, StoreRequest::new("user", "billing plan changed last month"))
        .await
        .unwrap();

    let search = SearchRequest::new("subscription").session(s).limit(10);
    let result = h
        .engine
        .query(&ctx, &MemoryQuery::new(search.clone()), &CancellationToken::new())
        .await
        .unwrap();

    // only the window entry containing the query text qualifies
    assert_eq!(result.short_term.len(), 1);
    assert_eq!(result.short_term[0].entry.content, "what does the subscription cost");
    // the session's durable episodes come back from the episodic side
    assert!(!result.episodes.is_empty());
    assert!(result.episodes.iter().all(|hit| hit.episode.session_id == Some(s)));
    assert_eq!(result.total, result.short_term.len() + result.episodes.len());

    let episodic_only = h
        .engine
        .query(
            &ctx,
            &MemoryQuery::new(search.clone()).short_term(false),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(episodic_only.short_term.is_empty());

    let window_only = h
        .engine
        .query(&ctx, &MemoryQuery::new(search.limit(1)).episodic(false), &CancellationToken::new())
        .await
        .unwrap();
    assert!(window_only.episodes.is_empty());
    assert_eq!(window_only.total, 1);

    let stranger = TenancyContext::org_admin(Uuid::new_v4());
    assert!(matches!(
        h.engine
            .query(&stranger, &MemoryQuery::new(SearchRequest::new("x").session(s)), &CancellationToken::new())
            .await,
        Err(MemoryError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_search_limit_counts_only_owned_episodes() {
    let h = harness();
    let org = Uuid::new_v4();
    let alice = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);
    let bob = TenancyContext::from_identity(org, Some(Uuid::new_v4()), None);

    let mine = h
        .engine
        .store(&alice, StoreRequest::new("user", "my subscription").tags(["billing"]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    for i in 0..3 {
        h.engine
            .store(&bob, StoreRequest::new("user", format!("bob subscription {}", i)).tags(["billing"]))
            .await
            .unwrap();
    }

    for mode in [SearchMode::FilterOnly, SearchMode::Hybrid] {
        let request = SearchRequest::new("subscription")
            .tags(vec!["billing".to_string()])
            .mode(mode)
            .limit(2);
        let response = h
            .engine
            .search(&alice, &request, &CancellationToken::new())
            .await
            .unwrap();
        let ids: Vec<Uuid> = response.results.iter().map(|r| r.episode.id).collect();
        assert_eq!(ids, vec![mine.episode.id], "mode {:?}", mode);
        assert_eq!(response.total, 1);
    }
}
