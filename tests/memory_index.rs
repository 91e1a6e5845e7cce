//! End-to-end tests of the memory index through its public API.
//!
//! Cards live in a real `FsCardStore` inside a temp dir. Embeddings come
//! from a deterministic bag-of-words embedder, and the index backend is the
//! on-disk one wrapped to count how often an index gets dropped (one drop
//! per rebuild).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cardbase::cards::{render_card, CardSource, FsCardStore};
use cardbase::config::Config;
use cardbase::consistency::{Consistency, StaleReason};
use cardbase::context::ContextRequest;
use cardbase::embedding::{DisabledProvider, EmbeddingProvider};
use cardbase::engine::MemoryIndex;
use cardbase::error::{IndexError, Result};
use cardbase::metadata::compute_hash;
use cardbase::models::{ContextPolicy, IndexEntry, MemoryCard, Scope};
use cardbase::store::local::LocalIndexBackend;
use cardbase::store::{IndexBackend, Neighbor};
use tempfile::TempDir;

// ─── Test Embedder ──────────────────────────────────────────────────

const DIMS: usize = 64;

/// Hashes each lowercase word into one of `DIMS` buckets.
struct BagOfWords {
    model: String,
}

impl BagOfWords {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
        }
    }
}

fn bucket(word: &str) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % DIMS as u64) as usize
}

#[async_trait]
impl EmbeddingProvider for BagOfWords {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        DIMS
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0; DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            vector[bucket(&word.to_lowercase())] += 1.0;
        }
        Ok(vector)
    }
}

// ─── Counting Backend ───────────────────────────────────────────────

/// On-disk backend that counts `drop_index` calls and lingers inside them
/// so concurrent callers get a chance to interleave.
struct CountingBackend {
    inner: LocalIndexBackend,
    drops: AtomicUsize,
}

impl CountingBackend {
    fn new(root: &Path) -> Self {
        Self {
            inner: LocalIndexBackend::new(root),
            drops: AtomicUsize::new(0),
        }
    }

    fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IndexBackend for CountingBackend {
    async fn open(&self, scope: &Scope) -> Result<()> {
        self.inner.open(scope).await
    }

    async fn exists(&self, scope: &Scope) -> Result<bool> {
        self.inner.exists(scope).await
    }

    async fn append(&self, scope: &Scope, entries: Vec<IndexEntry>) -> Result<()> {
        self.inner.append(scope, entries).await
    }

    async fn nearest(&self, scope: &Scope, vector: &[f32], limit: usize) -> Result<Vec<Neighbor>> {
        self.inner.nearest(scope, vector, limit).await
    }

    async fn remove_card(&self, scope: &Scope, card_name: &str) -> Result<usize> {
        self.inner.remove_card(scope, card_name).await
    }

    async fn drop_index(&self, scope: &Scope) -> Result<()> {
        self.drops.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.drop_index(scope).await
    }

    async fn count(&self, scope: &Scope) -> Result<usize> {
        self.inner.count(scope).await
    }
}

// ─── Harness ────────────────────────────────────────────────────────

struct Harness {
    _tmp: TempDir,
    cards: Arc<FsCardStore>,
    backend: Arc<CountingBackend>,
    index: MemoryIndex,
}

async fn harness_with(embedder: Arc<dyn EmbeddingProvider>) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_root(tmp.path());
    let cards = Arc::new(FsCardStore::new(config.storage.knowledge_dir()));
    let backend = Arc::new(CountingBackend::new(&config.storage.index_dir()));
    let index = MemoryIndex::with_backend(config, cards.clone(), embedder, backend.clone()).await;
    Harness {
        _tmp: tmp,
        cards,
        backend,
        index,
    }
}

async fn harness() -> Harness {
    harness_with(Arc::new(BagOfWords::new("bow-v1"))).await
}

fn card(name: &str, title: &str, content: &str) -> MemoryCard {
    MemoryCard {
        name: name.to_string(),
        title: title.to_string(),
        content: content.to_string(),
        context_policy: ContextPolicy::Auto,
        tags: vec![],
    }
}

impl Harness {
    async fn save(&self, scope: &Scope, card: &MemoryCard) {
        self.cards.save_card(scope, card).await.unwrap();
    }

    async fn file_hash(&self, scope: &Scope, name: &str) -> String {
        let raw = self.cards.card_content(scope, name).await.unwrap().unwrap();
        compute_hash(&raw)
    }

    fn index_file(&self, scope: &Scope) -> PathBuf {
        self.index
            .config()
            .storage
            .index_dir()
            .join(scope.relative_dir())
            .join("index.json")
    }

    /// A fresh index over the same directories, as after a process restart.
    async fn restart(&self) -> (Arc<CountingBackend>, MemoryIndex) {
        let config = self.index.config().clone();
        let backend = Arc::new(CountingBackend::new(&config.storage.index_dir()));
        let index = MemoryIndex::with_backend(
            config,
            self.cards.clone(),
            Arc::new(BagOfWords::new("bow-v1")),
            backend.clone(),
        )
        .await;
        (backend, index)
    }

    async fn assert_consistent(&self, scope: &Scope) {
        let cards = self.cards.list_cards(scope).await.unwrap();
        let metadata = self
            .index
            .manager()
            .tracker()
            .load(scope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metadata.file_hashes.len(), cards.len());
        for card in &cards {
            assert_eq!(
                metadata.file_hashes[&card.name],
                self.file_hash(scope, &card.name).await,
                "hash of '{}'",
                card.name
            );
        }
        assert_eq!(
            self.index.manager().validate(scope).await.unwrap(),
            Consistency::Consistent
        );
    }
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_end_to_end_pkce_search() {
    let h = harness().await;
    let scope = Scope::Global;
    let body = "OAuth flow uses PKCE to protect the authorization code exchange. ".repeat(40);
    let auth = card("auth-notes", "Auth notes", &body);
    h.save(&scope, &auth).await;

    let chunks = h.index.index_document(&scope, &auth).await.unwrap();
    assert!(chunks > 1, "content longer than one chunk should split");

    let results = h.index.search(&scope, "PKCE", Some(5)).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].card.name, "auth-notes");
    assert!(results[0].relevance_score > 0.0);
    assert!(!results[0].excerpts.is_empty());
    assert!(results[0].excerpts.len() <= 3);
    assert!(results[0]
        .excerpts
        .windows(2)
        .all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn test_scope_isolation_with_same_card_name() {
    let h = harness().await;
    let global = Scope::Global;
    let initiative = Scope::parse("initiative-1").unwrap();

    let g = card("x", "Global x", "apples oranges pears");
    let i = card("x", "Initiative x", "zebra giraffe lion");
    h.save(&global, &g).await;
    h.save(&initiative, &i).await;
    h.index.index_document(&global, &g).await.unwrap();
    h.index.index_document(&initiative, &i).await.unwrap();

    for result in h.index.search(&global, "zebra giraffe", Some(5)).await {
        assert_eq!(result.card.title, "Global x");
        assert!(result.excerpts.iter().all(|e| !e.text.contains("zebra")));
    }
    for result in h.index.search(&initiative, "apples oranges", Some(5)).await {
        assert_eq!(result.card.title, "Initiative x");
        assert!(result.excerpts.iter().all(|e| !e.text.contains("apples")));
    }

    let top = h.index.search(&initiative, "zebra giraffe", Some(5)).await;
    assert_eq!(top[0].card.title, "Initiative x");
}

#[tokio::test]
async fn test_text_fallback_has_same_shape() {
    let scope = Scope::Global;
    let auth = card("auth-notes", "Auth notes", "The OAuth flow uses PKCE.");
    let other = card("deploy", "Deploy", "Kubernetes rollout steps.");

    let semantic = harness().await;
    semantic.save(&scope, &auth).await;
    semantic.save(&scope, &other).await;
    semantic.index.ensure_scope_consistent(&scope).await;
    let with_vectors = semantic.index.search(&scope, "uses PKCE", Some(5)).await;

    let fallback = harness_with(Arc::new(DisabledProvider)).await;
    fallback.save(&scope, &auth).await;
    fallback.save(&scope, &other).await;
    let with_text = fallback.index.search(&scope, "uses PKCE", Some(5)).await;

    assert_eq!(with_text.len(), 1, "cards scoring zero are dropped");
    for results in [&with_vectors, &with_text] {
        let top = &results[0];
        assert_eq!(top.card.name, "auth-notes");
        assert!(top.relevance_score > 0.0);
        assert!(!top.excerpts.is_empty());
        assert_eq!(top.excerpts[0].total_chunks, 1);
    }
    // Whole-query match (+10) and one hit each for "uses" and "pkce" (+2).
    assert!((with_text[0].relevance_score - 1.2).abs() < 1e-9);
    assert_eq!(fallback.backend.drops(), 0);
}

#[tokio::test]
async fn test_model_change_triggers_rebuild() {
    let h = harness().await;
    let scope = Scope::Global;
    h.save(&scope, &card("a", "A", "alpha content")).await;
    h.index.rebuild(&scope).await.unwrap();
    assert_eq!(h.backend.drops(), 1);

    let tracker = h.index.manager().tracker();
    let mut metadata = tracker.load(&scope).await.unwrap().unwrap();
    metadata.embedding_model = "old-model".to_string();
    tracker.save(&scope, &metadata).await.unwrap();

    assert_eq!(
        h.index.manager().validate(&scope).await.unwrap(),
        Consistency::Stale(StaleReason::ModelChanged {
            recorded: "old-model".into(),
            current: "bow-v1".into()
        })
    );

    h.index.ensure_scope_consistent(&scope).await;
    assert_eq!(h.backend.drops(), 2);
    let rebuilt = tracker.load(&scope).await.unwrap().unwrap();
    assert_eq!(rebuilt.embedding_model, "bow-v1");
    assert_eq!(h.index.manager().store().entry_count(&scope).await.unwrap(), 1);
}

#[tokio::test]
async fn test_content_drift_triggers_rebuild() {
    let h = harness().await;
    let scope = Scope::Global;
    h.save(&scope, &card("a", "A", "first version")).await;
    h.save(&scope, &card("b", "B", "unchanged")).await;
    h.index.ensure_scope_consistent(&scope).await;
    assert_eq!(h.backend.drops(), 1);

    // Consistent scope: another check is a no-op.
    h.index.ensure_scope_consistent(&scope).await;
    assert_eq!(h.backend.drops(), 1);

    // Edited behind the index's back.
    h.save(&scope, &card("a", "A", "second version")).await;
    h.index.ensure_scope_consistent(&scope).await;
    assert_eq!(h.backend.drops(), 2);

    let metadata = h.index.manager().tracker().load(&scope).await.unwrap().unwrap();
    assert_eq!(metadata.file_hashes["a"], h.file_hash(&scope, "a").await);
    assert_eq!(metadata.file_hashes["b"], h.file_hash(&scope, "b").await);
    assert_eq!(
        h.index.manager().validate(&scope).await.unwrap(),
        Consistency::Consistent
    );
}

#[tokio::test]
async fn test_new_and_deleted_cards_are_detected() {
    let h = harness().await;
    let scope = Scope::Global;
    h.save(&scope, &card("a", "A", "alpha")).await;
    h.index.rebuild(&scope).await.unwrap();

    h.save(&scope, &card("b", "B", "beta")).await;
    assert!(matches!(
        h.index.manager().validate(&scope).await.unwrap(),
        Consistency::Stale(StaleReason::CardCountChanged { recorded: 1, current: 2 })
    ));

    h.index.rebuild(&scope).await.unwrap();
    h.cards.remove_card(&scope, "a").await.unwrap();
    h.save(&scope, &card("c", "C", "gamma")).await;
    assert_eq!(
        h.index.manager().validate(&scope).await.unwrap(),
        Consistency::Stale(StaleReason::UnrecordedCard("c".into()))
    );
}

#[tokio::test]
async fn test_concurrent_ensure_rebuilds_once() {
    let h = harness().await;
    let scope = Scope::Global;
    for i in 0..4 {
        h.save(&scope, &card(&format!("card-{}", i), "T", "some shared words"))
            .await;
    }

    tokio::join!(
        h.index.ensure_scope_consistent(&scope),
        h.index.ensure_scope_consistent(&scope)
    );

    assert_eq!(h.backend.drops(), 1);
    assert_eq!(
        h.index.manager().validate(&scope).await.unwrap(),
        Consistency::Consistent
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_ensure_on_multithreaded_runtime() {
    let h = Arc::new(harness().await);
    let scope = Scope::Global;
    h.save(&scope, &card("a", "A", "alpha")).await;

    let first = {
        let h = Arc::clone(&h);
        let scope = scope.clone();
        tokio::spawn(async move { h.index.ensure_scope_consistent(&scope).await })
    };
    let second = {
        let h = Arc::clone(&h);
        let scope = scope.clone();
        tokio::spawn(async move { h.index.ensure_scope_consistent(&scope).await })
    };
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(h.backend.drops(), 1);
}

#[tokio::test]
async fn test_removal_scenario() {
    let h = harness().await;
    let scope = Scope::Global;
    let a = card("a", "Apples", "apples apples orchards");
    let b = card("b", "Bananas", "bananas plantations tropics");
    h.save(&scope, &a).await;
    h.save(&scope, &b).await;
    h.index.index_document(&scope, &a).await.unwrap();
    h.index.index_document(&scope, &b).await.unwrap();
    let drops = h.backend.drops();

    h.cards.remove_card(&scope, "a").await.unwrap();
    let removed = h
        .index
        .manager()
        .store()
        .remove_chunks_for_document(&scope, "a")
        .await
        .unwrap();
    assert!(removed > 0);
    assert!(h.index.remove_document_from_index(&scope, "a").await.unwrap());
    assert!(!h.index.remove_document_from_index(&scope, "a").await.unwrap());

    for query in ["apples orchards", "bananas tropics"] {
        let results = h.index.search(&scope, query, Some(5)).await;
        assert!(results.iter().all(|r| r.card.name != "a"));
    }
    let results = h.index.search(&scope, "bananas tropics", Some(5)).await;
    assert_eq!(results[0].card.name, "b");
    assert_eq!(h.backend.drops(), drops, "removal must not force a rebuild");
}

#[tokio::test]
async fn test_reindex_replaces_previous_chunks() {
    let h = harness().await;
    let scope = Scope::Global;
    let long = card("a", "A", &"word ".repeat(1000));
    h.save(&scope, &long).await;
    let first = h.index.index_document(&scope, &long).await.unwrap();
    assert!(first > 1);

    let short = card("a", "A", "just a few words now");
    h.save(&scope, &short).await;
    let second = h.index.index_document(&scope, &short).await.unwrap();
    assert_eq!(second, 1);
    assert_eq!(h.index.manager().store().entry_count(&scope).await.unwrap(), 1);

    let metadata = h.index.manager().tracker().load(&scope).await.unwrap().unwrap();
    assert_eq!(metadata.file_hashes["a"], h.file_hash(&scope, "a").await);
}

#[tokio::test]
async fn test_disabled_provider_degrades() {
    let h = harness_with(Arc::new(DisabledProvider)).await;
    let scope = Scope::Global;
    let a = card("a", "A", "alpha");
    h.save(&scope, &a).await;

    h.index.ensure_scope_consistent(&scope).await;
    assert!(h.index.manager().tracker().load(&scope).await.unwrap().is_none());

    let err = h.index.index_document(&scope, &a).await.unwrap_err();
    assert!(matches!(err, IndexError::EmbeddingUnavailable(_)));
    let err = h.index.rebuild(&scope).await.unwrap_err();
    assert!(matches!(err, IndexError::EmbeddingUnavailable(_)));
    assert_eq!(h.backend.drops(), 0);
}

#[tokio::test]
async fn test_status_and_shutdown() {
    let h = harness().await;
    let scope = Scope::parse("initiative-7").unwrap();
    h.save(&scope, &card("a", "A", "alpha")).await;

    let before = h.index.status(&scope).await.unwrap();
    assert!(before.metadata.is_none());
    assert_eq!(
        before.consistency,
        Consistency::Stale(StaleReason::MissingMetadata)
    );

    let report = h.index.rebuild(&scope).await.unwrap();
    assert_eq!(report.cards, 1);
    assert_eq!(report.chunks, 1);

    let after = h.index.status(&scope).await.unwrap();
    assert_eq!(after.consistency, Consistency::Consistent);
    assert_eq!(after.entries, 1);
    assert!(!after.rebuilding);
    assert!(after.embedder_ready);

    let Harness { index, _tmp, .. } = h;
    index.shutdown().await;
}

#[tokio::test]
async fn test_context_cards_always_then_semantic() {
    let h = harness().await;
    let scope = Scope::Global;
    let mut rules = card("rules", "House rules", "always follow the style guide");
    rules.context_policy = ContextPolicy::Always;
    h.save(&scope, &rules).await;
    h.save(&scope, &card("db", "Database", "postgres migrations and indexes"))
        .await;
    h.save(&scope, &card("ui", "Frontend", "react components and styling"))
        .await;
    h.index.ensure_scope_consistent(&scope).await;

    let base = h
        .index
        .context_cards(&scope, &ContextRequest::default())
        .await
        .unwrap();
    assert_eq!(base.len(), 1);
    assert_eq!(base[0].name, "rules");

    let request = ContextRequest {
        include_all: false,
        semantic_queries: vec!["postgres migrations".to_string()],
    };
    let cards = h.index.context_cards(&scope, &request).await.unwrap();
    assert_eq!(cards[0].name, "rules");
    assert_eq!(cards[1].name, "db");
    assert_eq!(
        cards.iter().filter(|c| c.name == "rules").count(),
        1,
        "always cards are not repeated"
    );

    let all = h
        .index
        .context_cards(
            &scope,
            &ContextRequest {
                include_all: true,
                semantic_queries: vec![],
            },
        )
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_unlisted_card_files_do_not_keep_scope_stale() {
    let h = harness().await;
    let scope = Scope::Global;
    h.save(&scope, &card("good", "Good", "kept in the index")).await;
    let draft = render_card(&card("draft", "Draft", "editor scratch file")).unwrap();
    std::fs::write(h.cards.cards_dir(&scope).join(".draft.md"), draft).unwrap();

    for _ in 0..3 {
        h.index.ensure_scope_consistent(&scope).await;
    }
    assert_eq!(h.backend.drops(), 1);
    h.assert_consistent(&scope).await;
}

#[tokio::test]
async fn test_deleted_index_file_is_rebuilt() {
    let h = harness().await;
    let scope = Scope::parse("initiative-1").unwrap();
    h.save(&scope, &card("a", "Apples", "apples orchards")).await;
    h.index.rebuild(&scope).await.unwrap();
    assert_eq!(h.backend.drops(), 1);

    std::fs::remove_file(h.index_file(&scope)).unwrap();
    assert_eq!(
        h.index.manager().validate(&scope).await.unwrap(),
        Consistency::Stale(StaleReason::IndexMissing)
    );

    let results = h.index.search(&scope, "apples orchards", Some(5)).await;
    assert_eq!(h.backend.drops(), 2);
    assert_eq!(results[0].card.name, "a");
    assert!(h.index_file(&scope).exists());
    h.assert_consistent(&scope).await;
}

#[tokio::test]
async fn test_unreadable_index_file_is_rebuilt_after_restart() {
    let broken = [
        "{not json",
        r#"{"version":99,"entries":[]}"#,
        r#"{"version":1,"entries":[]}"#,
    ];
    for body in broken {
        let h = harness().await;
        let scope = Scope::Global;
        h.save(&scope, &card("a", "Apples", "apples orchards")).await;
        h.index.rebuild(&scope).await.unwrap();
        std::fs::write(h.index_file(&scope), body).unwrap();

        let (backend, index) = h.restart().await;
        assert!(
            matches!(
                index.manager().validate(&scope).await.unwrap(),
                Consistency::Stale(
                    StaleReason::IndexUnreadable(_) | StaleReason::IndexEmpty { recorded: 1 }
                )
            ),
            "index file {:?} should be stale",
            body
        );

        let results = index.search(&scope, "apples orchards", Some(5)).await;
        assert_eq!(backend.drops(), 1, "index file {:?}", body);
        assert_eq!(results[0].card.name, "a");
        assert_eq!(index.manager().store().entry_count(&scope).await.unwrap(), 1);
        assert_eq!(
            index.manager().validate(&scope).await.unwrap(),
            Consistency::Consistent
        );
    }
}

#[tokio::test]
async fn test_index_document_waits_for_running_rebuild() {
    let h = harness().await;
    let scope = Scope::Global;
    h.save(&scope, &card("a", "Apples", "apples orchards")).await;
    h.save(&scope, &card("b", "Bananas", "first draft")).await;
    let edited = card("b", "Bananas", "bananas plantations tropics");

    let (rebuilt, indexed) = tokio::join!(h.index.rebuild(&scope), async {
        // Lands while the rebuild is inside drop_index.
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.save(&scope, &edited).await;
        h.index.index_document(&scope, &edited).await
    });
    rebuilt.unwrap();
    assert_eq!(indexed.unwrap(), 1);

    assert_eq!(h.backend.drops(), 1);
    assert_eq!(h.index.manager().store().entry_count(&scope).await.unwrap(), 2);
    h.assert_consistent(&scope).await;
    // Exactly one copy of the edited card's chunk survived.
    let removed = h
        .index
        .manager()
        .store()
        .remove_chunks_for_document(&scope, "b")
        .await
        .unwrap();
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn test_remove_document_waits_for_running_rebuild() {
    let h = harness().await;
    let scope = Scope::Global;
    h.save(&scope, &card("a", "Apples", "apples orchards")).await;
    h.save(&scope, &card("b", "Bananas", "bananas plantations")).await;
    h.index.rebuild(&scope).await.unwrap();

    let (rebuilt, removed) = tokio::join!(h.index.rebuild(&scope), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.cards.remove_card(&scope, "a").await.unwrap();
        h.index.remove_document_from_index(&scope, "a").await
    });
    rebuilt.unwrap();
    removed.unwrap();

    assert_eq!(h.backend.drops(), 2);
    assert_eq!(h.index.manager().store().entry_count(&scope).await.unwrap(), 1);
    h.assert_consistent(&scope).await;
    let results = h.index.search(&scope, "apples orchards", Some(5)).await;
    assert!(results.iter().all(|r| r.card.name != "a"));
    assert_eq!(h.backend.drops(), 2);
}
