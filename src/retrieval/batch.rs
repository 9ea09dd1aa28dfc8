use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::index::{normalize, EmbeddingIndex, IndexEntry, IndexFile, INDEX_VERSION};
use crate::embedding::EmbeddingProvider;
use crate::error::RetrievalError;
use crate::events::{emit, CoreEvent, EventSender};
use crate::session::{read_json, write_json_atomic, SessionDirs};
use crate::store::page::{content_hash, list_page_ids, page_mtime, read_page, write_page};
use crate::summarize::Summarizer;

/// Transient manifest `pages/batch-progress.json`. Exists only while a
/// batch is in flight (or was interrupted); completion deletes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub started_at: DateTime<Utc>,
    pub completed_page_ids: Vec<String>,
    pub hashes: HashMap<String, String>,
}

impl BatchProgress {
    fn fresh() -> Self {
        Self {
            started_at: Utc::now(),
            completed_page_ids: Vec::new(),
            hashes: HashMap::new(),
        }
    }
}

/// What a finished (or cancelled) batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub summarized: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

/// Activity signal from the agent loop. The batch yields between pages
/// whenever the agent is busy.
#[async_trait]
pub trait IdleGate: Send + Sync {
    fn should_yield(&self) -> bool;

    /// Resolve once the agent is idle again.
    async fn wait_for_idle(&self);
}

/// Gate that never yields. For tests and offline tooling.
pub struct AlwaysIdle;

#[async_trait]
impl IdleGate for AlwaysIdle {
    fn should_yield(&self) -> bool {
        false
    }

    async fn wait_for_idle(&self) {}
}

/// One batch per process, across all sessions.
static BATCH_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Long-running, interruptible job that re-summarizes stale pages and
/// atomically replaces the live embedding index via a shadow file.
pub struct BatchResummarizer {
    dirs: SessionDirs,
    summarizer: Arc<dyn Summarizer>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<EmbeddingIndex>,
    gate: Arc<dyn IdleGate>,
    cancel: CancellationToken,
    checkpoint_every: usize,
    events: Option<EventSender>,
}

impl BatchResummarizer {
    pub fn new(
        dirs: SessionDirs,
        summarizer: Arc<dyn Summarizer>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<EmbeddingIndex>,
    ) -> Self {
        Self {
            dirs,
            summarizer,
            embedder,
            index,
            gate: Arc::new(AlwaysIdle),
            cancel: CancellationToken::new(),
            checkpoint_every: 5,
            events: None,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn IdleGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_checkpoint_every(mut self, n: usize) -> Self {
        self.checkpoint_every = n.max(1);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Run the batch. `None` when another batch already holds the
    /// process-wide slot. `force` re-summarizes pages even when their
    /// content hash is unchanged.
    pub async fn run(&self, force: bool) -> Result<Option<BatchOutcome>, RetrievalError> {
        if BATCH_ACTIVE.swap(true, Ordering::SeqCst) {
            warn!("batch re-summarizer already running, no-op");
            return Ok(None);
        }
        let result = self.run_inner(force).await;
        BATCH_ACTIVE.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn run_inner(&self, force: bool) -> Result<BatchOutcome, RetrievalError> {
        self.dirs.ensure().await?;
        let mut progress: BatchProgress = read_json(&self.dirs.batch_progress_path())
            .await
            .unwrap_or_else(BatchProgress::fresh);
        let resumed = !progress.completed_page_ids.is_empty();
        let live = self.index.snapshot();
        let ids = list_page_ids(&self.dirs)
            .await
            .map_err(|e| RetrievalError::Index(e.to_string()))?;
        info!(pages = ids.len(), resumed, force, "batch re-summarization starting");

        let mut shadow: HashMap<String, IndexEntry> = HashMap::new();
        let mut outcome = BatchOutcome::default();

        for (n, id) in ids.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(done = n, total = ids.len(), "batch cancelled, persisting progress");
                self.persist_checkpoint(&progress, &shadow).await?;
                outcome.cancelled = true;
                return Ok(outcome);
            }
            if self.gate.should_yield() {
                debug!("agent active, batch yielding");
                self.gate.wait_for_idle().await;
            }

            let Some(page) = read_page(&self.dirs, id).await else {
                warn!(page = %id, "unreadable page skipped by batch");
                continue;
            };
            let hash = content_hash(&page.content);

            let manifest_done = progress.completed_page_ids.iter().any(|p| p == id)
                && progress.hashes.get(id) == Some(&hash);
            let live_fresh = live.get(id).is_some_and(|e| e.content_hash == hash);
            if !force && (manifest_done || live_fresh) {
                if let Some(entry) = live.get(id) {
                    shadow.insert(id.clone(), entry.clone());
                }
                outcome.skipped += 1;
                continue;
            }

            let entry = self.resummarize_page(id, hash.clone()).await?;
            shadow.insert(id.clone(), entry);
            outcome.summarized += 1;

            if !progress.completed_page_ids.iter().any(|p| p == id) {
                progress.completed_page_ids.push(id.clone());
            }
            progress.hashes.insert(id.clone(), hash);

            if (n + 1) % self.checkpoint_every == 0 {
                self.persist_checkpoint(&progress, &shadow).await?;
            }
        }

        // Finalize: shadow to disk, atomic swap, manifest gone.
        self.persist_shadow(&shadow).await?;
        tokio::fs::rename(
            self.dirs.embeddings_shadow_path(),
            self.dirs.embeddings_path(),
        )
        .await?;
        match tokio::fs::remove_file(self.dirs.batch_progress_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.index.reload().await?;

        info!(
            summarized = outcome.summarized,
            skipped = outcome.skipped,
            "batch re-summarization complete"
        );
        emit(
            &self.events,
            CoreEvent::BatchFinished {
                summarized: outcome.summarized,
                skipped: outcome.skipped,
            },
        );
        Ok(outcome)
    }

    /// Summarize one page, with a single freshness retry if the page file
    /// moved underneath the job mid-summary. The updated summary is written
    /// back to the page file; embedding failures degrade to a zero vector
    /// with a warning.
    async fn resummarize_page(
        &self,
        id: &str,
        hash: String,
    ) -> Result<IndexEntry, RetrievalError> {
        let path = self.dirs.page_path(id);
        let mut attempts = 0;
        loop {
            let Some(page) = read_page(&self.dirs, id).await else {
                return Err(RetrievalError::Index(format!("page {id} vanished mid-batch")));
            };
            let mtime_before = page_mtime(&path).await;
            let summary = self.summarizer.summarize(&page.content, &page.label).await;

            let embedding = match self.embedder.embed(&[summary.clone()]).await {
                Ok(mut vectors) => normalize(vectors.pop().unwrap_or_default()),
                Err(e) => {
                    warn!(page = %id, error = %e, "embed failed, storing zero vector");
                    vec![0.0; self.embedder.dimension()]
                }
            };

            let mtime_after = page_mtime(&path).await;
            if mtime_after != mtime_before && attempts == 0 {
                debug!(page = %id, "page changed during batch, re-summarizing once");
                attempts = 1;
                continue;
            }

            let mut updated = page;
            updated.summary = summary.clone();
            updated.content_hash = content_hash(&updated.content);
            write_page(&self.dirs, &updated)
                .await
                .map_err(|e| RetrievalError::Index(e.to_string()))?;

            return Ok(IndexEntry {
                page_id: id.to_string(),
                embedding,
                label: updated.label,
                summary_excerpt: summary.chars().take(200).collect(),
                created_at: Utc::now(),
                content_hash: hash,
            });
        }
    }

    async fn persist_checkpoint(
        &self,
        progress: &BatchProgress,
        shadow: &HashMap<String, IndexEntry>,
    ) -> Result<(), RetrievalError> {
        write_json_atomic(&self.dirs.batch_progress_path(), progress).await?;
        self.persist_shadow(shadow).await
    }

    async fn persist_shadow(
        &self,
        shadow: &HashMap<String, IndexEntry>,
    ) -> Result<(), RetrievalError> {
        let file = IndexFile {
            version: INDEX_VERSION,
            embedder: self.index.fingerprint(),
            entries: shadow.clone(),
        };
        write_json_atomic(&self.dirs.embeddings_shadow_path(), &file)
            .await
            .map_err(RetrievalError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::index::tests::KeywordEmbedder;
    use crate::store::page::Page;
    use crate::summarize::FixedSummarizer;
    use crate::types::{Message, Role};
    use std::sync::atomic::AtomicUsize;

    /// The batch slot is process-wide; tests serialize on this so parallel
    /// test threads cannot steal each other's slot.
    static TEST_SLOT: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    async fn seed_pages(dirs: &SessionDirs, n: usize) -> Vec<String> {
        dirs.ensure().await.unwrap();
        let mut ids = Vec::new();
        for i in 0..n {
            let page = Page::from_group(
                Role::User,
                &[Message::user(format!("topic {i}: websocket and database notes"))],
                format!("initial summary {i}"),
            );
            write_page(dirs, &page).await.unwrap();
            ids.push(page.id);
        }
        ids
    }

    async fn batch_for(dir: &std::path::Path) -> (Arc<EmbeddingIndex>, BatchResummarizer) {
        let dirs = SessionDirs::new(dir);
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(KeywordEmbedder::new());
        let index = Arc::new(
            EmbeddingIndex::open(dirs.clone(), Arc::clone(&embedder))
                .await
                .unwrap(),
        );
        let batch = BatchResummarizer::new(
            dirs,
            Arc::new(FixedSummarizer::new("batch summary")),
            embedder,
            Arc::clone(&index),
        );
        (index, batch)
    }

    #[tokio::test]
    async fn skip_unchanged_pages() {
        // Scenario S4.
        let _slot = TEST_SLOT.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let dirs = SessionDirs::new(dir.path());
        let ids = seed_pages(&dirs, 3).await;

        let (index, batch) = batch_for(dir.path()).await;

        let first = batch.run(false).await.unwrap().unwrap();
        assert_eq!(first.summarized, 3);
        assert_eq!(first.skipped, 0);
        assert_eq!(index.len(), 3);

        let second = batch.run(false).await.unwrap().unwrap();
        assert_eq!(second.summarized, 0);
        assert_eq!(second.skipped, 3);

        // Modify one page's bytes.
        let mut page = read_page(&dirs, &ids[1]).await.unwrap();
        page.content.push_str(" modified");
        write_page(&dirs, &page).await.unwrap();

        let third = batch.run(false).await.unwrap().unwrap();
        assert_eq!(third.summarized, 1);
        assert_eq!(third.skipped, 2);
    }

    #[tokio::test]
    async fn force_resummarizes_everything() {
        let _slot = TEST_SLOT.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let dirs = SessionDirs::new(dir.path());
        seed_pages(&dirs, 2).await;

        let (_index, batch) = batch_for(dir.path()).await;
        batch.run(false).await.unwrap().unwrap();
        let again = batch.run(true).await.unwrap().unwrap();
        assert_eq!(again.summarized, 2);
    }

    #[tokio::test]
    async fn batch_updates_page_summaries() {
        let _slot = TEST_SLOT.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let dirs = SessionDirs::new(dir.path());
        let ids = seed_pages(&dirs, 1).await;

        let (_index, batch) = batch_for(dir.path()).await;
        batch.run(false).await.unwrap().unwrap();

        let page = read_page(&dirs, &ids[0]).await.unwrap();
        assert!(page.summary.starts_with("batch summary"));
        // Manifest deleted, shadow swapped to live.
        assert!(tokio::fs::metadata(dirs.batch_progress_path()).await.is_err());
        assert!(tokio::fs::metadata(dirs.embeddings_shadow_path())
            .await
            .is_err());
        assert!(tokio::fs::metadata(dirs.embeddings_path()).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_persists_progress_and_keeps_live_index() {
        // Property 7, interruption half: cancelling leaves the pre-batch
        // index live and the manifest on disk for resume.
        let _slot = TEST_SLOT.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let dirs = SessionDirs::new(dir.path());
        seed_pages(&dirs, 3).await;

        let (index, batch) = batch_for(dir.path()).await;
        batch.run(false).await.unwrap().unwrap();
        let live_before = index.len();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (index2, batch2) = batch_for(dir.path()).await;
        let out = batch2
            .with_cancel(cancel)
            .run(true)
            .await
            .unwrap()
            .unwrap();
        assert!(out.cancelled);
        assert_eq!(index2.len(), live_before);
        // Progress manifest persisted for resume; incomplete shadow exists
        // until the next index open discards it.
        assert!(tokio::fs::metadata(dirs.batch_progress_path()).await.is_ok());

        let (index3, _batch3) = batch_for(dir.path()).await;
        assert_eq!(index3.len(), live_before);
        assert!(tokio::fs::metadata(dirs.embeddings_shadow_path())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn yields_to_the_gate_between_pages() {
        let _slot = TEST_SLOT.lock().await;

        struct CountingGate {
            yields_left: AtomicUsize,
            waited: AtomicUsize,
        }

        #[async_trait]
        impl IdleGate for CountingGate {
            fn should_yield(&self) -> bool {
                self.yields_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            }

            async fn wait_for_idle(&self) {
                self.waited.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let dirs = SessionDirs::new(dir.path());
        seed_pages(&dirs, 3).await;

        let gate = Arc::new(CountingGate {
            yields_left: AtomicUsize::new(2),
            waited: AtomicUsize::new(0),
        });
        let (_index, batch) = batch_for(dir.path()).await;
        batch
            .with_gate(Arc::clone(&gate) as Arc<dyn IdleGate>)
            .run(false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gate.waited.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_concurrent_batch_is_a_noop() {
        let _slot = TEST_SLOT.lock().await;

        struct SlowSummarizer;

        #[async_trait]
        impl Summarizer for SlowSummarizer {
            async fn summarize(&self, _text: &str, _label: &str) -> String {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                "slow".into()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let dirs = SessionDirs::new(dir.path());
        seed_pages(&dirs, 2).await;

        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(KeywordEmbedder::new());
        let index = Arc::new(
            EmbeddingIndex::open(dirs.clone(), Arc::clone(&embedder))
                .await
                .unwrap(),
        );
        let slow = Arc::new(BatchResummarizer::new(
            dirs.clone(),
            Arc::new(SlowSummarizer),
            Arc::clone(&embedder),
            Arc::clone(&index),
        ));

        let first = tokio::spawn({
            let slow = Arc::clone(&slow);
            async move { slow.run(false).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let second = slow.run(false).await.unwrap();
        assert!(second.is_none(), "second batch should no-op");
        assert!(first.await.unwrap().unwrap().is_some());
    }
}
