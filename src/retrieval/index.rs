use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::embedding::{EmbedderFingerprint, EmbeddingProvider};
use crate::error::RetrievalError;
use crate::session::{read_json, write_json_atomic, SessionDirs};
use crate::store::page::{list_page_ids, read_page};

/// One indexed page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub page_id: String,
    /// Unit-normalized.
    pub embedding: Vec<f32>,
    pub label: String,
    pub summary_excerpt: String,
    pub created_at: DateTime<Utc>,
    /// Hash of the page content the indexed summary was produced from.
    /// Drives the batch job's skip-unchanged check.
    #[serde(default)]
    pub content_hash: String,
}

/// On-disk shape of `pages/embeddings.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexFile {
    pub version: u32,
    pub embedder: EmbedderFingerprint,
    pub entries: HashMap<String, IndexEntry>,
}

pub const INDEX_VERSION: u32 = 1;

/// A search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub page_id: String,
    pub score: f32,
    pub label: String,
    pub summary_excerpt: String,
}

/// Results closer than this are near-duplicates; only the better one is
/// kept.
const DEDUP_SIMILARITY: f32 = 0.9;

/// Embedding index over page summaries. Mutations swap an immutable
/// snapshot; `search` and `missing_ids` read the snapshot without holding
/// any lock across the scan.
pub struct EmbeddingIndex {
    dirs: SessionDirs,
    embedder: Arc<dyn EmbeddingProvider>,
    entries: RwLock<Arc<HashMap<String, IndexEntry>>>,
}

impl EmbeddingIndex {
    /// Open the index for a session, running orphan-shadow recovery and
    /// discarding any stored entries from an incompatible embedder.
    pub async fn open(
        dirs: SessionDirs,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, RetrievalError> {
        dirs.ensure().await?;
        recover_orphan_shadow(&dirs).await?;

        let fingerprint = embedder.fingerprint();
        let entries = match read_json::<IndexFile>(&dirs.embeddings_path()).await {
            Some(file) if file.version == INDEX_VERSION && file.embedder == fingerprint => {
                file.entries
            }
            Some(file) => {
                warn!(
                    stored = ?file.embedder,
                    current = ?fingerprint,
                    "embedder fingerprint mismatch, discarding index"
                );
                HashMap::new()
            }
            None => HashMap::new(),
        };

        Ok(Self {
            dirs,
            embedder,
            entries: RwLock::new(Arc::new(entries)),
        })
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fingerprint(&self) -> EmbedderFingerprint {
        self.embedder.fingerprint()
    }

    pub(crate) fn snapshot(&self) -> Arc<HashMap<String, IndexEntry>> {
        Arc::clone(&self.entries.read().expect("index lock poisoned"))
    }

    fn install(&self, entries: HashMap<String, IndexEntry>) {
        *self.entries.write().expect("index lock poisoned") = Arc::new(entries);
    }

    /// Embed and index one page summary.
    pub async fn index_page(
        &self,
        page_id: &str,
        text: &str,
        label: &str,
        content_hash: &str,
    ) -> Result<(), RetrievalError> {
        let mut vectors = self.embedder.embed(&[text.to_string()]).await?;
        let embedding = normalize(vectors.pop().ok_or_else(|| {
            RetrievalError::Embedding("embedder returned no vector".into())
        })?);

        let entry = IndexEntry {
            page_id: page_id.to_string(),
            embedding,
            label: label.to_string(),
            summary_excerpt: text.chars().take(200).collect(),
            created_at: Utc::now(),
            content_hash: content_hash.to_string(),
        };

        let mut next = (*self.snapshot()).clone();
        next.insert(page_id.to_string(), entry);
        self.install(next);
        self.save().await
    }

    pub async fn remove_page(&self, page_id: &str) -> Result<(), RetrievalError> {
        let mut next = (*self.snapshot()).clone();
        if next.remove(page_id).is_none() {
            return Ok(());
        }
        self.install(next);
        self.save().await
    }

    /// Cosine search over the snapshot, deduplicating near-identical hits.
    pub async fn search(
        &self,
        query_text: &str,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<SearchHit>, RetrievalError> {
        if query_text.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let mut vectors = self.embedder.embed(&[query_text.to_string()]).await?;
        let query = normalize(vectors.pop().ok_or_else(|| {
            RetrievalError::Embedding("embedder returned no vector".into())
        })?);

        let snapshot = self.snapshot();
        let mut scored: Vec<(&IndexEntry, f32)> = snapshot
            .values()
            .map(|e| (e, dot(&query, &e.embedding)))
            .filter(|(_, score)| *score >= min_score)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut hits: Vec<SearchHit> = Vec::new();
        let mut kept: Vec<&IndexEntry> = Vec::new();
        for (entry, score) in scored {
            if hits.len() >= k {
                break;
            }
            let duplicate = kept
                .iter()
                .any(|seen| dot(&seen.embedding, &entry.embedding) > DEDUP_SIMILARITY);
            if duplicate {
                continue;
            }
            kept.push(entry);
            hits.push(SearchHit {
                page_id: entry.page_id.clone(),
                score,
                label: entry.label.clone(),
                summary_excerpt: entry.summary_excerpt.clone(),
            });
        }
        Ok(hits)
    }

    /// Which of `candidate_ids` have no index entry.
    pub fn missing_ids(&self, candidate_ids: &[String]) -> Vec<String> {
        let snapshot = self.snapshot();
        candidate_ids
            .iter()
            .filter(|id| !snapshot.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Persist the live index atomically.
    pub async fn save(&self) -> Result<(), RetrievalError> {
        let file = IndexFile {
            version: INDEX_VERSION,
            embedder: self.embedder.fingerprint(),
            entries: (*self.snapshot()).clone(),
        };
        write_json_atomic(&self.dirs.embeddings_path(), &file)
            .await
            .map_err(RetrievalError::Io)
    }

    /// Re-read the live file, e.g. after the batch job's atomic swap.
    pub async fn reload(&self) -> Result<(), RetrievalError> {
        let fingerprint = self.embedder.fingerprint();
        let entries = match read_json::<IndexFile>(&self.dirs.embeddings_path()).await {
            Some(file) if file.version == INDEX_VERSION && file.embedder == fingerprint => {
                file.entries
            }
            Some(_) => {
                warn!("embedder fingerprint changed under reload, discarding index");
                HashMap::new()
            }
            None => HashMap::new(),
        };
        self.install(entries);
        Ok(())
    }

    /// Index any on-disk page that has a summary but no entry. Pages
    /// without summaries are skipped.
    pub async fn backfill(&self) -> Result<usize, RetrievalError> {
        let ids = list_page_ids(&self.dirs)
            .await
            .map_err(|e| RetrievalError::Index(e.to_string()))?;
        let missing = self.missing_ids(&ids);
        let mut indexed = 0;
        for id in missing {
            let Some(page) = read_page(&self.dirs, &id).await else {
                continue;
            };
            if page.summary.trim().is_empty() {
                continue;
            }
            match self
                .index_page(&id, &page.summary, &page.label, &page.content_hash)
                .await
            {
                Ok(()) => indexed += 1,
                Err(e) => warn!(page = %id, error = %e, "backfill index failed"),
            }
        }
        if indexed > 0 {
            info!(indexed, "backfilled embedding index");
        }
        Ok(indexed)
    }
}

/// Shadow-swap crash recovery. Shadow without manifest: the batch finished
/// but the swap was interrupted, promote the shadow. Shadow with manifest:
/// the shadow is incomplete, discard it.
async fn recover_orphan_shadow(dirs: &SessionDirs) -> Result<(), RetrievalError> {
    let shadow = dirs.embeddings_shadow_path();
    if tokio::fs::metadata(&shadow).await.is_err() {
        return Ok(());
    }
    let manifest_present = tokio::fs::metadata(dirs.batch_progress_path()).await.is_ok();
    if manifest_present {
        debug!("incomplete shadow index found, discarding");
        tokio::fs::remove_file(&shadow).await?;
    } else {
        info!("orphaned complete shadow index found, promoting to live");
        tokio::fs::rename(&shadow, dirs.embeddings_path()).await?;
    }
    Ok(())
}

pub(crate) fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Deterministic embedder: buckets by keyword so tests control
    /// similarity exactly.
    pub struct KeywordEmbedder {
        pub model: String,
    }

    impl KeywordEmbedder {
        pub fn new() -> Self {
            Self {
                model: "keyword-v1".into(),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    let mut v = vec![0.0f32; 4];
                    if t.contains("rust") {
                        v[0] = 1.0;
                    }
                    if t.contains("websocket") {
                        v[1] = 1.0;
                    }
                    if t.contains("database") {
                        v[2] = 1.0;
                    }
                    if t.contains("deploy") {
                        v[3] = 1.0;
                    }
                    if v.iter().all(|x| *x == 0.0) {
                        v[0] = 0.1;
                        v[1] = 0.1;
                    }
                    v
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            4
        }

        fn model(&self) -> &str {
            &self.model
        }

        fn provider(&self) -> &str {
            "test"
        }
    }

    async fn open_index(dir: &std::path::Path) -> EmbeddingIndex {
        EmbeddingIndex::open(SessionDirs::new(dir), Arc::new(KeywordEmbedder::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn index_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path()).await;
        index
            .index_page("pg_a", "notes about websocket handshakes", "net", "h1")
            .await
            .unwrap();
        index
            .index_page("pg_b", "database migration plan", "db", "h2")
            .await
            .unwrap();

        let hits = index.search("websocket problems", 5, 0.1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].page_id, "pg_a");
        assert!(hits[0].score > 0.9);
    }

    #[tokio::test]
    async fn search_dedups_near_identical() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path()).await;
        index
            .index_page("pg_a", "websocket retry logic", "net", "h1")
            .await
            .unwrap();
        index
            .index_page("pg_b", "websocket retry logic again", "net", "h2")
            .await
            .unwrap();
        index
            .index_page("pg_c", "database schema", "db", "h3")
            .await
            .unwrap();

        let hits = index.search("websocket", 5, 0.05).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.page_id.as_str()).collect();
        // The two websocket pages collapse into one hit.
        assert_eq!(
            ids.iter().filter(|id| id.starts_with("pg_")).count(),
            hits.len()
        );
        assert_eq!(
            hits.iter()
                .filter(|h| h.page_id == "pg_a" || h.page_id == "pg_b")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = open_index(dir.path()).await;
            index
                .index_page("pg_a", "rust ownership notes", "lang", "h1")
                .await
                .unwrap();
        }
        let index = open_index(dir.path()).await;
        assert_eq!(index.len(), 1);
        assert!(index.missing_ids(&["pg_a".into(), "pg_b".into()]) == vec!["pg_b".to_string()]);
    }

    #[tokio::test]
    async fn fingerprint_mismatch_discards() {
        // Property 8: incompatible embedder means an empty index.
        let dir = tempfile::tempdir().unwrap();
        {
            let index = open_index(dir.path()).await;
            index
                .index_page("pg_a", "rust notes", "lang", "h1")
                .await
                .unwrap();
        }
        let other = Arc::new(KeywordEmbedder {
            model: "keyword-v2".into(),
        });
        let index = EmbeddingIndex::open(SessionDirs::new(dir.path()), other)
            .await
            .unwrap();
        assert_eq!(index.len(), 0);
    }

    #[tokio::test]
    async fn orphan_shadow_without_manifest_promotes() {
        // Scenario S3.
        let dir = tempfile::tempdir().unwrap();
        let dirs = SessionDirs::new(dir.path());
        dirs.ensure().await.unwrap();

        let embedder = KeywordEmbedder::new();
        let shadow = IndexFile {
            version: INDEX_VERSION,
            embedder: embedder.fingerprint(),
            entries: HashMap::from([(
                "pg_x".to_string(),
                IndexEntry {
                    page_id: "pg_x".into(),
                    embedding: vec![1.0, 0.0, 0.0, 0.0],
                    label: "lang".into(),
                    summary_excerpt: "rust".into(),
                    created_at: Utc::now(),
                    content_hash: "h".into(),
                },
            )]),
        };
        crate::session::write_json_atomic(&dirs.embeddings_shadow_path(), &shadow)
            .await
            .unwrap();

        let index = open_index(dir.path()).await;
        assert_eq!(index.len(), 1);
        assert!(index.missing_ids(&["pg_x".into()]).is_empty());
        assert!(tokio::fs::metadata(dirs.embeddings_shadow_path())
            .await
            .is_err());
        assert!(tokio::fs::metadata(dirs.embeddings_path()).await.is_ok());
    }

    #[tokio::test]
    async fn incomplete_shadow_with_manifest_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = SessionDirs::new(dir.path());
        dirs.ensure().await.unwrap();

        tokio::fs::write(dirs.embeddings_shadow_path(), b"{}")
            .await
            .unwrap();
        tokio::fs::write(dirs.batch_progress_path(), b"{}")
            .await
            .unwrap();

        let index = open_index(dir.path()).await;
        assert_eq!(index.len(), 0);
        assert!(tokio::fs::metadata(dirs.embeddings_shadow_path())
            .await
            .is_err());
        // Manifest stays for the next batch to resume from.
        assert!(tokio::fs::metadata(dirs.batch_progress_path())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn backfill_indexes_unindexed_pages() {
        use crate::store::page::{write_page, Page};
        use crate::types::{Message, Role};

        let dir = tempfile::tempdir().unwrap();
        let dirs = SessionDirs::new(dir.path());
        dirs.ensure().await.unwrap();

        let with_summary =
            Page::from_group(Role::User, &[Message::user("rust stuff")], "rust notes".into());
        let mut without_summary =
            Page::from_group(Role::User, &[Message::user("empty")], String::new());
        without_summary.summary = String::new();
        write_page(&dirs, &with_summary).await.unwrap();
        write_page(&dirs, &without_summary).await.unwrap();

        let index = open_index(dir.path()).await;
        let indexed = index.backfill().await.unwrap();
        assert_eq!(indexed, 1);
        assert!(index.missing_ids(&[with_summary.id.clone()]).is_empty());
    }

    #[test]
    fn normalize_produces_unit_vectors() {
        let v = normalize(vec![3.0, 4.0]);
        assert!((dot(&v, &v) - 1.0).abs() < 1e-6);
        // Zero vectors stay zero rather than dividing by zero.
        let z = normalize(vec![0.0, 0.0]);
        assert_eq!(z, vec![0.0, 0.0]);
    }
}
