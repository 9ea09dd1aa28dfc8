use std::sync::Arc;

use tracing::{debug, warn};

use super::index::EmbeddingIndex;
use crate::types::{Message, Role};

/// Queries shorter than this fall back to the latest assistant message;
/// single-word acknowledgements retrieve garbage.
const MIN_QUERY_CHARS: usize = 12;

/// Per-turn semantic auto-fill of the page slot. Forms a query from the
/// conversation tail, searches the index, and returns the page ids worth
/// loading. The caller refs them; nothing here mutates the store.
pub struct AutoRetriever {
    index: Arc<EmbeddingIndex>,
    k: usize,
    min_score: f32,
    last_query: Option<String>,
}

impl AutoRetriever {
    pub fn new(index: Arc<EmbeddingIndex>) -> Self {
        Self {
            index,
            k: 3,
            min_score: 0.35,
            last_query: None,
        }
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    /// Run one auto-retrieve pass. `None` when there is nothing to do:
    /// empty input, an unchanged query (tool-loop turns re-enter with the
    /// same tail), or no surviving hits.
    pub async fn auto_retrieve(
        &mut self,
        messages: &[Message],
        loaded_ids: &[String],
    ) -> Option<Vec<String>> {
        let query = query_text(messages)?;
        if self.last_query.as_deref() == Some(query.as_str()) {
            debug!("auto-retrieve query unchanged, skipping");
            return None;
        }
        self.last_query = Some(query.clone());

        let hits = match self.index.search(&query, self.k, self.min_score).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "auto-retrieve search failed, continuing without recall");
                return None;
            }
        };

        let ids: Vec<String> = hits
            .into_iter()
            .map(|h| h.page_id)
            .filter(|id| !loaded_ids.contains(id))
            .collect();

        if ids.is_empty() {
            None
        } else {
            debug!(count = ids.len(), "auto-retrieve selected pages");
            Some(ids)
        }
    }
}

/// Most recent user message, falling back to the most recent assistant
/// message when the user text is too short to embed meaningfully.
fn query_text(messages: &[Message]) -> Option<String> {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User && m.page_id.is_none());
    if let Some(m) = last_user {
        let text = m.content.trim();
        if text.len() >= MIN_QUERY_CHARS {
            return Some(text.to_string());
        }
    }
    let last_assistant = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && !m.content.trim().is_empty())?;
    let text = last_assistant.content.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::index::tests::KeywordEmbedder;
    use crate::retrieval::index::EmbeddingIndex;
    use crate::session::SessionDirs;

    async fn seeded_index(dir: &std::path::Path) -> Arc<EmbeddingIndex> {
        let index = EmbeddingIndex::open(SessionDirs::new(dir), Arc::new(KeywordEmbedder::new()))
            .await
            .unwrap();
        index
            .index_page("pg_ws", "websocket reconnect storm notes", "net", "h1")
            .await
            .unwrap();
        index
            .index_page("pg_db", "database vacuum schedule", "db", "h2")
            .await
            .unwrap();
        Arc::new(index)
    }

    #[tokio::test]
    async fn retrieves_relevant_pages() {
        let dir = tempfile::tempdir().unwrap();
        let mut auto = AutoRetriever::new(seeded_index(dir.path()).await);
        let msgs = vec![Message::user("the websocket keeps dropping connections")];
        let ids = auto.auto_retrieve(&msgs, &[]).await.unwrap();
        assert_eq!(ids, vec!["pg_ws".to_string()]);
    }

    #[tokio::test]
    async fn unchanged_query_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut auto = AutoRetriever::new(seeded_index(dir.path()).await);
        let msgs = vec![Message::user("the websocket keeps dropping connections")];
        assert!(auto.auto_retrieve(&msgs, &[]).await.is_some());
        // Tool-loop turn: same tail, no new retrieve.
        assert!(auto.auto_retrieve(&msgs, &[]).await.is_none());
    }

    #[tokio::test]
    async fn already_loaded_pages_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let mut auto = AutoRetriever::new(seeded_index(dir.path()).await);
        let msgs = vec![Message::user("the websocket keeps dropping connections")];
        let loaded = vec!["pg_ws".to_string()];
        assert!(auto.auto_retrieve(&msgs, &loaded).await.is_none());
    }

    #[tokio::test]
    async fn short_user_text_falls_back_to_assistant() {
        let dir = tempfile::tempdir().unwrap();
        let mut auto = AutoRetriever::new(seeded_index(dir.path()).await);
        let msgs = vec![
            Message::assistant("I will inspect the websocket handler next"),
            Message::user("ok"),
        ];
        let ids = auto.auto_retrieve(&msgs, &[]).await.unwrap();
        assert_eq!(ids, vec!["pg_ws".to_string()]);
    }

    #[tokio::test]
    async fn empty_input_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut auto = AutoRetriever::new(seeded_index(dir.path()).await);
        assert!(auto.auto_retrieve(&[], &[]).await.is_none());
    }
}
