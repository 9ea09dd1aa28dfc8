use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::StoreError;
use crate::session::{read_json, write_json_atomic, SessionDirs};
use crate::types::{estimate_sequence_tokens, Message, Role};

/// A persisted, content-addressed summary of a contiguous group of paged-out
/// messages. Never mutated in place; re-summarization replaces the file via
/// the shadow-swap protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    /// Short human tag, typically the dominant lane plus a content hint.
    pub label: String,
    /// Originating role of the group.
    pub lane: Role,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    pub estimated_tokens: usize,
    pub summary: String,
    /// Full serialized originals, for re-summarization and recovery.
    pub content: String,
    pub content_hash: String,
    /// Max `importance` over contained messages. Feeds retention scoring.
    pub max_importance: f32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pinned: bool,
}

impl Page {
    /// Build a page from the group of originals it replaces.
    pub fn from_group(lane: Role, messages: &[Message], summary: String) -> Self {
        let content = serde_json::to_string(messages).unwrap_or_default();
        let label = derive_label(lane, messages);
        Self {
            id: generate_page_id(),
            label,
            lane,
            created_at: Utc::now(),
            message_count: messages.len(),
            estimated_tokens: estimate_sequence_tokens(messages),
            summary,
            content_hash: content_hash(&content),
            content,
            max_importance: messages
                .iter()
                .filter_map(|m| m.importance)
                .fold(0.0, f32::max),
            pinned: false,
        }
    }

    /// The originals this page replaced. Empty when the content field is
    /// corrupt; callers fall back to the summary.
    pub fn originals(&self) -> Vec<Message> {
        serde_json::from_str(&self.content).unwrap_or_default()
    }
}

/// `pg_<base36 millis><base36 rand>`: lexicographic order is creation order.
pub fn generate_page_id() -> String {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    // Two nanos digits for spread, two counter digits so ids stay distinct
    // within one millisecond.
    let seq = SEQ.fetch_add(1, Ordering::Relaxed) as u64;
    format!(
        "pg_{}{}{}",
        to_base36(now.as_millis() as u64, 9),
        to_base36((now.subsec_nanos() as u64 / 1000) % 1296, 2),
        to_base36(seq % 1296, 2)
    )
}

/// `sess_<base36 millis>`: default id for a store that was never saved
/// under an explicit session id.
pub fn generate_session_id() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    static SEQ: AtomicU32 = AtomicU32::new(0);
    format!(
        "sess_{}{}",
        to_base36(now.as_millis() as u64, 9),
        to_base36(SEQ.fetch_add(1, Ordering::Relaxed) as u64 % 1296, 2)
    )
}

fn to_base36(mut n: u64, width: usize) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    while out.len() < width {
        out.push(b'0');
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

/// Stable hash of a page's serialized originals.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn derive_label(lane: Role, messages: &[Message]) -> String {
    let hint: String = messages
        .first()
        .map(|m| m.content.chars().take(24).collect())
        .unwrap_or_default();
    let hint = hint.split_whitespace().collect::<Vec<_>>().join(" ");
    if hint.is_empty() {
        lane.to_string()
    } else {
        format!("{lane}: {hint}")
    }
}

// ---------------------------------------------------------------------------
// Page file IO
// ---------------------------------------------------------------------------

/// Persist a page, retrying the write once. The caller must not drop the
/// originals from the buffer unless this returns Ok.
pub async fn write_page(dirs: &SessionDirs, page: &Page) -> Result<(), StoreError> {
    let path = dirs.page_path(&page.id);
    if let Err(first) = write_json_atomic(&path, page).await {
        warn!(page = %page.id, error = %first, "page write failed, retrying once");
        write_json_atomic(&path, page).await.map_err(|e| StoreError::Page {
            id: page.id.clone(),
            reason: format!("write failed after retry: {e}"),
        })?;
    }
    Ok(())
}

/// Load one page; `None` for missing or corrupt files.
pub async fn read_page(dirs: &SessionDirs, page_id: &str) -> Option<Page> {
    read_json(&dirs.page_path(page_id)).await
}

/// All page ids on disk, in lexicographic (= creation) order.
pub async fn list_page_ids(dirs: &SessionDirs) -> Result<Vec<String>, StoreError> {
    let mut ids = Vec::new();
    let mut entries = match tokio::fs::read_dir(dirs.pages_dir()).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(id) = name.strip_suffix(".json") {
            if id.starts_with("pg_") {
                ids.push(id.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}

/// Modification time of a page file. Used by the batch job's freshness check.
pub async fn page_mtime(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_ids_sort_by_creation() {
        let a = generate_page_id();
        std::thread::sleep(std::time::Duration::from_millis(3));
        let b = generate_page_id();
        assert!(a < b, "{a} should sort before {b}");
    }

    #[test]
    fn page_ids_unique_within_a_millisecond() {
        let mut ids: Vec<String> = (0..64).map(|_| generate_page_id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let a = content_hash("hello");
        assert_eq!(a, content_hash("hello"));
        assert_ne!(a, content_hash("hello!"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn from_group_captures_shape() {
        let msgs = vec![
            Message::user("investigate the flaky websocket test").with_importance(0.4),
            Message::user("second message").with_importance(0.9),
        ];
        let page = Page::from_group(Role::User, &msgs, "summary text".into());
        assert_eq!(page.message_count, 2);
        assert_eq!(page.lane, Role::User);
        assert_eq!(page.max_importance, 0.9);
        assert!(page.label.starts_with("user: investigate"));
        assert_eq!(page.originals(), msgs);
        assert_eq!(page.content_hash, content_hash(&page.content));
    }

    #[tokio::test]
    async fn page_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = SessionDirs::new(dir.path());
        dirs.ensure().await.unwrap();

        let page = Page::from_group(Role::User, &[Message::user("hello")], "s".into());
        write_page(&dirs, &page).await.unwrap();

        let back = read_page(&dirs, &page.id).await.unwrap();
        assert_eq!(back.id, page.id);
        assert_eq!(back.summary, "s");

        let ids = list_page_ids(&dirs).await.unwrap();
        assert_eq!(ids, vec![page.id.clone()]);
    }

    #[tokio::test]
    async fn corrupt_page_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = SessionDirs::new(dir.path());
        dirs.ensure().await.unwrap();
        tokio::fs::write(dirs.page_path("pg_bad"), b"{oops")
            .await
            .unwrap();
        assert!(read_page(&dirs, "pg_bad").await.is_none());
    }
}
