use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Per-session on-disk layout. One directory per session:
///
/// ```text
/// <root>/
///   meta.json
///   messages.jsonl
///   sensory-state.json
///   learned-facts.md
///   pages/
///     pg_<id>.json
///     embeddings.json
///     embeddings.shadow.json      (transient)
///     batch-progress.json         (transient)
/// ```
#[derive(Debug, Clone)]
pub struct SessionDirs {
    root: PathBuf,
}

impl SessionDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_path(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    pub fn messages_path(&self) -> PathBuf {
        self.root.join("messages.jsonl")
    }

    pub fn sensory_state_path(&self) -> PathBuf {
        self.root.join("sensory-state.json")
    }

    pub fn learned_facts_path(&self) -> PathBuf {
        self.root.join("learned-facts.md")
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.root.join("pages")
    }

    pub fn page_path(&self, page_id: &str) -> PathBuf {
        self.pages_dir().join(format!("{page_id}.json"))
    }

    pub fn embeddings_path(&self) -> PathBuf {
        self.pages_dir().join("embeddings.json")
    }

    pub fn embeddings_shadow_path(&self) -> PathBuf {
        self.pages_dir().join("embeddings.shadow.json")
    }

    pub fn batch_progress_path(&self) -> PathBuf {
        self.pages_dir().join("batch-progress.json")
    }

    /// Create the directory tree if missing.
    pub async fn ensure(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.pages_dir()).await
    }
}

/// Session identity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    /// Ids currently materialized in the page slot. Extra field; readers
    /// that predate it parse-or-discard.
    #[serde(default)]
    pub loaded_pages: Vec<String>,
}

// ---------------------------------------------------------------------------
// Atomic file IO
// ---------------------------------------------------------------------------

/// Write-temp then rename. Readers never observe a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = tmp_sibling(path);
    tokio::fs::write(&tmp, bytes).await?;
    match tokio::fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

/// Serialize as pretty JSON and write atomically.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    write_atomic(path, &bytes).await
}

/// Read and parse JSON; `None` when the file is missing or corrupt. Corrupt
/// files are the reader's problem to tolerate, not to repair.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable file, discarding");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt json, discarding");
            None
        }
    }
}

/// Append one JSON object as a line. O_APPEND semantics so concurrent
/// appenders interleave whole lines.
pub async fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await
}

/// Read a JSONL file, parsing-or-discarding each line. A torn final line
/// (crash mid-append) drops silently.
pub async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> std::io::Result<Vec<T>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut out = Vec::new();
    for (n, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(v) => out.push(v),
            Err(e) => warn!(line = n + 1, error = %e, "skipping corrupt journal line"),
        }
    }
    Ok(out)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "file".into());
    name.push(".tmp");
    path.with_file_name(name)
}
