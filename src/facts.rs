use std::path::PathBuf;

use tokio::io::AsyncWriteExt;

use crate::session::SessionDirs;

const FACTS_HEADER: &str = "## Learned facts";

/// Append-only store for `learn(...)` directives. One markdown bullet per
/// fact; writes use append semantics so concurrent appenders interleave
/// whole lines.
pub struct LearnedFacts {
    path: PathBuf,
}

impl LearnedFacts {
    pub fn new(dirs: &SessionDirs) -> Self {
        Self {
            path: dirs.learned_facts_path(),
        }
    }

    pub async fn append(&self, fact: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = format!("- {}\n", fact.replace('\n', " "));
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    pub async fn all(&self) -> std::io::Result<Vec<String>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(raw
            .lines()
            .filter_map(|l| l.strip_prefix("- "))
            .map(str::to_string)
            .collect())
    }
}

/// Hot-patch a pinned system prompt with a newly learned fact. The facts
/// section is created on first use and extended afterwards.
pub fn patch_prompt(current: &str, fact: &str) -> String {
    let bullet = format!("- {}", fact.replace('\n', " "));
    if current.contains(FACTS_HEADER) {
        format!("{}\n{}", current.trim_end(), bullet)
    } else {
        format!("{}\n\n{FACTS_HEADER}\n{}", current.trim_end(), bullet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = SessionDirs::new(dir.path());
        let facts = LearnedFacts::new(&dirs);
        facts.append("the user prefers rebase over merge").await.unwrap();
        facts.append("CI runs on push\nto main").await.unwrap();

        let all = facts.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1], "CI runs on push to main");
    }

    #[tokio::test]
    async fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let facts = LearnedFacts::new(&SessionDirs::new(dir.path()));
        assert!(facts.all().await.unwrap().is_empty());
    }

    #[test]
    fn patch_creates_then_extends_section() {
        let base = "You are the resident agent.";
        let once = patch_prompt(base, "likes short answers");
        assert!(once.contains(FACTS_HEADER));
        assert!(once.ends_with("- likes short answers"));

        let twice = patch_prompt(&once, "timezone is UTC+2");
        assert_eq!(twice.matches(FACTS_HEADER).count(), 1);
        assert!(twice.ends_with("- timezone is UTC+2"));
    }
}
