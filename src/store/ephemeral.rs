use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::StoreError;
use crate::session::{read_json, read_jsonl, write_atomic, write_json_atomic, SessionDirs, SessionMeta};
use crate::store::compact::{flatten_broken_pairs, hard_truncate};
use crate::store::page::generate_session_id;
use crate::store::paged::StoreParts;
use crate::store::{BudgetOverrides, MessageStore, StoreConfig, StoreStats};
use crate::types::{estimate_message_tokens, estimate_sequence_tokens, Message, Role};

/// Alternate memory kind: a bounded buffer that drops its oldest units
/// instead of paging them out. Nothing survives but what fits; useful for
/// scratch sessions and as the degenerate baseline the paged store is
/// measured against.
pub struct EphemeralStore {
    parts: StoreParts,
    session_id: String,
    created_at: DateTime<Utc>,
    buffer: Vec<Message>,
    protected: Vec<bool>,
}

impl EphemeralStore {
    pub fn from_parts(parts: StoreParts) -> Self {
        Self {
            parts,
            session_id: generate_session_id(),
            created_at: Utc::now(),
            buffer: Vec::new(),
            protected: Vec::new(),
        }
    }

    pub fn parts(&self) -> StoreParts {
        self.parts.clone()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.parts.config
    }

    fn pinned_count(&self) -> usize {
        self.buffer
            .iter()
            .take(2)
            .take_while(|m| m.role == Role::System)
            .count()
    }

    fn dirs(&self) -> SessionDirs {
        SessionDirs::new(self.parts.root.join(&self.session_id))
    }

    /// Replace or insert the pinned system prompt.
    pub fn patch_pinned_prompt(&mut self, content: String) {
        if self.buffer.first().map(|m| m.role) == Some(Role::System) {
            self.buffer[0].content = content;
        } else {
            self.buffer.insert(0, Message::system(content));
            self.protected.insert(0, false);
        }
    }

    /// Shrink in place to `budget`, oldest units first.
    fn trim_to(&mut self, budget: usize) {
        if estimate_sequence_tokens(&self.buffer) <= budget {
            return;
        }
        self.buffer = hard_truncate(&self.buffer, &self.protected, self.pinned_count(), budget);
        self.protected = vec![false; self.buffer.len()];
    }
}

#[async_trait]
impl MessageStore for EphemeralStore {
    async fn add(&mut self, message: Message) -> Result<(), StoreError> {
        let protect = message.role == Role::Assistant && !message.tool_calls.is_empty();
        self.buffer.push(message);
        self.protected.push(protect);
        let budget = self.parts.config.working_budget();
        self.trim_to(budget);
        Ok(())
    }

    async fn add_if_not_exists(&mut self, message: Message) -> Result<bool, StoreError> {
        if self.buffer.contains(&message) {
            return Ok(false);
        }
        self.add(message).await?;
        Ok(true)
    }

    fn messages(&self) -> Vec<Message> {
        let flat = flatten_broken_pairs(&self.buffer);
        let flags = if flat.len() == self.buffer.len() {
            self.protected.clone()
        } else {
            vec![false; flat.len()]
        };
        hard_truncate(
            &flat,
            &flags,
            self.pinned_count(),
            self.parts.config.working_budget(),
        )
    }

    fn raw_messages(&self) -> Vec<Message> {
        self.buffer.clone()
    }

    fn protect(&mut self, message: &Message) {
        if let Some(pos) = self.buffer.iter().rposition(|m| m == message) {
            self.protected[pos] = true;
        }
    }

    fn clear_protected(&mut self) {
        self.protected.iter_mut().for_each(|p| *p = false);
    }

    fn ref_page(&mut self, page_id: &str) {
        warn!(page = page_id, "ephemeral store has no pages, ref ignored");
    }

    fn unref_page(&mut self, _page_id: &str) {}

    async fn load_requested_pages(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn force_compact(&mut self) -> Result<(), StoreError> {
        let working = self.parts.config.working_budget() as f32;
        let low = (working * self.parts.config.low_ratio) as usize;
        self.trim_to(low);
        Ok(())
    }

    async fn hot_reload_config(&mut self, overrides: BudgetOverrides) -> Result<(), StoreError> {
        let mut next = self.parts.config.clone();
        if let Some(working) = overrides.working_tokens {
            next.context_tokens = working + next.reserve_header + next.reserve_response;
        }
        if let Some(page_slot) = overrides.page_slot_tokens {
            next.page_slot_tokens = page_slot;
        }
        next.validate()?;
        self.parts.config = next;
        let budget = self.parts.config.working_budget();
        self.trim_to(budget);
        Ok(())
    }

    async fn save(&mut self, session_id: &str) -> Result<(), StoreError> {
        self.session_id = session_id.to_string();
        let dirs = self.dirs();
        dirs.ensure().await?;
        let meta = SessionMeta {
            id: self.session_id.clone(),
            created_at: self.created_at,
            provider: self.parts.config.provider.clone(),
            model: self.parts.config.model.clone(),
            loaded_pages: Vec::new(),
        };
        write_json_atomic(&dirs.meta_path(), &meta).await?;
        let mut lines = String::new();
        for m in &self.buffer {
            lines.push_str(
                &serde_json::to_string(m).map_err(|e| StoreError::Journal(e.to_string()))?,
            );
            lines.push('\n');
        }
        write_atomic(&dirs.messages_path(), lines.as_bytes()).await?;
        Ok(())
    }

    async fn load(&mut self, session_id: &str) -> Result<(), StoreError> {
        self.session_id = session_id.to_string();
        let dirs = self.dirs();
        self.buffer = read_jsonl(&dirs.messages_path()).await?;
        self.buffer = flatten_broken_pairs(&self.buffer);
        self.protected = vec![false; self.buffer.len()];
        if let Some(meta) = read_json::<SessionMeta>(&dirs.meta_path()).await {
            self.created_at = meta.created_at;
        }
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        let mut lane_tokens: std::collections::HashMap<Role, usize> = Default::default();
        for m in &self.buffer {
            *lane_tokens.entry(m.role).or_default() += estimate_message_tokens(m);
        }
        StoreStats {
            total_messages: self.buffer.len(),
            estimated_tokens: estimate_sequence_tokens(&self.buffer),
            working_budget: self.parts.config.working_budget(),
            lane_tokens,
            page_count: 0,
            loaded_pages: 0,
            compaction_active: false,
            model: self.parts.config.model.clone(),
            pages: Vec::new(),
        }
    }
}
