use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::events::{emit, CoreEvent, EventSender};
use crate::session::{
    append_jsonl, read_json, read_jsonl, write_atomic, write_json_atomic, SessionDirs, SessionMeta,
};
use crate::store::compact::{
    consolidate_marker_runs, flatten_broken_pairs, hard_truncate, plan_page_groups,
    plan_tool_retention, PageGroup,
};
use crate::store::page::{
    generate_session_id, list_page_ids, read_page, write_page, Page,
};
use crate::store::{BudgetOverrides, MessageStore, PageDigest, StoreConfig, StoreStats};
use crate::summarize::Summarizer;
use crate::types::{
    estimate_message_tokens, estimate_sequence_tokens, Message, Role,
};

/// Construction material shared across store variants, so a `memory(kind)`
/// hot-swap can rebuild either implementation.
#[derive(Clone)]
pub struct StoreParts {
    pub root: PathBuf,
    pub config: StoreConfig,
    pub summarizer: Arc<dyn Summarizer>,
    pub events: Option<EventSender>,
}

/// A page summary materialized into the page slot.
#[derive(Debug, Clone)]
struct LoadedPage {
    id: String,
    tokens: usize,
    message: Message,
}

const COMPACT_SENTINEL: &str = "::compaction-sentinel::";

fn sentinel() -> Message {
    Message {
        role: Role::Memory,
        content: COMPACT_SENTINEL.into(),
        ..Message::user("")
    }
}

fn is_sentinel(m: &Message) -> bool {
    m.role == Role::Memory && m.content == COMPACT_SENTINEL && m.page_id.is_none()
}

/// The default store: bounded working buffer with high/low watermark
/// compaction that spills older material into on-disk pages.
pub struct PagedStore {
    root: PathBuf,
    session_id: String,
    created_at: DateTime<Utc>,
    config: StoreConfig,
    summarizer: Arc<dyn Summarizer>,
    events: Option<EventSender>,

    buffer: Vec<Message>,
    protected: Vec<bool>,
    page_slot: Vec<LoadedPage>,
    pending_refs: Vec<String>,
    pending_unrefs: Vec<String>,
    /// Digest of every known on-disk page, for stats and the context map.
    page_index: BTreeMap<String, PageDigest>,
    compacting: bool,
}

impl PagedStore {
    pub fn new(
        root: impl Into<PathBuf>,
        config: StoreConfig,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            root: root.into(),
            session_id: generate_session_id(),
            created_at: Utc::now(),
            config,
            summarizer,
            events: None,
            buffer: Vec::new(),
            protected: Vec::new(),
            page_slot: Vec::new(),
            pending_refs: Vec::new(),
            pending_unrefs: Vec::new(),
            page_index: BTreeMap::new(),
            compacting: false,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn from_parts(parts: StoreParts) -> Self {
        let mut store = Self::new(parts.root, parts.config, parts.summarizer);
        store.events = parts.events;
        store
    }

    pub fn parts(&self) -> StoreParts {
        StoreParts {
            root: self.root.clone(),
            config: self.config.clone(),
            summarizer: Arc::clone(&self.summarizer),
            events: self.events.clone(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session_dirs(&self) -> SessionDirs {
        SessionDirs::new(self.root.join(&self.session_id))
    }

    /// Count of leading pinned system prompts (index 0 and 1 when present).
    fn pinned_count(&self) -> usize {
        self.buffer
            .iter()
            .take(2)
            .take_while(|m| m.role == Role::System)
            .count()
    }

    fn slot_tokens(&self) -> usize {
        self.page_slot.iter().map(|p| p.tokens).sum()
    }

    fn rendered_tokens(&self) -> usize {
        self.slot_tokens() + estimate_sequence_tokens(&self.buffer)
    }

    fn high_watermark(&self) -> usize {
        (self.config.working_budget() as f32 * self.config.high_ratio) as usize
    }

    fn low_watermark(&self) -> usize {
        (self.config.working_budget() as f32 * self.config.low_ratio) as usize
    }

    /// Release protection on assistants whose tool rounds are complete.
    fn release_answered(&mut self) {
        for i in 0..self.buffer.len() {
            if !self.protected[i] {
                continue;
            }
            let m = &self.buffer[i];
            if m.role != Role::Assistant || m.tool_calls.is_empty() {
                continue;
            }
            let mut answered: std::collections::HashSet<&str> = Default::default();
            for t in self.buffer[i + 1..].iter().take_while(|t| t.role == Role::Tool) {
                if let Some(id) = t.tool_call_id.as_deref() {
                    answered.insert(id);
                }
            }
            if m.tool_calls.iter().all(|c| answered.contains(c.id.as_str())) {
                self.protected[i] = false;
            }
        }
    }

    async fn maybe_compact(&mut self) -> Result<(), StoreError> {
        if self.rendered_tokens() > self.high_watermark() {
            self.run_compaction(false).await
        } else {
            Ok(())
        }
    }

    async fn run_compaction(&mut self, force: bool) -> Result<(), StoreError> {
        let pre_tokens = self.rendered_tokens();
        if !force && pre_tokens <= self.high_watermark() {
            return Ok(());
        }
        let low = self.low_watermark();

        self.compacting = true;
        let result = self.compact_phases(low).await;
        self.compacting = false;

        match result {
            Ok(pages_written) => {
                let post_tokens = self.rendered_tokens();
                if pages_written > 0 {
                    self.persist_journal().await?;
                    info!(pre_tokens, post_tokens, pages_written, "compaction complete");
                    emit(
                        &self.events,
                        CoreEvent::Compacted {
                            pre_tokens,
                            post_tokens,
                            pages_written,
                        },
                    );
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn compact_phases(&mut self, low: usize) -> Result<usize, StoreError> {
        let pinned = self.pinned_count();
        let mut written = 0;

        let groups = plan_page_groups(
            &self.buffer,
            &self.protected,
            pinned,
            self.config.min_recent_per_lane,
        );
        written += self.page_out_groups(groups, low).await?;

        if self.rendered_tokens() > low {
            let groups = plan_tool_retention(
                &self.buffer,
                &self.protected,
                pinned,
                self.config.keep_recent_tools,
            );
            written += self.page_out_groups(groups, low).await?;
        }

        if self.rendered_tokens() > low {
            let (merged, flags) =
                consolidate_marker_runs(&self.buffer, &self.protected, pinned);
            if merged.len() < self.buffer.len() {
                debug!(
                    before = self.buffer.len(),
                    after = merged.len(),
                    "consolidated marker runs"
                );
                self.buffer = merged;
                self.protected = flags;
            }
        }

        Ok(written)
    }

    /// Summarize each group into a page, oldest first, replacing it in the
    /// buffer with a page-reference marker. Stops once under `low`. A page
    /// that cannot be written leaves its group in the buffer and surfaces
    /// the error.
    async fn page_out_groups(
        &mut self,
        groups: Vec<PageGroup>,
        low: usize,
    ) -> Result<usize, StoreError> {
        let dirs = self.session_dirs();
        let mut shift = 0usize;
        let mut written = 0usize;

        for g in groups {
            if self.rendered_tokens() <= low {
                break;
            }
            let range = (g.range.start - shift)..(g.range.end - shift);
            let group: Vec<Message> = self.buffer[range.clone()].to_vec();

            let text = render_for_summary(&group);
            let summary = self.summarizer.summarize(&text, g.lane.as_str()).await;
            let page = Page::from_group(g.lane, &group, summary);

            write_page(&dirs, &page).await?;

            let marker = Message::page_marker(&page.id, excerpt(&page.summary, 160));
            self.buffer.splice(range.clone(), [marker]);
            self.protected.splice(range.clone(), [false]);
            shift += range.len() - 1;
            written += 1;

            self.page_index.insert(
                page.id.clone(),
                PageDigest {
                    id: page.id.clone(),
                    label: page.label.clone(),
                    estimated_tokens: page.estimated_tokens,
                    loaded: false,
                },
            );
            debug!(page = %page.id, lane = %page.lane, messages = page.message_count, "paged out");
            emit(
                &self.events,
                CoreEvent::PageCreated {
                    id: page.id,
                    summary: page.summary,
                    label: page.label,
                },
            );
        }
        Ok(written)
    }

    fn remove_sentinels(&mut self) {
        let mut i = 0;
        while i < self.buffer.len() {
            if is_sentinel(&self.buffer[i]) {
                self.buffer.remove(i);
                self.protected.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Rewrite the journal to mirror the buffer. Atomic; a crash leaves the
    /// previous journal intact.
    async fn persist_journal(&self) -> Result<(), StoreError> {
        let dirs = self.session_dirs();
        dirs.ensure().await?;
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

    /// Replace the pinned system prompt in place (the `learn` directive
    /// hot-patches it with new facts). Inserts one when the buffer has no
    /// pinned prompt yet.
    pub async fn patch_pinned_prompt(&mut self, content: String) -> Result<(), StoreError> {
        if self.buffer.first().map(|m| m.role) == Some(Role::System) {
            self.buffer[0].content = content;
        } else {
            self.buffer.insert(0, Message::system(content));
            self.protected.insert(0, false);
        }
        self.persist_journal().await
    }

    async fn rebind(&mut self, session_id: &str) -> Result<(), StoreError> {
        if session_id == self.session_id {
            return Ok(());
        }
        let old = self.root.join(&self.session_id);
        let new = self.root.join(session_id);
        let old_exists = tokio::fs::metadata(&old).await.is_ok();
        let new_exists = tokio::fs::metadata(&new).await.is_ok();
        if old_exists && !new_exists {
            tokio::fs::rename(&old, &new).await?;
        }
        self.session_id = session_id.to_string();
        Ok(())
    }
}

fn excerpt(s: &str, max_chars: usize) -> String {
    let mut out: String = s.chars().take(max_chars).collect();
    if out.len() < s.len() {
        out.push('\u{2026}');
    }
    out
}

fn render_for_summary(group: &[Message]) -> String {
    let mut out = String::new();
    for m in group {
        let who = if m.from.is_empty() {
            m.role.to_string()
        } else {
            format!("{} ({})", m.role, m.from)
        };
        out.push_str(&format!("{who}: {}\n", m.content));
        for c in &m.tool_calls {
            out.push_str(&format!("  -> {}({})\n", c.name, c.args_json));
        }
    }
    out
}

fn slot_message(page: &Page) -> Message {
    let mut m = Message::system(format!(
        "[memory page {} | {}]\n{}",
        page.id, page.label, page.summary
    ));
    m.page_id = Some(page.id.clone());
    m
}

#[async_trait]
impl MessageStore for PagedStore {
    async fn add(&mut self, message: Message) -> Result<(), StoreError> {
        let dirs = self.session_dirs();
        dirs.ensure().await?;
        append_jsonl(&dirs.messages_path(), &message).await?;

        let protect = message.role == Role::Assistant && !message.tool_calls.is_empty();
        let is_tool = message.role == Role::Tool;
        self.buffer.push(message);
        self.protected.push(protect);
        if is_tool {
            self.release_answered();
        }
        self.maybe_compact().await
    }

    async fn add_if_not_exists(&mut self, message: Message) -> Result<bool, StoreError> {
        if self.buffer.contains(&message) {
            return Ok(false);
        }
        self.add(message).await?;
        Ok(true)
    }

    fn messages(&self) -> Vec<Message> {
        let pinned = self.pinned_count();
        let mut out: Vec<Message> = self.buffer[..pinned].to_vec();
        let mut flags: Vec<bool> = vec![false; pinned];
        out.extend(self.page_slot.iter().map(|p| p.message.clone()));
        flags.extend(std::iter::repeat(false).take(self.page_slot.len()));
        out.extend(self.buffer[pinned..].iter().cloned());
        flags.extend(self.protected[pinned..].iter().copied());

        let flat = flatten_broken_pairs(&out);
        let flags = if flat.len() == out.len() {
            flags
        } else {
            vec![false; flat.len()]
        };
        hard_truncate(&flat, &flags, pinned, self.config.working_budget())
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
        let id = page_id.trim();
        if !id.is_empty() && !self.pending_refs.iter().any(|p| p == id) {
            self.pending_refs.push(id.to_string());
        }
    }

    fn unref_page(&mut self, page_id: &str) {
        let id = page_id.trim();
        if !id.is_empty() {
            self.pending_unrefs.push(id.to_string());
        }
    }

    async fn load_requested_pages(&mut self) -> Result<(), StoreError> {
        let dirs = self.session_dirs();

        for id in std::mem::take(&mut self.pending_unrefs) {
            if let Some(pos) = self.page_slot.iter().position(|p| p.id == id) {
                self.page_slot.remove(pos);
                if let Some(d) = self.page_index.get_mut(&id) {
                    d.loaded = false;
                }
                emit(&self.events, CoreEvent::PageUnloaded { id });
            }
        }

        for id in std::mem::take(&mut self.pending_refs) {
            if self.page_slot.iter().any(|p| p.id == id) {
                continue;
            }
            let Some(page) = read_page(&dirs, &id).await else {
                warn!(page = %id, "ref for unknown or unreadable page, skipped");
                continue;
            };
            let message = slot_message(&page);
            let tokens = estimate_message_tokens(&message);
            if self.slot_tokens() + tokens > self.config.page_slot_tokens {
                // Recency priority: an oversized page blocks the queue
                // rather than yielding to smaller later ones.
                warn!(page = %id, "page slot budget reached, stopping loads");
                break;
            }
            if let Some(d) = self.page_index.get_mut(&id) {
                d.loaded = true;
            }
            self.page_slot.push(LoadedPage {
                id: id.clone(),
                tokens,
                message,
            });
            emit(&self.events, CoreEvent::PageLoaded { id });
        }
        Ok(())
    }

    async fn force_compact(&mut self) -> Result<(), StoreError> {
        // The sentinel marks the forced epoch for the compactor; it must
        // not survive this call on any exit path.
        self.buffer.push(sentinel());
        self.protected.push(true);
        let result = self.run_compaction(true).await;
        self.remove_sentinels();
        result
    }

    async fn hot_reload_config(&mut self, overrides: BudgetOverrides) -> Result<(), StoreError> {
        let mut next = self.config.clone();
        if let Some(working) = overrides.working_tokens {
            next.context_tokens = working + next.reserve_header + next.reserve_response;
        }
        if let Some(page_slot) = overrides.page_slot_tokens {
            next.page_slot_tokens = page_slot;
        }
        next.validate()?;
        info!(
            working = next.working_budget(),
            page_slot = next.page_slot_tokens,
            "budgets hot-reloaded"
        );
        self.config = next;
        self.maybe_compact().await
    }

    async fn save(&mut self, session_id: &str) -> Result<(), StoreError> {
        self.rebind(session_id).await?;
        let dirs = self.session_dirs();
        dirs.ensure().await?;
        let meta = SessionMeta {
            id: self.session_id.clone(),
            created_at: self.created_at,
            provider: self.config.provider.clone(),
            model: self.config.model.clone(),
            loaded_pages: self.page_slot.iter().map(|p| p.id.clone()).collect(),
        };
        write_json_atomic(&dirs.meta_path(), &meta).await?;
        self.persist_journal().await
    }

    async fn load(&mut self, session_id: &str) -> Result<(), StoreError> {
        self.session_id = session_id.to_string();
        let dirs = self.session_dirs();

        self.buffer = read_jsonl(&dirs.messages_path()).await?;
        self.buffer = flatten_broken_pairs(&self.buffer);
        self.protected = vec![false; self.buffer.len()];
        self.page_slot.clear();
        self.pending_refs.clear();
        self.pending_unrefs.clear();

        self.page_index.clear();
        for id in list_page_ids(&dirs).await? {
            if let Some(page) = read_page(&dirs, &id).await {
                self.page_index.insert(
                    id.clone(),
                    PageDigest {
                        id,
                        label: page.label,
                        estimated_tokens: page.estimated_tokens,
                        loaded: false,
                    },
                );
            }
        }

        if let Some(meta) = read_json::<SessionMeta>(&dirs.meta_path()).await {
            self.created_at = meta.created_at;
            for id in meta.loaded_pages {
                self.pending_refs.push(id);
            }
            self.load_requested_pages().await?;
        }
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        let mut lane_tokens: std::collections::HashMap<Role, usize> = Default::default();
        for m in &self.buffer {
            *lane_tokens.entry(m.role).or_default() += estimate_message_tokens(m);
        }
        StoreStats {
            total_messages: self.buffer.len() + self.page_slot.len(),
            estimated_tokens: self.rendered_tokens(),
            working_budget: self.config.working_budget(),
            lane_tokens,
            page_count: self.page_index.len(),
            loaded_pages: self.page_slot.len(),
            compaction_active: self.compacting,
            model: self.config.model.clone(),
            pages: self.page_index.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKind;
    use crate::summarize::FixedSummarizer;
    use crate::types::ToolCall;

    fn small_config() -> StoreConfig {
        StoreConfig {
            context_tokens: 4096,
            reserve_header: 0,
            reserve_response: 0,
            page_slot_tokens: 1024,
            min_recent_per_lane: 2,
            keep_recent_tools: 2,
            ..StoreConfig::default()
        }
    }

    fn store_in(dir: &std::path::Path, config: StoreConfig) -> PagedStore {
        PagedStore::new(dir, config, Arc::new(FixedSummarizer::default()))
    }

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "probe".into(),
            args_json: "{\"n\":1}".into(),
        }
    }

    fn triple(n: usize) -> [Message; 3] {
        let pad = "x".repeat(200);
        [
            Message::user(format!("question {n} {pad}")),
            Message::assistant_with_calls(format!("answer {n} {pad}"), vec![call(&format!("c{n}"))]),
            Message::tool_result(format!("c{n}"), "probe", format!("result {n} {pad}")),
        ]
    }

    #[tokio::test]
    async fn compaction_preserves_recent_tool_pairs() {
        // Scenario S1: small budget, 60 triples, force_compact, then the
        // last tool pairs must be intact and paired.
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), small_config());
        store.add(Message::system("pinned prompt")).await.unwrap();
        for n in 0..60 {
            for m in triple(n) {
                store.add(m).await.unwrap();
            }
            store.clear_protected();
        }
        store.force_compact().await.unwrap();

        let msgs = store.messages();
        assert!(crate::store::compact::pairing_ok(&msgs));
        assert!(estimate_sequence_tokens(&msgs) <= store.config().working_budget());

        // The most recent two tool rounds survive, paired and adjacent.
        for n in [58, 59] {
            let pos = msgs
                .iter()
                .position(|m| {
                    m.role == Role::Tool && m.content.starts_with(&format!("result {n}"))
                })
                .unwrap_or_else(|| panic!("result {n} missing"));
            let id = msgs[pos].tool_call_id.as_deref().unwrap();
            let parent = &msgs[pos - 1];
            assert_eq!(parent.role, Role::Assistant);
            assert!(parent.tool_calls.iter().any(|c| c.id == id));
        }
    }

    #[tokio::test]
    async fn budget_ceiling_always_holds() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), small_config());
        store.add(Message::system("pinned")).await.unwrap();
        for n in 0..120 {
            store
                .add(Message::user(format!("msg {n} {}", "y".repeat(300))))
                .await
                .unwrap();
            let rendered = store.messages();
            assert!(
                estimate_sequence_tokens(&rendered) <= store.config().working_budget(),
                "ceiling broken after add {n}"
            );
        }
    }

    #[tokio::test]
    async fn pinned_system_survives_compaction_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), small_config());
        let prompt = "You are the resident agent. Keep it terse.";
        store.add(Message::system(prompt)).await.unwrap();
        for n in 0..80 {
            store
                .add(Message::user(format!("filler {n} {}", "z".repeat(250))))
                .await
                .unwrap();
        }
        store.force_compact().await.unwrap();
        let msgs = store.messages();
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[0].content, prompt);
    }

    #[tokio::test]
    async fn compaction_creates_pages_and_markers() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut store = store_in(dir.path(), small_config()).with_events(tx);
        store.add(Message::system("p")).await.unwrap();
        for n in 0..60 {
            store
                .add(Message::user(format!("filler {n} {}", "w".repeat(250))))
                .await
                .unwrap();
        }
        store.force_compact().await.unwrap();

        let stats = store.stats();
        assert!(stats.page_count > 0);
        assert!(store
            .raw_messages()
            .iter()
            .any(|m| m.role == Role::Memory && m.page_id.is_some()));

        let mut created = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, CoreEvent::PageCreated { .. }) {
                created += 1;
            }
        }
        assert_eq!(created, stats.page_count);

        // Page files exist on disk.
        let ids = list_page_ids(&store.session_dirs()).await.unwrap();
        assert_eq!(ids.len(), stats.page_count);
    }

    #[tokio::test]
    async fn ref_loads_and_unref_unloads_next_turn() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), small_config());
        store.add(Message::system("p")).await.unwrap();
        for n in 0..60 {
            store
                .add(Message::user(format!("filler {n} {}", "q".repeat(250))))
                .await
                .unwrap();
        }
        store.force_compact().await.unwrap();
        let id = store.stats().pages[0].id.clone();

        store.ref_page(&id);
        // Not loaded until the turn boundary.
        assert_eq!(store.stats().loaded_pages, 0);
        store.load_requested_pages().await.unwrap();
        assert_eq!(store.stats().loaded_pages, 1);
        assert!(store
            .messages()
            .iter()
            .any(|m| m.page_id.as_deref() == Some(id.as_str())));

        store.unref_page(&id);
        store.load_requested_pages().await.unwrap();
        assert_eq!(store.stats().loaded_pages, 0);
    }

    #[tokio::test]
    async fn page_slot_budget_stops_loading_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config();
        // Room for one slot summary, not two.
        config.page_slot_tokens = 40;
        let mut store = store_in(dir.path(), config);
        store.add(Message::system("p")).await.unwrap();
        // Enough volume for at least two compaction rounds.
        for n in 0..100 {
            store
                .add(Message::user(format!("filler {n} {}", "r".repeat(250))))
                .await
                .unwrap();
        }
        store.force_compact().await.unwrap();
        let ids: Vec<String> = store.stats().pages.iter().map(|p| p.id.clone()).collect();
        assert!(ids.len() >= 2);

        for id in &ids {
            store.ref_page(id);
        }
        store.load_requested_pages().await.unwrap();
        let loaded = store.stats().loaded_pages;
        assert!(loaded < ids.len(), "budget should stop some loads");
        // FIFO: the loaded ones are the earliest requested.
        let loaded_ids: Vec<String> = store
            .stats()
            .pages
            .iter()
            .filter(|p| p.loaded)
            .map(|p| p.id.clone())
            .collect();
        assert_eq!(loaded_ids, ids[..loaded].to_vec());
    }

    #[tokio::test]
    async fn force_compact_removes_sentinel_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), small_config());
        store.add(Message::system("p")).await.unwrap();
        for n in 0..40 {
            store
                .add(Message::user(format!("filler {n} {}", "s".repeat(250))))
                .await
                .unwrap();
        }
        store.force_compact().await.unwrap();
        assert!(!store.raw_messages().iter().any(is_sentinel));
    }

    #[tokio::test]
    async fn force_compact_removes_sentinel_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), small_config());
        store.add(Message::system("p")).await.unwrap();
        for n in 0..40 {
            store
                .add(Message::user(format!("filler {n} {}", "t".repeat(250))))
                .await
                .unwrap();
        }
        // Sabotage the pages directory so page writes fail.
        let pages = store.session_dirs().pages_dir();
        tokio::fs::remove_dir_all(&pages).await.unwrap();
        tokio::fs::write(&pages, b"not a directory").await.unwrap();

        let before = store.raw_messages();
        let err = store.force_compact().await.unwrap_err();
        assert!(matches!(err, StoreError::Page { .. }));
        assert!(!store.raw_messages().iter().any(is_sentinel));
        // The failed group stayed in the buffer.
        assert_eq!(store.raw_messages(), before);
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), small_config());
        store.add(Message::system("pinned")).await.unwrap();
        for n in 0..50 {
            store
                .add(Message::user(format!("filler {n} {}", "u".repeat(250))))
                .await
                .unwrap();
        }
        store.force_compact().await.unwrap();
        let id = store.stats().pages[0].id.clone();
        store.ref_page(&id);
        store.load_requested_pages().await.unwrap();
        store.save("sess-roundtrip").await.unwrap();
        let raw = store.raw_messages();

        let mut restored = store_in(dir.path(), small_config());
        restored.load("sess-roundtrip").await.unwrap();
        assert_eq!(restored.raw_messages(), raw);
        assert_eq!(restored.stats().loaded_pages, 1);
        assert_eq!(restored.stats().page_count, store.stats().page_count);
    }

    #[tokio::test]
    async fn load_flattens_broken_journal() {
        // Scenario S6 shape: an assistant whose results were lost.
        let dir = tempfile::tempdir().unwrap();
        let session = "sess-broken";
        let dirs = SessionDirs::new(dir.path().join(session));
        dirs.ensure().await.unwrap();
        append_jsonl(&dirs.messages_path(), &Message::user("go"))
            .await
            .unwrap();
        append_jsonl(
            &dirs.messages_path(),
            &Message::assistant_with_calls("on it", vec![call("cx")]),
        )
        .await
        .unwrap();
        append_jsonl(&dirs.messages_path(), &Message::user("next"))
            .await
            .unwrap();

        let mut store = store_in(dir.path(), small_config());
        store.load(session).await.unwrap();
        let msgs = store.messages();
        assert!(crate::store::compact::pairing_ok(&msgs));

        let narration = msgs
            .iter()
            .find(|m| m.summarized_tool_call.is_some())
            .expect("narration present");
        assert!(narration.tool_calls.is_empty());
        assert_eq!(
            narration.summarized_tool_call.as_ref().unwrap().id,
            "cx"
        );
        assert!(msgs
            .iter()
            .any(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some("cx")));
    }

    #[tokio::test]
    async fn protected_messages_are_not_paged() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), small_config());
        store.add(Message::system("p")).await.unwrap();
        let keep = Message::user(format!("keep me around {}", "k".repeat(200)));
        store.add(keep.clone()).await.unwrap();
        store.protect(&keep);
        for n in 0..60 {
            store
                .add(Message::user(format!("filler {n} {}", "v".repeat(250))))
                .await
                .unwrap();
        }
        assert!(store
            .raw_messages()
            .iter()
            .any(|m| m.content.starts_with("keep me around")));
    }

    #[tokio::test]
    async fn assistant_with_calls_is_protected_until_answered() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), small_config());
        store.add(Message::system("p")).await.unwrap();
        let assistant = Message::assistant_with_calls("working", vec![call("cz")]);
        store.add(assistant.clone()).await.unwrap();
        let pos = store.buffer.iter().position(|m| *m == assistant).unwrap();
        assert!(store.protected[pos]);
        store
            .add(Message::tool_result("cz", "probe", "done"))
            .await
            .unwrap();
        assert!(!store.protected[pos]);
    }

    #[tokio::test]
    async fn add_if_not_exists_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), small_config());
        let m = Message::user("once");
        assert!(store.add_if_not_exists(m.clone()).await.unwrap());
        assert!(!store.add_if_not_exists(m).await.unwrap());
        assert_eq!(store.raw_messages().len(), 1);
    }

    #[tokio::test]
    async fn hot_reload_validates_and_recompacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), small_config());
        store.add(Message::system("p")).await.unwrap();
        for n in 0..20 {
            store
                .add(Message::user(format!("filler {n} {}", "h".repeat(200))))
                .await
                .unwrap();
        }

        // Impossible budget rejected, config unchanged.
        let err = store
            .hot_reload_config(BudgetOverrides {
                working_tokens: Some(10),
                page_slot_tokens: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Budget(_)));
        assert_eq!(store.config().working_budget(), 4096);

        // Shrinking the budget triggers compaction.
        store
            .hot_reload_config(BudgetOverrides {
                working_tokens: Some(1024),
                page_slot_tokens: Some(512),
            })
            .await
            .unwrap();
        assert!(store.stats().page_count > 0);
        assert!(
            estimate_sequence_tokens(&store.messages()) <= store.config().working_budget()
        );
    }

    #[tokio::test]
    async fn memory_kind_swap_replays_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut any = crate::store::AnyStore::Paged(store_in(dir.path(), small_config()));
        any.add(Message::system("pinned")).await.unwrap();
        any.add(Message::user("hello")).await.unwrap();
        any.add(Message::assistant("hi")).await.unwrap();

        any.swap_kind(MemoryKind::Ephemeral).await.unwrap();
        assert_eq!(any.kind(), MemoryKind::Ephemeral);
        let msgs = any.messages();
        assert_eq!(msgs[0].content, "pinned");
        assert_eq!(msgs.len(), 3);

        any.swap_kind(MemoryKind::Paged).await.unwrap();
        assert_eq!(any.kind(), MemoryKind::Paged);
        assert_eq!(any.messages().len(), 3);
    }
}
