//! The message store: a bounded working buffer backed by on-disk pages.

pub mod compact;
pub mod ephemeral;
pub mod page;
pub mod paged;

pub use ephemeral::EphemeralStore;
pub use page::Page;
pub use paged::PagedStore;

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{Message, Role};

/// Everything the model sees flows through one of these. The ONE place all
/// buffer decisions happen: admission, pairing repair, paging, budgets.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message. Assistant messages carrying tool calls are
    /// protected until their results arrive. May compact when the buffer
    /// crosses the high watermark; returns only once the buffer is in a
    /// valid state.
    async fn add(&mut self, message: Message) -> Result<(), StoreError>;

    /// Append only if no structurally identical message is buffered.
    /// Returns whether the message was added.
    async fn add_if_not_exists(&mut self, message: Message) -> Result<bool, StoreError>;

    /// The rendered prompt sequence, as a fresh copy the caller may mutate.
    /// Always satisfies the pairing invariant and the working-budget
    /// ceiling, falling back to hard truncation if compaction has not
    /// caught up.
    fn messages(&self) -> Vec<Message>;

    /// The raw buffer, pinned prompts included, page slot excluded. Used
    /// for hot-swap replay and persistence; not budget-enforced.
    fn raw_messages(&self) -> Vec<Message>;

    /// Shield a buffered message (matched structurally) from compaction
    /// and paging until `clear_protected`.
    fn protect(&mut self, message: &Message);

    /// Drop all protection flags. Called at the end of each tool round.
    fn clear_protected(&mut self);

    /// Request that a page be loaded into the page slot at the start of
    /// the next turn.
    fn ref_page(&mut self, page_id: &str);

    /// Request that a loaded page be dropped at the start of the next turn.
    fn unref_page(&mut self, page_id: &str);

    /// Turn boundary: apply pending ref/unref requests, loading summaries
    /// FIFO until the page-slot budget stops further loads.
    async fn load_requested_pages(&mut self) -> Result<(), StoreError>;

    /// Synchronously compact to the low-watermark target. Any transient
    /// sentinel the method inserts is removed on every exit path.
    async fn force_compact(&mut self) -> Result<(), StoreError>;

    /// Atomically swap budgets, then re-evaluate (which may compact).
    async fn hot_reload_config(&mut self, overrides: BudgetOverrides) -> Result<(), StoreError>;

    /// Persist journal, page files, and slot assignments for `session_id`.
    async fn save(&mut self, session_id: &str) -> Result<(), StoreError>;

    /// Restore a previously saved session.
    async fn load(&mut self, session_id: &str) -> Result<(), StoreError>;

    fn stats(&self) -> StoreStats;
}

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

/// Token budgets, all in estimated tokens.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub model: String,
    pub provider: String,
    pub context_tokens: usize,
    pub reserve_header: usize,
    pub reserve_response: usize,
    pub page_slot_tokens: usize,
    /// Compaction trigger as a fraction of the working budget.
    pub high_ratio: f32,
    /// Compaction target as a fraction of the working budget.
    pub low_ratio: f32,
    /// Per-lane tail spared from phase-1 compaction.
    pub min_recent_per_lane: usize,
    /// Tool messages spared from phase-2 retention pruning.
    pub keep_recent_tools: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            model: "unknown".into(),
            provider: "unknown".into(),
            context_tokens: 128_000,
            reserve_header: 2_000,
            reserve_response: 8_000,
            page_slot_tokens: 12_000,
            high_ratio: 0.80,
            low_ratio: 0.60,
            min_recent_per_lane: 4,
            keep_recent_tools: 4,
        }
    }
}

impl StoreConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_context_tokens(mut self, tokens: usize) -> Self {
        self.context_tokens = tokens;
        self
    }

    pub fn with_page_slot_tokens(mut self, tokens: usize) -> Self {
        self.page_slot_tokens = tokens;
        self
    }

    pub fn with_min_recent_per_lane(mut self, n: usize) -> Self {
        self.min_recent_per_lane = n;
        self
    }

    pub fn with_keep_recent_tools(mut self, n: usize) -> Self {
        self.keep_recent_tools = n;
        self
    }

    pub fn with_watermarks(mut self, high: f32, low: f32) -> Self {
        self.high_ratio = high;
        self.low_ratio = low;
        self
    }

    /// Space available to the prompt after the reserves.
    pub fn working_budget(&self) -> usize {
        self.context_tokens
            .saturating_sub(self.reserve_header)
            .saturating_sub(self.reserve_response)
    }

    /// Lane budget: what recent conversation may use after the page slot.
    pub fn lane_budget(&self) -> usize {
        self.working_budget().saturating_sub(self.page_slot_tokens)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.working_budget() < crate::marker::directive::MIN_BUDGET_TOKENS {
            return Err(StoreError::Budget(format!(
                "working budget {} below floor {}",
                self.working_budget(),
                crate::marker::directive::MIN_BUDGET_TOKENS
            )));
        }
        if self.page_slot_tokens > self.working_budget() {
            return Err(StoreError::Budget(format!(
                "page slot {} exceeds working budget {}",
                self.page_slot_tokens,
                self.working_budget()
            )));
        }
        if !(0.0..=1.0).contains(&self.low_ratio)
            || !(0.0..=1.0).contains(&self.high_ratio)
            || self.low_ratio > self.high_ratio
        {
            return Err(StoreError::Budget(format!(
                "watermarks low={} high={} out of order",
                self.low_ratio, self.high_ratio
            )));
        }
        Ok(())
    }
}

/// Partial budget update from `hot_reload_config` or a budget directive.
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetOverrides {
    pub working_tokens: Option<usize>,
    pub page_slot_tokens: Option<usize>,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Per-page digest for the context map.
#[derive(Debug, Clone)]
pub struct PageDigest {
    pub id: String,
    pub label: String,
    pub estimated_tokens: usize,
    pub loaded: bool,
}

/// Snapshot of store state, consumed by the sensory overlay's context map.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total_messages: usize,
    pub estimated_tokens: usize,
    pub working_budget: usize,
    pub lane_tokens: HashMap<Role, usize>,
    pub page_count: usize,
    pub loaded_pages: usize,
    pub compaction_active: bool,
    pub model: String,
    pub pages: Vec<PageDigest>,
}

// ---------------------------------------------------------------------------
// Memory kinds
// ---------------------------------------------------------------------------

/// Which store implementation backs the buffer. Selected by the
/// `memory(kind)` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Page-and-summarize virtual memory. The default.
    Paged,
    /// Bounded buffer, oldest-drop, nothing persisted but the journal.
    Ephemeral,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Paged => "paged",
            MemoryKind::Ephemeral => "ephemeral",
        }
    }
}

impl FromStr for MemoryKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paged" | "default" => Ok(MemoryKind::Paged),
            "ephemeral" => Ok(MemoryKind::Ephemeral),
            other => Err(StoreError::Budget(format!("unknown memory kind: {other}"))),
        }
    }
}

/// Tagged union over the store implementations, so a directive can swap the
/// backing strategy mid-session while callers keep one concrete type.
pub enum AnyStore {
    Paged(PagedStore),
    Ephemeral(EphemeralStore),
}

impl AnyStore {
    pub fn kind(&self) -> MemoryKind {
        match self {
            AnyStore::Paged(_) => MemoryKind::Paged,
            AnyStore::Ephemeral(_) => MemoryKind::Ephemeral,
        }
    }

    /// Replace the pinned system prompt across variants.
    pub async fn patch_pinned_prompt(&mut self, content: String) -> Result<(), StoreError> {
        match self {
            AnyStore::Paged(s) => s.patch_pinned_prompt(content).await,
            AnyStore::Ephemeral(s) => {
                s.patch_pinned_prompt(content);
                Ok(())
            }
        }
    }

    /// Hot-swap the backing implementation, replaying the current buffer
    /// into the new variant's `add` so pinning and pairing carry over.
    pub async fn swap_kind(&mut self, kind: MemoryKind) -> Result<(), StoreError> {
        if self.kind() == kind {
            return Ok(());
        }
        let replay = self.raw_messages();
        let mut next = match (&*self, kind) {
            (AnyStore::Paged(p), MemoryKind::Ephemeral) => {
                AnyStore::Ephemeral(EphemeralStore::from_parts(p.parts()))
            }
            (AnyStore::Ephemeral(e), MemoryKind::Paged) => {
                AnyStore::Paged(PagedStore::from_parts(e.parts()))
            }
            _ => return Ok(()),
        };
        for message in replay {
            next.add(message).await?;
        }
        *self = next;
        Ok(())
    }
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            AnyStore::Paged($inner) => $body,
            AnyStore::Ephemeral($inner) => $body,
        }
    };
}

#[async_trait]
impl MessageStore for AnyStore {
    async fn add(&mut self, message: Message) -> Result<(), StoreError> {
        delegate!(self, s => s.add(message).await)
    }

    async fn add_if_not_exists(&mut self, message: Message) -> Result<bool, StoreError> {
        delegate!(self, s => s.add_if_not_exists(message).await)
    }

    fn messages(&self) -> Vec<Message> {
        delegate!(self, s => s.messages())
    }

    fn raw_messages(&self) -> Vec<Message> {
        delegate!(self, s => s.raw_messages())
    }

    fn protect(&mut self, message: &Message) {
        delegate!(self, s => s.protect(message))
    }

    fn clear_protected(&mut self) {
        delegate!(self, s => s.clear_protected())
    }

    fn ref_page(&mut self, page_id: &str) {
        delegate!(self, s => s.ref_page(page_id))
    }

    fn unref_page(&mut self, page_id: &str) {
        delegate!(self, s => s.unref_page(page_id))
    }

    async fn load_requested_pages(&mut self) -> Result<(), StoreError> {
        delegate!(self, s => s.load_requested_pages().await)
    }

    async fn force_compact(&mut self) -> Result<(), StoreError> {
        delegate!(self, s => s.force_compact().await)
    }

    async fn hot_reload_config(&mut self, overrides: BudgetOverrides) -> Result<(), StoreError> {
        delegate!(self, s => s.hot_reload_config(overrides).await)
    }

    async fn save(&mut self, session_id: &str) -> Result<(), StoreError> {
        delegate!(self, s => s.save(session_id).await)
    }

    async fn load(&mut self, session_id: &str) -> Result<(), StoreError> {
        delegate!(self, s => s.load(session_id).await)
    }

    fn stats(&self) -> StoreStats {
        delegate!(self, s => s.stats())
    }
}
