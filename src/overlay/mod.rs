//! Sensory overlay: a decorator around a [`MessageStore`] that splices a
//! fixed-width status panel into the prompt each turn. Composition with
//! delegation; the overlay forwards everything except `messages()`, which
//! it augments with the panel message.

pub mod channel;
pub mod grid;

pub use channel::{Channel, ChannelSource, PollContext, UpdateMode};
pub use grid::PANEL_WIDTH;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::session::{read_json, write_json_atomic, SessionDirs};
use crate::store::{AnyStore, BudgetOverrides, MemoryKind, MessageStore, StoreStats};
use crate::types::{Message, Role};

/// Default slot bindings, backfilled when persisted state is missing or
/// corrupt.
pub const DEFAULT_SLOTS: [&str; 3] = ["context", "time", "config"];

const SLOT_COUNT: usize = 3;

/// Persisted shape of `sensory-state.json`.
#[derive(Debug, Serialize, Deserialize)]
struct SensoryState {
    slots: Vec<Option<String>>,
    channels: HashMap<String, ChannelState>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChannelState {
    enabled: bool,
}

/// The decorator. Holds the inner store by value; the `memory(kind)`
/// directive swaps the inner variant while channel and slot state persist.
pub struct SensoryOverlay {
    inner: AnyStore,
    channels: Vec<Channel>,
    slots: [Option<String>; SLOT_COUNT],
    turn: usize,
    session_started: DateTime<Utc>,
}

impl SensoryOverlay {
    pub fn new(inner: AnyStore) -> Self {
        let kind = inner.kind();
        let mut overlay = Self {
            inner,
            channels: channel::standard_channels(kind.as_str()),
            slots: [None, None, None],
            turn: 0,
            session_started: Utc::now(),
        };
        overlay.slots = overlay.heal_slots([
            Some(DEFAULT_SLOTS[0].into()),
            Some(DEFAULT_SLOTS[1].into()),
            Some(DEFAULT_SLOTS[2].into()),
        ]);
        overlay
    }

    pub fn inner(&self) -> &AnyStore {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut AnyStore {
        &mut self.inner
    }

    pub fn slots(&self) -> &[Option<String>; SLOT_COUNT] {
        &self.slots
    }

    fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.name == name)
    }

    /// Swap the backing store implementation. Channel configuration and
    /// slot state are preserved; sources that describe the store are
    /// rebound to the new variant.
    pub async fn swap_memory_kind(&mut self, kind: MemoryKind) -> Result<(), StoreError> {
        self.inner.swap_kind(kind).await?;
        let kind_name = self.inner.kind().as_str();
        if let Some(config) = self.channel_mut("config") {
            config.set_source(channel::ConfigSource { memory_kind: kind_name });
        }
        Ok(())
    }

    /// Bind a channel to a slot. Refuses unknown and non-viewable
    /// channels, leaving the slot unchanged.
    pub fn switch_view(&mut self, name: &str, slot: usize) -> bool {
        if slot >= SLOT_COUNT {
            warn!(slot, "no such camera slot");
            return false;
        }
        match self.channel(name) {
            Some(c) if c.viewable => {}
            Some(_) => {
                warn!(channel = name, "channel is not viewable");
                return false;
            }
            None => {
                warn!(channel = name, "unknown channel");
                return false;
            }
        }
        // A channel occupies at most one slot.
        for s in self.slots.iter_mut() {
            if s.as_deref() == Some(name) {
                *s = None;
            }
        }
        self.slots[slot] = Some(name.to_string());
        true
    }

    /// Step slot 0 through the viewable channels, skipping channels bound
    /// to other slots. A single viewable channel stays put.
    pub fn cycle_slot_0(&mut self, forward: bool) {
        let taken: HashSet<&str> = self.slots[1..]
            .iter()
            .filter_map(|s| s.as_deref())
            .collect();
        let ring: Vec<&str> = self
            .channels
            .iter()
            .filter(|c| c.viewable && !taken.contains(c.name.as_str()))
            .map(|c| c.name.as_str())
            .collect();
        if ring.len() <= 1 {
            return;
        }
        let current = self.slots[0]
            .as_deref()
            .and_then(|name| ring.iter().position(|r| *r == name))
            .unwrap_or(0);
        let next = if forward {
            (current + 1) % ring.len()
        } else {
            (current + ring.len() - 1) % ring.len()
        };
        self.slots[0] = Some(ring[next].to_string());
    }

    /// Enable or disable a channel (`sense` directive). Unknown names are
    /// refused.
    pub fn set_channel_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.channel_mut(name) {
            Some(c) => {
                c.enabled = enabled;
                true
            }
            None => {
                warn!(channel = name, "unknown channel");
                false
            }
        }
    }

    /// Turn boundary: poll every `every_turn` channel source with a fresh
    /// view of the inner store.
    pub fn poll_sources(&mut self) {
        self.turn += 1;
        let stats = self.inner.stats();
        let ctx = PollContext {
            stats: &stats,
            now: Utc::now(),
            session_started: self.session_started,
            turn: self.turn,
        };
        for c in self.channels.iter_mut() {
            c.poll(&ctx);
        }
    }

    /// The synthetic system message for this turn, or `None` when every
    /// slot is empty or disabled.
    pub fn panel_message(&self) -> Option<Message> {
        let mut lines: Vec<String> = Vec::new();
        for slot in self.slots.iter() {
            let Some(name) = slot.as_deref() else {
                continue;
            };
            let Some(c) = self.channel(name) else {
                continue;
            };
            if !c.enabled {
                continue;
            }
            lines.extend(grid::render_box(&c.name, c.content(), Some(c.height)));
        }
        if lines.is_empty() {
            return None;
        }
        Some(Message::system(lines.join("\n")).with_from("sensory"))
    }

    /// Persist slot assignments and channel enables.
    pub async fn save_state(&self, dirs: &SessionDirs) -> Result<(), StoreError> {
        let state = SensoryState {
            slots: self.slots.iter().cloned().collect(),
            channels: self
                .channels
                .iter()
                .map(|c| (c.name.clone(), ChannelState { enabled: c.enabled }))
                .collect(),
        };
        dirs.ensure().await?;
        write_json_atomic(&dirs.sensory_state_path(), &state).await?;
        Ok(())
    }

    /// Restore state, validating and healing the persisted slots: null,
    /// duplicate, unknown, and non-viewable entries are stripped and
    /// backfilled from defaults subject to uniqueness.
    pub async fn load_state(&mut self, dirs: &SessionDirs) -> Result<(), StoreError> {
        let Some(state) = read_json::<SensoryState>(&dirs.sensory_state_path()).await else {
            return Ok(());
        };
        for (name, cs) in &state.channels {
            if let Some(c) = self.channel_mut(name) {
                c.enabled = cs.enabled;
            }
        }
        let mut raw: [Option<String>; SLOT_COUNT] = [None, None, None];
        for (i, slot) in state.slots.into_iter().take(SLOT_COUNT).enumerate() {
            raw[i] = slot;
        }
        self.slots = self.heal_slots(raw);
        debug!(slots = ?self.slots, "sensory state restored");
        Ok(())
    }

    fn heal_slots(&self, raw: [Option<String>; SLOT_COUNT]) -> [Option<String>; SLOT_COUNT] {
        let mut seen: HashSet<String> = HashSet::new();
        let mut healed: [Option<String>; SLOT_COUNT] = [None, None, None];

        for (i, slot) in raw.into_iter().enumerate() {
            let Some(name) = slot else {
                continue;
            };
            let valid = self.channel(&name).is_some_and(|c| c.viewable);
            if valid && seen.insert(name.clone()) {
                healed[i] = Some(name);
            }
        }
        for (i, default) in DEFAULT_SLOTS.iter().enumerate() {
            if healed[i].is_none() && !seen.contains(*default) {
                if self.channel(default).is_some_and(|c| c.viewable) {
                    seen.insert((*default).to_string());
                    healed[i] = Some((*default).to_string());
                }
            }
        }
        healed
    }

    /// Replace the pinned system prompt on the inner store.
    pub async fn patch_pinned_prompt(&mut self, content: String) -> Result<(), StoreError> {
        self.inner.patch_pinned_prompt(content).await
    }

    /// Where the panel goes: immediately after the pinned system prompts.
    fn panel_position(messages: &[Message]) -> usize {
        messages
            .iter()
            .take(2)
            .take_while(|m| m.role == Role::System && m.page_id.is_none())
            .count()
    }
}

#[async_trait]
impl MessageStore for SensoryOverlay {
    async fn add(&mut self, message: Message) -> Result<(), StoreError> {
        self.inner.add(message).await
    }

    async fn add_if_not_exists(&mut self, message: Message) -> Result<bool, StoreError> {
        self.inner.add_if_not_exists(message).await
    }

    fn messages(&self) -> Vec<Message> {
        let mut out = self.inner.messages();
        if let Some(panel) = self.panel_message() {
            let pos = Self::panel_position(&out);
            out.insert(pos, panel);
        }
        out
    }

    fn raw_messages(&self) -> Vec<Message> {
        self.inner.raw_messages()
    }

    fn protect(&mut self, message: &Message) {
        self.inner.protect(message)
    }

    fn clear_protected(&mut self) {
        self.inner.clear_protected()
    }

    fn ref_page(&mut self, page_id: &str) {
        self.inner.ref_page(page_id)
    }

    fn unref_page(&mut self, page_id: &str) {
        self.inner.unref_page(page_id)
    }

    async fn load_requested_pages(&mut self) -> Result<(), StoreError> {
        self.inner.load_requested_pages().await
    }

    async fn force_compact(&mut self) -> Result<(), StoreError> {
        self.inner.force_compact().await
    }

    async fn hot_reload_config(&mut self, overrides: BudgetOverrides) -> Result<(), StoreError> {
        self.inner.hot_reload_config(overrides).await
    }

    async fn save(&mut self, session_id: &str) -> Result<(), StoreError> {
        self.inner.save(session_id).await
    }

    async fn load(&mut self, session_id: &str) -> Result<(), StoreError> {
        self.inner.load(session_id).await
    }

    fn stats(&self) -> StoreStats {
        self.inner.stats()
    }
}
