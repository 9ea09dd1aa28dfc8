use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::overlay::grid::SEPARATOR;
use crate::store::StoreStats;
use crate::types::estimate_str_tokens;

/// When a channel's source is polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Content only changes when someone calls `set_content`.
    Manual,
    /// Source polled before every prompt assembly.
    EveryTurn,
}

/// Context handed to a channel source on poll.
pub struct PollContext<'a> {
    pub stats: &'a StoreStats,
    pub now: DateTime<Utc>,
    pub session_started: DateTime<Utc>,
    pub turn: usize,
}

/// A pollable producer of channel content lines.
pub trait ChannelSource: Send + Sync {
    fn poll(&mut self, ctx: &PollContext<'_>) -> Vec<String>;
}

/// One sensory channel: a named feed that can occupy a camera slot.
pub struct Channel {
    pub name: String,
    pub max_tokens: usize,
    pub update_mode: UpdateMode,
    pub enabled: bool,
    pub viewable: bool,
    /// Body rows the grid renders for this channel.
    pub height: usize,
    source: Option<Box<dyn ChannelSource>>,
    content: Vec<String>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_tokens: 256,
            update_mode: UpdateMode::Manual,
            enabled: true,
            viewable: true,
            height: 4,
            source: None,
            content: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: impl ChannelSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self.update_mode = UpdateMode::EveryTurn;
        self
    }

    pub fn with_height(mut self, height: usize) -> Self {
        self.height = height;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn non_viewable(mut self) -> Self {
        self.viewable = false;
        self
    }

    /// Feed content into a manual channel.
    pub fn set_content(&mut self, lines: Vec<String>) {
        self.content = lines;
    }

    /// Swap the source in place, e.g. after an inner-store swap. Channel
    /// configuration is untouched.
    pub fn set_source(&mut self, source: impl ChannelSource + 'static) {
        self.source = Some(Box::new(source));
        self.update_mode = UpdateMode::EveryTurn;
    }

    /// Poll the source if this channel has one and is due. Content is
    /// capped to the channel's token budget.
    pub fn poll(&mut self, ctx: &PollContext<'_>) {
        if !self.enabled || self.update_mode != UpdateMode::EveryTurn {
            return;
        }
        if let Some(source) = self.source.as_mut() {
            self.content = source.poll(ctx);
        }
        let mut used = 0;
        self.content.retain(|line| {
            used += estimate_str_tokens(line);
            used <= self.max_tokens
        });
    }

    pub fn content(&self) -> &[String] {
        &self.content
    }
}

// ---------------------------------------------------------------------------
// Standard channels
// ---------------------------------------------------------------------------

/// Memory map: budget bar, lane breakdown, page inventory.
pub struct ContextMapSource;

impl ChannelSource for ContextMapSource {
    fn poll(&mut self, ctx: &PollContext<'_>) -> Vec<String> {
        let s = ctx.stats;
        let mut out = vec![format!(
            "mem {} {}/{} tok  msgs {}  pages {} ({} loaded){}",
            super::grid::bar(s.estimated_tokens, s.working_budget, 16),
            s.estimated_tokens,
            s.working_budget,
            s.total_messages,
            s.page_count,
            s.loaded_pages,
            if s.compaction_active { "  compacting" } else { "" },
        )];

        let mut lanes: Vec<_> = s.lane_tokens.iter().collect();
        lanes.sort_by_key(|(role, _)| role.as_str());
        let lane_line = lanes
            .iter()
            .map(|(role, tokens)| format!("{role}:{tokens}"))
            .collect::<Vec<_>>()
            .join("  ");
        if !lane_line.is_empty() {
            out.push(format!("lanes  {lane_line}"));
        }

        if !s.pages.is_empty() {
            out.push(SEPARATOR.to_string());
            for page in s.pages.iter().rev().take(4) {
                let flag = if page.loaded { '*' } else { ' ' };
                out.push(format!(
                    "{flag}{}  {} tok  {}",
                    page.id, page.estimated_tokens, page.label
                ));
            }
        }
        out
    }
}

/// Wall clock, session elapsed, turn counter.
pub struct TimeSource;

impl ChannelSource for TimeSource {
    fn poll(&mut self, ctx: &PollContext<'_>) -> Vec<String> {
        let elapsed = ctx.now.signed_duration_since(ctx.session_started);
        let minutes = elapsed.num_minutes();
        vec![
            format!("utc {}", ctx.now.format("%Y-%m-%d %H:%M:%S")),
            format!("session {}h{:02}m  turn {}", minutes / 60, minutes % 60, ctx.turn),
        ]
    }
}

/// Model and memory configuration.
pub struct ConfigSource {
    pub memory_kind: &'static str,
}

impl ChannelSource for ConfigSource {
    fn poll(&mut self, ctx: &PollContext<'_>) -> Vec<String> {
        vec![
            format!("model {}", ctx.stats.model),
            format!(
                "memory {}  working {} tok",
                self.memory_kind, ctx.stats.working_budget
            ),
        ]
    }
}

/// The full standard channel set, in registry order.
pub fn standard_channels(memory_kind: &'static str) -> Vec<Channel> {
    vec![
        Channel::new("context")
            .with_source(ContextMapSource)
            .with_height(7)
            .with_max_tokens(320),
        Channel::new("time").with_source(TimeSource).with_height(2),
        Channel::new("config")
            .with_source(ConfigSource { memory_kind })
            .with_height(2),
        Channel::new("tasks").with_height(4),
        Channel::new("social").with_height(3),
        Channel::new("spend").with_height(2),
        Channel::new("violations").with_height(3),
        Channel::new("awareness").with_height(3),
        Channel::new("self").with_height(3).non_viewable(),
    ]
}
