//! Pure compaction planning. Everything here operates on message slices and
//! returns plans; the store owns the IO (summarizing, page files, buffer
//! rewrites). Keeping this side-effect free is what makes the invariants
//! property-testable.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use crate::types::{
    estimate_message_tokens, estimate_sequence_tokens, Message, Role, SummarizedToolCall,
};

/// An atomic group of messages. A message carrying `tool_calls` and all
/// immediately-following `tool` messages whose ids it lists move as one
/// unit; everything else is a unit of one.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub range: Range<usize>,
    pub lane: Role,
}

impl Unit {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// A contiguous run of candidate units slated to become one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageGroup {
    pub lane: Role,
    pub range: Range<usize>,
}

/// Split `msgs[skip..]` into atomic units.
pub fn split_units(msgs: &[Message], skip: usize) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut i = skip;
    while i < msgs.len() {
        let m = &msgs[i];
        if m.role == Role::Assistant && !m.tool_calls.is_empty() {
            let ids: HashSet<&str> = m.tool_calls.iter().map(|c| c.id.as_str()).collect();
            let mut j = i + 1;
            while j < msgs.len()
                && msgs[j].role == Role::Tool
                && msgs[j]
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| ids.contains(id))
            {
                j += 1;
            }
            units.push(Unit {
                range: i..j,
                lane: Role::Assistant,
            });
            i = j;
        } else {
            units.push(Unit {
                range: i..i + 1,
                lane: m.role,
            });
            i += 1;
        }
    }
    units
}

/// Phase-1 plan: per-lane keep-tails, earlier prefix grouped into pages.
///
/// `protected[i]` shields message i (and therefore its whole unit).
/// Pinned leading messages are outside `skip` and never considered.
pub fn plan_page_groups(
    msgs: &[Message],
    protected: &[bool],
    pinned: usize,
    min_recent_per_lane: usize,
) -> Vec<PageGroup> {
    let units = split_units(msgs, pinned);

    // Per-lane unit counts drive the keep-tail.
    let mut per_lane_total: HashMap<Role, usize> = HashMap::new();
    for u in &units {
        *per_lane_total.entry(u.lane).or_default() += 1;
    }

    let mut seen: HashMap<Role, usize> = HashMap::new();
    let mut candidate = vec![false; units.len()];
    for (n, u) in units.iter().enumerate() {
        let seen_so_far = seen.entry(u.lane).or_default();
        *seen_so_far += 1;
        let in_tail = per_lane_total[&u.lane] - *seen_so_far < min_recent_per_lane;
        let shielded = u.range.clone().any(|i| protected.get(i).copied().unwrap_or(false));
        let pageable = matches!(u.lane, Role::User | Role::Assistant | Role::Tool);
        candidate[n] = pageable && !in_tail && !shielded;
    }

    group_adjacent(&units, &candidate)
}

/// Phase-2 plan: keep only the most recent `keep_recent_tools` tool
/// messages (with their pairing assistants); older tool-bearing units
/// become pages.
pub fn plan_tool_retention(
    msgs: &[Message],
    protected: &[bool],
    pinned: usize,
    keep_recent_tools: usize,
) -> Vec<PageGroup> {
    let units = split_units(msgs, pinned);

    let tool_count = |u: &Unit| {
        u.range
            .clone()
            .filter(|&i| msgs[i].role == Role::Tool)
            .count()
    };

    // Walk newest to oldest, sparing units until the retention budget is
    // spent.
    let mut kept_tools = 0usize;
    let mut candidate = vec![false; units.len()];
    for (n, u) in units.iter().enumerate().rev() {
        let tools = tool_count(u);
        if tools == 0 {
            continue;
        }
        if kept_tools < keep_recent_tools {
            kept_tools += tools;
            continue;
        }
        let shielded = u.range.clone().any(|i| protected.get(i).copied().unwrap_or(false));
        if !shielded {
            candidate[n] = true;
        }
    }

    group_adjacent(&units, &candidate)
}

fn group_adjacent(units: &[Unit], candidate: &[bool]) -> Vec<PageGroup> {
    let mut groups: Vec<PageGroup> = Vec::new();
    for (n, u) in units.iter().enumerate() {
        if !candidate[n] {
            continue;
        }
        match groups.last_mut() {
            Some(g) if g.lane == u.lane && g.range.end == u.range.start => {
                g.range.end = u.range.end;
            }
            _ => groups.push(PageGroup {
                lane: u.lane,
                range: u.range.clone(),
            }),
        }
    }
    groups
}

// ---------------------------------------------------------------------------
// Marker consolidation
// ---------------------------------------------------------------------------

const MARKER_DIGEST_PREFIX: &str = "[archived pages: ";
const MARKER_DIGEST_CAP: usize = 48;

/// Phase-3 fallback: merge runs of two or more adjacent page-reference
/// markers into a single digest marker listing the page ids. Pages on disk
/// are untouched; only the buffer shrinks. Needed when alternating lanes
/// produce many single-unit pages whose markers alone exceed the low
/// watermark.
pub fn consolidate_marker_runs(
    msgs: &[Message],
    protected: &[bool],
    pinned: usize,
) -> (Vec<Message>, Vec<bool>) {
    let mut out = msgs[..pinned].to_vec();
    let mut flags: Vec<bool> = protected[..pinned.min(protected.len())].to_vec();
    flags.resize(out.len(), false);

    // Only page markers and prior digests merge; other memory-role
    // messages (transient sentinels) pass through untouched.
    let mergeable =
        |m: &Message| m.page_id.is_some() || parse_digest(&m.content).is_some();

    let mut i = pinned;
    while i < msgs.len() {
        if msgs[i].role == Role::Memory && mergeable(&msgs[i]) {
            let mut j = i;
            while j < msgs.len() && msgs[j].role == Role::Memory && mergeable(&msgs[j]) {
                j += 1;
            }
            if j - i >= 2 {
                out.push(merge_markers(&msgs[i..j]));
                flags.push(false);
            } else {
                out.push(msgs[i].clone());
                flags.push(protected.get(i).copied().unwrap_or(false));
            }
            i = j;
        } else {
            out.push(msgs[i].clone());
            flags.push(protected.get(i).copied().unwrap_or(false));
            i += 1;
        }
    }
    (out, flags)
}

fn merge_markers(run: &[Message]) -> Message {
    let mut ids: Vec<String> = Vec::new();
    let mut extra = 0usize;
    for m in run {
        if let Some(id) = &m.page_id {
            ids.push(id.clone());
        } else if let Some((more_ids, more_extra)) = parse_digest(&m.content) {
            ids.extend(more_ids);
            extra += more_extra;
        }
    }
    if ids.len() > MARKER_DIGEST_CAP {
        extra += ids.len() - MARKER_DIGEST_CAP;
        ids.truncate(MARKER_DIGEST_CAP);
    }
    let mut content = format!("{MARKER_DIGEST_PREFIX}{}", ids.join(", "));
    if extra > 0 {
        content.push_str(&format!(" +{extra} more"));
    }
    content.push(']');
    let mut m = Message::system(content);
    m.role = Role::Memory;
    m
}

fn parse_digest(content: &str) -> Option<(Vec<String>, usize)> {
    let body = content
        .strip_prefix(MARKER_DIGEST_PREFIX)?
        .strip_suffix(']')?;
    let (list, extra) = match body.split_once(" +") {
        Some((list, tail)) => (
            list,
            tail.strip_suffix(" more")
                .and_then(|n| n.parse::<usize>().ok())
                .unwrap_or(0),
        ),
        None => (body, 0),
    };
    let ids = list
        .split(", ")
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    Some((ids, extra))
}

// ---------------------------------------------------------------------------
// Broken-pair flattening
// ---------------------------------------------------------------------------

const NARRATION_ARGS_CHARS: usize = 100;
const NARRATION_RESULT_CHARS: usize = 200;
const LOST_RESULT: &str = "truncated during compaction";

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// Repair a buffer whose pairing invariant broke (compaction or reload).
///
/// Assistants missing tool results are rewritten into a narration with
/// `summarized_tool_call` metadata plus synthetic tool messages; dangling
/// tool messages are dropped. Idempotent: running this on its own output is
/// a no-op.
pub fn flatten_broken_pairs(input: &[Message]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(input.len());
    // Tool messages are kept when they follow a narration assistant; the
    // flag survives across the contiguous tool block only.
    let mut after_narration = false;

    let mut i = 0;
    while i < input.len() {
        let m = &input[i];
        if m.role == Role::Assistant && !m.tool_calls.is_empty() {
            after_narration = false;
            let mut j = i + 1;
            while j < input.len() && input[j].role == Role::Tool {
                j += 1;
            }
            let block = &input[i + 1..j];
            let have: HashSet<&str> =
                block.iter().filter_map(|t| t.tool_call_id.as_deref()).collect();
            let missing: Vec<_> = m
                .tool_calls
                .iter()
                .filter(|c| !have.contains(c.id.as_str()))
                .collect();

            if missing.is_empty() {
                out.push(m.clone());
                let ids: HashSet<&str> = m.tool_calls.iter().map(|c| c.id.as_str()).collect();
                for t in block {
                    // A result whose id the assistant never issued is
                    // dangling even inside an intact block.
                    if t.tool_call_id.as_deref().is_some_and(|id| ids.contains(id)) {
                        out.push(t.clone());
                    }
                }
            } else {
                let first = &m.tool_calls[0];
                let result_excerpt = block
                    .iter()
                    .find(|t| t.tool_call_id.as_deref() == Some(first.id.as_str()))
                    .map(|t| truncate_chars(&t.content, NARRATION_RESULT_CHARS))
                    .unwrap_or_else(|| LOST_RESULT.to_string());
                let args = truncate_chars(&first.args_json, NARRATION_ARGS_CHARS);

                let mut flat = Message::assistant(format!(
                    "I called {} with {args}; result: {result_excerpt}",
                    first.name
                ));
                flat.from = m.from.clone();
                flat.importance = m.importance;
                flat.summarized_tool_call = Some(SummarizedToolCall {
                    id: first.id.clone(),
                    function: first.name.clone(),
                    args,
                    result_excerpt,
                });
                out.push(flat);

                for call in &m.tool_calls {
                    let existing = block
                        .iter()
                        .find(|t| t.tool_call_id.as_deref() == Some(call.id.as_str()));
                    match existing {
                        Some(t) => out.push(t.clone()),
                        None => out.push(Message::tool_result(&call.id, &call.name, LOST_RESULT)),
                    }
                }
                after_narration = true;
            }
            i = j;
        } else if m.role == Role::Tool {
            if after_narration {
                out.push(m.clone());
            }
            // else: dangling, dropped
            i += 1;
        } else {
            after_narration =
                m.role == Role::Assistant && m.summarized_tool_call.is_some();
            out.push(m.clone());
            i += 1;
        }
    }
    out
}

/// Does the sequence satisfy the pairing invariant? Every `tool_calls`
/// entry must be matched by a tool message in the immediately-following
/// block, and every tool message must be owned by a pairing assistant or a
/// narration.
pub fn pairing_ok(msgs: &[Message]) -> bool {
    let mut owned_ids: HashSet<&str> = HashSet::new();
    let mut after_owner = false;
    for (i, m) in msgs.iter().enumerate() {
        match m.role {
            Role::Assistant if !m.tool_calls.is_empty() => {
                let ids: HashSet<&str> = m.tool_calls.iter().map(|c| c.id.as_str()).collect();
                let mut found: HashSet<&str> = HashSet::new();
                for t in msgs[i + 1..].iter().take_while(|t| t.role == Role::Tool) {
                    if let Some(id) = t.tool_call_id.as_deref() {
                        found.insert(id);
                    }
                }
                if !ids.is_subset(&found) {
                    return false;
                }
                owned_ids = ids;
                after_owner = true;
            }
            Role::Assistant => {
                after_owner = m.summarized_tool_call.is_some();
                owned_ids = HashSet::new();
            }
            Role::Tool => {
                let id = match m.tool_call_id.as_deref() {
                    Some(id) if !id.is_empty() => id,
                    _ => return false,
                };
                if !after_owner {
                    return false;
                }
                // Under a pairing assistant the id must be one it issued;
                // under a narration any id is accounted for by metadata.
                if !owned_ids.is_empty() && !owned_ids.contains(id) {
                    return false;
                }
            }
            _ => {
                after_owner = false;
                owned_ids = HashSet::new();
            }
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Hard truncation
// ---------------------------------------------------------------------------

/// Safety ceiling for `messages()`: drop the oldest unprotected units until
/// the estimate fits `budget`. Protected units go last, pinned never.
pub fn hard_truncate(
    msgs: &[Message],
    protected: &[bool],
    pinned: usize,
    budget: usize,
) -> Vec<Message> {
    if estimate_sequence_tokens(msgs) <= budget {
        return msgs.to_vec();
    }

    let units = split_units(msgs, pinned);
    let mut drop = vec![false; units.len()];
    let mut total = estimate_sequence_tokens(msgs);

    let unit_tokens = |u: &Unit| u.range.clone().map(|i| estimate_message_tokens(&msgs[i])).sum::<usize>();
    let unit_protected =
        |u: &Unit| u.range.clone().any(|i| protected.get(i).copied().unwrap_or(false));

    for pass_protected in [false, true] {
        for (n, u) in units.iter().enumerate() {
            if total <= budget {
                break;
            }
            if drop[n] || unit_protected(u) != pass_protected {
                continue;
            }
            drop[n] = true;
            total -= unit_tokens(u);
        }
    }

    let mut out: Vec<Message> = msgs[..pinned].to_vec();
    for (n, u) in units.iter().enumerate() {
        if !drop[n] {
            out.extend(msgs[u.range.clone()].iter().cloned());
        }
    }
    out
}
