use tracing::warn;

use super::{MarkerEvent, Payload};

/// Floor on hot-tuned budget sizes. Anything smaller would configure an
/// unusable store.
pub const MIN_BUDGET_TOKENS: usize = 1024;

/// Control directives the core acts on. Markers that do not map to a
/// directive (emotions, avatar weights, unknown names) stay plain handler
/// events.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// One-shot model switch for subsequent turns.
    ModelChange { alias: String },
    ThinkingSet { value: f32 },
    Think,
    Relax,
    /// Attach to the current assistant message.
    Importance { value: f32 },
    /// Literal page ids to load. Ids prefixed `?` are semantic queries.
    RefPages { ids: Vec<String> },
    UnrefPages { ids: Vec<String> },
    /// Hot-tune budgets. Either side may be absent.
    Budget {
        working: Option<usize>,
        page: Option<usize>,
    },
    /// Hot-swap the store implementation.
    MemoryKind { kind: String },
    Sleep,
    Listening,
    Wake,
    View { name: String, slot: Option<usize> },
    Sense { name: String, enabled: bool },
    Resummarize { force: bool },
    Learn { fact: String },
}

/// Parse a size argument with `k`/`kb`/`m`/`mb` suffixes into tokens.
/// Rejects values under [`MIN_BUDGET_TOKENS`].
pub fn parse_size(raw: &str) -> Option<usize> {
    let value = super::parse_number(raw)?;
    if value < MIN_BUDGET_TOKENS as f64 {
        warn!(raw, floor = MIN_BUDGET_TOKENS, "budget size below floor, rejected");
        return None;
    }
    Some(value as usize)
}

impl Directive {
    /// Map a fired marker onto a directive. `None` means the event is not a
    /// control directive (or its argument failed validation, which is
    /// logged and dropped per the parser's error policy).
    pub fn from_event(event: &MarkerEvent) -> Option<Directive> {
        let arg = event.arg();
        match (event.name.as_str(), &event.payload) {
            ("model-change", _) => {
                let alias = arg?.trim();
                if alias.is_empty() {
                    warn!("model-change without alias, dropped");
                    return None;
                }
                Some(Directive::ModelChange {
                    alias: alias.to_string(),
                })
            }
            ("thinking", Payload::Value(v)) => {
                let value = *v as f32;
                if !(0.0..=1.0).contains(&value) {
                    warn!(value, "thinking budget outside [0,1], dropped");
                    return None;
                }
                Some(Directive::ThinkingSet { value })
            }
            ("thinking", _) => {
                let value = arg?.trim().parse::<f32>().ok()?;
                if !(0.0..=1.0).contains(&value) {
                    warn!(value, "thinking budget outside [0,1], dropped");
                    return None;
                }
                Some(Directive::ThinkingSet { value })
            }
            ("think", _) => Some(Directive::Think),
            ("relax", _) => Some(Directive::Relax),
            ("importance", Payload::Value(v)) => {
                let value = *v as f32;
                if !(0.0..=1.0).contains(&value) {
                    warn!(value, "importance outside [0,1], dropped");
                    return None;
                }
                Some(Directive::Importance { value })
            }
            ("importance", _) => {
                let value = arg?.trim().parse::<f32>().ok()?;
                if !(0.0..=1.0).contains(&value) {
                    warn!(value, "importance outside [0,1], dropped");
                    return None;
                }
                Some(Directive::Importance { value })
            }
            ("ref", _) => Some(Directive::RefPages {
                ids: split_ids(arg?),
            }),
            ("unref", _) => Some(Directive::UnrefPages {
                ids: split_ids(arg?),
            }),
            ("max-context", _) => {
                let working = parse_size(arg?)?;
                Some(Directive::Budget {
                    working: Some(working),
                    page: None,
                })
            }
            ("working", Payload::Value(v)) => size_budget(*v, true),
            ("page", Payload::Value(v)) => size_budget(*v, false),
            ("memory", _) => Some(Directive::MemoryKind {
                kind: arg?.trim().to_string(),
            }),
            ("sleep", _) => Some(Directive::Sleep),
            ("listening", _) => Some(Directive::Listening),
            ("wake", _) => Some(Directive::Wake),
            ("view", _) => {
                let raw = arg?;
                let mut parts = raw.splitn(2, ',');
                let name = parts.next()?.trim().to_string();
                if name.is_empty() {
                    return None;
                }
                let slot = parts.next().and_then(|s| s.trim().parse::<usize>().ok());
                Some(Directive::View { name, slot })
            }
            ("sense", _) => {
                let raw = arg?;
                let (name, state) = raw.split_once(',')?;
                let enabled = match state.trim() {
                    "on" => true,
                    "off" => false,
                    other => {
                        warn!(other, "sense state must be on|off, dropped");
                        return None;
                    }
                };
                Some(Directive::Sense {
                    name: name.trim().to_string(),
                    enabled,
                })
            }
            ("resummarize", payload) => {
                let force = matches!(payload, Payload::Arg(a) if a.trim() == "force");
                Some(Directive::Resummarize { force })
            }
            ("learn", _) => {
                let fact = arg?.trim();
                if fact.is_empty() {
                    warn!("learn without content, dropped");
                    return None;
                }
                Some(Directive::Learn {
                    fact: fact.to_string(),
                })
            }
            _ => None,
        }
    }
}

fn size_budget(value: f64, working: bool) -> Option<Directive> {
    if value < MIN_BUDGET_TOKENS as f64 {
        warn!(value, floor = MIN_BUDGET_TOKENS, "budget size below floor, rejected");
        return None;
    }
    let tokens = Some(value as usize);
    Some(if working {
        Directive::Budget {
            working: tokens,
            page: None,
        }
    } else {
        Directive::Budget {
            working: None,
            page: tokens,
        }
    })
}

/// Comma-separated id list; batch-accepts whitespace around each id.
fn split_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
