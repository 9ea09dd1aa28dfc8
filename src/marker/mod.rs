//! Streaming extraction of in-band `@@...@@` control markers.
//!
//! Fragments arrive arbitrarily chunked from the model stream. The parser
//! splits them into a clean text stream (markers replaced by glyphs) and a
//! sequence of marker events, holding back only the minimal suffix that
//! could still complete a marker. `flush()` at end of response emits any
//! held-back text verbatim.

pub mod directive;

pub use directive::{parse_size, Directive};

use tracing::{debug, warn};

/// Emotion dimension names. Colon-form values for these must land in [0,1];
/// anything else is logged and dropped without stopping the stream.
pub const EMOTION_DIMENSIONS: [&str; 8] = [
    "joy",
    "sadness",
    "anger",
    "fear",
    "surprise",
    "disgust",
    "trust",
    "anticipation",
];

/// Directive names the core recognizes. Always accepted without a warning.
pub const RESERVED_NAMES: [&str; 18] = [
    "model-change",
    "thinking",
    "think",
    "relax",
    "importance",
    "ref",
    "unref",
    "max-context",
    "working",
    "page",
    "memory",
    "sleep",
    "listening",
    "wake",
    "view",
    "sense",
    "resummarize",
    "learn",
];

/// A single fired marker.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerEvent {
    pub name: String,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// `@@name@@`
    Bare,
    /// `@@name('arg')@@`, `@@name("arg")@@`, `@@name(arg)@@`
    Arg(String),
    /// One `name:value` dimension of a colon marker. Each dimension fires
    /// independently.
    Value(f64),
    /// `@@[clip:weight, ...]@@`
    Weights(Vec<(String, f32)>),
}

impl MarkerEvent {
    pub fn arg(&self) -> Option<&str> {
        match &self.payload {
            Payload::Arg(s) => Some(s),
            _ => None,
        }
    }
}

/// Output of one `feed` or `flush` call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Parsed {
    pub clean: String,
    pub events: Vec<MarkerEvent>,
}

/// Upper bound on held-back bytes. A "marker" that runs longer than this is
/// not a marker; it is flushed to the clean stream as plain text.
const MAX_MARKER_LEN: usize = 512;

/// Incremental marker parser. One per response stream.
#[derive(Debug, Default)]
pub struct MarkerParser {
    buf: String,
}

impl MarkerParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the next stream fragment.
    pub fn feed(&mut self, fragment: &str) -> Parsed {
        self.buf.push_str(fragment);
        self.drain(false)
    }

    /// End of response. Any held-back buffer is emitted verbatim.
    pub fn flush(&mut self) -> Parsed {
        self.drain(true)
    }

    fn drain(&mut self, at_end: bool) -> Parsed {
        let s = std::mem::take(&mut self.buf);
        let mut out = Parsed::default();
        let mut i = 0;

        while i < s.len() {
            let Some(p) = find_delim(&s[i..]).map(|off| i + off) else {
                out.clean.push_str(&s[i..]);
                i = s.len();
                break;
            };
            out.clean.push_str(&s[i..p]);

            if s.as_bytes()[p] == b'\\' {
                let rest = &s[p..];
                if rest.starts_with("\\@@") {
                    // Escaped marker: literal @@, no event.
                    out.clean.push_str("@@");
                    i = p + 3;
                } else if "\\@@".starts_with(rest) && !at_end {
                    self.buf = rest.to_string();
                    return out;
                } else {
                    out.clean.push('\\');
                    i = p + 1;
                }
                continue;
            }

            // s[p] == '@'
            let rest = &s[p..];
            if !rest.starts_with("@@") {
                if rest.len() == 1 && !at_end {
                    self.buf = rest.to_string();
                    return out;
                }
                out.clean.push('@');
                i = p + 1;
                continue;
            }

            match try_parse_marker(rest) {
                Scan::Complete {
                    consumed,
                    glyphs,
                    events,
                } => {
                    out.clean.push_str(&glyphs);
                    out.events.extend(events);
                    i = p + consumed;
                }
                Scan::Partial => {
                    if at_end || rest.len() > MAX_MARKER_LEN {
                        out.clean.push_str(rest);
                        i = s.len();
                    } else {
                        self.buf = rest.to_string();
                        return out;
                    }
                }
                Scan::Invalid => {
                    out.clean.push_str("@@");
                    i = p + 2;
                }
            }
        }
        out
    }
}

/// Byte offset of the next `@` or `\` in `s`.
fn find_delim(s: &str) -> Option<usize> {
    s.bytes().position(|b| b == b'@' || b == b'\\')
}

enum Scan {
    Complete {
        consumed: usize,
        glyphs: String,
        events: Vec<MarkerEvent>,
    },
    Partial,
    Invalid,
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic()
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Attempt to parse one complete marker at the head of `s` (which starts
/// with `@@`).
fn try_parse_marker(s: &str) -> Scan {
    let body = &s[2..];

    if body.is_empty() {
        return Scan::Partial;
    }

    if body.starts_with('[') {
        return parse_avatar(s);
    }

    let Some(first) = body.chars().next() else {
        return Scan::Partial;
    };
    if !is_name_start(first) {
        return Scan::Invalid;
    }

    let name_len = body.chars().take_while(|&c| is_name_char(c)).count();
    let name = &body[..name_len];
    let after = &body[name_len..];

    let Some(next) = after.chars().next() else {
        return Scan::Partial;
    };

    match next {
        '@' => {
            if after.starts_with("@@") {
                fire_single(name, Payload::Bare, 2 + name_len + 2)
            } else if after.len() == 1 {
                Scan::Partial
            } else {
                Scan::Invalid
            }
        }
        '(' => parse_function_arg(name, &after[1..], 2 + name_len + 1),
        ':' => parse_colon(body, name_len),
        _ => Scan::Invalid,
    }
}

/// Parse `...arg')@@` forms after `@@name(`. `consumed_prefix` counts bytes
/// up to and including the `(`.
fn parse_function_arg(name: &str, s: &str, consumed_prefix: usize) -> Scan {
    let (terminator, arg_start): (String, usize) = match s.chars().next() {
        Some(q @ ('\'' | '"')) => (format!("{q})@@"), 1),
        Some(_) => (")@@".to_string(), 0),
        None => return Scan::Partial,
    };

    let Some(end) = s[arg_start..].find(&terminator).map(|o| o + arg_start) else {
        return Scan::Partial;
    };

    let arg = &s[arg_start..end];
    if arg_start == 0 && (arg.contains('(') || arg.contains('\n')) {
        return Scan::Invalid;
    }
    fire_single(
        name,
        Payload::Arg(arg.to_string()),
        consumed_prefix + end + terminator.len(),
    )
}

/// Parse `n1:v1,n2:v2@@` starting from the body. `name_len` locates the
/// first name, already validated.
fn parse_colon(body: &str, name_len: usize) -> Scan {
    let Some(term) = body.find("@@") else {
        return Scan::Partial;
    };
    if term < name_len {
        return Scan::Invalid;
    }

    let inside = &body[..term];
    let mut events = Vec::new();
    let mut glyphs = String::new();

    for pair in inside.split(',') {
        let pair = pair.trim();
        let Some((name, raw)) = pair.split_once(':') else {
            warn!(pair, "malformed marker dimension, dropped");
            continue;
        };
        let name = name.trim();
        let raw = raw.trim();
        if name.is_empty()
            || !name.chars().next().is_some_and(is_name_start)
            || !name.chars().all(is_name_char)
        {
            warn!(pair, "invalid dimension name, dropped");
            continue;
        }
        let Some(value) = parse_number(raw) else {
            warn!(name, raw, "non-numeric dimension value, dropped");
            continue;
        };
        if !validate(name, value) {
            continue;
        }
        glyphs.push_str(glyph_for(name));
        events.push(MarkerEvent {
            name: name.to_string(),
            payload: Payload::Value(value),
        });
    }

    Scan::Complete {
        consumed: 2 + term + 2,
        glyphs,
        events,
    }
}

/// Parse `@@[clip:weight, ...]@@`.
fn parse_avatar(s: &str) -> Scan {
    let body = &s[3..]; // past "@@["
    let Some(end) = body.find("]@@") else {
        return Scan::Partial;
    };
    let inside = &body[..end];

    let mut weights = Vec::new();
    for pair in inside.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((clip, raw)) = pair.split_once(':') else {
            warn!(pair, "malformed avatar weight, dropped");
            continue;
        };
        let clip = clip.trim();
        let Some(weight) = raw.trim().parse::<f32>().ok().filter(|w| (0.0..=1.0).contains(w))
        else {
            warn!(clip, raw = raw.trim(), "avatar weight outside [0,1], dropped");
            continue;
        };
        weights.push((clip.to_string(), weight));
    }

    if weights.is_empty() {
        debug!("avatar marker carried no valid weights");
        return Scan::Complete {
            consumed: 3 + end + 3,
            glyphs: String::new(),
            events: vec![],
        };
    }

    Scan::Complete {
        consumed: 3 + end + 3,
        glyphs: glyph_for("avatar").to_string(),
        events: vec![MarkerEvent {
            name: "avatar".to_string(),
            payload: Payload::Weights(weights),
        }],
    }
}

fn fire_single(name: &str, payload: Payload, consumed: usize) -> Scan {
    if !RESERVED_NAMES.contains(&name) && !EMOTION_DIMENSIONS.contains(&name) {
        warn!(name, "unknown marker name accepted");
    }
    Scan::Complete {
        consumed,
        glyphs: glyph_for(name).to_string(),
        events: vec![MarkerEvent {
            name: name.to_string(),
            payload,
        }],
    }
}

/// Emotion dimensions must land in [0,1]. Everything else passes.
fn validate(name: &str, value: f64) -> bool {
    if EMOTION_DIMENSIONS.contains(&name) && !(0.0..=1.0).contains(&value) {
        warn!(name, value, "emotion dimension outside [0,1], dropped");
        return false;
    }
    if !RESERVED_NAMES.contains(&name) && !EMOTION_DIMENSIONS.contains(&name) {
        warn!(name, "unknown marker dimension accepted");
    }
    true
}

/// Numeric values accept `k`/`kb` (x10^3) and `m`/`mb` (x10^6) suffixes.
pub(crate) fn parse_number(raw: &str) -> Option<f64> {
    let lower = raw.to_ascii_lowercase();
    let (digits, mult) = if let Some(d) = lower.strip_suffix("kb") {
        (d, 1_000.0)
    } else if let Some(d) = lower.strip_suffix('k') {
        (d, 1_000.0)
    } else if let Some(d) = lower.strip_suffix("mb") {
        (d, 1_000_000.0)
    } else if let Some(d) = lower.strip_suffix('m') {
        (d, 1_000_000.0)
    } else {
        (lower.as_str(), 1.0)
    };
    digits.trim().parse::<f64>().ok().map(|v| v * mult)
}

/// Fixed glyph table keyed by marker name.
pub fn glyph_for(name: &str) -> &'static str {
    match name {
        "model-change" => "\u{1F500}",  // 🔀
        "thinking" | "think" => "\u{1F9E0}", // 🧠
        "relax" => "\u{1F32C}\u{FE0F}", // 🌬️
        "importance" => "\u{2B50}",     // ⭐
        "ref" => "\u{1F4D6}",           // 📖
        "unref" => "\u{1F4D5}",         // 📕
        "max-context" | "working" | "page" => "\u{1F4CF}", // 📏
        "memory" => "\u{1F4BE}",        // 💾
        "sleep" => "\u{1F634}",         // 😴
        "listening" => "\u{1F442}",     // 👂
        "wake" => "\u{23F0}",           // ⏰
        "view" => "\u{1F3A5}",          // 🎥
        "sense" => "\u{1F39B}\u{FE0F}", // 🎛️
        "resummarize" => "\u{267B}\u{FE0F}", // ♻️
        "learn" => "\u{1F4DD}",         // 📝
        "avatar" => "\u{1F3AD}",        // 🎭
        "joy" => "\u{1F604}",           // 😄
        "sadness" => "\u{1F622}",       // 😢
        "anger" => "\u{1F620}",         // 😠
        "fear" => "\u{1F628}",          // 😨
        "surprise" => "\u{1F62E}",      // 😮
        "disgust" => "\u{1F922}",       // 🤢
        "trust" => "\u{1F91D}",         // 🤝
        "anticipation" => "\u{1F914}",  // 🤔
        _ => "\u{2728}",                // ✨
    }
}
