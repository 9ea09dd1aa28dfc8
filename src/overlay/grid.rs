//! Fixed-width box rendering for the status panel. Every emitted line is
//! exactly [`PANEL_WIDTH`] chars; clipping happens on char boundaries, never
//! by byte slicing (byte slicing tears multi-byte box-drawing glyphs).

/// Panel width in chars, frame included.
pub const PANEL_WIDTH: usize = 82;

/// Sentinel content line that renders as a `╠═══╣` separator row.
pub const SEPARATOR: &str = "---";

fn clip_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn pad_to(mut s: String, width: usize) -> String {
    let len = s.chars().count();
    if len < width {
        s.extend(std::iter::repeat(' ').take(width - len));
    }
    s
}

/// Render one channel grid: `╔═ title ══╗` header, `║ …` body rows (or `╠`
/// separators), `╚══╝` footer. `height` fixes the number of body rows,
/// padding with blanks or clipping as needed; `None` sizes to content.
pub fn render_box(title: &str, lines: &[String], height: Option<usize>) -> Vec<String> {
    let inner = PANEL_WIDTH - 2;
    let mut out = Vec::new();

    let title = clip_chars(title, inner.saturating_sub(5));
    let mut header = format!("\u{2554}\u{2550} {title} ");
    let header_len = header.chars().count();
    header.extend(std::iter::repeat('\u{2550}').take(PANEL_WIDTH - 1 - header_len));
    header.push('\u{2557}');
    out.push(header);

    let body_rows = height.unwrap_or(lines.len());
    for row in 0..body_rows {
        match lines.get(row).map(String::as_str) {
            Some(SEPARATOR) => {
                let mut sep = String::from("\u{2560}");
                sep.extend(std::iter::repeat('\u{2550}').take(inner));
                sep.push('\u{2563}');
                out.push(sep);
            }
            Some(line) => {
                let content = pad_to(clip_chars(line, inner - 2), inner - 2);
                out.push(format!("\u{2551} {content} \u{2551}"));
            }
            None => {
                let blank = pad_to(String::new(), inner - 2);
                out.push(format!("\u{2551} {blank} \u{2551}"));
            }
        }
    }

    let mut footer = String::from("\u{255A}");
    footer.extend(std::iter::repeat('\u{2550}').take(inner));
    footer.push('\u{255D}');
    out.push(footer);
    out
}

/// A proportional bar like `[####----]`, `width` chars inside the brackets.
pub fn bar(used: usize, total: usize, width: usize) -> String {
    let filled = if total == 0 {
        0
    } else {
        (used * width / total).min(width)
    };
    let mut s = String::with_capacity(width + 2);
    s.push('[');
    s.extend(std::iter::repeat('#').take(filled));
    s.extend(std::iter::repeat('-').take(width - filled));
    s.push(']');
    s
}
