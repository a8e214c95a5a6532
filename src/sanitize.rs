//! Response sanitizer applied at the HTTP boundary.
//!
//! Terminal transcripts leak escape sequences, spinner animation and TUI
//! prompt prefixes into the answer; clients get plain text.

use crate::session::scrub::{decode_unicode_escapes, normalize_newlines};
use crate::term::scan::strip_ansi;

/// Braille frames used by the REPL's spinner animation.
const SPINNER_FRAMES: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

/// Clean a raw orchestrator answer for transport: strip ANSI and C0
/// controls (tab/LF/CR survive), drop spinner fragments and TUI prompt
/// prefixes, decode common unicode escapes, normalize newlines, collapse
/// blank runs, trim.
pub fn clean_text(s: &str) -> String {
    let stripped = strip_ansi(s.as_bytes());
    let stripped = String::from_utf8_lossy(&stripped);

    let no_ctrl: String = stripped
        .chars()
        .filter(|&c| c == '\t' || c == '\n' || c == '\r' || c >= ' ')
        .collect();

    let s = strip_spinner(&no_ctrl);
    let s = decode_unicode_escapes(&s);
    let s = normalize_newlines(&s);

    let mut out = String::with_capacity(s.len());
    for line in s.split('\n') {
        out.push_str(strip_tui_prefix(line));
        out.push('\n');
    }

    // Collapse runs of 3+ newlines down to 2.
    let mut collapsed = String::with_capacity(out.len());
    let mut newlines = 0;
    for c in out.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines <= 2 {
                collapsed.push(c);
            }
        } else {
            newlines = 0;
            collapsed.push(c);
        }
    }
    collapsed.trim().to_string()
}

/// Remove spinner frames and the `Thinking...` caption they precede.
fn strip_spinner(s: &str) -> String {
    let without_frames: String = s.chars().filter(|c| !SPINNER_FRAMES.contains(c)).collect();
    without_frames.replace("Thinking...", "")
}

/// Drop leading `>` / `!>` runs the TUI prepends to echoed lines.
fn strip_tui_prefix(line: &str) -> &str {
    let mut rest = line;
    loop {
        let trimmed = rest.trim_start();
        if let Some(r) = trimmed.strip_prefix("!>") {
            rest = r;
        } else if let Some(r) = trimmed.strip_prefix('>') {
            rest = r;
        } else {
            return if rest == line { line } else { trimmed };
        }
    }
}
