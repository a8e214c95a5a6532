//! Byte-level scanners for REPL output.
//!
//! The only structure a terminal channel gives us is the trailing prompt
//! glyph, so detection has to be cheap enough to run on every poll slice and
//! strict enough not to fire on words that merely end in `>`.

/// How much of the buffer tail is inspected for the prompt sentinel.
pub const PROMPT_SCAN_WINDOW: usize = 500;

/// Remove ANSI escape sequences (CSI, OSC, and two-byte escapes) from `bytes`.
///
/// Runs as a single-pass state machine; unterminated sequences at the end of
/// the window are dropped rather than passed through.
pub fn strip_ansi(bytes: &[u8]) -> Vec<u8> {
    #[derive(PartialEq)]
    enum State {
        Plain,
        Esc,
        Csi,
        Osc,
    }

    let mut out = Vec::with_capacity(bytes.len());
    let mut state = State::Plain;
    for &b in bytes {
        match state {
            State::Plain => {
                if b == 0x1b {
                    state = State::Esc;
                } else {
                    out.push(b);
                }
            }
            State::Esc => {
                state = match b {
                    b'[' => State::Csi,
                    b']' => State::Osc,
                    // Two-byte escapes: charset selection, SS2/SS3 and friends.
                    _ => State::Plain,
                };
            }
            State::Csi => {
                // Parameter and intermediate bytes are 0x20..=0x3f; the final
                // byte of a CSI sequence is 0x40..=0x7e.
                if (0x40..=0x7e).contains(&b) {
                    state = State::Plain;
                }
            }
            State::Osc => {
                if b == 0x07 {
                    state = State::Plain;
                }
            }
        }
    }
    out
}

/// Report whether the tail of `window` is a shell prompt.
///
/// The window is ANSI-stripped and right-trimmed first; the last remaining
/// byte must be `'>'` and the byte before it (if any) must not be
/// alphanumeric, so `<tag>` or `foo>` mid-line never match.
pub fn has_prompt(window: &[u8]) -> bool {
    let scan = if window.len() > PROMPT_SCAN_WINDOW {
        &window[window.len() - PROMPT_SCAN_WINDOW..]
    } else {
        window
    };
    let cleaned = strip_ansi(scan);

    let mut end = cleaned.len();
    while end > 0 && matches!(cleaned[end - 1], b' ' | b'\t' | b'\r' | b'\n') {
        end -= 1;
    }
    if end == 0 || cleaned[end - 1] != b'>' {
        return false;
    }
    if end == 1 {
        return true;
    }
    !cleaned[end - 2].is_ascii_alphanumeric()
}

/// Extract the first complete balanced JSON object from `s`.
///
/// Scans left to right tracking string/escape state and brace depth; the
/// first object that closes back to depth zero wins.
pub fn extract_first_json(s: &str) -> Option<&str> {
    let mut in_str = false;
    let mut esc = false;
    let mut depth = 0usize;
    let mut start = None;

    for (i, c) in s.char_indices() {
        if in_str {
            if esc {
                esc = false;
            } else if c == '\\' {
                esc = true;
            } else if c == '"' {
                in_str = false;
            }
            continue;
        }
        match c {
            '"' => in_str = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s0) = start {
                            return Some(&s[s0..i + c.len_utf8()]);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_at_tail() {
        assert!(has_prompt(b"foo\n> "));
        assert!(has_prompt(b"foo\n>"));
        assert!(has_prompt(b">"));
        assert!(has_prompt(b"!> "));
    }

    #[test]
    fn test_prompt_not_matched_mid_word() {
        assert!(!has_prompt(b"<tag>"));
        assert!(!has_prompt(b"foo>"));
        assert!(!has_prompt(b"value is 3>"));
    }

    #[test]
    fn test_prompt_not_matched_before_trailing_text() {
        assert!(!has_prompt(b"foo>\nbar"));
        assert!(!has_prompt(b""));
    }

    #[test]
    fn test_prompt_through_ansi_noise() {
        assert!(has_prompt(b"done\n\x1b[0m\x1b[32m> \x1b[0m"));
        assert!(!has_prompt(b"\x1b[31mfoo>\x1b[0m done"));
    }

    #[test]
    fn test_strip_ansi_csi_and_osc() {
        assert_eq!(strip_ansi(b"a\x1b[1;32mb\x1b[0mc"), b"abc");
        assert_eq!(strip_ansi(b"x\x1b]0;title\x07y"), b"xy");
        assert_eq!(strip_ansi(b"\x1b(Bplain"), b"plain");
    }

    #[test]
    fn test_extract_json_simple() {
        let s = "noise {\"a\": 1} trailing";
        assert_eq!(extract_first_json(s), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_extract_json_nested_and_strings() {
        let s = "x {\"a\": {\"b\": \"}\"}, \"c\": \"\\\"{\"} y {\"d\":2}";
        assert_eq!(extract_first_json(s), Some("{\"a\": {\"b\": \"}\"}, \"c\": \"\\\"{\"}"));
    }

    #[test]
    fn test_extract_json_incomplete() {
        assert_eq!(extract_first_json("{\"a\": 1"), None);
        assert_eq!(extract_first_json("no braces"), None);
        assert_eq!(extract_first_json("}} {{"), None);
    }

    #[test]
    fn test_extract_json_idempotent() {
        let s = "pre {\"k\": [1, 2, {\"n\": true}]} post";
        let once = extract_first_json(s).unwrap();
        let twice = extract_first_json(once).unwrap();
        assert_eq!(once, twice);
    }
}
