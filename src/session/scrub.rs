//! Echo/JSON post-processing of raw REPL transcripts.
//!
//! A transcript carries the echoed input, TUI prompt lines and the actual
//! answer interleaved. The scrubber pulls the answer out; when the answer is
//! a JSON object it wins over everything else.

use crate::term::scan::extract_first_json;

/// Echo removal only considers a prompt occurrence this close to the start,
/// so a legitimate quotation of the input later in the answer survives.
const ECHO_SEARCH_LIMIT: usize = 256;

pub fn normalize_newlines(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// Decode the unicode escapes the REPL emits inside JSON-ish output.
pub fn decode_unicode_escapes(s: &str) -> String {
    s.replace("\\u003e", ">")
        .replace("\\u003c", "<")
        .replace("\\u0026", "&")
        .replace("\\u0022", "\"")
        .replace("\\u0027", "'")
}

/// Whether the transcript is nothing but prompt glyphs. Characteristic of
/// an exhausted upstream quota: the REPL accepts the input and prints a new
/// prompt without an answer.
pub fn looks_like_prompt_only(s: &str) -> bool {
    let t = normalize_newlines(s);
    let t = t.trim();
    if t.is_empty() {
        return false;
    }
    if t == ">" || t == "!>" || t == "»" || t == "»>" {
        return true;
    }
    t.lines().all(|line| {
        let x = line.trim();
        x.is_empty() || x.starts_with('>') || x.starts_with("!>")
    })
}

/// Remove the echoed prompt and TUI prompt lines from `out`, keeping only
/// the assistant's answer.
///
/// `filters` is an operator-supplied list of substrings; any line containing
/// one is dropped as well.
pub fn strip_prompt_echo(out: &str, prompt: &str, filters: &[String]) -> String {
    if out.trim().is_empty() {
        return out.to_string();
    }
    let on = normalize_newlines(out);
    let pn = normalize_newlines(prompt);

    // A complete JSON object in the raw output is the answer; extract it
    // before any deletion can damage it.
    if let Some(js) = extract_first_json(&on) {
        return js.trim().to_string();
    }

    // Remove the first echoed copy of the prompt, but only near the start.
    let mut on = on;
    if let Some(idx) = on.find(&pn) {
        if idx <= ECHO_SEARCH_LIMIT {
            on.replace_range(idx..idx + pn.len(), "");
        }
    }

    let on = decode_unicode_escapes(&on);

    let prompt_lines: std::collections::HashSet<&str> = pn
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let mut cleaned = String::new();
    let mut last_blank = false;
    for line in on.lines() {
        let t = line.trim();
        if t.is_empty() {
            if last_blank {
                continue;
            }
            last_blank = true;
            cleaned.push('\n');
            continue;
        }
        last_blank = false;
        if t.starts_with('>') || t.starts_with("!>") {
            continue;
        }
        if prompt_lines.contains(t) {
            continue;
        }
        if filters.iter().any(|f| !f.is_empty() && t.contains(f.as_str())) {
            continue;
        }
        cleaned.push_str(line);
        cleaned.push('\n');
    }
    let cleaned = cleaned.trim().to_string();

    if let Some(js) = extract_first_json(&cleaned) {
        return js.trim().to_string();
    }
    // Safety fallback: never turn a non-empty transcript into nothing.
    if cleaned.is_empty() {
        return on.trim().to_string();
    }
    cleaned
}
