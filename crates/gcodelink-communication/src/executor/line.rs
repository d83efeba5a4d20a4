//! Program line preparation
//!
//! G-code comments are either parenthesised spans or everything after a
//! `;`. A parenthesised `(MSG, text)` span is a message directive: the
//! executor pauses and shows the text to the operator.

use regex::Regex;
use std::sync::LazyLock;

static MESSAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\(\s*MSG\s*,\s*([^)]*)\)").expect("valid regex"));

/// Remove comment spans and surrounding whitespace
///
/// An unterminated `(` comments out the rest of the line.
pub fn strip_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0usize;
    for c in line.chars() {
        match c {
            ';' if depth == 0 => break,
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// Text of an embedded message directive, if the line carries one
pub fn message_directive(line: &str) -> Option<String> {
    MESSAGE_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}
