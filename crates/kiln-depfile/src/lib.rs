//! Makefile-style depfile parsing.
//!
//! A depfile is `target: prereq prereq …\n`, optionally spread over several
//! physical lines with `\\\n` continuations. This parser doesn't attempt the
//! full generality of a real Makefile — no variables, no multiple rules, no
//! pattern targets — because the only depfiles it ever sees are the ones a
//! compiler emits for a single rule's single output.

use kiln_path::{CanonicalPath, CanonicalizeError};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DepfileError {
    #[error("depfile has no ':' separator")]
    MissingColon,
    #[error("depfile target is empty")]
    EmptyTarget,
    #[error("prereq path invalid: {0}")]
    BadPrereq(#[from] CanonicalizeErrorDisplay),
}

/// Wraps [`kiln_path::CanonicalizeError`] so it can carry `PartialEq`/`Eq`
/// (the upstream error already derives both, this just lets `DepfileError`
/// derive them too without leaking the dependency's exact error shape into
/// callers who only match on `DepfileError`).
#[derive(Debug, PartialEq, Eq)]
pub struct CanonicalizeErrorDisplay(pub CanonicalizeError);

impl std::fmt::Display for CanonicalizeErrorDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CanonicalizeErrorDisplay {}

impl From<CanonicalizeError> for CanonicalizeErrorDisplay {
    fn from(e: CanonicalizeError) -> Self {
        CanonicalizeErrorDisplay(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Depfile {
    pub target: String,
    pub prereqs: Vec<CanonicalPath>,
}

/// Collapse `\\\n` continuations (plus any leading whitespace on the
/// following line) into a single space, then split on the first unescaped
/// `:` into target and prereq text.
pub fn parse(raw: &str) -> Result<Depfile, DepfileError> {
    let joined = join_continuations(raw);
    let (target_part, rest) = split_on_colon(&joined)?;
    let target = unescape_path_word(target_part.trim());
    if target.is_empty() {
        return Err(DepfileError::EmptyTarget);
    }
    let prereqs = rest
        .split_whitespace()
        .map(unescape_path_word)
        .filter(|w| !w.is_empty())
        .map(|w| CanonicalPath::canonicalize(&w).map_err(CanonicalizeErrorDisplay))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Depfile { target, prereqs })
}

fn join_continuations(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&'\n') {
            chars.next();
            out.push(' ');
            while matches!(chars.peek(), Some(' ') | Some('\t')) {
                chars.next();
            }
            continue;
        }
        out.push(c);
    }
    out
}

fn split_on_colon(s: &str) -> Result<(&str, &str), DepfileError> {
    // A `\:` is a literal colon inside a path and does not split the line;
    // scan for the first colon not preceded by an odd run of backslashes.
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b':' {
            let mut backslashes = 0;
            let mut j = i;
            while j > 0 && bytes[j - 1] == b'\\' {
                backslashes += 1;
                j -= 1;
            }
            if backslashes % 2 == 0 {
                return Ok((&s[..i], &s[i + 1..]));
            }
        }
        i += 1;
    }
    Err(DepfileError::MissingColon)
}

/// Undo `\ ` (escaped space), `\\` (escaped backslash), and `\:` (escaped
/// colon) inside a single whitespace-delimited word.
fn unescape_path_word(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut chars = word.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some(' ') | Some(':') | Some('\\') => {
                    out.push(*chars.peek().unwrap());
                    chars.next();
                }
                _ => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}
