//! Path canonicalization and slash-style bookkeeping.
//!
//! Canonicalization is the single place every other crate relies on for path
//! identity: two strings that canonicalize to the same `CanonicalPath` name
//! the same node in the graph. The canonical form always uses `/` internally;
//! the original separator style (forward or backslash) is retained per
//! leading component so paths round-trip for display on platforms where
//! both styles are in use.

use std::fmt;
use thiserror::Error;

/// Number of leading components whose original separator style is tracked.
/// Components beyond this are displayed with forward slashes; this bound
/// keeps the bookkeeping a single machine word instead of a growable bitset
/// for the overwhelmingly common case of shallow paths.
pub const TRACKED_COMPONENTS: u32 = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CanonicalizeError {
    #[error("path '{0}' ascends above root")]
    AboveRoot(String),
    #[error("path is empty")]
    Empty,
}

/// A canonicalized path: a unique key for a graph node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalPath {
    /// Canonical form, components joined by `/`. Never contains `.` or
    /// internal empty components; may contain leading `..` runs for
    /// relative paths that ascend past their starting directory.
    canonical: String,
    /// True if the original path was rooted (began with a separator).
    absolute: bool,
    /// Bit `i` is set when the separator that originally preceded component
    /// `i` (0-indexed) was a backslash. Only the first `TRACKED_COMPONENTS`
    /// components are tracked.
    backslash_mask: u64,
}

impl CanonicalPath {
    /// Canonicalize `raw`, applying (left to right): duplicate separator
    /// collapse, `.` deletion, and `..` resolution against the preceding
    /// non-`..` component. Ascending above a leading component that cannot
    /// be popped is an error for absolute paths; for relative paths the
    /// unresolved `..` is preserved as leading context.
    pub fn canonicalize(raw: &str) -> Result<Self, CanonicalizeError> {
        if raw.is_empty() {
            return Err(CanonicalizeError::Empty);
        }
        let absolute = matches!(raw.as_bytes().first(), Some(b'/') | Some(b'\\'));

        let mut components: Vec<(String, bool)> = Vec::new();
        let push_component = |components: &mut Vec<(String, bool)>, seg: &str, bslash: bool| {
            if seg.is_empty() || seg == "." {
                return;
            }
            if seg == ".." {
                if let Some(last) = components.last() {
                    if last.0 != ".." {
                        components.pop();
                        return;
                    }
                }
                components.push((seg.to_string(), bslash));
                return;
            }
            components.push((seg.to_string(), bslash));
        };

        let bytes = raw.as_bytes();
        let mut idx = 0usize;
        let mut component_start: Option<usize> = None;
        // Separator style that will be attached to the *next* component;
        // the leading separator of an absolute path has no component to
        // attach to and is tracked only via `absolute`.
        let mut pending_backslash = false;
        while idx < bytes.len() {
            let b = bytes[idx];
            if b == b'/' || b == b'\\' {
                if let Some(start) = component_start.take() {
                    push_component(&mut components, &raw[start..idx], pending_backslash);
                }
                pending_backslash = b == b'\\';
                idx += 1;
                while idx < bytes.len() && (bytes[idx] == b'/' || bytes[idx] == b'\\') {
                    idx += 1;
                }
                continue;
            }
            if component_start.is_none() {
                component_start = Some(idx);
            }
            idx += 1;
        }
        if let Some(start) = component_start {
            push_component(&mut components, &raw[start..], pending_backslash);
        }

        // A leading ".." on an absolute path means the loop above could not
        // pop anything (the stack was empty at that point) and it is still
        // sitting at the front of `components`.
        if absolute {
            if let Some((seg, _)) = components.first() {
                if seg == ".." {
                    return Err(CanonicalizeError::AboveRoot(raw.to_string()));
                }
            }
        }

        let mut canonical = String::new();
        if absolute {
            canonical.push('/');
        }
        let mut mask: u64 = 0;
        for (n, (seg, bslash)) in components.iter().enumerate() {
            if n > 0 {
                canonical.push('/');
            }
            canonical.push_str(seg);
            if *bslash && (n as u32) < TRACKED_COMPONENTS {
                mask |= 1 << n;
            }
        }
        if canonical.is_empty() {
            canonical.push('.');
        }

        Ok(CanonicalPath {
            canonical,
            absolute,
            backslash_mask: mask,
        })
    }

    /// The canonical form, always forward-slash separated. This is the key
    /// used for node identity and hashing.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// Render the path using each leading component's original separator
    /// style (forward slash beyond `TRACKED_COMPONENTS`).
    pub fn display_original(&self) -> String {
        let mut out = String::with_capacity(self.canonical.len() + 1);
        if self.absolute {
            let first_bslash = self.backslash_mask & 1 != 0;
            out.push(if first_bslash { '\\' } else { '/' });
        }
        for (n, seg) in self
            .canonical
            .trim_start_matches('/')
            .split('/')
            .enumerate()
        {
            if seg.is_empty() {
                continue;
            }
            if n > 0 {
                let bslash =
                    (n as u32) < TRACKED_COMPONENTS && self.backslash_mask & (1 << n) != 0;
                out.push(if bslash { '\\' } else { '/' });
            }
            out.push_str(seg);
        }
        out
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_duplicate_separators() {
        let p = CanonicalPath::canonicalize("a//b///c").unwrap();
        assert_eq!(p.as_str(), "a/b/c");
    }

    #[test]
    fn drops_dot_components() {
        let p = CanonicalPath::canonicalize("a/./b/.").unwrap();
        assert_eq!(p.as_str(), "a/b");
    }

    #[test]
    fn resolves_dotdot_against_preceding_component() {
        let p = CanonicalPath::canonicalize("a/b/../c").unwrap();
        assert_eq!(p.as_str(), "a/c");
    }

    #[test]
    fn relative_leading_dotdot_preserved() {
        let p = CanonicalPath::canonicalize("../a/b").unwrap();
        assert_eq!(p.as_str(), "../a/b");
    }

    #[test]
    fn relative_dotdot_stacking_preserved() {
        let p = CanonicalPath::canonicalize("../../a").unwrap();
        assert_eq!(p.as_str(), "../../a");
    }

    #[test]
    fn absolute_dotdot_above_root_is_error() {
        let err = CanonicalPath::canonicalize("/../a").unwrap_err();
        assert_eq!(err, CanonicalizeError::AboveRoot("/../a".to_string()));
    }

    #[test]
    fn absolute_root_survives_full_consumption() {
        let p = CanonicalPath::canonicalize("/a/..").unwrap();
        assert_eq!(p.as_str(), "/");
    }

    #[test]
    fn empty_input_is_error() {
        assert_eq!(
            CanonicalPath::canonicalize("").unwrap_err(),
            CanonicalizeError::Empty
        );
    }

    #[test]
    fn backslash_style_round_trips_for_display() {
        let p = CanonicalPath::canonicalize(r"a\b\c").unwrap();
        assert_eq!(p.as_str(), "a/b/c");
        assert_eq!(p.display_original(), r"a\b\c");
    }

    #[test]
    fn mixed_separator_style_is_retained_per_component() {
        let p = CanonicalPath::canonicalize(r"a\b/c").unwrap();
        assert_eq!(p.as_str(), "a/b/c");
        assert_eq!(p.display_original(), r"a\b/c");
    }

    #[test]
    fn equal_canonical_forms_compare_equal() {
        let a = CanonicalPath::canonicalize("a//b").unwrap();
        let b = CanonicalPath::canonicalize(r"a\b").unwrap();
        assert_eq!(a, b);
    }
}
