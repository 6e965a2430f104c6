//! Scoped binding environments and lazy string templates.
//!
//! Rule bindings are parsed once, at load time, into a [`Template`]: a
//! sequence of literal and variable chunks. Evaluating a template takes a
//! borrow of an [`Env`] chain and returns a freshly owned `String`; this
//! replaces the virtual-dispatch "eval string" objects the value was
//! distilled from with a plain data structure plus a pure function.

use std::collections::HashMap;
use std::rc::Rc;

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Literal(String),
    Var(String),
}

/// A parsed sequence of literal and variable chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    chunks: Vec<Chunk>,
}

impl Template {
    pub fn literal(s: impl Into<String>) -> Self {
        Template {
            chunks: vec![Chunk::Literal(s.into())],
        }
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Parse `$name`, `${name}`, `$$` (literal `$`), and `$<any other char>`
    /// (that character taken literally — this is how a literal space, `$ `,
    /// or colon, `$:`, is written in bindings) into chunks.
    pub fn parse(src: &str) -> Self {
        let mut chunks = Vec::new();
        let mut literal = String::new();
        let mut chars = src.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if c != '$' {
                literal.push(c);
                continue;
            }
            match chars.peek().copied() {
                Some((_, '{')) => {
                    chars.next();
                    let mut name = String::new();
                    for (_, c2) in chars.by_ref() {
                        if c2 == '}' {
                            break;
                        }
                        name.push(c2);
                    }
                    if !literal.is_empty() {
                        chunks.push(Chunk::Literal(std::mem::take(&mut literal)));
                    }
                    chunks.push(Chunk::Var(name));
                }
                Some((_, c2)) if c2.is_ascii_alphanumeric() || c2 == '_' => {
                    let mut name = String::new();
                    while let Some((_, c3)) = chars.peek().copied() {
                        if c3.is_ascii_alphanumeric() || c3 == '_' {
                            name.push(c3);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if !literal.is_empty() {
                        chunks.push(Chunk::Literal(std::mem::take(&mut literal)));
                    }
                    chunks.push(Chunk::Var(name));
                }
                Some((_, other)) => {
                    // `$$`, `$ `, `$:`, etc: the following character is
                    // taken literally and the `$` is consumed.
                    literal.push(other);
                    chars.next();
                }
                None => {
                    // Trailing lone `$` — keep it literally.
                    literal.push('$');
                }
            }
        }
        if !literal.is_empty() {
            chunks.push(Chunk::Literal(literal));
        }
        Template { chunks }
    }

    /// Substitute each variable chunk via a lookup in `env`. An unbound
    /// variable expands to the empty string.
    pub fn evaluate(&self, env: &Env) -> String {
        let mut out = String::new();
        for chunk in &self.chunks {
            match chunk {
                Chunk::Literal(s) => out.push_str(s),
                Chunk::Var(name) => {
                    if let Some(v) = env.lookup(name) {
                        out.push_str(&v);
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
enum Binding {
    Literal(String),
    Template(Template),
}

/// A scoped binding environment. Lookup walks the parent chain; a template
/// bound in an ancestor scope is evaluated against *that* ancestor's scope,
/// not the scope the lookup started from, matching how nested `build`/`rule`
/// scoping is defined.
#[derive(Debug, Clone, Default)]
pub struct Env {
    bindings: HashMap<String, Binding>,
    parent: Option<Rc<Env>>,
}

impl Env {
    pub fn new() -> Self {
        Env::default()
    }

    pub fn child(parent: Rc<Env>) -> Self {
        Env {
            bindings: HashMap::new(),
            parent: Some(parent),
        }
    }

    pub fn bind_literal(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.bindings
            .insert(name.into(), Binding::Literal(value.into()));
    }

    pub fn bind_template(&mut self, name: impl Into<String>, value: Template) {
        self.bindings.insert(name.into(), Binding::Template(value));
    }

    /// Resolve `name`, evaluating a template binding lazily in the scope it
    /// was defined in. Returns `None` only when no scope in the chain binds
    /// the name at all (callers generally want `lookup(..).unwrap_or_default()`
    /// since ninja-style templates expand unbound variables to "").
    pub fn lookup(&self, name: &str) -> Option<String> {
        if let Some(b) = self.bindings.get(name) {
            return Some(match b {
                Binding::Literal(s) => s.clone(),
                Binding::Template(t) => t.evaluate(self),
            });
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    pub fn lookup_or_empty(&self, name: &str) -> String {
        self.lookup(name).unwrap_or_default()
    }
}

/// Join `paths` space-separated with minimal shell-safe quoting: any path
/// containing whitespace, a quote, or a shell metacharacter is wrapped in
/// single quotes (embedded single quotes are escaped `'\''`). This backs the
/// `$in`/`$out` magic bindings.
pub fn shell_quote_join(paths: &[&str]) -> String {
    paths
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn needs_quoting(s: &str) -> bool {
    s.is_empty()
        || s.chars()
            .any(|c| c.is_whitespace() || "'\"$&|;<>()`\\*?[]{}~!#".contains(c))
}

fn shell_quote(s: &str) -> String {
    if !needs_quoting(s) {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Join paths with newlines, for `$in_newline` expansion in response files.
pub fn newline_join(paths: &[&str]) -> String {
    paths.join("\n")
}
