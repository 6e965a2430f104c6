//! Manifest data-model contract.
//!
//! The manifest's lexical grammar is an external collaborator (see the
//! top-level design notes) — this crate specifies only what a loader must
//! *produce*: rules, pools, build edges, and default targets, each still
//! holding their raw (unparsed) template strings. [`materialize`] is the one
//! place those strings turn into [`kiln_graph::State`] content: templates get
//! parsed, paths get canonicalized and interned as nodes, and edges get
//! wired up with their magic `$in`/`$out`/`$in_newline` bindings.
//!
//! Exactly one concrete loader ships here: [`JsonManifestSource`], a direct
//! structural transliteration of the field list below. It exists so the
//! workspace is runnable end to end without committing to any particular
//! surface syntax; it makes no attempt at the expressiveness (variable
//! scoping rules, `include`/`subninja`, escapes) a real manifest lexer would
//! have.

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use kiln_eval::{shell_quote_join, Env, Template};
use kiln_graph::{
    DepsMode, DepsModeAndPrefix, Edge, GraphError, InputList, OutputList, Pool, Rule, State,
};
use kiln_path::CanonicalPath;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PHONY_RULE_NAME: &str = "phony";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuleDecl {
    pub name: String,
    #[serde(default)]
    pub bindings: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDecl {
    pub name: String,
    pub depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EdgeDecl {
    pub rule: String,
    #[serde(default)]
    pub explicit_outputs: Vec<String>,
    #[serde(default)]
    pub implicit_outputs: Vec<String>,
    #[serde(default)]
    pub explicit_inputs: Vec<String>,
    #[serde(default)]
    pub implicit_inputs: Vec<String>,
    #[serde(default)]
    pub order_only_inputs: Vec<String>,
    #[serde(default)]
    pub validations: Vec<String>,
    #[serde(default)]
    pub bindings: HashMap<String, String>,
}

/// Whether a sub-include shares the parent binding environment (`flat`) or
/// gets a fresh child environment (`nested`). Recorded here for fidelity to
/// the external manifest format; [`JsonManifestSource`] has no include
/// mechanism of its own so this never appears in practice yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingScope {
    Flat,
    Nested,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManifestData {
    #[serde(default)]
    pub rules: Vec<RuleDecl>,
    #[serde(default)]
    pub pools: Vec<PoolDecl>,
    #[serde(default)]
    pub edges: Vec<EdgeDecl>,
    #[serde(default)]
    pub defaults: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("unknown rule '{0}' referenced by a build edge")]
    UnknownRule(String),
    #[error("unknown pool '{0}' referenced by rule or edge")]
    UnknownPool(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("bad path '{path}': {source}")]
    BadPath {
        path: String,
        #[source]
        source: kiln_path::CanonicalizeError,
    },
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Produces a [`ManifestData`]. The lexer/parser that turns a surface
/// syntax into this shape lives outside this crate's scope.
pub trait ManifestSource {
    fn load(&self) -> Result<ManifestData, ManifestError>;
}

/// Reads a small JSON manifest. Not a stand-in for the real grammar — see
/// the module docs.
pub struct JsonManifestSource {
    path: PathBuf,
}

impl JsonManifestSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonManifestSource { path: path.into() }
    }
}

impl ManifestSource for JsonManifestSource {
    fn load(&self) -> Result<ManifestData, ManifestError> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| ManifestError::Io {
            path: self.path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&text).map_err(|e| ManifestError::Parse {
            path: self.path.display().to_string(),
            source: e,
        })
    }
}

fn canon(raw: &str) -> Result<CanonicalPath, ManifestError> {
    CanonicalPath::canonicalize(raw).map_err(|e| ManifestError::BadPath {
        path: raw.to_string(),
        source: e,
    })
}

fn parse_deps(binding: Option<&String>, msvc_prefix: Option<&String>) -> Option<DepsModeAndPrefix> {
    let mode = match binding.map(String::as_str) {
        Some("gcc") => DepsMode::Gcc,
        Some("msvc") => DepsMode::Msvc,
        _ => return None,
    };
    let mut d = DepsModeAndPrefix {
        mode,
        ..Default::default()
    };
    if let Some(prefix) = msvc_prefix {
        d.msvc_prefix = prefix.clone();
    }
    Some(d)
}

fn is_truthy(binding: Option<&String>) -> bool {
    matches!(binding.map(String::as_str), Some("1") | Some("true"))
}

fn build_rule(decl: &RuleDecl) -> Rule {
    let b = &decl.bindings;
    Rule {
        name: decl.name.clone(),
        command: b.get("command").map(|s| Template::parse(s)),
        description: b.get("description").map(|s| Template::parse(s)),
        depfile: b.get("depfile").map(|s| Template::parse(s)),
        deps: parse_deps(b.get("deps"), b.get("msvc_deps_prefix")),
        rspfile: b.get("rspfile").map(|s| Template::parse(s)),
        rspfile_content: b.get("rspfile_content").map(|s| Template::parse(s)),
        restat: is_truthy(b.get("restat")),
        generator: is_truthy(b.get("generator")),
        pool: b.get("pool").cloned(),
        dyndep: b.get("dyndep").map(|s| Template::parse(s)),
    }
}

/// Turn a loaded [`ManifestData`] into graph content, returning the resolved
/// default targets (or, if the manifest declared none, an empty list — the
/// caller falls back to "all nodes with no consumer" per convention).
pub fn materialize(
    data: &ManifestData,
    state: &mut State,
) -> Result<Vec<kiln_graph::NodeId>, ManifestError> {
    if state.lookup_rule(PHONY_RULE_NAME).is_none() {
        state.add_rule(Rule {
            name: PHONY_RULE_NAME.to_string(),
            ..Default::default()
        })?;
    }

    for decl in &data.rules {
        if decl.name == PHONY_RULE_NAME {
            continue;
        }
        state.add_rule(build_rule(decl))?;
        tracing::debug!(target: "manifest", rule = %decl.name, "rule registered");
    }

    for decl in &data.pools {
        state.add_named_pool(Pool::new(decl.name.clone(), decl.depth))?;
        tracing::debug!(target: "manifest", pool = %decl.name, depth = decl.depth, "pool registered");
    }

    for decl in &data.edges {
        add_edge(decl, state)?;
    }

    let mut defaults = Vec::new();
    for d in &data.defaults {
        let path = canon(d)?;
        defaults.push(state.get_or_add_node(path));
    }
    Ok(defaults)
}

fn resolve_nodes(paths: &[String], state: &mut State) -> Result<Vec<kiln_graph::NodeId>, ManifestError> {
    paths
        .iter()
        .map(|p| canon(p).map(|c| state.get_or_add_node(c)))
        .collect()
}

fn add_edge(decl: &EdgeDecl, state: &mut State) -> Result<(), ManifestError> {
    let rule_id = state
        .lookup_rule(&decl.rule)
        .ok_or_else(|| ManifestError::UnknownRule(decl.rule.clone()))?;
    let rule = state.rule(rule_id).clone();

    let explicit_inputs = resolve_nodes(&decl.explicit_inputs, state)?;
    let implicit_inputs = resolve_nodes(&decl.implicit_inputs, state)?;
    let order_only_inputs = resolve_nodes(&decl.order_only_inputs, state)?;
    let explicit_outputs = resolve_nodes(&decl.explicit_outputs, state)?;
    let implicit_outputs = resolve_nodes(&decl.implicit_outputs, state)?;
    let validations = resolve_nodes(&decl.validations, state)?;

    let pool_name = decl
        .bindings
        .get("pool")
        .cloned()
        .or_else(|| rule.pool.clone());
    let pool_id = match pool_name {
        Some(name) if !name.is_empty() => state
            .lookup_pool(&name)
            .ok_or(ManifestError::UnknownPool(name))?,
        _ => state.default_pool(),
    };

    let dyndep_raw = decl.bindings.get("dyndep").cloned().or_else(|| {
        rule.dyndep
            .as_ref()
            .map(|t| t.evaluate(&state.root_env))
            .filter(|s| !s.is_empty())
    });
    let dyndep_node = match dyndep_raw {
        Some(s) if !s.is_empty() => {
            let node = state.get_or_add_node(canon(&s)?);
            state.node_mut(node).dyndep_pending = true;
            Some(node)
        }
        _ => None,
    };

    let mut env = Env::child(state.root_env.clone());
    let explicit_in_strs: Vec<&str> = explicit_inputs
        .iter()
        .map(|n| state.node(*n).path.as_str())
        .collect();
    let explicit_out_strs: Vec<&str> = explicit_outputs
        .iter()
        .map(|n| state.node(*n).path.as_str())
        .collect();
    env.bind_literal("in", shell_quote_join(&explicit_in_strs));
    env.bind_literal("out", shell_quote_join(&explicit_out_strs));
    env.bind_literal("in_newline", kiln_eval::newline_join(&explicit_in_strs));
    for (k, v) in &decl.bindings {
        env.bind_template(k.clone(), Template::parse(v));
    }

    let is_phony = decl.rule == PHONY_RULE_NAME;
    let edge = Edge {
        rule: rule_id,
        pool: pool_id,
        env: Rc::new(env),
        inputs: InputList::new(explicit_inputs, implicit_inputs, order_only_inputs),
        outputs: OutputList::new(explicit_outputs, implicit_outputs),
        validations,
        dyndep: dyndep_node,
        critical_path_weight: 0,
        outputs_ready: false,
        duration_estimate_ms: 0,
        is_phony,
        dyndep_restat: false,
    };
    state.add_edge(edge)?;
    Ok(())
}
