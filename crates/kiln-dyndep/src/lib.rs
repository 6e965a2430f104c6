//! Dynamic dependency discovery: late graph patching for edges whose full
//! input/output set is only knowable after some other edge has already run
//! (Fortran submodules, generated Objective-C header maps, and the like).
//!
//! A dyndep file names a handful of *already-declared* edges (identified by
//! their primary output) and adds implicit outputs and implicit inputs to
//! each. [`apply`] does this in the two passes the one edge/many-outputs
//! shape demands: first confirm every named edge actually opted in (its
//! `dyndep` binding must point back at this very file) and that no new
//! output collides with an existing producer, then mutate the graph. Doing
//! the checks in a separate pass means a bad dyndep file never leaves the
//! graph half-patched.
//!
//! Like [`kiln_manifest`], the lexical grammar (`build out | out2: dyndep |
//! in2`) is an external collaborator; this crate specifies the data
//! [`DyndepData`] a loader must produce and ships one JSON-backed loader for
//! an end-to-end runnable workspace.

use std::collections::HashSet;

use kiln_graph::{EdgeId, NodeId, State};
use kiln_path::CanonicalPath;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DyndepEntry {
    pub output: String,
    #[serde(default)]
    pub implicit_outputs: Vec<String>,
    #[serde(default)]
    pub implicit_inputs: Vec<String>,
    #[serde(default)]
    pub restat: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DyndepData {
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<DyndepEntry>,
}

#[derive(Debug, Error)]
pub enum DyndepError {
    #[error("dyndep file declares unsupported version {0}")]
    UnsupportedVersion(u32),
    #[error("bad path '{path}': {source}")]
    BadPath {
        path: String,
        #[source]
        source: kiln_path::CanonicalizeError,
    },
    #[error("'{0}' has no producing edge")]
    NoProducer(String),
    #[error("edge producing '{output}' has no matching dyndep binding for this file")]
    BindingMismatch { output: String },
    #[error("dyndep implicit output '{0}' is already produced by another edge")]
    OutputCollision(String),
    #[error("dependency cycle: {0}")]
    DependencyCycle(String),
    #[error("failed to read dyndep file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse dyndep file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Produces a [`DyndepData`] from wherever a dyndep file actually lives.
pub trait DyndepSource {
    fn load(&self) -> Result<DyndepData, DyndepError>;
}

/// Reads a small JSON dyndep file. Not a stand-in for the real grammar — see
/// the module docs.
pub struct JsonDyndepSource {
    path: std::path::PathBuf,
}

impl JsonDyndepSource {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        JsonDyndepSource { path: path.into() }
    }
}

impl DyndepSource for JsonDyndepSource {
    fn load(&self) -> Result<DyndepData, DyndepError> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| DyndepError::Io {
            path: self.path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&text).map_err(|e| DyndepError::Parse {
            path: self.path.display().to_string(),
            source: e,
        })
    }
}

fn canon(raw: &str) -> Result<CanonicalPath, DyndepError> {
    CanonicalPath::canonicalize(raw).map_err(|e| DyndepError::BadPath {
        path: raw.to_string(),
        source: e,
    })
}

struct PlannedPatch {
    edge_id: EdgeId,
    implicit_outputs: Vec<NodeId>,
    implicit_inputs: Vec<NodeId>,
    restat: bool,
}

/// Validate and apply every entry in `data` against edges that declared
/// `source` as their `dyndep` binding. Returns the ids of edges that were
/// patched so the caller can re-run dirtiness analysis on them.
pub fn apply(data: &DyndepData, source: NodeId, state: &mut State) -> Result<Vec<EdgeId>, DyndepError> {
    if data.version != SUPPORTED_VERSION {
        return Err(DyndepError::UnsupportedVersion(data.version));
    }

    // Phase 1: validate every entry before mutating anything.
    let mut planned = Vec::with_capacity(data.entries.len());
    for entry in &data.entries {
        let output_node = state.get_or_add_node(canon(&entry.output)?);
        let edge_id = state
            .node(output_node)
            .in_edge
            .ok_or_else(|| DyndepError::NoProducer(entry.output.clone()))?;
        if state.edge(edge_id).dyndep != Some(source) {
            return Err(DyndepError::BindingMismatch {
                output: entry.output.clone(),
            });
        }

        let mut implicit_outputs = Vec::with_capacity(entry.implicit_outputs.len());
        for raw in &entry.implicit_outputs {
            let node = state.get_or_add_node(canon(raw)?);
            if let Some(existing) = state.node(node).in_edge {
                if existing != edge_id {
                    return Err(DyndepError::OutputCollision(
                        state.node(node).path.as_str().to_string(),
                    ));
                }
            }
            implicit_outputs.push(node);
        }

        let mut implicit_inputs = Vec::with_capacity(entry.implicit_inputs.len());
        for raw in &entry.implicit_inputs {
            implicit_inputs.push(state.get_or_add_node(canon(raw)?));
        }

        planned.push(PlannedPatch {
            edge_id,
            implicit_outputs,
            implicit_inputs,
            restat: entry.restat,
        });
    }

    // Phase 2: patch. Nothing here can fail once validation has passed.
    let mut affected = Vec::with_capacity(planned.len());
    for patch in &planned {
        for &node in &patch.implicit_outputs {
            if state.node(node).in_edge.is_none() {
                state.node_mut(node).in_edge = Some(patch.edge_id);
            }
            state.edge_mut(patch.edge_id).outputs.push_implicit(node);
        }
        for &node in &patch.implicit_inputs {
            state.edge_mut(patch.edge_id).inputs.push_implicit(node);
            state.node_mut(node).out_edges.push(patch.edge_id);
        }
        if patch.restat {
            state.edge_mut(patch.edge_id).dyndep_restat = true;
        }
        affected.push(patch.edge_id);
        tracing::debug!(
            target: "dyndep",
            edge = patch.edge_id.0,
            implicit_outputs = patch.implicit_outputs.len(),
            implicit_inputs = patch.implicit_inputs.len(),
            "edge patched from dyndep"
        );
    }
    state.node_mut(source).dyndep_pending = false;

    for patch in &planned {
        for &node in state.edge(patch.edge_id).outputs.paths.clone().iter() {
            if let Some(msg) = find_cycle(state, node) {
                return Err(DyndepError::DependencyCycle(msg));
            }
        }
    }

    Ok(affected)
}

/// Depth-first search for a path back to `start` through producer edges,
/// following the same "edge's inputs lead to other edges' outputs" walk the
/// scan engine uses. Returns a ` -> `-joined trace when one exists.
fn find_cycle(state: &State, start: NodeId) -> Option<String> {
    let mut stack = Vec::new();
    let mut dead_ends = HashSet::new();
    dfs(state, start, start, &mut stack, &mut dead_ends).map(|trace| {
        trace
            .iter()
            .map(|n| state.node(*n).path.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    })
}

fn dfs(
    state: &State,
    start: NodeId,
    node: NodeId,
    stack: &mut Vec<NodeId>,
    dead_ends: &mut HashSet<NodeId>,
) -> Option<Vec<NodeId>> {
    if node == start && !stack.is_empty() {
        let mut trace = stack.clone();
        trace.push(node);
        return Some(trace);
    }
    if dead_ends.contains(&node) {
        return None;
    }
    stack.push(node);
    let mut found = None;
    if let Some(edge_id) = state.node(node).in_edge {
        for &input in &state.edge(edge_id).inputs.paths {
            if let Some(trace) = dfs(state, start, input, stack, dead_ends) {
                found = Some(trace);
                break;
            }
        }
    }
    stack.pop();
    if found.is_none() {
        dead_ends.insert(node);
    }
    found
}
