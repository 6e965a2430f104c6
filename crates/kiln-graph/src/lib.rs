//! Arena-owned graph storage: nodes, edges, rules, and pools, addressed by
//! stable integer indices. `State` is the single owner; every other crate
//! holds `NodeId`/`EdgeId`/`RuleId`/`PoolId` and borrows `State` to resolve
//! them. This mirrors the teacher's preference for a hand-rolled dense arena
//! over pulling in a graph crate: the shapes here (one arena, parallel
//! `Vec`s, newtype indices) are the same shape `core-state` uses for its
//! buffer/undo-stack storage, just generalized to a bipartite node/edge graph.

use std::collections::HashMap;
use std::rc::Rc;

use kiln_eval::{Env, Template};
use kiln_path::CanonicalPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub u32);

/// Three-valued observed mtime: we have not stat'd yet, the file is known
/// missing, or it carries a concrete timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtimeState {
    Unknown,
    Missing,
    Timestamp(i64),
}

impl MtimeState {
    pub fn is_known(&self) -> bool {
        !matches!(self, MtimeState::Unknown)
    }

    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            MtimeState::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub path: CanonicalPath,
    pub mtime: MtimeState,
    pub dirty: bool,
    pub in_edge: Option<EdgeId>,
    pub out_edges: Vec<EdgeId>,
    pub validation_edges: Vec<EdgeId>,
    /// True when this node was introduced by a depfile or the deps log
    /// rather than appearing in the manifest directly.
    pub generated_by_dep_loader: bool,
    /// True when this node is itself an as-yet-unconsumed dyndep source.
    pub dyndep_pending: bool,
}

impl Node {
    fn new(path: CanonicalPath) -> Self {
        Node {
            path,
            mtime: MtimeState::Unknown,
            dirty: false,
            in_edge: None,
            out_edges: Vec::new(),
            validation_edges: Vec::new(),
            generated_by_dep_loader: false,
            dyndep_pending: false,
        }
    }
}

/// One of the three deps variants a rule can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepsMode {
    None,
    Gcc,
    Msvc,
}

#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub name: String,
    pub command: Option<Template>,
    pub description: Option<Template>,
    pub depfile: Option<Template>,
    pub deps: Option<DepsModeAndPrefix>,
    pub rspfile: Option<Template>,
    pub rspfile_content: Option<Template>,
    pub restat: bool,
    pub generator: bool,
    pub pool: Option<String>,
    pub dyndep: Option<Template>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepsModeAndPrefix {
    pub mode: DepsMode,
    /// MSVC `/showIncludes` line prefix; defaults to `"Note: including file:"`.
    pub msvc_prefix: String,
}

impl Default for DepsModeAndPrefix {
    fn default() -> Self {
        DepsModeAndPrefix {
            mode: DepsMode::None,
            msvc_prefix: "Note: including file:".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pool {
    pub name: String,
    pub depth: u32,
    pub current_use: u32,
    /// Edges parked here because the pool could not admit them; re-examined
    /// on every `EdgeFinished`.
    pub delayed: Vec<EdgeId>,
}

pub const CONSOLE_POOL_NAME: &str = "console";

impl Pool {
    pub fn new(name: impl Into<String>, depth: u32) -> Self {
        Pool {
            name: name.into(),
            depth,
            current_use: 0,
            delayed: Vec::new(),
        }
    }

    pub fn is_console(&self) -> bool {
        self.name == CONSOLE_POOL_NAME
    }

    pub fn unbounded(&self) -> bool {
        self.depth == 0
    }

    pub fn can_admit(&self, weight: u32) -> bool {
        self.unbounded() || self.current_use + weight <= self.depth
    }
}

/// An ordered input list split into explicit / implicit / order-only ranges.
#[derive(Debug, Clone, Default)]
pub struct InputList {
    pub paths: Vec<NodeId>,
    pub implicit_start: usize,
    pub order_only_start: usize,
}

impl InputList {
    pub fn new(explicit: Vec<NodeId>, implicit: Vec<NodeId>, order_only: Vec<NodeId>) -> Self {
        let implicit_start = explicit.len();
        let order_only_start = implicit_start + implicit.len();
        let mut paths = explicit;
        paths.extend(implicit);
        paths.extend(order_only);
        InputList {
            paths,
            implicit_start,
            order_only_start,
        }
    }

    pub fn explicit(&self) -> &[NodeId] {
        &self.paths[..self.implicit_start]
    }

    pub fn implicit(&self) -> &[NodeId] {
        &self.paths[self.implicit_start..self.order_only_start]
    }

    pub fn order_only(&self) -> &[NodeId] {
        &self.paths[self.order_only_start..]
    }

    /// Explicit + implicit, i.e. every input that participates in dirty
    /// checking (order-only inputs are excluded).
    pub fn non_order_only(&self) -> &[NodeId] {
        &self.paths[..self.order_only_start]
    }

    pub fn push_implicit(&mut self, node: NodeId) {
        self.paths.insert(self.order_only_start, node);
        self.order_only_start += 1;
    }
}

/// An ordered output list split into explicit / implicit ranges.
#[derive(Debug, Clone, Default)]
pub struct OutputList {
    pub paths: Vec<NodeId>,
    pub implicit_start: usize,
}

impl OutputList {
    pub fn new(explicit: Vec<NodeId>, implicit: Vec<NodeId>) -> Self {
        let implicit_start = explicit.len();
        let mut paths = explicit;
        paths.extend(implicit);
        OutputList {
            paths,
            implicit_start,
        }
    }

    pub fn explicit(&self) -> &[NodeId] {
        &self.paths[..self.implicit_start]
    }

    pub fn implicit(&self) -> &[NodeId] {
        &self.paths[self.implicit_start..]
    }

    pub fn push_implicit(&mut self, node: NodeId) {
        self.paths.push(node);
    }
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub rule: RuleId,
    pub pool: PoolId,
    pub env: Rc<Env>,
    pub inputs: InputList,
    pub outputs: OutputList,
    pub validations: Vec<NodeId>,
    pub dyndep: Option<NodeId>,
    pub critical_path_weight: i64,
    pub outputs_ready: bool,
    /// Duration estimate in ms, seeded from the build log at scan time.
    pub duration_estimate_ms: i64,
    /// True for the built-in `phony` rule: no command runs, the edge only
    /// aliases inputs under an output name.
    pub is_phony: bool,
    /// Set when a loaded dyndep file declared `restat` for this specific
    /// edge; ORed with the rule's own `restat` flag at scan time. Per-edge
    /// because one rule's dyndep-bearing edges may disagree.
    pub dyndep_restat: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("build graph error: multiple rules generate {0}")]
    DuplicateOutput(String),
    #[error("unknown rule '{0}'")]
    UnknownRule(String),
    #[error("duplicate rule '{0}'")]
    DuplicateRule(String),
    #[error("duplicate pool '{0}'")]
    DuplicatePool(String),
}

/// Owns all nodes, edges, pools, and rules, keyed by stable index.
pub struct State {
    nodes: Vec<Node>,
    node_index: HashMap<String, NodeId>,
    edges: Vec<Edge>,
    rules: Vec<Rule>,
    rule_index: HashMap<String, RuleId>,
    pools: Vec<Pool>,
    pool_index: HashMap<String, PoolId>,
    pub root_env: Rc<Env>,
    pub defaults: Vec<NodeId>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    pub fn new() -> Self {
        let mut state = State {
            nodes: Vec::new(),
            node_index: HashMap::new(),
            edges: Vec::new(),
            rules: Vec::new(),
            rule_index: HashMap::new(),
            pools: Vec::new(),
            pool_index: HashMap::new(),
            root_env: Rc::new(Env::new()),
            defaults: Vec::new(),
        };
        // The implicit unbounded default pool and the console pool always
        // exist; manifests may still declare their own named pools.
        state.add_pool(Pool::new("", 0));
        state.add_pool(Pool::new(CONSOLE_POOL_NAME, 1));
        state
    }

    pub fn default_pool(&self) -> PoolId {
        PoolId(0)
    }

    pub fn console_pool(&self) -> PoolId {
        PoolId(1)
    }

    // -- nodes -----------------------------------------------------------

    pub fn get_or_add_node(&mut self, path: CanonicalPath) -> NodeId {
        if let Some(id) = self.node_index.get(path.as_str()) {
            return *id;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.node_index.insert(path.as_str().to_string(), id);
        self.nodes.push(Node::new(path));
        id
    }

    pub fn lookup_node(&self, path: &str) -> Option<NodeId> {
        self.node_index.get(path).copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    // -- rules -------------------------------------------------------------

    pub fn add_rule(&mut self, rule: Rule) -> Result<RuleId, GraphError> {
        if self.rule_index.contains_key(&rule.name) {
            return Err(GraphError::DuplicateRule(rule.name));
        }
        let id = RuleId(self.rules.len() as u32);
        self.rule_index.insert(rule.name.clone(), id);
        self.rules.push(rule);
        Ok(id)
    }

    pub fn lookup_rule(&self, name: &str) -> Option<RuleId> {
        self.rule_index.get(name).copied()
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.0 as usize]
    }

    // -- pools ---------------------------------------------------------

    pub fn add_pool(&mut self, pool: Pool) -> PoolId {
        let id = PoolId(self.pools.len() as u32);
        self.pool_index.insert(pool.name.clone(), id);
        self.pools.push(pool);
        id
    }

    pub fn add_named_pool(&mut self, pool: Pool) -> Result<PoolId, GraphError> {
        if self.pool_index.contains_key(&pool.name) {
            return Err(GraphError::DuplicatePool(pool.name));
        }
        Ok(self.add_pool(pool))
    }

    pub fn lookup_pool(&self, name: &str) -> Option<PoolId> {
        self.pool_index.get(name).copied()
    }

    pub fn pool(&self, id: PoolId) -> &Pool {
        &self.pools[id.0 as usize]
    }

    pub fn pool_mut(&mut self, id: PoolId) -> &mut Pool {
        &mut self.pools[id.0 as usize]
    }

    pub fn pool_ids(&self) -> impl Iterator<Item = PoolId> {
        (0..self.pools.len() as u32).map(PoolId)
    }

    // -- edges -------------------------------------------------------------

    /// Add an edge. Enforces that every explicit or implicit output has at
    /// most one producing edge; order-only outputs don't exist so this
    /// covers the whole output list.
    pub fn add_edge(&mut self, edge: Edge) -> Result<EdgeId, GraphError> {
        for &out in &edge.outputs.paths {
            if self.nodes[out.0 as usize].in_edge.is_some() {
                return Err(GraphError::DuplicateOutput(
                    self.nodes[out.0 as usize].path.as_str().to_string(),
                ));
            }
        }
        let id = EdgeId(self.edges.len() as u32);
        for &out in &edge.outputs.paths {
            self.nodes[out.0 as usize].in_edge = Some(id);
        }
        for &input in &edge.inputs.paths {
            self.nodes[input.0 as usize].out_edges.push(id);
        }
        for &v in &edge.validations {
            self.nodes[v.0 as usize].validation_edges.push(id);
        }
        tracing::trace!(target: "graph", edge = id.0, outputs = edge.outputs.paths.len(), "edge added");
        self.edges.push(edge);
        Ok(id)
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0 as usize]
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        &mut self.edges[id.0 as usize]
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> {
        (0..self.edges.len() as u32).map(EdgeId)
    }

    /// A node introduced purely by dep-loading (depfile/deps-log) and not
    /// produced by any manifest edge gets a synthetic phony producer so a
    /// missing header becomes a rebuild trigger rather than a fatal
    /// "missing and no known rule" error.
    pub fn ensure_phony_producer(&mut self, node: NodeId, phony_rule: RuleId) -> Option<EdgeId> {
        if self.nodes[node.0 as usize].in_edge.is_some() {
            return None;
        }
        let edge = Edge {
            rule: phony_rule,
            pool: self.default_pool(),
            env: self.root_env.clone(),
            inputs: InputList::default(),
            outputs: OutputList::new(vec![node], vec![]),
            validations: Vec::new(),
            dyndep: None,
            critical_path_weight: 0,
            outputs_ready: false,
            duration_estimate_ms: 0,
            is_phony: true,
            dyndep_restat: false,
        };
        let id = EdgeId(self.edges.len() as u32);
        self.nodes[node.0 as usize].in_edge = Some(id);
        self.edges.push(edge);
        Some(id)
    }
}
