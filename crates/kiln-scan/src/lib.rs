//! Dependency scan: dirtiness analysis and critical-path weighting.
//!
//! [`scan`] walks the transitive input closure of a target node exactly
//! once per node (`stat_if_necessary`'s one-call guarantee is the memo map
//! below), folding in whatever the depfile/deps-log/build-log already know,
//! and leaves every visited node's `dirty` flag and every visited edge's
//! `critical_path_weight` set for the scheduler to read back out of `State`.

use std::collections::HashMap;
use std::path::Path;

use kiln_buildlog::BuildLog;
use kiln_depslog::DepsLog;
use kiln_fs::{DiskInterface, Stat};
use kiln_graph::{DepsMode, MtimeState, NodeId, RuleId, State};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to stat '{path}': {source}")]
    Stat {
        path: String,
        #[source]
        source: kiln_fs::DiskError,
    },
    #[error("depfile for '{output}' is missing or unparseable")]
    DepfileUnusable { output: String },
    #[error("dependency cycle: {0}")]
    DependencyCycle(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    pub dirty: bool,
    pub critical_path_weight: i64,
}

#[derive(Default)]
struct Memo {
    finished: HashMap<NodeId, ScanOutcome>,
    stack: Vec<NodeId>,
}

/// Recompute dirtiness and critical-path weight for `target` and everything
/// it transitively depends on. `phony_rule` is the id of the built-in phony
/// rule, used when a depfile or deps-log entry names a header not already
/// in the graph.
pub fn scan(
    state: &mut State,
    target: NodeId,
    phony_rule: RuleId,
    disk: &dyn DiskInterface,
    build_log: &BuildLog,
    deps_log: &DepsLog,
) -> Result<ScanOutcome, ScanError> {
    let mut memo = Memo::default();
    visit(state, target, phony_rule, disk, build_log, deps_log, &mut memo)
}

fn stat_if_necessary(state: &mut State, disk: &dyn DiskInterface, node: NodeId) -> Result<(), ScanError> {
    if state.node(node).mtime.is_known() {
        return Ok(());
    }
    let path_str = state.node(node).path.as_str().to_string();
    let stat = disk
        .stat(Path::new(&path_str))
        .map_err(|source| ScanError::Stat {
            path: path_str,
            source,
        })?;
    state.node_mut(node).mtime = match stat {
        Stat::Missing => MtimeState::Missing,
        Stat::Mtime(t) => MtimeState::Timestamp(t),
    };
    Ok(())
}

fn cycle_message(state: &State, stack: &[NodeId], repeated: NodeId) -> String {
    let start = stack.iter().position(|&n| n == repeated).unwrap_or(0);
    let mut names: Vec<&str> = stack[start..].iter().map(|&n| state.node(n).path.as_str()).collect();
    names.push(state.node(repeated).path.as_str());
    names.join(" -> ")
}

fn ingest_extra_input(
    state: &mut State,
    phony_rule: RuleId,
    disk: &dyn DiskInterface,
    build_log: &BuildLog,
    deps_log: &DepsLog,
    memo: &mut Memo,
    path_str: &str,
) -> Result<ScanOutcome, ScanError> {
    let canon = kiln_path::CanonicalPath::canonicalize(path_str)
        .unwrap_or_else(|_| kiln_path::CanonicalPath::canonicalize(".").unwrap());
    let node = state.get_or_add_node(canon);
    state.node_mut(node).generated_by_dep_loader = true;
    state.ensure_phony_producer(node, phony_rule);
    visit(state, node, phony_rule, disk, build_log, deps_log, memo)
}

fn visit(
    state: &mut State,
    node: NodeId,
    phony_rule: RuleId,
    disk: &dyn DiskInterface,
    build_log: &BuildLog,
    deps_log: &DepsLog,
    memo: &mut Memo,
) -> Result<ScanOutcome, ScanError> {
    if let Some(outcome) = memo.finished.get(&node) {
        return Ok(*outcome);
    }
    if memo.stack.contains(&node) {
        // `build a: phony a` is a historical no-op rather than a hard cycle:
        // a phony edge that lists its own output among its inputs aliases
        // nothing and is simply never dirty on that account.
        if let Some(edge_id) = state.node(node).in_edge {
            if state.edge(edge_id).is_phony && state.edge(edge_id).inputs.non_order_only().contains(&node) {
                tracing::warn!(target: "scan", node = node.0, "phony self-cycle ignored (phonycycle=warn)");
                let outcome = ScanOutcome {
                    dirty: false,
                    critical_path_weight: 0,
                };
                memo.finished.insert(node, outcome);
                return Ok(outcome);
            }
        }
        return Err(ScanError::DependencyCycle(cycle_message(state, &memo.stack, node)));
    }
    memo.stack.push(node);

    stat_if_necessary(state, disk, node)?;
    let in_edge = state.node(node).in_edge;

    let outcome = match in_edge {
        None => ScanOutcome {
            dirty: matches!(state.node(node).mtime, MtimeState::Missing),
            critical_path_weight: 0,
        },
        Some(edge_id) => {
            let rule_id = state.edge(edge_id).rule;
            let rule = state.rule(rule_id).clone();
            let env = state.edge(edge_id).env.clone();
            let non_order_only: Vec<NodeId> = state.edge(edge_id).inputs.non_order_only().to_vec();
            let order_only: Vec<NodeId> = state.edge(edge_id).inputs.order_only().to_vec();
            let is_phony = state.edge(edge_id).is_phony;
            let dyndep_restat = state.edge(edge_id).dyndep_restat;
            let output_path = state.node(node).path.as_str().to_string();

            let mut any_input_dirty = false;
            let mut max_input_mtime: Option<i64> = None;
            let mut max_child_weight: i64 = 0;

            for input in &non_order_only {
                let r = visit(state, *input, phony_rule, disk, build_log, deps_log, memo)?;
                any_input_dirty |= r.dirty;
                max_child_weight = max_child_weight.max(r.critical_path_weight);
                if let Some(t) = state.node(*input).mtime.as_timestamp() {
                    max_input_mtime = Some(max_input_mtime.map_or(t, |m| m.max(t)));
                }
            }

            let mut order_only_missing = false;
            for input in &order_only {
                let r = visit(state, *input, phony_rule, disk, build_log, deps_log, memo)?;
                max_child_weight = max_child_weight.max(r.critical_path_weight);
                if matches!(state.node(*input).mtime, MtimeState::Missing) {
                    order_only_missing = true;
                }
            }

            // deps-log-backed implicit inputs (gcc or msvc, whichever the
            // rule last ran with — the log doesn't distinguish).
            if let Some(deps) = &rule.deps {
                if deps.mode != DepsMode::None {
                    if let Some(record) = deps_log.get(&output_path) {
                        let inputs = record.inputs.clone();
                        for input_path in &inputs {
                            let r = ingest_extra_input(
                                state, phony_rule, disk, build_log, deps_log, memo, input_path,
                            )?;
                            any_input_dirty |= r.dirty;
                            max_child_weight = max_child_weight.max(r.critical_path_weight);
                            if let Some(node_id) = state.lookup_node(input_path) {
                                if let Some(t) = state.node(node_id).mtime.as_timestamp() {
                                    max_input_mtime = Some(max_input_mtime.map_or(t, |m| m.max(t)));
                                }
                            }
                        }
                    }
                }
            }

            // a depfile declared on a deps=unset rule is read straight off
            // disk every scan: nothing persists it, so there is nothing to
            // consult but the file itself.
            let mut depfile_unusable = false;
            let wants_disk_depfile = rule
                .deps
                .as_ref()
                .map(|d| d.mode == DepsMode::None)
                .unwrap_or(true);
            if wants_disk_depfile {
                if let Some(depfile_tpl) = &rule.depfile {
                    let depfile_path = depfile_tpl.evaluate(&env);
                    if !depfile_path.is_empty() {
                        match disk.read_file(Path::new(&depfile_path)) {
                            Ok(bytes) => {
                                let text = String::from_utf8_lossy(&bytes);
                                match kiln_depfile::parse(&text) {
                                    Ok(df) => {
                                        for prereq in &df.prereqs {
                                            let r = ingest_extra_input(
                                                state,
                                                phony_rule,
                                                disk,
                                                build_log,
                                                deps_log,
                                                memo,
                                                prereq.as_str(),
                                            )?;
                                            any_input_dirty |= r.dirty;
                                            max_child_weight =
                                                max_child_weight.max(r.critical_path_weight);
                                            if let Some(node_id) = state.lookup_node(prereq.as_str()) {
                                                if let Some(t) =
                                                    state.node(node_id).mtime.as_timestamp()
                                                {
                                                    max_input_mtime =
                                                        Some(max_input_mtime.map_or(t, |m| m.max(t)));
                                                }
                                            }
                                        }
                                    }
                                    Err(_) => depfile_unusable = true,
                                }
                            }
                            Err(_) => depfile_unusable = true,
                        }
                    }
                }
            }

            let missing = matches!(state.node(node).mtime, MtimeState::Missing);
            let own_mtime = state.node(node).mtime.as_timestamp();
            let reference_time = if rule.restat || dyndep_restat {
                let log_mtime = build_log.get(&output_path).map(|e| e.mtime);
                match (own_mtime, log_mtime) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (Some(a), None) => Some(a),
                    (None, Some(b)) => Some(b),
                    (None, None) => None,
                }
            } else {
                own_mtime
            };
            let newer_input = matches!((max_input_mtime, reference_time), (Some(i), Some(r)) if i > r);

            let command_changed = if is_phony {
                false
            } else {
                let cmd = rule
                    .command
                    .as_ref()
                    .map(|t| t.evaluate(&env))
                    .unwrap_or_default();
                let hash = kiln_buildlog::hash_command(&cmd);
                // No log entry at all just means this output predates any
                // recorded build (e.g. hand-placed fixture, or pre-kiln
                // artifact) — absence alone must not force a rebuild, only a
                // recorded mismatch does.
                build_log
                    .get(&output_path)
                    .map(|e| e.command_hash != hash)
                    .unwrap_or(false)
            };

            let dirty = missing
                || any_input_dirty
                || newer_input
                || command_changed
                || depfile_unusable
                || order_only_missing;

            let duration_estimate = build_log
                .get(&output_path)
                .map(|e| (e.end_ms - e.start_ms).max(1))
                .unwrap_or(1);
            let weight = duration_estimate + max_child_weight;

            state.edge_mut(edge_id).critical_path_weight = weight;
            ScanOutcome {
                dirty,
                critical_path_weight: weight,
            }
        }
    };

    state.node_mut(node).dirty = outcome.dirty;
    memo.stack.pop();
    memo.finished.insert(node, outcome);
    tracing::trace!(target: "scan", node = node.0, dirty = outcome.dirty, weight = outcome.critical_path_weight, "node scanned");
    Ok(outcome)
}
