//! The orchestrator: the single loop that turns a [`kiln_plan::Plan`] and a
//! [`kiln_runner::CommandRunner`] into a finished build.
//!
//! This crate owns no state of its own beyond bookkeeping for in-flight
//! commands — `State`, the logs, the disk, and the sink are all borrowed from
//! the caller for the duration of one [`Builder::build`] call, the same
//! "orchestrator borrows, components own" split the teacher's `ox-bin`
//! applies between its `AppStartup` and the editor core it drives.

use std::collections::HashMap;
use std::path::Path;

use kiln_buildlog::BuildLog;
use kiln_depslog::DepsLog;
use kiln_events::{CommandOutcome, ExitStatus, StatusEvent, StatusSink};
use kiln_fs::{DiskInterface, Stat};
use kiln_graph::{DepsMode, EdgeId, NodeId, RuleId, State};
use kiln_plan::{FinishResult, Plan, PlanError, UnblockReason};
use kiln_runner::{CommandResult, CommandRunner, CommandSpec, ExitKind, RunnerError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Scan(#[from] kiln_scan::ScanError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("the build was interrupted")]
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    Failure,
    Interrupted,
}

#[derive(Debug, Clone, Copy)]
pub struct BuildConfig {
    /// Upper bound on concurrently running commands (the default, unnamed
    /// pool's effective depth).
    pub parallelism: usize,
    pub failures_allowed: usize,
    /// `-n`: walk the plan and report what would run without running it.
    pub dry_run: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            parallelism: 1,
            failures_allowed: 1,
            dry_run: false,
        }
    }
}

/// Accumulated log bytes the caller (the CLI) is responsible for persisting.
/// Folding and formatting happens here; actual file I/O stays outside, the
/// same split [`kiln_buildlog`] and [`kiln_depslog`] document for themselves.
#[derive(Debug, Default)]
pub struct LogAppends {
    pub build_log_text: String,
    pub deps_log_bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct BuildSummary {
    pub status: BuildStatus,
    pub commands_run: usize,
    pub failures: usize,
    pub log_appends: LogAppends,
}

struct InFlight {
    wall_start_ms: i64,
    /// Pre-run mtimes of this edge's own outputs, keyed by output path —
    /// the baseline a restat-classified edge compares its post-run stat
    /// against.
    output_mtimes_before: HashMap<String, Option<i64>>,
}

/// Drives one build to completion. Borrowed collaborators come in through
/// [`Builder::build`]'s parameters; this struct only holds the bookkeeping
/// that has to survive between `find_work` and `wait_for_command` calls.
pub struct Builder {
    phony_rule: RuleId,
    config: BuildConfig,
    in_flight: HashMap<EdgeId, InFlight>,
}

impl Builder {
    pub fn new(phony_rule: RuleId, config: BuildConfig) -> Self {
        Builder {
            phony_rule,
            config,
            in_flight: HashMap::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &mut self,
        state: &mut State,
        disk: &dyn DiskInterface,
        runner: &mut dyn CommandRunner,
        build_log: &mut BuildLog,
        deps_log: &mut DepsLog,
        sink: &dyn StatusSink,
        targets: &[NodeId],
        interrupted: &dyn Fn() -> bool,
    ) -> Result<BuildSummary, BuildError> {
        let mut plan = Plan::new(self.config.failures_allowed.max(1));
        let mut appends = LogAppends::default();

        for &target in targets {
            kiln_scan::scan(state, target, self.phony_rule, disk, build_log, deps_log)?;
            plan.add_target(state, target)?;
        }
        plan.prepare_queue(state);

        sink.event(&StatusEvent::BuildStarted);
        sink.event(&StatusEvent::PlanHasTotalEdges(plan.command_edge_count()));

        let mut status = BuildStatus::Success;

        'outer: while plan.more_to_do() {
            if interrupted() {
                status = BuildStatus::Interrupted;
                break;
            }

            // (a) admit as much ready work as the runner and pools allow.
            while runner.can_run_more() > 0 {
                let Some(edge_id) = plan.find_work(state) else {
                    break;
                };
                self.dispatch(state, disk, runner, build_log, deps_log, sink, edge_id, &mut plan)?;
            }

            if self.in_flight.is_empty() && !plan.more_to_do() {
                break;
            }
            if self.in_flight.is_empty() {
                // Nothing running and nothing admitted this round: either the
                // plan is waiting on a recheck that already resolved above,
                // or it's genuinely stuck.
                plan.check_progress()?;
                if self.in_flight.is_empty() {
                    break 'outer;
                }
            }

            let Some(result) = runner.wait_for_command() else {
                break;
            };
            self.finish(state, disk, build_log, deps_log, sink, &mut plan, result, &mut appends);

            if interrupted() {
                status = BuildStatus::Interrupted;
                break;
            }
        }

        if status == BuildStatus::Interrupted {
            runner.abort();
            while let Some(result) = runner.wait_for_command() {
                self.finish(state, disk, build_log, deps_log, sink, &mut plan, result, &mut appends);
            }
        } else if plan.failures() > 0 {
            status = BuildStatus::Failure;
        }

        sink.event(&StatusEvent::BuildFinished);
        Ok(BuildSummary {
            status,
            commands_run: plan.command_edge_count(),
            failures: plan.failures(),
            log_appends: appends,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &mut self,
        state: &mut State,
        disk: &dyn DiskInterface,
        runner: &mut dyn CommandRunner,
        build_log: &BuildLog,
        deps_log: &DepsLog,
        sink: &dyn StatusSink,
        edge_id: EdgeId,
        plan: &mut Plan,
    ) -> Result<(), BuildError> {
        if state.edge(edge_id).is_phony {
            tracing::trace!(target: "builder", edge = edge_id.0, "phony edge, no command");
            let outcome = plan.edge_finished(state, edge_id, FinishResult::Succeeded);
            self.propagate(state, disk, build_log, deps_log, plan, outcome);
            return Ok(());
        }

        if let Some(dyndep_node) = state.edge(edge_id).dyndep {
            if state.node(dyndep_node).dyndep_pending {
                self.apply_dyndep(state, disk, dyndep_node);
            }
        }

        let rule_id = state.edge(edge_id).rule;
        let rule = state.rule(rule_id).clone();
        let env = state.edge(edge_id).env.clone();
        let command_line = rule.command.as_ref().map(|t| t.evaluate(&env)).unwrap_or_default();
        let description = rule
            .description
            .as_ref()
            .map(|t| t.evaluate(&env))
            .unwrap_or_else(|| command_line.clone());
        let console = state.pool(state.edge(edge_id).pool).is_console();

        let output_paths: Vec<String> = state
            .edge(edge_id)
            .outputs
            .paths
            .iter()
            .map(|&n| state.node(n).path.as_str().to_string())
            .collect();
        for out in &output_paths {
            if let Some(parent) = Path::new(out).parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = disk.make_dirs(parent);
                }
            }
        }

        if let Some(rspfile_tpl) = &rule.rspfile {
            let rspfile_path = rspfile_tpl.evaluate(&env);
            let content = rule
                .rspfile_content
                .as_ref()
                .map(|t| t.evaluate(&env))
                .unwrap_or_default();
            if !rspfile_path.is_empty() {
                let _ = disk.write_file(Path::new(&rspfile_path), content.as_bytes());
            }
        }

        let output_mtimes_before = output_paths
            .iter()
            .map(|p| {
                let m = disk.stat(Path::new(p)).ok().and_then(|s| match s {
                    Stat::Mtime(t) => Some(t),
                    Stat::Missing => None,
                });
                (p.clone(), m)
            })
            .collect();

        let wall_start_ms = now_ms();
        sink.event(&StatusEvent::EdgeStarted {
            edge: edge_id,
            description: description.clone(),
            wall_ms: wall_start_ms,
        });

        if self.config.dry_run {
            tracing::debug!(target: "builder", edge = edge_id.0, "dry run, command not executed");
            let outcome = plan.edge_finished(state, edge_id, FinishResult::Succeeded);
            sink.event(&StatusEvent::EdgeFinished {
                edge: edge_id,
                description,
                outcome: CommandOutcome {
                    wall_start_ms,
                    wall_end_ms: wall_start_ms,
                    status: ExitStatus::Success,
                    captured_output: String::new(),
                },
            });
            self.propagate(state, disk, build_log, deps_log, plan, outcome);
            return Ok(());
        }

        self.in_flight.insert(
            edge_id,
            InFlight {
                wall_start_ms,
                output_mtimes_before,
            },
        );

        if let Err(err) = runner.start_command(CommandSpec {
            edge: edge_id,
            command_line,
            console,
        }) {
            tracing::warn!(target: "builder", edge = edge_id.0, error = %err, "failed to start command");
            self.in_flight.remove(&edge_id);
            self.report_spawn_failure(state, plan, sink, edge_id, description, wall_start_ms, err);
        }
        Ok(())
    }

    fn report_spawn_failure(
        &mut self,
        state: &mut State,
        plan: &mut Plan,
        sink: &dyn StatusSink,
        edge_id: EdgeId,
        description: String,
        wall_start_ms: i64,
        err: RunnerError,
    ) {
        let wall_end_ms = now_ms();
        sink.event(&StatusEvent::EdgeFinished {
            edge: edge_id,
            description: description.clone(),
            outcome: CommandOutcome {
                wall_start_ms,
                wall_end_ms,
                status: ExitStatus::Failure,
                captured_output: format!("FAILED: {description}\n{err}"),
            },
        });
        let cancelled = plan.edge_finished(state, edge_id, FinishResult::Failed);
        for edge in cancelled.cancelled {
            tracing::debug!(target: "builder", edge = edge.0, "cancelled after spawn failure");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &mut self,
        state: &mut State,
        disk: &dyn DiskInterface,
        build_log: &mut BuildLog,
        deps_log: &mut DepsLog,
        sink: &dyn StatusSink,
        plan: &mut Plan,
        result: CommandResult,
        appends: &mut LogAppends,
    ) {
        let edge_id = result.edge;
        let Some(in_flight) = self.in_flight.remove(&edge_id) else {
            return;
        };

        let rule_id = state.edge(edge_id).rule;
        let rule = state.rule(rule_id).clone();
        let env = state.edge(edge_id).env.clone();
        let command_line = rule.command.as_ref().map(|t| t.evaluate(&env)).unwrap_or_default();
        let description = rule
            .description
            .as_ref()
            .map(|t| t.evaluate(&env))
            .unwrap_or_else(|| command_line.clone());

        match result.status {
            ExitKind::Interrupted => {
                // Outputs a command touched before being killed are no longer
                // trustworthy: delete anything stamped after the command's
                // own start time rather than leave a half-written artifact
                // behind looking legitimate.
                for &out in &state.edge(edge_id).outputs.paths {
                    let path_str = state.node(out).path.as_str().to_string();
                    if let Ok(Stat::Mtime(t)) = disk.stat(Path::new(&path_str)) {
                        if t >= in_flight.wall_start_ms {
                            let _ = disk.remove_file(Path::new(&path_str));
                        }
                    }
                }
                sink.event(&StatusEvent::EdgeFinished {
                    edge: edge_id,
                    description,
                    outcome: CommandOutcome {
                        wall_start_ms: result.wall_start_ms,
                        wall_end_ms: result.wall_end_ms,
                        status: ExitStatus::Interrupted,
                        captured_output: result.captured_output,
                    },
                });
                let outcome = plan.edge_finished(state, edge_id, FinishResult::Failed);
                self.propagate(state, disk, build_log, deps_log, plan, outcome);
                return;
            }
            ExitKind::Failure => {
                sink.event(&StatusEvent::EdgeFinished {
                    edge: edge_id,
                    description: description.clone(),
                    outcome: CommandOutcome {
                        wall_start_ms: result.wall_start_ms,
                        wall_end_ms: result.wall_end_ms,
                        status: ExitStatus::Failure,
                        captured_output: format!("FAILED: {command_line}\n{}", result.captured_output),
                    },
                });
                let outcome = plan.edge_finished(state, edge_id, FinishResult::Failed);
                self.propagate(state, disk, build_log, deps_log, plan, outcome);
                return;
            }
            ExitKind::Success => {}
        }

        let mut captured_output = result.captured_output;

        // 3b: gcc-style depfile ingestion.
        if matches!(rule.deps.as_ref().map(|d| d.mode), Some(DepsMode::Gcc)) {
            if let Some(depfile_tpl) = &rule.depfile {
                let depfile_path = depfile_tpl.evaluate(&env);
                if !depfile_path.is_empty() {
                    if let Ok(bytes) = disk.read_file(Path::new(&depfile_path)) {
                        let text = String::from_utf8_lossy(&bytes);
                        if let Ok(df) = kiln_depfile::parse(&text) {
                            self.ingest_implicit_inputs(state, disk, edge_id, &df.prereqs.iter().map(|p| p.as_str().to_string()).collect::<Vec<_>>());
                            self.record_deps(state, disk, deps_log, appends, edge_id, &df.prereqs.iter().map(|p| p.as_str().to_string()).collect::<Vec<_>>());
                        } else {
                            tracing::warn!(target: "builder", edge = edge_id.0, "depfile unparseable, implicit deps not updated this run");
                        }
                    }
                    let _ = disk.remove_file(Path::new(&depfile_path));
                }
            }
        }

        // 3c: msvc /showIncludes scraping.
        if let Some(deps) = rule.deps.as_ref().filter(|d| d.mode == DepsMode::Msvc) {
            let prefix = &deps.msvc_prefix;
            let mut kept_lines = Vec::new();
            let mut found = Vec::new();
            for line in captured_output.lines() {
                if let Some(rest) = line.strip_prefix(prefix.as_str()) {
                    found.push(rest.trim().to_string());
                } else {
                    kept_lines.push(line);
                }
            }
            if !found.is_empty() {
                self.ingest_implicit_inputs(state, disk, edge_id, &found);
                self.record_deps(state, disk, deps_log, appends, edge_id, &found);
                captured_output = kept_lines.join("\n");
            }
        }

        // 3d: rspfile cleanup.
        if let Some(rspfile_tpl) = &rule.rspfile {
            let rspfile_path = rspfile_tpl.evaluate(&env);
            if !rspfile_path.is_empty() {
                let _ = disk.remove_file(Path::new(&rspfile_path));
            }
        }

        // 3a: restat reclassification, against outputs' pre-run mtimes.
        let restat_applies = rule.restat || state.edge(edge_id).dyndep_restat;
        let mut all_unchanged = restat_applies;
        let output_paths: Vec<NodeId> = state.edge(edge_id).outputs.paths.clone();
        for &out in &output_paths {
            let path_str = state.node(out).path.as_str().to_string();
            let before = in_flight.output_mtimes_before.get(&path_str).copied().flatten();
            let after = disk.stat(Path::new(&path_str)).ok().and_then(|s| match s {
                Stat::Mtime(t) => Some(t),
                Stat::Missing => None,
            });
            if after != before {
                all_unchanged = false;
            }
        }
        let classification = if all_unchanged {
            FinishResult::SucceededButOutputUnchanged
        } else {
            FinishResult::Succeeded
        };

        // 3e: build-log entry, one per output, with the restat-race mitigation:
        // never record a logged mtime earlier than when we observed the
        // command finish, so a coarse filesystem clock can't make a later
        // scan believe this edge is still dirty against its own just-written
        // output.
        let hash = kiln_buildlog::hash_command(&command_line);
        for &out in &output_paths {
            let path_str = state.node(out).path.as_str().to_string();
            let observed = disk
                .stat(Path::new(&path_str))
                .ok()
                .and_then(|s| match s {
                    Stat::Mtime(t) => Some(t),
                    Stat::Missing => None,
                })
                .unwrap_or(result.wall_end_ms);
            let mtime_for_log = observed.max(result.wall_end_ms);
            let line = build_log.record(&path_str, result.wall_start_ms, result.wall_end_ms, mtime_for_log, hash);
            appends.build_log_text.push_str(&line);
        }

        sink.event(&StatusEvent::EdgeFinished {
            edge: edge_id,
            description,
            outcome: CommandOutcome {
                wall_start_ms: result.wall_start_ms,
                wall_end_ms: result.wall_end_ms,
                status: ExitStatus::Success,
                captured_output,
            },
        });

        let outcome = plan.edge_finished(state, edge_id, classification);
        self.propagate(state, disk, build_log, deps_log, plan, outcome);
    }

    /// Loads and applies a dyndep file once its producing edge is already
    /// built (it reaches here only as an order-only input, so scheduling
    /// has already ensured that). A bad or missing file is logged and left
    /// for the edge's own command to fail against, rather than aborting the
    /// whole build here.
    fn apply_dyndep(&self, state: &mut State, disk: &dyn DiskInterface, dyndep_node: NodeId) {
        let path_str = state.node(dyndep_node).path.as_str().to_string();
        let bytes = match disk.read_file(Path::new(&path_str)) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(target: "builder", path = %path_str, error = %err, "could not read dyndep file");
                return;
            }
        };
        let data: kiln_dyndep::DyndepData = match serde_json::from_slice(&bytes) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(target: "builder", path = %path_str, error = %err, "dyndep file unparseable");
                return;
            }
        };
        match kiln_dyndep::apply(&data, dyndep_node, state) {
            Ok(affected) => {
                tracing::debug!(target: "builder", path = %path_str, edges = affected.len(), "dyndep applied");
            }
            Err(err) => {
                tracing::warn!(target: "builder", path = %path_str, error = %err, "dyndep application failed");
            }
        }
    }

    fn ingest_implicit_inputs(&self, state: &mut State, disk: &dyn DiskInterface, edge_id: EdgeId, paths: &[String]) {
        let existing: std::collections::HashSet<NodeId> =
            state.edge(edge_id).inputs.paths.iter().copied().collect();
        for raw in paths {
            let Ok(canon) = kiln_path::CanonicalPath::canonicalize(raw) else {
                continue;
            };
            let node = state.get_or_add_node(canon);
            if existing.contains(&node) {
                continue;
            }
            state.node_mut(node).generated_by_dep_loader = true;
            state.ensure_phony_producer(node, self.phony_rule);
            if !state.node(node).mtime.is_known() {
                let path_str = state.node(node).path.as_str().to_string();
                if let Ok(stat) = disk.stat(Path::new(&path_str)) {
                    state.node_mut(node).mtime = match stat {
                        Stat::Missing => kiln_graph::MtimeState::Missing,
                        Stat::Mtime(t) => kiln_graph::MtimeState::Timestamp(t),
                    };
                }
            }
            state.edge_mut(edge_id).inputs.push_implicit(node);
            state.node_mut(node).out_edges.push(edge_id);
        }
    }

    fn record_deps(
        &self,
        state: &State,
        disk: &dyn DiskInterface,
        deps_log: &mut DepsLog,
        appends: &mut LogAppends,
        edge_id: EdgeId,
        paths: &[String],
    ) {
        let Some(&primary) = state.edge(edge_id).outputs.explicit().first() else {
            return;
        };
        let primary_path = state.node(primary).path.as_str().to_string();
        let mtime = disk
            .stat(Path::new(&primary_path))
            .ok()
            .and_then(|s| match s {
                Stat::Mtime(t) => Some(t),
                Stat::Missing => None,
            })
            .unwrap_or(0);
        let bytes = deps_log.record(&primary_path, mtime, paths);
        appends.deps_log_bytes.extend_from_slice(&bytes);
    }

    /// Resolve [`kiln_plan::Unblocked`] entries into either an admission or a
    /// cancellation: a `NeedsRecheck` consumer gets rescanned against the
    /// current (possibly just-updated) disk state before the plan commits to
    /// running it.
    fn propagate(
        &mut self,
        state: &mut State,
        disk: &dyn DiskInterface,
        build_log: &BuildLog,
        deps_log: &DepsLog,
        plan: &mut Plan,
        outcome: kiln_plan::FinishOutcome,
    ) {
        for unblocked in outcome.unblocked {
            match unblocked.reason {
                UnblockReason::Ready => plan.admit(state, unblocked.edge),
                UnblockReason::NeedsRecheck => {
                    let Some(&primary) = state.edge(unblocked.edge).outputs.paths.first() else {
                        plan.admit(state, unblocked.edge);
                        continue;
                    };
                    // the node's mtime was memoized by the original scan;
                    // force a fresh stat so the recheck sees what the
                    // upstream restat-unchanged edge actually left behind.
                    let non_order_only_inputs: Vec<_> =
                        state.edge(unblocked.edge).inputs.non_order_only().to_vec();
                    for input in non_order_only_inputs {
                        state.node_mut(input).mtime = kiln_graph::MtimeState::Unknown;
                    }
                    state.node_mut(primary).mtime = kiln_graph::MtimeState::Unknown;
                    match kiln_scan::scan(
                        state,
                        primary,
                        self.phony_rule,
                        disk,
                        build_log,
                        deps_log,
                    ) {
                        Ok(rescan) if rescan.dirty => plan.admit(state, unblocked.edge),
                        Ok(_) => {
                            tracing::debug!(target: "builder", edge = unblocked.edge.0, "recheck found no remaining work");
                            for cancelled in plan.cancel_edge(unblocked.edge) {
                                tracing::debug!(target: "builder", edge = cancelled.0, "cancelled after recheck");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(target: "builder", edge = unblocked.edge.0, error = %err, "recheck failed, admitting conservatively");
                            plan.admit(state, unblocked.edge);
                        }
                    }
                }
            }
        }
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
