#![allow(dead_code)] // shared across several scenario files; each uses a subset.

use std::collections::{HashMap as Map, VecDeque};
use std::path::Path;

use kiln_fs::{DiskInterface, FakeDisk};
use kiln_manifest::{EdgeDecl, RuleDecl};
use kiln_runner::{CommandResult, CommandRunner, CommandSpec, ExitKind, RunnerError};
use kiln_graph::EdgeId;

pub fn rule(name: &str, command: &str) -> RuleDecl {
    RuleDecl {
        name: name.to_string(),
        bindings: Map::from([("command".to_string(), command.to_string())]),
    }
}

pub fn edge(rule: &str, outputs: &[&str], inputs: &[&str]) -> EdgeDecl {
    EdgeDecl {
        rule: rule.to_string(),
        explicit_outputs: outputs.iter().map(|s| s.to_string()).collect(),
        explicit_inputs: inputs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

pub fn edge_in_pool(rule: &str, outputs: &[&str], inputs: &[&str], pool: &str) -> EdgeDecl {
    let mut e = edge(rule, outputs, inputs);
    e.bindings.insert("pool".to_string(), pool.to_string());
    e
}

pub fn never_interrupted() -> bool {
    false
}

/// A deterministic stand-in for `SubprocessRunner` that performs each
/// command's effect directly against the same `FakeDisk` the build itself
/// sees, rather than spawning a real shell. The synthetic commands these
/// scenarios use (`cat`, `cp`, `touch`, `true`, `false`) have no real binary
/// on a test runner worth depending on.
pub struct FakeRunner<'d> {
    disk: &'d FakeDisk,
    capacity: usize,
    queue: VecDeque<CommandResult>,
    active: usize,
    pub commands_started: usize,
    pub max_active: usize,
}

impl<'d> FakeRunner<'d> {
    pub fn new(disk: &'d FakeDisk, capacity: usize) -> Self {
        FakeRunner {
            disk,
            capacity,
            queue: VecDeque::new(),
            active: 0,
            commands_started: 0,
            max_active: 0,
        }
    }

    fn run_effect(&self, command_line: &str) -> bool {
        let parts: Vec<&str> = command_line.split_whitespace().collect();
        match parts.first().copied() {
            Some("cat") => {
                // `cat a b > out`
                let gt = parts.iter().position(|p| *p == ">").unwrap();
                let mut contents = Vec::new();
                for src in &parts[1..gt] {
                    if let Ok(bytes) = self.disk.read_file(Path::new(src)) {
                        contents.extend(bytes);
                    }
                }
                self.disk.write_file(Path::new(parts[gt + 1]), &contents[..]).unwrap();
                true
            }
            Some("cp") => {
                let bytes = self.disk.read_file(Path::new(parts[1])).unwrap_or_default();
                self.disk.write_file(Path::new(parts[2]), &bytes[..]).unwrap();
                true
            }
            Some("touch") => {
                self.disk.touch(Path::new(parts[1]));
                true
            }
            Some("true") => true,
            Some("false") => false,
            _ => true,
        }
    }
}

impl<'d> CommandRunner for FakeRunner<'d> {
    fn can_run_more(&self) -> usize {
        self.capacity.saturating_sub(self.active)
    }

    fn start_command(&mut self, spec: CommandSpec) -> Result<(), RunnerError> {
        self.active += 1;
        self.commands_started += 1;
        self.max_active = self.max_active.max(self.active);
        // Every started command consumes a tick, win or lose, so the fake
        // clock reflects elapsed build time rather than only file writes —
        // a restat edge whose command is a no-op still needs its build-log
        // entry stamped later than whatever woke it.
        let wall_start_ms = self.disk.now();
        let wall_end_ms = self.disk.tick();
        let ok = self.run_effect(&spec.command_line);
        self.queue.push_back(CommandResult {
            edge: spec.edge,
            status: if ok { ExitKind::Success } else { ExitKind::Failure },
            captured_output: String::new(),
            wall_start_ms,
            wall_end_ms,
        });
        Ok(())
    }

    fn wait_for_command(&mut self) -> Option<CommandResult> {
        let r = self.queue.pop_front();
        if r.is_some() {
            self.active -= 1;
        }
        r
    }

    fn get_active_edges(&self) -> Vec<EdgeId> {
        Vec::new()
    }

    fn abort(&mut self) {}
}

pub fn queue_is_empty(runner: &FakeRunner<'_>) -> bool {
    runner.queue.is_empty()
}
