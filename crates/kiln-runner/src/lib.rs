//! Bounded parallel subprocess pool.
//!
//! One dedicated OS thread per spawned child: its only job is to drain the
//! child's captured output and call `Child::wait()`, then hand a single
//! [`CommandResult`] to the Builder's loop over a bounded
//! [`crossbeam_channel`]. `wait_for_command` is therefore exactly one
//! `recv()` — the same "blocking work happens off the main loop, behind a
//! channel" split the teacher uses for its input thread.

use std::collections::HashMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender};
use kiln_graph::EdgeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn command for edge {edge:?}: {source}")]
    Spawn {
        edge: EdgeId,
        #[source]
        source: std::io::Error,
    },
    #[error("console pool is already occupied")]
    ConsoleBusy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Failure,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub edge: EdgeId,
    pub status: ExitKind,
    pub captured_output: String,
    pub wall_start_ms: i64,
    pub wall_end_ms: i64,
}

/// What the Builder hands the runner: a fully evaluated shell command, ready
/// to execute, plus enough identity to report back against.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub edge: EdgeId,
    pub command_line: String,
    pub console: bool,
}

/// An opaque permission slot handed out by a jobserver. Dropping it without
/// calling [`JobserverClient::release`] leaks the slot for the session —
/// callers must release explicitly, mirroring the external protocol's
/// pipe-token contract.
#[derive(Debug, Clone, Copy)]
pub struct Token(u64);

/// Seam for GNU make-style jobserver integration (spec treats the wire
/// protocol as an opaque external collaborator; this crate only defines the
/// shape a real implementation would fill in).
pub trait JobserverClient: Send {
    fn try_acquire(&self) -> Option<Token>;
    fn release(&self, token: Token);
}

/// No external jobserver: every acquisition succeeds immediately.
pub struct NullJobserver;

impl JobserverClient for NullJobserver {
    fn try_acquire(&self) -> Option<Token> {
        Some(Token(0))
    }
    fn release(&self, _token: Token) {}
}

/// Capability trait the Builder drives. The fake runner used in Builder
/// tests and [`SubprocessRunner`] are the only two implementations.
pub trait CommandRunner {
    fn can_run_more(&self) -> usize;
    fn start_command(&mut self, spec: CommandSpec) -> Result<(), RunnerError>;
    /// Blocks until at least one child finishes or [`CommandRunner::abort`]
    /// has drained everything outstanding. `None` means there is nothing
    /// left to wait for.
    fn wait_for_command(&mut self) -> Option<CommandResult>;
    fn get_active_edges(&self) -> Vec<EdgeId>;
    fn abort(&mut self);
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct ActiveChild {
    pid: u32,
    console: bool,
    /// `None` for the one implicit slot every runner already holds without
    /// drawing from the jobserver pool; `Some` for every command admitted
    /// on top of it, which must acquire (and later release) a real token.
    token: Option<Token>,
}

/// Real, `std::process`-backed runner. One OS thread per child.
pub struct SubprocessRunner {
    capacity: usize,
    jobserver: Box<dyn JobserverClient>,
    active: HashMap<EdgeId, ActiveChild>,
    console_busy: bool,
    aborted: Arc<AtomicBool>,
    tx: Sender<CommandResult>,
    rx: Receiver<CommandResult>,
}

impl SubprocessRunner {
    pub fn new(capacity: usize) -> Self {
        Self::with_jobserver(capacity, Box::new(NullJobserver))
    }

    pub fn with_jobserver(capacity: usize, jobserver: Box<dyn JobserverClient>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        SubprocessRunner {
            capacity: capacity.max(1),
            jobserver,
            active: HashMap::new(),
            console_busy: false,
            aborted: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
        }
    }
}

impl CommandRunner for SubprocessRunner {
    fn can_run_more(&self) -> usize {
        if self.aborted.load(Ordering::SeqCst) {
            return 0;
        }
        self.capacity.saturating_sub(self.active.len())
    }

    fn start_command(&mut self, spec: CommandSpec) -> Result<(), RunnerError> {
        if spec.console && self.console_busy {
            return Err(RunnerError::ConsoleBusy);
        }
        // The first concurrently-running command occupies the slot this
        // runner is already entitled to (the implicit token every jobserver
        // participant holds without reading it off the pipe); only a
        // command admitted alongside already-active work draws a real one.
        let token = if self.active.is_empty() {
            None
        } else {
            let Some(token) = self.jobserver.try_acquire() else {
                return Err(RunnerError::ConsoleBusy);
            };
            Some(token)
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&spec.command_line);
        if spec.console {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            #[cfg(unix)]
            {
                use std::os::unix::process::CommandExt;
                cmd.process_group(0);
            }
        }

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            edge: spec.edge,
            source,
        })?;
        let pid = child.id();
        self.active.insert(
            spec.edge,
            ActiveChild {
                pid,
                console: spec.console,
                token,
            },
        );
        if spec.console {
            self.console_busy = true;
        }

        let edge = spec.edge;
        let console = spec.console;
        let tx = self.tx.clone();
        let aborted = self.aborted.clone();
        let wall_start_ms = now_ms();

        thread::spawn(move || {
            let captured_output = if console {
                String::new()
            } else {
                let mut buf = Vec::new();
                if let Some(mut out) = child.stdout.take() {
                    let _ = out.read_to_end(&mut buf);
                }
                if let Some(mut err) = child.stderr.take() {
                    let _ = err.read_to_end(&mut buf);
                }
                String::from_utf8_lossy(&buf).into_owned()
            };
            let wait_result = child.wait();
            let wall_end_ms = now_ms();
            let status = match wait_result {
                Ok(s) if s.success() => ExitKind::Success,
                _ if aborted.load(Ordering::SeqCst) => ExitKind::Interrupted,
                _ => ExitKind::Failure,
            };
            let _ = tx.send(CommandResult {
                edge,
                status,
                captured_output,
                wall_start_ms,
                wall_end_ms,
            });
        });

        Ok(())
    }

    fn wait_for_command(&mut self) -> Option<CommandResult> {
        if self.active.is_empty() {
            return None;
        }
        let result = self.rx.recv().ok()?;
        if let Some(child) = self.active.remove(&result.edge) {
            if child.console {
                self.console_busy = false;
            }
            if let Some(token) = child.token {
                self.jobserver.release(token);
            }
        }
        tracing::debug!(target: "runner", edge = result.edge.0, status = ?result.status, "command finished");
        Some(result)
    }

    fn get_active_edges(&self) -> Vec<EdgeId> {
        self.active.keys().copied().collect()
    }

    fn abort(&mut self) {
        self.aborted.store(true, Ordering::SeqCst);
        for child in self.active.values() {
            send_terminate(child);
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &ActiveChild) {
    let target = if child.console {
        child.pid as i32
    } else {
        // a non-console child runs as its own process-group leader
        // (`process_group(0)`), so its pgid equals its pid; negating the pid
        // targets the whole group instead of just the leader.
        -(child.pid as i32)
    };
    unsafe {
        libc::kill(target, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &ActiveChild) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(edge: u32, command: &str) -> CommandSpec {
        CommandSpec {
            edge: EdgeId(edge),
            command_line: command.to_string(),
            console: false,
        }
    }

    #[test]
    fn runs_a_successful_command_and_reports_success() {
        let mut runner = SubprocessRunner::new(2);
        runner.start_command(spec(0, "exit 0")).unwrap();
        let result = runner.wait_for_command().unwrap();
        assert_eq!(result.edge, EdgeId(0));
        assert_eq!(result.status, ExitKind::Success);
    }

    #[test]
    fn failing_command_reports_failure() {
        let mut runner = SubprocessRunner::new(1);
        runner.start_command(spec(1, "exit 7")).unwrap();
        let result = runner.wait_for_command().unwrap();
        assert_eq!(result.status, ExitKind::Failure);
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let mut runner = SubprocessRunner::new(1);
        runner
            .start_command(spec(2, "echo out; echo err 1>&2"))
            .unwrap();
        let result = runner.wait_for_command().unwrap();
        assert!(result.captured_output.contains("out"));
        assert!(result.captured_output.contains("err"));
    }

    #[test]
    fn can_run_more_tracks_active_count() {
        let mut runner = SubprocessRunner::new(2);
        assert_eq!(runner.can_run_more(), 2);
        runner.start_command(spec(3, "sleep 0.2")).unwrap();
        assert_eq!(runner.can_run_more(), 1);
        runner.wait_for_command();
        assert_eq!(runner.can_run_more(), 2);
    }

    #[test]
    fn console_pool_rejects_a_second_concurrent_console_command() {
        let mut runner = SubprocessRunner::new(2);
        runner
            .start_command(CommandSpec {
                edge: EdgeId(4),
                command_line: "sleep 0.2".into(),
                console: true,
            })
            .unwrap();
        let err = runner
            .start_command(CommandSpec {
                edge: EdgeId(5),
                command_line: "exit 0".into(),
                console: true,
            })
            .unwrap_err();
        assert!(matches!(err, RunnerError::ConsoleBusy));
        runner.wait_for_command();
    }

    #[test]
    fn abort_marks_in_flight_commands_interrupted() {
        let mut runner = SubprocessRunner::new(1);
        runner.start_command(spec(6, "sleep 1")).unwrap();
        runner.abort();
        let result = runner.wait_for_command().unwrap();
        assert_eq!(result.status, ExitKind::Interrupted);
    }

    #[test]
    fn wait_for_command_returns_none_with_nothing_active() {
        let mut runner = SubprocessRunner::new(1);
        assert!(runner.wait_for_command().is_none());
    }

    #[test]
    fn null_jobserver_always_grants_a_token() {
        let js = NullJobserver;
        assert!(js.try_acquire().is_some());
    }

    struct DenyingJobserver;
    impl JobserverClient for DenyingJobserver {
        fn try_acquire(&self) -> Option<Token> {
            None
        }
        fn release(&self, _token: Token) {}
    }

    #[test]
    fn first_concurrent_command_runs_on_the_implicit_slot_without_a_token() {
        let mut runner = SubprocessRunner::with_jobserver(4, Box::new(DenyingJobserver));
        // With no jobserver tokens available at all, only the implicit slot
        // is usable: the first command must still be admitted.
        runner.start_command(spec(0, "exit 0")).unwrap();
        let err = runner.start_command(spec(1, "exit 0")).unwrap_err();
        assert!(matches!(err, RunnerError::ConsoleBusy));
        runner.wait_for_command();
    }
}
