//! Build status events and the sink that receives them.
//!
//! A [`StatusSink`] is a pure observer: it never influences scheduling, it
//! just gets told what already happened. [`LineSink`] renders one `tracing`
//! event per status update (the same "events are logged, never printed
//! directly" split the teacher uses between its event types and its render
//! layer); [`NullSink`] is for tests that don't care.

use kiln_graph::EdgeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub wall_start_ms: i64,
    pub wall_end_ms: i64,
    pub status: ExitStatus,
    pub captured_output: String,
}

#[derive(Debug, Clone)]
pub enum StatusEvent {
    BuildStarted,
    PlanHasTotalEdges(usize),
    EdgeStarted {
        edge: EdgeId,
        description: String,
        wall_ms: i64,
    },
    EdgeFinished {
        edge: EdgeId,
        description: String,
        outcome: CommandOutcome,
    },
    BuildFinished,
}

/// Receives build progress. Implementations must not block the caller for
/// long: the builder's single loop calls this synchronously between every
/// scheduling decision.
pub trait StatusSink: Send {
    fn event(&self, event: &StatusEvent);
    fn warning(&self, message: &str);
}

/// Discards everything. Used by tests and by callers that want a silent run.
pub struct NullSink;

impl StatusSink for NullSink {
    fn event(&self, _event: &StatusEvent) {}
    fn warning(&self, _message: &str) {}
}

/// One `tracing` line per event, at the `events` target.
pub struct LineSink;

impl StatusSink for LineSink {
    fn event(&self, event: &StatusEvent) {
        match event {
            StatusEvent::BuildStarted => {
                tracing::info!(target: "events", "build started");
            }
            StatusEvent::PlanHasTotalEdges(n) => {
                tracing::info!(target: "events", total_edges = n, "plan ready");
            }
            StatusEvent::EdgeStarted {
                edge,
                description,
                wall_ms,
            } => {
                tracing::info!(target: "events", edge = edge.0, wall_ms, "{description}");
            }
            StatusEvent::EdgeFinished {
                edge,
                description,
                outcome,
            } => match outcome.status {
                ExitStatus::Success => {
                    tracing::info!(
                        target: "events",
                        edge = edge.0,
                        duration_ms = outcome.wall_end_ms - outcome.wall_start_ms,
                        "{description}"
                    );
                }
                ExitStatus::Failure => {
                    tracing::error!(
                        target: "events",
                        edge = edge.0,
                        "FAILED: {description}\n{}",
                        outcome.captured_output
                    );
                }
                ExitStatus::Interrupted => {
                    tracing::warn!(target: "events", edge = edge.0, "interrupted: {description}");
                }
            },
            StatusEvent::BuildFinished => {
                tracing::info!(target: "events", "build finished");
            }
        }
    }

    fn warning(&self, message: &str) {
        tracing::warn!(target: "events", "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_accepts_every_event_variant() {
        let sink = NullSink;
        sink.event(&StatusEvent::BuildStarted);
        sink.event(&StatusEvent::PlanHasTotalEdges(3));
        sink.event(&StatusEvent::EdgeStarted {
            edge: EdgeId(0),
            description: "cc main.c".into(),
            wall_ms: 0,
        });
        sink.event(&StatusEvent::EdgeFinished {
            edge: EdgeId(0),
            description: "cc main.c".into(),
            outcome: CommandOutcome {
                wall_start_ms: 0,
                wall_end_ms: 10,
                status: ExitStatus::Success,
                captured_output: String::new(),
            },
        });
        sink.event(&StatusEvent::BuildFinished);
        sink.warning("log write failed");
    }

    #[test]
    fn line_sink_does_not_panic_on_failure_events() {
        let sink = LineSink;
        sink.event(&StatusEvent::EdgeFinished {
            edge: EdgeId(1),
            description: "cc broken.c".into(),
            outcome: CommandOutcome {
                wall_start_ms: 0,
                wall_end_ms: 1,
                status: ExitStatus::Failure,
                captured_output: "error: unknown type".into(),
            },
        });
    }
}
