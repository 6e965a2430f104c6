//! The scheduler core: want-set, ready-set, pool admission, and the
//! finished-edge propagation that keeps them consistent.
//!
//! `Plan` deliberately knows nothing about disk, processes, or even dirty
//! *computation* — it only reads the `dirty` flag and `critical_path_weight`
//! that [`kiln_scan`] already wrote onto `State`. That split keeps this
//! crate a pure graph-topology scheduler, the same way the teacher keeps
//! `core-state`'s buffer/undo bookkeeping free of any rendering concerns.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use kiln_graph::{EdgeId, MtimeState, NodeId, State};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("'{0}' missing and no known rule to make it")]
    MissingLeaf(String),
    #[error("cannot make progress due to previous errors")]
    CannotMakeProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WantState {
    ToStart,
    ToFinish,
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishResult {
    Succeeded,
    Failed,
    SucceededButOutputUnchanged,
}

/// Why an edge's blocking producers just finished. `Ready` means it's safe to
/// hand straight to the scheduler; `NeedsRecheck` means a producer finished
/// via [`FinishResult::SucceededButOutputUnchanged`] (or was itself
/// cancelled this way) and the caller must re-run dirtiness analysis before
/// deciding whether to run or [`Plan::cancel_edge`] this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockReason {
    Ready,
    NeedsRecheck,
}

#[derive(Debug, Clone, Copy)]
pub struct Unblocked {
    pub edge: EdgeId,
    pub reason: UnblockReason,
}

#[derive(Debug, Default)]
pub struct FinishOutcome {
    pub unblocked: Vec<Unblocked>,
    pub cancelled: Vec<EdgeId>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct ReadyItem {
    weight: i64,
    insertion: u64,
    edge: EdgeId,
}

impl Ord for ReadyItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on weight; among ties, the earlier insertion pops first.
        self.weight
            .cmp(&other.weight)
            .then_with(|| other.insertion.cmp(&self.insertion))
    }
}

impl PartialOrd for ReadyItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Plan {
    want: HashMap<EdgeId, WantState>,
    pending_deps: HashMap<EdgeId, usize>,
    waiters: HashMap<EdgeId, Vec<EdgeId>>,
    recheck_flags: HashMap<EdgeId, bool>,
    ready: BinaryHeap<ReadyItem>,
    next_insertion: u64,
    failures: usize,
    failures_allowed: usize,
    command_edge_count: usize,
}

impl Plan {
    pub fn new(failures_allowed: usize) -> Self {
        Plan {
            want: HashMap::new(),
            pending_deps: HashMap::new(),
            waiters: HashMap::new(),
            recheck_flags: HashMap::new(),
            ready: BinaryHeap::new(),
            next_insertion: 0,
            failures: 0,
            failures_allowed: failures_allowed.max(1),
            command_edge_count: 0,
        }
    }

    pub fn command_edge_count(&self) -> usize {
        self.command_edge_count
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn has_failed_out(&self) -> bool {
        self.failures >= self.failures_allowed
    }

    /// Adds `node`'s producing edge, and transitively its input edges, to
    /// `want`, skipping subtrees whose output is already clean. Returns
    /// whether any work was added.
    pub fn add_target(&mut self, state: &State, node: NodeId) -> Result<bool, PlanError> {
        let edge_id = match state.node(node).in_edge {
            None => {
                if matches!(state.node(node).mtime, MtimeState::Missing) {
                    return Err(PlanError::MissingLeaf(
                        state.node(node).path.as_str().to_string(),
                    ));
                }
                return Ok(false);
            }
            Some(e) => e,
        };

        if self.want.contains_key(&edge_id) {
            return Ok(true);
        }
        if !state.node(node).dirty {
            return Ok(false);
        }

        self.want.insert(edge_id, WantState::ToStart);
        if !state.edge(edge_id).is_phony {
            self.command_edge_count += 1;
        }

        let mut blockers: HashSet<EdgeId> = HashSet::new();
        for &input in &state.edge(edge_id).inputs.paths {
            let added = self.add_target(state, input)?;
            if added {
                if let Some(producer) = state.node(input).in_edge {
                    if !matches!(self.want.get(&producer), None | Some(WantState::Nothing)) {
                        blockers.insert(producer);
                    }
                }
            }
        }

        self.pending_deps.insert(edge_id, blockers.len());
        for producer in blockers {
            self.waiters.entry(producer).or_default().push(edge_id);
        }
        Ok(true)
    }

    /// Seeds `ready` with every wanted edge whose producers are already
    /// resolved.
    pub fn prepare_queue(&mut self, state: &State) {
        let edges: Vec<EdgeId> = self
            .want
            .iter()
            .filter(|(_, w)| **w != WantState::Nothing)
            .map(|(e, _)| *e)
            .collect();
        for edge_id in edges {
            if self.pending_deps.get(&edge_id).copied().unwrap_or(0) == 0 {
                self.push_ready(state, edge_id);
            }
        }
    }

    fn push_ready(&mut self, state: &State, edge_id: EdgeId) {
        self.pending_deps.remove(&edge_id);
        let weight = state.edge(edge_id).critical_path_weight;
        let insertion = self.next_insertion;
        self.next_insertion += 1;
        self.ready.push(ReadyItem {
            weight,
            insertion,
            edge: edge_id,
        });
    }

    /// Directly admits an edge the caller has decided is ready (used after
    /// resolving an [`UnblockReason::NeedsRecheck`] edge as still dirty).
    pub fn admit(&mut self, state: &State, edge_id: EdgeId) {
        self.push_ready(state, edge_id);
    }

    /// Pops the highest-priority ready edge whose pool can admit it, parking
    /// any it skips along the way. `None` once `ready` is empty.
    pub fn find_work(&mut self, state: &mut State) -> Option<EdgeId> {
        loop {
            let item = self.ready.pop()?;
            match self.want.get(&item.edge) {
                None | Some(WantState::Nothing) => continue,
                _ => {}
            }
            let pool_id = state.edge(item.edge).pool;
            if state.pool(pool_id).can_admit(1) {
                state.pool_mut(pool_id).current_use += 1;
                self.want.insert(item.edge, WantState::ToFinish);
                return Some(item.edge);
            }
            state.pool_mut(pool_id).delayed.push(item.edge);
        }
    }

    pub fn more_to_do(&self) -> bool {
        self.want.values().any(|w| *w != WantState::Nothing)
    }

    /// Cancel `edge_id` and cascade to every consumer whose last remaining
    /// blocker was this edge. Used both for hard failures and for
    /// restat-unchanged edges a caller determined are no longer needed.
    pub fn cancel_edge(&mut self, edge_id: EdgeId) -> Vec<EdgeId> {
        let mut cancelled = Vec::new();
        let mut stack = vec![edge_id];
        while let Some(edge) = stack.pop() {
            match self.want.get_mut(&edge) {
                Some(slot) if *slot != WantState::Nothing => *slot = WantState::Nothing,
                _ => continue,
            }
            cancelled.push(edge);
            if let Some(waiters) = self.waiters.remove(&edge) {
                for waiter in waiters {
                    if let Some(p) = self.pending_deps.get_mut(&waiter) {
                        *p = p.saturating_sub(1);
                        if *p == 0 {
                            stack.push(waiter);
                        }
                    }
                }
            }
        }
        cancelled
    }

    fn unblock_waiters(&mut self, edge_id: EdgeId, reason: UnblockReason) -> Vec<Unblocked> {
        let mut result = Vec::new();
        let Some(waiters) = self.waiters.remove(&edge_id) else {
            return result;
        };
        if reason == UnblockReason::NeedsRecheck {
            for &waiter in &waiters {
                self.recheck_flags.insert(waiter, true);
            }
        }
        for waiter in waiters {
            if let Some(p) = self.pending_deps.get_mut(&waiter) {
                *p = p.saturating_sub(1);
                if *p == 0 {
                    let tainted = self.recheck_flags.remove(&waiter).unwrap_or(false);
                    result.push(Unblocked {
                        edge: waiter,
                        reason: if tainted {
                            UnblockReason::NeedsRecheck
                        } else {
                            UnblockReason::Ready
                        },
                    });
                }
            }
        }
        result
    }

    /// Releases `edge_id`'s pool slot, removes it from `want`, and
    /// propagates the result to its consumers.
    pub fn edge_finished(
        &mut self,
        state: &mut State,
        edge_id: EdgeId,
        result: FinishResult,
    ) -> FinishOutcome {
        let pool_id = state.edge(edge_id).pool;
        if state.pool(pool_id).current_use > 0 {
            state.pool_mut(pool_id).current_use -= 1;
        }

        let delayed = std::mem::take(&mut state.pool_mut(pool_id).delayed);
        for waiting_edge in delayed {
            self.push_ready(state, waiting_edge);
        }

        match result {
            FinishResult::Failed => {
                self.failures += 1;
                tracing::warn!(target: "plan", edge = edge_id.0, failures = self.failures, "edge failed");
                // cancel_edge both removes edge_id from `want` and cascades
                // to its waiters; it must run before anything else drops
                // edge_id's entry, or the cascade has nothing to walk from.
                FinishOutcome {
                    unblocked: Vec::new(),
                    cancelled: self.cancel_edge(edge_id),
                }
            }
            FinishResult::Succeeded => {
                self.want.remove(&edge_id);
                FinishOutcome {
                    unblocked: self.unblock_waiters(edge_id, UnblockReason::Ready),
                    cancelled: Vec::new(),
                }
            }
            FinishResult::SucceededButOutputUnchanged => {
                self.want.remove(&edge_id);
                FinishOutcome {
                    unblocked: self.unblock_waiters(edge_id, UnblockReason::NeedsRecheck),
                    cancelled: Vec::new(),
                }
            }
        }
    }

    /// True when there is nothing left in `ready` or running, yet `want`
    /// still holds edges that aren't `Nothing` — the "blocked by previous
    /// errors" terminal state.
    pub fn check_progress(&self) -> Result<(), PlanError> {
        let stuck = self
            .want
            .values()
            .any(|w| *w != WantState::Nothing) && self.ready.is_empty();
        if stuck && self.failures > 0 {
            return Err(PlanError::CannotMakeProgress);
        }
        Ok(())
    }
}
