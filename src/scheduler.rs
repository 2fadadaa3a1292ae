//! Ready-queue scheduler: stage barriers, dependency readiness, and status
//! transitions for a single run (spec §4.4, §4.6 state machine).

use std::collections::{HashMap, HashSet, VecDeque};

use crate::graph::{Graph, TaskStatus};
use crate::model::TaskId;
use crate::stale::Classification;

/// Outcome of a single task execution, fed back into `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed,
}

pub struct Scheduler {
    status: HashMap<TaskId, TaskStatus>,
    pending_predecessors: HashMap<TaskId, usize>,
    /// FIFO per stage, popped in stage-ascending order.
    ready_queues: HashMap<usize, VecDeque<TaskId>>,
    active_stage: usize,
    failed_origin: HashMap<TaskId, TaskId>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            status: HashMap::new(),
            pending_predecessors: HashMap::new(),
            ready_queues: HashMap::new(),
            active_stage: 0,
            failed_origin: HashMap::new(),
        }
    }

    pub fn status(&self, task: TaskId) -> TaskStatus {
        self.status.get(&task).copied().unwrap_or(TaskStatus::Skipped)
    }

    /// Seed the scheduler from a stale-analysis result: `MustRun` tasks
    /// become `Pending` with a predecessor count equal to the number of
    /// their `MustRun` predecessors; everything else is `Skipped`.
    pub fn seed(&mut self, graph: &Graph, classification: &HashMap<TaskId, Classification>) {
        self.status.clear();
        self.pending_predecessors.clear();
        self.ready_queues.clear();
        self.active_stage = 0;
        self.failed_origin.clear();

        for &task_id in graph.topological_order() {
            let must_run = classification.get(&task_id) == Some(&Classification::MustRun);
            if !must_run {
                self.status.insert(task_id, TaskStatus::Skipped);
                continue;
            }
            let pred_count = graph
                .predecessors(task_id)
                .iter()
                .filter(|p| classification.get(p) == Some(&Classification::MustRun))
                .count();
            if pred_count == 0 {
                self.mark_ready(graph, task_id);
            } else {
                self.status.insert(task_id, TaskStatus::Pending);
                self.pending_predecessors.insert(task_id, pred_count);
            }
        }
    }

    fn mark_ready(&mut self, graph: &Graph, task_id: TaskId) {
        self.status.insert(task_id, TaskStatus::Ready);
        let stage = graph.stage_of(task_id);
        self.ready_queues.entry(stage).or_default().push_back(task_id);
    }

    /// Pop the head of the ready queue iff its stage is the (or below the)
    /// current active stage, and every task of the preceding stage has
    /// terminated (spec §4.4 stage gating: stronger than pure dependency
    /// order — stages are barriers).
    pub fn next_ready(&mut self, graph: &Graph) -> Option<TaskId> {
        self.advance_active_stage(graph);
        let queue = self.ready_queues.get_mut(&self.active_stage)?;
        let task_id = queue.pop_front()?;
        self.status.insert(task_id, TaskStatus::Running);
        Some(task_id)
    }

    fn advance_active_stage(&mut self, graph: &Graph) {
        loop {
            let blocked = self.status.iter().any(|(&t, &s)| {
                graph.stage_of(t) <= self.active_stage
                    && matches!(s, TaskStatus::Pending | TaskStatus::Running)
            });
            if blocked {
                return;
            }
            let has_ready_at_current = self
                .ready_queues
                .get(&self.active_stage)
                .map(|q| !q.is_empty())
                .unwrap_or(false);
            if has_ready_at_current {
                return;
            }
            let next_stage = self
                .ready_queues
                .keys()
                .copied()
                .filter(|&s| s > self.active_stage)
                .min();
            match next_stage {
                Some(s) => self.active_stage = s,
                None => return,
            }
        }
    }

    /// Record a task's terminal outcome. On `Done`, successors whose
    /// predecessor count reaches zero become `Ready`. On `Failed`, every
    /// transitive successor is cascaded to `Failed`; the returned list
    /// names exactly those cascaded successors (not `task_id` itself), for
    /// the caller to log one record per cascaded task (spec §7).
    pub fn complete(&mut self, graph: &Graph, task_id: TaskId, outcome: Outcome) -> Vec<TaskId> {
        match outcome {
            Outcome::Done => {
                self.status.insert(task_id, TaskStatus::Done);
                for &succ in graph.successors(task_id) {
                    if let Some(count) = self.pending_predecessors.get_mut(&succ) {
                        *count -= 1;
                        if *count == 0 {
                            self.pending_predecessors.remove(&succ);
                            self.mark_ready(graph, succ);
                        }
                    }
                }
                Vec::new()
            }
            Outcome::Failed => {
                self.status.insert(task_id, TaskStatus::Failed);
                let mut cascaded = Vec::new();
                self.cascade_failure(graph, task_id, task_id, &mut cascaded);
                cascaded
            }
        }
    }

    fn cascade_failure(&mut self, graph: &Graph, origin: TaskId, from: TaskId, cascaded: &mut Vec<TaskId>) {
        for &succ in graph.successors(from) {
            match self.status.get(&succ) {
                Some(TaskStatus::Pending) | Some(TaskStatus::Ready) => {
                    self.status.insert(succ, TaskStatus::Failed);
                    self.pending_predecessors.remove(&succ);
                    self.remove_from_ready_queue(graph, succ);
                    self.failed_origin.insert(succ, origin);
                    cascaded.push(succ);
                    self.cascade_failure(graph, origin, succ, cascaded);
                }
                _ => {}
            }
        }
    }

    fn remove_from_ready_queue(&mut self, graph: &Graph, task_id: TaskId) {
        let stage = graph.stage_of(task_id);
        if let Some(q) = self.ready_queues.get_mut(&stage) {
            q.retain(|&t| t != task_id);
        }
    }

    /// The task whose failure cascaded onto `task_id`, if any.
    pub fn failure_origin(&self, task_id: TaskId) -> Option<TaskId> {
        self.failed_origin.get(&task_id).copied()
    }

    /// Force a task directly into `Running`, bypassing the ready queue.
    /// Used by a graph rebuild to carry over a task whose identity
    /// survived into the new graph (spec §4.6 point 3).
    pub fn force_running(&mut self, graph: &Graph, task_id: TaskId) {
        self.pending_predecessors.remove(&task_id);
        self.remove_from_ready_queue(graph, task_id);
        self.status.insert(task_id, TaskStatus::Running);
    }

    /// Re-enter a cancelled `Running` task as `Pending` with a fresh
    /// predecessor count (spec §4.6: `Running --(cancel)--> Pending`).
    pub fn cancel(&mut self, graph: &Graph, task_id: TaskId) {
        let pred_count = graph
            .predecessors(task_id)
            .iter()
            .filter(|&&p| self.status(p) != TaskStatus::Done && self.status(p) != TaskStatus::Skipped)
            .count();
        if pred_count == 0 {
            self.mark_ready(graph, task_id);
        } else {
            self.status.insert(task_id, TaskStatus::Pending);
            self.pending_predecessors.insert(task_id, pred_count);
        }
    }

    /// A file this task depends on (directly or transitively) just
    /// changed. Re-enter the task into the scheduler so it runs again.
    /// Returns `true` if the task was `Running` and the caller must
    /// actually cancel the in-flight worker (spec §4.6 fs-event handling).
    pub fn invalidate(&mut self, graph: &Graph, task_id: TaskId) -> bool {
        match self.status(task_id) {
            TaskStatus::Running => true,
            TaskStatus::Pending | TaskStatus::Ready => false,
            TaskStatus::Done | TaskStatus::Skipped | TaskStatus::Failed => {
                self.failed_origin.remove(&task_id);
                self.cancel(graph, task_id);
                false
            }
        }
    }

    pub fn drained(&self) -> bool {
        !self.status.values().any(|s| {
            matches!(s, TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Running)
        })
    }

    pub fn any_failed(&self) -> bool {
        self.status.values().any(|&s| s == TaskStatus::Failed)
    }

    pub fn all_statuses(&self) -> &HashMap<TaskId, TaskStatus> {
        &self.status
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
