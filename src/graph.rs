//! Bipartite task/file dependency graph (spec §3, §4.1).
//!
//! Nodes are arena-allocated and addressed by integer ID; all
//! cross-references (producer/consumer, implicit edges) are IDs, never
//! owning handles, to sidestep the cyclic-reference problem noted in
//! spec §9.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::LoadError;
use crate::filestat::Stat;
use crate::model::{FileId, Task, TaskId};

#[derive(Debug, Clone, Default)]
pub struct FileNode {
    pub path: PathBuf,
    /// `None` until a task runs and the stat store records it, or until the
    /// filestat store is consulted at startup.
    pub last_observed: Option<Stat>,
    producer: Option<TaskId>,
    consumers: Vec<TaskId>,
}

impl FileNode {
    /// A file not produced by any task — an input owned by the user.
    pub fn is_initial(&self) -> bool {
        self.producer.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Done,
    Skipped,
    Failed,
}

/// A task node's live status lives in `Scheduler`, not here (spec §4.4):
/// the `Graph` is the rebuild-stable structure, the `Scheduler` is the
/// per-run mutable state layered on top of it.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub task: Task,
    inputs: Vec<FileId>,
    outputs: Vec<FileId>,
    predecessors: Vec<TaskId>,
    successors: Vec<TaskId>,
}

/// Normalized agenda input to `Graph::build`: every task's effective
/// command-line inputs/outputs resolved to paths, plus the stage table.
/// Produced by the loader (spec §4.7).
#[derive(Debug, Clone)]
pub struct NormalizedAgenda {
    pub tasks: Vec<Task>,
}

/// Normalized depend input: file -> list of files it depends on.
#[derive(Debug, Clone, Default)]
pub struct NormalizedDepend {
    pub edges: HashMap<PathBuf, Vec<PathBuf>>,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    tasks: Vec<TaskNode>,
    files: Vec<FileNode>,
    path_to_file: HashMap<PathBuf, FileId>,
    /// A -> B meaning "B's freshness depends on A" (from the depend doc).
    implicit_forward: HashMap<FileId, Vec<FileId>>,
    topo: Vec<TaskId>,
}

impl Graph {
    pub fn build(agenda: NormalizedAgenda, depend: NormalizedDepend) -> Result<Graph, LoadError> {
        let mut graph = Graph::default();

        for task in &agenda.tasks {
            for path in task.outputs.iter().chain(task.inputs.iter()) {
                graph.intern_file(path);
            }
        }
        for (from, tos) in &depend.edges {
            graph.intern_file(from);
            for to in tos {
                graph.intern_file(to);
            }
        }

        for task in agenda.tasks {
            let task_id = TaskId(graph.tasks.len() as u32);
            let inputs: Vec<FileId> = task
                .inputs
                .iter()
                .map(|p| *graph.path_to_file.get(p).expect("interned above"))
                .collect();
            let outputs: Vec<FileId> = task
                .outputs
                .iter()
                .map(|p| *graph.path_to_file.get(p).expect("interned above"))
                .collect();

            for &fid in &outputs {
                let file = &mut graph.files[fid.0 as usize];
                if let Some(existing) = file.producer {
                    let first = graph.tasks[existing.0 as usize].task.task_id.clone();
                    return Err(LoadError::DuplicateOutput {
                        path: file.path.clone(),
                        first_task: first,
                        second_task: task.task_id.clone(),
                    });
                }
                file.producer = Some(task_id);
            }
            for &fid in &inputs {
                graph.files[fid.0 as usize].consumers.push(task_id);
            }

            graph.tasks.push(TaskNode {
                task,
                inputs,
                outputs,
                predecessors: Vec::new(),
                successors: Vec::new(),
            });
        }

        for (from, tos) in depend.edges {
            let from_id = graph.path_to_file[&from];
            for to in tos {
                if to == from {
                    return Err(LoadError::SelfLoop { path: from.clone() });
                }
                let to_id = graph.path_to_file[&to];
                graph.implicit_forward.entry(from_id).or_default().push(to_id);
            }
        }

        graph.link_task_edges();
        graph.check_file_cycle()?;
        graph.topo = graph.topo_sort_tasks()?;

        Ok(graph)
    }

    fn intern_file(&mut self, path: &Path) -> FileId {
        if let Some(&id) = self.path_to_file.get(path) {
            return id;
        }
        let id = FileId(self.files.len() as u32);
        self.files.push(FileNode {
            path: path.to_path_buf(),
            ..Default::default()
        });
        self.path_to_file.insert(path.to_path_buf(), id);
        id
    }

    fn link_task_edges(&mut self) {
        let producer_of: Vec<Option<TaskId>> = self.files.iter().map(|f| f.producer).collect();
        for task_id in 0..self.tasks.len() {
            let inputs = self.tasks[task_id].inputs.clone();
            for fid in inputs {
                if let Some(pred) = producer_of[fid.0 as usize] {
                    if pred.0 as usize != task_id {
                        self.tasks[task_id].predecessors.push(pred);
                        self.tasks[pred.0 as usize]
                            .successors
                            .push(TaskId(task_id as u32));
                    }
                }
            }
        }
        for t in &mut self.tasks {
            t.predecessors.sort_unstable_by_key(|t| t.0);
            t.predecessors.dedup();
            t.successors.sort_unstable_by_key(|t| t.0);
            t.successors.dedup();
        }
    }

    fn check_file_cycle(&self) -> Result<(), LoadError> {
        #[derive(PartialEq, Eq, Clone, Copy)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<FileId, Mark> = HashMap::new();
        for start in 0..self.files.len() {
            let start = FileId(start as u32);
            if marks.contains_key(&start) {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            let mut path = vec![start];
            marks.insert(start, Mark::Visiting);
            'outer: while let Some((node, mut idx)) = stack.pop() {
                let neighbors = self.implicit_forward.get(&node).map(|v| v.as_slice()).unwrap_or(&[]);
                while idx < neighbors.len() {
                    let next = neighbors[idx];
                    idx += 1;
                    match marks.get(&next) {
                        Some(Mark::Visiting) => {
                            let pos = path.iter().position(|&p| p == next).unwrap_or(0);
                            let mut cycle: Vec<PathBuf> =
                                path[pos..].iter().map(|f| self.files[f.0 as usize].path.clone()).collect();
                            cycle.push(self.files[next.0 as usize].path.clone());
                            return Err(LoadError::FileCycle { cycle });
                        }
                        Some(Mark::Done) => continue,
                        None => {
                            stack.push((node, idx));
                            marks.insert(next, Mark::Visiting);
                            path.push(next);
                            stack.push((next, 0));
                            continue 'outer;
                        }
                    }
                }
                marks.insert(node, Mark::Done);
                path.pop();
            }
        }
        Ok(())
    }

    fn topo_sort_tasks(&self) -> Result<Vec<TaskId>, LoadError> {
        #[derive(PartialEq, Eq, Clone, Copy)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks = vec![None; self.tasks.len()];
        let mut order = Vec::with_capacity(self.tasks.len());

        fn visit(
            node: usize,
            tasks: &[TaskNode],
            marks: &mut Vec<Option<Mark>>,
            order: &mut Vec<TaskId>,
            path: &mut Vec<usize>,
        ) -> Result<(), LoadError> {
            match marks[node] {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    let pos = path.iter().position(|&p| p == node).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[pos..].iter().map(|&i| tasks[i].task.task_id.clone()).collect();
                    cycle.push(tasks[node].task.task_id.clone());
                    return Err(LoadError::TaskCycle { cycle });
                }
                None => {}
            }
            marks[node] = Some(Mark::Visiting);
            path.push(node);
            for pred in tasks[node].predecessors.clone() {
                visit(pred.0 as usize, tasks, marks, order, path)?;
            }
            path.pop();
            marks[node] = Some(Mark::Done);
            order.push(TaskId(node as u32));
            Ok(())
        }

        for n in 0..self.tasks.len() {
            let mut path = Vec::new();
            visit(n, &self.tasks, &mut marks, &mut order, &mut path)?;
        }
        Ok(order)
    }

    pub fn task(&self, id: TaskId) -> &TaskNode {
        &self.tasks[id.0 as usize]
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut TaskNode {
        &mut self.tasks[id.0 as usize]
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> {
        (0..self.tasks.len() as u32).map(TaskId)
    }

    pub fn file(&self, id: FileId) -> &FileNode {
        &self.files[id.0 as usize]
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut FileNode {
        &mut self.files[id.0 as usize]
    }

    pub fn file_id_for(&self, path: &Path) -> Option<FileId> {
        self.path_to_file.get(path).copied()
    }

    pub fn tasks_consuming(&self, file: FileId) -> &[TaskId] {
        &self.files[file.0 as usize].consumers
    }

    pub fn task_producing(&self, file: FileId) -> Option<TaskId> {
        self.files[file.0 as usize].producer
    }

    pub fn inputs(&self, task: TaskId) -> &[FileId] {
        &self.tasks[task.0 as usize].inputs
    }

    pub fn outputs(&self, task: TaskId) -> &[FileId] {
        &self.tasks[task.0 as usize].outputs
    }

    pub fn predecessors(&self, task: TaskId) -> &[TaskId] {
        &self.tasks[task.0 as usize].predecessors
    }

    pub fn successors(&self, task: TaskId) -> &[TaskId] {
        &self.tasks[task.0 as usize].successors
    }

    pub fn stage_of(&self, task: TaskId) -> usize {
        self.tasks[task.0 as usize].task.stage
    }

    pub fn topological_order(&self) -> &[TaskId] {
        &self.topo
    }

    /// All files transitively reachable from `file` via implicit edges.
    pub fn implicit_closure(&self, file: FileId) -> HashSet<FileId> {
        let mut seen = HashSet::new();
        let mut stack = vec![file];
        while let Some(node) = stack.pop() {
            if let Some(next) = self.implicit_forward.get(&node) {
                for &n in next {
                    if seen.insert(n) {
                        stack.push(n);
                    }
                }
            }
        }
        seen
    }
}
