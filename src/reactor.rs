//! Online-mode driver: a single-owner loop multiplexing worker
//! completions, filesystem change events, and agenda/depend edits
//! (spec §4.6).

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::TaskFailure;
use crate::filestat::{CachePersistor, FileStatStore, Stat};
use crate::graph::{Graph, NormalizedAgenda, NormalizedDepend, TaskStatus};
use crate::model::{Procedure, TaskId};
use crate::runner::{CancelSignal, RunOutcome, TaskRunner};
use crate::runlog::{LogEvent, RunLog};
use crate::scheduler::{Outcome, Scheduler};
use crate::stale::{Classification, StaleAnalyzer};
use crate::watch::ChangeEvent;
use crate::worker::{Assignment, WorkerPool, WorkerRequest};

pub struct Reactor {
    graph: Graph,
    procedures: HashMap<String, Procedure>,
    store: FileStatStore,
    scheduler: Scheduler,
    persistor: CachePersistor,
    cwd: PathBuf,

    pool: WorkerPool,
    request_rx: Receiver<WorkerRequest>,
    report_rx: Receiver<crate::worker::WorkerReport>,
    pending_requests: VecDeque<usize>,
    running: HashMap<TaskId, (usize, CancelSignal)>,

    fs_rx: Option<Receiver<ChangeEvent>>,
    doc_paths: Vec<PathBuf>,

    run_log: Option<RunLog>,
    failures: Vec<TaskFailure>,
    rebuild_requested: bool,
}

impl Reactor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Graph,
        procedures: HashMap<String, Procedure>,
        store: FileStatStore,
        persistor: CachePersistor,
        cwd: PathBuf,
        workers: usize,
        runner: Arc<dyn TaskRunner>,
        run_log: Option<RunLog>,
        doc_paths: Vec<PathBuf>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel();
        let (report_tx, report_rx) = mpsc::channel();
        let pool = WorkerPool::spawn(workers, runner, request_tx, report_tx);

        let classification = StaleAnalyzer::new(&graph, &store).classify_all();
        let mut scheduler = Scheduler::new();
        scheduler.seed(&graph, &classification);

        Self {
            graph,
            procedures,
            store,
            scheduler,
            persistor,
            cwd,
            pool,
            request_rx,
            report_rx,
            pending_requests: VecDeque::new(),
            running: HashMap::new(),
            fs_rx: None,
            doc_paths,
            run_log,
            failures: Vec::new(),
            rebuild_requested: false,
        }
    }

    pub fn attach_file_watch(&mut self, rx: Receiver<ChangeEvent>) {
        self.fs_rx = Some(rx);
    }

    pub fn failures(&self) -> &[TaskFailure] {
        &self.failures
    }

    fn log(&self, event: LogEvent) {
        if let Some(log) = &self.run_log {
            if let Err(e) = log.log(event) {
                warn!(error = %e, "failed to write run log entry");
            }
        }
    }

    /// Process one batch of currently-pending events from every source.
    /// Returns `true` if any event was processed.
    pub fn tick(&mut self) -> bool {
        let mut did_work = false;

        loop {
            match self.report_rx.try_recv() {
                Ok(report) => {
                    did_work = true;
                    self.handle_report(report);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }

        loop {
            match self.request_rx.try_recv() {
                Ok(req) => {
                    did_work = true;
                    self.pending_requests.push_back(req.worker_id);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }

        self.try_dispatch();

        if let Some(rx) = self.fs_rx.take() {
            loop {
                match rx.try_recv() {
                    Ok(event) => {
                        did_work = true;
                        self.handle_fs_event(event);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break,
                }
            }
            self.fs_rx = Some(rx);
        }

        did_work
    }

    fn handle_report(&mut self, report: crate::worker::WorkerReport) {
        self.running.remove(&report.task_id);
        let task = &self.graph.task(report.task_id).task;

        match report.outcome {
            RunOutcome::Ok => {
                for &output in self.graph.outputs(report.task_id) {
                    let path = self.graph.file(output).path.clone();
                    if let Ok(stat) = Stat::observe(&path) {
                        self.store.put(path, stat);
                    }
                }
                self.scheduler.complete(&self.graph, report.task_id, Outcome::Done);
                self.log(LogEvent::TaskFinished {
                    task_id: task.task_id.clone(),
                    description: task.description.clone(),
                });
            }
            RunOutcome::Cancelled => {
                self.scheduler.cancel(&self.graph, report.task_id);
            }
            other => {
                let reason = match &other {
                    RunOutcome::MissingOutput { paths } => {
                        format!("missing output(s): {paths:?}")
                    }
                    RunOutcome::NonZeroExit(code) => format!("exited with code {code}"),
                    RunOutcome::SpawnError(e) => format!("spawn error: {e}"),
                    RunOutcome::Ok | RunOutcome::Cancelled => unreachable!(),
                };
                let procedure = &self.procedures[&task.procedure];
                let command = task.effective_command(procedure);
                let origin_task_id = task.task_id.clone();
                let origin_description = task.description.clone();
                let cascaded = self.scheduler.complete(&self.graph, report.task_id, Outcome::Failed);
                self.log(LogEvent::TaskFailedRecord {
                    task_id: origin_task_id.clone(),
                    description: origin_description,
                    command: command.clone(),
                    reason: reason.clone(),
                });
                self.failures.push(TaskFailure {
                    task_id: report.task_id,
                    description: task.description.clone(),
                    command,
                    reason,
                });
                for cascaded_id in cascaded {
                    self.log(LogEvent::CascadedSkip {
                        task_id: self.graph.task(cascaded_id).task.task_id.clone(),
                        originating_task: origin_task_id.clone(),
                    });
                }
            }
        }

        self.try_dispatch();
    }

    fn try_dispatch(&mut self) {
        while !self.pending_requests.is_empty() {
            match self.scheduler.next_ready(&self.graph) {
                Some(task_id) => {
                    let worker_id = self.pending_requests.pop_front().unwrap();
                    self.assign(worker_id, task_id);
                }
                None => break,
            }
        }
    }

    fn assign(&mut self, worker_id: usize, task_id: TaskId) {
        let task = &self.graph.task(task_id).task;
        let procedure = &self.procedures[&task.procedure];
        let argv = task.effective_command(procedure);
        let outputs: Vec<PathBuf> = self
            .graph
            .outputs(task_id)
            .iter()
            .map(|&f| self.graph.file(f).path.clone())
            .collect();
        let cancel = CancelSignal::new();
        self.running.insert(task_id, (worker_id, cancel.clone()));
        self.log(LogEvent::TaskStarted {
            task_id: task.task_id.clone(),
            description: task.description.clone(),
        });
        self.pool.assign(
            worker_id,
            Assignment {
                task_id,
                argv,
                cwd: self.cwd.clone(),
                outputs,
                cancel,
            },
        );
    }

    fn handle_fs_event(&mut self, event: ChangeEvent) {
        if self.doc_paths.iter().any(|p| p == &event.path) {
            self.rebuild_requested = true;
            return;
        }

        let Some(file_id) = self.graph.file_id_for(&event.path) else {
            return;
        };
        self.store.forget(&event.path);

        let affected = StaleAnalyzer::new(&self.graph, &self.store).classify_affected(&[file_id]);
        for (task_id, classification) in affected {
            if classification != Classification::MustRun {
                continue;
            }
            if self.scheduler.invalidate(&self.graph, task_id) {
                if let Some((_, cancel)) = self.running.get(&task_id) {
                    cancel.cancel();
                }
            }
        }
        self.try_dispatch();
    }

    /// Consume a pending `rebuild_requested` flag raised by an agenda/depend
    /// file-change event. The caller (owning the out-of-scope YAML parsing
    /// glue) re-reads and re-normalizes the documents and calls `rebuild`.
    pub fn take_rebuild_request(&mut self) -> bool {
        std::mem::replace(&mut self.rebuild_requested, false)
    }

    /// Full graph rebuild (spec §4.6 point 3). Running tasks whose
    /// structural identity survives into the new graph continue
    /// uninterrupted; every other running task is cancelled.
    pub fn rebuild(
        &mut self,
        agenda: NormalizedAgenda,
        depend: NormalizedDepend,
        procedures: HashMap<String, Procedure>,
    ) -> Result<(), crate::error::LoadError> {
        let new_graph = Graph::build(agenda, depend)?;

        let mut by_identity: HashMap<String, (usize, CancelSignal)> = HashMap::new();
        for (&old_id, (worker_id, cancel)) in &self.running {
            by_identity.insert(self.graph.task(old_id).task.identity_key(), (*worker_id, cancel.clone()));
        }

        let mut new_running = HashMap::new();
        for new_id in new_graph.task_ids() {
            let identity = new_graph.task(new_id).task.identity_key();
            if let Some(entry) = by_identity.remove(&identity) {
                new_running.insert(new_id, entry);
            }
        }
        for (_, (_, cancel)) in by_identity {
            cancel.cancel();
        }

        let classification = StaleAnalyzer::new(&new_graph, &self.store).classify_all();
        let mut new_scheduler = Scheduler::new();
        new_scheduler.seed(&new_graph, &classification);
        for &task_id in new_running.keys() {
            new_scheduler.force_running(&new_graph, task_id);
        }

        self.graph = new_graph;
        self.scheduler = new_scheduler;
        self.running = new_running;
        self.procedures = procedures;
        self.rebuild_requested = false;
        self.log(LogEvent::GraphRebuilt {
            task_count: self.graph.task_count(),
        });
        self.try_dispatch();
        Ok(())
    }

    pub fn drained(&self) -> bool {
        self.scheduler.drained()
    }

    pub fn any_failed(&self) -> bool {
        self.scheduler.any_failed()
    }

    /// Persist the file-stat store. Called opportunistically on
    /// quiescence (spec §4.2, §4.6).
    pub fn persist(&self) {
        if let Err(e) = self.persistor.store(&self.store) {
            warn!(error = %e, "failed to persist file-stat cache");
        }
    }

    /// Drive the reactor to quiescence once, persist, and return. This is
    /// the offline-mode driver (spec §4.6 quiescence: "in offline mode,
    /// exits").
    pub fn run_to_quiescence(&mut self) {
        loop {
            let did_work = self.tick();
            if self.drained() && !did_work {
                self.persist();
                self.log(LogEvent::Quiescent {
                    done: count_status(&self.scheduler, TaskStatus::Done),
                    skipped: count_status(&self.scheduler, TaskStatus::Skipped),
                    failed: count_status(&self.scheduler, TaskStatus::Failed),
                });
                return;
            }
            if !did_work {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }

    /// One iteration of the online-mode loop: process pending events and,
    /// on reaching quiescence with no rebuild pending, persist the cache.
    /// The caller drives this in a `loop {}` and is responsible for
    /// noticing `take_rebuild_request` and calling `rebuild` (agenda/depend
    /// re-parsing is out of this module's scope, spec §1).
    pub fn tick_online(&mut self) -> bool {
        let did_work = self.tick();
        if self.drained() && !did_work && !self.rebuild_requested {
            self.persist();
        }
        did_work
    }
}

fn count_status(scheduler: &Scheduler, status: TaskStatus) -> usize {
    scheduler.all_statuses().values().filter(|&&s| s == status).count()
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NormalizedAgenda as NAgenda;
    use crate::model::{Task, Word};
    use std::path::Path;

    struct ScriptedRunner {
        outcome: RunOutcome,
    }

    impl TaskRunner for ScriptedRunner {
        fn run(&self, argv: &[String], _cwd: &Path, _cancel: &CancelSignal) -> RunOutcome {
            // "touch" semantics used by the empty-run scenario.
            if let Some(path) = argv.get(1) {
                let _ = std::fs::write(path, b"");
            }
            self.outcome.clone()
        }
    }

    fn touch_procedures() -> HashMap<String, Procedure> {
        let mut m = HashMap::new();
        m.insert(
            "touch".to_string(),
            Procedure {
                name: "touch".to_string(),
                words: vec![Word::Literal("touch".to_string()), Word::Param("out".to_string())],
            },
        );
        m
    }

    fn touch_task(out: &str) -> Task {
        Task {
            task_id: String::new(),
            description: "touch".to_string(),
            procedure: "touch".to_string(),
            args: vec![("out".to_string(), vec![out.to_string()])],
            inputs: vec![],
            outputs: vec![std::path::PathBuf::from(out)],
            stage: 0,
        }
    }

    #[test]
    fn empty_run_executes_task_then_second_run_is_idle() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut task = touch_task(out.to_str().unwrap());
        task.task_id = task.identity_key();

        let graph = Graph::build(NAgenda { tasks: vec![task] }, Default::default()).unwrap();
        let store = FileStatStore::new();
        let persistor = CachePersistor::new(dir.path().join("cache"));

        let mut reactor = Reactor::new(
            graph,
            touch_procedures(),
            store,
            persistor,
            dir.path().to_path_buf(),
            1,
            Arc::new(ScriptedRunner { outcome: RunOutcome::Ok }),
            None,
            vec![],
        );
        reactor.run_to_quiescence();
        assert!(out.exists());
        assert!(!reactor.any_failed());
    }
}
