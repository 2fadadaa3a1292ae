//! Fixed-size worker pool: pulls task IDs on request, invokes the
//! `TaskRunner` capability, and reports completion (spec §4.5).

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::model::TaskId;
use crate::runner::{CancelSignal, RunOutcome, TaskRunner};

/// A worker pulling for work (backpressure: the dispatcher only assigns a
/// task once a worker has asked for one).
#[derive(Debug)]
pub struct WorkerRequest {
    pub worker_id: usize,
}

/// A unit of work handed to exactly one worker.
pub struct Assignment {
    pub task_id: TaskId,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub outputs: Vec<PathBuf>,
    pub cancel: CancelSignal,
}

/// What a worker reports back after running (or being told to cancel)
/// an assignment.
pub struct WorkerReport {
    pub worker_id: usize,
    pub task_id: TaskId,
    pub outcome: RunOutcome,
}

enum Mailbox {
    Assignment(Assignment),
    Shutdown,
}

pub struct WorkerHandle {
    assignment_tx: mpsc::Sender<Mailbox>,
    join: Option<JoinHandle<()>>,
}

pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Spawn `count` worker threads. Each immediately sends a
    /// `WorkerRequest` on `request_tx` and then blocks for its next
    /// assignment; this is the "pull" side of the backpressure contract.
    pub fn spawn(
        count: usize,
        runner: Arc<dyn TaskRunner>,
        request_tx: mpsc::Sender<WorkerRequest>,
        report_tx: mpsc::Sender<WorkerReport>,
    ) -> WorkerPool {
        let count = count.max(1);
        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count {
            let (assignment_tx, assignment_rx) = mpsc::channel::<Mailbox>();
            let runner = Arc::clone(&runner);
            let request_tx = request_tx.clone();
            let report_tx = report_tx.clone();

            let join = thread::spawn(move || {
                loop {
                    if request_tx.send(WorkerRequest { worker_id }).is_err() {
                        debug!(worker_id, "dispatcher gone, worker exiting");
                        return;
                    }
                    match assignment_rx.recv() {
                        Ok(Mailbox::Assignment(assignment)) => {
                            let outcome = runner.run(
                                &assignment.argv,
                                &assignment.cwd,
                                &assignment.cancel,
                            );
                            let outcome = finalize_outcome(outcome, &assignment.outputs);
                            if report_tx
                                .send(WorkerReport {
                                    worker_id,
                                    task_id: assignment.task_id,
                                    outcome,
                                })
                                .is_err()
                            {
                                warn!(worker_id, "report channel closed");
                                return;
                            }
                        }
                        Ok(Mailbox::Shutdown) | Err(_) => return,
                    }
                }
            });

            handles.push(WorkerHandle {
                assignment_tx,
                join: Some(join),
            });
        }
        WorkerPool { handles }
    }

    pub fn assign(&self, worker_id: usize, assignment: Assignment) {
        if let Some(handle) = self.handles.get(worker_id) {
            let _ = handle.assignment_tx.send(Mailbox::Assignment(assignment));
        }
    }

    pub fn shutdown(&mut self) {
        for handle in &self.handles {
            let _ = handle.assignment_tx.send(Mailbox::Shutdown);
        }
        for handle in &mut self.handles {
            if let Some(join) = handle.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A process that exits 0 but leaves a declared output missing is a
/// `MissingOutput` failure, not an `Ok` (spec §4.5).
fn finalize_outcome(outcome: RunOutcome, outputs: &[PathBuf]) -> RunOutcome {
    if outcome != RunOutcome::Ok {
        return outcome;
    }
    let missing: Vec<PathBuf> = outputs.iter().filter(|p| !p.exists()).cloned().collect();
    if missing.is_empty() {
        RunOutcome::Ok
    } else {
        RunOutcome::MissingOutput { paths: missing }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    struct FakeRunner {
        outcome: Mutex<RunOutcome>,
    }

    impl TaskRunner for FakeRunner {
        fn run(&self, _argv: &[String], _cwd: &Path, _cancel: &CancelSignal) -> RunOutcome {
            self.outcome.lock().unwrap().clone()
        }
    }

    #[test]
    fn worker_requests_then_runs_assignment() {
        let (request_tx, request_rx) = mpsc::channel();
        let (report_tx, report_rx) = mpsc::channel();
        let runner = Arc::new(FakeRunner {
            outcome: Mutex::new(RunOutcome::Ok),
        });
        let pool = WorkerPool::spawn(1, runner, request_tx, report_tx);

        let req = request_rx.recv().unwrap();
        assert_eq!(req.worker_id, 0);

        pool.assign(
            0,
            Assignment {
                task_id: TaskId(0),
                argv: vec!["true".to_string()],
                cwd: PathBuf::from("."),
                outputs: vec![],
                cancel: CancelSignal::new(),
            },
        );

        let report = report_rx.recv().unwrap();
        assert_eq!(report.task_id, TaskId(0));
        assert_eq!(report.outcome, RunOutcome::Ok);
    }

    #[test]
    fn missing_declared_output_becomes_missing_output_outcome() {
        let (request_tx, request_rx) = mpsc::channel();
        let (report_tx, report_rx) = mpsc::channel();
        let runner = Arc::new(FakeRunner {
            outcome: Mutex::new(RunOutcome::Ok),
        });
        let pool = WorkerPool::spawn(1, runner, request_tx, report_tx);
        let _ = request_rx.recv().unwrap();

        pool.assign(
            0,
            Assignment {
                task_id: TaskId(0),
                argv: vec!["true".to_string()],
                cwd: PathBuf::from("."),
                outputs: vec![PathBuf::from("/nonexistent/definitely-missing.out")],
                cancel: CancelSignal::new(),
            },
        );

        let report = report_rx.recv().unwrap();
        assert!(matches!(report.outcome, RunOutcome::MissingOutput { .. }));
    }
}
