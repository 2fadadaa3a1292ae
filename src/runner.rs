//! The `TaskRunner` capability (spec §6): spawns and awaits a task's
//! effective command, honoring a cancel signal.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Taxonomy of worker outcomes (spec §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Ok,
    MissingOutput { paths: Vec<PathBuf> },
    NonZeroExit(i32),
    SpawnError(String),
    Cancelled,
}

/// Cooperative cancellation flag shared between the reactor and a worker.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Capability interface for running a task's effective command. Real
/// implementation spawns a child process; tests inject an in-memory fake.
pub trait TaskRunner: Send + Sync + 'static {
    fn run(&self, argv: &[String], cwd: &Path, cancel: &CancelSignal) -> RunOutcome;
}

/// Real `TaskRunner` backed by `std::process::Command`.
#[derive(Debug, Default, Clone)]
pub struct ProcessTaskRunner {
    /// How often to poll the cancel signal while the child runs.
    poll_interval: Duration,
}

impl ProcessTaskRunner {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl TaskRunner for ProcessTaskRunner {
    fn run(&self, argv: &[String], cwd: &Path, cancel: &CancelSignal) -> RunOutcome {
        let Some((program, args)) = argv.split_first() else {
            return RunOutcome::SpawnError("empty command".to_string());
        };

        let mut child = match Command::new(program).args(args).current_dir(cwd).spawn() {
            Ok(c) => c,
            Err(e) => return RunOutcome::SpawnError(e.to_string()),
        };

        loop {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return RunOutcome::Cancelled;
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    return match status.code() {
                        Some(0) => RunOutcome::Ok,
                        Some(code) => RunOutcome::NonZeroExit(code),
                        None => RunOutcome::NonZeroExit(-1),
                    };
                }
                Ok(None) => std::thread::sleep(self.poll_interval),
                Err(e) => return RunOutcome::SpawnError(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_spawn_error() {
        let runner = ProcessTaskRunner::new();
        let outcome = runner.run(&[], Path::new("."), &CancelSignal::new());
        assert!(matches!(outcome, RunOutcome::SpawnError(_)));
    }

    #[test]
    fn true_exits_ok() {
        let runner = ProcessTaskRunner::new();
        let outcome = runner.run(
            &["true".to_string()],
            Path::new("."),
            &CancelSignal::new(),
        );
        assert_eq!(outcome, RunOutcome::Ok);
    }

    #[test]
    fn false_is_non_zero_exit() {
        let runner = ProcessTaskRunner::new();
        let outcome = runner.run(
            &["false".to_string()],
            Path::new("."),
            &CancelSignal::new(),
        );
        assert_eq!(outcome, RunOutcome::NonZeroExit(1));
    }
}
