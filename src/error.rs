//! Typed error kinds for the loader, cache, and scheduler layers.
//!
//! `LoadError` is propagated with `?` through the binary and mapped to
//! process exit codes in `main`. `CacheError` is deliberately never fatal
//! (see §4.2 / §7): callers log it and fall back to an empty `FileStat`
//! store.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::TaskId;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("output `{path}` is produced by both task `{first_task}` and task `{second_task}`")]
    DuplicateOutput {
        path: PathBuf,
        first_task: String,
        second_task: String,
    },

    #[error("cycle in task dependency graph: {}", render_cycle(.cycle))]
    TaskCycle { cycle: Vec<String> },

    #[error("cycle in implicit file dependency graph: {}", render_path_cycle(.cycle))]
    FileCycle { cycle: Vec<PathBuf> },

    #[error("task `{task_id}` has procedure `{proc}` which is not admitted by any stage")]
    UnassignedStage { task_id: String, proc: String },

    #[error("task `{task_id}` refers to undefined procedure `{proc}`")]
    UnknownProcedure { task_id: String, proc: String },

    #[error("task `{task_id}` does not bind parameter `{param}` referenced by procedure `{proc}`")]
    UnboundParameter {
        task_id: String,
        proc: String,
        param: String,
    },

    #[error("task `{task_id}` supplies arg `{param}` which procedure `{proc}` never references")]
    UnusedArg {
        task_id: String,
        proc: String,
        param: String,
    },

    #[error("procedure `{proc}` has an empty command")]
    EmptyCommand { proc: String },

    #[error("stage {stage} refers to undefined procedure `{proc}`")]
    UnknownStageProcedure { stage: usize, proc: String },

    #[error("implicit dependency file `{path}` depends on itself")]
    SelfLoop { path: PathBuf },
}

fn render_cycle(cycle: &[String]) -> String {
    cycle.join(" -> ")
}

fn render_path_cycle(cycle: &[PathBuf]) -> String {
    cycle
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache file truncated")]
    Truncated,
    #[error("cache file has wrong magic bytes")]
    BadMagic,
    #[error("cache file has unsupported version {found}")]
    VersionMismatch { found: u16 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A task whose worker outcome was not success. Fed into the scheduler's
/// cascading-`Failed` logic and into the run log.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub description: String,
    pub command: Vec<String>,
    pub reason: String,
}

