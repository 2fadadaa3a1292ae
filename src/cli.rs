use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "graft", about = "Incremental task-graph scheduler", version)]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Mode,

    /// Verbose logging (tracing at debug level).
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,

    /// Number of worker threads (default: logical cores - 1).
    #[arg(short = 'w', long = "workers", global = true)]
    pub workers: Option<usize>,

    /// Path to the agenda document.
    #[arg(short = 'a', long = "agenda", global = true, default_value = "agenda.yaml")]
    pub agenda: PathBuf,

    /// Path to the depend document.
    #[arg(short = 'd', long = "depend", global = true, default_value = "depend.yaml")]
    pub depend: PathBuf,

    /// Path to the file-stat cache.
    #[arg(short = 'c', long = "cache", global = true, default_value = ".graft-cache")]
    pub cache: PathBuf,

    /// Path to the structured run log (JSONL). If omitted, only tracing fires.
    #[arg(short = 'l', long = "log", global = true)]
    pub log: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Run to quiescence once, then exit.
    Offline,
    /// Run continuously, reacting to filesystem and document changes.
    Online,
    /// Remove every file any task produces.
    Clean,
    /// Print version information and exit.
    Version,
}
