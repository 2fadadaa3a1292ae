//! Resolves CLI flags into a `RunConfig` (ambient configuration layer,
//! spec §4.9).

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::thread::available_parallelism;

use crate::cli::{Cli, Mode};

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: Mode,
    pub agenda_path: PathBuf,
    pub depend_path: PathBuf,
    pub cache_path: PathBuf,
    pub log_path: Option<PathBuf>,
    pub workers: usize,
    pub debug: bool,
}

impl RunConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        let workers = cli.workers.unwrap_or_else(default_worker_count);
        Self {
            mode: cli.mode,
            agenda_path: cli.agenda.clone(),
            depend_path: cli.depend.clone(),
            cache_path: cli.cache.clone(),
            log_path: cli.log.clone(),
            workers: workers.max(1),
            debug: cli.debug,
        }
    }
}

fn default_worker_count() -> usize {
    let cores = available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    cores.saturating_sub(1).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_worker_count_overrides_default() {
        let cli = Cli {
            mode: Mode::Offline,
            debug: false,
            workers: Some(7),
            agenda: PathBuf::from("agenda.yaml"),
            depend: PathBuf::from("depend.yaml"),
            cache: PathBuf::from(".cache"),
            log: None,
        };
        let config = RunConfig::from_cli(&cli);
        assert_eq!(config.workers, 7);
    }

    #[test]
    fn default_worker_count_is_at_least_one() {
        assert!(default_worker_count() >= 1);
    }
}
