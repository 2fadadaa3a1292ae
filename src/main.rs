mod cli;
mod clean;
mod config;
mod error;
mod filestat;
mod graph;
mod loader;
mod model;
mod reactor;
mod runlog;
mod runner;
mod scheduler;
mod stale;
mod watch;
mod worker;

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use cli::{Cli, Mode};
use config::RunConfig;
use filestat::CachePersistor;
use graph::{Graph, NormalizedAgenda, NormalizedDepend};
use loader::{AgendaDoc, AgendaLoader, DependDoc, DependLoader};
use model::Procedure;
use reactor::Reactor;
use runlog::RunLog;
use runner::ProcessTaskRunner;
use watch::{FileWatch, NotifyFileWatch};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let config = RunConfig::from_cli(&cli);

    match run(config) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "internal error");
            ExitCode::from(3)
        }
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug { "graft=debug" } else { "graft=info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run(config: RunConfig) -> Result<ExitCode> {
    match config.mode {
        Mode::Version => {
            println!("graft {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
        Mode::Clean => run_clean(&config),
        Mode::Offline => run_evaluate(&config, false),
        Mode::Online => run_evaluate(&config, true),
    }
}

fn load_documents(config: &RunConfig) -> Result<(NormalizedAgenda, NormalizedDepend, HashMap<String, Procedure>)> {
    let agenda_text = std::fs::read_to_string(&config.agenda_path)
        .with_context(|| format!("failed to read agenda at {}", config.agenda_path.display()))?;
    let agenda_doc: AgendaDoc = serde_yaml::from_str(&agenda_text)
        .with_context(|| format!("failed to parse agenda at {}", config.agenda_path.display()))?;

    let depend_doc: Option<DependDoc> = match std::fs::read_to_string(&config.depend_path) {
        Ok(text) => Some(
            serde_yaml::from_str(&text)
                .with_context(|| format!("failed to parse depend at {}", config.depend_path.display()))?,
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e).context("failed to read depend document"),
    };

    let procedures = build_procedures(&agenda_doc);
    let normalized_agenda = AgendaLoader::normalize(agenda_doc).map_err(anyhow::Error::from)?;
    let normalized_depend = DependLoader::normalize(depend_doc).map_err(anyhow::Error::from)?;
    Ok((normalized_agenda, normalized_depend, procedures))
}

fn build_procedures(doc: &AgendaDoc) -> HashMap<String, Procedure> {
    doc.procs
        .iter()
        .map(|(name, words)| {
            (
                name.clone(),
                Procedure {
                    name: name.clone(),
                    words: words.iter().map(|w| model::Word::parse(w)).collect(),
                },
            )
        })
        .collect()
}

fn run_clean(config: &RunConfig) -> Result<ExitCode> {
    let (agenda, depend, _procedures) = match load_documents(config) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "failed to load agenda/depend");
            return Ok(ExitCode::from(1));
        }
    };
    let graph = match Graph::build(agenda, depend) {
        Ok(g) => g,
        Err(e) => {
            error!(error = %e, "invalid agenda/depend graph");
            return Ok(ExitCode::from(1));
        }
    };
    let removed = clean::clean_outputs(&graph, false)?;
    info!(removed, "clean complete");
    Ok(ExitCode::SUCCESS)
}

fn run_evaluate(config: &RunConfig, online: bool) -> Result<ExitCode> {
    let (agenda, depend, procedures) = match load_documents(config) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "failed to load agenda/depend");
            return Ok(ExitCode::from(1));
        }
    };
    let graph = match Graph::build(agenda, depend) {
        Ok(g) => g,
        Err(e) => {
            error!(error = %e, "invalid agenda/depend graph");
            return Ok(ExitCode::from(1));
        }
    };

    let persistor = CachePersistor::new(config.cache_path.clone());
    let store = persistor.load();

    let run_log = match &config.log_path {
        Some(path) => Some(RunLog::new(path)?),
        None => None,
    };

    let cwd = std::env::current_dir()?;
    let runner = Arc::new(ProcessTaskRunner::new());

    let doc_paths = vec![config.agenda_path.clone(), config.depend_path.clone()];

    // Watch every initial input file plus every initial file reachable
    // through the implicit (depend-file) closure, plus the agenda and
    // depend documents themselves. Collected before `graph` is moved into
    // the reactor.
    let mut watch_paths = doc_paths.clone();
    for task_id in graph.task_ids() {
        for &input in graph.inputs(task_id) {
            let file = graph.file(input);
            if file.is_initial() {
                watch_paths.push(file.path.clone());
            }
            for implicit_id in graph.implicit_closure(input) {
                let implicit_file = graph.file(implicit_id);
                if implicit_file.is_initial() {
                    watch_paths.push(implicit_file.path.clone());
                }
            }
        }
    }
    watch_paths.sort();
    watch_paths.dedup();

    let mut reactor = Reactor::new(
        graph,
        procedures,
        store,
        persistor,
        cwd,
        config.workers,
        runner,
        run_log,
        doc_paths,
    );

    if online {
        let mut watcher = NotifyFileWatch::new();
        let rx = watcher.watch(&watch_paths);
        reactor.attach_file_watch(rx);
        run_online_loop(config, &mut reactor);
    } else {
        reactor.run_to_quiescence();
    }

    if reactor.any_failed() {
        for failure in reactor.failures() {
            warn!(
                task = %failure.description,
                reason = %failure.reason,
                command = ?failure.command,
                "task failed"
            );
        }
        return Ok(ExitCode::from(2));
    }

    Ok(ExitCode::SUCCESS)
}

/// Online-mode driver loop. The reactor only flags that a rebuild is
/// needed (`take_rebuild_request`); re-reading and re-parsing the YAML
/// documents is this out-of-core glue's job (spec §1). A load failure here
/// is reported and the previous good graph stays in force (spec §7).
fn run_online_loop(config: &RunConfig, reactor: &mut Reactor) -> ! {
    loop {
        let did_work = reactor.tick_online();

        if reactor.take_rebuild_request() {
            match load_documents(config) {
                Ok((agenda, depend, procedures)) => {
                    if let Err(e) = reactor.rebuild(agenda, depend, procedures) {
                        error!(error = %e, "agenda/depend rebuild rejected, previous graph remains in force");
                    } else {
                        info!("graph rebuilt from updated agenda/depend");
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to reload agenda/depend, previous graph remains in force");
                }
            }
        }

        if !did_work {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    }
}

