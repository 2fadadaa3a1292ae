//! The `FileWatch` capability (spec §6): a restartable, lazy event stream
//! of path-level filesystem changes.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Capability interface yielding filesystem change events. `watch` may be
/// called again with a new path set to restart the watch (spec §6).
pub trait FileWatch: Send + 'static {
    fn watch(&mut self, paths: &[PathBuf]) -> Receiver<ChangeEvent>;
}

/// Real `FileWatch` backed by the `notify` crate.
pub struct NotifyFileWatch;

impl NotifyFileWatch {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NotifyFileWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl FileWatch for NotifyFileWatch {
    fn watch(&mut self, paths: &[PathBuf]) -> Receiver<ChangeEvent> {
        use notify::{EventKind, RecursiveMode, Watcher};

        let (tx, rx) = mpsc::channel();
        let paths = paths.to_vec();

        thread::spawn(move || {
            let (raw_tx, raw_rx) = mpsc::channel();
            let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let _ = raw_tx.send(res);
            }) {
                Ok(w) => w,
                Err(e) => {
                    warn!(error = %e, "failed to create file watcher");
                    return;
                }
            };

            for path in &paths {
                if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
                    warn!(error = %e, path = %path.display(), "failed to watch path");
                }
            }

            for res in raw_rx {
                let event = match res {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(error = %e, "file watcher error");
                        continue;
                    }
                };
                let kind = match event.kind {
                    EventKind::Create(_) => ChangeKind::Created,
                    EventKind::Modify(_) => ChangeKind::Modified,
                    EventKind::Remove(_) => ChangeKind::Deleted,
                    _ => continue,
                };
                for path in event.paths {
                    if tx.send(ChangeEvent { path, kind }).is_err() {
                        return;
                    }
                }
            }
        });

        rx
    }
}

/// In-memory fake for tests: events are injected via `sender()`.
pub struct FakeFileWatch {
    tx: Option<Sender<ChangeEvent>>,
    rx: Option<Receiver<ChangeEvent>>,
}

impl FakeFileWatch {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }

    pub fn sender(&self) -> Sender<ChangeEvent> {
        self.tx.clone().expect("sender available before first watch() call")
    }
}

impl Default for FakeFileWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl FileWatch for FakeFileWatch {
    fn watch(&mut self, _paths: &[PathBuf]) -> Receiver<ChangeEvent> {
        self.rx.take().expect("FakeFileWatch::watch called more than once")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_watch_delivers_injected_events() {
        let mut fake = FakeFileWatch::new();
        let sender = fake.sender();
        let rx = fake.watch(&[PathBuf::from("in.txt")]);
        sender
            .send(ChangeEvent {
                path: PathBuf::from("in.txt"),
                kind: ChangeKind::Modified,
            })
            .unwrap();
        let event = rx.recv().unwrap();
        assert_eq!(event.path, Path::new("in.txt"));
        assert_eq!(event.kind, ChangeKind::Modified);
    }
}
