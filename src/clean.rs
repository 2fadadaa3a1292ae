//! Clean-mode tree walker — an external collaborator per spec §1. The
//! core's job ends at knowing which files a graph produces; actually
//! walking and removing them is out of scope for this specification and
//! is implemented here only as a thin pass-through so the CLI surface in
//! §6 has somewhere to land.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::graph::Graph;

/// Remove every file this graph's tasks produce. Best-effort: a missing
/// output is not an error (it may already be clean).
pub fn clean_outputs(graph: &Graph, dry_run: bool) -> Result<usize> {
    let mut removed = 0;
    for task_id in graph.task_ids() {
        for &file_id in graph.outputs(task_id) {
            let path = &graph.file(file_id).path;
            if !path.exists() {
                continue;
            }
            if dry_run {
                info!(path = %path.display(), "would remove");
            } else {
                remove(path)?;
                info!(path = %path.display(), "removed");
            }
            removed += 1;
        }
    }
    Ok(removed)
}

fn remove(path: &Path) -> Result<()> {
    std::fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))
}
