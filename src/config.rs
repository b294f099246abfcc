//! Workspace loading from YAML / JSON documents on disk.

use crate::catalog::Workspace;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Loads [`Workspace`] documents from files and directories.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkspaceLoader;

impl WorkspaceLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a file or, for a directory, merge every workspace file in
    /// it.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Workspace> {
        let path = path.as_ref();
        if path.is_dir() {
            self.load_dir(path)
        } else {
            self.load_file(path)
        }
    }

    /// Load a single workspace document.
    ///
    /// `.json` files are parsed as JSON, everything else as YAML.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Workspace> {
        let path = path.as_ref();
        info!("Loading workspace from {}", path.display());

        let content = fs::read_to_string(path).context(format!(
            "Failed to read workspace file: {}",
            path.display()
        ))?;

        let parsed = if is_json(path) {
            Workspace::from_json(&content)
        } else {
            Workspace::from_yaml(&content)
        };
        let workspace = parsed.context(format!(
            "Failed to load workspace from {}",
            path.display()
        ))?;

        debug!(
            "Loaded {} endpoints, {} environments, {} flows from {}",
            workspace.endpoints.len(),
            workspace.environments.len(),
            workspace.flows.len(),
            path.display()
        );
        Ok(workspace)
    }

    /// Merge every workspace file in `dir`, in file-name order. Files
    /// that fail to parse are skipped with a warning.
    pub fn load_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Workspace> {
        let dir = dir.as_ref();
        info!("Loading workspace directory: {}", dir.display());

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).context(format!(
            "Failed to read directory: {}",
            dir.display()
        ))? {
            let path = entry?.path();
            if path.is_file() && is_workspace_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut workspace = Workspace::default();
        let mut loaded = 0;
        for path in &paths {
            match self.load_file(path) {
                Ok(part) => {
                    workspace.merge(part);
                    loaded += 1;
                }
                Err(err) => {
                    warn!("Skipping {}: {:#}", path.display(), err);
                }
            }
        }

        info!("Loaded {} workspace files from {}", loaded, dir.display());
        Ok(workspace)
    }
}

/// Return `true` for `.yaml`, `.yml` and `.json` files.
pub fn is_workspace_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}
