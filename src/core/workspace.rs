use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::fs;
use uuid::Uuid;

use crate::{
    constants::BINARY_NAME,
    core::domain::{CommandPaths, LanguageStrategy},
};

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Failed to create workspace directory {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("Failed to write source file {path}: {source}")]
    WriteSource { path: PathBuf, source: io::Error },
    #[error("Failed to scan workspace root {path}: {source}")]
    Scan { path: PathBuf, source: io::Error },
}

/// Hands out request-scoped directories under a common root and keeps
/// track of the ones still alive.
#[derive(Clone, Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    active: Arc<DashMap<Uuid, PathBuf>>,
}

impl WorkspaceManager {
    pub fn new<T: AsRef<Path>>(root: T) -> Self {
        Self {
            root: root.as_ref().into(),
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Creates a fresh directory and writes `source_code` into it under the
    /// strategy's file name.
    #[tracing::instrument(skip(self, strategy, source_code), fields(language = %strategy.language))]
    pub async fn acquire(
        &self,
        strategy: &LanguageStrategy,
        source_code: &str,
    ) -> Result<Workspace, WorkspaceError> {
        let id = Uuid::new_v4();
        let dir = self.root.join(id.to_string());

        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| WorkspaceError::Create {
                path: self.root.clone(),
                source,
            })?;
        // create_dir (not create_dir_all) fails if the directory already exists
        fs::create_dir(&dir)
            .await
            .map_err(|source| WorkspaceError::Create {
                path: dir.clone(),
                source,
            })?;

        self.active.insert(id, dir.clone());
        let workspace = Workspace {
            id,
            source_path: dir.join(strategy.source_file_name),
            binary_path: dir.join(BINARY_NAME),
            dir,
            created_at: Utc::now(),
            active: self.active.clone(),
            released: false,
        };

        fs::write(&workspace.source_path, source_code)
            .await
            .map_err(|source| WorkspaceError::WriteSource {
                path: workspace.source_path.clone(),
                source,
            })?;

        tracing::debug!(workspace = %workspace.id, dir = %workspace.dir.display(), "Workspace acquired");
        Ok(workspace)
    }

    pub async fn release(&self, workspace: Workspace) {
        workspace.release().await;
    }

    /// Removes directories under the root that no live workspace owns,
    /// e.g. leftovers of a process that was killed mid-request.
    pub async fn sweep(&self) -> Result<usize, WorkspaceError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(WorkspaceError::Scan {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| WorkspaceError::Scan {
                path: self.root.clone(),
                source,
            })?
        {
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            else {
                continue;
            };
            if self.active.contains_key(&id) {
                continue;
            }

            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(
                    path = %entry.path().display(),
                    error = %e,
                    "Failed to remove stale workspace"
                ),
            }
        }

        if removed > 0 {
            tracing::info!(removed, root = %self.root.display(), "Removed stale workspaces");
        }
        Ok(removed)
    }
}

/// An exclusively owned scratch directory. Dropping it without calling
/// [`Workspace::release`] still removes the directory.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    dir: PathBuf,
    source_path: PathBuf,
    binary_path: PathBuf,
    created_at: DateTime<Utc>,
    active: Arc<DashMap<Uuid, PathBuf>>,
    released: bool,
}

impl Workspace {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[cfg(test)]
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn command_paths(&self) -> CommandPaths<'_> {
        CommandPaths {
            source: &self.source_path,
            binary: &self.binary_path,
            dir: &self.dir,
        }
    }

    pub async fn release(mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::error!(
                    workspace = %self.id,
                    error = %e,
                    "Failed to remove workspace"
                );
            }
        }
        self.active.remove(&self.id);
        self.released = true;

        let age_ms = (Utc::now() - self.created_at).num_milliseconds();
        tracing::debug!(workspace = %self.id, age_ms, "Workspace released");
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::error!(workspace = %self.id, error = %e, "Failed to remove dropped workspace");
            }
        }
        self.active.remove(&self.id);
    }
}
