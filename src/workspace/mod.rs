//! Per-run workspace provisioning
//!
//! Every run gets its own directory under the workspace root:
//!
//! ```text
//! <root>/<run-id>/workspaces/<workspace>   ephemeral workspaces
//! <root>/<run-id>/results/<task>           result files written by each task
//! ```
//!
//! A workspace can instead be bound to an existing host directory, which is
//! used in place and never deleted.

use crate::core::error::{PipelineError, Result};
use crate::core::pipeline::PipelineDefinition;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where a workspace's storage comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceSource {
    /// Created for the run and removed with it
    Ephemeral(PathBuf),
    /// An existing directory supplied by the caller
    HostPath(PathBuf),
}

impl WorkspaceSource {
    pub fn path(&self) -> &Path {
        match self {
            WorkspaceSource::Ephemeral(path) | WorkspaceSource::HostPath(path) => path,
        }
    }
}

/// The directories a run will use, computed before anything is created
#[derive(Debug, Clone)]
pub struct WorkspacePlan {
    run_dir: PathBuf,
    workspaces: BTreeMap<String, WorkspaceSource>,
    tasks: Vec<String>,
}

impl WorkspacePlan {
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn workspace_path(&self, name: &str) -> Option<&Path> {
        self.workspaces.get(name).map(WorkspaceSource::path)
    }

    pub fn workspaces(&self) -> impl Iterator<Item = (&str, &WorkspaceSource)> {
        self.workspaces.iter().map(|(name, source)| (name.as_str(), source))
    }

    /// Directory a task writes its result files into
    pub fn results_dir(&self, task: &str) -> PathBuf {
        self.run_dir.join("results").join(task)
    }
}

/// Creates and releases run directories
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    retain: bool,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retain: false,
        }
    }

    /// `<cache dir>/taskline/runs`, falling back to the system temp dir
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("taskline")
            .join("runs")
    }

    /// Keep run directories after the run finishes
    pub fn with_retention(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the run's directories without touching the filesystem.
    ///
    /// `host_bindings` maps declared workspace names to existing directories.
    pub fn plan(
        &self,
        run_id: Uuid,
        definition: &PipelineDefinition,
        host_bindings: &BTreeMap<String, PathBuf>,
    ) -> Result<WorkspacePlan> {
        for name in host_bindings.keys() {
            if !definition.workspaces.iter().any(|w| &w.name == name) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "workspace binding '{}' names a workspace the pipeline does not declare",
                    name
                )));
            }
        }

        let run_dir = self.root.join(run_id.to_string());
        let workspaces = definition
            .workspaces
            .iter()
            .map(|decl| {
                let source = match host_bindings.get(&decl.name) {
                    Some(path) => WorkspaceSource::HostPath(path.clone()),
                    None => WorkspaceSource::Ephemeral(run_dir.join("workspaces").join(&decl.name)),
                };
                (decl.name.clone(), source)
            })
            .collect();

        Ok(WorkspacePlan {
            run_dir,
            workspaces,
            tasks: definition.tasks.iter().map(|t| t.name.clone()).collect(),
        })
    }

    /// Create the run's directories.
    ///
    /// The returned guard removes them when dropped, unless retention is on.
    pub async fn provision(&self, plan: &WorkspacePlan) -> Result<WorkspaceGuard> {
        // Guard first, so a partial provision is still cleaned up
        let guard = WorkspaceGuard {
            run_dir: plan.run_dir.clone(),
            retain: self.retain,
            released: false,
        };

        for (name, source) in plan.workspaces() {
            match source {
                WorkspaceSource::Ephemeral(path) => create_dir(path).await?,
                WorkspaceSource::HostPath(path) => {
                    let is_dir = tokio::fs::metadata(path)
                        .await
                        .map(|m| m.is_dir())
                        .unwrap_or(false);
                    if !is_dir {
                        return Err(PipelineError::WorkspaceProvisionFailed(format!(
                            "workspace '{}' is bound to {}, which is not a directory",
                            name,
                            path.display()
                        )));
                    }
                }
            }
            debug!("Workspace '{}' at {}", name, source.path().display());
        }

        for task in &plan.tasks {
            create_dir(&plan.results_dir(task)).await?;
        }

        info!("Provisioned run directory {}", plan.run_dir.display());
        Ok(guard)
    }
}

async fn create_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path).await.map_err(|e| {
        PipelineError::WorkspaceProvisionFailed(format!("{}: {}", path.display(), e))
    })
}

/// Releases a run directory on every exit path
#[derive(Debug)]
pub struct WorkspaceGuard {
    run_dir: PathBuf,
    retain: bool,
    released: bool,
}

impl WorkspaceGuard {
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Release now rather than at drop
    pub fn release(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if self.retain {
            info!("Retaining run directory {}", self.run_dir.display());
            return;
        }

        match std::fs::remove_dir_all(&self.run_dir) {
            Ok(()) => debug!("Removed run directory {}", self.run_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove run directory {}: {}",
                self.run_dir.display(),
                e
            ),
        }
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}
