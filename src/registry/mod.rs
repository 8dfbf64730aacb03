//! Task registry: resolves task kinds to executable unit descriptors

pub mod builtin;
pub mod invocation;
pub mod runner;

pub use invocation::{Invocation, PreparedTask};
pub use runner::{ProcessRunner, TaskError, TaskOutput, TaskRunner};

use crate::core::config::check_result_name;
use crate::core::error::{PipelineError, Result};
use crate::core::params::ParameterSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// The kind of executable unit a task refers to
///
/// Well-known kinds are variants; anything else (catalog entries, test
/// fakes) is `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    GitClone,
    Flake8,
    Nose,
    Buildah,
    OpenshiftClient,
    Custom(String),
}

impl TaskKind {
    pub fn name(&self) -> &str {
        match self {
            TaskKind::GitClone => "git-clone",
            TaskKind::Flake8 => "flake8",
            TaskKind::Nose => "nose",
            TaskKind::Buildah => "buildah",
            TaskKind::OpenshiftClient => "openshift-client",
            TaskKind::Custom(name) => name,
        }
    }
}

impl From<&str> for TaskKind {
    fn from(name: &str) -> Self {
        match name {
            "git-clone" => TaskKind::GitClone,
            "flake8" => TaskKind::Flake8,
            "nose" => TaskKind::Nose,
            "buildah" => TaskKind::Buildah,
            "openshift-client" => TaskKind::OpenshiftClient,
            other => TaskKind::Custom(other.to_string()),
        }
    }
}

impl From<String> for TaskKind {
    fn from(name: String) -> Self {
        TaskKind::from(name.as_str())
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        kind.name().to_string()
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a task kind expects and how to invoke it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutableUnitDescriptor {
    pub kind: TaskKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Container image the unit is normally packaged in (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Input parameters
    #[serde(default)]
    pub params: Vec<ParameterSpec>,

    /// Workspace names the unit expects to be bound
    #[serde(default)]
    pub workspaces: Vec<String>,

    /// Result names the unit may write under `$(results.NAME.path)`
    #[serde(default)]
    pub results: Vec<String>,

    /// Program and arguments; each element is a template
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl ExecutableUnitDescriptor {
    pub fn param(&self, name: &str) -> Option<&ParameterSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn declares_result(&self, name: &str) -> bool {
        self.results.iter().any(|r| r == name)
    }
}

/// A YAML file of additional task kinds
#[derive(Debug, Deserialize)]
struct Catalog {
    tasks: Vec<ExecutableUnitDescriptor>,
}

/// Registry of available task kinds
///
/// Constructed explicitly and passed to the engine, so tests can register
/// fake kinds without touching global state.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    descriptors: HashMap<TaskKind, ExecutableUnitDescriptor>,
}

impl TaskRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in task kinds
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for descriptor in builtin::descriptors() {
            registry.register(descriptor);
        }
        registry
    }

    /// Register a descriptor, replacing any previous one for the same kind
    pub fn register(&mut self, descriptor: ExecutableUnitDescriptor) {
        debug!("Registering task kind: {}", descriptor.kind);
        self.descriptors.insert(descriptor.kind.clone(), descriptor);
    }

    /// Resolve a task kind to its descriptor
    pub fn resolve(&self, kind: &TaskKind) -> Result<&ExecutableUnitDescriptor> {
        self.descriptors
            .get(kind)
            .ok_or_else(|| PipelineError::UnknownTaskKind(kind.to_string()))
    }

    /// Load additional kinds from a YAML catalog; returns how many were loaded
    pub fn load_catalog<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let count = self.load_catalog_yaml(&content)?;
        info!(
            "Loaded {} task kind(s) from {}",
            count,
            path.as_ref().display()
        );
        Ok(count)
    }

    pub fn load_catalog_yaml(&mut self, yaml: &str) -> Result<usize> {
        let catalog: Catalog = serde_yaml::from_str(yaml)?;
        let count = catalog.tasks.len();
        for descriptor in &catalog.tasks {
            if descriptor.command.is_empty() {
                return Err(PipelineError::InvalidDefinition(format!(
                    "task kind '{}' has an empty command",
                    descriptor.kind
                )));
            }
            for result in &descriptor.results {
                check_result_name(descriptor.kind.name(), result)?;
            }
        }
        for descriptor in catalog.tasks {
            self.register(descriptor);
        }
        Ok(count)
    }

    /// All registered kinds, sorted by name
    pub fn kinds(&self) -> Vec<&TaskKind> {
        let mut kinds: Vec<_> = self.descriptors.keys().collect();
        kinds.sort_by(|a, b| a.name().cmp(b.name()));
        kinds
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
