//! Pipeline configuration from YAML

use crate::core::error::{PipelineError, Result};
use crate::core::params::{ParamValue, ParameterSpec};
use crate::core::PipelineDefinition;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;
use std::sync::LazyLock;

/// DNS-1123 label, as Tekton requires for task and workspace names
static LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("label pattern is valid")
});

/// Tekton result names also allow upper case, `_` and `.`
static RESULT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").expect("result name pattern is valid")
});

const MAX_LABEL_LEN: usize = 63;

/// Check a task or workspace name.
///
/// These names become directory names under a run's directory, so anything
/// other than a single plain path component is rejected.
pub fn check_label(what: &str, name: &str) -> Result<()> {
    if name.len() <= MAX_LABEL_LEN && LABEL.is_match(name) {
        return Ok(());
    }
    Err(PipelineError::InvalidDefinition(format!(
        "{} name '{}' must be at most {} lowercase letters, digits or '-', starting and ending with a letter or digit",
        what, name, MAX_LABEL_LEN
    )))
}

/// Check a result name declared by a task kind; results are files in the task's results directory
pub fn check_result_name(kind: &str, name: &str) -> Result<()> {
    if RESULT_NAME.is_match(name) {
        return Ok(());
    }
    Err(PipelineError::InvalidDefinition(format!(
        "task kind '{}' declares result '{}', which is not a valid result name",
        kind, name
    )))
}

/// Top-level pipeline document
///
/// Accepts either the flat form (`name`, `params`, `tasks`, ...) or a
/// Tekton-style manifest with `metadata.name` and a `spec` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Workspaces shared by the pipeline's tasks
    #[serde(default)]
    pub workspaces: Vec<WorkspaceConfig>,

    /// Parameter schema
    #[serde(default)]
    pub params: Vec<ParameterSpec>,

    /// Pipeline tasks
    pub tasks: Vec<TaskConfig>,
}

/// A declared pipeline workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Task entry as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    /// Unique task name
    pub name: String,

    /// Which task kind executes this task
    pub task_ref: TaskRefConfig,

    /// Tasks that must succeed before this one starts
    #[serde(default)]
    pub run_after: Vec<String>,

    #[serde(default)]
    pub params: Vec<ParamBindingConfig>,

    #[serde(default)]
    pub workspaces: Vec<WorkspaceBindingConfig>,

    /// Timeout for this task (overrides the engine default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// `taskRef: git-clone` or `taskRef: { name: git-clone, kind: ClusterTask }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskRefConfig {
    Name(String),
    Ref {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
}

impl TaskRefConfig {
    pub fn name(&self) -> &str {
        match self {
            TaskRefConfig::Name(name) => name,
            TaskRefConfig::Ref { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamBindingConfig {
    pub name: String,
    pub value: ParamValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceBindingConfig {
    /// Workspace name as the task kind knows it
    pub name: String,
    /// Pipeline workspace it maps to
    pub workspace: String,
}

/// `spec` block of a Tekton-style manifest
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestSpec {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    workspaces: Vec<WorkspaceConfig>,
    #[serde(default)]
    params: Vec<ParameterSpec>,
    tasks: Vec<TaskConfig>,
}

#[derive(Debug, Deserialize)]
struct ManifestMetadata {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    kind: String,
    metadata: ManifestMetadata,
    spec: ManifestSpec,
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(yaml)?;

        let config = if value.get("spec").is_some() && value.get("kind").is_some() {
            let manifest: Manifest = serde_yaml::from_value(value)?;
            if manifest.kind != "Pipeline" {
                return Err(PipelineError::InvalidDefinition(format!(
                    "expected a manifest of kind 'Pipeline', found '{}'",
                    manifest.kind
                )));
            }
            PipelineConfig {
                name: manifest.metadata.name,
                description: manifest.spec.description,
                workspaces: manifest.spec.workspaces,
                params: manifest.spec.params,
                tasks: manifest.spec.tasks,
            }
        } else {
            serde_yaml::from_value(value)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Shape checks that do not need the dependency graph
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::InvalidDefinition(
                "pipeline name must not be empty".to_string(),
            ));
        }

        let mut seen_params = std::collections::HashSet::new();
        for param in &self.params {
            if !seen_params.insert(&param.name) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "duplicate parameter '{}'",
                    param.name
                )));
            }
            if let Some(default) = &param.default {
                if default.param_type() != param.param_type {
                    return Err(PipelineError::ParameterTypeMismatch {
                        name: param.name.clone(),
                        expected: param.param_type.to_string(),
                    });
                }
            }
        }

        let mut seen_workspaces = std::collections::HashSet::new();
        for workspace in &self.workspaces {
            check_label("workspace", &workspace.name)?;
            if !seen_workspaces.insert(&workspace.name) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "duplicate workspace '{}'",
                    workspace.name
                )));
            }
        }

        for task in &self.tasks {
            check_label("task", &task.name)?;
            for binding in &task.workspaces {
                if !seen_workspaces.contains(&binding.workspace) {
                    return Err(PipelineError::UnknownWorkspace {
                        task: task.name.clone(),
                        workspace: binding.workspace.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Convert config to a validated pipeline definition
    pub fn to_definition(&self) -> Result<PipelineDefinition> {
        PipelineDefinition::from_config(self)
    }
}
