//! Binding a task to its kind and rendering the final command line
//!
//! [`PreparedTask::prepare`] runs when a run is instantiated. It checks the
//! task's bindings against its kind and expands every reference except
//! `$(tasks.T.results.R)`. [`PreparedTask::render`] runs at launch and fills
//! those from the producing tasks' recorded results.

use crate::core::error::{PipelineError, Result};
use crate::core::params::{ParamType, ParamValue, ResolvedParams};
use crate::core::pipeline::{BindingValue, PipelineDefinition, TaskSpec};
use crate::core::template::{self, Reference, Template};
use crate::registry::{ExecutableUnitDescriptor, TaskKind, TaskRegistry};
use crate::workspace::WorkspacePlan;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Everything a task needs from its run to be prepared
pub struct PrepareContext<'a> {
    pub run_id: Uuid,
    pub definition: &'a PipelineDefinition,
    pub registry: &'a TaskRegistry,
    pub params: &'a ResolvedParams,
    pub plan: &'a WorkspacePlan,
}

/// A fully rendered command, ready for a [`TaskRunner`](crate::registry::TaskRunner)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub run_id: Uuid,
    pub task: String,
    pub kind: TaskKind,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Directory the task writes its result files into
    pub results_dir: PathBuf,
    /// Result names the kind declares
    pub results: Vec<String>,
    pub timeout: Option<Duration>,
}

/// A task whose bindings have been checked and expanded, apart from
/// references to other tasks' results
#[derive(Debug, Clone)]
pub struct PreparedTask {
    pub task: String,
    pub kind: TaskKind,
    command: Vec<Template>,
    working_dir: Option<Template>,
    env: Vec<(String, Template)>,
    results: Vec<String>,
    results_dir: PathBuf,
    timeout: Option<Duration>,
}

/// A task-kind input after pipeline-level expansion
#[derive(Debug, Clone)]
enum Bound {
    String(Template),
    Array(Vec<Template>),
}

/// Reference resolution for a single task
struct Scope<'a> {
    ctx: &'a PrepareContext<'a>,
    spec: &'a TaskSpec,
    descriptor: &'a ExecutableUnitDescriptor,
    workspaces: BTreeMap<String, PathBuf>,
    results_dir: PathBuf,
    bound: BTreeMap<String, Bound>,
}

impl PreparedTask {
    pub fn prepare(spec: &TaskSpec, ctx: &PrepareContext<'_>) -> Result<Self> {
        let descriptor = ctx.registry.resolve(&spec.kind)?;

        for binding in &spec.params {
            if descriptor.param(&binding.name).is_none() {
                return Err(PipelineError::UnknownTaskParameter {
                    task: spec.name.clone(),
                    param: binding.name.clone(),
                });
            }
        }

        let mut workspaces = BTreeMap::new();
        for binding in &spec.workspaces {
            let path = ctx.plan.workspace_path(&binding.workspace).ok_or_else(|| {
                PipelineError::UnknownWorkspace {
                    task: spec.name.clone(),
                    workspace: binding.workspace.clone(),
                }
            })?;
            workspaces.insert(binding.name.clone(), path.to_path_buf());
        }
        if let Some(missing) = descriptor
            .workspaces
            .iter()
            .find(|w| !workspaces.contains_key(*w))
        {
            return Err(PipelineError::UnboundWorkspace {
                task: spec.name.clone(),
                workspace: missing.clone(),
            });
        }

        let mut scope = Scope {
            ctx,
            spec,
            descriptor,
            workspaces,
            results_dir: ctx.plan.results_dir(&spec.name),
            bound: BTreeMap::new(),
        };
        scope.bind_params()?;

        let mut command = Vec::with_capacity(descriptor.command.len());
        for arg in &descriptor.command {
            match template::whole_reference(arg) {
                Some((
                    _,
                    Reference::Param {
                        name,
                        expand_all: true,
                    },
                )) => match scope.bound.get(&name) {
                    Some(Bound::Array(items)) => command.extend(items.iter().cloned()),
                    Some(Bound::String(value)) => command.push(value.clone()),
                    None => return Err(PipelineError::UnresolvedReference(format!("params.{}[*]", name))),
                },
                _ => command.push(Template::expand(arg, |expr, r| scope.task_ref(expr, r))?),
            }
        }

        let working_dir = descriptor
            .working_dir
            .as_deref()
            .map(|dir| Template::expand(dir, |expr, r| scope.task_ref(expr, r)))
            .transpose()?;

        let env = descriptor
            .env
            .iter()
            .map(|(key, value)| {
                Template::expand(value, |expr, r| scope.task_ref(expr, r)).map(|t| (key.clone(), t))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(PreparedTask {
            task: spec.name.clone(),
            kind: spec.kind.clone(),
            command,
            working_dir,
            env,
            results: descriptor.results.clone(),
            results_dir: scope.results_dir,
            timeout: spec.timeout_secs.map(Duration::from_secs),
        })
    }

    /// Fill result placeholders and produce the invocation.
    ///
    /// `lookup(task, result)` returns the recorded value of a producer's result.
    pub fn render<F>(&self, run_id: Uuid, lookup: F) -> Result<Invocation>
    where
        F: Fn(&str, &str) -> Option<String>,
    {
        let mut argv = self
            .command
            .iter()
            .map(|arg| arg.render(&lookup))
            .collect::<Result<Vec<_>>>()?
            .into_iter();

        let program = argv.next().ok_or_else(|| {
            PipelineError::InvalidDefinition(format!(
                "task '{}' expands to an empty command",
                self.task
            ))
        })?;

        let working_dir = self
            .working_dir
            .as_ref()
            .map(|dir| dir.render(&lookup).map(PathBuf::from))
            .transpose()?;

        let env = self
            .env
            .iter()
            .map(|(key, value)| value.render(&lookup).map(|v| (key.clone(), v)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Invocation {
            run_id,
            task: self.task.clone(),
            kind: self.kind.clone(),
            program,
            args: argv.collect(),
            working_dir,
            env,
            results_dir: self.results_dir.clone(),
            results: self.results.clone(),
            timeout: self.timeout,
        })
    }

    /// Producing tasks whose results this task consumes at launch
    pub fn result_dependencies(&self) -> Vec<(&str, &str)> {
        self.command
            .iter()
            .chain(self.working_dir.iter())
            .chain(self.env.iter().map(|(_, t)| t))
            .flat_map(|t| t.result_dependencies())
            .collect()
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Scope<'_> {
    /// Resolve every input the kind declares: binding, else default
    fn bind_params(&mut self) -> Result<()> {
        for param in &self.descriptor.params {
            let bound = match (self.spec.binding(&param.name), &param.default) {
                (Some(binding), _) => self.bind_value(&binding.value)?,
                (None, Some(ParamValue::String(value))) => Bound::String(Template::literal(value)),
                (None, Some(ParamValue::Array(items))) => {
                    Bound::Array(items.iter().map(Template::literal).collect())
                }
                (None, None) => {
                    return Err(PipelineError::MissingRequiredParameter(format!(
                        "{}.{}",
                        self.spec.name, param.name
                    )))
                }
            };

            let bound = match (param.param_type, bound) {
                (ParamType::String, Bound::Array(_)) => {
                    return Err(PipelineError::ParameterTypeMismatch {
                        name: format!("{}.{}", self.spec.name, param.name),
                        expected: ParamType::String.to_string(),
                    })
                }
                (ParamType::Array, Bound::String(value)) => Bound::Array(vec![value]),
                (_, bound) => bound,
            };
            self.bound.insert(param.name.clone(), bound);
        }
        Ok(())
    }

    fn bind_value(&self, value: &BindingValue) -> Result<Bound> {
        match value {
            BindingValue::String(text) => match self.whole_array_param(text) {
                Some(items) => Ok(Bound::Array(items)),
                None => Ok(Bound::String(self.expand_pipeline(text)?)),
            },
            BindingValue::Array(texts) => {
                let mut items = Vec::new();
                for text in texts {
                    match self.whole_array_param(text) {
                        Some(expanded) => items.extend(expanded),
                        None => items.push(self.expand_pipeline(text)?),
                    }
                }
                Ok(Bound::Array(items))
            }
        }
    }

    /// `$(params.X)` or `$(params.X[*])` standing alone and naming an array parameter
    fn whole_array_param(&self, text: &str) -> Option<Vec<Template>> {
        match template::whole_reference(text)? {
            (_, Reference::Param { name, .. }) => match self.ctx.params.get(&name)? {
                ParamValue::Array(items) => Some(items.iter().map(Template::literal).collect()),
                ParamValue::String(_) => None,
            },
            _ => None,
        }
    }

    fn expand_pipeline(&self, text: &str) -> Result<Template> {
        Template::expand(text, |expr, r| self.pipeline_ref(expr, r))
    }

    /// References allowed in a pipeline's task bindings
    fn pipeline_ref(&self, expr: &str, reference: Reference) -> Result<Template> {
        match reference {
            Reference::Param {
                name,
                expand_all: false,
            } => match self.ctx.params.get(&name) {
                Some(ParamValue::String(value)) => Ok(Template::literal(value)),
                Some(ParamValue::Array(_)) => Err(PipelineError::ParameterTypeMismatch {
                    name,
                    expected: ParamType::String.to_string(),
                }),
                None => Err(PipelineError::UnresolvedReference(expr.to_string())),
            },
            Reference::TaskResult { task, result } => {
                let producer = self
                    .ctx
                    .definition
                    .task(&task)
                    .ok_or_else(|| PipelineError::UnresolvedReference(expr.to_string()))?;
                if !self.ctx.registry.resolve(&producer.kind)?.declares_result(&result) {
                    return Err(PipelineError::UnresolvedReference(expr.to_string()));
                }
                let mut template = Template::default();
                template.push_task_result(&task, &result);
                Ok(template)
            }
            Reference::Context(key) => self.context(expr, &key),
            _ => Err(PipelineError::UnresolvedReference(expr.to_string())),
        }
    }

    /// References allowed in a task kind's command, working directory and env
    fn task_ref(&self, expr: &str, reference: Reference) -> Result<Template> {
        match reference {
            Reference::Param { name, expand_all } => match self.bound.get(&name) {
                Some(Bound::String(value)) => Ok(value.clone()),
                Some(Bound::Array(items)) if expand_all => {
                    let mut joined = Template::default();
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            joined.push_text(" ");
                        }
                        joined.append(item.clone());
                    }
                    Ok(joined)
                }
                Some(Bound::Array(_)) => Err(PipelineError::ParameterTypeMismatch {
                    name: format!("{}.{}", self.spec.name, name),
                    expected: ParamType::String.to_string(),
                }),
                None => Err(PipelineError::UnresolvedReference(expr.to_string())),
            },
            Reference::Workspace { name } => self
                .workspaces
                .get(&name)
                .map(|path| Template::literal(path.display().to_string()))
                .ok_or_else(|| PipelineError::UnresolvedReference(expr.to_string())),
            Reference::ResultPath { name } if self.descriptor.declares_result(&name) => Ok(
                Template::literal(self.results_dir.join(&name).display().to_string()),
            ),
            Reference::Context(key) => self.context(expr, &key),
            _ => Err(PipelineError::UnresolvedReference(expr.to_string())),
        }
    }

    fn context(&self, expr: &str, key: &str) -> Result<Template> {
        let value = match key {
            "pipelineRun.name" | "pipelineRun.uid" => self.ctx.run_id.to_string(),
            "pipeline.name" => self.ctx.definition.name.clone(),
            "pipelineTask.name" => self.spec.name.clone(),
            _ => return Err(PipelineError::UnresolvedReference(expr.to_string())),
        };
        Ok(Template::literal(value))
    }
}
