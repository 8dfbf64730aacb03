//! `$(...)` reference parsing and argument templates
//!
//! Task arguments are expanded in two stages. At instantiation time every
//! parameter, workspace, result-path and context reference is replaced with
//! text; only `$(tasks.T.results.R)` references survive as [`Segment::TaskResult`]
//! placeholders, which are filled from the producing task's results when the
//! consuming task is launched. Both stages are single lexical passes.

use crate::core::error::{PipelineError, Result};
use regex::Regex;
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\(([^()\s]+)\)").expect("reference pattern is valid"));

/// A lexical token of a template string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    Text(&'a str),
    /// `raw` is the full `$(...)` text, `expr` the part between the parentheses
    Ref { raw: &'a str, expr: &'a str },
}

/// Split `input` into literal text and `$(...)` references
pub fn tokenize(input: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut last = 0;

    for caps in REFERENCE.captures_iter(input) {
        let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if whole.start() > last {
            tokens.push(Token::Text(&input[last..whole.start()]));
        }
        tokens.push(Token::Ref {
            raw: whole.as_str(),
            expr: expr.as_str(),
        });
        last = whole.end();
    }

    if last < input.len() {
        tokens.push(Token::Text(&input[last..]));
    }

    tokens
}

/// A parsed reference expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `params.NAME` or `params.NAME[*]`
    Param { name: String, expand_all: bool },
    /// `workspaces.NAME.path`
    Workspace { name: String },
    /// `results.NAME.path`
    ResultPath { name: String },
    /// `tasks.TASK.results.NAME`
    TaskResult { task: String, result: String },
    /// `context.*`
    Context(String),
}

impl Reference {
    pub fn parse(expr: &str) -> Option<Self> {
        let (namespace, rest) = expr.split_once('.')?;
        if rest.is_empty() {
            return None;
        }

        match namespace {
            "params" => match rest.strip_suffix("[*]") {
                Some(name) => Some(Reference::Param {
                    name: name.to_string(),
                    expand_all: true,
                }),
                None => Some(Reference::Param {
                    name: rest.to_string(),
                    expand_all: false,
                }),
            },
            "workspaces" => rest.strip_suffix(".path").map(|name| Reference::Workspace {
                name: name.to_string(),
            }),
            "results" => rest.strip_suffix(".path").map(|name| Reference::ResultPath {
                name: name.to_string(),
            }),
            "tasks" => rest
                .split_once(".results.")
                .map(|(task, result)| Reference::TaskResult {
                    task: task.to_string(),
                    result: result.to_string(),
                }),
            "context" => Some(Reference::Context(rest.to_string())),
            _ => None,
        }
    }
}

/// All task-result references in `input`, as `(task, result)` pairs
pub fn task_result_refs(input: &str) -> Vec<(String, String)> {
    tokenize(input)
        .into_iter()
        .filter_map(|token| match token {
            Token::Ref { expr, .. } => match Reference::parse(expr) {
                Some(Reference::TaskResult { task, result }) => Some((task, result)),
                _ => None,
            },
            Token::Text(_) => None,
        })
        .collect()
}

/// If `input` consists of exactly one reference, return it
pub fn whole_reference(input: &str) -> Option<(String, Reference)> {
    match tokenize(input).as_slice() {
        [Token::Ref { expr, .. }] => Reference::parse(expr).map(|r| (expr.to_string(), r)),
        _ => None,
    }
}

/// Piece of a partially expanded template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    TaskResult { task: String, result: String },
}

/// A string with late-bound task-result placeholders
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn literal(text: impl Into<String>) -> Self {
        let mut template = Template::default();
        template.push_text(&text.into());
        template
    }

    /// Expand `input`, asking `resolve` for the replacement of each reference
    pub fn expand<F>(input: &str, mut resolve: F) -> Result<Self>
    where
        F: FnMut(&str, Reference) -> Result<Template>,
    {
        let mut template = Template::default();
        for token in tokenize(input) {
            match token {
                Token::Text(text) => template.push_text(text),
                Token::Ref { expr, .. } => {
                    let reference = Reference::parse(expr)
                        .ok_or_else(|| PipelineError::UnresolvedReference(expr.to_string()))?;
                    template.append(resolve(expr, reference)?);
                }
            }
        }
        Ok(template)
    }

    pub fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Segment::Text(last)) = self.segments.last_mut() {
            last.push_str(text);
        } else {
            self.segments.push(Segment::Text(text.to_string()));
        }
    }

    pub fn push_task_result(&mut self, task: &str, result: &str) {
        self.segments.push(Segment::TaskResult {
            task: task.to_string(),
            result: result.to_string(),
        });
    }

    pub fn append(&mut self, other: Template) {
        for segment in other.segments {
            match segment {
                Segment::Text(text) => self.push_text(&text),
                Segment::TaskResult { task, result } => self.push_task_result(&task, &result),
            }
        }
    }

    /// Tasks whose results this template waits on
    pub fn result_dependencies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.segments.iter().filter_map(|s| match s {
            Segment::TaskResult { task, result } => Some((task.as_str(), result.as_str())),
            Segment::Text(_) => None,
        })
    }

    /// Fill task-result placeholders and produce the final string
    pub fn render<F>(&self, lookup: F) -> Result<String>
    where
        F: Fn(&str, &str) -> Option<String>,
    {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::TaskResult { task, result } => match lookup(task, result) {
                    Some(value) => out.push_str(&value),
                    None => {
                        return Err(PipelineError::UnresolvedReference(format!(
                            "tasks.{}.results.{}",
                            task, result
                        )))
                    }
                },
            }
        }
        Ok(out)
    }
}
