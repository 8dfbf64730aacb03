//! Pipeline parameters: schema, values and the resolver

use crate::core::error::{PipelineError, Result};
use crate::core::template::{self, Reference};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Declared type of a parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Array,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::String => f.write_str("string"),
            ParamType::Array => f.write_str("array"),
        }
    }
}

/// A concrete parameter value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    String(#[serde(deserialize_with = "scalar_to_string")] String),
    Array(Vec<String>),
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::String(_) => ParamType::String,
            ParamValue::Array(_) => ParamType::Array,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            ParamValue::Array(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::String(s) => f.write_str(s),
            ParamValue::Array(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::String(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::String(s)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(items: Vec<String>) -> Self {
        ParamValue::Array(items)
    }
}

/// YAML authors write `default: 3` or `default: true`; keep those as strings
fn scalar_to_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        String(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::String(s) => s,
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Bool(b) => b.to_string(),
    })
}

/// A declared pipeline parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,

    #[serde(rename = "type", default)]
    pub param_type: ParamType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParamValue>,
}

impl ParameterSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: ParamType::String,
            description: None,
            default: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<ParamValue>) -> Self {
        let value = value.into();
        self.param_type = value.param_type();
        self.default = Some(value);
        self
    }
}

/// The ordered set of parameters a pipeline declares
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSchema {
    params: Vec<ParameterSpec>,
}

impl ParameterSchema {
    pub fn new(params: Vec<ParameterSpec>) -> Self {
        Self { params }
    }

    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Fully resolved parameter set for one run
pub type ResolvedParams = BTreeMap<String, ParamValue>;

/// Resolves parameter values and performs `$(params.X)` substitution
pub struct ParameterResolver;

impl ParameterResolver {
    /// Resolve every declared parameter: override, else default, else error.
    ///
    /// A string override for an array parameter is split on commas, which is
    /// how values arrive from the command line.
    pub fn resolve(
        schema: &ParameterSchema,
        overrides: &BTreeMap<String, ParamValue>,
    ) -> Result<ResolvedParams> {
        for name in overrides.keys() {
            if schema.get(name).is_none() {
                warn!("Ignoring override for undeclared parameter '{}'", name);
            }
        }

        let mut resolved = ResolvedParams::new();
        for spec in schema.iter() {
            let value = match (overrides.get(&spec.name), &spec.default) {
                (Some(value), _) => Self::coerce(spec, value.clone())?,
                (None, Some(default)) => Self::coerce(spec, default.clone())?,
                (None, None) => {
                    return Err(PipelineError::MissingRequiredParameter(spec.name.clone()))
                }
            };
            resolved.insert(spec.name.clone(), value);
        }

        Ok(resolved)
    }

    fn coerce(spec: &ParameterSpec, value: ParamValue) -> Result<ParamValue> {
        match (spec.param_type, value) {
            (ParamType::String, ParamValue::String(s)) => Ok(ParamValue::String(s)),
            (ParamType::Array, ParamValue::Array(items)) => Ok(ParamValue::Array(items)),
            (ParamType::Array, ParamValue::String(s)) => Ok(ParamValue::Array(
                s.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
            (ParamType::String, ParamValue::Array(_)) => Err(PipelineError::ParameterTypeMismatch {
                name: spec.name.clone(),
                expected: ParamType::String.to_string(),
            }),
        }
    }

    /// Replace `$(params.X)` and `$(params.X[*])` references in `text`.
    ///
    /// Follows the rules task commands are expanded with: `[*]` on an array
    /// joins its items with spaces, and a bare reference to an array is a type
    /// mismatch. Substitution is a single lexical pass, so substituted values
    /// are never re-scanned. References outside the `params` namespace are kept
    /// verbatim.
    pub fn substitute(text: &str, params: &ResolvedParams) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        for token in template::tokenize(text) {
            match token {
                template::Token::Text(t) => out.push_str(t),
                template::Token::Ref { raw, expr } => match Reference::parse(expr) {
                    Some(Reference::Param { name, expand_all }) => match params.get(&name) {
                        Some(ParamValue::String(value)) => out.push_str(value),
                        Some(ParamValue::Array(items)) if expand_all => out.push_str(&items.join(" ")),
                        Some(ParamValue::Array(_)) => {
                            return Err(PipelineError::ParameterTypeMismatch {
                                name,
                                expected: ParamType::String.to_string(),
                            })
                        }
                        None => return Err(PipelineError::UnresolvedReference(expr.to_string())),
                    },
                    _ => out.push_str(raw),
                },
            }
        }
        Ok(out)
    }
}
