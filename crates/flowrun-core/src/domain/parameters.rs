//! Declared parameters of a managed callable and their validation.
//!
//! Validation is a pure function from raw arguments to coerced values: it
//! applies defaults, coerces loosely typed inputs (numeric strings, `0`/`1`
//! booleans, whole floats) and reports every problem at once.

use crate::Parameters;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;
use thiserror::Error;

/// Declared type of a parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// Any JSON value
    Any,
    /// A string
    String,
    /// A signed 64-bit integer
    Integer,
    /// A floating point number
    Float,
    /// A boolean
    Boolean,
    /// An array whose elements all have the inner type
    Array(Box<ParamType>),
    /// A JSON object
    Object,
    /// `null` or the inner type
    Optional(Box<ParamType>),
}

impl ParamType {
    /// Array of `inner`
    pub fn array_of(inner: ParamType) -> Self {
        ParamType::Array(Box::new(inner))
    }

    /// Nullable `inner`
    pub fn optional(inner: ParamType) -> Self {
        ParamType::Optional(Box::new(inner))
    }

    /// Coerce `value` to this type
    pub fn coerce(&self, value: &Value) -> Result<Value, String> {
        self.coerce_at(value, "").map_err(|(_, reason)| reason)
    }

    fn coerce_at(&self, value: &Value, path: &str) -> Result<Value, (String, String)> {
        let mismatch = || (path.to_string(), format!("expected {}, got {}", self, value));

        match self {
            ParamType::Any => Ok(value.clone()),
            ParamType::String => match value {
                Value::String(_) => Ok(value.clone()),
                _ => Err(mismatch()),
            },
            ParamType::Integer => match value {
                Value::Number(n) if n.is_i64() => Ok(value.clone()),
                Value::Number(n) if n.is_u64() => Err(mismatch()),
                // i64::MAX rounds up to 2^63 as f64, so the upper bound is exclusive
                Value::Number(n) => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                        Ok(Value::Number(Number::from(f as i64)))
                    }
                    _ => Err(mismatch()),
                },
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(|i| Value::Number(Number::from(i)))
                    .map_err(|_| mismatch()),
                _ => Err(mismatch()),
            },
            ParamType::Float => match value {
                Value::Number(n) => n
                    .as_f64()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(mismatch),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
            ParamType::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Ok(Value::Bool(false)),
                    Some(1) => Ok(Value::Bool(true)),
                    _ => Err(mismatch()),
                },
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "yes" | "on" | "1" => Ok(Value::Bool(true)),
                    "false" | "no" | "off" | "0" => Ok(Value::Bool(false)),
                    _ => Err(mismatch()),
                },
                _ => Err(mismatch()),
            },
            ParamType::Array(inner) => match value {
                Value::Array(items) => items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| inner.coerce_at(item, &format!("{}[{}]", path, i)))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array),
                _ => Err(mismatch()),
            },
            ParamType::Object => match value {
                Value::Object(_) => Ok(value.clone()),
                _ => Err(mismatch()),
            },
            ParamType::Optional(inner) => match value {
                Value::Null => Ok(Value::Null),
                _ => inner.coerce_at(value, path),
            },
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Any => f.write_str("any"),
            ParamType::String => f.write_str("string"),
            ParamType::Integer => f.write_str("integer"),
            ParamType::Float => f.write_str("float"),
            ParamType::Boolean => f.write_str("boolean"),
            ParamType::Array(inner) => write!(f, "array of {}", inner),
            ParamType::Object => f.write_str("object"),
            ParamType::Optional(inner) => write!(f, "optional {}", inner),
        }
    }
}

/// A declared, typed input of a managed callable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name
    pub name: String,
    /// Declared type
    pub ty: ParamType,
    /// Value used when the argument is omitted
    pub default: Option<Value>,
}

impl ParameterSpec {
    /// A parameter that must be supplied
    pub fn required(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
        }
    }

    /// A parameter that falls back to `default`
    pub fn with_default(name: impl Into<String>, ty: ParamType, default: Value) -> Self {
        Self {
            name: name.into(),
            ty,
            default: Some(default),
        }
    }

    /// Whether the argument may be omitted
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// One problem found while validating arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterIssue {
    /// A required argument was not supplied
    Missing {
        /// Parameter name
        name: String,
    },
    /// An argument was supplied that no parameter declares
    Unexpected {
        /// Argument name
        name: String,
    },
    /// An argument could not be coerced to the declared type
    InvalidType {
        /// Parameter name, with an index suffix for array elements
        name: String,
        /// Why coercion failed
        reason: String,
    },
}

impl fmt::Display for ParameterIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterIssue::Missing { name } => write!(f, "{}: missing required argument", name),
            ParameterIssue::Unexpected { name } => write!(f, "{}: unexpected argument", name),
            ParameterIssue::InvalidType { name, reason } => write!(f, "{}: {}", name, reason),
        }
    }
}

/// Raw arguments could not be validated against the declared parameters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid parameters: {}", render_issues(.issues))]
pub struct ValidationError {
    /// Every problem found
    pub issues: Vec<ParameterIssue>,
}

impl ValidationError {
    /// Whether a required argument named `name` was missing
    pub fn is_missing(&self, name: &str) -> bool {
        self.issues
            .iter()
            .any(|issue| matches!(issue, ParameterIssue::Missing { name: n } if n == name))
    }
}

fn render_issues(issues: &[ParameterIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validates raw arguments against declared parameters
pub struct ParameterValidator;

impl ParameterValidator {
    /// Coerce `raw` against `specs`, applying defaults for omitted arguments
    pub fn validate(raw: &Parameters, specs: &[ParameterSpec]) -> Result<Parameters, ValidationError> {
        Self::bind(raw, specs, true)
    }

    /// Apply defaults and check presence without coercing values
    pub fn apply_defaults(
        raw: &Parameters,
        specs: &[ParameterSpec],
    ) -> Result<Parameters, ValidationError> {
        Self::bind(raw, specs, false)
    }

    fn bind(
        raw: &Parameters,
        specs: &[ParameterSpec],
        coerce: bool,
    ) -> Result<Parameters, ValidationError> {
        let mut issues = Vec::new();
        let mut bound = Parameters::new();

        for spec in specs {
            match (raw.get(&spec.name), &spec.default) {
                (Some(value), _) if coerce => match spec.ty.coerce_at(value, &spec.name) {
                    Ok(coerced) => {
                        bound.insert(spec.name.clone(), coerced);
                    }
                    Err((name, reason)) => issues.push(ParameterIssue::InvalidType { name, reason }),
                },
                (Some(value), _) => {
                    bound.insert(spec.name.clone(), value.clone());
                }
                (None, Some(default)) => {
                    bound.insert(spec.name.clone(), default.clone());
                }
                (None, None) => issues.push(ParameterIssue::Missing {
                    name: spec.name.clone(),
                }),
            }
        }

        for name in raw.keys() {
            if !specs.iter().any(|spec| &spec.name == name) {
                issues.push(ParameterIssue::Unexpected { name: name.clone() });
            }
        }

        if issues.is_empty() {
            Ok(bound)
        } else {
            Err(ValidationError { issues })
        }
    }
}
