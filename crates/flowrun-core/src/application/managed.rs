//! Registration of managed callables.
//!
//! A managed callable couples an async body with everything the execution
//! service needs to run it: declared parameters, retry and timeout settings,
//! and how its runs are named. Callables are registered through the
//! [`flow`] and [`task`] builders.

use crate::application::context::RunContext;
use crate::application::settings::{seconds_to_duration, EngineSettings};
use crate::domain::parameters::ParameterSpec;
use crate::domain::retry::RetryPolicy;
use crate::domain::run::{generate_run_name, RunKind};
use crate::{CoreError, Parameters};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Characters that may not appear in a callable name
pub const RESERVED_NAME_CHARACTERS: &[char] = &['/', '%', '<', '>', '&'];

/// Type-erased body of a managed callable
pub type RunBody =
    Arc<dyn Fn(RunContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Function computing a run name from validated parameters
pub type RunNameFn = Arc<dyn Fn(&Parameters) -> String + Send + Sync>;

/// Start registering a flow
pub fn flow(name: impl Into<String>) -> ManagedFnBuilder {
    ManagedFnBuilder::new(RunKind::Flow, name)
}

/// Start registering a task
pub fn task(name: impl Into<String>) -> ManagedFnBuilder {
    ManagedFnBuilder::new(RunKind::Task, name)
}

/// Check a callable name against the reserved characters
pub fn validate_callable_name(name: &str) -> Result<(), CoreError> {
    if name.trim().is_empty() {
        return Err(CoreError::InvalidName {
            name: name.to_string(),
            reason: "name must not be empty".to_string(),
        });
    }
    if let Some(c) = name.chars().find(|c| RESERVED_NAME_CHARACTERS.contains(c)) {
        return Err(CoreError::InvalidName {
            name: name.to_string(),
            reason: format!("name must not contain '{}'", c),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// Split a `hi-{name}` style template into literal and placeholder segments.
/// `{{` and `}}` escape a brace.
fn parse_template(template: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') | None => return Err("unclosed '{'".to_string()),
                        Some(c) => name.push(c),
                    }
                }
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err("empty placeholder '{}'".to_string());
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder(name));
            }
            '}' => return Err("unmatched '}'".to_string()),
            c => literal.push(c),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

#[derive(Clone)]
enum RunNameSource {
    Generated,
    Template {
        raw: String,
        segments: Vec<Segment>,
    },
    Function(RunNameFn),
}

impl fmt::Debug for RunNameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunNameSource::Generated => f.write_str("Generated"),
            RunNameSource::Template { raw, .. } => f.debug_tuple("Template").field(raw).finish(),
            RunNameSource::Function(_) => f.write_str("Function(..)"),
        }
    }
}

enum PendingRunName {
    Template(String),
    Function(RunNameFn),
}

/// Per-call overrides of a callable's configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Number of re-attempts after the first one
    pub retries: Option<u32>,
    /// Delay between attempts, in seconds
    pub retry_delay_seconds: Option<f64>,
    /// Per-attempt timeout in seconds; `0` removes the timeout
    pub timeout_seconds: Option<f64>,
    /// Route `RunContext::print` to the run's log stream
    pub log_prints: Option<bool>,
    /// Validate and coerce parameters before running
    pub validate_parameters: Option<bool>,
}

/// A registered callable with its run configuration
#[derive(Clone)]
pub struct ManagedFn {
    kind: RunKind,
    name: String,
    description: Option<String>,
    version: Option<String>,
    parameters: Vec<ParameterSpec>,
    retries: Option<u32>,
    retry_delay: Option<Duration>,
    // `Some(ZERO)` explicitly disables the engine default
    timeout: Option<Duration>,
    log_prints: bool,
    validate_parameters: bool,
    run_name: RunNameSource,
    body: RunBody,
}

impl fmt::Debug for ManagedFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedFn")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .field("log_prints", &self.log_prints)
            .field("validate_parameters", &self.validate_parameters)
            .field("run_name", &self.run_name)
            .finish_non_exhaustive()
    }
}

impl ManagedFn {
    /// Flow or task
    pub fn kind(&self) -> RunKind {
        self.kind
    }

    /// Callable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free-form description
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Version tag
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Declared parameters, in declaration order
    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    /// Whether prints are routed to the run's log stream
    pub fn log_prints(&self) -> bool {
        self.log_prints
    }

    /// Whether raw arguments are validated and coerced
    pub fn validates_parameters(&self) -> bool {
        self.validate_parameters
    }

    /// Retry policy, falling back to the engine defaults
    pub fn retry_policy(&self, settings: &EngineSettings) -> RetryPolicy {
        RetryPolicy::from_retries(
            self.retries.unwrap_or(settings.default_retries),
            self.retry_delay
                .unwrap_or_else(|| settings.default_retry_delay()),
        )
    }

    /// Per-attempt timeout, falling back to the engine default
    pub fn timeout(&self, settings: &EngineSettings) -> Option<Duration> {
        match self.timeout {
            None => settings.default_timeout(),
            Some(timeout) if timeout.is_zero() => None,
            Some(timeout) => Some(timeout),
        }
    }

    /// Name for a run of this callable with the given validated parameters
    pub fn render_run_name(&self, parameters: &Parameters) -> String {
        match &self.run_name {
            RunNameSource::Generated => generate_run_name(),
            RunNameSource::Template { segments, .. } => segments
                .iter()
                .map(|segment| match segment {
                    Segment::Literal(text) => text.clone(),
                    Segment::Placeholder(name) => match parameters.get(name) {
                        Some(Value::String(s)) => s.clone(),
                        Some(value) => value.to_string(),
                        None => String::new(),
                    },
                })
                .collect(),
            RunNameSource::Function(f) => f(parameters),
        }
    }

    /// Copy of this callable with the given options applied
    pub fn with_options(&self, options: RunOptions) -> Result<ManagedFn, CoreError> {
        let mut updated = self.clone();
        if let Some(retries) = options.retries {
            updated.retries = Some(retries);
        }
        if let Some(delay) = options.retry_delay_seconds {
            updated.retry_delay = Some(seconds_to_duration("retry_delay_seconds", delay)?);
        }
        if let Some(timeout) = options.timeout_seconds {
            updated.timeout = Some(seconds_to_duration("timeout_seconds", timeout)?);
        }
        if let Some(log_prints) = options.log_prints {
            updated.log_prints = log_prints;
        }
        if let Some(validate) = options.validate_parameters {
            updated.validate_parameters = validate;
        }
        Ok(updated)
    }

    pub(crate) fn invoke(&self, context: RunContext) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self.body)(context)
    }
}

/// Builder for [`ManagedFn`]
pub struct ManagedFnBuilder {
    kind: RunKind,
    name: String,
    description: Option<String>,
    version: Option<String>,
    parameters: Vec<ParameterSpec>,
    retries: Option<u32>,
    retry_delay: Option<Duration>,
    timeout: Option<Duration>,
    log_prints: bool,
    validate_parameters: bool,
    run_name: Option<PendingRunName>,
}

impl ManagedFnBuilder {
    fn new(kind: RunKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            description: None,
            version: None,
            parameters: Vec::new(),
            retries: None,
            retry_delay: None,
            timeout: None,
            log_prints: false,
            validate_parameters: true,
            run_name: None,
        }
    }

    /// Declare a parameter
    pub fn parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    /// Number of re-attempts after the first one
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Constant delay between attempts
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Per-attempt timeout; `Duration::ZERO` removes it
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Route `RunContext::print` to the run's log stream
    pub fn log_prints(mut self, enabled: bool) -> Self {
        self.log_prints = enabled;
        self
    }

    /// Validate and coerce raw arguments before running (default: on)
    pub fn validate_parameters(mut self, enabled: bool) -> Self {
        self.validate_parameters = enabled;
        self
    }

    /// Name runs from a template such as `"hi-{foo}-{bar}"`
    pub fn run_name(mut self, template: impl Into<String>) -> Self {
        self.run_name = Some(PendingRunName::Template(template.into()));
        self
    }

    /// Name runs with a function of the validated parameters
    pub fn run_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Parameters) -> String + Send + Sync + 'static,
    {
        self.run_name = Some(PendingRunName::Function(Arc::new(f)));
        self
    }

    /// Free-form description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Version tag
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Finish registration with the callable's body.
    ///
    /// The body's return value is serialized to JSON and recorded as the
    /// run result.
    pub fn build<F, Fut, T>(self, body: F) -> Result<ManagedFn, CoreError>
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        validate_callable_name(&self.name)?;

        for (i, spec) in self.parameters.iter().enumerate() {
            if self.parameters[..i].iter().any(|p| p.name == spec.name) {
                return Err(CoreError::ConfigurationError(format!(
                    "parameter '{}' is declared twice on '{}'",
                    spec.name, self.name
                )));
            }
        }

        let run_name = match self.run_name {
            None => RunNameSource::Generated,
            Some(PendingRunName::Function(f)) => RunNameSource::Function(f),
            Some(PendingRunName::Template(raw)) => {
                let segments = parse_template(&raw).map_err(|reason| CoreError::InvalidName {
                    name: raw.clone(),
                    reason,
                })?;
                for segment in &segments {
                    if let Segment::Placeholder(name) = segment {
                        if !self.parameters.iter().any(|p| &p.name == name) {
                            return Err(CoreError::InvalidName {
                                name: raw.clone(),
                                reason: format!("'{}' is not a parameter of '{}'", name, self.name),
                            });
                        }
                    }
                }
                RunNameSource::Template { raw, segments }
            }
        };

        let erased: RunBody = Arc::new(move |context: RunContext| {
            let fut = body(context);
            async move {
                let value = fut.await?;
                Ok::<Value, anyhow::Error>(serde_json::to_value(value)?)
            }
            .boxed()
        });

        Ok(ManagedFn {
            kind: self.kind,
            name: self.name,
            description: self.description,
            version: self.version,
            parameters: self.parameters,
            retries: self.retries,
            retry_delay: self.retry_delay,
            timeout: self.timeout,
            log_prints: self.log_prints,
            validate_parameters: self.validate_parameters,
            run_name,
            body: erased,
        })
    }
}
