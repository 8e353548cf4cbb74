//! Pre-execution statement validation.
//!
//! A [`ValidationMiddleware`] runs its validators in order before the rest of
//! the chain. The first failure short-circuits the call with
//! [`ErrorCode::ValidationFailed`](crate::ErrorCode::ValidationFailed).
//!
//! The injection checks are heuristics. They catch common attack shapes in
//! statements built by string concatenation; they are no substitute for bound
//! parameters.

use super::call::CallContext;
use super::context::ExecutionContext;
use super::types::{BoxFuture, Middleware, MiddlewareResult, Next, QueryResponse};
use crate::error::{QueryError, QueryResult};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use thiserror::Error;

/// Why a statement was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The statement is blank.
    #[error("statement is empty")]
    EmptyStatement,

    /// A blocked keyword appears in the statement.
    #[error("statement contains dangerous keyword `{keyword}`")]
    DangerousKeyword { keyword: String },

    /// Too many bound parameters.
    #[error("too many parameters: {count} (max {max})")]
    TooManyParameters { count: usize, max: usize },

    /// A string parameter is too large.
    #[error("parameter {index} is {size} bytes (max {max})")]
    ParameterTooLarge { index: usize, size: usize, max: usize },

    /// No allow-list pattern matched.
    #[error("statement matches no allowed pattern")]
    NoPatternMatched,

    /// A deny-list pattern matched.
    #[error("statement matches denied pattern `{pattern}`")]
    PatternDenied { pattern: String },

    /// The statement text is too long.
    #[error("statement is {len} bytes (max {max})")]
    StatementTooLong { len: usize, max: usize },

    /// An injection heuristic fired.
    #[error("statement contains suspicious pattern: {pattern}")]
    SuspiciousPattern { pattern: String },

    /// A user-supplied check failed.
    #[error("{validator}: {message}")]
    Custom { validator: String, message: String },
}

/// A check run against a statement before execution.
pub trait Validator: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Accept or reject the statement.
    fn validate(&self, exec: &ExecutionContext) -> Result<(), ValidationError>;
}

/// Rejects blank statements.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonEmptyStatementValidator;

impl Validator for NonEmptyStatementValidator {
    fn name(&self) -> &str {
        "non_empty"
    }

    fn validate(&self, exec: &ExecutionContext) -> Result<(), ValidationError> {
        if exec.sql().trim().is_empty() {
            return Err(ValidationError::EmptyStatement);
        }
        Ok(())
    }
}

/// Rejects statements containing blocked keywords.
///
/// Matching is a plain substring search on the upper-cased statement, so
/// `DROP` also matches `DROPPED`.
#[derive(Debug, Clone)]
pub struct DangerousKeywordValidator {
    keywords: Vec<String>,
}

impl Default for DangerousKeywordValidator {
    fn default() -> Self {
        Self::new(["DROP", "TRUNCATE", "DELETE FROM"])
    }
}

impl DangerousKeywordValidator {
    /// Block the given keywords.
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.into().to_uppercase())
                .collect(),
        }
    }
}

impl Validator for DangerousKeywordValidator {
    fn name(&self) -> &str {
        "dangerous_keyword"
    }

    fn validate(&self, exec: &ExecutionContext) -> Result<(), ValidationError> {
        let upper = exec.sql().to_uppercase();
        match self.keywords.iter().find(|k| upper.contains(k.as_str())) {
            Some(keyword) => Err(ValidationError::DangerousKeyword {
                keyword: keyword.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Limits parameter count and string parameter size.
#[derive(Debug, Clone, Copy)]
pub struct ParameterValidator {
    /// Maximum number of parameters.
    pub max_params: usize,
    /// Maximum byte length of any string parameter.
    pub max_string_bytes: usize,
}

impl Default for ParameterValidator {
    fn default() -> Self {
        Self {
            max_params: 1000,
            max_string_bytes: 1024 * 1024,
        }
    }
}

impl Validator for ParameterValidator {
    fn name(&self) -> &str {
        "parameters"
    }

    fn validate(&self, exec: &ExecutionContext) -> Result<(), ValidationError> {
        let params = exec.params();
        if params.len() > self.max_params {
            return Err(ValidationError::TooManyParameters {
                count: params.len(),
                max: self.max_params,
            });
        }

        for (index, param) in params.iter().enumerate() {
            if let Some(size) = param.string_len().filter(|&n| n > self.max_string_bytes) {
                return Err(ValidationError::ParameterTooLarge {
                    index,
                    size,
                    max: self.max_string_bytes,
                });
            }
        }
        Ok(())
    }
}

/// How a [`PatternValidator`] treats matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternMode {
    /// At least one pattern must match.
    Allow,
    /// No pattern may match.
    Deny,
}

/// Accepts or rejects statements by regular expression.
///
/// In allow mode an empty pattern list rejects every statement.
#[derive(Debug, Clone)]
pub struct PatternValidator {
    mode: PatternMode,
    patterns: Vec<Regex>,
}

impl PatternValidator {
    /// Compile `patterns` for the given mode.
    pub fn new<I, S>(mode: PatternMode, patterns: I) -> QueryResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|e| {
                    QueryError::configuration(format!("invalid pattern `{}`", p.as_ref()))
                        .with_source(e)
                })
            })
            .collect::<QueryResult<Vec<_>>>()?;
        Ok(Self { mode, patterns })
    }

    /// Only statements matching one of `patterns` pass.
    pub fn allow<I, S>(patterns: I) -> QueryResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(PatternMode::Allow, patterns)
    }

    /// Statements matching any of `patterns` are rejected.
    pub fn deny<I, S>(patterns: I) -> QueryResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(PatternMode::Deny, patterns)
    }
}

impl Validator for PatternValidator {
    fn name(&self) -> &str {
        match self.mode {
            PatternMode::Allow => "allow_pattern",
            PatternMode::Deny => "deny_pattern",
        }
    }

    fn validate(&self, exec: &ExecutionContext) -> Result<(), ValidationError> {
        let sql = exec.sql();
        let matched = self.patterns.iter().find(|re| re.is_match(sql));
        match (self.mode, matched) {
            (PatternMode::Allow, Some(_)) | (PatternMode::Deny, None) => Ok(()),
            (PatternMode::Allow, None) => Err(ValidationError::NoPatternMatched),
            (PatternMode::Deny, Some(re)) => Err(ValidationError::PatternDenied {
                pattern: re.as_str().to_string(),
            }),
        }
    }
}

/// Limits statement length in bytes.
#[derive(Debug, Clone, Copy)]
pub struct LengthValidator {
    /// Maximum statement length.
    pub max_length: usize,
}

impl Default for LengthValidator {
    fn default() -> Self {
        Self {
            max_length: 1024 * 1024,
        }
    }
}

impl Validator for LengthValidator {
    fn name(&self) -> &str {
        "length"
    }

    fn validate(&self, exec: &ExecutionContext) -> Result<(), ValidationError> {
        let len = exec.sql().len();
        if len > self.max_length {
            return Err(ValidationError::StatementTooLong {
                len,
                max: self.max_length,
            });
        }
        Ok(())
    }
}

static INJECTION_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("UNION SELECT", r"(?i)\bunion\s+(all\s+)?select\b"),
        (
            "stacked statement",
            r"(?i);\s*(drop|delete|truncate|alter|insert|update|create|exec)\b",
        ),
        ("line comment", r"--"),
        ("hash comment", r"#"),
        ("block comment", r"/\*"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("built-in injection pattern")))
    .collect()
});

static TAUTOLOGY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bor\s+'?(\w+)'?\s*=\s*'?(\w+)'?").expect("built-in tautology pattern")
});

/// Flags common SQL-injection shapes.
///
/// Looks for `UNION SELECT`, stacked statements, comment markers, `OR x=x`
/// tautologies and statement separators. Any `;` is rejected unless
/// [`allow_trailing_semicolon`](Self::allow_trailing_semicolon) is set, in
/// which case one terminating `;` passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct InjectionValidator {
    allow_trailing_semicolon: bool,
}

impl InjectionValidator {
    /// Create a validator that rejects every `;`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a single `;` at the end of the statement.
    pub fn allow_trailing_semicolon(mut self, allow: bool) -> Self {
        self.allow_trailing_semicolon = allow;
        self
    }
}

impl Validator for InjectionValidator {
    fn name(&self) -> &str {
        "injection"
    }

    fn validate(&self, exec: &ExecutionContext) -> Result<(), ValidationError> {
        let sql = exec.sql();

        if let Some((name, _)) = INJECTION_PATTERNS.iter().find(|(_, re)| re.is_match(sql)) {
            return Err(ValidationError::SuspiciousPattern {
                pattern: (*name).to_string(),
            });
        }

        let tautology = TAUTOLOGY
            .captures_iter(sql)
            .any(|c| c[1].eq_ignore_ascii_case(&c[2]));
        if tautology {
            return Err(ValidationError::SuspiciousPattern {
                pattern: "OR tautology".to_string(),
            });
        }

        let body = if self.allow_trailing_semicolon {
            let trimmed = sql.trim_end();
            trimmed.strip_suffix(';').unwrap_or(trimmed)
        } else {
            sql
        };
        if body.contains(';') {
            return Err(ValidationError::SuspiciousPattern {
                pattern: "statement separator".to_string(),
            });
        }
        Ok(())
    }
}

/// Runs child validators in order and reports the first failure.
#[derive(Clone)]
pub struct CompositeValidator {
    name: String,
    validators: Vec<Arc<dyn Validator>>,
}

impl CompositeValidator {
    /// Create an empty composite.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            validators: Vec::new(),
        }
    }

    /// Add a child validator.
    pub fn with<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }
}

impl Validator for CompositeValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, exec: &ExecutionContext) -> Result<(), ValidationError> {
        self.validators.iter().try_for_each(|v| v.validate(exec))
    }
}

/// A validator backed by a closure.
pub struct CustomValidator<F> {
    name: String,
    check: F,
}

impl<F> CustomValidator<F>
where
    F: Fn(&ExecutionContext) -> Result<(), String> + Send + Sync,
{
    /// Wrap `check`. An `Err` message becomes [`ValidationError::Custom`].
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<F> Validator for CustomValidator<F>
where
    F: Fn(&ExecutionContext) -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, exec: &ExecutionContext) -> Result<(), ValidationError> {
        (self.check)(exec).map_err(|message| ValidationError::Custom {
            validator: self.name.clone(),
            message,
        })
    }
}

/// Middleware that rejects invalid statements before execution.
///
/// # Example
///
/// ```rust
/// use prax_pipeline::middleware::{CustomValidator, ExecutionContext, ValidationMiddleware};
///
/// let validation = ValidationMiddleware::standard().with_validator(CustomValidator::new(
///     "no_select_star",
///     |exec: &ExecutionContext| {
///         if exec.sql().contains("SELECT *") {
///             Err("list columns explicitly".to_string())
///         } else {
///             Ok(())
///         }
///     },
/// ));
/// ```
#[derive(Clone, Default)]
pub struct ValidationMiddleware {
    validators: Vec<Arc<dyn Validator>>,
}

impl ValidationMiddleware {
    /// Create with no validators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-empty, length and parameter checks.
    pub fn standard() -> Self {
        Self::new()
            .with_validator(NonEmptyStatementValidator)
            .with_validator(LengthValidator::default())
            .with_validator(ParameterValidator::default())
    }

    /// The standard checks plus dangerous keywords and injection heuristics.
    pub fn strict() -> Self {
        Self::standard()
            .with_validator(DangerousKeywordValidator::default())
            .with_validator(InjectionValidator::new())
    }

    /// Append a validator.
    pub fn with_validator<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Names of the registered validators, in order.
    pub fn validator_names(&self) -> Vec<&str> {
        self.validators.iter().map(|v| v.name()).collect()
    }

    /// Run every validator without executing anything.
    pub fn check(&self, exec: &ExecutionContext) -> Result<(), ValidationError> {
        self.validators.iter().try_for_each(|v| v.validate(exec))
    }
}

impl Middleware for ValidationMiddleware {
    fn handle<'a>(
        &'a self,
        ctx: CallContext,
        exec: ExecutionContext,
        next: Next,
    ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>> {
        Box::pin(async move {
            if let Err(cause) = self.check(&exec) {
                tracing::debug!(
                    target: "prax::pipeline",
                    error = %cause,
                    "statement rejected"
                );
                return Err(QueryError::validation(cause)
                    .with_middleware(self.name())
                    .with_sql(exec.sql()));
            }

            exec.update_metadata(|m| m.validated = true);
            next.run(ctx, exec).await
        })
    }

    fn name(&self) -> &str {
        "ValidationMiddleware"
    }
}

/// Serializable validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Reject blank statements.
    pub non_empty: bool,
    /// Maximum statement length in bytes.
    pub max_length: Option<usize>,
    /// Maximum number of parameters.
    pub max_params: Option<usize>,
    /// Maximum string parameter size in bytes.
    pub max_param_bytes: Option<usize>,
    /// Keywords to block. Empty disables the check.
    pub dangerous_keywords: Vec<String>,
    /// Enable injection heuristics.
    pub injection: bool,
    /// Let the injection check accept one terminating `;`.
    pub allow_trailing_semicolon: bool,
    /// Statements must match one of these.
    pub allow_patterns: Vec<String>,
    /// Statements must match none of these.
    pub deny_patterns: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            non_empty: true,
            max_length: None,
            max_params: None,
            max_param_bytes: None,
            dangerous_keywords: Vec::new(),
            injection: false,
            allow_trailing_semicolon: false,
            allow_patterns: Vec::new(),
            deny_patterns: Vec::new(),
        }
    }
}

impl ValidationConfig {
    /// Build the middleware, compiling any patterns.
    pub fn build(&self) -> QueryResult<ValidationMiddleware> {
        let mut middleware = ValidationMiddleware::new();

        if self.non_empty {
            middleware = middleware.with_validator(NonEmptyStatementValidator);
        }
        if let Some(max_length) = self.max_length {
            middleware = middleware.with_validator(LengthValidator { max_length });
        }
        if self.max_params.is_some() || self.max_param_bytes.is_some() {
            let defaults = ParameterValidator::default();
            middleware = middleware.with_validator(ParameterValidator {
                max_params: self.max_params.unwrap_or(defaults.max_params),
                max_string_bytes: self.max_param_bytes.unwrap_or(defaults.max_string_bytes),
            });
        }
        if !self.dangerous_keywords.is_empty() {
            middleware = middleware
                .with_validator(DangerousKeywordValidator::new(self.dangerous_keywords.iter().cloned()));
        }
        if self.injection {
            middleware = middleware.with_validator(
                InjectionValidator::new().allow_trailing_semicolon(self.allow_trailing_semicolon),
            );
        }
        if !self.allow_patterns.is_empty() {
            middleware = middleware.with_validator(PatternValidator::allow(&self.allow_patterns)?);
        }
        if !self.deny_patterns.is_empty() {
            middleware = middleware.with_validator(PatternValidator::deny(&self.deny_patterns)?);
        }

        Ok(middleware)
    }
}
