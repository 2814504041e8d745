//! Error types shared by the graph, templating, clients and operators

use std::fmt;
use thiserror::Error;

/// Errors raised while building a task graph. Nothing executes when one occurs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Duplicate task id: {0}")]
    DuplicateId(String),

    #[error("Cycle detected in dependency graph: {path}")]
    Cycle { path: String },

    #[error("Dependency '{upstream}' for task '{task}' does not exist")]
    DanglingEdge { task: String, upstream: String },

    #[error("Edge references undeclared task '{0}'")]
    UnknownTask(String),

    #[error("Task '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Task '{task}' references unknown query '{query}'")]
    UnknownQuery { task: String, query: String },

    #[error("Invalid configuration for task '{task}': {reason}")]
    InvalidConfig { task: String, reason: String },
}

impl BuildError {
    pub fn invalid_config(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            task: task.into(),
            reason: reason.into(),
        }
    }
}

/// Template rendering failures. Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unknown template variable '{name}' in \"{template}\"")]
    UnknownVariable { name: String, template: String },

    #[error("Malformed placeholder '{placeholder}' in \"{template}\"")]
    Malformed {
        placeholder: String,
        template: String,
    },
}

/// Failure reported by an external client (warehouse, object store, credentials).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ClientError {
    pub transient: bool,
    pub message: String,
}

impl ClientError {
    /// Network or lock style failure worth another attempt
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}

/// A single rule that did not hold during a quality gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub table: String,
    pub check: String,
    pub observed: i64,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed {} (observed {})",
            self.table, self.check, self.observed
        )
    }
}

/// Raised by the quality gate once every rule has been evaluated
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Data quality check failed: {}", join_violations(.violations))]
pub struct QualityGateFailure {
    pub violations: Vec<Violation>,
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of a failed operator attempt
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperatorError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    QualityGate(#[from] QualityGateFailure),
}

impl OperatorError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Only transient failures are retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ClientError> for OperatorError {
    fn from(e: ClientError) -> Self {
        if e.transient {
            Self::Transient(e.message)
        } else {
            Self::Fatal(e.message)
        }
    }
}
