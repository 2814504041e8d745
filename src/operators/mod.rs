//! Operators - the units of work a task graph runs
//!
//! Every variant implements [`Operator`]. Declarations are parsed from the
//! pipeline file as a tagged union ([`OperatorDecl`], tagged by `kind`) and
//! resolved into operators once, when the graph is built. Unknown fields are
//! rejected at parse time.

mod load;
mod quality;
mod sql;
mod staging;

pub use load::{DimensionLoadDecl, DimensionLoadOperator, FactLoadDecl, FactLoadOperator};
pub use quality::{QualityCheck, QualityGateDecl, QualityGateOperator, QualityRule, QualityRuleDecl};
pub use sql::{NoOpOperator, SqlDecl, SqlOperator};
pub use staging::{DataFormat, StagingLoadOperator};

use crate::core::TaskContext;
use crate::error::{BuildError, OperatorError};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// A unit of work. Side effects happen only inside `execute`, and each
/// variant defines what executing it twice does.
#[async_trait]
pub trait Operator: Send + Sync + fmt::Debug {
    /// Short variant name, for logs and `check` output
    fn kind(&self) -> &'static str;

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<(), OperatorError>;
}

/// Operator section of a task declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorDecl {
    NoOp(NoOpOperator),
    Sql(SqlDecl),
    StagingLoad(StagingLoadOperator),
    FactLoad(FactLoadDecl),
    DimensionLoad(DimensionLoadDecl),
    QualityGate(QualityGateDecl),
}

impl OperatorDecl {
    /// Validate the declaration and resolve named queries into an operator
    pub fn resolve(
        &self,
        task_id: &str,
        queries: &HashMap<String, String>,
    ) -> Result<Arc<dyn Operator>, BuildError> {
        Ok(match self {
            Self::NoOp(op) => Arc::new(op.clone()),
            Self::Sql(decl) => Arc::new(decl.resolve(task_id, queries)?),
            Self::StagingLoad(op) => {
                op.validate(task_id)?;
                Arc::new(op.clone())
            }
            Self::FactLoad(decl) => Arc::new(decl.resolve(task_id, queries)?),
            Self::DimensionLoad(decl) => Arc::new(decl.resolve(task_id, queries)?),
            Self::QualityGate(decl) => Arc::new(decl.resolve(task_id)?),
        })
    }
}

/// Pick the statement text from either a named query or inline `sql`
pub(crate) fn resolve_statement(
    task_id: &str,
    query: Option<&str>,
    sql: Option<&str>,
    queries: &HashMap<String, String>,
) -> Result<String, BuildError> {
    match (query, sql) {
        (Some(name), None) => queries
            .get(name)
            .cloned()
            .ok_or_else(|| BuildError::UnknownQuery {
                task: task_id.to_string(),
                query: name.to_string(),
            }),
        (None, Some(sql)) if !sql.trim().is_empty() => Ok(sql.to_string()),
        (None, Some(_)) => Err(BuildError::invalid_config(task_id, "sql must not be empty")),
        (Some(_), Some(_)) => Err(BuildError::invalid_config(
            task_id,
            "set either `query` or `sql`, not both",
        )),
        (None, None) => Err(BuildError::invalid_config(
            task_id,
            "one of `query` or `sql` is required",
        )),
    }
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("static regex")
    })
}

/// Table and column names are spliced into SQL, so they must be plain identifiers
pub(crate) fn validate_identifier(task_id: &str, what: &str, name: &str) -> Result<(), BuildError> {
    if identifier_re().is_match(name) {
        Ok(())
    } else {
        Err(BuildError::invalid_config(
            task_id,
            format!("invalid {} name '{}'", what, name),
        ))
    }
}

/// Quote a string literal for SQL
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
