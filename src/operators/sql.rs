//! Plain SQL step and no-op markers

use super::{resolve_statement, Operator};
use crate::core::TaskContext;
use crate::error::{BuildError, OperatorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Run start/end marker with no external effect
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoOpOperator {}

#[async_trait]
impl Operator for NoOpOperator {
    fn kind(&self) -> &'static str {
        "no_op"
    }

    async fn execute(&self, _ctx: &TaskContext<'_>) -> Result<(), OperatorError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqlDecl {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub sql: Option<String>,
}

impl SqlDecl {
    pub(crate) fn resolve(
        &self,
        task_id: &str,
        queries: &HashMap<String, String>,
    ) -> Result<SqlOperator, BuildError> {
        let sql = resolve_statement(task_id, self.query.as_deref(), self.sql.as_deref(), queries)?;
        Ok(SqlOperator { sql })
    }
}

/// Runs a statement as written, e.g. `CREATE TABLE IF NOT EXISTS ...`.
/// Re-running is only safe if the statement itself is.
#[derive(Debug, Clone)]
pub struct SqlOperator {
    pub sql: String,
}

#[async_trait]
impl Operator for SqlOperator {
    fn kind(&self) -> &'static str {
        "sql"
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<(), OperatorError> {
        let sql = ctx.render(&self.sql)?;
        ctx.warehouse().execute(&sql).await?;
        Ok(())
    }
}
