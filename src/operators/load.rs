//! Fact and dimension loads - derive star-schema rows from staging tables
//!
//! Plain appends would duplicate rows when a task is retried, so each variant
//! commits to one idempotent strategy:
//!
//! - facts upsert by natural key: matching rows are deleted and re-inserted
//!   inside one transaction;
//! - dimensions are cleared and fully re-inserted.

use super::{resolve_statement, validate_identifier, Operator};
use crate::core::TaskContext;
use crate::error::{BuildError, OperatorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FactLoadDecl {
    pub table: String,
    /// Natural key columns of the fact table
    pub key: Vec<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub sql: Option<String>,
}

impl FactLoadDecl {
    pub(crate) fn resolve(
        &self,
        task_id: &str,
        queries: &HashMap<String, String>,
    ) -> Result<FactLoadOperator, BuildError> {
        validate_identifier(task_id, "table", &self.table)?;
        if self.key.is_empty() {
            return Err(BuildError::invalid_config(
                task_id,
                "fact loads need at least one key column",
            ));
        }
        for column in &self.key {
            validate_identifier(task_id, "column", column)?;
        }
        let sql = resolve_statement(task_id, self.query.as_deref(), self.sql.as_deref(), queries)?;

        Ok(FactLoadOperator {
            table: self.table.clone(),
            key: self.key.clone(),
            sql,
        })
    }
}

/// Upserts the rows produced by `sql` into `table`, keyed on `key`
#[derive(Debug, Clone)]
pub struct FactLoadOperator {
    pub table: String,
    pub key: Vec<String>,
    /// SELECT producing the fact rows, templated at execution time
    pub sql: String,
}

impl FactLoadOperator {
    fn upsert_statement(&self, select: &str) -> String {
        let select = select.trim().trim_end_matches(';');
        let matches = self
            .key
            .iter()
            .map(|k| format!("{t}.{k} = incoming.{k}", t = self.table, k = k))
            .collect::<Vec<_>>()
            .join(" AND ");

        format!(
            "BEGIN;\nDELETE FROM {t} USING ({select}) AS incoming WHERE {matches};\nINSERT INTO {t} {select};\nCOMMIT;",
            t = self.table,
            select = select,
            matches = matches,
        )
    }
}

#[async_trait]
impl Operator for FactLoadOperator {
    fn kind(&self) -> &'static str {
        "fact_load"
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<(), OperatorError> {
        let select = ctx.render(&self.sql)?;

        ctx.log(format!(
            "Upserting fact table {} on ({})",
            self.table,
            self.key.join(", ")
        ));
        ctx.warehouse()
            .execute(&self.upsert_statement(&select))
            .await?;
        ctx.log(format!("Fact table {} loaded", self.table));
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DimensionLoadDecl {
    pub table: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub sql: Option<String>,
}

impl DimensionLoadDecl {
    pub(crate) fn resolve(
        &self,
        task_id: &str,
        queries: &HashMap<String, String>,
    ) -> Result<DimensionLoadOperator, BuildError> {
        validate_identifier(task_id, "table", &self.table)?;
        let sql = resolve_statement(task_id, self.query.as_deref(), self.sql.as_deref(), queries)?;
        Ok(DimensionLoadOperator {
            table: self.table.clone(),
            sql,
        })
    }
}

/// Clears `table` and inserts the rows produced by `sql`
#[derive(Debug, Clone)]
pub struct DimensionLoadOperator {
    pub table: String,
    pub sql: String,
}

#[async_trait]
impl Operator for DimensionLoadOperator {
    fn kind(&self) -> &'static str {
        "dimension_load"
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<(), OperatorError> {
        let select = ctx.render(&self.sql)?;
        let select = select.trim().trim_end_matches(';');

        ctx.log(format!("Clearing dimension table {}", self.table));
        ctx.warehouse()
            .execute(&format!("TRUNCATE TABLE {};", self.table))
            .await?;

        ctx.log(format!("Loading dimension table {}", self.table));
        ctx.warehouse()
            .execute(&format!("INSERT INTO {} {};", self.table, select))
            .await?;
        ctx.log(format!("Dimension table {} loaded", self.table));
        Ok(())
    }
}
