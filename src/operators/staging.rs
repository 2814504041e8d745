//! Staging load - clear a landing table and bulk-load it from object storage

use super::{quote_literal, validate_identifier, Operator};
use crate::core::TaskContext;
use crate::error::{BuildError, OperatorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    #[default]
    Json,
    Csv,
}

/// Truncates `table`, then copies everything under `bucket`/`key` into it.
///
/// The truncate makes the load overwrite-equivalent: running it again after
/// a partial failure ends in the same table contents as one clean run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagingLoadOperator {
    pub table: String,
    pub bucket: String,
    /// Object key prefix, templated at execution time
    pub key: String,
    #[serde(default)]
    pub format: DataFormat,
    /// JSONPaths file key in the same bucket; `auto` mapping when absent
    #[serde(default)]
    pub json_paths: Option<String>,
    #[serde(default)]
    pub delimiter: Option<char>,
    #[serde(default)]
    pub ignore_header: Option<u32>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_credentials")]
    pub credentials: String,
}

fn default_credentials() -> String {
    "aws_credentials".to_string()
}

impl StagingLoadOperator {
    pub(crate) fn validate(&self, task_id: &str) -> Result<(), BuildError> {
        validate_identifier(task_id, "table", &self.table)?;
        if self.bucket.trim().is_empty() {
            return Err(BuildError::invalid_config(task_id, "bucket must not be empty"));
        }
        match self.format {
            DataFormat::Json if self.delimiter.is_some() || self.ignore_header.is_some() => {
                Err(BuildError::invalid_config(
                    task_id,
                    "delimiter and ignore_header only apply to csv",
                ))
            }
            DataFormat::Csv if self.json_paths.is_some() => Err(BuildError::invalid_config(
                task_id,
                "json_paths only applies to json",
            )),
            _ => Ok(()),
        }
    }

    fn format_clause(&self, json_paths: Option<&str>) -> String {
        match self.format {
            DataFormat::Json => format!(
                "FORMAT AS JSON {}",
                quote_literal(json_paths.unwrap_or("auto"))
            ),
            DataFormat::Csv => {
                let mut clause = format!(
                    "FORMAT AS CSV DELIMITER {}",
                    quote_literal(&self.delimiter.unwrap_or(',').to_string())
                );
                if let Some(n) = self.ignore_header.filter(|n| *n > 0) {
                    clause.push_str(&format!(" IGNOREHEADER {}", n));
                }
                clause
            }
        }
    }

    fn copy_statement(
        &self,
        location: &str,
        access_key: &str,
        secret: &str,
        json_paths: Option<&str>,
    ) -> String {
        let mut sql = format!(
            "COPY {}\nFROM {}\nACCESS_KEY_ID {}\nSECRET_ACCESS_KEY {}\n",
            self.table,
            quote_literal(location),
            quote_literal(access_key),
            quote_literal(secret),
        );
        if let Some(region) = &self.region {
            sql.push_str(&format!("REGION {}\n", quote_literal(region)));
        }
        sql.push_str(&self.format_clause(json_paths));
        sql.push(';');
        sql
    }
}

#[async_trait]
impl Operator for StagingLoadOperator {
    fn kind(&self) -> &'static str {
        "staging_load"
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<(), OperatorError> {
        // resolve everything before touching the table
        let key = ctx.render(&self.key)?;
        let location = ctx.object_store().locate(&self.bucket, &key)?;
        let json_paths = match &self.json_paths {
            Some(paths) => {
                let rendered = ctx.render(paths)?;
                Some(ctx.object_store().locate(&self.bucket, &rendered)?)
            }
            None => None,
        };
        let creds = ctx.credentials().lookup(&self.credentials).await?;

        ctx.log(format!("Clearing data from staging table {}", self.table));
        ctx.warehouse()
            .execute(&format!("TRUNCATE TABLE {};", self.table))
            .await?;

        ctx.log(format!("Copying {} into {}", location, self.table));
        let copy = self.copy_statement(&location, &creds.access_key, &creds.secret, json_paths.as_deref());
        ctx.warehouse().execute(&copy).await?;

        ctx.log(format!("Staged {} from {}", self.table, location));
        Ok(())
    }
}
