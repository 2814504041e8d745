//! Pipeline declaration - the YAML file a run is built from
//!
//! A pipeline file names the tasks, their operators and dependencies, the
//! named SQL statements they share, and how to reach the warehouse. Unknown
//! keys are rejected so typos fail at load time instead of being ignored.

use crate::clients::{ObjectStoreConfig, WarehouseConfig};
use crate::core::{Edge, RetryPolicy, TaskGraph, TaskNode, Variables};
use crate::error::BuildError;
use crate::operators::OperatorDecl;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files tried, in order, when no pipeline path is given
const DEFAULT_LOCATIONS: [&str; 2] = ["pipeline.yml", ".starpipe/pipeline.yml"];

/// Complete pipeline declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDef {
    pub metadata: Metadata,
    #[serde(default)]
    pub defaults: Defaults,
    /// Template variables layered over the built-ins
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Named SQL statements referenced by tasks
    #[serde(default)]
    pub queries: HashMap<String, String>,
    #[serde(default)]
    pub warehouse: Option<WarehouseConfig>,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    pub tasks: Vec<TaskDecl>,
    /// Extra `[downstream, upstream]` pairs, merged with `depends_on`
    #[serde(default)]
    pub edges: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Informational only; runs are triggered externally
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl Metadata {
    /// Whether `date` falls inside the declared validity window (inclusive)
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date.map_or(true, |start| date >= start)
            && self.end_date.map_or(true, |end| date <= end)
    }
}

/// Pipeline-wide defaults; tasks may override the retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_max_attempts() -> u32 {
    RetryPolicy::DEFAULT.max_attempts
}

fn default_retry_delay_secs() -> u64 {
    RetryPolicy::DEFAULT.delay.as_secs()
}

fn default_concurrency() -> usize {
    4
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDecl {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    pub operator: OperatorDecl,
}

impl PipelineDef {
    /// Load from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid pipeline file {}", path.display()))
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let pipeline: PipelineDef = serde_yaml::from_str(yaml)?;
        Ok(pipeline)
    }

    /// First default pipeline file found under `dir`
    pub fn find_in(dir: &Path) -> Option<PathBuf> {
        DEFAULT_LOCATIONS
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Auto-detect and load the pipeline from the current directory
    /// Priority:
    /// 1. pipeline.yml
    /// 2. .starpipe/pipeline.yml
    pub fn auto_load() -> Result<(PathBuf, Self)> {
        let Some(path) = Self::find_in(Path::new(".")) else {
            anyhow::bail!(
                "No pipeline found. Create {} or pass a path",
                DEFAULT_LOCATIONS.join(" or ")
            );
        };
        let pipeline = Self::from_file(&path)?;
        Ok((path, pipeline))
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Retry policy for `task`, after applying pipeline defaults
    pub fn retry_policy(&self, task: &TaskDecl) -> RetryPolicy {
        RetryPolicy::new(
            task.max_attempts.unwrap_or(self.defaults.max_attempts),
            Duration::from_secs(task.retry_delay_secs.unwrap_or(self.defaults.retry_delay_secs)),
        )
    }

    /// Resolve every operator and validate the graph. Nothing has run yet
    /// when this fails.
    pub fn build_graph(&self) -> Result<TaskGraph, BuildError> {
        let mut nodes = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let policy = self.retry_policy(task);
            if policy.max_attempts == 0 {
                return Err(BuildError::invalid_config(
                    &task.id,
                    "max_attempts must be at least 1",
                ));
            }
            let operator = task.operator.resolve(&task.id, &self.queries)?;
            nodes.push(
                TaskNode::new(task.id.clone(), operator)
                    .depends_on(task.depends_on.iter().cloned())
                    .with_retry(policy),
            );
        }

        let edges = self
            .edges
            .iter()
            .map(|(downstream, upstream)| Edge::new(downstream.clone(), upstream.clone()))
            .collect();

        TaskGraph::build(nodes, edges)
    }

    /// Refuse execution dates outside `[start_date, end_date]`
    pub fn check_window(&self, execution_date: DateTime<Utc>) -> Result<()> {
        let date = execution_date.date_naive();
        if !self.metadata.covers(date) {
            anyhow::bail!(
                "Execution date {} is outside the validity window of pipeline '{}' ({} to {})",
                date,
                self.name(),
                self.metadata
                    .start_date
                    .map_or_else(|| "unbounded".to_string(), |d| d.to_string()),
                self.metadata
                    .end_date
                    .map_or_else(|| "unbounded".to_string(), |d| d.to_string()),
            );
        }
        Ok(())
    }

    /// Declared variables with `overrides` applied on top
    pub fn variables_with(&self, overrides: &Variables) -> Variables {
        let mut vars = self.variables.clone();
        vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }
}

/// Accepts `YYYY-MM-DD` (midnight UTC) or a full RFC 3339 timestamp
pub fn parse_execution_date(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid execution date '{}'", value))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .context("Invalid execution date")?;
    Ok(Utc.from_utc_datetime(&midnight))
}
