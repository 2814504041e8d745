//! Starpipe - star-schema warehouse pipeline orchestrator
//!
//! Loads raw event and catalog files from object storage into warehouse
//! staging tables, reshapes them into fact and dimension tables, and gates
//! the run on data quality checks, all driven by a dependency graph.

pub mod archive;
pub mod clients;
pub mod core;
pub mod error;
pub mod operators;
pub mod pipeline;

#[cfg(test)]
mod testing;

// Re-exports
pub use archive::RunArchive;
pub use crate::core::{CancellationToken, ExecutionContext, RunResult, Scheduler, TaskGraph, TaskState};
pub use error::{BuildError, OperatorError};
pub use pipeline::PipelineDef;

use crate::clients::{CommandWarehouse, CredentialProvider, EnvCredentials, S3ObjectStore, Warehouse};
use crate::core::{template, Variables};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

/// Result type alias
pub type Result<T> = anyhow::Result<T>;

/// Per-run settings supplied by the caller
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub execution_date: DateTime<Utc>,
    /// Overrides the pipeline's `defaults.concurrency`
    pub concurrency: Option<usize>,
    /// Layered over the pipeline's declared variables
    pub variables: Variables,
    pub run_id: Option<String>,
}

impl RunOptions {
    pub fn new(execution_date: DateTime<Utc>) -> Self {
        Self {
            execution_date,
            concurrency: None,
            variables: Variables::new(),
            run_id: None,
        }
    }
}

/// Starpipe engine - main entry point for library usage
pub struct StarpipeEngine {
    pipeline: PipelineDef,
}

impl StarpipeEngine {
    pub fn new(pipeline: PipelineDef) -> Self {
        Self { pipeline }
    }

    /// Create a new engine from a pipeline file
    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(Self::new(PipelineDef::from_file(path)?))
    }

    pub fn pipeline(&self) -> &PipelineDef {
        &self.pipeline
    }

    /// Warehouse client from the pipeline's `warehouse:` section
    pub fn connect_warehouse(&self) -> Result<Arc<dyn Warehouse>> {
        let Some(config) = &self.pipeline.warehouse else {
            anyhow::bail!(
                "Pipeline '{}' has no warehouse section",
                self.pipeline.name()
            );
        };
        Ok(Arc::new(CommandWarehouse::new(config.clone())?))
    }

    /// Context for one run against `warehouse` and `credentials`
    pub fn execution_context(
        &self,
        options: &RunOptions,
        warehouse: Arc<dyn Warehouse>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(
            options.execution_date,
            warehouse,
            Arc::new(S3ObjectStore::new(&self.pipeline.object_store)),
            credentials,
        )
        .with_pipeline(self.pipeline.name())
        .with_variables(self.pipeline.variables_with(&options.variables));
        if let Some(run_id) = &options.run_id {
            ctx = ctx.with_run_id(run_id.clone());
        }
        ctx
    }

    /// Variables a template would see for `options`, without connecting
    pub fn render_variables(&self, options: &RunOptions) -> Variables {
        let run_id = options.run_id.as_deref().unwrap_or("manual");
        let mut vars = template::builtin_variables(options.execution_date, run_id);
        vars.extend(self.pipeline.variables_with(&options.variables));
        vars
    }

    /// Context using the configured warehouse and environment credentials
    pub fn default_context(&self, options: &RunOptions) -> Result<ExecutionContext> {
        Ok(self.execution_context(
            options,
            self.connect_warehouse()?,
            Arc::new(EnvCredentials::new()),
        ))
    }

    /// Build the graph and drive it to completion.
    ///
    /// Errors only when the run could not start (validity window or an
    /// invalid graph); task failures are reported in the returned result.
    pub async fn run(
        &self,
        ctx: ExecutionContext,
        concurrency: Option<usize>,
        cancel: CancellationToken,
    ) -> Result<RunResult> {
        self.pipeline.check_window(ctx.logical_time())?;
        let mut graph = self.pipeline.build_graph()?;

        let concurrency = concurrency.unwrap_or(self.pipeline.defaults.concurrency);
        let scheduler = Scheduler::new(concurrency).with_cancel(cancel);
        log::info!(
            "Running pipeline {} ({} tasks, concurrency {}) for {}",
            self.pipeline.name(),
            graph.len(),
            scheduler.concurrency(),
            ctx.logical_time().format("%Y-%m-%d %H:%M:%S")
        );
        let mut names: Vec<&String> = ctx.variables().keys().collect();
        names.sort();
        log::debug!("Template variables: {:?}", names);

        Ok(scheduler.run(&mut graph, Arc::new(ctx)).await)
    }
}
