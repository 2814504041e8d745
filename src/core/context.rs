//! Execution context - per-run data shared by every task of one run

use super::events::{EventSink, LogSink, RunEvent};
use super::template::{self, Variables};
use crate::clients::{CredentialProvider, ObjectStore, Warehouse};
use crate::error::TemplateError;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Logical time, template variables and client handles for one run.
///
/// Built before the run starts and never mutated afterwards; tasks share it
/// through an `Arc`.
pub struct ExecutionContext {
    pipeline: String,
    run_id: String,
    logical_time: DateTime<Utc>,
    extra: Variables,
    variables: Variables,
    warehouse: Arc<dyn Warehouse>,
    object_store: Arc<dyn ObjectStore>,
    credentials: Arc<dyn CredentialProvider>,
    events: Arc<dyn EventSink>,
}

impl ExecutionContext {
    pub fn new(
        logical_time: DateTime<Utc>,
        warehouse: Arc<dyn Warehouse>,
        object_store: Arc<dyn ObjectStore>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let run_id = default_run_id(logical_time);
        let mut ctx = Self {
            pipeline: "pipeline".to_string(),
            run_id,
            logical_time,
            extra: Variables::new(),
            variables: Variables::new(),
            warehouse,
            object_store,
            credentials,
            events: Arc::new(LogSink),
        };
        ctx.refresh_variables();
        ctx
    }

    /// Layer declared variables on top of the built-ins
    pub fn with_variables(mut self, vars: Variables) -> Self {
        self.extra.extend(vars);
        self.refresh_variables();
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self.refresh_variables();
        self
    }

    pub fn with_pipeline(mut self, name: impl Into<String>) -> Self {
        self.pipeline = name.into();
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    fn refresh_variables(&mut self) {
        let mut vars = template::builtin_variables(self.logical_time, &self.run_id);
        vars.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.variables = vars;
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn logical_time(&self) -> DateTime<Utc> {
        self.logical_time
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        template::render(template, &self.variables)
    }

    pub fn warehouse(&self) -> &dyn Warehouse {
        self.warehouse.as_ref()
    }

    pub fn object_store(&self) -> &dyn ObjectStore {
        self.object_store.as_ref()
    }

    pub fn credentials(&self) -> &dyn CredentialProvider {
        self.credentials.as_ref()
    }

    pub fn emit(&self, event: RunEvent) {
        self.events.emit(event);
    }

    /// Narrow the context to one task, for operators
    pub fn for_task<'a>(&'a self, task_id: &'a str) -> TaskContext<'a> {
        TaskContext { run: self, task_id }
    }
}

fn default_run_id(logical_time: DateTime<Utc>) -> String {
    format!(
        "{}-{}",
        logical_time.format("%Y%m%dT%H%M%S"),
        Utc::now().format("%H%M%S%3f")
    )
}

/// What an operator sees while it executes
#[derive(Clone, Copy)]
pub struct TaskContext<'a> {
    run: &'a ExecutionContext,
    task_id: &'a str,
}

impl<'a> TaskContext<'a> {
    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        self.run.render(template)
    }

    pub fn warehouse(&self) -> &'a dyn Warehouse {
        self.run.warehouse()
    }

    pub fn object_store(&self) -> &'a dyn ObjectStore {
        self.run.object_store()
    }

    pub fn credentials(&self) -> &'a dyn CredentialProvider {
        self.run.credentials()
    }

    /// Emit a progress message attributed to this task
    pub fn log(&self, message: impl Into<String>) {
        self.run.emit(RunEvent::TaskLog {
            task_id: self.task_id.to_string(),
            message: message.into(),
        });
    }
}
