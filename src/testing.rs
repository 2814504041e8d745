//! Test doubles shared by unit tests

use crate::clients::{CredentialProvider, Credentials, Rows, S3ObjectStore, Warehouse};
use crate::core::ExecutionContext;
use crate::error::ClientError;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::{Arc, Mutex};

type Responder = Box<dyn Fn(&str) -> Result<Rows, ClientError> + Send + Sync>;

/// Records every statement and answers through a closure
pub struct RecordingWarehouse {
    statements: Mutex<Vec<String>>,
    respond: Responder,
}

impl RecordingWarehouse {
    pub fn new() -> Self {
        Self::responding(|_| Ok(Vec::new()))
    }

    pub fn responding(
        respond: impl Fn(&str) -> Result<Rows, ClientError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            statements: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl Warehouse for RecordingWarehouse {
    async fn execute(&self, sql: &str) -> Result<Rows, ClientError> {
        self.statements.lock().unwrap().push(sql.to_string());
        (self.respond)(sql)
    }
}

pub struct StaticCredentials;

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn lookup(&self, _id: &str) -> Result<Credentials, ClientError> {
        Ok(Credentials {
            access_key: "AKIATEST".to_string(),
            secret: "secret".to_string(),
        })
    }
}

/// Context for 2024-01-01 with the given warehouse, still open for `with_*`
pub fn unshared_context(warehouse: Arc<dyn Warehouse>) -> ExecutionContext {
    let logical = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    ExecutionContext::new(
        logical,
        warehouse,
        Arc::new(S3ObjectStore::default()),
        Arc::new(StaticCredentials),
    )
    .with_run_id("test-run")
}

pub fn context(warehouse: Arc<dyn Warehouse>) -> Arc<ExecutionContext> {
    Arc::new(unshared_context(warehouse))
}

pub fn count_rows(n: i64) -> Rows {
    vec![vec![n.to_string()]]
}
