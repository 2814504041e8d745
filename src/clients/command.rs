//! Warehouse client backed by a SQL shell process (psql and friends)
//!
//! Every statement runs in its own child process: the SQL goes to stdin,
//! stdout is split into rows and columns. A semaphore bounds how many
//! processes are alive at once, standing in for a connection pool.

use super::{Rows, Warehouse};
use crate::error::ClientError;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;

/// Connection settings from the `warehouse:` section of a pipeline file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarehouseConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_field_separator")]
    pub field_separator: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// stderr patterns that mark a failure as transient
    #[serde(default = "default_transient_patterns")]
    pub transient_patterns: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_field_separator() -> String {
    "|".to_string()
}

fn default_max_connections() -> usize {
    4
}

fn default_transient_patterns() -> Vec<String> {
    vec![
        r"(?i)timed? ?out".to_string(),
        r"(?i)connection (refused|reset|closed)".to_string(),
        r"(?i)could not connect".to_string(),
        r"(?i)deadlock detected".to_string(),
        r"(?i)lock (not available|wait timeout)".to_string(),
        r"(?i)serializable isolation violation".to_string(),
    ]
}

impl WarehouseConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            field_separator: default_field_separator(),
            max_connections: default_max_connections(),
            transient_patterns: default_transient_patterns(),
        }
    }
}

pub struct CommandWarehouse {
    config: WarehouseConfig,
    transient: Vec<Regex>,
    permits: Semaphore,
}

impl CommandWarehouse {
    pub fn new(config: WarehouseConfig) -> anyhow::Result<Self> {
        if config.program.trim().is_empty() {
            anyhow::bail!("warehouse program must not be empty");
        }
        if config.field_separator.is_empty() {
            anyhow::bail!("warehouse field_separator must not be empty");
        }

        let transient = config
            .transient_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let permits = Semaphore::new(config.max_connections.max(1));

        Ok(Self {
            config,
            transient,
            permits,
        })
    }

    fn classify(&self, stderr: &str) -> ClientError {
        let message = stderr.trim().to_string();
        if self.transient.iter().any(|re| re.is_match(&message)) {
            ClientError::transient(message)
        } else {
            ClientError::fatal(message)
        }
    }

    fn parse_rows(&self, stdout: &str) -> Rows {
        stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.split(self.config.field_separator.as_str())
                    .map(|col| col.to_string())
                    .collect()
            })
            .collect()
    }

    async fn run(&self, sql: &str) -> Result<Rows, ClientError> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ClientError::fatal(format!(
                    "failed to start warehouse client '{}': {}",
                    self.config.program, e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(sql.as_bytes())
                .await
                .map_err(|e| ClientError::transient(format!("failed to send statement: {}", e)))?;
            // closing stdin ends the session
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ClientError::transient(format!("warehouse client error: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err = self.classify(&stderr);
            log::debug!(
                "Warehouse statement failed ({}): {}",
                if err.transient { "transient" } else { "fatal" },
                err.message
            );
            return Err(err);
        }

        Ok(self.parse_rows(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl Warehouse for CommandWarehouse {
    async fn execute(&self, sql: &str) -> Result<Rows, ClientError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ClientError::fatal("warehouse client is shut down"))?;

        let timeout = Duration::from_secs(self.config.timeout_secs);
        match tokio::time::timeout(timeout, self.run(sql)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::transient(format!(
                "statement timed out after {}s",
                self.config.timeout_secs
            ))),
        }
    }
}
