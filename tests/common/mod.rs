//! In-memory warehouse used by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use regex::Regex;
use starpipe::clients::{CredentialProvider, Credentials, Rows, Warehouse};
use starpipe::error::ClientError;
use std::collections::HashMap;
use std::sync::Mutex;

struct Failure {
    pattern: String,
    remaining: u32,
    transient: bool,
    /// Apply the statement's effect before reporting the error
    after_loading: bool,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, i64>,
    sources: HashMap<String, i64>,
    upstream: HashMap<String, Vec<String>>,
    statements: Vec<String>,
    failures: Vec<Failure>,
}

impl State {
    /// Rows a load into `table` produces right now. A derived table yields
    /// nothing while any table it reads from is empty.
    fn produced(&self, table: &str) -> i64 {
        let starved = self.upstream.get(table).map_or(false, |from| {
            from.iter()
                .any(|t| self.tables.get(t).copied().unwrap_or(0) == 0)
        });
        if starved {
            0
        } else {
            self.sources.get(table).copied().unwrap_or(0)
        }
    }
}

/// Tracks row counts per table from the statements the operators send.
///
/// `COPY` and `INSERT` append the number of rows registered with
/// [`FakeWarehouse::with_rows`]; `TRUNCATE` empties a table; an upsert leaves
/// as many rows as it produces when the table already holds them.
pub struct FakeWarehouse {
    state: Mutex<State>,
    truncate: Regex,
    copy: Regex,
    upsert: Regex,
    insert: Regex,
    count: Regex,
}

impl FakeWarehouse {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            truncate: Regex::new(r"^TRUNCATE TABLE (\w+);").unwrap(),
            copy: Regex::new(r"^COPY (\w+)\s").unwrap(),
            upsert: Regex::new(r"^BEGIN;\s*DELETE FROM (\w+) USING").unwrap(),
            insert: Regex::new(r"^INSERT INTO (\w+)\s").unwrap(),
            count: Regex::new(r"^SELECT COUNT\(\*\) FROM (\w+)( WHERE \w+ IS NULL)?;").unwrap(),
        }
    }

    /// Rows a load into `table` produces
    pub fn with_rows(self, table: &str, rows: i64) -> Self {
        self.state
            .lock()
            .unwrap()
            .sources
            .insert(table.to_string(), rows);
        self
    }

    /// Loads into `table` come up empty while any of `from` is empty
    pub fn derived_from(self, table: &str, from: &[&str]) -> Self {
        self.state.lock().unwrap().upstream.insert(
            table.to_string(),
            from.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    /// The sparkify tables, all non-empty, each fed by the tables its
    /// insert query reads
    pub fn sparkify() -> Self {
        Self::new()
            .with_rows("staging_events", 8056)
            .with_rows("staging_songs", 385)
            .with_rows("songplays", 6820)
            .with_rows("users", 104)
            .with_rows("songs", 384)
            .with_rows("artists", 355)
            .with_rows("time", 6820)
            .derived_from("songplays", &["staging_events"])
            .derived_from("users", &["staging_events"])
            .derived_from("songs", &["staging_songs"])
            .derived_from("artists", &["staging_songs"])
            .derived_from("time", &["songplays"])
    }

    /// Fail the next `times` statements containing `pattern`
    pub fn fail(self, pattern: &str, times: u32, transient: bool) -> Self {
        self.push_failure(pattern, times, transient, false)
    }

    /// Like [`FakeWarehouse::fail`] with a transient error, but only after
    /// the statement has already written its rows
    pub fn fail_after_loading(self, pattern: &str, times: u32) -> Self {
        self.push_failure(pattern, times, true, true)
    }

    fn push_failure(self, pattern: &str, times: u32, transient: bool, after_loading: bool) -> Self {
        self.state.lock().unwrap().failures.push(Failure {
            pattern: pattern.to_string(),
            remaining: times,
            transient,
            after_loading,
        });
        self
    }

    pub fn rows(&self, table: &str) -> i64 {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn statements_matching(&self, pattern: &str) -> usize {
        self.statements()
            .iter()
            .filter(|s| s.contains(pattern))
            .count()
    }
}

fn capture(re: &Regex, sql: &str) -> Option<String> {
    re.captures(sql).map(|c| c[1].to_string())
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn execute(&self, sql: &str) -> Result<Rows, ClientError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.statements.push(sql.to_string());

        let injected = state
            .failures
            .iter_mut()
            .find(|f| f.remaining > 0 && sql.contains(&f.pattern))
            .map(|failure| {
                failure.remaining -= 1;
                let error = ClientError {
                    transient: failure.transient,
                    message: format!("injected failure for '{}'", failure.pattern),
                };
                (error, failure.after_loading)
            });
        let injected = match injected {
            Some((error, false)) => return Err(error),
            Some((error, true)) => Some(error),
            None => None,
        };

        if let Some(table) = capture(&self.truncate, sql) {
            state.tables.insert(table, 0);
        } else if let Some(table) = capture(&self.copy, sql) {
            let rows = state.produced(&table);
            *state.tables.entry(table).or_insert(0) += rows;
        } else if let Some(table) = capture(&self.upsert, sql) {
            let rows = state.produced(&table);
            let existing = state.tables.entry(table).or_insert(0);
            *existing = (*existing).max(rows);
        } else if let Some(table) = capture(&self.insert, sql) {
            let rows = state.produced(&table);
            *state.tables.entry(table).or_insert(0) += rows;
        } else if let Some(caps) = self.count.captures(sql) {
            let count = if caps.get(2).is_some() {
                0
            } else {
                state.tables.get(&caps[1]).copied().unwrap_or(0)
            };
            return match injected {
                Some(error) => Err(error),
                None => Ok(vec![vec![count.to_string()]]),
            };
        }

        match injected {
            Some(error) => Err(error),
            None => Ok(Vec::new()),
        }
    }
}

pub struct StaticCredentials;

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn lookup(&self, _id: &str) -> Result<Credentials, ClientError> {
        Ok(Credentials {
            access_key: "AKIAINTEGRATION".to_string(),
            secret: "integration-secret".to_string(),
        })
    }
}
