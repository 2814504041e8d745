//! External collaborators - warehouse, object store, credentials
//!
//! The orchestration core only talks to these traits. The bundled adapters
//! are deliberately thin: a SQL shell driven over stdin, an S3 location
//! resolver and an environment-backed credential lookup.

mod command;
mod env;
mod s3;

pub use command::{CommandWarehouse, WarehouseConfig};
pub use env::EnvCredentials;
pub use s3::{ObjectStoreConfig, S3ObjectStore};

use crate::error::ClientError;
use async_trait::async_trait;
use std::fmt;

/// Rows returned by a statement, one `Vec` of column values per row
pub type Rows = Vec<Vec<String>>;

/// Warehouse connection. Must tolerate concurrent use by independent tasks.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Rows, ClientError>;
}

/// Resolves a bucket and rendered key into a location the warehouse can bulk-load
pub trait ObjectStore: Send + Sync {
    fn locate(&self, bucket: &str, key: &str) -> Result<String, ClientError>;
}

/// Looks up access keys by credential id
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn lookup(&self, id: &str) -> Result<Credentials, ClientError>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}
