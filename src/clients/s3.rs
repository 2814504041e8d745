//! Object store location resolver

use super::ObjectStore;
use crate::error::ClientError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectStoreConfig {
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_scheme() -> String {
    "s3".to_string()
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
        }
    }
}

/// Builds `<scheme>://bucket/key` locations
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    scheme: String,
}

impl S3ObjectStore {
    pub fn new(config: &ObjectStoreConfig) -> Self {
        Self {
            scheme: config.scheme.trim_end_matches("://").to_string(),
        }
    }
}

impl Default for S3ObjectStore {
    fn default() -> Self {
        Self::new(&ObjectStoreConfig::default())
    }
}

impl ObjectStore for S3ObjectStore {
    fn locate(&self, bucket: &str, key: &str) -> Result<String, ClientError> {
        let bucket = bucket.trim_matches('/');
        if bucket.is_empty() {
            return Err(ClientError::fatal("object store bucket must not be empty"));
        }
        if bucket.contains('/') {
            return Err(ClientError::fatal(format!(
                "invalid bucket name '{}'",
                bucket
            )));
        }
        let key = key.trim_start_matches('/');
        Ok(format!("{}://{}/{}", self.scheme, bucket, key))
    }
}
