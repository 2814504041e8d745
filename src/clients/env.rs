//! Credentials from the process environment

use super::{CredentialProvider, Credentials};
use crate::error::ClientError;
use async_trait::async_trait;

/// Reads `<ID>_ACCESS_KEY_ID` and `<ID>_SECRET_ACCESS_KEY`.
///
/// The id is upper-cased and every non-alphanumeric character becomes `_`,
/// so `aws_credentials` maps to `AWS_CREDENTIALS_ACCESS_KEY_ID`.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    pub fn new() -> Self {
        Self
    }

    pub fn var_prefix(id: &str) -> String {
        id.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn lookup(&self, id: &str) -> Result<Credentials, ClientError> {
        let prefix = Self::var_prefix(id);
        let read = |suffix: &str| {
            let name = format!("{}_{}", prefix, suffix);
            std::env::var(&name)
                .map_err(|_| ClientError::fatal(format!("credential variable {} is not set", name)))
        };

        Ok(Credentials {
            access_key: read("ACCESS_KEY_ID")?,
            secret: read("SECRET_ACCESS_KEY")?,
        })
    }
}
