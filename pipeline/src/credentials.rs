//! Connection credentials
//!
//! Supervisors ask the resolver for credentials every time they connect and
//! drop them with the connection. Nothing here caches secrets.

use crate::descriptor::StreamDescriptor;
use crate::error::SourceError;
use async_trait::async_trait;
use std::env;
use std::fmt;

/// A secret used to open one connection
#[derive(Clone)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Supplies credentials to supervisors at connect time
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolver name for identification and logging
    fn name(&self) -> &'static str;

    /// Credentials for `stream`, or `None` when the source is public
    async fn resolve(&self, stream: &StreamDescriptor) -> Result<Option<Credentials>, SourceError>;
}

/// Resolver for public sources
pub struct NoCredentials;

#[async_trait]
impl CredentialResolver for NoCredentials {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn resolve(&self, _stream: &StreamDescriptor) -> Result<Option<Credentials>, SourceError> {
        Ok(None)
    }
}

/// Reads `TULVA_CREDENTIAL_<STREAM>` at every connect
///
/// The stream name is upper-cased and non-alphanumerics become `_`, so
/// `alpaca-ticks` reads `TULVA_CREDENTIAL_ALPACA_TICKS`. A missing variable
/// means the source is public.
pub struct EnvCredentials {
    prefix: String,
}

impl EnvCredentials {
    pub fn new() -> Self {
        Self {
            prefix: "TULVA_CREDENTIAL_".to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Variable consulted for a stream name
    pub fn var_name(&self, stream: &str) -> String {
        let suffix: String = stream
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialResolver for EnvCredentials {
    fn name(&self) -> &'static str {
        "env"
    }

    async fn resolve(&self, stream: &StreamDescriptor) -> Result<Option<Credentials>, SourceError> {
        let var = self.var_name(&stream.name);
        match env::var(&var) {
            Ok(token) if !token.is_empty() => Ok(Some(Credentials::new(token))),
            Ok(_) | Err(env::VarError::NotPresent) => Ok(None),
            Err(env::VarError::NotUnicode(_)) => Err(SourceError::Credentials(format!(
                "{var} is not valid unicode"
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::parse::JsonParser;
    use crate::point::DataType;
    use std::sync::Arc;

    #[test]
    fn test_debug_redacts_token() {
        let creds = Credentials::new("hunter2");
        let shown = format!("{creds:?}");
        assert!(!shown.contains("hunter2"));
        assert_eq!(creds.token(), "hunter2");
    }

    #[test]
    fn test_env_var_name() {
        let resolver = EnvCredentials::new();
        assert_eq!(
            resolver.var_name("alpaca-ticks.v2"),
            "TULVA_CREDENTIAL_ALPACA_TICKS_V2"
        );
    }

    #[tokio::test]
    async fn test_missing_env_means_public() {
        let resolver = EnvCredentials::with_prefix("TULVA_TEST_UNSET_CREDENTIAL_");
        let stream = crate::descriptor::StreamDescriptor::push(
            "nobody-sets-this",
            DataType::News,
            "ws://localhost",
            Arc::new(JsonParser::new()),
        );
        assert!(resolver.resolve(&stream).await.unwrap().is_none());
        assert!(NoCredentials.resolve(&stream).await.unwrap().is_none());
    }
}
