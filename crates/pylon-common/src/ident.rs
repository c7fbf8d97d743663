//! Agent identity providers
//!
//! An identity provider produces the stable unique identifier an agent uses
//! as its cluster id. The identifier must be deterministic across process
//! restarts on the same host; how it is derived is pluggable.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from identity resolution
#[derive(Debug, Error)]
pub enum IdentError {
    #[error("unknown identity provider: {0}")]
    UnknownProvider(String),

    #[error("failed to resolve identity: {0}")]
    Unavailable(String),
}

/// Produces a stable unique identifier for this agent
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentProvider: Send + Sync {
    async fn unique_identifier(&self) -> Result<String, IdentError>;
}

/// Identity derived from the host name
#[derive(Clone, Copy, Debug, Default)]
pub struct HostnameProvider;

#[async_trait]
impl IdentProvider for HostnameProvider {
    async fn unique_identifier(&self) -> Result<String, IdentError> {
        let name = hostname::get()
            .map_err(|e| IdentError::Unavailable(format!("hostname lookup failed: {e}")))?;
        name.into_string()
            .map_err(|_| IdentError::Unavailable("hostname is not valid UTF-8".to_string()))
    }
}

/// Identity backed by a UUID stored in a file
///
/// The UUID is generated on first use and read back on every later call, so
/// the identifier survives restarts as long as the file does.
#[derive(Clone, Debug)]
pub struct FileUuidProvider {
    path: PathBuf,
}

impl FileUuidProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl IdentProvider for FileUuidProvider {
    async fn unique_identifier(&self) -> Result<String, IdentError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(existing) => {
                let trimmed = existing.trim();
                uuid::Uuid::parse_str(trimmed).map_err(|e| {
                    IdentError::Unavailable(format!(
                        "identity file {} is corrupt: {e}",
                        self.path.display()
                    ))
                })?;
                Ok(trimmed.to_string())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let id = uuid::Uuid::new_v4().to_string();
                if let Some(parent) = self.path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        IdentError::Unavailable(format!("cannot create identity dir: {e}"))
                    })?;
                }
                tokio::fs::write(&self.path, &id).await.map_err(|e| {
                    IdentError::Unavailable(format!("cannot write identity file: {e}"))
                })?;
                Ok(id)
            }
            Err(e) => Err(IdentError::Unavailable(format!(
                "cannot read identity file {}: {e}",
                self.path.display()
            ))),
        }
    }
}

/// Look up a provider by its configured name
///
/// `"uuid"` accepts an optional `uuid:<path>` form overriding the default
/// identity file location.
pub fn get_provider(name: &str) -> Result<Box<dyn IdentProvider>, IdentError> {
    match name {
        "hostname" => Ok(Box::new(HostnameProvider)),
        "uuid" => Ok(Box::new(FileUuidProvider::new(
            "/var/lib/pylon/agent-identity",
        ))),
        other => match other.strip_prefix("uuid:") {
            Some(path) => Ok(Box::new(FileUuidProvider::new(path))),
            None => Err(IdentError::UnknownProvider(other.to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hostname_provider_is_deterministic() {
        let provider = HostnameProvider;
        let a = provider.unique_identifier().await.unwrap();
        let b = provider.unique_identifier().await.unwrap();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn file_uuid_provider_persists_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");
        let provider = FileUuidProvider::new(&path);

        let first = provider.unique_identifier().await.unwrap();
        let second = provider.unique_identifier().await.unwrap();
        assert_eq!(first, second);

        // a fresh provider pointed at the same file sees the same identity
        let other = FileUuidProvider::new(&path);
        assert_eq!(other.unique_identifier().await.unwrap(), first);
    }

    #[tokio::test]
    async fn corrupt_identity_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");
        tokio::fs::write(&path, "not-a-uuid").await.unwrap();

        let provider = FileUuidProvider::new(&path);
        assert!(provider.unique_identifier().await.is_err());
    }

    #[test]
    fn get_provider_resolves_known_names() {
        assert!(get_provider("hostname").is_ok());
        assert!(get_provider("uuid").is_ok());
        assert!(get_provider("uuid:/tmp/custom-identity").is_ok());
        assert!(matches!(
            get_provider("dns"),
            Err(IdentError::UnknownProvider(_))
        ));
    }
}
