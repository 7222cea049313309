//! Keytab retrieval and credential lifetime.
//!
//! The keytab is sensitive material with a deliberately short life: it is
//! fetched inside a single bootstrap attempt, lent to the failover sweep by
//! reference, and zeroized when the attempt's scope unwinds. Nothing outside
//! the attempt may retain it, and it never appears in logs or `Debug` output.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretVec};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("access to secret denied: {0}")]
    AccessDenied(String),
    #[error("failed to read secret {id}: {detail}")]
    Io { id: String, detail: String },
    #[error("failed to decode secret {id}: {detail}")]
    Decode { id: String, detail: String },
}

/// Opaque keytab material, zeroized on drop.
pub struct CredentialBlob {
    material: SecretVec<u8>,
    drop_probe: Option<Arc<AtomicUsize>>,
}

impl CredentialBlob {
    pub fn new(material: Vec<u8>) -> Self {
        Self {
            material: SecretVec::new(material),
            drop_probe: None,
        }
    }

    /// Tests attach a counter to observe that release runs exactly once.
    #[cfg(test)]
    pub(crate) fn with_drop_probe(material: Vec<u8>, probe: Arc<AtomicUsize>) -> Self {
        Self {
            material: SecretVec::new(material),
            drop_probe: Some(probe),
        }
    }

    pub fn expose(&self) -> &[u8] {
        self.material.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.material.expose_secret().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for CredentialBlob {
    fn drop(&mut self) {
        // The material itself is zeroized by SecretVec.
        if let Some(probe) = &self.drop_probe {
            probe.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for CredentialBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBlob")
            .field("len", &self.len())
            .field("material", &"[REDACTED]")
            .finish()
    }
}

/// Async fetch of an opaque keytab by identifier.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch(&self, secret_id: &str) -> Result<CredentialBlob, SecretError>;
}

/// Reads the keytab from disk; the secret id is the file path.
pub struct FileSecretSource;

#[async_trait]
impl SecretSource for FileSecretSource {
    async fn fetch(&self, secret_id: &str) -> Result<CredentialBlob, SecretError> {
        match tokio::fs::read(secret_id).await {
            Ok(bytes) => {
                debug!(secret = secret_id, bytes = bytes.len(), "loaded keytab from file");
                Ok(CredentialBlob::new(bytes))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SecretError::NotFound(secret_id.to_string()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(SecretError::AccessDenied(secret_id.to_string()))
            }
            Err(err) => Err(SecretError::Io {
                id: secret_id.to_string(),
                detail: err.to_string(),
            }),
        }
    }
}

/// Reads a base64-encoded keytab from the environment variable named by the
/// secret id. Useful where the deployment platform injects secrets as env vars.
pub struct EnvSecretSource;

#[async_trait]
impl SecretSource for EnvSecretSource {
    async fn fetch(&self, secret_id: &str) -> Result<CredentialBlob, SecretError> {
        let encoded = std::env::var(secret_id)
            .map_err(|_| SecretError::NotFound(secret_id.to_string()))?;

        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|err| SecretError::Decode {
                id: secret_id.to_string(),
                detail: err.to_string(),
            })?;

        debug!(secret = secret_id, bytes = bytes.len(), "decoded keytab from environment");
        Ok(CredentialBlob::new(bytes))
    }
}
