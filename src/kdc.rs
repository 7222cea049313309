//! KDC candidates and the failover resolver.
//!
//! A realm usually advertises several interchangeable KDCs; only some may be
//! reachable from any given network. The resolver walks the configured list
//! in order and returns the first session it can establish. Per-candidate
//! failures are recorded, not propagated: the caller either gets a session or
//! an aggregate error naming every candidate tried and why it failed.

use std::fmt;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::RealmIdentity;
use crate::secrets::CredentialBlob;
use crate::session::{EstablishError, SessionBackend, SessionHandle};

/// One candidate KDC: a hostname plus its position in the configured order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdcCandidate {
    pub host: String,
    pub position: usize,
}

impl KdcCandidate {
    /// Parse a comma-separated host list. Entries are trimmed, blanks are
    /// dropped, and duplicates collapse to the first occurrence (hostname
    /// comparison is case-insensitive).
    pub fn parse_list(csv: &str) -> Vec<KdcCandidate> {
        let mut candidates: Vec<KdcCandidate> = Vec::new();
        for part in csv.split(',') {
            let host = part.trim().to_ascii_lowercase();
            if host.is_empty() || candidates.iter().any(|c| c.host == host) {
                continue;
            }
            let position = candidates.len();
            candidates.push(KdcCandidate { host, position });
        }
        candidates
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdcFailure {
    pub kdc: String,
    pub error: EstablishError,
}

/// Every configured KDC was tried and none produced a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllKdcsFailed {
    pub failures: Vec<KdcFailure>,
}

impl fmt::Display for AllKdcsFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unable to establish a session against any of the {} configured KDCs: ",
            self.failures.len()
        )?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.kdc, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AllKdcsFailed {}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no KDC candidates configured")]
    NoCandidates,
    #[error(transparent)]
    AllFailed(AllKdcsFailed),
}

/// Try each candidate in order with the shared keytab, returning the first
/// session established. The keytab is only borrowed; the caller owns its
/// lifetime.
pub async fn resolve_session(
    backend: &dyn SessionBackend,
    identity: &RealmIdentity,
    candidates: &[KdcCandidate],
    keytab: &CredentialBlob,
) -> Result<SessionHandle, ResolveError> {
    if candidates.is_empty() {
        return Err(ResolveError::NoCandidates);
    }

    let mut failures = Vec::with_capacity(candidates.len());
    for kdc in candidates {
        match backend.establish(kdc, keytab, identity).await {
            Ok(handle) => {
                if !failures.is_empty() {
                    info!(
                        kdc = %kdc.host,
                        skipped = failures.len(),
                        "session established after failover"
                    );
                }
                return Ok(handle);
            }
            Err(error) => {
                warn!(
                    kdc = %kdc.host,
                    position = kdc.position,
                    %error,
                    "KDC attempt failed, trying next candidate"
                );
                failures.push(KdcFailure {
                    kdc: kdc.host.clone(),
                    error,
                });
            }
        }
    }

    Err(ResolveError::AllFailed(AllKdcsFailed { failures }))
}
