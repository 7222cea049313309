//! Test doubles for the secret source and session backend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::config::{GuardConfig, RealmIdentity, RetryPolicy};
use crate::kdc::KdcCandidate;
use crate::secrets::{CredentialBlob, SecretError, SecretSource};
use crate::session::{EstablishError, RefreshError, SessionBackend, SessionHandle};

pub(crate) fn test_identity() -> RealmIdentity {
    RealmIdentity {
        realm: "EXAMPLE.COM".to_string(),
        principal: "svc_gateway@EXAMPLE.COM".to_string(),
    }
}

pub(crate) fn test_config(kdcs: &[&str], retry: RetryPolicy) -> GuardConfig {
    GuardConfig {
        identity: test_identity(),
        keytab_secret: "/etc/ktgate/service.keytab".to_string(),
        kdcs: kdcs
            .iter()
            .enumerate()
            .map(|(position, host)| KdcCandidate {
                host: host.to_string(),
                position,
            })
            .collect(),
        retry,
    }
}

/// Secret source that counts fetches and attaches a release probe to every
/// blob it hands out, so tests can assert the keytab was dropped exactly once.
pub(crate) struct MockSecretSource {
    fetches: AtomicUsize,
    releases: Arc<AtomicUsize>,
    fail_with: Option<SecretError>,
}

impl MockSecretSource {
    pub(crate) fn new() -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            releases: Arc::new(AtomicUsize::new(0)),
            fail_with: None,
        }
    }

    pub(crate) fn failing(error: SecretError) -> Self {
        Self {
            fail_with: Some(error),
            ..Self::new()
        }
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretSource for MockSecretSource {
    async fn fetch(&self, _secret_id: &str) -> Result<CredentialBlob, SecretError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        Ok(CredentialBlob::with_drop_probe(
            b"keytab-material".to_vec(),
            Arc::clone(&self.releases),
        ))
    }
}

/// Scripted session backend: hosts listed as unreachable or rejected fail
/// accordingly, everything else establishes a session bound to that host.
pub(crate) struct MockBackend {
    unreachable: Mutex<Vec<String>>,
    rejected: Mutex<Vec<String>>,
    establish_delay: Option<Duration>,
    refresh_fails: AtomicBool,
    establishes: AtomicUsize,
    refreshes: AtomicUsize,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self {
            unreachable: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            establish_delay: None,
            refresh_fails: AtomicBool::new(false),
            establishes: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_establish_delay(mut self, delay: Duration) -> Self {
        self.establish_delay = Some(delay);
        self
    }

    pub(crate) fn set_unreachable(&self, hosts: &[&str]) {
        *self.unreachable.lock().unwrap() = hosts.iter().map(|h| h.to_string()).collect();
    }

    pub(crate) fn set_rejected(&self, hosts: &[&str]) {
        *self.rejected.lock().unwrap() = hosts.iter().map(|h| h.to_string()).collect();
    }

    pub(crate) fn fail_refresh(&self, fail: bool) {
        self.refresh_fails.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn establish_count(&self) -> usize {
        self.establishes.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionBackend for MockBackend {
    async fn establish(
        &self,
        kdc: &KdcCandidate,
        keytab: &CredentialBlob,
        identity: &RealmIdentity,
    ) -> Result<SessionHandle, EstablishError> {
        self.establishes.fetch_add(1, Ordering::SeqCst);
        assert!(!keytab.is_empty(), "establish called without keytab material");

        if let Some(delay) = self.establish_delay {
            tokio::time::sleep(delay).await;
        }

        if self.unreachable.lock().unwrap().contains(&kdc.host) {
            return Err(EstablishError::Unreachable {
                kdc: kdc.host.clone(),
                detail: "connection refused".to_string(),
            });
        }
        if self.rejected.lock().unwrap().contains(&kdc.host) {
            return Err(EstablishError::Rejected {
                kdc: kdc.host.clone(),
                detail: "preauthentication failed".to_string(),
            });
        }

        Ok(SessionHandle::new(
            identity.realm.clone(),
            identity.principal.clone(),
            kdc.host.clone(),
            format!("ticket-{}", kdc.host),
            Utc::now() + chrono::Duration::minutes(5),
        ))
    }

    async fn refresh(&self, session: &SessionHandle) -> Result<(), RefreshError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.refresh_fails.load(Ordering::SeqCst) {
            return Err(RefreshError::Failed {
                kdc: session.kdc().to_string(),
                detail: "renewal window closed".to_string(),
            });
        }
        session.renew_until(Utc::now() + chrono::Duration::minutes(60));
        Ok(())
    }

    async fn query(&self, _session: &SessionHandle, input: &str) -> Result<String> {
        Ok(input.to_uppercase())
    }
}
