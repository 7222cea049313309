//! One-time session bootstrap shared by every request.
//!
//! The process may receive many concurrent requests before a session exists,
//! so the bootstrap runs behind a double-checked gate:
//!
//! - Fast path: a lock-free read of the published handle. Warm requests never
//!   touch a lock.
//! - Slow path: an async mutex serializes the attempt. Callers that arrive
//!   while an attempt is in flight suspend on the mutex and then observe that
//!   attempt's outcome instead of starting their own.
//!
//! The handle is published through a `OnceLock`: once set it is never
//! replaced, which is exactly the "Ready is terminal" contract. A failed
//! attempt is recorded with its attempt number so callers that waited behind
//! it share its error, while a caller arriving after the failure completed
//! may start a fresh attempt (subject to the configured retry policy).

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, GuardConfig, RetryPolicy};
use crate::kdc::{resolve_session, ResolveError};
use crate::secrets::{SecretError, SecretSource};
use crate::session::{RefreshError, SessionBackend, SessionHandle};

/// Why a bootstrap attempt failed. Cloneable so every caller that joined the
/// attempt receives the same value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to retrieve keytab: {0}")]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Observable bootstrap state. `Ready` never reverts; `Failed` may transition
/// back to `Initializing` when a retry runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

struct FailedAttempt {
    attempt: u64,
    error: InitError,
}

struct SlowState {
    attempts: u64,
    last_failure: Option<FailedAttempt>,
}

/// Concurrency-safe, failover-aware lazy bootstrap of the process-wide
/// session. Constructed once at startup and shared by reference with every
/// request path.
pub struct SessionGuard {
    config: GuardConfig,
    secrets: Arc<dyn SecretSource>,
    backend: Arc<dyn SessionBackend>,
    ready: OnceLock<Arc<SessionHandle>>,
    /// Number of finished attempts, readable without the lock. A caller
    /// snapshots this before queueing so it can tell a failure it waited for
    /// apart from one that predates it.
    completed: AtomicU64,
    phase: AtomicU8,
    slow: Mutex<SlowState>,
}

impl SessionGuard {
    pub fn new(
        config: GuardConfig,
        secrets: Arc<dyn SecretSource>,
        backend: Arc<dyn SessionBackend>,
    ) -> Self {
        Self {
            config,
            secrets,
            backend,
            ready: OnceLock::new(),
            completed: AtomicU64::new(0),
            phase: AtomicU8::new(InitState::Uninitialized as u8),
            slow: Mutex::new(SlowState {
                attempts: 0,
                last_failure: None,
            }),
        }
    }

    /// Return the shared session, bootstrapping it first if no attempt has
    /// succeeded yet. Any number of callers may race here; at most one
    /// fetch-and-failover sweep runs at a time, and every caller of the same
    /// attempt observes the same outcome.
    pub async fn ensure_initialized(&self) -> Result<Arc<SessionHandle>, InitError> {
        // Fast path: once a handle is published it is never replaced.
        if let Some(handle) = self.ready.get() {
            return Ok(Arc::clone(handle));
        }

        let seen_completed = self.completed.load(Ordering::Acquire);

        debug!("session not ready, waiting for the bootstrap lock");
        let mut slow = self.slow.lock().await;

        // Double-check: another caller may have finished while we waited.
        if let Some(handle) = self.ready.get() {
            debug!("session was established while waiting, skipping bootstrap");
            return Ok(Arc::clone(handle));
        }

        if let Some(failed) = &slow.last_failure {
            // An attempt that finished after our snapshot is one we queued
            // behind; its outcome is our outcome. Older failures are only
            // returned when retry is disabled, except configuration errors:
            // the configuration cannot change for the process lifetime, so
            // retrying those can never succeed.
            if failed.attempt > seen_completed
                || self.config.retry == RetryPolicy::Never
                || matches!(failed.error, InitError::Config(_))
            {
                return Err(failed.error.clone());
            }
        }

        let attempt = slow.attempts + 1;
        slow.attempts = attempt;
        self.phase.store(InitState::Initializing as u8, Ordering::Release);
        info!(attempt, "bootstrapping session");

        let result = match self.run_attempt().await {
            Ok(handle) => {
                let handle = Arc::new(handle);
                // Publish before flipping the state so a lock-free reader
                // that observes Ready always finds a complete handle.
                let _ = self.ready.set(Arc::clone(&handle));
                self.phase.store(InitState::Ready as u8, Ordering::Release);
                slow.last_failure = None;
                info!(kdc = handle.kdc(), "session established");
                Ok(handle)
            }
            Err(error) => {
                warn!(attempt, %error, "session bootstrap failed");
                self.phase.store(InitState::Failed as u8, Ordering::Release);
                slow.last_failure = Some(FailedAttempt {
                    attempt,
                    error: error.clone(),
                });
                Err(error)
            }
        };
        self.completed.store(attempt, Ordering::Release);
        result
    }

    /// One fetch-and-failover sweep. The keytab lives to the end of this
    /// scope only; it is zeroized on drop whether the sweep succeeds, a
    /// candidate fails, or every candidate is exhausted.
    async fn run_attempt(&self) -> Result<SessionHandle, InitError> {
        // A configuration that cannot succeed must not cost a secret fetch.
        if self.config.kdcs.is_empty() {
            return Err(ConfigError::NoKdcCandidates.into());
        }

        let keytab = self.secrets.fetch(&self.config.keytab_secret).await?;
        debug!(bytes = keytab.len(), "keytab retrieved");

        let handle = resolve_session(
            self.backend.as_ref(),
            &self.config.identity,
            &self.config.kdcs,
            &keytab,
        )
        .await?;

        Ok(handle)
    }

    /// Renew the established session in place. Only valid once the bootstrap
    /// has succeeded. Never takes the bootstrap lock, so fast-path callers of
    /// [`ensure_initialized`](Self::ensure_initialized) are unaffected. A
    /// failed renewal leaves the session in its prior usable state.
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        let Some(handle) = self.ready.get() else {
            return Err(RefreshError::NotReady);
        };
        self.backend.refresh(handle).await
    }

    /// Snapshot of the bootstrap state, for logs and diagnostics. The
    /// authoritative Ready signal is the published handle.
    #[allow(dead_code)]
    pub fn state(&self) -> InitState {
        match self.phase.load(Ordering::Acquire) {
            x if x == InitState::Initializing as u8 => InitState::Initializing,
            x if x == InitState::Ready as u8 => InitState::Ready,
            x if x == InitState::Failed as u8 => InitState::Failed,
            _ => InitState::Uninitialized,
        }
    }

    /// The established session, if any.
    #[allow(dead_code)]
    pub fn session(&self) -> Option<Arc<SessionHandle>> {
        self.ready.get().map(Arc::clone)
    }
}
