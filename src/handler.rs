//! Request handling glue: bootstrap, renew, query.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::guard::SessionGuard;
use crate::session::SessionBackend;

/// Handles one request: make sure the shared session exists, renew it, then
/// run the downstream query with it.
pub struct RequestHandler {
    guard: Arc<SessionGuard>,
    backend: Arc<dyn SessionBackend>,
}

impl RequestHandler {
    pub fn new(guard: Arc<SessionGuard>, backend: Arc<dyn SessionBackend>) -> Self {
        Self { guard, backend }
    }

    pub async fn handle(&self, input: &str) -> Result<String> {
        let session = self
            .guard
            .ensure_initialized()
            .await
            .context("session bootstrap failed")?;

        // A failed renewal does not invalidate the session for this request;
        // surface it and keep going.
        if let Err(error) = self.guard.refresh().await {
            warn!(%error, "session renewal failed, continuing with current session");
        }

        let output = self
            .backend
            .query(&session, input)
            .await
            .context("downstream query failed")?;
        debug!(len = output.len(), "downstream query answered");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::testutil::{test_config, MockBackend, MockSecretSource};

    fn handler(backend: Arc<MockBackend>) -> RequestHandler {
        let guard = Arc::new(SessionGuard::new(
            test_config(&["dc1.example.com"], RetryPolicy::Always),
            Arc::new(MockSecretSource::new()),
            Arc::clone(&backend) as Arc<dyn SessionBackend>,
        ));
        RequestHandler::new(guard, backend)
    }

    #[tokio::test]
    async fn test_handler_bootstraps_then_queries() {
        let backend = Arc::new(MockBackend::new());
        let handler = handler(Arc::clone(&backend));

        let output = handler.handle("hello world").await.unwrap();
        assert_eq!(output, "HELLO WORLD");
        assert_eq!(backend.establish_count(), 1);
        assert_eq!(backend.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_renewal_failure_does_not_fail_request() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_refresh(true);
        let handler = handler(Arc::clone(&backend));

        let output = handler.handle("still works").await.unwrap();
        assert_eq!(output, "STILL WORKS");
    }

    #[tokio::test]
    async fn test_bootstrap_failure_fails_request() {
        let backend = Arc::new(MockBackend::new());
        backend.set_unreachable(&["dc1.example.com"]);
        let handler = handler(Arc::clone(&backend));

        let err = handler.handle("nope").await.unwrap_err();
        assert!(err.to_string().contains("session bootstrap failed"));
    }
}
