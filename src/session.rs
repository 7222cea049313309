//! Session backend contract and the REST ticket-gateway implementation.
//!
//! `SessionBackend` is the seam the guard and resolver work against:
//! establish a session against one KDC, renew it in place, and run the
//! downstream query with it. `RestTicketBackend` is the production
//! implementation, talking JSON to the ticket gateway fronting each KDC.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::config::RealmIdentity;
use crate::kdc::KdcCandidate;
use crate::secrets::CredentialBlob;

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Failure to establish a session against one KDC. The resolver records
/// these per candidate and moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EstablishError {
    #[error("unreachable: {detail}")]
    Unreachable { kdc: String, detail: String },
    #[error("credentials rejected: {detail}")]
    Rejected { kdc: String, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("session is not initialized yet")]
    NotReady,
    #[error("failed to renew session against {kdc}: {detail}")]
    Failed { kdc: String, detail: String },
}

/// A live authenticated session. Exactly one exists per process once the
/// bootstrap succeeds; it is shared by every request and renewed in place,
/// never replaced.
pub struct SessionHandle {
    realm: String,
    principal: String,
    kdc: String,
    token: String,
    expires_at: Mutex<DateTime<Utc>>,
}

impl SessionHandle {
    pub fn new(
        realm: String,
        principal: String,
        kdc: String,
        token: String,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            realm,
            principal,
            kdc,
            token,
            expires_at: Mutex::new(expires_at),
        }
    }

    #[allow(dead_code)]
    pub fn realm(&self) -> &str {
        &self.realm
    }

    #[allow(dead_code)]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// The KDC this session was established against.
    pub fn kdc(&self) -> &str {
        &self.kdc
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        *self
            .expires_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Renewal updates the expiry of the existing handle.
    pub fn renew_until(&self, expires_at: DateTime<Utc>) {
        *self
            .expires_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = expires_at;
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("realm", &self.realm)
            .field("principal", &self.principal)
            .field("kdc", &self.kdc)
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at())
            .finish()
    }
}

/// Establishes, renews, and queries through an authenticated session.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn establish(
        &self,
        kdc: &KdcCandidate,
        keytab: &CredentialBlob,
        identity: &RealmIdentity,
    ) -> Result<SessionHandle, EstablishError>;

    async fn refresh(&self, session: &SessionHandle) -> Result<(), RefreshError>;

    async fn query(&self, session: &SessionHandle, input: &str) -> Result<String>;
}

#[derive(Serialize)]
struct EstablishRequest<'a> {
    realm: &'a str,
    principal: &'a str,
    keytab: String,
}

#[derive(Deserialize)]
struct EstablishResponse {
    session_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct RenewRequest<'a> {
    session_token: &'a str,
}

#[derive(Deserialize)]
struct RenewResponse {
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    input: &'a str,
}

#[derive(Deserialize)]
struct QueryResponse {
    output: String,
}

/// REST client for the ticket gateway fronting each KDC.
pub struct RestTicketBackend {
    client: Client,
    user_agent: String,
    port: u16,
}

impl RestTicketBackend {
    pub fn new(port: u16) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            user_agent: format!("ktgate/{}", env!("CARGO_PKG_VERSION")),
            port,
        }
    }

    fn endpoint(&self, host: &str, path: &str) -> Result<Url, String> {
        let base = Url::parse(&format!("https://{}:{}/", host, self.port))
            .map_err(|err| format!("invalid KDC host {}: {}", host, err))?;
        base.join(path)
            .map_err(|err| format!("failed to build {} URL: {}", path, err))
    }
}

#[async_trait]
impl SessionBackend for RestTicketBackend {
    async fn establish(
        &self,
        kdc: &KdcCandidate,
        keytab: &CredentialBlob,
        identity: &RealmIdentity,
    ) -> Result<SessionHandle, EstablishError> {
        let url = self
            .endpoint(&kdc.host, "v1/sessions")
            .map_err(|detail| EstablishError::Unreachable {
                kdc: kdc.host.clone(),
                detail,
            })?;

        let body = EstablishRequest {
            realm: &identity.realm,
            principal: &identity.principal,
            keytab: STANDARD.encode(keytab.expose()),
        };

        let request_id = Uuid::new_v4().to_string();
        debug!(kdc = %kdc.host, %request_id, "requesting session from ticket gateway");

        let response = self
            .client
            .post(url)
            .header("User-Agent", &self.user_agent)
            .header("x-request-id", &request_id)
            .json(&body)
            .send()
            .await
            .map_err(|err| EstablishError::Unreachable {
                kdc: kdc.host.clone(),
                detail: err.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "no response body".to_string());
            return Err(EstablishError::Rejected {
                kdc: kdc.host.clone(),
                detail,
            });
        }
        if !status.is_success() {
            return Err(EstablishError::Unreachable {
                kdc: kdc.host.clone(),
                detail: format!("gateway returned status {}", status),
            });
        }

        let parsed: EstablishResponse =
            response
                .json()
                .await
                .map_err(|err| EstablishError::Unreachable {
                    kdc: kdc.host.clone(),
                    detail: format!("invalid gateway response: {}", err),
                })?;

        debug!(kdc = %kdc.host, expires_at = %parsed.expires_at, "session established");
        Ok(SessionHandle::new(
            identity.realm.clone(),
            identity.principal.clone(),
            kdc.host.clone(),
            parsed.session_token,
            parsed.expires_at,
        ))
    }

    async fn refresh(&self, session: &SessionHandle) -> Result<(), RefreshError> {
        let url = self
            .endpoint(session.kdc(), "v1/sessions/renew")
            .map_err(|detail| RefreshError::Failed {
                kdc: session.kdc().to_string(),
                detail,
            })?;

        let body = RenewRequest {
            session_token: session.token(),
        };

        let response = self
            .client
            .post(url)
            .header("User-Agent", &self.user_agent)
            .header("x-request-id", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await
            .map_err(|err| RefreshError::Failed {
                kdc: session.kdc().to_string(),
                detail: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Failed {
                kdc: session.kdc().to_string(),
                detail: format!("gateway returned status {}", status),
            });
        }

        let parsed: RenewResponse =
            response.json().await.map_err(|err| RefreshError::Failed {
                kdc: session.kdc().to_string(),
                detail: format!("invalid gateway response: {}", err),
            })?;

        session.renew_until(parsed.expires_at);
        debug!(kdc = session.kdc(), expires_at = %parsed.expires_at, "session renewed");
        Ok(())
    }

    async fn query(&self, session: &SessionHandle, input: &str) -> Result<String> {
        let url = self
            .endpoint(session.kdc(), "v1/query")
            .map_err(anyhow::Error::msg)?;

        let body = QueryRequest { input };

        let response = self
            .client
            .post(url.clone())
            .header("User-Agent", &self.user_agent)
            .header("x-request-id", Uuid::new_v4().to_string())
            .header("Authorization", format!("Bearer {}", session.token()))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to send query to {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("query failed with status {}: {}", status, error_text);
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .context("Failed to parse query response")?;
        Ok(parsed.output)
    }
}
