//! Runtime configuration for the session bootstrap.
//!
//! Everything the guard consumes is fixed at process start: the realm and
//! principal identity, the secret id naming the keytab, the KDC candidate
//! list, and the retry policy. Values come from CLI flags with `KTGATE_*`
//! environment fallbacks so deployments can override them without changing
//! the invocation.

use clap::{Args, ValueEnum};
use thiserror::Error;

use crate::kdc::KdcCandidate;

/// Configuration problems that make a bootstrap impossible. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("realm must not be empty")]
    MissingRealm,
    #[error("principal must not be empty")]
    MissingPrincipal,
    #[error("keytab secret id must not be empty")]
    MissingSecretId,
    #[error("no KDC candidates configured")]
    NoKdcCandidates,
}

/// What happens on the request after a failed bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RetryPolicy {
    /// Run the full fetch-and-failover sweep again.
    Always,
    /// Record the first failure and return it to every later request.
    Never,
}

/// Where the keytab secret lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SecretSourceKind {
    /// The secret id is a path to a keytab file.
    File,
    /// The secret id names an environment variable holding the keytab base64-encoded.
    Env,
}

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Kerberos realm, e.g. EXAMPLE.COM
    #[arg(long, env = "KTGATE_REALM")]
    pub realm: String,

    /// Principal to authenticate as, e.g. svc_gateway@EXAMPLE.COM
    #[arg(long, env = "KTGATE_PRINCIPAL")]
    pub principal: String,

    /// Secret id naming the keytab (meaning depends on --secret-source)
    #[arg(long, env = "KTGATE_KEYTAB_SECRET")]
    pub keytab_secret: String,

    /// Comma-separated KDC hostnames, tried in order
    #[arg(long, env = "KTGATE_KDCS")]
    pub kdcs: String,

    /// Where the keytab secret is stored
    #[arg(long, env = "KTGATE_SECRET_SOURCE", value_enum, default_value = "file")]
    pub secret_source: SecretSourceKind,

    /// Whether a failed bootstrap may be retried on the next request
    #[arg(long, env = "KTGATE_RETRY", value_enum, default_value = "always")]
    pub retry: RetryPolicy,

    /// Port the ticket gateway listens on
    #[arg(long, env = "KTGATE_GATEWAY_PORT", default_value_t = 8443)]
    pub gateway_port: u16,
}

/// The identity a session is established for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmIdentity {
    pub realm: String,
    pub principal: String,
}

/// Validated configuration handed to the guard at construction.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub identity: RealmIdentity,
    pub keytab_secret: String,
    pub kdcs: Vec<KdcCandidate>,
    pub retry: RetryPolicy,
}

impl GuardConfig {
    pub fn from_args(args: &ConfigArgs) -> Result<Self, ConfigError> {
        if args.realm.trim().is_empty() {
            return Err(ConfigError::MissingRealm);
        }
        if args.principal.trim().is_empty() {
            return Err(ConfigError::MissingPrincipal);
        }
        if args.keytab_secret.trim().is_empty() {
            return Err(ConfigError::MissingSecretId);
        }

        let kdcs = KdcCandidate::parse_list(&args.kdcs);
        if kdcs.is_empty() {
            return Err(ConfigError::NoKdcCandidates);
        }

        Ok(Self {
            identity: RealmIdentity {
                realm: args.realm.trim().to_string(),
                principal: args.principal.trim().to_string(),
            },
            keytab_secret: args.keytab_secret.trim().to_string(),
            kdcs,
            retry: args.retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(realm: &str, principal: &str, secret: &str, kdcs: &str) -> ConfigArgs {
        ConfigArgs {
            realm: realm.to_string(),
            principal: principal.to_string(),
            keytab_secret: secret.to_string(),
            kdcs: kdcs.to_string(),
            secret_source: SecretSourceKind::File,
            retry: RetryPolicy::Always,
            gateway_port: 8443,
        }
    }

    #[test]
    fn test_valid_config() {
        let config = GuardConfig::from_args(&args(
            "EXAMPLE.COM",
            "svc_gateway@EXAMPLE.COM",
            "/etc/ktgate/service.keytab",
            "dc1.example.com,dc2.example.com",
        ))
        .unwrap();

        assert_eq!(config.identity.realm, "EXAMPLE.COM");
        assert_eq!(config.kdcs.len(), 2);
        assert_eq!(config.kdcs[0].host, "dc1.example.com");
        assert_eq!(config.kdcs[1].position, 1);
    }

    #[test]
    fn test_blank_identity_rejected() {
        let err = GuardConfig::from_args(&args("  ", "p@R", "s", "dc1")).unwrap_err();
        assert_eq!(err, ConfigError::MissingRealm);

        let err = GuardConfig::from_args(&args("R", "", "s", "dc1")).unwrap_err();
        assert_eq!(err, ConfigError::MissingPrincipal);

        let err = GuardConfig::from_args(&args("R", "p@R", " ", "dc1")).unwrap_err();
        assert_eq!(err, ConfigError::MissingSecretId);
    }

    #[test]
    fn test_empty_kdc_list_rejected() {
        let err = GuardConfig::from_args(&args("R", "p@R", "s", " , ,")).unwrap_err();
        assert_eq!(err, ConfigError::NoKdcCandidates);
    }
}
