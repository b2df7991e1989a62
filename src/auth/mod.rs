//! Authentication subsystem.
//!
//! Credentials arrive as HTTP Basic headers and are checked against an
//! ordered list of [`CredentialVerifier`] backends: every configured
//! directory server first, then the optional htpasswd file.  The first
//! backend able to render a verdict decides; a backend that cannot be
//! reached is skipped, never treated as a deny.

pub mod basic;
pub mod htpasswd;
pub mod ldap;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::{BackendResult, MetricsRegistry};

// ---------------------------------------------------------------------------
// Request-scoped data
// ---------------------------------------------------------------------------

/// Username and secret presented for one authentication attempt.
///
/// The secret is redacted from `Debug` output so a stray `?credential` in a
/// log line cannot leak it.
pub struct Credential {
    username: String,
    secret: String,
}

impl Credential {
    /// Returns `None` for an empty username.
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Option<Self> {
        let username = username.into();
        if username.is_empty() {
            return None;
        }
        Some(Self {
            username,
            secret: secret.into(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// An identity that has passed authentication.
///
/// Only [`Authenticator::authenticate`] constructs this, so holding one is
/// proof that some backend accepted the caller's secret for this username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(String);

impl AuthenticatedUser {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl fmt::Display for AuthenticatedUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated(AuthenticatedUser),
    Unauthenticated,
    /// No backend was able to render a verdict.
    BackendError,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A backend able to check a username/secret pair.
///
/// `Ok(true)` / `Ok(false)` is a definitive verdict.  `Err` means the backend
/// could not answer at all (unreachable, unreadable, unexpected response) and
/// the next backend should be consulted.
#[async_trait::async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Short label used in logs and metrics.
    fn name(&self) -> &str;

    async fn verify(&self, username: &str, secret: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Authenticator
// ---------------------------------------------------------------------------

/// Ordered-fallback authenticator over a fixed list of verifiers.
pub struct Authenticator {
    verifiers: Vec<Arc<dyn CredentialVerifier>>,
    backend_timeout: Duration,
    metrics: MetricsRegistry,
}

impl Authenticator {
    pub fn new(
        verifiers: Vec<Arc<dyn CredentialVerifier>>,
        backend_timeout: Duration,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            verifiers,
            backend_timeout,
            metrics,
        }
    }

    pub fn backend_count(&self) -> usize {
        self.verifiers.len()
    }

    /// Consult each verifier in priority order until one gives a verdict.
    pub async fn authenticate(&self, credential: &Credential) -> AuthOutcome {
        let username = credential.username();

        for verifier in &self.verifiers {
            let backend = verifier.name();
            let verdict = tokio::time::timeout(
                self.backend_timeout,
                verifier.verify(username, &credential.secret),
            )
            .await;

            match verdict {
                Ok(Ok(true)) => {
                    self.metrics
                        .metrics
                        .record_backend(backend, BackendResult::Allow);
                    debug!(%username, %backend, "credentials accepted");
                    return AuthOutcome::Authenticated(AuthenticatedUser(username.to_string()));
                }
                Ok(Ok(false)) => {
                    self.metrics
                        .metrics
                        .record_backend(backend, BackendResult::Deny);
                    info!(%username, %backend, "credentials rejected");
                    return AuthOutcome::Unauthenticated;
                }
                Ok(Err(e)) => {
                    self.metrics
                        .metrics
                        .record_backend(backend, BackendResult::Unavailable);
                    warn!(%username, %backend, error = %e, "credential backend unavailable, trying next");
                }
                Err(_) => {
                    self.metrics
                        .metrics
                        .record_backend(backend, BackendResult::Unavailable);
                    warn!(
                        %username,
                        %backend,
                        timeout_secs = self.backend_timeout.as_secs(),
                        "credential backend timed out, trying next"
                    );
                }
            }
        }

        warn!(%username, backends = self.verifiers.len(), "no credential backend could render a verdict");
        AuthOutcome::BackendError
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the verifier chain in priority order: every directory URL as
/// configured, then the htpasswd file if one is set.
pub fn build_verifiers(config: &Config) -> Vec<Arc<dyn CredentialVerifier>> {
    let timeout = Duration::from_secs(config.base.backend_timeout_secs);
    let mut verifiers: Vec<Arc<dyn CredentialVerifier>> = config
        .ldap
        .target_urls()
        .into_iter()
        .map(|url| {
            Arc::new(ldap::LdapVerifier::new(
                url,
                &config.ldap.bind_pattern,
                timeout,
            )) as Arc<dyn CredentialVerifier>
        })
        .collect();

    if let Some(path) = &config.base.htpasswd_filename {
        verifiers.push(Arc::new(htpasswd::HtpasswdVerifier::new(path)));
    }
    verifiers
}


#[cfg(test)]
mod tests {
    use super::testing::{HangingVerifier, StubVerifier};
    use super::*;

    fn authenticator(verifiers: Vec<Arc<dyn CredentialVerifier>>) -> Authenticator {
        Authenticator::new(verifiers, Duration::from_secs(1), MetricsRegistry::new())
    }

    fn cred(user: &str, pass: &str) -> Credential {
        Credential::new(user, pass).unwrap()
    }

    #[test]
    fn credential_requires_username() {
        assert!(Credential::new("", "secret").is_none());
        assert!(Credential::new("alice", "").is_some());
    }

    #[test]
    fn credential_debug_redacts_secret() {
        let rendered = format!("{:?}", cred("alice", "hunter2"));
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn first_definitive_allow_wins() {
        let primary = Arc::new(StubVerifier::with_users("primary", &[("alice", "pw")]));
        let secondary = Arc::new(StubVerifier::with_users("secondary", &[]));
        let auth = authenticator(vec![primary.clone(), secondary.clone()]);

        let outcome = auth.authenticate(&cred("alice", "pw")).await;
        assert_eq!(
            outcome,
            AuthOutcome::Authenticated(AuthenticatedUser("alice".into()))
        );
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn first_definitive_deny_is_not_overruled() {
        // The secondary would accept, but the primary's deny is final.
        let primary = Arc::new(StubVerifier::with_users("primary", &[("alice", "other")]));
        let secondary = Arc::new(StubVerifier::with_users("secondary", &[("alice", "pw")]));
        let auth = authenticator(vec![primary.clone(), secondary.clone()]);

        assert_eq!(
            auth.authenticate(&cred("alice", "pw")).await,
            AuthOutcome::Unauthenticated
        );
        assert_eq!(primary.call_count(), 1);
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_primary_falls_through_to_secondary() {
        let primary = Arc::new(StubVerifier::unreachable("primary"));
        let secondary = Arc::new(StubVerifier::with_users("secondary", &[("alice", "pw")]));
        let auth = authenticator(vec![primary.clone(), secondary.clone()]);

        assert_eq!(
            auth.authenticate(&cred("alice", "pw")).await,
            AuthOutcome::Authenticated(AuthenticatedUser("alice".into()))
        );
        assert_eq!(
            auth.authenticate(&cred("alice", "wrong")).await,
            AuthOutcome::Unauthenticated
        );
        assert_eq!(primary.call_count(), 2);
    }

    #[tokio::test]
    async fn all_backends_unreachable_is_backend_error() {
        let auth = authenticator(vec![
            Arc::new(StubVerifier::unreachable("a")),
            Arc::new(StubVerifier::unreachable("b")),
        ]);
        assert_eq!(
            auth.authenticate(&cred("alice", "pw")).await,
            AuthOutcome::BackendError
        );
    }

    #[tokio::test]
    async fn no_backends_is_backend_error() {
        let auth = authenticator(vec![]);
        assert_eq!(
            auth.authenticate(&cred("alice", "pw")).await,
            AuthOutcome::BackendError
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_backend_is_skipped() {
        let fallback = Arc::new(StubVerifier::with_users("fallback", &[("alice", "pw")]));
        let auth = authenticator(vec![Arc::new(HangingVerifier), fallback.clone()]);

        assert_eq!(
            auth.authenticate(&cred("alice", "pw")).await,
            AuthOutcome::Authenticated(AuthenticatedUser("alice".into()))
        );
        assert_eq!(fallback.call_count(), 1);
    }

    #[tokio::test]
    async fn backend_results_are_counted() {
        let metrics = MetricsRegistry::new();
        let auth = Authenticator::new(
            vec![
                Arc::new(StubVerifier::unreachable("ldaps://down")),
                Arc::new(StubVerifier::with_users("htpasswd", &[("alice", "pw")])),
            ],
            Duration::from_secs(1),
            metrics.clone(),
        );
        auth.authenticate(&cred("alice", "pw")).await;

        let text = metrics.encode().unwrap();
        assert!(text.contains("backend=\"ldaps://down\",result=\"Unavailable\"} 1"));
        assert!(text.contains("backend=\"htpasswd\",result=\"Allow\"} 1"));
    }

    #[test]
    fn build_verifiers_orders_directories_before_file() {
        let config: Config = serde_yaml::from_str(
            r#"
base:
  http_address: ":33443"
  tls_cert_filename: a
  tls_key_filename: b
  ssh_ca_filename: c
  htpasswd_filename: /etc/certgen/htpasswd
ldap:
  bind_pattern: "uid=%s,dc=example"
  ldap_target_urls: "ldaps://one.example,ldaps://two.example"
"#,
        )
        .unwrap();

        let names: Vec<String> = build_verifiers(&config)
            .iter()
            .map(|v| v.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["ldaps://one.example", "ldaps://two.example", "htpasswd"]
        );
    }
}
