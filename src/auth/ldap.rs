//! Directory-service credential verifier.
//!
//! Performs an LDAPS simple bind as `bind_pattern % username`.  A completed
//! bind exchange is a verdict whatever its result code; only a failure to
//! connect or to get a bind response is reported as backend unavailability.

use std::time::Duration;

use anyhow::{Context, Result};
use ldap3::{LdapConnAsync, LdapConnSettings};
use tracing::{debug, info};

use super::CredentialVerifier;

const RC_SUCCESS: u32 = 0;

pub struct LdapVerifier {
    url: String,
    bind_pattern: String,
    timeout: Duration,
}

impl LdapVerifier {
    pub fn new(url: &str, bind_pattern: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            bind_pattern: bind_pattern.to_string(),
            timeout,
        }
    }

    /// Substitute the DN-escaped username into the bind pattern.
    fn bind_dn(&self, username: &str) -> String {
        self.bind_pattern
            .replacen("%s", &ldap3::dn_escape(username), 1)
    }
}

#[async_trait::async_trait]
impl CredentialVerifier for LdapVerifier {
    fn name(&self) -> &str {
        &self.url
    }

    async fn verify(&self, username: &str, secret: &str) -> Result<bool> {
        // An empty password would be an unauthenticated bind, which most
        // servers accept.
        if secret.is_empty() {
            debug!(url = %self.url, %username, "empty password rejected without bind");
            return Ok(false);
        }

        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.url)
            .await
            .with_context(|| format!("failed to connect to {}", self.url))?;

        let url = self.url.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                debug!(%url, error = %e, "ldap connection closed with error");
            }
        });

        let result = ldap
            .with_timeout(self.timeout)
            .simple_bind(&self.bind_dn(username), secret)
            .await
            .with_context(|| format!("bind request to {} failed", self.url));
        let _ = ldap.unbind().await;

        // Locked or expired accounts come back as 49, 50 or 53 depending on
        // the server; all of them are a refusal.
        let response = result?;
        if response.rc == RC_SUCCESS {
            return Ok(true);
        }
        info!(
            url = %self.url,
            %username,
            rc = response.rc,
            text = %response.text,
            "directory refused bind"
        );
        Ok(false)
    }
}
