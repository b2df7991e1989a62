//! Password-file credential verifier.
//!
//! The file is re-read on every check so edits take effect without a
//! restart.  Only bcrypt entries are accepted; a user whose entry uses any
//! other scheme makes the backend unable to answer rather than denying.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::debug;

use super::CredentialVerifier;

pub struct HtpasswdVerifier {
    path: PathBuf,
}

impl HtpasswdVerifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Find the hash recorded for `username`, ignoring blanks and `#` comments.
fn find_entry<'a>(contents: &'a str, username: &str) -> Option<&'a str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .find(|(user, _)| *user == username)
        .map(|(_, hash)| hash)
}

fn is_bcrypt(hash: &str) -> bool {
    ["$2a$", "$2b$", "$2y$"]
        .iter()
        .any(|prefix| hash.starts_with(prefix))
}

#[async_trait::async_trait]
impl CredentialVerifier for HtpasswdVerifier {
    fn name(&self) -> &str {
        "htpasswd"
    }

    async fn verify(&self, username: &str, secret: &str) -> Result<bool> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read htpasswd file {}", self.path.display()))?;

        let Some(hash) = find_entry(&contents, username) else {
            debug!(%username, "user not present in htpasswd file");
            return Ok(false);
        };
        if !is_bcrypt(hash) {
            bail!("htpasswd entry for {username} uses an unsupported hash scheme");
        }

        let hash = hash.to_string();
        let secret = secret.to_string();
        tokio::task::spawn_blocking(move || bcrypt::verify(secret, &hash))
            .await
            .context("bcrypt task panicked")?
            .context("malformed bcrypt hash")
    }
}
