//! On-record public key lookup for certificate requests that carry no key.
//!
//! Runs an `AuthorizedKeysCommand`-style program (by default SSSD's
//! `sss_ssh_authorizedkeys`) with the username as its only argument and
//! takes the first line that passes the key grammar.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::pubkey::PublicKeyMaterial;

pub struct AuthorizedKeysCommand {
    program: String,
    timeout: Duration,
}

impl AuthorizedKeysCommand {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// `Ok(None)` when the command ran but printed no acceptable key.
    pub async fn lookup(&self, username: &str) -> Result<Option<PublicKeyMaterial>> {
        if username.starts_with('-') {
            bail!("refusing to pass option-like username {username:?} to {}", self.program);
        }

        let child = tokio::process::Command::new(&self.program)
            .arg(username)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .with_context(|| format!("{} timed out", self.program))?
            .with_context(|| format!("failed to execute {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(first_acceptable_key(&stdout, username))
    }
}

fn first_acceptable_key(output: &str, username: &str) -> Option<PublicKeyMaterial> {
    for line in output.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match PublicKeyMaterial::parse(line) {
            Ok(key) => {
                debug!(%username, algorithm = key.algorithm(), "found on-record key");
                return Some(key);
            }
            Err(e) => warn!(%username, error = %e, "skipping unusable on-record key line"),
        }
    }
    None
}
