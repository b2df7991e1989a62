//! OpenSSH user-certificate signing with the in-memory CA key.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use ssh_key::certificate::{Builder as CertBuilder, CertType};
use ssh_key::rand_core::{OsRng, RngCore};
use ssh_key::{PrivateKey, PublicKey};
use tracing::{debug, warn};

use super::lookup::AuthorizedKeysCommand;
use super::{SigningError, SigningOracle};
use crate::pubkey::PublicKeyMaterial;

/// Extensions granted to every certificate (the `ssh-keygen` defaults).
const EXTENSIONS: [&str; 5] = [
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

pub struct SshCertSigner {
    ca_key: Arc<PrivateKey>,
    host_identity: String,
    validity: Duration,
    lookup: AuthorizedKeysCommand,
}

impl SshCertSigner {
    pub fn new(
        ca_key: PrivateKey,
        host_identity: impl Into<String>,
        validity: Duration,
        lookup: AuthorizedKeysCommand,
    ) -> Self {
        Self {
            ca_key: Arc::new(ca_key),
            host_identity: host_identity.into(),
            validity,
            lookup,
        }
    }

    /// Sign `key_text` for `subject` off the async runtime.
    async fn certify(&self, subject: &str, key_text: &str) -> Result<String> {
        let ca_key = Arc::clone(&self.ca_key);
        let key_id = format!("{}_{}", self.host_identity, subject);
        let subject = subject.to_string();
        let key_text = key_text.to_string();
        let validity = self.validity;

        tokio::task::spawn_blocking(move || {
            build_certificate(&ca_key, &subject, &key_id, &key_text, validity)
        })
        .await
        .context("signing task panicked")?
    }
}

/// Load an unencrypted OpenSSH-format CA private key.
pub fn load_ca_key(path: impl AsRef<Path>) -> Result<PrivateKey> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read ssh CA file: {}", path.display()))?;
    let key = PrivateKey::from_openssh(&contents)
        .with_context(|| format!("failed to parse ssh CA file: {}", path.display()))?;
    if key.is_encrypted() {
        bail!("ssh CA file {} is passphrase-protected", path.display());
    }
    Ok(key)
}

fn build_certificate(
    ca_key: &PrivateKey,
    subject: &str,
    key_id: &str,
    key_text: &str,
    validity: Duration,
) -> Result<String> {
    let public_key =
        PublicKey::from_openssh(key_text.trim_end()).context("user public key does not decode")?;

    let valid_after = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the unix epoch")?
        .as_secs();
    let valid_before = valid_after + validity.as_secs();

    let mut builder = CertBuilder::new_with_random_nonce(
        &mut OsRng,
        public_key.key_data().clone(),
        valid_after,
        valid_before,
    )?;
    builder
        .serial(OsRng.next_u64())?
        .key_id(key_id)?
        .cert_type(CertType::User)?
        .valid_principal(subject)?
        .comment(key_id)?;
    for extension in EXTENSIONS {
        builder.extension(extension, "")?;
    }

    let cert = builder.sign(ca_key).context("CA signing failed")?;
    Ok(format!("{}\n", cert.to_openssh()?))
}

#[async_trait::async_trait]
impl SigningOracle for SshCertSigner {
    async fn sign(
        &self,
        subject: &str,
        public_key: &PublicKeyMaterial,
    ) -> Result<String, SigningError> {
        debug!(%subject, algorithm = public_key.algorithm(), "signing uploaded key");
        Ok(self.certify(subject, public_key.as_str()).await?)
    }

    async fn sign_on_record(&self, subject: &str) -> Result<String, SigningError> {
        let key = match self.lookup.lookup(subject).await {
            Ok(Some(key)) => key,
            Ok(None) => return Err(SigningError::KeyNotFound(subject.to_string())),
            Err(e) => {
                warn!(%subject, error = %e, "on-record key lookup failed");
                return Err(SigningError::KeyNotFound(subject.to_string()));
            }
        };
        debug!(%subject, algorithm = key.algorithm(), "signing on-record key");
        Ok(self.certify(subject, key.as_str()).await?)
    }
}

#[cfg(test)]
mod tests {
    use ssh_key::{Algorithm, Certificate};

    use super::*;

    fn random_key() -> PrivateKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
    }

    fn signer(ca_key: PrivateKey, lookup_program: &str) -> SshCertSigner {
        SshCertSigner::new(
            ca_key,
            "certhost",
            Duration::from_secs(3600),
            AuthorizedKeysCommand::new(lookup_program, Duration::from_secs(5)),
        )
    }

    fn user_key_line(key: &PrivateKey) -> PublicKeyMaterial {
        let line = format!("{}\n", key.public_key().to_openssh().unwrap());
        PublicKeyMaterial::parse(&line).unwrap()
    }

    #[tokio::test]
    async fn issues_user_certificate_for_subject() {
        let ca = random_key();
        let user = random_key();
        let signer = signer(ca.clone(), "/nonexistent");

        let text = signer.sign("alice", &user_key_line(&user)).await.unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.starts_with("ssh-ed25519-cert-v01@openssh.com "));

        let cert = Certificate::from_openssh(text.trim_end()).unwrap();
        assert_eq!(cert.cert_type(), CertType::User);
        assert_eq!(cert.valid_principals(), ["alice".to_string()]);
        assert_eq!(cert.key_id(), "certhost_alice");
        assert_eq!(cert.comment(), "certhost_alice");
        assert_eq!(cert.public_key(), user.public_key().key_data());
        assert_eq!(cert.signature_key(), ca.public_key().key_data());
        assert_eq!(cert.valid_before() - cert.valid_after(), 3600);
        for extension in EXTENSIONS {
            assert!(cert.extensions().contains_key(extension), "{extension}");
        }
    }

    #[tokio::test]
    async fn undecodable_key_is_signing_failure() {
        let signer = signer(random_key(), "/nonexistent");
        let garbage = PublicKeyMaterial::parse("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIxxx").unwrap();
        assert!(matches!(
            signer.sign("alice", &garbage).await,
            Err(SigningError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn failed_lookup_is_key_not_found() {
        let signer = signer(random_key(), "/nonexistent/certgen/keys");
        assert!(matches!(
            signer.sign_on_record("alice").await,
            Err(SigningError::KeyNotFound(user)) if user == "alice"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signs_on_record_key() {
        let user = random_key();
        let line = user.public_key().to_openssh().unwrap();
        let (_dir, program) =
            crate::certgen::lookup::testing::script(&format!("echo '{line}'"));
        let signer = signer(random_key(), &program);

        let text = signer.sign_on_record("alice").await.unwrap();
        let cert = Certificate::from_openssh(text.trim_end()).unwrap();
        assert_eq!(cert.public_key(), user.public_key().key_data());
        assert_eq!(cert.valid_principals(), ["alice".to_string()]);
    }

    #[test]
    fn load_ca_key_reads_openssh_file() {
        let ca = random_key();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca");
        let pem = ca.to_openssh(ssh_key::LineEnding::LF).unwrap();
        std::fs::write(&path, pem.as_bytes()).unwrap();

        let loaded = load_ca_key(&path).unwrap();
        assert_eq!(loaded.public_key(), ca.public_key());
    }

    #[test]
    fn load_ca_key_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca");
        std::fs::write(&path, "not a key").unwrap();
        let err = load_ca_key(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse ssh CA file"));
    }
}
