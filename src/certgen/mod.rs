//! Certificate minting behind the [`SigningOracle`] seam.
//!
//! The HTTP layer never touches the CA key.  It builds one [`SigningRequest`]
//! per admitted request and hands it to whichever oracle the process was
//! started with: [`signer::SshCertSigner`] in production, a spy in tests.

pub mod lookup;
pub mod signer;

use thiserror::Error;

use crate::auth::AuthenticatedUser;
use crate::pubkey::PublicKeyMaterial;

/// The only data ever handed to a [`SigningOracle`].
///
/// The subject is an [`AuthenticatedUser`], so a request can only be built
/// for an identity that actually authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    subject: AuthenticatedUser,
    public_key: Option<PublicKeyMaterial>,
}

impl SigningRequest {
    /// `public_key = None` asks the oracle to use the subject's on-record key.
    pub fn new(subject: AuthenticatedUser, public_key: Option<PublicKeyMaterial>) -> Self {
        Self {
            subject,
            public_key,
        }
    }

    pub fn subject(&self) -> &AuthenticatedUser {
        &self.subject
    }

    pub fn public_key(&self) -> Option<&PublicKeyMaterial> {
        self.public_key.as_ref()
    }
}

#[derive(Debug, Error)]
pub enum SigningError {
    /// No usable public key is on record for the subject.
    #[error("no public key on record for {0}")]
    KeyNotFound(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Mints OpenSSH user certificates.  Returns the certificate text.
#[async_trait::async_trait]
pub trait SigningOracle: Send + Sync {
    /// Certify a caller-supplied public key for `subject`.
    async fn sign(
        &self,
        subject: &str,
        public_key: &PublicKeyMaterial,
    ) -> Result<String, SigningError>;

    /// Look up `subject`'s on-record key and certify it.
    async fn sign_on_record(&self, subject: &str) -> Result<String, SigningError>;
}

/// Route a request to the oracle operation matching its key source.
pub async fn issue(
    oracle: &dyn SigningOracle,
    request: &SigningRequest,
) -> Result<String, SigningError> {
    let subject = request.subject().as_str();
    match request.public_key() {
        Some(key) => oracle.sign(subject, key).await,
        None => oracle.sign_on_record(subject).await,
    }
}
