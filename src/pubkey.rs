//! Syntactic checks on single-line OpenSSH public keys.
//!
//! Accepted shape:
//!
//! ```text
//! <algorithm> SP <base64>[=[=]] [SP <comment up to 512 bytes>] [LF]
//! ```
//!
//! This is a gate in front of the signer, not a decoder: a line can pass
//! here and still fail to decode as a key.

use thiserror::Error;

pub const ACCEPTED_ALGORITHMS: [&str; 4] = [
    "ssh-rsa",
    "ssh-dss",
    "ecdsa-sha2-nistp256",
    "ssh-ed25519",
];

pub const MAX_COMMENT_BYTES: usize = 512;

/// Whole-line bound; comfortably above a 16384-bit RSA key plus comment.
pub const MAX_KEY_BYTES: usize = 8 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyGrammarError {
    #[error("public key exceeds {MAX_KEY_BYTES} bytes")]
    TooLong,
    #[error("public key must be a single line")]
    MultipleLines,
    #[error("unsupported key algorithm")]
    UnsupportedAlgorithm,
    #[error("missing key payload")]
    MissingPayload,
    #[error("key payload is not base64")]
    InvalidPayload,
    #[error("key comment exceeds {MAX_COMMENT_BYTES} bytes")]
    CommentTooLong,
}

/// Public key text that passed [`PublicKeyMaterial::parse`], kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyMaterial(String);

impl PublicKeyMaterial {
    pub fn parse(text: &str) -> Result<Self, KeyGrammarError> {
        if text.len() > MAX_KEY_BYTES {
            return Err(KeyGrammarError::TooLong);
        }
        let line = text.strip_suffix('\n').unwrap_or(text);
        if line.contains('\n') {
            return Err(KeyGrammarError::MultipleLines);
        }

        let (algorithm, rest) = line
            .split_once(' ')
            .ok_or(KeyGrammarError::MissingPayload)?;
        if !ACCEPTED_ALGORITHMS.contains(&algorithm) {
            return Err(KeyGrammarError::UnsupportedAlgorithm);
        }

        let (payload, comment) = match rest.split_once(' ') {
            Some((payload, comment)) => (payload, Some(comment)),
            None => (rest, None),
        };
        check_payload(payload)?;

        if comment.is_some_and(|c| c.len() > MAX_COMMENT_BYTES) {
            return Err(KeyGrammarError::CommentTooLong);
        }
        Ok(Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn algorithm(&self) -> &str {
        self.0.split(' ').next().unwrap_or_default()
    }
}

/// `[A-Za-z0-9+/]+` followed by at most two `=`.
fn check_payload(payload: &str) -> Result<(), KeyGrammarError> {
    if payload.is_empty() {
        return Err(KeyGrammarError::MissingPayload);
    }
    let body = payload.trim_end_matches('=');
    let padding = payload.len() - body.len();
    let body_ok = !body.is_empty()
        && body
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/');
    if !body_ok || padding > 2 {
        return Err(KeyGrammarError::InvalidPayload);
    }
    Ok(())
}
