//! Request validation for `/certgen/<identity>`.
//!
//! Split in two phases so the handler can run the identity check between
//! them: [`validate_target`] looks only at the method and path and costs
//! nothing, [`read_public_key`] consumes the (size-bounded) POST body.

use axum::extract::{FromRequest, Multipart, Request};
use axum::http::{header, Method, StatusCode};
use thiserror::Error;
use tracing::info;

use crate::pubkey::{KeyGrammarError, PublicKeyMaterial};

pub const CERTGEN_PATH: &str = "/certgen/";

/// Multipart field carrying the public key file.
pub const KEY_FIELD: &str = "pubkeyfile";

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),
    #[error("request body exceeds {0} bytes")]
    TooLarge(usize),
    /// Details are logged, never returned to the caller.
    #[error("error parsing form")]
    Form,
    #[error("missing public key file")]
    MissingKeyFile,
    #[error("more than one public key file")]
    DuplicateKeyFile,
    #[error("public key file is not valid UTF-8")]
    NotUtf8,
    #[error("invalid public key: {0}")]
    Key(#[from] KeyGrammarError),
}

/// Where the key to be certified comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRequest {
    /// GET: certify the key on record for the identity.
    OnRecord,
    /// POST: certify the key uploaded in the form.
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Path remainder after [`CERTGEN_PATH`], not decoded.
    pub identity: String,
    pub key: KeyRequest,
}

/// Classify the method and extract the requested identity from `path`.
pub fn validate_target(method: &Method, path: &str) -> Result<Target, ValidationError> {
    let key = match *method {
        Method::GET => KeyRequest::OnRecord,
        Method::POST => KeyRequest::Upload,
        _ => return Err(ValidationError::MethodNotAllowed(method.clone())),
    };
    let identity = path.strip_prefix(CERTGEN_PATH).unwrap_or_default();
    Ok(Target {
        identity: identity.to_string(),
        key,
    })
}

/// Extract exactly one `pubkeyfile` part from a multipart body and check it
/// against the key grammar.
///
/// A declared `Content-Length` over `max_bytes` is refused before any body
/// byte is read; an undeclared length is capped by the router's body limit.
pub async fn read_public_key(
    request: Request,
    max_bytes: usize,
) -> Result<PublicKeyMaterial, ValidationError> {
    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > max_bytes as u64) {
        return Err(ValidationError::TooLarge(max_bytes));
    }

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| {
            info!(detail = %e.body_text(), "multipart request rejected");
            ValidationError::Form
        })?;

    let mut key_file = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(multipart_error(e.status(), e.body_text(), max_bytes)),
        };
        if field.name() != Some(KEY_FIELD) {
            continue;
        }
        if key_file.is_some() {
            return Err(ValidationError::DuplicateKeyFile);
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error(e.status(), e.body_text(), max_bytes))?;
        key_file = Some(bytes);
    }

    let bytes = key_file.ok_or(ValidationError::MissingKeyFile)?;
    let text = std::str::from_utf8(&bytes).map_err(|_| ValidationError::NotUtf8)?;
    Ok(PublicKeyMaterial::parse(text)?)
}

fn multipart_error(status: StatusCode, detail: String, max_bytes: usize) -> ValidationError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ValidationError::TooLarge(max_bytes)
    } else {
        info!(%detail, "malformed multipart body");
        ValidationError::Form
    }
}


#[cfg(test)]
mod tests {
    use axum::body::Body;

    use super::testing::{multipart_body, multipart_request, upload};
    use super::*;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIxxx user@host\n";
    const LIMIT: usize = 64 * 1024;

    fn post(body: String) -> Request {
        multipart_request("/certgen/alice")
            .body(Body::from(body))
            .unwrap()
    }

    #[test]
    fn get_requests_on_record_key() {
        let target = validate_target(&Method::GET, "/certgen/alice").unwrap();
        assert_eq!(
            target,
            Target {
                identity: "alice".into(),
                key: KeyRequest::OnRecord
            }
        );
    }

    #[test]
    fn post_requests_upload() {
        let target = validate_target(&Method::POST, "/certgen/alice").unwrap();
        assert_eq!(target.key, KeyRequest::Upload);
    }

    #[test]
    fn identity_is_taken_verbatim() {
        let target = validate_target(&Method::GET, "/certgen/al%69ce/x").unwrap();
        assert_eq!(target.identity, "al%69ce/x");
        let target = validate_target(&Method::GET, "/certgen/").unwrap();
        assert_eq!(target.identity, "");
    }

    #[test]
    fn other_methods_rejected() {
        for method in [Method::PUT, Method::DELETE, Method::PATCH, Method::HEAD] {
            assert!(matches!(
                validate_target(&method, "/certgen/alice"),
                Err(ValidationError::MethodNotAllowed(m)) if m == method
            ));
        }
    }

    #[tokio::test]
    async fn reads_single_key_file() {
        let key = read_public_key(upload("/certgen/alice", KEY), LIMIT)
            .await
            .unwrap();
        assert_eq!(key.as_str(), KEY);
    }

    #[tokio::test]
    async fn ignores_unrelated_fields() {
        let body = multipart_body(&[("note", "n.txt", "hello"), ("pubkeyfile", "k.pub", KEY)]);
        let key = read_public_key(post(body), LIMIT).await.unwrap();
        assert_eq!(key.as_str(), KEY);
    }

    #[tokio::test]
    async fn missing_key_field() {
        let body = multipart_body(&[("other", "k.pub", KEY)]);
        assert!(matches!(
            read_public_key(post(body), LIMIT).await,
            Err(ValidationError::MissingKeyFile)
        ));
    }

    #[tokio::test]
    async fn duplicate_key_field() {
        let body = multipart_body(&[("pubkeyfile", "a.pub", KEY), ("pubkeyfile", "b.pub", KEY)]);
        assert!(matches!(
            read_public_key(post(body), LIMIT).await,
            Err(ValidationError::DuplicateKeyFile)
        ));
    }

    #[tokio::test]
    async fn two_keys_in_one_file() {
        let two = "ssh-rsa AAAAB3NzaC1yc2E\nssh-rsa AAAAB3NzaC1yc2E\n";
        assert!(matches!(
            read_public_key(upload("/certgen/alice", two), LIMIT).await,
            Err(ValidationError::Key(KeyGrammarError::MultipleLines))
        ));
    }

    #[tokio::test]
    async fn not_multipart() {
        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/certgen/alice")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(KEY))
            .unwrap();
        assert!(matches!(
            read_public_key(request, LIMIT).await,
            Err(ValidationError::Form)
        ));
    }

    #[tokio::test]
    async fn declared_length_over_limit_rejected_up_front() {
        let body = multipart_body(&[("pubkeyfile", "k.pub", KEY)]);
        let request = multipart_request("/certgen/alice")
            .header(header::CONTENT_LENGTH, (LIMIT + 1).to_string())
            .body(Body::from(body))
            .unwrap();
        assert!(matches!(
            read_public_key(request, LIMIT).await,
            Err(ValidationError::TooLarge(LIMIT))
        ));
    }

    #[tokio::test]
    async fn non_utf8_key_file() {
        let mut body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"pubkeyfile\"; filename=\"k\"\r\n\r\n",
            b = testing::BOUNDARY
        )
        .into_bytes();
        body.extend_from_slice(&[0xff, 0xfe, 0x00]);
        body.extend_from_slice(format!("\r\n--{}--\r\n", testing::BOUNDARY).as_bytes());
        let request = multipart_request("/certgen/alice")
            .body(Body::from(body))
            .unwrap();
        assert!(matches!(
            read_public_key(request, LIMIT).await,
            Err(ValidationError::NotUtf8)
        ));
    }
}
