//! HTTP Basic `Authorization` header decoding.

use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use super::Credential;

/// Decode `Authorization: Basic <base64(user:secret)>`.
///
/// Returns `None` when the header is absent, uses another scheme, is not
/// valid base64 / UTF-8, lacks the `:` separator, or names an empty user.
pub fn credential_from_headers(headers: &HeaderMap) -> Option<Credential> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, secret) = decoded.split_once(':')?;
    Credential::new(username, secret)
}
