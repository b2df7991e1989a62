//! Axum router and the certificate issuance handler.
//!
//! Routes:
//! - `GET  /certgen/{identity}` - Certify the identity's on-record key
//! - `POST /certgen/{identity}` - Certify the uploaded `pubkeyfile`
//! - `GET  /healthz`            - Health check
//! - `GET  /metrics`            - Prometheus metrics

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use tracing::{error, info, instrument, warn};

use super::validate::{self, KeyRequest, ValidationError};
use crate::auth::{basic, AuthOutcome};
use crate::certgen::{self, SigningError, SigningRequest};
use crate::metrics::{KeySource, KeySourceLabels, Outcome};
use crate::AppState;

/// Fixed download name for issued certificates.
const CERT_FILENAME: &str = "id_rsa-cert.pub";

const BASIC_CHALLENGE: &str = "Basic realm=\"User Credentials\"";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.base.max_upload_bytes;
    Router::new()
        // Every method is admitted here so 405 is decided after authentication.
        .route("/certgen/", any(handle_certgen))
        .route("/certgen/{*identity}", any(handle_certgen))
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET|POST /certgen/{identity}`
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn handle_certgen(State(state): State<Arc<AppState>>, request: Request) -> Response {
    match issue_certificate(&state, request).await {
        Ok(cert) => {
            state.metrics.metrics.record_outcome(Outcome::Issued);
            cert.into_response()
        }
        Err(err) => {
            state.metrics.metrics.record_outcome(err.outcome());
            err.into_response()
        }
    }
}

/// One pass through the admission pipeline.  Each `?` is a terminal state.
async fn issue_certificate(
    state: &AppState,
    request: Request,
) -> Result<CertificateResponse, AppError> {
    // 1. Credentials must be present before anything else is looked at.
    let credential =
        basic::credential_from_headers(request.headers()).ok_or(AppError::Unauthorized)?;

    // 2. Authenticate against the ordered verifier chain.
    let user = match state.authenticator.authenticate(&credential).await {
        AuthOutcome::Authenticated(user) => user,
        AuthOutcome::Unauthenticated => return Err(AppError::Unauthorized),
        AuthOutcome::BackendError => {
            return Err(AppError::Internal(anyhow::anyhow!(
                "no credential backend could verify {}",
                credential.username()
            )))
        }
    };

    // 3. The caller may only ask for their own identity.
    let target = validate::validate_target(request.method(), request.uri().path())?;
    if target.identity != user.as_str() {
        warn!(
            username = %user,
            requested = %target.identity,
            "authenticated identity does not match requested identity"
        );
        return Err(AppError::Forbidden);
    }

    // 4. Only now is the body worth parsing.
    let (public_key, source) = match target.key {
        KeyRequest::OnRecord => (None, KeySource::Lookup),
        KeyRequest::Upload => {
            let key =
                validate::read_public_key(request, state.config.base.max_upload_bytes).await?;
            (Some(key), KeySource::Upload)
        }
    };

    // 5. Exactly one signing request, bound to the authenticated user.
    let signing_request = SigningRequest::new(user, public_key);
    let started = Instant::now();
    let result = certgen::issue(state.oracle.as_ref(), &signing_request).await;
    state
        .metrics
        .metrics
        .signing_duration_seconds
        .observe(started.elapsed().as_secs_f64());

    let certificate = result.map_err(|e| match e {
        SigningError::KeyNotFound(username) => {
            info!(%username, "no public key on record");
            AppError::NotFound
        }
        SigningError::Failed(err) => AppError::Internal(err.context("certificate signing failed")),
    })?;

    state
        .metrics
        .metrics
        .certificates_issued_total
        .get_or_create(&KeySourceLabels { source })
        .inc();
    info!(username = %signing_request.subject(), ?source, "Generated certificate");

    Ok(CertificateResponse(certificate))
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the gateway.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Signed certificate text, served as a file download.
struct CertificateResponse(String);

impl IntoResponse for CertificateResponse {
    fn into_response(self) -> Response {
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{CERT_FILENAME}\""),
                ),
            ],
            self.0,
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Terminal failure states of the issuance pipeline, one per status code.
#[derive(Debug)]
pub enum AppError {
    /// Malformed request; the message is safe to show the caller.
    BadRequest(String),
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    /// Logged in full, reported to the caller as a bare 500.
    Internal(anyhow::Error),
}

impl AppError {
    pub fn outcome(&self) -> Outcome {
        match self {
            AppError::BadRequest(_) => Outcome::BadRequest,
            AppError::Unauthorized => Outcome::Unauthorized,
            AppError::Forbidden => Outcome::Forbidden,
            AppError::NotFound => Outcome::NotFound,
            AppError::MethodNotAllowed => Outcome::MethodNotAllowed,
            AppError::Internal(_) => Outcome::InternalError,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// `"<code> <reason>[ <message>]\n"`
fn status_body(status: StatusCode, message: Option<&str>) -> String {
    let reason = status.canonical_reason().unwrap_or_default();
    match message {
        Some(message) => format!("{} {reason} {message}\n", status.as_u16()),
        None => format!("{} {reason}\n", status.as_u16()),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            AppError::BadRequest(msg) => {
                info!(%status, reason = %msg, "rejected certificate request");
                (status, status_body(status, Some(&msg))).into_response()
            }
            AppError::Unauthorized => (
                status,
                [(header::WWW_AUTHENTICATE, BASIC_CHALLENGE)],
                status_body(status, None),
            )
                .into_response(),
            AppError::MethodNotAllowed => (
                status,
                [(header::ALLOW, "GET, POST")],
                status_body(status, None),
            )
                .into_response(),
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (status, status_body(status, None)).into_response()
            }
            AppError::Forbidden | AppError::NotFound => {
                (status, status_body(status, None)).into_response()
            }
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::MethodNotAllowed(_) => AppError::MethodNotAllowed,
            other => AppError::BadRequest(other.to_string()),
        }
    }
}
