use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub verifiers: CheckResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub htpasswd: Option<CheckResult>,
    pub key_lookup: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

fn check_verifiers(count: usize) -> CheckResult {
    if count == 0 {
        CheckResult::unhealthy("no credential backends configured")
    } else {
        CheckResult::healthy(format!("{count} configured"))
    }
}

async fn check_file(path: &str, what: &str) -> CheckResult {
    match tokio::fs::metadata(Path::new(path)).await {
        Ok(meta) if meta.is_file() => CheckResult::healthy(path),
        Ok(_) => CheckResult::unhealthy(format!("{what} {path} is not a regular file")),
        Err(e) => CheckResult::unhealthy(format!("{what} {path}: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks, verifier_count: usize) -> HealthStatus {
    // The password file only takes the service down when it is the sole backend.
    let htpasswd_ok = checks.htpasswd.as_ref().map_or(true, |c| c.ok);
    let htpasswd_critical = !htpasswd_ok && verifier_count <= 1;

    if !checks.verifiers.ok || htpasswd_critical {
        HealthStatus::Unhealthy
    } else if !htpasswd_ok || !checks.key_lookup.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let verifier_count = state.authenticator.backend_count();
    let base = &state.config.base;

    let htpasswd = match &base.htpasswd_filename {
        Some(path) => Some(check_file(path, "htpasswd file").await),
        None => None,
    };
    let key_lookup = check_file(&base.authorized_keys_command, "key lookup command").await;

    let checks = HealthChecks {
        verifiers: check_verifiers(verifier_count),
        htpasswd,
        key_lookup,
    };
    let status = aggregate_status(&checks, verifier_count);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
