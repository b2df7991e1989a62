use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

/// Terminal state of one `/certgen/` request.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Issued,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    InternalError,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

/// Result of consulting a single credential backend.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum BackendResult {
    Allow,
    Deny,
    Unavailable,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub backend: String,
    pub result: BackendResult,
}

/// Where the certified public key came from.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum KeySource {
    Upload,
    Lookup,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KeySourceLabels {
    pub source: KeySource,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the gateway.
pub struct Metrics {
    pub requests_total: Family<OutcomeLabels, Counter>,
    pub auth_backend_total: Family<BackendLabels, Counter>,
    pub certificates_issued_total: Family<KeySourceLabels, Counter>,
    pub signing_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "certgen_requests",
            "Certificate requests by terminal outcome",
            requests_total.clone(),
        );

        let auth_backend_total = Family::<BackendLabels, Counter>::default();
        registry.register(
            "certgen_auth_backend",
            "Credential backend consultations by backend and result",
            auth_backend_total.clone(),
        );

        let certificates_issued_total = Family::<KeySourceLabels, Counter>::default();
        registry.register(
            "certgen_certificates_issued",
            "Certificates issued by public key source",
            certificates_issued_total.clone(),
        );

        let signing_duration_seconds = Histogram::new(exponential_buckets(0.0005, 2.0, 14));
        registry.register(
            "certgen_signing_duration_seconds",
            "Signing oracle latency in seconds",
            signing_duration_seconds.clone(),
        );

        Self {
            requests_total,
            auth_backend_total,
            certificates_issued_total,
            signing_duration_seconds,
        }
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        self.requests_total
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
    }

    pub fn record_backend(&self, backend: &str, result: BackendResult) {
        self.auth_backend_total
            .get_or_create(&BackendLabels {
                backend: backend.to_string(),
                result,
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
