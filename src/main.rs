mod auth;
mod certgen;
mod config;
mod health;
mod http;
mod metrics;
mod pubkey;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::Authenticator;
use crate::certgen::lookup::AuthorizedKeysCommand;
use crate::certgen::signer::{self, SshCertSigner};
use crate::certgen::SigningOracle;
use crate::config::Config;
use crate::metrics::MetricsRegistry;

/// In-flight requests get this long to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "certgen", about = "SSH user-certificate issuance gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yml")]
    config: String,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    debug: bool,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Read-only state shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub authenticator: Arc<Authenticator>,
    /// Holds the CA key; handlers only ever reach it through [`certgen::issue`].
    pub oracle: Arc<dyn SigningOracle>,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Signing oracle setup
// ---------------------------------------------------------------------------

fn build_signer(config: &Config) -> Result<SshCertSigner> {
    let ca_key = signer::load_ca_key(&config.base.ssh_ca_filename)?;
    tracing::info!(
        algorithm = %ca_key.algorithm(),
        fingerprint = %ca_key.fingerprint(Default::default()),
        "ssh CA key loaded"
    );

    let host_identity = gethostname::gethostname()
        .into_string()
        .map_err(|raw| anyhow!("hostname is not valid UTF-8: {raw:?}"))?;

    let lookup = AuthorizedKeysCommand::new(
        &config.base.authorized_keys_command,
        Duration::from_secs(config.base.backend_timeout_secs),
    );

    Ok(SshCertSigner::new(
        ca_key,
        host_identity,
        Duration::from_secs(config.base.cert_validity_secs),
        lookup,
    ))
}

// ---------------------------------------------------------------------------
// HTTPS server (axum + axum-server)
// ---------------------------------------------------------------------------

async fn run_https_server(state: AppState) -> Result<()> {
    let base = &state.config.base;
    let listen_addr = base.listen_addr()?;

    let tls = RustlsConfig::from_pem_file(&base.tls_cert_filename, &base.tls_key_filename)
        .await
        .with_context(|| {
            format!(
                "failed to load TLS certificate {} / key {}",
                base.tls_cert_filename, base.tls_key_filename
            )
        })?;

    let app = http::handler::create_router(Arc::new(state.clone()));

    let handle = Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown_signal().await;
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        }
    });

    tracing::info!(%listen_addr, "HTTPS server listening");

    axum_server::bind_rustls(listen_addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("HTTPS server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- TLS crypto provider (must be installed before any rustls usage) ----
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls CryptoProvider"))?;

    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);
    tracing::info!(config_path = %cli.config, "starting certgen");

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Credential verifiers ----
    let verifiers = auth::build_verifiers(&config);
    tracing::info!(
        backends = ?verifiers.iter().map(|v| v.name().to_string()).collect::<Vec<_>>(),
        "credential backends configured"
    );
    let authenticator = Authenticator::new(
        verifiers,
        Duration::from_secs(config.base.backend_timeout_secs),
        metrics.clone(),
    );

    // ---- Signing oracle ----
    let signer = build_signer(&config)?;

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        authenticator: Arc::new(authenticator),
        oracle: Arc::new(signer),
        metrics,
    };

    run_https_server(state).await?;

    tracing::info!("certgen shut down cleanly");
    Ok(())
}
