use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub base: BaseConfig,
    #[serde(default)]
    pub ldap: LdapConfig,
}

// ---------------------------------------------------------------------------
// Base: listener, CA, local password file, issuance limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BaseConfig {
    /// Listen address.  A bare `:port` means all interfaces.
    pub http_address: String,
    /// PEM certificate chain presented by the TLS listener.
    pub tls_cert_filename: String,
    /// PEM private key for the TLS listener.
    pub tls_key_filename: String,
    /// OpenSSH-format CA private key used to sign user certificates.
    pub ssh_ca_filename: String,
    /// Optional htpasswd file, always consulted after every directory backend.
    #[serde(default)]
    pub htpasswd_filename: Option<String>,
    /// Command printing the on-record public keys for a username (GET path).
    #[serde(default = "default_authorized_keys_command")]
    pub authorized_keys_command: String,
    /// Lifetime of issued certificates in seconds.
    #[serde(default = "default_cert_validity_secs")]
    pub cert_validity_secs: u64,
    /// Upper bound on a POST body, enforced before the form is parsed.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Per-backend bound on a single credential check or key lookup.
    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,
}

fn default_authorized_keys_command() -> String {
    "/usr/bin/sss_ssh_authorizedkeys".to_string()
}

fn default_cert_validity_secs() -> u64 {
    86_400
}

fn default_max_upload_bytes() -> usize {
    64 * 1024
}

fn default_backend_timeout_secs() -> u64 {
    3
}

impl BaseConfig {
    /// Resolve `http_address` into a bindable socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let addr = if self.http_address.starts_with(':') {
            format!("0.0.0.0{}", self.http_address)
        } else {
            self.http_address.clone()
        };
        addr.parse()
            .with_context(|| format!("invalid http_address: {}", self.http_address))
    }
}

// ---------------------------------------------------------------------------
// Directory service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LdapConfig {
    /// Bind DN template; `%s` is replaced by the escaped username.
    #[serde(default)]
    pub bind_pattern: String,
    /// Comma-separated `ldaps://` URLs, consulted in the order given.
    #[serde(default)]
    pub ldap_target_urls: String,
}

impl LdapConfig {
    /// Configured directory URLs in priority order, blanks dropped.
    pub fn target_urls(&self) -> Vec<&str> {
        self.ldap_target_urls
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    config.base.listen_addr()?;

    let urls = config.ldap.target_urls();
    anyhow::ensure!(
        !urls.is_empty() || config.base.htpasswd_filename.is_some(),
        "no credential backend configured (set ldap.ldap_target_urls or base.htpasswd_filename)"
    );
    for url in &urls {
        let host = url
            .strip_prefix("ldaps://")
            .with_context(|| format!("ldap target {url} must use the ldaps:// scheme"))?;
        anyhow::ensure!(!host.is_empty(), "ldap target {url} has no host");
    }
    if !urls.is_empty() {
        anyhow::ensure!(
            config.ldap.bind_pattern.matches("%s").count() == 1,
            "ldap.bind_pattern must contain exactly one %s"
        );
    }

    anyhow::ensure!(
        config.base.cert_validity_secs > 0,
        "cert_validity_secs must be positive"
    );
    anyhow::ensure!(
        config.base.max_upload_bytes > 0,
        "max_upload_bytes must be positive"
    );
    anyhow::ensure!(
        config.base.backend_timeout_secs > 0,
        "backend_timeout_secs must be positive"
    );
    Ok(())
}
