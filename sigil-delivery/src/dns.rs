//! Mail exchange resolution.
//!
//! Looks up MX records and orders them by preference. The RFC 5321 section
//! 5.1 fallback to the domain's own A/AAAA records is only used when
//! `implicit_mx` is enabled. Nothing is cached: every call is a fresh lookup.

use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::{
    Name, TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during DNS resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The address has no usable domain part.
    #[error("Invalid domain: '{0}'")]
    InvalidDomain(String),

    /// No MX records (or, with `implicit_mx`, no A/AAAA records) for the domain.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    /// The domain publishes a null MX (RFC 7505) and accepts no mail.
    #[error("Domain does not accept mail: {0}")]
    NullMx(String),

    /// Domain does not exist (NXDOMAIN).
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),

    /// DNS query failed due to network or resolver issues.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    /// DNS query timed out.
    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

/// Configuration for DNS resolution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DnsConfig {
    /// Upper bound on a whole lookup, in seconds.
    ///
    /// Default: 5
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Fall back to A/AAAA records when a domain has no MX records.
    ///
    /// Default: `false`
    #[serde(default)]
    pub implicit_mx: bool,
}

const fn default_timeout_secs() -> u64 {
    5
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            implicit_mx: false,
        }
    }
}

/// A mail exchange for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    /// Host name (without a trailing dot) or IP address.
    pub host: String,
    /// MX preference, lower is tried first. 0 for implicit MX.
    pub priority: u16,
}

impl MailServer {
    pub fn new(host: impl Into<String>, priority: u16) -> Self {
        Self {
            host: host.into(),
            priority,
        }
    }
}

/// Maps a domain to its mail exchanges, most preferred first.
#[async_trait]
pub trait MxResolver: Send + Sync {
    /// # Errors
    ///
    /// Returns a `DnsError` when the domain has no usable mail exchange.
    async fn resolve(&self, domain: &str) -> Result<Vec<MailServer>, DnsError>;
}

/// Sorts by preference. The sort is stable, so equal preferences keep the
/// order the DNS answer gave them.
fn order(mut servers: Vec<MailServer>) -> Vec<MailServer> {
    servers.sort_by_key(|server| server.priority);
    servers
}

/// Strips surrounding whitespace and the root dot, refusing empty labels.
fn normalize(domain: &str) -> Result<&str, DnsError> {
    let domain = domain.trim().trim_end_matches('.');
    if domain.is_empty() || domain.starts_with('.') || domain.contains("..") {
        return Err(DnsError::InvalidDomain(domain.to_string()));
    }
    Ok(domain)
}

/// Resolver backed by the system DNS configuration.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    config: DnsConfig,
}

impl DnsResolver {
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self { resolver, config })
    }

    async fn lookup(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(mx_lookup) => {
                let servers: Vec<MailServer> = mx_lookup
                    .iter()
                    .map(|mx| {
                        let host = exchange_host(mx.exchange());
                        debug!("Found MX record: {host} (priority: {})", mx.preference());
                        MailServer::new(host, mx.preference())
                    })
                    .collect();

                if let [server] = servers.as_slice()
                    && server.host.is_empty()
                {
                    return Err(DnsError::NullMx(domain.to_string()));
                }

                let servers: Vec<_> = servers
                    .into_iter()
                    .filter(|server| !server.host.is_empty())
                    .collect();

                if servers.is_empty() {
                    return self.implicit_mx(domain).await;
                }

                Ok(order(servers))
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => self.implicit_mx(domain).await,
            Err(err) => {
                warn!("MX lookup failed for {domain}: {err}");
                Err(DnsError::LookupFailed(err))
            }
        }
    }

    /// The domain's own addresses, at priority 0, when `implicit_mx` is on.
    async fn implicit_mx(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        if !self.config.implicit_mx {
            return Err(DnsError::NoMailServers(domain.to_string()));
        }

        debug!("No MX records for {domain}, falling back to A/AAAA");
        match self.resolver.lookup_ip(domain).await {
            Ok(ips) => {
                let servers: Vec<MailServer> = ips
                    .iter()
                    .map(|ip| MailServer::new(ip.to_string(), 0))
                    .collect();

                if servers.is_empty() {
                    Err(DnsError::NoMailServers(domain.to_string()))
                } else {
                    Ok(servers)
                }
            }
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => {
                Err(DnsError::NoMailServers(domain.to_string()))
            }
            Err(err) => {
                warn!("A/AAAA lookup failed for {domain}: {err}");
                Err(DnsError::LookupFailed(err))
            }
        }
    }
}

/// The exchange as a connectable host name: ASCII (punycode) labels, no
/// trailing root. The null MX (`.`) becomes empty.
fn exchange_host(name: &Name) -> String {
    name.to_ascii().trim_end_matches('.').to_string()
}

#[async_trait]
impl MxResolver for DnsResolver {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        let domain = normalize(domain)?;

        tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), self.lookup(domain))
            .await
            .map_err(|_| DnsError::Timeout(domain.to_string()))?
    }
}
