use serde::{Deserialize, Serialize};
use sigil_common::config::ClientTimeouts;

use crate::{dns::DnsConfig, target::TransportPorts};

/// Outbound delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeliveryConfig {
    /// Name announced in EHLO/HELO to remote exchanges.
    ///
    /// Default: `localhost`
    #[serde(default = "default_helo_name")]
    pub helo_name: String,

    /// How many recipients of one message are delivered at the same time.
    /// 1 delivers them one after another.
    ///
    /// Default: 4
    #[serde(default = "default_max_concurrent_recipients")]
    pub max_concurrent_recipients: usize,

    /// Skip certificate verification for implicit TLS and STARTTLS.
    ///
    /// **SECURITY WARNING**: only for testing against self-signed servers.
    ///
    /// Default: `false`
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub ports: TransportPorts,

    #[serde(default)]
    pub timeouts: ClientTimeouts,

    #[serde(default)]
    pub dns: DnsConfig,
}

fn default_helo_name() -> String {
    String::from("localhost")
}

const fn default_max_concurrent_recipients() -> usize {
    4
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            helo_name: default_helo_name(),
            max_concurrent_recipients: default_max_concurrent_recipients(),
            accept_invalid_certs: false,
            ports: TransportPorts::default(),
            timeouts: ClientTimeouts::default(),
            dns: DnsConfig::default(),
        }
    }
}
