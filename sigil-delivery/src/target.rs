//! Delivery targets: the (host, port, transport mode) triples an attempt is made against.

use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::dns::MailServer;

/// How transport security is obtained on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportMode {
    /// TLS negotiated immediately after connecting, before the greeting.
    ImplicitTls,
    /// Plain connection upgraded with STARTTLS before the transaction.
    StartTls,
    /// No transport security.
    Plain,
}

impl TransportMode {
    /// Every mode, most secure first. This is the order targets are tried in.
    pub const ORDER: [Self; 3] = [Self::ImplicitTls, Self::StartTls, Self::Plain];

    #[must_use]
    pub const fn port(self, ports: &TransportPorts) -> u16 {
        match self {
            Self::ImplicitTls => ports.implicit_tls,
            Self::StartTls => ports.starttls,
            Self::Plain => ports.plain,
        }
    }
}

impl Display for TransportMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ImplicitTls => "implicit-tls",
            Self::StartTls => "starttls",
            Self::Plain => "plain",
        })
    }
}

/// The port used for each transport mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportPorts {
    /// Default: 465
    #[serde(default = "default_implicit_tls")]
    pub implicit_tls: u16,

    /// Default: 587
    #[serde(default = "default_starttls")]
    pub starttls: u16,

    /// Default: 25
    #[serde(default = "default_plain")]
    pub plain: u16,
}

const fn default_implicit_tls() -> u16 {
    465
}

const fn default_starttls() -> u16 {
    587
}

const fn default_plain() -> u16 {
    25
}

impl Default for TransportPorts {
    fn default() -> Self {
        Self {
            implicit_tls: default_implicit_tls(),
            starttls: default_starttls(),
            plain: default_plain(),
        }
    }
}

/// One concrete place to try delivering to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTarget {
    pub host: String,
    pub port: u16,
    pub mode: TransportMode,
}

impl Display for DeliveryTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.host, self.port, self.mode)
    }
}

/// Expands mail exchanges into the ordered list of targets to sweep: each
/// host in the order given, and for each host every mode in [`TransportMode::ORDER`].
#[must_use]
pub fn plan(servers: &[MailServer], ports: &TransportPorts) -> Vec<DeliveryTarget> {
    servers
        .iter()
        .flat_map(|server| {
            TransportMode::ORDER.into_iter().map(|mode| DeliveryTarget {
                host: server.host.clone(),
                port: mode.port(ports),
                mode,
            })
        })
        .collect()
}
