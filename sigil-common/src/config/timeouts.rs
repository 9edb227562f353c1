//! Timeout configuration for SMTP operations.
//!
//! Every network operation the relay performs is bounded. The inbound side
//! uses short read/write timeouts for submission clients; the outbound side
//! bounds each stage of a delivery attempt separately.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Inbound (submission) timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTimeouts {
    /// How long to wait for the next line from the client.
    ///
    /// Default: 10 seconds
    #[serde(default = "defaults::server_read_secs")]
    pub read_secs: u64,

    /// How long a single reply may take to write.
    ///
    /// Default: 10 seconds
    #[serde(default = "defaults::server_write_secs")]
    pub write_secs: u64,
}

impl ServerTimeouts {
    #[must_use]
    pub const fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    #[must_use]
    pub const fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            read_secs: defaults::server_read_secs(),
            write_secs: defaults::server_write_secs(),
        }
    }
}

/// Outbound (delivery) timeouts, one per attempt stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTimeouts {
    /// Timeout for establishing the TCP connection and reading the greeting.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_connect_secs")]
    pub connect_secs: u64,

    /// Timeout for EHLO/HELO.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_ehlo_secs")]
    pub ehlo_secs: u64,

    /// Timeout for STARTTLS and for the implicit TLS handshake.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_starttls_secs")]
    pub starttls_secs: u64,

    /// Timeout for MAIL FROM.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_mail_from_secs")]
    pub mail_from_secs: u64,

    /// Timeout for RCPT TO.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_rcpt_to_secs")]
    pub rcpt_to_secs: u64,

    /// Timeout for DATA and for transmitting the message body.
    ///
    /// Default: 120 seconds
    #[serde(default = "defaults::client_data_secs")]
    pub data_secs: u64,

    /// Timeout for QUIT. Expiry never fails a delivery.
    ///
    /// Default: 10 seconds
    #[serde(default = "defaults::client_quit_secs")]
    pub quit_secs: u64,
}

impl ClientTimeouts {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub const fn ehlo(&self) -> Duration {
        Duration::from_secs(self.ehlo_secs)
    }

    #[must_use]
    pub const fn starttls(&self) -> Duration {
        Duration::from_secs(self.starttls_secs)
    }

    #[must_use]
    pub const fn mail_from(&self) -> Duration {
        Duration::from_secs(self.mail_from_secs)
    }

    #[must_use]
    pub const fn rcpt_to(&self) -> Duration {
        Duration::from_secs(self.rcpt_to_secs)
    }

    #[must_use]
    pub const fn data(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }

    #[must_use]
    pub const fn quit(&self) -> Duration {
        Duration::from_secs(self.quit_secs)
    }

    /// Every stage bounded by the same number of seconds.
    #[must_use]
    pub const fn uniform(secs: u64) -> Self {
        Self {
            connect_secs: secs,
            ehlo_secs: secs,
            starttls_secs: secs,
            mail_from_secs: secs,
            rcpt_to_secs: secs,
            data_secs: secs,
            quit_secs: secs,
        }
    }
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::client_connect_secs(),
            ehlo_secs: defaults::client_ehlo_secs(),
            starttls_secs: defaults::client_starttls_secs(),
            mail_from_secs: defaults::client_mail_from_secs(),
            rcpt_to_secs: defaults::client_rcpt_to_secs(),
            data_secs: defaults::client_data_secs(),
            quit_secs: defaults::client_quit_secs(),
        }
    }
}

mod defaults {
    pub const fn server_read_secs() -> u64 {
        10
    }
    pub const fn server_write_secs() -> u64 {
        10
    }

    pub const fn client_connect_secs() -> u64 {
        30
    }
    pub const fn client_ehlo_secs() -> u64 {
        30
    }
    pub const fn client_starttls_secs() -> u64 {
        30
    }
    pub const fn client_mail_from_secs() -> u64 {
        30
    }
    pub const fn client_rcpt_to_secs() -> u64 {
        30
    }
    pub const fn client_data_secs() -> u64 {
        120 // 2 minutes
    }
    pub const fn client_quit_secs() -> u64 {
        10
    }
}
