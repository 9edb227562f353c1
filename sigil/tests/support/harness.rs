//! End-to-end test harness for the relay
//!
//! Starts the submission listener and the delivery side exactly as the
//! controller wires them, with a mock SMTP server standing in for every mail
//! exchange and a fixed table standing in for DNS.

use std::{collections::HashMap, io::Write, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use rsa::{
    RsaPublicKey,
    pkcs8::{EncodePrivateKey, LineEnding},
};
use sigil::Sigil;
use sigil_common::Signal;
use sigil_delivery::{DnsError, MailServer, MxResolver};
use sigil_smtp::{
    Listener,
    client::{Response, SmtpClient, client_config},
};
use tempfile::NamedTempFile;
use tokio::{sync::broadcast, task::JoinHandle, time::timeout};

use super::mock_server::{MockSmtpServer, SmtpCommand, closed_port};

/// Every listed domain resolves to the mock server's address.
struct LoopbackResolver {
    domains: HashMap<String, Vec<MailServer>>,
}

#[async_trait]
impl MxResolver for LoopbackResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        self.domains
            .get(domain)
            .cloned()
            .ok_or_else(|| DnsError::NoMailServers(domain.to_string()))
    }
}

/// A running relay plus the mock exchange it delivers to.
pub struct RelayHarness {
    relay_addr: SocketAddr,
    mock_server: MockSmtpServer,
    public_key: Option<RsaPublicKey>,
    relay_handle: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<Signal>,
    _key_file: Option<NamedTempFile>,
}

impl RelayHarness {
    #[must_use]
    pub fn builder() -> RelayHarnessBuilder {
        RelayHarnessBuilder::default()
    }

    /// The key receivers would find in DNS, if the relay signs.
    #[must_use]
    pub const fn public_key(&self) -> Option<&RsaPublicKey> {
        self.public_key.as_ref()
    }

    /// Submits a message to the relay and returns the reply to the end of DATA.
    ///
    /// # Errors
    ///
    /// Returns an error if any step before the end of DATA is refused.
    pub async fn send_email(
        &self,
        from: &str,
        to: &[&str],
        message: &[u8],
    ) -> anyhow::Result<Response> {
        let mut client = SmtpClient::connect(
            &self.relay_addr.ip().to_string(),
            self.relay_addr.port(),
            client_config(true)?,
        )
        .await?;

        anyhow::ensure!(client.read_greeting().await?.is_success(), "greeting");
        anyhow::ensure!(client.ehlo("test-client").await?.is_success(), "EHLO");
        anyhow::ensure!(client.mail_from(from).await?.is_success(), "MAIL FROM");
        for recipient in to {
            anyhow::ensure!(
                client.rcpt_to(recipient).await?.is_success(),
                "RCPT TO:<{recipient}>"
            );
        }
        anyhow::ensure!(client.data().await?.is_intermediate(), "DATA");

        let reply = client.send_data(message).await?;
        let _ = client.quit().await;
        Ok(reply)
    }

    pub async fn mock_commands(&self) -> Vec<SmtpCommand> {
        self.mock_server.commands().await
    }

    pub async fn delivered(&self) -> Vec<Vec<u8>> {
        self.mock_server.messages().await
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(Signal::Shutdown);
        self.mock_server.shutdown();
        let _ = timeout(Duration::from_secs(5), self.relay_handle).await;
    }
}

/// Builder for configuring a [`RelayHarness`]
pub struct RelayHarnessBuilder {
    domains: Vec<String>,
    signing: bool,
    rejected: Vec<String>,
}

impl Default for RelayHarnessBuilder {
    fn default() -> Self {
        Self {
            domains: vec!["test.example.com".to_string()],
            signing: true,
            rejected: Vec::new(),
        }
    }
}

impl RelayHarnessBuilder {
    /// Another domain routed to the mock exchange.
    #[must_use]
    pub fn with_test_domain(mut self, domain: impl Into<String>) -> Self {
        self.domains.push(domain.into());
        self
    }

    /// Relay unsigned, as when no `dkim` section is configured.
    #[must_use]
    pub const fn without_signing(mut self) -> Self {
        self.signing = false;
        self
    }

    /// The mock exchange refuses this recipient with 550.
    #[must_use]
    pub fn with_rejected_recipient(mut self, address: impl Into<String>) -> Self {
        self.rejected.push(address.into());
        self
    }

    /// # Errors
    ///
    /// Returns an error if any component fails to start.
    pub async fn build(self) -> anyhow::Result<RelayHarness> {
        let mock_server = self
            .rejected
            .into_iter()
            .fold(MockSmtpServer::builder(), |builder, address| {
                builder.with_rejected_recipient(address)
            })
            .build()
            .await?;

        let (key_file, public_key, dkim) = if self.signing {
            let key = rsa::RsaPrivateKey::new(&mut rsa::rand_core::OsRng, 1024)?;
            let mut file = NamedTempFile::new()?;
            file.write_all(key.to_pkcs8_pem(LineEnding::LF)?.as_bytes())?;
            let dkim = format!(
                "Some((domain: \"example.org\", selector: \"sigil\", private_key: {:?}))",
                file.path().display().to_string()
            );
            (Some(file), Some(key.to_public_key()), dkim)
        } else {
            (None, None, "None".to_string())
        };

        // Only the plain port leads to the mock exchange
        let sigil = Sigil::from_ron(&format!(
            r#"(
                listener: (socket: "127.0.0.1:0", hostname: "relay.test"),
                dkim: {dkim},
                delivery: (
                    helo_name: "relay.test",
                    accept_invalid_certs: true,
                    ports: (implicit_tls: {}, starttls: {}, plain: {}),
                    timeouts: (connect_secs: 5, ehlo_secs: 5, starttls_secs: 5, data_secs: 5),
                ),
            )"#,
            closed_port().await,
            closed_port().await,
            mock_server.port(),
        ))?;

        let resolver = LoopbackResolver {
            domains: self
                .domains
                .into_iter()
                .map(|domain| (domain, vec![MailServer::new("127.0.0.1", 10)]))
                .collect(),
        };

        let (shutdown_tx, _) = broadcast::channel(16);
        let dispatcher = sigil.dispatcher(Arc::new(resolver), shutdown_tx.subscribe())?;
        let listener = Listener::new(&sigil.listener)?;
        let socket = listener.bind().await?;
        let relay_addr = socket.local_addr()?;

        let shutdown = shutdown_tx.subscribe();
        let relay_handle = tokio::spawn(async move {
            listener
                .accept(socket, Arc::new(dispatcher), shutdown)
                .await;
        });

        Ok(RelayHarness {
            relay_addr,
            mock_server,
            public_key,
            relay_handle,
            shutdown_tx,
            _key_file: key_file,
        })
    }
}
