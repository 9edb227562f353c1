//! Mock SMTP server for testing delivery scenarios
//!
//! This module provides a configurable mock SMTP server that can:
//! - Simulate various SMTP responses (success, rejection, STARTTLS refusal)
//! - Reject individual recipients
//! - Stall the reply to the message body on chosen connections
//! - Track received commands and connections for verification
//!
//! The server never speaks TLS: a client that upgrades after a `220` reply to
//! STARTTLS finds the connection closed.

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content (after DATA), still dot-stuffed
    MessageContent(Vec<u8>),
    Quit,
    StartTls,
    Other(String),
}

/// Response configuration for SMTP commands
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    ehlo_response: Option<EhloResponse>,
    helo_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    rejected_recipients: Vec<String>,
    data_response: SmtpResponse,
    data_end_response: SmtpResponse,
    quit_response: SmtpResponse,
    starttls_response: Option<SmtpResponse>,

    // Failure injection
    response_delay: Option<Duration>,
    data_end_delay: Option<(Duration, usize)>,
    drop_after_commands: Option<usize>,
}

#[derive(Clone)]
struct EhloResponse {
    code: u16,
    capabilities: Vec<String>,
}

impl EhloResponse {
    fn to_bytes(&self, starttls: bool) -> Vec<u8> {
        let mut capabilities = self.capabilities.clone();
        if starttls && self.code == 250 {
            capabilities.push("STARTTLS".to_string());
        }

        let mut response = String::new();
        let last = capabilities.len().saturating_sub(1);
        for (i, cap) in capabilities.iter().enumerate() {
            let separator = if i < last { '-' } else { ' ' };
            let _ = write!(&mut response, "{}{separator}{cap}\r\n", self.code);
        }

        response.into_bytes()
    }
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "Mock SMTP Server"),
            ehlo_response: Some(EhloResponse {
                code: 250,
                capabilities: vec!["localhost".to_string(), "SIZE 10000".to_string()],
            }),
            helo_response: SmtpResponse::new(250, "Hello"),
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_response: SmtpResponse::new(250, "OK"),
            rejected_recipients: Vec::new(),
            data_response: SmtpResponse::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            data_end_response: SmtpResponse::new(250, "OK: Message accepted"),
            quit_response: SmtpResponse::new(221, "Bye"),
            starttls_response: None,
            response_delay: None,
            data_end_delay: None,
            drop_after_commands: None,
        }
    }
}

/// Mock SMTP server for testing
pub struct MockSmtpServer {
    addr: SocketAddr,
    commands_received: Arc<RwLock<Vec<SmtpCommand>>>,
    shutdown: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::new()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Get all commands received by the server, across connections
    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands_received.read().await.clone()
    }

    /// The message bodies received, in order
    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.commands()
            .await
            .into_iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(content) => Some(content),
                _ => None,
            })
            .collect()
    }

    /// Number of connections accepted so far
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    #[allow(clippy::too_many_lines)]
    async fn handle_client(
        mut stream: TcpStream,
        connection: usize,
        config: Arc<MockServerConfig>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut local_command_count = 0;

        writer.write_all(&config.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            line.clear();

            if let Some(drop_after) = config.drop_after_commands
                && local_command_count >= drop_after
            {
                return Ok(());
            }

            let read_result = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await;
            if read_result.is_err() {
                return Ok(());
            }

            let bytes_read = read_result??;
            if bytes_read == 0 {
                return Ok(());
            }

            local_command_count += 1;

            let cmd_line = line.trim();
            tracing::debug!("Mock server received: {}", cmd_line);

            let parts: Vec<&str> = cmd_line.splitn(2, ' ').collect();
            let command = parts[0].to_uppercase();
            let argument = parts.get(1).unwrap_or(&"").to_string();

            let (response, smtp_cmd) = match command.as_str() {
                "EHLO" => {
                    let resp = config.ehlo_response.as_ref().map_or_else(
                        || SmtpResponse::new(502, "Command not implemented").to_bytes(),
                        |ehlo| ehlo.to_bytes(config.starttls_response.is_some()),
                    );
                    (resp, SmtpCommand::Ehlo(argument))
                }
                "HELO" => (config.helo_response.to_bytes(), SmtpCommand::Helo(argument)),
                "MAIL" => (
                    config.mail_from_response.to_bytes(),
                    SmtpCommand::MailFrom(argument),
                ),
                "RCPT" => {
                    let rejected = config
                        .rejected_recipients
                        .iter()
                        .any(|address| argument.contains(address.as_str()));
                    let resp = if rejected {
                        SmtpResponse::new(550, "No such user").to_bytes()
                    } else {
                        config.rcpt_to_response.to_bytes()
                    };
                    (resp, SmtpCommand::RcptTo(argument))
                }
                "DATA" => (config.data_response.to_bytes(), SmtpCommand::Data),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer.write_all(&config.quit_response.to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                "STARTTLS" => {
                    commands.write().await.push(SmtpCommand::StartTls);
                    let Some(starttls) = config.starttls_response.as_ref() else {
                        writer
                            .write_all(&SmtpResponse::new(502, "Command not implemented").to_bytes())
                            .await?;
                        writer.flush().await?;
                        continue;
                    };
                    writer.write_all(&starttls.to_bytes()).await?;
                    writer.flush().await?;
                    if starttls.code == 220 {
                        // No TLS here; the handshake sees the connection close
                        return Ok(());
                    }
                    continue;
                }
                _ => (
                    SmtpResponse::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(cmd_line.to_string()),
                ),
            };

            commands.write().await.push(smtp_cmd.clone());

            if matches!(smtp_cmd, SmtpCommand::Data) && config.data_response.code == 354 {
                writer.write_all(&response).await?;
                writer.flush().await?;

                // Read message content until we see <CRLF>.<CRLF>
                let mut message_content = Vec::new();
                let mut data_line = String::new();

                loop {
                    data_line.clear();
                    let bytes_read = reader.read_line(&mut data_line).await?;
                    if bytes_read == 0 {
                        return Ok(());
                    }

                    if data_line == ".\r\n" || data_line == ".\n" {
                        commands
                            .write()
                            .await
                            .push(SmtpCommand::MessageContent(message_content.clone()));

                        if let Some((delay, stalled)) = config.data_end_delay
                            && connection < stalled
                        {
                            tokio::time::sleep(delay).await;
                        }
                        writer
                            .write_all(&config.data_end_response.to_bytes())
                            .await?;
                        writer.flush().await?;
                        break;
                    }

                    message_content.extend_from_slice(data_line.as_bytes());
                }
                continue;
            }

            if let Some(delay) = config.response_delay {
                tokio::time::sleep(delay).await;
            }

            writer.write_all(&response).await?;
            writer.flush().await?;
        }
    }
}

/// Builder for configuring a `MockSmtpServer`
pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    fn new() -> Self {
        Self {
            config: MockServerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    /// Set the EHLO response with capabilities (the first is the greeting line)
    #[must_use]
    pub fn with_ehlo_response(mut self, code: u16, capabilities: Vec<String>) -> Self {
        self.config.ehlo_response = Some(EhloResponse { code, capabilities });
        self
    }

    /// Answer EHLO with 502, as a server without ESMTP does
    #[must_use]
    pub fn without_ehlo(mut self) -> Self {
        self.config.ehlo_response = None;
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to_response = SmtpResponse::new(code, message);
        self
    }

    /// Answer RCPT for `address` with 550
    #[must_use]
    pub fn with_rejected_recipient(mut self, address: impl Into<String>) -> Self {
        self.config.rejected_recipients.push(address.into());
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    /// Set the STARTTLS response; STARTTLS is advertised in EHLO from then on
    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.starttls_response = Some(SmtpResponse::new(code, message));
        self
    }

    /// Add a delay before sending each command response
    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.config.response_delay = Some(delay);
        self
    }

    /// Delay the reply to the message body on the first `connections` connections
    #[must_use]
    pub const fn with_data_end_delay(mut self, delay: Duration, connections: usize) -> Self {
        self.config.data_end_delay = Some((delay, connections));
        self
    }

    /// Drop the connection after N commands
    #[must_use]
    pub const fn with_network_error_after_commands(mut self, count: usize) -> Self {
        self.config.drop_after_commands = Some(count);
        self
    }

    /// Build and start the mock SMTP server
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to a port
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));

        let commands_clone = Arc::clone(&commands);
        let shutdown_clone = Arc::clone(&shutdown);
        let connections_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                if shutdown_clone.load(Ordering::Relaxed) {
                    break;
                }

                // Accept connection with timeout to allow checking shutdown flag
                let accept_result = timeout(Duration::from_millis(100), listener.accept()).await;

                if let Ok(Ok((stream, _peer))) = accept_result {
                    let connection = connections_clone.fetch_add(1, Ordering::Relaxed);
                    let config = Arc::clone(&config);
                    let commands = Arc::clone(&commands_clone);

                    tokio::spawn(async move {
                        if let Err(e) =
                            MockSmtpServer::handle_client(stream, connection, config, commands)
                                .await
                        {
                            tracing::debug!("Mock server client error: {}", e);
                        }
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands_received: commands,
            shutdown,
            connections,
        })
    }
}

/// A local port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
