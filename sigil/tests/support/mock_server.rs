//! Mock mail exchange for the relay's end-to-end tests
//!
//! Accepts every transaction in plain text, except for recipients it was told
//! to reject at RCPT. Everything the relay sends is recorded in order.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
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
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content (after DATA), still dot-stuffed
    MessageContent(Vec<u8>),
    Quit,
    Other(String),
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands_received: Arc<RwLock<Vec<SmtpCommand>>>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::default()
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

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        mut stream: TcpStream,
        rejected: Arc<[String]>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        writer.write_all(b"220 Mock SMTP Server\r\n").await?;

        loop {
            line.clear();
            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }

            let cmd_line = line.trim();
            tracing::debug!("Mock server received: {}", cmd_line);

            let (verb, argument) = cmd_line.split_once(' ').unwrap_or((cmd_line, ""));
            let argument = argument.to_string();

            let (reply, command): (&[u8], _) = match verb.to_uppercase().as_str() {
                "EHLO" => (
                    b"250-localhost\r\n250 SIZE 10000\r\n",
                    SmtpCommand::Ehlo(argument),
                ),
                "MAIL" => (b"250 OK\r\n", SmtpCommand::MailFrom(argument)),
                "RCPT" => {
                    let reply: &[u8] = if rejected.iter().any(|a| argument.contains(a.as_str())) {
                        b"550 No such user\r\n"
                    } else {
                        b"250 OK\r\n"
                    };
                    (reply, SmtpCommand::RcptTo(argument))
                }
                "DATA" => (
                    b"354 Start mail input; end with <CRLF>.<CRLF>\r\n",
                    SmtpCommand::Data,
                ),
                "QUIT" => (b"221 Bye\r\n", SmtpCommand::Quit),
                _ => (
                    b"500 Unknown command\r\n",
                    SmtpCommand::Other(cmd_line.to_string()),
                ),
            };

            let is_data = command == SmtpCommand::Data;
            let is_quit = command == SmtpCommand::Quit;
            commands.write().await.push(command);
            writer.write_all(reply).await?;

            if is_quit {
                return Ok(());
            }
            if !is_data {
                continue;
            }

            let mut content = Vec::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                if line == ".\r\n" || line == ".\n" {
                    break;
                }
                content.extend_from_slice(line.as_bytes());
            }
            commands
                .write()
                .await
                .push(SmtpCommand::MessageContent(content));
            writer.write_all(b"250 OK: Message accepted\r\n").await?;
        }
    }
}

#[derive(Default)]
pub struct MockSmtpServerBuilder {
    rejected_recipients: Vec<String>,
}

impl MockSmtpServerBuilder {
    /// Answer RCPT for `address` with 550
    #[must_use]
    pub fn with_rejected_recipient(mut self, address: impl Into<String>) -> Self {
        self.rejected_recipients.push(address.into());
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

        let rejected: Arc<[String]> = self.rejected_recipients.into();
        let commands = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let commands_clone = Arc::clone(&commands);
        let shutdown_clone = Arc::clone(&shutdown);

        tokio::spawn(async move {
            while !shutdown_clone.load(Ordering::Relaxed) {
                // Accept with a timeout so the shutdown flag is checked
                let accept_result = timeout(Duration::from_millis(100), listener.accept()).await;

                if let Ok(Ok((stream, _peer))) = accept_result {
                    let rejected = Arc::clone(&rejected);
                    let commands = Arc::clone(&commands_clone);

                    tokio::spawn(async move {
                        if let Err(e) =
                            MockSmtpServer::handle_client(stream, rejected, commands).await
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
        })
    }
}

/// A local port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
