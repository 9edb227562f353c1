//! SMTP client over plain TCP, implicit TLS, or a STARTTLS upgrade.

use std::sync::Arc;

use sigil_common::{incoming, outgoing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{ClientConfig, pki_types::ServerName},
};

use super::{
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }
}

async fn handshake(
    stream: TcpStream,
    server_name: &str,
    tls: Arc<ClientConfig>,
) -> Result<TlsStream<TcpStream>> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| ClientError::TlsError(format!("Invalid server name {server_name}: {e}")))?;

    TlsConnector::from(tls)
        .connect(name, stream)
        .await
        .map_err(|e| ClientError::TlsError(e.to_string()))
}

/// An SMTP client for sending commands and receiving responses.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_name: String,
    tls: Arc<ClientConfig>,
}

impl SmtpClient {
    fn new(connection: ClientConnection, server_name: &str, tls: Arc<ClientConfig>) -> Self {
        Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_name: server_name.to_string(),
            tls,
        }
    }

    /// Opens a plain TCP connection. `tls` is kept for a later [`Self::starttls`].
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(host: &str, port: u16, tls: Arc<ClientConfig>) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self::new(ClientConnection::Plain(stream), host, tls))
    }

    /// Whether the connection is currently encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// Reads the initial server greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is invalid.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Sends a raw command and reads the response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        outgoing!("{command}");
        self.send(format!("{command}\r\n").as_bytes()).await?;
        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}")).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends the message, dot-stuffed and terminated by `<CRLF>.<CRLF>`, then
    /// reads the final reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<Response> {
        outgoing!("<{} bytes of message data>", data.len());
        self.send(&dot_stuff(data)).await?;
        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Sends STARTTLS and, if the server agrees, upgrades this connection.
    ///
    /// The server's reply is returned unchanged when it refuses.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::TlsError` if the handshake fails or the
    /// connection is already encrypted.
    pub async fn starttls(&mut self) -> Result<Response> {
        if self.is_tls() {
            return Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            ));
        }

        let response = self.command("STARTTLS").await?;
        if !response.is_success() {
            return Ok(response);
        }

        self.secure().await?;
        Ok(response)
    }

    /// Completes a TLS handshake on the current plain connection, with the
    /// host the client connected to as the server name.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::TlsError` if the handshake fails or the
    /// connection is already encrypted.
    pub async fn secure(&mut self) -> Result<()> {
        // Anything buffered before the handshake was sent in the clear
        self.buffer_pos = 0;

        match self.connection.take() {
            Some(ClientConnection::Plain(stream)) => {
                let stream = handshake(stream, &self.server_name, Arc::clone(&self.tls)).await?;
                self.connection = Some(ClientConnection::Tls(Box::new(stream)));
                Ok(())
            }
            Some(tls @ ClientConnection::Tls(_)) => {
                self.connection = Some(tls);
                Err(ClientError::TlsError(
                    "Connection is already TLS".to_string(),
                ))
            }
            None => Err(ClientError::ConnectionClosed),
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data)
            .await
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{response}");
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

/// Prepares a message for the DATA phase: a `.` is doubled at the start of
/// every line, the data ends with CRLF, and the terminating `.` line follows.
#[must_use]
pub fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    let mut at_line_start = true;

    for &byte in data {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }

    if !data.is_empty() && !out.ends_with(b"\r\n") {
        if out.ends_with(b"\n") {
            out.pop();
        }
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}
