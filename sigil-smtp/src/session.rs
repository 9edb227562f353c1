//! One inbound submission session.

use std::{io, net::SocketAddr, sync::Arc};

use sigil_common::{
    Message, Signal, config::ServerTimeouts, error::SessionError, incoming, internal, outgoing,
    traits::{fsm::FiniteStateMachine, handler::MessageHandler},
    tracing,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    sync::broadcast,
};

use crate::{
    auth::Credentials,
    command::Command,
    reply::Reply,
    state::{SessionState, State},
};

/// Longest command line accepted, including CRLF.
const MAX_COMMAND_LINE: u64 = 4096;

/// Body lines longer than this are read in several chunks.
const MAX_DATA_CHUNK: u64 = 64 * 1024;

/// Per-listener settings shared by every session it accepts.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub hostname: String,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    pub timeouts: ServerTimeouts,
    /// When present, AUTH PLAIN is offered and required before MAIL.
    pub credentials: Option<Arc<Credentials>>,
}

enum Read {
    Line(io::Result<usize>),
    TimedOut,
    Shutdown,
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    peer: SocketAddr,
    reader: BufReader<ReadHalf<Stream>>,
    writer: WriteHalf<Stream>,
    state: State,
    context: SessionState,
    config: Arc<SessionConfig>,
    handler: Arc<dyn MessageHandler>,
    shutdown: broadcast::Receiver<Signal>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn new(
        stream: Stream,
        peer: SocketAddr,
        config: Arc<SessionConfig>,
        handler: Arc<dyn MessageHandler>,
        shutdown: broadcast::Receiver<Signal>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let context = SessionState::new(
            config.hostname.clone(),
            config.max_message_bytes,
            config.max_recipients,
            config.credentials.is_some(),
        );

        Self {
            peer,
            reader: BufReader::new(reader),
            writer,
            state: State::default(),
            context,
            config,
            handler,
            shutdown,
        }
    }

    /// Runs the session until the client quits or disconnects.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` on I/O failure, an idle timeout, an overlong
    /// command line, or shutdown.
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %self.peer))]
    pub async fn run(mut self) -> Result<(), SessionError> {
        internal!(level = DEBUG, "Session started");
        let greeting = Reply::new(220, format!("{} ESMTP ready", self.config.hostname));
        self.send(&greeting).await?;

        let mut line = Vec::with_capacity(512);
        loop {
            line.clear();
            let read = self.read_line(&mut line, MAX_COMMAND_LINE).await?;
            if read == 0 {
                internal!(level = DEBUG, "Client closed the connection");
                return Ok(());
            }

            if !line.ends_with(b"\n") {
                self.send(&Reply::new(500, "Line too long")).await?;
                return Err(SessionError::Protocol("Command line too long".to_string()));
            }

            let command = Command::try_from(line.as_slice()).unwrap_or_else(|e| e);
            incoming!("{command}");

            self.state = std::mem::take(&mut self.state).transition(command, &mut self.context);
            if let Some(reply) = self.context.reply.take() {
                self.send(&reply).await?;
            }

            match self.state {
                State::Quit => return Ok(()),
                State::Authenticating { .. } => self.authenticate().await?,
                State::Data => self.receive_message().await?,
                _ => {}
            }
        }
    }

    /// Runs an AUTH PLAIN exchange, leaving the session `Ready` either way.
    async fn authenticate(&mut self) -> Result<(), SessionError> {
        let State::Authenticating { initial_response } =
            std::mem::replace(&mut self.state, State::Ready)
        else {
            return Ok(());
        };

        let response = if let Some(response) = initial_response {
            response
        } else {
            self.send(&Reply::new(334, "")).await?;

            let mut line = Vec::new();
            if self.read_line(&mut line, MAX_COMMAND_LINE).await? == 0 {
                return Err(SessionError::Connection(io::ErrorKind::UnexpectedEof.into()));
            }
            String::from_utf8_lossy(&line).trim().to_string()
        };

        if response == "*" {
            return self
                .send(&Reply::new(501, "Authentication cancelled"))
                .await;
        }

        let Some(credentials) = self.config.credentials.clone() else {
            return self
                .send(&Reply::new(503, "Authentication not enabled"))
                .await;
        };

        let reply = match credentials.verify_plain(&response) {
            Ok(user) => {
                internal!(level = INFO, "Authenticated as {user}");
                self.context.authenticated = true;
                Reply::new(235, "Authentication successful")
            }
            Err(err) => {
                internal!(level = WARN, "Authentication failed: {err}");
                Reply::new(err.reply_code(), err.to_string())
            }
        };
        self.send(&reply).await
    }

    /// Reads the body up to the lone `.` line, then hands the message to the handler.
    async fn receive_message(&mut self) -> Result<(), SessionError> {
        let max = self.config.max_message_bytes;
        let mut body = Vec::new();
        let mut oversized = false;
        let mut at_line_start = true;
        let mut chunk = Vec::with_capacity(1024);

        loop {
            chunk.clear();
            if self.read_line(&mut chunk, MAX_DATA_CHUNK).await? == 0 {
                return Err(SessionError::Connection(io::ErrorKind::UnexpectedEof.into()));
            }

            let complete = chunk.ends_with(b"\n");
            let mut data = chunk.as_slice();

            if at_line_start {
                if data == b".\r\n" || data == b".\n" {
                    break;
                }
                if data.first() == Some(&b'.') {
                    data = &data[1..];
                }
            }

            if body.len() + data.len() > max {
                oversized = true;
            } else if !oversized {
                if complete && !data.ends_with(b"\r\n") {
                    body.extend_from_slice(&data[..data.len() - 1]);
                    body.extend_from_slice(b"\r\n");
                } else {
                    body.extend_from_slice(data);
                }
            }

            at_line_start = complete;
        }

        self.state = State::Ready;
        let sender = self.context.sender.take().unwrap_or_default();
        let recipients = std::mem::take(&mut self.context.recipients);

        if oversized {
            internal!(level = WARN, "Rejected message from <{sender}>: larger than {max} bytes");
            return self
                .send(&Reply::new(
                    552,
                    format!("Message size exceeds maximum {max} bytes"),
                ))
                .await;
        }

        internal!(
            level = INFO,
            "Received {} bytes from <{sender}> for {} recipient(s)",
            body.len(),
            recipients.len()
        );

        let result = self
            .handler
            .handle(Message::new(sender, recipients, body))
            .await;
        let (code, text) = result.reply();
        self.send(&Reply::new(code, text)).await
    }

    /// Reads one line (at most `limit` bytes) into `buf`, returning the number
    /// of bytes read. Zero means the client has gone away.
    async fn read_line(&mut self, buf: &mut Vec<u8>, limit: u64) -> Result<usize, SessionError> {
        let timeout = self.config.timeouts.read();

        let read = {
            let mut limited = (&mut self.reader).take(limit);
            let line = limited.read_until(b'\n', buf);
            tokio::select! {
                result = tokio::time::timeout(timeout, line) => result.map_or(Read::TimedOut, Read::Line),
                _ = self.shutdown.recv() => Read::Shutdown,
            }
        };

        match read {
            Read::Line(read) => Ok(read?),
            Read::TimedOut => {
                internal!(level = INFO, "Client idle for {}s, closing", timeout.as_secs());
                let reply = Reply::new(
                    421,
                    format!("{} Timeout, closing connection", self.config.hostname),
                );
                let _ = self.send(&reply).await;
                Err(SessionError::Timeout(timeout.as_secs()))
            }
            Read::Shutdown => {
                let reply = Reply::new(
                    421,
                    format!("{} Service shutting down", self.config.hostname),
                );
                let _ = self.send(&reply).await;
                Err(SessionError::Shutdown)
            }
        }
    }

    async fn send(&mut self, reply: &Reply) -> Result<(), SessionError> {
        outgoing!("{reply}");
        let timeout = self.config.timeouts.write();

        tokio::time::timeout(timeout, async {
            self.writer.write_all(reply.to_wire().as_bytes()).await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| SessionError::Timeout(timeout.as_secs()))??;

        Ok(())
    }
}
