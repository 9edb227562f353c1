use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use sigil_common::{
    Signal, config::ServerTimeouts, error::ListenerError, internal,
    traits::handler::MessageHandler, tracing,
};
use tokio::{net::TcpListener, sync::broadcast};

use crate::{
    auth::Credentials,
    session::{Session, SessionConfig},
};

/// Inbound submission listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Default: `0.0.0.0:2525`
    #[serde(default = "defaults::socket")]
    pub socket: SocketAddr,

    /// Name used in the greeting and EHLO reply.
    ///
    /// Default: `localhost`
    #[serde(default = "defaults::hostname")]
    pub hostname: String,

    /// Largest accepted message, advertised with SIZE.
    ///
    /// Default: 1 MiB
    #[serde(default = "defaults::max_message_bytes")]
    pub max_message_bytes: usize,

    /// Default: 50
    #[serde(default = "defaults::max_recipients")]
    pub max_recipients: usize,

    #[serde(default)]
    pub timeouts: ServerTimeouts,

    /// A file of `user:password` lines. When set, clients must AUTH PLAIN
    /// before MAIL.
    #[serde(default)]
    pub credentials: Option<PathBuf>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            socket: defaults::socket(),
            hostname: defaults::hostname(),
            max_message_bytes: defaults::max_message_bytes(),
            max_recipients: defaults::max_recipients(),
            timeouts: ServerTimeouts::default(),
            credentials: None,
        }
    }
}

mod defaults {
    use std::net::{Ipv4Addr, SocketAddr};

    pub const fn socket() -> SocketAddr {
        SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 2525)
    }

    pub fn hostname() -> String {
        String::from("localhost")
    }

    pub const fn max_message_bytes() -> usize {
        1024 * 1024
    }

    pub const fn max_recipients() -> usize {
        50
    }
}

pub struct Listener {
    socket: SocketAddr,
    session: Arc<SessionConfig>,
}

impl Listener {
    /// Prepares a listener, loading the credentials file if one is configured.
    ///
    /// # Errors
    ///
    /// `ListenerError::Configuration` if the credentials file can't be loaded.
    pub fn new(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let credentials = config
            .credentials
            .as_deref()
            .map(|path| {
                Credentials::load(path).map_err(|err| ListenerError::Configuration {
                    path: path.display().to_string(),
                    reason: err.to_string(),
                })
            })
            .transpose()?;

        if credentials.as_ref().is_some_and(Credentials::is_empty) {
            internal!(
                level = WARN,
                "Credentials file is empty, no client will be able to submit mail"
            );
        }

        Ok(Self {
            socket: config.socket,
            session: Arc::new(SessionConfig {
                hostname: config.hostname.clone(),
                max_message_bytes: config.max_message_bytes,
                max_recipients: config.max_recipients,
                timeouts: config.timeouts.clone(),
                credentials: credentials.map(Arc::new),
            }),
        })
    }

    /// Binds the configured socket.
    ///
    /// # Errors
    ///
    /// `ListenerError::BindFailed` if the socket can't be bound.
    pub async fn bind(&self) -> Result<TcpListener, ListenerError> {
        TcpListener::bind(self.socket)
            .await
            .map_err(|source| ListenerError::BindFailed {
                address: self.socket.to_string(),
                source,
            })
    }

    /// Binds and accepts sessions until shutdown.
    ///
    /// # Errors
    ///
    /// `ListenerError::BindFailed` if the socket can't be bound.
    pub async fn serve(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        let listener = self.bind().await?;
        self.accept(listener, handler, shutdown).await;
        Ok(())
    }

    /// Accepts sessions on an already bound socket until shutdown, then waits
    /// for the running sessions to finish.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn accept(
        &self,
        listener: TcpListener,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) {
        let local = listener
            .local_addr()
            .map_or_else(|_| self.socket.to_string(), |addr| addr.to_string());
        internal!(level = INFO, "Accepting submissions on {local}");

        let mut sessions = Vec::default();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    internal!(level = INFO, "Listener {local} received shutdown signal, finishing sessions ...");
                    join_all(sessions).await;
                    break;
                }

                connection = listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(connection) => connection,
                        Err(err) => {
                            internal!(level = WARN, "{}", ListenerError::AcceptFailed(err));
                            continue;
                        }
                    };

                    tracing::debug!("Connection received on {local} from {peer}");
                    let session = Session::new(
                        stream,
                        peer,
                        Arc::clone(&self.session),
                        Arc::clone(&handler),
                        shutdown.resubscribe(),
                    );

                    sessions.push(tokio::spawn(async move {
                        match session.run().await {
                            Ok(()) => {}
                            Err(err) if err.is_shutdown() => {
                                internal!(level = DEBUG, "Session with {peer} ended by shutdown");
                            }
                            Err(err) if err.is_client_error() => {
                                internal!(level = INFO, "Session with {peer} ended: {err}");
                            }
                            Err(err) => internal!(level = WARN, "Session with {peer} failed: {err}"),
                        }
                    }));
                    sessions.retain(|session| !session.is_finished());
                }
            }
        }
    }
}
