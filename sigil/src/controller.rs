use std::sync::{Arc, LazyLock};

use anyhow::Context;
use serde::Deserialize;
use sigil_common::{Signal, internal, logging};
use sigil_delivery::{
    DeliveryConfig, Dispatcher, DkimConfig, DkimSigner, DnsResolver, MessageSigner, MxResolver,
    Orchestrator, SmtpAttempt, Unsigned, dkim::SigningIdentity,
};
use sigil_smtp::{Listener, ListenerConfig};
use tokio::sync::broadcast;

/// The whole relay, as read from `sigil.config.ron`.
#[derive(Debug, Default, Deserialize)]
pub struct Sigil {
    #[serde(alias = "smtp", default)]
    pub listener: ListenerConfig,
    /// Without a signing section messages are relayed unsigned.
    #[serde(default)]
    pub dkim: Option<DkimConfig>,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl Sigil {
    /// # Errors
    ///
    /// Fails if `config` isn't a valid configuration.
    pub fn from_ron(config: &str) -> anyhow::Result<Self> {
        ron::from_str(config).context("Invalid configuration")
    }

    /// Loads the signing key once. Every message is signed with it for the
    /// life of the process.
    ///
    /// # Errors
    ///
    /// Fails if the configured key can't be read or isn't an RSA key.
    pub fn signer(&self) -> anyhow::Result<Arc<dyn MessageSigner>> {
        let Some(config) = &self.dkim else {
            internal!(
                level = WARN,
                "No dkim section configured, messages will be relayed unsigned"
            );
            return Ok(Arc::new(Unsigned));
        };

        let identity = SigningIdentity::from_config(config).with_context(|| {
            format!(
                "Unable to load DKIM key {}",
                config.private_key.display()
            )
        })?;
        internal!(
            level = INFO,
            "Signing as d={} s={}",
            config.domain,
            config.selector
        );

        Ok(Arc::new(DkimSigner::new(Arc::new(identity))))
    }

    /// Builds the delivery side around `resolver`.
    ///
    /// # Errors
    ///
    /// Fails if the signing key or the TLS client configuration can't be loaded.
    pub fn dispatcher(
        &self,
        resolver: Arc<dyn MxResolver>,
        shutdown: broadcast::Receiver<Signal>,
    ) -> anyhow::Result<Dispatcher> {
        let signer = self.signer()?;
        let attempt = SmtpAttempt::from_config(&self.delivery)
            .context("Unable to build the TLS client configuration")?;
        let orchestrator = Orchestrator::new(
            resolver,
            Arc::new(attempt),
            self.delivery.ports.clone(),
        );

        Ok(Dispatcher::new(
            signer,
            Arc::new(orchestrator),
            self.delivery.max_concurrent_recipients,
            shutdown,
        ))
    }

    /// Run the relay until SIGINT or SIGTERM.
    ///
    /// # Errors
    ///
    /// This function will return an error if the signing key, the resolver or
    /// the listener fail to initialise.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        internal!("Controller running");

        let resolver = DnsResolver::new(self.delivery.dns.clone())
            .context("Unable to initialise the DNS resolver")?;
        let dispatcher = self.dispatcher(Arc::new(resolver), SHUTDOWN_BROADCAST.subscribe())?;
        let listener = Listener::new(&self.listener)?;

        let ret = tokio::select! {
            r = listener.serve(Arc::new(dispatcher), SHUTDOWN_BROADCAST.subscribe()) => {
                r.map_err(anyhow::Error::from)
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");

        ret
    }
}
