//! One connection and one transaction against one delivery target.
//!
//! ```text
//! Connecting -> SecuringTransport (StartTls only) -> DeclaringSender
//!   -> DeclaringRecipient -> TransmittingBody -> Closing -> Succeeded
//! ```
//!
//! Any failure before `Closing` aborts the attempt with the reason belonging
//! to the state it happened in. The connection is owned by the attempt and is
//! dropped on every exit path; a connection whose security negotiation failed
//! is never reused in plain text.

use core::fmt::{self, Display, Formatter};
use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use sigil_common::{config::ClientTimeouts, internal};
use sigil_smtp::client::{self, ClientError, Response, SmtpClient};
use tokio_rustls::rustls::ClientConfig;

use crate::{
    config::DeliveryConfig,
    dkim::SignedMessage,
    error::AttemptError,
    target::{DeliveryTarget, TransportMode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AttemptState {
    #[default]
    Connecting,
    SecuringTransport,
    DeclaringSender,
    DeclaringRecipient,
    TransmittingBody,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    ConnectFailed,
    TransportFailed,
    SenderRejected,
    RecipientRejected,
    TransmissionFailed,
    Cancelled,
}

impl AbortReason {
    /// The reason a failure in `state` is reported with.
    #[must_use]
    pub const fn for_state(state: AttemptState) -> Self {
        match state {
            AttemptState::Connecting => Self::ConnectFailed,
            AttemptState::SecuringTransport => Self::TransportFailed,
            AttemptState::DeclaringSender => Self::SenderRejected,
            AttemptState::DeclaringRecipient => Self::RecipientRejected,
            AttemptState::TransmittingBody | AttemptState::Closing => Self::TransmissionFailed,
        }
    }
}

impl Display for AbortReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ConnectFailed => "connect-failed",
            Self::TransportFailed => "transport-failed",
            Self::SenderRejected => "sender-rejected",
            Self::RecipientRejected => "recipient-rejected",
            Self::TransmissionFailed => "transmission-failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Why and where an attempt stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abort {
    pub state: AttemptState,
    pub reason: AbortReason,
    pub detail: String,
}

impl Abort {
    #[must_use]
    pub fn new(state: AttemptState, error: &AttemptError) -> Self {
        Self {
            state,
            reason: AbortReason::for_state(state),
            detail: error.to_string(),
        }
    }

    #[must_use]
    pub fn cancelled(state: AttemptState) -> Self {
        Self {
            state,
            reason: AbortReason::Cancelled,
            detail: String::from("Shutting down"),
        }
    }
}

impl Display for Abort {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}): {}", self.reason, self.state, self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Aborted(Abort),
}

/// What is sent in an attempt: one sender, one recipient, the signed bytes.
#[derive(Debug, Clone, Copy)]
pub struct Transaction<'a> {
    pub sender: &'a str,
    pub recipient: &'a str,
    pub message: &'a SignedMessage,
}

/// Runs one attempt against one target.
#[async_trait]
pub trait TargetAttempt: Send + Sync {
    /// `progress` is advanced as the attempt moves through its states, so a
    /// caller that drops the attempt part way knows where it stopped.
    async fn attempt(
        &self,
        target: &DeliveryTarget,
        transaction: &Transaction<'_>,
        progress: &mut AttemptState,
    ) -> AttemptOutcome;
}

/// Bounds a client operation by `limit`.
async fn bounded<T>(
    limit: Duration,
    operation: impl Future<Output = client::Result<T>> + Send,
) -> Result<T, AttemptError> {
    Ok(tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| AttemptError::Timeout(limit))??)
}

fn accepted(response: Response) -> Result<Response, AttemptError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(AttemptError::Rejected(response))
    }
}

/// Delivers over SMTP with [`SmtpClient`].
#[derive(Debug, Clone)]
pub struct SmtpAttempt {
    helo_name: String,
    timeouts: ClientTimeouts,
    tls: Arc<ClientConfig>,
}

impl SmtpAttempt {
    pub fn new(helo_name: impl Into<String>, timeouts: ClientTimeouts, tls: Arc<ClientConfig>) -> Self {
        Self {
            helo_name: helo_name.into(),
            timeouts,
            tls,
        }
    }

    /// # Errors
    ///
    /// Fails if the TLS client configuration can't be built.
    pub fn from_config(config: &DeliveryConfig) -> Result<Self, ClientError> {
        if config.accept_invalid_certs {
            internal!(
                level = WARN,
                "SECURITY WARNING: TLS certificate validation is disabled for outbound delivery"
            );
        }

        Ok(Self::new(
            config.helo_name.clone(),
            config.timeouts.clone(),
            client::client_config(config.accept_invalid_certs)?,
        ))
    }

    async fn connect(
        &self,
        target: &DeliveryTarget,
        progress: &mut AttemptState,
    ) -> Result<SmtpClient, AttemptError> {
        let mut client = bounded(
            self.timeouts.connect(),
            SmtpClient::connect(&target.host, target.port, Arc::clone(&self.tls)),
        )
        .await?;

        if target.mode == TransportMode::ImplicitTls {
            *progress = AttemptState::SecuringTransport;
            bounded(self.timeouts.starttls(), client.secure()).await?;
            // The greeting and EHLO are still part of connecting
            *progress = AttemptState::Connecting;
        }

        Ok(client)
    }

    async fn greet(&self, client: &mut SmtpClient, mode: TransportMode) -> Result<Response, AttemptError> {
        accepted(bounded(self.timeouts.connect(), client.read_greeting()).await?)?;

        let ehlo = bounded(self.timeouts.ehlo(), client.ehlo(&self.helo_name)).await?;
        if ehlo.is_success() {
            return Ok(ehlo);
        }

        // Servers without ESMTP only get HELO on the plain target
        if mode == TransportMode::Plain {
            return accepted(bounded(self.timeouts.ehlo(), client.helo(&self.helo_name)).await?);
        }
        Err(AttemptError::Rejected(ehlo))
    }

    async fn secure(&self, client: &mut SmtpClient, ehlo: &Response) -> Result<(), AttemptError> {
        if !ehlo.has_extension("STARTTLS") {
            return Err(AttemptError::Negotiation(
                "STARTTLS not offered".to_string(),
            ));
        }

        accepted(bounded(self.timeouts.starttls(), client.starttls()).await?)?;
        accepted(bounded(self.timeouts.ehlo(), client.ehlo(&self.helo_name)).await?)?;
        Ok(())
    }

    async fn run(
        &self,
        target: &DeliveryTarget,
        transaction: &Transaction<'_>,
        progress: &mut AttemptState,
    ) -> Result<(), AttemptError> {
        *progress = AttemptState::Connecting;
        let mut client = self.connect(target, progress).await?;
        let ehlo = self.greet(&mut client, target.mode).await?;

        if target.mode == TransportMode::StartTls {
            *progress = AttemptState::SecuringTransport;
            self.secure(&mut client, &ehlo).await?;
        }

        *progress = AttemptState::DeclaringSender;
        accepted(bounded(self.timeouts.mail_from(), client.mail_from(transaction.sender)).await?)?;

        *progress = AttemptState::DeclaringRecipient;
        accepted(bounded(self.timeouts.rcpt_to(), client.rcpt_to(transaction.recipient)).await?)?;

        *progress = AttemptState::TransmittingBody;
        let data = bounded(self.timeouts.data(), client.data()).await?;
        if !data.is_intermediate() {
            return Err(AttemptError::Rejected(data));
        }
        accepted(
            bounded(
                self.timeouts.data(),
                client.send_data(transaction.message.as_bytes()),
            )
            .await?,
        )?;

        *progress = AttemptState::Closing;
        if let Err(e) = bounded(self.timeouts.quit(), client.quit()).await {
            internal!(
                level = DEBUG,
                "QUIT to {target} failed after the message was accepted: {e}"
            );
        }

        Ok(())
    }
}

#[async_trait]
impl TargetAttempt for SmtpAttempt {
    async fn attempt(
        &self,
        target: &DeliveryTarget,
        transaction: &Transaction<'_>,
        progress: &mut AttemptState,
    ) -> AttemptOutcome {
        match self.run(target, transaction, progress).await {
            Ok(()) => AttemptOutcome::Succeeded,
            Err(error) => AttemptOutcome::Aborted(Abort::new(*progress, &error)),
        }
    }
}
