//! Per-message delivery: sign once, then deliver to every recipient independently.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use sigil_common::{
    Message, Signal, internal,
    traits::handler::{MessageHandler, SubmissionResult},
};
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    dkim::{MessageSigner, SigningError},
    orchestrator::{DeliveryOutcome, Orchestrator},
};

/// The outcome for each recipient, in recipient order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub outcomes: Vec<(String, DeliveryOutcome)>,
}

impl DispatchReport {
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_delivered())
            .count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }
}

impl From<&DispatchReport> for SubmissionResult {
    fn from(report: &DispatchReport) -> Self {
        match report.delivered() {
            0 => Self::Undelivered {
                failed: report.failed(),
            },
            delivered => Self::Accepted {
                delivered,
                failed: report.failed(),
            },
        }
    }
}

pub struct Dispatcher {
    signer: Arc<dyn MessageSigner>,
    orchestrator: Arc<Orchestrator>,
    max_concurrent: usize,
    shutdown: broadcast::Receiver<Signal>,
}

impl Dispatcher {
    pub fn new(
        signer: Arc<dyn MessageSigner>,
        orchestrator: Arc<Orchestrator>,
        max_concurrent: usize,
        shutdown: broadcast::Receiver<Signal>,
    ) -> Self {
        Self {
            signer,
            orchestrator,
            max_concurrent: max_concurrent.max(1),
            shutdown,
        }
    }

    /// Signs `message` once and delivers the signed bytes to each recipient.
    /// A failing recipient never stops the others.
    ///
    /// # Errors
    ///
    /// A `SigningError` if the message can't be signed; nothing is delivered then.
    pub async fn dispatch(&self, message: &Message) -> Result<DispatchReport, SigningError> {
        let signed = self.signer.sign(message.body())?;
        internal!(
            level = DEBUG,
            "Signed message from <{}> for {} recipient(s), {} bytes",
            message.sender(),
            message.recipients().len(),
            signed.len()
        );

        let outcomes = stream::iter(message.recipients().iter().cloned())
            .map(|recipient: String| {
                let signed = signed.clone();
                let mut shutdown = self.shutdown.resubscribe();
                async move {
                    let outcome = self
                        .orchestrator
                        .deliver(message.sender(), &recipient, &signed, &mut shutdown)
                        .await;
                    (recipient, outcome)
                }
            })
            .buffered(self.max_concurrent)
            .collect::<Vec<_>>()
            .await;

        let report = DispatchReport { outcomes };
        info!(
            sender = message.sender(),
            delivered = report.delivered(),
            failed = report.failed(),
            "Dispatched message"
        );
        Ok(report)
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, message: Message) -> SubmissionResult {
        match self.dispatch(&message).await {
            Ok(report) => SubmissionResult::from(&report),
            Err(error) => {
                internal!(level = ERROR, "Refusing message from <{}>: {error}", message.sender());
                SubmissionResult::Refused(format!("Unable to sign message: {error}"))
            }
        }
    }
}
