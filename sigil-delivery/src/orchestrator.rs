//! Per-recipient delivery: resolve once, then sweep the targets in order.

use core::fmt::{self, Display, Formatter};
use std::sync::Arc;

use sigil_common::{Signal, internal, message::domain_of};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::{
    attempt::{Abort, AttemptOutcome, AttemptState, TargetAttempt, Transaction},
    dkim::SignedMessage,
    dns::MxResolver,
    target::{DeliveryTarget, TransportPorts, plan},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The recipient's domain has no usable mail exchange. Carries the resolution error.
    NoExchange(String),
    /// Every target was tried; carries the abort of the last one.
    AllTargetsExhausted(Abort),
    /// Shutdown interrupted the delivery.
    Cancelled,
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoExchange(error) => write!(f, "no mail exchange: {error}"),
            Self::AllTargetsExhausted(abort) => write!(f, "all targets failed, last: {abort}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { target: DeliveryTarget },
    PermanentlyFailed(FailureReason),
}

impl DeliveryOutcome {
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Resolves when a shutdown is broadcast. A closed channel never cancels.
async fn shutdown_requested(shutdown: &mut broadcast::Receiver<Signal>) {
    loop {
        match shutdown.recv().await {
            Ok(Signal::Shutdown) => return,
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

pub struct Orchestrator {
    resolver: Arc<dyn MxResolver>,
    attempt: Arc<dyn TargetAttempt>,
    ports: TransportPorts,
}

impl Orchestrator {
    pub fn new(
        resolver: Arc<dyn MxResolver>,
        attempt: Arc<dyn TargetAttempt>,
        ports: TransportPorts,
    ) -> Self {
        Self {
            resolver,
            attempt,
            ports,
        }
    }

    /// Delivers `message` to one recipient. Never revisits a target and never
    /// retries after the sweep.
    pub async fn deliver(
        &self,
        sender: &str,
        recipient: &str,
        message: &SignedMessage,
        shutdown: &mut broadcast::Receiver<Signal>,
    ) -> DeliveryOutcome {
        let Some(domain) = domain_of(recipient) else {
            internal!(level = WARN, "No domain in recipient address {recipient}");
            return DeliveryOutcome::PermanentlyFailed(FailureReason::NoExchange(format!(
                "No domain in address '{recipient}'"
            )));
        };

        let resolved = tokio::select! {
            resolved = self.resolver.resolve(domain) => resolved,
            () = shutdown_requested(shutdown) => {
                return DeliveryOutcome::PermanentlyFailed(FailureReason::Cancelled);
            }
        };
        let servers = match resolved {
            Ok(servers) if !servers.is_empty() => servers,
            Ok(_) => {
                internal!(level = WARN, "No mail exchange for {domain}");
                return DeliveryOutcome::PermanentlyFailed(FailureReason::NoExchange(format!(
                    "No mail servers found for domain: {domain}"
                )));
            }
            Err(error) => {
                internal!(level = WARN, "Resolving {domain} failed: {error}");
                return DeliveryOutcome::PermanentlyFailed(FailureReason::NoExchange(
                    error.to_string(),
                ));
            }
        };

        let transaction = Transaction {
            sender,
            recipient,
            message,
        };

        let mut last = None;
        for target in plan(&servers, &self.ports) {
            debug!(
                recipient,
                host = %target.host,
                port = target.port,
                mode = %target.mode,
                "Attempting delivery"
            );

            let mut progress = AttemptState::default();
            let finished = tokio::select! {
                outcome = self.attempt.attempt(&target, &transaction, &mut progress) => Some(outcome),
                () = shutdown_requested(shutdown) => None,
            };

            match finished {
                Some(AttemptOutcome::Succeeded) => {
                    info!(
                        recipient,
                        host = %target.host,
                        port = target.port,
                        mode = %target.mode,
                        "Delivered"
                    );
                    return DeliveryOutcome::Delivered { target };
                }
                Some(AttemptOutcome::Aborted(abort)) => {
                    info!(
                        recipient,
                        host = %target.host,
                        port = target.port,
                        mode = %target.mode,
                        reason = %abort.reason,
                        "Attempt aborted: {}",
                        abort.detail
                    );
                    last = Some(abort);
                }
                None => {
                    let abort = Abort::cancelled(progress);
                    info!(
                        recipient,
                        host = %target.host,
                        port = target.port,
                        reason = %abort.reason,
                        "Attempt cancelled in {:?}",
                        abort.state
                    );
                    return DeliveryOutcome::PermanentlyFailed(FailureReason::Cancelled);
                }
            }
        }

        let outcome = last.map_or_else(
            || FailureReason::NoExchange(format!("No delivery targets for {domain}")),
            FailureReason::AllTargetsExhausted,
        );
        warn!(recipient, "Delivery failed: {outcome}");
        DeliveryOutcome::PermanentlyFailed(outcome)
    }
}
