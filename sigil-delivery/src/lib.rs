//! Outbound delivery for the sigil relay.
//!
//! A submitted message is signed once ([`dkim`]), then for each recipient the
//! domain's mail exchanges are resolved ([`dns`]) and tried in order, each
//! with implicit TLS, then STARTTLS, then plain text ([`target`]), until one
//! accepts the message or all of them have failed.

mod attempt;
mod config;
pub mod dkim;
mod dispatch;
mod dns;
mod error;
mod orchestrator;
mod target;

pub use attempt::{
    Abort, AbortReason, AttemptOutcome, AttemptState, SmtpAttempt, TargetAttempt, Transaction,
};
pub use config::DeliveryConfig;
pub use dispatch::{DispatchReport, Dispatcher};
pub use dkim::{DkimConfig, DkimSigner, MessageSigner, SignedMessage, SigningError, Unsigned};
pub use dns::{DnsConfig, DnsError, DnsResolver, MailServer, MxResolver};
pub use error::AttemptError;
pub use orchestrator::{DeliveryOutcome, FailureReason, Orchestrator};
pub use target::{DeliveryTarget, TransportMode, TransportPorts, plan};
