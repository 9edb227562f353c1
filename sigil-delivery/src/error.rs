//! Errors raised while driving a single delivery attempt.
//!
//! None of these leave the crate as errors: an attempt turns them into an
//! [`Abort`](crate::Abort) for the state it was in, and the orchestrator turns
//! the last abort into a per-recipient outcome.

use std::time::Duration;

use sigil_smtp::client::{ClientError, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttemptError {
    /// The connection failed or broke (refused, reset, TLS handshake or certificate failure).
    #[error(transparent)]
    Connection(#[from] ClientError),

    /// Transport security could not be negotiated.
    #[error("Transport negotiation failed: {0}")]
    Negotiation(String),

    /// The server answered with a reply that doesn't let the attempt continue.
    #[error("Rejected: {0}")]
    Rejected(Response),

    /// The operation did not finish in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}
