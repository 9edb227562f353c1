use async_trait::async_trait;

use crate::Message;

/// What became of a submitted message, as far as the submitting client is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionResult {
    /// At least one recipient received the message.
    Accepted { delivered: usize, failed: usize },
    /// Every recipient failed.
    Undelivered { failed: usize },
    /// The message was refused as a whole before any delivery (e.g. it could not be signed).
    Refused(String),
}

impl SubmissionResult {
    /// The SMTP reply an inbound session should give for this result.
    #[must_use]
    pub fn reply(&self) -> (u16, String) {
        match self {
            Self::Accepted {
                delivered,
                failed: 0,
            } => (250, format!("OK: delivered to {delivered} recipient(s)")),
            Self::Accepted { delivered, failed } => (
                250,
                format!("OK: delivered to {delivered} recipient(s), {failed} failed"),
            ),
            Self::Undelivered { failed } => (
                554,
                format!("Transaction failed: delivery failed for all {failed} recipient(s)"),
            ),
            Self::Refused(reason) => (554, format!("Transaction failed: {reason}")),
        }
    }
}

/// Receives completed messages from an inbound session.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> SubmissionResult;
}
