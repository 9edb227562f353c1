//! The message handed from an inbound session to the delivery engine.

use std::sync::Arc;

/// A completed submission: who sent it, who it is for, and the raw RFC 5322 bytes.
///
/// Immutable once built. The body is reference counted so it can be handed to
/// the delivery engine without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender: String,
    recipients: Vec<String>,
    body: Arc<[u8]>,
}

impl Message {
    /// Build a message. Recipients keep their submission order; a repeated
    /// mailbox is only kept once. Local parts are compared exactly and
    /// domains case-insensitively.
    #[must_use]
    pub fn new(
        sender: impl Into<String>,
        recipients: impl IntoIterator<Item = String>,
        body: impl Into<Arc<[u8]>>,
    ) -> Self {
        let mut unique: Vec<String> = Vec::new();
        for recipient in recipients {
            if !unique.iter().any(|r| same_mailbox(r, &recipient)) {
                unique.push(recipient);
            }
        }

        Self {
            sender: sender.into(),
            recipients: unique,
            body: body.into(),
        }
    }

    /// The reverse path. Empty for the null sender.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

fn same_mailbox(a: &str, b: &str) -> bool {
    match (a.rsplit_once('@'), b.rsplit_once('@')) {
        (Some((local_a, domain_a)), Some((local_b, domain_b))) => {
            local_a == local_b && domain_a.eq_ignore_ascii_case(domain_b)
        }
        _ => a == b,
    }
}

/// Returns the domain part of an address (the text after the last `@`).
///
/// `None` when there is no `@` or nothing follows it.
#[must_use]
pub fn domain_of(address: &str) -> Option<&str> {
    let address = address.trim().trim_start_matches('<').trim_end_matches('>');
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim_end_matches('.'))
        .filter(|domain| !domain.is_empty())
}
