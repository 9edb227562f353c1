//! Test support utilities for delivery tests
//!
//! A mock SMTP server to deliver to, plus in-memory stand-ins for the
//! resolver, the signer and the attempt runner.

pub mod mock_server;

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use sigil_delivery::{
    AttemptOutcome, AttemptState, DeliveryTarget, DnsError, MailServer, MessageSigner, MxResolver,
    SignedMessage, SigningError, TargetAttempt, Transaction,
};

/// Answers from a fixed table; unknown domains have no mail servers.
#[derive(Default)]
pub struct StaticResolver {
    domains: HashMap<String, Vec<MailServer>>,
    lookups: AtomicUsize,
}

impl StaticResolver {
    #[must_use]
    pub fn with(mut self, domain: &str, hosts: &[&str]) -> Self {
        let servers = hosts
            .iter()
            .zip(10u16..)
            .map(|(host, priority)| MailServer::new(*host, priority))
            .collect();
        self.domains.insert(domain.to_string(), servers);
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MxResolver for StaticResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.domains
            .get(domain)
            .cloned()
            .ok_or_else(|| DnsError::NoMailServers(domain.to_string()))
    }
}

/// Counts how often it is asked to sign.
pub struct CountingSigner<S> {
    inner: S,
    calls: AtomicUsize,
}

impl<S> CountingSigner<S> {
    pub const fn new(inner: S) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl<S: MessageSigner> MessageSigner for CountingSigner<S> {
    fn sign(&self, message: &[u8]) -> Result<SignedMessage, SigningError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.inner.sign(message)
    }
}

/// Runs the real attempt and records every target and outcome.
pub struct Recording<A> {
    inner: A,
    log: Mutex<Vec<(DeliveryTarget, AttemptOutcome)>>,
}

impl<A> Recording<A> {
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn log(&self) -> Vec<(DeliveryTarget, AttemptOutcome)> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl<A: TargetAttempt> TargetAttempt for Recording<A> {
    async fn attempt(
        &self,
        target: &DeliveryTarget,
        transaction: &Transaction<'_>,
        progress: &mut AttemptState,
    ) -> AttemptOutcome {
        let outcome = self.inner.attempt(target, transaction, progress).await;
        self.log
            .lock()
            .unwrap()
            .push((target.clone(), outcome.clone()));
        outcome
    }
}
