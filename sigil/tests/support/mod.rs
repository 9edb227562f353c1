//! Test support utilities for E2E testing
//!
//! This module provides infrastructure for end-to-end testing of the relay,
//! from SMTP submission through signing to delivery at a mock exchange.

pub mod harness;
pub mod mock_server;

pub use harness::RelayHarness;
pub use mock_server::SmtpCommand;
