//! Configuration types shared between the inbound session and the delivery engine.
//!
//! - [`timeouts`]: timeouts for the inbound session (server) and outbound delivery (client)

pub mod timeouts;

pub use timeouts::{ClientTimeouts, ServerTimeouts};
