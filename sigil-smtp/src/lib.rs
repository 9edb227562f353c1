//! SMTP for the relay: the outbound client used for delivery and the inbound
//! submission session that feeds it.

pub mod auth;
pub mod client;
pub mod command;
pub mod listener;
pub mod reply;
pub mod session;
pub mod state;

pub use listener::{Listener, ListenerConfig};
pub use session::{Session, SessionConfig};
