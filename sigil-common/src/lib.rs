pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod traits;

pub use message::Message;
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
