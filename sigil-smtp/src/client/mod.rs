//! Outbound SMTP client.
//!
//! Supports plain TCP, TLS from the first byte (submissions port 465), and
//! upgrading a plain connection with STARTTLS. A single rustls
//! [`ClientConfig`](tokio_rustls::rustls::ClientConfig) is built once with
//! [`client_config`] and shared between connections.

mod error;
mod response;
mod smtp_client;
mod tls;

pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::{SmtpClient, dot_stuff};
pub use tls::client_config;
