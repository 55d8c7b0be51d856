//! Byte stream endpoints.
mod socket;
mod tls;

pub use socket::Socket;
pub use tls::{GssContext, GssProvider, TlsConnector, TlsHandshake, TlsSession};
