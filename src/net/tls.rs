//! Secure transport seams.
//!
//! The crate never links a TLS or GSS library. Encryption is injected through
//! the traits here; the startup phase only drives the negotiation bytes.
use std::{future::Future, io, pin::Pin};

use super::Socket;

/// An established encrypted session over a [`Socket`].
pub trait TlsSession: tokio_io::AsyncRead + tokio_io::AsyncWrite + Unpin + Send {
    /// Channel binding data for `tls-server-end-point`, when the
    /// implementation can produce the peer certificate digest.
    ///
    /// Returning `None` downgrades SASL mechanism selection from
    /// `SCRAM-SHA-256-PLUS` to `SCRAM-SHA-256`.
    fn channel_binding(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Future resolving to an established [`TlsSession`].
pub type TlsHandshake = Pin<Box<dyn Future<Output = io::Result<Box<dyn TlsSession>>> + Send>>;

/// Factory performing the TLS handshake after the server accepted `SSLRequest`.
pub trait TlsConnector: Send + Sync {
    /// Wrap the raw socket. `server_name` is the configured host, for SNI and
    /// certificate verification under `verify-full`.
    fn connect(&self, server_name: &str, socket: Socket) -> TlsHandshake;
}

/// A GSSAPI/SSPI security context driven by `AuthenticationGSSContinue`.
pub trait GssContext: Send {
    /// Feed a token from the server, returns the next token to send, or
    /// `None` once the context is established.
    fn step(&mut self, token: &[u8]) -> io::Result<Option<Vec<u8>>>;
}

/// Factory for [`GssContext`], also used for the `GSSENCRequest` upgrade.
pub trait GssProvider: Send + Sync {
    fn new_context(&self, spn: &str) -> io::Result<Box<dyn GssContext>>;
}

#[cfg(feature = "tokio")]
mod tokio_io {
    pub use tokio::io::{AsyncRead, AsyncWrite};
}

#[cfg(not(feature = "tokio"))]
mod tokio_io {
    /// Placeholder bound when the runtime is disabled.
    pub trait AsyncRead {}
    /// Placeholder bound when the runtime is disabled.
    pub trait AsyncWrite {}
}
