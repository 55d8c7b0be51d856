//! `postwire` error types.
use std::{fmt, io, str::Utf8Error};

use crate::{
    connection::ConfigError,
    protocol::{DbResponse, ProtocolError, SqlState},
    row::DecodeError,
};

/// A specialized [`Result`] type for `postwire` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `postwire` library.
pub struct Error {
    context: String,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Attach an operation context shown ahead of the message.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// The server response when the error came from an `ErrorResponse`.
    pub fn as_db(&self) -> Option<&DbResponse> {
        match &self.kind {
            ErrorKind::Database(db) => Some(db),
            _ => None,
        }
    }

    /// SQLSTATE of the server error, if any.
    pub fn sql_state(&self) -> Option<SqlState> {
        self.as_db()?.code()
    }

    /// Class `57014`: the statement was canceled through the side channel
    /// or by a server side timeout.
    pub fn is_query_canceled(&self) -> bool {
        self.sql_state() == Some(SqlState::QUERY_CANCELED)
    }

    /// Errors that close the connection: io failures, protocol violations,
    /// timeouts, fatal server responses and use after close.
    ///
    /// Statement level server errors are non terminal; they leave the
    /// transaction in the failed state until rollback.
    pub fn is_terminal(&self) -> bool {
        match &self.kind {
            ErrorKind::Io(_)
            | ErrorKind::Protocol(_)
            | ErrorKind::Timeout
            | ErrorKind::Closed
            | ErrorKind::SslNotSupported
            | ErrorKind::GssEncNotSupported
            | ErrorKind::UnsupportedAuth(_)
            | ErrorKind::InvalidPassword => true,
            ErrorKind::Database(db) => db.is_fatal(),
            _ => false,
        }
    }
}

/// All possible error kind from `postwire` library.
pub enum ErrorKind {
    /// Invalid connection url or property.
    Config(ConfigError),
    /// The backend sent something the codec or a flow cannot accept.
    Protocol(ProtocolError),
    /// Transport failure; the connection is closed.
    Io(io::Error),
    /// An `ErrorResponse` from the server.
    Database(DbResponse),
    /// Postgres returned a non utf8 string.
    Utf8(Utf8Error),
    /// A row was requested but the result set is empty.
    RowNotFound,
    /// The query string was empty.
    EmptyQuery,
    /// The server requested an authentication flow with no provider
    /// installed, or none the driver speaks.
    UnsupportedAuth(UnsupportedAuth),
    /// Password based authentication failed locally, e.g. the SCRAM server
    /// signature did not verify.
    InvalidPassword,
    /// `sslmode` requires TLS but the server refused `SSLRequest`.
    SslNotSupported,
    /// `gssEncMode` requires GSS encryption but the server refused it.
    GssEncNotSupported,
    /// The read deadline elapsed; the connection is no longer usable.
    Timeout,
    /// Operation on an already closed connection.
    Closed,
    /// A client side transaction state guard failed, e.g. changing the
    /// isolation level inside an open transaction.
    InvalidTransactionState(&'static str),
    /// The request combines features the engine cannot serve together.
    Unsupported(std::borrow::Cow<'static, str>),
    /// Failed to decode a row value.
    Decode(DecodeError),
}

/// The authentication flow the driver could not serve.
#[derive(Debug)]
pub struct UnsupportedAuth {
    pub mechanism: String,
}

impl fmt::Display for UnsupportedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported authentication: {}", self.mechanism)
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                Self { context: String::new(), kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ConfigError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<DbResponse>e => ErrorKind::Database(e));
from!(<Utf8Error>e => ErrorKind::Utf8(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<DecodeError>e => ErrorKind::Decode(e));

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }
        fmt::Display::fmt(&self.kind, f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind {}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Utf8(e) => e.fmt(f),
            Self::RowNotFound => f.write_str("no rows returned by a query expected to return at least one row"),
            Self::EmptyQuery => f.write_str("query string is empty"),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::InvalidPassword => f.write_str("password authentication failed"),
            Self::SslNotSupported => f.write_str("server does not support SSL, but SSL was required"),
            Self::GssEncNotSupported => f.write_str("server does not support GSS encryption, but it was required"),
            Self::Timeout => f.write_str("timeout while waiting for the server"),
            Self::Closed => f.write_str("connection does not exist, it has been closed"),
            Self::InvalidTransactionState(what) => write!(f, "invalid transaction state: {what}"),
            Self::Unsupported(what) => write!(f, "unsupported operation: {what}"),
            Self::Decode(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ext::BufMutExt;
    use bytes::{BufMut, BytesMut};

    fn db_error(code: &str) -> Error {
        let mut buf = BytesMut::new();
        buf.put_u8(b'S');
        buf.put_nul_string("ERROR");
        buf.put_u8(b'C');
        buf.put_nul_string(code);
        buf.put_u8(0);
        DbResponse::parse(buf.freeze()).into()
    }

    #[test]
    fn canceled_is_not_terminal() {
        let err = db_error("57014");
        assert!(err.is_query_canceled());
        assert!(!err.is_terminal());
    }

    #[test]
    fn io_is_terminal() {
        let err: Error = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(err.is_terminal());
        assert!(!err.is_query_canceled());
    }

    #[test]
    fn unique_violation_is_statement_level() {
        let err = db_error("23505");
        assert!(!err.is_terminal());
        assert_eq!(err.sql_state().unwrap().as_str(), "23505");
    }
}
