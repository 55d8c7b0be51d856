//! Postgres frontend/backend protocol engine.
//!
//! `postwire` speaks the v3 wire protocol as a client: startup and
//! authentication (including TLS negotiation and SCRAM-SHA-256), the simple
//! and extended query flows with pipelining, transparent server side
//! prepared statement caching, portal based row streaming, transaction and
//! session state tracking, and side channel cancellation.
//!
//! # Examples
//!
//! Single connection:
//!
//! ```no_run
//! use postwire::Connection;
//!
//! # async fn app() -> postwire::Result<()> {
//! let mut conn = Connection::connect_env().await?;
//!
//! let res = postwire::query_as::<_, _, (i32, String)>("SELECT 420, $1", &mut conn)
//!     .bind("Foo")
//!     .fetch_one()
//!     .await?;
//!
//! assert_eq!(res.0, 420);
//! assert_eq!(res.1.as_str(), "Foo");
//! # Ok(())
//! # }
//! ```
//!
//! Begin a transaction:
//!
//! ```no_run
//! use postwire::Connection;
//!
//! # async fn app() -> postwire::Result<()> {
//! let mut conn = Connection::connect_env().await?;
//!
//! let mut tx = postwire::begin(&mut conn).await?;
//!
//! postwire::execute("INSERT INTO foo(id) VALUES($1)", &mut tx)
//!     .bind(14)
//!     .execute()
//!     .await?;
//!
//! // if this failed, `tx` would be dropped and the block rolled back
//! fallible_operation()?;
//!
//! tx.commit().await?;
//! # Ok(())
//! # }
//! # fn fallible_operation() -> postwire::Result<()> { todo!() }
//! ```
pub mod common;
mod ext;
mod io;
pub mod net;

// Protocol
pub mod protocol;

// Encoding
pub mod encode;
mod value;

// Component
pub mod row;
pub mod session;
pub mod sql;
mod statement;

// Operation
pub mod executor;
pub mod query;
pub mod transaction;
pub mod transport;

// Connection
pub mod cancel;
pub mod connection;
mod startup;
mod stream;

mod error;

#[doc(inline)]
pub use encode::Encode;
#[doc(inline)]
pub use row::{DecodeError, FromColumn, FromRow, Row};
pub use sql::SqlExt;

#[doc(inline)]
pub use cancel::CancelToken;
#[doc(inline)]
pub use connection::{Config, Connection};
#[doc(inline)]
pub use error::{Error, ErrorKind, Result, UnsupportedAuth};
#[doc(inline)]
pub use executor::Executor;
#[doc(inline)]
pub use query::{
    Query, QueryResult, batch::batch, execute, query, query_as, query_scalar,
};
#[doc(inline)]
pub use session::TransactionStatus;
#[doc(inline)]
pub use transaction::{Transaction, begin};

#[cfg(test)]
pub(crate) mod testing;
