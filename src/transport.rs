//! The [`PgTransport`] trait.
use std::{
    io,
    sync::Arc,
    task::{Context, Poll},
};

use crate::{
    Result,
    connection::ExecConfig,
    protocol::{BackendProtocol, BinaryTransfer, FrontendProtocol, frontend},
    session::SessionState,
    statement::{StatementName, StoredStatement},
};

/// A buffered stream which can send and receive postgres message.
///
/// Beside the io, the transport carries everything the query engine needs to
/// compose a pipeline: the session state, the execution knobs, the binary
/// transfer policy and the prepared statement cache.
pub trait PgTransport: Unpin {
    /// Poll to flush the underlying io.
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;

    /// Poll to receive a message.
    ///
    /// Calling `poll_recv` will also try to [`poll_flush`][1] if there is buffered message.
    ///
    /// Implementor should handle `NoticeResponse`, `NotificationResponse`
    /// and `ParameterStatus` and should not return them.
    ///
    /// Implementor also should handle `ErrorResponse` and return it as [`Err`].
    ///
    /// [1]: PgTransport::poll_flush
    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>>;

    /// Request implementor to ignore all backend messages until `ReadyForQuery` is received.
    fn ready_request(&mut self);

    /// Poll until every [`ready_request`][PgTransport::ready_request]ed
    /// boundary has seen its `ReadyForQuery`, flushing buffered writes first.
    fn poll_drain(&mut self, cx: &mut Context) -> Poll<Result<()>>;

    /// Scanner settings mirroring the negotiated server behavior.
    fn sql_options(&self) -> crate::sql::SqlOptions {
        crate::sql::SqlOptions::default()
    }

    /// Send message to the backend.
    ///
    /// Note that this send is buffered, caller must also call
    /// [`poll_flush`][1] or [`flush`][2] afterwards.
    ///
    /// [1]: PgTransport::poll_flush
    /// [2]: PgTransportExt::flush
    fn send<F: FrontendProtocol>(&mut self, message: F);

    /// Send [`Startup`][1] message to the backend.
    ///
    /// For historical reasons, the very first message sent by the client (the startup message)
    /// has no initial message-type byte.
    ///
    /// Thus, [`Startup`][1] does not implement [`FrontendProtocol`]
    ///
    /// [1]: frontend::Startup
    fn send_startup(&mut self, startup: frontend::Startup);

    /// The mutable session state of the connection.
    fn session(&mut self) -> &mut SessionState;

    /// Execution knobs from the connection configuration.
    fn exec_config(&self) -> ExecConfig;

    /// The binary transfer Oid policy.
    fn binary(&self) -> &BinaryTransfer;

    /// Check for already prepared statement.
    fn get_stmt(&mut self, sqlid: u64) -> Option<Arc<StoredStatement>>;

    /// Add new prepared statement.
    fn add_stmt(&mut self, sqlid: u64, stmt: Arc<StoredStatement>);

    /// Bump the per-sql execution counter, for the prepare threshold.
    fn note_use(&mut self, sqlid: u64) -> u32;

    /// Statement names evicted from the cache, to be closed on the next
    /// pipeline.
    fn take_pending_close(&mut self) -> Vec<StatementName>;

    /// Forget every cached statement and schedule `DEALLOCATE ALL` at the
    /// next safe boundary.
    fn invalidate_stmt_cache(&mut self);

    /// Take the pending `DEALLOCATE ALL` request, clearing it.
    fn take_deallocate_all(&mut self) -> bool;

    /// Token for the side channel cancel of the current statement, when the
    /// transport has backend key data.
    fn cancel_token(&self) -> Option<crate::cancel::CancelToken> {
        None
    }

    /// Deadline applied to blocking receives; also the grace window after a
    /// statement timeout fired a cancel.
    fn set_io_timeout(&mut self, timeout: Option<std::time::Duration>);

    fn io_timeout(&self) -> Option<std::time::Duration> {
        None
    }
}

impl<P> PgTransport for &mut P
where
    P: PgTransport,
{
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        P::poll_flush(self, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        P::poll_recv(self, cx)
    }

    fn ready_request(&mut self) {
        P::ready_request(self);
    }

    fn poll_drain(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        P::poll_drain(self, cx)
    }

    fn sql_options(&self) -> crate::sql::SqlOptions {
        P::sql_options(self)
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        P::send(self, message);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        P::send_startup(self, startup);
    }

    fn session(&mut self) -> &mut SessionState {
        P::session(self)
    }

    fn exec_config(&self) -> ExecConfig {
        P::exec_config(self)
    }

    fn binary(&self) -> &BinaryTransfer {
        P::binary(self)
    }

    fn get_stmt(&mut self, sqlid: u64) -> Option<Arc<StoredStatement>> {
        P::get_stmt(self, sqlid)
    }

    fn add_stmt(&mut self, sqlid: u64, stmt: Arc<StoredStatement>) {
        P::add_stmt(self, sqlid, stmt);
    }

    fn note_use(&mut self, sqlid: u64) -> u32 {
        P::note_use(self, sqlid)
    }

    fn take_pending_close(&mut self) -> Vec<StatementName> {
        P::take_pending_close(self)
    }

    fn invalidate_stmt_cache(&mut self) {
        P::invalidate_stmt_cache(self);
    }

    fn take_deallocate_all(&mut self) -> bool {
        P::take_deallocate_all(self)
    }

    fn cancel_token(&self) -> Option<crate::cancel::CancelToken> {
        P::cancel_token(self)
    }

    fn set_io_timeout(&mut self, timeout: Option<std::time::Duration>) {
        P::set_io_timeout(self, timeout);
    }

    fn io_timeout(&self) -> Option<std::time::Duration> {
        P::io_timeout(self)
    }
}

/// An extension trait to provide `Future` API for [`PgTransport`].
pub trait PgTransportExt: PgTransport {
    /// Flush the underlying io.
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx| self.poll_flush(cx))
    }

    /// Receive a backend message.
    fn recv<B: BackendProtocol>(&mut self) -> impl Future<Output = Result<B>> {
        std::future::poll_fn(|cx| self.poll_recv(cx))
    }
}

impl<T> PgTransportExt for T where T: PgTransport {}
