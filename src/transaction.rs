//! The [`Transaction`] type.
use std::io;

use crate::{
    Result,
    error::ErrorKind,
    executor::Executor,
    protocol::{
        BackendMessage, BackendProtocol,
        frontend::{self, FrontendProtocol},
    },
    session::TransactionStatus,
    sql::quote_identifier,
    transport::{PgTransport, PgTransportExt},
};

/// Open a transaction block.
///
/// The `BEGIN` honors the session read-only hint: under the `transaction`
/// and `always` read-only modes a read-only session opens with
/// `BEGIN READ ONLY`.
pub async fn begin<Exe: Executor>(exe: Exe) -> Result<Transaction<Exe::Transport>> {
    let mut io = exe.connection().await?;

    match io.session().tx_status() {
        TransactionStatus::Idle => {}
        _ => {
            return Err(ErrorKind::InvalidTransactionState(
                "a transaction block is already in progress",
            )
            .into());
        }
    }

    let begin = if io.session().hint_read_only() {
        "BEGIN READ ONLY"
    } else {
        "BEGIN"
    };
    exec_utility(&mut io, begin).await?;

    Ok(Transaction { io, committed: false })
}

/// Run one utility statement through the simple flow, suppressing the
/// implicit transaction machinery of the extended engine.
pub(crate) async fn exec_utility<IO: PgTransport>(io: &mut IO, sql: &str) -> Result<()> {
    io.send(frontend::Query { sql });

    loop {
        let message = match io.recv::<BackendMessage>().await {
            Ok(message) => message,
            Err(err) => {
                if !err.is_terminal() {
                    io.ready_request();
                }
                return Err(err);
            }
        };
        match message {
            BackendMessage::ReadyForQuery(_) => return Ok(()),
            BackendMessage::CommandComplete(_) | BackendMessage::EmptyQueryResponse(_) => {}
            f => {
                io.ready_request();
                return Err(f.unexpected("utility statement").into());
            }
        }
    }
}

/// An RAII implementation of transaction scope.
///
/// To begin a transaction, use [`begin`].
///
/// To commit transaction, use [`Transaction::commit`].
///
/// If not commited, when this structure is dropped, transaction will be
/// rolled back.
#[derive(Debug)]
pub struct Transaction<IO: PgTransport> {
    io: IO,
    committed: bool,
}

impl<IO> Transaction<IO>
where
    IO: PgTransport,
{
    /// Commit the transaction. A no-op when the server already reports
    /// idle.
    pub async fn commit(mut self) -> Result<()> {
        self.committed = true;
        if self.io.session().tx_status().is_idle() {
            return Ok(());
        }
        self.io.session().set_autosave_armed(false);
        exec_utility(&mut self.io, "COMMIT").await?;
        debug_assert!(self.io.session().tx_status().is_idle());
        Ok(())
    }

    /// Roll the transaction back. A no-op when the server already reports
    /// idle.
    pub async fn rollback(mut self) -> Result<()> {
        self.committed = true;
        if self.io.session().tx_status().is_idle() {
            return Ok(());
        }
        self.io.session().set_autosave_armed(false);
        exec_utility(&mut self.io, "ROLLBACK").await?;
        debug_assert!(self.io.session().tx_status().is_idle());
        Ok(())
    }

    /// Establish a savepoint, generating a unique name when the caller
    /// supplies none.
    pub async fn savepoint(&mut self, name: Option<&str>) -> Result<Savepoint> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.io.session().next_savepoint_name(),
        };
        let sql = format!("SAVEPOINT {}", quote_identifier(&name));
        exec_utility(&mut self.io, &sql).await?;
        Ok(Savepoint { name })
    }

    /// Release a savepoint.
    pub async fn release(&mut self, savepoint: Savepoint) -> Result<()> {
        let sql = format!("RELEASE SAVEPOINT {}", quote_identifier(&savepoint.name));
        exec_utility(&mut self.io, &sql).await
    }

    /// Roll back to a savepoint, recovering a failed transaction block to
    /// a usable state.
    pub async fn rollback_to(&mut self, savepoint: &Savepoint) -> Result<()> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", quote_identifier(&savepoint.name));
        exec_utility(&mut self.io, &sql).await
    }
}

/// A named savepoint within a transaction block.
#[derive(Debug, Clone)]
pub struct Savepoint {
    name: String,
}

impl Savepoint {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<IO> Drop for Transaction<IO>
where
    IO: PgTransport,
{
    fn drop(&mut self) {
        if !self.committed {
            self.io.session().set_autosave_armed(false);
            self.io.send(frontend::Query { sql: "ROLLBACK" });
            self.io.ready_request();
        }
    }
}

impl<IO> PgTransport for Transaction<IO>
where
    IO: PgTransport,
{
    fn poll_flush(&mut self, cx: &mut std::task::Context) -> std::task::Poll<io::Result<()>> {
        IO::poll_flush(&mut self.io, cx)
    }

    fn poll_recv<B: BackendProtocol>(
        &mut self,
        cx: &mut std::task::Context,
    ) -> std::task::Poll<Result<B>> {
        IO::poll_recv(&mut self.io, cx)
    }

    fn ready_request(&mut self) {
        IO::ready_request(&mut self.io)
    }

    fn poll_drain(&mut self, cx: &mut std::task::Context) -> std::task::Poll<Result<()>> {
        IO::poll_drain(&mut self.io, cx)
    }

    fn sql_options(&self) -> crate::sql::SqlOptions {
        IO::sql_options(&self.io)
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        IO::send(&mut self.io, message)
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        IO::send_startup(&mut self.io, startup)
    }

    fn session(&mut self) -> &mut crate::session::SessionState {
        IO::session(&mut self.io)
    }

    fn exec_config(&self) -> crate::connection::ExecConfig {
        IO::exec_config(&self.io)
    }

    fn binary(&self) -> &crate::protocol::BinaryTransfer {
        IO::binary(&self.io)
    }

    fn get_stmt(&mut self, sqlid: u64) -> Option<std::sync::Arc<crate::statement::StoredStatement>> {
        IO::get_stmt(&mut self.io, sqlid)
    }

    fn add_stmt(&mut self, sqlid: u64, stmt: std::sync::Arc<crate::statement::StoredStatement>) {
        IO::add_stmt(&mut self.io, sqlid, stmt)
    }

    fn note_use(&mut self, sqlid: u64) -> u32 {
        IO::note_use(&mut self.io, sqlid)
    }

    fn take_pending_close(&mut self) -> Vec<crate::statement::StatementName> {
        IO::take_pending_close(&mut self.io)
    }

    fn invalidate_stmt_cache(&mut self) {
        IO::invalidate_stmt_cache(&mut self.io)
    }

    fn take_deallocate_all(&mut self) -> bool {
        IO::take_deallocate_all(&mut self.io)
    }

    fn cancel_token(&self) -> Option<crate::cancel::CancelToken> {
        IO::cancel_token(&self.io)
    }

    fn set_io_timeout(&mut self, timeout: Option<std::time::Duration>) {
        IO::set_io_timeout(&mut self.io, timeout)
    }

    fn io_timeout(&self) -> Option<std::time::Duration> {
        IO::io_timeout(&self.io)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{self, MockTransport, run};

    fn sent_query_sql(io: &MockTransport, nth: usize) -> String {
        use crate::ext::BytesExt;
        io.sent
            .iter()
            .filter(|(tag, _)| *tag == b'Q')
            .nth(nth)
            .map(|(_, body)| body.clone().get_nul_string())
            .expect("expected a simple Query message")
    }

    #[test]
    fn begin_then_commit() {
        let mut io = MockTransport::new();
        io.replies([testing::command_complete("BEGIN"), testing::ready(b'T')]);

        let tx = run(std::pin::pin!(begin(&mut io))).unwrap();
        {
            let io = &tx.io;
            assert_eq!(sent_query_sql(io, 0), "BEGIN");
        }

        let mut held = tx;
        held.io.replies([testing::command_complete("COMMIT"), testing::ready(b'I')]);
        run(std::pin::pin!(held.commit())).unwrap();
    }

    #[test]
    fn begin_read_only_session() {
        let mut io = MockTransport::new();
        io.session.set_read_only(true);
        io.replies([testing::command_complete("BEGIN"), testing::ready(b'T')]);

        let tx = run(std::pin::pin!(begin(&mut io))).unwrap();
        assert_eq!(sent_query_sql(&tx.io, 0), "BEGIN READ ONLY");
        std::mem::forget(tx);
    }

    #[test]
    fn begin_inside_transaction_is_rejected() {
        let mut io = MockTransport::new();
        io.session.observe_ready(b'T');
        let err = run(std::pin::pin!(begin(&mut io))).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::ErrorKind::InvalidTransactionState(_),
        ));
    }

    #[test]
    fn drop_rolls_back() {
        let mut io = MockTransport::new();
        io.replies([testing::command_complete("BEGIN"), testing::ready(b'T')]);

        let tx = run(std::pin::pin!(begin(&mut io))).unwrap();
        drop(tx);

        assert_eq!(sent_query_sql(&io, 1), "ROLLBACK");
        // the rollback replies are skipped on the next use
        io.replies([testing::command_complete("ROLLBACK"), testing::ready(b'I')]);
        io.replies([testing::empty_query(), testing::ready(b'I')]);
        run(std::pin::pin!(exec_utility(&mut io, ""))).unwrap();
        io.assert_settled();
    }

    #[test]
    fn savepoints_are_quoted_and_unique() {
        let mut io = MockTransport::new();
        io.replies([testing::command_complete("BEGIN"), testing::ready(b'T')]);
        let mut tx = run(std::pin::pin!(begin(&mut io))).unwrap();

        tx.io.replies([testing::command_complete("SAVEPOINT"), testing::ready(b'T')]);
        let sp = run(std::pin::pin!(tx.savepoint(None))).unwrap();
        assert_eq!(
            sent_query_sql(&tx.io, 1),
            format!("SAVEPOINT {}", quote_identifier(sp.name())),
        );

        tx.io.replies([testing::command_complete("ROLLBACK"), testing::ready(b'T')]);
        run(std::pin::pin!(tx.rollback_to(&sp))).unwrap();
        assert!(sent_query_sql(&tx.io, 2).starts_with("ROLLBACK TO SAVEPOINT"));

        tx.io.replies([testing::command_complete("RELEASE"), testing::ready(b'T')]);
        run(std::pin::pin!(tx.release(sp))).unwrap();
        assert!(sent_query_sql(&tx.io, 3).starts_with("RELEASE SAVEPOINT"));
        std::mem::forget(tx);
    }
}
