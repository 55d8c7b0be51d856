//! Postgres Connection.
mod config;
pub mod host;

pub use config::{
    Config, ConfigError, ExecConfig, GssEncMode, QueryMode, SslMode, StringType,
    TargetServerType,
};

use std::{io, mem, sync::Arc, task::{Context, Poll}, time::Duration};

use crate::{
    Result,
    cancel::CancelToken,
    common::ByteStr,
    error::ErrorKind,
    protocol::{
        BackendMessage, BackendProtocol, BinaryTransfer, FrontendProtocol,
        backend::BackendKeyData,
        frontend,
    },
    session::{ReadOnlyMode, SessionState, TransactionStatus},
    startup,
    statement::{StatementCache, StatementName, StoredStatement},
    stream::PgStream,
    transaction::exec_utility,
    transport::{PgTransport, PgTransportExt},
};

pub use crate::protocol::backend::NotificationResponse as Notification;
pub use crate::stream::ServerParameters;

/// A single connection to a postgres backend.
///
/// The connection owns its transport, the negotiated server parameters, the
/// session state and the prepared statement cache; everything it hands out
/// borrows it exclusively, which is what serializes the pipeline.
///
/// Prepared statements are cached transparently once a statement passes the
/// prepare threshold. `Sync` recovery after an `ErrorResponse` is handled
/// transparently. `NoticeResponse` joins the session warning chain,
/// `NotificationResponse` queues for [`get_notifications`][1].
///
/// [1]: Connection::get_notifications
#[derive(Debug)]
pub struct Connection {
    stream: PgStream,

    // feature
    cache: StatementCache,
    exec: ExecConfig,
    binary: BinaryTransfer,

    // cancel path
    key_data: Option<BackendKeyData>,
    host: ByteStr,
    port: u16,
    cancel_timeout: Duration,

    deallocate_pending: bool,
    closed: bool,
}

impl Connection {
    /// Connect using [`Config::from_env`].
    pub async fn connect_env() -> Result<Connection> {
        Self::connect_with(Config::from_env()).await
    }

    /// Connect via url.
    pub async fn connect(url: &str) -> Result<Connection> {
        Self::connect_with(Config::parse(url)?).await
    }

    /// Connect with explicit config, walking the host candidates per the
    /// configured target server type.
    pub async fn connect_with(config: Config) -> Result<Connection> {
        match config.target_server_type {
            TargetServerType::PreferPrimary => {
                match Self::connect_target(&config, TargetServerType::Primary).await {
                    Ok(conn) => Ok(conn),
                    Err(_) => Self::connect_target(&config, TargetServerType::Any).await,
                }
            }
            TargetServerType::PreferSecondary => {
                match Self::connect_target(&config, TargetServerType::Secondary).await {
                    Ok(conn) => Ok(conn),
                    Err(_) => Self::connect_target(&config, TargetServerType::Any).await,
                }
            }
            target => Self::connect_target(&config, target).await,
        }
    }

    async fn connect_target(config: &Config, target: TargetServerType) -> Result<Connection> {
        let mut candidates =
            host::order_candidates(config.hosts(), target, config.host_recheck);
        if candidates.is_empty() {
            candidates = config.hosts().to_vec();
        }

        let mut last_err = None;
        for (host, port) in candidates {
            match Self::connect_host(config, target, &host, port).await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    if matches!(err.kind(), ErrorKind::Io(_) | ErrorKind::Timeout) {
                        host::report(&host, port, host::HostStatus::Unreachable);
                    }
                    #[cfg(feature = "log")]
                    log::debug!("connect to {host}:{port} failed: {err}");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ConfigError { reason: "no host candidates to try".into() }.into()
        }))
    }

    async fn connect_host(
        config: &Config,
        target: TargetServerType,
        host: &ByteStr,
        port: u16,
    ) -> Result<Connection> {
        let open = startup::open_stream(config, host, port);
        #[cfg(feature = "tokio")]
        let mut stream = match config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, open)
                .await
                .map_err(|_| crate::Error::from(ErrorKind::Timeout))??,
            None => open.await?,
        };
        #[cfg(not(feature = "tokio"))]
        let mut stream = open.await?;

        stream.set_read_timeout(config.login_timeout.or(config.socket_timeout));
        let outcome = startup::startup(&mut stream, config).await?;
        stream.set_read_timeout(config.socket_timeout);

        if target != TargetServerType::Any {
            let secondary = show_transaction_read_only(&mut stream).await?;
            let status = if secondary {
                host::HostStatus::Secondary
            } else {
                host::HostStatus::Primary
            };
            host::report(host, port, status);

            let acceptable = match target {
                TargetServerType::Primary => status == host::HostStatus::Primary,
                TargetServerType::Secondary => status == host::HostStatus::Secondary,
                _ => true,
            };
            if !acceptable {
                let _ = stream.close().await;
                return Err(ConfigError {
                    reason: format!("{host}:{port} does not match targetServerType").into(),
                }
                .into());
            }
        }

        let session = stream.session();
        session.set_read_only(config.read_only);
        session.set_read_only_mode(config.read_only_mode);
        session.set_autosave(config.autosave);

        if config.read_only && config.read_only_mode == ReadOnlyMode::Always {
            exec_utility(
                &mut stream,
                "SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY",
            )
            .await?;
        }

        Ok(Connection {
            stream,
            cache: StatementCache::new(
                config.cache_queries,
                config.cache_size_mib.saturating_mul(1024 * 1024),
            ),
            exec: config.exec_config(),
            binary: config.binary(),
            key_data: outcome.key_data,
            host: host.clone(),
            port,
            cancel_timeout: config.cancel_signal_timeout,
            deallocate_pending: false,
            closed: false,
        })
    }

    /// Gracefully close connection.
    pub async fn close(mut self) -> io::Result<()> {
        self.closed = true;
        self.stream.close_in_place().await
    }

    /// Token for the side channel cancel of whatever runs on this
    /// connection.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        Some(CancelToken::new(
            self.host.clone(),
            self.port,
            self.key_data?,
            self.cancel_timeout,
        ))
    }

    /// Server reported parameters (`server_version`, `TimeZone`, ..).
    pub fn parameters(&self) -> &ServerParameters {
        self.stream.parameters()
    }

    /// The transaction status carried by the most recent `ReadyForQuery`.
    pub fn transaction_status(&mut self) -> TransactionStatus {
        self.stream.session().tx_status()
    }

    pub fn autocommit(&mut self) -> bool {
        self.stream.session().autocommit()
    }

    /// Toggle autocommit. With autocommit off the engine opens a
    /// transaction block implicitly before the first statement.
    pub fn set_autocommit(&mut self, autocommit: bool) {
        self.stream.session().set_autocommit(autocommit);
    }

    pub fn read_only(&mut self) -> bool {
        self.stream.session().read_only()
    }

    /// Flag the session read-only.
    ///
    /// Application depends on the configured mode: `ignore` records only,
    /// `transaction` makes future blocks open `BEGIN READ ONLY`, `always`
    /// additionally pins the session characteristics right away.
    pub async fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        if !self.stream.session().tx_status().is_idle() {
            return Err(ErrorKind::InvalidTransactionState(
                "cannot change read-only mode in the middle of a transaction",
            )
            .into());
        }
        let changed = self.stream.session().read_only() != read_only;
        self.stream.session().set_read_only(read_only);

        if changed
            && self.stream.session().read_only_mode() == ReadOnlyMode::Always
            && self.stream.session().autocommit()
        {
            let sql = if read_only {
                "SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY"
            } else {
                "SET SESSION CHARACTERISTICS AS TRANSACTION READ WRITE"
            };
            exec_utility(self, sql).await?;
        }
        Ok(())
    }

    pub fn set_autosave(&mut self, autosave: crate::session::AutoSave) {
        self.stream.session().set_autosave(autosave);
    }

    /// Pin the default isolation level of future transactions.
    ///
    /// Like the read-only flag, this is a transaction-scoped setting and is
    /// rejected while a transaction block is open.
    pub async fn set_isolation_level(
        &mut self,
        level: crate::session::IsolationLevel,
    ) -> Result<()> {
        if !self.stream.session().tx_status().is_idle() {
            return Err(ErrorKind::InvalidTransactionState(
                "cannot change the isolation level in the middle of a transaction",
            )
            .into());
        }
        let sql = format!(
            "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
            level.as_sql(),
        );
        exec_utility(self, &sql).await
    }

    /// Drain the session warning chain.
    pub fn take_warnings(&mut self) -> Vec<crate::protocol::DbResponse> {
        self.stream.session().take_warnings()
    }

    /// Drain queued notifications; with a timeout and an empty queue, wait
    /// up to that long for one to arrive.
    pub async fn get_notifications(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Vec<Notification>> {
        let mut out = Vec::new();
        while let Some(n) = self.stream.take_notification() {
            out.push(n);
        }
        let Some(timeout) = timeout else {
            return Ok(out);
        };
        if !out.is_empty() {
            return Ok(out);
        }

        #[cfg(feature = "tokio")]
        {
            let stream = &mut self.stream;
            let wait = std::future::poll_fn(|cx| stream.poll_notification(cx));
            match tokio::time::timeout(timeout, wait).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(_elapsed) => {}
            }
        }
        #[cfg(not(feature = "tokio"))]
        let _ = timeout;

        while let Some(n) = self.stream.take_notification() {
            out.push(n);
        }
        Ok(out)
    }

    /// Probe connection health with a no-op round trip under a possibly
    /// shortened timeout.
    pub async fn is_valid(&mut self, timeout: Option<Duration>) -> bool {
        if self.closed || self.stream.is_broken() {
            return false;
        }
        let saved = self.stream.read_timeout();
        if timeout.is_some() {
            self.stream.set_read_timeout(timeout);
        }
        let ok = exec_utility(&mut self.stream, "").await.is_ok();
        self.stream.set_read_timeout(saved);
        ok
    }

    /// `true` once the connection saw a terminal error or was closed; all
    /// operations fail fast from then on.
    pub fn is_closed(&self) -> bool {
        self.closed || self.stream.is_broken()
    }

    /// Number of cached server side prepared statements.
    pub fn cached_statements(&self) -> usize {
        self.cache.len()
    }
}

/// `SHOW transaction_read_only`, the connect-time primary/secondary probe.
async fn show_transaction_read_only(stream: &mut PgStream) -> Result<bool> {
    stream.send(frontend::Query { sql: "SHOW transaction_read_only" });

    let mut on = false;
    loop {
        match stream.recv::<BackendMessage>().await? {
            BackendMessage::RowDescription(_) => {}
            BackendMessage::DataRow(row) => {
                use bytes::Buf;
                let mut body = row.body;
                let len = body.get_i32();
                if len > 0 {
                    on = &body.split_to(len as usize)[..] == b"on";
                }
            }
            BackendMessage::CommandComplete(_) => {}
            BackendMessage::ReadyForQuery(_) => break,
            f => return Err(f.unexpected("transaction_read_only probe").into()),
        }
    }
    Ok(on)
}

impl PgTransport for Connection {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        self.stream.poll_flush(cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        if self.closed {
            return Poll::Ready(Err(ErrorKind::Closed.into()));
        }
        self.stream.poll_recv(cx)
    }

    fn ready_request(&mut self) {
        self.stream.ready_request();
    }

    fn poll_drain(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        self.stream.poll_drain(cx)
    }

    fn sql_options(&self) -> crate::sql::SqlOptions {
        self.stream.sql_options()
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        self.stream.send(message);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        self.stream.send_startup(startup);
    }

    fn session(&mut self) -> &mut SessionState {
        self.stream.session()
    }

    fn exec_config(&self) -> ExecConfig {
        self.exec
    }

    fn binary(&self) -> &BinaryTransfer {
        &self.binary
    }

    fn get_stmt(&mut self, sqlid: u64) -> Option<Arc<StoredStatement>> {
        self.cache.get(sqlid).inspect(|_stmt| {
            #[cfg(feature = "log-verbose")]
            log::trace!("prepared statement cache hit: {}", _stmt.name);
        })
    }

    fn add_stmt(&mut self, sqlid: u64, stmt: Arc<StoredStatement>) {
        #[cfg(feature = "log-verbose")]
        log::trace!("prepared statement add: {}", stmt.name);
        self.cache.insert(sqlid, stmt);
    }

    fn note_use(&mut self, sqlid: u64) -> u32 {
        self.cache.note_use(sqlid)
    }

    fn take_pending_close(&mut self) -> Vec<StatementName> {
        self.cache.take_pending_close()
    }

    fn invalidate_stmt_cache(&mut self) {
        #[cfg(feature = "log")]
        log::debug!("cached plan invalidated, scheduling DEALLOCATE ALL");
        self.cache.clear();
        self.deallocate_pending = true;
    }

    fn take_deallocate_all(&mut self) -> bool {
        mem::take(&mut self.deallocate_pending)
    }

    fn cancel_token(&self) -> Option<CancelToken> {
        Connection::cancel_token(self)
    }

    fn set_io_timeout(&mut self, timeout: Option<Duration>) {
        self.stream.set_read_timeout(timeout);
    }

    fn io_timeout(&self) -> Option<Duration> {
        self.stream.read_timeout()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // the socket closes with the owner; an unclosed drop only loses the
        // polite Terminate
        if !self.closed {
            #[cfg(feature = "log")]
            log::debug!("connection to {}:{} dropped without close", self.host, self.port);
        }
    }
}
