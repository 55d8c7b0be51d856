//! Buffered, framed connection to postgres.
use bytes::{Buf, BytesMut};
use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::Arc,
    task::{Context, Poll, ready},
    time::Duration,
};

use crate::{
    Error, Result,
    common::verbose,
    connection::ExecConfig,
    error::ErrorKind,
    net::{Socket, TlsConnector},
    protocol::{
        BackendProtocol, FrontendProtocol,
        backend::{self, NotificationResponse},
        frontend,
    },
    session::SessionState,
    statement::{StatementName, StoredStatement},
    transport::PgTransport,
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Outcome of the `SSLRequest`/`GSSENCRequest` probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeReply {
    Accepted,
    Refused,
}

/// Buffered stream carrying postgres messages.
///
/// The stream routes asynchronous backend traffic on its own:
/// `NoticeResponse` joins the session warning chain, `NotificationResponse`
/// queues for [`take_notification`][PgStream::take_notification], and
/// `ParameterStatus` updates the server parameter map. `ErrorResponse` is
/// parsed and surfaced as [`Err`].
#[derive(Debug)]
pub struct PgStream {
    socket: Socket,
    read_buf: BytesMut,
    write_buf: BytesMut,

    session: SessionState,
    params: ServerParameters,
    notifications: VecDeque<NotificationResponse>,

    // diagnostic
    sync_pending: usize,

    read_timeout: Option<Duration>,
    deadline: Deadline,
    broken: bool,
}

impl PgStream {
    /// Open the raw byte stream. `host` starting with `/` selects a unix
    /// socket directory.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let socket = match host.strip_prefix('/') {
            Some(_) => Socket::connect_socket(&format!("{host}/.s.PGSQL.{port}")).await?,
            None => Socket::connect_tcp(host, port).await?,
        };

        Ok(Self::from_socket(socket))
    }

    fn from_socket(socket: Socket) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            session: SessionState::new(),
            params: ServerParameters::default(),
            notifications: VecDeque::new(),
            sync_pending: 0,
            read_timeout: None,
            deadline: Deadline::default(),
            broken: false,
        }
    }

    /// Probe the server for a TLS session and perform the handshake through
    /// `connector` when accepted.
    ///
    /// Must happen before any protocol message is exchanged on the raw
    /// socket; on handshake failure the stream is gone.
    pub async fn request_tls(
        mut self,
        connector: &dyn TlsConnector,
        server_name: &str,
    ) -> Result<(Self, UpgradeReply)> {
        assert!(
            self.read_buf.is_empty() && self.write_buf.is_empty(),
            "tls upgrade after protocol messages were exchanged",
        );

        frontend::SslRequest.write(&mut self.write_buf);
        self.flush_now().await?;

        match self.read_reply_byte().await? {
            b'S' => {
                let session = connector.connect(server_name, self.socket).await?;
                self.socket = Socket::from_tls(session);
                Ok((self, UpgradeReply::Accepted))
            }
            b'N' => Ok((self, UpgradeReply::Refused)),
            byte => Err(crate::protocol::ProtocolError::unknown(byte).into()),
        }
    }

    /// Probe the server for GSS encryption. The wrapping itself is left to
    /// the injected provider; the stream only drives the negotiation byte.
    pub async fn request_gss_enc(mut self) -> Result<(Self, UpgradeReply)> {
        assert!(
            self.read_buf.is_empty() && self.write_buf.is_empty(),
            "gss upgrade after protocol messages were exchanged",
        );

        frontend::GssEncRequest.write(&mut self.write_buf);
        self.flush_now().await?;

        match self.read_reply_byte().await? {
            b'G' => Ok((self, UpgradeReply::Accepted)),
            b'N' => Ok((self, UpgradeReply::Refused)),
            byte => Err(crate::protocol::ProtocolError::unknown(byte).into()),
        }
    }

    /// Channel binding data of the underlying TLS session.
    pub fn channel_binding(&self) -> Option<Vec<u8>> {
        self.socket.channel_binding()
    }

    /// Returns `true` when the stream was upgraded to TLS.
    pub fn is_tls(&self) -> bool {
        self.socket.is_tls()
    }

    async fn flush_now(&mut self) -> Result<()> {
        std::future::poll_fn(|cx| {
            crate::io::poll_write_all(&mut self.socket, &mut self.write_buf, cx)
        })
        .await
        .map_err(Into::into)
    }

    async fn read_reply_byte(&mut self) -> Result<u8> {
        std::future::poll_fn(|cx| {
            loop {
                if let Some(byte) = self.read_buf.first().copied() {
                    self.read_buf.advance(1);
                    return Poll::Ready(Ok(byte));
                }
                self.read_buf.reserve(1);
                ready!(self.poll_read_socket(cx))?;
            }
        })
        .await
    }

    /// Per-read deadline applied to every blocking receive.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
        self.deadline.disarm();
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Absorbed and asynchronously updated server parameters.
    pub fn parameters(&self) -> &ServerParameters {
        &self.params
    }

    /// Pop one queued `NOTIFY` payload.
    pub fn take_notification(&mut self) -> Option<NotificationResponse> {
        self.notifications.pop_front()
    }

    /// Block until at least one notification is queued.
    ///
    /// Only valid between queries; a synchronous message arriving here is a
    /// protocol violation.
    pub(crate) fn poll_notification(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        loop {
            if !self.notifications.is_empty() {
                return Poll::Ready(Ok(()));
            }
            if let Some((msgtype, _)) = ready!(self.poll_frame(cx))? {
                return Poll::Ready(Err(crate::protocol::ProtocolError::unexpected_phase(
                    msgtype,
                    "notification wait",
                )
                .into()));
            }
        }
    }

    /// A terminal error was observed; the stream must not be reused.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Gracefully close the stream.
    pub async fn close(mut self) -> io::Result<()> {
        self.close_in_place().await
    }

    /// [`close`][PgStream::close] through a borrow, for owners with their
    /// own drop glue.
    pub(crate) async fn close_in_place(&mut self) -> io::Result<()> {
        self.send(frontend::Terminate);
        let _ = self.flush_now().await;
        self.broken = true;
        self.shutdown_socket().await
    }

    /// Write a tagless `CancelRequest`; the side channel sends nothing else.
    pub(crate) fn send_cancel(&mut self, request: frontend::CancelRequest) {
        request.write(&mut self.write_buf);
    }

    /// Flush and shut down without `Terminate`, for the cancel side channel.
    pub(crate) async fn shutdown(mut self) -> io::Result<()> {
        let _ = self.flush_now().await;
        self.shutdown_socket().await
    }

    async fn shutdown_socket(&mut self) -> io::Result<()> {
        #[cfg(feature = "tokio")]
        {
            use tokio::io::AsyncWriteExt;
            self.socket.shutdown().await
        }
        #[cfg(not(feature = "tokio"))]
        {
            panic!("runtime disabled")
        }
    }

    fn poll_read_socket(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        if let Some(timeout) = self.read_timeout {
            self.deadline.arm(timeout);
            if self.deadline.poll_expired(cx) {
                self.broken = true;
                return Poll::Ready(Err(ErrorKind::Timeout.into()));
            }
        }

        let n = ready!(crate::io::poll_read(&mut self.socket, &mut self.read_buf, cx))
            .map_err(|err| {
                self.broken = true;
                Error::from(err)
            })?;
        if n == 0 {
            self.broken = true;
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
        }
        Poll::Ready(Ok(()))
    }

    /// Drain backend replies until every pending `Sync` got its
    /// `ReadyForQuery` back.
    ///
    /// Statement errors inside the drained region were already reported to
    /// the caller; here they only settle the transaction status.
    pub(crate) fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        if !self.write_buf.is_empty() {
            ready!(self.poll_flush_io(cx))?;
        }

        while self.sync_pending != 0 {
            let (msgtype, body) = ready!(self.poll_message(cx))?;

            match msgtype {
                backend::ErrorResponse::MSGTYPE => {
                    let fields = crate::protocol::DbResponse::parse(body);
                    if fields.is_fatal() {
                        self.broken = true;
                        return Poll::Ready(Err(fields.into()));
                    }
                    #[cfg(feature = "log")]
                    log::debug!("drained error response: {fields}");
                }
                backend::ReadyForQuery::MSGTYPE => {
                    self.sync_pending -= 1;
                }
                // ignore all other messages until `ReadyForQuery` received
                _ => {}
            }
        }

        Poll::Ready(Ok(()))
    }

    fn poll_flush_io(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        crate::io::poll_write_all(&mut self.socket, &mut self.write_buf, cx)
    }

    /// Read one framed message, routing asynchronous traffic.
    ///
    /// Returns `None` for a routed asynchronous message. `ReadyForQuery`
    /// passes through here so the session status is already updated when
    /// the caller sees it.
    fn poll_frame(&mut self, cx: &mut Context) -> Poll<Result<Option<(u8, bytes::Bytes)>>> {
        loop {
            let Some(mut header) = self.read_buf.get(..5) else {
                self.read_buf.reserve(DEFAULT_BUF_CAPACITY);
                ready!(self.poll_read_socket(cx))?;
                continue;
            };

            let msgtype = header.get_u8();
            let len = header.get_i32() as usize;

            if self.read_buf.len() - 1/*msgtype*/ < len {
                self.read_buf.reserve(1 + len);
                ready!(self.poll_read_socket(cx))?;
                continue;
            }

            self.read_buf.advance(5);
            let body = self.read_buf.split_to(len - 4).freeze();
            self.deadline.disarm();

            let routed = match msgtype {
                backend::NoticeResponse::MSGTYPE => {
                    let fields = crate::protocol::DbResponse::parse(body);
                    #[cfg(feature = "log")]
                    log::warn!("{fields}");
                    self.session.push_warning(fields);
                    None
                }
                backend::NotificationResponse::MSGTYPE => {
                    let notification = NotificationResponse::decode(msgtype, body)?;
                    verbose!(channel = %notification.channel, "notification");
                    self.notifications.push_back(notification);
                    None
                }
                backend::ParameterStatus::MSGTYPE => {
                    let status = backend::ParameterStatus::decode(msgtype, body)?;
                    self.params.update(status.name, status.value);
                    None
                }
                backend::ReadyForQuery::MSGTYPE => {
                    let ready = backend::ReadyForQuery::decode(msgtype, body.clone())?;
                    self.session.observe_ready(ready.tx_status);
                    Some((msgtype, body))
                }
                _ => Some((msgtype, body)),
            };
            return Poll::Ready(Ok(routed));
        }
    }

    /// [`poll_frame`][PgStream::poll_frame] skipping routed asynchronous
    /// messages.
    fn poll_message(&mut self, cx: &mut Context) -> Poll<Result<(u8, bytes::Bytes)>> {
        loop {
            if let Some(frame) = ready!(self.poll_frame(cx))? {
                return Poll::Ready(Ok(frame));
            }
        }
    }
}

impl PgTransport for PgStream {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        self.poll_flush_io(cx)
    }

    fn poll_drain(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        self.poll_ready(cx)
    }

    fn sql_options(&self) -> crate::sql::SqlOptions {
        crate::sql::SqlOptions {
            standard_conforming_strings: self.params.standard_conforming_strings(),
        }
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        if self.broken {
            return Poll::Ready(Err(ErrorKind::Closed.into()));
        }

        ready!(self.poll_ready(cx))?;

        let (msgtype, body) = ready!(self.poll_message(cx))?;

        if msgtype == backend::ErrorResponse::MSGTYPE {
            let fields = crate::protocol::DbResponse::parse(body);
            if fields.is_fatal() {
                self.broken = true;
            }
            return Poll::Ready(Err(fields.into()));
        }

        #[cfg(feature = "log-verbose")]
        log::trace!("(B){}", backend::BackendMessage::message_name(msgtype));

        Poll::Ready(Ok(B::decode(msgtype, body)?))
    }

    fn ready_request(&mut self) {
        self.sync_pending += 1;
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        #[cfg(feature = "log-verbose")]
        log::trace!("(F){:?}", char::from(F::MSGTYPE));
        frontend::write(message, &mut self.write_buf);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        #[cfg(feature = "log-verbose")]
        log::trace!("(F){startup:?}");
        startup.write(&mut self.write_buf);
    }

    fn session(&mut self) -> &mut SessionState {
        &mut self.session
    }

    fn exec_config(&self) -> ExecConfig {
        ExecConfig::default()
    }

    fn binary(&self) -> &crate::protocol::BinaryTransfer {
        static TEXT_ONLY: std::sync::OnceLock<crate::protocol::BinaryTransfer> =
            std::sync::OnceLock::new();
        TEXT_ONLY.get_or_init(|| crate::protocol::BinaryTransfer::new(false))
    }

    fn get_stmt(&mut self, _: u64) -> Option<Arc<StoredStatement>> {
        None
    }

    fn add_stmt(&mut self, _: u64, _: Arc<StoredStatement>) {}

    fn note_use(&mut self, _: u64) -> u32 {
        0
    }

    fn take_pending_close(&mut self) -> Vec<StatementName> {
        Vec::new()
    }

    fn invalidate_stmt_cache(&mut self) {}

    fn take_deallocate_all(&mut self) -> bool {
        false
    }

    fn set_io_timeout(&mut self, timeout: Option<Duration>) {
        self.set_read_timeout(timeout);
    }

    fn io_timeout(&self) -> Option<Duration> {
        self.read_timeout()
    }
}

/// Read deadline armed while a receive is blocked on the socket.
#[derive(Debug, Default)]
pub(crate) struct Deadline {
    #[cfg(feature = "tokio")]
    sleep: Option<std::pin::Pin<Box<tokio::time::Sleep>>>,
}

impl Deadline {
    #[cfg(feature = "tokio")]
    pub(crate) fn arm(&mut self, timeout: Duration) {
        if self.sleep.is_none() {
            self.sleep = Some(Box::pin(tokio::time::sleep(timeout)));
        }
    }

    #[cfg(feature = "tokio")]
    pub(crate) fn disarm(&mut self) {
        self.sleep = None;
    }

    #[cfg(feature = "tokio")]
    pub(crate) fn poll_expired(&mut self, cx: &mut Context) -> bool {
        match &mut self.sleep {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }

    #[cfg(not(feature = "tokio"))]
    pub(crate) fn arm(&mut self, _: Duration) {}

    #[cfg(not(feature = "tokio"))]
    pub(crate) fn disarm(&mut self) {}

    #[cfg(not(feature = "tokio"))]
    pub(crate) fn poll_expired(&mut self, _: &mut Context) -> bool {
        false
    }
}

/// Server reported run-time parameters, absorbed at startup and refreshed by
/// asynchronous `ParameterStatus` messages.
#[derive(Debug, Default)]
pub struct ServerParameters {
    params: HashMap<String, String>,
}

impl ServerParameters {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub(crate) fn update(&mut self, name: String, value: String) {
        verbose!(name = %name, value = %value, "parameter status");
        self.params.insert(name, value);
    }

    pub fn server_version(&self) -> Option<&str> {
        self.get("server_version")
    }

    /// Numeric server version, `major * 10000 + minor`.
    pub fn server_version_num(&self) -> Option<u32> {
        let raw = self.server_version()?;
        let mut parts = raw.split(|c: char| !c.is_ascii_digit());
        let major: u32 = parts.next()?.parse().ok()?;
        let minor: u32 = parts.next().and_then(|m| m.parse().ok()).unwrap_or(0);
        Some(major * 10000 + minor)
    }

    pub fn server_encoding(&self) -> Option<&str> {
        self.get("server_encoding")
    }

    pub fn timezone(&self) -> Option<&str> {
        self.get("TimeZone")
    }

    pub fn standard_conforming_strings(&self) -> bool {
        // postgres defaults to on since 9.1
        self.get("standard_conforming_strings") != Some("off")
    }

    pub fn integer_datetimes(&self) -> bool {
        self.get("integer_datetimes") != Some("off")
    }

    pub fn is_superuser(&self) -> bool {
        self.get("is_superuser") == Some("on")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn server_version_num() {
        let mut p = ServerParameters::default();
        p.update("server_version".into(), "16.3".into());
        assert_eq!(p.server_version_num(), Some(160003));
        p.update("server_version".into(), "17beta1".into());
        assert_eq!(p.server_version_num(), Some(170000));
    }

    #[test]
    fn standard_conforming_strings_defaults_on() {
        let p = ServerParameters::default();
        assert!(p.standard_conforming_strings());
        let mut p = ServerParameters::default();
        p.update("standard_conforming_strings".into(), "off".into());
        assert!(!p.standard_conforming_strings());
    }
}
