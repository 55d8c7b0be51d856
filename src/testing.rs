//! Scripted in-memory transport driving the engine state machines in tests
//! without a server.
#![allow(dead_code)]
use bytes::{BufMut, Bytes, BytesMut};
use std::{
    collections::VecDeque,
    io,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use crate::{
    Result,
    connection::ExecConfig,
    ext::BufMutExt,
    protocol::{
        BackendProtocol, BinaryTransfer, DbResponse, FrontendProtocol, Oid, backend, frontend,
    },
    session::SessionState,
    statement::{StatementCache, StatementName, StoredStatement},
    transport::PgTransport,
};

/// A transport whose backend is a scripted reply queue.
///
/// Mirrors the routing duties of the real stream: notices join the warning
/// chain, `ErrorResponse` surfaces as `Err`, `ReadyForQuery` updates the
/// session and settles pending drain requests. Every frontend message is
/// recorded for assertions.
#[derive(Debug)]
pub struct MockTransport {
    replies: VecDeque<(u8, Bytes)>,
    pub sent: Vec<(u8, Bytes)>,
    pub session: SessionState,
    pub cache: StatementCache,
    pub exec: ExecConfig,
    pub binary: BinaryTransfer,
    sync_pending: usize,
    deallocate_pending: bool,
    pub sync_sent: usize,
    pub ready_received: usize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            replies: VecDeque::new(),
            sent: Vec::new(),
            session: SessionState::new(),
            cache: StatementCache::new(std::num::NonZeroUsize::new(16).unwrap(), usize::MAX),
            exec: ExecConfig::default(),
            binary: BinaryTransfer::new(true),
            sync_pending: 0,
            deallocate_pending: false,
            sync_sent: 0,
            ready_received: 0,
        }
    }

    pub fn reply(&mut self, frame: (u8, Bytes)) -> &mut Self {
        self.replies.push_back(frame);
        self
    }

    pub fn replies(&mut self, frames: impl IntoIterator<Item = (u8, Bytes)>) -> &mut Self {
        self.replies.extend(frames);
        self
    }

    /// Tags of every frontend message sent so far.
    pub fn sent_tags(&self) -> Vec<u8> {
        self.sent.iter().map(|(tag, _)| *tag).collect()
    }

    /// The sql strings of every `Parse` sent, in order.
    pub fn parsed_sql(&self) -> Vec<String> {
        use crate::ext::BytesExt;
        self.sent
            .iter()
            .filter(|(tag, _)| *tag == b'P')
            .map(|(_, body)| {
                let mut body = body.clone();
                let _name = body.get_nul_string();
                body.get_nul_string()
            })
            .collect()
    }

    /// The statement names of every `Parse` sent, in order.
    pub fn parsed_names(&self) -> Vec<String> {
        use crate::ext::BytesExt;
        self.sent
            .iter()
            .filter(|(tag, _)| *tag == b'P')
            .map(|(_, body)| body.clone().get_nul_string())
            .collect()
    }

    /// Script is fully consumed and no drain request is outstanding.
    pub fn assert_settled(&self) {
        assert!(self.replies.is_empty(), "unconsumed scripted replies");
        assert_eq!(self.sync_pending, 0, "unsettled drain requests");
    }

    /// The pipeline invariant: one `ReadyForQuery` per `Sync` sent.
    ///
    /// Only holds for extended flows; a simple `Query` round trip receives
    /// its `ReadyForQuery` without a `Sync`.
    pub fn assert_sync_balanced(&self) {
        self.assert_settled();
        assert_eq!(
            self.sync_sent, self.ready_received,
            "Sync/ReadyForQuery count missmatch",
        );
    }

    fn pop_reply(&mut self) -> (u8, Bytes) {
        self.replies.pop_front().expect("scripted replies exhausted")
    }
}

impl PgTransport for MockTransport {
    fn poll_flush(&mut self, _: &mut Context) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_recv<B: BackendProtocol>(&mut self, _: &mut Context) -> Poll<Result<B>> {
        loop {
            let (msgtype, body) = self.pop_reply();

            if msgtype == backend::ReadyForQuery::MSGTYPE {
                self.ready_received += 1;
                let ready = backend::ReadyForQuery::decode(msgtype, body.clone())?;
                self.session.observe_ready(ready.tx_status);
                if self.sync_pending > 0 {
                    self.sync_pending -= 1;
                    continue;
                }
                return Poll::Ready(Ok(B::decode(msgtype, body)?));
            }

            if self.sync_pending > 0 {
                // draining to the boundary, everything else is skipped
                continue;
            }

            match msgtype {
                backend::NoticeResponse::MSGTYPE => {
                    self.session.push_warning(DbResponse::parse(body));
                }
                backend::ErrorResponse::MSGTYPE => {
                    return Poll::Ready(Err(DbResponse::parse(body).into()));
                }
                _ => return Poll::Ready(Ok(B::decode(msgtype, body)?)),
            }
        }
    }

    fn ready_request(&mut self) {
        self.sync_pending += 1;
    }

    fn poll_drain(&mut self, _: &mut Context) -> Poll<Result<()>> {
        while self.sync_pending > 0 {
            let (msgtype, body) = self.pop_reply();
            if msgtype == backend::ReadyForQuery::MSGTYPE {
                self.ready_received += 1;
                let ready = backend::ReadyForQuery::decode(msgtype, body).unwrap();
                self.session.observe_ready(ready.tx_status);
                self.sync_pending -= 1;
            }
        }
        Poll::Ready(Ok(()))
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        let mut buf = BytesMut::new();
        frontend::write(message, &mut buf);
        let mut bytes = buf.freeze();
        use bytes::Buf;
        let tag = bytes.get_u8();
        let _len = bytes.get_i32();
        if tag == b'S' {
            self.sync_sent += 1;
        }
        self.sent.push((tag, bytes));
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        let mut buf = BytesMut::new();
        startup.write(&mut buf);
        self.sent.push((0, buf.freeze()));
    }

    fn session(&mut self) -> &mut SessionState {
        &mut self.session
    }

    fn exec_config(&self) -> ExecConfig {
        self.exec
    }

    fn binary(&self) -> &BinaryTransfer {
        &self.binary
    }

    fn get_stmt(&mut self, sqlid: u64) -> Option<Arc<StoredStatement>> {
        self.cache.get(sqlid)
    }

    fn add_stmt(&mut self, sqlid: u64, stmt: Arc<StoredStatement>) {
        self.cache.insert(sqlid, stmt);
    }

    fn note_use(&mut self, sqlid: u64) -> u32 {
        self.cache.note_use(sqlid)
    }

    fn take_pending_close(&mut self) -> Vec<StatementName> {
        self.cache.take_pending_close()
    }

    fn invalidate_stmt_cache(&mut self) {
        self.cache.clear();
        self.deallocate_pending = true;
    }

    fn take_deallocate_all(&mut self) -> bool {
        std::mem::take(&mut self.deallocate_pending)
    }

    fn set_io_timeout(&mut self, _: Option<Duration>) {}
}

/// Poll a future to completion against the scripted transport.
///
/// The mock never returns `Pending`, so a bounded number of polls settles
/// any engine future; running out means the state machine is stuck.
pub fn run<F: Future + Unpin>(mut fut: F) -> F::Output {
    let waker = std::task::Waker::noop();
    let mut cx = Context::from_waker(waker);
    for _ in 0..10_000 {
        if let Poll::Ready(out) = std::pin::Pin::new(&mut fut).poll(&mut cx) {
            return out;
        }
    }
    panic!("future did not settle against a scripted transport");
}

// ===== reply builders =====

pub fn parse_complete() -> (u8, Bytes) {
    (b'1', Bytes::new())
}

pub fn bind_complete() -> (u8, Bytes) {
    (b'2', Bytes::new())
}

pub fn close_complete() -> (u8, Bytes) {
    (b'3', Bytes::new())
}

pub fn no_data() -> (u8, Bytes) {
    (b'n', Bytes::new())
}

pub fn portal_suspended() -> (u8, Bytes) {
    (b's', Bytes::new())
}

pub fn empty_query() -> (u8, Bytes) {
    (b'I', Bytes::new())
}

pub fn ready(status: u8) -> (u8, Bytes) {
    (b'Z', Bytes::copy_from_slice(&[status]))
}

pub fn command_complete(tag: &str) -> (u8, Bytes) {
    let mut buf = BytesMut::new();
    buf.put_nul_string(tag);
    (b'C', buf.freeze())
}

pub fn param_description(oids: &[Oid]) -> (u8, Bytes) {
    let mut buf = BytesMut::new();
    buf.put_u16(oids.len() as u16);
    for oid in oids {
        buf.put_u32(*oid);
    }
    (b't', buf.freeze())
}

pub fn row_description(cols: &[(&str, Oid, u16)]) -> (u8, Bytes) {
    let mut buf = BytesMut::new();
    buf.put_u16(cols.len() as u16);
    for (name, oid, format) in cols {
        buf.put_nul_string(name);
        buf.put_u32(0); // table oid
        buf.put_i16(0); // attr
        buf.put_u32(*oid);
        buf.put_i16(-1);
        buf.put_i32(-1);
        buf.put_u16(*format);
    }
    (b'T', buf.freeze())
}

pub fn data_row(cells: &[Option<&[u8]>]) -> (u8, Bytes) {
    let mut buf = BytesMut::new();
    buf.put_u16(cells.len() as u16);
    for cell in cells {
        match cell {
            Some(value) => {
                buf.put_i32(value.len() as i32);
                buf.put_slice(value);
            }
            None => buf.put_i32(-1),
        }
    }
    (b'D', buf.freeze())
}

pub fn error_response(code: &str, message: &str) -> (u8, Bytes) {
    let mut buf = BytesMut::new();
    buf.put_u8(b'S');
    buf.put_nul_string("ERROR");
    buf.put_u8(b'C');
    buf.put_nul_string(code);
    buf.put_u8(b'M');
    buf.put_nul_string(message);
    buf.put_u8(0);
    (b'E', buf.freeze())
}

pub fn notice(message: &str) -> (u8, Bytes) {
    let mut buf = BytesMut::new();
    buf.put_u8(b'S');
    buf.put_nul_string("WARNING");
    buf.put_u8(b'M');
    buf.put_nul_string(message);
    buf.put_u8(0);
    (b'N', buf.freeze())
}

pub fn notification(pid: u32, channel: &str, payload: &str) -> (u8, Bytes) {
    let mut buf = BytesMut::new();
    buf.put_u32(pid);
    buf.put_nul_string(channel);
    buf.put_nul_string(payload);
    (b'A', buf.freeze())
}

