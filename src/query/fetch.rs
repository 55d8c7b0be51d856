//! The extended (and fallback simple) query flow driver.
//!
//! One [`FetchStream`] drives one client query through a single Sync
//! boundary: statement cache lookup, `Parse`/`Describe`/`Bind`/`Execute`
//! composition, implicit `BEGIN`, autosave savepoints, portal resumption and
//! error recovery all live here.
use futures_core::Stream;
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    marker::PhantomData,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
    time::Duration,
};

use super::pipeline::{PipelineState, Reaction};
use crate::{
    Error, Result,
    connection::{QueryMode, StringType},
    encode::Encoded,
    error::ErrorKind,
    protocol::{
        BackendMessage, PgFormat, ProtocolError,
        backend::{CommandComplete, FieldDescription},
        frontend, pg_type,
    },
    row::Row,
    session::AutoSave,
    sql::{ParsedSql, Sql, StatementKind, SubQuery},
    statement::{StatementName, StoredStatement},
    stream::Deadline,
    transport::PgTransport,
};

/// Savepoint name the engine wraps around statements under the autosave
/// policy.
pub const AUTOSAVE_NAME: &str = "POSTWIRE_AUTOSAVE";

/// Maps raw rows into the caller's item type while streaming.
pub trait StreamMap {
    type Output;

    fn map(row: Row) -> Result<Self::Output>;
}

/// Collects streamed items into the final result of a fetch future.
pub trait FetchCollect<R> {
    type Output;

    fn value(&mut self, input: R);

    fn finish(&mut self, cmd: Option<CommandComplete>) -> Result<Self::Output>;
}

/// The composed shape of one pipeline.
#[derive(Debug)]
struct Plan {
    simple: bool,
    sqlid: u64,
    stmt_name: StatementName,
    /// Freshly named statement to insert into the cache on success.
    fresh_named: bool,
    fetch: u32,
    /// Re-issue `Execute` after `PortalSuspended` until completion.
    resume: bool,
    main_index: usize,
    autosave: bool,
    /// Param type Oids captured from `ParameterDescription`.
    param_oids: Vec<u32>,
    sql_bytes: usize,
    /// Single idempotent statement, safe to re-run after a cached plan
    /// invalidation.
    retriable: bool,
}

#[derive(Debug)]
enum Phase<ExeFut> {
    Connect { f: ExeFut },
    Compose,
    Read,
    /// Error recorded; drain to the boundary then re-compose once.
    DrainRetry,
    /// Error recorded under autosave; drain, roll back to the savepoint,
    /// then surface the error.
    DrainRecover(Option<Error>),
    /// Drain the boundary then surface the error.
    DrainFail(Option<Error>),
    /// Terminal error, nothing left to drain.
    FailNow(Option<Error>),
    Failed,
    Complete,
}

#[must_use = "streams do nothing unless polled"]
pub struct FetchStream<'val, SQL, ExeFut, IO: PgTransport, M> {
    sql: SQL,
    io: Option<IO>,
    phase: Phase<ExeFut>,
    params: Vec<Encoded<'val>>,

    // request knobs
    fetch_size: Option<u32>,
    max_row_cap: Option<u32>,
    returning: Option<Vec<String>>,
    stmt_timeout: Option<Duration>,

    // pipeline runtime
    plan: Option<Plan>,
    state: PipelineState,
    fields: Option<Arc<Vec<FieldDescription>>>,
    units_done: usize,
    cmd: Option<CommandComplete>,
    suspended: bool,
    empty: bool,
    yielded: bool,
    retried: bool,
    needs_ready: bool,

    stmt_deadline: Deadline,
    cancel_fired: bool,
    saved_io_timeout: Option<Duration>,

    _p: PhantomData<M>,
}

impl<'val, SQL, ExeFut, IO: PgTransport, M> FetchStream<'val, SQL, ExeFut, IO, M> {
    pub(crate) fn new(
        sql: SQL,
        exe: ExeFut,
        params: Vec<Encoded<'val>>,
        max_row_cap: Option<u32>,
    ) -> Self {
        Self {
            sql,
            io: None,
            phase: Phase::Connect { f: exe },
            params,
            fetch_size: None,
            max_row_cap,
            returning: None,
            stmt_timeout: None,
            plan: None,
            state: PipelineState::default(),
            fields: None,
            units_done: 0,
            cmd: None,
            suspended: false,
            empty: false,
            yielded: false,
            retried: false,
            needs_ready: false,
            stmt_deadline: Deadline::default(),
            cancel_fired: false,
            saved_io_timeout: None,
            _p: PhantomData,
        }
    }

    pub(crate) fn fetch_size(&mut self, fetch_size: u32) {
        self.fetch_size = Some(fetch_size);
    }

    pub(crate) fn returning(&mut self, columns: Vec<String>) {
        self.returning = Some(columns);
    }

    pub(crate) fn timeout(&mut self, timeout: Duration) {
        self.stmt_timeout = Some(timeout);
    }

    /// The command completion of the main statement, once the stream ended.
    pub(crate) fn take_command(&mut self) -> Option<CommandComplete> {
        self.cmd.take()
    }

    fn reset_pipeline(&mut self) {
        self.state = PipelineState::default();
        self.fields = None;
        self.units_done = 0;
        self.cmd = None;
        self.suspended = false;
        self.empty = false;
        self.needs_ready = false;
    }
}

impl<SQL, ExeFut, IO, M> Stream for FetchStream<'_, SQL, ExeFut, IO, M>
where
    SQL: Sql + Unpin,
    ExeFut: Future<Output = Result<IO>> + Unpin,
    IO: PgTransport + Unpin,
    M: StreamMap + Unpin,
{
    type Item = Result<M::Output>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();

        loop {
            // per-statement timeout: fire the side channel cancel once, then
            // bound the remaining reads by the grace window
            if let Some(timeout) = me.stmt_timeout {
                if !me.cancel_fired && !matches!(me.phase, Phase::Connect { .. }) {
                    me.stmt_deadline.arm(timeout);
                    if me.stmt_deadline.poll_expired(cx) {
                        me.cancel_fired = true;
                        let io = me.io.as_mut().expect("io present after connect");
                        #[cfg(feature = "tokio")]
                        if let Some(token) = io.cancel_token() {
                            tokio::spawn(token.cancel_quiet());
                        }
                        io.set_io_timeout(Some(io.exec_config().cancel_grace));
                    }
                }
            }

            match &mut me.phase {
                Phase::Connect { f } => {
                    let io = ready!(Pin::new(f).poll(cx)?);
                    me.saved_io_timeout = io.io_timeout();
                    me.io = Some(io);
                    me.phase = Phase::Compose;
                }
                Phase::Compose => {
                    me.reset_pipeline();
                    let io = me.io.as_mut().unwrap();
                    let composed = compose(
                        io,
                        me.sql.sql(),
                        me.sql.persistent(),
                        &me.params,
                        me.fetch_size,
                        me.returning.as_deref(),
                        me.max_row_cap,
                    );
                    match composed {
                        Ok((plan, fields)) => {
                            me.fields = fields;
                            me.plan = Some(plan);
                            me.needs_ready = true;
                            me.phase = Phase::Read;
                        }
                        Err(err) => {
                            me.phase = Phase::Failed;
                            return Poll::Ready(Some(Err(err)));
                        }
                    }
                }
                Phase::Read => {
                    let io = me.io.as_mut().unwrap();
                    let message = match ready!(io.poll_recv::<BackendMessage>(cx)) {
                        Ok(message) => message,
                        Err(err) => {
                            me.needs_ready = false;
                            me.phase =
                                error_phase(io, me.plan.as_ref(), err, me.retried, me.yielded);
                            continue;
                        }
                    };

                    let plan = me.plan.as_ref().unwrap();
                    let (simple, main_index, fresh_named, resume, fetch) = (
                        plan.simple,
                        plan.main_index,
                        plan.fresh_named,
                        plan.resume,
                        plan.fetch,
                    );

                    if simple {
                        if let Some(result) = me.on_simple_message(message) {
                            return Poll::Ready(result);
                        }
                        continue;
                    }

                    match me.state.on_message(message) {
                        Reaction::Continue => {}
                        Reaction::ParamDescription(pd) => {
                            if me.units_done == main_index {
                                me.plan.as_mut().unwrap().param_oids = pd.type_oids();
                            }
                        }
                        Reaction::Description(rd) => {
                            if me.units_done == main_index {
                                me.fields = Some(Arc::new(rd.fields()));
                            }
                        }
                        Reaction::NoDescription => {
                            if me.units_done == main_index {
                                me.fields = Some(Arc::new(Vec::new()));
                            }
                        }
                        Reaction::Row(row) => {
                            if me.units_done != main_index {
                                let err = ProtocolError::unexpected_phase(b'D', "utility unit");
                                me.fail_local(err.into());
                                continue;
                            }
                            let Some(fields) = me.fields.clone() else {
                                let err = ProtocolError::unexpected_phase(b'D', "before describe");
                                me.fail_local(err.into());
                                continue;
                            };
                            me.yielded = true;
                            let out = M::map(Row::new(fields, row.body));
                            if out.is_err() {
                                // suspend the stream, drain on the next use
                                me.io.as_mut().unwrap().ready_request();
                                me.needs_ready = false;
                                me.phase = Phase::Failed;
                            }
                            return Poll::Ready(Some(out));
                        }
                        Reaction::Complete(cmd) => {
                            if me.units_done == main_index {
                                me.cmd = Some(cmd);
                                if fresh_named {
                                    me.store_statement();
                                }
                            }
                            me.units_done += 1;
                        }
                        Reaction::CompleteEmpty => {
                            me.empty = true;
                            me.units_done += 1;
                        }
                        Reaction::Suspended => {
                            me.suspended = true;
                        }
                        Reaction::Ready(_) => {
                            if me.suspended && resume {
                                // continue driving the open portal
                                me.suspended = false;
                                me.state = PipelineState::Bound;
                                let io = me.io.as_mut().unwrap();
                                io.send(frontend::Execute {
                                    portal_name: "",
                                    max_row: fetch as i32,
                                });
                                io.send(frontend::Sync);
                                continue;
                            }
                            me.needs_ready = false;
                            me.finish_io();
                            if me.empty {
                                me.phase = Phase::Failed;
                                return Poll::Ready(Some(Err(ErrorKind::EmptyQuery.into())));
                            }
                            me.phase = Phase::Complete;
                            return Poll::Ready(None);
                        }
                        Reaction::Unexpected(err) => {
                            me.fail_local(err.into());
                        }
                    }
                }
                Phase::DrainRetry => {
                    ready!(me.io.as_mut().unwrap().poll_drain(cx)?);
                    me.retried = true;
                    me.phase = Phase::Compose;
                }
                Phase::DrainRecover(err) => {
                    let err = err.take();
                    ready!(me.io.as_mut().unwrap().poll_drain(cx)?);
                    let io = me.io.as_mut().unwrap();
                    send_unit(io, &format!("ROLLBACK TO SAVEPOINT {AUTOSAVE_NAME}"));
                    send_unit(io, &format!("RELEASE SAVEPOINT {AUTOSAVE_NAME}"));
                    io.send(frontend::Sync);
                    io.ready_request();
                    io.session().set_autosave_armed(false);
                    me.phase = Phase::DrainFail(err);
                }
                Phase::DrainFail(err) => {
                    let err = err.take();
                    ready!(me.io.as_mut().unwrap().poll_drain(cx)?);
                    me.finish_io();
                    me.phase = Phase::Failed;
                    return Poll::Ready(err.map(Err));
                }
                Phase::FailNow(err) => {
                    let err = err.take();
                    me.finish_io();
                    me.phase = Phase::Failed;
                    return Poll::Ready(err.map(Err));
                }
                Phase::Failed | Phase::Complete => return Poll::Ready(None),
            }
        }
    }
}

impl<SQL, ExeFut, IO, M> FetchStream<'_, SQL, ExeFut, IO, M>
where
    IO: PgTransport + Unpin,
    M: StreamMap,
{
    /// Interpret one reply of the simple query flow.
    ///
    /// Returns `Some` to yield an item or end the stream.
    fn on_simple_message(
        &mut self,
        message: BackendMessage,
    ) -> Option<Option<Result<M::Output>>> {
        use BackendMessage::*;
        match message {
            RowDescription(rd) => {
                self.fields = Some(Arc::new(rd.fields()));
                None
            }
            DataRow(row) => {
                let Some(fields) = self.fields.clone() else {
                    let err = ProtocolError::unexpected_phase(b'D', "simple query");
                    self.fail_local(err.into());
                    return None;
                };
                self.yielded = true;
                let out = M::map(Row::new(fields, row.body));
                if out.is_err() {
                    self.io.as_mut().unwrap().ready_request();
                    self.needs_ready = false;
                    self.phase = Phase::Failed;
                }
                Some(Some(out))
            }
            CommandComplete(cmd) => {
                self.cmd = Some(cmd);
                // next statement of the batch gets fresh descriptors
                self.fields = None;
                self.units_done += 1;
                None
            }
            EmptyQueryResponse(_) => {
                self.empty = true;
                None
            }
            // a COPY FROM STDIN would deadlock the reply stream, refuse it
            CopyInResponse(_) | CopyBothResponse(_) => {
                let io = self.io.as_mut().unwrap();
                io.send(frontend::CopyFail { message: "COPY is not supported here" });
                None
            }
            // COPY TO STDOUT just streams by, the caller sees the final tag
            CopyData(_) | CopyOutResponse(_) | CopyDone(_) => None,
            ReadyForQuery(_) => {
                self.needs_ready = false;
                self.finish_io();
                if self.empty {
                    self.phase = Phase::Failed;
                    return Some(Some(Err(ErrorKind::EmptyQuery.into())));
                }
                self.phase = Phase::Complete;
                Some(None)
            }
            message => {
                let err = message.unexpected("simple query");
                self.fail_local(err.into());
                None
            }
        }
    }

    /// A protocol error raised locally: the server is still going to settle
    /// our boundary, request the drain and fail.
    fn fail_local(&mut self, err: Error) {
        self.io.as_mut().unwrap().ready_request();
        self.needs_ready = false;
        self.phase = Phase::DrainFail(Some(err));
    }

    fn store_statement(&mut self) {
        let plan = self.plan.as_mut().unwrap();
        let fields = self
            .fields
            .as_ref()
            .map(|f| (**f).clone())
            .filter(|f| !f.is_empty());
        let stmt = Arc::new(StoredStatement {
            name: plan.stmt_name.clone(),
            param_oids: mem::take(&mut plan.param_oids),
            fields,
            sql_bytes: plan.sql_bytes,
        });
        self.io.as_mut().unwrap().add_stmt(plan.sqlid, stmt);
    }

    /// Restore the read deadline after a statement timeout engaged the
    /// grace window.
    fn finish_io(&mut self) {
        if self.cancel_fired {
            if let Some(io) = self.io.as_mut() {
                io.set_io_timeout(self.saved_io_timeout);
            }
        }
    }
}

impl<SQL, ExeFut, IO: PgTransport, M> Drop for FetchStream<'_, SQL, ExeFut, IO, M> {
    fn drop(&mut self) {
        // an abandoned pipeline still has replies in flight up to the
        // boundary; have the transport skip them on its next use
        if self.needs_ready {
            if let Some(io) = self.io.as_mut() {
                io.ready_request();
            }
        }
    }
}

/// Decide the error path for a failed pipeline.
fn error_phase<IO: PgTransport, ExeFut>(
    io: &mut IO,
    plan: Option<&Plan>,
    err: Error,
    retried: bool,
    yielded: bool,
) -> Phase<ExeFut> {
    // a terminal error must not wait on a drain that can never complete
    if err.is_terminal() {
        return Phase::FailNow(Some(err));
    }

    io.ready_request();

    let invalidates = err
        .as_db()
        .is_some_and(|db| db.invalidates_cached_plan());
    if invalidates {
        io.invalidate_stmt_cache();
    }

    let Some(plan) = plan else {
        return Phase::DrainFail(Some(err));
    };

    if invalidates && plan.retriable && !retried && !yielded {
        return Phase::DrainRetry;
    }
    if plan.autosave {
        return Phase::DrainRecover(Some(err));
    }
    Phase::DrainFail(Some(err))
}

/// Build and send one pipeline.
///
/// Returns the plan and, for a cache hit with known descriptors, the
/// adjusted result fields.
fn compose<IO: PgTransport>(
    io: &mut IO,
    sql: &str,
    persistent: bool,
    params: &[Encoded],
    fetch_size: Option<u32>,
    returning: Option<&[String]>,
    max_row_cap: Option<u32>,
) -> Result<(Plan, Option<Arc<Vec<FieldDescription>>>)> {
    let cfg = io.exec_config();
    let parsed = ParsedSql::parse(sql, io.sql_options());
    let multi = parsed.subqueries.len() > 1;

    if cfg.query_mode == QueryMode::Simple || multi {
        if !params.is_empty() {
            return Err(ErrorKind::Unsupported(
                "bound parameters require a single statement in extended query mode".into(),
            )
            .into());
        }
        if returning.is_some() && multi {
            return Err(ErrorKind::Unsupported(
                "generated keys are unavailable for multi-statement queries".into(),
            )
            .into());
        }

        let rewritten;
        let sql = match returning {
            Some(columns) => {
                let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
                rewritten = parsed.subqueries[0].with_returning(&columns);
                &rewritten
            }
            None => sql,
        };
        io.send(frontend::Query { sql });
        return Ok((simple_plan(sql.len()), None));
    }

    let mut sub = parsed.subqueries.into_iter().next().expect("scanner yields one");

    if let Some(columns) = returning {
        let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
        let rewritten = sub.with_returning(&columns);
        if rewritten != sub.sql {
            sub = SubQuery { sql: rewritten, returning: true, values: None, ..sub };
        }
    }

    let sqlid = {
        let mut hasher = DefaultHasher::new();
        sub.sql.hash(&mut hasher);
        hasher.finish()
    };

    let threshold = cfg.prepare_threshold;
    let force_binary = threshold < 0;
    let cache_enabled = persistent && threshold > 0;
    let uses = if cache_enabled { io.note_use(sqlid) } else { 0 };
    let cached = if cache_enabled { io.get_stmt(sqlid) } else { None };
    let named = cached.is_some()
        || (cache_enabled
            && (uses >= threshold as u32 || cfg.query_mode == QueryMode::ExtendedCacheEverything));

    // below the threshold, `extendedForPrepared` keeps running the plain
    // statement through the simple flow
    if cfg.query_mode == QueryMode::ExtendedForPrepared && !named && params.is_empty() {
        io.send(frontend::Query { sql: &sub.sql });
        return Ok((simple_plan(sub.sql.len()), None));
    }

    let stmt_name = match (&cached, named) {
        (Some(cached), _) => cached.name.clone(),
        (None, true) => StatementName::next(),
        (None, false) => StatementName::unnamed(),
    };

    // parameter formats come from the binary-send Oid set
    let binary = io.binary();
    let param_formats: Vec<PgFormat> = params
        .iter()
        .map(|p| {
            if p.oid() != 0 && binary.use_binary_for_send(p.oid()) {
                PgFormat::Binary
            } else {
                PgFormat::Text
            }
        })
        .collect();

    // bound strings are typed per configuration
    let parse_oids: Vec<u32> = params
        .iter()
        .map(|p| match (p.oid(), cfg.string_type) {
            (pg_type::TEXT, StringType::Unspecified) => 0,
            (pg_type::TEXT, StringType::Varchar) => pg_type::VARCHAR,
            (oid, _) => oid,
        })
        .collect();

    // result formats: known descriptors bind per column from the receive
    // set; a first execution asks for text and learns the columns
    let mut initial_fields = None;
    let mut result_formats: Vec<PgFormat> = Vec::new();
    let describe_stmt = cached.is_none() && named;
    let describe_portal = cached.is_none() && !named;
    if let Some(cached) = &cached {
        match &cached.fields {
            Some(fields) => {
                let adjusted: Vec<FieldDescription> = fields
                    .iter()
                    .map(|f| {
                        let mut f = f.clone();
                        f.format_code =
                            binary.use_binary_for_receive(f.type_oid) as u16;
                        f
                    })
                    .collect();
                result_formats = adjusted
                    .iter()
                    .map(|f| PgFormat::from_code(f.format_code))
                    .collect();
                initial_fields = Some(Arc::new(adjusted));
            }
            None => initial_fields = Some(Arc::new(Vec::new())),
        }
    } else if describe_portal && force_binary {
        result_formats = vec![PgFormat::Binary];
    }

    // portals are only retained inside a transaction; outside one every
    // execute must run to completion
    let session = io.session();
    let in_tx = !session.autocommit() || session.tx_status().in_transaction();
    let fetch = match max_row_cap {
        Some(cap) => cap,
        None if sub.kind == StatementKind::Select && in_tx => {
            fetch_size.unwrap_or(cfg.fetch_size)
        }
        None => 0,
    };
    let resume = max_row_cap.is_none() && fetch > 0;

    let (prefix, autosave) = prefix_units(io, sub.kind.suppress_begin());

    // lazy closes of evicted statements ride ahead of the units
    for name in io.take_pending_close() {
        io.send(frontend::Close { variant: b'S', name: name.as_str() });
    }

    for unit in &prefix {
        send_unit(io, unit);
    }

    if cached.is_none() {
        io.send(frontend::Parse {
            prepare_name: stmt_name.as_str(),
            sql: &sub.sql,
            oids_len: parse_oids.len() as i16,
            oids: parse_oids.iter().copied(),
        });
    }
    if describe_stmt {
        io.send(frontend::Describe { kind: b'S', name: stmt_name.as_str() });
    }
    io.send(frontend::Bind {
        portal_name: "",
        stmt_name: stmt_name.as_str(),
        param_formats: &param_formats,
        params,
        result_formats: &result_formats,
    });
    if describe_portal {
        io.send(frontend::Describe { kind: b'P', name: "" });
    }
    io.send(frontend::Execute { portal_name: "", max_row: fetch as i32 });
    io.send(frontend::Sync);

    if autosave {
        io.session().set_autosave_armed(true);
    }

    Ok((
        Plan {
            simple: false,
            sqlid,
            stmt_name,
            fresh_named: describe_stmt,
            fetch,
            resume,
            main_index: prefix.len(),
            autosave,
            param_oids: Vec::new(),
            sql_bytes: sub.sql.len(),
            retriable: sub.kind == StatementKind::Select && persistent,
        },
        initial_fields,
    ))
}

fn simple_plan(sql_bytes: usize) -> Plan {
    Plan {
        simple: true,
        sqlid: 0,
        stmt_name: StatementName::unnamed(),
        fresh_named: false,
        fetch: 0,
        resume: false,
        main_index: 0,
        autosave: false,
        param_oids: Vec::new(),
        sql_bytes,
        retriable: false,
    }
}

/// Utility units a pipeline carries ahead of its main statement: pending
/// `DEALLOCATE ALL`, the implicit `BEGIN` of autocommit-off mode, and the
/// autosave savepoint churn.
///
/// Returns the unit sql list and whether a savepoint guards this pipeline.
pub(crate) fn prefix_units<IO: PgTransport>(io: &mut IO, suppress: bool) -> (Vec<String>, bool) {
    let mut prefix: Vec<String> = Vec::new();
    if io.take_deallocate_all() {
        prefix.push("DEALLOCATE ALL".into());
    }
    let session = io.session();
    if !session.autocommit() && session.tx_status().is_idle() && !suppress {
        prefix.push(if session.hint_read_only() {
            "BEGIN READ ONLY".into()
        } else {
            "BEGIN".into()
        });
    }
    if session.take_autosave_armed() && session.tx_status().in_transaction() && !suppress {
        prefix.push(format!("RELEASE SAVEPOINT {AUTOSAVE_NAME}"));
    }
    let autosave = session.autosave() != AutoSave::Never
        && session.tx_status().in_transaction()
        && !suppress;
    if autosave {
        prefix.push(format!("SAVEPOINT {AUTOSAVE_NAME}"));
    }
    (prefix, autosave)
}

/// One utility statement as an extended unit: `Parse` + `Bind` + `Execute`
/// of the unnamed statement, no describe, no rows.
pub(crate) fn send_unit<IO: PgTransport>(io: &mut IO, sql: &str) {
    io.send(frontend::Parse {
        prepare_name: "",
        sql,
        oids_len: 0,
        oids: std::iter::empty(),
    });
    io.send(frontend::Bind {
        portal_name: "",
        stmt_name: "",
        param_formats: &[],
        params: &[],
        result_formats: &[],
    });
    io.send(frontend::Execute { portal_name: "", max_row: 0 });
}
