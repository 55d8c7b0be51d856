//! Batched execution of one statement over many parameter vectors.
//!
//! All `Bind`/`Execute` pairs ride one Sync boundary. When a row fails in
//! the middle, the server skips the remaining pairs until `Sync`; the
//! outcomes report the counts up to the failure and mark the rest skipped.
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use super::{
    fetch::{AUTOSAVE_NAME, prefix_units, send_unit},
    pipeline::{PipelineState, Reaction},
};
use crate::{
    Error, Result,
    encode::{Encode, Encoded},
    error::ErrorKind,
    executor::Executor,
    protocol::{BackendMessage, PgFormat, frontend},
    sql::{ParsedSql, Sql},
    statement::{StatementName, StoredStatement},
    transport::PgTransport,
};

/// Per parameter-vector outcome of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The statement ran, affecting this many rows.
    Affected(u64),
    /// The statement ran as part of a rewritten multi-row insert; no
    /// per-row count exists.
    SucceededUnknown,
    /// The statement failed, or was skipped after an earlier failure.
    Failed,
}

/// The settled state of a batch: every outcome, and the error that stopped
/// it early, if one did.
#[derive(Debug)]
pub struct BatchResult {
    pub outcomes: Vec<BatchOutcome>,
    pub error: Option<Error>,
}

impl BatchResult {
    /// The error, when the batch did not run through.
    pub fn into_result(self) -> Result<Vec<BatchOutcome>> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.outcomes),
        }
    }
}

/// Entrypoint of the batch API.
#[inline]
pub fn batch<'val, SQL, Exe>(sql: SQL, exe: Exe) -> Batch<'val, SQL, Exe> {
    Batch { sql, exe, rows: Vec::new(), current: Vec::new() }
}

/// Builder collecting parameter vectors for one statement.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Batch<'val, SQL, Exe> {
    sql: SQL,
    exe: Exe,
    rows: Vec<Vec<Encoded<'val>>>,
    current: Vec<Encoded<'val>>,
}

impl<'val, SQL, Exe> Batch<'val, SQL, Exe> {
    /// Bind the next parameter of the current vector.
    #[inline]
    pub fn bind<V: Encode<'val>>(mut self, value: V) -> Self {
        self.current.push(value.encode());
        self
    }

    /// Seal the current parameter vector and start the next.
    #[inline]
    pub fn add(mut self) -> Self {
        self.rows.push(mem::take(&mut self.current));
        self
    }

    /// Run the batch.
    pub fn run(mut self) -> BatchRun<'val, SQL, Exe::Future, Exe::Transport>
    where
        Exe: Executor,
    {
        if !self.current.is_empty() {
            self.rows.push(mem::take(&mut self.current));
        }
        BatchRun {
            sql: self.sql,
            io: None,
            phase: Phase::Connect { f: self.exe.connection() },
            rows: self.rows,
            plan: None,
            state: PipelineState::default(),
            outcomes: Vec::new(),
            prefix_remaining: 0,
            error: None,
            needs_ready: false,
        }
    }
}

impl<'val, SQL, Exe> IntoFuture for Batch<'val, SQL, Exe>
where
    SQL: Sql + Unpin,
    Exe: Executor + Unpin,
    Exe::Transport: Unpin,
{
    type Output = Result<BatchResult>;

    type IntoFuture = BatchRun<'val, SQL, Exe::Future, Exe::Transport>;

    fn into_future(self) -> Self::IntoFuture {
        self.run()
    }
}

#[derive(Debug)]
struct BatchPlan {
    sqlid: u64,
    stmt_name: StatementName,
    fresh_named: bool,
    rewritten: bool,
    autosave: bool,
    param_oids: Vec<u32>,
    sql_bytes: usize,
}

#[derive(Debug)]
enum Phase<ExeFut> {
    Connect { f: ExeFut },
    Compose,
    Read,
    DrainRecover,
    DrainFinish,
    Done,
}

/// Future driving one batch to its Sync boundary.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct BatchRun<'val, SQL, ExeFut, IO: PgTransport> {
    sql: SQL,
    io: Option<IO>,
    phase: Phase<ExeFut>,
    rows: Vec<Vec<Encoded<'val>>>,

    plan: Option<BatchPlan>,
    state: PipelineState,
    outcomes: Vec<BatchOutcome>,
    prefix_remaining: usize,
    error: Option<Error>,
    needs_ready: bool,
}

impl<SQL, ExeFut, IO> Future for BatchRun<'_, SQL, ExeFut, IO>
where
    SQL: Sql + Unpin,
    ExeFut: Future<Output = Result<IO>> + Unpin,
    IO: PgTransport + Unpin,
{
    type Output = Result<BatchResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        loop {
            match &mut me.phase {
                Phase::Connect { f } => {
                    let io = ready!(Pin::new(f).poll(cx)?);
                    me.io = Some(io);
                    me.phase = Phase::Compose;
                }
                Phase::Compose => {
                    if me.rows.is_empty() {
                        me.phase = Phase::Done;
                        return Poll::Ready(Ok(BatchResult {
                            outcomes: Vec::new(),
                            error: None,
                        }));
                    }
                    let io = me.io.as_mut().unwrap();
                    match compose_batch(io, me.sql.sql(), me.sql.persistent(), &me.rows) {
                        Ok((plan, prefix)) => {
                            me.plan = Some(plan);
                            me.prefix_remaining = prefix;
                            me.needs_ready = true;
                            me.phase = Phase::Read;
                        }
                        Err(err) => {
                            me.phase = Phase::Done;
                            return Poll::Ready(Err(err));
                        }
                    }
                }
                Phase::Read => {
                    let io = me.io.as_mut().unwrap();
                    let message = match ready!(io.poll_recv::<BackendMessage>(cx)) {
                        Ok(message) => message,
                        Err(err) => {
                            if err.is_terminal() {
                                me.phase = Phase::Done;
                                return Poll::Ready(Err(err));
                            }
                            io.ready_request();
                            me.needs_ready = false;
                            if err.as_db().is_some_and(|db| db.invalidates_cached_plan()) {
                                io.invalidate_stmt_cache();
                            }
                            // the failing vector and everything after it
                            while me.outcomes.len() < me.rows.len() {
                                me.outcomes.push(BatchOutcome::Failed);
                            }
                            me.error = Some(err);
                            let autosave = me.plan.as_ref().is_some_and(|p| p.autosave);
                            me.phase = if autosave {
                                Phase::DrainRecover
                            } else {
                                Phase::DrainFinish
                            };
                            continue;
                        }
                    };

                    match me.state.on_message(message) {
                        Reaction::Continue => {}
                        Reaction::ParamDescription(pd) => {
                            me.plan.as_mut().unwrap().param_oids = pd.type_oids();
                        }
                        // a batch statement returning rows: counts are all
                        // the caller asked for, the rows pass by
                        Reaction::Description(_) | Reaction::NoDescription | Reaction::Row(_) => {}
                        Reaction::Complete(cmd) => {
                            if me.prefix_remaining > 0 {
                                me.prefix_remaining -= 1;
                            } else if me.plan.as_ref().unwrap().rewritten {
                                for _ in 0..me.rows.len() {
                                    me.outcomes.push(BatchOutcome::SucceededUnknown);
                                }
                            } else {
                                me.outcomes.push(BatchOutcome::Affected(cmd.rows_affected()));
                            }
                        }
                        Reaction::CompleteEmpty => {
                            me.outcomes.push(BatchOutcome::Failed);
                        }
                        Reaction::Suspended => {
                            let err = crate::protocol::ProtocolError::unexpected_phase(
                                b's',
                                "batch execution",
                            );
                            me.fail_local(err.into());
                        }
                        Reaction::Ready(_) => {
                            me.needs_ready = false;
                            let fresh_named = me.plan.as_ref().unwrap().fresh_named;
                            if me.error.is_none() && fresh_named {
                                me.store_statement();
                            }
                            me.phase = Phase::Done;
                            return Poll::Ready(Ok(BatchResult {
                                outcomes: mem::take(&mut me.outcomes),
                                error: me.error.take(),
                            }));
                        }
                        Reaction::Unexpected(err) => {
                            me.fail_local(err.into());
                        }
                    }
                }
                Phase::DrainRecover => {
                    ready!(me.io.as_mut().unwrap().poll_drain(cx)?);
                    let io = me.io.as_mut().unwrap();
                    send_unit(io, &format!("ROLLBACK TO SAVEPOINT {AUTOSAVE_NAME}"));
                    send_unit(io, &format!("RELEASE SAVEPOINT {AUTOSAVE_NAME}"));
                    io.send(frontend::Sync);
                    io.ready_request();
                    io.session().set_autosave_armed(false);
                    me.phase = Phase::DrainFinish;
                }
                Phase::DrainFinish => {
                    ready!(me.io.as_mut().unwrap().poll_drain(cx)?);
                    me.phase = Phase::Done;
                    return Poll::Ready(Ok(BatchResult {
                        outcomes: mem::take(&mut me.outcomes),
                        error: me.error.take(),
                    }));
                }
                Phase::Done => panic!("`poll` after completion"),
            }
        }
    }
}

impl<SQL, ExeFut, IO> BatchRun<'_, SQL, ExeFut, IO>
where
    IO: PgTransport + Unpin,
{
    fn fail_local(&mut self, err: Error) {
        self.io.as_mut().unwrap().ready_request();
        self.needs_ready = false;
        while self.outcomes.len() < self.rows.len() {
            self.outcomes.push(BatchOutcome::Failed);
        }
        self.error = Some(err);
        self.phase = Phase::DrainFinish;
    }

    fn store_statement(&mut self) {
        let plan = self.plan.as_mut().unwrap();
        let stmt = Arc::new(StoredStatement {
            name: plan.stmt_name.clone(),
            param_oids: mem::take(&mut plan.param_oids),
            fields: None,
            sql_bytes: plan.sql_bytes,
        });
        self.io.as_mut().unwrap().add_stmt(plan.sqlid, stmt);
    }
}

impl<SQL, ExeFut, IO: PgTransport> Drop for BatchRun<'_, SQL, ExeFut, IO> {
    fn drop(&mut self) {
        if self.needs_ready {
            if let Some(io) = self.io.as_mut() {
                io.ready_request();
            }
        }
    }
}

/// Compose the batch pipeline. Returns the plan and the count of prefix
/// utility units ahead of the data.
fn compose_batch<IO: PgTransport>(
    io: &mut IO,
    sql: &str,
    persistent: bool,
    rows: &[Vec<Encoded>],
) -> Result<(BatchPlan, usize)> {
    let cfg = io.exec_config();
    let parsed = ParsedSql::parse(sql, io.sql_options());
    if !parsed.is_single() {
        return Err(ErrorKind::Unsupported(
            "batch execution requires a single statement".into(),
        )
        .into());
    }
    let sub = parsed.subqueries.into_iter().next().expect("scanner yields one");
    if sub.returning {
        return Err(ErrorKind::Unsupported(
            "batch execution cannot return generated keys".into(),
        )
        .into());
    }

    // optional rewrite into one multi-row insert
    if cfg.rewrite_batched_inserts {
        if let Some(rewritten) = sub.rewrite_batched_insert(rows.len()) {
            let flat: Vec<Encoded> = rows.iter().flatten().cloned().collect();
            return compose_rewritten(io, rewritten, flat);
        }
    }

    let sqlid = {
        let mut hasher = DefaultHasher::new();
        sub.sql.hash(&mut hasher);
        hasher.finish()
    };

    let threshold = cfg.prepare_threshold;
    let cache_enabled = persistent && threshold > 0;
    let uses = if cache_enabled { io.note_use(sqlid) } else { 0 };
    let cached = if cache_enabled { io.get_stmt(sqlid) } else { None };
    let named = cached.is_some() || (cache_enabled && uses >= threshold as u32);

    let stmt_name = match (&cached, named) {
        (Some(cached), _) => cached.name.clone(),
        (None, true) => StatementName::next(),
        (None, false) => StatementName::unnamed(),
    };

    let parse_oids: Vec<u32> = rows
        .first()
        .map(|row| row.iter().map(|p| p.oid()).collect())
        .unwrap_or_default();

    let (prefix, autosave) = prefix_units(io, sub.kind.suppress_begin());

    for name in io.take_pending_close() {
        io.send(frontend::Close { variant: b'S', name: name.as_str() });
    }
    for unit in &prefix {
        send_unit(io, unit);
    }

    let fresh_named = cached.is_none() && named;
    if cached.is_none() {
        io.send(frontend::Parse {
            prepare_name: stmt_name.as_str(),
            sql: &sub.sql,
            oids_len: parse_oids.len() as i16,
            oids: parse_oids.iter().copied(),
        });
    }
    if fresh_named {
        io.send(frontend::Describe { kind: b'S', name: stmt_name.as_str() });
    }

    for row in rows {
        let formats = param_formats(io, row);
        io.send(frontend::Bind {
            portal_name: "",
            stmt_name: stmt_name.as_str(),
            param_formats: &formats,
            params: row,
            result_formats: &[],
        });
        io.send(frontend::Execute { portal_name: "", max_row: 0 });
    }
    io.send(frontend::Sync);

    if autosave {
        io.session().set_autosave_armed(true);
    }

    Ok((
        BatchPlan {
            sqlid,
            stmt_name,
            fresh_named,
            rewritten: false,
            autosave,
            param_oids: Vec::new(),
            sql_bytes: sub.sql.len(),
        },
        prefix.len(),
    ))
}

fn compose_rewritten<IO: PgTransport>(
    io: &mut IO,
    rewritten: String,
    params: Vec<Encoded>,
) -> Result<(BatchPlan, usize)> {
    let (prefix, autosave) = prefix_units(io, false);
    for name in io.take_pending_close() {
        io.send(frontend::Close { variant: b'S', name: name.as_str() });
    }
    for unit in &prefix {
        send_unit(io, unit);
    }

    io.send(frontend::Parse {
        prepare_name: "",
        sql: &rewritten,
        oids_len: params.len() as i16,
        oids: params.iter().map(|p| p.oid()),
    });

    let formats = param_formats(io, &params);
    io.send(frontend::Bind {
        portal_name: "",
        stmt_name: "",
        param_formats: &formats,
        params: &params,
        result_formats: &[],
    });
    io.send(frontend::Execute { portal_name: "", max_row: 0 });
    io.send(frontend::Sync);

    if autosave {
        io.session().set_autosave_armed(true);
    }

    Ok((
        BatchPlan {
            sqlid: 0,
            stmt_name: StatementName::unnamed(),
            fresh_named: false,
            rewritten: true,
            autosave,
            param_oids: Vec::new(),
            sql_bytes: rewritten.len(),
        },
        prefix.len(),
    ))
}

fn param_formats<IO: PgTransport>(io: &mut IO, row: &[Encoded]) -> Vec<PgFormat> {
    let binary = io.binary();
    row.iter()
        .map(|p| {
            if p.oid() != 0 && binary.use_binary_for_send(p.oid()) {
                PgFormat::Binary
            } else {
                PgFormat::Text
            }
        })
        .collect()
}

