//! Query API types.
pub mod batch;
pub mod fetch;
pub(crate) mod pipeline;
pub mod portal;

#[cfg(test)]
mod tests;

use std::{marker::PhantomData, pin::Pin, task::{Context, Poll, ready}, time::Duration};

use futures_core::Stream;

use crate::{
    Result,
    encode::{Encode, Encoded},
    error::ErrorKind,
    executor::Executor,
    protocol::backend::CommandComplete,
    row::{FromColumn, FromRow, Row},
    sql::Sql,
    transport::PgTransport,
};

pub use batch::{Batch, BatchOutcome, BatchResult, batch};
pub use fetch::{FetchCollect, FetchStream, StreamMap};
pub use portal::Portal;

/// Entrypoint of the query API.
#[inline]
pub fn query<'val, SQL, Exe>(sql: SQL, exe: Exe) -> Query<'val, SQL, Exe, StreamRow<Row>> {
    Query {
        sql,
        exe,
        params: Vec::new(),
        fetch_size: None,
        timeout: None,
        returning: None,
        _p: PhantomData,
    }
}

/// Entrypoint of the query API, decoding rows into `R`.
#[inline]
pub fn query_as<'val, SQL, Exe, R>(sql: SQL, exe: Exe) -> Query<'val, SQL, Exe, StreamRow<R>> {
    Query {
        sql,
        exe,
        params: Vec::new(),
        fetch_size: None,
        timeout: None,
        returning: None,
        _p: PhantomData,
    }
}

/// Entrypoint of the query API, decoding the first column of each row.
#[inline]
pub fn query_scalar<'val, SQL, Exe, D>(sql: SQL, exe: Exe) -> Query<'val, SQL, Exe, StreamScalar<D>> {
    Query {
        sql,
        exe,
        params: Vec::new(),
        fetch_size: None,
        timeout: None,
        returning: None,
        _p: PhantomData,
    }
}

/// Entrypoint of the query API for statements executed for their effect.
#[inline]
pub fn execute<'val, SQL, Exe>(sql: SQL, exe: Exe) -> Query<'val, SQL, Exe, StreamRow<Row>> {
    query(sql, exe)
}

/// The query API.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Query<'val, SQL, Exe, M> {
    sql: SQL,
    exe: Exe,
    params: Vec<Encoded<'val>>,
    fetch_size: Option<u32>,
    timeout: Option<Duration>,
    returning: Option<Vec<String>>,
    _p: PhantomData<M>,
}

impl<'val, SQL, Exe, M> Query<'val, SQL, Exe, M> {
    /// Bind query parameter.
    #[inline]
    pub fn bind<V: Encode<'val>>(mut self, value: V) -> Self {
        self.params.push(value.encode());
        self
    }

    /// Drive the result through a server side cursor, `fetch_size` rows per
    /// `Execute`.
    ///
    /// Only effective for `SELECT` inside a transaction; elsewhere the
    /// portal could not survive the Sync boundary and the engine reads the
    /// result to completion.
    #[inline]
    pub fn fetch_size(mut self, fetch_size: u32) -> Self {
        self.fetch_size = Some(fetch_size);
        self
    }

    /// Per-statement timeout: past it the engine fires a side channel
    /// cancel, then gives the server a grace window before the connection
    /// is closed.
    #[inline]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Request generated keys: appends `RETURNING *` (empty list) or the
    /// named columns when the statement does not already return.
    #[inline]
    pub fn returning_generated_keys(mut self, columns: &[&str]) -> Self {
        self.returning = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    fn into_stream(self, max_row_cap: Option<u32>) -> FetchStream<'val, SQL, Exe::Future, Exe::Transport, M>
    where
        Exe: Executor,
    {
        let mut stream = FetchStream::new(self.sql, self.exe.connection(), self.params, max_row_cap);
        if let Some(fetch_size) = self.fetch_size {
            stream.fetch_size(fetch_size);
        }
        if let Some(timeout) = self.timeout {
            stream.timeout(timeout);
        }
        if let Some(returning) = self.returning {
            stream.returning(returning);
        }
        stream
    }
}

impl<'val, SQL, Exe, M> Query<'val, SQL, Exe, M> {
    /// Fetch rows using [`Stream`][futures_core::Stream] api.
    ///
    /// The returned `Stream` must be polled/awaited until completion,
    /// otherwise it will disturb subsequent query.
    #[inline]
    pub fn fetch(self) -> FetchStream<'val, SQL, Exe::Future, Exe::Transport, M>
    where
        Exe: Executor,
        M: StreamMap,
    {
        self.into_stream(None)
    }

    /// Fetch all rows into [`Vec`].
    #[inline]
    pub fn fetch_all(self) -> Fetch<'val, SQL, Exe::Future, Exe::Transport, M, CollectAll<M::Output>>
    where
        Exe: Executor,
        M: StreamMap,
    {
        Fetch::new(self.into_stream(None), CollectAll(Vec::new()))
    }

    /// Fetch one row.
    #[inline]
    pub fn fetch_one(self) -> Fetch<'val, SQL, Exe::Future, Exe::Transport, M, CollectOne<M::Output>>
    where
        Exe: Executor,
        M: StreamMap,
    {
        Fetch::new(self.into_stream(Some(1)), CollectOne(None))
    }

    /// Optionally fetch one row.
    #[inline]
    pub fn fetch_optional(self) -> Fetch<'val, SQL, Exe::Future, Exe::Transport, M, CollectOpt<M::Output>>
    where
        Exe: Executor,
        M: StreamMap,
    {
        Fetch::new(self.into_stream(Some(1)), CollectOpt(None))
    }

    /// Execute statement and return number of rows affected.
    #[inline]
    pub fn execute(self) -> Fetch<'val, SQL, Exe::Future, Exe::Transport, M, CollectCmd>
    where
        Exe: Executor,
        M: StreamMap,
    {
        Fetch::new(self.into_stream(None), CollectCmd)
    }
}

impl<'val, SQL, Exe, M> IntoFuture for Query<'val, SQL, Exe, M>
where
    SQL: Sql + Unpin,
    Exe: Executor + Unpin,
    M: StreamMap + Unpin,
{
    type Output = Result<QueryResult>;

    type IntoFuture = Fetch<'val, SQL, Exe::Future, Exe::Transport, M, CollectCmd>;

    #[inline]
    fn into_future(self) -> Self::IntoFuture {
        self.execute()
    }
}

/// Affected row summary of a completed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryResult {
    pub rows_affected: u64,
}

// ===== Stream Adapters =====

pub struct StreamRow<R>(PhantomData<R>);

pub struct StreamScalar<D>(PhantomData<D>);

impl<R> StreamMap for StreamRow<R>
where
    R: FromRow,
{
    type Output = R;

    #[inline]
    fn map(row: Row) -> Result<Self::Output> {
        R::from_row(row).map_err(Into::into)
    }
}

impl<D> StreamMap for StreamScalar<D>
where
    D: FromColumn,
{
    type Output = D;

    #[inline]
    fn map(row: Row) -> Result<Self::Output> {
        match <(D,)>::from_row(row) {
            Ok(ok) => Ok(ok.0),
            Err(err) => Err(err.into()),
        }
    }
}

// ===== Fetch Adapters =====

/// [`FetchCollect`] adapter used by [`fetch_all`][Query::fetch_all].
#[derive(Debug)]
pub struct CollectAll<R>(pub Vec<R>);

/// [`FetchCollect`] adapter used by [`fetch_one`][Query::fetch_one].
#[derive(Debug)]
pub struct CollectOne<R>(pub Option<R>);

/// [`FetchCollect`] adapter used by [`fetch_optional`][Query::fetch_optional].
#[derive(Debug)]
pub struct CollectOpt<R>(pub Option<R>);

/// [`FetchCollect`] adapter used by [`execute`][Query::execute].
#[derive(Debug)]
pub struct CollectCmd;

impl<R> FetchCollect<R> for CollectAll<R> {
    type Output = Vec<R>;

    #[inline]
    fn value(&mut self, input: R) {
        self.0.push(input);
    }

    #[inline]
    fn finish(&mut self, _: Option<CommandComplete>) -> Result<Self::Output> {
        Ok(std::mem::take(&mut self.0))
    }
}

impl<R> FetchCollect<R> for CollectOpt<R> {
    type Output = Option<R>;

    #[inline]
    fn value(&mut self, input: R) {
        self.0 = Some(input);
    }

    #[inline]
    fn finish(&mut self, _: Option<CommandComplete>) -> Result<Self::Output> {
        Ok(self.0.take())
    }
}

impl<R> FetchCollect<R> for CollectOne<R> {
    type Output = R;

    #[inline]
    fn value(&mut self, input: R) {
        self.0 = Some(input);
    }

    #[inline]
    fn finish(&mut self, _: Option<CommandComplete>) -> Result<Self::Output> {
        match self.0.take() {
            Some(ok) => Ok(ok),
            None => Err(ErrorKind::RowNotFound.into()),
        }
    }
}

impl<R> FetchCollect<R> for CollectCmd {
    type Output = QueryResult;

    #[inline]
    fn value(&mut self, _: R) {}

    #[inline]
    fn finish(&mut self, cmd: Option<CommandComplete>) -> Result<Self::Output> {
        Ok(QueryResult {
            rows_affected: cmd.map(|c| c.rows_affected()).unwrap_or_default(),
        })
    }
}

/// Future driving a [`FetchStream`] to completion through a collector.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Fetch<'val, SQL, ExeFut, IO: PgTransport, M, C> {
    stream: FetchStream<'val, SQL, ExeFut, IO, M>,
    collect: C,
}

impl<'val, SQL, ExeFut, IO: PgTransport, M, C> Fetch<'val, SQL, ExeFut, IO, M, C> {
    fn new(stream: FetchStream<'val, SQL, ExeFut, IO, M>, collect: C) -> Self {
        Self { stream, collect }
    }
}

impl<SQL, ExeFut, IO, M, C> Future for Fetch<'_, SQL, ExeFut, IO, M, C>
where
    SQL: Sql + Unpin,
    ExeFut: Future<Output = Result<IO>> + Unpin,
    IO: PgTransport + Unpin,
    M: StreamMap + Unpin,
    C: FetchCollect<M::Output> + Unpin,
{
    type Output = Result<C::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        loop {
            match ready!(Pin::new(&mut me.stream).poll_next(cx)) {
                Some(Ok(value)) => me.collect.value(value),
                Some(Err(err)) => return Poll::Ready(Err(err)),
                None => break,
            }
        }

        Poll::Ready(me.collect.finish(me.stream.take_command()))
    }
}
