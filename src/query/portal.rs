//! Explicitly driven server side cursors.
//!
//! [`Portal`] gives the caller slab-by-slab control over a result set:
//! every [`fetch`][Portal::fetch] runs one `Execute(portal, n)` round trip,
//! returning control after `PortalSuspended`, and [`close`][Portal::close]
//! abandons the cursor early. The implicit alternative is
//! [`Query::fetch_size`][super::Query::fetch_size], which resumes the
//! portal transparently while streaming.
use std::sync::Arc;

use crate::{
    Result,
    encode::Encoded,
    error::ErrorKind,
    protocol::{
        BackendMessage, PgFormat,
        backend::{self, FieldDescription},
        frontend,
    },
    row::Row,
    sql::{ParsedSql, Sql},
    statement::PortalName,
    transport::{PgTransport, PgTransportExt},
};

/// A named server side cursor bound to a statement and parameter vector.
///
/// Lives until [`close`][Portal::close] or the end of the enclosing
/// transaction.
#[must_use = "a bound portal holds server state until closed"]
#[derive(Debug)]
pub struct Portal<IO> {
    io: IO,
    name: PortalName,
    fields: Arc<Vec<FieldDescription>>,
    fetch_size: u32,
    exhausted: bool,
}

/// One slab of rows pulled from a portal.
#[derive(Debug)]
pub struct Fetched {
    pub rows: Vec<Row>,
    /// `false` after `PortalSuspended`: more rows remain.
    pub complete: bool,
}

impl<IO: PgTransport> Portal<IO> {
    /// Parse and bind a cursor for `sql`.
    ///
    /// Fails with [`ErrorKind::InvalidTransactionState`] outside a
    /// transaction block: the portal would not survive the Sync boundary.
    pub async fn bind(
        sql: impl Sql,
        params: Vec<Encoded<'_>>,
        fetch_size: u32,
        mut io: IO,
    ) -> Result<Portal<IO>> {
        if !io.session().tx_status().in_transaction() {
            return Err(ErrorKind::InvalidTransactionState(
                "server cursors require an open transaction block",
            )
            .into());
        }

        let parsed = ParsedSql::parse(sql.sql(), io.sql_options());
        if !parsed.is_single() {
            return Err(ErrorKind::Unsupported(
                "a portal binds exactly one statement".into(),
            )
            .into());
        }
        let sub = parsed.subqueries.into_iter().next().expect("scanner yields one");

        let name = PortalName::next();
        match bind_inner(&mut io, &sub.sql, &params, &name).await {
            Ok(fields) => Ok(Portal {
                io,
                name,
                fields,
                fetch_size: fetch_size.max(1),
                exhausted: false,
            }),
            Err(err) => {
                if !err.is_terminal() {
                    io.ready_request();
                }
                Err(err)
            }
        }
    }

    /// The column descriptors of the bound statement.
    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    /// Whether the cursor ran to completion.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Pull the next slab of at most `fetch_size` rows.
    pub async fn fetch(&mut self) -> Result<Fetched> {
        if self.exhausted {
            return Ok(Fetched { rows: Vec::new(), complete: true });
        }

        self.io.send(frontend::Execute {
            portal_name: self.name.as_str(),
            max_row: self.fetch_size as i32,
        });
        self.io.send(frontend::Sync);

        let mut rows = Vec::new();
        let mut complete = false;
        loop {
            let message = match self.io.recv::<BackendMessage>().await {
                Ok(message) => message,
                Err(err) => {
                    if !err.is_terminal() {
                        self.io.ready_request();
                    }
                    self.exhausted = true;
                    return Err(err);
                }
            };
            match message {
                BackendMessage::DataRow(row) => {
                    rows.push(Row::new(self.fields.clone(), row.body));
                }
                BackendMessage::PortalSuspended(_) => {}
                BackendMessage::CommandComplete(_) | BackendMessage::EmptyQueryResponse(_) => {
                    complete = true;
                }
                BackendMessage::ReadyForQuery(_) => break,
                f => {
                    self.io.ready_request();
                    self.exhausted = true;
                    return Err(f.unexpected("portal fetch").into());
                }
            }
        }

        self.exhausted = complete;
        Ok(Fetched { rows, complete })
    }

    /// Close the cursor, releasing the server state, and give the transport
    /// back.
    pub async fn close(mut self) -> Result<IO> {
        if !self.exhausted {
            self.io.send(frontend::Close { variant: b'P', name: self.name.as_str() });
            self.io.send(frontend::Sync);
            self.io.recv::<backend::CloseComplete>().await?;
            self.io.recv::<backend::ReadyForQuery>().await?;
        }
        Ok(self.io)
    }
}

async fn bind_inner<IO: PgTransport>(
    io: &mut IO,
    sql: &str,
    params: &[Encoded<'_>],
    name: &PortalName,
) -> Result<Arc<Vec<FieldDescription>>> {
    let formats: Vec<PgFormat> = {
        let binary = io.binary();
        params
            .iter()
            .map(|p| {
                if p.oid() != 0 && binary.use_binary_for_send(p.oid()) {
                    PgFormat::Binary
                } else {
                    PgFormat::Text
                }
            })
            .collect()
    };

    io.send(frontend::Parse {
        prepare_name: "",
        sql,
        oids_len: params.len() as i16,
        oids: params.iter().map(|p| p.oid()),
    });
    io.send(frontend::Bind {
        portal_name: name.as_str(),
        stmt_name: "",
        param_formats: &formats,
        params,
        result_formats: &[],
    });
    io.send(frontend::Describe { kind: b'P', name: name.as_str() });
    io.send(frontend::Sync);

    io.recv::<backend::ParseComplete>().await?;
    io.recv::<backend::BindComplete>().await?;
    let fields = match io.recv::<BackendMessage>().await? {
        BackendMessage::RowDescription(rd) => Arc::new(rd.fields()),
        BackendMessage::NoData(_) => Arc::new(Vec::new()),
        f => return Err(f.unexpected("portal describe").into()),
    };
    io.recv::<backend::ReadyForQuery>().await?;
    Ok(fields)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        protocol::pg_type,
        testing::{self, MockTransport, run},
    };
    use std::pin::pin;

    #[test]
    fn slab_by_slab_cursor() {
        let mut io = MockTransport::new();
        io.session.observe_ready(b'T');
        io.replies([
            testing::parse_complete(),
            testing::bind_complete(),
            testing::row_description(&[("n", pg_type::INT4, 0)]),
            testing::ready(b'T'),
        ]);

        let mut portal = run(pin!(Portal::bind("SELECT n FROM t", Vec::new(), 2, &mut io)))
            .unwrap();
        assert_eq!(portal.fields().len(), 1);

        portal.io.replies([
            testing::data_row(&[Some(b"1")]),
            testing::data_row(&[Some(b"2")]),
            testing::portal_suspended(),
            testing::ready(b'T'),
        ]);
        let slab = run(pin!(portal.fetch())).unwrap();
        assert_eq!(slab.rows.len(), 2);
        assert!(!slab.complete);

        portal.io.replies([
            testing::data_row(&[Some(b"3")]),
            testing::command_complete("SELECT 3"),
            testing::ready(b'T'),
        ]);
        let slab = run(pin!(portal.fetch())).unwrap();
        assert_eq!(slab.rows.len(), 1);
        assert!(slab.complete);
        assert!(portal.is_exhausted());

        // exhausted portals close without another round trip
        let io = run(pin!(portal.close())).unwrap();
        io.assert_settled();
    }

    #[test]
    fn cursor_requires_a_transaction() {
        let mut io = MockTransport::new();
        let err = run(pin!(Portal::bind("SELECT 1", Vec::new(), 10, &mut io))).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::ErrorKind::InvalidTransactionState(_),
        ));
    }

    #[test]
    fn early_close_sends_close_portal() {
        let mut io = MockTransport::new();
        io.session.observe_ready(b'T');
        io.replies([
            testing::parse_complete(),
            testing::bind_complete(),
            testing::row_description(&[("n", pg_type::INT4, 0)]),
            testing::ready(b'T'),
        ]);
        let mut portal = run(pin!(Portal::bind("SELECT n FROM t", Vec::new(), 2, &mut io)))
            .unwrap();

        portal.io.replies([testing::close_complete(), testing::ready(b'T')]);
        let io = run(pin!(portal.close())).unwrap();
        assert_eq!(io.sent_tags().last(), Some(&b'S'));
        assert!(io.sent_tags().contains(&b'C'));
        io.assert_settled();
    }
}
