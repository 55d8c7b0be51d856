use super::{batch::BatchOutcome, *};
use crate::{
    connection::QueryMode,
    protocol::pg_type,
    session::{AutoSave, TransactionStatus},
    testing::{self, MockTransport, run},
};

fn int4_text(value: &str) -> (u8, bytes::Bytes) {
    testing::data_row(&[Some(value.as_bytes())])
}

#[test]
fn unnamed_one_shot_select() {
    let mut io = MockTransport::new();
    io.replies([
        testing::parse_complete(),
        testing::bind_complete(),
        testing::row_description(&[("n", pg_type::INT4, 0)]),
        int4_text("7"),
        testing::command_complete("SELECT 1"),
        testing::ready(b'I'),
    ]);

    let rows = run(query_as::<_, _, (i32,)>("SELECT 7", &mut io).fetch_all()).unwrap();
    assert_eq!(rows, vec![(7,)]);

    // Parse, Bind, Describe(portal), Execute, Sync
    assert_eq!(io.sent_tags(), vec![b'P', b'B', b'D', b'E', b'S']);
    assert_eq!(io.parsed_names(), vec![String::new()]);
    io.assert_sync_balanced();
}

#[test]
fn prepare_threshold_names_and_reuses_statement() {
    let mut io = MockTransport::new();
    io.exec.prepare_threshold = 1;

    io.replies([
        testing::parse_complete(),
        testing::param_description(&[]),
        testing::row_description(&[("n", pg_type::INT4, 0)]),
        testing::bind_complete(),
        int4_text("1"),
        testing::command_complete("SELECT 1"),
        testing::ready(b'I'),
    ]);
    run(query_as::<_, _, (i32,)>("SELECT 1", &mut io).fetch_all()).unwrap();

    let first_tags = io.sent_tags();
    assert_eq!(first_tags, vec![b'P', b'D', b'B', b'E', b'S']);
    let name = io.parsed_names().remove(0);
    assert!(!name.is_empty(), "threshold 1 prepares on first use");

    // second execution: cache hit, no Parse, binary results from the
    // receive set
    io.sent.clear();
    io.replies([
        testing::bind_complete(),
        testing::data_row(&[Some(&42i32.to_be_bytes())]),
        testing::command_complete("SELECT 1"),
        testing::ready(b'I'),
    ]);
    let rows = run(query_as::<_, _, (i32,)>("SELECT 1", &mut io).fetch_all()).unwrap();
    assert_eq!(rows, vec![(42,)]);
    assert_eq!(io.sent_tags(), vec![b'B', b'E', b'S']);
    io.assert_sync_balanced();
}

#[test]
fn portal_suspension_streams_all_slabs() {
    let mut io = MockTransport::new();
    io.session.set_autocommit(false);

    // implicit BEGIN unit
    io.replies([
        testing::parse_complete(),
        testing::bind_complete(),
        testing::command_complete("BEGIN"),
        // main statement
        testing::parse_complete(),
        testing::bind_complete(),
        testing::row_description(&[("n", pg_type::INT4, 0)]),
    ]);
    let mut n = 0;
    for slab in [30, 30, 30, 10] {
        for _ in 0..slab {
            n += 1;
            io.reply(int4_text(&n.to_string()));
        }
        if slab == 30 {
            io.reply(testing::portal_suspended());
            io.reply(testing::ready(b'T'));
        } else {
            io.reply(testing::command_complete("SELECT 100"));
            io.reply(testing::ready(b'T'));
        }
    }

    let rows = run(
        query_as::<_, _, (i32,)>("SELECT generate_series(1, 100)", &mut io)
            .fetch_size(30)
            .fetch_all(),
    )
    .unwrap();

    assert_eq!(rows.len(), 100);
    assert_eq!(rows.last(), Some(&(100,)));

    // one Execute for the BEGIN unit, four for the portal slabs
    let executes = io.sent_tags().iter().filter(|t| **t == b'E').count();
    assert_eq!(executes, 5);
    assert_eq!(io.sync_sent, 4);
    assert_eq!(io.session.tx_status(), TransactionStatus::InTransaction);
    io.assert_sync_balanced();
}

#[test]
fn fetch_size_is_ignored_outside_transactions() {
    let mut io = MockTransport::new(); // autocommit on, idle
    io.replies([
        testing::parse_complete(),
        testing::bind_complete(),
        testing::row_description(&[("n", pg_type::INT4, 0)]),
        int4_text("1"),
        testing::command_complete("SELECT 1"),
        testing::ready(b'I'),
    ]);

    run(
        query_as::<_, _, (i32,)>("SELECT n FROM t", &mut io)
            .fetch_size(10)
            .fetch_all(),
    )
    .unwrap();

    // the portal could not survive the Sync boundary, Execute reads all
    let (_, body) = io
        .sent
        .iter()
        .find(|(tag, _)| *tag == b'E')
        .expect("an Execute was sent");
    let max_row = i32::from_be_bytes(body[body.len() - 4..].try_into().unwrap());
    assert_eq!(max_row, 0);
    io.assert_sync_balanced();
}

#[test]
fn fetch_one_does_not_resume_the_portal() {
    let mut io = MockTransport::new();
    io.replies([
        testing::parse_complete(),
        testing::bind_complete(),
        testing::row_description(&[("n", pg_type::INT4, 0)]),
        int4_text("1"),
        testing::portal_suspended(),
        testing::ready(b'I'),
    ]);

    let row = run(query_as::<_, _, (i32,)>("SELECT n FROM t", &mut io).fetch_one()).unwrap();
    assert_eq!(row, (1,));
    // a single Execute, max_row capped
    assert_eq!(io.sent_tags().iter().filter(|t| **t == b'E').count(), 1);
    io.assert_sync_balanced();
}

#[test]
fn batch_reports_counts_up_to_the_failure() {
    let mut io = MockTransport::new();
    io.exec.prepare_threshold = 0; // unnamed

    io.replies([
        testing::parse_complete(),
        testing::bind_complete(),
        testing::command_complete("INSERT 0 1"),
        testing::bind_complete(),
        testing::error_response("23505", "duplicate key value"),
        testing::ready(b'E'),
    ]);

    let report = run(
        batch("INSERT INTO t(a) VALUES (?)", &mut io)
            .bind(1).add()
            .bind(2).add()
            .bind(3).add()
            .run(),
    )
    .unwrap();

    assert_eq!(
        report.outcomes,
        vec![BatchOutcome::Affected(1), BatchOutcome::Failed, BatchOutcome::Failed],
    );
    let err = report.error.expect("middle failure surfaces");
    assert_eq!(err.sql_state().unwrap().as_str(), "23505");
    assert_eq!(io.session.tx_status(), TransactionStatus::InFailedTransaction);
    io.assert_sync_balanced();
}

#[test]
fn autosave_recovers_the_transaction_block() {
    let mut io = MockTransport::new();
    io.session.set_autosave(AutoSave::Conservative);
    io.session.observe_ready(b'T');

    // savepoint unit, then the failing statement
    io.replies([
        testing::parse_complete(),
        testing::bind_complete(),
        testing::command_complete("SAVEPOINT"),
        testing::parse_complete(),
        testing::bind_complete(),
        testing::row_description(&[("v", pg_type::INT4, 0)]),
        testing::error_response("22P02", "invalid input syntax"),
        testing::ready(b'E'),
        // recovery pipeline
        testing::parse_complete(),
        testing::bind_complete(),
        testing::command_complete("ROLLBACK"),
        testing::parse_complete(),
        testing::bind_complete(),
        testing::command_complete("RELEASE"),
        testing::ready(b'T'),
    ]);

    let err = run(query_as::<_, _, (i32,)>("SELECT bad_func()", &mut io).fetch_all())
        .unwrap_err();
    assert_eq!(err.sql_state().unwrap().as_str(), "22P02");

    let recovery = io.parsed_sql();
    assert!(recovery.iter().any(|sql| sql.starts_with("SAVEPOINT")));
    assert!(recovery.iter().any(|sql| sql.starts_with("ROLLBACK TO SAVEPOINT")));
    assert!(recovery.iter().any(|sql| sql.starts_with("RELEASE SAVEPOINT")));
    io.assert_sync_balanced();

    // the block is usable again
    io.sent.clear();
    io.replies([
        testing::parse_complete(),
        testing::bind_complete(),
        testing::command_complete("SAVEPOINT"),
        testing::parse_complete(),
        testing::bind_complete(),
        testing::row_description(&[("n", pg_type::INT4, 0)]),
        int4_text("1"),
        testing::command_complete("SELECT 1"),
        testing::ready(b'T'),
    ]);
    let rows = run(query_as::<_, _, (i32,)>("SELECT 1", &mut io).fetch_all()).unwrap();
    assert_eq!(rows, vec![(1,)]);
    assert_eq!(io.session.tx_status(), TransactionStatus::InTransaction);
    io.assert_sync_balanced();
}

#[test]
fn cached_plan_invalidation_flushes_and_retries() {
    let mut io = MockTransport::new();
    io.exec.prepare_threshold = 1;

    // first execution prepares and caches
    io.replies([
        testing::parse_complete(),
        testing::param_description(&[]),
        testing::row_description(&[("a", pg_type::INT4, 0)]),
        testing::bind_complete(),
        int4_text("1"),
        testing::command_complete("SELECT 1"),
        testing::ready(b'I'),
    ]);
    run(query_as::<_, _, (i32,)>("SELECT * FROM t", &mut io).fetch_all()).unwrap();
    assert_eq!(io.cache.len(), 1);

    // the table changed server side; the cached plan is dead
    io.sent.clear();
    io.replies([
        testing::bind_complete(),
        testing::error_response("0A000", "cached plan must not change result type"),
        testing::ready(b'I'),
        // retry pipeline: DEALLOCATE ALL unit, then a fresh prepare
        testing::parse_complete(),
        testing::bind_complete(),
        testing::command_complete("DEALLOCATE ALL"),
        testing::parse_complete(),
        testing::param_description(&[]),
        testing::row_description(&[("a", pg_type::INT4, 0), ("b", pg_type::INT4, 0)]),
        testing::bind_complete(),
        testing::data_row(&[Some(b"1"), Some(b"2")]),
        testing::command_complete("SELECT 1"),
        testing::ready(b'I'),
    ]);

    let rows = run(query_as::<_, _, (i32, i32)>("SELECT * FROM t", &mut io).fetch_all()).unwrap();
    assert_eq!(rows, vec![(1, 2)]);
    assert!(io.parsed_sql().contains(&"DEALLOCATE ALL".to_string()));
    io.assert_sync_balanced();
}

#[test]
fn utility_statements_suppress_the_implicit_begin() {
    let mut io = MockTransport::new();
    io.session.set_autocommit(false);

    io.replies([
        testing::parse_complete(),
        testing::bind_complete(),
        testing::no_data(),
        testing::command_complete("COMMIT"),
        testing::ready(b'I'),
    ]);
    run(execute("COMMIT", &mut io).execute()).unwrap();

    // exactly one unit, no BEGIN ahead of it
    assert_eq!(io.parsed_sql(), vec!["COMMIT".to_string()]);
    io.assert_sync_balanced();
}

#[test]
fn multi_statement_falls_back_to_simple_query() {
    let mut io = MockTransport::new();
    io.replies([
        testing::row_description(&[("a", pg_type::INT4, 0)]),
        int4_text("1"),
        testing::command_complete("SELECT 1"),
        testing::row_description(&[("b", pg_type::INT4, 0)]),
        int4_text("2"),
        testing::command_complete("SELECT 1"),
        testing::ready(b'I'),
    ]);

    let rows =
        run(query_as::<_, _, (i32,)>("SELECT 1; SELECT 2", &mut io).fetch_all()).unwrap();
    assert_eq!(rows, vec![(1,), (2,)]);
    assert_eq!(io.sent_tags(), vec![b'Q']);
    // a simple Query round trip gets its ReadyForQuery without a Sync
    io.assert_settled();
}

#[test]
fn simple_mode_rejects_bound_parameters() {
    let mut io = MockTransport::new();
    io.exec.query_mode = QueryMode::Simple;

    let err = run(query_as::<_, _, (i32,)>("SELECT $1", &mut io).bind(1).fetch_all())
        .unwrap_err();
    assert!(matches!(err.kind(), crate::ErrorKind::Unsupported(_)));
    assert!(io.sent.is_empty(), "nothing hits the wire");
}

#[test]
fn empty_query_reports_as_error() {
    let mut io = MockTransport::new();
    io.replies([
        testing::parse_complete(),
        testing::bind_complete(),
        testing::no_data(),
        testing::empty_query(),
        testing::ready(b'I'),
    ]);

    let err = run(query_as::<_, _, (i32,)>("", &mut io).fetch_all()).unwrap_err();
    assert!(matches!(err.kind(), crate::ErrorKind::EmptyQuery));
    io.assert_sync_balanced();
}

#[test]
fn statement_error_drains_to_the_boundary() {
    let mut io = MockTransport::new();
    io.replies([
        testing::parse_complete(),
        testing::error_response("42P01", "relation does not exist"),
        testing::ready(b'E'),
    ]);

    let err = run(query_as::<_, _, (i32,)>("SELECT * FROM missing", &mut io).fetch_all())
        .unwrap_err();
    assert_eq!(err.sql_state().unwrap().as_str(), "42P01");
    assert_eq!(io.session.tx_status(), TransactionStatus::InFailedTransaction);
    io.assert_sync_balanced();
}

#[test]
fn notices_accumulate_on_the_warning_chain() {
    let mut io = MockTransport::new();
    io.replies([
        testing::parse_complete(),
        testing::bind_complete(),
        testing::notice("this table is haunted"),
        testing::no_data(),
        testing::command_complete("CREATE TABLE"),
        testing::ready(b'I'),
    ]);

    run(execute("CREATE TABLE t(a int4)", &mut io).execute()).unwrap();
    let warnings = io.session.take_warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].message(), "this table is haunted");
    io.assert_sync_balanced();
}

#[test]
fn evicted_statements_close_on_the_next_pipeline() {
    let mut io = MockTransport::new();
    io.exec.prepare_threshold = 1;
    io.cache = crate::statement::StatementCache::new(
        std::num::NonZeroUsize::new(1).unwrap(),
        usize::MAX,
    );

    for sql in ["SELECT 1", "SELECT 2"] {
        io.replies([
            testing::parse_complete(),
            testing::param_description(&[]),
            testing::row_description(&[("n", pg_type::INT4, 0)]),
            testing::bind_complete(),
            int4_text("1"),
            testing::command_complete("SELECT 1"),
            testing::ready(b'I'),
        ]);
        run(query_as::<_, _, (i32,)>(sql, &mut io).fetch_all()).unwrap();
    }

    // third pipeline carries the Close for the statement evicted by the
    // second
    io.sent.clear();
    io.replies([
        testing::close_complete(),
        testing::parse_complete(),
        testing::param_description(&[]),
        testing::row_description(&[("n", pg_type::INT4, 0)]),
        testing::bind_complete(),
        int4_text("3"),
        testing::command_complete("SELECT 1"),
        testing::ready(b'I'),
    ]);
    run(query_as::<_, _, (i32,)>("SELECT 3", &mut io).fetch_all()).unwrap();
    assert_eq!(io.sent_tags().first(), Some(&b'C'));
    io.assert_sync_balanced();
}

#[test]
fn rewritten_batch_coalesces_inserts() {
    let mut io = MockTransport::new();
    io.exec.rewrite_batched_inserts = true;

    io.replies([
        testing::parse_complete(),
        testing::bind_complete(),
        testing::command_complete("INSERT 0 3"),
        testing::ready(b'I'),
    ]);

    let report = run(
        batch("INSERT INTO t(a) VALUES (?)", &mut io)
            .bind(1).add()
            .bind(2).add()
            .bind(3).add()
            .run(),
    )
    .unwrap();

    assert!(report.error.is_none());
    assert_eq!(report.outcomes, vec![BatchOutcome::SucceededUnknown; 3]);
    assert_eq!(
        io.parsed_sql(),
        vec!["INSERT INTO t(a) VALUES ($1),($2),($3)".to_string()],
    );
    io.assert_sync_balanced();
}

#[test]
fn generated_keys_rewrite_returns_rows() {
    let mut io = MockTransport::new();
    io.replies([
        testing::parse_complete(),
        testing::bind_complete(),
        testing::row_description(&[("id", pg_type::INT4, 0)]),
        int4_text("5"),
        testing::command_complete("INSERT 0 1"),
        testing::ready(b'I'),
    ]);

    let keys = run(
        query_as::<_, _, (i32,)>("INSERT INTO t(a) VALUES (?)", &mut io)
            .bind(1)
            .returning_generated_keys(&["id"])
            .fetch_all(),
    )
    .unwrap();
    assert_eq!(keys, vec![(5,)]);
    assert_eq!(
        io.parsed_sql(),
        vec!["INSERT INTO t(a) VALUES ($1) RETURNING \"id\"".to_string()],
    );
    io.assert_sync_balanced();
}
