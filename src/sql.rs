//! Minimal sql scanning.
//!
//! The driver never parses sql; it only scans enough to recognize statement
//! boundaries (top level `;`), parameter placeholders (`?` rewritten to `$n`,
//! native `$n` counted), the leading command word, and `RETURNING` clauses.
//! Quoting rules follow the server: single quotes (with `E''` escapes and the
//! `standard_conforming_strings` setting), double quoted identifiers, dollar
//! quoting, line and nested block comments.
use std::ops::Range;

/// Type that represent sql string.
pub trait Sql {
    /// Returns sql string.
    fn sql(&self) -> &str;

    /// Return `true` if current statement should be cached.
    fn persistent(&self) -> bool;
}

impl Sql for &str {
    fn sql(&self) -> &str {
        self
    }

    fn persistent(&self) -> bool {
        true
    }
}

impl Sql for String {
    fn sql(&self) -> &str {
        self
    }

    fn persistent(&self) -> bool {
        true
    }
}

/// Non persistent query string.
#[derive(Debug)]
pub struct SqlOnce<'sql>(&'sql str);

impl Sql for SqlOnce<'_> {
    fn sql(&self) -> &str {
        self.0
    }

    fn persistent(&self) -> bool {
        false
    }
}

/// Extension trait for easier query persistence config.
pub trait SqlExt<'a> {
    /// Disable statement caching.
    fn once(self) -> SqlOnce<'a>;
}

impl<'a> SqlExt<'a> for &'a str {
    fn once(self) -> SqlOnce<'a> {
        SqlOnce(self)
    }
}

impl<'a> SqlExt<'a> for SqlOnce<'a> {
    fn once(self) -> SqlOnce<'a> {
        self
    }
}

/// Scanner settings mirroring server side quoting behavior.
#[derive(Debug, Clone, Copy)]
pub struct SqlOptions {
    /// When off, a backslash inside a plain `'..'` string is an escape.
    pub standard_conforming_strings: bool,
}

impl Default for SqlOptions {
    fn default() -> Self {
        Self { standard_conforming_strings: true }
    }
}

/// The recognized leading command of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Ddl,
    /// Transaction and session control: `BEGIN`, `COMMIT`, `SET`, `SHOW`,
    /// `SAVEPOINT`, `DEALLOCATE`, .. Executed with suppress-begin.
    Utility,
    Other,
}

impl StatementKind {
    fn from_word(word: &str) -> StatementKind {
        if word.eq_ignore_ascii_case("select") || word.eq_ignore_ascii_case("with") {
            Self::Select
        } else if word.eq_ignore_ascii_case("insert") {
            Self::Insert
        } else if word.eq_ignore_ascii_case("update") {
            Self::Update
        } else if word.eq_ignore_ascii_case("delete") {
            Self::Delete
        } else if word.eq_ignore_ascii_case("merge") {
            Self::Merge
        } else if ["create", "alter", "drop", "truncate", "grant", "revoke", "comment", "vacuum", "analyze", "reindex"]
            .iter()
            .any(|k| word.eq_ignore_ascii_case(k))
        {
            Self::Ddl
        } else if ["begin", "start", "commit", "end", "rollback", "abort", "savepoint", "release", "set", "reset", "show", "deallocate", "discard", "listen", "unlisten", "notify"]
            .iter()
            .any(|k| word.eq_ignore_ascii_case(k))
        {
            Self::Utility
        } else {
            Self::Other
        }
    }

    /// Statements that may carry a `RETURNING` clause.
    pub fn supports_returning(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete | Self::Merge)
    }

    /// Statements executed without an implicit transaction start.
    pub fn suppress_begin(&self) -> bool {
        matches!(self, Self::Utility)
    }
}

/// One statement of a client query, in native form.
#[derive(Debug)]
pub struct SubQuery {
    /// The sql as sent to the server, `?` placeholders rewritten to `$n`.
    pub sql: String,
    /// Number of parameters the statement binds.
    pub param_count: u16,
    /// The recognized command word.
    pub kind: StatementKind,
    /// Whether a top level `RETURNING` clause is present.
    pub returning: bool,
    /// Byte range of the single parenthesized `VALUES (..)` group within
    /// `sql`, when the statement is a rewritable insert.
    pub values: Option<Range<usize>>,
}

impl SubQuery {
    /// Append `RETURNING *` or a quoted column list when the statement can
    /// return generated keys and does not already.
    pub fn with_returning(&self, columns: &[&str]) -> String {
        if self.returning || !self.kind.supports_returning() {
            return self.sql.clone();
        }
        let mut sql = self.sql.trim_end().trim_end_matches(';').to_string();
        sql.push_str(" RETURNING ");
        if columns.is_empty() {
            sql.push('*');
        } else {
            for (i, col) in columns.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(&quote_identifier(col));
            }
        }
        sql
    }

    /// Coalesce `batch_len` executions of an `INSERT .. VALUES (..)` into a
    /// single multi row insert, renumbering placeholders.
    ///
    /// Returns `None` when the statement shape does not allow the rewrite:
    /// not an insert, no single values group, zero parameters, or a
    /// `RETURNING` clause whose generated keys set would change.
    pub fn rewrite_batched_insert(&self, batch_len: usize) -> Option<String> {
        if self.kind != StatementKind::Insert || self.returning || batch_len < 2 {
            return None;
        }
        let values = self.values.clone()?;
        if self.param_count == 0 {
            return None;
        }

        let group = &self.sql[values.clone()];
        let mut sql = String::with_capacity(self.sql.len() + group.len() * batch_len);
        sql.push_str(&self.sql[..values.start]);

        for i in 0..batch_len {
            if i > 0 {
                sql.push(',');
            }
            // renumber $k to its flattened position in row i
            let mut chars = group.chars().peekable();
            while let Some(ch) = chars.next() {
                if ch != '$' {
                    sql.push(ch);
                    continue;
                }
                let mut k = 0u32;
                let mut any = false;
                while let Some(d) = chars.peek().and_then(|d| d.to_digit(10)) {
                    k = k * 10 + d;
                    any = true;
                    chars.next();
                }
                if !any {
                    sql.push('$');
                    continue;
                }
                sql.push('$');
                sql.push_str(
                    itoa::Buffer::new().format(i as u32 * self.param_count as u32 + k),
                );
            }
        }
        sql.push_str(&self.sql[values.end..]);
        Some(sql)
    }
}

/// A client sql string decomposed into statements.
#[derive(Debug)]
pub struct ParsedSql {
    pub subqueries: Vec<SubQuery>,
}

impl ParsedSql {
    /// Scan `sql` under the given quoting options.
    pub fn parse(sql: &str, options: SqlOptions) -> ParsedSql {
        Scanner::new(sql, options).run()
    }

    /// Whether the whole query is a single statement.
    pub fn is_single(&self) -> bool {
        self.subqueries.len() == 1
    }

    /// Whether the extended protocol can run this query: a single
    /// non-empty statement.
    pub fn can_use_extended(&self) -> bool {
        self.is_single()
    }
}

/// Escape an identifier by double quoting.
pub fn quote_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for ch in name.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

struct Scanner<'a> {
    sql: &'a str,
    bytes: &'a [u8],
    pos: usize,
    options: SqlOptions,

    out: String,
    placeholders: u16,
    max_dollar: u16,
    depth: u32,
    first_word: Option<StatementKind>,
    returning: bool,
    values: ValuesSpan,
    subqueries: Vec<SubQuery>,
}

/// Tracking of the insert `VALUES (..)` group.
#[derive(Debug, PartialEq)]
enum ValuesSpan {
    Pending,
    /// `VALUES` keyword seen, waiting for the opening parenthesis.
    Keyword,
    Open { start: usize, depth: u32 },
    Found(Range<usize>),
    /// Multiple groups or trailing structure the rewrite cannot handle.
    Unsupported,
}

impl<'a> Scanner<'a> {
    fn new(sql: &'a str, options: SqlOptions) -> Self {
        Self {
            sql,
            bytes: sql.as_bytes(),
            pos: 0,
            options,
            out: String::new(),
            placeholders: 0,
            max_dollar: 0,
            depth: 0,
            first_word: None,
            returning: false,
            values: ValuesSpan::Pending,
            subqueries: Vec::new(),
        }
    }

    fn run(mut self) -> ParsedSql {
        while self.pos < self.bytes.len() {
            let byte = self.bytes[self.pos];
            match byte {
                b'\'' => self.single_quote(false),
                b'"' => self.double_quote(),
                b'-' if self.peek(1) == Some(b'-') => self.line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.block_comment(),
                b'$' => self.dollar(),
                b'?' => self.placeholder(),
                b'(' => {
                    self.depth += 1;
                    match self.values {
                        ValuesSpan::Keyword => {
                            self.values =
                                ValuesSpan::Open { start: self.out.len(), depth: self.depth };
                        }
                        // a second top level group, e.g. `VALUES (..),(..)`
                        ValuesSpan::Found(_) => self.values = ValuesSpan::Unsupported,
                        _ => {}
                    }
                    self.push_byte();
                }
                b')' => {
                    let closing = self.depth;
                    self.depth = self.depth.saturating_sub(1);
                    self.push_byte();
                    if let ValuesSpan::Open { start, depth } = self.values {
                        if depth == closing {
                            self.values = ValuesSpan::Found(start..self.out.len());
                        }
                    }
                }
                b';' if self.depth == 0 => {
                    self.pos += 1;
                    self.finish_subquery();
                }
                b'e' | b'E'
                    if self.peek(1) == Some(b'\'') && !self.prev_is_identifier() =>
                {
                    self.push_byte(); // the E
                    self.single_quote(true)
                }
                _ if byte.is_ascii_alphabetic() || byte == b'_' => self.word(),
                _ => self.push_byte(),
            }
        }

        if !self.out.trim().is_empty() || self.subqueries.is_empty() {
            self.finish_subquery();
        }

        ParsedSql { subqueries: self.subqueries }
    }

    fn finish_subquery(&mut self) {
        let raw = std::mem::take(&mut self.out);
        let leading = raw.len() - raw.trim_start().len();
        let sql = raw.trim().to_string();
        if sql.is_empty() && !self.subqueries.is_empty() {
            return;
        }
        let values = match std::mem::replace(&mut self.values, ValuesSpan::Pending) {
            ValuesSpan::Found(range) if range.start >= leading => {
                Some(range.start - leading..range.end - leading)
            }
            _ => None,
        };
        self.subqueries.push(SubQuery {
            sql,
            param_count: self.placeholders.max(self.max_dollar),
            kind: self.first_word.take().unwrap_or(StatementKind::Other),
            returning: std::mem::take(&mut self.returning),
            values,
        });
        self.placeholders = 0;
        self.max_dollar = 0;
        self.depth = 0;
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn prev_is_identifier(&self) -> bool {
        self.out
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    fn push_byte(&mut self) {
        // multi-byte utf8 sequences are pushed byte-wise via char boundary
        let ch_len = utf8_len(self.bytes[self.pos]);
        self.out.push_str(&self.sql[self.pos..self.pos + ch_len]);
        self.pos += ch_len;
    }

    fn single_quote(&mut self, escape_string: bool) {
        let backslash_escapes = escape_string || !self.options.standard_conforming_strings;
        self.push_byte(); // opening quote
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\\' if backslash_escapes => {
                    self.push_byte();
                    if self.pos < self.bytes.len() {
                        self.push_byte();
                    }
                }
                b'\'' => {
                    self.push_byte();
                    // doubled quote stays inside the string
                    if self.peek(0) == Some(b'\'') {
                        self.push_byte();
                        continue;
                    }
                    return;
                }
                _ => self.push_byte(),
            }
        }
    }

    fn double_quote(&mut self) {
        self.push_byte();
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'"' => {
                    self.push_byte();
                    if self.peek(0) == Some(b'"') {
                        self.push_byte();
                        continue;
                    }
                    return;
                }
                _ => self.push_byte(),
            }
        }
    }

    fn line_comment(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
            self.push_byte();
        }
    }

    fn block_comment(&mut self) {
        let mut depth = 0u32;
        while self.pos < self.bytes.len() {
            if self.bytes[self.pos] == b'/' && self.peek(1) == Some(b'*') {
                depth += 1;
                self.push_byte();
                self.push_byte();
            } else if self.bytes[self.pos] == b'*' && self.peek(1) == Some(b'/') {
                self.push_byte();
                self.push_byte();
                depth -= 1;
                if depth == 0 {
                    return;
                }
            } else {
                self.push_byte();
            }
        }
    }

    fn dollar(&mut self) {
        // $n placeholder
        if self.peek(1).is_some_and(|b| b.is_ascii_digit()) {
            self.push_byte(); // $
            let mut n = 0u16;
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                n = n
                    .saturating_mul(10)
                    .saturating_add((self.bytes[self.pos] - b'0') as u16);
                self.push_byte();
            }
            self.max_dollar = self.max_dollar.max(n);
            return;
        }

        // $tag$ .. $tag$ quoting
        let tag_start = self.pos + 1;
        let mut tag_end = tag_start;
        while tag_end < self.bytes.len()
            && (self.bytes[tag_end].is_ascii_alphanumeric() || self.bytes[tag_end] == b'_')
        {
            tag_end += 1;
        }
        if self.bytes.get(tag_end) != Some(&b'$') {
            self.push_byte(); // lone dollar
            return;
        }

        let closing = format!("${}$", &self.sql[tag_start..tag_end]);
        let body_start = tag_end + 1;
        let end = self.sql[body_start..]
            .find(&closing)
            .map(|i| body_start + i + closing.len())
            .unwrap_or(self.bytes.len());
        self.out.push_str(&self.sql[self.pos..end]);
        self.pos = end;
    }

    fn placeholder(&mut self) {
        self.placeholders += 1;
        self.out.push('$');
        self.out
            .push_str(itoa::Buffer::new().format(self.placeholders));
        self.pos += 1;
    }

    fn word(&mut self) {
        let start = self.pos;
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        let word = &self.sql[start..self.pos];
        self.out.push_str(word);

        if self.first_word.is_none() {
            self.first_word = Some(StatementKind::from_word(word));
        } else if self.depth == 0 && word.eq_ignore_ascii_case("returning") {
            self.returning = true;
        } else if self.depth == 0 && word.eq_ignore_ascii_case("values") {
            match self.values {
                ValuesSpan::Pending if self.first_word == Some(StatementKind::Insert) => {
                    self.values = ValuesSpan::Keyword;
                }
                ValuesSpan::Found(_) | ValuesSpan::Keyword | ValuesSpan::Open { .. } => {
                    self.values = ValuesSpan::Unsupported;
                }
                _ => {}
            }
        } else if self.depth == 0 {
            if let ValuesSpan::Found(_) = self.values {
                // structure after the group, e.g. ON CONFLICT
                self.values = ValuesSpan::Unsupported;
            }
        }
    }
}

fn utf8_len(byte: u8) -> usize {
    match byte {
        b if b < 0x80 => 1,
        b if b & 0xE0 == 0xC0 => 2,
        b if b & 0xF0 == 0xE0 => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(sql: &str) -> ParsedSql {
        ParsedSql::parse(sql, SqlOptions::default())
    }

    #[test]
    fn rewrites_question_marks() {
        let q = parse("SELECT * FROM t WHERE a = ? AND b = ?");
        assert!(q.is_single());
        assert_eq!(q.subqueries[0].sql, "SELECT * FROM t WHERE a = $1 AND b = $2");
        assert_eq!(q.subqueries[0].param_count, 2);
        assert_eq!(q.subqueries[0].kind, StatementKind::Select);
    }

    #[test]
    fn native_placeholders_are_counted() {
        let q = parse("SELECT $2, $1");
        assert_eq!(q.subqueries[0].param_count, 2);
        assert_eq!(q.subqueries[0].sql, "SELECT $2, $1");
    }

    #[test]
    fn question_mark_in_string_is_kept() {
        let q = parse("SELECT 'a?b', \"col?\" FROM t WHERE x = ?");
        assert_eq!(q.subqueries[0].sql, "SELECT 'a?b', \"col?\" FROM t WHERE x = $1");
        assert_eq!(q.subqueries[0].param_count, 1);
    }

    #[test]
    fn dollar_quote_hides_everything() {
        let q = parse("SELECT $fn$ ? ; ' $fn$ FROM t");
        assert!(q.is_single());
        assert_eq!(q.subqueries[0].param_count, 0);
    }

    #[test]
    fn splits_on_top_level_semicolon() {
        let q = parse("SELECT 1; UPDATE t SET a = ?; COMMIT");
        assert_eq!(q.subqueries.len(), 3);
        assert_eq!(q.subqueries[0].kind, StatementKind::Select);
        assert_eq!(q.subqueries[1].kind, StatementKind::Update);
        assert_eq!(q.subqueries[1].sql, "UPDATE t SET a = $1");
        assert_eq!(q.subqueries[2].kind, StatementKind::Utility);
        assert!(q.subqueries[2].kind.suppress_begin());
    }

    #[test]
    fn semicolon_in_begin_end_body() {
        let q = parse("SELECT (SELECT 1; )");
        // parenthesized `;` does not split
        assert_eq!(q.subqueries.len(), 1);
    }

    #[test]
    fn comments_do_not_split_or_bind() {
        let q = parse("SELECT 1 -- ? ;\n, 2 /* ? ; /* nested ? */ */ , ?");
        assert!(q.is_single());
        assert_eq!(q.subqueries[0].param_count, 1);
    }

    #[test]
    fn detects_returning() {
        let q = parse("INSERT INTO t(a) VALUES (?) RETURNING id");
        assert!(q.subqueries[0].returning);
        let q = parse("UPDATE t SET returning_ = 1");
        assert!(!q.subqueries[0].returning);
    }

    #[test]
    fn escape_string_backslash() {
        // E'\'' is a single-quote character, the string does not end at \'
        let q = parse(r"SELECT E'a\'?b', ?");
        assert_eq!(q.subqueries[0].param_count, 1);
    }

    #[test]
    fn non_conforming_strings_backslash() {
        let opts = SqlOptions { standard_conforming_strings: false };
        let q = ParsedSql::parse(r"SELECT 'a\'?', ?", opts);
        assert_eq!(q.subqueries[0].param_count, 1);
    }

    #[test]
    fn empty_query() {
        let q = parse("");
        assert_eq!(q.subqueries.len(), 1);
        assert!(q.subqueries[0].sql.is_empty());
    }

    #[test]
    fn with_returning_appends_and_quotes() {
        let q = parse("INSERT INTO t(a) VALUES (?)");
        let sub = &q.subqueries[0];
        assert_eq!(sub.with_returning(&[]), "INSERT INTO t(a) VALUES ($1) RETURNING *");
        assert_eq!(
            sub.with_returning(&["id", "weird\"col"]),
            "INSERT INTO t(a) VALUES ($1) RETURNING \"id\", \"weird\"\"col\"",
        );

        let q = parse("INSERT INTO t(a) VALUES (?) RETURNING id");
        assert_eq!(q.subqueries[0].with_returning(&[]), q.subqueries[0].sql);
    }

    #[test]
    fn quoting_identifiers() {
        assert_eq!(quote_identifier("sp1"), "\"sp1\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn batched_insert_rewrite() {
        let q = parse("INSERT INTO t(a, b) VALUES (?, ?)");
        let sub = &q.subqueries[0];
        assert_eq!(sub.values.as_ref().map(|r| &sub.sql[r.clone()]), Some("($1, $2)"));
        let rewritten = sub.rewrite_batched_insert(3).unwrap();
        assert_eq!(
            rewritten,
            "INSERT INTO t(a, b) VALUES ($1, $2),($3, $4),($5, $6)",
        );
    }

    #[test]
    fn batched_rewrite_refused_for_returning() {
        let q = parse("INSERT INTO t(a) VALUES (?) RETURNING id");
        assert!(q.subqueries[0].rewrite_batched_insert(2).is_none());
    }

    #[test]
    fn batched_rewrite_refused_for_on_conflict() {
        let q = parse("INSERT INTO t(a) VALUES (?) ON CONFLICT DO NOTHING");
        assert!(q.subqueries[0].rewrite_batched_insert(2).is_none());
    }
}
