//! Transaction and session state tracking.
use std::collections::{HashMap, VecDeque};

use crate::protocol::DbResponse;

/// Backend transaction status, mirroring the byte carried by the most recent
/// `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// `'I'`: idle, not in a transaction block.
    #[default]
    Idle,
    /// `'T'`: in a transaction block.
    InTransaction,
    /// `'E'`: in a failed transaction block; queries are rejected until the
    /// block is ended.
    InFailedTransaction,
}

impl TransactionStatus {
    pub fn from_byte(byte: u8) -> TransactionStatus {
        match byte {
            b'T' => Self::InTransaction,
            b'E' => Self::InFailedTransaction,
            _ => Self::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn in_transaction(&self) -> bool {
        !self.is_idle()
    }
}

/// How `set_read_only` is applied to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadOnlyMode {
    /// Record the flag, enforce nothing.
    Ignore,
    /// Apply at transaction start: `BEGIN READ ONLY`.
    #[default]
    Transaction,
    /// Additionally pin the session:
    /// `SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY`.
    Always,
}

/// Savepoint-around-statement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoSave {
    /// No driver issued savepoints.
    #[default]
    Never,
    /// Savepoint around each in-transaction statement; the failed statement
    /// is only re-executed for cached-plan invalidation.
    Conservative,
    /// Savepoint around each in-transaction statement, retrying the failed
    /// statement whenever the retry policy allows.
    Always,
}

/// Result set holdability over a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Holdability {
    #[default]
    CloseCursorsAtCommit,
    HoldCursorsOverCommit,
}

/// Transaction isolation levels the server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// The level as it appears in `SET TRANSACTION` statements.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Per-connection session state.
///
/// The transaction status only moves when a `ReadyForQuery` arrives; every
/// other mutation happens through SQL routed via the query engine.
#[derive(Debug, Default)]
pub struct SessionState {
    tx_status: TransactionStatus,
    autocommit: bool,
    read_only: bool,
    read_only_mode: ReadOnlyMode,
    autosave: AutoSave,
    holdability: Holdability,
    savepoint_counter: u64,
    /// An engine savepoint is established and not yet released.
    autosave_armed: bool,
    warnings: VecDeque<DbResponse>,
    client_info: HashMap<String, String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self { autocommit: true, ..Default::default() }
    }

    /// Record the indicator byte of a `ReadyForQuery`.
    pub fn observe_ready(&mut self, tx_status: u8) {
        self.tx_status = TransactionStatus::from_byte(tx_status);
    }

    pub fn tx_status(&self) -> TransactionStatus {
        self.tx_status
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn set_autocommit(&mut self, autocommit: bool) {
        self.autocommit = autocommit;
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn read_only_mode(&self) -> ReadOnlyMode {
        self.read_only_mode
    }

    pub fn set_read_only_mode(&mut self, mode: ReadOnlyMode) {
        self.read_only_mode = mode;
    }

    /// The flag the engine consults when opening a transaction block.
    pub fn hint_read_only(&self) -> bool {
        self.read_only && self.read_only_mode != ReadOnlyMode::Ignore
    }

    pub fn autosave(&self) -> AutoSave {
        self.autosave
    }

    pub fn set_autosave(&mut self, autosave: AutoSave) {
        self.autosave = autosave;
    }

    pub fn holdability(&self) -> Holdability {
        self.holdability
    }

    pub fn set_holdability(&mut self, holdability: Holdability) {
        self.holdability = holdability;
    }

    pub fn set_autosave_armed(&mut self, armed: bool) {
        self.autosave_armed = armed;
    }

    /// Whether an engine savepoint is awaiting release, clearing the flag.
    pub fn take_autosave_armed(&mut self) -> bool {
        std::mem::take(&mut self.autosave_armed)
    }

    /// Produce a unique savepoint name from the ever-increasing counter.
    pub fn next_savepoint_name(&mut self) -> String {
        self.savepoint_counter += 1;
        let mut name = String::from("POSTWIRE_SAVEPOINT_");
        name.push_str(itoa::Buffer::new().format(self.savepoint_counter));
        name
    }

    /// Append a `NoticeResponse` to the warning chain.
    pub fn push_warning(&mut self, warning: DbResponse) {
        self.warnings.push_back(warning);
    }

    /// Drain the accumulated warning chain.
    pub fn take_warnings(&mut self) -> Vec<DbResponse> {
        self.warnings.drain(..).collect()
    }

    pub fn client_info(&self) -> &HashMap<String, String> {
        &self.client_info
    }

    pub fn set_client_info(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.client_info.insert(name.into(), value.into());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_mirrors_ready_for_query() {
        let mut s = SessionState::new();
        assert!(s.tx_status().is_idle());
        s.observe_ready(b'T');
        assert_eq!(s.tx_status(), TransactionStatus::InTransaction);
        s.observe_ready(b'E');
        assert_eq!(s.tx_status(), TransactionStatus::InFailedTransaction);
        s.observe_ready(b'I');
        assert!(s.tx_status().is_idle());
    }

    #[test]
    fn savepoint_names_are_unique() {
        let mut s = SessionState::new();
        let a = s.next_savepoint_name();
        let b = s.next_savepoint_name();
        assert_ne!(a, b);
        assert!(a.starts_with("POSTWIRE_SAVEPOINT_"));
    }

    #[test]
    fn isolation_levels_render_as_sql() {
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
    }

    #[test]
    fn read_only_hint_respects_ignore() {
        let mut s = SessionState::new();
        s.set_read_only(true);
        s.set_read_only_mode(ReadOnlyMode::Ignore);
        assert!(!s.hint_read_only());
        s.set_read_only_mode(ReadOnlyMode::Transaction);
        assert!(s.hint_read_only());
    }

    #[test]
    fn warning_chain_accumulates_and_drains() {
        let mut s = SessionState::new();
        s.push_warning(DbResponse::default());
        s.push_warning(DbResponse::default());
        assert_eq!(s.take_warnings().len(), 2);
        assert!(s.take_warnings().is_empty());
    }
}
