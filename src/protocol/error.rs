//! Protocol level errors and the parsed error/notice response record.
use bytes::Bytes;

use crate::ext::BytesExt;

/// An error when translating buffer from postgres
#[derive(Debug)]
pub enum ProtocolError {
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    UnknownAuth { auth: u32 },
    InvalidTxStatus { status: u8 },
}

impl std::error::Error for ProtocolError { }

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unexpected { expect, found, phase } => {
                write!(f, "unexpected backend message {:?}", char::from(*found))?;
                if let Some(expect) = expect {
                    write!(f, ", expected {:?}", char::from(*expect))?;
                }
                if let Some(phase) = phase {
                    write!(f, " in {phase}")?;
                }
                Ok(())
            }
            Self::UnknownAuth { auth } => {
                write!(f, "unknown authentication request ({auth})")
            }
            Self::InvalidTxStatus { status } => {
                write!(f, "invalid transaction status ({:?})", char::from(*status))
            }
        }
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: None }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected { expect: Some(expect), found, phase: None }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: Some(phase) }
    }

    pub(crate) fn unknown_auth(auth: u32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn invalid_tx_status(status: u8) -> ProtocolError {
        Self::InvalidTxStatus { status }
    }
}

/// The five-character SQLSTATE carried by an error response.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SqlState([u8; 5]);

impl SqlState {
    pub const QUERY_CANCELED: SqlState = SqlState(*b"57014");
    pub const FEATURE_NOT_SUPPORTED: SqlState = SqlState(*b"0A000");
    pub const INVALID_AUTHORIZATION_SPECIFICATION: SqlState = SqlState(*b"28000");
    pub const INVALID_PASSWORD: SqlState = SqlState(*b"28P01");
    pub const ACTIVE_SQL_TRANSACTION: SqlState = SqlState(*b"25001");
    pub const NO_ACTIVE_SQL_TRANSACTION: SqlState = SqlState(*b"25P01");
    pub const IN_FAILED_SQL_TRANSACTION: SqlState = SqlState(*b"25P02");
    pub const INVALID_SQL_STATEMENT_NAME: SqlState = SqlState(*b"26000");
    pub const CONNECTION_DOES_NOT_EXIST: SqlState = SqlState(*b"08003");
    pub const CONNECTION_FAILURE: SqlState = SqlState(*b"08006");
    pub const PROTOCOL_VIOLATION: SqlState = SqlState(*b"08P01");
    pub const UNDEFINED_FUNCTION: SqlState = SqlState(*b"42883");

    pub fn new(code: &str) -> Option<SqlState> {
        let bytes = code.as_bytes();
        (bytes.len() == 5).then(|| {
            let mut state = [0u8; 5];
            state.copy_from_slice(bytes);
            SqlState(state)
        })
    }

    pub fn as_str(&self) -> &str {
        // SQLSTATE is ascii by definition
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    /// The two-character class prefix.
    pub fn class(&self) -> &[u8] {
        &self.0[..2]
    }

    /// Class 08: terminal connection errors.
    pub fn is_connection_error(&self) -> bool {
        self.class() == b"08"
    }

    /// Class 28: authentication failures, terminal for the attempt.
    pub fn is_auth_error(&self) -> bool {
        self.class() == b"28"
    }

    /// Class 25: invalid transaction state, non terminal.
    pub fn is_transaction_error(&self) -> bool {
        self.class() == b"25"
    }
}

impl std::fmt::Display for SqlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for SqlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SqlState({})", self.as_str())
    }
}

/// The parsed body shared by `ErrorResponse` and `NoticeResponse`: a mapping
/// from field code to string.
///
/// Unrecognized field codes are retained; frontends should silently ignore
/// fields of unrecognized type.
#[derive(Debug, Clone, Default)]
pub struct DbResponse {
    fields: Vec<(u8, String)>,
}

impl DbResponse {
    /// Parse the `Byte1` + `String` field list, terminated by a zero byte.
    pub fn parse(mut body: Bytes) -> Self {
        let mut fields = Vec::new();
        loop {
            if body.is_empty() {
                break;
            }
            let code = body.split_to(1)[0];
            if code == 0 {
                break;
            }
            fields.push((code, body.get_nul_string()));
        }
        Self { fields }
    }

    /// Look up a field by its code.
    pub fn field(&self, code: u8) -> Option<&str> {
        self.fields
            .iter()
            .find_map(|(c, v)| (*c == code).then_some(v.as_str()))
    }

    /// `S` field: ERROR, FATAL, PANIC, WARNING, NOTICE, ..
    pub fn severity(&self) -> &str {
        self.field(b'S').unwrap_or_default()
    }

    /// `C` field: the SQLSTATE code.
    pub fn code(&self) -> Option<SqlState> {
        SqlState::new(self.field(b'C')?)
    }

    /// `M` field: the primary human-readable message.
    pub fn message(&self) -> &str {
        self.field(b'M').unwrap_or_default()
    }

    /// `D` field: secondary message with more detail.
    pub fn detail(&self) -> Option<&str> {
        self.field(b'D')
    }

    /// `H` field: suggestion what to do about the problem.
    pub fn hint(&self) -> Option<&str> {
        self.field(b'H')
    }

    /// `P` field: 1-indexed character position into the query string.
    pub fn position(&self) -> Option<u32> {
        self.field(b'P')?.parse().ok()
    }

    /// `W` field: context in which the error occurred.
    pub fn where_context(&self) -> Option<&str> {
        self.field(b'W')
    }

    /// `R` field: the source-code routine reporting the error.
    pub fn routine(&self) -> Option<&str> {
        self.field(b'R')
    }

    /// `FATAL` or `PANIC` severity terminates the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity(), "FATAL" | "PANIC")
    }

    /// Whether this error means a cached plan can no longer be used and the
    /// statement cache must be flushed.
    ///
    /// Only class `0A000` qualifies; the message text alone is not trusted,
    /// a user-raised error may contain the same words.
    pub fn invalidates_cached_plan(&self) -> bool {
        matches!(self.code(), Some(code) if code == SqlState::FEATURE_NOT_SUPPORTED)
            && (self.routine() == Some("RevalidateCachedQuery")
                || self.message().contains("cached plan must not change result type"))
    }
}

impl std::fmt::Display for DbResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.severity(), self.message())?;
        if let Some(code) = self.code() {
            write!(f, " ({code})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ext::BufMutExt;
    use bytes::{BufMut, BytesMut};

    fn response(fields: &[(u8, &str)]) -> DbResponse {
        let mut buf = BytesMut::new();
        for (code, value) in fields {
            buf.put_u8(*code);
            buf.put_nul_string(value);
        }
        buf.put_u8(0);
        DbResponse::parse(buf.freeze())
    }

    #[test]
    fn parse_error_fields() {
        let r = response(&[
            (b'S', "ERROR"),
            (b'C', "23505"),
            (b'M', "duplicate key value"),
            (b'D', "Key (id)=(1) already exists."),
        ]);
        assert_eq!(r.severity(), "ERROR");
        assert_eq!(r.code().unwrap().as_str(), "23505");
        assert_eq!(r.message(), "duplicate key value");
        assert_eq!(r.detail(), Some("Key (id)=(1) already exists."));
        assert_eq!(r.hint(), None);
    }

    #[test]
    fn sqlstate_classes() {
        assert!(SqlState::CONNECTION_FAILURE.is_connection_error());
        assert!(SqlState::INVALID_PASSWORD.is_auth_error());
        assert!(SqlState::IN_FAILED_SQL_TRANSACTION.is_transaction_error());
        assert!(!SqlState::QUERY_CANCELED.is_connection_error());
    }

    #[test]
    fn cached_plan_invalidation_detected() {
        let r = response(&[
            (b'S', "ERROR"),
            (b'C', "0A000"),
            (b'M', "cached plan must not change result type"),
        ]);
        assert!(r.invalidates_cached_plan());

        let by_routine = response(&[
            (b'S', "ERROR"),
            (b'C', "0A000"),
            (b'M', "localized text"),
            (b'R', "RevalidateCachedQuery"),
        ]);
        assert!(by_routine.invalidates_cached_plan());

        let other = response(&[(b'S', "ERROR"), (b'C', "0A000"), (b'M', "not supported")]);
        assert!(!other.invalidates_cached_plan());
    }

    #[test]
    fn matching_message_without_0a000_does_not_invalidate() {
        // a user-raised error can carry the same words; only the
        // feature_not_supported class flushes the cache
        let r = response(&[
            (b'S', "ERROR"),
            (b'C', "P0001"),
            (b'M', "cached plan must not change result type"),
        ]);
        assert!(!r.invalidates_cached_plan());

        let check = response(&[
            (b'S', "ERROR"),
            (b'C', "23514"),
            (b'M', "check violated: cached plan must not change result type"),
        ]);
        assert!(!check.invalidates_cached_plan());
    }

    #[test]
    fn unknown_fields_are_ignored_gracefully() {
        let r = response(&[(b'S', "NOTICE"), (b'Z', "future field"), (b'M', "hello")]);
        assert_eq!(r.message(), "hello");
        assert_eq!(r.field(b'Z'), Some("future field"));
    }
}
