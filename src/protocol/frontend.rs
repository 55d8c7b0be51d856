//! Postgres Frontend Messages
//!
//! All struct fields here mirror the actual message sent to postgres.
use bytes::{BufMut, BytesMut};

use super::PgFormat;
use crate::{
    encode::Encoded,
    ext::{BufMutExt, StrExt, UsizeExt},
};

/// The protocol version number: major 3, minor 0.
pub const PROTOCOL_VERSION: i32 = 196608;

/// Special "message length" code requesting query cancellation.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
/// Special "message length" code requesting a TLS upgrade.
pub const SSL_REQUEST_CODE: i32 = 80877103;
/// Special "message length" code requesting GSSAPI encryption.
pub const GSS_ENC_REQUEST_CODE: i32 = 80877104;

/// write a frontend message to `buf`
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let size = msg.size_hint();
    buf.reserve(PREFIX + size as usize);

    let offset = buf.len();
    buf.put_u8(F::MSGTYPE);
    buf.put_i32(4 + size);

    msg.encode(&mut *buf);

    assert_eq!(
        buf.len() - offset,
        PREFIX + size as usize,
        "[BUG] Frontend Message body not equal to size hint"
    );
}

/// A type which can be encoded into postgres frontend message
///
/// For historical reasons, the very first messages sent by the client
/// ([`Startup`], [`SslRequest`], [`GssEncRequest`], [`CancelRequest`])
/// have no initial message-type byte and do not implement this trait.
pub trait FrontendProtocol {
    /// message type
    const MSGTYPE: u8;

    /// size of the main body
    ///
    /// note that this is *only* the size of main body as oppose of actual postgres message
    fn size_hint(&self) -> i32;

    /// write the main body of the message
    ///
    /// `buf` have the length returned from `size_hint`
    ///
    /// writing less or past length results in panic
    fn encode(self, buf: impl BufMut);
}

/// Postgres Startup frontend message
///
/// For historical reasons, the very first message sent by the client (the startup message)
/// has no initial message-type byte.
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Sent as `application_name`.
    pub application_name: Option<&'a str>,
    /// Command-line arguments for the backend.
    pub options: Option<&'a str>,
    /// Used to connect in streaming replication mode.
    ///
    /// Value can be true, false, or database, and the default is false.
    pub replication: Option<&'a str>,
    /// Additional run-time parameters applied at backend start
    /// (`client_encoding`, `DateStyle`, `TimeZone`, `extra_float_digits`, ..).
    pub params: &'a [(&'a str, &'a str)],
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        // Length of message contents in bytes, including self.
        // reserve 4 bytes for length
        buf.put_i32(0);

        buf.put_i32(PROTOCOL_VERSION);

        // The protocol version number is followed by one or more pairs of
        // parameter name and value strings.

        buf.put_nul_string("user");
        buf.put_nul_string(self.user);

        if let Some(db) = self.database {
            buf.put_nul_string("database");
            buf.put_nul_string(db);
        }

        if let Some(app) = self.application_name {
            buf.put_nul_string("application_name");
            buf.put_nul_string(app);
        }

        if let Some(opt) = self.options {
            buf.put_nul_string("options");
            buf.put_nul_string(opt);
        }

        if let Some(repl) = self.replication {
            buf.put_nul_string("replication");
            buf.put_nul_string(repl);
        }

        for (name, value) in self.params {
            buf.put_nul_string(name);
            buf.put_nul_string(value);
        }

        // A zero byte is required as a terminator after the last name/value pair.
        buf.put_u8(b'\0');

        // write the length
        let mut written_buf = &mut buf[offset..];
        written_buf.put_i32(written_buf.len().to_i32());
    }
}

/// Requests a TLS upgrade before the startup message.
///
/// The server answers with a single byte, `'S'` or `'N'`.
#[derive(Debug)]
pub struct SslRequest;

impl SslRequest {
    pub fn write(self, buf: &mut BytesMut) {
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
    }
}

/// Requests GSSAPI encryption before the startup message.
///
/// The server answers with a single byte, `'G'` or `'N'`.
#[derive(Debug)]
pub struct GssEncRequest;

impl GssEncRequest {
    pub fn write(self, buf: &mut BytesMut) {
        buf.put_i32(8);
        buf.put_i32(GSS_ENC_REQUEST_CODE);
    }
}

/// Requests cancellation of a query currently running on the backend
/// identified by the key data.
///
/// Sent on its own connection, never through the main one.
#[derive(Debug)]
pub struct CancelRequest {
    /// The process ID of the target backend.
    pub process_id: u32,
    /// The secret key for the target backend.
    pub secret_key: u32,
}

impl CancelRequest {
    pub fn write(self, buf: &mut BytesMut) {
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_u32(self.process_id);
        buf.put_u32(self.secret_key);
    }
}

/// Identifies the message as a password response.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested)
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.password.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.password);
    }
}

/// Identifies the message as an initial SASL response.
///
/// Shares the `'p'` message type with the other authentication responses;
/// the backend tells them apart from the authentication phase.
#[derive(Debug)]
pub struct SaslInitialResponse<'a> {
    /// Name of the selected SASL authentication mechanism.
    pub mechanism: &'a str,
    /// SASL mechanism specific "Initial Client Response".
    pub response: &'a [u8],
}

impl FrontendProtocol for SaslInitialResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.mechanism.nul_string_len() + 4 + self.response.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.mechanism);
        buf.put_i32(self.response.len().to_i32());
        buf.put_slice(self.response);
    }
}

/// Identifies the message as a SASL mechanism specific response.
#[derive(Debug)]
pub struct SaslResponse<'a> {
    /// SASL mechanism specific message data.
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.data.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a GSSAPI or SSPI token response.
#[derive(Debug)]
pub struct GssResponse<'a> {
    /// GSSAPI/SSPI specific message data.
    pub data: &'a [u8],
}

impl FrontendProtocol for GssResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.data.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a simple query
pub struct Query<'a> {
    /// the query string itself
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> i32 {
        self.sql.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.sql);
    }
}

/// Identifies the message as a Parse command
pub struct Parse<'a, I> {
    /// prepared statement name (an empty string selects the unnamed prepared statement).
    pub prepare_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// The number of parameter data types specified (can be zero).
    ///
    /// Note that this is not an indication of the number of parameters that might appear in the query string,
    /// only the number that the frontend wants to prespecify types for.
    pub oids_len: i16,
    /// Specifies the object ID of the parameter data type.
    ///
    /// Placing a zero here is equivalent to leaving the type unspecified.
    pub oids: I,
}

impl<I> FrontendProtocol for Parse<'_, I>
where
    I: IntoIterator<Item = u32>,
{
    const MSGTYPE: u8 = b'P';

    fn size_hint(&self) -> i32 {
        self.prepare_name.nul_string_len()
            + self.sql.nul_string_len()
            + 2
            + (self.oids_len as i32 * 4)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.prepare_name);
        buf.put_nul_string(self.sql);
        buf.put_i16(self.oids_len);
        for oid in self.oids {
            buf.put_u32(oid);
        }
    }
}

/// Identifies the message as a Bind command.
pub struct Bind<'a> {
    /// The name of the destination portal (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// The name of the source prepared statement (an empty string selects the unnamed prepared statement).
    pub stmt_name: &'a str,
    /// The parameter format codes.
    ///
    /// Can be empty to indicate that all parameters use the default format
    /// (text); or one, in which case the specified format code is applied to
    /// all parameters; or it can equal the actual number of parameters.
    pub param_formats: &'a [PgFormat],
    /// The parameter values; their number must match the number of parameters
    /// needed by the query.
    ///
    /// Each is written as `Int32` length (`-1` for NULL, no bytes follow)
    /// and the value bytes in the format indicated by the associated code.
    pub params: &'a [Encoded<'a>],
    /// The result-column format codes, with the same zero/one/exact rule as
    /// parameter formats.
    pub result_formats: &'a [PgFormat],
}

impl Bind<'_> {
    fn format_for(&self, nth: usize) -> PgFormat {
        match self.param_formats {
            [] => PgFormat::Text,
            [one] => *one,
            many => many[nth],
        }
    }

    fn wire_len_at(&self, nth: usize, param: &Encoded) -> i32 {
        // NULL is length -1 with no value bytes
        param.wire_len(self.format_for(nth)).max(0)
    }
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn size_hint(&self) -> i32 {
        self.portal_name.nul_string_len()
            + self.stmt_name.nul_string_len()
            + 2
            + (self.param_formats.len() as i32 * 2)
            + 2
            + self
                .params
                .iter()
                .enumerate()
                .fold(0i32, |acc, (nth, p)| {
                    acc + 4 + self.wire_len_at(nth, p)
                })
            + 2
            + (self.result_formats.len() as i32 * 2)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_nul_string(self.stmt_name);

        buf.put_u16(self.param_formats.len().to_u16());
        for format in self.param_formats {
            buf.put_u16(format.format_code());
        }

        buf.put_u16(self.params.len().to_u16());
        for (nth, param) in self.params.iter().enumerate() {
            let format = self.format_for(nth);
            buf.put_i32(param.wire_len(format));
            param.put(format, &mut buf);
        }

        buf.put_u16(self.result_formats.len().to_u16());
        for format in self.result_formats {
            buf.put_u16(format.format_code());
        }
    }
}

/// Identifies the message as a Describe command.
pub struct Describe<'a> {
    /// 'S' to describe a prepared statement; or 'P' to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as a Execute command
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, if portal contains a query that returns rows
    /// (ignored otherwise). Zero denotes "no limit".
    pub max_row: i32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> i32 {
        self.portal_name.nul_string_len() + 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_i32(self.max_row);
    }
}

/// Identifies the message as a Sync command
pub struct Sync;

impl FrontendProtocol for Sync {
    const MSGTYPE: u8 = b'S';

    fn size_hint(&self) -> i32 {
        0
    }

    fn encode(self, _: impl BufMut) {}
}

/// Identifies the message as a Flush command
pub struct Flush;

impl FrontendProtocol for Flush {
    const MSGTYPE: u8 = b'H';

    fn size_hint(&self) -> i32 {
        0
    }

    fn encode(self, _: impl BufMut) {}
}

/// Identifies the message as a Close command
pub struct Close<'a> {
    /// 'S' to close a prepared statement; or 'P' to close a portal.
    pub variant: u8,
    /// The name of the prepared statement or portal to close
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.variant);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as COPY data.
pub struct CopyData<'a> {
    /// Data that forms part of a COPY data stream.
    pub data: &'a [u8],
}

impl FrontendProtocol for CopyData<'_> {
    const MSGTYPE: u8 = b'd';

    fn size_hint(&self) -> i32 {
        self.data.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a COPY-complete indicator.
pub struct CopyDone;

impl FrontendProtocol for CopyDone {
    const MSGTYPE: u8 = b'c';

    fn size_hint(&self) -> i32 {
        0
    }

    fn encode(self, _: impl BufMut) {}
}

/// Identifies the message as a COPY-failure indicator.
pub struct CopyFail<'a> {
    /// An error message to report as the cause of failure.
    pub message: &'a str,
}

impl FrontendProtocol for CopyFail<'_> {
    const MSGTYPE: u8 = b'f';

    fn size_hint(&self) -> i32 {
        self.message.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.message);
    }
}

/// Identifies the message as a function call.
pub struct FunctionCall<'a> {
    /// Specifies the object ID of the function to call.
    pub function_oid: u32,
    /// The argument format codes, with the zero/one/exact rule.
    pub arg_formats: &'a [PgFormat],
    /// The arguments, written as length then value like `Bind` parameters.
    pub args: &'a [Encoded<'a>],
    /// The format code for the function result.
    pub result_format: PgFormat,
}

impl FunctionCall<'_> {
    fn format_for(&self, nth: usize) -> PgFormat {
        match self.arg_formats {
            [] => PgFormat::Text,
            [one] => *one,
            many => many[nth],
        }
    }
}

impl FrontendProtocol for FunctionCall<'_> {
    const MSGTYPE: u8 = b'F';

    fn size_hint(&self) -> i32 {
        4 + 2
            + (self.arg_formats.len() as i32 * 2)
            + 2
            + self
                .args
                .iter()
                .enumerate()
                .fold(0i32, |acc, (nth, a)| {
                    acc + 4 + a.wire_len(self.format_for(nth)).max(0)
                })
            + 2
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u32(self.function_oid);
        buf.put_u16(self.arg_formats.len().to_u16());
        for format in self.arg_formats {
            buf.put_u16(format.format_code());
        }
        buf.put_u16(self.args.len().to_u16());
        for (nth, arg) in self.args.iter().enumerate() {
            let format = self.format_for(nth);
            buf.put_i32(arg.wire_len(format));
            arg.put(format, &mut buf);
        }
        buf.put_u16(self.result_format.format_code());
    }
}

/// Identifies the message as a termination.
pub struct Terminate;

impl FrontendProtocol for Terminate {
    const MSGTYPE: u8 = b'X';

    fn size_hint(&self) -> i32 {
        0
    }

    fn encode(self, _: impl BufMut) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encode::Encode;
    use bytes::Buf;

    #[test]
    fn framing_length_includes_itself() {
        let mut buf = BytesMut::new();
        write(Query { sql: "SELECT 1" }, &mut buf);
        assert_eq!(buf[0], b'Q');
        let len = (&buf[1..5]).get_i32();
        assert_eq!(len as usize, buf.len() - 1);
        assert_eq!(&buf[5..], b"SELECT 1\0");
    }

    #[test]
    fn startup_has_no_tag() {
        let mut buf = BytesMut::new();
        Startup {
            user: "test",
            database: Some("test"),
            application_name: None,
            options: None,
            replication: None,
            params: &[("client_encoding", "UTF8")],
        }
        .write(&mut buf);
        let mut bytes = buf.freeze();
        let len = bytes.get_i32();
        assert_eq!(len as usize, bytes.remaining() + 4);
        assert_eq!(bytes.get_i32(), PROTOCOL_VERSION);
        // terminating nul after the last pair
        assert_eq!(bytes[bytes.remaining() - 1], 0);
    }

    #[test]
    fn cancel_request_wire_form() {
        let mut buf = BytesMut::new();
        CancelRequest { process_id: 42, secret_key: 99 }.write(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(bytes.get_i32(), 16);
        assert_eq!(bytes.get_i32(), CANCEL_REQUEST_CODE);
        assert_eq!(bytes.get_u32(), 42);
        assert_eq!(bytes.get_u32(), 99);
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn bind_null_writes_no_value_bytes() {
        let params = [Option::<i32>::None.encode()];
        let msg = Bind {
            portal_name: "",
            stmt_name: "q1",
            param_formats: &[PgFormat::Binary],
            params: &params,
            result_formats: &[PgFormat::Binary],
        };
        let mut buf = BytesMut::new();
        write(msg, &mut buf);
        let mut bytes = buf.freeze();
        bytes.advance(5); // tag + len
        assert_eq!(bytes.get_u8(), 0); // empty portal name
        assert_eq!(&bytes.split_to(3)[..], b"q1\0");
        assert_eq!(bytes.get_u16(), 1); // one format code
        assert_eq!(bytes.get_u16(), 1); // binary
        assert_eq!(bytes.get_u16(), 1); // one param
        assert_eq!(bytes.get_i32(), -1); // NULL
        assert_eq!(bytes.get_u16(), 1); // one result format
        assert_eq!(bytes.get_u16(), 1);
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn sync_and_flush_are_empty() {
        let mut buf = BytesMut::new();
        write(Sync, &mut buf);
        write(Flush, &mut buf);
        assert_eq!(&buf[..], &[b'S', 0, 0, 0, 4, b'H', 0, 0, 0, 4]);
    }
}
