//! The [`Encode`] trait and [`Encoded`] parameter.
use bytes::{BufMut, Bytes};

use crate::protocol::{Oid, PgFormat, pg_type};

pub use crate::value::Value;

/// A bound parameter: a typed value together with its parameter [`Oid`].
///
/// The wire format is not decided here; the query engine picks text or binary
/// per parameter from the configured binary-send Oid set when composing
/// `Bind`.
#[derive(Clone)]
pub struct Encoded<'a> {
    oid: Oid,
    value: Value<'a>,
}

impl<'a> Encoded<'a> {
    /// Pair a typed value with its parameter Oid; `0` leaves the type to
    /// the server.
    pub fn new(oid: Oid, value: Value<'a>) -> Self {
        Self { oid, value }
    }

    /// The parameter data type Oid, `0` when unspecified.
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// The typed value.
    pub fn value(&self) -> &Value<'a> {
        &self.value
    }

    /// Wire length for the given format, `-1` for NULL.
    pub fn wire_len(&self, format: PgFormat) -> i32 {
        match format {
            PgFormat::Text => self.value.text_len(),
            PgFormat::Binary => self.value.binary_len(),
        }
    }

    /// Write the value bytes for the given format.
    pub fn put(&self, format: PgFormat, buf: &mut impl BufMut) {
        match format {
            PgFormat::Text => self.value.put_text(buf),
            PgFormat::Binary => self.value.put_binary(buf),
        }
    }
}

impl std::fmt::Debug for Encoded<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Encoded")
            .field("oid", &self.oid)
            .field("value", &self.value)
            .finish()
    }
}

/// A type which can be bound as a statement parameter.
pub trait Encode<'a> {
    /// Encode self into a typed parameter.
    fn encode(self) -> Encoded<'a>;
}

macro_rules! encode {
    (<$ty:ty>($oid:expr)$pat:pat => $body:expr) => {
        impl<'a> Encode<'a> for $ty {
            fn encode(self) -> Encoded<'a> {
                let $pat = self;
                Encoded::new($oid, $body)
            }
        }
    };
}

encode!(<bool>(pg_type::BOOL)v => Value::Bool(v));
encode!(<i16>(pg_type::INT2)v => Value::Int2(v));
encode!(<i32>(pg_type::INT4)v => Value::Int4(v));
encode!(<i64>(pg_type::INT8)v => Value::Int8(v));
encode!(<f32>(pg_type::FLOAT4)v => Value::Float4(v));
encode!(<f64>(pg_type::FLOAT8)v => Value::Float8(v));
encode!(<&'a str>(pg_type::TEXT)v => Value::Text(v));
encode!(<String>(pg_type::TEXT)v => Value::TextOwned(v));
encode!(<&'a [u8]>(pg_type::BYTEA)v => Value::Slice(v));
encode!(<Bytes>(pg_type::BYTEA)v => Value::Bytes(v));

impl<'a, T> Encode<'a> for Option<T>
where
    T: Encode<'a>,
{
    fn encode(self) -> Encoded<'a> {
        match self {
            Some(v) => v.encode(),
            // untyped NULL, the backend infers the type
            None => Encoded::new(0, Value::Null),
        }
    }
}

impl<'a> Encode<'a> for Encoded<'a> {
    fn encode(self) -> Encoded<'a> {
        self
    }
}
