//! Postgres row operation.
//!
//! - [`Row`]
//! - [`Column`]
//! - [`FromRow`]
//! - [`FromColumn`]
//! - [`Index`]
//! - [`DecodeError`]
use bytes::{Buf, Bytes};
use std::{borrow::Cow, fmt, str::Utf8Error, string::FromUtf8Error, sync::Arc};

use crate::protocol::{Oid, PgFormat, PgType, backend::FieldDescription};

/// One streamed result row: the shared column descriptors and this row's
/// values.
pub struct Row {
    fields: Arc<Vec<FieldDescription>>,
    /// `DataRow` body: for each column an `Int32` length (`-1` NULL) and
    /// that many value bytes.
    values: Bytes,
}

impl Row {
    pub(crate) fn new(fields: Arc<Vec<FieldDescription>>, mut body: Bytes) -> Row {
        let column_len = body.get_u16();
        assert_eq!(
            column_len as usize,
            fields.len(),
            "RowDescription len missmatch with DataRow len"
        );
        Self { fields, values: body }
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the number of fields/column in the row.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// The shared column descriptors.
    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    /// Try get and decode column.
    pub fn try_get<I: Index, R: FromColumn>(&self, idx: I) -> Result<R, DecodeError> {
        let nth = idx.position(&self.fields)?;

        let mut values = self.values.clone();
        let mut value = None;
        for i in 0..=nth {
            let len = values.get_i32();
            let cell = (len >= 0).then(|| values.split_to(len as usize));
            if i == nth {
                value = cell;
                break;
            }
        }

        R::decode(Column {
            field: self.fields[nth].clone(),
            value,
        })
    }

    /// Iterate the columns in order.
    pub fn columns(&self) -> Columns {
        Columns {
            fields: self.fields.clone(),
            values: self.values.clone(),
            nth: 0,
        }
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for column in self.columns() {
            dbg.key(&column.field.name);
            match &column.value {
                Some(value) => dbg.value(&crate::ext::Lossy(value)),
                None => dbg.value(&"NULL"),
            };
        }
        dbg.finish()
    }
}

/// Ordered iterator over a row's columns.
pub struct Columns {
    fields: Arc<Vec<FieldDescription>>,
    values: Bytes,
    nth: usize,
}

impl Iterator for Columns {
    type Item = Column;

    fn next(&mut self) -> Option<Self::Item> {
        let field = self.fields.get(self.nth)?.clone();
        let len = self.values.get_i32();
        let value = (len >= 0).then(|| self.values.split_to(len as usize));
        self.nth += 1;
        Some(Column { field, value })
    }
}

/// Postgres column: its descriptor and the raw cell value.
#[derive(Debug)]
pub struct Column {
    field: FieldDescription,
    value: Option<Bytes>,
}

impl Column {
    /// Returns column [`Oid`].
    pub fn oid(&self) -> Oid {
        self.field.type_oid
    }

    /// Returns column name.
    pub fn name(&self) -> &str {
        &self.field.name
    }

    /// The transfer format the cell was received in.
    pub fn format(&self) -> PgFormat {
        PgFormat::from_code(self.field.format_code)
    }

    /// Returns `true` for a NULL cell.
    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// The raw cell bytes, `None` for NULL.
    pub fn as_slice(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Consume self into the inner [`Bytes`].
    pub fn into_value(self) -> Option<Bytes> {
        self.value
    }

    /// Decode value from self.
    pub fn decode<D: FromColumn>(self) -> Result<D, DecodeError> {
        D::decode(self)
    }

    fn expect_value(&self) -> Result<&[u8], DecodeError> {
        self.value.as_deref().ok_or(DecodeError::UnexpectedNull)
    }

    fn expect_text(&self) -> Result<&str, DecodeError> {
        std::str::from_utf8(self.expect_value()?).map_err(Into::into)
    }
}

// ===== Traits =====

/// Type that can be constructed from a row.
pub trait FromRow: Sized {
    /// Construct self from row.
    fn from_row(row: Row) -> Result<Self, DecodeError>;
}

impl FromRow for Row {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        Ok(row)
    }
}

impl FromRow for () {
    fn from_row(_: Row) -> Result<Self, DecodeError> {
        Ok(())
    }
}

macro_rules! from_row_tuple {
    ($($t:ident $i:literal),*) => {
        impl<$($t),*> FromRow for ($($t),*,)
        where
            $($t: FromColumn),*
        {
            fn from_row(row: Row) -> Result<Self, DecodeError> {
                Ok((
                    $(row.try_get($i)?),*,
                ))
            }
        }
    };
}

from_row_tuple!(T0 0);
from_row_tuple!(T0 0, T1 1);
from_row_tuple!(T0 0, T1 1, T2 2);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5);

/// A type that can be constructed from [`Column`].
pub trait FromColumn: Sized {
    fn decode(column: Column) -> Result<Self, DecodeError>;
}

impl FromColumn for Column {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        Ok(column)
    }
}

impl<T: FromColumn> FromColumn for Option<T> {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        if column.is_null() {
            return Ok(None);
        }
        T::decode(column).map(Some)
    }
}

macro_rules! from_column_int {
    ($($ty:ty => $oids:pat,)*) => {$(
        impl FromColumn for $ty {
            fn decode(col: Column) -> Result<Self, DecodeError> {
                if !matches!(col.oid(), $oids) {
                    return Err(DecodeError::OidMissmatch {
                        requested: <$ty>::OID,
                        column: col.oid(),
                    });
                }
                match col.format() {
                    PgFormat::Binary => {
                        let value = col.expect_value()?;
                        if value.len() != size_of::<$ty>() {
                            return Err(DecodeError::Malformed);
                        }
                        let mut be = [0u8; size_of::<$ty>()];
                        be.copy_from_slice(value);
                        Ok(<$ty>::from_be_bytes(be))
                    }
                    PgFormat::Text => {
                        col.expect_text()?.parse().map_err(|_| DecodeError::Malformed)
                    }
                }
            }
        }
    )*};
}

use crate::protocol::pg_type::{FLOAT4, FLOAT8, INT2, INT4, INT8};

from_column_int! {
    i16 => INT2,
    i32 => INT2 | INT4,
    i64 => INT2 | INT4 | INT8,
    f32 => FLOAT4,
    f64 => FLOAT4 | FLOAT8,
}

impl FromColumn for bool {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        if col.oid() != bool::OID {
            return Err(DecodeError::OidMissmatch { requested: bool::OID, column: col.oid() });
        }
        match col.format() {
            PgFormat::Binary => Ok(col.expect_value()?.first().copied() == Some(1)),
            PgFormat::Text => Ok(matches!(col.expect_text()?, "t" | "true" | "on" | "1")),
        }
    }
}

impl FromColumn for String {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        // any textual oid decodes as String; binary form equals text form
        Ok(col.expect_text()?.to_string())
    }
}

impl FromColumn for Bytes {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        match (col.format(), col.oid()) {
            (PgFormat::Text, crate::protocol::pg_type::BYTEA) => {
                let text = col.expect_text()?;
                let hex = text.strip_prefix("\\x").ok_or(DecodeError::Malformed)?;
                let mut out = Vec::with_capacity(hex.len() / 2);
                let bytes = hex.as_bytes();
                for pair in bytes.chunks_exact(2) {
                    let hi = (pair[0] as char).to_digit(16).ok_or(DecodeError::Malformed)?;
                    let lo = (pair[1] as char).to_digit(16).ok_or(DecodeError::Malformed)?;
                    out.push((hi * 16 + lo) as u8);
                }
                Ok(Bytes::from(out))
            }
            _ => Ok(col.into_value().unwrap_or_default()),
        }
    }
}

impl FromColumn for Vec<u8> {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        Bytes::decode(col).map(Into::into)
    }
}

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns the zero based column position.
    fn position(self, fields: &[FieldDescription]) -> Result<usize, DecodeError>;
}

impl Index for usize {
    fn position(self, fields: &[FieldDescription]) -> Result<usize, DecodeError> {
        if self < fields.len() {
            return Ok(self);
        }
        Err(DecodeError::ColumnNotFound(
            String::from(itoa::Buffer::new().format(self)).into(),
        ))
    }
}

impl Index for &str {
    fn position(self, fields: &[FieldDescription]) -> Result<usize, DecodeError> {
        fields
            .iter()
            .position(|f| f.name == self)
            .ok_or_else(|| DecodeError::ColumnNotFound(String::from(self).into()))
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for usize {}
    impl Sealed for &str {}
}

/// An error when decoding row value.
pub enum DecodeError {
    /// Postgres return non utf8 string.
    Utf8(Utf8Error),
    /// Column requested not found.
    ColumnNotFound(Cow<'static, str>),
    /// Oid requested missmatch.
    OidMissmatch { requested: Oid, column: Oid },
    /// The cell is NULL but the target type is not optional.
    UnexpectedNull,
    /// The cell bytes do not form a value of the requested type.
    Malformed,
}

impl std::error::Error for DecodeError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            DecodeError::Utf8(e) => write!(f, "{e}"),
            DecodeError::ColumnNotFound(name) => write!(f, "column not found: {name}"),
            DecodeError::OidMissmatch { requested, column } => {
                write!(f, "data type missmatch: requested {requested}, column is {column}")
            }
            DecodeError::UnexpectedNull => write!(f, "unexpected NULL"),
            DecodeError::Malformed => write!(f, "malformed value bytes"),
        }
    }
}

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for DecodeError {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

from!(<Utf8Error>e => Self::Utf8(e));
from!(<FromUtf8Error>e => Self::Utf8(e.utf8_error()));

#[cfg(test)]
mod test {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn field(name: &str, oid: Oid, format: u16) -> FieldDescription {
        FieldDescription {
            name: name.into(),
            table_oid: 0,
            column_attr: 0,
            type_oid: oid,
            type_size: 0,
            type_modifier: -1,
            format_code: format,
        }
    }

    fn row(fields: Vec<FieldDescription>, cells: &[Option<&[u8]>]) -> Row {
        let mut buf = BytesMut::new();
        buf.put_u16(cells.len() as u16);
        for cell in cells {
            match cell {
                Some(value) => {
                    buf.put_i32(value.len() as i32);
                    buf.put_slice(value);
                }
                None => buf.put_i32(-1),
            }
        }
        Row::new(Arc::new(fields), buf.freeze())
    }

    #[test]
    fn binary_and_text_ints() {
        let r = row(
            vec![field("a", INT4, 1), field("b", INT4, 0)],
            &[Some(&7i32.to_be_bytes()), Some(b"42")],
        );
        assert_eq!(r.try_get::<_, i32>(0).unwrap(), 7);
        assert_eq!(r.try_get::<_, i32>("b").unwrap(), 42);
    }

    #[test]
    fn widening_is_allowed_narrowing_is_not() {
        let r = row(vec![field("a", INT2, 0)], &[Some(b"5")]);
        assert_eq!(r.try_get::<_, i64>(0).unwrap(), 5);
        let r = row(vec![field("a", INT8, 0)], &[Some(b"5")]);
        assert!(r.try_get::<_, i16>(0).is_err());
    }

    #[test]
    fn null_needs_option() {
        let r = row(vec![field("a", INT4, 1)], &[None]);
        assert!(r.try_get::<_, i32>(0).is_err());
        assert_eq!(r.try_get::<_, Option<i32>>(0).unwrap(), None);
    }

    #[test]
    fn missing_column_by_name() {
        let r = row(vec![field("a", INT4, 1)], &[Some(&1i32.to_be_bytes())]);
        assert!(matches!(
            r.try_get::<_, i32>("nope").unwrap_err(),
            DecodeError::ColumnNotFound(_),
        ));
    }

    #[test]
    fn bytea_hex_text() {
        let r = row(
            vec![field("a", crate::protocol::pg_type::BYTEA, 0)],
            &[Some(b"\\xdead")],
        );
        assert_eq!(r.try_get::<_, Vec<u8>>(0).unwrap(), vec![0xde, 0xad]);
    }

    #[test]
    fn bool_both_formats() {
        let r = row(vec![field("a", 16, 1), field("b", 16, 0)], &[Some(&[1]), Some(b"f")]);
        assert!(r.try_get::<_, bool>(0).unwrap());
        assert!(!r.try_get::<_, bool>(1).unwrap());
    }
}
