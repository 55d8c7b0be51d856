//! Server data type Oids and the binary transfer policy.
use std::collections::HashSet;

/// 32-bit unsigned integer identifying a server-side type or relation.
pub type Oid = u32;

pub const BOOL: Oid = 16;
pub const BYTEA: Oid = 17;
pub const INT8: Oid = 20;
pub const INT2: Oid = 21;
pub const INT4: Oid = 23;
pub const TEXT: Oid = 25;
pub const POINT: Oid = 600;
pub const BOX: Oid = 603;
pub const FLOAT4: Oid = 700;
pub const FLOAT8: Oid = 701;
pub const VARCHAR: Oid = 1043;
pub const DATE: Oid = 1082;
pub const TIME: Oid = 1083;
pub const TIMESTAMP: Oid = 1114;
pub const TIMESTAMPTZ: Oid = 1184;
pub const TIMETZ: Oid = 1266;
pub const NUMERIC: Oid = 1700;
pub const UUID: Oid = 2950;

pub const BYTEA_ARRAY: Oid = 1001;
pub const INT2_ARRAY: Oid = 1005;
pub const INT4_ARRAY: Oid = 1007;
pub const INT8_ARRAY: Oid = 1016;
pub const POINT_ARRAY: Oid = 1017;
pub const BOX_ARRAY: Oid = 1020;
pub const FLOAT4_ARRAY: Oid = 1021;
pub const FLOAT8_ARRAY: Oid = 1022;
pub const DATE_ARRAY: Oid = 1182;
pub const TIME_ARRAY: Oid = 1183;
pub const TIMESTAMP_ARRAY: Oid = 1115;
pub const TIMESTAMPTZ_ARRAY: Oid = 1185;
pub const TIMETZ_ARRAY: Oid = 1270;
pub const NUMERIC_ARRAY: Oid = 1231;
pub const UUID_ARRAY: Oid = 2951;

/// Statically known Oid of a rust type.
pub trait PgType {
    const OID: Oid;
}

impl PgType for () {
    const OID: Oid = 0;
}

impl PgType for bool {
    const OID: Oid = BOOL;
}

impl PgType for i16 {
    const OID: Oid = INT2;
}

impl PgType for i32 {
    const OID: Oid = INT4;
}

impl PgType for i64 {
    const OID: Oid = INT8;
}

impl PgType for f32 {
    const OID: Oid = FLOAT4;
}

impl PgType for f64 {
    const OID: Oid = FLOAT8;
}

impl PgType for str {
    const OID: Oid = TEXT;
}

impl PgType for String {
    const OID: Oid = TEXT;
}

impl PgType for [u8] {
    const OID: Oid = BYTEA;
}

const DEFAULT_BINARY: &[Oid] = &[
    BYTEA,
    INT2,
    INT4,
    INT8,
    FLOAT4,
    FLOAT8,
    NUMERIC,
    TIME,
    DATE,
    TIMETZ,
    TIMESTAMP,
    TIMESTAMPTZ,
    BYTEA_ARRAY,
    INT2_ARRAY,
    INT4_ARRAY,
    INT8_ARRAY,
    FLOAT4_ARRAY,
    FLOAT8_ARRAY,
    NUMERIC_ARRAY,
    TIME_ARRAY,
    DATE_ARRAY,
    TIMETZ_ARRAY,
    TIMESTAMP_ARRAY,
    TIMESTAMPTZ_ARRAY,
    POINT,
    BOX,
    UUID,
];

/// The per-connection binary transfer policy: two Oid sets, one for values
/// the driver sends, one for values it is willing to receive.
///
/// Both sets are fixed after construction; every format decision is a pure
/// lookup.
#[derive(Debug, Clone)]
pub struct BinaryTransfer {
    send: HashSet<Oid>,
    receive: HashSet<Oid>,
}

impl BinaryTransfer {
    /// The default sets. `DATE` is removed from the send set to preserve
    /// millisecond accuracy of client supplied values.
    pub fn new(enabled: bool) -> Self {
        let mut me = Self { send: HashSet::new(), receive: HashSet::new() };
        if enabled {
            me.receive.extend(DEFAULT_BINARY);
            me.send.extend(DEFAULT_BINARY);
            me.send.remove(&DATE);
        }
        me
    }

    /// Add an Oid to both sets.
    pub fn enable(&mut self, oid: Oid) {
        self.send.insert(oid);
        self.receive.insert(oid);
    }

    /// Remove an Oid from both sets.
    pub fn disable(&mut self, oid: Oid) {
        self.send.remove(&oid);
        self.receive.remove(&oid);
    }

    /// Whether a parameter of type `oid` is sent in binary format.
    pub fn use_binary_for_send(&self, oid: Oid) -> bool {
        self.send.contains(&oid)
    }

    /// Whether a result column of type `oid` is requested in binary format.
    pub fn use_binary_for_receive(&self, oid: Oid) -> bool {
        self.receive.contains(&oid)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn date_send_is_text() {
        let t = BinaryTransfer::new(true);
        assert!(!t.use_binary_for_send(DATE));
        assert!(t.use_binary_for_receive(DATE));
    }

    #[test]
    fn disabled_transfer_is_all_text() {
        let t = BinaryTransfer::new(false);
        assert!(!t.use_binary_for_send(INT4));
        assert!(!t.use_binary_for_receive(INT4));
    }

    #[test]
    fn sets_are_editable_before_use() {
        let mut t = BinaryTransfer::new(true);
        t.disable(NUMERIC);
        t.enable(VARCHAR);
        assert!(!t.use_binary_for_receive(NUMERIC));
        assert!(t.use_binary_for_send(VARCHAR));
    }
}
