/// A resolved PostgreSQL type: the wire oid and the fixed size advertised
/// in RowDescription messages.
///
/// Oids are the stable values from `pg_type.dat` in the PostgreSQL source;
/// clients hard-code them, so the table below must not drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgType {
    pub name: &'static str,
    pub oid: u32,
    /// Fixed byte width, or -1 for variable-size types.
    pub size: i16,
}

pub const TYPE_TEXT: PgType = PgType {
    name: "text",
    oid: 25,
    size: -1,
};

/// Name-to-type table, exposed as immutable module-level data.
const TYPES: &[PgType] = &[
    PgType { name: "varchar", oid: 1043, size: -1 },
    TYPE_TEXT,
    PgType { name: "bpchar", oid: 1042, size: -1 },
    PgType { name: "name", oid: 19, size: 64 },
    PgType { name: "int4", oid: 23, size: 4 },
    PgType { name: "int8", oid: 20, size: 8 },
    PgType { name: "int2", oid: 21, size: 2 },
    PgType { name: "bool", oid: 16, size: 1 },
    PgType { name: "float4", oid: 700, size: 4 },
    PgType { name: "float8", oid: 701, size: 8 },
    PgType { name: "numeric", oid: 1700, size: -1 },
    PgType { name: "date", oid: 1082, size: 4 },
    PgType { name: "timestamp", oid: 1114, size: 8 },
    PgType { name: "timestamptz", oid: 1184, size: 8 },
    PgType { name: "time", oid: 1083, size: 8 },
    PgType { name: "timetz", oid: 1266, size: 12 },
    PgType { name: "json", oid: 114, size: -1 },
    PgType { name: "jsonb", oid: 3802, size: -1 },
    PgType { name: "uuid", oid: 2950, size: 16 },
    PgType { name: "bytea", oid: 17, size: -1 },
    PgType { name: "oid", oid: 26, size: 4 },
];

/// Resolves a textual type name, case-insensitively, to its wire type.
/// Unknown names resolve to `text`, which every client can render.
pub fn lookup_type(name: &str) -> PgType {
    TYPES
        .iter()
        .find(|t| t.name.eq_ignore_ascii_case(name.trim()))
        .copied()
        .unwrap_or(TYPE_TEXT)
}
