//! Deterministic 256-bit digests over raw bytes and over query result streams.
//!
//! Result streams are folded with a type-tagged, length-prefixed encoding so that
//! `(1, "a")` and `("1a")` can never collide, and numbers are written big-endian so the
//! digest does not depend on host byte order.

use std::fmt;

use blake3::Hasher;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection};
use serde::{Serialize, Serializer};

use pointcloud_core::{PointCloudError, PointCloudResult};

pub const DIGEST_LEN: usize = 32;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; DIGEST_LEN]);

impl ContentHash {
    /// All-zero digest marking a hash that must be recomputed.
    pub const INVALID: ContentHash = ContentHash([0; DIGEST_LEN]);

    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn is_invalid(&self) -> bool {
        self.0 == [0; DIGEST_LEN]
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex)
            .ok()
            .map(|hash| Self(*hash.as_bytes()))
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(value: blake3::Hash) -> Self {
        Self(*value.as_bytes())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    blake3::hash(bytes).into()
}

/// Streaming encoder for ordered result rows.
pub struct ResultHasher {
    inner: Hasher,
}

impl Default for ResultHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultHasher {
    pub fn new() -> Self {
        Self {
            inner: Hasher::new(),
        }
    }

    pub fn statement(&mut self, sql: &str) {
        self.inner.update(format!("S{}:", sql.len()).as_bytes());
        self.inner.update(sql.as_bytes());
    }

    pub fn row(&mut self) {
        self.inner.update(b"R");
    }

    pub fn value(&mut self, value: ValueRef<'_>) {
        match value {
            ValueRef::Null => {
                self.inner.update(b"N");
            }
            ValueRef::Integer(v) => {
                self.inner.update(b"I");
                self.inner.update(&v.to_be_bytes());
            }
            ValueRef::Real(v) => {
                self.inner.update(b"F");
                self.inner.update(&v.to_bits().to_be_bytes());
            }
            ValueRef::Text(bytes) => {
                self.inner.update(format!("T{}:", bytes.len()).as_bytes());
                self.inner.update(bytes);
            }
            ValueRef::Blob(bytes) => {
                self.inner.update(format!("B{}:", bytes.len()).as_bytes());
                self.inner.update(bytes);
            }
        }
    }

    pub fn finish(&self) -> ContentHash {
        self.inner.finalize().into()
    }
}

/// Hashes every row produced by the statement(s) in `sql`, in order.
///
/// All statements are prepared and checked up front; a single writing statement fails the
/// whole call before anything runs.
pub fn hash_query_result(
    conn: &Connection,
    sql: &str,
    include_query_text: bool,
) -> PointCloudResult<ContentHash> {
    let mut statements = Batch::new(conn, sql).collect::<Result<Vec<_>, _>>()?;
    if statements.is_empty() {
        return Err(PointCloudError::invalid("cannot hash an empty query"));
    }
    if statements.iter().any(|stmt| !stmt.readonly()) {
        return Err(PointCloudError::invalid(format!(
            "refusing to hash a statement that writes: {sql}"
        )));
    }

    let mut hasher = ResultHasher::new();
    for stmt in statements.iter_mut() {
        if include_query_text {
            let text = stmt.expanded_sql().unwrap_or_default();
            hasher.statement(&text);
        }
        let columns = stmt.column_count();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            hasher.row();
            for index in 0..columns {
                hasher.value(row.get_ref(index)?);
            }
        }
    }
    Ok(hasher.finish())
}

/// Registers `CONTENT_HASH(x)`, returning the hex digest of a single tagged value.
pub fn register_hash_function(conn: &Connection) -> PointCloudResult<()> {
    conn.create_scalar_function(
        "CONTENT_HASH",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let mut hasher = ResultHasher::new();
            hasher.value(ctx.get_raw(0));
            Ok(hasher.finish().to_hex())
        },
    )?;
    Ok(())
}
