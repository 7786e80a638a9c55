//! Relational layout of a point-cloud store and its derived indexes.

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use pointcloud_core::{PointCloudError, PointCloudResult};

pub const SPATIAL_INDEX: &str = "SpatialQuery";
pub const METADATA_VIEW: &str = "MetaData";

/// Columns of `Vertex` that hold the per-point transform, in decoder order.
pub const TRANSFORM_COLUMNS: &str = "Vertex.x, Vertex.y, Vertex.z, Vertex.nx, Vertex.ny, \
     Vertex.nz, Vertex.nw, Vertex.sx, Vertex.sy, Vertex.sz";

pub(crate) const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS Vertex (
        ObjectId INTEGER,
        x REAL,
        y REAL,
        z REAL,
        nx REAL,
        ny REAL,
        nz REAL,
        nw REAL,
        u REAL,
        v REAL,
        sx REAL,
        sy REAL,
        sz REAL
    );
    CREATE TABLE IF NOT EXISTS AttributeKeys (Name TEXT UNIQUE);
    CREATE TABLE IF NOT EXISTS AttributeValues (Value TEXT NOT NULL UNIQUE);
    CREATE TABLE IF NOT EXISTS VertexToAttribute (
        vertex_id INTEGER NOT NULL,
        key_id INTEGER NOT NULL,
        value_id INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS Object (Name TEXT UNIQUE);";

pub(crate) const CREATE_METADATA_VIEW: &str = "
    CREATE VIEW IF NOT EXISTS MetaData AS
    SELECT VertexToAttribute.vertex_id AS Vertex_Id,
           AttributeKeys.Name AS Attribute_Name,
           AttributeValues.Value AS Attribute_Value
    FROM AttributeValues
    INNER JOIN VertexToAttribute ON AttributeValues.rowid = VertexToAttribute.value_id
    INNER JOIN AttributeKeys ON AttributeKeys.rowid = VertexToAttribute.key_id;";

const DROP_DERIVED: &str = "
    DROP TABLE IF EXISTS SpatialQuery;
    DROP INDEX IF EXISTS VertexKeyToValue;
    DROP INDEX IF EXISTS VertexToValue;
    DROP INDEX IF EXISTS VertexToKey;";

const CREATE_DERIVED: &str = "
    CREATE VIRTUAL TABLE IF NOT EXISTS SpatialQuery
        USING rtree(Id, Minx, Maxx, Miny, Maxy, Minz, Maxz);
    INSERT INTO SpatialQuery SELECT rowid, x, x, y, y, z, z FROM Vertex;
    CREATE INDEX IF NOT EXISTS VertexKeyToValue ON VertexToAttribute(key_id, value_id);
    CREATE INDEX IF NOT EXISTS VertexToValue ON VertexToAttribute(vertex_id, value_id);
    CREATE INDEX IF NOT EXISTS VertexToKey ON VertexToAttribute(vertex_id, key_id);";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SchemaVersion {
    /// Attribute values stored once per key, facts keyed by `attribute_id`.
    V1,
    /// Values deduplicated across keys, facts keyed by `(key_id, value_id)`.
    V2,
}

impl SchemaVersion {
    pub const LATEST: SchemaVersion = SchemaVersion::V2;

    pub fn from_user_version(value: i64) -> PointCloudResult<Self> {
        match value {
            0 | 1 => Ok(SchemaVersion::V1),
            2 => Ok(SchemaVersion::V2),
            other => Err(PointCloudError::schema(format!(
                "unrecognised schema version {other}"
            ))),
        }
    }

    pub fn user_version(self) -> i64 {
        match self {
            SchemaVersion::V1 => 1,
            SchemaVersion::V2 => 2,
        }
    }

    pub fn is_latest(self) -> bool {
        self == Self::LATEST
    }
}

pub fn read_user_version(conn: &Connection) -> PointCloudResult<i64> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

pub fn schema_version(conn: &Connection) -> PointCloudResult<SchemaVersion> {
    SchemaVersion::from_user_version(read_user_version(conn)?)
}

pub(crate) fn set_user_version(conn: &Connection, version: SchemaVersion) -> rusqlite::Result<()> {
    conn.execute_batch(&format!("PRAGMA user_version = {};", version.user_version()))
}

pub fn table_exists(conn: &Connection, name: &str) -> PointCloudResult<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Creates the latest schema in an empty database. Existing stores are left untouched.
pub fn ensure_schema(conn: &Connection) -> PointCloudResult<()> {
    if table_exists(conn, "Vertex")? {
        return Ok(());
    }
    conn.execute_batch(&format!(
        "BEGIN;
         {CREATE_TABLES}
         {CREATE_METADATA_VIEW}
         {CREATE_DERIVED}
         COMMIT;"
    ))?;
    set_user_version(conn, SchemaVersion::LATEST)?;
    Ok(())
}

pub(crate) fn drop_derived(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(DROP_DERIVED)
}

pub(crate) fn create_derived(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_DERIVED)
}
