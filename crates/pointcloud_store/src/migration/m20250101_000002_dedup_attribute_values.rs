use rusqlite::Connection;

use crate::schema::{CREATE_METADATA_VIEW, SchemaVersion};

use super::MigrationStep;

/// Layout written by stores at schema version 1: one value row per (key, value) pair.
pub const SCHEMA_V1: &str = "
    CREATE TABLE IF NOT EXISTS Vertex (
        ObjectId INTEGER,
        x REAL, y REAL, z REAL,
        nx REAL, ny REAL, nz REAL, nw REAL,
        u REAL, v REAL,
        sx REAL, sy REAL, sz REAL
    );
    CREATE TABLE IF NOT EXISTS AttributeKeys (Name TEXT UNIQUE);
    CREATE TABLE IF NOT EXISTS AttributeValues (key_id INTEGER NOT NULL, Value TEXT);
    CREATE TABLE IF NOT EXISTS VertexToAttribute (
        vertex_id INTEGER NOT NULL,
        attribute_id INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS Object (Name TEXT UNIQUE);
    CREATE VIEW IF NOT EXISTS MetaData AS
    SELECT VertexToAttribute.vertex_id AS Vertex_Id,
           AttributeKeys.Name AS Attribute_Name,
           AttributeValues.Value AS Attribute_Value
    FROM VertexToAttribute
    INNER JOIN AttributeValues ON AttributeValues.rowid = VertexToAttribute.attribute_id
    INNER JOIN AttributeKeys ON AttributeKeys.rowid = AttributeValues.key_id;
    PRAGMA user_version = 1;";

const REWRITE: &str = "
    DROP TABLE IF EXISTS VertexToAttribute2;
    DROP TABLE IF EXISTS AttributeValues2;
    DROP INDEX IF EXISTS VertexKeyToValue;
    DROP INDEX IF EXISTS VertexToValue;
    DROP INDEX IF EXISTS VertexToKey;

    CREATE TABLE AttributeValues2 (Value TEXT NOT NULL UNIQUE);
    INSERT INTO AttributeValues2 (Value)
        SELECT DISTINCT Value FROM AttributeValues WHERE Value IS NOT NULL;

    CREATE TABLE VertexToAttribute2 (
        vertex_id INTEGER NOT NULL,
        key_id INTEGER NOT NULL,
        value_id INTEGER NOT NULL
    );
    INSERT INTO VertexToAttribute2
        SELECT VertexToAttribute.vertex_id, AttributeValues.key_id, AttributeValues2.rowid
        FROM AttributeValues2
        INNER JOIN AttributeValues ON AttributeValues2.Value = AttributeValues.Value
        INNER JOIN VertexToAttribute ON VertexToAttribute.attribute_id = AttributeValues.rowid;

    DROP VIEW IF EXISTS MetaData;
    DROP TABLE IF EXISTS VertexToAttribute;
    DROP TABLE IF EXISTS AttributeValues;
    ALTER TABLE AttributeValues2 RENAME TO AttributeValues;
    ALTER TABLE VertexToAttribute2 RENAME TO VertexToAttribute;

    CREATE INDEX VertexKeyToValue ON VertexToAttribute(key_id, value_id);
    CREATE INDEX VertexToValue ON VertexToAttribute(vertex_id, value_id);
    CREATE INDEX VertexToKey ON VertexToAttribute(vertex_id, key_id);";

pub struct Migration;

impl MigrationStep for Migration {
    fn name(&self) -> &'static str {
        "m20250101_000002_dedup_attribute_values"
    }

    fn from_version(&self) -> SchemaVersion {
        SchemaVersion::V1
    }

    fn to_version(&self) -> SchemaVersion {
        SchemaVersion::V2
    }

    fn up(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(REWRITE)?;
        conn.execute_batch(CREATE_METADATA_VIEW)
    }
}
