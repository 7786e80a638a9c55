use rusqlite::Connection;

use pointcloud_core::{PointCloudError, PointCloudResult};

use crate::schema::{self, SchemaVersion};

mod m20250101_000002_dedup_attribute_values;

pub use m20250101_000002_dedup_attribute_values::SCHEMA_V1;

pub trait MigrationStep {
    fn name(&self) -> &'static str;
    fn from_version(&self) -> SchemaVersion;
    fn to_version(&self) -> SchemaVersion;
    fn up(&self, conn: &Connection) -> rusqlite::Result<()>;
}

pub struct Migrator;

impl Migrator {
    pub fn migrations() -> Vec<Box<dyn MigrationStep>> {
        vec![Box::new(m20250101_000002_dedup_attribute_values::Migration)]
    }

    /// Applies every step between the stored version and the latest one.
    ///
    /// The caller owns the surrounding transaction; a failed step leaves nothing committed.
    pub fn run(conn: &Connection) -> PointCloudResult<Vec<&'static str>> {
        let migrations = Self::migrations();
        let mut applied = Vec::new();
        let mut version = schema::schema_version(conn)?;
        while !version.is_latest() {
            let step = migrations
                .iter()
                .find(|step| step.from_version() == version)
                .ok_or_else(|| {
                    PointCloudError::schema(format!("no migration from schema {version:?}"))
                })?;
            log::info!(
                "pointcloud: applying migration {} ({:?} -> {:?})",
                step.name(),
                step.from_version(),
                step.to_version()
            );
            step.up(conn).map_err(|err| {
                PointCloudError::schema(format!("migration {} failed: {err}", step.name()))
            })?;
            schema::set_user_version(conn, step.to_version())?;
            applied.push(step.name());
            version = step.to_version();
        }
        Ok(applied)
    }
}
