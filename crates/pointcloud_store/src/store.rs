use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName, params};

use pointcloud_core::{
    AttributePair, BoundingBox, PointBatch, PointCloudError, PointCloudResult, StructuredPoint,
};

use crate::cache::TemporaryResultCache;
use crate::composer::QueryComposer;
use crate::config::{StoreConfig, StoreSettings};
use crate::decode::{Decoded, Decoder, check_width};
use crate::diagnostics::DiagnosticsContext;
use crate::hasher::{self, ContentHash, DIGEST_LEN, hash_bytes};
use crate::migration::Migrator;
use crate::schema::{self, SPATIAL_INDEX, SchemaVersion};
use crate::spatial;

/// Logs a failed read with its statement text and converts it.
pub(crate) fn read_error(sql: &str, err: rusqlite::Error) -> PointCloudError {
    log::warn!("pointcloud: query failed: {err}; sql={sql}");
    PointCloudError::storage(format!("{err} while running: {sql}"))
}

/// Savepoint that rolls back on drop unless committed.
///
/// Savepoints nest, so internal write paths can run inside a transaction the caller opened
/// with `begin_transaction`.
pub struct TransactionGuard<'c> {
    conn: &'c Connection,
    name: &'static str,
    finished: bool,
}

impl<'c> TransactionGuard<'c> {
    pub fn begin(conn: &'c Connection, name: &'static str) -> PointCloudResult<Self> {
        conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        Ok(Self {
            conn,
            name,
            finished: false,
        })
    }

    pub fn commit(mut self) -> PointCloudResult<()> {
        self.conn.execute_batch(&format!("RELEASE {}", self.name))?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let name = self.name;
        if let Err(err) = self
            .conn
            .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
        {
            log::error!("pointcloud: rollback of {name} failed: {err}");
        }
    }
}

pub struct PointCloudStore {
    conn: Mutex<Connection>,
    cache: TemporaryResultCache,
    diagnostics: Arc<DiagnosticsContext>,
    hash: Mutex<ContentHash>,
    attribute_names: Mutex<Option<Vec<String>>>,
    settings: StoreSettings,
}

impl PointCloudStore {
    pub fn connect(config: &StoreConfig, base_dir: &Path) -> PointCloudResult<Self> {
        let settings = config.settings()?;
        let conn = match config.sqlite_path(base_dir) {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                Connection::open(&path)?
            }
            None => Connection::open_in_memory()?,
        };
        log::info!("pointcloud: opened {} store", config.backend_name());
        Self::from_connection(conn, settings)
    }

    pub fn open_in_memory() -> PointCloudResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, StoreSettings::default())
    }

    pub fn open_in_memory_with(settings: StoreSettings) -> PointCloudResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, settings)
    }

    pub fn from_connection(conn: Connection, settings: StoreSettings) -> PointCloudResult<Self> {
        let diagnostics = Arc::new(DiagnosticsContext::new(settings.record_statements));
        Self::with_diagnostics(conn, settings, diagnostics)
    }

    /// Builds a store that reports into a caller-owned diagnostics context.
    ///
    /// The context is not reset, so counters accumulate across every store sharing it.
    pub fn with_diagnostics(
        conn: Connection,
        settings: StoreSettings,
        diagnostics: Arc<DiagnosticsContext>,
    ) -> PointCloudResult<Self> {
        if settings.record_statements {
            diagnostics.set_record_statements(true);
        }
        spatial::register_functions(&conn)?;
        hasher::register_hash_function(&conn)?;
        schema::ensure_schema(&conn)?;
        let version = schema::schema_version(&conn)?;
        if !version.is_latest() {
            log::warn!("pointcloud: store uses schema {version:?}; run migrate() before querying");
        }
        Ok(Self {
            conn: Mutex::new(conn),
            cache: TemporaryResultCache::new(settings.cache_capacity, settings.index_after_hits),
            diagnostics,
            hash: Mutex::new(ContentHash::INVALID),
            attribute_names: Mutex::new(None),
            settings,
        })
    }

    pub fn settings(&self) -> StoreSettings {
        self.settings
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticsContext> {
        &self.diagnostics
    }

    pub fn cache(&self) -> &TemporaryResultCache {
        &self.cache
    }

    fn composer<'a>(&'a self, conn: &'a Connection) -> QueryComposer<'a> {
        QueryComposer::new(conn, &self.cache, &self.diagnostics, self.settings.optimize_every)
    }

    /// Runs `func` with exclusive use of the connection.
    pub fn with_connection<T>(
        &self,
        func: impl FnOnce(&Connection) -> PointCloudResult<T>,
    ) -> PointCloudResult<T> {
        let conn = self.conn.lock();
        func(&conn)
    }

    /// Runs `func` with a composer over the store connection and result cache.
    pub fn with_composer<T>(
        &self,
        func: impl FnOnce(&QueryComposer<'_>) -> PointCloudResult<T>,
    ) -> PointCloudResult<T> {
        let conn = self.conn.lock();
        func(&self.composer(&conn))
    }

    pub fn begin_transaction(&self) -> PointCloudResult<()> {
        let conn = self.conn.lock();
        if !conn.is_autocommit() {
            log::warn!("pointcloud: begin_transaction called while a transaction is open");
            return Err(PointCloudError::conflict("a transaction is already open"));
        }
        conn.execute_batch("BEGIN")?;
        Ok(())
    }

    pub fn end_transaction(&self) -> PointCloudResult<()> {
        let conn = self.conn.lock();
        if conn.is_autocommit() {
            log::warn!("pointcloud: end_transaction called with no open transaction");
            return Err(PointCloudError::conflict("no transaction is open"));
        }
        conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback_transaction(&self) -> PointCloudResult<()> {
        let conn = self.conn.lock();
        if conn.is_autocommit() {
            log::warn!("pointcloud: rollback_transaction called with no open transaction");
            return Err(PointCloudError::conflict("no transaction is open"));
        }
        conn.execute_batch("ROLLBACK")?;
        // Temporary tables created inside the transaction are gone now.
        self.composer(&conn).clear_cache();
        self.invalidate_hash();
        *self.attribute_names.lock() = None;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.lock().is_autocommit()
    }

    fn invalidate_hash(&self) {
        *self.hash.lock() = ContentHash::INVALID;
    }

    /// Inserts every point of `batch` in one transaction and returns how many were kept.
    pub fn bulk_insert(&self, batch: &PointBatch) -> PointCloudResult<usize> {
        batch.validate()?;
        if self.settings.warn_non_finite {
            let non_finite = batch
                .transforms
                .iter()
                .filter(|transform| !transform.is_finite())
                .count();
            if non_finite > 0 {
                log::warn!(
                    "pointcloud: {non_finite} of {} transforms in '{}' are not finite",
                    batch.len(),
                    batch.object_name
                );
            }
        }

        let conn = self.conn.lock();
        self.invalidate_hash();
        *self.attribute_names.lock() = None;
        self.composer(&conn).clear_cache();

        let guard = TransactionGuard::begin(&conn, "bulk_insert")?;
        let inserted = self.write_batch(&conn, batch)?;
        guard.commit()?;

        log::info!(
            "pointcloud: inserted {inserted} of {} points from '{}'",
            batch.len(),
            batch.object_name
        );
        Ok(inserted)
    }

    pub fn load_structured_points(
        &self,
        object_name: &str,
        points: &[StructuredPoint],
        import_bounds: Option<BoundingBox>,
    ) -> PointCloudResult<usize> {
        self.bulk_insert(&PointBatch::from_structured(
            object_name,
            points,
            import_bounds,
        ))
    }

    fn write_batch(&self, conn: &Connection, batch: &PointBatch) -> PointCloudResult<usize> {
        conn.execute(
            "INSERT OR IGNORE INTO Object (Name) VALUES (?1)",
            [&batch.object_name],
        )?;
        let object_id: i64 = conn.query_row(
            "SELECT rowid FROM Object WHERE Name = ?1",
            [&batch.object_name],
            |row| row.get(0),
        )?;
        schema::drop_derived(conn)?;

        let key_ids = {
            let mut insert =
                conn.prepare_cached("INSERT OR IGNORE INTO AttributeKeys (Name) VALUES (?1)")?;
            let mut select = conn.prepare_cached("SELECT rowid FROM AttributeKeys WHERE Name = ?1")?;
            batch
                .attribute_names
                .iter()
                .map(|name| {
                    insert.execute([name])?;
                    select.query_row([name], |row| row.get::<_, i64>(0))
                })
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let distinct: BTreeSet<&str> = batch
            .attributes
            .iter()
            .map(|pair| pair.value.as_str())
            .collect();
        let value_ids = {
            let mut insert =
                conn.prepare_cached("INSERT OR IGNORE INTO AttributeValues (Value) VALUES (?1)")?;
            let mut select =
                conn.prepare_cached("SELECT rowid FROM AttributeValues WHERE Value = ?1")?;
            distinct
                .into_iter()
                .map(|value| -> rusqlite::Result<(&str, i64)> {
                    insert.execute([value])?;
                    let id = select.query_row([value], |row| row.get::<_, i64>(0))?;
                    Ok((value, id))
                })
                .collect::<rusqlite::Result<HashMap<_, _>>>()?
        };

        let remapped = self.remap_pairs(batch, &key_ids, &value_ids)?;
        let bounds = batch.import_bounds.filter(BoundingBox::is_valid);
        let mut next_id: i64 =
            conn.query_row("SELECT IFNULL(MAX(rowid), 0) FROM Vertex", [], |row| {
                row.get(0)
            })?;

        let mut inserted = 0;
        {
            let mut insert_vertex = conn.prepare_cached(
                "INSERT INTO Vertex (rowid, ObjectId, x, y, z, nx, ny, nz, nw, u, v, sx, sy, sz)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, ?10, ?11, ?12)",
            )?;
            let mut insert_fact = conn.prepare_cached(
                "INSERT INTO VertexToAttribute (vertex_id, key_id, value_id) VALUES (?1, ?2, ?3)",
            )?;
            let mut offset = 0;
            for (transform, count) in batch.transforms.iter().zip(&batch.attribute_counts) {
                let pairs = &remapped[offset..offset + count];
                offset += count;
                if bounds.is_some_and(|bounds| !bounds.contains(transform.translation)) {
                    continue;
                }
                next_id += 1;
                let (t, r, s) = (transform.translation, transform.rotation, transform.scale);
                insert_vertex.execute(params![
                    next_id, object_id, t.x, t.y, t.z, r.x, r.y, r.z, r.w, s.x, s.y, s.z
                ])?;
                for (key_id, value_id) in pairs {
                    insert_fact.execute(params![next_id, key_id, value_id])?;
                }
                inserted += 1;
            }
        }
        if inserted < batch.len() {
            log::debug!(
                "pointcloud: {} points of '{}' fell outside the import bounds",
                batch.len() - inserted,
                batch.object_name
            );
        }

        schema::create_derived(conn)?;
        Ok(inserted)
    }

    fn remap_pairs(
        &self,
        batch: &PointBatch,
        key_ids: &[i64],
        value_ids: &HashMap<&str, i64>,
    ) -> PointCloudResult<Vec<(i64, i64)>> {
        let remap = |pair: &AttributePair| -> PointCloudResult<(i64, i64)> {
            match (
                key_ids.get(pair.column),
                value_ids.get(pair.value.as_str()),
            ) {
                (Some(key_id), Some(value_id)) => Ok((*key_id, *value_id)),
                _ => Err(PointCloudError::integrity(format!(
                    "attribute pair for column {} was not resolved",
                    pair.column
                ))),
            }
        };
        if self.settings.parallel_remap {
            batch.attributes.par_iter().map(remap).collect()
        } else {
            batch.attributes.iter().map(remap).collect()
        }
    }

    pub fn schema_version(&self) -> PointCloudResult<SchemaVersion> {
        schema::schema_version(&self.conn.lock())
    }

    pub fn needs_updating(&self) -> PointCloudResult<bool> {
        Ok(!self.schema_version()?.is_latest())
    }

    /// Upgrades the store to the latest schema, returning the applied steps.
    pub fn migrate(&self) -> PointCloudResult<Vec<&'static str>> {
        let conn = self.conn.lock();
        if schema::schema_version(&conn)?.is_latest() {
            return Ok(Vec::new());
        }
        self.composer(&conn).clear_cache();
        let guard = TransactionGuard::begin(&conn, "migrate")?;
        let applied = Migrator::run(&conn)?;
        schema::drop_derived(&conn)?;
        schema::create_derived(&conn)?;
        guard.commit()?;
        self.invalidate_hash();
        *self.attribute_names.lock() = None;
        Ok(applied)
    }

    /// Digest of the serialized main database, recomputed only after it was invalidated.
    pub fn hash(&self) -> PointCloudResult<ContentHash> {
        let conn = self.conn.lock();
        self.current_hash(&conn)
    }

    fn current_hash(&self, conn: &Connection) -> PointCloudResult<ContentHash> {
        let mut cached = self.hash.lock();
        if cached.is_invalid() {
            let data = conn.serialize(DatabaseName::Main)?;
            self.diagnostics.hash_computed();
            *cached = hash_bytes(&data);
        }
        Ok(*cached)
    }

    pub fn hash_query(&self, sql: &str, include_query_text: bool) -> PointCloudResult<ContentHash> {
        let conn = self.conn.lock();
        self.diagnostics.hash_computed();
        hasher::hash_query_result(&conn, sql, include_query_text)
    }

    pub fn clear_derived_state(&self) -> PointCloudResult<()> {
        let conn = self.conn.lock();
        self.composer(&conn).clear_cache();
        schema::drop_derived(&conn)?;
        Ok(())
    }

    pub fn rebuild_derived_state(&self) -> PointCloudResult<()> {
        let conn = self.conn.lock();
        self.composer(&conn).clear_cache();
        let guard = TransactionGuard::begin(&conn, "rebuild_derived")?;
        schema::drop_derived(&conn)?;
        schema::create_derived(&conn)?;
        guard.commit()
    }

    pub fn count(&self) -> PointCloudResult<i64> {
        let sql = "SELECT COUNT(*) FROM Vertex";
        let conn = self.conn.lock();
        conn.query_row(sql, [], |row| row.get(0))
            .map_err(|err| read_error(sql, err))
    }

    /// Bounds of every point, read from the spatial index.
    pub fn bounds(&self) -> PointCloudResult<Option<BoundingBox>> {
        spatial::spatial_index_bounds(&self.conn.lock(), SPATIAL_INDEX)
    }

    /// Metadata keys in insertion order. Cached until the next write.
    pub fn metadata_attribute_names(&self) -> PointCloudResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut cached = self.attribute_names.lock();
        if let Some(names) = cached.as_ref() {
            return Ok(names.clone());
        }
        let names = Self::query_strings(&conn, "SELECT Name FROM AttributeKeys ORDER BY rowid")?;
        *cached = Some(names.clone());
        Ok(names)
    }

    /// Columns of the `Vertex` table.
    pub fn default_attribute_names(&self) -> PointCloudResult<Vec<String>> {
        let sql = "PRAGMA table_info(Vertex)";
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(|err| read_error(sql, err))?;
        stmt.query_map([], |row| row.get::<_, String>(1))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|err| read_error(sql, err))
    }

    pub fn has_metadata_attribute(&self, name: &str) -> PointCloudResult<bool> {
        Ok(self
            .metadata_attribute_names()?
            .iter()
            .any(|known| known.eq_ignore_ascii_case(name)))
    }

    pub fn has_default_attribute(&self, name: &str) -> PointCloudResult<bool> {
        Ok(self
            .default_attribute_names()?
            .iter()
            .any(|known| known.eq_ignore_ascii_case(name)))
    }

    pub fn loaded_objects(&self) -> PointCloudResult<Vec<String>> {
        Self::query_strings(&self.conn.lock(), "SELECT Name FROM Object ORDER BY rowid")
    }

    fn query_strings(conn: &Connection, sql: &str) -> PointCloudResult<Vec<String>> {
        let mut stmt = conn.prepare(sql).map_err(|err| read_error(sql, err))?;
        stmt.query_map([], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|err| read_error(sql, err))
    }

    /// Executes arbitrary statements. Since they may write, the store hash and every cached
    /// result are invalidated first.
    pub fn run_query(&self, sql: &str) -> PointCloudResult<()> {
        let conn = self.conn.lock();
        self.invalidate_hash();
        *self.attribute_names.lock() = None;
        self.composer(&conn).clear_cache();
        self.diagnostics
            .time_statement(sql, || conn.execute_batch(sql))
            .map_err(|err| read_error(sql, err))
    }

    /// First row of `sql` decoded with `decoder`, or `None` when it yields no rows.
    pub fn query_value(&self, sql: &str, decoder: &Decoder) -> PointCloudResult<Option<Decoded>> {
        Ok(self.query_values(sql, decoder)?.into_iter().next())
    }

    pub fn query_values(&self, sql: &str, decoder: &Decoder) -> PointCloudResult<Vec<Decoded>> {
        let conn = self.conn.lock();
        query_decoded(&conn, sql, |row| decoder.decode(row, 0), &[decoder])
    }

    pub fn query_pairs(
        &self,
        sql: &str,
        first: &Decoder,
        second: &Decoder,
    ) -> PointCloudResult<Vec<(Decoded, Decoded)>> {
        let conn = self.conn.lock();
        query_decoded(
            &conn,
            sql,
            |row| Ok((first.decode(row, 0)?, second.decode(row, first.width())?)),
            &[first, second],
        )
    }

    /// Writes a length-prefixed image of the main database followed by its hash.
    pub fn serialize_to<W: Write>(&self, writer: &mut W) -> PointCloudResult<()> {
        let conn = self.conn.lock();
        let hash = self.current_hash(&conn)?;
        let data = conn.serialize(DatabaseName::Main)?;
        writer.write_all(&(data.len() as u64).to_le_bytes())?;
        writer.write_all(&data)?;
        writer.write_all(hash.as_bytes())?;
        Ok(())
    }

    /// Replaces the main database with an image written by `serialize_to`.
    pub fn deserialize_from<R: Read>(&self, reader: &mut R) -> PointCloudResult<()> {
        let mut len = [0u8; 8];
        reader.read_exact(&mut len)?;
        let len = u64::from_le_bytes(len);
        let mut image = Vec::new();
        reader.by_ref().take(len).read_to_end(&mut image)?;
        if image.len() as u64 != len {
            return Err(PointCloudError::invalid(format!(
                "serialized store declares {len} bytes but only {} were present",
                image.len()
            )));
        }
        let mut digest = [0u8; DIGEST_LEN];
        reader.read_exact(&mut digest)?;
        let stored = ContentHash::from_bytes(digest);

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&image)?;
        file.flush()?;

        let mut conn = self.conn.lock();
        self.composer(&conn).clear_cache();
        conn.restore(DatabaseName::Main, file.path(), None::<fn(Progress)>)?;
        *self.attribute_names.lock() = None;
        *self.hash.lock() = stored;

        let version = schema::schema_version(&conn)?;
        if !version.is_latest() {
            log::warn!("pointcloud: restored store uses schema {version:?}; run migrate() before querying");
        }
        Ok(())
    }

    pub fn from_reader<R: Read>(reader: &mut R) -> PointCloudResult<Self> {
        let store = Self::open_in_memory()?;
        store.deserialize_from(reader)?;
        Ok(store)
    }

    /// Copies the live main database to `path` through the backup API.
    pub fn save_to_disk(&self, path: &Path) -> PointCloudResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.conn
            .lock()
            .backup(DatabaseName::Main, path, None)?;
        log::info!("pointcloud: saved store to {}", path.display());
        Ok(())
    }
}

pub(crate) fn query_decoded<T>(
    conn: &Connection,
    sql: &str,
    mut decode: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    decoders: &[&Decoder],
) -> PointCloudResult<Vec<T>> {
    let mut stmt = conn.prepare(sql).map_err(|err| read_error(sql, err))?;
    check_width(stmt.column_count(), decoders)?;
    let mut rows = stmt.query([]).map_err(|err| read_error(sql, err))?;
    let mut values = Vec::new();
    while let Some(row) = rows.next().map_err(|err| read_error(sql, err))? {
        values.push(decode(row).map_err(|err| read_error(sql, err))?);
    }
    Ok(values)
}
