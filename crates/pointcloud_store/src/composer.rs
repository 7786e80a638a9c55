//! Canonical SQL for the three query shapes views issue, backed by the temp-table cache.
//!
//! Every materialized result is a temp table holding at least an `Id` column of vertex row
//! ids. Query results are named `Temp_<digest>_Table` and attribute lookups
//! `Temp_Attribute_<digest>_Table`, so the two kinds never share a table even when their
//! source text hashes alike. Temp tables live on the store connection only, so they
//! never reach the serialized main database or its hash.

use rusqlite::{Connection, OptionalExtension};

use pointcloud_core::{PointCloudError, PointCloudResult};

use crate::cache::TemporaryResultCache;
use crate::diagnostics::DiagnosticsContext;
use crate::hasher::hash_bytes;

const QUERY_KEY_PREFIX: &str = "QUERY_TABLE_";
const ATTRIBUTE_KEY_PREFIX: &str = "ATTRIBUTE_TABLE_";

/// Input to `intersect`: something already materialized, or a query still to materialize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection<'a> {
    Table(&'a str),
    Query(&'a str),
}

pub struct QueryComposer<'a> {
    conn: &'a Connection,
    cache: &'a TemporaryResultCache,
    diagnostics: &'a DiagnosticsContext,
    optimize_every: u64,
}

fn short_digest(text: &str) -> String {
    let mut hex = hash_bytes(text.as_bytes()).to_hex();
    hex.truncate(32);
    hex
}

fn canonical_text(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

pub fn query_cache_key(sql: &str) -> String {
    format!("{QUERY_KEY_PREFIX}{}", short_digest(canonical_text(sql)))
}

pub fn attribute_cache_key(attribute: &str) -> String {
    format!("{ATTRIBUTE_KEY_PREFIX}{}", short_digest(attribute))
}

fn table_for_key(key: &str) -> String {
    if let Some(digest) = key.strip_prefix(ATTRIBUTE_KEY_PREFIX) {
        return format!("Temp_Attribute_{digest}_Table");
    }
    let digest = key.strip_prefix(QUERY_KEY_PREFIX).unwrap_or(key);
    format!("Temp_{digest}_Table")
}

fn index_for_table(table: &str) -> String {
    match table.strip_suffix("_Table") {
        Some(stem) => format!("{stem}_Index"),
        None => format!("{table}_Index"),
    }
}

/// Doubles single quotes so `value` can sit inside a SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl<'a> QueryComposer<'a> {
    pub fn new(
        conn: &'a Connection,
        cache: &'a TemporaryResultCache,
        diagnostics: &'a DiagnosticsContext,
        optimize_every: u64,
    ) -> Self {
        Self {
            conn,
            cache,
            diagnostics,
            optimize_every,
        }
    }

    pub fn connection(&self) -> &'a Connection {
        self.conn
    }

    pub fn cache(&self) -> &'a TemporaryResultCache {
        self.cache
    }

    pub fn diagnostics(&self) -> &'a DiagnosticsContext {
        self.diagnostics
    }

    /// Drops every table the cache tracks.
    pub fn clear_cache(&self) {
        let tables = self.cache.clear();
        self.drop_tables(tables);
    }

    /// Drops unpinned tables the cache holds beyond its capacity.
    pub fn trim_cache(&self) {
        let evicted = self.cache.trim();
        self.drop_tables(evicted);
    }

    fn execute(&self, sql: &str) -> PointCloudResult<()> {
        self.diagnostics
            .time_statement(sql, || self.conn.execute_batch(sql))
            .map_err(|err| {
                log::warn!("pointcloud: statement failed: {err}; sql={sql}");
                PointCloudError::storage(format!("{err} while running: {sql}"))
            })
    }

    fn drop_tables(&self, tables: Vec<String>) {
        for table in tables {
            let sql = format!("DROP TABLE IF EXISTS temp.\"{table}\"");
            match self.execute(&sql) {
                Ok(()) => self.diagnostics.table_evicted(),
                Err(err) => log::error!("pointcloud cache: could not drop {table}: {err}"),
            }
        }
    }

    /// Records a new table, dropping whatever it displaced.
    fn register(&self, key: &str, table: &str) {
        if self.cache.contains(key) {
            return;
        }
        let evicted = self.cache.insert(key, table);
        self.drop_tables(evicted);
        let created = self.diagnostics.table_created();
        if self.optimize_every > 0 && created % self.optimize_every == 0 {
            if let Err(err) = self.execute("PRAGMA temp.optimize") {
                log::debug!("pointcloud cache: optimize skipped: {err}");
            }
        }
    }

    /// Materializes `sql` (which must select an `Id` column) once and reuses it afterwards.
    pub fn materialize_filter(&self, sql: &str) -> PointCloudResult<String> {
        if canonical_text(sql).is_empty() {
            return Err(PointCloudError::invalid("cannot materialize an empty query"));
        }
        let key = query_cache_key(sql);
        if let Some(hit) = self.cache.lookup(&key) {
            self.diagnostics.cache_hit();
            if hit.needs_index {
                let index = index_for_table(&hit.table_name);
                self.execute(&format!(
                    "CREATE INDEX IF NOT EXISTS temp.{index} ON {}(Id)",
                    hit.table_name
                ))?;
                self.diagnostics.index_created();
            }
            return Ok(hit.table_name);
        }

        self.diagnostics.cache_miss();
        let table = table_for_key(&key);
        self.execute(&format!(
            "CREATE TEMPORARY TABLE IF NOT EXISTS {table} AS {}",
            canonical_text(sql)
        ))?;
        self.register(&key, &table);
        Ok(table)
    }

    /// Materializes `(Id, ValueId)` pairs for one attribute key.
    pub fn materialize_attribute_lookup(&self, attribute: &str) -> PointCloudResult<String> {
        if attribute.is_empty() {
            return Err(PointCloudError::invalid("attribute name is empty"));
        }
        let key = attribute_cache_key(attribute);
        if let Some(hit) = self.cache.lookup(&key) {
            self.diagnostics.cache_hit();
            return Ok(hit.table_name);
        }

        let key_id: Option<i64> = self
            .conn
            .query_row(
                "SELECT rowid FROM AttributeKeys WHERE Name = ?1",
                [attribute],
                |row| row.get(0),
            )
            .optional()?;
        let Some(key_id) = key_id else {
            log::warn!("pointcloud: unknown attribute '{attribute}'");
            return Err(PointCloudError::not_found(format!(
                "attribute '{attribute}'"
            )));
        };

        self.diagnostics.cache_miss();
        let table = table_for_key(&key);
        let index = index_for_table(&table);
        self.execute(&format!(
            "CREATE TEMPORARY TABLE IF NOT EXISTS {table} AS \
             SELECT vertex_id AS Id, value_id AS ValueId FROM VertexToAttribute WHERE key_id = {key_id};
             CREATE INDEX IF NOT EXISTS temp.{index} ON {table}(Id, ValueId);
             ANALYZE temp.{table};"
        ))?;
        self.diagnostics.index_created();
        self.register(&key, &table);
        Ok(table)
    }

    fn resolve(&self, selection: Selection<'_>) -> PointCloudResult<String> {
        match selection {
            Selection::Table(table) => Ok(table.to_string()),
            Selection::Query(sql) => self.materialize_filter(sql),
        }
    }

    /// Row ids present in both selections.
    pub fn intersect(&self, a: Selection<'_>, b: Selection<'_>) -> PointCloudResult<String> {
        let left = self.resolve(a)?;
        let _left_pin = self.cache.pin(&left);
        let right = self.resolve(b)?;
        if left == right {
            return Ok(left);
        }
        let _right_pin = self.cache.pin(&right);
        self.materialize_filter(&format!(
            "SELECT {left}.Id FROM {left} INNER JOIN {right} ON {left}.Id = {right}.Id"
        ))
    }

    /// Folds `fragments` left to right into a single table; `None` when there is nothing to
    /// filter on.
    pub fn materialize_conjunction(&self, fragments: &[String]) -> PointCloudResult<Option<String>> {
        let Some((first, rest)) = fragments.split_first() else {
            return Ok(None);
        };
        let mut table = self.materialize_filter(first)?;
        for fragment in rest {
            table = self.intersect(Selection::Table(&table), Selection::Query(fragment))?;
        }
        Ok(Some(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ensure_schema;

    fn fixture() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        ensure_schema(&conn).expect("schema");
        conn.execute_batch(
            "INSERT INTO Vertex (ObjectId, x, y, z) VALUES (1, 0, 0, 0), (1, 1, 0, 0), (1, 2, 0, 0), (1, 3, 0, 0);
             INSERT INTO SpatialQuery SELECT rowid, x, x, y, y, z, z FROM Vertex;
             INSERT INTO AttributeKeys (Name) VALUES ('color');
             INSERT INTO AttributeValues (Value) VALUES ('red'), ('blue');
             INSERT INTO VertexToAttribute VALUES (1, 1, 1), (2, 1, 2), (3, 1, 1);",
        )
        .expect("rows");
        conn
    }

    fn ids(conn: &Connection, table: &str) -> Vec<i64> {
        let mut stmt = conn
            .prepare(&format!("SELECT Id FROM {table} ORDER BY Id"))
            .expect("prepare");
        stmt.query_map([], |row| row.get(0))
            .expect("query")
            .collect::<Result<Vec<_>, _>>()
            .expect("rows")
    }

    #[test]
    fn same_query_materializes_once() {
        let conn = fixture();
        let cache = TemporaryResultCache::new(16, 3);
        let diagnostics = DiagnosticsContext::new(false);
        let composer = QueryComposer::new(&conn, &cache, &diagnostics, 100);
        let sql = "SELECT Id FROM SpatialQuery WHERE Minx >= 2";
        let first = composer.materialize_filter(sql).expect("first");
        let second = composer.materialize_filter(&format!("  {sql};")).expect("second");
        assert_eq!(first, second);
        assert_eq!(diagnostics.tables_created(), 1);
        assert_eq!(diagnostics.cache_hits(), 1);
        assert_eq!(ids(&conn, &first), vec![3, 4]);
    }

    #[test]
    fn third_hit_builds_an_index() {
        let conn = fixture();
        let cache = TemporaryResultCache::new(16, 3);
        let diagnostics = DiagnosticsContext::new(false);
        let composer = QueryComposer::new(&conn, &cache, &diagnostics, 100);
        let sql = "SELECT Id FROM SpatialQuery";
        for _ in 0..5 {
            composer.materialize_filter(sql).expect("materialize");
        }
        assert_eq!(diagnostics.indexes_created(), 1);
        let indexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_temp_master WHERE type = 'index'",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(indexes, 1);
    }

    #[test]
    fn eviction_drops_the_displaced_table() {
        let conn = fixture();
        let cache = TemporaryResultCache::new(2, 3);
        let diagnostics = DiagnosticsContext::new(false);
        let composer = QueryComposer::new(&conn, &cache, &diagnostics, 100);
        for bound in 0..5 {
            composer
                .materialize_filter(&format!("SELECT Id FROM SpatialQuery WHERE Minx >= {bound}"))
                .expect("materialize");
        }
        let temp_tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_temp_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(temp_tables, 2);
        assert_eq!(diagnostics.tables_evicted(), 3);
    }

    #[test]
    fn intersection_keeps_common_ids_and_short_circuits_on_self() {
        let conn = fixture();
        let cache = TemporaryResultCache::new(16, 3);
        let diagnostics = DiagnosticsContext::new(false);
        let composer = QueryComposer::new(&conn, &cache, &diagnostics, 100);
        let left = "SELECT Id FROM SpatialQuery WHERE Minx >= 1";
        let right = "SELECT Id FROM SpatialQuery WHERE Minx <= 2";
        let both = composer
            .intersect(Selection::Query(left), Selection::Query(right))
            .expect("intersect");
        assert_eq!(ids(&conn, &both), vec![2, 3]);

        let table = composer.materialize_filter(left).expect("left");
        let same = composer
            .intersect(Selection::Table(&table), Selection::Query(left))
            .expect("self");
        assert_eq!(same, table);
    }

    #[test]
    fn intersection_survives_a_single_slot_cache() {
        let conn = fixture();
        let cache = TemporaryResultCache::new(1, 3);
        let diagnostics = DiagnosticsContext::new(false);
        let composer = QueryComposer::new(&conn, &cache, &diagnostics, 100);
        let fragments = vec![
            "SELECT Id FROM SpatialQuery WHERE Minx >= 1".to_string(),
            "SELECT Id FROM SpatialQuery WHERE Minx <= 2".to_string(),
            "SELECT Id FROM SpatialQuery WHERE Minx <> 1".to_string(),
        ];
        let table = composer
            .materialize_conjunction(&fragments)
            .expect("fold")
            .expect("table");
        assert_eq!(ids(&conn, &table), vec![3]);
        assert!(composer.materialize_conjunction(&[]).expect("empty").is_none());
    }

    #[test]
    fn trimming_after_a_fold_restores_capacity() {
        let conn = fixture();
        let cache = TemporaryResultCache::new(1, 3);
        let diagnostics = DiagnosticsContext::new(false);
        let composer = QueryComposer::new(&conn, &cache, &diagnostics, 100);
        let fragments = vec![
            "SELECT Id FROM SpatialQuery WHERE Minx >= 1".to_string(),
            "SELECT Id FROM SpatialQuery WHERE Minx <= 2".to_string(),
        ];
        composer.materialize_conjunction(&fragments).expect("fold");
        composer.trim_cache();
        let temp_tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_temp_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(temp_tables, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn attribute_and_query_tables_never_collide() {
        let text = "color";
        let query_table = table_for_key(&query_cache_key(text));
        let attribute_table = table_for_key(&attribute_cache_key(text));
        assert_ne!(query_table, attribute_table);
        assert!(attribute_table.starts_with("Temp_Attribute_"));
        assert_eq!(
            index_for_table(&attribute_table),
            attribute_table.replace("_Table", "_Index")
        );

        let conn = fixture();
        let cache = TemporaryResultCache::new(16, 3);
        let diagnostics = DiagnosticsContext::new(false);
        let composer = QueryComposer::new(&conn, &cache, &diagnostics, 100);
        let lookup = composer.materialize_attribute_lookup(text).expect("lookup");
        let filter = composer
            .materialize_filter("SELECT Id FROM SpatialQuery WHERE Minx >= 3")
            .expect("filter");
        assert_ne!(lookup, filter);
        assert_eq!(ids(&conn, &lookup), vec![1, 2, 3]);
        assert_eq!(ids(&conn, &filter), vec![4]);
    }

    #[test]
    fn attribute_lookup_requires_a_known_key() {
        let conn = fixture();
        let cache = TemporaryResultCache::new(16, 3);
        let diagnostics = DiagnosticsContext::new(false);
        let composer = QueryComposer::new(&conn, &cache, &diagnostics, 100);
        let table = composer.materialize_attribute_lookup("color").expect("color");
        assert_eq!(ids(&conn, &table), vec![1, 2, 3]);
        assert_eq!(
            composer.materialize_attribute_lookup("color").expect("again"),
            table
        );
        assert!(matches!(
            composer.materialize_attribute_lookup("height"),
            Err(PointCloudError::NotFound { .. })
        ));
    }

    #[test]
    fn failing_statements_surface_as_storage_errors() {
        let conn = fixture();
        let cache = TemporaryResultCache::new(16, 3);
        let diagnostics = DiagnosticsContext::new(false);
        let composer = QueryComposer::new(&conn, &cache, &diagnostics, 100);
        assert!(matches!(
            composer.materialize_filter("SELECT Id FROM Missing"),
            Err(PointCloudError::Storage { .. })
        ));
        assert!(matches!(
            composer.materialize_filter("  ;"),
            Err(PointCloudError::Validation { .. })
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn literals_are_quoted() {
        assert_eq!(quote_literal("O'Neil"), "'O''Neil'");
    }
}
