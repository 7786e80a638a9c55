//! Composable filtered views over a store.
//!
//! Views live in a `ViewArena` and point at each other by `ViewId`. A child view sees every
//! filter of its ancestors followed by its own, so adding a filter only ever narrows the
//! selection. Reads materialize the combined filters through the store's result cache and
//! run while the connection is held, so the tables they join against cannot be evicted
//! underneath them.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use pointcloud_core::{
    BoundingBox, OrientedBox, PointCloudError, PointCloudResult, Transform, Vec3,
};

use crate::composer::{QueryComposer, quote_literal};
use crate::decode::{Decoded, Decoder};
use crate::filter::{self, FilterMode};
use crate::hasher::{ContentHash, hash_query_result};
use crate::schema::{METADATA_VIEW, SPATIAL_INDEX, TRANSFORM_COLUMNS};
use crate::store::{PointCloudStore, query_decoded, read_error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ViewId(usize);

impl ViewId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewState {
    Unfiltered,
    Filtered,
}

#[derive(Clone, Debug, Default)]
pub struct FilterView {
    parent: Option<ViewId>,
    children: Vec<ViewId>,
    filters: Vec<String>,
    /// Store hash the cached digest was computed against, and the digest.
    cached_hash: Option<(ContentHash, ContentHash)>,
}

impl FilterView {
    pub fn parent(&self) -> Option<ViewId> {
        self.parent
    }

    pub fn children(&self) -> &[ViewId] {
        &self.children
    }

    /// Fragments added to this view, without those inherited from ancestors.
    pub fn own_filters(&self) -> &[String] {
        &self.filters
    }
}

/// Result of `attribute_value_counts_multi`: one value per requested key, and how many
/// points carry that combination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValueCombination {
    pub values: Vec<String>,
    pub count: i64,
}

#[derive(Debug, Default)]
pub struct ViewArena {
    views: Vec<Option<FilterView>>,
}

impl ViewArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live views.
    pub fn len(&self) -> usize {
        self.views.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ViewId) -> bool {
        matches!(self.views.get(id.0), Some(Some(_)))
    }

    pub fn view(&self, id: ViewId) -> PointCloudResult<&FilterView> {
        self.views
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| PointCloudError::not_found(format!("view {}", id.0)))
    }

    fn view_mut(&mut self, id: ViewId) -> PointCloudResult<&mut FilterView> {
        self.views
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| PointCloudError::not_found(format!("view {}", id.0)))
    }

    fn insert(&mut self, view: FilterView) -> ViewId {
        self.views.push(Some(view));
        ViewId(self.views.len() - 1)
    }

    /// A new unfiltered root view.
    pub fn create_view(&mut self) -> ViewId {
        self.insert(FilterView::default())
    }

    pub fn make_child_view(&mut self, parent: ViewId) -> PointCloudResult<ViewId> {
        self.view(parent)?;
        let child = self.insert(FilterView {
            parent: Some(parent),
            ..FilterView::default()
        });
        self.view_mut(parent)?.children.push(child);
        Ok(child)
    }

    /// Removes `child` and everything below it from `parent`.
    pub fn remove_child_view(&mut self, parent: ViewId, child: ViewId) -> PointCloudResult<()> {
        let siblings = &mut self.view_mut(parent)?.children;
        let Some(position) = siblings.iter().position(|id| *id == child) else {
            return Err(PointCloudError::not_found(format!(
                "view {} is not a child of view {}",
                child.0, parent.0
            )));
        };
        siblings.remove(position);
        self.drop_subtree(child);
        Ok(())
    }

    /// Removes every descendant of `id`.
    pub fn clear_child_views(&mut self, id: ViewId) -> PointCloudResult<()> {
        let children = std::mem::take(&mut self.view_mut(id)?.children);
        for child in children {
            self.drop_subtree(child);
        }
        Ok(())
    }

    /// Removes `id` and its descendants, detaching it from its parent.
    pub fn remove_view(&mut self, id: ViewId) -> PointCloudResult<()> {
        match self.view(id)?.parent {
            Some(parent) => self.remove_child_view(parent, id),
            None => {
                self.drop_subtree(id);
                Ok(())
            }
        }
    }

    fn drop_subtree(&mut self, id: ViewId) {
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Some(view) = self.views.get_mut(next.0).and_then(Option::take) {
                pending.extend(view.children);
            }
        }
    }

    fn invalidate_hashes(&mut self, id: ViewId) {
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Ok(view) = self.view_mut(next) {
                view.cached_hash = None;
                pending.extend(view.children.iter().copied());
            }
        }
    }

    /// Appends `fragment` unless it is empty or repeats this view's last fragment.
    pub fn add_filter(&mut self, id: ViewId, fragment: impl Into<String>) -> PointCloudResult<()> {
        let fragment = fragment.into();
        let view = self.view_mut(id)?;
        if fragment.trim().is_empty() || view.filters.last() == Some(&fragment) {
            return Ok(());
        }
        view.filters.push(fragment);
        self.invalidate_hashes(id);
        Ok(())
    }

    fn add_optional(&mut self, id: ViewId, fragment: Option<String>) -> PointCloudResult<()> {
        match fragment {
            Some(fragment) => self.add_filter(id, fragment),
            None => {
                self.view(id)?;
                Ok(())
            }
        }
    }

    pub fn clear_filters(&mut self, id: ViewId) -> PointCloudResult<()> {
        self.view_mut(id)?.filters.clear();
        self.invalidate_hashes(id);
        Ok(())
    }

    /// Ancestors' fragments first, then this view's own.
    pub fn effective_filters(&self, id: ViewId) -> PointCloudResult<Vec<String>> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let view = self.view(current)?;
            chain.push(current);
            cursor = view.parent;
        }
        let mut filters = Vec::new();
        for current in chain.into_iter().rev() {
            filters.extend(self.view(current)?.filters.iter().cloned());
        }
        Ok(filters)
    }

    pub fn state(&self, id: ViewId) -> PointCloudResult<ViewState> {
        Ok(if self.effective_filters(id)?.is_empty() {
            ViewState::Unfiltered
        } else {
            ViewState::Filtered
        })
    }

    pub fn filter_count(&self, id: ViewId) -> PointCloudResult<usize> {
        Ok(self.effective_filters(id)?.len())
    }

    pub fn filter_on_metadata(
        &mut self,
        id: ViewId,
        key: &str,
        value: &str,
        mode: FilterMode,
    ) -> PointCloudResult<()> {
        self.add_optional(id, filter::metadata(key, value, mode))
    }

    pub fn filter_on_metadata_pattern(
        &mut self,
        id: ViewId,
        key: &str,
        pattern: &str,
        mode: FilterMode,
    ) -> PointCloudResult<()> {
        self.add_optional(id, filter::metadata_pattern(key, pattern, mode))
    }

    pub fn filter_on_point_expression(
        &mut self,
        id: ViewId,
        expression: &str,
        mode: FilterMode,
    ) -> PointCloudResult<()> {
        self.add_filter(id, filter::point_expression(expression, mode))
    }

    pub fn filter_on_bounding_box(
        &mut self,
        id: ViewId,
        bounds: &BoundingBox,
        invert: bool,
    ) -> PointCloudResult<()> {
        self.add_optional(id, filter::bounding_box(bounds, invert))
    }

    pub fn filter_on_oriented_bounding_box(
        &mut self,
        id: ViewId,
        obb: &OrientedBox,
        invert: bool,
    ) -> PointCloudResult<()> {
        self.add_optional(id, filter::oriented_box(obb, invert))
    }

    pub fn filter_on_tile(
        &mut self,
        id: ViewId,
        grid: &BoundingBox,
        counts: [i32; 3],
        tile: [i32; 3],
        invert: bool,
    ) -> PointCloudResult<()> {
        self.add_optional(id, filter::tile(grid, counts, tile, invert))
    }

    /// Tiles the current result bounds of the view.
    pub fn filter_on_result_tile(
        &mut self,
        store: &PointCloudStore,
        id: ViewId,
        counts: [i32; 3],
        tile: [i32; 3],
        invert: bool,
    ) -> PointCloudResult<()> {
        match self.bounding_box(store, id)? {
            Some(grid) => self.filter_on_tile(id, &grid, counts, tile, invert),
            None => {
                log::warn!("pointcloud view: cannot tile an empty result");
                Ok(())
            }
        }
    }

    pub fn filter_on_bounding_sphere(
        &mut self,
        id: ViewId,
        center: Vec3,
        radius: f64,
    ) -> PointCloudResult<()> {
        self.add_optional(id, filter::bounding_sphere(center, radius))
    }

    pub fn filter_on_range(&mut self, id: ViewId, start: i64, end: i64) -> PointCloudResult<()> {
        self.add_optional(id, filter::range(start, end))
    }

    pub fn filter_on_index(&mut self, id: ViewId, index: i64) -> PointCloudResult<()> {
        self.add_filter(id, filter::index(index))
    }

    /// Materializes the view's filters and returns the result table, or `None` when the
    /// view is unfiltered and therefore selects the whole store.
    pub fn materialize(&self, store: &PointCloudStore, id: ViewId) -> PointCloudResult<Option<String>> {
        let filters = self.effective_filters(id)?;
        if filters.is_empty() {
            log::warn!("pointcloud view: view {} has no filters to materialize", id.0);
            return Ok(None);
        }
        store.with_composer(|composer| {
            let table = composer.materialize_conjunction(&filters)?;
            if let Some(table) = &table {
                let _pin = composer.cache().pin(table);
                composer.trim_cache();
            }
            Ok(table)
        })
    }

    /// Runs `func` against the materialized result of `id`, kept pinned for the duration.
    /// The cache is trimmed back to capacity once the pin releases.
    fn with_result<T>(
        &self,
        store: &PointCloudStore,
        id: ViewId,
        func: impl FnOnce(&QueryComposer<'_>, Option<&str>) -> PointCloudResult<T>,
    ) -> PointCloudResult<T> {
        let filters = self.effective_filters(id)?;
        store.with_composer(|composer| {
            let table = composer.materialize_conjunction(&filters)?;
            let result = {
                let _pin = table.as_deref().map(|table| composer.cache().pin(table));
                func(composer, table.as_deref())
            };
            composer.trim_cache();
            result
        })
    }

    pub fn count(&self, store: &PointCloudStore, id: ViewId) -> PointCloudResult<i64> {
        self.with_result(store, id, |composer, table| {
            let sql = match table {
                Some(table) => format!("SELECT COUNT(*) FROM {table}"),
                None => "SELECT COUNT(*) FROM Vertex".to_string(),
            };
            composer
                .connection()
                .query_row(&sql, [], |row| row.get(0))
                .map_err(|err| read_error(&sql, err))
        })
    }

    /// Bounds of the selected points, `None` when nothing is selected.
    pub fn bounding_box(
        &self,
        store: &PointCloudStore,
        id: ViewId,
    ) -> PointCloudResult<Option<BoundingBox>> {
        if self.effective_filters(id)?.is_empty() {
            return store.bounds();
        }
        self.with_result(store, id, |composer, table| {
            let Some(table) = table else {
                return Ok(None);
            };
            let sql = format!(
                "SELECT MIN(Minx), MIN(Miny), MIN(Minz), MAX(Maxx), MAX(Maxy), MAX(Maxz) \
                 FROM {SPATIAL_INDEX} INNER JOIN {table} ON {SPATIAL_INDEX}.Id = {table}.Id"
            );
            composer
                .connection()
                .query_row(&sql, [], |row| {
                    let mut corners = [0.0; 6];
                    for (index, corner) in corners.iter_mut().enumerate() {
                        match row.get::<_, Option<f64>>(index)? {
                            Some(value) => *corner = value,
                            None => return Ok(None),
                        }
                    }
                    Ok(Some(BoundingBox::new(
                        Vec3::new(corners[0], corners[1], corners[2]),
                        Vec3::new(corners[3], corners[4], corners[5]),
                    )))
                })
                .map_err(|err| read_error(&sql, err))
        })
    }

    /// Selected points strictly inside `bounds`.
    pub fn count_in_box(
        &self,
        store: &PointCloudStore,
        id: ViewId,
        bounds: &BoundingBox,
    ) -> PointCloudResult<i64> {
        let (min, max) = (bounds.min, bounds.max);
        let predicate = format!(
            "({SPATIAL_INDEX}.Minx>{} AND {SPATIAL_INDEX}.Maxx<{}) AND ({SPATIAL_INDEX}.Miny>{} AND {SPATIAL_INDEX}.Maxy<{}) \
             AND ({SPATIAL_INDEX}.Minz>{} AND {SPATIAL_INDEX}.Maxz<{})",
            min.x, max.x, min.y, max.y, min.z, max.z
        );
        self.with_result(store, id, |composer, table| {
            let sql = match table {
                Some(table) => format!(
                    "SELECT COUNT({table}.Id) FROM {table} INNER JOIN {SPATIAL_INDEX} \
                     ON {table}.Id = {SPATIAL_INDEX}.Id WHERE {predicate}"
                ),
                None => format!("SELECT COUNT({SPATIAL_INDEX}.Id) FROM {SPATIAL_INDEX} WHERE {predicate}"),
            };
            composer
                .connection()
                .query_row(&sql, [], |row| row.get(0))
                .map_err(|err| read_error(&sql, err))
        })
    }

    pub fn unique_attribute_values(
        &self,
        store: &PointCloudStore,
        id: ViewId,
        key: &str,
    ) -> PointCloudResult<Vec<String>> {
        require_key(key)?;
        let key_literal = quote_literal(key);
        self.with_result(store, id, |composer, table| {
            let sql = match table {
                Some(table) => format!(
                    "SELECT DISTINCT Attribute_Value FROM {METADATA_VIEW} INNER JOIN {table} \
                     ON {METADATA_VIEW}.Vertex_Id = {table}.Id WHERE Attribute_Name={key_literal}"
                ),
                None => format!(
                    "SELECT DISTINCT Attribute_Value FROM {METADATA_VIEW} WHERE Attribute_Name={key_literal}"
                ),
            };
            texts(composer, &sql)
        })
    }

    /// Number of selected points carrying each value of `key`.
    pub fn attribute_value_counts(
        &self,
        store: &PointCloudStore,
        id: ViewId,
        key: &str,
    ) -> PointCloudResult<BTreeMap<String, i64>> {
        require_key(key)?;
        self.with_result(store, id, |composer, table| {
            let lookup = composer.materialize_attribute_lookup(key)?;
            let (source, source_id) = spatial_source(table);
            let sql = format!(
                "SELECT AttributeValues.Value, COUNT({lookup}.ValueId) FROM {source} \
                 INNER JOIN {lookup} ON {source}.{source_id} = {lookup}.Id \
                 JOIN AttributeValues ON {lookup}.ValueId = AttributeValues.rowid \
                 GROUP BY {lookup}.ValueId"
            );
            let pairs = query_decoded(
                composer.connection(),
                &sql,
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                &[&Decoder::Text, &Decoder::Int],
            )?;
            Ok(pairs.into_iter().collect())
        })
    }

    /// Counts of every combination of values of `keys` among the selected points.
    pub fn attribute_value_counts_multi(
        &self,
        store: &PointCloudStore,
        id: ViewId,
        keys: &[&str],
    ) -> PointCloudResult<Vec<ValueCombination>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        require_distinct(keys)?;
        self.with_result(store, id, |composer, table| {
            let (from, values) = attribute_joins(composer, table, keys, false)?;
            let lookups = from.lookups.join(", ");
            let sql = format!("SELECT {values}, COUNT(*) {} GROUP BY {lookups}", from.clause);
            let decoder = Decoder::sequence(Decoder::Text, keys.len());
            query_decoded(
                composer.connection(),
                &sql,
                |row| {
                    let values = decoder
                        .decode(row, 0)?
                        .into_sequence()
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(Decoded::into_text)
                        .collect();
                    let count = row.get::<_, i64>(keys.len())?;
                    Ok(ValueCombination { values, count })
                },
                &[&decoder, &Decoder::Int],
            )
        })
    }

    /// Value of `key` for each selected point that has one, by point id.
    pub fn attribute_values(
        &self,
        store: &PointCloudStore,
        id: ViewId,
        key: &str,
    ) -> PointCloudResult<BTreeMap<i64, String>> {
        require_key(key)?;
        self.with_result(store, id, |composer, table| {
            let sql = match table {
                Some(table) => {
                    let lookup = composer.materialize_attribute_lookup(key)?;
                    format!(
                        "SELECT {table}.Id, AttributeValues.Value FROM {table} \
                         INNER JOIN {lookup} ON {table}.Id = {lookup}.Id \
                         JOIN AttributeValues ON {lookup}.ValueId = AttributeValues.rowid"
                    )
                }
                None => format!(
                    "SELECT Vertex_Id, Attribute_Value FROM {METADATA_VIEW} WHERE Attribute_Name={}",
                    quote_literal(key)
                ),
            };
            let pairs = query_decoded(
                composer.connection(),
                &sql,
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                &[&Decoder::Int, &Decoder::Text],
            )?;
            Ok(pairs.into_iter().collect())
        })
    }

    fn attribute_column(
        &self,
        store: &PointCloudStore,
        id: ViewId,
        key: &str,
        decoder: &Decoder,
    ) -> PointCloudResult<Vec<Decoded>> {
        require_key(key)?;
        self.with_result(store, id, |composer, table| {
            let sql = match table {
                Some(table) => {
                    let lookup = composer.materialize_attribute_lookup(key)?;
                    format!(
                        "SELECT AttributeValues.Value FROM {table} \
                         INNER JOIN {lookup} ON {table}.Id = {lookup}.Id \
                         JOIN AttributeValues ON {lookup}.ValueId = AttributeValues.rowid"
                    )
                }
                None => format!(
                    "SELECT Attribute_Value FROM {METADATA_VIEW} WHERE Attribute_Name={}",
                    quote_literal(key)
                ),
            };
            query_decoded(
                composer.connection(),
                &sql,
                |row| decoder.decode(row, 0),
                &[decoder],
            )
        })
    }

    /// Values of `key` read as integers; text that does not parse reads as 0.
    pub fn attribute_values_as_int(
        &self,
        store: &PointCloudStore,
        id: ViewId,
        key: &str,
    ) -> PointCloudResult<Vec<i64>> {
        Ok(self
            .attribute_column(store, id, key, &Decoder::Int)?
            .iter()
            .filter_map(Decoded::as_int)
            .collect())
    }

    pub fn attribute_values_as_float(
        &self,
        store: &PointCloudStore,
        id: ViewId,
        key: &str,
    ) -> PointCloudResult<Vec<f64>> {
        Ok(self
            .attribute_column(store, id, key, &Decoder::Float)?
            .iter()
            .filter_map(Decoded::as_float)
            .collect())
    }

    /// Every key and value attached to `point`; empty for an unknown id.
    pub fn metadata_for_point(
        &self,
        store: &PointCloudStore,
        id: ViewId,
        point: i64,
    ) -> PointCloudResult<BTreeMap<String, String>> {
        self.view(id)?;
        let sql = format!(
            "SELECT Attribute_Name, Attribute_Value FROM {METADATA_VIEW} WHERE Vertex_Id={point}"
        );
        store.with_connection(|conn| {
            let pairs = query_decoded(
                conn,
                &sql,
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                &[&Decoder::Text, &Decoder::Text],
            )?;
            Ok(pairs.into_iter().collect())
        })
    }

    /// Ids of the selected points.
    pub fn indexes(&self, store: &PointCloudStore, id: ViewId) -> PointCloudResult<Vec<i64>> {
        self.with_result(store, id, |composer, table| {
            let sql = match table {
                Some(table) => format!("SELECT Id FROM {table} ORDER BY Id"),
                None => "SELECT rowid AS Id FROM Vertex ORDER BY rowid".to_string(),
            };
            query_decoded(
                composer.connection(),
                &sql,
                |row| row.get::<_, i64>(0),
                &[&Decoder::Int],
            )
        })
    }

    pub fn transforms(&self, store: &PointCloudStore, id: ViewId) -> PointCloudResult<Vec<Transform>> {
        self.with_result(store, id, |composer, table| {
            let sql = match table {
                Some(table) => format!(
                    "SELECT {TRANSFORM_COLUMNS} FROM {table} INNER JOIN Vertex ON {table}.Id = Vertex.rowid \
                     ORDER BY {table}.Id"
                ),
                None => format!("SELECT {TRANSFORM_COLUMNS} FROM Vertex"),
            };
            let decoded = query_decoded(
                composer.connection(),
                &sql,
                |row| Decoder::Transform.decode(row, 0),
                &[&Decoder::Transform],
            )?;
            Ok(decoded.iter().filter_map(Decoded::as_transform).collect())
        })
    }

    pub fn per_point_transforms(
        &self,
        store: &PointCloudStore,
        id: ViewId,
    ) -> PointCloudResult<Vec<(i64, Transform)>> {
        self.with_result(store, id, |composer, table| {
            let sql = match table {
                Some(table) => format!(
                    "SELECT {table}.Id, {TRANSFORM_COLUMNS} FROM {table} INNER JOIN Vertex ON {table}.Id = Vertex.rowid \
                     ORDER BY {table}.Id"
                ),
                None => format!("SELECT rowid AS Id, {TRANSFORM_COLUMNS} FROM Vertex"),
            };
            query_decoded(
                composer.connection(),
                &sql,
                |row| {
                    let transform = Decoder::Transform
                        .decode(row, 1)?
                        .as_transform()
                        .unwrap_or(Transform::IDENTITY);
                    Ok((row.get::<_, i64>(0)?, transform))
                },
                &[&Decoder::Int, &Decoder::Transform],
            )
        })
    }

    /// Digest of the selected ids; the store hash for an unfiltered view.
    ///
    /// Cached on the view until its filters or an ancestor's change, or the store itself
    /// changes.
    pub fn content_hash(&mut self, store: &PointCloudStore, id: ViewId) -> PointCloudResult<ContentHash> {
        let store_hash = store.hash()?;
        if let Some((computed_against, digest)) = self.view(id)?.cached_hash {
            if computed_against == store_hash {
                return Ok(digest);
            }
        }
        let digest = self.with_result(store, id, |composer, table| match table {
            Some(table) => {
                composer.diagnostics().hash_computed();
                hash_query_result(composer.connection(), &format!("SELECT * FROM {table}"), false)
            }
            None => Ok(store_hash),
        })?;
        self.view_mut(id)?.cached_hash = Some((store_hash, digest));
        Ok(digest)
    }

    /// Digest over the values of `keys` and the transform of every selected point carrying
    /// all of them.
    pub fn values_and_transforms_hash(
        &self,
        store: &PointCloudStore,
        id: ViewId,
        keys: &[&str],
    ) -> PointCloudResult<ContentHash> {
        if keys.is_empty() {
            return Err(PointCloudError::invalid("no attribute keys to hash"));
        }
        require_distinct(keys)?;
        self.with_result(store, id, |composer, table| {
            let (from, values) = attribute_joins(composer, table, keys, true)?;
            let sql = format!("SELECT {values}, {TRANSFORM_COLUMNS} {}", from.clause);
            composer.diagnostics().hash_computed();
            hash_query_result(composer.connection(), &sql, false)
        })
    }
}

fn require_key(key: &str) -> PointCloudResult<()> {
    if key.is_empty() {
        log::warn!("pointcloud view: attribute key is empty");
        return Err(PointCloudError::invalid("attribute key is empty"));
    }
    Ok(())
}

fn require_distinct(keys: &[&str]) -> PointCloudResult<()> {
    let unique: HashSet<&str> = keys.iter().copied().collect();
    if unique.len() != keys.len() {
        log::error!("pointcloud view: duplicate attribute keys {keys:?}");
        return Err(PointCloudError::invalid("attribute keys must be distinct"));
    }
    Ok(())
}

fn texts(composer: &QueryComposer<'_>, sql: &str) -> PointCloudResult<Vec<String>> {
    query_decoded(
        composer.connection(),
        sql,
        |row| row.get::<_, String>(0),
        &[&Decoder::Text],
    )
}

/// Table and id column to join attribute lookups against.
fn spatial_source(table: Option<&str>) -> (&str, &'static str) {
    match table {
        Some(table) => (table, "Id"),
        None => ("Vertex", "rowid"),
    }
}

struct AttributeJoin {
    clause: String,
    lookups: Vec<String>,
}

/// `FROM` clause joining the selection to one lookup table and one `AttributeValues`
/// alias (`AT1`, `AT2`, ..) per key, plus the matching value projection.
fn attribute_joins(
    composer: &QueryComposer<'_>,
    table: Option<&str>,
    keys: &[&str],
    with_vertex: bool,
) -> PointCloudResult<(AttributeJoin, String)> {
    let mut lookups = Vec::with_capacity(keys.len());
    let mut pins = Vec::with_capacity(keys.len());
    for key in keys {
        let lookup = composer.materialize_attribute_lookup(key)?;
        pins.push(composer.cache().pin(&lookup));
        lookups.push(lookup);
    }
    let (source, source_id) = spatial_source(table);
    let mut clause = format!("FROM {source} ");
    if with_vertex && table.is_some() {
        clause.push_str(&format!("INNER JOIN Vertex ON {source}.Id = Vertex.rowid "));
    }
    for lookup in &lookups {
        clause.push_str(&format!(
            "INNER JOIN {lookup} ON {source}.{source_id} = {lookup}.Id "
        ));
    }
    for (index, lookup) in lookups.iter().enumerate() {
        let alias = index + 1;
        clause.push_str(&format!(
            "JOIN AttributeValues AS AT{alias} ON {lookup}.ValueId = AT{alias}.rowid "
        ));
    }
    let values = (1..=keys.len())
        .map(|alias| format!("AT{alias}.Value"))
        .collect::<Vec<_>>()
        .join(", ");
    let lookups = lookups
        .iter()
        .map(|lookup| format!("{lookup}.ValueId"))
        .collect();
    Ok((AttributeJoin { clause, lookups }, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pointcloud_core::PointBatch;

    fn store_with_grid() -> PointCloudStore {
        let store = PointCloudStore::open_in_memory().expect("open");
        let mut batch = PointBatch::new("grid");
        for i in 0..10 {
            let kind = if i % 2 == 0 { "even" } else { "odd" };
            let size = (i % 3).to_string();
            batch.push_point(
                Transform::from_translation(Vec3::new(i as f64, 0.0, 0.0)),
                [("kind", kind), ("size", size.as_str())],
            );
        }
        store.bulk_insert(&batch).expect("insert");
        store
    }

    #[test]
    fn add_filter_skips_empty_and_repeated_fragments() {
        let mut views = ViewArena::new();
        let view = views.create_view();
        views.add_filter(view, "").expect("empty");
        views.filter_on_index(view, 3).expect("first");
        views.filter_on_index(view, 3).expect("repeat");
        assert_eq!(views.view(view).expect("view").own_filters().len(), 1);
        assert_eq!(views.state(view).expect("state"), ViewState::Filtered);
        views.clear_filters(view).expect("clear");
        assert_eq!(views.state(view).expect("state"), ViewState::Unfiltered);
    }

    #[test]
    fn children_inherit_parent_filters() {
        let mut views = ViewArena::new();
        let parent = views.create_view();
        views.filter_on_range(parent, 1, 5).expect("range");
        let child = views.make_child_view(parent).expect("child");
        views.filter_on_index(child, 3).expect("index");
        assert_eq!(
            views.effective_filters(child).expect("filters"),
            vec![
                filter::range(1, 5).expect("range"),
                filter::index(3)
            ]
        );
        assert_eq!(views.filter_count(child).expect("count"), 2);
    }

    #[test]
    fn removing_a_child_removes_its_subtree() {
        let mut views = ViewArena::new();
        let root = views.create_view();
        let child = views.make_child_view(root).expect("child");
        let grandchild = views.make_child_view(child).expect("grandchild");
        let other = views.make_child_view(root).expect("other");
        views.remove_child_view(root, child).expect("remove");
        assert!(!views.contains(child));
        assert!(!views.contains(grandchild));
        assert!(views.contains(other));
        assert!(matches!(
            views.add_filter(grandchild, "SELECT 1"),
            Err(PointCloudError::NotFound { .. })
        ));
        assert!(views.remove_child_view(root, child).is_err());
        views.clear_child_views(root).expect("clear");
        assert_eq!(views.len(), 1);
        views.remove_view(root).expect("remove root");
        assert!(views.is_empty());
    }

    #[test]
    fn reads_respect_filters() {
        let store = store_with_grid();
        let mut views = ViewArena::new();
        let view = views.create_view();
        assert_eq!(views.count(&store, view).expect("count"), 10);
        views
            .filter_on_metadata(view, "kind", "even", FilterMode::Or)
            .expect("filter");
        assert_eq!(views.count(&store, view).expect("count"), 5);
        assert_eq!(views.indexes(&store, view).expect("ids"), vec![1, 3, 5, 7, 9]);
        let bounds = views
            .bounding_box(&store, view)
            .expect("bounds")
            .expect("non-empty");
        assert_eq!(bounds.min.x, 0.0);
        assert_eq!(bounds.max.x, 8.0);
        let counts = views
            .attribute_value_counts(&store, view, "size")
            .expect("counts");
        assert_eq!(counts.get("0"), Some(&2));
        assert_eq!(counts.get("1"), Some(&1));
        assert_eq!(counts.get("2"), Some(&2));
        assert_eq!(
            views
                .attribute_values_as_int(&store, view, "size")
                .expect("ints")
                .iter()
                .sum::<i64>(),
            5
        );
        let transforms = views.per_point_transforms(&store, view).expect("transforms");
        assert_eq!(transforms[1].0, 3);
        assert_eq!(transforms[1].1.translation, Vec3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn negated_metadata_and_empty_results() {
        let store = store_with_grid();
        let mut views = ViewArena::new();
        let view = views.create_view();
        views
            .filter_on_metadata(view, "kind", "even", FilterMode::Not)
            .expect("filter");
        assert_eq!(views.count(&store, view).expect("count"), 5);
        views
            .filter_on_metadata(view, "kind", "even", FilterMode::And)
            .expect("filter");
        assert_eq!(views.count(&store, view).expect("count"), 0);
        assert_eq!(views.bounding_box(&store, view).expect("bounds"), None);
        assert!(views.transforms(&store, view).expect("transforms").is_empty());
    }

    #[test]
    fn multi_key_counts_group_combinations() {
        let store = store_with_grid();
        let mut views = ViewArena::new();
        let view = views.create_view();
        let combos = views
            .attribute_value_counts_multi(&store, view, &["kind", "size"])
            .expect("combos");
        let total: i64 = combos.iter().map(|combo| combo.count).sum();
        assert_eq!(total, 10);
        assert!(combos.contains(&ValueCombination {
            values: vec!["even".to_string(), "0".to_string()],
            count: 2,
        }));
        assert!(matches!(
            views.attribute_value_counts_multi(&store, view, &["kind", "kind"]),
            Err(PointCloudError::Validation { .. })
        ));
        views.filter_on_range(view, 1, 4).expect("range");
        let combos = views
            .attribute_value_counts_multi(&store, view, &["size"])
            .expect("combos");
        assert_eq!(combos.iter().map(|combo| combo.count).sum::<i64>(), 4);
    }

    #[test]
    fn spatial_filters_select_expected_points() {
        let store = store_with_grid();
        let mut views = ViewArena::new();
        let sphere = views.create_view();
        views
            .filter_on_bounding_sphere(sphere, Vec3::new(4.0, 0.0, 0.0), 1.5)
            .expect("sphere");
        assert_eq!(views.indexes(&store, sphere).expect("ids"), vec![4, 5, 6]);

        let boxed = views.create_view();
        let bounds = BoundingBox::new(Vec3::new(2.0, -1.0, -1.0), Vec3::new(4.0, 1.0, 1.0));
        views.filter_on_bounding_box(boxed, &bounds, false).expect("box");
        assert_eq!(views.indexes(&store, boxed).expect("ids"), vec![3, 4, 5]);

        let untouched = views.create_view();
        views
            .filter_on_bounding_box(
                untouched,
                &BoundingBox::new(Vec3::ZERO, Vec3::new(f64::NAN, 1.0, 1.0)),
                false,
            )
            .expect("ignored box");
        views
            .filter_on_bounding_sphere(untouched, Vec3::ZERO, f64::INFINITY)
            .expect("ignored sphere");
        assert_eq!(views.filter_count(untouched).expect("filters"), 0);
        assert_eq!(views.count(&store, untouched).expect("count"), 10);
        assert_eq!(views.count_in_box(&store, boxed, &bounds).expect("strict"), 1);

        let tile = views.create_view();
        views
            .filter_on_result_tile(&store, tile, [3, 1, 1], [0, 0, 0], false)
            .expect("tile");
        assert_eq!(views.indexes(&store, tile).expect("ids"), vec![1, 2, 3, 4]);
    }

    #[test]
    fn content_hash_is_cached_and_tracks_filters() {
        let store = store_with_grid();
        let mut views = ViewArena::new();
        let view = views.create_view();
        assert_eq!(
            views.content_hash(&store, view).expect("hash"),
            store.hash().expect("store hash")
        );
        views.filter_on_range(view, 1, 3).expect("range");
        let first = views.content_hash(&store, view).expect("hash");
        let computed = store.diagnostics().hash_computations();
        assert_eq!(views.content_hash(&store, view).expect("cached"), first);
        assert_eq!(store.diagnostics().hash_computations(), computed);

        let other = views.create_view();
        views.filter_on_range(other, 1, 3).expect("range");
        assert_eq!(views.content_hash(&store, other).expect("hash"), first);
    }

    #[test]
    fn values_and_transforms_hash_rejects_bad_keys() {
        let store = store_with_grid();
        let mut views = ViewArena::new();
        let view = views.create_view();
        assert!(views.values_and_transforms_hash(&store, view, &[]).is_err());
        assert!(
            views
                .values_and_transforms_hash(&store, view, &["kind", "kind"])
                .is_err()
        );
        let all = views
            .values_and_transforms_hash(&store, view, &["kind"])
            .expect("hash");
        views.filter_on_range(view, 1, 2).expect("range");
        let some = views
            .values_and_transforms_hash(&store, view, &["kind"])
            .expect("hash");
        assert_ne!(all, some);
        assert!(matches!(
            views.values_and_transforms_hash(&store, view, &["missing"]),
            Err(PointCloudError::NotFound { .. })
        ));
    }
}
