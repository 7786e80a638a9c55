//! Builders for the predicate fragments a view stacks up.
//!
//! Every fragment is a complete `SELECT` yielding an `Id` column of vertex row ids, so any
//! two of them can be intersected. Builders return `None` (after a warning) when their
//! arguments cannot describe a selection; the view then leaves its filters unchanged.

use serde::{Deserialize, Serialize};

use pointcloud_core::{BoundingBox, OrientedBox, Vec3};

use crate::composer::quote_literal;
use crate::schema::{METADATA_VIEW, SPATIAL_INDEX};

/// Relative widening applied to query boxes so points stored at the exact boundary survive
/// the float32 rounding of the spatial index.
const BOX_IOTA: f64 = 1.0e-6;

/// How a predicate is applied. Only `Not` changes the fragment; fragments on a view are
/// always combined conjunctively.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterMode {
    #[default]
    Or,
    And,
    Not,
}

impl FilterMode {
    pub fn negates(self) -> bool {
        self == FilterMode::Not
    }
}

pub fn all_points() -> String {
    format!("SELECT Id FROM {SPATIAL_INDEX}")
}

pub fn metadata(key: &str, value: &str, mode: FilterMode) -> Option<String> {
    if key.is_empty() {
        log::warn!("pointcloud view: metadata filter needs a key");
        return None;
    }
    let predicate = format!("Attribute_Value={}", quote_literal(value));
    Some(metadata_fragment(key, &predicate, mode))
}

pub fn metadata_pattern(key: &str, pattern: &str, mode: FilterMode) -> Option<String> {
    if key.is_empty() {
        log::warn!("pointcloud view: metadata pattern filter needs a key");
        return None;
    }
    if pattern.is_empty() {
        log::warn!("pointcloud view: metadata pattern for '{key}' is empty");
        return None;
    }
    let predicate = format!("Attribute_Value GLOB({})", quote_literal(pattern));
    Some(metadata_fragment(key, &predicate, mode))
}

fn metadata_fragment(key: &str, predicate: &str, mode: FilterMode) -> String {
    let predicate = if mode.negates() {
        format!("NOT({predicate})")
    } else {
        predicate.to_string()
    };
    format!(
        "SELECT Vertex_Id AS Id FROM {METADATA_VIEW} WHERE Attribute_Name={} AND {predicate}",
        quote_literal(key)
    )
}

/// Free-form predicate over the spatial index columns (`Id`, `Minx` .. `Maxz`).
pub fn point_expression(expression: &str, mode: FilterMode) -> String {
    let expression = expression.trim();
    if expression.is_empty() {
        return all_points();
    }
    if mode.negates() {
        format!("SELECT Id FROM {SPATIAL_INDEX} WHERE NOT( {expression})")
    } else {
        format!("SELECT Id FROM {SPATIAL_INDEX} WHERE {expression}")
    }
}

fn widen(value: f64, direction: f64) -> f64 {
    value * (1.0 + direction * value.signum() * BOX_IOTA)
}

pub fn bounding_box(bounds: &BoundingBox, invert: bool) -> Option<String> {
    if !bounds.min.is_finite() || !bounds.max.is_finite() {
        log::warn!("pointcloud view: ignoring non-finite box {bounds:?}");
        return None;
    }
    let min = Vec3::new(
        widen(bounds.min.x, -1.0),
        widen(bounds.min.y, -1.0),
        widen(bounds.min.z, -1.0),
    );
    let max = Vec3::new(
        widen(bounds.max.x, 1.0),
        widen(bounds.max.y, 1.0),
        widen(bounds.max.z, 1.0),
    );
    Some(if invert {
        format!(
            "SELECT Id FROM {SPATIAL_INDEX} WHERE (Minx<{} OR Maxx>{}) OR (Miny<{} OR Maxy>{}) OR (Minz<{} OR Maxz>{})",
            min.x, max.x, min.y, max.y, min.z, max.z
        )
    } else {
        format!(
            "SELECT Id FROM {SPATIAL_INDEX} WHERE (Minx>={} AND Maxx<={}) AND (Miny>={} AND Maxy<={}) AND (Minz>={} AND Maxz<={})",
            min.x, max.x, min.y, max.y, min.z, max.z
        )
    })
}

pub fn oriented_box(obb: &OrientedBox, invert: bool) -> Option<String> {
    if !obb.is_valid() {
        log::warn!("pointcloud view: ignoring invalid oriented box {obb:?}");
        return None;
    }
    let (r, t, s) = (obb.rotation, obb.translation, obb.scale);
    Some(format!(
        "SELECT Id FROM {SPATIAL_INDEX} WHERE {}IN_OBB({}, {}, {}, {}, {}, {}, {}, {}, {}, Minx, Miny, Minz)",
        if invert { "NOT " } else { "" },
        r.pitch,
        r.yaw,
        r.roll,
        t.x,
        t.y,
        t.z,
        s.x,
        s.y,
        s.z
    ))
}

/// Box of cell `tile` when `grid` is cut into `counts` equal cells per axis.
pub fn tile_bounds(grid: &BoundingBox, counts: [i32; 3], tile: [i32; 3]) -> Option<BoundingBox> {
    if counts.iter().any(|count| *count <= 0) {
        log::warn!("pointcloud view: invalid tile counts {counts:?}");
        return None;
    }
    let as_vec = |values: [i32; 3]| {
        Vec3::new(
            f64::from(values[0]),
            f64::from(values[1]),
            f64::from(values[2]),
        )
    };
    let size = grid.size().component_div_safe(as_vec(counts));
    let min = grid.min + size.component_mul(as_vec(tile));
    let max = grid.min + size.component_mul(as_vec(tile.map(|index| index + 1)));
    Some(BoundingBox::new(min, max))
}

pub fn tile(grid: &BoundingBox, counts: [i32; 3], tile: [i32; 3], invert: bool) -> Option<String> {
    tile_bounds(grid, counts, tile).and_then(|cell| bounding_box(&cell, invert))
}

pub fn bounding_sphere(center: Vec3, radius: f64) -> Option<String> {
    if !center.is_finite() || !radius.is_finite() || radius < 0.0 {
        log::warn!("pointcloud view: ignoring sphere at {center:?} with radius {radius}");
        return None;
    }
    // The index prefilter compares the rounded-up max and rounded-down min so no point
    // inside the sphere is lost to float32 storage.
    Some(format!(
        "SELECT Id FROM {SPATIAL_INDEX} WHERE Maxx>={} AND Minx<={} AND Maxy>={} AND Miny<={} AND Maxz>={} AND Minz<={} \
         AND IN_SPHERE({}, {}, {}, {}, Minx, Miny, Minz)>0",
        center.x - radius,
        center.x + radius,
        center.y - radius,
        center.y + radius,
        center.z - radius,
        center.z + radius,
        center.x,
        center.y,
        center.z,
        radius
    ))
}

/// Inclusive id range; `-1, -1` selects everything.
pub fn range(start: i64, end: i64) -> Option<String> {
    if end < start {
        log::warn!("pointcloud view: range end {end} is before start {start}");
        return None;
    }
    Some(if start == -1 && end == -1 {
        all_points()
    } else if start == end {
        format!("SELECT Id FROM {SPATIAL_INDEX} WHERE Id={start}")
    } else {
        format!("SELECT Id FROM {SPATIAL_INDEX} WHERE Id>={start} AND Id<={end}")
    })
}

/// A single id; `-1` selects everything.
pub fn index(index: i64) -> String {
    if index == -1 {
        all_points()
    } else {
        format!("SELECT Id FROM {SPATIAL_INDEX} WHERE Id={index}")
    }
}
