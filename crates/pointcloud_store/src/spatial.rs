//! Geometric predicates used inside composed filter SQL, plus the R*Tree bounds reduction.

use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::{Connection, OptionalExtension};

use pointcloud_core::{BoundingBox, PointCloudError, PointCloudResult, Rotator, Transform, Vec3};

/// R*Tree node cell: a 64-bit id followed by min/max float32 pairs for three axes.
const RTREE_CELL_BYTES: usize = 8 + 6 * 4;
const RTREE_HEADER_BYTES: usize = 4;

pub fn point_in_sphere(center: Vec3, radius: f64, point: Vec3) -> bool {
    (point - center).length_squared() < radius * radius
}

pub fn point_in_oriented_box(rotation: Rotator, translation: Vec3, scale: Vec3, point: Vec3) -> bool {
    let transform = Transform::new(translation, rotation.to_quat(), scale);
    let local = transform.inverse_transform_position(point);
    local.x.abs() <= 1.0 && local.y.abs() <= 1.0 && local.z.abs() <= 1.0
}

fn arg_vec3(ctx: &Context<'_>, start: usize) -> rusqlite::Result<Vec3> {
    Ok(Vec3::new(
        ctx.get::<f64>(start)?,
        ctx.get::<f64>(start + 1)?,
        ctx.get::<f64>(start + 2)?,
    ))
}

fn flag(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

/// Registers `IN_SPHERE`, `IN_OBB`, `SQRT` and `POW` on `conn`.
pub fn register_functions(conn: &Connection) -> PointCloudResult<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("IN_SPHERE", 7, flags, |ctx| {
        let center = arg_vec3(ctx, 0)?;
        let radius = ctx.get::<f64>(3)?;
        let point = arg_vec3(ctx, 4)?;
        Ok(flag(point_in_sphere(center, radius, point)))
    })?;

    conn.create_scalar_function("IN_OBB", 12, flags, |ctx| {
        let angles = arg_vec3(ctx, 0)?;
        let rotation = Rotator::new(angles.x, angles.y, angles.z);
        let translation = arg_vec3(ctx, 3)?;
        let scale = arg_vec3(ctx, 6)?;
        let point = arg_vec3(ctx, 9)?;
        Ok(flag(point_in_oriented_box(
            rotation,
            translation,
            scale,
            point,
        )))
    })?;

    conn.create_scalar_function("SQRT", 1, flags, |ctx| Ok(ctx.get::<f64>(0)?.sqrt()))?;

    conn.create_scalar_function("POW", 2, flags, |ctx| {
        Ok(ctx.get::<f64>(0)?.powf(ctx.get::<f64>(1)?))
    })?;

    Ok(())
}

fn read_f32(bytes: &[u8], offset: usize) -> f64 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    f64::from(f32::from_be_bytes(raw))
}

/// Union of the top-level cells of a three-dimensional R*Tree.
///
/// Only the root node is read, so the cost does not grow with the number of entries.
/// Returns `None` when the index holds no entries.
pub fn spatial_index_bounds(
    conn: &Connection,
    index_name: &str,
) -> PointCloudResult<Option<BoundingBox>> {
    if index_name.is_empty()
        || !index_name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        return Err(PointCloudError::invalid(format!(
            "invalid spatial index name '{index_name}'"
        )));
    }
    let sql = format!("SELECT data FROM \"{index_name}_node\" WHERE nodeno = 1");
    let root: Option<Vec<u8>> = conn.query_row(&sql, [], |row| row.get(0)).optional()?;
    let Some(root) = root else {
        return Ok(None);
    };
    if root.len() < RTREE_HEADER_BYTES {
        return Err(PointCloudError::integrity(format!(
            "spatial index '{index_name}' root node is truncated"
        )));
    }
    let cells = usize::from(u16::from_be_bytes([root[2], root[3]]));
    if root.len() < RTREE_HEADER_BYTES + cells * RTREE_CELL_BYTES {
        return Err(PointCloudError::integrity(format!(
            "spatial index '{index_name}' root node declares {cells} cells but is {} bytes",
            root.len()
        )));
    }

    let mut bounds: Option<BoundingBox> = None;
    for cell in 0..cells {
        let coords = RTREE_HEADER_BYTES + cell * RTREE_CELL_BYTES + 8;
        let min = Vec3::new(
            read_f32(&root, coords),
            read_f32(&root, coords + 8),
            read_f32(&root, coords + 16),
        );
        let max = Vec3::new(
            read_f32(&root, coords + 4),
            read_f32(&root, coords + 12),
            read_f32(&root, coords + 20),
        );
        let cell_box = BoundingBox::new(min, max);
        bounds = Some(match bounds {
            Some(existing) => existing.union(&cell_box),
            None => cell_box,
        });
    }
    Ok(bounds)
}
