//! Typed extraction of result columns.
//!
//! A query is paired with a `Decoder` describing how consecutive columns of each row map to a
//! value. Composite decoders consume several columns: a box reads six (min xyz, max xyz) and
//! a transform reads ten (translation xyz, rotation xyzw, scale xyz).

use rusqlite::Row;
use rusqlite::types::ValueRef;

use pointcloud_core::{BoundingBox, PointCloudError, PointCloudResult, Quat, Transform, Vec3};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoder {
    Int,
    Float,
    Text,
    Box,
    Transform,
    Sequence(std::boxed::Box<Decoder>, usize),
}

impl Decoder {
    pub fn sequence(inner: Decoder, len: usize) -> Self {
        Decoder::Sequence(std::boxed::Box::new(inner), len)
    }

    /// Number of columns one decoded value consumes.
    pub fn width(&self) -> usize {
        match self {
            Decoder::Int | Decoder::Float | Decoder::Text => 1,
            Decoder::Box => 6,
            Decoder::Transform => 10,
            Decoder::Sequence(inner, len) => inner.width() * len,
        }
    }

    pub fn decode(&self, row: &Row<'_>, offset: usize) -> rusqlite::Result<Decoded> {
        match self {
            Decoder::Int => Ok(Decoded::Int(read_int(row, offset)?)),
            Decoder::Float => Ok(Decoded::Float(read_float(row, offset)?)),
            Decoder::Text => Ok(Decoded::Text(read_text(row, offset)?)),
            Decoder::Box => {
                let min = read_vec3(row, offset)?;
                let max = read_vec3(row, offset + 3)?;
                Ok(Decoded::Box(BoundingBox::new(min, max)))
            }
            Decoder::Transform => Ok(Decoded::Transform(read_transform(row, offset)?)),
            Decoder::Sequence(inner, len) => {
                let step = inner.width();
                (0..*len)
                    .map(|index| inner.decode(row, offset + index * step))
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map(Decoded::Sequence)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    Int(i64),
    Float(f64),
    Text(String),
    Box(BoundingBox),
    Transform(Transform),
    Sequence(Vec<Decoded>),
}

impl Decoded {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Decoded::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Decoded::Float(value) => Some(*value),
            Decoded::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Decoded::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_box(&self) -> Option<BoundingBox> {
        match self {
            Decoded::Box(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_transform(&self) -> Option<Transform> {
        match self {
            Decoded::Transform(value) => Some(*value),
            _ => None,
        }
    }

    pub fn into_sequence(self) -> Option<Vec<Decoded>> {
        match self {
            Decoded::Sequence(values) => Some(values),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Decoded::Text(value) => Some(value),
            _ => None,
        }
    }
}

/// Fails early when a statement does not produce enough columns for `decoders`.
pub fn check_width(column_count: usize, decoders: &[&Decoder]) -> PointCloudResult<()> {
    let needed: usize = decoders.iter().map(|decoder| decoder.width()).sum();
    if needed > column_count {
        return Err(PointCloudError::invalid(format!(
            "decoder needs {needed} columns but the statement yields {column_count}"
        )));
    }
    Ok(())
}

/// Integers read from text or real columns are truncated, matching SQLite's own casts.
fn read_int(row: &Row<'_>, index: usize) -> rusqlite::Result<i64> {
    Ok(match row.get_ref(index)? {
        ValueRef::Null => 0,
        ValueRef::Integer(value) => value,
        ValueRef::Real(value) => value as i64,
        ValueRef::Text(bytes) => parse_number(bytes).map(|value| value as i64).unwrap_or(0),
        ValueRef::Blob(_) => 0,
    })
}

fn read_float(row: &Row<'_>, index: usize) -> rusqlite::Result<f64> {
    Ok(match row.get_ref(index)? {
        ValueRef::Null => 0.0,
        ValueRef::Integer(value) => value as f64,
        ValueRef::Real(value) => value,
        ValueRef::Text(bytes) => parse_number(bytes).unwrap_or(0.0),
        ValueRef::Blob(_) => 0.0,
    })
}

fn read_text(row: &Row<'_>, index: usize) -> rusqlite::Result<String> {
    Ok(match row.get_ref(index)? {
        ValueRef::Null => String::new(),
        ValueRef::Integer(value) => value.to_string(),
        ValueRef::Real(value) => value.to_string(),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    })
}

fn parse_number(bytes: &[u8]) -> Option<f64> {
    std::str::from_utf8(bytes).ok()?.trim().parse::<f64>().ok()
}

fn read_vec3(row: &Row<'_>, offset: usize) -> rusqlite::Result<Vec3> {
    Ok(Vec3::new(
        read_float(row, offset)?,
        read_float(row, offset + 1)?,
        read_float(row, offset + 2)?,
    ))
}

pub(crate) fn read_transform(row: &Row<'_>, offset: usize) -> rusqlite::Result<Transform> {
    let translation = read_vec3(row, offset)?;
    let rotation = Quat::new(
        read_float(row, offset + 3)?,
        read_float(row, offset + 4)?,
        read_float(row, offset + 5)?,
        read_float(row, offset + 6)?,
    );
    let scale = read_vec3(row, offset + 7)?;
    Ok(Transform::new(translation, rotation, scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn decode_one(sql: &str, decoder: &Decoder) -> Decoded {
        let conn = Connection::open_in_memory().expect("open");
        conn.query_row(sql, [], |row| decoder.decode(row, 0))
            .expect("decode")
    }

    #[test]
    fn widths_compose() {
        assert_eq!(Decoder::Box.width(), 6);
        assert_eq!(Decoder::Transform.width(), 10);
        assert_eq!(Decoder::sequence(Decoder::Box, 2).width(), 12);
        assert!(check_width(5, &[&Decoder::Box]).is_err());
        assert!(check_width(11, &[&Decoder::Int, &Decoder::Transform]).is_ok());
    }

    #[test]
    fn scalars_coerce_like_sqlite() {
        assert_eq!(decode_one("SELECT 4.9", &Decoder::Int), Decoded::Int(4));
        assert_eq!(decode_one("SELECT '21.0'", &Decoder::Float), Decoded::Float(21.0));
        assert_eq!(
            decode_one("SELECT 7", &Decoder::Text),
            Decoded::Text("7".to_string())
        );
        assert_eq!(decode_one("SELECT NULL", &Decoder::Int), Decoded::Int(0));
    }

    #[test]
    fn composite_decoders_read_consecutive_columns() {
        let decoded = decode_one("SELECT -1, -2, -3, 1, 2, 3", &Decoder::Box);
        let bounds = decoded.as_box().expect("box");
        assert_eq!(bounds.min, Vec3::new(-1.0, -2.0, -3.0));
        assert_eq!(bounds.max, Vec3::new(1.0, 2.0, 3.0));

        let decoded = decode_one("SELECT 1, 2, 3, 0, 0, 0, 1, 2, 2, 2", &Decoder::Transform);
        let transform = decoded.as_transform().expect("transform");
        assert_eq!(transform.translation, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(transform.rotation, Quat::IDENTITY);
        assert_eq!(transform.scale, Vec3::splat(2.0));
    }

    #[test]
    fn sequences_repeat_the_inner_decoder() {
        let decoded = decode_one(
            "SELECT 'a', 'b', 'c'",
            &Decoder::sequence(Decoder::Text, 3),
        );
        let values = decoded.into_sequence().expect("sequence");
        let texts: Vec<_> = values.iter().filter_map(Decoded::as_text).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }
}
