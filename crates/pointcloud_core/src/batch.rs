use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{PointCloudError, PointCloudResult};
use crate::geometry::{BoundingBox, Transform};

/// One flattened metadata entry: an index into `PointBatch::attribute_names` and the value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributePair {
    pub column: usize,
    pub value: String,
}

impl AttributePair {
    pub fn new(column: usize, value: impl Into<String>) -> Self {
        Self {
            column,
            value: value.into(),
        }
    }
}

/// Column-oriented ingestion payload handed to the store by a parser.
///
/// Point `i` owns the `attribute_counts[i]` pairs that follow the pairs of every earlier
/// point in `attributes`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PointBatch {
    pub object_name: String,
    pub transforms: Vec<Transform>,
    pub attribute_names: Vec<String>,
    pub attribute_counts: Vec<usize>,
    pub attributes: Vec<AttributePair>,
    pub import_bounds: Option<BoundingBox>,
}

impl PointBatch {
    pub fn new(object_name: impl Into<String>) -> Self {
        Self {
            object_name: object_name.into(),
            ..Self::default()
        }
    }

    pub fn with_import_bounds(mut self, bounds: BoundingBox) -> Self {
        self.import_bounds = Some(bounds);
        self
    }

    /// Appends a point and its attributes, registering unseen attribute names as columns.
    pub fn push_point<'a>(
        &mut self,
        transform: Transform,
        attributes: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) {
        let mut count = 0;
        for (name, value) in attributes {
            let column = match self.attribute_names.iter().position(|known| known == name) {
                Some(column) => column,
                None => {
                    self.attribute_names.push(name.to_string());
                    self.attribute_names.len() - 1
                }
            };
            self.attributes.push(AttributePair::new(column, value));
            count += 1;
        }
        self.transforms.push(transform);
        self.attribute_counts.push(count);
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn validate(&self) -> PointCloudResult<()> {
        if self.transforms.is_empty() {
            return Err(PointCloudError::invalid("point batch has no transforms"));
        }
        if self.transforms.len() != self.attribute_counts.len() {
            return Err(PointCloudError::invalid(format!(
                "point batch has {} transforms but {} attribute counts",
                self.transforms.len(),
                self.attribute_counts.len()
            )));
        }
        let expected: usize = self.attribute_counts.iter().sum();
        if expected != self.attributes.len() {
            return Err(PointCloudError::invalid(format!(
                "attribute counts sum to {expected} but {} pairs were supplied",
                self.attributes.len()
            )));
        }
        if let Some(pair) = self
            .attributes
            .iter()
            .find(|pair| pair.column >= self.attribute_names.len())
        {
            return Err(PointCloudError::invalid(format!(
                "attribute column {} out of range ({} names)",
                pair.column,
                self.attribute_names.len()
            )));
        }
        Ok(())
    }

    /// Index into `attributes` of the first pair of every point.
    pub fn attribute_offsets(&self) -> Vec<usize> {
        let mut offset = 0;
        self.attribute_counts
            .iter()
            .map(|count| {
                let start = offset;
                offset += count;
                start
            })
            .collect()
    }
}

/// Row-oriented ingestion form: each point carries its own key/value map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredPoint {
    pub transform: Transform,
    pub attributes: BTreeMap<String, String>,
}

impl StructuredPoint {
    pub fn new(transform: Transform) -> Self {
        Self {
            transform,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

impl PointBatch {
    pub fn from_structured(
        object_name: impl Into<String>,
        points: &[StructuredPoint],
        import_bounds: Option<BoundingBox>,
    ) -> Self {
        let mut columns: HashMap<&str, usize> = HashMap::new();
        let mut batch = PointBatch::new(object_name);
        batch.import_bounds = import_bounds;
        for point in points {
            for (key, value) in &point.attributes {
                let next = columns.len();
                let column = *columns.entry(key.as_str()).or_insert_with(|| {
                    batch.attribute_names.push(key.clone());
                    next
                });
                batch.attributes.push(AttributePair::new(column, value.clone()));
            }
            batch.transforms.push(point.transform);
            batch.attribute_counts.push(point.attributes.len());
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Vec3;

    #[test]
    fn push_point_registers_columns_once() {
        let mut batch = PointBatch::new("tile_a");
        batch.push_point(Transform::IDENTITY, [("color", "red"), ("floor", "1")]);
        batch.push_point(Transform::IDENTITY, [("floor", "2")]);
        assert_eq!(batch.attribute_names, vec!["color", "floor"]);
        assert_eq!(batch.attribute_counts, vec![2, 1]);
        assert_eq!(batch.attributes[2], AttributePair::new(1, "2"));
        assert_eq!(batch.attribute_offsets(), vec![0, 2]);
        batch.validate().expect("valid batch");
    }

    #[test]
    fn validate_rejects_mismatched_shapes() {
        let mut batch = PointBatch::new("bad");
        assert!(matches!(
            batch.validate(),
            Err(PointCloudError::Validation { .. })
        ));
        batch.transforms.push(Transform::IDENTITY);
        assert!(batch.validate().is_err());
        batch.attribute_counts.push(1);
        assert!(batch.validate().is_err());
        batch.attributes.push(AttributePair::new(3, "x"));
        assert!(batch.validate().is_err());
        batch.attribute_names = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        batch.validate().expect("valid once columns exist");
    }

    #[test]
    fn structured_points_flatten_in_key_order() {
        let points = vec![
            StructuredPoint::new(Transform::from_translation(Vec3::new(1.0, 0.0, 0.0)))
                .with_attribute("b", "2")
                .with_attribute("a", "1"),
            StructuredPoint::new(Transform::IDENTITY).with_attribute("c", "3"),
        ];
        let batch = PointBatch::from_structured("structured", &points, None);
        assert_eq!(batch.attribute_names, vec!["a", "b", "c"]);
        assert_eq!(batch.attribute_counts, vec![2, 1]);
        assert_eq!(batch.attributes[2], AttributePair::new(2, "3"));
        batch.validate().expect("valid");
    }
}
