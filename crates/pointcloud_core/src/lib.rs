pub mod batch;
pub mod error;
pub mod geometry;

pub use batch::{AttributePair, PointBatch, StructuredPoint};
pub use error::{PointCloudError, PointCloudResult};
pub use geometry::{BoundingBox, OrientedBox, Quat, Rotator, Transform, Vec3};
