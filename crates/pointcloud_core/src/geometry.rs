//! Plain geometric value types shared by the store, the spatial predicates and callers.
//!
//! Conventions follow the placement tool that feeds the store: rotators are expressed in
//! degrees as pitch (about Y), yaw (about Z) and roll (about X), and transforms apply
//! scale, then rotation, then translation.

use std::ops::{Add, Mul, Neg, Sub};

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};

/// Serializable `x, y, z` triple. Arithmetic goes through `glam::DVec3`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<DVec3> for Vec3 {
    fn from(v: DVec3) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

impl From<Vec3> for DVec3 {
    fn from(v: Vec3) -> Self {
        DVec3::new(v.x, v.y, v.z)
    }
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);
    pub const ONE: Vec3 = Vec3::new(1.0, 1.0, 1.0);

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn splat(value: f64) -> Self {
        DVec3::splat(value).into()
    }

    pub fn length_squared(self) -> f64 {
        DVec3::from(self).length_squared()
    }

    pub fn component_mul(self, other: Vec3) -> Vec3 {
        (DVec3::from(self) * DVec3::from(other)).into()
    }

    /// Divides component-wise; a zero divisor yields zero on that axis.
    pub fn component_div_safe(self, other: Vec3) -> Vec3 {
        let divisor = DVec3::from(other);
        let zero_axes = divisor.cmpeq(DVec3::ZERO);
        DVec3::select(
            zero_axes,
            DVec3::ZERO,
            DVec3::from(self) / DVec3::select(zero_axes, DVec3::ONE, divisor),
        )
        .into()
    }

    pub fn min(self, other: Vec3) -> Vec3 {
        DVec3::from(self).min(other.into()).into()
    }

    pub fn max(self, other: Vec3) -> Vec3 {
        DVec3::from(self).max(other.into()).into()
    }

    pub fn is_finite(self) -> bool {
        DVec3::from(self).is_finite()
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        (DVec3::from(self) + DVec3::from(rhs)).into()
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        (DVec3::from(self) - DVec3::from(rhs)).into()
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f64) -> Vec3 {
        (DVec3::from(self) * rhs).into()
    }
}

impl Neg for Vec3 {
    type Output = Vec3;

    fn neg(self) -> Vec3 {
        (-DVec3::from(self)).into()
    }
}

/// Euler rotation in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rotator {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

impl Rotator {
    pub const fn new(pitch: f64, yaw: f64, roll: f64) -> Self {
        Self { pitch, yaw, roll }
    }

    /// Yaw about +Z, then pitch and roll about the negated Y and X axes.
    pub fn to_quat(self) -> Quat {
        let yaw = DQuat::from_rotation_z(self.yaw.to_radians());
        let pitch = DQuat::from_rotation_y(-self.pitch.to_radians());
        let roll = DQuat::from_rotation_x(-self.roll.to_radians());
        (yaw * pitch * roll).into()
    }

    pub fn is_finite(self) -> bool {
        self.pitch.is_finite() && self.yaw.is_finite() && self.roll.is_finite()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<DQuat> for Quat {
    fn from(q: DQuat) -> Self {
        Self::new(q.x, q.y, q.z, q.w)
    }
}

impl From<Quat> for DQuat {
    fn from(q: Quat) -> Self {
        DQuat::from_xyzw(q.x, q.y, q.z, q.w)
    }
}

impl Quat {
    pub const IDENTITY: Quat = Quat {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub const fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    pub fn rotate(self, v: Vec3) -> Vec3 {
        (DQuat::from(self) * DVec3::from(v)).into()
    }

    pub fn unrotate(self, v: Vec3) -> Vec3 {
        (DQuat::from(self).inverse() * DVec3::from(v)).into()
    }

    pub fn is_finite(self) -> bool {
        DQuat::from(self).is_finite()
    }
}

/// Rigid transform with non-uniform scale, the per-point payload of the store.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn new(translation: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            translation,
            rotation,
            scale,
        }
    }

    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Self::IDENTITY
        }
    }

    pub fn transform_position(&self, point: Vec3) -> Vec3 {
        self.rotation.rotate(point.component_mul(self.scale)) + self.translation
    }

    pub fn inverse_transform_position(&self, point: Vec3) -> Vec3 {
        self.rotation
            .unrotate(point - self.translation)
            .component_div_safe(self.scale)
    }

    pub fn is_finite(&self) -> bool {
        self.translation.is_finite() && self.rotation.is_finite() && self.scale.is_finite()
    }
}

/// Box described by a rotator, a center and half extents, as accepted by `IN_OBB`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrientedBox {
    pub rotation: Rotator,
    pub translation: Vec3,
    pub scale: Vec3,
}

impl OrientedBox {
    pub fn new(rotation: Rotator, translation: Vec3, scale: Vec3) -> Self {
        Self {
            rotation,
            translation,
            scale,
        }
    }

    pub fn to_transform(&self) -> Transform {
        Transform::new(self.translation, self.rotation.to_quat(), self.scale)
    }

    pub fn is_valid(&self) -> bool {
        self.rotation.is_finite()
            && self.translation.is_finite()
            && self.scale.is_finite()
            && self.scale.x != 0.0
            && self.scale.y != 0.0
            && self.scale.z != 0.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoundingBox {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_point(point: Vec3) -> Self {
        Self::new(point, point)
    }

    /// A box is valid when it is finite and not inverted on any axis.
    pub fn is_valid(&self) -> bool {
        self.min.is_finite()
            && self.max.is_finite()
            && self.min.x <= self.max.x
            && self.min.y <= self.max.y
            && self.min.z <= self.max.z
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::new(self.min.min(other.min), self.max.max(other.max))
    }

    pub fn include_point(&self, point: Vec3) -> BoundingBox {
        BoundingBox::new(self.min.min(point), self.max.max(point))
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }
}
