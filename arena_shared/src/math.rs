//! Math types.
//!
//! This module intentionally stays small and deterministic.
//! The world is Y-up: "horizontal" means the XZ plane.

use std::ops::{Add, AddAssign, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const ONE: Self = Self {
        x: 1.0,
        y: 1.0,
        z: 1.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn len(self) -> f32 {
        self.len_sq().sqrt()
    }

    /// Distance between two points ignoring the vertical axis.
    pub fn horizontal_distance(self, other: Self) -> f32 {
        let dx = self.x - other.x;
        let dz = self.z - other.z;
        (dx * dx + dz * dz).sqrt()
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.x + (to.x - self.x) * t,
            self.y + (to.y - self.y) * t,
            self.z + (to.z - self.z) * t,
        )
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Neg for Vec3 {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// Unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    /// Builds an orientation from Euler angles in degrees, composed as
    /// yaw (Y) * pitch (X) * roll (Z).
    pub fn from_euler_degrees(angles: Vec3) -> Self {
        let (hx, hy, hz) = (
            angles.x.to_radians() * 0.5,
            angles.y.to_radians() * 0.5,
            angles.z.to_radians() * 0.5,
        );
        let (s1, c1) = hx.sin_cos();
        let (s2, c2) = hy.sin_cos();
        let (s3, c3) = hz.sin_cos();
        Self {
            x: s1 * c2 * c3 + c1 * s2 * s3,
            y: c1 * s2 * c3 - s1 * c2 * s3,
            z: c1 * c2 * s3 - s1 * s2 * c3,
            w: c1 * c2 * c3 + s1 * s2 * s3,
        }
    }

    /// Inverse of [`Quat::from_euler_degrees`].
    pub fn to_euler_degrees(self) -> Vec3 {
        let Self { x, y, z, w } = self;
        let m13 = 2.0 * (x * z + w * y);
        let m33 = 1.0 - 2.0 * (x * x + y * y);
        let m23 = 2.0 * (y * z - w * x);
        let m21 = 2.0 * (x * y + w * z);
        let m22 = 1.0 - 2.0 * (x * x + z * z);
        let m31 = 2.0 * (x * z - w * y);
        let m11 = 1.0 - 2.0 * (y * y + z * z);

        let pitch = (-m23.clamp(-1.0, 1.0)).asin();
        let (yaw, roll) = if m23.abs() < 0.999_999 {
            (m13.atan2(m33), m21.atan2(m22))
        } else {
            ((-m31).atan2(m11), 0.0)
        };
        Vec3::new(pitch.to_degrees(), yaw.to_degrees(), roll.to_degrees())
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z + self.w * rhs.w
    }

    pub fn normalize(self) -> Self {
        let len = self.dot(self).sqrt();
        if len <= f32::EPSILON {
            return Self::IDENTITY;
        }
        Self {
            x: self.x / len,
            y: self.y / len,
            z: self.z / len,
            w: self.w / len,
        }
    }

    /// Normalized linear blend along the shortest arc. Accurate enough for
    /// one-tick interpolation steps.
    pub fn nlerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        let to = if self.dot(to) < 0.0 {
            Self {
                x: -to.x,
                y: -to.y,
                z: -to.z,
                w: -to.w,
            }
        } else {
            to
        };
        Self {
            x: self.x + (to.x - self.x) * t,
            y: self.y + (to.y - self.y) * t,
            z: self.z + (to.z - self.z) * t,
            w: self.w + (to.w - self.w) * t,
        }
        .normalize()
    }

    /// Rotates a vector by this orientation.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let u = Vec3::new(self.x, self.y, self.z);
        let uv = cross(u, v);
        let uuv = cross(u, uv);
        v + (uv * self.w + uuv) * 2.0
    }
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    Vec3::new(
        a.y * b.z - a.z * b.y,
        a.z * b.x - a.x * b.z,
        a.x * b.y - a.y * b.x,
    )
}
