//! Minimal rigid-transform math for pose interpolation.
//!
//! Tracking devices report tool poses as 4×4 homogeneous matrices. Temporal
//! interpolation between two poses decomposes each matrix into a rotation
//! quaternion and a translation vector, slerps the rotations, lerps the
//! translations, and recomposes. Quaternions follow the scalar-first
//! `(w, x, y, z)` convention.

use std::ops::Mul;

/// 4×4 homogeneous transform, row-major.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix4x4(pub [[f64; 4]; 4]);

impl Matrix4x4 {
    pub const IDENTITY: Self = Self([
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]);

    pub fn identity() -> Self {
        Self::IDENTITY
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.0[row][col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.0[row][col] = value;
    }

    /// Translation column (x, y, z).
    pub fn translation(&self) -> [f64; 3] {
        [self.0[0][3], self.0[1][3], self.0[2][3]]
    }

    pub fn set_translation(&mut self, t: [f64; 3]) {
        self.0[0][3] = t[0];
        self.0[1][3] = t[1];
        self.0[2][3] = t[2];
    }

    /// Compose from a rotation and a translation.
    pub fn from_rotation_translation(rotation: Quaternion, translation: [f64; 3]) -> Self {
        let mut m = rotation.to_matrix();
        m.set_translation(translation);
        m
    }

    /// Interpolate between two rigid transforms: slerp for the rotation part,
    /// linear interpolation for the translation part. `t` in [0, 1] moves
    /// from `self` to `other`.
    pub fn interpolate(&self, other: &Matrix4x4, t: f64) -> Matrix4x4 {
        let qa = Quaternion::from_matrix(self);
        let qb = Quaternion::from_matrix(other);
        let ta = self.translation();
        let tb = other.translation();
        let translation = [
            ta[0] + (tb[0] - ta[0]) * t,
            ta[1] + (tb[1] - ta[1]) * t,
            ta[2] + (tb[2] - ta[2]) * t,
        ];
        Matrix4x4::from_rotation_translation(qa.slerp(&qb, t), translation)
    }
}

impl Default for Matrix4x4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul for Matrix4x4 {
    type Output = Matrix4x4;

    fn mul(self, rhs: Matrix4x4) -> Matrix4x4 {
        let mut out = [[0.0; 4]; 4];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..4).map(|k| self.0[i][k] * rhs.0[k][j]).sum();
            }
        }
        Matrix4x4(out)
    }
}

/// Unit quaternion, scalar-first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub const IDENTITY: Self = Self {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn normalize(&mut self) {
        let norm = (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt();
        if norm > 1.0e-12 {
            self.w /= norm;
            self.x /= norm;
            self.y /= norm;
            self.z /= norm;
        } else {
            *self = Self::IDENTITY;
        }
    }

    pub fn dot(&self, other: &Quaternion) -> f64 {
        self.w * other.w + self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Extract the rotation quaternion from the upper-left 3×3 block.
    /// Shepperd's method: pick the largest diagonal pivot for stability.
    pub fn from_matrix(m: &Matrix4x4) -> Self {
        let r = &m.0;
        let trace = r[0][0] + r[1][1] + r[2][2];
        let mut q = if trace > 0.0 {
            let s = (trace + 1.0).sqrt() * 2.0;
            Quaternion {
                w: 0.25 * s,
                x: (r[2][1] - r[1][2]) / s,
                y: (r[0][2] - r[2][0]) / s,
                z: (r[1][0] - r[0][1]) / s,
            }
        } else if r[0][0] > r[1][1] && r[0][0] > r[2][2] {
            let s = (1.0 + r[0][0] - r[1][1] - r[2][2]).sqrt() * 2.0;
            Quaternion {
                w: (r[2][1] - r[1][2]) / s,
                x: 0.25 * s,
                y: (r[0][1] + r[1][0]) / s,
                z: (r[0][2] + r[2][0]) / s,
            }
        } else if r[1][1] > r[2][2] {
            let s = (1.0 + r[1][1] - r[0][0] - r[2][2]).sqrt() * 2.0;
            Quaternion {
                w: (r[0][2] - r[2][0]) / s,
                x: (r[0][1] + r[1][0]) / s,
                y: 0.25 * s,
                z: (r[1][2] + r[2][1]) / s,
            }
        } else {
            let s = (1.0 + r[2][2] - r[0][0] - r[1][1]).sqrt() * 2.0;
            Quaternion {
                w: (r[1][0] - r[0][1]) / s,
                x: (r[0][2] + r[2][0]) / s,
                y: (r[1][2] + r[2][1]) / s,
                z: 0.25 * s,
            }
        };
        q.normalize();
        q
    }

    /// Rotation matrix with identity translation.
    pub fn to_matrix(&self) -> Matrix4x4 {
        let (w, x, y, z) = (self.w, self.x, self.y, self.z);
        Matrix4x4([
            [
                1.0 - 2.0 * (y * y + z * z),
                2.0 * (x * y - w * z),
                2.0 * (x * z + w * y),
                0.0,
            ],
            [
                2.0 * (x * y + w * z),
                1.0 - 2.0 * (x * x + z * z),
                2.0 * (y * z - w * x),
                0.0,
            ],
            [
                2.0 * (x * z - w * y),
                2.0 * (y * z + w * x),
                1.0 - 2.0 * (x * x + y * y),
                0.0,
            ],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// Spherical linear interpolation. Takes the shorter arc; falls back to
    /// normalized linear interpolation when the rotations are nearly
    /// parallel and the sine denominator loses precision.
    pub fn slerp(&self, other: &Quaternion, t: f64) -> Quaternion {
        let mut b = *other;
        let mut cos_theta = self.dot(other);
        if cos_theta < 0.0 {
            b = Quaternion {
                w: -b.w,
                x: -b.x,
                y: -b.y,
                z: -b.z,
            };
            cos_theta = -cos_theta;
        }

        let (wa, wb) = if cos_theta > 0.9995 {
            (1.0 - t, t)
        } else {
            let theta = cos_theta.clamp(-1.0, 1.0).acos();
            let sin_theta = theta.sin();
            (
                ((1.0 - t) * theta).sin() / sin_theta,
                (t * theta).sin() / sin_theta,
            )
        };

        let mut q = Quaternion {
            w: wa * self.w + wb * b.w,
            x: wa * self.x + wb * b.x,
            y: wa * self.y + wb * b.y,
            z: wa * self.z + wb * b.z,
        };
        q.normalize();
        q
    }
}

/// Rotation of `angle_rad` about the Z axis, as a homogeneous matrix.
/// Used by tests and the simulated source.
pub fn rotation_z(angle_rad: f64) -> Matrix4x4 {
    let (s, c) = angle_rad.sin_cos();
    Matrix4x4([
        [c, -s, 0.0, 0.0],
        [s, c, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ])
}
