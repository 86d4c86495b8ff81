/// A 4x4 transformation matrix stored in row-major order.
///
/// Node matrices, combined matrices and projections all use this type.
/// Points are column vectors, so `a.then(&b)` applies `b` first.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    /// Matrix data in row-major order: [row0, row1, row2, row3]
    pub data: [f32; 16],
}

/// Cheapest description of what a matrix does, ordered by generality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatrixKind {
    Identity,
    Translation,
    /// Scale and translation, no shear or rotation
    Scale,
    /// Any affine map of the xy plane that leaves z independent
    Affine2D,
    /// Anything mixing z into x/y, still without perspective
    General,
    Perspective,
}

const EPSILON: f32 = 1e-6;

fn fuzzy_null(v: f32) -> bool {
    v.abs() <= EPSILON
}

impl Transform {
    /// Identity matrix (no transformation)
    pub const IDENTITY: Self = Self {
        data: [
            1.0, 0.0, 0.0, 0.0, // row 0
            0.0, 1.0, 0.0, 0.0, // row 1
            0.0, 0.0, 1.0, 0.0, // row 2
            0.0, 0.0, 0.0, 1.0, // row 3
        ],
    };

    pub fn identity() -> Self {
        Self::IDENTITY
    }

    /// Create a translation transform
    pub fn translate(x: f32, y: f32) -> Self {
        Self {
            data: [
                1.0, 0.0, 0.0, x, // row 0
                0.0, 1.0, 0.0, y, // row 1
                0.0, 0.0, 1.0, 0.0, // row 2
                0.0, 0.0, 0.0, 1.0, // row 3
            ],
        }
    }

    /// Create a rotation transform around the Z axis (2D rotation)
    pub fn rotate(angle_radians: f32) -> Self {
        let cos = angle_radians.cos();
        let sin = angle_radians.sin();
        Self {
            data: [
                cos, -sin, 0.0, 0.0, // row 0
                sin, cos, 0.0, 0.0, // row 1
                0.0, 0.0, 1.0, 0.0, // row 2
                0.0, 0.0, 0.0, 1.0, // row 3
            ],
        }
    }

    pub fn rotate_degrees(angle_degrees: f32) -> Self {
        Self::rotate(angle_degrees.to_radians())
    }

    /// Create a uniform scale transform
    pub fn scale(s: f32) -> Self {
        Self::scale_xy(s, s)
    }

    /// Create a non-uniform scale transform
    pub fn scale_xy(sx: f32, sy: f32) -> Self {
        Self {
            data: [
                sx, 0.0, 0.0, 0.0, // row 0
                0.0, sy, 0.0, 0.0, // row 1
                0.0, 0.0, 1.0, 0.0, // row 2
                0.0, 0.0, 0.0, 1.0, // row 3
            ],
        }
    }

    /// Orthographic projection mapping the box to normalized device coordinates.
    ///
    /// With `bottom > top` the y axis points down, which is how device rects
    /// are projected.
    pub fn ortho(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Self {
        let w = right - left;
        let h = top - bottom;
        let d = far - near;
        if w == 0.0 || h == 0.0 || d == 0.0 {
            return Self::IDENTITY;
        }
        Self {
            data: [
                2.0 / w, 0.0, 0.0, -(left + right) / w, // row 0
                0.0, 2.0 / h, 0.0, -(top + bottom) / h, // row 1
                0.0, 0.0, -2.0 / d, -(near + far) / d, // row 2
                0.0, 0.0, 0.0, 1.0, // row 3
            ],
        }
    }

    /// Element at `row`, `col`.
    #[inline]
    pub fn at(&self, row: usize, col: usize) -> f32 {
        self.data[row * 4 + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[row * 4 + col] = value;
    }

    /// Compose this transform with another: self * other
    /// Applies `other` first, then `self`.
    pub fn then(&self, other: &Transform) -> Transform {
        let a = &self.data;
        let b = &other.data;

        let mut result = [0.0f32; 16];
        for i in 0..4 {
            for j in 0..4 {
                let mut sum = 0.0;
                for k in 0..4 {
                    sum += a[i * 4 + k] * b[k * 4 + j];
                }
                result[i * 4 + j] = sum;
            }
        }

        Transform { data: result }
    }

    /// Transform a 2D point, ignoring perspective.
    pub fn transform_point(&self, x: f32, y: f32) -> (f32, f32) {
        let new_x = self.data[0] * x + self.data[1] * y + self.data[3];
        let new_y = self.data[4] * x + self.data[5] * y + self.data[7];
        (new_x, new_y)
    }

    /// Transform a 2D point with the homogeneous divide.
    pub fn project_point(&self, x: f32, y: f32) -> (f32, f32) {
        let (px, py) = self.transform_point(x, y);
        let w = self.data[12] * x + self.data[13] * y + self.data[15];
        if w == 0.0 || w == 1.0 {
            (px, py)
        } else {
            (px / w, py / w)
        }
    }

    /// Translation part of the matrix.
    pub fn translation(&self) -> (f32, f32) {
        (self.data[3], self.data[7])
    }

    /// Determinant of the 2D linear part, as used for line-width and
    /// antialiasing scaling in materials.
    pub fn determinant(&self) -> f32 {
        self.data[0] * self.data[5] - self.data[1] * self.data[4]
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    fn has_perspective(&self) -> bool {
        !(fuzzy_null(self.data[12])
            && fuzzy_null(self.data[13])
            && fuzzy_null(self.data[14])
            && self.data[15] == 1.0)
    }

    fn z_coupled(&self) -> bool {
        !(fuzzy_null(self.data[2])
            && fuzzy_null(self.data[6])
            && fuzzy_null(self.data[8])
            && fuzzy_null(self.data[9]))
    }

    /// Classify the matrix. Lower kinds allow cheaper vertex processing.
    pub fn kind(&self) -> MatrixKind {
        if self.has_perspective() {
            return MatrixKind::Perspective;
        }
        if self.z_coupled() {
            return MatrixKind::General;
        }
        let no_shear = fuzzy_null(self.data[1]) && fuzzy_null(self.data[4]);
        if !no_shear {
            return MatrixKind::Affine2D;
        }
        let unit = self.data[0] == 1.0 && self.data[5] == 1.0 && self.data[10] == 1.0;
        if !unit {
            return MatrixKind::Scale;
        }
        if self.data[3] == 0.0 && self.data[7] == 0.0 && self.data[11] == 0.0 {
            MatrixKind::Identity
        } else {
            MatrixKind::Translation
        }
    }

    /// True for identity and pure translations.
    pub fn is_translate_only(&self) -> bool {
        self.kind() <= MatrixKind::Translation
    }

    /// True when x/y output depends only on x/y input and there is no
    /// perspective, so vertices can be pre-transformed on the CPU.
    pub fn is_2d_safe(&self) -> bool {
        self.kind() <= MatrixKind::Affine2D
    }

    pub fn is_perspective(&self) -> bool {
        self.kind() == MatrixKind::Perspective
    }

    /// No rotation or shear in the xy part.
    pub fn is_axis_aligned(&self) -> bool {
        fuzzy_null(self.at(0, 1)) && fuzzy_null(self.at(1, 0))
    }

    /// Exactly a quarter turn (in either direction) in the xy part.
    pub fn is_rotated_90(&self) -> bool {
        fuzzy_null(self.at(0, 0)) && fuzzy_null(self.at(1, 1))
    }

    /// Get the rows of the matrix for passing to the shader
    pub fn rows(&self) -> [[f32; 4]; 4] {
        [
            [self.data[0], self.data[1], self.data[2], self.data[3]],
            [self.data[4], self.data[5], self.data[6], self.data[7]],
            [self.data[8], self.data[9], self.data[10], self.data[11]],
            [self.data[12], self.data[13], self.data[14], self.data[15]],
        ]
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}
