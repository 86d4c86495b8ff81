//! Vertex data, attribute layouts and the rectangle math used for bounds.
//!
//! Geometry is plain data owned by the client scene graph. The renderer only
//! reads it: bounds are computed from the position attribute and vertex bytes
//! are copied (or transformed) into batch buffers during upload.

use bytemuck::{Pod, Zeroable};

use crate::transform::Transform;

/// Coordinates beyond this magnitude lose sub-pixel precision in f32, so
/// geometry reaching that far is never pre-transformed on the CPU.
pub const SAFE_COORDINATE_RANGE: f32 = 1.0e6;

/// Client-facing rectangle (origin + size).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn left(&self) -> f32 {
        self.x
    }

    pub fn top(&self) -> f32 {
        self.y
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// Axis-aligned bounds stored as min/max corners.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Bounds {
    /// Inverted bounds; the identity for [`Bounds::union`].
    pub const EMPTY: Self = Self {
        min_x: f32::MAX,
        min_y: f32::MAX,
        max_x: -f32::MAX,
        max_y: -f32::MAX,
    };

    /// Bounds that overlap everything.
    pub const EVERYTHING: Self = Self {
        min_x: -f32::MAX,
        min_y: -f32::MAX,
        max_x: f32::MAX,
        max_y: f32::MAX,
    };

    pub fn new(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn from_rect(rect: &Rect) -> Self {
        Self::new(rect.left(), rect.top(), rect.right(), rect.bottom())
    }

    pub fn include(&mut self, x: f32, y: f32) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Strict overlap test: touching edges do not intersect.
    pub fn intersects(&self, other: &Bounds) -> bool {
        let x_overlap = other.min_x < self.max_x && other.max_x > self.min_x;
        let y_overlap = other.min_y < self.max_y && other.max_y > self.min_y;
        x_overlap && y_overlap
    }

    /// Map through `m` and return the axis-aligned box of the result.
    pub fn map(&self, m: &Transform) -> Bounds {
        if m.is_axis_aligned() && !m.is_perspective() {
            let (x0, y0) = m.transform_point(self.min_x, self.min_y);
            let (x1, y1) = m.transform_point(self.max_x, self.max_y);
            return Bounds::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1));
        }
        let mut out = Bounds::EMPTY;
        for (x, y) in [
            (self.min_x, self.min_y),
            (self.max_x, self.min_y),
            (self.min_x, self.max_y),
            (self.max_x, self.max_y),
        ] {
            let (px, py) = m.project_point(x, y);
            out.include(px, py);
        }
        out
    }

    /// Replace non-finite or inverted components so the result is usable
    /// in overlap tests: an unknown edge becomes "unbounded".
    pub fn sanitized(mut self) -> Bounds {
        if !self.min_x.is_finite() || self.min_x == f32::MAX {
            self.min_x = -f32::MAX;
        }
        if !self.min_y.is_finite() || self.min_y == f32::MAX {
            self.min_y = -f32::MAX;
        }
        if !self.max_x.is_finite() || self.max_x == -f32::MAX {
            self.max_x = f32::MAX;
        }
        if !self.max_y.is_finite() || self.max_y == -f32::MAX {
            self.max_y = f32::MAX;
        }
        self
    }

    pub fn is_outside_float_range(&self) -> bool {
        self.min_x < -SAFE_COORDINATE_RANGE
            || self.min_y < -SAFE_COORDINATE_RANGE
            || self.max_x > SAFE_COORDINATE_RANGE
            || self.max_y > SAFE_COORDINATE_RANGE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Byte,
    UnsignedByte,
    Short,
    UnsignedShort,
    Int,
    UnsignedInt,
    Float,
}

impl AttributeType {
    pub fn size(self) -> usize {
        match self {
            AttributeType::Byte | AttributeType::UnsignedByte => 1,
            AttributeType::Short | AttributeType::UnsignedShort => 2,
            AttributeType::Int | AttributeType::UnsignedInt | AttributeType::Float => 4,
        }
    }
}

/// One vertex attribute. Attributes are tightly packed in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Attribute {
    /// Shader input location
    pub location: u32,
    pub tuple_size: u32,
    pub ty: AttributeType,
    /// Marks the attribute holding the vertex position
    pub is_vertex_coordinate: bool,
}

impl Attribute {
    pub const fn new(location: u32, tuple_size: u32, ty: AttributeType, is_vertex_coordinate: bool) -> Self {
        Self {
            location,
            tuple_size,
            ty,
            is_vertex_coordinate,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.tuple_size as usize * self.ty.size()
    }
}

/// The attribute layout shared by all vertices of a geometry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttributeSet {
    attributes: Vec<Attribute>,
    stride: usize,
}

impl AttributeSet {
    pub fn new(attributes: Vec<Attribute>) -> Self {
        let stride = attributes.iter().map(Attribute::byte_size).sum();
        Self { attributes, stride }
    }

    pub fn point_2d() -> Self {
        Self::new(vec![Attribute::new(0, 2, AttributeType::Float, true)])
    }

    pub fn textured_point_2d() -> Self {
        Self::new(vec![
            Attribute::new(0, 2, AttributeType::Float, true),
            Attribute::new(1, 2, AttributeType::Float, false),
        ])
    }

    pub fn colored_point_2d() -> Self {
        Self::new(vec![
            Attribute::new(0, 2, AttributeType::Float, true),
            Attribute::new(1, 4, AttributeType::UnsignedByte, false),
        ])
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Byte offset of the 2-float vertex coordinate, if any.
    pub fn position_offset(&self) -> Option<usize> {
        let mut offset = 0;
        for attr in &self.attributes {
            if attr.is_vertex_coordinate && attr.tuple_size == 2 && attr.ty == AttributeType::Float {
                return Some(offset);
            }
            offset += attr.byte_size();
        }
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DrawMode {
    Points,
    Lines,
    LineLoop,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Indices {
    None,
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl Indices {
    pub fn len(&self) -> usize {
        match self {
            Indices::None => 0,
            Indices::U16(v) => v.len(),
            Indices::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Indices::None => &[],
            Indices::U16(v) => bytemuck::cast_slice(v),
            Indices::U32(v) => bytemuck::cast_slice(v),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

/// Vertex position only.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct Point2D {
    pub x: f32,
    pub y: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct TexturedPoint2D {
    pub x: f32,
    pub y: f32,
    pub tx: f32,
    pub ty: f32,
}

/// Position plus a premultiplied RGBA8 color.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct ColoredPoint2D {
    pub x: f32,
    pub y: f32,
    pub color: [u8; 4],
}

/// Vertex and index data for one drawable.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    attributes: AttributeSet,
    vertex_data: Vec<u8>,
    vertex_count: usize,
    indices: Indices,
    mode: DrawMode,
    line_width: f32,
}

impl Geometry {
    /// Zero-filled geometry with room for `vertex_count` vertices.
    pub fn new(attributes: AttributeSet, vertex_count: usize, mode: DrawMode) -> Self {
        let vertex_data = vec![0; attributes.stride() * vertex_count];
        Self {
            attributes,
            vertex_data,
            vertex_count,
            indices: Indices::None,
            mode,
            line_width: 1.0,
        }
    }

    /// Geometry from typed vertices. The vertex type must match the layout's stride.
    pub fn from_vertices<V: Pod>(attributes: AttributeSet, vertices: &[V], mode: DrawMode) -> Self {
        debug_assert_eq!(std::mem::size_of::<V>(), attributes.stride());
        Self {
            vertex_data: bytemuck::cast_slice(vertices).to_vec(),
            vertex_count: vertices.len(),
            attributes,
            indices: Indices::None,
            mode,
            line_width: 1.0,
        }
    }

    /// A 4-vertex triangle strip covering `rect`.
    pub fn rect(rect: Rect) -> Self {
        let vertices = [
            Point2D { x: rect.left(), y: rect.top() },
            Point2D { x: rect.left(), y: rect.bottom() },
            Point2D { x: rect.right(), y: rect.top() },
            Point2D { x: rect.right(), y: rect.bottom() },
        ];
        Self::from_vertices(AttributeSet::point_2d(), &vertices, DrawMode::TriangleStrip)
    }

    /// Like [`Geometry::rect`] with a per-vertex color.
    pub fn colored_rect(rect: Rect, color: [u8; 4]) -> Self {
        let v = |x, y| ColoredPoint2D { x, y, color };
        let vertices = [
            v(rect.left(), rect.top()),
            v(rect.left(), rect.bottom()),
            v(rect.right(), rect.top()),
            v(rect.right(), rect.bottom()),
        ];
        Self::from_vertices(AttributeSet::colored_point_2d(), &vertices, DrawMode::TriangleStrip)
    }

    pub fn with_indices_u16(mut self, indices: Vec<u16>) -> Self {
        self.indices = Indices::U16(indices);
        self
    }

    pub fn with_indices_u32(mut self, indices: Vec<u32>) -> Self {
        self.indices = Indices::U32(indices);
        self
    }

    pub fn with_line_width(mut self, width: f32) -> Self {
        self.line_width = width;
        self
    }

    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    pub fn stride(&self) -> usize {
        self.attributes.stride()
    }

    pub fn vertex_data(&self) -> &[u8] {
        &self.vertex_data
    }

    pub fn vertex_data_mut(&mut self) -> &mut [u8] {
        &mut self.vertex_data
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    pub fn indices(&self) -> &Indices {
        &self.indices
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn index_format(&self) -> Option<IndexFormat> {
        match self.indices {
            Indices::None => None,
            Indices::U16(_) => Some(IndexFormat::U16),
            Indices::U32(_) => Some(IndexFormat::U32),
        }
    }

    pub fn mode(&self) -> DrawMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: DrawMode) {
        self.mode = mode;
    }

    pub fn line_width(&self) -> f32 {
        self.line_width
    }

    /// Read the position of vertex `i` given the position attribute offset.
    pub fn position_at(&self, i: usize, offset: usize) -> (f32, f32) {
        let start = i * self.stride() + offset;
        let p: Point2D = bytemuck::pod_read_unaligned(&self.vertex_data[start..start + 8]);
        (p.x, p.y)
    }

    /// Untransformed bounds of the vertex positions, or `None` without a
    /// position attribute.
    pub fn local_bounds(&self) -> Option<Bounds> {
        let offset = self.attributes.position_offset()?;
        let mut bounds = Bounds::EMPTY;
        for i in 0..self.vertex_count {
            let (x, y) = self.position_at(i, offset);
            bounds.include(x, y);
        }
        Some(bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_offset_skips_leading_attributes() {
        let set = AttributeSet::new(vec![
            Attribute::new(0, 4, AttributeType::UnsignedByte, false),
            Attribute::new(1, 2, AttributeType::Float, true),
        ]);
        assert_eq!(set.stride(), 12);
        assert_eq!(set.position_offset(), Some(4));

        let no_pos = AttributeSet::new(vec![Attribute::new(0, 3, AttributeType::Float, true)]);
        assert_eq!(no_pos.position_offset(), None);
    }

    #[test]
    fn test_rect_geometry_bounds() {
        let g = Geometry::rect(Rect::new(10.0, 20.0, 30.0, 40.0));
        assert_eq!(g.vertex_count(), 4);
        assert_eq!(g.mode(), DrawMode::TriangleStrip);
        assert_eq!(g.local_bounds(), Some(Bounds::new(10.0, 20.0, 40.0, 60.0)));
    }

    #[test]
    fn test_colored_rect_layout() {
        let g = Geometry::colored_rect(Rect::new(0.0, 0.0, 1.0, 1.0), [255, 0, 0, 255]);
        assert_eq!(g.stride(), 12);
        assert_eq!(g.vertex_data().len(), 48);
        assert_eq!(g.position_at(3, 0), (1.0, 1.0));
    }

    #[test]
    fn test_bounds_intersects_is_strict() {
        let a = Bounds::new(0.0, 0.0, 10.0, 10.0);
        let touching = Bounds::new(10.0, 0.0, 20.0, 10.0);
        let overlapping = Bounds::new(5.0, 5.0, 15.0, 15.0);
        assert!(!a.intersects(&touching));
        assert!(a.intersects(&overlapping));
        assert!(Bounds::EVERYTHING.intersects(&a));
    }

    #[test]
    fn test_bounds_map_rotation() {
        let b = Bounds::new(0.0, 0.0, 10.0, 20.0);
        let mapped = b.map(&Transform::rotate_degrees(90.0));
        assert!((mapped.min_x + 20.0).abs() < 1e-4);
        assert!((mapped.max_x - 0.0).abs() < 1e-4);
        assert!((mapped.max_y - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_bounds_sanitized_and_float_range() {
        let b = Bounds::new(f32::NAN, 0.0, f32::INFINITY, 5.0).sanitized();
        assert_eq!(b.min_x, -f32::MAX);
        assert_eq!(b.max_x, f32::MAX);
        assert!(b.is_outside_float_range());
        assert!(!Bounds::new(0.0, 0.0, 100.0, 100.0).is_outside_float_range());
    }
}
