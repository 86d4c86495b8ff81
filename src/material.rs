//! Materials: the render-state half of a drawable.
//!
//! The renderer never looks inside a material. It only needs:
//! - a type identity (programs are cached per material type)
//! - a total order within one type, so equal materials can share a batch
//! - a few flags that decide opacity classification and mergeability

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt;

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MaterialFlags: u32 {
        /// The material blends with what is below it
        const BLENDING = 1 << 0;
        const REQUIRES_DETERMINANT = 1 << 1;
        /// Needs the real model-view matrix unless all vertices are translate-only
        const REQUIRES_FULL_MATRIX_EXCEPT_TRANSLATE = (1 << 2) | Self::REQUIRES_DETERMINANT.bits();
        /// Always needs the real model-view matrix; never pre-transformed
        const REQUIRES_FULL_MATRIX = (1 << 3) | Self::REQUIRES_FULL_MATRIX_EXCEPT_TRANSLATE.bits();
        /// Program compilation is customized per material, so no depth rewrite
        const CUSTOM_COMPILE_STEP = 1 << 4;
    }
}

/// A material attached to a geometry node.
///
/// `compare` is only called between two materials of the same concrete type;
/// implementations downcast `other` through [`Material::as_any`].
pub trait Material: fmt::Debug + 'static {
    fn flags(&self) -> MaterialFlags {
        MaterialFlags::empty()
    }

    /// Order two materials of the same type. `Equal` means they can be
    /// drawn with a single state setup.
    fn compare(&self, other: &dyn Material) -> Ordering;

    fn as_any(&self) -> &dyn Any;
}

/// Type identity used as the program cache key.
pub type MaterialType = TypeId;

pub fn material_type(material: &dyn Material) -> MaterialType {
    material.as_any().type_id()
}

/// True when both materials share a type and compare equal.
pub fn materials_equal(a: &dyn Material, b: &dyn Material) -> bool {
    material_type(a) == material_type(b) && a.compare(b) == Ordering::Equal
}


#[cfg(test)]
mod tests {
    use super::test_materials::*;
    use super::*;

    #[test]
    fn test_full_matrix_implies_except_translate() {
        let f = MaterialFlags::REQUIRES_FULL_MATRIX;
        assert!(f.contains(MaterialFlags::REQUIRES_FULL_MATRIX_EXCEPT_TRANSLATE));
        assert!(f.contains(MaterialFlags::REQUIRES_DETERMINANT));
        assert!(!MaterialFlags::REQUIRES_FULL_MATRIX_EXCEPT_TRANSLATE
            .contains(MaterialFlags::REQUIRES_FULL_MATRIX));
    }

    #[test]
    fn test_materials_equal() {
        let a = FlatColor::opaque([1, 2, 3, 255]);
        let b = FlatColor::opaque([1, 2, 3, 255]);
        let c = FlatColor::opaque([9, 2, 3, 255]);
        let t = Textured { texture: 1 };
        assert!(materials_equal(&a, &b));
        assert!(!materials_equal(&a, &c));
        assert!(!materials_equal(&a, &t));
        assert_ne!(material_type(&a), material_type(&t));
    }
}
