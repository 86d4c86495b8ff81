//! Program cache keyed by material type.
//!
//! Merged batches draw with programs rewritten to take a per-vertex depth
//! attribute; unmerged batches use the stock program and get their depth
//! through the projection matrix. Both variants are cached separately.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::backend::ProgramId;
use crate::error::{MaterialError, ShaderError};
use crate::material::{material_type, Material, MaterialType};
use crate::transform::Transform;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompiledProgram {
    pub program: ProgramId,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StateDirty: u32 {
        const MATRIX = 1 << 0;
        const OPACITY = 1 << 1;
    }
}

/// Uniform state handed to [`ShaderCompiler::update_state`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaterialState {
    pub projection: Transform,
    pub model_view: Transform,
    /// `projection * model_view`
    pub combined: Transform,
    pub opacity: f32,
    pub determinant: f32,
    pub dirty: StateDirty,
}

impl MaterialState {
    pub fn new(projection: Transform, model_view: Transform, opacity: f32, dirty: StateDirty) -> Self {
        Self {
            projection,
            model_view,
            combined: projection.then(&model_view),
            opacity,
            determinant: model_view.determinant(),
            dirty,
        }
    }
}

/// Host-provided program compiler.
pub trait ShaderCompiler {
    /// Build the program for `material`. With `rewrite_for_depth` the vertex
    /// stage must take an extra per-vertex f32 depth and write it to z.
    fn compile(&mut self, material: &dyn Material, rewrite_for_depth: bool) -> Result<CompiledProgram, ShaderError>;

    /// Push `state` and the material's uniforms into `program`. `previous`
    /// is the material last used with this program, if any.
    fn update_state(
        &mut self,
        program: ProgramId,
        state: &MaterialState,
        material: &dyn Material,
        previous: Option<&dyn Material>,
    ) -> Result<(), MaterialError>;
}

/// Identifies one cached program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaderKey {
    material: MaterialType,
    rewritten: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct Shader {
    pub program: ProgramId,
    /// Opacity last pushed to the program; negative until first use
    pub last_opacity: f32,
}

pub struct ShaderCache {
    compiler: Box<dyn ShaderCompiler>,
    programs: HashMap<ShaderKey, Shader>,
}

impl ShaderCache {
    pub fn new(compiler: impl ShaderCompiler + 'static) -> Self {
        Self {
            compiler: Box::new(compiler),
            programs: HashMap::new(),
        }
    }

    /// Depth-rewritten program for merged batches.
    pub fn prepare_material(&mut self, material: &dyn Material) -> Option<(ShaderKey, Shader)> {
        self.prepare(material, true)
    }

    pub fn prepare_material_no_rewrite(&mut self, material: &dyn Material) -> Option<(ShaderKey, Shader)> {
        self.prepare(material, false)
    }

    fn prepare(&mut self, material: &dyn Material, rewritten: bool) -> Option<(ShaderKey, Shader)> {
        let key = ShaderKey {
            material: material_type(material),
            rewritten,
        };
        if let Some(shader) = self.programs.get(&key) {
            return Some((key, *shader));
        }
        // Failures are not cached; the next frame tries again.
        match self.compiler.compile(material, rewritten) {
            Ok(compiled) => {
                let shader = Shader {
                    program: compiled.program,
                    last_opacity: -1.0,
                };
                log::debug!(target: "tessera::render", "compiled {:?} (depth rewrite: {})", material, rewritten);
                self.programs.insert(key, shader);
                Some((key, shader))
            }
            Err(e) => {
                log::warn!(target: "tessera::render", "{}", e);
                None
            }
        }
    }

    /// Push state through the compiler and remember the opacity.
    pub fn update_state(
        &mut self,
        key: ShaderKey,
        state: &MaterialState,
        material: &dyn Material,
        previous: Option<&dyn Material>,
    ) -> Result<(), MaterialError> {
        let Some(shader) = self.programs.get_mut(&key) else {
            return Err(MaterialError(format!("no program cached for {:?}", material)));
        };
        self.compiler.update_state(shader.program, state, material, previous)?;
        shader.last_opacity = state.opacity;
        Ok(())
    }

    pub fn shader(&self, key: ShaderKey) -> Option<&Shader> {
        self.programs.get(&key)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Drop every cached program, e.g. after the device was lost.
    pub fn invalidate(&mut self) {
        self.programs.clear();
    }
}

#[cfg(test)]
pub(crate) mod test_compiler {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[derive(Debug, Default)]
    pub struct CompilerLog {
        pub compiles: Vec<bool>,
        pub updates: Vec<(ProgramId, f32)>,
        pub fail_compile: bool,
        pub fail_update: bool,
    }

    /// Hands out sequential program ids and records every call.
    #[derive(Default, Clone)]
    pub struct CountingCompiler {
        pub log: Rc<RefCell<CompilerLog>>,
        next: u32,
    }

    impl ShaderCompiler for CountingCompiler {
        fn compile(&mut self, material: &dyn Material, rewrite: bool) -> Result<CompiledProgram, ShaderError> {
            let mut log = self.log.borrow_mut();
            log.compiles.push(rewrite);
            if log.fail_compile {
                return Err(ShaderError::Compile {
                    material: format!("{:?}", material),
                    reason: "forced".into(),
                });
            }
            self.next += 1;
            Ok(CompiledProgram {
                program: ProgramId(self.next),
            })
        }

        fn update_state(
            &mut self,
            program: ProgramId,
            state: &MaterialState,
            _material: &dyn Material,
            _previous: Option<&dyn Material>,
        ) -> Result<(), MaterialError> {
            let mut log = self.log.borrow_mut();
            if log.fail_update {
                return Err(MaterialError("forced".into()));
            }
            log.updates.push((program, state.opacity));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_compiler::CountingCompiler;
    use super::*;
    use crate::material::test_materials::{FlatColor, Textured};

    #[test]
    fn test_programs_cached_per_type_and_variant() {
        let compiler = CountingCompiler::default();
        let log = compiler.log.clone();
        let mut cache = ShaderCache::new(compiler);

        let red = FlatColor::opaque([255, 0, 0, 255]);
        let blue = FlatColor::opaque([0, 0, 255, 255]);
        let (k1, s1) = cache.prepare_material(&red).unwrap();
        let (k2, s2) = cache.prepare_material(&blue).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(s1.program, s2.program);

        let (k3, _) = cache.prepare_material_no_rewrite(&red).unwrap();
        assert_ne!(k1, k3);
        cache.prepare_material(&Textured { texture: 1 }).unwrap();

        assert_eq!(log.borrow().compiles, vec![true, false, true]);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_failed_compile_is_retried() {
        let compiler = CountingCompiler::default();
        let log = compiler.log.clone();
        let mut cache = ShaderCache::new(compiler);
        log.borrow_mut().fail_compile = true;

        let m = FlatColor::opaque([0, 0, 0, 255]);
        assert!(cache.prepare_material(&m).is_none());
        assert!(cache.prepare_material(&m).is_none());
        assert_eq!(log.borrow().compiles.len(), 2);

        log.borrow_mut().fail_compile = false;
        assert!(cache.prepare_material(&m).is_some());
    }

    #[test]
    fn test_update_state_tracks_opacity() {
        let mut cache = ShaderCache::new(CountingCompiler::default());
        let m = FlatColor::blended([0, 0, 0, 128]);
        let (key, shader) = cache.prepare_material_no_rewrite(&m).unwrap();
        assert!(shader.last_opacity < 0.0);

        let state = MaterialState::new(Transform::IDENTITY, Transform::IDENTITY, 0.5, StateDirty::all());
        cache.update_state(key, &state, &m, None).unwrap();
        assert_eq!(cache.shader(key).map(|s| s.last_opacity), Some(0.5));
    }
}
