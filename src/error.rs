use thiserror::Error;

use crate::scene::NodeId;

/// A material's program failed to build.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShaderError {
    #[error("Failed to compile shader for {material}: {reason}")]
    Compile { material: String, reason: String },
    #[error("Material {0} has no shader")]
    Unsupported(String),
}

/// A compiled program rejected the material state it was given.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Material state error: {0}")]
pub struct MaterialError(pub String);

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Material error while rendering node {node:?}: {source}")]
    Material {
        node: NodeId,
        #[source]
        source: MaterialError,
    },
    #[error("Batch references a missing batch root")]
    MissingRoot,
    #[error("Backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, RenderError>;
