//! flow-import
//!
//! Asset ingestion for the flow engine. Source files (glTF 2.0 / GLB, FBX and
//! heightmap images) are parsed into a neutral document, normalized into
//! GPU-ready vertex and index buffers with PBR materials and skeletal
//! animation, and then instantiated N times into an entity registry and a
//! named scene graph. Repeated instances share one model and one instance
//! buffer.
//!
//! High-level modules
//! - `context`: import configuration, worker pool and the GPU backend handle
//! - `data_structures`: engine data models (models, materials, instances, skeletons)
//! - `error`: the error kinds a load can fail with
//! - `gpu`: the backend seam and its headless and `wgpu` implementations
//! - `resources`: importers, scene construction and terrain
//! - `watcher`: background path watcher
//!

pub mod context;
pub mod data_structures;
pub mod error;
pub mod gpu;
pub mod resources;
pub mod watcher;

// Re-exports commonly used types for convenience in downstream code.
pub use context::{Context, FbxFlavor, GltfMode, ImportConfig};
pub use data_structures::{registry::Entity, scene_graph::Scene};
pub use error::ImportError;
pub use gpu::{GpuBackend, HeadlessBackend, WgpuBackend};
pub use resources::{
    ModelLoader,
    scene::LoadedAsset,
    terrain::{GrassSpec, LoadedTerrain, TerrainMaterial, TerrainSpec},
};

/// Initialises `env_logger` once. Later calls are ignored.
pub fn init_logging() {
    if let Err(e) = env_logger::try_init() {
        log::debug!("Logger already initialised: {}", e);
    }
}
