use std::{path::Path, sync::Arc};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::{data_structures::texture::FilterMode, gpu::GpuBackend};

/// How strictly the glTF front-end reads material definitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GltfMode {
    /// Only glTF 2.0 fields are honoured.
    Strict,
    /// Also accept the legacy `values/baseColorTexture` material block.
    #[default]
    Lenient,
}

/// How `.fbx` files are read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FbxFlavor {
    /// Read through Assimp (`assimp` feature). Meshes must already be
    /// triangulated. Other meshes are skipped.
    Legacy,
    /// Built-in binary reader. Triangulates on load, generates missing normals
    /// and de-duplicates vertices.
    #[default]
    Modern,
}

/// Tunables for the import pipeline.
///
/// Everything has a sensible default, so most callers only touch
/// `dictionary_prefix`. A JSON file with any subset of the fields can be
/// layered on top with [`ImportConfig::from_json_file`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// First segment of every dictionary key created by a load.
    pub dictionary_prefix: String,
    /// Worker threads for texture decoding and node construction. 0 lets rayon decide.
    pub worker_threads: usize,
    /// Min/mag filter used when a source texture does not name one.
    pub default_filter: FilterMode,
    /// Used in place of `1/det` when the UV determinant of a triangle is ~0.
    pub tangent_fallback: f32,
    pub grass_threshold: f32,
    /// Fixed seed for grass placement. `None` seeds from entropy.
    pub grass_seed: Option<u64>,
    pub gltf_mode: GltfMode,
    pub fbx_flavor: FbxFlavor,
    /// Samples per second when FBX animation curves are baked.
    pub fbx_bake_rate: f32,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            dictionary_prefix: "SL".to_string(),
            worker_threads: 0,
            default_filter: FilterMode::LinearMipmapLinear,
            tangent_fallback: 1e5,
            grass_threshold: 0.05,
            grass_seed: None,
            gltf_mode: GltfMode::default(),
            fbx_flavor: FbxFlavor::default(),
            fbx_bake_rate: 30.0,
        }
    }
}

impl ImportConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read import config {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse import config {}", path.display()))?;
        Ok(config)
    }
}

/// Everything a load needs besides the scene it writes into: the GPU
/// backend, the configuration and the worker pool.
pub struct Context {
    pub backend: Arc<dyn GpuBackend>,
    pub config: ImportConfig,
    pool: rayon::ThreadPool,
}

impl Context {
    pub fn new(backend: Arc<dyn GpuBackend>, config: ImportConfig) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|idx| format!("flow-import-{idx}"))
            .build()
            .context("Failed to build the import worker pool")?;
        Ok(Self {
            backend,
            config,
            pool,
        })
    }

    /// Runs `op` inside the import worker pool so nested `par_iter`s use it.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    pub fn backend(&self) -> &dyn GpuBackend {
        self.backend.as_ref()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}
