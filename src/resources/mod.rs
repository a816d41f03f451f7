use std::path::Path;

use anyhow::bail;

use crate::{
    context::{Context, ImportConfig},
    data_structures::{instance::Transform, registry::Entity, scene_graph::Scene},
    error::ImportError,
    resources::{
        dom::SourceAsset,
        scene::{LoadRequest, LoadedAsset},
        terrain::{LoadedTerrain, TerrainSpec},
    },
};

/**
 * This module contains all logic for loading meshes, textures, skeletons and
 * terrain from external files and turning them into scene content.
 */
pub mod animation;
#[cfg(feature = "assimp")]
pub mod assimp;
pub mod dom;
pub mod fbx;
pub mod fbx_graph;
pub mod fbx_reader;
pub mod gltf;
pub mod mesh;
pub mod scene;
pub mod terrain;
pub mod texture;
pub mod transaction;

/// Source formats, picked by file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetFormat {
    Gltf,
    Fbx,
}

impl AssetFormat {
    pub fn from_path(path: &Path) -> Result<Self, ImportError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| ImportError::InvalidPath(path.to_path_buf()))?;
        match extension.to_ascii_lowercase().as_str() {
            "gltf" | "glb" => Ok(AssetFormat::Gltf),
            "fbx" => Ok(AssetFormat::Fbx),
            other => Err(ImportError::UnsupportedFormat(format!(
                "no importer for .{other} files"
            ))),
        }
    }
}

/// Reads `path` with the front-end its extension selects. Files without any
/// mesh are rejected.
pub fn parse_asset(config: &ImportConfig, path: &Path, scene_id: Option<usize>) -> anyhow::Result<SourceAsset> {
    if path.file_name().is_none() {
        bail!(ImportError::InvalidPath(path.to_path_buf()));
    }
    let format = AssetFormat::from_path(path)?;
    if !path.is_file() {
        bail!(ImportError::FileNotFound(path.to_path_buf()));
    }
    let asset = match format {
        AssetFormat::Gltf => gltf::parse(path, config.gltf_mode)?,
        AssetFormat::Fbx => {
            if let Some(id) = scene_id {
                log::warn!("FBX files have a single scene, ignoring scene id {}", id);
            }
            fbx::parse(path, config.fbx_flavor, config.fbx_bake_rate)?
        }
    };
    if asset.meshes.iter().all(|mesh| mesh.primitives.is_empty()) {
        bail!(ImportError::MissingRequiredField(format!(
            "{} contains no meshes",
            path.display()
        )));
    }
    log::debug!(
        "Parsed {}: {} nodes, {} meshes, {} materials, {} images, {} animations",
        path.display(),
        asset.nodes.len(),
        asset.meshes.len(),
        asset.materials.len(),
        asset.images.len(),
        asset.animations.len()
    );
    Ok(asset)
}

/// The invocation surface: loads assets and terrain into a [`Scene`].
#[derive(Debug)]
pub struct ModelLoader {
    ctx: Context,
}

impl ModelLoader {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn dictionary_prefix(&self) -> &str {
        &self.ctx.config.dictionary_prefix
    }

    /// Namespace for the dictionary keys of subsequent loads.
    pub fn set_dictionary_prefix(&mut self, prefix: impl Into<String>) {
        self.ctx.config.dictionary_prefix = prefix.into();
    }

    /// Loads `instances` instances of `path`. Failures are logged and leave
    /// the scene as it was.
    pub fn load(
        &self,
        scene: &mut Scene,
        path: impl AsRef<Path>,
        instances: usize,
        scene_id: Option<usize>,
    ) -> bool {
        match self.try_load(scene, path, instances, scene_id) {
            Ok(_) => true,
            Err(e) => {
                log::error!("{:#}", e);
                false
            }
        }
    }

    pub fn try_load(
        &self,
        scene: &mut Scene,
        path: impl AsRef<Path>,
        instances: usize,
        scene_id: Option<usize>,
    ) -> anyhow::Result<LoadedAsset> {
        let path = path.as_ref();
        let asset = parse_asset(&self.ctx.config, path, scene_id)?;
        let key_path = path.to_string_lossy();
        scene::construct(
            &self.ctx,
            scene,
            &asset,
            &LoadRequest {
                path: &key_path,
                prefix: &self.ctx.config.dictionary_prefix,
                instances,
                scene_id,
                group: None,
                root_transform: Transform::new(),
            },
        )
    }

    /// Loads a single instance of `path` directly under `group`, without an
    /// instance root.
    pub fn load_into(
        &self,
        scene: &mut Scene,
        group: Entity,
        path: impl AsRef<Path>,
        scene_id: Option<usize>,
    ) -> anyhow::Result<LoadedAsset> {
        if scene.graph.node(group).is_none() {
            bail!("Group {:?} is not part of the scene graph", group);
        }
        let path = path.as_ref();
        let asset = parse_asset(&self.ctx.config, path, scene_id)?;
        let key_path = path.to_string_lossy();
        scene::construct(
            &self.ctx,
            scene,
            &asset,
            &LoadRequest {
                path: &key_path,
                prefix: &self.ctx.config.dictionary_prefix,
                instances: 1,
                scene_id,
                group: Some(group),
                root_transform: Transform::new(),
            },
        )
    }

    /// Builds a heightmap terrain (and its grass, if configured).
    pub fn load_terrain(
        &self,
        scene: &mut Scene,
        instances: usize,
        spec: &TerrainSpec,
    ) -> anyhow::Result<LoadedTerrain> {
        terrain::load(&self.ctx, scene, instances, spec)
    }
}
