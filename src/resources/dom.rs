//! The neutral source document every importer front-end fills.
//!
//! glTF and FBX describe the same things in different vocabularies. Each
//! front-end translates its file into a [`SourceAsset`] and everything after
//! that (geometry normalization, materials, skeletons, scene construction)
//! only ever sees this representation. Textures, images and materials are
//! arenas referenced by index.

use std::path::PathBuf;

use cgmath::{Matrix4, Vector4};

use crate::data_structures::{
    animation::{Interpolation, Path},
    instance::Transform,
    material::{TEXTURE_SLOT_COUNT, TextureTransform},
    tags::{CameraTag, LightTag},
    texture::FilterMode,
};

#[derive(Clone, Debug, Default)]
pub struct SourceAsset {
    pub scenes: Vec<SourceScene>,
    /// Scene used when the caller does not ask for one.
    pub default_scene: usize,
    pub nodes: Vec<SourceNode>,
    pub meshes: Vec<SourceMesh>,
    pub materials: Vec<SourceMaterial>,
    pub textures: Vec<SourceTexture>,
    pub images: Vec<SourceImage>,
    pub skins: Vec<SourceSkin>,
    pub animations: Vec<SourceAnimation>,
}

#[derive(Clone, Debug, Default)]
pub struct SourceScene {
    pub name: String,
    pub roots: Vec<usize>,
}

/// A node's local transform as the source stored it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LocalTransform {
    Matrix([[f32; 4]; 4]),
    /// Rotation is stored `xyzw`.
    Trs {
        translation: [f32; 3],
        rotation: [f32; 4],
        scale: [f32; 3],
    },
}

impl Default for LocalTransform {
    fn default() -> Self {
        LocalTransform::Trs {
            translation: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: [1.0; 3],
        }
    }
}

impl LocalTransform {
    pub fn to_transform(&self) -> Transform {
        match *self {
            LocalTransform::Matrix(m) => Transform::from_matrix(Matrix4::from(m)),
            LocalTransform::Trs {
                translation,
                rotation,
                scale,
            } => Transform::from_trs(translation, rotation, scale),
        }
    }

    pub fn to_matrix(&self) -> Matrix4<f32> {
        match *self {
            LocalTransform::Matrix(m) => Matrix4::from(m),
            LocalTransform::Trs { .. } => self.to_transform().to_matrix(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SourceNode {
    pub name: String,
    pub children: Vec<usize>,
    pub transform: LocalTransform,
    pub mesh: Option<usize>,
    pub skin: Option<usize>,
    pub camera: Option<CameraTag>,
    pub light: Option<LightTag>,
}

impl SourceNode {
    /// Mesh, camera or light: the node becomes a game object.
    pub fn is_game_object(&self) -> bool {
        self.mesh.is_some() || self.camera.is_some() || self.light.is_some()
    }
}

#[derive(Clone, Debug, Default)]
pub struct SourceMesh {
    pub name: String,
    pub primitives: Vec<SourcePrimitive>,
}

/// Vertex streams of one primitive, already converted to float.
#[derive(Clone, Debug, Default)]
pub struct SourcePrimitive {
    pub positions: Vec<[f32; 3]>,
    pub normals: Option<Vec<[f32; 3]>>,
    pub uvs: Option<Vec<[f32; 2]>>,
    /// Linear RGBA.
    pub colors: Option<Vec<[f32; 4]>>,
    pub tangents: Option<Vec<[f32; 3]>>,
    pub joints: Option<Vec<[u32; 4]>>,
    pub weights: Option<Vec<[f32; 4]>>,
    pub indices: Option<Vec<u32>>,
    pub material: Option<usize>,
}

/// A reference from a material slot to the texture arena.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TextureRef {
    pub texture: usize,
    pub transform: Option<TextureTransform>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceMaterial {
    pub name: String,
    pub base_color: [f32; 4],
    /// Scalar multiplied into all four base color components.
    pub base_factor: Option<f32>,
    pub roughness: Option<f32>,
    /// Resolved by the front-end, which knows its format's default.
    pub metallic: f32,
    pub normal_scale: Option<f32>,
    pub emissive: [f32; 3],
    pub emissive_strength: Option<f32>,
    /// Indexed by [`crate::data_structures::material::TextureSlot`].
    pub textures: [Option<TextureRef>; TEXTURE_SLOT_COUNT],
}

impl Default for SourceMaterial {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_color: [1.0; 4],
            base_factor: None,
            roughness: None,
            metallic: 0.0,
            normal_scale: None,
            emissive: [0.0; 3],
            emissive_strength: None,
            textures: [None; TEXTURE_SLOT_COUNT],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceTexture {
    pub image: usize,
    pub min_filter: Option<FilterMode>,
    pub mag_filter: Option<FilterMode>,
}

/// Where the bytes of an image come from. Nothing is decoded at parse time.
#[derive(Clone, Debug)]
pub enum ImageData {
    Encoded {
        bytes: Vec<u8>,
        mime_type: Option<String>,
    },
    File(PathBuf),
    /// Already decoded by the container parser.
    Decoded(image::DynamicImage),
    /// The source referenced an image that could not be located.
    Missing(String),
}

#[derive(Clone, Debug)]
pub struct SourceImage {
    pub name: String,
    pub data: ImageData,
}

#[derive(Clone, Debug, Default)]
pub struct SourceSkin {
    pub name: String,
    /// Node indices in canonical joint order.
    pub joints: Vec<usize>,
    pub inverse_bind_matrices: Vec<[[f32; 4]; 4]>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceSampler {
    pub interpolation: Interpolation,
    pub times: Vec<f32>,
    /// For cubic splines three entries per time: in tangent, value, out tangent.
    pub outputs: Vec<Vector4<f32>>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceChannel {
    pub node: usize,
    pub path: Path,
    pub sampler: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceAnimation {
    pub name: String,
    pub samplers: Vec<SourceSampler>,
    pub channels: Vec<SourceChannel>,
}

impl SourceAsset {
    /// Parent of every node, `None` for roots.
    pub fn parents(&self) -> Vec<Option<usize>> {
        let mut parents = vec![None; self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            for &child in &node.children {
                if let Some(slot) = parents.get_mut(child) {
                    *slot = Some(idx);
                }
            }
        }
        parents
    }

    /// Nodes nobody lists as a child, in source order.
    pub fn root_nodes(&self) -> Vec<usize> {
        self.parents()
            .iter()
            .enumerate()
            .filter(|(_, parent)| parent.is_none())
            .map(|(idx, _)| idx)
            .collect()
    }
}
