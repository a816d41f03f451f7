//! FBX front-end.
//!
//! A reader (the built-in binary reader, or Assimp behind the `assimp`
//! feature) fills an [`FbxDocument`]; [`to_source`] turns that into the neutral
//! [`SourceAsset`]. All FBX conventions live in the conversion: sRGB vertex
//! colors, centimeter units, metallic/roughness defaults, per-bone vertex
//! weights and keyed (not sampled) animation tracks.

use std::{collections::HashMap, path::PathBuf};

use cgmath::{InnerSpace, Matrix4, Quaternion, VectorSpace};

use crate::{
    context::FbxFlavor,
    data_structures::{
        animation::{Interpolation, Path, quat_output, vec3_output},
        material::{TEXTURE_SLOT_COUNT, TextureSlot},
    },
    error::ImportError,
    resources::{
        dom::{
            ImageData, LocalTransform, SourceAnimation, SourceAsset, SourceChannel, SourceImage,
            SourceMaterial, SourceMesh, SourceNode, SourcePrimitive, SourceSampler, SourceScene,
            SourceSkin, SourceTexture, TextureRef,
        },
        mesh::srgb_to_linear,
    },
};

/// FBX files are authored in centimeters.
const CENTIMETERS_PER_METER: f32 = 100.0;
/// Samples per second when the configured bake rate is unusable.
const DEFAULT_BAKE_RATE: f32 = 30.0;
/// Metallic used when an FBX material does not carry one.
pub const DEFAULT_METALLIC: f32 = 0.886;

/// An FBX scene as the parser hands it over. Node 0 is the scene root.
#[derive(Clone, Debug, Default)]
pub struct FbxDocument {
    pub nodes: Vec<FbxNode>,
    pub meshes: Vec<FbxMesh>,
    pub materials: Vec<FbxMaterial>,
    pub animations: Vec<FbxAnimation>,
}

#[derive(Clone, Debug)]
pub struct FbxNode {
    pub name: String,
    pub children: Vec<usize>,
    /// Column-major local transform.
    pub transform: [[f32; 4]; 4],
    pub meshes: Vec<usize>,
}

impl Default for FbxNode {
    fn default() -> Self {
        Self {
            name: String::new(),
            children: Vec::new(),
            transform: Matrix4::<f32>::from_scale(1.0).into(),
            meshes: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FbxMesh {
    pub name: String,
    pub positions: Vec<[f32; 3]>,
    pub normals: Option<Vec<[f32; 3]>>,
    pub tangents: Option<Vec<[f32; 3]>>,
    pub uvs: Option<Vec<[f32; 2]>>,
    /// sRGB encoded, as stored in the file.
    pub colors: Option<Vec<[f32; 4]>>,
    /// Polygons as vertex index lists. Anything but triangles needs the modern flavor.
    pub faces: Vec<Vec<u32>>,
    pub bones: Vec<FbxBone>,
    pub material: usize,
}

#[derive(Clone, Debug)]
pub struct FbxBone {
    /// Name of the node the bone is attached to.
    pub name: String,
    /// Mesh space to bone space, column-major.
    pub offset: [[f32; 4]; 4],
    /// `(vertex, weight)` pairs.
    pub weights: Vec<(u32, f32)>,
}

#[derive(Clone, Debug)]
pub enum FbxTextureSource {
    /// Relative paths are resolved against the FBX file's directory.
    File(PathBuf),
    Embedded {
        name: String,
        bytes: Vec<u8>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct FbxMaterial {
    pub name: String,
    pub diffuse: [f32; 4],
    pub base_factor: Option<f32>,
    pub metallic: Option<f32>,
    pub roughness: Option<f32>,
    pub emissive: [f32; 3],
    pub emissive_strength: Option<f32>,
    /// Indexed by [`TextureSlot`].
    pub textures: [Option<FbxTextureSource>; TEXTURE_SLOT_COUNT],
}

/// Keyed tracks of one node. Times are in seconds.
#[derive(Clone, Debug, Default)]
pub struct FbxTrack {
    pub node: String,
    pub translations: Vec<(f32, [f32; 3])>,
    /// Rotations stored `xyzw`.
    pub rotations: Vec<(f32, [f32; 4])>,
    pub scales: Vec<(f32, [f32; 3])>,
}

#[derive(Clone, Debug, Default)]
pub struct FbxAnimation {
    pub name: String,
    pub tracks: Vec<FbxTrack>,
}

/// Options that influence the conversion.
#[derive(Clone, Copy, Debug)]
pub struct FbxConversion<'a> {
    pub flavor: FbxFlavor,
    /// Samples per second for baked tracks.
    pub bake_rate: f32,
    pub base_dir: Option<&'a std::path::Path>,
}

/**
 * Reads an FBX file. The modern flavor uses the built-in binary reader; the
 * legacy flavor goes through Assimp and needs the `assimp` feature. Without
 * it legacy loads fail with [`ImportError::UnsupportedFormat`].
 */
pub fn parse(path: &std::path::Path, flavor: FbxFlavor, bake_rate: f32) -> anyhow::Result<SourceAsset> {
    let document = match flavor {
        FbxFlavor::Modern => crate::resources::fbx_graph::read(path)?,
        FbxFlavor::Legacy => read_legacy(path)?,
    };
    to_source(
        &document,
        &FbxConversion {
            flavor,
            bake_rate,
            base_dir: path.parent(),
        },
    )
}

#[cfg(feature = "assimp")]
fn read_legacy(path: &std::path::Path) -> anyhow::Result<FbxDocument> {
    crate::resources::assimp::read(path)
}

#[cfg(not(feature = "assimp"))]
fn read_legacy(path: &std::path::Path) -> anyhow::Result<FbxDocument> {
    Err(ImportError::UnsupportedFormat(format!(
        "{} asks for the legacy FBX reader, which needs the `assimp` feature",
        path.display()
    ))
    .into())
}

/// Seconds per animation tick. A rate of zero or less means keys are already in seconds.
pub(crate) fn seconds_per_tick(ticks_per_second: f64) -> f64 {
    if ticks_per_second.is_finite() && ticks_per_second > 0.0 {
        1.0 / ticks_per_second
    } else {
        1.0
    }
}

/// Converts a parsed FBX document into the neutral source representation.
pub fn to_source(document: &FbxDocument, conversion: &FbxConversion<'_>) -> anyhow::Result<SourceAsset> {
    if document.nodes.is_empty() {
        anyhow::bail!(ImportError::MissingRequiredField("FBX scene without a root node".to_string()));
    }
    let node_by_name: HashMap<&str, usize> = document
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| !node.name.is_empty())
        .map(|(idx, node)| (node.name.as_str(), idx))
        .collect();

    let skin = collect_skin(document, &node_by_name);
    let bone_to_joint: HashMap<&str, usize> = skin
        .joints
        .iter()
        .enumerate()
        .map(|(joint, &node)| (document.nodes[node].name.as_str(), joint))
        .collect();

    let primitives: Vec<Option<SourcePrimitive>> = document
        .meshes
        .iter()
        .map(|mesh| convert_mesh(mesh, conversion.flavor, &bone_to_joint))
        .collect();

    let mut asset = SourceAsset::default();
    let top_level: Vec<usize> = document.nodes[0].children.clone();
    for (idx, node) in document.nodes.iter().enumerate() {
        let mut transform = LocalTransform::Matrix(node.transform);
        if top_level.contains(&idx) {
            transform = to_meters(&transform);
        }
        let primitives: Vec<SourcePrimitive> = node
            .meshes
            .iter()
            .filter_map(|&mesh| primitives.get(mesh).cloned().flatten())
            .collect();
        let mesh = if primitives.is_empty() {
            None
        } else {
            asset.meshes.push(SourceMesh {
                name: node.name.clone(),
                primitives,
            });
            Some(asset.meshes.len() - 1)
        };
        asset.nodes.push(SourceNode {
            name: node.name.clone(),
            children: node.children.clone(),
            transform,
            mesh,
            skin: (mesh.is_some() && !skin.joints.is_empty()).then_some(0),
            camera: None,
            light: None,
        });
    }
    if !skin.joints.is_empty() {
        asset.skins.push(skin);
    }

    convert_materials(document, conversion, &mut asset);
    asset.animations = document
        .animations
        .iter()
        .map(|animation| bake_animation(animation, &asset, &node_by_name, &top_level, conversion.bake_rate))
        .collect();
    asset.scenes.push(SourceScene {
        name: if document.nodes[0].name.is_empty() {
            "scene_0".to_string()
        } else {
            document.nodes[0].name.clone()
        },
        roots: vec![0],
    });
    Ok(asset)
}

/// Scales a top-level transform from centimeters to meters.
fn to_meters(transform: &LocalTransform) -> LocalTransform {
    let mut t = transform.to_transform();
    t.scale /= CENTIMETERS_PER_METER;
    t.position /= CENTIMETERS_PER_METER;
    LocalTransform::Trs {
        translation: t.position.into(),
        rotation: t.rotation_xyzw(),
        scale: t.scale.into(),
    }
}

/// One skin for the whole file: every bone with a matching node, in first-seen order.
fn collect_skin(document: &FbxDocument, node_by_name: &HashMap<&str, usize>) -> SourceSkin {
    let mut skin = SourceSkin {
        name: "skeleton".to_string(),
        ..Default::default()
    };
    for mesh in &document.meshes {
        for bone in &mesh.bones {
            let Some(&node) = node_by_name.get(bone.name.as_str()) else {
                log::warn!("Bone {} of {} has no node and is ignored", bone.name, mesh.name);
                continue;
            };
            if skin.joints.contains(&node) {
                continue;
            }
            skin.joints.push(node);
            skin.inverse_bind_matrices.push(bone.offset);
        }
    }
    skin
}

/// The four strongest influences per vertex.
fn vertex_influences(
    mesh: &FbxMesh,
    bone_to_joint: &HashMap<&str, usize>,
) -> Option<(Vec<[u32; 4]>, Vec<[f32; 4]>)> {
    if mesh.bones.is_empty() {
        return None;
    }
    let count = mesh.positions.len();
    let mut influences: Vec<Vec<(u32, f32)>> = vec![Vec::new(); count];
    for bone in &mesh.bones {
        let Some(&joint) = bone_to_joint.get(bone.name.as_str()) else {
            continue;
        };
        for &(vertex, weight) in &bone.weights {
            match influences.get_mut(vertex as usize) {
                Some(list) => list.push((joint as u32, weight)),
                None => log::warn!("Bone {} weights missing vertex {}", bone.name, vertex),
            }
        }
    }
    let mut joints = Vec::with_capacity(count);
    let mut weights = Vec::with_capacity(count);
    for mut list in influences {
        list.sort_by(|a, b| b.1.total_cmp(&a.1));
        let mut j = [0u32; 4];
        let mut w = [0.0f32; 4];
        for (slot, &(joint, weight)) in list.iter().take(4).enumerate() {
            j[slot] = joint;
            w[slot] = weight;
        }
        joints.push(j);
        weights.push(w);
    }
    Some((joints, weights))
}

/**
 * Turns one FBX mesh into a primitive. The legacy flavor skips meshes that
 * contain anything but triangles, the modern flavor fan-triangulates them and
 * merges identical vertices.
 */
fn convert_mesh(
    mesh: &FbxMesh,
    flavor: FbxFlavor,
    bone_to_joint: &HashMap<&str, usize>,
) -> Option<SourcePrimitive> {
    if mesh.positions.is_empty() {
        log::warn!("FBX mesh {} has no vertices and is skipped", mesh.name);
        return None;
    }
    let mut indices = Vec::with_capacity(mesh.faces.len() * 3);
    for face in &mesh.faces {
        match (flavor, face.len()) {
            (_, 3) => indices.extend_from_slice(face),
            (FbxFlavor::Legacy, n) => {
                log::warn!(
                    "{}",
                    ImportError::UnsupportedFormat(format!(
                        "mesh {} has a {n}-sided face, only triangulated meshes are loaded",
                        mesh.name
                    ))
                );
                return None;
            }
            (FbxFlavor::Modern, n) if n > 3 => {
                for k in 1..n - 1 {
                    indices.extend_from_slice(&[face[0], face[k], face[k + 1]]);
                }
            }
            // points and lines
            (FbxFlavor::Modern, _) => {}
        }
    }
    let (joints, weights) = match vertex_influences(mesh, bone_to_joint) {
        Some((j, w)) => (Some(j), Some(w)),
        None => (None, None),
    };
    let primitive = SourcePrimitive {
        positions: mesh.positions.clone(),
        normals: mesh.normals.clone(),
        uvs: mesh.uvs.clone(),
        colors: mesh
            .colors
            .as_ref()
            .map(|colors| colors.iter().copied().map(srgb_to_linear).collect()),
        tangents: mesh.tangents.clone(),
        joints,
        weights,
        indices: Some(indices),
        material: Some(mesh.material),
    };
    Some(match flavor {
        FbxFlavor::Modern => deduplicate(primitive),
        FbxFlavor::Legacy => primitive,
    })
}

/// Bit pattern of every attribute of vertex `i`.
fn vertex_key(p: &SourcePrimitive, i: usize) -> Vec<u32> {
    let mut key: Vec<u32> = p.positions[i].iter().map(|f| f.to_bits()).collect();
    let mut push = |values: &[f32]| key.extend(values.iter().map(|f| f.to_bits()));
    if let Some(n) = &p.normals {
        push(&n[i]);
    }
    if let Some(uv) = &p.uvs {
        push(&uv[i]);
    }
    if let Some(c) = &p.colors {
        push(&c[i]);
    }
    if let Some(t) = &p.tangents {
        push(&t[i]);
    }
    if let Some(w) = &p.weights {
        push(&w[i]);
    }
    if let Some(j) = &p.joints {
        key.extend_from_slice(&j[i]);
    }
    key
}

fn stream_ok<T>(stream: &Option<Vec<T>>, count: usize) -> bool {
    stream.as_ref().is_none_or(|s| s.len() == count)
}

/// Merges vertices whose attributes are bit-identical and remaps the indices.
fn deduplicate(primitive: SourcePrimitive) -> SourcePrimitive {
    let count = primitive.positions.len();
    let consistent = stream_ok(&primitive.normals, count)
        && stream_ok(&primitive.uvs, count)
        && stream_ok(&primitive.colors, count)
        && stream_ok(&primitive.tangents, count)
        && stream_ok(&primitive.weights, count)
        && stream_ok(&primitive.joints, count);
    if !consistent {
        return primitive;
    }
    let mut seen: HashMap<Vec<u32>, u32> = HashMap::new();
    let mut remap = Vec::with_capacity(count);
    let mut kept = Vec::new();
    for i in 0..count {
        let next = kept.len() as u32;
        let target = *seen.entry(vertex_key(&primitive, i)).or_insert(next);
        if target == next {
            kept.push(i);
        }
        remap.push(target);
    }
    if kept.len() == count {
        return primitive;
    }
    fn pick<T: Copy>(stream: &Option<Vec<T>>, kept: &[usize]) -> Option<Vec<T>> {
        stream.as_ref().map(|s| kept.iter().map(|&i| s[i]).collect())
    }
    SourcePrimitive {
        positions: kept.iter().map(|&i| primitive.positions[i]).collect(),
        normals: pick(&primitive.normals, &kept),
        uvs: pick(&primitive.uvs, &kept),
        colors: pick(&primitive.colors, &kept),
        tangents: pick(&primitive.tangents, &kept),
        joints: pick(&primitive.joints, &kept),
        weights: pick(&primitive.weights, &kept),
        indices: primitive.indices.map(|indices| {
            indices
                .into_iter()
                .map(|idx| remap.get(idx as usize).copied().unwrap_or(idx))
                .collect()
        }),
        material: primitive.material,
    }
}

fn convert_materials(document: &FbxDocument, conversion: &FbxConversion<'_>, asset: &mut SourceAsset) {
    let mut image_by_source: HashMap<String, usize> = HashMap::new();
    for material in &document.materials {
        let mut source = SourceMaterial {
            name: material.name.clone(),
            base_color: material.diffuse,
            base_factor: material.base_factor,
            roughness: material.roughness,
            metallic: material.metallic.unwrap_or(DEFAULT_METALLIC),
            normal_scale: None,
            emissive: material.emissive,
            emissive_strength: material.emissive_strength,
            ..Default::default()
        };
        for slot in TextureSlot::ALL {
            let Some(texture) = &material.textures[slot as usize] else {
                continue;
            };
            let (key, image) = match texture {
                FbxTextureSource::File(path) => {
                    let path = match conversion.base_dir {
                        Some(dir) if path.is_relative() => dir.join(path),
                        _ => path.clone(),
                    };
                    (
                        path.display().to_string(),
                        SourceImage {
                            name: path.display().to_string(),
                            data: ImageData::File(path),
                        },
                    )
                }
                FbxTextureSource::Embedded { name, bytes } => (
                    format!("*{name}"),
                    SourceImage {
                        name: name.clone(),
                        data: ImageData::Encoded {
                            bytes: bytes.clone(),
                            mime_type: None,
                        },
                    },
                ),
            };
            let texture_idx = *image_by_source.entry(key).or_insert_with(|| {
                asset.images.push(image);
                asset.textures.push(SourceTexture {
                    image: asset.images.len() - 1,
                    min_filter: None,
                    mag_filter: None,
                });
                asset.textures.len() - 1
            });
            source.textures[slot as usize] = Some(TextureRef {
                texture: texture_idx,
                transform: None,
            });
        }
        asset.materials.push(source);
    }
}

/// `(lower key, upper key, blend)` around `time`. Keys must be sorted.
fn bracket<T>(keys: &[(f32, T)], time: f32) -> Option<(usize, usize, f32)> {
    let last = keys.len().checked_sub(1)?;
    if time <= keys[0].0 {
        return Some((0, 0, 0.0));
    }
    if time >= keys[last].0 {
        return Some((last, last, 0.0));
    }
    let upper = keys.partition_point(|(t, _)| *t <= time);
    let lower = upper - 1;
    let span = keys[upper].0 - keys[lower].0;
    let blend = if span > 0.0 { (time - keys[lower].0) / span } else { 0.0 };
    Some((lower, upper, blend))
}

fn sample_vec3(keys: &[(f32, [f32; 3])], time: f32) -> Option<[f32; 3]> {
    let (a, b, f) = bracket(keys, time)?;
    let from = cgmath::Vector3::from(keys[a].1);
    let to = cgmath::Vector3::from(keys[b].1);
    Some(from.lerp(to, f).into())
}

fn sample_rotation(keys: &[(f32, [f32; 4])], time: f32) -> Option<[f32; 4]> {
    let (a, b, f) = bracket(keys, time)?;
    let quat = |[x, y, z, w]: [f32; 4]| Quaternion::new(w, x, y, z);
    let mut to = quat(keys[b].1);
    let from = quat(keys[a].1);
    if from.dot(to) < 0.0 {
        to = -to;
    }
    let q = from.nlerp(to, f);
    Some([q.v.x, q.v.y, q.v.z, q.s])
}

/// Uniform sample times from `first` to `last` inclusive.
fn bake_times(first: f32, last: f32, rate: f32) -> Vec<f32> {
    let rate = if rate.is_finite() && rate > 0.0 { rate.max(1.0) } else { DEFAULT_BAKE_RATE };
    let step = 1.0 / rate;
    let mut times = Vec::new();
    let mut k = 0u32;
    loop {
        let t = first + k as f32 * step;
        if t >= last - step * 1e-3 {
            break;
        }
        times.push(t);
        k += 1;
    }
    times.push(last);
    times
}

/**
 * Resamples every track at a fixed rate into three linear samplers
 * (translation, rotation, scale). Components a track does not key keep the
 * node's rest value.
 */
fn bake_animation(
    animation: &FbxAnimation,
    asset: &SourceAsset,
    node_by_name: &HashMap<&str, usize>,
    top_level: &[usize],
    rate: f32,
) -> SourceAnimation {
    let mut out = SourceAnimation {
        name: animation.name.clone(),
        ..Default::default()
    };
    let key_times = animation.tracks.iter().flat_map(|track| {
        track
            .translations
            .iter()
            .map(|k| k.0)
            .chain(track.rotations.iter().map(|k| k.0))
            .chain(track.scales.iter().map(|k| k.0))
    });
    let (first, last) = key_times.fold((f32::MAX, f32::MIN), |(lo, hi), t| (lo.min(t), hi.max(t)));
    if first > last {
        return out;
    }
    let times = bake_times(first, last, rate);

    for track in &animation.tracks {
        let Some(&node) = node_by_name.get(track.node.as_str()) else {
            log::warn!("Animation {} keys unknown node {}", animation.name, track.node);
            continue;
        };
        let rest = asset.nodes[node].transform.to_transform();
        // keys are stored in file units, the rest pose of top-level nodes is already in meters
        let unit = if top_level.contains(&node) { CENTIMETERS_PER_METER } else { 1.0 };
        let keyed = |v: [f32; 3]| v.map(|c| c / unit);
        let translations = times
            .iter()
            .map(|&t| {
                vec3_output(sample_vec3(&track.translations, t).map_or(rest.position.into(), keyed))
            })
            .collect();
        let rotations = times
            .iter()
            .map(|&t| quat_output(sample_rotation(&track.rotations, t).unwrap_or(rest.rotation_xyzw())))
            .collect();
        let scales = times
            .iter()
            .map(|&t| vec3_output(sample_vec3(&track.scales, t).map_or(rest.scale.into(), keyed)))
            .collect();
        for (path, outputs) in [
            (Path::Translation, translations),
            (Path::Rotation, rotations),
            (Path::Scale, scales),
        ] {
            out.samplers.push(SourceSampler {
                interpolation: Interpolation::Linear,
                times: times.clone(),
                outputs,
            });
            out.channels.push(SourceChannel {
                node,
                path,
                sampler: out.samplers.len() - 1,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversion(flavor: FbxFlavor) -> FbxConversion<'static> {
        FbxConversion {
            flavor,
            bake_rate: 30.0,
            base_dir: None,
        }
    }

    fn quad_mesh() -> FbxMesh {
        FbxMesh {
            name: "Quad".to_string(),
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 0.0, 1.0], [0.0, 0.0, 1.0]],
            faces: vec![vec![0, 1, 2, 3]],
            ..Default::default()
        }
    }

    fn document(mesh: FbxMesh) -> FbxDocument {
        FbxDocument {
            nodes: vec![
                FbxNode {
                    name: "RootNode".to_string(),
                    children: vec![1],
                    ..Default::default()
                },
                FbxNode {
                    name: "Quad".to_string(),
                    transform: Matrix4::from_translation(cgmath::Vector3::new(100.0, 0.0, 0.0)).into(),
                    meshes: vec![0],
                    ..Default::default()
                },
            ],
            meshes: vec![mesh],
            materials: vec![FbxMaterial {
                name: "Mat".to_string(),
                diffuse: [1.0; 4],
                ..Default::default()
            }],
            animations: Vec::new(),
        }
    }

    #[test]
    fn legacy_skips_quads_modern_triangulates() {
        let doc = document(quad_mesh());
        let legacy = to_source(&doc, &conversion(FbxFlavor::Legacy)).expect("legacy");
        assert!(legacy.meshes.is_empty());
        let modern = to_source(&doc, &conversion(FbxFlavor::Modern)).expect("modern");
        assert_eq!(
            modern.meshes[0].primitives[0].indices,
            Some(vec![0, 1, 2, 0, 2, 3])
        );
    }

    #[test]
    fn top_level_nodes_are_converted_to_meters() {
        let asset = to_source(&document(quad_mesh()), &conversion(FbxFlavor::Modern)).expect("asset");
        let t = asset.nodes[1].transform.to_transform();
        assert!((t.position.x - 1.0).abs() < 1e-6);
        assert!((t.scale.x - 0.01).abs() < 1e-6);
        assert_eq!(asset.nodes[0].transform, LocalTransform::Matrix(Matrix4::<f32>::from_scale(1.0).into()));
    }

    #[test]
    fn material_defaults_and_colors() {
        let mut mesh = quad_mesh();
        mesh.colors = Some(vec![[0.5, 0.5, 0.5, 0.5]; 4]);
        let asset = to_source(&document(mesh), &conversion(FbxFlavor::Modern)).expect("asset");
        assert_eq!(asset.materials[0].metallic, DEFAULT_METALLIC);
        assert_eq!(asset.materials[0].roughness, None);
        let color = asset.meshes[0].primitives[0].colors.as_ref().expect("colors")[0];
        assert!((color[0] - 0.5f32.powf(2.2)).abs() < 1e-6);
        assert_eq!(color[3], 0.5);
    }

    #[test]
    fn duplicate_vertices_are_merged() {
        let primitive = SourcePrimitive {
            positions: vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0; 3], [0.0, 1.0, 0.0]],
            indices: Some(vec![0, 1, 3, 2, 1, 3]),
            ..Default::default()
        };
        let merged = deduplicate(primitive);
        assert_eq!(merged.positions.len(), 3);
        assert_eq!(merged.indices, Some(vec![0, 1, 2, 0, 1, 2]));
    }

    #[test]
    fn tracks_are_baked_into_three_samplers() {
        let mut doc = document(quad_mesh());
        doc.animations.push(FbxAnimation {
            name: "Idle".to_string(),
            tracks: vec![FbxTrack {
                node: "Quad".to_string(),
                translations: vec![(0.0, [0.0; 3]), (1.0, [3.0, 0.0, 0.0])],
                ..Default::default()
            }],
        });
        let asset = to_source(&doc, &conversion(FbxFlavor::Modern)).expect("asset");
        let animation = &asset.animations[0];
        assert_eq!(animation.samplers.len(), 3);
        let translation = &animation.samplers[0];
        assert_eq!(translation.times.len(), 31);
        assert_eq!(translation.times.last().copied(), Some(1.0));
        // keyed in centimeters on a top-level node
        assert!((translation.outputs[15].x - 0.015).abs() < 1e-6);
        // scale keeps the rest value of the converted node
        assert!((animation.samplers[2].outputs[0].x - 0.01).abs() < 1e-6);
    }

    #[test]
    fn rest_equal_track_bakes_to_the_converted_rest() {
        let mut doc = document(quad_mesh());
        doc.animations.push(FbxAnimation {
            name: "Hold".to_string(),
            tracks: vec![FbxTrack {
                node: "Quad".to_string(),
                translations: vec![(0.0, [100.0, 0.0, 0.0]), (0.5, [100.0, 0.0, 0.0])],
                scales: vec![(0.0, [1.0; 3])],
                ..Default::default()
            }],
        });
        let asset = to_source(&doc, &conversion(FbxFlavor::Legacy)).expect("asset");
        let rest = asset.nodes[1].transform.to_transform();
        let animation = &asset.animations[0];
        for output in &animation.samplers[0].outputs {
            assert!((output.x - rest.position.x).abs() < 1e-6);
        }
        for output in &animation.samplers[2].outputs {
            assert!((output.x - rest.scale.x).abs() < 1e-6);
        }
    }

    #[test]
    fn unusable_bake_rates_fall_back() {
        assert_eq!(bake_times(0.0, 1.0, f32::NAN).len(), 31);
        assert_eq!(bake_times(0.0, 1.0, -5.0).len(), 31);
        assert_eq!(bake_times(0.0, 1.0, f32::INFINITY).len(), 31);
    }

    #[test]
    fn zero_tick_rate_means_seconds() {
        assert_eq!(seconds_per_tick(0.0), 1.0);
        assert_eq!(seconds_per_tick(-1.0), 1.0);
        assert_eq!(seconds_per_tick(f64::NAN), 1.0);
        assert_eq!(seconds_per_tick(50.0), 0.02);
    }

    #[test]
    fn strongest_four_influences_are_kept() {
        let mut mesh = quad_mesh();
        mesh.faces = vec![vec![0, 1, 2], vec![0, 2, 3]];
        mesh.bones = (0..5)
            .map(|b| FbxBone {
                name: format!("b{b}"),
                offset: Matrix4::<f32>::from_scale(1.0).into(),
                weights: vec![(0, (b + 1) as f32)],
            })
            .collect();
        let mut doc = document(mesh);
        for b in 0..5 {
            let next = doc.nodes.len();
            doc.nodes[0].children.push(next);
            doc.nodes.push(FbxNode {
                name: format!("b{b}"),
                ..Default::default()
            });
        }
        let asset = to_source(&doc, &conversion(FbxFlavor::Legacy)).expect("asset");
        assert_eq!(asset.skins[0].joints.len(), 5);
        let primitive = &asset.meshes[0].primitives[0];
        assert_eq!(primitive.joints.as_ref().expect("joints")[0], [4, 3, 2, 1]);
        assert_eq!(primitive.weights.as_ref().expect("weights")[0], [5.0, 4.0, 3.0, 2.0]);
    }
}
