//! Assimp (russimp) reader for the legacy FBX flavor.

use std::{path::Path, rc::Rc};

use anyhow::Context as _;
use russimp::{
    Matrix4x4,
    material::{DataContent, Material, PropertyTypeInfo, TextureType},
    node::Node,
    scene::{PostProcess, Scene},
};

use crate::{
    data_structures::material::TextureSlot,
    resources::fbx::{
        FbxAnimation, FbxBone, FbxDocument, FbxMaterial, FbxMesh, FbxNode, FbxTextureSource, FbxTrack,
        seconds_per_tick,
    },
};

/// Assimp matrices are row-major.
fn column_major(m: &Matrix4x4) -> [[f32; 4]; 4] {
    [
        [m.a1, m.b1, m.c1, m.d1],
        [m.a2, m.b2, m.c2, m.d2],
        [m.a3, m.b3, m.c3, m.d3],
        [m.a4, m.b4, m.c4, m.d4],
    ]
}

fn flatten_nodes(root: &Rc<Node>, nodes: &mut Vec<FbxNode>) -> usize {
    let idx = nodes.len();
    nodes.push(FbxNode {
        name: root.name.clone(),
        children: Vec::new(),
        transform: column_major(&root.transformation),
        meshes: root.meshes.iter().map(|&m| m as usize).collect(),
    });
    let children: Vec<Rc<Node>> = root.children.borrow().clone();
    for child in &children {
        let child_idx = flatten_nodes(child, nodes);
        nodes[idx].children.push(child_idx);
    }
    idx
}

fn convert_mesh(mesh: &russimp::mesh::Mesh) -> FbxMesh {
    let positions = mesh.vertices.iter().map(|v| [v.x, v.y, v.z]).collect();
    let normals = (!mesh.normals.is_empty()).then(|| mesh.normals.iter().map(|n| [n.x, n.y, n.z]).collect());
    let tangents =
        (!mesh.tangents.is_empty()).then(|| mesh.tangents.iter().map(|t| [t.x, t.y, t.z]).collect());
    let uvs = mesh
        .texture_coords
        .first()
        .and_then(Option::as_ref)
        .map(|uvs| uvs.iter().map(|uv| [uv.x, uv.y]).collect());
    let colors = mesh
        .colors
        .first()
        .and_then(Option::as_ref)
        .map(|colors| colors.iter().map(|c| [c.r, c.g, c.b, c.a]).collect());
    FbxMesh {
        name: mesh.name.clone(),
        positions,
        normals,
        tangents,
        uvs,
        colors,
        faces: mesh.faces.iter().map(|face| face.0.clone()).collect(),
        bones: mesh
            .bones
            .iter()
            .map(|bone| FbxBone {
                name: bone.name.clone(),
                offset: column_major(&bone.offset_matrix),
                weights: bone.weights.iter().map(|w| (w.vertex_id, w.weight)).collect(),
            })
            .collect(),
        material: mesh.material_index as usize,
    }
}

fn float_property(material: &Material, key: &str) -> Option<Vec<f32>> {
    material.properties.iter().find_map(|property| {
        if property.key != key {
            return None;
        }
        match &property.data {
            PropertyTypeInfo::FloatArray(values) => Some(values.clone()),
            _ => None,
        }
    })
}

fn string_property(material: &Material, key: &str) -> Option<String> {
    material.properties.iter().find_map(|property| match &property.data {
        PropertyTypeInfo::String(value) if property.key == key => Some(value.clone()),
        _ => None,
    })
}

fn slot_for(texture_type: &TextureType) -> Option<TextureSlot> {
    match texture_type {
        TextureType::Diffuse | TextureType::BaseColor => Some(TextureSlot::Diffuse),
        TextureType::Normals | TextureType::NormalCamera => Some(TextureSlot::Normal),
        TextureType::DiffuseRoughness => Some(TextureSlot::Roughness),
        TextureType::Metalness => Some(TextureSlot::Metallic),
        TextureType::Emissive | TextureType::EmissionColor => Some(TextureSlot::Emissive),
        _ => None,
    }
}

fn convert_material(material: &Material) -> FbxMaterial {
    let diffuse = float_property(material, "$clr.diffuse")
        .or_else(|| float_property(material, "$clr.base"))
        .unwrap_or_else(|| vec![1.0; 4]);
    let emissive = float_property(material, "$clr.emissive").unwrap_or_default();
    let first = |key: &str| float_property(material, key).and_then(|v| v.first().copied());
    let mut out = FbxMaterial {
        name: string_property(material, "?mat.name").unwrap_or_default(),
        diffuse: [
            diffuse.first().copied().unwrap_or(1.0),
            diffuse.get(1).copied().unwrap_or(1.0),
            diffuse.get(2).copied().unwrap_or(1.0),
            diffuse.get(3).copied().unwrap_or(1.0),
        ],
        base_factor: first("$mat.diffuseFactor"),
        metallic: first("$mat.metallicFactor"),
        roughness: first("$mat.roughnessFactor"),
        emissive: [
            emissive.first().copied().unwrap_or(0.0),
            emissive.get(1).copied().unwrap_or(0.0),
            emissive.get(2).copied().unwrap_or(0.0),
        ],
        emissive_strength: first("$mat.emissiveIntensity"),
        textures: Default::default(),
    };
    for (texture_type, texture) in &material.textures {
        let Some(slot) = slot_for(texture_type) else {
            continue;
        };
        if out.textures[slot as usize].is_some() {
            continue;
        }
        let texture = texture.borrow();
        let source = match &texture.data {
            DataContent::Bytes(bytes) if !bytes.is_empty() => FbxTextureSource::Embedded {
                name: texture.filename.clone(),
                bytes: bytes.clone(),
            },
            _ => FbxTextureSource::File(texture.filename.replace('\\', "/").into()),
        };
        out.textures[slot as usize] = Some(source);
    }
    out
}

fn convert_animation(animation: &russimp::animation::Animation) -> FbxAnimation {
    let per_tick = seconds_per_tick(animation.ticks_per_second);
    let seconds = |time: f64| (time * per_tick) as f32;
    FbxAnimation {
        name: animation.name.clone(),
        tracks: animation
            .channels
            .iter()
            .map(|channel| FbxTrack {
                node: channel.name.clone(),
                translations: channel
                    .position_keys
                    .iter()
                    .map(|k| (seconds(k.time), [k.value.x, k.value.y, k.value.z]))
                    .collect(),
                rotations: channel
                    .rotation_keys
                    .iter()
                    .map(|k| (seconds(k.time), [k.value.x, k.value.y, k.value.z, k.value.w]))
                    .collect(),
                scales: channel
                    .scaling_keys
                    .iter()
                    .map(|k| (seconds(k.time), [k.value.x, k.value.y, k.value.z]))
                    .collect(),
            })
            .collect(),
    }
}

/// Reads `path` through Assimp with meshes as stored. Only bone weights are
/// limited to four per vertex.
pub fn read(path: &Path) -> anyhow::Result<FbxDocument> {
    let path_str = path
        .to_str()
        .with_context(|| format!("Non UTF-8 path {}", path.display()))?;
    let scene = Scene::from_file(path_str, vec![PostProcess::LimitBoneWeights])
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .with_context(|| format!("Assimp failed to read {}", path.display()))?;
    let mut nodes = Vec::new();
    if let Some(root) = &scene.root {
        flatten_nodes(root, &mut nodes);
    }
    log::debug!(
        "Assimp read {}: {} nodes, {} meshes, {} materials, {} animations",
        path.display(),
        nodes.len(),
        scene.meshes.len(),
        scene.materials.len(),
        scene.animations.len()
    );
    Ok(FbxDocument {
        nodes,
        meshes: scene.meshes.iter().map(convert_mesh).collect(),
        materials: scene.materials.iter().map(convert_material).collect(),
        animations: scene.animations.iter().map(convert_animation).collect(),
    })
}
