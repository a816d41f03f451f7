//! glTF 2.0 front-end for `.gltf` (with side-car buffers and images) and `.glb`.
//!
//! Buffers are loaded eagerly, images are only located here and decoded later
//! by the texture resolver. Positions, normals and tangents go through an
//! accessor reader that understands KHR_mesh_quantization; the remaining
//! streams use the `gltf` crate's readers.
//!
//! In [`GltfMode::Lenient`] the raw JSON is also searched for the legacy
//! `values.baseColorTexture` / `values.baseColorFactor` material block.

use std::{collections::HashMap, path::Path};

use anyhow::{Context as _, bail};
use gltf::{accessor::DataType, mesh::Semantic};
use serde::Deserialize;

use crate::{
    context::GltfMode,
    data_structures::{
        animation::{Interpolation, Path as AnimPath, quat_output, vec3_output},
        material::{TextureSlot, TextureTransform},
        tags::{CameraTag, LightKind, LightTag, Projection},
        texture::FilterMode,
    },
    error::ImportError,
    resources::dom::{
        ImageData, LocalTransform, SourceAnimation, SourceAsset, SourceChannel, SourceImage,
        SourceMaterial, SourceMesh, SourceNode, SourcePrimitive, SourceSampler, SourceScene,
        SourceSkin, SourceTexture, TextureRef,
    },
};

/// Material fields whose absence matters and that the `gltf` crate defaults away.
#[derive(Debug, Default, Deserialize)]
struct RawRoot {
    #[serde(default)]
    materials: Vec<RawMaterial>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMaterial {
    #[serde(default)]
    pbr_metallic_roughness: Option<RawPbr>,
    #[serde(default)]
    values: Option<RawLegacyValues>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPbr {
    metallic_factor: Option<f32>,
    roughness_factor: Option<f32>,
    base_color_factor: Option<[f32; 4]>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLegacyValues {
    base_color_texture: Option<RawTextureRef>,
    base_color_factor: Option<[f32; 4]>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTextureRef {
    Info { index: usize },
    Index(usize),
}

impl RawTextureRef {
    fn index(&self) -> usize {
        match *self {
            RawTextureRef::Info { index } | RawTextureRef::Index(index) => index,
        }
    }
}

fn raw_root(bytes: &[u8]) -> anyhow::Result<RawRoot> {
    let json: std::borrow::Cow<'_, [u8]> = if bytes.starts_with(b"glTF") {
        gltf::Glb::from_slice(bytes)
            .context("Failed to read GLB container")?
            .json
    } else {
        std::borrow::Cow::Borrowed(bytes)
    };
    serde_json::from_slice(&json).context("Failed to read glTF JSON")
}

fn read_component(buffer: &[u8], offset: usize, data_type: DataType, normalized: bool, stream: &'static str) -> Result<f32, ImportError> {
    let mut four = [0u8; 4];
    let mut two = [0u8; 2];
    let value = match data_type {
        DataType::F32 => {
            four.copy_from_slice(&buffer[offset..offset + 4]);
            f32::from_le_bytes(four)
        }
        DataType::U8 => {
            let v = buffer[offset] as f32;
            if normalized { v / 255.0 } else { v }
        }
        DataType::I8 => {
            let v = buffer[offset] as i8 as f32;
            if normalized { (v / 127.0).max(-1.0) } else { v }
        }
        DataType::U16 => {
            two.copy_from_slice(&buffer[offset..offset + 2]);
            let v = u16::from_le_bytes(two) as f32;
            if normalized { v / 65535.0 } else { v }
        }
        DataType::I16 => {
            two.copy_from_slice(&buffer[offset..offset + 2]);
            let v = i16::from_le_bytes(two) as f32;
            if normalized { (v / 32767.0).max(-1.0) } else { v }
        }
        DataType::U32 => {
            return Err(ImportError::UnrecognizedComponentType {
                stream,
                component: format!("{:?}", data_type),
            });
        }
    };
    Ok(value)
}

/**
 * Reads a float vector stream, dequantizing integer components.
 *
 * Accessors without a buffer view read as zeros. Sparse substitution is not
 * applied.
 */
fn read_floats<const N: usize>(
    accessor: &gltf::Accessor<'_>,
    buffers: &[gltf::buffer::Data],
    stream: &'static str,
) -> anyhow::Result<Vec<[f32; N]>> {
    if accessor.dimensions().multiplicity() != N {
        bail!(ImportError::MissingRequiredField(format!(
            "{stream} accessor {} has {:?} elements, expected {N} components",
            accessor.index(),
            accessor.dimensions()
        )));
    }
    let count = accessor.count();
    if accessor.sparse().is_some() {
        log::warn!("Sparse substitution on {} accessor {} is ignored", stream, accessor.index());
    }
    let Some(view) = accessor.view() else {
        return Ok(vec![[0.0; N]; count]);
    };
    let buffer: &[u8] = buffers
        .get(view.buffer().index())
        .map(|data| data.0.as_slice())
        .with_context(|| format!("{stream} accessor refers to missing buffer {}", view.buffer().index()))?;
    let data_type = accessor.data_type();
    let component = data_type.size();
    let element = component * N;
    let stride = view.stride().unwrap_or(element);
    let start = view.offset() + accessor.offset();
    if count > 0 && start + (count - 1) * stride + element > buffer.len() {
        bail!(ImportError::MissingRequiredField(format!(
            "{stream} accessor {} reads past the end of its buffer",
            accessor.index()
        )));
    }
    let normalized = accessor.normalized();
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let base = start + i * stride;
        let mut value = [0.0; N];
        for (c, slot) in value.iter_mut().enumerate() {
            *slot = read_component(buffer, base + c * component, data_type, normalized, stream)?;
        }
        out.push(value);
    }
    Ok(out)
}

fn filter_mode(gl: Option<u32>) -> Option<FilterMode> {
    gl.and_then(FilterMode::from_gl)
}

fn texture_transform(info: &gltf::texture::Info<'_>) -> Option<TextureTransform> {
    info.texture_transform().map(|t| TextureTransform {
        offset: t.offset(),
        rotation: t.rotation(),
        scale: t.scale(),
    })
}

/// gltf only parses `KHR_texture_transform` on plain texture infos, so the
/// normal texture's copy is read from its raw extension value.
fn normal_texture_transform(normal: &gltf::material::NormalTexture<'_>) -> Option<TextureTransform> {
    let value = normal.extension_value("KHR_texture_transform")?;
    match serde_json::from_value::<gltf::json::extensions::texture::TextureTransform>(value.clone()) {
        Ok(t) => Some(TextureTransform {
            offset: t.offset.0,
            rotation: t.rotation.0,
            scale: t.scale.0,
        }),
        Err(e) => {
            log::warn!("Ignoring malformed KHR_texture_transform on a normal texture: {e}");
            None
        }
    }
}

fn texture_ref(info: &gltf::texture::Info<'_>) -> TextureRef {
    TextureRef {
        texture: info.texture().index(),
        transform: texture_transform(info),
    }
}

fn decoded_image(data: gltf::image::Data) -> Option<image::DynamicImage> {
    use gltf::image::Format;
    let (w, h) = (data.width, data.height);
    match data.format {
        Format::R8 => image::GrayImage::from_raw(w, h, data.pixels).map(image::DynamicImage::ImageLuma8),
        Format::R8G8 => {
            image::GrayAlphaImage::from_raw(w, h, data.pixels).map(image::DynamicImage::ImageLumaA8)
        }
        Format::R8G8B8 => image::RgbImage::from_raw(w, h, data.pixels).map(image::DynamicImage::ImageRgb8),
        Format::R8G8B8A8 => {
            image::RgbaImage::from_raw(w, h, data.pixels).map(image::DynamicImage::ImageRgba8)
        }
        _ => None,
    }
}

fn read_images(
    document: &gltf::Document,
    base: Option<&Path>,
    buffers: &[gltf::buffer::Data],
) -> Vec<SourceImage> {
    document
        .images()
        .map(|image| {
            let fallback_name = format!("image_{}", image.index());
            let data = match image.source() {
                gltf::image::Source::View { view, mime_type } => {
                    let bytes = buffers
                        .get(view.buffer().index())
                        .and_then(|data| data.0.get(view.offset()..view.offset() + view.length()));
                    match bytes {
                        Some(bytes) => ImageData::Encoded {
                            bytes: bytes.to_vec(),
                            mime_type: Some(mime_type.to_string()),
                        },
                        None => ImageData::Missing(format!("buffer view {} out of range", view.index())),
                    }
                }
                gltf::image::Source::Uri { uri, .. } if uri.starts_with("data:") => {
                    match gltf::image::Data::from_source(image.source(), base, buffers) {
                        Ok(data) => decoded_image(data)
                            .map(ImageData::Decoded)
                            .unwrap_or_else(|| ImageData::Missing("unsupported pixel format".to_string())),
                        Err(e) => ImageData::Missing(e.to_string()),
                    }
                }
                gltf::image::Source::Uri { uri, .. } => match base {
                    Some(base) => ImageData::File(base.join(uri)),
                    None => ImageData::File(uri.into()),
                },
            };
            let name = image
                .name()
                .map(str::to_string)
                .or_else(|| match &data {
                    ImageData::File(path) => Some(path.display().to_string()),
                    _ => None,
                })
                .unwrap_or(fallback_name);
            SourceImage { name, data }
        })
        .collect()
}

fn read_material(material: &gltf::Material<'_>, raw: Option<&RawMaterial>, mode: GltfMode) -> SourceMaterial {
    let pbr = material.pbr_metallic_roughness();
    let raw_pbr = raw.and_then(|r| r.pbr_metallic_roughness.as_ref());
    let legacy = match mode {
        GltfMode::Lenient => raw.and_then(|r| r.values.as_ref()),
        GltfMode::Strict => None,
    };
    let name = material
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("material_{}", material.index().unwrap_or_default()));

    let mut base_color = pbr.base_color_factor();
    if raw_pbr.and_then(|p| p.base_color_factor).is_none() {
        if let Some(factor) = legacy.and_then(|l| l.base_color_factor) {
            base_color = factor;
        }
    }
    let mut out = SourceMaterial {
        name,
        base_color,
        roughness: raw_pbr
            .and_then(|p| p.roughness_factor)
            .map(|_| pbr.roughness_factor()),
        metallic: raw_pbr
            .and_then(|p| p.metallic_factor)
            .map_or(0.0, |_| pbr.metallic_factor()),
        normal_scale: material.normal_texture().map(|n| n.scale()),
        emissive: material.emissive_factor(),
        emissive_strength: material.emissive_strength(),
        ..Default::default()
    };
    out.textures[TextureSlot::Diffuse as usize] = pbr
        .base_color_texture()
        .map(|info| texture_ref(&info))
        .or_else(|| {
            legacy
                .and_then(|l| l.base_color_texture.as_ref())
                .map(|legacy_ref| TextureRef {
                    texture: legacy_ref.index(),
                    transform: None,
                })
        });
    out.textures[TextureSlot::RoughnessMetallic as usize] = pbr
        .metallic_roughness_texture()
        .map(|info| texture_ref(&info));
    out.textures[TextureSlot::Normal as usize] = material.normal_texture().map(|n| TextureRef {
        texture: n.texture().index(),
        transform: normal_texture_transform(&n),
    });
    out.textures[TextureSlot::Emissive as usize] =
        material.emissive_texture().map(|info| texture_ref(&info));
    out
}

fn read_primitive(
    primitive: &gltf::Primitive<'_>,
    buffers: &[gltf::buffer::Data],
) -> anyhow::Result<SourcePrimitive> {
    let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|d| d.0.as_slice()));
    let positions = primitive
        .get(&Semantic::Positions)
        .ok_or_else(|| ImportError::MissingRequiredField("POSITION".to_string()))?;
    let positions = read_floats::<3>(&positions, buffers, "POSITION")?;
    let normals = primitive
        .get(&Semantic::Normals)
        .map(|accessor| read_floats::<3>(&accessor, buffers, "NORMAL"))
        .transpose()?;
    let tangents = primitive
        .get(&Semantic::Tangents)
        .map(|accessor| read_floats::<4>(&accessor, buffers, "TANGENT"))
        .transpose()?
        .map(|tangents| tangents.into_iter().map(|t| [t[0], t[1], t[2]]).collect());
    Ok(SourcePrimitive {
        positions,
        normals,
        tangents,
        uvs: reader.read_tex_coords(0).map(|uv| uv.into_f32().collect()),
        colors: reader.read_colors(0).map(|c| c.into_rgba_f32().collect()),
        joints: reader
            .read_joints(0)
            .map(|j| j.into_u16().map(|j| j.map(u32::from)).collect()),
        weights: reader.read_weights(0).map(|w| w.into_f32().collect()),
        indices: reader.read_indices().map(|i| i.into_u32().collect()),
        material: primitive.material().index(),
    })
}

fn read_mesh(mesh: &gltf::Mesh<'_>, buffers: &[gltf::buffer::Data]) -> anyhow::Result<SourceMesh> {
    let name = mesh
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("mesh_{}", mesh.index()));
    let mut primitives = Vec::new();
    for primitive in mesh.primitives() {
        if primitive.mode() != gltf::mesh::Mode::Triangles {
            log::warn!(
                "{}",
                ImportError::UnsupportedFormat(format!(
                    "primitive {} of {} uses {:?}, only triangles are imported",
                    primitive.index(),
                    name,
                    primitive.mode()
                ))
            );
            continue;
        }
        primitives.push(
            read_primitive(&primitive, buffers)
                .with_context(|| format!("Failed to read primitive {} of {}", primitive.index(), name))?,
        );
    }
    Ok(SourceMesh { name, primitives })
}

fn read_animation(animation: &gltf::Animation<'_>, buffers: &[gltf::buffer::Data]) -> anyhow::Result<SourceAnimation> {
    let mut samplers = Vec::new();
    let mut sampler_map: HashMap<usize, usize> = HashMap::new();
    let mut channels = Vec::new();
    for channel in animation.channels() {
        let path = match channel.target().property() {
            gltf::animation::Property::Translation => AnimPath::Translation,
            gltf::animation::Property::Rotation => AnimPath::Rotation,
            gltf::animation::Property::Scale => AnimPath::Scale,
            gltf::animation::Property::MorphTargetWeights => {
                log::warn!("Morph target channels are not supported and skipped");
                continue;
            }
        };
        let source_idx = channel.sampler().index();
        let sampler = match sampler_map.get(&source_idx) {
            Some(&idx) => idx,
            None => {
                let reader = channel.reader(|buffer| buffers.get(buffer.index()).map(|d| d.0.as_slice()));
                let times: Vec<f32> = reader
                    .read_inputs()
                    .map(|inputs| inputs.collect())
                    .unwrap_or_default();
                let outputs = match reader.read_outputs() {
                    Some(gltf::animation::util::ReadOutputs::Translations(it)) => it.map(vec3_output).collect(),
                    Some(gltf::animation::util::ReadOutputs::Scales(it)) => it.map(vec3_output).collect(),
                    Some(gltf::animation::util::ReadOutputs::Rotations(it)) => {
                        it.into_f32().map(quat_output).collect()
                    }
                    _ => Vec::new(),
                };
                let interpolation = match channel.sampler().interpolation() {
                    gltf::animation::Interpolation::Linear => Interpolation::Linear,
                    gltf::animation::Interpolation::Step => Interpolation::Step,
                    gltf::animation::Interpolation::CubicSpline => Interpolation::CubicSpline,
                };
                samplers.push(SourceSampler {
                    interpolation,
                    times,
                    outputs,
                });
                sampler_map.insert(source_idx, samplers.len() - 1);
                samplers.len() - 1
            }
        };
        channels.push(SourceChannel {
            node: channel.target().node().index(),
            path,
            sampler,
        });
    }
    Ok(SourceAnimation {
        name: animation.name().unwrap_or_default().to_string(),
        samplers,
        channels,
    })
}

fn camera_tag(camera: &gltf::Camera<'_>) -> CameraTag {
    let projection = match camera.projection() {
        gltf::camera::Projection::Perspective(p) => Projection::Perspective {
            yfov: p.yfov(),
            aspect_ratio: p.aspect_ratio(),
            znear: p.znear(),
            zfar: p.zfar(),
        },
        gltf::camera::Projection::Orthographic(o) => Projection::Orthographic {
            xmag: o.xmag(),
            ymag: o.ymag(),
            znear: o.znear(),
            zfar: o.zfar(),
        },
    };
    CameraTag {
        name: camera.name().unwrap_or("camera").to_string(),
        projection,
    }
}

fn light_tag(light: &gltf::khr_lights_punctual::Light<'_>) -> LightTag {
    let kind = match light.kind() {
        gltf::khr_lights_punctual::Kind::Directional => LightKind::Directional,
        gltf::khr_lights_punctual::Kind::Point => LightKind::Point,
        gltf::khr_lights_punctual::Kind::Spot {
            inner_cone_angle,
            outer_cone_angle,
        } => LightKind::Spot {
            inner_cone_angle,
            outer_cone_angle,
        },
    };
    LightTag {
        name: light.name().unwrap_or("light").to_string(),
        kind,
        color: light.color(),
        intensity: light.intensity(),
        range: light.range(),
    }
}

fn read_node(node: &gltf::Node<'_>) -> SourceNode {
    let transform = match node.transform() {
        gltf::scene::Transform::Matrix { matrix } => LocalTransform::Matrix(matrix),
        gltf::scene::Transform::Decomposed {
            translation,
            rotation,
            scale,
        } => LocalTransform::Trs {
            translation,
            rotation,
            scale,
        },
    };
    SourceNode {
        name: node.name().unwrap_or_default().to_string(),
        children: node.children().map(|child| child.index()).collect(),
        transform,
        mesh: node.mesh().map(|mesh| mesh.index()),
        skin: node.skin().map(|skin| skin.index()),
        camera: node.camera().map(|camera| camera_tag(&camera)),
        light: node.light().map(|light| light_tag(&light)),
    }
}

/// Parses a `.gltf` or `.glb` file into the neutral source document.
pub fn parse(path: &Path, mode: GltfMode) -> anyhow::Result<SourceAsset> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let gltf = gltf::Gltf::from_slice(&bytes)
        .with_context(|| format!("Failed to parse glTF {}", path.display()))?;
    let raw = raw_root(&bytes)?;
    let base = path.parent();
    let document = &gltf.document;
    let buffers = gltf::import_buffers(document, base, gltf.blob.clone())
        .with_context(|| format!("Failed to load buffers of {}", path.display()))?;

    let images = read_images(document, base, &buffers);
    let textures = document
        .textures()
        .map(|texture| {
            let sampler = texture.sampler();
            SourceTexture {
                image: texture.source().index(),
                min_filter: filter_mode(sampler.min_filter().map(|f| f.as_gl_enum())),
                mag_filter: filter_mode(sampler.mag_filter().map(|f| f.as_gl_enum())),
            }
        })
        .collect();
    let materials = document
        .materials()
        .enumerate()
        .map(|(idx, material)| read_material(&material, raw.materials.get(idx), mode))
        .collect();
    let meshes = document
        .meshes()
        .map(|mesh| read_mesh(&mesh, &buffers))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let skins = document
        .skins()
        .map(|skin| {
            let reader = skin.reader(|buffer| buffers.get(buffer.index()).map(|d| d.0.as_slice()));
            SourceSkin {
                name: skin.name().unwrap_or("skin").to_string(),
                joints: skin.joints().map(|joint| joint.index()).collect(),
                inverse_bind_matrices: reader
                    .read_inverse_bind_matrices()
                    .map(|ibm| ibm.collect())
                    .unwrap_or_default(),
            }
        })
        .collect();
    let animations = document
        .animations()
        .map(|animation| read_animation(&animation, &buffers))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let nodes = document.nodes().map(|node| read_node(&node)).collect();
    let scenes: Vec<SourceScene> = document
        .scenes()
        .map(|scene| SourceScene {
            name: scene
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("scene_{}", scene.index())),
            roots: scene.nodes().map(|node| node.index()).collect(),
        })
        .collect();

    let mut asset = SourceAsset {
        scenes,
        default_scene: document.default_scene().map_or(0, |scene| scene.index()),
        nodes,
        meshes,
        materials,
        textures,
        images,
        skins,
        animations,
    };
    if asset.scenes.is_empty() {
        asset.scenes.push(SourceScene {
            name: "scene_0".to_string(),
            roots: asset.root_nodes(),
        });
    }
    Ok(asset)
}
