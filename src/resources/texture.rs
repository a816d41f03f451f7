//! Material and texture resolution.
//!
//! Color spaces are decided per image before anything is decoded: an image
//! that any material uses as base color or emissive is sRGB, everything else
//! is UNORM. Images are then decoded in parallel, one task per image, and
//! uploaded once per distinct (image, filters) combination. Materials refer
//! to the resulting texture arena by index.

use std::collections::HashMap;

use anyhow::{Context as _, bail};
use rayon::prelude::*;

use crate::{
    context::Context,
    data_structures::{
        material::{Material, MaterialFeatures, SlotBinding, TextureSlot},
        texture::{ColorSpace, FilterMode, Texture, TextureData},
    },
    gpu::{GpuResource, SlotTextures},
    resources::{
        dom::{ImageData, SourceAsset, SourceImage, SourceMaterial},
        transaction::LoadTransaction,
    },
};

/// The resolved materials of one asset and the texture arena they index.
#[derive(Clone, Debug, Default)]
pub struct ResolvedMaterials {
    pub materials: Vec<Material>,
    pub textures: Vec<Texture>,
    /// Used by primitives whose material index is out of range.
    pub default_material: usize,
}

impl ResolvedMaterials {
    /// The material for `index`, or the default material when it is missing.
    pub fn material_index(&self, index: Option<usize>) -> usize {
        match index {
            Some(idx) if idx < self.default_material => idx,
            Some(idx) => {
                log::error!(
                    "{}; using the default material",
                    crate::error::ImportError::MaterialIndexOutOfRange {
                        index: idx,
                        count: self.default_material,
                    }
                );
                self.default_material
            }
            None => self.default_material,
        }
    }
}

/// One color space per image. sRGB wins when an image is used in both roles.
pub fn classify_images(asset: &SourceAsset) -> Vec<Option<ColorSpace>> {
    let mut spaces = vec![None; asset.images.len()];
    for material in &asset.materials {
        for slot in TextureSlot::ALL {
            let Some(tex_ref) = material.textures[slot as usize] else {
                continue;
            };
            let Some(texture) = asset.textures.get(tex_ref.texture) else {
                continue;
            };
            let Some(space) = spaces.get_mut(texture.image) else {
                continue;
            };
            *space = match (*space, slot.color_space()) {
                (Some(ColorSpace::Srgb), _) | (_, ColorSpace::Srgb) => Some(ColorSpace::Srgb),
                _ => Some(ColorSpace::Unorm),
            };
        }
    }
    spaces
}

fn image_format(mime_type: &str) -> Option<image::ImageFormat> {
    image::ImageFormat::from_mime_type(mime_type)
}

pub fn decode_image(image: &SourceImage) -> anyhow::Result<image::DynamicImage> {
    match &image.data {
        ImageData::Encoded { bytes, mime_type } => {
            let format = mime_type.as_deref().and_then(image_format);
            let decoded = match format {
                Some(format) => image::load_from_memory_with_format(bytes, format),
                None => image::load_from_memory(bytes),
            };
            decoded.with_context(|| format!("Failed to decode embedded image {}", image.name))
        }
        ImageData::File(path) => image::open(path)
            .with_context(|| format!("Failed to decode image {}", path.display())),
        ImageData::Decoded(img) => Ok(img.clone()),
        ImageData::Missing(what) => bail!("image {} could not be located: {}", image.name, what),
    }
}

/**
 * Decodes and uploads every referenced image, then builds one [`Material`]
 * (plus a default one) with a GPU descriptor each.
 *
 * Textures that fail to decode are dropped from the slots that use them:
 * optional slots lose their feature bit, the base color falls back to the
 * constant diffuse color.
 */
pub fn resolve_materials(
    ctx: &Context,
    asset: &SourceAsset,
    skinned: bool,
    txn: &LoadTransaction,
) -> anyhow::Result<ResolvedMaterials> {
    let spaces = classify_images(asset);

    // one decode task per referenced image
    let decoded: Vec<Option<image::DynamicImage>> = ctx.install(|| {
        asset
            .images
            .par_iter()
            .zip(spaces.par_iter())
            .map(|(image, space)| {
                space.as_ref()?;
                match decode_image(image) {
                    Ok(img) => Some(img),
                    Err(e) => {
                        log::warn!("{:#}", e);
                        None
                    }
                }
            })
            .collect()
    });

    // distinct (image, min, mag) combinations referenced by materials
    let mut keys: Vec<(usize, FilterMode, FilterMode)> = Vec::new();
    let mut texture_to_key: HashMap<usize, usize> = HashMap::new();
    for material in &asset.materials {
        for tex_ref in material.textures.iter().flatten() {
            let Some(source) = asset.textures.get(tex_ref.texture) else {
                log::warn!("Material {} references missing texture {}", material.name, tex_ref.texture);
                continue;
            };
            let key = (
                source.image,
                source.min_filter.unwrap_or(ctx.config.default_filter),
                source.mag_filter.unwrap_or(ctx.config.default_filter),
            );
            let key_idx = match keys.iter().position(|k| *k == key) {
                Some(idx) => idx,
                None => {
                    keys.push(key);
                    keys.len() - 1
                }
            };
            texture_to_key.insert(tex_ref.texture, key_idx);
        }
    }

    let backend = ctx.backend();
    let uploads: Vec<Option<Texture>> = ctx.install(|| {
        keys.par_iter()
            .map(|&(image_idx, min_filter, mag_filter)| {
                let img = decoded.get(image_idx)?.as_ref()?;
                let color_space = spaces.get(image_idx).copied().flatten()?;
                let name = asset
                    .images
                    .get(image_idx)
                    .map_or("texture", |image| image.name.as_str());
                let data = TextureData::from_image(img, name, color_space, min_filter, mag_filter);
                match backend.create_texture(&data) {
                    Ok(handle) => {
                        txn.track(GpuResource::Texture(handle));
                        Some(Texture::from_data(handle, &data))
                    }
                    Err(e) => {
                        log::warn!("Texture upload of {} failed: {:#}", name, e);
                        None
                    }
                }
            })
            .collect()
    });

    // compact the arena, keeping only uploads that succeeded
    let mut textures = Vec::new();
    let mut key_to_arena: Vec<Option<usize>> = Vec::with_capacity(uploads.len());
    for upload in uploads {
        key_to_arena.push(upload.map(|texture| {
            textures.push(texture);
            textures.len() - 1
        }));
    }

    let mut materials: Vec<Material> = asset
        .materials
        .iter()
        .map(|source| {
            build_material(source, skinned, |texture| {
                texture_to_key
                    .get(&texture)
                    .and_then(|&key| key_to_arena[key])
            })
        })
        .collect();
    let default_material = materials.len();
    let mut fallback = Material::default();
    if skinned {
        fallback.features |= MaterialFeatures::HAS_SKELETAL_ANIMATION;
    }
    materials.push(fallback);

    for material in &mut materials {
        let mut slot_textures: SlotTextures = [None; 6];
        for slot in TextureSlot::ALL {
            if let Some(binding) = material.slot(slot) {
                slot_textures[slot as usize] = textures.get(binding.texture).map(|t| t.handle);
            }
        }
        let handle = backend
            .create_material_descriptor(material.kind(), &material.uniform(), &slot_textures)
            .with_context(|| format!("Failed to create descriptor for material {}", material.name))?;
        txn.track(GpuResource::Descriptor(handle));
        material.descriptor = Some(handle);
    }

    Ok(ResolvedMaterials {
        materials,
        textures,
        default_material,
    })
}

/// Builds a material from its source description. `arena` maps a source
/// texture index to the uploaded texture, if it survived decoding.
pub fn build_material(
    source: &SourceMaterial,
    skinned: bool,
    arena: impl Fn(usize) -> Option<usize>,
) -> Material {
    let factor = source.base_factor.unwrap_or(1.0);
    let mut material = Material {
        name: source.name.clone(),
        diffuse_color: source.base_color.map(|c| c * factor),
        emissive_color: source.emissive,
        roughness: source.roughness.unwrap_or(0.1).clamp(0.0, 1.0),
        metallic: source.metallic.clamp(0.0, 1.0),
        normal_map_intensity: source.normal_scale.unwrap_or(1.0),
        ..Default::default()
    };
    for slot in TextureSlot::ALL {
        let Some(tex_ref) = source.textures[slot as usize] else {
            continue;
        };
        match arena(tex_ref.texture) {
            Some(texture) => material.set_slot(
                slot,
                SlotBinding {
                    texture,
                    transform: tex_ref.transform,
                },
            ),
            None if slot.is_required() => log::warn!(
                "Base color texture of {} is unavailable, using the diffuse color",
                source.name
            ),
            None => log::warn!(
                "{:?} texture of {} is unavailable, dropping {:?}",
                slot,
                source.name,
                slot.feature()
            ),
        }
    }
    let has_emissive_map = material.features.contains(MaterialFeatures::HAS_EMISSIVE_MAP);
    material.emissive_strength = source
        .emissive_strength
        .unwrap_or(if has_emissive_map { 1.0 } else { 0.0 });
    if skinned {
        material.features |= MaterialFeatures::HAS_SKELETAL_ANIMATION;
    }
    material
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::dom::{SourceTexture, TextureRef};

    fn texture_ref(texture: usize) -> Option<TextureRef> {
        Some(TextureRef {
            texture,
            transform: None,
        })
    }

    #[test]
    fn srgb_wins_for_shared_images() {
        let mut asset = SourceAsset::default();
        for idx in 0..2 {
            asset.images.push(SourceImage {
                name: format!("img{idx}"),
                data: ImageData::Missing(String::new()),
            });
        }
        asset.textures = vec![
            SourceTexture {
                image: 0,
                min_filter: None,
                mag_filter: None,
            },
            SourceTexture {
                image: 1,
                min_filter: None,
                mag_filter: None,
            },
        ];
        let mut normal_only = SourceMaterial::default();
        normal_only.textures[TextureSlot::Normal as usize] = texture_ref(0);
        normal_only.textures[TextureSlot::Roughness as usize] = texture_ref(1);
        let mut emissive = SourceMaterial::default();
        emissive.textures[TextureSlot::Emissive as usize] = texture_ref(0);
        asset.materials = vec![normal_only, emissive];

        let spaces = classify_images(&asset);
        assert_eq!(spaces, vec![Some(ColorSpace::Srgb), Some(ColorSpace::Unorm)]);
    }

    #[test]
    fn lost_textures_downgrade_features() {
        let mut source = SourceMaterial::default();
        source.textures[TextureSlot::Diffuse as usize] = texture_ref(0);
        source.textures[TextureSlot::Normal as usize] = texture_ref(1);
        source.textures[TextureSlot::Emissive as usize] = texture_ref(2);
        let material = build_material(&source, false, |idx| (idx == 2).then_some(0));
        assert_eq!(material.features, MaterialFeatures::HAS_EMISSIVE_MAP);
        assert_eq!(material.emissive_strength, 1.0);
        assert!(material.slot(TextureSlot::Diffuse).is_none());
    }

    #[test]
    fn base_factor_and_defaults() {
        let source = SourceMaterial {
            base_color: [1.0, 0.5, 0.5, 1.0],
            base_factor: Some(0.5),
            metallic: 0.886,
            ..Default::default()
        };
        let material = build_material(&source, true, |_| None);
        assert_eq!(material.diffuse_color, [0.5, 0.25, 0.25, 0.5]);
        assert_eq!(material.roughness, 0.1);
        assert_eq!(material.metallic, 0.886);
        assert_eq!(material.emissive_strength, 0.0);
        assert!(material.features.contains(MaterialFeatures::HAS_SKELETAL_ANIMATION));
    }
}
