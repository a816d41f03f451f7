//! PBR materials, their feature bits and texture slot table.

use bitflags::bitflags;

use crate::{data_structures::texture::ColorSpace, gpu::DescriptorHandle};

bitflags! {
    /// Optional textures and capabilities a material uses. The renderer picks
    /// a pipeline variant from this mask.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MaterialFeatures: u32 {
        const HAS_DIFFUSE_MAP = 1 << 0;
        const HAS_NORMAL_MAP = 1 << 1;
        const HAS_ROUGHNESS_MAP = 1 << 2;
        const HAS_METALLIC_MAP = 1 << 3;
        const HAS_ROUGHNESS_METALLIC_MAP = 1 << 4;
        const HAS_EMISSIVE_MAP = 1 << 5;
        const HAS_SKELETAL_ANIMATION = 1 << 6;
    }
}

pub const TEXTURE_SLOT_COUNT: usize = 6;

/// Fixed positions in a material's texture table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureSlot {
    Diffuse = 0,
    Normal = 1,
    Roughness = 2,
    Metallic = 3,
    RoughnessMetallic = 4,
    Emissive = 5,
}

impl TextureSlot {
    pub const ALL: [TextureSlot; TEXTURE_SLOT_COUNT] = [
        TextureSlot::Diffuse,
        TextureSlot::Normal,
        TextureSlot::Roughness,
        TextureSlot::Metallic,
        TextureSlot::RoughnessMetallic,
        TextureSlot::Emissive,
    ];

    pub fn feature(self) -> MaterialFeatures {
        match self {
            TextureSlot::Diffuse => MaterialFeatures::HAS_DIFFUSE_MAP,
            TextureSlot::Normal => MaterialFeatures::HAS_NORMAL_MAP,
            TextureSlot::Roughness => MaterialFeatures::HAS_ROUGHNESS_MAP,
            TextureSlot::Metallic => MaterialFeatures::HAS_METALLIC_MAP,
            TextureSlot::RoughnessMetallic => MaterialFeatures::HAS_ROUGHNESS_METALLIC_MAP,
            TextureSlot::Emissive => MaterialFeatures::HAS_EMISSIVE_MAP,
        }
    }

    /// Base color and emissive are color data, everything else is linear.
    pub fn color_space(self) -> ColorSpace {
        match self {
            TextureSlot::Diffuse | TextureSlot::Emissive => ColorSpace::Srgb,
            _ => ColorSpace::Unorm,
        }
    }

    /// Base color is the only slot whose loss is not downgraded to a missing feature.
    pub fn is_required(self) -> bool {
        self == TextureSlot::Diffuse
    }
}

/// KHR_texture_transform values for one slot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TextureTransform {
    pub offset: [f32; 2],
    pub rotation: f32,
    pub scale: [f32; 2],
}

impl Default for TextureTransform {
    fn default() -> Self {
        Self {
            offset: [0.0; 2],
            rotation: 0.0,
            scale: [1.0; 2],
        }
    }
}

/// A texture slot entry: an index into the asset's texture arena.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SlotBinding {
    pub texture: usize,
    pub transform: Option<TextureTransform>,
}

/// Pipeline variant selected from the feature bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MaterialKind {
    /// Constant colors only.
    Pbr,
    PbrTextured(MaterialFeatures),
    PbrSkinned(MaterialFeatures),
}

impl From<MaterialFeatures> for MaterialKind {
    fn from(features: MaterialFeatures) -> Self {
        if features.contains(MaterialFeatures::HAS_SKELETAL_ANIMATION) {
            MaterialKind::PbrSkinned(features)
        } else if features.is_empty() {
            MaterialKind::Pbr
        } else {
            MaterialKind::PbrTextured(features)
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Material {
    pub name: String,
    pub diffuse_color: [f32; 4],
    pub emissive_color: [f32; 3],
    pub emissive_strength: f32,
    pub roughness: f32,
    pub metallic: f32,
    pub normal_map_intensity: f32,
    pub features: MaterialFeatures,
    pub slots: [Option<SlotBinding>; TEXTURE_SLOT_COUNT],
    /// GPU descriptor set created from [`Material::kind`] and the slot table.
    pub descriptor: Option<DescriptorHandle>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            diffuse_color: [1.0; 4],
            emissive_color: [0.0; 3],
            emissive_strength: 0.0,
            roughness: 0.1,
            metallic: 0.0,
            normal_map_intensity: 1.0,
            features: MaterialFeatures::empty(),
            slots: [None; TEXTURE_SLOT_COUNT],
            descriptor: None,
        }
    }
}

impl Material {
    pub fn kind(&self) -> MaterialKind {
        self.features.into()
    }

    pub fn slot(&self, slot: TextureSlot) -> Option<SlotBinding> {
        self.slots[slot as usize]
    }

    /// Fills `slot` and raises the matching feature bit.
    pub fn set_slot(&mut self, slot: TextureSlot, binding: SlotBinding) {
        self.slots[slot as usize] = Some(binding);
        self.features |= slot.feature();
    }

    pub fn uniform(&self) -> MaterialUniform {
        MaterialUniform {
            diffuse_color: self.diffuse_color,
            emissive_color: self.emissive_color,
            emissive_strength: self.emissive_strength,
            roughness: self.roughness,
            metallic: self.metallic,
            normal_map_intensity: self.normal_map_intensity,
            features: self.features.bits(),
        }
    }
}

/// Material constants as laid out in the shader's uniform block.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MaterialUniform {
    pub diffuse_color: [f32; 4],
    pub emissive_color: [f32; 3],
    pub emissive_strength: f32,
    pub roughness: f32,
    pub metallic: f32,
    pub normal_map_intensity: f32,
    pub features: u32,
}
