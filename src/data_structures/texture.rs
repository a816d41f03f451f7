//! Decoded textures and their GPU counterparts.
//!
//! [`TextureData`] is what the importers produce: RGBA8 pixels plus the color
//! space and sampler filters the source asked for. [`Texture`] is the engine
//! side record after the GPU layer accepted the pixels. [`GpuTexture`] is the
//! wgpu texture/view/sampler triple used by the wgpu backend.

use image::GenericImageView;
use serde::{Deserialize, Serialize};

use crate::gpu::TextureHandle;

/// How texel values are interpreted when sampled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorSpace {
    /// Color data (base color, emissive).
    Srgb,
    /// Linear data (normals, roughness, metallic).
    Unorm,
}

/// Minification / magnification filter, mirroring the glTF sampler enums.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterMode {
    Nearest,
    Linear,
    NearestMipmapNearest,
    LinearMipmapNearest,
    NearestMipmapLinear,
    LinearMipmapLinear,
}

impl FilterMode {
    /// Decodes the GL constants used by glTF samplers.
    pub fn from_gl(code: u32) -> Option<Self> {
        match code {
            9728 => Some(FilterMode::Nearest),
            9729 => Some(FilterMode::Linear),
            9984 => Some(FilterMode::NearestMipmapNearest),
            9985 => Some(FilterMode::LinearMipmapNearest),
            9986 => Some(FilterMode::NearestMipmapLinear),
            9987 => Some(FilterMode::LinearMipmapLinear),
            _ => None,
        }
    }

    pub fn to_wgpu(self) -> wgpu::FilterMode {
        match self {
            FilterMode::Nearest
            | FilterMode::NearestMipmapNearest
            | FilterMode::NearestMipmapLinear => wgpu::FilterMode::Nearest,
            FilterMode::Linear
            | FilterMode::LinearMipmapNearest
            | FilterMode::LinearMipmapLinear => wgpu::FilterMode::Linear,
        }
    }
}

/// CPU-side RGBA8 pixels ready for upload.
#[derive(Clone, Debug)]
pub struct TextureData {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub color_space: ColorSpace,
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn from_image(
        img: &image::DynamicImage,
        label: impl Into<String>,
        color_space: ColorSpace,
        min_filter: FilterMode,
        mag_filter: FilterMode,
    ) -> Self {
        let (width, height) = img.dimensions();
        Self {
            label: label.into(),
            width,
            height,
            color_space,
            min_filter,
            mag_filter,
            pixels: img.to_rgba8().into_raw(),
        }
    }

    /// A 1x1 texture of a single color, used for empty material slots.
    pub fn solid(rgba: [u8; 4], label: impl Into<String>, color_space: ColorSpace) -> Self {
        Self {
            label: label.into(),
            width: 1,
            height: 1,
            color_space,
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            pixels: rgba.to_vec(),
        }
    }

    /// The blue/purple-ish colour that represents "no deformation" in a normal map.
    pub fn default_normal_map() -> Self {
        Self::solid([127, 127, 255, 255], "default normal map", ColorSpace::Unorm)
    }

    pub fn wgpu_format(&self) -> wgpu::TextureFormat {
        match self.color_space {
            ColorSpace::Srgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            ColorSpace::Unorm => wgpu::TextureFormat::Rgba8Unorm,
        }
    }
}

/// An uploaded texture: the opaque GPU handle plus the metadata it was created with.
#[derive(Clone, Debug, PartialEq)]
pub struct Texture {
    pub handle: TextureHandle,
    pub width: u32,
    pub height: u32,
    pub color_space: ColorSpace,
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
}

impl Texture {
    pub fn from_data(handle: TextureHandle, data: &TextureData) -> Self {
        Self {
            handle,
            width: data.width,
            height: data.height,
            color_space: data.color_space,
            min_filter: data.min_filter,
            mag_filter: data.mag_filter,
        }
    }
}

/// A wgpu texture with a view and sampler.
#[derive(Clone, Debug)]
pub struct GpuTexture {
    #[allow(unused)]
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub sampler: wgpu::Sampler,
}

impl GpuTexture {
    pub fn from_data(device: &wgpu::Device, queue: &wgpu::Queue, data: &TextureData) -> Self {
        let size = wgpu::Extent3d {
            width: data.width.max(1),
            height: data.height.max(1),
            depth_or_array_layers: 1,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&data.label),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: data.wgpu_format(),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                aspect: wgpu::TextureAspect::All,
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
            },
            &data.pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * size.width),
                rows_per_image: Some(size.height),
            },
            size,
        );

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: data.mag_filter.to_wgpu(),
            min_filter: data.min_filter.to_wgpu(),
            ..Default::default()
        });

        Self {
            texture,
            view,
            sampler,
        }
    }
}
