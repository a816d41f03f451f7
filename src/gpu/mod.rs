//! The seam between the importers and the GPU layer.
//!
//! Importers never talk to a device directly. Everything they upload goes
//! through a [`GpuBackend`] which hands back opaque handles:
//!
//! - [`GpuBackend::load_model`] uploads vertex and index data of a model
//! - [`GpuBackend::create_texture`] uploads decoded pixels
//! - [`GpuBackend::create_material_descriptor`] bundles a material's constants and textures
//! - [`GpuBackend::create_resource_descriptor`] bundles per-submesh buffers
//! - [`GpuBackend::create_buffer`] / [`GpuBackend::create_instance_buffer`] allocate buffers
//!
//! [`HeadlessBackend`] keeps all of it in memory and is what the tests use.
//! [`WgpuBackend`] uploads through `wgpu`.

mod headless;
mod wgpu_backend;

pub use headless::{HeadlessBackend, UploadStats};
pub use wgpu_backend::WgpuBackend;

use crate::data_structures::{
    material::{MaterialKind, MaterialUniform, TEXTURE_SLOT_COUNT},
    model::ModelData,
    texture::TextureData,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelHandle(pub u64);

/// What a buffer is bound as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Uniform,
    /// Read by shaders as a storage buffer (joint matrices, grass blades).
    Storage,
    /// Per-instance vertex data.
    Instance,
}

/// Anything a load may have created and must give back when it fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GpuResource {
    Model(ModelHandle),
    Texture(TextureHandle),
    Descriptor(DescriptorHandle),
    Buffer(BufferHandle),
}

/// Texture handles for each slot of a material. `None` lets the backend bind
/// its neutral fallback for that slot.
pub type SlotTextures = [Option<TextureHandle>; TEXTURE_SLOT_COUNT];

pub trait GpuBackend: Send + Sync {
    fn load_model(&self, data: &ModelData) -> anyhow::Result<ModelHandle>;

    fn create_texture(&self, data: &TextureData) -> anyhow::Result<TextureHandle>;

    /// Builds the descriptor for one material. The layout is selected by `kind`.
    fn create_material_descriptor(
        &self,
        kind: MaterialKind,
        uniform: &MaterialUniform,
        textures: &SlotTextures,
    ) -> anyhow::Result<DescriptorHandle>;

    fn create_resource_descriptor(&self, buffers: &[BufferHandle]) -> anyhow::Result<DescriptorHandle>;

    fn create_buffer(&self, label: &str, size: u64, usage: BufferUsage) -> anyhow::Result<BufferHandle>;

    /// An instance buffer with room for `count` [`crate::data_structures::instance::InstanceRaw`]s.
    fn create_instance_buffer(&self, count: usize) -> anyhow::Result<BufferHandle>;

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> anyhow::Result<()>;

    fn release(&self, resource: GpuResource);
}
