use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{anyhow, bail};

use crate::{
    data_structures::{
        instance::InstanceRaw,
        material::{MaterialKind, MaterialUniform},
        model::ModelData,
        texture::{ColorSpace, TextureData},
    },
    gpu::{
        BufferHandle, BufferUsage, DescriptorHandle, GpuBackend, GpuResource, ModelHandle,
        SlotTextures, TextureHandle,
    },
};

/// Running totals of everything uploaded since the backend was created.
/// Releases do not decrement these.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub models_loaded: usize,
    pub textures_created: usize,
    pub buffers_created: usize,
    pub instance_buffers_created: usize,
    pub material_descriptors: usize,
    pub resource_descriptors: usize,
    pub released: usize,
}

#[derive(Debug)]
struct HeadlessBuffer {
    usage: BufferUsage,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct HeadlessTexture {
    width: u32,
    height: u32,
    color_space: ColorSpace,
}

#[derive(Debug)]
enum Descriptor {
    Material {
        kind: MaterialKind,
        uniform: MaterialUniform,
        textures: SlotTextures,
    },
    Resources(Vec<BufferHandle>),
}

#[derive(Debug, Default)]
struct State {
    models: HashMap<ModelHandle, ModelData>,
    textures: HashMap<TextureHandle, HeadlessTexture>,
    buffers: HashMap<BufferHandle, HeadlessBuffer>,
    descriptors: HashMap<DescriptorHandle, Descriptor>,
    stats: UploadStats,
}

/// A backend that keeps every upload on the CPU.
///
/// Useful to validate assets without a device and to observe what an import
/// uploaded: how many models, which buffers with which contents.
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    next: AtomicU64,
    state: Mutex<State>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn stats(&self) -> UploadStats {
        self.state().stats
    }

    pub fn live_models(&self) -> usize {
        self.state().models.len()
    }

    pub fn live_textures(&self) -> usize {
        self.state().textures.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn live_descriptors(&self) -> usize {
        self.state().descriptors.len()
    }

    pub fn model(&self, handle: ModelHandle) -> Option<ModelData> {
        self.state().models.get(&handle).cloned()
    }

    pub fn buffer_contents(&self, handle: BufferHandle) -> Option<Vec<u8>> {
        self.state().buffers.get(&handle).map(|b| b.bytes.clone())
    }

    pub fn buffer_usage(&self, handle: BufferHandle) -> Option<BufferUsage> {
        self.state().buffers.get(&handle).map(|b| b.usage)
    }

    pub fn texture_size(&self, handle: TextureHandle) -> Option<(u32, u32)> {
        self.state().textures.get(&handle).map(|t| (t.width, t.height))
    }

    pub fn texture_color_space(&self, handle: TextureHandle) -> Option<ColorSpace> {
        self.state().textures.get(&handle).map(|t| t.color_space)
    }

    /// The material kind a descriptor was created for, if it is a material descriptor.
    pub fn material_kind(&self, handle: DescriptorHandle) -> Option<MaterialKind> {
        match self.state().descriptors.get(&handle)? {
            Descriptor::Material { kind, .. } => Some(*kind),
            Descriptor::Resources(_) => None,
        }
    }

    pub fn material_uniform(&self, handle: DescriptorHandle) -> Option<MaterialUniform> {
        match self.state().descriptors.get(&handle)? {
            Descriptor::Material { uniform, .. } => Some(*uniform),
            Descriptor::Resources(_) => None,
        }
    }

    pub fn material_textures(&self, handle: DescriptorHandle) -> Option<SlotTextures> {
        match self.state().descriptors.get(&handle)? {
            Descriptor::Material { textures, .. } => Some(*textures),
            Descriptor::Resources(_) => None,
        }
    }

    pub fn descriptor_buffers(&self, handle: DescriptorHandle) -> Option<Vec<BufferHandle>> {
        match self.state().descriptors.get(&handle)? {
            Descriptor::Resources(buffers) => Some(buffers.clone()),
            Descriptor::Material { .. } => None,
        }
    }
}

impl GpuBackend for HeadlessBackend {
    fn load_model(&self, data: &ModelData) -> anyhow::Result<ModelHandle> {
        if data.vertices.is_empty() {
            bail!("model {} has no vertices", data.name);
        }
        let handle = ModelHandle(self.next_id());
        let mut state = self.state();
        state.models.insert(handle, data.clone());
        state.stats.models_loaded += 1;
        Ok(handle)
    }

    fn create_texture(&self, data: &TextureData) -> anyhow::Result<TextureHandle> {
        let expected = data.width as usize * data.height as usize * 4;
        if data.pixels.len() != expected {
            bail!(
                "texture {} has {} bytes, expected {} for {}x{} RGBA",
                data.label,
                data.pixels.len(),
                expected,
                data.width,
                data.height
            );
        }
        let handle = TextureHandle(self.next_id());
        let mut state = self.state();
        state.textures.insert(
            handle,
            HeadlessTexture {
                width: data.width,
                height: data.height,
                color_space: data.color_space,
            },
        );
        state.stats.textures_created += 1;
        Ok(handle)
    }

    fn create_material_descriptor(
        &self,
        kind: MaterialKind,
        uniform: &MaterialUniform,
        textures: &SlotTextures,
    ) -> anyhow::Result<DescriptorHandle> {
        let mut state = self.state();
        if let Some(missing) = textures
            .iter()
            .flatten()
            .find(|handle| !state.textures.contains_key(*handle))
        {
            bail!("material descriptor references unknown texture {:?}", missing);
        }
        let handle = DescriptorHandle(self.next_id());
        state.descriptors.insert(
            handle,
            Descriptor::Material {
                kind,
                uniform: *uniform,
                textures: *textures,
            },
        );
        state.stats.material_descriptors += 1;
        Ok(handle)
    }

    fn create_resource_descriptor(&self, buffers: &[BufferHandle]) -> anyhow::Result<DescriptorHandle> {
        let mut state = self.state();
        if let Some(missing) = buffers.iter().find(|b| !state.buffers.contains_key(*b)) {
            bail!("resource descriptor references unknown buffer {:?}", missing);
        }
        let handle = DescriptorHandle(self.next_id());
        state
            .descriptors
            .insert(handle, Descriptor::Resources(buffers.to_vec()));
        state.stats.resource_descriptors += 1;
        Ok(handle)
    }

    fn create_buffer(&self, _label: &str, size: u64, usage: BufferUsage) -> anyhow::Result<BufferHandle> {
        let handle = BufferHandle(self.next_id());
        let mut state = self.state();
        state.buffers.insert(
            handle,
            HeadlessBuffer {
                usage,
                bytes: vec![0; size as usize],
            },
        );
        state.stats.buffers_created += 1;
        Ok(handle)
    }

    fn create_instance_buffer(&self, count: usize) -> anyhow::Result<BufferHandle> {
        let size = (count * std::mem::size_of::<InstanceRaw>()) as u64;
        let handle = self.create_buffer("instance buffer", size, BufferUsage::Instance)?;
        self.state().stats.instance_buffers_created += 1;
        Ok(handle)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut state = self.state();
        let target = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| anyhow!("write to unknown buffer {:?}", buffer))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > target.bytes.len() {
            bail!(
                "write of {} bytes at offset {} overflows buffer {:?} of {} bytes",
                data.len(),
                offset,
                buffer,
                target.bytes.len()
            );
        }
        target.bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn release(&self, resource: GpuResource) {
        let mut state = self.state();
        let removed = match resource {
            GpuResource::Model(handle) => state.models.remove(&handle).is_some(),
            GpuResource::Texture(handle) => state.textures.remove(&handle).is_some(),
            GpuResource::Descriptor(handle) => state.descriptors.remove(&handle).is_some(),
            GpuResource::Buffer(handle) => state.buffers.remove(&handle).is_some(),
        };
        if removed {
            state.stats.released += 1;
        } else {
            log::warn!("Release of unknown GPU resource {:?}", resource);
        }
    }
}
