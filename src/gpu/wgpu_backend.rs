use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{anyhow, bail};
use wgpu::util::DeviceExt;

use crate::{
    data_structures::{
        instance::InstanceRaw,
        material::{MaterialKind, MaterialUniform, TEXTURE_SLOT_COUNT, TextureSlot},
        model::ModelData,
        texture::{ColorSpace, GpuTexture, TextureData},
    },
    gpu::{
        BufferHandle, BufferUsage, DescriptorHandle, GpuBackend, GpuResource, ModelHandle,
        SlotTextures, TextureHandle,
    },
};

/// Vertex and index buffers of an uploaded model.
#[derive(Clone, Debug)]
pub struct GpuModel {
    pub vertex_buffer: wgpu::Buffer,
    pub index_buffer: wgpu::Buffer,
    pub index_count: u32,
}

#[derive(Default)]
struct State {
    models: HashMap<ModelHandle, GpuModel>,
    textures: HashMap<TextureHandle, GpuTexture>,
    buffers: HashMap<BufferHandle, (wgpu::Buffer, BufferUsage)>,
    bind_groups: HashMap<DescriptorHandle, (wgpu::BindGroup, Option<wgpu::Buffer>)>,
}

/// Uploads through a `wgpu` device.
///
/// Material descriptors bind the material uniform at binding 0 followed by a
/// texture/sampler pair per slot. Empty slots are bound to a neutral 1x1
/// fallback so every textured material shares one layout.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    constant_layout: wgpu::BindGroupLayout,
    textured_layout: wgpu::BindGroupLayout,
    fallbacks: Vec<GpuTexture>,
    next: AtomicU64,
    state: Mutex<State>,
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn material_layout(device: &wgpu::Device, textured: bool) -> wgpu::BindGroupLayout {
    let mut entries = vec![uniform_entry(0)];
    if textured {
        for slot in 0..TEXTURE_SLOT_COUNT as u32 {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: 1 + slot * 2,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                },
                count: None,
            });
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: 2 + slot * 2,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            });
        }
    }
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        entries: &entries,
        label: Some(if textured {
            "textured material layout"
        } else {
            "constant material layout"
        }),
    })
}

fn fallback_for(slot: TextureSlot) -> TextureData {
    match slot {
        TextureSlot::Diffuse => TextureData::solid([255; 4], "fallback diffuse", ColorSpace::Srgb),
        TextureSlot::Normal => TextureData::default_normal_map(),
        TextureSlot::Emissive => {
            TextureData::solid([0, 0, 0, 255], "fallback emissive", ColorSpace::Srgb)
        }
        _ => TextureData::solid([255; 4], "fallback linear", ColorSpace::Unorm),
    }
}

impl WgpuBackend {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let constant_layout = material_layout(&device, false);
        let textured_layout = material_layout(&device, true);
        let fallbacks = TextureSlot::ALL
            .iter()
            .map(|&slot| GpuTexture::from_data(&device, &queue, &fallback_for(slot)))
            .collect();
        Self {
            device,
            queue,
            constant_layout,
            textured_layout,
            fallbacks,
            next: AtomicU64::new(0),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn material_layout(&self, kind: MaterialKind) -> &wgpu::BindGroupLayout {
        match kind {
            MaterialKind::Pbr => &self.constant_layout,
            MaterialKind::PbrTextured(_) | MaterialKind::PbrSkinned(_) => &self.textured_layout,
        }
    }

    pub fn model(&self, handle: ModelHandle) -> Option<GpuModel> {
        self.state().models.get(&handle).cloned()
    }

    pub fn buffer(&self, handle: BufferHandle) -> Option<wgpu::Buffer> {
        self.state().buffers.get(&handle).map(|(buffer, _)| buffer.clone())
    }

    pub fn bind_group(&self, handle: DescriptorHandle) -> Option<wgpu::BindGroup> {
        self.state()
            .bind_groups
            .get(&handle)
            .map(|(group, _)| group.clone())
    }
}

impl GpuBackend for WgpuBackend {
    fn load_model(&self, data: &ModelData) -> anyhow::Result<ModelHandle> {
        if data.vertices.is_empty() {
            bail!("model {} has no vertices", data.name);
        }
        let vertex_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{:?} Vertex Buffer", data.name)),
                contents: bytemuck::cast_slice(&data.vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let index_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{:?} Index Buffer", data.name)),
                contents: bytemuck::cast_slice(&data.indices),
                usage: wgpu::BufferUsages::INDEX,
            });
        let handle = ModelHandle(self.next_id());
        self.state().models.insert(
            handle,
            GpuModel {
                vertex_buffer,
                index_buffer,
                index_count: data.indices.len() as u32,
            },
        );
        Ok(handle)
    }

    fn create_texture(&self, data: &TextureData) -> anyhow::Result<TextureHandle> {
        let expected = data.width as usize * data.height as usize * 4;
        if data.pixels.len() != expected {
            bail!(
                "texture {} has {} bytes, expected {}",
                data.label,
                data.pixels.len(),
                expected
            );
        }
        let texture = GpuTexture::from_data(&self.device, &self.queue, data);
        let handle = TextureHandle(self.next_id());
        self.state().textures.insert(handle, texture);
        Ok(handle)
    }

    fn create_material_descriptor(
        &self,
        kind: MaterialKind,
        uniform: &MaterialUniform,
        textures: &SlotTextures,
    ) -> anyhow::Result<DescriptorHandle> {
        let uniform_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Material Uniform Buffer"),
                contents: bytemuck::bytes_of(uniform),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });
        let mut state = self.state();
        let mut bound = Vec::with_capacity(TEXTURE_SLOT_COUNT);
        if kind != MaterialKind::Pbr {
            for (slot, handle) in textures.iter().enumerate() {
                let texture = match handle {
                    Some(handle) => state
                        .textures
                        .get(handle)
                        .ok_or_else(|| anyhow!("material references unknown texture {:?}", handle))?,
                    None => &self.fallbacks[slot],
                };
                bound.push(texture);
            }
        }
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniform_buffer.as_entire_binding(),
        }];
        for (slot, texture) in bound.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: 1 + slot as u32 * 2,
                resource: wgpu::BindingResource::TextureView(&texture.view),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: 2 + slot as u32 * 2,
                resource: wgpu::BindingResource::Sampler(&texture.sampler),
            });
        }
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            layout: self.material_layout(kind),
            entries: &entries,
            label: Some("material bind group"),
        });
        drop(entries);
        drop(bound);
        let handle = DescriptorHandle(self.next_id());
        state
            .bind_groups
            .insert(handle, (group, Some(uniform_buffer)));
        Ok(handle)
    }

    fn create_resource_descriptor(&self, buffers: &[BufferHandle]) -> anyhow::Result<DescriptorHandle> {
        let mut state = self.state();
        let mut resolved = Vec::with_capacity(buffers.len());
        for handle in buffers {
            let entry = state
                .buffers
                .get(handle)
                .ok_or_else(|| anyhow!("resource descriptor references unknown buffer {:?}", handle))?;
            resolved.push(entry);
        }
        let layout_entries: Vec<wgpu::BindGroupLayoutEntry> = resolved
            .iter()
            .enumerate()
            .map(|(binding, (_, usage))| match usage {
                BufferUsage::Uniform => uniform_entry(binding as u32),
                BufferUsage::Storage | BufferUsage::Instance => wgpu::BindGroupLayoutEntry {
                    binding: binding as u32,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            })
            .collect();
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                entries: &layout_entries,
                label: Some("resource layout"),
            });
        let entries: Vec<wgpu::BindGroupEntry> = resolved
            .iter()
            .enumerate()
            .map(|(binding, (buffer, _))| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            layout: &layout,
            entries: &entries,
            label: Some("resource bind group"),
        });
        drop(entries);
        drop(resolved);
        let handle = DescriptorHandle(self.next_id());
        state.bind_groups.insert(handle, (group, None));
        Ok(handle)
    }

    fn create_buffer(&self, label: &str, size: u64, usage: BufferUsage) -> anyhow::Result<BufferHandle> {
        let usages = match usage {
            BufferUsage::Uniform => wgpu::BufferUsages::UNIFORM,
            BufferUsage::Storage => wgpu::BufferUsages::STORAGE,
            BufferUsage::Instance => wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::STORAGE,
        } | wgpu::BufferUsages::COPY_DST;
        // wgpu rejects zero sized bindings
        let size = size.max(wgpu::COPY_BUFFER_ALIGNMENT);
        let size = size.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: usages,
            mapped_at_creation: false,
        });
        let handle = BufferHandle(self.next_id());
        self.state().buffers.insert(handle, (buffer, usage));
        Ok(handle)
    }

    fn create_instance_buffer(&self, count: usize) -> anyhow::Result<BufferHandle> {
        let size = (count * std::mem::size_of::<InstanceRaw>()) as u64;
        self.create_buffer("Instance Buffer", size, BufferUsage::Instance)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let state = self.state();
        let (target, _) = state
            .buffers
            .get(&buffer)
            .ok_or_else(|| anyhow!("write to unknown buffer {:?}", buffer))?;
        if offset + data.len() as u64 > target.size() {
            bail!(
                "write of {} bytes at offset {} overflows buffer {:?}",
                data.len(),
                offset,
                buffer
            );
        }
        self.queue.write_buffer(target, offset, data);
        Ok(())
    }

    fn release(&self, resource: GpuResource) {
        let mut state = self.state();
        match resource {
            GpuResource::Model(handle) => {
                if let Some(model) = state.models.remove(&handle) {
                    model.vertex_buffer.destroy();
                    model.index_buffer.destroy();
                }
            }
            GpuResource::Texture(handle) => {
                if let Some(texture) = state.textures.remove(&handle) {
                    texture.texture.destroy();
                }
            }
            GpuResource::Descriptor(handle) => {
                if let Some((_, Some(uniform))) = state.bind_groups.remove(&handle) {
                    uniform.destroy();
                }
            }
            GpuResource::Buffer(handle) => {
                if let Some((buffer, _)) = state.buffers.remove(&handle) {
                    buffer.destroy();
                }
            }
        }
    }
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("WgpuBackend")
            .field("models", &state.models.len())
            .field("textures", &state.textures.len())
            .field("buffers", &state.buffers.len())
            .field("bind_groups", &state.bind_groups.len())
            .finish()
    }
}
