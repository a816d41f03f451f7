//! Vertex layout, submeshes and the CPU side of a model.

use std::sync::Arc;

use crate::{
    data_structures::material::Material,
    error::ImportError,
    gpu::{DescriptorHandle, ModelHandle},
};

/// Anything that can describe itself as a vertex buffer layout.
pub trait BufferLayout {
    fn desc() -> wgpu::VertexBufferLayout<'static>;
}

/// The single vertex layout every importer normalizes into.
///
/// `color` is the source vertex color multiplied with the material's diffuse
/// color. `weights` either sum to 0 or to 1.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
    pub normal: [f32; 3],
    pub tangent: [f32; 3],
    pub uv: [f32; 2],
    pub joint_ids: [i32; 4],
    pub weights: [f32; 4],
}

impl Default for Vertex {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            color: [1.0; 4],
            normal: [0.0, 1.0, 0.0],
            tangent: [0.0; 3],
            uv: [0.0; 2],
            joint_ids: [0; 4],
            weights: [0.0; 4],
        }
    }
}

impl Vertex {
    const ATTRIBS: [wgpu::VertexAttribute; 7] = wgpu::vertex_attr_array![
        0 => Float32x3,
        1 => Float32x4,
        2 => Float32x3,
        3 => Float32x3,
        4 => Float32x2,
        5 => Sint32x4,
        6 => Float32x4
    ];
}

impl BufferLayout for Vertex {
    fn desc() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBS,
        }
    }
}

/// A contiguous index range drawn with one material.
#[derive(Clone, Debug, PartialEq)]
pub struct Submesh {
    pub first_index: u32,
    pub index_count: u32,
    pub first_vertex: u32,
    pub vertex_count: u32,
    pub instance_count: u32,
    /// Index into [`ModelData::materials`].
    pub material: usize,
    /// Per-submesh GPU buffers (instance buffer, joint matrices, ...).
    pub resources: Option<DescriptorHandle>,
}

/// Vertex and index data for one model plus its submesh table.
#[derive(Clone, Debug, Default)]
pub struct ModelData {
    pub name: String,
    pub vertices: Vec<Vertex>,
    /// Indices are absolute, i.e. already offset by the submesh's first vertex.
    pub indices: Vec<u32>,
    pub submeshes: Vec<Submesh>,
    pub materials: Vec<Material>,
}

impl ModelData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /**
     * Appends one primitive's vertices and (primitive-local) indices and records
     * a submesh for it. Returns the submesh index.
     */
    pub fn push_primitive(
        &mut self,
        vertices: Vec<Vertex>,
        indices: Vec<u32>,
        material: usize,
        instance_count: u32,
    ) -> usize {
        let first_vertex = self.vertices.len() as u32;
        let first_index = self.indices.len() as u32;
        let vertex_count = vertices.len() as u32;
        let index_count = indices.len() as u32;
        self.vertices.extend(vertices);
        self.indices
            .extend(indices.into_iter().map(|idx| idx + first_vertex));
        self.submeshes.push(Submesh {
            first_index,
            index_count,
            first_vertex,
            vertex_count,
            instance_count,
            material,
            resources: None,
        });
        self.submeshes.len() - 1
    }

    /// Checks that every submesh range and every index stays inside the buffers.
    pub fn validate(&self) -> Result<(), ImportError> {
        let vertex_count = self.vertices.len();
        for (idx, submesh) in self.submeshes.iter().enumerate() {
            let end = submesh.first_index as usize + submesh.index_count as usize;
            if end > self.indices.len() {
                return Err(ImportError::MissingRequiredField(format!(
                    "submesh {idx} of {} ends at index {end} but only {} indices exist",
                    self.name,
                    self.indices.len()
                )));
            }
            if submesh.material >= self.materials.len() {
                return Err(ImportError::MaterialIndexOutOfRange {
                    index: submesh.material,
                    count: self.materials.len(),
                });
            }
        }
        if let Some(bad) = self.indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(ImportError::MissingRequiredField(format!(
                "index {bad} of {} exceeds vertex count {vertex_count}",
                self.name
            )));
        }
        Ok(())
    }
}

/// A model that has been handed to the GPU layer.
#[derive(Debug)]
pub struct Model {
    pub handle: ModelHandle,
    pub data: ModelData,
}

/// Component attached to game objects that draw a model.
#[derive(Clone, Debug)]
pub struct MeshComponent {
    pub model: Arc<Model>,
}
