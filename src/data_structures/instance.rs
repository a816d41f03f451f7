//! Instance transformation data for GPU rendering.
//!
//! Per-instance data like position, rotation, and scale is stored as
//! GPU buffers and passed to shaders for efficient multi-draw instancing.

use cgmath::{InnerSpace, Matrix, Matrix3, Matrix4, One, Quaternion, SquareMatrix, Vector3};

use crate::{
    data_structures::{model::BufferLayout, registry::Entity},
    gpu::{BufferHandle, GpuBackend},
};

/// Local transformation: position, rotation (as quaternion), and scale.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub position: Vector3<f32>,
    pub rotation: Quaternion<f32>,
    pub scale: Vector3<f32>,
}

impl Transform {
    /// Identity transformation (no move, rotate, or scale).
    pub fn new() -> Self {
        Self {
            position: Vector3::new(0.0, 0.0, 0.0),
            // `Quaternion::one()` is the identity quaternion (no rotation)
            rotation: Quaternion::one(),
            scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }

    /// Builds a transform from glTF-style arrays. `rotation` is stored x, y, z, w.
    pub fn from_trs(translation: [f32; 3], rotation: [f32; 4], scale: [f32; 3]) -> Self {
        let [x, y, z, w] = rotation;
        Self {
            position: translation.into(),
            rotation: Quaternion::new(w, x, y, z),
            scale: scale.into(),
        }
    }

    /// Decomposes an affine matrix into translation, rotation and scale.
    ///
    /// A negative determinant is folded into the x scale.
    pub fn from_matrix(matrix: Matrix4<f32>) -> Self {
        let position = matrix.w.truncate();
        let mut sx = matrix.x.truncate().magnitude();
        let sy = matrix.y.truncate().magnitude();
        let sz = matrix.z.truncate().magnitude();
        if matrix.determinant() < 0.0 {
            sx = -sx;
        }
        let safe = |s: f32| if s.abs() > f32::EPSILON { s } else { 1.0 };
        let rotation_matrix = Matrix3::from_cols(
            matrix.x.truncate() / safe(sx),
            matrix.y.truncate() / safe(sy),
            matrix.z.truncate() / safe(sz),
        );
        Self {
            position,
            rotation: Quaternion::from(rotation_matrix).normalize(),
            scale: Vector3::new(sx, sy, sz),
        }
    }

    pub fn to_matrix(&self) -> Matrix4<f32> {
        Matrix4::from_translation(self.position)
            * Matrix4::from(self.rotation)
            * Matrix4::from_nonuniform_scale(self.scale.x, self.scale.y, self.scale.z)
    }

    /// The quaternion in x, y, z, w order.
    pub fn rotation_xyzw(&self) -> [f32; 4] {
        [self.rotation.v.x, self.rotation.v.y, self.rotation.v.z, self.rotation.s]
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::new()
    }
}

/// Inverse-transpose of the upper-left 3x3, padded back to a 4x4.
pub fn normal_matrix(world: &Matrix4<f32>) -> Matrix4<f32> {
    let upper = Matrix3::from_cols(world.x.truncate(), world.y.truncate(), world.z.truncate());
    let inverse_transpose = upper
        .invert()
        .map(|inv| inv.transpose())
        .unwrap_or_else(Matrix3::identity);
    Matrix4::from(inverse_transpose)
}

/**
 * The raw instance is the actual data stored on the GPU: the local-to-world
 * matrix and the matching normal matrix.
 */
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRaw {
    pub model: [[f32; 4]; 4],
    pub normal: [[f32; 4]; 4],
}

impl InstanceRaw {
    pub fn from_world(world: &Matrix4<f32>) -> Self {
        Self {
            model: (*world).into(),
            normal: normal_matrix(world).into(),
        }
    }
}

/**
 * Two mat4s take up eight vertex slots as they are technically eight vec4s.
 * Locations start after the seven [`crate::data_structures::model::Vertex`] attributes.
 */
impl BufferLayout for InstanceRaw {
    fn desc() -> wgpu::VertexBufferLayout<'static> {
        const ATTRIBS: [wgpu::VertexAttribute; 8] = wgpu::vertex_attr_array![
            7 => Float32x4,
            8 => Float32x4,
            9 => Float32x4,
            10 => Float32x4,
            11 => Float32x4,
            12 => Float32x4,
            13 => Float32x4,
            14 => Float32x4
        ];
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<InstanceRaw>() as wgpu::BufferAddress,
            // Shaders only advance to the next instance when a new instance starts
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &ATTRIBS,
        }
    }
}

/// Attached to the first game object of a multiply-instanced asset.
///
/// Holds the instance buffer (one slot per requested instance) and every
/// entity that draws through it. Slot `i` belongs to `instances[i]`.
#[derive(Clone, Debug)]
pub struct InstanceTag {
    pub buffer: BufferHandle,
    pub instances: Vec<Entity>,
    slots: Vec<Option<InstanceRaw>>,
}

impl InstanceTag {
    pub fn new(buffer: BufferHandle, capacity: usize) -> Self {
        Self {
            buffer,
            instances: Vec::with_capacity(capacity),
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn filled_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn slot(&self, idx: usize) -> Option<&InstanceRaw> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    /// Writes slot `idx` on the CPU mirror and the GPU buffer.
    pub fn write_slot(
        &mut self,
        backend: &dyn GpuBackend,
        idx: usize,
        raw: InstanceRaw,
    ) -> anyhow::Result<()> {
        let Some(slot) = self.slots.get_mut(idx) else {
            anyhow::bail!(
                "instance slot {idx} is out of bounds for an instance buffer of {}",
                self.slots.len()
            );
        };
        *slot = Some(raw);
        let offset = (idx * std::mem::size_of::<InstanceRaw>()) as u64;
        backend.write_buffer(self.buffer, offset, bytemuck::bytes_of(&raw))
    }
}

/// Attached to instances after the first. Points at the entity that owns the
/// [`InstanceTag`] and the slot this instance writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceRef {
    pub first: Entity,
    pub slot: usize,
}
