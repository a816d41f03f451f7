//! Skeletons for GPU skinning.
//!
//! A skeleton is an ordered joint list. The order is the canonical joint index
//! that vertex `joint_ids` refer to. Every frame the animated local pose of
//! each joint is composed with its parents' and with the inverse-bind matrix,
//! and the resulting final matrices are written to the skeleton's joint
//! buffer (`#joints * 64` bytes).

use std::collections::HashMap;

use cgmath::{Matrix4, SquareMatrix};

use crate::{
    data_structures::instance::Transform,
    gpu::{BufferHandle, GpuBackend},
};

/// Marks a joint without a parent joint.
pub const NO_PARENT: Option<usize> = None;

/// Size of one joint matrix in the GPU buffer.
pub const JOINT_MATRIX_SIZE: u64 = std::mem::size_of::<[[f32; 4]; 4]>() as u64;

#[derive(Clone, Debug, PartialEq)]
pub struct Joint {
    pub name: String,
    pub inverse_bind: Matrix4<f32>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Local bind pose, used for paths no channel animates.
    pub rest: Transform,
    /// Current local pose.
    pub pose: Transform,
}

impl Joint {
    pub fn new(name: impl Into<String>, inverse_bind: Matrix4<f32>, rest: Transform) -> Self {
        Self {
            name: name.into(),
            inverse_bind,
            parent: NO_PARENT,
            children: Vec::new(),
            rest,
            pose: rest,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Skeleton {
    pub joints: Vec<Joint>,
    /// Source node index -> joint index, used to retarget animation channels.
    pub global_to_joint: HashMap<usize, usize>,
    pub final_matrices: Vec<Matrix4<f32>>,
    pub buffer: Option<BufferHandle>,
}

impl Skeleton {
    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn joint_index(&self, name: &str) -> Option<usize> {
        self.joints.iter().position(|joint| joint.name == name)
    }

    /// Adds a joint and records which source node it came from.
    pub fn push_joint(&mut self, source_node: usize, joint: Joint) -> usize {
        let idx = self.joints.len();
        self.joints.push(joint);
        self.final_matrices.push(Matrix4::identity());
        self.global_to_joint.insert(source_node, idx);
        idx
    }

    /// Sets `parent` as the parent of `child` and appends `child` to its children.
    pub fn link(&mut self, parent: usize, child: usize) {
        if parent == child || parent >= self.joints.len() || child >= self.joints.len() {
            log::warn!("Ignoring invalid joint link {} -> {}", parent, child);
            return;
        }
        self.joints[child].parent = Some(parent);
        if !self.joints[parent].children.contains(&child) {
            self.joints[parent].children.push(child);
        }
    }

    /// Byte size of the joint matrix buffer.
    pub fn buffer_size(&self) -> u64 {
        self.joints.len() as u64 * JOINT_MATRIX_SIZE
    }

    /// Puts every joint back into its bind pose.
    pub fn reset_pose(&mut self) {
        for joint in &mut self.joints {
            joint.pose = joint.rest;
        }
    }

    /**
     * Recomputes `final_matrices` from the current local poses.
     *
     * Joints are visited parents first, so each global matrix can reuse its
     * parent's. The final matrix is `global * inverse_bind`.
     */
    pub fn update_final_matrices(&mut self) {
        let count = self.joints.len();
        let mut globals: Vec<Option<Matrix4<f32>>> = vec![None; count];
        let mut stack: Vec<usize> = (0..count)
            .filter(|&idx| self.joints[idx].parent.is_none())
            .collect();
        while let Some(idx) = stack.pop() {
            let local = self.joints[idx].pose.to_matrix();
            let global = match self.joints[idx].parent.and_then(|p| globals[p]) {
                Some(parent) => parent * local,
                None => local,
            };
            globals[idx] = Some(global);
            stack.extend(self.joints[idx].children.iter().copied());
        }
        self.final_matrices.resize(count, Matrix4::identity());
        for (idx, joint) in self.joints.iter().enumerate() {
            let global = globals[idx].unwrap_or_else(|| joint.pose.to_matrix());
            self.final_matrices[idx] = global * joint.inverse_bind;
        }
    }

    /// The final matrices as they are laid out in the joint buffer.
    pub fn joint_bytes(&self) -> Vec<u8> {
        let raw: Vec<[[f32; 4]; 4]> = self.final_matrices.iter().map(|&m| m.into()).collect();
        bytemuck::cast_slice(&raw).to_vec()
    }

    /// Writes `final_matrices` into the joint buffer, if one was allocated.
    pub fn upload(&self, backend: &dyn GpuBackend) -> anyhow::Result<()> {
        match self.buffer {
            Some(buffer) => backend.write_buffer(buffer, 0, &self.joint_bytes()),
            None => Ok(()),
        }
    }
}
