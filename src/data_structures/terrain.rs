//! Terrain and grass components.

use cgmath::Vector3;

use crate::gpu::{BufferHandle, DescriptorHandle};

/// Attached to the terrain entity. The heightmap is the authoritative data
/// for height queries; the mesh is only its rendering.
#[derive(Clone, Debug)]
pub struct TerrainComponent {
    pub heightmap: image::GrayImage,
    pub xz_scale: f32,
    pub y_scale: f32,
    pub translation: Vector3<f32>,
}

impl TerrainComponent {
    pub fn width(&self) -> u32 {
        self.heightmap.width()
    }

    pub fn height(&self) -> u32 {
        self.heightmap.height()
    }

    /// Height of the terrain mesh at pixel `(col, row)` in local units (0..=1).
    pub fn texel(&self, col: u32, row: u32) -> Option<f32> {
        if col >= self.width() || row >= self.height() {
            return None;
        }
        Some(self.heightmap.get_pixel(col, row).0[0] as f32 / 255.0)
    }

    /**
     * World-space surface height below `(x, z)`, bilinearly interpolated
     * between the four surrounding heightmap texels. `None` outside the terrain.
     */
    pub fn height_at(&self, x: f32, z: f32) -> Option<f32> {
        if self.xz_scale == 0.0 {
            return None;
        }
        let u = (x - self.translation.x) / self.xz_scale;
        let v = (z - self.translation.z) / self.xz_scale;
        let max_col = self.width().checked_sub(1)? as f32;
        let max_row = self.height().checked_sub(1)? as f32;
        if !(0.0..=max_col).contains(&u) || !(0.0..=max_row).contains(&v) {
            return None;
        }
        let c0 = u.floor() as u32;
        let r0 = v.floor() as u32;
        let c1 = (c0 + 1).min(max_col as u32);
        let r1 = (r0 + 1).min(max_row as u32);
        let fu = u - c0 as f32;
        let fv = v - r0 as f32;
        let top = self.texel(c0, r0)? * (1.0 - fu) + self.texel(c1, r0)? * fu;
        let bottom = self.texel(c0, r1)? * (1.0 - fu) + self.texel(c1, r1)? * fu;
        let local = top * (1.0 - fv) + bottom * fv;
        Some(local * self.y_scale + self.translation.y)
    }
}

/// Parameters the grass shader needs to place a blade from its map index.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GrassParams {
    pub width: u32,
    pub height: u32,
    pub xz_scale: f32,
    pub y_scale: f32,
}

/// One placed blade: the heightmap byte and the linear map index.
pub type GrassBlade = [u32; 2];

/// Attached to the root of the grass model. The renderer draws the grass
/// model `instance_count` times and reads blade positions from `blades`.
#[derive(Clone, Debug, PartialEq)]
pub struct GrassTag {
    pub instance_count: u32,
    pub blades: BufferHandle,
    pub params: BufferHandle,
    pub descriptor: DescriptorHandle,
}
