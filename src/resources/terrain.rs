//! Heightmap terrain and grass placement.
//!
//! The terrain mesh is built on the CPU and then goes through the normal
//! scene construction as a one-node asset, so materials, instancing and
//! rollback behave exactly like any other load.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, bail};
use cgmath::{InnerSpace, Vector3};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::{
    context::Context,
    data_structures::{
        instance::Transform,
        material::TextureSlot,
        registry::Entity,
        scene_graph::Scene,
        terrain::{GrassBlade, GrassParams, GrassTag, TerrainComponent},
    },
    error::ImportError,
    gpu::{BufferUsage, GpuResource},
    resources::{
        dom::{
            ImageData, LocalTransform, SourceAsset, SourceImage, SourceMaterial, SourceMesh, SourceNode,
            SourcePrimitive, SourceScene, SourceTexture, TextureRef,
        },
        parse_asset,
        scene::{LoadRequest, LoadedAsset, construct_tracked, node_key},
        transaction::LoadTransaction,
    },
};

const TERRAIN_NODE: &str = "terrain";

/// PBR parameters of the terrain surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainMaterial {
    pub name: String,
    pub base_color: [f32; 4],
    pub roughness: f32,
    pub metallic: f32,
    pub emissive: [f32; 3],
    pub diffuse_map: Option<PathBuf>,
    pub normal_map: Option<PathBuf>,
}

impl Default for TerrainMaterial {
    fn default() -> Self {
        Self {
            name: "terrain".to_string(),
            base_color: [1.0; 4],
            roughness: 1.0,
            metallic: 0.0,
            emissive: [0.0; 3],
            diffuse_map: None,
            normal_map: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrassSpec {
    pub model: PathBuf,
    /// 8-bit greyscale, brighter means denser.
    pub density_map: PathBuf,
    /// 8-bit greyscale; blades are only placed where it is above 0.
    pub heightmap: PathBuf,
    pub scale_xz: f32,
    pub scale_y: f32,
    /// Transform of the grass model root. Rotation is `xyzw`.
    pub rotation: [f32; 4],
    pub translation: [f32; 3],
    pub scale: [f32; 3],
}

impl Default for GrassSpec {
    fn default() -> Self {
        Self {
            model: PathBuf::new(),
            density_map: PathBuf::new(),
            heightmap: PathBuf::new(),
            scale_xz: 1.0,
            scale_y: 1.0,
            rotation: [0.0, 0.0, 0.0, 1.0],
            translation: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainSpec {
    pub heightmap: PathBuf,
    pub color_map: Option<PathBuf>,
    /// JSON file whose fields override the ones set here.
    pub description: Option<PathBuf>,
    pub xz_scale: f32,
    pub y_scale: f32,
    pub translation: [f32; 3],
    pub material: TerrainMaterial,
    pub grass: Option<GrassSpec>,
}

impl Default for TerrainSpec {
    fn default() -> Self {
        Self {
            heightmap: PathBuf::new(),
            color_map: None,
            description: None,
            xz_scale: 1.0,
            y_scale: 1.0,
            translation: [0.0; 3],
            material: TerrainMaterial::default(),
            grass: None,
        }
    }
}

/// Contents of a terrain description file. Every field is optional.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct TerrainDescription {
    xz_scale: Option<f32>,
    y_scale: Option<f32>,
    translation: Option<[f32; 3]>,
    material: Option<TerrainMaterial>,
    grass: Option<GrassSpec>,
}

impl TerrainSpec {
    /// This terrain spec with its description file (if any) applied on top.
    pub fn resolved(&self) -> anyhow::Result<TerrainSpec> {
        let Some(path) = &self.description else {
            return Ok(self.clone());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read terrain description {}", path.display()))?;
        let description: TerrainDescription = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse terrain description {}", path.display()))?;
        let mut spec = self.clone();
        spec.xz_scale = description.xz_scale.unwrap_or(spec.xz_scale);
        spec.y_scale = description.y_scale.unwrap_or(spec.y_scale);
        spec.translation = description.translation.unwrap_or(spec.translation);
        if let Some(material) = description.material {
            spec.material = material;
        }
        if description.grass.is_some() {
            spec.grass = description.grass;
        }
        Ok(spec)
    }
}

#[derive(Clone, Debug, Default)]
pub struct LoadedTerrain {
    pub terrain: LoadedAsset,
    /// The terrain game object of every instance.
    pub entities: Vec<Entity>,
    pub grass: Option<LoadedAsset>,
    pub blade_count: usize,
}

fn open_image(path: &Path, what: &str) -> anyhow::Result<image::DynamicImage> {
    if !path.is_file() {
        bail!(ImportError::FileNotFound(path.to_path_buf()));
    }
    image::open(path).with_context(|| format!("Failed to decode {what} {}", path.display()))
}

/// Opens an 8-bit greyscale image. Anything else is rejected.
pub fn open_heightmap(path: &Path) -> anyhow::Result<image::GrayImage> {
    match open_image(path, "heightmap")? {
        image::DynamicImage::ImageLuma8(img) => Ok(img),
        other => bail!(ImportError::MissingRequiredField(format!(
            "heightmap {} must be 8-bit greyscale, found {:?}",
            path.display(),
            other.color()
        ))),
    }
}

/// Opens an 8-bit RGBA color map that must match the heightmap dimensions.
pub fn open_color_map(path: &Path, width: u32, height: u32) -> anyhow::Result<image::RgbaImage> {
    let img = match open_image(path, "color map")? {
        image::DynamicImage::ImageRgba8(img) => img,
        other => bail!(ImportError::MissingRequiredField(format!(
            "color map {} must be 8-bit RGBA, found {:?}",
            path.display(),
            other.color()
        ))),
    };
    if img.dimensions() != (width, height) {
        bail!(ImportError::MissingRequiredField(format!(
            "color map {} is {:?} but the heightmap is {:?}",
            path.display(),
            img.dimensions(),
            (width, height)
        )));
    }
    Ok(img)
}

/**
 * Builds the terrain grid: one vertex per pixel at `(col, h/255, row)` and
 * two triangles per cell.
 *
 * Interior normals sum the four cross products of the neighbor edges, border
 * vertices point straight up. Without a color map the color encodes the
 * height in the blue channel.
 */
pub fn build_mesh(heightmap: &image::GrayImage, color_map: Option<&image::RgbaImage>) -> SourcePrimitive {
    let (w, h) = heightmap.dimensions();
    let count = (w * h) as usize;
    let mut positions = Vec::with_capacity(count);
    let mut colors = Vec::with_capacity(count);
    let mut uvs = Vec::with_capacity(count);
    for row in 0..h {
        for col in 0..w {
            let height = heightmap.get_pixel(col, row).0[0];
            positions.push([col as f32, height as f32 / 255.0, row as f32]);
            colors.push(match color_map {
                Some(map) => map.get_pixel(col, row).0.map(|c| c as f32 / 255.0),
                None => [0.0, 0.0, height as f32 / (3.0 * 255.0), 1.0],
            });
            uvs.push([
                col as f32 / (w.max(2) - 1) as f32,
                row as f32 / (h.max(2) - 1) as f32,
            ]);
        }
    }

    let at = |col: u32, row: u32| Vector3::from(positions[(row * w + col) as usize]);
    let mut normals = Vec::with_capacity(count);
    for row in 0..h {
        for col in 0..w {
            if col == 0 || row == 0 || col == w - 1 || row == h - 1 {
                normals.push([0.0, 1.0, 0.0]);
                continue;
            }
            let center = at(col, row);
            let left = at(col - 1, row) - center;
            let right = at(col + 1, row) - center;
            let up = at(col, row + 1) - center;
            let down = at(col, row - 1) - center;
            let sum = left.cross(-down) + (-down).cross(right) + right.cross(-up) + (-up).cross(left);
            let normal = if sum.magnitude2() > 0.0 {
                sum.normalize()
            } else {
                Vector3::unit_y()
            };
            normals.push(normal.into());
        }
    }

    let mut indices = Vec::with_capacity(6 * (w.saturating_sub(1) * h.saturating_sub(1)) as usize);
    for row in 0..h.saturating_sub(1) {
        for col in 0..w.saturating_sub(1) {
            let tl = row * w + col;
            let tr = tl + 1;
            let bl = (row + 1) * w + col;
            let br = bl + 1;
            indices.extend_from_slice(&[tl, bl, tr, tr, bl, br]);
        }
    }

    SourcePrimitive {
        positions,
        normals: Some(normals),
        uvs: Some(uvs),
        colors: Some(colors),
        indices: Some(indices),
        material: Some(0),
        ..Default::default()
    }
}

/// One blade per map index whose height is above 0 and whose random draw
/// weighted by the density passes `threshold`.
pub fn place_grass(
    heightmap: &image::GrayImage,
    density: &image::GrayImage,
    threshold: f32,
    seed: Option<u64>,
) -> Vec<GrassBlade> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    heightmap
        .as_raw()
        .iter()
        .zip(density.as_raw())
        .enumerate()
        .filter_map(|(k, (&height, &density))| {
            let p_random: f32 = rng.r#gen();
            let p_place = p_random * density as f32 / 255.0;
            (height > 0 && p_place > threshold).then_some([height as u32, k as u32])
        })
        .collect()
}

fn terrain_asset(spec: &TerrainSpec, primitive: SourcePrimitive) -> SourceAsset {
    let material = &spec.material;
    let mut source = SourceMaterial {
        name: material.name.clone(),
        base_color: material.base_color,
        roughness: Some(material.roughness),
        metallic: material.metallic,
        emissive: material.emissive,
        ..Default::default()
    };
    let mut asset = SourceAsset::default();
    for (slot, path) in [
        (TextureSlot::Diffuse, &material.diffuse_map),
        (TextureSlot::Normal, &material.normal_map),
    ] {
        let Some(path) = path else {
            continue;
        };
        asset.images.push(SourceImage {
            name: path.display().to_string(),
            data: ImageData::File(path.clone()),
        });
        asset.textures.push(SourceTexture {
            image: asset.images.len() - 1,
            min_filter: None,
            mag_filter: None,
        });
        source.textures[slot as usize] = Some(TextureRef {
            texture: asset.textures.len() - 1,
            transform: None,
        });
    }
    asset.materials.push(source);
    asset.meshes.push(SourceMesh {
        name: TERRAIN_NODE.to_string(),
        primitives: vec![primitive],
    });
    asset.nodes.push(SourceNode {
        name: TERRAIN_NODE.to_string(),
        transform: LocalTransform::Trs {
            translation: spec.translation,
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: [spec.xz_scale, spec.y_scale, spec.xz_scale],
        },
        mesh: Some(0),
        ..Default::default()
    });
    asset.scenes.push(SourceScene {
        name: TERRAIN_NODE.to_string(),
        roots: vec![0],
    });
    asset
}

/// Builds `instances` terrains from `spec` into `scene`, plus the grass if
/// `spec` asks for it. Any failure removes everything this call created.
pub fn load(ctx: &Context, scene: &mut Scene, instances: usize, spec: &TerrainSpec) -> anyhow::Result<LoadedTerrain> {
    let txn = LoadTransaction::new();
    match load_tracked(ctx, scene, instances, spec, &txn) {
        Ok(loaded) => Ok(loaded),
        Err(e) => {
            log::error!("Loading terrain {} failed: {:#}", spec.heightmap.display(), e);
            txn.rollback(scene, ctx.backend());
            Err(e)
        }
    }
}

fn load_tracked(
    ctx: &Context,
    scene: &mut Scene,
    instances: usize,
    spec: &TerrainSpec,
    txn: &LoadTransaction,
) -> anyhow::Result<LoadedTerrain> {
    let spec = spec.resolved()?;
    let heightmap = open_heightmap(&spec.heightmap)?;
    let (width, height) = heightmap.dimensions();
    let color_map = spec
        .color_map
        .as_deref()
        .map(|path| open_color_map(path, width, height))
        .transpose()?;

    // validate the grass inputs before anything is created
    let grass_inputs = match &spec.grass {
        Some(grass) => {
            let grass_heightmap = open_heightmap(&grass.heightmap)?;
            let density = open_heightmap(&grass.density_map)?;
            if density.dimensions() != grass_heightmap.dimensions() {
                bail!(ImportError::MissingRequiredField(format!(
                    "grass density map {} does not match its heightmap {}",
                    grass.density_map.display(),
                    grass.heightmap.display()
                )));
            }
            Some((grass, grass_heightmap, density))
        }
        None => None,
    };

    let primitive = build_mesh(&heightmap, color_map.as_ref());
    let asset = terrain_asset(&spec, primitive);
    let key_path = spec.heightmap.to_string_lossy();
    let prefix = ctx.config.dictionary_prefix.as_str();
    let terrain = construct_tracked(
        ctx,
        scene,
        &asset,
        &LoadRequest {
            path: &key_path,
            prefix,
            instances,
            scene_id: None,
            group: None,
            root_transform: Transform::new(),
        },
        txn,
    )?;
    let mut entities = Vec::with_capacity(instances);
    for instance in 0..instances {
        let key = node_key(prefix, &key_path, instance, TERRAIN_NODE, TERRAIN_NODE);
        let entity = scene
            .lookup(&key)
            .with_context(|| format!("Terrain entity {key} was not created"))?;
        scene.registry.insert(
            entity,
            TerrainComponent {
                heightmap: heightmap.clone(),
                xz_scale: spec.xz_scale,
                y_scale: spec.y_scale,
                translation: spec.translation.into(),
            },
        );
        entities.push(entity);
    }
    log::info!(
        "Terrain {}: {}x{} heightmap, {} instances",
        spec.heightmap.display(),
        width,
        height,
        instances
    );

    let mut loaded = LoadedTerrain {
        terrain,
        entities,
        grass: None,
        blade_count: 0,
    };
    if let Some((grass, grass_heightmap, density)) = grass_inputs {
        let blades = place_grass(
            &grass_heightmap,
            &density,
            ctx.config.grass_threshold,
            ctx.config.grass_seed,
        );
        let (grass_asset, tag) = load_grass(ctx, scene, grass, &grass_heightmap, &blades, txn)?;
        log::info!("Placed {} grass blades from {}", tag.instance_count, grass.density_map.display());
        loaded.blade_count = blades.len();
        loaded.grass = Some(grass_asset);
    }
    Ok(loaded)
}

fn load_grass(
    ctx: &Context,
    scene: &mut Scene,
    grass: &GrassSpec,
    grass_heightmap: &image::GrayImage,
    blades: &[GrassBlade],
    txn: &LoadTransaction,
) -> anyhow::Result<(LoadedAsset, GrassTag)> {
    let backend = ctx.backend();
    let model = parse_asset(&ctx.config, &grass.model, None)?;
    let key_path = grass.model.to_string_lossy();
    let loaded = construct_tracked(
        ctx,
        scene,
        &model,
        &LoadRequest {
            path: &key_path,
            prefix: &ctx.config.dictionary_prefix,
            instances: 1,
            scene_id: None,
            group: None,
            root_transform: Transform::from_trs(grass.translation, grass.rotation, grass.scale),
        },
        txn,
    )?;
    let root = *loaded
        .roots
        .first()
        .context("Grass model produced no root")?;

    let blade_bytes: &[u8] = bytemuck::cast_slice(blades);
    let blade_buffer = backend.create_buffer(
        "grass blades",
        blade_bytes.len().max(std::mem::size_of::<GrassBlade>()) as u64,
        BufferUsage::Storage,
    )?;
    txn.track(GpuResource::Buffer(blade_buffer));
    if !blade_bytes.is_empty() {
        backend.write_buffer(blade_buffer, 0, blade_bytes)?;
    }
    let params = GrassParams {
        width: grass_heightmap.width(),
        height: grass_heightmap.height(),
        xz_scale: grass.scale_xz,
        y_scale: grass.scale_y,
    };
    let params_buffer = backend.create_buffer(
        "grass params",
        std::mem::size_of::<GrassParams>() as u64,
        BufferUsage::Uniform,
    )?;
    txn.track(GpuResource::Buffer(params_buffer));
    backend.write_buffer(params_buffer, 0, bytemuck::bytes_of(&params))?;
    let descriptor = backend.create_resource_descriptor(&[blade_buffer, params_buffer])?;
    txn.track(GpuResource::Descriptor(descriptor));

    let tag = GrassTag {
        instance_count: blades.len() as u32,
        blades: blade_buffer,
        params: params_buffer,
        descriptor,
    };
    scene.registry.insert(root, tag.clone());
    Ok((loaded, tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_heightmap_grid() {
        let heightmap = image::GrayImage::from_pixel(4, 4, image::Luma([128]));
        let mesh = build_mesh(&heightmap, None);
        assert_eq!(mesh.positions.len(), 16);
        assert_eq!(mesh.indices.as_ref().map(Vec::len), Some(54));
        assert!(mesh.positions.iter().all(|p| p[1] == 128.0 / 255.0));
        for n in mesh.normals.as_ref().expect("normals") {
            assert!((n[1] - 1.0).abs() < 1e-6);
        }
        assert_eq!(mesh.colors.as_ref().expect("colors")[0], [0.0, 0.0, 128.0 / 765.0, 1.0]);
        assert_eq!(&mesh.indices.as_ref().expect("indices")[..6], &[0, 4, 1, 1, 4, 5]);
    }

    #[test]
    fn slopes_tilt_interior_normals() {
        // height rises with the column
        let heightmap = image::GrayImage::from_fn(3, 3, |col, _| image::Luma([col as u8 * 100]));
        let mesh = build_mesh(&heightmap, None);
        let n = mesh.normals.as_ref().expect("normals")[4];
        assert!(n[0] < 0.0, "normal should lean away from the rise: {n:?}");
        assert!(n[1] > 0.0);
    }

    #[test]
    fn grass_is_deterministic_and_skips_zero_height() {
        let heightmap = image::GrayImage::from_fn(8, 8, |col, _| image::Luma([if col == 0 { 0 } else { 200 }]));
        let density = image::GrayImage::from_pixel(8, 8, image::Luma([255]));
        let a = place_grass(&heightmap, &density, 0.05, Some(7));
        let b = place_grass(&heightmap, &density, 0.05, Some(7));
        assert_eq!(a, b);
        assert!(!a.is_empty());
        assert!(a.iter().all(|&[h, k]| h == 200 && k % 8 != 0));
        let none = place_grass(&heightmap, &image::GrayImage::new(8, 8), 0.05, Some(7));
        assert!(none.is_empty());
    }
}
