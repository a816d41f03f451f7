//! Native FBX object graph reader.
//!
//! Builds an [`FbxDocument`] from the `Objects` and `Connections` records of
//! a binary FBX file: models become nodes, geometry is unrolled per polygon
//! vertex and split by material, skin clusters become bones and animation
//! curves become keyed tracks. Values stay in file units; the conversion in
//! [`crate::resources::fbx`] handles centimeters.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    path::Path,
};

use anyhow::{Context as _, bail};
use cgmath::{Deg, Matrix4, SquareMatrix, Vector3};

use crate::{
    data_structures::{instance::Transform, material::TextureSlot},
    error::ImportError,
    resources::{
        fbx::{
            FbxAnimation, FbxBone, FbxDocument, FbxMaterial, FbxMesh, FbxNode, FbxTextureSource,
            FbxTrack,
        },
        fbx_reader::{self, FbxFile, Property, Record},
    },
};

/// Animation key times are stored in these ticks.
const TICKS_PER_SECOND: f64 = 46_186_158_000.0;
/// Object ids before 7.0 are strings, which this reader does not handle.
const FIRST_SUPPORTED_VERSION: u32 = 7000;

/// Reads a binary FBX file from disk.
pub fn read(path: &Path) -> anyhow::Result<FbxDocument> {
    let bytes = std::fs::read(path).map_err(|_| ImportError::FileNotFound(path.to_path_buf()))?;
    let file = fbx_reader::read(&bytes).with_context(|| format!("Failed to read {}", path.display()))?;
    let document = build(&file).with_context(|| format!("Failed to read {}", path.display()))?;
    log::debug!(
        "Read {}: {} nodes, {} meshes, {} materials, {} animations",
        path.display(),
        document.nodes.len(),
        document.meshes.len(),
        document.materials.len(),
        document.animations.len()
    );
    Ok(document)
}

/// Display name of an object: the part before the `\0\x01Class` suffix.
fn object_name(record: &Record) -> String {
    let full = record.property(1).and_then(Property::as_str).unwrap_or_default();
    full.split("\u{0}\u{1}").next().unwrap_or_default().to_string()
}

fn object_class(record: &Record) -> &str {
    record.property(2).and_then(Property::as_str).unwrap_or_default()
}

struct Connection {
    child: i64,
    parent: i64,
    property: Option<String>,
}

struct Graph<'a> {
    objects: HashMap<i64, &'a Record>,
    connections: Vec<Connection>,
}

impl<'a> Graph<'a> {
    fn new(file: &'a FbxFile) -> anyhow::Result<Self> {
        let objects_record = file
            .record("Objects")
            .ok_or_else(|| ImportError::MissingRequiredField("FBX Objects section".to_string()))?;
        let objects = objects_record
            .children
            .iter()
            .filter_map(|record| Some((record.property(0)?.as_i64()?, record)))
            .collect();
        let connections = file
            .record("Connections")
            .map(|record| {
                record
                    .children_named("C")
                    .filter_map(|c| {
                        Some(Connection {
                            child: c.property(1)?.as_i64()?,
                            parent: c.property(2)?.as_i64()?,
                            property: c.property(3).and_then(Property::as_str).map(str::to_string),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self { objects, connections })
    }

    /// Children of `parent` whose record is called `kind`, in file order.
    fn children(&self, parent: i64, kind: &str) -> Vec<(i64, &'a Record, Option<&str>)> {
        self.connections
            .iter()
            .filter(|c| c.parent == parent)
            .filter_map(|c| {
                let record = *self.objects.get(&c.child)?;
                (record.name == kind).then_some((c.child, record, c.property.as_deref()))
            })
            .collect()
    }

    fn parents(&self, child: i64, kind: &str) -> Vec<(i64, &'a Record, Option<&str>)> {
        self.connections
            .iter()
            .filter(|c| c.child == child)
            .filter_map(|c| {
                let record = *self.objects.get(&c.parent)?;
                (record.name == kind).then_some((c.parent, record, c.property.as_deref()))
            })
            .collect()
    }
}

/// `Properties70` entries by name.
fn properties70(record: &Record) -> HashMap<&str, &Record> {
    record
        .child("Properties70")
        .map(|props| {
            props
                .children_named("P")
                .filter_map(|p| Some((p.property(0)?.as_str()?, p)))
                .collect()
        })
        .unwrap_or_default()
}

fn prop_f32(props: &HashMap<&str, &Record>, name: &str) -> Option<f32> {
    props.get(name)?.property(4)?.as_f64().map(|v| v as f32)
}

fn prop_vec3(props: &HashMap<&str, &Record>, name: &str) -> Option<[f32; 3]> {
    let p = props.get(name)?;
    let mut out = [0.0; 3];
    for (i, v) in out.iter_mut().enumerate() {
        *v = p.property(4 + i)?.as_f64()? as f32;
    }
    Some(out)
}

fn array_f64(record: &Record, name: &str) -> Option<Vec<f64>> {
    record.child(name)?.property(0)?.to_f64s()
}

fn array_i64(record: &Record, name: &str) -> Option<Vec<i64>> {
    record.child(name)?.property(0)?.to_i64s()
}

/// Sixteen doubles as a column-major matrix.
fn matrix(record: &Record, name: &str) -> Option<[[f32; 4]; 4]> {
    let values = array_f64(record, name)?;
    if values.len() < 16 {
        return None;
    }
    let mut out = [[0.0f32; 4]; 4];
    for (i, v) in values.iter().take(16).enumerate() {
        out[i / 4][i % 4] = *v as f32;
    }
    Some(out)
}

/// Euler angles in degrees, applied in the given `RotationOrder`.
fn euler(order: i64, [x, y, z]: [f32; 3]) -> Matrix4<f32> {
    let (rx, ry, rz) = (
        Matrix4::from_angle_x(Deg(x)),
        Matrix4::from_angle_y(Deg(y)),
        Matrix4::from_angle_z(Deg(z)),
    );
    match order {
        1 => ry * rz * rx,
        2 => rx * rz * ry,
        3 => rz * rx * ry,
        4 => ry * rx * rz,
        5 => rx * ry * rz,
        _ => rz * ry * rx,
    }
}

/// Static transform properties of a model.
#[derive(Clone, Copy)]
struct ModelTransform {
    translation: [f32; 3],
    rotation: [f32; 3],
    scaling: [f32; 3],
    pre_rotation: [f32; 3],
    post_rotation: [f32; 3],
    rotation_offset: [f32; 3],
    rotation_pivot: [f32; 3],
    scaling_offset: [f32; 3],
    scaling_pivot: [f32; 3],
    order: i64,
}

impl ModelTransform {
    fn from_record(record: &Record) -> Self {
        let props = properties70(record);
        let zero = |name: &str| prop_vec3(&props, name).unwrap_or([0.0; 3]);
        Self {
            translation: zero("Lcl Translation"),
            rotation: zero("Lcl Rotation"),
            scaling: prop_vec3(&props, "Lcl Scaling").unwrap_or([1.0; 3]),
            pre_rotation: zero("PreRotation"),
            post_rotation: zero("PostRotation"),
            rotation_offset: zero("RotationOffset"),
            rotation_pivot: zero("RotationPivot"),
            scaling_offset: zero("ScalingOffset"),
            scaling_pivot: zero("ScalingPivot"),
            order: props
                .get("RotationOrder")
                .and_then(|p| p.property(4))
                .and_then(Property::as_i64)
                .unwrap_or(0),
        }
    }

    /// `T * Roff * Rp * Rpre * R * Rpost^-1 * Rp^-1 * Soff * Sp * S * Sp^-1`
    fn matrix(&self) -> Matrix4<f32> {
        let t = |v: [f32; 3]| Matrix4::from_translation(Vector3::from(v));
        let inv_t = |v: [f32; 3]| Matrix4::from_translation(-Vector3::from(v));
        let post = euler(0, self.post_rotation).invert().unwrap_or_else(Matrix4::identity);
        t(self.translation)
            * t(self.rotation_offset)
            * t(self.rotation_pivot)
            * euler(0, self.pre_rotation)
            * euler(self.order, self.rotation)
            * post
            * inv_t(self.rotation_pivot)
            * t(self.scaling_offset)
            * t(self.scaling_pivot)
            * Matrix4::from_nonuniform_scale(self.scaling[0], self.scaling[1], self.scaling[2])
            * inv_t(self.scaling_pivot)
    }
}

/// Builds the document from a parsed record tree.
pub fn build(file: &FbxFile) -> anyhow::Result<FbxDocument> {
    if file.version < FIRST_SUPPORTED_VERSION {
        bail!(ImportError::UnsupportedFormat(format!(
            "FBX version {} is older than 7.0",
            file.version
        )));
    }
    let graph = Graph::new(file)?;
    let mut builder = Builder {
        graph: &graph,
        document: FbxDocument::default(),
        material_by_id: HashMap::new(),
        default_material: None,
        model_transforms: HashMap::new(),
        node_by_model: HashMap::new(),
    };
    builder.document.nodes.push(FbxNode {
        name: "RootNode".to_string(),
        ..Default::default()
    });
    let mut visited = HashSet::new();
    builder.add_children(0, 0, &mut visited);
    builder.add_animations();
    Ok(builder.document)
}

struct Builder<'g, 'a> {
    graph: &'g Graph<'a>,
    document: FbxDocument,
    material_by_id: HashMap<i64, usize>,
    default_material: Option<usize>,
    model_transforms: HashMap<i64, ModelTransform>,
    node_by_model: HashMap<i64, usize>,
}

impl Builder<'_, '_> {
    fn add_children(&mut self, parent_id: i64, parent_node: usize, visited: &mut HashSet<i64>) {
        for (id, record, _) in self.graph.children(parent_id, "Model") {
            if !visited.insert(id) {
                log::warn!("FBX model {} is connected twice, ignoring the cycle", object_name(record));
                continue;
            }
            let transform = ModelTransform::from_record(record);
            self.model_transforms.insert(id, transform);
            let node = self.document.nodes.len();
            self.document.nodes.push(FbxNode {
                name: object_name(record),
                transform: transform.matrix().into(),
                ..Default::default()
            });
            self.document.nodes[parent_node].children.push(node);
            self.node_by_model.insert(id, node);

            let materials: Vec<usize> = self
                .graph
                .children(id, "Material")
                .into_iter()
                .map(|(material_id, material, _)| self.material(material_id, material))
                .collect();
            for (geometry_id, geometry, _) in self.graph.children(id, "Geometry") {
                if object_class(geometry) != "Mesh" {
                    continue;
                }
                match self.meshes(geometry_id, geometry, &materials) {
                    Ok(meshes) => {
                        for mesh in meshes {
                            self.document.meshes.push(mesh);
                            self.document.nodes[node].meshes.push(self.document.meshes.len() - 1);
                        }
                    }
                    Err(e) => log::warn!("FBX geometry {} is skipped: {e:#}", object_name(geometry)),
                }
            }
            self.add_children(id, node, visited);
        }
    }

    fn fallback_material(&mut self) -> usize {
        *self.default_material.get_or_insert_with(|| {
            self.document.materials.push(FbxMaterial {
                name: "default".to_string(),
                diffuse: [1.0; 4],
                ..Default::default()
            });
            self.document.materials.len() - 1
        })
    }

    fn material(&mut self, id: i64, record: &Record) -> usize {
        if let Some(&idx) = self.material_by_id.get(&id) {
            return idx;
        }
        let props = properties70(record);
        let diffuse = prop_vec3(&props, "DiffuseColor")
            .or_else(|| prop_vec3(&props, "Diffuse"))
            .unwrap_or([1.0; 3]);
        let mut material = FbxMaterial {
            name: object_name(record),
            diffuse: [
                diffuse[0],
                diffuse[1],
                diffuse[2],
                prop_f32(&props, "Opacity").unwrap_or(1.0),
            ],
            base_factor: prop_f32(&props, "DiffuseFactor"),
            metallic: None,
            roughness: None,
            emissive: prop_vec3(&props, "EmissiveColor")
                .or_else(|| prop_vec3(&props, "Emissive"))
                .unwrap_or([0.0; 3]),
            emissive_strength: prop_f32(&props, "EmissiveFactor"),
            textures: Default::default(),
        };
        for (texture_id, texture, property) in self.graph.children(id, "Texture") {
            let Some(slot) = property.and_then(texture_slot) else {
                continue;
            };
            if material.textures[slot as usize].is_none() {
                material.textures[slot as usize] = self.texture_source(texture_id, texture);
            }
        }
        self.document.materials.push(material);
        let idx = self.document.materials.len() - 1;
        self.material_by_id.insert(id, idx);
        idx
    }

    fn texture_source(&self, id: i64, texture: &Record) -> Option<FbxTextureSource> {
        let file_name = ["RelativeFilename", "FileName"]
            .iter()
            .filter_map(|name| texture.child(name)?.property(0)?.as_str())
            .find(|name| !name.is_empty())?
            .replace('\\', "/");
        let embedded = self.graph.children(id, "Video").into_iter().find_map(|(_, video, _)| {
            match video.child("Content")?.property(0)? {
                Property::Raw(bytes) if !bytes.is_empty() => Some(bytes.clone()),
                _ => None,
            }
        });
        Some(match embedded {
            Some(bytes) => FbxTextureSource::Embedded { name: file_name, bytes },
            None => FbxTextureSource::File(file_name.into()),
        })
    }

    /// One mesh per material used by the geometry's polygons.
    fn meshes(&mut self, id: i64, geometry: &Record, materials: &[usize]) -> anyhow::Result<Vec<FbxMesh>> {
        let name = object_name(geometry);
        let control_points = array_f64(geometry, "Vertices")
            .ok_or_else(|| ImportError::MissingRequiredField(format!("vertices of {name}")))?;
        let polygon_vertices = array_i64(geometry, "PolygonVertexIndex")
            .ok_or_else(|| ImportError::MissingRequiredField(format!("polygons of {name}")))?;
        let cp_count = control_points.len() / 3;

        // polygons as (first polygon vertex, control points)
        let mut polygons: Vec<(usize, Vec<usize>)> = Vec::new();
        let mut current = Vec::new();
        let mut start = 0;
        for (pv, &raw) in polygon_vertices.iter().enumerate() {
            let (cp, last) = if raw < 0 { (!raw, true) } else { (raw, false) };
            let cp = usize::try_from(cp).ok().filter(|&cp| cp < cp_count).with_context(|| {
                format!("control point {cp} of {name} out of range ({cp_count} points)")
            })?;
            current.push(cp);
            if last {
                polygons.push((start, std::mem::take(&mut current)));
                start = pv + 1;
            }
        }

        let normals = layer(geometry, "LayerElementNormal", "Normals", "NormalsIndex", 3);
        let tangents = layer(geometry, "LayerElementTangent", "Tangents", "TangentsIndex", 3);
        let uvs = layer(geometry, "LayerElementUV", "UV", "UVIndex", 2);
        let colors = layer(geometry, "LayerElementColor", "Colors", "ColorIndex", 4);
        let polygon_materials = polygon_material_indices(geometry, polygons.len());

        let mut buckets: Vec<(usize, Bucket)> = Vec::new();
        for (polygon, (first_pv, cps)) in polygons.iter().enumerate() {
            let local = polygon_materials.get(polygon).copied().unwrap_or(0);
            let material = match materials.get(local) {
                Some(&m) => m,
                None => self.fallback_material(),
            };
            let bucket = match buckets.iter().position(|(m, _)| *m == material) {
                Some(b) => b,
                None => {
                    buckets.push((material, Bucket::default()));
                    buckets.len() - 1
                }
            };
            let bucket = &mut buckets[bucket].1;
            let mut face = Vec::with_capacity(cps.len());
            for (corner, &cp) in cps.iter().enumerate() {
                let at = Lookup {
                    polygon_vertex: first_pv + corner,
                    control_point: cp,
                    polygon,
                };
                face.push(bucket.control_points.len() as u32);
                bucket.control_points.push(cp);
                bucket.positions.push([
                    control_points[cp * 3] as f32,
                    control_points[cp * 3 + 1] as f32,
                    control_points[cp * 3 + 2] as f32,
                ]);
                bucket.normals.push(normals.as_ref().and_then(|l| l.get3(at)));
                bucket.tangents.push(tangents.as_ref().and_then(|l| l.get3(at)));
                bucket.uvs.push(uvs.as_ref().and_then(|l| l.get(at).map(|v| [v[0], v[1]])));
                bucket.colors.push(colors.as_ref().and_then(|l| l.get(at).map(|v| [v[0], v[1], v[2], v[3]])));
            }
            bucket.faces.push(face);
        }

        let clusters = self.clusters(id);
        Ok(buckets
            .into_iter()
            .map(|(material, bucket)| bucket.into_mesh(&name, material, &clusters))
            .collect())
    }

    /// `(bone name, offset, control point weights)` of every skin cluster.
    fn clusters(&self, geometry: i64) -> Vec<(String, [[f32; 4]; 4], Vec<(usize, f32)>)> {
        let mut out = Vec::new();
        for (skin_id, skin, _) in self.graph.children(geometry, "Deformer") {
            if object_class(skin) != "Skin" {
                continue;
            }
            for (cluster_id, cluster, _) in self.graph.children(skin_id, "Deformer") {
                let Some((_, bone, _)) = self.graph.children(cluster_id, "Model").into_iter().next() else {
                    continue;
                };
                let indexes = array_i64(cluster, "Indexes").unwrap_or_default();
                let weights = array_f64(cluster, "Weights").unwrap_or_default();
                let link = matrix(cluster, "TransformLink")
                    .map(Matrix4::from)
                    .and_then(|m| m.invert())
                    .unwrap_or_else(Matrix4::identity);
                let mesh = matrix(cluster, "Transform").map(Matrix4::from).unwrap_or_else(Matrix4::identity);
                let influences = indexes
                    .iter()
                    .zip(&weights)
                    .filter_map(|(&cp, &w)| Some((usize::try_from(cp).ok()?, w as f32)))
                    .collect();
                out.push((object_name(bone), (link * mesh).into(), influences));
            }
        }
        out
    }

    fn add_animations(&mut self) {
        let stacks: Vec<(i64, String)> = self
            .graph
            .objects
            .iter()
            .filter(|(_, record)| record.name == "AnimationStack")
            .map(|(&id, record)| (id, object_name(record)))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for (stack, name) in stacks {
            let layers = self.graph.children(stack, "AnimationLayer");
            if layers.len() > 1 {
                log::warn!("Animation {name} has {} layers, only the first is read", layers.len());
            }
            let Some(&(layer_id, _, _)) = layers.first() else {
                continue;
            };
            let tracks = self.tracks(layer_id);
            self.document.animations.push(FbxAnimation { name, tracks });
        }
    }

    /// One track per animated model, evaluated at every key time of its curves.
    fn tracks(&self, layer: i64) -> Vec<FbxTrack> {
        let mut by_model: Vec<(i64, Vec<(String, [Option<Curve>; 3], [Option<f32>; 3])>)> = Vec::new();
        for (curve_node_id, curve_node, _) in self.graph.children(layer, "AnimationCurveNode") {
            for (model, _, property) in self.graph.parents(curve_node_id, "Model") {
                let Some(property) = property else { continue };
                let defaults = properties70(curve_node);
                let mut curves: [Option<Curve>; 3] = Default::default();
                for (_, curve, axis) in self.graph.children(curve_node_id, "AnimationCurve") {
                    let slot = match axis {
                        Some("d|X") => 0,
                        Some("d|Y") => 1,
                        Some("d|Z") => 2,
                        _ => continue,
                    };
                    curves[slot] = Curve::from_record(curve);
                }
                let fallback = [
                    prop_f32(&defaults, "d|X"),
                    prop_f32(&defaults, "d|Y"),
                    prop_f32(&defaults, "d|Z"),
                ];
                let entry = match by_model.iter().position(|(m, _)| *m == model) {
                    Some(i) => i,
                    None => {
                        by_model.push((model, Vec::new()));
                        by_model.len() - 1
                    }
                };
                by_model[entry].1.push((property.to_string(), curves, fallback));
            }
        }

        let mut tracks = Vec::new();
        for (model, channels) in by_model {
            let (Some(&rest), Some(&node)) = (self.model_transforms.get(&model), self.node_by_model.get(&model))
            else {
                continue;
            };
            let times: BTreeSet<i64> = channels
                .iter()
                .flat_map(|(_, curves, _)| curves.iter().flatten())
                .flat_map(|curve| curve.times.iter().copied())
                .collect();
            if times.is_empty() {
                continue;
            }
            let mut track = FbxTrack {
                node: self.document.nodes[node].name.clone(),
                ..Default::default()
            };
            for &tick in &times {
                let mut pose = rest;
                for (property, curves, fallback) in &channels {
                    let target = match property.as_str() {
                        "Lcl Translation" => &mut pose.translation,
                        "Lcl Rotation" => &mut pose.rotation,
                        "Lcl Scaling" => &mut pose.scaling,
                        _ => continue,
                    };
                    for axis in 0..3 {
                        if let Some(value) = curves[axis].as_ref().map(|c| c.sample(tick)).or(fallback[axis]) {
                            target[axis] = value;
                        }
                    }
                }
                let local = Transform::from_matrix(pose.matrix());
                let time = (tick as f64 / TICKS_PER_SECOND) as f32;
                track.translations.push((time, local.position.into()));
                track.rotations.push((time, local.rotation_xyzw()));
                track.scales.push((time, local.scale.into()));
            }
            tracks.push(track);
        }
        tracks
    }
}

fn texture_slot(property: &str) -> Option<TextureSlot> {
    match property {
        "DiffuseColor" | "Maya|baseColor" | "Maya|TEX_color_map" => Some(TextureSlot::Diffuse),
        "NormalMap" | "Bump" | "Maya|normalCamera" | "Maya|TEX_normal_map" => Some(TextureSlot::Normal),
        "ShininessExponent" | "Maya|specularRoughness" | "Maya|TEX_roughness_map" => Some(TextureSlot::Roughness),
        "ReflectionFactor" | "Maya|metalness" | "Maya|TEX_metallic_map" => Some(TextureSlot::Metallic),
        "EmissiveColor" | "EmissiveFactor" | "Maya|emissionColor" | "Maya|TEX_emissive_map" => {
            Some(TextureSlot::Emissive)
        }
        _ => None,
    }
}

/// Material index per polygon, relative to the model's material list.
fn polygon_material_indices(geometry: &Record, polygons: usize) -> Vec<usize> {
    let Some(element) = geometry.child("LayerElementMaterial") else {
        return vec![0; polygons];
    };
    let indices: Vec<usize> = array_i64(element, "Materials")
        .unwrap_or_default()
        .into_iter()
        .map(|i| usize::try_from(i).unwrap_or(0))
        .collect();
    match mapping(element).as_str() {
        "ByPolygon" if indices.len() >= polygons => indices,
        _ => vec![indices.first().copied().unwrap_or(0); polygons],
    }
}

fn mapping(element: &Record) -> String {
    element
        .child("MappingInformationType")
        .and_then(|r| r.property(0))
        .and_then(Property::as_str)
        .unwrap_or_default()
        .to_string()
}

#[derive(Clone, Copy)]
struct Lookup {
    polygon_vertex: usize,
    control_point: usize,
    polygon: usize,
}

/// A per-vertex attribute layer with its mapping resolved.
struct Layer {
    values: Vec<f64>,
    indices: Option<Vec<i64>>,
    mapping: String,
    width: usize,
}

fn layer(geometry: &Record, element: &str, data: &str, index: &str, width: usize) -> Option<Layer> {
    let element = geometry.child(element)?;
    let reference = element
        .child("ReferenceInformationType")
        .and_then(|r| r.property(0))
        .and_then(Property::as_str)
        .unwrap_or("Direct");
    let indices = match reference {
        "IndexToDirect" | "Index" => Some(array_i64(element, index)?),
        _ => None,
    };
    Some(Layer {
        values: array_f64(element, data)?,
        indices,
        mapping: mapping(element),
        width,
    })
}

impl Layer {
    fn get(&self, at: Lookup) -> Option<Vec<f32>> {
        let slot = match self.mapping.as_str() {
            "ByPolygonVertex" => at.polygon_vertex,
            "ByVertice" | "ByVertex" | "ByControlPoint" => at.control_point,
            "ByPolygon" => at.polygon,
            "AllSame" => 0,
            _ => return None,
        };
        let slot = match &self.indices {
            Some(indices) => usize::try_from(*indices.get(slot)?).ok()?,
            None => slot,
        };
        let values = self.values.get(slot * self.width..(slot + 1) * self.width)?;
        Some(values.iter().map(|&v| v as f32).collect())
    }

    fn get3(&self, at: Lookup) -> Option<[f32; 3]> {
        self.get(at).map(|v| [v[0], v[1], v[2]])
    }
}

/// Unrolled polygon vertices of one material.
#[derive(Default)]
struct Bucket {
    control_points: Vec<usize>,
    positions: Vec<[f32; 3]>,
    normals: Vec<Option<[f32; 3]>>,
    tangents: Vec<Option<[f32; 3]>>,
    uvs: Vec<Option<[f32; 2]>>,
    colors: Vec<Option<[f32; 4]>>,
    faces: Vec<Vec<u32>>,
}

/// A stream is kept only when every vertex has a value.
fn complete<T>(stream: Vec<Option<T>>) -> Option<Vec<T>> {
    stream.into_iter().collect()
}

impl Bucket {
    fn into_mesh(
        self,
        name: &str,
        material: usize,
        clusters: &[(String, [[f32; 4]; 4], Vec<(usize, f32)>)],
    ) -> FbxMesh {
        let mut vertices_of: HashMap<usize, Vec<u32>> = HashMap::new();
        for (vertex, &cp) in self.control_points.iter().enumerate() {
            vertices_of.entry(cp).or_default().push(vertex as u32);
        }
        let bones = clusters
            .iter()
            .map(|(bone, offset, influences)| FbxBone {
                name: bone.clone(),
                offset: *offset,
                weights: influences
                    .iter()
                    .flat_map(|&(cp, w)| {
                        vertices_of
                            .get(&cp)
                            .into_iter()
                            .flatten()
                            .map(move |&vertex| (vertex, w))
                    })
                    .collect(),
            })
            .filter(|bone| !bone.weights.is_empty())
            .collect();
        FbxMesh {
            name: name.to_string(),
            positions: self.positions,
            normals: complete(self.normals),
            tangents: complete(self.tangents),
            uvs: complete(self.uvs),
            colors: complete(self.colors),
            faces: self.faces,
            bones,
            material,
        }
    }
}

/// One animation curve, linearly interpolated between keys.
struct Curve {
    times: Vec<i64>,
    values: Vec<f32>,
}

impl Curve {
    fn from_record(record: &Record) -> Option<Self> {
        let times = array_i64(record, "KeyTime")?;
        let values: Vec<f32> = array_f64(record, "KeyValueFloat")?.into_iter().map(|v| v as f32).collect();
        (!times.is_empty() && times.len() == values.len()).then_some(Self { times, values })
    }

    fn sample(&self, tick: i64) -> f32 {
        let upper = self.times.partition_point(|&t| t <= tick);
        if upper == 0 {
            return self.values[0];
        }
        if upper == self.times.len() {
            return self.values[upper - 1];
        }
        let (t0, t1) = (self.times[upper - 1], self.times[upper]);
        let f = ((tick - t0) as f64 / (t1 - t0) as f64) as f32;
        self.values[upper - 1] + (self.values[upper] - self.values[upper - 1]) * f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string(s: &str) -> Property {
        Property::String(s.to_string())
    }

    fn object(kind: &str, id: i64, name: &str, class: &str, children: Vec<Record>) -> Record {
        Record {
            name: kind.to_string(),
            properties: vec![Property::I64(id), string(&format!("{name}\u{0}\u{1}{kind}")), string(class)],
            children,
        }
    }

    fn leaf(name: &str, properties: Vec<Property>) -> Record {
        Record {
            name: name.to_string(),
            properties,
            children: Vec::new(),
        }
    }

    fn p70(entries: Vec<(&str, Vec<f64>)>) -> Record {
        Record {
            name: "Properties70".to_string(),
            properties: Vec::new(),
            children: entries
                .into_iter()
                .map(|(name, values)| {
                    let mut properties = vec![string(name), string(""), string(""), string("A")];
                    properties.extend(values.into_iter().map(Property::F64));
                    leaf("P", properties)
                })
                .collect(),
        }
    }

    fn connect(child: i64, parent: i64, property: Option<&str>) -> Record {
        let mut properties = vec![
            string(if property.is_some() { "OP" } else { "OO" }),
            Property::I64(child),
            Property::I64(parent),
        ];
        properties.extend(property.map(string));
        leaf("C", properties)
    }

    /// A single quad with per-polygon-vertex normals, a material, a bone and
    /// one animated translation curve.
    fn quad_file() -> FbxFile {
        let geometry = object(
            "Geometry",
            10,
            "QuadGeo",
            "Mesh",
            vec![
                leaf(
                    "Vertices",
                    vec![Property::F64Array(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0])],
                ),
                leaf("PolygonVertexIndex", vec![Property::I32Array(vec![0, 1, 2, !3])]),
                Record {
                    name: "LayerElementNormal".to_string(),
                    properties: vec![Property::I32(0)],
                    children: vec![
                        leaf("MappingInformationType", vec![string("ByPolygonVertex")]),
                        leaf("ReferenceInformationType", vec![string("Direct")]),
                        leaf("Normals", vec![Property::F64Array([0.0, 1.0, 0.0].repeat(4))]),
                    ],
                },
            ],
        );
        let objects = Record {
            name: "Objects".to_string(),
            properties: Vec::new(),
            children: vec![
                object(
                    "Model",
                    1,
                    "Quad",
                    "Mesh",
                    vec![p70(vec![
                        ("Lcl Translation", vec![100.0, 0.0, 0.0]),
                        ("Lcl Rotation", vec![0.0, 90.0, 0.0]),
                    ])],
                ),
                object("Model", 2, "Bone", "LimbNode", vec![p70(vec![])]),
                geometry,
                object(
                    "Material",
                    20,
                    "Red",
                    "",
                    vec![p70(vec![("DiffuseColor", vec![1.0, 0.0, 0.0]), ("DiffuseFactor", vec![0.5])])],
                ),
                object(
                    "Texture",
                    30,
                    "Tex",
                    "",
                    vec![leaf("RelativeFilename", vec![string("textures\\red.png")])],
                ),
                object("Deformer", 40, "Skin", "Skin", Vec::new()),
                object(
                    "Deformer",
                    41,
                    "Cluster",
                    "Cluster",
                    vec![
                        leaf("Indexes", vec![Property::I32Array(vec![0, 3])]),
                        leaf("Weights", vec![Property::F64Array(vec![1.0, 0.5])]),
                    ],
                ),
                object("AnimationStack", 50, "Wave", "", Vec::new()),
                object("AnimationLayer", 51, "Base", "", Vec::new()),
                object(
                    "AnimationCurveNode",
                    52,
                    "T",
                    "",
                    vec![p70(vec![("d|X", vec![0.0]), ("d|Y", vec![0.0]), ("d|Z", vec![0.0])])],
                ),
                object(
                    "AnimationCurve",
                    53,
                    "",
                    "",
                    vec![
                        leaf("KeyTime", vec![Property::I64Array(vec![0, 46_186_158_000])]),
                        leaf("KeyValueFloat", vec![Property::F32Array(vec![0.0, 50.0])]),
                    ],
                ),
            ],
        };
        let connections = Record {
            name: "Connections".to_string(),
            properties: Vec::new(),
            children: vec![
                connect(1, 0, None),
                connect(2, 1, None),
                connect(10, 1, None),
                connect(20, 1, None),
                connect(30, 20, Some("DiffuseColor")),
                connect(40, 10, None),
                connect(41, 40, None),
                connect(2, 41, None),
                connect(51, 50, None),
                connect(52, 51, None),
                connect(52, 2, Some("Lcl Translation")),
                connect(53, 52, Some("d|Y")),
            ],
        };
        FbxFile {
            version: 7400,
            records: vec![objects, connections],
        }
    }

    #[test]
    fn models_become_a_node_tree() {
        let doc = build(&quad_file()).expect("build");
        let names: Vec<&str> = doc.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["RootNode", "Quad", "Bone"]);
        assert_eq!(doc.nodes[0].children, vec![1]);
        assert_eq!(doc.nodes[1].children, vec![2]);
        assert_eq!(doc.nodes[1].meshes, vec![0]);

        let quad = Transform::from_matrix(Matrix4::from(doc.nodes[1].transform));
        assert!((quad.position.x - 100.0).abs() < 1e-4);
        // 90 degrees about y maps +x to -z
        let x = quad.to_matrix() * cgmath::Vector4::new(1.0, 0.0, 0.0, 0.0);
        assert!((x.z + 1.0).abs() < 1e-5);
    }

    #[test]
    fn polygons_are_unrolled_per_vertex() {
        let doc = build(&quad_file()).expect("build");
        let mesh = &doc.meshes[0];
        assert_eq!(mesh.faces, vec![vec![0, 1, 2, 3]]);
        assert_eq!(mesh.positions[3], [0.0, 0.0, 1.0]);
        assert_eq!(mesh.normals.as_ref().map(Vec::len), Some(4));
        assert!(mesh.uvs.is_none());
    }

    #[test]
    fn materials_and_textures_are_linked() {
        let doc = build(&quad_file()).expect("build");
        let material = &doc.materials[doc.meshes[0].material];
        assert_eq!(material.name, "Red");
        assert_eq!(material.diffuse, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(material.base_factor, Some(0.5));
        match &material.textures[TextureSlot::Diffuse as usize] {
            Some(FbxTextureSource::File(path)) => assert_eq!(path, Path::new("textures/red.png")),
            other => panic!("unexpected diffuse texture {other:?}"),
        }
    }

    #[test]
    fn clusters_weight_the_unrolled_vertices() {
        let doc = build(&quad_file()).expect("build");
        let bones = &doc.meshes[0].bones;
        assert_eq!(bones.len(), 1);
        assert_eq!(bones[0].name, "Bone");
        assert_eq!(bones[0].weights, vec![(0, 1.0), (3, 0.5)]);
    }

    #[test]
    fn curves_become_keyed_tracks_in_seconds() {
        let doc = build(&quad_file()).expect("build");
        let animation = &doc.animations[0];
        assert_eq!(animation.name, "Wave");
        let track = &animation.tracks[0];
        assert_eq!(track.node, "Bone");
        let times: Vec<f32> = track.translations.iter().map(|k| k.0).collect();
        assert_eq!(times, vec![0.0, 1.0]);
        assert!((track.translations[1].1[1] - 50.0).abs() < 1e-4);
        assert_eq!(track.rotations.len(), 2);
    }

    #[test]
    fn missing_material_uses_a_default() {
        let mut file = quad_file();
        file.records[1].children.retain(|c| c.properties.get(1) != Some(&Property::I64(20)));
        let doc = build(&file).expect("build");
        assert_eq!(doc.materials[doc.meshes[0].material].name, "default");
    }

    #[test]
    fn old_versions_are_rejected() {
        let mut file = quad_file();
        file.version = 6100;
        let err = build(&file).expect_err("6.1");
        assert!(matches!(crate::error::kind(&err), Some(ImportError::UnsupportedFormat(_))));
    }

    #[test]
    fn curves_interpolate_linearly() {
        let curve = Curve {
            times: vec![0, 10, 20],
            values: vec![0.0, 1.0, 3.0],
        };
        assert_eq!(curve.sample(-5), 0.0);
        assert_eq!(curve.sample(5), 0.5);
        assert_eq!(curve.sample(15), 2.0);
        assert_eq!(curve.sample(30), 3.0);
    }
}
