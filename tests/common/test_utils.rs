use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use flow_import::{Context, HeadlessBackend, ImportConfig, ModelLoader};
use serde_json::{Value, json};
use tempfile::TempDir;

/// A scratch directory removed on drop.
pub fn temp_dir(name: &str) -> TempDir {
    tempfile::Builder::new()
        .prefix(&format!("flow-import-{name}-"))
        .tempdir()
        .expect("create temp dir")
}

pub fn loader_with(config: ImportConfig) -> (ModelLoader, Arc<HeadlessBackend>) {
    flow_import::init_logging();
    let backend = Arc::new(HeadlessBackend::new());
    let ctx = Context::new(backend.clone(), config).expect("context");
    (ModelLoader::new(ctx), backend)
}

pub fn loader() -> (ModelLoader, Arc<HeadlessBackend>) {
    loader_with(ImportConfig {
        worker_threads: 2,
        grass_seed: Some(42),
        ..Default::default()
    })
}

/// Collects binary data, buffer views and accessors of a glTF under construction.
#[derive(Default)]
pub struct GltfBuilder {
    pub bin: Vec<u8>,
    views: Vec<Value>,
    accessors: Vec<Value>,
}

pub const FLOAT: u32 = 5126;
pub const UNSIGNED_SHORT: u32 = 5123;
pub const UNSIGNED_INT: u32 = 5125;
pub const BYTE: u32 = 5120;

fn components(ty: &str) -> usize {
    match ty {
        "SCALAR" => 1,
        "VEC2" => 2,
        "VEC3" => 3,
        "VEC4" => 4,
        "MAT4" => 16,
        other => panic!("unknown accessor type {other}"),
    }
}

impl GltfBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes as a buffer view plus an accessor over them.
    pub fn accessor(
        &mut self,
        bytes: &[u8],
        component_type: u32,
        count: usize,
        ty: &str,
        normalized: bool,
        bounds: Option<(Vec<f32>, Vec<f32>)>,
    ) -> usize {
        while self.bin.len() % 4 != 0 {
            self.bin.push(0);
        }
        let offset = self.bin.len();
        self.bin.extend_from_slice(bytes);
        self.views.push(json!({
            "buffer": 0,
            "byteOffset": offset,
            "byteLength": bytes.len(),
        }));
        let mut accessor = json!({
            "bufferView": self.views.len() - 1,
            "componentType": component_type,
            "count": count,
            "type": ty,
        });
        if normalized {
            accessor["normalized"] = json!(true);
        }
        if let Some((min, max)) = bounds {
            accessor["min"] = json!(min);
            accessor["max"] = json!(max);
        }
        self.accessors.push(accessor);
        self.accessors.len() - 1
    }

    pub fn floats(&mut self, data: &[f32], ty: &str) -> usize {
        let count = data.len() / components(ty);
        self.accessor(bytemuck::cast_slice(data), FLOAT, count, ty, false, None)
    }

    /// Float accessor with min/max, as required for positions and animation inputs.
    pub fn bounded_floats(&mut self, data: &[f32], ty: &str) -> usize {
        let n = components(ty);
        let mut min = vec![f32::MAX; n];
        let mut max = vec![f32::MIN; n];
        for chunk in data.chunks(n) {
            for (c, &v) in chunk.iter().enumerate() {
                min[c] = min[c].min(v);
                max[c] = max[c].max(v);
            }
        }
        self.accessor(
            bytemuck::cast_slice(data),
            FLOAT,
            data.len() / n,
            ty,
            false,
            Some((min, max)),
        )
    }

    pub fn indices(&mut self, data: &[u32]) -> usize {
        self.accessor(bytemuck::cast_slice(data), UNSIGNED_INT, data.len(), "SCALAR", false, None)
    }

    pub fn u16s(&mut self, data: &[u16], ty: &str) -> usize {
        let count = data.len() / components(ty);
        self.accessor(bytemuck::cast_slice(data), UNSIGNED_SHORT, count, ty, false, None)
    }

    /// Completes `root` with buffers, views and accessors. `uri` names the
    /// side-car `.bin`; `None` means the GLB binary chunk.
    pub fn finish(&self, mut root: Value, uri: Option<&str>) -> Value {
        let mut buffer = json!({ "byteLength": self.padded_bin().len() });
        if let Some(uri) = uri {
            buffer["uri"] = json!(uri);
        }
        root["asset"] = json!({ "version": "2.0" });
        root["buffers"] = json!([buffer]);
        root["bufferViews"] = json!(self.views);
        root["accessors"] = json!(self.accessors);
        root
    }

    pub fn padded_bin(&self) -> Vec<u8> {
        let mut bin = self.bin.clone();
        while bin.len() % 4 != 0 {
            bin.push(0);
        }
        bin
    }

    /// Writes `name.gltf` and `name.bin` into `dir`.
    pub fn write_gltf(&self, dir: &Path, name: &str, root: Value) -> PathBuf {
        let bin_name = format!("{name}.bin");
        let root = self.finish(root, Some(&bin_name));
        std::fs::write(dir.join(&bin_name), self.padded_bin()).expect("write bin");
        let path = dir.join(format!("{name}.gltf"));
        std::fs::write(&path, serde_json::to_vec_pretty(&root).expect("json")).expect("write gltf");
        path
    }

    /// Writes a single `name.glb` container into `dir`.
    pub fn write_glb(&self, dir: &Path, name: &str, root: Value) -> PathBuf {
        let root = self.finish(root, None);
        let mut json_chunk = serde_json::to_vec(&root).expect("json");
        while json_chunk.len() % 4 != 0 {
            json_chunk.push(b' ');
        }
        let bin_chunk = self.padded_bin();
        let total = 12 + 8 + json_chunk.len() + 8 + bin_chunk.len();
        let mut glb = Vec::with_capacity(total);
        glb.extend_from_slice(b"glTF");
        glb.extend_from_slice(&2u32.to_le_bytes());
        glb.extend_from_slice(&(total as u32).to_le_bytes());
        glb.extend_from_slice(&(json_chunk.len() as u32).to_le_bytes());
        glb.extend_from_slice(b"JSON");
        glb.extend_from_slice(&json_chunk);
        glb.extend_from_slice(&(bin_chunk.len() as u32).to_le_bytes());
        glb.extend_from_slice(b"BIN\0");
        glb.extend_from_slice(&bin_chunk);
        let path = dir.join(format!("{name}.glb"));
        std::fs::write(&path, glb).expect("write glb");
        path
    }
}

/// A unit cube with 4 vertices per face: 24 positions/normals/uvs and 36 indices.
pub fn cube_geometry() -> (Vec<f32>, Vec<f32>, Vec<f32>, Vec<u32>) {
    let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
        ([-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
        ([0.0, -1.0, 0.0], [0.0, 0.0, -1.0], [1.0, 0.0, 0.0]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
    ];
    let mut positions = Vec::new();
    let mut normals = Vec::new();
    let mut uvs = Vec::new();
    let mut indices = Vec::new();
    for (face, (n, u, v)) in faces.iter().enumerate() {
        let base = (face * 4) as u32;
        for (su, sv) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)] {
            for c in 0..3 {
                positions.push(n[c] * 0.5 + u[c] * su + v[c] * sv);
            }
            normals.extend_from_slice(n);
            uvs.extend_from_slice(&[su + 0.5, sv + 0.5]);
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (positions, normals, uvs, indices)
}

/// Builder and JSON of a glTF with one "Cube" mesh node and a red material.
pub fn cube_gltf() -> (GltfBuilder, Value) {
    let mut builder = GltfBuilder::new();
    let (positions, normals, uvs, indices) = cube_geometry();
    let position = builder.bounded_floats(&positions, "VEC3");
    let normal = builder.floats(&normals, "VEC3");
    let uv = builder.floats(&uvs, "VEC2");
    let index = builder.indices(&indices);
    let root = json!({
        "scene": 0,
        "scenes": [{ "name": "Scene", "nodes": [0] }],
        "nodes": [{ "name": "Cube", "mesh": 0, "translation": [1.0, 2.0, 3.0] }],
        "meshes": [{
            "name": "Cube",
            "primitives": [{
                "attributes": { "POSITION": position, "NORMAL": normal, "TEXCOORD_0": uv },
                "indices": index,
                "material": 0
            }]
        }],
        "materials": [{
            "name": "Red",
            "pbrMetallicRoughness": { "baseColorFactor": [1.0, 0.0, 0.0, 1.0] }
        }]
    });
    (builder, root)
}

pub fn write_png_gray(path: &Path, width: u32, height: u32, value: impl Fn(u32, u32) -> u8) {
    image::GrayImage::from_fn(width, height, |x, y| image::Luma([value(x, y)]))
        .save(path)
        .expect("write png");
}

pub fn write_png_rgba(path: &Path, width: u32, height: u32, rgba: [u8; 4]) {
    image::RgbaImage::from_pixel(width, height, image::Rgba(rgba))
        .save(path)
        .expect("write png");
}

/// A property of a binary FBX record.
pub enum FbxValue {
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    I32s(Vec<i32>),
    I64s(Vec<i64>),
    F64s(Vec<f64>),
    /// Stored zlib-compressed.
    PackedF64s(Vec<f64>),
}

/// A binary FBX record for writing test files.
pub struct FbxRecord {
    pub name: String,
    pub values: Vec<FbxValue>,
    pub children: Vec<FbxRecord>,
}

pub fn fbx_record(name: &str, values: Vec<FbxValue>, children: Vec<FbxRecord>) -> FbxRecord {
    FbxRecord {
        name: name.to_string(),
        values,
        children,
    }
}

pub fn fbx_str(s: &str) -> FbxValue {
    FbxValue::Str(s.to_string())
}

/// An object record: id, `name\0\x01Kind` and class.
pub fn fbx_object(kind: &str, id: i64, name: &str, class: &str, children: Vec<FbxRecord>) -> FbxRecord {
    fbx_record(
        kind,
        vec![
            FbxValue::I64(id),
            fbx_str(&format!("{name}\u{0}\u{1}{kind}")),
            fbx_str(class),
        ],
        children,
    )
}

/// A `Properties70` block of numeric `P` entries.
pub fn fbx_properties(entries: Vec<(&str, Vec<f64>)>) -> FbxRecord {
    let children = entries
        .into_iter()
        .map(|(name, values)| {
            let mut props = vec![fbx_str(name), fbx_str(""), fbx_str(""), fbx_str("A")];
            props.extend(values.into_iter().map(FbxValue::F64));
            fbx_record("P", props, Vec::new())
        })
        .collect();
    fbx_record("Properties70", Vec::new(), children)
}

/// `OO` connection, or `OP` when `property` is given.
pub fn fbx_connection(child: i64, parent: i64, property: Option<&str>) -> FbxRecord {
    let mut values = vec![
        fbx_str(if property.is_some() { "OP" } else { "OO" }),
        FbxValue::I64(child),
        FbxValue::I64(parent),
    ];
    values.extend(property.map(fbx_str));
    fbx_record("C", values, Vec::new())
}

fn fbx_array(out: &mut Vec<u8>, code: u8, count: usize, raw: Vec<u8>, packed: bool) {
    out.push(code);
    out.extend_from_slice(&(count as u32).to_le_bytes());
    let data = if packed {
        use std::io::Write;
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&raw).expect("compress");
        encoder.finish().expect("finish")
    } else {
        raw
    };
    out.extend_from_slice(&(packed as u32).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&data);
}

fn write_fbx_record(out: &mut Vec<u8>, record: &FbxRecord) {
    let start = out.len();
    out.extend_from_slice(&[0; 12]);
    out.push(record.name.len() as u8);
    out.extend_from_slice(record.name.as_bytes());
    let props_start = out.len();
    for value in &record.values {
        match value {
            FbxValue::I32(v) => {
                out.push(b'I');
                out.extend_from_slice(&v.to_le_bytes());
            }
            FbxValue::I64(v) => {
                out.push(b'L');
                out.extend_from_slice(&v.to_le_bytes());
            }
            FbxValue::F64(v) => {
                out.push(b'D');
                out.extend_from_slice(&v.to_le_bytes());
            }
            FbxValue::Str(s) => {
                out.push(b'S');
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            FbxValue::I32s(v) => {
                fbx_array(out, b'i', v.len(), v.iter().flat_map(|x| x.to_le_bytes()).collect(), false)
            }
            FbxValue::I64s(v) => {
                fbx_array(out, b'l', v.len(), v.iter().flat_map(|x| x.to_le_bytes()).collect(), false)
            }
            FbxValue::F64s(v) => {
                fbx_array(out, b'd', v.len(), v.iter().flat_map(|x| x.to_le_bytes()).collect(), false)
            }
            FbxValue::PackedF64s(v) => {
                fbx_array(out, b'd', v.len(), v.iter().flat_map(|x| x.to_le_bytes()).collect(), true)
            }
        }
    }
    let props_len = out.len() - props_start;
    for child in &record.children {
        write_fbx_record(out, child);
    }
    if !record.children.is_empty() {
        out.extend_from_slice(&[0; 13]);
    }
    let end = out.len() as u32;
    out[start..start + 4].copy_from_slice(&end.to_le_bytes());
    out[start + 4..start + 8].copy_from_slice(&(record.values.len() as u32).to_le_bytes());
    out[start + 8..start + 12].copy_from_slice(&(props_len as u32).to_le_bytes());
}

/// Writes a version 7400 binary FBX file into `dir`.
pub fn write_fbx(dir: &Path, name: &str, records: &[FbxRecord]) -> PathBuf {
    let mut out = b"Kaydara FBX Binary  \x00\x1a\x00".to_vec();
    out.extend_from_slice(&7400u32.to_le_bytes());
    for record in records {
        write_fbx_record(&mut out, record);
    }
    out.extend_from_slice(&[0; 13]);
    let path = dir.join(format!("{name}.fbx"));
    std::fs::write(&path, out).expect("write fbx");
    path
}
