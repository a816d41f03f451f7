mod common;

use std::sync::PoisonError;

use common::test_utils::{GltfBuilder, cube_geometry, loader, temp_dir};
use flow_import::{
    Scene,
    data_structures::{
        animation::{AnimationComponent, Channel, Path},
        instance::InstanceTag,
        material::{MaterialFeatures, MaterialKind},
        model::MeshComponent,
        skeleton::NO_PARENT,
    },
    gpu::BufferUsage,
};
use serde_json::{Value, json};

/// A cube skinned to one joint "Bone" that walks one unit along +x in one second.
fn walking_cube() -> (GltfBuilder, Value) {
    let mut builder = GltfBuilder::new();
    let (positions, normals, uvs, indices) = cube_geometry();
    let vertex_count = positions.len() / 3;
    let position = builder.bounded_floats(&positions, "VEC3");
    let normal = builder.floats(&normals, "VEC3");
    let uv = builder.floats(&uvs, "VEC2");
    let index = builder.indices(&indices);
    let joints = builder.u16s(&vec![0u16; vertex_count * 4], "VEC4");
    let weights: Vec<f32> = (0..vertex_count).flat_map(|_| [0.5, 0.25, 0.0, 0.0]).collect();
    let weights = builder.floats(&weights, "VEC4");
    let identity: [f32; 16] = [
        1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0,
    ];
    let inverse_bind = builder.floats(&identity, "MAT4");
    let times = builder.bounded_floats(&[0.0, 1.0], "SCALAR");
    let translations = builder.floats(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0], "VEC3");
    let root = json!({
        "scene": 0,
        "scenes": [{ "name": "Scene", "nodes": [0, 1] }],
        "nodes": [
            { "name": "Body", "mesh": 0, "skin": 0 },
            { "name": "Bone" }
        ],
        "meshes": [{
            "name": "Body",
            "primitives": [{
                "attributes": {
                    "POSITION": position,
                    "NORMAL": normal,
                    "TEXCOORD_0": uv,
                    "JOINTS_0": joints,
                    "WEIGHTS_0": weights
                },
                "indices": index,
                "material": 0
            }]
        }],
        "materials": [{ "name": "Skin" }],
        "skins": [{ "name": "Armature", "joints": [1], "inverseBindMatrices": inverse_bind }],
        "animations": [{
            "name": "Walk",
            "samplers": [{ "input": times, "output": translations, "interpolation": "LINEAR" }],
            "channels": [{ "sampler": 0, "target": { "node": 1, "path": "translation" } }]
        }]
    });
    (builder, root)
}

fn translation_x(bytes: &[u8]) -> f32 {
    let matrix: [[f32; 4]; 4] = bytemuck::pod_read_unaligned(&bytes[..64]);
    matrix[3][0]
}

#[test]
fn walk_animation_is_translated() {
    let dir = temp_dir("walk");
    let (builder, root) = walking_cube();
    let path = builder.write_gltf(dir.path(), "walk", root);
    let (loader, backend) = loader();
    let mut scene = Scene::new();

    let loaded = loader.try_load(&mut scene, &path, 2, None).expect("load");

    let animation = loaded.animation.expect("skeletal animation");
    let skeletal = animation.lock().unwrap_or_else(PoisonError::into_inner);
    assert_eq!(skeletal.skeleton.len(), 1);
    assert_eq!(skeletal.skeleton.joints[0].name, "Bone");
    assert_eq!(skeletal.skeleton.joints[0].parent, NO_PARENT);
    assert_eq!(skeletal.animations.len(), 1);
    let walk = &skeletal.animations[0];
    assert_eq!(walk.name, "Walk");
    assert_eq!(walk.first_key_time, 0.0);
    assert_eq!(walk.last_key_time, 1.0);
    assert_eq!(
        walk.channels,
        vec![Channel {
            sampler: 0,
            joint: 0,
            path: Path::Translation
        }]
    );

    let joint_buffer = skeletal.skeleton.buffer.expect("joint buffer");
    assert_eq!(backend.buffer_usage(joint_buffer), Some(BufferUsage::Storage));
    assert_eq!(backend.buffer_contents(joint_buffer).map(|b| b.len()), Some(64));
}

#[test]
fn skinned_model_binds_the_joint_buffer() {
    let dir = temp_dir("skinned");
    let (builder, root) = walking_cube();
    let path = builder.write_gltf(dir.path(), "walk", root);
    let (loader, backend) = loader();
    let mut scene = Scene::new();

    let loaded = loader.try_load(&mut scene, &path, 2, None).expect("load");

    let meshes = scene.registry.with::<MeshComponent>();
    assert_eq!(meshes.len(), 1);
    let body = meshes[0];
    assert!(scene.registry.get::<AnimationComponent>(body).is_some());
    // the second instance shares the pose through the instance tag
    assert_eq!(scene.registry.with::<AnimationComponent>().len(), 1);
    let tag = scene.registry.get::<InstanceTag>(body).expect("instance tag");
    let joint_buffer = loaded
        .animation
        .as_ref()
        .and_then(|a| a.lock().unwrap_or_else(PoisonError::into_inner).skeleton.buffer)
        .expect("joint buffer");

    let model = &loaded.models[0];
    let resources = model.data.submeshes[0].resources.expect("resources");
    assert_eq!(backend.descriptor_buffers(resources), Some(vec![tag.buffer, joint_buffer]));
    for vertex in &model.data.vertices {
        let sum: f32 = vertex.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!((vertex.weights[0] - 2.0 / 3.0).abs() < 1e-5);
    }
    let material = model.data.materials[0].descriptor.expect("descriptor");
    assert_eq!(
        backend.material_kind(material),
        Some(MaterialKind::PbrSkinned(MaterialFeatures::HAS_SKELETAL_ANIMATION))
    );
}

#[test]
fn evaluating_writes_the_pose() {
    let dir = temp_dir("evaluate");
    let (builder, root) = walking_cube();
    let path = builder.write_gltf(dir.path(), "walk", root);
    let (loader, backend) = loader();
    let mut scene = Scene::new();

    let loaded = loader.try_load(&mut scene, &path, 1, None).expect("load");
    let animation = loaded.animation.expect("skeletal animation");
    let mut skeletal = animation.lock().unwrap_or_else(PoisonError::into_inner);
    let joint_buffer = skeletal.skeleton.buffer.expect("joint buffer");

    let rest = backend.buffer_contents(joint_buffer).expect("contents");
    assert_eq!(translation_x(&rest), 0.0);

    skeletal.evaluate(0, 0.5, backend.as_ref()).expect("evaluate");
    let posed = backend.buffer_contents(joint_buffer).expect("contents");
    assert!((translation_x(&posed) - 0.5).abs() < 1e-5);

    // wraps around the one second clip
    skeletal.evaluate(0, 1.25, backend.as_ref()).expect("evaluate");
    let wrapped = backend.buffer_contents(joint_buffer).expect("contents");
    assert!((translation_x(&wrapped) - 0.25).abs() < 1e-5);

    assert!(skeletal.evaluate(3, 0.0, backend.as_ref()).is_err());
}
