mod common;

use common::test_utils::{cube_gltf, loader, temp_dir, write_png_gray, write_png_rgba};
use flow_import::{
    GrassSpec, ImportError, Scene, TerrainMaterial, TerrainSpec,
    data_structures::{
        instance::InstanceTag,
        material::MaterialFeatures,
        terrain::{GrassParams, GrassTag, TerrainComponent},
    },
    error,
    resources::scene::node_key,
};

#[test]
fn flat_heightmap_builds_a_grid() {
    let dir = temp_dir("terrain-flat");
    let heightmap = dir.path().join("height.png");
    write_png_gray(&heightmap, 4, 4, |_, _| 128);
    let (loader, backend) = loader();
    let mut scene = Scene::new();
    let spec = TerrainSpec {
        heightmap: heightmap.clone(),
        xz_scale: 2.0,
        y_scale: 10.0,
        translation: [5.0, 0.0, 5.0],
        ..Default::default()
    };

    let loaded = loader.load_terrain(&mut scene, 1, &spec).expect("terrain");

    assert_eq!(backend.stats().models_loaded, 1);
    let data = &loaded.terrain.models[0].data;
    assert_eq!(data.vertices.len(), 16);
    assert_eq!(data.indices.len(), 54);
    for vertex in &data.vertices {
        assert!((vertex.position[1] - 128.0 / 255.0).abs() < 1e-6);
        assert!((vertex.normal[1] - 1.0).abs() < 1e-5);
        assert_eq!(vertex.color, [0.0, 0.0, 128.0 / 765.0, 1.0]);
    }
    assert_eq!(data.materials[0].roughness, 1.0);

    let key = node_key("SL", &heightmap.to_string_lossy(), 0, "terrain", "terrain");
    let entity = scene.lookup(&key).expect("terrain entity");
    assert_eq!(loaded.entities, vec![entity]);
    let terrain = scene
        .registry
        .get::<TerrainComponent>(entity)
        .expect("terrain component");
    let expected = 128.0 / 255.0 * 10.0;
    assert!((terrain.height_at(7.0, 7.0).expect("inside") - expected).abs() < 1e-4);
    assert!(terrain.height_at(100.0, 0.0).is_none());

    let world = scene.world_matrix(entity);
    assert_eq!(world.x.x, 2.0);
    assert_eq!(world.y.y, 10.0);
    assert_eq!(world.w.x, 5.0);
}

#[test]
fn instances_share_the_terrain_model() {
    let dir = temp_dir("terrain-instances");
    let heightmap = dir.path().join("height.png");
    write_png_gray(&heightmap, 3, 3, |x, y| (x * 40 + y * 20) as u8);
    let (loader, backend) = loader();
    let mut scene = Scene::new();

    let loaded = loader
        .load_terrain(&mut scene, 2, &TerrainSpec {
            heightmap,
            ..Default::default()
        })
        .expect("terrain");

    assert_eq!(loaded.entities.len(), 2);
    assert_eq!(backend.stats().models_loaded, 1);
    assert_eq!(scene.registry.with::<TerrainComponent>().len(), 2);
}

#[test]
fn invalid_inputs_are_rejected() {
    let dir = temp_dir("terrain-invalid");
    let heightmap = dir.path().join("height.png");
    write_png_gray(&heightmap, 4, 4, |_, _| 10);
    let small_colors = dir.path().join("colors.png");
    write_png_rgba(&small_colors, 2, 2, [255, 0, 0, 255]);
    let rgba_heightmap = dir.path().join("rgba.png");
    write_png_rgba(&rgba_heightmap, 4, 4, [10, 10, 10, 255]);
    let (loader, backend) = loader();
    let mut scene = Scene::new();

    let mismatch = loader
        .load_terrain(&mut scene, 1, &TerrainSpec {
            heightmap: heightmap.clone(),
            color_map: Some(small_colors),
            ..Default::default()
        })
        .expect_err("color map size mismatch");
    assert!(matches!(error::kind(&mismatch), Some(ImportError::MissingRequiredField(_))));

    let not_grey = loader
        .load_terrain(&mut scene, 1, &TerrainSpec {
            heightmap: rgba_heightmap,
            ..Default::default()
        })
        .expect_err("heightmap must be greyscale");
    assert!(matches!(error::kind(&not_grey), Some(ImportError::MissingRequiredField(_))));

    let missing = loader
        .load_terrain(&mut scene, 1, &TerrainSpec {
            heightmap: dir.path().join("nope.png"),
            ..Default::default()
        })
        .expect_err("missing heightmap");
    assert!(matches!(error::kind(&missing), Some(ImportError::FileNotFound(_))));

    assert_eq!(scene.registry.len(), 1);
    assert_eq!(backend.stats().models_loaded, 0);
}

#[test]
fn color_map_replaces_height_colors() {
    let dir = temp_dir("terrain-colors");
    let heightmap = dir.path().join("height.png");
    write_png_gray(&heightmap, 2, 2, |_, _| 0);
    let colors = dir.path().join("colors.png");
    write_png_rgba(&colors, 2, 2, [255, 0, 255, 255]);
    let (loader, _backend) = loader();
    let mut scene = Scene::new();

    let loaded = loader
        .load_terrain(&mut scene, 1, &TerrainSpec {
            heightmap,
            color_map: Some(colors),
            ..Default::default()
        })
        .expect("terrain");

    let data = &loaded.terrain.models[0].data;
    assert!(data.vertices.iter().all(|v| v.color == [1.0, 0.0, 1.0, 1.0]));
}

#[test]
fn grass_is_placed_on_the_model_root() {
    let dir = temp_dir("terrain-grass");
    let heightmap = dir.path().join("height.png");
    write_png_gray(&heightmap, 4, 4, |_, _| 128);
    let density = dir.path().join("density.png");
    write_png_gray(&density, 4, 4, |_, _| 255);
    let (builder, root) = cube_gltf();
    let blade = builder.write_gltf(dir.path(), "blade", root);
    let (loader, backend) = loader();
    let mut scene = Scene::new();
    let spec = TerrainSpec {
        heightmap: heightmap.clone(),
        grass: Some(GrassSpec {
            model: blade,
            density_map: density,
            heightmap,
            scale_xz: 0.5,
            scale_y: 4.0,
            translation: [1.0, 0.0, 0.0],
            ..Default::default()
        }),
        ..Default::default()
    };

    let loaded = loader.load_terrain(&mut scene, 1, &spec).expect("terrain with grass");

    let grass = loaded.grass.expect("grass asset");
    let root = grass.roots[0];
    let tag = scene.registry.get::<GrassTag>(root).expect("grass tag");
    assert!(loaded.blade_count > 0 && loaded.blade_count <= 16);
    assert_eq!(tag.instance_count as usize, loaded.blade_count);
    assert_eq!(
        backend.buffer_contents(tag.blades).map(|b| b.len()),
        Some(loaded.blade_count * 8)
    );
    let params = backend.buffer_contents(tag.params).expect("params");
    assert_eq!(
        bytemuck::pod_read_unaligned::<GrassParams>(&params),
        GrassParams {
            width: 4,
            height: 4,
            xz_scale: 0.5,
            y_scale: 4.0,
        }
    );
    assert_eq!(scene.local_transform(root).position.x, 1.0);
    assert_eq!(backend.stats().models_loaded, 2);
}

#[test]
fn grass_instance_slot_includes_the_grass_translation() {
    let dir = temp_dir("terrain-grass-slot");
    let heightmap = dir.path().join("height.png");
    write_png_gray(&heightmap, 4, 4, |_, _| 128);
    let (builder, root) = cube_gltf();
    let blade = builder.write_gltf(dir.path(), "blade", root);
    let (loader, _backend) = loader();
    let mut scene = Scene::new();
    let spec = TerrainSpec {
        heightmap: heightmap.clone(),
        grass: Some(GrassSpec {
            model: blade,
            density_map: heightmap.clone(),
            heightmap,
            translation: [5.0, 0.0, 0.0],
            ..Default::default()
        }),
        ..Default::default()
    };

    let loaded = loader.load_terrain(&mut scene, 1, &spec).expect("terrain with grass");

    let grass = loaded.grass.expect("grass asset");
    let cube = grass
        .entities
        .iter()
        .copied()
        .find(|&e| scene.registry.get::<InstanceTag>(e).is_some())
        .expect("grass game object");
    let tag = scene.registry.get::<InstanceTag>(cube).expect("instance tag");
    let slot = tag.slot(0).expect("slot 0");
    let world = scene.world_matrix(cube);
    // cube node sits at x = 1 under a root moved to x = 5
    assert_eq!(world.w.x, 6.0);
    let expected: [[f32; 4]; 4] = world.into();
    for (got, want) in slot.model.iter().flatten().zip(expected.iter().flatten()) {
        assert!((got - want).abs() < 1e-5);
    }
}

#[test]
fn missing_grass_model_rolls_back_the_terrain() {
    let dir = temp_dir("terrain-grass-missing");
    let heightmap = dir.path().join("height.png");
    write_png_gray(&heightmap, 4, 4, |_, _| 128);
    let (loader, backend) = loader();
    let mut scene = Scene::new();
    let spec = TerrainSpec {
        heightmap: heightmap.clone(),
        grass: Some(GrassSpec {
            model: dir.path().join("blade.gltf"),
            density_map: heightmap.clone(),
            heightmap,
            ..Default::default()
        }),
        ..Default::default()
    };

    let err = loader.load_terrain(&mut scene, 1, &spec).expect_err("no grass model");
    assert!(matches!(error::kind(&err), Some(ImportError::FileNotFound(_))));
    assert_eq!(scene.registry.len(), 1);
    assert_eq!(backend.live_models(), 0);
    assert_eq!(backend.live_buffers(), 0);
    assert_eq!(backend.live_descriptors(), 0);
}

#[test]
fn description_file_overrides_the_spec() {
    let dir = temp_dir("terrain-description");
    let heightmap = dir.path().join("height.png");
    write_png_gray(&heightmap, 2, 2, |_, _| 50);
    let albedo = dir.path().join("albedo.png");
    write_png_rgba(&albedo, 2, 2, [0, 128, 0, 255]);
    let description = dir.path().join("terrain.json");
    let json = serde_json::json!({
        "xz_scale": 3.0,
        "material": { "name": "grassland", "diffuse_map": albedo, "roughness": 0.7 }
    });
    std::fs::write(&description, json.to_string()).expect("write description");
    let (loader, backend) = loader();
    let mut scene = Scene::new();

    let loaded = loader
        .load_terrain(&mut scene, 1, &TerrainSpec {
            heightmap,
            description: Some(description),
            material: TerrainMaterial {
                name: "ignored".to_string(),
                ..Default::default()
            },
            ..Default::default()
        })
        .expect("terrain");

    let terrain = scene
        .registry
        .get::<TerrainComponent>(loaded.entities[0])
        .expect("terrain component");
    assert_eq!(terrain.xz_scale, 3.0);
    assert_eq!(terrain.y_scale, 1.0);
    let material = &loaded.terrain.models[0].data.materials[0];
    assert_eq!(material.name, "grassland");
    assert_eq!(material.roughness, 0.7);
    assert!(material.features.contains(MaterialFeatures::HAS_DIFFUSE_MAP));
    assert_eq!(backend.stats().textures_created, 1);
}
