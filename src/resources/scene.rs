//! Scene construction: turns a [`SourceAsset`] into entities, components and
//! GPU resources.
//!
//! Pass 1 marks every source node that is a game object (mesh, camera or
//! light) or has one below it; everything else is elided. Pass 2 runs once
//! per instance. The scene graph structure is created first, then one task
//! per game object builds its components on the worker pool. Instance 0
//! builds the model and the instance buffer, later instances only write
//! their slot.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context as _, bail};
use cgmath::{Matrix4, SquareMatrix};
use rayon::prelude::*;

use crate::{
    context::Context,
    data_structures::{
        animation::{AnimationComponent, SkeletalAnimation},
        instance::{InstanceRaw, InstanceRef, InstanceTag, Transform},
        model::{MeshComponent, Model, ModelData},
        registry::Entity,
        scene_graph::Scene,
    },
    error::ImportError,
    gpu::{BufferHandle, BufferUsage, GpuResource},
    resources::{
        animation::translate,
        dom::SourceAsset,
        mesh::normalize_primitive,
        texture::{ResolvedMaterials, resolve_materials},
        transaction::LoadTransaction,
    },
};

/// What to build and where.
#[derive(Clone, Debug)]
pub struct LoadRequest<'a> {
    /// The path as the caller named it. Part of every dictionary key.
    pub path: &'a str,
    pub prefix: &'a str,
    pub instances: usize,
    pub scene_id: Option<usize>,
    /// Attach directly under this node instead of creating instance roots.
    pub group: Option<Entity>,
    /// Local transform of every instance root. Ignored with `group`.
    pub root_transform: Transform,
}

/// Everything one successful load created.
#[derive(Clone, Debug, Default)]
pub struct LoadedAsset {
    /// One per instance, or the group node when loading into a group.
    pub roots: Vec<Entity>,
    pub entities: Vec<Entity>,
    pub models: Vec<Arc<Model>>,
    pub animation: Option<Arc<Mutex<SkeletalAnimation>>>,
    pub material_count: usize,
    pub texture_count: usize,
}

pub fn root_key(prefix: &str, path: &str, instance: usize) -> String {
    format!("{prefix}::{path}::{instance}::root")
}

pub fn node_key(prefix: &str, path: &str, instance: usize, scene: &str, node: &str) -> String {
    format!("{prefix}::{path}::{instance}::{scene}::{node}")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pass 1. A node is marked if it is a game object or any descendant is.
pub fn mark(asset: &SourceAsset, roots: &[usize]) -> Vec<bool> {
    let count = asset.nodes.len();
    let mut marked = vec![false; count];
    let mut visited = vec![false; count];
    let mut stack: Vec<(usize, bool)> = roots.iter().rev().map(|&root| (root, false)).collect();
    while let Some((idx, expanded)) = stack.pop() {
        let Some(node) = asset.nodes.get(idx) else {
            continue;
        };
        if expanded {
            marked[idx] = node.is_game_object()
                || node
                    .children
                    .iter()
                    .any(|&child| marked.get(child).copied().unwrap_or(false));
            continue;
        }
        if visited[idx] {
            log::warn!("Node {} is reachable twice and only built once", idx);
            continue;
        }
        visited[idx] = true;
        stack.push((idx, true));
        stack.extend(node.children.iter().rev().map(|&child| (child, false)));
    }
    marked
}

/// Dictionary-safe node names: empty names get `node_<idx>`, repeated names
/// get `#<idx>` appended.
pub fn node_names(asset: &SourceAsset) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for node in &asset.nodes {
        *counts.entry(node.name.as_str()).or_default() += 1;
    }
    asset
        .nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| match counts.get(node.name.as_str()) {
            _ if node.name.is_empty() => format!("node_{idx}"),
            Some(&n) if n > 1 => format!("{}#{idx}", node.name),
            _ => node.name.clone(),
        })
        .collect()
}

/// A marked node, in the order pass 2 creates it.
#[derive(Clone, Debug)]
struct PlannedNode {
    source: usize,
    parent: Option<usize>,
    name: String,
    local: Transform,
    /// Relative to the instance root.
    world: Matrix4<f32>,
    /// Has a mesh with at least one primitive.
    renders: bool,
}

/// Marked nodes in source order, parents before children.
fn plan(asset: &SourceAsset, roots: &[usize], marked: &[bool]) -> Vec<PlannedNode> {
    let names = node_names(asset);
    let mut planned = Vec::new();
    let mut visited = vec![false; asset.nodes.len()];
    let mut stack: Vec<(usize, Option<usize>, Matrix4<f32>)> = roots
        .iter()
        .rev()
        .map(|&root| (root, None, Matrix4::identity()))
        .collect();
    while let Some((idx, parent, parent_world)) = stack.pop() {
        if !marked.get(idx).copied().unwrap_or(false) || visited[idx] {
            continue;
        }
        visited[idx] = true;
        let node = &asset.nodes[idx];
        let world = parent_world * node.transform.to_matrix();
        planned.push(PlannedNode {
            source: idx,
            parent,
            name: names[idx].clone(),
            local: node.transform.to_transform(),
            world,
            renders: node
                .mesh
                .and_then(|mesh| asset.meshes.get(mesh))
                .is_some_and(|mesh| !mesh.primitives.is_empty()),
        });
        stack.extend(node.children.iter().rev().map(|&child| (child, Some(idx), world)));
    }
    planned
}

fn select_scene(asset: &SourceAsset, requested: Option<usize>) -> Option<usize> {
    if asset.scenes.is_empty() {
        return None;
    }
    let fallback = asset.default_scene.min(asset.scenes.len() - 1);
    Some(match requested {
        Some(id) if id < asset.scenes.len() => id,
        Some(id) => {
            log::warn!("Scene {} does not exist, using scene {}", id, fallback);
            fallback
        }
        None => fallback,
    })
}

/// Shared, read-only state of one load's pass 2 tasks.
struct NodeBuilder<'a> {
    ctx: &'a Context,
    asset: &'a SourceAsset,
    materials: &'a ResolvedMaterials,
    animation: Option<&'a Arc<Mutex<SkeletalAnimation>>>,
    joint_buffer: Option<BufferHandle>,
    instances: usize,
    txn: &'a LoadTransaction,
    first_instance: Mutex<HashMap<usize, Entity>>,
}

impl NodeBuilder<'_> {
    /// Runs the per-role logic for one game object of `instance`.
    fn build(
        &self,
        scene: &Mutex<&mut Scene>,
        instance: usize,
        planned: &PlannedNode,
        entity: Entity,
        world: Matrix4<f32>,
    ) -> anyhow::Result<Option<Arc<Model>>> {
        let node = &self.asset.nodes[planned.source];
        let model = match (planned.renders, instance) {
            (false, _) => None,
            (true, 0) => Some(self.first_instance(scene, planned, entity, world)?),
            (true, _) => {
                self.later_instance(scene, planned, instance, entity, world)?;
                None
            }
        };
        if node.camera.is_some() || node.light.is_some() {
            let mut scene = lock(scene);
            if let Some(camera) = &node.camera {
                scene.registry.insert(entity, camera.clone());
            }
            if let Some(light) = &node.light {
                scene.registry.insert(entity, light.clone());
            }
        }
        Ok(model)
    }

    fn first_instance(
        &self,
        scene: &Mutex<&mut Scene>,
        planned: &PlannedNode,
        entity: Entity,
        world: Matrix4<f32>,
    ) -> anyhow::Result<Arc<Model>> {
        let node = &self.asset.nodes[planned.source];
        let mesh = node
            .mesh
            .and_then(|mesh| self.asset.meshes.get(mesh))
            .with_context(|| format!("Node {} refers to a missing mesh", planned.name))?;
        let skinned = node.skin.is_some() && self.animation.is_some();
        let backend = self.ctx.backend();

        let mut data = ModelData::new(mesh.name.clone());
        data.materials = self.materials.materials.clone();
        for (idx, primitive) in mesh.primitives.iter().enumerate() {
            let material = self.materials.material_index(primitive.material);
            let (vertices, indices) = normalize_primitive(
                primitive,
                &self.materials.materials[material],
                self.ctx.config.tangent_fallback,
            )
            .with_context(|| format!("Failed to read primitive {} of mesh {}", idx, mesh.name))?;
            data.push_primitive(vertices, indices, material, self.instances as u32);
        }
        data.validate()?;

        let instance_buffer = backend.create_instance_buffer(self.instances)?;
        self.txn.track(GpuResource::Buffer(instance_buffer));
        let mut buffers = vec![instance_buffer];
        if skinned {
            buffers.extend(self.joint_buffer);
        }
        for submesh in &mut data.submeshes {
            let descriptor = backend.create_resource_descriptor(&buffers)?;
            self.txn.track(GpuResource::Descriptor(descriptor));
            submesh.resources = Some(descriptor);
        }
        let handle = backend.load_model(&data)?;
        self.txn.track(GpuResource::Model(handle));
        log::debug!(
            "Uploaded {} ({} vertices, {} submeshes)",
            data.name,
            data.vertices.len(),
            data.submeshes.len()
        );

        let mut tag = InstanceTag::new(instance_buffer, self.instances);
        tag.write_slot(backend, 0, InstanceRaw::from_world(&world))?;
        tag.instances.push(entity);
        let model = Arc::new(Model { handle, data });
        {
            let mut scene = lock(scene);
            scene.registry.insert(
                entity,
                MeshComponent {
                    model: Arc::clone(&model),
                },
            );
            scene.registry.insert(entity, tag);
            if let (true, Some(animation)) = (skinned, self.animation) {
                scene.registry.insert(
                    entity,
                    AnimationComponent {
                        animation: Arc::clone(animation),
                    },
                );
            }
        }
        lock(&self.first_instance).insert(planned.source, entity);
        Ok(model)
    }

    fn later_instance(
        &self,
        scene: &Mutex<&mut Scene>,
        planned: &PlannedNode,
        instance: usize,
        entity: Entity,
        world: Matrix4<f32>,
    ) -> anyhow::Result<()> {
        let miss = ImportError::InstanceLookupMiss {
            node: planned.source,
            instance,
        };
        let Some(first) = lock(&self.first_instance).get(&planned.source).copied() else {
            bail!(miss);
        };
        let mut scene = lock(scene);
        let Some(tag) = scene.registry.get_mut::<InstanceTag>(first) else {
            bail!(miss);
        };
        tag.instances.push(entity);
        tag.write_slot(self.ctx.backend(), instance, InstanceRaw::from_world(&world))?;
        scene.registry.insert(
            entity,
            InstanceRef {
                first,
                slot: instance,
            },
        );
        Ok(())
    }
}

/**
 * Builds `request.instances` instances of `asset` into `scene`.
 *
 * Either everything is created or, on any failure, every entity and GPU
 * resource the load created is destroyed again before the error is returned.
 */
pub fn construct(
    ctx: &Context,
    scene: &mut Scene,
    asset: &SourceAsset,
    request: &LoadRequest<'_>,
) -> anyhow::Result<LoadedAsset> {
    let txn = LoadTransaction::new();
    match construct_tracked(ctx, scene, asset, request, &txn) {
        Ok(loaded) => Ok(loaded),
        Err(e) => {
            log::error!("Loading {} failed: {:#}", request.path, e);
            txn.rollback(scene, ctx.backend());
            Err(e)
        }
    }
}

/// [`construct`] without the rollback. Everything created is recorded in
/// `txn` so callers that build several assets can undo them together.
pub fn construct_tracked(
    ctx: &Context,
    scene: &mut Scene,
    asset: &SourceAsset,
    request: &LoadRequest<'_>,
    txn: &LoadTransaction,
) -> anyhow::Result<LoadedAsset> {
    if request.instances == 0 {
        bail!("{} requested with an instance count of 0", request.path);
    }
    let backend = ctx.backend();
    let first_entity = txn.entities().len();
    let (scene_name, roots) = match select_scene(asset, request.scene_id) {
        Some(idx) => (asset.scenes[idx].name.clone(), asset.scenes[idx].roots.clone()),
        None => ("scene_0".to_string(), asset.root_nodes()),
    };

    let animation = match translate(asset) {
        Some(mut skeletal) => {
            let buffer = backend.create_buffer(
                "joint matrices",
                skeletal.skeleton.buffer_size(),
                BufferUsage::Storage,
            )?;
            txn.track(GpuResource::Buffer(buffer));
            skeletal.skeleton.buffer = Some(buffer);
            skeletal.rest(backend)?;
            log::info!(
                "{}: {} joints, animations {:?}",
                request.path,
                skeletal.skeleton.len(),
                skeletal.names().collect::<Vec<_>>()
            );
            Some(Arc::new(Mutex::new(skeletal)))
        }
        None => None,
    };
    let joint_buffer = animation
        .as_ref()
        .and_then(|animation| lock(animation.as_ref()).skeleton.buffer);
    let materials = resolve_materials(ctx, asset, animation.is_some(), txn)?;

    let marked = mark(asset, &roots);
    let planned = plan(asset, &roots, &marked);
    log::debug!(
        "{}: {} of {} nodes kept after marking",
        request.path,
        planned.len(),
        asset.nodes.len()
    );

    let builder = NodeBuilder {
        ctx,
        asset,
        materials: &materials,
        animation: animation.as_ref(),
        joint_buffer,
        instances: request.instances,
        txn,
        first_instance: Mutex::new(HashMap::new()),
    };
    let mut loaded = LoadedAsset::default();
    for instance in 0..request.instances {
        let root = match request.group {
            Some(group) => group,
            None => {
                let root = scene.create_node(
                    scene.root(),
                    root_key(request.prefix, request.path, instance),
                    request.root_transform,
                );
                txn.track_entity(root);
                root
            }
        };
        if loaded.roots.last() != Some(&root) {
            loaded.roots.push(root);
        }
        let root_world = scene.world_matrix(root);

        let mut entities: HashMap<usize, Entity> = HashMap::with_capacity(planned.len());
        for node in &planned {
            let parent = node
                .parent
                .and_then(|p| entities.get(&p).copied())
                .unwrap_or(root);
            let key = node_key(request.prefix, request.path, instance, &scene_name, &node.name);
            let entity = scene.create_node(parent, key, node.local);
            txn.track_entity(entity);
            entities.insert(node.source, entity);
        }

        let tasks: Vec<(&PlannedNode, Entity)> = planned
            .iter()
            .filter(|node| asset.nodes[node.source].is_game_object())
            .filter_map(|node| entities.get(&node.source).map(|&e| (node, e)))
            .collect();
        let shared = Mutex::new(&mut *scene);
        let results: Vec<anyhow::Result<Option<Arc<Model>>>> = ctx.install(|| {
            tasks
                .par_iter()
                .map(|&(node, entity)| builder.build(&shared, instance, node, entity, root_world * node.world))
                .collect()
        });
        drop(shared);
        let mut failure = None;
        for result in results {
            match result {
                Ok(Some(model)) => loaded.models.push(model),
                Ok(None) => {}
                Err(e) if failure.is_none() => failure = Some(e),
                Err(e) => log::error!("{:#}", e),
            }
        }
        if let Some(e) = failure {
            return Err(e.context(format!("Instance {} of {}", instance, request.path)));
        }
    }

    loaded.entities = txn.entities().split_off(first_entity);
    loaded.animation = animation;
    loaded.material_count = materials.materials.len();
    loaded.texture_count = materials.textures.len();
    log::info!(
        "Loaded {} x{}: {} entities, {} models",
        request.path,
        request.instances,
        loaded.entities.len(),
        loaded.models.len()
    );
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::dom::SourceNode;

    fn node(name: &str, children: Vec<usize>, mesh: Option<usize>) -> SourceNode {
        SourceNode {
            name: name.to_string(),
            children,
            mesh,
            ..Default::default()
        }
    }

    #[test]
    fn marking_keeps_ancestors_of_game_objects() {
        let asset = SourceAsset {
            nodes: vec![
                node("root", vec![1, 2], None),
                node("empty", vec![], None),
                node("arm", vec![3], None),
                node("hand", vec![], Some(0)),
            ],
            ..Default::default()
        };
        assert_eq!(mark(&asset, &[0]), vec![true, false, true, true]);
    }

    #[test]
    fn names_are_unique() {
        let asset = SourceAsset {
            nodes: vec![node("a", vec![], None), node("", vec![], None), node("a", vec![], None)],
            ..Default::default()
        };
        assert_eq!(node_names(&asset), vec!["a#0", "node_1", "a#2"]);
    }

    #[test]
    fn keys_have_the_canonical_shape() {
        assert_eq!(root_key("SL", "cube.gltf", 2), "SL::cube.gltf::2::root");
        assert_eq!(
            node_key("SL", "cube.gltf", 0, "Scene", "Cube"),
            "SL::cube.gltf::0::Scene::Cube"
        );
    }
}
