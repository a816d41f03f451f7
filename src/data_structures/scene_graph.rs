//! Scene graph and hierarchical scene organization.
//!
//! Every scene-graph node is backed by an entity in the [`Registry`]. Nodes
//! know their parent and their ordered children and are also reachable by a
//! human-readable dictionary key such as `"SL::models/cube.gltf::0::root"`.
//! One distinguished root exists per [`Scene`].

use std::collections::HashMap;

use cgmath::{Matrix4, SquareMatrix};
use log::warn;

use crate::data_structures::{
    instance::Transform,
    registry::{Entity, Registry},
};

#[derive(Clone, Debug)]
pub struct SceneNode {
    pub parent: Option<Entity>,
    pub children: Vec<Entity>,
    pub entity: Entity,
    pub name: String,
}

/// Parent/child links plus the name dictionary.
#[derive(Debug)]
pub struct SceneGraph {
    root: Entity,
    nodes: HashMap<Entity, SceneNode>,
    dictionary: HashMap<String, Entity>,
}

impl SceneGraph {
    fn new(root: Entity, name: &str) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            SceneNode {
                parent: None,
                children: Vec::new(),
                entity: root,
                name: name.to_string(),
            },
        );
        let mut dictionary = HashMap::new();
        dictionary.insert(name.to_string(), root);
        Self {
            root,
            nodes,
            dictionary,
        }
    }

    pub fn root(&self) -> Entity {
        self.root
    }

    pub fn node(&self, entity: Entity) -> Option<&SceneNode> {
        self.nodes.get(&entity)
    }

    pub fn children(&self, entity: Entity) -> &[Entity] {
        self.nodes
            .get(&entity)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn parent(&self, entity: Entity) -> Option<Entity> {
        self.nodes.get(&entity).and_then(|node| node.parent)
    }

    pub fn lookup(&self, key: &str) -> Option<Entity> {
        self.dictionary.get(key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.dictionary.keys()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn attach(&mut self, parent: Entity, entity: Entity, name: String) {
        if let Some(previous) = self.dictionary.insert(name.clone(), entity) {
            warn!(
                "Dictionary key {} was already taken by entity {:?}; it now points to {:?}.",
                name, previous, entity
            );
        }
        self.nodes.insert(
            entity,
            SceneNode {
                parent: Some(parent),
                children: Vec::new(),
                entity,
                name,
            },
        );
        if let Some(parent) = self.nodes.get_mut(&parent) {
            parent.children.push(entity);
        }
    }

    /// Detaches `entity` and returns it together with all of its descendants.
    fn detach_subtree(&mut self, entity: Entity) -> Vec<Entity> {
        if let Some(parent) = self.parent(entity) {
            if let Some(parent) = self.nodes.get_mut(&parent) {
                parent.children.retain(|&child| child != entity);
            }
        }
        let mut removed = Vec::new();
        let mut stack = vec![entity];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                if self.dictionary.get(&node.name) == Some(&current) {
                    self.dictionary.remove(&node.name);
                }
                stack.extend(node.children);
                removed.push(current);
            }
        }
        removed
    }
}

/// The entity registry and the scene graph that share one set of entities.
///
/// Loads running on worker threads wrap the scene in a `Mutex` so writes to
/// the registry, the graph and the dictionary are serialized.
#[derive(Debug)]
pub struct Scene {
    pub registry: Registry,
    pub graph: SceneGraph,
}

impl Scene {
    pub const ROOT_NAME: &'static str = "root";

    pub fn new() -> Self {
        let mut registry = Registry::new();
        let root = registry.create();
        registry.insert(root, Transform::default());
        Self {
            registry,
            graph: SceneGraph::new(root, Self::ROOT_NAME),
        }
    }

    pub fn root(&self) -> Entity {
        self.graph.root()
    }

    /// Creates an entity with a local transform under `parent` and registers
    /// it in the dictionary under `name`.
    pub fn create_node(&mut self, parent: Entity, name: String, transform: Transform) -> Entity {
        let entity = self.registry.create();
        self.registry.insert(entity, transform);
        self.graph.attach(parent, entity, name);
        entity
    }

    pub fn lookup(&self, key: &str) -> Option<Entity> {
        self.graph.lookup(key)
    }

    pub fn local_transform(&self, entity: Entity) -> Transform {
        self.registry
            .get::<Transform>(entity)
            .copied()
            .unwrap_or_default()
    }

    /// Local-to-world matrix found by walking up the parent chain.
    pub fn world_matrix(&self, entity: Entity) -> Matrix4<f32> {
        let mut matrix = Matrix4::identity();
        let mut current = Some(entity);
        while let Some(e) = current {
            matrix = self.local_transform(e).to_matrix() * matrix;
            current = self.graph.parent(e);
        }
        matrix
    }

    /// Removes `entity`, its descendants and all their components.
    pub fn remove_subtree(&mut self, entity: Entity) -> Vec<Entity> {
        if entity == self.root() {
            warn!("Refusing to remove the scene root.");
            return Vec::new();
        }
        let removed = self.graph.detach_subtree(entity);
        for &e in &removed {
            self.registry.destroy(e);
        }
        removed
    }

    /// Destroys an entity that may never have made it into the graph.
    pub fn discard(&mut self, entity: Entity) {
        if self.graph.node(entity).is_some() {
            self.remove_subtree(entity);
        } else {
            self.registry.destroy(entity);
        }
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}
