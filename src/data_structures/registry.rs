//! Minimal entity/component registry.
//!
//! Entities are plain ids. Components live in one type-erased map per
//! component type, keyed by entity. This is all the importer needs to hang
//! models, instance tags and skeletons off game objects; a full ECS stays
//! outside this crate.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity(pub u32);

pub trait Component: Any + Send + Sync {}
impl<T: Any + Send + Sync> Component for T {}

#[derive(Default)]
pub struct Registry {
    next: u32,
    alive: Vec<Entity>,
    stores: HashMap<TypeId, HashMap<Entity, Box<dyn Any + Send + Sync>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self) -> Entity {
        let entity = Entity(self.next);
        self.next += 1;
        self.alive.push(entity);
        entity
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.alive.binary_search(&entity).is_ok()
    }

    pub fn len(&self) -> usize {
        self.alive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.alive
    }

    /// Removes the entity and every component attached to it.
    pub fn destroy(&mut self, entity: Entity) {
        if let Ok(pos) = self.alive.binary_search(&entity) {
            self.alive.remove(pos);
        }
        for store in self.stores.values_mut() {
            store.remove(&entity);
        }
    }

    pub fn insert<T: Component>(&mut self, entity: Entity, component: T) {
        self.stores
            .entry(TypeId::of::<T>())
            .or_default()
            .insert(entity, Box::new(component));
    }

    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        self.stores
            .get(&TypeId::of::<T>())?
            .get(&entity)?
            .downcast_ref::<T>()
    }

    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        self.stores
            .get_mut(&TypeId::of::<T>())?
            .get_mut(&entity)?
            .downcast_mut::<T>()
    }

    pub fn remove<T: Component>(&mut self, entity: Entity) -> Option<T> {
        let boxed = self.stores.get_mut(&TypeId::of::<T>())?.remove(&entity)?;
        boxed.downcast::<T>().ok().map(|b| *b)
    }

    /// All entities that carry a `T`, in ascending entity order.
    pub fn with<T: Component>(&self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .stores
            .get(&TypeId::of::<T>())
            .map(|store| store.keys().copied().collect())
            .unwrap_or_default();
        entities.sort();
        entities
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entities", &self.alive.len())
            .field("component_types", &self.stores.len())
            .finish()
    }
}
