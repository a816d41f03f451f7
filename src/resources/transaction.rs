//! Bookkeeping that lets a failed load undo itself.

use std::sync::{Mutex, PoisonError};

use crate::{
    data_structures::{registry::Entity, scene_graph::Scene},
    gpu::{GpuBackend, GpuResource},
};

/// Everything a load created so far. Worker tasks record into it
/// concurrently; [`LoadTransaction::rollback`] gives it all back.
#[derive(Debug, Default)]
pub struct LoadTransaction {
    resources: Mutex<Vec<GpuResource>>,
    entities: Mutex<Vec<Entity>>,
}

impl LoadTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, resource: GpuResource) {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resource);
    }

    pub fn track_entity(&self, entity: Entity) {
        self.entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entity);
    }

    pub fn resources(&self) -> Vec<GpuResource> {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Destroys every recorded entity (with its subtree) and releases every
    /// recorded GPU resource, newest first.
    pub fn rollback(self, scene: &mut Scene, backend: &dyn GpuBackend) {
        let entities = self
            .entities
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let resources = self
            .resources
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        log::warn!(
            "Rolling back load: {} entities, {} GPU resources",
            entities.len(),
            resources.len()
        );
        for entity in entities.into_iter().rev() {
            if scene.registry.contains(entity) {
                scene.discard(entity);
            }
        }
        for resource in resources.into_iter().rev() {
            backend.release(resource);
        }
    }
}
