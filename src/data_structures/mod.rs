//! Engine data structures: models, materials, textures, scene graphs, instances and skeletons.
//!
//! This module contains the core data types every importer produces:
//!
//! - `model` contains the vertex layout, submeshes and model data
//! - `material` holds PBR materials with their feature bits and texture slots
//! - `texture` contains decoded textures and the GPU texture wrapper
//! - `instance` holds local transforms and per-instance GPU data
//! - `registry` is a minimal entity/component store
//! - `scene_graph` enables hierarchical scene organization
//! - `skeleton` and `animation` hold joints and keyframed animations
//! - `terrain` holds the terrain and grass components
//! - `tags` holds camera and light components

pub mod animation;
pub mod instance;
pub mod material;
pub mod model;
pub mod registry;
pub mod scene_graph;
pub mod skeleton;
pub mod tags;
pub mod terrain;
pub mod texture;
