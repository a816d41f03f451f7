//! Skeleton and animation translation from the source document.

use std::collections::HashSet;

use cgmath::{Matrix4, SquareMatrix};

use crate::{
    data_structures::{
        animation::{Animation, Channel, Interpolation, SkeletalAnimation, Sampler},
        skeleton::{Joint, Skeleton},
    },
    resources::dom::{SourceAsset, SourceSampler},
};

/**
 * Builds the skeleton of an asset from its first skin.
 *
 * Joints keep the order the skin lists them in. A joint's parent is the
 * nearest ancestor node that is itself a joint, matched by node or by name.
 */
pub fn build_skeleton(asset: &SourceAsset) -> Skeleton {
    let mut skeleton = Skeleton::default();
    let Some(skin) = asset.skins.first() else {
        return skeleton;
    };
    if asset.skins.len() > 1 {
        log::warn!(
            "Asset has {} skins, only {} is used for the skeleton",
            asset.skins.len(),
            skin.name
        );
    }
    for (idx, &node_idx) in skin.joints.iter().enumerate() {
        let Some(node) = asset.nodes.get(node_idx) else {
            log::warn!("Skin {} lists missing node {}", skin.name, node_idx);
            continue;
        };
        let name = if node.name.is_empty() {
            format!("joint_{idx}")
        } else {
            node.name.clone()
        };
        let inverse_bind = skin
            .inverse_bind_matrices
            .get(idx)
            .map(|&m| Matrix4::from(m))
            .unwrap_or_else(Matrix4::identity);
        skeleton.push_joint(
            node_idx,
            Joint::new(name, inverse_bind, node.transform.to_transform()),
        );
    }

    let parents = asset.parents();
    let joint_nodes: Vec<usize> = skin.joints.clone();
    for node_idx in joint_nodes {
        let Some(&child) = skeleton.global_to_joint.get(&node_idx) else {
            continue;
        };
        let mut ancestor = parents.get(node_idx).copied().flatten();
        while let Some(current) = ancestor {
            if let Some(parent) = joint_for_node(asset, &skeleton, current) {
                skeleton.link(parent, child);
                break;
            }
            ancestor = parents.get(current).copied().flatten();
        }
    }
    skeleton
}

/// The joint a source node drives, matched by node index first and by name second.
fn joint_for_node(asset: &SourceAsset, skeleton: &Skeleton, node: usize) -> Option<usize> {
    if let Some(&joint) = skeleton.global_to_joint.get(&node) {
        return Some(joint);
    }
    let name = &asset.nodes.get(node)?.name;
    if name.is_empty() {
        return None;
    }
    skeleton.joint_index(name)
}

fn translate_sampler(source: &SourceSampler) -> Sampler {
    let cubic = source.interpolation == Interpolation::CubicSpline;
    let stride = if cubic { 3 } else { 1 };
    let mut order: Vec<usize> = (0..source.times.len())
        .filter(|&k| (k + 1) * stride <= source.outputs.len())
        .collect();
    if order.len() < source.times.len() {
        log::warn!(
            "Sampler has {} timestamps but only {} outputs",
            source.times.len(),
            source.outputs.len()
        );
    }
    if !source.times.windows(2).all(|w| w[0] <= w[1]) {
        log::warn!("Sampler timestamps are not ascending and get sorted");
        order.sort_by(|&a, &b| source.times[a].total_cmp(&source.times[b]));
    }
    let times: Vec<f32> = order.iter().map(|&k| source.times[k]).collect();
    if cubic {
        let triplets = order
            .iter()
            .flat_map(|&k| source.outputs[k * 3..k * 3 + 3].iter().copied())
            .collect();
        Sampler::cubic_from_triplets(times, triplets)
    } else {
        let outputs = order.iter().map(|&k| source.outputs[k]).collect();
        Sampler::new(source.interpolation, times, outputs)
    }
}

/**
 * Translates all animations that target the skeleton.
 *
 * Names containing `|` (the `rig|clip` duplicates FBX exporters write) are
 * skipped in favour of the plain clip. Channels on nodes that are not joints
 * are dropped.
 */
pub fn translate_animations(asset: &SourceAsset, skeleton: &Skeleton) -> Vec<Animation> {
    let mut seen = HashSet::new();
    let mut animations = Vec::new();
    for (idx, source) in asset.animations.iter().enumerate() {
        let name = if source.name.is_empty() {
            format!("animation_{idx}")
        } else {
            source.name.clone()
        };
        if name.contains('|') {
            log::info!("Skipping animation {}, the unprefixed clip is used instead", name);
            continue;
        }
        if !seen.insert(name.clone()) {
            log::warn!("Duplicate animation name {}, keeping the first", name);
            continue;
        }
        let mut animation = Animation::new(name);
        animation.samplers = source.samplers.iter().map(translate_sampler).collect();
        for channel in &source.channels {
            if channel.sampler >= animation.samplers.len() {
                log::warn!("Channel of {} refers to missing sampler {}", animation.name, channel.sampler);
                continue;
            }
            match joint_for_node(asset, skeleton, channel.node) {
                Some(joint) => animation.channels.push(Channel {
                    sampler: channel.sampler,
                    joint,
                    path: channel.path,
                }),
                None => log::warn!(
                    "Animation {} targets node {} which is not a joint",
                    animation.name,
                    channel.node
                ),
            }
        }
        animation.update_bounds();
        animations.push(animation);
    }
    animations
}

/// Skeleton plus animations, or `None` when the asset has no joints.
pub fn translate(asset: &SourceAsset) -> Option<SkeletalAnimation> {
    let skeleton = build_skeleton(asset);
    if skeleton.is_empty() {
        if !asset.animations.is_empty() {
            log::warn!(
                "{} animations ignored, the asset has no skeleton",
                asset.animations.len()
            );
        }
        return None;
    }
    let animations = translate_animations(asset, &skeleton);
    Some(SkeletalAnimation {
        skeleton,
        animations,
    })
}

#[cfg(test)]
mod tests {
    use cgmath::Vector4;

    use super::*;
    use crate::{
        data_structures::animation::Path,
        resources::dom::{SourceAnimation, SourceChannel, SourceNode, SourceSkin},
    };

    fn node(name: &str, children: Vec<usize>) -> SourceNode {
        SourceNode {
            name: name.to_string(),
            children,
            ..Default::default()
        }
    }

    fn rig() -> SourceAsset {
        // root -> hips -> (helper -> spine)
        SourceAsset {
            nodes: vec![
                node("root", vec![1]),
                node("hips", vec![2]),
                node("helper", vec![3]),
                node("spine", vec![]),
            ],
            skins: vec![SourceSkin {
                name: "rig".to_string(),
                joints: vec![1, 3],
                inverse_bind_matrices: Vec::new(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn parents_skip_non_joint_nodes() {
        let skeleton = build_skeleton(&rig());
        assert_eq!(skeleton.len(), 2);
        assert_eq!(skeleton.joints[0].parent, None);
        assert_eq!(skeleton.joints[1].parent, Some(0));
        assert_eq!(skeleton.joints[0].children, vec![1]);
        assert_eq!(skeleton.global_to_joint[&3], 1);
    }

    #[test]
    fn pipe_names_are_skipped_and_bounds_set() {
        let mut asset = rig();
        let sampler = SourceSampler {
            interpolation: Interpolation::Linear,
            times: vec![0.5, 2.0],
            outputs: vec![Vector4::new(0.0, 0.0, 0.0, 0.0), Vector4::new(1.0, 0.0, 0.0, 0.0)],
        };
        let clip = |name: &str| SourceAnimation {
            name: name.to_string(),
            samplers: vec![sampler.clone()],
            channels: vec![SourceChannel {
                node: 3,
                path: Path::Translation,
                sampler: 0,
            }],
        };
        asset.animations = vec![clip("Armature|Run"), clip("Run")];
        let skeleton = build_skeleton(&asset);
        let animations = translate_animations(&asset, &skeleton);
        assert_eq!(animations.len(), 1);
        assert_eq!(animations[0].name, "Run");
        assert_eq!(animations[0].first_key_time, 0.5);
        assert_eq!(animations[0].last_key_time, 2.0);
        assert_eq!(animations[0].channels[0].joint, 1);
    }

    #[test]
    fn unsorted_timestamps_are_sorted() {
        let sampler = translate_sampler(&SourceSampler {
            interpolation: Interpolation::Step,
            times: vec![1.0, 0.0],
            outputs: vec![Vector4::new(1.0, 0.0, 0.0, 0.0), Vector4::new(0.0, 0.0, 0.0, 0.0)],
        });
        assert_eq!(sampler.timestamps, vec![0.0, 1.0]);
        assert_eq!(sampler.outputs[0].x, 0.0);
    }
}
