//! Geometry normalization: source streams in, [`Vertex`] + flat indices out.

use cgmath::{InnerSpace, Vector2, Vector3, Zero};

use crate::{
    data_structures::{material::Material, model::Vertex},
    error::ImportError,
    resources::dom::SourcePrimitive,
};

/// Weights whose sum is below this are treated as "not skinned".
const WEIGHT_EPSILON: f32 = 1e-6;
/// Below this the UV determinant of a triangle is considered zero.
const UV_EPSILON: f32 = 1e-12;

/// Scales weights so they sum to 1. Sums below epsilon zero all four.
pub fn normalize_weights(weights: [f32; 4]) -> [f32; 4] {
    let sum: f32 = weights.iter().sum();
    if sum > WEIGHT_EPSILON {
        weights.map(|w| w / sum)
    } else {
        [0.0; 4]
    }
}

/// sRGB encoded vertex color to linear, as FBX stores colors.
pub fn srgb_to_linear(color: [f32; 4]) -> [f32; 4] {
    [
        color[0].powf(2.2),
        color[1].powf(2.2),
        color[2].powf(2.2),
        color[3],
    ]
}

/**
 * Synthesizes one tangent per triangle and assigns it to all three corners.
 *
 * `fallback` replaces `1/det` when the UV determinant is ~0. A tangent that
 * comes out exactly zero is replaced by `(1, 0, 0)`. Triangles with two
 * coinciding indices are skipped; vertices no triangle touches get `(1, 0, 0)`.
 */
pub fn calculate_tangents(vertices: &mut [Vertex], indices: &[u32], fallback: f32) {
    let count = vertices.len() as u32;
    for tri in indices.chunks_exact(3) {
        let (i0, i1, i2) = (tri[0], tri[1], tri[2]);
        if i0 == i1 || i1 == i2 || i0 == i2 || i0 >= count || i1 >= count || i2 >= count {
            continue;
        }
        let (v0, v1, v2) = (
            vertices[i0 as usize],
            vertices[i1 as usize],
            vertices[i2 as usize],
        );
        let edge1 = Vector3::from(v1.position) - Vector3::from(v0.position);
        let edge2 = Vector3::from(v2.position) - Vector3::from(v0.position);
        let duv1 = Vector2::from(v1.uv) - Vector2::from(v0.uv);
        let duv2 = Vector2::from(v2.uv) - Vector2::from(v0.uv);

        let det = duv1.x * duv2.y - duv2.x * duv1.y;
        let f = if det.abs() > UV_EPSILON { 1.0 / det } else { fallback };
        let mut tangent = (edge1 * duv2.y - edge2 * duv1.y) * f;
        if tangent.is_zero() {
            tangent = Vector3::unit_x();
        }
        for idx in [i0, i1, i2] {
            vertices[idx as usize].tangent = tangent.into();
        }
    }
    for vertex in vertices.iter_mut() {
        if Vector3::from(vertex.tangent).is_zero() {
            vertex.tangent = [1.0, 0.0, 0.0];
        }
    }
}

/// Area weighted face normals accumulated per vertex.
fn synthesize_normals(positions: &[[f32; 3]], indices: &[u32]) -> Vec<[f32; 3]> {
    let mut normals = vec![Vector3::zero(); positions.len()];
    for tri in indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        if a >= positions.len() || b >= positions.len() || c >= positions.len() {
            continue;
        }
        let p0 = Vector3::from(positions[a]);
        let face = (Vector3::from(positions[b]) - p0).cross(Vector3::from(positions[c]) - p0);
        for idx in [a, b, c] {
            normals[idx] += face;
        }
    }
    normals.into_iter().map(unit_or_up).collect()
}

fn unit_or_up(n: Vector3<f32>) -> [f32; 3] {
    if n.magnitude2() > 0.0 {
        n.normalize().into()
    } else {
        [0.0, 1.0, 0.0]
    }
}

fn stream_len_matches<T>(stream: &Option<Vec<T>>, len: usize, name: &str) -> bool {
    match stream {
        Some(values) if values.len() != len => {
            log::warn!(
                "{} stream has {} entries for {} positions and is ignored",
                name,
                values.len(),
                len
            );
            false
        }
        Some(_) => true,
        None => false,
    }
}

/**
 * Converts one source primitive into engine vertices and primitive-local
 * indices.
 *
 * Positions are required. Missing indices become `0..n`, missing normals are
 * synthesized from the faces, missing tangents from the faces and UVs. The
 * vertex color is the source color (or white) times the material's diffuse
 * color. Weights are normalized when joints and weights are both present.
 */
pub fn normalize_primitive(
    primitive: &SourcePrimitive,
    material: &Material,
    tangent_fallback: f32,
) -> Result<(Vec<Vertex>, Vec<u32>), ImportError> {
    let positions = &primitive.positions;
    if positions.is_empty() {
        return Err(ImportError::MissingRequiredField(
            "primitive without positions".to_string(),
        ));
    }
    let count = positions.len();
    let indices: Vec<u32> = match &primitive.indices {
        Some(indices) => indices.clone(),
        None => (0..count as u32).collect(),
    };
    if let Some(bad) = indices.iter().find(|&&i| i as usize >= count) {
        return Err(ImportError::MissingRequiredField(format!(
            "index {bad} points past the {count} vertices of the primitive"
        )));
    }

    let normals = if stream_len_matches(&primitive.normals, count, "normal") {
        primitive.normals.clone()
    } else {
        None
    }
    .unwrap_or_else(|| synthesize_normals(positions, &indices));
    let uvs = stream_len_matches(&primitive.uvs, count, "uv")
        .then(|| primitive.uvs.as_deref())
        .flatten();
    let colors = stream_len_matches(&primitive.colors, count, "color")
        .then(|| primitive.colors.as_deref())
        .flatten();
    let tangents = stream_len_matches(&primitive.tangents, count, "tangent")
        .then(|| primitive.tangents.as_deref())
        .flatten();
    let skinning = match (&primitive.joints, &primitive.weights) {
        (Some(joints), Some(weights)) if joints.len() == count && weights.len() == count => {
            Some((joints, weights))
        }
        (Some(_), Some(_)) => {
            log::warn!("joint and weight streams do not match the vertex count and are ignored");
            None
        }
        _ => None,
    };

    let diffuse = material.diffuse_color;
    let mut vertices: Vec<Vertex> = (0..count)
        .map(|i| {
            let color = colors.map_or([1.0; 4], |c| c[i]);
            let (joint_ids, weights) = match skinning {
                Some((joints, weights)) => {
                    let weights = normalize_weights(weights[i]);
                    (joints[i].map(|j| j as i32), weights)
                }
                None => ([0; 4], [0.0; 4]),
            };
            Vertex {
                position: positions[i],
                color: [
                    color[0] * diffuse[0],
                    color[1] * diffuse[1],
                    color[2] * diffuse[2],
                    color[3] * diffuse[3],
                ],
                normal: unit_or_up(Vector3::from(normals[i])),
                tangent: tangents.map_or([0.0; 3], |t| t[i]),
                uv: uvs.map_or([0.0; 2], |uv| uv[i]),
                joint_ids,
                weights,
            }
        })
        .collect();

    if tangents.is_none() {
        calculate_tangents(&mut vertices, &indices, tangent_fallback);
    }
    Ok((vertices, indices))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(position: [f32; 3], uv: [f32; 2]) -> Vertex {
        Vertex {
            position,
            uv,
            ..Default::default()
        }
    }

    #[test]
    fn tangent_follows_u_direction() {
        let mut vertices = vec![
            vertex([0.0, 0.0, 0.0], [0.0, 0.0]),
            vertex([1.0, 0.0, 0.0], [1.0, 0.0]),
            vertex([0.0, 1.0, 0.0], [0.0, 1.0]),
        ];
        calculate_tangents(&mut vertices, &[0, 1, 2], 1e5);
        for v in &vertices {
            assert_eq!(v.tangent, [1.0, 0.0, 0.0]);
        }
    }

    #[test]
    fn zero_uv_area_falls_back() {
        let mut vertices = vec![
            vertex([0.0, 0.0, 0.0], [0.0, 0.0]),
            vertex([0.0, 0.0, 1.0], [0.0, 0.0]),
            vertex([0.0, 1.0, 0.0], [0.0, 0.0]),
        ];
        calculate_tangents(&mut vertices, &[0, 1, 2], 1e5);
        assert!(vertices.iter().all(|v| v.tangent == [1.0, 0.0, 0.0]));
    }

    #[test]
    fn weights_are_normalized() {
        let w = normalize_weights([2.0, 1.0, 1.0, 0.0]);
        assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert_eq!(w[0], 0.5);
        assert_eq!(normalize_weights([0.0; 4]), [0.0; 4]);
    }

    #[test]
    fn missing_indices_become_a_range() {
        let primitive = SourcePrimitive {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]],
            ..Default::default()
        };
        let (vertices, indices) =
            normalize_primitive(&primitive, &Material::default(), 1e5).expect("normalize");
        assert_eq!(indices, vec![0, 1, 2]);
        // counter clockwise seen from above
        for v in &vertices {
            assert!((v.normal[1] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn color_is_multiplied_with_diffuse() {
        let primitive = SourcePrimitive {
            positions: vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            colors: Some(vec![[0.5, 1.0, 1.0, 1.0]; 3]),
            ..Default::default()
        };
        let material = Material {
            diffuse_color: [1.0, 0.5, 0.0, 1.0],
            ..Default::default()
        };
        let (vertices, _) = normalize_primitive(&primitive, &material, 1e5).expect("normalize");
        assert_eq!(vertices[0].color, [0.5, 0.5, 0.0, 1.0]);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let primitive = SourcePrimitive {
            positions: vec![[0.0; 3]; 3],
            indices: Some(vec![0, 1, 3]),
            ..Default::default()
        };
        assert!(normalize_primitive(&primitive, &Material::default(), 1e5).is_err());
    }
}
