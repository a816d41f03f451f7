//! Keyframed joint animation in one uniform format.
//!
//! Every importer produces [`Animation`]s made of [`Sampler`]s (timestamps plus
//! vec4 outputs) and [`Channel`]s that bind a sampler to a joint and a path.
//! Translations and scales store `xyz` with `w = 0`, rotations store a unit
//! quaternion as `xyzw`.

use cgmath::{InnerSpace, Quaternion, Vector3, Vector4, VectorSpace};

use crate::{
    data_structures::skeleton::Skeleton,
    gpu::GpuBackend,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Interpolation {
    Step,
    #[default]
    Linear,
    CubicSpline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Path {
    Translation,
    Rotation,
    Scale,
}

/// In and out tangents of one cubic spline keyframe.
pub type SplineTangents = [Vector4<f32>; 2];

#[derive(Clone, Debug, PartialEq)]
pub struct Sampler {
    pub interpolation: Interpolation,
    pub timestamps: Vec<f32>,
    /// One value per timestamp.
    pub outputs: Vec<Vector4<f32>>,
    /// One entry per timestamp for cubic splines, empty otherwise.
    pub tangents: Vec<SplineTangents>,
}

pub fn vec3_output(v: [f32; 3]) -> Vector4<f32> {
    Vector4::new(v[0], v[1], v[2], 0.0)
}

pub fn quat_output(q: [f32; 4]) -> Vector4<f32> {
    Vector4::new(q[0], q[1], q[2], q[3])
}

fn to_quaternion(v: Vector4<f32>) -> Quaternion<f32> {
    Quaternion::new(v.w, v.x, v.y, v.z)
}

fn from_quaternion(q: Quaternion<f32>) -> Vector4<f32> {
    Vector4::new(q.v.x, q.v.y, q.v.z, q.s)
}

impl Sampler {
    pub fn new(interpolation: Interpolation, timestamps: Vec<f32>, outputs: Vec<Vector4<f32>>) -> Self {
        Self {
            interpolation,
            timestamps,
            outputs,
            tangents: Vec::new(),
        }
    }

    /**
     * Builds a cubic spline sampler from glTF style outputs where each
     * keyframe is stored as `(in tangent, value, out tangent)`.
     */
    pub fn cubic_from_triplets(timestamps: Vec<f32>, triplets: Vec<Vector4<f32>>) -> Self {
        let mut outputs = Vec::with_capacity(timestamps.len());
        let mut tangents = Vec::with_capacity(timestamps.len());
        for chunk in triplets.chunks_exact(3) {
            tangents.push([chunk[0], chunk[2]]);
            outputs.push(chunk[1]);
        }
        Self {
            interpolation: Interpolation::CubicSpline,
            timestamps,
            outputs,
            tangents,
        }
    }

    pub fn first_time(&self) -> Option<f32> {
        self.timestamps.first().copied()
    }

    pub fn last_time(&self) -> Option<f32> {
        self.timestamps.last().copied()
    }

    pub fn is_sorted(&self) -> bool {
        self.timestamps.windows(2).all(|w| w[0] <= w[1])
    }

    /// Evaluates the sampler at `time`, clamped to the keyframe range.
    pub fn sample(&self, time: f32, path: Path) -> Option<Vector4<f32>> {
        let len = self.timestamps.len().min(self.outputs.len());
        if len == 0 {
            return None;
        }
        let times = &self.timestamps[..len];
        if len == 1 || time <= times[0] {
            return Some(self.outputs[0]);
        }
        if time >= times[len - 1] {
            return Some(self.outputs[len - 1]);
        }
        // first keyframe strictly after `time`
        let next = times.partition_point(|&t| t <= time);
        let prev = next - 1;
        let dt = times[next] - times[prev];
        let factor = if dt > 0.0 { (time - times[prev]) / dt } else { 0.0 };
        let a = self.outputs[prev];
        let b = self.outputs[next];
        let value = match self.interpolation {
            Interpolation::Step => a,
            Interpolation::Linear => match path {
                Path::Rotation => {
                    from_quaternion(to_quaternion(a).slerp(to_quaternion(b), factor))
                }
                Path::Translation | Path::Scale => a.lerp(b, factor),
            },
            Interpolation::CubicSpline => {
                let (out_a, in_b) = match (self.tangents.get(prev), self.tangents.get(next)) {
                    (Some(ta), Some(tb)) => (ta[1] * dt, tb[0] * dt),
                    _ => (Vector4::new(0.0, 0.0, 0.0, 0.0), Vector4::new(0.0, 0.0, 0.0, 0.0)),
                };
                let t2 = factor * factor;
                let t3 = t2 * factor;
                let value = a * (2.0 * t3 - 3.0 * t2 + 1.0)
                    + out_a * (t3 - 2.0 * t2 + factor)
                    + b * (-2.0 * t3 + 3.0 * t2)
                    + in_b * (t3 - t2);
                match path {
                    Path::Rotation => value.normalize(),
                    Path::Translation | Path::Scale => value,
                }
            }
        };
        Some(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Channel {
    pub sampler: usize,
    pub joint: usize,
    pub path: Path,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Animation {
    pub name: String,
    pub first_key_time: f32,
    pub last_key_time: f32,
    pub samplers: Vec<Sampler>,
    pub channels: Vec<Channel>,
}

impl Animation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            first_key_time: 0.0,
            last_key_time: 0.0,
            samplers: Vec::new(),
            channels: Vec::new(),
        }
    }

    pub fn duration(&self) -> f32 {
        self.last_key_time - self.first_key_time
    }

    /// Sets first/last key time to the bounds of all sampler timestamps.
    pub fn update_bounds(&mut self) {
        let mut first = f32::MAX;
        let mut last = f32::MIN;
        for sampler in &self.samplers {
            if let (Some(f), Some(l)) = (sampler.first_time(), sampler.last_time()) {
                first = first.min(f);
                last = last.max(l);
            }
        }
        if first <= last {
            self.first_key_time = first;
            self.last_key_time = last;
        } else {
            self.first_key_time = 0.0;
            self.last_key_time = 0.0;
        }
    }

    /// Timestamps ascending in every sampler, key times bounding them.
    pub fn is_well_formed(&self) -> bool {
        self.first_key_time <= self.last_key_time
            && self.samplers.iter().all(|sampler| {
                sampler.is_sorted()
                    && sampler.timestamps.iter().all(|&t| {
                        t >= self.first_key_time && t <= self.last_key_time
                    })
            })
            && self
                .channels
                .iter()
                .all(|channel| channel.sampler < self.samplers.len())
    }

    /// Poses `skeleton` at `time` seconds. Joints no channel touches keep their current pose.
    pub fn apply(&self, time: f32, skeleton: &mut Skeleton) {
        for channel in &self.channels {
            let Some(sampler) = self.samplers.get(channel.sampler) else {
                continue;
            };
            let Some(joint) = skeleton.joints.get_mut(channel.joint) else {
                continue;
            };
            let Some(value) = sampler.sample(time, channel.path) else {
                continue;
            };
            match channel.path {
                Path::Translation => joint.pose.position = value.truncate(),
                Path::Rotation => joint.pose.rotation = to_quaternion(value).normalize(),
                Path::Scale => joint.pose.scale = Vector3::new(value.x, value.y, value.z),
            }
        }
    }
}

/**
 * The skeleton and animations of an asset with skinned meshes.
 *
 * Shared by the skinned game objects of the first instance through their
 * [`AnimationComponent`]. Later instances follow the same pose through the
 * instance tag of those objects.
 */
#[derive(Clone, Debug, Default)]
pub struct SkeletalAnimation {
    pub skeleton: Skeleton,
    pub animations: Vec<Animation>,
}

impl SkeletalAnimation {
    pub fn animation(&self, name: &str) -> Option<&Animation> {
        self.animations.iter().find(|anim| anim.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.animations.iter().map(|anim| anim.name.as_str())
    }

    /**
     * Evaluates animation `index` at `time` (seconds from its first keyframe,
     * wrapped to its duration), recomputes the final joint matrices and
     * writes them to the joint buffer.
     */
    pub fn evaluate(&mut self, index: usize, time: f32, backend: &dyn GpuBackend) -> anyhow::Result<()> {
        let Some(animation) = self.animations.get(index) else {
            anyhow::bail!("animation {index} does not exist");
        };
        let duration = animation.duration();
        let local = if duration > 0.0 { time.rem_euclid(duration) } else { 0.0 };
        animation.apply(animation.first_key_time + local, &mut self.skeleton);
        self.skeleton.update_final_matrices();
        self.skeleton.upload(backend)
    }

    /// Bind pose for every joint.
    pub fn rest(&mut self, backend: &dyn GpuBackend) -> anyhow::Result<()> {
        self.skeleton.reset_pose();
        self.skeleton.update_final_matrices();
        self.skeleton.upload(backend)
    }
}

/// Attached to each skinned game object of the first instance. They all share
/// one skeleton and its joint buffer.
#[derive(Clone, Debug)]
pub struct AnimationComponent {
    pub animation: std::sync::Arc<std::sync::Mutex<SkeletalAnimation>>,
}

#[cfg(test)]
mod tests {
    use cgmath::{Deg, Rotation3};

    use super::*;
    use crate::data_structures::{instance::Transform, skeleton::Joint};

    fn translation_sampler(interpolation: Interpolation) -> Sampler {
        Sampler::new(
            interpolation,
            vec![0.0, 1.0],
            vec![vec3_output([0.0, 0.0, 0.0]), vec3_output([1.0, 0.0, 0.0])],
        )
    }

    #[test]
    fn linear_and_step_sampling() {
        let linear = translation_sampler(Interpolation::Linear);
        let step = translation_sampler(Interpolation::Step);
        assert_eq!(linear.sample(0.25, Path::Translation).map(|v| v.x), Some(0.25));
        assert_eq!(step.sample(0.75, Path::Translation).map(|v| v.x), Some(0.0));
        // clamped outside the key range
        assert_eq!(linear.sample(-1.0, Path::Translation).map(|v| v.x), Some(0.0));
        assert_eq!(linear.sample(5.0, Path::Translation).map(|v| v.x), Some(1.0));
    }

    #[test]
    fn rotations_are_slerped() {
        let a = Quaternion::from_angle_y(Deg(0.0));
        let b = Quaternion::from_angle_y(Deg(90.0));
        let sampler = Sampler::new(
            Interpolation::Linear,
            vec![0.0, 1.0],
            vec![from_quaternion(a), from_quaternion(b)],
        );
        let half = sampler.sample(0.5, Path::Rotation).map(to_quaternion);
        let expected = Quaternion::from_angle_y(Deg(45.0));
        let half = half.expect("sample");
        assert!((half.s - expected.s).abs() < 1e-5);
        assert!((half.v.y - expected.v.y).abs() < 1e-5);
    }

    #[test]
    fn cubic_spline_hits_keyframes() {
        let zero = Vector4::new(0.0, 0.0, 0.0, 0.0);
        let sampler = Sampler::cubic_from_triplets(
            vec![0.0, 2.0],
            vec![zero, vec3_output([1.0, 0.0, 0.0]), zero, zero, vec3_output([3.0, 0.0, 0.0]), zero],
        );
        assert_eq!(sampler.outputs.len(), 2);
        assert_eq!(sampler.sample(0.0, Path::Translation).map(|v| v.x), Some(1.0));
        let mid = sampler.sample(1.0, Path::Translation).map(|v| v.x).expect("sample");
        assert!((mid - 2.0).abs() < 1e-5);
    }

    #[test]
    fn apply_and_final_matrices() {
        let mut skeleton = Skeleton::default();
        skeleton.push_joint(0, Joint::new("root", cgmath::Matrix4::from_translation(Vector3::new(0.0, -1.0, 0.0)), Transform::default()));
        let mut animation = Animation::new("Walk");
        animation.samplers.push(translation_sampler(Interpolation::Linear));
        animation.channels.push(Channel {
            sampler: 0,
            joint: 0,
            path: Path::Translation,
        });
        animation.update_bounds();
        assert!(animation.is_well_formed());

        animation.apply(1.0, &mut skeleton);
        skeleton.update_final_matrices();
        let m = skeleton.final_matrices[0];
        assert_eq!(m.w.x, 1.0);
        assert_eq!(m.w.y, -1.0);
    }
}
