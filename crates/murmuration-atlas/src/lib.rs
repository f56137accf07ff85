//! Keyframed-mesh input and the animation atlas baker.
//!
//! A loaded model arrives as a base mesh plus an ordered list of per-vertex
//! displacement keyframes. Baking resamples those keyframes at a fixed tick
//! rate into a 2D float image indexed by `(vertex, time)`, so the composer
//! can pose thousands of bodies per frame with one texture lookup each
//! instead of re-evaluating the deformation.

use glam::{Vec3, Vec4};
use murmuration_grid::{GridError, TexelGrid};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Fixed resampling rate of the baked animation, in ticks per second.
pub const TICK_RATE: f32 = 60.0;

/// Errors raised while validating or baking a keyframed mesh.
#[derive(Debug, Error)]
pub enum AssetError {
    /// The model carries no displacement keyframes; it cannot animate.
    #[error("mesh has no displacement keyframes")]
    MissingDisplacements,
    /// The base mesh has no vertices.
    #[error("mesh has no vertices")]
    EmptyMesh,
    /// The nominal duration does not round to at least one tick.
    #[error("animation duration {0}s is too short to bake at {TICK_RATE} Hz")]
    InvalidDuration(f32),
    /// A keyframe disagrees with the base mesh about the vertex count.
    #[error("keyframe {index} carries {actual} displacements, mesh has {expected} vertices")]
    MismatchedKeyframe {
        index: usize,
        expected: usize,
        actual: usize,
    },
    /// A triangle index points past the vertex list.
    #[error("triangle index {index} out of range for {vertex_count} vertices")]
    IndexOutOfRange { index: u32, vertex_count: usize },
    /// The optional color attribute disagrees with the vertex count.
    #[error("vertex colors carry {actual} entries, mesh has {expected} vertices")]
    MismatchedColors { expected: usize, actual: usize },
    /// Backing image allocation failed.
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// An animated-mesh asset, already decoded by an external loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyframedMesh {
    /// Rest-pose vertex positions.
    pub positions: Vec<Vec3>,
    /// Triangle index list into `positions`.
    pub indices: Vec<u32>,
    /// Optional per-vertex colors, same length as `positions`.
    pub colors: Option<Vec<Vec3>>,
    /// Ordered displacement keyframes; each holds one offset per vertex.
    pub keyframes: Vec<Vec<Vec3>>,
    /// Nominal duration of one animation cycle, in seconds.
    pub duration_seconds: f32,
}

impl KeyframedMesh {
    /// Number of vertices in the base mesh.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Check structural consistency of the asset.
    pub fn validate(&self) -> Result<(), AssetError> {
        if self.keyframes.is_empty() {
            return Err(AssetError::MissingDisplacements);
        }
        if self.positions.is_empty() {
            return Err(AssetError::EmptyMesh);
        }
        let expected = self.positions.len();
        for (index, frame) in self.keyframes.iter().enumerate() {
            if frame.len() != expected {
                return Err(AssetError::MismatchedKeyframe {
                    index,
                    expected,
                    actual: frame.len(),
                });
            }
        }
        for &index in &self.indices {
            if index as usize >= expected {
                return Err(AssetError::IndexOutOfRange {
                    index,
                    vertex_count: expected,
                });
            }
        }
        if let Some(colors) = &self.colors
            && colors.len() != expected
        {
            return Err(AssetError::MismatchedColors {
                expected,
                actual: colors.len(),
            });
        }
        Ok(())
    }
}

/// A baked animation: per-vertex displacement resampled over time.
///
/// Texel `(x, y)` holds the offset of vertex `x` at tick `y`, blended
/// between the two bracketing keyframes, with 1.0 in the alpha channel.
/// Built once per loaded model and immutable afterward; switching the active
/// model means baking a fresh atlas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimationAtlas {
    texels: TexelGrid,
    duration_ticks: u32,
}

impl AnimationAtlas {
    /// Bake `mesh` into an atlas.
    ///
    /// Image dimensions are the next powers of two covering the vertex count
    /// and the tick count. Rows at or past `duration_ticks` stay zero and
    /// are never reached by sampling; columns past the vertex count likewise
    /// stay zero for every row.
    pub fn bake(mesh: &KeyframedMesh) -> Result<Self, AssetError> {
        mesh.validate()?;

        let duration_ticks = (mesh.duration_seconds * TICK_RATE).round() as i64;
        if duration_ticks < 1 {
            return Err(AssetError::InvalidDuration(mesh.duration_seconds));
        }
        let duration_ticks = duration_ticks as u32;

        let vertex_count = mesh.vertex_count();
        let frame_count = mesh.keyframes.len();
        let width = (vertex_count as u32).next_power_of_two();
        let height = duration_ticks.next_power_of_two();

        let mut texels = TexelGrid::zeroed(width, height)?;
        for y in 0..duration_ticks {
            let p = y as f32 / duration_ticks as f32 * frame_count as f32;
            let cur = (p.floor() as usize).min(frame_count - 1);
            let next = (cur + 1) % frame_count;
            let t = p.fract();
            for x in 0..vertex_count {
                let blended = mesh.keyframes[cur][x].lerp(mesh.keyframes[next][x], t);
                texels.set_texel(x as u32, y, blended.extend(1.0));
            }
        }

        info!(
            width,
            height, duration_ticks, frame_count, vertex_count, "baked animation atlas"
        );
        Ok(Self {
            texels,
            duration_ticks,
        })
    }

    /// Atlas width in texels (vertex axis).
    #[must_use]
    pub fn width(&self) -> u32 {
        self.texels.width()
    }

    /// Atlas height in texels (time axis).
    #[must_use]
    pub fn height(&self) -> u32 {
        self.texels.height()
    }

    /// Animation length in ticks.
    #[must_use]
    pub const fn duration_ticks(&self) -> u32 {
        self.duration_ticks
    }

    /// Normalized period of the time axis: `duration_ticks / height`.
    ///
    /// Sampling wraps `v` modulo this period, so only baked rows are ever
    /// read and `sample(u, v) == sample(u, v + wrap_period())` for all `v`.
    #[must_use]
    pub fn wrap_period(&self) -> f32 {
        self.duration_ticks as f32 / self.texels.height() as f32
    }

    /// Raw texel access, for inspection and tests.
    #[must_use]
    pub fn texel(&self, x: u32, y: u32) -> Vec4 {
        self.texels.texel(x, y)
    }

    /// Sample the displacement for normalized coordinates `(u, v)`.
    ///
    /// `u` addresses the vertex axis with repeat wrap; `v` addresses time
    /// and wraps modulo `wrap_period()`.
    #[must_use]
    pub fn sample_uv(&self, u: f32, v: f32) -> Vec3 {
        let period = self.wrap_period();
        let v = if v.is_finite() { v.rem_euclid(period) } else { 0.0 };
        self.texels.sample_uv(u, v).truncate()
    }
}
