//! Flocking compute engine, agent state store, and instance composer.
//!
//! The simulation keeps one agent per texel of a `W×W` grid. Each tick runs
//! two data-parallel passes over the whole population: a velocity pass that
//! applies the flocking rules against the previous tick's buffers, and a
//! position pass that integrates the freshly written velocities. Both state
//! fields are double-buffered so a pass never reads the buffer it writes.
//! The composer turns agent state plus a baked animation atlas into
//! world-space instance vertices for an external renderer.

use std::collections::VecDeque;
use std::fmt;

use glam::{Mat3, Vec3, Vec4};
use murmuration_atlas::AnimationAtlas;
use murmuration_grid::{PingPong, TexelGrid};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Default edge length of the world cube, in world units.
pub const DEFAULT_BOUNDS: f32 = 800.0;

/// Default simulation grid width; the population is its square.
pub const DEFAULT_TEXTURE_WIDTH: u32 = 64;

/// Upper clamp for a single tick's time step, in seconds. A stalled host
/// (backgrounded tab, debugger pause) must not produce an explosive
/// integration step when it resumes.
pub const MAX_DT: f32 = 1.0;

/// Predator rest position: far enough away that no avoidance rule can fire.
pub const PREDATOR_SENTINEL: Vec3 = Vec3::new(10_000.0, 10_000.0, 0.0);

// Fixed rule gains; the public parameters weight them.
const SEPARATION_GAIN: f32 = 30.0;
const ALIGNMENT_GAIN: f32 = 4.0;
const COHESION_GAIN: f32 = 2.0;
const CONTAIN_STIFFNESS: f32 = 0.1;
const CONTAIN_STIFFNESS_OUT: f32 = 0.5;
const CONTAIN_DAMPING: f32 = 2.0;

/// Ticks between two applications of the centripetal impulse to one agent.
const CENTRIPETAL_PERIOD: u64 = 16;

/// Ticks between flock epochs, at which impulse seeds are re-drawn.
const FLOCK_EPOCH_TICKS: u64 = 600;

/// Monotonic simulation tick counter.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// The zero tick.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// The following tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Errors that can occur when constructing world state.
#[derive(Debug, Error)]
pub enum WorldStateError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Backing texel storage could not be allocated.
    #[error(transparent)]
    Grid(#[from] murmuration_grid::GridError),
}

/// Errors produced by the control surface.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The knob name matches no tunable.
    #[error("unknown knob: {0}")]
    UnknownKnob(String),
    /// The submitted value is NaN or infinite.
    #[error("knob {0} requires a finite value")]
    NonFinite(&'static str),
}

/// Static configuration fixed for the lifetime of a world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlockConfig {
    /// Simulation grid width `W`; the world holds `W²` agents.
    pub texture_width: u32,
    /// Edge length of the world cube centred on the origin.
    pub bounds: f32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Maximum number of tick summaries retained in-memory.
    pub history_capacity: usize,
}

impl Default for FlockConfig {
    fn default() -> Self {
        Self {
            texture_width: DEFAULT_TEXTURE_WIDTH,
            bounds: DEFAULT_BOUNDS,
            rng_seed: None,
            history_capacity: 256,
        }
    }
}

impl FlockConfig {
    fn validate(&self) -> Result<(), WorldStateError> {
        if self.texture_width == 0 {
            return Err(WorldStateError::InvalidConfig(
                "texture_width must be non-zero",
            ));
        }
        if !self.bounds.is_finite() || self.bounds <= 0.0 {
            return Err(WorldStateError::InvalidConfig("bounds must be positive"));
        }
        if self.history_capacity == 0 {
            return Err(WorldStateError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Number of agents implied by the grid width.
    #[must_use]
    pub const fn agent_count(&self) -> usize {
        (self.texture_width as usize) * (self.texture_width as usize)
    }

    /// Returns the configured RNG, seeded from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        }
    }
}

/// Live-tunable simulation parameters.
///
/// Every field is safe to change between ticks; malformed values are clamped
/// rather than rejected so the simulation stays tunable mid-flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlockParams {
    /// Zone radius of the separation rule.
    pub separation_distance: f32,
    /// Zone radius of the alignment rule.
    pub alignment_distance: f32,
    /// Zone radius of the cohesion rule.
    pub cohesion_distance: f32,
    /// Soft-containment strength pulling strays back toward the center.
    pub freedom_factor: f32,
    /// Velocity magnitude cap.
    pub speed_limit: f32,
    /// Forward-speed multiplier applied during position integration.
    pub speed_scale: f32,
    /// Strength of the periodic re-bias toward the flock's mean heading.
    pub centripetal: f32,
    /// Radius of the strong predator repulsion.
    pub avoidance_radius: f32,
    /// Scale of the strong predator repulsion.
    pub avoidance_strength: f32,
    /// Radius of the milder flee response; larger than `avoidance_radius`.
    pub flee_radius: f32,
    /// Scale of the flee response; also the temporary speed-cap raise.
    pub flee_speed: f32,
    /// Damping applied to the vertical component of the flee response.
    pub z_flee: f32,
    /// Predator world position; the sentinel keeps it inert.
    pub predator: Vec3,
    /// Draw-range cutoff: how many agents the composer emits. Agents past
    /// the cutoff still simulate.
    pub active_count: usize,
    /// Body scale, jittered per agent by its seed.
    pub size: f32,
}

impl Default for FlockParams {
    fn default() -> Self {
        Self {
            separation_distance: 20.0,
            alignment_distance: 20.0,
            cohesion_distance: 20.0,
            freedom_factor: 0.75,
            speed_limit: 9.0,
            speed_scale: 15.0,
            centripetal: 0.5,
            avoidance_radius: 50.0,
            avoidance_strength: 100.0,
            flee_radius: 150.0,
            flee_speed: 5.0,
            z_flee: 0.3,
            predator: PREDATOR_SENTINEL,
            active_count: (DEFAULT_TEXTURE_WIDTH as usize).pow(2) / 4,
            size: 0.1,
        }
    }
}

impl FlockParams {
    /// Clamp every field into its valid range, logging each correction.
    #[must_use]
    pub fn sanitized(mut self, agent_count: usize) -> Self {
        let clamp_non_negative = |name: &'static str, value: &mut f32| {
            if !(*value >= 0.0) {
                warn!(knob = name, value = *value, "parameter out of range; clamped to 0");
                *value = 0.0;
            }
        };
        clamp_non_negative("separation", &mut self.separation_distance);
        clamp_non_negative("alignment", &mut self.alignment_distance);
        clamp_non_negative("cohesion", &mut self.cohesion_distance);
        clamp_non_negative("freedom", &mut self.freedom_factor);
        clamp_non_negative("speed", &mut self.speed_limit);
        clamp_non_negative("speed_scale", &mut self.speed_scale);
        clamp_non_negative("centripetal", &mut self.centripetal);
        clamp_non_negative("avoidance_radius", &mut self.avoidance_radius);
        clamp_non_negative("avoidance_strength", &mut self.avoidance_strength);
        clamp_non_negative("flee_radius", &mut self.flee_radius);
        clamp_non_negative("flee_speed", &mut self.flee_speed);
        clamp_non_negative("size", &mut self.size);
        if !(0.0..=1.0).contains(&self.z_flee) {
            warn!(value = self.z_flee, "z_flee out of range; clamped to [0, 1]");
            self.z_flee = self.z_flee.clamp(0.0, 1.0);
        }
        if !self.predator.is_finite() {
            warn!("predator position not finite; reset to sentinel");
            self.predator = PREDATOR_SENTINEL;
        }
        if self.active_count > agent_count {
            self.active_count = agent_count;
        }
        self
    }
}

/// Descriptor for one externally tunable parameter.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct KnobDescriptor {
    /// Stable knob name.
    pub name: &'static str,
    /// Minimum accepted value.
    pub min: f32,
    /// Maximum accepted value.
    pub max: f32,
    /// Suggested widget step.
    pub step: f32,
}

fn knob_descriptors(agent_count: usize) -> Vec<KnobDescriptor> {
    let knob = |name, min, max, step| KnobDescriptor { name, min, max, step };
    vec![
        knob("separation", 0.0, 100.0, 1.0),
        knob("alignment", 0.0, 100.0, 0.001),
        knob("cohesion", 0.0, 100.0, 0.025),
        knob("freedom", 0.0, 2.0, 0.01),
        knob("speed", 0.0, 20.0, 0.1),
        knob("speed_scale", 0.0, 30.0, 0.5),
        knob("centripetal", 0.0, 1.0, 0.01),
        knob("avoidance_radius", 0.0, 400.0, 1.0),
        knob("avoidance_strength", 0.0, 200.0, 1.0),
        knob("flee_radius", 0.0, 400.0, 1.0),
        knob("flee_speed", 0.0, 20.0, 0.1),
        knob("z_flee", 0.0, 1.0, 0.01),
        knob("size", 0.0, 1.0, 0.01),
        knob("count", 0.0, agent_count as f32, 1.0),
    ]
}

/// A knob paired with its current value, for table-driven control widgets.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct KnobEntry {
    /// Name and declared range.
    pub descriptor: KnobDescriptor,
    /// Value in force for the current tick.
    pub value: f32,
}

fn knob_value(params: &FlockParams, name: &str) -> Option<f32> {
    Some(match name {
        "separation" => params.separation_distance,
        "alignment" => params.alignment_distance,
        "cohesion" => params.cohesion_distance,
        "freedom" => params.freedom_factor,
        "speed" => params.speed_limit,
        "speed_scale" => params.speed_scale,
        "centripetal" => params.centripetal,
        "avoidance_radius" => params.avoidance_radius,
        "avoidance_strength" => params.avoidance_strength,
        "flee_radius" => params.flee_radius,
        "flee_speed" => params.flee_speed,
        "z_flee" => params.z_flee,
        "size" => params.size,
        "count" => params.active_count as f32,
        _ => return None,
    })
}

/// Staged parameter edits, applied atomically at the top of the next tick.
#[derive(Debug, Clone)]
struct ControlSurface {
    staged: FlockParams,
    dirty: bool,
}

impl ControlSurface {
    fn new(params: FlockParams) -> Self {
        Self {
            staged: params,
            dirty: false,
        }
    }

    fn set(&mut self, descriptor: &KnobDescriptor, value: f32) -> f32 {
        let applied = if (descriptor.min..=descriptor.max).contains(&value) {
            value
        } else {
            let clamped = value.clamp(descriptor.min, descriptor.max);
            warn!(
                knob = descriptor.name,
                value, clamped, "knob value out of range; clamped"
            );
            clamped
        };
        let target = match descriptor.name {
            "separation" => &mut self.staged.separation_distance,
            "alignment" => &mut self.staged.alignment_distance,
            "cohesion" => &mut self.staged.cohesion_distance,
            "freedom" => &mut self.staged.freedom_factor,
            "speed" => &mut self.staged.speed_limit,
            "speed_scale" => &mut self.staged.speed_scale,
            "centripetal" => &mut self.staged.centripetal,
            "avoidance_radius" => &mut self.staged.avoidance_radius,
            "avoidance_strength" => &mut self.staged.avoidance_strength,
            "flee_radius" => &mut self.staged.flee_radius,
            "flee_speed" => &mut self.staged.flee_speed,
            "z_flee" => &mut self.staged.z_flee,
            "size" => &mut self.staged.size,
            "count" => {
                let count = applied.round() as usize;
                if self.staged.active_count != count {
                    self.staged.active_count = count;
                    self.dirty = true;
                }
                return applied;
            }
            _ => unreachable!("descriptor table and knob match must agree"),
        };
        if *target != applied {
            *target = applied;
            self.dirty = true;
        }
        applied
    }
}

/// Per-agent random values, fixed at spawn apart from the impulse seed.
///
/// `flock_seed` staggers animation phase, `rand_a` jitters body size, and
/// `rand_b` phases the centripetal impulse and is re-drawn at each flock
/// epoch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentSeed {
    /// The agent's texel index.
    pub bird_index: u32,
    /// Animation-phase seed in `[0, 1)`.
    pub flock_seed: f32,
    /// Body-size jitter in `[0, 1)`.
    pub rand_a: f32,
    /// Impulse-phase seed in `[0, 1)`; re-drawn each flock epoch.
    pub rand_b: f32,
}

impl AgentSeed {
    fn random(bird_index: u32, rng: &mut SmallRng) -> Self {
        Self {
            bird_index,
            flock_seed: rng.random(),
            rand_a: rng.random(),
            rand_b: rng.random(),
        }
    }

    /// Tick phase at which this agent receives its centripetal impulse.
    #[must_use]
    fn impulse_phase(&self) -> u64 {
        (self.rand_b * CENTRIPETAL_PERIOD as f32) as u64 % CENTRIPETAL_PERIOD
    }
}

/// Maps an agent to its state-store texel and its atlas wrap period.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentReference {
    /// Normalized texel column in the state store.
    pub u: f32,
    /// Normalized texel row in the state store.
    pub v: f32,
    /// Normalized atlas time period for this agent's body animation.
    pub wrap_period: f32,
}

impl AgentReference {
    fn for_agent(id: usize, width: u32, wrap_period: f32) -> Self {
        let w = width as usize;
        Self {
            u: (id % w) as f32 / width as f32,
            v: (id / w) as f32 / width as f32,
            wrap_period,
        }
    }
}

/// Double-buffered position and velocity fields, one agent per texel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateStore {
    positions: PingPong,
    velocities: PingPong,
    width: u32,
}

impl AgentStateStore {
    /// Scatter agents uniformly through the world cube with random drift.
    ///
    /// Positions draw per-axis from `[-bounds/2, bounds/2]`; velocities draw
    /// per-axis from `[-5, 5]`. The w channel is the constant 1.0 the data
    /// textures carry.
    pub fn random(width: u32, bounds: f32, rng: &mut SmallRng) -> Result<Self, WorldStateError> {
        let half = bounds / 2.0;
        let positions = TexelGrid::from_fn(width, width, |_, _| {
            Vec4::new(
                rng.random_range(-half..half),
                rng.random_range(-half..half),
                rng.random_range(-half..half),
                1.0,
            )
        })?;
        let mut rng_vel = |_: u32, _: u32| {
            Vec4::new(
                (rng.random::<f32>() - 0.5) * 10.0,
                (rng.random::<f32>() - 0.5) * 10.0,
                (rng.random::<f32>() - 0.5) * 10.0,
                1.0,
            )
        };
        let velocities = TexelGrid::from_fn(width, width, &mut rng_vel)?;
        Ok(Self {
            positions: PingPong::new(positions),
            velocities: PingPong::new(velocities),
            width,
        })
    }

    /// Simulation grid width.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Number of agents stored.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.positions.front().len()
    }

    /// Current readable position field.
    #[must_use]
    pub fn positions(&self) -> &TexelGrid {
        self.positions.front()
    }

    /// Current readable velocity field.
    #[must_use]
    pub fn velocities(&self) -> &TexelGrid {
        self.velocities.front()
    }

    /// Mutable access to the position pair, for seeding scenarios.
    #[must_use]
    pub fn positions_mut(&mut self) -> &mut PingPong {
        &mut self.positions
    }

    /// Mutable access to the velocity pair, for seeding scenarios.
    #[must_use]
    pub fn velocities_mut(&mut self) -> &mut PingPong {
        &mut self.velocities
    }
}

/// Velocity pass: apply the flocking rules to every agent.
///
/// Pure function of the previous tick's buffers; agents are processed in
/// parallel and only ever read previous-tick state, so the result is
/// independent of scheduling. Returns the next velocity field in row-major
/// texel order.
#[must_use]
pub fn velocity_pass(
    positions: &TexelGrid,
    velocities: &TexelGrid,
    seeds: &[AgentSeed],
    params: &FlockParams,
    bounds: f32,
    dt: f32,
    tick: Tick,
) -> Vec<Vec4> {
    let n = positions.len();
    debug_assert_eq!(n, seeds.len());
    debug_assert_eq!(n, velocities.len());
    let mean_velocity: Vec3 =
        velocities.texels().iter().map(|t| t.truncate()).sum::<Vec3>() / n.max(1) as f32;
    let mean_heading = mean_velocity.try_normalize();

    (0..n)
        .into_par_iter()
        .map(|idx| {
            steer(
                idx,
                positions,
                velocities,
                &seeds[idx],
                mean_heading,
                params,
                bounds,
                dt,
                tick,
            )
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn steer(
    idx: usize,
    positions: &TexelGrid,
    velocities: &TexelGrid,
    seed: &AgentSeed,
    mean_heading: Option<Vec3>,
    params: &FlockParams,
    bounds: f32,
    dt: f32,
    tick: Tick,
) -> Vec4 {
    let self_position = positions.texels()[idx].truncate();
    let self_velocity = velocities.texels()[idx].truncate();
    let mut velocity = self_velocity;
    let mut limit = params.speed_limit;

    // Predator: strong repulsion up close, milder flee further out. An agent
    // sitting exactly on the predator steers along a fixed fallback axis.
    let from_predator = self_position - params.predator;
    let predator_distance = from_predator.length();
    if predator_distance < params.flee_radius || predator_distance < params.avoidance_radius {
        let away = from_predator.try_normalize().unwrap_or(Vec3::X);
        if predator_distance < params.avoidance_radius {
            let falloff = 1.0
                - (predator_distance * predator_distance)
                    / (params.avoidance_radius * params.avoidance_radius);
            velocity += away * params.avoidance_strength * falloff * dt;
            limit += params.flee_speed;
        }
        if predator_distance < params.flee_radius {
            let falloff = 1.0 - predator_distance / params.flee_radius;
            let mut flee = away;
            flee.z *= params.z_flee;
            velocity += flee * params.flee_speed * falloff * dt;
        }
    }

    // Soft containment: a damped spring toward the origin, stiffer once the
    // agent leaves the world cube. Never a positional clamp.
    let half = bounds / 2.0;
    let outside = self_position.abs().cmpgt(Vec3::splat(half)).any();
    let stiffness = if outside {
        CONTAIN_STIFFNESS_OUT
    } else {
        CONTAIN_STIFFNESS
    };
    velocity -= self_position * (params.freedom_factor * stiffness * dt);
    velocity /= 1.0 + params.freedom_factor * CONTAIN_DAMPING * dt;

    // Centripetal impulse: on this agent's tick phase, pull its heading
    // toward the flock's mean heading without changing its speed.
    if params.centripetal > 0.0
        && let Some(heading) = mean_heading
        && tick.0 % CENTRIPETAL_PERIOD == seed.impulse_phase()
    {
        let target = heading * velocity.length();
        velocity += (target - velocity) * params.centripetal;
    }

    // Neighbor rules over the full population.
    let mut separation = Vec3::ZERO;
    let mut alignment_sum = Vec3::ZERO;
    let mut alignment_count = 0u32;
    let mut cohesion_sum = Vec3::ZERO;
    let mut cohesion_count = 0u32;
    for (other_idx, other) in positions.texels().iter().enumerate() {
        if other_idx == idx {
            continue;
        }
        let other_position = other.truncate();
        let offset = self_position - other_position;
        let distance = offset.length();
        if distance < 1.0e-4 {
            continue;
        }
        if distance < params.separation_distance {
            // Normalized repulsion weighted by inverse distance.
            separation += offset / (distance * distance);
        }
        if distance < params.alignment_distance {
            alignment_sum += velocities.texels()[other_idx].truncate();
            alignment_count += 1;
        }
        if distance < params.cohesion_distance {
            cohesion_sum += other_position;
            cohesion_count += 1;
        }
    }
    velocity += separation * SEPARATION_GAIN * dt;
    if alignment_count > 0 {
        let average = alignment_sum / alignment_count as f32;
        velocity += (average - self_velocity) * ALIGNMENT_GAIN * dt;
    }
    if cohesion_count > 0 {
        let centroid = cohesion_sum / cohesion_count as f32;
        if let Some(toward) = (centroid - self_position).try_normalize() {
            velocity += toward * COHESION_GAIN * dt;
        }
    }

    // A non-finite result stays confined to this agent: drop its velocity
    // instead of letting NaN spread through next tick's neighbor scans.
    if !velocity.is_finite() {
        velocity = Vec3::ZERO;
    }
    let speed = velocity.length();
    if speed > limit {
        velocity = velocity / speed * limit;
    }
    velocity.extend(1.0)
}

/// Position pass: integrate freshly written velocities.
///
/// Reads the velocity field produced by this tick's velocity pass and the
/// previous position field; the velocity pass has fully completed by the
/// time this runs.
#[must_use]
pub fn position_pass(
    positions: &TexelGrid,
    velocities: &TexelGrid,
    speed_scale: f32,
    dt: f32,
) -> Vec<Vec4> {
    positions
        .texels()
        .par_iter()
        .zip(velocities.texels().par_iter())
        .map(|(position, velocity)| {
            (position.truncate() + velocity.truncate() * speed_scale * dt).extend(1.0)
        })
        .collect()
}

/// Per-tick digest of the population, retained in a bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    /// Tick this summary describes.
    pub tick: Tick,
    /// Mean velocity magnitude across the population.
    pub mean_speed: f32,
    /// Largest velocity magnitude across the population.
    pub max_speed: f32,
    /// Mean distance from the world center.
    pub mean_center_distance: f32,
    /// Draw-range cutoff in force during the tick.
    pub active_count: usize,
}

/// One flock simulation: configuration, parameters, and double-buffered
/// agent state. Multiple worlds can coexist; nothing is process-global.
pub struct FlockWorld {
    config: FlockConfig,
    params: FlockParams,
    controls: ControlSurface,
    state: AgentStateStore,
    seeds: Vec<AgentSeed>,
    references: Vec<AgentReference>,
    rng: SmallRng,
    tick: Tick,
    sim_time: f64,
    pending_predator: Option<Vec3>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for FlockWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlockWorld")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("agent_count", &self.agent_count())
            .finish()
    }
}

impl FlockWorld {
    /// Instantiate a world against a baked atlas.
    pub fn new(config: FlockConfig, atlas: &AnimationAtlas) -> Result<Self, WorldStateError> {
        config.validate()?;
        let mut rng = config.seeded_rng();
        let state = AgentStateStore::random(config.texture_width, config.bounds, &mut rng)?;
        let n = config.agent_count();
        let seeds: Vec<AgentSeed> = (0..n)
            .map(|id| AgentSeed::random(id as u32, &mut rng))
            .collect();
        let wrap_period = atlas.wrap_period();
        let references: Vec<AgentReference> = (0..n)
            .map(|id| AgentReference::for_agent(id, config.texture_width, wrap_period))
            .collect();
        let params = FlockParams::default().sanitized(n);
        let history_capacity = config.history_capacity;
        Ok(Self {
            controls: ControlSurface::new(params.clone()),
            params,
            state,
            seeds,
            references,
            rng,
            tick: Tick::zero(),
            sim_time: 0.0,
            pending_predator: None,
            history: VecDeque::with_capacity(history_capacity),
            config,
        })
    }

    /// Point agents at a freshly baked atlas after a model switch.
    ///
    /// Only the wrap period changes; texel assignments are fixed for life.
    pub fn rebind_atlas(&mut self, atlas: &AnimationAtlas) {
        let wrap_period = atlas.wrap_period();
        for reference in &mut self.references {
            reference.wrap_period = wrap_period;
        }
    }

    /// Advance the simulation by one tick of at most [`MAX_DT`] seconds.
    pub fn step(&mut self, dt: f32) -> TickSummary {
        let dt = if dt.is_finite() {
            dt.clamp(0.0, MAX_DT)
        } else {
            0.0
        };
        self.stage_apply_controls();
        self.stage_epoch_reseed();
        let next_tick = self.tick.next();

        // Velocity pass: read both previous buffers, fill the velocity back
        // buffer, then swap. The collect inside the pass is the barrier: no
        // agent's position integrates until every velocity is written.
        let next_velocities = velocity_pass(
            self.state.positions.front(),
            self.state.velocities.front(),
            &self.seeds,
            &self.params,
            self.config.bounds,
            dt,
            next_tick,
        );
        self.state
            .velocities
            .back_mut()
            .texels_mut()
            .copy_from_slice(&next_velocities);
        self.state.velocities.swap();

        // Position pass: new velocities, previous positions.
        let next_positions = position_pass(
            self.state.positions.front(),
            self.state.velocities.front(),
            self.params.speed_scale,
            dt,
        );
        self.state
            .positions
            .back_mut()
            .texels_mut()
            .copy_from_slice(&next_positions);
        self.state.positions.swap();

        self.tick = next_tick;
        self.sim_time += f64::from(dt);
        self.stage_reset_predator();

        let summary = self.summarize();
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
        summary
    }

    fn stage_apply_controls(&mut self) {
        if let Some(position) = self.pending_predator.take() {
            self.controls.staged.predator = position;
            self.controls.dirty = true;
        } else if self.controls.staged.predator != PREDATOR_SENTINEL {
            // Input went idle; let the predator influence decay to inert.
            self.controls.staged.predator = PREDATOR_SENTINEL;
            self.controls.dirty = true;
        }
        if self.controls.dirty {
            self.params = self.controls.staged.clone().sanitized(self.agent_count());
            self.controls.staged = self.params.clone();
            self.controls.dirty = false;
        }
    }

    fn stage_epoch_reseed(&mut self) {
        if self.tick.0 > 0 && self.tick.0.is_multiple_of(FLOCK_EPOCH_TICKS) {
            for seed in &mut self.seeds {
                seed.rand_b = self.rng.random();
            }
        }
    }

    fn stage_reset_predator(&mut self) {
        // Consumed by the tick; a fresh pointer update must arrive before the
        // next one or the staged value falls back to the sentinel.
        self.pending_predator = None;
    }

    fn summarize(&self) -> TickSummary {
        let n = self.agent_count().max(1) as f32;
        let mut speed_sum = 0.0f32;
        let mut max_speed = 0.0f32;
        for texel in self.state.velocities.front().texels() {
            let speed = texel.truncate().length();
            speed_sum += speed;
            max_speed = max_speed.max(speed);
        }
        let distance_sum: f32 = self
            .state
            .positions
            .front()
            .texels()
            .iter()
            .map(|texel| texel.truncate().length())
            .sum();
        TickSummary {
            tick: self.tick,
            mean_speed: speed_sum / n,
            max_speed,
            mean_center_distance: distance_sum / n,
            active_count: self.params.active_count,
        }
    }

    /// Record the latest pointer-derived predator position.
    ///
    /// Takes effect at the next tick; without a fresh update each tick the
    /// predator resets to the far-away sentinel.
    pub fn set_predator(&mut self, position: Vec3) {
        self.pending_predator = Some(position);
    }

    /// Stage a knob change, returning the value actually applied.
    ///
    /// Out-of-range values clamp to the knob's declared range. The change
    /// becomes visible to the simulation at the start of the next tick; all
    /// staged changes land together.
    pub fn set_knob(&mut self, name: &str, value: f32) -> Result<f32, ControlError> {
        let descriptor = self
            .knobs()
            .into_iter()
            .find(|descriptor| descriptor.name == name)
            .ok_or_else(|| ControlError::UnknownKnob(name.to_owned()))?;
        if !value.is_finite() {
            return Err(ControlError::NonFinite(descriptor.name));
        }
        Ok(self.controls.set(&descriptor, value))
    }

    /// Descriptors for every tunable, for external control widgets.
    #[must_use]
    pub fn knobs(&self) -> Vec<KnobDescriptor> {
        knob_descriptors(self.agent_count())
    }

    /// The full name → (value, min, max, step) table.
    ///
    /// Values reflect the parameters in force for the current tick, not
    /// staged edits awaiting the next one.
    #[must_use]
    pub fn knob_table(&self) -> Vec<KnobEntry> {
        self.knobs()
            .into_iter()
            .map(|descriptor| KnobEntry {
                descriptor,
                value: knob_value(&self.params, descriptor.name)
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Parameters in force for the current tick.
    #[must_use]
    pub fn params(&self) -> &FlockParams {
        &self.params
    }

    /// Static configuration.
    #[must_use]
    pub fn config(&self) -> &FlockConfig {
        &self.config
    }

    /// Read access to the double-buffered state store.
    #[must_use]
    pub fn state(&self) -> &AgentStateStore {
        &self.state
    }

    /// Mutable state access, for scenario setup and tests.
    #[must_use]
    pub fn state_mut(&mut self) -> &mut AgentStateStore {
        &mut self.state
    }

    /// Per-agent seeds.
    #[must_use]
    pub fn seeds(&self) -> &[AgentSeed] {
        &self.seeds
    }

    /// Per-agent references.
    #[must_use]
    pub fn references(&self) -> &[AgentReference] {
        &self.references
    }

    /// Current tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Accumulated simulation time in seconds.
    #[must_use]
    pub const fn sim_time(&self) -> f64 {
        self.sim_time
    }

    /// Number of simulated agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.state.agent_count()
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }
}

/// Rest-pose body geometry shared by every instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyGeometry {
    /// Rest-pose vertex positions.
    pub rest_positions: Vec<Vec3>,
    /// Triangle index list for one body.
    pub indices: Vec<u32>,
    /// Per-vertex colors, defaulting to white when the asset has none.
    pub colors: Vec<Vec3>,
}

impl BodyGeometry {
    /// Extract the renderable body from a validated asset.
    #[must_use]
    pub fn from_mesh(mesh: &murmuration_atlas::KeyframedMesh) -> Self {
        let colors = mesh
            .colors
            .clone()
            .unwrap_or_else(|| vec![Vec3::ONE; mesh.vertex_count()]);
        Self {
            rest_positions: mesh.positions.clone(),
            indices: mesh.indices.clone(),
            colors,
        }
    }

    /// Vertices per body.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.rest_positions.len()
    }
}

/// World-space instance vertices plus pass-through attributes, cut to the
/// active draw range. Consumed by an external rasterizer.
#[derive(Debug, Clone)]
pub struct InstanceBatch {
    /// World-space vertex positions, `vertices_per_body` per agent.
    pub positions: Vec<Vec3>,
    /// Pass-through vertex colors, parallel to `positions`.
    pub colors: Vec<Vec3>,
    /// Index list replicated per agent with per-body offsets applied.
    pub indices: Vec<u32>,
    /// Number of vertices each body contributes.
    pub vertices_per_body: usize,
}

/// Combines agent state and the baked atlas into posed instance vertices.
///
/// Read-only over the world: composing mutates nothing.
pub struct InstanceComposer {
    atlas: AnimationAtlas,
    body: BodyGeometry,
}

impl InstanceComposer {
    /// Pair a baked atlas with its body geometry.
    #[must_use]
    pub fn new(atlas: AnimationAtlas, body: BodyGeometry) -> Self {
        Self { atlas, body }
    }

    /// The atlas this composer samples.
    #[must_use]
    pub fn atlas(&self) -> &AnimationAtlas {
        &self.atlas
    }

    /// The shared body geometry.
    #[must_use]
    pub fn body(&self) -> &BodyGeometry {
        &self.body
    }

    /// Compose one vertex of one agent into world space.
    ///
    /// `time` is the driver's simulation clock in seconds. The atlas sample
    /// time is staggered by the agent's seed so a large flock never visibly
    /// synchronizes its wingbeats.
    #[must_use]
    pub fn compose_vertex(
        &self,
        world: &FlockWorld,
        agent: usize,
        vertex: usize,
        time: f32,
    ) -> Vec3 {
        let params = world.params();
        let reference = world.references()[agent];
        let seed = world.seeds()[agent];

        let agent_position = world
            .state()
            .positions()
            .sample_uv(reference.u, reference.v)
            .truncate();
        let velocity_raw = world
            .state()
            .velocities()
            .sample_uv(reference.u, reference.v)
            .truncate();

        let phase_rate = 0.0004 + seed.flock_seed / 10_000.0 + velocity_raw.length() / 20_000.0;
        let wrap = reference.wrap_period.max(f32::EPSILON);
        let sample_time = (time + seed.bird_index as f32 * phase_rate).rem_euclid(wrap);
        let phase_u = vertex as f32 / self.atlas.width() as f32;
        let pose = self.atlas.sample_uv(phase_u, sample_time);

        let size = params.size + seed.rand_a * params.size * 0.2;
        let scaled = (self.body.rest_positions[vertex] + pose) * size;

        orient_by_velocity(scaled, velocity_raw) + agent_position
    }

    /// Compose every vertex of the active draw range.
    #[must_use]
    pub fn compose(&self, world: &FlockWorld, time: f32) -> InstanceBatch {
        let vertex_count = self.body.vertex_count();
        let active = world.params().active_count.min(world.agent_count());

        let positions: Vec<Vec3> = (0..active * vertex_count)
            .into_par_iter()
            .map(|flat| self.compose_vertex(world, flat / vertex_count, flat % vertex_count, time))
            .collect();

        let mut colors = Vec::with_capacity(active * vertex_count);
        let mut indices = Vec::with_capacity(active * self.body.indices.len());
        for agent in 0..active {
            colors.extend_from_slice(&self.body.colors);
            let offset = (agent * vertex_count) as u32;
            indices.extend(self.body.indices.iter().map(|index| index + offset));
        }

        InstanceBatch {
            positions,
            colors,
            indices,
            vertices_per_body: vertex_count,
        }
    }
}

/// Rotate `point` into the heading frame implied by `velocity`.
///
/// Yaw and pitch come straight from trigonometric ratios of the normalized
/// velocity components; no angles are ever computed. A vertically moving
/// agent has an undefined yaw ratio and keeps identity yaw; a motionless
/// agent keeps identity orientation outright. Output is always finite.
fn orient_by_velocity(point: Vec3, velocity: Vec3) -> Vec3 {
    let Some(mut direction) = velocity.try_normalize() else {
        return point;
    };
    direction.z = -direction.z;

    let xz = (direction.x * direction.x + direction.z * direction.z).sqrt();
    let (cos_ry, sin_ry) = if xz > f32::EPSILON {
        (direction.x / xz, direction.z / xz)
    } else {
        (1.0, 0.0)
    };
    let cos_rz = (1.0 - direction.y * direction.y).max(0.0).sqrt();
    let sin_rz = direction.y;

    let yaw = Mat3::from_cols(
        Vec3::new(cos_ry, 0.0, -sin_ry),
        Vec3::Y,
        Vec3::new(sin_ry, 0.0, cos_ry),
    );
    let pitch = Mat3::from_cols(
        Vec3::new(cos_rz, sin_rz, 0.0),
        Vec3::new(-sin_rz, cos_rz, 0.0),
        Vec3::Z,
    );
    yaw * (pitch * point)
}
