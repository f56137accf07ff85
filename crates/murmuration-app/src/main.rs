//! Headless demo driver: bakes a procedural flapping mesh, runs the flock
//! for a few hundred frames with a scripted control driver, and hands one
//! composed instance batch to the log in place of a renderer.

use std::time::{Duration, Instant};

use anyhow::Result;
use glam::Vec3;
use murmuration_atlas::{AnimationAtlas, KeyframedMesh};
use murmuration_core::{BodyGeometry, FlockConfig, FlockWorld, InstanceComposer};
use tracing::info;

const FRAMES: u32 = 300;
const FRAME_BUDGET: Duration = Duration::from_millis(16);

fn main() -> Result<()> {
    init_tracing();
    let mesh = demo_mesh();
    let atlas = AnimationAtlas::bake(&mesh)?;
    let body = BodyGeometry::from_mesh(&mesh);

    let config = FlockConfig {
        texture_width: 32,
        ..FlockConfig::default()
    };
    let mut world = FlockWorld::new(config, &atlas)?;
    let composer = InstanceComposer::new(atlas, body);
    info!(agents = world.agent_count(), "flock world ready");

    let mut last = Instant::now();
    for frame in 0..FRAMES {
        let dt = last.elapsed().as_secs_f32();
        last = Instant::now();

        drive_controls(&mut world, frame)?;
        let summary = world.step(dt);
        if frame % 60 == 0 {
            info!(
                tick = %summary.tick,
                mean_speed = summary.mean_speed,
                max_speed = summary.max_speed,
                center_distance = summary.mean_center_distance,
                active = summary.active_count,
                "tick summary",
            );
        }

        if let Some(remaining) = FRAME_BUDGET.checked_sub(last.elapsed()) {
            std::thread::sleep(remaining);
        }
    }

    let batch = composer.compose(&world, world.sim_time() as f32);
    info!(
        vertices = batch.positions.len(),
        triangles = batch.indices.len() / 3,
        bodies = batch.positions.len() / batch.vertices_per_body,
        "composed instance batch for the renderer"
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Stand-in for the interactive panel and pointer: a predator circling the
/// flock's airspace and a couple of mid-run knob changes.
fn drive_controls(world: &mut FlockWorld, frame: u32) -> Result<()> {
    let angle = frame as f32 * 0.02;
    world.set_predator(Vec3::new(angle.cos() * 150.0, 30.0, angle.sin() * 150.0));

    match frame {
        100 => {
            world.set_knob("cohesion", 60.0)?;
            world.set_knob("alignment", 35.0)?;
        }
        200 => {
            world.set_knob("count", 256.0)?;
        }
        _ => {}
    }
    Ok(())
}

/// A minimal keyframed body: diamond bird with flapping wingtips. In the
/// full system this arrives from an external asset loader.
fn demo_mesh() -> KeyframedMesh {
    let rest = vec![
        Vec3::new(1.4, 0.0, 0.0),
        Vec3::new(-1.0, 0.2, 0.0),
        Vec3::new(0.0, 0.0, -1.6),
        Vec3::new(0.0, 0.0, 1.6),
    ];
    let wings_up = vec![
        Vec3::ZERO,
        Vec3::new(0.0, -0.1, 0.0),
        Vec3::new(0.0, 0.9, 0.0),
        Vec3::new(0.0, 0.9, 0.0),
    ];
    let wings_down = vec![
        Vec3::new(0.0, 0.1, 0.0),
        Vec3::ZERO,
        Vec3::new(0.0, -0.9, 0.0),
        Vec3::new(0.0, -0.9, 0.0),
    ];
    KeyframedMesh {
        positions: rest,
        indices: vec![0, 2, 1, 0, 1, 3],
        colors: Some(vec![
            Vec3::new(1.0, 0.87, 1.0),
            Vec3::new(0.9, 0.7, 0.9),
            Vec3::new(1.0, 0.87, 1.0),
            Vec3::new(1.0, 0.87, 1.0),
        ]),
        keyframes: vec![wings_up, wings_down],
        duration_seconds: 0.5,
    }
}
