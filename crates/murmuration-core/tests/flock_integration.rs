use glam::Vec3;
use murmuration_atlas::{AnimationAtlas, KeyframedMesh};
use murmuration_core::{
    BodyGeometry, FlockConfig, FlockWorld, InstanceComposer, PREDATOR_SENTINEL, Tick,
};

fn flapping_mesh() -> KeyframedMesh {
    let rest = vec![
        Vec3::new(1.4, 0.0, 0.0),
        Vec3::new(-1.0, 0.2, 0.0),
        Vec3::new(0.0, 0.0, -1.6),
        Vec3::new(0.0, 0.0, 1.6),
    ];
    let up = vec![
        Vec3::ZERO,
        Vec3::ZERO,
        Vec3::new(0.0, 0.9, 0.0),
        Vec3::new(0.0, 0.9, 0.0),
    ];
    let down = vec![
        Vec3::new(0.0, 0.1, 0.0),
        Vec3::ZERO,
        Vec3::new(0.0, -0.9, 0.0),
        Vec3::new(0.0, -0.9, 0.0),
    ];
    KeyframedMesh {
        positions: rest,
        indices: vec![0, 2, 1, 0, 1, 3],
        colors: None,
        keyframes: vec![up, down],
        duration_seconds: 0.5,
    }
}

fn seeded_world(texture_width: u32, seed: u64) -> (FlockWorld, InstanceComposer) {
    let mesh = flapping_mesh();
    let atlas = AnimationAtlas::bake(&mesh).expect("atlas");
    let config = FlockConfig {
        texture_width,
        rng_seed: Some(seed),
        ..FlockConfig::default()
    };
    let world = FlockWorld::new(config, &atlas).expect("world");
    let composer = InstanceComposer::new(atlas, BodyGeometry::from_mesh(&mesh));
    (world, composer)
}

#[test]
fn speed_cap_holds_after_every_tick() {
    let (mut world, _) = seeded_world(8, 0xF10C);
    let limit = world.params().speed_limit;
    for _ in 0..120 {
        world.step(1.0 / 60.0);
        for texel in world.state().velocities().texels() {
            let speed_sq = texel.truncate().length_squared();
            assert!(
                speed_sq <= limit * limit + 1.0e-3,
                "velocity {texel} exceeds the speed cap {limit}"
            );
        }
    }
}

#[test]
fn flock_stays_within_soft_bounds() {
    let (mut world, _) = seeded_world(4, 0xB0C5);
    let half = world.config().bounds / 2.0;
    let overshoot = 50.0;
    for _ in 0..2_000 {
        world.step(1.0 / 60.0);
        for texel in world.state().positions().texels() {
            assert!(
                texel.truncate().abs().max_element() <= half + overshoot,
                "agent escaped the soft bounds: {texel}"
            );
        }
    }
}

#[test]
fn seeded_runs_are_reproducible() {
    let (mut world_a, _) = seeded_world(4, 0x5EED);
    let (mut world_b, _) = seeded_world(4, 0x5EED);
    for frame in 0..50u32 {
        if frame % 10 == 0 {
            let predator = Vec3::new(frame as f32 * 3.0, 0.0, -40.0);
            world_a.set_predator(predator);
            world_b.set_predator(predator);
        }
        world_a.step(1.0 / 60.0);
        world_b.step(1.0 / 60.0);
    }
    let history_a: Vec<_> = world_a.history().cloned().collect();
    let history_b: Vec<_> = world_b.history().cloned().collect();
    assert_eq!(history_a, history_b, "identical seeds, identical histories");
    assert_eq!(
        world_a.state().positions().texels(),
        world_b.state().positions().texels()
    );
    assert_eq!(
        world_a.state().velocities().texels(),
        world_b.state().velocities().texels()
    );

    let (mut world_c, _) = seeded_world(4, 0x0DD5);
    for _ in 0..50 {
        world_c.step(1.0 / 60.0);
    }
    assert_ne!(
        world_a.state().positions().texels(),
        world_c.state().positions().texels(),
        "different seeds should diverge"
    );
}

#[test]
fn containment_alone_drifts_flock_to_center_and_bleeds_speed() {
    let (mut world, _) = seeded_world(2, 0xDECA);
    for (knob, value) in [
        ("separation", 0.0),
        ("alignment", 0.0),
        ("cohesion", 0.0),
        ("centripetal", 0.0),
        ("freedom", 1.0),
    ] {
        world.set_knob(knob, value).expect("knob");
    }
    let first = world.step(1.0 / 60.0);
    for _ in 0..6_000 {
        world.step(1.0 / 60.0);
    }
    let last = world.history().last().expect("summary").clone();
    assert!(
        last.mean_center_distance < first.mean_center_distance * 0.05,
        "flock should drift to center: {} -> {}",
        first.mean_center_distance,
        last.mean_center_distance
    );
    assert!(
        last.mean_speed < 0.05,
        "speed should decay toward zero, got {}",
        last.mean_speed
    );
}

#[test]
fn predator_coincidence_steers_away_without_nan() {
    let (mut world, _) = seeded_world(2, 0xCAFE);
    for (knob, value) in [
        ("separation", 0.0),
        ("alignment", 0.0),
        ("cohesion", 0.0),
        ("centripetal", 0.0),
        ("freedom", 0.0),
    ] {
        world.set_knob(knob, value).expect("knob");
    }
    let predator = Vec3::new(80.0, -20.0, 10.0);
    {
        let positions = world.state_mut().positions_mut().front_mut();
        positions.set_texel(0, 0, predator.extend(1.0));
        positions.set_texel(1, 0, (predator + Vec3::new(30.0, 0.0, 0.0)).extend(1.0));
        let velocities = world.state_mut().velocities_mut().front_mut();
        for texel in velocities.texels_mut() {
            *texel = Vec3::ZERO.extend(1.0);
        }
    }
    world.set_predator(predator);
    world.step(1.0 / 60.0);

    let coincident = world.state().velocities().texel(0, 0).truncate();
    assert!(coincident.is_finite());
    assert!(
        coincident.x > 0.0,
        "coincident agent steers along the fallback axis, got {coincident}"
    );

    let nearby = world.state().velocities().texel(1, 0).truncate();
    assert!(
        nearby.x > 0.0,
        "agent inside the avoidance radius steers away, got {nearby}"
    );

    // No fresh pointer input: the predator decays back to the sentinel.
    world.step(1.0 / 60.0);
    assert_eq!(world.params().predator, PREDATOR_SENTINEL);
}

#[test]
fn oversized_dt_is_clamped() {
    let (mut world_a, _) = seeded_world(4, 0x7E57);
    let (mut world_b, _) = seeded_world(4, 0x7E57);
    world_a.step(5.0);
    world_b.step(1.0);
    assert_eq!(
        world_a.state().positions().texels(),
        world_b.state().positions().texels()
    );
    assert_eq!(world_a.tick(), Tick(1));
}

#[test]
fn knob_table_names_every_tunable() {
    let (world, _) = seeded_world(2, 0x4B0B);
    let knobs = world.knobs();
    for name in [
        "separation",
        "alignment",
        "cohesion",
        "freedom",
        "speed",
        "speed_scale",
        "centripetal",
        "avoidance_radius",
        "avoidance_strength",
        "flee_radius",
        "flee_speed",
        "z_flee",
        "size",
        "count",
    ] {
        let descriptor = knobs
            .iter()
            .find(|descriptor| descriptor.name == name)
            .unwrap_or_else(|| panic!("missing knob {name}"));
        assert!(descriptor.min <= descriptor.max);
        assert!(descriptor.step > 0.0);
    }
    let count = knobs
        .iter()
        .find(|descriptor| descriptor.name == "count")
        .expect("count knob");
    assert_eq!(count.max, world.agent_count() as f32);

    let table = world.knob_table();
    assert_eq!(table.len(), knobs.len());
    let speed = table
        .iter()
        .find(|entry| entry.descriptor.name == "speed")
        .expect("speed entry");
    assert_eq!(speed.value, world.params().speed_limit);
}

#[test]
fn composed_pose_repeats_after_one_wrap_period() {
    let (mut world, composer) = seeded_world(2, 0x90DE);
    for _ in 0..10 {
        world.step(1.0 / 60.0);
    }
    let wrap = world.references()[0].wrap_period;
    for agent in 0..world.agent_count() {
        for vertex in 0..composer.body().vertex_count() {
            let now = composer.compose_vertex(&world, agent, vertex, 0.0);
            let later = composer.compose_vertex(&world, agent, vertex, wrap);
            assert!(
                (now - later).length() < 1.0e-4,
                "pose must repeat each wrap period: {now} vs {later}"
            );
        }
    }
}
