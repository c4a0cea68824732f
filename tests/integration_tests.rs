//! Integration tests for drive-motion.
//!
//! These tests drive the complete workflow from TOML parsing through
//! kinematics and step generation to a step sink.

use drive_motion::config::parse_config;
use drive_motion::kinematics::{AxesBitmap, Kinematics, KinematicsType, XYZ_AXES};
use drive_motion::machine::{Machine, MoveCommand};
use drive_motion::motion::{DmState, DrivePool, DriveRequest, MoveSegment, PlannedMove, StepEngine, StepOutcome};
use drive_motion::sink::{PinStepSink, SinkEvent, StepRecorder};
use drive_motion::{ConfigError, Error, MAX_DRIVES};
use embedded_hal_mock::eh1::delay::NoopDelay;
use embedded_hal_mock::eh1::digital::{Mock as PinMock, State as PinState, Transaction as PinTransaction};
use proptest::prelude::*;

// =============================================================================
// Test configuration data
// =============================================================================

const CARTESIAN_CONFIG: &str = r#"
[axes.x]
steps_per_mm = 80.0
[axes.y]
steps_per_mm = 80.0
[axes.z]
steps_per_mm = 400.0
min_mm = 0.0
max_mm = 180.0

[extruders.e0]
steps_per_mm = 420.0
pressure_advance_s = 0.02
"#;

const DELTA_CONFIG: &str = r#"
[kinematics]
kind = "linear_delta"

[kinematics.delta]
diagonal_mm = 215.0
radius_mm = 105.6
homed_height_mm = 250.0
print_radius_mm = 85.0

[axes.x]
steps_per_mm = 80.0
[axes.y]
steps_per_mm = 80.0
[axes.z]
steps_per_mm = 80.0
"#;

const REPROPE_CONFIG: &str = r#"
[kinematics]
kind = "reprope"

[axes.x]
steps_per_mm = 100.0
min_mm = -200.0
[axes.y]
steps_per_mm = 100.0
min_mm = -200.0
[axes.z]
steps_per_mm = 100.0
[axes.u]
steps_per_mm = 100.0
[axes.v]
steps_per_mm = 100.0
[axes.w]
steps_per_mm = 100.0
[axes.a]
steps_per_mm = 100.0
[axes.b]
steps_per_mm = 100.0
"#;

fn machine(toml: &str) -> Machine<12> {
    let config = parse_config(toml).expect("Config should parse");
    Machine::from_config(&config).expect("Machine should build")
}

fn motors_for(m: &Machine<12>, coords: &[f32]) -> [i32; MAX_DRIVES] {
    let total = m.drive_table().num_axes();
    let visible = if m.kinematics().kinematics_type() == KinematicsType::Reprope { 3 } else { total };
    let mut motors = [0; MAX_DRIVES];
    assert!(m.kinematics().cartesian_to_motor_steps(
        &coords[..total],
        m.drive_table().steps_per_mm(),
        visible,
        total,
        &mut motors[..total],
        true,
    ));
    motors
}

// =============================================================================
// Kinematics round trips
// =============================================================================

proptest! {
    #[test]
    fn cartesian_round_trip(x in 0.0f32..200.0, y in 0.0f32..200.0, z in 0.0f32..180.0) {
        let m = machine(CARTESIAN_CONFIG);
        let kin = m.kinematics();
        let spm = m.drive_table().steps_per_mm();
        let mut motors = [0i32; 3];
        prop_assert!(kin.cartesian_to_motor_steps(&[x, y, z], spm, 3, 3, &mut motors, true));

        let mut back = [0.0f32; 3];
        kin.motor_steps_to_cartesian(&motors, spm, 3, 3, &mut back);
        prop_assert!((back[0] - x).abs() <= 0.5 / 80.0 + 1e-4);
        prop_assert!((back[1] - y).abs() <= 0.5 / 80.0 + 1e-4);
        prop_assert!((back[2] - z).abs() <= 0.5 / 400.0 + 1e-4);
    }

    #[test]
    fn delta_round_trip(r in 0.0f32..80.0, angle in 0.0f32..6.28, z in 0.0f32..150.0) {
        let m = machine(DELTA_CONFIG);
        let kin = m.kinematics();
        let spm = m.drive_table().steps_per_mm();
        let coords = [r * angle.cos(), r * angle.sin(), z];
        prop_assume!(kin.is_reachable(&coords, XYZ_AXES));

        let mut motors = [0i32; 3];
        prop_assert!(kin.cartesian_to_motor_steps(&coords, spm, 3, 3, &mut motors, true));
        let mut back = [0.0f32; 3];
        kin.motor_steps_to_cartesian(&motors, spm, 3, 3, &mut back);
        for axis in 0..3 {
            prop_assert!((back[axis] - coords[axis]).abs() < 0.1, "axis {} {} vs {}", axis, back[axis], coords[axis]);
        }
    }
}

// =============================================================================
// Drive movement pool
// =============================================================================

proptest! {
    #[test]
    fn pool_accounting_holds(ops in prop::collection::vec(any::<(bool, u8)>(), 0..64)) {
        let mut pool: DrivePool<6> = DrivePool::new();
        let mut held = Vec::new();
        for (allocate, drive) in ops {
            if allocate {
                match pool.allocate(drive % 16, DmState::Idle) {
                    Ok(handle) => held.push(handle),
                    Err(_) => {
                        prop_assert_eq!(held.len(), 6);
                    }
                }
            } else if let Some(handle) = held.pop() {
                prop_assert!(pool.release(handle).is_ok());
                prop_assert!(pool.release(handle).is_err());
            }
            prop_assert_eq!(pool.free_count() + pool.in_use_count(), pool.capacity());
            prop_assert_eq!(pool.in_use_count(), held.len());
        }
    }
}

// =============================================================================
// Machine moves
// =============================================================================

#[test]
fn cartesian_print_move_with_extrusion() {
    let mut m = machine(CARTESIAN_CONFIG);
    m.queue_move(&MoveCommand::new(40.0, 800.0).xyz(20.0, 10.0, 0.2).extrude(0, 1.5))
        .unwrap();

    let mut sink = StepRecorder::<0>::counting();
    m.run_until_idle(0, &mut sink).unwrap();

    assert_eq!(sink.position(0), 1600);
    assert_eq!(sink.position(1), 800);
    assert_eq!(sink.position(2), 80);
    assert_eq!(sink.position(3), 630);
    assert!((m.extruder_position(0) - 1.5).abs() < 1e-3);
    assert_eq!(m.engine().faults(), 0);
}

#[test]
fn delta_move_steps_in_time_order() {
    let mut m = machine(DELTA_CONFIG);
    m.queue_move(&MoveCommand::new(80.0, 1500.0).xyz(-25.0, 15.0, 230.0)).unwrap();

    let mut sink = StepRecorder::<16384>::new();
    m.run_until_idle(0, &mut sink).unwrap();

    let mut last = 0;
    for event in sink.events() {
        if let SinkEvent::Step { time, .. } = *event {
            assert!(time >= last, "step at {} after {}", time, last);
            last = time;
        }
    }
    let expected = motors_for(&m, &[-25.0, 15.0, 230.0]);
    let motors = m.engine().motor_positions();
    for drive in 0..3 {
        assert_eq!(motors[drive], expected[drive], "tower {}", drive);
    }
}

#[test]
fn delta_carriage_rises_and_falls() {
    // Passing closest to tower Z half way: carriage Z rises then falls back
    let mut m = machine(DELTA_CONFIG);
    m.set_position(&[-40.0, 0.0, 100.0]).unwrap();
    m.queue_move(&MoveCommand::new(80.0, 1500.0).xyz(40.0, 0.0, 100.0)).unwrap();

    let mut sink = StepRecorder::<16384>::new();
    m.run_until_idle(0, &mut sink).unwrap();

    let z_directions: Vec<bool> = sink
        .events()
        .iter()
        .filter_map(|e| match *e {
            SinkEvent::Direction { drive: 2, forwards } => Some(forwards),
            _ => None,
        })
        .collect();
    assert_eq!(z_directions, vec![true, false]);

    let expected = motors_for(&m, &[40.0, 0.0, 100.0]);
    assert_eq!(m.engine().motor_positions()[..3], expected[..3]);
}

#[test]
fn reprope_segmented_move_reaches_target() {
    let mut m = machine(REPROPE_CONFIG);
    assert_eq!(m.kinematics().kinematics_type(), KinematicsType::Reprope);
    let start = m.machine_position();
    assert!(start[0].abs() < 0.05 && start[1].abs() < 0.05);

    m.queue_move(&MoveCommand::new(50.0, 1000.0).xyz(20.0, -10.0, 15.0)).unwrap();
    let mut sink = StepRecorder::<0>::counting();
    m.run_until_idle(0, &mut sink).unwrap();

    let mut target = [0.0f32; 8];
    target[..3].copy_from_slice(&[20.0, -10.0, 15.0]);
    let expected = motors_for(&m, &target);
    assert_eq!(&m.engine().motor_positions()[..8], &expected[..8]);
    assert_eq!(m.engine().faults(), 0);
}

#[test]
fn abort_credits_only_emitted_steps() {
    let mut m = machine(CARTESIAN_CONFIG);
    m.queue_move(&MoveCommand::new(50.0, 1000.0).axis(0, 50.0)).unwrap();
    m.queue_move(&MoveCommand::new(50.0, 1000.0).axis(1, 50.0)).unwrap();

    let mut sink = StepRecorder::<0>::counting();
    m.poll(0, &mut sink).unwrap();
    m.poll(300_000, &mut sink).unwrap();
    m.abort().unwrap();

    assert!(!m.is_motion_active());
    assert!(sink.position(0) > 0 && sink.position(0) < 4000);
    assert_eq!(m.engine().motor_position(0), sink.position(0));
    assert_eq!(m.engine().motor_position(1), 0);
    assert_eq!(m.engine().pool().in_use_count(), 0);
}

// =============================================================================
// Runtime configuration
// =============================================================================

#[test]
fn m665_without_parameters_reports_geometry() {
    let mut m = machine(DELTA_CONFIG);
    let mut reply = heapless::String::<256>::new();
    assert_eq!(m.execute_command("M665", &mut reply), Ok(false));
    assert!(reply.starts_with("Diagonal 215.000"), "{}", reply);
}

#[test]
fn rejected_geometry_changes_nothing() {
    let mut m = machine(DELTA_CONFIG);
    let before = m.kinematics().clone();
    let mut reply = heapless::String::<256>::new();

    // Rods shorter than the tower radius
    assert!(m.execute_command("M665 L50", &mut reply).is_err());
    assert_eq!(m.kinematics(), &before);
}

#[test]
fn switching_to_reprope_uses_derived_steps() {
    let mut config = parse_config(REPROPE_CONFIG).unwrap();
    config.kinematics = Default::default();
    let mut m: Machine<12> = Machine::from_config(&config).unwrap();
    assert_eq!(m.kinematics().kinematics_type(), KinematicsType::Cartesian);

    let mut reply = heapless::String::<256>::new();
    assert_eq!(m.execute_command("M669 K14", &mut reply), Ok(true));
    assert_eq!(m.kinematics().kinematics_type(), KinematicsType::Reprope);
    for drive in 0..8 {
        let derived = m.kinematics().derived_steps_per_unit(drive).unwrap();
        assert_eq!(m.drive_table().drive_steps_per_mm(drive), derived);
    }
}

#[test]
fn reprope_calibration_round_trip() {
    let mut m = machine(REPROPE_CONFIG);
    let mut saved = heapless::String::<2048>::new();
    m.write_calibration(&mut saved).unwrap();

    m.restore_calibration(&saved).unwrap();
    let mut again = heapless::String::<2048>::new();
    m.write_calibration(&mut again).unwrap();
    assert_eq!(saved, again);
}

#[test]
fn reprope_segmentation_change_survives_restore() {
    let mut m = machine(REPROPE_CONFIG);
    let mut reply = heapless::String::<256>::new();
    assert_eq!(m.execute_command("M669 S50 T0.5", &mut reply), Ok(true));
    assert_eq!(m.kinematics().segments_per_second(), Some(50.0));
    assert_eq!(m.kinematics().min_segment_length(), Some(0.5));

    let mut saved = heapless::String::<2048>::new();
    m.write_calibration(&mut saved).unwrap();
    let mut fresh = machine(REPROPE_CONFIG);
    fresh.restore_calibration(&saved).unwrap();
    assert_eq!(fresh.kinematics().segments_per_second(), Some(50.0));
    assert_eq!(fresh.kinematics().min_segment_length(), Some(0.5));
}

#[test]
fn config_with_too_many_drives_for_pool() {
    let config = parse_config(REPROPE_CONFIG).unwrap();
    let result: Result<Machine<4>, Error> = Machine::from_config(&config);
    assert_eq!(
        result.err(),
        Some(Error::Config(ConfigError::TooManyDrives { requested: 8, capacity: 4 }))
    );
}

#[test]
fn unreachable_target_refused_without_limits() {
    let mut m = machine(REPROPE_CONFIG);
    let result = m.queue_move(&MoveCommand::new(50.0, 1000.0).xyz(0.0, 0.0, 500.0).without_limits());
    assert!(result.is_err());
    assert!(!m.is_motion_active());
    assert!(!m.kinematics().is_reachable(&[0.0, 0.0, 500.0], AxesBitmap::lowest_n(3)));
}

// =============================================================================
// Pin output
// =============================================================================

#[test]
fn engine_drives_step_and_dir_pins() {
    let step = PinMock::new(&[
        PinTransaction::set(PinState::High),
        PinTransaction::set(PinState::Low),
        PinTransaction::set(PinState::High),
        PinTransaction::set(PinState::Low),
        PinTransaction::set(PinState::High),
        PinTransaction::set(PinState::Low),
    ]);
    let dir = PinMock::new(&[PinTransaction::set(PinState::High)]);
    let mut sink: PinStepSink<_, _, _, 2> = PinStepSink::new(NoopDelay::new(), 1_000_000)
        .unwrap()
        .with_drive(0, step, dir)
        .unwrap();

    let plan = PlannedMove::from_segments(&[MoveSegment::linear(1.0, 3000.0)], 40).unwrap();
    let mut engine: StepEngine<2> = StepEngine::new();
    engine.start_move(plan, &[DriveRequest::linear(0, 3)], 0).unwrap();

    assert_eq!(engine.step(10_000, &mut sink), Ok(StepOutcome::Finished));
    assert_eq!(engine.motor_position(0), 3);

    let (mut step, mut dir) = sink.release_drive(0).unwrap();
    step.done();
    dir.done();
}
