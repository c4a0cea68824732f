//! Unit tests for TOML configuration parsing.

use drive_motion::config::{parse_config, DriveTable, KinematicsKind, MachineConfig};
use drive_motion::config::units::Microsteps;

/// Test parsing a Cartesian machine with one extruder.
#[test]
fn test_parse_cartesian_config() {
    let toml_str = r#"
step_clock_hz = 2000000

[axes.x]
steps_per_mm = 80.0
min_mm = -10.0
max_mm = 220.0
invert_direction = true
[axes.y]
steps_per_mm = 80.0
[axes.z]
steps_per_mm = 400.0

[extruders.e0]
steps_per_mm = 420.0
pressure_advance_s = 0.05
"#;

    let config: MachineConfig = toml::from_str(toml_str).expect("Failed to parse TOML");
    assert_eq!(config.kinematics.kind, KinematicsKind::Cartesian);
    assert_eq!(config.step_clock_hz, 2_000_000);

    let x = config.axis("x").expect("Axis not found");
    assert_eq!(x.steps_per_mm, 80.0);
    assert_eq!(x.min.0, -10.0);
    assert_eq!(x.max.0, 220.0);
    assert!(x.invert_direction);

    // Omitted limits fall back to 0..200
    let y = config.axis("Y").expect("Axis lookup ignores case");
    assert_eq!(y.min.0, 0.0);
    assert_eq!(y.max.0, 200.0);

    let letters: heapless::Vec<char, 4> = config.axis_letters().collect();
    assert_eq!(letters.as_slice(), &['X', 'Y', 'Z']);
    assert_eq!(config.num_drives(), 4);
}

/// Test that extruders follow the axes in drive order.
#[test]
fn test_drive_table_layout() {
    let toml_str = r#"
[axes.x]
steps_per_mm = 80.0
[axes.y]
steps_per_mm = 100.0
invert_direction = true

[extruders.e0]
steps_per_mm = 420.0
pressure_advance_s = 0.05
[extruders.e1]
steps_per_mm = 410.0
invert_direction = true
"#;

    let config = parse_config(toml_str).expect("Failed to parse config");
    let table = DriveTable::from_config(&config).expect("Failed to build drive table");

    assert_eq!(table.num_axes(), 2);
    assert_eq!(table.num_extruders(), 2);
    assert_eq!(table.num_drives(), 4);
    assert_eq!(table.extruder_drive(1), 3);
    assert_eq!(table.drive_steps_per_mm(1), 100.0);
    assert_eq!(table.drive_steps_per_mm(3), 410.0);
    assert!(table.is_inverted(1));
    assert!(table.is_inverted(3));
    assert!(!table.is_inverted(2));

    // 0.05 s at the default 1 MHz clock
    assert!((table.pressure_advance_clocks(0) - 50_000.0).abs() < 1.0);
    assert_eq!(table.pressure_advance_clocks(1), 0.0);
    assert_eq!(table.min_calc_interval(), 40);
}

/// Test parsing a reprope machine with partial geometry.
#[test]
fn test_parse_reprope_section() {
    let toml_str = r#"
[kinematics]
kind = "reprope"
segments_per_second = 50.0
min_segment_length_mm = 0.5

[kinematics.reprope]
print_radius_mm = 400.0
spool_radii = [20.0, 20.0, 20.0, 20.0, 20.0, 20.0, 20.0, 20.0]
microstepping = [32, 32, 32, 32, 16, 16, 16, 16]

[axes.x]
steps_per_mm = 100.0
"#;

    let config = parse_config(toml_str).expect("Failed to parse config");
    assert_eq!(config.kinematics.kind, KinematicsKind::Reprope);
    assert_eq!(config.kinematics.segments_per_second, Some(50.0));
    assert_eq!(config.kinematics.min_segment_length.map(|l| l.0), Some(0.5));

    let reprope = config.kinematics.reprope.as_ref().expect("Reprope section missing");
    assert_eq!(reprope.print_radius.map(|r| r.0), Some(400.0));
    assert!(reprope.anchors.is_none());
    let microstepping = reprope.microstepping.expect("Microstepping missing");
    assert_eq!(microstepping[0], Microsteps::THIRTY_SECOND);
    assert_eq!(microstepping[7], Microsteps::SIXTEENTH);
}

/// Test that microstep values that are not a power of two are rejected.
#[test]
fn test_invalid_microsteps_rejected() {
    let toml_str = r#"
[kinematics]
kind = "reprope"

[kinematics.reprope]
microstepping = [12, 16, 16, 16, 16, 16, 16, 16]

[axes.x]
steps_per_mm = 100.0
"#;

    assert!(parse_config(toml_str).is_err());
}

/// Test loading configuration from a file.
#[test]
fn test_load_config_from_file() {
    use drive_motion::config::load_config;
    use std::io::Write;

    let toml_str = r#"
[axes.x]
steps_per_mm = 80.0
"#;

    let path = std::env::temp_dir().join("drive_motion_load_config_test.toml");
    {
        let mut file = std::fs::File::create(&path).expect("Failed to create temp file");
        file.write_all(toml_str.as_bytes()).expect("Failed to write temp file");
    }

    let config = load_config(&path).expect("Failed to load config");
    assert!(config.axis("x").is_some());

    let _ = std::fs::remove_file(&path);
    assert!(load_config(&path).is_err());
}
