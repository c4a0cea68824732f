//! Unit tests for configuration validation.

use drive_motion::config::{validate_config, MachineConfig};
use drive_motion::error::{ConfigError, Error};

fn parse(toml_str: &str) -> MachineConfig {
    toml::from_str(toml_str).expect("Failed to parse TOML")
}

/// Test validation of a valid configuration.
#[test]
fn test_valid_config_passes_validation() {
    let config = parse(
        r#"
[axes.x]
steps_per_mm = 80.0
[axes.y]
steps_per_mm = 80.0

[extruders.e0]
steps_per_mm = 420.0
pressure_advance_s = 0.1
"#,
    );
    assert!(validate_config(&config).is_ok());
}

/// Test validation fails for zero steps per mm.
#[test]
fn test_zero_steps_per_mm() {
    let config = parse(
        r#"
[axes.x]
steps_per_mm = 0.0
"#,
    );
    assert_eq!(
        validate_config(&config),
        Err(Error::Config(ConfigError::InvalidStepsPerMm(0.0)))
    );
}

/// Test validation fails for inverted axis limits (min >= max).
#[test]
fn test_invalid_axis_limits() {
    let config = parse(
        r#"
[axes.x]
steps_per_mm = 80.0
min_mm = 90.0
max_mm = -90.0
"#,
    );
    assert!(matches!(
        validate_config(&config),
        Err(Error::Config(ConfigError::InvalidAxisLimits { .. }))
    ));
}

/// Test validation fails for negative pressure advance.
#[test]
fn test_negative_pressure_advance() {
    let config = parse(
        r#"
[axes.x]
steps_per_mm = 80.0

[extruders.e0]
steps_per_mm = 420.0
pressure_advance_s = -0.1
"#,
    );
    assert!(matches!(
        validate_config(&config),
        Err(Error::Config(ConfigError::InvalidPressureAdvance(_)))
    ));
}

/// Test validation fails for delta rods shorter than the tower radius.
#[test]
fn test_delta_rods_too_short() {
    let config = parse(
        r#"
[kinematics]
kind = "linear_delta"

[kinematics.delta]
diagonal_mm = 100.0
radius_mm = 105.6
homed_height_mm = 250.0
print_radius_mm = 85.0

[axes.x]
steps_per_mm = 80.0
"#,
    );
    assert!(matches!(
        validate_config(&config),
        Err(Error::Config(ConfigError::InvalidParameter { letter: 'L', .. }))
    ));
}

/// Test validation fails for a stopped step clock.
#[test]
fn test_zero_step_clock() {
    let config = parse(
        r#"
step_clock_hz = 0

[axes.x]
steps_per_mm = 80.0
"#,
    );
    assert_eq!(
        validate_config(&config),
        Err(Error::Config(ConfigError::InvalidStepClock(0)))
    );
}

/// Test that empty configuration is valid.
#[test]
fn test_empty_config_is_valid() {
    let config = MachineConfig::default();
    assert!(validate_config(&config).is_ok());
}
