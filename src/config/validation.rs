//! Configuration validation.

use crate::error::{ConfigError, Error, Result};
use crate::{MAX_AXES, MAX_DRIVES, MAX_EXTRUDERS};

use super::kinematics::{DeltaSection, KinematicsKind, RepropeSection};
use super::{AxisConfig, ExtruderConfig, MachineConfig};

/// Validate a machine configuration.
///
/// Checks:
/// - The step clock runs
/// - Drive counts fit the drive tables
/// - Every axis has positive steps per mm and min < max
/// - Pressure advance is not negative
/// - The kinematics section matches the selected geometry
pub fn validate_config(config: &MachineConfig) -> Result<()> {
    if config.step_clock_hz == 0 {
        return Err(Error::Config(ConfigError::InvalidStepClock(0)));
    }

    let requested = config.num_drives();
    if config.num_axes() > MAX_AXES
        || config.extruders.len() > MAX_EXTRUDERS
        || requested > MAX_DRIVES
    {
        return Err(Error::Config(ConfigError::TooManyDrives {
            requested,
            capacity: MAX_DRIVES,
        }));
    }

    for (_, axis) in config.axes.iter() {
        validate_axis(axis)?;
    }

    for (_, extruder) in config.extruders.iter() {
        validate_extruder(extruder)?;
    }

    let kin = &config.kinematics;
    if let Some(sps) = kin.segments_per_second {
        if !sps.is_finite() || sps < 0.0 {
            return Err(Error::Config(ConfigError::InvalidParameter {
                letter: 'S',
                value: sps,
            }));
        }
    }
    if let Some(len) = kin.min_segment_length {
        if !len.0.is_finite() || len.0 < 0.0 {
            return Err(Error::Config(ConfigError::InvalidParameter {
                letter: 'T',
                value: len.0,
            }));
        }
    }

    match kin.kind {
        KinematicsKind::Cartesian => Ok(()),
        KinematicsKind::LinearDelta => match kin.delta {
            Some(ref delta) => validate_delta(delta),
            None => Err(parse_error("linear_delta kinematics needs a [kinematics.delta] table")),
        },
        KinematicsKind::Reprope => match kin.reprope {
            Some(ref reprope) => validate_reprope(reprope),
            None => Ok(()),
        },
    }
}

fn validate_axis(axis: &AxisConfig) -> Result<()> {
    if !(axis.steps_per_mm.is_finite() && axis.steps_per_mm > 0.0) {
        return Err(Error::Config(ConfigError::InvalidStepsPerMm(axis.steps_per_mm)));
    }

    if !axis.limits().is_valid() {
        return Err(Error::Config(ConfigError::InvalidAxisLimits {
            min: axis.min.0,
            max: axis.max.0,
        }));
    }

    Ok(())
}

fn validate_extruder(extruder: &ExtruderConfig) -> Result<()> {
    if !(extruder.steps_per_mm.is_finite() && extruder.steps_per_mm > 0.0) {
        return Err(Error::Config(ConfigError::InvalidStepsPerMm(
            extruder.steps_per_mm,
        )));
    }

    let pa = extruder.pressure_advance.value();
    if !(pa.is_finite() && pa >= 0.0) {
        return Err(Error::Config(ConfigError::InvalidPressureAdvance(pa)));
    }

    Ok(())
}

fn validate_delta(delta: &DeltaSection) -> Result<()> {
    let diagonal = delta.diagonal.0;
    let radius = delta.radius.0;

    if !(radius > 0.0) {
        return Err(Error::Config(ConfigError::InvalidParameter {
            letter: 'R',
            value: radius,
        }));
    }
    // The rods must be longer than the tower radius or the effector cannot reach the centre
    if !(diagonal > radius) {
        return Err(Error::Config(ConfigError::InvalidParameter {
            letter: 'L',
            value: diagonal,
        }));
    }
    if !(delta.print_radius.0 > 0.0) {
        return Err(Error::Config(ConfigError::InvalidParameter {
            letter: 'B',
            value: delta.print_radius.0,
        }));
    }
    if !delta.homed_height.0.is_finite() {
        return Err(Error::Config(ConfigError::InvalidParameter {
            letter: 'H',
            value: delta.homed_height.0,
        }));
    }

    Ok(())
}

fn validate_reprope(reprope: &RepropeSection) -> Result<()> {
    if let Some(radius) = reprope.print_radius {
        if !(radius.0 > 0.0) {
            return Err(Error::Config(ConfigError::InvalidParameter {
                letter: 'P',
                value: radius.0,
            }));
        }
    }
    if let Some(radii) = reprope.spool_radii {
        if let Some(bad) = radii.iter().find(|r| !(**r > 0.0)) {
            return Err(Error::Config(ConfigError::InvalidParameter {
                letter: 'R',
                value: *bad,
            }));
        }
    }

    let counts = [
        ('U', reprope.mechanical_advantage),
        ('O', reprope.lines_per_spool),
        ('L', reprope.motor_gear_teeth),
        ('H', reprope.spool_gear_teeth),
        ('J', reprope.full_steps_per_motor_rev),
    ];
    for (letter, values) in counts {
        if let Some(values) = values {
            if values.contains(&0) {
                return Err(Error::Config(ConfigError::InvalidParameter {
                    letter,
                    value: 0.0,
                }));
            }
        }
    }

    Ok(())
}

fn parse_error(msg: &str) -> Error {
    Error::Config(ConfigError::ParseError(
        heapless::String::try_from(msg).unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::units::{Millimetres, Seconds};

    #[test]
    fn test_invalid_steps_per_mm() {
        let axis = AxisConfig {
            steps_per_mm: -1.0, // Invalid!
            min: Millimetres(0.0),
            max: Millimetres(200.0),
            invert_direction: false,
        };

        let result = validate_axis(&axis);
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::InvalidStepsPerMm(_)))
        ));
    }

    #[test]
    fn test_negative_pressure_advance() {
        let extruder = ExtruderConfig {
            steps_per_mm: 420.0,
            pressure_advance: Seconds(-0.01),
            invert_direction: false,
        };

        assert!(matches!(
            validate_extruder(&extruder),
            Err(Error::Config(ConfigError::InvalidPressureAdvance(_)))
        ));
    }

    #[test]
    fn test_delta_rods_shorter_than_radius() {
        let delta = DeltaSection {
            diagonal: Millimetres(100.0),
            radius: Millimetres(105.0),
            homed_height: Millimetres(240.0),
            print_radius: Millimetres(85.0),
            angle_corrections: [0.0; 3],
            endstop_adjustments: [0.0; 3],
        };

        assert!(matches!(
            validate_delta(&delta),
            Err(Error::Config(ConfigError::InvalidParameter { letter: 'L', .. }))
        ));
    }

    #[test]
    fn test_reprope_zero_gear_teeth() {
        let reprope = RepropeSection {
            motor_gear_teeth: Some([20, 20, 20, 0, 20, 20, 20, 20]),
            ..Default::default()
        };

        assert!(matches!(
            validate_reprope(&reprope),
            Err(Error::Config(ConfigError::InvalidParameter { letter: 'L', .. }))
        ));
    }
}
