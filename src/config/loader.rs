//! Configuration loading from files (std only).

use std::fs;
use std::path::Path;

use crate::error::{ConfigError, Error, Result};

use super::MachineConfig;

/// Load a machine configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
///
/// # Example
///
/// ```rust,ignore
/// use drive_motion::load_config;
///
/// let config = load_config("machine.toml")?;
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<MachineConfig> {
    let content = fs::read_to_string(path.as_ref()).map_err(|e| {
        let msg = heapless::String::try_from(e.to_string().as_str()).unwrap_or_default();
        Error::Config(ConfigError::IoError(msg))
    })?;

    parse_config(&content)
}

/// Parse a machine configuration from a TOML string.
///
/// # Errors
///
/// Returns an error if the TOML is invalid or fails validation.
pub fn parse_config(content: &str) -> Result<MachineConfig> {
    let config: MachineConfig = toml::from_str(content).map_err(|e| {
        let msg = heapless::String::try_from(e.message()).unwrap_or_default();
        Error::Config(ConfigError::ParseError(msg))
    })?;

    super::validation::validate_config(&config)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KinematicsKind;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[axes.x]
steps_per_mm = 80.0
"#;

        let config = parse_config(toml).unwrap();
        assert!(config.axis("X").is_some());
        assert_eq!(config.kinematics.kind, KinematicsKind::Cartesian);
        assert_eq!(config.step_clock_hz, 1_000_000);
    }

    #[test]
    fn test_parse_delta_config() {
        let toml = r#"
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

[extruders.e0]
steps_per_mm = 420.0
pressure_advance_s = 0.05
"#;

        let config = parse_config(toml).unwrap();
        let delta = config.kinematics.delta.as_ref().unwrap();
        assert_eq!(delta.diagonal.value(), 215.0);
        assert_eq!(delta.angle_corrections, [0.0; 3]);
        assert_eq!(config.num_drives(), 4);
    }

    #[test]
    fn test_delta_without_geometry_rejected() {
        let toml = r#"
[kinematics]
kind = "linear_delta"

[axes.x]
steps_per_mm = 80.0
"#;

        assert!(matches!(
            parse_config(toml),
            Err(Error::Config(ConfigError::ParseError(_)))
        ));
    }
}
