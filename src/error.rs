//! Error types for drive-motion.
//!
//! Configuration and kinematics errors are returned synchronously from
//! non-time-critical code. Step-timing faults are never raised as errors from
//! the step path; they are recorded as drive state and surfaced by the engine.

use core::fmt;

/// Result type alias using the library's Error type.
pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for all drive-motion operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Configuration parsing, validation or command error
    Config(ConfigError),
    /// Geometric infeasibility reported by a kinematics transform
    Kinematics(KinematicsError),
    /// Move preparation or execution error
    Motion(MotionError),
}

/// Configuration-related errors.
///
/// A configuration error always leaves the previously active parameters in place.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Failed to parse TOML configuration or a command line
    ParseError(heapless::String<128>),
    /// A command parameter could not be read as a number
    InvalidNumber(char),
    /// A multi-value parameter had the wrong number of values
    WrongValueCount {
        /// Parameter letter
        letter: char,
        /// Values required
        expected: usize,
        /// Values supplied
        found: usize,
    },
    /// A parameter value is outside its valid range
    InvalidParameter {
        /// Parameter letter or first letter of the TOML key
        letter: char,
        /// Rejected value
        value: f32,
    },
    /// The command code is not understood by the active kinematics
    UnsupportedCommand {
        /// Command code (for example 665)
        code: u16,
        /// Kinematics name
        kinematics: &'static str,
    },
    /// Kinematics type number is unknown or not built into this crate
    UnsupportedKinematics(u32),
    /// Configuration changes are refused while motion is active
    MotionActive,
    /// More drives configured than the drive pool or tables can hold
    TooManyDrives {
        /// Drives requested
        requested: usize,
        /// Capacity available
        capacity: usize,
    },
    /// The kinematics drives more motors than the machine has axes
    TooFewAxes {
        /// Axes the kinematics needs
        required: usize,
        /// Axes configured
        found: usize,
    },
    /// Steps per mm must be positive and finite
    InvalidStepsPerMm(f32),
    /// Invalid axis limits (min must be < max)
    InvalidAxisLimits {
        /// Minimum limit value
        min: f32,
        /// Maximum limit value
        max: f32,
    },
    /// Pressure advance must be zero or positive
    InvalidPressureAdvance(f32),
    /// Step clock must run at a non-zero rate
    InvalidStepClock(u32),
    /// File I/O error (std only)
    #[cfg(feature = "std")]
    IoError(heapless::String<128>),
}

/// Kinematics transform errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KinematicsError {
    /// Target position is outside the reachable workspace
    Unreachable,
    /// Cartesian to motor transform failed for the given position
    TransformFailed,
}

/// Move preparation and execution errors.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionError {
    /// Drive pool has no free slot; the move is refused
    PoolExhausted {
        /// Pool capacity
        capacity: usize,
    },
    /// Handle does not refer to an allocated drive movement
    InvalidHandle(u8),
    /// Move queue has no room for the requested segments
    QueueFull,
    /// Engine is already executing a move
    Busy,
    /// Segment chain is empty or a segment is malformed
    InvalidSegment,
    /// A move has more segments than a planned move can hold
    TooManySegments,
    /// Two requests in one move name the same drive
    DuplicateDrive(u8),
    /// Step sink failed to output a direction or step
    SinkFailure {
        /// Drive being driven
        drive: u8,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::Kinematics(e) => write!(f, "Kinematics error: {}", e),
            Error::Motion(e) => write!(f, "Motion error: {}", e),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            ConfigError::InvalidNumber(letter) => {
                write!(f, "Invalid number after '{}'", letter)
            }
            ConfigError::WrongValueCount { letter, expected, found } => write!(
                f,
                "Wrong number of values after '{}': expected {}, found {}",
                letter, expected, found
            ),
            ConfigError::InvalidParameter { letter, value } => {
                write!(f, "Invalid value {} for parameter '{}'", value, letter)
            }
            ConfigError::UnsupportedCommand { code, kinematics } => write!(
                f,
                "M{} parameters do not apply to {} kinematics",
                code, kinematics
            ),
            ConfigError::UnsupportedKinematics(k) => {
                write!(f, "Kinematics type {} is not supported", k)
            }
            ConfigError::MotionActive => {
                write!(f, "Cannot change configuration while motion is active")
            }
            ConfigError::TooManyDrives { requested, capacity } => write!(
                f,
                "{} drives configured but only {} available",
                requested, capacity
            ),
            ConfigError::TooFewAxes { required, found } => write!(
                f,
                "Kinematics needs {} axes but only {} are configured",
                required, found
            ),
            ConfigError::InvalidStepsPerMm(v) => {
                write!(f, "Invalid steps per mm: {}. Must be > 0", v)
            }
            ConfigError::InvalidAxisLimits { min, max } => {
                write!(f, "Invalid axis limits: min ({}) must be < max ({})", min, max)
            }
            ConfigError::InvalidPressureAdvance(v) => {
                write!(f, "Invalid pressure advance: {}. Must be >= 0", v)
            }
            ConfigError::InvalidStepClock(v) => {
                write!(f, "Invalid step clock rate: {}. Must be > 0", v)
            }
            #[cfg(feature = "std")]
            ConfigError::IoError(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl fmt::Display for KinematicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KinematicsError::Unreachable => write!(f, "Target position is not reachable"),
            KinematicsError::TransformFailed => {
                write!(f, "Cannot convert position to motor steps")
            }
        }
    }
}

impl fmt::Display for MotionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionError::PoolExhausted { capacity } => {
                write!(f, "Drive movement pool exhausted (capacity {})", capacity)
            }
            MotionError::InvalidHandle(h) => write!(f, "Invalid drive movement handle {}", h),
            MotionError::QueueFull => write!(f, "Move queue is full"),
            MotionError::Busy => write!(f, "A move is already executing"),
            MotionError::InvalidSegment => write!(f, "Invalid move segment"),
            MotionError::TooManySegments => write!(f, "Too many segments in move"),
            MotionError::DuplicateDrive(drive) => write!(f, "Drive {} requested twice in one move", drive),
            MotionError::SinkFailure { drive } => {
                write!(f, "Step output failed on drive {}", drive)
            }
        }
    }
}

// Conversion impls
impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<KinematicsError> for Error {
    fn from(e: KinematicsError) -> Self {
        Error::Kinematics(e)
    }
}

impl From<MotionError> for Error {
    fn from(e: MotionError) -> Self {
        Error::Motion(e)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(feature = "std")]
impl std::error::Error for ConfigError {}

#[cfg(feature = "std")]
impl std::error::Error for KinematicsError {}

#[cfg(feature = "std")]
impl std::error::Error for MotionError {}
