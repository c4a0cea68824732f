//! Motion execution.
//!
//! Planned moves arrive as chains of [`MoveSegment`]s. The [`StepEngine`]
//! turns each move into step times for every drive, one [`DriveMovement`]
//! per moving drive, drawn from a fixed [`DrivePool`].

mod drive_movement;
mod engine;
mod pool;
mod profile;
mod queue;
mod segment;

pub use drive_movement::{CartesianParams, DeltaAxisMove, DeltaParams, DmState, DriveMovement, MotionParams};
pub use engine::{DriveKind, DriveRequest, StepEngine, StepOutcome};
pub use pool::{DmHandle, DrivePool};
pub use profile::{MotionPhase, MotionProfile};
pub use queue::{MoveQueue, QueuedMove};
pub use segment::{MoveSegment, PlannedMove, SegmentKind, MAX_SEGMENTS};
