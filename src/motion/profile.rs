//! Motion profile calculation.
//!
//! Provides asymmetric trapezoidal speed profiles along a move, with
//! independent acceleration and deceleration rates, and converts them into
//! the segment chains consumed by the step engine.

use libm::sqrtf;

use super::segment::{MoveSegment, PlannedMove};
use crate::error::Result;

/// Phase of a profile at a given distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MotionPhase {
    /// Accelerating from rest toward the peak speed.
    Accelerating,
    /// Moving at constant peak speed.
    Cruising,
    /// Decelerating from the peak speed to rest.
    Decelerating,
    /// Past the end of the move.
    Complete,
}

/// Rest-to-rest trapezoidal speed profile in mm and seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionProfile {
    /// Move length in mm.
    pub distance: f32,

    /// Distance covered while accelerating.
    pub accel_distance: f32,

    /// Distance covered at peak speed.
    pub cruise_distance: f32,

    /// Distance covered while decelerating.
    pub decel_distance: f32,

    /// Highest speed reached in mm/s.
    pub peak_speed: f32,

    /// Acceleration rate in mm/s².
    pub acceleration: f32,

    /// Deceleration rate in mm/s².
    pub deceleration: f32,
}

impl MotionProfile {
    /// Create an asymmetric trapezoidal profile.
    ///
    /// # Arguments
    ///
    /// * `distance` - Move length in mm
    /// * `max_speed` - Requested top speed in mm/s
    /// * `acceleration` - Acceleration rate in mm/s²
    /// * `deceleration` - Deceleration rate in mm/s²
    pub fn asymmetric_trapezoidal(
        distance: f32,
        max_speed: f32,
        acceleration: f32,
        deceleration: f32,
    ) -> Self {
        if !(distance > 0.0 && max_speed > 0.0 && acceleration > 0.0 && deceleration > 0.0) {
            return Self::zero();
        }

        let accel_distance = max_speed * max_speed / (2.0 * acceleration);
        let decel_distance = max_speed * max_speed / (2.0 * deceleration);

        if accel_distance + decel_distance >= distance {
            // Triangle profile: the peak speed is never reached
            let peak_speed =
                sqrtf(2.0 * distance * acceleration * deceleration / (acceleration + deceleration));
            let accel_distance = peak_speed * peak_speed / (2.0 * acceleration);
            Self {
                distance,
                accel_distance,
                cruise_distance: 0.0,
                decel_distance: distance - accel_distance,
                peak_speed,
                acceleration,
                deceleration,
            }
        } else {
            Self {
                distance,
                accel_distance,
                cruise_distance: distance - accel_distance - decel_distance,
                decel_distance,
                peak_speed: max_speed,
                acceleration,
                deceleration,
            }
        }
    }

    /// Create a symmetric trapezoidal profile (same accel and decel).
    pub fn symmetric_trapezoidal(distance: f32, max_speed: f32, acceleration: f32) -> Self {
        Self::asymmetric_trapezoidal(distance, max_speed, acceleration, acceleration)
    }

    /// Create a zero-length profile (no motion).
    pub fn zero() -> Self {
        Self {
            distance: 0.0,
            accel_distance: 0.0,
            cruise_distance: 0.0,
            decel_distance: 0.0,
            peak_speed: 0.0,
            acceleration: 0.0,
            deceleration: 0.0,
        }
    }

    /// Check if this is a zero-length profile.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.distance <= 0.0
    }

    /// Get the phase at a given distance along the move.
    pub fn phase_at(&self, distance: f32) -> MotionPhase {
        if self.is_zero() || distance >= self.distance {
            MotionPhase::Complete
        } else if distance < self.accel_distance {
            MotionPhase::Accelerating
        } else if distance < self.accel_distance + self.cruise_distance {
            MotionPhase::Cruising
        } else {
            MotionPhase::Decelerating
        }
    }

    /// Seconds spent in each phase.
    pub fn phase_durations(&self) -> (f32, f32, f32) {
        if self.is_zero() {
            return (0.0, 0.0, 0.0);
        }
        (
            self.peak_speed / self.acceleration,
            self.cruise_distance / self.peak_speed,
            self.peak_speed / self.deceleration,
        )
    }

    /// Total duration of the profile in seconds.
    pub fn duration_secs(&self) -> f32 {
        let (accel, cruise, decel) = self.phase_durations();
        accel + cruise + decel
    }

    /// Convert to a segment chain timed in clocks of `clock_hz`.
    pub fn to_planned_move(&self, clock_hz: u32, min_calc_interval: u32) -> Result<PlannedMove> {
        let hz = clock_hz as f32;
        let peak = self.peak_speed / hz;
        let (accel, cruise, decel) = self.phase_durations();

        let mut plan = PlannedMove::new(min_calc_interval);
        if accel > 0.0 {
            plan.push(MoveSegment::from_speeds(0.0, peak, accel * hz))?;
        }
        if cruise > 0.0 {
            plan.push(MoveSegment::linear(self.cruise_distance, cruise * hz))?;
        }
        if decel > 0.0 {
            plan.push(MoveSegment::from_speeds(peak, 0.0, decel * hz))?;
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_profile() {
        let profile = MotionProfile::symmetric_trapezoidal(
            100.0,  // mm
            50.0,   // mm/s
            1000.0, // mm/s²
        );

        assert_eq!(profile.peak_speed, 50.0);
        assert!(profile.cruise_distance > 0.0);
        assert_eq!(profile.accel_distance, profile.decel_distance);
        assert_eq!(profile.phase_at(0.5), MotionPhase::Accelerating);
        assert_eq!(profile.phase_at(50.0), MotionPhase::Cruising);
        assert_eq!(profile.phase_at(99.5), MotionPhase::Decelerating);
        assert_eq!(profile.phase_at(100.0), MotionPhase::Complete);
    }

    #[test]
    fn test_asymmetric_profile() {
        let profile = MotionProfile::asymmetric_trapezoidal(
            100.0,  // mm
            50.0,   // mm/s
            2000.0, // accel mm/s²
            1000.0, // decel mm/s² (slower)
        );

        assert!(profile.decel_distance > profile.accel_distance);
    }

    #[test]
    fn test_triangle_profile() {
        // Very short move that can't reach max speed
        let profile = MotionProfile::symmetric_trapezoidal(
            1.0,    // only 1 mm
            500.0,  // very high max speed
            1000.0, // moderate acceleration
        );

        assert_eq!(profile.cruise_distance, 0.0);
        assert!(profile.peak_speed < 500.0);
        assert!((profile.accel_distance - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_planned_move_matches_profile() {
        let profile = MotionProfile::symmetric_trapezoidal(100.0, 50.0, 1000.0);
        let plan = profile.to_planned_move(1_000_000, 40).unwrap();

        assert_eq!(plan.segments().len(), 3);
        assert!((plan.total_distance() - 100.0).abs() < 1e-3);
        assert!((plan.duration() / 1.0e6 - profile.duration_secs()).abs() < 1e-4);
        assert!(plan.end_speed().abs() < 1e-9);
    }

    #[test]
    fn test_zero_profile() {
        let profile = MotionProfile::symmetric_trapezoidal(0.0, 50.0, 1000.0);
        assert!(profile.is_zero());
        assert!(profile.to_planned_move(1_000_000, 40).unwrap().is_empty());
    }
}
