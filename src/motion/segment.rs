//! Move segments handed from the planner to the step engine.
//!
//! Times are in step clocks, distances in millimetres along the move and
//! accelerations in mm/clock². A segment never changes once it has been
//! queued; its start and end speeds are derived from the stored values.

use heapless::Vec;
use libm::sqrtf;

use crate::error::{MotionError, Result};

/// Most segments a single planned move can hold.
pub const MAX_SEGMENTS: usize = 8;

/// Shape of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SegmentKind {
    /// Speed rises through the segment.
    Accelerating,
    /// Constant speed.
    Linear,
    /// Speed falls through the segment.
    Decelerating,
}

/// One analytically described phase of a move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveSegment {
    kind: SegmentKind,
    duration: f32,
    length: f32,
    acceleration: f32,
}

impl MoveSegment {
    /// Constant-speed segment covering `length` mm in `duration` clocks.
    pub fn linear(length: f32, duration: f32) -> Self {
        Self {
            kind: SegmentKind::Linear,
            duration,
            length,
            acceleration: 0.0,
        }
    }

    /// Segment changing speed from `start_speed` to `end_speed` (mm/clock)
    /// over `duration` clocks.
    pub fn from_speeds(start_speed: f32, end_speed: f32, duration: f32) -> Self {
        let acceleration = if duration > 0.0 {
            (end_speed - start_speed) / duration
        } else {
            0.0
        };
        let kind = if acceleration > 0.0 {
            SegmentKind::Accelerating
        } else if acceleration < 0.0 {
            SegmentKind::Decelerating
        } else {
            SegmentKind::Linear
        };
        Self {
            kind,
            duration,
            length: 0.5 * (start_speed + end_speed) * duration,
            acceleration,
        }
    }

    /// Segment kind.
    #[inline]
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// Duration in clocks.
    #[inline]
    pub fn duration(&self) -> f32 {
        self.duration
    }

    /// Length in mm.
    #[inline]
    pub fn length(&self) -> f32 {
        self.length
    }

    /// Signed acceleration in mm/clock².
    #[inline]
    pub fn acceleration(&self) -> f32 {
        self.acceleration
    }

    /// True for constant-speed segments.
    #[inline]
    pub fn is_linear(&self) -> bool {
        self.kind == SegmentKind::Linear
    }

    /// True for accelerating segments.
    #[inline]
    pub fn is_accelerating(&self) -> bool {
        self.kind == SegmentKind::Accelerating
    }

    /// Speed at the start of the segment in mm/clock.
    #[inline]
    pub fn start_speed(&self) -> f32 {
        self.length / self.duration - 0.5 * self.acceleration * self.duration
    }

    /// Speed at the end of the segment in mm/clock.
    #[inline]
    pub fn end_speed(&self) -> f32 {
        self.length / self.duration + 0.5 * self.acceleration * self.duration
    }

    /// Clocks after the segment start at which `distance` mm has been covered.
    pub fn time_at_distance(&self, distance: f32) -> f32 {
        let u = self.start_speed();
        if self.is_linear() {
            distance / u
        } else {
            let a = self.acceleration;
            let radicand = u * u + 2.0 * a * distance;
            (sqrtf(radicand.max(0.0)) - u) / a
        }
    }

    fn validate(&self) -> Result<()> {
        let speed_tolerance = 1.0e-3 * self.length / self.duration;
        let ok = self.duration.is_finite()
            && self.duration > 0.0
            && self.length.is_finite()
            && self.length >= 0.0
            && (self.kind != SegmentKind::Linear || self.length > 0.0)
            && self.acceleration.is_finite()
            && self.start_speed() >= -speed_tolerance
            && self.end_speed() >= -speed_tolerance;
        if ok {
            Ok(())
        } else {
            Err(MotionError::InvalidSegment.into())
        }
    }
}

/// A chain of segments describing one complete move.
///
/// Segment `i` links to segment `i + 1`; the last segment has no successor.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMove {
    segments: Vec<MoveSegment, MAX_SEGMENTS>,
    total_distance: f32,
    duration: f32,
    min_calc_interval: u32,
}

impl PlannedMove {
    /// Empty move. `min_calc_interval` is the shortest interval in clocks
    /// between full step-time calculations.
    pub fn new(min_calc_interval: u32) -> Self {
        Self {
            segments: Vec::new(),
            total_distance: 0.0,
            duration: 0.0,
            min_calc_interval,
        }
    }

    /// Build a move from a list of segments.
    pub fn from_segments(segments: &[MoveSegment], min_calc_interval: u32) -> Result<Self> {
        let mut plan = Self::new(min_calc_interval);
        for segment in segments {
            plan.push(*segment)?;
        }
        Ok(plan)
    }

    /// Append a segment to the chain.
    pub fn push(&mut self, segment: MoveSegment) -> Result<()> {
        segment.validate()?;
        self.segments
            .push(segment)
            .map_err(|_| MotionError::TooManySegments)?;
        self.total_distance += segment.length;
        self.duration += segment.duration;
        Ok(())
    }

    /// Segment at `index`.
    #[inline]
    pub fn segment(&self, index: usize) -> Option<&MoveSegment> {
        self.segments.get(index)
    }

    /// Index of the segment following `index`, if any.
    #[inline]
    pub fn next_segment(&self, index: usize) -> Option<usize> {
        let next = index + 1;
        (next < self.segments.len()).then_some(next)
    }

    /// Index of the first segment, if any.
    #[inline]
    pub fn first_segment(&self) -> Option<usize> {
        (!self.segments.is_empty()).then_some(0)
    }

    /// True if `index` is the final segment.
    #[inline]
    pub fn is_last(&self, index: usize) -> bool {
        index + 1 == self.segments.len()
    }

    /// All segments in order.
    #[inline]
    pub fn segments(&self) -> &[MoveSegment] {
        &self.segments
    }

    /// True if the move has no segments.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Move length in mm.
    #[inline]
    pub fn total_distance(&self) -> f32 {
        self.total_distance
    }

    /// Exact move duration in clocks.
    #[inline]
    pub fn duration(&self) -> f32 {
        self.duration
    }

    /// Whole clocks needed to complete the move.
    #[inline]
    pub fn clocks_needed(&self) -> u32 {
        libm::ceilf(self.duration) as u32
    }

    /// Shortest interval between full step-time calculations.
    #[inline]
    pub fn min_calc_interval(&self) -> u32 {
        self.min_calc_interval
    }

    /// Speed at the start of the move in mm/clock.
    pub fn start_speed(&self) -> f32 {
        self.segments.first().map_or(0.0, MoveSegment::start_speed)
    }

    /// Speed at the end of the move in mm/clock.
    pub fn end_speed(&self) -> f32 {
        self.segments.last().map_or(0.0, MoveSegment::end_speed)
    }

    /// Cut the part of the move between distances `from` and `to` into a
    /// move of its own. Used to split moves into short linear pieces.
    pub fn slice(&self, from: f32, to: f32) -> Result<Self> {
        let mut piece = Self::new(self.min_calc_interval);
        let mut start = 0.0f32;
        for segment in &self.segments {
            let end = start + segment.length;
            let lo = from.max(start) - start;
            let hi = to.min(end) - start;
            start = end;
            if hi <= lo {
                continue;
            }
            let t_lo = segment.time_at_distance(lo);
            let t_hi = segment.time_at_distance(hi);
            if t_hi <= t_lo {
                continue;
            }
            let sub = if segment.is_linear() {
                MoveSegment::linear(hi - lo, t_hi - t_lo)
            } else {
                let u = segment.start_speed();
                let a = segment.acceleration;
                MoveSegment::from_speeds(u + a * t_lo, u + a * t_hi, t_hi - t_lo)
            };
            piece.push(sub)?;
        }
        if piece.is_empty() {
            return Err(MotionError::InvalidSegment.into());
        }
        Ok(piece)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() <= tol
    }

    fn trapezoid() -> PlannedMove {
        // 0 -> 0.1 mm/clock over 1000 clocks, cruise 1000 clocks, back to rest
        PlannedMove::from_segments(
            &[
                MoveSegment::from_speeds(0.0, 0.1, 1000.0),
                MoveSegment::linear(100.0, 1000.0),
                MoveSegment::from_speeds(0.1, 0.0, 1000.0),
            ],
            40,
        )
        .unwrap()
    }

    #[test]
    fn test_speeds_are_derived() {
        let seg = MoveSegment::from_speeds(0.02, 0.1, 400.0);
        assert_eq!(seg.kind(), SegmentKind::Accelerating);
        assert!(approx(seg.length(), 24.0, 1e-4));
        assert!(approx(seg.start_speed(), 0.02, 1e-6));
        assert!(approx(seg.end_speed(), 0.1, 1e-6));
    }

    #[test]
    fn test_chain_links() {
        let plan = trapezoid();
        assert_eq!(plan.first_segment(), Some(0));
        assert_eq!(plan.next_segment(1), Some(2));
        assert_eq!(plan.next_segment(2), None);
        assert!(plan.is_last(2));
        assert!(approx(plan.total_distance(), 200.0, 1e-3));
        assert_eq!(plan.clocks_needed(), 3000);
    }

    #[test]
    fn test_rejects_bad_segments() {
        let mut plan = PlannedMove::new(40);
        assert!(plan.push(MoveSegment::linear(1.0, 0.0)).is_err());
        assert!(plan.push(MoveSegment::linear(-1.0, 10.0)).is_err());
        assert!(plan.is_empty());

        for _ in 0..MAX_SEGMENTS {
            plan.push(MoveSegment::linear(1.0, 10.0)).unwrap();
        }
        assert_eq!(
            plan.push(MoveSegment::linear(1.0, 10.0)),
            Err(MotionError::TooManySegments.into())
        );
    }

    #[test]
    fn test_time_at_distance() {
        let accel = MoveSegment::from_speeds(0.0, 0.1, 1000.0);
        // s = a t² / 2 with a = 1e-4
        assert!(approx(accel.time_at_distance(12.5), 500.0, 0.05));
        let decel = MoveSegment::from_speeds(0.1, 0.0, 1000.0);
        assert!(approx(decel.time_at_distance(50.0), 1000.0, 1.0));
    }

    #[test]
    fn test_slice_keeps_profile() {
        let plan = trapezoid();
        let piece = plan.slice(25.0, 75.0).unwrap();

        assert!(approx(piece.total_distance(), 50.0, 1e-3));
        assert_eq!(piece.segments().len(), 2);
        assert!(piece.segments()[0].is_accelerating());
        assert!(approx(piece.start_speed(), 0.0707, 1e-3));
        assert!(approx(piece.end_speed(), 0.1, 1e-4));

        let total: f32 = (0..4)
            .map(|i| plan.slice(i as f32 * 50.0, (i + 1) as f32 * 50.0).unwrap().duration())
            .sum();
        assert!(approx(total, plan.duration(), 2.0));
    }
}
