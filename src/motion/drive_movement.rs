//! Step timing for one drive during one move.
//!
//! A [`DriveMovement`] walks the segments of a [`PlannedMove`] and works out
//! when each step of its drive is due, measured in clocks from the start of
//! the move. Step `n` of a forwards-moving drive falls at drive distance
//! `n / steps_per_mm`; once the reverse start step is reached the drive
//! retraces, so step `n` falls at `2 * (reverse_start_step - 1) - n` steps.
//!
//! Errors found while timing steps are never returned; the drive enters
//! [`DmState::StepError`] and the engine reports the fault.

use libm::{floorf, roundf, sqrtf};

use super::segment::PlannedMove;
use crate::kinematics::DeltaTower;

const NO_STEP_INTERVAL: u32 = u32::MAX;

/// Drive movement state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DmState {
    /// Not moving.
    #[default]
    Idle = 0,
    /// Step timing failed; no further steps for this move.
    StepError,
    /// Accelerating or decelerating, no reversal ahead in this segment.
    CartAccelOrDecelNoReverse,
    /// Steady speed.
    CartLinear,
    /// Decelerating forwards, reversal expected.
    CartDecelForwardsReversing,
    /// Decelerating after reversal.
    CartDecelReverse,
    /// Delta tower moving up, no reversal in this segment.
    DeltaForwardsNoReverse,
    /// Delta tower moving up, reversal in this segment.
    DeltaForwardsReversing,
    /// Delta tower moving down.
    DeltaReverse,
}

impl DmState {
    /// True for every state in which steps are still generated.
    #[inline]
    pub fn is_moving(self) -> bool {
        self as u8 >= DmState::CartAccelOrDecelNoReverse as u8
    }
}

/// Parameters for Cartesian axes and extruders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CartesianParams {
    /// Pressure advance in clocks; zero for axes.
    pub pressure_advance_k: f32,
    /// Drive steps per mm of move.
    pub effective_steps_per_mm: f32,
    /// Reciprocal of `effective_steps_per_mm`.
    pub effective_mm_per_step: f32,
    /// Extra drive distance at the end of the move caused by pressure advance.
    pub extra_extrusion_distance: f32,
}

/// Parameters for a delta tower driven without segmentation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaParams {
    two_a: f32,
    two_b: f32,
    d2_minus_a2_minus_b2_times_s2: f32,
    h0_minus_z0: f32,
    /// Carriage height above the start height, in steps
    hmz0s: f32,
    minus_aa_plus_bb_times_s: f32,
    reverse_start_distance: f32,
    steps_per_mm: f32,
    direction: [f32; 3],
}

impl DeltaParams {
    /// Move distance at which the carriage reverses.
    #[inline]
    pub fn reverse_start_distance(&self) -> f32 {
        self.reverse_start_distance
    }
}

/// Motion-law parameters, selected by the kind of drive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionParams {
    /// Axis or extruder stepping proportionally to move distance.
    Cartesian(CartesianParams),
    /// Delta tower following the rod constraint.
    Delta(DeltaParams),
}

impl Default for MotionParams {
    fn default() -> Self {
        MotionParams::Cartesian(CartesianParams {
            pressure_advance_k: 0.0,
            effective_steps_per_mm: 0.0,
            effective_mm_per_step: 0.0,
            extra_extrusion_distance: 0.0,
        })
    }
}

/// Geometry of one delta tower for a move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaAxisMove {
    /// Tower position and rod length.
    pub tower: DeltaTower,
    /// Head X and Y at the start of the move.
    pub start_xy: [f32; 2],
    /// Unit vector of the XYZ move.
    pub direction: [f32; 3],
    /// Carriage steps per mm.
    pub steps_per_mm: f32,
}

/// Step generation state for one drive during the current move.
#[derive(Debug, Clone, PartialEq)]
pub struct DriveMovement {
    state: DmState,
    drive: u8,
    direction: bool,
    direction_changed: bool,
    is_delta: bool,
    is_extruder: bool,
    steps_till_recalc: u32,

    total_steps: u32,
    next_step: u32,
    phase_step_limit: u32,
    reverse_start_step: u32,
    next_step_time: u32,
    step_interval: u32,

    segment: Option<usize>,
    distance_so_far: f32,
    time_so_far: f32,
    p_a: f32,
    p_b: f32,
    p_c: f32,

    params: MotionParams,
}

impl DriveMovement {
    /// Idle drive movement for `drive`.
    pub fn new(drive: u8) -> Self {
        Self {
            state: DmState::Idle,
            drive,
            direction: true,
            direction_changed: false,
            is_delta: false,
            is_extruder: false,
            steps_till_recalc: 0,
            total_steps: 0,
            next_step: 0,
            phase_step_limit: 0,
            reverse_start_step: 1,
            next_step_time: 0,
            step_interval: NO_STEP_INTERVAL,
            segment: None,
            distance_so_far: 0.0,
            time_so_far: 0.0,
            p_a: 0.0,
            p_b: 0.0,
            p_c: 0.0,
            params: MotionParams::default(),
        }
    }

    /// Reassign this object to `drive` and clear all move state.
    pub fn reset(&mut self, drive: u8, state: DmState) {
        *self = Self::new(drive);
        self.state = state;
    }

    /// Drive controlled by this movement.
    #[inline]
    pub fn drive(&self) -> u8 {
        self.drive
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> DmState {
        self.state
    }

    /// True when moving forwards (increasing motor position).
    #[inline]
    pub fn direction(&self) -> bool {
        self.direction
    }

    /// True if the direction must be sent before the next step.
    #[inline]
    pub fn direction_changed(&self) -> bool {
        self.direction_changed
    }

    /// Return and clear the direction-changed flag.
    #[inline]
    pub fn take_direction_changed(&mut self) -> bool {
        core::mem::take(&mut self.direction_changed)
    }

    /// True if this drive uses the delta motion law.
    #[inline]
    pub fn is_delta(&self) -> bool {
        self.is_delta
    }

    /// True if this drive is an extruder.
    #[inline]
    pub fn is_extruder(&self) -> bool {
        self.is_extruder
    }

    /// Steps in this move, counting both sides of a reversal.
    #[inline]
    pub fn total_steps(&self) -> u32 {
        self.total_steps
    }

    /// Number of the step whose time was last calculated.
    #[inline]
    pub fn next_step(&self) -> u32 {
        self.next_step
    }

    /// Step at which the direction reverses; greater than `total_steps`
    /// when the move has no reversal.
    #[inline]
    pub fn reverse_start_step(&self) -> u32 {
        self.reverse_start_step
    }

    /// First step of the next phase.
    #[inline]
    pub fn phase_step_limit(&self) -> u32 {
        self.phase_step_limit
    }

    /// Clocks after the move start at which the next step is due.
    #[inline]
    pub fn next_step_time(&self) -> u32 {
        self.next_step_time
    }

    /// Clocks between the current steps.
    #[inline]
    pub fn step_interval(&self) -> u32 {
        self.step_interval
    }

    /// Steps generated per full calculation, minus one.
    #[inline]
    pub fn steps_till_recalc(&self) -> u32 {
        self.steps_till_recalc
    }

    /// Motion-law parameters.
    #[inline]
    pub fn params(&self) -> &MotionParams {
        &self.params
    }

    /// Prepare a drive whose position is proportional to move distance.
    ///
    /// Returns false if there is nothing to step.
    pub fn prepare_cartesian(&mut self, plan: &PlannedMove, net_steps: i32) -> bool {
        self.is_delta = false;
        self.is_extruder = false;
        self.direction = net_steps >= 0;
        self.total_steps = net_steps.unsigned_abs();
        self.reverse_start_step = self.total_steps + 1;

        let distance = plan.total_distance();
        if self.total_steps == 0 || !(distance > 0.0) {
            self.state = DmState::Idle;
            return false;
        }
        let spm = self.total_steps as f32 / distance;
        self.params = MotionParams::Cartesian(CartesianParams {
            pressure_advance_k: 0.0,
            effective_steps_per_mm: spm,
            effective_mm_per_step: 1.0 / spm,
            extra_extrusion_distance: 0.0,
        });
        self.start(plan)
    }

    /// Prepare an extruder drive.
    ///
    /// `pressure_advance` is in clocks and only applies to forward extrusion.
    /// A `reverse_start_step` supplied by the planner replaces the computed
    /// one when it falls within the final decelerating segment.
    pub fn prepare_extruder(
        &mut self,
        plan: &PlannedMove,
        net_steps: i32,
        pressure_advance: f32,
        reverse_start_step: Option<u32>,
    ) -> bool {
        self.is_delta = false;
        self.is_extruder = true;
        self.direction = net_steps >= 0;
        let commanded = net_steps.unsigned_abs();

        let distance = plan.total_distance();
        if commanded == 0 || !(distance > 0.0) {
            self.state = DmState::Idle;
            return false;
        }
        let spm = commanded as f32 / distance;

        let mut k = if net_steps > 0 { pressure_advance.max(0.0) } else { 0.0 };
        if k > 0.0 && !advance_keeps_forward(plan, k) {
            debug!("drive {}: pressure advance dropped for this move", self.drive);
            k = 0.0;
        }
        let extra = k * (plan.end_speed() - plan.start_speed());
        self.params = MotionParams::Cartesian(CartesianParams {
            pressure_advance_k: k,
            effective_steps_per_mm: spm,
            effective_mm_per_step: 1.0 / spm,
            extra_extrusion_distance: extra,
        });

        if k == 0.0 {
            self.total_steps = commanded;
            self.reverse_start_step = commanded + 1;
            return self.start(plan);
        }

        let (peak, end) = extruder_extent(plan, k);
        let net = roundf(end * spm) as i32;
        let forward = floorf(peak * spm) as i32;

        match reverse_start_step.filter(|&rss| planned_reversal_fits(plan, k, spm, rss, net)) {
            Some(rss) => {
                self.reverse_start_step = rss;
                self.total_steps = (2 * (rss as i32 - 1) - net) as u32;
            }
            None if forward > net => {
                self.reverse_start_step = forward as u32 + 1;
                self.total_steps = (2 * forward - net) as u32;
            }
            None => {
                self.total_steps = net.max(0) as u32;
                self.reverse_start_step = self.total_steps + 1;
            }
        }
        if self.total_steps == 0 {
            self.state = DmState::Idle;
            return false;
        }
        self.start(plan)
    }

    /// Prepare a delta tower carriage for an unsegmented move.
    ///
    /// `net_steps` is the carriage's net motion; the reversal point, if the
    /// carriage rises and falls during the move, comes from the rod
    /// constraint.
    pub fn prepare_delta(&mut self, plan: &PlannedMove, net_steps: i32, geometry: &DeltaAxisMove) -> bool {
        self.is_delta = true;
        self.is_extruder = false;
        self.direction = net_steps >= 0;
        self.total_steps = net_steps.unsigned_abs();

        // Zero net steps can still rise and fall
        let distance = plan.total_distance();
        if !(distance > 0.0) {
            self.state = DmState::Idle;
            return false;
        }

        let s = geometry.steps_per_mm;
        let [dx, dy, dz] = geometry.direction;
        let a = geometry.start_xy[0] - geometry.tower.x;
        let b = geometry.start_xy[1] - geometry.tower.y;
        let a_aplus_bb = a * dx + b * dy;
        let d2_minus_a2_minus_b2 = geometry.tower.diagonal_squared - a * a - b * b;
        if !(d2_minus_a2_minus_b2 > 0.0) || !(s > 0.0) {
            self.state = DmState::StepError;
            return false;
        }
        let h0_minus_z0 = sqrtf(d2_minus_a2_minus_b2);

        let a2_plus_b2 = dx * dx + dy * dy;
        let mut reversal = None;
        if a2_plus_b2 > 0.0 {
            // Lower root of the rod equation: carriage above the bed
            let cross = a * dy - b * dx;
            let radicand = a2_plus_b2 * geometry.tower.diagonal_squared - cross * cross;
            let drev = (dz * sqrtf(radicand.max(0.0)) - a_aplus_bb) / a2_plus_b2;
            if drev > 0.0 && drev < distance {
                let hrev = dz * drev
                    + sqrtf(
                        (d2_minus_a2_minus_b2 - 2.0 * drev * a_aplus_bb - a2_plus_b2 * drev * drev)
                            .max(0.0),
                    );
                let num_steps_up = ((hrev - h0_minus_z0) * s) as i32;
                // Already at the peak, or the peak is the end of an upward move
                let trivial = num_steps_up < 1 || (self.direction && num_steps_up as u32 <= self.total_steps);
                if !trivial {
                    reversal = Some((drev, num_steps_up as u32));
                }
            }
        }

        let reverse_start_distance = match reversal {
            Some((drev, up)) => {
                self.reverse_start_step = up + 1;
                self.total_steps = if self.direction {
                    2 * up - self.total_steps
                } else {
                    2 * up + self.total_steps
                };
                self.direction = true;
                drev
            }
            None => {
                self.reverse_start_step = self.total_steps + 1;
                if self.direction {
                    distance + 1.0
                } else {
                    -1.0
                }
            }
        };
        if self.total_steps == 0 {
            self.state = DmState::Idle;
            return false;
        }

        self.params = MotionParams::Delta(DeltaParams {
            two_a: 2.0 * a,
            two_b: 2.0 * b,
            d2_minus_a2_minus_b2_times_s2: d2_minus_a2_minus_b2 * s * s,
            h0_minus_z0,
            hmz0s: h0_minus_z0 * s,
            minus_aa_plus_bb_times_s: -(a_aplus_bb * s),
            reverse_start_distance,
            steps_per_mm: s,
            direction: geometry.direction,
        });
        self.start(plan)
    }

    fn start(&mut self, plan: &PlannedMove) -> bool {
        self.next_step = 0;
        self.next_step_time = 0;
        self.step_interval = NO_STEP_INTERVAL;
        self.steps_till_recalc = 0;
        self.direction_changed = true;
        self.distance_so_far = 0.0;
        self.time_so_far = 0.0;
        self.segment = plan.first_segment();
        if self.new_segment(plan) {
            true
        } else {
            self.state = DmState::StepError;
            false
        }
    }

    fn new_segment(&mut self, plan: &PlannedMove) -> bool {
        if self.is_delta {
            self.new_delta_segment(plan)
        } else {
            self.new_cartesian_segment(plan)
        }
    }

    fn new_cartesian_segment(&mut self, plan: &PlannedMove) -> bool {
        let MotionParams::Cartesian(cart) = self.params else {
            return false;
        };
        loop {
            let Some(index) = self.segment else {
                return false;
            };
            let Some(seg) = plan.segment(index) else {
                return false;
            };
            let a = seg.acceleration();
            let t = seg.duration();
            // Drive speed includes the pressure advance term
            let u = seg.start_speed() + cart.pressure_advance_k * a;
            let d0 = self.distance_so_far;
            let last = plan.is_last(index);

            if seg.is_linear() {
                // time = pB + pC * n
                self.p_b = self.time_so_far - d0 / u;
                self.p_c = cart.effective_mm_per_step / u;
                self.state = DmState::CartLinear;
            } else {
                // time = pB +/- sqrt(pA + pC * n)
                let ua = u / a;
                self.p_a = ua * ua - 2.0 * d0 / a;
                self.p_b = self.time_so_far - ua;
                self.p_c = 2.0 * cart.effective_mm_per_step / a;
                self.state = if last && self.reverse_start_step <= self.total_steps {
                    DmState::CartDecelForwardsReversing
                } else {
                    DmState::CartAccelOrDecelNoReverse
                };
            }

            self.distance_so_far += u * t + 0.5 * a * t * t;
            self.time_so_far += t;
            self.phase_step_limit = if last {
                self.total_steps + 1
            } else {
                (self.distance_so_far * cart.effective_steps_per_mm).max(0.0) as u32 + 1
            };
            if self.next_step < self.phase_step_limit {
                return true;
            }
            self.segment = plan.next_segment(index);
        }
    }

    fn new_delta_segment(&mut self, plan: &PlannedMove) -> bool {
        let MotionParams::Delta(delta) = self.params else {
            return false;
        };
        let s = delta.steps_per_mm;
        let [dx, dy, dz] = delta.direction;
        loop {
            let Some(index) = self.segment else {
                return false;
            };
            let Some(seg) = plan.segment(index) else {
                return false;
            };
            let u = seg.start_speed();
            let start_distance = self.distance_so_far;
            if seg.is_linear() {
                self.p_b = self.time_so_far - start_distance / u;
                self.p_c = 1.0 / (s * u);
            } else {
                let a = seg.acceleration();
                let ua = u / a;
                self.p_a = ua * ua - 2.0 * start_distance / a;
                self.p_b = self.time_so_far - ua;
                self.p_c = 2.0 / (s * a);
            }
            self.distance_so_far += seg.length();
            self.time_so_far += seg.duration();

            // Carriage height at the end of the segment, in steps from the start
            let end = self.distance_so_far;
            let sdx = end * dx;
            let sdy = end * dy;
            let net_at_end = (sqrtf(
                (delta.d2_minus_a2_minus_b2_times_s2
                    - s * s * (delta.two_a * sdx + delta.two_b * sdy + sdx * sdx + sdy * sdy))
                    .max(0.0),
            ) + (end * dz - delta.h0_minus_z0) * s) as i64;

            let last = plan.is_last(index);
            let rss = i64::from(self.reverse_start_step);
            let limit: i64 = if delta.reverse_start_distance <= start_distance {
                // Purely downwards: upper root of the quadratic
                if self.direction {
                    self.direction = false;
                    self.direction_changed = true;
                }
                self.state = DmState::DeltaReverse;
                if last {
                    i64::from(self.total_steps) + 1
                } else if self.reverse_start_step <= self.total_steps {
                    2 * rss - net_at_end - 1
                } else {
                    1 - net_at_end
                }
            } else if end <= delta.reverse_start_distance {
                self.state = DmState::DeltaForwardsNoReverse;
                if last {
                    i64::from(self.total_steps) + 1
                } else {
                    net_at_end + 1
                }
            } else {
                self.state = DmState::DeltaForwardsReversing;
                if last {
                    i64::from(self.total_steps) + 1
                } else {
                    2 * rss - net_at_end - 1
                }
            };
            self.phase_step_limit = limit.clamp(0, i64::from(u32::MAX)) as u32;

            if self.next_step < self.phase_step_limit {
                return true;
            }
            self.segment = plan.next_segment(index);
        }
    }

    /// Work out the time of the next step.
    ///
    /// Returns true if a step is pending. When the move is finished,
    /// `next_step` is `total_steps + 1` and the state is idle.
    #[inline]
    pub fn calc_next_step_time(&mut self, plan: &PlannedMove) -> bool {
        if !self.state.is_moving() {
            return false;
        }
        self.next_step += 1;
        if self.next_step <= self.total_steps {
            if self.steps_till_recalc != 0 {
                // Double, quad or octal stepping at even intervals
                self.steps_till_recalc -= 1;
                self.next_step_time = self.next_step_time.saturating_add(self.step_interval);
                return true;
            }
            return self.calc_next_step_time_full(plan);
        }
        self.state = DmState::Idle;
        false
    }

    fn steps_to_limit(&self) -> u32 {
        let limit = if self.next_step < self.reverse_start_step
            && self.reverse_start_step <= self.phase_step_limit
        {
            self.reverse_start_step
        } else {
            self.phase_step_limit
        };
        limit.saturating_sub(self.next_step)
    }

    fn step_error(&mut self) -> bool {
        self.state = DmState::StepError;
        false
    }

    fn calc_next_step_time_full(&mut self, plan: &PlannedMove) -> bool {
        let mut shift = 0u32;
        let steps_to_limit = self.steps_to_limit();
        if steps_to_limit == 0 {
            // Segment exhausted; single step into the next one
            self.segment = self.segment.and_then(|i| plan.next_segment(i));
            if !self.new_segment(plan) {
                return self.step_error();
            }
        } else {
            let mci = plan.min_calc_interval();
            if self.step_interval < mci {
                if self.step_interval < mci / 4 && steps_to_limit > 8 {
                    shift = 3;
                } else if self.step_interval < mci / 2 && steps_to_limit > 4 {
                    shift = 2;
                } else if steps_to_limit > 2 {
                    shift = 1;
                }
            }
        }
        self.steps_till_recalc = (1u32 << shift) - 1;

        let next_calc_step = self.next_step + self.steps_till_recalc;
        let accelerating = self
            .segment
            .and_then(|i| plan.segment(i))
            .map_or(false, |seg| seg.is_accelerating());
        let linear = self
            .segment
            .and_then(|i| plan.segment(i))
            .map_or(false, |seg| seg.is_linear());

        let time = match self.state {
            DmState::CartLinear => self.p_b + self.p_c * next_calc_step as f32,
            DmState::CartAccelOrDecelNoReverse => {
                let root = sqrtf((self.p_a + self.p_c * next_calc_step as f32).max(0.0));
                if accelerating {
                    self.p_b + root
                } else {
                    self.p_b - root
                }
            }
            DmState::CartDecelForwardsReversing | DmState::CartDecelReverse => {
                if self.state == DmState::CartDecelForwardsReversing
                    && next_calc_step >= self.reverse_start_step
                {
                    self.direction = !self.direction;
                    self.direction_changed = true;
                    self.state = DmState::CartDecelReverse;
                }
                if self.state == DmState::CartDecelReverse {
                    // Retrace: net position in steps can go negative
                    let net = 2 * (i64::from(self.reverse_start_step) - 1) - i64::from(next_calc_step);
                    self.p_b + sqrtf((self.p_a + self.p_c * net as f32).max(0.0))
                } else {
                    self.p_b - sqrtf((self.p_a + self.p_c * next_calc_step as f32).max(0.0))
                }
            }
            DmState::DeltaForwardsNoReverse | DmState::DeltaForwardsReversing | DmState::DeltaReverse => {
                if self.state == DmState::DeltaForwardsReversing && next_calc_step >= self.reverse_start_step {
                    self.direction = false;
                    self.direction_changed = true;
                    self.state = DmState::DeltaReverse;
                }
                let forwards = self.direction;
                let MotionParams::Delta(ref mut delta) = self.params else {
                    return self.step_error();
                };
                let group = (self.steps_till_recalc + 1) as f32;
                delta.hmz0s += if forwards { group } else { -group };

                let t1 = delta.minus_aa_plus_bb_times_s + delta.hmz0s * delta.direction[2];
                let t2a = delta.d2_minus_a2_minus_b2_times_s2 - delta.hmz0s * delta.hmz0s + t1 * t1;
                let t2 = if t2a > 0.0 { sqrtf(t2a) } else { 0.0 };
                let ds = if forwards { t1 - t2 } else { t1 + t2 };
                if ds < 0.0 {
                    return self.step_error();
                }

                let p_cds = self.p_c * ds;
                if linear {
                    self.p_b + p_cds
                } else if accelerating {
                    self.p_b + sqrtf((self.p_a + p_cds).max(0.0))
                } else {
                    self.p_b - sqrtf((self.p_a + p_cds).max(0.0))
                }
            }
            DmState::Idle | DmState::StepError => return false,
        };

        if !time.is_finite() {
            return self.step_error();
        }
        let mut step_time = if time <= 0.0 { 0 } else { time as u32 };

        let clocks_needed = plan.clocks_needed();
        if step_time > clocks_needed {
            // The last step is sensitive to rounding when the end speed is low
            if next_calc_step + 1 >= self.total_steps {
                step_time = clocks_needed;
            } else {
                return self.step_error();
            }
        }
        if self.next_step > 1 && step_time.saturating_add(2) < self.next_step_time {
            return self.step_error();
        }

        self.step_interval = step_time.saturating_sub(self.next_step_time) >> shift;
        self.next_step_time = step_time - self.steps_till_recalc * self.step_interval;
        true
    }

    /// Net steps still to take in the forwards direction.
    pub fn net_steps_left(&self) -> i32 {
        let total = self.total_steps as i32;
        let next = self.next_step as i32;
        let left = if self.reverse_start_step > self.total_steps {
            if next == 0 {
                total
            } else {
                total - next + 1
            }
        } else if self.next_step >= self.reverse_start_step {
            total - next + 1
        } else {
            let total_net = 2 * self.reverse_start_step as i32 - total - 2;
            if next == 0 {
                total_net
            } else {
                total_net - next + 1
            }
        };
        if self.direction {
            left
        } else {
            -left
        }
    }

    /// Net steps already taken in the forwards direction.
    pub fn net_steps_taken(&self) -> i32 {
        let next = self.next_step as i32;
        let taken = if self.next_step < self.reverse_start_step || self.reverse_start_step > self.total_steps {
            if next == 0 {
                0
            } else {
                next - 1
            }
        } else {
            // Direction has already flipped
            next - 2 * self.reverse_start_step as i32 + 1
        };
        if self.direction {
            taken
        } else {
            -taken
        }
    }

    /// Current interval between full steps, or zero before the first full
    /// step and on the final step.
    pub fn step_interval_full_steps(&self, microstep_shift: u32) -> u32 {
        if self.next_step < self.total_steps && self.next_step > (1u32 << microstep_shift) {
            self.step_interval << microstep_shift
        } else {
            0
        }
    }

    /// Stop generating steps and return the net steps taken.
    pub fn stop(&mut self) -> i32 {
        let taken = self.net_steps_taken();
        if self.state.is_moving() {
            self.state = DmState::Idle;
        }
        taken
    }
}

/// True if pressure advance `k` never drives the extruder backwards before
/// the final segment.
fn advance_keeps_forward(plan: &PlannedMove, k: f32) -> bool {
    let segments = plan.segments();
    let Some((_, leading)) = segments.split_last() else {
        return true;
    };
    leading.iter().all(|seg| {
        let w0 = seg.start_speed() + k * seg.acceleration();
        w0 >= 0.0 && w0 + seg.acceleration() * seg.duration() >= 0.0
    })
}

/// Highest drive distance reached and drive distance at the end of the move,
/// with pressure advance `k`.
fn extruder_extent(plan: &PlannedMove, k: f32) -> (f32, f32) {
    let mut d = 0.0f32;
    let mut peak = 0.0f32;
    for seg in plan.segments() {
        let a = seg.acceleration();
        let t = seg.duration();
        let w0 = seg.start_speed() + k * a;
        if a < 0.0 && w0 > 0.0 && w0 + a * t < 0.0 {
            peak = peak.max(d - w0 * w0 / (2.0 * a));
        }
        d += w0 * t + 0.5 * a * t * t;
        peak = peak.max(d);
    }
    (peak, d)
}

/// Check a planner-supplied reverse start step against the move.
fn planned_reversal_fits(plan: &PlannedMove, k: f32, spm: f32, rss: u32, net: i32) -> bool {
    let segments = plan.segments();
    let Some((last, leading)) = segments.split_last() else {
        return false;
    };
    if last.acceleration() >= 0.0 || rss < 1 || (rss as i64) < i64::from(net) + 2 {
        return false;
    }
    let start_of_last: f32 = leading
        .iter()
        .map(|seg| {
            let a = seg.acceleration();
            let t = seg.duration();
            (seg.start_speed() + k * a) * t + 0.5 * a * t * t
        })
        .sum();
    rss >= (start_of_last * spm).max(0.0) as u32 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::profile::MotionProfile;
    use crate::motion::segment::MoveSegment;

    const HZ: u32 = 1_000_000;

    fn trapezoid(distance: f32, speed: f32, accel: f32, mci: u32) -> PlannedMove {
        MotionProfile::symmetric_trapezoidal(distance, speed, accel)
            .to_planned_move(HZ, mci)
            .unwrap()
    }

    /// Run a prepared drive to the end, returning the step times.
    fn run(dm: &mut DriveMovement, plan: &PlannedMove) -> heapless::Vec<u32, 1024> {
        let mut times = heapless::Vec::new();
        while dm.calc_next_step_time(plan) {
            let _ = times.push(dm.next_step_time());
        }
        times
    }

    #[test]
    fn test_cartesian_step_count_and_order() {
        let plan = trapezoid(10.0, 50.0, 1000.0, 40);
        let mut dm = DriveMovement::new(0);
        assert!(dm.prepare_cartesian(&plan, 800));
        assert_eq!(dm.next_step(), 0);
        assert_eq!(dm.net_steps_left(), 800);

        let times = run(&mut dm, &plan);
        assert_eq!(times.len(), 800);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert!(*times.last().unwrap() <= plan.clocks_needed());
        assert_eq!(dm.state(), DmState::Idle);
        assert_eq!(dm.next_step(), 801);
        assert_eq!(dm.net_steps_taken(), 800);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(64))]

        #[test]
        fn steps_are_monotonic_and_complete(
            distance in 0.5f32..20.0,
            speed in 5.0f32..150.0,
            accel in 200.0f32..5000.0,
            spm in 10.0f32..160.0,
        ) {
            let plan = trapezoid(distance, speed, accel, 40);
            let steps = libm::roundf(distance * spm) as u32;
            proptest::prop_assume!(steps > 0);

            let mut dm = DriveMovement::new(0);
            proptest::prop_assert!(dm.prepare_cartesian(&plan, steps as i32));
            let mut count = 0u32;
            let mut last = 0u32;
            while dm.calc_next_step_time(&plan) {
                proptest::prop_assert!(dm.next_step_time() >= last);
                last = dm.next_step_time();
                count += 1;
            }
            proptest::prop_assert_eq!(dm.state(), DmState::Idle);
            proptest::prop_assert_eq!(count, steps);
            proptest::prop_assert!(last <= plan.clocks_needed());
        }
    }

    #[test]
    fn test_cartesian_step_times() {
        let plan = trapezoid(10.0, 50.0, 1000.0, 40);
        let mut dm = DriveMovement::new(0);
        dm.prepare_cartesian(&plan, 800);
        let times = run(&mut dm, &plan);

        // First step at 1/80 mm: t = sqrt(2 s / a)
        let first = libm::sqrtf(2.0 * 0.0125 / 1.0e-9);
        assert!((times[0] as f32 - first).abs() <= 1.0);

        // Cruise at 50 mm/s and 80 steps/mm is 250 clocks per step
        assert!((times[400] as i64 - times[399] as i64 - 250).abs() <= 1);

        // Step 400 at 5 mm: 50 ms accelerating plus 3.75 mm at cruise
        assert!((times[399] as f32 - 125_000.0).abs() <= 2.0);
    }

    #[test]
    fn test_reverse_direction() {
        let plan = trapezoid(10.0, 50.0, 1000.0, 40);
        let mut dm = DriveMovement::new(3);
        assert!(dm.prepare_cartesian(&plan, -800));
        assert!(!dm.direction());
        assert_eq!(dm.net_steps_left(), -800);
        run(&mut dm, &plan);
        assert_eq!(dm.net_steps_taken(), -800);
    }

    #[test]
    fn test_multi_stepping_at_high_rates() {
        // 1000 steps/mm at 50 mm/s is 20 clocks per step
        let plan = trapezoid(10.0, 50.0, 1000.0, 40);
        let mut dm = DriveMovement::new(0);
        dm.prepare_cartesian(&plan, 10_000);

        let mut grouped = 0;
        let mut count = 0;
        while dm.calc_next_step_time(&plan) {
            count += 1;
            if dm.steps_till_recalc() > 0 {
                grouped += 1;
            }
        }
        assert_eq!(count, 10_000);
        assert!(grouped > 0);
        assert_eq!(dm.state(), DmState::Idle);
    }

    #[test]
    fn test_nothing_to_do() {
        let plan = trapezoid(10.0, 50.0, 1000.0, 40);
        let mut dm = DriveMovement::new(0);
        assert!(!dm.prepare_cartesian(&plan, 0));
        assert_eq!(dm.state(), DmState::Idle);
        assert!(!dm.calc_next_step_time(&plan));
    }

    #[test]
    fn test_net_steps_without_reversal() {
        let plan = trapezoid(10.0, 50.0, 1000.0, 40);
        let mut dm = DriveMovement::new(0);
        dm.prepare_cartesian(&plan, 800);
        assert_eq!(dm.net_steps_left() + dm.net_steps_taken(), 800);
        while dm.calc_next_step_time(&plan) {
            assert_eq!(dm.net_steps_left() + dm.net_steps_taken(), 800);
            assert!(dm.next_step() <= dm.total_steps() + 1);
        }
    }

    #[test]
    fn test_extruder_pressure_advance_reversal() {
        // 10 mm rest-to-rest move, 100 extruder steps, 45 ms pressure advance
        let plan = trapezoid(10.0, 50.0, 1000.0, 40);
        let mut dm = DriveMovement::new(3);
        assert!(dm.prepare_extruder(&plan, 100, 0.045 * HZ as f32, None));

        // Peak drive distance 11.0125 mm, end 10 mm
        assert_eq!(dm.reverse_start_step(), 111);
        assert_eq!(dm.total_steps(), 120);
        assert_eq!(dm.net_steps_left(), 100);

        let mut last_time = 0;
        let mut flipped_at = None;
        while dm.calc_next_step_time(&plan) {
            if dm.take_direction_changed() && dm.next_step() > 1 {
                flipped_at = Some(dm.next_step());
            }
            assert!(dm.next_step_time() + 2 >= last_time);
            last_time = dm.next_step_time();
            if dm.next_step() < 111 {
                assert!(dm.direction());
            } else {
                assert!(!dm.direction());
            }
        }
        assert_eq!(flipped_at, Some(111));
        assert_eq!(dm.state(), DmState::Idle);
        assert_eq!(dm.net_steps_taken(), 100);
    }

    #[test]
    fn test_retraction_ignores_pressure_advance() {
        let plan = trapezoid(10.0, 50.0, 1000.0, 40);
        let mut dm = DriveMovement::new(3);
        assert!(dm.prepare_extruder(&plan, -100, 0.045 * HZ as f32, None));
        assert_eq!(dm.total_steps(), 100);
        assert!(dm.reverse_start_step() > dm.total_steps());
        run(&mut dm, &plan);
        assert_eq!(dm.net_steps_taken(), -100);
    }

    #[test]
    fn test_planner_reverse_start_step() {
        let plan = trapezoid(10.0, 50.0, 1000.0, 40);
        let mut dm = DriveMovement::new(3);
        assert!(dm.prepare_extruder(&plan, 100, 0.045 * HZ as f32, Some(112)));
        assert_eq!(dm.reverse_start_step(), 112);
        assert_eq!(dm.total_steps(), 122);

        // Outside the final segment: ignored
        let mut dm = DriveMovement::new(3);
        dm.prepare_extruder(&plan, 100, 0.045 * HZ as f32, Some(20));
        assert_eq!(dm.reverse_start_step(), 111);
    }

    fn delta_reversal_move() -> (PlannedMove, DeltaAxisMove) {
        // Head passes under the tower at 1 mm per 1000 clocks
        let plan = PlannedMove::from_segments(&[MoveSegment::linear(33.4, 33_400.0)], 0).unwrap();
        let geometry = DeltaAxisMove {
            tower: DeltaTower {
                x: 0.0,
                y: 0.0,
                diagonal_squared: 215.0 * 215.0,
            },
            start_xy: [-19.4, 100.0],
            direction: [1.0, 0.0, 0.0],
            steps_per_mm: 100.0,
        };
        (plan, geometry)
    }

    #[test]
    fn test_delta_reversal_switches_exactly() {
        let (plan, geometry) = delta_reversal_move();
        let mut dm = DriveMovement::new(0);
        assert!(dm.prepare_delta(&plan, 48, &geometry));
        assert_eq!(dm.reverse_start_step(), 100);
        assert_eq!(dm.total_steps(), 150);
        assert_eq!(dm.net_steps_left(), 48);
        assert_eq!(dm.net_steps_taken(), 0);

        let mut last_time = 0;
        while dm.calc_next_step_time(&plan) {
            let step = dm.next_step();
            if step < 100 {
                assert_eq!(dm.state(), DmState::DeltaForwardsReversing);
                assert!(dm.direction());
            } else {
                assert_eq!(dm.state(), DmState::DeltaReverse);
                assert!(!dm.direction());
            }
            assert!(dm.next_step_time() >= last_time);
            last_time = dm.next_step_time();
            assert_eq!(dm.net_steps_left() + dm.net_steps_taken(), 48);

            if step == 121 {
                // 120 steps taken: 99 up, then 21 down
                assert_eq!(dm.net_steps_taken(), 78);
            }
        }
        assert_eq!(dm.state(), DmState::Idle);
        assert_eq!(dm.net_steps_taken(), 48);
        assert!(last_time <= plan.clocks_needed());
    }

    #[test]
    fn test_delta_without_reversal() {
        let (plan, mut geometry) = delta_reversal_move();
        // Start directly under the tower's closest point: carriage only falls
        geometry.start_xy = [0.0, 100.0];
        let plan = plan.slice(0.0, 14.0).unwrap();
        let mut dm = DriveMovement::new(0);
        assert!(dm.prepare_delta(&plan, -51, &geometry));
        assert!(dm.reverse_start_step() > dm.total_steps());
        assert_eq!(dm.total_steps(), 51);
        assert!(!dm.direction());

        run(&mut dm, &plan);
        assert_eq!(dm.state(), DmState::Idle);
        assert_eq!(dm.net_steps_taken(), -51);
    }

    #[test]
    fn test_delta_unreachable_tower() {
        let (plan, mut geometry) = delta_reversal_move();
        geometry.start_xy = [300.0, 0.0];
        let mut dm = DriveMovement::new(0);
        assert!(!dm.prepare_delta(&plan, 10, &geometry));
        assert_eq!(dm.state(), DmState::StepError);
    }

    #[test]
    fn test_stop_reports_steps_taken() {
        let plan = trapezoid(10.0, 50.0, 1000.0, 40);
        let mut dm = DriveMovement::new(0);
        dm.prepare_cartesian(&plan, -800);
        for _ in 0..11 {
            dm.calc_next_step_time(&plan);
        }
        // Step 11 is scheduled but not yet taken
        assert_eq!(dm.stop(), -10);
        assert_eq!(dm.state(), DmState::Idle);
        assert!(!dm.calc_next_step_time(&plan));
    }

    #[test]
    fn test_full_step_interval() {
        let plan = trapezoid(10.0, 50.0, 1000.0, 40);
        let mut dm = DriveMovement::new(0);
        dm.prepare_cartesian(&plan, 800);
        assert_eq!(dm.step_interval_full_steps(4), 0);
        for _ in 0..400 {
            dm.calc_next_step_time(&plan);
        }
        assert_eq!(dm.step_interval_full_steps(4), dm.step_interval() << 4);
    }
}
