//! Step engine: runs one planned move across all of its drives.
//!
//! [`StepEngine::start_move`] claims a drive movement from the pool for every
//! drive that has to step, prepares it and times its first step. Each call to
//! [`StepEngine::step`] then emits every step that has fallen due, in time
//! order across drives, and releases drives as they finish. Motor positions
//! are credited with the steps each drive actually took.

use heapless::Vec;

use super::drive_movement::{DeltaAxisMove, DmState};
use super::pool::{DmHandle, DrivePool};
use super::segment::PlannedMove;
use crate::error::{ConfigError, MotionError, Result};
use crate::kinematics::DriveCoordinates;
use crate::sink::StepSink;
use crate::MAX_DRIVES;

/// Step law of a drive request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriveKind {
    /// Axis stepping in proportion to move distance.
    Linear,
    /// Extruder, with pressure advance in clocks and an optional reverse
    /// start step worked out by the planner.
    Extruder {
        /// Pressure advance in clocks.
        pressure_advance: f32,
        /// Planner-supplied reverse start step.
        reverse_start_step: Option<u32>,
    },
    /// Delta tower carriage following the rod constraint.
    Delta(DeltaAxisMove),
}

/// What one drive does during a move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveRequest {
    /// Drive number.
    pub drive: u8,
    /// Net steps, signed.
    pub steps: i32,
    /// Step law.
    pub kind: DriveKind,
}

impl DriveRequest {
    /// Axis moving `steps` in proportion to the move.
    pub fn linear(drive: u8, steps: i32) -> Self {
        Self {
            drive,
            steps,
            kind: DriveKind::Linear,
        }
    }

    /// Extruder moving `steps` with `pressure_advance` clocks of advance.
    pub fn extruder(drive: u8, steps: i32, pressure_advance: f32) -> Self {
        Self {
            drive,
            steps,
            kind: DriveKind::Extruder {
                pressure_advance,
                reverse_start_step: None,
            },
        }
    }

    /// Delta carriage moving `steps` net along the tower.
    pub fn delta(drive: u8, steps: i32, geometry: DeltaAxisMove) -> Self {
        Self {
            drive,
            steps,
            kind: DriveKind::Delta(geometry),
        }
    }

    /// Use the planner's reverse start step for an extruder request.
    pub fn with_reverse_start_step(mut self, step: u32) -> Self {
        if let DriveKind::Extruder {
            ref mut reverse_start_step,
            ..
        } = self.kind
        {
            *reverse_start_step = Some(step);
        }
        self
    }

    /// Net steps of the request.
    #[inline]
    pub fn net_steps(&self) -> i32 {
        self.steps
    }

    /// False when the drive certainly stays put.
    #[inline]
    pub fn may_step(&self) -> bool {
        self.steps != 0 || matches!(self.kind, DriveKind::Delta(_))
    }
}

/// Result of one [`StepEngine::step`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StepOutcome {
    /// No move is executing.
    Idle,
    /// Steps remain; the next is due at this absolute clock.
    Pending {
        /// Absolute clock of the next step.
        next_due: u32,
    },
    /// The move completed during this call.
    Finished,
    /// A drive hit a step timing error and was stopped. Other drives carry on.
    Fault {
        /// First drive that failed in this call.
        drive: u8,
    },
}

/// Executes one move at a time using a pool of `N` drive movements.
#[derive(Debug)]
pub struct StepEngine<const N: usize> {
    pool: DrivePool<N>,
    active: Vec<DmHandle, N>,
    plan: Option<PlannedMove>,
    move_start: u32,
    next_move_start: u32,
    positions: [i32; MAX_DRIVES],
    inverted: u32,
    faults: u32,
}

impl<const N: usize> StepEngine<N> {
    /// Idle engine with every motor at zero.
    pub fn new() -> Self {
        Self {
            pool: DrivePool::new(),
            active: Vec::new(),
            plan: None,
            move_start: 0,
            next_move_start: 0,
            positions: [0; MAX_DRIVES],
            inverted: 0,
            faults: 0,
        }
    }

    /// True while a move is executing.
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.plan.is_some()
    }

    /// The drive movement pool.
    #[inline]
    pub fn pool(&self) -> &DrivePool<N> {
        &self.pool
    }

    /// Drives currently stepping.
    #[inline]
    pub fn active_drives(&self) -> usize {
        self.active.len()
    }

    /// Invert the direction output of `drive`.
    pub fn set_inverted(&mut self, drive: usize, inverted: bool) {
        if drive < MAX_DRIVES {
            if inverted {
                self.inverted |= 1 << drive;
            } else {
                self.inverted &= !(1 << drive);
            }
        }
    }

    /// Bitmap of drives that hit a step timing error since the last
    /// [`clear_faults`](Self::clear_faults).
    #[inline]
    pub fn faults(&self) -> u32 {
        self.faults
    }

    /// Forget recorded faults.
    pub fn clear_faults(&mut self) {
        self.faults = 0;
    }

    /// Absolute clock at which the last started move ends.
    #[inline]
    pub fn next_move_start(&self) -> u32 {
        self.next_move_start
    }

    /// Begin executing `plan` at absolute clock `start_time`.
    ///
    /// Either every moving drive gets a drive movement or the move is
    /// refused with nothing allocated.
    pub fn start_move(&mut self, plan: PlannedMove, requests: &[DriveRequest], start_time: u32) -> Result<()> {
        if self.is_busy() {
            return Err(MotionError::Busy.into());
        }
        if plan.is_empty() {
            return Err(MotionError::InvalidSegment.into());
        }
        if let Some(bad) = requests.iter().find(|r| r.drive as usize >= MAX_DRIVES) {
            return Err(ConfigError::TooManyDrives {
                requested: bad.drive as usize + 1,
                capacity: MAX_DRIVES,
            }
            .into());
        }
        let mut claimed = 0u32;
        for request in requests.iter().filter(|r| r.may_step()) {
            let bit = 1 << request.drive;
            if claimed & bit != 0 {
                return Err(MotionError::DuplicateDrive(request.drive).into());
            }
            claimed |= bit;
        }
        let needed = claimed.count_ones() as usize;
        if needed > self.pool.free_count() {
            error!(
                "move needs {} drive movements, {} free",
                needed as u32,
                self.pool.free_count() as u32
            );
            return Err(MotionError::PoolExhausted { capacity: N }.into());
        }

        for request in requests.iter().filter(|r| r.may_step()) {
            let handle = self.pool.allocate(request.drive, DmState::Idle)?;
            let Some(dm) = self.pool.get_mut(handle) else {
                return Err(MotionError::InvalidHandle(handle.index() as u8).into());
            };
            let prepared = match request.kind {
                DriveKind::Linear => dm.prepare_cartesian(&plan, request.steps),
                DriveKind::Extruder {
                    pressure_advance,
                    reverse_start_step,
                } => dm.prepare_extruder(&plan, request.steps, pressure_advance, reverse_start_step),
                DriveKind::Delta(ref geometry) => dm.prepare_delta(&plan, request.steps, geometry),
            };
            if prepared && dm.calc_next_step_time(&plan) {
                self.active
                    .push(handle)
                    .map_err(|_| MotionError::PoolExhausted { capacity: N })?;
                continue;
            }
            if dm.state() == DmState::StepError {
                error!("drive {} cannot be timed for this move", request.drive);
                self.faults |= 1 << request.drive;
            }
            self.pool.release(handle)?;
        }

        self.move_start = start_time;
        self.next_move_start = start_time.wrapping_add(plan.clocks_needed());
        if !self.active.is_empty() {
            debug!(
                "move started at {} with {} drives",
                start_time,
                self.active.len() as u32
            );
            self.plan = Some(plan);
        }
        Ok(())
    }

    /// Absolute clock of the earliest pending step.
    pub fn next_step_due(&self) -> Option<u32> {
        self.earliest().map(|(_, t)| self.move_start.wrapping_add(t))
    }

    /// Index into `active` and move-relative time of the earliest step.
    fn earliest(&self) -> Option<(usize, u32)> {
        self.active
            .iter()
            .enumerate()
            .filter_map(|(i, &handle)| self.pool.get(handle).map(|dm| (i, dm.next_step_time())))
            .min_by_key(|&(_, t)| t)
    }

    /// Emit every step due at or before absolute clock `now`.
    ///
    /// A sink failure is returned as [`MotionError::SinkFailure`]; the move
    /// stays active and the failed output is sent again on the next call.
    pub fn step<S: StepSink>(&mut self, now: u32, sink: &mut S) -> Result<StepOutcome> {
        if self.plan.is_none() {
            return Ok(StepOutcome::Idle);
        }
        let elapsed = now.wrapping_sub(self.move_start);
        let mut fault = None;

        if (elapsed as i32) >= 0 {
            while let Some((index, time)) = self.earliest() {
                if time > elapsed {
                    break;
                }
                let handle = self.active[index];
                let Some(plan) = self.plan.as_ref() else {
                    break;
                };
                let Some(dm) = self.pool.get_mut(handle) else {
                    self.active.swap_remove(index);
                    continue;
                };
                let drive = dm.drive();
                if dm.direction_changed() {
                    let level = dm.direction() != (self.inverted & (1 << drive) != 0);
                    sink.set_direction(drive, level)
                        .map_err(|_| MotionError::SinkFailure { drive })?;
                    dm.take_direction_changed();
                }
                sink.step(drive, self.move_start.wrapping_add(time))
                    .map_err(|_| MotionError::SinkFailure { drive })?;

                if dm.calc_next_step_time(plan) {
                    continue;
                }
                if dm.state() == DmState::StepError {
                    warn!("drive {} step error at step {}", drive, dm.next_step());
                    self.faults |= 1 << drive;
                    fault = fault.or(Some(drive));
                }
                self.positions[drive as usize] += dm.net_steps_taken();
                self.active.swap_remove(index);
                self.pool.release(handle)?;
            }
        }

        if self.active.is_empty() {
            self.plan = None;
            trace!("move finished");
            return Ok(match fault {
                Some(drive) => StepOutcome::Fault { drive },
                None => StepOutcome::Finished,
            });
        }
        Ok(match (fault, self.next_step_due()) {
            (Some(drive), _) => StepOutcome::Fault { drive },
            (None, Some(next_due)) => StepOutcome::Pending { next_due },
            (None, None) => StepOutcome::Finished,
        })
    }

    /// Stop every drive, credit the steps already taken and release all
    /// drive movements. Returns the number of drives stopped.
    pub fn abort(&mut self) -> Result<usize> {
        let mut stopped = 0;
        while let Some(handle) = self.active.pop() {
            if let Some(dm) = self.pool.get_mut(handle) {
                let drive = dm.drive() as usize;
                self.positions[drive] += dm.stop();
                stopped += 1;
            }
            self.pool.release(handle)?;
        }
        if self.plan.take().is_some() {
            info!("move aborted, {} drives stopped", stopped as u32);
        }
        Ok(stopped)
    }

    /// Stop one drive and credit its steps. Returns the net steps it took in
    /// this move, or `None` if it was not moving.
    pub fn stop_drive(&mut self, drive: u8) -> Result<Option<i32>> {
        let found = self
            .active
            .iter()
            .position(|&h| self.pool.get(h).map_or(false, |dm| dm.drive() == drive));
        let Some(index) = found else {
            return Ok(None);
        };
        let handle = self.active.swap_remove(index);
        let taken = self.pool.get_mut(handle).map_or(0, |dm| dm.stop());
        self.positions[drive as usize] += taken;
        self.pool.release(handle)?;
        if self.active.is_empty() {
            self.plan = None;
        }
        Ok(Some(taken))
    }

    /// Net steps the drive is moving in the current move.
    fn live_steps(&self, drive: u8) -> i32 {
        self.active
            .iter()
            .filter_map(|&h| self.pool.get(h))
            .find(|dm| dm.drive() == drive)
            .map_or(0, |dm| dm.net_steps_taken())
    }

    /// Current position of `drive` in steps, including steps taken in the
    /// executing move.
    pub fn motor_position(&self, drive: usize) -> i32 {
        match self.positions.get(drive) {
            Some(&base) => base + self.live_steps(drive as u8),
            None => 0,
        }
    }

    /// Positions of every drive slot.
    pub fn motor_positions(&self) -> [i32; MAX_DRIVES] {
        core::array::from_fn(|drive| self.motor_position(drive))
    }

    /// Redefine the current position of `drive`.
    pub fn set_motor_position(&mut self, drive: usize, steps: i32) {
        if drive < MAX_DRIVES {
            self.positions[drive] = steps - self.live_steps(drive as u8);
        }
    }
}

impl<const N: usize> Default for StepEngine<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DriveCoordinates for StepEngine<N> {
    fn set_drive_coordinate(&mut self, drive: usize, steps: i32) {
        self.set_motor_position(drive, steps);
    }
}
