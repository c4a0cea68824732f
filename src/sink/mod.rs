//! Step output.
//!
//! The engine hands every step to a [`StepSink`] as it falls due. A sink
//! either drives real STEP/DIR pins ([`PinStepSink`]) or records what it is
//! given ([`StepRecorder`]) for simulation and tests.

mod pins;

pub use pins::{PinSinkError, PinStepSink};

use heapless::Vec;

use crate::MAX_DRIVES;

/// Receiver of direction changes and step pulses.
pub trait StepSink {
    /// Error raised by the output.
    type Error: core::fmt::Debug;

    /// Set the direction output of `drive`. `forwards` already has the
    /// drive's direction inversion applied.
    fn set_direction(&mut self, drive: u8, forwards: bool) -> Result<(), Self::Error>;

    /// Emit one step on `drive`, due at absolute clock `time`.
    fn step(&mut self, drive: u8, time: u32) -> Result<(), Self::Error>;
}

/// Something a [`StepRecorder`] saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SinkEvent {
    /// Direction output changed.
    Direction {
        /// Drive number.
        drive: u8,
        /// New direction level.
        forwards: bool,
    },
    /// Step pulse.
    Step {
        /// Drive number.
        drive: u8,
        /// Absolute clock of the step.
        time: u32,
    },
}

/// The recorder ran out of room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderFull;

/// Sink that keeps the last `N` events and a running position per drive.
#[derive(Debug, Clone)]
pub struct StepRecorder<const N: usize> {
    events: Vec<SinkEvent, N>,
    positions: [i32; MAX_DRIVES],
    forwards: [bool; MAX_DRIVES],
    steps: u32,
    keep_events: bool,
}

impl<const N: usize> StepRecorder<N> {
    /// Recorder that keeps every event until full.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            positions: [0; MAX_DRIVES],
            forwards: [true; MAX_DRIVES],
            steps: 0,
            keep_events: true,
        }
    }

    /// Recorder that only counts steps and tracks positions.
    pub fn counting() -> Self {
        Self {
            keep_events: false,
            ..Self::new()
        }
    }

    /// Recorded events in order.
    pub fn events(&self) -> &[SinkEvent] {
        &self.events
    }

    /// Step times of one drive in order.
    pub fn step_times(&self, drive: u8) -> impl Iterator<Item = u32> + '_ {
        self.events.iter().filter_map(move |event| match *event {
            SinkEvent::Step { drive: d, time } if d == drive => Some(time),
            _ => None,
        })
    }

    /// Net steps seen on `drive`, counting direction.
    pub fn position(&self, drive: u8) -> i32 {
        self.positions.get(drive as usize).copied().unwrap_or(0)
    }

    /// Total step pulses seen.
    pub fn step_count(&self) -> u32 {
        self.steps
    }

    /// Forget all events, keeping positions.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    fn record(&mut self, event: SinkEvent) -> Result<(), RecorderFull> {
        if self.keep_events {
            self.events.push(event).map_err(|_| RecorderFull)?;
        }
        Ok(())
    }
}

impl<const N: usize> Default for StepRecorder<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> StepSink for StepRecorder<N> {
    type Error = RecorderFull;

    fn set_direction(&mut self, drive: u8, forwards: bool) -> Result<(), Self::Error> {
        self.record(SinkEvent::Direction { drive, forwards })?;
        if let Some(slot) = self.forwards.get_mut(drive as usize) {
            *slot = forwards;
        }
        Ok(())
    }

    fn step(&mut self, drive: u8, time: u32) -> Result<(), Self::Error> {
        self.record(SinkEvent::Step { drive, time })?;
        let index = drive as usize;
        if let (Some(position), Some(&forwards)) = (self.positions.get_mut(index), self.forwards.get(index)) {
            *position += if forwards { 1 } else { -1 };
        }
        self.steps += 1;
        Ok(())
    }
}
