//! STEP/DIR pin output over embedded-hal 1.0.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

use super::StepSink;
use crate::error::{ConfigError, Result};

/// Default STEP pulse width in nanoseconds.
pub const DEFAULT_PULSE_WIDTH_NS: u32 = 2_000;

/// Errors from [`PinStepSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinSinkError {
    /// No pins are attached to the drive.
    UnknownDrive(u8),
    /// Writing a pin failed.
    Pin(u8),
}

struct DrivePins<STEP, DIR> {
    step: STEP,
    dir: DIR,
    /// Cached to skip redundant DIR writes.
    forwards: Option<bool>,
}

/// Blocking sink that pulses one STEP pin per drive.
///
/// Steps must arrive in time order. The sink waits out the clocks between
/// consecutive steps with the delay provider, then pulses STEP high for the
/// configured width.
pub struct PinStepSink<STEP, DIR, DELAY, const N: usize>
where
    STEP: OutputPin,
    DIR: OutputPin,
    DELAY: DelayNs,
{
    drives: [Option<DrivePins<STEP, DIR>>; N],
    delay: DELAY,
    clock_hz: u32,
    pulse_width_ns: u32,
    last_time: Option<u32>,
}

impl<STEP, DIR, DELAY, const N: usize> PinStepSink<STEP, DIR, DELAY, N>
where
    STEP: OutputPin,
    DIR: OutputPin,
    DELAY: DelayNs,
{
    /// Create a sink with no drives attached, timed by a step clock of
    /// `clock_hz`.
    pub fn new(delay: DELAY, clock_hz: u32) -> Result<Self> {
        if clock_hz == 0 {
            return Err(ConfigError::InvalidStepClock(clock_hz).into());
        }
        Ok(Self {
            drives: core::array::from_fn(|_| None),
            delay,
            clock_hz,
            pulse_width_ns: DEFAULT_PULSE_WIDTH_NS,
            last_time: None,
        })
    }

    /// Attach the STEP and DIR pins of `drive`.
    pub fn with_drive(mut self, drive: u8, step: STEP, dir: DIR) -> Result<Self> {
        let slot = self
            .drives
            .get_mut(drive as usize)
            .ok_or(ConfigError::TooManyDrives {
                requested: drive as usize + 1,
                capacity: N,
            })?;
        *slot = Some(DrivePins {
            step,
            dir,
            forwards: None,
        });
        Ok(self)
    }

    /// Set the STEP pulse width.
    pub fn with_pulse_width_ns(mut self, pulse_width_ns: u32) -> Self {
        self.pulse_width_ns = pulse_width_ns;
        self
    }

    /// Detach and return the pins of `drive`.
    pub fn release_drive(&mut self, drive: u8) -> Option<(STEP, DIR)> {
        self.drives
            .get_mut(drive as usize)
            .and_then(Option::take)
            .map(|pins| (pins.step, pins.dir))
    }

    /// Give back the delay provider.
    pub fn release(self) -> DELAY {
        self.delay
    }

    fn clocks_to_ns(&self, clocks: u32) -> u32 {
        let ns = u64::from(clocks) * 1_000_000_000 / u64::from(self.clock_hz);
        ns.min(u64::from(u32::MAX)) as u32
    }
}

impl<STEP, DIR, DELAY, const N: usize> StepSink for PinStepSink<STEP, DIR, DELAY, N>
where
    STEP: OutputPin,
    DIR: OutputPin,
    DELAY: DelayNs,
{
    type Error = PinSinkError;

    fn set_direction(&mut self, drive: u8, forwards: bool) -> core::result::Result<(), Self::Error> {
        let pins = self
            .drives
            .get_mut(drive as usize)
            .and_then(Option::as_mut)
            .ok_or(PinSinkError::UnknownDrive(drive))?;
        if pins.forwards == Some(forwards) {
            return Ok(());
        }
        if forwards {
            pins.dir.set_high().map_err(|_| PinSinkError::Pin(drive))?;
        } else {
            pins.dir.set_low().map_err(|_| PinSinkError::Pin(drive))?;
        }
        pins.forwards = Some(forwards);
        Ok(())
    }

    fn step(&mut self, drive: u8, time: u32) -> core::result::Result<(), Self::Error> {
        if let Some(last) = self.last_time {
            let wait = self.clocks_to_ns(time.wrapping_sub(last));
            // The previous pulse already used part of the interval
            let wait = wait.saturating_sub(self.pulse_width_ns);
            if wait > 0 && (time.wrapping_sub(last) as i32) > 0 {
                self.delay.delay_ns(wait);
            }
        }
        let pulse_width_ns = self.pulse_width_ns;
        let pins = self
            .drives
            .get_mut(drive as usize)
            .and_then(Option::as_mut)
            .ok_or(PinSinkError::UnknownDrive(drive))?;
        pins.step.set_high().map_err(|_| PinSinkError::Pin(drive))?;
        self.delay.delay_ns(pulse_width_ns);
        pins.step.set_low().map_err(|_| PinSinkError::Pin(drive))?;
        self.last_time = Some(time);
        Ok(())
    }
}

impl<STEP, DIR, DELAY, const N: usize> core::fmt::Debug for PinStepSink<STEP, DIR, DELAY, N>
where
    STEP: OutputPin,
    DIR: OutputPin,
    DELAY: DelayNs,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PinStepSink")
            .field("drives", &self.drives.iter().filter(|d| d.is_some()).count())
            .field("clock_hz", &self.clock_hz)
            .field("pulse_width_ns", &self.pulse_width_ns)
            .finish()
    }
}
