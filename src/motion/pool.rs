//! Fixed-capacity pool of drive movements.
//!
//! Every [`DriveMovement`] is built when the pool is created. Allocation
//! pops an index from the free stack and release pushes it back, so the
//! step path never allocates.

use heapless::Vec;

use super::drive_movement::{DmState, DriveMovement};
use crate::error::{MotionError, Result};

/// Handle to an allocated drive movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmHandle(u8);

impl DmHandle {
    /// Slot index inside the pool.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Arena of `N` drive movements with a free-index stack.
#[derive(Debug)]
pub struct DrivePool<const N: usize> {
    slots: [DriveMovement; N],
    in_use: [bool; N],
    free: Vec<u8, N>,
}

impl<const N: usize> DrivePool<N> {
    /// Handles index slots with a `u8`.
    const FITS_HANDLE: () = assert!(N <= u8::MAX as usize + 1, "drive pool holds at most 256 slots");

    /// Create a pool with every slot free.
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::FITS_HANDLE;
        let mut free = Vec::new();
        // Pop order hands out slot 0 first
        for index in (0..N).rev() {
            let _ = free.push(index as u8);
        }
        Self {
            slots: core::array::from_fn(|_| DriveMovement::new(0)),
            in_use: [false; N],
            free,
        }
    }

    /// Number of slots.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Slots on the free stack.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Slots currently handed out.
    #[inline]
    pub fn in_use_count(&self) -> usize {
        self.in_use.iter().filter(|&&used| used).count()
    }

    /// Take a drive movement for `drive`, starting in `state`.
    pub fn allocate(&mut self, drive: u8, state: DmState) -> Result<DmHandle> {
        let Some(index) = self.free.pop() else {
            error!("drive movement pool exhausted, capacity {}", N as u32);
            return Err(MotionError::PoolExhausted { capacity: N }.into());
        };
        let slot = index as usize;
        self.in_use[slot] = true;
        self.slots[slot].reset(drive, state);
        Ok(DmHandle(index))
    }

    /// Return a drive movement to the pool.
    ///
    /// Releasing a handle that is not allocated is rejected and leaves the
    /// pool unchanged.
    pub fn release(&mut self, handle: DmHandle) -> Result<()> {
        let slot = handle.index();
        if !self.in_use.get(slot).copied().unwrap_or(false) {
            return Err(MotionError::InvalidHandle(handle.0).into());
        }
        self.in_use[slot] = false;
        self.slots[slot].reset(0, DmState::Idle);
        self.free
            .push(handle.0)
            .map_err(|_| MotionError::InvalidHandle(handle.0))?;
        Ok(())
    }

    /// Borrow an allocated drive movement.
    #[inline]
    pub fn get(&self, handle: DmHandle) -> Option<&DriveMovement> {
        let slot = handle.index();
        if self.in_use.get(slot).copied().unwrap_or(false) {
            self.slots.get(slot)
        } else {
            None
        }
    }

    /// Mutably borrow an allocated drive movement.
    #[inline]
    pub fn get_mut(&mut self, handle: DmHandle) -> Option<&mut DriveMovement> {
        let slot = handle.index();
        if self.in_use.get(slot).copied().unwrap_or(false) {
            self.slots.get_mut(slot)
        } else {
            None
        }
    }
}

impl<const N: usize> Default for DrivePool<N> {
    fn default() -> Self {
        Self::new()
    }
}
