//! Hand-off of planned moves from the planner to the step engine.
//!
//! The queue is single-producer, single-consumer. On a target with a step
//! interrupt the planner keeps the [`Producer`] half and the interrupt keeps
//! the [`Consumer`]; a hosted build just uses the queue directly.

use heapless::spsc::{Consumer, Producer, Queue};
use heapless::Vec;

use super::engine::DriveRequest;
use super::segment::PlannedMove;
use crate::error::{ConfigError, MotionError, Result};
use crate::MAX_DRIVES;

/// One move ready for execution: the segment chain and what every drive
/// has to do along it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMove {
    /// Segment chain shared by all drives.
    pub plan: PlannedMove,
    /// Per-drive work, at most one request per drive.
    pub requests: Vec<DriveRequest, MAX_DRIVES>,
}

impl QueuedMove {
    /// Create a queued move with no drive requests yet.
    pub fn new(plan: PlannedMove) -> Self {
        Self {
            plan,
            requests: Vec::new(),
        }
    }

    /// Add a drive request. Requests for drives that do not move are
    /// dropped, except delta carriages, which may rise and fall back. A
    /// second request for the same drive is refused.
    pub fn push_request(&mut self, request: DriveRequest) -> Result<()> {
        if !request.may_step() {
            return Ok(());
        }
        if self.requests.iter().any(|r| r.drive == request.drive) {
            return Err(MotionError::DuplicateDrive(request.drive).into());
        }
        self.requests
            .push(request)
            .map_err(|_| ConfigError::TooManyDrives {
                requested: MAX_DRIVES + 1,
                capacity: MAX_DRIVES,
            })?;
        Ok(())
    }
}

/// Fixed-capacity move queue holding up to `Q - 1` moves.
pub struct MoveQueue<const Q: usize> {
    inner: Queue<QueuedMove, Q>,
}

impl<const Q: usize> MoveQueue<Q> {
    /// Create an empty queue.
    pub const fn new() -> Self {
        Self { inner: Queue::new() }
    }

    /// Append a move, or give it back when the queue is full.
    pub fn push(&mut self, queued: QueuedMove) -> Result<()> {
        self.inner.enqueue(queued).map_err(|_| {
            warn!("move queue full");
            MotionError::QueueFull
        })?;
        Ok(())
    }

    /// Take the oldest move.
    #[inline]
    pub fn pop(&mut self) -> Option<QueuedMove> {
        self.inner.dequeue()
    }

    /// Moves waiting.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True if no move is waiting.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// True if no further move fits.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    /// Room left for further moves.
    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Most moves the queue can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Split into producer and consumer halves.
    pub fn split(&mut self) -> (Producer<'_, QueuedMove, Q>, Consumer<'_, QueuedMove, Q>) {
        self.inner.split()
    }
}

impl<const Q: usize> Default for MoveQueue<Q> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const Q: usize> core::fmt::Debug for MoveQueue<Q> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MoveQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::segment::MoveSegment;

    fn queued(steps: i32) -> QueuedMove {
        let plan = PlannedMove::from_segments(&[MoveSegment::linear(1.0, 1000.0)], 40).unwrap();
        let mut queued = QueuedMove::new(plan);
        queued.push_request(DriveRequest::linear(0, steps)).unwrap();
        queued
    }

    #[test]
    fn test_fifo_order() {
        let mut queue: MoveQueue<4> = MoveQueue::new();
        assert_eq!(queue.capacity(), 3);
        queue.push(queued(1)).unwrap();
        queue.push(queued(2)).unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().requests[0].net_steps(), 1);
        assert_eq!(queue.pop().unwrap().requests[0].net_steps(), 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_full_queue_refuses() {
        let mut queue: MoveQueue<3> = MoveQueue::new();
        queue.push(queued(1)).unwrap();
        queue.push(queued(2)).unwrap();
        assert!(queue.is_full());
        assert_eq!(queue.push(queued(3)), Err(MotionError::QueueFull.into()));
        assert_eq!(queue.free_space(), 0);
    }

    #[test]
    fn test_zero_step_requests_dropped() {
        let q = queued(0);
        assert!(q.requests.is_empty());
    }

    #[test]
    fn test_second_request_for_drive_refused() {
        let mut q = queued(10);
        assert_eq!(
            q.push_request(DriveRequest::linear(0, 20)),
            Err(MotionError::DuplicateDrive(0).into())
        );
        // A drive that stays put never conflicts
        q.push_request(DriveRequest::linear(0, 0)).unwrap();
        q.push_request(DriveRequest::linear(1, 20)).unwrap();
        assert_eq!(q.requests.len(), 2);
        assert_eq!(q.requests[0].net_steps(), 10);
    }

    #[test]
    fn test_split_halves() {
        let mut queue: MoveQueue<4> = MoveQueue::new();
        let (mut producer, mut consumer) = queue.split();
        assert!(producer.enqueue(queued(5)).is_ok());
        assert_eq!(consumer.dequeue().unwrap().requests[0].net_steps(), 5);
    }
}
