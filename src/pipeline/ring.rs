//! Bounded frame ring between the capture and playout engines
//!
//! A fixed set of [`FrameSlot`]s moves between a free pool and a ready queue.
//! The producer leases a free slot, fills it, then commits it to the back of
//! the ready queue; the consumer leases the oldest ready slot and hands it
//! back to the free pool when done. A slot is in exactly one place at a time,
//! so an uncommitted slot is never visible to the consumer and a committed
//! one is never handed to the producer until consumed.

use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::slot::FrameSlot;

/// Result of a lease attempt.
#[derive(Debug)]
pub enum RingOutcome<T> {
    Ready(T),
    /// Nothing available within the wait
    Blocked,
    /// The ring was aborted; no further leases are handed out
    Aborted,
}

impl<T> RingOutcome<T> {
    pub fn is_blocked(&self) -> bool {
        matches!(self, RingOutcome::Blocked)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, RingOutcome::Aborted)
    }
}

struct RingInner {
    free: Vec<FrameSlot>,
    ready: VecDeque<FrameSlot>,
    aborted: bool,
}

pub struct FrameRing {
    inner: Mutex<RingInner>,
    slot_freed: Condvar,
    slot_ready: Condvar,
    capacity: usize,
    full_events: AtomicU64,
    empty_events: AtomicU64,
}

impl FrameRing {
    /// Ring over `slots`; capacity is the number of slots.
    pub fn new(slots: Vec<FrameSlot>) -> Self {
        let capacity = slots.len();
        Self {
            inner: Mutex::new(RingInner {
                free: slots,
                ready: VecDeque::with_capacity(capacity),
                aborted: false,
            }),
            slot_freed: Condvar::new(),
            slot_ready: Condvar::new(),
            capacity,
            full_events: AtomicU64::new(0),
            empty_events: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Committed slots waiting for the consumer.
    pub fn level(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// Lease attempts that found the ring full.
    pub fn full_events(&self) -> u64 {
        self.full_events.load(Ordering::Relaxed)
    }

    /// Lease attempts that found the ring empty.
    pub fn empty_events(&self) -> u64 {
        self.empty_events.load(Ordering::Relaxed)
    }

    /// Lease a free slot, waiting up to `wait` for one.
    pub fn start_produce(&self, wait: Duration) -> RingOutcome<ProduceLease<'_>> {
        let deadline = Instant::now() + wait;
        let mut timed_out = wait.is_zero();
        let mut inner = self.inner.lock();
        loop {
            if inner.aborted {
                return RingOutcome::Aborted;
            }
            if let Some(slot) = inner.free.pop() {
                return RingOutcome::Ready(ProduceLease {
                    ring: self,
                    slot: Some(slot),
                });
            }
            if timed_out {
                self.full_events.fetch_add(1, Ordering::Relaxed);
                return RingOutcome::Blocked;
            }
            timed_out = self.slot_freed.wait_until(&mut inner, deadline).timed_out();
        }
    }

    pub fn try_produce(&self) -> RingOutcome<ProduceLease<'_>> {
        self.start_produce(Duration::ZERO)
    }

    /// Lease the oldest committed slot, waiting up to `wait` for one.
    pub fn start_consume(&self, wait: Duration) -> RingOutcome<ConsumeLease<'_>> {
        let deadline = Instant::now() + wait;
        let mut timed_out = wait.is_zero();
        let mut inner = self.inner.lock();
        loop {
            if inner.aborted {
                return RingOutcome::Aborted;
            }
            if let Some(slot) = inner.ready.pop_front() {
                return RingOutcome::Ready(ConsumeLease {
                    ring: self,
                    slot: Some(slot),
                });
            }
            if timed_out {
                self.empty_events.fetch_add(1, Ordering::Relaxed);
                return RingOutcome::Blocked;
            }
            timed_out = self.slot_ready.wait_until(&mut inner, deadline).timed_out();
        }
    }

    pub fn try_consume(&self) -> RingOutcome<ConsumeLease<'_>> {
        self.start_consume(Duration::ZERO)
    }

    /// Wake every waiter and refuse further leases. Leases already out can
    /// still be committed or released.
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        if !inner.aborted {
            inner.aborted = true;
            debug!("FrameRing: aborted with {} ready", inner.ready.len());
        }
        self.slot_freed.notify_all();
        self.slot_ready.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    fn commit(&self, slot: FrameSlot) {
        self.inner.lock().ready.push_back(slot);
        self.slot_ready.notify_one();
    }

    fn release(&self, slot: FrameSlot) {
        self.inner.lock().free.push(slot);
        self.slot_freed.notify_one();
    }
}

/// Producer's hold on a free slot. Dropping it without [`ProduceLease::commit`]
/// returns the slot to the free pool.
pub struct ProduceLease<'a> {
    ring: &'a FrameRing,
    slot: Option<FrameSlot>,
}

impl ProduceLease<'_> {
    /// Publish the slot to the consumer.
    pub fn commit(mut self) {
        if let Some(slot) = self.slot.take() {
            self.ring.commit(slot);
        }
    }
}

impl Deref for ProduceLease<'_> {
    type Target = FrameSlot;

    fn deref(&self) -> &FrameSlot {
        self.slot.as_ref().expect("lease holds its slot until commit")
    }
}

impl DerefMut for ProduceLease<'_> {
    fn deref_mut(&mut self) -> &mut FrameSlot {
        self.slot.as_mut().expect("lease holds its slot until commit")
    }
}

impl Drop for ProduceLease<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.ring.release(slot);
        }
    }
}

/// Consumer's hold on a committed slot. The slot goes back to the free pool
/// on [`ConsumeLease::finish`] or drop.
pub struct ConsumeLease<'a> {
    ring: &'a FrameRing,
    slot: Option<FrameSlot>,
}

impl ConsumeLease<'_> {
    pub fn finish(self) {}
}

impl Deref for ConsumeLease<'_> {
    type Target = FrameSlot;

    fn deref(&self) -> &FrameSlot {
        self.slot.as_ref().expect("lease holds its slot until finish")
    }
}

impl DerefMut for ConsumeLease<'_> {
    fn deref_mut(&mut self) -> &mut FrameSlot {
        self.slot.as_mut().expect("lease holds its slot until finish")
    }
}

impl Drop for ConsumeLease<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.ring.release(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::slot::SlotLayout;
    use std::sync::Arc;

    fn ring(capacity: usize) -> FrameRing {
        let layout = SlotLayout {
            video_bytes: 4,
            second_field: false,
            audio_bytes: None,
            anc_bytes: None,
        };
        FrameRing::new(layout.allocate(capacity))
    }

    fn produce(ring: &FrameRing, sequence: u64) -> bool {
        match ring.try_produce() {
            RingOutcome::Ready(mut lease) => {
                lease.sequence = sequence;
                lease.video.fill(sequence as u8 + 1);
                lease.commit();
                true
            }
            _ => false,
        }
    }

    #[test]
    fn test_fifo_order() {
        let ring = ring(4);
        for seq in 0..4 {
            assert!(produce(&ring, seq));
        }
        for expected in 0..4 {
            match ring.try_consume() {
                RingOutcome::Ready(lease) => assert_eq!(lease.sequence, expected),
                other => panic!("expected a slot, got {:?}", other.is_blocked()),
            }
        }
        assert!(ring.try_consume().is_blocked());
        assert_eq!(ring.empty_events(), 1);
    }

    #[test]
    fn test_full_ring_blocks_without_overwrite() {
        let ring = ring(4);
        let committed = (0..10).filter(|seq| produce(&ring, *seq)).count();
        assert_eq!(committed, 4);
        assert_eq!(ring.full_events(), 6);
        assert_eq!(ring.level(), 4);

        // The first four frames survive untouched, contents included
        let mut seen = Vec::new();
        while let RingOutcome::Ready(lease) = ring.try_consume() {
            seen.push((lease.sequence, lease.video.to_vec()));
        }
        let expected: Vec<_> = (0..4u64).map(|seq| (seq, vec![seq as u8 + 1; 4])).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_uncommitted_slot_invisible_and_returned() {
        let ring = ring(2);
        match ring.try_produce() {
            RingOutcome::Ready(mut lease) => {
                lease.sequence = 42;
                assert!(ring.try_consume().is_blocked());
                // dropped without commit
            }
            _ => panic!("expected a free slot"),
        }
        assert_eq!(ring.level(), 0);
        assert!(produce(&ring, 1));
        assert!(produce(&ring, 2));
        assert!(ring.try_produce().is_blocked());
    }

    #[test]
    fn test_consumed_slot_returns_to_pool() {
        let ring = ring(1);
        assert!(produce(&ring, 0));
        assert!(ring.try_produce().is_blocked());
        if let RingOutcome::Ready(lease) = ring.try_consume() {
            lease.finish();
        }
        assert!(produce(&ring, 1));
    }

    #[test]
    fn test_blocked_wait_times_out() {
        let ring = ring(1);
        let started = Instant::now();
        assert!(ring.start_consume(Duration::from_millis(20)).is_blocked());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_abort_wakes_waiters() {
        let ring = Arc::new(ring(1));
        let consumer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let started = Instant::now();
                let aborted = ring.start_consume(Duration::from_secs(10)).is_aborted();
                (aborted, started.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        ring.abort();
        let (aborted, elapsed) = consumer.join().unwrap();
        assert!(aborted);
        assert!(elapsed < Duration::from_secs(5));
        assert!(ring.try_produce().is_aborted());
    }

    #[test]
    fn test_abort_wakes_blocked_producer() {
        let ring = Arc::new(ring(1));
        assert!(produce(&ring, 0));
        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let started = Instant::now();
                let aborted = ring.start_produce(Duration::from_secs(10)).is_aborted();
                (aborted, started.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        ring.abort();
        let (aborted, elapsed) = producer.join().unwrap();
        assert!(aborted);
        assert!(elapsed < Duration::from_secs(5));
        assert!(ring.try_consume().is_aborted());
    }

    #[test]
    fn test_waiting_producer_gets_released_slot() {
        let ring = Arc::new(ring(1));
        assert!(produce(&ring, 0));
        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || match ring.start_produce(Duration::from_secs(5)) {
                RingOutcome::Ready(mut lease) => {
                    lease.sequence = 1;
                    lease.commit();
                    true
                }
                _ => false,
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        match ring.try_consume() {
            RingOutcome::Ready(lease) => assert_eq!(lease.sequence, 0),
            _ => panic!("expected the first frame"),
        }
        assert!(producer.join().unwrap());
        match ring.start_consume(Duration::from_secs(1)) {
            RingOutcome::Ready(lease) => assert_eq!(lease.sequence, 1),
            _ => panic!("expected the second frame"),
        }
    }
}
