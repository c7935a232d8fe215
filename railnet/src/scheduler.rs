//! Striping scheduler.
//!
//! Decides how a message is spread over the rails of a device: messages below
//! the round-robin threshold go out whole on one rail (rotating between
//! rails), larger messages are striped into one near-equal segment per rail.
//! Schedules are recycled through a small pool; the request that owns a
//! schedule hands it back when it is freed.

use std::cell::{Cell, RefCell};

/// One transfer of a schedule: a contiguous span of the message assigned to
/// one rail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XferInfo {
    pub rail_id: usize,
    pub offset: usize,
    pub len: usize,
}

/// An ordered list of transfers whose spans cover the message exactly.
#[derive(Debug, Default)]
pub struct Schedule {
    pub xfers: Vec<XferInfo>,
}

/// Stripes are aligned down to this granularity so that rail boundaries stay
/// cache-line friendly.
const STRIPE_ALIGN: usize = 128;

/// Threshold scheduler over a fixed rail count.
pub struct ThresholdScheduler {
    num_rails: usize,
    round_robin_threshold: usize,
    next_rail: Cell<usize>,
    pool: RefCell<Vec<Schedule>>,
}

impl ThresholdScheduler {
    pub fn new(num_rails: usize, round_robin_threshold: usize) -> Self {
        assert!(num_rails > 0);
        Self {
            num_rails,
            round_robin_threshold,
            next_rail: Cell::new(0),
            pool: RefCell::new(Vec::new()),
        }
    }

    /// Produce a schedule for a message of `size` bytes over `num_rails`
    /// rails. The caller owns the schedule until it releases it.
    pub fn schedule(&self, size: usize, num_rails: usize) -> Schedule {
        let num_rails = num_rails.min(self.num_rails);
        let mut schedule = self
            .pool
            .borrow_mut()
            .pop()
            .unwrap_or_default();
        schedule.xfers.clear();

        if size < self.round_robin_threshold || num_rails == 1 {
            let rail_id = self.next_rail.get();
            self.next_rail.set((rail_id + 1) % num_rails);
            schedule.xfers.push(XferInfo {
                rail_id,
                offset: 0,
                len: size,
            });
            return schedule;
        }

        // Near-equal stripes, aligned so that only the final stripe carries
        // the remainder.
        let stripe = size.div_ceil(num_rails).next_multiple_of(STRIPE_ALIGN);
        let mut offset = 0;
        let mut rail_id = 0;
        while offset < size {
            let len = stripe.min(size - offset);
            schedule.xfers.push(XferInfo {
                rail_id,
                offset,
                len,
            });
            offset += len;
            rail_id += 1;
        }
        schedule
    }

    /// Return a schedule to the pool.
    pub fn release(&self, mut schedule: Schedule) {
        schedule.xfers.clear();
        self.pool.borrow_mut().push(schedule);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_cover(schedule: &Schedule, size: usize) {
        let total: usize = schedule.xfers.iter().map(|x| x.len).sum();
        assert_eq!(total, size);
        let mut expected_offset = 0;
        for xfer in &schedule.xfers {
            assert_eq!(xfer.offset, expected_offset);
            expected_offset += xfer.len;
        }
    }

    #[test]
    fn test_small_message_single_rail() {
        let sched = ThresholdScheduler::new(4, 8192);
        let s = sched.schedule(100, 4);
        assert_eq!(s.xfers.len(), 1);
        assert_eq!(s.xfers[0].len, 100);
        check_cover(&s, 100);
    }

    #[test]
    fn test_round_robin_rotates() {
        let sched = ThresholdScheduler::new(3, 8192);
        let rails: Vec<usize> = (0..6)
            .map(|_| sched.schedule(64, 3).xfers[0].rail_id)
            .collect();
        assert_eq!(rails, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_zero_byte_schedule() {
        let sched = ThresholdScheduler::new(2, 8192);
        let s = sched.schedule(0, 2);
        assert_eq!(s.xfers.len(), 1);
        assert_eq!(s.xfers[0].len, 0);
    }

    #[test]
    fn test_striped_even_split() {
        let sched = ThresholdScheduler::new(2, 8192);
        let s = sched.schedule(1 << 20, 2);
        assert_eq!(s.xfers.len(), 2);
        assert_eq!(s.xfers[0].len, 524288);
        assert_eq!(s.xfers[1].len, 524288);
        assert_eq!(s.xfers[0].rail_id, 0);
        assert_eq!(s.xfers[1].rail_id, 1);
        check_cover(&s, 1 << 20);
    }

    #[test]
    fn test_striped_uneven_sizes_cover() {
        let sched = ThresholdScheduler::new(4, 4096);
        for size in [4096usize, 4097, 65535, 1 << 20, (1 << 20) + 13] {
            let s = sched.schedule(size, 4);
            assert!(s.xfers.len() <= 4);
            check_cover(&s, size);
            // Offsets strictly ascending.
            for pair in s.xfers.windows(2) {
                assert!(pair[1].offset > pair[0].offset);
            }
        }
    }

    #[test]
    fn test_schedule_recycling() {
        let sched = ThresholdScheduler::new(2, 8192);
        let s = sched.schedule(1 << 20, 2);
        sched.release(s);
        let s2 = sched.schedule(100, 2);
        assert_eq!(s2.xfers.len(), 1);
    }
}
