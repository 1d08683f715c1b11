//! Atomic allocation counters, kept close to the teacher's `StatCount`
//! pattern (current/peak/allocated/freed, all lock-free `AtomicI64`s).

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Default)]
pub struct StatCount {
    current: AtomicI64,
    peak: AtomicI64,
    allocated: AtomicI64,
    freed: AtomicI64,
}

impl StatCount {
    pub const fn new() -> Self {
        StatCount {
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicI64::new(0),
            freed: AtomicI64::new(0),
        }
    }

    pub fn increase(&self, amount: i64) {
        self.update(amount);
    }

    pub fn decrease(&self, amount: i64) {
        self.update(-amount);
    }

    fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;

        let mut old_peak = self.peak.load(Ordering::Relaxed);
        while current > old_peak {
            match self.peak.compare_exchange_weak(
                old_peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => old_peak = observed,
            }
        }

        if amount > 0 {
            self.allocated.fetch_add(amount, Ordering::Relaxed);
        } else {
            self.freed.fetch_add(-amount, Ordering::Relaxed);
        }
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Process-wide allocation statistics, reported when `Config::show_stats` is
/// set.
#[derive(Default)]
pub struct Stats {
    pub small: StatCount,
    pub large: StatCount,
    pub pages_committed: StatCount,
}

impl Stats {
    pub const fn new() -> Self {
        Stats {
            small: StatCount::new(),
            large: StatCount::new(),
            pages_committed: StatCount::new(),
        }
    }
}

pub static STATS: Stats = Stats::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_current_and_peak() {
        let s = StatCount::new();
        s.increase(10);
        s.increase(5);
        assert_eq!(s.current(), 15);
        assert_eq!(s.peak(), 15);
        s.decrease(12);
        assert_eq!(s.current(), 3);
        assert_eq!(s.peak(), 15);
    }

    #[test]
    fn zero_amount_is_noop() {
        let s = StatCount::new();
        s.increase(0);
        assert_eq!(s.current(), 0);
        assert_eq!(s.peak(), 0);
    }
}
