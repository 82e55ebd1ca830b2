//! Timestamp sources.
//!
//! Writes that this layer timestamps itself (cache-only collections, the
//! in-memory backing store) need timestamps that strictly increase, even when
//! two writes land in the same wall-clock millisecond. [`SystemClock`] derives
//! them from the wall clock through a process-wide high-water mark;
//! [`ManualClock`] is the test double.

use crate::Timestamp;
use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Highest timestamp handed out by any `SystemClock` in this process.
static SYSTEM_HIGH_WATER: AtomicI64 = AtomicI64::new(0);

/// Source of wall-clock time and of write timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> Timestamp;

    /// A fresh write timestamp, strictly greater than any previously returned
    /// by this source.
    fn next_timestamp(&self) -> Timestamp;
}

fn advance_high_water(high_water: &AtomicI64, now: i64) -> i64 {
    let mut last = high_water.load(Ordering::Acquire);
    loop {
        let next = now.max(last + 1);
        match high_water.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Wall-clock backed source shared across the whole process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        SystemClock
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(Utc::now().timestamp_millis())
    }

    fn next_timestamp(&self) -> Timestamp {
        let now = Utc::now().timestamp_millis();
        Timestamp::from_millis(advance_high_water(&SYSTEM_HIGH_WATER, now))
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
    high_water: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start.as_millis()),
            high_water: AtomicI64::new(0),
        }
    }

    /// Move wall-clock time forward.
    pub fn advance(&self, by: Duration) {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(millis, Ordering::AcqRel);
    }

    /// Jump to an absolute time. Issued write timestamps still never go back.
    pub fn set(&self, to: Timestamp) {
        self.now.store(to.as_millis(), Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.now.load(Ordering::Acquire))
    }

    fn next_timestamp(&self) -> Timestamp {
        let now = self.now.load(Ordering::Acquire);
        Timestamp::from_millis(advance_high_water(&self.high_water, now))
    }
}
