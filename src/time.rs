//! Adjusted network time and the mocktime override.
//!
//! Validation compares header timestamps against "adjusted time": system
//! time plus the median clock offset observed in peer VERSION handshakes,
//! with the offset clamped so hostile peers cannot drag the clock far.
//! Non-main networks may pin the clock entirely with `set_mock_time`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Largest absolute adjustment peers can induce, seconds.
pub const MAX_TIME_OFFSET: i64 = 70 * 60;

/// Offset samples required before any adjustment applies.
const MIN_OFFSET_SAMPLES: usize = 5;

/// Cap on retained samples; oldest are dropped first.
const MAX_OFFSET_SAMPLES: usize = 200;

pub struct Clock {
    /// 0 means "not mocked" (the epoch itself is not a usable mock value).
    mock: AtomicU64,
    offset: AtomicI64,
    samples: Mutex<Vec<i64>>,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            mock: AtomicU64::new(0),
            offset: AtomicI64::new(0),
            samples: Mutex::new(Vec::new()),
        }
    }

    /// Raw local time (or the mock), seconds since the epoch.
    pub fn now(&self) -> u64 {
        let mock = self.mock.load(Ordering::Relaxed);
        if mock != 0 {
            return mock;
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Network-adjusted time used by contextual validation.
    pub fn adjusted(&self) -> u64 {
        let base = self.now();
        let offset = self.offset.load(Ordering::Relaxed);
        if offset >= 0 {
            base.saturating_add(offset as u64)
        } else {
            base.saturating_sub(offset.unsigned_abs())
        }
    }

    /// Records one peer's clock offset (peer time minus ours) and refreshes
    /// the median adjustment.
    pub fn add_peer_offset(&self, offset: i64) {
        let mut samples = self.samples.lock();
        if samples.len() >= MAX_OFFSET_SAMPLES {
            samples.remove(0);
        }
        samples.push(offset.clamp(-MAX_TIME_OFFSET, MAX_TIME_OFFSET));

        if samples.len() < MIN_OFFSET_SAMPLES {
            return;
        }
        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2];
        self.offset
            .store(median.clamp(-MAX_TIME_OFFSET, MAX_TIME_OFFSET), Ordering::Relaxed);
    }

    /// Pins the clock. `0` clears the mock.
    pub fn set_mock_time(&self, time: u64) {
        self.mock.store(time, Ordering::Relaxed);
    }

    pub fn is_mocked(&self) -> bool {
        self.mock.load(Ordering::Relaxed) != 0
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}
