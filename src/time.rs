//! Millisecond time service
//!
//! A 1 kHz tick source (usually the SysTick interrupt) drives [`Clock::tick`];
//! everything else reads. The counters are wrapping and users are expected to
//! compare differences, never absolute values.

use core::sync::atomic::{AtomicU32, Ordering};

/// A split second/millisecond timestamp
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timestamp {
    pub sec: u32,
    pub ms: u32,
}

/// Monotonic clock fed by a 1 kHz tick
///
/// Single writer (the tick handler), any number of readers. The `sec`/`ms`
/// pair is read with a double-read of `sec`: if the seconds counter moved
/// between the two reads, the tick handler rolled the pair over mid-read
/// and the read is retried.
pub struct Clock {
    ticks: AtomicU32,
    ms: AtomicU32,
    sec: AtomicU32,
}

impl Clock {
    pub const fn new() -> Self {
        Clock {
            ticks: AtomicU32::new(0),
            ms: AtomicU32::new(0),
            sec: AtomicU32::new(0),
        }
    }

    /// Advances the clock by one millisecond. Call from the tick interrupt,
    /// and from nowhere else.
    pub fn tick(&self) {
        self.ticks
            .store(self.ticks.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);

        let ms = self.ms.load(Ordering::Relaxed) + 1;
        if ms == 1000 {
            self.sec
                .store(self.sec.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);
            self.ms.store(0, Ordering::Relaxed);
        } else {
            self.ms.store(ms, Ordering::Relaxed);
        }
    }

    /// Raw tick counter (wraps)
    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Coherent second/millisecond pair
    pub fn timestamp(&self) -> Timestamp {
        loop {
            let sec = self.sec.load(Ordering::Relaxed);
            let ms = self.ms.load(Ordering::Relaxed);
            if self.sec.load(Ordering::Relaxed) == sec {
                return Timestamp { sec, ms };
            }
        }
    }

    /// Milliseconds elapsed since boot
    pub fn now(&self) -> u64 {
        let t = self.timestamp();
        u64::from(t.sec) * 1000 + u64::from(t.ms)
    }

    /// Ticks elapsed since a reference tick count
    pub fn since(&self, ref_ticks: u32) -> i32 {
        self.ticks().wrapping_sub(ref_ticks) as i32
    }

    /// Milliseconds between a reference timestamp and now. Negative when the
    /// reference is in the future.
    pub fn diff_ms(&self, reference: Timestamp) -> i64 {
        let now = self.timestamp();

        if reference.sec == now.sec {
            i64::from(now.ms) - i64::from(reference.ms)
        } else if reference.sec < now.sec {
            let mut d = i64::from(1000 - reference.ms);
            d += i64::from(now.sec - reference.sec - 1) * 1000;
            d += i64::from(now.ms);
            d
        } else {
            let mut d = -i64::from(1000 - now.ms);
            d -= i64::from(reference.sec - now.sec - 1) * 1000;
            d -= i64::from(reference.ms);
            d
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
