//! Busy-Wait Delays
//!
//! Boot drivers run without a scheduler, so every delay is a busy wait.
//! Platforms provide [`Stall`]; [`SpinStall`] is a calibrated fallback for
//! environments without a firmware delay service.

use core::sync::atomic::{AtomicU64, Ordering};

/// Microsecond delay primitive
pub trait Stall {
    /// Busy-wait for at least `micros` microseconds
    fn stall(&self, micros: u64);
}

impl<S: Stall + ?Sized> Stall for &S {
    fn stall(&self, micros: u64) {
        (**self).stall(micros);
    }
}

/// Spin-loop delay calibrated in loop iterations per microsecond
#[derive(Debug)]
pub struct SpinStall {
    loops_per_us: AtomicU64,
}

impl SpinStall {
    /// Create a delay source with a known calibration
    pub const fn new(loops_per_us: u64) -> Self {
        Self {
            loops_per_us: AtomicU64::new(loops_per_us),
        }
    }

    /// Update the calibration (e.g. after measuring against a timer)
    pub fn calibrate(&self, loops_per_us: u64) {
        self.loops_per_us.store(loops_per_us.max(1), Ordering::Relaxed);
    }

    /// Current calibration
    pub fn loops_per_us(&self) -> u64 {
        self.loops_per_us.load(Ordering::Relaxed)
    }
}

impl Stall for SpinStall {
    fn stall(&self, micros: u64) {
        let loops = micros.saturating_mul(self.loops_per_us());
        for _ in 0..loops {
            core::hint::spin_loop();
        }
    }
}
