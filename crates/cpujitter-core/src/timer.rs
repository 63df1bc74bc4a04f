//! Time sources feeding the measurement loop.
//!
//! Every backend exposes the same contract: a monotonically non-decreasing
//! 64-bit counter with the finest resolution the platform offers. Whether a
//! backend is actually fine-grained enough to carry jitter is decided by the
//! startup self-test, not here.

use crate::notime::NotimeTimer;

/// Timer backend of a collector.
pub enum Timer {
    /// Platform monotonic clock.
    Hardware,
    /// Free-running counter thread, for platforms with a coarse clock.
    Internal(NotimeTimer),
    /// Recorded trace, for deterministic offline regression runs.
    Replay(ReplayTimer),
}

impl Timer {
    pub(crate) fn now(&mut self) -> u64 {
        match self {
            Timer::Hardware => hw_now(),
            Timer::Internal(timer) => timer.now(),
            Timer::Replay(trace) => trace.now(),
        }
    }
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn mach_absolute_time() -> u64;
}

/// Raw tick count of the ARM system counter.
#[cfg(target_os = "macos")]
fn hw_now() -> u64 {
    // SAFETY: mach_absolute_time takes no arguments and has no preconditions.
    unsafe { mach_absolute_time() }
}

/// Nanoseconds of CLOCK_MONOTONIC.
#[cfg(all(unix, not(target_os = "macos")))]
fn hw_now() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer for clock_gettime.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64)
        .wrapping_mul(1_000_000_000)
        .wrapping_add(ts.tv_nsec as u64)
}

#[cfg(not(unix))]
fn hw_now() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Replays a recorded sequence of counter readings.
///
/// Once the trace is exhausted the final reading repeats, which a consumer
/// observes as a stuck timer.
pub struct ReplayTimer {
    readings: Vec<u64>,
    pos: usize,
}

impl ReplayTimer {
    pub fn new(readings: Vec<u64>) -> Self {
        Self { readings, pos: 0 }
    }

    /// Build a trace from a start value and successive deltas.
    pub fn from_deltas(start: u64, deltas: &[u64]) -> Self {
        let mut readings = Vec::with_capacity(deltas.len() + 1);
        let mut current = start;
        readings.push(current);
        for &d in deltas {
            current = current.wrapping_add(d);
            readings.push(current);
        }
        Self::new(readings)
    }

    /// Readings not yet consumed.
    pub fn remaining(&self) -> usize {
        self.readings.len().saturating_sub(self.pos)
    }

    fn now(&mut self) -> u64 {
        let value = self
            .readings
            .get(self.pos)
            .or_else(|| self.readings.last())
            .copied()
            .unwrap_or(0);
        if self.pos < self.readings.len() {
            self.pos += 1;
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_timer_is_non_decreasing() {
        let mut timer = Timer::Hardware;
        let a = timer.now();
        let b = timer.now();
        assert!(b >= a, "clock ran backwards: {a} -> {b}");
        assert!(a > 0);
    }

    #[test]
    fn replay_returns_trace_then_repeats_last() {
        let mut timer = Timer::Replay(ReplayTimer::new(vec![3, 7, 12]));
        assert_eq!(timer.now(), 3);
        assert_eq!(timer.now(), 7);
        assert_eq!(timer.now(), 12);
        assert_eq!(timer.now(), 12);
        assert_eq!(timer.now(), 12);
    }

    #[test]
    fn replay_from_deltas_accumulates() {
        let trace = ReplayTimer::from_deltas(100, &[5, 10, 5]);
        assert_eq!(trace.readings, vec![100, 105, 115, 120]);
        assert_eq!(trace.remaining(), 4);
    }
}
