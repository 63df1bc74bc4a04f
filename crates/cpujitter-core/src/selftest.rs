//! Startup self-test and process-wide runtime state.
//!
//! [`init`] runs once per process: it verifies the hash primitive, measures
//! the chosen timer through the full workload, applies the acceptance checks
//! below, and latches the common divisor of the observed deltas. Collectors
//! allocated afterwards divide every raw delta by that divisor so platforms
//! ticking in coarse units (say, multiples of 100) do not present trivially
//! zero low bits to the health tests.
//!
//! Three process-wide items live here, all write-once around the init latch:
//! the timer-thread backend, the FIPS failure callback, and the timer
//! selection plus divisor established by the test.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use serde::Serialize;

use crate::collector::{EntropyCollector, Flags};
use crate::conditioning::{Conditioner, PoolConditioner};
use crate::error::{HealthFailure, InitError};
use crate::notime::{BuiltinTimerThread, NotimeTimer, TimerThread};
use crate::timer::Timer;

/// Samples measured and kept by the startup test.
const POWERUP_TESTLOOPCOUNT: usize = 1024;
/// Leading measurements discarded to warm caches and branch predictors.
const CLEARCACHE: usize = 100;
/// Deltas examined by the resolution check.
const RESOLUTION_SAMPLES: usize = 300;
/// Deltas folded into the common divisor.
const GCD_SAMPLES: usize = 1000;

/// Process-wide callback invoked when a read detects a permanent health
/// failure in FIPS mode. The callback must not call back into the RNG.
pub type FipsFailureCallback = fn(&EntropyCollector, HealthFailure);

struct Globals {
    init_lock: Mutex<()>,
    initialized: AtomicBool,
    timer_gcd: AtomicU64,
    force_internal_timer: AtomicBool,
    timer_thread: Mutex<Arc<dyn TimerThread>>,
    fips_callback: Mutex<Option<FipsFailureCallback>>,
}

fn globals() -> &'static Globals {
    static GLOBALS: OnceLock<Globals> = OnceLock::new();
    GLOBALS.get_or_init(|| Globals {
        init_lock: Mutex::new(()),
        initialized: AtomicBool::new(false),
        timer_gcd: AtomicU64::new(0),
        force_internal_timer: AtomicBool::new(false),
        timer_thread: Mutex::new(Arc::new(BuiltinTimerThread::new())),
        fips_callback: Mutex::new(None),
    })
}

/// True once [`init`] completed successfully.
pub fn initialized() -> bool {
    globals().initialized.load(Ordering::Acquire)
}

/// Divisor applied to raw deltas, as established by [`init`]. 1 beforehand.
pub fn common_timer_gcd() -> u64 {
    globals().timer_gcd.load(Ordering::Relaxed).max(1)
}

/// Register the FIPS failure callback.
pub fn set_fips_failure_callback(cb: FipsFailureCallback) {
    *globals().fips_callback.lock().unwrap() = Some(cb);
}

pub(crate) fn notify_fips_failure(ec: &EntropyCollector, failure: HealthFailure) {
    if let Some(cb) = *globals().fips_callback.lock().unwrap() {
        cb(ec, failure);
    }
}

/// Replace the software-timer thread backend.
///
/// Must be the first interaction with the library: once [`init`] has
/// succeeded the backend is frozen and this returns a usage error.
pub fn switch_timer_thread_impl(imp: Arc<dyn TimerThread>) -> Result<(), InitError> {
    let g = globals();
    if g.initialized.load(Ordering::Acquire) {
        return Err(InitError::Usage);
    }
    *g.timer_thread.lock().unwrap() = imp;
    Ok(())
}

pub(crate) fn timer_thread_impl() -> Arc<dyn TimerThread> {
    globals().timer_thread.lock().unwrap().clone()
}

/// Pick the timer backend for a new collector, honoring both the caller's
/// flags and the process-wide selection made by [`init`].
pub(crate) fn select_timer(flags: Flags) -> Result<Timer, InitError> {
    let force = flags.contains(Flags::FORCE_INTERNAL_TIMER)
        || globals().force_internal_timer.load(Ordering::Relaxed);
    if force {
        if flags.contains(Flags::DISABLE_INTERNAL_TIMER) {
            // The platform clock was found unfit and the caller forbids the
            // software timer: no timer service remains.
            return Err(InitError::NoTimer);
        }
        let timer = NotimeTimer::new(timer_thread_impl()).map_err(|_| InitError::NoTimer)?;
        return Ok(Timer::Internal(timer));
    }
    Ok(Timer::Hardware)
}

/// Result of the startup acceptance test.
#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub osr: u32,
    pub flags: u32,
    /// Whether the software timer backed the accepted configuration.
    pub internal_timer: bool,
    /// Common divisor of the observed deltas.
    pub timer_gcd: u64,
    pub stuck_count: usize,
    pub backwards_steps: usize,
    /// Adjacent sample pairs whose delta changed.
    pub delta_changes: usize,
    /// Adjacent pairs whose second derivative changed.
    pub second_derivative_changes: usize,
}

/// Process-wide initialization.
///
/// Runs the acceptance test against the platform clock first (unless the
/// caller forces the internal timer), then retries with the software timer
/// (unless disabled). A software-timer acceptance latches the internal timer
/// for every later allocation. Subsequent calls return immediately.
pub fn init(osr: u32, flags: Flags) -> Result<(), InitError> {
    let g = globals();
    let _guard = g.init_lock.lock().unwrap();
    if g.initialized.load(Ordering::Acquire) {
        return Ok(());
    }
    if flags.contains(Flags::FORCE_INTERNAL_TIMER) && flags.contains(Flags::DISABLE_INTERNAL_TIMER)
    {
        return Err(InitError::Usage);
    }
    // Verify the primitive before blaming any timer.
    if !PoolConditioner::self_test() {
        return Err(InitError::HashSelfTest);
    }

    let mut outcome = if flags.contains(Flags::FORCE_INTERNAL_TIMER) {
        Err(InitError::NoTimer)
    } else {
        run_with_timer(osr, flags | Flags::DISABLE_INTERNAL_TIMER, Timer::Hardware)
    };

    let mut used_internal = false;
    if outcome.is_err() && !flags.contains(Flags::DISABLE_INTERNAL_TIMER) {
        if let Ok(timer) = NotimeTimer::new(timer_thread_impl()) {
            let sw = run_with_timer(
                osr,
                flags | Flags::FORCE_INTERNAL_TIMER,
                Timer::Internal(timer),
            );
            used_internal = sw.is_ok();
            // Surface the result of the last attempt either way.
            outcome = sw;
        }
    }

    let report = fallback_denied(outcome, flags)?;
    g.timer_gcd.store(report.timer_gcd, Ordering::Relaxed);
    g.force_internal_timer.store(used_internal, Ordering::Relaxed);
    g.initialized.store(true, Ordering::Release);
    Ok(())
}

/// Run the full startup acceptance test against an explicit timer backend.
///
/// [`init`] drives this against the platform timers; regression suites drive
/// it with replay traces. The test owns a throwaway collector, measures
/// 1,024 samples after the cache warm-up, and applies every acceptance
/// check. No process-wide state is touched.
pub fn run_with_timer(
    osr: u32,
    flags: Flags,
    timer: Timer,
) -> Result<StartupReport, InitError> {
    if !PoolConditioner::self_test() {
        return Err(InitError::HashSelfTest);
    }

    let internal_timer = matches!(timer, Timer::Internal(_));
    let mut ec = EntropyCollector::with_components(osr, flags, timer, 1)?;
    ec.start_timer().map_err(|_| InitError::NoTimer)?;

    let mut deltas = Vec::with_capacity(POWERUP_TESTLOOPCOUNT);
    let mut stuck_count = 0usize;
    let mut backwards = 0usize;
    let mut prev_abs = 0u64;

    for i in 0..(CLEARCACHE + POWERUP_TESTLOOPCOUNT) {
        let (delta, stuck) = ec.measure();
        let now = ec.prev_time();
        if i < CLEARCACHE {
            prev_abs = now;
            continue;
        }
        if now < prev_abs {
            backwards += 1;
        }
        prev_abs = now;
        if stuck {
            stuck_count += 1;
        }
        deltas.push(delta);
    }
    ec.stop_timer();

    // Resolution: the clock must tick between adjacent measurements more
    // often than not.
    let mut head = deltas[..RESOLUTION_SAMPLES].to_vec();
    head.sort_unstable();
    if head[RESOLUTION_SAMPLES / 2] == 0 {
        return Err(InitError::CoarseTimer);
    }

    if backwards > 0 {
        return Err(InitError::NonMonotonic);
    }

    let delta_changes = changes(&deltas);
    if delta_changes < POWERUP_TESTLOOPCOUNT / 10 {
        return Err(InitError::MinVariation);
    }

    // First and second derivatives of the delta sequence.
    let d1: Vec<u64> = deltas.windows(2).map(|w| w[1].wrapping_sub(w[0])).collect();
    let d2: Vec<u64> = d1.windows(2).map(|w| w[1].wrapping_sub(w[0])).collect();

    if d2.iter().all(|&v| v == 0) {
        return Err(InitError::NoSecondDerivative);
    }
    let second_derivative_changes = changes(&d2);
    if second_derivative_changes < POWERUP_TESTLOOPCOUNT / 10 {
        return Err(InitError::MinSecondDerivative);
    }

    if stuck_count > POWERUP_TESTLOOPCOUNT * 9 / 10 {
        return Err(InitError::Stuck);
    }

    let failure = ec.health_failure();
    if failure.contains(HealthFailure::RCT) {
        return Err(InitError::RepetitionCount);
    }
    if !failure.is_empty() {
        return Err(InitError::Health);
    }

    let timer_gcd = common_gcd(&deltas[..GCD_SAMPLES]);
    if timer_gcd == 0 {
        return Err(InitError::Gcd);
    }

    Ok(StartupReport {
        osr: ec.osr(),
        flags: flags.bits(),
        internal_timer,
        timer_gcd,
        stuck_count,
        backwards_steps: backwards,
        delta_changes,
        second_derivative_changes,
    })
}

/// When the caller forbids the software fallback, a failed hardware
/// acceptance means no timer service remains.
fn fallback_denied(
    outcome: Result<StartupReport, InitError>,
    flags: Flags,
) -> Result<StartupReport, InitError> {
    if outcome.is_err() && flags.contains(Flags::DISABLE_INTERNAL_TIMER) {
        return Err(InitError::NoTimer);
    }
    outcome
}

/// Adjacent sample pairs whose value changed.
fn changes(values: &[u64]) -> usize {
    values.windows(2).filter(|w| w[0] != w[1]).count()
}

/// Common divisor of a delta set, by pairwise reduction. Returns 0 when the
/// set is empty or all-zero.
pub fn common_gcd(deltas: &[u64]) -> u64 {
    let mut acc = 0u64;
    for &d in deltas {
        acc = gcd64(acc, d);
        if acc == 1 {
            break;
        }
    }
    acc
}

fn gcd64(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ReplayTimer;

    fn replay(readings: Vec<u64>) -> Timer {
        Timer::Replay(ReplayTimer::new(readings))
    }

    const TRACE_LEN: usize = CLEARCACHE + POWERUP_TESTLOOPCOUNT + 8;

    #[test]
    fn flat_timer_is_rejected_as_coarse() {
        let timer = replay(vec![0; TRACE_LEN]);
        let err = run_with_timer(1, Flags::DISABLE_MEMORY_ACCESS, timer).unwrap_err();
        assert_eq!(err, InitError::CoarseTimer);
    }

    #[cfg(not(feature = "lag-predictor"))]
    #[test]
    fn alternating_deltas_pass_and_yield_their_divisor() {
        let deltas: Vec<u64> = (0..TRACE_LEN)
            .map(|i| if i % 2 == 0 { 5 } else { 10 })
            .collect();
        let timer = Timer::Replay(ReplayTimer::from_deltas(1_000, &deltas));
        let report = run_with_timer(1, Flags::DISABLE_MEMORY_ACCESS, timer).unwrap();
        assert_eq!(report.timer_gcd, 5);
        assert!(report.stuck_count < POWERUP_TESTLOOPCOUNT / 10);
        assert_eq!(report.backwards_steps, 0);
    }

    #[test]
    fn backwards_step_is_rejected() {
        let mut trace = Vec::with_capacity(TRACE_LEN + 1);
        let mut current = 10_000u64;
        trace.push(current);
        for i in 0..TRACE_LEN {
            // Rewind the clock once, well inside the counted window.
            if i == 600 {
                current -= 50;
            } else {
                current += if i % 2 == 0 { 3 } else { 7 };
            }
            trace.push(current);
        }
        let err = run_with_timer(1, Flags::DISABLE_MEMORY_ACCESS, replay(trace)).unwrap_err();
        assert_eq!(err, InitError::NonMonotonic);
    }

    #[test]
    fn constant_deltas_fail_minimum_variation() {
        let deltas = vec![9u64; TRACE_LEN];
        let timer = Timer::Replay(ReplayTimer::from_deltas(1, &deltas));
        let err = run_with_timer(1, Flags::DISABLE_MEMORY_ACCESS, timer).unwrap_err();
        assert_eq!(err, InitError::MinVariation);
    }

    #[test]
    fn denied_fallback_reports_no_timer_service() {
        // With the software timer forbidden, a coarse platform clock leaves
        // no timer service at all.
        let denied = fallback_denied(
            Err(InitError::CoarseTimer),
            Flags::DISABLE_INTERNAL_TIMER,
        );
        assert_eq!(denied.unwrap_err(), InitError::NoTimer);

        // With the fallback allowed, the acceptance error stands on its own.
        let allowed = fallback_denied(Err(InitError::CoarseTimer), Flags::NONE);
        assert_eq!(allowed.unwrap_err(), InitError::CoarseTimer);
    }

    #[test]
    fn common_gcd_reduces_pairwise() {
        assert_eq!(common_gcd(&[10, 20, 30]), 10);
        assert_eq!(common_gcd(&[100, 100, 100]), 100);
        assert_eq!(common_gcd(&[12, 18, 27]), 3);
        assert_eq!(common_gcd(&[7, 13]), 1);
        assert_eq!(common_gcd(&[]), 0);
        assert_eq!(common_gcd(&[0, 0]), 0);
    }

    #[test]
    fn normalized_deltas_share_no_divisor() {
        let deltas = [15u64, 25, 40, 90];
        let gcd = common_gcd(&deltas);
        assert_eq!(gcd, 5);
        let normalized: Vec<u64> = deltas.iter().map(|d| d / gcd).collect();
        assert_eq!(common_gcd(&normalized), 1);
    }
}
