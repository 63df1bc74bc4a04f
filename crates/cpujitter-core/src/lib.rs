//! # cpujitter-core
//!
//! Non-physical true random number generator harvesting entropy from the
//! execution-timing jitter of the CPU. A fixed memory-access and hashing
//! workload runs between readings of a high-resolution clock; the
//! unpredictable microarchitectural events behind each measured duration —
//! cache state, branch prediction, DRAM refresh, interrupts, pipeline
//! contention — are the noise source. Every measurement is health-tested on
//! line (repetition count, adaptive proportion, and optionally a lag
//! predictor, all derived from SP 800-90B) before being absorbed into a
//! SHA3-256 sponge that squeezes uniformly distributed output.
//!
//! ## Quick start
//!
//! ```no_run
//! use cpujitter_core::{EntropyCollector, Flags, init};
//!
//! init(0, Flags::NONE).expect("timer unfit for entropy collection");
//! let mut ec = EntropyCollector::alloc(0, Flags::NONE).unwrap();
//! let mut buf = [0u8; 32];
//! ec.read_safe(&mut buf).unwrap();
//! ```
//!
//! [`init`] must run once per process: it validates the timer (falling back
//! to a software counter thread where the platform clock is too coarse) and
//! establishes the common divisor of the timer's deltas. Collectors are
//! strictly single-threaded; the only second thread ever spawned is the
//! optional software timer worker. Once any health test latches a failure a
//! collector is permanently unusable; [`EntropyCollector::read_safe`]
//! rebuilds and retries once.
//!
//! The generator never touches operating-system entropy pools and needs no
//! privileged instructions; a sub-microsecond clock is its only platform
//! requirement.

pub mod collector;
pub mod conditioning;
pub mod error;
mod health;
pub mod notime;
pub mod selftest;
pub mod timer;
mod workload;

pub use collector::{CollectorSnapshot, EntropyCollector, Flags};
pub use conditioning::{Conditioner, DIGEST_SIZE, PoolConditioner, Sha3Conditioner};
pub use error::{HealthFailure, InitError, ReadError};
pub use notime::{BuiltinTimerThread, TimerThread};
pub use selftest::{
    FipsFailureCallback, StartupReport, common_timer_gcd, init, initialized,
    set_fips_failure_callback, switch_timer_thread_impl,
};
pub use timer::{ReplayTimer, Timer};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version packed as major * 1_000_000 + minor * 10_000 + patch * 100.
pub fn version() -> u32 {
    let major: u32 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor: u32 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    let patch: u32 = env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0);
    major * 1_000_000 + minor * 10_000 + patch * 100
}
