//! The entropy collector: measurement loop, conditioning, and output.

use std::ptr;

use serde::Serialize;

use crate::conditioning::{Conditioner, DIGEST_SIZE, PoolConditioner};
use crate::error::{HealthFailure, InitError, ReadError};
use crate::health::Health;
use crate::selftest;
use crate::timer::Timer;
use crate::workload::{DEFAULT_MEMORY_SIZE, MemoryWorkload, hash_round, secure_zero};

/// Bits of one conditioned output block.
pub(crate) const DATA_SIZE_BITS: u32 = 256;

/// Extra bits absorbed beyond the output width of every block. A 256-bit
/// hash output can only approach 256 bits of min-entropy asymptotically;
/// oversampling by 64 bits closes the conditioning loss.
pub(crate) const ENTROPY_SAFETY_FACTOR: u32 = 64;

/// Smallest accepted oversampling rate.
pub(crate) const MIN_OSR: u32 = 3;

/// Construction options for [`EntropyCollector`].
///
/// Bits 0 and 1 are historical and stay reserved; bits 28..=31 select the
/// maximum workload memory size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Skip the memory-access workload; the hash round alone is timed.
    /// Reduces the entropy rate.
    pub const DISABLE_MEMORY_ACCESS: Flags = Flags(1 << 2);
    /// Use the software timer even if the platform clock is acceptable.
    pub const FORCE_INTERNAL_TIMER: Flags = Flags(1 << 3);
    /// Never fall back to the software timer.
    pub const DISABLE_INTERNAL_TIMER: Flags = Flags(1 << 4);
    /// SP 800-90B compliant operation: permanent cutoffs and the failure
    /// callback.
    pub const FORCE_FIPS: Flags = Flags(1 << 5);

    const MEMSIZE_SHIFT: u32 = 28;
    /// Size selector k maps to 2^(k + 14) bytes; k = 1 is 32 KiB.
    const MEMSIZE_OFFSET: u32 = 14;
    const MEMSIZE_MAX_BYTES: usize = 1 << 29;

    pub fn from_bits(bits: u32) -> Flags {
        Flags(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Cap the workload buffer at 2^(k + 14) bytes, 1 <= k <= 15
    /// (32 KiB up to 512 MiB). k = 0 keeps the default.
    pub fn with_max_memsize(self, k: u32) -> Flags {
        Flags((self.0 & !(0xf << Self::MEMSIZE_SHIFT)) | ((k & 0xf) << Self::MEMSIZE_SHIFT))
    }

    fn requested_memsize(self) -> Option<usize> {
        let k = self.0 >> Self::MEMSIZE_SHIFT;
        if k == 0 {
            return None;
        }
        Some((1usize << (k + Self::MEMSIZE_OFFSET)).min(Self::MEMSIZE_MAX_BYTES))
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// One noise-source instance with its conditioning state and health tests.
///
/// A collector is strictly single-threaded; every operation takes
/// `&mut self`, so exclusive access is enforced by construction. The only
/// second thread is the optional software timer worker, started and stopped
/// around each read. Sensitive state is wiped on drop.
pub struct EntropyCollector {
    pool: PoolConditioner,
    prev_time: u64,
    osr: u32,
    flags: Flags,
    fips_enabled: bool,
    workload: Option<MemoryWorkload>,
    /// Input block of the hash round.
    scratch: [u8; 32],
    health: Health,
    timer: Timer,
    /// Divisor applied to every raw delta before testing and absorption.
    timer_gcd: u64,
}

impl EntropyCollector {
    /// Allocate a collector with the process-wide timer selection and the
    /// divisor established by [`init`](crate::init).
    ///
    /// `osr` 0 selects the default oversampling rate; smaller values are
    /// raised to the minimum of 3.
    pub fn alloc(osr: u32, flags: Flags) -> Result<Self, InitError> {
        let timer = selftest::select_timer(flags)?;
        Self::with_components(osr, flags, timer, selftest::common_timer_gcd())
    }

    /// Allocate with an explicit timer backend and delta divisor.
    ///
    /// This is the entry point for replay-driven regression runs: two
    /// collectors built from identical parameters and identical timer traces
    /// produce byte-identical output.
    pub fn with_components(
        osr: u32,
        flags: Flags,
        timer: Timer,
        timer_gcd: u64,
    ) -> Result<Self, InitError> {
        if flags.contains(Flags::FORCE_INTERNAL_TIMER) && flags.contains(Flags::DISABLE_INTERNAL_TIMER)
        {
            return Err(InitError::Usage);
        }
        let osr = if osr == 0 { MIN_OSR } else { osr.max(MIN_OSR) };
        let fips_enabled = flags.contains(Flags::FORCE_FIPS);
        let workload = if flags.contains(Flags::DISABLE_MEMORY_ACCESS) {
            None
        } else {
            let size = flags.requested_memsize().unwrap_or(DEFAULT_MEMORY_SIZE);
            Some(MemoryWorkload::random_access(size))
        };
        Ok(Self {
            pool: PoolConditioner::new(),
            prev_time: 0,
            osr,
            flags,
            fips_enabled,
            workload,
            scratch: [0u8; 32],
            health: Health::new(osr, fips_enabled),
            timer,
            timer_gcd: timer_gcd.max(1),
        })
    }

    pub fn osr(&self) -> u32 {
        self.osr
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn fips_enabled(&self) -> bool {
        self.fips_enabled
    }

    /// Divisor applied to every raw delta.
    pub fn timer_gcd(&self) -> u64 {
        self.timer_gcd
    }

    /// Sticky mask of tripped health tests.
    pub fn health_failure(&self) -> HealthFailure {
        self.health.failure()
    }

    pub(crate) fn prev_time(&self) -> u64 {
        self.prev_time
    }

    /// Fill `data` with conditioned output.
    ///
    /// Returns the number of bytes written (always `data.len()` on success).
    /// A permanent health failure aborts the request and every later one;
    /// the collector must then be discarded or rebuilt.
    pub fn read(&mut self, data: &mut [u8]) -> Result<usize, ReadError> {
        if data.is_empty() {
            return Err(ReadError::InvalidRequest);
        }
        self.start_timer()?;
        let result = self.read_inner(data);
        self.stop_timer();
        result
    }

    /// [`read`](Self::read) with one automatic recovery: on a permanent
    /// health failure the collector state is rebuilt from scratch and the
    /// request retried once before the error surfaces.
    pub fn read_safe(&mut self, data: &mut [u8]) -> Result<usize, ReadError> {
        match self.read(data) {
            Err(ReadError::Health(_)) => {
                self.reinit();
                self.read(data)
            }
            other => other,
        }
    }

    fn read_inner(&mut self, data: &mut [u8]) -> Result<usize, ReadError> {
        let len = data.len();
        let mut offset = 0;
        while offset < len {
            self.random_data();
            let failure = self.health.failure();
            if !failure.is_empty() {
                if self.fips_enabled {
                    selftest::notify_fips_failure(&*self, failure);
                }
                return Err(ReadError::Health(failure));
            }
            let mut block = self.pool.squeeze();
            let tocopy = DIGEST_SIZE.min(len - offset);
            data[offset..offset + tocopy].copy_from_slice(&block[..tocopy]);
            secure_zero(&mut block);
            offset += tocopy;
        }
        // One more collection round, so the retained sponge state differs
        // from the state that produced the last block. Its health verdict is
        // picked up by the next read.
        self.random_data();
        Ok(len)
    }

    /// Keep measuring until (256 + 64) * osr non-stuck samples were absorbed
    /// or a health test latched a failure.
    fn random_data(&mut self) {
        let required = (DATA_SIZE_BITS + ENTROPY_SAFETY_FACTOR) * self.osr;
        // Prime prev_time; the first delta spans whatever happened since the
        // previous burst and carries no usable timing signal.
        self.measure();
        let mut collected = 0u32;
        while self.health.failure().is_empty() {
            if self.measure().1 {
                // Stuck sample: repeat the measurement.
                continue;
            }
            collected += 1;
            if collected >= required {
                break;
            }
        }
    }

    /// One measurement round: workload, timestamp, classification, and, for
    /// non-stuck samples, absorption. Returns the normalized delta and the
    /// stuck verdict. The ordering is strict and must not be rearranged.
    pub(crate) fn measure(&mut self) -> (u64, bool) {
        if let Some(workload) = &mut self.workload {
            // The visit pattern is seeded by the current sponge state.
            workload.exercise(self.pool.state_fold());
        }
        hash_round(&mut self.scratch, self.prev_time);

        let time = self.timer.now();
        let delta = time.wrapping_sub(self.prev_time) / self.timer_gcd;
        self.prev_time = time;

        let stuck = self.health.insert(delta);
        if !stuck {
            self.pool.absorb(&delta.to_le_bytes());
        }
        (delta, stuck)
    }

    /// Collect `count` raw, unnormalized deltas for offline assessment.
    ///
    /// This is the tap the offline recorder and divisor estimator consume:
    /// plain workload-plus-timestamp rounds that bypass the health tests and
    /// the conditioner entirely.
    pub fn raw_samples(&mut self, count: usize) -> Result<Vec<u64>, ReadError> {
        self.start_timer()?;
        self.raw_sample();
        let samples = (0..count).map(|_| self.raw_sample()).collect();
        self.stop_timer();
        Ok(samples)
    }

    fn raw_sample(&mut self) -> u64 {
        if let Some(workload) = &mut self.workload {
            workload.exercise(self.pool.state_fold());
        }
        hash_round(&mut self.scratch, self.prev_time);
        let time = self.timer.now();
        let delta = time.wrapping_sub(self.prev_time);
        self.prev_time = time;
        delta
    }

    /// Start the software timer worker if this collector uses one.
    pub(crate) fn start_timer(&mut self) -> Result<(), ReadError> {
        if let Timer::Internal(timer) = &mut self.timer {
            timer.settick().map_err(|_| ReadError::TimerThread)?;
        }
        Ok(())
    }

    pub(crate) fn stop_timer(&mut self) {
        if let Timer::Internal(timer) = &mut self.timer {
            timer.unsettick();
        }
    }

    /// Switch to the strided block geometry instead of random access.
    /// Intended for measurement studies comparing address patterns; the
    /// random-access geometry is the default and the better noise driver.
    pub fn use_blockwise_workload(&mut self) {
        if self.workload.is_some() {
            self.workload = Some(MemoryWorkload::blockwise());
        }
    }

    /// Rebuild conditioning, health, and workload state in place, keeping
    /// the timer backend.
    fn reinit(&mut self) {
        self.pool.reset();
        self.prev_time = 0;
        self.scratch = [0u8; 32];
        self.health = Health::new(self.osr, self.fips_enabled);
        self.workload = self.workload.as_ref().map(MemoryWorkload::rebuild);
    }

    /// Point-in-time view of collector state.
    pub fn snapshot(&self) -> CollectorSnapshot {
        CollectorSnapshot {
            osr: self.osr,
            flags: self.flags.bits(),
            fips_enabled: self.fips_enabled,
            internal_timer: matches!(self.timer, Timer::Internal(_)),
            timer_gcd: self.timer_gcd,
            memory_size: self.workload.as_ref().map_or(0, |w| w.size()),
            health_failure: self.health.failure().bits(),
            rct_count: self.health.rct_count(),
            apt_base: self.health.apt().base(),
            apt_count: self.health.apt().count(),
            apt_observations: self.health.apt().observations(),
            apt_cutoff: self.health.apt().cutoff(),
            lag_observations: self.health.lag().map(|l| l.observations()),
        }
    }
}

impl std::fmt::Debug for EntropyCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntropyCollector").finish_non_exhaustive()
    }
}

impl Drop for EntropyCollector {
    fn drop(&mut self) {
        self.pool.reset();
        secure_zero(&mut self.scratch);
        self.health.wipe();
        // SAFETY: plain owned field.
        unsafe { ptr::write_volatile(&mut self.prev_time, 0) };
    }
}

/// Diagnostic snapshot of a collector.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorSnapshot {
    pub osr: u32,
    pub flags: u32,
    pub fips_enabled: bool,
    pub internal_timer: bool,
    pub timer_gcd: u64,
    pub memory_size: usize,
    pub health_failure: u32,
    pub rct_count: u32,
    pub apt_base: u64,
    pub apt_count: u32,
    pub apt_observations: u32,
    pub apt_cutoff: u32,
    pub lag_observations: Option<u32>,
}
