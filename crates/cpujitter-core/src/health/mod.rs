//! On-line health testing of the raw timing stream.
//!
//! Every GCD-normalized delta passes through the stuck detector and the
//! SP 800-90B derived tests: the repetition count test over the stuck
//! predicate, the adaptive proportion test, and (behind the `lag-predictor`
//! feature) the lag predictor. Stuck samples are never credited as entropy
//! but still feed every test. Failures latch into a sticky mask; a collector
//! with a non-empty mask is permanently unusable.

mod apt;
mod lag;
mod rct;

pub(crate) use apt::AdaptiveProportion;
pub(crate) use lag::LagPredictor;
pub(crate) use rct::RepetitionCount;

use std::ptr;

use crate::error::HealthFailure;

pub(crate) struct Health {
    rct: RepetitionCount,
    apt: AdaptiveProportion,
    lag: Option<LagPredictor>,
    /// Previous delta and previous first derivative, for the stuck detector.
    last_delta: u64,
    last_delta2: u64,
    failure: HealthFailure,
}

impl Health {
    pub(crate) fn new(osr: u32, fips: bool) -> Self {
        let lag = if cfg!(feature = "lag-predictor") {
            Some(LagPredictor::new(osr))
        } else {
            None
        };
        Self {
            rct: RepetitionCount::new(osr, fips),
            apt: AdaptiveProportion::new(osr),
            lag,
            last_delta: 0,
            last_delta2: 0,
            failure: HealthFailure::NONE,
        }
    }

    /// Classify one normalized delta and update every test.
    ///
    /// A sample is stuck when its value or either timing derivative is zero.
    /// Returns the stuck verdict.
    pub(crate) fn insert(&mut self, delta: u64) -> bool {
        let delta2 = delta.wrapping_sub(self.last_delta);
        let delta3 = delta2.wrapping_sub(self.last_delta2);
        self.last_delta = delta;
        self.last_delta2 = delta2;

        self.apt.insert(delta, &mut self.failure);
        if let Some(lag) = &mut self.lag {
            lag.insert(delta, &mut self.failure);
        }

        let stuck = delta == 0 || delta2 == 0 || delta3 == 0;
        self.rct.insert(stuck, &mut self.failure);
        stuck
    }

    pub(crate) fn failure(&self) -> HealthFailure {
        self.failure
    }

    pub(crate) fn rct_count(&self) -> u32 {
        self.rct.count()
    }

    pub(crate) fn apt(&self) -> &AdaptiveProportion {
        &self.apt
    }

    pub(crate) fn lag(&self) -> Option<&LagPredictor> {
        self.lag.as_ref()
    }

    /// Volatile wipe of the retained timing values.
    pub(crate) fn wipe(&mut self) {
        // SAFETY: both destinations are plain owned fields.
        unsafe {
            ptr::write_volatile(&mut self.last_delta, 0);
            ptr::write_volatile(&mut self.last_delta2, 0);
        }
    }
}
