//! Repetition count test (SP 800-90B section 4.4.1) over the stuck
//! predicate.

use crate::error::HealthFailure;

/// Counts consecutive stuck samples and latches a permanent failure at the
/// cutoff.
pub(crate) struct RepetitionCount {
    count: u32,
    cutoff: u32,
}

impl RepetitionCount {
    /// Cutoff C = ceil(-log2(alpha) / H) with alpha = 2^-30 and H = 1/osr
    /// bits of credited min-entropy per sample, plus one in FIPS mode where
    /// the zero-based counter maps onto the permanent-failure variant.
    pub(crate) fn new(osr: u32, fips: bool) -> Self {
        let per_sample = if fips { 31 } else { 30 };
        Self {
            count: 0,
            cutoff: per_sample * osr.max(1),
        }
    }

    pub(crate) fn insert(&mut self, stuck: bool, failure: &mut HealthFailure) {
        if stuck {
            self.count = self.count.saturating_add(1);
            if self.count >= self.cutoff {
                failure.set(HealthFailure::RCT);
            }
        } else {
            self.count = 0;
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    #[cfg(test)]
    pub(crate) fn cutoff(&self) -> u32 {
        self.cutoff
    }
}
