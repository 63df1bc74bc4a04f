//! Error and failure types.
//!
//! Startup acceptance failures ([`InitError`]) carry the historical positive
//! error codes; runtime health failures ([`HealthFailure`]) are a sticky
//! bitmask surfaced through [`ReadError`], whose [`ReadError::code`] encodes
//! the mask as a negative value for callers bridging to C-style interfaces.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Errors from the startup self-test and collector construction.
///
/// Every variant is terminal for the attempt that produced it; no partial
/// state survives a failed `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// No usable timer backend could be constructed.
    NoTimer,
    /// The timer resolution is too coarse to carry jitter.
    CoarseTimer,
    /// The timer ran backwards during the acceptance test.
    NonMonotonic,
    /// The time deltas vary too little.
    MinVariation,
    /// The second derivative of time is identically zero.
    NoSecondDerivative,
    /// The second derivative of time varies too little.
    MinSecondDerivative,
    /// Caller error: conflicting options or an operation out of sequence.
    Usage,
    /// Too many stuck measurements during warm-up.
    Stuck,
    /// A health test tripped during warm-up.
    Health,
    /// The repetition count test tripped during warm-up.
    RepetitionCount,
    /// The hash known-answer test failed.
    HashSelfTest,
    /// Workload memory could not be allocated.
    Memory,
    /// The common divisor of the time deltas could not be established.
    Gcd,
}

impl InitError {
    /// Stable positive error code for this failure.
    pub fn code(&self) -> u32 {
        match self {
            Self::NoTimer => 1,
            Self::CoarseTimer => 2,
            Self::NonMonotonic => 3,
            Self::MinVariation => 4,
            Self::NoSecondDerivative => 5,
            Self::MinSecondDerivative => 6,
            Self::Usage => 7,
            Self::Stuck => 8,
            Self::Health => 9,
            Self::RepetitionCount => 10,
            Self::HashSelfTest => 11,
            Self::Memory => 12,
            Self::Gcd => 13,
        }
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTimer => write!(f, "no timer service available"),
            Self::CoarseTimer => write!(f, "timer too coarse for entropy collection"),
            Self::NonMonotonic => write!(f, "timer is not monotonically increasing"),
            Self::MinVariation => write!(f, "timer variations too small"),
            Self::NoSecondDerivative => write!(f, "second derivative of time is zero"),
            Self::MinSecondDerivative => write!(f, "second derivative of time varies too little"),
            Self::Usage => write!(f, "programming error"),
            Self::Stuck => write!(f, "too many stuck measurements during startup"),
            Self::Health => write!(f, "health test failed during startup"),
            Self::RepetitionCount => write!(f, "repetition count test failed during startup"),
            Self::HashSelfTest => write!(f, "hash self-test failed"),
            Self::Memory => write!(f, "cannot allocate workload memory"),
            Self::Gcd => write!(f, "timer delta divisor self-test failed"),
        }
    }
}

impl std::error::Error for InitError {}

/// Sticky bitmask of tripped health tests.
///
/// Once a bit is set on a collector it is never cleared; the collector must
/// be discarded or rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthFailure(u32);

impl HealthFailure {
    pub const NONE: HealthFailure = HealthFailure(0);
    /// Repetition count test failure.
    pub const RCT: HealthFailure = HealthFailure(1);
    /// Adaptive proportion test failure.
    pub const APT: HealthFailure = HealthFailure(2);
    /// Lag predictor failure.
    pub const LAG: HealthFailure = HealthFailure(4);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: HealthFailure) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn set(&mut self, other: HealthFailure) {
        self.0 |= other.0;
    }
}

impl BitOr for HealthFailure {
    type Output = HealthFailure;

    fn bitor(self, rhs: HealthFailure) -> HealthFailure {
        HealthFailure(self.0 | rhs.0)
    }
}

impl BitOrAssign for HealthFailure {
    fn bitor_assign(&mut self, rhs: HealthFailure) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for HealthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for (bit, name) in [(Self::RCT, "rct"), (Self::APT, "apt"), (Self::LAG, "lag")] {
            if self.contains(bit) {
                if !first {
                    write!(f, "+")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Errors from [`EntropyCollector::read`](crate::EntropyCollector::read).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// One or more health tests latched a permanent failure.
    Health(HealthFailure),
    /// Caller error: empty output buffer.
    InvalidRequest,
    /// The software timer thread could not be started.
    TimerThread,
}

impl ReadError {
    /// C-style negative encoding: the magnitude of a health failure is the
    /// failure bitmask.
    pub fn code(&self) -> i64 {
        match self {
            Self::Health(failure) => -(failure.bits() as i64),
            Self::InvalidRequest => -(InitError::Usage.code() as i64),
            Self::TimerThread => -(InitError::NoTimer.code() as i64),
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Health(failure) => write!(f, "permanent health failure: {failure}"),
            Self::InvalidRequest => write!(f, "empty output buffer"),
            Self::TimerThread => write!(f, "software timer thread failed to start"),
        }
    }
}

impl std::error::Error for ReadError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_error_codes_are_stable() {
        assert_eq!(InitError::NoTimer.code(), 1);
        assert_eq!(InitError::CoarseTimer.code(), 2);
        assert_eq!(InitError::Usage.code(), 7);
        assert_eq!(InitError::Gcd.code(), 13);
    }

    #[test]
    fn health_failure_mask_combines() {
        let mut failure = HealthFailure::NONE;
        assert!(failure.is_empty());
        failure.set(HealthFailure::RCT);
        failure.set(HealthFailure::LAG);
        assert_eq!(failure.bits(), 5);
        assert!(failure.contains(HealthFailure::RCT));
        assert!(!failure.contains(HealthFailure::APT));
        assert_eq!(failure.to_string(), "rct+lag");
    }

    #[test]
    fn read_error_encodes_failure_mask() {
        let failure = HealthFailure::RCT | HealthFailure::APT;
        assert_eq!(ReadError::Health(failure).code(), -3);
        assert_eq!(ReadError::InvalidRequest.code(), -7);
    }
}
