//! Lag predictor health test.
//!
//! Detects short-range periodicity by trying to predict each delta from a
//! small history. Eight predictors compete, one per lag; a scoreboard tracks
//! which lag predicts best, and only the reigning best predictor's hits
//! count against the cutoffs.

use crate::error::HealthFailure;

/// Observations per window; all predictor state resets between windows.
pub(crate) const LAG_WINDOW_SIZE: u32 = 1 << 17;
/// History depth, one predictor per lag. Power of two.
pub(crate) const LAG_HISTORY_SIZE: usize = 8;
const LAG_MASK: u32 = LAG_HISTORY_SIZE as u32 - 1;

/// Cutoffs targeting a false-positive rate of 2^-30 per window under the
/// assumption of H = 1/osr bits of min-entropy per sample, i.e. a per-sample
/// prediction probability of p = 2^(-1/osr).
///
/// Global: normal-approximation upper quantile of Binomial(2^17, p), with
/// the significance budget split across the eight competing predictors.
/// Local: the shortest success run whose probability, summed over all window
/// positions and predictors, stays below the same budget.
fn cutoffs(osr: u32) -> (u32, u32) {
    let osr = f64::from(osr.max(1));
    let n = f64::from(LAG_WINDOW_SIZE);
    let p = 2f64.powf(-1.0 / osr);
    // Upper-tail standard normal quantile at 2^-30 / 8.
    let z = 6.33;
    let global = (n * p + z * (n * p * (1.0 - p)).sqrt()).ceil() + 1.0;
    let global = if global >= n {
        LAG_WINDOW_SIZE
    } else {
        global as u32
    };
    let local = (osr * (30.0 + (8.0 * n).log2())).ceil() as u32;
    (global, local)
}

pub(crate) struct LagPredictor {
    /// Circular history of recent deltas.
    delta_history: [u64; LAG_HISTORY_SIZE],
    /// Hit count per lag since the last window reset.
    scoreboard: [u32; LAG_HISTORY_SIZE],
    global_cutoff: u32,
    local_cutoff: u32,
    /// Hits of the best predictor in this window.
    success_count: u32,
    /// Current run of consecutive hits of the best predictor.
    success_run: u32,
    /// Cache of the scoreboard argmax.
    best_predictor: usize,
    /// Observations since the last window reset.
    observations: u32,
}

impl LagPredictor {
    pub(crate) fn new(osr: u32) -> Self {
        let (global_cutoff, local_cutoff) = cutoffs(osr);
        Self {
            delta_history: [0; LAG_HISTORY_SIZE],
            scoreboard: [0; LAG_HISTORY_SIZE],
            global_cutoff,
            local_cutoff,
            success_count: 0,
            success_run: 0,
            best_predictor: 0,
            observations: 0,
        }
    }

    pub(crate) fn insert(&mut self, delta: u64, failure: &mut HealthFailure) {
        // Fill the history before predicting anything.
        if (self.observations as usize) < LAG_HISTORY_SIZE {
            self.delta_history[self.observations as usize] = delta;
            self.observations += 1;
            return;
        }

        let prediction = self.recent(self.best_predictor as u32);
        if prediction == delta {
            self.success_count += 1;
            self.success_run += 1;
            if self.success_run >= self.local_cutoff || self.success_count >= self.global_cutoff {
                failure.set(HealthFailure::LAG);
            }
        } else {
            self.success_run = 0;
        }

        for lag in 0..LAG_HISTORY_SIZE {
            if self.recent(lag as u32) == delta {
                self.scoreboard[lag] += 1;
                if self.scoreboard[lag] > self.scoreboard[self.best_predictor] {
                    self.best_predictor = lag;
                }
            }
        }

        self.delta_history[(self.observations & LAG_MASK) as usize] = delta;
        self.observations += 1;
        if self.observations >= LAG_WINDOW_SIZE {
            self.reset_window();
        }
    }

    /// Delta `back` samples before the current one (0 = most recent).
    fn recent(&self, back: u32) -> u64 {
        self.delta_history[(self.observations.wrapping_sub(1 + back) & LAG_MASK) as usize]
    }

    fn reset_window(&mut self) {
        self.scoreboard = [0; LAG_HISTORY_SIZE];
        self.success_count = 0;
        self.success_run = 0;
        self.best_predictor = 0;
        self.observations = 0;
    }

    pub(crate) fn observations(&self) -> u32 {
        self.observations
    }

    #[cfg(test)]
    fn local_cutoff(&self) -> u32 {
        self.local_cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoffs_scale_with_oversampling_rate() {
        let (g1, l1) = cutoffs(1);
        let (g3, l3) = cutoffs(3);
        assert!(g1 > LAG_WINDOW_SIZE / 2, "global cutoff below the mean");
        assert!(g1 < LAG_WINDOW_SIZE);
        assert!(g3 > g1);
        assert_eq!(l1, 50);
        assert!(l3 > l1);
    }

    #[test]
    fn period_two_stream_trips_local_cutoff() {
        let mut lag = LagPredictor::new(1);
        let mut failure = HealthFailure::NONE;
        let limit = lag.local_cutoff() as usize + LAG_HISTORY_SIZE + 10;
        for i in 0..limit {
            let delta = if i % 2 == 0 { 5 } else { 10 };
            lag.insert(delta, &mut failure);
        }
        assert!(failure.contains(HealthFailure::LAG));
    }

    #[test]
    fn distinct_stream_never_trips() {
        let mut lag = LagPredictor::new(1);
        let mut failure = HealthFailure::NONE;
        for i in 0u64..10_000 {
            lag.insert(i.wrapping_mul(0x9e3779b97f4a7c15), &mut failure);
        }
        assert!(failure.is_empty());
        assert_eq!(lag.success_count, 0);
    }

    #[test]
    fn window_boundary_resets_all_predictor_state() {
        let mut lag = LagPredictor::new(1);
        let mut failure = HealthFailure::NONE;
        for i in 0..LAG_WINDOW_SIZE {
            lag.insert(u64::from(i).wrapping_mul(0x2545f4914f6cdd1d), &mut failure);
        }
        assert_eq!(lag.observations(), 0);
        assert_eq!(lag.scoreboard, [0; LAG_HISTORY_SIZE]);
        assert_eq!(lag.success_count, 0);
        assert_eq!(lag.success_run, 0);
        assert_eq!(lag.best_predictor, 0);
    }

    #[test]
    fn scoreboard_tracks_the_winning_lag() {
        let mut lag = LagPredictor::new(1);
        let mut failure = HealthFailure::NONE;
        // Period 3: the lag-2 predictor (three samples back) is the winner.
        for i in 0..60 {
            lag.insert([7, 21, 35][i % 3], &mut failure);
        }
        assert_eq!(lag.best_predictor, 2);
    }
}
