//! Clock synchronization estimator
//!
//! Closed-loop estimate of the offset that must be added to server time so
//! that, once transmitted and applied on the device, the device clock
//! matches the server clock.
//!
//! Each trial sends `server_now + offset` and asks the device to echo its
//! clock right away. The device is assumed to apply the time halfway
//! through the round trip, less a fixed processing delay:
//!
//! ```text
//! round_trip          = time_end - time_start
//! estimated_write     = (round_trip - device_delay) / 2
//! difference          = time_end - device_time - estimated_write
//! ```
//!
//! `difference` is folded into the offset after every trial except the
//! last, where the offset becomes the mean of the offsets used by the last
//! K trials and is written once more. The residual of the last measured
//! trial is the reported accuracy; the reply to the final write only ends
//! the exchange. The midpoint assumption is a heuristic, not a guaranteed
//! bound.

use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSyncParams {
    /// Number of measured trials (N)
    pub trials: usize,
    /// Seed offset for trial 0 in ms
    pub start_offset_ms: f64,
    /// Trials averaged into the final offset (K)
    pub trial_average: usize,
    /// Device time to process the write and prepare its reply, in ms
    pub device_delay_ms: f64,
}

impl Default for ClockSyncParams {
    fn default() -> Self {
        Self {
            trials: 15,
            start_offset_ms: 100.0,
            trial_average: 5,
            device_delay_ms: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialRecord {
    pub trial: usize,
    pub offset_ms: f64,
    pub device_time_ms: f64,
    pub round_trip_ms: f64,
    pub difference_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockSyncResult {
    /// Converged offset applied by the final write
    pub offset_ms: f64,
    /// Residual of the last measured trial
    pub accuracy_ms: f64,
    /// One record per measured trial
    pub trials: Vec<TrialRecord>,
}

/// Residual of one round trip.
///
/// Returns `(round_trip, difference)` in ms.
pub fn round_trip_residual(
    time_start_ms: f64,
    time_end_ms: f64,
    device_time_ms: f64,
    device_delay_ms: f64,
) -> (f64, f64) {
    let round_trip = time_end_ms - time_start_ms;
    let estimated_write = (round_trip - device_delay_ms) / 2.0;
    (round_trip, time_end_ms - device_time_ms - estimated_write)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Measuring trial `n`
    Trial(usize),
    /// Waiting for the echo of the converged offset; not measured
    Verify,
    Finished,
}

#[derive(Debug, Clone)]
pub struct ClockSyncEstimator {
    params: ClockSyncParams,
    offset_ms: f64,
    time_start_ms: Option<f64>,
    phase: SyncPhase,
    records: Vec<TrialRecord>,
}

impl ClockSyncEstimator {
    pub fn new(params: ClockSyncParams) -> Self {
        Self {
            offset_ms: params.start_offset_ms,
            params: ClockSyncParams {
                trials: params.trials.max(1),
                ..params
            },
            time_start_ms: None,
            phase: SyncPhase::Trial(0),
            records: Vec::new(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn offset_ms(&self) -> f64 {
        self.offset_ms
    }

    /// Start a write at server time `now_ms`.
    ///
    /// Returns the device time to transmit, in ms.
    pub fn begin(&mut self, now_ms: f64) -> f64 {
        self.time_start_ms = Some(now_ms);
        now_ms + self.offset_ms
    }

    /// Record the device's echoed clock, received at server time `now_ms`.
    ///
    /// Returns the phase that follows, or `None` when no write is
    /// outstanding.
    pub fn record_reply(&mut self, now_ms: f64, device_time_ms: f64) -> Option<SyncPhase> {
        let time_start = self.time_start_ms.take()?;
        let (round_trip, difference) = round_trip_residual(
            time_start,
            now_ms,
            device_time_ms,
            self.params.device_delay_ms,
        );

        let trial = match self.phase {
            SyncPhase::Trial(n) => n,
            SyncPhase::Verify => {
                debug!(residual_ms = difference, "Converged offset echoed");
                self.phase = SyncPhase::Finished;
                return Some(self.phase);
            }
            SyncPhase::Finished => return None,
        };
        let record = TrialRecord {
            trial,
            offset_ms: self.offset_ms,
            device_time_ms,
            round_trip_ms: round_trip,
            difference_ms: difference,
        };
        self.records.push(record);

        self.phase = match self.phase {
            SyncPhase::Trial(n) if n + 1 < self.params.trials => {
                self.offset_ms += difference;
                SyncPhase::Trial(n + 1)
            }
            _ => {
                self.offset_ms = self.average_of_last_trials();
                SyncPhase::Verify
            }
        };
        Some(self.phase)
    }

    fn average_of_last_trials(&self) -> f64 {
        let k = self.params.trial_average.clamp(1, self.records.len().max(1));
        let tail = &self.records[self.records.len().saturating_sub(k)..];
        if tail.is_empty() {
            return self.offset_ms;
        }
        tail.iter().map(|r| r.offset_ms).sum::<f64>() / tail.len() as f64
    }

    /// Final offset and accuracy, once the final write has been echoed.
    pub fn result(&self) -> Option<ClockSyncResult> {
        if self.phase != SyncPhase::Finished {
            return None;
        }
        let accuracy_ms = self.records.last().map(|r| r.difference_ms)?;
        Some(ClockSyncResult {
            offset_ms: self.offset_ms,
            accuracy_ms,
            trials: self.records.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Device that applies the transmitted time after `latency` ms and
    /// echoes it immediately; the echo takes `latency` ms back.
    fn simulate(params: ClockSyncParams, latency: f64, start: f64) -> ClockSyncResult {
        let mut estimator = ClockSyncEstimator::new(params);
        let mut now = start;
        while estimator.phase() != SyncPhase::Finished {
            let sent = estimator.begin(now);
            now += 2.0 * latency;
            estimator.record_reply(now, sent).unwrap();
            now += 3.0;
        }
        estimator.result().unwrap()
    }

    #[test]
    fn test_converges_to_fixed_latency() {
        let params = ClockSyncParams::default();
        let result = simulate(params, 40.0, 1_717_236_000_000.0);

        // Converged offset: latency plus half the assumed processing delay
        let expected = 40.0 + params.device_delay_ms / 2.0;
        assert!((result.offset_ms - expected).abs() < 1e-3);
        assert!(result.accuracy_ms.abs() < 1e-3);
        assert_eq!(result.trials.len(), params.trials);
    }

    #[test]
    fn test_first_trial_uses_seed_offset() {
        let result = simulate(ClockSyncParams::default(), 25.0, 0.0);
        assert_eq!(result.trials[0].offset_ms, 100.0);
        assert_eq!(result.trials[0].round_trip_ms, 50.0);
        // 50 - 100 - (50 - 5) / 2
        assert_eq!(result.trials[0].difference_ms, -72.5);
        assert_eq!(result.trials[1].offset_ms, 27.5);
    }

    #[test]
    fn test_final_offset_is_mean_of_last_k_trials() {
        let params = ClockSyncParams {
            trials: 4,
            start_offset_ms: 0.0,
            trial_average: 2,
            device_delay_ms: 0.0,
        };
        let mut estimator = ClockSyncEstimator::new(params);

        // Replies chosen so each trial leaves a residual of +10 ms
        for _ in 0..4 {
            estimator.begin(1000.0);
            estimator.record_reply(1000.0, 990.0).unwrap();
        }
        assert_eq!(estimator.phase(), SyncPhase::Verify);
        // Offsets used: 0, 10, 20, 30 → mean of last two
        assert_eq!(estimator.offset_ms(), 25.0);

        let sent = estimator.begin(2000.0);
        estimator.record_reply(2000.0, sent).unwrap();
        let result = estimator.result().unwrap();
        assert_eq!(result.offset_ms, 25.0);
        assert_eq!(result.trials.len(), 4);
        assert_eq!(result.trials.last().unwrap().trial, 3);
    }

    #[test]
    fn test_accuracy_is_last_trial_residual() {
        let params = ClockSyncParams {
            trials: 3,
            start_offset_ms: 0.0,
            trial_average: 2,
            device_delay_ms: 0.0,
        };
        let mut estimator = ClockSyncEstimator::new(params);

        // Device clock lags a further 7 ms on every write
        let mut lag = 0.0;
        while estimator.phase() != SyncPhase::Finished {
            lag += 7.0;
            let sent = estimator.begin(1000.0);
            estimator.record_reply(1000.0, sent - lag).unwrap();
        }
        let result = estimator.result().unwrap();
        // Offsets used: 0, 7, 14 → mean of last two
        assert_eq!(result.offset_ms, 10.5);
        assert_eq!(result.trials.len(), 3);
        // The final write would leave 28 - 10.5 but is not measured
        assert_eq!(result.accuracy_ms, 7.0);
    }

    #[test]
    fn test_zero_trials_still_measures_once() {
        let params = ClockSyncParams {
            trials: 0,
            ..ClockSyncParams::default()
        };
        let result = simulate(params, 10.0, 0.0);
        assert_eq!(result.trials.len(), 1);
        assert_eq!(result.offset_ms, params.start_offset_ms);
    }

    #[test]
    fn test_trial_log_rederives_final_offset() {
        let params = ClockSyncParams::default();
        let result = simulate(params, 17.0, 5_000.0);
        let tail = &result.trials[result.trials.len() - params.trial_average..];
        let mean = tail.iter().map(|r| r.offset_ms).sum::<f64>() / tail.len() as f64;
        assert_eq!(mean, result.offset_ms);
    }

    #[test]
    fn test_reply_without_write_is_ignored() {
        let mut estimator = ClockSyncEstimator::new(ClockSyncParams::default());
        assert!(estimator.record_reply(10.0, 10.0).is_none());
        assert!(estimator.result().is_none());
    }
}
