use serde::{Deserialize, Serialize};

use crate::error::{StatsError, StatsResult};
use crate::params::LOAD_DURATION_SEC;
use crate::table::RawSample;

pub const DEFAULT_CUT_START_PERCENT: u32 = 30;
pub const DEFAULT_CUT_END_PERCENT: u32 = 20;

/// Trims the warm-up and cool-down portions of a load run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub cut_start_percent: u32,
    pub cut_end_percent: u32,
    /// Timestamp ticks per second in the sample tables (1000 for millisecond stamps).
    pub ticks_per_second: u32,
}

impl WindowConfig {
    pub const fn new(ticks_per_second: u32) -> Self {
        Self {
            cut_start_percent: DEFAULT_CUT_START_PERCENT,
            cut_end_percent: DEFAULT_CUT_END_PERCENT,
            ticks_per_second,
        }
    }

    pub fn validate(&self) -> StatsResult<()> {
        if self.cut_start_percent + self.cut_end_percent >= 100 {
            return Err(StatsError::Config(format!(
                "cut percentages {}% + {}% leave no window",
                self.cut_start_percent, self.cut_end_percent
            )));
        }
        if self.ticks_per_second == 0 {
            return Err(StatsError::Config("ticks_per_second must be positive".into()));
        }
        Ok(())
    }

    /// Window anchored at the earliest timestamp of the experiment.
    ///
    /// Offsets are whole seconds, floored, then scaled to timestamp ticks.
    pub fn window(&self, first: f64, duration_sec: i64) -> StatsResult<TimeWindow> {
        let offset = |percent: i64| {
            duration_sec
                .checked_mul(percent)
                .map(|n| n / 100)
                .ok_or_else(|| StatsError::InvalidParameterValue {
                    name: LOAD_DURATION_SEC.to_string(),
                    value: duration_sec.to_string(),
                })
        };
        let start_sec = offset(i64::from(self.cut_start_percent))?;
        let end_sec = offset(100 - i64::from(self.cut_end_percent))?;
        let scale = f64::from(self.ticks_per_second);
        Ok(TimeWindow {
            start: first + start_sec as f64 * scale,
            end: first + end_sec as f64 * scale,
        })
    }
}

/// Inclusive `[start, end]` range of timestamps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

impl TimeWindow {
    pub fn contains(&self, ts: f64) -> bool {
        self.start <= ts && ts <= self.end
    }

    pub fn retain(&self, samples: Vec<RawSample>, column: &str) -> StatsResult<Vec<RawSample>> {
        let mut kept = Vec::with_capacity(samples.len());
        for sample in samples {
            if self.contains(sample_timestamp(&sample, column)?) {
                kept.push(sample);
            }
        }
        Ok(kept)
    }
}

pub fn sample_timestamp(sample: &RawSample, column: &str) -> StatsResult<f64> {
    let raw = sample.get(column).ok_or_else(|| StatsError::MissingColumn {
        column: column.to_string(),
        row: sample.line(),
    })?;
    raw.trim().parse::<f64>().map_err(|_| StatsError::InvalidValue {
        column: column.to_string(),
        value: raw.to_string(),
    })
}

/// Earliest timestamp across every participant, or `None` if all are empty.
pub fn first_timestamp(participants: &[Vec<RawSample>], column: &str) -> StatsResult<Option<f64>> {
    let mut first: Option<f64> = None;
    for sample in participants.iter().flatten() {
        let ts = sample_timestamp(sample, column)?;
        first = Some(first.map_or(ts, |f| f.min(ts)));
    }
    Ok(first)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    /// The harness canary transaction has been seen.
    ObservedFirst,
    LoadActive,
}

/// Skips samples recorded before the load generator started.
///
/// The harness submits a single canary transaction before the real load, so a
/// replica first reports exactly `canary_count` received transactions, then
/// idles, and the load begins with the next sample that differs from `idle_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadStartDetector {
    pub column: String,
    pub canary_count: i64,
    pub idle_count: i64,
}

impl Default for LoadStartDetector {
    fn default() -> Self {
        Self {
            column: "nrReceived".to_string(),
            canary_count: 1,
            idle_count: 0,
        }
    }
}

impl LoadStartDetector {
    pub fn step(&self, state: LoadState, received: i64) -> LoadState {
        match state {
            LoadState::Idle if received == self.canary_count => LoadState::ObservedFirst,
            LoadState::ObservedFirst if received != self.idle_count => LoadState::LoadActive,
            other => other,
        }
    }

    /// Keeps the samples from the first load-active one onwards.
    pub fn filter(&self, samples: Vec<RawSample>) -> StatsResult<Vec<RawSample>> {
        let mut state = LoadState::Idle;
        let mut active = Vec::new();
        for sample in samples {
            if state != LoadState::LoadActive {
                state = self.step(state, self.received(&sample)?);
            }
            if state == LoadState::LoadActive {
                active.push(sample);
            }
        }
        Ok(active)
    }

    fn received(&self, sample: &RawSample) -> StatsResult<i64> {
        let raw = sample.get(&self.column).ok_or_else(|| StatsError::MissingColumn {
            column: self.column.clone(),
            row: sample.line(),
        })?;
        raw.trim().parse::<i64>().map_err(|_| StatsError::InvalidValue {
            column: self.column.clone(),
            value: raw.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(line: usize, ts: &str, received: &str) -> RawSample {
        RawSample::from_pairs(line, [("ts", ts), ("nrReceived", received)])
    }

    #[test]
    fn default_window_cuts_thirty_and_twenty_percent() {
        let w = WindowConfig::new(1).window(1000.0, 120).expect("window");
        assert_eq!(w, TimeWindow { start: 1036.0, end: 1096.0 });
        assert!(w.contains(1036.0));
        assert!(w.contains(1096.0));
        assert!(!w.contains(1035.999));
        assert!(!w.contains(1096.001));
    }

    #[test]
    fn window_floors_whole_seconds_before_scaling() {
        let w = WindowConfig::new(1000).window(5_000.0, 125).expect("window");
        // 125 * 30 / 100 = 37 and 125 * 80 / 100 = 100 in whole seconds.
        assert_eq!(w.start, 5_000.0 + 37_000.0);
        assert_eq!(w.end, 5_000.0 + 100_000.0);
    }

    #[test]
    fn window_rejects_duration_that_overflows() {
        let err = WindowConfig::new(1000)
            .window(0.0, i64::MAX)
            .expect_err("overflow");
        match err {
            StatsError::InvalidParameterValue { name, value } => {
                assert_eq!(name, "load_duration_sec");
                assert_eq!(value, i64::MAX.to_string());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn window_config_rejects_empty_window() {
        let mut cfg = WindowConfig::new(1);
        assert!(cfg.validate().is_ok());
        cfg.cut_start_percent = 60;
        cfg.cut_end_percent = 40;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retain_keeps_inclusive_bounds() {
        let w = TimeWindow { start: 10.0, end: 20.0 };
        let kept = w
            .retain(
                vec![at(2, "9", "0"), at(3, "10", "0"), at(4, "20", "0"), at(5, "21", "0")],
                "ts",
            )
            .expect("retain");
        let stamps: Vec<_> = kept.iter().map(|s| s.get("ts").unwrap_or_default()).collect();
        assert_eq!(stamps, vec!["10", "20"]);
    }

    #[test]
    fn first_timestamp_spans_all_participants() {
        let participants = vec![
            vec![at(2, "1500", "0"), at(3, "2500", "0")],
            vec![],
            vec![at(2, "1200", "0")],
        ];
        assert_eq!(
            first_timestamp(&participants, "ts").expect("first"),
            Some(1200.0)
        );
        assert_eq!(first_timestamp(&[vec![], vec![]], "ts").expect("first"), None);
    }

    #[test]
    fn timestamp_errors_are_typed() {
        let err = sample_timestamp(&RawSample::new(4), "ts").expect_err("missing");
        assert!(matches!(err, StatsError::MissingColumn { row: 4, .. }));
        let err = sample_timestamp(&at(2, "soon", "0"), "ts").expect_err("invalid");
        assert!(matches!(err, StatsError::InvalidValue { .. }));
    }

    #[test]
    fn detector_waits_for_canary_then_load() {
        let d = LoadStartDetector::default();
        assert_eq!(d.step(LoadState::Idle, 0), LoadState::Idle);
        assert_eq!(d.step(LoadState::Idle, 5), LoadState::Idle);
        assert_eq!(d.step(LoadState::Idle, 1), LoadState::ObservedFirst);
        assert_eq!(d.step(LoadState::ObservedFirst, 0), LoadState::ObservedFirst);
        assert_eq!(d.step(LoadState::ObservedFirst, 40), LoadState::LoadActive);
        assert_eq!(d.step(LoadState::LoadActive, 0), LoadState::LoadActive);
    }

    #[test]
    fn detector_yields_from_first_load_sample() {
        let samples = vec![
            at(2, "1", "0"),
            at(3, "2", "1"),
            at(4, "3", "0"),
            at(5, "4", "120"),
            at(6, "5", "0"),
            at(7, "6", "130"),
        ];
        let active = LoadStartDetector::default().filter(samples).expect("filter");
        let lines: Vec<_> = active.iter().map(RawSample::line).collect();
        assert_eq!(lines, vec![5, 6, 7]);
    }

    #[test]
    fn canary_sample_cannot_also_start_load() {
        let samples = vec![at(2, "1", "1"), at(3, "2", "1")];
        let active = LoadStartDetector::default().filter(samples).expect("filter");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].line(), 3);
    }

    #[test]
    fn detector_without_canary_yields_nothing() {
        let samples = vec![at(2, "1", "0"), at(3, "2", "50")];
        let active = LoadStartDetector::default().filter(samples).expect("filter");
        assert!(active.is_empty());
    }

    #[test]
    fn detector_thresholds_are_configurable() {
        let d = LoadStartDetector {
            column: "received".into(),
            canary_count: 2,
            idle_count: 2,
        };
        let samples = vec![
            RawSample::from_pairs(2, [("received", "2")]),
            RawSample::from_pairs(3, [("received", "2")]),
            RawSample::from_pairs(4, [("received", "9")]),
        ];
        let active = d.filter(samples).expect("filter");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].line(), 4);
    }
}
