//! Stateless analysis of a power series: hysteresis cycles, rolling instability, fluctuation
//! episodes and single-sample jumps.
//!
//! Callers pass series with non-decreasing timestamps and finite values (see
//! [`crate::types::clean_series`]).

use crate::config::SignalConfig;
use crate::rolling::{align_down, mean, sample_std, spread};
use crate::types::PowerSample;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

const WEIGHT_STD: f64 = 0.4;
const WEIGHT_AMPLITUDE: f64 = 0.4;
const WEIGHT_DIRECTION: f64 = 0.2;
const NEAR_ZERO_MEAN: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleEvent {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: f64,
    pub peak_power: f64,
    pub avg_power: f64,
}

impl CycleEvent {
    pub fn is_short(&self, threshold_minutes: f64) -> bool {
        self.duration_minutes < threshold_minutes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluctuationEvent {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: f64,
    pub instability_score: f64,
    pub amplitude_watts: f64,
    /// Direction changes per minute of the episode.
    pub frequency: f64,
    pub avg_power: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerJump {
    pub timestamp: DateTime<Utc>,
    pub delta_watts: f64,
    pub power_before: f64,
    pub power_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CyclingReport {
    pub total_cycles: usize,
    pub short_cycle_count: usize,
    pub short_cycle_ratio: f64,
    pub avg_cycle_minutes: Option<f64>,
    pub cycles_per_hour: f64,
    pub avg_instability: f64,
    pub max_instability: f64,
    pub fluctuation_count: usize,
    pub jump_count: usize,
    pub time_span_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CyclingPeriod {
    pub bucket_start: DateTime<Utc>,
    pub cycles_per_hour: f64,
    pub is_problematic: bool,
}

fn hysteresis_states(series: &[PowerSample], on_threshold: f64, off_threshold: f64) -> Vec<bool> {
    let Some(first) = series.first() else {
        return Vec::new();
    };
    let mut on = first.watts >= on_threshold;
    series
        .iter()
        .map(|sample| {
            if on {
                if sample.watts < off_threshold {
                    on = false;
                }
            } else if sample.watts > on_threshold {
                on = true;
            }
            on
        })
        .collect()
}

/// Complete on-intervals found by a two-threshold state machine. A cycle opens on an OFF to ON
/// transition and closes on the next ON to OFF transition; a trailing or leading partial
/// on-interval is not reported.
pub fn detect_cycles(
    series: &[PowerSample],
    on_threshold: f64,
    off_threshold: f64,
) -> Vec<CycleEvent> {
    if series.len() < 2 {
        return Vec::new();
    }
    let states = hysteresis_states(series, on_threshold, off_threshold);
    let mut cycles = Vec::new();
    let mut open: Option<usize> = None;

    for i in 1..series.len() {
        match (states[i - 1], states[i]) {
            (false, true) => open = Some(i),
            (true, false) => {
                if let Some(start) = open.take() {
                    let start_time = series[start].timestamp;
                    let end_time = series[i].timestamp;
                    if end_time <= start_time {
                        continue;
                    }
                    let span: Vec<f64> = series[start..=i].iter().map(|s| s.watts).collect();
                    cycles.push(CycleEvent {
                        start_time,
                        end_time,
                        duration_minutes: minutes_between(start_time, end_time),
                        peak_power: span.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                        avg_power: mean(&span).unwrap_or(0.0),
                    });
                }
            }
            _ => {}
        }
    }
    cycles
}

/// Number of OFF to ON transitions, including ones whose cycle never closes.
pub fn count_cycle_starts(series: &[PowerSample], on_threshold: f64, off_threshold: f64) -> usize {
    hysteresis_states(series, on_threshold, off_threshold)
        .windows(2)
        .filter(|pair| !pair[0] && pair[1])
        .count()
}

fn direction_flips(values: &[f64]) -> usize {
    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    diffs
        .windows(2)
        .filter(|d| d[0] * d[1] < 0.0)
        .count()
}

fn window_score(values: &[f64]) -> f64 {
    let Some(avg) = mean(values) else {
        return 0.0;
    };
    if avg.abs() < NEAR_ZERO_MEAN {
        return 0.0;
    }
    let std_ratio = (sample_std(values) / avg).max(0.0);
    let amplitude_ratio = (spread(values) / avg).max(0.0);
    let direction = if values.len() > 2 {
        direction_flips(values) as f64 / (values.len() - 2) as f64
    } else {
        0.0
    };
    (WEIGHT_STD * std_ratio + WEIGHT_AMPLITUDE * amplitude_ratio + WEIGHT_DIRECTION * direction)
        .clamp(0.0, 1.0)
}

/// Score in [0, 1] for every sample, computed over the trailing `window` samples.
pub fn instability_scores(series: &[PowerSample], window: usize) -> Vec<f64> {
    let window = window.max(2);
    let values: Vec<f64> = series.iter().map(|s| s.watts).collect();
    (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            window_score(&values[start..=i])
        })
        .collect()
}

/// Maximal runs with score above `threshold` while the compressor is running.
pub fn detect_fluctuations(
    series: &[PowerSample],
    window: usize,
    threshold: f64,
    on_threshold: f64,
) -> Vec<FluctuationEvent> {
    let scores = instability_scores(series, window);
    let mut events = Vec::new();
    let mut run_start: Option<usize> = None;

    for i in 0..=scores.len() {
        let unstable = i < scores.len() && scores[i] > threshold;
        match (run_start, unstable) {
            (None, true) => run_start = Some(i),
            (Some(start), false) => {
                if let Some(event) = fluctuation_event(&series[start..i], &scores[start..i], on_threshold) {
                    events.push(event);
                }
                run_start = None;
            }
            _ => {}
        }
    }
    events
}

fn fluctuation_event(
    run: &[PowerSample],
    scores: &[f64],
    on_threshold: f64,
) -> Option<FluctuationEvent> {
    if run.len() < 2 {
        return None;
    }
    let values: Vec<f64> = run.iter().map(|s| s.watts).collect();
    let peak = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if peak <= on_threshold {
        return None;
    }
    let start_time = run[0].timestamp;
    let end_time = run[run.len() - 1].timestamp;
    let duration_minutes = minutes_between(start_time, end_time);
    let per_minute = if duration_minutes > 0.0 { duration_minutes } else { 1.0 };
    Some(FluctuationEvent {
        start_time,
        end_time,
        duration_minutes,
        instability_score: mean(scores).unwrap_or(0.0),
        amplitude_watts: spread(&values),
        frequency: direction_flips(&values) as f64 / per_minute,
        avg_power: mean(&values).unwrap_or(0.0),
    })
}

/// Every adjacent pair whose change meets the absolute threshold or, when the earlier value is
/// positive, the relative threshold in percent.
pub fn detect_power_jumps(
    series: &[PowerSample],
    abs_threshold: f64,
    rel_threshold_pct: f64,
) -> Vec<PowerJump> {
    series
        .windows(2)
        .filter_map(|pair| {
            let before = pair[0].watts;
            let after = pair[1].watts;
            let delta = after - before;
            let abs_jump = delta.abs() >= abs_threshold;
            let rel_jump = before > 0.0 && delta.abs() / before * 100.0 >= rel_threshold_pct;
            (abs_jump || rel_jump).then_some(PowerJump {
                timestamp: pair[1].timestamp,
                delta_watts: delta,
                power_before: before,
                power_after: after,
            })
        })
        .collect()
}

fn minutes_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 60_000.0
}

/// Thresholded wrapper around the free functions.
#[derive(Debug, Clone, Default)]
pub struct CycleAnalyzer {
    config: SignalConfig,
}

impl CycleAnalyzer {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    pub fn detect_cycles(&self, series: &[PowerSample]) -> Vec<CycleEvent> {
        detect_cycles(
            series,
            self.config.power_on_threshold,
            self.config.power_off_threshold,
        )
    }

    pub fn instability_scores(&self, series: &[PowerSample]) -> Vec<f64> {
        instability_scores(series, self.config.window_samples)
    }

    pub fn detect_fluctuations(&self, series: &[PowerSample]) -> Vec<FluctuationEvent> {
        detect_fluctuations(
            series,
            self.config.window_samples,
            self.config.instability_threshold,
            self.config.power_on_threshold,
        )
    }

    pub fn detect_power_jumps(&self, series: &[PowerSample]) -> Vec<PowerJump> {
        detect_power_jumps(
            series,
            self.config.jump_threshold_watts,
            self.config.jump_threshold_pct,
        )
    }

    pub fn analyze_cycling(&self, series: &[PowerSample]) -> CyclingReport {
        if series.is_empty() {
            return CyclingReport::default();
        }
        let cycles = self.detect_cycles(series);
        let fluctuations = self.detect_fluctuations(series);
        let jumps = self.detect_power_jumps(series);
        let scores = self.instability_scores(series);

        let short = cycles
            .iter()
            .filter(|c| c.is_short(self.config.short_cycle_minutes))
            .count();
        let durations: Vec<f64> = cycles.iter().map(|c| c.duration_minutes).collect();
        let span_hours =
            minutes_between(series[0].timestamp, series[series.len() - 1].timestamp) / 60.0;

        CyclingReport {
            total_cycles: cycles.len(),
            short_cycle_count: short,
            short_cycle_ratio: if cycles.is_empty() {
                0.0
            } else {
                short as f64 / cycles.len() as f64
            },
            avg_cycle_minutes: mean(&durations),
            cycles_per_hour: if span_hours > 0.0 {
                cycles.len() as f64 / span_hours
            } else {
                0.0
            },
            avg_instability: mean(&scores).unwrap_or(0.0),
            max_instability: scores.iter().copied().fold(0.0, f64::max),
            fluctuation_count: fluctuations.len(),
            jump_count: jumps.len(),
            time_span_hours: span_hours.max(0.0),
        }
    }

    /// Hourly cycle counts; buckets above `threshold_per_hour` are problematic.
    pub fn find_cycling_periods(
        &self,
        series: &[PowerSample],
        bucket: ChronoDuration,
        threshold_per_hour: f64,
    ) -> Vec<CyclingPeriod> {
        let cycles = self.detect_cycles(series);
        let (Some(first), Some(last)) = (cycles.first(), cycles.last()) else {
            return Vec::new();
        };
        let bucket_secs = bucket.num_seconds().max(1);
        let bucket_hours = bucket_secs as f64 / 3600.0;

        let mut periods = Vec::new();
        let mut cursor = align_down(first.start_time, bucket_secs);
        let end = align_down(last.start_time, bucket_secs);
        while cursor <= end {
            let next = cursor + ChronoDuration::seconds(bucket_secs);
            let count = cycles
                .iter()
                .filter(|c| c.start_time >= cursor && c.start_time < next)
                .count();
            let rate = count as f64 / bucket_hours;
            periods.push(CyclingPeriod {
                bucket_start: cursor,
                cycles_per_hour: rate,
                is_problematic: rate > threshold_per_hour,
            });
            cursor = next;
        }
        periods
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_series::*;

    fn analyzer() -> CycleAnalyzer {
        CycleAnalyzer::default()
    }

    #[test]
    fn constant_series_is_quiet() {
        let series = minute_series(&[500.0; 60]);
        let a = analyzer();
        assert!(a.instability_scores(&series).iter().all(|s| s.abs() < 1e-9));
        assert!(a.detect_cycles(&series).is_empty());
        assert!(a.detect_fluctuations(&series).is_empty());
        assert!(a.detect_power_jumps(&series).is_empty());
    }

    #[test]
    fn two_level_oscillation_is_a_fluctuation_not_a_cycle() {
        let series = minute_series(&alternating(400.0, 900.0, 40));
        let a = analyzer();
        assert!(a.detect_cycles(&series).is_empty());
        let fluctuations = a.detect_fluctuations(&series);
        assert!(!fluctuations.is_empty());
        // The run stays open to the final sample.
        assert_eq!(fluctuations[0].end_time, series[39].timestamp);
        assert!(fluctuations[0].amplitude_watts >= 500.0 - 1e-9);
        assert!(fluctuations[0].frequency > 0.5);
    }

    #[test]
    fn counts_low_to_high_transitions() {
        let series = minute_series(&[600.0, 650.0, 1200.0, 1300.0, 650.0, 600.0, 1400.0]);
        assert_eq!(count_cycle_starts(&series, 700.0, 700.0), 2);
        let cycles = detect_cycles(&series, 700.0, 700.0);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].peak_power, 1300.0);
        assert_eq!(cycles[0].duration_minutes, 2.0);
    }

    #[test]
    fn hysteresis_ignores_chatter_between_thresholds() {
        let series = minute_series(&[50.0, 250.0, 150.0, 180.0, 120.0, 90.0, 60.0, 250.0]);
        let cycles = detect_cycles(&series, 200.0, 100.0);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].start_time, series[1].timestamp);
        assert_eq!(cycles[0].end_time, series[5].timestamp);
        assert!(cycles[0].start_time < cycles[0].end_time);
    }

    #[test]
    fn short_inputs_are_empty() {
        let a = analyzer();
        assert!(a.detect_cycles(&[]).is_empty());
        assert!(a.detect_cycles(&minute_series(&[500.0])).is_empty());
        assert!(a.instability_scores(&[]).is_empty());
        assert!(a.detect_power_jumps(&minute_series(&[10.0])).is_empty());
        assert_eq!(a.analyze_cycling(&[]), CyclingReport::default());
    }

    #[test]
    fn jumps_use_absolute_or_relative_threshold() {
        let series = minute_series(&[0.0, 100.0, 150.0, 500.0, 480.0]);
        let jumps = detect_power_jumps(&series, 300.0, 40.0);
        // 0 -> 100 has no positive base; 100 -> 150 is +50%; 150 -> 500 is both.
        assert_eq!(jumps.len(), 2);
        assert_eq!(jumps[0].delta_watts, 50.0);
        assert_eq!(jumps[1].power_after, 500.0);
    }

    #[test]
    fn zero_mean_window_scores_zero() {
        let series = minute_series(&[0.0; 12]);
        assert!(instability_scores(&series, 10).iter().all(|s| *s == 0.0));
    }

    #[test]
    fn report_counts_short_cycles_per_hour() {
        let mut values = Vec::new();
        for _ in 0..6 {
            values.extend_from_slice(&[50.0, 50.0, 800.0, 800.0, 800.0, 50.0, 50.0, 50.0, 50.0, 50.0]);
        }
        let series = minute_series(&values);
        let report = analyzer().analyze_cycling(&series);
        assert_eq!(report.total_cycles, 6);
        assert_eq!(report.short_cycle_count, 6);
        assert_eq!(report.short_cycle_ratio, 1.0);
        assert!(report.cycles_per_hour > 6.0);
        assert!(report.jump_count >= 12);
    }

    #[test]
    fn cycling_periods_flag_busy_hours() {
        let mut values = Vec::new();
        for _ in 0..12 {
            values.extend_from_slice(&[50.0, 800.0, 800.0, 50.0, 50.0]);
        }
        values.extend(std::iter::repeat(50.0).take(60));
        values.extend_from_slice(&[800.0, 800.0, 50.0]);
        let series = minute_series(&values);
        let periods = analyzer().find_cycling_periods(&series, ChronoDuration::hours(1), 4.0);
        assert_eq!(periods.len(), 3);
        assert!(periods[0].is_problematic);
        assert_eq!(periods[0].cycles_per_hour, 12.0);
        assert_eq!(periods[1].cycles_per_hour, 0.0);
        assert_eq!(periods[2].cycles_per_hour, 1.0);
        assert!(!periods[2].is_problematic);
    }
}
