use crate::config::{ObserverConfig, SignalConfig};
use crate::error::{StabilityError, StabilityResult};
use crate::rolling::{mean, spread, trailing_stats, RollingWindow};
use crate::signal::{detect_power_jumps, CycleAnalyzer, PowerJump};
use crate::types::{OptimizerStatus, PowerSample, SystemMode, UnitStatus, UnitUpdate};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::VecDeque;

const WEIGHT_STD: f64 = 0.4;
const WEIGHT_JUMPS: f64 = 0.35;
const WEIGHT_AMPLITUDE: f64 = 0.25;
const OFF_MEAN_WATTS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JumpView {
    pub time: DateTime<Utc>,
    pub delta: f64,
}

/// Read-only snapshot for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObserverSummary {
    pub mode: SystemMode,
    pub power: f64,
    pub is_cycling: bool,
    pub cycling_risk: f64,
    pub instability_score: f64,
    pub recent_jumps: Vec<JumpView>,
    pub active_units: usize,
    pub last_update: Option<DateTime<Utc>>,
}

/// Owns the live power window and the status every other component reads.
#[derive(Debug, Clone)]
pub struct LiveObserver {
    config: ObserverConfig,
    analyzer: CycleAnalyzer,
    window: RollingWindow,
    status: OptimizerStatus,
    instability_score: f64,
    recent_jumps: VecDeque<PowerJump>,
}

impl LiveObserver {
    pub fn new(config: ObserverConfig, signal: SignalConfig) -> Self {
        Self {
            window: RollingWindow::new(config.window_capacity),
            recent_jumps: VecDeque::with_capacity(config.recent_jump_limit),
            analyzer: CycleAnalyzer::new(signal),
            status: OptimizerStatus::default(),
            instability_score: 0.0,
            config,
        }
    }

    pub fn status(&self) -> &OptimizerStatus {
        &self.status
    }

    pub fn instability_score(&self) -> f64 {
        self.instability_score
    }

    pub fn set_mode(&mut self, mode: SystemMode) {
        if self.status.mode != mode {
            tracing::info!(from = self.status.mode.as_str(), to = mode.as_str(), "mode changed");
            self.status.mode = mode;
        }
    }

    pub fn recent_samples(&self, n: usize) -> Vec<PowerSample> {
        self.window.tail(n)
    }

    pub fn recent_values(&self, n: usize) -> Vec<f64> {
        self.window.tail_values(n)
    }

    /// Feeds one reading. Non-finite values are rejected without touching state, as are
    /// timestamps older than the newest sample.
    pub fn update_power(&mut self, watts: f64, timestamp: DateTime<Utc>) -> StabilityResult<()> {
        if !watts.is_finite() {
            return Err(StabilityError::DataUnavailable(format!(
                "power reading is not a number ({watts})"
            )));
        }
        self.window.push(PowerSample::new(timestamp, watts))?;
        self.status.power_consumption = watts;
        self.status.last_update = Some(timestamp);

        if self.window.len() < self.config.min_samples {
            return Ok(());
        }
        self.track_latest_jump();
        self.rescore(timestamp);
        Ok(())
    }

    pub fn update_unit(&mut self, name: &str, update: UnitUpdate) {
        let unit = self
            .status
            .units
            .entry(name.to_string())
            .or_insert_with(|| {
                UnitStatus::new(name, update.entity_id.clone().unwrap_or_default())
            });
        update.apply_to(unit);
    }

    pub fn summary(&self) -> ObserverSummary {
        ObserverSummary {
            mode: self.status.mode,
            power: self.status.power_consumption,
            is_cycling: self.status.is_cycling,
            cycling_risk: self.status.cycling_risk,
            instability_score: (self.instability_score * 1000.0).round() / 1000.0,
            recent_jumps: self
                .recent_jumps
                .iter()
                .map(|jump| JumpView {
                    time: jump.timestamp,
                    delta: (jump.delta_watts * 10.0).round() / 10.0,
                })
                .collect(),
            active_units: self.status.active_unit_count(),
            last_update: self.status.last_update,
        }
    }

    fn track_latest_jump(&mut self) {
        let pair = self.window.tail(2);
        let Some(jump) = detect_power_jumps(&pair, self.config.jump_threshold_watts, f64::INFINITY)
            .into_iter()
            .next()
        else {
            return;
        };
        if let Some(last) = self.recent_jumps.back_mut() {
            if last.timestamp == jump.timestamp {
                *last = jump;
                return;
            }
        }
        if self.recent_jumps.len() >= self.config.recent_jump_limit {
            self.recent_jumps.pop_front();
        }
        self.recent_jumps.push_back(jump);
    }

    fn rescore(&mut self, now: DateTime<Utc>) {
        let recent = self.window.tail(self.config.score_window);
        let values: Vec<f64> = recent.iter().map(|s| s.watts).collect();

        let lookback = self.window.since(now - ChronoDuration::minutes(self.config.jump_lookback_minutes));
        let jumps_in_lookback =
            detect_power_jumps(&lookback, self.config.jump_threshold_watts, f64::INFINITY).len();

        self.instability_score = score_window(
            &values,
            self.analyzer.config().window_samples,
            jumps_in_lookback,
            self.config.jumps_for_full_score,
        );

        let short_cycle = self
            .analyzer
            .detect_cycles(&recent)
            .iter()
            .any(|c| c.is_short(self.analyzer.config().short_cycle_minutes));
        let fluctuating = !self.analyzer.detect_fluctuations(&recent).is_empty();

        self.status.cycling_risk = self.instability_score;
        self.status.is_cycling =
            short_cycle || fluctuating || self.instability_score > self.config.cycling_cutoff;
        tracing::trace!(
            score = self.instability_score,
            short_cycle,
            fluctuating,
            jumps = jumps_in_lookback,
            "observer rescored"
        );
    }
}

/// Weighted rolling-std ratio, jump frequency and amplitude ratio, each capped at 1.
fn score_window(values: &[f64], std_window: usize, jumps: usize, jumps_for_full: f64) -> f64 {
    if values.len() < 3 {
        return 0.0;
    }
    let Some(avg) = mean(values) else {
        return 0.0;
    };
    if avg < OFF_MEAN_WATTS {
        return 0.0;
    }
    let stds: Vec<f64> = trailing_stats(values, std_window).iter().map(|s| s.std).collect();
    let std_ratio = (mean(&stds).unwrap_or(0.0) / avg).min(1.0);
    let jump_freq = (jumps as f64 / jumps_for_full).min(1.0);
    let amplitude_ratio = (spread(values) / avg).min(1.0);
    (WEIGHT_STD * std_ratio + WEIGHT_JUMPS * jump_freq + WEIGHT_AMPLITUDE * amplitude_ratio)
        .clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_series::*;

    fn observer() -> LiveObserver {
        LiveObserver::new(ObserverConfig::default(), SignalConfig::default())
    }

    fn feed(observer: &mut LiveObserver, values: &[f64]) {
        for sample in minute_series(values) {
            observer.update_power(sample.watts, sample.timestamp).unwrap();
        }
    }

    #[test]
    fn status_is_left_alone_until_window_fills() {
        let mut obs = observer();
        obs.status.cycling_risk = 0.42;
        feed(&mut obs, &[100.0, 900.0, 100.0, 900.0]);
        assert_eq!(obs.status().cycling_risk, 0.42);
        assert_eq!(obs.status().power_consumption, 900.0);
        assert!(obs.summary().recent_jumps.is_empty());
    }

    #[test]
    fn steady_load_is_not_cycling() {
        let mut obs = observer();
        feed(&mut obs, &[600.0; 30]);
        assert!(!obs.status().is_cycling);
        assert!(obs.status().cycling_risk < 1e-9);
    }

    #[test]
    fn score_must_exceed_cycling_cutoff() {
        let config = ObserverConfig {
            cycling_cutoff: 0.0,
            ..ObserverConfig::default()
        };
        let mut obs = LiveObserver::new(config, SignalConfig::default());
        feed(&mut obs, &[600.0; 30]);
        assert_eq!(obs.instability_score(), 0.0);
        assert!(!obs.status().is_cycling);
    }

    #[test]
    fn oscillating_load_is_cycling_with_jumps() {
        let mut obs = observer();
        feed(&mut obs, &alternating(400.0, 900.0, 30));
        let summary = obs.summary();
        assert!(summary.is_cycling);
        assert!(summary.cycling_risk > 0.6);
        assert_eq!(summary.recent_jumps.len(), 10);
        assert_eq!(summary.recent_jumps[9].delta, 500.0);
    }

    #[test]
    fn non_finite_reading_is_rejected_without_state_change() {
        let mut obs = observer();
        feed(&mut obs, &[500.0; 6]);
        let err = obs.update_power(f64::NAN, base_time() + ChronoDuration::minutes(10));
        assert!(matches!(err, Err(StabilityError::DataUnavailable(_))));
        assert_eq!(obs.status().power_consumption, 500.0);
        assert_eq!(obs.recent_values(100).len(), 6);
    }

    #[test]
    fn window_is_bounded() {
        let mut obs = observer();
        feed(&mut obs, &[500.0; 150]);
        assert_eq!(obs.recent_values(1000).len(), 120);
    }

    #[test]
    fn unit_updates_merge_per_field() {
        let mut obs = observer();
        obs.update_unit(
            "office",
            UnitUpdate {
                entity_id: Some("climate.office".to_string()),
                is_on: Some(true),
                ..Default::default()
            },
        );
        obs.update_unit(
            "office",
            UnitUpdate {
                current_temp: Some(20.5),
                ..Default::default()
            },
        );
        let unit = &obs.status().units["office"];
        assert!(unit.is_on);
        assert_eq!(unit.entity_id, "climate.office");
        assert_eq!(unit.current_temp, Some(20.5));
        assert_eq!(obs.summary().active_units, 1);
    }

    #[test]
    fn near_zero_mean_scores_zero() {
        assert_eq!(score_window(&[0.0, 0.5, 0.0, 0.2], 10, 0, 6.0), 0.0);
        assert_eq!(score_window(&[500.0, 900.0], 10, 4, 6.0), 0.0);
    }
}
