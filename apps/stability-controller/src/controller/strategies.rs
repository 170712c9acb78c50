//! Global strategy list: gate, night buffering, stability targeting, gradual nudge.

use super::action::{ActionKind, ControlAction, Strategy};
use crate::config::ControllerConfig;
use crate::predictor::RiskPrediction;
use crate::rolling::{sample_std, spread};
use crate::types::{OptimizerStatus, UnitStatus};
use chrono::{DateTime, NaiveTime, Utc};

/// What the strategies need to know about the current operating point.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSummary {
    pub min_stable_power: f64,
    pub power_std: f64,
    pub power_spread: f64,
    pub local_time: NaiveTime,
}

impl RegionSummary {
    pub fn from_recent(recent: &[f64], min_stable_power: f64, local_time: NaiveTime) -> Self {
        Self {
            min_stable_power,
            power_std: sample_std(recent),
            power_spread: spread(recent),
            local_time,
        }
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub(super) fn is_unstable(
    config: &ControllerConfig,
    status: &OptimizerStatus,
    prediction: &RiskPrediction,
    summary: &RegionSummary,
) -> bool {
    let d = &config.decision;
    status.cycling_risk > d.risk_cutoff
        || summary.power_std > d.stable_std_watts
        || summary.power_spread > d.high_spread_watts
        || (prediction.predicted && prediction.probability >= d.prediction_cutoff)
}

/// Candidates sorted by ascending configured priority, then name.
fn by_priority<'a>(
    config: &ControllerConfig,
    units: impl Iterator<Item = &'a UnitStatus>,
) -> Vec<&'a UnitStatus> {
    let mut out: Vec<&UnitStatus> = units.collect();
    out.sort_by(|a, b| {
        config
            .priority_of(&a.name)
            .cmp(&config.priority_of(&b.name))
            .then_with(|| a.name.cmp(&b.name))
    });
    out
}

pub(super) fn decide(
    config: &ControllerConfig,
    status: &OptimizerStatus,
    prediction: &RiskPrediction,
    summary: &RegionSummary,
    now: DateTime<Utc>,
    blocked: &dyn Fn(&str) -> bool,
) -> ControlAction {
    let unstable = is_unstable(config, status, prediction, summary);
    let power = status.power_consumption;
    let floor = summary.min_stable_power;

    if !unstable && power >= floor {
        return ControlAction::none(
            Strategy::Gate,
            format!(
                "stable and efficient: {power:.0} W at or above {floor:.0} W, risk {:.2}",
                status.cycling_risk
            ),
            now,
        );
    }

    let inactive = by_priority(
        config,
        status
            .units
            .values()
            .filter(|u| !u.is_on && !blocked(&u.name)),
    );

    if unstable && config.night.contains(summary.local_time) {
        if let Some(unit) = inactive.first() {
            let temp = config.comfort.night_temp;
            return ControlAction::for_unit(
                ActionKind::EnableUnit {
                    temperature: temp,
                    fan_mode: Some("low".to_string()),
                },
                &unit.name,
                Strategy::NightBuffer,
                format!("night mode: {} enabled as thermal buffer at {temp:.1} C", unit.name),
                now,
            );
        }
    }

    if power < floor || unstable {
        if let Some(unit) = inactive.first() {
            let temp = round_tenth(config.comfort.target_temp - config.comfort.stability_setpoint_offset);
            return ControlAction::for_unit(
                ActionKind::EnableUnit {
                    temperature: temp,
                    fan_mode: Some("auto".to_string()),
                },
                &unit.name,
                Strategy::StabilityTargeting,
                format!(
                    "stability targeting: {} enabled (target above {floor:.0} W, std {:.0} W)",
                    unit.name, summary.power_std
                ),
                now,
            );
        }
    }

    if unstable {
        if let Some(action) = nudge(config, status, now, blocked) {
            return action;
        }
    }

    ControlAction::none(Strategy::NoStrategy, "no suitable strategy found", now)
}

/// Smallest setpoint change on an active unit, first upwards then downwards, bounded by the
/// allowed deviation from the comfort target.
fn nudge(
    config: &ControllerConfig,
    status: &OptimizerStatus,
    now: DateTime<Utc>,
    blocked: &dyn Fn(&str) -> bool,
) -> Option<ControlAction> {
    let comfort = &config.comfort;
    let upper = comfort.target_temp + comfort.max_temp_deviation;
    let lower = comfort.target_temp - comfort.max_temp_deviation;
    let active = by_priority(
        config,
        status
            .units
            .values()
            .filter(|u| u.is_on && u.target_temp.is_some() && !blocked(&u.name)),
    );

    for unit in active {
        let Some(current) = unit.target_temp else {
            continue;
        };
        let up = round_tenth(current + comfort.nudge_step);
        let down = round_tenth(current - comfort.nudge_step);
        let next = if up <= upper + 1e-9 {
            up
        } else if down >= lower - 1e-9 {
            down
        } else {
            continue;
        };
        return Some(ControlAction::for_unit(
            ActionKind::AdjustTemp {
                temperature: next,
                previous: Some(current),
            },
            &unit.name,
            Strategy::GradualNudge,
            format!(
                "gradual nudge: {} {current:.1} -> {next:.1} C to damp oscillation",
                unit.name
            ),
            now,
        ));
    }
    None
}
