use crate::config::{
    positive_or_default, ControllerConfig, DEFAULT_POWER_RANGE_THRESHOLD,
    DEFAULT_POWER_STD_THRESHOLD, DEFAULT_TOTAL_DEVIATION_THRESHOLD,
};
use crate::rolling::{sample_std, spread};
use crate::types::UnitStatus;
use serde::Serialize;

const MIN_STABILITY_SAMPLES: usize = 3;

/// Thresholds re-checked where they are used so a bad value can never make every cycle an
/// emergency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmergencyThresholds {
    pub tolerance_cold: f64,
    pub tolerance_warm: f64,
    pub total_deviation: f64,
    pub power_std: f64,
    pub power_range: f64,
}

impl EmergencyThresholds {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            tolerance_cold: positive_or_default(
                config.room_rules.tolerance_cold,
                1.5,
                "room_rules.tolerance_cold",
            ),
            tolerance_warm: positive_or_default(
                config.room_rules.tolerance_warm,
                1.0,
                "room_rules.tolerance_warm",
            ),
            total_deviation: positive_or_default(
                config.emergency.total_deviation_threshold,
                DEFAULT_TOTAL_DEVIATION_THRESHOLD,
                "emergency.total_deviation_threshold",
            ),
            power_std: positive_or_default(
                config.emergency.power_std_threshold,
                DEFAULT_POWER_STD_THRESHOLD,
                "emergency.power_std_threshold",
            ),
            power_range: positive_or_default(
                config.emergency.power_range_threshold,
                DEFAULT_POWER_RANGE_THRESHOLD,
                "emergency.power_range_threshold",
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmergencyAssessment {
    pub comfort: bool,
    pub stability: bool,
    pub reasons: Vec<String>,
}

impl EmergencyAssessment {
    pub fn is_emergency(&self) -> bool {
        self.comfort || self.stability
    }
}

/// A room outside its asymmetric tolerance, or the summed absolute deviation over all rooms
/// above the total threshold.
pub fn comfort_emergency<'a>(
    units: impl Iterator<Item = &'a UnitStatus>,
    thresholds: &EmergencyThresholds,
) -> Option<String> {
    let mut total = 0.0;
    let mut worst: Option<String> = None;
    for unit in units {
        let Some(delta) = unit.delta() else {
            continue;
        };
        total += delta.abs();
        if worst.is_some() {
            continue;
        }
        if delta < -thresholds.tolerance_cold {
            worst = Some(format!(
                "{} too cold ({delta:+.1} K, tolerance {:.1} K)",
                unit.name, thresholds.tolerance_cold
            ));
        } else if delta > thresholds.tolerance_warm {
            worst = Some(format!(
                "{} too warm ({delta:+.1} K, tolerance {:.1} K)",
                unit.name, thresholds.tolerance_warm
            ));
        }
    }
    worst.or_else(|| {
        (total > thresholds.total_deviation).then(|| {
            format!(
                "total deviation {total:.1} K above {:.1} K",
                thresholds.total_deviation
            )
        })
    })
}

/// Recent power with both standard deviation and range above threshold. Needs at least three
/// samples.
pub fn stability_emergency(recent: &[f64], thresholds: &EmergencyThresholds) -> Option<String> {
    let finite: Vec<f64> = recent.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() < MIN_STABILITY_SAMPLES {
        return None;
    }
    let std = sample_std(&finite);
    let range = spread(&finite);
    (std > thresholds.power_std && range > thresholds.power_range).then(|| {
        format!(
            "power oscillating (std {std:.0} W, range {range:.0} W)"
        )
    })
}

pub fn assess<'a>(
    units: impl Iterator<Item = &'a UnitStatus>,
    recent: &[f64],
    thresholds: &EmergencyThresholds,
) -> EmergencyAssessment {
    let mut assessment = EmergencyAssessment::default();
    if let Some(reason) = comfort_emergency(units, thresholds) {
        assessment.comfort = true;
        assessment.reasons.push(reason);
    }
    if let Some(reason) = stability_emergency(recent, thresholds) {
        assessment.stability = true;
        assessment.reasons.push(reason);
    }
    assessment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(name: &str, current: f64, target: f64) -> UnitStatus {
        let mut unit = UnitStatus::new(name, format!("climate.{name}"));
        unit.current_temp = Some(current);
        unit.target_temp = Some(target);
        unit
    }

    fn thresholds() -> EmergencyThresholds {
        EmergencyThresholds::from_config(&ControllerConfig::default())
    }

    #[test]
    fn too_cold_room_is_an_emergency() {
        let units = [room("living", 19.0, 21.0)];
        assert!(comfort_emergency(units.iter(), &thresholds()).is_some());
    }

    #[test]
    fn too_warm_room_is_an_emergency() {
        let units = [room("living", 22.5, 21.0)];
        assert!(comfort_emergency(units.iter(), &thresholds()).is_some());
    }

    #[test]
    fn rooms_within_tolerance_are_fine() {
        let units = [
            room("living", 21.5, 21.0),
            room("bedroom", 19.7, 20.5),
            room("office", 22.0, 21.0),
        ];
        assert!(comfort_emergency(units.iter(), &thresholds()).is_none());
    }

    #[test]
    fn one_violating_room_is_enough() {
        let units = [
            room("living", 21.3, 21.0),
            room("bedroom", 18.7, 20.5),
            room("office", 21.5, 21.0),
        ];
        let reason = comfort_emergency(units.iter(), &thresholds()).unwrap();
        assert!(reason.contains("bedroom"));
    }

    #[test]
    fn summed_deviation_triggers_without_single_violation() {
        let units: Vec<UnitStatus> = (0..7)
            .map(|i| room(&format!("room{i}"), 20.0, 21.0))
            .collect();
        let reason = comfort_emergency(units.iter(), &thresholds()).unwrap();
        assert!(reason.contains("total deviation"));
    }

    #[test]
    fn oscillating_power_is_a_stability_emergency() {
        let wild = [500.0, 1200.0, 600.0, 1400.0, 550.0, 1300.0, 580.0];
        assert!(stability_emergency(&wild, &thresholds()).is_some());

        let calm = [1500.0, 1520.0, 1480.0, 1510.0, 1490.0, 1505.0];
        assert!(stability_emergency(&calm, &thresholds()).is_none());
        assert!(stability_emergency(&[100.0, 2000.0], &thresholds()).is_none());
    }

    #[test]
    fn invalid_thresholds_fall_back_at_point_of_use() {
        let mut config = ControllerConfig::default();
        config.emergency.total_deviation_threshold = -1.0;
        config.emergency.power_std_threshold = f64::NAN;
        config.room_rules.tolerance_cold = 0.0;
        let t = EmergencyThresholds::from_config(&config);
        assert_eq!(t.total_deviation, 6.0);
        assert_eq!(t.power_std, 300.0);
        assert_eq!(t.tolerance_cold, 1.5);

        let calm_room = [room("living", 20.9, 21.0)];
        assert!(comfort_emergency(calm_room.iter(), &t).is_none());
    }
}
