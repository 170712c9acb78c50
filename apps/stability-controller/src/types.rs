use crate::error::{StabilityError, StabilityResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One reading of aggregate compressor power.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    pub timestamp: DateTime<Utc>,
    pub watts: f64,
}

impl PowerSample {
    pub fn new(timestamp: DateTime<Utc>, watts: f64) -> Self {
        Self { timestamp, watts }
    }
}

/// Fails on the first timestamp that goes backwards. Equal timestamps are allowed.
pub fn ensure_monotonic(series: &[PowerSample]) -> StabilityResult<()> {
    for pair in series.windows(2) {
        if pair[1].timestamp < pair[0].timestamp {
            return Err(StabilityError::NonMonotonic {
                previous: pair[0].timestamp,
                next: pair[1].timestamp,
            });
        }
    }
    Ok(())
}

/// Collapses runs of identical timestamps to their last sample and drops non-finite values.
///
/// Input must already be non-decreasing in time.
pub fn clean_series(series: &[PowerSample]) -> Vec<PowerSample> {
    let mut out: Vec<PowerSample> = Vec::with_capacity(series.len());
    for sample in series {
        if !sample.watts.is_finite() {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.timestamp == sample.timestamp => *last = *sample,
            _ => out.push(*sample),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    #[default]
    Observation,
    Learning,
    Active,
    Manual,
}

impl SystemMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemMode::Observation => "observation",
            SystemMode::Learning => "learning",
            SystemMode::Active => "active",
            SystemMode::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub name: String,
    pub entity_id: String,
    pub is_on: bool,
    pub current_temp: Option<f64>,
    pub target_temp: Option<f64>,
    pub fan_mode: Option<String>,
    pub hvac_mode: Option<String>,
}

impl UnitStatus {
    pub fn new(name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_id: entity_id.into(),
            is_on: false,
            current_temp: None,
            target_temp: None,
            fan_mode: None,
            hvac_mode: None,
        }
    }

    /// Room temperature minus setpoint, when both are known.
    pub fn delta(&self) -> Option<f64> {
        match (self.current_temp, self.target_temp) {
            (Some(current), Some(target)) => Some(current - target),
            _ => None,
        }
    }
}

/// Partial unit state from one event source. `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitUpdate {
    pub entity_id: Option<String>,
    pub is_on: Option<bool>,
    pub current_temp: Option<f64>,
    pub target_temp: Option<f64>,
    pub fan_mode: Option<String>,
    pub hvac_mode: Option<String>,
}

impl UnitUpdate {
    pub(crate) fn apply_to(self, unit: &mut UnitStatus) {
        if let Some(entity_id) = self.entity_id {
            unit.entity_id = entity_id;
        }
        if let Some(is_on) = self.is_on {
            unit.is_on = is_on;
        }
        if let Some(current_temp) = self.current_temp.filter(|v| v.is_finite()) {
            unit.current_temp = Some(current_temp);
        }
        if let Some(target_temp) = self.target_temp.filter(|v| v.is_finite()) {
            unit.target_temp = Some(target_temp);
        }
        if let Some(fan_mode) = self.fan_mode {
            unit.fan_mode = Some(fan_mode);
        }
        if let Some(hvac_mode) = self.hvac_mode {
            unit.hvac_mode = Some(hvac_mode);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OptimizerStatus {
    pub mode: SystemMode,
    pub power_consumption: f64,
    pub is_cycling: bool,
    pub cycling_risk: f64,
    pub units: BTreeMap<String, UnitStatus>,
    pub last_update: Option<DateTime<Utc>>,
}

impl OptimizerStatus {
    pub fn active_unit_count(&self) -> usize {
        self.units.values().filter(|unit| unit.is_on).count()
    }
}

#[cfg(test)]
pub(crate) mod test_series {
    use super::PowerSample;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

    pub(crate) fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0)
            .single()
            .unwrap()
    }

    /// One sample per minute starting at [`base_time`].
    pub(crate) fn minute_series(values: &[f64]) -> Vec<PowerSample> {
        let start = base_time();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| PowerSample::new(start + ChronoDuration::minutes(i as i64), *v))
            .collect()
    }

    pub(crate) fn alternating(low: f64, high: f64, len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| if i % 2 == 0 { low } else { high })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_series::*;
    use super::*;

    #[test]
    fn clean_series_keeps_last_write_for_duplicate_timestamps() {
        let mut series = minute_series(&[100.0, 200.0, 300.0]);
        series[2].timestamp = series[1].timestamp;
        series.push(PowerSample::new(series[2].timestamp, f64::NAN));

        let cleaned = clean_series(&series);
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[1].watts, 300.0);
    }

    #[test]
    fn ensure_monotonic_rejects_backwards_time() {
        let mut series = minute_series(&[1.0, 2.0, 3.0]);
        series.swap(1, 2);
        assert!(matches!(
            ensure_monotonic(&series),
            Err(StabilityError::NonMonotonic { .. })
        ));
        assert!(ensure_monotonic(&minute_series(&[1.0, 1.0])).is_ok());
    }

    #[test]
    fn unit_update_only_touches_present_fields() {
        let mut unit = UnitStatus::new("office", "climate.office");
        UnitUpdate {
            is_on: Some(true),
            target_temp: Some(21.0),
            ..Default::default()
        }
        .apply_to(&mut unit);
        UnitUpdate {
            current_temp: Some(19.5),
            ..Default::default()
        }
        .apply_to(&mut unit);

        assert!(unit.is_on);
        assert_eq!(unit.target_temp, Some(21.0));
        assert_eq!(unit.current_temp, Some(19.5));
        assert_eq!(unit.delta(), Some(-1.5));
        assert_eq!(unit.entity_id, "climate.office");
    }
}
