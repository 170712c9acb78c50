//! Per-cycle reward and the JSON-lines episode log written next to the controller.

use crate::controller::ControlAction;
use crate::types::{OptimizerStatus, SystemMode};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const UNSTABLE_PENALTY: f64 = 20.0;
const ENERGY_SCALE_WATTS: f64 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    pub comfort: f64,
    pub stability: f64,
    pub energy: f64,
    pub total: f64,
}

impl Reward {
    /// Comfort is the negative summed absolute deviation, stability a flat penalty while inside
    /// an unstable band, energy the power in units of 500 W.
    pub fn score(status: &OptimizerStatus, in_unstable_band: bool) -> Self {
        let comfort = -status
            .units
            .values()
            .filter_map(|unit| unit.delta())
            .map(f64::abs)
            .sum::<f64>();
        let stability = if in_unstable_band { -UNSTABLE_PENALTY } else { 0.0 };
        let energy = -status.power_consumption.max(0.0) / ENERGY_SCALE_WATTS;
        Self {
            comfort,
            stability,
            energy,
            total: comfort + stability + energy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub timestamp: DateTime<Utc>,
    pub mode: SystemMode,
    pub power: f64,
    pub room_deltas: BTreeMap<String, f64>,
    pub actions: Vec<ControlAction>,
    pub executed: bool,
    pub reward: Reward,
    pub unstable_band: Option<String>,
    pub emergency: bool,
}

impl EpisodeRecord {
    pub fn new(
        status: &OptimizerStatus,
        actions: Vec<ControlAction>,
        executed: bool,
        unstable_band: Option<String>,
        emergency: bool,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let reward = Reward::score(status, unstable_band.is_some());
        Self {
            timestamp,
            mode: status.mode,
            power: status.power_consumption,
            room_deltas: status
                .units
                .values()
                .filter_map(|unit| unit.delta().map(|delta| (unit.name.clone(), delta)))
                .collect(),
            actions,
            executed,
            reward,
            unstable_band,
            emergency,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpisodeLog {
    path: PathBuf,
}

impl EpisodeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &EpisodeRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        let mut line = serde_json::to_string(record).context("serialize episode record")?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<EpisodeRecord>> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parse line {} of {}", i + 1, self.path.display()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ActionKind, Strategy};
    use crate::types::test_series::base_time;
    use crate::types::UnitStatus;
    use tempfile::TempDir;

    fn status() -> OptimizerStatus {
        let mut living = UnitStatus::new("living", "climate.living");
        living.current_temp = Some(20.0);
        living.target_temp = Some(21.0);
        let mut office = UnitStatus::new("office", "climate.office");
        office.current_temp = Some(21.5);
        office.target_temp = Some(21.0);
        let unknown = UnitStatus::new("guest", "climate.guest");
        OptimizerStatus {
            mode: SystemMode::Active,
            power_consumption: 1000.0,
            units: [living, office, unknown]
                .into_iter()
                .map(|u| (u.name.clone(), u))
                .collect(),
            ..OptimizerStatus::default()
        }
    }

    #[test]
    fn reward_combines_comfort_stability_and_energy() {
        let calm = Reward::score(&status(), false);
        assert_eq!(calm.comfort, -1.5);
        assert_eq!(calm.stability, 0.0);
        assert_eq!(calm.energy, -2.0);
        assert_eq!(calm.total, -3.5);

        let banded = Reward::score(&status(), true);
        assert_eq!(banded.total, -23.5);
    }

    #[test]
    fn log_appends_one_line_per_cycle() {
        let dir = TempDir::new().unwrap();
        let log = EpisodeLog::new(dir.path().join("logs").join("episodes.jsonl"));
        let action = ControlAction::for_unit(
            ActionKind::DisableUnit,
            "office",
            Strategy::NightIdle,
            "idle",
            base_time(),
        );

        log.append(&EpisodeRecord::new(&status(), vec![action], true, None, false, base_time()))
            .unwrap();
        log.append(&EpisodeRecord::new(
            &status(),
            Vec::new(),
            false,
            Some("400W avg".to_string()),
            false,
            base_time(),
        ))
        .unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].actions.len(), 1);
        assert_eq!(records[0].room_deltas.len(), 2);
        assert_eq!(records[0].room_deltas["living"], -1.0);
        assert_eq!(records[1].reward.stability, -20.0);
    }
}
