//! Offline replay of a recorded power trace through discovery and the full control cycle,
//! against rooms simulated in memory.

use crate::config::{ControllerConfig, OperatingMode, RoomConfig};
use crate::controller::{ActionExecutor, ActionKind, ControlAction};
use crate::discovery::{AnalysisResult, RegionDiscovery};
use crate::error::StabilityError;
use crate::predictor::VarianceRiskPredictor;
use crate::rolling::resample;
use crate::service::{
    Collaborators, HistorySource, PowerSource, RoomSource, ServiceSnapshot, StabilityService,
    TickOutcome,
};
use crate::signal::{CycleAnalyzer, CyclingPeriod, CyclingReport};
use crate::types::{ensure_monotonic, PowerSample, UnitUpdate};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const PERIOD_BUCKET_HOURS: i64 = 1;
const PROBLEMATIC_CYCLES_PER_HOUR: f64 = 4.0;

// Simulated room dynamics, kelvin per minute.
const HEAT_RATE: f64 = 0.05;
const DRIFT_RATE: f64 = 0.02;
const AMBIENT_HEAT: f64 = 14.0;
const AMBIENT_COOL: f64 = 28.0;

/// Reads a `timestamp,watts` trace with RFC 3339 timestamps. Empty or unparsable power values
/// become NaN so discovery can count them as missing.
pub fn read_trace<R: Read>(reader: R) -> Result<Vec<PowerSample>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut samples = Vec::new();
    for (index, record) in rdr.records().enumerate() {
        let line = index + 2;
        let record = record.with_context(|| format!("read trace line {line}"))?;
        let raw_ts = record
            .get(0)
            .with_context(|| format!("trace line {line} has no timestamp"))?;
        let timestamp = DateTime::parse_from_rfc3339(raw_ts)
            .with_context(|| format!("trace line {line}: bad timestamp {raw_ts:?}"))?
            .with_timezone(&Utc);
        let watts = record
            .get(1)
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(f64::NAN);
        samples.push(PowerSample::new(timestamp, watts));
    }
    ensure_monotonic(&samples).context("trace timestamps must increase")?;
    Ok(samples)
}

pub fn read_trace_file(path: &Path) -> Result<Vec<PowerSample>> {
    let file = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    read_trace(file).with_context(|| format!("parse {}", path.display()))
}

/// Hands out one trace sample per read.
pub struct TracePower {
    samples: Vec<PowerSample>,
    cursor: AtomicUsize,
}

impl TracePower {
    pub fn new(samples: Vec<PowerSample>) -> Self {
        Self {
            samples,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl PowerSource for TracePower {
    fn read_power(&self) -> Option<PowerSample> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.samples.get(index).copied()
    }
}

pub struct TraceHistory {
    samples: Vec<PowerSample>,
}

impl TraceHistory {
    pub fn new(samples: Vec<PowerSample>) -> Self {
        Self { samples }
    }
}

impl HistorySource for TraceHistory {
    fn fetch_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resample_interval: ChronoDuration,
    ) -> Result<Vec<PowerSample>> {
        let window: Vec<PowerSample> = self
            .samples
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp < end)
            .copied()
            .collect();
        if resample_interval.num_seconds() <= 60 {
            return Ok(window);
        }
        Ok(resample(&window, resample_interval.num_seconds()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulatedRoom {
    pub current_temp: f64,
    pub target_temp: f64,
    pub is_on: bool,
    pub fan_mode: Option<String>,
}

/// First-order room model: a running unit pulls the room towards its target, an idle one
/// drifts towards ambient.
pub struct SimulatedRooms {
    mode: OperatingMode,
    rooms: Mutex<BTreeMap<String, SimulatedRoom>>,
}

impl SimulatedRooms {
    /// Every configured room starts idle, half a kelvin on the uncomfortable side of target.
    pub fn from_config(config: &ControllerConfig) -> Self {
        let mode = config.room_rules.operating_mode;
        let target = config.comfort.target_temp;
        let start = match mode {
            OperatingMode::Heat => target - 0.5,
            OperatingMode::Cool => target + 0.5,
        };
        let rooms = config
            .rooms
            .iter()
            .map(|room| {
                (
                    room.name.clone(),
                    SimulatedRoom {
                        current_temp: start,
                        target_temp: target,
                        is_on: false,
                        fan_mode: None,
                    },
                )
            })
            .collect();
        Self {
            mode,
            rooms: Mutex::new(rooms),
        }
    }

    pub fn advance(&self, minutes: f64) {
        if minutes <= 0.0 {
            return;
        }
        let Ok(mut rooms) = self.rooms.lock() else {
            return;
        };
        for room in rooms.values_mut() {
            let next = match (self.mode, room.is_on) {
                (OperatingMode::Heat, true) => {
                    (room.current_temp + HEAT_RATE * minutes).min(room.target_temp + 1.0)
                }
                (OperatingMode::Heat, false) => {
                    (room.current_temp - DRIFT_RATE * minutes).max(AMBIENT_HEAT)
                }
                (OperatingMode::Cool, true) => {
                    (room.current_temp - HEAT_RATE * minutes).max(room.target_temp - 1.0)
                }
                (OperatingMode::Cool, false) => {
                    (room.current_temp + DRIFT_RATE * minutes).min(AMBIENT_COOL)
                }
            };
            room.current_temp = (next * 100.0).round() / 100.0;
        }
    }

    pub fn rooms(&self) -> BTreeMap<String, SimulatedRoom> {
        self.rooms.lock().map(|rooms| rooms.clone()).unwrap_or_default()
    }
}

impl RoomSource for SimulatedRooms {
    fn read_room(&self, room: &RoomConfig) -> Option<UnitUpdate> {
        let rooms = self.rooms.lock().ok()?;
        let state = rooms.get(&room.name)?;
        Some(UnitUpdate {
            entity_id: Some(room.entity_id.clone()),
            is_on: Some(state.is_on),
            current_temp: Some(state.current_temp),
            target_temp: Some(state.target_temp),
            fan_mode: state.fan_mode.clone(),
            hvac_mode: Some(
                match (self.mode, state.is_on) {
                    (_, false) => "off",
                    (OperatingMode::Heat, true) => "heat",
                    (OperatingMode::Cool, true) => "cool",
                }
                .to_string(),
            ),
        })
    }
}

impl ActionExecutor for SimulatedRooms {
    fn execute(&self, action: &ControlAction) -> Result<bool> {
        let Some(name) = action.target_unit.as_deref() else {
            return Ok(action.is_no_action());
        };
        let mut rooms = self
            .rooms
            .lock()
            .map_err(|_| StabilityError::Executor("simulated rooms lock poisoned".to_string()))?;
        let room = rooms
            .get_mut(name)
            .ok_or_else(|| StabilityError::Executor(format!("unknown unit {name}")))?;
        match &action.kind {
            ActionKind::EnableUnit {
                temperature,
                fan_mode,
            } => {
                room.is_on = true;
                room.target_temp = *temperature;
                if fan_mode.is_some() {
                    room.fan_mode = fan_mode.clone();
                }
            }
            ActionKind::DisableUnit => room.is_on = false,
            ActionKind::AdjustTemp { temperature, .. } => room.target_temp = *temperature,
            ActionKind::AdjustFan { fan_mode } => room.fan_mode = Some(fan_mode.clone()),
            ActionKind::NoAction => {}
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceAnalysis {
    pub samples: usize,
    pub cycling: CyclingReport,
    pub problematic_periods: Vec<CyclingPeriod>,
    pub analysis: AnalysisResult,
}

pub fn analyze_trace(config: &ControllerConfig, trace: &[PowerSample]) -> TraceAnalysis {
    let analyzer = CycleAnalyzer::new(config.signal.clone());
    let problematic_periods = analyzer
        .find_cycling_periods(
            trace,
            ChronoDuration::hours(PERIOD_BUCKET_HOURS),
            PROBLEMATIC_CYCLES_PER_HOUR,
        )
        .into_iter()
        .filter(|period| period.is_problematic)
        .collect();
    TraceAnalysis {
        samples: trace.len(),
        cycling: analyzer.analyze_cycling(trace),
        problematic_periods,
        analysis: RegionDiscovery::new(config.discovery.clone()).discover(trace, None),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub history_samples: usize,
    pub replayed_samples: usize,
    pub skipped_cycles: usize,
    pub executed_actions: usize,
    pub failed_actions: usize,
    pub dry_run_cycles: usize,
    pub analysis: AnalysisResult,
    pub rooms: BTreeMap<String, SimulatedRoom>,
    pub snapshot: ServiceSnapshot,
}

/// Discovers regions on the first `history_hours` of the trace, then replays the rest one
/// sample per control cycle.
pub async fn run_replay(
    config: ControllerConfig,
    trace: Vec<PowerSample>,
    history_hours: i64,
) -> Result<ReplayReport> {
    let Some(first) = trace.first() else {
        anyhow::bail!("trace is empty");
    };
    let split = first.timestamp + ChronoDuration::hours(history_hours.max(0));
    let (history, live): (Vec<PowerSample>, Vec<PowerSample>) =
        trace.into_iter().partition(|s| s.timestamp < split);
    tracing::info!(
        history = history.len(),
        replay = live.len(),
        %split,
        "replay starting"
    );

    let config = Arc::new(config);
    let rooms = Arc::new(SimulatedRooms::from_config(&config));
    let service = StabilityService::new(
        config.clone(),
        Collaborators {
            power: Arc::new(TracePower::new(live.clone())),
            rooms: rooms.clone(),
            history: Arc::new(TraceHistory::new(history.clone())),
            executor: rooms.clone(),
            predictor: Arc::new(VarianceRiskPredictor::default()),
        },
    );
    let analysis = service
        .run_discovery(split)
        .await
        .context("discovery on trace history")?;

    let mut report = ReplayReport {
        history_samples: history.len(),
        replayed_samples: live.len(),
        skipped_cycles: 0,
        executed_actions: 0,
        failed_actions: 0,
        dry_run_cycles: 0,
        analysis: (*analysis).clone(),
        rooms: BTreeMap::new(),
        snapshot: service.snapshot().await,
    };

    let mut previous: Option<DateTime<Utc>> = history.last().map(|s| s.timestamp);
    for sample in &live {
        if let Some(prev) = previous {
            rooms.advance((sample.timestamp - prev).num_seconds() as f64 / 60.0);
        }
        previous = Some(sample.timestamp);
        match service.tick().await {
            TickOutcome::Skipped { .. } => report.skipped_cycles += 1,
            TickOutcome::Planned {
                executed,
                failed,
                dry_run,
                ..
            } => {
                report.executed_actions += executed;
                report.failed_actions += failed;
                if dry_run {
                    report.dry_run_cycles += 1;
                }
            }
        }
    }

    report.rooms = rooms.rooms();
    report.snapshot = service.snapshot().await;
    tracing::info!(
        executed = report.executed_actions,
        failed = report.failed_actions,
        skipped = report.skipped_cycles,
        "replay finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Strategy;
    use crate::types::test_series::base_time;
    use crate::types::SystemMode;

    fn trace_csv(rows: &[(i64, &str)]) -> String {
        let mut out = String::from("timestamp,watts\n");
        for (minute, watts) in rows {
            let ts = base_time() + ChronoDuration::minutes(*minute);
            out.push_str(&format!("{},{watts}\n", ts.to_rfc3339()));
        }
        out
    }

    fn config_with_rooms() -> ControllerConfig {
        let mut config = ControllerConfig::default();
        config.rooms = ["living", "office"]
            .iter()
            .enumerate()
            .map(|(i, name)| RoomConfig {
                name: name.to_string(),
                entity_id: format!("climate.{name}"),
                temp_sensor: None,
                priority: 10 * (i as u32 + 1),
            })
            .collect();
        config.runtime.utc_offset_minutes = Some(0);
        config
    }

    #[test]
    fn trace_parses_and_keeps_missing_values() {
        let raw = trace_csv(&[(0, "500"), (1, ""), (2, " 620.5 ")]);
        let samples = read_trace(raw.as_bytes()).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].watts, 500.0);
        assert!(samples[1].watts.is_nan());
        assert_eq!(samples[2].watts, 620.5);
        assert_eq!(samples[2].timestamp, base_time() + ChronoDuration::minutes(2));
    }

    #[test]
    fn trace_rejects_bad_timestamps_and_disorder() {
        let bad = "timestamp,watts\nyesterday,500\n";
        let err = read_trace(bad.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));

        let backwards = trace_csv(&[(5, "500"), (4, "510")]);
        assert!(read_trace(backwards.as_bytes()).is_err());
    }

    #[test]
    fn simulated_rooms_follow_actions() {
        let rooms = SimulatedRooms::from_config(&config_with_rooms());
        let enable = ControlAction::for_unit(
            ActionKind::EnableUnit {
                temperature: 21.0,
                fan_mode: Some("auto".to_string()),
            },
            "living",
            Strategy::TooCold,
            "cold",
            base_time(),
        );
        assert!(rooms.execute(&enable).unwrap());
        rooms.advance(10.0);

        let state = rooms.rooms();
        assert!(state["living"].is_on);
        assert_eq!(state["living"].current_temp, 21.0);
        assert_eq!(state["office"].current_temp, 20.3);

        let unknown = ControlAction::for_unit(
            ActionKind::DisableUnit,
            "attic",
            Strategy::NightIdle,
            "idle",
            base_time(),
        );
        assert!(rooms.execute(&unknown).is_err());
    }

    #[test]
    fn analyze_flags_rapid_cycling_hours() {
        let values: Vec<(i64, String)> = (0..180)
            .map(|m| {
                let watts = if m < 60 && (m / 3) % 2 == 1 { 900.0 } else if m < 60 { 0.0 } else { 700.0 };
                (m, format!("{watts}"))
            })
            .collect();
        let rows: Vec<(i64, &str)> = values.iter().map(|(m, w)| (*m, w.as_str())).collect();
        let trace = read_trace(trace_csv(&rows).as_bytes()).unwrap();
        let report = analyze_trace(&ControllerConfig::default(), &trace);

        assert_eq!(report.samples, 180);
        assert!(report.cycling.total_cycles >= 9);
        assert_eq!(report.problematic_periods.len(), 1);
        assert_eq!(report.problematic_periods[0].bucket_start, base_time());
        assert!(!report.analysis.sufficient_data);
    }

    #[tokio::test]
    async fn replay_discovers_then_controls() {
        let samples: Vec<PowerSample> = (0..(48 * 60 + 30))
            .map(|m| {
                let watts = if m < 48 * 60 { 500.0 } else { 300.0 };
                PowerSample::new(base_time() + ChronoDuration::minutes(m), watts)
            })
            .collect();
        let report = run_replay(config_with_rooms(), samples, 48).await.unwrap();

        assert_eq!(report.history_samples, 48 * 60);
        assert_eq!(report.replayed_samples, 30);
        assert!(report.analysis.sufficient_data);
        assert_eq!(report.snapshot.observer.mode, SystemMode::Active);
        assert_eq!(report.skipped_cycles, 0);
        assert!(report.executed_actions >= 1);
        assert!(report.rooms.values().any(|room| room.is_on));
    }

    #[tokio::test]
    async fn empty_trace_is_an_error() {
        assert!(run_replay(ControllerConfig::default(), Vec::new(), 24).await.is_err());
    }
}
