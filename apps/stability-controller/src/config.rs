use crate::error::{StabilityError, StabilityResult};
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_PATH_ENV: &str = "STABILITY_CONFIG_PATH";

fn config_path_from_env() -> Option<PathBuf> {
    env::var(CONFIG_PATH_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}

/// Accepts numbers and numeric strings; anything else becomes NaN and is replaced during
/// validation.
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(match value {
        JsonValue::Number(number) => number.as_f64().unwrap_or(f64::NAN),
        JsonValue::String(raw) => raw.trim().parse::<f64>().unwrap_or(f64::NAN),
        _ => f64::NAN,
    })
}

pub(crate) fn positive_or_default(value: f64, default: f64, field: &'static str) -> f64 {
    if value.is_finite() && value > 0.0 {
        return value;
    }
    tracing::warn!(field, value = %value, default, "invalid threshold; using default");
    default
}

fn non_negative_or_default(value: f64, default: f64, field: &'static str) -> f64 {
    if value.is_finite() && value >= 0.0 {
        return value;
    }
    tracing::warn!(field, value = %value, default, "invalid value; using default");
    default
}

fn unit_interval_or_default(value: f64, default: f64, field: &'static str) -> f64 {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        return value;
    }
    tracing::warn!(field, value = %value, default, "value outside [0, 1]; using default");
    default
}

fn count_or_default(value: usize, minimum: usize, default: usize, field: &'static str) -> usize {
    if value >= minimum {
        return value;
    }
    tracing::warn!(field, value, default, "count below minimum; using default");
    default
}

// ---------------------------------------------------------------------------
// Signal analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default = "default_power_on_threshold")]
    pub power_on_threshold: f64,
    #[serde(default = "default_power_off_threshold")]
    pub power_off_threshold: f64,
    #[serde(default = "default_jump_threshold_watts")]
    pub jump_threshold_watts: f64,
    #[serde(default = "default_jump_threshold_pct")]
    pub jump_threshold_pct: f64,
    #[serde(default = "default_window_samples")]
    pub window_samples: usize,
    #[serde(default = "default_instability_threshold")]
    pub instability_threshold: f64,
    #[serde(default = "default_short_cycle_minutes")]
    pub short_cycle_minutes: f64,
}

fn default_power_on_threshold() -> f64 {
    200.0
}

fn default_power_off_threshold() -> f64 {
    100.0
}

fn default_jump_threshold_watts() -> f64 {
    300.0
}

fn default_jump_threshold_pct() -> f64 {
    40.0
}

fn default_window_samples() -> usize {
    10
}

fn default_instability_threshold() -> f64 {
    0.5
}

fn default_short_cycle_minutes() -> f64 {
    10.0
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            power_on_threshold: default_power_on_threshold(),
            power_off_threshold: default_power_off_threshold(),
            jump_threshold_watts: default_jump_threshold_watts(),
            jump_threshold_pct: default_jump_threshold_pct(),
            window_samples: default_window_samples(),
            instability_threshold: default_instability_threshold(),
            short_cycle_minutes: default_short_cycle_minutes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Live observer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// 120 samples ≈ 2 hours at a 1-minute cadence.
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_score_window")]
    pub score_window: usize,
    #[serde(default = "default_jump_lookback_minutes")]
    pub jump_lookback_minutes: i64,
    #[serde(default = "default_live_jump_threshold_watts")]
    pub jump_threshold_watts: f64,
    #[serde(default = "default_jumps_for_full_score")]
    pub jumps_for_full_score: f64,
    #[serde(default = "default_cycling_cutoff")]
    pub cycling_cutoff: f64,
    #[serde(default = "default_recent_jump_limit")]
    pub recent_jump_limit: usize,
}

fn default_window_capacity() -> usize {
    120
}

fn default_min_samples() -> usize {
    5
}

fn default_score_window() -> usize {
    20
}

fn default_jump_lookback_minutes() -> i64 {
    10
}

fn default_live_jump_threshold_watts() -> f64 {
    200.0
}

fn default_jumps_for_full_score() -> f64 {
    6.0
}

fn default_cycling_cutoff() -> f64 {
    0.6
}

fn default_recent_jump_limit() -> usize {
    10
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
            min_samples: default_min_samples(),
            score_window: default_score_window(),
            jump_lookback_minutes: default_jump_lookback_minutes(),
            jump_threshold_watts: default_live_jump_threshold_watts(),
            jumps_for_full_score: default_jumps_for_full_score(),
            cycling_cutoff: default_cycling_cutoff(),
            recent_jump_limit: default_recent_jump_limit(),
        }
    }
}

// ---------------------------------------------------------------------------
// Region discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_min_datapoints")]
    pub min_datapoints: usize,
    #[serde(default = "default_min_span_hours")]
    pub min_span_hours: f64,
    #[serde(default = "default_feature_window")]
    pub feature_window: usize,
    #[serde(default = "default_feature_jump_watts")]
    pub feature_jump_watts: f64,
    #[serde(default = "default_min_components")]
    pub min_components: usize,
    #[serde(default = "default_max_components")]
    pub max_components: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_convergence_tolerance")]
    pub convergence_tolerance: f64,
    #[serde(default = "default_clustering_min_samples")]
    pub clustering_min_samples: usize,
    #[serde(default = "default_min_region_samples")]
    pub min_region_samples: usize,
    #[serde(default = "default_bin_min_samples")]
    pub bin_min_samples: usize,
    #[serde(default = "default_noise_floor_watts")]
    pub noise_floor_watts: f64,
    #[serde(default = "default_stable_cutoff")]
    pub stable_cutoff: f64,
    #[serde(default = "default_dashboard_stable_cutoff")]
    pub dashboard_stable_cutoff: f64,
    #[serde(default = "default_unstable_cutoff")]
    pub unstable_cutoff: f64,
    #[serde(default = "default_lenient_cutoff")]
    pub lenient_cutoff: f64,
    #[serde(default = "default_fallback_floor_watts")]
    pub fallback_floor_watts: f64,
    #[serde(default = "default_min_stable_power")]
    pub default_min_stable_power: f64,
    #[serde(default = "default_std_scale_watts")]
    pub std_scale_watts: f64,
    #[serde(default = "default_jump_rate_scale_per_hour")]
    pub jump_rate_scale_per_hour: f64,
    #[serde(default = "default_flatline_std_watts")]
    pub flatline_std_watts: f64,
}

fn default_min_datapoints() -> usize {
    1000
}

fn default_min_span_hours() -> f64 {
    24.0
}

fn default_feature_window() -> usize {
    10
}

fn default_feature_jump_watts() -> f64 {
    200.0
}

fn default_min_components() -> usize {
    2
}

fn default_max_components() -> usize {
    6
}

fn default_seed() -> u64 {
    42
}

fn default_max_iterations() -> usize {
    150
}

fn default_convergence_tolerance() -> f64 {
    1e-5
}

fn default_clustering_min_samples() -> usize {
    100
}

fn default_min_region_samples() -> usize {
    20
}

fn default_bin_min_samples() -> usize {
    50
}

fn default_noise_floor_watts() -> f64 {
    300.0
}

fn default_stable_cutoff() -> f64 {
    0.6
}

fn default_dashboard_stable_cutoff() -> f64 {
    0.7
}

fn default_unstable_cutoff() -> f64 {
    0.4
}

fn default_lenient_cutoff() -> f64 {
    0.4
}

fn default_fallback_floor_watts() -> f64 {
    400.0
}

fn default_min_stable_power() -> f64 {
    450.0
}

fn default_std_scale_watts() -> f64 {
    100.0
}

fn default_jump_rate_scale_per_hour() -> f64 {
    12.0
}

fn default_flatline_std_watts() -> f64 {
    5.0
}

/// Upper bound on mixture components regardless of configuration.
pub const MAX_REGION_COMPONENTS: usize = 8;

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_datapoints: default_min_datapoints(),
            min_span_hours: default_min_span_hours(),
            feature_window: default_feature_window(),
            feature_jump_watts: default_feature_jump_watts(),
            min_components: default_min_components(),
            max_components: default_max_components(),
            seed: default_seed(),
            max_iterations: default_max_iterations(),
            convergence_tolerance: default_convergence_tolerance(),
            clustering_min_samples: default_clustering_min_samples(),
            min_region_samples: default_min_region_samples(),
            bin_min_samples: default_bin_min_samples(),
            noise_floor_watts: default_noise_floor_watts(),
            stable_cutoff: default_stable_cutoff(),
            dashboard_stable_cutoff: default_dashboard_stable_cutoff(),
            unstable_cutoff: default_unstable_cutoff(),
            lenient_cutoff: default_lenient_cutoff(),
            fallback_floor_watts: default_fallback_floor_watts(),
            default_min_stable_power: default_min_stable_power(),
            std_scale_watts: default_std_scale_watts(),
            jump_rate_scale_per_hour: default_jump_rate_scale_per_hour(),
            flatline_std_watts: default_flatline_std_watts(),
        }
    }
}

// ---------------------------------------------------------------------------
// Comfort, night window, global decision strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComfortConfig {
    #[serde(default = "default_target_temp")]
    pub target_temp: f64,
    #[serde(default = "default_night_temp")]
    pub night_temp: f64,
    #[serde(default = "default_max_temp_deviation")]
    pub max_temp_deviation: f64,
    #[serde(default = "default_nudge_step")]
    pub nudge_step: f64,
    #[serde(default = "default_stability_setpoint_offset")]
    pub stability_setpoint_offset: f64,
}

fn default_target_temp() -> f64 {
    21.0
}

fn default_night_temp() -> f64 {
    19.0
}

fn default_max_temp_deviation() -> f64 {
    1.5
}

fn default_nudge_step() -> f64 {
    0.3
}

fn default_stability_setpoint_offset() -> f64 {
    0.5
}

impl Default for ComfortConfig {
    fn default() -> Self {
        Self {
            target_temp: default_target_temp(),
            night_temp: default_night_temp(),
            max_temp_deviation: default_max_temp_deviation(),
            nudge_step: default_nudge_step(),
            stability_setpoint_offset: default_stability_setpoint_offset(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NightConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_night_start")]
    pub start: String,
    #[serde(default = "default_night_end")]
    pub end: String,
}

fn default_true() -> bool {
    true
}

fn default_night_start() -> String {
    "23:00".to_string()
}

fn default_night_end() -> String {
    "06:00".to_string()
}

fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let trimmed = raw.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .ok()
}

impl Default for NightConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start: default_night_start(),
            end: default_night_end(),
        }
    }
}

impl NightConfig {
    fn bounds(&self) -> (NaiveTime, NaiveTime) {
        let fallback_start = NaiveTime::from_hms_opt(23, 0, 0).unwrap_or(NaiveTime::MIN);
        let fallback_end = NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN);
        (
            parse_clock(&self.start).unwrap_or(fallback_start),
            parse_clock(&self.end).unwrap_or(fallback_end),
        )
    }

    /// Whether `local` falls inside the quiet-hours window. Windows may wrap midnight.
    pub fn contains(&self, local: NaiveTime) -> bool {
        if !self.enabled {
            return false;
        }
        let (start, end) = self.bounds();
        if start <= end {
            local >= start && local < end
        } else {
            local >= start || local < end
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    #[serde(default = "default_decision_cooldown_minutes")]
    pub cooldown_minutes: i64,
    #[serde(default = "default_decision_emergency_cooldown_minutes")]
    pub emergency_cooldown_minutes: i64,
    #[serde(default = "default_stable_std_watts")]
    pub stable_std_watts: f64,
    #[serde(default = "default_high_spread_watts")]
    pub high_spread_watts: f64,
    #[serde(default = "default_risk_cutoff")]
    pub risk_cutoff: f64,
    #[serde(default = "default_prediction_cutoff")]
    pub prediction_cutoff: f64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_decision_cooldown_minutes() -> i64 {
    10
}

fn default_decision_emergency_cooldown_minutes() -> i64 {
    5
}

fn default_stable_std_watts() -> f64 {
    50.0
}

fn default_high_spread_watts() -> f64 {
    300.0
}

fn default_risk_cutoff() -> f64 {
    0.6
}

fn default_prediction_cutoff() -> f64 {
    0.5
}

fn default_history_limit() -> usize {
    20
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            cooldown_minutes: default_decision_cooldown_minutes(),
            emergency_cooldown_minutes: default_decision_emergency_cooldown_minutes(),
            stable_std_watts: default_stable_std_watts(),
            high_spread_watts: default_high_spread_watts(),
            risk_cutoff: default_risk_cutoff(),
            prediction_cutoff: default_prediction_cutoff(),
            history_limit: default_history_limit(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rooms and per-room rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    pub name: String,
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub temp_sensor: Option<String>,
    /// Lower values are preferred as thermal buffers.
    #[serde(default = "default_room_priority")]
    pub priority: u32,
}

fn default_room_priority() -> u32 {
    50
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    #[default]
    Heat,
    Cool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRulesConfig {
    #[serde(default)]
    pub operating_mode: OperatingMode,
    #[serde(default = "default_tolerance_cold", deserialize_with = "lenient_f64")]
    pub tolerance_cold: f64,
    #[serde(default = "default_tolerance_warm", deserialize_with = "lenient_f64")]
    pub tolerance_warm: f64,
    /// A running room this far above target (heating) is switched off instead of nudged.
    #[serde(default = "default_overheat_tolerance", deserialize_with = "lenient_f64")]
    pub overheat_tolerance: f64,
    #[serde(default = "default_night_idle_tolerance")]
    pub night_idle_tolerance: f64,
    #[serde(default = "default_true")]
    pub night_turn_off: bool,
    #[serde(default = "default_target_step")]
    pub target_step: f64,
    #[serde(default = "default_target_min")]
    pub target_min: f64,
    #[serde(default = "default_target_max")]
    pub target_max: f64,
    #[serde(default = "default_room_cooldown_minutes")]
    pub cooldown_minutes: i64,
    #[serde(default = "default_room_emergency_cooldown_minutes")]
    pub emergency_cooldown_minutes: i64,
    #[serde(default = "default_max_actions_per_cycle")]
    pub max_actions_per_cycle: usize,
    #[serde(default = "default_low_power_watts")]
    pub low_power_watts: f64,
}

fn default_tolerance_cold() -> f64 {
    1.5
}

fn default_tolerance_warm() -> f64 {
    1.0
}

fn default_overheat_tolerance() -> f64 {
    2.0
}

fn default_night_idle_tolerance() -> f64 {
    0.5
}

fn default_target_step() -> f64 {
    0.5
}

fn default_target_min() -> f64 {
    16.0
}

fn default_target_max() -> f64 {
    24.0
}

fn default_room_cooldown_minutes() -> i64 {
    15
}

fn default_room_emergency_cooldown_minutes() -> i64 {
    7
}

fn default_max_actions_per_cycle() -> usize {
    2
}

fn default_low_power_watts() -> f64 {
    400.0
}

impl Default for RoomRulesConfig {
    fn default() -> Self {
        Self {
            operating_mode: OperatingMode::default(),
            tolerance_cold: default_tolerance_cold(),
            tolerance_warm: default_tolerance_warm(),
            overheat_tolerance: default_overheat_tolerance(),
            night_idle_tolerance: default_night_idle_tolerance(),
            night_turn_off: true,
            target_step: default_target_step(),
            target_min: default_target_min(),
            target_max: default_target_max(),
            cooldown_minutes: default_room_cooldown_minutes(),
            emergency_cooldown_minutes: default_room_emergency_cooldown_minutes(),
            max_actions_per_cycle: default_max_actions_per_cycle(),
            low_power_watts: default_low_power_watts(),
        }
    }
}

// ---------------------------------------------------------------------------
// Emergency override
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    #[serde(default = "default_power_std_threshold", deserialize_with = "lenient_f64")]
    pub power_std_threshold: f64,
    #[serde(default = "default_power_range_threshold", deserialize_with = "lenient_f64")]
    pub power_range_threshold: f64,
    #[serde(default = "default_total_deviation_threshold", deserialize_with = "lenient_f64")]
    pub total_deviation_threshold: f64,
    #[serde(default = "default_emergency_window_samples")]
    pub window_samples: usize,
}

pub const DEFAULT_POWER_STD_THRESHOLD: f64 = 300.0;
pub const DEFAULT_POWER_RANGE_THRESHOLD: f64 = 800.0;
pub const DEFAULT_TOTAL_DEVIATION_THRESHOLD: f64 = 6.0;

fn default_power_std_threshold() -> f64 {
    DEFAULT_POWER_STD_THRESHOLD
}

fn default_power_range_threshold() -> f64 {
    DEFAULT_POWER_RANGE_THRESHOLD
}

fn default_total_deviation_threshold() -> f64 {
    DEFAULT_TOTAL_DEVIATION_THRESHOLD
}

fn default_emergency_window_samples() -> usize {
    10
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            power_std_threshold: DEFAULT_POWER_STD_THRESHOLD,
            power_range_threshold: DEFAULT_POWER_RANGE_THRESHOLD,
            total_deviation_threshold: DEFAULT_TOTAL_DEVIATION_THRESHOLD,
            window_samples: default_emergency_window_samples(),
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime scheduling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_control_interval_secs")]
    pub control_interval_secs: u64,
    #[serde(default = "default_discovery_interval_hours")]
    pub discovery_interval_hours: u64,
    #[serde(default = "default_history_days")]
    pub history_days: i64,
    #[serde(default = "default_resample_minutes")]
    pub resample_minutes: i64,
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    #[serde(default)]
    pub episode_log_path: Option<PathBuf>,
    /// Fixed offset for night windows and daily counters; the host zone when unset.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

fn default_control_interval_secs() -> u64 {
    60
}

fn default_discovery_interval_hours() -> u64 {
    24
}

fn default_history_days() -> i64 {
    30
}

fn default_resample_minutes() -> i64 {
    1
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            control_interval_secs: default_control_interval_secs(),
            discovery_interval_hours: default_discovery_interval_hours(),
            history_days: default_history_days(),
            resample_minutes: default_resample_minutes(),
            cache_path: None,
            episode_log_path: None,
            utc_offset_minutes: None,
        }
    }
}

impl RuntimeConfig {
    pub fn control_interval(&self) -> Duration {
        Duration::from_secs(self.control_interval_secs.max(1))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_hours.max(1) * 3600)
    }

    pub fn local_time(&self, ts: DateTime<Utc>) -> NaiveDateTime {
        match self.utc_offset_minutes {
            Some(minutes) => ts.naive_utc() + ChronoDuration::minutes(i64::from(minutes)),
            None => ts.with_timezone(&Local).naive_local(),
        }
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControllerConfig {
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub observer: ObserverConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub comfort: ComfortConfig,
    #[serde(default)]
    pub night: NightConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub rooms: Vec<RoomConfig>,
    #[serde(default)]
    pub room_rules: RoomRulesConfig,
    #[serde(default)]
    pub emergency: EmergencyConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl ControllerConfig {
    /// Loads the JSON config at `path` (or `STABILITY_CONFIG_PATH`), applies env overrides and
    /// validates the result. Without any file the defaults are used.
    pub fn load(path: Option<&Path>) -> StabilityResult<Self> {
        dotenvy::dotenv().ok();

        let config = match path {
            Some(path) => Self::read_file(path)?,
            None => match config_path_from_env() {
                Some(path) if path.exists() => Self::read_file(&path)?,
                Some(path) => {
                    tracing::warn!(
                        path = %path.display(),
                        "stability config not found; using defaults"
                    );
                    Self::default()
                }
                None => Self::default(),
            },
        };

        let mut config = config;
        config.apply_env_overrides();
        Ok(config.validated())
    }

    fn read_file(path: &Path) -> StabilityResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            StabilityError::InvalidConfiguration(format!(
                "failed to read {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&contents).map_err(|err| match err {
            StabilityError::InvalidConfiguration(message) => StabilityError::InvalidConfiguration(
                format!("{}: {message}", path.display()),
            ),
            other => other,
        })
    }

    /// Parses without validating; call [`ControllerConfig::validated`] before use.
    pub fn from_json_str(raw: &str) -> StabilityResult<Self> {
        serde_json::from_str(raw)
            .map_err(|err| StabilityError::InvalidConfiguration(err.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(seed) = env_parsed::<u64>("STABILITY_SEED") {
            self.discovery.seed = seed;
        }
        if let Some(secs) = env_parsed::<u64>("STABILITY_CONTROL_INTERVAL_SECS").filter(|v| *v > 0)
        {
            self.runtime.control_interval_secs = secs;
        }
        if let Ok(path) = env::var("STABILITY_CACHE_PATH") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                self.runtime.cache_path = Some(PathBuf::from(trimmed));
            }
        }
    }

    pub fn room(&self, name: &str) -> Option<&RoomConfig> {
        self.rooms.iter().find(|room| room.name == name)
    }

    /// Priority for a unit; unknown units sort with the default priority.
    pub fn priority_of(&self, name: &str) -> u32 {
        self.room(name)
            .map(|room| room.priority)
            .unwrap_or_else(default_room_priority)
    }

    /// Replaces every invalid value with its default, logging each replacement.
    pub fn validated(mut self) -> Self {
        let s = &mut self.signal;
        s.power_on_threshold = non_negative_or_default(
            s.power_on_threshold,
            default_power_on_threshold(),
            "signal.power_on_threshold",
        );
        s.power_off_threshold = non_negative_or_default(
            s.power_off_threshold,
            default_power_off_threshold(),
            "signal.power_off_threshold",
        );
        if s.power_off_threshold > s.power_on_threshold {
            tracing::warn!(
                on = s.power_on_threshold,
                off = s.power_off_threshold,
                "off threshold above on threshold; restoring hysteresis defaults"
            );
            s.power_on_threshold = default_power_on_threshold();
            s.power_off_threshold = default_power_off_threshold();
        }
        s.jump_threshold_watts = positive_or_default(
            s.jump_threshold_watts,
            default_jump_threshold_watts(),
            "signal.jump_threshold_watts",
        );
        s.jump_threshold_pct = positive_or_default(
            s.jump_threshold_pct,
            default_jump_threshold_pct(),
            "signal.jump_threshold_pct",
        );
        s.window_samples = count_or_default(
            s.window_samples,
            2,
            default_window_samples(),
            "signal.window_samples",
        );
        s.instability_threshold = unit_interval_or_default(
            s.instability_threshold,
            default_instability_threshold(),
            "signal.instability_threshold",
        );
        s.short_cycle_minutes = positive_or_default(
            s.short_cycle_minutes,
            default_short_cycle_minutes(),
            "signal.short_cycle_minutes",
        );

        let o = &mut self.observer;
        o.window_capacity = count_or_default(
            o.window_capacity,
            2,
            default_window_capacity(),
            "observer.window_capacity",
        );
        o.min_samples = count_or_default(
            o.min_samples,
            2,
            default_min_samples(),
            "observer.min_samples",
        )
        .min(o.window_capacity);
        o.score_window = count_or_default(
            o.score_window,
            2,
            default_score_window(),
            "observer.score_window",
        );
        if o.jump_lookback_minutes <= 0 {
            tracing::warn!(value = o.jump_lookback_minutes, "observer.jump_lookback_minutes invalid; using default");
            o.jump_lookback_minutes = default_jump_lookback_minutes();
        }
        o.jump_threshold_watts = positive_or_default(
            o.jump_threshold_watts,
            default_live_jump_threshold_watts(),
            "observer.jump_threshold_watts",
        );
        o.jumps_for_full_score = positive_or_default(
            o.jumps_for_full_score,
            default_jumps_for_full_score(),
            "observer.jumps_for_full_score",
        );
        o.cycling_cutoff = unit_interval_or_default(
            o.cycling_cutoff,
            default_cycling_cutoff(),
            "observer.cycling_cutoff",
        );

        let d = &mut self.discovery;
        d.min_datapoints = count_or_default(
            d.min_datapoints,
            1,
            default_min_datapoints(),
            "discovery.min_datapoints",
        );
        d.min_span_hours = non_negative_or_default(
            d.min_span_hours,
            default_min_span_hours(),
            "discovery.min_span_hours",
        );
        d.feature_window = count_or_default(
            d.feature_window,
            2,
            default_feature_window(),
            "discovery.feature_window",
        );
        d.min_components = count_or_default(
            d.min_components,
            1,
            default_min_components(),
            "discovery.min_components",
        );
        if d.max_components < d.min_components || d.max_components > MAX_REGION_COMPONENTS {
            tracing::warn!(
                min = d.min_components,
                max = d.max_components,
                "component bounds invalid; restoring defaults"
            );
            d.min_components = default_min_components();
            d.max_components = default_max_components();
        }
        d.max_iterations = count_or_default(
            d.max_iterations,
            1,
            default_max_iterations(),
            "discovery.max_iterations",
        );
        d.convergence_tolerance = positive_or_default(
            d.convergence_tolerance,
            default_convergence_tolerance(),
            "discovery.convergence_tolerance",
        );
        d.std_scale_watts = positive_or_default(
            d.std_scale_watts,
            default_std_scale_watts(),
            "discovery.std_scale_watts",
        );
        d.jump_rate_scale_per_hour = positive_or_default(
            d.jump_rate_scale_per_hour,
            default_jump_rate_scale_per_hour(),
            "discovery.jump_rate_scale_per_hour",
        );
        d.stable_cutoff =
            unit_interval_or_default(d.stable_cutoff, default_stable_cutoff(), "discovery.stable_cutoff");
        d.unstable_cutoff = unit_interval_or_default(
            d.unstable_cutoff,
            default_unstable_cutoff(),
            "discovery.unstable_cutoff",
        );
        if d.unstable_cutoff > d.stable_cutoff {
            tracing::warn!("unstable cutoff above stable cutoff; restoring defaults");
            d.stable_cutoff = default_stable_cutoff();
            d.unstable_cutoff = default_unstable_cutoff();
        }
        d.default_min_stable_power = positive_or_default(
            d.default_min_stable_power,
            default_min_stable_power(),
            "discovery.default_min_stable_power",
        );

        let c = &mut self.comfort;
        c.max_temp_deviation = positive_or_default(
            c.max_temp_deviation,
            default_max_temp_deviation(),
            "comfort.max_temp_deviation",
        );
        c.nudge_step =
            positive_or_default(c.nudge_step, default_nudge_step(), "comfort.nudge_step").min(0.5);

        if parse_clock(&self.night.start).is_none() || parse_clock(&self.night.end).is_none() {
            tracing::warn!(
                start = %self.night.start,
                end = %self.night.end,
                "night window unparseable; using 23:00-06:00"
            );
            self.night.start = default_night_start();
            self.night.end = default_night_end();
        }

        let dc = &mut self.decision;
        if dc.cooldown_minutes <= 0 {
            tracing::warn!(value = dc.cooldown_minutes, "decision.cooldown_minutes invalid; using default");
            dc.cooldown_minutes = default_decision_cooldown_minutes();
        }
        if dc.emergency_cooldown_minutes <= 0 || dc.emergency_cooldown_minutes > dc.cooldown_minutes
        {
            tracing::warn!(
                value = dc.emergency_cooldown_minutes,
                "decision.emergency_cooldown_minutes invalid; using default"
            );
            dc.emergency_cooldown_minutes =
                default_decision_emergency_cooldown_minutes().min(dc.cooldown_minutes);
        }

        let r = &mut self.room_rules;
        r.tolerance_cold = positive_or_default(
            r.tolerance_cold,
            default_tolerance_cold(),
            "room_rules.tolerance_cold",
        );
        r.tolerance_warm = positive_or_default(
            r.tolerance_warm,
            default_tolerance_warm(),
            "room_rules.tolerance_warm",
        );
        r.overheat_tolerance = positive_or_default(
            r.overheat_tolerance,
            default_overheat_tolerance(),
            "room_rules.overheat_tolerance",
        );
        if r.overheat_tolerance < r.tolerance_warm {
            tracing::warn!(
                overheat = r.overheat_tolerance,
                warm = r.tolerance_warm,
                "overheat tolerance below warm tolerance; raising it"
            );
            r.overheat_tolerance = r.tolerance_warm;
        }
        r.night_idle_tolerance = non_negative_or_default(
            r.night_idle_tolerance,
            default_night_idle_tolerance(),
            "room_rules.night_idle_tolerance",
        );
        r.target_step =
            positive_or_default(r.target_step, default_target_step(), "room_rules.target_step");
        if !(r.target_min.is_finite() && r.target_max.is_finite()) || r.target_min > r.target_max {
            tracing::warn!(
                min = r.target_min,
                max = r.target_max,
                "setpoint bounds invalid; restoring defaults"
            );
            r.target_min = default_target_min();
            r.target_max = default_target_max();
        }
        if r.cooldown_minutes <= 0 {
            tracing::warn!(value = r.cooldown_minutes, "room_rules.cooldown_minutes invalid; using default");
            r.cooldown_minutes = default_room_cooldown_minutes();
        }
        if r.emergency_cooldown_minutes <= 0 || r.emergency_cooldown_minutes > r.cooldown_minutes {
            tracing::warn!(
                value = r.emergency_cooldown_minutes,
                "room_rules.emergency_cooldown_minutes invalid; using default"
            );
            r.emergency_cooldown_minutes =
                default_room_emergency_cooldown_minutes().min(r.cooldown_minutes);
        }
        r.max_actions_per_cycle = count_or_default(
            r.max_actions_per_cycle,
            1,
            default_max_actions_per_cycle(),
            "room_rules.max_actions_per_cycle",
        );

        let e = &mut self.emergency;
        e.power_std_threshold = positive_or_default(
            e.power_std_threshold,
            DEFAULT_POWER_STD_THRESHOLD,
            "emergency.power_std_threshold",
        );
        e.power_range_threshold = positive_or_default(
            e.power_range_threshold,
            DEFAULT_POWER_RANGE_THRESHOLD,
            "emergency.power_range_threshold",
        );
        e.total_deviation_threshold = positive_or_default(
            e.total_deviation_threshold,
            DEFAULT_TOTAL_DEVIATION_THRESHOLD,
            "emergency.total_deviation_threshold",
        );
        e.window_samples = count_or_default(
            e.window_samples,
            3,
            default_emergency_window_samples(),
            "emergency.window_samples",
        );

        if self.runtime.resample_minutes <= 0 {
            tracing::warn!(value = self.runtime.resample_minutes, "runtime.resample_minutes invalid; using default");
            self.runtime.resample_minutes = default_resample_minutes();
        }
        if self.runtime.history_days <= 0 {
            tracing::warn!(value = self.runtime.history_days, "runtime.history_days invalid; using default");
            self.runtime.history_days = default_history_days();
        }
        if let Some(minutes) = self.runtime.utc_offset_minutes {
            if minutes.abs() > MAX_UTC_OFFSET_MINUTES {
                tracing::warn!(value = minutes, "runtime.utc_offset_minutes out of range; using host zone");
                self.runtime.utc_offset_minutes = None;
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = ControllerConfig::from_json_str("{}").unwrap().validated();
        assert_eq!(config.signal.power_on_threshold, 200.0);
        assert_eq!(config.observer.window_capacity, 120);
        assert_eq!(config.discovery.min_datapoints, 1000);
        assert_eq!(config.room_rules.cooldown_minutes, 15);
        assert_eq!(config.room_rules.emergency_cooldown_minutes, 7);
        assert_eq!(config.emergency.total_deviation_threshold, 6.0);
        assert!(config.rooms.is_empty());
    }

    #[test]
    fn non_positive_emergency_threshold_falls_back_to_default() {
        let config = ControllerConfig::from_json_str(
            r#"{"emergency": {"total_deviation_threshold": -2, "power_std_threshold": 0}}"#,
        )
        .unwrap()
        .validated();
        assert_eq!(config.emergency.total_deviation_threshold, 6.0);
        assert_eq!(config.emergency.power_std_threshold, DEFAULT_POWER_STD_THRESHOLD);
    }

    #[test]
    fn non_numeric_emergency_threshold_falls_back_to_default() {
        let config = ControllerConfig::from_json_str(
            r#"{"emergency": {"total_deviation_threshold": "lots", "power_range_threshold": "650"},
                "room_rules": {"tolerance_cold": null}}"#,
        )
        .unwrap()
        .validated();
        assert_eq!(config.emergency.total_deviation_threshold, 6.0);
        assert_eq!(config.emergency.power_range_threshold, 650.0);
        assert_eq!(config.room_rules.tolerance_cold, 1.5);
    }

    #[test]
    fn inverted_hysteresis_is_repaired() {
        let config = ControllerConfig::from_json_str(
            r#"{"signal": {"power_on_threshold": 100, "power_off_threshold": 400}}"#,
        )
        .unwrap()
        .validated();
        assert_eq!(config.signal.power_on_threshold, 200.0);
        assert_eq!(config.signal.power_off_threshold, 100.0);
    }

    #[test]
    fn night_window_wraps_midnight() {
        let night = NightConfig::default();
        let at = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(night.contains(at(23, 30)));
        assert!(night.contains(at(2, 0)));
        assert!(!night.contains(at(6, 0)));
        assert!(!night.contains(at(14, 0)));

        let disabled = NightConfig {
            enabled: false,
            ..NightConfig::default()
        };
        assert!(!disabled.contains(at(2, 0)));
    }

    #[test]
    fn room_priorities_default_for_unknown_units() {
        let config = ControllerConfig::from_json_str(
            r#"{"rooms": [{"name": "guest", "entity_id": "climate.guest", "priority": 10}]}"#,
        )
        .unwrap();
        assert_eq!(config.priority_of("guest"), 10);
        assert_eq!(config.priority_of("living"), 50);
    }

    #[test]
    fn unreadable_file_is_invalid_configuration() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing.json");
        assert!(matches!(
            ControllerConfig::load(Some(&path)),
            Err(StabilityError::InvalidConfiguration(_))
        ));
    }
}
