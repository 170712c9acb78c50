use super::emergency::{self, EmergencyAssessment, EmergencyThresholds};
use super::rooms::{self, RoomContext};
use super::strategies::{self, RegionSummary};
use super::{ControlAction, DecisionController};
use crate::discovery::AnalysisResult;
use crate::predictor::RiskPrediction;
use crate::types::{OptimizerStatus, SystemMode};
use chrono::{DateTime, NaiveTime, Utc};
use serde::Serialize;
use std::collections::HashSet;

pub struct CycleInput<'a> {
    pub status: &'a OptimizerStatus,
    /// Most recent power values, oldest first.
    pub recent: &'a [f64],
    pub analysis: &'a AnalysisResult,
    pub prediction: &'a RiskPrediction,
    pub now: DateTime<Utc>,
    pub local_time: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CyclePlan {
    pub emergency: EmergencyAssessment,
    /// Name of the unstable region that held this cycle back.
    pub suppressed_by: Option<String>,
    pub actions: Vec<ControlAction>,
    pub reason: String,
}

impl CyclePlan {
    fn idle(reason: String, emergency: EmergencyAssessment) -> Self {
        Self {
            emergency,
            suppressed_by: None,
            actions: Vec::new(),
            reason,
        }
    }
}

impl DecisionController {
    /// One control cycle: emergency check, unstable-band wait, room rules, then at most one
    /// global strategy action for a unit the room rules left alone. An emergency cycle that
    /// found nothing escalates on the worst room.
    pub fn plan_cycle(&mut self, input: &CycleInput<'_>) -> CyclePlan {
        let status = input.status;
        if matches!(status.mode, SystemMode::Observation | SystemMode::Manual) {
            return CyclePlan::idle(
                format!("{} mode: observing only", status.mode.as_str()),
                EmergencyAssessment::default(),
            );
        }

        let config = self.config.clone();
        let window_len = config.emergency.window_samples;
        let window = &input.recent[input.recent.len().saturating_sub(window_len)..];
        let thresholds = EmergencyThresholds::from_config(&config);
        let assessment = emergency::assess(status.units.values(), window, &thresholds);
        let is_emergency = assessment.is_emergency();
        if is_emergency {
            self.stats.emergency_cycles += 1;
            tracing::warn!(reasons = ?assessment.reasons, "emergency cycle");
        }

        if !is_emergency {
            if let Some(region) = input.analysis.unstable_band_containing(status.power_consumption) {
                self.stats.suppressed_cycles += 1;
                let name = region.name.clone();
                return CyclePlan {
                    reason: format!(
                        "{:.0} W is inside unstable band {name}; waiting",
                        status.power_consumption
                    ),
                    suppressed_by: Some(name),
                    emergency: assessment,
                    actions: Vec::new(),
                };
            }
        }

        let ctx = RoomContext {
            rules: &config.room_rules,
            night: config.night.contains(input.local_time),
            emergency: is_emergency,
            now: input.now,
            room_last_action: &self.room_last_action,
        };
        let mut actions = rooms::plan(&ctx, status);
        let mut notes = Vec::new();

        if actions.len() < config.room_rules.max_actions_per_cycle
            && self.should_act(status, input.now, is_emergency)
        {
            let min_stable = input
                .analysis
                .min_stable_power
                .unwrap_or(config.discovery.default_min_stable_power);
            let summary = RegionSummary::from_recent(window, min_stable, input.local_time);
            let taken: HashSet<String> = actions
                .iter()
                .filter_map(|a| a.target_unit.clone())
                .collect();
            let blocked = |name: &str| {
                taken.contains(name)
                    || ctx.in_cooldown(name)
                    || status
                        .units
                        .get(name)
                        .map(|unit| rooms::comfort_owns(&config.room_rules, unit))
                        .unwrap_or(false)
            };
            let mut global =
                strategies::decide(&config, status, input.prediction, &summary, input.now, &blocked);
            if global.is_no_action() {
                notes.push(global.reason);
            } else {
                global.emergency = is_emergency;
                actions.push(global);
            }
        } else if actions.is_empty() {
            notes.push("controller cooldown active".to_string());
        }

        if is_emergency && actions.is_empty() {
            actions.extend(rooms::escalate(&ctx, status));
        }

        let reason = if actions.is_empty() {
            if notes.is_empty() {
                "no action needed".to_string()
            } else {
                notes.join("; ")
            }
        } else {
            actions
                .iter()
                .map(|a| a.reason.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        };

        CyclePlan {
            emergency: assessment,
            suppressed_by: None,
            actions,
            reason,
        }
    }
}
