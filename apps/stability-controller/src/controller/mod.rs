//! Turns live status, discovered regions and room state into control actions.

pub mod action;
mod cycle;
pub mod emergency;
mod rooms;
mod strategies;


pub use action::{ActionKind, ActionResult, ControlAction, Strategy};
pub use cycle::{CycleInput, CyclePlan};
pub use emergency::{EmergencyAssessment, EmergencyThresholds};
pub use strategies::RegionSummary;

use crate::config::ControllerConfig;
use crate::predictor::RiskPrediction;
use crate::types::{OptimizerStatus, SystemMode};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

const DASHBOARD_HISTORY: usize = 5;

/// Issues actions against the outside world. `Ok(false)` is a refused or failed call.
pub trait ActionExecutor: Send + Sync {
    fn execute(&self, action: &ControlAction) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerStats {
    pub actions_taken: u64,
    pub failed_actions: u64,
    pub emergency_cycles: u64,
    pub suppressed_cycles: u64,
    pub by_strategy: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionView {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub target: Option<String>,
    pub strategy: &'static str,
    pub reason: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerDashboard {
    pub stats: ControllerStats,
    pub last_action: Option<String>,
    pub last_action_time: Option<DateTime<Utc>>,
    pub history: Vec<ActionView>,
}

pub struct DecisionController {
    config: Arc<ControllerConfig>,
    executor: Option<Arc<dyn ActionExecutor>>,
    last_action_time: Option<DateTime<Utc>>,
    room_last_action: HashMap<String, DateTime<Utc>>,
    history: VecDeque<ControlAction>,
    stats: ControllerStats,
}

impl DecisionController {
    pub fn new(config: Arc<ControllerConfig>) -> Self {
        Self {
            config,
            executor: None,
            last_action_time: None,
            room_last_action: HashMap::new(),
            history: VecDeque::new(),
            stats: ControllerStats::default(),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn set_executor(&mut self, executor: Arc<dyn ActionExecutor>) {
        self.executor = Some(executor);
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    pub fn last_action_time(&self) -> Option<DateTime<Utc>> {
        self.last_action_time
    }

    fn global_cooldown(&self, emergency: bool) -> ChronoDuration {
        let d = &self.config.decision;
        ChronoDuration::minutes(if emergency {
            d.emergency_cooldown_minutes
        } else {
            d.cooldown_minutes
        })
    }

    /// False in observation or manual mode and while the controller-wide cooldown runs.
    pub fn should_act(&self, status: &OptimizerStatus, now: DateTime<Utc>, emergency: bool) -> bool {
        if matches!(status.mode, SystemMode::Observation | SystemMode::Manual) {
            return false;
        }
        match self.last_action_time {
            Some(last) => now - last >= self.global_cooldown(emergency),
            None => true,
        }
    }

    /// First non-empty result of the gate, night, stability-targeting and nudge strategies.
    pub fn decide_action(
        &self,
        status: &OptimizerStatus,
        prediction: &RiskPrediction,
        summary: &RegionSummary,
        now: DateTime<Utc>,
    ) -> ControlAction {
        strategies::decide(&self.config, status, prediction, summary, now, &|_| false)
    }

    pub fn execute_action(&mut self, action: ControlAction, now: DateTime<Utc>) -> ActionResult {
        if action.is_no_action() {
            return ActionResult {
                success: true,
                message: "no action needed".to_string(),
                action,
            };
        }
        let Some(executor) = self.executor.clone() else {
            return self.record_missing_executor(action);
        };
        let outcome = executor.execute(&action);
        self.record_outcome(action, outcome, now)
    }

    pub fn executor(&self) -> Option<Arc<dyn ActionExecutor>> {
        self.executor.clone()
    }

    pub(crate) fn record_missing_executor(&mut self, action: ControlAction) -> ActionResult {
        self.stats.failed_actions += 1;
        ActionResult {
            success: false,
            message: "no action executor configured".to_string(),
            action,
        }
    }

    /// Books the executor's answer for `action`: stats, cooldowns and history on success.
    pub fn record_outcome(
        &mut self,
        action: ControlAction,
        outcome: anyhow::Result<bool>,
        now: DateTime<Utc>,
    ) -> ActionResult {
        match outcome {
            Ok(true) => {
                self.record_success(&action, now);
                tracing::info!(
                    kind = action.kind.as_str(),
                    unit = action.target_unit.as_deref().unwrap_or("-"),
                    strategy = action.strategy.as_str(),
                    emergency = action.emergency,
                    reason = %action.reason,
                    "action executed"
                );
                ActionResult {
                    success: true,
                    message: "executed".to_string(),
                    action,
                }
            }
            Ok(false) => {
                self.stats.failed_actions += 1;
                tracing::warn!(
                    kind = action.kind.as_str(),
                    unit = action.target_unit.as_deref().unwrap_or("-"),
                    "executor refused action"
                );
                ActionResult {
                    success: false,
                    message: "executor reported failure".to_string(),
                    action,
                }
            }
            Err(err) => {
                self.stats.failed_actions += 1;
                tracing::warn!(
                    error = %format!("{err:#}"),
                    kind = action.kind.as_str(),
                    "action execution failed"
                );
                ActionResult {
                    success: false,
                    message: format!("{err:#}"),
                    action,
                }
            }
        }
    }

    fn record_success(&mut self, action: &ControlAction, now: DateTime<Utc>) {
        self.last_action_time = Some(now);
        if let Some(unit) = &action.target_unit {
            self.room_last_action.insert(unit.clone(), now);
        }
        self.stats.actions_taken += 1;
        *self
            .stats
            .by_strategy
            .entry(action.strategy.as_str().to_string())
            .or_insert(0) += 1;
        if self.history.len() >= self.config.decision.history_limit.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(action.clone());
    }

    pub fn execute_plan(&mut self, plan: &CyclePlan, now: DateTime<Utc>) -> Vec<ActionResult> {
        plan.actions
            .iter()
            .cloned()
            .map(|action| self.execute_action(action, now))
            .collect()
    }

    pub fn dashboard(&self) -> ControllerDashboard {
        let skip = self.history.len().saturating_sub(DASHBOARD_HISTORY);
        ControllerDashboard {
            stats: self.stats.clone(),
            last_action: self.history.back().map(|a| a.reason.clone()),
            last_action_time: self.last_action_time,
            history: self
                .history
                .iter()
                .skip(skip)
                .map(|a| ActionView {
                    kind: a.kind.as_str(),
                    target: a.target_unit.clone(),
                    strategy: a.strategy.as_str(),
                    reason: a.reason.clone(),
                    time: a.timestamp,
                })
                .collect(),
        }
    }
}
