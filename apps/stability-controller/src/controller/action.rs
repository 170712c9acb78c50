use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    EnableUnit {
        temperature: f64,
        fan_mode: Option<String>,
    },
    DisableUnit,
    AdjustTemp {
        temperature: f64,
        previous: Option<f64>,
    },
    AdjustFan {
        fan_mode: String,
    },
    NoAction,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::EnableUnit { .. } => "enable_unit",
            ActionKind::DisableUnit => "disable_unit",
            ActionKind::AdjustTemp { .. } => "adjust_temp",
            ActionKind::AdjustFan { .. } => "adjust_fan",
            ActionKind::NoAction => "no_action",
        }
    }
}

/// Which rule produced an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Gate,
    NightBuffer,
    StabilityTargeting,
    GradualNudge,
    NoStrategy,
    NightIdle,
    OverheatPrevention,
    TooCold,
    TooWarm,
    LoadSupport,
    EmergencyEscalation,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Gate => "gate",
            Strategy::NightBuffer => "night_buffer",
            Strategy::StabilityTargeting => "stability_targeting",
            Strategy::GradualNudge => "gradual_nudge",
            Strategy::NoStrategy => "no_strategy",
            Strategy::NightIdle => "night_idle",
            Strategy::OverheatPrevention => "overheat_prevention",
            Strategy::TooCold => "too_cold",
            Strategy::TooWarm => "too_warm",
            Strategy::LoadSupport => "load_support",
            Strategy::EmergencyEscalation => "emergency_escalation",
        }
    }

    /// Comfort and safety rules outrank stability rules for the same unit.
    pub fn is_comfort(&self) -> bool {
        matches!(
            self,
            Strategy::OverheatPrevention
                | Strategy::TooCold
                | Strategy::TooWarm
                | Strategy::EmergencyEscalation
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlAction {
    pub kind: ActionKind,
    pub target_unit: Option<String>,
    pub strategy: Strategy,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub emergency: bool,
}

impl ControlAction {
    pub fn none(strategy: Strategy, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            kind: ActionKind::NoAction,
            target_unit: None,
            strategy,
            reason: reason.into(),
            timestamp: now,
            emergency: false,
        }
    }

    pub fn for_unit(
        kind: ActionKind,
        unit: &str,
        strategy: Strategy,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            target_unit: Some(unit.to_string()),
            strategy,
            reason: reason.into(),
            timestamp: now,
            emergency: false,
        }
    }

    pub fn is_no_action(&self) -> bool {
        matches!(self.kind, ActionKind::NoAction)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub action: ControlAction,
    pub message: String,
}
