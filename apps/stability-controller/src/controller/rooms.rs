//! Per-room comfort rules with room-level cooldowns and a per-cycle cap.

use super::action::{ActionKind, ControlAction, Strategy};
use crate::config::{OperatingMode, RoomRulesConfig};
use crate::types::{OptimizerStatus, UnitStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

pub(super) struct RoomContext<'a> {
    pub rules: &'a RoomRulesConfig,
    pub night: bool,
    pub emergency: bool,
    pub now: DateTime<Utc>,
    pub room_last_action: &'a HashMap<String, DateTime<Utc>>,
}

impl RoomContext<'_> {
    pub(super) fn cooldown(&self) -> ChronoDuration {
        let minutes = if self.emergency {
            self.rules.emergency_cooldown_minutes
        } else {
            self.rules.cooldown_minutes
        };
        ChronoDuration::minutes(minutes)
    }

    pub(super) fn in_cooldown(&self, unit: &str) -> bool {
        self.room_last_action
            .get(unit)
            .map(|last| self.now - *last < self.cooldown())
            .unwrap_or(false)
    }
}

fn clamp_target(rules: &RoomRulesConfig, value: f64) -> f64 {
    ((value.clamp(rules.target_min, rules.target_max)) * 10.0).round() / 10.0
}

/// Whether comfort rules own this unit this cycle (it sits outside its tolerance band).
pub(super) fn comfort_owns(rules: &RoomRulesConfig, unit: &UnitStatus) -> bool {
    unit.delta()
        .map(|delta| delta < -rules.tolerance_cold || delta > rules.tolerance_warm)
        .unwrap_or(false)
}

fn room_action(ctx: &RoomContext<'_>, unit: &UnitStatus, power: f64) -> Option<ControlAction> {
    let rules = ctx.rules;
    let (Some(delta), Some(target)) = (unit.delta(), unit.target_temp) else {
        return None;
    };
    let heating = rules.operating_mode == OperatingMode::Heat;
    // Positive when the room has passed its target in the direction the plant pushes it.
    let overshoot = if heating { delta } else { -delta };
    let name = unit.name.as_str();
    let step = rules.target_step;

    if unit.is_on && overshoot > rules.overheat_tolerance {
        return Some(ControlAction::for_unit(
            ActionKind::DisableUnit,
            name,
            Strategy::OverheatPrevention,
            format!("{name} overshooting target by {:.1} K, switching off", overshoot),
            ctx.now,
        ));
    }

    if delta < -rules.tolerance_cold {
        let turn_on = heating && !unit.is_on;
        if turn_on {
            return Some(ControlAction::for_unit(
                ActionKind::EnableUnit {
                    temperature: clamp_target(rules, target),
                    fan_mode: None,
                },
                name,
                Strategy::TooCold,
                format!("{name} too cold ({delta:+.1} K), switching on"),
                ctx.now,
            ));
        }
        if unit.is_on {
            let next = clamp_target(rules, target + step);
            if (next - target).abs() > 1e-9 {
                return Some(ControlAction::for_unit(
                    ActionKind::AdjustTemp {
                        temperature: next,
                        previous: Some(target),
                    },
                    name,
                    Strategy::TooCold,
                    format!("{name} too cold ({delta:+.1} K), target {target:.1} -> {next:.1} C"),
                    ctx.now,
                ));
            }
        }
        return None;
    }

    if delta > rules.tolerance_warm {
        let turn_on = !heating && !unit.is_on;
        if turn_on {
            return Some(ControlAction::for_unit(
                ActionKind::EnableUnit {
                    temperature: clamp_target(rules, target),
                    fan_mode: None,
                },
                name,
                Strategy::TooWarm,
                format!("{name} too warm ({delta:+.1} K), switching on"),
                ctx.now,
            ));
        }
        if unit.is_on {
            let next = clamp_target(rules, target - step);
            if (next - target).abs() > 1e-9 {
                return Some(ControlAction::for_unit(
                    ActionKind::AdjustTemp {
                        temperature: next,
                        previous: Some(target),
                    },
                    name,
                    Strategy::TooWarm,
                    format!("{name} too warm ({delta:+.1} K), target {target:.1} -> {next:.1} C"),
                    ctx.now,
                ));
            }
        }
        return None;
    }

    if ctx.night
        && rules.night_turn_off
        && unit.is_on
        && (0.0..=rules.night_idle_tolerance).contains(&overshoot)
    {
        return Some(ControlAction::for_unit(
            ActionKind::DisableUnit,
            name,
            Strategy::NightIdle,
            format!("night mode: {name} at target ({delta:+.1} K), safe to idle"),
            ctx.now,
        ));
    }

    if power < rules.low_power_watts && !unit.is_on && overshoot < 0.0 {
        return Some(ControlAction::for_unit(
            ActionKind::EnableUnit {
                temperature: clamp_target(rules, target),
                fan_mode: None,
            },
            name,
            Strategy::LoadSupport,
            format!(
                "load support: {name} switched on at {power:.0} W to add stabilising load"
            ),
            ctx.now,
        ));
    }

    None
}

/// At most one action per room, capped per cycle with the largest deviations kept first.
pub(super) fn plan(ctx: &RoomContext<'_>, status: &OptimizerStatus) -> Vec<ControlAction> {
    let mut candidates: Vec<(f64, ControlAction)> = status
        .units
        .values()
        .filter(|unit| !ctx.in_cooldown(&unit.name))
        .filter_map(|unit| {
            let deviation = unit.delta().map(f64::abs).unwrap_or(0.0);
            room_action(ctx, unit, status.power_consumption).map(|action| (deviation, action))
        })
        .map(|(deviation, mut action)| {
            action.emergency = ctx.emergency;
            (deviation, action)
        })
        .collect();

    if candidates.len() > ctx.rules.max_actions_per_cycle {
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
        candidates.truncate(ctx.rules.max_actions_per_cycle);
    }
    candidates.into_iter().map(|(_, action)| action).collect()
}

const BOOST_FAN_MODE: &str = "high";

/// Last-resort action for an emergency cycle that planned nothing: the comfort-owned unit with
/// the largest deviation gets pushed harder or held off, even when its setpoint is already at
/// the bound or the unit cannot move the room in the needed direction.
pub(super) fn escalate(ctx: &RoomContext<'_>, status: &OptimizerStatus) -> Option<ControlAction> {
    let rules = ctx.rules;
    let unit = status
        .units
        .values()
        .filter(|unit| comfort_owns(rules, unit) && !ctx.in_cooldown(&unit.name))
        .max_by(|a, b| {
            let da = a.delta().map(f64::abs).unwrap_or(0.0);
            let db = b.delta().map(f64::abs).unwrap_or(0.0);
            da.total_cmp(&db)
        })?;
    let delta = unit.delta()?;
    let target = unit.target_temp?;
    let heating = rules.operating_mode == OperatingMode::Heat;
    let name = unit.name.as_str();
    // The room needs more of what the plant produces.
    let needs_output = if heating {
        delta < -rules.tolerance_cold
    } else {
        delta > rules.tolerance_warm
    };
    let bound = if heating { rules.target_max } else { rules.target_min };

    let kind = if !needs_output {
        ActionKind::DisableUnit
    } else if !unit.is_on {
        ActionKind::EnableUnit {
            temperature: clamp_target(rules, bound),
            fan_mode: Some(BOOST_FAN_MODE.to_string()),
        }
    } else if unit.fan_mode.as_deref() != Some(BOOST_FAN_MODE) {
        ActionKind::AdjustFan {
            fan_mode: BOOST_FAN_MODE.to_string(),
        }
    } else {
        ActionKind::AdjustTemp {
            temperature: clamp_target(rules, bound),
            previous: Some(target),
        }
    };
    let reason = match &kind {
        ActionKind::DisableUnit if unit.is_on => {
            format!("emergency: {name} off target ({delta:+.1} K), switching off")
        }
        ActionKind::DisableUnit => {
            format!("emergency: {name} off target ({delta:+.1} K), holding off")
        }
        ActionKind::AdjustFan { .. } => {
            format!("emergency: {name} off target ({delta:+.1} K) at setpoint bound, fan boosted")
        }
        _ => format!("emergency: {name} off target ({delta:+.1} K), driving to {bound:.1} C"),
    };
    tracing::warn!(unit = name, delta, "emergency escalation");

    let mut action = ControlAction::for_unit(
        kind,
        name,
        Strategy::EmergencyEscalation,
        reason,
        ctx.now,
    );
    action.emergency = true;
    Some(action)
}
