//! Runtime wiring: collaborator traits, the published analysis snapshot, mode supervision and
//! the periodic control and discovery loops.

use crate::config::{ControllerConfig, RoomConfig};
use crate::controller::{
    ActionExecutor, ControlAction, ControllerDashboard, CycleInput, CyclePlan, DecisionController,
};
use crate::counters::DailyCounters;
use crate::discovery::{AnalysisCache, AnalysisResult, DashboardView, RegionClass, RegionDiscovery};
use crate::episode::{EpisodeLog, EpisodeRecord};
use crate::error::StabilityError;
use crate::observer::{LiveObserver, ObserverSummary};
use crate::predictor::RiskPredictor;
use crate::types::{ensure_monotonic, PowerSample, SystemMode, UnitUpdate};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Latest aggregate compressor power. `None` when the sensor is unavailable.
pub trait PowerSource: Send + Sync {
    fn read_power(&self) -> Option<PowerSample>;
}

/// Current state of one room's unit. Sources may fill only the fields they know.
pub trait RoomSource: Send + Sync {
    fn read_room(&self, room: &RoomConfig) -> Option<UnitUpdate>;
}

pub trait HistorySource: Send + Sync {
    fn fetch_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resample: ChronoDuration,
    ) -> Result<Vec<PowerSample>>;

    /// Auxiliary series joined onto discovered regions, e.g. outdoor temperature.
    fn fetch_exogenous(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _resample: ChronoDuration,
    ) -> Result<Option<Vec<PowerSample>>> {
        Ok(None)
    }
}

/// Single-writer snapshot of the last discovery. Readers clone the `Arc` and never see a
/// partially updated result.
#[derive(Clone)]
pub struct AnalysisHandle {
    inner: Arc<RwLock<Arc<AnalysisResult>>>,
}

impl AnalysisHandle {
    pub fn new(initial: AnalysisResult) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub async fn current(&self) -> Arc<AnalysisResult> {
        self.inner.read().await.clone()
    }

    pub async fn publish(&self, result: AnalysisResult) -> Arc<AnalysisResult> {
        let next = Arc::new(result);
        *self.inner.write().await = next.clone();
        next
    }
}

impl Default for AnalysisHandle {
    fn default() -> Self {
        Self::new(AnalysisResult::pending())
    }
}

pub struct ModeSupervisor;

impl ModeSupervisor {
    pub fn next_mode(current: SystemMode, analysis: &AnalysisResult) -> SystemMode {
        if current == SystemMode::Manual {
            return SystemMode::Manual;
        }
        if !analysis.sufficient_data {
            return SystemMode::Observation;
        }
        let has_stable = analysis
            .regions
            .iter()
            .any(|region| region.class == RegionClass::Stable);
        match analysis.min_stable_power {
            Some(_) if has_stable => SystemMode::Active,
            _ => SystemMode::Learning,
        }
    }
}

pub struct Collaborators {
    pub power: Arc<dyn PowerSource>,
    pub rooms: Arc<dyn RoomSource>,
    pub history: Arc<dyn HistorySource>,
    pub executor: Arc<dyn ActionExecutor>,
    pub predictor: Arc<dyn RiskPredictor>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Skipped {
        reason: String,
    },
    Planned {
        plan: CyclePlan,
        executed: usize,
        failed: usize,
        dry_run: bool,
    },
}

impl TickOutcome {
    fn skipped(err: &StabilityError) -> Self {
        tracing::warn!(error = %err, "control cycle skipped");
        TickOutcome::Skipped {
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub observer: ObserverSummary,
    pub counters: Option<DailyCounters>,
    pub controller: ControllerDashboard,
    pub analysis: DashboardView,
    pub last_plan: Option<CyclePlan>,
}

struct LiveState {
    observer: LiveObserver,
    controller: DecisionController,
    counters: Option<DailyCounters>,
    last_plan: Option<CyclePlan>,
}

#[derive(Clone)]
pub struct StabilityService {
    config: Arc<ControllerConfig>,
    live: Arc<Mutex<LiveState>>,
    analysis: AnalysisHandle,
    discovery: RegionDiscovery,
    power: Arc<dyn PowerSource>,
    rooms: Arc<dyn RoomSource>,
    history: Arc<dyn HistorySource>,
    predictor: Arc<dyn RiskPredictor>,
    cache: Option<AnalysisCache>,
    episodes: Option<EpisodeLog>,
}

impl StabilityService {
    pub fn new(config: Arc<ControllerConfig>, collaborators: Collaborators) -> Self {
        let observer = LiveObserver::new(config.observer.clone(), config.signal.clone());
        let controller =
            DecisionController::new(config.clone()).with_executor(collaborators.executor);
        Self {
            live: Arc::new(Mutex::new(LiveState {
                observer,
                controller,
                counters: None,
                last_plan: None,
            })),
            analysis: AnalysisHandle::default(),
            discovery: RegionDiscovery::new(config.discovery.clone()),
            power: collaborators.power,
            rooms: collaborators.rooms,
            history: collaborators.history,
            predictor: collaborators.predictor,
            cache: config.runtime.cache_path.clone().map(AnalysisCache::new),
            episodes: config.runtime.episode_log_path.clone().map(EpisodeLog::new),
            config,
        }
    }

    pub fn analysis(&self) -> AnalysisHandle {
        self.analysis.clone()
    }

    pub async fn mode(&self) -> SystemMode {
        self.live.lock().await.observer.status().mode
    }

    /// Publishes a cached analysis if one exists. Returns whether it did.
    pub async fn restore_cached(&self) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        match cache.load() {
            Ok(Some(result)) => {
                tracing::info!(
                    path = %cache.path().display(),
                    analysed_at = %result.analysis_timestamp,
                    min_stable_power = ?result.min_stable_power,
                    "restored cached analysis"
                );
                self.publish_analysis(result).await;
                true
            }
            Ok(None) => false,
            Err(err) => {
                tracing::warn!("analysis cache read failed: {err:#}");
                false
            }
        }
    }

    /// Swaps in a new analysis and lets the supervisor pick the mode that fits it.
    pub async fn publish_analysis(&self, result: AnalysisResult) -> Arc<AnalysisResult> {
        let published = self.analysis.publish(result).await;
        let mut live = self.live.lock().await;
        let next = ModeSupervisor::next_mode(live.observer.status().mode, &published);
        live.observer.set_mode(next);
        published
    }

    /// Operator override. Leaving manual mode hands the decision back to the supervisor.
    pub async fn set_manual(&self, manual: bool) {
        if manual {
            self.live.lock().await.observer.set_mode(SystemMode::Manual);
            return;
        }
        let analysis = self.analysis.current().await;
        let mut live = self.live.lock().await;
        let next = ModeSupervisor::next_mode(SystemMode::Observation, &analysis);
        live.observer.set_mode(next);
    }

    /// Fetches history ending at `now`, runs discovery off the async runtime, caches and
    /// publishes the result.
    pub async fn run_discovery(&self, now: DateTime<Utc>) -> Result<Arc<AnalysisResult>> {
        let runtime = &self.config.runtime;
        let start = now - ChronoDuration::days(runtime.history_days);
        let resample = ChronoDuration::minutes(runtime.resample_minutes);
        let history = self.history.clone();
        let discovery = self.discovery.clone();
        let cache = self.cache.clone();

        tracing::info!(%start, end = %now, "region discovery started");
        let result = tokio::task::spawn_blocking(move || -> Result<AnalysisResult> {
            let series = history
                .fetch_history(start, now, resample)
                .context("fetch power history")?;
            ensure_monotonic(&series).context("power history out of order; discovery skipped")?;
            let exogenous = history
                .fetch_exogenous(start, now, resample)
                .context("fetch exogenous history")?;
            let result = discovery.discover(&series, exogenous.as_deref());
            if let Some(cache) = cache {
                if let Err(err) = cache.save(&result) {
                    tracing::warn!("analysis cache write failed: {err:#}");
                }
            }
            Ok(result)
        })
        .await
        .context("discovery task panicked")??;

        tracing::info!(
            regions = result.regions.len(),
            min_stable_power = ?result.min_stable_power,
            sufficient = result.sufficient_data,
            method = ?result.method,
            "region discovery finished"
        );
        Ok(self.publish_analysis(result).await)
    }

    /// Power first, then every room, on the blocking pool. `None` when there is no power reading.
    async fn read_inputs(&self) -> Result<Option<(PowerSample, Vec<(String, UnitUpdate)>)>> {
        let power = self.power.clone();
        let rooms = self.rooms.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let reading = power.read_power()?;
            let updates = config
                .rooms
                .iter()
                .filter_map(|room| match rooms.read_room(room) {
                    Some(mut update) => {
                        update.entity_id.get_or_insert_with(|| room.entity_id.clone());
                        Some((room.name.clone(), update))
                    }
                    None => {
                        tracing::debug!(room = %room.name, "room reading unavailable; keeping last state");
                        None
                    }
                })
                .collect();
            Some((reading, updates))
        })
        .await
        .context("collaborator read task panicked")
    }

    /// One control cycle: read, observe, plan, then execute (active) or log (learning).
    /// The live state is locked only for observing, planning and booking outcomes.
    pub async fn tick(&self) -> TickOutcome {
        let (reading, updates) = match self.read_inputs().await {
            Ok(Some(inputs)) => inputs,
            Ok(None) => {
                return TickOutcome::skipped(&StabilityError::DataUnavailable(
                    "power sensor returned no reading".to_string(),
                ))
            }
            Err(err) => {
                return TickOutcome::skipped(&StabilityError::DataUnavailable(format!("{err:#}")))
            }
        };
        let analysis = self.analysis.current().await;
        let now = reading.timestamp;
        let local = self.config.runtime.local_time(now);

        let (status, plan, executor) = {
            let mut guard = self.live.lock().await;
            let live = &mut *guard;
            if let Err(err) = live.observer.update_power(reading.watts, now) {
                return TickOutcome::skipped(&err);
            }
            let counters = live
                .counters
                .get_or_insert_with(|| DailyCounters::new(local.date()));
            counters.roll_over(local.date());
            counters.record_power(reading.watts, now, &self.config.signal);
            for (name, update) in updates {
                live.observer.update_unit(&name, update);
            }

            let window = self
                .config
                .emergency
                .window_samples
                .max(self.config.observer.score_window);
            let recent = live.observer.recent_samples(window);
            let values: Vec<f64> = recent.iter().map(|s| s.watts).collect();
            let prediction = self.predictor.predict_risk(&recent);
            let status = live.observer.status().clone();

            let plan = live.controller.plan_cycle(&CycleInput {
                status: &status,
                recent: &values,
                analysis: &analysis,
                prediction: &prediction,
                now,
                local_time: local.time(),
            });
            (status, plan, live.controller.executor())
        };
        tracing::debug!(
            mode = status.mode.as_str(),
            power_w = status.power_consumption,
            actions = plan.actions.len(),
            reason = %plan.reason,
            "control cycle planned"
        );

        let (mut executed, mut failed, mut dry_run) = (0, 0, false);
        match status.mode {
            SystemMode::Active => {
                let actions: Vec<ControlAction> = plan
                    .actions
                    .iter()
                    .filter(|action| !action.is_no_action())
                    .cloned()
                    .collect();
                let outcomes = match executor {
                    Some(executor) => execute_blocking(executor, actions).await,
                    None => actions.into_iter().map(|action| (action, None)).collect(),
                };
                let mut guard = self.live.lock().await;
                let live = &mut *guard;
                for (action, outcome) in outcomes {
                    let result = match outcome {
                        Some(outcome) => live.controller.record_outcome(action, outcome, now),
                        None => live.controller.record_missing_executor(action),
                    };
                    if let Some(counters) = live.counters.as_mut() {
                        counters.record_action(result.success);
                    }
                    if result.success {
                        executed += 1;
                    } else {
                        failed += 1;
                    }
                }
            }
            SystemMode::Learning => {
                dry_run = !plan.actions.is_empty();
                for action in &plan.actions {
                    tracing::info!(
                        kind = action.kind.as_str(),
                        unit = action.target_unit.as_deref().unwrap_or("-"),
                        strategy = action.strategy.as_str(),
                        reason = %action.reason,
                        "dry run: action not executed"
                    );
                }
            }
            SystemMode::Observation | SystemMode::Manual => {}
        }

        if let Some(log) = self.episodes.clone() {
            let band = analysis
                .unstable_band_containing(status.power_consumption)
                .map(|region| region.name.clone());
            let record = EpisodeRecord::new(
                &status,
                plan.actions.clone(),
                executed > 0,
                band,
                plan.emergency.is_emergency(),
                now,
            );
            match tokio::task::spawn_blocking(move || log.append(&record)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!("episode log write failed: {err:#}"),
                Err(err) => tracing::warn!("episode log task panicked: {err}"),
            }
        }

        self.live.lock().await.last_plan = Some(plan.clone());
        TickOutcome::Planned {
            plan,
            executed,
            failed,
            dry_run,
        }
    }

    pub async fn snapshot(&self) -> ServiceSnapshot {
        let analysis = self.analysis.current().await;
        let live = self.live.lock().await;
        ServiceSnapshot {
            observer: live.observer.summary(),
            counters: live.counters.clone(),
            controller: live.controller.dashboard(),
            analysis: analysis.dashboard(self.config.discovery.dashboard_stable_cutoff),
            last_plan: live.last_plan.clone(),
        }
    }

    /// Spawns the discovery loop (cache restore first) and the control loop.
    pub fn start(self, cancel: CancellationToken) {
        let discovery = self.clone();
        let discovery_cancel = cancel.clone();
        tokio::spawn(async move {
            discovery.restore_cached().await;
            let mut ticker = tokio::time::interval(discovery.config.runtime.discovery_interval());
            loop {
                tokio::select! {
                    _ = discovery_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = discovery.run_discovery(Utc::now()).await {
                            tracing::warn!("region discovery failed: {err:#}");
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.runtime.control_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
            tracing::info!("control loop stopped");
        });
    }
}

type ExecutionOutcome = (ControlAction, Option<Result<bool>>);

/// Runs actions in order on the blocking pool. A panicking executor fails every action.
async fn execute_blocking(
    executor: Arc<dyn ActionExecutor>,
    actions: Vec<ControlAction>,
) -> Vec<ExecutionOutcome> {
    if actions.is_empty() {
        return Vec::new();
    }
    let fallback = actions.clone();
    let task = tokio::task::spawn_blocking(move || {
        actions
            .into_iter()
            .map(|action| {
                let outcome = executor.execute(&action);
                (action, Some(outcome))
            })
            .collect::<Vec<_>>()
    });
    match task.await {
        Ok(outcomes) => outcomes,
        Err(err) => {
            let message = format!("executor task panicked: {err}");
            fallback
                .into_iter()
                .map(|action| (action, Some(Err(anyhow::anyhow!(message.clone())))))
                .collect()
        }
    }
}
