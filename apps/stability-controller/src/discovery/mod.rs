//! Unsupervised discovery of stable and oscillating power bands from history.

mod binning;
pub mod cache;
mod mixture;

#[cfg(test)]
mod tests;

pub use cache::AnalysisCache;

use crate::config::DiscoveryConfig;
use crate::rolling::{mean, percentile, trailing_stats};
use crate::types::{clean_series, PowerSample};
use chrono::{DateTime, Utc};
use mixture::{select_mixture, standardize, FitOptions, Point};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionClass {
    Stable,
    Moderate,
    Unstable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionConditions {
    pub avg_power: f64,
    pub avg_std: f64,
    pub avg_spread: f64,
    pub p10_power: f64,
    pub p90_power: f64,
    /// Mean of the exogenous series (e.g. outdoor temperature) while in this region.
    pub avg_exogenous: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatingRegion {
    pub name: String,
    pub power_range: (f64, f64),
    pub stability_score: f64,
    pub class: RegionClass,
    /// Mean rolling standard deviation in watts.
    pub fluctuation_rate: f64,
    pub jump_rate_per_hour: f64,
    pub sample_count: usize,
    pub conditions: RegionConditions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    #[default]
    None,
    GaussianMixture,
    PowerBinning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub min_stable_power: Option<f64>,
    pub regions: Vec<OperatingRegion>,
    pub data_quality_score: f64,
    pub sufficient_data: bool,
    pub recommendation: String,
    pub analysis_timestamp: DateTime<Utc>,
    pub method: DiscoveryMethod,
    pub sample_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionView {
    pub range: String,
    pub stability: u32,
    pub is_stable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardView {
    pub status: &'static str,
    pub sufficient_data: bool,
    pub data_quality: f64,
    pub min_stable_power: Option<f64>,
    pub recommendation: String,
    pub regions: Vec<RegionView>,
}

impl AnalysisResult {
    /// Placeholder published before the first discovery run completes.
    pub fn pending() -> Self {
        Self::insufficient("waiting for first analysis".to_string(), 0)
    }

    fn insufficient(message: String, sample_count: usize) -> Self {
        Self {
            min_stable_power: None,
            regions: Vec::new(),
            data_quality_score: 0.0,
            sufficient_data: false,
            recommendation: format!("Keep observing, need more data: {message}"),
            analysis_timestamp: Utc::now(),
            method: DiscoveryMethod::None,
            sample_count,
        }
    }

    pub fn dashboard(&self, stable_cutoff: f64) -> DashboardView {
        DashboardView {
            status: if self.sufficient_data { "ready" } else { "waiting" },
            sufficient_data: self.sufficient_data,
            data_quality: self.data_quality_score,
            min_stable_power: self.min_stable_power,
            recommendation: self.recommendation.clone(),
            regions: self
                .regions
                .iter()
                .map(|region| RegionView {
                    range: format!(
                        "{:.0}-{:.0}W",
                        region.power_range.0, region.power_range.1
                    ),
                    stability: (region.stability_score * 100.0).round() as u32,
                    is_stable: region.stability_score > stable_cutoff,
                })
                .collect(),
        }
    }

    /// The unstable region whose p10-p90 power band contains `power`, if any.
    pub fn unstable_band_containing(&self, power: f64) -> Option<&OperatingRegion> {
        self.regions.iter().find(|region| {
            region.class == RegionClass::Unstable
                && power >= region.conditions.p10_power
                && power <= region.conditions.p90_power
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sufficiency {
    pub sufficient: bool,
    pub message: String,
}

struct Features {
    powers: Vec<f64>,
    stds: Vec<f64>,
    spreads: Vec<f64>,
    jumps: Vec<bool>,
    exogenous: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default)]
pub struct RegionDiscovery {
    config: DiscoveryConfig,
}

impl RegionDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn check_data_sufficiency(&self, history: &[PowerSample]) -> Sufficiency {
        let (Some(first), Some(last)) = (history.first(), history.last()) else {
            return Sufficiency {
                sufficient: false,
                message: "no data available".to_string(),
            };
        };
        if history.len() < self.config.min_datapoints {
            return Sufficiency {
                sufficient: false,
                message: format!(
                    "too few datapoints ({}), need at least {}",
                    history.len(),
                    self.config.min_datapoints
                ),
            };
        }
        let hours = (last.timestamp - first.timestamp).num_seconds() as f64 / 3600.0;
        if hours < self.config.min_span_hours {
            return Sufficiency {
                sufficient: false,
                message: format!(
                    "time span too short ({hours:.1}h), need at least {:.0}h",
                    self.config.min_span_hours
                ),
            };
        }
        Sufficiency {
            sufficient: true,
            message: format!("sufficient: {} points over {hours:.1}h", history.len()),
        }
    }

    /// Partitions the history into operating regions and derives the minimum stable power.
    ///
    /// `history` must be time ordered. `exogenous` is any auxiliary series (outdoor temperature
    /// for instance) attached to each region by an as-of join.
    pub fn discover(
        &self,
        history: &[PowerSample],
        exogenous: Option<&[PowerSample]>,
    ) -> AnalysisResult {
        let missing = history.iter().filter(|s| !s.watts.is_finite()).count();
        let cleaned = clean_series(history);
        let sufficiency = self.check_data_sufficiency(&cleaned);
        if !sufficiency.sufficient {
            tracing::info!(samples = cleaned.len(), reason = %sufficiency.message, "region discovery skipped");
            return AnalysisResult::insufficient(sufficiency.message, cleaned.len());
        }

        let features = self.features(&cleaned, exogenous);
        let quality = self.data_quality(&features.powers, missing, history.len());
        let samples_per_hour = samples_per_hour(&cleaned);

        let (method, labels, min_group) = self.partition(&features);
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (index, label) in labels.iter().enumerate() {
            groups.entry(*label).or_default().push(index);
        }
        let mut regions: Vec<OperatingRegion> = groups
            .values()
            .filter(|members| members.len() >= min_group)
            .map(|members| self.build_region(&features, members, samples_per_hour))
            .collect();
        regions.sort_by(|a, b| a.power_range.0.total_cmp(&b.power_range.0));

        let dataset_max = features
            .powers
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let min_stable_power = min_stable_power(&regions, &self.config, dataset_max);
        let recommendation = self.recommendation(&regions, min_stable_power);

        tracing::info!(
            method = ?method,
            regions = regions.len(),
            min_stable_power,
            quality,
            "region discovery finished"
        );

        AnalysisResult {
            min_stable_power: Some(min_stable_power),
            regions,
            data_quality_score: quality,
            sufficient_data: true,
            recommendation,
            analysis_timestamp: Utc::now(),
            method,
            sample_count: cleaned.len(),
        }
    }

    fn features(&self, series: &[PowerSample], exogenous: Option<&[PowerSample]>) -> Features {
        let powers: Vec<f64> = series.iter().map(|s| s.watts).collect();
        let stats = trailing_stats(&powers, self.config.feature_window);
        let mut jumps = Vec::with_capacity(powers.len());
        jumps.push(false);
        jumps.extend(
            powers
                .windows(2)
                .map(|w| (w[1] - w[0]).abs() > self.config.feature_jump_watts),
        );
        Features {
            stds: stats.iter().map(|s| s.std).collect(),
            spreads: stats.iter().map(|s| s.max - s.min).collect(),
            exogenous: exogenous
                .map(|exo| asof_join(series, exo))
                .unwrap_or_else(|| vec![None; series.len()]),
            powers,
            jumps,
        }
    }

    fn data_quality(&self, powers: &[f64], missing: usize, total: usize) -> f64 {
        let mut score = 1.0;
        if total > 0 {
            score -= missing as f64 / total as f64 * 0.5;
        }
        if crate::rolling::sample_std(powers) < self.config.flatline_std_watts {
            score -= 0.4;
        }
        score.clamp(0.0, 1.0)
    }

    fn partition(&self, features: &Features) -> (DiscoveryMethod, Vec<usize>, usize) {
        if features.powers.len() >= self.config.clustering_min_samples {
            let points: Vec<Point> = features
                .powers
                .iter()
                .zip(&features.stds)
                .map(|(p, s)| [*p, *s])
                .collect();
            let options = FitOptions {
                min_components: self.config.min_components,
                max_components: self.config.max_components,
                seed: self.config.seed,
                max_iterations: self.config.max_iterations,
                tolerance: self.config.convergence_tolerance,
            };
            if let Some(fit) = select_mixture(&standardize(&points), &options) {
                tracing::debug!(components = fit.components, bic = fit.bic, "mixture selected");
                return (
                    DiscoveryMethod::GaussianMixture,
                    fit.labels,
                    self.config.min_region_samples,
                );
            }
            tracing::debug!("mixture unavailable; falling back to power bins");
        }
        (
            DiscoveryMethod::PowerBinning,
            binning::bin_labels(&features.powers),
            self.config.bin_min_samples,
        )
    }

    fn build_region(
        &self,
        features: &Features,
        members: &[usize],
        samples_per_hour: f64,
    ) -> OperatingRegion {
        let powers: Vec<f64> = members.iter().map(|i| features.powers[*i]).collect();
        let stds: Vec<f64> = members.iter().map(|i| features.stds[*i]).collect();
        let spreads: Vec<f64> = members.iter().map(|i| features.spreads[*i]).collect();
        let exo: Vec<f64> = members.iter().filter_map(|i| features.exogenous[*i]).collect();
        let jump_count = members.iter().filter(|i| features.jumps[**i]).count();

        let min_p = powers.iter().copied().fold(f64::INFINITY, f64::min);
        let max_p = powers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg_power = mean(&powers).unwrap_or(0.0);
        let avg_std = mean(&stds).unwrap_or(0.0);
        let jump_rate = jump_count as f64 / members.len() as f64 * samples_per_hour;

        let score_std = (1.0 - avg_std / self.config.std_scale_watts).max(0.0);
        let score_jumps = (1.0 - jump_rate / self.config.jump_rate_scale_per_hour).max(0.0);
        let stability_score = (0.8 * score_std + 0.2 * score_jumps).clamp(0.0, 1.0);

        let class = if stability_score > self.config.stable_cutoff {
            RegionClass::Stable
        } else if stability_score < self.config.unstable_cutoff {
            RegionClass::Unstable
        } else {
            RegionClass::Moderate
        };
        let tag = match class {
            RegionClass::Stable => " [stable]",
            RegionClass::Unstable => " [cycling]",
            RegionClass::Moderate => "",
        };

        OperatingRegion {
            name: format!("{avg_power:.0}W avg ({min_p:.0}-{max_p:.0}W){tag}"),
            power_range: (min_p, max_p),
            stability_score,
            class,
            fluctuation_rate: avg_std,
            jump_rate_per_hour: jump_rate,
            sample_count: members.len(),
            conditions: RegionConditions {
                avg_power,
                avg_std,
                avg_spread: mean(&spreads).unwrap_or(0.0),
                p10_power: percentile(&powers, 10.0).unwrap_or(min_p),
                p90_power: percentile(&powers, 90.0).unwrap_or(max_p),
                avg_exogenous: mean(&exo),
            },
        }
    }

    fn recommendation(&self, regions: &[OperatingRegion], min_stable: f64) -> String {
        let mut lines = vec![format!("Minimum stable load: {min_stable:.0} W")];
        let mut stable: Vec<&OperatingRegion> = regions
            .iter()
            .filter(|r| r.stability_score > self.config.stable_cutoff)
            .collect();
        if stable.is_empty() {
            if let Some(best) = most_stable(regions.iter()) {
                if best.stability_score > self.config.lenient_cutoff {
                    stable.push(best);
                }
            }
        }
        if stable.is_empty() {
            lines.push("No stable operating band found".to_string());
        } else {
            let ranges: Vec<String> = stable
                .iter()
                .map(|r| format!("{:.0}-{:.0}W", r.power_range.0, r.power_range.1))
                .collect();
            lines.push(format!("Recommended bands: {}", ranges.join(", ")));
        }
        lines.join(" | ")
    }
}

fn most_stable<'a>(regions: impl Iterator<Item = &'a OperatingRegion>) -> Option<&'a OperatingRegion> {
    regions.max_by(|a, b| a.stability_score.total_cmp(&b.stability_score))
}

/// Lowest stable band above the noise floor. Without one, the most stable active band (when
/// its score clears the lenient cutoff) or the configured default. The result never lands on
/// the dataset maximum unless every region is stable.
pub(crate) fn min_stable_power(
    regions: &[OperatingRegion],
    config: &DiscoveryConfig,
    dataset_max: f64,
) -> f64 {
    let active: Vec<&OperatingRegion> = regions
        .iter()
        .filter(|r| r.power_range.1 > config.noise_floor_watts)
        .collect();
    let mut stable: Vec<&&OperatingRegion> = active
        .iter()
        .filter(|r| r.stability_score > config.stable_cutoff)
        .collect();
    stable.sort_by(|a, b| {
        let mid_a = (a.power_range.0 + a.power_range.1) / 2.0;
        let mid_b = (b.power_range.0 + b.power_range.1) / 2.0;
        mid_a.total_cmp(&mid_b)
    });

    let candidate = match stable.first() {
        Some(lowest) => lowest.power_range.0,
        None => match most_stable(active.iter().copied()) {
            Some(best) if best.stability_score > config.lenient_cutoff => {
                config.fallback_floor_watts.max(best.power_range.0)
            }
            _ => return config.default_min_stable_power,
        },
    };
    let all_stable = regions.iter().all(|r| r.class == RegionClass::Stable);
    if candidate >= dataset_max && !all_stable {
        tracing::warn!(
            candidate,
            dataset_max,
            "min stable power reached the dataset maximum; using default"
        );
        return config.default_min_stable_power;
    }
    candidate
}

fn samples_per_hour(series: &[PowerSample]) -> f64 {
    let mut intervals: Vec<f64> = series
        .windows(2)
        .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds() as f64 / 1000.0)
        .filter(|secs| *secs > 0.0)
        .collect();
    if intervals.is_empty() {
        return 60.0;
    }
    intervals.sort_by(|a, b| a.total_cmp(b));
    let median = intervals[intervals.len() / 2];
    3600.0 / median
}

/// Latest exogenous value at or before each sample.
fn asof_join(series: &[PowerSample], exogenous: &[PowerSample]) -> Vec<Option<f64>> {
    let mut cursor = 0;
    let mut current: Option<f64> = None;
    series
        .iter()
        .map(|sample| {
            while cursor < exogenous.len() && exogenous[cursor].timestamp <= sample.timestamp {
                if exogenous[cursor].watts.is_finite() {
                    current = Some(exogenous[cursor].watts);
                }
                cursor += 1;
            }
            current
        })
        .collect()
}
