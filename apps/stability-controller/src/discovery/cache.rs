use super::AnalysisResult;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CacheDisk {
    version: u32,
    saved_at: DateTime<Utc>,
    result: AnalysisResult,
}

/// Last discovery result on disk, so a restart can act before the next discovery run.
#[derive(Debug, Clone)]
pub struct AnalysisCache {
    path: PathBuf,
}

impl AnalysisCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, result: &AnalysisResult) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create cache dir {}", parent.display()))?;
        }
        let disk = CacheDisk {
            version: CACHE_VERSION,
            saved_at: Utc::now(),
            result: result.clone(),
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&disk)?).context("write analysis cache tmp")?;
        fs::rename(&tmp, &self.path).context("rename analysis cache")?;
        Ok(())
    }

    /// `Ok(None)` when no cache exists or it was written by an incompatible version.
    pub fn load(&self) -> Result<Option<AnalysisResult>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path).context("read analysis cache")?;
        let disk: CacheDisk = serde_json::from_str(&raw).context("parse analysis cache")?;
        if disk.version != CACHE_VERSION {
            tracing::warn!(
                version = disk.version,
                expected = CACHE_VERSION,
                "ignoring analysis cache from another version"
            );
            return Ok(None);
        }
        Ok(Some(disk.result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{
        DiscoveryMethod, OperatingRegion, RegionClass, RegionConditions,
    };

    fn sample_result() -> AnalysisResult {
        AnalysisResult {
            min_stable_power: Some(812.5),
            regions: vec![OperatingRegion {
                name: "812W avg (790-830W) [stable]".to_string(),
                power_range: (790.0, 830.0),
                stability_score: 0.93,
                class: RegionClass::Stable,
                fluctuation_rate: 6.25,
                jump_rate_per_hour: 0.1,
                sample_count: 1440,
                conditions: RegionConditions {
                    avg_power: 812.5,
                    avg_std: 6.25,
                    avg_spread: 18.0,
                    p10_power: 795.0,
                    p90_power: 828.0,
                    avg_exogenous: Some(4.5),
                },
            }],
            data_quality_score: 1.0,
            sufficient_data: true,
            recommendation: "Minimum stable load: 812 W".to_string(),
            analysis_timestamp: Utc::now(),
            method: DiscoveryMethod::GaussianMixture,
            sample_count: 2880,
        }
    }

    #[test]
    fn missing_cache_loads_as_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = AnalysisCache::new(dir.path().join("analysis.json"));
        assert!(cache.load().unwrap().is_none());
    }

    #[test]
    fn saved_result_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = AnalysisCache::new(dir.path().join("nested").join("analysis.json"));
        let original = sample_result();
        cache.save(&original).unwrap();

        let loaded = cache.load().unwrap().unwrap();
        assert_eq!(loaded.min_stable_power, original.min_stable_power);
        assert_eq!(loaded.regions.len(), 1);
        assert_eq!(loaded.regions[0].class, RegionClass::Stable);
        assert_eq!(loaded.regions[0].conditions.avg_exogenous, Some(4.5));
        assert!((loaded.regions[0].stability_score - 0.93).abs() < 1e-12);
        assert_eq!(loaded.analysis_timestamp, original.analysis_timestamp);
        assert_eq!(loaded.method, DiscoveryMethod::GaussianMixture);
        assert!(!dir.path().join("nested").join("analysis.json.tmp").exists());
    }

    #[test]
    fn corrupt_cache_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("analysis.json");
        fs::write(&path, "{not json").unwrap();
        assert!(AnalysisCache::new(path).load().is_err());
    }
}
