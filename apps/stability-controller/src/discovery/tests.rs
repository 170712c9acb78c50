use super::*;
use crate::types::test_series::base_time;
use chrono::Duration as ChronoDuration;

fn hours_of_minutes(hours: i64, value_at: impl Fn(i64) -> f64) -> Vec<PowerSample> {
    let start = base_time();
    (0..hours * 60)
        .map(|minute| PowerSample::new(start + ChronoDuration::minutes(minute), value_at(minute)))
        .collect()
}

/// Odd hours chatter between 80 and 350 W every minute; even hours hold about 800 W.
fn mixed_history() -> Vec<PowerSample> {
    hours_of_minutes(48, |minute| {
        let hour = minute / 60;
        if hour % 2 == 1 {
            if minute % 2 == 0 {
                80.0
            } else {
                350.0
            }
        } else {
            800.0 + ((minute % 5) as f64 - 2.0) * 3.0
        }
    })
}

fn region(min: f64, max: f64, score: f64, class: RegionClass) -> OperatingRegion {
    OperatingRegion {
        name: format!("{min}-{max}"),
        power_range: (min, max),
        stability_score: score,
        class,
        fluctuation_rate: 0.0,
        jump_rate_per_hour: 0.0,
        sample_count: 100,
        conditions: RegionConditions {
            avg_power: (min + max) / 2.0,
            avg_std: 0.0,
            avg_spread: 0.0,
            p10_power: min,
            p90_power: max,
            avg_exogenous: None,
        },
    }
}

#[test]
fn short_history_is_insufficient_not_an_error() {
    let discovery = RegionDiscovery::default();
    let history = hours_of_minutes(10, |_| 500.0);
    let result = discovery.discover(&history, None);

    assert!(!result.sufficient_data);
    assert!(result.regions.is_empty());
    assert_eq!(result.min_stable_power, None);
    assert!(result.recommendation.contains("need more data"));
    assert_eq!(result.dashboard(0.7).status, "waiting");
}

#[test]
fn sufficiency_requires_count_and_span() {
    let discovery = RegionDiscovery::default();
    assert!(!discovery.check_data_sufficiency(&[]).sufficient);

    let dense_but_short: Vec<PowerSample> = (0..2000)
        .map(|i| PowerSample::new(base_time() + ChronoDuration::seconds(i * 10), 500.0))
        .collect();
    let verdict = discovery.check_data_sufficiency(&dense_but_short);
    assert!(!verdict.sufficient);
    assert!(verdict.message.contains("time span"));

    assert!(discovery.check_data_sufficiency(&hours_of_minutes(25, |_| 1.0)).sufficient);
}

#[test]
fn constant_load_is_its_own_stable_floor() {
    let discovery = RegionDiscovery::default();
    let result = discovery.discover(&hours_of_minutes(48, |_| 500.0), None);

    assert!(result.sufficient_data);
    let min_stable = result.min_stable_power.unwrap();
    assert!((min_stable - 500.0).abs() < 1.0, "min_stable={min_stable}");
    // Flatlined sensor is penalised.
    assert!((result.data_quality_score - 0.6).abs() < 1e-9);
    assert!(result.regions.iter().all(|r| r.class == RegionClass::Stable));
}

#[test]
fn mixed_history_separates_stable_and_cycling_bands() {
    let discovery = RegionDiscovery::default();
    let result = discovery.discover(&mixed_history(), None);

    assert_eq!(result.method, DiscoveryMethod::GaussianMixture);
    assert!(result.regions.iter().any(|r| r.class == RegionClass::Stable
        && (r.conditions.avg_power - 800.0).abs() < 50.0));

    let low_band: Vec<&OperatingRegion> = result
        .regions
        .iter()
        .filter(|r| r.power_range.1 <= 400.0)
        .collect();
    assert!(!low_band.is_empty());
    assert!(low_band.iter().all(|r| r.class == RegionClass::Unstable));

    let min_stable = result.min_stable_power.unwrap();
    assert!(min_stable > 300.0 && min_stable < 900.0, "min_stable={min_stable}");

    let max_stable_seen = result
        .regions
        .iter()
        .filter(|r| r.class == RegionClass::Stable)
        .map(|r| r.power_range.1)
        .fold(f64::NEG_INFINITY, f64::max);
    assert!(min_stable <= max_stable_seen);
}

#[test]
fn discovery_is_deterministic_for_a_seed() {
    let discovery = RegionDiscovery::default();
    let history = mixed_history();
    let first = discovery.discover(&history, None);
    let second = discovery.discover(&history, None);

    assert_eq!(first.min_stable_power, second.min_stable_power);
    let bounds = |r: &AnalysisResult| -> Vec<(f64, f64, usize)> {
        r.regions
            .iter()
            .map(|region| (region.power_range.0, region.power_range.1, region.sample_count))
            .collect()
    };
    assert_eq!(bounds(&first), bounds(&second));
}

#[test]
fn fallback_never_lands_on_dataset_maximum() {
    let config = DiscoveryConfig::default();
    let regions = vec![
        region(50.0, 250.0, 0.1, RegionClass::Unstable),
        region(1000.0, 1000.0, 0.5, RegionClass::Moderate),
    ];
    assert_eq!(min_stable_power(&regions, &config, 1000.0), 450.0);

    // Same fallback below the maximum is kept.
    assert_eq!(min_stable_power(&regions, &config, 1600.0), 1000.0);
}

#[test]
fn constant_top_stable_band_is_not_the_minimum_while_others_cycle() {
    let config = DiscoveryConfig::default();
    let regions = vec![
        region(50.0, 250.0, 0.1, RegionClass::Unstable),
        region(1000.0, 1000.0, 0.9, RegionClass::Stable),
    ];
    assert_eq!(min_stable_power(&regions, &config, 1000.0), 450.0);

    let all_stable = vec![region(1000.0, 1000.0, 0.9, RegionClass::Stable)];
    assert_eq!(min_stable_power(&all_stable, &config, 1000.0), 1000.0);
}

#[test]
fn fallback_uses_floor_or_default() {
    let config = DiscoveryConfig::default();
    let lenient = vec![region(320.0, 700.0, 0.5, RegionClass::Moderate)];
    assert_eq!(min_stable_power(&lenient, &config, 900.0), 400.0);

    let hopeless = vec![region(320.0, 700.0, 0.2, RegionClass::Unstable)];
    assert_eq!(min_stable_power(&hopeless, &config, 900.0), 450.0);

    let only_off = vec![region(0.0, 120.0, 0.95, RegionClass::Stable)];
    assert_eq!(min_stable_power(&only_off, &config, 120.0), 450.0);
}

#[test]
fn lowest_stable_band_wins() {
    let config = DiscoveryConfig::default();
    let regions = vec![
        region(80.0, 350.0, 0.0, RegionClass::Unstable),
        region(600.0, 700.0, 0.9, RegionClass::Stable),
        region(1200.0, 1400.0, 0.95, RegionClass::Stable),
    ];
    assert_eq!(min_stable_power(&regions, &config, 1400.0), 600.0);
}

#[test]
fn unstable_band_lookup_uses_p10_p90() {
    let mut result = AnalysisResult::pending();
    result.regions = vec![
        region(80.0, 350.0, 0.1, RegionClass::Unstable),
        region(780.0, 820.0, 0.9, RegionClass::Stable),
    ];
    assert!(result.unstable_band_containing(200.0).is_some());
    assert!(result.unstable_band_containing(800.0).is_none());
    assert!(result.unstable_band_containing(500.0).is_none());

    let view = result.dashboard(0.7);
    assert_eq!(view.regions[1].range, "780-820W");
    assert_eq!(view.regions[1].stability, 90);
    assert!(view.regions[1].is_stable);
    assert!(!view.regions[0].is_stable);
}

#[test]
fn exogenous_series_is_joined_as_of() {
    let history = hours_of_minutes(2, |_| 500.0);
    let outdoor = vec![
        PowerSample::new(base_time() - ChronoDuration::minutes(5), 2.0),
        PowerSample::new(base_time() + ChronoDuration::minutes(60), 4.0),
    ];
    let joined = asof_join(&history, &outdoor);
    assert_eq!(joined[0], Some(2.0));
    assert_eq!(joined[59], Some(2.0));
    assert_eq!(joined[60], Some(4.0));
    assert_eq!(asof_join(&history, &[])[0], None);
}
