use crate::error::{StabilityError, StabilityResult};
use crate::types::PowerSample;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;

/// Bounded FIFO of recent power samples.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    buffer: VecDeque<PowerSample>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends a sample, evicting the oldest when full. A sample with the same timestamp as the
    /// newest one replaces it; an older timestamp is rejected.
    pub fn push(&mut self, sample: PowerSample) -> StabilityResult<()> {
        if let Some(last) = self.buffer.back_mut() {
            if sample.timestamp < last.timestamp {
                return Err(StabilityError::NonMonotonic {
                    previous: last.timestamp,
                    next: sample.timestamp,
                });
            }
            if sample.timestamp == last.timestamp {
                *last = sample;
                return Ok(());
            }
        }
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(sample);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn latest(&self) -> Option<&PowerSample> {
        self.buffer.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PowerSample> {
        self.buffer.iter()
    }

    /// Samples (oldest first) of the newest `n` entries.
    pub fn tail(&self, n: usize) -> Vec<PowerSample> {
        let skip = self.buffer.len().saturating_sub(n);
        self.buffer.iter().skip(skip).copied().collect()
    }

    pub fn tail_values(&self, n: usize) -> Vec<f64> {
        let skip = self.buffer.len().saturating_sub(n);
        self.buffer.iter().skip(skip).map(|s| s.watts).collect()
    }

    pub fn since(&self, cutoff: DateTime<Utc>) -> Vec<PowerSample> {
        self.buffer
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .copied()
            .collect()
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    Some(finite.iter().sum::<f64>() / finite.len() as f64)
}

/// Sample standard deviation (n - 1). Zero for fewer than two values.
pub fn sample_std(values: &[f64]) -> f64 {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() < 2 {
        return 0.0;
    }
    let avg = finite.iter().sum::<f64>() / finite.len() as f64;
    let var = finite.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (finite.len() - 1) as f64;
    var.max(0.0).sqrt()
}

/// max - min over finite values; zero when empty.
pub fn spread(values: &[f64]) -> f64 {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in values.iter().copied().filter(|v| v.is_finite()) {
        min = min.min(v);
        max = max.max(v);
    }
    if min.is_finite() && max.is_finite() {
        max - min
    } else {
        0.0
    }
}

/// Linear-interpolated percentile (`q` in [0, 100]).
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Statistics over the trailing `window` values ending at each index (at least one value).
pub fn trailing_stats(values: &[f64], window: usize) -> Vec<WindowStats> {
    let window = window.max(1);
    (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            let slice = &values[start..=i];
            WindowStats {
                mean: mean(slice).unwrap_or(0.0),
                std: sample_std(slice),
                min: slice.iter().copied().fold(f64::INFINITY, f64::min),
                max: slice.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            }
        })
        .collect()
}

/// Averages samples into fixed buckets keyed by their aligned start. Empty buckets are skipped.
pub fn resample(series: &[PowerSample], interval_seconds: i64) -> Vec<PowerSample> {
    let mut out: Vec<PowerSample> = Vec::new();
    let mut bucket: Option<DateTime<Utc>> = None;
    let mut total = 0.0;
    let mut count = 0usize;

    for sample in series.iter().filter(|s| s.watts.is_finite()) {
        let key = align_down(sample.timestamp, interval_seconds);
        match bucket {
            Some(current) if current == key => {}
            Some(current) => {
                out.push(PowerSample::new(current, total / count as f64));
                total = 0.0;
                count = 0;
                bucket = Some(key);
            }
            None => bucket = Some(key),
        }
        total += sample.watts;
        count += 1;
    }
    if let Some(current) = bucket {
        if count > 0 {
            out.push(PowerSample::new(current, total / count as f64));
        }
    }
    out
}

pub(crate) fn align_down(ts: DateTime<Utc>, interval_seconds: i64) -> DateTime<Utc> {
    let interval_ms = interval_seconds.max(1) * 1000;
    let ts_ms = ts.timestamp_millis();
    let bucket_ms = ts_ms.div_euclid(interval_ms) * interval_ms;
    Utc.timestamp_millis_opt(bucket_ms).single().unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_series::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn window_evicts_oldest_and_replaces_equal_timestamp() {
        let mut window = RollingWindow::new(3);
        for sample in minute_series(&[1.0, 2.0, 3.0, 4.0]) {
            window.push(sample).unwrap();
        }
        assert_eq!(window.tail_values(10), vec![2.0, 3.0, 4.0]);

        let last = *window.latest().unwrap();
        window.push(PowerSample::new(last.timestamp, 40.0)).unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window.latest().unwrap().watts, 40.0);

        let stale = PowerSample::new(last.timestamp - ChronoDuration::minutes(5), 1.0);
        assert!(window.push(stale).is_err());
    }

    #[test]
    fn stats_ignore_non_finite_values() {
        let values = [1.0, f64::NAN, 3.0];
        assert_eq!(mean(&values), Some(2.0));
        assert!((sample_std(&values) - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(spread(&values), 2.0);
        assert_eq!(mean(&[]), None);
        assert_eq!(sample_std(&[5.0]), 0.0);
    }

    #[test]
    fn percentile_interpolates() {
        let values = [10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(percentile(&values, 50.0), Some(30.0));
        assert_eq!(percentile(&values, 10.0), Some(14.0));
        assert_eq!(percentile(&values, 100.0), Some(50.0));
    }

    #[test]
    fn trailing_stats_grow_until_full() {
        let stats = trailing_stats(&[0.0, 10.0, 20.0, 30.0], 2);
        assert_eq!(stats[0].std, 0.0);
        assert_eq!(stats[3].mean, 25.0);
        assert_eq!(stats[3].min, 20.0);
        assert_eq!(stats[3].max, 30.0);
    }

    #[test]
    fn resample_averages_buckets() {
        let series = minute_series(&[100.0, 200.0, 300.0, 400.0, 500.0]);
        let out = resample(&series, 120);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].watts, 150.0);
        assert_eq!(out[2].watts, 500.0);
        assert_eq!(out[1].timestamp, base_time() + ChronoDuration::minutes(2));
    }

    #[test]
    fn align_down_snaps_to_interval() {
        let ts = base_time() + ChronoDuration::seconds(90);
        assert_eq!(align_down(ts, 60), base_time() + ChronoDuration::seconds(60));
        assert_eq!(align_down(base_time(), 60), base_time());
    }
}
