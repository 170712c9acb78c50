use crate::config::SignalConfig;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Per-day tallies. The caller supplies the local date, so rollover is explicit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyCounters {
    pub day: NaiveDate,
    pub actions: u64,
    pub failed_actions: u64,
    pub short_cycles: u64,
    pub runtime_minutes: f64,
    #[serde(skip)]
    running_since: Option<DateTime<Utc>>,
    #[serde(skip)]
    last_sample: Option<DateTime<Utc>>,
}

impl DailyCounters {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            actions: 0,
            failed_actions: 0,
            short_cycles: 0,
            runtime_minutes: 0.0,
            running_since: None,
            last_sample: None,
        }
    }

    /// Resets the tallies when `today` differs from the tracked day. Returns whether it did.
    /// Compressor on/off state carries over so a run spanning midnight is not lost.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if today == self.day {
            return false;
        }
        tracing::info!(
            day = %self.day,
            actions = self.actions,
            short_cycles = self.short_cycles,
            runtime_minutes = self.runtime_minutes,
            "daily counters rolled over"
        );
        *self = Self {
            running_since: self.running_since,
            last_sample: self.last_sample,
            ..Self::new(today)
        };
        true
    }

    pub fn record_action(&mut self, success: bool) {
        if success {
            self.actions += 1;
        } else {
            self.failed_actions += 1;
        }
    }

    /// Tracks compressor runtime and counts runs shorter than the short-cycle threshold.
    pub fn record_power(&mut self, watts: f64, timestamp: DateTime<Utc>, signal: &SignalConfig) {
        let elapsed = self
            .last_sample
            .map(|last| (timestamp - last).num_seconds().max(0) as f64 / 60.0)
            .unwrap_or(0.0);
        self.last_sample = Some(timestamp);

        match self.running_since {
            Some(since) => {
                self.runtime_minutes += elapsed;
                if watts < signal.power_off_threshold {
                    let run = (timestamp - since).num_seconds() as f64 / 60.0;
                    if run < signal.short_cycle_minutes {
                        self.short_cycles += 1;
                    }
                    self.running_since = None;
                }
            }
            None => {
                if watts > signal.power_on_threshold {
                    self.running_since = Some(timestamp);
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_series::base_time;
    use chrono::Duration as ChronoDuration;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    fn feed(counters: &mut DailyCounters, values: &[f64]) {
        let signal = SignalConfig::default();
        for (i, watts) in values.iter().enumerate() {
            counters.record_power(*watts, base_time() + ChronoDuration::minutes(i as i64), &signal);
        }
    }

    #[test]
    fn short_runs_are_counted_and_long_runs_are_not() {
        let mut counters = DailyCounters::new(day(15));
        let mut values = vec![0.0, 800.0, 800.0, 800.0, 0.0];
        values.extend(std::iter::repeat(900.0).take(15));
        values.push(0.0);
        feed(&mut counters, &values);

        assert_eq!(counters.short_cycles, 1);
        assert_eq!(counters.runtime_minutes, 18.0);
        assert!(!counters.is_running());
    }

    #[test]
    fn hysteresis_band_keeps_compressor_running() {
        let mut counters = DailyCounters::new(day(15));
        feed(&mut counters, &[800.0, 150.0, 150.0, 800.0]);
        assert!(counters.is_running());
        assert_eq!(counters.short_cycles, 0);
        assert_eq!(counters.runtime_minutes, 3.0);
    }

    #[test]
    fn rollover_resets_tallies_once_per_day() {
        let mut counters = DailyCounters::new(day(15));
        counters.record_action(true);
        counters.record_action(false);
        feed(&mut counters, &[800.0, 800.0]);
        assert_eq!(counters.actions, 1);
        assert_eq!(counters.failed_actions, 1);

        assert!(!counters.roll_over(day(15)));
        assert_eq!(counters.actions, 1);

        assert!(counters.roll_over(day(16)));
        assert_eq!(counters.day, day(16));
        assert_eq!(counters.actions, 0);
        assert_eq!(counters.failed_actions, 0);
        assert_eq!(counters.runtime_minutes, 0.0);
        assert!(counters.is_running());
    }
}
