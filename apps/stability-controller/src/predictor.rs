use crate::rolling::{sample_std, spread};
use crate::types::PowerSample;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskPrediction {
    pub predicted: bool,
    pub probability: f64,
    pub status: &'static str,
}

impl RiskPrediction {
    pub fn none(status: &'static str) -> Self {
        Self {
            predicted: false,
            probability: 0.0,
            status,
        }
    }
}

/// Optional short-horizon cycling forecast over the most recent samples.
pub trait RiskPredictor: Send + Sync {
    fn predict_risk(&self, recent: &[PowerSample]) -> RiskPrediction;
}

/// Used when no model is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRiskPredictor;

impl RiskPredictor for NullRiskPredictor {
    fn predict_risk(&self, _recent: &[PowerSample]) -> RiskPrediction {
        RiskPrediction::none("model_not_trained")
    }
}

/// Variance heuristic: 125 W of std, 1 kW of spread or ten 200 W jumps each saturate their term.
#[derive(Debug, Clone, Copy)]
pub struct VarianceRiskPredictor {
    pub jump_watts: f64,
    pub cutoff: f64,
}

impl Default for VarianceRiskPredictor {
    fn default() -> Self {
        Self {
            jump_watts: 200.0,
            cutoff: 0.5,
        }
    }
}

impl RiskPredictor for VarianceRiskPredictor {
    fn predict_risk(&self, recent: &[PowerSample]) -> RiskPrediction {
        let values: Vec<f64> = recent
            .iter()
            .map(|s| s.watts)
            .filter(|v| v.is_finite())
            .collect();
        if values.len() < 2 {
            return RiskPrediction::none("no_valid_features");
        }
        let jumps = values
            .windows(2)
            .filter(|w| (w[1] - w[0]).abs() > self.jump_watts)
            .count();
        let probability = (sample_std(&values) / 125.0 * 0.4
            + spread(&values) / 1000.0 * 0.4
            + jumps as f64 / 10.0 * 0.2)
            .clamp(0.0, 1.0);
        RiskPrediction {
            predicted: probability > self.cutoff,
            probability,
            status: "ok",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_series::*;

    #[test]
    fn null_predictor_never_predicts() {
        let series = minute_series(&alternating(0.0, 2000.0, 20));
        let prediction = NullRiskPredictor.predict_risk(&series);
        assert!(!prediction.predicted);
        assert_eq!(prediction.probability, 0.0);
    }

    #[test]
    fn variance_predictor_scales_with_swings() {
        let predictor = VarianceRiskPredictor::default();
        let calm = predictor.predict_risk(&minute_series(&[600.0; 20]));
        assert!(!calm.predicted);
        assert_eq!(calm.probability, 0.0);

        let wild = predictor.predict_risk(&minute_series(&alternating(300.0, 1300.0, 20)));
        assert!(wild.predicted);
        assert_eq!(wild.probability, 1.0);

        assert_eq!(predictor.predict_risk(&[]).status, "no_valid_features");
    }
}
