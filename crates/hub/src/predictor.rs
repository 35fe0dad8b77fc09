//! Irrigation-need predictor.
//!
//! A four-feature logistic score whose weights are periodically re-fitted to
//! the absolute correlation of each feature with logged outcomes. It is only
//! ever advisory: the orchestrator consults it above a confidence floor and
//! never lets it override a safety gate.

use std::collections::VecDeque;

use serde::Serialize;

use crate::stats;

pub const FEATURE_COUNT: usize = 4;
pub type FeatureVector = [f64; FEATURE_COUNT];

const INITIAL_WEIGHTS: FeatureVector = [0.4, 0.3, 0.2, 0.1];
/// Samples considered by the accuracy proxy.
const ACCURACY_WINDOW: usize = 50;
/// Accuracy reported before the first recalibration.
const UNTRAINED_ACCURACY: f64 = 0.5;
/// Time since last irrigation saturates at two hours.
const IRRIGATION_GAP_CAP_MIN: f64 = 120.0;

#[derive(Debug, Clone)]
pub struct PredictorConfig {
    pub min_training_samples: usize,
    pub update_frequency: usize,
    pub training_buffer: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            min_training_samples: 30,
            update_frequency: 50,
            training_buffer: 1000,
        }
    }
}

/// Raw observations a feature vector is built from.
#[derive(Debug, Clone, Copy)]
pub struct FeatureInputs {
    pub vwc: f64,
    pub vwc_target: f64,
    pub vwc_trend_per_min: f64,
    pub dryback_pct: f64,
    pub dryback_target_pct: f64,
    pub dryback_rate_pct_per_hour: f64,
    pub minutes_since_irrigation: Option<f64>,
    pub ec_ratio: f64,
}

/// What happened after a decision; converted to a training label.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Irrigated { improved: bool, target_reached: bool },
    Withheld { correct: bool },
}

impl Outcome {
    pub fn label(self) -> f64 {
        match self {
            Outcome::Irrigated { improved: true, target_reached: true } => 0.8,
            Outcome::Irrigated { improved: true, target_reached: false } => 0.6,
            Outcome::Irrigated { improved: false, .. } => 0.3,
            Outcome::Withheld { correct: true } => 0.2,
            Outcome::Withheld { correct: false } => 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Prediction {
    pub probability: f64,
    pub confidence: f64,
    pub horizon_min: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictorStatus {
    pub weights: FeatureVector,
    pub samples: usize,
    pub accuracy: f64,
    pub trained: bool,
}

#[derive(Debug)]
pub struct IrrigationPredictor {
    config: PredictorConfig,
    weights: FeatureVector,
    samples: VecDeque<(FeatureVector, f64)>,
    since_update: usize,
    trained: bool,
}

impl IrrigationPredictor {
    pub fn new(config: PredictorConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.training_buffer.min(4096)),
            config,
            weights: INITIAL_WEIGHTS,
            since_update: 0,
            trained: false,
        }
    }

    /// VWC deficit plus trend, dryback progress plus rate, normalised time
    /// since the last shot, EC excess over target.
    pub fn features(inputs: &FeatureInputs) -> FeatureVector {
        let target = inputs.vwc_target.max(stats::EPSILON);
        let deficit = (inputs.vwc_target - inputs.vwc) / target;
        let falling = (-inputs.vwc_trend_per_min * 10.0 / target).max(0.0);
        let vwc_component = (deficit + falling).clamp(-1.0, 1.0);

        let dryback_component = if inputs.dryback_target_pct > stats::EPSILON {
            inputs.dryback_pct / inputs.dryback_target_pct
        } else {
            0.0
        } + inputs.dryback_rate_pct_per_hour.max(0.0) / 10.0;
        let dryback_component = dryback_component.clamp(0.0, 2.0);

        let gap = inputs
            .minutes_since_irrigation
            .map(|m| (m / IRRIGATION_GAP_CAP_MIN).clamp(0.0, 1.0))
            .unwrap_or(1.0);

        let ec_component = (inputs.ec_ratio - 1.0).clamp(0.0, 1.0);

        [vwc_component, dryback_component, gap, ec_component]
    }

    pub fn predict(&self, features: &FeatureVector, horizon_min: f64) -> Prediction {
        Prediction {
            probability: self.score(features),
            confidence: (self.accuracy() * horizon_factor(horizon_min)).clamp(0.0, 1.0),
            horizon_min,
        }
    }

    /// Append a labelled sample; recalibrates every `update_frequency`
    /// samples once enough training data exists.
    pub fn add_sample(&mut self, features: FeatureVector, outcome: Outcome) {
        if self.samples.len() >= self.config.training_buffer.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back((features, outcome.label()));
        self.since_update += 1;

        if self.since_update >= self.config.update_frequency
            && self.samples.len() >= self.config.min_training_samples
        {
            self.recalibrate();
            self.since_update = 0;
        }
    }

    pub fn accuracy(&self) -> f64 {
        if !self.trained {
            return UNTRAINED_ACCURACY;
        }
        let skip = self.samples.len().saturating_sub(ACCURACY_WINDOW);
        let recent: Vec<&(FeatureVector, f64)> = self.samples.iter().skip(skip).collect();
        if recent.is_empty() {
            return UNTRAINED_ACCURACY;
        }
        let labels: Vec<f64> = recent.iter().map(|s| s.1).collect();
        let mean = stats::mean(&labels);
        let rss: f64 = recent.iter().map(|(f, y)| (y - self.score(f)).powi(2)).sum();
        let tss: f64 = labels.iter().map(|y| (y - mean).powi(2)).sum();
        let accuracy = if tss < stats::EPSILON {
            1.0 - rss / recent.len() as f64
        } else {
            1.0 - rss / tss
        };
        accuracy.clamp(0.0, 1.0)
    }

    pub fn status(&self) -> PredictorStatus {
        PredictorStatus {
            weights: self.weights,
            samples: self.samples.len(),
            accuracy: self.accuracy(),
            trained: self.trained,
        }
    }

    pub fn weights(&self) -> FeatureVector {
        self.weights
    }

    fn score(&self, features: &FeatureVector) -> f64 {
        let z: f64 = self.weights.iter().zip(features).map(|(w, f)| w * f).sum();
        stats::sigmoid(z)
    }

    fn recalibrate(&mut self) {
        let labels: Vec<f64> = self.samples.iter().map(|s| s.1).collect();
        let mut corr = [0.0; FEATURE_COUNT];
        for (j, c) in corr.iter_mut().enumerate() {
            let column: Vec<f64> = self.samples.iter().map(|s| s.0[j]).collect();
            *c = stats::pearson(&column, &labels).abs();
        }
        let total: f64 = corr.iter().sum();
        if total < stats::EPSILON {
            tracing::debug!("predictor: no feature correlates with outcomes, keeping weights");
            return;
        }
        for (w, c) in self.weights.iter_mut().zip(corr) {
            *w = c / total;
        }
        self.trained = true;
        tracing::info!(weights = ?self.weights, samples = self.samples.len(), "predictor: weights recalibrated");
    }
}

/// Full confidence up to an hour ahead, then a linear falloff.
fn horizon_factor(horizon_min: f64) -> f64 {
    if horizon_min <= 60.0 {
        1.0
    } else {
        (1.0 - (horizon_min - 60.0) / 240.0).max(0.25)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
