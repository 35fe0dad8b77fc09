//! Multi-sensor fusion for one zone.
//!
//! Each physical sensor gets a [`SensorProfile`] holding a rolling history,
//! a reliability score and a health class. Every reading is checked for
//! outliers against the sensor's own history (adaptive IQR, z-score,
//! trailing-3 consistency) and against its fresh peers (median/MAD), then all
//! qualifying sensors of the same class are combined into one
//! confidence-weighted value and smoothed by a scalar Kalman filter.
//!
//! ```text
//! reading ─▶ outlier checks ─▶ history ─▶ reliability/health
//!                                              │
//!            FusionResult ◀── kalman ◀── weighted average (qualifying only)
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SteeringError};
use crate::stats;

/// Readings required before reliability is computed from history.
const MIN_READINGS_FOR_RELIABILITY: u64 = 10;
const DEFAULT_RELIABILITY: f64 = 0.8;
/// History needed before own-history outlier checks run.
const MIN_HISTORY_FOR_OUTLIERS: usize = 5;
/// Window used for the rolling reliability factors.
const RELIABILITY_WINDOW: usize = 20;
/// Confidence multiplier when fusion falls back to a single sensor.
const FALLBACK_CONFIDENCE: f64 = 0.7;
/// Count factor saturates at this many sensors.
const SATURATING_SENSOR_COUNT: f64 = 4.0;
/// Consistency constant for MAD -> sigma.
const MAD_SCALE: f64 = 1.4826;
/// Peer deviation is never tighter than this fraction of the peer median.
const PEER_RELATIVE_FLOOR: f64 = 0.1;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FusionConfig {
    pub iqr_multiplier: f64,
    pub z_score_threshold: f64,
    pub reliability_threshold: f64,
    pub min_sensors_required: usize,
    pub history_size: usize,
    pub fresh_window_min: i64,
    pub offline_after_min: i64,
    pub process_noise: f64,
    pub measurement_noise: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            iqr_multiplier: 1.5,
            z_score_threshold: 3.5,
            reliability_threshold: 0.6,
            min_sensors_required: 2,
            history_size: 300,
            fresh_window_min: 10,
            offline_after_min: 30,
            process_noise: 0.1,
            measurement_noise: 0.5,
        }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorClass {
    Vwc,
    Ec,
}

impl fmt::Display for SensorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vwc => write!(f, "vwc"),
            Self::Ec => write!(f, "ec"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Excellent,
    Good,
    Degraded,
    Faulty,
    Offline,
}

impl HealthStatus {
    fn weight(self) -> f64 {
        match self {
            Self::Excellent => 1.2,
            Self::Degraded => 0.8,
            _ => 1.0,
        }
    }

    fn score(self) -> f64 {
        match self {
            Self::Excellent => 1.0,
            Self::Good => 0.8,
            Self::Degraded => 0.5,
            Self::Faulty | Self::Offline => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusionResult {
    pub fused_value: f64,
    pub confidence: f64,
    pub active_sensor_count: usize,
}

/// Latest fused output for one class, with the time it was produced.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FusionSnapshot {
    pub result: FusionResult,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    ts: DateTime<Utc>,
    outlier: bool,
}

// ---------------------------------------------------------------------------
// Sensor profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SensorProfile {
    pub sensor_id: String,
    pub class: SensorClass,
    history: VecDeque<Sample>,
    capacity: usize,
    pub reliability: f64,
    pub health: HealthStatus,
    pub outlier_count: u64,
    pub total_readings: u64,
}

impl SensorProfile {
    fn new(sensor_id: &str, class: SensorClass, capacity: usize) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            class,
            history: VecDeque::with_capacity(capacity),
            capacity: capacity.max(MIN_HISTORY_FOR_OUTLIERS),
            reliability: DEFAULT_RELIABILITY,
            health: HealthStatus::Good,
            outlier_count: 0,
            total_readings: 0,
        }
    }

    pub fn last_value(&self) -> Option<f64> {
        self.history.back().map(|s| s.value)
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.history.back().map(|s| s.ts)
    }

    /// Whether the most recent reading was flagged.
    pub fn current_is_outlier(&self) -> bool {
        self.history.back().map(|s| s.outlier).unwrap_or(false)
    }

    pub fn outlier_rate(&self) -> f64 {
        if self.total_readings == 0 {
            0.0
        } else {
            self.outlier_count as f64 / self.total_readings as f64
        }
    }

    #[cfg(test)]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn values(&self) -> Vec<f64> {
        self.history.iter().map(|s| s.value).collect()
    }

    fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.last_seen().map(|t| now - t <= window).unwrap_or(false)
    }

    fn push(&mut self, sample: Sample) {
        if self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        if sample.outlier {
            self.outlier_count += 1;
        }
        self.total_readings += 1;
        self.history.push_back(sample);
        self.recompute_reliability();
    }

    fn recompute_reliability(&mut self) {
        if self.total_readings < MIN_READINGS_FOR_RELIABILITY {
            self.reliability = DEFAULT_RELIABILITY;
            return;
        }

        let recent: Vec<&Sample> = self.history.iter().rev().take(RELIABILITY_WINDOW).collect();

        let outlier_factor = 1.0 - self.outlier_rate();

        let clean: Vec<f64> = recent.iter().filter(|s| !s.outlier).map(|s| s.value).collect();
        let consistency = if clean.len() < 2 {
            0.5
        } else {
            (1.0 - 5.0 * stats::coefficient_of_variation(&clean)).clamp(0.0, 1.0)
        };

        // recent is newest-first, so consecutive pairs give positive gaps
        let intervals: Vec<f64> = recent
            .windows(2)
            .map(|w| (w[0].ts - w[1].ts).num_milliseconds() as f64 / 1000.0)
            .collect();
        let interval_stability = if intervals.len() < 2 {
            1.0
        } else {
            1.0 - stats::coefficient_of_variation(&intervals).min(1.0)
        };

        let recent_outliers = recent.iter().filter(|s| s.outlier).count() as f64;
        let recent_factor = 1.0 - recent_outliers / recent.len().max(1) as f64;

        self.reliability = (0.4 * outlier_factor
            + 0.3 * consistency
            + 0.2 * interval_stability
            + 0.1 * recent_factor)
            .clamp(0.0, 1.0);
    }

    fn refresh_health(&mut self, now: DateTime<Utc>, offline_after: Duration) {
        let rate = self.outlier_rate();
        self.health = match self.last_seen() {
            None => HealthStatus::Offline,
            Some(t) if now - t > offline_after => HealthStatus::Offline,
            _ if self.reliability < 0.3 || rate > 0.5 => HealthStatus::Faulty,
            _ if self.reliability < 0.6 || rate > 0.2 => HealthStatus::Degraded,
            _ if self.reliability > 0.8 && rate < 0.1 => HealthStatus::Excellent,
            _ => HealthStatus::Good,
        };
    }
}

// ---------------------------------------------------------------------------
// Outlier detection
// ---------------------------------------------------------------------------

/// IQR multiplier adjusted for how noisy the sensor's history is.
pub(crate) fn adaptive_multiplier(base: f64, cv: f64) -> f64 {
    if cv < 0.1 {
        base * 0.8
    } else if cv > 0.3 {
        base * 1.5
    } else {
        base
    }
}

/// Own-history outlier test for `value`. `history` is oldest-first.
pub(crate) fn is_history_outlier(history: &[f64], value: f64, cfg: &FusionConfig) -> bool {
    if history.len() < MIN_HISTORY_FOR_OUTLIERS {
        return false;
    }

    let mean = stats::mean(history);
    let std = stats::std_dev(history);
    let q1 = stats::quantile(history, 0.25);
    let q3 = stats::quantile(history, 0.75);
    let iqr = q3 - q1;
    let multiplier = adaptive_multiplier(cfg.iqr_multiplier, stats::coefficient_of_variation(history));

    if value < q1 - multiplier * iqr || value > q3 + multiplier * iqr {
        return true;
    }

    if std > stats::EPSILON {
        if ((value - mean) / std).abs() > cfg.z_score_threshold {
            return true;
        }
        let trailing = &history[history.len().saturating_sub(3)..];
        if (value - stats::mean(trailing)).abs() > 2.0 * std {
            return true;
        }
    }

    false
}

/// Peer test: `value` against the median of itself and its peers' current
/// values. Needs at least three values in total.
fn deviates_from_peers(peer_values: &[f64], value: f64) -> bool {
    if peer_values.len() < 2 {
        return false;
    }
    let mut all = peer_values.to_vec();
    all.push(value);
    let med = stats::median(&all);
    let deviations: Vec<f64> = all.iter().map(|v| (v - med).abs()).collect();
    let mad = stats::median(&deviations);
    let tolerance = (3.5 * MAD_SCALE * mad).max(PEER_RELATIVE_FLOOR * med.abs());
    (value - med).abs() > tolerance
}

// ---------------------------------------------------------------------------
// Kalman smoother
// ---------------------------------------------------------------------------

/// Scalar random-walk Kalman filter, seeded by the first measurement.
#[derive(Debug, Clone)]
pub struct ScalarKalman {
    process_noise: f64,
    measurement_noise: f64,
    estimate: Option<f64>,
    error_covariance: f64,
}

impl ScalarKalman {
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            process_noise,
            measurement_noise,
            estimate: None,
            error_covariance: 1.0,
        }
    }

    pub fn update(&mut self, measurement: f64) -> f64 {
        match self.estimate {
            None => {
                self.estimate = Some(measurement);
                self.error_covariance = 1.0;
                measurement
            }
            Some(x) => {
                let predicted_cov = self.error_covariance + self.process_noise;
                let gain = predicted_cov / (predicted_cov + self.measurement_noise);
                let next = x + gain * (measurement - x);
                self.error_covariance = (1.0 - gain) * predicted_cov;
                self.estimate = Some(next);
                next
            }
        }
    }

    pub fn estimate(&self) -> Option<f64> {
        self.estimate
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SensorFusionEngine {
    config: FusionConfig,
    profiles: HashMap<String, SensorProfile>,
    filters: HashMap<SensorClass, ScalarKalman>,
    latest: HashMap<SensorClass, FusionSnapshot>,
}

impl SensorFusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            profiles: HashMap::new(),
            filters: HashMap::new(),
            latest: HashMap::new(),
        }
    }

    fn fresh_window(&self) -> Duration {
        Duration::minutes(self.config.fresh_window_min)
    }

    /// Record one reading and return the refreshed fused value for its class.
    ///
    /// An outlier is kept in history but excluded from this fusion round.
    pub fn add_reading(
        &mut self,
        sensor_id: &str,
        value: f64,
        ts: DateTime<Utc>,
        class: SensorClass,
    ) -> Result<FusionResult> {
        if !value.is_finite() {
            return Err(SteeringError::Sensor {
                sensor_id: sensor_id.to_string(),
                detail: format!("non-finite value {value}"),
            });
        }

        let own_outlier = self
            .profiles
            .get(sensor_id)
            .map(|p| is_history_outlier(&p.values(), value, &self.config))
            .unwrap_or(false);

        let fresh = self.fresh_window();
        let peer_values: Vec<f64> = self
            .profiles
            .values()
            .filter(|p| p.class == class && p.sensor_id != sensor_id)
            .filter(|p| p.is_fresh(ts, fresh) && !p.current_is_outlier())
            .filter_map(|p| p.last_value())
            .collect();
        let peer_outlier = deviates_from_peers(&peer_values, value);

        let capacity = self.config.history_size;
        let profile = self
            .profiles
            .entry(sensor_id.to_string())
            .or_insert_with(|| SensorProfile::new(sensor_id, class, capacity));
        profile.push(Sample {
            value,
            ts,
            outlier: own_outlier || peer_outlier,
        });

        if own_outlier || peer_outlier {
            tracing::debug!(
                sensor = %sensor_id,
                value,
                own_outlier,
                peer_outlier,
                "fusion: reading flagged as outlier"
            );
        }

        self.refresh_health(ts);
        self.fuse(class, ts)
    }

    /// Re-derive health for every profile (offline detection needs `now`).
    pub fn refresh_health(&mut self, now: DateTime<Utc>) {
        let offline_after = Duration::minutes(self.config.offline_after_min);
        for p in self.profiles.values_mut() {
            p.refresh_health(now, offline_after);
        }
    }

    /// Fuse the current values of all sensors of `class`.
    pub fn fuse(&mut self, class: SensorClass, now: DateTime<Utc>) -> Result<FusionResult> {
        let fresh = self.fresh_window();
        let candidates: Vec<&SensorProfile> = self
            .profiles
            .values()
            .filter(|p| p.class == class && p.is_fresh(now, fresh))
            .filter(|p| !matches!(p.health, HealthStatus::Offline | HealthStatus::Faulty))
            .collect();

        let qualifying: Vec<&SensorProfile> = candidates
            .iter()
            .copied()
            .filter(|p| p.reliability >= self.config.reliability_threshold && !p.current_is_outlier())
            .collect();

        let (raw, confidence, count) = if qualifying.len() >= self.config.min_sensors_required.max(1) {
            let mut weighted = 0.0;
            let mut total_weight = 0.0;
            for p in &qualifying {
                let w = p.reliability * p.health.weight();
                weighted += w * p.last_value().unwrap_or_default();
                total_weight += w;
            }
            if total_weight <= stats::EPSILON {
                return Err(SteeringError::NoData {
                    zone_id: String::new(),
                    detail: format!("all {class} weights are zero"),
                });
            }
            (weighted / total_weight, fusion_confidence(&qualifying), qualifying.len())
        } else {
            let best = self.fallback_sensor(class, now).ok_or_else(|| SteeringError::NoData {
                zone_id: String::new(),
                detail: format!("no fresh {class} sensors"),
            })?;
            let value = best.last_value().unwrap_or_default();
            (value, FALLBACK_CONFIDENCE * fusion_confidence(&[best]), 1)
        };

        let cfg = &self.config;
        let smoothed = self
            .filters
            .entry(class)
            .or_insert_with(|| ScalarKalman::new(cfg.process_noise, cfg.measurement_noise))
            .update(raw);

        let result = FusionResult {
            fused_value: smoothed,
            confidence: confidence.clamp(0.0, 1.0),
            active_sensor_count: count,
        };
        self.latest.insert(class, FusionSnapshot { result, at: now });
        Ok(result)
    }

    /// Most reliable fresh sensor, preferring one whose current value is not
    /// flagged.
    fn fallback_sensor(&self, class: SensorClass, now: DateTime<Utc>) -> Option<&SensorProfile> {
        let fresh = self.fresh_window();
        let by_reliability = |a: &&SensorProfile, b: &&SensorProfile| a.reliability.total_cmp(&b.reliability);
        let fresh_of_class = || {
            self.profiles
                .values()
                .filter(move |p| p.class == class && p.is_fresh(now, fresh))
        };
        fresh_of_class()
            .filter(|p| !p.current_is_outlier() && p.health != HealthStatus::Faulty)
            .max_by(by_reliability)
            .or_else(|| fresh_of_class().max_by(by_reliability))
    }

    pub fn latest(&self, class: SensorClass) -> Option<FusionSnapshot> {
        self.latest.get(&class).copied()
    }

    pub fn profile(&self, sensor_id: &str) -> Option<&SensorProfile> {
        self.profiles.get(sensor_id)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &SensorProfile> {
        self.profiles.values()
    }
}

/// Count (30%), mean reliability (40%), agreement (20%), health mix (10%).
fn fusion_confidence(sensors: &[&SensorProfile]) -> f64 {
    if sensors.is_empty() {
        return 0.0;
    }
    let n = sensors.len() as f64;
    let count_factor = (n / SATURATING_SENSOR_COUNT).min(1.0);
    let mean_reliability = sensors.iter().map(|p| p.reliability).sum::<f64>() / n;
    let values: Vec<f64> = sensors.iter().filter_map(|p| p.last_value()).collect();
    let agreement = if values.len() < 2 {
        1.0
    } else {
        (1.0 - 2.0 * stats::coefficient_of_variation(&values)).max(0.0)
    };
    let health_mix = sensors.iter().map(|p| p.health.score()).sum::<f64>() / n;

    (0.3 * count_factor + 0.4 * mean_reliability + 0.2 * agreement + 0.1 * health_mix).clamp(0.0, 1.0)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    fn at_min(m: i64) -> DateTime<Utc> {
        t0() + Duration::minutes(m)
    }

    // -- Outlier detection --------------------------------------------------

    #[test]
    fn adaptive_multiplier_tracks_noise() {
        assert!((adaptive_multiplier(1.5, 0.05) - 1.2).abs() < 1e-9);
        assert!((adaptive_multiplier(1.5, 0.2) - 1.5).abs() < 1e-9);
        assert!((adaptive_multiplier(1.5, 0.4) - 2.25).abs() < 1e-9);
    }

    #[test]
    fn value_far_outside_iqr_is_flagged() {
        let cfg = FusionConfig::default();
        let history = [50.0, 51.0, 49.0, 50.5, 49.5, 50.0, 51.0, 49.0];
        assert!(is_history_outlier(&history, 60.0, &cfg));
        assert!(is_history_outlier(&history, 40.0, &cfg));
    }

    #[test]
    fn value_inside_bounds_and_consistent_is_not_flagged() {
        let cfg = FusionConfig::default();
        let history = [50.0, 51.0, 49.0, 50.5, 49.5, 50.0, 51.0, 49.0];
        assert!(!is_history_outlier(&history, 50.2, &cfg));
        assert!(!is_history_outlier(&history, 49.8, &cfg));
    }

    #[test]
    fn flagging_is_monotonic_in_distance() {
        let cfg = FusionConfig::default();
        let history = [50.0, 51.0, 49.0, 50.5, 49.5, 50.0, 51.0, 49.0];
        let mut flagged_once = false;
        for step in 0..40 {
            let v = 50.0 + step as f64 * 0.5;
            let flagged = is_history_outlier(&history, v, &cfg);
            assert!(!(flagged_once && !flagged), "flag dropped at {v}");
            flagged_once |= flagged;
        }
        assert!(flagged_once);
    }

    #[test]
    fn short_history_never_flags() {
        let cfg = FusionConfig::default();
        assert!(!is_history_outlier(&[50.0, 50.0], 99.0, &cfg));
    }

    #[test]
    fn peer_deviation_needs_three_values() {
        assert!(!deviates_from_peers(&[65.0], 95.0));
        assert!(deviates_from_peers(&[65.0, 64.0], 95.0));
        assert!(!deviates_from_peers(&[65.0, 64.0], 65.5));
    }

    // -- Kalman -------------------------------------------------------------

    #[test]
    fn kalman_seeds_and_converges() {
        let mut k = ScalarKalman::new(0.1, 0.5);
        assert_eq!(k.update(50.0), 50.0);
        let mut last = 50.0;
        for _ in 0..50 {
            last = k.update(60.0);
        }
        assert!((last - 60.0).abs() < 0.01, "estimate {last}");
    }

    // -- Engine -------------------------------------------------------------

    #[test]
    fn non_finite_reading_is_rejected_without_state_change() {
        let mut eng = SensorFusionEngine::new(FusionConfig::default());
        let err = eng.add_reading("s1", f64::NAN, t0(), SensorClass::Vwc);
        assert!(matches!(err, Err(SteeringError::Sensor { .. })));
        assert!(eng.profile("s1").is_none());
        assert!(eng.latest(SensorClass::Vwc).is_none());
    }

    #[test]
    fn single_sensor_falls_back_at_reduced_confidence() {
        let mut eng = SensorFusionEngine::new(FusionConfig::default());
        let r = eng.add_reading("s1", 55.0, t0(), SensorClass::Vwc).unwrap();
        assert_eq!(r.active_sensor_count, 1);
        assert!((r.fused_value - 55.0).abs() < 1e-9);
        assert!(r.confidence <= FALLBACK_CONFIDENCE);
    }

    #[test]
    fn multi_sensor_confidence_beats_fallback() {
        let mut single = SensorFusionEngine::new(FusionConfig::default());
        let fallback = single.add_reading("a", 55.0, t0(), SensorClass::Vwc).unwrap();

        let mut pair = SensorFusionEngine::new(FusionConfig::default());
        pair.add_reading("a", 55.0, t0(), SensorClass::Vwc).unwrap();
        let fused = pair.add_reading("b", 55.0, t0(), SensorClass::Vwc).unwrap();

        assert_eq!(fused.active_sensor_count, 2);
        assert!(fused.confidence >= fallback.confidence);
        assert!((0.0..=1.0).contains(&fused.confidence));
    }

    #[test]
    fn classes_are_fused_independently() {
        let mut eng = SensorFusionEngine::new(FusionConfig::default());
        eng.add_reading("v1", 60.0, t0(), SensorClass::Vwc).unwrap();
        let ec = eng.add_reading("e1", 3.1, t0(), SensorClass::Ec).unwrap();
        assert!((ec.fused_value - 3.1).abs() < 1e-9);
        assert!((eng.latest(SensorClass::Vwc).unwrap().result.fused_value - 60.0).abs() < 1e-9);
    }

    #[test]
    fn disagreeing_sensor_is_isolated() {
        let mut eng = SensorFusionEngine::new(FusionConfig::default());
        let third = [64.0, 66.0, 63.0, 65.0];
        let mut last = None;
        for i in 0..12 {
            let ts = at_min(i);
            eng.add_reading("a", 65.0, ts, SensorClass::Vwc).unwrap();
            eng.add_reading("b", 95.0, ts, SensorClass::Vwc).unwrap();
            last = Some(
                eng.add_reading("c", third[i as usize % third.len()], ts, SensorClass::Vwc)
                    .unwrap(),
            );
        }

        let b = eng.profile("b").unwrap();
        assert!(b.current_is_outlier());
        assert!(b.outlier_rate() > 0.5);
        assert!(matches!(b.health, HealthStatus::Faulty | HealthStatus::Degraded));

        let fused = last.unwrap();
        assert!(
            (64.0..=66.0).contains(&fused.fused_value),
            "fused {}",
            fused.fused_value
        );
        assert_eq!(fused.active_sensor_count, 2);
    }

    #[test]
    fn reliability_defaults_until_ten_readings() {
        let mut eng = SensorFusionEngine::new(FusionConfig::default());
        for i in 0..9 {
            eng.add_reading("s1", 50.0, at_min(i), SensorClass::Vwc).unwrap();
        }
        assert!((eng.profile("s1").unwrap().reliability - DEFAULT_RELIABILITY).abs() < 1e-9);
        eng.add_reading("s1", 50.0, at_min(9), SensorClass::Vwc).unwrap();
        let p = eng.profile("s1").unwrap();
        assert!(p.reliability > 0.9, "steady sensor reliability {}", p.reliability);
        assert_eq!(p.health, HealthStatus::Excellent);
    }

    #[test]
    fn silent_sensor_goes_offline_and_is_not_fused() {
        let mut eng = SensorFusionEngine::new(FusionConfig::default());
        eng.add_reading("old", 40.0, t0(), SensorClass::Vwc).unwrap();
        let r = eng.add_reading("new", 60.0, at_min(45), SensorClass::Vwc).unwrap();
        assert_eq!(eng.profile("old").unwrap().health, HealthStatus::Offline);
        assert_eq!(r.active_sensor_count, 1);
    }

    #[test]
    fn history_is_bounded() {
        let cfg = FusionConfig {
            history_size: 20,
            ..FusionConfig::default()
        };
        let mut eng = SensorFusionEngine::new(cfg);
        for i in 0..100 {
            eng.add_reading("s1", 50.0, at_min(i), SensorClass::Vwc).unwrap();
        }
        let p = eng.profile("s1").unwrap();
        assert_eq!(p.history_len(), 20);
        assert_eq!(p.total_readings, 100);
    }
}
