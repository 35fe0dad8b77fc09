//! Dryback detection over the fused VWC stream of one zone.
//!
//! Every reading re-runs peak/valley detection over the recent window:
//! quadratic Savitzky-Golay smoothing, adaptive-threshold extremum search,
//! then a four-factor confidence score. Accepted extrema are kept in time
//! order; the current dryback is always measured from the latest accepted
//! peak.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::stats;

/// Accepted extrema retained for status and confidence.
const MAX_EXTREMA: usize = 100;
/// Samples either side of a candidate used for local stability.
const LOCAL_WINDOW: usize = 5;
/// Samples used for the amplitude reference range.
const AMPLITUDE_WINDOW: usize = 30;
/// Samples used for the noise estimate in overall confidence.
const NOISE_WINDOW: usize = 10;
/// Span for the slope-sign check either side of a candidate.
const SLOPE_SPAN: usize = 3;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DrybackConfig {
    pub window: usize,
    pub extended_window: usize,
    pub peak_distance: usize,
    pub noise_threshold: f64,
    pub height_multiplier: f64,
    pub confidence_threshold: f64,
    pub smoothing_window: usize,
    pub min_dryback_minutes: i64,
    pub max_dryback_minutes: i64,
    pub trend_window_min: i64,
    pub min_trend_points: usize,
}

impl Default for DrybackConfig {
    fn default() -> Self {
        Self {
            window: 200,
            extended_window: 400,
            peak_distance: 10,
            noise_threshold: 0.5,
            height_multiplier: 3.0,
            confidence_threshold: 0.7,
            smoothing_window: 15,
            min_dryback_minutes: 5,
            max_dryback_minutes: 480,
            trend_window_min: 30,
            min_trend_points: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtremumKind {
    Peak,
    Valley,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Extremum {
    pub kind: ExtremumKind,
    pub value: f64,
    pub at: DateTime<Utc>,
    pub prominence: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DrybackStatus {
    pub dryback_percentage: f64,
    pub in_progress: bool,
    pub last_peak_value: Option<f64>,
    pub last_peak_at: Option<DateTime<Utc>>,
    pub confidence: f64,
    pub current_vwc: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DrybackPrediction {
    pub minutes_to_target: f64,
    pub rate_pct_per_hour: f64,
    pub current_pct: f64,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    index: usize,
    prominence: f64,
}

#[derive(Debug, Clone)]
pub struct DrybackDetector {
    config: DrybackConfig,
    history: VecDeque<(DateTime<Utc>, f64)>,
    extrema: VecDeque<Extremum>,
    status: DrybackStatus,
}

impl DrybackDetector {
    pub fn new(config: DrybackConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.extended_window),
            config,
            extrema: VecDeque::new(),
            status: DrybackStatus::default(),
        }
    }

    /// Feed one fused VWC value. Non-finite values are ignored.
    pub fn add_reading(&mut self, vwc: f64, at: DateTime<Utc>) -> DrybackStatus {
        if !vwc.is_finite() {
            return self.status;
        }
        if self.history.len() >= self.config.extended_window.max(self.config.window) {
            self.history.pop_front();
        }
        self.history.push_back((at, vwc));

        self.detect_extrema();
        self.update_status(at);
        self.status
    }

    pub fn status(&self) -> DrybackStatus {
        self.status
    }

    pub fn extrema(&self) -> impl DoubleEndedIterator<Item = &Extremum> {
        self.extrema.iter()
    }

    pub fn last_peak(&self) -> Option<&Extremum> {
        self.extrema.iter().rev().find(|e| e.kind == ExtremumKind::Peak)
    }

    /// Start of a new daily cycle: forget everything.
    pub fn reset(&mut self) {
        self.history.clear();
        self.extrema.clear();
        self.status = DrybackStatus::default();
    }

    fn window(&self) -> Vec<(DateTime<Utc>, f64)> {
        let skip = self.history.len().saturating_sub(self.config.window);
        self.history.iter().skip(skip).copied().collect()
    }

    fn detect_extrema(&mut self) {
        let points = self.window();
        if points.len() < 3 {
            return;
        }
        let raw: Vec<f64> = points.iter().map(|p| p.1).collect();
        let smoothed = savitzky_golay(&raw, self.config.smoothing_window);
        let negated: Vec<f64> = smoothed.iter().map(|v| -v).collect();

        let mut candidates: Vec<(ExtremumKind, Candidate)> = find_peaks(&smoothed, &self.config)
            .into_iter()
            .map(|c| (ExtremumKind::Peak, c))
            .chain(
                find_peaks(&negated, &self.config)
                    .into_iter()
                    .map(|c| (ExtremumKind::Valley, c)),
            )
            .collect();
        candidates.sort_by_key(|(_, c)| c.index);

        for (kind, cand) in candidates {
            let at = points[cand.index].0;
            if self.extrema.back().map(|e| at <= e.at).unwrap_or(false) {
                continue;
            }
            let value = raw[cand.index];
            if kind == ExtremumKind::Valley {
                if let Some(peak) = self.last_peak() {
                    if value > peak.value {
                        continue;
                    }
                }
            }

            let oriented = if kind == ExtremumKind::Peak { &smoothed } else { &negated };
            let confidence = self.candidate_confidence(cand, &raw, &smoothed, oriented);
            if confidence < self.config.confidence_threshold {
                continue;
            }

            tracing::debug!(?kind, value, prominence = cand.prominence, confidence, "dryback: extremum accepted");
            if self.extrema.len() >= MAX_EXTREMA {
                self.extrema.pop_front();
            }
            self.extrema.push_back(Extremum {
                kind,
                value,
                at,
                prominence: cand.prominence,
                confidence,
            });
        }
    }

    /// Prominence 30%, local stability 20%, slope consistency 20%,
    /// amplitude vs recent range 30%.
    fn candidate_confidence(&self, cand: Candidate, raw: &[f64], smoothed: &[f64], oriented: &[f64]) -> f64 {
        let n = raw.len();
        let i = cand.index;
        let noise = self.config.noise_threshold.max(stats::EPSILON);

        let prominence_factor = (cand.prominence / noise / 5.0).min(1.0);

        let lo = i.saturating_sub(LOCAL_WINDOW);
        let hi = (i + LOCAL_WINDOW).min(n - 1);
        let residuals: Vec<f64> = (lo..=hi).map(|j| (raw[j] - smoothed[j]).powi(2)).collect();
        let stability = 1.0 / (1.0 + stats::mean(&residuals));

        let mut sides = 0u32;
        let mut correct = 0u32;
        if i > 0 {
            sides += 1;
            if oriented[i] - oriented[i.saturating_sub(SLOPE_SPAN)] >= 0.0 {
                correct += 1;
            }
        }
        if i + 1 < n {
            sides += 1;
            if oriented[(i + SLOPE_SPAN).min(n - 1)] - oriented[i] <= 0.0 {
                correct += 1;
            }
        }
        let slope_factor = if sides == 0 { 0.0 } else { correct as f64 / sides as f64 };

        let recent = &raw[n.saturating_sub(AMPLITUDE_WINDOW)..];
        let range = recent.iter().cloned().fold(f64::MIN, f64::max) - recent.iter().cloned().fold(f64::MAX, f64::min);
        let amplitude_factor = if range > stats::EPSILON {
            (cand.prominence / range).min(1.0)
        } else {
            0.0
        };

        0.3 * prominence_factor + 0.2 * stability + 0.2 * slope_factor + 0.3 * amplitude_factor
    }

    fn update_status(&mut self, now: DateTime<Utc>) {
        let current = self.history.back().map(|p| p.1);
        let peak = self.last_peak().copied();

        let mut status = DrybackStatus {
            current_vwc: current,
            last_peak_value: peak.map(|p| p.value),
            last_peak_at: peak.map(|p| p.at),
            ..DrybackStatus::default()
        };

        if let (Some(cur), Some(peak)) = (current, peak) {
            if peak.value > stats::EPSILON && cur < peak.value {
                status.dryback_percentage = ((peak.value - cur) / peak.value * 100.0).max(0.0);
                let minutes = (now - peak.at).num_seconds() as f64 / 60.0;
                status.in_progress = minutes >= self.config.min_dryback_minutes as f64
                    && minutes <= self.config.max_dryback_minutes as f64;
            }
        }

        status.confidence = self.overall_confidence(now);
        self.status = status;
    }

    /// Data sufficiency 30%, recent extremum confidence 40%, inverse noise 30%.
    fn overall_confidence(&self, now: DateTime<Utc>) -> f64 {
        let sufficiency = (self.history.len() as f64 / self.config.window.max(1) as f64).min(1.0);

        let recent: Vec<f64> = self
            .extrema
            .iter()
            .filter(|e| now - e.at <= Duration::hours(1))
            .map(|e| e.confidence)
            .collect();
        let extremum_confidence = stats::mean(&recent);

        let tail: Vec<f64> = self.history.iter().rev().take(NOISE_WINDOW).map(|p| p.1).collect();
        let noise = stats::coefficient_of_variation(&tail);
        let quietness = 1.0 / (1.0 + 10.0 * noise);

        (0.3 * sufficiency + 0.4 * extremum_confidence + 0.3 * quietness).clamp(0.0, 1.0)
    }

    /// Least-squares VWC change over the trend window, in VWC points per
    /// minute (negative while drying). `None` with too few points.
    pub fn vwc_trend_per_min(&self, now: DateTime<Utc>) -> Option<f64> {
        let (xs, ys) = self.trend_points(now);
        if xs.len() < self.config.min_trend_points {
            return None;
        }
        // x is minutes-ago, so a drying series has a positive slope
        stats::linear_slope(&xs, &ys).map(|s| -s)
    }

    /// Dryback rate in % of the last peak per minute; `None` unless the zone
    /// is actually drying.
    pub fn dryback_rate_pct_per_min(&self, now: DateTime<Utc>) -> Option<f64> {
        let loss_per_min = -self.vwc_trend_per_min(now)?;
        let reference = match self.last_peak() {
            Some(p) => p.value,
            None => self.trend_points(now).1.iter().cloned().fold(f64::MIN, f64::max),
        };
        if reference <= stats::EPSILON {
            return None;
        }
        let rate = loss_per_min / reference * 100.0;
        (rate > stats::EPSILON).then_some(rate)
    }

    /// Extrapolate the time until dryback reaches `target_pct`.
    pub fn predict_time_to_target(&self, target_pct: f64, now: DateTime<Utc>) -> Option<DrybackPrediction> {
        let rate = self.dryback_rate_pct_per_min(now)?;
        let current = self.status.dryback_percentage;
        let remaining = target_pct - current;
        Some(DrybackPrediction {
            minutes_to_target: if remaining <= 0.0 { 0.0 } else { remaining / rate },
            rate_pct_per_hour: rate * 60.0,
            current_pct: current,
        })
    }

    fn trend_points(&self, now: DateTime<Utc>) -> (Vec<f64>, Vec<f64>) {
        let horizon = Duration::minutes(self.config.trend_window_min);
        self.history
            .iter()
            .filter(|(t, _)| now - *t <= horizon && *t <= now)
            .map(|(t, v)| ((now - *t).num_seconds() as f64 / 60.0, *v))
            .unzip()
    }
}

// ---------------------------------------------------------------------------
// Signal helpers
// ---------------------------------------------------------------------------

/// Quadratic Savitzky-Golay smoothing with an odd window of at most
/// `max_window`. Edge points are evaluated on the nearest full window.
/// Fewer than five points are returned unchanged.
pub(crate) fn savitzky_golay(values: &[f64], max_window: usize) -> Vec<f64> {
    let n = values.len();
    if n < 5 {
        return values.to_vec();
    }
    let mut window = max_window.min(n);
    if window % 2 == 0 {
        window -= 1;
    }
    if window < 5 {
        return values.to_vec();
    }
    let half = window / 2;

    (0..n)
        .map(|i| {
            let start = i.saturating_sub(half).min(n - window);
            quadratic_value_at(&values[start..start + window], start, i).unwrap_or(values[i])
        })
        .collect()
}

/// Least-squares quadratic through `segment` (which starts at index
/// `start`), evaluated at index `at`.
fn quadratic_value_at(segment: &[f64], start: usize, at: usize) -> Option<f64> {
    let mut s = [0.0f64; 5];
    let mut y = [0.0f64; 3];
    for (j, v) in segment.iter().enumerate() {
        let t = (start + j) as f64 - at as f64;
        let mut p = 1.0;
        for k in s.iter_mut() {
            *k += p;
            p *= t;
        }
        y[0] += v;
        y[1] += t * v;
        y[2] += t * t * v;
    }
    let m = [[s[0], s[1], s[2]], [s[1], s[2], s[3]], [s[2], s[3], s[4]]];
    let det = det3(&m);
    if det.abs() < stats::EPSILON {
        return None;
    }
    let ma = [[y[0], s[1], s[2]], [y[1], s[2], s[3]], [y[2], s[3], s[4]]];
    Some(det3(&ma) / det)
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Local maxima of `series` separated by `peak_distance`, above the adaptive
/// height floor and with prominence of at least the noise threshold. The
/// first sample may be a peak; the last two may not (unconfirmed).
fn find_peaks(series: &[f64], cfg: &DrybackConfig) -> Vec<Candidate> {
    let n = series.len();
    let mut out = Vec::new();
    if n < 3 {
        return out;
    }
    let height_floor = stats::mean(series) - stats::std_dev(series) * cfg.height_multiplier;

    for i in 0..n.saturating_sub(2) {
        let v = series[i];
        if i > 0 && v <= series[i - 1] {
            continue;
        }
        if v < series[i + 1] {
            continue;
        }
        let lo = i.saturating_sub(cfg.peak_distance);
        let hi = (i + cfg.peak_distance).min(n - 1);
        if series[lo..=hi].iter().any(|&x| x > v) {
            continue;
        }
        if v < height_floor {
            continue;
        }

        let left_base = base_towards(series[..i].iter().rev(), v);
        let right_base = base_towards(series[i + 1..].iter(), v);
        let base = match (left_base, right_base) {
            (Some(l), Some(r)) => l.max(r),
            (Some(b), None) | (None, Some(b)) => b,
            (None, None) => continue,
        };
        let prominence = v - base;
        if prominence < cfg.noise_threshold {
            continue;
        }
        out.push(Candidate { index: i, prominence });
    }
    out
}

/// Minimum of the values walked until one exceeds `peak`.
fn base_towards<'a>(values: impl Iterator<Item = &'a f64>, peak: f64) -> Option<f64> {
    let mut base: Option<f64> = None;
    for &x in values {
        if x > peak {
            break;
        }
        base = Some(base.map_or(x, |b: f64| b.min(x)));
    }
    base
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap()
    }

    fn feed(det: &mut DrybackDetector, values: &[f64], step_min: i64) -> DrybackStatus {
        let mut status = DrybackStatus::default();
        for (i, v) in values.iter().enumerate() {
            status = det.add_reading(*v, t0() + Duration::minutes(i as i64 * step_min));
        }
        status
    }

    // -- Smoothing ----------------------------------------------------------

    #[test]
    fn smoothing_passes_short_series_through() {
        assert_eq!(savitzky_golay(&[1.0, 2.0, 3.0], 15), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn smoothing_preserves_a_parabola() {
        let v: Vec<f64> = (0..11).map(|x| 50.0 + 0.3 * x as f64 - 0.05 * (x * x) as f64).collect();
        let s = savitzky_golay(&v, 7);
        for (a, b) in v.iter().zip(&s) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    // -- Scenario -----------------------------------------------------------

    #[test]
    fn morning_dryback_scenario() {
        let mut det = DrybackDetector::new(DrybackConfig::default());
        let status = feed(&mut det, &[70.0, 70.0, 69.0, 65.0, 60.0, 55.0, 50.0], 5);

        let peak = det.last_peak().expect("peak accepted");
        assert!((peak.value - 70.0).abs() < 0.5);
        assert!(status.in_progress);
        assert!((status.dryback_percentage - 28.571).abs() < 0.1, "pct {}", status.dryback_percentage);
        assert!((0.0..=1.0).contains(&status.confidence));
    }

    #[test]
    fn no_dryback_within_first_minutes_of_peak() {
        let mut det = DrybackDetector::new(DrybackConfig::default());
        // one-minute cadence: the dip after the peak is only 2 min old
        let status = feed(&mut det, &[70.0, 70.0, 69.0], 1);
        assert!(det.last_peak().is_some());
        assert!(!status.in_progress);
        assert!(status.dryback_percentage > 0.0);
    }

    #[test]
    fn rising_series_has_no_dryback() {
        let mut det = DrybackDetector::new(DrybackConfig::default());
        let status = feed(&mut det, &[50.0, 52.0, 54.0, 56.0, 58.0, 60.0], 5);
        assert!(!status.in_progress);
        assert_eq!(status.dryback_percentage, 0.0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut det = DrybackDetector::new(DrybackConfig::default());
        feed(&mut det, &[70.0, 70.0, 69.0, 65.0, 60.0], 5);
        det.reset();
        assert_eq!(det.status().dryback_percentage, 0.0);
        assert!(det.last_peak().is_none());
        assert_eq!(det.extrema().count(), 0);
    }

    #[test]
    fn valleys_never_exceed_preceding_peak() {
        let mut det = DrybackDetector::new(DrybackConfig::default());
        // two irrigation cycles with noise
        let mut values = Vec::new();
        for cycle in 0..3 {
            for k in 0..25 {
                values.push(68.0 - k as f64 * 0.6 + if k % 2 == 0 { 0.1 } else { -0.1 } + cycle as f64);
            }
            for k in 0..5 {
                values.push(53.0 + k as f64 * 3.0);
            }
        }
        let status = feed(&mut det, &values, 5);
        assert!(status.dryback_percentage >= 0.0);

        let mut last_peak: Option<f64> = None;
        for e in det.extrema() {
            match e.kind {
                ExtremumKind::Peak => last_peak = Some(e.value),
                ExtremumKind::Valley => {
                    if let Some(p) = last_peak {
                        assert!(e.value <= p, "valley {} above peak {p}", e.value);
                    }
                }
            }
        }
        let ats: Vec<_> = det.extrema().map(|e| e.at).collect();
        assert!(ats.windows(2).all(|w| w[0] < w[1]));
    }

    // -- Prediction ---------------------------------------------------------

    #[test]
    fn predicts_time_to_target_from_trend() {
        let mut det = DrybackDetector::new(DrybackConfig::default());
        feed(&mut det, &[70.0, 70.0, 69.0, 65.0, 60.0, 55.0, 50.0], 5);
        let now = t0() + Duration::minutes(30);

        let pred = det.predict_time_to_target(40.0, now).expect("trend usable");
        assert!(pred.rate_pct_per_hour > 0.0);
        assert!(pred.minutes_to_target > 0.0);

        let reached = det.predict_time_to_target(20.0, now).unwrap();
        assert_eq!(reached.minutes_to_target, 0.0);
    }

    #[test]
    fn prediction_unavailable_with_too_few_points() {
        let mut det = DrybackDetector::new(DrybackConfig::default());
        feed(&mut det, &[70.0, 69.0, 68.0], 5);
        assert!(det.predict_time_to_target(20.0, t0() + Duration::minutes(10)).is_none());
    }

    #[test]
    fn prediction_unavailable_when_wetting() {
        let mut det = DrybackDetector::new(DrybackConfig::default());
        feed(&mut det, &[50.0, 52.0, 54.0, 56.0, 58.0, 60.0], 5);
        assert!(det.predict_time_to_target(20.0, t0() + Duration::minutes(25)).is_none());
    }
}
