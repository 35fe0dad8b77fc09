//! Stateful substrate sensor simulator for local development.
//!
//! One node sits in one slab, so every channel observes the same underlying
//! substrate. Models:
//! - Dryback drift while lights are on, much slower in the dark
//! - EC concentrating as the slab dries
//! - Irrigation response: VWC jump and EC dilution toward the feed EC
//! - Per-sensor calibration offsets and Gaussian noise
//! - Occasional spikes and `unavailable` reports (sensor flakiness)

use anyhow::{bail, Result};
use std::fmt;

const VWC_MIN: f64 = 20.0;
const VWC_MAX: f64 = 80.0;
const FEED_EC: f64 = 2.0;

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries steadily under lights. The hub should
    /// settle into regular P2 maintenance shots.
    Drying,
    /// Barely moves. Good for watching the status API without shots.
    Stable,
    /// Heavy noise, frequent spikes and dropouts. Exercises outlier
    /// rejection and sensor health tracking.
    Flaky,
    /// Starts near saturation with high EC. Tests that the hub holds off.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

struct Params {
    start_vwc: f64,
    start_ec: f64,
    /// VWC points lost per sample with lights on.
    drift_per_sample: f64,
    dark_factor: f64,
    vwc_noise: f64,
    ec_noise: f64,
    spike_prob: f32,
    spike_sigma: f64,
    unavailable_prob: f32,
}

impl Params {
    fn for_scenario(scenario: Scenario) -> Self {
        match scenario {
            Scenario::Drying => Self {
                start_vwc: 64.0,
                start_ec: 3.0,
                drift_per_sample: 0.25,
                dark_factor: 0.2,
                vwc_noise: 0.3,
                ec_noise: 0.04,
                spike_prob: 0.02,
                spike_sigma: 6.0,
                unavailable_prob: 0.01,
            },
            Scenario::Stable => Self {
                start_vwc: 62.0,
                start_ec: 3.0,
                drift_per_sample: 0.02,
                dark_factor: 0.5,
                vwc_noise: 0.15,
                ec_noise: 0.02,
                spike_prob: 0.002,
                spike_sigma: 4.0,
                unavailable_prob: 0.0,
            },
            Scenario::Flaky => Self {
                start_vwc: 62.0,
                start_ec: 3.0,
                drift_per_sample: 0.2,
                dark_factor: 0.2,
                vwc_noise: 1.2,
                ec_noise: 0.15,
                spike_prob: 0.10,
                spike_sigma: 12.0,
                unavailable_prob: 0.05,
            },
            Scenario::Wet => Self {
                start_vwc: 75.0,
                start_ec: 4.2,
                drift_per_sample: 0.05,
                dark_factor: 0.3,
                vwc_noise: 0.3,
                ec_noise: 0.04,
                spike_prob: 0.01,
                spike_sigma: 5.0,
                unavailable_prob: 0.01,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Vwc,
    Ec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub sensor_id: String,
    pub kind: ChannelKind,
}

/// Parse `CHANNELS`, e.g. `vwc1:vwc,vwc2:vwc,ec1:ec`.
pub fn parse_channels(s: &str) -> Result<Vec<ChannelSpec>> {
    let mut out = Vec::new();
    for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((id, kind)) = entry.split_once(':') else {
            bail!("channel '{entry}' must be <sensor_id>:<vwc|ec>");
        };
        let kind = match kind.trim().to_ascii_lowercase().as_str() {
            "vwc" => ChannelKind::Vwc,
            "ec" => ChannelKind::Ec,
            other => bail!("channel '{entry}': unknown kind '{other}'"),
        };
        let id = id.trim();
        if id.is_empty() {
            bail!("channel '{entry}' has an empty sensor id");
        }
        if out.iter().any(|c: &ChannelSpec| c.sensor_id == id) {
            bail!("duplicate channel '{id}'");
        }
        out.push(ChannelSpec {
            sensor_id: id.to_string(),
            kind,
        });
    }
    if out.is_empty() {
        bail!("no channels configured");
    }
    Ok(out)
}

struct ChannelState {
    spec: ChannelSpec,
    /// Permanent calibration offset: two probes in one slab never agree.
    offset: f64,
    noise_sigma: f64,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct SubstrateSim {
    params: Params,
    vwc: f64,
    ec: f64,
    channels: Vec<ChannelState>,
}

impl SubstrateSim {
    pub fn new(scenario: Scenario, channels: Vec<ChannelSpec>) -> Self {
        let params = Params::for_scenario(scenario);
        let channels = channels
            .into_iter()
            .map(|spec| {
                let (offset, base_sigma) = match spec.kind {
                    ChannelKind::Vwc => (gaussian(0.0, 0.8), params.vwc_noise),
                    ChannelKind::Ec => (gaussian(0.0, 0.05), params.ec_noise),
                };
                ChannelState {
                    spec,
                    offset,
                    noise_sigma: base_sigma * (1.0 + 0.2 * approx_std_normal()).max(0.3),
                }
            })
            .collect();
        Self {
            vwc: params.start_vwc,
            ec: params.start_ec,
            params,
            channels,
        }
    }

    /// Advance the slab by one sampling interval.
    pub fn step(&mut self, lights_on: bool) {
        let factor = if lights_on { 1.0 } else { self.params.dark_factor };
        let loss = (self.params.drift_per_sample * factor + gaussian(0.0, 0.02)).max(0.0);
        let before = self.vwc;
        self.vwc = (self.vwc - loss).clamp(VWC_MIN, VWC_MAX);
        // salts stay behind as water leaves
        if before > 0.0 {
            self.ec *= before / self.vwc.max(1.0);
        }
        self.ec = self.ec.clamp(0.2, 12.0);
    }

    /// A shot of `size_pct` of the substrate volume landed.
    pub fn apply_shot(&mut self, size_pct: f64) {
        let size = size_pct.max(0.0);
        self.vwc = (self.vwc + size * 1.5).min(VWC_MAX);
        let dilution = (size * 0.08).min(1.0);
        self.ec += (FEED_EC - self.ec) * dilution;
    }

    /// Next reading for channel `index`; `None` models an `unavailable`
    /// report.
    pub fn sample(&self, index: usize) -> Option<f64> {
        let ch = &self.channels[index];
        if fastrand::f32() < self.params.unavailable_prob {
            return None;
        }
        let spike = if fastrand::f32() < self.params.spike_prob {
            gaussian(0.0, self.params.spike_sigma)
        } else {
            0.0
        };
        let reading = match ch.spec.kind {
            ChannelKind::Vwc => (self.vwc + ch.offset + gaussian(0.0, ch.noise_sigma) + spike).clamp(0.0, 100.0),
            ChannelKind::Ec => (self.ec + ch.offset + gaussian(0.0, ch.noise_sigma) + spike / 10.0).max(0.0),
        };
        Some((reading * 100.0).round() / 100.0)
    }

    pub fn channel(&self, index: usize) -> &ChannelSpec {
        &self.channels[index].spec
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn true_vwc(&self) -> f64 {
        self.vwc
    }

    pub fn true_ec(&self) -> f64 {
        self.ec
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> Vec<ChannelSpec> {
        parse_channels("vwc1:vwc,vwc2:vwc,ec1:ec").unwrap()
    }

    // -- Channel parsing ----------------------------------------------------

    #[test]
    fn parse_channels_valid() {
        let c = channels();
        assert_eq!(c.len(), 3);
        assert_eq!(c[0].sensor_id, "vwc1");
        assert_eq!(c[2].kind, ChannelKind::Ec);
        assert_eq!(parse_channels(" a:VWC , ").unwrap()[0].kind, ChannelKind::Vwc);
    }

    #[test]
    fn parse_channels_rejects_garbage() {
        assert!(parse_channels("").is_err());
        assert!(parse_channels("vwc1").is_err());
        assert!(parse_channels("vwc1:ph").is_err());
        assert!(parse_channels(":vwc").is_err());
        assert!(parse_channels("a:vwc,a:ec").is_err());
    }

    // -- Simulation ---------------------------------------------------------

    #[test]
    fn readings_stay_plausible() {
        let mut sim = SubstrateSim::new(Scenario::Flaky, channels());
        for _ in 0..500 {
            sim.step(true);
            for i in 0..sim.channel_count() {
                if let Some(v) = sim.sample(i) {
                    assert!(v.is_finite() && v >= 0.0, "bad reading {v}");
                    if sim.channel(i).kind == ChannelKind::Vwc {
                        assert!(v <= 100.0);
                    }
                }
            }
        }
        assert!(sim.true_vwc() >= VWC_MIN);
    }

    #[test]
    fn lights_on_dries_faster_than_dark() {
        let mut lit = SubstrateSim::new(Scenario::Drying, channels());
        let mut dark = SubstrateSim::new(Scenario::Drying, channels());
        for _ in 0..40 {
            lit.step(true);
            dark.step(false);
        }
        assert!(lit.true_vwc() < dark.true_vwc());
        assert!(lit.true_vwc() < 64.0);
        // drying concentrates salts
        assert!(lit.true_ec() > 3.0);
    }

    #[test]
    fn shot_wets_and_dilutes() {
        let mut sim = SubstrateSim::new(Scenario::Wet, channels());
        for _ in 0..100 {
            sim.step(true);
        }
        let (vwc, ec) = (sim.true_vwc(), sim.true_ec());
        sim.apply_shot(4.0);
        assert!(sim.true_vwc() > vwc);
        assert!(sim.true_ec() < ec);
        assert!(sim.true_ec() > FEED_EC);
    }

    #[test]
    fn shots_never_oversaturate() {
        let mut sim = SubstrateSim::new(Scenario::Wet, channels());
        for _ in 0..20 {
            sim.apply_shot(5.0);
        }
        assert_eq!(sim.true_vwc(), VWC_MAX);
    }

    #[test]
    fn stable_scenario_never_drops_out() {
        let sim = SubstrateSim::new(Scenario::Stable, channels());
        assert!((0..500).all(|_| sim.sample(0).is_some()));
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("drying"), Scenario::Drying);
        assert_eq!(Scenario::from_str_lossy("STABLE"), Scenario::Stable);
        assert_eq!(Scenario::from_str_lossy("Flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("wet"), Scenario::Wet);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Drying);
        assert_eq!(Scenario::Flaky.to_string(), "flaky");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let mean = (0..n).map(|_| approx_std_normal()).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }
}
