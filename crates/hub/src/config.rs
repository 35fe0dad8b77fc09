//! TOML config file loading and validation: system settings, algorithm
//! tuning, crop profiles, zones and sensors.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::dryback::DrybackConfig;
use crate::fusion::{FusionConfig, SensorClass};
use crate::lights::LightSchedule;
use crate::phase::PhaseTargets;
use crate::predictor::PredictorConfig;

// ---------------------------------------------------------------------------
// Operation mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Decisions drive the hardware.
    #[default]
    Auto,
    /// Decisions are computed and recorded, nothing is actuated.
    Monitor,
    /// Decision ticks are skipped.
    Off,
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationMode::Auto => "AUTO",
            OperationMode::Monitor => "MONITOR",
            OperationMode::Off => "OFF",
        })
    }
}

impl FromStr for OperationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "AUTO" => Ok(OperationMode::Auto),
            "MONITOR" => Ok(OperationMode::Monitor),
            "OFF" => Ok(OperationMode::Off),
            other => Err(format!("unknown mode '{other}' (use AUTO/MONITOR/OFF)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub dryback: DrybackConfig,
    #[serde(default)]
    pub crop_profiles: Vec<CropProfile>,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub mode: OperationMode,
    pub utc_offset_minutes: i32,
    pub lights_on: String,
    pub lights_off: String,
    pub tick_interval_sec: u64,

    pub pump_gpio_pin: i64,
    pub main_line_gpio_pin: i64,
    pub waste_valve_gpio_pin: i64,

    pub pump_settle_sec: f64,
    pub main_line_settle_sec: f64,
    pub absorption_delay_sec: f64,

    pub predictor_confidence_floor: f64,
    pub predictor_irrigate_threshold: f64,
    pub min_training_samples: usize,
    pub update_frequency: usize,
    pub training_buffer: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            mode: OperationMode::Auto,
            utc_offset_minutes: 0,
            lights_on: "06:00".into(),
            lights_off: "18:00".into(),
            tick_interval_sec: 60,
            pump_gpio_pin: 5,
            main_line_gpio_pin: 6,
            waste_valve_gpio_pin: 13,
            pump_settle_sec: 2.0,
            main_line_settle_sec: 1.0,
            absorption_delay_sec: 30.0,
            predictor_confidence_floor: 0.7,
            predictor_irrigate_threshold: 0.7,
            min_training_samples: 30,
            update_frequency: 50,
            training_buffer: 1000,
        }
    }
}

impl SystemConfig {
    pub fn predictor(&self) -> PredictorConfig {
        PredictorConfig {
            min_training_samples: self.min_training_samples,
            update_frequency: self.update_frequency,
            training_buffer: self.training_buffer,
        }
    }
}

/// Named target set. Zones refer to one by name; `generic` always exists.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CropProfile {
    pub name: String,
    #[serde(default = "default_p0_dryback")]
    pub p0_dryback_target_pct: f64,
    #[serde(default = "default_p1_target")]
    pub p1_target_vwc: f64,
    #[serde(default = "default_p2_threshold")]
    pub p2_vwc_threshold: f64,
    #[serde(default = "default_ec_target")]
    pub ec_target: f64,
    #[serde(default = "default_overnight_dryback")]
    pub overnight_dryback_target_pct: f64,
}

fn default_p0_dryback() -> f64 {
    15.0
}
fn default_p1_target() -> f64 {
    65.0
}
fn default_p2_threshold() -> f64 {
    60.0
}
fn default_ec_target() -> f64 {
    3.0
}
fn default_overnight_dryback() -> f64 {
    10.0
}

pub const GENERIC_PROFILE: &str = "generic";

impl CropProfile {
    pub fn generic() -> Self {
        Self {
            name: GENERIC_PROFILE.into(),
            p0_dryback_target_pct: default_p0_dryback(),
            p1_target_vwc: default_p1_target(),
            p2_vwc_threshold: default_p2_threshold(),
            ec_target: default_ec_target(),
            overnight_dryback_target_pct: default_overnight_dryback(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZonePriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub zone_id: String,
    pub name: String,
    pub valve_gpio_pin: i64,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub priority: ZonePriority,
    #[serde(default)]
    pub crop_profile: Option<String>,
    #[serde(default = "default_substrate_volume")]
    pub substrate_volume_l: f64,
    #[serde(default = "default_flow_rate")]
    pub flow_rate_lph: f64,
    #[serde(default)]
    pub safety: SafetyLimits,
    #[serde(default)]
    pub p0: P0Params,
    #[serde(default)]
    pub p1: P1Params,
    #[serde(default)]
    pub p2: P2Params,
    #[serde(default)]
    pub p3: P3Params,
}

fn default_substrate_volume() -> f64 {
    10.0
}
fn default_flow_rate() -> f64 {
    20.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SafetyLimits {
    pub critical_min_vwc: f64,
    pub critical_max_vwc: f64,
    pub max_safe_ec: f64,
    pub min_interval_min: i64,
    pub max_daily_volume_l: f64,
    pub max_daily_shots: u32,
    pub stale_timeout_min: i64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            critical_min_vwc: 40.0,
            critical_max_vwc: 85.0,
            max_safe_ec: 6.0,
            min_interval_min: 10,
            max_daily_volume_l: 20.0,
            max_daily_shots: 40,
            stale_timeout_min: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct P0Params {
    /// Overrides the crop profile's dryback target.
    pub dryback_target_pct: Option<f64>,
    pub max_wait_min: i64,
}

impl Default for P0Params {
    fn default() -> Self {
        Self {
            dryback_target_pct: None,
            max_wait_min: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct P1Params {
    pub shot_interval_min: i64,
    pub min_shots: u32,
    pub max_shots: u32,
    pub base_shot_pct: f64,
    pub shot_increment_pct: f64,
    pub max_shot_pct: f64,
    /// Overrides the crop profile's ramp-up target.
    pub target_vwc: Option<f64>,
    pub ec_flush_target: f64,
}

impl Default for P1Params {
    fn default() -> Self {
        Self {
            shot_interval_min: 15,
            min_shots: 3,
            max_shots: 6,
            base_shot_pct: 2.0,
            shot_increment_pct: 0.5,
            max_shot_pct: 5.0,
            target_vwc: None,
            ec_flush_target: 2.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct P2Params {
    pub shot_pct: f64,
    /// Overrides the crop profile's maintenance threshold.
    pub vwc_threshold: Option<f64>,
    pub ec_high_ratio: f64,
    pub ec_low_ratio: f64,
    pub ec_high_delta: f64,
    pub ec_low_delta: f64,
    pub ec_stacking: bool,
    pub ec_stacking_target_ratio: f64,
    pub ec_stacking_reduction: f64,
    /// Dryback from the last peak that triggers a shot; 0 disables.
    pub dryback_trigger_pct: f64,
}

impl Default for P2Params {
    fn default() -> Self {
        Self {
            shot_pct: 2.0,
            vwc_threshold: None,
            ec_high_ratio: 1.2,
            ec_low_ratio: 0.8,
            ec_high_delta: 2.0,
            ec_low_delta: -2.0,
            ec_stacking: false,
            ec_stacking_target_ratio: 1.3,
            ec_stacking_reduction: 3.0,
            dryback_trigger_pct: 8.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct P3Params {
    pub emergency_vwc: f64,
    pub emergency_shot_pct: f64,
    /// Base lead before lights-off when no dryback rate is known.
    pub heuristic_lead_min: f64,
}

impl Default for P3Params {
    fn default() -> Self {
        Self {
            emergency_vwc: 50.0,
            emergency_shot_pct: 1.0,
            heuristic_lead_min: 60.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub sensor_id: String,
    pub node_id: String,
    pub zone_id: String,
    pub class: SensorClass,
}

// ---------------------------------------------------------------------------
// Resolved per-zone settings
// ---------------------------------------------------------------------------

/// A zone entry with its crop profile resolved and overrides applied.
#[derive(Debug, Clone)]
pub struct ZoneSettings {
    pub zone_id: String,
    pub name: String,
    pub valve_gpio_pin: u8,
    pub group: Option<String>,
    pub priority: ZonePriority,
    pub substrate_volume_l: f64,
    pub flow_rate_lph: f64,
    pub safety: SafetyLimits,
    pub p0: P0Params,
    pub p1: P1Params,
    pub p2: P2Params,
    pub p3: P3Params,
    pub profile: CropProfile,
}

impl ZoneSettings {
    pub fn p0_dryback_target(&self) -> f64 {
        self.p0.dryback_target_pct.unwrap_or(self.profile.p0_dryback_target_pct)
    }

    pub fn p1_target_vwc(&self) -> f64 {
        self.p1.target_vwc.unwrap_or(self.profile.p1_target_vwc)
    }

    pub fn p2_threshold(&self) -> f64 {
        self.p2.vwc_threshold.unwrap_or(self.profile.p2_vwc_threshold)
    }

    pub fn phase_targets(&self) -> PhaseTargets {
        PhaseTargets {
            p0_dryback_target_pct: self.p0_dryback_target(),
            p0_max_wait_min: self.p0.max_wait_min,
            p1_target_vwc: self.p1_target_vwc(),
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_system(&mut errors);
        self.validate_profiles(&mut errors);
        self.validate_zones(&mut errors);
        self.validate_sensors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_system(&self, errors: &mut Vec<String>) {
        let s = &self.system;
        if let Err(e) = self.lights() {
            errors.push(format!("system: {e:#}"));
        }
        if s.tick_interval_sec == 0 {
            errors.push("system: tick_interval_sec must be positive".into());
        }
        for (name, v) in [
            ("pump_settle_sec", s.pump_settle_sec),
            ("main_line_settle_sec", s.main_line_settle_sec),
            ("absorption_delay_sec", s.absorption_delay_sec),
        ] {
            if !(v >= 0.0) {
                errors.push(format!("system: {name} must be >= 0, got {v}"));
            }
        }
        for (name, v) in [
            ("predictor_confidence_floor", s.predictor_confidence_floor),
            ("predictor_irrigate_threshold", s.predictor_irrigate_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                errors.push(format!("system: {name} {v} out of range [0.0, 1.0]"));
            }
        }
        if s.update_frequency == 0 || s.training_buffer == 0 {
            errors.push("system: update_frequency and training_buffer must be positive".into());
        }
        if self.fusion.min_sensors_required == 0 {
            errors.push("fusion: min_sensors_required must be at least 1".into());
        }
        if self.dryback.window < 5 {
            errors.push(format!("dryback: window {} too small (min 5)", self.dryback.window));
        }
        if self.dryback.min_dryback_minutes >= self.dryback.max_dryback_minutes {
            errors.push("dryback: min_dryback_minutes must be below max_dryback_minutes".into());
        }
    }

    fn validate_profiles(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, p) in self.crop_profiles.iter().enumerate() {
            if p.name.trim().is_empty() {
                errors.push(format!("crop_profiles[{i}]: name is empty"));
            } else if !seen.insert(&p.name) {
                errors.push(format!("crop profile '{}': duplicate name", p.name));
            }
            if p.ec_target <= 0.0 {
                errors.push(format!("crop profile '{}': ec_target must be positive", p.name));
            }
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashMap<i64, String> = HashMap::new();

        for (name, pin) in [
            ("pump", self.system.pump_gpio_pin),
            ("main_line", self.system.main_line_gpio_pin),
            ("waste_valve", self.system.waste_valve_gpio_pin),
        ] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "system: {name}_gpio_pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if let Some(owner) = seen_pins.insert(pin, name.to_string()) {
                errors.push(format!("system: {name}_gpio_pin {pin} is already used by {owner}"));
            }
        }

        let vwc_zones: HashSet<&str> = self
            .sensors
            .iter()
            .filter(|s| s.class == SensorClass::Vwc)
            .map(|s| s.zone_id.as_str())
            .collect();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.zone_id.is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.zone_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if z.zone_id.trim().is_empty() {
                errors.push(format!("{}: zone_id is empty", ctx()));
            } else if !seen_ids.insert(&z.zone_id) {
                errors.push(format!("{}: duplicate zone_id", ctx()));
            }
            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if !z.zone_id.is_empty() && !vwc_zones.contains(z.zone_id.as_str()) {
                errors.push(format!("{}: no vwc sensor assigned", ctx()));
            }

            // ── Crop profile ────────────────────────────────────
            if let Some(profile) = &z.crop_profile {
                if profile != GENERIC_PROFILE && !self.crop_profiles.iter().any(|p| &p.name == profile) {
                    errors.push(format!("{}: crop_profile '{profile}' is not defined", ctx()));
                }
            }

            // ── Hydraulics ──────────────────────────────────────
            if z.substrate_volume_l <= 0.0 {
                errors.push(format!(
                    "{}: substrate_volume_l must be positive, got {}",
                    ctx(),
                    z.substrate_volume_l
                ));
            }
            if z.flow_rate_lph <= 0.0 {
                errors.push(format!("{}: flow_rate_lph must be positive, got {}", ctx(), z.flow_rate_lph));
            }

            // ── Safety bounds ───────────────────────────────────
            let s = &z.safety;
            if s.critical_min_vwc >= s.critical_max_vwc {
                errors.push(format!(
                    "{}: critical_min_vwc ({}) must be below critical_max_vwc ({})",
                    ctx(),
                    s.critical_min_vwc,
                    s.critical_max_vwc
                ));
            }
            if s.max_safe_ec <= 0.0 {
                errors.push(format!("{}: max_safe_ec must be positive", ctx()));
            }
            if s.min_interval_min < 0 {
                errors.push(format!("{}: min_interval_min must be >= 0", ctx()));
            }
            if s.stale_timeout_min <= 0 {
                errors.push(format!(
                    "{}: stale_timeout_min must be positive, got {}",
                    ctx(),
                    s.stale_timeout_min
                ));
            }
            if s.max_daily_volume_l <= 0.0 || s.max_daily_shots == 0 {
                errors.push(format!("{}: daily volume and shot limits must be positive", ctx()));
            }

            // ── Phase parameters ────────────────────────────────
            if z.p0.max_wait_min <= 0 {
                errors.push(format!("{}: p0.max_wait_min must be positive", ctx()));
            }
            if z.p1.min_shots > z.p1.max_shots {
                errors.push(format!(
                    "{}: p1.min_shots ({}) exceeds p1.max_shots ({})",
                    ctx(),
                    z.p1.min_shots,
                    z.p1.max_shots
                ));
            }
            if z.p1.shot_interval_min <= 0 {
                errors.push(format!("{}: p1.shot_interval_min must be positive", ctx()));
            }
            for (name, v) in [
                ("p1.base_shot_pct", z.p1.base_shot_pct),
                ("p1.max_shot_pct", z.p1.max_shot_pct),
                ("p2.shot_pct", z.p2.shot_pct),
                ("p3.emergency_shot_pct", z.p3.emergency_shot_pct),
            ] {
                if v <= 0.0 {
                    errors.push(format!("{}: {name} must be positive, got {v}", ctx()));
                }
            }
            if z.p1.shot_increment_pct < 0.0 {
                errors.push(format!("{}: p1.shot_increment_pct must be >= 0", ctx()));
            }
            if z.p2.ec_low_ratio >= z.p2.ec_high_ratio {
                errors.push(format!("{}: p2.ec_low_ratio must be below p2.ec_high_ratio", ctx()));
            }
            if z.p3.emergency_vwc >= self.zone_p2_threshold(z) {
                errors.push(format!(
                    "{}: p3.emergency_vwc ({}) must be below the p2 threshold",
                    ctx(),
                    z.p3.emergency_vwc
                ));
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&z.valve_gpio_pin) {
                errors.push(format!(
                    "{}: valve_gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    z.valve_gpio_pin
                ));
            } else if let Some(owner) = seen_pins.insert(z.valve_gpio_pin, ctx()) {
                errors.push(format!(
                    "{}: valve_gpio_pin {} is already used by {owner}",
                    ctx(),
                    z.valve_gpio_pin
                ));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let zone_ids: HashSet<&str> = self.zones.iter().map(|z| z.zone_id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || {
                if s.sensor_id.is_empty() {
                    format!("sensors[{i}]")
                } else {
                    format!("sensor '{}'", s.sensor_id)
                }
            };

            if s.sensor_id.trim().is_empty() {
                errors.push(format!("{}: sensor_id is empty", ctx()));
            } else if !seen_ids.insert(&s.sensor_id) {
                errors.push(format!("{}: duplicate sensor_id", ctx()));
            }

            if s.node_id.trim().is_empty() {
                errors.push(format!("{}: node_id is empty", ctx()));
            } else if !s.sensor_id.starts_with(&format!("{}/", s.node_id)) {
                errors.push(format!(
                    "{}: sensor_id must be qualified as '{}/<channel>'",
                    ctx(),
                    s.node_id
                ));
            }

            if s.zone_id.trim().is_empty() {
                errors.push(format!("{}: zone_id is empty", ctx()));
            } else if !zone_ids.contains(s.zone_id.as_str()) {
                errors.push(format!(
                    "{}: zone_id '{}' does not match any defined zone",
                    ctx(),
                    s.zone_id
                ));
            }
        }
    }

    fn zone_p2_threshold(&self, z: &ZoneEntry) -> f64 {
        z.p2.vwc_threshold.unwrap_or_else(|| self.profile(z.crop_profile.as_deref()).p2_vwc_threshold)
    }

    // -- Lookups ------------------------------------------------------------

    pub fn lights(&self) -> Result<LightSchedule> {
        LightSchedule::parse(
            &self.system.lights_on,
            &self.system.lights_off,
            self.system.utc_offset_minutes,
        )
    }

    /// Profile by name; unknown or missing names fall back to `generic`.
    pub fn profile(&self, name: Option<&str>) -> CropProfile {
        let name = name.unwrap_or(GENERIC_PROFILE);
        self.crop_profiles
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .unwrap_or_else(CropProfile::generic)
    }

    pub fn zone_settings(&self) -> Vec<ZoneSettings> {
        self.zones
            .iter()
            .map(|z| ZoneSettings {
                zone_id: z.zone_id.clone(),
                name: z.name.clone(),
                valve_gpio_pin: z.valve_gpio_pin as u8,
                group: z.group.clone(),
                priority: z.priority,
                substrate_volume_l: z.substrate_volume_l,
                flow_rate_lph: z.flow_rate_lph,
                safety: z.safety.clone(),
                p0: z.p0.clone(),
                p1: z.p1.clone(),
                p2: z.p2.clone(),
                p3: z.p3.clone(),
                profile: self.profile(z.crop_profile.as_deref()),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    tracing::info!(
        zones = config.zones.len(),
        sensors = config.sensors.len(),
        profiles = config.crop_profiles.len(),
        mode = %config.system.mode,
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    pub(crate) fn valid_zone() -> ZoneEntry {
        ZoneEntry {
            zone_id: "z1".into(),
            name: "Zone 1".into(),
            valve_gpio_pin: 17,
            group: None,
            priority: ZonePriority::Normal,
            crop_profile: None,
            substrate_volume_l: 10.0,
            flow_rate_lph: 20.0,
            safety: SafetyLimits::default(),
            p0: P0Params::default(),
            p1: P1Params::default(),
            p2: P2Params::default(),
            p3: P3Params::default(),
        }
    }

    pub(crate) fn vwc_sensor(id: &str, zone: &str) -> SensorEntry {
        SensorEntry {
            sensor_id: format!("node-a/{id}"),
            node_id: "node-a".into(),
            zone_id: zone.into(),
            class: SensorClass::Vwc,
        }
    }

    pub(crate) fn valid_config() -> Config {
        Config {
            system: SystemConfig::default(),
            fusion: FusionConfig::default(),
            dryback: DrybackConfig::default(),
            crop_profiles: vec![],
            zones: vec![valid_zone()],
            sensors: vec![vwc_sensor("s1", "z1")],
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[system]
mode = "monitor"
utc_offset_minutes = 60
lights_on = "07:00"
lights_off = "19:00"

[fusion]
min_sensors_required = 1

[[crop_profiles]]
name = "tomato"
p2_vwc_threshold = 58.0
ec_target = 3.5

[[zones]]
zone_id = "z1"
name = "Bench 1"
valve_gpio_pin = 17
group = "north"
priority = "high"
crop_profile = "tomato"

[zones.safety]
max_safe_ec = 5.5

[zones.p1]
max_shots = 8

[[sensors]]
sensor_id = "node-a/vwc1"
node_id = "node-a"
zone_id = "z1"
class = "vwc"

[[sensors]]
sensor_id = "node-a/ec1"
node_id = "node-a"
zone_id = "z1"
class = "ec"
"#;
        let config = parse(toml_str).unwrap();
        assert_eq!(config.system.mode, OperationMode::Monitor);
        assert_eq!(config.fusion.min_sensors_required, 1);
        assert_eq!(config.zones[0].priority, ZonePriority::High);
        assert_eq!(config.zones[0].safety.max_safe_ec, 5.5);
        assert_eq!(config.zones[0].p1.max_shots, 8);
        assert_eq!(config.zones[0].p1.min_shots, 3);
        assert_eq!(config.sensors[1].class, SensorClass::Ec);

        let settings = &config.zone_settings()[0];
        assert_eq!(settings.profile.name, "tomato");
        assert_eq!(settings.p2_threshold(), 58.0);
        assert_eq!(settings.p1_target_vwc(), 65.0);
        assert_eq!(settings.group.as_deref(), Some("north"));
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.zones.is_empty());
        assert_eq!(config.system.tick_interval_sec, 60);
        config.validate().unwrap();
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("auto".parse::<OperationMode>().unwrap(), OperationMode::Auto);
        assert_eq!(" MONITOR ".parse::<OperationMode>().unwrap(), OperationMode::Monitor);
        assert_eq!("Off".parse::<OperationMode>().unwrap(), OperationMode::Off);
        assert!("sleep".parse::<OperationMode>().is_err());
    }

    // -- Validation: valid configs pass -----------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn unknown_profile_falls_back_to_generic() {
        let cfg = valid_config();
        assert_eq!(cfg.profile(Some("nope")), CropProfile::generic());
        assert_eq!(cfg.zone_settings()[0].profile.name, GENERIC_PROFILE);
    }

    // -- Zone rules -------------------------------------------------------

    #[test]
    fn zone_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.zones.push(ZoneEntry {
            valve_gpio_pin: 27, // different pin, same id
            ..valid_zone()
        });
        assert_validation_err(&cfg, "duplicate zone_id");
    }

    #[test]
    fn zone_without_vwc_sensor_rejected() {
        let mut cfg = valid_config();
        cfg.sensors[0].class = SensorClass::Ec;
        assert_validation_err(&cfg, "no vwc sensor assigned");
    }

    #[test]
    fn critical_bounds_must_be_ordered() {
        let mut cfg = valid_config();
        cfg.zones[0].safety.critical_min_vwc = 90.0;
        assert_validation_err(&cfg, "critical_min_vwc (90) must be below critical_max_vwc (85)");
    }

    #[test]
    fn min_shots_above_max_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].p1.min_shots = 9;
        assert_validation_err(&cfg, "p1.min_shots (9) exceeds p1.max_shots (6)");
    }

    #[test]
    fn shot_sizes_must_be_positive() {
        let mut cfg = valid_config();
        cfg.zones[0].p2.shot_pct = 0.0;
        assert_validation_err(&cfg, "p2.shot_pct must be positive");
    }

    #[test]
    fn undefined_crop_profile_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].crop_profile = Some("cannabis".into());
        assert_validation_err(&cfg, "crop_profile 'cannabis' is not defined");
    }

    #[test]
    fn emergency_threshold_below_maintenance() {
        let mut cfg = valid_config();
        cfg.zones[0].p3.emergency_vwc = 61.0;
        assert_validation_err(&cfg, "p3.emergency_vwc (61) must be below the p2 threshold");
    }

    // -- GPIO -------------------------------------------------------------

    #[test]
    fn zone_gpio_pin_0_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].valve_gpio_pin = 0;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn zone_pin_clashing_with_pump_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].valve_gpio_pin = cfg.system.pump_gpio_pin;
        assert_validation_err(&cfg, "already used by pump");
    }

    #[test]
    fn zone_duplicate_gpio_rejected() {
        let mut cfg = valid_config();
        cfg.zones.push(ZoneEntry {
            zone_id: "z2".into(),
            name: "Zone 2".into(),
            ..valid_zone()
        });
        cfg.sensors.push(vwc_sensor("s2", "z2"));
        assert_validation_err(&cfg, "already used by zone 'z1'");
    }

    // -- Sensors ----------------------------------------------------------

    #[test]
    fn sensor_unknown_zone_rejected() {
        let mut cfg = valid_config();
        cfg.sensors.push(vwc_sensor("s2", "nonexistent"));
        assert_validation_err(&cfg, "does not match any defined zone");
    }

    #[test]
    fn sensor_must_be_qualified_by_node() {
        let mut cfg = valid_config();
        cfg.sensors[0].sensor_id = "s1".into();
        assert_validation_err(&cfg, "must be qualified as 'node-a/<channel>'");
    }

    // -- System -----------------------------------------------------------

    #[test]
    fn equal_light_times_rejected() {
        let mut cfg = valid_config();
        cfg.system.lights_off = "06:00".into();
        assert_validation_err(&cfg, "lights_on and lights_off are both");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.zones[0].zone_id = "".into();
        cfg.zones[0].valve_gpio_pin = 0;
        cfg.system.lights_on = "nonsense".into();
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("zone_id is empty"), "missing zone_id error in: {msg}");
        assert!(msg.contains("not a valid BCM GPIO pin"), "missing gpio error in: {msg}");
        assert!(msg.contains("invalid time of day"), "missing lights error in: {msg}");
    }
}
