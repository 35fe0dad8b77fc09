//! Per-zone irrigation rules and phase-exit conditions.
//!
//! Everything here is a pure function of a read-only view of one zone; the
//! orchestrator gathers the view, calls in, and applies the outcome.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::ZoneSettings;
use crate::dryback::DrybackStatus;
use crate::fusion::FusionSnapshot;
use crate::phase::{Phase, PhaseData, ShotKind, TransitionEvent, WaterUsage};
use crate::predictor::Prediction;

/// Bounds on the lead time before lights-off for the P2 -> P3 switch.
const MIN_OVERNIGHT_LEAD_MIN: f64 = 30.0;
const MAX_OVERNIGHT_LEAD_MIN: f64 = 120.0;
/// Substrate volume and overnight target the heuristic lead is scaled from.
const REFERENCE_VOLUME_L: f64 = 10.0;
const REFERENCE_OVERNIGHT_PCT: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Irrigate,
    Wait,
}

#[derive(Debug, Clone, Serialize)]
pub struct IrrigationDecision {
    pub zone_id: String,
    pub action: Action,
    pub shot_kind: Option<ShotKind>,
    pub shot_size_pct: f64,
    pub shot_duration_s: f64,
    pub reason: String,
    pub confidence: f64,
    /// Critical-low VWC: bypasses group batching and priority.
    pub emergency: bool,
    /// A safety gate produced this decision.
    pub safety_gate: bool,
    pub predictor_used: bool,
}

impl IrrigationDecision {
    fn wait(zone_id: &str, reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            zone_id: zone_id.to_string(),
            action: Action::Wait,
            shot_kind: None,
            shot_size_pct: 0.0,
            shot_duration_s: 0.0,
            reason: reason.into(),
            confidence,
            emergency: false,
            safety_gate: false,
            predictor_used: false,
        }
    }

    fn gate(zone_id: &str, reason: impl Into<String>) -> Self {
        Self {
            safety_gate: true,
            ..Self::wait(zone_id, reason, 1.0)
        }
    }

    fn irrigate(settings: &ZoneSettings, kind: ShotKind, size_pct: f64, reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            zone_id: settings.zone_id.clone(),
            action: Action::Irrigate,
            shot_kind: Some(kind),
            shot_size_pct: size_pct,
            shot_duration_s: shot_duration_s(settings, size_pct),
            reason: reason.into(),
            confidence: confidence.clamp(0.0, 1.0),
            emergency: false,
            safety_gate: false,
            predictor_used: false,
        }
    }

    pub fn is_irrigate(&self) -> bool {
        self.action == Action::Irrigate
    }
}

/// Read-only view of one zone at decision time.
#[derive(Debug, Clone)]
pub struct ZoneView<'a> {
    pub settings: &'a ZoneSettings,
    pub phase: Phase,
    pub phase_data: &'a PhaseData,
    pub minutes_in_phase: f64,
    pub last_irrigation: Option<DateTime<Utc>>,
    pub water: &'a WaterUsage,
    pub vwc: Option<FusionSnapshot>,
    pub ec: Option<FusionSnapshot>,
    pub dryback: DrybackStatus,
    pub dryback_rate_pct_per_min: Option<f64>,
    pub minutes_until_lights_off: Option<f64>,
    pub dark_minutes: f64,
}

impl ZoneView<'_> {
    pub fn ec_ratio(&self) -> Option<f64> {
        let target = self.settings.profile.ec_target;
        self.ec.map(|e| e.result.fused_value / target).filter(|r| r.is_finite())
    }
}

/// Gate for trusting the predictor.
#[derive(Debug, Clone, Copy)]
pub struct PredictorPolicy {
    pub confidence_floor: f64,
    pub irrigate_threshold: f64,
}

impl PredictorPolicy {
    fn trusts(&self, p: &Prediction) -> bool {
        p.confidence >= self.confidence_floor && p.probability >= self.irrigate_threshold
    }
}

// ---------------------------------------------------------------------------
// Shot sizing
// ---------------------------------------------------------------------------

/// Seconds of valve time to deliver `size_pct` of the substrate volume.
pub fn shot_duration_s(settings: &ZoneSettings, size_pct: f64) -> f64 {
    if settings.flow_rate_lph <= 0.0 {
        return 0.0;
    }
    shot_volume_l(settings, size_pct) / settings.flow_rate_lph * 3600.0
}

pub fn shot_volume_l(settings: &ZoneSettings, size_pct: f64) -> f64 {
    settings.substrate_volume_l * size_pct / 100.0
}

/// Ramp-up shot size grows linearly with the shots already delivered.
pub fn p1_shot_size(settings: &ZoneSettings, shots_delivered: u32) -> f64 {
    let p1 = &settings.p1;
    (p1.base_shot_pct + shots_delivered as f64 * p1.shot_increment_pct).min(p1.max_shot_pct)
}

/// Maintenance trigger: base threshold shifted by the EC ratio, then
/// floored at the critical minimum.
pub fn p2_threshold(settings: &ZoneSettings, ec_ratio: Option<f64>) -> f64 {
    let p2 = &settings.p2;
    let mut threshold = settings.p2_threshold();
    if let Some(ratio) = ec_ratio {
        if ratio > p2.ec_high_ratio {
            threshold += p2.ec_high_delta;
        } else if ratio < p2.ec_low_ratio {
            threshold += p2.ec_low_delta;
        }
        if p2.ec_stacking && ratio < p2.ec_stacking_target_ratio {
            threshold -= p2.ec_stacking_reduction;
        }
    }
    threshold.max(settings.safety.critical_min_vwc)
}

/// Minutes before lights-off at which P3 should begin so the overnight
/// dryback target is met by lights-on.
pub fn overnight_lead_min(settings: &ZoneSettings, rate_pct_per_min: Option<f64>, dark_minutes: f64) -> f64 {
    let target = settings.profile.overnight_dryback_target_pct;
    let lead = match rate_pct_per_min.filter(|r| *r > 0.0) {
        Some(rate) => target / rate - dark_minutes,
        None => {
            settings.p3.heuristic_lead_min
                * (settings.substrate_volume_l / REFERENCE_VOLUME_L)
                * (target / REFERENCE_OVERNIGHT_PCT)
        }
    };
    lead.clamp(MIN_OVERNIGHT_LEAD_MIN, MAX_OVERNIGHT_LEAD_MIN)
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// One decision tick for one zone. Safety gates are evaluated first and
/// cannot be overridden by phase rules or the predictor.
pub fn decide(
    view: &ZoneView<'_>,
    prediction: Option<&Prediction>,
    policy: &PredictorPolicy,
    now: DateTime<Utc>,
) -> IrrigationDecision {
    let s = view.settings;
    let zone = s.zone_id.as_str();

    // ── Data freshness ──────────────────────────────────────────
    let Some(vwc_snap) = view.vwc else {
        return IrrigationDecision::wait(zone, "no fused vwc yet", 0.0);
    };
    let age = now - vwc_snap.at;
    if age > Duration::minutes(s.safety.stale_timeout_min) {
        return IrrigationDecision::wait(
            zone,
            format!("stale vwc ({} min old)", age.num_minutes()),
            0.0,
        );
    }
    let vwc = vwc_snap.result.fused_value;
    let confidence = vwc_snap.result.confidence;

    // ── Hard safety gates ───────────────────────────────────────
    if vwc > s.safety.critical_max_vwc {
        return IrrigationDecision::gate(
            zone,
            format!("vwc {vwc:.1} above critical max {:.1}", s.safety.critical_max_vwc),
        );
    }
    if let Some(last) = view.last_irrigation {
        let since = now - last;
        if since < Duration::minutes(s.safety.min_interval_min) {
            return IrrigationDecision::gate(
                zone,
                format!("cooldown ({} of {} min)", since.num_minutes(), s.safety.min_interval_min),
            );
        }
    }
    if view.water.daily_total >= s.safety.max_daily_volume_l {
        return IrrigationDecision::gate(
            zone,
            format!("daily volume limit {:.2} L reached", s.safety.max_daily_volume_l),
        );
    }
    if view.water.daily_count >= s.safety.max_daily_shots {
        return IrrigationDecision::gate(zone, format!("daily shot limit {} reached", s.safety.max_daily_shots));
    }

    // ── Emergency ───────────────────────────────────────────────
    if vwc < s.safety.critical_min_vwc {
        return IrrigationDecision {
            emergency: true,
            safety_gate: true,
            ..IrrigationDecision::irrigate(
                s,
                ShotKind::Emergency,
                s.p2.shot_pct,
                format!("vwc {vwc:.1} below critical min {:.1}", s.safety.critical_min_vwc),
                1.0,
            )
        };
    }

    // ── Phase rules ─────────────────────────────────────────────
    match (view.phase, view.phase_data) {
        (Phase::P0MorningDryback, _) => IrrigationDecision::wait(
            zone,
            format!(
                "morning dryback ({:.1}% of {:.1}%)",
                p0_dryback_pct(view, vwc).unwrap_or(0.0),
                s.p0_dryback_target()
            ),
            confidence,
        ),
        (Phase::P1RampUp, PhaseData::P1(d)) => {
            if d.shot_count >= s.p1.max_shots {
                return IrrigationDecision::wait(zone, "ramp-up shots complete", confidence);
            }
            if vwc >= s.p1_target_vwc() && d.shot_count >= s.p1.min_shots {
                return IrrigationDecision::wait(zone, "ramp-up target reached", confidence);
            }
            if let Some(last) = d.last_shot_at {
                if now - last < Duration::minutes(s.p1.shot_interval_min) {
                    return IrrigationDecision::wait(zone, "waiting for next ramp-up shot", confidence);
                }
            }
            let size = p1_shot_size(s, d.shot_count);
            IrrigationDecision::irrigate(
                s,
                ShotKind::RampUp,
                size,
                format!("ramp-up shot {} ({size:.1}%)", d.shot_count + 1),
                confidence,
            )
        }
        (Phase::P2Maintenance, _) => decide_p2(view, vwc, confidence, prediction, policy),
        (Phase::P3PreLightsOff, _) => {
            if vwc < s.p3.emergency_vwc {
                IrrigationDecision {
                    emergency: true,
                    ..IrrigationDecision::irrigate(
                        s,
                        ShotKind::Emergency,
                        s.p3.emergency_shot_pct,
                        format!("overnight emergency: vwc {vwc:.1} < {:.1}", s.p3.emergency_vwc),
                        confidence,
                    )
                }
            } else {
                IrrigationDecision::wait(zone, "overnight dryback", confidence)
            }
        }
        (phase, _) => IrrigationDecision::wait(zone, format!("{phase} payload missing"), 0.0),
    }
}

fn decide_p2(
    view: &ZoneView<'_>,
    vwc: f64,
    confidence: f64,
    prediction: Option<&Prediction>,
    policy: &PredictorPolicy,
) -> IrrigationDecision {
    let s = view.settings;
    let zone = s.zone_id.as_str();

    if let Some(ec) = view.ec {
        if ec.result.fused_value > s.safety.max_safe_ec {
            return IrrigationDecision::gate(
                zone,
                format!(
                    "ec {:.2} above safe max {:.2}",
                    ec.result.fused_value, s.safety.max_safe_ec
                ),
            );
        }
    }

    let threshold = p2_threshold(s, view.ec_ratio());
    if vwc < threshold {
        return IrrigationDecision::irrigate(
            s,
            ShotKind::Maintenance,
            s.p2.shot_pct,
            format!("vwc {vwc:.1} below threshold {threshold:.1}"),
            confidence,
        );
    }

    if s.p2.dryback_trigger_pct > 0.0
        && view.dryback.in_progress
        && view.dryback.dryback_percentage >= s.p2.dryback_trigger_pct
    {
        return IrrigationDecision::irrigate(
            s,
            ShotKind::Maintenance,
            s.p2.shot_pct,
            format!(
                "dryback {:.1}% reached trigger {:.1}%",
                view.dryback.dryback_percentage, s.p2.dryback_trigger_pct
            ),
            confidence.min(view.dryback.confidence),
        );
    }

    if let Some(p) = prediction.filter(|p| policy.trusts(p)) {
        return IrrigationDecision {
            predictor_used: true,
            ..IrrigationDecision::irrigate(
                s,
                ShotKind::Maintenance,
                s.p2.shot_pct,
                format!("predicted need p={:.2}", p.probability),
                p.confidence,
            )
        };
    }

    IrrigationDecision::wait(zone, format!("vwc {vwc:.1} >= threshold {threshold:.1}"), confidence)
}

fn p0_dryback_pct(view: &ZoneView<'_>, vwc: f64) -> Option<f64> {
    match view.phase_data {
        PhaseData::P0(d) => d
            .peak_vwc
            .filter(|p| *p > 0.0)
            .map(|peak| ((peak - vwc) / peak * 100.0).max(0.0)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Phase exits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub event: TransitionEvent,
    pub reason: String,
}

impl TransitionRequest {
    fn new(event: TransitionEvent, reason: impl Into<String>) -> Self {
        Self {
            event,
            reason: reason.into(),
        }
    }
}

/// Time/VWC driven exits. Lights-on is an edge the orchestrator detects.
pub fn evaluate_transition(view: &ZoneView<'_>) -> Option<TransitionRequest> {
    let s = view.settings;
    let vwc = view.vwc.map(|v| v.result.fused_value);

    match (view.phase, view.phase_data) {
        (Phase::P0MorningDryback, _) => {
            if let Some(pct) = vwc.and_then(|v| p0_dryback_pct(view, v)) {
                if pct >= s.p0_dryback_target() {
                    return Some(TransitionRequest::new(
                        TransitionEvent::DrybackTargetReached,
                        format!("dryback {pct:.1}% >= target {:.1}%", s.p0_dryback_target()),
                    ));
                }
            }
            if view.minutes_in_phase >= s.p0.max_wait_min as f64 {
                return Some(TransitionRequest::new(
                    TransitionEvent::MaxDurationTimeout,
                    format!("p0 max wait {} min elapsed", s.p0.max_wait_min),
                ));
            }
            None
        }
        (Phase::P1RampUp, PhaseData::P1(d)) => {
            if let Some(req) = lights_off_approaching(view) {
                return Some(req);
            }
            let target = s.p1_target_vwc();
            let enough_shots = d.shot_count >= s.p1.min_shots;
            let at_target = vwc.map_or(false, |v| v >= target);
            if d.shot_count >= s.p1.max_shots {
                return Some(TransitionRequest::new(
                    TransitionEvent::RampUpTargetReached,
                    format!("max ramp-up shots ({}) delivered", s.p1.max_shots),
                ));
            }
            // the EC reset also requires the VWC target and min shots
            if let Some(ec) = view.ec {
                if ec.result.fused_value <= s.p1.ec_flush_target && at_target && enough_shots {
                    return Some(TransitionRequest::new(
                        TransitionEvent::RampUpTargetReached,
                        format!(
                            "ec flushed to {:.2} with vwc at target {target:.1}",
                            ec.result.fused_value
                        ),
                    ));
                }
            }
            if at_target && enough_shots {
                return Some(TransitionRequest::new(
                    TransitionEvent::RampUpTargetReached,
                    format!("vwc reached target {target:.1} after {} shots", d.shot_count),
                ));
            }
            None
        }
        (Phase::P2Maintenance, _) => lights_off_approaching(view),
        _ => None,
    }
}

fn lights_off_approaching(view: &ZoneView<'_>) -> Option<TransitionRequest> {
    let until_off = view.minutes_until_lights_off?;
    let lead = overnight_lead_min(view.settings, view.dryback_rate_pct_per_min, view.dark_minutes);
    (until_off <= lead).then(|| {
        TransitionRequest::new(
            TransitionEvent::LightsOffApproaching,
            format!("{until_off:.0} min to lights-off (lead {lead:.0} min)"),
        )
    })
}

// ===========================================================================
// Tests
// ===========================================================================
