//! Per-zone four-phase state machine.
//!
//! ```text
//!        dryback target / timeout / manual
//!   P0 ───────────────────────────────────▶ P1
//!   ▲                                        │ ramp-up target / manual
//!   │ lights on                              ▼
//!   ├──────────────────────────────────────  P2
//!   │                  lights-off approaching│ / manual
//!   │ lights on                              ▼
//!   └──────────────────────────────────────  P3 ──manual──▶ P1 | P2
//!                 (P1 ──lights-off approaching──▶ P3)
//! ```
//!
//! The machine owns the phase, its per-phase payload and the zone's water
//! usage counters. Business rules deciding *when* to fire an event live in
//! `decision`; this module only validates and applies edges.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SteeringError};
use crate::lights::week_start;

// ---------------------------------------------------------------------------
// Phase + events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "P0")]
    P0MorningDryback,
    #[serde(rename = "P1")]
    P1RampUp,
    #[serde(rename = "P2")]
    P2Maintenance,
    #[serde(rename = "P3")]
    P3PreLightsOff,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::P0MorningDryback,
        Phase::P1RampUp,
        Phase::P2Maintenance,
        Phase::P3PreLightsOff,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Phase::P0MorningDryback => "P0",
            Phase::P1RampUp => "P1",
            Phase::P2Maintenance => "P2",
            Phase::P3PreLightsOff => "P3",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::P0MorningDryback => "morning dryback",
            Phase::P1RampUp => "ramp-up",
            Phase::P2Maintenance => "maintenance",
            Phase::P3PreLightsOff => "pre-lights-off",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Phase {
    type Err = String;

    /// Accepts `P2`, `p2` and the long form `P2_MAINTENANCE`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        let code = upper.split('_').next().unwrap_or_default();
        match code {
            "P0" => Ok(Phase::P0MorningDryback),
            "P1" => Ok(Phase::P1RampUp),
            "P2" => Ok(Phase::P2Maintenance),
            "P3" => Ok(Phase::P3PreLightsOff),
            _ => Err(format!("unknown phase '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEvent {
    DrybackTargetReached,
    MaxDurationTimeout,
    ManualOverride,
    RampUpTargetReached,
    LightsOffApproaching,
    LightsOn,
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransitionEvent::DrybackTargetReached => "dryback_target_reached",
            TransitionEvent::MaxDurationTimeout => "max_duration_timeout",
            TransitionEvent::ManualOverride => "manual_override",
            TransitionEvent::RampUpTargetReached => "ramp_up_target_reached",
            TransitionEvent::LightsOffApproaching => "lights_off_approaching",
            TransitionEvent::LightsOn => "lights_on",
        };
        f.write_str(s)
    }
}

use Phase::*;
use TransitionEvent::*;

/// Every permitted edge. Anything not listed is rejected.
const EDGES: &[(Phase, TransitionEvent, Phase)] = &[
    (P0MorningDryback, DrybackTargetReached, P1RampUp),
    (P0MorningDryback, MaxDurationTimeout, P1RampUp),
    (P0MorningDryback, ManualOverride, P1RampUp),
    (P1RampUp, RampUpTargetReached, P2Maintenance),
    (P1RampUp, ManualOverride, P2Maintenance),
    (P1RampUp, LightsOffApproaching, P3PreLightsOff),
    (P2Maintenance, LightsOffApproaching, P3PreLightsOff),
    (P2Maintenance, LightsOn, P0MorningDryback),
    (P2Maintenance, ManualOverride, P3PreLightsOff),
    (P3PreLightsOff, LightsOn, P0MorningDryback),
    (P3PreLightsOff, ManualOverride, P1RampUp),
    (P3PreLightsOff, ManualOverride, P2Maintenance),
];

/// Resolve the destination of `event` from `from`. With no explicit
/// target the edge must be unambiguous.
pub fn resolve_edge(from: Phase, event: TransitionEvent, target: Option<Phase>) -> Option<Phase> {
    let mut candidates = EDGES
        .iter()
        .filter(|(f, e, _)| *f == from && *e == event)
        .map(|(_, _, to)| *to);
    match target {
        Some(t) => candidates.find(|to| *to == t),
        None => {
            let first = candidates.next()?;
            candidates.next().is_none().then_some(first)
        }
    }
}

// ---------------------------------------------------------------------------
// Phase payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotKind {
    RampUp,
    Maintenance,
    Emergency,
    Manual,
}

impl fmt::Display for ShotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShotKind::RampUp => "ramp_up",
            ShotKind::Maintenance => "maintenance",
            ShotKind::Emergency => "emergency",
            ShotKind::Manual => "manual",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ShotRecord {
    pub at: DateTime<Utc>,
    pub kind: ShotKind,
    pub duration_s: f64,
    pub volume_l: f64,
    pub size_pct: f64,
}

/// Fixed per-zone targets the payloads are initialised from.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTargets {
    pub p0_dryback_target_pct: f64,
    pub p0_max_wait_min: i64,
    pub p1_target_vwc: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct P0Data {
    pub peak_vwc: Option<f64>,
    pub dryback_target_pct: f64,
    pub max_duration_min: i64,
    pub dryback_rate_pct_per_hour: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct P1Data {
    pub shot_count: u32,
    pub shot_history: Vec<ShotRecord>,
    pub target_vwc: f64,
    pub last_shot_at: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct P2Data {
    pub irrigation_count: u32,
    pub last_irrigation_at: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct P3Data {
    pub emergency_shots: u32,
    pub exit_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "phase")]
pub enum PhaseData {
    P0(P0Data),
    P1(P1Data),
    P2(P2Data),
    P3(P3Data),
}

impl PhaseData {
    fn fresh(phase: Phase, targets: &PhaseTargets) -> Self {
        match phase {
            P0MorningDryback => PhaseData::P0(P0Data {
                peak_vwc: None,
                dryback_target_pct: targets.p0_dryback_target_pct,
                max_duration_min: targets.p0_max_wait_min,
                dryback_rate_pct_per_hour: None,
                exit_time: None,
            }),
            P1RampUp => PhaseData::P1(P1Data {
                shot_count: 0,
                shot_history: Vec::new(),
                target_vwc: targets.p1_target_vwc,
                last_shot_at: None,
                exit_time: None,
            }),
            P2Maintenance => PhaseData::P2(P2Data {
                irrigation_count: 0,
                last_irrigation_at: None,
                exit_time: None,
            }),
            P3PreLightsOff => PhaseData::P3(P3Data {
                emergency_shots: 0,
                exit_time: None,
            }),
        }
    }

    fn stamp_exit(&mut self, at: DateTime<Utc>) {
        let slot = match self {
            PhaseData::P0(d) => &mut d.exit_time,
            PhaseData::P1(d) => &mut d.exit_time,
            PhaseData::P2(d) => &mut d.exit_time,
            PhaseData::P3(d) => &mut d.exit_time,
        };
        *slot = Some(at);
    }

    pub fn exit_time(&self) -> Option<DateTime<Utc>> {
        match self {
            PhaseData::P0(d) => d.exit_time,
            PhaseData::P1(d) => d.exit_time,
            PhaseData::P2(d) => d.exit_time,
            PhaseData::P3(d) => d.exit_time,
        }
    }
}

// ---------------------------------------------------------------------------
// Water usage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaterUsage {
    pub daily_total: f64,
    pub weekly_total: f64,
    pub daily_count: u32,
    pub last_reset_daily: NaiveDate,
    pub last_reset_weekly: NaiveDate,
}

impl WaterUsage {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            daily_total: 0.0,
            weekly_total: 0.0,
            daily_count: 0,
            last_reset_daily: today,
            last_reset_weekly: week_start(today),
        }
    }

    /// Zero whichever counters belong to a past local day/week.
    pub fn roll(&mut self, today: NaiveDate) {
        if today > self.last_reset_daily {
            self.daily_total = 0.0;
            self.daily_count = 0;
            self.last_reset_daily = today;
        }
        let week = week_start(today);
        if week > self.last_reset_weekly {
            self.weekly_total = 0.0;
            self.last_reset_weekly = week;
        }
    }

    pub fn add(&mut self, volume_l: f64, today: NaiveDate) {
        self.roll(today);
        self.daily_total += volume_l.max(0.0);
        self.weekly_total += volume_l.max(0.0);
        self.daily_count += 1;
    }
}

// ---------------------------------------------------------------------------
// Transitions + callbacks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PhaseChange {
    pub zone_id: String,
    pub from: Phase,
    pub to: Phase,
    pub event: TransitionEvent,
    pub reason: String,
    pub forced: bool,
    pub at: DateTime<Utc>,
}

pub type PhaseCallback = Box<dyn Fn(&PhaseChange) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct Observers {
    enter: HashMap<Phase, Vec<PhaseCallback>>,
    exit: HashMap<Phase, Vec<PhaseCallback>>,
    edge: HashMap<(Phase, Phase), Vec<PhaseCallback>>,
}

fn notify(callbacks: Option<&Vec<PhaseCallback>>, change: &PhaseChange, hook: &str) {
    for cb in callbacks.into_iter().flatten() {
        if let Err(e) = cb(change) {
            warn!(
                zone = %change.zone_id,
                from = %change.from,
                to = %change.to,
                hook,
                "phase: callback failed: {e:#}"
            );
        }
    }
}

pub struct ZonePhaseStateMachine {
    zone_id: String,
    targets: PhaseTargets,
    phase: Phase,
    entered_at: DateTime<Utc>,
    data: PhaseData,
    previous: Option<PhaseData>,
    water: WaterUsage,
    last_irrigation: Option<DateTime<Utc>>,
    observers: Observers,
}

impl ZonePhaseStateMachine {
    pub fn new(zone_id: impl Into<String>, initial: Phase, targets: PhaseTargets, now: DateTime<Utc>, today: NaiveDate) -> Self {
        Self {
            zone_id: zone_id.into(),
            data: PhaseData::fresh(initial, &targets),
            targets,
            phase: initial,
            entered_at: now,
            previous: None,
            water: WaterUsage::new(today),
            last_irrigation: None,
            observers: Observers::default(),
        }
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn minutes_in_phase(&self, now: DateTime<Utc>) -> f64 {
        (now - self.entered_at).num_seconds().max(0) as f64 / 60.0
    }

    pub fn data(&self) -> &PhaseData {
        &self.data
    }

    /// Payload of the phase most recently left, exit time stamped.
    pub fn previous_data(&self) -> Option<&PhaseData> {
        self.previous.as_ref()
    }

    pub fn water(&self) -> &WaterUsage {
        &self.water
    }

    pub fn last_irrigation(&self) -> Option<DateTime<Utc>> {
        self.last_irrigation
    }

    pub fn on_enter(&mut self, phase: Phase, cb: PhaseCallback) {
        self.observers.enter.entry(phase).or_default().push(cb);
    }

    pub fn on_exit(&mut self, phase: Phase, cb: PhaseCallback) {
        self.observers.exit.entry(phase).or_default().push(cb);
    }

    pub fn on_transition(&mut self, from: Phase, to: Phase, cb: PhaseCallback) {
        self.observers.edge.entry((from, to)).or_default().push(cb);
    }

    /// Validate and apply an edge. On rejection nothing changes.
    pub fn transition(
        &mut self,
        event: TransitionEvent,
        target: Option<Phase>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PhaseChange> {
        let Some(to) = resolve_edge(self.phase, event, target) else {
            warn!(
                zone = %self.zone_id,
                from = %self.phase,
                requested = ?target,
                %event,
                "phase: transition rejected"
            );
            return Err(SteeringError::TransitionRejected {
                zone_id: self.zone_id.clone(),
                from: self.phase,
                requested: target.map_or_else(|| "-".to_string(), |p| p.to_string()),
                event,
            });
        };
        Ok(self.apply(to, event, reason, false, now))
    }

    /// Manual override with `forced = true`: skips edge validation.
    pub fn force_transition(&mut self, to: Phase, reason: &str, now: DateTime<Utc>) -> PhaseChange {
        self.apply(to, ManualOverride, reason, true, now)
    }

    fn apply(&mut self, to: Phase, event: TransitionEvent, reason: &str, forced: bool, now: DateTime<Utc>) -> PhaseChange {
        let change = PhaseChange {
            zone_id: self.zone_id.clone(),
            from: self.phase,
            to,
            event,
            reason: reason.to_string(),
            forced,
            at: now,
        };

        notify(self.observers.exit.get(&change.from), &change, "exit");
        let mut left = std::mem::replace(&mut self.data, PhaseData::fresh(to, &self.targets));
        left.stamp_exit(now);
        self.previous = Some(left);
        self.phase = to;
        self.entered_at = now;
        notify(self.observers.enter.get(&to), &change, "enter");
        notify(self.observers.edge.get(&(change.from, to)), &change, "edge");

        info!(
            zone = %self.zone_id,
            from = %change.from,
            to = %to,
            %event,
            forced,
            reason,
            "phase: transition"
        );
        change
    }

    /// Account one delivered shot against the current phase and the
    /// zone's water counters.
    pub fn record_shot(&mut self, shot: ShotRecord, today: NaiveDate) {
        self.water.add(shot.volume_l, today);
        self.last_irrigation = Some(shot.at);
        match &mut self.data {
            PhaseData::P1(d) => {
                d.shot_count += 1;
                d.last_shot_at = Some(shot.at);
                d.shot_history.push(shot);
            }
            PhaseData::P2(d) => {
                d.irrigation_count += 1;
                d.last_irrigation_at = Some(shot.at);
            }
            PhaseData::P3(d) => {
                d.emergency_shots += 1;
            }
            // emergency shots during morning dryback only touch counters
            PhaseData::P0(_) => {}
        }
    }

    pub fn roll_counters(&mut self, today: NaiveDate) {
        self.water.roll(today);
    }

    /// Record the morning peak the P0 dryback is measured from.
    pub fn set_p0_peak(&mut self, vwc: f64) {
        if let PhaseData::P0(d) = &mut self.data {
            d.peak_vwc = Some(vwc);
        }
    }

    pub fn set_p0_rate(&mut self, rate_pct_per_hour: Option<f64>) {
        if let PhaseData::P0(d) = &mut self.data {
            d.dryback_rate_pct_per_hour = rate_pct_per_hour;
        }
    }

    /// Reinstate persisted state after a restart.
    pub fn restore(
        &mut self,
        phase: Phase,
        entered_at: DateTime<Utc>,
        p0_peak: Option<f64>,
        last_irrigation: Option<DateTime<Utc>>,
        water: WaterUsage,
    ) {
        self.phase = phase;
        self.entered_at = entered_at;
        self.data = PhaseData::fresh(phase, &self.targets);
        if let Some(peak) = p0_peak {
            self.set_p0_peak(peak);
        }
        self.last_irrigation = last_irrigation;
        self.water = water;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const ALL_EVENTS: [TransitionEvent; 6] = [
        DrybackTargetReached,
        MaxDurationTimeout,
        ManualOverride,
        RampUpTargetReached,
        LightsOffApproaching,
        LightsOn,
    ];

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 5, 6, 0, 0).unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn targets() -> PhaseTargets {
        PhaseTargets {
            p0_dryback_target_pct: 15.0,
            p0_max_wait_min: 120,
            p1_target_vwc: 65.0,
        }
    }

    fn machine(initial: Phase) -> ZonePhaseStateMachine {
        ZonePhaseStateMachine::new("z1", initial, targets(), t0(), day(5))
    }

    fn shot(kind: ShotKind, volume_l: f64, at: DateTime<Utc>) -> ShotRecord {
        ShotRecord {
            at,
            kind,
            duration_s: 60.0,
            volume_l,
            size_pct: 2.0,
        }
    }

    // -- Edge table ---------------------------------------------------------

    #[test]
    fn p0_to_p3_is_rejected() {
        let mut m = machine(P0MorningDryback);
        for event in ALL_EVENTS {
            assert!(m.transition(event, Some(P3PreLightsOff), "test", t0()).is_err());
        }
        assert_eq!(m.phase(), P0MorningDryback);
    }

    #[test]
    fn closure_over_all_phase_event_pairs() {
        for from in Phase::ALL {
            for event in ALL_EVENTS {
                for target in Phase::ALL.iter().copied().map(Some).chain([None]) {
                    let mut m = machine(from);
                    let listed = EDGES
                        .iter()
                        .any(|(f, e, to)| *f == from && *e == event && target.map_or(true, |t| t == *to));
                    let ambiguous = target.is_none()
                        && EDGES.iter().filter(|(f, e, _)| *f == from && *e == event).count() > 1;
                    let result = m.transition(event, target, "test", t0());
                    if listed && !ambiguous {
                        let change = result.unwrap();
                        assert_eq!(m.phase(), change.to);
                    } else {
                        assert!(result.is_err(), "{from} --{event}--> {target:?} should be rejected");
                        assert_eq!(m.phase(), from);
                    }
                }
            }
        }
    }

    #[test]
    fn p3_manual_override_needs_a_target() {
        let mut m = machine(P3PreLightsOff);
        assert!(m.transition(ManualOverride, None, "ambiguous", t0()).is_err());
        m.transition(ManualOverride, Some(P2Maintenance), "operator", t0()).unwrap();
        assert_eq!(m.phase(), P2Maintenance);
    }

    #[test]
    fn forced_override_skips_validation() {
        let mut m = machine(P0MorningDryback);
        let change = m.force_transition(P3PreLightsOff, "operator", t0());
        assert!(change.forced);
        assert_eq!(m.phase(), P3PreLightsOff);
    }

    // -- Payloads -----------------------------------------------------------

    #[test]
    fn transition_stamps_exit_and_reinitialises_payload() {
        let mut m = machine(P1RampUp);
        m.record_shot(shot(ShotKind::RampUp, 0.2, t0()), day(5));
        match m.data() {
            PhaseData::P1(d) => assert_eq!(d.shot_count, 1),
            other => panic!("unexpected {other:?}"),
        }

        let later = t0() + Duration::minutes(30);
        m.transition(RampUpTargetReached, None, "target", later).unwrap();
        assert_eq!(m.entered_at(), later);
        match m.data() {
            PhaseData::P2(d) => {
                assert_eq!(d.irrigation_count, 0);
                assert!(d.exit_time.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        let left = m.previous_data().unwrap();
        assert_eq!(left.exit_time(), Some(later));
        assert!(matches!(left, PhaseData::P1(d) if d.shot_history.len() == 1));
        // counters survive the phase change
        assert_eq!(m.water().daily_count, 1);
    }

    #[test]
    fn p0_peak_only_applies_in_p0() {
        let mut m = machine(P0MorningDryback);
        m.set_p0_peak(68.0);
        match m.data() {
            PhaseData::P0(d) => assert_eq!(d.peak_vwc, Some(68.0)),
            other => panic!("unexpected {other:?}"),
        }
        let mut m = machine(P2Maintenance);
        m.set_p0_peak(68.0);
        assert!(matches!(m.data(), PhaseData::P2(_)));
    }

    // -- Callbacks ----------------------------------------------------------

    #[test]
    fn callbacks_fire_in_order_and_errors_do_not_abort() {
        let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let mut m = machine(P0MorningDryback);

        let l = Arc::clone(&log);
        m.on_exit(P0MorningDryback, Box::new(move |_| {
            l.lock().unwrap().push("exit");
            anyhow::bail!("exit hook broke")
        }));
        let l = Arc::clone(&log);
        m.on_enter(P1RampUp, Box::new(move |_| {
            l.lock().unwrap().push("enter");
            Ok(())
        }));
        let l = Arc::clone(&log);
        m.on_transition(P0MorningDryback, P1RampUp, Box::new(move |c| {
            assert_eq!(c.event, DrybackTargetReached);
            l.lock().unwrap().push("edge");
            Ok(())
        }));

        m.transition(DrybackTargetReached, None, "dryback 16%", t0()).unwrap();
        assert_eq!(m.phase(), P1RampUp);
        assert_eq!(*log.lock().unwrap(), vec!["exit", "enter", "edge"]);
    }

    #[test]
    fn rejected_transition_fires_no_callbacks() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut m = machine(P0MorningDryback);
        let h = Arc::clone(&hits);
        m.on_exit(P0MorningDryback, Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        assert!(m.transition(LightsOn, None, "nope", t0()).is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    // -- Water usage --------------------------------------------------------

    #[test]
    fn daily_total_resets_once_per_day() {
        let mut m = machine(P2Maintenance);
        m.record_shot(shot(ShotKind::Maintenance, 1.0, t0()), day(5));
        m.record_shot(shot(ShotKind::Maintenance, 1.5, t0()), day(5));
        assert_eq!(m.water().daily_total, 2.5);
        assert_eq!(m.water().daily_count, 2);

        m.roll_counters(day(6));
        assert_eq!(m.water().daily_total, 0.0);
        m.record_shot(shot(ShotKind::Maintenance, 1.0, t0()), day(6));
        m.roll_counters(day(6));
        assert_eq!(m.water().daily_total, 1.0);
        // same ISO week (Wed..Thu)
        assert_eq!(m.water().weekly_total, 3.5);
    }

    #[test]
    fn weekly_total_resets_on_monday() {
        let mut w = WaterUsage::new(day(5));
        w.add(2.0, day(5));
        w.add(2.0, day(9)); // Sunday
        assert_eq!(w.weekly_total, 4.0);
        w.roll(day(10)); // Monday
        assert_eq!(w.weekly_total, 0.0);
        assert_eq!(w.last_reset_weekly, day(10));
    }

    #[test]
    fn phase_parsing() {
        assert_eq!("P2".parse::<Phase>().unwrap(), P2Maintenance);
        assert_eq!("p0".parse::<Phase>().unwrap(), P0MorningDryback);
        assert_eq!("P3_PRE_LIGHTS_OFF".parse::<Phase>().unwrap(), P3PreLightsOff);
        assert!("P7".parse::<Phase>().is_err());
        assert_eq!(serde_json::to_string(&P1RampUp).unwrap(), "\"P1\"");
    }
}
