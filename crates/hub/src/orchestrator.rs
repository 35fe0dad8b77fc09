//! Decision loop across all zones.
//!
//! Owns the zone registry (one fusion engine, dryback detector and phase
//! machine per zone, each behind its own lock), the shared predictor and the
//! pump. A tick rolls counters, handles the lights-on edge, applies phase
//! exits, asks `decision` for an irrigate/wait per zone, batches the
//! irrigating zones into shots and runs them one at a time.
//!
//! ```text
//!  tick ─▶ per zone: roll ─▶ lights-on edge ─▶ phase exit ─▶ decide
//!                                                              │
//!           snapshot ◀── record + label ◀── run sequence ◀── plan
//! ```
//!
//! Lock order is zone, then predictor. No lock is held across the
//! hardware sequence or the absorption wait.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{Config, OperationMode, SystemConfig, ZonePriority, ZoneSettings};
use crate::decision::{self, IrrigationDecision, PredictorPolicy, ZoneView};
use crate::dryback::DrybackDetector;
use crate::error::{Result, SteeringError};
use crate::events::{EventSender, IrrigationEvent, ShotResult, SteeringEvent};
use crate::fusion::{FusionResult, SensorClass, SensorFusionEngine};
use crate::hardware::{self, SequenceTiming, SwitchBoard};
use crate::lights::LightSchedule;
use crate::persistence::{self, PersistenceGateway, RecoveredState, StateSnapshot, ZonePhaseSnapshot, SNAPSHOT_VERSION};
use crate::phase::{Phase, PhaseChange, PhaseData, ShotKind, ShotRecord, TransitionEvent, ZonePhaseStateMachine};
use crate::predictor::{FeatureInputs, FeatureVector, IrrigationPredictor, Outcome, PredictorStatus};
use crate::state::ZoneStatus;

/// A withheld P2 decision is judged this long after it was made.
const WITHHELD_LABEL_DELAY_MIN: i64 = 15;
/// A shot with no fresh reading after this long is never labelled.
const SHOT_LABEL_TIMEOUT_MIN: i64 = 60;
/// Newest peaks/valleys carried in each zone status.
const STATUS_EXTREMA: usize = 4;
const PREDICTION_HORIZON_MIN: f64 = 30.0;

// ---------------------------------------------------------------------------
// Tuning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    pub timing: SequenceTiming,
    pub absorption_delay: Duration,
    pub policy: PredictorPolicy,
}

impl Tuning {
    pub fn from_system(s: &SystemConfig) -> Self {
        let secs = |v: f64| Duration::from_secs_f64(v.max(0.0));
        Self {
            timing: SequenceTiming {
                pump_settle: secs(s.pump_settle_sec),
                main_line_settle: secs(s.main_line_settle_sec),
            },
            absorption_delay: secs(s.absorption_delay_sec),
            policy: PredictorPolicy {
                confidence_floor: s.predictor_confidence_floor,
                irrigate_threshold: s.predictor_irrigate_threshold,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Per-zone runtime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PendingWithheld {
    features: FeatureVector,
    at: DateTime<Utc>,
    threshold: f64,
}

/// A completed shot still waiting for a reading taken after it ended.
#[derive(Debug, Clone)]
struct PendingShot {
    features: FeatureVector,
    pre_vwc: f64,
    target_vwc: f64,
    ended_at: DateTime<Utc>,
}

struct ZoneRuntime {
    settings: ZoneSettings,
    fusion: SensorFusionEngine,
    dryback: DrybackDetector,
    machine: ZonePhaseStateMachine,
    /// Local date of the lights-on that started the current cycle.
    cycle_day: Option<chrono::NaiveDate>,
    pending_withheld: Option<PendingWithheld>,
    pending_shot: Option<PendingShot>,
}

impl ZoneRuntime {
    fn fused_vwc(&self) -> Option<f64> {
        self.fusion.latest(SensorClass::Vwc).map(|s| s.result.fused_value)
    }

    /// Fused VWC from a reading strictly newer than `after`.
    fn fused_vwc_since(&self, after: DateTime<Utc>) -> Option<f64> {
        self.fusion
            .latest(SensorClass::Vwc)
            .filter(|s| s.at > after)
            .map(|s| s.result.fused_value)
    }
}

/// One zone's share of a planned shot.
#[derive(Debug, Clone)]
pub struct PlannedZone {
    pub decision: IrrigationDecision,
    pub priority: ZonePriority,
    pub group: Option<String>,
    pub phase: Phase,
    pub flow_rate_lph: f64,
    pub pre_vwc: Option<f64>,
    pub target_vwc: f64,
    pub features: Option<FeatureVector>,
}

#[derive(Debug, Clone)]
pub struct ShotPlan {
    pub zones: Vec<PlannedZone>,
    pub hold: Duration,
}

impl ShotPlan {
    fn new(zones: Vec<PlannedZone>) -> Self {
        let hold_s = zones
            .iter()
            .map(|z| z.decision.shot_duration_s)
            .fold(0.0_f64, f64::max);
        Self {
            zones,
            hold: Duration::from_secs_f64(hold_s.max(0.0)),
        }
    }

    pub fn zone_ids(&self) -> Vec<String> {
        self.zones.iter().map(|z| z.decision.zone_id.clone()).collect()
    }

    fn hold_chrono(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.hold.as_secs_f64() * 1000.0).round() as i64)
    }
}

fn shot_outcome(pre: f64, post: f64, target: f64) -> Outcome {
    Outcome::Irrigated {
        improved: post > pre,
        target_reached: post >= target,
    }
}

#[derive(Debug, Default)]
pub struct TickReport {
    /// Another tick was mid-shot, or the system is off.
    pub skipped: bool,
    pub transitions: Vec<PhaseChange>,
    pub decisions: Vec<IrrigationDecision>,
    /// Zone sets of each shot, in execution order.
    pub batches: Vec<Vec<String>>,
    pub shots: Vec<IrrigationEvent>,
    pub errors: Vec<String>,
}

/// Clears the in-progress flag when dropped.
struct InProgressGuard<'a>(&'a AtomicBool);

impl<'a> InProgressGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    zones: BTreeMap<String, Arc<Mutex<ZoneRuntime>>>,
    sensors: HashMap<String, (String, SensorClass)>,
    group_sizes: HashMap<String, usize>,
    predictor: Mutex<IrrigationPredictor>,
    board: Arc<Mutex<SwitchBoard>>,
    in_progress: AtomicBool,
    mode: RwLock<OperationMode>,
    lights: LightSchedule,
    tuning: Tuning,
    events: EventSender,
    persistence: Option<PersistenceGateway>,
}

impl Orchestrator {
    /// Build the zone registry. Zones present in `recovered` resume where
    /// they left off; the rest get a phase derived from the clock.
    pub fn new(
        cfg: &Config,
        board: Arc<Mutex<SwitchBoard>>,
        events: EventSender,
        persistence: Option<PersistenceGateway>,
        recovered: Option<RecoveredState>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Self> {
        let lights = cfg.lights()?;
        let today = lights.local_date(now);
        let lights_on_at = lights.is_on(now).then(|| lights.last_lights_on(now));
        let cycle_day = lights_on_at.map(|t| lights.local_date(t));
        let recovered = recovered.unwrap_or_default();

        let mut zones = BTreeMap::new();
        for settings in cfg.zone_settings() {
            let mut zone_cycle = cycle_day;
            let mut machine = match recovered.zones.get(&settings.zone_id) {
                Some(r) => {
                    let mut m = ZonePhaseStateMachine::new(
                        settings.zone_id.clone(),
                        r.phase,
                        settings.phase_targets(),
                        r.entered_at,
                        today,
                    );
                    m.restore(r.phase, r.entered_at, r.p0_peak_vwc, r.last_irrigation, r.water.clone());
                    // a phase entered before this lights-on still owes the lights-on edge
                    if lights_on_at.is_some_and(|on| r.entered_at < on) {
                        zone_cycle = None;
                    }
                    info!(zone = %settings.zone_id, phase = %r.phase, "orchestrator: zone restored");
                    m
                }
                None => {
                    let phase = persistence::derive_phase(
                        &lights,
                        settings.p0.max_wait_min as f64,
                        None,
                        settings.p1_target_vwc(),
                        now,
                    );
                    if !recovered.zones.is_empty() || recovered.saved_at.is_some() {
                        warn!(zone = %settings.zone_id, %phase, "orchestrator: zone missing from snapshot, phase re-derived");
                    } else {
                        info!(zone = %settings.zone_id, %phase, "orchestrator: phase derived from lights schedule");
                    }
                    ZonePhaseStateMachine::new(settings.zone_id.clone(), phase, settings.phase_targets(), now, today)
                }
            };

            for phase in Phase::ALL {
                let tx = events.clone();
                machine.on_enter(
                    phase,
                    Box::new(move |change| {
                        tx.send(SteeringEvent::Phase(change.clone()))
                            .map_err(|_| anyhow::anyhow!("event channel closed"))
                    }),
                );
            }
            machine.on_exit(
                Phase::P0MorningDryback,
                Box::new(|change| {
                    info!(zone = %change.zone_id, to = %change.to, event = ?change.event, "orchestrator: morning dryback over");
                    Ok(())
                }),
            );
            machine.on_transition(
                Phase::P2Maintenance,
                Phase::P3PreLightsOff,
                Box::new(|change| {
                    info!(zone = %change.zone_id, reason = %change.reason, "orchestrator: maintenance closed for the day");
                    Ok(())
                }),
            );

            let runtime = ZoneRuntime {
                fusion: SensorFusionEngine::new(cfg.fusion.clone()),
                dryback: DrybackDetector::new(cfg.dryback.clone()),
                machine,
                cycle_day: zone_cycle,
                pending_withheld: None,
                pending_shot: None,
                settings,
            };
            zones.insert(runtime.settings.zone_id.clone(), Arc::new(Mutex::new(runtime)));
        }

        let mut group_sizes = HashMap::new();
        for z in &cfg.zones {
            if let Some(g) = &z.group {
                *group_sizes.entry(g.clone()).or_insert(0) += 1;
            }
        }

        let sensors = cfg
            .sensors
            .iter()
            .map(|s| (s.sensor_id.clone(), (s.zone_id.clone(), s.class)))
            .collect();

        Ok(Self {
            zones,
            sensors,
            group_sizes,
            predictor: Mutex::new(IrrigationPredictor::new(cfg.system.predictor())),
            board,
            in_progress: AtomicBool::new(false),
            mode: RwLock::new(cfg.system.mode),
            lights,
            tuning: Tuning::from_system(&cfg.system),
            events,
            persistence,
        })
    }

    #[cfg(test)]
    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn lights(&self) -> &LightSchedule {
        &self.lights
    }

    pub async fn mode(&self) -> OperationMode {
        *self.mode.read().await
    }

    pub async fn set_mode(&self, mode: OperationMode) {
        let mut current = self.mode.write().await;
        let previous = *current;
        if previous != mode {
            info!(from = %previous, to = %mode, "orchestrator: mode changed");
        }
        *current = mode;
    }

    pub fn irrigation_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn zone(&self, zone_id: &str) -> Result<&Arc<Mutex<ZoneRuntime>>> {
        self.zones
            .get(zone_id)
            .ok_or_else(|| SteeringError::UnknownZone(zone_id.to_string()))
    }

    // -- Sensor path --------------------------------------------------------

    /// Feed one reading into its zone's fusion engine and, for VWC, the
    /// dryback detector. Errors concern this reading only.
    pub async fn ingest_reading(&self, sensor_id: &str, value: f64, now: DateTime<Utc>) -> Result<FusionResult> {
        let (zone_id, class) = self
            .sensors
            .get(sensor_id)
            .ok_or_else(|| SteeringError::UnknownSensor(sensor_id.to_string()))?;
        let mut z = self.zone(zone_id)?.lock().await;

        let fused = z.fusion.add_reading(sensor_id, value, now, *class).map_err(|e| match e {
            SteeringError::NoData { detail, .. } => SteeringError::NoData {
                zone_id: zone_id.clone(),
                detail,
            },
            other => other,
        })?;

        if *class == SensorClass::Vwc {
            let status = z.dryback.add_reading(fused.fused_value, now);
            if let PhaseData::P0(d) = z.machine.data() {
                if d.peak_vwc.map_or(true, |p| fused.fused_value > p) {
                    z.machine.set_p0_peak(fused.fused_value);
                }
            }
            debug!(
                zone = %zone_id,
                vwc = fused.fused_value,
                confidence = fused.confidence,
                dryback_pct = status.dryback_percentage,
                "orchestrator: vwc fused"
            );
        }
        Ok(fused)
    }

    // -- Manual override ----------------------------------------------------

    /// Operator phase change. Unforced overrides follow the edge table;
    /// forced ones need an explicit target.
    pub async fn manual_override(
        &self,
        zone_id: &str,
        target: Option<Phase>,
        reason: &str,
        forced: bool,
        now: DateTime<Utc>,
    ) -> Result<PhaseChange> {
        if self.irrigation_in_progress() {
            return Err(SteeringError::IrrigationInProgress);
        }
        let change = {
            let mut z = self.zone(zone_id)?.lock().await;
            let change = if forced {
                let to = target.ok_or_else(|| SteeringError::TransitionRejected {
                    zone_id: zone_id.to_string(),
                    from: z.machine.phase(),
                    requested: "-".into(),
                    event: TransitionEvent::ManualOverride,
                })?;
                z.machine.force_transition(to, reason, now)
            } else {
                z.machine
                    .transition(TransitionEvent::ManualOverride, target, reason, now)?
            };
            self.after_transition(&mut z, &change);
            change
        };
        self.save_snapshot(now).await;
        Ok(change)
    }

    fn after_transition(&self, z: &mut ZoneRuntime, change: &PhaseChange) {
        if let Some(PhaseData::P1(left)) = z.machine.previous_data() {
            if change.from == Phase::P1RampUp {
                info!(zone = %change.zone_id, shots = left.shot_count, "orchestrator: ramp-up finished");
            }
        }
        if change.to != Phase::P2Maintenance {
            z.pending_withheld = None;
        }
        if change.to == Phase::P0MorningDryback {
            z.dryback.reset();
            if let Some(vwc) = z.fused_vwc() {
                z.machine.set_p0_peak(vwc);
            }
        }
    }

    // -- Tick ---------------------------------------------------------------

    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let mode = self.mode().await;
        if mode == OperationMode::Off {
            report.skipped = true;
            return report;
        }
        let Some(_guard) = InProgressGuard::try_acquire(&self.in_progress) else {
            debug!("orchestrator: irrigation in progress, tick skipped");
            report.skipped = true;
            return report;
        };

        let today = self.lights.local_date(now);
        let mut candidates = Vec::new();
        for (zone_id, zone) in &self.zones {
            let mut z = zone.lock().await;
            match self.evaluate_zone(&mut z, now, today, &mut report).await {
                Ok(Some(planned)) => candidates.push(planned),
                Ok(None) => {}
                Err(e) => {
                    warn!(zone = %zone_id, "orchestrator: zone evaluation failed: {e}");
                    report.errors.push(e.to_string());
                }
            }
        }

        let (plans, deferred) = plan_shots(candidates, &self.group_sizes);
        for d in &deferred {
            debug!(zone = %d.decision.zone_id, group = ?d.group, "orchestrator: deferred until group quorum");
        }

        // later batches start when the earlier ones are done
        let started = Instant::now();
        let mut offset = chrono::Duration::zero();
        let mut plans = plans.into_iter();
        while let Some(plan) = plans.next() {
            let start = now + offset;
            report.batches.push(plan.zone_ids());
            let (events, failed) = match mode {
                OperationMode::Auto => self.execute(&plan, start, today).await,
                _ => {
                    for p in &plan.zones {
                        info!(zone = %p.decision.zone_id, reason = %p.decision.reason, "orchestrator: would irrigate (monitor mode)");
                    }
                    (self.skipped_events(&plan, start), false)
                }
            };
            self.publish_shots(events, &mut report);
            if failed {
                report.errors.push("hardware sequence failed".into());
                for rest in plans.by_ref() {
                    for p in &rest.zones {
                        warn!(zone = %p.decision.zone_id, "orchestrator: shot skipped after hardware failure");
                    }
                    let events = self.skipped_events(&rest, start);
                    self.publish_shots(events, &mut report);
                }
                break;
            }
            offset = chrono::Duration::from_std(started.elapsed()).unwrap_or(offset);
        }

        if !report.transitions.is_empty() || !report.shots.is_empty() {
            self.save_snapshot(now).await;
        }
        report
    }

    /// Everything for one zone under its lock. Returns the zone's shot
    /// request if it decided to irrigate.
    async fn evaluate_zone(
        &self,
        z: &mut ZoneRuntime,
        now: DateTime<Utc>,
        today: chrono::NaiveDate,
        report: &mut TickReport,
    ) -> Result<Option<PlannedZone>> {
        z.machine.roll_counters(today);
        z.fusion.refresh_health(now);

        // ── Lights-on edge ──────────────────────────────────────────
        if self.lights.is_on(now) {
            let cycle = self.lights.local_date(self.lights.last_lights_on(now));
            if z.cycle_day != Some(cycle) {
                z.cycle_day = Some(cycle);
                match z.machine.phase() {
                    Phase::P2Maintenance | Phase::P3PreLightsOff => {
                        let change = z.machine.transition(TransitionEvent::LightsOn, None, "lights on", now)?;
                        self.after_transition(z, &change);
                        report.transitions.push(change);
                    }
                    phase => {
                        warn!(zone = %z.settings.zone_id, %phase, "orchestrator: lights on outside P2/P3, phase kept");
                    }
                }
            }
        }

        // ── Phase exits ─────────────────────────────────────────────
        if z.machine.phase() == Phase::P0MorningDryback {
            let rate = z.dryback.dryback_rate_pct_per_min(now).map(|r| r * 60.0);
            z.machine.set_p0_rate(rate);
        }
        let request = decision::evaluate_transition(&self.view(z, now));
        if let Some(req) = request {
            match z.machine.transition(req.event, None, &req.reason, now) {
                Ok(change) => {
                    self.after_transition(z, &change);
                    report.transitions.push(change);
                }
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        // ── Withheld outcome labelling ──────────────────────────────
        if let (Some(p), Some(vwc)) = (z.pending_withheld.clone(), z.fused_vwc()) {
            if now - p.at >= chrono::Duration::minutes(WITHHELD_LABEL_DELAY_MIN) {
                let correct = vwc >= p.threshold;
                self.predictor
                    .lock()
                    .await
                    .add_sample(p.features, Outcome::Withheld { correct });
                z.pending_withheld = None;
            }
        }

        // ── Shot outcome labelling ──────────────────────────────────
        if let Some(p) = z.pending_shot.take() {
            match z.fused_vwc_since(p.ended_at) {
                Some(post) => {
                    debug!(zone = %z.settings.zone_id, pre_vwc = p.pre_vwc, post_vwc = post, "orchestrator: shot outcome labelled");
                    self.predictor.lock().await.add_sample(p.features, shot_outcome(p.pre_vwc, post, p.target_vwc));
                }
                None if now - p.ended_at >= chrono::Duration::minutes(SHOT_LABEL_TIMEOUT_MIN) => {
                    debug!(zone = %z.settings.zone_id, "orchestrator: no reading after shot, outcome dropped");
                }
                None => z.pending_shot = Some(p),
            }
        }

        // ── Decision ────────────────────────────────────────────────
        let view = self.view(z, now);
        let phase = view.phase;
        let ec_ratio = view.ec_ratio();
        let target_vwc = vwc_target(view.settings, phase, ec_ratio);
        let features = view.vwc.map(|v| {
            IrrigationPredictor::features(&FeatureInputs {
                vwc: v.result.fused_value,
                vwc_target: target_vwc,
                vwc_trend_per_min: z.dryback.vwc_trend_per_min(now).unwrap_or(0.0),
                dryback_pct: view.dryback.dryback_percentage,
                dryback_target_pct: view.settings.p0_dryback_target(),
                dryback_rate_pct_per_hour: view.dryback_rate_pct_per_min.unwrap_or(0.0) * 60.0,
                minutes_since_irrigation: view
                    .last_irrigation
                    .map(|t| (now - t).num_seconds() as f64 / 60.0),
                ec_ratio: ec_ratio.unwrap_or(1.0),
            })
        });
        let prediction = match (&features, phase) {
            (Some(f), Phase::P2Maintenance) => Some(self.predictor.lock().await.predict(f, PREDICTION_HORIZON_MIN)),
            _ => None,
        };
        let d = decision::decide(&view, prediction.as_ref(), &self.tuning.policy, now);
        let pre_vwc = view.vwc.map(|v| v.result.fused_value);

        if d.safety_gate && !d.is_irrigate() {
            let violation = SteeringError::SafetyViolation {
                zone_id: d.zone_id.clone(),
                detail: d.reason.clone(),
            };
            warn!(zone = %d.zone_id, "orchestrator: {violation}");
        } else {
            debug!(zone = %d.zone_id, action = ?d.action, reason = %d.reason, "orchestrator: decision");
        }

        let planned = if d.is_irrigate() {
            Some(PlannedZone {
                decision: d.clone(),
                priority: z.settings.priority,
                group: z.settings.group.clone(),
                phase,
                flow_rate_lph: z.settings.flow_rate_lph,
                pre_vwc,
                target_vwc,
                features,
            })
        } else {
            if phase == Phase::P2Maintenance && !d.safety_gate && z.pending_withheld.is_none() {
                if let Some(f) = features {
                    z.pending_withheld = Some(PendingWithheld {
                        features: f,
                        at: now,
                        threshold: target_vwc,
                    });
                }
            }
            None
        };
        report.decisions.push(d);
        Ok(planned)
    }

    fn view<'a>(&self, z: &'a ZoneRuntime, now: DateTime<Utc>) -> ZoneView<'a> {
        ZoneView {
            settings: &z.settings,
            phase: z.machine.phase(),
            phase_data: z.machine.data(),
            minutes_in_phase: z.machine.minutes_in_phase(now),
            last_irrigation: z.machine.last_irrigation(),
            water: z.machine.water(),
            vwc: z.fusion.latest(SensorClass::Vwc),
            ec: z.fusion.latest(SensorClass::Ec),
            dryback: z.dryback.status(),
            dryback_rate_pct_per_min: z.dryback.dryback_rate_pct_per_min(now),
            minutes_until_lights_off: self.lights.minutes_until_off(now),
            dark_minutes: self.lights.dark_minutes(),
        }
    }

    // -- Execution ----------------------------------------------------------

    /// Run one shot on the hardware, then account it per zone. Returns the
    /// per-zone events and whether the sequence failed.
    async fn execute(&self, plan: &ShotPlan, start: DateTime<Utc>, today: chrono::NaiveDate) -> (Vec<IrrigationEvent>, bool) {
        let zone_ids = plan.zone_ids();
        let steps = hardware::irrigation_sequence(&zone_ids, plan.hold, self.tuning.timing);
        info!(
            zones = ?zone_ids,
            hold_s = plan.hold.as_secs_f64(),
            "orchestrator: starting shot"
        );

        if let Err(e) = hardware::run_sequence(&self.board, &steps).await {
            error!(zones = ?zone_ids, "orchestrator: shot aborted: {e}");
            let events = plan
                .zones
                .iter()
                .map(|p| self.event_for(p, plan, start, ShotResult::Failed, None))
                .collect();
            return (events, true);
        }

        if !self.tuning.absorption_delay.is_zero() {
            tokio::time::sleep(self.tuning.absorption_delay).await;
        }

        let mut events = Vec::with_capacity(plan.zones.len());
        for p in &plan.zones {
            let Some(zone) = self.zones.get(&p.decision.zone_id) else {
                continue;
            };
            let mut z = zone.lock().await;
            let ended_at = start + plan.hold_chrono();
            // only a reading taken after the valves closed says anything about the shot
            let post = z.fused_vwc_since(ended_at);
            let event = self.event_for(p, plan, start, ShotResult::Completed, post);
            z.machine.record_shot(
                ShotRecord {
                    at: start,
                    kind: event.kind,
                    duration_s: event.duration_s,
                    volume_l: event.volume_l,
                    size_pct: event.size_pct,
                },
                today,
            );
            z.pending_shot = None;
            if let (Some(features), Some(pre)) = (p.features, p.pre_vwc) {
                match post {
                    Some(post) => {
                        self.predictor
                            .lock()
                            .await
                            .add_sample(features, shot_outcome(pre, post, p.target_vwc));
                    }
                    None => {
                        z.pending_shot = Some(PendingShot {
                            features,
                            pre_vwc: pre,
                            target_vwc: p.target_vwc,
                            ended_at,
                        });
                    }
                }
            }
            z.pending_withheld = None;
            info!(
                zone = %p.decision.zone_id,
                kind = %event.kind,
                volume_l = event.volume_l,
                pre_vwc = ?event.pre_vwc,
                post_vwc = ?event.post_vwc,
                "orchestrator: shot complete"
            );
            events.push(event);
        }
        (events, false)
    }

    fn skipped_events(&self, plan: &ShotPlan, start: DateTime<Utc>) -> Vec<IrrigationEvent> {
        plan.zones
            .iter()
            .map(|p| self.event_for(p, plan, start, ShotResult::Skipped, None))
            .collect()
    }

    fn publish_shots(&self, events: Vec<IrrigationEvent>, report: &mut TickReport) {
        for e in &events {
            self.emit(SteeringEvent::Shot(e.clone()));
        }
        report.shots.extend(events);
    }

    fn event_for(
        &self,
        p: &PlannedZone,
        plan: &ShotPlan,
        start: DateTime<Utc>,
        result: ShotResult,
        post_vwc: Option<f64>,
    ) -> IrrigationEvent {
        let hold_s = plan.hold.as_secs_f64();
        let delivered = result == ShotResult::Completed;
        let mut e = IrrigationEvent {
            zone_id: p.decision.zone_id.clone(),
            phase: p.phase,
            kind: p.decision.shot_kind.unwrap_or(ShotKind::Manual),
            start,
            end: start + plan.hold_chrono(),
            duration_s: hold_s,
            volume_l: if delivered { p.flow_rate_lph * hold_s / 3600.0 } else { 0.0 },
            size_pct: p.decision.shot_size_pct,
            pre_vwc: p.pre_vwc,
            post_vwc,
            efficiency: None,
            result,
            reason: p.decision.reason.clone(),
        };
        e.compute_efficiency();
        e
    }

    fn emit(&self, event: SteeringEvent) {
        if self.events.send(event).is_err() {
            debug!("orchestrator: event channel closed");
        }
    }

    // -- Snapshots + status -------------------------------------------------

    pub async fn snapshot(&self, now: DateTime<Utc>) -> StateSnapshot {
        let mut snap = StateSnapshot {
            timestamp: now,
            zone_phases: BTreeMap::new(),
            zone_phase_data: BTreeMap::new(),
            zone_water_usage: BTreeMap::new(),
            last_irrigation_time: None,
            version: SNAPSHOT_VERSION,
        };
        for (zone_id, zone) in &self.zones {
            let z = zone.lock().await;
            let m = &z.machine;
            let (p0_start, p0_peak) = match m.data() {
                PhaseData::P0(d) => (Some(m.entered_at()), d.peak_vwc),
                _ => (None, None),
            };
            snap.zone_phases.insert(zone_id.clone(), m.phase());
            snap.zone_phase_data.insert(
                zone_id.clone(),
                ZonePhaseSnapshot {
                    p0_start_time: p0_start,
                    p0_peak_vwc: p0_peak,
                    last_irrigation_time: m.last_irrigation(),
                    phase_entered_at: Some(m.entered_at()),
                },
            );
            snap.zone_water_usage.insert(zone_id.clone(), m.water().clone());
            snap.last_irrigation_time = snap.last_irrigation_time.max(m.last_irrigation());
        }
        snap
    }

    async fn save_snapshot(&self, now: DateTime<Utc>) {
        let Some(gw) = &self.persistence else {
            return;
        };
        let snap = self.snapshot(now).await;
        if let Err(e) = gw.save(&snap).await {
            error!(path = %gw.path().display(), "orchestrator: {e}, continuing in memory");
        }
    }

    pub async fn zone_statuses(&self, now: DateTime<Utc>) -> Vec<ZoneStatus> {
        let mut out = Vec::with_capacity(self.zones.len());
        for (zone_id, zone) in &self.zones {
            let valve_on = self.board.lock().await.state(zone_id).unwrap_or(false);
            let z = zone.lock().await;
            let vwc = z.fusion.latest(SensorClass::Vwc);
            let ec = z.fusion.latest(SensorClass::Ec);
            out.push(ZoneStatus {
                zone_id: zone_id.clone(),
                name: z.settings.name.clone(),
                phase: z.machine.phase(),
                phase_name: z.machine.phase().name(),
                minutes_in_phase: z.machine.minutes_in_phase(now),
                vwc: vwc.map(|s| s.result.fused_value),
                vwc_confidence: vwc.map(|s| s.result.confidence),
                ec: ec.map(|s| s.result.fused_value),
                ec_confidence: ec.map(|s| s.result.confidence),
                dryback: z.dryback.status(),
                dryback_eta: z.dryback.predict_time_to_target(dryback_goal(&z.settings, z.machine.phase()), now),
                recent_extrema: z.dryback.extrema().rev().take(STATUS_EXTREMA).copied().collect(),
                water: z.machine.water().clone(),
                last_irrigation: z.machine.last_irrigation(),
                valve_on,
            });
        }
        out
    }

    pub async fn predictor_status(&self) -> PredictorStatus {
        self.predictor.lock().await.status()
    }

    /// Emergency stop used on shutdown and comms loss.
    pub async fn all_off(&self) {
        let mut board = self.board.lock().await;
        board.all_off();
        if board.any_on() {
            error!("orchestrator: switches still reported on after all-off");
        }
    }
}

/// Dryback percentage the zone is currently working toward.
fn dryback_goal(settings: &ZoneSettings, phase: Phase) -> f64 {
    match phase {
        Phase::P0MorningDryback => settings.p0_dryback_target(),
        _ => settings.profile.overnight_dryback_target_pct,
    }
}

/// VWC a shot in `phase` is aiming for.
fn vwc_target(settings: &ZoneSettings, phase: Phase, ec_ratio: Option<f64>) -> f64 {
    match phase {
        Phase::P1RampUp => settings.p1_target_vwc(),
        Phase::P3PreLightsOff => settings.p3.emergency_vwc,
        Phase::P0MorningDryback | Phase::P2Maintenance => decision::p2_threshold(settings, ec_ratio),
    }
}

// ---------------------------------------------------------------------------
// Shot planning
// ---------------------------------------------------------------------------

/// Batch irrigating zones into shots.
///
/// Emergencies go first, one zone per shot, by priority. A group irrigates
/// as one combined shot once at least half its zones qualify; below that its
/// zones are deferred. Ungrouped zones follow, one per shot, by priority.
/// Returns the plans in execution order plus the deferred zones.
pub fn plan_shots(
    candidates: Vec<PlannedZone>,
    group_sizes: &HashMap<String, usize>,
) -> (Vec<ShotPlan>, Vec<PlannedZone>) {
    let by_priority = |a: &PlannedZone, b: &PlannedZone| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.decision.zone_id.cmp(&b.decision.zone_id))
    };

    let (mut emergencies, rest): (Vec<_>, Vec<_>) = candidates.into_iter().partition(|c| c.decision.emergency);
    emergencies.sort_by(by_priority);

    let mut groups: BTreeMap<String, Vec<PlannedZone>> = BTreeMap::new();
    let mut singles = Vec::new();
    for c in rest {
        match c.group.clone() {
            Some(g) => groups.entry(g).or_default().push(c),
            None => singles.push(c),
        }
    }
    singles.sort_by(by_priority);

    let mut plans: Vec<ShotPlan> = emergencies.into_iter().map(|e| ShotPlan::new(vec![e])).collect();
    let mut deferred = Vec::new();
    for (group, members) in groups {
        let size = group_sizes.get(&group).copied().unwrap_or(members.len()).max(1);
        if members.len() * 2 >= size {
            plans.push(ShotPlan::new(members));
        } else {
            deferred.extend(members);
        }
    }
    plans.extend(singles.into_iter().map(|s| ShotPlan::new(vec![s])));
    (plans, deferred)
}

// ===========================================================================
// Tests
// ===========================================================================
