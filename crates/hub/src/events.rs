//! Structured events the core emits for external collaborators.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::phase::{Phase, PhaseChange, ShotKind};

pub const SHOT_TOPIC: &str = "steering/events/shot";
pub const PHASE_TOPIC: &str = "steering/events/phase";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShotResult {
    Completed,
    Failed,
    /// Monitor mode: decided but not actuated.
    Skipped,
}

impl ShotResult {
    pub fn as_str(self) -> &'static str {
        match self {
            ShotResult::Completed => "completed",
            ShotResult::Failed => "failed",
            ShotResult::Skipped => "skipped",
        }
    }
}

/// One zone's share of an attempted or completed shot.
#[derive(Debug, Clone, Serialize)]
pub struct IrrigationEvent {
    pub zone_id: String,
    pub phase: Phase,
    pub kind: ShotKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_s: f64,
    pub volume_l: f64,
    pub size_pct: f64,
    pub pre_vwc: Option<f64>,
    pub post_vwc: Option<f64>,
    /// VWC gained per litre delivered.
    pub efficiency: Option<f64>,
    pub result: ShotResult,
    pub reason: String,
}

impl IrrigationEvent {
    pub fn vwc_gain(&self) -> Option<f64> {
        Some(self.post_vwc? - self.pre_vwc?)
    }

    pub fn compute_efficiency(&mut self) {
        self.efficiency = self
            .vwc_gain()
            .filter(|_| self.volume_l > 0.0)
            .map(|gain| gain / self.volume_l);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SteeringEvent {
    Shot(IrrigationEvent),
    Phase(PhaseChange),
}

impl SteeringEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            SteeringEvent::Shot(_) => SHOT_TOPIC,
            SteeringEvent::Phase(_) => PHASE_TOPIC,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<SteeringEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SteeringEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
