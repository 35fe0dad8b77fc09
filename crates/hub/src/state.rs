use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::config::OperationMode;
use crate::dryback::{DrybackPrediction, DrybackStatus, Extremum};
use crate::events::{IrrigationEvent, ShotResult};
use crate::phase::{Phase, PhaseChange, WaterUsage};
use crate::predictor::PredictorStatus;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub mode: OperationMode,
    pub nodes: HashMap<String, NodeState>,
    pub zones: BTreeMap<String, ZoneStatus>,
    pub predictor: Option<PredictorStatus>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct NodeState {
    pub last_seen: DateTime<Utc>,
    pub readings: Vec<NodeReading>,
}

/// `value` is `None` when the node reported a marker such as `unavailable`.
#[derive(Clone, Serialize)]
pub struct NodeReading {
    pub sensor_id: String,
    pub value: Option<f64>,
}

/// What `steering/<zone>/state` and the status API publish per zone.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneStatus {
    pub zone_id: String,
    pub name: String,
    pub phase: Phase,
    pub phase_name: &'static str,
    pub minutes_in_phase: f64,
    pub vwc: Option<f64>,
    pub vwc_confidence: Option<f64>,
    pub ec: Option<f64>,
    pub ec_confidence: Option<f64>,
    pub dryback: DrybackStatus,
    /// Time to reach the zone's current dryback goal on the recent trend.
    pub dryback_eta: Option<DrybackPrediction>,
    pub recent_extrema: Vec<Extremum>,
    pub water: WaterUsage,
    pub last_irrigation: Option<DateTime<Utc>>,
    pub valve_on: bool,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Shot,
    Phase,
    Decision,
    Safety,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub mode: OperationMode,
    pub nodes: HashMap<String, NodeState>,
    pub zones: Vec<ZoneStatus>,
    pub predictor: Option<PredictorStatus>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(mode: OperationMode) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            mode,
            nodes: HashMap::new(),
            zones: BTreeMap::new(),
            predictor: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(mode: OperationMode) -> SharedState {
        Arc::new(RwLock::new(Self::new(mode)))
    }

    /// Record a telemetry message from a node.
    pub fn record_reading(&mut self, node_id: &str, readings: Vec<NodeReading>) {
        let detail = format!(
            "{node_id}: {}",
            readings
                .iter()
                .map(|r| match r.value {
                    Some(v) => format!("{}={v:.2}", r.sensor_id),
                    None => format!("{}=unavailable", r.sensor_id),
                })
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.nodes.insert(
            node_id.to_string(),
            NodeState {
                last_seen: Utc::now(),
                readings,
            },
        );

        self.push_event(EventKind::Reading, detail);
    }

    pub fn record_shot(&mut self, e: &IrrigationEvent) {
        let kind = match e.result {
            ShotResult::Failed => EventKind::Error,
            _ => EventKind::Shot,
        };
        let post = e.post_vwc.map_or_else(|| "-".to_string(), |v| format!("{v:.1}"));
        self.push_event(
            kind,
            format!(
                "{}: {} shot {} ({:.0}s, {:.2} L, post vwc {post}): {}",
                e.zone_id,
                e.kind,
                e.result.as_str(),
                e.duration_s,
                e.volume_l,
                e.reason
            ),
        );
    }

    pub fn record_phase(&mut self, c: &PhaseChange) {
        let forced = if c.forced { " (forced)" } else { "" };
        self.push_event(
            EventKind::Phase,
            format!("{}: {} -> {} on {}{forced}: {}", c.zone_id, c.from, c.to, c.event, c.reason),
        );
    }

    pub fn record_decision(&mut self, detail: String) {
        self.push_event(EventKind::Decision, detail);
    }

    pub fn record_safety(&mut self, detail: String) {
        self.push_event(EventKind::Safety, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn set_zones(&mut self, zones: Vec<ZoneStatus>) {
        self.zones = zones.into_iter().map(|z| (z.zone_id.clone(), z)).collect();
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            mode: self.mode,
            nodes: self.nodes.clone(),
            zones: self.zones.values().cloned().collect(),
            predictor: self.predictor.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ring_is_bounded() {
        let mut st = SystemState::new(OperationMode::Auto);
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        // oldest dropped, newest first in the status view
        let status = st.to_status();
        assert_eq!(status.events[0].detail, format!("event {}", MAX_EVENTS + 24));
        assert_eq!(status.events.last().unwrap().detail, "event 25");
    }

    #[test]
    fn reading_marks_unavailable_values() {
        let mut st = SystemState::new(OperationMode::Monitor);
        st.record_reading(
            "node-a",
            vec![
                NodeReading {
                    sensor_id: "vwc1".into(),
                    value: Some(61.234),
                },
                NodeReading {
                    sensor_id: "ec1".into(),
                    value: None,
                },
            ],
        );
        assert!(st.nodes.contains_key("node-a"));
        let e = st.events.back().unwrap();
        assert_eq!(e.kind, EventKind::Reading);
        assert_eq!(e.detail, "node-a: vwc1=61.23, ec1=unavailable");
    }
}
