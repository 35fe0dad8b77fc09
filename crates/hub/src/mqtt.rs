use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, QoS};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::OperationMode;
use crate::db::Db;
use crate::error::{Result, SteeringError};
use crate::events::{EventReceiver, SteeringEvent};
use crate::lights::LightSchedule;
use crate::orchestrator::Orchestrator;
use crate::phase::Phase;
use crate::state::{NodeReading, SharedState, ZoneStatus};

pub(crate) const TELEMETRY_SUB: &str = "tele/+/reading";
pub(crate) const OVERRIDE_SUB: &str = "steering/+/override";
pub(crate) const MODE_SET_TOPIC: &str = "steering/mode/set";

/// Payloads nodes send instead of a number when a probe has nothing to say.
const UNAVAILABLE_MARKERS: &[&str] = &["unavailable", "unknown", "none", "nan", ""];

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct Reading {
    pub(crate) sensor_id: String,
    pub(crate) value: Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    pub(crate) ts: i64,
    pub(crate) readings: Vec<Reading>,
}

/// Body of `steering/<zone>/override` and `POST /api/zones/{zone}/override`.
#[derive(Debug, Deserialize)]
pub(crate) struct OverrideRequest {
    #[serde(default)]
    pub(crate) target_phase: Option<String>,
    #[serde(default)]
    pub(crate) reason: Option<String>,
    #[serde(default)]
    pub(crate) forced: bool,
}

impl OverrideRequest {
    pub(crate) fn target(&self) -> std::result::Result<Option<Phase>, String> {
        self.target_phase.as_deref().map(str::parse::<Phase>).transpose()
    }

    pub(crate) fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("manual override")
    }
}

#[derive(Debug, Deserialize)]
struct ModeBody {
    mode: String,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract node_id from "tele/<node_id>/reading".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract zone_id from "steering/<zone_id>/override".
pub(crate) fn extract_override_zone(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "steering" && parts[2] == "override" {
        Some(parts[1])
    } else {
        None
    }
}

pub(crate) fn zone_state_topic(zone_id: &str) -> String {
    format!("steering/{zone_id}/state")
}

/// Numbers and numeric strings pass; marker strings and anything
/// non-finite are a `Sensor` error.
pub(crate) fn parse_sensor_value(sensor_id: &str, value: &Value) -> Result<f64> {
    let unusable = |detail: String| SteeringError::Sensor {
        sensor_id: sensor_id.to_string(),
        detail,
    };
    let v = match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| unusable(format!("{n} out of range")))?,
        Value::String(s) => {
            let trimmed = s.trim();
            if UNAVAILABLE_MARKERS.contains(&trimmed.to_lowercase().as_str()) {
                return Err(unusable(format!("reported '{trimmed}'")));
            }
            trimmed
                .parse::<f64>()
                .map_err(|_| unusable(format!("'{trimmed}' is not a number")))?
        }
        Value::Null => return Err(unusable("null".into())),
        other => return Err(unusable(format!("unexpected {other}"))),
    };
    if v.is_finite() {
        Ok(v)
    } else {
        Err(unusable(format!("{v} is not finite")))
    }
}

/// "AUTO" as plain text or `{"mode": "auto"}`.
pub(crate) fn parse_mode(payload: &[u8]) -> std::result::Result<OperationMode, String> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();
    if text.starts_with('{') {
        let body: ModeBody = serde_json::from_str(text).map_err(|e| format!("bad mode json: {e}"))?;
        return body.mode.parse();
    }
    text.parse()
}

pub(crate) fn parse_override(payload: &[u8]) -> std::result::Result<OverrideRequest, String> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(OverrideRequest {
            target_phase: None,
            reason: None,
            forced: false,
        });
    }
    serde_json::from_slice(payload).map_err(|e| format!("bad override json: {e}"))
}

// ---------------------------------------------------------------------------
// Inbound: telemetry
// ---------------------------------------------------------------------------

/// Push every reading of one telemetry message into the orchestrator.
/// Bad readings are dropped one at a time; the rest still land.
pub(crate) async fn ingest_telemetry(
    orchestrator: &Orchestrator,
    node_id: &str,
    msg: &ReadingMsg,
    now: DateTime<Utc>,
) -> Vec<NodeReading> {
    let mut seen = Vec::with_capacity(msg.readings.len());
    for r in &msg.readings {
        // node-local channel names ("vwc1") are only unique per node
        let qualified_id = format!("{node_id}/{}", r.sensor_id);
        let value = match parse_sensor_value(&qualified_id, &r.value) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(node = node_id, "mqtt: reading dropped: {e}");
                None
            }
        };
        if let Some(v) = value {
            match orchestrator.ingest_reading(&qualified_id, v, now).await {
                Ok(_) => {}
                Err(e @ SteeringError::UnknownSensor(_)) => debug!(node = node_id, "mqtt: {e}"),
                Err(e) => warn!(node = node_id, sensor = %qualified_id, "mqtt: reading rejected: {e}"),
            }
        }
        seen.push(NodeReading {
            sensor_id: r.sensor_id.clone(),
            value,
        });
    }
    seen
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

pub(crate) async fn publish_zone_states(client: &AsyncClient, zones: &[ZoneStatus]) {
    for z in zones {
        let body = match serde_json::to_vec(z) {
            Ok(b) => b,
            Err(e) => {
                error!(zone = %z.zone_id, "mqtt: zone state encode failed: {e}");
                continue;
            }
        };
        if let Err(e) = client
            .publish(zone_state_topic(&z.zone_id), QoS::AtLeastOnce, true, body)
            .await
        {
            warn!(zone = %z.zone_id, "mqtt: zone state publish failed: {e}");
        }
    }
}

/// Drain core events: publish on the bus, record in the status ring and
/// append to the durable log. Runs until every sender is gone.
pub(crate) async fn forward_events(
    mut rx: EventReceiver,
    client: AsyncClient,
    shared: SharedState,
    db: Db,
    lights: LightSchedule,
) {
    while let Some(event) = rx.recv().await {
        match serde_json::to_vec(&event) {
            Ok(body) => {
                if let Err(e) = client.publish(event.topic(), QoS::AtLeastOnce, false, body).await {
                    warn!(topic = event.topic(), "mqtt: event publish failed: {e}");
                }
            }
            Err(e) => error!("mqtt: event encode failed: {e}"),
        }

        match &event {
            SteeringEvent::Shot(shot) => {
                shared.write().await.record_shot(shot);
                let day = lights.local_date(shot.start);
                if let Err(e) = db.insert_irrigation_event(shot, day).await {
                    error!(zone = %shot.zone_id, "db: {e:#}");
                }
            }
            SteeringEvent::Phase(change) => {
                shared.write().await.record_phase(change);
                if let Err(e) = db.insert_phase_transition(change).await {
                    error!(zone = %change.zone_id, "db: {e:#}");
                }
            }
        }
    }
    debug!("mqtt: event channel closed");
}

// ===========================================================================
// Tests
// ===========================================================================
