//! Error taxonomy for the steering core.
//!
//! Plumbing (config, db connect, mqtt setup) stays on `anyhow`; everything a
//! zone, sensor or shot can fail with is one of these.

use thiserror::Error;

use crate::phase::{Phase, TransitionEvent};

pub type Result<T> = std::result::Result<T, SteeringError>;

#[derive(Error, Debug)]
pub enum SteeringError {
    /// Reading could not be turned into a finite number.
    #[error("sensor '{sensor_id}': unusable value ({detail})")]
    Sensor { sensor_id: String, detail: String },

    #[error("unknown sensor '{0}'")]
    UnknownSensor(String),

    #[error("unknown zone '{0}'")]
    UnknownZone(String),

    #[error("zone '{zone_id}': safety violation: {detail}")]
    SafetyViolation { zone_id: String, detail: String },

    #[error("zone '{zone_id}': transition {from} -> {requested} on {event} rejected")]
    TransitionRejected {
        zone_id: String,
        from: Phase,
        requested: String,
        event: TransitionEvent,
    },

    #[error("irrigation already in progress")]
    IrrigationInProgress,

    #[error("hardware sequence failed: {0}")]
    Hardware(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("zone '{zone_id}': no data ({detail})")]
    NoData { zone_id: String, detail: String },
}

impl From<std::io::Error> for SteeringError {
    fn from(e: std::io::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for SteeringError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
