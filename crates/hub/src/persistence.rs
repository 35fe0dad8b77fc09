//! Restart-recovery snapshot: phase per zone, the bits of phase data worth
//! keeping, water counters and last-irrigation times.
//!
//! Written as one JSON document via temp file + rename. Reading is lenient
//! per zone: a corrupt entry drops that zone back to phase re-derivation
//! instead of discarding the whole file.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Result, SteeringError};
use crate::lights::LightSchedule;
use crate::phase::{Phase, WaterUsage};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZonePhaseSnapshot {
    pub p0_start_time: Option<DateTime<Utc>>,
    pub p0_peak_vwc: Option<f64>,
    pub last_irrigation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phase_entered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub timestamp: DateTime<Utc>,
    pub zone_phases: BTreeMap<String, Phase>,
    pub zone_phase_data: BTreeMap<String, ZonePhaseSnapshot>,
    pub zone_water_usage: BTreeMap<String, WaterUsage>,
    pub last_irrigation_time: Option<DateTime<Utc>>,
    pub version: u32,
}

/// Loosely typed mirror of [`StateSnapshot`] so each zone parses on its own.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSnapshot {
    timestamp: Option<DateTime<Utc>>,
    zone_phases: BTreeMap<String, Value>,
    zone_phase_data: BTreeMap<String, Value>,
    zone_water_usage: BTreeMap<String, Value>,
    version: Option<u32>,
}

/// One zone's state as recovered from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredZone {
    pub phase: Phase,
    pub entered_at: DateTime<Utc>,
    pub p0_peak_vwc: Option<f64>,
    pub last_irrigation: Option<DateTime<Utc>>,
    pub water: WaterUsage,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    pub saved_at: Option<DateTime<Utc>>,
    pub zones: HashMap<String, RestoredZone>,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PersistenceGateway {
    path: PathBuf,
}

impl PersistenceGateway {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        let body = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), zones = snapshot.zone_phases.len(), "persistence: snapshot written");
        Ok(())
    }

    /// `Ok(None)` when no snapshot exists yet.
    pub async fn load(&self, today: NaiveDate) -> Result<Option<RecoveredState>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let recovered = parse_snapshot(&text, today)?;
        info!(
            path = %self.path.display(),
            zones = recovered.zones.len(),
            saved_at = ?recovered.saved_at,
            "persistence: snapshot loaded"
        );
        Ok(Some(recovered))
    }
}

// ---------------------------------------------------------------------------
// Parsing + recovery rules
// ---------------------------------------------------------------------------

/// Parse a snapshot document. Counters belonging to a past local day/week
/// are zeroed; zones with a missing or corrupt phase are left out.
pub fn parse_snapshot(text: &str, today: NaiveDate) -> Result<RecoveredState> {
    let raw: RawSnapshot = serde_json::from_str(text)
        .map_err(|e| SteeringError::Persistence(format!("snapshot unreadable: {e}")))?;
    if let Some(v) = raw.version.filter(|v| *v != SNAPSHOT_VERSION) {
        warn!(version = v, expected = SNAPSHOT_VERSION, "persistence: snapshot version mismatch, reading anyway");
    }
    let saved_at = raw.timestamp;

    let mut zones = HashMap::new();
    for (zone_id, phase_value) in &raw.zone_phases {
        let Ok(phase) = serde_json::from_value::<Phase>(phase_value.clone()) else {
            warn!(zone = %zone_id, value = %phase_value, "persistence: corrupt phase entry, will re-derive");
            continue;
        };

        let data = raw
            .zone_phase_data
            .get(zone_id)
            .and_then(|v| match serde_json::from_value::<ZonePhaseSnapshot>(v.clone()) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!(zone = %zone_id, "persistence: corrupt phase data: {e}");
                    None
                }
            });

        let mut water = raw
            .zone_water_usage
            .get(zone_id)
            .and_then(|v| serde_json::from_value::<WaterUsage>(v.clone()).ok())
            .unwrap_or_else(|| {
                warn!(zone = %zone_id, "persistence: water usage missing or corrupt, starting at zero");
                WaterUsage::new(today)
            });
        water.roll(today);

        let entered_at = data
            .as_ref()
            .and_then(|d| match phase {
                Phase::P0MorningDryback => d.p0_start_time.or(d.phase_entered_at),
                _ => d.phase_entered_at,
            })
            .or(saved_at)
            .unwrap_or_else(Utc::now);

        zones.insert(
            zone_id.clone(),
            RestoredZone {
                phase,
                entered_at,
                p0_peak_vwc: data.as_ref().and_then(|d| d.p0_peak_vwc),
                last_irrigation: data.as_ref().and_then(|d| d.last_irrigation_time),
                water,
            },
        );
    }

    Ok(RecoveredState { saved_at, zones })
}

/// Best-effort phase for a zone with no usable snapshot entry.
pub fn derive_phase(
    lights: &LightSchedule,
    p0_window_min: f64,
    vwc: Option<f64>,
    p1_target_vwc: f64,
    now: DateTime<Utc>,
) -> Phase {
    let Some(since_on) = lights.minutes_since_on(now) else {
        return Phase::P3PreLightsOff;
    };
    if since_on < p0_window_min {
        return Phase::P0MorningDryback;
    }
    match vwc {
        Some(v) if v < p1_target_vwc => Phase::P1RampUp,
        _ => Phase::P2Maintenance,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, d, h, 0, 0).unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn snapshot() -> StateSnapshot {
        let mut water = WaterUsage::new(day(5));
        water.add(1.5, day(5));
        StateSnapshot {
            timestamp: at(5, 12),
            zone_phases: [("z1".to_string(), Phase::P2Maintenance)].into(),
            zone_phase_data: [(
                "z1".to_string(),
                ZonePhaseSnapshot {
                    p0_start_time: Some(at(5, 6)),
                    p0_peak_vwc: Some(68.0),
                    last_irrigation_time: Some(at(5, 11)),
                    phase_entered_at: Some(at(5, 9)),
                },
            )]
            .into(),
            zone_water_usage: [("z1".to_string(), water)].into(),
            last_irrigation_time: Some(at(5, 11)),
            version: SNAPSHOT_VERSION,
        }
    }

    // -- Parsing ------------------------------------------------------------

    #[test]
    fn same_day_restore_keeps_counters() {
        let text = serde_json::to_string(&snapshot()).unwrap();
        let r = parse_snapshot(&text, day(5)).unwrap();
        let z = &r.zones["z1"];
        assert_eq!(z.phase, Phase::P2Maintenance);
        assert_eq!(z.entered_at, at(5, 9));
        assert_eq!(z.last_irrigation, Some(at(5, 11)));
        assert_eq!(z.water.daily_total, 1.5);
        assert_eq!(z.water.daily_count, 1);
        assert_eq!(r.saved_at, Some(at(5, 12)));
    }

    #[test]
    fn stale_counters_are_zeroed() {
        let text = serde_json::to_string(&snapshot()).unwrap();
        let r = parse_snapshot(&text, day(6)).unwrap();
        let w = &r.zones["z1"].water;
        assert_eq!(w.daily_total, 0.0);
        assert_eq!(w.daily_count, 0);
        // same ISO week
        assert_eq!(w.weekly_total, 1.5);

        let r = parse_snapshot(&text, day(10)).unwrap();
        assert_eq!(r.zones["z1"].water.weekly_total, 0.0);
    }

    #[test]
    fn corrupt_zone_is_dropped_not_fatal() {
        let mut v = serde_json::to_value(snapshot()).unwrap();
        v["zone_phases"]["z2"] = Value::String("P9".into());
        v["zone_water_usage"]["z1"] = Value::String("garbage".into());
        let r = parse_snapshot(&v.to_string(), day(5)).unwrap();
        assert!(!r.zones.contains_key("z2"));
        assert_eq!(r.zones["z1"].water.daily_total, 0.0);
    }

    #[test]
    fn unreadable_document_is_a_persistence_error() {
        assert!(matches!(
            parse_snapshot("{not json", day(5)),
            Err(SteeringError::Persistence(_))
        ));
    }

    // -- Derivation ---------------------------------------------------------

    #[test]
    fn phase_derived_from_lights_and_vwc() {
        let lights = LightSchedule::parse("06:00", "18:00", 0).unwrap();
        assert_eq!(derive_phase(&lights, 120.0, Some(50.0), 65.0, at(5, 22)), Phase::P3PreLightsOff);
        assert_eq!(derive_phase(&lights, 120.0, Some(50.0), 65.0, at(5, 7)), Phase::P0MorningDryback);
        assert_eq!(derive_phase(&lights, 120.0, Some(50.0), 65.0, at(5, 10)), Phase::P1RampUp);
        assert_eq!(derive_phase(&lights, 120.0, Some(66.0), 65.0, at(5, 10)), Phase::P2Maintenance);
        assert_eq!(derive_phase(&lights, 120.0, None, 65.0, at(5, 10)), Phase::P2Maintenance);
    }

    // -- File round trip ----------------------------------------------------

    #[tokio::test]
    async fn save_then_load() {
        let path = std::env::temp_dir().join(format!("steering-state-{}.json", std::process::id()));
        let gw = PersistenceGateway::new(&path);
        assert!(gw.load(day(5)).await.unwrap().is_none());

        gw.save(&snapshot()).await.unwrap();
        let r = gw.load(day(5)).await.unwrap().unwrap();
        assert_eq!(r.zones["z1"].p0_peak_vwc, Some(68.0));
        assert!(!path.with_extension("tmp").exists());
        let _ = std::fs::remove_file(&path);
    }
}
