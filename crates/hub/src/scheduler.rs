//! Periodic driver: runs the orchestrator's decision tick, mirrors the
//! result into the status model and publishes retained zone state.

use chrono::Utc;
use rumqttc::AsyncClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::decision::IrrigationDecision;
use crate::mqtt;
use crate::orchestrator::{Orchestrator, TickReport};
use crate::state::{SharedState, SystemState};

pub async fn run(orchestrator: Arc<Orchestrator>, shared: SharedState, client: AsyncClient, tick_every: Duration) {
    // Let the first telemetry arrive before deciding on empty data.
    tokio::time::sleep(tick_every).await;

    let mut ticker = tokio::time::interval(tick_every);
    // a tick that ran a shot can overrun; don't burst afterwards
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(tick_sec = tick_every.as_secs_f64(), "scheduler started");
    shared
        .write()
        .await
        .record_system(format!("scheduler started (tick {}s)", tick_every.as_secs()));

    loop {
        ticker.tick().await;
        let now = Utc::now();
        let report = orchestrator.tick(now).await;

        let zones = orchestrator.zone_statuses(now).await;
        let predictor = orchestrator.predictor_status().await;
        {
            let mut st = shared.write().await;
            st.mode = orchestrator.mode().await;
            apply_report(&mut st, &report);
            st.set_zones(zones.clone());
            st.predictor = Some(predictor);
        }
        mqtt::publish_zone_states(&client, &zones).await;
    }
}

/// Copy what the operator should see from one tick into the event ring.
/// Shots and transitions arrive separately through the event channel.
pub(crate) fn apply_report(st: &mut SystemState, report: &TickReport) {
    if report.skipped {
        return;
    }
    for d in &report.decisions {
        if d.safety_gate {
            st.record_safety(describe(d));
        } else if d.is_irrigate() {
            st.record_decision(describe(d));
        }
    }
    for e in &report.errors {
        warn!("scheduler: {e}");
        st.record_error(e.clone());
    }
}

fn describe(d: &IrrigationDecision) -> String {
    let predictor = if d.predictor_used { ", predictor" } else { "" };
    format!(
        "{}: {:?} ({}, confidence {:.2}{predictor})",
        d.zone_id, d.action, d.reason, d.confidence
    )
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperationMode;
    use crate::decision::Action;
    use crate::phase::ShotKind;
    use crate::state::EventKind;

    fn decision(zone: &str, action: Action, safety_gate: bool) -> IrrigationDecision {
        IrrigationDecision {
            zone_id: zone.into(),
            action,
            shot_kind: (action == Action::Irrigate).then_some(ShotKind::Maintenance),
            shot_size_pct: 2.0,
            shot_duration_s: 36.0,
            reason: "test".into(),
            confidence: 0.9,
            emergency: false,
            safety_gate,
            predictor_used: false,
        }
    }

    #[test]
    fn only_notable_decisions_reach_the_ring() {
        let mut st = SystemState::new(OperationMode::Auto);
        let report = TickReport {
            decisions: vec![
                decision("z1", Action::Wait, false),
                decision("z2", Action::Wait, true),
                decision("z3", Action::Irrigate, false),
            ],
            errors: vec!["hardware sequence failed".into()],
            ..TickReport::default()
        };
        apply_report(&mut st, &report);

        let kinds: Vec<EventKind> = st.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Safety, EventKind::Decision, EventKind::Error]);
        assert!(st.events[0].detail.starts_with("z2: Wait"));
    }

    #[test]
    fn skipped_tick_records_nothing() {
        let mut st = SystemState::new(OperationMode::Off);
        let report = TickReport {
            skipped: true,
            ..TickReport::default()
        };
        apply_report(&mut st, &report);
        assert!(st.events.is_empty());
    }
}
