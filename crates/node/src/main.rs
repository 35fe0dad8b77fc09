mod sim;

use anyhow::{Context, Result};
use chrono::{NaiveTime, Timelike, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{parse_channels, Scenario, SubstrateSim};

const SHOT_TOPIC: &str = "steering/events/shot";
const UNAVAILABLE: &str = "unavailable";

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ReadingValue {
    Number(f64),
    Marker(&'static str),
}

#[derive(Debug, Serialize)]
struct Reading {
    sensor_id: String,
    value: ReadingValue,
}

#[derive(Debug, Serialize)]
struct ReadingMsg {
    ts: i64,
    readings: Vec<Reading>,
}

/// The subset of the hub's shot event the simulator reacts to.
#[derive(Debug, Deserialize)]
struct ShotNotice {
    zone_id: String,
    size_pct: f64,
    result: String,
}

/// Lights-on window in minutes after midnight UTC. May wrap midnight.
#[derive(Debug, Clone, Copy)]
struct LightWindow {
    on: u32,
    off: u32,
}

impl LightWindow {
    fn parse(on: &str, off: &str) -> Result<Self> {
        let minutes = |s: &str| -> Result<u32> {
            let t = NaiveTime::parse_from_str(s.trim(), "%H:%M").with_context(|| format!("bad time '{s}'"))?;
            Ok(t.hour() * 60 + t.minute())
        };
        Ok(Self {
            on: minutes(on)?,
            off: minutes(off)?,
        })
    }

    fn contains(&self, minute_of_day: u32) -> bool {
        if self.on <= self.off {
            minute_of_day >= self.on && minute_of_day < self.off
        } else {
            minute_of_day >= self.on || minute_of_day < self.off
        }
    }
}

fn build_msg(sim: &SubstrateSim, ts: i64) -> ReadingMsg {
    let readings = (0..sim.channel_count())
        .map(|i| Reading {
            sensor_id: sim.channel(i).sensor_id.clone(),
            value: match sim.sample(i) {
                Some(v) => ReadingValue::Number(v),
                None => ReadingValue::Marker(UNAVAILABLE),
            },
        })
        .collect();
    ReadingMsg { ts, readings }
}

/// A completed shot for our zone (or any zone when none is configured).
fn shot_for_us(payload: &[u8], zone: Option<&str>) -> Option<f64> {
    let notice: ShotNotice = serde_json::from_slice(payload).ok()?;
    if notice.result != "completed" {
        return None;
    }
    if zone.is_some_and(|z| z != notice.zone_id) {
        return None;
    }
    Some(notice.size_pct)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "node-a".to_string());
    let zone_id = env::var("ZONE_ID").ok().filter(|z| !z.is_empty());

    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60);

    let channels = parse_channels(&env::var("CHANNELS").unwrap_or_else(|_| "vwc1:vwc,vwc2:vwc,ec1:ec".to_string()))?;
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let window = LightWindow::parse(
        &env::var("LIGHTS_ON").unwrap_or_else(|_| "06:00".to_string()),
        &env::var("LIGHTS_OFF").unwrap_or_else(|_| "18:00".to_string()),
    )?;

    let sim = Arc::new(Mutex::new(SubstrateSim::new(scenario, channels)));
    info!(node = %node_id, %scenario, sample_every_s, "substrate simulator ready");

    let client_id = format!("steering-node-{node_id}");
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
    client.subscribe(SHOT_TOPIC, QoS::AtLeastOnce).await?;

    // Shot events wet the simulated slab.
    let shot_sim = Arc::clone(&sim);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == SHOT_TOPIC => {
                    if let Some(size) = shot_for_us(&p.payload, zone_id.as_deref()) {
                        let mut s = shot_sim.lock().await;
                        s.apply_shot(size);
                        info!(size_pct = size, vwc = s.true_vwc(), ec = s.true_ec(), "shot received");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let topic = format!("tele/{node_id}/reading");
    info!(%topic, "publishing readings");

    loop {
        let now = Utc::now();
        let lights_on = window.contains(now.hour() * 60 + now.minute());
        let msg = {
            let mut s = sim.lock().await;
            s.step(lights_on);
            build_msg(&s, now.timestamp())
        };

        match serde_json::to_vec(&msg) {
            Ok(payload) => {
                if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                    warn!("publish error: {e}");
                } else {
                    debug!(ts = msg.ts, lights_on, "published readings");
                }
            }
            Err(e) => warn!("failed to encode readings: {e}"),
        }

        sleep(Duration::from_secs(sample_every_s.max(1))).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
