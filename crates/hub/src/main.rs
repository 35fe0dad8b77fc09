mod config;
mod db;
mod decision;
mod dryback;
mod error;
mod events;
mod fusion;
mod hardware;
mod lights;
mod mqtt;
mod orchestrator;
mod persistence;
mod phase;
mod predictor;
mod scheduler;
mod state;
mod stats;
mod web;

use anyhow::{Context, Result};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use hardware::SwitchBoard;
use mqtt::{extract_node_id, extract_override_zone, ReadingMsg, MODE_SET_TOPIC, OVERRIDE_SUB, TELEMETRY_SUB};
use orchestrator::Orchestrator;
use persistence::PersistenceGateway;
use state::SystemState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:steering.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let state_path = env::var("STATE_PATH").unwrap_or_else(|_| "steering-state.json".to_string());

    // ── Config file ─────────────────────────────────────────────────
    let cfg = config::load(&config_path)?;
    let lights = cfg.lights()?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Restart recovery ────────────────────────────────────────────
    let now = Utc::now();
    let gateway = PersistenceGateway::new(&state_path);
    let recovered = match gateway.load(lights.local_date(now)).await {
        Ok(r) => r,
        Err(e) => {
            warn!(path = %state_path, "snapshot unusable, deriving phases from the clock: {e}");
            None
        }
    };

    // ── Switch board ────────────────────────────────────────────────
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    // pins were range-checked against the BCM whitelist in validate()
    let layout = SwitchBoard::layout(
        cfg.system.pump_gpio_pin as u8,
        cfg.system.main_line_gpio_pin as u8,
        cfg.system.waste_valve_gpio_pin as u8,
        cfg.zone_settings().into_iter().map(|z| (z.zone_id, z.valve_gpio_pin)),
    );
    let mut board = SwitchBoard::new(&layout, active_low).context("failed to set up relay board")?;
    board.all_off();
    let board = Arc::new(Mutex::new(board));

    // ── Core ────────────────────────────────────────────────────────
    let (events_tx, events_rx) = events::channel();
    let orchestrator = Arc::new(Orchestrator::new(
        &cfg,
        Arc::clone(&board),
        events_tx,
        Some(gateway),
        recovered,
        now,
    )?);

    let shared = SystemState::shared(cfg.system.mode);
    {
        let mut st = shared.write().await;
        st.set_zones(orchestrator.zone_statuses(now).await);
        st.record_system(format!("hub started ({} zone(s), mode {})", cfg.zones.len(), cfg.system.mode));
    }
    info!(zones = cfg.zones.len(), sensors = cfg.sensors.len(), mode = %cfg.system.mode, "hub ready");

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        shared: Arc::clone(&shared),
        orchestrator: Arc::clone(&orchestrator),
        db: db.clone(),
    };
    tokio::spawn(async move {
        web::serve(web_state).await;
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("steering-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 50);

    client.subscribe(TELEMETRY_SUB, QoS::AtLeastOnce).await?;
    client.subscribe(OVERRIDE_SUB, QoS::AtLeastOnce).await?;
    client.subscribe(MODE_SET_TOPIC, QoS::AtLeastOnce).await?;
    info!("hub subscribed to {TELEMETRY_SUB}, {OVERRIDE_SUB} and {MODE_SET_TOPIC}");

    tokio::spawn(mqtt::forward_events(
        events_rx,
        client.clone(),
        Arc::clone(&shared),
        db.clone(),
        lights,
    ));
    tokio::spawn(scheduler::run(
        Arc::clone(&orchestrator),
        Arc::clone(&shared),
        client.clone(),
        Duration::from_secs(cfg.system.tick_interval_sec.max(1)),
    ));

    loop {
        let polled = tokio::select! {
            polled = eventloop.poll() => polled,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down, all switches off");
                orchestrator.all_off().await;
                return Ok(());
            }
        };

        match polled {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let topic = p.topic.clone();
                let payload = p.payload.to_vec();
                let now = Utc::now();

                if let Some(node_id) = extract_node_id(&topic) {
                    match serde_json::from_slice::<ReadingMsg>(&payload) {
                        Ok(msg) => {
                            debug!(node = node_id, ts = msg.ts, readings = msg.readings.len(), "telemetry");
                            let seen = mqtt::ingest_telemetry(&orchestrator, node_id, &msg, now).await;
                            shared.write().await.record_reading(node_id, seen);
                        }
                        Err(e) => {
                            warn!(%topic, "bad telemetry json: {e}");
                            shared.write().await.record_error(format!("bad telemetry json: {e}"));
                        }
                    }
                } else if let Some(zone_id) = extract_override_zone(&topic) {
                    let result = mqtt::parse_override(&payload).and_then(|req| {
                        let target = req.target()?;
                        Ok((req, target))
                    });
                    match result {
                        Ok((req, target)) => {
                            match orchestrator
                                .manual_override(zone_id, target, req.reason(), req.forced, now)
                                .await
                            {
                                Ok(change) => info!(zone = zone_id, to = %change.to, "override applied"),
                                Err(e) => {
                                    warn!(zone = zone_id, "override refused: {e}");
                                    shared.write().await.record_error(e.to_string());
                                }
                            }
                        }
                        Err(msg) => {
                            warn!(zone = zone_id, "{msg}");
                            shared.write().await.record_error(msg);
                        }
                    }
                } else if topic == MODE_SET_TOPIC {
                    match mqtt::parse_mode(&payload) {
                        Ok(mode) => {
                            orchestrator.set_mode(mode).await;
                            let mut st = shared.write().await;
                            st.mode = mode;
                            st.record_system(format!("mode set to {mode} via mqtt"));
                        }
                        Err(msg) => {
                            warn!("{msg}");
                            shared.write().await.record_error(msg);
                        }
                    }
                } else {
                    debug!(%topic, "unhandled topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                // Best-effort fail-safe: turn everything off on comms error
                orchestrator.all_off().await;

                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
