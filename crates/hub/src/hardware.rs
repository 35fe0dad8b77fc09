//! Relay switching and the shot sequence. The `gpio` feature gates the real
//! rppal driver; without it, a mock board records switch state in memory.
//!
//! Switch ids: `pump`, `main_line`, `waste_valve`, and one valve per zone id.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{Result, SteeringError};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

pub const PUMP: &str = "pump";
pub const MAIN_LINE: &str = "main_line";
pub const WASTE_VALVE: &str = "waste_valve";

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct SwitchBoard {
    pins: HashMap<String, OutputPin>,
    states: HashMap<String, bool>,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl SwitchBoard {
    pub fn new(switches: &[(String, u8)], active_low: bool) -> anyhow::Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();
        let mut states = HashMap::new();

        for (id, pin_num) in switches {
            let mut pin = gpio.get(*pin_num)?.into_output();
            // relays start open
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            pins.insert(id.clone(), pin);
            states.insert(id.clone(), false);
        }

        info!(switches = pins.len(), active_low, "hardware: gpio relay board ready");
        Ok(Self {
            pins,
            states,
            active_low,
        })
    }

    pub fn set(&mut self, id: &str, on: bool) -> Result<()> {
        let pin = self
            .pins
            .get_mut(id)
            .ok_or_else(|| SteeringError::Hardware(format!("unknown switch '{id}'")))?;
        // active-low relay: LOW = ON
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        self.states.insert(id.to_string(), on);
        debug!(switch = %id, on, "hardware: switch set");
        Ok(())
    }

    pub fn state(&self, id: &str) -> Option<bool> {
        self.states.get(id).copied()
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development + tests, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct SwitchBoard {
    states: HashMap<String, bool>,
    /// Switches that refuse to turn on.
    failing: std::collections::HashSet<String>,
}

#[cfg(not(feature = "gpio"))]
impl SwitchBoard {
    pub fn new(switches: &[(String, u8)], _active_low: bool) -> anyhow::Result<Self> {
        let states = switches.iter().map(|(id, _)| (id.clone(), false)).collect::<HashMap<_, _>>();
        info!(switches = states.len(), "hardware: mock relay board ready (no hardware)");
        Ok(Self {
            states,
            failing: Default::default(),
        })
    }

    pub fn set(&mut self, id: &str, on: bool) -> Result<()> {
        let Some(state) = self.states.get_mut(id) else {
            return Err(SteeringError::Hardware(format!("unknown switch '{id}'")));
        };
        if on && self.failing.contains(id) {
            return Err(SteeringError::Hardware(format!("switch '{id}' did not respond")));
        }
        *state = on;
        debug!(switch = %id, on, "hardware: mock switch set");
        Ok(())
    }

    pub fn state(&self, id: &str) -> Option<bool> {
        self.states.get(id).copied()
    }

    #[cfg(test)]
    pub fn fail_switch(&mut self, id: &str) {
        self.failing.insert(id.to_string());
    }
}

impl SwitchBoard {
    /// Switch ids for the system relays plus every zone valve.
    pub fn layout(
        pump_pin: u8,
        main_line_pin: u8,
        waste_valve_pin: u8,
        zone_pins: impl IntoIterator<Item = (String, u8)>,
    ) -> Vec<(String, u8)> {
        let mut switches = vec![
            (PUMP.to_string(), pump_pin),
            (MAIN_LINE.to_string(), main_line_pin),
            (WASTE_VALVE.to_string(), waste_valve_pin),
        ];
        switches.extend(zone_pins);
        switches
    }

    /// Emergency stop: every switch off. Never fails, safe to repeat.
    pub fn all_off(&mut self) {
        let ids: Vec<String> = self.switch_ids();
        for id in ids {
            if let Err(e) = self.set(&id, false) {
                error!(switch = %id, "hardware: failed to switch off: {e}");
            }
        }
    }

    pub fn any_on(&self) -> bool {
        self.switch_ids().iter().any(|id| self.state(id) == Some(true))
    }

    fn switch_ids(&self) -> Vec<String> {
        #[cfg(feature = "gpio")]
        let ids = self.pins.keys().cloned().collect();
        #[cfg(not(feature = "gpio"))]
        let ids = self.states.keys().cloned().collect();
        ids
    }
}

// ---------------------------------------------------------------------------
// Shot sequence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SequenceStep {
    Switch { id: String, on: bool },
    Wait(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct SequenceTiming {
    pub pump_settle: Duration,
    pub main_line_settle: Duration,
}

/// Waste off, pump on, settle, main line on, settle, zone valves on, hold,
/// then tear down in reverse.
pub fn irrigation_sequence(zones: &[String], hold: Duration, timing: SequenceTiming) -> Vec<SequenceStep> {
    let switch = |id: &str, on: bool| SequenceStep::Switch { id: id.to_string(), on };
    let mut steps = vec![
        switch(WASTE_VALVE, false),
        switch(PUMP, true),
        SequenceStep::Wait(timing.pump_settle),
        switch(MAIN_LINE, true),
        SequenceStep::Wait(timing.main_line_settle),
    ];
    steps.extend(zones.iter().map(|z| switch(z, true)));
    steps.push(SequenceStep::Wait(hold));
    steps.extend(zones.iter().map(|z| switch(z, false)));
    steps.push(switch(MAIN_LINE, false));
    steps.push(switch(PUMP, false));
    steps
}

/// Run every step to completion. Any failing step triggers an
/// unconditional all-off before the error is returned.
pub async fn run_sequence(board: &Mutex<SwitchBoard>, steps: &[SequenceStep]) -> Result<()> {
    for step in steps {
        match step {
            SequenceStep::Switch { id, on } => {
                let mut b = board.lock().await;
                if let Err(e) = b.set(id, *on) {
                    error!(switch = %id, on, "hardware: sequence step failed, emergency stop: {e}");
                    b.all_off();
                    return Err(e);
                }
            }
            SequenceStep::Wait(d) => {
                if !d.is_zero() {
                    tokio::time::sleep(*d).await;
                }
            }
        }
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
