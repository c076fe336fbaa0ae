//! Simulated luminaire: a first-order room model driven by a small integral controller.
//! Stands in for the LED driver, light sensor and metrics store of a real desk.

use std::collections::VecDeque;
use std::time::Duration;

use luxnet_core::{
    Controller, Driver, History, LatestReading, MemoryDesk, Metrics, Sensor,
};

use crate::config::PlantConfig;

// LDR divider: 10 kOhm series resistor on a 3.3 V rail.
const VCC: f32 = 3.3;
const R_SERIES: f32 = 10_000.0;
const LDR_M: f32 = -0.9;
const LDR_B: f32 = 6.2;

pub struct SimDesk {
    state: MemoryDesk,
    plant: PlantConfig,
    /// Latest lux, written by [`SimDesk::sample`].
    reading: LatestReading,
    /// This desk's duty, read by neighbouring simulated desks.
    duty_out: LatestReading,
    neighbours: Vec<(f32, LatestReading)>,
    duty_log: VecDeque<f32>,
    lux_log: VecDeque<f32>,
    samples: u64,
    visibility_sum: f32,
    flicker_sum: f32,
    prev_duty: [f32; 2],
}

impl SimDesk {
    pub fn new(plant: PlantConfig) -> Self {
        let state = MemoryDesk {
            lux: plant.background,
            ..MemoryDesk::default()
        };
        Self {
            reading: LatestReading::new(plant.background),
            duty_out: LatestReading::new(0.0),
            neighbours: Vec::new(),
            duty_log: VecDeque::with_capacity(plant.history_len),
            lux_log: VecDeque::with_capacity(plant.history_len),
            samples: 0,
            visibility_sum: 0.0,
            flicker_sum: 0.0,
            prev_duty: [0.0; 2],
            state,
            plant,
        }
    }

    /// Cell carrying this desk's duty cycle to its neighbours.
    pub fn duty_cell(&self) -> LatestReading {
        self.duty_out.clone()
    }

    /// Light from another desk's LED: `gain` lux per unit of its duty.
    pub fn couple(&mut self, gain: f32, duty: LatestReading) {
        self.neighbours.push((gain, duty));
    }

    fn target(&self) -> f32 {
        let bound = if self.state.occupancy {
            self.state.lower_bound_occupied
        } else {
            self.state.lower_bound_unoccupied
        };
        self.state.reference.max(bound)
    }

    /// One control period: update the duty unless in manual mode, then measure.
    pub fn sample(&mut self, dt: Duration) {
        let dt = dt.as_secs_f32();
        let lux = self.reading.latest();

        if !self.state.manual {
            let target = self.target();
            let duty = if self.state.feedback {
                self.state.duty + self.plant.ki * (target - lux) * dt / self.plant.gain.max(1.0)
            } else {
                let gain = if self.state.gain > 0.0 {
                    self.state.gain
                } else {
                    self.plant.gain
                };
                (target - self.state.external) / gain
            };
            self.state.duty = if self.state.anti_windup || !self.state.feedback {
                duty.clamp(0.0, 1.0)
            } else {
                duty
            };
        }
        let applied = self.state.duty.clamp(0.0, 1.0);
        self.duty_out.publish(applied);

        let coupled: f32 = self.neighbours.iter().map(|(k, d)| k * d.latest()).sum();
        let lux = self.plant.background + self.plant.gain * applied + coupled;
        self.reading.publish(lux);
        self.state.lux = lux;
        self.state.voltage = ldr_voltage(lux);
        self.account(applied, lux, dt);
    }

    fn account(&mut self, duty: f32, lux: f32, dt: f32) {
        self.samples += 1;
        self.state.power = self.plant.max_power * duty;
        self.state.energy += self.state.power * dt;

        self.visibility_sum += (self.target() - lux).max(0.0);
        self.state.visibility_error = self.visibility_sum / self.samples as f32;

        let [d1, d2] = self.prev_duty;
        if (duty - d1) * (d1 - d2) < 0.0 {
            self.flicker_sum += (duty - d1).abs() + (d1 - d2).abs();
        }
        self.state.flicker = self.flicker_sum / self.samples as f32;
        self.prev_duty = [duty, d1];

        push_capped(&mut self.duty_log, duty, self.plant.history_len);
        push_capped(&mut self.lux_log, lux, self.plant.history_len);
    }
}

fn push_capped(log: &mut VecDeque<f32>, v: f32, cap: usize) {
    if cap == 0 {
        return;
    }
    if log.len() == cap {
        log.pop_front();
    }
    log.push_back(v);
}

/// Divider output voltage for a given illuminance.
fn ldr_voltage(lux: f32) -> f32 {
    let r_ldr = 10f32.powf(LDR_M * lux.max(0.01).log10() + LDR_B);
    VCC * R_SERIES / (R_SERIES + r_ldr)
}

impl Controller for SimDesk {
    fn reference(&self) -> f32 {
        self.state.reference
    }
    fn set_reference(&mut self, lux: f32) {
        self.state.reference = lux;
    }
    fn occupancy(&self) -> bool {
        self.state.occupancy
    }
    fn set_occupancy(&mut self, occupied: bool) {
        self.state.occupancy = occupied;
    }
    fn anti_windup(&self) -> bool {
        self.state.anti_windup
    }
    fn set_anti_windup(&mut self, on: bool) {
        self.state.anti_windup = on;
    }
    fn feedback(&self) -> bool {
        self.state.feedback
    }
    fn set_feedback(&mut self, on: bool) {
        self.state.feedback = on;
    }
    fn external(&self) -> f32 {
        self.state.external
    }
    fn lower_bound_occupied(&self) -> f32 {
        self.state.lower_bound_occupied
    }
    fn set_lower_bound_occupied(&mut self, lux: f32) {
        self.state.lower_bound_occupied = lux;
    }
    fn lower_bound_unoccupied(&self) -> f32 {
        self.state.lower_bound_unoccupied
    }
    fn set_lower_bound_unoccupied(&mut self, lux: f32) {
        self.state.lower_bound_unoccupied = lux;
    }
    fn set_gain_and_external(&mut self, gain: f32, offset: f32) {
        tracing::info!(gain, offset, "plant model updated");
        self.state.set_gain_and_external(gain, offset);
    }
}

impl Driver for SimDesk {
    fn duty_cycle(&self) -> f32 {
        self.state.duty
    }
    fn set_duty_cycle(&mut self, duty: f32) {
        self.state.duty = duty;
        self.duty_out.publish(duty.clamp(0.0, 1.0));
    }
    fn set_manual_mode(&mut self, manual: bool) {
        self.state.manual = manual;
    }
}

impl Sensor for SimDesk {
    fn lux(&self) -> f32 {
        self.reading.latest()
    }
    fn ldr_voltage(&self) -> f32 {
        self.state.voltage
    }
}

impl Metrics for SimDesk {
    fn power(&self) -> f32 {
        self.state.power
    }
    fn energy(&self) -> f32 {
        self.state.energy
    }
    fn visibility_error(&self) -> f32 {
        self.state.visibility_error
    }
    fn flicker(&self) -> f32 {
        self.state.flicker
    }
    fn history(&self, series: History) -> Vec<f32> {
        match series {
            History::Duty => self.duty_log.iter().copied().collect(),
            History::Illuminance => self.lux_log.iter().copied().collect(),
        }
    }
}
