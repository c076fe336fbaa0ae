//! The local control loop as seen by the coordination layer: fixed getter/setter
//! interfaces for the controller, LED driver, light sensor and metrics store.

use std::time::Duration;

use crate::protocol::{ErrorCode, Field, Value, DUTY_RELEASE};

pub trait Controller {
    fn reference(&self) -> f32;
    fn set_reference(&mut self, lux: f32);
    fn occupancy(&self) -> bool;
    fn set_occupancy(&mut self, occupied: bool);
    fn anti_windup(&self) -> bool;
    fn set_anti_windup(&mut self, on: bool);
    fn feedback(&self) -> bool;
    fn set_feedback(&mut self, on: bool);
    /// Estimated external (non-luminaire) illuminance.
    fn external(&self) -> f32;
    fn lower_bound_occupied(&self) -> f32;
    fn set_lower_bound_occupied(&mut self, lux: f32);
    fn lower_bound_unoccupied(&self) -> f32;
    fn set_lower_bound_unoccupied(&mut self, lux: f32);
    /// Static plant model from calibration: own gain and background offset.
    fn set_gain_and_external(&mut self, gain: f32, offset: f32);
}

pub trait Driver {
    fn duty_cycle(&self) -> f32;
    fn set_duty_cycle(&mut self, duty: f32);
    /// In manual mode the controller output no longer drives the LED.
    fn set_manual_mode(&mut self, manual: bool);
}

pub trait Sensor {
    fn lux(&self) -> f32;
    fn ldr_voltage(&self) -> f32;
}

/// Buffered series kept by the metrics store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum History {
    Duty,
    Illuminance,
}

impl History {
    pub fn code(self) -> &'static str {
        match self {
            History::Duty => "u",
            History::Illuminance => "y",
        }
    }

    pub fn from_code(code: &str) -> Option<History> {
        match code {
            "u" => Some(History::Duty),
            "y" => Some(History::Illuminance),
            _ => None,
        }
    }
}

pub trait Metrics {
    fn power(&self) -> f32;
    fn energy(&self) -> f32;
    fn visibility_error(&self) -> f32;
    fn flicker(&self) -> f32;
    /// Oldest sample first.
    fn history(&self, series: History) -> Vec<f32>;
}

/// Everything one desk exposes to the coordination layer.
pub trait Luminaire: Controller + Driver + Sensor + Metrics {}

impl<T: Controller + Driver + Sensor + Metrics> Luminaire for T {}

/// Read a field. `uptime` answers [`Field::Time`].
pub fn read_field<L: Luminaire + ?Sized>(desk: &L, field: Field, uptime: Duration) -> Value {
    match field {
        Field::Duty => Value::Float(desk.duty_cycle()),
        Field::Reference => Value::Float(desk.reference()),
        Field::Illuminance => Value::Float(desk.lux()),
        Field::Voltage => Value::Float(desk.ldr_voltage()),
        Field::Occupancy => Value::Flag(desk.occupancy()),
        Field::AntiWindup => Value::Flag(desk.anti_windup()),
        Field::Feedback => Value::Flag(desk.feedback()),
        Field::External => Value::Float(desk.external()),
        Field::Power => Value::Float(desk.power()),
        Field::Time => Value::Float(uptime.as_secs_f32()),
        Field::Energy => Value::Float(desk.energy()),
        Field::VisibilityError => Value::Float(desk.visibility_error()),
        Field::Flicker => Value::Float(desk.flicker()),
        Field::LowerBoundOccupied => Value::Float(desk.lower_bound_occupied()),
        Field::LowerBoundUnoccupied => Value::Float(desk.lower_bound_unoccupied()),
        Field::CurrentLowerBound => Value::Float(if desk.occupancy() {
            desk.lower_bound_occupied()
        } else {
            desk.lower_bound_unoccupied()
        }),
    }
}

/// Validate and apply a write. On success returns an optional note for the ack line.
pub fn write_field<L: Luminaire + ?Sized>(
    desk: &mut L,
    field: Field,
    value: Value,
) -> Result<Option<&'static str>, ErrorCode> {
    field.validate(value)?;
    match (field, value) {
        (Field::Duty, Value::Float(v)) if v == DUTY_RELEASE => {
            desk.set_manual_mode(false);
            return Ok(Some("manual mode disabled"));
        }
        (Field::Duty, Value::Float(v)) => {
            desk.set_manual_mode(false);
            desk.set_duty_cycle(v);
            desk.set_manual_mode(true);
        }
        (Field::Reference, Value::Float(v)) => desk.set_reference(v),
        (Field::LowerBoundOccupied, Value::Float(v)) => desk.set_lower_bound_occupied(v),
        (Field::LowerBoundUnoccupied, Value::Float(v)) => desk.set_lower_bound_unoccupied(v),
        (Field::Occupancy, Value::Flag(b)) => desk.set_occupancy(b),
        (Field::AntiWindup, Value::Flag(b)) => desk.set_anti_windup(b),
        (Field::Feedback, Value::Flag(b)) => desk.set_feedback(b),
        _ => return Err(ErrorCode::ReadOnly),
    }
    Ok(None)
}

/// Plain in-memory desk: every getter returns a stored field. Used by tests and as the
/// state holder of simulated luminaires.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryDesk {
    pub duty: f32,
    pub manual: bool,
    pub reference: f32,
    pub occupancy: bool,
    pub anti_windup: bool,
    pub feedback: bool,
    pub external: f32,
    pub lower_bound_occupied: f32,
    pub lower_bound_unoccupied: f32,
    pub gain: f32,
    pub lux: f32,
    pub voltage: f32,
    pub power: f32,
    pub energy: f32,
    pub visibility_error: f32,
    pub flicker: f32,
    pub duty_history: Vec<f32>,
    pub lux_history: Vec<f32>,
}

impl Default for MemoryDesk {
    fn default() -> Self {
        Self {
            duty: 0.0,
            manual: false,
            reference: 0.0,
            occupancy: true,
            anti_windup: true,
            feedback: true,
            external: 0.0,
            lower_bound_occupied: 5.0,
            lower_bound_unoccupied: 1.0,
            gain: 0.0,
            lux: 0.0,
            voltage: 0.0,
            power: 0.0,
            energy: 0.0,
            visibility_error: 0.0,
            flicker: 0.0,
            duty_history: Vec::new(),
            lux_history: Vec::new(),
        }
    }
}

impl Controller for MemoryDesk {
    fn reference(&self) -> f32 {
        self.reference
    }
    fn set_reference(&mut self, lux: f32) {
        self.reference = lux;
    }
    fn occupancy(&self) -> bool {
        self.occupancy
    }
    fn set_occupancy(&mut self, occupied: bool) {
        self.occupancy = occupied;
    }
    fn anti_windup(&self) -> bool {
        self.anti_windup
    }
    fn set_anti_windup(&mut self, on: bool) {
        self.anti_windup = on;
    }
    fn feedback(&self) -> bool {
        self.feedback
    }
    fn set_feedback(&mut self, on: bool) {
        self.feedback = on;
    }
    fn external(&self) -> f32 {
        self.external
    }
    fn lower_bound_occupied(&self) -> f32 {
        self.lower_bound_occupied
    }
    fn set_lower_bound_occupied(&mut self, lux: f32) {
        self.lower_bound_occupied = lux;
    }
    fn lower_bound_unoccupied(&self) -> f32 {
        self.lower_bound_unoccupied
    }
    fn set_lower_bound_unoccupied(&mut self, lux: f32) {
        self.lower_bound_unoccupied = lux;
    }
    fn set_gain_and_external(&mut self, gain: f32, offset: f32) {
        self.gain = gain;
        self.external = offset;
    }
}

impl Driver for MemoryDesk {
    fn duty_cycle(&self) -> f32 {
        self.duty
    }
    fn set_duty_cycle(&mut self, duty: f32) {
        self.duty = duty;
    }
    fn set_manual_mode(&mut self, manual: bool) {
        self.manual = manual;
    }
}

impl Sensor for MemoryDesk {
    fn lux(&self) -> f32 {
        self.lux
    }
    fn ldr_voltage(&self) -> f32 {
        self.voltage
    }
}

impl Metrics for MemoryDesk {
    fn power(&self) -> f32 {
        self.power
    }
    fn energy(&self) -> f32 {
        self.energy
    }
    fn visibility_error(&self) -> f32 {
        self.visibility_error
    }
    fn flicker(&self) -> f32 {
        self.flicker
    }
    fn history(&self, series: History) -> Vec<f32> {
        match series {
            History::Duty => self.duty_history.clone(),
            History::Illuminance => self.lux_history.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duty_set_enters_manual_mode() {
        let mut desk = MemoryDesk::default();
        let note = write_field(&mut desk, Field::Duty, Value::Float(0.4)).unwrap();
        assert_eq!(note, None);
        assert_eq!(desk.duty, 0.4);
        assert!(desk.manual);
    }

    #[test]
    fn duty_release_leaves_manual_mode() {
        let mut desk = MemoryDesk {
            manual: true,
            duty: 0.3,
            ..Default::default()
        };
        let note = write_field(&mut desk, Field::Duty, Value::Float(DUTY_RELEASE)).unwrap();
        assert_eq!(note, Some("manual mode disabled"));
        assert!(!desk.manual);
        assert_eq!(desk.duty, 0.3);
    }

    #[test]
    fn out_of_range_write_leaves_desk_untouched() {
        let mut desk = MemoryDesk::default();
        let before = desk.clone();
        assert_eq!(
            write_field(&mut desk, Field::LowerBoundOccupied, Value::Float(-2.0)),
            Err(ErrorCode::OutOfRange)
        );
        assert_eq!(desk, before);
    }

    #[test]
    fn current_lower_bound_follows_occupancy() {
        let mut desk = MemoryDesk::default();
        let up = Duration::ZERO;
        assert_eq!(
            read_field(&desk, Field::CurrentLowerBound, up),
            Value::Float(5.0)
        );
        desk.occupancy = false;
        assert_eq!(
            read_field(&desk, Field::CurrentLowerBound, up),
            Value::Float(1.0)
        );
    }

    #[test]
    fn time_reads_uptime() {
        let desk = MemoryDesk::default();
        assert_eq!(
            read_field(&desk, Field::Time, Duration::from_millis(2500)),
            Value::Float(2.5)
        );
    }
}
