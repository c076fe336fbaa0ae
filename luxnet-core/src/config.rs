//! Protocol timing and calibration parameters. Deserializable so the daemon can read a
//! `[timing]` table; every field has a default.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen period after the first boot broadcast (default 15 s).
    #[serde(default = "default_boot_timeout_ms")]
    pub boot_timeout_ms: u64,
    /// Interval between boot broadcasts (default 5 s).
    #[serde(default = "default_boot_send_interval_ms")]
    pub boot_send_interval_ms: u64,
    /// Settling time before a calibration light measurement (default 2 s).
    #[serde(default = "default_measurement_time_ms")]
    pub measurement_time_ms: u64,
    /// Resend period for unacknowledged calibration broadcasts (default 500 ms).
    #[serde(default = "default_resend_interval_ms")]
    pub resend_interval_ms: u64,
    /// Give up on calibration after this long and keep default gains (default 120 s).
    #[serde(default = "default_calibration_timeout_ms")]
    pub calibration_timeout_ms: u64,
    /// Remote command reply deadline (default 100 ms).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Duty cycle for the low calibration step.
    #[serde(default = "default_low_duty")]
    pub low_duty: f32,
    /// Duty cycle for the high calibration step.
    #[serde(default = "default_high_duty")]
    pub high_duty: f32,
    /// Skip calibration entirely after boot.
    #[serde(default = "default_calibrate")]
    pub calibrate: bool,
}

fn default_boot_timeout_ms() -> u64 {
    15_000
}
fn default_boot_send_interval_ms() -> u64 {
    5_000
}
fn default_measurement_time_ms() -> u64 {
    2_000
}
fn default_resend_interval_ms() -> u64 {
    500
}
fn default_calibration_timeout_ms() -> u64 {
    120_000
}
fn default_request_timeout_ms() -> u64 {
    100
}
fn default_low_duty() -> f32 {
    0.2
}
fn default_high_duty() -> f32 {
    0.8
}
fn default_calibrate() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            boot_timeout_ms: default_boot_timeout_ms(),
            boot_send_interval_ms: default_boot_send_interval_ms(),
            measurement_time_ms: default_measurement_time_ms(),
            resend_interval_ms: default_resend_interval_ms(),
            calibration_timeout_ms: default_calibration_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            low_duty: default_low_duty(),
            high_duty: default_high_duty(),
            calibrate: default_calibrate(),
        }
    }
}

impl Config {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }

    pub fn boot_send_interval(&self) -> Duration {
        Duration::from_millis(self.boot_send_interval_ms)
    }

    pub fn measurement_time(&self) -> Duration {
        Duration::from_millis(self.measurement_time_ms)
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    pub fn calibration_timeout(&self) -> Duration {
        Duration::from_millis(self.calibration_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
